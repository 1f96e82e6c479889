pub mod domain;
pub mod errors;
pub mod manifest;
pub mod pipeline;
pub mod traits;
