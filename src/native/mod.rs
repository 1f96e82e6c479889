/// Native module contains a host-process implementation of the sandbox
/// contract, built on `tokio::process` and plain syscalls.
pub mod sandbox;

pub use sandbox::LocalSandbox;
