pub const MANIFEST_FILE: &str = "manifest.json";
pub const PIPELINE_FILE: &str = "pipeline.json";

pub const DEFAULT_TIME_LIMIT_MS: u64 = 1000;
pub const DEFAULT_MEMORY_LIMIT_KB: u64 = 262_144;
pub const MIN_TIME_LIMIT_MS: u64 = 100;
pub const MIN_MEMORY_LIMIT_KB: u64 = 1024;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_CASE_CONCURRENCY: usize = 4;
pub const DEFAULT_COMPILE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_COMPILE_MEMORY_KB: u64 = 524_288;
pub const DEFAULT_STDERR_CAP_BYTES: usize = 64 * 1024;
pub const DISPLAY_TRUNCATE_BYTES: usize = 10_000;
pub const LINT_TIMEOUT_MS: u64 = 60_000;

pub const MAX_SOURCE_BYTES: usize = 1024 * 1024;
pub const MAX_FUNCTION_SOURCE_BYTES: usize = 512 * 1024;

pub const DEFAULT_MAX_EXCHANGES: u32 = 1000;
pub const DEFAULT_INTERACTION_TIMEOUT_MS: u64 = 10_000;
pub const INTERACTION_GRACE_MS: u64 = 500;
pub const DEFAULT_CHECKER_TIMEOUT_MS: u64 = 10_000;
pub const CHECKER_MEMORY_KB: u64 = 524_288;

pub const STUDENT_CODE_MARKER: &str = "STUDENT_CODE_HERE";
pub const STUDENT_REGION_BEGIN: &str = "STUDENT CODE BEGIN";
pub const STUDENT_REGION_END: &str = "STUDENT CODE END";
pub const DEFAULT_MAKE_TARGET: &str = "main";

pub const WALL_TIME_SLACK_MS: u64 = 1000;
pub const MAX_WALL_TIME_MS: u64 = 600_000;
pub const MEMORY_SAMPLE_INTERVAL_MS: u64 = 10;
pub const UNCAPPED_OUTPUT_BYTES: u64 = 64 * 1024 * 1024;
pub const OUTPUT_DRAIN_GRACE_MS: u64 = 1000;
