//! Process exit codes. Part of the CLI contract; scripts branch on them.

pub const OK: i32 = 0;
/// The run finished but not every test case passed, or the run did not complete.
pub const TEST_FAILED: i32 = 1;
/// Configuration could not be loaded, validated or resolved.
pub const CONFIG_ERROR: i32 = 2;
/// The requested run does not exist for this organization.
pub const NOT_FOUND: i32 = 3;
/// Storage or runtime failure unrelated to the configuration.
pub const INTERNAL_ERROR: i32 = 4;
