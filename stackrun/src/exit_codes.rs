//! Stable exit codes for stackrun CLI commands.

/// Command succeeded and every selected stack finished ok.
pub const OK: i32 = 0;
/// A stack failed or was canceled, or the invocation hit a fatal error
/// (cycle, bad configuration, git failure, unknown stack, missing command).
pub const FAILED: i32 = 1;
