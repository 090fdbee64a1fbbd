//! Stable exit codes for scripting against the CLI.

/// Command completed and printed its payload.
pub const SUCCESS: i32 = 0;

/// The request itself was bad: invalid filter, stale cursor.
pub const QUERY_ERROR: i32 = 1;

/// The input or its cache is unusable: missing report, unsupported format,
/// stale or corrupt cache.
pub const INPUT_ERROR: i32 = 2;

/// The parse was cancelled before completion.
pub const CANCELLED: i32 = 130;
