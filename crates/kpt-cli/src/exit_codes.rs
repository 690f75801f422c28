//! Process exit codes

/// Success - operation completed without errors
pub const SUCCESS: i32 = 0;

/// General error - any failure without a more specific code
pub const ERROR: i32 = 1;

/// Cancelled - interrupted before completion
pub const CANCELLED: i32 = 2;

/// Validation error - a validator function rejected the package
pub const VALIDATION_ERROR: i32 = 3;
