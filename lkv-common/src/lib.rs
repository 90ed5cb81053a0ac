// lkv-common - Shared types for the LKV client driver
//
// This crate defines the error taxonomy, command argument values and node configuration

pub mod config;
pub mod error;
pub mod types;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use types::*;
