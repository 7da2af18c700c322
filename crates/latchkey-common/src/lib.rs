//! Latchkey Common - Shared types for distributed locking
//!
//! This crate provides the foundational types used across all Latchkey components:
//! - Error taxonomy (`LockError`, `ReleaseOutcome`)
//! - Cancellable call contexts
//! - Per-acquisition lock options and renewal events
//! - Configuration loading

pub mod config;
pub mod context;
pub mod error;
pub mod options;

// Re-exports for convenience
pub use config::{BackendSettings, ElectionSettings, LatchkeyConfig, LockSettings};
pub use context::CallContext;
pub use error::{LockError, ReleaseOutcome, Result};
pub use options::{LockOptions, RenewalCallback, RenewalEvent};
