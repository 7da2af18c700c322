//! Latchkey Core - Distributed mutual exclusion
//!
//! This crate provides:
//! - Local arbitration of callers contending for one lock name
//! - Advisory-lock and TTL key-value backend adapters
//! - Lease renewal for TTL-backed locks
//! - A registry mapping lock names to sticky backend connections
//! - Leader election built on the same locks
//! - In-memory backends for tests and single-process use

pub mod advisory;
pub mod backend;
pub mod election;
pub mod memory;
pub mod metrics;
pub mod mutex;
pub mod registry;
pub mod renewal;
pub mod ttl;

// Re-export commonly used types
pub use advisory::{AdvisoryClient, AdvisoryLockBackend};
pub use backend::{BackendKind, LockBackend};
pub use election::{ElectionState, LeaderElectionConfig, LeaderElector, StopReason, run_as_leader};
pub use memory::{MemoryAdvisoryServer, MemoryAdvisorySession, MemoryKvClient, MemoryKvStore};
pub use mutex::DistributedMutex;
pub use registry::LockRegistry;
pub use renewal::{RenewalHandle, RenewalState};
pub use ttl::{ScriptClient, TtlLockBackend};

pub use latchkey_common::{CallContext, LockError, LockOptions, ReleaseOutcome, RenewalEvent, Result};
