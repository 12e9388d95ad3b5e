//! State management module.
//!
//! This module provides the durable record of what was last applied for
//! every logical resource: provider ids, declared and resolved inputs,
//! outputs, and the dependency list used to order deletes.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LockInfo, generate_holder_id, LOCK_EXPIRY_SECS};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{ResourceState, StateEntry, StateSnapshot, STATE_VERSION};
