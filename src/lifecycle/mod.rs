//! The Lifecycle Manager: the six sandbox operations, the per-id lock,
//! and the readiness poll they share.

mod lock;
mod manager;
mod readiness;

pub use lock::KeyedLocker;
pub use manager::{AccessGrant, ExecResult, LifecycleManager};
