#![forbid(unsafe_code)]
//! Recovery session registry public API facade.
//!
//! Re-exports the workspace crates through one stable interface. This is the
//! crate node code depends on.

pub use rsr_cancel::{
    CancellableIo, CancellableOperation, DEFAULT_MAX_CHUNK, InterruptRegistration,
    unwrap_io_error,
};
pub use rsr_error::{ErrorClass, RecoveryError, Result};
pub use rsr_recovery::*;
pub use rsr_store::{Closeable, FsStore, RefCountedResource, ResourceGuard, Store};
pub use rsr_types::{NodeId, RecoveryId, SessionState, ShardId, TempGeneration};
