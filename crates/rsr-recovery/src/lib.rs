#![forbid(unsafe_code)]
//! Bookkeeping for in-flight shard recoveries.
//!
//! A [`RecoveryRegistry`] owns every running [`RecoverySession`] of a node.
//! Transport handlers, shard lifecycle hooks, administrative cancellation and
//! the [`IdleTimeoutSweeper`] all reach a session by id through scoped
//! [`RecoveryGuard`]s, and a session is torn down exactly once, after its
//! removal was requested and its last guard is gone.
//!
//! ```
//! use rsr_recovery::{RecoveryOutcome, RecoveryRegistry, RecoveryRequest, RegistryConfig};
//! use rsr_store::{Closeable, RefCountedResource, Store};
//! use rsr_types::{NodeId, ShardId};
//!
//! struct NoopStore;
//! impl Closeable for NoopStore {
//!     fn close(&self) -> rsr_error::Result<()> { Ok(()) }
//! }
//! impl Store for NoopStore {
//!     fn delete_files(&self, _: &[String]) -> rsr_error::Result<()> { Ok(()) }
//! }
//!
//! let registry = RecoveryRegistry::new(RegistryConfig::default()).unwrap();
//! let store = RefCountedResource::new("[logs][0]", NoopStore);
//! let id = registry
//!     .register_default(RecoveryRequest::new(
//!         ShardId::new("logs", 0),
//!         NodeId::new("node-1"),
//!         NodeId::new("node-2"),
//!         store.acquire().unwrap(),
//!         |_: RecoveryOutcome| {},
//!     ))
//!     .unwrap();
//!
//! let guard = registry.acquire(id).unwrap();
//! assert_eq!(guard.temp_name("_0.cfs"), format!("recovery.{id}.0._0.cfs"));
//! drop(guard);
//!
//! assert!(registry.mark_done(id));
//! assert!(registry.acquire(id).is_none());
//! ```

mod clock;
mod config;
mod lifecycle;
mod listener;
mod registry;
mod session;
mod stats;
mod sweeper;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{DEFAULT_TEMP_FILE_PREFIX, RegistryConfig};
pub use lifecycle::ShardLifecycle;
pub use listener::{RecoveryListener, RecoveryOutcome};
pub use registry::{
    RecoveryGuard, RecoveryRegistry, RecoveryRequest, SessionSnapshot, TIMEOUT_REASON,
};
pub use session::{RESET_REASON, RecoverySession, StoreRef};
pub use stats::{RegistryStats, StatsSnapshot};
pub use sweeper::{IdleTimeoutSweeper, SweepReport, SweeperHandle};
