//! One recovery attempt and its per-attempt state.
//!
//! A [`RecoverySession`] is reachable only through a
//! [`RecoveryGuard`](crate::RecoveryGuard) handed out by the registry. Its
//! `state` and last-access time are atomics so the sweeper and diagnostics
//! can read them without a guard.
//!
//! # Logging
//!
//! - **TRACE** `rsr::session`: `temp_name_issued`
//! - **DEBUG** `rsr::session`: `session_done`, `session_failed`, `session_cancelled`,
//!   `session_retired`, `session_torn_down`
//! - **WARN**  `rsr::session`: `temp_file_cleanup_failed`

use crate::clock::{Clock, duration_to_nanos};
use crate::listener::{RecoveryListener, RecoveryOutcome};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use rsr_cancel::CancellableOperation;
use rsr_error::{RecoveryError, Result};
use rsr_store::{ResourceGuard, Store};
use rsr_types::{NodeId, RecoveryId, SessionState, ShardId, TempGeneration};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Cancellation reason recorded on a session retired by `reset`.
pub const RESET_REASON: &str = "recovery reset";

/// Borrowed view of a session's store, valid while the session holds it.
pub type StoreRef<'a, S> = MappedRwLockReadGuard<'a, S>;

/// Everything a session is built from apart from its id and generation.
pub(crate) struct SessionParts<S: Store> {
    pub shard_id: ShardId,
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub store: ResourceGuard<S>,
    pub listener: Arc<dyn RecoveryListener>,
    pub timeout: Duration,
    pub temp_prefix: Arc<str>,
    pub clock: Arc<dyn Clock>,
}

/// Mutable state of one recovery attempt.
pub struct RecoverySession<S: Store> {
    id: RecoveryId,
    shard_id: ShardId,
    source_node: NodeId,
    target_node: NodeId,
    generation: TempGeneration,
    timeout: Duration,
    /// `None` once torn down.
    store: RwLock<Option<ResourceGuard<S>>>,
    cancellable: CancellableOperation,
    listener: Arc<dyn RecoveryListener>,
    temp_prefix: Arc<str>,
    temp_files: Mutex<BTreeSet<String>>,
    state: AtomicU8,
    /// Set when `reset` replaced this session with a successor.
    retired: AtomicBool,
    notified: AtomicBool,
    last_access_nanos: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl<S: Store> RecoverySession<S> {
    pub(crate) fn new(id: RecoveryId, generation: TempGeneration, parts: SessionParts<S>) -> Self {
        let now = duration_to_nanos(parts.clock.now());
        Self {
            id,
            shard_id: parts.shard_id,
            source_node: parts.source_node,
            target_node: parts.target_node,
            generation,
            timeout: parts.timeout,
            store: RwLock::new(Some(parts.store)),
            cancellable: CancellableOperation::new(),
            listener: parts.listener,
            temp_prefix: parts.temp_prefix,
            temp_files: Mutex::new(BTreeSet::new()),
            state: AtomicU8::new(SessionState::Running.as_u8()),
            retired: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            last_access_nanos: AtomicU64::new(now),
            clock: parts.clock,
        }
    }

    /// Build the session that replaces this one after a reset.
    ///
    /// Shares the store through a second guard, gets a fresh cancellation
    /// token and the next temp generation.
    pub(crate) fn successor(&self, id: RecoveryId) -> Result<Self> {
        let store = {
            let slot = self.store.read();
            match slot.as_ref() {
                Some(guard) => guard.try_clone()?,
                None => return Err(self.store_closed()),
            }
        };
        Ok(Self::new(
            id,
            self.generation.next(),
            SessionParts {
                shard_id: self.shard_id.clone(),
                source_node: self.source_node.clone(),
                target_node: self.target_node.clone(),
                store,
                listener: Arc::clone(&self.listener),
                timeout: self.timeout,
                temp_prefix: Arc::clone(&self.temp_prefix),
                clock: Arc::clone(&self.clock),
            },
        ))
    }

    #[must_use]
    pub fn id(&self) -> RecoveryId {
        self.id
    }

    #[must_use]
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    #[must_use]
    pub fn source_node(&self) -> &NodeId {
        &self.source_node
    }

    #[must_use]
    pub fn target_node(&self) -> &NodeId {
        &self.target_node
    }

    #[must_use]
    pub fn generation(&self) -> TempGeneration {
        self.generation
    }

    /// Idle period after which the sweeper cancels this session.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(SessionState::Failed)
    }

    /// True if `reset` replaced this session.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Token that interrupts this attempt's blocking I/O.
    #[must_use]
    pub fn cancellable(&self) -> &CancellableOperation {
        &self.cancellable
    }

    /// Shorthand for `cancellable().check_cancelled()`.
    pub fn check_cancelled(&self) -> Result<()> {
        self.cancellable.check_cancelled()
    }

    /// The shard store. Fails with `ResourceClosed` after teardown.
    pub fn store(&self) -> Result<StoreRef<'_, S>> {
        RwLockReadGuard::try_map(self.store.read(), |slot| slot.as_deref())
            .map_err(|_| self.store_closed())
    }

    /// Reference count of the underlying store, `None` after teardown.
    #[must_use]
    pub fn store_ref_count(&self) -> Option<u64> {
        self.store.read().as_ref().map(ResourceGuard::ref_count)
    }

    /// Record activity now. Never moves the last-access time backwards.
    pub fn touch(&self) {
        let now = duration_to_nanos(self.clock.now());
        self.last_access_nanos.fetch_max(now, Ordering::AcqRel);
    }

    /// Clock reading of the most recent activity.
    #[must_use]
    pub fn last_access(&self) -> Duration {
        Duration::from_nanos(self.last_access_nanos.load(Ordering::Acquire))
    }

    /// Time since the last activity as of `now`.
    #[must_use]
    pub fn idle_for(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last_access())
    }

    pub(crate) fn is_idle(&self, now: Duration) -> bool {
        self.idle_for(now) > self.timeout
    }

    /// Temp file name for `logical` in this attempt.
    ///
    /// Pure function of the session id, generation and logical name.
    #[must_use]
    pub fn temp_name(&self, logical: &str) -> String {
        format!(
            "{}{}.{}.{}",
            self.temp_prefix, self.id, self.generation.0, logical
        )
    }

    /// Like [`temp_name`](Self::temp_name), and remember the name so a failed
    /// attempt deletes the file on teardown.
    pub fn next_temp_name(&self, logical: &str) -> String {
        let name = self.temp_name(logical);
        self.temp_files.lock().insert(name.clone());
        trace!(target: "rsr::session", id = %self.id, name = %name, "temp_name_issued");
        name
    }

    /// Stop tracking `name`, typically after it was renamed into place.
    pub fn take_temp_file(&self, name: &str) -> bool {
        self.temp_files.lock().remove(name)
    }

    /// Names still tracked for cleanup, sorted.
    #[must_use]
    pub fn temp_files(&self) -> Vec<String> {
        self.temp_files.lock().iter().cloned().collect()
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Deliver `outcome` to the listener. Only the first delivery goes through.
    pub(crate) fn notify(&self, outcome: RecoveryOutcome) {
        if self.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listener.on_completion(outcome);
    }

    /// `Running -> Done`. Returns the outcome for the listener.
    pub(crate) fn mark_done(&self) -> Option<RecoveryOutcome> {
        if !self.transition(SessionState::Running, SessionState::Done) {
            return None;
        }
        debug!(target: "rsr::session", id = %self.id, shard = %self.shard_id, "session_done");
        Some(RecoveryOutcome::Done {
            id: self.id,
            shard_id: self.shard_id.clone(),
        })
    }

    /// `Running -> Failed` and interrupt in-flight I/O.
    pub(crate) fn mark_failed(
        &self,
        error: RecoveryError,
        send_shard_failure: bool,
    ) -> Option<RecoveryOutcome> {
        if !self.transition(SessionState::Running, SessionState::Failed) {
            return None;
        }
        debug!(
            target: "rsr::session",
            id = %self.id,
            shard = %self.shard_id,
            error = %error,
            send_shard_failure,
            "session_failed"
        );
        self.cancellable.cancel(format!("recovery failed: {error}"));
        Some(RecoveryOutcome::Failed {
            id: self.id,
            shard_id: self.shard_id.clone(),
            error,
            send_shard_failure,
        })
    }

    /// `Running -> Cancelling` and interrupt in-flight I/O. The outcome is a
    /// `Cancelled` failure carrying `reason`.
    pub(crate) fn cancel(&self, reason: &str, send_shard_failure: bool) -> Option<RecoveryOutcome> {
        if !self.transition(SessionState::Running, SessionState::Cancelling) {
            return None;
        }
        debug!(
            target: "rsr::session",
            id = %self.id,
            shard = %self.shard_id,
            reason,
            "session_cancelled"
        );
        self.cancellable.cancel(reason);
        Some(RecoveryOutcome::Failed {
            id: self.id,
            shard_id: self.shard_id.clone(),
            error: RecoveryError::cancelled(reason),
            send_shard_failure,
        })
    }

    /// `Running -> Cancelling` without notifying the listener; the successor
    /// carries the outcome. The caller cancels the token once it has left
    /// the registry lock.
    pub(crate) fn retire(&self) -> bool {
        if !self.transition(SessionState::Running, SessionState::Cancelling) {
            return false;
        }
        self.retired.store(true, Ordering::Release);
        debug!(target: "rsr::session", id = %self.id, shard = %self.shard_id, "session_retired");
        true
    }

    /// Final cleanup once no guard can reach the session.
    ///
    /// Deletes tracked temp files unless the attempt succeeded, releases the
    /// store guard and settles a cancelled session as `Failed`. A retired
    /// session stays `Cancelling`.
    pub(crate) fn teardown(&self) {
        let Some(store) = self.store.write().take() else {
            return;
        };
        if self.state() != SessionState::Done {
            let names: Vec<String> = std::mem::take(&mut *self.temp_files.lock())
                .into_iter()
                .collect();
            if !names.is_empty() {
                if let Err(err) = store.delete_files(&names) {
                    warn!(
                        target: "rsr::session",
                        id = %self.id,
                        files = names.len(),
                        error = %err,
                        "temp_file_cleanup_failed"
                    );
                }
            }
        }
        drop(store);
        if !self.is_retired() {
            self.transition(SessionState::Cancelling, SessionState::Failed);
        }
        debug!(
            target: "rsr::session",
            id = %self.id,
            shard = %self.shard_id,
            state = %self.state(),
            "session_torn_down"
        );
    }

    fn store_closed(&self) -> RecoveryError {
        RecoveryError::resource_closed(format!("store of recovery {}", self.id))
    }
}

impl<S: Store> std::fmt::Debug for RecoverySession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoverySession")
            .field("id", &self.id)
            .field("shard_id", &self.shard_id)
            .field("source_node", &self.source_node)
            .field("target_node", &self.target_node)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("retired", &self.is_retired())
            .field("last_access", &self.last_access())
            .finish_non_exhaustive()
    }
}
