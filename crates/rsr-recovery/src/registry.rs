//! The registry of in-flight recovery sessions.
//!
//! Holders reach a session only through a [`RecoveryGuard`] returned by
//! [`RecoveryRegistry::acquire`]. An entry leaves the registry when removal
//! was requested (cancel, completion, failure, timeout or reset) *and* its
//! last guard is gone, whichever happens last.
//!
//! # Entry state word
//!
//! Each entry packs a removal flag and its outstanding guard count into one
//! `AtomicU64` (`REMOVAL_REQUESTED | guards`):
//!
//! - `acquire` increments only while the flag is clear, so once removal is
//!   requested the count can only fall;
//! - the request that sets the flag completes removal if the count was 0;
//! - a release completes removal if it moved the word from
//!   `REMOVAL_REQUESTED | 1`.
//!
//! Exactly one transition reaches `REMOVAL_REQUESTED | 0`, so removal and
//! teardown happen once. Which terminal path gets to set the flag is decided
//! by the session's own `Running -> *` compare-and-swap.
//!
//! # Locking
//!
//! One `RwLock` guards the primary map and the `shard -> id` index together.
//! Lookups take it shared; register, reset and removal take it exclusively.
//! Listener callbacks, token cancellation and teardown I/O run after the
//! lock is dropped.
//!
//! # Logging
//!
//! - **TRACE** `rsr::registry`: `guard_acquired`, `guard_refused`, `guard_released`
//! - **DEBUG** `rsr::registry`: `recovery_registered`, `register_rejected`,
//!   `removal_requested`, `recovery_removed`
//! - **INFO**  `rsr::registry`: `recovery_reset`
//! - **WARN**  `rsr::registry`: `recovery_timed_out`

use crate::clock::{Clock, MonotonicClock, duration_to_nanos};
use crate::config::RegistryConfig;
use crate::listener::RecoveryListener;
use crate::session::{RESET_REASON, RecoverySession, SessionParts};
use crate::stats::{RegistryStats, StatsSnapshot};
use parking_lot::RwLock;
use rsr_error::{RecoveryError, Result};
use rsr_store::{ResourceGuard, Store};
use rsr_types::{NodeId, RecoveryId, SessionState, ShardId, TempGeneration};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Cancellation reason used by the idle-timeout sweep.
pub const TIMEOUT_REASON: &str = "recovery timed out";

const REMOVAL_REQUESTED: u64 = 1 << 63;
const GUARD_MASK: u64 = REMOVAL_REQUESTED - 1;

// ─── Entry ──────────────────────────────────────────────────────────────────

struct Entry<S: Store> {
    session: RecoverySession<S>,
    state: AtomicU64,
}

impl<S: Store> Entry<S> {
    fn new(session: RecoverySession<S>) -> Self {
        Self {
            session,
            state: AtomicU64::new(0),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & REMOVAL_REQUESTED != 0 {
                return false;
            }
            debug_assert!(current & GUARD_MASK < GUARD_MASK, "guard count overflow");
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// True if this release drained an entry whose removal was requested.
    fn release(&self) -> bool {
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & GUARD_MASK > 0, "release without matching acquire");
        previous == REMOVAL_REQUESTED | 1
    }

    /// Set the removal flag. True if no guard was outstanding.
    ///
    /// Called only by the winner of the session's terminal transition.
    fn request_removal(&self) -> bool {
        let previous = self.state.fetch_or(REMOVAL_REQUESTED, Ordering::AcqRel);
        debug_assert!(
            previous & REMOVAL_REQUESTED == 0,
            "removal of recovery {} requested twice",
            self.session.id()
        );
        previous & GUARD_MASK == 0
    }

    fn outstanding(&self) -> u64 {
        self.state.load(Ordering::Acquire) & GUARD_MASK
    }

    fn removal_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) & REMOVAL_REQUESTED != 0
    }
}

// ─── Shared state ───────────────────────────────────────────────────────────

struct RegistryState<S: Store> {
    entries: HashMap<RecoveryId, Arc<Entry<S>>>,
    by_shard: HashMap<ShardId, RecoveryId>,
}

struct RegistryInner<S: Store> {
    state: RwLock<RegistryState<S>>,
    next_id: AtomicU64,
    config: RegistryConfig,
    temp_prefix: Arc<str>,
    clock: Arc<dyn Clock>,
    stats: RegistryStats,
}

impl<S: Store> RegistryInner<S> {
    fn allocate_id(&self) -> RecoveryId {
        RecoveryId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lookup(&self, id: RecoveryId) -> Option<Arc<Entry<S>>> {
        self.state.read().entries.get(&id).cloned()
    }

    /// Erase a drained entry and tear its session down.
    fn complete_removal(&self, entry: &Arc<Entry<S>>) {
        let id = entry.session.id();
        let shard_id = entry.session.shard_id();
        {
            let mut state = self.state.write();
            if state
                .entries
                .get(&id)
                .is_some_and(|current| Arc::ptr_eq(current, entry))
            {
                state.entries.remove(&id);
            }
            if state.by_shard.get(shard_id) == Some(&id) {
                state.by_shard.remove(shard_id);
            }
        }
        entry.session.teardown();
        debug!(target: "rsr::registry", id = %id, shard = %shard_id, "recovery_removed");
    }
}

// ─── Public types ───────────────────────────────────────────────────────────

/// Everything needed to register a recovery attempt.
pub struct RecoveryRequest<S: Store> {
    pub shard_id: ShardId,
    pub source_node: NodeId,
    pub target_node: NodeId,
    /// Guard on the shard store; the session owns it until teardown.
    pub store: ResourceGuard<S>,
    pub listener: Arc<dyn RecoveryListener>,
}

impl<S: Store> RecoveryRequest<S> {
    pub fn new(
        shard_id: ShardId,
        source_node: NodeId,
        target_node: NodeId,
        store: ResourceGuard<S>,
        listener: impl RecoveryListener + 'static,
    ) -> Self {
        Self {
            shard_id,
            source_node,
            target_node,
            store,
            listener: Arc::new(listener),
        }
    }
}

impl<S: Store> std::fmt::Debug for RecoveryRequest<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryRequest")
            .field("shard_id", &self.shard_id)
            .field("source_node", &self.source_node)
            .field("target_node", &self.target_node)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Diagnostic view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: RecoveryId,
    pub shard_id: ShardId,
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub state: SessionState,
    pub generation: TempGeneration,
    pub outstanding_guards: u64,
    pub removal_requested: bool,
    pub retired: bool,
    pub idle_ms: u64,
}

/// Scoped access to a registered session.
///
/// Dropping the guard releases it; the last release of a session whose
/// removal was requested erases the entry and tears the session down.
pub struct RecoveryGuard<S: Store> {
    registry: Arc<RegistryInner<S>>,
    entry: Arc<Entry<S>>,
}

impl<S: Store> RecoveryGuard<S> {
    #[must_use]
    pub fn session(&self) -> &RecoverySession<S> {
        &self.entry.session
    }

    /// Release explicitly. Same as dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl<S: Store> Deref for RecoveryGuard<S> {
    type Target = RecoverySession<S>;

    fn deref(&self) -> &RecoverySession<S> {
        &self.entry.session
    }
}

impl<S: Store> Drop for RecoveryGuard<S> {
    fn drop(&mut self) {
        let drained = self.entry.release();
        trace!(
            target: "rsr::registry",
            id = %self.entry.session.id(),
            outstanding = self.entry.outstanding(),
            "guard_released"
        );
        if drained {
            self.registry.complete_removal(&self.entry);
        }
    }
}

impl<S: Store> std::fmt::Debug for RecoveryGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryGuard")
            .field("session", &self.entry.session)
            .field("outstanding", &self.entry.outstanding())
            .finish()
    }
}

enum Ending<'a> {
    Done,
    Failed {
        error: RecoveryError,
        send_shard_failure: bool,
    },
    Cancelled {
        reason: &'a str,
    },
    TimedOut {
        now: Duration,
    },
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Registry of in-flight recoveries for one node.
///
/// Cloning yields another handle to the same registry.
pub struct RecoveryRegistry<S: Store> {
    inner: Arc<RegistryInner<S>>,
}

impl<S: Store> Clone for RecoveryRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Store> RecoveryRegistry<S> {
    /// Create an empty registry on the monotonic clock.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Create an empty registry reading time from `clock`.
    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState {
                    entries: HashMap::new(),
                    by_shard: HashMap::new(),
                }),
                next_id: AtomicU64::new(1),
                temp_prefix: Arc::from(config.temp_file_prefix.as_str()),
                config,
                clock,
                stats: RegistryStats::new(),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Register a new recovery for `request.shard_id`, cancelled by the
    /// sweeper after `timeout` without activity.
    ///
    /// Fails with `AlreadyRecovering` while the shard has a session in the
    /// registry, draining ones included. On failure the request (and its
    /// store guard) is dropped.
    pub fn register(&self, request: RecoveryRequest<S>, timeout: Duration) -> Result<RecoveryId> {
        let RecoveryRequest {
            shard_id,
            source_node,
            target_node,
            store,
            listener,
        } = request;

        let id = {
            let mut state = self.inner.state.write();
            if let Some(existing) = state.by_shard.get(&shard_id) {
                debug!(
                    target: "rsr::registry",
                    shard = %shard_id,
                    existing = %existing,
                    "register_rejected"
                );
                return Err(RecoveryError::AlreadyRecovering {
                    shard: shard_id.to_string(),
                });
            }
            let id = self.inner.allocate_id();
            let session = RecoverySession::new(
                id,
                TempGeneration::INITIAL,
                SessionParts {
                    shard_id: shard_id.clone(),
                    source_node,
                    target_node,
                    store,
                    listener,
                    timeout,
                    temp_prefix: Arc::clone(&self.inner.temp_prefix),
                    clock: Arc::clone(&self.inner.clock),
                },
            );
            state.entries.insert(id, Arc::new(Entry::new(session)));
            state.by_shard.insert(shard_id.clone(), id);
            id
        };

        self.inner.stats.record_registered();
        debug!(
            target: "rsr::registry",
            id = %id,
            shard = %shard_id,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "recovery_registered"
        );
        Ok(id)
    }

    /// Register with the configured activity timeout.
    pub fn register_default(&self, request: RecoveryRequest<S>) -> Result<RecoveryId> {
        self.register(request, self.inner.config.activity_timeout)
    }

    /// Guard on `id`, or `None` if it is unknown or being removed.
    ///
    /// `None` means the recovery is over; it is not worth retrying.
    pub fn acquire(&self, id: RecoveryId) -> Option<RecoveryGuard<S>> {
        let entry = {
            let state = self.inner.state.read();
            let entry = state.entries.get(&id)?;
            if !entry.try_acquire() {
                trace!(target: "rsr::registry", id = %id, "guard_refused");
                return None;
            }
            Arc::clone(entry)
        };
        entry.session.touch();
        trace!(
            target: "rsr::registry",
            id = %id,
            outstanding = entry.outstanding(),
            "guard_acquired"
        );
        Some(RecoveryGuard {
            registry: Arc::clone(&self.inner),
            entry,
        })
    }

    /// Like [`acquire`](Self::acquire), but also checks the session belongs
    /// to `shard_id`.
    ///
    /// `NotFound` is a benign race; `ShardMismatch` means the caller routed a
    /// message to the wrong recovery.
    pub fn acquire_safe(&self, id: RecoveryId, shard_id: &ShardId) -> Result<RecoveryGuard<S>> {
        let guard = self
            .acquire(id)
            .ok_or(RecoveryError::NotFound { id: id.0 })?;
        if guard.shard_id() != shard_id {
            return Err(RecoveryError::ShardMismatch {
                id: id.0,
                expected: shard_id.to_string(),
                actual: guard.shard_id().to_string(),
            });
        }
        Ok(guard)
    }

    /// Cancel `id`. False if it was unknown or already ending.
    pub fn cancel(&self, id: RecoveryId, reason: &str) -> bool {
        self.end(id, Ending::Cancelled { reason })
    }

    /// Cancel whatever recovery currently targets `shard_id`.
    ///
    /// A reset between the index lookup and the cancel retires the looked-up
    /// id; the lookup is then repeated against the successor.
    pub fn cancel_for_shard(&self, shard_id: &ShardId, reason: &str) -> usize {
        let mut id = self.inner.state.read().by_shard.get(shard_id).copied();
        while let Some(current) = id {
            if self.cancel(current, reason) {
                return 1;
            }
            let next = self.inner.state.read().by_shard.get(shard_id).copied();
            if next == Some(current) {
                break;
            }
            id = next;
        }
        0
    }

    /// Mark `id` successfully finished.
    pub fn mark_done(&self, id: RecoveryId) -> bool {
        self.end(id, Ending::Done)
    }

    /// Fail `id` with `error`.
    pub fn fail(&self, id: RecoveryId, error: RecoveryError, send_shard_failure: bool) -> bool {
        self.end(
            id,
            Ending::Failed {
                error,
                send_shard_failure,
            },
        )
    }

    /// Cancel `id` as timed out if it is still idle as of `now`.
    pub(crate) fn time_out(&self, id: RecoveryId, now: Duration) -> bool {
        self.end(id, Ending::TimedOut { now })
    }

    fn end(&self, id: RecoveryId, ending: Ending<'_>) -> bool {
        let Some(entry) = self.inner.lookup(id) else {
            return false;
        };
        let session = &entry.session;
        let stats = &self.inner.stats;
        let outcome = match ending {
            Ending::Done => session.mark_done().inspect(|_| stats.record_completed()),
            Ending::Failed {
                error,
                send_shard_failure,
            } => session
                .mark_failed(error, send_shard_failure)
                .inspect(|_| stats.record_failed()),
            Ending::Cancelled { reason } => session
                .cancel(reason, false)
                .inspect(|_| stats.record_cancelled()),
            Ending::TimedOut { now } => {
                if !session.is_idle(now) {
                    return false;
                }
                let outcome = session.cancel(TIMEOUT_REASON, true);
                if outcome.is_some() {
                    stats.record_timed_out();
                    warn!(
                        target: "rsr::registry",
                        id = %id,
                        shard = %session.shard_id(),
                        idle_ms = u64::try_from(session.idle_for(now).as_millis()).unwrap_or(u64::MAX),
                        "recovery_timed_out"
                    );
                }
                outcome
            }
        };
        let Some(outcome) = outcome else {
            return false;
        };

        let drained = entry.request_removal();
        debug!(
            target: "rsr::registry",
            id = %id,
            state = %session.state(),
            outstanding = entry.outstanding(),
            "removal_requested"
        );
        if drained {
            self.inner.complete_removal(&entry);
        }
        session.notify(outcome);
        true
    }

    /// Restart recovery `id` of `shard_id` under a new id, sharing its store.
    ///
    /// The successor gets a fresh cancellation token and the next temp
    /// generation and takes over the shard index. The old session is retired
    /// without a listener call: guards still held on it stay usable, and
    /// the last of them tears it down.
    pub fn reset(&self, id: RecoveryId, shard_id: &ShardId) -> Result<RecoveryId> {
        let (old, new_id, drained) = {
            let mut state = self.inner.state.write();
            let old = state
                .entries
                .get(&id)
                .cloned()
                .ok_or(RecoveryError::NotFound { id: id.0 })?;
            if old.session.shard_id() != shard_id {
                return Err(RecoveryError::ShardMismatch {
                    id: id.0,
                    expected: shard_id.to_string(),
                    actual: old.session.shard_id().to_string(),
                });
            }
            let current = old.session.state();
            if current != SessionState::Running {
                return Err(RecoveryError::AlreadyTerminal {
                    id: id.0,
                    state: current.to_string(),
                });
            }

            let new_id = self.inner.allocate_id();
            let successor = old.session.successor(new_id)?;
            if !old.session.retire() {
                return Err(RecoveryError::AlreadyTerminal {
                    id: id.0,
                    state: old.session.state().to_string(),
                });
            }
            let drained = old.request_removal();
            state.entries.insert(new_id, Arc::new(Entry::new(successor)));
            state.by_shard.insert(shard_id.clone(), new_id);
            if drained {
                state.entries.remove(&id);
            }
            (old, new_id, drained)
        };

        old.session.cancellable().cancel(RESET_REASON);
        if drained {
            old.session.teardown();
        }
        self.inner.stats.record_reset();
        info!(
            target: "rsr::registry",
            old_id = %id,
            new_id = %new_id,
            shard = %shard_id,
            outstanding = old.outstanding(),
            "recovery_reset"
        );
        Ok(new_id)
    }

    /// Entries in the registry, draining ones included.
    pub fn size(&self) -> usize {
        self.inner.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Ids of all entries for `shard_id`, sorted.
    pub fn ids_for_shard(&self, shard_id: &ShardId) -> Vec<RecoveryId> {
        let state = self.inner.state.read();
        let mut ids: Vec<RecoveryId> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.session.shard_id() == shard_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Id the shard index currently maps `shard_id` to.
    pub fn id_for_shard(&self, shard_id: &ShardId) -> Option<RecoveryId> {
        self.inner.state.read().by_shard.get(shard_id).copied()
    }

    /// Consistent view of every entry, sorted by id.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let now = self.inner.clock.now();
        let state = self.inner.state.read();
        let mut sessions: Vec<SessionSnapshot> = state
            .entries
            .values()
            .map(|entry| {
                let session = &entry.session;
                SessionSnapshot {
                    id: session.id(),
                    shard_id: session.shard_id().clone(),
                    source_node: session.source_node().clone(),
                    target_node: session.target_node().clone(),
                    state: session.state(),
                    generation: session.generation(),
                    outstanding_guards: entry.outstanding(),
                    removal_requested: entry.removal_requested(),
                    retired: session.is_retired(),
                    idle_ms: duration_to_nanos(session.idle_for(now)) / 1_000_000,
                }
            })
            .collect();
        drop(state);
        sessions.sort_unstable_by_key(|s| s.id);
        sessions
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.size())
    }

    /// Running sessions idle past their timeout as of `now`, sorted.
    pub(crate) fn idle_candidates(&self, now: Duration) -> Vec<RecoveryId> {
        let state = self.inner.state.read();
        let mut ids: Vec<RecoveryId> = state
            .entries
            .values()
            .filter(|entry| {
                !entry.removal_requested()
                    && entry.session.state() == SessionState::Running
                    && entry.session.is_idle(now)
            })
            .map(|entry| entry.session.id())
            .collect();
        drop(state);
        ids.sort_unstable();
        ids
    }
}

impl<S: Store> std::fmt::Debug for RecoveryRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryRegistry")
            .field("config", &self.inner.config)
            .field("size", &self.size())
            .field("stats", &self.inner.stats)
            .finish_non_exhaustive()
    }
}
