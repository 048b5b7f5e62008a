//! Idle-timeout supervision.
//!
//! A tick collects the ids of running sessions idle past their timeout under
//! a short read lock, drops the lock, then cancels each through the
//! registry's ordinary cancel path. A slow cancel of one session never
//! delays detection of the others.
//!
//! # Logging
//!
//! - **DEBUG** `rsr::sweeper`: `sweep_tick` (only when something timed out),
//!   `sweeper_started`, `sweeper_stopped`
//! - **WARN**  `rsr::sweeper`: `sweeper_panicked`

use crate::registry::RecoveryRegistry;
use rsr_cancel::CancellableOperation;
use rsr_error::Result;
use rsr_store::Store;
use rsr_types::RecoveryId;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions found idle past their timeout.
    pub idle: usize,
    /// Sessions this tick actually cancelled.
    pub timed_out: Vec<RecoveryId>,
}

/// Cancels sessions that saw no activity for longer than their timeout.
pub struct IdleTimeoutSweeper<S: Store> {
    registry: RecoveryRegistry<S>,
}

impl<S: Store> IdleTimeoutSweeper<S> {
    #[must_use]
    pub fn new(registry: RecoveryRegistry<S>) -> Self {
        Self { registry }
    }

    /// Run one sweep against the registry's clock.
    pub fn tick(&self) -> SweepReport {
        let now = self.registry.clock().now();
        let idle = self.registry.idle_candidates(now);
        let timed_out: Vec<RecoveryId> = idle
            .iter()
            .copied()
            .filter(|id| self.registry.time_out(*id, now))
            .collect();
        if !timed_out.is_empty() {
            debug!(
                target: "rsr::sweeper",
                idle = idle.len(),
                timed_out = timed_out.len(),
                "sweep_tick"
            );
        }
        SweepReport {
            idle: idle.len(),
            timed_out,
        }
    }

    /// Tick every `period` on a background thread until the handle is shut
    /// down or dropped.
    pub fn spawn(self, period: Duration) -> Result<SweeperHandle> {
        let stop = CancellableOperation::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let thread = {
            let stop = stop.clone();
            let ticks = Arc::clone(&ticks);
            std::thread::Builder::new()
                .name("rsr-idle-sweeper".into())
                .spawn(move || {
                    while stop.sleep(period).is_ok() {
                        self.tick();
                        ticks.fetch_add(1, Ordering::Relaxed);
                    }
                })?
        };
        debug!(
            target: "rsr::sweeper",
            period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            "sweeper_started"
        );
        Ok(SweeperHandle {
            stop,
            ticks,
            thread: Some(thread),
        })
    }

    /// [`spawn`](Self::spawn) with the registry's configured interval.
    pub fn spawn_default(self) -> Result<SweeperHandle> {
        let period = self.registry.config().sweep_interval;
        self.spawn(period)
    }
}

impl<S: Store> std::fmt::Debug for IdleTimeoutSweeper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleTimeoutSweeper")
            .field("registry", &self.registry)
            .finish()
    }
}

/// Owns the background sweeper thread. Dropping it stops the thread.
pub struct SweeperHandle {
    stop: CancellableOperation,
    ticks: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Ticks completed so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it. Returns the number of ticks run.
    pub fn shutdown(mut self) -> u64 {
        self.stop_and_join();
        self.ticks()
    }

    fn stop_and_join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.cancel("sweeper shutdown");
        if thread.join().is_err() {
            warn!(target: "rsr::sweeper", "sweeper_panicked");
        }
        debug!(target: "rsr::sweeper", ticks = self.ticks(), "sweeper_stopped");
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl std::fmt::Debug for SweeperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweeperHandle")
            .field("active", &self.thread.is_some())
            .field("ticks", &self.ticks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::RegistryConfig;
    use crate::listener::RecoveryOutcome;
    use crate::registry::RecoveryRequest;
    use parking_lot::Mutex;
    use rsr_store::{Closeable, RefCountedResource};
    use rsr_types::{NodeId, ShardId};

    #[derive(Debug)]
    struct NullStore;

    impl Closeable for NullStore {
        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    impl Store for NullStore {
        fn delete_files(&self, _names: &[String]) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (
        RecoveryRegistry<NullStore>,
        Arc<ManualClock>,
        RefCountedResource<NullStore>,
        Arc<Mutex<Vec<RecoveryOutcome>>>,
    ) {
        let clock = Arc::new(ManualClock::new());
        let registry = RecoveryRegistry::with_clock(
            RegistryConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .expect("registry");
        (
            registry,
            clock,
            RefCountedResource::new("store", NullStore),
            Arc::new(Mutex::new(Vec::new())),
        )
    }

    fn register(
        registry: &RecoveryRegistry<NullStore>,
        resource: &RefCountedResource<NullStore>,
        outcomes: &Arc<Mutex<Vec<RecoveryOutcome>>>,
        shard: u32,
        timeout: Duration,
    ) -> RecoveryId {
        let sink = Arc::clone(outcomes);
        registry
            .register(
                RecoveryRequest::new(
                    ShardId::new("idx", shard),
                    NodeId::new("a"),
                    NodeId::new("b"),
                    resource.acquire().expect("store"),
                    move |outcome: RecoveryOutcome| sink.lock().push(outcome),
                ),
                timeout,
            )
            .expect("register")
    }

    #[test]
    fn idle_session_times_out_with_shard_failure() {
        let (registry, clock, resource, outcomes) = setup();
        let id = register(&registry, &resource, &outcomes, 0, Duration::from_secs(10));
        let sweeper = IdleTimeoutSweeper::new(registry.clone());

        clock.advance(Duration::from_secs(10));
        assert_eq!(sweeper.tick(), SweepReport::default());

        clock.advance(Duration::from_millis(1));
        let report = sweeper.tick();
        assert_eq!(report.timed_out, vec![id]);
        assert_eq!(registry.size(), 0);

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].send_shard_failure());
        assert_eq!(
            outcomes[0].error().and_then(rsr_error::RecoveryError::cancel_reason),
            Some("recovery timed out")
        );
        assert_eq!(registry.stats().timed_out, 1);
    }

    #[test]
    fn activity_keeps_session_alive() {
        let (registry, clock, resource, outcomes) = setup();
        let id = register(&registry, &resource, &outcomes, 0, Duration::from_secs(10));
        let sweeper = IdleTimeoutSweeper::new(registry.clone());

        for _ in 0..20 {
            clock.advance(Duration::from_secs(6));
            drop(registry.acquire(id).expect("still registered"));
            assert!(sweeper.tick().timed_out.is_empty());
        }
        assert!(outcomes.lock().is_empty());
    }

    #[test]
    fn per_session_timeouts_are_independent() {
        let (registry, clock, resource, outcomes) = setup();
        let short = register(&registry, &resource, &outcomes, 0, Duration::from_secs(1));
        let long = register(&registry, &resource, &outcomes, 1, Duration::from_secs(60));
        let sweeper = IdleTimeoutSweeper::new(registry.clone());

        clock.advance(Duration::from_secs(2));
        assert_eq!(sweeper.tick().timed_out, vec![short]);
        assert!(registry.acquire(long).is_some());
    }

    #[test]
    fn held_guard_does_not_stop_timeout_but_defers_removal() {
        let (registry, clock, resource, outcomes) = setup();
        let id = register(&registry, &resource, &outcomes, 0, Duration::from_secs(1));
        let guard = registry.acquire(id).expect("acquire");
        let sweeper = IdleTimeoutSweeper::new(registry.clone());

        clock.advance(Duration::from_secs(5));
        assert_eq!(sweeper.tick().timed_out, vec![id]);
        assert!(guard.check_cancelled().is_err());
        assert_eq!(registry.size(), 1);
        assert_eq!(sweeper.tick(), SweepReport::default(), "draining entry is skipped");

        drop(guard);
        assert_eq!(registry.size(), 0);
        assert_eq!(resource.ref_count(), 0);
    }

    #[test]
    fn background_thread_stops_on_shutdown() {
        let (registry, clock, resource, outcomes) = setup();
        register(&registry, &resource, &outcomes, 0, Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));

        let handle = IdleTimeoutSweeper::new(registry.clone())
            .spawn(Duration::from_millis(5))
            .expect("spawn");
        for _ in 0..2000 {
            if registry.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(registry.is_empty(), "sweeper never timed the session out");
        assert!(handle.shutdown() >= 1);
    }

    #[test]
    fn dropping_handle_joins_thread() {
        let (registry, _clock, _resource, _outcomes) = setup();
        let handle = IdleTimeoutSweeper::new(registry)
            .spawn(Duration::from_secs(3600))
            .expect("spawn");
        let started = std::time::Instant::now();
        drop(handle);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
