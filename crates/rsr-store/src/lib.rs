#![forbid(unsafe_code)]
//! Reference-counted store handles with deferred close.
//!
//! A shard's store is opened once and shared by whoever recovers into it.
//! [`RefCountedResource`] wraps it with an atomic reference count; every user
//! holds a [`ResourceGuard`] and the wrapped value is reachable only through a
//! live guard. The value is closed exactly once: when the owner has called
//! [`RefCountedResource::mark_for_close`] *and* the last guard is gone,
//! whichever happens last, on the thread that observed it.
//!
//! # State word
//!
//! Count and closing flag share one `AtomicU64` (`CLOSING | count`). The close
//! happens on the unique transition into `CLOSING | 0`:
//!
//! - `mark_for_close` sets the flag and closes if the count was already 0;
//! - a release closes if it moved the word from `CLOSING | 1`;
//! - `acquire` refuses to increment once the flag is set, so the count can
//!   only fall after close was requested and no guard can resurrect the value.
//!
//! # Logging
//!
//! - **TRACE** `rsr::store`: `resource_acquire` / `resource_release`
//! - **DEBUG** `rsr::store`: `resource_mark_for_close`, `resource_closed`
//! - **WARN**  `rsr::store`: `resource_close_failed`

mod fs_store;

pub use fs_store::FsStore;

use rsr_error::{RecoveryError, Result};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace, warn};

const CLOSING: u64 = 1 << 63;
const COUNT_MASK: u64 = CLOSING - 1;

/// A resource with an explicit, fallible close.
pub trait Closeable: Send + Sync {
    fn close(&self) -> Result<()>;
}

/// The store contract recovery needs: closing, plus deleting files it left
/// behind.
pub trait Store: Closeable + 'static {
    /// Delete the named files. Names that do not exist are ignored.
    fn delete_files(&self, names: &[String]) -> Result<()>;
}

struct Shared<T: Closeable> {
    name: String,
    value: T,
    state: AtomicU64,
    closed: AtomicBool,
}

impl<T: Closeable> Shared<T> {
    fn acquire(shared: &Arc<Self>) -> Result<ResourceGuard<T>> {
        let mut current = shared.state.load(Ordering::Acquire);
        loop {
            if current & CLOSING != 0 {
                return Err(RecoveryError::resource_closed(shared.name.clone()));
            }
            debug_assert!(current & COUNT_MASK < COUNT_MASK, "reference count overflow");
            match shared.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        trace!(
            target: "rsr::store",
            resource = %shared.name,
            ref_count = (current & COUNT_MASK) + 1,
            "resource_acquire"
        );
        Ok(ResourceGuard {
            shared: Arc::clone(shared),
        })
    }

    fn release(&self) {
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & COUNT_MASK > 0, "release without matching acquire");
        trace!(
            target: "rsr::store",
            resource = %self.name,
            ref_count = (previous & COUNT_MASK).saturating_sub(1),
            "resource_release"
        );
        if previous == CLOSING | 1 {
            self.close_now();
        }
    }

    fn mark_for_close(&self) -> bool {
        let previous = self.state.fetch_or(CLOSING, Ordering::AcqRel);
        if previous & CLOSING != 0 {
            return false;
        }
        debug!(
            target: "rsr::store",
            resource = %self.name,
            ref_count = previous & COUNT_MASK,
            "resource_mark_for_close"
        );
        if previous & COUNT_MASK == 0 {
            self.close_now();
        }
        true
    }

    fn close_now(&self) {
        let already_closed = self.closed.swap(true, Ordering::AcqRel);
        debug_assert!(!already_closed, "resource {} closed twice", self.name);
        if already_closed {
            return;
        }
        match self.value.close() {
            Ok(()) => debug!(target: "rsr::store", resource = %self.name, "resource_closed"),
            Err(error) => warn!(
                target: "rsr::store",
                resource = %self.name,
                error = %error,
                "resource_close_failed"
            ),
        }
    }

    fn ref_count(&self) -> u64 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }
}

/// Owner handle of a reference-counted resource.
///
/// Dropping the owner marks the resource for close, so the value is closed
/// once the last outstanding guard is released.
pub struct RefCountedResource<T: Closeable> {
    shared: Arc<Shared<T>>,
}

impl<T: Closeable> RefCountedResource<T> {
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                value,
                state: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Take a new reference. Fails with `ResourceClosed` after
    /// [`mark_for_close`](Self::mark_for_close).
    pub fn acquire(&self) -> Result<ResourceGuard<T>> {
        Shared::acquire(&self.shared)
    }

    /// Request close. Returns `true` for the call that set the flag.
    pub fn mark_for_close(&self) -> bool {
        self.shared.mark_for_close()
    }

    /// Outstanding guards.
    #[must_use]
    pub fn ref_count(&self) -> u64 {
        self.shared.ref_count()
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) & CLOSING != 0
    }

    /// True once the wrapped value's `close` has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl<T: Closeable> Drop for RefCountedResource<T> {
    fn drop(&mut self) {
        self.shared.mark_for_close();
    }
}

impl<T: Closeable> std::fmt::Debug for RefCountedResource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCountedResource")
            .field("name", &self.shared.name)
            .field("ref_count", &self.ref_count())
            .field("closing", &self.is_closing())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A live reference to a [`RefCountedResource`]. Released on drop.
pub struct ResourceGuard<T: Closeable> {
    shared: Arc<Shared<T>>,
}

impl<T: Closeable> ResourceGuard<T> {
    /// Take one more reference to the same resource.
    ///
    /// Fails with `ResourceClosed` if the owner already marked it for close.
    pub fn try_clone(&self) -> Result<Self> {
        Shared::acquire(&self.shared)
    }

    #[must_use]
    pub fn resource_name(&self) -> &str {
        &self.shared.name
    }

    /// Outstanding guards on the underlying resource, this one included.
    #[must_use]
    pub fn ref_count(&self) -> u64 {
        self.shared.ref_count()
    }

    /// True if both guards point at the same resource.
    #[must_use]
    pub fn same_resource(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl<T: Closeable> Deref for ResourceGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.shared.value
    }
}

impl<T: Closeable> Drop for ResourceGuard<T> {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl<T: Closeable> std::fmt::Debug for ResourceGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("resource", &self.shared.name)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
