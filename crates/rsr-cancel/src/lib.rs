#![forbid(unsafe_code)]
//! Cooperative cancellation for blocking recovery steps.
//!
//! A [`CancellableOperation`] is threaded through every blocking call a
//! recovery attempt makes. Checking it between steps is not enough: a thread
//! parked in a socket read would only notice the flag after the peer sends the
//! next byte. The token therefore offers three wrapped blocking primitives,
//! each with a bounded cancellation latency:
//!
//! | Primitive | Latency after `cancel` returns |
//! |-----------|--------------------------------|
//! | [`CancellableOperation::sleep`] | immediate (condvar wake-up) |
//! | [`CancellableOperation::execute_io`] | the time the interrupt hook needs to unblock the call (e.g. `TcpStream::shutdown`) |
//! | [`CancellableIo`] | one chunk of at most `max_chunk` bytes |
//!
//! # Logging
//!
//! - **DEBUG** `rsr::cancel`: `cancel_requested`: first cancel with its reason
//! - **TRACE** `rsr::cancel`: `interrupt_hooks_run`: hooks fired by cancel

use parking_lot::{Condvar, Mutex};
use rsr_error::{RecoveryError, Result};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default largest transfer a [`CancellableIo`] issues between two checks.
pub const DEFAULT_MAX_CHUNK: usize = 64 * 1024;

type InterruptHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancelState {
    reason: Option<String>,
    hooks: BTreeMap<u64, InterruptHook>,
    next_hook: u64,
}

#[derive(Default)]
struct Inner {
    /// Mirrors `state.reason.is_some()`; read without the lock.
    cancelled: AtomicBool,
    state: Mutex<CancelState>,
    wakeup: Condvar,
}

/// Shared cancellation token.
///
/// Clones share state: cancelling any clone cancels all of them. A fresh
/// token is created with [`new`](Self::new).
#[derive(Clone, Default)]
pub struct CancellableOperation {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CancellableOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableOperation")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

impl CancellableOperation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the operation.
    ///
    /// Idempotent: the first reason wins and later calls return `false`.
    /// Interrupt hooks registered through [`on_cancel`](Self::on_cancel) run
    /// synchronously on the calling thread before this returns.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let hooks = {
            let mut state = self.inner.state.lock();
            if state.reason.is_some() {
                return false;
            }
            let reason = reason.into();
            debug!(target: "rsr::cancel", reason = %reason, "cancel_requested");
            state.reason = Some(reason);
            self.inner.cancelled.store(true, Ordering::Release);
            std::mem::take(&mut state.hooks)
        };
        self.inner.wakeup.notify_all();
        if !hooks.is_empty() {
            trace!(target: "rsr::cancel", hooks = hooks.len(), "interrupt_hooks_run");
        }
        for (_, hook) in hooks {
            hook();
        }
        true
    }

    /// Lock-free cancellation check.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The recorded cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.state.lock().reason.clone()
    }

    /// Suspension-point check: `Err(Cancelled)` carrying the first reason.
    pub fn check_cancelled(&self) -> Result<()> {
        if !self.is_cancelled() {
            return Ok(());
        }
        Err(RecoveryError::cancelled(self.reason().unwrap_or_default()))
    }

    /// Block for `duration`, returning early with `Cancelled` on cancel.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(duration);
        let mut state = self.inner.state.lock();
        while state.reason.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.inner.wakeup.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.wakeup.wait(&mut state),
            }
        }
        match &state.reason {
            Some(reason) => Err(RecoveryError::cancelled(reason.clone())),
            None => Ok(()),
        }
    }

    /// Register a hook that `cancel` runs to unblock an in-flight call.
    ///
    /// Fails with `Cancelled` (without running the hook) if the token is
    /// already cancelled. The hook is unregistered when the returned value is
    /// dropped.
    pub fn on_cancel<F>(&self, hook: F) -> Result<InterruptRegistration>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if let Some(reason) = &state.reason {
            return Err(RecoveryError::cancelled(reason.clone()));
        }
        let key = state.next_hook;
        state.next_hook = state.next_hook.wrapping_add(1);
        state.hooks.insert(key, Box::new(hook));
        Ok(InterruptRegistration {
            token: self.clone(),
            key,
        })
    }

    /// Run a blocking I/O call that `interrupt` can unblock.
    ///
    /// If the token is cancelled while `op` runs, `interrupt` is invoked from
    /// the cancelling thread and the result of `op` is replaced by
    /// `Cancelled`, whatever it was.
    pub fn execute_io<T, I, F>(&self, interrupt: I, op: F) -> Result<T>
    where
        I: FnOnce() + Send + 'static,
        F: FnOnce() -> io::Result<T>,
    {
        let registration = self.on_cancel(interrupt)?;
        let outcome = op();
        drop(registration);
        self.check_cancelled()?;
        outcome.map_err(unwrap_io_error)
    }

    /// Run a non-interruptible step, checking before and after it.
    pub fn execute<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.check_cancelled()?;
        let value = op()?;
        self.check_cancelled()?;
        Ok(value)
    }
}

/// Keeps an interrupt hook registered; dropping it unregisters the hook.
#[must_use = "the hook is unregistered as soon as the registration is dropped"]
pub struct InterruptRegistration {
    token: CancellableOperation,
    key: u64,
}

impl std::fmt::Debug for InterruptRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptRegistration")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Drop for InterruptRegistration {
    fn drop(&mut self) {
        self.token.inner.state.lock().hooks.remove(&self.key);
    }
}

/// Convert an I/O error back into a `RecoveryError`, recovering a
/// cancellation that a [`CancellableIo`] smuggled through `std::io`.
#[must_use]
pub fn unwrap_io_error(err: io::Error) -> RecoveryError {
    let reason = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<RecoveryError>())
        .and_then(RecoveryError::cancel_reason)
        .map(str::to_owned);
    match reason {
        Some(reason) => RecoveryError::cancelled(reason),
        None => RecoveryError::Io(err),
    }
}

/// `Read`/`Write` adapter that checks a token before every chunk.
///
/// Each call transfers at most `max_chunk` bytes, so a cancel is observed
/// after at most one chunk. Cancellation surfaces as an `io::Error` wrapping
/// `RecoveryError::Cancelled`; use [`unwrap_io_error`] to get it back.
#[derive(Debug)]
pub struct CancellableIo<T> {
    inner: T,
    token: CancellableOperation,
    max_chunk: usize,
}

impl<T> CancellableIo<T> {
    pub fn new(inner: T, token: CancellableOperation) -> Self {
        Self::with_max_chunk(inner, token, DEFAULT_MAX_CHUNK)
    }

    pub fn with_max_chunk(inner: T, token: CancellableOperation, max_chunk: usize) -> Self {
        Self {
            inner,
            token,
            max_chunk: max_chunk.max(1),
        }
    }

    #[must_use]
    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    #[must_use]
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn check(&self) -> io::Result<()> {
        self.token.check_cancelled().map_err(io::Error::other)
    }
}

impl<R: Read> Read for CancellableIo<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        let len = buf.len().min(self.max_chunk);
        self.inner.read(&mut buf[..len])
    }
}

impl<W: Write> Write for CancellableIo<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        let len = buf.len().min(self.max_chunk);
        self.inner.write(&buf[..len])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.flush()
    }
}
