#![forbid(unsafe_code)]
//! Error types for the recovery session registry.
//!
//! # Error Taxonomy
//!
//! Every fallible operation in the workspace returns [`RecoveryError`]. The
//! variants fall into a small number of classes ([`ErrorClass`]) and the class,
//! not the variant, decides how a caller reacts:
//!
//! | Variant | Class | Typical source |
//! |---------|-------|----------------|
//! | `AlreadyRecovering` | `Rejected` | `register` on a shard with a live session |
//! | `NotFound` | `BenignRace` | `acquire_safe` / `reset` on a finished or cancelled id |
//! | `ShardMismatch` | `Rejected` | transport message tagged with the wrong shard |
//! | `Cancelled` | `Cancelled` | `check_cancelled` after `cancel` or an idle timeout |
//! | `ResourceClosed` | `ProgrammingError` | store guard requested after `mark_for_close` |
//! | `AlreadyTerminal` | `ProgrammingError` | `reset` on a session that left `Running` |
//! | `InvalidConfig` | `Rejected` | `RegistryConfig::validate` |
//! | `Io` | `Io` | store or socket failure inside a recovery step |
//! | `Failed` | `RecoveryFailed` | recovery step failure reported through the listener |
//!
//! ## Propagation Policy
//!
//! - `BenignRace` is the expected outcome of a recovery finishing between the
//!   moment a caller learned its id and the moment it asked for it. Callers
//!   treat it as "nothing to do"; the registry never logs it as a failure.
//! - `ProgrammingError` is never masked: it propagates to the caller.
//! - A timeout and an explicit cancellation share the `Cancelled` variant and
//!   differ only by their reason string.
//!
//! ## Design Constraints
//!
//! - `rsr-error` MUST NOT depend on `rsr-types`; identifiers are carried as
//!   their raw `u64` / `String` forms.
//! - All string payloads are owned so errors can cross thread boundaries and be
//!   handed to completion listeners.

use thiserror::Error;

/// Unified error type for all recovery registry operations.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The shard already has a registered (or draining) recovery session.
    #[error("recovery already in progress for shard {shard}")]
    AlreadyRecovering { shard: String },

    /// The recovery id is unknown, finished, or its removal was requested.
    #[error("recovery {id} not found (finished or cancelled)")]
    NotFound { id: u64 },

    /// The recovery id exists but belongs to a different shard.
    #[error("recovery {id} belongs to shard {actual}, not {expected}")]
    ShardMismatch {
        id: u64,
        expected: String,
        actual: String,
    },

    /// The operation was cancelled; `reason` is the first reason recorded.
    #[error("recovery cancelled: {reason}")]
    Cancelled { reason: String },

    /// A reference-counted resource was acquired after it was marked for close.
    #[error("resource {resource} is already closed")]
    ResourceClosed { resource: String },

    /// A lifecycle operation required a running session.
    #[error("recovery {id} is {state}, expected running")]
    AlreadyTerminal { id: u64, state: String },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A recovery step failed for a reason outside this taxonomy.
    #[error("recovery failed: {0}")]
    Failed(String),
}

/// How a caller should react to a [`RecoveryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Expected race with a concurrent completion or cancellation.
    BenignRace,
    /// The request was refused; reported to the caller, never retried here.
    Rejected,
    /// The recovery attempt stopped because it was cancelled or timed out.
    Cancelled,
    /// A contract violation by the caller. Never masked.
    ProgrammingError,
    /// Underlying I/O failure.
    Io,
    /// Generic recovery failure.
    RecoveryFailed,
}

impl RecoveryError {
    /// Build a `Cancelled` error from any reason.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Build a `ResourceClosed` error for the named resource.
    pub fn resource_closed(resource: impl Into<String>) -> Self {
        Self::ResourceClosed {
            resource: resource.into(),
        }
    }

    /// Classify this error.
    ///
    /// The mapping is exhaustive: adding a variant is a compile error until
    /// its class is assigned.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::BenignRace,
            Self::AlreadyRecovering { .. }
            | Self::ShardMismatch { .. }
            | Self::InvalidConfig(_) => ErrorClass::Rejected,
            Self::Cancelled { .. } => ErrorClass::Cancelled,
            Self::ResourceClosed { .. } | Self::AlreadyTerminal { .. } => {
                ErrorClass::ProgrammingError
            }
            Self::Io(_) => ErrorClass::Io,
            Self::Failed(_) => ErrorClass::RecoveryFailed,
        }
    }

    /// True for races that callers resolve locally as "nothing to do".
    #[must_use]
    pub fn is_benign_race(&self) -> bool {
        self.class() == ErrorClass::BenignRace
    }

    /// True for contract violations that must propagate unmasked.
    #[must_use]
    pub fn is_programming_error(&self) -> bool {
        self.class() == ErrorClass::ProgrammingError
    }

    /// The cancellation reason, if this is a `Cancelled` error.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<&str> {
        match self {
            Self::Cancelled { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Result alias using `RecoveryError`.
pub type Result<T> = std::result::Result<T, RecoveryError>;
