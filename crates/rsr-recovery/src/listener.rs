//! Completion notification for recovery sessions.

use rsr_error::RecoveryError;
use rsr_types::{RecoveryId, ShardId};

/// Final outcome of one recovery attempt, delivered exactly once.
#[derive(Debug)]
pub enum RecoveryOutcome {
    Done {
        id: RecoveryId,
        shard_id: ShardId,
    },
    Failed {
        id: RecoveryId,
        shard_id: ShardId,
        error: RecoveryError,
        /// Whether the shard itself should be failed, not just this attempt.
        send_shard_failure: bool,
    },
}

impl RecoveryOutcome {
    #[must_use]
    pub fn id(&self) -> RecoveryId {
        match self {
            Self::Done { id, .. } | Self::Failed { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn shard_id(&self) -> &ShardId {
        match self {
            Self::Done { shard_id, .. } | Self::Failed { shard_id, .. } => shard_id,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    #[must_use]
    pub fn error(&self) -> Option<&RecoveryError> {
        match self {
            Self::Done { .. } => None,
            Self::Failed { error, .. } => Some(error),
        }
    }

    #[must_use]
    pub fn send_shard_failure(&self) -> bool {
        match self {
            Self::Done { .. } => false,
            Self::Failed {
                send_shard_failure, ..
            } => *send_shard_failure,
        }
    }
}

/// Receives the outcome of a recovery attempt.
///
/// Called on whichever thread ended the attempt, never while a registry lock
/// is held, so implementations may call back into the registry.
pub trait RecoveryListener: Send + Sync {
    fn on_completion(&self, outcome: RecoveryOutcome);
}

impl<F> RecoveryListener for F
where
    F: Fn(RecoveryOutcome) + Send + Sync,
{
    fn on_completion(&self, outcome: RecoveryOutcome) {
        self(outcome);
    }
}
