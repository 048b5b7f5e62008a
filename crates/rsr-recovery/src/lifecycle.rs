//! Starting a recovery from the shard's point of view.

use crate::listener::RecoveryListener;
use crate::registry::{RecoveryRegistry, RecoveryRequest};
use rsr_error::Result;
use rsr_store::{ResourceGuard, Store};
use rsr_types::{NodeId, RecoveryId, ShardId};
use std::sync::Arc;
use tracing::debug;

/// Shard-side hooks run before a recovery is registered.
pub trait ShardLifecycle<S: Store>: Send + Sync {
    /// Flag the shard as recovering. Fails with `AlreadyRecovering` if it
    /// already is.
    fn mark_shard_recovering(&self, shard_id: &ShardId) -> Result<()>;

    /// Bring the shard into a state it can receive recovery data in.
    fn prepare_for_recovery(&self, shard_id: &ShardId) -> Result<()>;

    /// Guard on the shard's store for the session to hold.
    fn open_store(&self, shard_id: &ShardId) -> Result<ResourceGuard<S>>;
}

impl<S: Store> RecoveryRegistry<S> {
    /// Mark the shard recovering, prepare it, open its store and register a
    /// session with the configured activity timeout.
    ///
    /// Stops at the first failing step; nothing is registered in that case.
    pub fn start_recovery<L>(
        &self,
        lifecycle: &L,
        shard_id: ShardId,
        source_node: NodeId,
        target_node: NodeId,
        listener: Arc<dyn RecoveryListener>,
    ) -> Result<RecoveryId>
    where
        L: ShardLifecycle<S> + ?Sized,
    {
        lifecycle.mark_shard_recovering(&shard_id)?;
        lifecycle.prepare_for_recovery(&shard_id)?;
        let store = lifecycle.open_store(&shard_id)?;
        debug!(
            target: "rsr::registry",
            shard = %shard_id,
            source = %source_node,
            target_node = %target_node,
            "recovery_starting"
        );
        self.register_default(RecoveryRequest {
            shard_id,
            source_node,
            target_node,
            store,
            listener,
        })
    }
}
