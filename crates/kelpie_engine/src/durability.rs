//! Durability monitor wiring.
//!
//! `passive` tracks prepares on a replica and acks a high prepared seqno back
//! to the active node; `active` aggregates replica acks and decides
//! commit/abort; `types` holds the shared sync-write container; `snapshot`
//! queues snapshot-end markers for the passive monitor.

mod active;
mod passive;
mod snapshot;
mod types;

use crate::SeqNo;

pub use active::{ActiveDurabilityMonitor, CompletionSink, ReplicationTopology};
pub use passive::{PassiveDmStats, PassiveDurabilityMonitor, VBucketContext};
pub use snapshot::{SnapshotEnd, SnapshotTracker, SnapshotType};
pub use types::{
    DurabilityError, DurabilityLevel, Item, Resolution, SyncWrite, Timeout, TrackedWrites,
};

/// A vbucket's durability monitor, polymorphic over the vbucket state.
///
/// Both variants share ordering discipline (`HCS <= HPS`, monotone
/// advancement); the operations that only make sense on one side return
/// `LogicError` on the other.
#[derive(Debug)]
pub enum DurabilityMonitor {
    Active(ActiveDurabilityMonitor),
    Passive(PassiveDurabilityMonitor),
}

impl DurabilityMonitor {
    pub fn high_prepared_seqno(&self) -> SeqNo {
        match self {
            DurabilityMonitor::Active(adm) => adm.high_prepared_seqno(),
            DurabilityMonitor::Passive(pdm) => pdm.high_prepared_seqno(),
        }
    }

    pub fn high_completed_seqno(&self) -> SeqNo {
        match self {
            DurabilityMonitor::Active(adm) => adm.high_completed_seqno(),
            DurabilityMonitor::Passive(pdm) => pdm.high_completed_seqno(),
        }
    }

    pub fn num_tracked(&self) -> usize {
        match self {
            DurabilityMonitor::Active(adm) => adm.num_tracked(),
            DurabilityMonitor::Passive(pdm) => pdm.num_tracked(),
        }
    }

    pub fn notify_local_persistence(&self) {
        match self {
            DurabilityMonitor::Active(adm) => adm.notify_local_persistence(),
            DurabilityMonitor::Passive(pdm) => pdm.notify_local_persistence(),
        }
    }

    /// Snapshot boundaries only gate replica acks; on an active vbucket the
    /// notification is accepted and ignored.
    pub fn notify_snapshot_end_received(&self, end: SeqNo) -> Result<(), DurabilityError> {
        match self {
            DurabilityMonitor::Active(_) => Ok(()),
            DurabilityMonitor::Passive(pdm) => pdm.notify_snapshot_end_received(end),
        }
    }

    /// Track a prepare shipped by the active node. Replica-side only.
    pub fn add_sync_write(
        &self,
        item: Item,
        overwriting_prepare_seqno: Option<SeqNo>,
    ) -> Result<(), DurabilityError> {
        match self {
            DurabilityMonitor::Active(_) => Err(DurabilityError::LogicError(
                "prepare frames are not accepted on an active vbucket".into(),
            )),
            DurabilityMonitor::Passive(pdm) => pdm.add_sync_write(item, overwriting_prepare_seqno),
        }
    }

    /// Apply a commit/abort shipped by the active node. Replica-side only.
    pub fn complete_sync_write(
        &self,
        key: &[u8],
        resolution: Resolution,
        prepare_seqno: Option<SeqNo>,
    ) -> Result<(), DurabilityError> {
        match self {
            DurabilityMonitor::Active(_) => Err(DurabilityError::LogicError(
                "an active vbucket resolves its own sync writes".into(),
            )),
            DurabilityMonitor::Passive(pdm) => pdm.complete_sync_write(key, resolution, prepare_seqno),
        }
    }

    pub fn as_active(&self) -> Option<&ActiveDurabilityMonitor> {
        match self {
            DurabilityMonitor::Active(adm) => Some(adm),
            DurabilityMonitor::Passive(_) => None,
        }
    }

    pub fn as_passive(&self) -> Option<&PassiveDurabilityMonitor> {
        match self {
            DurabilityMonitor::Active(_) => None,
            DurabilityMonitor::Passive(pdm) => Some(pdm),
        }
    }
}
