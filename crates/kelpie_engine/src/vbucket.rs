//! VBucket glue: ties a durability monitor, a failover table, and the
//! persistence oracle together, and maps the replication layer's inbound
//! frames onto monitor operations.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::config::EngineConfig;
use crate::durability::{
    ActiveDurabilityMonitor, CompletionSink, DurabilityError, DurabilityMonitor, Item,
    PassiveDurabilityMonitor, ReplicationTopology, Resolution, VBucketContext,
};
use crate::failover::FailoverTable;
use crate::{NodeId, SeqNo, VBucketId};

/// Outbound path for the seqno acks a replica vbucket produces.
pub trait SeqnoAckSink: Send + Sync {
    fn send_seqno_ack(&self, vb: VBucketId, seqno: SeqNo);
}

/// State shared between a vbucket and its durability monitor: the
/// persistence oracle, the snapshot mode flag, and the ack path. Kept apart
/// from the vbucket itself so the monitor holds no back-reference.
pub struct VBucketShared {
    id: VBucketId,
    persistence_seqno: AtomicU64,
    high_seqno: AtomicU64,
    receiving_disk_snapshot: AtomicBool,
    ack_sink: Arc<dyn SeqnoAckSink>,
}

impl VBucketContext for VBucketShared {
    fn persistence_seqno(&self) -> SeqNo {
        self.persistence_seqno.load(Ordering::Acquire)
    }

    fn is_receiving_disk_snapshot(&self) -> bool {
        self.receiving_disk_snapshot.load(Ordering::Acquire)
    }

    fn send_seqno_ack(&self, seqno: SeqNo) {
        self.ack_sink.send_seqno_ack(self.id, seqno);
    }
}

/// One shard of the keyspace with its own seqno space.
pub struct VBucket {
    shared: Arc<VBucketShared>,
    failover: FailoverTable,
    monitor: RwLock<DurabilityMonitor>,
}

impl VBucket {
    /// Create a replica vbucket with a fresh history.
    pub fn replica(
        id: VBucketId,
        cfg: &EngineConfig,
        ack_sink: Arc<dyn SeqnoAckSink>,
    ) -> VBucket {
        let shared = Arc::new(VBucketShared {
            id,
            persistence_seqno: AtomicU64::new(0),
            high_seqno: AtomicU64::new(0),
            receiving_disk_snapshot: AtomicBool::new(false),
            ack_sink,
        });
        let monitor = PassiveDurabilityMonitor::new(shared.clone());
        VBucket {
            shared,
            failover: FailoverTable::new(cfg.failover_capacity),
            monitor: RwLock::new(DurabilityMonitor::Passive(monitor)),
        }
    }

    /// Create an active vbucket with a fresh history. Promotion records the
    /// starting branch point.
    pub fn active(
        id: VBucketId,
        cfg: &EngineConfig,
        node_id: NodeId,
        ack_sink: Arc<dyn SeqnoAckSink>,
        completion_sink: Arc<dyn CompletionSink>,
        topology: ReplicationTopology,
    ) -> VBucket {
        let shared = Arc::new(VBucketShared {
            id,
            persistence_seqno: AtomicU64::new(0),
            high_seqno: AtomicU64::new(0),
            receiving_disk_snapshot: AtomicBool::new(false),
            ack_sink,
        });
        let monitor =
            ActiveDurabilityMonitor::new(node_id, shared.clone(), completion_sink, topology);
        VBucket {
            shared,
            failover: FailoverTable::new(cfg.failover_capacity),
            monitor: RwLock::new(DurabilityMonitor::Active(monitor)),
        }
    }

    pub fn id(&self) -> VBucketId {
        self.shared.id
    }

    pub fn failover_table(&self) -> &FailoverTable {
        &self.failover
    }

    pub fn high_seqno(&self) -> SeqNo {
        self.shared.high_seqno.load(Ordering::Acquire)
    }

    pub fn persistence_seqno(&self) -> SeqNo {
        self.shared.persistence_seqno.load(Ordering::Acquire)
    }

    pub fn high_prepared_seqno(&self) -> SeqNo {
        self.monitor.read().unwrap().high_prepared_seqno()
    }

    pub fn high_completed_seqno(&self) -> SeqNo {
        self.monitor.read().unwrap().high_completed_seqno()
    }

    pub fn num_tracked(&self) -> usize {
        self.monitor.read().unwrap().num_tracked()
    }

    pub fn is_active(&self) -> bool {
        self.monitor.read().unwrap().as_active().is_some()
    }

    /// Run `f` against the monitor. The monitor variant only changes under
    /// promotion/demotion, which take the outer write lock.
    pub fn with_monitor<R>(&self, f: impl FnOnce(&DurabilityMonitor) -> R) -> R {
        f(&self.monitor.read().unwrap())
    }

    /// Mark the start of a snapshot streamed from a peer.
    pub fn set_receiving_disk_snapshot(&self, receiving: bool) {
        self.shared
            .receiving_disk_snapshot
            .store(receiving, Ordering::Release);
    }

    /// Replication frame: snapshot marker's end seqno.
    pub fn snapshot_end_received(&self, end: SeqNo) -> Result<(), DurabilityError> {
        self.monitor.read().unwrap().notify_snapshot_end_received(end)
    }

    /// Replication frame: a prepare shipped by the active node.
    pub fn prepare_received(
        &self,
        item: Item,
        overwriting_prepare_seqno: Option<SeqNo>,
    ) -> Result<(), DurabilityError> {
        let seqno = item.by_seqno;
        let result = self
            .monitor
            .read()
            .unwrap()
            .add_sync_write(item, overwriting_prepare_seqno);
        if result.is_ok() {
            self.note_seqno(seqno);
        }
        result
    }

    /// Replication frame: commit for a tracked prepare.
    pub fn commit_received(
        &self,
        key: &[u8],
        prepare_seqno: SeqNo,
        commit_seqno: SeqNo,
    ) -> Result<(), DurabilityError> {
        let result = self.monitor.read().unwrap().complete_sync_write(
            key,
            Resolution::Commit,
            Some(prepare_seqno),
        );
        if result.is_ok() {
            self.note_seqno(commit_seqno);
        }
        result
    }

    /// Replication frame: abort for a tracked prepare.
    pub fn abort_received(
        &self,
        key: &[u8],
        prepare_seqno: SeqNo,
        abort_seqno: SeqNo,
    ) -> Result<(), DurabilityError> {
        let result = self.monitor.read().unwrap().complete_sync_write(
            key,
            Resolution::Abort,
            Some(prepare_seqno),
        );
        if result.is_ok() {
            self.note_seqno(abort_seqno);
        }
        result
    }

    /// The flusher persisted everything up to `seqno`.
    pub fn notify_persistence(&self, seqno: SeqNo) {
        let mut current = self.shared.persistence_seqno.load(Ordering::Acquire);
        while seqno > current {
            match self.shared.persistence_seqno.compare_exchange(
                current,
                seqno,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.monitor.read().unwrap().notify_local_persistence();
    }

    /// Promote this vbucket to active: record the history branch and convert
    /// the monitor, preserving seqnos and outstanding prepares.
    pub fn promote(
        &self,
        node_id: NodeId,
        completion_sink: Arc<dyn CompletionSink>,
        topology: ReplicationTopology,
        now: Instant,
    ) -> Result<(), DurabilityError> {
        let mut monitor = self.monitor.write().unwrap();
        if matches!(&*monitor, DurabilityMonitor::Active(_)) {
            return Err(DurabilityError::LogicError(
                "vbucket is already active".into(),
            ));
        }
        self.failover.create_entry(self.high_seqno());
        let placeholder = DurabilityMonitor::Passive(PassiveDurabilityMonitor::new(
            self.shared.clone(),
        ));
        let DurabilityMonitor::Passive(pdm) = std::mem::replace(&mut *monitor, placeholder)
        else {
            unreachable!("checked above");
        };
        *monitor = DurabilityMonitor::Active(ActiveDurabilityMonitor::from_passive(
            pdm,
            node_id,
            completion_sink,
            topology,
            now,
        ));
        tracing::info!(vb = self.shared.id, "vbucket promoted to active");
        Ok(())
    }

    /// Demote this vbucket to replica, preserving seqnos and outstanding
    /// prepares.
    pub fn demote(&self) -> Result<(), DurabilityError> {
        let mut monitor = self.monitor.write().unwrap();
        if matches!(&*monitor, DurabilityMonitor::Passive(_)) {
            return Err(DurabilityError::LogicError(
                "vbucket is already a replica".into(),
            ));
        }
        let placeholder = DurabilityMonitor::Passive(PassiveDurabilityMonitor::new(
            self.shared.clone(),
        ));
        let DurabilityMonitor::Active(adm) = std::mem::replace(&mut *monitor, placeholder)
        else {
            unreachable!("checked above");
        };
        *monitor = DurabilityMonitor::Passive(adm.into_passive()?);
        tracing::info!(vb = self.shared.id, "vbucket demoted to replica");
        Ok(())
    }

    fn note_seqno(&self, seqno: SeqNo) {
        let mut current = self.shared.high_seqno.load(Ordering::Acquire);
        while seqno > current {
            match self.shared.high_seqno.compare_exchange(
                current,
                seqno,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}
