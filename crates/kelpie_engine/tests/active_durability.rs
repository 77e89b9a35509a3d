//! Active-side durability monitor scenarios.
//!
//! Test flow:
//! 1) Build an active monitor over a recording context and completion sink.
//! 2) Feed it client prepares, replica seqno acks, persistence notifications
//!    and topology changes.
//! 3) Assert the commit/abort records emitted and the monitor's seqnos.
//!
//! Failure model covered:
//! - quorum arithmetic over one and two replication chains;
//! - the master-persistence fence for the persisting levels;
//! - per-prepare timeouts and topology changes stranding prepares;
//! - demotion/promotion preserving in-flight state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kelpie_engine::durability::{
    ActiveDurabilityMonitor, CompletionSink, DurabilityError, DurabilityLevel,
    PassiveDurabilityMonitor, ReplicationTopology, Timeout, VBucketContext,
};
use kelpie_engine::SeqNo;

const ACTIVE: u64 = 1;
const REPLICA_1: u64 = 2;
const REPLICA_2: u64 = 3;

#[derive(Default)]
struct RecordingContext {
    persistence_seqno: AtomicU64,
    receiving_disk_snapshot: AtomicBool,
    acks: Mutex<Vec<SeqNo>>,
}

impl VBucketContext for RecordingContext {
    fn persistence_seqno(&self) -> SeqNo {
        self.persistence_seqno.load(Ordering::Acquire)
    }

    fn is_receiving_disk_snapshot(&self) -> bool {
        self.receiving_disk_snapshot.load(Ordering::Acquire)
    }

    fn send_seqno_ack(&self, seqno: SeqNo) {
        self.acks.lock().unwrap().push(seqno);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Record {
    Commit { key: Vec<u8>, seqno: SeqNo },
    Abort { key: Vec<u8>, seqno: SeqNo },
}

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<Record>>,
}

impl RecordingSink {
    fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }
}

impl CompletionSink for RecordingSink {
    fn commit(&self, key: &[u8], prepare_seqno: SeqNo, _cookie: Option<u64>) {
        self.records.lock().unwrap().push(Record::Commit {
            key: key.to_vec(),
            seqno: prepare_seqno,
        });
    }

    fn abort(&self, key: &[u8], prepare_seqno: SeqNo, _cookie: Option<u64>) {
        self.records.lock().unwrap().push(Record::Abort {
            key: key.to_vec(),
            seqno: prepare_seqno,
        });
    }
}

fn one_chain() -> ReplicationTopology {
    ReplicationTopology {
        first_chain: vec![ACTIVE, REPLICA_1, REPLICA_2],
        second_chain: None,
    }
}

fn monitor(
    topology: ReplicationTopology,
) -> (
    ActiveDurabilityMonitor,
    Arc<RecordingContext>,
    Arc<RecordingSink>,
) {
    let ctx = Arc::new(RecordingContext::default());
    let sink = Arc::new(RecordingSink::default());
    let adm = ActiveDurabilityMonitor::new(ACTIVE, ctx.clone(), sink.clone(), topology);
    (adm, ctx, sink)
}

#[test]
fn majority_prepare_commits_on_first_replica_ack() {
    let (adm, _ctx, sink) = monitor(one_chain());
    let now = Instant::now();

    let seqno = adm
        .add_sync_write(b"k1", DurabilityLevel::Majority, Timeout::Default, Some(7), now)
        .unwrap();
    assert_eq!(seqno, 1);
    // The active's own ack is not a quorum of three.
    assert!(sink.records().is_empty());
    assert_eq!(adm.high_prepared_seqno(), 1);

    adm.seqno_ack_received(REPLICA_1, 1).unwrap();
    assert_eq!(sink.records(), vec![Record::Commit {
        key: b"k1".to_vec(),
        seqno: 1,
    }]);
    assert_eq!(adm.high_completed_seqno(), 1);
    assert_eq!(adm.num_tracked(), 0);
    assert!(adm.high_completed_seqno() <= adm.high_prepared_seqno());
}

#[test]
fn persist_to_majority_waits_for_master_persistence() {
    let (adm, ctx, sink) = monitor(one_chain());
    let now = Instant::now();

    adm.add_sync_write(
        b"k1",
        DurabilityLevel::PersistToMajority,
        Timeout::Default,
        None,
        now,
    )
    .unwrap();
    adm.seqno_ack_received(REPLICA_1, 1).unwrap();
    adm.seqno_ack_received(REPLICA_2, 1).unwrap();

    // Both replicas acked but the master has not persisted.
    assert!(sink.records().is_empty());
    assert_eq!(adm.high_prepared_seqno(), 0);

    ctx.persistence_seqno.store(1, Ordering::Release);
    adm.notify_local_persistence();
    assert_eq!(sink.records(), vec![Record::Commit {
        key: b"k1".to_vec(),
        seqno: 1,
    }]);
    assert!(adm.high_completed_seqno() <= adm.high_prepared_seqno());
}

#[test]
fn second_chain_must_also_reach_quorum() {
    let topology = ReplicationTopology {
        first_chain: vec![ACTIVE, REPLICA_1],
        second_chain: Some(vec![REPLICA_2]),
    };
    let (adm, _ctx, sink) = monitor(topology);
    let now = Instant::now();

    adm.add_sync_write(b"k1", DurabilityLevel::Majority, Timeout::Default, None, now)
        .unwrap();
    // First chain satisfied (active + replica 1), second chain empty-handed.
    adm.seqno_ack_received(REPLICA_1, 1).unwrap();
    assert!(sink.records().is_empty());

    adm.seqno_ack_received(REPLICA_2, 1).unwrap();
    assert_eq!(sink.records().len(), 1);
}

#[test]
fn commits_resolve_in_seqno_order() {
    let (adm, _ctx, sink) = monitor(one_chain());
    let now = Instant::now();

    adm.add_sync_write(b"a", DurabilityLevel::Majority, Timeout::Default, None, now)
        .unwrap();
    adm.add_sync_write(b"b", DurabilityLevel::Majority, Timeout::Default, None, now)
        .unwrap();

    // A single cumulative ack covers both prepares.
    adm.seqno_ack_received(REPLICA_1, 2).unwrap();
    assert_eq!(sink.records(), vec![
        Record::Commit { key: b"a".to_vec(), seqno: 1 },
        Record::Commit { key: b"b".to_vec(), seqno: 2 },
    ]);
}

#[test]
fn expired_prepares_abort() {
    let (adm, _ctx, sink) = monitor(one_chain());
    let now = Instant::now();

    adm.add_sync_write(
        b"slow",
        DurabilityLevel::Majority,
        Timeout::Millis(10),
        None,
        now,
    )
    .unwrap();
    adm.add_sync_write(
        b"patient",
        DurabilityLevel::Majority,
        Timeout::Infinite,
        None,
        now,
    )
    .unwrap();

    adm.process_timeouts(now + Duration::from_millis(5));
    assert!(sink.records().is_empty());

    adm.process_timeouts(now + Duration::from_millis(20));
    assert_eq!(sink.records(), vec![Record::Abort {
        key: b"slow".to_vec(),
        seqno: 1,
    }]);
    assert_eq!(adm.num_tracked(), 1);
    assert_eq!(adm.num_aborted(), 1);
}

#[test]
fn topology_change_commits_newly_satisfied_prepares() {
    let (adm, _ctx, sink) = monitor(one_chain());
    let now = Instant::now();

    adm.add_sync_write(b"k1", DurabilityLevel::Majority, Timeout::Default, None, now)
        .unwrap();
    adm.seqno_ack_received(REPLICA_1, 1).unwrap();
    // Three-node chain needs two acks; replica 1 alone plus the active makes
    // two, so this committed already. Add another prepare that is stuck.
    sink.records.lock().unwrap().clear();

    adm.add_sync_write(b"k2", DurabilityLevel::Majority, Timeout::Default, None, now)
        .unwrap();
    assert!(sink.records().is_empty());

    // Shrinking the chain to just the active satisfies the quorum of one.
    adm.set_replication_topology(ReplicationTopology {
        first_chain: vec![ACTIVE],
        second_chain: None,
    });
    assert_eq!(sink.records(), vec![Record::Commit {
        key: b"k2".to_vec(),
        seqno: 2,
    }]);
}

#[test]
fn null_topology_aborts_everything_pending() {
    let (adm, _ctx, sink) = monitor(one_chain());
    let now = Instant::now();

    adm.add_sync_write(b"k1", DurabilityLevel::Majority, Timeout::Default, None, now)
        .unwrap();
    adm.add_sync_write(b"k2", DurabilityLevel::Majority, Timeout::Default, None, now)
        .unwrap();

    adm.set_replication_topology(ReplicationTopology::default());
    assert_eq!(sink.records(), vec![
        Record::Abort { key: b"k1".to_vec(), seqno: 1 },
        Record::Abort { key: b"k2".to_vec(), seqno: 2 },
    ]);

    // With no topology, new sync writes cannot be accepted at all.
    let err = adm
        .add_sync_write(b"k3", DurabilityLevel::Majority, Timeout::Default, None, now)
        .unwrap_err();
    assert!(matches!(err, DurabilityError::LogicError(_)));
}

#[test]
fn acks_from_unknown_nodes_are_rejected() {
    let (adm, _ctx, _sink) = monitor(one_chain());
    let err = adm.seqno_ack_received(99, 1).unwrap_err();
    assert!(matches!(err, DurabilityError::LogicError(_)));
}

#[test]
fn level_none_is_rejected() {
    let (adm, _ctx, _sink) = monitor(one_chain());
    let err = adm
        .add_sync_write(
            b"k",
            DurabilityLevel::None,
            Timeout::Default,
            None,
            Instant::now(),
        )
        .unwrap_err();
    assert!(matches!(err, DurabilityError::InvalidArgument(_)));
}

#[test]
fn demotion_preserves_seqnos_and_pending_prepares() {
    let (adm, _ctx, sink) = monitor(one_chain());
    let now = Instant::now();

    adm.add_sync_write(b"done", DurabilityLevel::Majority, Timeout::Default, None, now)
        .unwrap();
    adm.seqno_ack_received(REPLICA_1, 1).unwrap();
    adm.add_sync_write(b"pending", DurabilityLevel::Majority, Timeout::Default, None, now)
        .unwrap();
    assert_eq!(sink.records().len(), 1);

    let pdm = adm.into_passive().unwrap();
    assert_eq!(pdm.high_prepared_seqno(), 2);
    assert_eq!(pdm.high_completed_seqno(), 1);
    assert_eq!(pdm.num_tracked(), 1);
    assert_eq!(pdm.highest_tracked_seqno(), 2);
}

#[test]
fn promotion_resumes_from_replica_state() {
    use kelpie_engine::durability::Item;

    let ctx = Arc::new(RecordingContext::default());
    let pdm = PassiveDurabilityMonitor::with_outstanding_prepares(
        ctx.clone(),
        10,
        10,
        vec![Item {
            key: b"carried".to_vec(),
            by_seqno: 11,
            level: DurabilityLevel::Majority,
            timeout: Timeout::Infinite,
            cookie: None,
        }],
    )
    .unwrap();

    let sink = Arc::new(RecordingSink::default());
    let now = Instant::now();
    let adm =
        ActiveDurabilityMonitor::from_passive(pdm, ACTIVE, sink.clone(), one_chain(), now);

    assert_eq!(adm.high_prepared_seqno(), 10);
    assert_eq!(adm.high_completed_seqno(), 10);
    assert_eq!(adm.num_tracked(), 1);

    // New prepares continue the seqno space past the carried one.
    let seqno = adm
        .add_sync_write(b"new", DurabilityLevel::Majority, Timeout::Default, None, now)
        .unwrap();
    assert_eq!(seqno, 12);

    // Acks resolve the carried prepare first, in order.
    adm.seqno_ack_received(REPLICA_1, 12).unwrap();
    assert_eq!(sink.records(), vec![
        Record::Commit { key: b"carried".to_vec(), seqno: 11 },
        Record::Commit { key: b"new".to_vec(), seqno: 12 },
    ]);
}
