//! Active (master-side) durability monitor.
//!
//! Accepts prepares from clients, assigns seqnos, aggregates seqno acks from
//! replicas across one or two topology chains, and resolves each prepare to
//! a commit or abort. Completion records are emitted through a sink after
//! the state lock is released, mirroring the replica-side ack discipline.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::config::DEFAULT_SYNC_WRITE_TIMEOUT_MS;
use crate::{Monotonic, NodeId, SeqNo};

use super::passive::{PassiveDurabilityMonitor, VBucketContext};
use super::types::{
    DurabilityError, DurabilityLevel, Item, SyncWrite, Timeout, TrackedWrites,
};

/// Receives commit and abort records as prepares resolve.
pub trait CompletionSink: Send + Sync {
    fn commit(&self, key: &[u8], prepare_seqno: SeqNo, cookie: Option<u64>);
    fn abort(&self, key: &[u8], prepare_seqno: SeqNo, cookie: Option<u64>);
}

/// Replication chains a prepare must satisfy. The first chain always holds
/// the active node; a second chain appears mid-rebalance. An empty first
/// chain is the null topology: no durability decisions can be made.
#[derive(Clone, Debug, Default)]
pub struct ReplicationTopology {
    pub first_chain: Vec<NodeId>,
    pub second_chain: Option<Vec<NodeId>>,
}

impl ReplicationTopology {
    pub fn chains(&self) -> impl Iterator<Item = &[NodeId]> {
        std::iter::once(self.first_chain.as_slice())
            .chain(self.second_chain.as_deref().into_iter())
    }

    pub fn is_null(&self) -> bool {
        self.first_chain.is_empty()
    }
}

enum Outcome {
    Commit,
    Abort,
}

struct CompletionRecord {
    key: Vec<u8>,
    prepare_seqno: SeqNo,
    cookie: Option<u64>,
    outcome: Outcome,
}

#[derive(Debug)]
struct State {
    topology: ReplicationTopology,
    tracked_writes: TrackedWrites,
    /// Highest seqno each replica has acked as prepared.
    acked: HashMap<NodeId, SeqNo>,
    last_assigned_seqno: SeqNo,
    high_prepared_seqno: Monotonic,
    high_completed_seqno: Monotonic,
    total_accepted: u64,
    total_committed: u64,
    total_aborted: u64,
}

pub struct ActiveDurabilityMonitor {
    node_id: NodeId,
    ctx: Arc<dyn VBucketContext>,
    sink: Arc<dyn CompletionSink>,
    state: RwLock<State>,
}

impl std::fmt::Debug for ActiveDurabilityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap();
        f.debug_struct("ActiveDurabilityMonitor")
            .field("node_id", &self.node_id)
            .field("high_prepared_seqno", &state.high_prepared_seqno.get())
            .field("high_completed_seqno", &state.high_completed_seqno.get())
            .field("num_tracked", &state.tracked_writes.len())
            .finish()
    }
}

impl ActiveDurabilityMonitor {
    pub fn new(
        node_id: NodeId,
        ctx: Arc<dyn VBucketContext>,
        sink: Arc<dyn CompletionSink>,
        topology: ReplicationTopology,
    ) -> ActiveDurabilityMonitor {
        ActiveDurabilityMonitor {
            node_id,
            ctx,
            sink,
            state: RwLock::new(State {
                topology,
                tracked_writes: TrackedWrites::new(),
                acked: HashMap::new(),
                last_assigned_seqno: 0,
                high_prepared_seqno: Monotonic::new("ActiveDM::highPreparedSeqno"),
                high_completed_seqno: Monotonic::new("ActiveDM::highCompletedSeqno"),
                total_accepted: 0,
                total_committed: 0,
                total_aborted: 0,
            }),
        }
    }

    /// Promote a replica's monitor, preserving its seqnos and any prepares
    /// still awaiting resolution. The preserved prepares keep waiting for
    /// acks under the new topology; their timeout clock restarts now.
    pub fn from_passive(
        pdm: PassiveDurabilityMonitor,
        node_id: NodeId,
        sink: Arc<dyn CompletionSink>,
        topology: ReplicationTopology,
        now: Instant,
    ) -> ActiveDurabilityMonitor {
        let (ctx, hps, hcs, writes) = pdm.into_parts();
        let adm = ActiveDurabilityMonitor::new(node_id, ctx, sink, topology);
        {
            let mut state = adm.state.write().unwrap();
            state.high_prepared_seqno.set(hps);
            state.high_completed_seqno.set(hcs);
            state.last_assigned_seqno = hps.max(hcs);
            for write in writes {
                state.last_assigned_seqno = state.last_assigned_seqno.max(write.by_seqno());
                let deadline = match write.timeout() {
                    Timeout::Millis(ms) => Some(now + Duration::from_millis(ms)),
                    Timeout::Infinite | Timeout::Default => None,
                };
                let item = Item {
                    key: write.key().to_vec(),
                    by_seqno: write.by_seqno(),
                    level: write.level(),
                    timeout: write.timeout(),
                    cookie: write.cookie(),
                };
                let mut preserved = SyncWrite::from_item(item, deadline);
                if write.is_completed() {
                    preserved.set_completed();
                }
                // Seqnos were validated by the passive container already.
                let _ = state.tracked_writes.push_back(preserved);
            }
        }
        adm
    }

    pub fn high_prepared_seqno(&self) -> SeqNo {
        self.state.read().unwrap().high_prepared_seqno.get()
    }

    pub fn high_completed_seqno(&self) -> SeqNo {
        self.state.read().unwrap().high_completed_seqno.get()
    }

    pub fn num_tracked(&self) -> usize {
        self.state.read().unwrap().tracked_writes.len()
    }

    pub fn last_assigned_seqno(&self) -> SeqNo {
        self.state.read().unwrap().last_assigned_seqno
    }

    pub fn num_accepted(&self) -> u64 {
        self.state.read().unwrap().total_accepted
    }

    pub fn num_committed(&self) -> u64 {
        self.state.read().unwrap().total_committed
    }

    pub fn num_aborted(&self) -> u64 {
        self.state.read().unwrap().total_aborted
    }

    pub fn replication_topology(&self) -> ReplicationTopology {
        self.state.read().unwrap().topology.clone()
    }

    /// Accept a client prepare, assign its seqno, and start tracking it.
    /// A default timeout is replaced with the engine default; level `None`
    /// writes are not durable and are rejected.
    pub fn add_sync_write(
        &self,
        key: &[u8],
        level: DurabilityLevel,
        timeout: Timeout,
        cookie: Option<u64>,
        now: Instant,
    ) -> Result<SeqNo, DurabilityError> {
        if level == DurabilityLevel::None {
            return Err(DurabilityError::InvalidArgument(
                "cannot track a sync write with level None".into(),
            ));
        }
        let timeout = match timeout {
            Timeout::Default => Timeout::Millis(DEFAULT_SYNC_WRITE_TIMEOUT_MS),
            explicit => explicit,
        };

        let completions;
        let seqno;
        {
            let mut state = self.state.write().unwrap();
            if state.topology.is_null() {
                return Err(DurabilityError::LogicError(
                    "cannot accept sync writes with a null replication topology".into(),
                ));
            }
            seqno = state.last_assigned_seqno + 1;
            state.last_assigned_seqno = seqno;
            let deadline = match timeout {
                Timeout::Millis(ms) => Some(now + Duration::from_millis(ms)),
                Timeout::Infinite | Timeout::Default => None,
            };
            state.tracked_writes.push_back(SyncWrite::from_item(
                Item {
                    key: key.to_vec(),
                    by_seqno: seqno,
                    level,
                    timeout,
                    cookie,
                },
                deadline,
            ))?;
            state.total_accepted += 1;
            state.advance_high_prepared_seqno(self.ctx.as_ref());
            completions = state.check_for_commits(self.node_id, self.ctx.as_ref());
        }
        self.emit(completions);
        Ok(seqno)
    }

    /// Record a seqno ack from a replica and resolve any prepares whose
    /// chains now hold a quorum.
    pub fn seqno_ack_received(&self, node: NodeId, seqno: SeqNo) -> Result<(), DurabilityError> {
        let completions;
        {
            let mut state = self.state.write().unwrap();
            let known = state.topology.chains().any(|chain| chain.contains(&node));
            if !known {
                return Err(DurabilityError::LogicError(format!(
                    "seqno ack from node {node} which is in no replication chain"
                )));
            }
            let entry = state.acked.entry(node).or_insert(0);
            if seqno > *entry {
                *entry = seqno;
            }
            completions = state.check_for_commits(self.node_id, self.ctx.as_ref());
        }
        self.emit(completions);
        Ok(())
    }

    /// Re-evaluate local satisfaction after the flusher ran.
    pub fn notify_local_persistence(&self) {
        let completions;
        {
            let mut state = self.state.write().unwrap();
            state.advance_high_prepared_seqno(self.ctx.as_ref());
            completions = state.check_for_commits(self.node_id, self.ctx.as_ref());
        }
        self.emit(completions);
    }

    /// Abort every tracked prepare whose deadline has passed.
    pub fn process_timeouts(&self, now: Instant) {
        let completions;
        {
            let mut state = self.state.write().unwrap();
            completions = state.take_expired(now);
        }
        self.emit(completions);
    }

    /// Install a new replication topology and re-evaluate every pending
    /// prepare against it: those now satisfied commit, those that can no
    /// longer reach a quorum abort, the rest keep waiting.
    pub fn set_replication_topology(&self, topology: ReplicationTopology) {
        let completions;
        {
            let mut state = self.state.write().unwrap();
            tracing::info!(
                first_chain = ?topology.first_chain,
                second_chain = ?topology.second_chain,
                "replication topology changed"
            );
            state.topology = topology;
            if state.topology.is_null() {
                completions = state.abort_all_pending();
            } else {
                completions = state.check_for_commits(self.node_id, self.ctx.as_ref());
            }
        }
        self.emit(completions);
    }

    /// Demote to the passive form, preserving seqnos and pending prepares.
    pub fn into_passive(self) -> Result<PassiveDurabilityMonitor, DurabilityError> {
        let state = self.state.into_inner().unwrap();
        let hps = state.high_prepared_seqno.get();
        let hcs = state.high_completed_seqno.get();
        let items = state
            .tracked_writes
            .into_writes()
            .into_iter()
            .map(|w| Item {
                key: w.key().to_vec(),
                by_seqno: w.by_seqno(),
                level: w.level(),
                timeout: Timeout::Infinite,
                cookie: w.cookie(),
            })
            .collect();
        PassiveDurabilityMonitor::with_outstanding_prepares(self.ctx, hps, hcs, items)
    }

    fn emit(&self, completions: Vec<CompletionRecord>) {
        for record in completions {
            match record.outcome {
                Outcome::Commit => {
                    self.sink
                        .commit(&record.key, record.prepare_seqno, record.cookie)
                }
                Outcome::Abort => {
                    self.sink
                        .abort(&record.key, record.prepare_seqno, record.cookie)
                }
            }
        }
    }
}

impl State {
    /// A prepare is locally satisfied once the active node has done its part
    /// for the level: nothing extra for Majority, local persistence for the
    /// persisting levels.
    fn locally_satisfied(&self, write: &SyncWrite, ctx: &dyn VBucketContext) -> bool {
        match write.level() {
            DurabilityLevel::None | DurabilityLevel::Majority => true,
            DurabilityLevel::MajorityAndPersistOnMaster
            | DurabilityLevel::PersistToMajority => ctx.persistence_seqno() >= write.by_seqno(),
        }
    }

    fn advance_high_prepared_seqno(&mut self, ctx: &dyn VBucketContext) {
        loop {
            let hps = self.high_prepared_seqno.get();
            let Some(next) = self.tracked_writes.first_after(hps) else {
                break;
            };
            if !self.locally_satisfied(next, ctx) {
                break;
            }
            let seqno = next.by_seqno();
            self.high_prepared_seqno.set(seqno);
        }
    }

    /// Does `write` hold a majority in every configured chain? The active
    /// node counts toward a chain it appears in once locally satisfied.
    fn satisfied(&self, write: &SyncWrite, active: NodeId, ctx: &dyn VBucketContext) -> bool {
        if !self.locally_satisfied(write, ctx) {
            return false;
        }
        self.topology.chains().all(|chain| {
            let majority = chain.len() / 2 + 1;
            let acks = chain
                .iter()
                .filter(|&&node| {
                    if node == active {
                        true
                    } else {
                        self.acked.get(&node).copied().unwrap_or(0) >= write.by_seqno()
                    }
                })
                .count();
            acks >= majority
        })
    }

    /// Commit satisfied prepares in seqno order, stopping at the first that
    /// still waits. In-order resolution keeps the HCS monotone and at or
    /// below the HPS.
    fn check_for_commits(
        &mut self,
        active: NodeId,
        ctx: &dyn VBucketContext,
    ) -> Vec<CompletionRecord> {
        let mut completions = Vec::new();
        while let Some(front) = self.tracked_writes.front() {
            if front.is_completed() {
                // Resolved before a demote/promote round trip; it lingers
                // only until local persistence lets the fence pass it.
                let fence = self
                    .high_completed_seqno
                    .get()
                    .min(self.high_prepared_seqno.get());
                if front.by_seqno() <= fence {
                    self.tracked_writes.remove_at(0);
                    continue;
                }
                break;
            }
            if !self.satisfied(front, active, ctx) {
                break;
            }
            let seqno = front.by_seqno();
            self.high_completed_seqno.set(seqno);
            let write = self.tracked_writes.remove_at(0).unwrap();
            self.total_committed += 1;
            completions.push(CompletionRecord {
                key: write.key().to_vec(),
                prepare_seqno: seqno,
                cookie: write.cookie(),
                outcome: Outcome::Commit,
            });
        }
        completions
    }

    fn take_expired(&mut self, now: Instant) -> Vec<CompletionRecord> {
        let mut completions = Vec::new();
        let mut idx = 0;
        while idx < self.tracked_writes.len() {
            let expired = self
                .tracked_writes
                .get(idx)
                .filter(|w| !w.is_completed())
                .and_then(|w| w.deadline())
                .is_some_and(|deadline| deadline <= now);
            if expired {
                let write = self.tracked_writes.remove_at(idx).unwrap();
                self.total_aborted += 1;
                tracing::warn!(
                    seqno = write.by_seqno(),
                    level = ?write.level(),
                    "sync write timed out, aborting"
                );
                completions.push(CompletionRecord {
                    key: write.key().to_vec(),
                    prepare_seqno: write.by_seqno(),
                    cookie: write.cookie(),
                    outcome: Outcome::Abort,
                });
            } else {
                idx += 1;
            }
        }
        completions
    }

    fn abort_all_pending(&mut self) -> Vec<CompletionRecord> {
        let mut completions = Vec::new();
        while let Some(write) = self.tracked_writes.remove_at(0) {
            if write.is_completed() {
                continue;
            }
            self.total_aborted += 1;
            completions.push(CompletionRecord {
                key: write.key().to_vec(),
                prepare_seqno: write.by_seqno(),
                cookie: write.cookie(),
                outcome: Outcome::Abort,
            });
        }
        completions
    }
}
