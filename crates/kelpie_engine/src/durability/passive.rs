//! Passive (replica-side) durability monitor.
//!
//! Tracks prepares shipped from the active node and surfaces the high
//! prepared seqno (HPS) that may be acked back, subject to durability levels
//! and local persistence. The HPS moves under these constraints:
//!
//! - nothing is acked before a complete snapshot has been received;
//! - `Majority` and `MajorityAndPersistOnMaster` prepares are satisfied as
//!   soon as their snapshot is complete;
//! - a `PersistToMajority` prepare is a durability fence: the HPS cannot pass
//!   it until the whole snapshot containing it is persisted;
//! - inside a disk snapshot nothing may be acked until the snapshot is fully
//!   persisted, because deduplication may have dropped prepares; once it is,
//!   the HPS jumps to the snapshot end even if no prepare sits there.

use std::sync::{Arc, Mutex, RwLock};

use crate::config;
use crate::{Monotonic, SeqNo};

use super::snapshot::{SnapshotTracker, SnapshotType};
use super::types::{
    DurabilityError, DurabilityLevel, Item, Resolution, SyncWrite, Timeout, TrackedWrites,
};

/// Environment a monitor needs from its owning vbucket: the persistence
/// oracle, the snapshot mode flag, and the outbound seqno-ack path.
pub trait VBucketContext: Send + Sync {
    fn persistence_seqno(&self) -> SeqNo;
    fn is_receiving_disk_snapshot(&self) -> bool;
    fn send_seqno_ack(&self, seqno: SeqNo);
}

/// Counters and positions exposed for stats collection.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassiveDmStats {
    pub high_prepared_seqno: SeqNo,
    pub high_completed_seqno: SeqNo,
    pub num_tracked: usize,
    pub highest_tracked_seqno: SeqNo,
    pub total_accepted: u64,
    pub total_committed: u64,
    pub total_aborted: u64,
}

#[derive(Debug)]
struct State {
    tracked_writes: TrackedWrites,
    snapshots: SnapshotTracker,
    high_prepared_seqno: Monotonic,
    high_completed_seqno: Monotonic,
    total_accepted: u64,
    total_committed: u64,
    total_aborted: u64,
}

pub struct PassiveDurabilityMonitor {
    ctx: Arc<dyn VBucketContext>,
    state: RwLock<State>,
    /// Latest HPS awaiting ack. Written under the state lock's release path,
    /// drained outside it so the ack never runs under the state lock.
    seqno_to_ack: Mutex<SeqNo>,
}

impl std::fmt::Debug for PassiveDurabilityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap();
        f.debug_struct("PassiveDurabilityMonitor")
            .field("high_prepared_seqno", &state.high_prepared_seqno.get())
            .field("high_completed_seqno", &state.high_completed_seqno.get())
            .field("num_tracked", &state.tracked_writes.len())
            .finish()
    }
}

impl PassiveDurabilityMonitor {
    pub fn new(ctx: Arc<dyn VBucketContext>) -> PassiveDurabilityMonitor {
        PassiveDurabilityMonitor::with_seqnos(ctx, 0, 0)
    }

    /// Resume from persisted high prepared / completed seqnos.
    pub fn with_seqnos(
        ctx: Arc<dyn VBucketContext>,
        high_prepared_seqno: SeqNo,
        high_completed_seqno: SeqNo,
    ) -> PassiveDurabilityMonitor {
        PassiveDurabilityMonitor {
            ctx,
            state: RwLock::new(State {
                tracked_writes: TrackedWrites::new(),
                snapshots: SnapshotTracker::new(),
                high_prepared_seqno: Monotonic::with_initial(
                    "PassiveDM::highPreparedSeqno",
                    high_prepared_seqno,
                ),
                high_completed_seqno: Monotonic::with_initial(
                    "PassiveDM::highCompletedSeqno",
                    high_completed_seqno,
                ),
                total_accepted: 0,
                total_committed: 0,
                total_aborted: 0,
            }),
            seqno_to_ack: Mutex::new(0),
        }
    }

    /// Resume from persisted seqnos plus prepares recovered from the log.
    ///
    /// Recovered prepares at or below the high completed seqno have already
    /// been resolved; they stay tracked only until local persistence lets the
    /// removal fence pass them, so they are marked completed up front.
    pub fn with_outstanding_prepares(
        ctx: Arc<dyn VBucketContext>,
        high_prepared_seqno: SeqNo,
        high_completed_seqno: SeqNo,
        prepares: Vec<Item>,
    ) -> Result<PassiveDurabilityMonitor, DurabilityError> {
        let pdm = PassiveDurabilityMonitor::with_seqnos(ctx, high_prepared_seqno, high_completed_seqno);
        {
            let mut state = pdm.state.write().unwrap();
            for mut item in prepares {
                item.timeout = Timeout::Infinite;
                let completed = item.by_seqno <= high_completed_seqno;
                let mut write = SyncWrite::from_item(item, None);
                if completed {
                    write.set_completed();
                }
                state.tracked_writes.push_back(write)?;
            }
        }
        Ok(pdm)
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

    pub fn highest_tracked_seqno(&self) -> SeqNo {
        let state = self.state.read().unwrap();
        state.tracked_writes.back().map_or(0, |w| w.by_seqno())
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

    pub fn stats(&self) -> PassiveDmStats {
        let state = self.state.read().unwrap();
        PassiveDmStats {
            high_prepared_seqno: state.high_prepared_seqno.get(),
            high_completed_seqno: state.high_completed_seqno.get(),
            num_tracked: state.tracked_writes.len(),
            highest_tracked_seqno: state.tracked_writes.back().map_or(0, |w| w.by_seqno()),
            total_accepted: state.total_accepted,
            total_committed: state.total_committed,
            total_aborted: state.total_aborted,
        }
    }

    /// Track a new prepare shipped from the active node.
    ///
    /// If `overwriting_prepare_seqno` is set, the earlier prepare for the
    /// same key is dropped first (the active deduplicated it).
    pub fn add_sync_write(
        &self,
        item: Item,
        overwriting_prepare_seqno: Option<SeqNo>,
    ) -> Result<(), DurabilityError> {
        if item.level == DurabilityLevel::None {
            return Err(DurabilityError::InvalidArgument(
                "cannot track a sync write with level None".into(),
            ));
        }
        if item.timeout == Timeout::Default {
            return Err(DurabilityError::InvalidArgument(
                "timeout is the default sentinel; the active node must supply an explicit value"
                    .into(),
            ));
        }

        let mut state = self.state.write().unwrap();

        if let Some(overwriting) = overwriting_prepare_seqno {
            if let Some(idx) = state.tracked_writes.find_key(&item.key) {
                let found = state.tracked_writes.get(idx).unwrap().by_seqno();
                if found != overwriting {
                    return Err(DurabilityError::LogicError(format!(
                        "overwriting prepare seqno {overwriting} does not match tracked seqno {found}"
                    )));
                }
                state.tracked_writes.remove_at(idx);
            }
        }

        if config::dev_asserts_enabled() {
            let duplicate = state
                .tracked_writes
                .iter()
                .any(|w| !w.is_completed() && w.key() == item.key.as_slice());
            if duplicate {
                return Err(DurabilityError::LogicError(format!(
                    "uncompleted duplicate already tracked for key while adding prepare at seqno {}",
                    item.by_seqno
                )));
            }
        }

        state.tracked_writes.push_back(SyncWrite::from_item(item, None))?;
        state.total_accepted += 1;
        Ok(())
    }

    /// Record a snapshot-end marker and re-run HPS advancement. Emits at most
    /// one outbound seqno ack.
    pub fn notify_snapshot_end_received(&self, end: SeqNo) -> Result<(), DurabilityError> {
        {
            let mut state = self.state.write().unwrap();
            let kind = if self.ctx.is_receiving_disk_snapshot() {
                SnapshotType::Disk
            } else {
                SnapshotType::Memory
            };
            state.snapshots.push(end, kind)?;

            let prev = state.high_prepared_seqno.get();
            state.update_high_prepared_seqno(self.ctx.as_ref());
            self.store_seqno_ack(prev, state.high_prepared_seqno.get());
        }
        self.send_seqno_ack();
        Ok(())
    }

    /// Re-run HPS advancement after the flusher moved the persistence seqno.
    /// Idempotent when no persistence progress happened.
    pub fn notify_local_persistence(&self) {
        {
            let mut state = self.state.write().unwrap();
            let prev = state.high_prepared_seqno.get();
            state.update_high_prepared_seqno(self.ctx.as_ref());
            self.store_seqno_ack(prev, state.high_prepared_seqno.get());
        }
        self.send_seqno_ack();
    }

    /// Resolve a tracked prepare with a commit, abort, or dedup placeholder.
    ///
    /// Outside a disk snapshot completions must arrive in prepare order: the
    /// first tracked write past the high completed seqno must carry `key`.
    /// During a disk snapshot completions may be out of order because
    /// deduplication can drop prepares, so the matching key is searched from
    /// the front, and a commit whose prepare seqno is already at or below the
    /// HCS leaves the HCS where it is.
    pub fn complete_sync_write(
        &self,
        key: &[u8],
        resolution: Resolution,
        prepare_seqno: Option<SeqNo>,
    ) -> Result<(), DurabilityError> {
        let mut state = self.state.write().unwrap();

        if state.tracked_writes.is_empty() {
            return Err(DurabilityError::LogicError(format!(
                "no tracked writes, but received {} for key {:?}",
                resolution.as_str(),
                String::from_utf8_lossy(key)
            )));
        }

        let ordered = !self.ctx.is_receiving_disk_snapshot();

        let idx = if ordered {
            state.tracked_writes.index_after(state.high_completed_seqno.get())
        } else {
            state.tracked_writes.find_uncompleted_key(key)
        };
        let Some(idx) = idx else {
            return Err(DurabilityError::LogicError(format!(
                "no prepare awaiting completion, but received {} for key {:?}",
                resolution.as_str(),
                String::from_utf8_lossy(key)
            )));
        };

        let (found_key, found_seqno) = {
            let write = state.tracked_writes.get(idx).unwrap();
            (write.key().to_vec(), write.by_seqno())
        };

        if ordered && found_key != key {
            return Err(DurabilityError::LogicError(format!(
                "pending resolution for key {:?} at seqno {found_seqno}, but received {} for key {:?}",
                String::from_utf8_lossy(&found_key),
                resolution.as_str(),
                String::from_utf8_lossy(key)
            )));
        }

        if let Some(expected) = prepare_seqno {
            if found_seqno != expected {
                return Err(DurabilityError::LogicError(format!(
                    "pending resolution for key {:?} at seqno {found_seqno}, but received {} with prepare seqno {expected}",
                    String::from_utf8_lossy(&found_key),
                    resolution.as_str()
                )));
            }
        }

        if ordered || found_seqno > state.high_completed_seqno.get() {
            // Update the counter first so a monotonicity failure aborts
            // before any state change.
            state.high_completed_seqno.set(found_seqno);
        }

        state.tracked_writes.get_mut(idx).unwrap().set_completed();

        // The HCS moved, which can make prepares eligible for removal.
        state.check_for_and_remove_prepares();

        match resolution {
            Resolution::Commit => state.total_committed += 1,
            Resolution::Abort => state.total_aborted += 1,
            Resolution::CompletionWasDeduped => {
                if ordered {
                    tracing::debug!(
                        seqno = found_seqno,
                        "deduped completion received outside a disk snapshot"
                    );
                }
            }
        }
        Ok(())
    }

    /// Tear the monitor apart for conversion to the active form.
    pub fn into_parts(self) -> (Arc<dyn VBucketContext>, SeqNo, SeqNo, Vec<SyncWrite>) {
        let state = self.state.into_inner().unwrap();
        (
            self.ctx,
            state.high_prepared_seqno.get(),
            state.high_completed_seqno.get(),
            state.tracked_writes.into_writes(),
        )
    }

    fn store_seqno_ack(&self, prev: SeqNo, new: SeqNo) {
        if prev != new {
            let mut pending = self.seqno_to_ack.lock().unwrap();
            if *pending < new {
                *pending = new;
            }
        }
    }

    fn send_seqno_ack(&self) {
        // Hold the mailbox lock throughout so concurrent acks cannot race.
        let mut pending = self.seqno_to_ack.lock().unwrap();
        if *pending != 0 {
            self.ctx.send_seqno_ack(*pending);
        }
        *pending = 0;
    }
}

impl State {
    fn update_high_prepared_seqno(&mut self, ctx: &dyn VBucketContext) {
        let prev = self.high_prepared_seqno.get();

        while let Some(snapshot) = self.snapshots.front() {
            let fully_persisted = ctx.persistence_seqno() >= snapshot.seqno;
            let is_disk = snapshot.kind == SnapshotType::Disk;

            let max_level = if fully_persisted {
                // Received and persisted the entire snapshot; every level is
                // satisfied up to the snapshot end.
                DurabilityLevel::PersistToMajority
            } else if !is_disk {
                // Received but not yet persisted a memory snapshot; anything
                // up to the durability fence may be acked.
                DurabilityLevel::MajorityAndPersistOnMaster
            } else {
                // An unpersisted disk snapshot may hide deduplicated
                // prepares; nothing moves until it is fully persisted.
                DurabilityLevel::None
            };

            loop {
                let hps = self.high_prepared_seqno.get();
                let Some(next) = self.tracked_writes.first_after(hps) else {
                    break;
                };
                if next.by_seqno() > snapshot.seqno || next.level() > max_level {
                    break;
                }
                let seqno = next.by_seqno();
                self.high_prepared_seqno.set(seqno);
            }

            if is_disk && fully_persisted {
                // Prepares deduplicated on disk never reached us, yet they
                // are persisted and must be acked: move to the snapshot end
                // even when no prepare sits there.
                self.high_prepared_seqno.set(snapshot.seqno);
            }

            let next_in_snapshot = self
                .tracked_writes
                .first_after(self.high_prepared_seqno.get())
                .is_some_and(|w| w.by_seqno() <= snapshot.seqno);
            if (is_disk && !fully_persisted) || next_in_snapshot {
                // Stopped at the durability fence inside this snapshot, or
                // the disk snapshot is not yet persisted; later snapshots
                // cannot be acked past it.
                break;
            }

            self.snapshots.pop();
        }

        if self.high_prepared_seqno.get() != prev {
            self.check_for_and_remove_prepares();
        }
    }

    fn check_for_and_remove_prepares(&mut self) {
        if self.tracked_writes.is_empty() {
            return;
        }
        let fence = self
            .high_completed_seqno
            .get()
            .min(self.high_prepared_seqno.get());
        self.tracked_writes.remove_completed_up_to(fence);
    }
}
