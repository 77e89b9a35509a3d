//! Per-vbucket failover history.
//!
//! The table holds uuid/seqno pairs, newest first, recording every point at
//! which this vbucket's history branched (promotion, restart). Replicating
//! consumers present their last known uuid and position; the table diagnoses
//! divergent histories and computes the rollback point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::SeqNo;

/// One history branch point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    #[serde(rename = "id")]
    pub uuid: u64,
    #[serde(rename = "seq")]
    pub by_seqno: SeqNo,
}

#[derive(Serialize, Deserialize)]
struct PersistedTable {
    failover_entries: Vec<FailoverEntry>,
}

/// Inputs to a rollback decision for one replicating consumer.
#[derive(Clone, Copy, Debug)]
pub struct RollbackCheck {
    pub start_seqno: SeqNo,
    pub cur_seqno: SeqNo,
    pub vb_uuid: u64,
    pub snap_start_seqno: SeqNo,
    pub snap_end_seqno: SeqNo,
    pub purge_seqno: SeqNo,
    /// Require a uuid match even when the consumer starts from zero.
    pub strict_vb_uuid_match: bool,
    /// Highest seqno of the collections in the consumer's filter, when
    /// collection-aware rollback applies.
    pub max_collection_high_seqno: Option<SeqNo>,
}

/// A required rollback: the target seqno and a human-readable reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rollback {
    pub seqno: SeqNo,
    pub reason: String,
}

struct Inner {
    /// Newest entry at the front; seqnos strictly decrease toward the back.
    table: VecDeque<FailoverEntry>,
    capacity: usize,
    erroneous_entries_erased: u64,
    cached_json: Option<String>,
}

/// The table itself. A single mutex guards the list; the newest uuid is also
/// mirrored into an atomic so hot-path readers skip the lock entirely.
pub struct FailoverTable {
    inner: Mutex<Inner>,
    latest_uuid: AtomicU64,
}

impl std::fmt::Debug for FailoverTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("FailoverTable")
            .field("entries", &inner.table)
            .field("capacity", &inner.capacity)
            .finish()
    }
}

fn generate_uuid() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let uuid: u64 = rng.gen();
        if uuid != 0 {
            return uuid;
        }
    }
}

impl FailoverTable {
    /// A fresh table starts with a single entry at seqno 0.
    pub fn new(capacity: usize) -> FailoverTable {
        let entry = FailoverEntry {
            uuid: generate_uuid(),
            by_seqno: 0,
        };
        FailoverTable {
            inner: Mutex::new(Inner {
                table: VecDeque::from([entry]),
                capacity: capacity.max(1),
                erroneous_entries_erased: 0,
                cached_json: None,
            }),
            latest_uuid: AtomicU64::new(entry.uuid),
        }
    }

    /// Load a persisted table. Corrupt input discards the persisted state
    /// and synthesizes a single entry at `high_seqno`; entries above
    /// `high_seqno` (or out of order) are dropped the same way.
    pub fn from_json(json: &str, capacity: usize, high_seqno: SeqNo) -> FailoverTable {
        let capacity = capacity.max(1);
        let (mut table, mut erased): (VecDeque<FailoverEntry>, u64) =
            match serde_json::from_str::<PersistedTable>(json) {
                Ok(persisted) => (persisted.failover_entries.into(), 0),
                Err(err) => {
                    tracing::warn!(error = %err, "discarding corrupt failover table");
                    (VecDeque::new(), 1)
                }
            };

        // Drop entries above the vbucket's high seqno or violating the
        // newest-first ordering.
        let mut sanitized = VecDeque::new();
        let mut prev_seqno: Option<SeqNo> = None;
        for entry in table.drain(..) {
            let ordered = prev_seqno.map_or(true, |prev| entry.by_seqno < prev);
            if entry.uuid == 0 || entry.by_seqno > high_seqno || !ordered {
                erased += 1;
                continue;
            }
            prev_seqno = Some(entry.by_seqno);
            sanitized.push_back(entry);
        }
        if sanitized.is_empty() {
            sanitized.push_back(FailoverEntry {
                uuid: generate_uuid(),
                by_seqno: high_seqno,
            });
        }
        while sanitized.len() > capacity {
            sanitized.pop_back();
            erased += 1;
        }
        if erased > 0 {
            tracing::warn!(erased, "erased erroneous failover entries on load");
        }

        let latest = sanitized.front().unwrap().uuid;
        FailoverTable {
            inner: Mutex::new(Inner {
                table: sanitized,
                capacity,
                erroneous_entries_erased: erased,
                cached_json: None,
            }),
            latest_uuid: AtomicU64::new(latest),
        }
    }

    /// Record a new branch at `high_seqno`. A repeated call with the same
    /// seqno is a no-op; otherwise entries at or above it are dropped first
    /// and the oldest entry falls off once the capacity is exceeded.
    pub fn create_entry(&self, high_seqno: SeqNo) {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .table
            .front()
            .is_some_and(|front| front.by_seqno == high_seqno)
        {
            return;
        }
        while inner
            .table
            .front()
            .is_some_and(|front| front.by_seqno >= high_seqno)
        {
            inner.table.pop_front();
        }
        let entry = FailoverEntry {
            uuid: generate_uuid(),
            by_seqno: high_seqno,
        };
        inner.table.push_front(entry);
        while inner.table.len() > inner.capacity {
            inner.table.pop_back();
        }
        inner.cached_json = None;
        self.latest_uuid.store(entry.uuid, Ordering::Release);
    }

    pub fn latest_entry(&self) -> FailoverEntry {
        let inner = self.inner.lock().unwrap();
        *inner.table.front().expect("failover table never empty")
    }

    /// Lock-free read of the newest uuid.
    pub fn latest_uuid(&self) -> u64 {
        self.latest_uuid.load(Ordering::Acquire)
    }

    /// Drop the newest entry (stream takeover handshake).
    pub fn remove_latest_entry(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.table.len() <= 1 {
            return;
        }
        inner.table.pop_front();
        inner.cached_json = None;
        let latest = inner.table.front().map_or(0, |e| e.uuid);
        self.latest_uuid.store(latest, Ordering::Release);
    }

    /// Last seqno covered by the branch with `uuid`: the seqno of the entry
    /// immediately newer. For the newest branch the upper bound is the
    /// vbucket's live high seqno, which the table cannot know.
    pub fn last_seqno_for_uuid(&self, uuid: u64) -> Option<SeqNo> {
        let inner = self.inner.lock().unwrap();
        let pos = inner.table.iter().position(|e| e.uuid == uuid)?;
        if pos == 0 {
            None
        } else {
            Some(inner.table[pos - 1].by_seqno)
        }
    }

    /// Remove every entry above `seqno`. Used after a rollback completes.
    pub fn prune_entries(&self, seqno: SeqNo) {
        let mut inner = self.inner.lock().unwrap();
        while inner
            .table
            .front()
            .is_some_and(|front| front.by_seqno > seqno)
        {
            inner.table.pop_front();
        }
        if inner.table.is_empty() {
            inner.table.push_back(FailoverEntry {
                uuid: generate_uuid(),
                by_seqno: seqno,
            });
        }
        inner.cached_json = None;
        let latest = inner.table.front().map_or(0, |e| e.uuid);
        self.latest_uuid.store(latest, Ordering::Release);
    }

    pub fn num_entries(&self) -> usize {
        self.inner.lock().unwrap().table.len()
    }

    pub fn num_erroneous_entries_erased(&self) -> u64 {
        self.inner.lock().unwrap().erroneous_entries_erased
    }

    /// Current entries, newest first, for a stream's failover log.
    pub fn failover_log(&self) -> Vec<FailoverEntry> {
        self.inner.lock().unwrap().table.iter().copied().collect()
    }

    /// Persisted JSON form, newest entry first. Cached until a mutation.
    pub fn to_json(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cached) = &inner.cached_json {
            return cached.clone();
        }
        let persisted = PersistedTable {
            failover_entries: inner.table.iter().copied().collect(),
        };
        let json = serde_json::to_string(&persisted).expect("failover table serializes");
        inner.cached_json = Some(json.clone());
        json
    }

    /// Decide whether a consumer resuming from `check.start_seqno` needs to
    /// roll back, and to where. Returns `None` when the consumer can resume
    /// in place.
    pub fn needs_rollback(&self, check: RollbackCheck) -> Option<Rollback> {
        // A consumer starting from zero has nothing to diverge from.
        if check.start_seqno == 0 && !check.strict_vb_uuid_match {
            return None;
        }

        // A consumer that had consumed its whole snapshot is effectively at
        // a clean boundary; collapse the snapshot onto the start point.
        let snap_start = if check.start_seqno == check.snap_end_seqno {
            check.start_seqno
        } else {
            check.snap_start_seqno
        };

        let inner = self.inner.lock().unwrap();
        let pos = inner.table.iter().position(|e| e.uuid == check.vb_uuid);
        let Some(pos) = pos else {
            return Some(Rollback {
                seqno: 0,
                reason: format!(
                    "vb-uuid {:#x} not found in failover table, consumer must restart from zero",
                    check.vb_uuid
                ),
            });
        };

        let matched = inner.table[pos];
        let upper_bound = if pos == 0 {
            check.cur_seqno
        } else {
            inner.table[pos - 1].by_seqno
        };
        drop(inner);

        if check.start_seqno >= matched.by_seqno && check.start_seqno <= upper_bound {
            return None;
        }

        let mut seqno = matched.by_seqno.min(snap_start);
        let mut reason = format!(
            "start seqno {} outside [{}, {}] for matched branch {:#x}",
            check.start_seqno, matched.by_seqno, upper_bound, matched.uuid
        );
        if check.purge_seqno > seqno {
            seqno = 0;
            reason = format!(
                "rollback point {} already purged (purge seqno {})",
                matched.by_seqno.min(snap_start),
                check.purge_seqno
            );
        }

        // Collection filters can only lower the target: if everything the
        // consumer watches sits below the computed point, resume from there.
        if let Some(collection_high) = check.max_collection_high_seqno {
            if collection_high <= seqno {
                seqno = collection_high;
                reason.push_str("; lowered to collection high seqno");
            }
        }

        Some(Rollback { seqno, reason })
    }
}
