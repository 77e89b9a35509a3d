//! Sync-write entries and the per-vbucket tracking container.

use std::collections::VecDeque;
use std::time::Instant;

use crate::SeqNo;

/// Durability requirement levels, ordered by strength.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DurabilityLevel {
    None,
    Majority,
    MajorityAndPersistOnMaster,
    PersistToMajority,
}

/// Sync-write timeout as carried in durability requirements.
///
/// `Default` is a sentinel meaning "the client did not say"; the active node
/// replaces it with the engine default before replicating, so a replica
/// rejects it outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    Default,
    Infinite,
    Millis(u64),
}

/// How a tracked prepare was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Commit,
    Abort,
    /// The completion itself was deduplicated away; the placeholder only
    /// unblocks removal and bumps no counter.
    CompletionWasDeduped,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Commit => "commit",
            Resolution::Abort => "abort",
            Resolution::CompletionWasDeduped => "completionWasDeduped",
        }
    }
}

/// A prepare as it arrives at a durability monitor.
#[derive(Clone, Debug)]
pub struct Item {
    pub key: Vec<u8>,
    pub by_seqno: SeqNo,
    pub level: DurabilityLevel,
    pub timeout: Timeout,
    /// Client correlation id, present only on the active node.
    pub cookie: Option<u64>,
}

/// A tracked in-flight synchronous write.
#[derive(Clone, Debug)]
pub struct SyncWrite {
    key: Vec<u8>,
    by_seqno: SeqNo,
    level: DurabilityLevel,
    timeout: Timeout,
    cookie: Option<u64>,
    deadline: Option<Instant>,
    completed: bool,
}

impl SyncWrite {
    pub fn from_item(item: Item, deadline: Option<Instant>) -> SyncWrite {
        SyncWrite {
            key: item.key,
            by_seqno: item.by_seqno,
            level: item.level,
            timeout: item.timeout,
            cookie: item.cookie,
            deadline,
            completed: false,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn by_seqno(&self) -> SeqNo {
        self.by_seqno
    }

    pub fn level(&self) -> DurabilityLevel {
        self.level
    }

    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    pub fn cookie(&self) -> Option<u64> {
        self.cookie
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn set_completed(&mut self) {
        self.completed = true;
    }
}

/// Typed failures surfaced by the durability monitors.
///
/// Both kinds are protocol violations from the peer's point of view; the
/// caller aborts the offending connection and the monitor stays consistent.
#[derive(Debug, thiserror::Error)]
pub enum DurabilityError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("logic error: {0}")]
    LogicError(String),
}

/// Ordered container of tracked sync writes.
///
/// Seqnos are strictly increasing, so positions into the container are held
/// as seqnos rather than indices; an erase can never invalidate one.
#[derive(Debug, Default)]
pub struct TrackedWrites {
    writes: VecDeque<SyncWrite>,
}

impl TrackedWrites {
    pub fn new() -> TrackedWrites {
        TrackedWrites::default()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn front(&self) -> Option<&SyncWrite> {
        self.writes.front()
    }

    pub fn back(&self) -> Option<&SyncWrite> {
        self.writes.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncWrite> {
        self.writes.iter()
    }

    pub fn push_back(&mut self, write: SyncWrite) -> Result<(), DurabilityError> {
        if let Some(back) = self.writes.back() {
            if write.by_seqno() <= back.by_seqno() {
                return Err(DurabilityError::LogicError(format!(
                    "prepare seqno {} not greater than tracked tail {}",
                    write.by_seqno(),
                    back.by_seqno()
                )));
            }
        }
        self.writes.push_back(write);
        Ok(())
    }

    /// Index of the first write with a seqno strictly greater than `seqno`.
    pub fn index_after(&self, seqno: SeqNo) -> Option<usize> {
        let idx = self.writes.partition_point(|w| w.by_seqno() <= seqno);
        (idx < self.writes.len()).then_some(idx)
    }

    /// The first write with a seqno strictly greater than `seqno`.
    pub fn first_after(&self, seqno: SeqNo) -> Option<&SyncWrite> {
        self.index_after(seqno).map(|idx| &self.writes[idx])
    }

    pub fn get(&self, idx: usize) -> Option<&SyncWrite> {
        self.writes.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut SyncWrite> {
        self.writes.get_mut(idx)
    }

    /// Index of the first write with `key`, completed or not.
    pub fn find_key(&self, key: &[u8]) -> Option<usize> {
        self.writes.iter().position(|w| w.key() == key)
    }

    /// Index of the first uncompleted write with `key`.
    pub fn find_uncompleted_key(&self, key: &[u8]) -> Option<usize> {
        self.writes
            .iter()
            .position(|w| !w.is_completed() && w.key() == key)
    }

    pub fn remove_at(&mut self, idx: usize) -> Option<SyncWrite> {
        self.writes.remove(idx)
    }

    /// Remove every completed write with a seqno at or below `fence`,
    /// returning how many were dropped. Uncompleted writes below the fence
    /// stay tracked until their completion arrives.
    pub fn remove_completed_up_to(&mut self, fence: SeqNo) -> usize {
        let mut removed = 0;
        let mut idx = 0;
        while idx < self.writes.len() && self.writes[idx].by_seqno() <= fence {
            if self.writes[idx].is_completed() {
                self.writes.remove(idx);
                removed += 1;
            } else {
                idx += 1;
            }
        }
        removed
    }

    /// Drain the container, oldest first. Used when converting a monitor
    /// between active and passive forms.
    pub fn into_writes(self) -> Vec<SyncWrite> {
        self.writes.into()
    }
}
