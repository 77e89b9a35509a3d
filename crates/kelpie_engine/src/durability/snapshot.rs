//! Queue of received snapshot-end markers.

use std::collections::VecDeque;

use crate::SeqNo;

use super::types::DurabilityError;

/// Whether the snapshot was streamed from a peer's memory or backfilled from
/// disk. Disk snapshots may have had prepares deduplicated away, which
/// changes how far the passive monitor may ack inside them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotType {
    Memory,
    Disk,
}

/// End seqno of one received snapshot.
#[derive(Clone, Copy, Debug)]
pub struct SnapshotEnd {
    pub seqno: SeqNo,
    pub kind: SnapshotType,
}

/// FIFO of snapshot ends in arrival order. The front is the currently-open
/// snapshot. No locking of its own; lives inside the monitor state.
#[derive(Debug, Default)]
pub struct SnapshotTracker {
    pending: VecDeque<SnapshotEnd>,
    last_pushed_end: SeqNo,
}

impl SnapshotTracker {
    pub fn new() -> SnapshotTracker {
        SnapshotTracker::default()
    }

    pub fn push(&mut self, seqno: SeqNo, kind: SnapshotType) -> Result<(), DurabilityError> {
        if seqno <= self.last_pushed_end {
            return Err(DurabilityError::LogicError(format!(
                "snapshot end {seqno} not greater than previous end {}",
                self.last_pushed_end
            )));
        }
        self.last_pushed_end = seqno;
        self.pending.push_back(SnapshotEnd { seqno, kind });
        Ok(())
    }

    pub fn front(&self) -> Option<SnapshotEnd> {
        self.pending.front().copied()
    }

    pub fn pop(&mut self) {
        self.pending.pop_front();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
