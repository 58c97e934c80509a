//! Queue of ledger operations whose local bookkeeping failed.
//!
//! Operations push here when a submission succeeded but the transaction row
//! or the position mirror could not be written. The confirmation reconciler
//! drains the queue.

use crate::amount::Amount;
use crate::error::MirrorStage;
use crate::model::{TransactionKind, TransactionRecord};
use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A submitted ledger operation attributed to one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub user_id: i64,
    pub user: Address,
    pub kind: TransactionKind,
    pub hash: B256,
    pub amount: Amount,
    pub token: Address,
    /// Whether the user's position mirror follows this operation
    pub affects_position: bool,
}

impl Submission {
    pub fn to_record(&self) -> TransactionRecord {
        TransactionRecord::pending(self.user_id, self.kind, self.hash, self.amount, self.token)
    }
}

#[derive(Debug, Clone)]
pub struct BackfillEntry {
    pub submission: Submission,
    /// First bookkeeping step that failed
    pub stage: MirrorStage,
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl BackfillEntry {
    pub fn new(submission: Submission, stage: MirrorStage, reason: impl Into<String>) -> Self {
        Self {
            submission,
            stage,
            reason: reason.into(),
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct BackfillQueue {
    entries: Mutex<VecDeque<BackfillEntry>>,
}

impl BackfillQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: BackfillEntry) {
        self.entries.lock().push_back(entry);
    }

    /// Take up to `max` entries, oldest first.
    pub fn take(&self, max: usize) -> Vec<BackfillEntry> {
        let mut entries = self.entries.lock();
        let n = max.min(entries.len());
        entries.drain(..n).collect()
    }

    /// Put an entry back for the next pass, unless it has used up
    /// `max_attempts`. A dropped entry is handed back to the caller.
    pub fn requeue(&self, mut entry: BackfillEntry, max_attempts: u32) -> Option<BackfillEntry> {
        entry.attempts += 1;
        if entry.attempts >= max_attempts {
            return Some(entry);
        }
        self.entries.lock().push_back(entry);
        None
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: u8) -> BackfillEntry {
        BackfillEntry::new(
            Submission {
                user_id: 1,
                user: Address::repeat_byte(1),
                kind: TransactionKind::Borrow,
                hash: B256::repeat_byte(hash),
                amount: Amount::from(5u64),
                token: Address::repeat_byte(2),
                affects_position: true,
            },
            MirrorStage::TransactionRecord,
            "db down",
        )
    }

    #[test]
    fn test_take_is_fifo_and_bounded() {
        let queue = BackfillQueue::new();
        for hash in 1..=3 {
            queue.push(entry(hash));
        }
        let taken = queue.take(2);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].submission.hash, B256::repeat_byte(1));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take(10).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_counts_attempts() {
        let queue = BackfillQueue::new();
        assert!(queue.requeue(entry(1), 3).is_none());
        let taken = queue.take(1);
        assert_eq!(taken[0].attempts, 1);
    }

    #[test]
    fn test_requeue_drops_after_max_attempts() {
        let queue = BackfillQueue::new();
        let mut current = entry(7);
        for _ in 0..2 {
            assert!(queue.requeue(current, 3).is_none());
            current = queue.take(1).remove(0);
        }
        let dropped = queue.requeue(current, 3).expect("third failure drops the entry");
        assert_eq!(dropped.attempts, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_submission_record_is_pending() {
        let record = entry(4).submission.to_record();
        assert_eq!(record.status, crate::model::TransactionStatus::Pending);
        assert_eq!(record.hash, B256::repeat_byte(4));
    }
}
