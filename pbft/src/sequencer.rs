//! In-order, exactly-once delivery of committed pre-prepares.

use crate::{types::PrePrepare, Sequence};
use commonware_cryptography::sha256::Digest;
use std::collections::BTreeMap;
use tracing::error;

/// Result of handing a committed pre-prepare to the [Sequencer].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Commit {
    /// Queued for execution.
    Queued,

    /// Already executed (or skipped by a state transfer).
    Stale,

    /// The same digest is already queued.
    Duplicate,

    /// A different digest is already queued at this sequence (never applied).
    Conflict(Digest),
}

/// Releases committed pre-prepares strictly in sequence order without gaps.
#[derive(Default)]
pub struct Sequencer {
    last_executed: Sequence,
    pending: BTreeMap<Sequence, PrePrepare>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence number released for execution.
    pub fn last_executed(&self) -> Sequence {
        self.last_executed
    }

    /// Number of committed pre-prepares waiting for a lower sequence number.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn commit(&mut self, pre_prepare: PrePrepare) -> Commit {
        let sequence = pre_prepare.sequence;
        if sequence <= self.last_executed {
            return Commit::Stale;
        }
        if let Some(existing) = self.pending.get(&sequence) {
            if existing.digest == pre_prepare.digest {
                return Commit::Duplicate;
            }
            error!(
                sequence,
                existing = ?existing.digest,
                received = ?pre_prepare.digest,
                "conflicting commit"
            );
            return Commit::Conflict(existing.digest);
        }
        self.pending.insert(sequence, pre_prepare);
        Commit::Queued
    }

    /// Releases the next pre-prepare if it directly follows the last executed one.
    pub fn release(&mut self) -> Option<PrePrepare> {
        let next = self.last_executed.checked_add(1)?;
        let pre_prepare = self.pending.remove(&next)?;
        self.last_executed = next;
        Some(pre_prepare)
    }

    /// Restarts delivery after `sequence` (the state was installed externally).
    pub fn reset(&mut self, sequence: Sequence) {
        self.last_executed = sequence;
        self.pending = self.pending.split_off(&sequence.saturating_add(1));
    }
}
