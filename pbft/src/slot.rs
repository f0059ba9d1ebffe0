//! Agreement state of each `(view, sequence)` pair.

use crate::{
    quorum::{Kind, Tracker},
    types::PrePrepare,
    Sequence, View,
};
use commonware_cryptography::sha256::Digest;
use std::collections::BTreeMap;

/// Progress of a slot through the three phases. Transitions are monotone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    /// Votes were seen but no pre-prepare was accepted yet.
    Empty,
    PrePrepared,
    Prepared,
    Committed,
    Executed,
}

/// Result of offering a pre-prepare to a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accept {
    Accepted,
    Duplicate,

    /// A different pre-prepare was already accepted (with the contained digest).
    Conflict(Digest),
}

/// Agreement state for one `(view, sequence)` pair.
#[derive(Clone, Debug)]
pub struct Slot {
    view: View,
    sequence: Sequence,
    status: Status,
    pre_prepare: Option<PrePrepare>,
}

impl Slot {
    fn new(view: View, sequence: Sequence) -> Self {
        Self {
            view,
            sequence,
            status: Status::Empty,
            pre_prepare: None,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Digest bound by the accepted pre-prepare, if any.
    pub fn digest(&self) -> Option<Digest> {
        self.pre_prepare.as_ref().map(|pre_prepare| pre_prepare.digest)
    }

    pub fn pre_prepare(&self) -> Option<&PrePrepare> {
        self.pre_prepare.as_ref()
    }

    /// Binds the slot to `pre_prepare` (only the first one is ever accepted).
    pub fn accept(&mut self, pre_prepare: PrePrepare) -> Accept {
        if let Some(existing) = &self.pre_prepare {
            if existing.digest == pre_prepare.digest {
                return Accept::Duplicate;
            }
            return Accept::Conflict(existing.digest);
        }
        self.pre_prepare = Some(pre_prepare);
        self.status = Status::PrePrepared;
        Accept::Accepted
    }

    /// Moves the slot at most one phase forward given the votes in `tracker`.
    ///
    /// Returns the new status if a transition occurred.
    pub fn advance(&mut self, tracker: &Tracker) -> Option<Status> {
        let digest = self.digest()?;
        let next = match self.status {
            Status::PrePrepared
                if tracker.has_quorum(Kind::Prepare, self.view, self.sequence, &digest) =>
            {
                Status::Prepared
            }
            Status::Prepared
                if tracker.has_quorum(Kind::Commit, self.view, self.sequence, &digest) =>
            {
                Status::Committed
            }
            _ => return None,
        };
        self.status = next;
        Some(next)
    }

    /// Marks a committed slot as executed.
    pub fn executed(&mut self) {
        if self.status == Status::Committed {
            self.status = Status::Executed;
        }
    }
}

/// All live slots, ordered by sequence and then view.
#[derive(Default)]
pub struct Log {
    slots: BTreeMap<(Sequence, View), Slot>,
}

impl Log {
    pub fn get(&self, view: View, sequence: Sequence) -> Option<&Slot> {
        self.slots.get(&(sequence, view))
    }

    pub fn get_mut(&mut self, view: View, sequence: Sequence) -> Option<&mut Slot> {
        self.slots.get_mut(&(sequence, view))
    }

    /// Returns the slot for `(view, sequence)`, creating an empty one if needed.
    pub fn entry(&mut self, view: View, sequence: Sequence) -> &mut Slot {
        self.slots
            .entry((sequence, view))
            .or_insert_with(|| Slot::new(view, sequence))
    }

    /// Discards every slot at or below a stable checkpoint.
    pub fn prune(&mut self, stable: Sequence) {
        self.slots = self.slots.split_off(&(stable.saturating_add(1), 0));
    }

    /// Discards slots from views below `view` that never reached `status`.
    pub fn abandon(&mut self, view: View, status: Status) {
        self.slots
            .retain(|(_, v), slot| *v >= view || slot.status >= status);
    }

    /// Pre-prepares of committed (or executed) slots above `sequence`, in sequence order.
    pub fn committed_above(&self, sequence: Sequence) -> Vec<PrePrepare> {
        self.slots
            .range((sequence.saturating_add(1), 0)..)
            .filter(|(_, slot)| slot.status >= Status::Committed)
            .filter_map(|(_, slot)| slot.pre_prepare.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
