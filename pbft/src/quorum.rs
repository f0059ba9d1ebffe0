//! Counting of matching votes towards quorum certificates.
//!
//! Votes are keyed by `(kind, view, sequence)`. Each replica may contribute at most one digest per
//! key: re-recording the same vote is a no-op and recording a different digest is reported as a
//! conflict (and never counted).

use crate::{ReplicaId, Sequence, View};
use commonware_cryptography::sha256::Digest;
use std::collections::{BTreeMap, HashMap};

/// Kind of vote being counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Prepare,
    Commit,
    Checkpoint,
}

/// Result of recording a vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The vote was counted.
    Added,

    /// The same vote was already recorded.
    Duplicate,

    /// The replica already voted a different digest for this key.
    Conflict(Digest),
}

#[derive(Default)]
struct Votes {
    voters: HashMap<ReplicaId, Digest>,
    counts: HashMap<Digest, usize>,
}

/// Smallest set size such that any two sets of `n` replicas intersect in at least `f + 1`.
///
/// When `n = 3f + 1` this is `2f + 1`.
pub fn quorum(n: usize, f: usize) -> usize {
    (n + f) / 2 + 1
}

/// Tracks votes for every `(kind, view, sequence)` key.
pub struct Tracker {
    quorum: usize,
    weak: usize,
    votes: BTreeMap<(Kind, View, Sequence), Votes>,
}

impl Tracker {
    /// Creates a tracker for `n` replicas tolerating `f` faults.
    pub fn new(n: usize, f: usize) -> Self {
        Self {
            quorum: quorum(n, f),
            weak: f + 1,
            votes: BTreeMap::new(),
        }
    }

    /// Number of matching votes required for `kind` to reach quorum.
    ///
    /// Prepare requires one less than a quorum because the primary's pre-prepare stands in
    /// for its own prepare.
    pub fn threshold(&self, kind: Kind) -> usize {
        match kind {
            Kind::Prepare => self.quorum - 1,
            Kind::Commit | Kind::Checkpoint => self.quorum,
        }
    }

    /// Number of matching votes that guarantees at least one correct voter.
    pub fn weak(&self) -> usize {
        self.weak
    }

    /// Records `replica`'s vote for `digest` at `(kind, view, sequence)`.
    pub fn record(
        &mut self,
        kind: Kind,
        view: View,
        sequence: Sequence,
        digest: Digest,
        replica: ReplicaId,
    ) -> Outcome {
        let votes = self.votes.entry((kind, view, sequence)).or_default();
        if let Some(previous) = votes.voters.get(&replica) {
            if *previous == digest {
                return Outcome::Duplicate;
            }
            return Outcome::Conflict(*previous);
        }
        votes.voters.insert(replica, digest);
        *votes.counts.entry(digest).or_default() += 1;
        Outcome::Added
    }

    /// Number of recorded votes for `digest` at `(kind, view, sequence)`.
    pub fn count(&self, kind: Kind, view: View, sequence: Sequence, digest: &Digest) -> usize {
        self.votes
            .get(&(kind, view, sequence))
            .and_then(|votes| votes.counts.get(digest))
            .copied()
            .unwrap_or(0)
    }

    /// Returns true once the matching votes for `digest` reach the threshold of `kind`.
    pub fn has_quorum(&self, kind: Kind, view: View, sequence: Sequence, digest: &Digest) -> bool {
        self.count(kind, view, sequence, digest) >= self.threshold(kind)
    }

    /// Replicas that voted `digest` at `(kind, view, sequence)`, in ascending order.
    pub fn voters(
        &self,
        kind: Kind,
        view: View,
        sequence: Sequence,
        digest: &Digest,
    ) -> Vec<ReplicaId> {
        let Some(votes) = self.votes.get(&(kind, view, sequence)) else {
            return Vec::new();
        };
        let mut voters: Vec<ReplicaId> = votes
            .voters
            .iter()
            .filter(|(_, voted)| *voted == digest)
            .map(|(replica, _)| *replica)
            .collect();
        voters.sort_unstable();
        voters
    }

    /// Drops votes for sequences at or below `sequence`.
    pub fn prune(&mut self, sequence: Sequence) {
        self.votes.retain(|(_, _, seq), _| *seq > sequence);
    }

    /// Drops Prepare and Commit votes from views below `view`.
    pub fn prune_votes(&mut self, view: View) {
        self.votes
            .retain(|(kind, v, _), _| !matches!(kind, Kind::Prepare | Kind::Commit) || *v >= view);
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// Returns true if no votes are tracked.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(b: u8) -> Digest {
        Digest::from([b; 32])
    }

    #[test]
    fn test_thresholds() {
        let tracker = Tracker::new(4, 1);
        assert_eq!(tracker.threshold(Kind::Prepare), 2);
        assert_eq!(tracker.threshold(Kind::Commit), 3);
        assert_eq!(tracker.threshold(Kind::Checkpoint), 3);
        assert_eq!(tracker.weak(), 2);

        let tracker = Tracker::new(10, 3);
        assert_eq!(tracker.threshold(Kind::Prepare), 6);
        assert_eq!(tracker.threshold(Kind::Commit), 7);
    }

    #[test]
    fn test_quorum_intersection() {
        for f in 0..5 {
            for n in (3 * f + 1)..(3 * f + 8) {
                let q = quorum(n, f);
                assert!(q <= n - f, "quorum must be reachable without faulty replicas");
                assert!(2 * q >= n + f + 1, "quorums must intersect in a correct replica");
            }
            assert_eq!(quorum(3 * f + 1, f), 2 * f + 1);
        }
    }

    #[test]
    fn test_quorum() {
        let mut tracker = Tracker::new(4, 1);
        let d = digest(1);
        assert_eq!(tracker.record(Kind::Commit, 0, 1, d, 0), Outcome::Added);
        assert_eq!(tracker.record(Kind::Commit, 0, 1, d, 1), Outcome::Added);
        assert!(!tracker.has_quorum(Kind::Commit, 0, 1, &d));
        assert_eq!(tracker.record(Kind::Commit, 0, 1, d, 2), Outcome::Added);
        assert!(tracker.has_quorum(Kind::Commit, 0, 1, &d));

        // Other keys are unaffected
        assert!(!tracker.has_quorum(Kind::Commit, 1, 1, &d));
        assert!(!tracker.has_quorum(Kind::Prepare, 0, 1, &d));
        assert_eq!(tracker.voters(Kind::Commit, 0, 1, &d), vec![0, 1, 2]);
    }

    #[test]
    fn test_idempotent() {
        let mut tracker = Tracker::new(4, 1);
        let d = digest(1);
        assert_eq!(tracker.record(Kind::Prepare, 0, 1, d, 1), Outcome::Added);
        for _ in 0..5 {
            assert_eq!(tracker.record(Kind::Prepare, 0, 1, d, 1), Outcome::Duplicate);
        }
        assert_eq!(tracker.count(Kind::Prepare, 0, 1, &d), 1);
        assert!(!tracker.has_quorum(Kind::Prepare, 0, 1, &d));
        assert_eq!(tracker.record(Kind::Prepare, 0, 1, d, 2), Outcome::Added);
        assert!(tracker.has_quorum(Kind::Prepare, 0, 1, &d));
    }

    #[test]
    fn test_conflict_not_counted() {
        let mut tracker = Tracker::new(4, 1);
        let a = digest(1);
        let b = digest(2);
        assert_eq!(tracker.record(Kind::Commit, 0, 1, a, 3), Outcome::Added);
        assert_eq!(
            tracker.record(Kind::Commit, 0, 1, b, 3),
            Outcome::Conflict(a)
        );
        assert_eq!(tracker.count(Kind::Commit, 0, 1, &a), 1);
        assert_eq!(tracker.count(Kind::Commit, 0, 1, &b), 0);
    }

    #[test]
    fn test_prune() {
        let mut tracker = Tracker::new(4, 1);
        let d = digest(1);
        tracker.record(Kind::Prepare, 0, 5, d, 1);
        tracker.record(Kind::Commit, 0, 10, d, 1);
        tracker.record(Kind::Checkpoint, 0, 10, d, 1);
        tracker.record(Kind::Commit, 0, 11, d, 1);
        tracker.prune(10);
        assert_eq!(tracker.count(Kind::Prepare, 0, 5, &d), 0);
        assert_eq!(tracker.count(Kind::Commit, 0, 10, &d), 0);
        assert_eq!(tracker.count(Kind::Checkpoint, 0, 10, &d), 0);
        assert_eq!(tracker.count(Kind::Commit, 0, 11, &d), 1);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_prune_votes() {
        let mut tracker = Tracker::new(4, 1);
        let d = digest(1);
        tracker.record(Kind::Prepare, 0, 1, d, 1);
        tracker.record(Kind::Commit, 0, 2, d, 1);
        tracker.record(Kind::Commit, 1, 3, d, 1);
        tracker.record(Kind::Checkpoint, 0, 10, d, 1);
        tracker.prune_votes(1);
        assert_eq!(tracker.count(Kind::Prepare, 0, 1, &d), 0);
        assert_eq!(tracker.count(Kind::Commit, 0, 2, &d), 0);
        assert_eq!(tracker.count(Kind::Commit, 1, 3, &d), 1);
        assert_eq!(tracker.count(Kind::Checkpoint, 0, 10, &d), 1);
    }
}
