//! Stable checkpoints and the watermark window.
//!
//! Every `K` executed sequence numbers a replica votes on its application state. Once a quorum
//! of replicas agree on `(sequence, digest)` the checkpoint is stable: the low watermark moves
//! to `sequence` and everything at or below it may be discarded.
//!
//! A replica that learns of a stable checkpoint it cannot vouch for (because its own state
//! differs or because it has not executed that far) must fetch the state from the replicas that
//! vouched for it. The same holds when `f+1` replicas report a checkpoint above the high
//! watermark (proof that at least one correct replica moved past the local window).

use crate::{
    quorum::{Kind, Outcome, Tracker},
    types::{Checkpoint, Snapshot},
    ReplicaId, Sequence,
};
use commonware_cryptography::sha256::Digest;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Result of observing a checkpoint vote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    Pending,

    /// The voter already voted a different digest (contained) for this sequence.
    Conflict(Digest),

    /// `snapshot` is the new stable checkpoint.
    ///
    /// If `transfer` is set, the local state cannot vouch for `snapshot` and must be fetched
    /// from the listed replicas.
    Stable {
        snapshot: Snapshot,
        transfer: Option<Vec<ReplicaId>>,
    },
}

/// Tracks own checkpoints, the stable checkpoint, and the watermark window.
pub struct Checkpoints {
    period: Sequence,
    window: Sequence,
    weak: usize,

    stable: Snapshot,
    own: BTreeMap<Sequence, Digest>,

    // Highest checkpoint each replica reported above the high watermark.
    above: HashMap<ReplicaId, Snapshot>,
}

impl Checkpoints {
    pub fn new(period: Sequence, window: Sequence, weak: usize, genesis: Snapshot) -> Self {
        Self {
            period,
            window,
            weak,
            stable: genesis,
            own: BTreeMap::new(),
            above: HashMap::new(),
        }
    }

    pub fn stable(&self) -> Snapshot {
        self.stable
    }

    /// Low watermark (sequence of the stable checkpoint).
    pub fn low(&self) -> Sequence {
        self.stable.sequence
    }

    /// High watermark (largest sequence number that may be assigned).
    pub fn high(&self) -> Sequence {
        self.stable.sequence.saturating_add(self.window)
    }

    /// Returns true if `sequence` lies in `(low, high]`.
    pub fn in_window(&self, sequence: Sequence) -> bool {
        sequence > self.low() && sequence <= self.high()
    }

    /// Returns true if a checkpoint is taken after executing `sequence`.
    pub fn is_checkpoint(&self, sequence: Sequence) -> bool {
        sequence % self.period == 0
    }

    /// Records the local state after executing a checkpoint sequence.
    pub fn produced(&mut self, snapshot: Snapshot) {
        if snapshot.sequence > self.low() {
            self.own.insert(snapshot.sequence, snapshot.digest);
        }
    }

    /// Latest own checkpoint that is not yet stable.
    pub fn unstable(&self) -> Option<Snapshot> {
        self.own
            .iter()
            .next_back()
            .map(|(sequence, digest)| Snapshot {
                sequence: *sequence,
                digest: *digest,
            })
    }

    /// The stable checkpoint followed by every own checkpoint above it.
    pub fn certificates(&self) -> Vec<Snapshot> {
        let mut certificates = vec![self.stable];
        certificates.extend(self.own.iter().map(|(sequence, digest)| Snapshot {
            sequence: *sequence,
            digest: *digest,
        }));
        certificates
    }

    /// Processes a checkpoint vote (including the local replica's own).
    pub fn observe(
        &mut self,
        tracker: &mut Tracker,
        checkpoint: Checkpoint,
        last_executed: Sequence,
    ) -> Progress {
        let Checkpoint { snapshot, replica } = checkpoint;
        if snapshot.sequence <= self.low() {
            return Progress::Pending;
        }

        // Beyond the window, only the latest checkpoint of each replica is kept
        if snapshot.sequence > self.high() {
            match self.above.get(&replica) {
                Some(existing) if existing.sequence >= snapshot.sequence => {}
                _ => {
                    self.above.insert(replica, snapshot);
                }
            }
            let mut peers: Vec<ReplicaId> = self
                .above
                .iter()
                .filter(|(_, reported)| **reported == snapshot)
                .map(|(replica, _)| *replica)
                .collect();
            if peers.len() < self.weak {
                return Progress::Pending;
            }
            peers.sort_unstable();
            warn!(
                sequence = snapshot.sequence,
                high = self.high(),
                "checkpoint above high watermark"
            );
            self.stabilize(snapshot);
            return Progress::Stable {
                snapshot,
                transfer: Some(peers),
            };
        }

        match tracker.record(
            Kind::Checkpoint,
            0,
            snapshot.sequence,
            snapshot.digest,
            replica,
        ) {
            Outcome::Added => {}
            Outcome::Duplicate => return Progress::Pending,
            Outcome::Conflict(existing) => return Progress::Conflict(existing),
        }
        if !tracker.has_quorum(Kind::Checkpoint, 0, snapshot.sequence, &snapshot.digest) {
            return Progress::Pending;
        }

        // Decide whether the local state can vouch for the stable checkpoint
        let peers = tracker.voters(Kind::Checkpoint, 0, snapshot.sequence, &snapshot.digest);
        let transfer = match self.own.get(&snapshot.sequence) {
            Some(local) if *local == snapshot.digest => None,
            Some(local) => {
                warn!(
                    sequence = snapshot.sequence,
                    local = ?local,
                    stable = ?snapshot.digest,
                    "state diverged from stable checkpoint"
                );
                Some(peers)
            }
            None => {
                warn!(
                    sequence = snapshot.sequence,
                    last_executed, "stable checkpoint not reached locally"
                );
                Some(peers)
            }
        };
        self.stabilize(snapshot);
        Progress::Stable { snapshot, transfer }
    }

    /// Makes `snapshot` the stable checkpoint (if it is newer).
    pub fn stabilize(&mut self, snapshot: Snapshot) {
        if snapshot.sequence <= self.low() {
            return;
        }
        debug!(
            sequence = snapshot.sequence,
            digest = ?snapshot.digest,
            "stable checkpoint"
        );
        self.stable = snapshot;
        self.own = self.own.split_off(&snapshot.sequence.saturating_add(1));
        let high = self.high();
        self.above.retain(|_, reported| reported.sequence > high);
    }
}
