//! Replacement of the primary.
//!
//! # Selection
//!
//! Given the view-change records `S` collected for view `v`, the new primary (and every backup
//! checking its work) computes:
//!
//! * The starting checkpoint `h`: the highest `(sequence, digest)` carried by at least `f+1`
//!   records, provided a quorum of records have a stable checkpoint at or below it.
//! * For every `s` in `(h, h + L]`, a request `d` from some record's prepared entry
//!   `(s, d, v')` if
//!   * a quorum of records have a stable checkpoint below `s` and prepared nothing at `s` from
//!     a later view (or from `v'` with another digest), and
//!   * at least `f+1` records prepared or pre-prepared `(s, d)` in a view at or above `v'`.
//! * Otherwise the null request, if a quorum of records have a stable checkpoint below `s` and
//!   prepared nothing at `s`.
//!
//! If some `s` satisfies neither rule, no decision is possible yet (more records are needed).
//! Null requests above the last selected request are omitted.

use crate::{
    types::{null_digest, Entry, Message, NewView, PrePrepare, Snapshot, ViewChange},
    validator::{check_view_change, Rejection},
    Authenticator, Config, ReplicaId, Sequence, View,
};
use commonware_cryptography::sha256::Digest;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Whether the replica is ordering requests or replacing the primary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    Normal,

    /// Waiting for `target` to be installed.
    ViewChanging { target: View },
}

/// Result of storing a view-change record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Received {
    New,
    Duplicate,

    /// The replica already moved to a later view.
    Stale,

    /// The replica already sent a different record for the same view.
    Conflict,
}

/// Prepared and pre-prepared certificates (reported in view changes) and collected records.
pub struct Manager {
    max_entries: usize,

    // Highest-view prepared pre-prepare per sequence
    prepared: BTreeMap<Sequence, PrePrepare>,

    // Highest view each digest was pre-prepared in, per sequence
    pre_prepared: BTreeMap<(Sequence, Digest), View>,

    // Latest record of each replica
    records: BTreeMap<ReplicaId, ViewChange>,
}

impl Manager {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            prepared: BTreeMap::new(),
            pre_prepared: BTreeMap::new(),
            records: BTreeMap::new(),
        }
    }

    /// Remembers that `pre_prepare` reached Prepared.
    pub fn prepared(&mut self, pre_prepare: &PrePrepare) {
        match self.prepared.get(&pre_prepare.sequence) {
            Some(existing) if existing.view >= pre_prepare.view => {}
            _ => {
                self.prepared
                    .insert(pre_prepare.sequence, pre_prepare.clone());
            }
        }
    }

    /// Remembers that a pre-prepare for `entry` was accepted.
    pub fn pre_prepared(&mut self, entry: Entry) {
        let view = self
            .pre_prepared
            .entry((entry.sequence, entry.digest))
            .or_insert(entry.view);
        *view = (*view).max(entry.view);
    }

    /// Forgets certificates at or below a stable checkpoint.
    pub fn prune(&mut self, stable: Sequence) {
        self.prepared = self.prepared.split_off(&stable.saturating_add(1));
        self.pre_prepared.retain(|(sequence, _), _| *sequence > stable);
    }

    /// Builds the local record for `view`.
    pub fn build(
        &self,
        view: View,
        me: ReplicaId,
        window: Sequence,
        stable: Snapshot,
        mut checkpoints: Vec<Snapshot>,
    ) -> ViewChange {
        let low = stable.sequence.saturating_add(1);
        let high = stable.sequence.saturating_add(window);
        let prepared: Vec<PrePrepare> = self
            .prepared
            .range(low..=high)
            .map(|(_, pre_prepare)| pre_prepare.clone())
            .take(self.max_entries)
            .collect();

        // Entries already implied by a prepared certificate are omitted
        let mut pre_prepared: Vec<Entry> = self
            .pre_prepared
            .iter()
            .filter(|((sequence, _), _)| *sequence >= low && *sequence <= high)
            .filter(|((sequence, digest), view)| {
                !self.prepared.get(sequence).is_some_and(|pre_prepare| {
                    pre_prepare.digest == *digest && pre_prepare.view >= **view
                })
            })
            .map(|((sequence, digest), view)| Entry {
                view: *view,
                sequence: *sequence,
                digest: *digest,
            })
            .collect();
        if pre_prepared.len() > self.max_entries {
            pre_prepared.sort_by(|a, b| b.view.cmp(&a.view));
            pre_prepared.truncate(self.max_entries);
            pre_prepared.sort_by_key(|entry| (entry.sequence, entry.view));
        }
        checkpoints.truncate(self.max_entries);

        ViewChange {
            view,
            replica: me,
            stable,
            checkpoints,
            prepared,
            pre_prepared,
        }
    }

    /// Stores `record`, keeping only the latest view per replica.
    pub fn receive(&mut self, record: ViewChange) -> Received {
        if let Some(existing) = self.records.get(&record.replica) {
            if existing.view > record.view {
                return Received::Stale;
            }
            if existing.view == record.view {
                if *existing == record {
                    return Received::Duplicate;
                }
                return Received::Conflict;
            }
        }
        self.records.insert(record.replica, record);
        Received::New
    }

    /// Records collected for `view`, ordered by replica.
    pub fn records(&self, view: View) -> Vec<ViewChange> {
        self.records
            .values()
            .filter(|record| record.view == view)
            .cloned()
            .collect()
    }

    /// Smallest view above `current` that at least `weak` replicas asked to move to (or beyond).
    pub fn join(&self, current: View, weak: usize) -> Option<View> {
        let targets: Vec<View> = self
            .records
            .values()
            .map(|record| record.view)
            .filter(|view| *view > current)
            .collect();
        if targets.len() < weak {
            return None;
        }
        targets.into_iter().min()
    }

    /// Forgets records for views at or below the installed `view`.
    pub fn prune_views(&mut self, view: View) {
        self.records.retain(|_, record| record.view > view);
    }
}

/// Selects the checkpoint a new view starts from.
pub fn select_checkpoint(records: &[ViewChange], weak: usize, quorum: usize) -> Option<Snapshot> {
    let mut support: BTreeMap<Snapshot, usize> = BTreeMap::new();
    for record in records {
        let carried: BTreeSet<Snapshot> = std::iter::once(record.stable)
            .chain(record.checkpoints.iter().copied())
            .collect();
        for snapshot in carried {
            *support.entry(snapshot).or_default() += 1;
        }
    }
    support
        .iter()
        .rev()
        .find(|(snapshot, count)| {
            **count >= weak
                && records
                    .iter()
                    .filter(|record| record.stable.sequence <= snapshot.sequence)
                    .count()
                    >= quorum
        })
        .map(|(snapshot, _)| *snapshot)
}

/// Selects, for every sequence above `checkpoint`, the prepared pre-prepare to re-issue (or
/// `None` for the null request). Trailing null requests are omitted.
pub fn select_requests(
    records: &[ViewChange],
    checkpoint: Sequence,
    window: Sequence,
    weak: usize,
    quorum: usize,
) -> Option<Vec<Option<PrePrepare>>> {
    let mut selected = Vec::new();
    let mut last = 0;
    for sequence in checkpoint.saturating_add(1)..=checkpoint.saturating_add(window) {
        let below: Vec<&ViewChange> = records
            .iter()
            .filter(|record| record.stable.sequence < sequence)
            .collect();
        let candidate = records
            .iter()
            .flat_map(|record| record.prepared.iter())
            .filter(|pre_prepare| pre_prepare.sequence == sequence)
            .find(|candidate| {
                let unchallenged = below
                    .iter()
                    .filter(|record| {
                        record.prepared.iter().all(|other| {
                            other.sequence != sequence
                                || other.view < candidate.view
                                || (other.view == candidate.view
                                    && other.digest == candidate.digest)
                        })
                    })
                    .count();
                if unchallenged < quorum {
                    return false;
                }
                let vouched = records
                    .iter()
                    .filter(|record| {
                        record.prepared.iter().any(|other| {
                            other.sequence == sequence
                                && other.digest == candidate.digest
                                && other.view >= candidate.view
                        }) || record.pre_prepared.iter().any(|other| {
                            other.sequence == sequence
                                && other.digest == candidate.digest
                                && other.view >= candidate.view
                        })
                    })
                    .count();
                vouched >= weak
            });
        if let Some(candidate) = candidate {
            selected.push(Some(candidate.clone()));
            last = selected.len();
            continue;
        }

        let empty = below
            .iter()
            .filter(|record| {
                !record
                    .prepared
                    .iter()
                    .any(|pre_prepare| pre_prepare.sequence == sequence)
            })
            .count();
        if empty < quorum {
            return None;
        }
        selected.push(None);
    }
    selected.truncate(last);
    Some(selected)
}

/// Computes the starting checkpoint and re-issued pre-prepares of `view` from `records`.
pub fn select(
    config: &Config,
    view: View,
    records: &[ViewChange],
) -> Option<(Snapshot, Vec<PrePrepare>)> {
    let weak = config.f as usize + 1;
    let quorum = config.quorum();
    let checkpoint = select_checkpoint(records, weak, quorum)?;
    let selection = select_requests(
        records,
        checkpoint.sequence,
        config.window(),
        weak,
        quorum,
    )?;
    let primary = config.primary(view);
    let reissued = selection
        .into_iter()
        .enumerate()
        .map(|(offset, selected)| {
            let sequence = checkpoint.sequence.saturating_add(offset as Sequence + 1);
            (selected, sequence)
        })
        .map(|(selected, sequence)| match selected {
            Some(pre_prepare) => PrePrepare {
                view,
                sequence,
                digest: pre_prepare.digest,
                request: pre_prepare.request,
                primary,
            },
            None => PrePrepare {
                view,
                sequence,
                digest: null_digest(),
                request: None,
                primary,
            },
        })
        .collect();
    Some((checkpoint, reissued))
}

/// Builds a new-view message from `records` (if a decision is possible).
pub fn new_view(config: &Config, view: View, records: Vec<ViewChange>) -> Option<NewView> {
    if records.len() < config.quorum() {
        return None;
    }
    let (checkpoint, selected) = select(config, view, &records)?;
    Some(NewView {
        view,
        primary: config.me,
        view_changes: records,
        checkpoint,
        selected,
    })
}

/// Checks that `new_view` was derived correctly from the records it carries.
pub fn verify_new_view(
    config: &Config,
    authenticator: &impl Authenticator,
    new_view: &NewView,
) -> Result<(), Rejection> {
    let mut replicas = HashSet::new();
    for record in new_view.view_changes.iter() {
        if record.view != new_view.view || !replicas.insert(record.replica) {
            return Err(Rejection::Malformed("new view record"));
        }
        check_view_change(config, record)?;
        if !authenticator.verify(record.replica, &Message::ViewChange(record.clone())) {
            return Err(Rejection::Unauthenticated);
        }
    }
    if replicas.len() < config.quorum() {
        return Err(Rejection::Malformed("new view quorum"));
    }
    let Some((checkpoint, selected)) = select(config, new_view.view, &new_view.view_changes) else {
        return Err(Rejection::Malformed("new view selection"));
    };
    if checkpoint != new_view.checkpoint || selected != new_view.selected {
        return Err(Rejection::Malformed("new view selection"));
    }
    Ok(())
}
