//! Stateless admission checks applied to every message before it touches replica state.

use crate::{
    slot::{Log, Status},
    types::{Message, ViewChange},
    view_change::Mode,
    Config, ReplicaId, Sequence, View,
};
use commonware_cryptography::sha256::Digest;
use std::collections::BTreeSet;
use thiserror::Error;

/// Reason a message was dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("unknown replica: {0}")]
    UnknownReplica(ReplicaId),
    #[error("message claims to come from the local replica")]
    Loopback,
    #[error("failed authentication")]
    Unauthenticated,
    #[error("stale view {view} (current {current})")]
    StaleView { view: View, current: View },
    #[error("future view {view} (current {current})")]
    FutureView { view: View, current: View },
    #[error("view change in progress")]
    ViewChanging,
    #[error("sequence {sequence} outside of ({low}, {high}]")]
    OutOfWindow {
        sequence: Sequence,
        low: Sequence,
        high: Sequence,
    },
    #[error("replica {claimed} is not the primary of view {view}")]
    NotPrimary { view: View, claimed: ReplicaId },
    #[error("prepare from the primary")]
    FromPrimary,
    #[error("digest does not match request")]
    Inconsistent,
    #[error("conflicts with accepted digest {existing:?}")]
    Conflict { existing: Digest },
    #[error("sequence {0} is not a checkpoint")]
    NotCheckpoint(Sequence),
    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// Snapshot of replica state a message is validated against.
pub struct Context<'a> {
    pub config: &'a Config,
    pub view: View,
    pub mode: Mode,
    pub low: Sequence,
    pub high: Sequence,
    pub log: &'a Log,
}

impl Context<'_> {
    fn in_window(&self, sequence: Sequence) -> Result<(), Rejection> {
        if sequence <= self.low || sequence > self.high {
            return Err(Rejection::OutOfWindow {
                sequence,
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }

    fn current(&self, view: View) -> Result<(), Rejection> {
        if view < self.view {
            return Err(Rejection::StaleView {
                view,
                current: self.view,
            });
        }
        if view > self.view {
            return Err(Rejection::FutureView {
                view,
                current: self.view,
            });
        }
        Ok(())
    }

    /// Pre-prepares and prepares are only processed in the current view, outside of a view change.
    fn normal(&self, view: View) -> Result<(), Rejection> {
        self.current(view)?;
        if self.mode != Mode::Normal {
            return Err(Rejection::ViewChanging);
        }
        Ok(())
    }

    fn newer(&self, view: View) -> Result<(), Rejection> {
        if view <= self.view {
            return Err(Rejection::StaleView {
                view,
                current: self.view,
            });
        }
        Ok(())
    }
}

/// Checks `message` (received from `from`) against `context`.
pub fn validate(context: &Context<'_>, from: ReplicaId, message: &Message) -> Result<(), Rejection> {
    let config = context.config;
    if from >= config.n {
        return Err(Rejection::UnknownReplica(from));
    }
    if let Some(sender) = message.sender() {
        if sender >= config.n {
            return Err(Rejection::UnknownReplica(sender));
        }
        if sender == config.me {
            return Err(Rejection::Loopback);
        }
    }

    match message {
        Message::Request(_) => Ok(()),
        Message::PrePrepare(pre_prepare) => {
            context.normal(pre_prepare.view)?;
            if pre_prepare.primary != config.primary(pre_prepare.view) {
                return Err(Rejection::NotPrimary {
                    view: pre_prepare.view,
                    claimed: pre_prepare.primary,
                });
            }
            context.in_window(pre_prepare.sequence)?;
            if !pre_prepare.is_consistent() {
                return Err(Rejection::Inconsistent);
            }
            let existing = context
                .log
                .get(pre_prepare.view, pre_prepare.sequence)
                .and_then(|slot| slot.digest());
            match existing {
                Some(existing) if existing != pre_prepare.digest => {
                    Err(Rejection::Conflict { existing })
                }
                _ => Ok(()),
            }
        }
        Message::Prepare(vote) => {
            context.normal(vote.view)?;
            if vote.replica == config.primary(vote.view) {
                return Err(Rejection::FromPrimary);
            }
            context.in_window(vote.sequence)
        }
        Message::Commit(vote) => {
            context.current(vote.view)?;
            context.in_window(vote.sequence)?;

            // During a view change only slots that already prepared may still commit
            if context.mode != Mode::Normal {
                let prepared = context
                    .log
                    .get(vote.view, vote.sequence)
                    .is_some_and(|slot| slot.status() == Status::Prepared);
                if !prepared {
                    return Err(Rejection::ViewChanging);
                }
            }
            Ok(())
        }
        Message::Checkpoint(checkpoint) => {
            let sequence = checkpoint.snapshot.sequence;
            if sequence <= context.low {
                return Err(Rejection::OutOfWindow {
                    sequence,
                    low: context.low,
                    high: context.high,
                });
            }
            if sequence % config.checkpoint_period != 0 {
                return Err(Rejection::NotCheckpoint(sequence));
            }
            Ok(())
        }
        Message::ViewChange(view_change) => {
            context.newer(view_change.view)?;
            check_view_change(config, view_change)
        }
        Message::NewView(new_view) => {
            context.newer(new_view.view)?;
            if new_view.primary != config.primary(new_view.view) {
                return Err(Rejection::NotPrimary {
                    view: new_view.view,
                    claimed: new_view.primary,
                });
            }
            Ok(())
        }
    }
}

/// Checks the internal consistency of a view-change record.
pub fn check_view_change(config: &Config, view_change: &ViewChange) -> Result<(), Rejection> {
    if view_change.replica >= config.n {
        return Err(Rejection::UnknownReplica(view_change.replica));
    }
    let stable = view_change.stable.sequence;
    if stable % config.checkpoint_period != 0 {
        return Err(Rejection::NotCheckpoint(stable));
    }
    let high = stable.saturating_add(config.window());
    let in_range = |sequence: Sequence| sequence > stable && sequence <= high;

    for checkpoint in view_change.checkpoints.iter() {
        if checkpoint.sequence < stable || checkpoint.sequence % config.checkpoint_period != 0 {
            return Err(Rejection::Malformed("view change checkpoint"));
        }
    }

    let mut sequences = BTreeSet::new();
    for pre_prepare in view_change.prepared.iter() {
        if pre_prepare.view >= view_change.view
            || !in_range(pre_prepare.sequence)
            || pre_prepare.primary != config.primary(pre_prepare.view)
            || !pre_prepare.is_consistent()
            || !sequences.insert(pre_prepare.sequence)
        {
            return Err(Rejection::Malformed("view change prepared entry"));
        }
    }

    for entry in view_change.pre_prepared.iter() {
        if entry.view >= view_change.view || !in_range(entry.sequence) {
            return Err(Rejection::Malformed("view change pre-prepared entry"));
        }
    }
    Ok(())
}
