//! Order opaque requests across `n = 3f + 1` replicas with Practical Byzantine Fault Tolerance.
//!
//! `pbft` implements the three-phase agreement protocol of [Castro and Liskov](https://pmg.csail.mit.edu/papers/osdi99.pdf),
//! together with checkpoint-based log compaction and the view-change sub-protocol that replaces
//! a faulty or slow primary. Up to `f` replicas may behave arbitrarily without violating safety.
//!
//! # Status
//!
//! `commonware-pbft` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.
//!
//! # Design
//!
//! ## Architecture
//!
//! A [Replica] is a single serialized reactor. It never performs I/O: the caller feeds it one
//! [Event] at a time (a message from a peer, a client request, a timer firing, or the outcome of
//! a state transfer) and delivers the [Action]s it returns (broadcasts, unicasts, timers, state
//! transfer requests, and fault reports). Committed requests are applied, in sequence order and
//! exactly once, through the [Executor] supplied by the user.
//!
//! ```txt
//!                +------------+
//!   Event  ----->|  Validator |--(drop)
//!                +-----+------+
//!                      |
//!        +-------------+--------------+
//!        v             v              v
//!   +---------+  +------------+  +-------------+
//!   |  Slots  |  | Checkpoint |  | View Change |
//!   +----+----+  +-----+------+  +------+------+
//!        |             |                |
//!        +------> Quorum Tracker <------+
//!        |
//!        v
//!   +-----------+        +------------+
//!   | Sequencer +------->|  Executor  |
//!   +-----------+        +------------+
//! ```
//!
//! ## Protocol Description
//!
//! ### Normal Case (view `v`, primary `p = v mod n`)
//!
//! Upon receiving a request `m`:
//! * If primary, assign the next sequence number `s` inside the watermark window `(h, h + L]`
//!   and broadcast `pre-prepare(v, s, d(m), m)`
//! * Otherwise, arm the request timer (if not armed)
//!
//! Upon accepting the first `pre-prepare(v, s, d)` (backups only):
//! * Broadcast `prepare(v, s, d)`
//!
//! Upon the pre-prepare and `2f` matching `prepare(v, s, d)` from backups:
//! * Mark `(v, s)` as prepared and broadcast `commit(v, s, d)`
//!
//! Upon prepared and `2f+1` matching `commit(v, s, d)`:
//! * Mark `(v, s)` as committed and execute once all lower sequence numbers are executed
//!
//! ### Checkpoints
//!
//! After executing every `K`-th sequence number, broadcast `checkpoint(s, d(state, clients))`,
//! where `clients` is the highest executed timestamp of each client. Upon
//! `2f+1` matching checkpoints, the checkpoint becomes stable: everything at or below `s` is
//! discarded and the watermark window moves to `(s, s + L]`. A replica whose state disagrees
//! with a stable checkpoint (or that fell behind it) requests a state transfer, which installs
//! both the application state and the client table.
//!
//! ### View Change
//!
//! Upon the request timer firing:
//! * Broadcast `view-change(v+1, C, P, Q)` carrying the stable checkpoint, the checkpoints
//!   produced since, every prepared pre-prepare (`P`), and every pre-prepared entry (`Q`)
//! * Arm the view-change timer (on expiry, move on to `v+2`)
//!
//! Upon `f+1` view-changes for views above the local one:
//! * Join the smallest such view
//!
//! Upon `2f+1` view-changes for `v+1` (primary of `v+1` only):
//! * Select the checkpoint and, for every sequence number above it, the request carried by a
//!   quorum-backed prepared certificate (or the null request)
//! * Broadcast `new-view(v+1, V, O)` and enter `v+1`
//!
//! Upon a valid `new-view(v+1, V, O)`:
//! * Recompute the selection from `V`, enter `v+1`, and process every pre-prepare in `O`
//!
//! ## Primary Vote
//!
//! The primary never sends a prepare: its pre-prepare is its prepare vote. A prepare claiming to
//! come from the primary of its view is dropped.

use commonware_cryptography::sha256::Digest;
use thiserror::Error;

mod checkpoint;
mod config;
pub use config::Config;
mod metrics;
pub mod quorum;
mod replica;
pub use replica::{Action, Event, Fault, Replica};
mod sequencer;
pub mod slot;
mod timer;
pub use timer::{Timer, TimerKind};
pub mod types;
mod validator;
pub use validator::Rejection;
mod view_change;
pub use view_change::Mode;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

/// Position of a primary's tenure. The primary of view `v` is `v mod n`.
pub type View = u64;

/// Position of a request in the agreed order.
pub type Sequence = u64;

/// Index of a replica in `[0, n)`.
pub type ReplicaId = u32;

/// Errors that can occur when constructing a [Replica].
#[derive(Error, Debug)]
pub enum Error {
    #[error("too few replicas: n={0} is less than 3f+1 (f={1})")]
    TooFewReplicas(u32, u32),
    #[error("replica {0} is not in [0, {1})")]
    UnknownReplica(ReplicaId, u32),
    #[error("checkpoint period must be greater than zero")]
    InvalidCheckpointPeriod,
    #[error("invalid log multiplier: {0}")]
    InvalidLogMultiplier(u64),
    #[error("{0} timeout must be greater than zero")]
    InvalidTimeout(&'static str),
    #[error("max entries ({0}) must cover the watermark window and the replica set")]
    InvalidMaxEntries(usize),
    #[error("invalid configuration document: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Executor applies committed requests to the application state.
///
/// The [Replica] guarantees that `execute` and `skip` are called exactly once per sequence
/// number, in strictly increasing order without gaps (except across a completed state
/// transfer, which is announced via `restore`).
pub trait Executor {
    /// Apply `request`, the request agreed at `sequence`.
    fn execute(&mut self, sequence: Sequence, request: &types::Request);

    /// Advance past `sequence` without applying anything (null request or duplicate).
    fn skip(&mut self, sequence: Sequence);

    /// Digest of the application state after the last executed sequence number.
    fn state_digest(&self) -> Digest;

    /// Install the state identified by `digest` at `sequence` (after a state transfer).
    fn restore(&mut self, sequence: Sequence, digest: Digest);
}

/// Authenticator decides whether a message received from `from` is authentic.
pub trait Authenticator {
    fn verify(&self, from: ReplicaId, message: &types::Message) -> bool;
}

/// Trusts the replica identifiers carried by messages as given.
///
/// Only suitable for tests and simulation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Trusting;

impl Authenticator for Trusting {
    fn verify(&self, _: ReplicaId, _: &types::Message) -> bool {
        true
    }
}

/// Accepts a message only if the replica it claims to come from is the one that sent it.
///
/// Suitable when the transport authenticates peers (i.e. each stream is bound to a replica).
#[derive(Clone, Copy, Debug, Default)]
pub struct SenderBound;

impl Authenticator for SenderBound {
    fn verify(&self, from: ReplicaId, message: &types::Message) -> bool {
        match message.sender() {
            Some(sender) => sender == from,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{
            application::Application,
            mutator::Mutator,
            network::{Filter, Network},
        },
        types::{
            checkpoint_digest, null_digest, Clients, Message, PrePrepare, Request, Snapshot, Vote,
        },
    };
    use bytes::Bytes;
    use commonware_macros::test_traced;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{collections::BTreeMap, time::Duration};

    fn config(me: ReplicaId, n: u32, f: u32) -> Config {
        Config {
            me,
            n,
            f,
            checkpoint_period: 2,
            log_multiplier: 2,
            request_timeout: Duration::from_secs(2),
            view_change_timeout: Duration::from_secs(2),
            checkpoint_timeout: Duration::from_secs(2),
            max_request_size: 1024,
            max_entries: 64,
        }
    }

    fn network(n: u32, f: u32) -> Network<Application, Trusting> {
        let replicas = (0..n)
            .map(|me| Replica::new(config(me, n, f), Application::default(), Trusting).unwrap())
            .collect();
        Network::new(replicas)
    }

    fn request(id: u64) -> Request {
        Request::new(1, id, Bytes::from(format!("transaction-{id}")))
    }

    /// Asserts that no two replicas executed different requests at the same sequence.
    fn check_agreement(network: &Network<Application, Trusting>) {
        let mut agreed: BTreeMap<Sequence, Option<Digest>> = BTreeMap::new();
        for replica in network.replicas.iter() {
            for (sequence, digest) in replica.executor().executed() {
                if let Some(existing) = agreed.insert(*sequence, *digest) {
                    assert_eq!(existing, *digest, "disagreement at sequence {sequence}");
                }
            }
        }
    }

    #[test_traced]
    fn test_all_online() {
        let mut network = network(4, 1);
        let request = request(1);
        let digest = request.digest();
        network.request(request);
        network.process();

        for replica in network.replicas.iter() {
            assert_eq!(replica.view(), 0);
            assert_eq!(replica.last_executed(), 1);
            assert_eq!(replica.executor().executed(), &[(1, Some(digest))]);
            assert_eq!(replica.slot(0, 1).unwrap().status(), slot::Status::Executed);
        }
        assert!(network.faults().is_empty());
    }

    #[test_traced]
    fn test_many_requests_in_order() {
        let mut network = network(4, 1);
        let requests: Vec<Request> = (1..=11).map(request).collect();
        for request in requests.iter() {
            network.request(request.clone());
            network.process();
        }

        let expected: Vec<(Sequence, Option<Digest>)> = requests
            .iter()
            .enumerate()
            .map(|(i, request)| (i as Sequence + 1, Some(request.digest())))
            .collect();
        for replica in network.replicas.iter() {
            assert_eq!(replica.executor().executed(), expected.as_slice());

            // Checkpoints every 2 sequence numbers, so 10 is the latest stable one
            assert_eq!(replica.stable_checkpoint().sequence, 10);
            assert_eq!(replica.watermarks(), (10, 14));
            for sequence in 1..=10 {
                assert!(replica.slot(0, sequence).is_none());
            }
            assert!(replica.slot(0, 11).is_some());
        }
        assert!(network.faults().is_empty());
    }

    #[test_traced]
    fn test_window_exhaustion_resumes_after_checkpoint() {
        let mut network = network(4, 1);

        // Submit more requests than the window holds before processing anything
        let requests: Vec<Request> = (1..=9).map(request).collect();
        for request in requests.iter() {
            network.request(request.clone());
        }
        network.process();

        for replica in network.replicas.iter() {
            assert_eq!(replica.last_executed(), 9);
        }
        check_agreement(&network);
    }

    #[test_traced]
    fn test_silent_primary() {
        let mut network = network(4, 1);

        // Replica 0 (primary of view 0) never speaks
        network.set_filter(|from, _, _| {
            if from == 0 {
                Filter::Drop
            } else {
                Filter::Deliver
            }
        });
        let request = request(1);
        let digest = request.digest();
        network.request(request);
        network.process();
        for replica in network.replicas.iter() {
            assert_eq!(replica.last_executed(), 0);
        }

        // All request timers fire, backups move to view 1 (primary is replica 1)
        network.advance(Duration::from_secs(2));
        for replica in network.replicas.iter().skip(1) {
            assert_eq!(replica.view(), 1);
            assert_eq!(replica.mode(), Mode::Normal);
            assert_eq!(replica.executor().executed(), &[(1, Some(digest))]);
        }
        check_agreement(&network);
    }

    #[test_traced]
    fn test_prepared_request_survives_view_change() {
        let mut network = network(4, 1);

        // Drop all commits so the request prepares everywhere but never commits in view 0
        network.set_filter(|_, _, message| match message {
            Message::Commit(_) => Filter::Drop,
            _ => Filter::Deliver,
        });
        let first = request(1);
        let digest = first.digest();
        network.request(first);
        network.process();
        for replica in network.replicas.iter() {
            assert_eq!(replica.slot(0, 1).unwrap().status(), slot::Status::Prepared);
        }

        // Heal and let timers fire
        network.clear_filter();
        network.advance(Duration::from_secs(2));
        network.process();
        for replica in network.replicas.iter() {
            assert_eq!(replica.view(), 1);
            assert_eq!(replica.executor().executed(), &[(1, Some(digest))]);
        }

        // The new primary keeps ordering requests
        let second = request(2);
        let digest = second.digest();
        network.request(second);
        network.process();
        for replica in network.replicas.iter() {
            assert_eq!(replica.executor().executed()[1], (2, Some(digest)));
        }
        check_agreement(&network);
    }

    #[test_traced]
    fn test_committed_request_is_not_executed_twice() {
        let mut network = network(4, 1);
        let first = request(1);
        network.request(first.clone());
        network.process();

        // Every replica suspects the primary anyway
        network.request(request(2));
        network.set_filter(|from, _, _| {
            if from == 0 {
                Filter::Drop
            } else {
                Filter::Deliver
            }
        });
        network.process();
        network.advance(Duration::from_secs(2));
        network.process();

        for replica in network.replicas.iter().skip(1) {
            assert_eq!(replica.view(), 1);
            let executed = replica.executor().executed();
            assert_eq!(executed[0], (1, Some(first.digest())));
            assert_eq!(
                executed.iter().filter(|(_, d)| *d == Some(first.digest())).count(),
                1
            );
        }
        check_agreement(&network);
    }

    #[test_traced]
    fn test_conflicting_pre_prepare() {
        let mut replica = Replica::new(config(1, 4, 1), Application::default(), Trusting).unwrap();
        let first = request(1);
        let second = request(2);
        let pre_prepare = |request: &Request| PrePrepare {
            view: 0,
            sequence: 1,
            digest: request.digest(),
            request: Some(request.clone()),
            primary: 0,
        };

        let actions = replica.handle(Event::Message {
            from: 0,
            message: Message::PrePrepare(pre_prepare(&first)),
        });
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Broadcast(Message::Prepare(vote)) if vote.digest == first.digest()
        )));

        // A second pre-prepare for the same slot is evidence, not an instruction
        let actions = replica.handle(Event::Message {
            from: 0,
            message: Message::PrePrepare(pre_prepare(&second)),
        });
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Report(Fault::ConflictingPrePrepare { .. })
        )));
        assert!(!actions
            .iter()
            .any(|action| matches!(action, Action::Broadcast(_))));
        assert_eq!(replica.slot(0, 1).unwrap().digest(), Some(first.digest()));
        assert_eq!(replica.view(), 0);
    }

    #[test_traced]
    fn test_prepare_below_watermark_is_dropped() {
        let mut cfg = config(3, 4, 1);
        cfg.checkpoint_period = 10;
        cfg.log_multiplier = 2;
        let mut replica = Replica::new(cfg, Application::default(), Trusting).unwrap();

        // Three replicas vouch for checkpoint 100, which this replica has not reached
        let state = Digest::from([7u8; 32]);
        let clients = Clients::from([(1, 100)]);
        let snapshot = Snapshot {
            sequence: 100,
            digest: checkpoint_digest(&state, &clients),
        };
        let mut transfer = None;
        for from in 0..3 {
            for action in replica.handle(Event::Message {
                from,
                message: Message::Checkpoint(types::Checkpoint {
                    snapshot,
                    replica: from,
                }),
            }) {
                if let Action::StateTransfer { sequence, peers, .. } = action {
                    transfer = Some((sequence, peers));
                }
            }
        }
        assert_eq!(transfer, Some((100, vec![0, 1])));
        assert_eq!(replica.watermarks(), (100, 120));
        assert!(replica.is_suspended());

        // Scenario: a prepare for an already checkpointed sequence creates no state
        let actions = replica.handle(Event::Message {
            from: 1,
            message: Message::Prepare(Vote {
                view: 0,
                sequence: 5,
                digest: request(5).digest(),
                replica: 1,
            }),
        });
        assert!(actions.is_empty());
        assert!(replica.slot(0, 5).is_none());

        // Scenario: a stale commit leaves the stable checkpoint untouched
        let actions = replica.handle(Event::Message {
            from: 2,
            message: Message::Commit(Vote {
                view: 0,
                sequence: 100,
                digest: request(100).digest(),
                replica: 2,
            }),
        });
        assert!(actions.is_empty());
        assert_eq!(replica.stable_checkpoint(), snapshot);

        // A failed transfer, or one whose client table does not match, keeps it suspended
        replica.handle(Event::StateTransferFailed { sequence: 100 });
        assert!(replica.is_suspended());
        replica.handle(Event::StateTransferred {
            sequence: 100,
            state,
            clients: Clients::new(),
        });
        assert!(replica.is_suspended());
        assert_eq!(replica.last_executed(), 0);

        // Completing the transfer resumes the replica at the checkpoint
        replica.handle(Event::StateTransferred {
            sequence: 100,
            state,
            clients: clients.clone(),
        });
        assert!(!replica.is_suspended());
        assert_eq!(replica.last_executed(), 100);
        assert_eq!(replica.executor().state_digest(), state);
        assert_eq!(replica.checkpoint_state(100), Some((state, &clients)));

        // Requests the installed state already executed are not taken up again
        assert!(replica.handle(Event::Request(request(100))).is_empty());
        assert!(replica.handle(Event::Request(request(99))).is_empty());
        assert_eq!(replica.outstanding(), 0);
    }

    #[test_traced]
    fn test_diverged_replica_recovers() {
        let replicas = (0..4)
            .map(|me| {
                let application = if me == 2 {
                    Application::corrupted()
                } else {
                    Application::default()
                };
                Replica::new(config(me, 4, 1), application, Trusting).unwrap()
            })
            .collect();
        let mut network = Network::new(replicas);
        for id in 1..=4 {
            network.request(request(id));
            network.process();
        }

        // Replica 2 computed a different state, noticed at the first stable checkpoint
        assert!(network.transfers().iter().any(|(id, _)| *id == 2));
        let expected = network.replicas[0].executor().state_digest();
        for replica in network.replicas.iter() {
            assert_eq!(replica.last_executed(), 4);
            assert_eq!(replica.executor().state_digest(), expected);
            assert!(!replica.is_suspended());
        }
    }

    #[test_traced]
    fn test_lagging_replica_catches_up() {
        let mut network = network(4, 1);

        // Replica 3 hears nothing (including the only request of a second client)
        network.set_filter(|_, to, _| if to == 3 { Filter::Drop } else { Filter::Deliver });
        let other = Request::new(2, 1, Bytes::from_static(b"other"));
        network.request_to(&[0, 1, 2], other.clone());
        network.process();
        for id in 2..=10 {
            network.request_to(&[0, 1, 2], request(id));
            network.process();
        }
        assert_eq!(network.replicas[3].last_executed(), 0);
        assert_eq!(network.replicas[0].last_executed(), 10);

        // Once healed, checkpoints above its window reveal that it fell behind
        network.clear_filter();
        for id in 11..=14 {
            network.request(request(id));
            network.process();
        }
        assert!(network.transfers().iter().any(|(id, _)| *id == 3));
        let lagging = &network.replicas[3];
        assert!(lagging.stable_checkpoint().sequence >= 12);
        assert_eq!(lagging.last_executed(), network.replicas[0].last_executed());
        assert_eq!(
            lagging.executor().state_digest(),
            network.replicas[0].executor().state_digest()
        );

        // The transferred client table covers the second client's request, so a retry of it
        // is ignored instead of waiting for a sequence number that never comes
        network.request_to(&[3], other);
        network.process();
        let lagging = &network.replicas[3];
        assert_eq!(lagging.outstanding(), 0);
        assert_eq!(lagging.mode(), Mode::Normal);
        network.advance(Duration::from_secs(10));
        assert_eq!(network.replicas[3].mode(), Mode::Normal);
    }

    #[test_traced]
    fn test_view_never_decreases_under_random_messages() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut mutator = Mutator::new(StdRng::seed_from_u64(1));
        let mut primary = Replica::new(config(0, 4, 1), Application::default(), Trusting).unwrap();
        let mut backup = Replica::new(config(1, 4, 1), Application::default(), Trusting).unwrap();
        let mut views = (0, 0);
        for _ in 0..500 {
            let message = mutator.message();
            let from = rng.gen_range(0..4);
            primary.handle(Event::Message {
                from,
                message: message.clone(),
            });
            backup.handle(Event::Message { from, message });
            assert!(primary.view() >= views.0);
            assert!(backup.view() >= views.1);
            views = (primary.view(), backup.view());
        }
    }

    #[test_traced]
    fn test_minimal_fuzz() {
        let mut network = network(4, 1);
        let mutator = std::rc::Rc::new(std::cell::RefCell::new(Mutator::new(
            StdRng::seed_from_u64(0),
        )));
        let fuzzed = std::rc::Rc::new(std::cell::Cell::new(0u32));
        let mut rng = StdRng::seed_from_u64(42);

        let filter_mutator = mutator.clone();
        let filter_fuzzed = fuzzed.clone();
        network.set_filter(move |from, _, message| {
            if from != filter_fuzzed.get() || matches!(message, Message::Request(_)) {
                return Filter::Deliver;
            }
            let mut message = message.clone();
            filter_mutator.borrow_mut().mutate(&mut message);
            Filter::Replace(message)
        });

        let mut stalled = 0;
        for id in 1..30 {
            if id % 3 == 0 {
                fuzzed.set(rng.gen_range(0..4));
            }
            let before: Vec<Sequence> = network.replicas.iter().map(|r| r.last_executed()).collect();
            network.request(request(id));
            network.process();

            let progressed = network
                .replicas
                .iter()
                .zip(before)
                .filter(|(replica, before)| replica.last_executed() > *before)
                .count();
            if progressed < network.replicas.len() / 3 {
                stalled += 1;
            }
            if stalled > 1 {
                stalled = 0;
                network.advance(Duration::from_secs(2));
                network.process();
            }
            check_agreement(&network);
        }
    }

    #[test]
    fn test_invalid_configuration() {
        let cfg = config(0, 3, 1);
        assert!(matches!(
            Replica::new(cfg, Application::default(), Trusting),
            Err(Error::TooFewReplicas(3, 1))
        ));
        let mut cfg = config(0, 4, 1);
        cfg.checkpoint_period = 0;
        assert!(matches!(
            Replica::new(cfg, Application::default(), Trusting),
            Err(Error::InvalidCheckpointPeriod)
        ));
    }

    #[test]
    fn test_sender_bound() {
        let vote = Vote {
            view: 0,
            sequence: 1,
            digest: null_digest(),
            replica: 2,
        };
        assert!(SenderBound.verify(2, &Message::Prepare(vote)));
        assert!(!SenderBound.verify(3, &Message::Prepare(vote)));
        assert!(SenderBound.verify(3, &Message::Request(request(1))));
        assert!(Trusting.verify(3, &Message::Prepare(vote)));
    }
}
