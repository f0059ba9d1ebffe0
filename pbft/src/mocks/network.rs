//! A deterministic, in-memory network connecting [Replica]s.
//!
//! Every message is encoded on send and decoded on delivery (so the codec is exercised on all
//! traffic). Delivery is FIFO across the whole network. Timers run on a virtual clock that only
//! moves when [Network::advance] is called. A state transfer copies the checkpointed state of the
//! first peer that still holds it (and fails if none does).

use crate::{
    types::{checkpoint_digest, Clients, Limits, Message, Request},
    Action, Authenticator, Event, Executor, Fault, Replica, ReplicaId, Sequence,
    Timer,
};
use bytes::Bytes;
use commonware_codec::{Decode, Encode};
use commonware_cryptography::sha256::Digest;
use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};
use tracing::{debug, trace};

/// Upper bound on deliveries in a single call to [Network::process].
const MAX_DELIVERIES: usize = 1_000_000;

/// Decision made by a filter for a message in flight.
pub enum Filter {
    Deliver,
    Drop,
    Replace(Message),
}

type FilterFn = Box<dyn FnMut(ReplicaId, ReplicaId, &Message) -> Filter>;

enum Envelope {
    Message {
        from: ReplicaId,
        to: ReplicaId,
        bytes: Bytes,
    },
    Transferred {
        to: ReplicaId,
        sequence: Sequence,
        state: Digest,
        clients: Clients,
    },
    Failed {
        to: ReplicaId,
        sequence: Sequence,
    },
}

pub struct Network<X: Executor, A: Authenticator> {
    pub replicas: Vec<Replica<X, A>>,

    limits: Limits,
    queue: VecDeque<Envelope>,
    filter: Option<FilterFn>,

    now: Duration,
    order: u64,
    timers: BTreeMap<(Duration, u64), (ReplicaId, Timer)>,

    faults: Vec<(ReplicaId, Fault)>,
    transfers: Vec<(ReplicaId, Sequence)>,
}

impl<X: Executor, A: Authenticator> Network<X, A> {
    /// Connects `replicas`, where the replica at index `i` has identifier `i`.
    pub fn new(replicas: Vec<Replica<X, A>>) -> Self {
        let limits = replicas
            .first()
            .map(|replica| replica.config().limits())
            .unwrap_or(Limits {
                max_request_size: 0,
                max_entries: 0,
            });
        Self {
            replicas,
            limits,
            queue: VecDeque::new(),
            filter: None,
            now: Duration::ZERO,
            order: 0,
            timers: BTreeMap::new(),
            faults: Vec::new(),
            transfers: Vec::new(),
        }
    }

    /// Applies `filter` to every message delivered from now on.
    pub fn set_filter(
        &mut self,
        filter: impl FnMut(ReplicaId, ReplicaId, &Message) -> Filter + 'static,
    ) {
        self.filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    /// Faults reported by any replica, tagged with the reporter.
    pub fn faults(&self) -> &[(ReplicaId, Fault)] {
        &self.faults
    }

    /// State transfers requested by any replica, tagged with the requester.
    pub fn transfers(&self) -> &[(ReplicaId, Sequence)] {
        &self.transfers
    }

    /// Virtual time elapsed.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Submits `request` to every replica.
    pub fn request(&mut self, request: Request) {
        let all: Vec<ReplicaId> = (0..self.replicas.len() as ReplicaId).collect();
        self.request_to(&all, request);
    }

    /// Submits `request` to the replicas in `to`.
    pub fn request_to(&mut self, to: &[ReplicaId], request: Request) {
        for id in to {
            let actions = self.replicas[*id as usize].handle(Event::Request(request.clone()));
            self.dispatch(*id, actions);
        }
    }

    /// Delivers messages until the network is quiet.
    pub fn process(&mut self) {
        let mut deliveries = 0;
        while let Some(envelope) = self.queue.pop_front() {
            deliveries += 1;
            assert!(deliveries <= MAX_DELIVERIES, "network did not quiesce");
            match envelope {
                Envelope::Message { from, to, bytes } => self.deliver(from, to, bytes),
                Envelope::Transferred {
                    to,
                    sequence,
                    state,
                    clients,
                } => {
                    let actions = self.replicas[to as usize].handle(Event::StateTransferred {
                        sequence,
                        state,
                        clients,
                    });
                    self.dispatch(to, actions);
                }
                Envelope::Failed { to, sequence } => {
                    let actions =
                        self.replicas[to as usize].handle(Event::StateTransferFailed { sequence });
                    self.dispatch(to, actions);
                }
            }
        }
    }

    /// Moves the clock forward by `duration`, firing due timers (and processing the traffic each
    /// one causes) in deadline order.
    pub fn advance(&mut self, duration: Duration) {
        let end = self.now + duration;
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > end {
                break;
            }
            let ((deadline, _), (id, timer)) = entry.remove_entry();
            self.now = deadline;
            trace!(id, ?timer, now = ?self.now, "timer fired");
            let actions = self.replicas[id as usize].handle(Event::Timeout(timer));
            self.dispatch(id, actions);
            self.process();
        }
        self.now = end;
    }

    fn deliver(&mut self, from: ReplicaId, to: ReplicaId, bytes: Bytes) {
        let message = match Message::decode_cfg(bytes, &self.limits) {
            Ok(message) => message,
            Err(err) => {
                debug!(from, to, ?err, "undecodable message");
                return;
            }
        };
        let message = match self.filter.as_mut() {
            None => message,
            Some(filter) => match filter(from, to, &message) {
                Filter::Deliver => message,
                Filter::Drop => return,
                Filter::Replace(replacement) => {
                    // The replacement must survive the wire as well
                    match Message::decode_cfg(replacement.encode(), &self.limits) {
                        Ok(message) => message,
                        Err(err) => {
                            debug!(from, to, ?err, "undecodable replacement");
                            return;
                        }
                    }
                }
            },
        };
        let actions = self.replicas[to as usize].handle(Event::Message { from, message });
        self.dispatch(to, actions);
    }

    fn dispatch(&mut self, id: ReplicaId, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast(message) => {
                    let bytes = message.encode().freeze();
                    for to in 0..self.replicas.len() as ReplicaId {
                        if to != id {
                            self.queue.push_back(Envelope::Message {
                                from: id,
                                to,
                                bytes: bytes.clone(),
                            });
                        }
                    }
                }
                Action::Send { to, message } => {
                    if (to as usize) < self.replicas.len() {
                        self.queue.push_back(Envelope::Message {
                            from: id,
                            to,
                            bytes: message.encode().freeze(),
                        });
                    }
                }
                Action::SetTimer { timer, duration } => {
                    self.order += 1;
                    self.timers
                        .insert((self.now + duration, self.order), (id, timer));
                }
                Action::StateTransfer {
                    sequence,
                    digest,
                    peers,
                } => {
                    self.transfers.push((id, sequence));
                    let source = peers.iter().find_map(|peer| {
                        let (state, clients) = self
                            .replicas
                            .get(*peer as usize)?
                            .checkpoint_state(sequence)?;
                        (checkpoint_digest(&state, clients) == digest)
                            .then(|| (state, clients.clone()))
                    });
                    let envelope = match source {
                        Some((state, clients)) => Envelope::Transferred {
                            to: id,
                            sequence,
                            state,
                            clients,
                        },
                        None => {
                            debug!(id, sequence, ?peers, "no peer holds the checkpoint");
                            Envelope::Failed { to: id, sequence }
                        }
                    };
                    self.queue.push_back(envelope);
                }
                Action::Report(fault) => self.faults.push((id, fault)),
            }
        }
    }
}
