//! Random corruption and generation of [Message]s.
//!
//! Integer fields are nudged by a signed, Zipf-distributed amount (so small offsets that land
//! just outside a window or view are the common case). Payloads and digests are replaced with
//! random printable bytes. Repeated fields may lose, gain, or alter an element. Replica
//! identifiers are never touched (the network, not the mutator, decides who speaks).

use crate::{
    types::{Checkpoint, Entry, Message, NewView, PrePrepare, Request, Snapshot, ViewChange, Vote},
    ReplicaId, Sequence, View,
};
use bytes::Bytes;
use commonware_cryptography::sha256::Digest;
use rand::Rng;
use rand_distr::{Distribution, Zipf};

/// Largest offset applied to an integer field.
const MAX_OFFSET: u64 = 200;

/// Exponent of the offset distribution.
const EXPONENT: f64 = 3.0;

pub struct Mutator<R: Rng> {
    rng: R,
    offset: Zipf<f64>,
}

impl<R: Rng> Mutator<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            offset: Zipf::new(MAX_OFFSET, EXPONENT).expect("valid distribution"),
        }
    }

    /// Corrupts one field of `message`.
    pub fn mutate(&mut self, message: &mut Message) {
        match message {
            Message::Request(request) => self.request(request),
            Message::PrePrepare(pre_prepare) => self.pre_prepare(pre_prepare),
            Message::Prepare(vote) | Message::Commit(vote) => self.vote(vote),
            Message::Checkpoint(checkpoint) => self.snapshot(&mut checkpoint.snapshot),
            Message::ViewChange(view_change) => self.view_change(view_change),
            Message::NewView(new_view) => self.new_view(new_view),
        }
    }

    /// Generates a plausible (but unauthenticated) message.
    pub fn message(&mut self) -> Message {
        match self.rng.gen_range(0..7) {
            0 => Message::Request(self.random_request()),
            1 => Message::PrePrepare(self.random_pre_prepare()),
            2 => Message::Prepare(self.random_vote()),
            3 => Message::Commit(self.random_vote()),
            4 => Message::Checkpoint(Checkpoint {
                snapshot: self.random_snapshot(),
                replica: self.random_replica(),
            }),
            5 => Message::ViewChange(self.random_view_change()),
            _ => {
                let view = self.random_view();
                let count = self.rng.gen_range(0..4);
                Message::NewView(NewView {
                    view,
                    primary: self.random_replica(),
                    view_changes: (0..count).map(|_| self.random_view_change()).collect(),
                    checkpoint: self.random_snapshot(),
                    selected: (0..self.rng.gen_range(0..3))
                        .map(|_| self.random_pre_prepare())
                        .collect(),
                })
            }
        }
    }

    fn int(&mut self, value: u64) -> u64 {
        let offset = self.offset.sample(&mut self.rng) as u64;
        if self.rng.gen_bool(0.5) {
            value.saturating_add(offset)
        } else {
            value.saturating_sub(offset)
        }
    }

    fn printable(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.rng.gen_range(0x20u8..0x7f)).collect()
    }

    fn digest(&mut self) -> Digest {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.printable(32));
        Digest::from(bytes)
    }

    fn request(&mut self, request: &mut Request) {
        match self.rng.gen_range(0..3) {
            0 => request.client = self.int(request.client),
            1 => request.timestamp = self.int(request.timestamp),
            _ => {
                let len = self.int(request.payload.len() as u64).min(64) as usize;
                request.payload = Bytes::from(self.printable(len));
            }
        }
    }

    fn pre_prepare(&mut self, pre_prepare: &mut PrePrepare) {
        match self.rng.gen_range(0..4) {
            0 => pre_prepare.view = self.int(pre_prepare.view),
            1 => pre_prepare.sequence = self.int(pre_prepare.sequence),
            2 => pre_prepare.digest = self.digest(),
            _ => {
                if pre_prepare.request.is_some() && self.rng.gen_bool(0.8) {
                    if let Some(request) = pre_prepare.request.as_mut() {
                        self.request(request);
                    }
                } else {
                    pre_prepare.request = None;
                }
            }
        }
    }

    fn vote(&mut self, vote: &mut Vote) {
        match self.rng.gen_range(0..3) {
            0 => vote.view = self.int(vote.view),
            1 => vote.sequence = self.int(vote.sequence),
            _ => vote.digest = self.digest(),
        }
    }

    fn snapshot(&mut self, snapshot: &mut Snapshot) {
        if self.rng.gen_bool(0.5) {
            snapshot.sequence = self.int(snapshot.sequence);
        } else {
            snapshot.digest = self.digest();
        }
    }

    fn entry(&mut self, entry: &mut Entry) {
        match self.rng.gen_range(0..3) {
            0 => entry.view = self.int(entry.view),
            1 => entry.sequence = self.int(entry.sequence),
            _ => entry.digest = self.digest(),
        }
    }

    /// Alters, removes, or duplicates one element of `items`.
    fn slice<T: Clone>(&mut self, items: &mut Vec<T>, mut alter: impl FnMut(&mut Self, &mut T)) {
        if items.is_empty() {
            return;
        }
        let index = self.rng.gen_range(0..items.len());
        match self.rng.gen_range(0..3) {
            0 => alter(self, &mut items[index]),
            1 => {
                items.remove(index);
            }
            _ => {
                let mut item = items[index].clone();
                alter(self, &mut item);
                items.push(item);
            }
        }
    }

    fn view_change(&mut self, view_change: &mut ViewChange) {
        match self.rng.gen_range(0..5) {
            0 => view_change.view = self.int(view_change.view),
            1 => self.snapshot(&mut view_change.stable),
            2 => self.slice(&mut view_change.checkpoints, Self::snapshot),
            3 => self.slice(&mut view_change.prepared, Self::pre_prepare),
            _ => self.slice(&mut view_change.pre_prepared, Self::entry),
        }
    }

    fn new_view(&mut self, new_view: &mut NewView) {
        match self.rng.gen_range(0..4) {
            0 => new_view.view = self.int(new_view.view),
            1 => self.slice(&mut new_view.view_changes, Self::view_change),
            2 => self.snapshot(&mut new_view.checkpoint),
            _ => self.slice(&mut new_view.selected, Self::pre_prepare),
        }
    }

    fn random_view(&mut self) -> View {
        self.rng.gen_range(0..4)
    }

    fn random_sequence(&mut self) -> Sequence {
        self.rng.gen_range(0..16)
    }

    fn random_replica(&mut self) -> ReplicaId {
        self.rng.gen_range(0..5)
    }

    fn random_request(&mut self) -> Request {
        let client = self.rng.gen_range(0..3);
        let timestamp = self.rng.gen_range(0..16);
        let len = self.rng.gen_range(0..16);
        Request::new(client, timestamp, Bytes::from(self.printable(len)))
    }

    fn random_pre_prepare(&mut self) -> PrePrepare {
        let view = self.random_view();
        let sequence = self.random_sequence();
        let request = self.random_request();
        let digest = request.digest();
        PrePrepare {
            view,
            sequence,
            digest,
            request: Some(request),
            primary: self.random_replica(),
        }
    }

    fn random_vote(&mut self) -> Vote {
        let digest = if self.rng.gen_bool(0.5) {
            self.random_request().digest()
        } else {
            self.digest()
        };
        Vote {
            view: self.random_view(),
            sequence: self.random_sequence(),
            digest,
            replica: self.random_replica(),
        }
    }

    fn random_snapshot(&mut self) -> Snapshot {
        Snapshot {
            sequence: self.random_sequence(),
            digest: self.digest(),
        }
    }

    fn random_view_change(&mut self) -> ViewChange {
        let prepared = (0..self.rng.gen_range(0..3))
            .map(|_| self.random_pre_prepare())
            .collect::<Vec<_>>();
        let pre_prepared = prepared.iter().map(PrePrepare::entry).collect();
        ViewChange {
            view: self.random_view(),
            replica: self.random_replica(),
            stable: self.random_snapshot(),
            checkpoints: Vec::new(),
            prepared,
            pre_prepared,
        }
    }
}
