//! Messages exchanged between replicas.
//!
//! Every message is a variant of [Message], a closed tagged envelope. Decoding is bounded by
//! [Limits] so that untrusted input can never force an unbounded allocation.

use crate::{ReplicaId, Sequence, View};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::{sha256::Digest, Hasher, Sha256};
use std::collections::BTreeMap;

/// Bounds enforced while decoding untrusted messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size (in bytes) of a request payload.
    pub max_request_size: usize,

    /// Maximum number of entries in any repeated field.
    pub max_entries: usize,
}

/// Digest assigned to the null request (a no-op that fills a sequence gap after a view change).
///
/// This is the hash of no input, which never collides with the digest of an encoded [Request].
pub fn null_digest() -> Digest {
    let mut hasher = Sha256::default();
    hasher.finalize()
}

/// Highest executed timestamp of each client.
pub type Clients = BTreeMap<u64, u64>;

/// Digest a checkpoint vouches for: the executor's state digest bound to the client table.
///
/// The client table decides which committed requests are duplicates, so replicas that agree on
/// a checkpoint must also agree on it.
pub fn checkpoint_digest(state: &Digest, clients: &Clients) -> Digest {
    let mut hasher = Sha256::default();
    hasher.update(state);
    for (client, timestamp) in clients {
        hasher.update(&client.to_be_bytes());
        hasher.update(&timestamp.to_be_bytes());
    }
    hasher.finalize()
}

/// An opaque payload submitted by a client.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Request {
    /// Identity of the submitter.
    pub client: u64,

    /// Submitter-assigned, monotonically increasing identifier (keeps equal payloads distinct).
    pub timestamp: u64,

    /// Opaque payload.
    pub payload: Bytes,
}

impl Request {
    pub fn new(client: u64, timestamp: u64, payload: Bytes) -> Self {
        Self {
            client,
            timestamp,
            payload,
        }
    }

    /// Fingerprint of the encoded request.
    pub fn digest(&self) -> Digest {
        let mut buf = Vec::with_capacity(self.encode_size());
        self.write(&mut buf);
        let mut hasher = Sha256::default();
        hasher.update(&buf);
        hasher.finalize()
    }
}

impl Write for Request {
    fn write(&self, buf: &mut impl BufMut) {
        self.client.write(buf);
        self.timestamp.write(buf);
        self.payload.write(buf);
    }
}

impl EncodeSize for Request {
    fn encode_size(&self) -> usize {
        u64::SIZE + u64::SIZE + self.payload.encode_size()
    }
}

impl Read for Request {
    /// Maximum payload size.
    type Cfg = usize;

    fn read_cfg(reader: &mut impl Buf, max: &usize) -> Result<Self, Error> {
        let client = u64::read(reader)?;
        let timestamp = u64::read(reader)?;
        let payload = Bytes::read_cfg(reader, &(..=*max).into())?;
        Ok(Self {
            client,
            timestamp,
            payload,
        })
    }
}

/// Assignment of a request (or the null request) to `(view, sequence)` by the primary.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PrePrepare {
    pub view: View,
    pub sequence: Sequence,
    pub digest: Digest,

    /// `None` for the null request.
    pub request: Option<Request>,
    pub primary: ReplicaId,
}

impl PrePrepare {
    /// Returns true if this pre-prepare carries the null request.
    pub fn is_null(&self) -> bool {
        self.request.is_none()
    }

    /// Returns true if the digest matches the carried request (or the null digest).
    pub fn is_consistent(&self) -> bool {
        match &self.request {
            Some(request) => request.digest() == self.digest,
            None => self.digest == null_digest(),
        }
    }

    /// Summary of this pre-prepare without the request body.
    pub fn entry(&self) -> Entry {
        Entry {
            view: self.view,
            sequence: self.sequence,
            digest: self.digest,
        }
    }
}

impl Write for PrePrepare {
    fn write(&self, buf: &mut impl BufMut) {
        self.view.write(buf);
        self.sequence.write(buf);
        self.digest.write(buf);
        self.request.write(buf);
        self.primary.write(buf);
    }
}

impl EncodeSize for PrePrepare {
    fn encode_size(&self) -> usize {
        View::SIZE
            + Sequence::SIZE
            + Digest::SIZE
            + self.request.encode_size()
            + ReplicaId::SIZE
    }
}

impl Read for PrePrepare {
    /// Maximum payload size.
    type Cfg = usize;

    fn read_cfg(reader: &mut impl Buf, max: &usize) -> Result<Self, Error> {
        let view = View::read(reader)?;
        let sequence = Sequence::read(reader)?;
        let digest = Digest::read(reader)?;
        let request = Option::<Request>::read_cfg(reader, max)?;
        let primary = ReplicaId::read(reader)?;
        Ok(Self {
            view,
            sequence,
            digest,
            request,
            primary,
        })
    }
}

/// A vote for `(view, sequence, digest)`, used by both [Message::Prepare] and [Message::Commit].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Vote {
    pub view: View,
    pub sequence: Sequence,
    pub digest: Digest,
    pub replica: ReplicaId,
}

impl Write for Vote {
    fn write(&self, buf: &mut impl BufMut) {
        self.view.write(buf);
        self.sequence.write(buf);
        self.digest.write(buf);
        self.replica.write(buf);
    }
}

impl FixedSize for Vote {
    const SIZE: usize = View::SIZE + Sequence::SIZE + Digest::SIZE + ReplicaId::SIZE;
}

impl Read for Vote {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let view = View::read(reader)?;
        let sequence = Sequence::read(reader)?;
        let digest = Digest::read(reader)?;
        let replica = ReplicaId::read(reader)?;
        Ok(Self {
            view,
            sequence,
            digest,
            replica,
        })
    }
}

/// A `(sequence, state digest)` pair identifying application state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Snapshot {
    pub sequence: Sequence,
    pub digest: Digest,
}

impl Write for Snapshot {
    fn write(&self, buf: &mut impl BufMut) {
        self.sequence.write(buf);
        self.digest.write(buf);
    }
}

impl FixedSize for Snapshot {
    const SIZE: usize = Sequence::SIZE + Digest::SIZE;
}

impl Read for Snapshot {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let sequence = Sequence::read(reader)?;
        let digest = Digest::read(reader)?;
        Ok(Self { sequence, digest })
    }
}

/// A replica's vote on the application state after executing `snapshot.sequence`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Checkpoint {
    pub snapshot: Snapshot,
    pub replica: ReplicaId,
}

impl Write for Checkpoint {
    fn write(&self, buf: &mut impl BufMut) {
        self.snapshot.write(buf);
        self.replica.write(buf);
    }
}

impl FixedSize for Checkpoint {
    const SIZE: usize = Snapshot::SIZE + ReplicaId::SIZE;
}

impl Read for Checkpoint {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let snapshot = Snapshot::read(reader)?;
        let replica = ReplicaId::read(reader)?;
        Ok(Self { snapshot, replica })
    }
}

/// A pre-prepared entry carried in a [ViewChange] (without the request body).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Entry {
    pub view: View,
    pub sequence: Sequence,
    pub digest: Digest,
}

impl Write for Entry {
    fn write(&self, buf: &mut impl BufMut) {
        self.view.write(buf);
        self.sequence.write(buf);
        self.digest.write(buf);
    }
}

impl FixedSize for Entry {
    const SIZE: usize = View::SIZE + Sequence::SIZE + Digest::SIZE;
}

impl Read for Entry {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let view = View::read(reader)?;
        let sequence = Sequence::read(reader)?;
        let digest = Digest::read(reader)?;
        Ok(Self {
            view,
            sequence,
            digest,
        })
    }
}

/// A replica's request to move to `view`, carrying everything the next primary needs to
/// preserve agreement across the transition.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ViewChange {
    /// Target view.
    pub view: View,
    pub replica: ReplicaId,

    /// Latest stable checkpoint (the sender's low watermark).
    pub stable: Snapshot,

    /// Checkpoints the sender has produced at or above `stable`.
    pub checkpoints: Vec<Snapshot>,

    /// Pre-prepares (with requests) the sender reached Prepared for above `stable`.
    pub prepared: Vec<PrePrepare>,

    /// Entries the sender accepted a pre-prepare for but did not prepare, above `stable`.
    pub pre_prepared: Vec<Entry>,
}

impl Write for ViewChange {
    fn write(&self, buf: &mut impl BufMut) {
        self.view.write(buf);
        self.replica.write(buf);
        self.stable.write(buf);
        self.checkpoints.write(buf);
        self.prepared.write(buf);
        self.pre_prepared.write(buf);
    }
}

impl EncodeSize for ViewChange {
    fn encode_size(&self) -> usize {
        View::SIZE
            + ReplicaId::SIZE
            + Snapshot::SIZE
            + self.checkpoints.encode_size()
            + self.prepared.encode_size()
            + self.pre_prepared.encode_size()
    }
}

impl Read for ViewChange {
    type Cfg = Limits;

    fn read_cfg(reader: &mut impl Buf, limits: &Limits) -> Result<Self, Error> {
        let view = View::read(reader)?;
        let replica = ReplicaId::read(reader)?;
        let stable = Snapshot::read(reader)?;
        let checkpoints =
            Vec::<Snapshot>::read_cfg(reader, &((..=limits.max_entries).into(), ()))?;
        let prepared = Vec::<PrePrepare>::read_cfg(
            reader,
            &((..=limits.max_entries).into(), limits.max_request_size),
        )?;
        let pre_prepared = Vec::<Entry>::read_cfg(reader, &((..=limits.max_entries).into(), ()))?;
        Ok(Self {
            view,
            replica,
            stable,
            checkpoints,
            prepared,
            pre_prepared,
        })
    }
}

/// The new primary's proof that `view` is installed, with the pre-prepares re-issued in it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NewView {
    pub view: View,
    pub primary: ReplicaId,

    /// The `2f+1` (or more) [ViewChange] records the selection was computed from.
    pub view_changes: Vec<ViewChange>,

    /// Checkpoint the new view starts from.
    pub checkpoint: Snapshot,

    /// Re-issued pre-prepares for every sequence in `(checkpoint, max]` (null for gaps).
    pub selected: Vec<PrePrepare>,
}

impl Write for NewView {
    fn write(&self, buf: &mut impl BufMut) {
        self.view.write(buf);
        self.primary.write(buf);
        self.view_changes.write(buf);
        self.checkpoint.write(buf);
        self.selected.write(buf);
    }
}

impl EncodeSize for NewView {
    fn encode_size(&self) -> usize {
        View::SIZE
            + ReplicaId::SIZE
            + self.view_changes.encode_size()
            + Snapshot::SIZE
            + self.selected.encode_size()
    }
}

impl Read for NewView {
    type Cfg = Limits;

    fn read_cfg(reader: &mut impl Buf, limits: &Limits) -> Result<Self, Error> {
        let view = View::read(reader)?;
        let primary = ReplicaId::read(reader)?;
        let view_changes =
            Vec::<ViewChange>::read_cfg(reader, &((..=limits.max_entries).into(), *limits))?;
        let checkpoint = Snapshot::read(reader)?;
        let selected = Vec::<PrePrepare>::read_cfg(
            reader,
            &((..=limits.max_entries).into(), limits.max_request_size),
        )?;
        Ok(Self {
            view,
            primary,
            view_changes,
            checkpoint,
            selected,
        })
    }
}

/// Envelope for all traffic between replicas.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Message {
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Vote),
    Commit(Vote),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(NewView),
}

impl Message {
    /// Short, human-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::PrePrepare(_) => "pre_prepare",
            Message::Prepare(_) => "prepare",
            Message::Commit(_) => "commit",
            Message::Checkpoint(_) => "checkpoint",
            Message::ViewChange(_) => "view_change",
            Message::NewView(_) => "new_view",
        }
    }

    /// Replica the message claims to originate from (requests have no replica sender).
    pub fn sender(&self) -> Option<ReplicaId> {
        match self {
            Message::Request(_) => None,
            Message::PrePrepare(pre_prepare) => Some(pre_prepare.primary),
            Message::Prepare(vote) | Message::Commit(vote) => Some(vote.replica),
            Message::Checkpoint(checkpoint) => Some(checkpoint.replica),
            Message::ViewChange(view_change) => Some(view_change.replica),
            Message::NewView(new_view) => Some(new_view.primary),
        }
    }
}

impl Write for Message {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Message::Request(v) => {
                0u8.write(buf);
                v.write(buf);
            }
            Message::PrePrepare(v) => {
                1u8.write(buf);
                v.write(buf);
            }
            Message::Prepare(v) => {
                2u8.write(buf);
                v.write(buf);
            }
            Message::Commit(v) => {
                3u8.write(buf);
                v.write(buf);
            }
            Message::Checkpoint(v) => {
                4u8.write(buf);
                v.write(buf);
            }
            Message::ViewChange(v) => {
                5u8.write(buf);
                v.write(buf);
            }
            Message::NewView(v) => {
                6u8.write(buf);
                v.write(buf);
            }
        }
    }
}

impl EncodeSize for Message {
    fn encode_size(&self) -> usize {
        1 + match self {
            Message::Request(v) => v.encode_size(),
            Message::PrePrepare(v) => v.encode_size(),
            Message::Prepare(_) | Message::Commit(_) => Vote::SIZE,
            Message::Checkpoint(_) => Checkpoint::SIZE,
            Message::ViewChange(v) => v.encode_size(),
            Message::NewView(v) => v.encode_size(),
        }
    }
}

impl Read for Message {
    type Cfg = Limits;

    fn read_cfg(reader: &mut impl Buf, limits: &Limits) -> Result<Self, Error> {
        let tag = u8::read(reader)?;
        match tag {
            0 => {
                let v = Request::read_cfg(reader, &limits.max_request_size)?;
                Ok(Message::Request(v))
            }
            1 => {
                let v = PrePrepare::read_cfg(reader, &limits.max_request_size)?;
                Ok(Message::PrePrepare(v))
            }
            2 => {
                let v = Vote::read(reader)?;
                Ok(Message::Prepare(v))
            }
            3 => {
                let v = Vote::read(reader)?;
                Ok(Message::Commit(v))
            }
            4 => {
                let v = Checkpoint::read(reader)?;
                Ok(Message::Checkpoint(v))
            }
            5 => {
                let v = ViewChange::read_cfg(reader, limits)?;
                Ok(Message::ViewChange(v))
            }
            6 => {
                let v = NewView::read_cfg(reader, limits)?;
                Ok(Message::NewView(v))
            }
            _ => Err(Error::InvalidEnum(tag)),
        }
    }
}
