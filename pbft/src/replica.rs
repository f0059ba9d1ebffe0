use crate::{
    checkpoint::{Checkpoints, Progress},
    metrics::{Inbound, Metrics},
    quorum::{Kind, Outcome, Tracker},
    sequencer::{Commit, Sequencer},
    slot::{Accept, Log, Slot, Status},
    timer::{Timer, TimerKind, Timers},
    types::{
        checkpoint_digest, Checkpoint, Clients, Message, NewView, PrePrepare, Request, Snapshot,
        ViewChange, Vote,
    },
    validator::{validate, Context, Rejection},
    view_change::{self, Manager, Mode, Received},
    Authenticator, Config, Error, Executor, ReplicaId, Sequence, View,
};
use commonware_cryptography::sha256::Digest;
use prometheus_client::registry::Registry;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};
use tracing::{debug, error, info, trace, warn};

/// Input to a [Replica].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A message received from replica `from`.
    Message { from: ReplicaId, message: Message },

    /// A request submitted directly by a client.
    Request(Request),

    /// A timer previously requested with [Action::SetTimer] fired.
    Timeout(Timer),

    /// The caller fetched the state of checkpoint `sequence`: the executor state identified by
    /// `state` and the client table `clients`.
    ///
    /// The replica accepts it only if the pair matches the checkpoint digest it asked for, and
    /// then installs it with [Executor::restore].
    StateTransferred {
        sequence: Sequence,
        state: Digest,
        clients: Clients,
    },

    /// The state transfer to `sequence` could not be completed.
    StateTransferFailed { sequence: Sequence },
}

/// Output of a [Replica], to be carried out by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Send `message` to every other replica.
    Broadcast(Message),

    /// Send `message` to replica `to`.
    Send { to: ReplicaId, message: Message },

    /// Deliver [Event::Timeout] with `timer` after `duration`.
    SetTimer { timer: Timer, duration: Duration },

    /// Fetch the state of checkpoint `(sequence, digest)` from any of `peers` (which serve it
    /// with [Replica::checkpoint_state]) and report the outcome with [Event::StateTransferred]
    /// or [Event::StateTransferFailed].
    StateTransfer {
        sequence: Sequence,
        digest: Digest,
        peers: Vec<ReplicaId>,
    },

    /// Evidence of misbehavior.
    Report(Fault),
}

/// Misbehavior attributable to a replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    ConflictingPrePrepare {
        view: View,
        sequence: Sequence,
        primary: ReplicaId,
        existing: Digest,
        received: Digest,
    },
    ConflictingVote {
        kind: Kind,
        view: View,
        sequence: Sequence,
        replica: ReplicaId,
        existing: Digest,
        received: Digest,
    },
    ConflictingViewChange {
        view: View,
        replica: ReplicaId,
    },
    InvalidNewView {
        view: View,
        primary: ReplicaId,
        reason: Rejection,
    },
}

struct Pending {
    arrival: u64,
    request: Request,
}

/// A PBFT replica.
///
/// The replica is a single-threaded reactor: [Replica::handle] processes one [Event] to
/// completion and returns the [Action]s it produced.
pub struct Replica<X: Executor, A: Authenticator> {
    config: Config,
    executor: X,
    authenticator: A,

    view: View,
    mode: Mode,
    log: Log,
    tracker: Tracker,
    checkpoints: Checkpoints,
    manager: Manager,
    sequencer: Sequencer,
    timers: Timers,

    outstanding: HashMap<Digest, Pending>,
    arrivals: u64,
    queue: VecDeque<Digest>,
    clients: Clients,
    snapshots: BTreeMap<Sequence, (Digest, Clients)>,
    assigned: HashMap<Digest, Sequence>,
    last_assigned: Sequence,
    suspended: Option<Snapshot>,
    last_new_view: Option<NewView>,

    actions: Vec<Action>,
    metrics: Metrics,
}

impl<X: Executor, A: Authenticator> Replica<X, A> {
    pub fn new(config: Config, executor: X, authenticator: A) -> Result<Self, Error> {
        config.validate()?;
        let state = executor.state_digest();
        let genesis = Snapshot {
            sequence: 0,
            digest: checkpoint_digest(&state, &Clients::new()),
        };
        let n = config.n as usize;
        let f = config.f as usize;
        Ok(Self {
            tracker: Tracker::new(n, f),
            checkpoints: Checkpoints::new(config.checkpoint_period, config.window(), f + 1, genesis),
            manager: Manager::new(config.max_entries),
            config,
            executor,
            authenticator,

            view: 0,
            mode: Mode::Normal,
            log: Log::default(),
            sequencer: Sequencer::new(),
            timers: Timers::default(),

            outstanding: HashMap::new(),
            arrivals: 0,
            queue: VecDeque::new(),
            clients: Clients::new(),
            snapshots: BTreeMap::from([(0, (state, Clients::new()))]),
            assigned: HashMap::new(),
            last_assigned: 0,
            suspended: None,
            last_new_view: None,

            actions: Vec::new(),
            metrics: Metrics::default(),
        })
    }

    /// Registers the replica's metrics with `registry`.
    pub fn register(&self, registry: &mut Registry) {
        self.metrics.register(registry);
    }

    pub fn id(&self) -> ReplicaId {
        self.config.me
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Primary of the current view.
    pub fn primary(&self) -> ReplicaId {
        self.config.primary(self.view)
    }

    /// Low and high watermarks.
    pub fn watermarks(&self) -> (Sequence, Sequence) {
        (self.checkpoints.low(), self.checkpoints.high())
    }

    pub fn last_executed(&self) -> Sequence {
        self.sequencer.last_executed()
    }

    pub fn stable_checkpoint(&self) -> Snapshot {
        self.checkpoints.stable()
    }

    pub fn slot(&self, view: View, sequence: Sequence) -> Option<&Slot> {
        self.log.get(view, sequence)
    }

    /// Returns true while waiting for a state transfer to complete.
    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }

    /// Number of requests received but not yet executed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    /// Executor state digest and client table captured at checkpoint `sequence`.
    ///
    /// Retained for the stable checkpoint and every later own checkpoint.
    pub fn checkpoint_state(&self, sequence: Sequence) -> Option<(Digest, &Clients)> {
        self.snapshots
            .get(&sequence)
            .map(|(state, clients)| (*state, clients))
    }

    /// Processes `event` to completion.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Message { from, message } => self.message(from, message),
            Event::Request(request) => self.request(request),
            Event::Timeout(timer) => self.timeout(timer),
            Event::StateTransferred {
                sequence,
                state,
                clients,
            } => self.transferred(sequence, state, clients),
            Event::StateTransferFailed { sequence } => {
                error!(sequence, "state transfer failed");
            }
        }
        std::mem::take(&mut self.actions)
    }

    fn message(&mut self, from: ReplicaId, message: Message) {
        let inbound = Inbound::new(&message);
        self.metrics.inbound.get_or_create(&inbound).inc();
        let context = Context {
            config: &self.config,
            view: self.view,
            mode: self.mode,
            low: self.checkpoints.low(),
            high: self.checkpoints.high(),
            log: &self.log,
        };
        let result = validate(&context, from, &message).and_then(|_| {
            if self.authenticator.verify(from, &message) {
                Ok(())
            } else {
                Err(Rejection::Unauthenticated)
            }
        });
        if let Err(rejection) = result {
            self.metrics.dropped.get_or_create(&inbound).inc();
            trace!(from, message = message.kind(), %rejection, "dropped message");
            self.rejected(from, message, rejection);
            return;
        }

        match message {
            Message::Request(request) => self.request(request),
            Message::PrePrepare(pre_prepare) => self.accept(pre_prepare),
            Message::Prepare(vote) => self.vote(Kind::Prepare, vote),
            Message::Commit(vote) => self.vote(Kind::Commit, vote),
            Message::Checkpoint(checkpoint) => self.checkpoint(checkpoint),
            Message::ViewChange(record) => self.view_change(record),
            Message::NewView(new_view) => self.new_view(new_view),
        }
    }

    fn rejected(&mut self, from: ReplicaId, message: Message, rejection: Rejection) {
        match (message, rejection) {
            (Message::PrePrepare(pre_prepare), Rejection::Conflict { existing }) => {
                self.report(Fault::ConflictingPrePrepare {
                    view: pre_prepare.view,
                    sequence: pre_prepare.sequence,
                    primary: pre_prepare.primary,
                    existing,
                    received: pre_prepare.digest,
                });
            }
            (Message::ViewChange(record), Rejection::StaleView { .. }) => {
                // The sender missed the new view we installed as its primary
                let Some(new_view) = &self.last_new_view else {
                    return;
                };
                if record.view == self.view && new_view.view == self.view {
                    debug!(to = from, view = self.view, "resending new view");
                    self.actions.push(Action::Send {
                        to: from,
                        message: Message::NewView(new_view.clone()),
                    });
                }
            }
            _ => {}
        }
    }

    fn request(&mut self, request: Request) {
        if request.payload.len() > self.config.max_request_size {
            warn!(
                client = request.client,
                size = request.payload.len(),
                "request too large"
            );
            return;
        }
        let digest = request.digest();
        if self.is_executed(&request) || self.outstanding.contains_key(&digest) {
            trace!(client = request.client, timestamp = request.timestamp, "ignoring request");
            return;
        }
        self.remember(digest, request);
        self.queue.push_back(digest);
        self.propose();
    }

    /// Tracks `request` as outstanding (arming the request timer if needed).
    fn remember(&mut self, digest: Digest, request: Request) {
        self.arrivals += 1;
        self.outstanding.insert(
            digest,
            Pending {
                arrival: self.arrivals,
                request,
            },
        );
        if self.mode == Mode::Normal && !self.timers.is_armed(TimerKind::Request) {
            self.arm(TimerKind::Request, self.config.request_timeout);
        }
    }

    fn is_executed(&self, request: &Request) -> bool {
        self.clients
            .get(&request.client)
            .is_some_and(|timestamp| *timestamp >= request.timestamp)
    }

    /// Assigns sequence numbers to queued requests (primary only).
    fn propose(&mut self) {
        if self.mode != Mode::Normal
            || self.config.primary(self.view) != self.config.me
            || self.suspended.is_some()
        {
            return;
        }
        self.last_assigned = self.last_assigned.max(self.checkpoints.low());
        while self.last_assigned < self.checkpoints.high() {
            let Some(digest) = self.queue.pop_front() else {
                break;
            };
            if self.assigned.contains_key(&digest) {
                continue;
            }
            let Some(pending) = self.outstanding.get(&digest) else {
                continue;
            };
            self.last_assigned += 1;
            let pre_prepare = PrePrepare {
                view: self.view,
                sequence: self.last_assigned,
                digest,
                request: Some(pending.request.clone()),
                primary: self.config.me,
            };
            debug!(
                view = self.view,
                sequence = self.last_assigned,
                ?digest,
                "proposing request"
            );
            self.broadcast(Message::PrePrepare(pre_prepare.clone()));
            self.accept(pre_prepare);
        }
    }

    /// Binds a slot to a validated pre-prepare.
    fn accept(&mut self, pre_prepare: PrePrepare) {
        let view = pre_prepare.view;
        let sequence = pre_prepare.sequence;
        let digest = pre_prepare.digest;
        match self.log.entry(view, sequence).accept(pre_prepare.clone()) {
            Accept::Accepted => {}
            Accept::Duplicate => return,
            Accept::Conflict(existing) => {
                self.report(Fault::ConflictingPrePrepare {
                    view,
                    sequence,
                    primary: pre_prepare.primary,
                    existing,
                    received: digest,
                });
                return;
            }
        }
        trace!(view, sequence, ?digest, "pre-prepared");
        self.manager.pre_prepared(pre_prepare.entry());
        self.assigned.insert(digest, sequence);
        if let Some(request) = pre_prepare.request {
            if !self.is_executed(&request) && !self.outstanding.contains_key(&digest) {
                self.remember(digest, request);
            }
        }

        // The primary's pre-prepare is its prepare
        if self.config.primary(view) != self.config.me {
            let vote = Vote {
                view,
                sequence,
                digest,
                replica: self.config.me,
            };
            self.tracker
                .record(Kind::Prepare, view, sequence, digest, self.config.me);
            self.broadcast(Message::Prepare(vote));
        }
        self.advance(view, sequence);
    }

    fn vote(&mut self, kind: Kind, vote: Vote) {
        match self
            .tracker
            .record(kind, vote.view, vote.sequence, vote.digest, vote.replica)
        {
            Outcome::Added => {}
            Outcome::Duplicate => return,
            Outcome::Conflict(existing) => {
                self.report(Fault::ConflictingVote {
                    kind,
                    view: vote.view,
                    sequence: vote.sequence,
                    replica: vote.replica,
                    existing,
                    received: vote.digest,
                });
                return;
            }
        }
        if kind == Kind::Prepare {
            self.log.entry(vote.view, vote.sequence);
        }
        self.advance(vote.view, vote.sequence);
    }

    /// Moves the slot at `(view, sequence)` through as many phases as its votes allow.
    fn advance(&mut self, view: View, sequence: Sequence) {
        loop {
            let Some(slot) = self.log.get_mut(view, sequence) else {
                return;
            };
            let Some(status) = slot.advance(&self.tracker) else {
                return;
            };
            let Some(pre_prepare) = slot.pre_prepare().cloned() else {
                return;
            };
            match status {
                Status::Prepared => {
                    debug!(view, sequence, "prepared");
                    self.manager.prepared(&pre_prepare);
                    let vote = Vote {
                        view,
                        sequence,
                        digest: pre_prepare.digest,
                        replica: self.config.me,
                    };
                    self.tracker.record(
                        Kind::Commit,
                        view,
                        sequence,
                        pre_prepare.digest,
                        self.config.me,
                    );
                    self.broadcast(Message::Commit(vote));
                }
                Status::Committed => {
                    if let Commit::Stale = self.sequencer.commit(pre_prepare) {
                        trace!(view, sequence, "already executed");
                    }
                    debug!(
                        view,
                        sequence,
                        pending = self.sequencer.pending(),
                        "committed"
                    );
                    self.execute();
                }
                _ => return,
            }
        }
    }

    /// Executes every committed request that is next in order.
    fn execute(&mut self) {
        let mut progressed = false;
        while self.suspended.is_none() {
            let Some(pre_prepare) = self.sequencer.release() else {
                break;
            };
            progressed = true;
            let sequence = pre_prepare.sequence;
            match &pre_prepare.request {
                Some(request) if !self.is_executed(request) => {
                    self.executor.execute(sequence, request);
                    self.clients.insert(request.client, request.timestamp);
                    let (client, timestamp) = (request.client, request.timestamp);
                    self.outstanding.retain(|_, pending| {
                        pending.request.client != client || pending.request.timestamp > timestamp
                    });
                }
                _ => self.executor.skip(sequence),
            }
            self.outstanding.remove(&pre_prepare.digest);
            if let Some(slot) = self.log.get_mut(pre_prepare.view, sequence) {
                slot.executed();
            }
            self.metrics.last_executed.set(sequence as i64);
            debug!(
                view = pre_prepare.view,
                sequence,
                null = pre_prepare.is_null(),
                "executed"
            );

            if self.checkpoints.is_checkpoint(sequence) {
                let state = self.executor.state_digest();
                let snapshot = Snapshot {
                    sequence,
                    digest: checkpoint_digest(&state, &self.clients),
                };
                self.snapshots
                    .insert(sequence, (state, self.clients.clone()));
                self.checkpoints.produced(snapshot);
                let checkpoint = Checkpoint {
                    snapshot,
                    replica: self.config.me,
                };
                self.broadcast(Message::Checkpoint(checkpoint));
                self.arm(TimerKind::Checkpoint, self.config.checkpoint_timeout);
                self.checkpoint(checkpoint);
            }
        }

        if progressed && self.mode == Mode::Normal {
            if self.outstanding.is_empty() {
                self.timers.disarm(TimerKind::Request);
            } else {
                self.arm(TimerKind::Request, self.config.request_timeout);
            }
        }
    }

    fn checkpoint(&mut self, checkpoint: Checkpoint) {
        let last_executed = self.sequencer.last_executed();
        match self
            .checkpoints
            .observe(&mut self.tracker, checkpoint, last_executed)
        {
            Progress::Pending => {}
            Progress::Conflict(existing) => {
                self.report(Fault::ConflictingVote {
                    kind: Kind::Checkpoint,
                    view: 0,
                    sequence: checkpoint.snapshot.sequence,
                    replica: checkpoint.replica,
                    existing,
                    received: checkpoint.snapshot.digest,
                });
            }
            Progress::Stable { snapshot, transfer } => {
                self.stabilized(snapshot);
                if let Some(peers) = transfer {
                    self.transfer(snapshot, peers);
                }
                self.propose();
            }
        }
    }

    /// Discards everything at or below the new stable checkpoint.
    fn stabilized(&mut self, snapshot: Snapshot) {
        let sequence = snapshot.sequence;
        self.log.prune(sequence);
        self.tracker.prune(sequence);
        self.manager.prune(sequence);
        self.assigned.retain(|_, assigned| *assigned > sequence);
        self.snapshots = self.snapshots.split_off(&sequence);
        self.metrics.low_watermark.set(sequence as i64);
        if self.checkpoints.unstable().is_none() {
            self.timers.disarm(TimerKind::Checkpoint);
        }
        let outstanding = &self.outstanding;
        self.queue.retain(|digest| outstanding.contains_key(digest));
    }

    /// Suspends execution until the state at `snapshot` is installed.
    fn transfer(&mut self, snapshot: Snapshot, peers: Vec<ReplicaId>) {
        if self
            .suspended
            .is_some_and(|target| target.sequence >= snapshot.sequence)
        {
            return;
        }
        warn!(
            sequence = snapshot.sequence,
            last_executed = self.sequencer.last_executed(),
            ?peers,
            "requesting state transfer"
        );
        self.suspended = Some(snapshot);
        self.metrics.state_transfers.inc();
        self.actions.push(Action::StateTransfer {
            sequence: snapshot.sequence,
            digest: snapshot.digest,
            peers,
        });
    }

    fn transferred(&mut self, sequence: Sequence, state: Digest, clients: Clients) {
        let Some(target) = self.suspended else {
            debug!(sequence, "unexpected state transfer");
            return;
        };
        if sequence != target.sequence {
            debug!(sequence, target = target.sequence, "stale state transfer");
            return;
        }
        let digest = checkpoint_digest(&state, &clients);
        if digest != target.digest {
            error!(
                sequence,
                expected = ?target.digest,
                ?digest,
                "transferred state does not match checkpoint"
            );
            return;
        }
        info!(sequence, ?digest, "state transfer complete");
        self.executor.restore(sequence, state);
        self.clients = clients.clone();
        self.snapshots.insert(sequence, (state, clients));
        self.suspended = None;
        self.sequencer.reset(sequence);
        for pre_prepare in self.log.committed_above(sequence) {
            self.sequencer.commit(pre_prepare);
        }
        self.metrics.last_executed.set(sequence as i64);
        let snapshot = Snapshot { sequence, digest };
        if sequence > self.checkpoints.low() {
            self.checkpoints.stabilize(snapshot);
            self.stabilized(snapshot);
        }

        // Clients retry, and the installed client table filters what the state already covers
        self.outstanding.clear();
        self.queue.clear();
        self.timers.disarm(TimerKind::Request);

        self.execute();
        self.propose();
    }

    fn timeout(&mut self, timer: Timer) {
        if !self.timers.fire(timer) {
            trace!(?timer, "stale timer");
            return;
        }
        match timer.kind {
            TimerKind::Request => {
                let target = match self.mode {
                    Mode::Normal => self.view.saturating_add(1),
                    Mode::ViewChanging { target } => target.saturating_add(1),
                };
                warn!(
                    view = self.view,
                    outstanding = self.outstanding.len(),
                    "request timed out"
                );
                self.start_view_change(target);
            }
            TimerKind::ViewChange => {
                if let Mode::ViewChanging { target } = self.mode {
                    warn!(target, "view change timed out");
                    self.start_view_change(target.saturating_add(1));
                }
            }
            TimerKind::Checkpoint => {
                if let Some(snapshot) = self.checkpoints.unstable() {
                    debug!(sequence = snapshot.sequence, "rebroadcasting checkpoint");
                    self.broadcast(Message::Checkpoint(Checkpoint {
                        snapshot,
                        replica: self.config.me,
                    }));
                    self.arm(TimerKind::Checkpoint, self.config.checkpoint_timeout);
                }
            }
        }
    }

    /// Stops normal operation and asks to move to `target`.
    fn start_view_change(&mut self, target: View) {
        info!(view = self.view, target, "starting view change");
        self.mode = Mode::ViewChanging { target };
        self.metrics.view_changes.inc();
        self.timers.disarm(TimerKind::Request);
        self.log.abandon(target, Status::Prepared);

        let record = self.manager.build(
            target,
            self.config.me,
            self.config.window(),
            self.checkpoints.stable(),
            self.checkpoints.certificates(),
        );
        self.broadcast(Message::ViewChange(record.clone()));
        self.arm(TimerKind::ViewChange, self.config.view_change_timeout);
        self.view_change(record);
    }

    fn view_change(&mut self, record: ViewChange) {
        let view = record.view;
        let replica = record.replica;
        match self.manager.receive(record) {
            Received::New => {}
            Received::Duplicate | Received::Stale => return,
            Received::Conflict => {
                self.report(Fault::ConflictingViewChange { view, replica });
                return;
            }
        }
        trace!(view, replica, "received view change");

        // Follow f+1 replicas that already gave up on the current view
        let current = match self.mode {
            Mode::Normal => self.view,
            Mode::ViewChanging { target } => target,
        };
        if let Some(target) = self.manager.join(current, self.tracker.weak()) {
            info!(current, target, "joining view change");
            self.start_view_change(target);
            return;
        }

        if self.mode == (Mode::ViewChanging { target: view })
            && self.config.primary(view) == self.config.me
            && self.manager.records(view).len() >= self.config.quorum()
        {
            self.try_new_view(view);
        }
    }

    fn try_new_view(&mut self, view: View) {
        let records = self.manager.records(view);
        let Some(new_view) = view_change::new_view(&self.config, view, records) else {
            debug!(view, "new view not yet decidable");
            return;
        };
        info!(
            view,
            checkpoint = new_view.checkpoint.sequence,
            selected = new_view.selected.len(),
            "broadcasting new view"
        );
        self.broadcast(Message::NewView(new_view.clone()));
        self.last_new_view = Some(new_view.clone());
        self.install(new_view);
    }

    fn new_view(&mut self, new_view: NewView) {
        if let Err(reason) =
            view_change::verify_new_view(&self.config, &self.authenticator, &new_view)
        {
            self.report(Fault::InvalidNewView {
                view: new_view.view,
                primary: new_view.primary,
                reason,
            });
            return;
        }
        self.install(new_view);
    }

    /// Enters the view described by `new_view` and processes its re-issued pre-prepares.
    fn install(&mut self, new_view: NewView) {
        let view = new_view.view;
        info!(
            view,
            checkpoint = new_view.checkpoint.sequence,
            selected = new_view.selected.len(),
            "entering view"
        );
        self.view = view;
        self.mode = Mode::Normal;
        self.metrics.current_view.set(view as i64);
        self.timers.disarm(TimerKind::ViewChange);
        self.log.abandon(view, Status::Committed);
        self.tracker.prune_votes(view);
        self.manager.prune_views(view);
        self.assigned.clear();
        if self.config.primary(view) != self.config.me {
            self.last_new_view = None;
        }

        // Start from the selected checkpoint if it is ahead of the local one
        let checkpoint = new_view.checkpoint;
        if checkpoint.sequence > self.checkpoints.low() {
            self.checkpoints.stabilize(checkpoint);
            self.stabilized(checkpoint);
            if self.sequencer.last_executed() < checkpoint.sequence {
                let peers = new_view
                    .view_changes
                    .iter()
                    .filter(|record| {
                        record.stable == checkpoint || record.checkpoints.contains(&checkpoint)
                    })
                    .map(|record| record.replica)
                    .collect();
                self.transfer(checkpoint, peers);
            }
        }
        self.last_assigned = new_view
            .selected
            .last()
            .map(|pre_prepare| pre_prepare.sequence)
            .unwrap_or(checkpoint.sequence)
            .max(self.checkpoints.low());

        for pre_prepare in new_view.selected {
            if self.checkpoints.in_window(pre_prepare.sequence) {
                self.accept(pre_prepare);
            }
        }

        // Requests not re-issued are queued again in arrival order
        let mut queued: Vec<(u64, Digest)> = self
            .outstanding
            .iter()
            .filter(|(digest, _)| !self.assigned.contains_key(*digest))
            .map(|(digest, pending)| (pending.arrival, *digest))
            .collect();
        queued.sort_unstable();
        self.queue = queued.into_iter().map(|(_, digest)| digest).collect();

        if self.outstanding.is_empty() {
            self.timers.disarm(TimerKind::Request);
        } else {
            self.arm(TimerKind::Request, self.config.request_timeout);
        }
        self.propose();
    }

    fn broadcast(&mut self, message: Message) {
        self.actions.push(Action::Broadcast(message));
    }

    fn arm(&mut self, kind: TimerKind, duration: Duration) {
        let timer = self.timers.arm(kind);
        self.actions.push(Action::SetTimer { timer, duration });
    }

    fn report(&mut self, fault: Fault) {
        warn!(?fault, "observed fault");
        self.metrics.faults.inc();
        self.actions.push(Action::Report(fault));
    }
}
