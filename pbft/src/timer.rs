//! Generation-counted timers.
//!
//! The [crate::Replica] never sleeps: it asks the caller to fire a [Timer] after some duration.
//! Re-arming or cancelling bumps the generation of that kind, so a fire that arrives for an
//! older generation is recognized as stale and ignored.

/// Purpose of a timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// An outstanding request has not executed in time (suspect the primary).
    Request,

    /// The targeted view was not installed in time (move to the next one).
    ViewChange,

    /// An own checkpoint has not become stable in time (re-broadcast it).
    Checkpoint,
}

impl TimerKind {
    fn index(self) -> usize {
        match self {
            TimerKind::Request => 0,
            TimerKind::ViewChange => 1,
            TimerKind::Checkpoint => 2,
        }
    }
}

/// Token handed to the caller and returned when the timer fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Timer {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Clone, Copy, Default)]
struct State {
    generation: u64,
    armed: bool,
}

/// Tracks the live generation of every [TimerKind].
#[derive(Default)]
pub struct Timers {
    states: [State; 3],
}

impl Timers {
    /// Arms `kind`, invalidating any earlier token. Returns the token to schedule.
    pub fn arm(&mut self, kind: TimerKind) -> Timer {
        let state = &mut self.states[kind.index()];
        state.generation += 1;
        state.armed = true;
        Timer {
            kind,
            generation: state.generation,
        }
    }

    /// Cancels `kind` (any outstanding token becomes stale).
    pub fn disarm(&mut self, kind: TimerKind) {
        let state = &mut self.states[kind.index()];
        if state.armed {
            state.generation += 1;
            state.armed = false;
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.states[kind.index()].armed
    }

    /// Consumes a fired token, returning true if it is the live one.
    pub fn fire(&mut self, timer: Timer) -> bool {
        let state = &mut self.states[timer.kind.index()];
        if !state.armed || state.generation != timer.generation {
            return false;
        }
        state.armed = false;
        true
    }
}
