#![forbid(unsafe_code)]

// Lifecycle of tracked transports, producers and consumers.
//
// Every close path (explicit close, engine events) goes through `EntityState::apply`
// so racing callbacks resolve against a single state instead of each other.

use std::fmt;

/// Which tracked engine entity an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Transport,
    Producer,
    Consumer,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Transport => write!(f, "transport"),
            EntityKind::Producer => write!(f, "producer"),
            EntityKind::Consumer => write!(f, "consumer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Active,
    Closing,
    Closed,
}

/// Signals that can move an entity towards `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTrigger {
    /// Caller asked to close the entity
    Explicit,
    /// Owning transport was closed
    TransportClosed,
    /// Source producer was closed (consumers only)
    ProducerClosed,
    /// Engine closed the entity on its own
    EngineClosed,
    /// Explicit engine close completed
    CloseFinished,
    /// Explicit engine close rejected
    CloseFailed,
}

/// Outcome of applying a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Caller must perform the engine close
    BeginClose,
    /// Entity is now closed and must leave its map
    Closed,
    /// Explicit close failed, entity is active again
    Reverted,
    /// No state change; repeated or irrelevant signal
    Ignored,
}

impl EntityState {
    /// The single transition function for tracked entities
    pub fn apply(&mut self, kind: EntityKind, trigger: CloseTrigger) -> Transition {
        use CloseTrigger::*;
        use EntityState::*;

        let (next, transition) = match (*self, trigger) {
            (Active, Explicit) => (Closing, Transition::BeginClose),
            (Active, TransportClosed) if kind != EntityKind::Transport => (Closed, Transition::Closed),
            (Active, ProducerClosed) if kind == EntityKind::Consumer => (Closed, Transition::Closed),
            (Active, EngineClosed) => (Closed, Transition::Closed),
            (Closing, CloseFinished) => (Closed, Transition::Closed),
            (Closing, CloseFailed) => (Active, Transition::Reverted),
            (state, _) => (state, Transition::Ignored),
        };

        *self = next;
        transition
    }

    pub fn is_active(&self) -> bool {
        matches!(self, EntityState::Active)
    }
}
