//! Connection state machine.

use std::fmt;
use std::sync::Arc;

use crate::identity::AccessoryDescriptor;
use crate::platform::{AccessoryStreams, InputStream, OutputStream};

/// Observable state of an accessory connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Nothing attached or nothing opened yet.
    #[default]
    Idle,
    /// Waiting for the user to answer the permission prompt.
    PermissionPending,
    /// Streams are open and the read loop is running.
    Open,
    /// Torn down. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "IDLE"),
            ConnectionState::PermissionPending => write!(f, "PERMISSION_PENDING"),
            ConnectionState::Open => write!(f, "OPEN"),
            ConnectionState::Closed => write!(f, "CLOSED"),
        }
    }
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

/// Handles held while open. `epoch` identifies this open so that read
/// iterations from an earlier one can tell they are stale.
pub(crate) struct OpenSession {
    pub accessory: AccessoryDescriptor,
    pub streams: AccessoryStreams,
    pub epoch: u64,
}

/// State plus the data that only exists in that state.
pub(crate) enum Phase {
    Idle,
    PermissionPending { accessory: AccessoryDescriptor },
    Open(OpenSession),
    Closed,
}

impl Phase {
    pub fn state(&self) -> ConnectionState {
        match self {
            Phase::Idle => ConnectionState::Idle,
            Phase::PermissionPending { .. } => ConnectionState::PermissionPending,
            Phase::Open(_) => ConnectionState::Open,
            Phase::Closed => ConnectionState::Closed,
        }
    }
}

/// Everything guarded by the connection mutex.
pub(crate) struct LinkContext {
    phase: Phase,
    epoch: u64,
}

impl LinkContext {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            epoch: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.phase.state()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Transition to a new phase, returning the previous one.
    pub fn goto(&mut self, next: Phase) -> Phase {
        let (from, to) = (self.phase.state(), next.state());
        if from != to {
            tracing::info!(from = %from, to = %to, "State transition");
        }
        std::mem::replace(&mut self.phase, next)
    }

    /// Enter `Open` with freshly opened streams. Returns the new epoch.
    pub fn enter_open(&mut self, accessory: AccessoryDescriptor, streams: AccessoryStreams) -> u64 {
        self.epoch += 1;
        let epoch = self.epoch;
        self.goto(Phase::Open(OpenSession {
            accessory,
            streams,
            epoch,
        }));
        epoch
    }

    /// Transition to `next`, handing back the session if one was open.
    pub fn take_session(&mut self, next: Phase) -> Option<OpenSession> {
        match self.goto(next) {
            Phase::Open(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_open_epoch(&self, epoch: u64) -> bool {
        matches!(&self.phase, Phase::Open(session) if session.epoch == epoch)
    }

    /// Input stream of the session opened at `epoch`, if it is still open.
    pub fn input_for(&self, epoch: u64) -> Option<Arc<dyn InputStream>> {
        match &self.phase {
            Phase::Open(session) if session.epoch == epoch => {
                Some(Arc::clone(&session.streams.input))
            }
            _ => None,
        }
    }

    pub fn output(&self) -> Option<Arc<dyn OutputStream>> {
        match &self.phase {
            Phase::Open(session) => Some(Arc::clone(&session.streams.output)),
            _ => None,
        }
    }

    pub fn accessory(&self) -> Option<&AccessoryDescriptor> {
        match &self.phase {
            Phase::PermissionPending { accessory } => Some(accessory),
            Phase::Open(session) => Some(&session.accessory),
            Phase::Idle | Phase::Closed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{AccessoryPlatform, MockPlatform};

    #[test]
    fn test_epoch_advances_per_open() {
        let mock = MockPlatform::new();
        let accessory = AccessoryDescriptor::new("Acme", "Widget", "1.0");
        let mut ctx = LinkContext::new();
        assert_eq!(ctx.state(), ConnectionState::Idle);

        let first = ctx.enter_open(accessory.clone(), mock.open(&accessory).unwrap());
        assert!(ctx.state().is_open());
        assert!(ctx.is_open_epoch(first));
        assert!(ctx.input_for(first).is_some());

        let session = ctx.take_session(Phase::Idle).unwrap();
        session.streams.release();
        assert!(ctx.input_for(first).is_none());
        assert!(ctx.output().is_none());

        let second = ctx.enter_open(accessory.clone(), mock.open(&accessory).unwrap());
        assert_ne!(first, second);
        assert!(!ctx.is_open_epoch(first));
        assert_eq!(ctx.accessory(), Some(&accessory));
    }

    #[test]
    fn test_take_session_without_open() {
        let mut ctx = LinkContext::new();
        assert!(ctx.take_session(Phase::Closed).is_none());
        assert!(ctx.state().is_terminal());
        assert!(!ctx.state().is_open());
    }
}
