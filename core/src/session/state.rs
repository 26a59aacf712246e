// Session lifecycle: Created → Connecting → Connected → Securing → Secured →
// Provisioning → Provisioned, with Disconnected and ConnectionFailed terminals.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Created,
    Connecting,
    Connected,
    Securing,
    Secured,
    Provisioning,
    Provisioned,
    Disconnected,
    ConnectionFailed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Disconnected | LifecycleState::ConnectionFailed)
    }

    /// Secure-channel operations are possible
    pub fn is_secured(self) -> bool {
        matches!(
            self,
            LifecycleState::Secured | LifecycleState::Provisioning | LifecycleState::Provisioned
        )
    }

    /// Link is open (plaintext endpoints reachable)
    pub fn is_linked(self) -> bool {
        matches!(self, LifecycleState::Connected | LifecycleState::Securing) || self.is_secured()
    }

    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Created, Connecting) => true,
            (Connecting, Connected) | (Connecting, ConnectionFailed) => true,
            (Connected, Securing) => true,
            (Securing, Secured) | (Securing, ConnectionFailed) => true,
            (Secured, Provisioning) => true,
            // A failed credential attempt hands the session back for an explicit retry.
            (Provisioning, Provisioned) | (Provisioning, Secured) => true,
            (Disconnected, Disconnected) => false,
            (_, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Connected => "connected",
            LifecycleState::Securing => "securing",
            LifecycleState::Secured => "secured",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Provisioned => "provisioned",
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::ConnectionFailed => "connection failed",
        };
        f.write_str(name)
    }
}

/// Shared lifecycle cell. Every change goes through the transition table.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: RwLock<LifecycleState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(LifecycleState::Created),
        }
    }

    pub(crate) fn get(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Move to `next`, or report the state that refused it
    pub(crate) fn advance(&self, next: LifecycleState) -> Result<(), LifecycleState> {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            return Err(*state);
        }
        debug!("lifecycle {} → {}", *state, next);
        *state = next;
        Ok(())
    }

    /// Enter Disconnected. Returns false if already there.
    pub(crate) fn disconnect(&self) -> bool {
        self.advance(LifecycleState::Disconnected).is_ok()
    }
}
