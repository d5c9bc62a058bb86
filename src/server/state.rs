//! Server lifecycle state machine
//!
//! ```text
//! Created ──init──► Initialized ──start──► Started ──stop──► Stopped
//!    └──────────────────start──────────────────┘
//! ```
//!
//! `Stopped` is terminal: a stopped server cannot be restarted.

use std::fmt;

use crate::error::LifecycleError;

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, options not yet validated
    Created,
    /// Options validated, not running
    Initialized,
    /// Listening, subscribed and registered
    Started,
    /// Shut down
    Stopped,
}

impl ServerState {
    /// Whether `init` may run in this state
    pub fn can_init(self) -> Result<(), LifecycleError> {
        match self {
            ServerState::Created | ServerState::Initialized => Ok(()),
            other => Err(LifecycleError::before_start(other)),
        }
    }

    /// Whether `start` may run in this state
    pub fn can_start(self) -> Result<(), LifecycleError> {
        self.can_init()
    }

    /// Whether registrations are still accepted
    pub fn accepts_registration(self) -> Result<(), LifecycleError> {
        match self {
            ServerState::Stopped => Err(LifecycleError::Stopped),
            _ => Ok(()),
        }
    }

    /// Whether the server is running
    pub fn is_started(self) -> bool {
        self == ServerState::Started
    }

    /// State name
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Created => "created",
            ServerState::Initialized => "initialized",
            ServerState::Started => "started",
            ServerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
