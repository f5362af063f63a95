//! Call session state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why a call reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    Ignored,
    Cancelled,
    Error,
}

/// Current state of a call session.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    /// Incoming invite delivered, or outgoing call not yet started.
    #[default]
    Pending,
    /// Accepted locally, media and signaling setup in flight.
    Connecting { accepted_at: DateTime<Utc> },
    /// Outgoing call: remote side is ringing.
    Ringing { has_early_media: bool },
    /// Media flowing both ways.
    Open { connected_at: DateTime<Utc> },
    /// Media lost, restart in progress.
    Reconnecting {
        since: DateTime<Utc>,
        connected_at: DateTime<Utc>,
    },
    /// Call ended. No transitions leave this state.
    Closed {
        reason: DisconnectReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Connecting { .. } | Self::Ringing { .. } | Self::Open { .. } | Self::Reconnecting { .. }
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (&*self, transition) {
            (CallState::Pending, CallTransition::Accepted) => CallState::Connecting {
                accepted_at: Utc::now(),
            },
            // Repeated ringing notices just refresh the early media flag.
            (
                CallState::Connecting { .. } | CallState::Ringing { .. },
                CallTransition::EarlyMedia { has_early_media },
            ) => CallState::Ringing { has_early_media },
            (
                CallState::Connecting { .. } | CallState::Ringing { .. },
                CallTransition::MediaOpen,
            ) => CallState::Open {
                connected_at: Utc::now(),
            },
            (CallState::Open { connected_at }, CallTransition::MediaLost) => {
                CallState::Reconnecting {
                    since: Utc::now(),
                    connected_at: *connected_at,
                }
            }
            (CallState::Reconnecting { connected_at, .. }, CallTransition::MediaRestored) => {
                CallState::Open {
                    connected_at: *connected_at,
                }
            }
            (
                CallState::Open { connected_at } | CallState::Reconnecting { connected_at, .. },
                CallTransition::Ended { reason },
            ) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                CallState::Closed {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (
                CallState::Pending | CallState::Connecting { .. } | CallState::Ringing { .. },
                CallTransition::Ended { reason },
            ) => CallState::Closed {
                reason,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        *self = new_state;
        Ok(())
    }
}

/// State transitions for call sessions.
#[derive(Debug, Clone)]
pub enum CallTransition {
    Accepted,
    EarlyMedia { has_early_media: bool },
    MediaOpen,
    MediaLost,
    MediaRestored,
    Ended { reason: DisconnectReason },
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
