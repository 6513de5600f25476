//! Session lifecycle states

use serde::{Deserialize, Serialize};

/// Streaming session lifecycle
///
/// ```text
/// Idle -> Starting -> Negotiating -> Streaming -> Stopping -> Stopped
///            \____________\_____________\________/^
/// ```
/// Any active state may jump to `Stopping` on a fatal condition. A stopped
/// engine goes back to `Starting` on the next `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Negotiating,
    Streaming,
    Stopping,
    Stopped,
}

impl SessionState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle | Stopped, Starting) => true,
            // Fail-fast validation lands directly in Stopped
            (Idle | Stopped, Stopped) => true,
            (Starting, Negotiating) => true,
            (Negotiating, Streaming) => true,
            (Starting | Negotiating | Streaming, Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }

    /// A session is in flight (holding resources)
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Negotiating | SessionState::Streaming
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Negotiating => "negotiating",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}
