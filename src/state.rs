#[cfg(test)]
mod state_test;

use std::fmt;

use serde::{Deserialize, Serialize};

/// The connectivity state of one component, advanced as gathering and
/// checking make progress. Transitions only move forward; `Ready` and
/// `Failed` are absorbing until the stream is removed.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComponentState {
    /// No candidates exist yet.
    #[default]
    #[serde(rename = "disconnected")]
    Disconnected = 0,

    /// Host candidates exist and reflexive discovery may be running.
    #[serde(rename = "gathering")]
    Gathering = 1,

    /// At least one connectivity check is in progress.
    #[serde(rename = "connecting")]
    Connecting = 2,

    /// At least one candidate pair succeeded a check.
    #[serde(rename = "connected")]
    Connected = 3,

    /// A nominated pair is installed as the selected pair.
    #[serde(rename = "ready")]
    Ready = 4,

    /// Every pair failed and no discovery is pending.
    #[serde(rename = "failed")]
    Failed = 5,
}

impl ComponentState {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Forward jumps are allowed (a lite agent can go from `Gathering`
    /// straight to `Ready` when the peer nominates), `Ready` and `Failed`
    /// accept nothing.
    pub fn can_transition(self, next: ComponentState) -> bool {
        if self == ComponentState::Ready || self == ComponentState::Failed {
            return false;
        }
        next > self
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Disconnected => "disconnected",
            Self::Gathering => "gathering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for ComponentState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Gathering,
            2 => Self::Connecting,
            3 => Self::Connected,
            4 => Self::Ready,
            5 => Self::Failed,
            _ => Self::Disconnected,
        }
    }
}
