//! ICE and aggregate connection states reported by the engine

use std::fmt;

use serde::{Deserialize, Serialize};

/// ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

/// ICE gathering state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

/// Aggregate connection state derived from the ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// True once ICE found a working candidate pair
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    /// Failed ends the current negotiation attempt
    pub fn is_failed(&self) -> bool {
        *self == Self::Failed
    }
}

impl From<IceConnectionState> for PeerConnectionState {
    fn from(state: IceConnectionState) -> Self {
        match state {
            IceConnectionState::New => PeerConnectionState::New,
            IceConnectionState::Checking => PeerConnectionState::Connecting,
            IceConnectionState::Connected | IceConnectionState::Completed => {
                PeerConnectionState::Connected
            }
            IceConnectionState::Failed => PeerConnectionState::Failed,
            IceConnectionState::Disconnected => PeerConnectionState::Disconnected,
            IceConnectionState::Closed => PeerConnectionState::Closed,
        }
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl fmt::Display for IceGatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Gathering => "gathering",
            Self::Complete => "complete",
        };
        f.write_str(s)
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            PeerConnectionState::from(IceConnectionState::Checking),
            PeerConnectionState::Connecting
        );
        assert_eq!(
            PeerConnectionState::from(IceConnectionState::Completed),
            PeerConnectionState::Connected
        );
        assert_eq!(
            PeerConnectionState::from(IceConnectionState::Failed),
            PeerConnectionState::Failed
        );
    }

    #[test]
    fn test_predicates() {
        assert!(IceConnectionState::Completed.is_connected());
        assert!(!IceConnectionState::Checking.is_connected());
        assert!(IceConnectionState::Failed.is_failed());
        assert_eq!(IceGatheringState::Complete.to_string(), "complete");
    }
}
