//! Data channels
//!
//! [`DataChannel`] wraps an engine channel and keeps a cached ready state
//! that the registered observer updates. Channels live in the owning
//! connection's registry until they are deleted or the connection closes.

pub(crate) mod data_channel;
mod registry;

pub use data_channel::{DataChannel, DataChannelStats};
pub(crate) use registry::ChannelRegistry;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest stream id an SCTP association can carry
pub const MAX_CHANNEL_ID: u16 = 65534;

/// Data channel ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelState {
    /// Channel is being created
    #[default]
    Connecting,
    /// Channel is open and ready for messages
    Open,
    /// Channel is closing
    Closing,
    /// Channel is closed
    Closed,
}

impl fmt::Display for DataChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataChannelState::Connecting => "connecting",
            DataChannelState::Open => "open",
            DataChannelState::Closing => "closing",
            DataChannelState::Closed => "closed",
        })
    }
}

/// Options for [`PeerConnection::create_data_channel`](crate::PeerConnection::create_data_channel)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataChannelInit {
    /// In-order delivery (default: true)
    pub ordered: bool,

    /// Retransmit window in milliseconds (partial reliability)
    pub max_packet_life_time: Option<u16>,

    /// Retransmit count limit (partial reliability)
    pub max_retransmits: Option<u16>,

    /// Sub-protocol name
    pub protocol: String,

    /// Negotiated out of band by the application (requires `id`)
    pub negotiated: bool,

    /// Stream id; assigned by the engine when `None`
    pub id: Option<u16>,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            ordered: true,
            max_packet_life_time: None,
            max_retransmits: None,
            protocol: String::new(),
            negotiated: false,
            id: None,
        }
    }
}

impl DataChannelInit {
    /// Unordered delivery
    pub fn unordered(mut self) -> Self {
        self.ordered = false;
        self
    }

    pub fn with_max_retransmits(mut self, retransmits: u16) -> Self {
        self.max_retransmits = Some(retransmits);
        self
    }

    pub fn with_max_packet_life_time(mut self, millis: u16) -> Self {
        self.max_packet_life_time = Some(millis);
        self
    }

    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = protocol.to_string();
        self
    }

    /// Pre-negotiated channel on stream `id`
    pub fn negotiated(mut self, id: u16) -> Self {
        self.negotiated = true;
        self.id = Some(id);
        self
    }

    /// True when neither retransmit limit is set
    pub fn is_reliable(&self) -> bool {
        self.max_packet_life_time.is_none() && self.max_retransmits.is_none()
    }

    /// Validate option combinations
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelCreate`] if:
    /// - both `max_packet_life_time` and `max_retransmits` are set
    /// - `negotiated` is set without an `id`
    /// - `id` is outside the stream id space
    /// - `protocol` is longer than 65535 bytes
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_life_time.is_some() && self.max_retransmits.is_some() {
            return Err(Error::ChannelCreate(
                "max_packet_life_time and max_retransmits are mutually exclusive".to_string(),
            ));
        }
        if self.negotiated && self.id.is_none() {
            return Err(Error::ChannelCreate(
                "negotiated channels require an id".to_string(),
            ));
        }
        if let Some(id) = self.id {
            if id > MAX_CHANNEL_ID {
                return Err(Error::ChannelCreate(format!(
                    "channel id {id} exceeds {MAX_CHANNEL_ID}"
                )));
            }
        }
        if self.protocol.len() > usize::from(u16::MAX) {
            return Err(Error::ChannelCreate("protocol is too long".to_string()));
        }
        Ok(())
    }
}
