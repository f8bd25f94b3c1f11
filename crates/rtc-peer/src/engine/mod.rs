//! Media engine capability set
//!
//! The engine owns ICE, DTLS, SCTP and RTP. The core only talks to it
//! through the traits below:
//!
//! ```text
//!  MediaEngine ──create_factory──► EngineFactory ──create_peer_connection──► EngineConnection
//!                                                                              │
//!        EngineObserver ◄──── events (signaling, ICE, channels, tracks) ───────┤
//!                                                                              │
//!        ChannelObserver ◄──── state / message / buffered ─── EngineChannel ◄──┘
//! ```
//!
//! Offer/answer creation and description setting complete through one-shot
//! [`Completion`] slots so the core can bridge them into blocking calls.

mod completion;
pub mod loopback;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc_rs;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::runtime::Handle;

pub use completion::{Completion, CompletionResult, SdpCompletion, SetDescriptionCompletion};
pub use loopback::LoopbackEngine;

use crate::channel::{DataChannelInit, DataChannelState};
use crate::config::{Configuration, MediaConstraints};
use crate::error::ConfigurationErrorKind;
use crate::events::IceCandidateErrorEvent;
use crate::ice::{IceCandidate, ParsedIceCandidate};
use crate::media::{MediaStreamTrack, RemoteTrack};
use crate::sdp::SessionDescription;
use crate::signaling::SignalingState;
use crate::state::{IceConnectionState, IceGatheringState};
use crate::{Error, Result};

/// Execution contexts the engine runs on
#[derive(Debug, Clone)]
pub struct EngineContexts {
    signaling: Handle,
    worker: Handle,
}

impl EngineContexts {
    pub fn new(signaling: Handle, worker: Handle) -> Self {
        Self { signaling, worker }
    }

    /// Both contexts on the ambient tokio runtime
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Factory(format!("no engine runtime available: {e}")))?;
        Ok(Self::new(handle.clone(), handle))
    }

    /// Where caller-facing events are delivered from
    pub fn signaling(&self) -> &Handle {
        &self.signaling
    }

    /// Where the engine does its own work
    pub fn worker(&self) -> &Handle {
        &self.worker
    }
}

/// Audio device backing the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioModule {
    /// Synthetic capture/playout; needs no hardware
    #[default]
    Fake,
    /// Platform default device
    Platform,
}

/// Failure reported by an engine call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Engine refusal of a configuration change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ConfigurationError {
    pub kind: ConfigurationErrorKind,
    pub message: String,
}

impl ConfigurationError {
    pub fn new(kind: ConfigurationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ConfigurationError> for Error {
    fn from(err: ConfigurationError) -> Self {
        Error::ConfigurationRejected {
            kind: err.kind,
            message: err.message,
        }
    }
}

/// Data channel payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBuffer {
    pub data: Bytes,
    pub binary: bool,
}

impl DataBuffer {
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: true,
        }
    }

    pub fn text(text: &str) -> Self {
        Self {
            data: Bytes::copy_from_slice(text.as_bytes()),
            binary: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// UTF-8 view of a text message
    pub fn as_text(&self) -> Option<&str> {
        if self.binary {
            return None;
        }
        std::str::from_utf8(&self.data).ok()
    }
}

/// Entry point into an engine implementation
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Build a factory bound to the given execution contexts
    async fn create_factory(
        &self,
        contexts: &EngineContexts,
        audio: AudioModule,
    ) -> std::result::Result<Arc<dyn EngineFactory>, EngineError>;
}

/// Creates engine connections
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        config: &Configuration,
        constraints: &MediaConstraints,
        observer: Arc<dyn EngineObserver>,
    ) -> std::result::Result<Arc<dyn EngineConnection>, EngineError>;
}

/// Engine half of a peer connection
#[async_trait]
pub trait EngineConnection: Send + Sync {
    fn create_offer(&self, completion: SdpCompletion, constraints: &MediaConstraints);

    fn create_answer(&self, completion: SdpCompletion, constraints: &MediaConstraints);

    fn set_local_description(
        &self,
        completion: SetDescriptionCompletion,
        description: SessionDescription,
    );

    fn set_remote_description(
        &self,
        completion: SetDescriptionCompletion,
        description: SessionDescription,
    );

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    /// False when the engine declines the candidate
    async fn add_ice_candidate(&self, candidate: &ParsedIceCandidate) -> bool;

    async fn set_configuration(
        &self,
        config: &Configuration,
    ) -> std::result::Result<(), ConfigurationError>;

    /// `None` when the engine refuses the channel
    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Option<Arc<dyn EngineChannel>>;

    async fn add_track(
        &self,
        track: Arc<dyn MediaStreamTrack>,
        stream_ids: &[String],
    ) -> std::result::Result<Arc<dyn EngineRtpSender>, EngineError>;

    async fn remove_track(&self, sender: &Arc<dyn EngineRtpSender>) -> bool;

    async fn close(&self);

    fn signaling_state(&self) -> SignalingState;

    fn ice_connection_state(&self) -> IceConnectionState;

    fn ice_gathering_state(&self) -> IceGatheringState;
}

/// Connection-level events raised by the engine.
///
/// Called from engine contexts; implementations must not block.
pub trait EngineObserver: Send + Sync {
    fn on_signaling_change(&self, state: SignalingState);
    fn on_renegotiation_needed(&self);
    fn on_ice_candidate(&self, candidate: IceCandidate);
    fn on_ice_candidate_error(&self, error: IceCandidateErrorEvent);
    fn on_ice_connection_change(&self, state: IceConnectionState);
    fn on_ice_gathering_change(&self, state: IceGatheringState);
    fn on_data_channel(&self, channel: Arc<dyn EngineChannel>);
    fn on_add_track(&self, track: RemoteTrack);
}

/// Engine half of a data channel
#[async_trait]
pub trait EngineChannel: Send + Sync {
    /// Replace the observer; at most one is registered at a time
    fn register_observer(&self, observer: Arc<dyn ChannelObserver>);

    fn unregister_observer(&self);

    /// False when the payload could not be queued
    async fn send(&self, buffer: &DataBuffer) -> bool;

    async fn close(&self);

    fn label(&self) -> String;
    fn ordered(&self) -> bool;
    fn protocol(&self) -> String;
    fn id(&self) -> Option<u16>;
    fn negotiated(&self) -> bool;
    fn max_retransmits(&self) -> Option<u16>;
    fn max_packet_life_time(&self) -> Option<u16>;
    fn state(&self) -> DataChannelState;
    async fn buffered_amount(&self) -> u64;
}

/// Channel-level events raised by the engine
pub trait ChannelObserver: Send + Sync {
    /// Ready state changed; read it back through [`EngineChannel::state`]
    fn on_state_change(&self);
    fn on_message(&self, buffer: DataBuffer);
    fn on_buffered_amount_change(&self, amount: u64);
}

/// Engine half of an RTP sender
pub trait EngineRtpSender: Send + Sync {
    fn id(&self) -> String;
    fn track_id(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_buffer_text() {
        let buffer = DataBuffer::text("hello");
        assert_eq!(buffer.as_text(), Some("hello"));
        assert_eq!(buffer.len(), 5);

        let buffer = DataBuffer::binary(vec![0xff, 0x00]);
        assert!(buffer.as_text().is_none());
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_configuration_error_conversion() {
        let err: Error =
            ConfigurationError::new(ConfigurationErrorKind::InvalidModification, "bundle policy")
                .into();
        assert_eq!(
            err.to_string(),
            "Configuration rejected (invalid modification): bundle policy"
        );
    }

    #[test]
    fn test_contexts_require_runtime() {
        assert!(matches!(EngineContexts::current(), Err(Error::Factory(_))));
    }

    #[tokio::test]
    async fn test_contexts_inside_runtime() {
        assert!(EngineContexts::current().is_ok());
    }
}
