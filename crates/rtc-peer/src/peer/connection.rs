//! Peer connection handle

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use super::PeerConnectionBuilder;
use crate::channel::{ChannelRegistry, DataChannel, DataChannelInit};
use crate::config::Configuration;
use crate::engine::{EngineConnection, EngineFactory, MediaEngine};
use crate::error::ConfigurationErrorKind;
use crate::events::{EventDispatcher, EventRelay, PeerConnectionHandler};
use crate::ice::IceCandidate;
use crate::media::{MediaStreamTrack, RtpSender};
use crate::negotiation::NegotiationCoordinator;
use crate::sdp::SessionDescription;
use crate::signaling::SignalingState;
use crate::state::{IceConnectionState, IceGatheringState, PeerConnectionState};
use crate::{Error, Result};

/// Longest label or protocol an SCTP data channel can carry
const MAX_LABEL_LEN: usize = u16::MAX as usize;

/// WebRTC peer connection
///
/// Negotiation calls (`create_offer`, `create_answer`,
/// `set_local_description`, `set_remote_description`) are serialized by a
/// per-connection negotiation lock and each waits for the engine to
/// complete or time out. Everything else returns immediately with the
/// engine's verdict.
///
/// The caller owns the handle. Dropping it releases every channel observer
/// before the engine connection and factory go away.
pub struct PeerConnection {
    connection_id: String,

    /// Installed configuration; replaced only by `set_configuration`
    configuration: RwLock<Configuration>,

    coordinator: NegotiationCoordinator,

    channels: Arc<ChannelRegistry>,

    senders: Mutex<Vec<RtpSender>>,

    relay: Arc<EventRelay>,

    dispatcher: EventDispatcher,

    closed: AtomicBool,

    engine: Arc<dyn EngineConnection>,

    /// Declared last: the factory outlives the connection it produced
    factory: Arc<dyn EngineFactory>,
}

impl PeerConnection {
    /// Start building a connection with `configuration`
    pub fn builder(configuration: Configuration) -> PeerConnectionBuilder {
        PeerConnectionBuilder::new(configuration)
    }

    /// Create a connection with default options and the given handler
    pub async fn create(
        engine: &dyn MediaEngine,
        configuration: Configuration,
        handler: Arc<dyn PeerConnectionHandler>,
    ) -> Result<Self> {
        PeerConnectionBuilder::new(configuration)
            .with_handler(handler)
            .build(engine)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn assemble(
        connection_id: String,
        configuration: Configuration,
        coordinator: NegotiationCoordinator,
        channels: Arc<ChannelRegistry>,
        relay: Arc<EventRelay>,
        dispatcher: EventDispatcher,
        engine: Arc<dyn EngineConnection>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            connection_id,
            configuration: RwLock::new(configuration),
            coordinator,
            channels,
            senders: Mutex::new(Vec::new()),
            relay,
            dispatcher,
            closed: AtomicBool::new(false),
            engine,
            factory,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Replace the event handler; queued events go to the new handler
    pub fn set_handler(&self, handler: Arc<dyn PeerConnectionHandler>) {
        self.dispatcher.set_handler(handler);
    }

    // ---------- Negotiation ----------

    /// Create an SDP offer. Does not change the signaling state.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] outside Stable/HaveLocalOffer
    /// - [`Error::NegotiationTimeout`] if the engine does not answer in time
    /// - [`Error::NegotiationFailed`] if the engine reports a failure
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.coordinator.create_offer().await
    }

    /// Create an SDP answer to the installed remote offer
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        self.coordinator.create_answer().await
    }

    pub async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.coordinator
            .set_local_description(description)
            .await
            .map(|_| ())
    }

    pub async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.coordinator
            .set_remote_description(description)
            .await
            .map(|_| ())
    }

    /// Current local description, including candidates gathered so far
    pub async fn local_description(&self) -> Option<SessionDescription> {
        self.engine.local_description().await
    }

    pub async fn remote_description(&self) -> Option<SessionDescription> {
        self.engine.remote_description().await
    }

    /// Apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// - [`Error::CandidateParse`] if the candidate text or location is malformed
    /// - [`Error::CandidateRejected`] if the connection is closed or the
    ///   engine refuses the candidate
    #[instrument(skip(self, candidate), fields(connection_id = %self.connection_id, sdp_mid = %candidate.sdp_mid))]
    pub async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let parsed = candidate.parse()?;
        if self.is_closed() {
            return Err(Error::CandidateRejected(
                "connection is closed".to_string(),
            ));
        }

        if !self.engine.add_ice_candidate(&parsed).await {
            warn!(candidate = %candidate.candidate, "Engine rejected ICE candidate");
            return Err(Error::CandidateRejected(format!(
                "engine rejected candidate for mid '{}'",
                parsed.sdp_mid
            )));
        }
        debug!(address = %parsed.descriptor.address, port = parsed.descriptor.port, "Added remote ICE candidate");
        Ok(())
    }

    // ---------- Configuration ----------

    /// Currently installed configuration
    pub fn configuration(&self) -> Configuration {
        self.configuration.read().clone()
    }

    /// Replace the configuration; the engine may refuse the change.
    ///
    /// Runs under the negotiation lock so it never interleaves with an
    /// offer/answer exchange.
    #[instrument(skip(self, configuration), fields(connection_id = %self.connection_id))]
    pub async fn set_configuration(&self, configuration: Configuration) -> Result<()> {
        configuration
            .validate()
            .map_err(|e| Error::ConfigurationRejected {
                kind: ConfigurationErrorKind::InvalidParameter,
                message: e.to_string(),
            })?;

        let guard = self.coordinator.lock().await;
        if guard.state() == SignalingState::Closed {
            return Err(Error::ConfigurationRejected {
                kind: ConfigurationErrorKind::InvalidState,
                message: "connection is closed".to_string(),
            });
        }

        if let Err(e) = self.engine.set_configuration(&configuration).await {
            warn!(kind = %e.kind, message = %e.message, "Engine rejected configuration");
            return Err(e.into());
        }

        *self.configuration.write() = configuration;
        drop(guard);
        info!("Configuration replaced");
        Ok(())
    }

    // ---------- Data channels ----------

    /// Create a data channel and add it to the registry
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelCreate`] if the connection is closed, the
    /// options are inconsistent, or the engine refuses the channel.
    #[instrument(skip(self, init), fields(connection_id = %self.connection_id))]
    pub async fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<DataChannel>> {
        if self.is_closed() {
            return Err(Error::ChannelCreate("connection is closed".to_string()));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(Error::ChannelCreate("label is too long".to_string()));
        }
        init.validate()?;

        let engine_channel = self
            .engine
            .create_data_channel(label, &init)
            .await
            .ok_or_else(|| Error::ChannelCreate(format!("engine refused channel '{label}'")))?;

        let Some(channel) = self.channels.register(Arc::clone(&engine_channel)) else {
            // Closed while the engine was creating it
            engine_channel.close().await;
            return Err(Error::ChannelCreate("connection is closed".to_string()));
        };
        info!(handle = channel.handle(), "Data channel created");
        Ok(channel)
    }

    /// Close a channel, release its observer and drop it from the registry.
    ///
    /// Returns `false` if the channel does not belong to this connection.
    pub async fn delete_data_channel(&self, channel: &DataChannel) -> bool {
        let Some(channel) = self.channels.remove(channel.handle()) else {
            return false;
        };
        channel.close().await;
        debug!(connection_id = %self.connection_id, label = %channel.label(), "Data channel deleted");
        true
    }

    pub fn data_channel(&self, handle: u64) -> Option<Arc<DataChannel>> {
        self.channels.get(handle)
    }

    /// Registered channels in creation order
    pub fn data_channels(&self) -> Vec<Arc<DataChannel>> {
        self.channels.list()
    }

    // ---------- Tracks ----------

    /// Attach a local track
    ///
    /// # Errors
    ///
    /// Returns [`Error::Track`] if the connection is closed, the track has
    /// ended, or the engine refuses it.
    #[instrument(skip(self, track, stream_ids), fields(connection_id = %self.connection_id, track_id = %track.id()))]
    pub async fn add_track(
        &self,
        track: Arc<dyn MediaStreamTrack>,
        stream_ids: &[String],
    ) -> Result<RtpSender> {
        if self.is_closed() {
            return Err(Error::Track("connection is closed".to_string()));
        }
        if track.is_ended() {
            return Err(Error::Track(format!("track '{}' has ended", track.id())));
        }

        let engine_sender = self
            .engine
            .add_track(Arc::clone(&track), stream_ids)
            .await
            .map_err(|e| Error::Track(e.to_string()))?;

        let sender = RtpSender::new(track, stream_ids.to_vec(), engine_sender);
        self.senders.lock().push(sender.clone());
        info!(sender_id = %sender.id(), "Track added");
        Ok(sender)
    }

    /// Detach a track previously returned by [`add_track`](Self::add_track)
    pub async fn remove_track(&self, sender: &RtpSender) -> Result<()> {
        let sender_id = sender.id();
        let known = self.senders.lock().iter().any(|s| s.id() == sender_id);
        if !known {
            return Err(Error::Track(format!("unknown sender '{sender_id}'")));
        }

        if !self.engine.remove_track(sender.engine_sender()).await {
            return Err(Error::Track(format!(
                "engine refused to remove sender '{sender_id}'"
            )));
        }

        self.senders.lock().retain(|s| s.id() != sender_id);
        debug!(connection_id = %self.connection_id, sender_id = %sender_id, "Track removed");
        Ok(())
    }

    pub fn senders(&self) -> Vec<RtpSender> {
        self.senders.lock().clone()
    }

    // ---------- State ----------

    /// Committed signaling state
    pub fn signaling_state(&self) -> SignalingState {
        self.coordinator.signaling_state()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.engine.ice_connection_state()
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        self.engine.ice_gathering_state()
    }

    /// Aggregate state derived from ICE
    pub fn connection_state(&self) -> PeerConnectionState {
        if self.is_closed() {
            return PeerConnectionState::Closed;
        }
        self.relay.connection_state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the connection. Idempotent.
    ///
    /// The engine is closed first so a negotiation blocked on it fails
    /// promptly; then signaling moves to Closed and every channel observer
    /// is released.
    #[instrument(skip(self), fields(connection_id = %self.connection_id))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Already closed");
            return;
        }

        self.relay.stop_accepting_channels();
        self.engine.close().await;
        self.coordinator.close().await;

        let released = self.channels.detach_all();
        self.senders.lock().clear();
        info!(channels = released, "Peer connection closed");
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.relay.stop_accepting_channels();
        self.channels.detach_all();

        if !self.closed.swap(true, Ordering::AcqRel) {
            // Finish engine teardown in the background when a runtime is around
            match Handle::try_current() {
                Ok(handle) => {
                    let engine = Arc::clone(&self.engine);
                    let factory = Arc::clone(&self.factory);
                    handle.spawn(async move {
                        engine.close().await;
                        drop(engine);
                        drop(factory);
                    });
                }
                Err(_) => warn!(
                    connection_id = %self.connection_id,
                    "Peer connection dropped without close() outside a runtime"
                ),
            }
        }

        self.relay.detach();
        debug!(connection_id = %self.connection_id, "Peer connection released");
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("connection_id", &self.connection_id)
            .field("signaling_state", &self.signaling_state())
            .field("connection_state", &self.connection_state())
            .field("channels", &self.channels.len())
            .finish()
    }
}
