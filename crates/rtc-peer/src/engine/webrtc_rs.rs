//! Engine adapter over the `webrtc` crate
//!
//! Maps the capability traits onto `webrtc::peer_connection::RTCPeerConnection`.
//! Offer/answer and description calls are spawned on the worker context and
//! resolve their [`Completion`](super::Completion) when webrtc-rs returns.
//!
//! webrtc-rs has no candidate-error callback, so
//! [`EngineObserver::on_ice_candidate_error`] is never raised by this engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::{RTCAnswerOptions, RTCOfferOptions};
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    AudioModule, ChannelObserver, ConfigurationError, DataBuffer, EngineChannel, EngineConnection,
    EngineContexts, EngineError, EngineFactory, EngineObserver, EngineRtpSender, MediaEngine,
    SdpCompletion, SetDescriptionCompletion,
};
use crate::channel::{DataChannelInit, DataChannelState};
use crate::config::{
    BundlePolicy, Configuration, IceTransportPolicy, MediaConstraints, RtcpMuxPolicy,
};
use crate::error::ConfigurationErrorKind;
use crate::ice::{IceCandidate, ParsedIceCandidate};
use crate::media::{MediaStreamTrack, RemoteTrack, TrackKind};
use crate::sdp::{SdpType, SessionDescription};
use crate::signaling::SignalingState;
use crate::state::{IceConnectionState, IceGatheringState};

/// Engine backed by webrtc-rs
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcEngine;

impl WebRtcEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    fn name(&self) -> &str {
        "webrtc-rs"
    }

    async fn create_factory(
        &self,
        contexts: &EngineContexts,
        audio: AudioModule,
    ) -> std::result::Result<Arc<dyn EngineFactory>, EngineError> {
        // Opus for audio, VP8/VP9/H.264 for video
        let mut codecs = CodecRegistry::default();
        codecs
            .register_default_codecs()
            .map_err(|e| EngineError::new(format!("failed to register codecs: {e}")))?;

        let interceptors = register_default_interceptors(Default::default(), &mut codecs)
            .map_err(|e| EngineError::new(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(interceptors)
            .build();

        info!(?audio, "webrtc-rs factory created");
        Ok(Arc::new(WebRtcFactory {
            api,
            contexts: contexts.clone(),
        }))
    }
}

struct WebRtcFactory {
    api: API,
    contexts: EngineContexts,
}

#[async_trait]
impl EngineFactory for WebRtcFactory {
    async fn create_peer_connection(
        &self,
        config: &Configuration,
        constraints: &MediaConstraints,
        observer: Arc<dyn EngineObserver>,
    ) -> std::result::Result<Arc<dyn EngineConnection>, EngineError> {
        if !constraints.enable_dtls_srtp {
            return Err(EngineError::new("webrtc-rs requires DTLS-SRTP"));
        }

        let pc = self
            .api
            .new_peer_connection(rtc_configuration(config))
            .await
            .map_err(|e| EngineError::new(format!("failed to create peer connection: {e}")))?;

        let connection = Arc::new(WebRtcConnection {
            pc: Arc::new(pc),
            contexts: self.contexts.clone(),
            senders: Mutex::new(HashMap::new()),
            receive_audio: AtomicBool::new(false),
            receive_video: AtomicBool::new(false),
        });
        connection.install_handlers(observer);
        Ok(connection)
    }
}

fn rtc_configuration(config: &Configuration) -> RTCConfiguration {
    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server| {
            #[allow(clippy::needless_update)]
            RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            }
        })
        .collect();

    // webrtc-rs only distinguishes "all" and "relay"
    let ice_transport_policy = match config.ice_transport_policy {
        IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        IceTransportPolicy::None | IceTransportPolicy::NoHost | IceTransportPolicy::All => {
            RTCIceTransportPolicy::All
        }
    };

    RTCConfiguration {
        ice_servers,
        ice_transport_policy,
        bundle_policy: match config.bundle_policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
        },
        rtcp_mux_policy: match config.rtcp_mux_policy {
            RtcpMuxPolicy::Negotiate => RTCRtcpMuxPolicy::Negotiate,
            RtcpMuxPolicy::Require => RTCRtcpMuxPolicy::Require,
        },
        peer_identity: config.peer_identity.clone().unwrap_or_default(),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        ..Default::default()
    }
}

fn to_rtc_description(
    description: &SessionDescription,
) -> std::result::Result<RTCSessionDescription, String> {
    let sdp = description.to_sdp();
    let converted = match description.sdp_type() {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::PrAnswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
    };
    converted.map_err(|e| e.to_string())
}

fn from_rtc_description(
    description: &RTCSessionDescription,
) -> std::result::Result<SessionDescription, String> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::PrAnswer,
        RTCSdpType::Answer => SdpType::Answer,
        other => return Err(format!("unsupported description type {other}")),
    };
    SessionDescription::parse(sdp_type, &description.sdp).map_err(|e| e.to_string())
}

fn map_signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    Some(match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPrAnswer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePrAnswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Unspecified => return None,
    })
}

fn map_ice_connection_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn channel_state(state: RTCDataChannelState) -> DataChannelState {
    match state {
        RTCDataChannelState::Open => DataChannelState::Open,
        RTCDataChannelState::Closing => DataChannelState::Closing,
        RTCDataChannelState::Closed => DataChannelState::Closed,
        RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
            DataChannelState::Connecting
        }
    }
}

fn configuration_error(err: webrtc::Error) -> ConfigurationError {
    let kind = match err {
        webrtc::Error::ErrConnectionClosed => ConfigurationErrorKind::InvalidState,
        webrtc::Error::ErrModifyingPeerIdentity
        | webrtc::Error::ErrModifyingCertificates
        | webrtc::Error::ErrModifyingBundlePolicy
        | webrtc::Error::ErrModifyingRTCPMuxPolicy
        | webrtc::Error::ErrModifyingICECandidatePoolSize => {
            ConfigurationErrorKind::InvalidModification
        }
        _ => ConfigurationErrorKind::InternalError,
    };
    ConfigurationError::new(kind, err.to_string())
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    contexts: EngineContexts,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    receive_audio: AtomicBool,
    receive_video: AtomicBool,
}

impl WebRtcConnection {
    fn install_handlers(&self, observer: Arc<dyn EngineObserver>) {
        let obs = Arc::clone(&observer);
        self.pc
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                if let Some(state) = map_signaling_state(state) {
                    obs.on_signaling_change(state);
                }
                Box::pin(async {})
            }));

        let obs = Arc::clone(&observer);
        self.pc.on_negotiation_needed(Box::new(move || {
            obs.on_renegotiation_needed();
            Box::pin(async {})
        }));

        let obs = Arc::clone(&observer);
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let obs = Arc::clone(&obs);
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => obs.on_ice_candidate(IceCandidate::new(
                        &init.candidate,
                        init.sdp_mid.as_deref().unwrap_or_default(),
                        i32::from(init.sdp_mline_index.unwrap_or(0)),
                    )),
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let obs = Arc::clone(&observer);
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                if let Some(state) = map_ice_connection_state(state) {
                    obs.on_ice_connection_change(state);
                }
                Box::pin(async {})
            }));

        let obs = Arc::clone(&observer);
        self.pc
            .on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                let mapped = match state {
                    RTCIceGathererState::New => Some(IceGatheringState::New),
                    RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
                    RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
                    _ => None,
                };
                if let Some(state) = mapped {
                    obs.on_ice_gathering_change(state);
                }
                Box::pin(async {})
            }));

        let obs = Arc::clone(&observer);
        self.pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            debug!(label = channel.label(), "Incoming data channel");
            obs.on_data_channel(WebRtcChannel::wrap(channel));
            Box::pin(async {})
        }));

        let obs = observer;
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            obs.on_add_track(RemoteTrack {
                id: track.id(),
                kind,
                stream_ids: vec![track.stream_id()],
            });
            Box::pin(async {})
        }));
    }

    /// Add receive-only transceivers the constraints ask for, once
    fn ensure_receivers(&self, constraints: &MediaConstraints) -> Vec<RTPCodecType> {
        let mut kinds = Vec::new();
        if constraints.offer_to_receive_audio && !self.receive_audio.swap(true, Ordering::AcqRel) {
            kinds.push(RTPCodecType::Audio);
        }
        if constraints.offer_to_receive_video && !self.receive_video.swap(true, Ordering::AcqRel) {
            kinds.push(RTPCodecType::Video);
        }
        kinds
    }

    fn spawn_set_description(
        &self,
        completion: SetDescriptionCompletion,
        description: SessionDescription,
        local: bool,
    ) {
        let pc = Arc::clone(&self.pc);
        self.contexts.worker().spawn(async move {
            let description = match to_rtc_description(&description) {
                Ok(description) => description,
                Err(reason) => return completion.fail(reason),
            };
            let result = if local {
                pc.set_local_description(description).await
            } else {
                pc.set_remote_description(description).await
            };
            match result {
                Ok(()) => completion.succeed(()),
                Err(e) => completion.fail(e.to_string()),
            }
        });
    }
}

#[async_trait]
impl EngineConnection for WebRtcConnection {
    fn create_offer(&self, completion: SdpCompletion, constraints: &MediaConstraints) {
        let pc = Arc::clone(&self.pc);
        let receivers = self.ensure_receivers(constraints);
        let options = RTCOfferOptions {
            ice_restart: constraints.ice_restart,
            ..Default::default()
        };
        self.contexts.worker().spawn(async move {
            for kind in receivers {
                let init = RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                };
                if let Err(e) = pc.add_transceiver_from_kind(kind, Some(init)).await {
                    return completion.fail(format!("failed to add {kind:?} receiver: {e}"));
                }
            }
            match pc.create_offer(Some(options)).await {
                Ok(offer) => match from_rtc_description(&offer) {
                    Ok(offer) => completion.succeed(offer),
                    Err(reason) => completion.fail(reason),
                },
                Err(e) => completion.fail(e.to_string()),
            }
        });
    }

    fn create_answer(&self, completion: SdpCompletion, _constraints: &MediaConstraints) {
        let pc = Arc::clone(&self.pc);
        self.contexts.worker().spawn(async move {
            match pc.create_answer(Some(RTCAnswerOptions::default())).await {
                Ok(answer) => match from_rtc_description(&answer) {
                    Ok(answer) => completion.succeed(answer),
                    Err(reason) => completion.fail(reason),
                },
                Err(e) => completion.fail(e.to_string()),
            }
        });
    }

    fn set_local_description(
        &self,
        completion: SetDescriptionCompletion,
        description: SessionDescription,
    ) {
        self.spawn_set_description(completion, description, true);
    }

    fn set_remote_description(
        &self,
        completion: SetDescriptionCompletion,
        description: SessionDescription,
    ) {
        self.spawn_set_description(completion, description, false);
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        from_rtc_description(&description)
            .map_err(|reason| warn!("Unreadable local description: {}", reason))
            .ok()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        let description = self.pc.remote_description().await?;
        from_rtc_description(&description)
            .map_err(|reason| warn!("Unreadable remote description: {}", reason))
            .ok()
    }

    async fn add_ice_candidate(&self, candidate: &ParsedIceCandidate) -> bool {
        let init = RTCIceCandidateInit {
            candidate: candidate.descriptor.to_string(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        match self.pc.add_ice_candidate(init).await {
            Ok(()) => true,
            Err(e) => {
                debug!("webrtc-rs rejected candidate: {}", e);
                false
            }
        }
    }

    async fn set_configuration(
        &self,
        config: &Configuration,
    ) -> std::result::Result<(), ConfigurationError> {
        self.pc
            .set_configuration(rtc_configuration(config))
            .await
            .map_err(configuration_error)
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Option<Arc<dyn EngineChannel>> {
        let options = RTCDataChannelInit {
            ordered: Some(init.ordered),
            max_packet_life_time: init.max_packet_life_time,
            max_retransmits: init.max_retransmits,
            protocol: Some(init.protocol.clone()),
            negotiated: if init.negotiated { init.id } else { None },
        };
        match self.pc.create_data_channel(label, Some(options)).await {
            Ok(channel) => Some(WebRtcChannel::wrap(channel)),
            Err(e) => {
                warn!(label, "webrtc-rs refused data channel: {}", e);
                None
            }
        }
    }

    async fn add_track(
        &self,
        track: Arc<dyn MediaStreamTrack>,
        stream_ids: &[String],
    ) -> std::result::Result<Arc<dyn EngineRtpSender>, EngineError> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let stream_id = stream_ids
            .first()
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_string(),
            stream_id,
        ));

        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::new(format!("failed to add track: {e}")))?;

        let id = uuid::Uuid::new_v4().to_string();
        self.senders.lock().insert(id.clone(), sender);
        Ok(Arc::new(WebRtcSender {
            id,
            track_id: track.id().to_string(),
        }))
    }

    async fn remove_track(&self, sender: &Arc<dyn EngineRtpSender>) -> bool {
        let Some(rtp_sender) = self.senders.lock().remove(&sender.id()) else {
            return false;
        };
        match self.pc.remove_track(&rtp_sender).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to remove track {}: {}", sender.track_id(), e);
                false
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Error closing webrtc-rs connection: {}", e);
        }
        self.senders.lock().clear();
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state()).unwrap_or(SignalingState::Stable)
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_connection_state(self.pc.ice_connection_state()).unwrap_or(IceConnectionState::New)
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        match self.pc.ice_gathering_state() {
            RTCIceGatheringState::Gathering => IceGatheringState::Gathering,
            RTCIceGatheringState::Complete => IceGatheringState::Complete,
            _ => IceGatheringState::New,
        }
    }
}

struct WebRtcSender {
    id: String,
    track_id: String,
}

impl EngineRtpSender for WebRtcSender {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn track_id(&self) -> String {
        self.track_id.clone()
    }
}

type ObserverSlot = Arc<Mutex<Option<Arc<dyn ChannelObserver>>>>;

/// RTCDataChannel with a replaceable observer slot
struct WebRtcChannel {
    channel: Arc<RTCDataChannel>,
    observer: ObserverSlot,
}

impl WebRtcChannel {
    fn wrap(channel: Arc<RTCDataChannel>) -> Arc<dyn EngineChannel> {
        let observer: ObserverSlot = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&observer);
        channel.on_open(Box::new(move || {
            if let Some(observer) = slot.lock().clone() {
                observer.on_state_change();
            }
            Box::pin(async {})
        }));

        let slot = Arc::clone(&observer);
        channel.on_close(Box::new(move || {
            if let Some(observer) = slot.lock().clone() {
                observer.on_state_change();
            }
            Box::pin(async {})
        }));

        let slot = Arc::clone(&observer);
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            if let Some(observer) = slot.lock().clone() {
                observer.on_message(DataBuffer {
                    data: message.data,
                    binary: !message.is_string,
                });
            }
            Box::pin(async {})
        }));

        Arc::new(Self { channel, observer })
    }

    fn notify_buffered(&self, amount: u64) {
        if let Some(observer) = self.observer.lock().clone() {
            observer.on_buffered_amount_change(amount);
        }
    }
}

#[async_trait]
impl EngineChannel for WebRtcChannel {
    fn register_observer(&self, observer: Arc<dyn ChannelObserver>) {
        *self.observer.lock() = Some(observer);
    }

    fn unregister_observer(&self) {
        self.observer.lock().take();
    }

    async fn send(&self, buffer: &DataBuffer) -> bool {
        let sent = if buffer.binary {
            self.channel.send(&buffer.data).await
        } else {
            match buffer.as_text() {
                Some(text) => self.channel.send_text(text.to_string()).await,
                None => return false,
            }
        };
        match sent {
            Ok(_) => {
                let amount = self.channel.buffered_amount().await as u64;
                self.notify_buffered(amount);
                true
            }
            Err(e) => {
                debug!(label = self.channel.label(), "Send failed: {}", e);
                false
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            debug!(label = self.channel.label(), "Close failed: {}", e);
        }
    }

    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    fn ordered(&self) -> bool {
        self.channel.ordered()
    }

    fn protocol(&self) -> String {
        self.channel.protocol().to_string()
    }

    fn id(&self) -> Option<u16> {
        // Stream id 0 is valid once negotiated; before that webrtc-rs reports 0 too
        if self.channel.ready_state() == RTCDataChannelState::Connecting && !self.negotiated() {
            None
        } else {
            Some(self.channel.id())
        }
    }

    fn negotiated(&self) -> bool {
        self.channel.negotiated()
    }

    fn max_retransmits(&self) -> Option<u16> {
        self.channel.max_retransmits()
    }

    fn max_packet_life_time(&self) -> Option<u16> {
        self.channel.max_packet_lifetime()
    }

    fn state(&self) -> DataChannelState {
        channel_state(self.channel.ready_state())
    }

    async fn buffered_amount(&self) -> u64 {
        self.channel.buffered_amount().await as u64
    }
}
