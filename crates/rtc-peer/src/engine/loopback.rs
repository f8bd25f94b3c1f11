//! In-process loopback engine
//!
//! Implements the engine capability set without any network I/O. Two
//! connections created from the same [`LoopbackEngine`] find each other by
//! ICE ufrag once both sides have applied an offer/answer pair. Their data
//! channels are then paired and messages flow through in-memory queues.
//!
//! Faults can be injected to drive error paths: factory failure, stalled or
//! failing offer/answer creation, candidate rejection and ICE failure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    AudioModule, ChannelObserver, ConfigurationError, DataBuffer, EngineChannel, EngineConnection,
    EngineContexts, EngineError, EngineFactory, EngineObserver, EngineRtpSender, MediaEngine,
    SdpCompletion, SetDescriptionCompletion,
};
use crate::channel::{DataChannelInit, DataChannelState, MAX_CHANNEL_ID};
use crate::config::{Configuration, IceTransportPolicy, MediaConstraints};
use crate::error::ConfigurationErrorKind;
use crate::events::IceCandidateErrorEvent;
use crate::ice::{CandidateDescriptor, IceCandidate, ParsedIceCandidate};
use crate::media::{MediaStreamTrack, RemoteTrack, TrackKind};
use crate::sdp::{MediaDescription, Origin, SdpDocument, SdpLine, SdpType, SessionDescription};
use crate::signaling::{DescriptionSource, SignalingState, SignalingStateMachine};
use crate::state::{IceConnectionState, IceGatheringState};

const LOOPBACK_ADDRESS: &str = "127.0.0.1";
const RTP_PROTOCOL: &str = "UDP/TLS/RTP/SAVPF";
const SCTP_PROTOCOL: &str = "UDP/DTLS/SCTP";
const SCTP_PORT: &str = "5000";
const MAX_MESSAGE_SIZE: &str = "262144";
const HOST_PRIORITY: u32 = 2_122_260_223;
/// Candidate error code for an unreachable STUN/TURN server
const SERVER_UNREACHABLE: u16 = 701;

#[derive(Default)]
struct Faults {
    fail_factory: AtomicBool,
    stall_negotiation: AtomicBool,
    fail_negotiation: AtomicBool,
    negotiation_delay_ms: AtomicU64,
    description_delay_ms: AtomicU64,
    reject_candidates: AtomicBool,
    fail_ice: AtomicBool,
}

#[derive(Default)]
struct Shared {
    faults: Faults,
    connections: Mutex<Vec<Weak<LoopbackConnection>>>,
    /// Serializes data channel pairing across connections
    link: Mutex<()>,
}

impl Shared {
    fn find_by_ufrag(&self, ufrag: &str, except: &str) -> Option<Arc<LoopbackConnection>> {
        self.connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|c| c.ice_ufrag == ufrag && c.id != except)
    }
}

/// Engine whose connections talk to each other inside the process
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    shared: Arc<Shared>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create_factory` fail
    pub fn fail_factory(&self, fail: bool) {
        self.shared.faults.fail_factory.store(fail, Ordering::Release);
    }

    /// Park CreateOffer/CreateAnswer requests until [`release_stalled`](Self::release_stalled)
    pub fn stall_negotiation(&self, stall: bool) {
        self.shared
            .faults
            .stall_negotiation
            .store(stall, Ordering::Release);
    }

    /// Fail every CreateOffer/CreateAnswer request
    pub fn fail_negotiation(&self, fail: bool) {
        self.shared
            .faults
            .fail_negotiation
            .store(fail, Ordering::Release);
    }

    /// Delay before CreateOffer/CreateAnswer complete
    pub fn set_negotiation_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.shared
            .faults
            .negotiation_delay_ms
            .store(millis, Ordering::Release);
    }

    /// Delay before SetLocal/SetRemoteDescription are applied
    pub fn set_description_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.shared
            .faults
            .description_delay_ms
            .store(millis, Ordering::Release);
    }

    pub fn reject_candidates(&self, reject: bool) {
        self.shared
            .faults
            .reject_candidates
            .store(reject, Ordering::Release);
    }

    /// Drive ICE to Failed instead of Connected
    pub fn fail_ice(&self, fail: bool) {
        self.shared.faults.fail_ice.store(fail, Ordering::Release);
    }

    /// Live connections created by this engine
    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        let mut connections = self.shared.connections.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections.iter().filter_map(Weak::upgrade).collect()
    }

    /// Complete every parked request. Returns how many were released.
    pub fn release_stalled(&self) -> usize {
        self.connections()
            .iter()
            .map(|c| c.release_stalled())
            .sum()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn create_factory(
        &self,
        contexts: &EngineContexts,
        audio: AudioModule,
    ) -> std::result::Result<Arc<dyn EngineFactory>, EngineError> {
        if self.shared.faults.fail_factory.load(Ordering::Acquire) {
            return Err(EngineError::new(
                "loopback transport threads failed to start",
            ));
        }
        debug!(?audio, "Loopback factory created");
        Ok(Arc::new(LoopbackFactory {
            shared: Arc::clone(&self.shared),
            worker: contexts.worker().clone(),
            audio,
        }))
    }
}

struct LoopbackFactory {
    shared: Arc<Shared>,
    worker: Handle,
    audio: AudioModule,
}

#[async_trait]
impl EngineFactory for LoopbackFactory {
    async fn create_peer_connection(
        &self,
        config: &Configuration,
        constraints: &MediaConstraints,
        observer: Arc<dyn EngineObserver>,
    ) -> std::result::Result<Arc<dyn EngineConnection>, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::new(e.to_string()))?;
        if config.ice_transport_policy == IceTransportPolicy::Relay && !config.has_turn_server() {
            return Err(EngineError::new(
                "relay transport policy requires a TURN server",
            ));
        }
        if !constraints.enable_dtls_srtp {
            return Err(EngineError::new("DTLS-SRTP cannot be disabled"));
        }

        let connection = LoopbackConnection::new(
            Arc::clone(&self.shared),
            self.worker.clone(),
            config.clone(),
            observer,
        );
        self.shared
            .connections
            .lock()
            .push(Arc::downgrade(&connection));
        debug!(connection = %connection.id, audio = ?self.audio, "Loopback connection created");
        Ok(connection)
    }
}

// ========== Connection ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SdpRequest {
    Offer,
    Answer,
}

struct StalledRequest {
    kind: SdpRequest,
    completion: SdpCompletion,
    constraints: MediaConstraints,
}

struct Inner {
    configuration: Configuration,
    signaling: SignalingStateMachine,
    session_version: u64,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    ice_state: IceConnectionState,
    gathering_state: IceGatheringState,
    channels: Vec<Arc<LoopbackChannel>>,
    senders: Vec<Arc<LoopbackSender>>,
    remote_candidates: Vec<ParsedIceCandidate>,
    announced_tracks: Vec<String>,
    peer: Weak<LoopbackConnection>,
    stalled: Vec<StalledRequest>,
    closed: bool,
}

/// Engine connection of the loopback engine
pub struct LoopbackConnection {
    id: String,
    me: Weak<LoopbackConnection>,
    shared: Arc<Shared>,
    worker: Handle,
    observer: Arc<dyn EngineObserver>,
    ice_ufrag: String,
    ice_pwd: String,
    fingerprint: String,
    session_id: u64,
    inner: Mutex<Inner>,
}

impl LoopbackConnection {
    fn new(
        shared: Arc<Shared>,
        worker: Handle,
        configuration: Configuration,
        observer: Arc<dyn EngineObserver>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let ice_ufrag = id.simple().to_string()[..8].to_string();
        let ice_pwd = Uuid::new_v4().simple().to_string();
        let fingerprint = certificate_fingerprint(id.as_bytes());
        let session_id = (id.as_u128() >> 65) as u64;

        Arc::new_cyclic(|me| Self {
            id: id.to_string(),
            me: me.clone(),
            shared,
            worker,
            observer,
            ice_ufrag,
            ice_pwd,
            fingerprint,
            session_id,
            inner: Mutex::new(Inner {
                configuration,
                signaling: SignalingStateMachine::new(),
                session_version: 1,
                local: None,
                remote: None,
                ice_state: IceConnectionState::New,
                gathering_state: IceGatheringState::New,
                channels: Vec::new(),
                senders: Vec::new(),
                remote_candidates: Vec::new(),
                announced_tracks: Vec::new(),
                peer: Weak::new(),
                stalled: Vec::new(),
                closed: false,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ice_ufrag(&self) -> &str {
        &self.ice_ufrag
    }

    /// Connection this one is paired with, once ICE has connected
    pub fn peer(&self) -> Option<Arc<LoopbackConnection>> {
        self.inner.lock().peer.upgrade()
    }

    pub fn remote_candidate_count(&self) -> usize {
        self.inner.lock().remote_candidates.len()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Force an ICE connection state, as a network change would
    pub fn simulate_ice_state(&self, state: IceConnectionState) {
        self.set_ice_state(state);
    }

    pub fn simulate_candidate_error(&self, error: IceCandidateErrorEvent) {
        self.observer.on_ice_candidate_error(error);
    }

    fn release_stalled(&self) -> usize {
        let stalled = std::mem::take(&mut self.inner.lock().stalled);
        let count = stalled.len();
        for request in stalled {
            self.complete_sdp(request.kind, request.completion, &request.constraints);
        }
        count
    }

    // ---------- Offer/answer ----------

    fn dispatch_sdp(
        &self,
        kind: SdpRequest,
        completion: SdpCompletion,
        constraints: &MediaConstraints,
    ) {
        let faults = &self.shared.faults;
        if faults.stall_negotiation.load(Ordering::Acquire) {
            debug!(connection = %self.id, ?kind, generation = completion.generation(), "Parking request");
            self.inner.lock().stalled.push(StalledRequest {
                kind,
                completion,
                constraints: constraints.clone(),
            });
            return;
        }

        let Some(this) = self.me.upgrade() else {
            completion.fail("connection released");
            return;
        };
        let delay = Duration::from_millis(faults.negotiation_delay_ms.load(Ordering::Acquire));
        let constraints = constraints.clone();
        self.worker.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            this.complete_sdp(kind, completion, &constraints);
        });
    }

    fn complete_sdp(
        &self,
        kind: SdpRequest,
        completion: SdpCompletion,
        constraints: &MediaConstraints,
    ) {
        if self.shared.faults.fail_negotiation.load(Ordering::Acquire) {
            completion.fail(format!("injected {kind:?} failure"));
            return;
        }
        let result = match kind {
            SdpRequest::Offer => self.build_offer(constraints),
            SdpRequest::Answer => self.build_answer(),
        };
        match result {
            Ok(description) => completion.succeed(description),
            Err(reason) => completion.fail(reason),
        }
    }

    fn build_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<SessionDescription, String> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err("connection is closed".to_string());
        }
        inner
            .signaling
            .check_create_offer()
            .map_err(|e| e.to_string())?;
        if constraints.ice_restart {
            debug!(connection = %self.id, "ICE restart requested; loopback credentials are fixed");
        }

        inner.session_version += 1;
        let mut document = SdpDocument::new(self.origin(inner.session_version));

        let sends = |kind| inner.senders.iter().any(|s| s.kind == kind);
        let mut kinds = Vec::new();
        if sends(TrackKind::Audio) || constraints.offer_to_receive_audio {
            kinds.push(TrackKind::Audio);
        }
        if sends(TrackKind::Video) || constraints.offer_to_receive_video {
            kinds.push(TrackKind::Video);
        }

        for kind in kinds {
            let mid = document.media.len().to_string();
            let section = self.rtp_section(kind, &mid, "actpass", &inner.senders);
            document.media.push(section);
        }
        if !inner.channels.is_empty() {
            let mid = document.media.len().to_string();
            document.media.push(self.application_section(&mid, "actpass"));
        }
        push_bundle_group(&mut document);

        Ok(SessionDescription::new(SdpType::Offer, document))
    }

    fn build_answer(&self) -> std::result::Result<SessionDescription, String> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err("connection is closed".to_string());
        }
        inner
            .signaling
            .check_create_answer()
            .map_err(|e| e.to_string())?;
        let offer = inner
            .remote
            .as_ref()
            .map(|d| d.document().clone())
            .ok_or_else(|| "no remote description".to_string())?;

        inner.session_version += 1;
        let mut document = SdpDocument::new(self.origin(inner.session_version));
        for (index, offered) in offer.media.iter().enumerate() {
            let mid = offered
                .mid()
                .map(str::to_string)
                .unwrap_or_else(|| index.to_string());
            let section = match offered.media.as_str() {
                "audio" => self.rtp_section(TrackKind::Audio, &mid, "active", &inner.senders),
                "video" => self.rtp_section(TrackKind::Video, &mid, "active", &inner.senders),
                "application" => self.application_section(&mid, "active"),
                other => {
                    // Unsupported media is rejected with port 0
                    let formats: Vec<&str> = offered.formats.iter().map(String::as_str).collect();
                    let mut rejected = MediaDescription::new(other, 0, &offered.protocol, &formats);
                    rejected.push_attribute("mid", Some(&mid));
                    rejected
                }
            };
            document.media.push(section);
        }
        push_bundle_group(&mut document);

        Ok(SessionDescription::new(SdpType::Answer, document))
    }

    fn origin(&self, session_version: u64) -> Origin {
        Origin {
            username: "-".to_string(),
            session_id: self.session_id,
            session_version,
            net_type: "IN".to_string(),
            addr_type: "IP4".to_string(),
            unicast_address: LOOPBACK_ADDRESS.to_string(),
        }
    }

    fn transport_lines(&self, section: &mut MediaDescription, mid: &str, setup: &str) {
        section.lines.push(SdpLine::new('c', "IN IP4 0.0.0.0"));
        section.push_attribute("ice-ufrag", Some(&self.ice_ufrag));
        section.push_attribute("ice-pwd", Some(&self.ice_pwd));
        section.push_attribute("ice-options", Some("trickle"));
        section.push_attribute("fingerprint", Some(&self.fingerprint));
        section.push_attribute("setup", Some(setup));
        section.push_attribute("mid", Some(mid));
    }

    fn rtp_section(
        &self,
        kind: TrackKind,
        mid: &str,
        setup: &str,
        senders: &[Arc<LoopbackSender>],
    ) -> MediaDescription {
        let (format, rtpmap) = match kind {
            TrackKind::Audio => ("111", "111 opus/48000/2"),
            TrackKind::Video => ("96", "96 VP8/90000"),
        };
        let mut section = MediaDescription::new(&kind.to_string(), 9, RTP_PROTOCOL, &[format]);
        self.transport_lines(&mut section, mid, setup);

        let sending: Vec<_> = senders.iter().filter(|s| s.kind == kind).collect();
        let direction = if sending.is_empty() { "recvonly" } else { "sendrecv" };
        section.push_attribute(direction, None);
        for sender in sending {
            if sender.stream_ids.is_empty() {
                section.push_attribute("msid", Some(&format!("- {}", sender.track_id)));
            }
            for stream in &sender.stream_ids {
                section.push_attribute("msid", Some(&format!("{stream} {}", sender.track_id)));
            }
        }
        section.push_attribute("rtcp-mux", None);
        section.push_attribute("rtpmap", Some(rtpmap));
        section
    }

    fn application_section(&self, mid: &str, setup: &str) -> MediaDescription {
        let mut section =
            MediaDescription::new("application", 9, SCTP_PROTOCOL, &["webrtc-datachannel"]);
        self.transport_lines(&mut section, mid, setup);
        section.push_attribute("sctp-port", Some(SCTP_PORT));
        section.push_attribute("max-message-size", Some(MAX_MESSAGE_SIZE));
        section
    }

    // ---------- Descriptions ----------

    fn dispatch_set(
        &self,
        source: DescriptionSource,
        completion: SetDescriptionCompletion,
        description: SessionDescription,
    ) {
        let Some(this) = self.me.upgrade() else {
            completion.fail("connection released");
            return;
        };
        let delay = Duration::from_millis(
            self.shared
                .faults
                .description_delay_ms
                .load(Ordering::Acquire),
        );
        self.worker.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match this.apply_description(source, description) {
                Ok(state) => {
                    completion.succeed(());
                    this.after_description(source, state);
                }
                Err(reason) => {
                    warn!(connection = %this.id, %source, %reason, "Description rejected");
                    completion.fail(reason);
                }
            }
        });
    }

    fn apply_description(
        &self,
        source: DescriptionSource,
        description: SessionDescription,
    ) -> std::result::Result<SignalingState, String> {
        let sdp_type = description.sdp_type();
        let (state, tracks) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err("connection is closed".to_string());
            }
            let state = inner
                .signaling
                .apply(source, sdp_type)
                .map_err(|e| e.to_string())?;

            let mut tracks = Vec::new();
            match source {
                DescriptionSource::Local => inner.local = Some(description),
                DescriptionSource::Remote => {
                    for track in remote_tracks(description.document()) {
                        if !inner.announced_tracks.contains(&track.id) {
                            inner.announced_tracks.push(track.id.clone());
                            tracks.push(track);
                        }
                    }
                    inner.remote = Some(description);
                }
            }
            (state, tracks)
        };

        trace!(connection = %self.id, %source, %sdp_type, %state, "Description applied");
        self.observer.on_signaling_change(state);
        for track in tracks {
            self.observer.on_add_track(track);
        }
        Ok(state)
    }

    fn after_description(&self, source: DescriptionSource, state: SignalingState) {
        if source == DescriptionSource::Local {
            self.gather();
        }
        if state == SignalingState::Stable {
            self.try_connect();
        }
    }

    // ---------- ICE ----------

    fn gather(&self) {
        let (policy, turn_urls, first_mid) = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.gathering_state != IceGatheringState::New {
                return;
            }
            inner.gathering_state = IceGatheringState::Gathering;
            let first_mid = inner.local.as_ref().and_then(|d| {
                d.document()
                    .media
                    .iter()
                    .enumerate()
                    .find_map(|(index, m)| m.mid().map(|mid| (mid.to_string(), index)))
            });
            let turn_urls: Vec<String> = inner
                .configuration
                .ice_servers
                .iter()
                .filter(|s| s.is_turn())
                .flat_map(|s| s.urls.clone())
                .collect();
            (inner.configuration.ice_transport_policy, turn_urls, first_mid)
        };
        self.observer
            .on_ice_gathering_change(IceGatheringState::Gathering);

        match policy {
            IceTransportPolicy::All => {
                // Bundled transport: one host candidate on the first m-line
                if let Some((mid, index)) = first_mid {
                    let port = 49152 + (self.session_id % 16384) as u16;
                    let descriptor =
                        CandidateDescriptor::host("1", 1, LOOPBACK_ADDRESS, port, HOST_PRIORITY);
                    self.record_local_candidate(&mid, &descriptor);
                    let candidate =
                        IceCandidate::new(&descriptor.to_string(), &mid, index as i32);
                    debug!(connection = %self.id, candidate = %candidate.candidate, "Gathered host candidate");
                    self.observer.on_ice_candidate(candidate);
                }
            }
            IceTransportPolicy::Relay => {
                for url in turn_urls {
                    self.observer.on_ice_candidate_error(IceCandidateErrorEvent {
                        address: None,
                        port: None,
                        url,
                        error_code: SERVER_UNREACHABLE,
                        error_text: "TURN server unreachable from loopback".to_string(),
                    });
                }
            }
            IceTransportPolicy::NoHost | IceTransportPolicy::None => {}
        }

        self.inner.lock().gathering_state = IceGatheringState::Complete;
        self.observer
            .on_ice_gathering_change(IceGatheringState::Complete);
    }

    fn record_local_candidate(&self, mid: &str, descriptor: &CandidateDescriptor) {
        let mut inner = self.inner.lock();
        let Some(local) = inner.local.as_ref() else {
            return;
        };
        let sdp_type = local.sdp_type();
        let mut document = local.document().clone();
        if let Some(section) = document.media.iter_mut().find(|m| m.mid() == Some(mid)) {
            let text = descriptor.to_string();
            let value = text.strip_prefix("candidate:").unwrap_or(&text);
            section.push_attribute("candidate", Some(value));
        }
        inner.local = Some(SessionDescription::new(sdp_type, document));
    }

    fn try_connect(&self) {
        let (remote_ufrag, ice_state) = {
            let inner = self.inner.lock();
            if inner.closed || inner.signaling.state() != SignalingState::Stable || inner.local.is_none() {
                return;
            }
            let ufrag = inner
                .remote
                .as_ref()
                .and_then(|d| d.document().ice_ufrag().map(str::to_string));
            (ufrag, inner.ice_state)
        };

        if ice_state.is_connected() {
            // Renegotiation on a live transport: pair any new channels
            if let Some(peer) = self.peer() {
                self.link_channels(&peer);
            }
            return;
        }
        if ice_state != IceConnectionState::New {
            return;
        }

        self.set_ice_state(IceConnectionState::Checking);
        if self.shared.faults.fail_ice.load(Ordering::Acquire) {
            self.set_ice_state(IceConnectionState::Failed);
            return;
        }

        let peer = remote_ufrag.and_then(|ufrag| self.shared.find_by_ufrag(&ufrag, &self.id));
        let Some(peer) = peer else {
            warn!(connection = %self.id, "No loopback peer matches the remote ufrag");
            self.set_ice_state(IceConnectionState::Failed);
            return;
        };

        self.inner.lock().peer = Arc::downgrade(&peer);
        self.set_ice_state(IceConnectionState::Connected);
        info!(connection = %self.id, peer = %peer.id, "Loopback transport connected");
        self.link_channels(&peer);
    }

    fn set_ice_state(&self, state: IceConnectionState) {
        {
            let mut inner = self.inner.lock();
            if inner.ice_state == state {
                return;
            }
            inner.ice_state = state;
        }
        self.observer.on_ice_connection_change(state);
    }

    fn on_peer_closed(&self) {
        let connected = {
            let inner = self.inner.lock();
            !inner.closed && inner.ice_state.is_connected()
        };
        if connected {
            self.set_ice_state(IceConnectionState::Disconnected);
        }
    }

    // ---------- Data channels ----------

    fn link_channels(&self, peer: &Arc<LoopbackConnection>) {
        let pairs: Vec<_> = {
            let _link = self.shared.link.lock();
            let pending: Vec<_> = self
                .inner
                .lock()
                .channels
                .iter()
                .filter(|c| !c.is_linked())
                .cloned()
                .collect();
            pending
                .into_iter()
                .filter_map(|channel| {
                    let counterpart = self.link_channel(peer, &channel)?;
                    Some((channel, counterpart))
                })
                .collect()
        };
        // Open outside the link lock; on_open callbacks may create channels
        for (channel, counterpart) in pairs {
            open_pair(&channel, &counterpart);
        }
    }

    /// Pair `channel` with its counterpart on `peer`. Caller holds the link lock.
    fn link_channel(
        &self,
        peer: &Arc<LoopbackConnection>,
        channel: &Arc<LoopbackChannel>,
    ) -> Option<Arc<LoopbackChannel>> {
        let counterpart = if channel.init.negotiated {
            let counterpart = peer.find_unlinked_negotiated(channel.id);
            if counterpart.is_none() {
                debug!(label = %channel.label, id = channel.id, "Negotiated channel waiting for its counterpart");
            }
            counterpart?
        } else {
            peer.accept_remote_channel(channel)?
        };

        channel.link(&counterpart);
        counterpart.link(channel);
        Some(counterpart)
    }

    fn find_unlinked_negotiated(&self, id: u16) -> Option<Arc<LoopbackChannel>> {
        self.inner
            .lock()
            .channels
            .iter()
            .find(|c| c.init.negotiated && c.id == id && !c.is_linked())
            .cloned()
    }

    /// Create the remote half of an in-band channel and announce it
    fn accept_remote_channel(&self, origin: &LoopbackChannel) -> Option<Arc<LoopbackChannel>> {
        let counterpart = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return None;
            }
            let counterpart = LoopbackChannel::new(
                &self.worker,
                &origin.label,
                origin.init.clone(),
                origin.id,
            );
            inner.channels.push(Arc::clone(&counterpart));
            counterpart
        };
        self.observer
            .on_data_channel(Arc::clone(&counterpart) as Arc<dyn EngineChannel>);
        Some(counterpart)
    }
}

#[async_trait]
impl EngineConnection for LoopbackConnection {
    fn create_offer(&self, completion: SdpCompletion, constraints: &MediaConstraints) {
        self.dispatch_sdp(SdpRequest::Offer, completion, constraints);
    }

    fn create_answer(&self, completion: SdpCompletion, constraints: &MediaConstraints) {
        self.dispatch_sdp(SdpRequest::Answer, completion, constraints);
    }

    fn set_local_description(
        &self,
        completion: SetDescriptionCompletion,
        description: SessionDescription,
    ) {
        self.dispatch_set(DescriptionSource::Local, completion, description);
    }

    fn set_remote_description(
        &self,
        completion: SetDescriptionCompletion,
        description: SessionDescription,
    ) {
        self.dispatch_set(DescriptionSource::Remote, completion, description);
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: &ParsedIceCandidate) -> bool {
        if self.shared.faults.reject_candidates.load(Ordering::Acquire) {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        let Some(remote) = inner.remote.as_ref() else {
            debug!(connection = %self.id, "Candidate arrived before the remote description");
            return false;
        };
        let document = remote.document();
        let known = document.media_by_mid(&candidate.sdp_mid).is_some()
            || usize::from(candidate.sdp_mline_index) < document.media.len();
        if !known {
            return false;
        }
        inner.remote_candidates.push(candidate.clone());
        true
    }

    async fn set_configuration(
        &self,
        config: &Configuration,
    ) -> std::result::Result<(), ConfigurationError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ConfigurationError::new(
                ConfigurationErrorKind::InvalidState,
                "connection is closed",
            ));
        }
        config
            .validate()
            .map_err(|e| ConfigurationError::new(ConfigurationErrorKind::SyntaxError, e.to_string()))?;

        let current = &inner.configuration;
        if config.bundle_policy != current.bundle_policy {
            return Err(ConfigurationError::new(
                ConfigurationErrorKind::InvalidModification,
                "bundle policy cannot change",
            ));
        }
        if config.rtcp_mux_policy != current.rtcp_mux_policy {
            return Err(ConfigurationError::new(
                ConfigurationErrorKind::InvalidModification,
                "rtcp-mux policy cannot change",
            ));
        }
        if current.peer_identity.is_some() && config.peer_identity != current.peer_identity {
            return Err(ConfigurationError::new(
                ConfigurationErrorKind::InvalidModification,
                "peer identity cannot change",
            ));
        }

        inner.configuration = config.clone();
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Option<Arc<dyn EngineChannel>> {
        let (channel, first, peer) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return None;
            }
            let id = allocate_channel_id(&inner.channels, init.id)?;
            let channel = LoopbackChannel::new(&self.worker, label, init.clone(), id);
            let first = inner.channels.is_empty();
            inner.channels.push(Arc::clone(&channel));
            let peer = if inner.ice_state.is_connected() {
                inner.peer.upgrade()
            } else {
                None
            };
            (channel, first, peer)
        };

        if first {
            self.observer.on_renegotiation_needed();
        }
        if let Some(peer) = peer {
            let counterpart = {
                let _link = self.shared.link.lock();
                self.link_channel(&peer, &channel)
            };
            if let Some(counterpart) = counterpart {
                open_pair(&channel, &counterpart);
            }
        }
        Some(channel)
    }

    async fn add_track(
        &self,
        track: Arc<dyn MediaStreamTrack>,
        stream_ids: &[String],
    ) -> std::result::Result<Arc<dyn EngineRtpSender>, EngineError> {
        let sender = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(EngineError::new("connection is closed"));
            }
            if inner.senders.iter().any(|s| s.track_id == track.id()) {
                return Err(EngineError::new(format!(
                    "track '{}' already has a sender",
                    track.id()
                )));
            }
            let sender = Arc::new(LoopbackSender {
                id: Uuid::new_v4().to_string(),
                track_id: track.id().to_string(),
                kind: track.kind(),
                stream_ids: stream_ids.to_vec(),
            });
            inner.senders.push(Arc::clone(&sender));
            sender
        };
        self.observer.on_renegotiation_needed();
        Ok(sender)
    }

    async fn remove_track(&self, sender: &Arc<dyn EngineRtpSender>) -> bool {
        let id = sender.id();
        let removed = {
            let mut inner = self.inner.lock();
            let before = inner.senders.len();
            inner.senders.retain(|s| s.id != id);
            inner.senders.len() != before
        };
        if removed {
            self.observer.on_renegotiation_needed();
        }
        removed
    }

    async fn close(&self) {
        let (channels, peer, stalled) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.signaling.close();
            (
                std::mem::take(&mut inner.channels),
                inner.peer.upgrade(),
                std::mem::take(&mut inner.stalled),
            )
        };

        for request in stalled {
            request.completion.fail("connection closed");
        }
        for channel in &channels {
            channel.shutdown_pair();
        }
        self.observer.on_signaling_change(SignalingState::Closed);
        self.set_ice_state(IceConnectionState::Closed);
        if let Some(peer) = peer {
            peer.on_peer_closed();
        }
        info!(connection = %self.id, channels = channels.len(), "Loopback connection closed");
    }

    fn signaling_state(&self) -> SignalingState {
        self.inner.lock().signaling.state()
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.inner.lock().ice_state
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        self.inner.lock().gathering_state
    }
}

// ========== Channels ==========

/// In-memory data channel
pub struct LoopbackChannel {
    label: String,
    init: DataChannelInit,
    id: u16,
    state: Mutex<DataChannelState>,
    observer: Mutex<Option<Arc<dyn ChannelObserver>>>,
    remote: Mutex<Weak<LoopbackChannel>>,
    linked: AtomicBool,
    inbound: mpsc::UnboundedSender<DataBuffer>,
    buffered: AtomicU64,
}

impl LoopbackChannel {
    fn new(worker: &Handle, label: &str, init: DataChannelInit, id: u16) -> Arc<Self> {
        let (inbound, mut rx) = mpsc::unbounded_channel::<DataBuffer>();
        let channel = Arc::new(Self {
            label: label.to_string(),
            init,
            id,
            state: Mutex::new(DataChannelState::Connecting),
            observer: Mutex::new(None),
            remote: Mutex::new(Weak::new()),
            linked: AtomicBool::new(false),
            inbound,
            buffered: AtomicU64::new(0),
        });

        // One delivery task per channel keeps messages in send order
        let weak = Arc::downgrade(&channel);
        worker.spawn(async move {
            while let Some(buffer) = rx.recv().await {
                let Some(channel) = weak.upgrade() else {
                    break;
                };
                channel.deliver(buffer);
            }
        });
        channel
    }

    fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    fn link(&self, remote: &Arc<LoopbackChannel>) {
        *self.remote.lock() = Arc::downgrade(remote);
        self.linked.store(true, Ordering::Release);
    }

    fn set_state(&self, state: DataChannelState) {
        if self.mark_state(state) {
            self.notify_state();
        }
    }

    /// Returns `false` if already in `state`
    fn mark_state(&self, state: DataChannelState) -> bool {
        let mut current = self.state.lock();
        if *current == state {
            return false;
        }
        *current = state;
        true
    }

    fn notify_state(&self) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.on_state_change();
        }
    }

    fn deliver(&self, buffer: DataBuffer) {
        let observer = self.observer.lock().clone();
        match observer {
            Some(observer) => observer.on_message(buffer),
            None => trace!(label = %self.label, "Dropping message for channel without observer"),
        }
    }

    fn notify_buffered(&self, amount: u64) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.on_buffered_amount_change(amount);
        }
    }

    fn shutdown(&self) {
        if *self.state.lock() == DataChannelState::Closed {
            return;
        }
        self.set_state(DataChannelState::Closing);
        self.set_state(DataChannelState::Closed);
    }

    /// Close this channel and its remote half
    fn shutdown_pair(&self) {
        let remote = self.remote.lock().upgrade();
        self.shutdown();
        if let Some(remote) = remote {
            remote.shutdown();
        }
    }
}

#[async_trait]
impl EngineChannel for LoopbackChannel {
    fn register_observer(&self, observer: Arc<dyn ChannelObserver>) {
        *self.observer.lock() = Some(observer);
    }

    fn unregister_observer(&self) {
        *self.observer.lock() = None;
    }

    async fn send(&self, buffer: &DataBuffer) -> bool {
        if self.state() != DataChannelState::Open {
            return false;
        }
        let Some(remote) = self.remote.lock().upgrade() else {
            return false;
        };
        if remote.state() != DataChannelState::Open {
            return false;
        }

        let len = buffer.len() as u64;
        let queued = self.buffered.fetch_add(len, Ordering::AcqRel) + len;
        self.notify_buffered(queued);
        let delivered = remote.inbound.send(buffer.clone()).is_ok();
        let remaining = self.buffered.fetch_sub(len, Ordering::AcqRel) - len;
        self.notify_buffered(remaining);
        delivered
    }

    async fn close(&self) {
        self.shutdown_pair();
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn ordered(&self) -> bool {
        self.init.ordered
    }

    fn protocol(&self) -> String {
        self.init.protocol.clone()
    }

    fn id(&self) -> Option<u16> {
        Some(self.id)
    }

    fn negotiated(&self) -> bool {
        self.init.negotiated
    }

    fn max_retransmits(&self) -> Option<u16> {
        self.init.max_retransmits
    }

    fn max_packet_life_time(&self) -> Option<u16> {
        self.init.max_packet_life_time
    }

    fn state(&self) -> DataChannelState {
        *self.state.lock()
    }

    async fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::Acquire)
    }
}

struct LoopbackSender {
    id: String,
    track_id: String,
    kind: TrackKind,
    stream_ids: Vec<String>,
}

impl EngineRtpSender for LoopbackSender {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn track_id(&self) -> String {
        self.track_id.clone()
    }
}

// ========== Helpers ==========

fn open_pair(channel: &LoopbackChannel, counterpart: &LoopbackChannel) {
    // Both halves are open before either side hears about it
    let opened = channel.mark_state(DataChannelState::Open);
    let counterpart_opened = counterpart.mark_state(DataChannelState::Open);
    if opened {
        channel.notify_state();
    }
    if counterpart_opened {
        counterpart.notify_state();
    }
    debug!(label = %channel.label, id = channel.id, "Data channel pair open");
}

/// `sha-256 AB:CD:...` fingerprint of a synthetic certificate
fn certificate_fingerprint(seed: &[u8]) -> String {
    let digest = hex::encode_upper(Sha256::digest(seed));
    let pairs: Vec<&str> = (0..digest.len())
        .step_by(2)
        .map(|i| &digest[i..i + 2])
        .collect();
    format!("sha-256 {}", pairs.join(":"))
}

fn push_bundle_group(document: &mut SdpDocument) {
    let mids: Vec<String> = document
        .media
        .iter()
        .filter(|m| m.port != 0)
        .filter_map(|m| m.mid().map(str::to_string))
        .collect();
    if !mids.is_empty() {
        document.push_attribute("group", Some(&format!("BUNDLE {}", mids.join(" "))));
    }
}

/// Tracks announced through `a=msid` in audio/video sections
fn remote_tracks(document: &SdpDocument) -> Vec<RemoteTrack> {
    let mut tracks: Vec<RemoteTrack> = Vec::new();
    for section in &document.media {
        let kind = match section.media.as_str() {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            _ => continue,
        };
        let msids = section
            .lines
            .iter()
            .filter_map(SdpLine::as_attribute)
            .filter(|(name, _)| *name == "msid")
            .filter_map(|(_, value)| value);
        for msid in msids {
            let Some((stream, track_id)) = msid.split_once(' ') else {
                continue;
            };
            let index = match tracks.iter().position(|t| t.id == track_id) {
                Some(index) => index,
                None => {
                    tracks.push(RemoteTrack {
                        id: track_id.to_string(),
                        kind,
                        stream_ids: Vec::new(),
                    });
                    tracks.len() - 1
                }
            };
            if stream != "-" {
                tracks[index].stream_ids.push(stream.to_string());
            }
        }
    }
    tracks
}

/// Requested id if free, otherwise the lowest unused stream id
fn allocate_channel_id(channels: &[Arc<LoopbackChannel>], requested: Option<u16>) -> Option<u16> {
    let in_use = |id: u16| channels.iter().any(|c| c.id == id);
    match requested {
        Some(id) if in_use(id) => None,
        Some(id) => Some(id),
        None => (0..=MAX_CHANNEL_ID).find(|id| !in_use(*id)),
    }
}
