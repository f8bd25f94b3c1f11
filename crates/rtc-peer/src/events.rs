//! Observer surface for peer-connection events
//!
//! The engine reports events on its own contexts. [`EventRelay`] turns each
//! report into a [`PeerConnectionEvent`] and pushes it onto a FIFO queue;
//! a dispatcher drains the queue into the caller's
//! [`PeerConnectionHandler`]. Nothing on this path touches the negotiation
//! lock, so an event can never wait for an in-flight CreateOffer.
//!
//! With [`EventDelivery::Thread`] the same queue also carries data channel
//! callbacks, so every caller callback runs on the dispatcher thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::channel::data_channel::ChannelTask;
use crate::channel::{ChannelRegistry, DataChannel};
use crate::engine::{EngineChannel, EngineObserver};
use crate::ice::IceCandidate;
use crate::media::RemoteTrack;
use crate::signaling::SignalingState;
use crate::state::{IceConnectionState, IceGatheringState, PeerConnectionState};

/// ICE candidate gathering failure reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateErrorEvent {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub url: String,
    pub error_code: u16,
    pub error_text: String,
}

/// Caller-side event callbacks.
///
/// Every method has an empty default so handlers implement only what they
/// need. Callbacks run on the connection's event dispatcher, one at a time,
/// in the order the engine reported them.
pub trait PeerConnectionHandler: Send + Sync {
    fn on_signaling_change(&self, _state: SignalingState) {}

    /// Locally gathered candidate to forward to the remote peer
    fn on_ice_candidate(&self, _candidate: IceCandidate) {}

    fn on_ice_candidate_error(&self, _error: IceCandidateErrorEvent) {}

    /// Every ICE connection state except Failed
    fn on_ice_connection_change(&self, _state: IceConnectionState) {}

    /// ICE failed; the caller decides whether to renegotiate
    fn on_ice_connection_failed(&self) {}

    fn on_connection_state_change(&self, _state: PeerConnectionState) {}

    fn on_ice_gathering_change(&self, _state: IceGatheringState) {}

    /// Gathering reached Complete
    fn on_ice_complete(&self) {}

    fn on_renegotiation_needed(&self) {}

    /// Remotely negotiated channel, already registered with the connection
    fn on_data_channel(&self, _channel: Arc<DataChannel>) {}

    fn on_add_track(&self, _track: RemoteTrack) {}
}

/// Handler that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl PeerConnectionHandler for NoopHandler {}

/// Queued peer-connection event
#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    SignalingChange(SignalingState),
    IceCandidate(IceCandidate),
    IceCandidateError(IceCandidateErrorEvent),
    IceConnectionChange(IceConnectionState),
    IceConnectionFailed,
    ConnectionStateChange(PeerConnectionState),
    IceGatheringChange(IceGatheringState),
    IceComplete,
    RenegotiationNeeded,
    DataChannel(Arc<DataChannel>),
    AddTrack(RemoteTrack),
}

impl PeerConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SignalingChange(_) => "signaling_change",
            Self::IceCandidate(_) => "ice_candidate",
            Self::IceCandidateError(_) => "ice_candidate_error",
            Self::IceConnectionChange(_) => "ice_connection_change",
            Self::IceConnectionFailed => "ice_connection_failed",
            Self::ConnectionStateChange(_) => "connection_state_change",
            Self::IceGatheringChange(_) => "ice_gathering_change",
            Self::IceComplete => "ice_complete",
            Self::RenegotiationNeeded => "renegotiation_needed",
            Self::DataChannel(_) => "data_channel",
            Self::AddTrack(_) => "add_track",
        }
    }

    /// Invoke the matching handler method
    pub fn deliver(self, handler: &dyn PeerConnectionHandler) {
        match self {
            Self::SignalingChange(state) => handler.on_signaling_change(state),
            Self::IceCandidate(candidate) => handler.on_ice_candidate(candidate),
            Self::IceCandidateError(error) => handler.on_ice_candidate_error(error),
            Self::IceConnectionChange(state) => handler.on_ice_connection_change(state),
            Self::IceConnectionFailed => handler.on_ice_connection_failed(),
            Self::ConnectionStateChange(state) => handler.on_connection_state_change(state),
            Self::IceGatheringChange(state) => handler.on_ice_gathering_change(state),
            Self::IceComplete => handler.on_ice_complete(),
            Self::RenegotiationNeeded => handler.on_renegotiation_needed(),
            Self::DataChannel(channel) => handler.on_data_channel(channel),
            Self::AddTrack(track) => handler.on_add_track(track),
        }
    }
}

/// Handler that forwards every event into an unbounded channel
pub struct EventChannel {
    tx: mpsc::UnboundedSender<PeerConnectionEvent>,
}

impl EventChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: PeerConnectionEvent) {
        // Receiver dropped means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

impl PeerConnectionHandler for EventChannel {
    fn on_signaling_change(&self, state: SignalingState) {
        self.forward(PeerConnectionEvent::SignalingChange(state));
    }
    fn on_ice_candidate(&self, candidate: IceCandidate) {
        self.forward(PeerConnectionEvent::IceCandidate(candidate));
    }
    fn on_ice_candidate_error(&self, error: IceCandidateErrorEvent) {
        self.forward(PeerConnectionEvent::IceCandidateError(error));
    }
    fn on_ice_connection_change(&self, state: IceConnectionState) {
        self.forward(PeerConnectionEvent::IceConnectionChange(state));
    }
    fn on_ice_connection_failed(&self) {
        self.forward(PeerConnectionEvent::IceConnectionFailed);
    }
    fn on_connection_state_change(&self, state: PeerConnectionState) {
        self.forward(PeerConnectionEvent::ConnectionStateChange(state));
    }
    fn on_ice_gathering_change(&self, state: IceGatheringState) {
        self.forward(PeerConnectionEvent::IceGatheringChange(state));
    }
    fn on_ice_complete(&self) {
        self.forward(PeerConnectionEvent::IceComplete);
    }
    fn on_renegotiation_needed(&self) {
        self.forward(PeerConnectionEvent::RenegotiationNeeded);
    }
    fn on_data_channel(&self, channel: Arc<DataChannel>) {
        self.forward(PeerConnectionEvent::DataChannel(channel));
    }
    fn on_add_track(&self, track: RemoteTrack) {
        self.forward(PeerConnectionEvent::AddTrack(track));
    }
}

// ========== Engine → caller relay ==========

/// Item on a connection's dispatch queue
pub(crate) enum Dispatch {
    Event(PeerConnectionEvent),
    Channel(ChannelTask),
}

/// Engine observer installed on every engine connection
pub(crate) struct EventRelay {
    connection_id: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Dispatch>>>,
    channels: Arc<ChannelRegistry>,
    connection_state: Mutex<PeerConnectionState>,
    accepting_channels: AtomicBool,
}

impl EventRelay {
    pub fn new(
        connection_id: &str,
        channels: Arc<ChannelRegistry>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Dispatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = Arc::new(Self {
            connection_id: connection_id.to_string(),
            tx: Mutex::new(Some(tx)),
            channels,
            connection_state: Mutex::new(PeerConnectionState::New),
            accepting_channels: AtomicBool::new(true),
        });
        (relay, rx)
    }

    /// Last aggregate connection state derived from ICE
    pub fn connection_state(&self) -> PeerConnectionState {
        *self.connection_state.lock()
    }

    /// Stop wrapping incoming data channels (connection closed)
    pub fn stop_accepting_channels(&self) {
        self.accepting_channels.store(false, Ordering::Release);
    }

    /// Close the queue; the dispatcher exits after draining what is queued
    pub fn detach(&self) {
        if self.tx.lock().take().is_some() {
            debug!(connection_id = %self.connection_id, "Event relay detached");
        }
    }

    fn enqueue(&self, event: PeerConnectionEvent) {
        let name = event.name();
        trace!(connection_id = %self.connection_id, event = name, "Queueing event");
        self.push(Dispatch::Event(event), name);
    }

    /// Queue a data channel callback behind the events already queued
    pub fn enqueue_task(&self, task: ChannelTask) {
        self.push(Dispatch::Channel(task), "channel_callback");
    }

    fn push(&self, item: Dispatch, name: &'static str) {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(item).is_err() {
                    debug!(connection_id = %self.connection_id, "Event dispatcher has stopped");
                }
            }
            None => trace!(
                connection_id = %self.connection_id,
                event = name,
                "Dropping event after detach"
            ),
        }
    }
}

impl EngineObserver for EventRelay {
    fn on_signaling_change(&self, state: SignalingState) {
        self.enqueue(PeerConnectionEvent::SignalingChange(state));
    }

    fn on_renegotiation_needed(&self) {
        self.enqueue(PeerConnectionEvent::RenegotiationNeeded);
    }

    fn on_ice_candidate(&self, candidate: IceCandidate) {
        self.enqueue(PeerConnectionEvent::IceCandidate(candidate));
    }

    fn on_ice_candidate_error(&self, error: IceCandidateErrorEvent) {
        warn!(
            connection_id = %self.connection_id,
            url = %error.url,
            code = error.error_code,
            "ICE candidate error: {}",
            error.error_text
        );
        self.enqueue(PeerConnectionEvent::IceCandidateError(error));
    }

    fn on_ice_connection_change(&self, state: IceConnectionState) {
        debug!(connection_id = %self.connection_id, %state, "ICE connection state changed");
        if state.is_failed() {
            warn!(connection_id = %self.connection_id, "ICE connection failed");
            self.enqueue(PeerConnectionEvent::IceConnectionFailed);
        } else {
            self.enqueue(PeerConnectionEvent::IceConnectionChange(state));
        }

        let derived = PeerConnectionState::from(state);
        let changed = {
            let mut current = self.connection_state.lock();
            let changed = *current != derived;
            *current = derived;
            changed
        };
        if changed {
            self.enqueue(PeerConnectionEvent::ConnectionStateChange(derived));
        }
    }

    fn on_ice_gathering_change(&self, state: IceGatheringState) {
        self.enqueue(PeerConnectionEvent::IceGatheringChange(state));
        if state == IceGatheringState::Complete {
            self.enqueue(PeerConnectionEvent::IceComplete);
        }
    }

    fn on_data_channel(&self, channel: Arc<dyn EngineChannel>) {
        let label = channel.label();
        // Register now so no message is lost before the caller sees the channel.
        // The registry refuses once close has drained it.
        let registered = if self.accepting_channels.load(Ordering::Acquire) {
            self.channels.register(channel)
        } else {
            None
        };
        match registered {
            Some(channel) => self.enqueue(PeerConnectionEvent::DataChannel(channel)),
            None => debug!(
                connection_id = %self.connection_id,
                label = %label,
                "Ignoring data channel on closed connection"
            ),
        }
    }

    fn on_add_track(&self, track: RemoteTrack) {
        self.enqueue(PeerConnectionEvent::AddTrack(track));
    }
}

// ========== Dispatcher ==========

/// Where queued events are delivered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventDelivery {
    /// Task on the signaling context
    #[default]
    Task,
    /// Dedicated OS thread; handlers may call blocking APIs
    Thread,
}

pub(crate) struct EventDispatcher {
    handler: Arc<RwLock<Arc<dyn PeerConnectionHandler>>>,
}

impl EventDispatcher {
    pub fn spawn(
        delivery: EventDelivery,
        signaling: &Handle,
        connection_id: &str,
        handler: Arc<dyn PeerConnectionHandler>,
        mut rx: mpsc::UnboundedReceiver<Dispatch>,
    ) -> std::io::Result<Self> {
        let slot = Arc::new(RwLock::new(handler));
        let task_slot = Arc::clone(&slot);
        let connection_id = connection_id.to_string();

        match delivery {
            EventDelivery::Task => {
                signaling.spawn(async move {
                    while let Some(item) = rx.recv().await {
                        dispatch(&task_slot, item);
                    }
                    debug!(connection_id = %connection_id, "Event dispatcher stopped");
                });
            }
            EventDelivery::Thread => {
                thread::Builder::new()
                    .name("rtc-events".to_string())
                    .spawn(move || {
                        while let Some(item) = rx.blocking_recv() {
                            dispatch(&task_slot, item);
                        }
                        debug!(connection_id = %connection_id, "Event dispatcher stopped");
                    })?;
            }
        }

        Ok(Self { handler: slot })
    }

    pub fn set_handler(&self, handler: Arc<dyn PeerConnectionHandler>) {
        *self.handler.write() = handler;
    }
}

fn dispatch(slot: &RwLock<Arc<dyn PeerConnectionHandler>>, item: Dispatch) {
    match item {
        Dispatch::Event(event) => {
            let handler = Arc::clone(&*slot.read());
            trace!(event = event.name(), "Delivering event");
            event.deliver(handler.as_ref());
        }
        Dispatch::Channel(task) => task(),
    }
}
