//! WebRTC peer connection core
//!
//! This crate drives a media engine through the offer/answer exchange and
//! exposes the result as a plain Rust API with strong types for every
//! interchange value.
//!
//! # Features
//!
//! - **Signaling state machine**: Stable/HaveLocalOffer/HaveRemoteOffer/
//!   pranswer/Closed transitions, validated before the engine is touched
//! - **Negotiation coordinator**: one offer/answer in flight per connection,
//!   engine callbacks bridged into `async fn` results with timeouts
//! - **SDP codec**: strict parser and byte-stable serializer
//! - **ICE candidates**: JSON interchange and structured candidate parsing
//! - **Data channels**: registry-owned channels with message, state and
//!   buffered-amount callbacks
//! - **Blocking facade**: sequential calls for callers without a runtime
//! - **Loopback engine**: in-process engine for tests and demos
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Caller (async, or blocking via blocking::initialize)     │
//! │  ↓                                                         │
//! │  PeerConnection                                           │
//! │  ├─ NegotiationCoordinator (negotiation lock, timeouts)  │
//! │  │   └─ SignalingStateMachine                            │
//! │  ├─ ChannelRegistry (DataChannel observers)              │
//! │  ├─ RtpSender registry                                    │
//! │  └─ EventRelay ──► EventDispatcher ──► PeerConnectionHandler
//! │     ↓                                                      │
//! │  MediaEngine / EngineFactory / EngineConnection           │
//! │  (loopback, or webrtc-rs with `webrtc-engine`)            │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use rtc_peer::{Configuration, IceServer};
//!
//! let config = Configuration::default()
//!     .with_ice_server(IceServer::parse("stun:stun.l.google.com:19302").unwrap());
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtc_peer::{Configuration, DataChannelInit, LoopbackEngine, NoopHandler, PeerConnection};
//!
//! # async fn example() -> rtc_peer::Result<()> {
//! let engine = LoopbackEngine::new();
//! let pc = PeerConnection::create(&engine, Configuration::default(), Arc::new(NoopHandler)).await?;
//! let channel = pc.create_data_channel("chat", DataChannelInit::default()).await?;
//! let offer = pc.create_offer().await?;
//! pc.set_local_description(offer.clone()).await?;
//! println!("{}", offer.to_json()?);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod blocking;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ice;
pub mod logging;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod sdp;
pub mod signaling;
pub mod state;

pub use channel::{DataChannel, DataChannelInit, DataChannelState, DataChannelStats};
pub use config::{
    BundlePolicy, Configuration, IceServer, IceTransportPolicy, MediaConstraints,
    NegotiationOptions, RtcpMuxPolicy,
};
pub use engine::{AudioModule, DataBuffer, EngineContexts, LoopbackEngine, MediaEngine};
pub use error::{ConfigurationErrorKind, Error, Result, SdpParseError};
pub use events::{
    EventChannel, EventDelivery, IceCandidateErrorEvent, NoopHandler, PeerConnectionEvent,
    PeerConnectionHandler,
};
pub use ice::{CandidateDescriptor, IceCandidate};
pub use logging::{init_logging, Verbosity};
pub use media::{LocalTrack, MediaStreamTrack, RemoteTrack, RtpSender, TrackKind};
pub use negotiation::NegotiationCoordinator;
pub use peer::{PeerConnection, PeerConnectionBuilder};
pub use sdp::{SdpDocument, SdpType, SessionDescription};
pub use signaling::{SignalingState, SignalingStateMachine};
pub use state::{IceConnectionState, IceGatheringState, PeerConnectionState};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
