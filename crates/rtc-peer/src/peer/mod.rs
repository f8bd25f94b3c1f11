//! Peer connection aggregate
//!
//! A [`PeerConnection`] owns the negotiation coordinator, the data channel
//! and RTP sender registries, the installed configuration and the engine
//! connection itself. It is built with a [`PeerConnectionBuilder`].

mod builder;
mod connection;

pub use builder::PeerConnectionBuilder;
pub use connection::PeerConnection;
