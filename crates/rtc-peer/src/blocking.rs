//! Blocking facade
//!
//! For callers that have no async runtime of their own. [`initialize`]
//! starts the engine's execution contexts on a dedicated runtime; every
//! [`BlockingPeerConnection`] call parks the calling thread until the engine
//! answers or the operation times out.
//!
//! Events and data channel callbacks are delivered on a dedicated
//! `rtc-events` thread, so handlers may call back into the blocking API.
//! Calls made from inside an async task fail with [`Error::Internal`]
//! instead of blocking a runtime worker.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtc_peer::blocking;
//! use rtc_peer::{Configuration, LoopbackEngine, NoopHandler, Verbosity};
//!
//! # fn main() -> rtc_peer::Result<()> {
//! let context = blocking::initialize(Verbosity::Warn)?;
//! let engine = LoopbackEngine::new();
//! let pc = context.create_peer_connection(&engine, Configuration::default(), Arc::new(NoopHandler))?;
//! let offer = pc.create_offer()?;
//! pc.set_local_description(offer)?;
//! pc.close();
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};

use crate::channel::{DataChannel, DataChannelInit};
use crate::config::Configuration;
use crate::engine::{EngineContexts, MediaEngine};
use crate::events::{EventDelivery, PeerConnectionHandler};
use crate::ice::IceCandidate;
use crate::logging::{init_logging, Verbosity};
use crate::media::{MediaStreamTrack, RtpSender};
use crate::peer::{PeerConnection, PeerConnectionBuilder};
use crate::sdp::SessionDescription;
use crate::signaling::SignalingState;
use crate::state::{IceConnectionState, IceGatheringState, PeerConnectionState};
use crate::{Error, Result};

const ENGINE_THREADS: usize = 2;

/// Park the calling thread on `future`, refusing from inside a runtime
fn block_on<F, T>(runtime: &Runtime, operation: &'static str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if Handle::try_current().is_ok() {
        warn!(operation, "Blocking call made from inside an async runtime");
        return Err(Error::Internal(format!(
            "{operation} would block an async runtime; use the async PeerConnection"
        )));
    }
    runtime.block_on(future)
}

/// Start logging and the engine execution contexts.
///
/// # Errors
///
/// Returns [`Error::Factory`] if the engine threads cannot be started.
pub fn initialize(verbosity: Verbosity) -> Result<BlockingContext> {
    init_logging(verbosity);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(ENGINE_THREADS)
        .thread_name("rtc-signaling")
        .enable_all()
        .build()
        .map_err(|e| Error::Factory(format!("failed to start engine threads: {e}")))?;

    info!(threads = ENGINE_THREADS, ?verbosity, "Engine contexts started");
    Ok(BlockingContext {
        runtime: Arc::new(runtime),
    })
}

/// Engine execution contexts shared by blocking connections
pub struct BlockingContext {
    runtime: Arc<Runtime>,
}

impl BlockingContext {
    pub fn contexts(&self) -> EngineContexts {
        let handle = self.runtime.handle().clone();
        EngineContexts::new(handle.clone(), handle)
    }

    /// Create a connection with default options
    pub fn create_peer_connection(
        &self,
        engine: &dyn MediaEngine,
        configuration: Configuration,
        handler: Arc<dyn PeerConnectionHandler>,
    ) -> Result<BlockingPeerConnection> {
        self.build(
            engine,
            PeerConnectionBuilder::new(configuration).with_handler(handler),
        )
    }

    /// Create a connection from a prepared builder.
    ///
    /// The builder's contexts and event delivery are overridden.
    pub fn build(
        &self,
        engine: &dyn MediaEngine,
        builder: PeerConnectionBuilder,
    ) -> Result<BlockingPeerConnection> {
        let builder = builder
            .with_contexts(self.contexts())
            .with_event_delivery(EventDelivery::Thread);
        let inner = block_on(&self.runtime, "create_peer_connection", builder.build(engine))?;
        Ok(BlockingPeerConnection {
            inner,
            runtime: Arc::clone(&self.runtime),
        })
    }
}

/// [`PeerConnection`] whose every operation blocks the calling thread
pub struct BlockingPeerConnection {
    inner: PeerConnection,
    /// Dropped after `inner`
    runtime: Arc<Runtime>,
}

impl BlockingPeerConnection {
    fn block_on<F, T>(&self, operation: &'static str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        block_on(&self.runtime, operation, future)
    }

    /// Async handle underneath
    pub fn inner(&self) -> &PeerConnection {
        &self.inner
    }

    pub fn connection_id(&self) -> &str {
        self.inner.connection_id()
    }

    pub fn set_handler(&self, handler: Arc<dyn PeerConnectionHandler>) {
        self.inner.set_handler(handler);
    }

    pub fn create_offer(&self) -> Result<SessionDescription> {
        self.block_on("create_offer", self.inner.create_offer())
    }

    pub fn create_answer(&self) -> Result<SessionDescription> {
        self.block_on("create_answer", self.inner.create_answer())
    }

    pub fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.block_on(
            "set_local_description",
            self.inner.set_local_description(description),
        )
    }

    pub fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.block_on(
            "set_remote_description",
            self.inner.set_remote_description(description),
        )
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.block_on("local_description", async { Ok(self.inner.local_description().await) })
            .ok()
            .flatten()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.block_on("remote_description", async { Ok(self.inner.remote_description().await) })
            .ok()
            .flatten()
    }

    pub fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.block_on("add_ice_candidate", self.inner.add_ice_candidate(candidate))
    }

    pub fn configuration(&self) -> Configuration {
        self.inner.configuration()
    }

    pub fn set_configuration(&self, configuration: Configuration) -> Result<()> {
        self.block_on(
            "set_configuration",
            self.inner.set_configuration(configuration),
        )
    }

    pub fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<DataChannel>> {
        self.block_on(
            "create_data_channel",
            self.inner.create_data_channel(label, init),
        )
    }

    pub fn delete_data_channel(&self, channel: &DataChannel) -> bool {
        self.block_on("delete_data_channel", async {
            Ok(self.inner.delete_data_channel(channel).await)
        })
        .unwrap_or(false)
    }

    pub fn data_channels(&self) -> Vec<Arc<DataChannel>> {
        self.inner.data_channels()
    }

    /// Send a binary message on one of this connection's channels
    pub fn send(&self, channel: &DataChannel, data: impl Into<Bytes>) -> Result<()> {
        self.block_on("send", channel.send(data))
    }

    pub fn send_text(&self, channel: &DataChannel, text: &str) -> Result<()> {
        self.block_on("send_text", channel.send_text(text))
    }

    pub fn add_track(
        &self,
        track: Arc<dyn MediaStreamTrack>,
        stream_ids: &[String],
    ) -> Result<RtpSender> {
        self.block_on("add_track", self.inner.add_track(track, stream_ids))
    }

    pub fn remove_track(&self, sender: &RtpSender) -> Result<()> {
        self.block_on("remove_track", self.inner.remove_track(sender))
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.inner.signaling_state()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.inner.ice_connection_state()
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        self.inner.ice_gathering_state()
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.inner.connection_state()
    }

    /// Close the connection. Idempotent.
    ///
    /// Inside an async runtime the close runs on a helper thread, so it is
    /// never skipped.
    pub fn close(&self) {
        if Handle::try_current().is_err() {
            self.runtime.block_on(self.inner.close());
            return;
        }
        thread::scope(|scope| {
            scope.spawn(|| self.runtime.block_on(self.inner.close()));
        });
    }
}

impl Drop for BlockingPeerConnection {
    fn drop(&mut self) {
        // Inside a runtime the async handle finishes teardown on its own
        if self.inner.is_closed() || Handle::try_current().is_ok() {
            return;
        }
        debug!(connection_id = %self.inner.connection_id(), "Closing on drop");
        self.runtime.block_on(self.inner.close());
    }
}
