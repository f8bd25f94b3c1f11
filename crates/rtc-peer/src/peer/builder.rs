//! Peer connection construction

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::PeerConnection;
use crate::channel::ChannelRegistry;
use crate::config::{Configuration, MediaConstraints, NegotiationOptions};
use crate::engine::{AudioModule, EngineContexts, EngineObserver, MediaEngine};
use crate::events::{EventDelivery, EventDispatcher, EventRelay, NoopHandler, PeerConnectionHandler};
use crate::negotiation::NegotiationCoordinator;
use crate::{Error, Result};

/// Builder for [`PeerConnection`]
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use rtc_peer::{Configuration, LoopbackEngine, NoopHandler, PeerConnectionBuilder};
///
/// # async fn example() -> rtc_peer::Result<()> {
/// let engine = LoopbackEngine::new();
/// let pc = PeerConnectionBuilder::new(Configuration::with_stun("stun:stun.l.google.com:19302"))
///     .with_handler(Arc::new(NoopHandler))
///     .build(&engine)
///     .await?;
/// let offer = pc.create_offer().await?;
/// pc.set_local_description(offer).await?;
/// # Ok(())
/// # }
/// ```
pub struct PeerConnectionBuilder {
    configuration: Configuration,
    options: NegotiationOptions,
    constraints: MediaConstraints,
    handler: Arc<dyn PeerConnectionHandler>,
    delivery: EventDelivery,
    audio: AudioModule,
    contexts: Option<EngineContexts>,
}

impl PeerConnectionBuilder {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            options: NegotiationOptions::default(),
            constraints: MediaConstraints::default(),
            handler: Arc::new(NoopHandler),
            delivery: EventDelivery::default(),
            audio: AudioModule::default(),
            contexts: None,
        }
    }

    /// Timeouts for negotiation calls
    pub fn with_options(mut self, options: NegotiationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn PeerConnectionHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_event_delivery(mut self, delivery: EventDelivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_audio_module(mut self, audio: AudioModule) -> Self {
        self.audio = audio;
        self
    }

    /// Run the engine on explicit contexts instead of the ambient runtime
    pub fn with_contexts(mut self, contexts: EngineContexts) -> Self {
        self.contexts = Some(contexts);
        self
    }

    /// Create the factory and the engine connection.
    ///
    /// # Errors
    ///
    /// - [`Error::Factory`] if no engine runtime is available or the factory
    ///   cannot be constructed
    /// - [`Error::ConnectionCreate`] if the configuration is invalid or the
    ///   engine rejects it
    #[instrument(skip_all, fields(engine = engine.name()))]
    pub async fn build(self, engine: &dyn MediaEngine) -> Result<PeerConnection> {
        self.configuration
            .validate()
            .map_err(|e| Error::ConnectionCreate(e.to_string()))?;
        self.options.validate()?;

        let contexts = match self.contexts {
            Some(contexts) => contexts,
            None => EngineContexts::current()?,
        };

        let factory = engine
            .create_factory(&contexts, self.audio)
            .await
            .map_err(|e| Error::Factory(e.to_string()))?;

        let connection_id = Uuid::new_v4().to_string();
        let channels = Arc::new(ChannelRegistry::new());
        let (relay, events) = EventRelay::new(&connection_id, Arc::clone(&channels));
        if self.delivery == EventDelivery::Thread {
            channels.queue_callbacks_on(Arc::downgrade(&relay));
        }

        let observer: Arc<dyn EngineObserver> = relay.clone();
        let connection = factory
            .create_peer_connection(&self.configuration, &self.constraints, observer)
            .await
            .map_err(|e| {
                warn!(connection_id = %connection_id, error = %e, "Engine rejected connection");
                Error::ConnectionCreate(e.to_string())
            })?;

        let dispatcher = match EventDispatcher::spawn(
            self.delivery,
            contexts.signaling(),
            &connection_id,
            self.handler,
            events,
        ) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                connection.close().await;
                return Err(Error::Factory(format!("failed to start event dispatcher: {e}")));
            }
        };
        debug!(connection_id = %connection_id, delivery = ?self.delivery, "Event dispatcher started");

        let coordinator = NegotiationCoordinator::new(
            &connection_id,
            Arc::clone(&connection),
            self.options,
            self.constraints,
        );

        info!(connection_id = %connection_id, "Peer connection created");
        Ok(PeerConnection::assemble(
            connection_id,
            self.configuration,
            coordinator,
            channels,
            relay,
            dispatcher,
            connection,
            factory,
        ))
    }
}
