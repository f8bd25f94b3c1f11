//! Negotiation coordinator
//!
//! Bridges the engine's completion callbacks into plain `async fn` results
//! and serializes every signaling mutation behind one negotiation lock:
//!
//! - CreateOffer/CreateAnswer hold the lock for the whole round trip, so at
//!   most one is in flight per connection. A second caller waits for the
//!   lock and then runs its own request.
//! - SetLocal/SetRemoteDescription validate the transition, dispatch, wait,
//!   and only then commit the new state.
//! - Each request gets a fresh completion slot stamped with a generation.
//!   Timing out bumps the generation so a late engine completion is dropped.
//! - A SetDescription that times out may still be applied by the engine
//!   later. Until the next description commits, the coordinator adopts the
//!   engine's own signaling state before every request.
//!
//! The committed signaling state is mirrored into a snapshot that readers
//! can load without touching the negotiation lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::config::{MediaConstraints, NegotiationOptions};
use crate::engine::{Completion, CompletionResult, EngineConnection};
use crate::sdp::{SdpType, SessionDescription};
use crate::signaling::{DescriptionSource, SignalingState, SignalingStateMachine};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescriptionRequest {
    Offer,
    Answer,
}

impl DescriptionRequest {
    fn operation(&self) -> &'static str {
        match self {
            DescriptionRequest::Offer => "create_offer",
            DescriptionRequest::Answer => "create_answer",
        }
    }
}

pub struct NegotiationCoordinator {
    connection_id: String,
    engine: Arc<dyn EngineConnection>,
    options: NegotiationOptions,
    constraints: RwLock<MediaConstraints>,
    machine: Mutex<SignalingStateMachine>,
    snapshot: RwLock<SignalingState>,
    generation: Arc<AtomicU64>,
    /// A timed-out SetDescription may still land in the engine
    unsettled: AtomicBool,
}

/// Exclusive hold on the negotiation lock
pub(crate) struct NegotiationGuard<'a> {
    machine: MutexGuard<'a, SignalingStateMachine>,
}

impl NegotiationGuard<'_> {
    pub fn state(&self) -> SignalingState {
        self.machine.state()
    }
}

impl NegotiationCoordinator {
    pub fn new(
        connection_id: &str,
        engine: Arc<dyn EngineConnection>,
        options: NegotiationOptions,
        constraints: MediaConstraints,
    ) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            engine,
            options,
            constraints: RwLock::new(constraints),
            machine: Mutex::new(SignalingStateMachine::new()),
            snapshot: RwLock::new(SignalingState::Stable),
            generation: Arc::new(AtomicU64::new(0)),
            unsettled: AtomicBool::new(false),
        }
    }

    /// Committed signaling state; never waits on the negotiation lock
    pub fn signaling_state(&self) -> SignalingState {
        let state = *self.snapshot.read();
        if state != SignalingState::Closed && self.unsettled.load(Ordering::Acquire) {
            return self.engine.signaling_state();
        }
        state
    }

    pub fn options(&self) -> &NegotiationOptions {
        &self.options
    }

    /// Constraints used for subsequent offers/answers
    pub fn set_constraints(&self, constraints: MediaConstraints) {
        *self.constraints.write() = constraints;
    }

    /// Current completion generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Take the negotiation lock for a non-SDP mutation (e.g. reconfiguration)
    pub(crate) async fn lock(&self) -> NegotiationGuard<'_> {
        let mut machine = self.machine.lock().await;
        self.reconcile(&mut machine);
        NegotiationGuard { machine }
    }

    #[instrument(skip(self), fields(connection_id = %self.connection_id))]
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.create_description(DescriptionRequest::Offer).await
    }

    #[instrument(skip(self), fields(connection_id = %self.connection_id))]
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        self.create_description(DescriptionRequest::Answer).await
    }

    async fn create_description(&self, request: DescriptionRequest) -> Result<SessionDescription> {
        let operation = request.operation();
        let mut machine = self.machine.lock().await;
        self.reconcile(&mut machine);
        match request {
            DescriptionRequest::Offer => machine.check_create_offer()?,
            DescriptionRequest::Answer => machine.check_create_answer()?,
        }

        let (completion, rx) = self.next_completion(operation);
        let generation = completion.generation();
        debug!(operation, generation, "Dispatching to engine");

        let constraints = self.constraints.read().clone();
        match request {
            DescriptionRequest::Offer => self.engine.create_offer(completion, &constraints),
            DescriptionRequest::Answer => self.engine.create_answer(completion, &constraints),
        }

        let description = self
            .await_completion(operation, rx, Some(self.options.sdp_timeout()))
            .await?;

        let expected = match request {
            DescriptionRequest::Offer => description.sdp_type() == SdpType::Offer,
            DescriptionRequest::Answer => description.sdp_type().is_answer(),
        };
        if !expected {
            return Err(Error::NegotiationFailed(format!(
                "{operation} produced a description of type {}",
                description.sdp_type()
            )));
        }

        info!(operation, generation, "Description created");
        drop(machine);
        Ok(description)
    }

    #[instrument(skip(self, description), fields(connection_id = %self.connection_id, sdp_type = %description.sdp_type()))]
    pub async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<SignalingState> {
        self.set_description(DescriptionSource::Local, description)
            .await
    }

    #[instrument(skip(self, description), fields(connection_id = %self.connection_id, sdp_type = %description.sdp_type()))]
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<SignalingState> {
        self.set_description(DescriptionSource::Remote, description)
            .await
    }

    async fn set_description(
        &self,
        source: DescriptionSource,
        description: SessionDescription,
    ) -> Result<SignalingState> {
        let operation = match source {
            DescriptionSource::Local => "set_local_description",
            DescriptionSource::Remote => "set_remote_description",
        };

        let mut machine = self.machine.lock().await;
        self.reconcile(&mut machine);
        let sdp_type = description.sdp_type();
        let next = machine.next_state(source, sdp_type)?;

        let (completion, rx) = self.next_completion(operation);
        debug!(operation, generation = completion.generation(), %next, "Dispatching to engine");
        match source {
            DescriptionSource::Local => self.engine.set_local_description(completion, description),
            DescriptionSource::Remote => {
                self.engine.set_remote_description(completion, description)
            }
        }

        let outcome = self
            .await_completion(operation, rx, self.options.set_description_timeout())
            .await;
        if let Err(Error::NegotiationTimeout { .. }) = &outcome {
            self.unsettled.store(true, Ordering::Release);
            self.reconcile(&mut machine);
        }
        outcome?;

        let committed = machine.apply(source, sdp_type)?;
        self.unsettled.store(false, Ordering::Release);
        *self.snapshot.write() = committed;
        info!(operation, state = %committed, "Signaling state committed");
        Ok(committed)
    }

    /// Move to Closed. Returns `false` when already closed.
    ///
    /// Waits for any in-flight request to finish; callers close the engine
    /// first so pending requests fail fast.
    pub async fn close(&self) -> bool {
        let mut machine = self.machine.lock().await;
        // Invalidate any completion that is still outstanding
        self.generation.fetch_add(1, Ordering::AcqRel);
        let changed = machine.close();
        *self.snapshot.write() = SignalingState::Closed;
        if changed {
            info!(connection_id = %self.connection_id, "Signaling state closed");
        }
        changed
    }

    /// Adopt the engine's signaling state after a timed-out SetDescription
    fn reconcile(&self, machine: &mut SignalingStateMachine) {
        if !self.unsettled.load(Ordering::Acquire) {
            return;
        }
        let engine_state = self.engine.signaling_state();
        if machine.resync(engine_state) {
            *self.snapshot.write() = machine.state();
            info!(
                connection_id = %self.connection_id,
                state = %engine_state,
                "Signaling state resynchronized with engine"
            );
        }
    }

    fn next_completion<T>(
        &self,
        operation: &'static str,
    ) -> (Completion<T>, oneshot::Receiver<CompletionResult<T>>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        Completion::new(operation, generation, Arc::clone(&self.generation))
    }

    async fn await_completion<T>(
        &self,
        operation: &'static str,
        rx: oneshot::Receiver<CompletionResult<T>>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let outcome = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Retire the slot so a late completion cannot leak into the next request
                    let retired = self.generation.fetch_add(1, Ordering::AcqRel);
                    warn!(operation, generation = retired, ?timeout, "Engine did not complete in time");
                    return Err(Error::NegotiationTimeout { operation, timeout });
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => {
                warn!(operation, %reason, "Engine reported failure");
                Err(Error::NegotiationFailed(format!("{operation}: {reason}")))
            }
            Err(_) => Err(Error::NegotiationFailed(format!(
                "{operation}: engine dropped the request"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DataChannelInit;
    use crate::config::Configuration;
    use crate::engine::{
        ConfigurationError, EngineChannel, EngineError, EngineRtpSender, SdpCompletion,
        SetDescriptionCompletion,
    };
    use crate::ice::ParsedIceCandidate;
    use crate::media::MediaStreamTrack;
    use crate::sdp::SdpDocument;
    use crate::state::{IceConnectionState, IceGatheringState};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    fn description(sdp_type: SdpType) -> SessionDescription {
        SessionDescription::new(sdp_type, SdpDocument::parse(OFFER).unwrap())
    }

    /// Engine that parks every request until the test resolves it
    #[derive(Default)]
    struct ScriptedEngine {
        sdp: SyncMutex<Vec<SdpCompletion>>,
        set: SyncMutex<Vec<SetDescriptionCompletion>>,
        state: SyncMutex<SignalingState>,
    }

    #[async_trait]
    impl EngineConnection for ScriptedEngine {
        fn create_offer(&self, completion: SdpCompletion, _: &MediaConstraints) {
            self.sdp.lock().push(completion);
        }
        fn create_answer(&self, completion: SdpCompletion, _: &MediaConstraints) {
            self.sdp.lock().push(completion);
        }
        fn set_local_description(&self, completion: SetDescriptionCompletion, _: SessionDescription) {
            self.set.lock().push(completion);
        }
        fn set_remote_description(&self, completion: SetDescriptionCompletion, _: SessionDescription) {
            self.set.lock().push(completion);
        }
        async fn local_description(&self) -> Option<SessionDescription> {
            None
        }
        async fn remote_description(&self) -> Option<SessionDescription> {
            None
        }
        async fn add_ice_candidate(&self, _: &ParsedIceCandidate) -> bool {
            false
        }
        async fn set_configuration(
            &self,
            _: &Configuration,
        ) -> std::result::Result<(), ConfigurationError> {
            Ok(())
        }
        async fn create_data_channel(
            &self,
            _: &str,
            _: &DataChannelInit,
        ) -> Option<Arc<dyn EngineChannel>> {
            None
        }
        async fn add_track(
            &self,
            _: Arc<dyn MediaStreamTrack>,
            _: &[String],
        ) -> std::result::Result<Arc<dyn EngineRtpSender>, EngineError> {
            Err(EngineError::new("unsupported"))
        }
        async fn remove_track(&self, _: &Arc<dyn EngineRtpSender>) -> bool {
            false
        }
        async fn close(&self) {}
        fn signaling_state(&self) -> SignalingState {
            *self.state.lock()
        }
        fn ice_connection_state(&self) -> IceConnectionState {
            IceConnectionState::New
        }
        fn ice_gathering_state(&self) -> IceGatheringState {
            IceGatheringState::New
        }
    }

    fn coordinator(engine: Arc<ScriptedEngine>, sdp_timeout_ms: u64) -> Arc<NegotiationCoordinator> {
        let options = NegotiationOptions {
            sdp_timeout_ms,
            set_description_timeout_ms: Some(sdp_timeout_ms),
        };
        Arc::new(NegotiationCoordinator::new(
            "pc-test",
            engine,
            options,
            MediaConstraints::default(),
        ))
    }

    async fn next_sdp(engine: &ScriptedEngine) -> SdpCompletion {
        loop {
            if let Some(c) = engine.sdp.lock().pop() {
                return c;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn next_set(engine: &ScriptedEngine) -> SetDescriptionCompletion {
        loop {
            if let Some(c) = engine.set.lock().pop() {
                return c;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_create_offer_success() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(Arc::clone(&engine), 1000);

        let task = tokio::spawn({
            let coord = Arc::clone(&coord);
            async move { coord.create_offer().await }
        });
        next_sdp(&engine).await.succeed(description(SdpType::Offer));

        let offer = task.await.unwrap().unwrap();
        assert_eq!(offer.sdp_type(), SdpType::Offer);
        // Creating an offer does not change signaling state
        assert_eq!(coord.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_engine_failure_is_not_a_timeout() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(Arc::clone(&engine), 1000);

        let task = tokio::spawn({
            let coord = Arc::clone(&coord);
            async move { coord.create_offer().await }
        });
        next_sdp(&engine).await.fail("no transports");

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::NegotiationFailed(ref m) if m.contains("no transports")));
    }

    #[tokio::test]
    async fn test_timeout_then_late_completion_is_dropped() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(Arc::clone(&engine), 50);

        let err = coord.create_offer().await.unwrap_err();
        assert!(matches!(err, Error::NegotiationTimeout { operation: "create_offer", .. }));
        let stale = next_sdp(&engine).await;
        assert!(!stale.is_current());

        let task = tokio::spawn({
            let coord = Arc::clone(&coord);
            async move { coord.create_offer().await }
        });
        let fresh = next_sdp(&engine).await;

        // The late completion arrives first and must not satisfy the new request
        stale.succeed(description(SdpType::Answer));
        fresh.succeed(description(SdpType::Offer));

        let offer = task.await.unwrap().unwrap();
        assert_eq!(offer.sdp_type(), SdpType::Offer);
    }

    #[tokio::test]
    async fn test_wrong_description_type_is_rejected() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(Arc::clone(&engine), 1000);

        let task = tokio::spawn({
            let coord = Arc::clone(&coord);
            async move { coord.create_offer().await }
        });
        next_sdp(&engine).await.succeed(description(SdpType::Answer));
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::NegotiationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_create_answer_needs_remote_offer() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(Arc::clone(&engine), 1000);

        let err = coord.create_answer().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { state: SignalingState::Stable, .. }));
        assert!(engine.sdp.lock().is_empty());
    }

    #[tokio::test]
    async fn test_set_description_commits_after_engine_success() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(Arc::clone(&engine), 1000);

        let task = tokio::spawn({
            let coord = Arc::clone(&coord);
            async move { coord.set_local_description(description(SdpType::Offer)).await }
        });
        let completion = next_set(&engine).await;
        assert_eq!(coord.signaling_state(), SignalingState::Stable);
        completion.succeed(());

        assert_eq!(task.await.unwrap().unwrap(), SignalingState::HaveLocalOffer);
        assert_eq!(coord.signaling_state(), SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_set_description_failure_leaves_state() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(Arc::clone(&engine), 1000);

        let task = tokio::spawn({
            let coord = Arc::clone(&coord);
            async move { coord.set_remote_description(description(SdpType::Offer)).await }
        });
        next_set(&engine).await.fail("bad fingerprint");
        assert!(task.await.unwrap().is_err());
        assert_eq!(coord.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_set_description_timeout_adopts_engine_state() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(Arc::clone(&engine), 50);

        let err = coord
            .set_local_description(description(SdpType::Offer))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NegotiationTimeout { operation: "set_local_description", .. }
        ));
        assert_eq!(coord.signaling_state(), SignalingState::Stable);

        // The engine applies the offer after the caller gave up
        let _late = next_set(&engine).await;
        *engine.state.lock() = SignalingState::HaveLocalOffer;
        assert_eq!(coord.signaling_state(), SignalingState::HaveLocalOffer);

        let task = tokio::spawn({
            let coord = Arc::clone(&coord);
            async move { coord.set_remote_description(description(SdpType::Answer)).await }
        });
        let completion = next_set(&engine).await;
        *engine.state.lock() = SignalingState::Stable;
        completion.succeed(());

        assert_eq!(task.await.unwrap().unwrap(), SignalingState::Stable);
        assert_eq!(coord.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_invalid_transition_never_reaches_engine() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(Arc::clone(&engine), 1000);

        let err = coord
            .set_remote_description(description(SdpType::Answer))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert!(engine.set.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_negotiation() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(Arc::clone(&engine), 1000);

        assert!(coord.close().await);
        assert!(!coord.close().await);
        assert_eq!(coord.signaling_state(), SignalingState::Closed);
        assert!(matches!(
            coord.create_offer().await,
            Err(Error::InvalidState { state: SignalingState::Closed, .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_excludes_negotiation() {
        let engine = Arc::new(ScriptedEngine::default());
        let coord = coordinator(Arc::clone(&engine), 1000);
        let guard = coord.lock().await;
        assert_eq!(guard.state(), SignalingState::Stable);

        let task = tokio::spawn({
            let coord = Arc::clone(&coord);
            async move { coord.create_offer().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.sdp.lock().is_empty());

        drop(guard);
        next_sdp(&engine).await.succeed(description(SdpType::Offer));
        assert!(task.await.unwrap().is_ok());
    }
}
