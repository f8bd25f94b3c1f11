//! Peer-connection test harness
//!
//! Helpers shared by the integration tests:
//! - logging setup that tolerates repeated initialization
//! - peers on the loopback engine with their event stream attached
//! - a full offer/answer exchange with candidate trickling
//! - event waiting with a bounded timeout

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rtc_peer::{
    Configuration, EventChannel, LoopbackEngine, PeerConnection, PeerConnectionBuilder,
    PeerConnectionEvent,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Default wait for a single event
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Connection plus the events its handler received
pub struct TestPeer {
    pub pc: Arc<PeerConnection>,
    pub events: mpsc::UnboundedReceiver<PeerConnectionEvent>,
}

impl TestPeer {
    pub async fn new(engine: &LoopbackEngine) -> Self {
        Self::with_builder(engine, PeerConnection::builder(Configuration::default())).await
    }

    pub async fn with_builder(engine: &LoopbackEngine, builder: PeerConnectionBuilder) -> Self {
        let (handler, events) = EventChannel::new();
        let pc = builder
            .with_handler(handler)
            .build(engine)
            .await
            .expect("Failed to create peer connection");
        Self {
            pc: Arc::new(pc),
            events,
        }
    }

    /// Wait for the first event matching `predicate`, skipping the rest
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<PeerConnectionEvent>
    where
        F: FnMut(&PeerConnectionEvent) -> bool,
    {
        timeout(EVENT_TIMEOUT, async {
            while let Some(event) = self.events.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Everything queued so far, without waiting
    pub fn drain(&mut self) -> Vec<PeerConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Run the offer/answer exchange from `offerer` to `answerer`
pub async fn negotiate(offerer: &TestPeer, answerer: &TestPeer) -> rtc_peer::Result<()> {
    let offer = offerer.pc.create_offer().await?;
    offerer.pc.set_local_description(offer.clone()).await?;
    answerer.pc.set_remote_description(offer).await?;

    let answer = answerer.pc.create_answer().await?;
    answerer.pc.set_local_description(answer.clone()).await?;
    offerer.pc.set_remote_description(answer).await?;
    Ok(())
}

/// Forward locally gathered candidates from `from` to `to`; returns how many
pub async fn trickle(from: &mut TestPeer, to: &TestPeer) -> usize {
    let mut forwarded = 0;
    for event in from.drain() {
        if let PeerConnectionEvent::IceCandidate(candidate) = event {
            to.pc
                .add_ice_candidate(&candidate)
                .await
                .expect("Candidate rejected");
            forwarded += 1;
        }
    }
    forwarded
}

/// Poll `condition` until it holds or the event timeout passes
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
