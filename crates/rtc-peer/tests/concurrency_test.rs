//! Concurrency tests for the negotiation lock and engine completions
//!
//! Covers mutual exclusion of offer/answer requests, timeouts that leave
//! the connection usable, late completions that must not leak into the
//! next request, and events flowing while a negotiation is blocked.

mod harness;

use std::sync::Arc;
use std::time::{Duration, Instant};

use harness::{eventually, init_logging, TestPeer};
use rtc_peer::{
    Configuration, Error, LocalTrack, LoopbackEngine, NegotiationOptions, PeerConnection,
    PeerConnectionEvent, SdpType, SignalingState,
};

fn short_timeout() -> NegotiationOptions {
    NegotiationOptions::default().with_sdp_timeout(Duration::from_millis(150))
}

async fn peer_with_options(engine: &LoopbackEngine, options: NegotiationOptions) -> TestPeer {
    TestPeer::with_builder(
        engine,
        PeerConnection::builder(Configuration::default()).with_options(options),
    )
    .await
}

#[tokio::test]
async fn test_concurrent_offers_are_serialized() {
    init_logging();

    let engine = LoopbackEngine::new();
    engine.set_negotiation_delay(Duration::from_millis(100));
    let alice = TestPeer::new(&engine).await;

    let started = Instant::now();
    let first = {
        let pc = Arc::clone(&alice.pc);
        tokio::spawn(async move { pc.create_offer().await })
    };
    let second = {
        let pc = Arc::clone(&alice.pc);
        tokio::spawn(async move { pc.create_offer().await })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.sdp_type(), SdpType::Offer);
    assert_eq!(second.sdp_type(), SdpType::Offer);

    // One request in flight at a time
    assert!(
        started.elapsed() >= Duration::from_millis(200),
        "offers overlapped: {:?}",
        started.elapsed()
    );

    // Each request got its own offer
    assert_ne!(
        first.document().origin.session_version,
        second.document().origin.session_version
    );
}

#[tokio::test]
async fn test_timeout_leaves_connection_usable() {
    init_logging();

    let engine = LoopbackEngine::new();
    engine.stall_negotiation(true);
    let alice = peer_with_options(&engine, short_timeout()).await;

    let started = Instant::now();
    let result = alice.pc.create_offer().await;
    match result {
        Err(Error::NegotiationTimeout { operation, timeout }) => {
            assert_eq!(operation, "create_offer");
            assert_eq!(timeout, Duration::from_millis(150));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(alice.pc.signaling_state(), SignalingState::Stable);

    // The timed-out request released the negotiation lock
    let retry = tokio::time::timeout(Duration::from_secs(1), alice.pc.create_offer()).await;
    assert!(matches!(retry, Ok(Err(Error::NegotiationTimeout { .. }))));

    engine.stall_negotiation(false);
    assert!(alice.pc.create_offer().await.is_ok());
}

#[tokio::test]
async fn test_late_completion_is_not_delivered_to_next_request() {
    init_logging();

    let engine = LoopbackEngine::new();
    engine.stall_negotiation(true);
    let alice = peer_with_options(&engine, short_timeout()).await;

    assert!(matches!(
        alice.pc.create_offer().await,
        Err(Error::NegotiationTimeout { .. })
    ));

    // Stop parking, then release the stale request while a fresh one waits
    engine.stall_negotiation(false);
    engine.set_negotiation_delay(Duration::from_millis(50));
    let pending = {
        let pc = Arc::clone(&alice.pc);
        tokio::spawn(async move { pc.create_offer().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.release_stalled(), 1);

    let offer = pending.await.unwrap().unwrap();
    // The released request built version 2; the live one came after it
    assert_eq!(offer.document().origin.session_version, 3);

    alice.pc.set_local_description(offer).await.unwrap();
    assert_eq!(alice.pc.signaling_state(), SignalingState::HaveLocalOffer);
}

#[tokio::test]
async fn test_engine_failure_is_not_a_timeout() {
    init_logging();

    let engine = LoopbackEngine::new();
    engine.fail_negotiation(true);
    let alice = peer_with_options(&engine, short_timeout()).await;

    let result = alice.pc.create_offer().await;
    match result {
        Err(Error::NegotiationFailed(reason)) => assert!(reason.contains("create_offer")),
        other => panic!("expected an engine failure, got {other:?}"),
    }

    engine.fail_negotiation(false);
    assert!(alice.pc.create_offer().await.is_ok());
}

#[tokio::test]
async fn test_events_flow_while_negotiation_is_blocked() {
    init_logging();

    let engine = LoopbackEngine::new();
    engine.stall_negotiation(true);
    let mut alice = peer_with_options(
        &engine,
        NegotiationOptions::default().with_sdp_timeout(Duration::from_secs(2)),
    )
    .await;

    let pending = {
        let pc = Arc::clone(&alice.pc);
        tokio::spawn(async move { pc.create_offer().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Track changes do not take the negotiation lock
    alice
        .pc
        .add_track(LocalTrack::audio("mic"), &[])
        .await
        .unwrap();
    let event = alice
        .wait_for(|e| matches!(e, PeerConnectionEvent::RenegotiationNeeded))
        .await;
    assert!(event.is_some());
    assert!(!pending.is_finished());

    assert_eq!(engine.release_stalled(), 1);
    let offer = pending.await.unwrap().unwrap();
    assert_eq!(offer.document().media.len(), 1);
}

#[tokio::test]
async fn test_close_unblocks_in_flight_negotiation() {
    init_logging();

    let engine = LoopbackEngine::new();
    engine.stall_negotiation(true);
    let alice = peer_with_options(
        &engine,
        NegotiationOptions::default().with_sdp_timeout(Duration::from_secs(5)),
    )
    .await;

    let pending = {
        let pc = Arc::clone(&alice.pc);
        tokio::spawn(async move { pc.create_offer().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    alice.pc.close().await;
    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("close left the negotiation hanging")
        .unwrap();
    assert!(matches!(result, Err(Error::NegotiationFailed(_))));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(alice.pc.signaling_state(), SignalingState::Closed);
}

#[tokio::test]
async fn test_set_description_waits_for_engine() {
    init_logging();

    let engine = LoopbackEngine::new();
    let alice = TestPeer::new(&engine).await;
    let bob = TestPeer::new(&engine).await;

    let offer = alice.pc.create_offer().await.unwrap();

    // Both descriptions race; each sees a consistent state afterwards
    let local = {
        let pc = Arc::clone(&alice.pc);
        let offer = offer.clone();
        tokio::spawn(async move { pc.set_local_description(offer).await })
    };
    let remote = {
        let pc = Arc::clone(&bob.pc);
        tokio::spawn(async move { pc.set_remote_description(offer).await })
    };
    local.await.unwrap().unwrap();
    remote.await.unwrap().unwrap();

    assert_eq!(alice.pc.signaling_state(), SignalingState::HaveLocalOffer);
    assert_eq!(bob.pc.signaling_state(), SignalingState::HaveRemoteOffer);

    // Second local offer while one is installed is allowed
    let again = alice.pc.create_offer().await.unwrap();
    alice.pc.set_local_description(again).await.unwrap();
    assert_eq!(alice.pc.signaling_state(), SignalingState::HaveLocalOffer);
}

#[tokio::test]
async fn test_late_description_apply_is_adopted() {
    init_logging();

    let engine = LoopbackEngine::new();
    let alice = peer_with_options(
        &engine,
        NegotiationOptions::default()
            .with_set_description_timeout(Some(Duration::from_millis(100))),
    )
    .await;
    let bob = TestPeer::new(&engine).await;

    let offer = alice.pc.create_offer().await.unwrap();
    engine.set_description_delay(Duration::from_millis(300));
    let result = alice.pc.set_local_description(offer.clone()).await;
    assert!(matches!(
        result,
        Err(Error::NegotiationTimeout {
            operation: "set_local_description",
            ..
        })
    ));
    engine.set_description_delay(Duration::ZERO);

    // The engine still applies the offer after the caller gave up
    assert!(eventually(|| alice.pc.signaling_state() == SignalingState::HaveLocalOffer).await);

    bob.pc.set_remote_description(offer).await.unwrap();
    let answer = bob.pc.create_answer().await.unwrap();
    bob.pc.set_local_description(answer.clone()).await.unwrap();
    alice.pc.set_remote_description(answer).await.unwrap();
    assert_eq!(alice.pc.signaling_state(), SignalingState::Stable);
    assert_eq!(bob.pc.signaling_state(), SignalingState::Stable);
}
