//! Blocking facade tests
//!
//! Plain `#[test]` functions with no runtime of their own. Event handlers
//! and data channel callbacks run on the `rtc-events` thread and call
//! straight back into the blocking API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use rtc_peer::blocking::{self, BlockingPeerConnection};
use parking_lot::Mutex;
use rtc_peer::{
    Configuration, DataChannel, DataChannelInit, Error, IceCandidate, LoopbackEngine, NegotiationOptions,
    PeerConnection, PeerConnectionHandler, PeerConnectionState, SignalingState, Verbosity,
};
use tokio_test::{assert_err, assert_ok};

fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

type Slot = Arc<OnceLock<Weak<BlockingPeerConnection>>>;

/// Forwards candidates to the remote side and opens a channel once connected
#[derive(Default)]
struct Relay {
    local: Slot,
    remote: Slot,
    forwarded: AtomicUsize,
    rejected: AtomicUsize,
    channel_label: Option<&'static str>,
}

impl PeerConnectionHandler for Relay {
    fn on_ice_candidate(&self, candidate: IceCandidate) {
        let Some(remote) = self.remote.get().and_then(Weak::upgrade) else {
            return;
        };
        match remote.add_ice_candidate(&candidate) {
            Ok(()) => self.forwarded.fetch_add(1, Ordering::SeqCst),
            Err(_) => self.rejected.fetch_add(1, Ordering::SeqCst),
        };
    }

    fn on_connection_state_change(&self, state: PeerConnectionState) {
        if state != PeerConnectionState::Connected {
            return;
        }
        let (Some(label), Some(local)) = (self.channel_label, self.local.get().and_then(Weak::upgrade)) else {
            return;
        };
        if let Err(e) = local.create_data_channel(label, DataChannelInit::default()) {
            panic!("channel from handler failed: {e}");
        }
    }
}

/// Echoes every text message back on the channel it arrived on
#[derive(Default)]
struct Echo {
    local: Slot,
    echoed: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl PeerConnectionHandler for Echo {
    fn on_data_channel(&self, channel: Arc<DataChannel>) {
        let local = Arc::clone(&self.local);
        let echoed = Arc::clone(&self.echoed);
        let failed = Arc::clone(&self.failed);
        let weak = Arc::downgrade(&channel);
        channel.on_message(move |buffer| {
            let (Some(pc), Some(channel)) = (local.get().and_then(Weak::upgrade), weak.upgrade())
            else {
                return;
            };
            let Some(text) = buffer.as_text() else {
                return;
            };
            match pc.send_text(&channel, text) {
                Ok(()) => echoed.fetch_add(1, Ordering::SeqCst),
                Err(_) => failed.fetch_add(1, Ordering::SeqCst),
            };
        });
    }
}

#[test]
fn test_channel_callbacks_call_blocking_api() {
    let context = assert_ok!(blocking::initialize(Verbosity::Off));
    let engine = LoopbackEngine::new();

    let bob_slot: Slot = Arc::default();
    let echo = Arc::new(Echo {
        local: Arc::clone(&bob_slot),
        ..Default::default()
    });
    let alice = Arc::new(assert_ok!(context.create_peer_connection(
        &engine,
        Configuration::default(),
        Arc::new(rtc_peer::NoopHandler)
    )));
    let bob = Arc::new(assert_ok!(context.create_peer_connection(
        &engine,
        Configuration::default(),
        echo.clone()
    )));
    let _ = bob_slot.set(Arc::downgrade(&bob));

    let channel = assert_ok!(alice.create_data_channel("echo", DataChannelInit::default()));
    let greeted = Arc::new(AtomicUsize::new(0));
    let greet_failed = Arc::new(AtomicUsize::new(0));
    {
        let alice = Arc::downgrade(&alice);
        let weak = Arc::downgrade(&channel);
        let greeted = Arc::clone(&greeted);
        let greet_failed = Arc::clone(&greet_failed);
        channel.on_open(move || {
            let (Some(alice), Some(channel)) = (alice.upgrade(), weak.upgrade()) else {
                return;
            };
            match alice.send_text(&channel, "hello") {
                Ok(()) => greeted.fetch_add(1, Ordering::SeqCst),
                Err(_) => greet_failed.fetch_add(1, Ordering::SeqCst),
            };
        });
    }
    let replies = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let replies = Arc::clone(&replies);
        channel.on_message(move |buffer| {
            replies
                .lock()
                .push(buffer.as_text().unwrap_or_default().to_string());
        });
    }

    let offer = assert_ok!(alice.create_offer());
    assert_ok!(alice.set_local_description(offer.clone()));
    assert_ok!(bob.set_remote_description(offer));
    let answer = assert_ok!(bob.create_answer());
    assert_ok!(bob.set_local_description(answer.clone()));
    assert_ok!(alice.set_remote_description(answer));

    assert!(wait_until(|| greeted.load(Ordering::SeqCst) == 1));
    assert_eq!(greet_failed.load(Ordering::SeqCst), 0);
    assert!(wait_until(|| replies.lock().len() == 1));
    assert_eq!(replies.lock()[0], "hello");
    assert_eq!(echo.echoed.load(Ordering::SeqCst), 1);
    assert_eq!(echo.failed.load(Ordering::SeqCst), 0);
    assert_eq!(channel.stats().messages_sent, 1);
    assert_eq!(channel.stats().messages_received, 1);

    alice.close();
    bob.close();
}

#[test]
fn test_handlers_call_blocking_api() {
    let context = assert_ok!(blocking::initialize(Verbosity::Warn));
    let engine = LoopbackEngine::new();

    let alice_slot: Slot = Arc::default();
    let bob_slot: Slot = Arc::default();
    let alice_relay = Arc::new(Relay {
        local: Arc::clone(&alice_slot),
        remote: Arc::clone(&bob_slot),
        channel_label: Some("from-handler"),
        ..Default::default()
    });
    let bob_relay = Arc::new(Relay {
        local: Arc::clone(&bob_slot),
        remote: Arc::clone(&alice_slot),
        ..Default::default()
    });

    let alice = Arc::new(assert_ok!(context.create_peer_connection(
        &engine,
        Configuration::default(),
        alice_relay.clone()
    )));
    let bob = Arc::new(assert_ok!(context.create_peer_connection(
        &engine,
        Configuration::default(),
        bob_relay.clone()
    )));
    let _ = alice_slot.set(Arc::downgrade(&alice));
    let _ = bob_slot.set(Arc::downgrade(&bob));

    assert_ok!(alice.create_data_channel("chat", DataChannelInit::default()));

    // Each side installs the remote description before gathering starts,
    // so every forwarded candidate has a section to land in
    let offer = assert_ok!(alice.create_offer());
    assert_ok!(bob.set_remote_description(offer.clone()));
    assert_ok!(alice.set_local_description(offer));
    let answer = assert_ok!(bob.create_answer());
    assert_ok!(alice.set_remote_description(answer.clone()));
    assert_ok!(bob.set_local_description(answer));

    assert_eq!(alice.signaling_state(), SignalingState::Stable);
    assert_eq!(bob.signaling_state(), SignalingState::Stable);
    assert!(wait_until(|| alice.connection_state() == PeerConnectionState::Connected));
    assert!(wait_until(|| alice_relay.forwarded.load(Ordering::SeqCst) > 0));
    assert!(wait_until(|| bob_relay.forwarded.load(Ordering::SeqCst) > 0));
    assert_eq!(alice_relay.rejected.load(Ordering::SeqCst), 0);
    assert_eq!(bob_relay.rejected.load(Ordering::SeqCst), 0);

    // The handler's channel reached the other side
    assert!(wait_until(|| bob.data_channels().len() == 2));
    let labels: Vec<String> = bob
        .data_channels()
        .iter()
        .map(|c| c.label().to_string())
        .collect();
    assert!(labels.iter().any(|l| l == "from-handler"));

    alice.close();
    bob.close();
    assert_eq!(alice.connection_state(), PeerConnectionState::Closed);
}

#[test]
fn test_blocking_send_and_stats() {
    let context = assert_ok!(blocking::initialize(Verbosity::Off));
    let engine = LoopbackEngine::new();
    let (bob_handler, mut bob_events) = rtc_peer::EventChannel::new();

    let alice = assert_ok!(context.create_peer_connection(
        &engine,
        Configuration::default(),
        Arc::new(rtc_peer::NoopHandler)
    ));
    let bob = assert_ok!(context.create_peer_connection(&engine, Configuration::default(), bob_handler));

    let channel = assert_ok!(alice.create_data_channel("chat", DataChannelInit::default()));
    assert_err!(alice.send_text(&channel, "too soon"));

    let offer = assert_ok!(alice.create_offer());
    assert_ok!(alice.set_local_description(offer.clone()));
    assert_ok!(bob.set_remote_description(offer));
    let answer = assert_ok!(bob.create_answer());
    assert_ok!(bob.set_local_description(answer.clone()));
    assert_ok!(alice.set_remote_description(answer));

    // Wait for the remote half before sending so the message has a consumer
    let deadline = Instant::now() + Duration::from_secs(2);
    let remote = loop {
        match bob_events.try_recv() {
            Ok(rtc_peer::PeerConnectionEvent::DataChannel(channel)) => break channel,
            Ok(_) => continue,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("no remote channel: {e}"),
        }
    };
    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = Arc::clone(&received);
        remote.on_message(move |_| {
            received.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(wait_until(|| channel.ready_state() == rtc_peer::DataChannelState::Open));
    assert_ok!(alice.send_text(&channel, "one"));
    assert_ok!(alice.send(&channel, vec![7u8; 16]));
    assert!(wait_until(|| received.load(Ordering::SeqCst) == 2));
    assert_eq!(channel.stats().bytes_sent, 19);

    assert!(alice.delete_data_channel(&channel));
    assert!(alice.data_channels().is_empty());
}

#[test]
fn test_blocking_timeout_then_recovery() {
    let context = assert_ok!(blocking::initialize(Verbosity::Off));
    let engine = LoopbackEngine::new();
    engine.stall_negotiation(true);

    let pc = assert_ok!(context.build(
        &engine,
        PeerConnection::builder(Configuration::default()).with_options(
            NegotiationOptions::default().with_sdp_timeout(Duration::from_millis(100))
        ),
    ));

    let started = Instant::now();
    let result = pc.create_offer();
    assert!(matches!(result, Err(Error::NegotiationTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(100));

    engine.stall_negotiation(false);
    let offer = assert_ok!(pc.create_offer());
    assert_ok!(pc.set_local_description(offer));
    assert_eq!(pc.signaling_state(), SignalingState::HaveLocalOffer);
    assert!(pc.local_description().is_some());
    assert!(pc.remote_description().is_none());
}

#[test]
fn test_blocking_calls_fail_after_close() {
    let context = assert_ok!(blocking::initialize(Verbosity::Off));
    let engine = LoopbackEngine::new();
    let pc = assert_ok!(context.create_peer_connection(
        &engine,
        Configuration::default(),
        Arc::new(rtc_peer::NoopHandler)
    ));

    pc.close();
    pc.close();
    assert_eq!(pc.signaling_state(), SignalingState::Closed);
    assert_err!(pc.create_offer());
    assert_err!(pc.set_configuration(Configuration::default()));
    assert_err!(pc.create_data_channel("late", DataChannelInit::default()));
}
