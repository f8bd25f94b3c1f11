//! Loopback negotiation demo
//!
//! Creates two peer connections on the in-process loopback engine, runs the
//! offer/answer exchange between them, trickles candidates, and bounces a
//! few messages over a data channel.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin rtc_loopback --features cli -- --messages 5 --verbosity 3
//!
//! # Print the exchanged session descriptions as JSON
//! cargo run --bin rtc_loopback --features cli -- --print-sdp
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rtc_peer::{
    Configuration, DataChannelInit, EventChannel, IceServer, LoopbackEngine, NegotiationOptions,
    PeerConnection, PeerConnectionEvent, PeerConnectionState, Verbosity,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Loopback peer-connection demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of messages to send from the offerer
    #[arg(short, long, default_value_t = 3)]
    messages: u32,

    /// Data channel label
    #[arg(long, default_value = "chat")]
    label: String,

    /// Unordered channel delivery
    #[arg(long, default_value_t = false)]
    unordered: bool,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    stun_servers: Vec<String>,

    /// Offer/answer timeout in milliseconds
    #[arg(long, default_value_t = 3000, env = "RTC_SDP_TIMEOUT_MS")]
    sdp_timeout_ms: u64,

    /// Log verbosity: 0 off, 1 error, 2 warn, 3 info, 4 trace
    #[arg(short, long, default_value_t = 3, env = "RTC_VERBOSITY")]
    verbosity: u8,

    /// Print offer and answer as JSON
    #[arg(long, default_value_t = false)]
    print_sdp: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    rtc_peer::init_logging(Verbosity::from_level(args.verbosity));

    let mut configuration = Configuration::default();
    for url in &args.stun_servers {
        let server = IceServer::parse(url).with_context(|| format!("invalid STUN url {url}"))?;
        configuration = configuration.with_ice_server(server);
    }
    let options =
        NegotiationOptions::default().with_sdp_timeout(Duration::from_millis(args.sdp_timeout_ms));

    let engine = LoopbackEngine::new();
    let (alice_events, alice_rx) = EventChannel::new();
    let (bob_events, bob_rx) = EventChannel::new();

    let alice = Arc::new(
        PeerConnection::builder(configuration.clone())
            .with_options(options.clone())
            .with_handler(alice_events)
            .build(&engine)
            .await
            .context("failed to create offerer")?,
    );
    let bob = Arc::new(
        PeerConnection::builder(configuration)
            .with_options(options)
            .with_handler(bob_events)
            .build(&engine)
            .await
            .context("failed to create answerer")?,
    );
    info!(alice = %alice.connection_id(), bob = %bob.connection_id(), "Peers created");

    let mut init = DataChannelInit::default();
    if args.unordered {
        init = init.unordered();
    }
    let channel = alice
        .create_data_channel(&args.label, init)
        .await
        .context("failed to create data channel")?;
    let (opened_tx, mut opened_rx) = mpsc::unbounded_channel();
    channel.on_open(move || {
        let _ = opened_tx.send(());
    });

    // Offer/answer
    let offer = alice.create_offer().await.context("create_offer")?;
    alice
        .set_local_description(offer.clone())
        .await
        .context("offerer set_local_description")?;
    bob.set_remote_description(offer.clone())
        .await
        .context("answerer set_remote_description")?;
    let answer = bob.create_answer().await.context("create_answer")?;
    bob.set_local_description(answer.clone())
        .await
        .context("answerer set_local_description")?;
    alice
        .set_remote_description(answer.clone())
        .await
        .context("offerer set_remote_description")?;

    if args.print_sdp {
        println!("{}", offer.to_json()?);
        println!("{}", answer.to_json()?);
    }

    let (received_tx, mut received_rx) = mpsc::unbounded_channel();
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
    let alice_task = tokio::spawn(pump_events("alice", alice_rx, Arc::clone(&bob), None));
    let bob_task = tokio::spawn(pump_events(
        "bob",
        bob_rx,
        Arc::clone(&alice),
        Some(Receiver {
            messages: received_tx,
            ready: ready_tx,
        }),
    ));

    tokio::time::timeout(Duration::from_secs(5), opened_rx.recv())
        .await
        .context("data channel did not open")?;
    tokio::time::timeout(Duration::from_secs(5), ready_rx.recv())
        .await
        .context("answerer never saw the data channel")?;
    info!(label = %channel.label(), id = ?channel.id(), "Data channel open");

    for n in 0..args.messages {
        channel.send_text(&format!("message {n}")).await?;
    }

    for _ in 0..args.messages {
        let text = tokio::time::timeout(Duration::from_secs(5), received_rx.recv())
            .await
            .context("timed out waiting for a message")?
            .context("answerer stopped receiving")?;
        println!("bob received: {text}");
    }

    let stats = channel.stats();
    info!(
        messages_sent = stats.messages_sent,
        bytes_sent = stats.bytes_sent,
        "Offerer channel stats"
    );
    if alice.connection_state() != PeerConnectionState::Connected {
        bail!("offerer ended in {}", alice.connection_state());
    }

    alice.close().await;
    bob.close().await;
    alice_task.abort();
    bob_task.abort();
    Ok(())
}

/// Answer-side sinks for incoming channel traffic
struct Receiver {
    messages: mpsc::UnboundedSender<String>,
    ready: mpsc::UnboundedSender<()>,
}

/// Forward candidates to the other side and log everything else
async fn pump_events(
    name: &'static str,
    mut events: mpsc::UnboundedReceiver<PeerConnectionEvent>,
    remote: Arc<PeerConnection>,
    receiver: Option<Receiver>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PeerConnectionEvent::IceCandidate(candidate) => {
                if let Err(e) = remote.add_ice_candidate(&candidate).await {
                    warn!(peer = name, "Candidate not accepted: {}", e);
                }
            }
            PeerConnectionEvent::DataChannel(channel) => {
                info!(peer = name, label = %channel.label(), "Remote data channel");
                if let Some(receiver) = &receiver {
                    let tx = receiver.messages.clone();
                    channel.on_message(move |buffer| {
                        if let Some(text) = buffer.as_text() {
                            let _ = tx.send(text.to_string());
                        }
                    });
                    let _ = receiver.ready.send(());
                }
            }
            PeerConnectionEvent::IceConnectionFailed => {
                warn!(peer = name, "ICE failed");
            }
            other => info!(peer = name, event = other.name(), "{:?}", other),
        }
    }
}
