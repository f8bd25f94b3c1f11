//! Caller-facing data channel handle

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::DataChannelState;
use crate::engine::{ChannelObserver, DataBuffer, EngineChannel};
use crate::events::EventRelay;
use crate::{Error, Result};

type Callback = Arc<dyn Fn() + Send + Sync>;
type MessageCallback = Arc<dyn Fn(DataBuffer) + Send + Sync>;

/// Deferred channel callback
pub(crate) type ChannelTask = Box<dyn FnOnce() + Send>;

/// Where channel callbacks run
#[derive(Clone, Default)]
pub(crate) enum CallbackContext {
    /// On the engine context that reported the change
    #[default]
    Inline,
    /// Behind the connection's queued events, on its dispatcher
    Queued(Weak<EventRelay>),
}

impl CallbackContext {
    fn run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Self::Inline => task(),
            Self::Queued(relay) => match relay.upgrade() {
                Some(relay) => relay.enqueue_task(Box::new(task)),
                None => trace!("Dropping channel callback after connection release"),
            },
        }
    }
}

#[derive(Default)]
struct Callbacks {
    on_open: Option<Callback>,
    on_close: Option<Callback>,
    on_message: Option<MessageCallback>,
    on_buffered_amount_low: Option<Callback>,
}

/// Data channel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelStats {
    pub label: String,
    pub state: DataChannelState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Data channel owned by a peer connection's registry.
///
/// Callbacks run on the engine's execution context and must not block,
/// unless the connection delivers events on a thread. Then they run on
/// that thread, in order with the connection's other events.
pub struct DataChannel {
    handle: u64,
    label: String,
    engine: Arc<dyn EngineChannel>,
    context: CallbackContext,
    state: RwLock<DataChannelState>,
    callbacks: RwLock<Callbacks>,
    buffered_amount_low_threshold: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    detached: AtomicBool,
}

/// Observer registered with the engine; holds only a weak reference so the
/// engine never keeps a deleted channel alive.
struct ChannelRelay {
    channel: Weak<DataChannel>,
}

impl DataChannel {
    /// Wrap an engine channel and register the observer
    pub(crate) fn attach(
        handle: u64,
        engine: Arc<dyn EngineChannel>,
        context: CallbackContext,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            handle,
            label: engine.label(),
            state: RwLock::new(engine.state()),
            engine,
            context,
            callbacks: RwLock::new(Callbacks::default()),
            buffered_amount_low_threshold: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            detached: AtomicBool::new(false),
        });

        channel.engine.register_observer(Arc::new(ChannelRelay {
            channel: Arc::downgrade(&channel),
        }));

        // The engine may have moved on between construction and registration
        channel.handle_state_change();

        debug!(
            label = %channel.label,
            handle,
            state = %channel.ready_state(),
            "Data channel attached"
        );
        channel
    }

    /// Registry handle, unique within the owning connection
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// SCTP stream id, once assigned
    pub fn id(&self) -> Option<u16> {
        self.engine.id()
    }

    pub fn ordered(&self) -> bool {
        self.engine.ordered()
    }

    pub fn protocol(&self) -> String {
        self.engine.protocol()
    }

    pub fn negotiated(&self) -> bool {
        self.engine.negotiated()
    }

    pub fn max_retransmits(&self) -> Option<u16> {
        self.engine.max_retransmits()
    }

    pub fn max_packet_life_time(&self) -> Option<u16> {
        self.engine.max_packet_life_time()
    }

    /// Ready state as last reported through the observer
    pub fn ready_state(&self) -> DataChannelState {
        *self.state.read()
    }

    /// Bytes queued in the engine but not yet sent
    pub async fn buffered_amount(&self) -> u64 {
        self.engine.buffered_amount().await
    }

    pub fn buffered_amount_low_threshold(&self) -> u64 {
        self.buffered_amount_low_threshold.load(Ordering::Acquire)
    }

    pub fn set_buffered_amount_low_threshold(&self, threshold: u64) {
        self.buffered_amount_low_threshold
            .store(threshold, Ordering::Release);
    }

    /// Send a binary message. Empty payloads are ignored.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_buffer(DataBuffer::binary(data)).await
    }

    /// Send a text message. Empty strings are ignored.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send_buffer(DataBuffer::text(text)).await
    }

    async fn send_buffer(&self, buffer: DataBuffer) -> Result<()> {
        if buffer.is_empty() {
            debug!(label = %self.label, "Ignoring empty data channel message");
            return Ok(());
        }

        // The engine's own state; the cached one may trail a queued callback
        let state = self.engine.state();
        if state != DataChannelState::Open {
            return Err(Error::DataChannel(format!(
                "Data channel '{}' is not open (state: {})",
                self.label, state
            )));
        }

        let len = buffer.len() as u64;
        if !self.engine.send(&buffer).await {
            return Err(Error::DataChannel(format!(
                "Engine refused {} byte message on '{}'",
                len, self.label
            )));
        }

        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Start closing the channel; `on_close` fires once the engine reports Closed
    pub async fn close(&self) {
        debug!(label = %self.label, "Closing data channel");
        self.engine.close().await;
    }

    pub fn on_open<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.write().on_open = Some(Arc::new(callback));
    }

    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.write().on_close = Some(Arc::new(callback));
    }

    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(DataBuffer) + Send + Sync + 'static,
    {
        self.callbacks.write().on_message = Some(Arc::new(callback));
    }

    /// Fires when the buffered amount drops to the low threshold or below
    pub fn on_buffered_amount_low<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.write().on_buffered_amount_low = Some(Arc::new(callback));
    }

    pub fn stats(&self) -> DataChannelStats {
        DataChannelStats {
            label: self.label.clone(),
            state: self.ready_state(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }

    /// True once the observer has been released
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Release the engine observer and drop all callbacks.
    ///
    /// Returns `false` if already detached.
    pub(crate) fn detach(&self) -> bool {
        if self.detached.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.engine.unregister_observer();
        *self.callbacks.write() = Callbacks::default();
        debug!(label = %self.label, handle = self.handle, "Data channel observer released");
        true
    }

    fn handle_state_change(self: &Arc<Self>) {
        let new_state = self.engine.state();
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state == new_state {
            return;
        }
        debug!(
            label = %self.label,
            from = %old_state,
            to = %new_state,
            "Data channel state changed"
        );

        if matches!(new_state, DataChannelState::Open | DataChannelState::Closed) {
            let channel = Arc::clone(self);
            self.context.run(move || channel.emit_state(new_state));
        }
    }

    fn handle_message(self: &Arc<Self>, buffer: DataBuffer) {
        self.bytes_received
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);

        let channel = Arc::clone(self);
        self.context.run(move || channel.emit_message(buffer));
    }

    fn handle_buffered_amount(self: &Arc<Self>, amount: u64) {
        if amount > self.buffered_amount_low_threshold() {
            return;
        }
        let channel = Arc::clone(self);
        self.context.run(move || channel.emit_buffered_amount_low());
    }

    // Callbacks are looked up when they run, so a handler installed from an
    // earlier queued event still sees what follows it.

    fn emit_state(&self, state: DataChannelState) {
        let callback = {
            let callbacks = self.callbacks.read();
            match state {
                DataChannelState::Open => callbacks.on_open.clone(),
                DataChannelState::Closed => callbacks.on_close.clone(),
                _ => None,
            }
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    fn emit_message(&self, buffer: DataBuffer) {
        let callback = self.callbacks.read().on_message.clone();
        match callback {
            Some(callback) => callback(buffer),
            None => warn!(label = %self.label, "Message received with no on_message handler"),
        }
    }

    fn emit_buffered_amount_low(&self) {
        let callback = self.callbacks.read().on_buffered_amount_low.clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl ChannelObserver for ChannelRelay {
    fn on_state_change(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.handle_state_change();
        }
    }

    fn on_message(&self, buffer: DataBuffer) {
        if let Some(channel) = self.channel.upgrade() {
            channel.handle_message(buffer);
        }
    }

    fn on_buffered_amount_change(&self, amount: u64) {
        if let Some(channel) = self.channel.upgrade() {
            channel.handle_buffered_amount(amount);
        }
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("handle", &self.handle)
            .field("label", &self.label)
            .field("state", &self.ready_state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Engine channel driven by hand from tests
    #[derive(Default)]
    pub(crate) struct ManualChannel {
        pub state: Mutex<DataChannelState>,
        pub observer: Mutex<Option<Arc<dyn ChannelObserver>>>,
        pub sent: Mutex<Vec<DataBuffer>>,
        pub refuse_send: AtomicBool,
    }

    impl ManualChannel {
        pub fn set_state(&self, state: DataChannelState) {
            *self.state.lock() = state;
            let observer = self.observer.lock().clone();
            if let Some(observer) = observer {
                observer.on_state_change();
            }
        }

        pub fn deliver(&self, buffer: DataBuffer) {
            let observer = self.observer.lock().clone();
            if let Some(observer) = observer {
                observer.on_message(buffer);
            }
        }
    }

    #[async_trait]
    impl EngineChannel for ManualChannel {
        fn register_observer(&self, observer: Arc<dyn ChannelObserver>) {
            *self.observer.lock() = Some(observer);
        }
        fn unregister_observer(&self) {
            *self.observer.lock() = None;
        }
        async fn send(&self, buffer: &DataBuffer) -> bool {
            if self.refuse_send.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().push(buffer.clone());
            true
        }
        async fn close(&self) {
            self.set_state(DataChannelState::Closing);
            self.set_state(DataChannelState::Closed);
        }
        fn label(&self) -> String {
            "chat".to_string()
        }
        fn ordered(&self) -> bool {
            true
        }
        fn protocol(&self) -> String {
            String::new()
        }
        fn id(&self) -> Option<u16> {
            Some(0)
        }
        fn negotiated(&self) -> bool {
            false
        }
        fn max_retransmits(&self) -> Option<u16> {
            None
        }
        fn max_packet_life_time(&self) -> Option<u16> {
            None
        }
        fn state(&self) -> DataChannelState {
            *self.state.lock()
        }
        async fn buffered_amount(&self) -> u64 {
            0
        }
    }

    #[tokio::test]
    async fn test_state_follows_observer() {
        let engine = Arc::new(ManualChannel::default());
        let channel = DataChannel::attach(1, engine.clone(), CallbackContext::Inline);
        assert_eq!(channel.ready_state(), DataChannelState::Connecting);

        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        channel.on_open(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        engine.set_state(DataChannelState::Open);
        assert_eq!(channel.ready_state(), DataChannelState::Open);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let engine = Arc::new(ManualChannel::default());
        let channel = DataChannel::attach(1, engine.clone(), CallbackContext::Inline);

        let err = channel.send_text("hi").await.unwrap_err();
        assert!(matches!(err, Error::DataChannel(_)));

        engine.set_state(DataChannelState::Open);
        channel.send_text("hi").await.unwrap();
        channel.send(Vec::<u8>::new()).await.unwrap();
        assert_eq!(engine.sent.lock().len(), 1);
        assert_eq!(channel.stats().messages_sent, 1);
        assert_eq!(channel.stats().bytes_sent, 2);

        engine.refuse_send.store(true, Ordering::SeqCst);
        assert!(channel.send(vec![1u8, 2, 3]).await.is_err());
    }

    #[tokio::test]
    async fn test_messages_and_close_callbacks() {
        let engine = Arc::new(ManualChannel::default());
        let channel = DataChannel::attach(1, engine.clone(), CallbackContext::Inline);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        channel.on_message(move |buffer| sink.lock().push(buffer));
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        channel.on_close(move || flag.store(true, Ordering::SeqCst));

        engine.deliver(DataBuffer::text("ping"));
        assert_eq!(received.lock()[0].as_text(), Some("ping"));
        assert_eq!(channel.stats().bytes_received, 4);

        channel.close().await;
        assert_eq!(channel.ready_state(), DataChannelState::Closed);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_buffered_amount_low() {
        let engine = Arc::new(ManualChannel::default());
        let channel = DataChannel::attach(1, engine.clone(), CallbackContext::Inline);
        channel.set_buffered_amount_low_threshold(1024);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        channel.on_buffered_amount_low(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let observer = engine.observer.lock().clone().unwrap();
        observer.on_buffered_amount_change(4096);
        observer.on_buffered_amount_change(512);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detach_releases_observer() {
        let engine = Arc::new(ManualChannel::default());
        let channel = DataChannel::attach(1, engine.clone(), CallbackContext::Inline);
        assert!(channel.detach());
        assert!(!channel.detach());
        assert!(engine.observer.lock().is_none());
        assert!(channel.is_detached());
    }
}
