//! Per-connection data channel registry
//!
//! Guarded by its own lock so channels can be created or removed while a
//! negotiation holds the connection's negotiation lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::data_channel::CallbackContext;
use super::DataChannel;
use crate::engine::EngineChannel;
use crate::events::EventRelay;

struct Slots {
    channels: HashMap<u64, Arc<DataChannel>>,
    /// Set once drained on close; later registrations are refused
    sealed: bool,
}

pub(crate) struct ChannelRegistry {
    slots: Mutex<Slots>,
    next_handle: AtomicU64,
    context: RwLock<CallbackContext>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                channels: HashMap::new(),
                sealed: false,
            }),
            next_handle: AtomicU64::new(1),
            context: RwLock::new(CallbackContext::Inline),
        }
    }

    /// Run channel callbacks on the relay's dispatcher instead of inline
    pub fn queue_callbacks_on(&self, relay: Weak<EventRelay>) {
        *self.context.write() = CallbackContext::Queued(relay);
    }

    /// Wrap an engine channel, register its observer and track it.
    ///
    /// Returns `None` once the registry has been drained.
    pub fn register(&self, engine: Arc<dyn EngineChannel>) -> Option<Arc<DataChannel>> {
        let mut slots = self.slots.lock();
        if slots.sealed {
            debug!(label = %engine.label(), "Registry closed, not registering channel");
            return None;
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let channel = DataChannel::attach(handle, engine, self.context.read().clone());
        slots.channels.insert(handle, Arc::clone(&channel));
        Some(channel)
    }

    /// Remove a channel and release its observer
    pub fn remove(&self, handle: u64) -> Option<Arc<DataChannel>> {
        let channel = self.slots.lock().channels.remove(&handle)?;
        channel.detach();
        Some(channel)
    }

    pub fn get(&self, handle: u64) -> Option<Arc<DataChannel>> {
        self.slots.lock().channels.get(&handle).cloned()
    }

    /// All channels, in creation order
    pub fn list(&self) -> Vec<Arc<DataChannel>> {
        let mut channels: Vec<_> = self.slots.lock().channels.values().cloned().collect();
        channels.sort_by_key(|c| c.handle());
        channels
    }

    pub fn len(&self) -> usize {
        self.slots.lock().channels.len()
    }

    /// Drain the registry for good, releasing every observer
    pub fn detach_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut slots = self.slots.lock();
            slots.sealed = true;
            slots.channels.drain().map(|(_, c)| c).collect()
        };
        for channel in &drained {
            channel.detach();
        }
        debug!(count = drained.len(), "Released data channel observers");
        drained.len()
    }
}
