//! Media tracks and RTP senders

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::EngineRtpSender;

/// Track media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        })
    }
}

/// A track that can be attached to a connection
pub trait MediaStreamTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn is_ended(&self) -> bool;
}

type EndedCallback = Box<dyn Fn() + Send + Sync>;

/// Locally produced track
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended: AtomicBool,
    on_ended: Mutex<Option<EndedCallback>>,
}

impl LocalTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            on_ended: Mutex::new(None),
        })
    }

    pub fn audio(id: &str) -> Arc<Self> {
        Self::new(id, TrackKind::Audio)
    }

    pub fn video(id: &str) -> Arc<Self> {
        Self::new(id, TrackKind::Video)
    }

    /// Register a callback fired once when the track ends
    pub fn on_ended<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_ended.lock() = Some(Box::new(callback));
    }

    /// End the track. Further calls are no-ops.
    pub fn stop(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(track_id = %self.id, "Track ended");
        let callback = self.on_ended.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl MediaStreamTrack for LocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Track announced by the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_ids: Vec<String>,
}

/// Sender returned by `add_track`; pass it back to `remove_track`
#[derive(Clone)]
pub struct RtpSender {
    track: Arc<dyn MediaStreamTrack>,
    stream_ids: Vec<String>,
    engine: Arc<dyn EngineRtpSender>,
}

impl RtpSender {
    pub(crate) fn new(
        track: Arc<dyn MediaStreamTrack>,
        stream_ids: Vec<String>,
        engine: Arc<dyn EngineRtpSender>,
    ) -> Self {
        Self {
            track,
            stream_ids,
            engine,
        }
    }

    pub fn id(&self) -> String {
        self.engine.id()
    }

    pub fn track(&self) -> &Arc<dyn MediaStreamTrack> {
        &self.track
    }

    pub fn stream_ids(&self) -> &[String] {
        &self.stream_ids
    }

    pub(crate) fn engine_sender(&self) -> &Arc<dyn EngineRtpSender> {
        &self.engine
    }
}

impl fmt::Debug for RtpSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpSender")
            .field("id", &self.id())
            .field("track_id", &self.track.id())
            .field("stream_ids", &self.stream_ids)
            .finish()
    }
}
