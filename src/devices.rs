//! Capture and playback device seam.
//!
//! The session controller only talks to these traits. Concrete backends live
//! in `audio` (PulseAudio, feature `pulse`) and `screen` (xcap, feature
//! `capture`); tests use in-memory fakes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Which physical camera is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    /// User-facing camera
    #[default]
    Front,
    /// Environment-facing camera
    Rear,
}

impl FacingMode {
    pub fn toggled(self) -> Self {
        match self {
            FacingMode::Front => FacingMode::Rear,
            FacingMode::Rear => FacingMode::Front,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "front" | "user" => Some(FacingMode::Front),
            "rear" | "back" | "environment" => Some(FacingMode::Rear),
            _ => None,
        }
    }
}

impl fmt::Display for FacingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacingMode::Front => write!(f, "front"),
            FacingMode::Rear => write!(f, "rear"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Microphone,
    Camera,
    Speaker,
}

impl DeviceKind {
    pub fn noun(&self) -> &'static str {
        match self {
            DeviceKind::Microphone => "microphone",
            DeviceKind::Camera => "camera",
            DeviceKind::Speaker => "audio output device",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            DeviceKind::Microphone => "Microphone",
            DeviceKind::Camera => "Camera",
            DeviceKind::Speaker => "Audio output device",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("device not found")]
    NotFound,
    #[error("device stopped")]
    Stopped,
    #[error("{0}")]
    Backend(String),
}

/// One complete RGBA video frame at the source's native resolution.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Identifies one scheduled playback unit on an [`AudioOutput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u64);

/// An exclusively owned microphone stream producing mono f32 samples.
pub trait AudioInput: Send + Sync {
    /// Block until `frame` has been filled with the next samples.
    ///
    /// Returns `DeviceError::Stopped` once [`AudioInput::stop`] was called.
    fn read_frame(&self, frame: &mut [f32]) -> Result<(), DeviceError>;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// An exclusively owned camera stream.
pub trait VideoInput: Send + Sync {
    fn facing(&self) -> FacingMode;
    /// The most recent complete frame, or `None` if nothing is ready yet.
    fn latest_frame(&self) -> Option<VideoFrame>;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// A playback clock that accepts time-stamped mono buffers.
pub trait AudioOutput: Send + Sync {
    /// Seconds elapsed on the output clock.
    fn current_time(&self) -> f64;
    /// Queue `samples` to start playing at `start_at` on the output clock.
    /// The id is sent on the `ended` channel once the buffer has played out.
    fn start(
        &self,
        id: SourceId,
        samples: Vec<f32>,
        sample_rate: u32,
        start_at: f64,
    ) -> Result<(), DeviceError>;
    /// Drop a queued or playing buffer without signalling `ended`.
    fn stop(&self, id: SourceId);
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub trait AudioDevices: Send + Sync {
    fn open_microphone(&self, sample_rate: u32) -> Result<Arc<dyn AudioInput>, DeviceError>;
    fn open_speaker(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Arc<dyn AudioOutput>, DeviceError>;
}

pub trait VideoDevices: Send + Sync {
    fn open_camera(&self, facing: FacingMode) -> Result<Arc<dyn VideoInput>, DeviceError>;
}

#[derive(Default)]
struct CaptureState {
    armed: bool,
    closed: bool,
    blocks: VecDeque<Vec<f32>>,
    pending: VecDeque<f32>,
    dropped: u64,
}

/// Bounded hand-off between a hardware capture thread and the frame reader.
///
/// Blocks pushed before the reader arms the buffer are discarded, and a full
/// buffer drops its oldest block, so reads only ever see live audio.
pub struct CaptureBuffer {
    state: Mutex<CaptureState>,
    ready: Condvar,
    capacity: usize,
}

impl CaptureBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CaptureState::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Start keeping blocks. Anything captured so far is thrown away.
    pub fn arm(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.armed {
            state.armed = true;
            state.blocks.clear();
            state.pending.clear();
        }
    }

    /// Called by the capture thread. Returns `false` once the buffer is closed.
    pub fn push(&self, block: Vec<f32>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return false;
        }
        if !state.armed {
            return true;
        }
        if state.blocks.len() >= self.capacity {
            state.blocks.pop_front();
            state.dropped += 1;
            debug!("Capture buffer full, dropped {} blocks so far", state.dropped);
        }
        state.blocks.push_back(block);
        self.ready.notify_one();
        true
    }

    /// No more blocks will arrive. Wakes a blocked reader.
    pub fn close(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        self.ready.notify_all();
    }

    /// Fill `frame`, arming the buffer on first use. `stopped` is polled
    /// while waiting so a stop request ends the read promptly.
    pub fn read(&self, frame: &mut [f32], stopped: impl Fn() -> bool) -> Result<(), DeviceError> {
        self.arm();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut filled = 0;

        while filled < frame.len() {
            if stopped() {
                return Err(DeviceError::Stopped);
            }
            if let Some(sample) = state.pending.pop_front() {
                frame[filled] = sample;
                filled += 1;
                continue;
            }
            if let Some(block) = state.blocks.pop_front() {
                state.pending.extend(block);
                continue;
            }
            if state.closed {
                return Err(DeviceError::Backend("capture stream ended".to_string()));
            }
            state = self
                .ready
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        Ok(())
    }
}

/// The visible preview. Whatever camera is bound here is also what the
/// video uplink snapshots, so rebinding after a camera switch redirects the
/// uplink without touching it.
pub struct PreviewSurface {
    tx: watch::Sender<Option<Arc<dyn VideoInput>>>,
}

impl PreviewSurface {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn bind(&self, camera: Arc<dyn VideoInput>) {
        self.tx.send_replace(Some(camera));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn facing(&self) -> Option<FacingMode> {
        self.tx.borrow().as_ref().map(|camera| camera.facing())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<dyn VideoInput>>> {
        self.tx.subscribe()
    }
}

impl Default for PreviewSurface {
    fn default() -> Self {
        Self::new()
    }
}
