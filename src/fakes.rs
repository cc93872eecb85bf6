//! In-memory devices and connector for tests. Every handle records its
//! lifecycle so tests can check what was opened, stopped and closed.

use crate::devices::{
    AudioDevices, AudioInput, AudioOutput, DeviceError, FacingMode, SourceId, VideoDevices,
    VideoFrame, VideoInput,
};
use crate::error::{LiveError, Result};
use crate::transport::{Connector, InboundEvent, Link, Outbound, OutboundQueue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Shared record of acquisition calls, in order.
pub type CallLog = Arc<Mutex<Vec<&'static str>>>;

fn record(log: &CallLog, call: &'static str) {
    log.lock().unwrap().push(call);
}

pub struct FakeMicrophone {
    stopped: AtomicBool,
    reads: AtomicUsize,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl AudioInput for FakeMicrophone {
    fn read_frame(&self, frame: &mut [f32]) -> std::result::Result<(), DeviceError> {
        if self.is_stopped() {
            return Err(DeviceError::Stopped);
        }
        std::thread::sleep(Duration::from_millis(2));
        frame.fill(0.25);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub struct FakeCamera {
    facing: FacingMode,
    stopped: AtomicBool,
    frames: AtomicUsize,
}

impl FakeCamera {
    pub fn new(facing: FacingMode) -> Self {
        Self {
            facing,
            stopped: AtomicBool::new(false),
            frames: AtomicUsize::new(0),
        }
    }

    pub fn frames_taken(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

impl VideoInput for FakeCamera {
    fn facing(&self) -> FacingMode {
        self.facing
    }

    fn latest_frame(&self) -> Option<VideoFrame> {
        if self.is_stopped() {
            return None;
        }
        self.frames.fetch_add(1, Ordering::SeqCst);
        let shade = match self.facing {
            FacingMode::Front => 40,
            FacingMode::Rear => 200,
        };
        Some(VideoFrame {
            width: 2,
            height: 2,
            rgba: [shade, shade, shade, 255].repeat(4),
        })
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedSource {
    pub id: SourceId,
    pub start_at: f64,
    pub len: usize,
}

#[derive(Default)]
struct SpeakerState {
    now: f64,
    started: Vec<StartedSource>,
    stopped: Vec<SourceId>,
    close_calls: usize,
}

/// Output with a hand-driven clock.
pub struct FakeSpeaker {
    state: Mutex<SpeakerState>,
    /// Held so the session's ended channel stays open
    _ended: Option<mpsc::UnboundedSender<SourceId>>,
}

impl FakeSpeaker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SpeakerState::default()),
            _ended: None,
        }
    }

    pub fn with_ended(ended: mpsc::UnboundedSender<SourceId>) -> Self {
        Self {
            _ended: Some(ended),
            ..Self::new()
        }
    }

    pub fn set_time(&self, now: f64) {
        self.state.lock().unwrap().now = now;
    }

    pub fn started(&self) -> Vec<StartedSource> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }
}

impl AudioOutput for FakeSpeaker {
    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    fn start(
        &self,
        id: SourceId,
        samples: Vec<f32>,
        _sample_rate: u32,
        start_at: f64,
    ) -> std::result::Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.close_calls > 0 {
            return Err(DeviceError::Stopped);
        }
        state.started.push(StartedSource {
            id,
            start_at,
            len: samples.len(),
        });
        Ok(())
    }

    fn stop(&self, id: SourceId) {
        self.state.lock().unwrap().stopped.push(id);
    }

    fn close(&self) {
        self.state.lock().unwrap().close_calls += 1;
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().close_calls > 0
    }
}

/// Device provider that hands out fakes and remembers every one of them.
pub struct FakeDevices {
    log: CallLog,
    mic_error: Option<DeviceError>,
    camera_error: Option<DeviceError>,
    /// Camera opens at or beyond this index fail with `PermissionDenied`.
    camera_limit: Option<usize>,
    /// Time each camera open blocks for
    camera_delay: Duration,
    pub mics: Mutex<Vec<Arc<FakeMicrophone>>>,
    pub cameras: Mutex<Vec<Arc<FakeCamera>>>,
    pub speakers: Mutex<Vec<Arc<FakeSpeaker>>>,
}

impl FakeDevices {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            mic_error: None,
            camera_error: None,
            camera_limit: None,
            camera_delay: Duration::ZERO,
            mics: Mutex::new(Vec::new()),
            cameras: Mutex::new(Vec::new()),
            speakers: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_microphone(mut self, err: DeviceError) -> Self {
        self.mic_error = Some(err);
        self
    }

    pub fn failing_camera(mut self, err: DeviceError) -> Self {
        self.camera_error = Some(err);
        self
    }

    pub fn camera_limit(mut self, opens: usize) -> Self {
        self.camera_limit = Some(opens);
        self
    }

    pub fn slow_camera(mut self, delay: Duration) -> Self {
        self.camera_delay = delay;
        self
    }

    pub fn open_cameras(&self) -> usize {
        self.cameras
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.is_stopped())
            .count()
    }

    pub fn camera(&self, index: usize) -> Arc<FakeCamera> {
        self.cameras.lock().unwrap()[index].clone()
    }

    pub fn mic(&self, index: usize) -> Arc<FakeMicrophone> {
        self.mics.lock().unwrap()[index].clone()
    }

    pub fn speaker(&self, index: usize) -> Arc<FakeSpeaker> {
        self.speakers.lock().unwrap()[index].clone()
    }

    /// True when nothing this provider handed out is still running.
    pub fn all_released(&self) -> bool {
        self.mics.lock().unwrap().iter().all(|m| m.is_stopped())
            && self.cameras.lock().unwrap().iter().all(|c| c.is_stopped())
            && self.speakers.lock().unwrap().iter().all(|s| s.is_closed())
    }
}

impl AudioDevices for FakeDevices {
    fn open_microphone(
        &self,
        _sample_rate: u32,
    ) -> std::result::Result<Arc<dyn AudioInput>, DeviceError> {
        record(&self.log, "microphone");
        if let Some(err) = &self.mic_error {
            return Err(err.clone());
        }
        let mic = Arc::new(FakeMicrophone::new());
        self.mics.lock().unwrap().push(mic.clone());
        Ok(mic)
    }

    fn open_speaker(
        &self,
        _sample_rate: u32,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> std::result::Result<Arc<dyn AudioOutput>, DeviceError> {
        record(&self.log, "speaker");
        let speaker = Arc::new(FakeSpeaker::with_ended(ended));
        self.speakers.lock().unwrap().push(speaker.clone());
        Ok(speaker)
    }
}

impl VideoDevices for FakeDevices {
    fn open_camera(
        &self,
        facing: FacingMode,
    ) -> std::result::Result<Arc<dyn VideoInput>, DeviceError> {
        record(&self.log, "camera");
        std::thread::sleep(self.camera_delay);
        if let Some(err) = &self.camera_error {
            return Err(err.clone());
        }
        let mut cameras = self.cameras.lock().unwrap();
        if self.camera_limit.is_some_and(|limit| cameras.len() >= limit) {
            return Err(DeviceError::PermissionDenied);
        }
        let camera = Arc::new(FakeCamera::new(facing));
        cameras.push(camera.clone());
        Ok(camera)
    }
}

/// The far side of one opened link.
pub struct FakeRemote {
    pub events: mpsc::UnboundedSender<InboundEvent>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

pub struct FakeConnector {
    log: CallLog,
    fail: bool,
    remotes: Mutex<Vec<FakeRemote>>,
    opens: AtomicUsize,
}

impl FakeConnector {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail: false,
            remotes: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Take the remote end of the most recently opened link.
    pub fn take_remote(&self) -> FakeRemote {
        self.remotes.lock().unwrap().pop().expect("no link was opened")
    }
}

impl Connector for FakeConnector {
    fn open(&self) -> Result<Link> {
        record(&self.log, "transport");
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(LiveError::Transport("connect refused".to_string()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.remotes.lock().unwrap().push(FakeRemote {
            events: in_tx,
            outbound: out_rx,
        });
        Ok(Link {
            outbound: OutboundQueue::new(out_tx),
            inbound: in_rx,
        })
    }
}
