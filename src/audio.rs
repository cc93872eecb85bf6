//! PulseAudio backend
//!
//! Microphone and speaker built on PulseAudio's simple API. Each device owns
//! its `Simple` stream on a dedicated OS thread; the rest of the engine only
//! sees the `AudioInput` / `AudioOutput` traits.

use crate::devices::{
    AudioDevices, AudioInput, AudioOutput, CaptureBuffer, DeviceError, SourceId,
};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::{BufferAttr, Retval};
use libpulse_binding::error::PAErr;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Samples per capture read (64 ms at 16 kHz)
const CAPTURE_BLOCK: usize = 1024;
/// Blocks held for a slow reader (about 2 s)
const CAPTURE_QUEUE_BLOCKS: usize = 32;
/// Playback period in milliseconds
const PLAYBACK_PERIOD_MS: u32 = 20;
/// Server-side playback buffer target in milliseconds
const PLAYBACK_TARGET_MS: u32 = 60;

/// Represents an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// PulseAudio source or sink name
    pub name: String,
    /// Human-readable description
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub kind: DeviceType,
}

/// Audio device type for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// Microphone or other input device
    Microphone,
    /// Monitor of system audio output
    Monitor,
    /// Playback sink
    Speaker,
    /// Every source (microphones and monitors)
    Any,
}

fn device_error(err: PAErr) -> DeviceError {
    let text = format!("{}", err);
    let lowered = text.to_lowercase();
    if lowered.contains("access denied") {
        DeviceError::PermissionDenied
    } else if lowered.contains("no such entity") {
        DeviceError::NotFound
    } else {
        DeviceError::Backend(text)
    }
}

fn mono_f32(rate: u32) -> Spec {
    Spec {
        format: Format::F32le,
        channels: 1,
        rate,
    }
}

/// Short server buffer so written frames are heard soon after. `u32::MAX`
/// leaves a field at the server default.
fn playback_attr(rate: u32) -> BufferAttr {
    BufferAttr {
        maxlength: u32::MAX,
        tlength: rate * PLAYBACK_TARGET_MS / 1000 * 4,
        prebuf: u32::MAX,
        minreq: u32::MAX,
        fragsize: u32::MAX,
    }
}

/// Frames actually heard: those written minus what the server still holds.
fn played_frames(written: u64, latency_us: u64, rate: u32) -> u64 {
    written.saturating_sub(latency_us.saturating_mul(u64::from(rate)) / 1_000_000)
}

fn f32_from_le(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// PulseAudio device provider. `None` names select the server default.
#[derive(Debug, Clone)]
pub struct PulseDevices {
    app_name: String,
    source: Option<String>,
    sink: Option<String>,
}

impl PulseDevices {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            source: None,
            sink: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_sink(mut self, sink: impl Into<String>) -> Self {
        self.sink = Some(sink.into());
        self
    }
}

impl AudioDevices for PulseDevices {
    fn open_microphone(&self, sample_rate: u32) -> Result<Arc<dyn AudioInput>, DeviceError> {
        let mic = PulseMicrophone::open(&self.app_name, self.source.clone(), sample_rate)?;
        Ok(Arc::new(mic))
    }

    fn open_speaker(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Arc<dyn AudioOutput>, DeviceError> {
        let speaker = PulseSpeaker::open(&self.app_name, self.sink.clone(), sample_rate, ended)?;
        Ok(Arc::new(speaker))
    }
}

/// Recording stream at the wire rate, read on its own thread. Samples
/// captured before the first `read_frame` are discarded.
pub struct PulseMicrophone {
    stop: Arc<AtomicBool>,
    buffer: Arc<CaptureBuffer>,
}

impl PulseMicrophone {
    fn open(app_name: &str, device: Option<String>, rate: u32) -> Result<Self, DeviceError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let buffer = Arc::new(CaptureBuffer::new(CAPTURE_QUEUE_BLOCKS));
        let stop = Arc::new(AtomicBool::new(false));
        let (capture, stop_flag) = (buffer.clone(), stop.clone());
        let app_name = app_name.to_string();

        std::thread::spawn(move || {
            let simple = match Simple::new(
                None,
                &app_name,
                Direction::Record,
                device.as_deref(),
                "microphone",
                &mono_f32(rate),
                None,
                None,
            ) {
                Ok(simple) => {
                    let _ = ready_tx.send(Ok(()));
                    simple
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(device_error(e)));
                    return;
                }
            };
            info!(
                "Recording from {} at {} Hz",
                device.as_deref().unwrap_or("default source"),
                rate
            );

            let mut bytes = vec![0u8; CAPTURE_BLOCK * 4];
            while !stop_flag.load(Ordering::Relaxed) {
                if let Err(e) = simple.read(&mut bytes) {
                    error!("Audio capture error: {}", e);
                    break;
                }
                if !capture.push(f32_from_le(&bytes).collect()) {
                    break;
                }
            }
            capture.close();
            info!("Microphone released");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop, buffer }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Backend("capture thread exited".to_string())),
        }
    }
}

impl AudioInput for PulseMicrophone {
    fn read_frame(&self, frame: &mut [f32]) -> Result<(), DeviceError> {
        self.buffer.read(frame, || self.is_stopped())
    }

    fn stop(&self) {
        if !self.stop.swap(true, Ordering::Relaxed) {
            self.buffer.close();
        }
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

struct Voice {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

/// Mixes scheduled buffers onto a frame clock.
pub(crate) struct Mixer {
    rate: u32,
    frames_written: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    pub(crate) fn new(rate: u32) -> Self {
        Self {
            rate,
            frames_written: 0,
            voices: Vec::new(),
        }
    }

    pub(crate) fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub(crate) fn schedule(&mut self, id: SourceId, samples: Vec<f32>, start_at: f64) {
        let start_frame = (start_at.max(0.0) * f64::from(self.rate)).round() as u64;
        self.voices.push(Voice {
            id,
            start_frame: start_frame.max(self.frames_written),
            samples,
        });
    }

    pub(crate) fn stop(&mut self, id: SourceId) {
        self.voices.retain(|v| v.id != id);
    }

    /// Fill `out` with the next period and advance the clock. Returns the
    /// ids of voices that finished inside it.
    pub(crate) fn render(&mut self, out: &mut [f32]) -> SmallVec<[SourceId; 4]> {
        out.fill(0.0);
        let period_start = self.frames_written;
        let period_end = period_start + out.len() as u64;
        let mut finished = SmallVec::new();

        self.voices.retain(|voice| {
            let voice_end = voice.start_frame + voice.samples.len() as u64;
            let from = voice.start_frame.max(period_start);
            let to = voice_end.min(period_end);
            for frame in from..to {
                out[(frame - period_start) as usize] +=
                    voice.samples[(frame - voice.start_frame) as usize];
            }
            if voice_end <= period_end {
                finished.push(voice.id);
                false
            } else {
                true
            }
        });

        self.frames_written = period_end;
        finished
    }
}

enum SpeakerCommand {
    Play {
        id: SourceId,
        samples: Vec<f32>,
        start_at: f64,
    },
    Stop(SourceId),
    Close,
}

/// Playback stream. The thread writes silence between scheduled buffers so
/// the frame clock keeps running. The clock and `ended` follow what has been
/// heard, not what has been written.
pub struct PulseSpeaker {
    rate: u32,
    frames: Arc<AtomicU64>,
    closed: AtomicBool,
    commands: std_mpsc::Sender<SpeakerCommand>,
}

impl PulseSpeaker {
    fn open(
        app_name: &str,
        device: Option<String>,
        rate: u32,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Self, DeviceError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<SpeakerCommand>();
        let frames = Arc::new(AtomicU64::new(0));
        let clock = frames.clone();
        let app_name = app_name.to_string();

        std::thread::spawn(move || {
            let simple = match Simple::new(
                None,
                &app_name,
                Direction::Playback,
                device.as_deref(),
                "assistant voice",
                &mono_f32(rate),
                None,
                Some(&playback_attr(rate)),
            ) {
                Ok(simple) => {
                    let _ = ready_tx.send(Ok(()));
                    simple
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(device_error(e)));
                    return;
                }
            };
            info!("Playback opened at {} Hz", rate);

            let mut mixer = Mixer::new(rate);
            let mut period = vec![0.0f32; (rate * PLAYBACK_PERIOD_MS / 1000) as usize];
            let mut bytes = Vec::with_capacity(period.len() * 4);
            // Rendered voices waiting to be heard, with their end frame
            let mut draining: Vec<(SourceId, u64)> = Vec::new();

            'playback: loop {
                loop {
                    match cmd_rx.try_recv() {
                        Ok(SpeakerCommand::Play {
                            id,
                            samples,
                            start_at,
                        }) => mixer.schedule(id, samples, start_at),
                        Ok(SpeakerCommand::Stop(id)) => mixer.stop(id),
                        Ok(SpeakerCommand::Close) | Err(std_mpsc::TryRecvError::Disconnected) => {
                            break 'playback
                        }
                        Err(std_mpsc::TryRecvError::Empty) => break,
                    }
                }

                let finished = mixer.render(&mut period);
                let written = mixer.frames_written();
                draining.extend(finished.into_iter().map(|id| (id, written)));

                bytes.clear();
                bytes.extend(period.iter().flat_map(|s| s.to_le_bytes()));
                if let Err(e) = simple.write(&bytes) {
                    error!("Audio playback error: {}", e);
                    break;
                }

                let latency = simple.get_latency().map(|l| l.0).unwrap_or(0);
                let played = played_frames(written, latency, rate);
                clock.store(played, Ordering::Relaxed);
                draining.retain(|&(id, end)| {
                    if end <= played {
                        let _ = ended.send(id);
                        false
                    } else {
                        true
                    }
                });
            }

            let _ = simple.flush();
            info!("Playback closed");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                rate,
                frames,
                closed: AtomicBool::new(false),
                commands: cmd_tx,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Backend("playback thread exited".to_string())),
        }
    }
}

impl AudioOutput for PulseSpeaker {
    fn current_time(&self) -> f64 {
        self.frames.load(Ordering::Relaxed) as f64 / f64::from(self.rate)
    }

    fn start(
        &self,
        id: SourceId,
        samples: Vec<f32>,
        sample_rate: u32,
        start_at: f64,
    ) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Stopped);
        }
        if sample_rate != self.rate {
            warn!(
                "Buffer rate {} Hz does not match output rate {} Hz",
                sample_rate, self.rate
            );
        }
        self.commands
            .send(SpeakerCommand::Play {
                id,
                samples,
                start_at,
            })
            .map_err(|_| DeviceError::Stopped)
    }

    fn stop(&self, id: SourceId) {
        let _ = self.commands.send(SpeakerCommand::Stop(id));
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            let _ = self.commands.send(SpeakerCommand::Close);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

impl Drop for PulseSpeaker {
    fn drop(&mut self) {
        self.close();
    }
}

/// List PulseAudio sources (or sinks, for `DeviceType::Speaker`).
pub fn list_devices(device_type: DeviceType) -> Result<Vec<AudioDevice>, DeviceError> {
    let devices = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    let mut proplist =
        Proplist::new().ok_or_else(|| DeviceError::Backend("Failed to create proplist".into()))?;
    proplist
        .set_str(properties::APPLICATION_NAME, "jarvis-device-lister")
        .map_err(|()| DeviceError::Backend("Failed to set proplist".into()))?;

    let mut mainloop =
        Mainloop::new().ok_or_else(|| DeviceError::Backend("Failed to create mainloop".into()))?;
    let mut context = Context::new_with_proplist(&mainloop, "jarvis-context", &proplist)
        .ok_or_else(|| DeviceError::Backend("Failed to create context".into()))?;
    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(device_error)?;

    // Wait for context to be ready
    loop {
        iterate(&mut mainloop)?;
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(DeviceError::Backend("Connection failed".into()));
            }
            _ => {}
        }
    }

    let introspector = context.introspect();
    if device_type == DeviceType::Speaker {
        let (devices, done_flag) = (devices.clone(), done.clone());
        let _op = introspector.get_sink_info_list(move |result| match result {
            ListResult::Item(sink) => {
                if let (Some(name), Some(description)) = (&sink.name, &sink.description) {
                    devices
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(AudioDevice {
                            name: name.to_string(),
                            description: description.to_string(),
                            sample_rate: sink.sample_spec.rate,
                            channels: sink.sample_spec.channels,
                            kind: DeviceType::Speaker,
                        });
                }
            }
            ListResult::End => done_flag.store(true, Ordering::Relaxed),
            ListResult::Error => {
                error!("Error listing audio sinks");
                done_flag.store(true, Ordering::Relaxed);
            }
        });
        wait_for(&mut mainloop, &done)?;
    } else {
        let (devices, done_flag) = (devices.clone(), done.clone());
        let _op = introspector.get_source_info_list(move |result| match result {
            ListResult::Item(source) => {
                let is_monitor = source.monitor_of_sink.is_some()
                    || source
                        .name
                        .as_ref()
                        .is_some_and(|name| name.contains("monitor"));
                let kind = if is_monitor {
                    DeviceType::Monitor
                } else {
                    DeviceType::Microphone
                };
                if device_type != DeviceType::Any && device_type != kind {
                    return;
                }
                if let (Some(name), Some(description)) = (&source.name, &source.description) {
                    devices
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(AudioDevice {
                            name: name.to_string(),
                            description: description.to_string(),
                            sample_rate: source.sample_spec.rate,
                            channels: source.sample_spec.channels,
                            kind,
                        });
                }
            }
            ListResult::End => done_flag.store(true, Ordering::Relaxed),
            ListResult::Error => {
                error!("Error listing audio sources");
                done_flag.store(true, Ordering::Relaxed);
            }
        });
        wait_for(&mut mainloop, &done)?;
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let result = devices.lock().unwrap_or_else(|e| e.into_inner()).clone();
    Ok(result)
}

fn wait_for(mainloop: &mut Mainloop, done: &AtomicBool) -> Result<(), DeviceError> {
    while !done.load(Ordering::Relaxed) {
        iterate(mainloop)?;
    }
    Ok(())
}

fn iterate(mainloop: &mut Mainloop) -> Result<(), DeviceError> {
    match mainloop.iterate(false) {
        IterateResult::Quit(_) | IterateResult::Err(_) => {
            Err(DeviceError::Backend("Mainloop iterate failed".into()))
        }
        IterateResult::Success(_) => Ok(()),
    }
}
