//! Session controller.
//!
//! A `LiveSession` owns every resource of one conversation: the capture
//! handles, the preview binding, the output device, the link and both
//! uplinks. All of it is mutated from a single task, and every exit path
//! funnels into [`LiveSession::teardown`].

use crate::config::LiveConfig;
use crate::devices::{
    AudioDevices, AudioInput, DeviceError, DeviceKind, FacingMode, PreviewSurface, SourceId,
    VideoDevices, VideoInput,
};
use crate::downlink::{Downlink, TurnPair};
use crate::error::{LiveError, Result};
use crate::transport::{Connector, InboundEvent, OutboundQueue, Status};
use crate::uplink::{AudioUplink, VideoUplink};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const CAMERA_SWITCH_FAILED: &str = "Failed to switch camera. Please check permissions.";

/// Actions the host UI can request while a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    SwitchCamera,
    Close,
}

/// What the host UI renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub status: Status,
    pub facing: FacingMode,
    pub error: Option<String>,
    pub pending_user: String,
    pub pending_ai: String,
    pub history: Vec<TurnPair>,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub status: Status,
    pub error: Option<LiveError>,
    pub history: Vec<TurnPair>,
}

impl SessionOutcome {
    /// The session failed only because the credential was rejected.
    pub fn needs_new_credential(&self) -> bool {
        self.error.as_ref().is_some_and(LiveError::is_recoverable)
    }
}

pub struct LiveSession {
    config: LiveConfig,
    audio: Arc<dyn AudioDevices>,
    video: Arc<dyn VideoDevices>,
    connector: Arc<dyn Connector>,

    status: Status,
    facing: FacingMode,
    error: Option<LiveError>,
    /// Non-fatal message shown next to the status
    notice: Option<String>,
    view: watch::Sender<SessionView>,

    preview: PreviewSurface,
    mic: Option<Arc<dyn AudioInput>>,
    camera: Option<Arc<dyn VideoInput>>,
    outbound: Option<OutboundQueue>,
    inbound: Option<mpsc::UnboundedReceiver<InboundEvent>>,
    ended: Option<mpsc::UnboundedReceiver<SourceId>>,
    audio_uplink: Option<AudioUplink>,
    video_uplink: Option<VideoUplink>,
    downlink: Downlink,

    started: bool,
    torn_down: bool,
}

impl LiveSession {
    pub fn new(
        config: LiveConfig,
        audio: Arc<dyn AudioDevices>,
        video: Arc<dyn VideoDevices>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let facing = config.initial_facing;
        let (view, _) = watch::channel(SessionView {
            status: Status::Connecting,
            facing,
            error: None,
            pending_user: String::new(),
            pending_ai: String::new(),
            history: Vec::new(),
        });
        let downlink = Downlink::new(config.output_sample_rate);

        Self {
            config,
            audio,
            video,
            connector,
            status: Status::Connecting,
            facing,
            error: None,
            notice: None,
            view,
            preview: PreviewSurface::new(),
            mic: None,
            camera: None,
            outbound: None,
            inbound: None,
            ended: None,
            audio_uplink: None,
            video_uplink: None,
            downlink,
            started: false,
            torn_down: false,
        }
    }

    pub fn view(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn facing(&self) -> FacingMode {
        self.facing
    }

    pub fn error(&self) -> Option<&LiveError> {
        self.error.as_ref()
    }

    pub fn preview(&self) -> &PreviewSurface {
        &self.preview
    }

    /// Acquire devices in order and open the link. On failure the session
    /// is left in `Error` with everything acquired so far released.
    pub fn start(&mut self) -> Result<()> {
        if self.started || self.torn_down {
            return Err(LiveError::Config("session was already started".to_string()));
        }
        self.started = true;

        match self.acquire_and_connect() {
            Ok(()) => {
                self.publish();
                Ok(())
            }
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    fn acquire_and_connect(&mut self) -> Result<()> {
        info!("Starting live session (camera: {})", self.facing);

        let mic = self
            .audio
            .open_microphone(self.config.input_sample_rate)
            .map_err(|e| LiveError::from_device(DeviceKind::Microphone, e))?;
        self.mic = Some(mic);

        let camera = self
            .video
            .open_camera(self.facing)
            .map_err(|e| LiveError::from_device(DeviceKind::Camera, e))?;
        self.preview.bind(camera.clone());
        self.camera = Some(camera);

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let speaker = self
            .audio
            .open_speaker(self.config.output_sample_rate, ended_tx)
            .map_err(|e| LiveError::from_device(DeviceKind::Speaker, e))?;
        self.downlink.attach_output(speaker);
        self.ended = Some(ended_rx);

        let link = self.connector.open()?;
        self.outbound = Some(link.outbound);
        self.inbound = Some(link.inbound);
        debug!("Link requested, waiting for the remote end");
        Ok(())
    }

    /// Drive the session until it reaches a terminal state.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<SessionCommand>) -> SessionOutcome {
        let (Some(mut inbound), Some(mut ended)) = (self.inbound.take(), self.ended.take()) else {
            self.teardown();
            return self.outcome();
        };

        while !self.status.is_terminal() && !self.torn_down {
            tokio::select! {
                event = inbound.recv() => {
                    self.handle_event(event.unwrap_or(InboundEvent::Closed));
                }
                Some(id) = ended.recv() => {
                    self.downlink.release(id);
                }
                command = commands.recv() => match command {
                    Some(SessionCommand::SwitchCamera) => {
                        let _ = self.switch_camera().await;
                    }
                    Some(SessionCommand::Close) | None => self.close(),
                },
            }
        }

        self.teardown();
        self.outcome()
    }

    /// Apply one inbound event.
    pub fn handle_event(&mut self, event: InboundEvent) {
        if self.status.is_terminal() {
            debug!("Ignoring {:?} after session end", event);
            return;
        }
        let next = self.status.on_event(&event);

        match event {
            InboundEvent::Opened => {
                if self.status == Status::Connecting {
                    self.status = next;
                    info!("Session is {}", self.status);
                    self.wire_uplinks();
                }
            }
            InboundEvent::UserTranscript(text) => self.downlink.transcript_mut().push_user(&text),
            InboundEvent::ModelTranscript(text) => self.downlink.transcript_mut().push_ai(&text),
            InboundEvent::AudioChunk(data) => {
                self.downlink.schedule_chunk(&data);
                return;
            }
            InboundEvent::TurnComplete => {
                if let Some(turn) = self.downlink.transcript_mut().complete_turn() {
                    info!("Turn complete: user={:?} ai={:?}", turn.user, turn.ai);
                }
            }
            InboundEvent::Error(message) => {
                self.fail(LiveError::from_remote(message));
                return;
            }
            InboundEvent::Closed => {
                if next == Status::Error {
                    self.fail(LiveError::ConnectionClosed);
                    return;
                }
                info!("Remote closed the session");
                self.status = next;
                self.teardown();
            }
        }

        self.publish();
    }

    /// Audio first, then the frame timer.
    fn wire_uplinks(&mut self) {
        let Some(outbound) = self.outbound.clone() else {
            return;
        };

        if self.audio_uplink.is_none() {
            if let Some(mic) = &self.mic {
                self.audio_uplink = Some(AudioUplink::spawn(
                    mic.clone(),
                    outbound.clone(),
                    self.config.audio_frame_len,
                    self.config.input_sample_rate,
                ));
            }
        }
        if self.video_uplink.is_none() {
            self.video_uplink = Some(VideoUplink::spawn(
                self.preview.subscribe(),
                outbound,
                self.config.video_interval(),
                self.config.jpeg_quality,
            ));
        }
    }

    /// Swap to the other camera. The link and the audio path are left alone;
    /// the video uplink picks up the new camera through the preview. The
    /// device open runs on the blocking pool.
    pub async fn switch_camera(&mut self) -> Result<FacingMode> {
        if !self.started || self.torn_down {
            return Err(LiveError::Config("no active session".to_string()));
        }

        let next = self.facing.toggled();
        info!("Switching camera: {} -> {}", self.facing, next);

        if let Some(old) = self.camera.take() {
            old.stop();
        }
        self.preview.clear();

        let video = self.video.clone();
        let opened = tokio::task::spawn_blocking(move || video.open_camera(next))
            .await
            .unwrap_or_else(|e| Err(DeviceError::Backend(e.to_string())));

        match opened {
            Ok(camera) => {
                self.preview.bind(camera.clone());
                self.camera = Some(camera);
                self.facing = next;
                self.notice = None;
                self.publish();
                Ok(next)
            }
            Err(e) => {
                warn!("Error switching camera: {}", e);
                self.notice = Some(CAMERA_SWITCH_FAILED.to_string());
                self.publish();
                Err(LiveError::from_device(DeviceKind::Camera, e))
            }
        }
    }

    /// End the conversation on the user's request.
    pub fn close(&mut self) {
        info!("Ending conversation");
        self.teardown();
        self.publish();
    }

    /// Release everything. Safe to call any number of times, in any state.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if !self.status.is_terminal() {
            self.status = Status::Done;
        }
        info!("Tearing down session ({})", self.status);

        if let Some(mut video) = self.video_uplink.take() {
            video.cancel();
        }
        if let Some(outbound) = self.outbound.take() {
            outbound.close();
        }
        if let Some(mic) = self.mic.take() {
            mic.stop();
        }
        if let Some(camera) = self.camera.take() {
            camera.stop();
        }
        self.preview.clear();
        if let Some(mut audio) = self.audio_uplink.take() {
            audio.disconnect();
        }
        self.downlink.shutdown();
        self.inbound = None;
        self.ended = None;

        self.publish();
    }

    fn fail(&mut self, err: LiveError) {
        error!("Session error: {}", err);
        self.status = Status::Error;
        self.error = Some(err);
        self.teardown();
        self.publish();
    }

    fn outcome(&self) -> SessionOutcome {
        SessionOutcome {
            status: self.status,
            error: self.error.clone(),
            history: self.downlink.transcript().history.clone(),
        }
    }

    fn publish(&self) {
        let transcript = self.downlink.transcript();
        self.view.send_replace(SessionView {
            status: self.status,
            facing: self.facing,
            error: self
                .error
                .as_ref()
                .map(|e| e.to_string())
                .or_else(|| self.notice.clone()),
            pending_user: transcript.pending_user.clone(),
            pending_ai: transcript.pending_ai.clone(),
            history: transcript.history.clone(),
        });
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{CallLog, FakeConnector, FakeDevices, FakeRemote};
    use crate::transport::Outbound;
    use crate::uplink::ChunkKind;
    use base64::engine::general_purpose;
    use base64::Engine;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::timeout;

    struct Harness {
        log: CallLog,
        devices: Arc<FakeDevices>,
        connector: Arc<FakeConnector>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(|d| d, |c| c)
        }

        fn with(
            devices: impl FnOnce(FakeDevices) -> FakeDevices,
            connector: impl FnOnce(FakeConnector) -> FakeConnector,
        ) -> Self {
            let log = CallLog::default();
            Self {
                devices: Arc::new(devices(FakeDevices::new(log.clone()))),
                connector: Arc::new(connector(FakeConnector::new(log.clone()))),
                log,
            }
        }

        fn session(&self) -> LiveSession {
            let config = LiveConfig {
                api_key: "test-key".to_string(),
                audio_frame_len: 32,
                video_fps: 100,
                ..Default::default()
            };
            LiveSession::new(
                config,
                self.devices.clone(),
                self.devices.clone(),
                self.connector.clone(),
            )
        }

        fn calls(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    async fn next_chunk(remote: &mut FakeRemote, kind: ChunkKind) -> crate::uplink::MediaChunk {
        timeout(Duration::from_secs(2), async {
            loop {
                match remote.outbound.recv().await {
                    Some(Outbound::Chunk(chunk)) if chunk.kind == kind => return chunk,
                    Some(_) => continue,
                    None => panic!("link closed"),
                }
            }
        })
        .await
        .expect("no chunk arrived")
    }

    fn pcm_base64(len: usize) -> String {
        general_purpose::STANDARD.encode(vec![0u8; len * 2])
    }

    fn uplinks_idle(session: &LiveSession) -> bool {
        session.audio_uplink.is_none() && session.video_uplink.is_none()
    }

    /// Drain the outbound side and report how it ended.
    fn drain(remote: &mut FakeRemote) -> (Vec<Outbound>, TryRecvError) {
        let mut seen = Vec::new();
        loop {
            match remote.outbound.try_recv() {
                Ok(out) => seen.push(out),
                Err(e) => return (seen, e),
            }
        }
    }

    #[tokio::test]
    async fn startup_acquires_in_order_and_waits_for_open() {
        let h = Harness::new();
        let mut session = h.session();
        session.start().unwrap();

        assert_eq!(h.calls(), vec!["microphone", "camera", "speaker", "transport"]);
        assert_eq!(session.status(), Status::Connecting);
        assert_eq!(session.preview().facing(), Some(FacingMode::Front));

        // Nothing goes up before the remote end acknowledges.
        let mut remote = h.connector.take_remote();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(remote.outbound.try_recv().is_err());
        assert_eq!(h.devices.mic(0).reads(), 0);

        session.handle_event(InboundEvent::Opened);
        assert_eq!(session.status(), Status::Live);
        assert_eq!(session.view().borrow().status, Status::Live);

        let audio = next_chunk(&mut remote, ChunkKind::Audio).await;
        assert_eq!(audio.mime_type, "audio/pcm;rate=16000");
        let image = next_chunk(&mut remote, ChunkKind::Image).await;
        assert_eq!(image.mime_type, "image/jpeg");
    }

    #[tokio::test]
    async fn denied_camera_never_opens_the_transport() {
        let h = Harness::with(|d| d.failing_camera(DeviceError::PermissionDenied), |c| c);
        let mut session = h.session();

        let err = session.start().unwrap_err();
        assert_eq!(err, LiveError::PermissionDenied { device: DeviceKind::Camera });
        assert_eq!(session.status(), Status::Error);
        assert_eq!(h.connector.opens(), 0);
        assert_eq!(h.calls(), vec!["microphone", "camera"]);
        assert!(h.devices.all_released());
        assert!(uplinks_idle(&session));
        assert_eq!(h.devices.mic(0).reads(), 0);
        assert_eq!(
            session.view().borrow().error.as_deref(),
            Some("Camera access was denied. Please allow camera permissions and try again.")
        );
    }

    #[tokio::test]
    async fn missing_microphone_stops_before_the_camera() {
        let h = Harness::with(|d| d.failing_microphone(DeviceError::NotFound), |c| c);
        let mut session = h.session();

        assert!(matches!(
            session.start(),
            Err(LiveError::DeviceNotFound { device: DeviceKind::Microphone })
        ));
        assert_eq!(h.calls(), vec!["microphone"]);
        assert_eq!(h.connector.opens(), 0);
    }

    #[tokio::test]
    async fn transport_open_failure_releases_devices() {
        let h = Harness::with(|d| d, |c| c.failing());
        let mut session = h.session();

        assert!(session.start().is_err());
        assert_eq!(session.status(), Status::Error);
        assert!(h.devices.all_released());
        assert_eq!(h.devices.speaker(0).close_calls(), 1);

        assert!(uplinks_idle(&session));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.devices.mic(0).reads(), 0);
        assert_eq!(h.devices.camera(0).frames_taken(), 0);
    }

    #[tokio::test]
    async fn teardown_while_connecting_releases_everything() {
        let h = Harness::new();
        let mut session = h.session();
        session.start().unwrap();
        let mut remote = h.connector.take_remote();

        session.teardown();
        assert_eq!(session.status(), Status::Done);
        assert!(h.devices.all_released());
        assert!(uplinks_idle(&session));

        // A late acknowledgement must not wire anything up.
        session.handle_event(InboundEvent::Opened);
        assert_eq!(session.status(), Status::Done);
        assert!(uplinks_idle(&session));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let (seen, end) = drain(&mut remote);
        assert!(matches!(seen.as_slice(), [Outbound::Close]));
        assert_eq!(end, TryRecvError::Disconnected);
        assert_eq!(h.devices.mic(0).reads(), 0);
        assert_eq!(h.devices.camera(0).frames_taken(), 0);
    }

    #[tokio::test]
    async fn teardown_stops_the_frame_timer_and_the_audio_node() {
        let h = Harness::new();
        let mut session = h.session();
        session.start().unwrap();
        let mut remote = h.connector.take_remote();
        session.handle_event(InboundEvent::Opened);
        next_chunk(&mut remote, ChunkKind::Audio).await;
        next_chunk(&mut remote, ChunkKind::Image).await;

        session.teardown();
        assert!(uplinks_idle(&session));

        // Several video periods: a live timer or capture thread would still
        // hold the queue and keep sending.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let (seen, end) = drain(&mut remote);
        assert!(seen.iter().any(|out| matches!(out, Outbound::Close)));
        assert_eq!(end, TryRecvError::Disconnected);

        let reads = h.devices.mic(0).reads();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.devices.mic(0).reads(), reads);
    }

    #[tokio::test]
    async fn teardown_before_start_is_harmless() {
        let h = Harness::new();
        let mut session = h.session();
        for _ in 0..3 {
            session.teardown();
        }
        assert_eq!(session.status(), Status::Done);
        assert!(h.calls().is_empty());
        assert!(session.start().is_err());
    }

    #[tokio::test]
    async fn repeated_teardown_matches_single_teardown() {
        let h = Harness::new();
        let mut session = h.session();
        session.start().unwrap();
        let mut remote = h.connector.take_remote();
        session.handle_event(InboundEvent::Opened);
        session.handle_event(InboundEvent::AudioChunk(pcm_base64(2400)));
        session.handle_event(InboundEvent::AudioChunk(pcm_base64(2400)));

        for _ in 0..3 {
            session.teardown();
        }

        assert!(h.devices.all_released());
        let speaker = h.devices.speaker(0);
        assert_eq!(speaker.close_calls(), 1);
        assert_eq!(speaker.stopped(), vec![SourceId(0), SourceId(1)]);
        assert!(session.preview().facing().is_none());
        assert_eq!(session.status(), Status::Done);

        let saw_close = timeout(Duration::from_secs(2), async {
            while let Some(out) = remote.outbound.recv().await {
                if matches!(out, Outbound::Close) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(saw_close);
    }

    #[tokio::test]
    async fn camera_switch_keeps_one_camera_and_the_link() {
        let h = Harness::new();
        let mut session = h.session();
        session.start().unwrap();
        let mut remote = h.connector.take_remote();
        session.handle_event(InboundEvent::Opened);
        next_chunk(&mut remote, ChunkKind::Image).await;
        assert_eq!(h.devices.open_cameras(), 1);

        assert_eq!(session.switch_camera().await.unwrap(), FacingMode::Rear);
        assert_eq!(h.devices.open_cameras(), 1);
        assert!(h.devices.camera(0).is_stopped());
        assert_eq!(session.status(), Status::Live);
        assert_eq!(session.view().borrow().facing, FacingMode::Rear);
        assert_eq!(h.connector.opens(), 1);

        while remote.outbound.try_recv().is_ok() {}
        let chunk = next_chunk(&mut remote, ChunkKind::Image).await;
        let jpeg = general_purpose::STANDARD.decode(&chunk.data).unwrap();
        let frame = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        // Rear fake frames are light grey, front ones dark.
        assert!(frame.get_pixel(0, 0)[0] > 128);
    }

    #[tokio::test]
    async fn camera_switch_does_not_stall_the_runtime() {
        let h = Harness::with(|d| d.slow_camera(Duration::from_millis(100)), |c| c);
        let mut session = h.session();
        session.start().unwrap();
        session.handle_event(InboundEvent::Opened);

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(session.switch_camera().await.unwrap(), FacingMode::Rear);
        ticker.abort();
        assert!(ticks.load(Ordering::SeqCst) >= 5);
        assert_eq!(h.devices.open_cameras(), 1);
    }

    #[tokio::test]
    async fn failed_camera_switch_reports_without_ending() {
        let h = Harness::with(|d| d.camera_limit(1), |c| c);
        let mut session = h.session();
        session.start().unwrap();
        session.handle_event(InboundEvent::Opened);

        assert!(session.switch_camera().await.is_err());
        assert_eq!(session.status(), Status::Live);
        assert_eq!(session.facing(), FacingMode::Front);
        assert_eq!(h.devices.open_cameras(), 0);
        assert_eq!(
            session.view().borrow().error.as_deref(),
            Some(CAMERA_SWITCH_FAILED)
        );
    }

    #[tokio::test]
    async fn turn_complete_uses_fragments_from_the_same_message() {
        let h = Harness::new();
        let mut session = h.session();
        session.start().unwrap();
        session.handle_event(InboundEvent::Opened);

        session.handle_event(InboundEvent::UserTranscript("what time".into()));
        session.handle_event(InboundEvent::UserTranscript(" is it".into()));
        assert_eq!(session.view().borrow().pending_user, "what time is it");

        session.handle_event(InboundEvent::ModelTranscript("noon".into()));
        session.handle_event(InboundEvent::TurnComplete);
        session.handle_event(InboundEvent::ModelTranscript("unprompted".into()));
        session.handle_event(InboundEvent::TurnComplete);

        let view = session.view().borrow().clone();
        assert_eq!(
            view.history,
            vec![TurnPair {
                user: "what time is it".into(),
                ai: "noon".into()
            }]
        );
        assert!(view.pending_user.is_empty());
        assert!(view.pending_ai.is_empty());
    }

    #[tokio::test]
    async fn remote_close_ends_cleanly() {
        let h = Harness::new();
        let mut session = h.session();
        session.start().unwrap();
        let remote = h.connector.take_remote();
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);

        remote.events.send(InboundEvent::Opened).unwrap();
        remote.events.send(InboundEvent::UserTranscript("hi".into())).unwrap();
        remote.events.send(InboundEvent::ModelTranscript("hello".into())).unwrap();
        remote.events.send(InboundEvent::TurnComplete).unwrap();
        remote.events.send(InboundEvent::Closed).unwrap();

        let outcome = timeout(Duration::from_secs(2), session.run(cmd_rx)).await.unwrap();
        assert_eq!(outcome.status, Status::Done);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.history.len(), 1);
        assert!(h.devices.all_released());
    }

    #[tokio::test]
    async fn close_before_open_is_an_error() {
        let h = Harness::new();
        let mut session = h.session();
        session.start().unwrap();
        let remote = h.connector.take_remote();
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);

        drop(remote);
        let outcome = timeout(Duration::from_secs(2), session.run(cmd_rx)).await.unwrap();
        assert_eq!(outcome.status, Status::Error);
        assert_eq!(outcome.error, Some(LiveError::ConnectionClosed));
    }

    #[tokio::test]
    async fn user_close_command_ends_the_session() {
        let h = Harness::new();
        let mut session = h.session();
        session.start().unwrap();
        let remote = h.connector.take_remote();
        let (cmd_tx, cmd_rx) = mpsc::channel(4);

        remote.events.send(InboundEvent::Opened).unwrap();
        cmd_tx.send(SessionCommand::SwitchCamera).await.unwrap();
        cmd_tx.send(SessionCommand::Close).await.unwrap();

        let outcome = timeout(Duration::from_secs(2), session.run(cmd_rx)).await.unwrap();
        assert_eq!(outcome.status, Status::Done);
        assert_eq!(session.facing(), FacingMode::Rear);
        assert!(h.devices.all_released());
    }

    #[tokio::test]
    async fn rejected_credential_allows_a_clean_retry() {
        let h = Harness::new();
        let mut first = h.session();
        first.start().unwrap();
        let remote = h.connector.take_remote();
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);

        remote.events.send(InboundEvent::Opened).unwrap();
        remote
            .events
            .send(InboundEvent::Error("Requested entity was not found.".into()))
            .unwrap();

        let outcome = timeout(Duration::from_secs(2), first.run(cmd_rx)).await.unwrap();
        assert_eq!(outcome.status, Status::Error);
        assert!(outcome.needs_new_credential());
        assert!(h.devices.all_released());

        first.teardown();
        assert_eq!(h.devices.speaker(0).close_calls(), 1);

        let mut second = h.session();
        second.start().unwrap();
        second.handle_event(InboundEvent::Opened);
        assert_eq!(second.status(), Status::Live);
        assert_eq!(h.connector.opens(), 2);
        assert_eq!(h.devices.open_cameras(), 1);
    }

    #[tokio::test]
    async fn generic_remote_error_is_fatal() {
        let h = Harness::new();
        let mut session = h.session();
        session.start().unwrap();
        session.handle_event(InboundEvent::Opened);
        session.handle_event(InboundEvent::Error("Internal error encountered.".into()));

        assert_eq!(session.status(), Status::Error);
        assert!(!session.error().unwrap().is_recoverable());
        assert_eq!(
            session.view().borrow().error.as_deref(),
            Some("An API error occurred (Internal error encountered.). The session has ended.")
        );

        // Late events are ignored.
        session.handle_event(InboundEvent::UserTranscript("late".into()));
        assert!(session.view().borrow().pending_user.is_empty());
    }
}
