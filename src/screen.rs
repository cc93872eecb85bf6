//! Screen-backed video source.
//!
//! Uses `xcap`'s monitor video recorder as the camera: the primary monitor
//! plays the front camera, the first secondary monitor the rear one.

use crate::devices::{DeviceError, FacingMode, VideoDevices, VideoFrame, VideoInput};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use xcap::Monitor;

#[derive(Debug, Clone)]
struct MonitorInfo {
    name: String,
    width: u32,
    height: u32,
    is_primary: bool,
}

/// Pick the monitor standing in for `facing`.
fn select_monitor(facing: FacingMode) -> Result<Monitor, DeviceError> {
    let monitors = Monitor::all().map_err(|e| DeviceError::Backend(e.to_string()))?;
    if monitors.is_empty() {
        return Err(DeviceError::NotFound);
    }

    let is_primary = |m: &Monitor| m.is_primary().unwrap_or(false);
    let chosen = match facing {
        FacingMode::Front => monitors
            .iter()
            .find(|m| is_primary(*m))
            .or_else(|| monitors.first()),
        FacingMode::Rear => monitors.iter().find(|m| !is_primary(*m)),
    };
    chosen.cloned().ok_or(DeviceError::NotFound)
}

fn monitor_info(monitor: &Monitor) -> MonitorInfo {
    MonitorInfo {
        name: monitor.name().unwrap_or_else(|_| "Unknown".to_string()),
        width: monitor.width().unwrap_or(0),
        height: monitor.height().unwrap_or(0),
        is_primary: monitor.is_primary().unwrap_or(false),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScreenCameras;

impl ScreenCameras {
    pub fn new() -> Self {
        Self
    }
}

impl VideoDevices for ScreenCameras {
    fn open_camera(&self, facing: FacingMode) -> Result<Arc<dyn VideoInput>, DeviceError> {
        Ok(Arc::new(ScreenCamera::open(facing)?))
    }
}

/// One running monitor recorder. A background thread keeps the most recent
/// frame; readers only ever copy it.
pub struct ScreenCamera {
    facing: FacingMode,
    latest: Arc<Mutex<Option<VideoFrame>>>,
    stop: Arc<AtomicBool>,
}

impl ScreenCamera {
    fn open(facing: FacingMode) -> Result<Self, DeviceError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let latest = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let (slot, stop_flag) = (latest.clone(), stop.clone());

        // The recorder stays on the thread that created it.
        std::thread::spawn(move || {
            let started = select_monitor(facing).and_then(|monitor| {
                let info = monitor_info(&monitor);
                info!(
                    "Using monitor: {} ({}x{}, primary: {}) as {} camera",
                    info.name, info.width, info.height, info.is_primary, facing
                );
                let (recorder, frames) = monitor
                    .video_recorder()
                    .map_err(|e| DeviceError::Backend(e.to_string()))?;
                recorder
                    .start()
                    .map_err(|e| DeviceError::Backend(e.to_string()))?;
                Ok((recorder, frames))
            });

            let (recorder, frames) = match started {
                Ok(pair) => {
                    let _ = ready_tx.send(Ok(()));
                    pair
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            while !stop_flag.load(Ordering::Relaxed) {
                match frames.recv_timeout(Duration::from_millis(500)) {
                    Ok(frame) => {
                        *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(VideoFrame {
                            width: frame.width,
                            height: frame.height,
                            rgba: frame.raw,
                        });
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("Screen recorder stopped producing frames");
                        break;
                    }
                }
            }

            if let Err(e) = recorder.stop() {
                error!("Failed to stop screen recorder: {}", e);
            }
            info!("{} camera released", facing);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                facing,
                latest,
                stop,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Backend("capture thread exited".to_string())),
        }
    }
}

impl VideoInput for ScreenCamera {
    fn facing(&self) -> FacingMode {
        self.facing
    }

    fn latest_frame(&self) -> Option<VideoFrame> {
        if self.is_stopped() {
            return None;
        }
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn stop(&self) {
        if !self.stop.swap(true, Ordering::Relaxed) {
            self.latest.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

impl Drop for ScreenCamera {
    fn drop(&mut self) {
        self.stop();
    }
}
