//! Uplink: capture -> wire encoding -> outbound queue.
//!
//! Audio is hardware-clocked and runs on its own thread so a slow network
//! can never stall the capture loop; every send is a non-blocking push into
//! the link's queue. Video is a software timer that snapshots whatever
//! camera is currently bound to the preview surface.

use crate::devices::{AudioInput, DeviceError, VideoFrame, VideoInput};
use crate::transport::OutboundQueue;
use base64::engine::general_purpose;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::error::{ImageError, ParameterError, ParameterErrorKind};
use image::{DynamicImage, ExtendedColorType, RgbaImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Audio,
    Image,
}

/// One unit of uplink data, already in its transport-safe encoding.
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub kind: ChunkKind,
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

impl MediaChunk {
    pub fn pcm(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            kind: ChunkKind::Audio,
            mime_type: format!("audio/pcm;rate={}", sample_rate),
            data: general_purpose::STANDARD.encode(encode_pcm16(samples)),
        }
    }

    pub fn jpeg(bytes: &[u8]) -> Self {
        Self {
            kind: ChunkKind::Image,
            mime_type: "image/jpeg".to_string(),
            data: general_purpose::STANDARD.encode(bytes),
        }
    }
}

/// Float samples to 16-bit little-endian PCM: scale by 32768 and truncate
/// toward zero. Out-of-range input saturates.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * 32768.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Encode an RGBA frame as JPEG at its native resolution.
pub fn encode_jpeg(frame: &VideoFrame, quality: u8) -> Result<Vec<u8>, ImageError> {
    let rgba = RgbaImage::from_raw(frame.width, frame.height, frame.rgba.clone()).ok_or_else(|| {
        ImageError::Parameter(ParameterError::from_kind(
            ParameterErrorKind::DimensionMismatch,
        ))
    })?;
    let rgb = DynamicImage::ImageRgba8(rgba).to_rgb8();

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
    encoder.encode(rgb.as_raw(), frame.width, frame.height, ExtendedColorType::Rgb8)?;
    Ok(jpeg)
}

/// The audio processing node: a capture thread that encodes and queues
/// every frame read from the microphone.
pub struct AudioUplink {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl AudioUplink {
    pub fn spawn(
        mic: Arc<dyn AudioInput>,
        queue: OutboundQueue,
        frame_len: usize,
        sample_rate: u32,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::spawn(move || {
            let mut frame = vec![0.0f32; frame_len.max(1)];
            let mut sent = 0u64;

            while !stop_flag.load(Ordering::Relaxed) {
                match mic.read_frame(&mut frame) {
                    Ok(()) => {}
                    Err(DeviceError::Stopped) => break,
                    Err(e) => {
                        warn!("Microphone read failed: {}", e);
                        break;
                    }
                }
                // Teardown may have begun while we were blocked in the read.
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                if !queue.send(MediaChunk::pcm(&frame, sample_rate)) {
                    debug!("Link gone, stopping audio uplink");
                    break;
                }
                sent += 1;
            }

            info!("Audio uplink stopped after {} chunks", sent);
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop sending. The capture thread exits after its current read.
    pub fn disconnect(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.take();
    }

    pub fn is_connected(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }
}

impl Drop for AudioUplink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Periodic frame sender. Ticks with no frame ready are skipped.
pub struct VideoUplink {
    task: Option<JoinHandle<()>>,
}

impl VideoUplink {
    pub fn spawn(
        preview: watch::Receiver<Option<Arc<dyn VideoInput>>>,
        queue: OutboundQueue,
        period: Duration,
        jpeg_quality: u8,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut frame_id = 0u64;

            loop {
                ticker.tick().await;

                let frame = {
                    let camera = preview.borrow();
                    camera.as_ref().and_then(|c| c.latest_frame())
                };
                let Some(frame) = frame else {
                    continue;
                };

                match encode_jpeg(&frame, jpeg_quality) {
                    Ok(jpeg) => {
                        debug!(
                            "Frame #{}: {}x{} ({} KB)",
                            frame_id,
                            frame.width,
                            frame.height,
                            jpeg.len() / 1024
                        );
                        if !queue.send(MediaChunk::jpeg(&jpeg)) {
                            debug!("Link gone, stopping video uplink");
                            break;
                        }
                        frame_id += 1;
                    }
                    Err(e) => warn!("JPEG conversion error: {}", e),
                }
            }
        });

        Self { task: Some(task) }
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }
}

impl Drop for VideoUplink {
    fn drop(&mut self) {
        self.cancel();
    }
}
