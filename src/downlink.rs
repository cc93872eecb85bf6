//! Downlink: inbound events -> transcript state and gapless playback.

use crate::devices::{AudioOutput, SourceId};
use base64::engine::general_purpose;
use base64::Engine;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Little-endian 16-bit PCM to normalized floats. A trailing odd byte is
/// ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect()
}

/// One completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnPair {
    pub user: String,
    pub ai: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub pending_user: String,
    pub pending_ai: String,
    pub history: Vec<TurnPair>,
}

impl Transcript {
    pub fn push_user(&mut self, text: &str) {
        self.pending_user.push_str(text);
    }

    pub fn push_ai(&mut self, text: &str) {
        self.pending_ai.push_str(text);
    }

    /// Close the turn. Records a history entry only when both sides said
    /// something; the pending buffers are cleared either way.
    pub fn complete_turn(&mut self) -> Option<&TurnPair> {
        let user = std::mem::take(&mut self.pending_user);
        let ai = std::mem::take(&mut self.pending_ai);

        if user.trim().is_empty() || ai.trim().is_empty() {
            return None;
        }
        self.history.push(TurnPair { user, ai });
        self.history.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub start: f64,
    pub duration: f64,
}

/// Schedules decoded audio back to back on the output clock.
///
/// `next_playback_time` only moves forward and every unit starts at
/// `max(next_playback_time, now)`, so units play in arrival order and never
/// overlap.
pub struct Downlink {
    output: Option<Arc<dyn AudioOutput>>,
    sample_rate: u32,
    next_playback_time: f64,
    outstanding: BTreeMap<SourceId, ScheduledSource>,
    next_id: u64,
    transcript: Transcript,
}

impl Downlink {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            output: None,
            sample_rate,
            next_playback_time: 0.0,
            outstanding: BTreeMap::new(),
            next_id: 0,
            transcript: Transcript::default(),
        }
    }

    pub fn attach_output(&mut self, output: Arc<dyn AudioOutput>) {
        self.output = Some(output);
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    pub fn next_playback_time(&self) -> f64 {
        self.next_playback_time
    }

    pub fn outstanding(&self) -> &BTreeMap<SourceId, ScheduledSource> {
        &self.outstanding
    }

    /// Decode a base64 chunk and schedule it. Undecodable chunks and chunks
    /// arriving after shutdown are dropped.
    pub fn schedule_chunk(&mut self, data: &str) -> Option<SourceId> {
        let bytes = match general_purpose::STANDARD.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to decode base64 audio data: {:?}", e);
                return None;
            }
        };
        self.schedule_samples(decode_pcm16(&bytes))
    }

    pub fn schedule_samples(&mut self, samples: Vec<f32>) -> Option<SourceId> {
        if samples.is_empty() {
            return None;
        }
        let output = self.output.as_ref().filter(|o| !o.is_closed())?.clone();

        let start = self.next_playback_time.max(output.current_time());
        let duration = samples.len() as f64 / f64::from(self.sample_rate);
        let id = SourceId(self.next_id);
        self.next_id += 1;

        if let Err(e) = output.start(id, samples, self.sample_rate, start) {
            warn!("Failed to schedule audio: {}", e);
            return None;
        }

        debug!("Scheduled {:?} at {:.3}s for {:.3}s", id, start, duration);
        self.next_playback_time = start + duration;
        self.outstanding.insert(id, ScheduledSource { start, duration });
        Some(id)
    }

    /// Playback of `id` finished.
    pub fn release(&mut self, id: SourceId) {
        self.outstanding.remove(&id);
    }

    /// Stop every outstanding unit and close the output. Safe to repeat.
    pub fn shutdown(&mut self) {
        if let Some(output) = &self.output {
            let stopped = self.outstanding.len();
            for id in self.outstanding.keys() {
                output.stop(*id);
            }
            self.outstanding.clear();
            if !output.is_closed() {
                output.close();
                info!("Audio output closed ({} sources stopped)", stopped);
            }
        } else {
            self.outstanding.clear();
        }
    }
}
