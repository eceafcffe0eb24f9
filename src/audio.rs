use std::collections::VecDeque;

pub const SAMPLE_RATE: u32 = 16_000;
/// Samples per chunk delivered by an audio source (~256 ms at 16 kHz).
pub const CHUNK_SAMPLES: usize = 4096;
pub const WINDOW_CHUNKS: usize = 10;
pub const VAD_THRESHOLD_DB: f32 = -40.0;

/// Most recent audio chunks, oldest first. Never holds more than `capacity` chunks.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    chunks: VecDeque<Vec<f32>>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: Vec<f32>) {
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Concatenates the held chunks in arrival order.
    pub fn flatten(&self) -> Vec<f32> {
        let total = self.chunks.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// RMS energy on a dB scale. Silence (or an empty buffer) is negative infinity.
pub fn decibels(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }
    let energy: f64 = samples.iter().map(|s| f64::from(*s) * f64::from(*s)).sum();
    let rms = (energy / samples.len() as f64).sqrt();
    if rms <= 0.0 || !rms.is_finite() {
        return f32::NEG_INFINITY;
    }
    (20.0 * rms.log10()) as f32
}

pub fn is_loud(samples: &[f32], threshold_db: f32) -> bool {
    decibels(samples) > threshold_db
}

/// A WAV-encoded audio window ready to attach to a model request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    wav: Vec<u8>,
}

impl AudioClip {
    pub fn from_samples(samples: &[f32]) -> Self {
        Self {
            wav: encode_wav(samples, SAMPLE_RATE),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.wav
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.wav
    }
}

/// Voice-activity gate: returns a clip only when the window is loud enough.
pub fn gate(samples: &[f32], threshold_db: f32) -> Option<AudioClip> {
    is_loud(samples, threshold_db).then(|| AudioClip::from_samples(samples))
}

/// Mono 16-bit PCM WAV.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        let s = s.clamp(-1.0, 1.0);
        let v = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
        out.extend_from_slice(&(v as i16).to_le_bytes());
    }
    out
}
