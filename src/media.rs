use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use image::DynamicImage;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::time::{Duration, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audio::{CHUNK_SAMPLES, SAMPLE_RATE};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("device access denied: {0}")]
    Denied(String),
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

/// Live camera track. Frames come back at native resolution.
pub trait VideoSource: Send + Sync {
    fn current_frame(&self) -> Result<DynamicImage, DeviceError>;
    fn stop(&self);
}

/// Microphone stream delivering mono chunks at 16 kHz.
#[async_trait]
pub trait AudioSource: Send {
    async fn next_chunk(&mut self) -> Option<Vec<f32>>;
    fn stop(&mut self);
}

pub struct MediaStreams {
    pub video: Arc<dyn VideoSource>,
    pub audio: Box<dyn AudioSource>,
}

/// Acquires camera and microphone for one session. Failure is fatal to session start.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn open(&self) -> Result<MediaStreams, DeviceError>;
}

/// Re-reads an image file on every capture so an external grabber can keep it fresh.
pub struct StillFrameSource {
    path: PathBuf,
    stopped: AtomicBool,
}

impl StillFrameSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stopped: AtomicBool::new(false),
        }
    }
}

impl VideoSource for StillFrameSource {
    fn current_frame(&self) -> Result<DynamicImage, DeviceError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(DeviceError::Unavailable("video track stopped".into()));
        }
        image::open(&self.path).map_err(|err| {
            DeviceError::Unavailable(format!("no frame at {}: {err}", self.path.display()))
        })
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!(path = %self.path.display(), "video track stopped");
        }
    }
}

/// Emits zeroed chunks at the real-time chunk rate.
pub struct SilenceSource {
    ticker: Interval,
    stopped: bool,
}

impl SilenceSource {
    pub fn new() -> Self {
        let period = Duration::from_millis(CHUNK_SAMPLES as u64 * 1000 / SAMPLE_RATE as u64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            stopped: false,
        }
    }
}

impl Default for SilenceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioSource for SilenceSource {
    async fn next_chunk(&mut self) -> Option<Vec<f32>> {
        if self.stopped {
            return None;
        }
        self.ticker.tick().await;
        Some(vec![0.0; CHUNK_SAMPLES])
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

/// Signed 16-bit little-endian mono PCM, e.g. a FIFO fed by `arecord -f S16_LE -r 16000`.
pub struct PcmStreamSource {
    reader: Option<tokio::fs::File>,
    buf: Vec<u8>,
}

impl PcmStreamSource {
    pub fn new(file: tokio::fs::File) -> Self {
        Self {
            reader: Some(file),
            buf: vec![0; CHUNK_SAMPLES * 2],
        }
    }
}

#[async_trait]
impl AudioSource for PcmStreamSource {
    async fn next_chunk(&mut self) -> Option<Vec<f32>> {
        let reader = self.reader.as_mut()?;
        match reader.read_exact(&mut self.buf).await {
            Ok(_) => Some(
                self.buf
                    .chunks_exact(2)
                    .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
                    .collect(),
            ),
            Err(err) => {
                debug!(error = %err, "pcm stream ended");
                None
            }
        }
    }

    fn stop(&mut self) {
        self.reader = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioInput {
    Silence,
    Pcm(PathBuf),
}

/// Headless device provider backed by files.
#[derive(Debug, Clone)]
pub struct FileMediaProvider {
    pub frame_path: PathBuf,
    pub audio: AudioInput,
}

#[async_trait]
impl MediaProvider for FileMediaProvider {
    async fn open(&self) -> Result<MediaStreams, DeviceError> {
        if tokio::fs::metadata(&self.frame_path).await.is_err() {
            return Err(DeviceError::Unavailable(format!(
                "camera frame file {} not found",
                self.frame_path.display()
            )));
        }
        let audio: Box<dyn AudioSource> = match &self.audio {
            AudioInput::Silence => Box::new(SilenceSource::new()),
            AudioInput::Pcm(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|err| {
                    warn!(path = %path.display(), error = %err, "microphone stream unavailable");
                    DeviceError::Denied(format!("{}: {err}", path.display()))
                })?;
                Box::new(PcmStreamSource::new(file))
            }
        };
        info!(frame = %self.frame_path.display(), audio = ?self.audio, "media devices opened");
        Ok(MediaStreams {
            video: Arc::new(StillFrameSource::new(self.frame_path.clone())),
            audio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_frame_file_is_unavailable() {
        let dir = tempdir().unwrap();
        let provider = FileMediaProvider {
            frame_path: dir.path().join("nope.png"),
            audio: AudioInput::Silence,
        };
        let err = provider.open().await.err().unwrap();
        assert!(matches!(err, DeviceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn missing_pcm_stream_is_denied() {
        let dir = tempdir().unwrap();
        let frame = dir.path().join("frame.png");
        image::RgbImage::new(4, 3).save(&frame).unwrap();
        let provider = FileMediaProvider {
            frame_path: frame,
            audio: AudioInput::Pcm(dir.path().join("mic.raw")),
        };
        let err = provider.open().await.err().unwrap();
        assert!(matches!(err, DeviceError::Denied(_)));
    }

    #[tokio::test]
    async fn still_frame_reads_file_until_stopped() {
        let dir = tempdir().unwrap();
        let frame = dir.path().join("frame.png");
        image::RgbImage::new(64, 48).save(&frame).unwrap();
        let source = StillFrameSource::new(&frame);
        let img = source.current_frame().unwrap();
        assert_eq!((img.width(), img.height()), (64, 48));
        source.stop();
        source.stop();
        assert!(source.current_frame().is_err());
    }

    #[tokio::test]
    async fn pcm_stream_yields_whole_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mic.raw");
        let mut bytes = Vec::new();
        for _ in 0..CHUNK_SAMPLES + 10 {
            bytes.extend_from_slice(&16384i16.to_le_bytes());
        }
        std::fs::write(&path, bytes).unwrap();
        let mut source = PcmStreamSource::new(tokio::fs::File::open(&path).await.unwrap());
        let chunk = source.next_chunk().await.unwrap();
        assert_eq!(chunk.len(), CHUNK_SAMPLES);
        assert_eq!(chunk[0], 0.5);
        // the 10-sample tail is not a whole chunk
        assert!(source.next_chunk().await.is_none());
        source.stop();
        assert!(source.next_chunk().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_paced_and_stoppable() {
        let mut source = SilenceSource::new();
        let started = tokio::time::Instant::now();
        source.next_chunk().await.unwrap();
        let chunk = source.next_chunk().await.unwrap();
        assert!(chunk.iter().all(|s| *s == 0.0));
        assert_eq!(started.elapsed(), Duration::from_millis(256));
        source.stop();
        assert!(source.next_chunk().await.is_none());

        let mut fresh = SilenceSource::default();
        assert_eq!(fresh.next_chunk().await.unwrap().len(), CHUNK_SAMPLES);
    }
}
