//! Receiver pipeline.
//!
//! Syncs clocks with the sender, then turns every frame envelope back into an
//! image and logs one metrics row for it. Frames that fail anywhere along the
//! way are dropped and counted; the session ends on idle timeout or when the
//! connection closes.

pub mod record;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::clock::{self, ClockOffset, SyncOutcome, SyncSettings};
use crate::codec;
use crate::crypto::{decrypt_frame, FrameKey, NONCE_LEN};
use crate::metrics::{bitrate_mbit_s, MetricsRecorder, MetricsRow};
use crate::protocol::{FrameMessage, Resolution, WireMessage};
use crate::transport::Transport;

pub use record::{FrameSink, JpegSequenceRecorder};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SYNC_RETRY: Duration = Duration::from_millis(500);

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Why a single frame was dropped
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid capture timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("encrypted payload too short ({0} bytes)")]
    Truncated(usize),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// How a receive session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Nothing arrived within the idle timeout
    IdleTimeout,
    /// The relay or the peer closed the connection
    TransportClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveReport {
    pub rows: u64,
    pub discarded: u64,
    pub end: SessionEnd,
    /// None when the session ended before any sync reply or frame
    pub offset: Option<ClockOffset>,
}

pub struct ReceiverConfig {
    pub key: FrameKey,
    pub idle_timeout: Duration,
    pub sync_retry: Duration,
    pub measure_turnaround: bool,
    /// Resize decoded frames to this before recording
    pub display_resolution: Option<Resolution>,
}

impl ReceiverConfig {
    pub fn new(key: FrameKey) -> Self {
        Self {
            key,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sync_retry: DEFAULT_SYNC_RETRY,
            measure_turnaround: false,
            display_resolution: None,
        }
    }
}

/// Frames-per-second over tumbling one-second windows.
///
/// Reports the count of the last closed window; 0 until the first one closes.
/// The frame that closes a window is counted in it.
#[derive(Debug)]
pub struct FpsWindow {
    window_start: Instant,
    count: u32,
    current: u32,
}

impl FpsWindow {
    pub fn new(start: Instant) -> Self {
        Self {
            window_start: start,
            count: 0,
            current: 0,
        }
    }

    /// Count one frame arriving at `now`; returns the fps to report for it
    pub fn tick(&mut self, now: Instant) -> u32 {
        self.count += 1;
        if now.duration_since(self.window_start) >= FPS_WINDOW {
            self.current = self.count;
            self.count = 0;
            self.window_start = now;
            debug!("📈 {} fps", self.current);
        }
        self.current
    }
}

pub struct Receiver {
    config: ReceiverConfig,
    sink: Option<Box<dyn FrameSink + Send>>,
    fps: FpsWindow,
    offset: ClockOffset,
    rows: u64,
    discarded: u64,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            sink: None,
            fps: FpsWindow::new(Instant::now()),
            offset: ClockOffset::default(),
            rows: 0,
            discarded: 0,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn FrameSink + Send>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run one session: sync, then stream until idle timeout or close.
    ///
    /// The recording sink is finished and the metrics log flushed on every
    /// exit path, including transport and log errors.
    pub async fn run<T: Transport>(&mut self, transport: &mut T, recorder: &mut MetricsRecorder) -> Result<ReceiveReport> {
        let session = self.session(transport, recorder).await;

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.finish() {
                warn!("Failed to finish recording: {:#}", e);
            }
        }
        let flushed = recorder.flush();

        let (end, offset) = session?;
        flushed?;

        let report = ReceiveReport {
            rows: self.rows,
            discarded: self.discarded,
            end,
            offset,
        };
        info!(
            "🏁 Session ended ({:?}): {} rows, {} frames discarded, offset {:.3} ms, log {}",
            report.end,
            report.rows,
            report.discarded,
            report.offset.unwrap_or_default().millis(),
            recorder.path().display()
        );
        Ok(report)
    }

    async fn session<T: Transport>(
        &mut self,
        transport: &mut T,
        recorder: &mut MetricsRecorder,
    ) -> Result<(SessionEnd, Option<ClockOffset>)> {
        let settings = SyncSettings {
            idle_timeout: self.config.idle_timeout,
            retry_interval: self.config.sync_retry,
            measure_turnaround: self.config.measure_turnaround,
        };

        let first_frame = match clock::synchronize(transport, &settings).await? {
            SyncOutcome::Synced(offset) => {
                self.offset = offset;
                None
            }
            SyncOutcome::Unsynced(frame) => {
                warn!("⚠️  Frames arrived before clock sync, assuming zero offset");
                self.offset = ClockOffset::default();
                Some(*frame)
            }
            SyncOutcome::IdleTimeout => {
                info!("⌛ No sender answered within {:?}", self.config.idle_timeout);
                return Ok((SessionEnd::IdleTimeout, None));
            }
            SyncOutcome::Closed => {
                info!("🔌 Connection closed before clock sync");
                return Ok((SessionEnd::TransportClosed, None));
            }
        };
        let offset = Some(self.offset);

        self.fps = FpsWindow::new(Instant::now());
        if let Some(frame) = first_frame {
            self.accept(frame, Utc::now(), recorder)?;
        }

        loop {
            let text = match timeout(self.config.idle_timeout, transport.recv()).await {
                Err(_) => {
                    info!("⌛ Idle for {:?}, ending session", self.config.idle_timeout);
                    return Ok((SessionEnd::IdleTimeout, offset));
                }
                Ok(Ok(Some(text))) => text,
                Ok(Ok(None)) => {
                    info!("🔌 Connection closed");
                    return Ok((SessionEnd::TransportClosed, offset));
                }
                Ok(Err(e)) => return Err(e.into()),
            };
            let received_at = Utc::now();

            match WireMessage::parse(&text) {
                Ok(WireMessage::Frame(frame)) => self.accept(frame, received_at, recorder)?,
                Ok(WireMessage::Unknown) => debug!("Skipping message with unknown type"),
                Ok(_) => {} // Late sync traffic
                Err(e) => debug!("Skipping malformed message: {}", e),
            }
        }
    }

    /// Process one envelope; only a failed log write escapes
    fn accept(&mut self, frame: FrameMessage, received_at: DateTime<Utc>, recorder: &mut MetricsRecorder) -> Result<()> {
        match self.process(&frame, received_at) {
            Ok(row) => {
                recorder.append(&row)?;
                self.rows += 1;
            }
            Err(e) => {
                debug!("Dropping frame {}: {}", frame.frame_id, e);
                self.discarded += 1;
            }
        }
        Ok(())
    }

    fn process(&mut self, frame: &FrameMessage, received_at: DateTime<Utc>) -> Result<MetricsRow, FrameError> {
        let captured = clock::parse_timestamp(&frame.timestamp)?;
        let envelope = BASE64.decode(&frame.data)?;
        if envelope.len() <= NONCE_LEN {
            return Err(FrameError::Truncated(envelope.len()));
        }
        let jpeg = decrypt_frame(&self.config.key, &envelope).map_err(|e| FrameError::Decrypt(e.to_string()))?;
        let mut decoded = codec::decode(&jpeg).map_err(|e| FrameError::Decode(e.to_string()))?;

        if let Some(target) = self.config.display_resolution {
            if decoded.resolution() != target {
                decoded = decoded.resized(target);
            }
        }

        let fps = self.fps.tick(Instant::now());
        let row = MetricsRow {
            setup_description: frame.setup_description.clone(),
            timestamp_receiver: clock::format_timestamp(received_at),
            timestamp_server: frame.timestamp.clone(),
            filename: frame.filename.clone(),
            frame_id: frame.frame_id,
            resolution: frame.resolution.to_string(),
            jpeg_quality: frame.jpeg_quality,
            size_kb: frame.size_kb,
            compression_time_ms: frame.compression_time_ms,
            encryption_time_ms: frame.encryption_time_ms,
            fps,
            mbits: bitrate_mbit_s(frame.size_kb, fps),
            latency_ms: self.offset.one_way_delay_ms(captured, received_at),
        };

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write_frame(&decoded, frame) {
                warn!("Failed to record frame {}: {:#}", frame.frame_id, e);
            }
        }

        Ok(row)
    }
}
