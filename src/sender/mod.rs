//! Sender pipeline.
//!
//! For every source image, every target resolution and every step of the
//! quality sweep: compress, encrypt, wrap in a frame envelope and send, paced
//! by a ticker at the step's frame rate.

pub mod plan;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock;
use crate::codec::{self, RawFrame};
use crate::crypto::{encrypt_frame, FrameKey};
use crate::protocol::{FrameMessage, Resolution, WireMessage};
use crate::transport::Transport;

pub use plan::QualitySweepPlan;

pub const DEFAULT_SYNC_WAIT: Duration = Duration::from_secs(10);

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub struct SenderConfig {
    pub setup_description: String,
    pub plan: QualitySweepPlan,
    pub key: FrameKey,
    /// How long to wait for the receiver's clock sync request. Zero skips sync.
    pub sync_wait: Duration,
}

/// Totals for one sender session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendReport {
    pub frames_sent: u64,
    pub images_streamed: usize,
    pub images_skipped: usize,
    pub synced: bool,
}

/// Monotonic frame ids, starting at 1
#[derive(Debug)]
struct FrameIds {
    next: u64,
}

impl FrameIds {
    fn new() -> Self {
        Self { next: 1 }
    }

    fn next(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

pub struct Sender {
    config: SenderConfig,
    ids: FrameIds,
}

impl Sender {
    pub fn new(config: SenderConfig) -> Self {
        Self {
            config,
            ids: FrameIds::new(),
        }
    }

    /// Run the whole session and close the transport afterwards.
    ///
    /// Unreadable images are skipped; a failed send aborts the sweep.
    pub async fn run<T: Transport>(&mut self, transport: &mut T, images: &[PathBuf]) -> Result<SendReport> {
        let mut report = SendReport::default();

        let streamed = match clock::respond(transport, self.config.sync_wait).await {
            Ok(synced) => {
                if !synced && !self.config.sync_wait.is_zero() {
                    warn!("⚠️  No clock sync request within {:?}, streaming unsynced", self.config.sync_wait);
                }
                report.synced = synced;
                self.stream(transport, images, &mut report).await
            }
            Err(e) => Err(e.context("Clock sync failed")),
        };

        let closed = transport.close().await;
        streamed?;
        closed.context("Failed to close transport")?;

        info!(
            "✅ Sent {} frames from {} image(s), {} skipped ({})",
            report.frames_sent,
            report.images_streamed,
            report.images_skipped,
            if report.synced { "clock synced" } else { "unsynced" }
        );
        Ok(report)
    }

    async fn stream<T: Transport>(
        &mut self,
        transport: &mut T,
        images: &[PathBuf],
        report: &mut SendReport,
    ) -> Result<()> {
        let plan = self.config.plan.clone();

        for path in images {
            let source = match RawFrame::load(path) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("⚠️  Skipping {}: {:#}", path.display(), e);
                    report.images_skipped += 1;
                    continue;
                }
            };
            let filename = display_name(path);
            info!("🚀 Streaming {} ({})", filename, source.resolution());

            let targets: Vec<Resolution> = if plan.resolutions().is_empty() {
                vec![source.resolution()]
            } else {
                plan.resolutions().to_vec()
            };

            for target in targets {
                let frame = source.resized(target);

                for step in plan.steps() {
                    info!(
                        "🎯 Quality {} at {} ({} frames @ {} fps)",
                        step.quality,
                        target,
                        step.frame_count(),
                        step.fps
                    );

                    // Delay, not Burst: an overrun frame is followed immediately
                    // by the next one and the schedule shifts from there.
                    let mut ticker = interval(step.frame_interval());
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticker.tick().await;

                    for _ in 0..step.frame_count() {
                        let message = self.build_frame(&frame, &filename, step.quality)?;
                        transport
                            .send(WireMessage::Frame(message).to_json()?)
                            .await
                            .context("Failed to send frame")?;
                        report.frames_sent += 1;
                        ticker.tick().await;
                    }
                }
            }
            report.images_streamed += 1;
        }

        Ok(())
    }

    /// Compress, encrypt and describe one frame
    fn build_frame(&mut self, frame: &RawFrame, filename: &str, quality: u8) -> Result<FrameMessage> {
        let captured = Utc::now();
        let (compressed, compression_time) = codec::encode(frame, quality)?;
        let (envelope, encryption_time) = encrypt_frame(&self.config.key, &compressed.data)?;

        let message = FrameMessage {
            setup_description: self.config.setup_description.clone(),
            frame_id: self.ids.next(),
            filename: filename.to_string(),
            timestamp: clock::format_timestamp(captured),
            resolution: compressed.resolution,
            jpeg_quality: compressed.quality,
            size_kb: round_to(compressed.size_kb(), 2),
            compression_time_ms: round_to(compression_time.as_secs_f64() * 1000.0, 5),
            encryption_time_ms: round_to(encryption_time.as_secs_f64() * 1000.0, 5),
            data: BASE64.encode(envelope),
        };
        debug!("Frame {} q={} {:.2} KB", message.frame_id, message.jpeg_quality, message.size_kb);
        Ok(message)
    }
}

/// Expand directories into their image files (sorted by name) and keep
/// explicit files as given. Missing paths or an empty result are errors.
pub fn collect_images(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();

    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(input)
                .with_context(|| format!("Cannot read image directory {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && has_image_extension(p))
                .collect();
            found.sort();
            images.extend(found);
        } else if input.is_file() {
            images.push(input.clone());
        } else {
            anyhow::bail!("Image path not found: {}", input.display());
        }
    }

    anyhow::ensure!(!images.is_empty(), "No images (.jpg, .jpeg, .png) found");
    Ok(images)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
