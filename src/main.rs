mod cli;
mod clock;
mod codec;
mod crypto;
mod metrics;
mod protocol;
mod receiver;
mod relay;
mod sender;
mod transport;

#[cfg(test)]
mod e2e;

use anyhow::{Context, Result};
use cli::{Cli, Commands, KeyArgs};
use codec::RawFrame;
use crypto::FrameKey;
use metrics::MetricsRecorder;
use receiver::{JpegSequenceRecorder, Receiver, ReceiverConfig};
use sender::{QualitySweepPlan, Sender, SenderConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use transport::{Transport, WsTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framebench=info")))
        .init();

    let cli = Cli::parse_args();

    match cli.command {
        Commands::Relay { addr } => {
            relay::start_relay(addr).await?;
        }
        Commands::Send {
            relay,
            images,
            qualities,
            seconds,
            fps,
            resolutions,
            setup,
            sync_wait,
            key,
        } => {
            let plan = QualitySweepPlan::uniform(&qualities, seconds, fps)
                .context("Invalid quality sweep")?
                .with_resolutions(resolutions);
            let config = SenderConfig {
                setup_description: setup,
                plan,
                key: frame_key(&key)?,
                sync_wait: seconds_arg("--sync-wait", sync_wait)?,
            };
            run_sender(&relay, config, &images).await?;
        }
        Commands::Receive {
            relay,
            log,
            idle_timeout,
            sync_retry,
            measure_turnaround,
            display,
            record,
            key,
        } => {
            let idle_timeout = seconds_arg("--idle-timeout", idle_timeout)?;
            anyhow::ensure!(!idle_timeout.is_zero(), "--idle-timeout must be positive");
            anyhow::ensure!(sync_retry > 0, "--sync-retry must be positive");

            let config = ReceiverConfig {
                idle_timeout,
                sync_retry: Duration::from_millis(sync_retry),
                measure_turnaround,
                display_resolution: display,
                ..ReceiverConfig::new(frame_key(&key)?)
            };
            run_receiver(&relay, config, log, record).await?;
        }
        Commands::Summarize { log, out } => {
            summarize_log(log, out)?;
        }
        Commands::Generate {
            out,
            width,
            height,
            quality,
        } => {
            anyhow::ensure!(width > 0 && height > 0, "Image size must be non-zero");
            codec::save_jpeg(&RawFrame::noise(width, height), &out, quality)?;
            println!("🖼️  Wrote {}x{} sample image to {}", width, height, out.display());
        }
    }

    Ok(())
}

fn frame_key(args: &KeyArgs) -> Result<FrameKey> {
    match (&args.key, &args.passphrase) {
        (Some(hex_key), _) => FrameKey::from_hex(hex_key).context("Invalid --key"),
        (None, Some(passphrase)) => Ok(FrameKey::from_passphrase(passphrase)),
        (None, None) => anyhow::bail!("Either --key or --passphrase is required"),
    }
}

fn seconds_arg(name: &str, seconds: f64) -> Result<Duration> {
    anyhow::ensure!(seconds.is_finite() && seconds >= 0.0, "{} must be a non-negative number of seconds", name);
    Ok(Duration::from_secs_f64(seconds))
}

async fn run_sender(relay: &str, config: SenderConfig, inputs: &[PathBuf]) -> Result<()> {
    let images = sender::collect_images(inputs)?;
    info!(
        "📤 Streaming {} image(s), {} frames each",
        images.len(),
        config.plan.frames_per_image()
    );

    let mut transport = WsTransport::connect(relay).await?;
    info!("✅ Connected to relay {}", relay);

    Sender::new(config).run(&mut transport, &images).await?;
    Ok(())
}

async fn run_receiver(relay: &str, config: ReceiverConfig, log: PathBuf, record: Option<PathBuf>) -> Result<()> {
    let mut recorder = MetricsRecorder::open(&log)?;

    let mut transport = WsTransport::connect(relay).await?;
    info!("✅ Connected to relay {}, logging to {}", relay, log.display());

    let mut receiver = Receiver::new(config);
    if let Some(dir) = record {
        receiver = receiver.with_sink(Box::new(JpegSequenceRecorder::new(dir)));
    }

    let report = receiver.run(&mut transport, &mut recorder).await;
    if let Err(e) = transport.close().await {
        tracing::debug!("Close after session: {}", e);
    }
    report?;
    recorder.finish()?;
    Ok(())
}

fn summarize_log(log: PathBuf, out: Option<PathBuf>) -> Result<()> {
    let rows = metrics::read_rows(&log)?;
    let summary = metrics::summarize(&rows);
    let out = out.unwrap_or_else(|| metrics::summary_path(&log));
    metrics::write_summary(&out, &summary)?;
    let by_quality = metrics::summarize_by_quality(&rows);
    let quality_out = metrics::quality_summary_path(&log);
    metrics::write_summary(&quality_out, &by_quality)?;

    println!("📊 {} rows from {}", rows.len(), log.display());
    for entry in &summary {
        println!(
            "  {:<24} {:>6} frames  fps {:>5.1} [{}..{}]  {:>8.2} KB  {:>7.2} ms latency  {:>6.2} Mbit/s",
            entry.filename,
            entry.frames,
            entry.fps_mean,
            entry.fps_min,
            entry.fps_max,
            entry.size_kb_mean,
            entry.latency_ms_mean,
            entry.mbits_mean
        );
    }
    println!(
        "✅ Summary written to {} ({} quality steps in {})",
        out.display(),
        by_quality.len(),
        quality_out.display()
    );
    Ok(())
}
