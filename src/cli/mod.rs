use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::protocol::Resolution;
use crate::receiver::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SYNC_RETRY};
use crate::sender::plan::{DEFAULT_FPS, DEFAULT_QUALITIES, DEFAULT_SECONDS_PER_QUALITY};
use crate::sender::DEFAULT_SYNC_WAIT;

#[derive(Parser)]
#[command(name = "framebench")]
#[command(about = "📸 Encrypted JPEG streaming benchmark over a WebSocket relay", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the fan-out relay
    Relay {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        addr: String,
    },

    /// Stream images through the quality sweep
    Send {
        /// Relay server URL
        #[arg(short, long, default_value = "ws://127.0.0.1:9000")]
        relay: String,

        /// Image files or directories to stream
        #[arg(short, long, required = true, num_args = 1..)]
        images: Vec<PathBuf>,

        /// JPEG qualities to sweep, in order
        #[arg(short, long, value_delimiter = ',', default_values_t = DEFAULT_QUALITIES)]
        qualities: Vec<u8>,

        /// Seconds to hold each quality
        #[arg(long, default_value_t = DEFAULT_SECONDS_PER_QUALITY)]
        seconds: f64,

        /// Frames per second
        #[arg(long, default_value_t = DEFAULT_FPS)]
        fps: u32,

        /// Resize every image to each of these (e.g. 1280x720,640x480)
        #[arg(long, value_delimiter = ',')]
        resolutions: Vec<Resolution>,

        /// Free-text description copied into every metrics row
        #[arg(short, long, default_value = "")]
        setup: String,

        /// Seconds to wait for the receiver's clock sync request (0 skips sync)
        #[arg(long, default_value_t = DEFAULT_SYNC_WAIT.as_secs_f64())]
        sync_wait: f64,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Receive frames and log per-frame metrics
    Receive {
        /// Relay server URL
        #[arg(short, long, default_value = "ws://127.0.0.1:9000")]
        relay: String,

        /// Metrics log to create
        #[arg(short, long, default_value = "stream_log.csv")]
        log: PathBuf,

        /// End the session after this many seconds without a message
        #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs_f64())]
        idle_timeout: f64,

        /// Milliseconds between clock sync requests
        #[arg(long, default_value_t = (DEFAULT_SYNC_RETRY.as_millis() as u64))]
        sync_retry: u64,

        /// Subtract the sender's reported turnaround from the round trip
        #[arg(long)]
        measure_turnaround: bool,

        /// Resize decoded frames to this resolution
        #[arg(long)]
        display: Option<Resolution>,

        /// Save decoded frames as JPEG sequences under this directory
        #[arg(long)]
        record: Option<PathBuf>,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Summarize a metrics log by source filename and by sweep step
    Summarize {
        /// Metrics log to read
        #[arg(short, long, default_value = "stream_log.csv")]
        log: PathBuf,

        /// Output CSV (defaults to <log>_summary_by_filename.csv)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Write a random-noise sample image
    Generate {
        /// Output path
        #[arg(short, long, default_value = "sample_image.jpg")]
        out: PathBuf,

        #[arg(long, default_value_t = 640)]
        width: u32,

        #[arg(long, default_value_t = 480)]
        height: u32,

        /// JPEG quality
        #[arg(short, long, default_value_t = 95)]
        quality: u8,
    },
}

/// Shared frame key, exactly one of the two
#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct KeyArgs {
    /// 32-byte key as 64 hex characters
    #[arg(short, long)]
    pub key: Option<String>,

    /// Passphrase hashed into the key
    #[arg(short, long)]
    pub passphrase: Option<String>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_defaults() {
        let cli = Cli::try_parse_from(["framebench", "send", "-i", "imgs", "-p", "secret"]).unwrap();
        let Commands::Send { qualities, fps, seconds, resolutions, key, .. } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(qualities, DEFAULT_QUALITIES.to_vec());
        assert_eq!(fps, 30);
        assert_eq!(seconds, 5.0);
        assert!(resolutions.is_empty());
        assert_eq!(key.passphrase.as_deref(), Some("secret"));
    }

    #[test]
    fn test_receive_defaults() {
        let cli = Cli::try_parse_from(["framebench", "receive", "-p", "secret"]).unwrap();
        let Commands::Receive { idle_timeout, sync_retry, log, .. } = cli.command else {
            panic!("expected receive");
        };
        assert_eq!(idle_timeout, 10.0);
        assert_eq!(sync_retry, 500);
        assert_eq!(log, PathBuf::from("stream_log.csv"));
    }

    #[test]
    fn test_send_lists() {
        let cli = Cli::try_parse_from([
            "framebench", "send", "-i", "a.jpg", "b.jpg", "-q", "30,60", "--resolutions", "640x480,320x240", "-p", "x",
        ])
        .unwrap();
        let Commands::Send { images, qualities, resolutions, .. } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(images.len(), 2);
        assert_eq!(qualities, vec![30, 60]);
        assert_eq!(resolutions, vec![Resolution::new(640, 480), Resolution::new(320, 240)]);
    }

    #[test]
    fn test_key_is_required_and_exclusive() {
        assert!(Cli::try_parse_from(["framebench", "receive"]).is_err());
        assert!(Cli::try_parse_from(["framebench", "receive", "-p", "a", "-k", "00"]).is_err());
        assert!(Cli::try_parse_from(["framebench", "receive", "-p", "a"]).is_ok());
    }
}
