use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::protocol::Resolution;

/// Column names of the metrics log, in order
pub const HEADER: [&str; 13] = [
    "setup description",
    "timestamp_receiver",
    "timestamp_server",
    "filename",
    "frame_id",
    "resolution",
    "jpeg_quality",
    "size_kb",
    "compression_time_ms",
    "encryption_time_ms",
    "fps",
    "Mbits",
    "latency_ms",
];

/// One received frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    #[serde(rename = "setup description")]
    pub setup_description: String,
    pub timestamp_receiver: String,
    pub timestamp_server: String,
    pub filename: String,
    pub frame_id: u64,
    pub resolution: String,
    pub jpeg_quality: u8,
    pub size_kb: f64,
    pub compression_time_ms: f64,
    pub encryption_time_ms: f64,
    pub fps: u32,
    #[serde(rename = "Mbits")]
    pub mbits: f64,
    pub latency_ms: f64,
}

/// `size_kb * 8 * fps / 1000`
pub fn bitrate_mbit_s(size_kb: f64, fps: u32) -> f64 {
    size_kb * 8.0 * fps as f64 / 1000.0
}

/// Append-only CSV log of received frames.
///
/// Every row is flushed as soon as it is written so a crashed run still
/// leaves everything up to the last frame on disk.
pub struct MetricsRecorder {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: u64,
}

impl MetricsRecorder {
    /// Create (or truncate) the log and write the header
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)
            .with_context(|| format!("Cannot create metrics log {}", path.display()))?;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(HEADER)?;
        writer.flush()?;

        Ok(Self { path, writer, rows: 0 })
    }

    pub fn append(&mut self, row: &MetricsRow) -> Result<()> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

/// Read every row of a metrics log in file order
pub fn read_rows<P: AsRef<Path>>(path: P) -> Result<Vec<MetricsRow>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Cannot open metrics log {}", path.display()))?;
    let rows = reader.deserialize().collect::<Result<Vec<MetricsRow>, _>>()?;
    Ok(rows)
}

/// Mean/min/max over a group of rows
#[derive(Debug, Clone, PartialEq)]
struct Aggregate {
    frames: u64,
    fps_mean: f64,
    fps_min: u32,
    fps_max: u32,
    size_kb_mean: f64,
    compression_time_ms_mean: f64,
    encryption_time_ms_mean: f64,
    latency_ms_mean: f64,
    mbits_mean: f64,
}

impl Aggregate {
    fn over(rows: &[&MetricsRow]) -> Self {
        let n = rows.len() as f64;
        let mean = |f: fn(&MetricsRow) -> f64| rows.iter().map(|r| f(r)).sum::<f64>() / n;
        Self {
            frames: rows.len() as u64,
            fps_mean: mean(|r| r.fps as f64),
            fps_min: rows.iter().map(|r| r.fps).min().unwrap_or(0),
            fps_max: rows.iter().map(|r| r.fps).max().unwrap_or(0),
            size_kb_mean: mean(|r| r.size_kb),
            compression_time_ms_mean: mean(|r| r.compression_time_ms),
            encryption_time_ms_mean: mean(|r| r.encryption_time_ms),
            latency_ms_mean: mean(|r| r.latency_ms),
            mbits_mean: mean(|r| r.mbits),
        }
    }
}

/// Aggregates for one source file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSummary {
    pub filename: String,
    pub frames: u64,
    pub fps_mean: f64,
    pub fps_min: u32,
    pub fps_max: u32,
    pub size_kb_mean: f64,
    pub compression_time_ms_mean: f64,
    pub encryption_time_ms_mean: f64,
    pub latency_ms_mean: f64,
    #[serde(rename = "Mbits_mean")]
    pub mbits_mean: f64,
}

impl FileSummary {
    fn new(filename: &str, agg: Aggregate) -> Self {
        Self {
            filename: filename.to_string(),
            frames: agg.frames,
            fps_mean: agg.fps_mean,
            fps_min: agg.fps_min,
            fps_max: agg.fps_max,
            size_kb_mean: agg.size_kb_mean,
            compression_time_ms_mean: agg.compression_time_ms_mean,
            encryption_time_ms_mean: agg.encryption_time_ms_mean,
            latency_ms_mean: agg.latency_ms_mean,
            mbits_mean: agg.mbits_mean,
        }
    }
}

/// Aggregates for one step of the sweep: a file at one resolution and quality
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualitySummary {
    pub filename: String,
    pub resolution: String,
    pub jpeg_quality: u8,
    pub frames: u64,
    pub fps_mean: f64,
    pub fps_min: u32,
    pub fps_max: u32,
    pub size_kb_mean: f64,
    pub compression_time_ms_mean: f64,
    pub encryption_time_ms_mean: f64,
    pub latency_ms_mean: f64,
    #[serde(rename = "Mbits_mean")]
    pub mbits_mean: f64,
}

/// Group rows by filename, ordered by filename
pub fn summarize(rows: &[MetricsRow]) -> Vec<FileSummary> {
    let mut groups: BTreeMap<&str, Vec<&MetricsRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.filename.as_str()).or_default().push(row);
    }

    groups
        .into_iter()
        .map(|(filename, rows)| FileSummary::new(filename, Aggregate::over(&rows)))
        .collect()
}

/// Group rows by filename, then resolution (largest first), then quality
pub fn summarize_by_quality(rows: &[MetricsRow]) -> Vec<QualitySummary> {
    let mut groups: BTreeMap<(&str, Reverse<(u64, &str)>, u8), Vec<&MetricsRow>> = BTreeMap::new();
    for row in rows {
        let resolution = Reverse((pixel_count(&row.resolution), row.resolution.as_str()));
        let key = (row.filename.as_str(), resolution, row.jpeg_quality);
        groups.entry(key).or_default().push(row);
    }

    groups
        .into_iter()
        .map(|((filename, Reverse((_, resolution)), jpeg_quality), rows)| {
            let agg = Aggregate::over(&rows);
            QualitySummary {
                filename: filename.to_string(),
                resolution: resolution.to_string(),
                jpeg_quality,
                frames: agg.frames,
                fps_mean: agg.fps_mean,
                fps_min: agg.fps_min,
                fps_max: agg.fps_max,
                size_kb_mean: agg.size_kb_mean,
                compression_time_ms_mean: agg.compression_time_ms_mean,
                encryption_time_ms_mean: agg.encryption_time_ms_mean,
                latency_ms_mean: agg.latency_ms_mean,
                mbits_mean: agg.mbits_mean,
            }
        })
        .collect()
}

fn pixel_count(resolution: &str) -> u64 {
    resolution
        .parse::<Resolution>()
        .map(|r| r.width as u64 * r.height as u64)
        .unwrap_or(0)
}

/// `stream_log.csv` → `stream_log_summary_by_filename.csv`, next to the log
pub fn summary_path(log_path: &Path) -> PathBuf {
    sibling_path(log_path, "summary_by_filename")
}

/// `stream_log.csv` → `stream_log_summary_by_quality.csv`, next to the log
pub fn quality_summary_path(log_path: &Path) -> PathBuf {
    sibling_path(log_path, "summary_by_quality")
}

fn sibling_path(log_path: &Path, suffix: &str) -> PathBuf {
    let stem = log_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stream_log".to_string());
    log_path.with_file_name(format!("{}_{}.csv", stem, suffix))
}

pub fn write_summary<P: AsRef<Path>, S: Serialize>(path: P, summary: &[S]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Cannot write summary {}", path.display()))?;
    for entry in summary {
        writer.serialize(entry)?;
    }
    writer.flush()?;
    Ok(())
}
