//! Optional on-disk recording of decoded frames.

use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

use crate::codec::{save_jpeg, RawFrame};
use crate::protocol::{FrameMessage, Resolution};

const RECORD_QUALITY: u8 = 90;

/// Consumer for frames that made it through the receive pipeline
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RawFrame, meta: &FrameMessage) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Writes each frame as `<root>/recording_<W>x<H>/<frame_id>.jpg`,
/// starting a new directory whenever the resolution changes.
pub struct JpegSequenceRecorder {
    root: PathBuf,
    current: Option<(Resolution, PathBuf)>,
    written: u64,
}

impl JpegSequenceRecorder {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            current: None,
            written: 0,
        }
    }

    fn directory_for(&mut self, resolution: Resolution) -> Result<PathBuf> {
        if let Some((current, dir)) = &self.current {
            if *current == resolution {
                return Ok(dir.clone());
            }
        }
        let dir = self.root.join(format!("recording_{}", resolution));
        std::fs::create_dir_all(&dir)?;
        info!("🎥 Recording to {}", dir.display());
        self.current = Some((resolution, dir.clone()));
        Ok(dir)
    }
}

impl FrameSink for JpegSequenceRecorder {
    fn write_frame(&mut self, frame: &RawFrame, meta: &FrameMessage) -> Result<()> {
        let dir = self.directory_for(frame.resolution())?;
        save_jpeg(frame, &dir.join(format!("{:06}.jpg", meta.frame_id)), RECORD_QUALITY)?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.written > 0 {
            info!("🎥 Recorded {} frames under {}", self.written, self.root.display());
        }
        self.current = None;
        Ok(())
    }
}
