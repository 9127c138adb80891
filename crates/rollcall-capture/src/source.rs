//! Frame sources, the seam between the external capture device and the
//! stability detector.

use crate::frame::{decode_image, Frame, DEFAULT_DARK_THRESHOLD};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("frame directory not found: {0}")]
    DirectoryNotFound(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("decode worker failed: {0}")]
    Worker(String),
}

/// A stream of frames, consumed strictly one at a time.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. `Ok(None)` means the source is exhausted.
    async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// Pre-captured frames, yielded front to back.
#[async_trait]
impl FrameSource for VecDeque<Frame> {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        Ok(self.pop_front())
    }
}

/// Frames read from image files in a directory, in file-name order.
///
/// In follow mode the directory is treated as a spool: once the known files
/// are consumed the source polls for files whose names sort after the last
/// one read. Writers must rename complete files into place; a file that
/// fails to decode is skipped.
pub struct DirectorySource {
    dir: PathBuf,
    follow: bool,
    poll_interval: Duration,
    dark_threshold: f32,
    pending: VecDeque<PathBuf>,
    last: Option<PathBuf>,
    sequence: u32,
}

impl DirectorySource {
    /// Open a directory for a one-shot replay of the files currently in it.
    pub async fn replay(dir: impl AsRef<Path>) -> Result<Self, CaptureError> {
        Self::open(dir.as_ref(), false, Duration::from_millis(100)).await
    }

    /// Open a spool directory and keep waiting for new files.
    pub async fn follow(dir: impl AsRef<Path>, poll_interval: Duration) -> Result<Self, CaptureError> {
        Self::open(dir.as_ref(), true, poll_interval).await
    }

    /// Override the dark-frame threshold used when classifying frames.
    pub fn with_dark_threshold(mut self, threshold: f32) -> Self {
        self.dark_threshold = threshold;
        self
    }

    async fn open(dir: &Path, follow: bool, poll_interval: Duration) -> Result<Self, CaptureError> {
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            return Err(CaptureError::DirectoryNotFound(dir.display().to_string()));
        }

        let mut source = Self {
            dir: dir.to_path_buf(),
            follow,
            poll_interval,
            dark_threshold: DEFAULT_DARK_THRESHOLD,
            pending: VecDeque::new(),
            last: None,
            sequence: 0,
        };
        source.rescan().await?;

        tracing::info!(
            dir = %source.dir.display(),
            follow,
            queued = source.pending.len(),
            "frame directory opened"
        );
        Ok(source)
    }

    /// Queue image files that sort after the last file consumed.
    async fn rescan(&mut self) -> Result<(), CaptureError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|source| CaptureError::Io {
                path: self.dir.display().to_string(),
                source,
            })?;

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| CaptureError::Io {
            path: self.dir.display().to_string(),
            source,
        })? {
            let path = entry.path();
            if image::ImageFormat::from_path(&path).is_err() {
                continue;
            }
            if self.last.as_ref().is_some_and(|last| path <= *last) {
                continue;
            }
            found.push(path);
        }
        found.sort();
        self.pending.extend(found);
        Ok(())
    }

    /// Discard every queued or newly spooled file, so the next frame is one
    /// written after this call. Returns the number of files skipped.
    pub async fn skip_backlog(&mut self) -> Result<usize, CaptureError> {
        self.pending.clear();
        self.rescan().await?;
        let skipped = self.pending.len();
        if let Some(newest) = self.pending.drain(..).last() {
            self.last = Some(newest);
        }
        if skipped > 0 {
            tracing::debug!(skipped, dir = %self.dir.display(), "frame backlog skipped");
        }
        Ok(skipped)
    }

    async fn load(&mut self, path: PathBuf) -> Result<Option<Frame>, CaptureError> {
        let bytes = tokio::fs::read(&path).await.map_err(|source| CaptureError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let decoded = tokio::task::spawn_blocking(move || decode_image(&bytes))
            .await
            .map_err(|e| CaptureError::Worker(e.to_string()))?;

        match decoded {
            Ok(image) => {
                let frame = Frame::new(image, self.sequence, self.dark_threshold);
                self.sequence = self.sequence.wrapping_add(1);
                Ok(Some(frame))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping undecodable frame");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl FrameSource for DirectorySource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        loop {
            if let Some(path) = self.pending.pop_front() {
                self.last = Some(path.clone());
                match self.load(path).await? {
                    Some(frame) => return Ok(Some(frame)),
                    None => continue,
                }
            }

            if !self.follow {
                return Ok(None);
            }

            tokio::time::sleep(self.poll_interval).await;
            self.rescan().await?;
        }
    }
}
