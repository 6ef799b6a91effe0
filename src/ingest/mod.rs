//! Frame ingestion sources.
//!
//! Sources are local only:
//! - `stub://` synthetic sources (tests, demos)
//! - Local video files (feature: ingest-file-ffmpeg)
//!
//! A source is finite. `read_frame` returns `Ok(None)` at end of stream and the
//! producer calls `rewind` to loop it, so a recorded file behaves like a live
//! camera.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;

pub use file::{FileConfig, FileSource, FileStats};

use anyhow::Result;

use crate::frame::SourceFrame;

/// A decoded-frame source owned by exactly one producer.
pub trait FrameSource: Send {
    /// Opens the underlying media. Must be called before `read_frame`.
    fn open(&mut self) -> Result<()>;

    /// Next frame, or `None` once the end of the stream is reached.
    fn read_frame(&mut self) -> Result<Option<SourceFrame>>;

    /// Restarts the stream from its first frame.
    fn rewind(&mut self) -> Result<()>;

    /// Frame rate declared by the media, if known.
    fn nominal_fps(&self) -> Option<f64>;

    /// Frame size (width, height) once opened.
    fn dimensions(&self) -> Option<(u32, u32)>;
}

/// Factory producing an unopened source for a source path.
pub type SourceFactory =
    std::sync::Arc<dyn Fn(&str) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Builds the source for `path`. Opening happens later on the producer thread.
pub fn open_source(path: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(FileSource::new(FileConfig::new(path))?))
}

/// Default factory used by the daemon.
pub fn default_source_factory() -> SourceFactory {
    std::sync::Arc::new(open_source)
}
