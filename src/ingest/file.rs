//! Local file frame source.
//!
//! `FileSource` reads frames from a local video file (feature
//! `ingest-file-ffmpeg`) or from a synthetic `stub://` source. Remote URL
//! schemes are rejected.
//!
//! Synthetic sources accept query parameters:
//! `stub://<name>?frames=N&width=W&height=H&fps=F`.

use anyhow::{anyhow, Context, Result};

use super::FrameSource;
#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use crate::frame::SourceFrame;

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local file path (e.g., "/var/lib/fisheye/lobby.mp4") or `stub://` URL.
    pub path: String,
}

impl FileConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes): '{}'",
                config.path
            ));
        }
        if config.path.starts_with("stub://") {
            Ok(Self {
                backend: FileBackend::Synthetic(SyntheticFileSource::new(config)?),
            })
        } else {
            #[cfg(feature = "ingest-file-ffmpeg")]
            {
                Ok(Self {
                    backend: FileBackend::Ffmpeg(FfmpegFileSource::new(config)),
                })
            }
            #[cfg(not(feature = "ingest-file-ffmpeg"))]
            {
                Err(anyhow!(
                    "file ingestion requires the ingest-file-ffmpeg feature"
                ))
            }
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> FileStats {
        match &self.backend {
            FileBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.stats(),
        }
    }
}

impl FrameSource for FileSource {
    fn open(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.open(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.open(),
        }
    }

    fn read_frame(&mut self) -> Result<Option<SourceFrame>> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.read_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.read_frame(),
        }
    }

    fn rewind(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.rewind(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.rewind(),
        }
    }

    fn nominal_fps(&self) -> Option<f64> {
        match &self.backend {
            FileBackend::Synthetic(source) => Some(source.settings.fps),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.nominal_fps(),
        }
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        match &self.backend {
            FileBackend::Synthetic(source) => {
                Some((source.settings.width, source.settings.height))
            }
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.dimensions(),
        }
    }
}

/// Statistics for a file source.
#[derive(Clone, Debug)]
pub struct FileStats {
    pub frames_read: u64,
    pub rewinds: u64,
    pub path: String,
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
struct SyntheticSettings {
    frames: u64,
    width: u32,
    height: u32,
    fps: f64,
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self {
            frames: 100,
            width: 640,
            height: 480,
            fps: 10.0,
        }
    }
}

impl SyntheticSettings {
    fn parse(path: &str) -> Result<Self> {
        let mut settings = Self::default();
        let Some((_, query)) = path.split_once('?') else {
            return Ok(settings);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub parameter '{}' has no value", pair))?;
            let value = value.trim();
            match key.trim() {
                "frames" => settings.frames = value.parse().context("stub frames")?,
                "width" => settings.width = value.parse().context("stub width")?,
                "height" => settings.height = value.parse().context("stub height")?,
                "fps" => settings.fps = value.parse().context("stub fps")?,
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        if settings.frames == 0 || settings.width == 0 || settings.height == 0 {
            return Err(anyhow!("stub frames, width and height must be positive"));
        }
        if !(settings.fps.is_finite() && settings.fps > 0.0) {
            return Err(anyhow!("stub fps must be positive"));
        }
        Ok(settings)
    }
}

struct SyntheticFileSource {
    config: FileConfig,
    settings: SyntheticSettings,
    opened: bool,
    position: u64,
    frames_read: u64,
    rewinds: u64,
}

impl SyntheticFileSource {
    fn new(config: FileConfig) -> Result<Self> {
        let settings = SyntheticSettings::parse(&config.path)?;
        Ok(Self {
            config,
            settings,
            opened: false,
            position: 0,
            frames_read: 0,
            rewinds: 0,
        })
    }

    fn open(&mut self) -> Result<()> {
        self.opened = true;
        log::info!(
            "FileSource: opened {} (synthetic {}x{}, {} frames)",
            self.config.path,
            self.settings.width,
            self.settings.height,
            self.settings.frames
        );
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<SourceFrame>> {
        if !self.opened {
            return Err(anyhow!("source {} is not open", self.config.path));
        }
        if self.position >= self.settings.frames {
            return Ok(None);
        }
        let index = self.position;
        self.position += 1;
        self.frames_read += 1;
        let pixels = self.generate_synthetic_pixels(index);
        SourceFrame::from_rgb(pixels, self.settings.width, self.settings.height, index).map(Some)
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        self.rewinds += 1;
        Ok(())
    }

    /// Diagonal gradient that drifts one pixel per frame, so consecutive frames differ.
    fn generate_synthetic_pixels(&self, index: u64) -> Vec<u8> {
        let (w, h) = (self.settings.width as u64, self.settings.height as u64);
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                pixels.push(((x + index) % 256) as u8);
                pixels.push(((y + index) % 256) as u8);
                pixels.push(((x + y) % 256) as u8);
            }
        }
        pixels
    }

    fn stats(&self) -> FileStats {
        FileStats {
            frames_read: self.frames_read,
            rewinds: self.rewinds,
            path: self.config.path.clone(),
        }
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}
