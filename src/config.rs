use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::FrameBuffers;
use crate::compositor::{
    CompositorOptions, DEFAULT_INPUT_FOV_DEG, DEFAULT_ORIGINAL_SIZE, DEFAULT_REMAP_SIZE,
};
use crate::encode::{FrameEncoder, DEFAULT_JPEG_QUALITY, DEFAULT_STREAM_SIZE};
use crate::producer::{ProducerContext, SourceSpec};
use crate::view::{default_ring, ViewConfig};

const DEFAULT_SOURCE_ID: &str = "front";
const DEFAULT_SOURCE_PATH: &str = "stub://front_camera";
const DEFAULT_CLIENT_INTERVAL_MS: u64 = 40;
const DEFAULT_RING_VIEWS: usize = 8;
const DEFAULT_RING_TILT_DEG: f64 = 35.0;
const DEFAULT_RING_FOV_DEG: f64 = 80.0;

#[derive(Debug, Deserialize, Default)]
struct ViewdConfigFile {
    sources: Option<Vec<SourceConfigFile>>,
    remap: Option<SizeFile>,
    stream: Option<StreamConfigFile>,
    input_fov_deg: Option<f64>,
    client_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SourceConfigFile {
    id: Option<String>,
    path: String,
    fisheye: Option<bool>,
    overlay: Option<bool>,
    show_original: Option<bool>,
    motion_detection: Option<bool>,
    gpu: Option<bool>,
    downscale: Option<SizeFile>,
    views: Option<Vec<ViewConfig>>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
struct SizeFile {
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct ViewdConfig {
    pub sources: Vec<SourceSpec>,
    /// Internal remap size (width, height).
    pub remap_size: (u32, u32),
    pub stream: StreamSettings,
    pub input_fov_deg: f64,
    pub client_interval: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
}

impl ViewdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FISHEYE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Same as `load`, reading `path` instead of `FISHEYE_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ViewdConfigFile) -> Result<Self> {
        let sources = match file.sources {
            Some(sources) => sources.into_iter().map(source_from_file).collect(),
            None => vec![default_source(DEFAULT_SOURCE_ID, DEFAULT_SOURCE_PATH)],
        };
        let remap_size = file
            .remap
            .map(|size| (size.width, size.height))
            .unwrap_or(DEFAULT_REMAP_SIZE);
        let stream = StreamSettings {
            width: file
                .stream
                .as_ref()
                .and_then(|stream| stream.width)
                .unwrap_or(DEFAULT_STREAM_SIZE.0),
            height: file
                .stream
                .as_ref()
                .and_then(|stream| stream.height)
                .unwrap_or(DEFAULT_STREAM_SIZE.1),
            jpeg_quality: file
                .stream
                .and_then(|stream| stream.jpeg_quality)
                .unwrap_or(DEFAULT_JPEG_QUALITY),
        };
        Ok(Self {
            sources,
            remap_size,
            stream,
            input_fov_deg: file.input_fov_deg.unwrap_or(DEFAULT_INPUT_FOV_DEG),
            client_interval: Duration::from_millis(
                file.client_interval_ms
                    .unwrap_or(DEFAULT_CLIENT_INTERVAL_MS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(paths) = std::env::var("FISHEYE_SOURCES") {
            let parsed = split_csv(&paths);
            if !parsed.is_empty() {
                self.sources = parsed
                    .iter()
                    .map(|path| default_source(path, path))
                    .collect();
            }
        }
        if let Ok(gpu) = std::env::var("FISHEYE_GPU") {
            let enabled = parse_bool(&gpu)
                .ok_or_else(|| anyhow!("FISHEYE_GPU must be one of 1, 0, true, false"))?;
            for source in &mut self.sources {
                source.gpu = enabled;
            }
        }
        if let Ok(quality) = std::env::var("FISHEYE_JPEG_QUALITY") {
            self.stream.jpeg_quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("FISHEYE_JPEG_QUALITY must be an integer in 1..=100"))?;
        }
        if let Ok(interval) = std::env::var("FISHEYE_CLIENT_INTERVAL_MS") {
            let millis: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("FISHEYE_CLIENT_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.client_interval = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!("at least one source must be configured"));
        }
        let mut seen = HashSet::new();
        for source in &mut self.sources {
            source.id = source.id.trim().to_string();
            if source.id.is_empty() {
                return Err(anyhow!("source id cannot be empty"));
            }
            if !seen.insert(source.id.clone()) {
                return Err(anyhow!("duplicate source id '{}'", source.id));
            }
            if source.path.trim().is_empty() {
                return Err(anyhow!("source '{}' has no path", source.id));
            }
            if source.fisheye && source.views.is_empty() {
                return Err(anyhow!("fisheye source '{}' has no views", source.id));
            }
            if let Some((w, h)) = source.downscale {
                if w == 0 || h == 0 {
                    return Err(anyhow!("source '{}' downscale must be non-zero", source.id));
                }
            }
        }
        if self.remap_size.0 == 0 || self.remap_size.1 == 0 {
            return Err(anyhow!("remap size must be non-zero"));
        }
        FrameEncoder::new(self.stream.width, self.stream.height, self.stream.jpeg_quality)?;
        if !(self.input_fov_deg > 0.0 && self.input_fov_deg <= 360.0) {
            return Err(anyhow!(
                "input_fov_deg must be in (0, 360], got {}",
                self.input_fov_deg
            ));
        }
        if self.client_interval.is_zero() {
            return Err(anyhow!("client interval must be greater than zero"));
        }
        Ok(())
    }

    pub fn encoder(&self) -> Result<FrameEncoder> {
        FrameEncoder::new(self.stream.width, self.stream.height, self.stream.jpeg_quality)
    }

    pub fn compositor_options(&self) -> CompositorOptions {
        CompositorOptions {
            input_fov_deg: self.input_fov_deg,
            remap_size: self.remap_size,
            show_original: true,
            original_size: DEFAULT_ORIGINAL_SIZE,
        }
    }

    /// Producer context sharing `buffers`, with the configured encoder and compositor options.
    pub fn producer_context(&self, buffers: Arc<FrameBuffers>) -> Result<ProducerContext> {
        Ok(ProducerContext {
            encoder: self.encoder()?,
            compositor: self.compositor_options(),
            ..ProducerContext::new(buffers)
        })
    }
}

fn default_source(id: &str, path: &str) -> SourceSpec {
    SourceSpec {
        views: default_ring(DEFAULT_RING_VIEWS, DEFAULT_RING_TILT_DEG, DEFAULT_RING_FOV_DEG),
        ..SourceSpec::new(id, path)
    }
}

fn source_from_file(file: SourceConfigFile) -> SourceSpec {
    let id = file.id.unwrap_or_else(|| file.path.clone());
    let mut spec = default_source(&id, &file.path);
    if let Some(fisheye) = file.fisheye {
        spec.fisheye = fisheye;
    }
    if let Some(overlay) = file.overlay {
        spec.overlay = overlay;
    }
    if let Some(show_original) = file.show_original {
        spec.show_original = show_original;
    }
    if let Some(motion) = file.motion_detection {
        spec.motion_detection = motion;
    }
    if let Some(gpu) = file.gpu {
        spec.gpu = gpu;
    }
    spec.downscale = file.downscale.map(|size| (size.width, size.height));
    if let Some(views) = file.views {
        spec.views = views;
    }
    spec
}

fn read_config_file(path: &Path) -> Result<ViewdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
