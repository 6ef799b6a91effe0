//! Image-transform backends.
//!
//! The compositor talks to exactly one `TransformBackend`, picked once by
//! `select_backend` when a producer starts. A requested GPU backend that cannot
//! be initialised falls back to the CPU backend; the decision is never revisited
//! per frame.

mod backend;
pub mod cpu;
#[cfg(feature = "gpu-wgpu")]
pub mod gpu;

pub use backend::TransformBackend;
pub use cpu::{remap_bilinear, CpuBackend};
#[cfg(feature = "gpu-wgpu")]
pub use gpu::GpuBackend;

use crate::error::PipelineError;

/// Backend actually chosen, plus the reason GPU acceleration was skipped, if it was requested.
pub struct BackendSelection {
    pub backend: Box<dyn TransformBackend>,
    pub fallback: Option<PipelineError>,
}

/// Choose the transform backend once.
///
/// `downscale` only applies on the GPU path, where the remapped image is reduced
/// on-device before the single readback.
pub fn select_backend(prefer_gpu: bool, downscale: Option<(u32, u32)>) -> BackendSelection {
    if !prefer_gpu {
        return BackendSelection {
            backend: Box::new(CpuBackend::new()),
            fallback: None,
        };
    }

    match gpu_backend(downscale) {
        Ok(backend) => BackendSelection {
            backend,
            fallback: None,
        },
        Err(err) => {
            let err = PipelineError::acceleration_unavailable(format!("{:#}", err));
            log::warn!("{}; using cpu backend", err);
            BackendSelection {
                backend: Box::new(CpuBackend::new()),
                fallback: Some(err),
            }
        }
    }
}

#[cfg(feature = "gpu-wgpu")]
fn gpu_backend(downscale: Option<(u32, u32)>) -> anyhow::Result<Box<dyn TransformBackend>> {
    let backend = GpuBackend::new(downscale)?;
    log::info!("gpu backend selected: {}", backend.adapter_name());
    Ok(Box::new(backend))
}

#[cfg(not(feature = "gpu-wgpu"))]
fn gpu_backend(_downscale: Option<(u32, u32)>) -> anyhow::Result<Box<dyn TransformBackend>> {
    anyhow::bail!("GPU acceleration requires the gpu-wgpu feature")
}
