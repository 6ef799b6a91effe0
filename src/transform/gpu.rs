#![cfg(feature = "gpu-wgpu")]

//! wgpu compute backend.
//!
//! Remap tables are uploaded once in `prepare`. Per frame the crop is uploaded
//! once, each view is remapped (and optionally area-downscaled) on the device,
//! and only the final image is read back.

use std::sync::{mpsc, Arc};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use wgpu::util::DeviceExt;

use crate::projection::RemapTable;
use crate::transform::backend::TransformBackend;

const WORKGROUP: u32 = 16;

const REMAP_SHADER: &str = r#"
struct Params { src_w: u32, src_h: u32, dst_w: u32, dst_h: u32 };

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> src: array<u32>;
@group(0) @binding(2) var<storage, read> coords: array<vec2<f32>>;
@group(0) @binding(3) var<storage, read_write> dst: array<u32>;

fn fetch(x: i32, y: i32) -> vec3<f32> {
    if (x < 0 || y < 0 || x >= i32(params.src_w) || y >= i32(params.src_h)) {
        return vec3<f32>(0.0);
    }
    let p = src[u32(y) * params.src_w + u32(x)];
    return vec3<f32>(f32(p & 0xffu), f32((p >> 8u) & 0xffu), f32((p >> 16u) & 0xffu));
}

fn pack(c: vec3<f32>) -> u32 {
    let v = vec3<u32>(clamp(round(c), vec3<f32>(0.0), vec3<f32>(255.0)));
    return v.x | (v.y << 8u) | (v.z << 16u);
}

@compute @workgroup_size(16, 16)
fn remap(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.dst_w || id.y >= params.dst_h) {
        return;
    }
    let i = id.y * params.dst_w + id.x;
    let c = coords[i];
    let cx = clamp(c.x, -2.0, f32(params.src_w) + 1.0);
    let cy = clamp(c.y, -2.0, f32(params.src_h) + 1.0);
    let x0f = floor(cx);
    let y0f = floor(cy);
    let fx = cx - x0f;
    let fy = cy - y0f;
    let x0 = i32(x0f);
    let y0 = i32(y0f);
    let top = mix(fetch(x0, y0), fetch(x0 + 1, y0), fx);
    let bottom = mix(fetch(x0, y0 + 1), fetch(x0 + 1, y0 + 1), fx);
    dst[i] = pack(mix(top, bottom, fy));
}
"#;

const DOWNSCALE_SHADER: &str = r#"
struct Params { src_w: u32, src_h: u32, dst_w: u32, dst_h: u32 };

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> src: array<u32>;
@group(0) @binding(2) var<storage, read_write> dst: array<u32>;

fn unpack(p: u32) -> vec3<f32> {
    return vec3<f32>(f32(p & 0xffu), f32((p >> 8u) & 0xffu), f32((p >> 16u) & 0xffu));
}

@compute @workgroup_size(16, 16)
fn downscale(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.dst_w || id.y >= params.dst_h) {
        return;
    }
    let x_start = id.x * params.src_w / params.dst_w;
    let x_end = max(x_start + 1u, (id.x + 1u) * params.src_w / params.dst_w);
    let y_start = id.y * params.src_h / params.dst_h;
    let y_end = max(y_start + 1u, (id.y + 1u) * params.src_h / params.dst_h);
    var sum = vec3<f32>(0.0);
    for (var y = y_start; y < y_end; y = y + 1u) {
        for (var x = x_start; x < x_end; x = x + 1u) {
            sum = sum + unpack(src[y * params.src_w + x]);
        }
    }
    let avg = sum / f32((x_end - x_start) * (y_end - y_start));
    let v = vec3<u32>(clamp(round(avg), vec3<f32>(0.0), vec3<f32>(255.0)));
    dst[id.y * params.dst_w + id.x] = v.x | (v.y << 8u) | (v.z << 16u);
}
"#;

/// Uniform block shared by both shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
}

struct GpuTable {
    coords: wgpu::Buffer,
    width: u32,
    height: u32,
}

struct GpuFrame {
    pixels: wgpu::Buffer,
    side: u32,
}

/// GPU backend built on wgpu storage buffers and two compute pipelines.
pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    remap_pipeline: wgpu::ComputePipeline,
    downscale_pipeline: wgpu::ComputePipeline,
    tables: Vec<Option<GpuTable>>,
    frame: Option<GpuFrame>,
    downscale: Option<(u32, u32)>,
    adapter_name: String,
}

impl GpuBackend {
    /// Acquire an adapter and build the pipelines. Fails when no GPU is present.
    pub fn new(downscale: Option<(u32, u32)>) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .map_err(|e| anyhow!("no GPU adapter available: {}", e))?;
        if adapter.get_info().device_type == wgpu::DeviceType::Cpu {
            return Err(anyhow!("only a software adapter is available"));
        }
        let adapter_name = adapter.get_info().name;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("fisheye-views"),
            required_limits: adapter.limits(),
            ..Default::default()
        }))
        .context("request GPU device")?;

        let remap_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("remap"),
            source: wgpu::ShaderSource::Wgsl(REMAP_SHADER.into()),
        });
        let downscale_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("downscale"),
            source: wgpu::ShaderSource::Wgsl(DOWNSCALE_SHADER.into()),
        });
        let remap_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("remap"),
            layout: None,
            module: &remap_module,
            entry_point: Some("remap"),
            compilation_options: Default::default(),
            cache: None,
        });
        let downscale_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("downscale"),
            layout: None,
            module: &downscale_module,
            entry_point: Some("downscale"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            remap_pipeline,
            downscale_pipeline,
            tables: Vec::new(),
            frame: None,
            downscale: downscale.filter(|(w, h)| *w > 0 && *h > 0),
            adapter_name,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn params_buffer(&self, src: (u32, u32), dst: (u32, u32)) -> wgpu::Buffer {
        let params = Params {
            src_w: src.0,
            src_h: src.1,
            dst_w: dst.0,
            dst_h: dst.1,
        };
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    fn storage_buffer(&self, label: &str, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    fn read_back(&self, buffer: &wgpu::Buffer, size: u64) -> Result<Vec<u8>> {
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(buffer, 0, &readback, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| anyhow!("GPU poll failed: {}", e))?;
        rx.recv()
            .map_err(|_| anyhow!("GPU readback callback dropped"))?
            .map_err(|e| anyhow!("GPU readback failed: {}", e))?;
        let bytes = slice.get_mapped_range().to_vec();
        readback.unmap();
        Ok(bytes)
    }
}

impl TransformBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn prepare(&mut self, tables: &[Option<Arc<RemapTable>>]) -> Result<()> {
        self.tables = tables
            .iter()
            .map(|table| {
                table.as_ref().map(|table| {
                    let points: Vec<[f32; 2]> = table
                        .map_x
                        .iter()
                        .zip(&table.map_y)
                        .map(|(x, y)| [*x, *y])
                        .collect();
                    let coords =
                        self.device
                            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                                label: Some("remap-table"),
                                contents: bytemuck::cast_slice(&points),
                                usage: wgpu::BufferUsages::STORAGE,
                            });
                    GpuTable {
                        coords,
                        width: table.width as u32,
                        height: table.height as u32,
                    }
                })
            })
            .collect();
        log::info!(
            "gpu backend: {} remap tables resident on {}",
            self.tables.iter().flatten().count(),
            self.adapter_name
        );
        Ok(())
    }

    fn begin_frame(&mut self, crop: &RgbImage) -> Result<()> {
        let side = crop.width();
        if crop.height() != side {
            return Err(anyhow!("gpu backend expects a square crop"));
        }
        let texels: Vec<[u8; 4]> = crop.pixels().map(|p| [p[0], p[1], p[2], 0]).collect();
        let packed: &[u8] = bytemuck::cast_slice(&texels);
        let reuse = matches!(&self.frame, Some(frame) if frame.side == side);
        if !reuse {
            let pixels = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("crop"),
                size: packed.len() as u64,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            self.frame = Some(GpuFrame { pixels, side });
        }
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| anyhow!("gpu frame buffer missing"))?;
        self.queue.write_buffer(&frame.pixels, 0, packed);
        Ok(())
    }

    fn remap(
        &mut self,
        _crop: &RgbImage,
        view_index: usize,
        _table: &RemapTable,
    ) -> Result<RgbImage> {
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| anyhow!("begin_frame was not called"))?;
        let table = self
            .tables
            .get(view_index)
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("no resident remap table for view {}", view_index))?;

        let remap_size = (table.width, table.height);
        let remapped = self.storage_buffer("remapped", remap_size.0 as u64 * remap_size.1 as u64 * 4);
        let remap_params = self.params_buffer((frame.side, frame.side), remap_size);
        let remap_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("remap"),
            layout: &self.remap_pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: remap_params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: frame.pixels.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: table.coords.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: remapped.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("remap") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("remap"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.remap_pipeline);
            pass.set_bind_group(0, &remap_group, &[]);
            pass.dispatch_workgroups(
                remap_size.0.div_ceil(WORKGROUP),
                remap_size.1.div_ceil(WORKGROUP),
                1,
            );
        }

        let (output, out_size) = match self.downscale {
            Some(target) => {
                let scaled = self.storage_buffer("downscaled", target.0 as u64 * target.1 as u64 * 4);
                let scale_params = self.params_buffer(remap_size, target);
                let scale_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("downscale"),
                    layout: &self.downscale_pipeline.get_bind_group_layout(0),
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: scale_params.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: remapped.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: scaled.as_entire_binding(),
                        },
                    ],
                });
                {
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("downscale"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(&self.downscale_pipeline);
                    pass.set_bind_group(0, &scale_group, &[]);
                    pass.dispatch_workgroups(
                        target.0.div_ceil(WORKGROUP),
                        target.1.div_ceil(WORKGROUP),
                        1,
                    );
                }
                (scaled, target)
            }
            None => (remapped, remap_size),
        };
        self.queue.submit(Some(encoder.finish()));

        let bytes = self.read_back(&output, out_size.0 as u64 * out_size.1 as u64 * 4)?;
        let texels: &[[u8; 4]] = bytemuck::cast_slice(&bytes);
        let rgb: Vec<u8> = texels.iter().flat_map(|p| [p[0], p[1], p[2]]).collect();
        RgbImage::from_raw(out_size.0, out_size.1, rgb)
            .ok_or_else(|| anyhow!("GPU readback size mismatch"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{build_remap_table, ProjectionParams};
    use crate::transform::cpu::remap_bilinear;
    use crate::view::ViewConfig;
    use image::Rgb;

    #[test]
    fn gpu_remap_matches_cpu_within_one_level() {
        let Ok(mut backend) = GpuBackend::new(None) else {
            return;
        };
        let crop = RgbImage::from_fn(64, 64, |x, y| {
            Rgb([(x * 4) as u8, (y * 4) as u8, ((x * 7 + y * 3) % 256) as u8])
        });
        let params = ProjectionParams::for_view(
            &ViewConfig::active(30.0, 35.0, 80.0),
            (64, 64),
            (24, 32),
            180.0,
        )
        .unwrap();
        let table = Arc::new(build_remap_table(&params).unwrap());

        backend.prepare(&[Some(Arc::clone(&table))]).unwrap();
        backend.begin_frame(&crop).unwrap();
        let gpu = backend.remap(&crop, 0, &table).unwrap();
        let cpu = remap_bilinear(&crop, &table).unwrap();

        assert_eq!(gpu.dimensions(), cpu.dimensions());
        for (g, c) in gpu.as_raw().iter().zip(cpu.as_raw()) {
            assert!((*g as i16 - *c as i16).abs() <= 1, "gpu {} vs cpu {}", g, c);
        }
    }
}
