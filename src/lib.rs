//! Fisheye multi-view production engine.
//!
//! Turns a single ceiling-mounted fisheye camera into several rectilinear
//! "virtual cameras" and keeps an always-fresh, encoded snapshot of every view
//! for any number of clients.
//!
//! # Architecture
//!
//! ```text
//! FrameSource ──► producer thread ──► FrameBuffers ──► DeliveryChannel ──► client
//!                 (crop, remap,        (atomic          (poll at client
//!                  detect, encode)      snapshot swap)   interval, lossy)
//! ```
//!
//! - One producer thread per source; starting is idempotent.
//! - Remap tables are built once per view; disabled views keep their index.
//! - Snapshots are replaced whole, readers never see a half-written one.
//! - GPU or CPU remapping is chosen once per producer, never per frame.
//!
//! # Module Structure
//!
//! - `view`: view slots, keys and selectors
//! - `projection`: fisheye remap tables and view footprints
//! - `frame`: decoded frames and the centered square crop
//! - `transform`: CPU and (feature `gpu-wgpu`) GPU remap backends
//! - `detect`: motion detectors
//! - `overlay`: footprint outlines, alert borders, letterboxing
//! - `compositor`: per-frame rendering of all views
//! - `encode`: JPEG encoding at stream size
//! - `buffer`: latest-snapshot buffers
//! - `ingest`: frame sources
//! - `producer`: production loops and their registry
//! - `delivery`: per-client delivery channels
//! - `streams`: camera id bindings
//! - `config`: daemon configuration

pub mod buffer;
pub mod compositor;
pub mod config;
pub mod delivery;
pub mod detect;
pub mod encode;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod overlay;
pub mod producer;
pub mod projection;
pub mod streams;
pub mod transform;
pub mod view;

pub use buffer::{FrameBuffers, Snapshot, SnapshotMeta};
pub use compositor::{CompositorOptions, RenderOutput, ViewCompositor};
pub use delivery::{DeliveredFrame, DeliveryChannel, FrameSink};
pub use encode::{EncodedImage, FrameEncoder};
pub use error::{PipelineError, Stage};
pub use frame::{CropGeometry, SourceFrame};
pub use ingest::{open_source, FileConfig, FileSource, FrameSource};
pub use producer::{
    CycleObserver, LogObserver, ProducerContext, ProducerRegistry, SourceSpec, StartOutcome,
};
pub use projection::{build_remap_table, view_footprint, ProjectionParams, RemapTable};
pub use streams::StreamBindings;
pub use transform::{select_backend, TransformBackend};
pub use view::{ViewConfig, ViewKey, ViewSelector, ZonePolygon};
