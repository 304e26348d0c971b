//! Real-time global illumination on wgpu compute.
//!
//! The pipeline takes a rasterized g-buffer plus a dynamic light set and
//! produces a denoised, physically plausible lit image: clustered light
//! culling localizes the lights, restir picks one high-quality light sample
//! per pixel out of thousands of candidates by reusing samples across frames
//! and neighbors, and svgf reconstructs a smooth image from the one-sample
//! result.
//!
//! ```no_run
//! use glimmer::{Camera, Config, Context, GBuffer, Light, LightStore, Renderer};
//!
//! # fn run(gbuffer: GBuffer, output: wgpu::Texture) -> glimmer::Result<()> {
//! let mut context = Context::new()?;
//! let mut renderer = Renderer::new(Config::default());
//! renderer.initialize(&mut context, 1920, 1080)?;
//!
//! let mut lights = LightStore::new();
//! lights.add(Light::point(glam::Vec3::Y, glam::Vec3::ONE, 10.0, 8.0))?;
//!
//! let camera = Camera::perspective(
//!     glam::Vec3::new(0.0, 1.0, 3.0),
//!     glam::Vec3::ZERO,
//!     std::f32::consts::FRAC_PI_4,
//!     16.0 / 9.0,
//!     0.1,
//!     100.0,
//! );
//! renderer.render(&context, &camera, &mut lights, &gbuffer, &output)?;
//! # Ok(())
//! # }
//! ```

mod camera;
mod clear;
mod cluster;
mod config;
mod context;
mod cull;
mod debug;
mod error;
mod kernel;
mod light;
mod profile;
mod renderer;
mod resources;
mod restir;
mod svgf;
mod util;

pub use camera::Camera;
pub use cluster::{ClusterAabb, ClusterGrid, DEFAULT_GRID_DIM, MAX_CLUSTER_COUNT};
pub use config::{Config, QualityPreset};
pub use context::Context;
pub use cull::{MAX_LIGHTS_PER_CLUSTER, MAX_TOTAL_LIGHT_INDICES};
pub use debug::DebugView;
pub use error::{Error, Result};
pub use light::{Light, LightKind, LightStore, MAX_LIGHTS};
pub use profile::FrameTimings;
pub use renderer::{Renderer, Stats};
pub use resources::{
    read_buffer, read_texture, GBuffer, ALBEDO_FORMAT, DEPTH_FORMAT, MOTION_FORMAT, NORMAL_FORMAT,
    OUTPUT_FORMAT, POSITION_FORMAT,
};
pub use restir::{Reservoir, RestirSettings};
pub use svgf::SvgfSettings;
