use std::time::Instant;

use glam::{UVec2, UVec3};
use log::{info, warn};

use crate::{
    camera::Camera,
    clear::ClearPhase,
    cluster::ClusterGrid,
    config::{Config, QualityPreset},
    context::Context,
    cull::{self, CullPhase},
    debug::{DebugPhase, DebugView},
    error::{Error, Result},
    light::LightStore,
    profile::{DeferredReadback, FrameTimings, GpuProfiler, Stamp},
    resources::{self, ConstState, Frame, GBuffer, RenderTarget, StorageBuffer},
    restir::{Reservoir, RestirPhase, RestirSettings},
    svgf::{SvgfPhase, SvgfSettings},
};

/// Readable after every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub restir_ms: f32,
    pub svgf_ms: f32,
    pub total_ms: f32,
    /// Per-sub-pass breakdown from the deferred timestamp queries.
    pub timings: FrameTimings,
    /// Saturating product of candidates, temporal cap, spatial samples and
    /// spatial iterations.
    pub effective_spp: u32,
    pub current_fps: f32,
    /// Rolling average over the last 60 frames.
    pub avg_fps: f32,
    /// Fraction of pixels whose reprojected history survived validation.
    pub temporal_reuse_rate: f32,
    /// Fraction of pixels that dropped their denoiser history this frame.
    pub disocclusion_rate: f32,
    /// Light-index slots dropped to the per-cluster capacity this frame.
    pub cluster_overflow: u32,
}

/// Per-frame counters written by the kernels, harvested one frame later.
struct FrameStats {
    buffer: StorageBuffer,
    readback: [DeferredReadback; 2],
    parity: usize,
}

impl FrameStats {
    fn new(context: &Context) -> Result<Self> {
        let size = (cull::STAT_COUNT * 4) as u64;
        Ok(Self {
            buffer: StorageBuffer::new(context, "frame stats", size)?,
            readback: [
                DeferredReadback::new(&context.device, "frame stats staging", size),
                DeferredReadback::new(&context.device, "frame stats staging", size),
            ],
            parity: 0,
        })
    }

    fn begin_frame(&mut self, context: &Context) -> Option<[u32; cull::STAT_COUNT]> {
        self.parity ^= 1;
        let data = self.readback[1 - self.parity].take_blocking(&context.device)?;
        let counters: &[u32] = bytemuck::cast_slice(&data);
        counters.try_into().ok()
    }

    fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_buffer_to_buffer(
            &self.buffer.buffer,
            0,
            self.readback[self.parity].staging(),
            0,
            self.buffer.size,
        );
    }

    fn after_submit(&mut self) {
        if !self.readback[self.parity].is_pending() {
            self.readback[self.parity].request();
        }
    }
}

/// Everything that lives on the gpu for one viewport.
struct State {
    width: u32,
    height: u32,
    consts: ConstState,
    grid: ClusterGrid,
    cull: CullPhase,
    restir: RestirPhase,
    svgf: SvgfPhase,
    clear: ClearPhase,
    debug: DebugPhase,
    profiler: GpuProfiler,
    stats: FrameStats,
    restir_output: RenderTarget,
    prev_normal: RenderTarget,
    prev_depth: RenderTarget,
}

impl State {
    fn new(context: &mut Context, config: &Config, width: u32, height: u32) -> Result<Self> {
        let consts = ConstState::new(context);
        let grid_dim = UVec3::from_array(config.grid_dim);

        // A placeholder camera is enough for construction; the grid rebuilds
        // from the real one on the first frame.
        let camera = Camera::perspective(
            glam::Vec3::ZERO,
            -glam::Vec3::Z,
            std::f32::consts::FRAC_PI_4,
            width as f32 / height.max(1) as f32,
            0.1,
            100.0,
        );

        let grid = ClusterGrid::new(context, grid_dim, width, height, &camera)?;
        let cull = CullPhase::new(context, &consts.bind_group_layout, grid.cluster_count())?;

        let mut restir = RestirPhase::new(context, &consts.bind_group_layout, width, height)?;
        restir.settings = config.restir.clone();

        let mut svgf = SvgfPhase::new(context, &consts.bind_group_layout, width, height)?;
        svgf.settings = config.svgf.clone();

        let clear = ClearPhase::new(context, &consts.bind_group_layout)?;
        let debug = DebugPhase::new(context, &consts.bind_group_layout)?;
        let profiler = GpuProfiler::new(context, config.profiling);
        let stats = FrameStats::new(context)?;

        let restir_output = RenderTarget::new(
            context,
            "restir output",
            width,
            height,
            resources::COLOR_BUFFER_FORMAT,
            wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
        )?;

        let (prev_normal, prev_depth) = create_geometry_history(context, width, height)?;

        Ok(Self {
            width,
            height,
            consts,
            grid,
            cull,
            restir,
            svgf,
            clear,
            debug,
            profiler,
            stats,
            restir_output,
            prev_normal,
            prev_depth,
        })
    }
}

fn create_geometry_history(
    context: &Context,
    width: u32,
    height: u32,
) -> Result<(RenderTarget, RenderTarget)> {
    let usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST;
    Ok((
        RenderTarget::new(
            context,
            "geometry history normal",
            width,
            height,
            resources::NORMAL_FORMAT,
            usage,
        )?,
        RenderTarget::new(
            context,
            "geometry history depth",
            width,
            height,
            resources::DEPTH_FORMAT,
            usage,
        )?,
    ))
}

/// The per-frame entry point of the global-illumination pipeline.
///
/// Owns every gpu resource for the configured viewport and sequences the
/// stages: light culling into the cluster grid, restir resampling, svgf
/// denoising, then statistics. Construct once, `initialize` with a viewport,
/// call `render` each frame.
pub struct Renderer {
    config: Config,
    debug_view: DebugView,
    on_frame_error: Option<Box<dyn FnMut(&Error)>>,
    stats: Stats,
    fps_window: [f32; FPS_WINDOW],
    fps_samples: usize,
    last_frame_at: Option<Instant>,
    frame_index: u32,
    prev_frame: Option<Frame>,
    pending_reset: bool,
    spp_warned: bool,
    state: Option<State>,
}

impl Renderer {
    pub fn new(mut config: Config) -> Self {
        config.apply_preset();

        Self {
            config,
            debug_view: DebugView::None,
            on_frame_error: None,
            stats: Stats::default(),
            fps_window: [0.0; FPS_WINDOW],
            fps_samples: 0,
            last_frame_at: None,
            frame_index: 0,
            prev_frame: None,
            pending_reset: false,
            spp_warned: false,
            state: None,
        }
    }

    /// Creates every gpu resource for the given viewport. On failure the
    /// renderer stays in the pre-init state.
    pub fn initialize(&mut self, context: &mut Context, width: u32, height: u32) -> Result<()> {
        let state = State::new(context, &self.config, width, height)?;

        info!(
            "rtgi pipeline initialized at {width}x{height}, grid {:?}, target {} fps",
            self.config.grid_dim,
            self.config
                .preset
                .unwrap_or(QualityPreset::Medium)
                .target_fps(),
        );

        self.state = Some(state);
        self.frame_index = 0;
        self.prev_frame = None;
        self.pending_reset = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Releases every gpu resource and returns to the pre-init state.
    pub fn shutdown(&mut self) {
        self.state = None;
        self.prev_frame = None;
        self.frame_index = 0;
    }

    /// Recreates the per-viewport resources. A resize to the current
    /// dimensions is a no-op.
    pub fn resize(&mut self, context: &Context, width: u32, height: u32) -> Result<()> {
        let state = self.state.as_mut().ok_or(Error::NotInitialized)?;
        if state.width == width && state.height == height {
            return Ok(());
        }

        info!("resizing rtgi pipeline to {width}x{height}");

        state.restir.resize(context, width, height)?;
        state.svgf.resize(context, width, height)?;
        state.restir_output = RenderTarget::new(
            context,
            "restir output",
            width,
            height,
            resources::COLOR_BUFFER_FORMAT,
            wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
        )?;
        let (prev_normal, prev_depth) = create_geometry_history(context, width, height)?;
        state.prev_normal = prev_normal;
        state.prev_depth = prev_depth;
        state.width = width;
        state.height = height;

        self.reset_temporal_history();
        Ok(())
    }

    /// Drops all temporal history at the next frame boundary and restarts
    /// the frame counter. Calling this twice in a row is the same as once.
    pub fn reset_temporal_history(&mut self) {
        self.pending_reset = true;
        self.frame_index = 0;
        self.prev_frame = None;
    }

    pub fn render(
        &mut self,
        context: &Context,
        camera: &Camera,
        lights: &mut LightStore,
        gbuffer: &GBuffer,
        output: &wgpu::Texture,
    ) -> Result<()> {
        let state = self.state.as_mut().ok_or(Error::NotInitialized)?;

        let grid_dim = UVec3::from_array(self.config.grid_dim);
        let viewport = UVec2::new(state.width, state.height);
        let frame = Frame::new(
            camera,
            viewport,
            grid_dim,
            lights.len(),
            self.frame_index,
            self.prev_frame.as_ref(),
        );
        state.consts.update(&context.queue, &frame);

        // Per-frame contract violations skip the frame with a zeroed output;
        // they are reported, never fatal.
        if let Err(err) = validate_output(output, state.width, state.height, self.config.svgf_enabled)
        {
            if let Some(callback) = self.on_frame_error.as_mut() {
                callback(&err);
            }
            return Ok(());
        }
        if let Err(err) = gbuffer.validate(state.width, state.height) {
            let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());
            let mut encoder =
                context
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("skipped frame"),
                    });
            state.clear.record_color(
                context,
                &mut encoder,
                &state.consts.bind_group,
                &output_view,
                state.width,
                state.height,
            )?;
            context.queue.submit(std::iter::once(encoder.finish()));

            if let Some(callback) = self.on_frame_error.as_mut() {
                callback(&err);
            }
            return Ok(());
        }

        // Last frame's deferred readbacks.
        if let Some(counters) = state.stats.begin_frame(context) {
            let pixels = (state.width * state.height).max(1) as f32;
            self.stats.cluster_overflow = counters[cull::STAT_CLUSTER_OVERFLOW];
            self.stats.temporal_reuse_rate =
                1.0 - counters[cull::STAT_TEMPORAL_INVALIDATED] as f32 / pixels;
            self.stats.disocclusion_rate = counters[cull::STAT_DISOCCLUDED] as f32 / pixels;
        }
        if let Some(timings) = state.profiler.begin_frame(context) {
            self.stats.timings = timings;
            self.stats.restir_ms = timings.restir_ms();
            self.stats.svgf_ms = timings.svgf_ms();
            self.stats.total_ms = timings.total_ms;
        }

        let light_buffer = lights.upload(context)?;
        state.grid.update(context, state.width, state.height, camera);

        let gbuffer_views = gbuffer.views();
        let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("rtgi frame"),
            });

        state.profiler.stamp(&mut encoder, Stamp::FrameStart);
        encoder.clear_buffer(&state.stats.buffer.buffer, 0, None);

        if self.pending_reset {
            state.restir.record_reset(&mut encoder);
            state.svgf.record_reset(
                context,
                &mut encoder,
                &state.consts.bind_group,
                &state.clear,
                state.width,
                state.height,
            )?;
            self.pending_reset = false;
        }

        if self.config.restir_enabled {
            state.cull.record(
                context,
                &mut encoder,
                &state.consts.bind_group,
                &state.grid,
                light_buffer,
                &state.stats.buffer.buffer,
            )?;
            state.profiler.stamp(&mut encoder, Stamp::AfterCull);

            state.restir.record(
                context,
                &mut encoder,
                &state.consts.bind_group,
                &gbuffer_views,
                &state.prev_normal.view,
                &state.prev_depth.view,
                &state.cull,
                light_buffer,
                &state.stats.buffer.buffer,
                &state.restir_output.view,
                state.width,
                state.height,
                self.frame_index,
                &state.profiler,
            )?;
        } else {
            state.clear.record_color(
                context,
                &mut encoder,
                &state.consts.bind_group,
                &state.restir_output.view,
                state.width,
                state.height,
            )?;
            for stamp in [
                Stamp::AfterCull,
                Stamp::AfterRestirInitial,
                Stamp::AfterRestirTemporal,
                Stamp::AfterRestirSpatial,
                Stamp::AfterRestirFinal,
            ] {
                state.profiler.stamp(&mut encoder, stamp);
            }
        }

        if self.config.svgf_enabled {
            state.svgf.record(
                context,
                &mut encoder,
                &state.consts.bind_group,
                &state.restir_output.view,
                &gbuffer_views,
                &state.prev_normal.view,
                &state.prev_depth.view,
                &state.stats.buffer.buffer,
                &output_view,
                state.width,
                state.height,
                &state.profiler,
            )?;
        } else {
            encoder.copy_texture_to_texture(
                state.restir_output.texture.as_image_copy(),
                output.as_image_copy(),
                wgpu::Extent3d {
                    width: state.width,
                    height: state.height,
                    depth_or_array_layers: 1,
                },
            );
            for stamp in [
                Stamp::AfterSvgfTemporal,
                Stamp::AfterSvgfVariance,
                Stamp::AfterSvgfWavelet,
                Stamp::AfterSvgfModulate,
            ] {
                state.profiler.stamp(&mut encoder, stamp);
            }
        }

        if self.debug_view != DebugView::None {
            state.debug.record(
                context,
                &mut encoder,
                &state.consts.bind_group,
                self.debug_view,
                &state.restir.reservoirs().buffer,
                &state.svgf.variance().view,
                &state.svgf.moments().view,
                &gbuffer_views.normal,
                &gbuffer_views.depth,
                &gbuffer_views.motion,
                &output_view,
                state.width,
                state.height,
                state.restir.settings.temporal_max_m,
                state.svgf.settings.temporal_max_m,
            )?;
        }

        // Keep this frame's geometry for next frame's similarity tests.
        let extent = wgpu::Extent3d {
            width: state.width,
            height: state.height,
            depth_or_array_layers: 1,
        };
        encoder.copy_texture_to_texture(
            gbuffer.normal.as_image_copy(),
            state.prev_normal.texture.as_image_copy(),
            extent,
        );
        encoder.copy_texture_to_texture(
            gbuffer.depth.as_image_copy(),
            state.prev_depth.texture.as_image_copy(),
            extent,
        );

        state.stats.resolve(&mut encoder);
        state.profiler.resolve(&mut encoder);

        context.queue.submit(std::iter::once(encoder.finish()));
        state.stats.after_submit();
        state.profiler.after_submit();

        self.prev_frame = Some(frame);
        self.frame_index += 1;
        self.update_host_stats();

        Ok(())
    }

    fn update_host_stats(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_frame_at.replace(now) {
            let dt = (now - last).as_secs_f32();
            if dt > 0.0 {
                let fps = 1.0 / dt;
                self.fps_window[self.fps_samples % FPS_WINDOW] = fps;
                self.fps_samples += 1;
                self.stats.current_fps = fps;

                let filled = self.fps_samples.min(FPS_WINDOW);
                self.stats.avg_fps =
                    self.fps_window[..filled].iter().sum::<f32>() / filled as f32;
            }
        }

        let settings = &self.config.restir;
        let spatial = settings
            .spatial_samples
            .saturating_mul(settings.spatial_iterations)
            .max(1);
        let spp = settings
            .initial_candidates
            .saturating_mul(settings.temporal_max_m)
            .saturating_mul(spatial);
        if spp >= 1 << 31 && !self.spp_warned {
            warn!("effective spp estimate saturated at {spp}; settings are implausibly high");
            self.spp_warned = true;
        }
        self.stats.effective_spp = spp;
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn restir_settings(&self) -> &RestirSettings {
        &self.config.restir
    }

    pub fn svgf_settings(&self) -> &SvgfSettings {
        &self.config.svgf
    }

    pub fn set_restir_settings(&mut self, settings: RestirSettings) {
        self.config.restir = settings.clone();
        self.spp_warned = false;
        if let Some(state) = self.state.as_mut() {
            state.restir.settings = settings;
        }
    }

    pub fn set_svgf_settings(&mut self, settings: SvgfSettings) {
        self.config.svgf = settings.clone();
        if let Some(state) = self.state.as_mut() {
            state.svgf.settings = settings;
        }
    }

    /// Applies a coordinated quality preset immediately; no frames are
    /// dropped.
    pub fn set_quality_preset(&mut self, preset: QualityPreset) {
        info!(
            "applying {preset:?} quality preset ({} fps target)",
            preset.target_fps()
        );

        self.config.preset = Some(preset);
        let mut restir = self.config.restir.clone();
        let mut svgf = self.config.svgf.clone();
        preset.apply(&mut restir, &mut svgf);
        self.set_restir_settings(restir);
        self.set_svgf_settings(svgf);
    }

    pub fn set_restir_enabled(&mut self, enabled: bool) {
        self.config.restir_enabled = enabled;
    }

    pub fn set_svgf_enabled(&mut self, enabled: bool) {
        self.config.svgf_enabled = enabled;
    }

    pub fn set_debug_view(&mut self, view: DebugView) {
        self.debug_view = view;
    }

    pub fn debug_view(&self) -> DebugView {
        self.debug_view
    }

    /// Per-frame contract violations are delivered here instead of failing
    /// the render call.
    pub fn set_error_callback(&mut self, callback: impl FnMut(&Error) + 'static) {
        self.on_frame_error = Some(Box::new(callback));
    }

    pub fn log_performance_report(&self) {
        let stats = &self.stats;
        let timings = &stats.timings;
        info!(
            "rtgi frame report: total {:.2} ms ({:.0} fps current, {:.0} fps avg), {} effective spp",
            stats.total_ms, stats.current_fps, stats.avg_fps, stats.effective_spp,
        );
        info!(
            "  restir {:.2} ms: initial {:.2}, temporal {:.2}, spatial {:.2}, shading {:.2}",
            stats.restir_ms,
            timings.restir_initial_ms,
            timings.restir_temporal_ms,
            timings.restir_spatial_ms,
            timings.restir_final_ms,
        );
        info!(
            "  svgf {:.2} ms: temporal {:.2}, variance {:.2}, wavelet {:.2}, modulate {:.2}",
            stats.svgf_ms,
            timings.svgf_temporal_ms,
            timings.svgf_variance_ms,
            timings.svgf_wavelet_ms,
            timings.svgf_modulate_ms,
        );
        info!(
            "  temporal reuse {:.1}%, disocclusion {:.1}%, cluster overflow {}",
            stats.temporal_reuse_rate * 100.0,
            stats.disocclusion_rate * 100.0,
            stats.cluster_overflow,
        );
    }

    /// Blocking readback of the per-cluster `(count, offset)` pairs.
    /// Debug and test path.
    pub fn read_cluster_meta(&self, context: &Context) -> Result<Vec<[u32; 2]>> {
        let state = self.state.as_ref().ok_or(Error::NotInitialized)?;
        let meta = state.cull.cluster_meta();
        let data = resources::read_buffer(context, &meta.buffer, meta.size);
        Ok(bytemuck::cast_slice(&data).to_vec())
    }

    /// Blocking readback of the first `len` entries of the compact light
    /// index list.
    pub fn read_light_indices(&self, context: &Context, len: u32) -> Result<Vec<u32>> {
        let state = self.state.as_ref().ok_or(Error::NotInitialized)?;
        let indices = state.cull.light_indices();
        let size = u64::from(len.min(cull::MAX_TOTAL_LIGHT_INDICES)) * 4;
        let data = resources::read_buffer(context, &indices.buffer, size.min(indices.size));
        Ok(bytemuck::cast_slice(&data).to_vec())
    }

    /// Blocking readback of the most recent frame's reservoirs.
    pub fn read_reservoirs(&self, context: &Context) -> Result<Vec<Reservoir>> {
        let state = self.state.as_ref().ok_or(Error::NotInitialized)?;
        let reservoirs = state.restir.reservoirs();
        let data = resources::read_buffer(context, &reservoirs.buffer, reservoirs.size);
        Ok(bytemuck::cast_slice(&data).to_vec())
    }

    /// Blocking readback of the per-pixel denoiser history length.
    pub fn read_history_length(&self, context: &Context) -> Result<Vec<f32>> {
        let state = self.state.as_ref().ok_or(Error::NotInitialized)?;
        let data = resources::read_texture(context, &state.svgf.moments().texture);
        let texels: &[[f32; 4]] = bytemuck::cast_slice(&data);
        Ok(texels.iter().map(|texel| texel[2]).collect())
    }

    /// The cached view-space cluster bounds, for host-side validation.
    pub fn cluster_aabbs(&self) -> Result<&[crate::cluster::ClusterAabb]> {
        let state = self.state.as_ref().ok_or(Error::NotInitialized)?;
        Ok(state.grid.aabbs())
    }
}

fn validate_output(
    output: &wgpu::Texture,
    width: u32,
    height: u32,
    svgf_enabled: bool,
) -> Result<()> {
    if output.format() != resources::OUTPUT_FORMAT {
        return Err(Error::InvalidFormat {
            name: "output",
            expected: resources::OUTPUT_FORMAT,
            actual: output.format(),
        });
    }

    if output.width() != width || output.height() != height {
        return Err(Error::ViewportMismatch {
            name: "output",
            width,
            height,
            actual_width: output.width(),
            actual_height: output.height(),
        });
    }

    let mut required = wgpu::TextureUsages::STORAGE_BINDING;
    if !svgf_enabled {
        // The restir image is copied straight through when denoising is off.
        required |= wgpu::TextureUsages::COPY_DST;
    }
    if !output.usage().contains(required) {
        return Err(Error::Configuration {
            kernel: "output contract",
            slot: 0,
            reason: format!("output is missing usage {required:?}"),
        });
    }

    Ok(())
}

const FPS_WINDOW: usize = 60;
