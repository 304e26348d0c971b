use std::{mem, num::NonZeroU64, sync::mpsc};

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec2, UVec4, Vec2, Vec4};

use crate::{
    camera::Camera,
    context::Context,
    error::{Error, Result},
    util,
};

/// Per-frame constants visible to every kernel at group 0, binding 0.
#[repr(C)]
#[derive(Debug, Copy, Clone, Zeroable, Pod)]
pub struct Frame {
    pub view: Mat4,
    pub proj: Mat4,
    pub proj_view: Mat4,
    pub inv_view: Mat4,
    pub inv_proj: Mat4,
    pub prev_proj_view: Mat4,
    pub camera_pos: Vec4,
    pub viewport: UVec2,
    pub z_planes: Vec2,
    pub grid_dim: UVec4,
    pub light_count: u32,
    pub frame_index: u32,
    pub padding: [u32; 2],
}

impl Frame {
    pub fn new(
        camera: &Camera,
        viewport: UVec2,
        grid_dim: glam::UVec3,
        light_count: u32,
        frame_index: u32,
        prev: Option<&Frame>,
    ) -> Self {
        let proj_view = camera.proj_view();
        let prev_proj_view = prev.map(|prev| prev.proj_view).unwrap_or(proj_view);
        let inv_view = camera.view.inverse();

        Self {
            view: camera.view,
            proj: camera.proj,
            proj_view,
            inv_view,
            inv_proj: camera.proj.inverse(),
            prev_proj_view,
            camera_pos: inv_view.col(3),
            viewport,
            z_planes: Vec2::new(camera.z_near, camera.z_far),
            grid_dim: grid_dim.extend(grid_dim.x * grid_dim.y * grid_dim.z),
            light_count,
            frame_index,
            padding: [0; 2],
        }
    }
}

pub struct ConstState {
    pub const_buffer: wgpu::Buffer,
    pub bind_group: wgpu::BindGroup,
    pub bind_group_layout: wgpu::BindGroupLayout,
}

impl ConstState {
    pub fn new(context: &Context) -> Self {
        let const_buffer = context.device.create_buffer(&wgpu::BufferDescriptor {
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::UNIFORM,
            size: mem::size_of::<Frame>() as wgpu::BufferAddress,
            mapped_at_creation: false,
            label: Some("frame constants"),
        });

        let linear_sampler = context.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("linear sampler"),
            mipmap_filter: wgpu::FilterMode::Linear,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            ..Default::default()
        });

        let const_buffer_size = NonZeroU64::new(mem::size_of::<Frame>() as u64);

        let bind_group_layout =
            context
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("const state"),
                    entries: &[
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::COMPUTE,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: const_buffer_size,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 1,
                            visibility: wgpu::ShaderStages::COMPUTE,
                            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                            count: None,
                        },
                    ],
                });

        let bind_group = context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("const state"),
                layout: &bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &const_buffer,
                            size: const_buffer_size,
                            offset: 0,
                        }),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&linear_sampler),
                    },
                ],
            });

        Self {
            const_buffer,
            bind_group,
            bind_group_layout,
        }
    }

    pub fn update(&self, queue: &wgpu::Queue, frame: &Frame) {
        queue.write_buffer(&self.const_buffer, 0, bytemuck::bytes_of(frame));
    }
}

pub struct RenderTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
}

impl RenderTarget {
    pub fn new(
        context: &Context,
        label: &'static str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Result<Self> {
        let max = context.limits.max_texture_dimension_2d;
        if width > max || height > max {
            return Err(Error::ResourceExhausted {
                what: label,
                size: u64::from(width) * u64::from(height),
            });
        }

        let texture = context.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            dimension: wgpu::TextureDimension::D2,
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            view_formats: &[],
            format,
            usage,
        });

        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(label),
            ..Default::default()
        });

        Ok(Self {
            texture,
            view,
            format,
        })
    }
}

pub struct StorageBuffer {
    pub buffer: wgpu::Buffer,
    pub size: u64,
}

impl StorageBuffer {
    pub fn new(context: &Context, label: &'static str, size: u64) -> Result<Self> {
        if size > u64::from(context.limits.max_storage_buffer_binding_size)
            || size > context.limits.max_buffer_size
        {
            return Err(Error::ResourceExhausted { what: label, size });
        }

        let buffer = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
            size,
        });

        Ok(Self { buffer, size })
    }

    pub fn binding(&self) -> wgpu::BindingResource {
        self.buffer.as_entire_binding()
    }
}

/// Double-buffered resource with an explicit selector.
///
/// The live buffer is never derived from the frame counter at call sites;
/// stages call `flip` exactly once per hand-over.
pub struct PingPong<T> {
    a: T,
    b: T,
    current: bool,
}

impl<T> PingPong<T> {
    pub fn new(a: T, b: T) -> Self {
        Self {
            a,
            b,
            current: false,
        }
    }

    pub fn current(&self) -> &T {
        if self.current {
            &self.b
        } else {
            &self.a
        }
    }

    pub fn previous(&self) -> &T {
        if self.current {
            &self.a
        } else {
            &self.b
        }
    }

    pub fn flip(&mut self) {
        self.current = !self.current;
    }

    pub fn reset(&mut self) {
        self.current = false;
    }

    pub fn both(&self) -> [&T; 2] {
        [&self.a, &self.b]
    }
}

pub const POSITION_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
pub const NORMAL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const ALBEDO_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;
pub const MOTION_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rg16Float;
pub const OUTPUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

pub const COLOR_BUFFER_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const MOMENTS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
pub const VARIANCE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;

/// The caller-owned surface attributes consumed each frame.
///
/// All five textures must match the pipeline viewport. `normal` and `depth`
/// additionally need `COPY_SRC`: the pipeline keeps a copy of last frame's
/// geometry for the temporal similarity tests.
pub struct GBuffer<'a> {
    pub position: &'a wgpu::Texture,
    pub normal: &'a wgpu::Texture,
    pub albedo: &'a wgpu::Texture,
    pub depth: &'a wgpu::Texture,
    pub motion: &'a wgpu::Texture,
}

impl<'a> GBuffer<'a> {
    pub fn validate(&self, width: u32, height: u32) -> Result<()> {
        let entries = [
            ("position buffer", self.position, POSITION_FORMAT, false),
            ("normal buffer", self.normal, NORMAL_FORMAT, true),
            ("albedo buffer", self.albedo, ALBEDO_FORMAT, false),
            ("depth buffer", self.depth, DEPTH_FORMAT, true),
            ("motion buffer", self.motion, MOTION_FORMAT, false),
        ];

        for (name, texture, format, needs_copy_src) in entries {
            if texture.format() != format {
                return Err(Error::InvalidFormat {
                    name,
                    expected: format,
                    actual: texture.format(),
                });
            }

            if texture.width() != width || texture.height() != height {
                return Err(Error::ViewportMismatch {
                    name,
                    width,
                    height,
                    actual_width: texture.width(),
                    actual_height: texture.height(),
                });
            }

            let mut required = wgpu::TextureUsages::TEXTURE_BINDING;
            if needs_copy_src {
                required |= wgpu::TextureUsages::COPY_SRC;
            }

            if !texture.usage().contains(required) {
                return Err(Error::Configuration {
                    kernel: "gbuffer contract",
                    slot: 0,
                    reason: format!("{name} is missing usage {required:?}"),
                });
            }
        }

        Ok(())
    }

    pub fn views(&self) -> GBufferViews {
        let view = |texture: &wgpu::Texture, label| {
            texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(label),
                ..Default::default()
            })
        };

        GBufferViews {
            position: view(self.position, "gbuffer position"),
            normal: view(self.normal, "gbuffer normal"),
            albedo: view(self.albedo, "gbuffer albedo"),
            depth: view(self.depth, "gbuffer depth"),
            motion: view(self.motion, "gbuffer motion"),
        }
    }
}

pub struct GBufferViews {
    pub position: wgpu::TextureView,
    pub normal: wgpu::TextureView,
    pub albedo: wgpu::TextureView,
    pub depth: wgpu::TextureView,
    pub motion: wgpu::TextureView,
}

/// Blocking buffer readback. Debug and test path only; the per-frame loop
/// uses the deferred staging rings instead.
pub fn read_buffer(context: &Context, buffer: &wgpu::Buffer, size: u64) -> Vec<u8> {
    let staging = context.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback staging"),
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
        size,
    });

    let mut encoder = context
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
    context.queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (sender, receiver) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    context.device.poll(wgpu::Maintain::Wait);
    receiver
        .recv()
        .expect("map_async callback dropped")
        .expect("buffer readback failed");

    let data = slice.get_mapped_range().to_vec();
    staging.unmap();
    data
}

/// Blocking texture readback, unpadding the 256-byte copy pitch.
pub fn read_texture(context: &Context, texture: &wgpu::Texture) -> Vec<u8> {
    let width = texture.width();
    let height = texture.height();
    let texel_size = texture
        .format()
        .block_size(None)
        .expect("texture format has no fixed block size");

    let unpadded_pitch = width * texel_size;
    let padded_pitch = util::align_to(unpadded_pitch, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);

    let staging = context.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback staging"),
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
        size: u64::from(padded_pitch) * u64::from(height),
    });

    let mut encoder = context
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
    encoder.copy_texture_to_buffer(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::ImageCopyBuffer {
            buffer: &staging,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(padded_pitch),
                rows_per_image: None,
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    context.queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (sender, receiver) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    context.device.poll(wgpu::Maintain::Wait);
    receiver
        .recv()
        .expect("map_async callback dropped")
        .expect("texture readback failed");

    let mapped = slice.get_mapped_range();
    let mut data = Vec::with_capacity((unpadded_pitch * height) as usize);
    for row in 0..height {
        let begin = (row * padded_pitch) as usize;
        data.extend_from_slice(&mapped[begin..begin + unpadded_pitch as usize]);
    }
    drop(mapped);
    staging.unmap();
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong_parity_is_deterministic() {
        let mut buffers = PingPong::new('a', 'b');
        assert_eq!(*buffers.current(), 'a');
        assert_eq!(*buffers.previous(), 'b');

        for n in 1..=8 {
            buffers.flip();
            let expect = if n % 2 == 1 { 'b' } else { 'a' };
            assert_eq!(*buffers.current(), expect, "after {n} flips");
        }

        buffers.reset();
        assert_eq!(*buffers.current(), 'a');
    }

    #[test]
    fn frame_constants_are_tightly_packed() {
        // Six matrices, one vec4 and six trailing words, padded to 16 bytes.
        assert_eq!(mem::size_of::<Frame>(), 6 * 64 + 16 + 48);
        assert_eq!(mem::size_of::<Frame>() % 16, 0);
    }
}
