use std::borrow::Cow;

use glam::UVec3;

use crate::{
    context::{Context, ShaderDefValue},
    error::{Error, Result},
    util,
};

/// Fixed work-group edge of every image-space kernel.
pub const WORKGROUP_SIZE: u32 = 8;

/// Resource class a kernel expects at a binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// `texture_2d<f32>`, read-only during the dispatch.
    Texture { filterable: bool },
    /// `texture_storage_2d<_, write>`.
    StorageImage { format: wgpu::TextureFormat },
    /// `var<storage>` buffer; read+write within one dispatch, visible to
    /// later dispatches at the pass boundary.
    Storage { read_only: bool },
    Uniform,
}

/// The binding contract of one compute kernel: an ordered table of
/// `(slot, class)` pairs at group 1, plus the push constant footprint.
/// Group 0 is always the shared frame constants.
pub struct KernelDesc {
    pub name: &'static str,
    pub entry_point: &'static str,
    pub bindings: &'static [Slot],
    pub push_constant_size: u32,
}

pub struct Kernel {
    desc: &'static KernelDesc,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl Kernel {
    pub fn new(
        context: &mut Context,
        const_layout: &wgpu::BindGroupLayout,
        desc: &'static KernelDesc,
        source: &str,
        path: &str,
        shader_defs: &[(&str, ShaderDefValue)],
    ) -> Result<Kernel> {
        let module = context.create_shader_module(desc.name, source, path, shader_defs)?;

        let shader = context
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.name),
                source: wgpu::ShaderSource::Naga(Cow::Owned(module)),
            });

        let entries: Vec<_> = desc
            .bindings
            .iter()
            .enumerate()
            .map(|(binding, slot)| wgpu::BindGroupLayoutEntry {
                binding: binding as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: match *slot {
                    Slot::Texture { filterable } => wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    Slot::StorageImage { format } => wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        format,
                    },
                    Slot::Storage { read_only } => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    Slot::Uniform => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                },
                count: None,
            })
            .collect();

        let bind_group_layout =
            context
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(desc.name),
                    entries: &entries,
                });

        let push_constant_ranges = if desc.push_constant_size > 0 {
            vec![wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::COMPUTE,
                range: 0..desc.push_constant_size,
            }]
        } else {
            Vec::new()
        };

        let pipeline_layout =
            context
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(desc.name),
                    bind_group_layouts: &[const_layout, &bind_group_layout],
                    push_constant_ranges: &push_constant_ranges,
                });

        let pipeline = context
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(desc.name),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: desc.entry_point,
            });

        Ok(Self {
            desc,
            pipeline,
            bind_group_layout,
        })
    }

    pub fn pipeline(&self) -> &wgpu::ComputePipeline {
        &self.pipeline
    }

    /// Builds a bind group after checking each resource against the kernel's
    /// declared binding table.
    pub fn bind<'a>(
        &self,
        context: &Context,
        resources: &[wgpu::BindingResource<'a>],
    ) -> Result<wgpu::BindGroup> {
        if resources.len() != self.desc.bindings.len() {
            return Err(Error::Configuration {
                kernel: self.desc.name,
                slot: resources.len() as u32,
                reason: format!(
                    "expected {} bound resources, got {}",
                    self.desc.bindings.len(),
                    resources.len()
                ),
            });
        }

        for (slot, (declared, resource)) in
            self.desc.bindings.iter().zip(resources.iter()).enumerate()
        {
            let slot = slot as u32;
            match (declared, resource) {
                (Slot::Storage { .. }, wgpu::BindingResource::Buffer(binding)) => {
                    if !binding.buffer.usage().contains(wgpu::BufferUsages::STORAGE) {
                        return Err(Error::Configuration {
                            kernel: self.desc.name,
                            slot,
                            reason: "buffer is missing STORAGE usage".into(),
                        });
                    }
                }
                (Slot::Uniform, wgpu::BindingResource::Buffer(binding)) => {
                    if !binding.buffer.usage().contains(wgpu::BufferUsages::UNIFORM) {
                        return Err(Error::Configuration {
                            kernel: self.desc.name,
                            slot,
                            reason: "buffer is missing UNIFORM usage".into(),
                        });
                    }
                }
                (Slot::Texture { .. }, wgpu::BindingResource::TextureView(_))
                | (Slot::StorageImage { .. }, wgpu::BindingResource::TextureView(_)) => {}
                (declared, _) => {
                    return Err(Error::Configuration {
                        kernel: self.desc.name,
                        slot,
                        reason: format!("resource does not match declared class {declared:?}"),
                    });
                }
            }
        }

        let entries: Vec<_> = resources
            .iter()
            .enumerate()
            .map(|(binding, resource)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: resource.clone(),
            })
            .collect();

        Ok(context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(self.desc.name),
                layout: &self.bind_group_layout,
                entries: &entries,
            }))
    }
}

/// Dispatch size for image-space kernels.
pub fn image_groups(width: u32, height: u32) -> (u32, u32) {
    (
        util::div_ceil(width, WORKGROUP_SIZE),
        util::div_ceil(height, WORKGROUP_SIZE),
    )
}

/// Dispatch size for cluster kernels; one invocation owns one cluster.
pub fn cluster_groups(dim: UVec3) -> (u32, u32, u32) {
    (
        util::div_ceil(dim.x, WORKGROUP_SIZE),
        util::div_ceil(dim.y, WORKGROUP_SIZE),
        dim.z,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_groups_cover_the_viewport() {
        assert_eq!(image_groups(1920, 1080), (240, 135));
        assert_eq!(image_groups(16, 16), (2, 2));
        assert_eq!(image_groups(17, 9), (3, 2));
    }

    #[test]
    fn cluster_groups_span_every_slice() {
        assert_eq!(cluster_groups(UVec3::new(16, 9, 24)), (2, 2, 24));
        assert_eq!(cluster_groups(UVec3::new(2, 2, 1)), (1, 1, 1));
    }
}
