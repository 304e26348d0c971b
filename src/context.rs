use log::{info, warn};

use crate::error::{Error, Result};

pub use naga_oil::compose::ShaderDefValue;

/// Headless gpu context shared by every pipeline stage.
///
/// Owns the device and queue plus the shader composer used to stitch the
/// compute kernels together with the shared wgsl modules under
/// `shaders/include/`.
pub struct Context {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub limits: wgpu::Limits,
    pub backend: wgpu::Backend,
    pub timestamps_supported: bool,
    shader_composer: naga_oil::compose::Composer,
}

impl Context {
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            dx12_shader_compiler: wgpu::Dx12Compiler::Fxc,
            backends: wgpu::Backends::all(),
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(Error::NoAdapter)?;

        let adapter_info = adapter.get_info();
        let timestamps_supported = adapter
            .features()
            .contains(wgpu::Features::TIMESTAMP_QUERY);

        let mut features = wgpu::Features::PUSH_CONSTANTS;
        if timestamps_supported {
            features |= wgpu::Features::TIMESTAMP_QUERY;
        } else {
            warn!("adapter has no timestamp queries, gpu timings will read 0");
        }

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                limits: wgpu::Limits {
                    max_push_constant_size: 128,
                    ..Default::default()
                },
                label: Some("device"),
                features,
            },
            None,
        ))?;

        info!(
            "gpu context on {} ({:?})",
            adapter_info.name, adapter_info.backend
        );

        let shader_composer = create_shader_composer();

        Ok(Self {
            limits: adapter.limits(),
            backend: adapter_info.backend,
            device,
            queue,
            timestamps_supported,
            shader_composer,
        })
    }

    pub fn create_shader_module(
        &mut self,
        name: &'static str,
        source: &str,
        path: &str,
        shader_defs: &[(&str, ShaderDefValue)],
    ) -> Result<naga::Module> {
        let shader_defs = shader_defs
            .iter()
            .map(|(key, value)| (key.to_string(), *value))
            .collect();

        self.shader_composer
            .make_naga_module(naga_oil::compose::NagaModuleDescriptor {
                source,
                file_path: path,
                shader_defs,
                ..Default::default()
            })
            .map_err(|err| {
                let reason = err.emit_to_string(&self.shader_composer);
                Error::KernelLoadFailed { name, reason }
            })
    }
}

fn create_shader_composer() -> naga_oil::compose::Composer {
    let mut composer = naga_oil::compose::Composer::default();
    composer.validate = false;

    macro_rules! add_include {
        ($file_path:literal) => {
            composer
                .add_composable_module(naga_oil::compose::ComposableModuleDescriptor {
                    source: include_str!($file_path),
                    file_path: $file_path,
                    ..Default::default()
                })
                .unwrap_or_else(|err| panic!("failed to include shader {}: {err}", $file_path));
        };
    }

    add_include!("shaders/include/util.wgsl");
    add_include!("shaders/include/frame.wgsl");
    add_include!("shaders/include/light.wgsl");
    add_include!("shaders/include/reservoir.wgsl");

    composer
}
