//! End-to-end pipeline tests. Every test drives the real compute kernels on
//! whatever adapter the machine offers and skips cleanly when there is none.

use glam::{Mat4, UVec2, Vec3};
use half::f16;

use glimmer::{
    Camera, ClusterAabb, Config, Context, Error, GBuffer, Light, LightStore, Renderer,
    MAX_LIGHTS_PER_CLUSTER, MAX_TOTAL_LIGHT_INDICES,
};

fn create_context() -> Option<Context> {
    let _ = env_logger::builder().is_test(true).try_init();

    match Context::new() {
        Ok(context) => Some(context),
        Err(err) => {
            eprintln!("skipping gpu test: {err}");
            None
        }
    }
}

/// Caller-side frame resources: a flat plane at view depth 5 facing the
/// camera, which sits at the origin looking down negative z.
struct Scene {
    position: wgpu::Texture,
    normal: wgpu::Texture,
    albedo: wgpu::Texture,
    depth: wgpu::Texture,
    motion: wgpu::Texture,
    output: wgpu::Texture,
    camera: Camera,
    size: UVec2,
}

const PLANE_DEPTH: f32 = 5.0;

impl Scene {
    fn new(context: &Context, width: u32, height: u32) -> Self {
        let camera = Camera::new(
            Mat4::IDENTITY,
            Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, width as f32 / height as f32, 0.1, 10.0),
            0.1,
            10.0,
        );

        let pixels = (width * height) as usize;
        let inv_proj = camera.proj.inverse();

        let mut positions = Vec::with_capacity(pixels * 4);
        for y in 0..height {
            for x in 0..width {
                let ndc_x = (x as f32 + 0.5) / width as f32 * 2.0 - 1.0;
                let ndc_y = 1.0 - (y as f32 + 0.5) / height as f32 * 2.0;
                let clip = glam::Vec4::new(ndc_x, ndc_y, 1.0, 1.0);
                let ray = inv_proj * clip;
                let ray = ray.truncate() / ray.w;
                let world = ray * (PLANE_DEPTH / -ray.z);
                positions.extend_from_slice(&[world.x, world.y, world.z, 1.0]);
            }
        }

        let normals: Vec<f16> = (0..pixels)
            .flat_map(|_| [f16::from_f32(0.0), f16::from_f32(0.0), f16::from_f32(1.0), f16::ZERO])
            .collect();
        let albedo: Vec<u8> = (0..pixels).flat_map(|_| [128, 128, 128, 255]).collect();
        let depths: Vec<f32> = vec![PLANE_DEPTH; pixels];
        let motion: Vec<f16> = vec![f16::ZERO; pixels * 2];

        let scene = Self {
            position: create_input_texture(context, width, height, wgpu::TextureFormat::Rgba32Float),
            normal: create_input_texture(context, width, height, wgpu::TextureFormat::Rgba16Float),
            albedo: create_input_texture(context, width, height, wgpu::TextureFormat::Rgba8Unorm),
            depth: create_input_texture(context, width, height, wgpu::TextureFormat::R32Float),
            motion: create_input_texture(context, width, height, wgpu::TextureFormat::Rg16Float),
            output: create_output_texture(context, width, height),
            camera,
            size: UVec2::new(width, height),
        };

        scene.write(context, &scene.position, bytemuck::cast_slice(&positions), 16);
        scene.write(context, &scene.normal, bytemuck::cast_slice(&normals), 8);
        scene.write(context, &scene.albedo, &albedo, 4);
        scene.write(context, &scene.depth, bytemuck::cast_slice(&depths), 4);
        scene.write(context, &scene.motion, bytemuck::cast_slice(&motion), 4);
        scene
    }

    fn write(&self, context: &Context, texture: &wgpu::Texture, data: &[u8], texel_size: u32) {
        context.queue.write_texture(
            texture.as_image_copy(),
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(self.size.x * texel_size),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: self.size.x,
                height: self.size.y,
                depth_or_array_layers: 1,
            },
        );
    }

    fn set_motion(&self, context: &Context, motion: [f32; 2]) {
        let texels: Vec<f16> = (0..(self.size.x * self.size.y) as usize)
            .flat_map(|_| [f16::from_f32(motion[0]), f16::from_f32(motion[1])])
            .collect();
        self.write(context, &self.motion, bytemuck::cast_slice(&texels), 4);
    }

    fn gbuffer(&self) -> GBuffer {
        GBuffer {
            position: &self.position,
            normal: &self.normal,
            albedo: &self.albedo,
            depth: &self.depth,
            motion: &self.motion,
        }
    }

    fn read_output(&self, context: &Context) -> Vec<[f32; 4]> {
        let data = glimmer::read_texture(context, &self.output);
        let texels: &[f16] = bytemuck::cast_slice(&data);
        texels
            .chunks_exact(4)
            .map(|texel| [texel[0].to_f32(), texel[1].to_f32(), texel[2].to_f32(), texel[3].to_f32()])
            .collect()
    }
}

fn create_input_texture(
    context: &Context,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
) -> wgpu::Texture {
    context.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("test gbuffer"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

fn create_output_texture(context: &Context, width: u32, height: u32) -> wgpu::Texture {
    context.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("test output"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba16Float,
        usage: wgpu::TextureUsages::STORAGE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

fn sphere_overlaps(center: Vec3, radius: f32, aabb: &ClusterAabb) -> bool {
    let closest = center.clamp(aabb.min.truncate(), aabb.max.truncate());
    (closest - center).length_squared() <= radius * radius
}

#[test]
fn cluster_coverage_matches_cpu_reference() {
    let Some(mut context) = create_context() else { return };

    let config = Config {
        grid_dim: [2, 2, 1],
        ..Config::default()
    };
    let mut renderer = Renderer::new(config);
    renderer.initialize(&mut context, 16, 16).unwrap();

    let scene = Scene::new(&context, 16, 16);
    let mut lights = LightStore::new();
    let light_pos = Vec3::new(0.0, 0.0, -5.0);
    let range = 3.0;
    lights
        .add(Light::point(light_pos, Vec3::ONE, 10.0, range))
        .unwrap();

    renderer
        .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
        .unwrap();

    let meta = renderer.read_cluster_meta(&context).unwrap();
    let aabbs = renderer.cluster_aabbs().unwrap().to_vec();
    assert_eq!(meta.len(), 4);
    assert_eq!(aabbs.len(), 4);

    let mut total = 0;
    for (cluster, ([count, offset], aabb)) in meta.iter().zip(&aabbs).enumerate() {
        // The camera view is the identity, so the light's view-space
        // position equals its world position.
        let expected = sphere_overlaps(light_pos, range, aabb);
        assert_eq!(
            *count,
            u32::from(expected),
            "cluster {cluster} disagrees with the cpu sphere-aabb test"
        );
        assert!(*count <= MAX_LIGHTS_PER_CLUSTER);

        if *count > 0 {
            let indices = renderer
                .read_light_indices(&context, offset + count)
                .unwrap();
            assert_eq!(indices[*offset as usize], 0, "only light 0 exists");
        }
        total += count;
    }

    // The sphere sits on the shared corner of all four clusters.
    assert!(total > 0, "the light must land in at least one cluster");
    assert!(total <= MAX_TOTAL_LIGHT_INDICES);
}

#[test]
fn directional_lights_reach_every_cluster() {
    let Some(mut context) = create_context() else { return };

    let config = Config {
        grid_dim: [4, 4, 4],
        ..Config::default()
    };
    let mut renderer = Renderer::new(config);
    renderer.initialize(&mut context, 32, 32).unwrap();

    let scene = Scene::new(&context, 32, 32);
    let mut lights = LightStore::new();
    // A point light far outside the frustum plus the sun.
    lights
        .add(Light::point(Vec3::new(500.0, 0.0, 0.0), Vec3::ONE, 1.0, 1.0))
        .unwrap();
    let sun = lights
        .add(Light::directional(Vec3::new(-0.3, -1.0, -0.2), Vec3::ONE, 2.0))
        .unwrap();

    renderer
        .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
        .unwrap();

    let meta = renderer.read_cluster_meta(&context).unwrap();
    let indices = renderer
        .read_light_indices(&context, MAX_TOTAL_LIGHT_INDICES)
        .unwrap();

    for (cluster, [count, offset]) in meta.iter().enumerate() {
        let span = &indices[*offset as usize..(*offset + *count) as usize];
        assert!(
            span.contains(&sun),
            "cluster {cluster} is missing the directional light"
        );
        assert!(!span.contains(&0), "the distant point light leaked into cluster {cluster}");
    }
}

#[test]
fn zero_lights_render_stays_exactly_black() {
    let Some(mut context) = create_context() else { return };

    let mut renderer = Renderer::new(Config::default());
    renderer.initialize(&mut context, 16, 16).unwrap();

    let scene = Scene::new(&context, 16, 16);
    let mut lights = LightStore::new();

    for frame in 0..60 {
        renderer
            .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
            .unwrap();

        if frame % 15 == 0 || frame == 59 {
            for (pixel, texel) in scene.read_output(&context).iter().enumerate() {
                for channel in &texel[..3] {
                    assert!(channel.is_finite(), "frame {frame}, pixel {pixel} is not finite");
                    assert_eq!(*channel, 0.0, "frame {frame}, pixel {pixel} is not black");
                }
            }
        }
    }
}

#[test]
fn temporal_reuse_plateaus_at_the_sample_cap() {
    let Some(mut context) = create_context() else { return };

    let mut config = Config {
        grid_dim: [1, 1, 1],
        ..Config::default()
    };
    config.restir.initial_candidates = 8;
    config.restir.temporal_max_m = 20;
    config.restir.spatial_iterations = 0;

    let mut renderer = Renderer::new(config);
    renderer.initialize(&mut context, 8, 8).unwrap();

    let scene = Scene::new(&context, 8, 8);
    let mut lights = LightStore::new();
    // In front of the plane so the cosine term stays positive.
    lights
        .add(Light::point(Vec3::new(0.0, 0.0, -3.0), Vec3::ONE, 10.0, 12.0))
        .unwrap();

    for _ in 0..10 {
        renderer
            .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
            .unwrap();
    }

    for (pixel, reservoir) in renderer.read_reservoirs(&context).unwrap().iter().enumerate() {
        assert_eq!(
            reservoir.m, 20,
            "pixel {pixel} should have plateaued at the temporal cap"
        );
        assert_eq!(reservoir.light_index, 0, "pixel {pixel} lost the only light");
        assert!(reservoir.w.is_finite());
    }

    // 8 candidates x 20 temporal cap, no spatial factor.
    assert_eq!(renderer.stats().effective_spp, 160);
}

#[test]
fn motion_out_of_bounds_restarts_denoiser_history() {
    let Some(mut context) = create_context() else { return };

    let mut renderer = Renderer::new(Config::default());
    renderer.initialize(&mut context, 16, 16).unwrap();

    let scene = Scene::new(&context, 16, 16);
    let mut lights = LightStore::new();
    lights
        .add(Light::point(Vec3::new(0.0, 0.0, -3.0), Vec3::ONE, 10.0, 12.0))
        .unwrap();

    for _ in 0..6 {
        renderer
            .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
            .unwrap();
    }

    let history = renderer.read_history_length(&context).unwrap();
    assert!(
        history.iter().all(|&length| length > 4.0),
        "static frames should have accumulated history"
    );

    // Every pixel now reprojects off-screen, as if the camera snapped
    // sideways by a hundred pixels.
    scene.set_motion(&context, [100.0, 0.0]);
    renderer
        .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
        .unwrap();

    let history = renderer.read_history_length(&context).unwrap();
    for (pixel, length) in history.iter().enumerate() {
        assert_eq!(*length, 1.0, "pixel {pixel} kept stale history across a disocclusion");
    }
}

#[test]
fn consecutive_resets_match_a_single_reset() {
    let Some(mut context) = create_context() else { return };

    let mut renderer = Renderer::new(Config::default());
    renderer.initialize(&mut context, 8, 8).unwrap();

    let scene = Scene::new(&context, 8, 8);
    let mut lights = LightStore::new();
    lights
        .add(Light::point(Vec3::new(0.0, 0.0, -3.0), Vec3::ONE, 10.0, 12.0))
        .unwrap();

    let mut snapshot = |renderer: &mut Renderer, context: &mut Context, resets: u32| {
        for _ in 0..4 {
            renderer
                .render(context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
                .unwrap();
        }
        for _ in 0..resets {
            renderer.reset_temporal_history();
        }
        renderer
            .render(context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
            .unwrap();
        (
            renderer.read_reservoirs(context).unwrap(),
            renderer.read_history_length(context).unwrap(),
        )
    };

    let (reservoirs_once, history_once) = snapshot(&mut renderer, &mut context, 1);
    let (reservoirs_twice, history_twice) = snapshot(&mut renderer, &mut context, 2);

    assert_eq!(reservoirs_once, reservoirs_twice);
    assert_eq!(history_once, history_twice);
    assert!(history_once.iter().all(|&length| length == 1.0));
}

#[test]
fn resize_to_same_dimensions_preserves_history() {
    let Some(mut context) = create_context() else { return };

    let mut renderer = Renderer::new(Config::default());
    renderer.initialize(&mut context, 16, 16).unwrap();

    let scene = Scene::new(&context, 16, 16);
    let mut lights = LightStore::new();
    lights
        .add(Light::point(Vec3::new(0.0, 0.0, -3.0), Vec3::ONE, 10.0, 12.0))
        .unwrap();

    for _ in 0..6 {
        renderer
            .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
            .unwrap();
    }

    renderer.resize(&context, 16, 16).unwrap();
    renderer
        .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
        .unwrap();

    let history = renderer.read_history_length(&context).unwrap();
    assert!(
        history.iter().all(|&length| length > 2.0),
        "a same-size resize must not drop temporal history"
    );

    // A real resize starts over.
    renderer.resize(&context, 24, 24).unwrap();
    let scene = Scene::new(&context, 24, 24);
    renderer
        .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
        .unwrap();
    let history = renderer.read_history_length(&context).unwrap();
    assert_eq!(history.len(), 24 * 24);
    assert!(history.iter().all(|&length| length == 1.0));
}

#[test]
fn light_index_budget_holds_under_load() {
    let Some(mut context) = create_context() else { return };

    let mut renderer = Renderer::new(Config::default());
    renderer.initialize(&mut context, 64, 64).unwrap();

    let scene = Scene::new(&context, 64, 64);
    let mut lights = LightStore::new();
    let mut rng_state = 0x1234_5678u32;
    let mut rand = move || {
        rng_state = rng_state.wrapping_mul(1664525).wrapping_add(1013904223);
        (rng_state >> 8) as f32 / (1 << 24) as f32
    };

    for i in 0..200 {
        let position = Vec3::new(rand() * 16.0 - 8.0, rand() * 16.0 - 8.0, -rand() * 9.0);
        if i % 4 == 0 {
            lights
                .add(Light::spot(position, Vec3::new(0.0, 0.0, -1.0), Vec3::ONE, 5.0, 6.0, 0.3, 0.6))
                .unwrap();
        } else {
            lights
                .add(Light::point(position, Vec3::ONE, 5.0, 4.0 + rand() * 6.0))
                .unwrap();
        }
    }

    renderer
        .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
        .unwrap();

    let meta = renderer.read_cluster_meta(&context).unwrap();
    let mut total = 0u64;
    for [count, _] in &meta {
        assert!(*count <= MAX_LIGHTS_PER_CLUSTER);
        total += u64::from(*count);
    }
    assert!(total <= u64::from(MAX_TOTAL_LIGHT_INDICES));

    for texel in scene.read_output(&context) {
        assert!(texel.iter().all(|channel| channel.is_finite()));
    }
}

#[test]
fn render_before_initialize_is_rejected() {
    let Some(mut context) = create_context() else { return };

    let mut renderer = Renderer::new(Config::default());
    let scene = Scene::new(&context, 8, 8);
    let mut lights = LightStore::new();

    let result = renderer.render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output);
    assert!(matches!(result, Err(Error::NotInitialized)));

    // A bad grid leaves the renderer in the pre-init state.
    let config = Config {
        grid_dim: [0, 9, 24],
        ..Config::default()
    };
    let mut renderer = Renderer::new(config);
    assert!(matches!(
        renderer.initialize(&mut context, 8, 8),
        Err(Error::InvalidGrid { .. })
    ));
    assert!(!renderer.is_initialized());

    let result = renderer.render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output);
    assert!(matches!(result, Err(Error::NotInitialized)));
}

#[test]
fn mismatched_gbuffer_skips_the_frame_with_black_output() {
    let Some(mut context) = create_context() else { return };

    use std::cell::RefCell;
    use std::rc::Rc;

    let mut renderer = Renderer::new(Config::default());
    renderer.initialize(&mut context, 16, 16).unwrap();

    let reported = Rc::new(RefCell::new(Vec::new()));
    let sink = reported.clone();
    renderer.set_error_callback(move |err| sink.borrow_mut().push(err.to_string()));

    let scene = Scene::new(&context, 16, 16);
    let small = Scene::new(&context, 8, 8);
    let mut lights = LightStore::new();
    lights
        .add(Light::point(Vec3::new(0.0, 0.0, -3.0), Vec3::ONE, 10.0, 12.0))
        .unwrap();

    // Wrong-size depth attachment: the frame must be skipped, not fail.
    let broken = GBuffer {
        position: &scene.position,
        normal: &scene.normal,
        albedo: &scene.albedo,
        depth: &small.depth,
        motion: &scene.motion,
    };
    renderer
        .render(&context, &scene.camera, &mut lights, &broken, &scene.output)
        .unwrap();

    assert_eq!(reported.borrow().len(), 1);
    assert!(reported.borrow()[0].contains("depth buffer"));

    for texel in scene.read_output(&context) {
        assert_eq!(&texel[..3], &[0.0, 0.0, 0.0]);
    }
}

#[test]
fn stage_toggles_fall_back_gracefully() {
    let Some(mut context) = create_context() else { return };

    let mut renderer = Renderer::new(Config::default());
    renderer.initialize(&mut context, 16, 16).unwrap();

    let scene = Scene::new(&context, 16, 16);
    let mut lights = LightStore::new();
    lights
        .add(Light::point(Vec3::new(0.0, 0.0, -3.0), Vec3::ONE, 10.0, 12.0))
        .unwrap();

    // Restir off: the denoiser sees a zero field, so the composite is black.
    renderer.set_restir_enabled(false);
    renderer
        .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
        .unwrap();
    for texel in scene.read_output(&context) {
        assert_eq!(&texel[..3], &[0.0, 0.0, 0.0]);
    }

    // Svgf off: the raw restir image is copied through unmodified.
    renderer.set_restir_enabled(true);
    renderer.set_svgf_enabled(false);
    renderer
        .render(&context, &scene.camera, &mut lights, &scene.gbuffer(), &scene.output)
        .unwrap();
    for texel in scene.read_output(&context) {
        assert!(texel.iter().all(|channel| channel.is_finite()));
    }
}
