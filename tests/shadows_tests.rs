//! Shadow setup integration tests.
//!
//! Cascade partitioning, stabilization and local light fading, checked
//! through the public setup functions and a [`ShadowsPass`] driven with a
//! hand-built render context.

mod common;

use glam::Vec3;
use rstest::rstest;

use common::same_bits;
use deferred_renderer::backend::{RecordingContext, RecordingDevice};
use deferred_renderer::pipeline::shadows::{
    cascade_splits, can_render_local_shadow, local_light_shadow_fade, setup_directional_shadow, MAX_CSM_CASCADES,
};
use deferred_renderer::pipeline::{FrameInfo, RenderContext, RendererPass, ShadowsPass};
use deferred_renderer::resources::{RenderBuffers, RenderTargetPool};
use deferred_renderer::scene::{
    LightShadowParams, PartitionMode, RenderDirectionalLightData, RenderLightBase, RenderList, RenderPointLightData,
    RenderView,
};

fn view(near: f32, far: f32) -> RenderView {
    let mut view = RenderView::new();
    view.set_screen_size(1280, 720);
    view.set_perspective(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 1.0, near, far);
    view
}

fn directional(cascades: u32, mode: PartitionMode, distance: f32) -> RenderDirectionalLightData {
    let mut light = RenderDirectionalLightData {
        cascade_count: cascades,
        partition_mode: mode,
        ..Default::default()
    };
    light.base.shadow.distance = distance;
    light
}

// ============================================================================
// Cascade Tests
// ============================================================================

#[rstest]
fn test_cascade_splits_monotonic_and_bounded(
    #[values(1, 2, 3, 4)] count: u32,
    #[values(PartitionMode::Manual, PartitionMode::Logarithmic, PartitionMode::PSSM)] mode: PartitionMode,
    #[values((1.0, 10000.0, 5000.0), (10.0, 500.0, 5000.0), (0.1, 100000.0, 250.0))] planes: (f32, f32, f32),
) {
    let (near, far, distance) = planes;
    let spacing = [0.3, 0.1, 0.8, 1.0];
    let splits = cascade_splits(mode, &spacing, count, near, far, distance);
    let max = near + distance.min(far - near);

    let mut previous = near;
    for split in splits {
        assert!(split >= previous, "{mode:?} x{count}: {splits:?}");
        assert!(split <= max + 1e-3, "{mode:?} x{count}: {splits:?} above {max}");
        previous = split;
    }
    assert!((splits[count as usize - 1] - max).abs() < 1e-3);
    assert_eq!(splits.len(), MAX_CSM_CASCADES);
}

/// Four PSSM cascades over a 5000 unit shadow distance
#[test]
fn test_single_directional_shadow_setup() {
    let (near, far) = (1.0, 10000.0);
    let view = view(near, far);
    let light = directional(4, PartitionMode::PSSM, 5000.0);
    let shadow = setup_directional_shadow(&view, &light, 0, 2048, 100_000.0);

    assert_eq!(shadow.constants.num_cascades(), 4);
    assert_eq!(shadow.contexts.len(), 4);
    let splits = shadow.constants.cascade_splits.to_array();
    let mut previous = 0.0;
    for split in splits {
        let normalized = (split - near) / (far - near);
        assert!(normalized > previous);
        assert!(normalized <= 0.5 + 1e-3, "{splits:?}");
        previous = normalized;
    }
    for context in &shadow.contexts {
        assert!(context.is_orthographic);
        assert_eq!(context.width(), 2048);
    }
}

#[test]
fn test_cascade_matrices_are_bit_identical_for_static_camera() {
    let light = directional(4, PartitionMode::PSSM, 5000.0);
    let first = setup_directional_shadow(&view(10.0, 10000.0), &light, 0, 1024, 100_000.0);
    let second = setup_directional_shadow(&view(10.0, 10000.0), &light, 0, 1024, 100_000.0);

    for (a, b) in first.contexts.iter().zip(&second.contexts) {
        assert!(same_bits(&a.view, &b.view));
        assert!(same_bits(&a.projection, &b.projection));
    }
    for (a, b) in first
        .constants
        .shadow_matrices
        .iter()
        .zip(second.constants.shadow_matrices.iter())
    {
        assert!(same_bits(a, b));
    }
}

// ============================================================================
// Local Light Tests
// ============================================================================

#[rstest]
#[case::far(2000.0, 0.0)]
#[case::inside_range(500.0, 1.0)]
#[case::half_faded(1250.0, 0.5)]
fn test_point_light_fade(#[case] distance: f32, #[case] expected: f32) {
    let fade = local_light_shadow_fade(Vec3::ZERO, Vec3::new(0.0, 0.0, distance), 500.0, 1000.0, 500.0);
    assert!((fade - expected).abs() < 1e-5, "fade {fade} at {distance}");
}

fn point_light(position: Vec3) -> RenderPointLightData {
    RenderPointLightData {
        base: RenderLightBase {
            shadow: LightShadowParams {
                distance: 1000.0,
                fade_distance: 500.0,
                ..Default::default()
            },
            ..Default::default()
        },
        position,
        radius: 500.0,
        ..Default::default()
    }
}

/// A point light 2000 units away with a 1000 unit shadow
/// distance fades out completely and gets no shadow contexts.
#[rstest]
#[case::faded_out(Vec3::new(0.0, 0.0, -2000.0), false)]
#[case::near(Vec3::new(0.0, 0.0, -600.0), true)]
fn test_point_light_shadow_setup(#[case] position: Vec3, #[case] shadowed: bool) {
    common::init_logging();
    let view = view(10.0, 10000.0);
    let light = point_light(position);
    assert_eq!(
        can_render_local_shadow(&view, &light.base, light.position, light.radius, 100_000.0),
        shadowed
    );

    let mut device = RecordingDevice::new();
    let mut gpu = RecordingContext::new();
    let pool = RenderTargetPool::new();
    let mut buffers = RenderBuffers::new();
    buffers.init(&mut device, &pool, view.width(), view.height()).unwrap();
    let mut list = RenderList::new();
    list.point_lights.push(light);

    let mut pass = ShadowsPass::new();
    pass.init(&mut device).unwrap();
    assert!(pass.is_supported());
    {
        let mut ctx = RenderContext {
            device: &mut device,
            gpu: &mut gpu,
            pool: &pool,
            buffers: &mut buffers,
            view,
            list: &mut list,
            frame: FrameInfo::default(),
        };
        pass.setup_shadows(&mut ctx);
    }

    if shadowed {
        assert_eq!(list.point_lights[0].base.shadow_data_index, 0);
        let shadow = pass.shadow(0).unwrap();
        assert_eq!(shadow.contexts.len(), 6);
        assert!(shadow.fade > 0.0);
    } else {
        assert_eq!(list.point_lights[0].base.shadow_data_index, -1);
        assert!(pass.lights().is_empty());
    }
    pass.dispose(&mut device);
    buffers.release(&mut device, &pool);
}
