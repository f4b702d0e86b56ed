//! Probe baking and surface atlas integration tests.
//!
//! - **Probe Tests**: bake queue coalescing and the frame-sliced bake job,
//!   driven through the renderer
//! - **Surface Atlas Tests**: defragmentation window and tile reuse across
//!   frames

mod common;

use glam::Vec3;
use rstest::rstest;

use common::{atlas_object, basic_scene, camera, cube, render_frame, render_frame_with_delta, renderer};
use deferred_renderer::pipeline::global_surface_atlas::{AtlasLayout, DEFRAGMENT_INTERVAL, INSERT_FAIL_WINDOW};
use deferred_renderer::probes::WORK_STEPS;
use deferred_renderer::render_graph::PassKind;
use deferred_renderer::scene::{EnvironmentProbe, PostProcessSettings, ProbeKind};
use deferred_renderer::RenderError;

// ============================================================================
// Probe Tests
// ============================================================================

#[test]
fn test_repeated_bake_request_keeps_one_entry() {
    let mut renderer = renderer();
    let mut scene = basic_scene(&mut renderer);
    let probe = scene.spawn_environment_probe(Vec3::new(0.0, 100.0, 0.0), EnvironmentProbe::default());

    renderer.bake_probe(ProbeKind::EnvProbe, probe, 1.0);
    renderer.bake_probe(ProbeKind::EnvProbe, probe, 5.0);
    assert_eq!(renderer.probes().queue_len(), 1);
    assert_eq!(renderer.probes().queued_timeout(ProbeKind::EnvProbe, probe), Some(5.0));

    // A sky light on the same entity is a separate request
    renderer.bake_probe(ProbeKind::SkyLight, probe, 1.0);
    assert_eq!(renderer.probes().queue_len(), 2);
}

/// A probe queued with a 3 second timeout is consumed after four
/// one-second frames and baked over every work step.
#[test]
fn test_probe_bake_after_timeout() {
    let mut renderer = renderer();
    let mut scene = basic_scene(&mut renderer);
    let probe = scene.spawn_environment_probe(
        Vec3::new(0.0, 100.0, 0.0),
        EnvironmentProbe {
            resolution: 16,
            ..Default::default()
        },
    );
    let settings = PostProcessSettings::default();
    let id = renderer.create_view();

    renderer.bake_probe(ProbeKind::EnvProbe, probe, 0.0);
    renderer.bake_probe(ProbeKind::EnvProbe, probe, 3.0);
    assert_eq!(renderer.probes().queue_len(), 1);
    assert_eq!(renderer.probes().queued_timeout(ProbeKind::EnvProbe, probe), Some(3.0));

    for _ in 0..2 {
        let view_camera = camera(&renderer, 64, 64);
        render_frame_with_delta(&mut renderer, &mut scene, id, view_camera, &settings, 1.0);
        assert_eq!(renderer.probes().queue_len(), 1);
        assert!(!renderer.probes().is_busy());
    }
    for _ in 0..2 {
        let view_camera = camera(&renderer, 64, 64);
        render_frame_with_delta(&mut renderer, &mut scene, id, view_camera, &settings, 1.0);
    }
    assert_eq!(renderer.probes().queue_len(), 0);

    let mut frames = 0;
    while renderer.probes().bakes_completed() == 0 {
        assert!(frames < 32, "bake did not finish");
        let view_camera = camera(&renderer, 64, 64);
        let report = render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
        assert!(report.executed.contains(&PassKind::Probes));
        frames += 1;
    }
    assert!(renderer.probes().last_job_steps() >= WORK_STEPS);
    assert!(!renderer.probes().is_busy());

    let texture = scene
        .world()
        .get::<EnvironmentProbe>(probe)
        .and_then(|p| p.texture)
        .unwrap();
    assert_eq!(texture.desc.width, 16);
    assert!(renderer.device().is_texture_alive(texture.handle));
}

// ============================================================================
// Surface Atlas Tests
// ============================================================================

/// An insert failure triggers a defragmentation only inside the failure
/// window and once the last defragmentation is old enough.
#[rstest]
#[case::recent_failure(100, 101, true)]
#[case::window_edge(100, 100 + INSERT_FAIL_WINDOW, true)]
#[case::failure_expired(100, 101 + INSERT_FAIL_WINDOW, false)]
#[case::defragmented_recently(DEFRAGMENT_INTERVAL / 2, DEFRAGMENT_INTERVAL / 2 + 1, false)]
fn test_defragmentation_window(#[case] fail_frame: u64, #[case] frame: u64, #[case] expected: bool) {
    let mut device = deferred_renderer::backend::RecordingDevice::new();
    let mesh = cube(&mut device);
    let mut layout = AtlasLayout::new(256);
    assert!(!layout.needs_defragmentation(frame));

    // Six 128 tiles never fit a 256 atlas
    let huge = atlas_object(mesh, 1, Vec3::new(0.0, 0.0, -100.0), 10_000.0, true);
    let result = layout.update_object(&huge, Vec3::ZERO, fail_frame);
    assert!(matches!(result, Err(RenderError::AtlasInsertFull)));
    assert_eq!(layout.last_frame_insert_fail, Some(fail_frame));

    assert_eq!(layout.needs_defragmentation(frame), expected);
    if expected {
        layout.defragment(frame);
        assert_eq!(layout.object_count(), 0);
        assert_eq!(layout.last_frame_insert_fail, None);
        assert!(!layout.needs_defragmentation(frame + 1));
    }
}

#[test]
fn test_static_object_keeps_its_tiles() {
    let mut device = deferred_renderer::backend::RecordingDevice::new();
    let mesh = cube(&mut device);
    let mut layout = AtlasLayout::new(1024);
    let object = atlas_object(mesh, 5, Vec3::new(0.0, 0.0, -400.0), 300.0, true);

    layout.update_object(&object, Vec3::ZERO, 1).unwrap();
    let first: Vec<_> = layout
        .object(5)
        .unwrap()
        .tiles
        .iter()
        .map(|tile| tile.and_then(|id| layout.tile_rect(id)).unwrap())
        .collect();

    layout.update_object(&object, Vec3::ZERO, 2).unwrap();
    let state = layout.object(5).unwrap();
    let second: Vec<_> = state
        .tiles
        .iter()
        .map(|tile| tile.and_then(|id| layout.tile_rect(id)).unwrap())
        .collect();
    assert_eq!(first, second);
    assert!(state.next_redraw_frame > 2);
}

/// A static model is rasterized into the atlas on its first frame
/// only.
#[test]
fn test_static_model_is_not_redrawn() {
    let mut renderer = renderer();
    let mut scene = basic_scene(&mut renderer);
    let id = renderer.create_view();
    let mut settings = PostProcessSettings::default();
    settings.global_illumination.enabled = true;

    let view_camera = camera(&renderer, 128, 72);

    let report = render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    assert!(report.executed.contains(&PassKind::GlobalSurfaceAtlas));
    let first = renderer.context().commands_in_event("GlobalSurfaceAtlas");
    assert!(first.iter().any(|c| c.is_draw()));

    let view_camera = camera(&renderer, 128, 72);

    render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    assert!(renderer.context().commands_in_event("GlobalSurfaceAtlas").is_empty());
    // Lighting of the atlas still runs every frame
    assert!(!renderer
        .context()
        .commands_in_event("GlobalSurfaceAtlas.DirectLighting")
        .is_empty());
}
