//! Frame-to-frame behavior of the renderer.
//!
//! - **History Tests**: TAA, volumetric fog and eye adaptation drop their
//!   history on a camera cut
//! - **Motion Vector Tests**: a still camera clears motion vectors instead of
//!   rendering them
//! - **Eye Adaptation Tests**: histogram fallback on devices without compute

mod common;

use glam::Vec3;
use rstest::rstest;

use common::{basic_scene, camera, camera_at, render_frame, renderer, renderer_with};
use deferred_renderer::backend::{GpuCommand, RecordingDevice, TextureFormat};
use deferred_renderer::pipeline::eye_adaptation::LUMINANCE_FORMAT;
use deferred_renderer::pipeline::volumetric_fog::HISTORY_WEIGHT;
use deferred_renderer::render_graph::PassKind;
use deferred_renderer::scene::{
    AntialiasingMode, EyeAdaptationMode, ExponentialHeightFog, PostProcessSettings, VolumetricFogOptions,
};
use deferred_renderer::RendererConfig;

// ============================================================================
// History Tests
// ============================================================================

#[test]
fn test_camera_cut_drops_temporal_history() {
    let mut renderer = renderer();
    let mut scene = basic_scene(&mut renderer);
    scene.spawn_fog(
        0.0,
        ExponentialHeightFog {
            volumetric: Some(VolumetricFogOptions::default()),
            ..Default::default()
        },
    );
    let settings = PostProcessSettings::default();
    let id = renderer.create_view();

    // First frame has nothing to blend with
    let view_camera = camera(&renderer, 128, 72);
    let report = render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    assert!(report.skipped.is_empty(), "skipped {:?}", report.skipped);
    assert_eq!(renderer.taa().last_blend_strength(), Some(0.0));
    assert_eq!(renderer.volumetric_fog().last_history_weight(), 0.0);

    let view_camera = camera(&renderer, 128, 72);

    render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    assert_eq!(renderer.taa().last_blend_strength(), Some(1.0));
    assert_eq!(renderer.volumetric_fog().last_history_weight(), HISTORY_WEIGHT);
    assert!(!renderer.eye_adaptation().last_history_dropped());

    let mut cut = camera(&renderer, 128, 72);
    cut.is_camera_cut = true;
    render_frame(&mut renderer, &mut scene, id, cut, &settings);
    assert_eq!(renderer.taa().last_blend_strength(), Some(0.0));
    assert_eq!(renderer.volumetric_fog().last_history_weight(), 0.0);
    assert!(renderer.eye_adaptation().last_history_dropped());

    // History is back on the following frame
    let view_camera = camera(&renderer, 128, 72);
    render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    assert_eq!(renderer.taa().last_blend_strength(), Some(1.0));
    assert_eq!(renderer.volumetric_fog().last_history_weight(), HISTORY_WEIGHT);
}

#[test]
fn test_taa_off_releases_history() {
    let mut renderer = renderer();
    let mut scene = basic_scene(&mut renderer);
    let id = renderer.create_view();
    let mut settings = PostProcessSettings::default();
    let view_camera = camera(&renderer, 64, 64);
    render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    assert!(renderer.view_buffers(id).unwrap().temporal_aa.is_some());

    settings.anti_aliasing.mode = AntialiasingMode::None;
    let view_camera = camera(&renderer, 64, 64);
    render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    assert_eq!(renderer.taa().last_blend_strength(), None);
    assert!(!renderer.view_buffers(id).unwrap().temporal_aa.is_some());
}

// ============================================================================
// Motion Vector Tests
// ============================================================================

fn motion_vector_commands(renderer: &common::TestRenderer) -> (bool, bool) {
    let commands = renderer.context().commands_in_event("MotionVectors");
    let cleared = commands.iter().any(|c| matches!(c, GpuCommand::Clear { .. }));
    let drawn = commands.iter().any(GpuCommand::is_draw);
    (cleared, drawn)
}

/// Without jitter and with an unchanged view-projection, motion vectors are
/// cleared to black.
#[rstest]
#[case::still(Vec3::ZERO, true)]
#[case::moved(Vec3::new(25.0, 0.0, 0.0), false)]
fn test_motion_vectors_skip_for_still_camera(#[case] second_position: Vec3, #[case] skipped: bool) {
    let mut renderer = renderer();
    let mut scene = basic_scene(&mut renderer);
    let id = renderer.create_view();
    let mut settings = PostProcessSettings::default();
    settings.anti_aliasing.mode = AntialiasingMode::None;
    settings.motion_blur.enabled = true;

    let view_camera = camera(&renderer, 128, 72);

    render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    let view = camera_at(&renderer, 128, 72, second_position);
    render_frame(&mut renderer, &mut scene, id, view, &settings);

    let (cleared, drawn) = motion_vector_commands(&renderer);
    assert_eq!(cleared, skipped);
    assert_eq!(drawn, !skipped);
    assert!(renderer.view_buffers(id).unwrap().motion_vectors.is_some());
}

#[test]
fn test_taa_jitter_forces_motion_vectors() {
    let mut renderer = renderer();
    let mut scene = basic_scene(&mut renderer);
    let id = renderer.create_view();
    let settings = PostProcessSettings::default();

    let view_camera = camera(&renderer, 128, 72);

    render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    let view_camera = camera(&renderer, 128, 72);
    render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    let (cleared, drawn) = motion_vector_commands(&renderer);
    assert!(!cleared);
    assert!(drawn);
}

// ============================================================================
// Eye Adaptation Tests
// ============================================================================

/// The histogram mode falls back to average luminance when the
/// device has no compute shaders and still produces a 1x1 R16F luminance.
#[test]
fn test_histogram_falls_back_without_compute() {
    let mut renderer = renderer_with(RecordingDevice::without_compute(), RendererConfig::default());
    let mut scene = basic_scene(&mut renderer);
    let id = renderer.create_view();
    let mut settings = PostProcessSettings::default();
    settings.eye_adaptation.mode = EyeAdaptationMode::AutomaticHistogram;

    let view_camera = camera(&renderer, 128, 72);

    let report = render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    assert!(report.skipped.contains(&PassKind::VolumetricFog));
    assert!(report.executed.contains(&PassKind::EyeAdaptation));
    assert_eq!(
        renderer.eye_adaptation().last_mode(),
        Some(EyeAdaptationMode::AutomaticAverageLuminance)
    );
    let commands = renderer.context().commands_in_event("EyeAdaptation");
    assert!(!commands.iter().any(GpuCommand::is_dispatch));

    let luminance = renderer
        .view_buffers(id)
        .unwrap()
        .luminance_map
        .get()
        .copied()
        .unwrap();
    assert_eq!((luminance.desc.width, luminance.desc.height), (1, 1));
    assert_eq!(luminance.desc.format, LUMINANCE_FORMAT);
    assert_eq!(LUMINANCE_FORMAT, TextureFormat::R16Float);
}

#[rstest]
#[case::histogram(EyeAdaptationMode::AutomaticHistogram, true)]
#[case::average(EyeAdaptationMode::AutomaticAverageLuminance, false)]
fn test_histogram_uses_compute_when_available(#[case] mode: EyeAdaptationMode, #[case] dispatches: bool) {
    let mut renderer = renderer();
    let mut scene = basic_scene(&mut renderer);
    let id = renderer.create_view();
    let mut settings = PostProcessSettings::default();
    settings.eye_adaptation.mode = mode;

    let view_camera = camera(&renderer, 128, 72);

    render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    assert_eq!(renderer.eye_adaptation().last_mode(), Some(mode));
    let commands = renderer.context().commands_in_event("EyeAdaptation");
    assert_eq!(commands.iter().any(GpuCommand::is_dispatch), dispatches);
}

#[test]
fn test_manual_exposure_keeps_no_luminance() {
    let mut renderer = renderer();
    let mut scene = basic_scene(&mut renderer);
    let id = renderer.create_view();
    let mut settings = PostProcessSettings::default();
    settings.eye_adaptation.mode = EyeAdaptationMode::Manual;

    let view_camera = camera(&renderer, 64, 64);

    render_frame(&mut renderer, &mut scene, id, view_camera, &settings);
    assert_eq!(renderer.eye_adaptation().last_mode(), Some(EyeAdaptationMode::Manual));
    assert!(!renderer.view_buffers(id).unwrap().luminance_map.is_some());
}
