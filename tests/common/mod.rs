//! Common utilities for renderer integration tests.
//!
//! Every test runs on the recording backend, which stores GPU commands as
//! values so tests can inspect what a frame recorded.

#![allow(dead_code)]

use deferred_renderer::backend::{RecordingContext, RecordingDevice};
use deferred_renderer::renderer::FrameReport;
use deferred_renderer::resources::{GpuMesh, Mesh, ViewId};
use deferred_renderer::scene::{
    DirectionalLight, MaterialInfo, PostProcessSettings, RenderView, Scene, StaticModel, SurfaceAtlasObject,
    Transform,
};
use deferred_renderer::{Renderer, RendererConfig};
use glam::{Mat4, Quat, Vec3};

pub type TestRenderer = Renderer<RecordingDevice, RecordingContext>;

pub const FRAME_TIME: f32 = 1.0 / 60.0;

/// Route `log` output through the test harness
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn renderer() -> TestRenderer {
    renderer_with(RecordingDevice::new(), RendererConfig::default())
}

pub fn renderer_with(device: RecordingDevice, config: RendererConfig) -> TestRenderer {
    init_logging();
    Renderer::new(device, RecordingContext::new(), config)
}

pub fn cube(device: &mut RecordingDevice) -> GpuMesh {
    GpuMesh::upload(device, &Mesh::cube()).expect("cube upload")
}

/// A cube in front of the camera lit by one directional light
pub fn basic_scene(renderer: &mut TestRenderer) -> Scene {
    let mesh = cube(renderer.device_mut());
    let mut scene = Scene::new();
    scene.spawn_model(
        Transform::from_position_scale(Vec3::new(0.0, 0.0, -200.0), Vec3::splat(50.0)),
        StaticModel::new(mesh, MaterialInfo::default()),
    );
    scene.spawn_directional_light(Vec3::new(-0.5, -1.0, -0.5).normalize(), DirectionalLight::default());
    scene
}

/// Camera at the origin looking down -Z
pub fn camera(renderer: &TestRenderer, width: u32, height: u32) -> RenderView {
    camera_at(renderer, width, height, Vec3::ZERO)
}

pub fn camera_at(renderer: &TestRenderer, width: u32, height: u32, position: Vec3) -> RenderView {
    let mut view = renderer.new_view(width, height);
    view.set_perspective(position, Vec3::NEG_Z, Vec3::Y, 1.2, 10.0, 10000.0);
    view
}

/// Record one frame from a clean command list
pub fn render_frame(
    renderer: &mut TestRenderer,
    scene: &mut Scene,
    id: ViewId,
    view: RenderView,
    settings: &PostProcessSettings,
) -> FrameReport {
    render_frame_with_delta(renderer, scene, id, view, settings, FRAME_TIME)
}

pub fn render_frame_with_delta(
    renderer: &mut TestRenderer,
    scene: &mut Scene,
    id: ViewId,
    view: RenderView,
    settings: &PostProcessSettings,
    delta_time: f32,
) -> FrameReport {
    renderer.context_mut().clear();
    renderer.begin_frame(delta_time);
    let report = renderer
        .render(scene, id, view, settings)
        .expect("frame should render");
    renderer.end_frame(scene);
    report
}

/// A cube-shaped atlas participant
pub fn atlas_object(mesh: GpuMesh, id: u64, position: Vec3, size: f32, is_static: bool) -> SurfaceAtlasObject {
    let world = Mat4::from_scale_rotation_translation(Vec3::splat(size), Quat::IDENTITY, position);
    let (local_bounds_min, local_bounds_max) = (mesh.bounds_min, mesh.bounds_max);
    let half = (local_bounds_max - local_bounds_min) * 0.5 * size;
    SurfaceAtlasObject {
        id,
        world,
        local_bounds_min,
        local_bounds_max,
        bounds_center: position,
        bounds_radius: half.length(),
        is_static,
        geometry: mesh,
        material: MaterialInfo::default(),
    }
}

/// Bit-exact matrix comparison
pub fn same_bits(a: &Mat4, b: &Mat4) -> bool {
    a.to_cols_array()
        .iter()
        .zip(b.to_cols_array().iter())
        .all(|(x, y)| x.to_bits() == y.to_bits())
}
