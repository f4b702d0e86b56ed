//! Environment probe and sky light capture
//!
//! [`ProbesRenderer`] bakes one probe at a time. A bake renders the six
//! cube faces and then filters the mip chain, spread over several frames
//! by a per-frame work budget. Once the GPU had time to finish, the cube is
//! handed to the actor and, unless the probe updates in realtime, read back
//! on a worker thread as the baked asset.

mod download;

pub use download::*;

use std::collections::HashSet;
use std::sync::Arc;

use bevy_ecs::entity::Entity;
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use serde::{Deserialize, Serialize};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::{create_constant_buffer, ensure_setup, update_cb, PipelineStates, RendererPass};
use crate::resources::{RenderTargetPool, ShaderLibrary, TextureData};
use crate::scene::{ProbeCaptureInfo, ProbeKind, ProbeUpdateMode, RenderView, Scene, StaticFlags, ViewFlags};

pub const SHADER: &str = "Shaders/ProbesFilter";

pub const CB_SLOT: u32 = 0;
pub const SOURCE_SR_SLOT: u32 = 0;

/// Frames between the last bake step and reading the cube back
pub const PROBES_RENDERER_LATENCY_FRAMES: u64 = 1;

/// Six faces plus the filtering step
pub const WORK_STEPS: u32 = 7;

pub const CUBE_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

const MIN_NEAR_PLANE: f32 = 0.1;
const MIN_DEPTH_RANGE: f32 = 100.0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ProbeFilterData {
    /// (face, mip, source mip, 1 / source size)
    pub params: Vec4,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(SHADER, &[std::mem::size_of::<ProbeFilterData>()]);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbesConfig {
    /// Frames to wait after a bake before reading it back
    pub latency_frames: u64,
    /// Bake steps run per frame
    pub max_work_per_frame: u32,
    /// Seconds without work before every resource is released
    pub release_timeout: f32,
    /// Cube face size for probes that do not pick one
    pub default_resolution: u32,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            latency_frames: PROBES_RENDERER_LATENCY_FRAMES,
            max_work_per_frame: 1,
            release_timeout: 30.0,
            default_resolution: 128,
        }
    }
}

/// Queued bake request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeEntry {
    pub kind: ProbeKind,
    pub entity: Entity,
    /// Seconds until the bake may start
    pub timeout: f32,
}

/// Device state a probe bake records into
pub struct ProbeFrame<'a> {
    pub device: &'a mut dyn GpuDevice,
    pub gpu: &'a mut dyn GpuContext,
    pub pool: &'a RenderTargetPool,
    pub shaders: &'a ShaderLibrary,
    pub frame_index: u64,
}

/// Renders the scene for one cube face
pub trait ProbeFaceRenderer {
    /// Draw `scene` as seen by `view` into `target`, an HDR texture of the face size
    fn render_face(&mut self, frame: &mut ProbeFrame<'_>, scene: &mut Scene, view: &RenderView, target: &GpuTexture);
}

/// Near and far planes of a capture. The far plane grows to cover point
/// lights whose range reaches into the probe.
pub fn capture_planes(info: &ProbeCaptureInfo, point_lights: &[(glam::Vec3, f32)]) -> (f32, f32) {
    let near = info.capture_near_plane.max(MIN_NEAR_PLANE);
    let mut far = info.radius.max(near + MIN_DEPTH_RANGE);
    for (position, radius) in point_lights {
        far = far.max(position.distance(info.position) + radius);
    }
    (near, far)
}

struct ActiveBake {
    entry: ProbeEntry,
    info: ProbeCaptureInfo,
    near: f32,
    far: f32,
    resolution: u32,
    cube: GpuTexture,
    step: u32,
    /// Frame of the last step
    finished_frame: Option<u64>,
}

struct PendingDownload {
    kind: ProbeKind,
    entity: Entity,
    handle: DownloadHandle<Arc<TextureData>>,
}

/// Bakes environment probes and sky lights into cube textures
#[derive(Default)]
pub struct ProbesRenderer {
    config: ProbesConfig,
    queue: Vec<ProbeEntry>,
    current: Option<ActiveBake>,
    downloads: Vec<PendingDownload>,
    /// Cubes created here and handed to actors
    owned: HashSet<TextureHandle>,
    states: PipelineStates,
    handle: Option<PipelineStateHandle>,
    cb: Option<GpuBuffer>,
    idle_time: f32,
    bakes_completed: u32,
    last_job_steps: u32,
}

impl ProbesRenderer {
    pub fn new(config: ProbesConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &ProbesConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.handle.is_some()
    }

    /// Request a bake. A request for an already queued actor only replaces
    /// its timeout.
    pub fn bake(&mut self, kind: ProbeKind, entity: Entity, timeout: f32) {
        if let Some(entry) = self
            .queue
            .iter_mut()
            .find(|e| e.kind == kind && e.entity == entity)
        {
            entry.timeout = timeout;
            return;
        }
        log::debug!("ProbesRenderer: queued {kind:?} {entity:?} in {timeout}s");
        self.queue.push(ProbeEntry { kind, entity, timeout });
    }

    pub fn queue(&self) -> &[ProbeEntry] {
        &self.queue
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_timeout(&self, kind: ProbeKind, entity: Entity) -> Option<f32> {
        self.queue
            .iter()
            .find(|e| e.kind == kind && e.entity == entity)
            .map(|e| e.timeout)
    }

    /// A bake is in flight
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Step of the bake in flight
    pub fn current_step(&self) -> Option<u32> {
        self.current.as_ref().map(|c| c.step)
    }

    pub fn bakes_completed(&self) -> u32 {
        self.bakes_completed
    }

    /// Steps the last finished bake ran
    pub fn last_job_steps(&self) -> u32 {
        self.last_job_steps
    }

    pub fn pending_downloads(&self) -> usize {
        self.downloads.len()
    }

    /// Advance the service by one frame
    pub fn update(
        &mut self,
        frame: &mut ProbeFrame<'_>,
        scene: &mut Scene,
        delta_time: f32,
        faces: &mut dyn ProbeFaceRenderer,
    ) {
        self.poll_downloads(scene);

        for entity in scene.realtime_probes() {
            self.bake(ProbeKind::EnvProbe, entity, 0.0);
        }
        for entry in &mut self.queue {
            entry.timeout -= delta_time;
        }

        if self.current.is_none() && !self.queue.is_empty() {
            self.start_next(frame, scene);
        }

        if self.current.is_none() && self.downloads.is_empty() {
            self.idle_time += delta_time;
            if self.idle_time >= self.config.release_timeout && !self.states.is_empty() {
                log::info!("ProbesRenderer: idle for {:.1}s, releasing resources", self.idle_time);
                self.dispose(frame.device);
            }
            return;
        }
        self.idle_time = 0.0;

        let Some(current) = self.current.as_ref() else {
            return;
        };
        if current.step >= WORK_STEPS {
            let ready = current
                .finished_frame
                .is_some_and(|f| frame.frame_index >= f + self.config.latency_frames);
            if ready {
                self.finish(frame, scene);
            }
            return;
        }

        if !ensure_setup(self, frame.device, frame.shaders) {
            return;
        }
        for _ in 0..self.config.max_work_per_frame.max(1) {
            if !self.run_step(frame, scene, faces) {
                break;
            }
        }
    }

    fn poll_downloads(&mut self, scene: &mut Scene) {
        self.downloads.retain(|download| match download.handle.try_finish() {
            Some(Some(data)) => {
                scene.set_probe_baked_data(download.kind, download.entity, data);
                false
            }
            Some(None) => {
                log::warn!("ProbesRenderer: readback of {:?} {:?} failed", download.kind, download.entity);
                false
            }
            None => true,
        });
    }

    fn start_next(&mut self, frame: &mut ProbeFrame<'_>, scene: &mut Scene) {
        while let Some(index) = self.queue.iter().position(|e| e.timeout <= 0.0) {
            let entry = self.queue.remove(index);
            let Some(info) = scene.probe_capture_info(entry.kind, entry.entity) else {
                log::debug!("ProbesRenderer: {:?} {:?} cannot be captured, dropped", entry.kind, entry.entity);
                continue;
            };
            match self.create_bake(frame.device, scene, entry, info) {
                Ok(bake) => {
                    log::debug!(
                        "ProbesRenderer: baking {:?} {:?} at {}x{} (near {}, far {})",
                        entry.kind,
                        entry.entity,
                        bake.resolution,
                        bake.resolution,
                        bake.near,
                        bake.far
                    );
                    self.current = Some(bake);
                    return;
                }
                Err(err) => log::warn!("ProbesRenderer: {err}"),
            }
        }
    }

    fn create_bake(
        &mut self,
        device: &mut dyn GpuDevice,
        scene: &mut Scene,
        entry: ProbeEntry,
        info: ProbeCaptureInfo,
    ) -> RenderResult<ActiveBake> {
        let resolution = if info.resolution > 0 {
            info.resolution
        } else {
            self.config.default_resolution
        };
        let lights = scene.point_lights_near(info.position, info.radius);
        let (near, far) = capture_planes(&info, &lights);
        let mips = TextureDescriptor::full_mip_chain(resolution, resolution);
        let desc = TextureDescriptor::new_cube(
            resolution,
            CUBE_FORMAT,
            TextureFlags::SHADER_RESOURCE
                | TextureFlags::RENDER_TARGET
                | TextureFlags::PER_MIP_VIEWS
                | TextureFlags::PER_SLICE_VIEWS,
            mips,
        );
        let name = match entry.kind {
            ProbeKind::EnvProbe => "EnvProbe",
            ProbeKind::SkyLight => "SkyLight",
        };
        let cube = device
            .create_texture(name, &desc)
            .map_err(|err| RenderError::resource(name, err))?;
        Ok(ActiveBake {
            entry,
            info,
            near,
            far,
            resolution,
            cube,
            step: 0,
            finished_frame: None,
        })
    }

    /// Returns whether another step may run this frame
    fn run_step(&mut self, frame: &mut ProbeFrame<'_>, scene: &mut Scene, faces: &mut dyn ProbeFaceRenderer) -> bool {
        let Some(step) = self.current.as_ref().map(|c| c.step) else {
            return false;
        };
        if step < 6 {
            self.render_face(frame, scene, faces, step);
        } else if step == 6 {
            self.filter(frame);
        } else {
            return false;
        }
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        current.step += 1;
        if current.step == WORK_STEPS {
            current.finished_frame = Some(frame.frame_index);
            return false;
        }
        true
    }

    fn render_face(&mut self, frame: &mut ProbeFrame<'_>, scene: &mut Scene, faces: &mut dyn ProbeFaceRenderer, face: u32) {
        let Some(current) = self.current.as_ref() else {
            return;
        };
        let desc = TextureDescriptor::new_2d(
            current.resolution,
            current.resolution,
            CUBE_FORMAT,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
        );
        let target = match frame.pool.get(frame.device, "ProbesRenderer.Face", &desc) {
            Ok(texture) => texture,
            Err(err) => {
                log::warn!("ProbesRenderer: {err}");
                return;
            }
        };

        let mut view = RenderView::new();
        view.set_face(face as usize, current.info.position, current.near, current.far);
        view.set_screen_size(current.resolution, current.resolution);
        view.flags = ViewFlags::REFLECTION_PROBE;
        view.static_flags_mask = StaticFlags::REFLECTION_PROBE;
        view.is_offline_pass = true;
        view.is_single_frame = true;
        view.set_previous(None);

        let cube = current.cube;
        let mips = cube.desc.mip_levels;
        frame.gpu.push_event(&format!("ProbesRenderer.Face{face}"));
        faces.render_face(frame, scene, &view, &target);
        frame
            .gpu
            .copy_texture(&cube, subresource_index(face, 0, mips), (0, 0, 0), &target, 0);
        frame.gpu.pop_event();
        frame.pool.release(target);
    }

    /// Fill mips 1.. of every face from the mip above
    fn filter(&mut self, frame: &mut ProbeFrame<'_>) {
        let (Some(handle), Some(cb), Some(current)) = (self.handle, &self.cb, self.current.as_ref()) else {
            return;
        };
        let cube = current.cube;
        frame.gpu.push_event("ProbesRenderer.Filter");
        frame.gpu.set_state(handle);
        for mip in 1..cube.desc.mip_levels {
            let (source_size, _) = cube.desc.mip_size(mip - 1);
            let (size, _) = cube.desc.mip_size(mip);
            frame.gpu.set_viewport_and_scissors(Viewport::from_size(size, size));
            for face in 0..6 {
                let data = ProbeFilterData {
                    params: Vec4::new(face as f32, mip as f32, (mip - 1) as f32, 1.0 / source_size as f32),
                };
                update_cb(frame.gpu, cb, &data);
                frame.gpu.bind_cb(CB_SLOT, cb.handle);
                frame.gpu.set_render_target(None, &[cube.view_slice_mip(face, mip)]);
                frame.gpu.bind_sr(SOURCE_SR_SLOT, Some(cube.view_mip(mip - 1).into()));
                frame.gpu.draw_fullscreen_triangle(1);
                frame.gpu.reset_sr();
            }
        }
        frame.gpu.reset_render_target();
        frame.gpu.pop_event();
    }

    fn finish(&mut self, frame: &mut ProbeFrame<'_>, scene: &mut Scene) {
        let Some(bake) = self.current.take() else {
            return;
        };
        let ProbeEntry { kind, entity, .. } = bake.entry;
        self.bakes_completed += 1;
        self.last_job_steps = bake.step;

        if bake.info.update_mode == ProbeUpdateMode::Realtime {
            let existing = probe_texture(scene, kind, entity).filter(|t| t.desc == bake.cube.desc);
            if let Some(existing) = existing {
                frame.gpu.copy_resource(&existing, &bake.cube);
                frame.device.destroy_texture(bake.cube);
                return;
            }
        }

        self.owned.insert(bake.cube.handle);
        if let Some(previous) = scene.set_probe_texture(kind, entity, bake.cube) {
            if previous.handle != bake.cube.handle && self.owned.remove(&previous.handle) {
                frame.device.destroy_texture(previous);
            }
        }
        log::debug!("ProbesRenderer: {kind:?} {entity:?} baked");

        if bake.info.update_mode != ProbeUpdateMode::Realtime {
            self.downloads.push(PendingDownload {
                kind,
                entity,
                handle: download_texture(frame.device, &bake.cube),
            });
        }
    }
}

fn probe_texture(scene: &Scene, kind: ProbeKind, entity: Entity) -> Option<GpuTexture> {
    let world = scene.world();
    match kind {
        ProbeKind::EnvProbe => world
            .get::<crate::scene::EnvironmentProbe>(entity)
            .and_then(|p| p.texture),
        ProbeKind::SkyLight => world
            .get::<crate::scene::SkyLight>(entity)
            .and_then(|l| l.captured_texture),
    }
}

impl RendererPass for ProbesRenderer {
    fn name(&self) -> &'static str {
        "ProbesRenderer"
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        shaders
            .require(SHADER)?
            .check_cb(CB_SLOT, std::mem::size_of::<ProbeFilterData>())?;
        if self.cb.is_none() {
            self.cb = Some(create_constant_buffer::<ProbeFilterData>(device, "ProbesFilter.CB")?);
        }
        self.handle = Some(
            self.states
                .create(device, &PipelineStateDescriptor::fullscreen(SHADER, "PS_FilterFace"))?,
        );
        Ok(())
    }

    fn on_shader_reloading(&mut self, device: &mut dyn GpuDevice, shader: &str) {
        if shader == SHADER {
            self.states.release(device);
            self.handle = None;
        }
    }

    fn dispose(&mut self, device: &mut dyn GpuDevice) {
        self.states.release(device);
        self.handle = None;
        if let Some(cb) = self.cb.take() {
            device.destroy_buffer(cb);
        }
        if let Some(bake) = self.current.take() {
            device.destroy_texture(bake.cube);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::builtin_shader_library;
    use crate::scene::{EnvironmentProbe, PointLight};
    use glam::Vec3;

    /// Clears each face and counts calls
    #[derive(Default)]
    struct ClearFaces {
        faces: Vec<glam::Vec3>,
    }

    impl ProbeFaceRenderer for ClearFaces {
        fn render_face(&mut self, frame: &mut ProbeFrame<'_>, _: &mut Scene, view: &RenderView, target: &GpuTexture) {
            assert_eq!(view.flags, ViewFlags::REFLECTION_PROBE);
            assert_eq!(view.width(), target.width());
            self.faces.push(view.direction);
            frame.gpu.clear(target.view(), Color::BLACK);
        }
    }

    struct Harness {
        device: RecordingDevice,
        gpu: RecordingContext,
        pool: RenderTargetPool,
        shaders: ShaderLibrary,
        frame_index: u64,
        faces: ClearFaces,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                device: RecordingDevice::new(),
                gpu: RecordingContext::new(),
                pool: RenderTargetPool::new(),
                shaders: builtin_shader_library(),
                frame_index: 0,
                faces: ClearFaces::default(),
            }
        }

        fn tick(&mut self, probes: &mut ProbesRenderer, scene: &mut Scene, delta_time: f32) {
            self.frame_index += 1;
            let mut frame = ProbeFrame {
                device: &mut self.device,
                gpu: &mut self.gpu,
                pool: &self.pool,
                shaders: &self.shaders,
                frame_index: self.frame_index,
            };
            probes.update(&mut frame, scene, delta_time, &mut self.faces);
        }
    }

    fn probe(scene: &mut Scene, resolution: u32) -> Entity {
        scene.spawn_environment_probe(
            Vec3::ZERO,
            EnvironmentProbe {
                resolution,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_bake_coalesces_requests() {
        let mut scene = Scene::new();
        let entity = probe(&mut scene, 16);
        let mut probes = ProbesRenderer::new(ProbesConfig::default());
        probes.bake(ProbeKind::EnvProbe, entity, 1.0);
        probes.bake(ProbeKind::EnvProbe, entity, 5.0);
        assert_eq!(probes.queue_len(), 1);
        assert_eq!(probes.queued_timeout(ProbeKind::EnvProbe, entity), Some(5.0));

        probes.bake(ProbeKind::SkyLight, entity, 0.0);
        assert_eq!(probes.queue_len(), 2);
    }

    #[test]
    fn test_capture_planes_cover_point_lights() {
        let info = ProbeCaptureInfo {
            kind: ProbeKind::EnvProbe,
            position: Vec3::ZERO,
            radius: 1000.0,
            resolution: 0,
            capture_near_plane: 0.0,
            update_mode: ProbeUpdateMode::Manual,
        };
        assert_eq!(capture_planes(&info, &[]), (MIN_NEAR_PLANE, 1000.0));
        let (_, far) = capture_planes(&info, &[(Vec3::new(900.0, 0.0, 0.0), 500.0)]);
        assert_eq!(far, 1400.0);
    }

    #[test]
    fn test_far_plane_uses_scene_lights() {
        let mut scene = Scene::new();
        let entity = probe(&mut scene, 16);
        scene.spawn_point_light(
            Vec3::new(2800.0, 0.0, 0.0),
            PointLight {
                radius: 1000.0,
                ..Default::default()
            },
        );
        let info = scene.probe_capture_info(ProbeKind::EnvProbe, entity).unwrap();
        let lights = scene.point_lights_near(info.position, info.radius);
        let (_, far) = capture_planes(&info, &lights);
        assert_eq!(far, 3800.0);
    }

    #[test]
    fn test_bake_runs_faces_then_filter() {
        let mut harness = Harness::new();
        let mut scene = Scene::new();
        let entity = probe(&mut scene, 16);
        let mut probes = ProbesRenderer::new(ProbesConfig::default());
        probes.bake(ProbeKind::EnvProbe, entity, 0.0);

        for step in 1..=WORK_STEPS {
            harness.tick(&mut probes, &mut scene, 0.016);
            assert_eq!(probes.current_step(), Some(step));
        }
        assert_eq!(harness.faces.faces.len(), 6);
        let copies = harness
            .gpu
            .commands()
            .iter()
            .filter(|c| matches!(c, GpuCommand::CopyTexture { src_subresource: 0, .. }))
            .count();
        assert_eq!(copies, 6);
        // 16x16 has 5 mips, mips 1..5 of 6 faces
        assert_eq!(harness.gpu.commands_in_event("ProbesRenderer.Filter").iter().filter(|c| c.is_draw()).count(), 24);
        assert_eq!(harness.pool.stats().in_use, 0);

        harness.tick(&mut probes, &mut scene, 0.016);
        assert!(!probes.is_busy());
        assert_eq!(probes.bakes_completed(), 1);
        assert_eq!(probes.last_job_steps(), WORK_STEPS);

        let texture = scene
            .world()
            .get::<EnvironmentProbe>(entity)
            .and_then(|p| p.texture)
            .unwrap();
        assert_eq!(texture.width(), 16);
        assert_eq!(texture.desc.array_size, 6);
        assert_eq!(probes.pending_downloads(), 1);
    }

    #[test]
    fn test_timeout_then_bake() {
        let mut harness = Harness::new();
        let mut scene = Scene::new();
        let entity = probe(&mut scene, 8);
        let mut probes = ProbesRenderer::new(ProbesConfig::default());
        probes.bake(ProbeKind::EnvProbe, entity, 0.0);
        probes.bake(ProbeKind::EnvProbe, entity, 3.0);
        assert_eq!(probes.queue_len(), 1);
        assert_eq!(probes.queued_timeout(ProbeKind::EnvProbe, entity), Some(3.0));

        for _ in 0..2 {
            harness.tick(&mut probes, &mut scene, 1.0);
            assert!(!probes.is_busy());
        }
        for _ in 0..2 {
            harness.tick(&mut probes, &mut scene, 1.0);
        }
        assert_eq!(probes.queue_len(), 0);
        assert!(probes.is_busy());

        for _ in 0..10 {
            harness.tick(&mut probes, &mut scene, 1.0);
        }
        assert_eq!(probes.bakes_completed(), 1);
        assert!(probes.last_job_steps() >= WORK_STEPS);
    }

    #[test]
    fn test_download_stores_baked_data() {
        let mut harness = Harness::new();
        let mut scene = Scene::new();
        let entity = probe(&mut scene, 8);
        let mut probes = ProbesRenderer::new(ProbesConfig::default());
        probes.bake(ProbeKind::EnvProbe, entity, 0.0);
        for _ in 0..=WORK_STEPS {
            harness.tick(&mut probes, &mut scene, 0.016);
        }
        assert_eq!(probes.pending_downloads(), 1);

        for _ in 0..200 {
            harness.tick(&mut probes, &mut scene, 0.016);
            if probes.pending_downloads() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let baked = scene
            .world()
            .get::<EnvironmentProbe>(entity)
            .and_then(|p| p.baked_data.clone())
            .unwrap();
        assert_eq!(baked.array_size, 6);
    }

    #[test]
    fn test_rebake_destroys_previous_cube() {
        let mut harness = Harness::new();
        let mut scene = Scene::new();
        let entity = probe(&mut scene, 8);
        let mut probes = ProbesRenderer::new(ProbesConfig::default());
        for _ in 0..2 {
            probes.bake(ProbeKind::EnvProbe, entity, 0.0);
            for _ in 0..=WORK_STEPS {
                harness.tick(&mut probes, &mut scene, 0.016);
            }
        }
        assert_eq!(probes.bakes_completed(), 2);
        assert_eq!(harness.device.find_textures("EnvProbe").len(), 1);
    }

    #[test]
    fn test_realtime_probe_copies_into_existing_texture() {
        let mut harness = Harness::new();
        let mut scene = Scene::new();
        let entity = scene.spawn_environment_probe(
            Vec3::ZERO,
            EnvironmentProbe {
                resolution: 8,
                update_mode: ProbeUpdateMode::Realtime,
                ..Default::default()
            },
        );
        let mut probes = ProbesRenderer::new(ProbesConfig::default());
        for _ in 0..=WORK_STEPS {
            harness.tick(&mut probes, &mut scene, 0.016);
        }
        assert_eq!(probes.bakes_completed(), 1);
        let first = scene.world().get::<EnvironmentProbe>(entity).and_then(|p| p.texture).unwrap();

        harness.gpu.clear();
        for _ in 0..=WORK_STEPS {
            harness.tick(&mut probes, &mut scene, 0.016);
        }
        assert_eq!(probes.bakes_completed(), 2);
        let second = scene.world().get::<EnvironmentProbe>(entity).and_then(|p| p.texture).unwrap();
        assert_eq!(first.handle, second.handle);
        assert!(harness
            .gpu
            .commands()
            .iter()
            .any(|c| matches!(c, GpuCommand::CopyResource { dst, .. } if *dst == first.handle)));
        assert_eq!(probes.pending_downloads(), 0);
    }

    #[test]
    fn test_max_work_per_frame() {
        let mut harness = Harness::new();
        let mut scene = Scene::new();
        let entity = probe(&mut scene, 8);
        let mut probes = ProbesRenderer::new(ProbesConfig {
            max_work_per_frame: 3,
            ..Default::default()
        });
        probes.bake(ProbeKind::EnvProbe, entity, 0.0);
        harness.tick(&mut probes, &mut scene, 0.016);
        assert_eq!(probes.current_step(), Some(3));
        harness.tick(&mut probes, &mut scene, 0.016);
        harness.tick(&mut probes, &mut scene, 0.016);
        assert_eq!(probes.current_step(), Some(WORK_STEPS));
    }

    #[test]
    fn test_releases_after_idle_timeout() {
        let mut harness = Harness::new();
        let mut scene = Scene::new();
        let entity = probe(&mut scene, 8);
        let mut probes = ProbesRenderer::new(ProbesConfig {
            release_timeout: 2.0,
            ..Default::default()
        });
        probes.bake(ProbeKind::EnvProbe, entity, 0.0);
        for _ in 0..=WORK_STEPS {
            harness.tick(&mut probes, &mut scene, 0.016);
        }
        assert!(probes.is_ready());
        // Wait out the readback so the service goes idle
        for _ in 0..200 {
            if probes.pending_downloads() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
            harness.tick(&mut probes, &mut scene, 0.0);
        }
        harness.tick(&mut probes, &mut scene, 1.0);
        assert!(probes.is_ready());
        harness.tick(&mut probes, &mut scene, 1.5);
        assert!(!probes.is_ready());
    }

    #[test]
    fn test_despawned_probe_is_dropped() {
        let mut harness = Harness::new();
        let mut scene = Scene::new();
        let entity = probe(&mut scene, 8);
        let mut probes = ProbesRenderer::new(ProbesConfig::default());
        probes.bake(ProbeKind::EnvProbe, entity, 0.0);
        scene.despawn(entity);
        harness.tick(&mut probes, &mut scene, 0.016);
        assert_eq!(probes.queue_len(), 0);
        assert!(!probes.is_busy());
    }
}
