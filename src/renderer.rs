//! Frame driver
//!
//! [`Renderer`] owns the device, the render target pool, every pass and the
//! per-view buffers. Each call to [`Renderer::render`] culls the scene for a
//! view and runs the frame plan in order on a fresh [`RenderContext`].

use std::collections::HashMap;

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::global_surface_atlas::MIN_OBJECT_RADIUS;
use crate::pipeline::volumetric_fog::FroxelDepth;
use crate::pipeline::*;
use crate::probes::{ProbeFaceRenderer, ProbeFrame, ProbesRenderer};
use crate::render_graph::{FramePlan, PassKind, PlanError};
use crate::resources::{RenderBuffers, RenderTargetPool, ShaderLibrary, ViewId};
use crate::scene::{AntialiasingMode, PostProcessSettings, RenderList, RenderView, Scene, ViewFlags};
use crate::RendererConfig;

pub const OUTPUT_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

/// What happened while rendering one view
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame_index: u64,
    /// Passes that ran, in order
    pub executed: Vec<PassKind>,
    /// Passes whose resources were not ready
    pub skipped: Vec<PassKind>,
    /// Tone mapped result
    pub output: GpuTexture,
    /// The view's buffers were reallocated this frame
    pub resized: bool,
}

struct ViewState {
    buffers: RenderBuffers,
    output: Option<GpuTexture>,
    /// View and projection of the last rendered frame
    previous: Option<(glam::Mat4, glam::Mat4)>,
}

/// Every pass of the main frame
#[derive(Default)]
struct Passes {
    gbuffer: GBufferPass,
    ambient_occlusion: AmbientOcclusionPass,
    shadows: ShadowsPass,
    lights: LightPass,
    surface_atlas: GlobalSurfaceAtlasPass,
    volumetric_fog: VolumetricFogPass,
    fog: FogPass,
    motion_blur: MotionBlurPass,
    depth_of_field: DepthOfFieldPass,
    taa: TemporalAntiAliasingPass,
    eye_adaptation: EyeAdaptationPass,
    tone_mapping: ToneMappingPass,
}

/// Textures handed between passes during one view
struct FrameTargets {
    light_buffer: GpuTexture,
    /// Current HDR color, starts as the light buffer
    color: GpuTexture,
    /// Ping-pong partner of `color` for post effects
    spare: Option<GpuTexture>,
    output: GpuTexture,
    surface_atlas: Option<SurfaceAtlasBindings>,
    fog_volume: Option<FroxelDepth>,
}

impl FrameTargets {
    fn spare(&mut self, ctx: &mut RenderContext) -> Option<GpuTexture> {
        if self.spare.is_none() {
            let desc = self.light_buffer.desc;
            match ctx.get_temporary("PostFx.Temp", &desc) {
                Ok(texture) => self.spare = Some(texture),
                Err(err) => log::warn!("Renderer: {err}"),
            }
        }
        self.spare
    }

    /// Swap `color` with the spare after a pass wrote into it
    fn swap(&mut self, written: GpuTexture) {
        self.spare = Some(self.color);
        self.color = written;
    }

    fn release(self, ctx: &RenderContext) {
        // `color` is either the light buffer or the spare
        ctx.release(self.light_buffer);
        if let Some(spare) = self.spare.filter(|s| s.handle != self.light_buffer.handle) {
            ctx.release(spare);
        } else if self.color.handle != self.light_buffer.handle {
            ctx.release(self.color);
        }
    }
}

impl Passes {
    fn new(config: &RendererConfig) -> Self {
        let mut volumetric_fog = VolumetricFogPass::with_quality(config.volumetric_fog_quality);
        volumetric_fog.set_distribution(config.volumetric_fog_distribution);
        Self {
            surface_atlas: GlobalSurfaceAtlasPass::new(config.surface_atlas_resolution, config.surface_atlas_world_radius),
            volumetric_fog,
            ..Default::default()
        }
    }

    fn all_mut(&mut self) -> [&mut dyn RendererPass; 12] {
        [
            &mut self.gbuffer,
            &mut self.ambient_occlusion,
            &mut self.shadows,
            &mut self.lights,
            &mut self.surface_atlas,
            &mut self.volumetric_fog,
            &mut self.fog,
            &mut self.motion_blur,
            &mut self.depth_of_field,
            &mut self.taa,
            &mut self.eye_adaptation,
            &mut self.tone_mapping,
        ]
    }

    /// Run one tagged stage. Returns false when the pass was not ready.
    fn execute(
        &mut self,
        kind: PassKind,
        ctx: &mut RenderContext,
        shaders: &ShaderLibrary,
        targets: &mut FrameTargets,
    ) -> bool {
        match kind {
            // Updated before the view context exists
            PassKind::Probes => true,
            PassKind::GlobalSurfaceAtlas => {
                if !ensure_setup(&mut self.surface_atlas, ctx.device, shaders) {
                    return false;
                }
                targets.surface_atlas = self.surface_atlas.render(ctx);
                true
            }
            PassKind::GBuffer => {
                if !ensure_setup(&mut self.gbuffer, ctx.device, shaders) {
                    ctx.gpu.clear(targets.light_buffer.view(), Color::BLACK);
                    return false;
                }
                self.gbuffer.fill(ctx, &targets.light_buffer);
                true
            }
            PassKind::Decals => {
                if !self.gbuffer.is_ready() {
                    return false;
                }
                self.gbuffer.render_decals(ctx, &targets.light_buffer);
                true
            }
            PassKind::AmbientOcclusion => {
                if !ensure_setup(&mut self.ambient_occlusion, ctx.device, shaders) {
                    return false;
                }
                self.ambient_occlusion.render(ctx);
                true
            }
            PassKind::ShadowMaps => {
                if !ensure_setup(&mut self.shadows, ctx.device, shaders) {
                    return false;
                }
                self.shadows.render_shadow_maps(ctx);
                true
            }
            PassKind::Lights => {
                if !ensure_setup(&mut self.lights, ctx.device, shaders) {
                    return false;
                }
                let shadows = self.shadows.is_ready().then_some(&self.shadows);
                self.lights.render(ctx, &targets.light_buffer, shadows);
                true
            }
            PassKind::SurfaceAtlasLighting => {
                if let Some(bindings) = targets.surface_atlas.as_ref() {
                    self.surface_atlas.render_direct_lighting(ctx, bindings);
                }
                true
            }
            PassKind::VolumetricFog => {
                if !ensure_setup(&mut self.volumetric_fog, ctx.device, shaders) {
                    return false;
                }
                let shadows = self.shadows.is_ready().then_some(&self.shadows);
                targets.fog_volume = self.volumetric_fog.render(ctx, shadows);
                true
            }
            PassKind::Fog => {
                if !ensure_setup(&mut self.fog, ctx.device, shaders) {
                    return false;
                }
                self.fog.render(ctx, &targets.light_buffer, targets.fog_volume);
                true
            }
            PassKind::MotionVectors => {
                if !ensure_setup(&mut self.motion_blur, ctx.device, shaders) {
                    return false;
                }
                self.motion_blur.render_motion_vectors(ctx);
                true
            }
            PassKind::DepthOfField => {
                if !ensure_setup(&mut self.depth_of_field, ctx.device, shaders) {
                    return false;
                }
                if let Some(output) = targets.spare(ctx) {
                    if self.depth_of_field.render(ctx, &targets.color, &output) {
                        targets.swap(output);
                    }
                }
                true
            }
            PassKind::MotionBlur => {
                if !self.motion_blur.is_ready() {
                    return false;
                }
                if let Some(output) = targets.spare(ctx) {
                    if self.motion_blur.render(ctx, &targets.color, &output) {
                        targets.swap(output);
                    }
                }
                true
            }
            PassKind::TemporalAA => {
                if !ensure_setup(&mut self.taa, ctx.device, shaders) {
                    return false;
                }
                if let Some(output) = targets.spare(ctx) {
                    if self.taa.render(ctx, &targets.color, &output) {
                        targets.swap(output);
                    }
                }
                true
            }
            PassKind::EyeAdaptation => {
                if !ensure_setup(&mut self.eye_adaptation, ctx.device, shaders) {
                    return false;
                }
                self.eye_adaptation.render(ctx, &targets.color);
                true
            }
            PassKind::ToneMapping => {
                if !ensure_setup(&mut self.tone_mapping, ctx.device, shaders) {
                    ctx.gpu.clear(targets.output.view(), Color::BLACK);
                    return false;
                }
                self.tone_mapping.render(ctx, &targets.color, &targets.output);
                true
            }
        }
    }
}

/// Draws probe faces with the G-Buffer, light and fog passes
struct SceneFaceRenderer<'a> {
    gbuffer: &'a mut GBufferPass,
    lights: &'a mut LightPass,
    fog: &'a mut FogPass,
    buffers: &'a mut RenderBuffers,
    list: &'a mut RenderList,
    frame: FrameInfo,
}

impl ProbeFaceRenderer for SceneFaceRenderer<'_> {
    fn render_face(&mut self, frame: &mut ProbeFrame<'_>, scene: &mut Scene, view: &RenderView, target: &GpuTexture) {
        if let Err(err) = self.buffers.init(frame.device, frame.pool, view.width(), view.height()) {
            log::warn!("ProbesRenderer: face buffers: {err}");
            return;
        }
        scene.collect(view, self.list);
        self.list.sort_draw_calls();

        let gbuffer_ready = ensure_setup(&mut *self.gbuffer, frame.device, frame.shaders);
        let lights_ready = ensure_setup(&mut *self.lights, frame.device, frame.shaders);
        let fog_ready = ensure_setup(&mut *self.fog, frame.device, frame.shaders);
        let mut ctx = RenderContext {
            device: &mut *frame.device,
            gpu: &mut *frame.gpu,
            pool: frame.pool,
            buffers: &mut *self.buffers,
            view: view.clone(),
            list: &mut *self.list,
            frame: FrameInfo {
                frame_index: frame.frame_index,
                ..self.frame
            },
        };
        if !gbuffer_ready {
            ctx.gpu.clear(target.view(), Color::BLACK);
            return;
        }
        self.lights.setup_lights(&mut ctx);
        self.gbuffer.fill(&mut ctx, target);
        if lights_ready {
            self.lights.render(&mut ctx, target, None);
        }
        if fog_ready {
            self.fog.render(&mut ctx, target, None);
        }
    }
}

/// Owns the GPU device and drives every pass
pub struct Renderer<D: GpuDevice + 'static, C: GpuContext + 'static> {
    device: D,
    gpu: C,
    pool: RenderTargetPool,
    shaders: ShaderLibrary,
    config: RendererConfig,
    plan: FramePlan,
    passes: Passes,
    probes: ProbesRenderer,
    /// Buffers used by probe face captures
    probe_buffers: RenderBuffers,
    probe_list: RenderList,
    probes_frame: Option<u64>,
    list: RenderList,
    views: HashMap<ViewId, ViewState>,
    next_view: u32,
    frame: FrameInfo,
}

impl<D: GpuDevice + 'static, C: GpuContext + 'static> Renderer<D, C> {
    /// Create a renderer with the built-in shader library
    pub fn new(device: D, gpu: C, config: RendererConfig) -> Self {
        Self::with_shaders(device, gpu, config, builtin_shader_library())
    }

    pub fn with_shaders(mut device: D, gpu: C, config: RendererConfig, shaders: ShaderLibrary) -> Self {
        let mut passes = Passes::new(&config);
        let mut probes = ProbesRenderer::new(config.probes.clone());
        for pass in passes.all_mut() {
            if let Err(err) = pass.init(&mut device) {
                log::warn!("{}: init failed: {err}", pass.name());
            }
        }
        if let Err(err) = probes.init(&mut device) {
            log::warn!("ProbesRenderer: init failed: {err}");
        }
        log::info!(
            "Renderer: created, surface atlas {}x{}, probes {}x{}",
            config.surface_atlas_resolution,
            config.surface_atlas_resolution,
            config.probes.default_resolution,
            config.probes.default_resolution
        );
        let pool = RenderTargetPool::new();
        pool.set_frame(1);
        Self {
            device,
            gpu,
            pool,
            shaders,
            config,
            plan: FramePlan::standard(),
            passes,
            probes,
            probe_buffers: RenderBuffers::new(),
            probe_list: RenderList::new(),
            probes_frame: None,
            list: RenderList::new(),
            views: HashMap::new(),
            next_view: 0,
            frame: FrameInfo {
                frame_index: 1,
                ..Default::default()
            },
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn context(&self) -> &C {
        &self.gpu
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.gpu
    }

    pub fn pool(&self) -> &RenderTargetPool {
        &self.pool
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn shaders(&self) -> &ShaderLibrary {
        &self.shaders
    }

    pub fn shaders_mut(&mut self) -> &mut ShaderLibrary {
        &mut self.shaders
    }

    pub fn probes(&self) -> &ProbesRenderer {
        &self.probes
    }

    pub fn probes_mut(&mut self) -> &mut ProbesRenderer {
        &mut self.probes
    }

    pub fn frame(&self) -> FrameInfo {
        self.frame
    }

    pub fn frame_index(&self) -> u64 {
        self.frame.frame_index
    }

    pub fn plan(&self) -> &FramePlan {
        &self.plan
    }

    /// Replace the frame plan once it validates
    pub fn set_plan(&mut self, plan: FramePlan) -> Result<(), PlanError> {
        plan.validate()?;
        self.plan = plan;
        Ok(())
    }

    pub fn volumetric_fog(&self) -> &VolumetricFogPass {
        &self.passes.volumetric_fog
    }

    pub fn eye_adaptation(&self) -> &EyeAdaptationPass {
        &self.passes.eye_adaptation
    }

    pub fn taa(&self) -> &TemporalAntiAliasingPass {
        &self.passes.taa
    }

    pub fn shadows(&self) -> &ShadowsPass {
        &self.passes.shadows
    }

    /// A perspective view using the configured default flags
    pub fn new_view(&self, width: u32, height: u32) -> RenderView {
        let mut view = RenderView::new();
        view.flags = self.config.default_view_flags;
        view.set_screen_size(width, height);
        view
    }

    /// Register a view. Its buffers are allocated on first render.
    pub fn create_view(&mut self) -> ViewId {
        let id = ViewId(self.next_view);
        self.next_view += 1;
        self.views.insert(
            id,
            ViewState {
                buffers: RenderBuffers::new(),
                output: None,
                previous: None,
            },
        );
        log::debug!("Renderer: created view {id:?}");
        id
    }

    pub fn destroy_view(&mut self, id: ViewId) {
        if let Some(mut state) = self.views.remove(&id) {
            state.buffers.release(&mut self.device, &self.pool);
            if let Some(output) = state.output.take() {
                self.device.destroy_texture(output);
            }
        }
    }

    pub fn view_buffers(&self, id: ViewId) -> Option<&RenderBuffers> {
        self.views.get(&id).map(|s| &s.buffers)
    }

    /// Start a frame with the elapsed time since the last one
    pub fn begin_frame(&mut self, delta_time: f32) {
        self.frame.delta_time = delta_time;
        self.frame.unscaled_delta_time = delta_time;
        self.frame.time += delta_time;
    }

    /// Queue a probe or sky light bake
    pub fn bake_probe(&mut self, kind: crate::scene::ProbeKind, entity: bevy_ecs::entity::Entity, timeout: f32) {
        self.probes.bake(kind, entity, timeout);
    }

    fn update_probes(&mut self, scene: &mut Scene) {
        let mut faces = SceneFaceRenderer {
            gbuffer: &mut self.passes.gbuffer,
            lights: &mut self.passes.lights,
            fog: &mut self.passes.fog,
            buffers: &mut self.probe_buffers,
            list: &mut self.probe_list,
            frame: self.frame,
        };
        let mut frame = ProbeFrame {
            device: &mut self.device,
            gpu: &mut self.gpu,
            pool: &self.pool,
            shaders: &self.shaders,
            frame_index: self.frame.frame_index,
        };
        self.probes
            .update(&mut frame, scene, self.frame.unscaled_delta_time, &mut faces);
    }

    /// Render `scene` from `view` into the view's output texture
    pub fn render(
        &mut self,
        scene: &mut Scene,
        view_id: ViewId,
        mut view: RenderView,
        settings: &PostProcessSettings,
    ) -> RenderResult<FrameReport> {
        for shader in self.shaders.take_reloads() {
            self.on_shader_reloading(&shader);
        }
        let frame = self.frame;
        if !self.views.contains_key(&view_id) {
            return Err(RenderError::UnknownView(view_id));
        }
        if self.plan.contains(PassKind::Probes) && self.probes_frame != Some(frame.frame_index) {
            self.probes_frame = Some(frame.frame_index);
            self.update_probes(scene);
        }

        let state = self
            .views
            .get_mut(&view_id)
            .ok_or(RenderError::UnknownView(view_id))?;
        let (width, height) = (view.width().max(1), view.height().max(1));
        let resized = match state.buffers.init(&mut self.device, &self.pool, width, height) {
            Ok(resized) => resized,
            Err(err) => {
                log::error!("Renderer: view {view_id:?} buffers: {err}");
                return Err(err);
            }
        };
        if resized || state.output.is_none() {
            if let Some(output) = state.output.take() {
                self.device.destroy_texture(output);
            }
            let desc = TextureDescriptor::new_2d(
                width,
                height,
                OUTPUT_FORMAT,
                TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
            );
            let output = self
                .device
                .create_texture("Output", &desc)
                .map_err(|err| RenderError::resource("Output", err))?;
            state.output = Some(output);
        }
        let Some(output) = state.output else {
            return Err(RenderError::UnknownView(view_id));
        };

        // Cull
        self.list.settings = settings.clone();
        scene.collect(&view, &mut self.list);
        if view.flags.contains(ViewFlags::GI) && self.plan.contains(PassKind::GlobalSurfaceAtlas) {
            scene.collect_surface_atlas_objects(
                view.position,
                self.passes.surface_atlas.world_radius(),
                MIN_OBJECT_RADIUS,
                &mut self.list,
            );
        }
        self.list.sort_draw_calls();
        self.list.settings.shadows.quality = self.list.settings.shadows.quality.min(self.config.max_shadow_quality);

        let anti_aliasing = &self.list.settings.anti_aliasing;
        let taa = view.flags.contains(ViewFlags::ANTI_ALIASING)
            && anti_aliasing.mode == AntialiasingMode::TemporalAntialiasing;
        view.set_previous(state.previous);
        view.apply_taa_jitter(frame.frame_index, taa, anti_aliasing.taa_jitter_spread);
        if view.is_camera_cut {
            log::debug!("Renderer: camera cut on view {view_id:?}, dropping histories");
        }

        let light_desc = TextureDescriptor::new_2d(
            width,
            height,
            state.buffers.output_format(),
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET | TextureFlags::UNORDERED_ACCESS,
        );
        let light_buffer = self
            .pool
            .get(&mut self.device, "LightBuffer", &light_desc)
            .map_err(|err| RenderError::resource("LightBuffer", err))?;

        let mut ctx = RenderContext {
            device: &mut self.device,
            gpu: &mut self.gpu,
            pool: &self.pool,
            buffers: &mut state.buffers,
            view,
            list: &mut self.list,
            frame,
        };
        let mut targets = FrameTargets {
            light_buffer,
            color: light_buffer,
            spare: None,
            output,
            surface_atlas: None,
            fog_volume: None,
        };

        ctx.gpu.push_event("Frame");
        self.passes.lights.setup_lights(&mut ctx);
        self.passes.shadows.setup_shadows(&mut ctx);

        let mut executed = Vec::with_capacity(self.plan.len());
        let mut skipped = Vec::new();
        for kind in self.plan.kinds() {
            if self.passes.execute(kind, &mut ctx, &self.shaders, &mut targets) {
                executed.push(kind);
            } else {
                log::trace!("Renderer: {} skipped", kind.name());
                skipped.push(kind);
            }
        }
        ctx.gpu.pop_event();

        self.passes.shadows.release_frame(&ctx);
        targets.release(&ctx);
        let previous = (ctx.view.view, ctx.view.non_jittered_projection);
        let view_projection = ctx.view.view_projection;
        drop(ctx);

        state.previous = Some(previous);
        state.buffers.last_view_projection = Some(view_projection);
        state.buffers.last_frame_rendered = frame.frame_index;
        state
            .buffers
            .release_unused_memory(&mut self.device, &self.pool, frame.frame_index);

        Ok(FrameReport {
            frame_index: frame.frame_index,
            executed,
            skipped,
            output,
            resized,
        })
    }

    /// Finish the frame: store previous transforms, flush idle pool
    /// entries and advance the frame index
    pub fn end_frame(&mut self, scene: &mut Scene) {
        scene.end_frame();
        self.probe_buffers
            .release_unused_memory(&mut self.device, &self.pool, self.frame.frame_index);
        self.pool.flush(&mut self.device, false, self.config.pool_keep_frames);
        self.frame.frame_index += 1;
        self.pool.set_frame(self.frame.frame_index);
    }

    /// Forward a shader reload to every pass
    pub fn on_shader_reloading(&mut self, shader: &str) {
        log::debug!("Renderer: shader {shader} reloading");
        for pass in self.passes.all_mut() {
            pass.on_shader_reloading(&mut self.device, shader);
        }
        self.probes.on_shader_reloading(&mut self.device, shader);
    }

    /// Release every GPU resource
    pub fn dispose(&mut self) {
        for pass in self.passes.all_mut() {
            pass.dispose(&mut self.device);
        }
        self.probes.dispose(&mut self.device);
        for (_, mut state) in self.views.drain() {
            state.buffers.release(&mut self.device, &self.pool);
            if let Some(output) = state.output.take() {
                self.device.destroy_texture(output);
            }
        }
        self.probe_buffers.release(&mut self.device, &self.pool);
        self.pool.flush(&mut self.device, true, 0);
        log::info!("Renderer: disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{GpuMesh, Mesh, ShaderState};
    use crate::scene::{DirectionalLight, MaterialInfo, StaticModel, Transform};
    use glam::Vec3;

    fn renderer() -> Renderer<RecordingDevice, RecordingContext> {
        Renderer::new(RecordingDevice::new(), RecordingContext::new(), RendererConfig::default())
    }

    fn scene(device: &mut RecordingDevice) -> Scene {
        let mesh = GpuMesh::upload(device, &Mesh::cube()).unwrap();
        let mut scene = Scene::new();
        scene.spawn_model(
            Transform::from_position(Vec3::new(0.0, 0.0, -200.0)),
            StaticModel::new(mesh, MaterialInfo::default()),
        );
        scene.spawn_directional_light(-Vec3::ONE.normalize(), DirectionalLight::default());
        scene
    }

    fn camera(renderer: &Renderer<RecordingDevice, RecordingContext>, width: u32, height: u32) -> RenderView {
        let mut view = renderer.new_view(width, height);
        view.set_perspective(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 1.2, 10.0, 10000.0);
        view
    }

    #[test]
    fn test_frame_runs_every_pass_in_order() {
        let mut renderer = renderer();
        let mut scene = scene(renderer.device_mut());
        let id = renderer.create_view();
        let view = camera(&renderer, 128, 72);

        renderer.begin_frame(1.0 / 60.0);
        let report = renderer
            .render(&mut scene, id, view, &PostProcessSettings::default())
            .unwrap();
        assert!(report.resized);
        assert!(report.skipped.is_empty(), "skipped {:?}", report.skipped);
        assert_eq!(report.executed, PassKind::ALL.to_vec());

        let events = renderer.context().events();
        let position = |name: &str| events.iter().position(|e| *e == name);
        let gbuffer = position("GBuffer").unwrap();
        let tone_mapping = position("ToneMapping").unwrap();
        assert!(gbuffer < tone_mapping);
        renderer.end_frame(&mut scene);
        assert_eq!(renderer.frame_index(), 2);
    }

    #[test]
    fn test_transient_targets_return_to_pool() {
        let mut renderer = renderer();
        let mut scene = scene(renderer.device_mut());
        let id = renderer.create_view();
        for _ in 0..3 {
            let view = camera(&renderer, 64, 64);
            renderer.begin_frame(1.0 / 60.0);
            renderer
                .render(&mut scene, id, view, &PostProcessSettings::default())
                .unwrap();
            renderer.end_frame(&mut scene);
        }
        let held = renderer.pool().stats().in_use;
        let view = camera(&renderer, 64, 64);
        renderer.begin_frame(1.0 / 60.0);
        renderer
            .render(&mut scene, id, view, &PostProcessSettings::default())
            .unwrap();
        // Only histories carried across frames stay out of the pool
        assert_eq!(renderer.pool().stats().in_use, held);
    }

    #[test]
    fn test_missing_shader_skips_pass() {
        let mut shaders = builtin_shader_library();
        shaders.set_state(crate::pipeline::taa::SHADER, ShaderState::Loading);
        let mut renderer = Renderer::with_shaders(
            RecordingDevice::new(),
            RecordingContext::new(),
            RendererConfig::default(),
            shaders,
        );
        let mut scene = scene(renderer.device_mut());
        let id = renderer.create_view();
        let view = camera(&renderer, 64, 64);
        let report = renderer
            .render(&mut scene, id, view, &PostProcessSettings::default())
            .unwrap();
        assert_eq!(report.skipped, vec![PassKind::TemporalAA]);
        assert!(report.executed.contains(&PassKind::ToneMapping));
    }

    #[test]
    fn test_unknown_view() {
        let mut renderer = renderer();
        let mut scene = Scene::new();
        let id = renderer.create_view();
        renderer.destroy_view(id);
        let view = camera(&renderer, 64, 64);
        assert_eq!(
            renderer.render(&mut scene, id, view, &PostProcessSettings::default()),
            Err(RenderError::UnknownView(id))
        );
    }

    #[test]
    fn test_invalid_plan_is_rejected() {
        let mut renderer = renderer();
        let plan = FramePlan::new().with(PassKind::Lights).with(PassKind::GBuffer);
        assert!(renderer.set_plan(plan).is_err());
        assert_eq!(renderer.plan().len(), PassKind::ALL.len());
    }

    #[test]
    fn test_shader_reload_recreates_states() {
        let mut renderer = renderer();
        let mut scene = scene(renderer.device_mut());
        let id = renderer.create_view();
        let view = camera(&renderer, 64, 64);
        renderer
            .render(&mut scene, id, view.clone(), &PostProcessSettings::default())
            .unwrap();
        let states = renderer.device().pipeline_state_count();

        renderer.on_shader_reloading(crate::pipeline::postprocess::tonemapping::SHADER);
        assert!(renderer.device().pipeline_state_count() < states);
        renderer.end_frame(&mut scene);
        renderer
            .render(&mut scene, id, view.clone(), &PostProcessSettings::default())
            .unwrap();
        assert_eq!(renderer.device().pipeline_state_count(), states);

        // Reloads queued on the library are picked up by the next frame
        renderer
            .shaders_mut()
            .reload(crate::pipeline::postprocess::tonemapping::SHADER, None);
        renderer.end_frame(&mut scene);
        let report = renderer
            .render(&mut scene, id, view, &PostProcessSettings::default())
            .unwrap();
        assert!(report.skipped.is_empty());
        assert_eq!(renderer.device().pipeline_state_count(), states);
    }

    #[test]
    fn test_dispose_releases_everything() {
        let mut renderer = renderer();
        let mut scene = scene(renderer.device_mut());
        let id = renderer.create_view();
        let view = camera(&renderer, 64, 64);
        renderer
            .render(&mut scene, id, view, &PostProcessSettings::default())
            .unwrap();
        renderer.dispose();
        assert_eq!(renderer.device().pipeline_state_count(), 0);
        assert_eq!(renderer.pool().stats().in_use, 0);
    }
}
