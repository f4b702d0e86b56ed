//! G-Buffer generation pass for deferred rendering
//!
//! Renders opaque geometry to multiple render targets (MRT):
//! - Light buffer: material emissive plus precomputed indirect light
//! - GBuffer0: albedo (rgb), ambient occlusion (a)
//! - GBuffer1: normal (rgb), shading model (a)
//! - GBuffer2: roughness, metalness, specular, AO accumulator
//! - GBuffer3: custom data
//! - Depth buffer
//!
//! Decals are drawn between the decal-receiving and non-receiving lists.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::draw::{cull_index, cull_mode, DrawCallsRenderer};
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::{GpuMesh, Mesh, ShaderLibrary};
use crate::scene::{DrawCallsListType, GpuViewData, ViewFlags, ViewMode};

pub const SHADER: &str = "Shaders/GBuffer";
pub const DECALS_SHADER: &str = "Shaders/Decals";
pub const SKY_SHADER: &str = "Shaders/Sky";

pub const VIEW_CB_SLOT: u32 = 0;
pub const SKY_CUBE_SR_SLOT: u32 = 0;
pub const DECAL_DEPTH_SR_SLOT: u32 = 0;

/// Face size of the low resolution sky cube used by GI
pub const SKY_CUBE_SIZE: u32 = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GBufferData {
    pub view: GpuViewData,
    /// x: view mode index, yzw unused
    pub params: Vec4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DecalData {
    pub world: Mat4,
    pub inv_world: Mat4,
    /// xyz emissive, w sort order
    pub params: Vec4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SkyData {
    pub view: GpuViewData,
    /// Face view-projection when rendering into a cube
    pub face_view_projection: Mat4,
    pub tint: Vec4,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(SHADER, &[std::mem::size_of::<GBufferData>()]);
    library.register(DECALS_SHADER, &[std::mem::size_of::<DecalData>()]);
    library.register(SKY_SHADER, &[std::mem::size_of::<SkyData>()]);
}

struct GBufferStates {
    /// Back, Front, None culling
    fill: [PipelineStateHandle; 3],
    wireframe: PipelineStateHandle,
    /// Debug view modes replacing the pixel shader
    debug: PipelineStateHandle,
    decal: PipelineStateHandle,
    decal_emissive: PipelineStateHandle,
    sky: PipelineStateHandle,
    sky_cube: PipelineStateHandle,
}

/// G-Buffer generation pass
#[derive(Default)]
pub struct GBufferPass {
    states: PipelineStates,
    handles: Option<GBufferStates>,
    cb: Option<GpuBuffer>,
    decal_cb: Option<GpuBuffer>,
    sky_cb: Option<GpuBuffer>,
    draw_calls: Option<DrawCallsRenderer>,
    box_mesh: Option<GpuMesh>,
}

impl GBufferPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.handles.is_some()
    }

    fn create_states(&mut self, device: &mut dyn GpuDevice) -> RenderResult<GBufferStates> {
        let base = PipelineStateDescriptor::geometry(SHADER, "VS", Some("PS_GBuffer"));
        let fill = [
            self.states.create(device, &base.clone().with_cull(CullMode::Back))?,
            self.states.create(device, &base.clone().with_cull(CullMode::Front))?,
            self.states.create(device, &base.clone().with_cull(CullMode::None))?,
        ];
        let mut wireframe_desc = base.clone().with_cull(CullMode::None);
        wireframe_desc.wireframe = true;
        let wireframe = self.states.create(device, &wireframe_desc)?;
        let debug = self.states.create(
            device,
            &PipelineStateDescriptor::geometry(SHADER, "VS", Some("PS_Debug")).with_permutation(1),
        )?;

        // Decal boxes are drawn from the inside so the camera may stand in one
        let decal_base = PipelineStateDescriptor::geometry(DECALS_SHADER, "VS_Decal", Some("PS_Decal"))
            .with_cull(CullMode::Front)
            .with_depth(false, false, CompareFunction::Always)
            .with_blend(BlendMode::AlphaBlend);
        let decal = self.states.create(device, &decal_base)?;
        let decal_emissive = self.states.create(
            device,
            &decal_base.clone().with_blend(BlendMode::Additive).with_permutation(1),
        )?;

        let sky = self.states.create(
            device,
            &PipelineStateDescriptor::fullscreen(SKY_SHADER, "PS_Sky").with_depth(
                true,
                false,
                CompareFunction::LessEqual,
            ),
        )?;
        let sky_cube = self.states.create(
            device,
            &PipelineStateDescriptor::fullscreen(SKY_SHADER, "PS_Sky").with_permutation(1),
        )?;

        Ok(GBufferStates {
            fill,
            wireframe,
            debug,
            decal,
            decal_emissive,
            sky,
            sky_cube,
        })
    }

    /// Fill the G-Buffer and the initial light buffer. Draws the sky into
    /// the light buffer when the view has the `SKY` flag.
    pub fn fill(&mut self, ctx: &mut RenderContext, light_buffer: &GpuTexture) {
        let (Some(handles), Some(cb), Some(draw_calls)) = (&self.handles, &self.cb, &self.draw_calls) else {
            return;
        };
        let (Some(depth), Some(gbuffer)) = (ctx.buffers.depth_buffer().copied(), ctx.buffers.gbuffers()) else {
            log::error!("GBufferPass: render buffers are not initialized");
            return;
        };

        ctx.gpu.push_event("GBuffer");

        ctx.gpu.clear_depth(depth.view(), 1.0);
        ctx.gpu.clear(light_buffer.view(), Color::TRANSPARENT);
        for target in &gbuffer {
            ctx.gpu.clear(target.view(), Color::TRANSPARENT);
        }

        let data = GBufferData {
            view: ctx.view.shader_data(),
            params: Vec4::new(view_mode_index(ctx.view.mode) as f32, 0.0, 0.0, 0.0),
        };
        update_cb(ctx.gpu, cb, &data);
        ctx.gpu.bind_cb(VIEW_CB_SLOT, cb.handle);

        let targets = [
            light_buffer.view(),
            gbuffer[0].view(),
            gbuffer[1].view(),
            gbuffer[2].view(),
            gbuffer[3].view(),
        ];
        ctx.gpu.set_render_target(Some(depth.view()), &targets);
        ctx.gpu.set_viewport_and_scissors(ctx.buffers.viewport());

        let mode = ctx.view.mode;
        let state_for = |call: &crate::scene::DrawCall| {
            Some(match mode {
                ViewMode::Wireframe => handles.wireframe,
                mode if mode.overrides_gbuffer() => handles.debug,
                _ => handles.fill[cull_index(cull_mode(call))],
            })
        };
        draw_calls.execute(
            ctx.gpu,
            &ctx.list.draw_calls,
            ctx.list.list(DrawCallsListType::GBuffer),
            state_for,
        );

        if ctx.view.flags.contains(ViewFlags::SKY) {
            if let (Some(sky), Some(sky_cb)) = (ctx.list.sky, &self.sky_cb) {
                let data = SkyData {
                    view: ctx.view.shader_data(),
                    face_view_projection: Mat4::IDENTITY,
                    tint: Vec4::ONE,
                };
                update_cb(ctx.gpu, sky_cb, &data);
                ctx.gpu.bind_cb(VIEW_CB_SLOT, sky_cb.handle);
                ctx.gpu.set_render_target(Some(depth.view_read_only_depth()), &[light_buffer.view()]);
                ctx.gpu.bind_sr(SKY_CUBE_SR_SLOT, Some(sky.view().into()));
                ctx.gpu.set_state(handles.sky);
                ctx.gpu.draw_fullscreen_triangle(1);
                ctx.gpu.bind_sr(SKY_CUBE_SR_SLOT, None);
            }
        }

        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();
    }

    /// Project decals into the G-Buffer, then draw the geometry that does
    /// not receive decals. Skipped silently without decals.
    pub fn render_decals(&mut self, ctx: &mut RenderContext, light_buffer: &GpuTexture) {
        let (Some(handles), Some(cb), Some(draw_calls)) = (&self.handles, &self.cb, &self.draw_calls) else {
            return;
        };
        let (Some(depth), Some(gbuffer)) = (ctx.buffers.depth_buffer().copied(), ctx.buffers.gbuffers()) else {
            return;
        };

        if ctx.view.flags.contains(ViewFlags::DECALS) && !ctx.list.decals.is_empty() {
            if let (Some(decal_cb), Some(box_mesh)) = (&self.decal_cb, &self.box_mesh) {
                ctx.gpu.push_event("Decals");
                // Depth is sampled, so targets bind without it
                ctx.gpu.set_render_target(None, &[gbuffer[0].view(), gbuffer[1].view(), gbuffer[2].view()]);
                ctx.gpu.set_viewport_and_scissors(ctx.buffers.viewport());
                ctx.gpu.bind_sr(DECAL_DEPTH_SR_SLOT, Some(depth.view().into()));
                for decal in &ctx.list.decals {
                    let data = DecalData {
                        world: decal.world,
                        inv_world: decal.world.inverse(),
                        params: decal.material.emissive.extend(decal.sort_order as f32),
                    };
                    update_cb(ctx.gpu, decal_cb, &data);
                    ctx.gpu.bind_cb(VIEW_CB_SLOT + 1, decal_cb.handle);
                    ctx.gpu.set_state(handles.decal);
                    box_mesh.draw(ctx.gpu, 1);
                    if decal.material.emissive != glam::Vec3::ZERO {
                        ctx.gpu.set_render_target(None, &[light_buffer.view()]);
                        ctx.gpu.set_state(handles.decal_emissive);
                        box_mesh.draw(ctx.gpu, 1);
                        ctx.gpu.set_render_target(
                            None,
                            &[gbuffer[0].view(), gbuffer[1].view(), gbuffer[2].view()],
                        );
                    }
                }
                ctx.gpu.bind_sr(DECAL_DEPTH_SR_SLOT, None);
                ctx.gpu.pop_event();
            }
        }

        let list = ctx.list.list(DrawCallsListType::GBufferNoDecals);
        if list.is_empty() {
            return;
        }
        ctx.gpu.push_event("GBuffer.NoDecals");
        ctx.gpu.bind_cb(VIEW_CB_SLOT, cb.handle);
        let targets = [
            light_buffer.view(),
            gbuffer[0].view(),
            gbuffer[1].view(),
            gbuffer[2].view(),
            gbuffer[3].view(),
        ];
        ctx.gpu.set_render_target(Some(depth.view()), &targets);
        ctx.gpu.set_viewport_and_scissors(ctx.buffers.viewport());
        draw_calls.execute(ctx.gpu, &ctx.list.draw_calls, list, |call| {
            Some(handles.fill[cull_index(cull_mode(call))])
        });
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();
    }

    /// Render the sky into a small pooled cube for GI and volumetric fog.
    /// The caller releases the returned texture.
    pub fn render_sky_cube(&mut self, ctx: &mut RenderContext) -> Option<GpuTexture> {
        let (Some(handles), Some(sky_cb)) = (&self.handles, &self.sky_cb) else {
            return None;
        };
        let sky = ctx.list.sky?;
        let desc = TextureDescriptor::new_cube(
            SKY_CUBE_SIZE,
            TextureFormat::Rg11b10Float,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET | TextureFlags::PER_SLICE_VIEWS,
            1,
        );
        let cube = match ctx.get_temporary("SkyboxCube", &desc) {
            Ok(cube) => cube,
            Err(err) => {
                log::warn!("GBufferPass: {err}");
                return None;
            }
        };

        ctx.gpu.push_event("SkyCube");
        ctx.gpu.set_state(handles.sky_cube);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(SKY_CUBE_SIZE, SKY_CUBE_SIZE));
        ctx.gpu.bind_sr(SKY_CUBE_SR_SLOT, Some(sky.view().into()));
        for (face, (direction, up)) in crate::scene::CUBE_FACES.iter().enumerate() {
            let view = Mat4::look_to_rh(glam::Vec3::ZERO, *direction, *up);
            let projection = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 10.0);
            let data = SkyData {
                view: ctx.view.shader_data(),
                face_view_projection: projection * view,
                tint: Vec4::ONE,
            };
            update_cb(ctx.gpu, sky_cb, &data);
            ctx.gpu.bind_cb(VIEW_CB_SLOT, sky_cb.handle);
            ctx.gpu.set_render_target(None, &[cube.view_slice(face as u32)]);
            ctx.gpu.draw_fullscreen_triangle(1);
        }
        ctx.gpu.bind_sr(SKY_CUBE_SR_SLOT, None);
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();
        Some(cube)
    }
}

fn view_mode_index(mode: ViewMode) -> u32 {
    match mode {
        ViewMode::Default => 0,
        ViewMode::NoPostFx => 1,
        ViewMode::LightBuffer => 2,
        ViewMode::Wireframe => 3,
        ViewMode::QuadOverdraw => 4,
        ViewMode::LightmapUVsDensity => 5,
        ViewMode::VertexColors => 6,
        ViewMode::LODPreview => 7,
        ViewMode::MaterialComplexity => 8,
    }
}

impl RendererPass for GBufferPass {
    fn name(&self) -> &'static str {
        "GBufferPass"
    }

    fn init(&mut self, device: &mut dyn GpuDevice) -> RenderResult<()> {
        if self.box_mesh.is_none() {
            let mesh = GpuMesh::upload(device, &Mesh::cube()).map_err(|err| RenderError::resource("DecalBox", err))?;
            self.box_mesh = Some(mesh);
        }
        if self.draw_calls.is_none() {
            self.draw_calls = Some(DrawCallsRenderer::new(device, "GBuffer")?);
        }
        Ok(())
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        shaders.require(SHADER)?.check_cb(0, std::mem::size_of::<GBufferData>())?;
        shaders.require(DECALS_SHADER)?.check_cb(0, std::mem::size_of::<DecalData>())?;
        shaders.require(SKY_SHADER)?.check_cb(0, std::mem::size_of::<SkyData>())?;

        self.init(device)?;
        if self.cb.is_none() {
            self.cb = Some(create_constant_buffer::<GBufferData>(device, "GBuffer.CB")?);
        }
        if self.decal_cb.is_none() {
            self.decal_cb = Some(create_constant_buffer::<DecalData>(device, "Decals.CB")?);
        }
        if self.sky_cb.is_none() {
            self.sky_cb = Some(create_constant_buffer::<SkyData>(device, "Sky.CB")?);
        }
        match self.create_states(device) {
            Ok(handles) => {
                self.handles = Some(handles);
                Ok(())
            }
            Err(err) => {
                self.states.release(device);
                Err(err)
            }
        }
    }

    fn on_shader_reloading(&mut self, device: &mut dyn GpuDevice, shader: &str) {
        if [SHADER, DECALS_SHADER, SKY_SHADER].contains(&shader) {
            self.states.release(device);
            self.handles = None;
        }
    }

    fn dispose(&mut self, device: &mut dyn GpuDevice) {
        self.states.release(device);
        self.handles = None;
        for buffer in [self.cb.take(), self.decal_cb.take(), self.sky_cb.take()].into_iter().flatten() {
            device.destroy_buffer(buffer);
        }
        if let Some(draw_calls) = self.draw_calls.take() {
            draw_calls.release(device);
        }
        if let Some(mesh) = self.box_mesh.take() {
            mesh.release(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_reload_drops_states() {
        let mut device = RecordingDevice::new();
        let shaders = crate::pipeline::builtin_shader_library();
        let mut pass = GBufferPass::new();
        pass.setup_resources(&mut device, &shaders).unwrap();
        assert!(pass.is_ready());
        let count = device.pipeline_state_count();
        assert!(count > 0);

        pass.on_shader_reloading(&mut device, "Shaders/Unrelated");
        assert!(pass.is_ready());

        pass.on_shader_reloading(&mut device, DECALS_SHADER);
        assert!(!pass.is_ready());
        assert_eq!(device.pipeline_state_count(), 0);

        pass.setup_resources(&mut device, &shaders).unwrap();
        assert_eq!(device.pipeline_state_count(), count);
        pass.dispose(&mut device);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_loading_shader_blocks_setup() {
        let mut device = RecordingDevice::new();
        let mut shaders = crate::pipeline::builtin_shader_library();
        shaders.register_loading(SHADER, &[std::mem::size_of::<GBufferData>()]);
        let mut pass = GBufferPass::new();
        assert!(matches!(
            pass.setup_resources(&mut device, &shaders),
            Err(RenderError::ShaderNotReady(_))
        ));
    }
}
