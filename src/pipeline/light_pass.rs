//! Deferred lighting pass
//!
//! Accumulates every visible light into the light buffer with additive
//! blending. Directional lights draw a fullscreen triangle, local and sky
//! lights a sphere volume. A shadowed light first renders its shadow mask
//! into a transient target, bound at [`SHADOW_MASK_SR_SLOT`] while the
//! light draws and released right after.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::draw::{light_volume, LIGHT_SPHERE_RINGS, LIGHT_SPHERE_SEGMENTS};
use crate::pipeline::shadows::{ShadowLightKind, ShadowsPass};
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::{GpuMesh, Mesh, ShaderLibrary};
use crate::scene::{GpuViewData, LightShaderData, ViewFlags, ViewMode};

pub const SHADER: &str = "Shaders/Lights";

pub const LIGHT_CB_SLOT: u32 = 0;
/// GBuffer0..3 occupy slots 0..=3
pub const GBUFFER_SR_SLOT: u32 = 0;
pub const DEPTH_SR_SLOT: u32 = 4;
pub const SHADOW_MASK_SR_SLOT: u32 = 5;
pub const SKY_CUBE_SR_SLOT: u32 = 6;
pub const IES_SR_SLOT: u32 = 7;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PerLight {
    pub view: GpuViewData,
    pub wvp: Mat4,
    pub light: LightShaderData,
    /// (specular enabled, has shadow mask, has IES profile, unused)
    pub params: Vec4,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(SHADER, &[std::mem::size_of::<PerLight>()]);
}

struct LightStates {
    /// `[shadowed]`
    directional: [PipelineStateHandle; 2],
    /// `[camera inside][shadowed]`
    point: [[PipelineStateHandle; 2]; 2],
    spot: [[PipelineStateHandle; 2]; 2],
    /// `[camera inside]`
    sky: [PipelineStateHandle; 2],
}

/// One light to draw, copied out of the render list
struct LightDraw {
    kind: Option<ShadowLightKind>,
    index: usize,
    data: LightShaderData,
    volume: Option<(glam::Vec3, f32)>,
    shadowed: bool,
    ies: Option<GpuTexture>,
    sky_image: Option<GpuTexture>,
}

/// Deferred lighting pass
#[derive(Default)]
pub struct LightPass {
    states: PipelineStates,
    handles: Option<LightStates>,
    cb: Option<GpuBuffer>,
    sphere: Option<GpuMesh>,
}

impl LightPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.handles.is_some()
    }

    fn create_states(&mut self, device: &mut dyn GpuDevice) -> RenderResult<LightStates> {
        let directional = [
            self.states.create(
                device,
                &PipelineStateDescriptor::fullscreen(SHADER, "PS_Directional").with_blend(BlendMode::Additive),
            )?,
            self.states.create(
                device,
                &PipelineStateDescriptor::fullscreen(SHADER, "PS_Directional")
                    .with_blend(BlendMode::Additive)
                    .with_permutation(1),
            )?,
        ];

        let mut volume = |ps: &str| -> RenderResult<[[PipelineStateHandle; 2]; 2]> {
            let mut result = [[directional[0]; 2]; 2];
            for (inside, row) in result.iter_mut().enumerate() {
                let cull = if inside == 1 { CullMode::Front } else { CullMode::Back };
                for (shadowed, state) in row.iter_mut().enumerate() {
                    let desc = PipelineStateDescriptor::geometry(SHADER, "VS_Model", Some(ps))
                        .with_blend(BlendMode::Additive)
                        .with_cull(cull)
                        .with_permutation(shadowed as u32);
                    *state = self.states.create(device, &desc)?;
                }
            }
            Ok(result)
        };
        let point = volume("PS_Point")?;
        let spot = volume("PS_Spot")?;
        let sky = volume("PS_Sky")?;

        Ok(LightStates {
            directional,
            point,
            spot,
            sky: [sky[0][0], sky[1][0]],
        })
    }

    /// Order lights for drawing and shadow setup. Must run before
    /// [`ShadowsPass::setup_shadows`], which records light indices.
    pub fn setup_lights(&self, ctx: &mut RenderContext) {
        let flags = ctx.view.flags;
        if !flags.contains(ViewFlags::DIRECTIONAL_LIGHTS) {
            ctx.list.directional_lights.clear();
        }
        if !flags.contains(ViewFlags::POINT_LIGHTS) {
            ctx.list.point_lights.clear();
        }
        if !flags.contains(ViewFlags::SPOT_LIGHTS) {
            ctx.list.spot_lights.clear();
        }
        if !flags.contains(ViewFlags::SKY_LIGHTS) {
            ctx.list.sky_lights.clear();
        }
        ctx.list.sort_lights();
    }

    fn collect(ctx: &RenderContext) -> Vec<LightDraw> {
        let list = &ctx.list;
        let mut draws = Vec::with_capacity(list.light_count());
        for (index, light) in list.directional_lights.iter().enumerate() {
            draws.push(LightDraw {
                kind: Some(ShadowLightKind::Directional),
                index,
                data: light.shader_data(),
                volume: None,
                shadowed: light.base.has_shadow_data(),
                ies: None,
                sky_image: None,
            });
        }
        for (index, light) in list.point_lights.iter().enumerate() {
            draws.push(LightDraw {
                kind: Some(ShadowLightKind::Point),
                index,
                data: light.shader_data(),
                volume: Some((light.position, light.radius)),
                shadowed: light.base.has_shadow_data(),
                ies: light.ies_texture,
                sky_image: None,
            });
        }
        for (index, light) in list.spot_lights.iter().enumerate() {
            draws.push(LightDraw {
                kind: Some(ShadowLightKind::Spot),
                index,
                data: light.shader_data(),
                volume: Some((light.position, light.radius)),
                shadowed: light.base.has_shadow_data(),
                ies: light.ies_texture,
                sky_image: None,
            });
        }
        for (index, light) in list.sky_lights.iter().enumerate() {
            // Sky lights without a captured or custom cube have nothing to add
            if light.image.is_none() {
                continue;
            }
            draws.push(LightDraw {
                kind: None,
                index,
                data: light.shader_data(),
                volume: Some((light.position, light.radius)),
                shadowed: false,
                ies: None,
                sky_image: light.image,
            });
        }
        draws
    }

    /// Draw directional, point, spot and sky lights into `light_buffer`
    pub fn render(&mut self, ctx: &mut RenderContext, light_buffer: &GpuTexture, shadows: Option<&ShadowsPass>) {
        let (Some(handles), Some(cb), Some(sphere)) = (&self.handles, &self.cb, self.sphere) else {
            return;
        };
        let (Some(depth), Some(gbuffer)) = (ctx.buffers.depth_buffer().copied(), ctx.buffers.gbuffers()) else {
            return;
        };

        let draws = Self::collect(ctx);
        let debug_light_buffer = ctx.view.mode == ViewMode::LightBuffer;
        if draws.is_empty() && !debug_light_buffer {
            return;
        }

        ctx.gpu.push_event("Lights");
        if debug_light_buffer {
            ctx.gpu.clear(gbuffer[0].view(), Color::WHITE);
        }

        let (width, height) = ctx.buffers.size();
        let mask_desc = TextureDescriptor::new_2d(
            width,
            height,
            TextureFormat::R8Unorm,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
        );
        let specular = if ctx.view.flags.contains(ViewFlags::SPECULAR_LIGHT) { 1.0 } else { 0.0 };
        let view_data = ctx.view.shader_data();

        for draw in &draws {
            let mut mask = None;
            if let (true, Some(kind), Some(shadows)) = (draw.shadowed, draw.kind, shadows) {
                match ctx.get_temporary("ShadowMask", &mask_desc) {
                    Ok(texture) => {
                        if shadows.render_shadow_mask(ctx, kind, draw.index, &texture) {
                            mask = Some(texture);
                        } else {
                            ctx.release(texture);
                        }
                    }
                    Err(err) => log::warn!("LightPass: {err}"),
                }
            }

            ctx.gpu.set_render_target(None, &[light_buffer.view()]);
            ctx.gpu.set_viewport_and_scissors(ctx.buffers.viewport());
            for (slot, target) in gbuffer.iter().enumerate() {
                ctx.gpu.bind_sr(GBUFFER_SR_SLOT + slot as u32, Some(target.view().into()));
            }
            ctx.gpu.bind_sr(DEPTH_SR_SLOT, Some(depth.view().into()));
            ctx.gpu.bind_sr(SHADOW_MASK_SR_SLOT, mask.map(|m: GpuTexture| m.view().into()));
            ctx.gpu.bind_sr(IES_SR_SLOT, draw.ies.map(|t| t.view().into()));
            ctx.gpu.bind_sr(SKY_CUBE_SR_SLOT, draw.sky_image.map(|t| t.view().into()));

            let shadowed = usize::from(mask.is_some());
            let (wvp, state) = match (draw.kind, draw.volume) {
                (Some(ShadowLightKind::Directional), _) | (_, None) => (Mat4::IDENTITY, handles.directional[shadowed]),
                (kind, Some((position, radius))) => {
                    let (wvp, inside) = light_volume(&ctx.view, position, radius);
                    let inside = usize::from(inside);
                    let state = match kind {
                        Some(ShadowLightKind::Point) => handles.point[inside][shadowed],
                        Some(ShadowLightKind::Spot) => handles.spot[inside][shadowed],
                        _ => handles.sky[inside],
                    };
                    (wvp, state)
                }
            };

            let data = PerLight {
                view: view_data,
                wvp,
                light: draw.data,
                params: Vec4::new(
                    specular,
                    shadowed as f32,
                    if draw.ies.is_some() { 1.0 } else { 0.0 },
                    0.0,
                ),
            };
            update_cb(ctx.gpu, cb, &data);
            ctx.gpu.bind_cb(LIGHT_CB_SLOT, cb.handle);
            ctx.gpu.set_state(state);
            if draw.volume.is_some() && draw.kind != Some(ShadowLightKind::Directional) {
                sphere.draw(ctx.gpu, 1);
            } else {
                ctx.gpu.draw_fullscreen_triangle(1);
            }

            if let Some(mask) = mask {
                ctx.gpu.bind_sr(SHADOW_MASK_SR_SLOT, None);
                ctx.release(mask);
            }
        }

        ctx.gpu.reset_sr();
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();
    }
}

impl RendererPass for LightPass {
    fn name(&self) -> &'static str {
        "LightPass"
    }

    fn init(&mut self, device: &mut dyn GpuDevice) -> RenderResult<()> {
        if self.sphere.is_none() {
            let mesh = GpuMesh::upload(device, &Mesh::sphere(LIGHT_SPHERE_SEGMENTS, LIGHT_SPHERE_RINGS))
                .map_err(|err| RenderError::resource("LightSphere", err))?;
            self.sphere = Some(mesh);
        }
        Ok(())
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        shaders.require(SHADER)?.check_cb(0, std::mem::size_of::<PerLight>())?;
        self.init(device)?;
        if self.cb.is_none() {
            self.cb = Some(create_constant_buffer::<PerLight>(device, "Lights.CB")?);
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
        if shader == SHADER {
            self.states.release(device);
            self.handles = None;
        }
    }

    fn dispose(&mut self, device: &mut dyn GpuDevice) {
        self.states.release(device);
        self.handles = None;
        if let Some(cb) = self.cb.take() {
            device.destroy_buffer(cb);
        }
        if let Some(sphere) = self.sphere.take() {
            sphere.release(device);
        }
    }
}
