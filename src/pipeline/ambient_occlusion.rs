//! Screen-space ambient occlusion (ASSAO)
//!
//! Works at half resolution on four interleaved checkerboard sub-images:
//! prepare depths, generate, blur, then multiply the result into the
//! material AO channel (GBuffer2.a).

use std::f32::consts::FRAC_PI_2;

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec4};

use crate::backend::*;
use crate::error::RenderResult;
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::ShaderLibrary;
use crate::scene::{AmbientOcclusionSettings, ViewFlags};

pub const SHADER: &str = "Shaders/SSAO";

pub const CB_SLOT: u32 = 0;
pub const DEPTH_SR_SLOT: u32 = 0;
pub const NORMALS_SR_SLOT: u32 = 1;
pub const AO_SR_SLOT: u32 = 2;

/// Mips of every half-resolution depth sub-image
pub const SSAO_DEPTH_MIP_LEVELS: u32 = 4;
pub const SUB_PASS_COUNT: usize = 5;
pub const MAX_BLUR_PASS_COUNT: u32 = 6;
/// Order in which rotation sub-passes are laid out
pub const SUB_PASS_MAP: [usize; SUB_PASS_COUNT] = [0, 1, 4, 3, 2];

const HALF_DEPTH_FORMAT: TextureFormat = TextureFormat::R16Float;
const AO_FORMAT: TextureFormat = TextureFormat::Rg8Unorm;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AssaoConstants {
    pub viewport_pixel_size: Vec2,
    pub half_viewport_pixel_size: Vec2,
    pub depth_unpack_consts: Vec2,
    pub camera_tan_half_fov: Vec2,
    pub ndc_to_view_mul: Vec2,
    pub ndc_to_view_add: Vec2,
    pub per_pass_full_res_coord_offset: Vec2,
    pub per_pass_full_res_uv_offset: Vec2,
    pub viewport_2x_pixel_size: Vec2,
    pub viewport_2x_pixel_size_x025: Vec2,
    pub effect_radius: f32,
    pub effect_shadow_strength: f32,
    pub effect_shadow_pow: f32,
    pub effect_shadow_clamp: f32,
    pub effect_fade_out_mul: f32,
    pub effect_fade_out_add: f32,
    pub effect_horizon_angle_threshold: f32,
    pub effect_sampling_radius_near_limit_rec: f32,
    pub depth_precision_offset_mod: f32,
    pub neg_rec_effect_radius: f32,
    pub inv_sharpness: f32,
    pub pass_index: f32,
    pub pattern_rot_scale_matrices: [Vec4; SUB_PASS_COUNT],
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(SHADER, &[std::mem::size_of::<AssaoConstants>()]);
}

/// Rotation/scale matrices of one checkerboard pass, packed as
/// `(cos, -sin, -sin, -cos) * scale`
pub fn pattern_rot_scale_matrices(pass: usize) -> [Vec4; SUB_PASS_COUNT] {
    let mut matrices = [Vec4::ZERO; SUB_PASS_COUNT];
    let a = pass as f32;
    for (i, matrix) in matrices.iter_mut().enumerate() {
        let b = SUB_PASS_MAP[i] as f32;
        let angle = (a + b / SUB_PASS_COUNT as f32) * FRAC_PI_2;
        let (sin, cos) = angle.sin_cos();
        let scale = 1.0 + (a - 1.5 + (b - (SUB_PASS_COUNT as f32 - 1.0) * 0.5) / SUB_PASS_COUNT as f32) * 0.07;
        *matrix = Vec4::new(cos, -sin, -sin, -cos) * scale;
    }
    matrices
}

/// Blur iterations for a quality index, 0 meaning one non-smart pass
pub fn blur_pass_count(quality: u32) -> u32 {
    match quality {
        0 => 1,
        1 => 2,
        2 => 3,
        _ => 4,
    }
    .min(MAX_BLUR_PASS_COUNT)
}

/// Radius and fade constants derived from the settings and the camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectParams {
    pub effect_radius: f32,
    pub sampling_radius_near_limit: f32,
    pub fade_out_mul: f32,
    pub fade_out_add: f32,
}

pub fn effect_params(settings: &AmbientOcclusionSettings, quality: u32, far: f32, fov_y: f32) -> EffectParams {
    let effect_radius = (settings.radius / far * 10000.0).clamp(0.0, 100_000.0);

    let mut near_limit = settings.radius * 1.2;
    if quality == 0 {
        near_limit *= 1.5;
    }
    near_limit /= (fov_y * 0.5).tan();

    let fade_to = settings.fade_out_distance;
    let fade_from = settings.fade_out_distance - settings.fade_distance;
    let range = (fade_to - fade_from).max(1e-4);

    EffectParams {
        effect_radius,
        sampling_radius_near_limit: near_limit,
        fade_out_mul: far / range,
        fade_out_add: -fade_from / range,
    }
}

struct AoStates {
    prepare_depths: PipelineStateHandle,
    prepare_depths_half: PipelineStateHandle,
    prepare_depth_mip: PipelineStateHandle,
    generate: [PipelineStateHandle; 4],
    smart_blur: PipelineStateHandle,
    smart_blur_wide: PipelineStateHandle,
    non_smart_blur: PipelineStateHandle,
    apply: PipelineStateHandle,
    apply_half: PipelineStateHandle,
}

/// Transient targets of one AO evaluation
struct AoTargets {
    half_depths: [GpuTexture; 4],
    ping: GpuTexture,
    pong: GpuTexture,
    final_results: GpuTexture,
}

impl AoTargets {
    fn release(self, ctx: &RenderContext) {
        for texture in self.half_depths {
            ctx.release(texture);
        }
        ctx.release(self.ping);
        ctx.release(self.pong);
        ctx.release(self.final_results);
    }
}

/// Ambient occlusion pass
#[derive(Default)]
pub struct AmbientOcclusionPass {
    states: PipelineStates,
    handles: Option<AoStates>,
    cb: Option<GpuBuffer>,
}

impl AmbientOcclusionPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.handles.is_some()
    }

    fn create_states(&mut self, device: &mut dyn GpuDevice) -> RenderResult<AoStates> {
        let fullscreen = |ps: &str, permutation: u32| {
            PipelineStateDescriptor::fullscreen(SHADER, ps).with_permutation(permutation)
        };
        let generate = [
            self.states.create(device, &fullscreen("PS_GenerateQ0", 0))?,
            self.states.create(device, &fullscreen("PS_GenerateQ1", 1))?,
            self.states.create(device, &fullscreen("PS_GenerateQ2", 2))?,
            self.states.create(device, &fullscreen("PS_GenerateQ3", 3))?,
        ];
        Ok(AoStates {
            prepare_depths: self.states.create(device, &fullscreen("PS_PrepareDepths", 0))?,
            prepare_depths_half: self.states.create(device, &fullscreen("PS_PrepareDepthsHalf", 0))?,
            prepare_depth_mip: self.states.create(device, &fullscreen("PS_PrepareDepthMip", 0))?,
            generate,
            smart_blur: self.states.create(device, &fullscreen("PS_SmartBlur", 0))?,
            smart_blur_wide: self.states.create(device, &fullscreen("PS_SmartBlurWide", 0))?,
            non_smart_blur: self.states.create(device, &fullscreen("PS_NonSmartBlur", 0))?,
            apply: self.states.create(
                device,
                &fullscreen("PS_Apply", 0)
                    .with_blend(BlendMode::Multiply)
                    .with_write_mask(ColorWrites::ALPHA),
            )?,
            apply_half: self.states.create(
                device,
                &fullscreen("PS_ApplyHalf", 0)
                    .with_blend(BlendMode::Multiply)
                    .with_write_mask(ColorWrites::ALPHA),
            )?,
        })
    }

    fn allocate(ctx: &mut RenderContext, half_width: u32, half_height: u32) -> RenderResult<AoTargets> {
        let depth_desc = TextureDescriptor::new_2d(
            half_width,
            half_height,
            HALF_DEPTH_FORMAT,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET | TextureFlags::PER_MIP_VIEWS,
        )
        .with_mips(SSAO_DEPTH_MIP_LEVELS);
        let ao_desc = TextureDescriptor::new_2d(
            half_width,
            half_height,
            AO_FORMAT,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
        );
        let final_desc = TextureDescriptor::new_2d_array(
            half_width,
            half_height,
            4,
            AO_FORMAT,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET | TextureFlags::PER_SLICE_VIEWS,
        );

        let mut acquired = Vec::with_capacity(7);
        let names = [
            "SSAO.HalfDepth0",
            "SSAO.HalfDepth1",
            "SSAO.HalfDepth2",
            "SSAO.HalfDepth3",
            "SSAO.PingPongA",
            "SSAO.PingPongB",
            "SSAO.FinalResults",
        ];
        for (i, name) in names.iter().enumerate() {
            let desc = match i {
                0..=3 => &depth_desc,
                4 | 5 => &ao_desc,
                _ => &final_desc,
            };
            match ctx.get_temporary(name, desc) {
                Ok(texture) => acquired.push(texture),
                Err(err) => {
                    for texture in acquired {
                        ctx.release(texture);
                    }
                    return Err(err);
                }
            }
        }

        Ok(AoTargets {
            half_depths: [acquired[0], acquired[1], acquired[2], acquired[3]],
            ping: acquired[4],
            pong: acquired[5],
            final_results: acquired[6],
        })
    }

    /// Compute AO and multiply it into GBuffer2.a
    pub fn render(&mut self, ctx: &mut RenderContext) {
        let settings = ctx.list.settings.ambient_occlusion.clone();
        if !ctx.view.flags.contains(ViewFlags::AO)
            || !settings.enabled
            || settings.intensity <= 0.0
            || settings.radius <= 0.0
            || ctx.view.is_orthographic
        {
            return;
        }
        let (Some(handles), Some(cb)) = (&self.handles, &self.cb) else {
            return;
        };
        let (Some(depth), Some(gbuffer)) = (ctx.buffers.depth_buffer().copied(), ctx.buffers.gbuffers()) else {
            return;
        };

        let (width, height) = ctx.buffers.size();
        let half_width = width.div_ceil(2);
        let half_height = height.div_ceil(2);
        let targets = match Self::allocate(ctx, half_width, half_height) {
            Ok(targets) => targets,
            Err(err) => {
                log::warn!("AmbientOcclusionPass: {err}");
                return;
            }
        };

        let quality = settings.quality.index();
        let skip_half_pixels = quality == 0;
        let blur_passes = blur_pass_count(quality);
        let params = effect_params(&settings, quality, ctx.view.far, ctx.view.fov_y);

        let near = ctx.view.near;
        let far = ctx.view.far;
        let tan_half_fov_y = (ctx.view.fov_y * 0.5).tan();
        let tan_half_fov_x = tan_half_fov_y * ctx.view.aspect_ratio();
        let mut constants = AssaoConstants {
            viewport_pixel_size: Vec2::new(1.0 / width as f32, 1.0 / height as f32),
            half_viewport_pixel_size: Vec2::new(1.0 / half_width as f32, 1.0 / half_height as f32),
            depth_unpack_consts: Vec2::new(near * far / (far - near), far / (far - near)),
            camera_tan_half_fov: Vec2::new(tan_half_fov_x, tan_half_fov_y),
            ndc_to_view_mul: Vec2::new(tan_half_fov_x * 2.0, tan_half_fov_y * -2.0),
            ndc_to_view_add: Vec2::new(-tan_half_fov_x, tan_half_fov_y),
            per_pass_full_res_coord_offset: Vec2::ZERO,
            per_pass_full_res_uv_offset: Vec2::ZERO,
            viewport_2x_pixel_size: Vec2::new(2.0 / width as f32, 2.0 / height as f32),
            viewport_2x_pixel_size_x025: Vec2::new(0.5 / width as f32, 0.5 / height as f32),
            effect_radius: params.effect_radius,
            effect_shadow_strength: settings.intensity * 4.3,
            effect_shadow_pow: settings.power,
            effect_shadow_clamp: 0.98,
            effect_fade_out_mul: params.fade_out_mul,
            effect_fade_out_add: params.fade_out_add,
            effect_horizon_angle_threshold: 0.06,
            effect_sampling_radius_near_limit_rec: 1.0 / params.sampling_radius_near_limit.max(1e-4),
            depth_precision_offset_mod: 0.9992,
            neg_rec_effect_radius: -1.0 / params.effect_radius.max(1e-4),
            inv_sharpness: 1.0 - 0.98,
            pass_index: 0.0,
            pattern_rot_scale_matrices: pattern_rot_scale_matrices(0),
        };

        ctx.gpu.push_event("SSAO");
        update_cb(ctx.gpu, cb, &constants);
        ctx.gpu.bind_cb(CB_SLOT, cb.handle);

        // Prepare depths
        ctx.gpu.bind_sr(DEPTH_SR_SLOT, Some(depth.view().into()));
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(half_width, half_height));
        if skip_half_pixels {
            ctx.gpu.set_render_target(
                None,
                &[targets.half_depths[0].view_mip(0), targets.half_depths[3].view_mip(0)],
            );
            ctx.gpu.set_state(handles.prepare_depths_half);
        } else {
            let views = targets.half_depths.map(|t| t.view_mip(0));
            ctx.gpu.set_render_target(None, &views);
            ctx.gpu.set_state(handles.prepare_depths);
        }
        ctx.gpu.draw_fullscreen_triangle(1);

        ctx.gpu.set_state(handles.prepare_depth_mip);
        for mip in 1..SSAO_DEPTH_MIP_LEVELS {
            let (mip_width, mip_height) = targets.half_depths[0].desc.mip_size(mip);
            ctx.gpu.set_viewport_and_scissors(Viewport::from_size(mip_width, mip_height));
            for (i, half_depth) in targets.half_depths.iter().enumerate() {
                if skip_half_pixels && (i == 1 || i == 2) {
                    continue;
                }
                ctx.gpu.set_render_target(None, &[half_depth.view_mip(mip)]);
                ctx.gpu.bind_sr(DEPTH_SR_SLOT, Some(half_depth.view_mip(mip - 1).into()));
                ctx.gpu.draw_fullscreen_triangle(1);
            }
        }

        // Generate and blur every sub-image
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(half_width, half_height));
        for pass in 0..4usize {
            if skip_half_pixels && (pass == 1 || pass == 2) {
                continue;
            }
            let offset = Vec2::new((pass % 2) as f32, (pass / 2) as f32);
            constants.pass_index = pass as f32;
            constants.per_pass_full_res_coord_offset = offset;
            constants.per_pass_full_res_uv_offset = (offset - 0.5) / Vec2::new(width as f32, height as f32);
            constants.pattern_rot_scale_matrices = pattern_rot_scale_matrices(pass);
            update_cb(ctx.gpu, cb, &constants);

            ctx.gpu.set_render_target(None, &[targets.ping.view()]);
            ctx.gpu.bind_sr(DEPTH_SR_SLOT, Some(targets.half_depths[pass].view().into()));
            ctx.gpu.bind_sr(NORMALS_SR_SLOT, Some(gbuffer[1].view().into()));
            ctx.gpu.set_state(handles.generate[quality as usize]);
            ctx.gpu.draw_fullscreen_triangle(1);
            ctx.gpu.bind_sr(NORMALS_SR_SLOT, None);

            let mut wide_blurs_remaining = blur_passes.saturating_sub(2);
            let (mut src, mut dst) = (targets.ping, targets.pong);
            for i in 0..blur_passes {
                let last = i + 1 == blur_passes;
                let output = if last {
                    targets.final_results.view_slice(pass as u32)
                } else {
                    dst.view()
                };
                ctx.gpu.set_render_target(None, &[output]);
                ctx.gpu.bind_sr(AO_SR_SLOT, Some(src.view().into()));
                let state = if quality == 0 {
                    handles.non_smart_blur
                } else if wide_blurs_remaining > 0 {
                    wide_blurs_remaining -= 1;
                    handles.smart_blur_wide
                } else {
                    handles.smart_blur
                };
                ctx.gpu.set_state(state);
                ctx.gpu.draw_fullscreen_triangle(1);
                std::mem::swap(&mut src, &mut dst);
            }
            ctx.gpu.bind_sr(AO_SR_SLOT, None);
        }

        // Apply into the material AO channel
        ctx.gpu.set_viewport_and_scissors(ctx.buffers.viewport());
        ctx.gpu.set_render_target(None, &[gbuffer[2].view()]);
        ctx.gpu.bind_sr(AO_SR_SLOT, Some(targets.final_results.view().into()));
        ctx.gpu.set_state(if skip_half_pixels { handles.apply_half } else { handles.apply });
        ctx.gpu.draw_fullscreen_triangle(1);
        ctx.gpu.reset_sr();
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();

        targets.release(ctx);
    }
}

impl RendererPass for AmbientOcclusionPass {
    fn name(&self) -> &'static str {
        "AmbientOcclusionPass"
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        shaders.require(SHADER)?.check_cb(0, std::mem::size_of::<AssaoConstants>())?;
        if self.cb.is_none() {
            self.cb = Some(create_constant_buffer::<AssaoConstants>(device, "SSAO.CB")?);
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_utils::TestFrame;
    use crate::scene::Quality;

    #[test]
    fn test_constants_are_16_byte_aligned() {
        assert_eq!(std::mem::size_of::<AssaoConstants>() % 16, 0);
    }

    #[test]
    fn test_pattern_rotation_first_entry() {
        let matrices = pattern_rot_scale_matrices(0);
        // a = 0, b = 0: angle 0, scale 1 + (-1.5 - 0.4) * 0.07
        let scale = 1.0 + (-1.5 - 0.4) * 0.07;
        assert!((matrices[0] - Vec4::new(scale, 0.0, 0.0, -scale)).length() < 1e-5);
        // Entry 2 uses b = 4
        let angle = (4.0 / 5.0) * FRAC_PI_2;
        let scale = 1.0 + (-1.5 + 0.4) * 0.07;
        assert!((matrices[2].x - angle.cos() * scale).abs() < 1e-5);
    }

    #[test]
    fn test_effect_params() {
        let settings = AmbientOcclusionSettings {
            radius: 1.0,
            fade_out_distance: 5000.0,
            fade_distance: 500.0,
            ..Default::default()
        };
        let fov = 90f32.to_radians();
        let params = effect_params(&settings, 0, 10000.0, fov);
        assert!((params.effect_radius - 1.0).abs() < 1e-5);
        assert!((params.sampling_radius_near_limit - 1.8).abs() < 1e-4);
        assert!((params.fade_out_mul - 20.0).abs() < 1e-4);

        let params = effect_params(&settings, 2, 10000.0, fov);
        assert!((params.sampling_radius_near_limit - 1.2).abs() < 1e-4);
    }

    #[test]
    fn test_half_depths_have_four_mips() {
        let mut frame = TestFrame::new(640, 360);
        let mut pass = AmbientOcclusionPass::new();
        frame.setup(&mut pass);
        pass.render(&mut frame.ctx());

        let half_depths = frame.device.find_textures("SSAO.HalfDepth0");
        assert_eq!(half_depths.len(), 1);
        assert_eq!(half_depths[0].mip_levels, SSAO_DEPTH_MIP_LEVELS);
        assert_eq!((half_depths[0].width, half_depths[0].height), (320, 180));
        assert_eq!(frame.pool.stats().in_use, 0);
    }

    #[test]
    fn test_low_quality_skips_half_the_sub_images() {
        let mut frame = TestFrame::new(64, 64);
        frame.list.settings.ambient_occlusion.quality = Quality::Low;
        let mut pass = AmbientOcclusionPass::new();
        frame.setup(&mut pass);
        pass.render(&mut frame.ctx());
        let low = frame.gpu.draw_count();

        frame.gpu.clear();
        frame.list.settings.ambient_occlusion.quality = Quality::Ultra;
        pass.render(&mut frame.ctx());
        assert!(frame.gpu.draw_count() > low);
    }

    #[test]
    fn test_skipped_for_orthographic_views() {
        let mut frame = TestFrame::new(64, 64);
        frame.view.set_orthographic(
            glam::Vec3::ZERO,
            glam::Vec3::NEG_Z,
            glam::Vec3::Y,
            100.0,
            100.0,
            1.0,
            1000.0,
        );
        let mut pass = AmbientOcclusionPass::new();
        frame.setup(&mut pass);
        pass.render(&mut frame.ctx());
        assert!(frame.gpu.commands().is_empty());
    }
}
