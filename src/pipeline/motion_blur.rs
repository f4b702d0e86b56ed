//! Motion vectors and per-pixel motion blur
//!
//! Motion vectors are written by a fullscreen camera-motion pass, then
//! moving objects overwrite their pixels with a depth test. The blur
//! reduces the vectors to per-tile maxima, spreads them to neighbours and
//! reconstructs the blurred color along the dominant velocity.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::*;
use crate::error::RenderResult;
use crate::pipeline::draw::{cull_index, cull_mode, DrawCallsRenderer};
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::ShaderLibrary;
use crate::scene::{AntialiasingMode, DrawCallsListType, ResolutionMode, ViewFlags, EPSILON};

pub const SHADER: &str = "Shaders/MotionBlur";

pub const CB_SLOT: u32 = 0;
pub const INPUT_SR_SLOT: u32 = 0;
pub const MOTION_VECTORS_SR_SLOT: u32 = 1;
pub const NEIGHBOR_MAX_SR_SLOT: u32 = 2;
pub const DEPTH_SR_SLOT: u32 = 3;

/// Size in pixels of one velocity tile
pub const TILE_SIZE: u32 = 32;
pub const MOTION_VECTORS_FORMAT: TextureFormat = TextureFormat::Rg16Float;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MotionBlurData {
    pub current_vp: Mat4,
    pub previous_vp: Mat4,
    pub temporal_aa_jitter: Vec4,
    /// (width, height, 1 / width, 1 / height) of the texture being written
    pub texture_size: Vec4,
    /// (width, height, 1 / width, 1 / height) of the motion vectors
    pub motion_vectors_size: Vec4,
    /// (velocity scale, samples per direction, tile size, unused)
    pub params: Vec4,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(SHADER, &[std::mem::size_of::<MotionBlurData>()]);
}

/// Scale applied to motion vectors by the reconstruction. Real-time views
/// normalize to a 60 Hz frame so the blur length does not depend on the
/// frame rate.
pub fn velocity_scale(scale: f32, delta_time: f32, offline: bool) -> f32 {
    let frame_scale = if offline || delta_time <= EPSILON {
        1.0
    } else {
        1.0 / (delta_time * 60.0)
    };
    scale * 0.5 * frame_scale
}

/// Sizes of the tile-max pyramid: half, quarter, eighth, then tiles
pub fn tile_pyramid(width: u32, height: u32) -> [(u32, u32); 4] {
    let tiles = (width.div_ceil(TILE_SIZE).max(1), height.div_ceil(TILE_SIZE).max(1));
    [
        ((width / 2).max(1), (height / 2).max(1)),
        ((width / 4).max(1), (height / 4).max(1)),
        ((width / 8).max(1), (height / 8).max(1)),
        tiles,
    ]
}

fn size_vec(width: u32, height: u32) -> Vec4 {
    Vec4::new(width as f32, height as f32, 1.0 / width as f32, 1.0 / height as f32)
}

struct MotionBlurStates {
    camera_motion: PipelineStateHandle,
    /// `[Back, Front, None]`
    object_motion: [PipelineStateHandle; 3],
    tile_max: PipelineStateHandle,
    tile_max_variable: PipelineStateHandle,
    neighbor_max: PipelineStateHandle,
    reconstruction: PipelineStateHandle,
}

/// Motion vectors and motion blur
#[derive(Default)]
pub struct MotionBlurPass {
    states: PipelineStates,
    handles: Option<MotionBlurStates>,
    cb: Option<GpuBuffer>,
    draw_calls: Option<DrawCallsRenderer>,
}

impl MotionBlurPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.handles.is_some()
    }

    fn create_states(&mut self, device: &mut dyn GpuDevice) -> RenderResult<MotionBlurStates> {
        let object = PipelineStateDescriptor::geometry(SHADER, "VS_MotionVectors", Some("PS_MotionVectors"))
            .with_depth(true, false, CompareFunction::Less);
        Ok(MotionBlurStates {
            camera_motion: self
                .states
                .create(device, &PipelineStateDescriptor::fullscreen(SHADER, "PS_CameraMotionVectors"))?,
            object_motion: [
                self.states.create(device, &object.clone().with_cull(CullMode::Back))?,
                self.states.create(device, &object.clone().with_cull(CullMode::Front))?,
                self.states.create(device, &object.with_cull(CullMode::None))?,
            ],
            tile_max: self
                .states
                .create(device, &PipelineStateDescriptor::fullscreen(SHADER, "PS_TileMax"))?,
            tile_max_variable: self
                .states
                .create(device, &PipelineStateDescriptor::fullscreen(SHADER, "PS_TileMaxVariable"))?,
            neighbor_max: self
                .states
                .create(device, &PipelineStateDescriptor::fullscreen(SHADER, "PS_NeighborMax"))?,
            reconstruction: self
                .states
                .create(device, &PipelineStateDescriptor::fullscreen(SHADER, "PS_MotionBlur"))?,
        })
    }

    fn constants(ctx: &RenderContext, texture: (u32, u32), motion_vectors: (u32, u32)) -> MotionBlurData {
        let settings = &ctx.list.settings.motion_blur;
        MotionBlurData {
            current_vp: ctx.view.view_projection,
            previous_vp: ctx.view.prev_view_projection,
            temporal_aa_jitter: ctx.view.temporal_aa_jitter,
            texture_size: size_vec(texture.0, texture.1),
            motion_vectors_size: size_vec(motion_vectors.0, motion_vectors.1),
            params: Vec4::new(
                velocity_scale(settings.scale, ctx.frame.delta_time, ctx.view.is_offline_pass),
                (settings.sample_count / 2).max(1) as f32,
                TILE_SIZE as f32,
                0.0,
            ),
        }
    }

    /// Whether any enabled effect reads motion vectors this frame
    pub fn needs_motion_vectors(ctx: &RenderContext) -> bool {
        let settings = &ctx.list.settings;
        let flags = ctx.view.flags;
        let motion_blur = flags.contains(ViewFlags::MOTION_BLUR) && settings.motion_blur.enabled;
        let taa = flags.contains(ViewFlags::ANTI_ALIASING)
            && settings.anti_aliasing.mode == AntialiasingMode::TemporalAntialiasing;
        motion_blur || taa
    }

    /// Render the view's motion vectors into `RenderBuffers::motion_vectors`.
    /// The target is released when nothing needs it.
    pub fn render_motion_vectors(&mut self, ctx: &mut RenderContext) {
        if !Self::needs_motion_vectors(ctx) {
            ctx.buffers.motion_vectors.release(ctx.pool);
            return;
        }
        let (Some(handles), Some(cb), Some(draw_calls)) = (&self.handles, &self.cb, &self.draw_calls) else {
            return;
        };
        let Some(depth) = ctx.buffers.depth_buffer().copied() else {
            return;
        };

        // TAA reprojects per pixel and needs full resolution vectors
        let taa = ctx.list.settings.anti_aliasing.mode == AntialiasingMode::TemporalAntialiasing
            && ctx.view.flags.contains(ViewFlags::ANTI_ALIASING);
        let resolution = if taa {
            ResolutionMode::Full
        } else {
            ctx.list.settings.motion_blur.motion_vectors_resolution
        };
        let (width, height) = resolution.apply(ctx.buffers.width(), ctx.buffers.height());
        let desc = TextureDescriptor::new_2d(
            width,
            height,
            MOTION_VECTORS_FORMAT,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
        );

        let frame = ctx.frame_index();
        let target = match ctx.buffers.motion_vectors.get().copied() {
            Some(existing) if existing.desc == desc => {
                ctx.buffers.motion_vectors.touch(frame);
                existing
            }
            _ => match ctx.get_temporary("MotionVectors", &desc) {
                Ok(texture) => {
                    ctx.buffers.motion_vectors.set(ctx.pool, texture, frame);
                    texture
                }
                Err(err) => {
                    log::warn!("MotionBlurPass: {err}");
                    return;
                }
            },
        };

        ctx.gpu.push_event("MotionVectors");

        if !ctx.view.has_jitter() && ctx.view.view_projection == ctx.view.prev_view_projection {
            ctx.gpu.clear(target.view(), Color::BLACK);
            ctx.gpu.pop_event();
            return;
        }

        let data = Self::constants(ctx, (width, height), (width, height));
        update_cb(ctx.gpu, cb, &data);
        ctx.gpu.bind_cb(CB_SLOT, cb.handle);

        ctx.gpu.set_render_target(None, &[target.view()]);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(width, height));
        ctx.gpu.bind_sr(DEPTH_SR_SLOT, Some(depth.view().into()));
        ctx.gpu.set_state(handles.camera_motion);
        ctx.gpu.draw_fullscreen_triangle(1);
        ctx.gpu.bind_sr(DEPTH_SR_SLOT, None);

        // Object motion tests against the scene depth, so it needs a
        // full resolution target
        if resolution == ResolutionMode::Full {
            let list = ctx.list.list(DrawCallsListType::MotionVectors);
            if !list.is_empty() {
                ctx.gpu.set_render_target(Some(depth.view_read_only_depth()), &[target.view()]);
                draw_calls.execute(ctx.gpu, &ctx.list.draw_calls, list, |call| {
                    Some(handles.object_motion[cull_index(cull_mode(call))])
                });
            }
        }

        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();
    }

    /// Blur `input` into `output` along the motion vectors. Returns false
    /// when the blur is skipped and `output` was not written.
    pub fn render(&mut self, ctx: &mut RenderContext, input: &GpuTexture, output: &GpuTexture) -> bool {
        let settings = &ctx.list.settings.motion_blur;
        if !ctx.view.flags.contains(ViewFlags::MOTION_BLUR)
            || !settings.enabled
            || settings.scale <= EPSILON
            || ctx.view.is_camera_cut
        {
            return false;
        }
        let (Some(handles), Some(cb)) = (&self.handles, &self.cb) else {
            return false;
        };
        let (Some(motion_vectors), Some(depth)) =
            (ctx.buffers.motion_vectors.get().copied(), ctx.buffers.depth_buffer().copied())
        else {
            return false;
        };

        let mv_size = (motion_vectors.width(), motion_vectors.height());
        let pyramid = tile_pyramid(mv_size.0, mv_size.1);
        let flags = TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET;

        let mut levels = Vec::with_capacity(pyramid.len() + 1);
        for (width, height) in pyramid {
            let desc = TextureDescriptor::new_2d(width, height, MOTION_VECTORS_FORMAT, flags);
            match ctx.get_temporary("MotionBlur.TileMax", &desc) {
                Ok(texture) => levels.push(texture),
                Err(err) => {
                    log::warn!("MotionBlurPass: {err}");
                    for texture in levels {
                        ctx.release(texture);
                    }
                    return false;
                }
            }
        }
        let (tiles_width, tiles_height) = pyramid[3];
        let neighbor_desc = TextureDescriptor::new_2d(tiles_width, tiles_height, MOTION_VECTORS_FORMAT, flags);
        let neighbor_max = match ctx.get_temporary("MotionBlur.NeighborMax", &neighbor_desc) {
            Ok(texture) => texture,
            Err(err) => {
                log::warn!("MotionBlurPass: {err}");
                for texture in levels {
                    ctx.release(texture);
                }
                return false;
            }
        };

        ctx.gpu.push_event("MotionBlur");
        ctx.gpu.bind_cb(CB_SLOT, cb.handle);

        let mut source = motion_vectors;
        for (index, level) in levels.iter().enumerate() {
            let data = Self::constants(ctx, (level.width(), level.height()), mv_size);
            update_cb(ctx.gpu, cb, &data);
            ctx.gpu.set_render_target(None, &[level.view()]);
            ctx.gpu.set_viewport_and_scissors(Viewport::from_size(level.width(), level.height()));
            ctx.gpu.bind_sr(MOTION_VECTORS_SR_SLOT, Some(source.view().into()));
            let last = index == levels.len() - 1;
            ctx.gpu.set_state(if last { handles.tile_max_variable } else { handles.tile_max });
            ctx.gpu.draw_fullscreen_triangle(1);
            ctx.gpu.reset_render_target();
            source = *level;
        }

        let data = Self::constants(ctx, (tiles_width, tiles_height), mv_size);
        update_cb(ctx.gpu, cb, &data);
        ctx.gpu.set_render_target(None, &[neighbor_max.view()]);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(tiles_width, tiles_height));
        ctx.gpu.bind_sr(MOTION_VECTORS_SR_SLOT, Some(source.view().into()));
        ctx.gpu.set_state(handles.neighbor_max);
        ctx.gpu.draw_fullscreen_triangle(1);
        ctx.gpu.reset_render_target();

        let data = Self::constants(ctx, (output.width(), output.height()), mv_size);
        update_cb(ctx.gpu, cb, &data);
        ctx.gpu.set_render_target(None, &[output.view()]);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(output.width(), output.height()));
        ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(input.view().into()));
        ctx.gpu.bind_sr(MOTION_VECTORS_SR_SLOT, Some(motion_vectors.view().into()));
        ctx.gpu.bind_sr(NEIGHBOR_MAX_SR_SLOT, Some(neighbor_max.view().into()));
        ctx.gpu.bind_sr(DEPTH_SR_SLOT, Some(depth.view().into()));
        ctx.gpu.set_state(handles.reconstruction);
        ctx.gpu.draw_fullscreen_triangle(1);

        ctx.gpu.reset_sr();
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();

        for texture in levels {
            ctx.release(texture);
        }
        ctx.release(neighbor_max);
        true
    }
}

impl RendererPass for MotionBlurPass {
    fn name(&self) -> &'static str {
        "MotionBlurPass"
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        shaders.require(SHADER)?.check_cb(0, std::mem::size_of::<MotionBlurData>())?;
        if self.cb.is_none() {
            self.cb = Some(create_constant_buffer::<MotionBlurData>(device, "MotionBlur.CB")?);
        }
        if self.draw_calls.is_none() {
            self.draw_calls = Some(DrawCallsRenderer::new(device, "MotionVectors")?);
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
        if let Some(draw_calls) = self.draw_calls.take() {
            draw_calls.release(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_utils::TestFrame;
    use glam::Vec3;

    #[test]
    fn test_velocity_scale() {
        assert!((velocity_scale(1.0, 1.0 / 60.0, false) - 0.5).abs() < 1e-5);
        assert!((velocity_scale(1.0, 1.0 / 30.0, false) - 0.25).abs() < 1e-5);
        assert_eq!(velocity_scale(2.0, 1.0 / 30.0, true), 1.0);
    }

    #[test]
    fn test_tile_pyramid() {
        let pyramid = tile_pyramid(1920, 1080);
        assert_eq!(pyramid[0], (960, 540));
        assert_eq!(pyramid[2], (240, 135));
        assert_eq!(pyramid[3], (60, 34));
    }

    #[test]
    fn test_static_camera_clears_motion_vectors() {
        let mut frame = TestFrame::new(64, 64);
        let mut pass = MotionBlurPass::new();
        frame.setup(&mut pass);
        pass.render_motion_vectors(&mut frame.ctx());

        let target = frame.buffers.motion_vectors.get().copied().unwrap();
        let commands = frame.gpu.commands_in_event("MotionVectors");
        assert_eq!(
            commands,
            &[GpuCommand::Clear {
                view: target.view(),
                color: Color::BLACK
            }]
        );
    }

    #[test]
    fn test_moving_camera_renders_motion_vectors() {
        let mut frame = TestFrame::new(64, 64);
        let prev = (frame.view.view, frame.view.projection);
        frame.view.set_perspective(Vec3::new(10.0, 0.0, 0.0), Vec3::NEG_Z, Vec3::Y, 1.0, 10.0, 10000.0);
        frame.view.set_previous(Some(prev));

        let mut pass = MotionBlurPass::new();
        frame.setup(&mut pass);
        pass.render_motion_vectors(&mut frame.ctx());
        assert_eq!(frame.gpu.draw_count(), 1);
        assert!(!frame
            .gpu
            .commands()
            .iter()
            .any(|c| matches!(c, GpuCommand::Clear { .. })));
    }

    #[test]
    fn test_blur_releases_transients() {
        let mut frame = TestFrame::new(256, 128);
        frame.list.settings.anti_aliasing.mode = AntialiasingMode::None;
        let prev = (frame.view.view, frame.view.projection);
        frame.view.set_perspective(Vec3::new(10.0, 0.0, 0.0), Vec3::NEG_Z, Vec3::Y, 1.0, 10.0, 10000.0);
        frame.view.set_previous(Some(prev));
        let input = frame.hdr_target("Input");
        let output = frame.hdr_target("Output");

        let mut pass = MotionBlurPass::new();
        frame.setup(&mut pass);
        let mut ctx = frame.ctx();
        pass.render_motion_vectors(&mut ctx);
        assert!(pass.render(&mut ctx, &input, &output));
        drop(ctx);

        // Half resolution vectors
        let vectors = frame.buffers.motion_vectors.get().copied().unwrap();
        assert_eq!((vectors.width(), vectors.height()), (128, 64));
        // Four pyramid levels, neighbour max, reconstruction
        assert_eq!(frame.gpu.commands_in_event("MotionBlur").iter().filter(|c| c.is_draw()).count(), 6);
        // Only the persistent motion vectors stay out of the pool
        assert_eq!(frame.pool.stats().in_use, 1);
    }

    #[test]
    fn test_camera_cut_skips_blur() {
        let mut frame = TestFrame::new(64, 64);
        frame.view.is_camera_cut = true;
        let input = frame.hdr_target("Input");
        let output = frame.hdr_target("Output");
        let mut pass = MotionBlurPass::new();
        frame.setup(&mut pass);
        assert!(!pass.render(&mut frame.ctx(), &input, &output));
    }
}
