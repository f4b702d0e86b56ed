//! Temporal anti-aliasing
//!
//! Resolves the jittered frame against a reprojected history. The history
//! is dropped on camera cuts and whenever it is missing or has a different
//! size, in which case the current frame seeds it.

use bytemuck::{Pod, Zeroable};
use glam::Vec4;

use crate::backend::*;
use crate::error::RenderResult;
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::ShaderLibrary;
use crate::scene::{AntiAliasingSettings, AntialiasingMode, ViewFlags};

pub const SHADER: &str = "Shaders/TAA";

pub const CB_SLOT: u32 = 0;
pub const INPUT_SR_SLOT: u32 = 0;
pub const HISTORY_SR_SLOT: u32 = 1;
pub const MOTION_VECTORS_SR_SLOT: u32 = 2;
pub const DEPTH_SR_SLOT: u32 = 3;

const HISTORY_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct TaaData {
    /// (width, height, 1 / width, 1 / height)
    pub screen_size: Vec4,
    /// Current jitter in xy, previous jitter in zw
    pub jitter: Vec4,
    /// (sharpness, stationary blending, motion blending, unused)
    pub params: Vec4,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(SHADER, &[std::mem::size_of::<TaaData>()]);
}

/// Stationary and motion history weights for a blend strength
pub fn history_blending(settings: &AntiAliasingSettings, blend_strength: f32) -> (f32, f32) {
    (
        settings.taa_stationary_blending.clamp(0.0, 0.99) * blend_strength,
        settings.taa_motion_blending.clamp(0.0, 0.99) * blend_strength,
    )
}

/// Temporal anti-aliasing
#[derive(Default)]
pub struct TemporalAntiAliasingPass {
    states: PipelineStates,
    handle: Option<PipelineStateHandle>,
    cb: Option<GpuBuffer>,
    last_blend_strength: Option<f32>,
}

impl TemporalAntiAliasingPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.handle.is_some()
    }

    /// History blend strength of the last resolve
    pub fn last_blend_strength(&self) -> Option<f32> {
        self.last_blend_strength
    }

    pub fn is_enabled(ctx: &RenderContext) -> bool {
        ctx.view.flags.contains(ViewFlags::ANTI_ALIASING)
            && ctx.list.settings.anti_aliasing.mode == AntialiasingMode::TemporalAntialiasing
    }

    /// Resolve `input` into `output` and keep a new history.
    /// Returns whether `output` was written.
    pub fn render(&mut self, ctx: &mut RenderContext, input: &GpuTexture, output: &GpuTexture) -> bool {
        self.last_blend_strength = None;
        if !Self::is_enabled(ctx) {
            ctx.buffers.temporal_aa.release(ctx.pool);
            return false;
        }
        let (Some(handle), Some(cb)) = (self.handle, &self.cb) else {
            return false;
        };

        let (width, height) = ctx.buffers.size();
        let history = ctx
            .buffers
            .temporal_aa
            .get()
            .copied()
            .filter(|h| h.width() == width && h.height() == height);
        let reset = history.is_none() || ctx.view.is_camera_cut;
        let blend_strength = if reset { 0.0 } else { 1.0 };

        let desc = TextureDescriptor::new_2d(
            width,
            height,
            HISTORY_FORMAT,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
        );
        let new_history = match ctx.get_temporary("TemporalAA", &desc) {
            Ok(texture) => texture,
            Err(err) => {
                log::warn!("TemporalAntiAliasingPass: {err}");
                return false;
            }
        };

        let settings = &ctx.list.settings.anti_aliasing;
        let (stationary, motion) = history_blending(settings, blend_strength);
        let jitter = ctx.view.temporal_aa_jitter;
        let data = TaaData {
            screen_size: Vec4::new(width as f32, height as f32, 1.0 / width.max(1) as f32, 1.0 / height.max(1) as f32),
            jitter,
            params: Vec4::new(settings.taa_sharpness, stationary, motion, 0.0),
        };

        ctx.gpu.push_event("TAA");
        if reset {
            // The current frame seeds the history
            ctx.gpu.copy_resource(&new_history, input);
        }
        update_cb(ctx.gpu, cb, &data);
        ctx.gpu.bind_cb(CB_SLOT, cb.handle);
        ctx.gpu.set_render_target(None, &[output.view(), new_history.view()]);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(width, height));
        ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(input.view().into()));
        let history_view = match history {
            Some(history) if !reset => history.view(),
            _ => new_history.view(),
        };
        ctx.gpu.bind_sr(HISTORY_SR_SLOT, Some(history_view.into()));
        let motion_vectors = ctx.buffers.motion_vectors.get().map(|t| t.view().into());
        ctx.gpu.bind_sr(MOTION_VECTORS_SR_SLOT, motion_vectors);
        let depth = ctx.buffers.depth_buffer().map(|t| t.view().into());
        ctx.gpu.bind_sr(DEPTH_SR_SLOT, depth);
        ctx.gpu.set_state(handle);
        ctx.gpu.draw_fullscreen_triangle(1);
        ctx.gpu.reset_sr();
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();

        let frame = ctx.frame_index();
        ctx.buffers.temporal_aa.set(ctx.pool, new_history, frame);
        ctx.view.is_taa_resolved = true;
        self.last_blend_strength = Some(blend_strength);
        true
    }
}

impl RendererPass for TemporalAntiAliasingPass {
    fn name(&self) -> &'static str {
        "TemporalAntiAliasingPass"
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        shaders.require(SHADER)?.check_cb(CB_SLOT, std::mem::size_of::<TaaData>())?;
        if self.cb.is_none() {
            self.cb = Some(create_constant_buffer::<TaaData>(device, "TAA.CB")?);
        }
        self.handle = Some(
            self.states
                .create(device, &PipelineStateDescriptor::fullscreen(SHADER, "PS_TAA"))?,
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
    }
}
