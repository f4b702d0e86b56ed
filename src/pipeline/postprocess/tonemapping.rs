//! Tone mapping post-processing

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use crate::backend::*;
use crate::error::RenderResult;
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::ShaderLibrary;
use crate::scene::{ToneMappingOperator, ToneMappingSettings, ViewFlags};

pub const SHADER: &str = "Shaders/ToneMapping";

pub const CB_SLOT: u32 = 0;
pub const INPUT_SR_SLOT: u32 = 0;
pub const LUMINANCE_SR_SLOT: u32 = 1;

pub const DEFAULT_GAMMA: f32 = 2.2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ToneMappingData {
    /// (exposure scale, white point, gamma, operator)
    pub params: Vec4,
    /// (has luminance, unused, unused, unused)
    pub flags: Vec4,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(SHADER, &[std::mem::size_of::<ToneMappingData>()]);
}

fn operator_index(operator: ToneMappingOperator) -> usize {
    match operator {
        ToneMappingOperator::Reinhard => 0,
        ToneMappingOperator::Aces => 1,
        ToneMappingOperator::None => 2,
    }
}

/// ACES filmic fit
pub fn aces_tonemap(color: Vec3) -> Vec3 {
    let a = 2.51;
    let b = 0.03;
    let c = 2.43;
    let d = 0.59;
    let e = 0.14;
    ((color * (a * color + b)) / (color * (c * color + d) + e)).clamp(Vec3::ZERO, Vec3::ONE)
}

/// Extended Reinhard, `white_point` maps to 1
pub fn reinhard_tonemap(color: Vec3, white_point: f32) -> Vec3 {
    let white_sq = (white_point * white_point).max(f32::EPSILON);
    color * (Vec3::ONE + color / white_sq) / (Vec3::ONE + color)
}

/// Apply exposure and an operator to a linear HDR color
pub fn tonemap(color: Vec3, settings: &ToneMappingSettings) -> Vec3 {
    let color = color * settings.exposure.exp2();
    match settings.operator {
        ToneMappingOperator::Aces => aces_tonemap(color),
        ToneMappingOperator::Reinhard => reinhard_tonemap(color, settings.white_point),
        ToneMappingOperator::None => color.clamp(Vec3::ZERO, Vec3::ONE),
    }
}

/// Final HDR to LDR conversion
#[derive(Default)]
pub struct ToneMappingPass {
    states: PipelineStates,
    /// Indexed by operator
    handles: Option<[PipelineStateHandle; 3]>,
    cb: Option<GpuBuffer>,
}

impl ToneMappingPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.handles.is_some()
    }

    fn create_states(&mut self, device: &mut dyn GpuDevice) -> RenderResult<[PipelineStateHandle; 3]> {
        let desc = PipelineStateDescriptor::fullscreen(SHADER, "PS_ToneMapping");
        Ok([
            self.states.create(device, &desc.clone().with_permutation(0))?,
            self.states.create(device, &desc.clone().with_permutation(1))?,
            self.states.create(device, &desc.with_permutation(2))?,
        ])
    }

    /// Tone map `input` into `output`, scaled by the adapted luminance when
    /// eye adaptation ran this frame
    pub fn render(&mut self, ctx: &mut RenderContext, input: &GpuTexture, output: &GpuTexture) -> bool {
        let (Some(handles), Some(cb)) = (&self.handles, &self.cb) else {
            return false;
        };
        let mut settings = ctx.list.settings.tone_mapping.clone();
        if !ctx.view.flags.contains(ViewFlags::TONE_MAPPING) {
            settings.operator = ToneMappingOperator::None;
        }
        let luminance = if ctx.view.flags.contains(ViewFlags::EYE_ADAPTATION) {
            ctx.buffers.luminance_map.get().copied()
        } else {
            None
        };
        let gamma = if output.format() == TextureFormat::Rgba8UnormSrgb {
            1.0
        } else {
            DEFAULT_GAMMA
        };
        let operator = operator_index(settings.operator);
        let data = ToneMappingData {
            params: Vec4::new(settings.exposure.exp2(), settings.white_point, gamma, operator as f32),
            flags: Vec4::new(if luminance.is_some() { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0),
        };

        ctx.gpu.push_event("ToneMapping");
        update_cb(ctx.gpu, cb, &data);
        ctx.gpu.bind_cb(CB_SLOT, cb.handle);
        ctx.gpu.set_render_target(None, &[output.view()]);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(output.width(), output.height()));
        ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(input.view().into()));
        ctx.gpu.bind_sr(LUMINANCE_SR_SLOT, luminance.map(|t| t.view().into()));
        ctx.gpu.set_state(handles[operator]);
        ctx.gpu.draw_fullscreen_triangle(1);
        ctx.gpu.reset_sr();
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();
        true
    }
}

impl RendererPass for ToneMappingPass {
    fn name(&self) -> &'static str {
        "ToneMappingPass"
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        shaders
            .require(SHADER)?
            .check_cb(CB_SLOT, std::mem::size_of::<ToneMappingData>())?;
        if self.cb.is_none() {
            self.cb = Some(create_constant_buffer::<ToneMappingData>(device, "ToneMapping.CB")?);
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

    #[test]
    fn test_operators() {
        let settings = ToneMappingSettings::default();
        assert_eq!(tonemap(Vec3::ZERO, &settings), Vec3::ZERO);
        let bright = tonemap(Vec3::splat(100.0), &settings);
        assert!(bright.x <= 1.0 && bright.x > 0.99);

        // Reinhard maps the white point to one
        let white = reinhard_tonemap(Vec3::splat(4.0), 4.0);
        assert!((white - Vec3::ONE).length() < 1e-5);

        let none = ToneMappingSettings {
            operator: ToneMappingOperator::None,
            exposure: 1.0,
            ..Default::default()
        };
        assert_eq!(tonemap(Vec3::splat(0.25), &none), Vec3::splat(0.5));
    }

    #[test]
    fn test_binds_luminance_when_present() {
        let mut frame = TestFrame::new(32, 32);
        let input = frame.hdr_target("Input");
        let output = frame.hdr_target("Output");
        let mut pass = ToneMappingPass::new();
        frame.setup(&mut pass);

        assert!(pass.render(&mut frame.ctx(), &input, &output));
        let commands = frame.gpu.commands_in_event("ToneMapping");
        assert!(commands.contains(&GpuCommand::BindSR {
            slot: LUMINANCE_SR_SLOT,
            view: None
        }));

        let luminance = frame
            .pool
            .get(
                &mut frame.device,
                "Luminance",
                &TextureDescriptor::new_2d(1, 1, TextureFormat::R16Float, TextureFlags::SHADER_RESOURCE),
            )
            .unwrap();
        frame.buffers.luminance_map.set(&frame.pool, luminance, 1);
        frame.gpu.clear();
        assert!(pass.render(&mut frame.ctx(), &input, &output));
        assert!(frame.gpu.commands_in_event("ToneMapping").contains(&GpuCommand::BindSR {
            slot: LUMINANCE_SR_SLOT,
            view: Some(luminance.view().into())
        }));
    }
}
