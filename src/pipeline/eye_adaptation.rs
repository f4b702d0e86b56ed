//! Eye adaptation
//!
//! Measures scene luminance into a 1x1 target kept across frames and
//! scales the lit color by the adapted exposure. The histogram path needs
//! compute shaders; without them the average luminance path is used.

use bytemuck::{Pod, Zeroable};
use glam::Vec4;

use crate::backend::*;
use crate::error::RenderResult;
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::ShaderLibrary;
use crate::scene::{EyeAdaptationMode, EyeAdaptationSettings, ViewFlags};

pub const SHADER: &str = "Shaders/EyeAdaptation";

pub const HISTOGRAM_BINS: u32 = 64;
pub const HISTOGRAM_GROUP_SIZE: u32 = 16;
/// Log2 luminance range covered by the histogram
pub const HISTOGRAM_LOG_MIN: f32 = -10.0;
pub const HISTOGRAM_LOG_MAX: f32 = 6.0;

pub const LUMINANCE_FORMAT: TextureFormat = TextureFormat::R16Float;

pub const CB_SLOT: u32 = 0;
pub const INPUT_SR_SLOT: u32 = 0;
pub const PREVIOUS_LUMINANCE_SR_SLOT: u32 = 1;
pub const HISTOGRAM_SR_SLOT: u32 = 2;
pub const HISTOGRAM_UA_SLOT: u32 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EyeAdaptationData {
    /// (min brightness, max brightness, exposure scale, drop history)
    pub brightness: Vec4,
    /// (speed up, speed down, delta time, unused)
    pub speed: Vec4,
    /// (low percent, high percent, log2 scale, log2 bias)
    pub histogram: Vec4,
    /// (width, height, 1 / width, 1 / height)
    pub input_size: Vec4,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(SHADER, &[std::mem::size_of::<EyeAdaptationData>()]);
}

/// Blend factor toward the measured luminance for this frame
pub fn adaptation_weight(delta_time: f32, current: f32, previous: f32, settings: &EyeAdaptationSettings) -> f32 {
    let speed = if current > previous {
        settings.speed_up
    } else {
        settings.speed_down
    };
    1.0 - (-delta_time.max(0.0) * speed.max(0.0)).exp()
}

/// Adapted luminance after one frame, clamped to the brightness range
pub fn adapt_luminance(
    delta_time: f32,
    current: f32,
    previous: Option<f32>,
    settings: &EyeAdaptationSettings,
) -> f32 {
    let current = current.clamp(settings.min_brightness, settings.max_brightness);
    match previous {
        Some(previous) => {
            let weight = adaptation_weight(delta_time, current, previous, settings);
            previous + (current - previous) * weight
        }
        None => current,
    }
}

/// Color scale for the manual mode
pub fn manual_exposure(pre_exposure: f32) -> f32 {
    (-pre_exposure).exp2()
}

/// Scale and bias mapping log2 luminance into 0..1 histogram space
pub fn histogram_scale_bias() -> (f32, f32) {
    let scale = 1.0 / (HISTOGRAM_LOG_MAX - HISTOGRAM_LOG_MIN);
    (scale, -HISTOGRAM_LOG_MIN * scale)
}

/// Average luminance of the bins between the low and high percentiles
pub fn histogram_average_luminance(bins: &[u32], low_percent: f32, high_percent: f32) -> f32 {
    let total: u64 = bins.iter().map(|&b| b as u64).sum();
    if total == 0 || bins.is_empty() {
        return 0.0;
    }
    let low = total as f32 * (low_percent / 100.0).clamp(0.0, 1.0);
    let high = total as f32 * (high_percent / 100.0).clamp(0.0, 1.0);
    let (scale, bias) = histogram_scale_bias();

    let mut below = 0.0_f32;
    let mut weighted = 0.0;
    let mut count = 0.0;
    for (index, &bin) in bins.iter().enumerate() {
        let bin = bin as f32;
        // Part of the bin inside the percentile window
        let start = below.max(low);
        let end = (below + bin).min(high);
        below += bin;
        if end <= start {
            continue;
        }
        let t = (index as f32 + 0.5) / bins.len() as f32;
        let log_luminance = (t - bias) / scale;
        weighted += log_luminance.exp2() * (end - start);
        count += end - start;
    }
    if count > 0.0 {
        weighted / count
    } else {
        0.0
    }
}

/// Mode actually used on a device
pub fn resolve_mode(requested: EyeAdaptationMode, compute_supported: bool) -> EyeAdaptationMode {
    match requested {
        EyeAdaptationMode::AutomaticHistogram if !compute_supported => EyeAdaptationMode::AutomaticAverageLuminance,
        mode => mode,
    }
}

struct EyeAdaptationStates {
    /// `[clear, generate]`, missing without compute
    histogram_kernels: Option<[ComputeShaderHandle; 2]>,
    histogram: PipelineStateHandle,
    luminance: PipelineStateHandle,
    downsample: PipelineStateHandle,
    blend: PipelineStateHandle,
    apply: PipelineStateHandle,
    manual: PipelineStateHandle,
}

/// Eye adaptation
#[derive(Default)]
pub struct EyeAdaptationPass {
    states: PipelineStates,
    handles: Option<EyeAdaptationStates>,
    cb: Option<GpuBuffer>,
    histogram: Option<GpuBuffer>,
    last_mode: Option<EyeAdaptationMode>,
    last_history_dropped: bool,
    fallback_logged: bool,
}

impl EyeAdaptationPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.handles.is_some()
    }

    /// Mode used by the last render
    pub fn last_mode(&self) -> Option<EyeAdaptationMode> {
        self.last_mode
    }

    /// Whether the last render started from a fresh luminance
    pub fn last_history_dropped(&self) -> bool {
        self.last_history_dropped
    }

    fn create_states(&mut self, device: &mut dyn GpuDevice) -> RenderResult<EyeAdaptationStates> {
        let histogram_kernels = if device.limits().compute_shaders {
            Some([
                self.states
                    .create_compute(device, &ComputeShaderDescriptor::new(SHADER, "CS_ClearHistogram"))?,
                self.states
                    .create_compute(device, &ComputeShaderDescriptor::new(SHADER, "CS_GenerateHistogram"))?,
            ])
        } else {
            None
        };
        let fullscreen = |ps: &str| PipelineStateDescriptor::fullscreen(SHADER, ps);
        Ok(EyeAdaptationStates {
            histogram_kernels,
            histogram: self.states.create(device, &fullscreen("PS_Histogram"))?,
            luminance: self.states.create(device, &fullscreen("PS_Luminance"))?,
            downsample: self.states.create(device, &fullscreen("PS_Downsample"))?,
            blend: self.states.create(device, &fullscreen("PS_BlendLuminance"))?,
            apply: self
                .states
                .create(device, &fullscreen("PS_Apply").with_blend(BlendMode::Multiply))?,
            manual: self
                .states
                .create(device, &fullscreen("PS_Manual").with_blend(BlendMode::Multiply))?,
        })
    }

    fn constants(ctx: &RenderContext, settings: &EyeAdaptationSettings, exposure: f32, drop_history: bool) -> EyeAdaptationData {
        let (width, height) = ctx.buffers.size();
        let (scale, bias) = histogram_scale_bias();
        EyeAdaptationData {
            brightness: Vec4::new(
                settings.min_brightness,
                settings.max_brightness,
                exposure,
                if drop_history { 1.0 } else { 0.0 },
            ),
            speed: Vec4::new(settings.speed_up, settings.speed_down, ctx.frame.unscaled_delta_time, 0.0),
            histogram: Vec4::new(
                settings.histogram_low_percent,
                settings.histogram_high_percent,
                scale,
                bias,
            ),
            input_size: Vec4::new(
                width as f32,
                height as f32,
                1.0 / width.max(1) as f32,
                1.0 / height.max(1) as f32,
            ),
        }
    }

    /// Adapt exposure of `color` in place. Returns whether anything was drawn.
    pub fn render(&mut self, ctx: &mut RenderContext, color: &GpuTexture) -> bool {
        let settings = ctx.list.settings.eye_adaptation.clone();
        let compute = ctx.device.limits().compute_shaders;
        let mode = resolve_mode(settings.mode, compute);
        self.last_mode = None;

        if !ctx.view.flags.contains(ViewFlags::EYE_ADAPTATION) || mode == EyeAdaptationMode::None {
            ctx.buffers.luminance_map.release(ctx.pool);
            return false;
        }
        let (Some(handles), Some(cb)) = (&self.handles, &self.cb) else {
            return false;
        };
        if mode != settings.mode && !self.fallback_logged {
            log::debug!("EyeAdaptationPass: no compute shaders, using average luminance");
            self.fallback_logged = true;
        }

        let exposure = manual_exposure(settings.pre_exposure);
        let frame = ctx.frame_index();
        ctx.gpu.push_event("EyeAdaptation");

        if mode == EyeAdaptationMode::Manual {
            ctx.buffers.luminance_map.release(ctx.pool);
            let data = Self::constants(ctx, &settings, exposure, true);
            update_cb(ctx.gpu, cb, &data);
            ctx.gpu.bind_cb(CB_SLOT, cb.handle);
            ctx.gpu.set_render_target(None, &[color.view()]);
            ctx.gpu.set_viewport_and_scissors(ctx.buffers.viewport());
            ctx.gpu.set_state(handles.manual);
            ctx.gpu.draw_fullscreen_triangle(1);
            ctx.gpu.reset_render_target();
            ctx.gpu.pop_event();
            self.last_mode = Some(mode);
            return true;
        }

        let previous = ctx.buffers.luminance_map.get().copied();
        let drop_history = ctx.view.is_camera_cut || ctx.buffers.last_eye_adaptation_time.is_none() || previous.is_none();
        let desc = TextureDescriptor::new_2d(
            1,
            1,
            LUMINANCE_FORMAT,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
        );
        let luminance = match ctx.get_temporary("EyeAdaptation.Luminance", &desc) {
            Ok(texture) => texture,
            Err(err) => {
                log::warn!("EyeAdaptationPass: {err}");
                ctx.gpu.pop_event();
                return false;
            }
        };

        let data = Self::constants(ctx, &settings, exposure, drop_history);
        update_cb(ctx.gpu, cb, &data);
        ctx.gpu.bind_cb(CB_SLOT, cb.handle);

        let measured = match (mode, handles.histogram_kernels, self.histogram) {
            (EyeAdaptationMode::AutomaticHistogram, Some([clear, generate]), Some(histogram)) => {
                let (width, height) = ctx.buffers.size();
                ctx.gpu.bind_ua(HISTOGRAM_UA_SLOT, Some(histogram.handle.into()));
                ctx.gpu.dispatch(clear, 1, 1, 1);
                ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(color.view().into()));
                ctx.gpu.dispatch(
                    generate,
                    group_count(width, HISTOGRAM_GROUP_SIZE),
                    group_count(height, HISTOGRAM_GROUP_SIZE),
                    1,
                );
                ctx.gpu.reset_ua();

                ctx.gpu.set_render_target(None, &[luminance.view()]);
                ctx.gpu.set_viewport_and_scissors(Viewport::from_size(1, 1));
                ctx.gpu.bind_sr(HISTOGRAM_SR_SLOT, Some(histogram.handle.into()));
                ctx.gpu.bind_sr(PREVIOUS_LUMINANCE_SR_SLOT, previous.map(|t| t.view().into()));
                ctx.gpu.set_state(handles.histogram);
                ctx.gpu.draw_fullscreen_triangle(1);
                true
            }
            _ => Self::average_luminance(ctx, handles, color, &luminance, previous),
        };

        if measured {
            ctx.gpu.reset_sr();
            ctx.gpu.set_render_target(None, &[color.view()]);
            ctx.gpu.set_viewport_and_scissors(ctx.buffers.viewport());
            ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(luminance.view().into()));
            ctx.gpu.set_state(handles.apply);
            ctx.gpu.draw_fullscreen_triangle(1);

            ctx.buffers.luminance_map.set(ctx.pool, luminance, frame);
            ctx.buffers.last_eye_adaptation_time = Some(ctx.frame.time);
            self.last_mode = Some(mode);
            self.last_history_dropped = drop_history;
        } else {
            ctx.release(luminance);
        }

        ctx.gpu.reset_sr();
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();
        measured
    }

    /// Halve the color down to 1x1 and blend with the previous luminance
    fn average_luminance(
        ctx: &mut RenderContext,
        handles: &EyeAdaptationStates,
        color: &GpuTexture,
        luminance: &GpuTexture,
        previous: Option<GpuTexture>,
    ) -> bool {
        let (width, height) = ctx.buffers.size();
        let (width, height) = ((width / 2).max(1), (height / 2).max(1));
        let mips = TextureDescriptor::full_mip_chain(width, height);
        let desc = TextureDescriptor::new_2d(
            width,
            height,
            LUMINANCE_FORMAT,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET | TextureFlags::PER_MIP_VIEWS,
        )
        .with_mips(mips);
        let chain = match ctx.get_temporary("EyeAdaptation.Downsample", &desc) {
            Ok(texture) => texture,
            Err(err) => {
                log::warn!("EyeAdaptationPass: {err}");
                return false;
            }
        };

        ctx.gpu.set_render_target(None, &[chain.view_mip(0)]);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(width, height));
        ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(color.view().into()));
        ctx.gpu.set_state(handles.luminance);
        ctx.gpu.draw_fullscreen_triangle(1);

        ctx.gpu.set_state(handles.downsample);
        for mip in 1..mips {
            let (mip_width, mip_height) = desc.mip_size(mip);
            ctx.gpu.set_render_target(None, &[chain.view_mip(mip)]);
            ctx.gpu.set_viewport_and_scissors(Viewport::from_size(mip_width, mip_height));
            ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(chain.view_mip(mip - 1).into()));
            ctx.gpu.draw_fullscreen_triangle(1);
        }

        ctx.gpu.set_render_target(None, &[luminance.view()]);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(1, 1));
        ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(chain.view_mip(mips - 1).into()));
        ctx.gpu.bind_sr(PREVIOUS_LUMINANCE_SR_SLOT, previous.map(|t| t.view().into()));
        ctx.gpu.set_state(handles.blend);
        ctx.gpu.draw_fullscreen_triangle(1);

        ctx.release(chain);
        true
    }
}

impl RendererPass for EyeAdaptationPass {
    fn name(&self) -> &'static str {
        "EyeAdaptationPass"
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        shaders
            .require(SHADER)?
            .check_cb(CB_SLOT, std::mem::size_of::<EyeAdaptationData>())?;
        if self.cb.is_none() {
            self.cb = Some(create_constant_buffer::<EyeAdaptationData>(device, "EyeAdaptation.CB")?);
        }
        if self.histogram.is_none() && device.limits().compute_shaders {
            let desc = BufferDescriptor::structured(
                HISTOGRAM_BINS,
                std::mem::size_of::<u32>() as u32,
                BufferUsage::UNORDERED_ACCESS,
            );
            self.histogram = Some(
                device
                    .create_buffer("EyeAdaptation.Histogram", &desc)
                    .map_err(|err| crate::error::RenderError::resource("EyeAdaptation.Histogram", err))?,
            );
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
        for buffer in [self.cb.take(), self.histogram.take()].into_iter().flatten() {
            device.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_utils::TestFrame;

    fn frame_with_mode(device: RecordingDevice, mode: EyeAdaptationMode) -> TestFrame {
        let mut frame = TestFrame::with_device(device, 64, 32);
        frame.list.settings.eye_adaptation.mode = mode;
        frame
    }

    #[test]
    fn test_adaptation_speed() {
        let settings = EyeAdaptationSettings::default();
        let brighter = adaptation_weight(0.1, 2.0, 1.0, &settings);
        let darker = adaptation_weight(0.1, 0.5, 1.0, &settings);
        assert!((brighter - (1.0 - (-0.3f32).exp())).abs() < 1e-6);
        assert!((darker - (1.0 - (-0.1f32).exp())).abs() < 1e-6);
        assert_eq!(adaptation_weight(0.0, 2.0, 1.0, &settings), 0.0);
    }

    #[test]
    fn test_adapt_luminance_clamps_and_resets() {
        let settings = EyeAdaptationSettings::default();
        assert_eq!(adapt_luminance(0.1, 100.0, None, &settings), settings.max_brightness);
        assert_eq!(adapt_luminance(0.1, 0.0, None, &settings), settings.min_brightness);
        let adapted = adapt_luminance(0.1, 2.0, Some(1.0), &settings);
        assert!(adapted > 1.0 && adapted < 2.0);
    }

    #[test]
    fn test_manual_exposure() {
        assert_eq!(manual_exposure(0.0), 1.0);
        assert_eq!(manual_exposure(1.0), 0.5);
        assert_eq!(manual_exposure(-2.0), 4.0);
    }

    #[test]
    fn test_histogram_percentiles() {
        let (scale, bias) = histogram_scale_bias();
        // Bin holding log2 luminance 0
        let bin = (bias * HISTOGRAM_BINS as f32) as usize;
        assert!(scale > 0.0);
        let mut bins = vec![0u32; HISTOGRAM_BINS as usize];
        bins[bin] = 100;
        let luminance = histogram_average_luminance(&bins, 70.0, 98.0);
        assert!(luminance > 0.8 && luminance < 1.25, "{luminance}");

        // Outliers below the low percentile are ignored
        bins[0] = 50;
        let clipped = histogram_average_luminance(&bins, 50.0, 98.0);
        assert!(clipped > 0.8 && clipped < 1.25, "{clipped}");
        assert_eq!(histogram_average_luminance(&[0; 4], 70.0, 98.0), 0.0);
    }

    #[test]
    fn test_mode_fallback() {
        use EyeAdaptationMode::*;
        assert_eq!(resolve_mode(AutomaticHistogram, true), AutomaticHistogram);
        assert_eq!(resolve_mode(AutomaticHistogram, false), AutomaticAverageLuminance);
        assert_eq!(resolve_mode(Manual, false), Manual);
    }

    #[test]
    fn test_histogram_without_compute_uses_average_luminance() {
        let mut frame = frame_with_mode(RecordingDevice::without_compute(), EyeAdaptationMode::AutomaticHistogram);
        let color = frame.hdr_target("Color");
        let mut pass = EyeAdaptationPass::new();
        frame.setup(&mut pass);

        assert!(pass.render(&mut frame.ctx(), &color));
        assert_eq!(pass.last_mode(), Some(EyeAdaptationMode::AutomaticAverageLuminance));
        assert_eq!(frame.gpu.dispatch_count(), 0);

        let luminance = frame.buffers.luminance_map.get().copied().unwrap();
        assert_eq!((luminance.width(), luminance.height()), (1, 1));
        assert_eq!(luminance.format(), TextureFormat::R16Float);
    }

    #[test]
    fn test_histogram_dispatches() {
        let mut frame = frame_with_mode(RecordingDevice::new(), EyeAdaptationMode::AutomaticHistogram);
        let color = frame.hdr_target("Color");
        let mut pass = EyeAdaptationPass::new();
        frame.setup(&mut pass);

        assert!(pass.render(&mut frame.ctx(), &color));
        assert_eq!(pass.last_mode(), Some(EyeAdaptationMode::AutomaticHistogram));
        assert_eq!(frame.gpu.dispatch_count(), 2);
        // Histogram resolve plus apply
        assert_eq!(frame.gpu.draw_count(), 2);
    }

    #[test]
    fn test_history_kept_until_camera_cut() {
        let mut frame = frame_with_mode(RecordingDevice::new(), EyeAdaptationMode::AutomaticAverageLuminance);
        let color = frame.hdr_target("Color");
        let mut pass = EyeAdaptationPass::new();
        frame.setup(&mut pass);

        pass.render(&mut frame.ctx(), &color);
        assert!(pass.last_history_dropped());

        frame.frame.frame_index += 1;
        pass.render(&mut frame.ctx(), &color);
        assert!(!pass.last_history_dropped());
        assert_eq!(frame.pool.stats().in_use, 1);

        frame.view.is_camera_cut = true;
        pass.render(&mut frame.ctx(), &color);
        assert!(pass.last_history_dropped());

        frame.view.is_camera_cut = false;
        frame.buffers.last_eye_adaptation_time = None;
        pass.render(&mut frame.ctx(), &color);
        assert!(pass.last_history_dropped());
    }

    #[test]
    fn test_history_kept_when_frame_time_stays_zero() {
        let mut frame = frame_with_mode(RecordingDevice::new(), EyeAdaptationMode::AutomaticAverageLuminance);
        let color = frame.hdr_target("Color");
        let mut pass = EyeAdaptationPass::new();
        frame.setup(&mut pass);
        frame.frame.time = 0.0;

        pass.render(&mut frame.ctx(), &color);
        assert!(pass.last_history_dropped());
        assert_eq!(frame.buffers.last_eye_adaptation_time, Some(0.0));

        for _ in 0..3 {
            frame.frame.frame_index += 1;
            pass.render(&mut frame.ctx(), &color);
            assert!(!pass.last_history_dropped());
        }
    }

    #[test]
    fn test_manual_mode_multiplies_once() {
        let mut frame = frame_with_mode(RecordingDevice::new(), EyeAdaptationMode::Manual);
        let color = frame.hdr_target("Color");
        let mut pass = EyeAdaptationPass::new();
        frame.setup(&mut pass);

        assert!(pass.render(&mut frame.ctx(), &color));
        assert_eq!(frame.gpu.draw_count(), 1);
        assert!(!frame.buffers.luminance_map.is_some());
    }

    #[test]
    fn test_disabled_releases_luminance() {
        let mut frame = frame_with_mode(RecordingDevice::new(), EyeAdaptationMode::AutomaticAverageLuminance);
        let color = frame.hdr_target("Color");
        let mut pass = EyeAdaptationPass::new();
        frame.setup(&mut pass);
        pass.render(&mut frame.ctx(), &color);

        frame.view.flags.remove(ViewFlags::EYE_ADAPTATION);
        assert!(!pass.render(&mut frame.ctx(), &color));
        assert_eq!(frame.pool.stats().in_use, 0);
    }
}
