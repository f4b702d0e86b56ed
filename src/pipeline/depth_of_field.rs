//! Depth of field
//!
//! Circle of confusion from scene depth, a separable blur at half
//! resolution and an optional bokeh pass that splats bright out of focus
//! pixels as sprites. The sprites are appended by a compute kernel and
//! drawn with an indirect draw whose instance count comes from the append
//! counter.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::ShaderLibrary;
use crate::scene::{BokehShape, DepthOfFieldSettings, ViewFlags};

pub const SHADER: &str = "Shaders/DepthOfField";

pub const CB_SLOT: u32 = 0;
pub const INPUT_SR_SLOT: u32 = 0;
pub const DEPTH_SR_SLOT: u32 = 1;
pub const COC_SR_SLOT: u32 = 2;
pub const BLUR_SR_SLOT: u32 = 3;
pub const BOKEH_SR_SLOT: u32 = 4;
pub const BOKEH_POINTS_SLOT: u32 = 0;

pub const MAX_BOKEH_POINTS: u32 = 16 * 1024;
pub const BOKEH_GROUP_SIZE: u32 = 8;
/// Indices of one bokeh sprite quad
pub const BOKEH_QUAD_INDICES: [u32; 6] = [0, 1, 2, 0, 2, 3];
/// Byte offset of the instance count inside the indirect arguments
const INDIRECT_INSTANCE_COUNT_OFFSET: u32 = 4;

const COC_FORMAT: TextureFormat = TextureFormat::R16Float;
const COLOR_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DepthOfFieldData {
    /// (focal distance, focal region, near transition, far transition)
    pub focus: Vec4,
    /// (blur strength, depth limit, near plane, far plane)
    pub blur: Vec4,
    /// (size, brightness, brightness threshold, blur threshold)
    pub bokeh: Vec4,
    /// (falloff, depth cutoff, shape, max points)
    pub bokeh_shape: Vec4,
    /// (width, height, 1 / width, 1 / height) of the full resolution input
    pub screen: Vec4,
}

/// One appended bokeh sprite
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BokehPoint {
    pub position: Vec3,
    pub blur: f32,
    pub color: Vec3,
    pub depth: f32,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(SHADER, &[std::mem::size_of::<DepthOfFieldData>()]);
}

/// Signed circle of confusion for a view depth: negative in front of the
/// focal region, positive behind it, zero inside.
pub fn circle_of_confusion(depth: f32, settings: &DepthOfFieldSettings) -> f32 {
    if settings.depth_limit > 0.0 && depth > settings.depth_limit {
        return 0.0;
    }
    let focal_start = settings.focal_distance;
    let focal_end = settings.focal_distance + settings.focal_region;
    let coc = if depth < focal_start {
        -((focal_start - depth) / settings.near_transition_range.max(f32::EPSILON)).min(1.0)
    } else if depth > focal_end {
        ((depth - focal_end) / settings.far_transition_range.max(f32::EPSILON)).min(1.0)
    } else {
        0.0
    };
    coc * settings.blur_strength.clamp(0.0, 1.0)
}

fn shape_index(shape: BokehShape) -> f32 {
    match shape {
        BokehShape::Hexagon => 0.0,
        BokehShape::Octagon => 1.0,
        BokehShape::Circle => 2.0,
        BokehShape::Cross => 3.0,
        BokehShape::Custom => 4.0,
    }
}

pub fn dof_data(settings: &DepthOfFieldSettings, near: f32, far: f32, width: u32, height: u32) -> DepthOfFieldData {
    DepthOfFieldData {
        focus: Vec4::new(
            settings.focal_distance,
            settings.focal_region,
            settings.near_transition_range,
            settings.far_transition_range,
        ),
        blur: Vec4::new(settings.blur_strength, settings.depth_limit, near, far),
        bokeh: Vec4::new(
            settings.bokeh_size,
            settings.bokeh_brightness,
            settings.bokeh_brightness_threshold,
            settings.bokeh_blur_threshold,
        ),
        bokeh_shape: Vec4::new(
            settings.bokeh_falloff,
            settings.bokeh_depth_cutoff,
            shape_index(settings.bokeh_shape),
            MAX_BOKEH_POINTS as f32,
        ),
        screen: Vec4::new(
            width as f32,
            height as f32,
            1.0 / width.max(1) as f32,
            1.0 / height.max(1) as f32,
        ),
    }
}

struct DepthOfFieldStates {
    coc: PipelineStateHandle,
    downscale: PipelineStateHandle,
    blur_horizontal: PipelineStateHandle,
    blur_vertical: PipelineStateHandle,
    /// `[without bokeh, with bokeh]`
    composite: [PipelineStateHandle; 2],
    bokeh_draw: PipelineStateHandle,
    bokeh_generate: Option<ComputeShaderHandle>,
}

/// GPU buffers of the bokeh sprites
#[derive(Debug, Clone, Copy)]
struct BokehBuffers {
    points: GpuBuffer,
    indirect_args: GpuBuffer,
    quad_indices: GpuBuffer,
}

impl BokehBuffers {
    fn create(device: &mut dyn GpuDevice) -> RenderResult<Self> {
        let points = device
            .create_buffer(
                "DepthOfField.BokehPoints",
                &BufferDescriptor::structured(
                    MAX_BOKEH_POINTS,
                    std::mem::size_of::<BokehPoint>() as u32,
                    BufferUsage::UNORDERED_ACCESS | BufferUsage::APPEND,
                ),
            )
            .map_err(|err| RenderError::resource("DepthOfField.BokehPoints", err))?;
        // index count, instance count, start index, base vertex, start instance
        let args: [u32; 5] = [BOKEH_QUAD_INDICES.len() as u32, 0, 0, 0, 0];
        let indirect_args = match device.create_buffer_init(
            "DepthOfField.BokehArgs",
            &BufferDescriptor {
                size: std::mem::size_of_val(&args) as u64,
                stride: 0,
                usage: BufferUsage::ARGUMENT,
            },
            bytemuck::cast_slice(&args),
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.destroy_buffer(points);
                return Err(RenderError::resource("DepthOfField.BokehArgs", err));
            }
        };
        let quad_indices = match device.create_buffer_init(
            "DepthOfField.BokehIndices",
            &BufferDescriptor {
                size: std::mem::size_of_val(&BOKEH_QUAD_INDICES) as u64,
                stride: std::mem::size_of::<u32>() as u32,
                usage: BufferUsage::INDEX,
            },
            bytemuck::cast_slice(&BOKEH_QUAD_INDICES),
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.destroy_buffer(points);
                device.destroy_buffer(indirect_args);
                return Err(RenderError::resource("DepthOfField.BokehIndices", err));
            }
        };
        Ok(Self {
            points,
            indirect_args,
            quad_indices,
        })
    }

    fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_buffer(self.points);
        device.destroy_buffer(self.indirect_args);
        device.destroy_buffer(self.quad_indices);
    }
}

/// Depth of field
#[derive(Default)]
pub struct DepthOfFieldPass {
    states: PipelineStates,
    handles: Option<DepthOfFieldStates>,
    cb: Option<GpuBuffer>,
    bokeh: Option<BokehBuffers>,
}

impl DepthOfFieldPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.handles.is_some()
    }

    fn create_states(&mut self, device: &mut dyn GpuDevice) -> RenderResult<DepthOfFieldStates> {
        let bokeh_generate = if device.limits().compute_shaders {
            Some(
                self.states
                    .create_compute(device, &ComputeShaderDescriptor::new(SHADER, "CS_BokehGenerate"))?,
            )
        } else {
            None
        };
        let fullscreen = |ps: &str| PipelineStateDescriptor::fullscreen(SHADER, ps);
        let composite = fullscreen("PS_Composite");
        Ok(DepthOfFieldStates {
            coc: self.states.create(device, &fullscreen("PS_CoC"))?,
            downscale: self.states.create(device, &fullscreen("PS_Downscale"))?,
            blur_horizontal: self.states.create(device, &fullscreen("PS_BlurH"))?,
            blur_vertical: self.states.create(device, &fullscreen("PS_BlurV"))?,
            composite: [
                self.states.create(device, &composite.clone())?,
                self.states.create(device, &composite.with_permutation(1))?,
            ],
            bokeh_draw: self.states.create(
                device,
                &PipelineStateDescriptor::geometry(SHADER, "VS_Bokeh", Some("PS_Bokeh"))
                    .with_depth(false, false, CompareFunction::Always)
                    .with_cull(CullMode::None)
                    .with_blend(BlendMode::Additive),
            )?,
            bokeh_generate,
        })
    }

    /// Blur `input` into `output` by scene depth. Returns whether `output`
    /// was written.
    pub fn render(&mut self, ctx: &mut RenderContext, input: &GpuTexture, output: &GpuTexture) -> bool {
        let settings = ctx.list.settings.depth_of_field.clone();
        if !ctx.view.flags.contains(ViewFlags::DEPTH_OF_FIELD) || !settings.enabled {
            return false;
        }
        let (Some(handles), Some(cb)) = (&self.handles, &self.cb) else {
            return false;
        };
        let Some(depth) = ctx.buffers.depth_buffer().copied() else {
            return false;
        };

        let (width, height) = ctx.buffers.size();
        let (half_width, half_height) = ((width / 2).max(1), (height / 2).max(1));
        let full = |format| {
            TextureDescriptor::new_2d(
                width,
                height,
                format,
                TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
            )
        };
        let half = TextureDescriptor::new_2d(
            half_width,
            half_height,
            COLOR_FORMAT,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
        );
        let requests = [
            ("DOF.CoC", full(COC_FORMAT)),
            ("DOF.Half", half),
            ("DOF.BlurH", half),
            ("DOF.BlurV", half),
        ];
        let mut targets = Vec::with_capacity(requests.len());
        for (name, desc) in &requests {
            match ctx.get_temporary(name, desc) {
                Ok(texture) => targets.push(texture),
                Err(err) => {
                    log::warn!("DepthOfFieldPass: {err}");
                    for texture in targets {
                        ctx.release(texture);
                    }
                    return false;
                }
            }
        }
        let [coc, downscaled, blur_h, blur_v] = [targets[0], targets[1], targets[2], targets[3]];

        let data = dof_data(&settings, ctx.view.near, ctx.view.far, width, height);
        ctx.gpu.push_event("DepthOfField");
        update_cb(ctx.gpu, cb, &data);
        ctx.gpu.bind_cb(CB_SLOT, cb.handle);

        // Circle of confusion
        ctx.gpu.set_render_target(None, &[coc.view()]);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(width, height));
        ctx.gpu.bind_sr(DEPTH_SR_SLOT, Some(depth.view().into()));
        ctx.gpu.set_state(handles.coc);
        ctx.gpu.draw_fullscreen_triangle(1);

        // Half resolution color weighted by CoC
        ctx.gpu.set_render_target(None, &[downscaled.view()]);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(half_width, half_height));
        ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(input.view().into()));
        ctx.gpu.bind_sr(COC_SR_SLOT, Some(coc.view().into()));
        ctx.gpu.set_state(handles.downscale);
        ctx.gpu.draw_fullscreen_triangle(1);

        ctx.gpu.set_render_target(None, &[blur_h.view()]);
        ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(downscaled.view().into()));
        ctx.gpu.set_state(handles.blur_horizontal);
        ctx.gpu.draw_fullscreen_triangle(1);

        ctx.gpu.set_render_target(None, &[blur_v.view()]);
        ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(blur_h.view().into()));
        ctx.gpu.set_state(handles.blur_vertical);
        ctx.gpu.draw_fullscreen_triangle(1);

        let bokeh_target = match (settings.bokeh_enabled, handles.bokeh_generate, self.bokeh) {
            (true, Some(generate), Some(bokeh)) => {
                Self::render_bokeh(ctx, handles, generate, bokeh, &downscaled, &coc, half)
            }
            _ => None,
        };

        ctx.gpu.reset_sr();
        ctx.gpu.set_render_target(None, &[output.view()]);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(width, height));
        ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(input.view().into()));
        ctx.gpu.bind_sr(COC_SR_SLOT, Some(coc.view().into()));
        ctx.gpu.bind_sr(BLUR_SR_SLOT, Some(blur_v.view().into()));
        ctx.gpu.bind_sr(BOKEH_SR_SLOT, bokeh_target.map(|t| t.view().into()));
        ctx.gpu.set_state(handles.composite[usize::from(bokeh_target.is_some())]);
        ctx.gpu.draw_fullscreen_triangle(1);

        ctx.gpu.reset_sr();
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();

        for texture in [coc, downscaled, blur_h, blur_v].into_iter().chain(bokeh_target) {
            ctx.release(texture);
        }
        true
    }

    /// Append bright out of focus pixels and splat them additively into a
    /// half resolution target
    fn render_bokeh(
        ctx: &mut RenderContext,
        handles: &DepthOfFieldStates,
        generate: ComputeShaderHandle,
        bokeh: BokehBuffers,
        downscaled: &GpuTexture,
        coc: &GpuTexture,
        desc: TextureDescriptor,
    ) -> Option<GpuTexture> {
        let target = match ctx.get_temporary("DOF.Bokeh", &desc) {
            Ok(texture) => texture,
            Err(err) => {
                log::warn!("DepthOfFieldPass: {err}");
                return None;
            }
        };

        ctx.gpu.push_event("Bokeh");
        ctx.gpu.reset_render_target();
        ctx.gpu.reset_counter(bokeh.points.handle);
        ctx.gpu.bind_sr(INPUT_SR_SLOT, Some(downscaled.view().into()));
        ctx.gpu.bind_sr(COC_SR_SLOT, Some(coc.view().into()));
        ctx.gpu.bind_ua(BOKEH_POINTS_SLOT, Some(bokeh.points.handle.into()));
        ctx.gpu.dispatch(
            generate,
            group_count(desc.width, BOKEH_GROUP_SIZE),
            group_count(desc.height, BOKEH_GROUP_SIZE),
            1,
        );
        ctx.gpu.reset_ua();
        ctx.gpu
            .copy_counter(bokeh.indirect_args.handle, INDIRECT_INSTANCE_COUNT_OFFSET, bokeh.points.handle);

        ctx.gpu.clear(target.view(), Color::TRANSPARENT);
        ctx.gpu.set_render_target(None, &[target.view()]);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(desc.width, desc.height));
        ctx.gpu.bind_sr(BOKEH_POINTS_SLOT, Some(bokeh.points.handle.into()));
        ctx.gpu.bind_ib(bokeh.quad_indices.handle);
        ctx.gpu.set_state(handles.bokeh_draw);
        ctx.gpu.draw_indexed_instanced_indirect(bokeh.indirect_args.handle, 0);
        ctx.gpu.reset_sr();
        ctx.gpu.pop_event();
        Some(target)
    }
}

impl RendererPass for DepthOfFieldPass {
    fn name(&self) -> &'static str {
        "DepthOfFieldPass"
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        shaders
            .require(SHADER)?
            .check_cb(CB_SLOT, std::mem::size_of::<DepthOfFieldData>())?;
        if self.cb.is_none() {
            self.cb = Some(create_constant_buffer::<DepthOfFieldData>(device, "DepthOfField.CB")?);
        }
        if self.bokeh.is_none() && device.limits().compute_shaders {
            self.bokeh = Some(BokehBuffers::create(device)?);
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
        if let Some(bokeh) = self.bokeh.take() {
            bokeh.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_utils::TestFrame;

    fn enabled_frame(device: RecordingDevice, bokeh: bool) -> TestFrame {
        let mut frame = TestFrame::with_device(device, 64, 64);
        frame.list.settings.depth_of_field.enabled = true;
        frame.list.settings.depth_of_field.bokeh_enabled = bokeh;
        frame
    }

    #[test]
    fn test_circle_of_confusion() {
        let settings = DepthOfFieldSettings::default();
        assert_eq!(circle_of_confusion(2000.0, &settings), 0.0);
        assert_eq!(circle_of_confusion(1550.0, &settings), -0.5);
        assert_eq!(circle_of_confusion(0.0, &settings), -1.0);
        assert_eq!(circle_of_confusion(4950.0, &settings), 0.5);
        assert_eq!(circle_of_confusion(100_000.0, &settings), 1.0);

        let limited = DepthOfFieldSettings {
            depth_limit: 10_000.0,
            ..Default::default()
        };
        assert_eq!(circle_of_confusion(20_000.0, &limited), 0.0);
    }

    #[test]
    fn test_constant_layout() {
        assert_eq!(std::mem::size_of::<DepthOfFieldData>() % 16, 0);
        assert_eq!(std::mem::size_of::<BokehPoint>(), 32);
    }

    #[test]
    fn test_disabled_writes_nothing() {
        let mut frame = TestFrame::new(64, 64);
        let input = frame.hdr_target("Input");
        let output = frame.hdr_target("Output");
        let mut pass = DepthOfFieldPass::new();
        frame.setup(&mut pass);
        assert!(!pass.render(&mut frame.ctx(), &input, &output));
        assert!(frame.gpu.commands().is_empty());
    }

    #[test]
    fn test_bokeh_uses_indirect_draw() {
        let mut frame = enabled_frame(RecordingDevice::new(), true);
        let input = frame.hdr_target("Input");
        let output = frame.hdr_target("Output");
        let mut pass = DepthOfFieldPass::new();
        frame.setup(&mut pass);

        assert!(pass.render(&mut frame.ctx(), &input, &output));
        let bokeh = frame.gpu.commands_in_event("Bokeh");
        assert!(bokeh.iter().any(|c| matches!(c, GpuCommand::CopyCounter { offset: 4, .. })));
        assert!(bokeh
            .iter()
            .any(|c| matches!(c, GpuCommand::DrawIndexedInstancedIndirect { .. })));
        assert_eq!(frame.gpu.dispatch_count(), 1);
        assert_eq!(frame.pool.stats().in_use, 0);
    }

    #[test]
    fn test_without_compute_skips_bokeh() {
        let mut frame = enabled_frame(RecordingDevice::without_compute(), true);
        let input = frame.hdr_target("Input");
        let output = frame.hdr_target("Output");
        let mut pass = DepthOfFieldPass::new();
        frame.setup(&mut pass);

        assert!(pass.render(&mut frame.ctx(), &input, &output));
        assert!(frame.gpu.commands_in_event("Bokeh").is_empty());
        // CoC, downscale, two blur passes, composite
        assert_eq!(frame.gpu.draw_count(), 5);
    }
}
