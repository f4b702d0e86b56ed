//! Fog application
//!
//! Composites exponential height fog and, when present, the integrated
//! volumetric fog volume over the lit scene.

use bytemuck::{Pod, Zeroable};
use glam::Vec4;

use crate::backend::*;
use crate::error::RenderResult;
use crate::pipeline::volumetric_fog::{FroxelDepth, ZDistribution};
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::ShaderLibrary;
use crate::scene::{GpuViewData, RenderFogData, ViewFlags, EPSILON};

pub const SHADER: &str = "Shaders/Fog";

pub const CB_SLOT: u32 = 0;
pub const DEPTH_SR_SLOT: u32 = 0;
pub const VOLUME_SR_SLOT: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FogData {
    pub view: GpuViewData,
    /// (density, height, height falloff, start distance)
    pub fog_parameters: Vec4,
    /// (color, max opacity)
    pub color_opacity: Vec4,
    /// (cutoff distance, has volume, unused, unused)
    pub params: Vec4,
    /// (near, far, slices, logarithmic) of the volume
    pub volume_depth: Vec4,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(SHADER, &[std::mem::size_of::<FogData>()]);
}

pub fn fog_data(view: GpuViewData, fog: &RenderFogData, volume: Option<&FroxelDepth>) -> FogData {
    let parameters = fog.fog_parameters();
    FogData {
        view,
        fog_parameters: parameters.extend(fog.start_distance),
        color_opacity: fog.color.extend(fog.max_opacity.clamp(0.0, 1.0)),
        params: Vec4::new(fog.cutoff_distance, if volume.is_some() { 1.0 } else { 0.0 }, 0.0, 0.0),
        volume_depth: volume.map_or(Vec4::ZERO, |depth| {
            Vec4::new(
                depth.near,
                depth.far,
                depth.slices as f32,
                if depth.distribution == ZDistribution::Logarithmic { 1.0 } else { 0.0 },
            )
        }),
    }
}

/// Height fog plus volumetric fog composite
#[derive(Default)]
pub struct FogPass {
    states: PipelineStates,
    /// `[with volume]`
    handles: Option<[PipelineStateHandle; 2]>,
    cb: Option<GpuBuffer>,
}

impl FogPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.handles.is_some()
    }

    fn create_states(&mut self, device: &mut dyn GpuDevice) -> RenderResult<[PipelineStateHandle; 2]> {
        let desc = PipelineStateDescriptor::fullscreen(SHADER, "PS_Fog").with_blend(BlendMode::Premultiplied);
        Ok([
            self.states.create(device, &desc.clone())?,
            self.states.create(device, &desc.with_permutation(1))?,
        ])
    }

    /// Blend fog over `target`. `volume` is the slice mapping returned by
    /// the volumetric fog pass this frame. Returns whether anything was drawn.
    pub fn render(&mut self, ctx: &mut RenderContext, target: &GpuTexture, volume: Option<FroxelDepth>) -> bool {
        if !ctx.view.flags.contains(ViewFlags::FOG) {
            return false;
        }
        let Some(fog) = ctx.list.fog else {
            return false;
        };
        let (Some(handles), Some(cb)) = (&self.handles, &self.cb) else {
            return false;
        };
        let Some(depth) = ctx.buffers.depth_buffer().copied() else {
            return false;
        };
        let integrated = volume.and_then(|v| ctx.buffers.volumetric_fog.get().copied().map(|t| (t, v)));
        if fog.density <= EPSILON && integrated.is_none() {
            return false;
        }

        let data = fog_data(ctx.view.shader_data(), &fog, integrated.as_ref().map(|(_, v)| v));

        ctx.gpu.push_event("Fog");
        update_cb(ctx.gpu, cb, &data);
        ctx.gpu.bind_cb(CB_SLOT, cb.handle);
        ctx.gpu.set_render_target(None, &[target.view()]);
        ctx.gpu.set_viewport_and_scissors(ctx.buffers.viewport());
        ctx.gpu.bind_sr(DEPTH_SR_SLOT, Some(depth.view().into()));
        ctx.gpu.bind_sr(VOLUME_SR_SLOT, integrated.map(|(t, _)| t.view().into()));
        ctx.gpu.set_state(handles[usize::from(integrated.is_some())]);
        ctx.gpu.draw_fullscreen_triangle(1);
        ctx.gpu.reset_sr();
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();
        true
    }
}

impl RendererPass for FogPass {
    fn name(&self) -> &'static str {
        "FogPass"
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        shaders.require(SHADER)?.check_cb(0, std::mem::size_of::<FogData>())?;
        if self.cb.is_none() {
            self.cb = Some(create_constant_buffer::<FogData>(device, "Fog.CB")?);
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
    use crate::pipeline::VolumetricFogPass;
    use crate::scene::VolumetricFogOptions;
    use glam::Vec3;

    fn height_fog(volumetric: bool) -> RenderFogData {
        RenderFogData {
            density: 0.02,
            height: 0.0,
            height_falloff: 0.002,
            color: Vec3::new(0.5, 0.6, 0.7),
            start_distance: 100.0,
            max_opacity: 1.0,
            cutoff_distance: 0.0,
            volumetric: volumetric.then(VolumetricFogOptions::default),
        }
    }

    #[test]
    fn test_fog_data_layout() {
        assert_eq!(std::mem::size_of::<FogData>() % 16, 0);
        let data = fog_data(GpuViewData::zeroed(), &height_fog(false), None);
        assert_eq!(data.fog_parameters, Vec4::new(0.02, 0.0, 0.002, 100.0));
        assert_eq!(data.params.y, 0.0);
    }

    #[test]
    fn test_without_fog_nothing_is_drawn() {
        let mut frame = TestFrame::new(64, 64);
        let target = frame.hdr_target("LightBuffer");
        let mut pass = FogPass::new();
        frame.setup(&mut pass);
        assert!(!pass.render(&mut frame.ctx(), &target, None));
        assert!(frame.gpu.commands().is_empty());
    }

    #[test]
    fn test_volume_selects_permutation() {
        let mut frame = TestFrame::new(64, 64);
        frame.list.fog = Some(height_fog(true));
        let target = frame.hdr_target("LightBuffer");
        let mut volumetric = VolumetricFogPass::new();
        let mut pass = FogPass::new();
        frame.setup(&mut volumetric);
        frame.setup(&mut pass);

        let mut ctx = frame.ctx();
        let depth = volumetric.render(&mut ctx, None);
        assert!(depth.is_some());
        assert!(pass.render(&mut ctx, &target, depth));
        drop(ctx);

        let volume = frame.buffers.volumetric_fog.get().copied().unwrap();
        let fog = frame.gpu.commands_in_event("Fog");
        assert!(fog.contains(&GpuCommand::BindSR {
            slot: VOLUME_SR_SLOT,
            view: Some(volume.view().into()),
        }));
        assert_eq!(fog.iter().filter(|c| c.is_draw()).count(), 1);
    }
}
