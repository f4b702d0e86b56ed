//! Deferred rendering pipeline
//!
//! Every stage of the frame is a pass object owned by the renderer. A pass
//! owns its pipeline states and constant buffers, creates them in
//! [`RendererPass::setup_resources`] once its shader is ready, and drops
//! them when that shader reloads. Passes record into the view's
//! [`RenderContext`] and never return errors from their render entry
//! points: a pass that cannot run is skipped for the frame.

pub mod ambient_occlusion;
pub mod context;
pub mod depth_of_field;
pub mod draw;
pub mod eye_adaptation;
pub mod fog_pass;
pub mod gbuffer_pass;
pub mod global_surface_atlas;
pub mod light_pass;
pub mod motion_blur;
pub mod postprocess;
pub mod shadows;
pub mod taa;
pub mod volumetric_fog;

pub use ambient_occlusion::AmbientOcclusionPass;
pub use context::{FrameInfo, RenderContext};
pub use depth_of_field::DepthOfFieldPass;
pub use eye_adaptation::EyeAdaptationPass;
pub use fog_pass::FogPass;
pub use gbuffer_pass::GBufferPass;
pub use global_surface_atlas::{GlobalSurfaceAtlasPass, SurfaceAtlasBindings};
pub use light_pass::LightPass;
pub use motion_blur::MotionBlurPass;
pub use postprocess::ToneMappingPass;
pub use shadows::ShadowsPass;
pub use taa::TemporalAntiAliasingPass;
pub use volumetric_fog::VolumetricFogPass;

use bytemuck::Pod;

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::resources::ShaderLibrary;

/// Lifecycle shared by every pass
pub trait RendererPass {
    fn name(&self) -> &'static str;

    /// One-time initialization after the device is created
    fn init(&mut self, _device: &mut dyn GpuDevice) -> RenderResult<()> {
        Ok(())
    }

    /// Create pipeline states and buffers if missing. Called every frame
    /// before the pass renders; cheap once everything exists.
    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()>;

    /// A shader asset was reloaded; drop pipeline states built from it
    fn on_shader_reloading(&mut self, device: &mut dyn GpuDevice, shader: &str);

    /// Release every GPU resource
    fn dispose(&mut self, device: &mut dyn GpuDevice);
}

/// Run `setup_resources` and log a failure the way its kind demands.
/// Returns whether the pass may render this frame.
pub fn ensure_setup(pass: &mut dyn RendererPass, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> bool {
    match pass.setup_resources(device, shaders) {
        Ok(()) => true,
        Err(err) => {
            log_pass_error(pass.name(), &err);
            false
        }
    }
}

pub(crate) fn log_pass_error(pass: &str, err: &RenderError) {
    match err {
        RenderError::ShaderNotReady(_) => log::debug!("{pass}: {err}, skipping"),
        err if err.is_fatal() => log::error!("{pass}: {err}"),
        _ => log::warn!("{pass}: {err}, skipping"),
    }
}

/// Pipeline states and kernels created from one shader
#[derive(Debug, Default)]
pub struct PipelineStates {
    states: Vec<PipelineStateHandle>,
    kernels: Vec<ComputeShaderHandle>,
}

impl PipelineStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        device: &mut dyn GpuDevice,
        desc: &PipelineStateDescriptor,
    ) -> RenderResult<PipelineStateHandle> {
        let state = device
            .create_pipeline_state(desc)
            .map_err(|err| RenderError::resource(desc.shader.clone(), err))?;
        self.states.push(state);
        Ok(state)
    }

    pub fn create_compute(
        &mut self,
        device: &mut dyn GpuDevice,
        desc: &ComputeShaderDescriptor,
    ) -> RenderResult<ComputeShaderHandle> {
        let kernel = device
            .create_compute_shader(desc)
            .map_err(|err| RenderError::resource(format!("{}::{}", desc.shader, desc.entry_point), err))?;
        self.kernels.push(kernel);
        Ok(kernel)
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty() && self.kernels.is_empty()
    }

    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        for state in self.states.drain(..) {
            device.destroy_pipeline_state(state);
        }
        self.kernels.clear();
    }
}

/// Constant buffer sized for `T`
pub fn create_constant_buffer<T: Pod>(device: &mut dyn GpuDevice, name: &str) -> RenderResult<GpuBuffer> {
    device
        .create_buffer(name, &BufferDescriptor::constant(std::mem::size_of::<T>()))
        .map_err(|err| RenderError::resource(name, err))
}

/// Upload `data` into a constant buffer
pub fn update_cb<T: Pod>(gpu: &mut dyn GpuContext, buffer: &GpuBuffer, data: &T) {
    debug_assert_eq!(buffer.desc.size as usize, std::mem::size_of::<T>());
    gpu.update_cb(buffer.handle, bytemuck::bytes_of(data));
}

/// Shaders the built-in passes need, with their constant buffer layouts.
/// A host that compiles shaders registers the same names once assets load.
pub fn builtin_shader_library() -> ShaderLibrary {
    let mut library = ShaderLibrary::new();
    gbuffer_pass::register_shaders(&mut library);
    ambient_occlusion::register_shaders(&mut library);
    shadows::register_shaders(&mut library);
    light_pass::register_shaders(&mut library);
    motion_blur::register_shaders(&mut library);
    volumetric_fog::register_shaders(&mut library);
    fog_pass::register_shaders(&mut library);
    global_surface_atlas::register_shaders(&mut library);
    eye_adaptation::register_shaders(&mut library);
    depth_of_field::register_shaders(&mut library);
    taa::register_shaders(&mut library);
    postprocess::register_shaders(&mut library);
    crate::probes::register_shaders(&mut library);
    library
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::resources::{RenderBuffers, RenderTargetPool};
    use crate::scene::{DrawCall, DrawPass, InstanceData, MaterialInfo, RenderList, RenderView, StaticFlags};

    /// Everything a [`RenderContext`] borrows, on the recording backend
    pub struct TestFrame {
        pub device: RecordingDevice,
        pub gpu: RecordingContext,
        pub pool: RenderTargetPool,
        pub buffers: RenderBuffers,
        pub list: RenderList,
        pub view: RenderView,
        pub frame: FrameInfo,
        pub shaders: ShaderLibrary,
    }

    impl TestFrame {
        pub fn new(width: u32, height: u32) -> Self {
            Self::with_device(RecordingDevice::new(), width, height)
        }

        pub fn with_device(mut device: RecordingDevice, width: u32, height: u32) -> Self {
            let pool = RenderTargetPool::new();
            let mut buffers = RenderBuffers::new();
            buffers
                .init(&mut device, &pool, width, height)
                .expect("render buffers init");
            let mut view = RenderView::new();
            view.set_screen_size(width, height);
            view.set_perspective(glam::Vec3::ZERO, glam::Vec3::NEG_Z, glam::Vec3::Y, 1.0, 10.0, 10000.0);
            view.set_previous(None);
            let mut list = RenderList::new();
            list.setup_frustum_corners(&view);
            Self {
                device,
                gpu: RecordingContext::new(),
                pool,
                buffers,
                list,
                view,
                frame: FrameInfo {
                    frame_index: 1,
                    time: 1.0,
                    delta_time: 1.0 / 60.0,
                    unscaled_delta_time: 1.0 / 60.0,
                },
                shaders: builtin_shader_library(),
            }
        }

        pub fn ctx(&mut self) -> RenderContext<'_> {
            RenderContext {
                device: &mut self.device,
                gpu: &mut self.gpu,
                pool: &self.pool,
                buffers: &mut self.buffers,
                view: self.view.clone(),
                list: &mut self.list,
                frame: self.frame,
            }
        }

        /// Set up a pass against this frame's device and shaders
        pub fn setup(&mut self, pass: &mut dyn RendererPass) {
            pass.setup_resources(&mut self.device, &self.shaders)
                .expect("pass setup");
        }

        /// Opaque unit cube at `position`, routed into the G-Buffer and
        /// shadow depth lists
        pub fn add_cube(&mut self, position: glam::Vec3) {
            let mesh = crate::resources::GpuMesh::upload(&mut self.device, &crate::resources::Mesh::cube())
                .expect("cube mesh");
            let world = glam::Mat4::from_translation(position);
            let call = DrawCall {
                world,
                prev_world: world,
                geometry: mesh,
                material: MaterialInfo::default(),
                instance_data: InstanceData::None,
                world_determinant_sign: 1.0,
                per_instance_random: 0.0,
                lod_index: 0,
                lod_dither_factor: 0.0,
                bounds_center: position,
                bounds_radius: 0.87,
                static_flags: StaticFlags::empty(),
                casts_shadows: true,
                distance: 0.0,
            };
            self.list.add_shadow_caster(&self.view, call);
            self.list.add_draw_call(&self.view, DrawPass::DEFAULT, call);
        }

        pub fn hdr_target(&mut self, name: &str) -> GpuTexture {
            let (width, height) = self.buffers.size();
            self.device
                .create_texture(
                    name,
                    &TextureDescriptor::new_2d(
                        width,
                        height,
                        TextureFormat::Rgba16Float,
                        TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET | TextureFlags::UNORDERED_ACCESS,
                    ),
                )
                .expect("hdr target")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing(RenderError);

    impl RendererPass for Failing {
        fn name(&self) -> &'static str {
            "Failing"
        }

        fn setup_resources(&mut self, _: &mut dyn GpuDevice, _: &ShaderLibrary) -> RenderResult<()> {
            Err(self.0.clone())
        }

        fn on_shader_reloading(&mut self, _: &mut dyn GpuDevice, _: &str) {}

        fn dispose(&mut self, _: &mut dyn GpuDevice) {}
    }

    #[test]
    fn test_ensure_setup_reports_failure() {
        let mut device = RecordingDevice::new();
        let shaders = ShaderLibrary::new();
        let mut pass = Failing(RenderError::ShaderNotReady("Shaders/Missing".into()));
        assert!(!ensure_setup(&mut pass, &mut device, &shaders));
    }

    #[test]
    fn test_pipeline_states_release() {
        let mut device = RecordingDevice::new();
        let mut states = PipelineStates::new();
        states
            .create(&mut device, &PipelineStateDescriptor::fullscreen("Shaders/Test", "PS"))
            .unwrap();
        assert_eq!(device.pipeline_state_count(), 1);
        states.release(&mut device);
        assert!(states.is_empty());
        assert_eq!(device.pipeline_state_count(), 0);
    }

    #[test]
    fn test_builtin_library_is_ready() {
        let library = builtin_shader_library();
        assert!(library.require(gbuffer_pass::SHADER).is_ok());
        assert!(library.require(light_pass::SHADER).is_ok());
        assert!(library.require(volumetric_fog::SHADER).is_ok());
    }
}
