//! Core backend abstraction traits
//!
//! `GpuDevice` creates and destroys resources, `GpuContext` records commands
//! into the main command list. Passes only ever talk to these two traits.

use crate::backend::types::*;
use crate::resources::TextureData;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create pipeline state: {0}")]
    PipelineCreationFailed(String),
    #[error("Format {0:?} is not supported for the requested usage")]
    UnsupportedFormat(TextureFormat),
    #[error("Failed to download texture: {0}")]
    DownloadFailed(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a graphics pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineStateHandle(pub(crate) u64);

/// Handle to a compute shader kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputeShaderHandle(pub(crate) u64);

/// A texture together with the descriptor it was created from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuTexture {
    pub handle: TextureHandle,
    pub desc: TextureDescriptor,
}

impl GpuTexture {
    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    /// View of every mip and slice
    pub fn view(&self) -> TextureView {
        TextureView {
            texture: self.handle,
            subresource: ViewSubresource::Full,
        }
    }

    pub fn view_mip(&self, mip: u32) -> TextureView {
        debug_assert!(mip < self.desc.mip_levels);
        TextureView {
            texture: self.handle,
            subresource: ViewSubresource::Mip(mip),
        }
    }

    pub fn view_slice(&self, slice: u32) -> TextureView {
        debug_assert!(slice < self.desc.array_size.max(self.desc.depth));
        TextureView {
            texture: self.handle,
            subresource: ViewSubresource::Slice(slice),
        }
    }

    pub fn view_slice_mip(&self, slice: u32, mip: u32) -> TextureView {
        TextureView {
            texture: self.handle,
            subresource: ViewSubresource::SliceMip { slice, mip },
        }
    }

    /// Depth view that can be bound while the same texture is a depth target
    pub fn view_read_only_depth(&self) -> TextureView {
        TextureView {
            texture: self.handle,
            subresource: if self.desc.flags.contains(TextureFlags::READ_ONLY_DEPTH_VIEW) {
                ViewSubresource::ReadOnlyDepth
            } else {
                ViewSubresource::Full
            },
        }
    }
}

/// Which part of a texture a view exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewSubresource {
    Full,
    Mip(u32),
    Slice(u32),
    SliceMip { slice: u32, mip: u32 },
    ReadOnlyDepth,
}

/// A bindable texture view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureView {
    pub texture: TextureHandle,
    pub subresource: ViewSubresource,
}

/// A buffer together with its descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuBuffer {
    pub handle: BufferHandle,
    pub desc: BufferDescriptor,
}

/// Anything that can sit in a shader resource or unordered access slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceView {
    Texture(TextureView),
    Buffer(BufferHandle),
}

impl From<TextureView> for ResourceView {
    fn from(view: TextureView) -> Self {
        ResourceView::Texture(view)
    }
}

impl From<BufferHandle> for ResourceView {
    fn from(buffer: BufferHandle) -> Self {
        ResourceView::Buffer(buffer)
    }
}

/// Device capabilities the pipeline branches on
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLimits {
    pub compute_shaders: bool,
    pub geometry_shaders: bool,
    pub typed_uav_load: bool,
    pub read_only_depth_views: bool,
    /// Render target views over volume texture slices
    pub volume_render_targets: bool,
    pub max_texture_size: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            compute_shaders: true,
            geometry_shaders: true,
            typed_uav_load: true,
            read_only_depth_views: true,
            volume_render_targets: true,
            max_texture_size: 16384,
        }
    }
}

/// Resource creation side of the GPU
pub trait GpuDevice {
    /// Capabilities of this device
    fn limits(&self) -> &DeviceLimits;

    /// Query what a texture format can be used for
    fn format_support(&self, format: TextureFormat) -> FormatSupport;

    /// Create a texture
    fn create_texture(&mut self, name: &str, desc: &TextureDescriptor) -> BackendResult<GpuTexture>;

    /// Destroy a texture
    fn destroy_texture(&mut self, texture: GpuTexture);

    /// Create a buffer
    fn create_buffer(&mut self, name: &str, desc: &BufferDescriptor) -> BackendResult<GpuBuffer>;

    /// Create a buffer with initial data
    fn create_buffer_init(
        &mut self,
        name: &str,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<GpuBuffer>;

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: GpuBuffer);

    /// Create a graphics pipeline state
    fn create_pipeline_state(
        &mut self,
        desc: &PipelineStateDescriptor,
    ) -> BackendResult<PipelineStateHandle>;

    /// Destroy a graphics pipeline state
    fn destroy_pipeline_state(&mut self, state: PipelineStateHandle);

    /// Resolve a compute kernel
    fn create_compute_shader(
        &mut self,
        desc: &ComputeShaderDescriptor,
    ) -> BackendResult<ComputeShaderHandle>;

    /// Read a texture back to the CPU. Callers must have waited for the
    /// frame that wrote it to complete on the GPU.
    fn download_texture(&mut self, texture: &GpuTexture) -> BackendResult<TextureData>;
}

/// Linear command recorder for the main command list
pub trait GpuContext {
    // State

    fn set_state(&mut self, state: PipelineStateHandle);
    fn set_render_target(&mut self, depth: Option<TextureView>, color: &[TextureView]);
    fn set_viewport_and_scissors(&mut self, viewport: Viewport);
    fn reset_render_target(&mut self);
    fn reset_sr(&mut self);
    fn reset_ua(&mut self);
    fn reset_cb(&mut self);
    fn flush_state(&mut self);

    // Resources

    fn bind_sr(&mut self, slot: u32, view: Option<ResourceView>);
    fn bind_ua(&mut self, slot: u32, view: Option<ResourceView>);
    fn bind_cb(&mut self, slot: u32, buffer: BufferHandle);
    fn update_cb(&mut self, buffer: BufferHandle, data: &[u8]);
    fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]);
    fn bind_vb(&mut self, buffers: &[BufferHandle]);
    fn bind_ib(&mut self, buffer: BufferHandle);

    // Draw

    fn draw_fullscreen_triangle(&mut self, instance_count: u32);
    /// Copy a texture to the bound render target with a fullscreen draw
    fn draw(&mut self, texture: TextureView);
    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, start_vertex: u32, start_instance: u32);
    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    );
    fn draw_indexed_instanced_indirect(&mut self, args: BufferHandle, offset: u32);

    // Dispatch

    fn dispatch(&mut self, shader: ComputeShaderHandle, groups_x: u32, groups_y: u32, groups_z: u32);

    // Copies and clears

    fn copy_texture(
        &mut self,
        dst: &GpuTexture,
        dst_subresource: u32,
        dst_offset: (u32, u32, u32),
        src: &GpuTexture,
        src_subresource: u32,
    );
    fn copy_resource(&mut self, dst: &GpuTexture, src: &GpuTexture);
    fn copy_counter(&mut self, dst: BufferHandle, dst_offset: u32, src: BufferHandle);
    fn reset_counter(&mut self, buffer: BufferHandle);
    fn clear(&mut self, view: TextureView, color: Color);
    fn clear_depth(&mut self, view: TextureView, depth: f32);
    fn clear_ua(&mut self, buffer: BufferHandle, value: [u32; 4]);

    // Debug markers

    fn push_event(&mut self, name: &str);
    fn pop_event(&mut self);
}

/// Subresource index of `(slice, mip)` in a texture with `mip_levels` mips
pub fn subresource_index(slice: u32, mip: u32, mip_levels: u32) -> u32 {
    slice * mip_levels + mip
}

/// Number of thread groups covering `size` items with `group_size` threads each
pub fn group_count(size: u32, group_size: u32) -> u32 {
    size.div_ceil(group_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BackendError::OutOfMemory;
        assert_eq!(err.to_string(), "Out of memory");

        let err = BackendError::UnsupportedFormat(TextureFormat::Depth16Unorm);
        assert_eq!(
            err.to_string(),
            "Format Depth16Unorm is not supported for the requested usage"
        );
    }

    #[test]
    fn test_group_count_rounds_up() {
        assert_eq!(group_count(64, 8), 8);
        assert_eq!(group_count(65, 8), 9);
        assert_eq!(group_count(1, 16), 1);
    }

    #[test]
    fn test_read_only_depth_view_requires_flag() {
        let desc = TextureDescriptor::new_2d(
            16,
            16,
            TextureFormat::Depth32Float,
            TextureFlags::DEPTH_STENCIL | TextureFlags::SHADER_RESOURCE,
        );
        let texture = GpuTexture {
            handle: TextureHandle(1),
            desc,
        };
        assert_eq!(
            texture.view_read_only_depth().subresource,
            ViewSubresource::Full
        );

        let mut with_flag = texture;
        with_flag.desc.flags |= TextureFlags::READ_ONLY_DEPTH_VIEW;
        assert_eq!(
            with_flag.view_read_only_depth().subresource,
            ViewSubresource::ReadOnlyDepth
        );
    }
}
