//! Headless recording backend.
//!
//! This backend doesn't perform actual GPU operations. It tracks live
//! resources and records every context command as a [`GpuCommand`], which
//! makes the pipeline observable in tests and in the headless demo without
//! requiring GPU hardware.

use std::collections::HashMap;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::resources::TextureData;

/// One recorded context command
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    SetState(PipelineStateHandle),
    SetRenderTarget {
        depth: Option<TextureView>,
        color: Vec<TextureView>,
    },
    SetViewport(Viewport),
    ResetRenderTarget,
    ResetSR,
    ResetUA,
    ResetCB,
    FlushState,
    BindSR {
        slot: u32,
        view: Option<ResourceView>,
    },
    BindUA {
        slot: u32,
        view: Option<ResourceView>,
    },
    BindCB {
        slot: u32,
        buffer: BufferHandle,
    },
    UpdateCB {
        buffer: BufferHandle,
        size: usize,
    },
    UpdateBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: usize,
    },
    BindVB(Vec<BufferHandle>),
    BindIB(BufferHandle),
    DrawFullscreenTriangle {
        instances: u32,
    },
    Draw(TextureView),
    DrawInstanced {
        vertices: u32,
        instances: u32,
    },
    DrawIndexedInstanced {
        indices: u32,
        instances: u32,
    },
    DrawIndexedInstancedIndirect {
        args: BufferHandle,
        offset: u32,
    },
    Dispatch {
        shader: ComputeShaderHandle,
        groups: (u32, u32, u32),
    },
    CopyTexture {
        dst: TextureHandle,
        dst_subresource: u32,
        src: TextureHandle,
        src_subresource: u32,
    },
    CopyResource {
        dst: TextureHandle,
        src: TextureHandle,
    },
    CopyCounter {
        dst: BufferHandle,
        offset: u32,
        src: BufferHandle,
    },
    ResetCounter(BufferHandle),
    Clear {
        view: TextureView,
        color: Color,
    },
    ClearDepth {
        view: TextureView,
        depth: f32,
    },
    ClearUA(BufferHandle),
    PushEvent(String),
    PopEvent,
}

impl GpuCommand {
    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            GpuCommand::DrawFullscreenTriangle { .. }
                | GpuCommand::Draw(_)
                | GpuCommand::DrawInstanced { .. }
                | GpuCommand::DrawIndexedInstanced { .. }
                | GpuCommand::DrawIndexedInstancedIndirect { .. }
        )
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(self, GpuCommand::Dispatch { .. })
    }
}

/// Headless device tracking every live resource
#[derive(Debug)]
pub struct RecordingDevice {
    limits: DeviceLimits,
    unsupported_formats: Vec<TextureFormat>,
    next_id: u64,
    textures: HashMap<TextureHandle, (String, TextureDescriptor)>,
    buffers: HashMap<BufferHandle, (String, BufferDescriptor)>,
    pipeline_states: HashMap<PipelineStateHandle, PipelineStateDescriptor>,
    compute_shaders: HashMap<ComputeShaderHandle, ComputeShaderDescriptor>,
    textures_created: u64,
    textures_destroyed: u64,
}

impl RecordingDevice {
    /// Device supporting every feature and format
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            unsupported_formats: Vec::new(),
            next_id: 1,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            pipeline_states: HashMap::new(),
            compute_shaders: HashMap::new(),
            textures_created: 0,
            textures_destroyed: 0,
        }
    }

    /// Device without compute shader support
    pub fn without_compute() -> Self {
        Self::with_limits(DeviceLimits {
            compute_shaders: false,
            ..DeviceLimits::default()
        })
    }

    /// Mark a format as unusable (reports no capabilities)
    pub fn disable_format(&mut self, format: TextureFormat) {
        self.unsupported_formats.push(format);
    }

    /// Get the backend name.
    pub fn name(&self) -> &'static str {
        "Recording Backend"
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn pipeline_state_count(&self) -> usize {
        self.pipeline_states.len()
    }

    pub fn textures_created(&self) -> u64 {
        self.textures_created
    }

    pub fn textures_destroyed(&self) -> u64 {
        self.textures_destroyed
    }

    pub fn is_texture_alive(&self, handle: TextureHandle) -> bool {
        self.textures.contains_key(&handle)
    }

    pub fn texture_name(&self, handle: TextureHandle) -> Option<&str> {
        self.textures.get(&handle).map(|(name, _)| name.as_str())
    }

    pub fn pipeline_state(&self, handle: PipelineStateHandle) -> Option<&PipelineStateDescriptor> {
        self.pipeline_states.get(&handle)
    }

    /// Live textures with the given debug name
    pub fn find_textures(&self, name: &str) -> Vec<TextureDescriptor> {
        self.textures
            .values()
            .filter(|(n, _)| n == name)
            .map(|(_, desc)| *desc)
            .collect()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for RecordingDevice {
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn format_support(&self, format: TextureFormat) -> FormatSupport {
        if self.unsupported_formats.contains(&format) {
            return FormatSupport::empty();
        }
        if format.is_depth() {
            FormatSupport::DEPTH_STENCIL
                | FormatSupport::SHADER_SAMPLE
                | FormatSupport::SHADER_SAMPLE_COMPARISON
        } else {
            let mut support = FormatSupport::RENDER_TARGET | FormatSupport::SHADER_SAMPLE;
            if self.limits.typed_uav_load {
                support |= FormatSupport::TYPED_UAV_LOAD;
            }
            support
        }
    }

    fn create_texture(&mut self, name: &str, desc: &TextureDescriptor) -> BackendResult<GpuTexture> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 || desc.mip_levels == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{name}: invalid size {}x{}x{} with {} mips",
                desc.width, desc.height, desc.depth, desc.mip_levels
            )));
        }
        if desc.width > self.limits.max_texture_size || desc.height > self.limits.max_texture_size {
            return Err(BackendError::TextureCreationFailed(format!(
                "{name}: {}x{} exceeds the device limit",
                desc.width, desc.height
            )));
        }
        if self.unsupported_formats.contains(&desc.format) {
            return Err(BackendError::UnsupportedFormat(desc.format));
        }

        log::trace!(
            "RecordingDevice: creating texture {name} ({}x{}x{}, {:?})",
            desc.width,
            desc.height,
            desc.depth,
            desc.format
        );
        let handle = TextureHandle(self.next_id());
        self.textures.insert(handle, (name.to_string(), *desc));
        self.textures_created += 1;
        Ok(GpuTexture {
            handle,
            desc: *desc,
        })
    }

    fn destroy_texture(&mut self, texture: GpuTexture) {
        if self.textures.remove(&texture.handle).is_some() {
            self.textures_destroyed += 1;
        } else {
            log::warn!("RecordingDevice: destroying unknown texture {:?}", texture.handle);
        }
    }

    fn create_buffer(&mut self, name: &str, desc: &BufferDescriptor) -> BackendResult<GpuBuffer> {
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{name}: zero-sized buffer"
            )));
        }
        log::trace!("RecordingDevice: creating buffer {name} (size: {})", desc.size);
        let handle = BufferHandle(self.next_id());
        self.buffers.insert(handle, (name.to_string(), *desc));
        Ok(GpuBuffer {
            handle,
            desc: *desc,
        })
    }

    fn create_buffer_init(
        &mut self,
        name: &str,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<GpuBuffer> {
        if data.len() as u64 > desc.size {
            return Err(BackendError::BufferCreationFailed(format!(
                "{name}: {} bytes of initial data exceed the buffer size {}",
                data.len(),
                desc.size
            )));
        }
        self.create_buffer(name, desc)
    }

    fn destroy_buffer(&mut self, buffer: GpuBuffer) {
        self.buffers.remove(&buffer.handle);
    }

    fn create_pipeline_state(
        &mut self,
        desc: &PipelineStateDescriptor,
    ) -> BackendResult<PipelineStateHandle> {
        if desc.geometry_shader.is_some() && !self.limits.geometry_shaders {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{}: geometry shaders are not supported",
                desc.shader
            )));
        }
        let handle = PipelineStateHandle(self.next_id());
        self.pipeline_states.insert(handle, desc.clone());
        Ok(handle)
    }

    fn destroy_pipeline_state(&mut self, state: PipelineStateHandle) {
        self.pipeline_states.remove(&state);
    }

    fn create_compute_shader(
        &mut self,
        desc: &ComputeShaderDescriptor,
    ) -> BackendResult<ComputeShaderHandle> {
        if !self.limits.compute_shaders {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{}::{}: compute shaders are not supported",
                desc.shader, desc.entry_point
            )));
        }
        let handle = ComputeShaderHandle(self.next_id());
        self.compute_shaders.insert(handle, desc.clone());
        Ok(handle)
    }

    fn download_texture(&mut self, texture: &GpuTexture) -> BackendResult<TextureData> {
        let Some((name, desc)) = self.textures.get(&texture.handle) else {
            return Err(BackendError::DownloadFailed(format!(
                "unknown texture {:?}",
                texture.handle
            )));
        };
        Ok(TextureData::zeroed(name, desc))
    }
}

/// Context recording every command into a list
#[derive(Debug, Default)]
pub struct RecordingContext {
    commands: Vec<GpuCommand>,
}

impl RecordingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    /// Take the recorded commands, leaving the list empty (end of frame submit)
    pub fn take_commands(&mut self) -> Vec<GpuCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn draw_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_draw()).count()
    }

    pub fn dispatch_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_dispatch()).count()
    }

    /// Names of every pushed debug event, in order
    pub fn events(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                GpuCommand::PushEvent(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Commands recorded between the first `PushEvent(name)` and its matching `PopEvent`
    pub fn commands_in_event(&self, name: &str) -> &[GpuCommand] {
        let Some(start) = self
            .commands
            .iter()
            .position(|c| matches!(c, GpuCommand::PushEvent(n) if n == name))
        else {
            return &[];
        };
        let mut depth = 0usize;
        for (i, command) in self.commands[start..].iter().enumerate() {
            match command {
                GpuCommand::PushEvent(_) => depth += 1,
                GpuCommand::PopEvent => {
                    depth -= 1;
                    if depth == 0 {
                        return &self.commands[start + 1..start + i];
                    }
                }
                _ => {}
            }
        }
        &self.commands[start + 1..]
    }
}

impl GpuContext for RecordingContext {
    fn set_state(&mut self, state: PipelineStateHandle) {
        self.commands.push(GpuCommand::SetState(state));
    }

    fn set_render_target(&mut self, depth: Option<TextureView>, color: &[TextureView]) {
        self.commands.push(GpuCommand::SetRenderTarget {
            depth,
            color: color.to_vec(),
        });
    }

    fn set_viewport_and_scissors(&mut self, viewport: Viewport) {
        self.commands.push(GpuCommand::SetViewport(viewport));
    }

    fn reset_render_target(&mut self) {
        self.commands.push(GpuCommand::ResetRenderTarget);
    }

    fn reset_sr(&mut self) {
        self.commands.push(GpuCommand::ResetSR);
    }

    fn reset_ua(&mut self) {
        self.commands.push(GpuCommand::ResetUA);
    }

    fn reset_cb(&mut self) {
        self.commands.push(GpuCommand::ResetCB);
    }

    fn flush_state(&mut self) {
        self.commands.push(GpuCommand::FlushState);
    }

    fn bind_sr(&mut self, slot: u32, view: Option<ResourceView>) {
        self.commands.push(GpuCommand::BindSR { slot, view });
    }

    fn bind_ua(&mut self, slot: u32, view: Option<ResourceView>) {
        self.commands.push(GpuCommand::BindUA { slot, view });
    }

    fn bind_cb(&mut self, slot: u32, buffer: BufferHandle) {
        self.commands.push(GpuCommand::BindCB { slot, buffer });
    }

    fn update_cb(&mut self, buffer: BufferHandle, data: &[u8]) {
        self.commands.push(GpuCommand::UpdateCB {
            buffer,
            size: data.len(),
        });
    }

    fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.commands.push(GpuCommand::UpdateBuffer {
            buffer,
            offset,
            size: data.len(),
        });
    }

    fn bind_vb(&mut self, buffers: &[BufferHandle]) {
        self.commands.push(GpuCommand::BindVB(buffers.to_vec()));
    }

    fn bind_ib(&mut self, buffer: BufferHandle) {
        self.commands.push(GpuCommand::BindIB(buffer));
    }

    fn draw_fullscreen_triangle(&mut self, instance_count: u32) {
        self.commands.push(GpuCommand::DrawFullscreenTriangle {
            instances: instance_count,
        });
    }

    fn draw(&mut self, texture: TextureView) {
        self.commands.push(GpuCommand::Draw(texture));
    }

    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, _start_vertex: u32, _start_instance: u32) {
        self.commands.push(GpuCommand::DrawInstanced {
            vertices: vertex_count,
            instances: instance_count,
        });
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        _start_index: u32,
        _base_vertex: i32,
        _start_instance: u32,
    ) {
        self.commands.push(GpuCommand::DrawIndexedInstanced {
            indices: index_count,
            instances: instance_count,
        });
    }

    fn draw_indexed_instanced_indirect(&mut self, args: BufferHandle, offset: u32) {
        self.commands
            .push(GpuCommand::DrawIndexedInstancedIndirect { args, offset });
    }

    fn dispatch(&mut self, shader: ComputeShaderHandle, groups_x: u32, groups_y: u32, groups_z: u32) {
        self.commands.push(GpuCommand::Dispatch {
            shader,
            groups: (groups_x, groups_y, groups_z),
        });
    }

    fn copy_texture(
        &mut self,
        dst: &GpuTexture,
        dst_subresource: u32,
        _dst_offset: (u32, u32, u32),
        src: &GpuTexture,
        src_subresource: u32,
    ) {
        self.commands.push(GpuCommand::CopyTexture {
            dst: dst.handle,
            dst_subresource,
            src: src.handle,
            src_subresource,
        });
    }

    fn copy_resource(&mut self, dst: &GpuTexture, src: &GpuTexture) {
        self.commands.push(GpuCommand::CopyResource {
            dst: dst.handle,
            src: src.handle,
        });
    }

    fn copy_counter(&mut self, dst: BufferHandle, dst_offset: u32, src: BufferHandle) {
        self.commands.push(GpuCommand::CopyCounter {
            dst,
            offset: dst_offset,
            src,
        });
    }

    fn reset_counter(&mut self, buffer: BufferHandle) {
        self.commands.push(GpuCommand::ResetCounter(buffer));
    }

    fn clear(&mut self, view: TextureView, color: Color) {
        self.commands.push(GpuCommand::Clear { view, color });
    }

    fn clear_depth(&mut self, view: TextureView, depth: f32) {
        self.commands.push(GpuCommand::ClearDepth { view, depth });
    }

    fn clear_ua(&mut self, buffer: BufferHandle, _value: [u32; 4]) {
        self.commands.push(GpuCommand::ClearUA(buffer));
    }

    fn push_event(&mut self, name: &str) {
        self.commands.push(GpuCommand::PushEvent(name.to_string()));
    }

    fn pop_event(&mut self) {
        self.commands.push(GpuCommand::PopEvent);
    }
}
