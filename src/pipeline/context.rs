//! Per-view render context
//!
//! Splits borrows across the device, the command context and the view's
//! buffers so a pass can allocate from the pool while recording commands.

use crate::backend::{GpuContext, GpuDevice, GpuTexture, TextureDescriptor};
use crate::error::{RenderError, RenderResult};
use crate::resources::{RenderBuffers, RenderTargetPool};
use crate::scene::{RenderList, RenderView};

/// Timing of the frame being rendered
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameInfo {
    pub frame_index: u64,
    /// Real time since startup in seconds
    pub time: f32,
    /// Scaled game delta time
    pub delta_time: f32,
    /// Real delta time, drives eye adaptation
    pub unscaled_delta_time: f32,
}

/// Everything a pass sees while rendering one view
pub struct RenderContext<'a> {
    pub device: &'a mut dyn GpuDevice,
    pub gpu: &'a mut dyn GpuContext,
    pub pool: &'a RenderTargetPool,
    pub buffers: &'a mut RenderBuffers,
    pub view: RenderView,
    pub list: &'a mut RenderList,
    pub frame: FrameInfo,
}

impl<'a> RenderContext<'a> {
    pub fn frame_index(&self) -> u64 {
        self.frame.frame_index
    }

    /// Transient texture from the pool. Release it with [`release`](Self::release).
    pub fn get_temporary(&mut self, name: &str, desc: &TextureDescriptor) -> RenderResult<GpuTexture> {
        self.pool
            .get(self.device, name, desc)
            .map_err(|err| RenderError::resource(name, err))
    }

    pub fn release(&self, texture: GpuTexture) {
        self.pool.release(texture);
    }
}
