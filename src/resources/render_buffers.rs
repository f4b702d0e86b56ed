//! Per-view render buffers
//!
//! A view owns its depth buffer and G-Buffer, plus a set of optional targets
//! kept across frames for temporal effects (TAA history, volumetric fog
//! history, eye adaptation luminance, ...). Optional targets come from the
//! [`RenderTargetPool`] and go back to it when unused for
//! [`LAZY_RELEASE_FRAMES`] frames.

use std::any::Any;
use std::collections::HashMap;

use glam::Mat4;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};
use crate::resources::RenderTargetPool;

/// Optional targets unused for this many frames are released.
pub const LAZY_RELEASE_FRAMES: u64 = 4;

pub const GBUFFER0_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
pub const GBUFFER1_FORMAT: TextureFormat = TextureFormat::Rgb10a2Unorm;
pub const GBUFFER2_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
pub const GBUFFER3_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

pub const GBUFFER_FORMATS: [TextureFormat; 4] = [
    GBUFFER0_FORMAT,
    GBUFFER1_FORMAT,
    GBUFFER2_FORMAT,
    GBUFFER3_FORMAT,
];

/// Depth formats in order of preference
pub const DEPTH_FORMATS: [TextureFormat; 3] = [
    TextureFormat::Depth16Unorm,
    TextureFormat::Depth24PlusStencil8,
    TextureFormat::Depth32Float,
];

/// Handle of a view's render buffers held by the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub(crate) u32);

/// Pick the first format in `candidates` exposing all of `required`
pub fn pick_format(
    device: &dyn GpuDevice,
    candidates: &[TextureFormat],
    required: FormatSupport,
) -> Option<TextureFormat> {
    candidates
        .iter()
        .copied()
        .find(|format| device.format_support(*format).contains(required))
}

/// A pool texture kept across frames with its last-use stamp
#[derive(Debug, Clone, Copy, Default)]
pub struct CachedTarget {
    pub texture: Option<GpuTexture>,
    pub last_frame_used: u64,
}

impl CachedTarget {
    pub fn get(&self) -> Option<&GpuTexture> {
        self.texture.as_ref()
    }

    pub fn is_some(&self) -> bool {
        self.texture.is_some()
    }

    /// Store a texture, releasing the previous one to the pool
    pub fn set(&mut self, pool: &RenderTargetPool, texture: GpuTexture, frame: u64) {
        if let Some(old) = self.texture.replace(texture) {
            if old.handle != texture.handle {
                pool.release(old);
            }
        }
        self.last_frame_used = frame;
    }

    pub fn take(&mut self) -> Option<GpuTexture> {
        self.texture.take()
    }

    pub fn touch(&mut self, frame: u64) {
        self.last_frame_used = frame;
    }

    pub fn release(&mut self, pool: &RenderTargetPool) {
        pool.release_opt(&mut self.texture);
    }

    fn release_if_stale(&mut self, pool: &RenderTargetPool, frame: u64) -> bool {
        if self.texture.is_some() && frame.saturating_sub(self.last_frame_used) >= LAZY_RELEASE_FRAMES {
            self.release(pool);
            return true;
        }
        false
    }
}

/// Named per-view state owned by a pass (for example the surface atlas)
pub trait CustomBuffer: Any {
    /// Frame the owning pass last used this buffer
    fn last_frame_used(&self) -> u64;

    /// Release every GPU resource held by the buffer
    fn release(&mut self, device: &mut dyn GpuDevice, pool: &RenderTargetPool);

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Render buffers of a single view
pub struct RenderBuffers {
    width: u32,
    height: u32,
    use_alpha: bool,

    depth_buffer: Option<GpuTexture>,
    gbuffer: [Option<GpuTexture>; 4],

    pub motion_vectors: CachedTarget,
    pub luminance_map: CachedTarget,
    /// Real time of the last eye adaptation update, `None` forces a history reset
    pub last_eye_adaptation_time: Option<f32>,
    pub volumetric_fog: CachedTarget,
    pub volumetric_fog_history: CachedTarget,
    pub local_shadowed_light_scattering: CachedTarget,
    pub half_res_depth: CachedTarget,
    pub temporal_ssr: CachedTarget,
    pub temporal_aa: CachedTarget,

    custom_buffers: HashMap<&'static str, Box<dyn CustomBuffer>>,

    /// View whose temporal state this one shares
    pub linked_view: Option<ViewId>,
    /// View-projection of the last rendered frame, drives motion vectors
    pub last_view_projection: Option<Mat4>,
    pub last_frame_rendered: u64,
}

impl std::fmt::Debug for RenderBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderBuffers")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("use_alpha", &self.use_alpha)
            .field("custom_buffers", &self.custom_buffers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for RenderBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBuffers {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            use_alpha: false,
            depth_buffer: None,
            gbuffer: [None; 4],
            motion_vectors: CachedTarget::default(),
            luminance_map: CachedTarget::default(),
            last_eye_adaptation_time: None,
            volumetric_fog: CachedTarget::default(),
            volumetric_fog_history: CachedTarget::default(),
            local_shadowed_light_scattering: CachedTarget::default(),
            half_res_depth: CachedTarget::default(),
            temporal_ssr: CachedTarget::default(),
            temporal_aa: CachedTarget::default(),
            custom_buffers: HashMap::new(),
            linked_view: None,
            last_view_projection: None,
            last_frame_rendered: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    pub fn viewport(&self) -> Viewport {
        Viewport::from_size(self.width, self.height)
    }

    pub fn is_initialized(&self) -> bool {
        self.depth_buffer.is_some()
    }

    pub fn set_use_alpha(&mut self, use_alpha: bool) {
        self.use_alpha = use_alpha;
    }

    pub fn use_alpha(&self) -> bool {
        self.use_alpha
    }

    /// Format of the scene color and light buffers
    pub fn output_format(&self) -> TextureFormat {
        if self.use_alpha {
            TextureFormat::Rgba16Float
        } else {
            TextureFormat::Rg11b10Float
        }
    }

    pub fn depth_buffer(&self) -> Option<&GpuTexture> {
        self.depth_buffer.as_ref()
    }

    pub fn gbuffer(&self, index: usize) -> Option<&GpuTexture> {
        self.gbuffer.get(index).and_then(Option::as_ref)
    }

    /// All four G-Buffer targets, if initialized
    pub fn gbuffers(&self) -> Option<[GpuTexture; 4]> {
        Some([
            self.gbuffer[0]?,
            self.gbuffer[1]?,
            self.gbuffer[2]?,
            self.gbuffer[3]?,
        ])
    }

    /// Ensure the persistent targets match the requested size.
    ///
    /// Returns `Ok(false)` when nothing had to be reallocated. On a size
    /// change every persistent target is recreated, optional targets go
    /// back to the pool and the pool is flushed.
    pub fn init(
        &mut self,
        device: &mut dyn GpuDevice,
        pool: &RenderTargetPool,
        width: u32,
        height: u32,
    ) -> RenderResult<bool> {
        if width == self.width && height == self.height && self.is_initialized() {
            return Ok(false);
        }
        log::debug!(
            "RenderBuffers: resizing {}x{} -> {width}x{height}",
            self.width,
            self.height
        );

        self.release_optional(pool);
        self.destroy_persistent(device);
        self.width = width;
        self.height = height;

        if let Err(err) = self.create_persistent(device) {
            self.destroy_persistent(device);
            self.width = 0;
            self.height = 0;
            return Err(err);
        }

        pool.flush(device, false, LAZY_RELEASE_FRAMES);
        Ok(true)
    }

    fn create_persistent(&mut self, device: &mut dyn GpuDevice) -> RenderResult<()> {
        let depth_format = pick_format(
            device,
            &DEPTH_FORMATS,
            FormatSupport::DEPTH_STENCIL | FormatSupport::SHADER_SAMPLE,
        )
        .ok_or(RenderError::UnsupportedPlatformFeature("depth buffer format"))?;

        let mut depth_flags = TextureFlags::DEPTH_STENCIL | TextureFlags::SHADER_RESOURCE;
        if device.limits().read_only_depth_views {
            depth_flags |= TextureFlags::READ_ONLY_DEPTH_VIEW;
        }
        let depth_desc = TextureDescriptor::new_2d(self.width, self.height, depth_format, depth_flags);
        self.depth_buffer = Some(
            device
                .create_texture("DepthBuffer", &depth_desc)
                .map_err(|e| RenderError::resource("DepthBuffer", e))?,
        );

        const NAMES: [&str; 4] = ["GBuffer0", "GBuffer1", "GBuffer2", "GBuffer3"];
        for (i, format) in GBUFFER_FORMATS.iter().enumerate() {
            let desc = TextureDescriptor::new_2d(
                self.width,
                self.height,
                *format,
                TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
            );
            self.gbuffer[i] = Some(
                device
                    .create_texture(NAMES[i], &desc)
                    .map_err(|e| RenderError::resource(NAMES[i], e))?,
            );
        }
        Ok(())
    }

    fn destroy_persistent(&mut self, device: &mut dyn GpuDevice) {
        if let Some(depth) = self.depth_buffer.take() {
            device.destroy_texture(depth);
        }
        for slot in &mut self.gbuffer {
            if let Some(texture) = slot.take() {
                device.destroy_texture(texture);
            }
        }
    }

    fn optional_targets(&mut self) -> [&mut CachedTarget; 8] {
        [
            &mut self.motion_vectors,
            &mut self.luminance_map,
            &mut self.volumetric_fog,
            &mut self.volumetric_fog_history,
            &mut self.local_shadowed_light_scattering,
            &mut self.half_res_depth,
            &mut self.temporal_ssr,
            &mut self.temporal_aa,
        ]
    }

    fn release_optional(&mut self, pool: &RenderTargetPool) {
        for target in self.optional_targets() {
            target.release(pool);
        }
        self.last_eye_adaptation_time = None;
    }

    /// Drop all temporal history (camera cut, teleport)
    pub fn reset_history(&mut self, pool: &RenderTargetPool) {
        self.temporal_aa.release(pool);
        self.volumetric_fog_history.release(pool);
        self.luminance_map.release(pool);
        self.last_eye_adaptation_time = None;
        self.last_view_projection = None;
    }

    /// Release optional targets and custom buffers unused for
    /// [`LAZY_RELEASE_FRAMES`] frames
    pub fn release_unused_memory(
        &mut self,
        device: &mut dyn GpuDevice,
        pool: &RenderTargetPool,
        frame: u64,
    ) {
        let mut released = 0;
        for target in self.optional_targets() {
            if target.release_if_stale(pool, frame) {
                released += 1;
            }
        }

        self.custom_buffers.retain(|name, buffer| {
            let stale = frame.saturating_sub(buffer.last_frame_used()) >= LAZY_RELEASE_FRAMES;
            if stale {
                log::debug!("RenderBuffers: releasing custom buffer {name}");
                buffer.release(device, pool);
            }
            !stale
        });

        if released > 0 {
            log::trace!("RenderBuffers: released {released} unused targets");
        }
    }

    /// Take a named custom buffer out of the view, creating it on first use.
    /// Return it with [`put_custom_buffer`](Self::put_custom_buffer).
    pub fn take_custom_buffer<T: CustomBuffer + Default>(&mut self, name: &'static str) -> Box<T> {
        match self.custom_buffers.remove(name) {
            Some(buffer) => match buffer.into_any().downcast::<T>() {
                Ok(buffer) => buffer,
                Err(_) => {
                    log::error!("RenderBuffers: custom buffer {name} has a different type");
                    Box::default()
                }
            },
            None => Box::default(),
        }
    }

    pub fn put_custom_buffer(&mut self, name: &'static str, buffer: Box<dyn CustomBuffer>) {
        self.custom_buffers.insert(name, buffer);
    }

    pub fn has_custom_buffer(&self, name: &str) -> bool {
        self.custom_buffers.contains_key(name)
    }

    /// Move every custom buffer out, used to share state with a linked view
    pub fn take_custom_buffers(&mut self) -> HashMap<&'static str, Box<dyn CustomBuffer>> {
        std::mem::take(&mut self.custom_buffers)
    }

    pub fn restore_custom_buffers(&mut self, buffers: HashMap<&'static str, Box<dyn CustomBuffer>>) {
        self.custom_buffers.extend(buffers);
    }

    /// Release everything owned by the view
    pub fn release(&mut self, device: &mut dyn GpuDevice, pool: &RenderTargetPool) {
        self.release_optional(pool);
        for (_, mut buffer) in self.custom_buffers.drain() {
            buffer.release(device, pool);
        }
        self.destroy_persistent(device);
        self.width = 0;
        self.height = 0;
    }
}
