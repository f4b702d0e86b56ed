//! Render target pool
//!
//! Transient GPU textures keyed by their full [`TextureDescriptor`]. Passes
//! `get` a texture for the duration of their work and `release` it back;
//! released textures wait on a per-descriptor free list and are reused by
//! the next request with an identical descriptor.
//!
//! Textures are never destroyed on release. [`RenderTargetPool::flush`]
//! destroys free entries that have been idle for a number of frames, which
//! bounds memory after resolution changes or effect toggles.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Frames a free texture may stay unused before a regular flush destroys it.
pub const DEFAULT_KEEP_FRAMES: u64 = 4;

/// A free texture waiting for reuse.
#[derive(Debug, Clone, Copy)]
struct FreeEntry {
    texture: GpuTexture,
    last_frame_released: u64,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Textures created on a free-list miss
    pub allocations: u64,
    /// Requests served from a free list
    pub reuses: u64,
    /// Textures destroyed by flushes
    pub destroyed: u64,
    /// Number of `flush` calls
    pub flushes: u64,
    /// Textures currently handed out
    pub in_use: usize,
    /// Textures currently waiting on free lists
    pub free: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    free: HashMap<TextureDescriptor, Vec<FreeEntry>>,
    in_use: HashMap<TextureHandle, TextureDescriptor>,
    frame_index: u64,
    stats: PoolStats,
}

/// Process-wide pool of transient render targets.
///
/// Access is serialized by an internal lock, so a shared reference is all
/// a pass needs.
#[derive(Debug, Default)]
pub struct RenderTargetPool {
    state: Mutex<PoolState>,
}

impl RenderTargetPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the frame index used to stamp released textures
    pub fn set_frame(&self, frame_index: u64) {
        self.state.lock().frame_index = frame_index;
    }

    pub fn frame_index(&self) -> u64 {
        self.state.lock().frame_index
    }

    /// Get a texture matching `desc` exactly, allocating on a miss.
    pub fn get(
        &self,
        device: &mut dyn GpuDevice,
        name: &str,
        desc: &TextureDescriptor,
    ) -> BackendResult<GpuTexture> {
        let mut state = self.state.lock();

        let reused = state.free.get_mut(desc).and_then(|list| list.pop());
        let texture = match reused {
            Some(entry) => {
                state.stats.reuses += 1;
                entry.texture
            }
            None => {
                let texture = device.create_texture(name, desc)?;
                log::trace!(
                    "RenderTargetPool: allocated {name} {}x{} {:?}",
                    desc.width,
                    desc.height,
                    desc.format
                );
                state.stats.allocations += 1;
                texture
            }
        };

        debug_assert_eq!(texture.desc, *desc);
        state.in_use.insert(texture.handle, texture.desc);
        Ok(texture)
    }

    /// Return a texture to its descriptor's free list.
    ///
    /// Each texture obtained by [`get`](Self::get) must be released exactly once.
    pub fn release(&self, texture: GpuTexture) {
        let mut state = self.state.lock();
        if state.in_use.remove(&texture.handle).is_none() {
            debug_assert!(
                false,
                "RenderTargetPool: released {:?} which is not in use",
                texture.handle
            );
            log::error!(
                "RenderTargetPool: released {:?} which is not in use",
                texture.handle
            );
            return;
        }
        let frame = state.frame_index;
        state
            .free
            .entry(texture.desc)
            .or_default()
            .push(FreeEntry {
                texture,
                last_frame_released: frame,
            });
    }

    /// Release an optional texture slot, leaving it empty
    pub fn release_opt(&self, texture: &mut Option<GpuTexture>) {
        if let Some(texture) = texture.take() {
            self.release(texture);
        }
    }

    /// Destroy free textures idle for at least `keep_frames` frames.
    /// With `force`, every free texture is destroyed. Textures in use are
    /// never touched.
    pub fn flush(&self, device: &mut dyn GpuDevice, force: bool, keep_frames: u64) {
        let mut state = self.state.lock();
        let frame = state.frame_index;
        state.stats.flushes += 1;

        let mut destroyed = 0u64;
        state.free.retain(|_, list| {
            list.retain(|entry| {
                let idle = frame.saturating_sub(entry.last_frame_released);
                let keep = !force && idle < keep_frames;
                if !keep {
                    device.destroy_texture(entry.texture);
                    destroyed += 1;
                }
                keep
            });
            !list.is_empty()
        });
        state.stats.destroyed += destroyed;

        if destroyed > 0 {
            log::debug!("RenderTargetPool: flushed {destroyed} textures");
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            in_use: state.in_use.len(),
            free: state.free.values().map(Vec::len).sum(),
            ..state.stats
        }
    }

    pub fn is_in_use(&self, texture: &GpuTexture) -> bool {
        self.state.lock().in_use.contains_key(&texture.handle)
    }
}
