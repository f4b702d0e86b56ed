//! Shader asset references
//!
//! Shader compilation and loading live outside the renderer. The library
//! only tracks what the pipeline needs to know: whether a shader asset is
//! ready, and the constant buffer sizes its reflection declares, which
//! passes compare against their CPU-side structs.

use std::collections::HashMap;

use crate::error::{RenderError, RenderResult};

/// Loading state of a shader asset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderState {
    Loading,
    Ready,
    Failed,
}

/// A shader asset as seen by the renderer
#[derive(Debug, Clone)]
pub struct ShaderAsset {
    pub name: String,
    pub state: ShaderState,
    /// Declared constant buffer sizes in bytes, indexed by slot
    pub constant_buffers: Vec<usize>,
    /// Bumped on every reload
    pub version: u32,
}

impl ShaderAsset {
    pub fn is_ready(&self) -> bool {
        self.state == ShaderState::Ready
    }

    /// Verify the shader declares `expected` bytes at constant buffer `slot`
    pub fn check_cb(&self, slot: u32, expected: usize) -> RenderResult<()> {
        let actual = self.constant_buffers.get(slot as usize).copied().unwrap_or(0);
        if actual != expected {
            return Err(RenderError::ConstantBufferSizeMismatch {
                shader: self.name.clone(),
                slot,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Shader assets by name
#[derive(Debug, Default)]
pub struct ShaderLibrary {
    shaders: HashMap<String, ShaderAsset>,
    pending_reloads: Vec<String>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loaded shader
    pub fn register(&mut self, name: &str, constant_buffers: &[usize]) {
        self.insert(name, constant_buffers, ShaderState::Ready);
    }

    /// Register a shader whose asset is still loading
    pub fn register_loading(&mut self, name: &str, constant_buffers: &[usize]) {
        self.insert(name, constant_buffers, ShaderState::Loading);
    }

    fn insert(&mut self, name: &str, constant_buffers: &[usize], state: ShaderState) {
        self.shaders.insert(
            name.to_string(),
            ShaderAsset {
                name: name.to_string(),
                state,
                constant_buffers: constant_buffers.to_vec(),
                version: 0,
            },
        );
    }

    pub fn set_state(&mut self, name: &str, state: ShaderState) {
        if let Some(shader) = self.shaders.get_mut(name) {
            shader.state = state;
        }
    }

    pub fn get(&self, name: &str) -> Option<&ShaderAsset> {
        self.shaders.get(name)
    }

    /// Get a shader that is ready for pipeline creation
    pub fn require(&self, name: &str) -> RenderResult<&ShaderAsset> {
        match self.shaders.get(name) {
            Some(shader) if shader.is_ready() => Ok(shader),
            _ => Err(RenderError::ShaderNotReady(name.to_string())),
        }
    }

    /// Mark a shader as reloaded; passes using it drop their pipeline states
    pub fn reload(&mut self, name: &str, constant_buffers: Option<&[usize]>) {
        let Some(shader) = self.shaders.get_mut(name) else {
            log::warn!("ShaderLibrary: reload of unknown shader {name}");
            return;
        };
        shader.version += 1;
        if let Some(sizes) = constant_buffers {
            shader.constant_buffers = sizes.to_vec();
        }
        self.pending_reloads.push(name.to_string());
    }

    /// Drain shaders reloaded since the last call
    pub fn take_reloads(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_reloads)
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loading_shader_is_not_ready() {
        let mut library = ShaderLibrary::new();
        library.register_loading("Shaders/Fog", &[64]);
        assert!(matches!(
            library.require("Shaders/Fog"),
            Err(RenderError::ShaderNotReady(_))
        ));

        library.set_state("Shaders/Fog", ShaderState::Ready);
        assert!(library.require("Shaders/Fog").is_ok());
    }

    #[test]
    fn test_cb_size_check() {
        let mut library = ShaderLibrary::new();
        library.register("Shaders/TAA", &[48]);
        let shader = library.require("Shaders/TAA").unwrap();
        assert!(shader.check_cb(0, 48).is_ok());
        assert!(matches!(
            shader.check_cb(0, 64),
            Err(RenderError::ConstantBufferSizeMismatch { expected: 64, actual: 48, .. })
        ));
        assert!(shader.check_cb(1, 16).is_err());
    }

    #[test]
    fn test_reload_queues_notification() {
        let mut library = ShaderLibrary::new();
        library.register("Shaders/Lights", &[128]);
        library.reload("Shaders/Lights", None);
        assert_eq!(library.get("Shaders/Lights").unwrap().version, 1);
        assert_eq!(library.take_reloads(), vec!["Shaders/Lights".to_string()]);
        assert!(library.take_reloads().is_empty());
    }
}
