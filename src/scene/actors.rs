//! Actor components
//!
//! The thin actor layer feeding the renderer. Position and orientation come
//! from the [`Transform`](crate::scene::Transform) on the same entity.

use std::sync::Arc;

use bevy_ecs::prelude::*;
use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::backend::GpuTexture;
use crate::resources::{GpuMesh, TextureData};
use crate::scene::light::{LightShadowParams, PartitionMode};
use crate::scene::render_list::{MaterialInfo, VolumetricFogOptions};
use crate::scene::settings::PostProcessSettings;
use crate::scene::view::{DrawPass, StaticFlags};

/// A mesh with a material
#[derive(Component, Debug, Clone, Copy)]
pub struct StaticModel {
    pub mesh: GpuMesh,
    pub material: MaterialInfo,
    pub static_flags: StaticFlags,
    pub draw_modes: DrawPass,
    /// Render layer index, 0..32
    pub layer: u32,
    pub casts_shadows: bool,
    /// Rasterized into the global surface atlas
    pub surface_atlas: bool,
}

impl StaticModel {
    pub fn new(mesh: GpuMesh, material: MaterialInfo) -> Self {
        Self {
            mesh,
            material,
            static_flags: StaticFlags::FULLY_STATIC,
            draw_modes: DrawPass::DEFAULT | DrawPass::GLOBAL_SURFACE_ATLAS,
            layer: 0,
            casts_shadows: true,
            surface_atlas: true,
        }
    }

    pub fn dynamic(mut self) -> Self {
        self.static_flags = StaticFlags::empty();
        self
    }

    pub fn layer_mask(&self) -> u32 {
        1u32.checked_shl(self.layer).unwrap_or(0)
    }

    pub fn is_static(&self) -> bool {
        self.static_flags.contains(StaticFlags::TRANSFORM)
    }
}

#[derive(Component, Debug, Clone, Copy)]
pub struct DirectionalLight {
    pub color: Vec3,
    pub brightness: f32,
    pub shadow: LightShadowParams,
    pub cascade_count: u32,
    pub partition_mode: PartitionMode,
    pub cascade_spacing: [f32; 4],
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            brightness: 1.0,
            shadow: LightShadowParams::default(),
            cascade_count: 4,
            partition_mode: PartitionMode::PSSM,
            cascade_spacing: [0.05, 0.15, 0.5, 1.0],
        }
    }
}

#[derive(Component, Debug, Clone, Copy)]
pub struct PointLight {
    pub color: Vec3,
    pub brightness: f32,
    pub radius: f32,
    pub falloff_exponent: f32,
    pub use_inverse_squared_falloff: bool,
    pub source_radius: f32,
    pub source_length: f32,
    pub shadow: LightShadowParams,
    pub ies_texture: Option<GpuTexture>,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            brightness: 1.0,
            radius: 1000.0,
            falloff_exponent: 8.0,
            use_inverse_squared_falloff: false,
            source_radius: 0.0,
            source_length: 0.0,
            shadow: LightShadowParams::default(),
            ies_texture: None,
        }
    }
}

#[derive(Component, Debug, Clone, Copy)]
pub struct SpotLight {
    pub color: Vec3,
    pub brightness: f32,
    pub radius: f32,
    /// Degrees
    pub outer_cone_angle: f32,
    /// Degrees
    pub inner_cone_angle: f32,
    pub falloff_exponent: f32,
    pub use_inverse_squared_falloff: bool,
    pub source_radius: f32,
    pub shadow: LightShadowParams,
    pub ies_texture: Option<GpuTexture>,
}

impl Default for SpotLight {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            brightness: 1.0,
            radius: 1000.0,
            outer_cone_angle: 43.0,
            inner_cone_angle: 10.0,
            falloff_exponent: 8.0,
            use_inverse_squared_falloff: false,
            source_radius: 0.0,
            shadow: LightShadowParams::default(),
            ies_texture: None,
        }
    }
}

/// Source of a sky light cube
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkyLightMode {
    /// Capture the scene with the probes renderer
    #[default]
    CaptureScene,
    CustomTexture,
}

#[derive(Component, Debug, Clone)]
pub struct SkyLight {
    pub color: Vec3,
    pub brightness: f32,
    pub radius: f32,
    pub additive_color: Vec3,
    pub indirect_intensity: f32,
    pub volumetric_scattering_intensity: f32,
    pub mode: SkyLightMode,
    pub custom_texture: Option<GpuTexture>,
    /// Result of the last capture
    pub captured_texture: Option<GpuTexture>,
    /// Downloaded capture, kept as the baked asset
    pub baked_data: Option<Arc<TextureData>>,
    pub capture_near_plane: f32,
}

impl Default for SkyLight {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            brightness: 1.0,
            radius: 1_000_000.0,
            additive_color: Vec3::ZERO,
            indirect_intensity: 1.0,
            volumetric_scattering_intensity: 1.0,
            mode: SkyLightMode::CaptureScene,
            custom_texture: None,
            captured_texture: None,
            baked_data: None,
            capture_near_plane: 10.0,
        }
    }
}

impl SkyLight {
    pub fn image(&self) -> Option<GpuTexture> {
        match self.mode {
            SkyLightMode::CaptureScene => self.captured_texture,
            SkyLightMode::CustomTexture => self.custom_texture,
        }
    }
}

/// When an environment probe re-captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProbeUpdateMode {
    /// Only on explicit bake requests
    #[default]
    Manual,
    WhenMoved,
    /// Every frame, GPU-to-GPU without download
    Realtime,
}

#[derive(Component, Debug, Clone)]
pub struct EnvironmentProbe {
    pub radius: f32,
    pub brightness: f32,
    /// Cube face size, 0 uses the renderer default
    pub resolution: u32,
    pub update_mode: ProbeUpdateMode,
    pub capture_near_plane: f32,
    pub texture: Option<GpuTexture>,
    pub baked_data: Option<Arc<TextureData>>,
}

impl Default for EnvironmentProbe {
    fn default() -> Self {
        Self {
            radius: 3000.0,
            brightness: 1.0,
            resolution: 0,
            update_mode: ProbeUpdateMode::Manual,
            capture_near_plane: 10.0,
            texture: None,
            baked_data: None,
        }
    }
}

#[derive(Component, Debug, Clone, Copy)]
pub struct ExponentialHeightFog {
    pub density: f32,
    pub height_falloff: f32,
    pub color: Vec3,
    pub start_distance: f32,
    pub max_opacity: f32,
    pub cutoff_distance: f32,
    pub volumetric: Option<VolumetricFogOptions>,
}

impl Default for ExponentialHeightFog {
    fn default() -> Self {
        Self {
            density: 0.02,
            height_falloff: 0.002,
            color: Vec3::new(0.448, 0.638, 1.0),
            start_distance: 0.0,
            max_opacity: 1.0,
            cutoff_distance: 0.0,
            volumetric: None,
        }
    }
}

/// Local fog volume injected into the froxel grid
#[derive(Component, Debug, Clone, Copy)]
pub struct FogParticle {
    pub radius: f32,
    pub material: MaterialInfo,
}

#[derive(Component, Debug, Clone, Copy)]
pub struct Decal {
    pub material: MaterialInfo,
    /// Box size before the transform scale
    pub size: Vec3,
    pub sort_order: i32,
}

/// Cube map drawn behind geometry
#[derive(Component, Debug, Clone, Copy)]
pub struct Sky {
    pub cube: Option<GpuTexture>,
    pub tint: Vec4,
}

/// Post-processing override applied when the view is inside
#[derive(Component, Debug, Clone)]
pub struct PostFxVolume {
    pub settings: PostProcessSettings,
    pub priority: i32,
    /// Box half extents around the transform position, `None` is unbounded
    pub half_extents: Option<Vec3>,
}

/// Capturable actor kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    EnvProbe,
    SkyLight,
}

/// What a probe capture needs to know about its actor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeCaptureInfo {
    pub kind: ProbeKind,
    pub position: Vec3,
    pub radius: f32,
    pub resolution: u32,
    pub capture_near_plane: f32,
    pub update_mode: ProbeUpdateMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_mask() {
        let mut model = StaticModel::new(
            GpuMesh {
                vertex_buffer: crate::backend::GpuBuffer {
                    handle: crate::backend::BufferHandle(0),
                    desc: crate::backend::BufferDescriptor::constant(16),
                },
                index_buffer: crate::backend::GpuBuffer {
                    handle: crate::backend::BufferHandle(1),
                    desc: crate::backend::BufferDescriptor::constant(16),
                },
                index_count: 3,
                bounds_min: Vec3::ZERO,
                bounds_max: Vec3::ONE,
            },
            MaterialInfo::default(),
        );
        assert_eq!(model.layer_mask(), 1);
        model.layer = 31;
        assert_eq!(model.layer_mask(), 1 << 31);
        model.layer = 40;
        assert_eq!(model.layer_mask(), 0);
        assert!(!model.dynamic().is_static());
    }
}
