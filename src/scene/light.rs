//! Light render data
//!
//! Actors project themselves into these plain values at cull time. The
//! render list owns them for the duration of a frame.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::backend::GpuTexture;

/// How directional light cascades split the shadow distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PartitionMode {
    /// User supplied normalized spacings
    Manual,
    Logarithmic,
    /// Blend of uniform and logarithmic splits
    #[default]
    PSSM,
}

/// Shadow parameters shared by every light type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightShadowParams {
    /// 0 disables shadows
    pub strength: f32,
    /// Max view distance of the shadow
    pub distance: f32,
    /// Length of the fade before `distance`
    pub fade_distance: f32,
    pub sharpness: f32,
    pub normal_offset_scale: f32,
    pub depth_bias: f32,
    /// 0 disables contact shadows
    pub contact_shadows_length: f32,
}

impl Default for LightShadowParams {
    fn default() -> Self {
        Self {
            strength: 1.0,
            distance: 5000.0,
            fade_distance: 500.0,
            sharpness: 1.0,
            normal_offset_scale: 10.0,
            depth_bias: 0.005,
            contact_shadows_length: 0.0,
        }
    }
}

/// Fields common to every light
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderLightBase {
    /// Stable light identifier
    pub id: u32,
    pub color: Vec3,
    pub min_roughness: f32,
    pub volumetric_scattering_intensity: f32,
    pub cast_volumetric_shadow: bool,
    pub shadow: LightShadowParams,
    /// Index into the frame's shadow data, -1 when unshadowed
    pub shadow_data_index: i32,
    /// Projected screen size, filled by light setup
    pub screen_size: f32,
}

impl Default for RenderLightBase {
    fn default() -> Self {
        Self {
            id: 0,
            color: Vec3::ONE,
            min_roughness: 0.04,
            volumetric_scattering_intensity: 1.0,
            cast_volumetric_shadow: true,
            shadow: LightShadowParams::default(),
            shadow_data_index: -1,
            screen_size: 0.0,
        }
    }
}

impl RenderLightBase {
    pub fn casts_shadow(&self) -> bool {
        self.shadow.strength > crate::scene::EPSILON
    }

    pub fn has_shadow_data(&self) -> bool {
        self.shadow_data_index >= 0
    }

    /// Light ordering key: larger on screen first, then brighter, then id
    pub fn sort_key(&self) -> (std::cmp::Reverse<OrderedF32>, std::cmp::Reverse<OrderedF32>, u32) {
        let color_sum = self.color.x + self.color.y + self.color.z;
        (
            std::cmp::Reverse(OrderedF32(self.screen_size)),
            std::cmp::Reverse(OrderedF32(color_sum)),
            self.id,
        )
    }
}

/// Total order over f32 for sort keys
#[derive(Debug, Clone, Copy)]
pub struct OrderedF32(pub f32);

impl PartialEq for OrderedF32 {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == std::cmp::Ordering::Equal
    }
}

impl Eq for OrderedF32 {}

impl PartialOrd for OrderedF32 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF32 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderDirectionalLightData {
    pub base: RenderLightBase,
    pub direction: Vec3,
    /// 1..=4
    pub cascade_count: u32,
    pub partition_mode: PartitionMode,
    /// Normalized cascade ends for [`PartitionMode::Manual`]
    pub cascade_spacing: [f32; 4],
}

impl Default for RenderDirectionalLightData {
    fn default() -> Self {
        Self {
            base: RenderLightBase::default(),
            direction: Vec3::new(-0.5, -1.0, -0.5).normalize(),
            cascade_count: 4,
            partition_mode: PartitionMode::PSSM,
            cascade_spacing: [0.05, 0.15, 0.5, 1.0],
        }
    }
}

impl RenderDirectionalLightData {
    pub fn shader_data(&self) -> LightShaderData {
        LightShaderData {
            color: self.base.color,
            min_roughness: self.base.min_roughness,
            direction: self.direction,
            radius: 0.0,
            shadow_index: self.base.shadow_data_index as f32,
            contact_shadows_length: self.base.shadow.contact_shadows_length,
            ..LightShaderData::zeroed()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPointLightData {
    pub base: RenderLightBase,
    pub position: Vec3,
    pub radius: f32,
    pub falloff_exponent: f32,
    pub use_inverse_squared_falloff: bool,
    pub source_radius: f32,
    pub source_length: f32,
    pub ies_texture: Option<GpuTexture>,
}

impl Default for RenderPointLightData {
    fn default() -> Self {
        Self {
            base: RenderLightBase::default(),
            position: Vec3::ZERO,
            radius: 1000.0,
            falloff_exponent: 8.0,
            use_inverse_squared_falloff: false,
            source_radius: 0.0,
            source_length: 0.0,
            ies_texture: None,
        }
    }
}

impl RenderPointLightData {
    pub fn shader_data(&self) -> LightShaderData {
        LightShaderData {
            spot_angles: Vec2::new(-2.0, 1.0),
            source_radius: self.source_radius,
            source_length: self.source_length,
            color: self.base.color,
            min_roughness: self.base.min_roughness,
            position: self.position,
            shadow_index: self.base.shadow_data_index as f32,
            direction: Vec3::Z,
            radius: self.radius,
            falloff_exponent: self.falloff_exponent,
            inverse_squared: if self.use_inverse_squared_falloff { 1.0 } else { 0.0 },
            radius_inv: 1.0 / self.radius.max(crate::scene::EPSILON),
            contact_shadows_length: self.base.shadow.contact_shadows_length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSpotLightData {
    pub base: RenderLightBase,
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub radius: f32,
    /// Degrees
    pub outer_cone_angle: f32,
    /// Degrees
    pub inner_cone_angle: f32,
    pub falloff_exponent: f32,
    pub use_inverse_squared_falloff: bool,
    pub source_radius: f32,
    pub ies_texture: Option<GpuTexture>,
}

impl Default for RenderSpotLightData {
    fn default() -> Self {
        Self {
            base: RenderLightBase::default(),
            position: Vec3::ZERO,
            direction: Vec3::NEG_Y,
            up: Vec3::Z,
            radius: 1000.0,
            outer_cone_angle: 43.0,
            inner_cone_angle: 10.0,
            falloff_exponent: 8.0,
            use_inverse_squared_falloff: false,
            source_radius: 0.0,
            ies_texture: None,
        }
    }
}

impl RenderSpotLightData {
    /// `(cos(outer), 1 / (cos(inner) - cos(outer)))`
    pub fn cone_params(&self) -> Vec2 {
        let outer = self.outer_cone_angle.to_radians().cos();
        let inner = self.inner_cone_angle.min(self.outer_cone_angle).to_radians().cos();
        Vec2::new(outer, 1.0 / (inner - outer).max(1e-4))
    }

    pub fn shader_data(&self) -> LightShaderData {
        LightShaderData {
            spot_angles: self.cone_params(),
            source_radius: self.source_radius,
            source_length: 0.0,
            color: self.base.color,
            min_roughness: self.base.min_roughness,
            position: self.position,
            shadow_index: self.base.shadow_data_index as f32,
            direction: self.direction,
            radius: self.radius,
            falloff_exponent: self.falloff_exponent,
            inverse_squared: if self.use_inverse_squared_falloff { 1.0 } else { 0.0 },
            radius_inv: 1.0 / self.radius.max(crate::scene::EPSILON),
            contact_shadows_length: self.base.shadow.contact_shadows_length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSkyLightData {
    pub base: RenderLightBase,
    pub position: Vec3,
    pub radius: f32,
    /// Cube texture, either custom or captured
    pub image: Option<GpuTexture>,
    pub additive_color: Vec3,
    pub indirect_intensity: f32,
}

impl Default for RenderSkyLightData {
    fn default() -> Self {
        Self {
            base: RenderLightBase::default(),
            position: Vec3::ZERO,
            radius: 1_000_000.0,
            image: None,
            additive_color: Vec3::ZERO,
            indirect_intensity: 1.0,
        }
    }
}

impl RenderSkyLightData {
    pub fn shader_data(&self) -> LightShaderData {
        LightShaderData {
            color: self.base.color + self.additive_color,
            min_roughness: self.base.min_roughness,
            position: self.position,
            shadow_index: -1.0,
            radius: self.radius,
            radius_inv: 1.0 / self.radius.max(crate::scene::EPSILON),
            source_length: self.indirect_intensity,
            ..LightShaderData::zeroed()
        }
    }
}

/// Packed light constants as read by the lighting shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightShaderData {
    /// Spot: cos(outer), inverse cone range. Point: (-2, 1)
    pub spot_angles: Vec2,
    pub source_radius: f32,
    pub source_length: f32,
    pub color: Vec3,
    pub min_roughness: f32,
    pub position: Vec3,
    pub shadow_index: f32,
    pub direction: Vec3,
    pub radius: f32,
    pub falloff_exponent: f32,
    pub inverse_squared: f32,
    pub radius_inv: f32,
    pub contact_shadows_length: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_data_size() {
        assert_eq!(std::mem::size_of::<LightShaderData>(), 80);
    }

    #[test]
    fn test_sort_key_orders_large_lights_first() {
        let mut big = RenderLightBase {
            id: 7,
            screen_size: 0.8,
            ..Default::default()
        };
        let small = RenderLightBase {
            id: 1,
            screen_size: 0.1,
            ..Default::default()
        };
        assert!(big.sort_key() < small.sort_key());

        big.screen_size = 0.1;
        big.color = Vec3::splat(2.0);
        assert!(big.sort_key() < small.sort_key());
    }

    #[test]
    fn test_ordered_f32_equality_matches_ordering() {
        let values = [0.0, -0.0, 1.0, f32::NAN, -f32::NAN, f32::INFINITY];
        for a in values {
            for b in values {
                let (a, b) = (OrderedF32(a), OrderedF32(b));
                assert_eq!(a == b, a.cmp(&b) == std::cmp::Ordering::Equal, "{a:?} {b:?}");
            }
        }
        assert_ne!(OrderedF32(0.0), OrderedF32(-0.0));
        assert_eq!(OrderedF32(f32::NAN), OrderedF32(f32::NAN));
    }

    #[test]
    fn test_spot_cone_params() {
        let spot = RenderSpotLightData {
            outer_cone_angle: 60.0,
            inner_cone_angle: 0.0,
            ..Default::default()
        };
        let params = spot.cone_params();
        assert!((params.x - 0.5).abs() < 1e-5);
        assert!((params.y - 2.0).abs() < 1e-3);
    }
}
