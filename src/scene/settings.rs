//! Post-processing settings snapshot
//!
//! Every block deserializes with defaults for missing fields, so a partial
//! TOML table is a valid override.

use serde::{Deserialize, Serialize};

/// Effect quality level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

impl Quality {
    pub fn index(self) -> u32 {
        self as u32
    }
}

/// Resolution of an intermediate target relative to the view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResolutionMode {
    #[default]
    Full,
    Half,
    Quarter,
}

impl ResolutionMode {
    pub fn divisor(self) -> u32 {
        match self {
            ResolutionMode::Full => 1,
            ResolutionMode::Half => 2,
            ResolutionMode::Quarter => 4,
        }
    }

    pub fn apply(self, width: u32, height: u32) -> (u32, u32) {
        let d = self.divisor();
        ((width / d).max(1), (height / d).max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbientOcclusionSettings {
    pub enabled: bool,
    pub intensity: f32,
    pub power: f32,
    /// World-space sampling radius
    pub radius: f32,
    /// View distance where the effect is fully faded out
    pub fade_out_distance: f32,
    /// Length of the fade before `fade_out_distance`
    pub fade_distance: f32,
    pub quality: Quality,
}

impl Default for AmbientOcclusionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            intensity: 0.8,
            power: 0.75,
            radius: 0.7,
            fade_out_distance: 5000.0,
            fade_distance: 500.0,
            quality: Quality::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalIlluminationSettings {
    /// Maintain the global surface atlas
    pub enabled: bool,
    pub intensity: f32,
}

impl Default for GlobalIlluminationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            intensity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowsSettings {
    pub quality: Quality,
    /// Upper bound for any light's shadows distance
    pub max_distance: f32,
    pub contact_shadows: bool,
}

impl Default for ShadowsSettings {
    fn default() -> Self {
        Self {
            quality: Quality::High,
            max_distance: 100_000.0,
            contact_shadows: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionBlurSettings {
    pub enabled: bool,
    pub scale: f32,
    pub sample_count: u32,
    pub motion_vectors_resolution: ResolutionMode,
}

impl Default for MotionBlurSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            scale: 1.0,
            sample_count: 10,
            motion_vectors_resolution: ResolutionMode::Half,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BokehShape {
    #[default]
    Hexagon,
    Octagon,
    Circle,
    Cross,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthOfFieldSettings {
    pub enabled: bool,
    pub focal_distance: f32,
    pub focal_region: f32,
    pub near_transition_range: f32,
    pub far_transition_range: f32,
    pub blur_strength: f32,
    /// Pixels farther than this are not blurred, 0 disables the limit
    pub depth_limit: f32,
    pub bokeh_enabled: bool,
    pub bokeh_size: f32,
    pub bokeh_shape: BokehShape,
    pub bokeh_brightness: f32,
    pub bokeh_brightness_threshold: f32,
    pub bokeh_blur_threshold: f32,
    pub bokeh_falloff: f32,
    pub bokeh_depth_cutoff: f32,
}

impl Default for DepthOfFieldSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            focal_distance: 1700.0,
            focal_region: 3000.0,
            near_transition_range: 300.0,
            far_transition_range: 500.0,
            blur_strength: 1.0,
            depth_limit: 0.0,
            bokeh_enabled: true,
            bokeh_size: 25.0,
            bokeh_shape: BokehShape::Octagon,
            bokeh_brightness: 1.0,
            bokeh_brightness_threshold: 3.0,
            bokeh_blur_threshold: 0.05,
            bokeh_falloff: 0.5,
            bokeh_depth_cutoff: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AntialiasingMode {
    None,
    #[default]
    TemporalAntialiasing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiAliasingSettings {
    pub mode: AntialiasingMode,
    pub taa_sharpness: f32,
    pub taa_stationary_blending: f32,
    pub taa_motion_blending: f32,
    pub taa_jitter_spread: f32,
}

impl Default for AntiAliasingSettings {
    fn default() -> Self {
        Self {
            mode: AntialiasingMode::TemporalAntialiasing,
            taa_sharpness: 0.1,
            taa_stationary_blending: 0.95,
            taa_motion_blending: 0.85,
            taa_jitter_spread: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EyeAdaptationMode {
    None,
    Manual,
    #[default]
    AutomaticHistogram,
    AutomaticAverageLuminance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EyeAdaptationSettings {
    pub mode: EyeAdaptationMode,
    /// Adaptation speed when the scene gets brighter
    pub speed_up: f32,
    /// Adaptation speed when the scene gets darker
    pub speed_down: f32,
    /// Exposure bias in EV applied in every mode
    pub pre_exposure: f32,
    pub min_brightness: f32,
    pub max_brightness: f32,
    pub histogram_low_percent: f32,
    pub histogram_high_percent: f32,
}

impl Default for EyeAdaptationSettings {
    fn default() -> Self {
        Self {
            mode: EyeAdaptationMode::AutomaticHistogram,
            speed_up: 3.0,
            speed_down: 1.0,
            pre_exposure: 0.0,
            min_brightness: 0.03,
            max_brightness: 15.0,
            histogram_low_percent: 70.0,
            histogram_high_percent: 98.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ToneMappingOperator {
    None,
    Reinhard,
    #[default]
    Aces,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneMappingSettings {
    pub operator: ToneMappingOperator,
    pub exposure: f32,
    pub white_point: f32,
}

impl Default for ToneMappingSettings {
    fn default() -> Self {
        Self {
            operator: ToneMappingOperator::Aces,
            exposure: 0.0,
            white_point: 4.0,
        }
    }
}

/// All post-processing blocks for one view
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessSettings {
    pub ambient_occlusion: AmbientOcclusionSettings,
    pub global_illumination: GlobalIlluminationSettings,
    pub shadows: ShadowsSettings,
    pub motion_blur: MotionBlurSettings,
    pub depth_of_field: DepthOfFieldSettings,
    pub anti_aliasing: AntiAliasingSettings,
    pub eye_adaptation: EyeAdaptationSettings,
    pub tone_mapping: ToneMappingSettings,
}

impl PostProcessSettings {
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }
}
