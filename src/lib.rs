//! Deferred Renderer - a deferred shading pipeline over an abstract GPU layer
//!
//! The renderer turns a scene's drawables and lights into a tone mapped image:
//! - G-Buffer fill, decals and ambient occlusion
//! - Cascaded and cube shadow maps, deferred light accumulation
//! - Froxel volumetric fog, height fog
//! - Global surface atlas for GI, environment probe capture
//! - Motion blur, depth of field, TAA, eye adaptation and tone mapping
//!
//! Passes record into a [`backend::GpuContext`]. The crate ships a recording
//! backend that stores commands as values, used by the tests and the demo.
//! Scene actors live in a Bevy ECS world.

pub mod backend;
pub mod error;
pub mod pipeline;
pub mod probes;
pub mod render_graph;
pub mod renderer;
pub mod resources;
pub mod scene;

// Re-export Bevy ECS prelude for users
pub use bevy_ecs::prelude::*;

pub use error::{RenderError, RenderResult};
pub use renderer::{FrameReport, Renderer};

use serde::{Deserialize, Serialize};

use pipeline::global_surface_atlas::{DEFAULT_RESOLUTION, DEFAULT_WORLD_RADIUS};
use pipeline::volumetric_fog::ZDistribution;
use probes::ProbesConfig;
use scene::{Quality, ViewFlags};

/// Configuration for creating a [`Renderer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Surface atlas texture size in pixels
    pub surface_atlas_resolution: u32,
    /// Objects farther than this from the view stay out of the surface atlas
    pub surface_atlas_world_radius: f32,
    /// Upper bound for the shadows quality requested by post-process settings
    pub max_shadow_quality: Quality,
    pub volumetric_fog_quality: Quality,
    pub volumetric_fog_distribution: ZDistribution,
    /// Flags given to views created with [`Renderer::new_view`]
    pub default_view_flags: ViewFlags,
    /// Frames a free pooled texture survives before it is destroyed
    pub pool_keep_frames: u64,
    pub probes: ProbesConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            surface_atlas_resolution: DEFAULT_RESOLUTION,
            surface_atlas_world_radius: DEFAULT_WORLD_RADIUS,
            max_shadow_quality: Quality::Ultra,
            volumetric_fog_quality: Quality::High,
            volumetric_fog_distribution: ZDistribution::Logarithmic,
            default_view_flags: ViewFlags::DEFAULT_GAME,
            pool_keep_frames: 10,
            probes: ProbesConfig::default(),
        }
    }
}

impl RendererConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}
