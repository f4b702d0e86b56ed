//! Post-processing effects

pub mod tonemapping;

pub use tonemapping::{aces_tonemap, reinhard_tonemap, tonemap, ToneMappingPass};

use crate::resources::ShaderLibrary;

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    tonemapping::register_shaders(library);
}
