//! Pass tags and their declared resource accesses

use crate::render_graph::resource::*;

use FrameResource as R;
use ResourceUsage as U;

/// One stage of the frame, in driver order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PassKind {
    /// Environment probe and sky light capture work steps
    Probes,
    /// Surface atlas tile allocation and rasterization
    GlobalSurfaceAtlas,
    GBuffer,
    Decals,
    AmbientOcclusion,
    ShadowMaps,
    Lights,
    /// Direct lighting of the surface atlas
    SurfaceAtlasLighting,
    VolumetricFog,
    Fog,
    MotionVectors,
    DepthOfField,
    MotionBlur,
    TemporalAA,
    EyeAdaptation,
    ToneMapping,
}

/// Type of work a pass records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassType {
    /// Graphics render pass
    Graphics,
    /// Compute pass
    Compute,
    /// Mixed graphics and compute
    Mixed,
}

impl PassKind {
    pub const ALL: [PassKind; 16] = [
        PassKind::Probes,
        PassKind::GlobalSurfaceAtlas,
        PassKind::GBuffer,
        PassKind::Decals,
        PassKind::AmbientOcclusion,
        PassKind::ShadowMaps,
        PassKind::Lights,
        PassKind::SurfaceAtlasLighting,
        PassKind::VolumetricFog,
        PassKind::Fog,
        PassKind::MotionVectors,
        PassKind::DepthOfField,
        PassKind::MotionBlur,
        PassKind::TemporalAA,
        PassKind::EyeAdaptation,
        PassKind::ToneMapping,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PassKind::Probes => "Probes",
            PassKind::GlobalSurfaceAtlas => "GlobalSurfaceAtlas",
            PassKind::GBuffer => "GBuffer",
            PassKind::Decals => "Decals",
            PassKind::AmbientOcclusion => "AmbientOcclusion",
            PassKind::ShadowMaps => "ShadowMaps",
            PassKind::Lights => "Lights",
            PassKind::SurfaceAtlasLighting => "SurfaceAtlasLighting",
            PassKind::VolumetricFog => "VolumetricFog",
            PassKind::Fog => "Fog",
            PassKind::MotionVectors => "MotionVectors",
            PassKind::DepthOfField => "DepthOfField",
            PassKind::MotionBlur => "MotionBlur",
            PassKind::TemporalAA => "TemporalAA",
            PassKind::EyeAdaptation => "EyeAdaptation",
            PassKind::ToneMapping => "ToneMapping",
        }
    }

    pub fn pass_type(self) -> PassType {
        match self {
            PassKind::VolumetricFog => PassType::Compute,
            PassKind::AmbientOcclusion
            | PassKind::GlobalSurfaceAtlas
            | PassKind::EyeAdaptation
            | PassKind::DepthOfField => PassType::Mixed,
            _ => PassType::Graphics,
        }
    }

    /// Resources the pass reads and writes
    pub fn accesses(self) -> &'static [ResourceAccess] {
        const fn a(resource: FrameResource, usage: ResourceUsage) -> ResourceAccess {
            ResourceAccess::new(resource, usage)
        }

        match self {
            PassKind::Probes => const { &[a(R::ProbeCubes, U::CopyDst)] },
            PassKind::GlobalSurfaceAtlas => const { &[a(R::SurfaceAtlas, U::RenderTarget)] },
            PassKind::GBuffer => const { &[
                a(R::Depth, U::DepthStencilWrite),
                a(R::GBuffer0, U::RenderTarget),
                a(R::GBuffer1, U::RenderTarget),
                a(R::GBuffer2, U::RenderTarget),
                a(R::GBuffer3, U::RenderTarget),
                a(R::LightBuffer, U::RenderTarget),
                a(R::ProbeCubes, U::TextureRead),
            ] },
            PassKind::Decals => const { &[
                a(R::Depth, U::TextureRead),
                a(R::GBuffer0, U::RenderTargetBlend),
                a(R::GBuffer1, U::RenderTargetBlend),
                a(R::GBuffer2, U::RenderTargetBlend),
            ] },
            PassKind::AmbientOcclusion => const { &[
                a(R::Depth, U::TextureRead),
                a(R::GBuffer1, U::TextureRead),
                a(R::GBuffer2, U::RenderTargetBlend),
            ] },
            PassKind::ShadowMaps => const { &[a(R::ShadowMaps, U::DepthStencilWrite)] },
            PassKind::Lights => const { &[
                a(R::Depth, U::DepthStencilRead),
                a(R::GBuffer0, U::TextureRead),
                a(R::GBuffer1, U::TextureRead),
                a(R::GBuffer2, U::TextureRead),
                a(R::GBuffer3, U::TextureRead),
                a(R::ShadowMaps, U::TextureRead),
                a(R::ShadowMask, U::RenderTarget),
                a(R::LightBuffer, U::RenderTargetBlend),
            ] },
            PassKind::SurfaceAtlasLighting => const { &[
                a(R::ShadowMaps, U::TextureRead),
                a(R::SurfaceAtlas, U::RenderTargetBlend),
            ] },
            PassKind::VolumetricFog => const { &[
                a(R::Depth, U::TextureRead),
                a(R::ShadowMaps, U::TextureRead),
                a(R::FogHistory, U::StorageReadWrite),
                a(R::FogVolume, U::StorageWrite),
            ] },
            PassKind::Fog => const { &[
                a(R::Depth, U::TextureRead),
                a(R::FogVolume, U::TextureRead),
                a(R::LightBuffer, U::RenderTargetBlend),
            ] },
            PassKind::MotionVectors => const { &[
                a(R::Depth, U::TextureRead),
                a(R::MotionVectors, U::RenderTarget),
            ] },
            PassKind::DepthOfField => const { &[
                a(R::Depth, U::TextureRead),
                a(R::LightBuffer, U::RenderTargetBlend),
            ] },
            PassKind::MotionBlur => const { &[
                a(R::Depth, U::TextureRead),
                a(R::MotionVectors, U::TextureRead),
                a(R::LightBuffer, U::RenderTargetBlend),
            ] },
            PassKind::TemporalAA => const { &[
                a(R::Depth, U::TextureRead),
                a(R::MotionVectors, U::TextureRead),
                a(R::TaaHistory, U::StorageReadWrite),
                a(R::LightBuffer, U::RenderTargetBlend),
            ] },
            PassKind::EyeAdaptation => const { &[
                a(R::LightBuffer, U::RenderTargetBlend),
                a(R::Luminance, U::StorageReadWrite),
            ] },
            PassKind::ToneMapping => const { &[
                a(R::LightBuffer, U::TextureRead),
                a(R::Luminance, U::TextureRead),
                a(R::ColorBuffer, U::RenderTarget),
            ] },
        }
    }
}

/// Metadata about a pass in the plan
#[derive(Debug, Clone)]
pub struct PassNode {
    pub kind: PassKind,
    pub pass_type: PassType,
    pub inputs: Vec<ResourceAccess>,
    pub outputs: Vec<ResourceAccess>,
}

impl PassNode {
    pub fn new(kind: PassKind) -> Self {
        let accesses = kind.accesses();
        Self {
            kind,
            pass_type: kind.pass_type(),
            inputs: accesses.iter().filter(|a| a.is_read()).copied().collect(),
            outputs: accesses.iter().filter(|a| a.is_write()).copied().collect(),
        }
    }

    pub fn reads_resource(&self, resource: FrameResource) -> bool {
        self.inputs.iter().any(|a| a.resource == resource)
    }

    pub fn writes_resource(&self, resource: FrameResource) -> bool {
        self.outputs.iter().any(|a| a.resource == resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lights_blend_into_light_buffer() {
        let node = PassNode::new(PassKind::Lights);
        assert!(node.reads_resource(FrameResource::LightBuffer));
        assert!(node.writes_resource(FrameResource::LightBuffer));
        assert!(node.reads_resource(FrameResource::GBuffer3));
        assert!(!node.writes_resource(FrameResource::Depth));
    }

    #[test]
    fn test_all_has_unique_names() {
        let mut names: Vec<_> = PassKind::ALL.iter().map(|k| k.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), PassKind::ALL.len());
    }
}
