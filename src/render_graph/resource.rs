//! Frame resources tracked by the pass plan

/// A GPU resource produced and consumed by passes within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrameResource {
    Depth,
    GBuffer0,
    GBuffer1,
    GBuffer2,
    GBuffer3,
    /// HDR scene color, starts as emissive + indirect and accumulates lights
    LightBuffer,
    ShadowMaps,
    ShadowMask,
    MotionVectors,
    /// Integrated volumetric fog 3D texture
    FogVolume,
    FogHistory,
    TaaHistory,
    /// Eye adaptation 1x1 luminance, kept across frames
    Luminance,
    SurfaceAtlas,
    ProbeCubes,
    /// Final tone mapped output
    ColorBuffer,
}

impl FrameResource {
    pub const GBUFFER: [FrameResource; 4] = [
        FrameResource::GBuffer0,
        FrameResource::GBuffer1,
        FrameResource::GBuffer2,
        FrameResource::GBuffer3,
    ];

    /// Resources whose content survives between frames. Reading them before
    /// the frame writes them sees the previous frame.
    pub fn is_persistent(self) -> bool {
        matches!(
            self,
            FrameResource::FogHistory
                | FrameResource::TaaHistory
                | FrameResource::Luminance
                | FrameResource::SurfaceAtlas
                | FrameResource::ProbeCubes
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameResource::Depth => "Depth",
            FrameResource::GBuffer0 => "GBuffer0",
            FrameResource::GBuffer1 => "GBuffer1",
            FrameResource::GBuffer2 => "GBuffer2",
            FrameResource::GBuffer3 => "GBuffer3",
            FrameResource::LightBuffer => "LightBuffer",
            FrameResource::ShadowMaps => "ShadowMaps",
            FrameResource::ShadowMask => "ShadowMask",
            FrameResource::MotionVectors => "MotionVectors",
            FrameResource::FogVolume => "FogVolume",
            FrameResource::FogHistory => "FogHistory",
            FrameResource::TaaHistory => "TaaHistory",
            FrameResource::Luminance => "Luminance",
            FrameResource::SurfaceAtlas => "SurfaceAtlas",
            FrameResource::ProbeCubes => "ProbeCubes",
            FrameResource::ColorBuffer => "ColorBuffer",
        }
    }
}

/// How a pass uses a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceUsage {
    /// Read as a texture (sampled)
    TextureRead,
    /// Write as a render target
    RenderTarget,
    /// Blend into a render target, reads the existing content
    RenderTargetBlend,
    StorageRead,
    StorageWrite,
    StorageReadWrite,
    DepthStencilRead,
    DepthStencilWrite,
    /// Copy destination
    CopyDst,
}

/// Resource access declaration for a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceAccess {
    pub resource: FrameResource,
    pub usage: ResourceUsage,
}

impl ResourceAccess {
    pub const fn new(resource: FrameResource, usage: ResourceUsage) -> Self {
        Self { resource, usage }
    }

    pub fn is_read(&self) -> bool {
        matches!(
            self.usage,
            ResourceUsage::TextureRead
                | ResourceUsage::RenderTargetBlend
                | ResourceUsage::StorageRead
                | ResourceUsage::StorageReadWrite
                | ResourceUsage::DepthStencilRead
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.usage,
            ResourceUsage::RenderTarget
                | ResourceUsage::RenderTargetBlend
                | ResourceUsage::StorageWrite
                | ResourceUsage::StorageReadWrite
                | ResourceUsage::DepthStencilWrite
                | ResourceUsage::CopyDst
        )
    }
}
