//! Common types shared between the renderer and GPU backends

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Rgb10a2Unorm,
    Rg11b10Float,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    R32Uint,
    Rgba32Float,
    Depth16Unorm,
    Depth24PlusStencil8,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth16Unorm
                | TextureFormat::Depth24PlusStencil8
                | TextureFormat::Depth32Float
        )
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm | TextureFormat::R16Float | TextureFormat::Depth16Unorm => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Rgb10a2Unorm
            | TextureFormat::Rg11b10Float
            | TextureFormat::Rg16Float
            | TextureFormat::R32Float
            | TextureFormat::R32Uint
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

bitflags! {
    /// How a texture may be bound to the pipeline
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureFlags: u32 {
        const SHADER_RESOURCE = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const DEPTH_STENCIL = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        /// Depth target that can also be bound as a read-only shader resource
        const READ_ONLY_DEPTH_VIEW = 1 << 4;
        const PER_MIP_VIEWS = 1 << 5;
        const PER_SLICE_VIEWS = 1 << 6;
    }
}

bitflags! {
    /// Capabilities a device reports for a texture format
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FormatSupport: u32 {
        const DEPTH_STENCIL = 1 << 0;
        const SHADER_SAMPLE_COMPARISON = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const SHADER_SAMPLE = 1 << 3;
        const TYPED_UAV_LOAD = 1 << 4;
    }
}

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const CONSTANT = 1 << 0;
        const VERTEX = 1 << 1;
        const INDEX = 1 << 2;
        const STRUCTURED = 1 << 3;
        const TYPED = 1 << 4;
        const UNORDERED_ACCESS = 1 << 5;
        const ARGUMENT = 1 << 6;
        const APPEND = 1 << 7;
    }
}

/// Texture dimensionality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    Texture2D,
    Cube,
    Volume,
}

/// Texture descriptor.
///
/// Compared field-for-field (including mip count and flags), which makes it
/// usable as the render target pool key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    /// Depth of a volume texture, 1 otherwise
    pub depth: u32,
    /// Array slices (6 for a cube)
    pub array_size: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub flags: TextureFlags,
}

impl TextureDescriptor {
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, flags: TextureFlags) -> Self {
        Self {
            dimension: TextureDimension::Texture2D,
            width,
            height,
            depth: 1,
            array_size: 1,
            mip_levels: 1,
            format,
            flags,
        }
    }

    pub fn new_2d_array(
        width: u32,
        height: u32,
        array_size: u32,
        format: TextureFormat,
        flags: TextureFlags,
    ) -> Self {
        Self {
            array_size,
            ..Self::new_2d(width, height, format, flags)
        }
    }

    pub fn new_cube(size: u32, format: TextureFormat, flags: TextureFlags, mip_levels: u32) -> Self {
        Self {
            dimension: TextureDimension::Cube,
            width: size,
            height: size,
            depth: 1,
            array_size: 6,
            mip_levels,
            format,
            flags,
        }
    }

    pub fn new_volume(
        width: u32,
        height: u32,
        depth: u32,
        format: TextureFormat,
        flags: TextureFlags,
    ) -> Self {
        Self {
            dimension: TextureDimension::Volume,
            width,
            height,
            depth,
            array_size: 1,
            mip_levels: 1,
            format,
            flags,
        }
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Number of mips in a full chain down to 1x1
    pub fn full_mip_chain(width: u32, height: u32) -> u32 {
        32 - width.max(height).max(1).leading_zeros()
    }

    /// Size of the given mip level
    pub fn mip_size(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    pub fn is_depth(&self) -> bool {
        self.format.is_depth()
    }

    /// Total bytes of the top mip across all slices
    pub fn slice_pitch(&self) -> usize {
        (self.width * self.height * self.depth * self.format.bytes_per_pixel()) as usize
    }
}

/// Buffer descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub size: u64,
    /// Element stride for structured/typed buffers, 0 otherwise
    pub stride: u32,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn constant(size: usize) -> Self {
        Self {
            size: size as u64,
            stride: 0,
            usage: BufferUsage::CONSTANT,
        }
    }

    pub fn structured(element_count: u32, stride: u32, usage: BufferUsage) -> Self {
        Self {
            size: element_count as u64 * stride as u64,
            stride,
            usage: BufferUsage::STRUCTURED | usage,
        }
    }

    pub fn element_count(&self) -> u32 {
        if self.stride == 0 {
            0
        } else {
            (self.size / self.stride as u64) as u32
        }
    }
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

impl CullMode {
    /// Cull mode with the winding flipped (mirrored transforms, camera inside a volume)
    pub fn inverted(self) -> Self {
        match self {
            CullMode::None => CullMode::None,
            CullMode::Front => CullMode::Back,
            CullMode::Back => CullMode::Front,
        }
    }
}

/// Compare function for depth/stencil
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Output merger blending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Opaque,
    Additive,
    AlphaBlend,
    /// `dst * src`
    Multiply,
    /// `src + dst * srcAlpha`, used by premultiplied fog
    Premultiplied,
}

bitflags! {
    /// Color channel write mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWrites: u32 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const RGB = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits();
        const ALL = Self::RGB.bits() | Self::ALPHA.bits();
    }
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    TriangleList,
    LineList,
}

/// Graphics pipeline state: a shader permutation plus fixed-function state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineStateDescriptor {
    /// Shader asset name
    pub shader: String,
    /// Vertex shader entry point; `None` uses the built-in fullscreen triangle
    pub vertex_shader: Option<String>,
    /// Pixel shader entry point; `None` for depth-only states
    pub pixel_shader: Option<String>,
    /// Geometry shader entry point
    pub geometry_shader: Option<String>,
    pub permutation: u32,
    pub blend: BlendMode,
    pub write_mask: ColorWrites,
    pub depth_enable: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunction,
    pub cull_mode: CullMode,
    pub wireframe: bool,
    pub topology: PrimitiveTopology,
}

impl PipelineStateDescriptor {
    /// Fullscreen triangle post-process state with the given pixel shader
    pub fn fullscreen(shader: &str, pixel_shader: &str) -> Self {
        Self {
            shader: shader.to_string(),
            vertex_shader: None,
            pixel_shader: Some(pixel_shader.to_string()),
            geometry_shader: None,
            permutation: 0,
            blend: BlendMode::Opaque,
            write_mask: ColorWrites::ALL,
            depth_enable: false,
            depth_write: false,
            depth_func: CompareFunction::Always,
            cull_mode: CullMode::None,
            wireframe: false,
            topology: PrimitiveTopology::TriangleList,
        }
    }

    /// Mesh state with depth test and write enabled
    pub fn geometry(shader: &str, vertex_shader: &str, pixel_shader: Option<&str>) -> Self {
        Self {
            vertex_shader: Some(vertex_shader.to_string()),
            pixel_shader: pixel_shader.map(str::to_string),
            depth_enable: true,
            depth_write: true,
            depth_func: CompareFunction::Less,
            cull_mode: CullMode::Back,
            ..Self::fullscreen(shader, "")
        }
    }

    pub fn with_permutation(mut self, permutation: u32) -> Self {
        self.permutation = permutation;
        self
    }

    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_write_mask(mut self, mask: ColorWrites) -> Self {
        self.write_mask = mask;
        self
    }

    pub fn with_cull(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_depth(mut self, enable: bool, write: bool, func: CompareFunction) -> Self {
        self.depth_enable = enable;
        self.depth_write = write;
        self.depth_func = func;
        self
    }
}

/// Compute shader reference: asset name, kernel entry point and permutation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputeShaderDescriptor {
    pub shader: String,
    pub entry_point: String,
    pub permutation: u32,
}

impl ComputeShaderDescriptor {
    pub fn new(shader: &str, entry_point: &str) -> Self {
        Self {
            shader: shader.to_string(),
            entry_point: entry_point.to_string(),
            permutation: 0,
        }
    }

    pub fn with_permutation(mut self, permutation: u32) -> Self {
        self.permutation = permutation;
        self
    }
}

/// Viewport rectangle, also used as scissor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self::with_offset(0.0, 0.0, width, height)
    }

    pub fn with_offset(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(width as f32, height as f32)
    }
}

/// Linear RGBA color
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const TRANSPARENT: Color = Color::new(0.0, 0.0, 0.0, 0.0);
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Color = Color::new(1.0, 1.0, 1.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_vec4(self) -> Vec4 {
        Vec4::new(self.r, self.g, self.b, self.a)
    }
}

/// Standard vertex with position, normal, UV, and tangent
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec4,
}

/// Arguments of an indexed indirect draw, as laid out in an argument buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
pub struct DrawIndexedIndirectArgs {
    pub index_count_per_instance: u32,
    pub instance_count: u32,
    pub start_index_location: u32,
    pub base_vertex_location: i32,
    pub start_instance_location: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mip_chain() {
        assert_eq!(TextureDescriptor::full_mip_chain(1, 1), 1);
        assert_eq!(TextureDescriptor::full_mip_chain(256, 128), 9);
        assert_eq!(TextureDescriptor::full_mip_chain(1920, 1080), 11);
    }

    #[test]
    fn test_descriptor_equality_includes_mips_and_flags() {
        let a = TextureDescriptor::new_2d(
            64,
            64,
            TextureFormat::R16Float,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
        );
        assert_eq!(a, a.with_mips(1));
        assert_ne!(a, a.with_mips(4));

        let mut b = a;
        b.flags |= TextureFlags::PER_MIP_VIEWS;
        assert_ne!(a, b);
    }

    #[test]
    fn test_mip_size_clamps_to_one() {
        let desc = TextureDescriptor::new_2d(
            8,
            2,
            TextureFormat::Rgba8Unorm,
            TextureFlags::SHADER_RESOURCE,
        );
        assert_eq!(desc.mip_size(0), (8, 2));
        assert_eq!(desc.mip_size(2), (2, 1));
        assert_eq!(desc.mip_size(5), (1, 1));
    }

    #[test]
    fn test_cull_mode_inversion() {
        assert_eq!(CullMode::Back.inverted(), CullMode::Front);
        assert_eq!(CullMode::None.inverted(), CullMode::None);
    }
}
