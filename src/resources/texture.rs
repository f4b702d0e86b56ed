//! CPU-side texture payloads

use crate::backend::types::*;

/// Texture contents read back from (or destined for) the GPU.
///
/// Subresources are stored slice-major: every mip of slice 0, then every
/// mip of slice 1, and so on.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
}

impl TextureData {
    /// Zero-filled payload matching a descriptor
    pub fn zeroed(name: &str, desc: &TextureDescriptor) -> Self {
        let mut texture = Self {
            name: name.to_string(),
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
            array_size: desc.array_size,
            mip_levels: desc.mip_levels,
            format: desc.format,
            data: Vec::new(),
        };
        texture.data = vec![0; texture.total_size()];
        texture
    }

    /// Create a solid color 2D texture
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            name: name.to_string(),
            width: 1,
            height: 1,
            depth: 1,
            array_size: 1,
            mip_levels: 1,
            format: TextureFormat::Rgba8Unorm,
            data: color.to_vec(),
        }
    }

    pub fn is_cube(&self) -> bool {
        self.array_size == 6 && self.width == self.height
    }

    /// Bytes used by one mip of one slice
    pub fn mip_size(&self, mip: u32) -> usize {
        let width = (self.width >> mip).max(1);
        let height = (self.height >> mip).max(1);
        let depth = (self.depth >> mip).max(1);
        (width * height * depth * self.format.bytes_per_pixel()) as usize
    }

    /// Bytes used by every mip of one slice
    pub fn slice_size(&self) -> usize {
        (0..self.mip_levels).map(|mip| self.mip_size(mip)).sum()
    }

    pub fn total_size(&self) -> usize {
        self.slice_size() * self.array_size as usize
    }

    /// Raw bytes of one subresource
    pub fn subresource(&self, slice: u32, mip: u32) -> Option<&[u8]> {
        if slice >= self.array_size || mip >= self.mip_levels {
            return None;
        }
        let offset = self.slice_size() * slice as usize
            + (0..mip).map(|m| self.mip_size(m)).sum::<usize>();
        self.data.get(offset..offset + self.mip_size(mip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_cube_layout() {
        let desc = TextureDescriptor::new_cube(
            8,
            TextureFormat::Rgba16Float,
            TextureFlags::SHADER_RESOURCE,
            4,
        );
        let data = TextureData::zeroed("Probe", &desc);
        assert!(data.is_cube());
        // 8x8 + 4x4 + 2x2 + 1x1 texels, 8 bytes each
        assert_eq!(data.slice_size(), (64 + 16 + 4 + 1) * 8);
        assert_eq!(data.total_size(), data.slice_size() * 6);
        assert_eq!(data.subresource(5, 3).map(<[u8]>::len), Some(8));
        assert!(data.subresource(6, 0).is_none());
    }
}
