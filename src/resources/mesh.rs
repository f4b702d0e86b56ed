//! Mesh data structures and generation

use crate::backend::traits::*;
use crate::backend::types::*;
use glam::{Vec2, Vec3};

/// A mesh with vertex and index data
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    /// Calculate index count
    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Calculate triangle count
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Get vertex data as bytes
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Get index data as bytes
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Local-space bounding box `(min, max)`
    pub fn bounds(&self) -> (Vec3, Vec3) {
        self.vertices.iter().fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(min, max), v| (min.min(v.position), max.max(v.position)),
        )
    }

    /// Create a unit cube centered at origin
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");

        let faces = [
            (Vec3::Z, Vec3::X),
            (-Vec3::Z, -Vec3::X),
            (Vec3::X, -Vec3::Z),
            (-Vec3::X, Vec3::Z),
            (Vec3::Y, Vec3::X),
            (-Vec3::Y, Vec3::X),
        ];

        for (face, (normal, right)) in faces.into_iter().enumerate() {
            let up = normal.cross(right);
            let center = normal * 0.5;
            let corners = [
                (center - right * 0.5 - up * 0.5, Vec2::new(0.0, 1.0)),
                (center + right * 0.5 - up * 0.5, Vec2::new(1.0, 1.0)),
                (center + right * 0.5 + up * 0.5, Vec2::new(1.0, 0.0)),
                (center - right * 0.5 + up * 0.5, Vec2::new(0.0, 0.0)),
            ];
            for (position, uv) in corners {
                mesh.vertices.push(Vertex {
                    position,
                    normal,
                    uv,
                    tangent: right.extend(1.0),
                });
            }

            let base = face as u32 * 4;
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }

    /// Create a UV sphere of radius 1
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Mesh::new("sphere");

        let segment_angle = 2.0 * std::f32::consts::PI / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            let y = phi.cos();
            let ring_radius = phi.sin();

            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let x = ring_radius * theta.cos();
                let z = ring_radius * theta.sin();

                let normal = Vec3::new(x, y, z).normalize_or_zero();
                let uv = Vec2::new(segment as f32 / segments as f32, ring as f32 / rings as f32);
                let tangent = Vec3::new(-theta.sin(), 0.0, theta.cos());

                mesh.vertices.push(Vertex {
                    position: Vec3::new(x, y, z),
                    normal,
                    uv,
                    tangent: tangent.extend(1.0),
                });
            }
        }

        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;

                mesh.indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }

        mesh
    }
}

/// Scale that makes a tessellated unit sphere fully contain the true sphere
pub fn sphere_volume_scale(segments: u32, rings: u32) -> f32 {
    let steps = segments.min(rings * 2).max(3) as f32;
    1.0 / (std::f32::consts::PI / steps).cos()
}

/// Mesh uploaded to GPU buffers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuMesh {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
}

impl GpuMesh {
    /// Create vertex and index buffers for a mesh
    pub fn upload(device: &mut dyn GpuDevice, mesh: &Mesh) -> BackendResult<Self> {
        let vertex_bytes = mesh.vertex_bytes();
        let index_bytes = mesh.index_bytes();
        let vertex_buffer = device.create_buffer_init(
            &format!("{}.VB", mesh.name),
            &BufferDescriptor {
                size: vertex_bytes.len() as u64,
                stride: std::mem::size_of::<Vertex>() as u32,
                usage: BufferUsage::VERTEX,
            },
            vertex_bytes,
        )?;
        let index_buffer = match device.create_buffer_init(
            &format!("{}.IB", mesh.name),
            &BufferDescriptor {
                size: index_bytes.len() as u64,
                stride: 4,
                usage: BufferUsage::INDEX,
            },
            index_bytes,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.destroy_buffer(vertex_buffer);
                return Err(err);
            }
        };
        let (bounds_min, bounds_max) = mesh.bounds();

        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
            bounds_min,
            bounds_max,
        })
    }

    pub fn release(self, device: &mut dyn GpuDevice) {
        device.destroy_buffer(self.vertex_buffer);
        device.destroy_buffer(self.index_buffer);
    }

    /// Bind buffers and draw `instance_count` instances
    pub fn draw(&self, context: &mut dyn GpuContext, instance_count: u32) {
        context.bind_vb(&[self.vertex_buffer.handle]);
        context.bind_ib(self.index_buffer.handle);
        context.draw_indexed_instanced(self.index_count, instance_count, 0, 0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingDevice;

    #[test]
    fn test_cube_topology() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.triangle_count(), 12);
        let (min, max) = cube.bounds();
        assert!((min - Vec3::splat(-0.5)).length() < 1e-5);
        assert!((max - Vec3::splat(0.5)).length() < 1e-5);
    }

    #[test]
    fn test_sphere_is_unit_radius() {
        let sphere = Mesh::sphere(16, 8);
        for v in &sphere.vertices {
            assert!((v.position.length() - 1.0).abs() < 1e-4);
        }
        assert_eq!(sphere.index_count(), 16 * 8 * 6);
        assert!(sphere_volume_scale(16, 8) > 1.0);
    }

    #[test]
    fn test_upload_creates_two_buffers() {
        let mut device = RecordingDevice::new();
        let mesh = GpuMesh::upload(&mut device, &Mesh::cube()).unwrap();
        assert_eq!(device.live_buffer_count(), 2);
        assert_eq!(mesh.index_count, 36);
        mesh.release(&mut device);
        assert_eq!(device.live_buffer_count(), 0);
    }
}
