//! View frustum planes and corners

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};

/// Frustum as six inward-facing planes `(normal, d)`, `dot(n, p) + d >= 0` inside
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub planes: [Vec4; 6],
    inverse: Mat4,
}

impl Default for Frustum {
    fn default() -> Self {
        Self::from_matrix(Mat4::IDENTITY)
    }
}

impl Frustum {
    pub const LEFT: usize = 0;
    pub const RIGHT: usize = 1;
    pub const BOTTOM: usize = 2;
    pub const TOP: usize = 3;
    pub const NEAR: usize = 4;
    pub const FAR: usize = 5;

    /// Extract planes from a view-projection matrix with 0..1 clip depth
    pub fn from_matrix(view_projection: Mat4) -> Self {
        let r0 = view_projection.row(0);
        let r1 = view_projection.row(1);
        let r2 = view_projection.row(2);
        let r3 = view_projection.row(3);

        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(normalize_plane);
        Self {
            planes,
            inverse: view_projection.inverse(),
        }
    }

    /// World-space corners: near plane (TL, TR, BR, BL) then far plane in the same order
    pub fn corners(&self) -> [Vec3; 8] {
        const NDC: [(f32, f32); 4] = [(-1.0, 1.0), (1.0, 1.0), (1.0, -1.0), (-1.0, -1.0)];
        let mut corners = [Vec3::ZERO; 8];
        for (z_index, z) in [0.0f32, 1.0].into_iter().enumerate() {
            for (i, (x, y)) in NDC.iter().enumerate() {
                corners[z_index * 4 + i] = self.inverse.project_point3(Vec3::new(*x, *y, z));
            }
        }
        corners
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.xyz().dot(point) + plane.w >= 0.0)
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.xyz().dot(center) + plane.w >= -radius)
    }

    /// Axis-aligned box test using the positive vertex of each plane
    pub fn intersects_box(&self, min: Vec3, max: Vec3) -> bool {
        self.planes.iter().all(|plane| {
            let normal = plane.xyz();
            let positive = Vec3::select(normal.cmpge(Vec3::ZERO), max, min);
            normal.dot(positive) + plane.w >= 0.0
        })
    }
}

fn normalize_plane(plane: Vec4) -> Vec4 {
    let length = plane.xyz().length();
    if length > f32::EPSILON {
        plane / length
    } else {
        plane
    }
}
