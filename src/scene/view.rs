//! Render view: camera matrices, frustum and per-view feature flags

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::scene::frustum::Frustum;
use crate::scene::jitter;

bitflags! {
    /// Feature enable bits of a view
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ViewFlags: u32 {
        const AO = 1 << 0;
        const GI = 1 << 1;
        const DIRECTIONAL_LIGHTS = 1 << 2;
        const POINT_LIGHTS = 1 << 3;
        const SPOT_LIGHTS = 1 << 4;
        const SKY_LIGHTS = 1 << 5;
        const DECALS = 1 << 6;
        const SHADOWS = 1 << 7;
        const SKY = 1 << 8;
        const FOG = 1 << 9;
        const REFLECTIONS = 1 << 10;
        const DEPTH_OF_FIELD = 1 << 11;
        const MOTION_BLUR = 1 << 12;
        const EYE_ADAPTATION = 1 << 13;
        const SPECULAR_LIGHT = 1 << 14;
        const CONTACT_SHADOWS = 1 << 15;
        const ANTI_ALIASING = 1 << 16;
        const TONE_MAPPING = 1 << 17;

        const LIGHTS = Self::DIRECTIONAL_LIGHTS.bits()
            | Self::POINT_LIGHTS.bits()
            | Self::SPOT_LIGHTS.bits()
            | Self::SKY_LIGHTS.bits();

        /// Everything a game view renders
        const DEFAULT_GAME = Self::AO.bits()
            | Self::GI.bits()
            | Self::LIGHTS.bits()
            | Self::DECALS.bits()
            | Self::SHADOWS.bits()
            | Self::SKY.bits()
            | Self::FOG.bits()
            | Self::REFLECTIONS.bits()
            | Self::DEPTH_OF_FIELD.bits()
            | Self::MOTION_BLUR.bits()
            | Self::EYE_ADAPTATION.bits()
            | Self::SPECULAR_LIGHT.bits()
            | Self::CONTACT_SHADOWS.bits()
            | Self::ANTI_ALIASING.bits()
            | Self::TONE_MAPPING.bits();

        /// Probe captures: lighting without post effects or temporal features
        const REFLECTION_PROBE = Self::LIGHTS.bits()
            | Self::DECALS.bits()
            | Self::SHADOWS.bits()
            | Self::SKY.bits()
            | Self::FOG.bits()
            | Self::SPECULAR_LIGHT.bits();
    }
}

impl Default for ViewFlags {
    fn default() -> Self {
        ViewFlags::DEFAULT_GAME
    }
}

/// Debug visualization of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ViewMode {
    #[default]
    Default,
    NoPostFx,
    LightBuffer,
    Wireframe,
    QuadOverdraw,
    LightmapUVsDensity,
    VertexColors,
    LODPreview,
    MaterialComplexity,
}

impl ViewMode {
    /// Modes that replace the G-Buffer pixel shaders
    pub fn overrides_gbuffer(self) -> bool {
        matches!(
            self,
            ViewMode::QuadOverdraw
                | ViewMode::LightmapUVsDensity
                | ViewMode::VertexColors
                | ViewMode::LODPreview
                | ViewMode::MaterialComplexity
        )
    }
}

bitflags! {
    /// Draw passes an object or a view takes part in
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DrawPass: u32 {
        const DEPTH = 1 << 0;
        const GBUFFER = 1 << 1;
        const FORWARD = 1 << 2;
        const DISTORTION = 1 << 3;
        const MOTION_VECTORS = 1 << 4;
        const GLOBAL_SURFACE_ATLAS = 1 << 5;

        const DEFAULT = Self::DEPTH.bits()
            | Self::GBUFFER.bits()
            | Self::FORWARD.bits()
            | Self::DISTORTION.bits()
            | Self::MOTION_VECTORS.bits();
    }
}

bitflags! {
    /// Static-ness of an object, used by capture views to filter geometry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StaticFlags: u32 {
        const TRANSFORM = 1 << 0;
        const REFLECTION_PROBE = 1 << 1;
        const SHADOW = 1 << 2;
        const FULLY_STATIC = Self::TRANSFORM.bits() | Self::REFLECTION_PROBE.bits() | Self::SHADOW.bits();
    }
}

/// Cube face look directions and up vectors: +X, -X, +Y, -Y, +Z, -Z
pub const CUBE_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::Y),
    (Vec3::NEG_X, Vec3::Y),
    (Vec3::Y, Vec3::NEG_Z),
    (Vec3::NEG_Y, Vec3::Z),
    (Vec3::Z, Vec3::Y),
    (Vec3::NEG_Z, Vec3::Y),
];

/// A view frustum and everything the passes need to know about it
#[derive(Debug, Clone)]
pub struct RenderView {
    pub position: Vec3,
    pub direction: Vec3,
    /// World origin offset for large worlds, subtracted from positions
    pub origin: Vec3,
    pub near: f32,
    pub far: f32,
    /// Vertical field of view in radians, 0 for orthographic views
    pub fov_y: f32,
    pub is_orthographic: bool,

    pub view: Mat4,
    pub projection: Mat4,
    pub non_jittered_projection: Mat4,
    pub view_projection: Mat4,
    pub prev_view: Mat4,
    pub prev_projection: Mat4,
    pub prev_view_projection: Mat4,

    /// xy current, zw previous frame NDC jitter
    pub temporal_aa_jitter: Vec4,

    pub flags: ViewFlags,
    pub mode: ViewMode,
    pub pass: DrawPass,
    pub is_offline_pass: bool,
    pub is_camera_cut: bool,
    pub is_taa_resolved: bool,
    /// Single-frame views (probe faces, atlas tiles) skip temporal effects
    pub is_single_frame: bool,

    /// (width, height, 1/width, 1/height)
    pub screen_size: Vec4,
    pub model_lod_bias: i32,
    pub model_lod_distance_factor: f32,
    pub render_layers_mask: u32,
    /// Objects must have all these static flags to be drawn
    pub static_flags_mask: StaticFlags,

    pub frustum: Frustum,
    /// Frustum used for object selection, may be larger than `frustum`
    pub culling_frustum: Frustum,
}

impl Default for RenderView {
    fn default() -> Self {
        let mut view = Self {
            position: Vec3::ZERO,
            direction: Vec3::NEG_Z,
            origin: Vec3::ZERO,
            near: 10.0,
            far: 40000.0,
            fov_y: 60f32.to_radians(),
            is_orthographic: false,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            non_jittered_projection: Mat4::IDENTITY,
            view_projection: Mat4::IDENTITY,
            prev_view: Mat4::IDENTITY,
            prev_projection: Mat4::IDENTITY,
            prev_view_projection: Mat4::IDENTITY,
            temporal_aa_jitter: Vec4::ZERO,
            flags: ViewFlags::DEFAULT_GAME,
            mode: ViewMode::Default,
            pass: DrawPass::DEFAULT,
            is_offline_pass: false,
            is_camera_cut: false,
            is_taa_resolved: false,
            is_single_frame: false,
            screen_size: Vec4::new(1.0, 1.0, 1.0, 1.0),
            model_lod_bias: 0,
            model_lod_distance_factor: 1.0,
            render_layers_mask: u32::MAX,
            static_flags_mask: StaticFlags::empty(),
            frustum: Frustum::default(),
            culling_frustum: Frustum::default(),
        };
        view.set_screen_size(1920, 1080);
        view.set_perspective(view.position, view.direction, Vec3::Y, view.fov_y, view.near, view.far);
        view
    }
}

impl RenderView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn width(&self) -> u32 {
        self.screen_size.x as u32
    }

    pub fn height(&self) -> u32 {
        self.screen_size.y as u32
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.screen_size.x / self.screen_size.y.max(1.0)
    }

    pub fn set_screen_size(&mut self, width: u32, height: u32) {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        self.screen_size = Vec4::new(w, h, 1.0 / w, 1.0 / h);
    }

    /// Set matrices; culling uses the same frustum
    pub fn set_up(&mut self, view: Mat4, projection: Mat4) {
        self.view = view;
        self.projection = projection;
        self.non_jittered_projection = projection;
        self.update_cached();
        self.culling_frustum = self.frustum;
    }

    /// Set matrices with a separate culling view-projection
    pub fn set_up_with_culling(&mut self, view: Mat4, projection: Mat4, culling_view_projection: Mat4) {
        self.set_up(view, projection);
        self.culling_frustum = Frustum::from_matrix(culling_view_projection);
    }

    /// Perspective camera looking along `direction`
    pub fn set_perspective(
        &mut self,
        position: Vec3,
        direction: Vec3,
        up: Vec3,
        fov_y: f32,
        near: f32,
        far: f32,
    ) {
        self.position = position;
        self.direction = direction.normalize_or_zero();
        self.near = near;
        self.far = far;
        self.fov_y = fov_y;
        self.is_orthographic = false;
        let view = Mat4::look_to_rh(position - self.origin, self.direction, up);
        let projection = Mat4::perspective_rh(fov_y, self.aspect_ratio(), near, far);
        self.set_up(view, projection);
    }

    /// Square perspective projector, used by spot lights and cube faces
    pub fn set_projector(
        &mut self,
        near: f32,
        far: f32,
        position: Vec3,
        direction: Vec3,
        up: Vec3,
        fov_y: f32,
    ) {
        self.set_screen_size(1, 1);
        self.set_perspective(position, direction, up, fov_y, near, far);
    }

    /// Configure the view for one face of a cube capture centered at `position`
    pub fn set_face(&mut self, face: usize, position: Vec3, near: f32, far: f32) {
        let (direction, up) = CUBE_FACES[face % 6];
        self.set_projector(near, far, position, direction, up, std::f32::consts::FRAC_PI_2);
    }

    /// Orthographic view of a box `width`x`height` centered on the view axis
    pub fn set_orthographic(
        &mut self,
        position: Vec3,
        direction: Vec3,
        up: Vec3,
        width: f32,
        height: f32,
        near: f32,
        far: f32,
    ) {
        self.position = position;
        self.direction = direction.normalize_or_zero();
        self.near = near;
        self.far = far;
        self.fov_y = 0.0;
        self.is_orthographic = true;
        let view = Mat4::look_to_rh(position - self.origin, self.direction, up);
        let projection = Mat4::orthographic_rh(
            -width * 0.5,
            width * 0.5,
            -height * 0.5,
            height * 0.5,
            near,
            far,
        );
        self.set_up(view, projection);
    }

    /// Carry the previous frame matrices. `None` or a camera cut makes the
    /// previous matrices equal to the current ones.
    pub fn set_previous(&mut self, previous: Option<(Mat4, Mat4)>) {
        match previous {
            Some((prev_view, prev_projection)) if !self.is_camera_cut => {
                self.prev_view = prev_view;
                self.prev_projection = prev_projection;
            }
            _ => {
                self.prev_view = self.view;
                self.prev_projection = self.non_jittered_projection;
            }
        }
        self.prev_view_projection = self.prev_projection * self.prev_view;
    }

    /// Apply the TAA sub-pixel offset for a frame. Without TAA the jitter is zero.
    pub fn apply_taa_jitter(&mut self, frame_index: u64, enabled: bool, spread: f32) {
        let previous = self.temporal_aa_jitter.truncate().truncate();
        let current = if enabled && !self.is_single_frame && !self.is_orthographic {
            let pixel = jitter::halton_2_3(frame_index, jitter::TAA_JITTER_SEQUENCE_LENGTH) * spread;
            jitter::jitter_to_ndc(pixel, self.width(), self.height())
        } else {
            Vec2::ZERO
        };

        self.temporal_aa_jitter = Vec4::new(current.x, current.y, previous.x, previous.y);
        self.projection = if current == Vec2::ZERO {
            self.non_jittered_projection
        } else {
            jitter::apply_jitter(self.non_jittered_projection, current)
        };
        self.update_cached();
    }

    pub fn has_jitter(&self) -> bool {
        self.temporal_aa_jitter.x != 0.0 || self.temporal_aa_jitter.y != 0.0
    }

    fn update_cached(&mut self) {
        self.view_projection = self.projection * self.view;
        self.frustum = Frustum::from_matrix(self.view_projection);
    }

    /// View-space depth of a world position (positive in front of the camera)
    pub fn view_depth(&self, world: Vec3) -> f32 {
        -self.view.transform_point3(world - self.origin).z
    }

    pub fn is_perspective(&self) -> bool {
        !self.is_orthographic
    }

    /// Shader-side view constants
    pub fn shader_data(&self) -> GpuViewData {
        GpuViewData {
            view: self.view,
            projection: self.projection,
            view_projection: self.view_projection,
            inv_view_projection: self.view_projection.inverse(),
            prev_view_projection: self.prev_view_projection,
            position: (self.position - self.origin).extend(self.near),
            direction: self.direction.extend(self.far),
            screen_size: self.screen_size,
            temporal_aa_jitter: self.temporal_aa_jitter,
        }
    }
}

/// View constants shared by every pass
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuViewData {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub inv_view_projection: Mat4,
    pub prev_view_projection: Mat4,
    /// xyz position, w near
    pub position: Vec4,
    /// xyz direction, w far
    pub direction: Vec4,
    pub screen_size: Vec4,
    pub temporal_aa_jitter: Vec4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_projection_is_projection_times_view() {
        let mut view = RenderView::new();
        view.set_perspective(Vec3::new(1.0, 2.0, 3.0), Vec3::X, Vec3::Y, 1.0, 1.0, 1000.0);
        assert_eq!(view.view_projection, view.projection * view.view);

        view.apply_taa_jitter(3, true, 1.0);
        assert!(view.has_jitter());
        assert_eq!(view.view_projection, view.projection * view.view);
    }

    #[test]
    fn test_jitter_zero_without_taa() {
        let mut view = RenderView::new();
        view.apply_taa_jitter(5, false, 1.0);
        assert!(!view.has_jitter());
        assert_eq!(view.projection, view.non_jittered_projection);
    }

    #[test]
    fn test_camera_cut_resets_previous() {
        let mut view = RenderView::new();
        let old_view = Mat4::from_translation(Vec3::X * 100.0);
        view.is_camera_cut = true;
        view.set_previous(Some((old_view, view.projection)));
        assert_eq!(view.prev_view_projection, view.non_jittered_projection * view.view);

        view.is_camera_cut = false;
        view.set_previous(Some((old_view, view.projection)));
        assert_eq!(view.prev_view, old_view);
    }

    #[test]
    fn test_cube_faces_look_outward() {
        let mut view = RenderView::new();
        for face in 0..6 {
            view.set_face(face, Vec3::ZERO, 1.0, 100.0);
            let (direction, _) = CUBE_FACES[face];
            assert!(view.frustum.contains_point(direction * 50.0));
            assert!(!view.frustum.contains_point(-direction * 50.0));
        }
    }
}
