//! Per-view list of everything to draw
//!
//! Culling appends draw calls and lights, the list is sorted once, then
//! passes replay it. All data is copied in, nothing references actors.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::backend::{BufferHandle, GpuTexture};
use crate::resources::GpuMesh;
use crate::scene::light::*;
use crate::scene::settings::PostProcessSettings;
use crate::scene::view::{DrawPass, RenderView, StaticFlags};

/// Draw call lists, one per consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawCallsListType {
    GBuffer,
    GBufferNoDecals,
    Depth,
    MotionVectors,
    Forward,
    Distortion,
    ShadowDepth,
}

impl DrawCallsListType {
    pub const COUNT: usize = 7;

    pub const ALL: [DrawCallsListType; Self::COUNT] = [
        DrawCallsListType::GBuffer,
        DrawCallsListType::GBufferNoDecals,
        DrawCallsListType::Depth,
        DrawCallsListType::MotionVectors,
        DrawCallsListType::Forward,
        DrawCallsListType::Distortion,
        DrawCallsListType::ShadowDepth,
    ];

    /// Transparent lists draw back to front
    pub fn is_back_to_front(self) -> bool {
        matches!(self, DrawCallsListType::Forward | DrawCallsListType::Distortion)
    }
}

/// Material blending class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MaterialBlend {
    #[default]
    Opaque,
    Transparent,
}

/// What the renderer needs to know about a material
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialInfo {
    /// Stable material identifier, part of the batch key
    pub id: u32,
    pub blend: MaterialBlend,
    pub receives_decals: bool,
    pub uses_distortion: bool,
    pub two_sided: bool,
    pub emissive: Vec3,
}

impl Default for MaterialInfo {
    fn default() -> Self {
        Self {
            id: 0,
            blend: MaterialBlend::Opaque,
            receives_decals: true,
            uses_distortion: false,
            two_sided: false,
            emissive: Vec3::ZERO,
        }
    }
}

/// Extra per-instance data bound with a draw call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InstanceData {
    #[default]
    None,
    Skinning(BufferHandle),
    Particles(BufferHandle),
}

/// One drawable item projected at cull time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawCall {
    pub world: Mat4,
    pub prev_world: Mat4,
    pub geometry: GpuMesh,
    pub material: MaterialInfo,
    pub instance_data: InstanceData,
    /// Negative for mirrored transforms, flips the cull mode
    pub world_determinant_sign: f32,
    pub per_instance_random: f32,
    pub lod_index: u8,
    pub lod_dither_factor: f32,
    /// World-space bounding sphere
    pub bounds_center: Vec3,
    pub bounds_radius: f32,
    pub static_flags: StaticFlags,
    pub casts_shadows: bool,
    /// View-space depth, filled when added to a list
    pub distance: f32,
}

impl DrawCall {
    /// Key of calls that may be merged into one instanced draw
    pub fn batch_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.geometry.vertex_buffer.handle.hash(&mut hasher);
        self.geometry.index_buffer.handle.hash(&mut hasher);
        self.material.id.hash(&mut hasher);
        self.instance_data.hash(&mut hasher);
        (self.world_determinant_sign < 0.0).hash(&mut hasher);
        self.lod_index.hash(&mut hasher);
        hasher.finish()
    }

    pub fn can_instance(&self) -> bool {
        self.instance_data == InstanceData::None && self.lod_dither_factor == 0.0
    }

    pub fn has_moved(&self) -> bool {
        self.world != self.prev_world
    }
}

/// Consecutive draw calls drawn with a single instanced draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawBatch {
    /// Offset into the list's sorted indices
    pub start_index: usize,
    pub instance_count: u32,
}

/// Indices into the frame's draw calls plus their batches
#[derive(Debug, Clone, Default)]
pub struct DrawCallsList {
    pub indices: Vec<usize>,
    pub batches: Vec<DrawBatch>,
    pub can_use_instancing: bool,
}

impl DrawCallsList {
    pub fn clear(&mut self) {
        self.indices.clear();
        self.batches.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderEnvironmentProbeData {
    pub id: u32,
    pub position: Vec3,
    pub radius: f32,
    pub brightness: f32,
    pub texture: Option<GpuTexture>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderDecalData {
    /// Maps the unit cube to the decal box
    pub world: Mat4,
    pub material: MaterialInfo,
    pub sort_order: i32,
}

/// Volumetric fog parameters of a height fog
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumetricFogOptions {
    pub enabled: bool,
    pub albedo: Vec4,
    pub emissive: Vec4,
    pub extinction_scale: f32,
    /// Henyey-Greenstein phase g in -0.9..0.9
    pub scattering_distribution: f32,
    /// View distance covered by the froxel grid
    pub distance: f32,
}

impl Default for VolumetricFogOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            albedo: Vec4::new(0.9, 0.9, 0.9, 1.0),
            emissive: Vec4::ZERO,
            extinction_scale: 1.0,
            scattering_distribution: 0.2,
            distance: 6000.0,
        }
    }
}

/// Exponential height fog snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderFogData {
    pub density: f32,
    /// World height of the fog base
    pub height: f32,
    pub height_falloff: f32,
    pub color: Vec3,
    pub start_distance: f32,
    pub max_opacity: f32,
    /// 0 disables the cutoff
    pub cutoff_distance: f32,
    pub volumetric: Option<VolumetricFogOptions>,
}

impl RenderFogData {
    /// (density, height, height falloff) as the fog shaders read them
    pub fn fog_parameters(&self) -> Vec3 {
        Vec3::new(self.density, self.height, self.height_falloff)
    }
}

/// A local volume injected into the volumetric fog grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderFogParticle {
    pub world: Mat4,
    pub bounds_center: Vec3,
    pub bounds_radius: f32,
    pub material: MaterialInfo,
}

/// Actor taking part in the global surface atlas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceAtlasObject {
    pub id: u64,
    pub world: Mat4,
    pub local_bounds_min: Vec3,
    pub local_bounds_max: Vec3,
    pub bounds_center: Vec3,
    pub bounds_radius: f32,
    pub is_static: bool,
    pub geometry: GpuMesh,
    pub material: MaterialInfo,
}

/// Everything a view draws in one frame
#[derive(Debug, Clone, Default)]
pub struct RenderList {
    pub draw_calls: Vec<DrawCall>,
    pub lists: [DrawCallsList; DrawCallsListType::COUNT],

    pub directional_lights: Vec<RenderDirectionalLightData>,
    pub point_lights: Vec<RenderPointLightData>,
    pub spot_lights: Vec<RenderSpotLightData>,
    pub sky_lights: Vec<RenderSkyLightData>,
    pub environment_probes: Vec<RenderEnvironmentProbeData>,
    pub decals: Vec<RenderDecalData>,
    pub volumetric_fog_particles: Vec<RenderFogParticle>,
    pub surface_atlas_objects: Vec<SurfaceAtlasObject>,
    pub fog: Option<RenderFogData>,
    /// Sky cube drawn behind geometry when the view has the sky flag
    pub sky: Option<GpuTexture>,

    pub settings: PostProcessSettings,

    /// World-space view frustum corners
    pub frustum_corners_ws: [Vec3; 8],
    /// View-space view frustum corners
    pub frustum_corners_vs: [Vec3; 8],

    is_sorted: bool,
}

impl RenderList {
    pub fn new() -> Self {
        let mut list = Self::default();
        for list in &mut list.lists {
            list.can_use_instancing = true;
        }
        list
    }

    /// Empty every array, keeping allocations
    pub fn clear(&mut self) {
        self.draw_calls.clear();
        for list in &mut self.lists {
            list.clear();
        }
        self.directional_lights.clear();
        self.point_lights.clear();
        self.spot_lights.clear();
        self.sky_lights.clear();
        self.environment_probes.clear();
        self.decals.clear();
        self.volumetric_fog_particles.clear();
        self.surface_atlas_objects.clear();
        self.fog = None;
        self.sky = None;
        self.is_sorted = false;
    }

    pub fn list(&self, list_type: DrawCallsListType) -> &DrawCallsList {
        &self.lists[list_type as usize]
    }

    pub fn list_mut(&mut self, list_type: DrawCallsListType) -> &mut DrawCallsList {
        &mut self.lists[list_type as usize]
    }

    pub fn is_sorted(&self) -> bool {
        self.is_sorted
    }

    /// Cache frustum corners of the view
    pub fn setup_frustum_corners(&mut self, view: &RenderView) {
        self.frustum_corners_ws = view.frustum.corners();
        for (vs, ws) in self.frustum_corners_vs.iter_mut().zip(self.frustum_corners_ws) {
            *vs = view.view.transform_point3(ws - view.origin);
        }
    }

    /// Add a draw call to every list the view pass and material route it to
    pub fn add_draw_call(&mut self, view: &RenderView, passes: DrawPass, mut draw_call: DrawCall) {
        debug_assert!(!self.is_sorted, "RenderList: add after sort");
        let passes = passes & view.pass;
        if passes.is_empty() {
            return;
        }

        draw_call.distance = view.view_depth(draw_call.bounds_center);
        let index = self.draw_calls.len();
        let material = draw_call.material;

        match material.blend {
            MaterialBlend::Opaque => {
                if passes.contains(DrawPass::GBUFFER) {
                    let target = if material.receives_decals {
                        DrawCallsListType::GBuffer
                    } else {
                        DrawCallsListType::GBufferNoDecals
                    };
                    self.list_mut(target).indices.push(index);
                }
                if passes.contains(DrawPass::DEPTH) {
                    self.list_mut(DrawCallsListType::Depth).indices.push(index);
                }
                if passes.contains(DrawPass::MOTION_VECTORS) && draw_call.has_moved() {
                    self.list_mut(DrawCallsListType::MotionVectors).indices.push(index);
                }
            }
            MaterialBlend::Transparent => {
                if passes.contains(DrawPass::FORWARD) {
                    self.list_mut(DrawCallsListType::Forward).indices.push(index);
                }
            }
        }
        if material.uses_distortion && passes.contains(DrawPass::DISTORTION) {
            self.list_mut(DrawCallsListType::Distortion).indices.push(index);
        }

        self.draw_calls.push(draw_call);
    }

    /// Add a shadow caster, selected by a light's culling frustum
    pub fn add_shadow_caster(&mut self, view: &RenderView, mut draw_call: DrawCall) {
        draw_call.distance = view.view_depth(draw_call.bounds_center);
        let index = self.draw_calls.len();
        self.draw_calls.push(draw_call);
        self.list_mut(DrawCallsListType::ShadowDepth).indices.push(index);
    }

    /// Sort every list and build instancing batches
    pub fn sort_draw_calls(&mut self) {
        let draw_calls = &self.draw_calls;
        for (i, list) in self.lists.iter_mut().enumerate() {
            let back_to_front = DrawCallsListType::ALL[i].is_back_to_front();
            list.indices.sort_by(|a, b| {
                let (a, b) = (&draw_calls[*a], &draw_calls[*b]);
                let distance = if back_to_front {
                    b.distance.total_cmp(&a.distance)
                } else {
                    a.distance.total_cmp(&b.distance)
                };
                distance.then_with(|| a.material.id.cmp(&b.material.id))
            });
            build_batches(list, draw_calls, !back_to_front);
        }
        self.is_sorted = true;
    }

    /// Sort lights for the light pass
    pub fn sort_lights(&mut self) {
        self.directional_lights.sort_by_key(|l| l.base.sort_key());
        self.point_lights.sort_by_key(|l| l.base.sort_key());
        self.spot_lights.sort_by_key(|l| l.base.sort_key());
        self.sky_lights.sort_by_key(|l| l.base.sort_key());
    }

    pub fn light_count(&self) -> usize {
        self.directional_lights.len()
            + self.point_lights.len()
            + self.spot_lights.len()
            + self.sky_lights.len()
    }
}

/// Merge consecutive calls sharing a batch hash. With `allow_reorder`,
/// calls with the same hash anywhere in the list are pulled together first.
fn build_batches(list: &mut DrawCallsList, draw_calls: &[DrawCall], allow_reorder: bool) {
    list.batches.clear();
    if list.indices.is_empty() {
        return;
    }

    if allow_reorder && list.can_use_instancing {
        // Stable: keeps front-to-back order within each batch and between batch heads
        let mut first_seen: HashMap<u64, usize> = HashMap::new();
        let mut keyed: Vec<(usize, usize)> = Vec::with_capacity(list.indices.len());
        for (order, index) in list.indices.iter().enumerate() {
            let call = &draw_calls[*index];
            let group = if call.can_instance() {
                *first_seen.entry(call.batch_hash()).or_insert(order)
            } else {
                order
            };
            keyed.push((group, *index));
        }
        keyed.sort_by_key(|(group, _)| *group);
        list.indices = keyed.into_iter().map(|(_, index)| index).collect();
    }

    let mut start = 0;
    while start < list.indices.len() {
        let head = &draw_calls[list.indices[start]];
        let mut end = start + 1;
        if list.can_use_instancing && head.can_instance() {
            let hash = head.batch_hash();
            while end < list.indices.len() {
                let call = &draw_calls[list.indices[end]];
                if !call.can_instance() || call.batch_hash() != hash {
                    break;
                }
                end += 1;
            }
        }
        list.batches.push(DrawBatch {
            start_index: start,
            instance_count: (end - start) as u32,
        });
        start = end;
    }
}
