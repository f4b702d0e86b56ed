//! Global surface atlas
//!
//! Objects around the camera are rasterized from their six box sides into
//! tiles of a shared atlas holding depth, material attributes and emissive.
//! A direct light pass then shades the atlas so global illumination and
//! reflections can sample lit surfaces anywhere in the scene.
//!
//! The atlas lives per view as a custom render buffer. Tiles are packed by a
//! guillotine packer, reused while their size stays close, and redrawn on a
//! timer staggered by object id.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::draw::DrawCallsRenderer;
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::render_buffers::{pick_format, CustomBuffer, DEPTH_FORMATS};
use crate::resources::{Rect, RectId, RectPack, RenderTargetPool, ShaderLibrary};
use crate::scene::{
    DrawCall, InstanceData, LightShaderData, StaticFlags, SurfaceAtlasObject, ViewFlags, EPSILON,
};

pub const SHADER: &str = "Shaders/GlobalSurfaceAtlas";
pub const CUSTOM_BUFFER_NAME: &str = "GlobalSurfaceAtlas";

pub const DEFAULT_RESOLUTION: u32 = 2048;
pub const DEFAULT_WORLD_RADIUS: f32 = 20000.0;
/// Objects smaller than this are left out of the atlas
pub const MIN_OBJECT_RADIUS: f32 = 20.0;

pub const TILES_PER_UNIT: f32 = 0.1;
pub const DISTANCE_SCALE_START: f32 = 2000.0;
pub const DISTANCE_SCALE_END: f32 = 5000.0;
pub const DISTANCE_SCALE_MIN: f32 = 0.1;
pub const MIN_TILE_RESOLUTION: u32 = 8;
pub const MAX_TILE_RESOLUTION: u32 = 128;
pub const TILE_ALIGNMENT: u32 = 8;
/// A tile is kept while the wanted resolution differs by less than this
pub const TILE_REUSE_THRESHOLD: u32 = 32;

pub const STATIC_REDRAW_FRAMES: u64 = 120;
pub const DYNAMIC_REDRAW_FRAMES: u64 = 4;
/// Insert failures this recent allow a defragmentation
pub const INSERT_FAIL_WINDOW: u64 = 10;
/// Minimum frames between two defragmentations
pub const DEFRAGMENT_INTERVAL: u64 = 60;

pub const SIDES: usize = 6;
/// Vec4 records per object in the objects buffer
pub const OBJECT_RECORD_SIZE: usize = 5 + SIDES * TILE_RECORD_SIZE;
/// Vec4 records per tile: UV rectangle then view-projection columns
pub const TILE_RECORD_SIZE: usize = 5;
pub const VERTICES_PER_TILE: u32 = 6;

pub const ATLAS_CB_SLOT: u32 = 0;
pub const LIGHT_CB_SLOT: u32 = 1;
pub const DEPTH_SR_SLOT: u32 = 0;
pub const GBUFFER0_SR_SLOT: u32 = 1;
pub const GBUFFER1_SR_SLOT: u32 = 2;
pub const GBUFFER2_SR_SLOT: u32 = 3;
pub const OBJECTS_SR_SLOT: u32 = 4;

const EMISSIVE_FORMAT: TextureFormat = TextureFormat::Rg11b10Float;
const GBUFFER_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AtlasData {
    pub tile_view_projection: Mat4,
    pub world: Mat4,
    /// (resolution, 1 / resolution, object index, side)
    pub params: Vec4,
    pub view_position: Vec4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AtlasLightData {
    pub light: LightShaderData,
    /// (resolution, 1 / resolution, light kind, object count)
    pub params: Vec4,
}

/// Vertex of a tile quad drawn over the atlas
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TileVertex {
    /// Atlas position in clip space
    pub position: Vec2,
    /// Position inside the tile, 0..1
    pub tile_uv: Vec2,
    /// Offset of the owning object record in the objects buffer
    pub object_address: u32,
    pub side: u32,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(
        SHADER,
        &[std::mem::size_of::<AtlasData>(), std::mem::size_of::<AtlasLightData>()],
    );
}

/// Tile edge for one object side. Shrinks with distance from the view.
pub fn tile_resolution(side_extent: f32, distance: f32) -> u32 {
    let t = ((distance - DISTANCE_SCALE_START) / (DISTANCE_SCALE_END - DISTANCE_SCALE_START)).clamp(0.0, 1.0);
    let distance_scale = 1.0 + (DISTANCE_SCALE_MIN - 1.0) * t;
    let resolution = (side_extent * TILES_PER_UNIT * distance_scale)
        .clamp(MIN_TILE_RESOLUTION as f32, MAX_TILE_RESOLUTION as f32) as u32;
    (resolution / TILE_ALIGNMENT * TILE_ALIGNMENT).max(MIN_TILE_RESOLUTION)
}

/// Frames between redraws of an object
pub fn redraw_interval(is_static: bool) -> u64 {
    if is_static {
        STATIC_REDRAW_FRAMES
    } else {
        DYNAMIC_REDRAW_FRAMES
    }
}

/// Stagger of an object's redraw timer
fn redraw_offset(id: u64, interval: u64) -> u64 {
    // Fibonacci hashing spreads sequential ids
    id.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_right(29) % interval
}

/// Oriented bounds of an object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectBounds {
    pub center: Vec3,
    /// Normalized world axes
    pub axes: [Vec3; 3],
    pub half_extents: Vec3,
}

impl ObjectBounds {
    pub fn from_object(object: &SurfaceAtlasObject) -> Self {
        let world = object.world;
        let scale = Vec3::new(
            world.x_axis.truncate().length(),
            world.y_axis.truncate().length(),
            world.z_axis.truncate().length(),
        )
        .max(Vec3::splat(EPSILON));
        let axes = [
            world.x_axis.truncate() / scale.x,
            world.y_axis.truncate() / scale.y,
            world.z_axis.truncate() / scale.z,
        ];
        let local_center = (object.local_bounds_min + object.local_bounds_max) * 0.5;
        Self {
            center: world.transform_point3(local_center),
            axes,
            half_extents: (object.local_bounds_max - object.local_bounds_min) * 0.5 * scale,
        }
    }

    /// Outward normal of a side: +X, -X, +Y, -Y, +Z, -Z
    pub fn side_normal(&self, side: usize) -> Vec3 {
        let axis = self.axes[side / 2];
        if side % 2 == 0 {
            axis
        } else {
            -axis
        }
    }

    /// Tangent axes and their half extents for a side
    fn side_frame(&self, side: usize) -> (Vec3, Vec3, Vec2, f32) {
        let a = side / 2;
        let (u, v) = match a {
            0 => (2, 1),
            1 => (0, 2),
            _ => (0, 1),
        };
        let half = self.half_extents.to_array();
        (
            self.axes[u],
            self.axes[v],
            Vec2::new(half[u], half[v]),
            half[a],
        )
    }

    /// Largest extent of a side in world units
    pub fn side_extent(&self, side: usize) -> f32 {
        let (_, _, half, _) = self.side_frame(side);
        half.max_element() * 2.0
    }

    /// Orthographic view-projection looking at a side from outside
    pub fn side_view_projection(&self, side: usize, origin: Vec3) -> Mat4 {
        let normal = self.side_normal(side);
        let (_, up, half, depth) = self.side_frame(side);
        let eye = self.center + normal * depth - origin;
        let view = Mat4::look_to_rh(eye, -normal, up);
        let projection = Mat4::orthographic_rh(
            -half.x.max(EPSILON),
            half.x.max(EPSILON),
            -half.y.max(EPSILON),
            half.y.max(EPSILON),
            -0.1,
            depth * 2.0 + 0.2,
        );
        projection * view
    }
}

/// An object's place in the atlas
#[derive(Debug, Clone)]
pub struct AtlasObjectState {
    pub tiles: [Option<RectId>; SIDES],
    pub bounds: ObjectBounds,
    pub world: Mat4,
    pub is_static: bool,
    pub last_frame_used: u64,
    pub next_redraw_frame: u64,
    /// Redraw all tiles this frame
    pub dirty: bool,
}

/// CPU side of the atlas: tile packing, redraw timers and defragmentation
#[derive(Debug)]
pub struct AtlasLayout {
    pack: RectPack<(u64, u8)>,
    objects: HashMap<u64, AtlasObjectState>,
    pub last_frame_insert_fail: Option<u64>,
    pub last_frame_defragmentation: u64,
}

impl AtlasLayout {
    pub fn new(resolution: u32) -> Self {
        Self {
            pack: RectPack::new(resolution),
            objects: HashMap::new(),
            last_frame_insert_fail: None,
            last_frame_defragmentation: 0,
        }
    }

    pub fn resolution(&self) -> u32 {
        self.pack.size()
    }

    pub fn object(&self, id: u64) -> Option<&AtlasObjectState> {
        self.objects.get(&id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn tile_rect(&self, id: RectId) -> Option<Rect> {
        self.pack.rect(id)
    }

    pub fn needs_defragmentation(&self, frame: u64) -> bool {
        self.last_frame_insert_fail
            .is_some_and(|fail| frame.saturating_sub(fail) <= INSERT_FAIL_WINDOW)
            && frame.saturating_sub(self.last_frame_defragmentation) > DEFRAGMENT_INTERVAL
    }

    /// Free every tile, objects are re-inserted as they are seen
    pub fn defragment(&mut self, frame: u64) {
        log::debug!(
            "GlobalSurfaceAtlas: defragmenting {} objects ({:.0}% used)",
            self.objects.len(),
            self.pack.usage() * 100.0
        );
        self.pack.clear();
        self.objects.clear();
        self.last_frame_defragmentation = frame;
        self.last_frame_insert_fail = None;
    }

    fn free_tiles(pack: &mut RectPack<(u64, u8)>, state: &mut AtlasObjectState) {
        for tile in state.tiles.iter_mut() {
            if let Some(id) = tile.take() {
                pack.free(id);
            }
        }
    }

    /// Place or refresh an object's tiles. Returns whether the object has
    /// tiles this frame; a full atlas stamps the insert failure.
    pub fn update_object(&mut self, object: &SurfaceAtlasObject, view_position: Vec3, frame: u64) -> RenderResult<()> {
        let bounds = ObjectBounds::from_object(object);
        let distance = (view_position.distance(bounds.center) - object.bounds_radius).max(0.0);
        let interval = redraw_interval(object.is_static);

        let pack = &mut self.pack;
        let state = self.objects.entry(object.id).or_insert_with(|| AtlasObjectState {
            tiles: [None; SIDES],
            bounds,
            world: object.world,
            is_static: object.is_static,
            last_frame_used: frame,
            next_redraw_frame: frame + interval + redraw_offset(object.id, interval),
            dirty: true,
        });

        if state.world != object.world || state.is_static != object.is_static {
            state.dirty = true;
        }
        state.bounds = bounds;
        state.world = object.world;
        state.is_static = object.is_static;
        state.last_frame_used = frame;

        for side in 0..SIDES {
            let resolution = tile_resolution(bounds.side_extent(side), distance);
            if let Some(id) = state.tiles[side] {
                let reuse = pack
                    .rect(id)
                    .is_some_and(|rect| rect.width.abs_diff(resolution) < TILE_REUSE_THRESHOLD);
                if reuse {
                    continue;
                }
                pack.free(id);
                state.tiles[side] = None;
            }
            match pack.insert(resolution, resolution, (object.id, side as u8)) {
                Some(id) => {
                    state.tiles[side] = Some(id);
                    state.dirty = true;
                }
                None => {
                    Self::free_tiles(pack, state);
                    self.objects.remove(&object.id);
                    self.last_frame_insert_fail = Some(frame);
                    return Err(RenderError::AtlasInsertFull);
                }
            }
        }

        if frame >= state.next_redraw_frame {
            state.dirty = true;
            state.next_redraw_frame = frame + interval;
        }
        Ok(())
    }

    /// Drop objects not seen this frame
    pub fn remove_unused(&mut self, frame: u64) {
        let pack = &mut self.pack;
        self.objects.retain(|_, state| {
            if state.last_frame_used == frame {
                return true;
            }
            Self::free_tiles(pack, state);
            false
        });
    }

    /// Objects in a stable order
    pub fn sorted_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.objects.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn clear_dirty(&mut self) {
        for state in self.objects.values_mut() {
            state.dirty = false;
        }
    }
}

/// Atlas textures and buffers of one view
#[derive(Debug, Clone, Copy)]
struct AtlasTextures {
    depth: GpuTexture,
    emissive: GpuTexture,
    gbuffer: [GpuTexture; 3],
    direct_light: GpuTexture,
}

impl AtlasTextures {
    fn all(&self) -> [GpuTexture; 6] {
        [
            self.depth,
            self.emissive,
            self.gbuffer[0],
            self.gbuffer[1],
            self.gbuffer[2],
            self.direct_light,
        ]
    }
}

/// Per-view atlas state kept in the view's render buffers
#[derive(Debug, Default)]
pub struct SurfaceAtlasData {
    layout: Option<AtlasLayout>,
    textures: Option<AtlasTextures>,
    objects_buffer: Option<GpuBuffer>,
    tiles_buffer: Option<GpuBuffer>,
    /// Objects written to the objects buffer this frame, by id
    object_addresses: HashMap<u64, u32>,
    last_frame_used: u64,
}

impl SurfaceAtlasData {
    pub fn layout(&self) -> Option<&AtlasLayout> {
        self.layout.as_ref()
    }

    fn release_gpu(&mut self, device: &mut dyn GpuDevice) {
        if let Some(textures) = self.textures.take() {
            for texture in textures.all() {
                device.destroy_texture(texture);
            }
        }
        if let Some(buffer) = self.objects_buffer.take() {
            device.destroy_buffer(buffer);
        }
        if let Some(buffer) = self.tiles_buffer.take() {
            device.destroy_buffer(buffer);
        }
    }
}

impl CustomBuffer for SurfaceAtlasData {
    fn last_frame_used(&self) -> u64 {
        self.last_frame_used
    }

    fn release(&mut self, device: &mut dyn GpuDevice, _pool: &RenderTargetPool) {
        self.release_gpu(device);
        self.layout = None;
        self.object_addresses.clear();
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

/// What global illumination and reflections bind to sample the atlas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceAtlasBindings {
    pub depth: GpuTexture,
    pub gbuffer0: GpuTexture,
    pub gbuffer1: GpuTexture,
    pub gbuffer2: GpuTexture,
    pub direct_light: GpuTexture,
    pub objects: GpuBuffer,
    pub resolution: u32,
    pub object_count: u32,
}

struct AtlasStates {
    clear: PipelineStateHandle,
    object: PipelineStateHandle,
    /// `[directional, point, spot]`
    direct_light: [PipelineStateHandle; 3],
}

/// Global surface atlas
pub struct GlobalSurfaceAtlasPass {
    states: PipelineStates,
    handles: Option<AtlasStates>,
    atlas_cb: Option<GpuBuffer>,
    light_cb: Option<GpuBuffer>,
    draw_calls: Option<DrawCallsRenderer>,
    depth_format: Option<TextureFormat>,
    resolution: u32,
    world_radius: f32,
}

impl Default for GlobalSurfaceAtlasPass {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLUTION, DEFAULT_WORLD_RADIUS)
    }
}

impl GlobalSurfaceAtlasPass {
    pub fn new(resolution: u32, world_radius: f32) -> Self {
        Self {
            states: PipelineStates::new(),
            handles: None,
            atlas_cb: None,
            light_cb: None,
            draw_calls: None,
            depth_format: None,
            resolution: resolution.max(MAX_TILE_RESOLUTION),
            world_radius,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.handles.is_some()
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn world_radius(&self) -> f32 {
        self.world_radius
    }

    /// Whether the view wants the atlas this frame
    pub fn is_enabled(ctx: &RenderContext) -> bool {
        ctx.view.flags.contains(ViewFlags::GI) && ctx.list.settings.global_illumination.enabled
    }

    fn create_states(&mut self, device: &mut dyn GpuDevice) -> RenderResult<AtlasStates> {
        let tile = |ps: &str| {
            PipelineStateDescriptor::geometry(SHADER, "VS_Tile", Some(ps)).with_cull(CullMode::None)
        };
        let clear = tile("PS_Clear").with_depth(true, true, CompareFunction::Always);
        let light = tile("PS_DirectLight")
            .with_depth(false, false, CompareFunction::Always)
            .with_blend(BlendMode::Additive);
        Ok(AtlasStates {
            clear: self.states.create(device, &clear)?,
            object: self.states.create(
                device,
                &PipelineStateDescriptor::geometry(SHADER, "VS_Object", Some("PS_Object")).with_cull(CullMode::None),
            )?,
            direct_light: [
                self.states.create(device, &light.clone())?,
                self.states.create(device, &light.clone().with_permutation(1))?,
                self.states.create(device, &light.with_permutation(2))?,
            ],
        })
    }

    fn create_textures(&self, device: &mut dyn GpuDevice) -> RenderResult<AtlasTextures> {
        let depth_format = self
            .depth_format
            .ok_or(RenderError::UnsupportedPlatformFeature("sampleable depth format"))?;
        let size = self.resolution;
        let color = TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET;
        let requests = [
            (
                "GlobalSurfaceAtlas.Depth",
                TextureDescriptor::new_2d(
                    size,
                    size,
                    depth_format,
                    TextureFlags::SHADER_RESOURCE | TextureFlags::DEPTH_STENCIL,
                ),
            ),
            ("GlobalSurfaceAtlas.Emissive", TextureDescriptor::new_2d(size, size, EMISSIVE_FORMAT, color)),
            ("GlobalSurfaceAtlas.GBuffer0", TextureDescriptor::new_2d(size, size, GBUFFER_FORMAT, color)),
            ("GlobalSurfaceAtlas.GBuffer1", TextureDescriptor::new_2d(size, size, GBUFFER_FORMAT, color)),
            ("GlobalSurfaceAtlas.GBuffer2", TextureDescriptor::new_2d(size, size, GBUFFER_FORMAT, color)),
            ("GlobalSurfaceAtlas.DirectLight", TextureDescriptor::new_2d(size, size, EMISSIVE_FORMAT, color)),
        ];
        let mut created = Vec::with_capacity(requests.len());
        for (name, desc) in requests {
            match device.create_texture(name, &desc) {
                Ok(texture) => created.push(texture),
                Err(err) => {
                    for texture in created {
                        device.destroy_texture(texture);
                    }
                    return Err(RenderError::resource(name, err));
                }
            }
        }
        Ok(AtlasTextures {
            depth: created[0],
            emissive: created[1],
            gbuffer: [created[2], created[3], created[4]],
            direct_light: created[5],
        })
    }

    /// Grow a buffer to hold `bytes`, keeping it when large enough
    fn ensure_buffer(
        device: &mut dyn GpuDevice,
        buffer: &mut Option<GpuBuffer>,
        name: &str,
        bytes: usize,
        stride: u32,
        usage: BufferUsage,
    ) -> RenderResult<GpuBuffer> {
        if let Some(existing) = buffer {
            if existing.desc.size as usize >= bytes {
                return Ok(*existing);
            }
        }
        if let Some(old) = buffer.take() {
            device.destroy_buffer(old);
        }
        // Grow in steps so a slowly growing scene does not recreate every frame
        let count = (bytes / stride as usize).max(1).next_power_of_two() as u32;
        let desc = BufferDescriptor {
            size: count as u64 * stride as u64,
            stride,
            usage,
        };
        let created = device
            .create_buffer(name, &desc)
            .map_err(|err| RenderError::resource(name, err))?;
        *buffer = Some(created);
        Ok(created)
    }

    /// Update the atlas layout and rasterize dirty objects. Returns what
    /// consumers bind, `None` when the atlas is off or cannot run.
    pub fn render(&mut self, ctx: &mut RenderContext) -> Option<SurfaceAtlasBindings> {
        if !Self::is_enabled(ctx) {
            return None;
        }
        let (Some(handles), Some(atlas_cb), Some(draw_calls)) = (&self.handles, &self.atlas_cb, &self.draw_calls)
        else {
            return None;
        };

        let frame = ctx.frame_index();
        let mut data = ctx.buffers.take_custom_buffer::<SurfaceAtlasData>(CUSTOM_BUFFER_NAME);
        data.last_frame_used = frame;

        if data.textures.is_none() || data.layout.as_ref().map(AtlasLayout::resolution) != Some(self.resolution) {
            data.release_gpu(ctx.device);
            match self.create_textures(ctx.device) {
                Ok(textures) => {
                    data.textures = Some(textures);
                    data.layout = Some(AtlasLayout::new(self.resolution));
                }
                Err(err) => {
                    log::warn!("GlobalSurfaceAtlasPass: {err}");
                    ctx.buffers.put_custom_buffer(CUSTOM_BUFFER_NAME, data);
                    return None;
                }
            }
        }
        let (Some(textures), Some(layout)) = (data.textures, data.layout.as_mut()) else {
            ctx.buffers.put_custom_buffer(CUSTOM_BUFFER_NAME, data);
            return None;
        };

        if layout.needs_defragmentation(frame) {
            layout.defragment(frame);
        }

        let view_position = ctx.view.position;
        for object in &ctx.list.surface_atlas_objects {
            if let Err(err) = layout.update_object(object, view_position, frame) {
                log::trace!("GlobalSurfaceAtlasPass: object {} skipped, {err}", object.id);
            }
        }
        layout.remove_unused(frame);

        // Object records
        let ids = layout.sorted_ids();
        let resolution = layout.resolution() as f32;
        let origin = ctx.view.origin;
        let mut records = Vec::with_capacity(ids.len() * OBJECT_RECORD_SIZE);
        data.object_addresses.clear();
        for id in &ids {
            let Some(state) = layout.object(*id) else {
                continue;
            };
            data.object_addresses.insert(*id, records.len() as u32);
            write_object_record(&mut records, layout, state, resolution, origin);
        }

        let objects_buffer = match Self::ensure_buffer(
            ctx.device,
            &mut data.objects_buffer,
            "GlobalSurfaceAtlas.Objects",
            records.len().max(1) * std::mem::size_of::<Vec4>(),
            std::mem::size_of::<Vec4>() as u32,
            BufferUsage::TYPED,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                log::warn!("GlobalSurfaceAtlasPass: {err}");
                ctx.buffers.put_custom_buffer(CUSTOM_BUFFER_NAME, data);
                return None;
            }
        };
        if !records.is_empty() {
            ctx.gpu.update_buffer(objects_buffer.handle, 0, bytemuck::cast_slice(&records));
        }

        // Dirty tiles
        let dirty: Vec<u64> = ids
            .iter()
            .copied()
            .filter(|id| layout.object(*id).is_some_and(|s| s.dirty))
            .collect();
        if !dirty.is_empty() {
            let mut vertices = Vec::with_capacity(dirty.len() * SIDES * VERTICES_PER_TILE as usize);
            for id in &dirty {
                if let (Some(state), Some(address)) = (layout.object(*id), data.object_addresses.get(id)) {
                    for (side, tile) in state.tiles.iter().enumerate() {
                        if let Some(rect) = tile.and_then(|t| layout.tile_rect(t)) {
                            push_tile_quad(&mut vertices, rect, resolution, *address, side as u32);
                        }
                    }
                }
            }

            match Self::ensure_buffer(
                ctx.device,
                &mut data.tiles_buffer,
                "GlobalSurfaceAtlas.Tiles",
                vertices.len().max(1) * std::mem::size_of::<TileVertex>(),
                std::mem::size_of::<TileVertex>() as u32,
                BufferUsage::VERTEX,
            ) {
                Ok(tiles_buffer) => {
                    ctx.gpu.push_event("GlobalSurfaceAtlas");
                    let targets = [
                        textures.gbuffer[0].view(),
                        textures.gbuffer[1].view(),
                        textures.gbuffer[2].view(),
                        textures.emissive.view(),
                    ];
                    ctx.gpu.set_render_target(Some(textures.depth.view()), &targets);
                    ctx.gpu.set_viewport_and_scissors(Viewport::from_size(self.resolution, self.resolution));

                    // Clear every dirty tile in one draw
                    ctx.gpu.update_buffer(tiles_buffer.handle, 0, bytemuck::cast_slice(&vertices));
                    ctx.gpu.bind_vb(&[tiles_buffer.handle]);
                    ctx.gpu.set_state(handles.clear);
                    ctx.gpu.draw_instanced(vertices.len() as u32, 1, 0, 0);

                    ctx.gpu.set_state(handles.object);
                    ctx.gpu.bind_cb(ATLAS_CB_SLOT, atlas_cb.handle);
                    for id in &dirty {
                        let (Some(state), Some(object)) = (
                            layout.object(*id),
                            ctx.list.surface_atlas_objects.iter().find(|o| o.id == *id),
                        ) else {
                            continue;
                        };
                        let call = atlas_draw_call(object);
                        let address = data.object_addresses.get(id).copied().unwrap_or(0);
                        for (side, tile) in state.tiles.iter().enumerate() {
                            let Some(rect) = tile.and_then(|t| layout.tile_rect(t)) else {
                                continue;
                            };
                            let cb = AtlasData {
                                tile_view_projection: state.bounds.side_view_projection(side, origin),
                                world: object.world,
                                params: Vec4::new(resolution, 1.0 / resolution, address as f32, side as f32),
                                view_position: (view_position - origin).extend(0.0),
                            };
                            update_cb(ctx.gpu, atlas_cb, &cb);
                            ctx.gpu.set_viewport_and_scissors(Viewport::with_offset(
                                rect.x as f32,
                                rect.y as f32,
                                rect.width as f32,
                                rect.height as f32,
                            ));
                            draw_calls.draw_single(ctx.gpu, &call);
                        }
                    }

                    ctx.gpu.reset_render_target();
                    ctx.gpu.pop_event();
                }
                Err(err) => log::warn!("GlobalSurfaceAtlasPass: {err}"),
            }
        }
        layout.clear_dirty();

        let bindings = SurfaceAtlasBindings {
            depth: textures.depth,
            gbuffer0: textures.gbuffer[0],
            gbuffer1: textures.gbuffer[1],
            gbuffer2: textures.gbuffer[2],
            direct_light: textures.direct_light,
            objects: objects_buffer,
            resolution: self.resolution,
            object_count: ids.len() as u32,
        };
        ctx.buffers.put_custom_buffer(CUSTOM_BUFFER_NAME, data);
        Some(bindings)
    }

    /// Shade the atlas with the frame's lights into the direct light atlas
    pub fn render_direct_lighting(&mut self, ctx: &mut RenderContext, bindings: &SurfaceAtlasBindings) {
        let (Some(handles), Some(light_cb)) = (&self.handles, &self.light_cb) else {
            return;
        };
        let mut data = ctx.buffers.take_custom_buffer::<SurfaceAtlasData>(CUSTOM_BUFFER_NAME);
        let (Some(layout), Some(textures)) = (data.layout.as_ref(), data.textures) else {
            ctx.buffers.put_custom_buffer(CUSTOM_BUFFER_NAME, data);
            return;
        };

        ctx.gpu.push_event("GlobalSurfaceAtlas.DirectLighting");
        // Emissive is the base of the lit atlas
        ctx.gpu.copy_resource(&textures.direct_light, &textures.emissive);

        let resolution = layout.resolution() as f32;
        let ids = layout.sorted_ids();
        let lights = collect_atlas_lights(ctx);
        let mut tiles_buffer = data.tiles_buffer;

        for (kind, light, shader_data) in lights {
            let mut vertices = Vec::new();
            for id in &ids {
                let (Some(state), Some(address)) = (layout.object(*id), data.object_addresses.get(id)) else {
                    continue;
                };
                let radius = state.bounds.half_extents.length();
                if let Some((position, light_radius)) = light.sphere {
                    if state.bounds.center.distance(position) > radius + light_radius {
                        continue;
                    }
                }
                for (side, tile) in state.tiles.iter().enumerate() {
                    let Some(rect) = tile.and_then(|t| layout.tile_rect(t)) else {
                        continue;
                    };
                    if let Some(direction) = light.direction {
                        // Tile view direction is the inverted side normal
                        if (-state.bounds.side_normal(side)).dot(direction) < 0.0 {
                            continue;
                        }
                    }
                    push_tile_quad(&mut vertices, rect, resolution, *address, side as u32);
                }
            }
            if vertices.is_empty() {
                continue;
            }

            let buffer = match Self::ensure_buffer(
                ctx.device,
                &mut tiles_buffer,
                "GlobalSurfaceAtlas.Tiles",
                vertices.len() * std::mem::size_of::<TileVertex>(),
                std::mem::size_of::<TileVertex>() as u32,
                BufferUsage::VERTEX,
            ) {
                Ok(buffer) => buffer,
                Err(err) => {
                    log::warn!("GlobalSurfaceAtlasPass: {err}");
                    break;
                }
            };
            ctx.gpu.update_buffer(buffer.handle, 0, bytemuck::cast_slice(&vertices));

            let cb = AtlasLightData {
                light: shader_data,
                params: Vec4::new(resolution, 1.0 / resolution, kind as f32, bindings.object_count as f32),
            };
            update_cb(ctx.gpu, light_cb, &cb);
            ctx.gpu.bind_cb(LIGHT_CB_SLOT, light_cb.handle);
            ctx.gpu.set_render_target(None, &[textures.direct_light.view()]);
            ctx.gpu.set_viewport_and_scissors(Viewport::from_size(self.resolution, self.resolution));
            ctx.gpu.bind_sr(DEPTH_SR_SLOT, Some(bindings.depth.view().into()));
            ctx.gpu.bind_sr(GBUFFER0_SR_SLOT, Some(bindings.gbuffer0.view().into()));
            ctx.gpu.bind_sr(GBUFFER1_SR_SLOT, Some(bindings.gbuffer1.view().into()));
            ctx.gpu.bind_sr(GBUFFER2_SR_SLOT, Some(bindings.gbuffer2.view().into()));
            ctx.gpu.bind_sr(OBJECTS_SR_SLOT, Some(bindings.objects.handle.into()));
            ctx.gpu.bind_vb(&[buffer.handle]);
            ctx.gpu.set_state(handles.direct_light[kind]);
            ctx.gpu.draw_instanced(vertices.len() as u32, 1, 0, 0);
        }

        data.tiles_buffer = tiles_buffer;
        ctx.gpu.reset_sr();
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();
        ctx.buffers.put_custom_buffer(CUSTOM_BUFFER_NAME, data);
    }
}

/// Light as the atlas culls it
struct AtlasLight {
    /// Direction the light travels, for directional and spot lights
    direction: Option<Vec3>,
    /// Position and range of local lights
    sphere: Option<(Vec3, f32)>,
}

fn collect_atlas_lights(ctx: &RenderContext) -> Vec<(usize, AtlasLight, LightShaderData)> {
    let list = &ctx.list;
    let directional = list.directional_lights.iter().map(|l| {
        (
            0,
            AtlasLight {
                direction: Some(l.direction),
                sphere: None,
            },
            l.shader_data(),
        )
    });
    let point = list.point_lights.iter().map(|l| {
        (
            1,
            AtlasLight {
                direction: None,
                sphere: Some((l.position, l.radius)),
            },
            l.shader_data(),
        )
    });
    let spot = list.spot_lights.iter().map(|l| {
        (
            2,
            AtlasLight {
                direction: Some(l.direction),
                sphere: Some((l.position, l.radius)),
            },
            l.shader_data(),
        )
    });
    directional.chain(point).chain(spot).collect()
}

fn atlas_draw_call(object: &SurfaceAtlasObject) -> DrawCall {
    DrawCall {
        world: object.world,
        prev_world: object.world,
        geometry: object.geometry,
        material: object.material,
        instance_data: InstanceData::None,
        world_determinant_sign: object.world.determinant().signum(),
        per_instance_random: 0.0,
        lod_index: 0,
        lod_dither_factor: 0.0,
        bounds_center: object.bounds_center,
        bounds_radius: object.bounds_radius,
        static_flags: if object.is_static {
            StaticFlags::FULLY_STATIC
        } else {
            StaticFlags::empty()
        },
        casts_shadows: false,
        distance: 0.0,
    }
}

fn write_object_record(
    records: &mut Vec<Vec4>,
    layout: &AtlasLayout,
    state: &AtlasObjectState,
    resolution: f32,
    origin: Vec3,
) {
    let bounds = &state.bounds;
    let center = bounds.center - origin;
    records.push(center.extend(bounds.half_extents.length()));
    // World to local rows
    for axis in bounds.axes {
        records.push(axis.extend(-axis.dot(center)));
    }
    records.push(bounds.half_extents.extend(if state.is_static { 1.0 } else { 0.0 }));
    for (side, tile) in state.tiles.iter().enumerate() {
        match tile.and_then(|t| layout.tile_rect(t)) {
            Some(rect) => {
                records.push(Vec4::new(
                    rect.x as f32 / resolution,
                    rect.y as f32 / resolution,
                    rect.width as f32 / resolution,
                    rect.height as f32 / resolution,
                ));
                let vp = bounds.side_view_projection(side, origin);
                records.extend([vp.x_axis, vp.y_axis, vp.z_axis, vp.w_axis]);
            }
            None => records.extend([Vec4::ZERO; TILE_RECORD_SIZE]),
        }
    }
}

fn push_tile_quad(vertices: &mut Vec<TileVertex>, rect: Rect, resolution: f32, object_address: u32, side: u32) {
    let to_clip = |x: u32, y: u32| Vec2::new(x as f32 / resolution * 2.0 - 1.0, 1.0 - y as f32 / resolution * 2.0);
    let min = to_clip(rect.x, rect.y);
    let max = to_clip(rect.x + rect.width, rect.y + rect.height);
    let corner = |u: f32, v: f32| TileVertex {
        position: Vec2::new(min.x + (max.x - min.x) * u, min.y + (max.y - min.y) * v),
        tile_uv: Vec2::new(u, v),
        object_address,
        side,
    };
    vertices.extend([
        corner(0.0, 0.0),
        corner(1.0, 0.0),
        corner(1.0, 1.0),
        corner(0.0, 0.0),
        corner(1.0, 1.0),
        corner(0.0, 1.0),
    ]);
}

impl RendererPass for GlobalSurfaceAtlasPass {
    fn name(&self) -> &'static str {
        "GlobalSurfaceAtlasPass"
    }

    fn init(&mut self, device: &mut dyn GpuDevice) -> RenderResult<()> {
        if self.depth_format.is_none() {
            self.depth_format = pick_format(
                device,
                &DEPTH_FORMATS,
                FormatSupport::DEPTH_STENCIL | FormatSupport::SHADER_SAMPLE,
            );
            if self.depth_format.is_none() {
                return Err(RenderError::UnsupportedPlatformFeature("sampleable depth format"));
            }
        }
        Ok(())
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        let shader = shaders.require(SHADER)?;
        shader.check_cb(ATLAS_CB_SLOT, std::mem::size_of::<AtlasData>())?;
        shader.check_cb(LIGHT_CB_SLOT, std::mem::size_of::<AtlasLightData>())?;
        self.init(device)?;
        if self.atlas_cb.is_none() {
            self.atlas_cb = Some(create_constant_buffer::<AtlasData>(device, "GlobalSurfaceAtlas.CB")?);
        }
        if self.light_cb.is_none() {
            self.light_cb = Some(create_constant_buffer::<AtlasLightData>(device, "GlobalSurfaceAtlas.LightCB")?);
        }
        if self.draw_calls.is_none() {
            self.draw_calls = Some(DrawCallsRenderer::new(device, "GlobalSurfaceAtlas")?);
        }
        match self.create_states(device) {
            Ok(handles) => {
                self.handles = Some(handles);
                Ok(())
            }
            Err(err) => {
                self.states.release(device);
                Err(err)
            }
        }
    }

    fn on_shader_reloading(&mut self, device: &mut dyn GpuDevice, shader: &str) {
        if shader == SHADER {
            self.states.release(device);
            self.handles = None;
        }
    }

    fn dispose(&mut self, device: &mut dyn GpuDevice) {
        self.states.release(device);
        self.handles = None;
        for cb in [self.atlas_cb.take(), self.light_cb.take()].into_iter().flatten() {
            device.destroy_buffer(cb);
        }
        if let Some(draw_calls) = self.draw_calls.take() {
            draw_calls.release(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_utils::TestFrame;
    use crate::resources::{GpuMesh, Mesh};
    use crate::scene::{MaterialInfo, RenderDirectionalLightData};

    fn object(device: &mut RecordingDevice, id: u64, position: Vec3, scale: f32, is_static: bool) -> SurfaceAtlasObject {
        let mesh = GpuMesh::upload(device, &Mesh::cube()).unwrap();
        let world = Mat4::from_scale_rotation_translation(Vec3::splat(scale), glam::Quat::IDENTITY, position);
        SurfaceAtlasObject {
            id,
            world,
            local_bounds_min: Vec3::splat(-0.5),
            local_bounds_max: Vec3::splat(0.5),
            bounds_center: position,
            bounds_radius: scale * 0.87,
            is_static,
            geometry: mesh,
            material: MaterialInfo::default(),
        }
    }

    fn gi_frame() -> TestFrame {
        let mut frame = TestFrame::new(64, 64);
        frame.list.settings.global_illumination.enabled = true;
        frame
    }

    #[test]
    fn test_tile_resolution() {
        assert_eq!(tile_resolution(10.0, 0.0), MIN_TILE_RESOLUTION);
        assert_eq!(tile_resolution(500.0, 0.0), 48);
        assert_eq!(tile_resolution(100_000.0, 0.0), MAX_TILE_RESOLUTION);
        // Far objects get a tenth of the texels
        assert_eq!(tile_resolution(5000.0, 6000.0), 48);
        assert_eq!(tile_resolution(500.0, 3500.0) % TILE_ALIGNMENT, 0);
    }

    #[test]
    fn test_record_layout() {
        assert_eq!(OBJECT_RECORD_SIZE, 35);
        assert_eq!(std::mem::size_of::<AtlasData>() % 16, 0);
        assert_eq!(std::mem::size_of::<AtlasLightData>() % 16, 0);
    }

    #[test]
    fn test_side_normals_are_opposite() {
        let mut device = RecordingDevice::new();
        let bounds = ObjectBounds::from_object(&object(&mut device, 1, Vec3::ZERO, 100.0, true));
        for side in (0..SIDES).step_by(2) {
            assert!((bounds.side_normal(side) + bounds.side_normal(side + 1)).length() < 1e-5);
        }
        assert!((bounds.half_extents - Vec3::splat(50.0)).length() < 1e-3);
    }

    #[test]
    fn test_static_object_tiles_are_stable() {
        let mut device = RecordingDevice::new();
        let cube = object(&mut device, 7, Vec3::new(0.0, 0.0, -300.0), 400.0, true);
        let mut layout = AtlasLayout::new(DEFAULT_RESOLUTION);

        layout.update_object(&cube, Vec3::ZERO, 1).unwrap();
        let first: Vec<Rect> = layout.object(7).unwrap().tiles.iter().map(|t| layout.tile_rect(t.unwrap()).unwrap()).collect();
        assert!(layout.object(7).unwrap().dirty);
        layout.clear_dirty();

        layout.update_object(&cube, Vec3::ZERO, 2).unwrap();
        let state = layout.object(7).unwrap();
        let second: Vec<Rect> = state.tiles.iter().map(|t| layout.tile_rect(t.unwrap()).unwrap()).collect();
        assert_eq!(first, second);
        assert!(!state.dirty);
    }

    #[test]
    fn test_redraw_timer() {
        let mut device = RecordingDevice::new();
        let cube = object(&mut device, 3, Vec3::new(0.0, 0.0, -300.0), 100.0, false);
        let mut layout = AtlasLayout::new(512);
        layout.update_object(&cube, Vec3::ZERO, 1).unwrap();
        layout.clear_dirty();

        let mut redraws = Vec::new();
        for frame in 2..=60 {
            layout.update_object(&cube, Vec3::ZERO, frame).unwrap();
            if layout.object(3).unwrap().dirty {
                redraws.push(frame);
            }
            layout.clear_dirty();
        }
        assert!(redraws.len() >= 13);
        assert!(redraws.windows(2).all(|w| w[1] - w[0] == DYNAMIC_REDRAW_FRAMES));
    }

    #[test]
    fn test_full_atlas_defragments_after_interval() {
        let mut device = RecordingDevice::new();
        // Six 128 tiles fill a 256 atlas after one object
        let mut layout = AtlasLayout::new(256);
        let big = object(&mut device, 1, Vec3::new(0.0, 0.0, -100.0), 10_000.0, true);
        let other = object(&mut device, 2, Vec3::new(0.0, 0.0, -200.0), 10_000.0, true);
        assert!(layout.update_object(&big, Vec3::ZERO, 100).is_err());
        assert_eq!(layout.last_frame_insert_fail, Some(100));
        assert_eq!(layout.object_count(), 0);

        layout.last_frame_defragmentation = 0;
        assert!(layout.needs_defragmentation(105));
        layout.defragment(105);
        assert_eq!(layout.object_count(), 0);
        assert_eq!(layout.last_frame_defragmentation, 105);

        // Too soon after the last defragmentation
        let _ = layout.update_object(&other, Vec3::ZERO, 110);
        assert!(!layout.needs_defragmentation(111));
        // Failure too old
        layout.last_frame_defragmentation = 0;
        assert!(!layout.needs_defragmentation(200));
    }

    #[test]
    fn test_unused_objects_release_tiles() {
        let mut device = RecordingDevice::new();
        let mut layout = AtlasLayout::new(DEFAULT_RESOLUTION);
        let a = object(&mut device, 1, Vec3::new(0.0, 0.0, -300.0), 100.0, true);
        let b = object(&mut device, 2, Vec3::new(0.0, 0.0, -600.0), 100.0, true);
        layout.update_object(&a, Vec3::ZERO, 1).unwrap();
        layout.update_object(&b, Vec3::ZERO, 1).unwrap();
        layout.update_object(&a, Vec3::ZERO, 2).unwrap();
        layout.remove_unused(2);
        assert_eq!(layout.sorted_ids(), vec![1]);
    }

    #[test]
    fn test_render_draws_dirty_tiles_once() {
        let mut frame = gi_frame();
        let cube = object(&mut frame.device, 9, Vec3::new(0.0, 0.0, -300.0), 200.0, true);
        frame.list.surface_atlas_objects.push(cube);
        frame.list.directional_lights.push(RenderDirectionalLightData {
            direction: -Vec3::ONE.normalize(),
            ..Default::default()
        });

        let mut pass = GlobalSurfaceAtlasPass::new(512, DEFAULT_WORLD_RADIUS);
        frame.setup(&mut pass);
        let bindings = pass.render(&mut frame.ctx()).unwrap();
        assert_eq!(bindings.object_count, 1);
        assert_eq!(bindings.resolution, 512);
        // Clear plus six sides
        assert_eq!(frame.gpu.commands_in_event("GlobalSurfaceAtlas").iter().filter(|c| c.is_draw()).count(), 7);

        pass.render_direct_lighting(&mut frame.ctx(), &bindings);
        let lighting = frame.gpu.commands_in_event("GlobalSurfaceAtlas.DirectLighting");
        // Three sides face a directional light
        assert!(lighting.contains(&GpuCommand::DrawInstanced {
            vertices: 3 * VERTICES_PER_TILE,
            instances: 1
        }));

        frame.gpu.clear();
        frame.frame.frame_index += 1;
        pass.render(&mut frame.ctx()).unwrap();
        assert!(frame.gpu.commands_in_event("GlobalSurfaceAtlas").is_empty());
    }

    #[test]
    fn test_disabled_without_gi() {
        let mut frame = TestFrame::new(64, 64);
        let mut pass = GlobalSurfaceAtlasPass::default();
        frame.setup(&mut pass);
        assert!(pass.render(&mut frame.ctx()).is_none());
        assert!(!frame.buffers.has_custom_buffer(CUSTOM_BUFFER_NAME));
    }
}
