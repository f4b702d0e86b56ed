//! Shadow maps and screen-space shadow masks
//!
//! [`ShadowsPass::setup_shadows`] gives every shadowed light its render
//! contexts: one stabilized orthographic view per cascade for directional
//! lights, six cube faces for point lights and a single projector for spot
//! lights. Maps are pooled per frame and go back to the pool in
//! [`ShadowsPass::release_frame`].

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::draw::{cull_index, cull_mode, light_volume, DrawCallsRenderer, LIGHT_SPHERE_RINGS, LIGHT_SPHERE_SEGMENTS};
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::{GpuMesh, Mesh, ShaderLibrary};
use crate::scene::{
    DrawCallsListType, GpuViewData, LightShaderData, PartitionMode, Quality, RenderDirectionalLightData,
    RenderLightBase, RenderView, ViewFlags, EPSILON,
};

pub const SHADER: &str = "Shaders/Shadows";
pub const DEPTH_SHADER: &str = "Shaders/ShadowDepth";

pub const MAX_CSM_CASCADES: usize = 4;
/// Near plane of point and spot light shadow projections
pub const LOCAL_LIGHT_NEAR_PLANE: f32 = 10.0;
/// Half depth of the cascade frustum used to select casters
pub const CASCADE_CULLING_RANGE: f32 = 100_000.0;
const PSSM_LAMBDA: f32 = 0.5;

pub const MASK_CB_SLOT: u32 = 0;
pub const DEPTH_CB_SLOT: u32 = 0;
/// GBuffer0..3 occupy slots 0..=3
pub const GBUFFER_SR_SLOT: u32 = 0;
pub const DEPTH_SR_SLOT: u32 = 4;
pub const SHADOW_MAP_SR_SLOT: u32 = 5;

/// Candidate shadow map formats in order of preference
pub const SHADOW_MAP_FORMATS: [TextureFormat; 3] = [
    TextureFormat::Depth16Unorm,
    TextureFormat::Depth24PlusStencil8,
    TextureFormat::Depth32Float,
];

/// `T = diag(0.5, -0.5, 1, 1) + translate(0.5, 0.5, 0)`, clip space to shadow map UV
pub const SHADOW_TEXTURE_MATRIX: Mat4 = Mat4::from_cols_array(&[
    0.5, 0.0, 0.0, 0.0, //
    0.0, -0.5, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.5, 0.5, 0.0, 1.0,
]);

/// Per-light shadow constants
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ShadowConstants {
    /// `T * VP` per cascade or cube face, transposed
    pub shadow_matrices: [Mat4; 6],
    /// View distance where each cascade ends
    pub cascade_splits: Vec4,
    /// (sharpness, fade * strength, normal offset scale, depth bias)
    pub params: Vec4,
    /// (fade distance, cascade count, 1 / map size, contact shadows length)
    pub params2: Vec4,
    /// (shadows distance, unused...)
    pub params3: Vec4,
}

impl ShadowConstants {
    pub fn num_cascades(&self) -> u32 {
        self.params2.y as u32
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ShadowMaskData {
    pub view: GpuViewData,
    pub wvp: Mat4,
    pub light: LightShaderData,
    pub shadow: ShadowConstants,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ShadowDepthData {
    pub view_projection: Mat4,
    /// (depth bias, normal offset scale, unused, unused)
    pub params: Vec4,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(SHADER, &[std::mem::size_of::<ShadowMaskData>()]);
    library.register(DEPTH_SHADER, &[std::mem::size_of::<ShadowDepthData>()]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowLightKind {
    Directional,
    Point,
    Spot,
}

/// Shadow state of one light for the current frame
#[derive(Debug, Clone)]
pub struct LightShadow {
    pub kind: ShadowLightKind,
    /// Index of the light in its render list array
    pub light_index: usize,
    pub map_size: u32,
    /// One view per cascade or cube face
    pub contexts: Vec<RenderView>,
    pub constants: ShadowConstants,
    pub fade: f32,
    pub map: Option<GpuTexture>,
}

/// First format that is both a depth target and comparison-sampleable
pub fn select_shadow_map_format(device: &dyn GpuDevice) -> Option<TextureFormat> {
    let required = FormatSupport::DEPTH_STENCIL | FormatSupport::SHADER_SAMPLE_COMPARISON;
    SHADOW_MAP_FORMATS
        .into_iter()
        .find(|format| device.format_support(*format).contains(required))
}

/// (cascade map size, cube face size)
pub fn shadow_map_sizes(quality: Quality) -> (u32, u32) {
    match quality {
        Quality::Low => (512, 256),
        Quality::Medium => (1024, 512),
        Quality::High | Quality::Ultra => (2048, 1024),
    }
}

/// View distances where each cascade ends. Entries past `cascade_count`
/// repeat the last split. Splits are non-decreasing and stay within
/// `[near, near + shadows_distance]`, clamped to the far plane.
pub fn cascade_splits(
    mode: PartitionMode,
    spacing: &[f32; MAX_CSM_CASCADES],
    cascade_count: u32,
    near: f32,
    far: f32,
    shadows_distance: f32,
) -> [f32; MAX_CSM_CASCADES] {
    let count = cascade_count.clamp(1, MAX_CSM_CASCADES as u32) as usize;
    let min_distance = near.max(EPSILON);
    let max_distance = min_distance + shadows_distance.min(far - near).max(EPSILON);
    let range = max_distance - min_distance;

    let mut splits = [max_distance; MAX_CSM_CASCADES];
    let mut previous = min_distance;
    for (i, split) in splits.iter_mut().enumerate().take(count) {
        let t = (i + 1) as f32 / count as f32;
        let logarithmic = min_distance * (max_distance / min_distance).powf(t);
        let uniform = min_distance + range * t;
        let distance = match mode {
            PartitionMode::Manual => min_distance + range * spacing[i].clamp(0.0, 1.0),
            PartitionMode::Logarithmic => logarithmic,
            PartitionMode::PSSM => uniform + (logarithmic - uniform) * PSSM_LAMBDA,
        };
        *split = if i + 1 == count {
            max_distance
        } else {
            distance.clamp(previous, max_distance)
        };
        previous = *split;
    }
    splits
}

/// Distance fade of a local light shadow, 0 when too far to render
pub fn local_light_shadow_fade(
    view_position: Vec3,
    light_position: Vec3,
    light_radius: f32,
    shadows_distance: f32,
    fade_distance: f32,
) -> f32 {
    let fade_distance = fade_distance.max(0.1);
    let distance = view_position.distance(light_position);
    1.0 - ((distance - light_radius - shadows_distance + fade_distance) / fade_distance).clamp(0.0, 1.0)
}

/// Whether a point or spot light shadow is worth rendering this frame
pub fn can_render_local_shadow(
    view: &RenderView,
    base: &RenderLightBase,
    position: Vec3,
    radius: f32,
    max_distance: f32,
) -> bool {
    let distance = base.shadow.distance.min(max_distance);
    let fade = local_light_shadow_fade(view.position, position, radius, distance, base.shadow.fade_distance);
    fade > EPSILON && base.shadow.strength > EPSILON
}

/// Orthographic cascade around a frustum slice, snapped to shadow map
/// texels so a static camera produces identical matrices every frame.
/// Returns `(view, projection, culling projection)`.
pub fn stabilized_cascade(corners: &[Vec3; 8], direction: Vec3, map_size: u32) -> (Mat4, Mat4, Mat4) {
    let center = corners.iter().copied().sum::<Vec3>() / 8.0;
    let radius = corners
        .iter()
        .map(|corner| corner.distance(center))
        .fold(0.0f32, f32::max);
    let radius = ((radius * 16.0).ceil() / 16.0).max(1.0 / 16.0);

    let up = if direction.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y };
    let rotation = Mat4::look_to_rh(Vec3::ZERO, direction, up);
    let texels_per_unit = map_size as f32 / (radius * 2.0);
    let mut light_space = rotation.transform_point3(center);
    light_space.x = (light_space.x * texels_per_unit).floor() / texels_per_unit;
    light_space.y = (light_space.y * texels_per_unit).floor() / texels_per_unit;
    let snapped = rotation.transpose().transform_point3(light_space);

    let view = Mat4::look_to_rh(snapped, direction, up);
    let projection = Mat4::orthographic_rh(-radius, radius, -radius, radius, -radius, radius);
    let culling = Mat4::orthographic_rh(
        -radius,
        radius,
        -radius,
        radius,
        -CASCADE_CULLING_RANGE,
        CASCADE_CULLING_RANGE,
    );
    (view, projection, culling)
}

fn shadow_matrix(view_projection: Mat4) -> Mat4 {
    (SHADOW_TEXTURE_MATRIX * view_projection).transpose()
}

fn lerp_corners(corners: &[Vec3; 8], near: f32, far: f32, from: f32, to: f32) -> [Vec3; 8] {
    let range = (far - near).max(EPSILON);
    let (t0, t1) = ((from - near) / range, (to - near) / range);
    let mut slice = [Vec3::ZERO; 8];
    for i in 0..4 {
        let (near_corner, far_corner) = (corners[i], corners[i + 4]);
        slice[i] = near_corner.lerp(far_corner, t0);
        slice[i + 4] = near_corner.lerp(far_corner, t1);
    }
    slice
}

fn base_constants(base: &RenderLightBase, fade: f32, map_size: u32, shadows_distance: f32) -> ShadowConstants {
    let shadow = &base.shadow;
    ShadowConstants {
        shadow_matrices: [Mat4::IDENTITY; 6],
        cascade_splits: Vec4::ZERO,
        params: Vec4::new(shadow.sharpness, fade * shadow.strength, shadow.normal_offset_scale, shadow.depth_bias),
        params2: Vec4::new(
            shadow.fade_distance,
            1.0,
            1.0 / map_size as f32,
            shadow.contact_shadows_length,
        ),
        params3: Vec4::new(shadows_distance, 0.0, 0.0, 0.0),
    }
}

/// Shadow contexts of a directional light
pub fn setup_directional_shadow(
    view: &RenderView,
    light: &RenderDirectionalLightData,
    light_index: usize,
    map_size: u32,
    max_distance: f32,
) -> LightShadow {
    let shadows_distance = light.base.shadow.distance.min(max_distance);
    let cascade_count = light.cascade_count.clamp(1, MAX_CSM_CASCADES as u32);
    let splits = cascade_splits(
        light.partition_mode,
        &light.cascade_spacing,
        cascade_count,
        view.near,
        view.far,
        shadows_distance,
    );

    let corners = view.frustum.corners();
    let mut constants = base_constants(&light.base, 1.0, map_size, shadows_distance);
    constants.cascade_splits = Vec4::from_array(splits);
    constants.params2.y = cascade_count as f32;

    let mut contexts = Vec::with_capacity(cascade_count as usize);
    let mut previous = view.near;
    for (cascade, split) in splits.iter().take(cascade_count as usize).enumerate() {
        let slice = lerp_corners(&corners, view.near, view.far, previous, *split);
        let (light_view, projection, culling) = stabilized_cascade(&slice, light.direction, map_size);

        let mut context = RenderView::new();
        context.origin = view.origin;
        context.set_screen_size(map_size, map_size);
        context.is_orthographic = true;
        context.is_single_frame = true;
        context.fov_y = 0.0;
        context.direction = light.direction;
        context.position = light_view.inverse().transform_point3(Vec3::ZERO) + view.origin;
        context.near = -CASCADE_CULLING_RANGE;
        context.far = CASCADE_CULLING_RANGE;
        context.set_up_with_culling(light_view, projection, culling * light_view);
        constants.shadow_matrices[cascade] = shadow_matrix(context.view_projection);
        contexts.push(context);
        previous = *split;
    }

    LightShadow {
        kind: ShadowLightKind::Directional,
        light_index,
        map_size,
        contexts,
        constants,
        fade: 1.0,
        map: None,
    }
}

/// Six cube face contexts of a point light
pub fn setup_point_shadow(
    view: &RenderView,
    base: &RenderLightBase,
    position: Vec3,
    radius: f32,
    light_index: usize,
    map_size: u32,
    max_distance: f32,
) -> LightShadow {
    let shadows_distance = base.shadow.distance.min(max_distance);
    let fade = local_light_shadow_fade(view.position, position, radius, shadows_distance, base.shadow.fade_distance);
    let mut constants = base_constants(base, fade, map_size, shadows_distance);
    let far = radius.max(LOCAL_LIGHT_NEAR_PLANE + 1.0);

    let contexts = (0..6)
        .map(|face| {
            let mut context = RenderView::new();
            context.origin = view.origin;
            context.is_single_frame = true;
            context.set_face(face, position, LOCAL_LIGHT_NEAR_PLANE, far);
            constants.shadow_matrices[face] = shadow_matrix(context.view_projection);
            context
        })
        .collect();

    LightShadow {
        kind: ShadowLightKind::Point,
        light_index,
        map_size,
        contexts,
        constants,
        fade,
        map: None,
    }
}

/// Single projector context of a spot light
#[allow(clippy::too_many_arguments)]
pub fn setup_spot_shadow(
    view: &RenderView,
    base: &RenderLightBase,
    position: Vec3,
    direction: Vec3,
    up: Vec3,
    radius: f32,
    outer_cone_angle: f32,
    light_index: usize,
    map_size: u32,
    max_distance: f32,
) -> LightShadow {
    let shadows_distance = base.shadow.distance.min(max_distance);
    let fade = local_light_shadow_fade(view.position, position, radius, shadows_distance, base.shadow.fade_distance);
    let mut constants = base_constants(base, fade, map_size, shadows_distance);

    let mut context = RenderView::new();
    context.origin = view.origin;
    context.is_single_frame = true;
    let up = if direction.cross(up).length_squared() < EPSILON {
        direction.any_orthonormal_vector()
    } else {
        up
    };
    let fov = (outer_cone_angle * 2.0).to_radians().clamp(0.01, std::f32::consts::PI - 0.01);
    context.set_projector(
        LOCAL_LIGHT_NEAR_PLANE,
        radius.max(LOCAL_LIGHT_NEAR_PLANE + 1.0),
        position,
        direction,
        up,
        fov,
    );
    constants.shadow_matrices[0] = shadow_matrix(context.view_projection);

    LightShadow {
        kind: ShadowLightKind::Spot,
        light_index,
        map_size,
        contexts: vec![context],
        constants,
        fade,
        map: None,
    }
}

struct ShadowStates {
    /// Back, Front, None culling
    depth: [PipelineStateHandle; 3],
    /// Indexed by `key * 2 + cascade blending`
    directional: Vec<PipelineStateHandle>,
    /// `[outside, inside][key]`
    point: [Vec<PipelineStateHandle>; 2],
    spot: [Vec<PipelineStateHandle>; 2],
}

/// Number of mask permutations: quality 0..3, plus 4 with contact shadows
const MASK_KEYS: u32 = 8;

/// Shadow maps and shadow mask rendering
#[derive(Default)]
pub struct ShadowsPass {
    states: PipelineStates,
    handles: Option<ShadowStates>,
    mask_cb: Option<GpuBuffer>,
    depth_cb: Option<GpuBuffer>,
    draw_calls: Option<DrawCallsRenderer>,
    sphere: Option<GpuMesh>,
    format: Option<TextureFormat>,
    format_selected: bool,
    lights: Vec<LightShadow>,
}

impl ShadowsPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.handles.is_some()
    }

    /// Shadows are disabled when the device has no usable depth format
    pub fn is_supported(&self) -> bool {
        self.format.is_some()
    }

    pub fn shadow_map_format(&self) -> Option<TextureFormat> {
        self.format
    }

    /// Shadow data of this frame, indexed by `RenderLightBase::shadow_data_index`
    pub fn lights(&self) -> &[LightShadow] {
        &self.lights
    }

    pub fn shadow(&self, shadow_data_index: i32) -> Option<&LightShadow> {
        usize::try_from(shadow_data_index).ok().and_then(|index| self.lights.get(index))
    }

    fn create_states(&mut self, device: &mut dyn GpuDevice) -> RenderResult<ShadowStates> {
        let depth_base = PipelineStateDescriptor::geometry(DEPTH_SHADER, "VS_Depth", None).with_depth(
            true,
            true,
            CompareFunction::LessEqual,
        );
        let depth = [
            self.states.create(device, &depth_base.clone().with_cull(CullMode::Back))?,
            self.states.create(device, &depth_base.clone().with_cull(CullMode::Front))?,
            self.states.create(device, &depth_base.clone().with_cull(CullMode::None))?,
        ];

        let mut directional = Vec::with_capacity(MASK_KEYS as usize * 2);
        for permutation in 0..MASK_KEYS * 2 {
            let desc = PipelineStateDescriptor::fullscreen(SHADER, "PS_DirLight")
                .with_permutation(permutation)
                .with_write_mask(ColorWrites::RED);
            directional.push(self.states.create(device, &desc)?);
        }

        let mut local = |ps: &str| -> RenderResult<[Vec<PipelineStateHandle>; 2]> {
            let mut outside = Vec::with_capacity(MASK_KEYS as usize);
            let mut inside = Vec::with_capacity(MASK_KEYS as usize);
            for key in 0..MASK_KEYS {
                let desc = PipelineStateDescriptor::geometry(SHADER, "VS_Model", Some(ps))
                    .with_permutation(key)
                    .with_write_mask(ColorWrites::RED);
                outside.push(self.states.create(device, &desc.clone().with_cull(CullMode::Back))?);
                inside.push(self.states.create(device, &desc.with_cull(CullMode::Back.inverted()))?);
            }
            Ok([outside, inside])
        };
        let point = local("PS_PointLight")?;
        let spot = local("PS_SpotLight")?;

        Ok(ShadowStates {
            depth,
            directional,
            point,
            spot,
        })
    }

    /// Give every shadowed light in the list its contexts and
    /// `shadow_data_index`. Lights whose shadow fades out keep index -1.
    pub fn setup_shadows(&mut self, ctx: &mut RenderContext) {
        self.lights.clear();
        for light in &mut ctx.list.directional_lights {
            light.base.shadow_data_index = -1;
        }
        for light in &mut ctx.list.point_lights {
            light.base.shadow_data_index = -1;
        }
        for light in &mut ctx.list.spot_lights {
            light.base.shadow_data_index = -1;
        }
        if self.format.is_none() || !ctx.view.flags.contains(ViewFlags::SHADOWS) {
            return;
        }

        let settings = ctx.list.settings.shadows.clone();
        let (csm_size, cube_size) = shadow_map_sizes(settings.quality);

        for (index, light) in ctx.list.directional_lights.iter_mut().enumerate() {
            if !light.base.casts_shadow() {
                continue;
            }
            light.base.shadow_data_index = self.lights.len() as i32;
            self.lights
                .push(setup_directional_shadow(&ctx.view, light, index, csm_size, settings.max_distance));
        }

        for (index, light) in ctx.list.point_lights.iter_mut().enumerate() {
            if !can_render_local_shadow(&ctx.view, &light.base, light.position, light.radius, settings.max_distance) {
                continue;
            }
            light.base.shadow_data_index = self.lights.len() as i32;
            self.lights.push(setup_point_shadow(
                &ctx.view,
                &light.base,
                light.position,
                light.radius,
                index,
                cube_size,
                settings.max_distance,
            ));
        }

        for (index, light) in ctx.list.spot_lights.iter_mut().enumerate() {
            if !can_render_local_shadow(&ctx.view, &light.base, light.position, light.radius, settings.max_distance) {
                continue;
            }
            light.base.shadow_data_index = self.lights.len() as i32;
            self.lights.push(setup_spot_shadow(
                &ctx.view,
                &light.base,
                light.position,
                light.direction,
                light.up,
                light.radius,
                light.outer_cone_angle,
                index,
                csm_size / 2,
                settings.max_distance,
            ));
        }

        if !self.lights.is_empty() {
            log::trace!("ShadowsPass: {} shadowed lights", self.lights.len());
        }
    }

    /// Render the depth maps of every light set up this frame
    pub fn render_shadow_maps(&mut self, ctx: &mut RenderContext) {
        let (Some(handles), Some(depth_cb), Some(draw_calls), Some(format)) =
            (&self.handles, &self.depth_cb, &self.draw_calls, self.format)
        else {
            return;
        };
        if self.lights.is_empty() {
            return;
        }

        ctx.gpu.push_event("ShadowMaps");
        let flags = TextureFlags::DEPTH_STENCIL | TextureFlags::SHADER_RESOURCE;
        for shadow in self.lights.iter_mut() {
            let size = shadow.map_size;
            let desc = match shadow.kind {
                ShadowLightKind::Directional => TextureDescriptor::new_2d_array(
                    size,
                    size,
                    shadow.contexts.len() as u32,
                    format,
                    flags | TextureFlags::PER_SLICE_VIEWS,
                ),
                ShadowLightKind::Point => TextureDescriptor::new_cube(size, format, flags | TextureFlags::PER_SLICE_VIEWS, 1),
                ShadowLightKind::Spot => TextureDescriptor::new_2d(size, size, format, flags),
            };
            let map = match ctx.get_temporary("ShadowMap", &desc) {
                Ok(map) => map,
                Err(err) => {
                    log::warn!("ShadowsPass: {err}");
                    continue;
                }
            };

            let data = ShadowDepthData {
                view_projection: Mat4::IDENTITY,
                params: Vec4::new(
                    shadow.constants.params.w,
                    shadow.constants.params.z,
                    0.0,
                    0.0,
                ),
            };
            ctx.gpu.set_viewport_and_scissors(Viewport::from_size(size, size));
            for (slice, context) in shadow.contexts.iter().enumerate() {
                let target = match shadow.kind {
                    ShadowLightKind::Spot => map.view(),
                    _ => map.view_slice(slice as u32),
                };
                ctx.gpu.clear_depth(target, 1.0);
                ctx.gpu.set_render_target(Some(target), &[]);
                update_cb(
                    ctx.gpu,
                    depth_cb,
                    &ShadowDepthData {
                        view_projection: context.view_projection,
                        ..data
                    },
                );
                ctx.gpu.bind_cb(DEPTH_CB_SLOT, depth_cb.handle);

                for &index in &ctx.list.list(DrawCallsListType::ShadowDepth).indices {
                    let call = &ctx.list.draw_calls[index];
                    if !context
                        .culling_frustum
                        .intersects_sphere(call.bounds_center - context.origin, call.bounds_radius)
                    {
                        continue;
                    }
                    ctx.gpu.set_state(handles.depth[cull_index(cull_mode(call))]);
                    draw_calls.draw_single(ctx.gpu, call);
                }
            }
            shadow.map = Some(map);
        }
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();
    }

    /// Render the screen-space shadow of a light into `mask` (red channel,
    /// white is unshadowed). Returns false when the light has no shadow.
    pub fn render_shadow_mask(
        &self,
        ctx: &mut RenderContext,
        kind: ShadowLightKind,
        light_index: usize,
        mask: &GpuTexture,
    ) -> bool {
        let (Some(handles), Some(mask_cb)) = (&self.handles, &self.mask_cb) else {
            return false;
        };
        let (data_index, light, volume) = match kind {
            ShadowLightKind::Directional => match ctx.list.directional_lights.get(light_index) {
                Some(l) => (l.base.shadow_data_index, l.shader_data(), None),
                None => return false,
            },
            ShadowLightKind::Point => match ctx.list.point_lights.get(light_index) {
                Some(l) => (l.base.shadow_data_index, l.shader_data(), Some((l.position, l.radius))),
                None => return false,
            },
            ShadowLightKind::Spot => match ctx.list.spot_lights.get(light_index) {
                Some(l) => (l.base.shadow_data_index, l.shader_data(), Some((l.position, l.radius))),
                None => return false,
            },
        };
        let Some(shadow) = self.shadow(data_index) else {
            return false;
        };
        let Some(map) = shadow.map else {
            return false;
        };
        let (Some(depth), Some(gbuffer)) = (ctx.buffers.depth_buffer().copied(), ctx.buffers.gbuffers()) else {
            return false;
        };

        let settings = &ctx.list.settings.shadows;
        let contact = settings.contact_shadows
            && ctx.view.flags.contains(ViewFlags::CONTACT_SHADOWS)
            && shadow.constants.params2.w > 0.0;
        let key = settings.quality.index() + if contact { 4 } else { 0 };

        let (wvp, state, sphere) = match (kind, volume) {
            (ShadowLightKind::Directional, _) | (_, None) => {
                let blend = u32::from(shadow.constants.num_cascades() > 1);
                (Mat4::IDENTITY, handles.directional[(key * 2 + blend) as usize], None)
            }
            (kind, Some((position, radius))) => {
                let (wvp, inside) = light_volume(&ctx.view, position, radius);
                let states = if kind == ShadowLightKind::Point {
                    &handles.point
                } else {
                    &handles.spot
                };
                (wvp, states[usize::from(inside)][key as usize], self.sphere)
            }
        };

        let data = ShadowMaskData {
            view: ctx.view.shader_data(),
            wvp,
            light,
            shadow: shadow.constants,
        };

        ctx.gpu.push_event("ShadowMask");
        ctx.gpu.clear(mask.view(), Color::WHITE);
        ctx.gpu.set_render_target(None, &[mask.view()]);
        ctx.gpu.set_viewport_and_scissors(ctx.buffers.viewport());
        for (slot, target) in gbuffer.iter().enumerate() {
            ctx.gpu.bind_sr(GBUFFER_SR_SLOT + slot as u32, Some(target.view().into()));
        }
        ctx.gpu.bind_sr(DEPTH_SR_SLOT, Some(depth.view().into()));
        ctx.gpu.bind_sr(SHADOW_MAP_SR_SLOT, Some(map.view().into()));
        update_cb(ctx.gpu, mask_cb, &data);
        ctx.gpu.bind_cb(MASK_CB_SLOT, mask_cb.handle);
        ctx.gpu.set_state(state);
        match sphere {
            Some(sphere) => sphere.draw(ctx.gpu, 1),
            None => ctx.gpu.draw_fullscreen_triangle(1),
        }
        ctx.gpu.reset_sr();
        ctx.gpu.pop_event();
        true
    }

    /// Return every shadow map to the pool
    pub fn release_frame(&mut self, ctx: &RenderContext) {
        for shadow in &mut self.lights {
            if let Some(map) = shadow.map.take() {
                ctx.release(map);
            }
        }
        self.lights.clear();
    }
}

impl RendererPass for ShadowsPass {
    fn name(&self) -> &'static str {
        "ShadowsPass"
    }

    fn init(&mut self, device: &mut dyn GpuDevice) -> RenderResult<()> {
        if !self.format_selected {
            self.format = select_shadow_map_format(device);
            self.format_selected = true;
            match self.format {
                Some(format) => log::debug!("ShadowsPass: using {format:?} shadow maps"),
                None => log::warn!("ShadowsPass: no depth format supports comparison sampling, shadows are disabled"),
            }
        }
        if self.sphere.is_none() {
            let mesh = GpuMesh::upload(device, &Mesh::sphere(LIGHT_SPHERE_SEGMENTS, LIGHT_SPHERE_RINGS))
                .map_err(|err| RenderError::resource("ShadowSphere", err))?;
            self.sphere = Some(mesh);
        }
        if self.draw_calls.is_none() {
            self.draw_calls = Some(DrawCallsRenderer::new(device, "ShadowDepth")?);
        }
        Ok(())
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        shaders.require(SHADER)?.check_cb(0, std::mem::size_of::<ShadowMaskData>())?;
        shaders.require(DEPTH_SHADER)?.check_cb(0, std::mem::size_of::<ShadowDepthData>())?;

        self.init(device)?;
        if self.mask_cb.is_none() {
            self.mask_cb = Some(create_constant_buffer::<ShadowMaskData>(device, "ShadowMask.CB")?);
        }
        if self.depth_cb.is_none() {
            self.depth_cb = Some(create_constant_buffer::<ShadowDepthData>(device, "ShadowDepth.CB")?);
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
        if shader == SHADER || shader == DEPTH_SHADER {
            self.states.release(device);
            self.handles = None;
        }
    }

    fn dispose(&mut self, device: &mut dyn GpuDevice) {
        self.states.release(device);
        self.handles = None;
        for buffer in [self.mask_cb.take(), self.depth_cb.take()].into_iter().flatten() {
            device.destroy_buffer(buffer);
        }
        if let Some(draw_calls) = self.draw_calls.take() {
            draw_calls.release(device);
        }
        if let Some(sphere) = self.sphere.take() {
            sphere.release(device);
        }
        self.lights.clear();
    }
}
