//! Froxel based volumetric fog
//!
//! The view frustum is split into a 3D grid of cells (froxels). Each frame:
//! initialize the medium properties, inject local lights and fog particles,
//! compute in-scattering blended with the reprojected history, then march
//! along Z to produce the integrated volume read by the fog pass.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec3, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::shadows::{ShadowConstants, ShadowsPass};
use crate::pipeline::{create_constant_buffer, update_cb, PipelineStates, RenderContext, RendererPass};
use crate::resources::ShaderLibrary;
use crate::scene::jitter::halton_2_3_5;
use crate::scene::{GpuViewData, LightShaderData, Quality, RenderLightBase, VolumetricFogOptions, ViewFlags, EPSILON};

pub const SHADER: &str = "Shaders/VolumetricFog";

pub const FOG_CB_SLOT: u32 = 0;
pub const INJECTION_CB_SLOT: u32 = 1;
pub const PARTICLE_CB_SLOT: u32 = 2;

pub const VBUFFER_A_SR_SLOT: u32 = 0;
pub const VBUFFER_B_SR_SLOT: u32 = 1;
pub const LOCAL_LIGHTS_SR_SLOT: u32 = 2;
pub const HISTORY_SR_SLOT: u32 = 3;
pub const SHADOW_MAP_SR_SLOT: u32 = 4;
pub const SKY_LIGHT_SR_SLOT: u32 = 5;
pub const SCATTERING_SR_SLOT: u32 = 6;

pub const VOLUME_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
/// Thread group edge of the 3D kernels
pub const GROUP_SIZE: u32 = 4;
/// Thread group edge of the 2D integration kernel
pub const INTEGRATION_GROUP_SIZE: u32 = 8;
pub const HISTORY_WEIGHT: f32 = 0.92;
pub const MAX_HISTORY_SAMPLES: usize = 8;
/// Vertices of the circle billboard drawn per slice
const LIGHT_BILLBOARD_VERTICES: u32 = 6;

/// How Z slices are spread over the fog distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ZDistribution {
    Linear,
    #[default]
    Logarithmic,
}

/// Grid resolution of a quality level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridParams {
    /// Screen pixels per froxel edge
    pub pixel_size: u32,
    pub depth_slices: u32,
    /// Jittered history frames blended when a history sample misses
    pub history_samples: u32,
}

pub fn grid_params(quality: Quality) -> GridParams {
    let (pixel_size, depth_slices, history_samples) = match quality {
        Quality::Low => (24, 50, 2),
        Quality::Medium => (16, 64, 4),
        Quality::High => (12, 96, 6),
        Quality::Ultra => (8, 128, 8),
    };
    GridParams {
        pixel_size,
        depth_slices,
        history_samples,
    }
}

pub fn grid_size(width: u32, height: u32, params: GridParams) -> UVec3 {
    UVec3::new(
        width.div_ceil(params.pixel_size).max(1),
        height.div_ceil(params.pixel_size).max(1),
        params.depth_slices,
    )
}

/// Mapping between view depth and Z slice
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FroxelDepth {
    pub near: f32,
    pub far: f32,
    pub slices: u32,
    pub distribution: ZDistribution,
}

impl FroxelDepth {
    pub fn new(near: f32, far: f32, slices: u32, distribution: ZDistribution) -> Self {
        let near = near.max(EPSILON);
        Self {
            near,
            far: far.max(near * 1.001),
            slices: slices.max(1),
            distribution,
        }
    }

    /// View depth at the start of a (fractional) slice
    pub fn slice_to_depth(&self, slice: f32) -> f32 {
        let t = slice / self.slices as f32;
        match self.distribution {
            ZDistribution::Linear => t * self.far,
            ZDistribution::Logarithmic => self.near * (self.far / self.near).powf(t),
        }
    }

    /// Inverse of [`slice_to_depth`](Self::slice_to_depth)
    pub fn depth_to_slice(&self, depth: f32) -> f32 {
        let slices = self.slices as f32;
        match self.distribution {
            ZDistribution::Linear => depth * slices / self.far,
            ZDistribution::Logarithmic => {
                slices * (depth.max(self.near) / self.near).ln() / (self.far / self.near).ln()
            }
        }
    }

    /// Average world units covered by one slice
    pub fn units_per_slice(&self) -> f32 {
        self.far / self.slices as f32
    }

    /// Inclusive slice range touched by a sphere at `view_depth`
    pub fn slice_range(&self, view_depth: f32, radius: f32) -> Option<(u32, u32)> {
        let min_depth = view_depth - radius;
        let max_depth = view_depth + radius;
        if max_depth <= 0.0 || min_depth >= self.far {
            return None;
        }
        let last = self.slices - 1;
        let min = (self.depth_to_slice(min_depth.max(0.0)).floor().max(0.0) as u32).min(last);
        let max = (self.depth_to_slice(max_depth.min(self.far)).ceil().max(0.0) as u32).min(last);
        Some((min, max.max(min)))
    }
}

/// Weight of the reprojected history in the scattering blend
pub fn history_weight(camera_cut: bool, resized: bool, has_history: bool) -> f32 {
    if camera_cut || resized || !has_history {
        0.0
    } else {
        HISTORY_WEIGHT
    }
}

/// Froxel jitter of this frame and of the `count - 1` frames before it
pub fn jitter_offsets(frame_index: u64, count: u32) -> [Vec4; MAX_HISTORY_SAMPLES] {
    let mut offsets = [Vec4::ZERO; MAX_HISTORY_SAMPLES];
    for (i, offset) in offsets.iter_mut().enumerate().take(count as usize) {
        let jitter = halton_2_3_5(frame_index.saturating_sub(i as u64), MAX_HISTORY_SAMPLES as u32);
        *offset = jitter.extend(0.0);
    }
    offsets
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct VolumetricFogData {
    pub view: GpuViewData,
    pub prev_world_to_clip: Mat4,
    /// (x, y, z, 1 / z)
    pub grid_size: Vec4,
    /// (pixel size, history weight, history samples, logarithmic)
    pub grid_params: Vec4,
    /// (near, far, ln(far / near), units per slice)
    pub z_params: Vec4,
    /// (density, height, height falloff, unused)
    pub fog_parameters: Vec4,
    pub albedo: Vec4,
    pub emissive: Vec4,
    /// (phase g, extinction scale, has sky light, has directional light)
    pub phase_extinction: Vec4,
    pub frame_jitter: Vec4,
    pub history_jitter: [Vec4; MAX_HISTORY_SAMPLES],
    pub directional_light: LightShaderData,
    pub directional_shadow: ShadowConstants,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightInjectionData {
    pub view_projection: Mat4,
    /// View-space center and inflated radius
    pub view_sphere: Vec4,
    /// (first slice, slice count of the grid, has shadow, unused)
    pub slices: Vec4,
    pub light: LightShaderData,
    pub shadow: ShadowConstants,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ParticleData {
    pub world_to_local: Mat4,
    /// World center and radius
    pub bounds: Vec4,
    /// First froxel touched, w unused
    pub grid_min: Vec4,
    pub emissive: Vec4,
}

pub(crate) fn register_shaders(library: &mut ShaderLibrary) {
    library.register(
        SHADER,
        &[
            std::mem::size_of::<VolumetricFogData>(),
            std::mem::size_of::<LightInjectionData>(),
            std::mem::size_of::<ParticleData>(),
        ],
    );
}

struct FogStates {
    initialize: ComputeShaderHandle,
    particle: ComputeShaderHandle,
    /// `[with sky light]`
    light_scattering: [ComputeShaderHandle; 2],
    final_integration: ComputeShaderHandle,
    /// `[shadowed]`, drawn through a geometry shader routing slices
    inject_light_gs: Option<[PipelineStateHandle; 2]>,
    /// `[shadowed]`, drawn one slice at a time
    inject_light: [PipelineStateHandle; 2],
}

struct FogBuffers {
    fog: GpuBuffer,
    injection: GpuBuffer,
    particle: GpuBuffer,
}

/// Local light picked for injection
struct LocalLight {
    base: RenderLightBase,
    position: Vec3,
    radius: f32,
    data: LightShaderData,
}

/// Froxel volumetric fog
#[derive(Default)]
pub struct VolumetricFogPass {
    states: PipelineStates,
    handles: Option<FogStates>,
    buffers: Option<FogBuffers>,
    quality: Quality,
    distribution: ZDistribution,
    local_lights_unsupported_logged: bool,
    last_history_weight: f32,
}

impl VolumetricFogPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quality(quality: Quality) -> Self {
        Self {
            quality,
            ..Self::default()
        }
    }

    pub fn is_ready(&self) -> bool {
        self.handles.is_some()
    }

    pub fn set_quality(&mut self, quality: Quality) {
        self.quality = quality;
    }

    pub fn set_distribution(&mut self, distribution: ZDistribution) {
        self.distribution = distribution;
    }

    /// History weight used by the last rendered frame
    pub fn last_history_weight(&self) -> f32 {
        self.last_history_weight
    }

    fn create_states(&mut self, device: &mut dyn GpuDevice) -> RenderResult<FogStates> {
        let geometry_shaders = device.limits().geometry_shaders;
        let kernel = |entry: &str, permutation: u32| ComputeShaderDescriptor::new(SHADER, entry).with_permutation(permutation);

        let inject = PipelineStateDescriptor::geometry(SHADER, "VS_WriteToSlice", Some("PS_InjectLight"))
            .with_depth(false, false, CompareFunction::Always)
            .with_cull(CullMode::None)
            .with_blend(BlendMode::Additive);
        let inject_light_gs = if geometry_shaders {
            let mut gs = inject.clone();
            gs.geometry_shader = Some("GS_WriteToSlice".to_string());
            Some([
                self.states.create(device, &gs.clone())?,
                self.states.create(device, &gs.with_permutation(1))?,
            ])
        } else {
            None
        };

        Ok(FogStates {
            initialize: self.states.create_compute(device, &kernel("CS_Initialize", 0))?,
            particle: self.states.create_compute(device, &kernel("CS_InjectParticle", 0))?,
            light_scattering: [
                self.states.create_compute(device, &kernel("CS_LightScattering", 0))?,
                self.states.create_compute(device, &kernel("CS_LightScattering", 1))?,
            ],
            final_integration: self.states.create_compute(device, &kernel("CS_FinalIntegration", 0))?,
            inject_light_gs,
            inject_light: [
                self.states.create(device, &inject.clone())?,
                self.states.create(device, &inject.with_permutation(1))?,
            ],
        })
    }

    fn options(ctx: &RenderContext) -> Option<(crate::scene::RenderFogData, VolumetricFogOptions)> {
        if !ctx.view.flags.contains(ViewFlags::FOG) {
            return None;
        }
        let fog = ctx.list.fog?;
        let options = fog.volumetric?;
        (options.enabled && options.distance > EPSILON).then_some((fog, options))
    }

    /// Drop every volume the view holds for the fog
    pub fn release_view(ctx: &mut RenderContext) {
        ctx.buffers.volumetric_fog.release(ctx.pool);
        ctx.buffers.volumetric_fog_history.release(ctx.pool);
        ctx.buffers.local_shadowed_light_scattering.release(ctx.pool);
    }

    /// Build the integrated fog volume into `RenderBuffers::volumetric_fog`.
    /// Returns the slice mapping of the volume, `None` when the view has no
    /// volumetric fog this frame.
    pub fn render(&mut self, ctx: &mut RenderContext, shadows: Option<&ShadowsPass>) -> Option<FroxelDepth> {
        let Some((fog, options)) = Self::options(ctx) else {
            Self::release_view(ctx);
            return None;
        };
        let (Some(handles), Some(buffers)) = (&self.handles, &self.buffers) else {
            return None;
        };

        let params = grid_params(self.quality);
        let grid = grid_size(ctx.buffers.width(), ctx.buffers.height(), params);
        let depth = FroxelDepth::new(
            ctx.view.near,
            options.distance.min(ctx.view.far),
            grid.z,
            self.distribution,
        );
        let volume_desc = TextureDescriptor::new_volume(
            grid.x,
            grid.y,
            grid.z,
            VOLUME_FORMAT,
            TextureFlags::SHADER_RESOURCE | TextureFlags::UNORDERED_ACCESS,
        );

        let history = ctx.buffers.volumetric_fog_history.get().copied();
        let resized = history.is_some_and(|h| h.desc != volume_desc);
        let weight = history_weight(ctx.view.is_camera_cut, resized, history.is_some());
        self.last_history_weight = weight;
        let history = history.filter(|_| weight > 0.0);

        let Some([vbuffer_a, vbuffer_b, scattering]) = get_temporaries(
            ctx,
            [
                ("VolumetricFog.VBufferA", volume_desc),
                ("VolumetricFog.VBufferB", volume_desc),
                ("VolumetricFog.Scattering", volume_desc),
            ],
        ) else {
            return None;
        };
        let frame = ctx.frame_index();
        let integrated = match ctx.buffers.volumetric_fog.get().copied() {
            Some(existing) if existing.desc == volume_desc => {
                ctx.buffers.volumetric_fog.touch(frame);
                existing
            }
            _ => match ctx.get_temporary("VolumetricFog.Integrated", &volume_desc) {
                Ok(texture) => {
                    ctx.buffers.volumetric_fog.set(ctx.pool, texture, frame);
                    texture
                }
                Err(err) => {
                    log::warn!("VolumetricFogPass: {err}");
                    for texture in [vbuffer_a, vbuffer_b, scattering] {
                        ctx.release(texture);
                    }
                    return None;
                }
            },
        };

        // First directional light with scattering drives the main shafts
        let directional = ctx
            .list
            .directional_lights
            .iter()
            .find(|l| l.base.volumetric_scattering_intensity > EPSILON)
            .map(|l| (l.shader_data(), l.base.shadow_data_index));
        let directional_shadow = directional
            .and_then(|(_, index)| shadows.and_then(|s| s.shadow(index)))
            .filter(|s| s.map.is_some());
        let gi = ctx.view.flags.contains(ViewFlags::GI) && ctx.list.settings.global_illumination.enabled;
        let sky_light = ctx.list.sky_lights.iter().find_map(|l| l.image).filter(|_| gi);

        let history_samples = params.history_samples.min(MAX_HISTORY_SAMPLES as u32);
        let history_jitter = jitter_offsets(frame, history_samples);
        let fog_parameters = fog.fog_parameters();
        let data = VolumetricFogData {
            view: ctx.view.shader_data(),
            prev_world_to_clip: ctx.view.prev_view_projection,
            grid_size: Vec4::new(grid.x as f32, grid.y as f32, grid.z as f32, 1.0 / grid.z as f32),
            grid_params: Vec4::new(
                params.pixel_size as f32,
                weight,
                history_samples as f32,
                if self.distribution == ZDistribution::Logarithmic { 1.0 } else { 0.0 },
            ),
            z_params: Vec4::new(depth.near, depth.far, (depth.far / depth.near).ln(), depth.units_per_slice()),
            fog_parameters: fog_parameters.extend(0.0),
            albedo: options.albedo,
            emissive: options.emissive,
            phase_extinction: Vec4::new(
                options.scattering_distribution.clamp(-0.9, 0.9),
                options.extinction_scale,
                if sky_light.is_some() { 1.0 } else { 0.0 },
                if directional.is_some() { 1.0 } else { 0.0 },
            ),
            frame_jitter: history_jitter[0],
            history_jitter,
            directional_light: directional.map(|(d, _)| d).unwrap_or_else(LightShaderData::zeroed),
            directional_shadow: directional_shadow
                .map(|s| s.constants)
                .unwrap_or_else(ShadowConstants::zeroed),
        };

        ctx.gpu.push_event("VolumetricFog");
        update_cb(ctx.gpu, &buffers.fog, &data);
        ctx.gpu.bind_cb(FOG_CB_SLOT, buffers.fog.handle);

        let groups = (
            group_count(grid.x, GROUP_SIZE),
            group_count(grid.y, GROUP_SIZE),
            group_count(grid.z, GROUP_SIZE),
        );

        ctx.gpu.push_event("Initialize");
        ctx.gpu.bind_ua(0, Some(vbuffer_a.view().into()));
        ctx.gpu.bind_ua(1, Some(vbuffer_b.view().into()));
        ctx.gpu.dispatch(handles.initialize, groups.0, groups.1, groups.2);
        Self::inject_particles(ctx, handles, buffers, &depth, grid);
        ctx.gpu.reset_ua();
        ctx.gpu.pop_event();

        let local_lights = Self::inject_local_lights(
            &mut self.local_lights_unsupported_logged,
            ctx,
            handles,
            buffers,
            &depth,
            grid,
            shadows,
        );

        ctx.gpu.push_event("LightScattering");
        ctx.gpu.bind_sr(VBUFFER_A_SR_SLOT, Some(vbuffer_a.view().into()));
        ctx.gpu.bind_sr(VBUFFER_B_SR_SLOT, Some(vbuffer_b.view().into()));
        ctx.gpu.bind_sr(LOCAL_LIGHTS_SR_SLOT, local_lights.map(|t: GpuTexture| t.view().into()));
        ctx.gpu.bind_sr(HISTORY_SR_SLOT, history.map(|t| t.view().into()));
        ctx.gpu.bind_sr(
            SHADOW_MAP_SR_SLOT,
            directional_shadow.and_then(|s| s.map).map(|t| t.view().into()),
        );
        ctx.gpu.bind_sr(SKY_LIGHT_SR_SLOT, sky_light.map(|t| t.view().into()));
        ctx.gpu.bind_ua(0, Some(scattering.view().into()));
        let scattering_kernel = handles.light_scattering[usize::from(sky_light.is_some())];
        ctx.gpu.dispatch(scattering_kernel, groups.0, groups.1, groups.2);
        ctx.gpu.reset_ua();
        ctx.gpu.reset_sr();
        ctx.gpu.pop_event();

        ctx.gpu.push_event("FinalIntegration");
        ctx.gpu.bind_sr(SCATTERING_SR_SLOT, Some(scattering.view().into()));
        ctx.gpu.bind_ua(0, Some(integrated.view().into()));
        ctx.gpu.dispatch(
            handles.final_integration,
            group_count(grid.x, INTEGRATION_GROUP_SIZE),
            group_count(grid.y, INTEGRATION_GROUP_SIZE),
            1,
        );
        ctx.gpu.reset_ua();
        ctx.gpu.reset_sr();
        ctx.gpu.pop_event();

        ctx.gpu.pop_event();

        ctx.release(vbuffer_a);
        ctx.release(vbuffer_b);
        if let Some(local_lights) = local_lights {
            ctx.release(local_lights);
        }
        // This frame's scattering is the next frame's history
        ctx.buffers.volumetric_fog_history.set(ctx.pool, scattering, frame);
        Some(depth)
    }

    fn inject_particles(
        ctx: &mut RenderContext,
        handles: &FogStates,
        buffers: &FogBuffers,
        depth: &FroxelDepth,
        grid: UVec3,
    ) {
        for index in 0..ctx.list.volumetric_fog_particles.len() {
            let particle = ctx.list.volumetric_fog_particles[index];
            let Some((min, max)) = sphere_grid_bounds(ctx, depth, grid, particle.bounds_center, particle.bounds_radius)
            else {
                continue;
            };
            let data = ParticleData {
                world_to_local: particle.world.inverse(),
                bounds: particle.bounds_center.extend(particle.bounds_radius),
                grid_min: min.as_vec3().extend(0.0),
                emissive: particle.material.emissive.extend(1.0),
            };
            update_cb(ctx.gpu, &buffers.particle, &data);
            ctx.gpu.bind_cb(PARTICLE_CB_SLOT, buffers.particle.handle);
            let size = max - min + UVec3::ONE;
            ctx.gpu.dispatch(
                handles.particle,
                group_count(size.x, GROUP_SIZE),
                group_count(size.y, GROUP_SIZE),
                group_count(size.z, GROUP_SIZE),
            );
        }
    }

    /// Rasterize point and spot lights into a scattering volume. Returns
    /// `None` when no light reaches the fog.
    fn inject_local_lights(
        unsupported_logged: &mut bool,
        ctx: &mut RenderContext,
        handles: &FogStates,
        buffers: &FogBuffers,
        depth: &FroxelDepth,
        grid: UVec3,
        shadows: Option<&ShadowsPass>,
    ) -> Option<GpuTexture> {
        let view_position = ctx.view.position;
        let reaches = |base: &RenderLightBase, position: Vec3, radius: f32| {
            base.volumetric_scattering_intensity > EPSILON && view_position.distance(position) < depth.far + radius
        };
        let lights: Vec<LocalLight> = ctx
            .list
            .point_lights
            .iter()
            .filter(|l| reaches(&l.base, l.position, l.radius))
            .map(|l| LocalLight {
                base: l.base,
                position: l.position,
                radius: l.radius,
                data: l.shader_data(),
            })
            .chain(
                ctx.list
                    .spot_lights
                    .iter()
                    .filter(|l| reaches(&l.base, l.position, l.radius))
                    .map(|l| LocalLight {
                        base: l.base,
                        position: l.position,
                        radius: l.radius,
                        data: l.shader_data(),
                    }),
            )
            .collect();
        if lights.is_empty() {
            ctx.buffers.local_shadowed_light_scattering.release(ctx.pool);
            return None;
        }

        let volume_render_targets = ctx.device.limits().volume_render_targets;
        if handles.inject_light_gs.is_none() && !volume_render_targets {
            if !*unsupported_logged {
                log::warn!(
                    "VolumetricFogPass: {}",
                    RenderError::UnsupportedPlatformFeature("geometry shaders or volume render targets")
                );
                *unsupported_logged = true;
            }
            return None;
        }

        let desc = TextureDescriptor::new_volume(
            grid.x,
            grid.y,
            grid.z,
            VOLUME_FORMAT,
            TextureFlags::SHADER_RESOURCE | TextureFlags::RENDER_TARGET,
        );
        let target = match ctx.get_temporary("VolumetricFog.LocalLights", &desc) {
            Ok(texture) => texture,
            Err(err) => {
                log::warn!("VolumetricFogPass: {err}");
                return None;
            }
        };

        ctx.gpu.push_event("LocalLights");
        ctx.gpu.clear(target.view(), Color::TRANSPARENT);
        ctx.gpu.set_viewport_and_scissors(Viewport::from_size(grid.x, grid.y));
        let inflate = depth.units_per_slice() * 0.25;

        for light in &lights {
            let radius = light.radius + inflate;
            let view_depth = ctx.view.view_depth(light.position);
            let Some((min_slice, max_slice)) = depth.slice_range(view_depth, radius) else {
                continue;
            };
            let shadow = shadows
                .filter(|_| light.base.has_shadow_data())
                .and_then(|s| s.shadow(light.base.shadow_data_index))
                .filter(|s| s.map.is_some());
            let shadowed = usize::from(shadow.is_some());

            let view_center = ctx.view.view.transform_point3(light.position - ctx.view.origin);
            let data = LightInjectionData {
                view_projection: ctx.view.view_projection,
                view_sphere: view_center.extend(radius),
                slices: Vec4::new(min_slice as f32, grid.z as f32, shadowed as f32, 0.0),
                light: light.data,
                shadow: shadow.map(|s| s.constants).unwrap_or_else(ShadowConstants::zeroed),
            };
            update_cb(ctx.gpu, &buffers.injection, &data);
            ctx.gpu.bind_cb(INJECTION_CB_SLOT, buffers.injection.handle);
            ctx.gpu.bind_sr(SHADOW_MAP_SR_SLOT, shadow.and_then(|s| s.map).map(|t| t.view().into()));

            let slice_count = max_slice - min_slice + 1;
            match handles.inject_light_gs {
                Some(states) => {
                    ctx.gpu.set_render_target(None, &[target.view()]);
                    ctx.gpu.set_state(states[shadowed]);
                    ctx.gpu.draw_instanced(LIGHT_BILLBOARD_VERTICES, slice_count, 0, min_slice);
                }
                None => {
                    ctx.gpu.set_state(handles.inject_light[shadowed]);
                    for slice in min_slice..=max_slice {
                        ctx.gpu.set_render_target(None, &[target.view_slice(slice)]);
                        ctx.gpu.draw_instanced(LIGHT_BILLBOARD_VERTICES, 1, 0, slice);
                    }
                }
            }
        }

        ctx.gpu.bind_sr(SHADOW_MAP_SR_SLOT, None);
        ctx.gpu.reset_render_target();
        ctx.gpu.pop_event();
        Some(target)
    }
}

/// Froxel bounds of a world sphere, `None` when outside the grid
fn sphere_grid_bounds(
    ctx: &RenderContext,
    depth: &FroxelDepth,
    grid: UVec3,
    center: Vec3,
    radius: f32,
) -> Option<(UVec3, UVec3)> {
    let view_depth = ctx.view.view_depth(center);
    let (min_z, max_z) = depth.slice_range(view_depth, radius)?;

    let mut min = glam::Vec2::splat(f32::MAX);
    let mut max = glam::Vec2::splat(f32::MIN);
    for i in 0..8 {
        let corner = center
            + Vec3::new(
                if i & 1 == 0 { -radius } else { radius },
                if i & 2 == 0 { -radius } else { radius },
                if i & 4 == 0 { -radius } else { radius },
            );
        let clip = ctx.view.view_projection * (corner - ctx.view.origin).extend(1.0);
        if clip.w <= EPSILON {
            // Behind the camera, the sphere spans the whole screen
            min = glam::Vec2::splat(-1.0);
            max = glam::Vec2::splat(1.0);
            break;
        }
        let ndc = clip.truncate().truncate() / clip.w;
        min = min.min(ndc);
        max = max.max(ndc);
    }
    if max.x < -1.0 || max.y < -1.0 || min.x > 1.0 || min.y > 1.0 {
        return None;
    }

    let to_grid = |ndc: glam::Vec2, size: UVec3| {
        let uv = (glam::Vec2::new(ndc.x, -ndc.y) * 0.5 + 0.5).clamp(glam::Vec2::ZERO, glam::Vec2::ONE);
        (uv * glam::Vec2::new(size.x as f32, size.y as f32)).as_uvec2()
    };
    // NDC y grows up, texture rows grow down
    let a = to_grid(min, grid);
    let b = to_grid(max, grid);
    let last = grid - UVec3::ONE;
    Some((
        UVec3::new(a.x.min(b.x).min(last.x), a.y.min(b.y).min(last.y), min_z),
        UVec3::new(a.x.max(b.x).min(last.x), a.y.max(b.y).min(last.y), max_z),
    ))
}

/// Fetch several transients, releasing the ones already taken on failure
fn get_temporaries<const N: usize>(
    ctx: &mut RenderContext,
    requests: [(&str, TextureDescriptor); N],
) -> Option<[GpuTexture; N]> {
    let mut textures = Vec::with_capacity(N);
    for (name, desc) in requests {
        match ctx.get_temporary(name, &desc) {
            Ok(texture) => textures.push(texture),
            Err(err) => {
                log::warn!("VolumetricFogPass: {err}");
                for texture in textures {
                    ctx.release(texture);
                }
                return None;
            }
        }
    }
    textures.try_into().ok()
}

impl RendererPass for VolumetricFogPass {
    fn name(&self) -> &'static str {
        "VolumetricFogPass"
    }

    fn setup_resources(&mut self, device: &mut dyn GpuDevice, shaders: &ShaderLibrary) -> RenderResult<()> {
        if self.handles.is_some() {
            return Ok(());
        }
        if !device.limits().compute_shaders {
            return Err(RenderError::UnsupportedPlatformFeature("compute shaders"));
        }
        let shader = shaders.require(SHADER)?;
        shader.check_cb(FOG_CB_SLOT, std::mem::size_of::<VolumetricFogData>())?;
        shader.check_cb(INJECTION_CB_SLOT, std::mem::size_of::<LightInjectionData>())?;
        shader.check_cb(PARTICLE_CB_SLOT, std::mem::size_of::<ParticleData>())?;

        if self.buffers.is_none() {
            let fog = create_constant_buffer::<VolumetricFogData>(device, "VolumetricFog.CB")?;
            let injection = match create_constant_buffer::<LightInjectionData>(device, "VolumetricFog.InjectionCB") {
                Ok(buffer) => buffer,
                Err(err) => {
                    device.destroy_buffer(fog);
                    return Err(err);
                }
            };
            let particle = match create_constant_buffer::<ParticleData>(device, "VolumetricFog.ParticleCB") {
                Ok(buffer) => buffer,
                Err(err) => {
                    device.destroy_buffer(fog);
                    device.destroy_buffer(injection);
                    return Err(err);
                }
            };
            self.buffers = Some(FogBuffers { fog, injection, particle });
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
        if let Some(buffers) = self.buffers.take() {
            device.destroy_buffer(buffers.fog);
            device.destroy_buffer(buffers.injection);
            device.destroy_buffer(buffers.particle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_utils::TestFrame;
    use crate::scene::{RenderFogData, RenderPointLightData};

    fn fog() -> RenderFogData {
        RenderFogData {
            density: 0.02,
            height: 0.0,
            height_falloff: 0.002,
            color: Vec3::ONE,
            start_distance: 0.0,
            max_opacity: 1.0,
            cutoff_distance: 0.0,
            volumetric: Some(VolumetricFogOptions::default()),
        }
    }

    fn fog_frame(device: RecordingDevice) -> TestFrame {
        let mut frame = TestFrame::with_device(device, 160, 90);
        frame.list.fog = Some(fog());
        frame
    }

    #[test]
    fn test_constants_are_16_byte_aligned() {
        assert_eq!(std::mem::size_of::<VolumetricFogData>() % 16, 0);
        assert_eq!(std::mem::size_of::<LightInjectionData>() % 16, 0);
        assert_eq!(std::mem::size_of::<ParticleData>() % 16, 0);
    }

    #[test]
    fn test_grid_size_by_quality() {
        assert_eq!(grid_size(1920, 1080, grid_params(Quality::Low)), UVec3::new(80, 45, 50));
        assert_eq!(grid_size(1920, 1080, grid_params(Quality::Ultra)), UVec3::new(240, 135, 128));
        assert_eq!(grid_size(1, 1, grid_params(Quality::Medium)), UVec3::new(1, 1, 64));
    }

    #[test]
    fn test_depth_mapping_inverts() {
        for distribution in [ZDistribution::Linear, ZDistribution::Logarithmic] {
            let depth = FroxelDepth::new(10.0, 6000.0, 64, distribution);
            for slice in [1.0, 7.5, 32.0, 63.0] {
                let back = depth.depth_to_slice(depth.slice_to_depth(slice));
                assert!((back - slice).abs() < 1e-3, "{distribution:?} {slice} -> {back}");
            }
            assert!((depth.slice_to_depth(64.0) - 6000.0).abs() < 1e-2);
        }
    }

    #[test]
    fn test_logarithmic_slices_favor_near_range() {
        let log = FroxelDepth::new(10.0, 6000.0, 64, ZDistribution::Logarithmic);
        let linear = FroxelDepth::new(10.0, 6000.0, 64, ZDistribution::Linear);
        assert!(log.slice_to_depth(8.0) < linear.slice_to_depth(8.0));
    }

    #[test]
    fn test_slice_range() {
        let depth = FroxelDepth::new(10.0, 1000.0, 10, ZDistribution::Linear);
        assert_eq!(depth.slice_range(500.0, 50.0), Some((4, 6)));
        assert_eq!(depth.slice_range(-100.0, 50.0), None);
        assert_eq!(depth.slice_range(2000.0, 50.0), None);
        assert_eq!(depth.slice_range(990.0, 100.0), Some((8, 9)));
    }

    #[test]
    fn test_history_weight() {
        assert_eq!(history_weight(false, false, true), HISTORY_WEIGHT);
        assert_eq!(history_weight(true, false, true), 0.0);
        assert_eq!(history_weight(false, true, true), 0.0);
        assert_eq!(history_weight(false, false, false), 0.0);
    }

    #[test]
    fn test_missing_fog_flag_releases_volumes() {
        let mut frame = fog_frame(RecordingDevice::new());
        let mut pass = VolumetricFogPass::new();
        frame.setup(&mut pass);
        assert!(pass.render(&mut frame.ctx(), None).is_some());
        assert!(frame.buffers.volumetric_fog.is_some());

        frame.view.flags.remove(ViewFlags::FOG);
        assert!(pass.render(&mut frame.ctx(), None).is_none());
        assert!(!frame.buffers.volumetric_fog.is_some());
        assert!(!frame.buffers.volumetric_fog_history.is_some());
        assert_eq!(frame.pool.stats().in_use, 0);
    }

    #[test]
    fn test_history_follows_frames_and_cuts() {
        let mut frame = fog_frame(RecordingDevice::new());
        let mut pass = VolumetricFogPass::new();
        frame.setup(&mut pass);

        assert!(pass.render(&mut frame.ctx(), None).is_some());
        assert_eq!(pass.last_history_weight(), 0.0);
        // Integrated volume plus history
        assert_eq!(frame.pool.stats().in_use, 2);

        frame.frame.frame_index += 1;
        assert!(pass.render(&mut frame.ctx(), None).is_some());
        assert_eq!(pass.last_history_weight(), HISTORY_WEIGHT);

        frame.frame.frame_index += 1;
        frame.view.is_camera_cut = true;
        assert!(pass.render(&mut frame.ctx(), None).is_some());
        assert_eq!(pass.last_history_weight(), 0.0);
        assert_eq!(frame.pool.stats().in_use, 2);
    }

    #[test]
    fn test_local_light_instanced_per_slice() {
        let mut frame = fog_frame(RecordingDevice::new());
        frame.list.point_lights.push(RenderPointLightData {
            position: Vec3::new(0.0, 0.0, -500.0),
            radius: 100.0,
            ..Default::default()
        });
        let mut pass = VolumetricFogPass::new();
        frame.setup(&mut pass);
        assert!(pass.render(&mut frame.ctx(), None).is_some());

        let draws: Vec<_> = frame
            .gpu
            .commands_in_event("LocalLights")
            .iter()
            .filter(|c| matches!(c, GpuCommand::DrawInstanced { .. }))
            .collect();
        assert_eq!(draws.len(), 1);
        assert_eq!(frame.pool.stats().in_use, 2);
    }

    #[test]
    fn test_local_lights_without_slice_routing_are_skipped() {
        let device = RecordingDevice::with_limits(DeviceLimits {
            geometry_shaders: false,
            volume_render_targets: false,
            ..Default::default()
        });
        let mut frame = fog_frame(device);
        frame.list.point_lights.push(RenderPointLightData {
            position: Vec3::new(0.0, 0.0, -500.0),
            radius: 100.0,
            ..Default::default()
        });
        let mut pass = VolumetricFogPass::new();
        frame.setup(&mut pass);
        assert!(pass.render(&mut frame.ctx(), None).is_some());
        assert!(frame.gpu.commands_in_event("LocalLights").is_empty());
        assert_eq!(frame.gpu.dispatch_count(), 3);
    }

    #[test]
    fn test_no_compute_is_unsupported() {
        let mut device = RecordingDevice::without_compute();
        let mut pass = VolumetricFogPass::new();
        let err = pass
            .setup_resources(&mut device, &crate::pipeline::builtin_shader_library())
            .unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedPlatformFeature(_)));
    }
}
