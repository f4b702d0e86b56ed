//! Scene management
//!
//! Actors live in a `bevy_ecs` world. Each frame, [`Scene::collect`] culls
//! them against a view and copies what the renderer needs into a
//! [`RenderList`].

mod actors;
mod frustum;
pub mod jitter;
mod light;
mod render_list;
mod settings;
mod transform;
mod view;

pub use actors::*;
pub use frustum::*;
pub use light::*;
pub use render_list::*;
pub use settings::*;
pub use transform::*;
pub use view::*;

use std::sync::Arc;

use bevy_ecs::prelude::*;
use glam::{Mat4, Vec3};

use crate::backend::GpuTexture;
use crate::resources::TextureData;

/// Values below this are treated as zero
pub const EPSILON: f32 = 1e-6;

/// World-space bounding sphere of a local box under a world matrix
pub fn transform_bounds(world: &Mat4, min: Vec3, max: Vec3) -> (Vec3, f32) {
    let center = world.transform_point3((min + max) * 0.5);
    let half = (max - min) * 0.5;
    let scale = world.x_axis.truncate().length()
        .max(world.y_axis.truncate().length())
        .max(world.z_axis.truncate().length());
    (center, half.length() * scale)
}

/// The scene containing all actors
pub struct Scene {
    world: World,
}

impl Scene {
    pub fn new() -> Self {
        Self {
            world: World::new(),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn spawn_model(&mut self, transform: Transform, model: StaticModel) -> Entity {
        self.world
            .spawn((transform, PrevTransform(transform.matrix()), model))
            .id()
    }

    pub fn spawn_directional_light(&mut self, direction: Vec3, light: DirectionalLight) -> Entity {
        let transform = Transform::looking_to(Vec3::ZERO, direction, Vec3::Y);
        self.world.spawn((transform, light)).id()
    }

    pub fn spawn_point_light(&mut self, position: Vec3, light: PointLight) -> Entity {
        self.world.spawn((Transform::from_position(position), light)).id()
    }

    pub fn spawn_spot_light(&mut self, position: Vec3, direction: Vec3, light: SpotLight) -> Entity {
        let transform = Transform::looking_to(position, direction, Vec3::Y);
        self.world.spawn((transform, light)).id()
    }

    pub fn spawn_sky_light(&mut self, position: Vec3, light: SkyLight) -> Entity {
        self.world.spawn((Transform::from_position(position), light)).id()
    }

    pub fn spawn_environment_probe(&mut self, position: Vec3, probe: EnvironmentProbe) -> Entity {
        self.world.spawn((Transform::from_position(position), probe)).id()
    }

    pub fn spawn_fog(&mut self, height: f32, fog: ExponentialHeightFog) -> Entity {
        let transform = Transform::from_position(Vec3::new(0.0, height, 0.0));
        self.world.spawn((transform, fog)).id()
    }

    pub fn spawn_fog_particle(&mut self, position: Vec3, particle: FogParticle) -> Entity {
        self.world.spawn((Transform::from_position(position), particle)).id()
    }

    pub fn spawn_decal(&mut self, transform: Transform, decal: Decal) -> Entity {
        self.world.spawn((transform, decal)).id()
    }

    pub fn spawn_sky(&mut self, sky: Sky) -> Entity {
        self.world.spawn((Transform::default(), sky)).id()
    }

    pub fn spawn_post_fx_volume(&mut self, position: Vec3, volume: PostFxVolume) -> Entity {
        self.world.spawn((Transform::from_position(position), volume)).id()
    }

    pub fn despawn(&mut self, entity: Entity) -> bool {
        self.world.despawn(entity)
    }

    pub fn set_transform(&mut self, entity: Entity, transform: Transform) {
        if let Some(mut current) = self.world.get_mut::<Transform>(entity) {
            *current = transform;
        }
    }

    pub fn transform(&self, entity: Entity) -> Option<Transform> {
        self.world.get::<Transform>(entity).copied()
    }

    /// Cull actors against `view` and fill `list`. Post-processing volumes
    /// containing the view override `list.settings`.
    pub fn collect(&mut self, view: &RenderView, list: &mut RenderList) {
        list.clear();
        list.setup_frustum_corners(view);
        let flags = view.flags;
        let view_position = view.position;

        let mut models = self
            .world
            .query::<(&Transform, Option<&PrevTransform>, &StaticModel)>();
        for (transform, prev, model) in models.iter(&self.world) {
            if view.render_layers_mask & model.layer_mask() == 0
                || !model.static_flags.contains(view.static_flags_mask)
            {
                continue;
            }
            let world = transform.matrix();
            let (center, radius) = transform_bounds(&world, model.mesh.bounds_min, model.mesh.bounds_max);
            let draw_call = DrawCall {
                world,
                prev_world: prev.map_or(world, |p| p.0),
                geometry: model.mesh,
                material: model.material,
                instance_data: InstanceData::None,
                world_determinant_sign: transform.determinant_sign(),
                per_instance_random: 0.0,
                lod_index: 0,
                lod_dither_factor: 0.0,
                bounds_center: center,
                bounds_radius: radius,
                static_flags: model.static_flags,
                casts_shadows: model.casts_shadows,
                distance: 0.0,
            };

            if flags.contains(ViewFlags::SHADOWS) && model.casts_shadows {
                list.add_shadow_caster(view, draw_call);
            }
            if view.culling_frustum.intersects_sphere(center, radius) {
                list.add_draw_call(view, model.draw_modes, draw_call);
            }
        }

        let screen_size = |position: Vec3, radius: f32| {
            let distance = position.distance(view_position).max(EPSILON);
            (radius / distance).min(1.0)
        };

        if flags.contains(ViewFlags::DIRECTIONAL_LIGHTS) {
            let mut query = self.world.query::<(Entity, &Transform, &DirectionalLight)>();
            for (entity, transform, light) in query.iter(&self.world) {
                list.directional_lights.push(RenderDirectionalLightData {
                    base: RenderLightBase {
                        id: entity.index(),
                        color: light.color * light.brightness,
                        shadow: light.shadow,
                        screen_size: 1.0,
                        ..Default::default()
                    },
                    direction: transform.forward(),
                    cascade_count: light.cascade_count.clamp(1, 4),
                    partition_mode: light.partition_mode,
                    cascade_spacing: light.cascade_spacing,
                });
            }
        }

        if flags.contains(ViewFlags::POINT_LIGHTS) {
            let mut query = self.world.query::<(Entity, &Transform, &PointLight)>();
            for (entity, transform, light) in query.iter(&self.world) {
                if !view.culling_frustum.intersects_sphere(transform.position, light.radius) {
                    continue;
                }
                list.point_lights.push(RenderPointLightData {
                    base: RenderLightBase {
                        id: entity.index(),
                        color: light.color * light.brightness,
                        shadow: light.shadow,
                        screen_size: screen_size(transform.position, light.radius),
                        ..Default::default()
                    },
                    position: transform.position,
                    radius: light.radius,
                    falloff_exponent: light.falloff_exponent,
                    use_inverse_squared_falloff: light.use_inverse_squared_falloff,
                    source_radius: light.source_radius,
                    source_length: light.source_length,
                    ies_texture: light.ies_texture,
                });
            }
        }

        if flags.contains(ViewFlags::SPOT_LIGHTS) {
            let mut query = self.world.query::<(Entity, &Transform, &SpotLight)>();
            for (entity, transform, light) in query.iter(&self.world) {
                if !view.culling_frustum.intersects_sphere(transform.position, light.radius) {
                    continue;
                }
                list.spot_lights.push(RenderSpotLightData {
                    base: RenderLightBase {
                        id: entity.index(),
                        color: light.color * light.brightness,
                        shadow: light.shadow,
                        screen_size: screen_size(transform.position, light.radius),
                        ..Default::default()
                    },
                    position: transform.position,
                    direction: transform.forward(),
                    up: transform.up(),
                    radius: light.radius,
                    outer_cone_angle: light.outer_cone_angle,
                    inner_cone_angle: light.inner_cone_angle,
                    falloff_exponent: light.falloff_exponent,
                    use_inverse_squared_falloff: light.use_inverse_squared_falloff,
                    source_radius: light.source_radius,
                    ies_texture: light.ies_texture,
                });
            }
        }

        if flags.contains(ViewFlags::SKY_LIGHTS) {
            let mut query = self.world.query::<(Entity, &Transform, &SkyLight)>();
            for (entity, transform, light) in query.iter(&self.world) {
                list.sky_lights.push(RenderSkyLightData {
                    base: RenderLightBase {
                        id: entity.index(),
                        color: light.color * light.brightness,
                        volumetric_scattering_intensity: light.volumetric_scattering_intensity,
                        shadow: LightShadowParams {
                            strength: 0.0,
                            ..Default::default()
                        },
                        screen_size: 1.0,
                        ..Default::default()
                    },
                    position: transform.position,
                    radius: light.radius,
                    image: light.image(),
                    additive_color: light.additive_color,
                    indirect_intensity: light.indirect_intensity,
                });
            }
        }

        if flags.contains(ViewFlags::REFLECTIONS) {
            let mut query = self.world.query::<(Entity, &Transform, &EnvironmentProbe)>();
            for (entity, transform, probe) in query.iter(&self.world) {
                if probe.texture.is_none()
                    || !view.culling_frustum.intersects_sphere(transform.position, probe.radius)
                {
                    continue;
                }
                list.environment_probes.push(RenderEnvironmentProbeData {
                    id: entity.index(),
                    position: transform.position,
                    radius: probe.radius,
                    brightness: probe.brightness,
                    texture: probe.texture,
                });
            }
        }

        if flags.contains(ViewFlags::FOG) {
            let mut query = self.world.query::<(&Transform, &ExponentialHeightFog)>();
            if let Some((transform, fog)) = query.iter(&self.world).next() {
                list.fog = Some(RenderFogData {
                    density: fog.density,
                    height: transform.position.y,
                    height_falloff: fog.height_falloff,
                    color: fog.color,
                    start_distance: fog.start_distance,
                    max_opacity: fog.max_opacity,
                    cutoff_distance: fog.cutoff_distance,
                    volumetric: fog.volumetric.filter(|v| v.enabled),
                });
            }

            let mut particles = self.world.query::<(&Transform, &FogParticle)>();
            for (transform, particle) in particles.iter(&self.world) {
                let radius = particle.radius * transform.scale.max_element();
                if view.culling_frustum.intersects_sphere(transform.position, radius) {
                    list.volumetric_fog_particles.push(RenderFogParticle {
                        world: transform.matrix(),
                        bounds_center: transform.position,
                        bounds_radius: radius,
                        material: particle.material,
                    });
                }
            }
        }

        if flags.contains(ViewFlags::DECALS) {
            let mut query = self.world.query::<(&Transform, &Decal)>();
            for (transform, decal) in query.iter(&self.world) {
                let world = transform.matrix() * Mat4::from_scale(decal.size);
                let (center, radius) = transform_bounds(&world, Vec3::splat(-0.5), Vec3::splat(0.5));
                if view.culling_frustum.intersects_sphere(center, radius) {
                    list.decals.push(RenderDecalData {
                        world,
                        material: decal.material,
                        sort_order: decal.sort_order,
                    });
                }
            }
            list.decals.sort_by_key(|d| d.sort_order);
        }

        if flags.contains(ViewFlags::SKY) {
            let mut query = self.world.query::<&Sky>();
            list.sky = query.iter(&self.world).find_map(|sky| sky.cube);
        }

        let mut volumes = self.world.query::<(&Transform, &PostFxVolume)>();
        let active = volumes
            .iter(&self.world)
            .filter(|(transform, volume)| match volume.half_extents {
                Some(half) => (view_position - transform.position).abs().cmple(half).all(),
                None => true,
            })
            .max_by_key(|(_, volume)| volume.priority);
        if let Some((_, volume)) = active {
            list.settings = volume.settings.clone();
        }
    }

    /// Surface-atlas participants within `radius` of `center`, larger than `min_radius`
    pub fn collect_surface_atlas_objects(
        &mut self,
        center: Vec3,
        radius: f32,
        min_radius: f32,
        list: &mut RenderList,
    ) {
        let mut models = self.world.query::<(Entity, &Transform, &StaticModel)>();
        for (entity, transform, model) in models.iter(&self.world) {
            if !model.surface_atlas || !model.draw_modes.contains(DrawPass::GLOBAL_SURFACE_ATLAS) {
                continue;
            }
            let world = transform.matrix();
            let (bounds_center, bounds_radius) =
                transform_bounds(&world, model.mesh.bounds_min, model.mesh.bounds_max);
            if bounds_radius < min_radius || bounds_center.distance(center) - bounds_radius > radius {
                continue;
            }
            list.surface_atlas_objects.push(SurfaceAtlasObject {
                id: entity.to_bits(),
                world,
                local_bounds_min: model.mesh.bounds_min,
                local_bounds_max: model.mesh.bounds_max,
                bounds_center,
                bounds_radius,
                is_static: model.is_static(),
                geometry: model.mesh,
                material: model.material,
            });
        }
    }

    /// Capture parameters of a probe or sky light actor
    pub fn probe_capture_info(&self, kind: ProbeKind, entity: Entity) -> Option<ProbeCaptureInfo> {
        let position = self.world.get::<Transform>(entity)?.position;
        match kind {
            ProbeKind::EnvProbe => {
                let probe = self.world.get::<EnvironmentProbe>(entity)?;
                Some(ProbeCaptureInfo {
                    kind,
                    position,
                    radius: probe.radius,
                    resolution: probe.resolution,
                    capture_near_plane: probe.capture_near_plane,
                    update_mode: probe.update_mode,
                })
            }
            ProbeKind::SkyLight => {
                let light = self.world.get::<SkyLight>(entity)?;
                (light.mode == SkyLightMode::CaptureScene).then_some(ProbeCaptureInfo {
                    kind,
                    position,
                    radius: light.radius,
                    resolution: 0,
                    capture_near_plane: light.capture_near_plane,
                    update_mode: ProbeUpdateMode::Manual,
                })
            }
        }
    }

    /// Point lights `(position, radius)` whose range overlaps a sphere
    pub fn point_lights_near(&mut self, center: Vec3, radius: f32) -> Vec<(Vec3, f32)> {
        let mut query = self.world.query::<(&Transform, &PointLight)>();
        query
            .iter(&self.world)
            .filter(|(t, l)| t.position.distance(center) < radius + l.radius)
            .map(|(t, l)| (t.position, l.radius))
            .collect()
    }

    /// Assign a captured cube to a probe or sky light. Returns the previous texture.
    pub fn set_probe_texture(
        &mut self,
        kind: ProbeKind,
        entity: Entity,
        texture: GpuTexture,
    ) -> Option<GpuTexture> {
        match kind {
            ProbeKind::EnvProbe => self
                .world
                .get_mut::<EnvironmentProbe>(entity)
                .and_then(|mut probe| probe.texture.replace(texture)),
            ProbeKind::SkyLight => self
                .world
                .get_mut::<SkyLight>(entity)
                .and_then(|mut light| light.captured_texture.replace(texture)),
        }
    }

    /// Store downloaded capture data as the actor's baked asset
    pub fn set_probe_baked_data(&mut self, kind: ProbeKind, entity: Entity, data: Arc<TextureData>) {
        match kind {
            ProbeKind::EnvProbe => {
                if let Some(mut probe) = self.world.get_mut::<EnvironmentProbe>(entity) {
                    probe.baked_data = Some(data);
                }
            }
            ProbeKind::SkyLight => {
                if let Some(mut light) = self.world.get_mut::<SkyLight>(entity) {
                    light.baked_data = Some(data);
                }
            }
        }
    }

    /// Environment probes with realtime updates
    pub fn realtime_probes(&mut self) -> Vec<Entity> {
        let mut query = self.world.query::<(Entity, &EnvironmentProbe)>();
        query
            .iter(&self.world)
            .filter(|(_, p)| p.update_mode == ProbeUpdateMode::Realtime)
            .map(|(e, _)| e)
            .collect()
    }

    /// Store current world matrices as previous for the next frame
    pub fn end_frame(&mut self) {
        let mut query = self.world.query::<(&Transform, &mut PrevTransform)>();
        for (transform, mut prev) in query.iter_mut(&mut self.world) {
            prev.0 = transform.matrix();
        }
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingDevice;
    use crate::resources::{GpuMesh, Mesh};

    fn camera() -> RenderView {
        let mut view = RenderView::new();
        view.set_perspective(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 1.2, 1.0, 10000.0);
        view
    }

    #[test]
    fn test_collect_culls_models_and_lights() {
        let mut device = RecordingDevice::new();
        let mesh = GpuMesh::upload(&mut device, &Mesh::cube()).unwrap();
        let mut scene = Scene::new();
        scene.spawn_model(
            Transform::from_position(Vec3::new(0.0, 0.0, -100.0)),
            StaticModel::new(mesh, MaterialInfo::default()),
        );
        scene.spawn_model(
            Transform::from_position(Vec3::new(0.0, 0.0, 100.0)),
            StaticModel::new(mesh, MaterialInfo::default()),
        );
        scene.spawn_point_light(Vec3::new(0.0, 0.0, -200.0), PointLight::default());
        scene.spawn_point_light(Vec3::new(0.0, 0.0, 5000.0), PointLight::default());
        scene.spawn_directional_light(Vec3::NEG_Y, DirectionalLight::default());

        let view = camera();
        let mut list = RenderList::new();
        scene.collect(&view, &mut list);

        assert_eq!(list.list(DrawCallsListType::GBuffer).len(), 1);
        assert_eq!(list.list(DrawCallsListType::ShadowDepth).len(), 2);
        assert_eq!(list.point_lights.len(), 1);
        assert_eq!(list.directional_lights.len(), 1);
        assert!((list.directional_lights[0].direction - Vec3::NEG_Y).length() < 1e-5);
    }

    #[test]
    fn test_post_fx_volume_priority() {
        let mut scene = Scene::new();
        let mut low = PostFxVolume {
            settings: PostProcessSettings::default(),
            priority: 0,
            half_extents: None,
        };
        low.settings.motion_blur.scale = 2.0;
        let mut high = low.clone();
        high.priority = 5;
        high.settings.motion_blur.scale = 3.0;
        let mut far = low.clone();
        far.priority = 10;
        far.half_extents = Some(Vec3::splat(10.0));

        scene.spawn_post_fx_volume(Vec3::ZERO, low);
        scene.spawn_post_fx_volume(Vec3::ZERO, high);
        scene.spawn_post_fx_volume(Vec3::new(1000.0, 0.0, 0.0), far);

        let mut list = RenderList::new();
        scene.collect(&camera(), &mut list);
        assert_eq!(list.settings.motion_blur.scale, 3.0);
    }

    #[test]
    fn test_end_frame_updates_prev_transform() {
        let mut device = RecordingDevice::new();
        let mesh = GpuMesh::upload(&mut device, &Mesh::cube()).unwrap();
        let mut scene = Scene::new();
        let entity = scene.spawn_model(
            Transform::from_position(Vec3::new(0.0, 0.0, -100.0)),
            StaticModel::new(mesh, MaterialInfo::default()),
        );
        scene.set_transform(entity, Transform::from_position(Vec3::new(5.0, 0.0, -100.0)));

        let mut list = RenderList::new();
        scene.collect(&camera(), &mut list);
        assert_eq!(list.list(DrawCallsListType::MotionVectors).len(), 1);

        scene.end_frame();
        scene.collect(&camera(), &mut list);
        assert!(list.list(DrawCallsListType::MotionVectors).is_empty());
    }
}
