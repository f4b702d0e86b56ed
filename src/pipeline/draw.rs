//! Draw call replay
//!
//! Shared by every pass that draws a [`DrawCallsList`]: per-object
//! constants go to [`OBJECT_CB_SLOT`], instanced batches upload their
//! world matrices into a structured buffer bound at [`INSTANCES_SR_SLOT`].

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3, Vec4};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::scene::{DrawCall, DrawCallsList, RenderView};

pub const OBJECT_CB_SLOT: u32 = 1;
pub const INSTANCES_SR_SLOT: u32 = 7;

/// Instances drawn by one indexed draw
pub const MAX_INSTANCES: u32 = 1024;

/// Per-object constants
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ObjectData {
    pub world: Mat4,
    pub prev_world: Mat4,
    /// (determinant sign, per-instance random, LOD dither, LOD index)
    pub params: Vec4,
}

impl ObjectData {
    pub fn new(draw_call: &DrawCall) -> Self {
        Self {
            world: draw_call.world,
            prev_world: draw_call.prev_world,
            params: Vec4::new(
                draw_call.world_determinant_sign,
                draw_call.per_instance_random,
                draw_call.lod_dither_factor,
                draw_call.lod_index as f32,
            ),
        }
    }
}

/// One entry of the instance buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InstanceEntry {
    pub world: Mat4,
    pub prev_world: Mat4,
}

/// Cull mode of a draw call, flipped for mirrored transforms
pub fn cull_mode(draw_call: &DrawCall) -> CullMode {
    if draw_call.material.two_sided {
        CullMode::None
    } else if draw_call.world_determinant_sign < 0.0 {
        CullMode::Front
    } else {
        CullMode::Back
    }
}

/// Index into a `[Back, Front, None]` state triple
pub fn cull_index(mode: CullMode) -> usize {
    match mode {
        CullMode::Back => 0,
        CullMode::Front => 1,
        CullMode::None => 2,
    }
}

/// Tessellation of the sphere mesh used for local light volumes
pub const LIGHT_SPHERE_SEGMENTS: u32 = 16;
pub const LIGHT_SPHERE_RINGS: u32 = 8;

/// World-view-projection of a light volume sphere and whether the camera
/// sits inside it (cull mode must be inverted then)
pub fn light_volume(view: &RenderView, center: Vec3, radius: f32) -> (Mat4, bool) {
    let scale = radius * crate::resources::sphere_volume_scale(LIGHT_SPHERE_SEGMENTS, LIGHT_SPHERE_RINGS);
    let world = Mat4::from_scale_rotation_translation(Vec3::splat(scale), Quat::IDENTITY, center - view.origin);
    // Near plane clipping counts as inside
    let inside = view.position.distance(center) < scale + view.near * 2.0;
    (view.view_projection * world, inside)
}

/// Object constant buffer plus the instance buffer
#[derive(Debug)]
pub struct DrawCallsRenderer {
    object_cb: GpuBuffer,
    instances: GpuBuffer,
}

impl DrawCallsRenderer {
    pub fn new(device: &mut dyn GpuDevice, name: &str) -> RenderResult<Self> {
        let object_cb = device
            .create_buffer(
                &format!("{name}.ObjectCB"),
                &BufferDescriptor::constant(std::mem::size_of::<ObjectData>()),
            )
            .map_err(|err| RenderError::resource(name, err))?;
        let instances = match device.create_buffer(
            &format!("{name}.Instances"),
            &BufferDescriptor::structured(
                MAX_INSTANCES,
                std::mem::size_of::<InstanceEntry>() as u32,
                BufferUsage::empty(),
            ),
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.destroy_buffer(object_cb);
                return Err(RenderError::resource(name, err));
            }
        };
        Ok(Self { object_cb, instances })
    }

    /// Draw every batch of `list`. `state_for` picks the pipeline state of a
    /// batch from its first call; `None` skips the batch. Returns the number
    /// of indexed draws issued.
    pub fn execute(
        &self,
        gpu: &mut dyn GpuContext,
        draw_calls: &[DrawCall],
        list: &DrawCallsList,
        mut state_for: impl FnMut(&DrawCall) -> Option<PipelineStateHandle>,
    ) -> u32 {
        let mut draws = 0;
        gpu.bind_cb(OBJECT_CB_SLOT, self.object_cb.handle);

        for batch in &list.batches {
            let indices = &list.indices[batch.start_index..batch.start_index + batch.instance_count as usize];
            let head = &draw_calls[indices[0]];
            let Some(state) = state_for(head) else {
                continue;
            };
            gpu.set_state(state);
            gpu.update_cb(self.object_cb.handle, bytemuck::bytes_of(&ObjectData::new(head)));

            if indices.len() == 1 {
                gpu.bind_sr(INSTANCES_SR_SLOT, None);
                head.geometry.draw(gpu, 1);
                draws += 1;
                continue;
            }

            for chunk in indices.chunks(MAX_INSTANCES as usize) {
                let entries: Vec<InstanceEntry> = chunk
                    .iter()
                    .map(|index| InstanceEntry {
                        world: draw_calls[*index].world,
                        prev_world: draw_calls[*index].prev_world,
                    })
                    .collect();
                gpu.update_buffer(self.instances.handle, 0, bytemuck::cast_slice(&entries));
                gpu.bind_sr(INSTANCES_SR_SLOT, Some(self.instances.handle.into()));
                head.geometry.draw(gpu, chunk.len() as u32);
                draws += 1;
            }
        }

        gpu.bind_sr(INSTANCES_SR_SLOT, None);
        draws
    }

    /// Draw a single call with its own constants
    pub fn draw_single(&self, gpu: &mut dyn GpuContext, draw_call: &DrawCall) {
        gpu.bind_cb(OBJECT_CB_SLOT, self.object_cb.handle);
        gpu.update_cb(self.object_cb.handle, bytemuck::bytes_of(&ObjectData::new(draw_call)));
        draw_call.geometry.draw(gpu, 1);
    }

    pub fn release(self, device: &mut dyn GpuDevice) {
        device.destroy_buffer(self.object_cb);
        device.destroy_buffer(self.instances);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{GpuMesh, Mesh};
    use crate::scene::{InstanceData, MaterialInfo, RenderList, RenderView, DrawCallsListType, DrawPass, StaticFlags};
    use glam::Vec3;

    fn draw_call(mesh: GpuMesh, z: f32) -> DrawCall {
        let world = Mat4::from_translation(Vec3::new(0.0, 0.0, z));
        DrawCall {
            world,
            prev_world: world,
            geometry: mesh,
            material: MaterialInfo::default(),
            instance_data: InstanceData::None,
            world_determinant_sign: 1.0,
            per_instance_random: 0.0,
            lod_index: 0,
            lod_dither_factor: 0.0,
            bounds_center: Vec3::new(0.0, 0.0, z),
            bounds_radius: 1.0,
            static_flags: StaticFlags::empty(),
            casts_shadows: false,
            distance: 0.0,
        }
    }

    #[test]
    fn test_instanced_batch_is_one_draw() {
        let mut device = RecordingDevice::new();
        let mut gpu = RecordingContext::new();
        let mesh = GpuMesh::upload(&mut device, &Mesh::cube()).unwrap();
        let view = RenderView::new();
        let mut list = RenderList::new();
        for i in 0..5 {
            list.add_draw_call(&view, DrawPass::DEFAULT, draw_call(mesh, -10.0 - i as f32));
        }
        list.sort_draw_calls();

        let renderer = DrawCallsRenderer::new(&mut device, "Test").unwrap();
        let state = device
            .create_pipeline_state(&PipelineStateDescriptor::geometry("Shaders/Test", "VS", Some("PS")))
            .unwrap();
        let draws = renderer.execute(
            &mut gpu,
            &list.draw_calls,
            list.list(DrawCallsListType::GBuffer),
            |_| Some(state),
        );
        assert_eq!(draws, 1);
        assert!(gpu
            .commands()
            .contains(&GpuCommand::DrawIndexedInstanced { indices: 36, instances: 5 }));
    }

    #[test]
    fn test_mirrored_call_flips_cull() {
        let mut device = RecordingDevice::new();
        let mesh = GpuMesh::upload(&mut device, &Mesh::cube()).unwrap();
        let mut call = draw_call(mesh, 0.0);
        assert_eq!(cull_mode(&call), CullMode::Back);
        call.world_determinant_sign = -1.0;
        assert_eq!(cull_mode(&call), CullMode::Front);
        call.material.two_sided = true;
        assert_eq!(cull_index(cull_mode(&call)), 2);
    }
}
