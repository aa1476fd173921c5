use ash::vk;
use glam::Mat4;
use log::{info, warn};

use super::{create_structure, query_build_sizes, structure_address, AccelStructure};
use crate::context::RtContext;
use crate::error::Result;
use crate::pipeline::HitGroupKind;
use crate::resources::{raw_bytes, GpuBuffer};
use crate::scene::SceneObject;

/// Convert a column-major world transform into the row-major 3x4 matrix
/// instances carry (the last row is implicitly 0,0,0,1).
pub fn vk_transform(transform: &Mat4) -> vk::TransformMatrixKHR {
    let rows = transform.transpose().to_cols_array();
    let mut matrix = [0.0f32; 12];
    matrix.copy_from_slice(&rows[..12]);
    vk::TransformMatrixKHR { matrix }
}

/// Emit one instance per object with a resolvable mesh, in iteration
/// order. Instance custom indices restart at zero on every call; they are
/// scoped to a single build pass, never persisted. Objects pointing at a
/// missing mesh are logged and skipped, matching the object-info buffer.
pub fn instance_records(
    objects: &[SceneObject],
    blas_addresses: &[vk::DeviceAddress],
) -> Vec<vk::AccelerationStructureInstanceKHR> {
    let mut instances = Vec::new();
    let mut instance_id = 0u32;

    for (index, object) in objects.iter().enumerate() {
        let Some(mesh) = object.mesh else { continue };
        let Some(&blas_address) = blas_addresses.get(mesh as usize) else {
            warn!("Object {index} references unknown mesh {mesh}, skipping");
            continue;
        };

        let hit_group = HitGroupKind::Diffuse.sbt_offset();
        instances.push(vk::AccelerationStructureInstanceKHR {
            transform: vk_transform(&object.transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(instance_id, 0xFF),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                hit_group,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas_address,
            },
        });
        instance_id += 1;
    }
    instances
}

/// The scene's single top-level acceleration structure, together with the
/// buffers backing it. Rebuilt wholesale whenever any object's transform
/// or membership changes.
pub struct TopLevelStructures {
    pub structure: AccelStructure,
    pub instance_count: u32,
    result_buffer: GpuBuffer,
    scratch_buffer: GpuBuffer,
    instance_buffer: GpuBuffer,
    staging: Option<GpuBuffer>,
}

impl TopLevelStructures {
    /// Upload the instance array and build the TLAS on `command_buffer`.
    /// The staging buffer stays alive inside the returned value; call
    /// [`release_staging`](Self::release_staging) once the commands have
    /// executed.
    pub fn build(
        ctx: &RtContext,
        command_buffer: vk::CommandBuffer,
        instances: &[vk::AccelerationStructureInstanceKHR],
    ) -> Result<Self> {
        let instance_count = instances.len() as u32;
        info!("Building top level structure over {instance_count} instances");

        let (instance_buffer, staging) = GpuBuffer::device_local_with_data(
            ctx,
            command_buffer,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            unsafe { raw_bytes(instances) },
        )?;

        // The build must see the committed instance data.
        let upload_barrier = vk::MemoryBarrier {
            src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            dst_access_mask: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            ..Default::default()
        };
        unsafe {
            ctx.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::DependencyFlags::empty(),
                &[upload_barrier],
                &[],
                &[],
            );
        }

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR {
            array_of_pointers: vk::FALSE,
            data: vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.address,
            },
            ..Default::default()
        };
        let geometry = vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::INSTANCES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            },
            ..Default::default()
        };

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            geometry_count: 1,
            p_geometries: &geometry,
            ..Default::default()
        };
        // Single structure: the size query is direct, not summed.
        let sizes = query_build_sizes(ctx, &build_info, &[instance_count])
            .aligned(ctx.properties.min_scratch_alignment as u64);

        let result_buffer = GpuBuffer::new(
            ctx,
            sizes.acceleration_structure_size.max(1),
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let scratch_buffer = GpuBuffer::new(
            ctx,
            sizes.build_scratch_size.max(1),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let handle = create_structure(
            ctx,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            result_buffer.buffer,
            0,
            sizes.acceleration_structure_size,
        )?;

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            dst_acceleration_structure: handle,
            scratch_data: vk::DeviceOrHostAddressKHR {
                device_address: scratch_buffer.address,
            },
            ..build_info
        };
        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: instance_count,
            ..Default::default()
        };
        unsafe {
            ctx.accel.cmd_build_acceleration_structures(
                command_buffer,
                &[build_info],
                &[std::slice::from_ref(&range)],
            );
        }

        Ok(Self {
            structure: AccelStructure {
                handle,
                address: structure_address(ctx, handle),
                sizes,
            },
            instance_count,
            result_buffer,
            scratch_buffer,
            instance_buffer,
            staging,
        })
    }

    /// Drop the upload staging buffer. Only valid once the build commands
    /// have finished executing.
    pub fn release_staging(&mut self, device: &ash::Device) {
        if let Some(mut staging) = self.staging.take() {
            staging.destroy(device);
        }
    }

    pub fn destroy(&mut self, ctx: &RtContext) {
        self.release_staging(&ctx.device);
        self.structure.destroy(ctx);
        self.result_buffer.destroy(&ctx.device);
        self.scratch_buffer.destroy(&ctx.device);
        self.instance_buffer.destroy(&ctx.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SceneObject;
    use glam::Vec3;

    fn object(mesh: Option<u32>, transform: Mat4) -> SceneObject {
        SceneObject {
            mesh,
            material: 0,
            transform,
        }
    }

    #[test]
    fn instance_count_matches_mesh_bearing_objects() {
        let blas = [0x1000u64, 0x2000u64];
        let objects = vec![
            object(Some(0), Mat4::IDENTITY),
            object(None, Mat4::IDENTITY),
            object(Some(1), Mat4::IDENTITY),
            object(Some(7), Mat4::IDENTITY), // dangling, skipped
        ];

        let instances = instance_records(&objects, &blas);
        assert_eq!(instances.len(), 2);
        assert_eq!(
            unsafe { instances[0].acceleration_structure_reference.device_handle },
            0x1000
        );
        assert_eq!(
            unsafe { instances[1].acceleration_structure_reference.device_handle },
            0x2000
        );
    }

    #[test]
    fn instance_ids_restart_at_zero_each_pass() {
        let blas = [0x1000u64];
        let objects = vec![object(Some(0), Mat4::IDENTITY), object(Some(0), Mat4::IDENTITY)];

        for _ in 0..2 {
            let instances = instance_records(&objects, &blas);
            assert_eq!(instances[0].instance_custom_index_and_mask.low_24(), 0);
            assert_eq!(instances[1].instance_custom_index_and_mask.low_24(), 1);
            assert_eq!(instances[0].instance_custom_index_and_mask.high_8(), 0xFF);
        }
    }

    #[test]
    fn transform_is_row_major_with_translation_last_column() {
        let transform = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let m = vk_transform(&transform).matrix;

        // Row-major 3x4: translation sits at the end of each row.
        assert_eq!(m[3], 1.0);
        assert_eq!(m[7], 2.0);
        assert_eq!(m[11], 3.0);
        // Rotation part stays identity.
        assert_eq!(m[0], 1.0);
        assert_eq!(m[5], 1.0);
        assert_eq!(m[10], 1.0);
        assert_eq!(m[1], 0.0);
    }

    #[test]
    fn same_mesh_may_be_instanced_many_times() {
        let blas = [0xAB00u64];
        let objects: Vec<_> = (0..5)
            .map(|i| {
                object(
                    Some(0),
                    Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0)),
                )
            })
            .collect();
        let instances = instance_records(&objects, &blas);
        assert_eq!(instances.len(), 5);
        for instance in &instances {
            assert_eq!(unsafe { instance.acceleration_structure_reference.device_handle }, 0xAB00);
        }
    }

    #[test]
    fn empty_scene_builds_empty_instance_list() {
        assert!(instance_records(&[], &[]).is_empty());
    }
}
