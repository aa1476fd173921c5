use ash::vk;
use log::{debug, info};

use super::{
    create_structure, pack_build_sizes, query_build_sizes, structure_address, AccelStructure,
    BuildSizes,
};
use crate::context::RtContext;
use crate::error::Result;
use crate::geometry::{GeometryRegistry, Vertex};
use crate::resources::GpuBuffer;

/// One bottom-level acceleration structure per registered mesh, packed
/// into a shared result buffer and built through a shared scratch buffer.
pub struct BottomLevelStructures {
    pub structures: Vec<AccelStructure>,
    result_buffer: GpuBuffer,
    scratch_buffer: GpuBuffer,
}

impl BottomLevelStructures {
    /// Describe, size and build every mesh's BLAS back-to-back on
    /// `command_buffer`. Geometries reference sub-ranges of the shared
    /// vertex/index buffers; nothing is copied.
    pub fn build(
        ctx: &RtContext,
        command_buffer: vk::CommandBuffer,
        registry: &GeometryRegistry,
        vertex_address: vk::DeviceAddress,
        index_address: vk::DeviceAddress,
    ) -> Result<Self> {
        let records = registry.meshes();
        let mut geometries = Vec::with_capacity(records.len());
        let mut ranges = Vec::with_capacity(records.len());
        let mut sizes = Vec::with_capacity(records.len());

        for record in records {
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR {
                vertex_format: vk::Format::R32G32B32_SFLOAT,
                vertex_data: vk::DeviceOrHostAddressConstKHR {
                    device_address: vertex_address,
                },
                vertex_stride: std::mem::size_of::<Vertex>() as u64,
                max_vertex: record.vertex_count,
                index_type: vk::IndexType::UINT32,
                index_data: vk::DeviceOrHostAddressConstKHR {
                    device_address: index_address,
                },
                ..Default::default()
            };
            let geometry = vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::TRIANGLES,
                geometry: vk::AccelerationStructureGeometryDataKHR { triangles },
                flags: vk::GeometryFlagsKHR::OPAQUE,
                ..Default::default()
            };
            let range = vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: record.triangle_count(),
                primitive_offset: record.index_byte_offset() as u32,
                first_vertex: record.vertex_offset,
                transform_offset: 0,
            };

            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
                ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
                mode: vk::BuildAccelerationStructureModeKHR::BUILD,
                geometry_count: 1,
                p_geometries: &geometry,
                ..Default::default()
            };
            sizes.push(query_build_sizes(ctx, &build_info, &[range.primitive_count]));

            geometries.push(geometry);
            ranges.push(range);
        }

        let layout = pack_build_sizes(&sizes, ctx.properties.min_scratch_alignment as u64);
        info!(
            "Building {} bottom level structures ({} result bytes, {} scratch bytes)",
            records.len(),
            layout.total.acceleration_structure_size,
            layout.total.build_scratch_size,
        );

        // Minimum 1-byte allocations keep the empty-scene path alive.
        let result_buffer = GpuBuffer::new(
            ctx,
            layout.total.acceleration_structure_size.max(1),
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let scratch_buffer = GpuBuffer::new(
            ctx,
            layout.total.build_scratch_size.max(1),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let mut structures = Vec::with_capacity(records.len());
        for i in 0..geometries.len() {
            let aligned = layout.aligned_sizes[i];
            let handle = create_structure(
                ctx,
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                result_buffer.buffer,
                layout.result_offsets[i],
                aligned.acceleration_structure_size,
            )?;

            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
                ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
                mode: vk::BuildAccelerationStructureModeKHR::BUILD,
                dst_acceleration_structure: handle,
                geometry_count: 1,
                p_geometries: &geometries[i],
                scratch_data: vk::DeviceOrHostAddressKHR {
                    device_address: scratch_buffer.address + layout.scratch_offsets[i],
                },
                ..Default::default()
            };
            unsafe {
                ctx.accel.cmd_build_acceleration_structures(
                    command_buffer,
                    &[build_info],
                    &[std::slice::from_ref(&ranges[i])],
                );
            }
            debug!(
                "BLAS {i}: {} result bytes at offset {}, {} scratch bytes at offset {}",
                aligned.acceleration_structure_size,
                layout.result_offsets[i],
                aligned.build_scratch_size,
                layout.scratch_offsets[i],
            );

            structures.push(AccelStructure {
                handle,
                address: structure_address(ctx, handle),
                sizes: aligned,
            });
        }

        Ok(Self {
            structures,
            result_buffer,
            scratch_buffer,
        })
    }

    pub fn addresses(&self) -> Vec<vk::DeviceAddress> {
        self.structures.iter().map(|s| s.address).collect()
    }

    pub fn total_sizes(&self) -> BuildSizes {
        self.structures.iter().fold(BuildSizes::default(), |acc, s| BuildSizes {
            acceleration_structure_size: acc.acceleration_structure_size
                + s.sizes.acceleration_structure_size,
            build_scratch_size: acc.build_scratch_size + s.sizes.build_scratch_size,
        })
    }

    pub fn destroy(&mut self, ctx: &RtContext) {
        for structure in &mut self.structures {
            structure.destroy(ctx);
        }
        self.structures.clear();
        self.result_buffer.destroy(&ctx.device);
        self.scratch_buffer.destroy(&ctx.device);
    }
}
