pub mod blas;
pub mod tlas;

use ash::vk;

pub use blas::BottomLevelStructures;
pub use tlas::{instance_records, TopLevelStructures};

use crate::context::RtContext;
use crate::error::Result;

/// Acceleration structure offsets inside a result buffer must be 256-byte
/// aligned (Vulkan spec).
pub const RESULT_ALIGNMENT: u64 = 256;

pub(crate) fn round_up(value: u64, granularity: u64) -> u64 {
    value.div_ceil(granularity) * granularity
}

/// Size requirements reported by the driver for one structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub acceleration_structure_size: u64,
    pub build_scratch_size: u64,
}

impl BuildSizes {
    pub fn aligned(self, scratch_alignment: u64) -> Self {
        Self {
            acceleration_structure_size: round_up(
                self.acceleration_structure_size,
                RESULT_ALIGNMENT,
            ),
            build_scratch_size: round_up(self.build_scratch_size, scratch_alignment),
        }
    }
}

/// Offsets assigned to each structure inside the shared result and scratch
/// buffers, plus the totals to allocate.
#[derive(Debug, Default)]
pub struct PackedLayout {
    pub result_offsets: Vec<u64>,
    pub scratch_offsets: Vec<u64>,
    pub aligned_sizes: Vec<BuildSizes>,
    pub total: BuildSizes,
}

/// Assign back-to-back offsets for a batch of builds sharing one result
/// buffer and one scratch buffer. Builds are issued sequentially on a
/// single command buffer, so the scratch region is handed from one build
/// to the next by offset.
pub fn pack_build_sizes(sizes: &[BuildSizes], scratch_alignment: u64) -> PackedLayout {
    let mut layout = PackedLayout::default();
    for size in sizes {
        let aligned = size.aligned(scratch_alignment);
        layout
            .result_offsets
            .push(layout.total.acceleration_structure_size);
        layout.scratch_offsets.push(layout.total.build_scratch_size);
        layout.total.acceleration_structure_size += aligned.acceleration_structure_size;
        layout.total.build_scratch_size += aligned.build_scratch_size;
        layout.aligned_sizes.push(aligned);
    }
    layout
}

/// One built structure: handle, device address and the sizes it was built
/// with (retained for diagnostics).
pub struct AccelStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub address: vk::DeviceAddress,
    pub sizes: BuildSizes,
}

impl AccelStructure {
    pub fn destroy(&mut self, ctx: &RtContext) {
        unsafe { ctx.accel.destroy_acceleration_structure(self.handle, None) };
        self.handle = vk::AccelerationStructureKHR::null();
    }
}

pub(crate) fn query_build_sizes(
    ctx: &RtContext,
    build_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
    primitive_counts: &[u32],
) -> BuildSizes {
    let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        ctx.accel.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            build_info,
            primitive_counts,
            &mut size_info,
        );
    }
    BuildSizes {
        acceleration_structure_size: size_info.acceleration_structure_size,
        build_scratch_size: size_info.build_scratch_size,
    }
}

pub(crate) fn create_structure(
    ctx: &RtContext,
    ty: vk::AccelerationStructureTypeKHR,
    buffer: vk::Buffer,
    offset: u64,
    size: u64,
) -> Result<vk::AccelerationStructureKHR> {
    let create_info = vk::AccelerationStructureCreateInfoKHR {
        buffer,
        offset,
        size,
        ty,
        ..Default::default()
    };
    let handle = unsafe { ctx.accel.create_acceleration_structure(&create_info, None)? };
    Ok(handle)
}

pub(crate) fn structure_address(
    ctx: &RtContext,
    handle: vk::AccelerationStructureKHR,
) -> vk::DeviceAddress {
    let info = vk::AccelerationStructureDeviceAddressInfoKHR {
        acceleration_structure: handle,
        ..Default::default()
    };
    unsafe { ctx.accel.get_acceleration_structure_device_address(&info) }
}

/// Barrier between acceleration structure builds: the bottom-level builds
/// must be visible before the top-level build that references them.
pub fn acceleration_barrier(device: &ash::Device, command_buffer: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier {
        src_access_mask: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
            | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
        dst_access_mask: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
            | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
        ..Default::default()
    };
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_totals_equal_sum_of_aligned_sizes() {
        let sizes = [
            BuildSizes {
                acceleration_structure_size: 1000,
                build_scratch_size: 300,
            },
            BuildSizes {
                acceleration_structure_size: 513,
                build_scratch_size: 129,
            },
            BuildSizes {
                acceleration_structure_size: 256,
                build_scratch_size: 128,
            },
        ];
        let layout = pack_build_sizes(&sizes, 128);

        let summed: u64 = layout
            .aligned_sizes
            .iter()
            .map(|s| s.acceleration_structure_size)
            .sum();
        assert_eq!(layout.total.acceleration_structure_size, summed);

        let summed_scratch: u64 = layout
            .aligned_sizes
            .iter()
            .map(|s| s.build_scratch_size)
            .sum();
        assert_eq!(layout.total.build_scratch_size, summed_scratch);
    }

    #[test]
    fn offsets_advance_by_each_structures_own_size() {
        let sizes = [
            BuildSizes {
                acceleration_structure_size: 300,
                build_scratch_size: 100,
            },
            BuildSizes {
                acceleration_structure_size: 700,
                build_scratch_size: 50,
            },
        ];
        let layout = pack_build_sizes(&sizes, 64);

        assert_eq!(layout.result_offsets, vec![0, 512]); // 300 -> 512
        assert_eq!(layout.scratch_offsets, vec![0, 128]); // 100 -> 128
        assert_eq!(layout.total.acceleration_structure_size, 512 + 768);
        assert_eq!(layout.total.build_scratch_size, 128 + 64);
    }

    #[test]
    fn result_offsets_are_256_byte_aligned() {
        let sizes: Vec<BuildSizes> = (1..20)
            .map(|i| BuildSizes {
                acceleration_structure_size: i * 97,
                build_scratch_size: i * 31,
            })
            .collect();
        let layout = pack_build_sizes(&sizes, 64);
        for offset in &layout.result_offsets {
            assert_eq!(offset % RESULT_ALIGNMENT, 0);
        }
        for offset in &layout.scratch_offsets {
            assert_eq!(offset % 64, 0);
        }
    }

    #[test]
    fn empty_batch_packs_to_zero() {
        let layout = pack_build_sizes(&[], 128);
        assert!(layout.result_offsets.is_empty());
        assert_eq!(layout.total, BuildSizes::default());
    }
}
