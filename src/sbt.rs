use ash::vk;
use log::debug;

use crate::context::{RtContext, RtDeviceProperties};
use crate::error::{Result, RtError};
use crate::resources::GpuBuffer;

/// The driver alignment rules the table layout must satisfy.
#[derive(Debug, Clone, Copy)]
pub struct SbtProperties {
    pub handle_size: u32,
    pub handle_alignment: u32,
    pub base_alignment: u32,
}

impl From<&RtDeviceProperties> for SbtProperties {
    fn from(properties: &RtDeviceProperties) -> Self {
        Self {
            handle_size: properties.shader_group_handle_size,
            handle_alignment: properties.shader_group_handle_alignment,
            base_alignment: properties.shader_group_base_alignment,
        }
    }
}

/// One table entry: a shader group plus optional inline data embedded
/// after the handle (currently unused by the shaders, kept for
/// per-record parameters).
pub struct SbtEntry {
    pub group_index: u32,
    pub inline_data: Vec<u8>,
}

impl SbtEntry {
    pub fn plain(group_index: u32) -> Self {
        Self {
            group_index,
            inline_data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionLayout {
    pub offset: u64,
    pub entry_size: u64,
    pub size: u64,
}

/// Byte layout of the ray-gen / miss / hit-group regions inside one
/// buffer. Entry sizes are multiples of the handle alignment and at least
/// one handle wide; region offsets and sizes are multiples of the base
/// alignment. Violating either is undefined GPU behavior, so the math
/// lives here where it can be tested.
#[derive(Debug, Clone, Copy, Default)]
pub struct SbtLayout {
    pub raygen: RegionLayout,
    pub miss: RegionLayout,
    pub hit: RegionLayout,
    pub total_size: u64,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

fn entry_size(properties: &SbtProperties, entries: &[SbtEntry]) -> u64 {
    let max_inline = entries.iter().map(|e| e.inline_data.len()).max().unwrap_or(0);
    align_up(
        properties.handle_size as u64 + max_inline as u64,
        properties.handle_alignment as u64,
    )
}

pub fn compute_layout(
    properties: &SbtProperties,
    raygen: &[SbtEntry],
    miss: &[SbtEntry],
    hit: &[SbtEntry],
) -> SbtLayout {
    let base = properties.base_alignment as u64;

    let mut offset = 0;
    let mut region = |entries: &[SbtEntry]| {
        let entry_size = entry_size(properties, entries);
        let size = align_up(entries.len() as u64 * entry_size, base);
        let layout = RegionLayout {
            offset,
            entry_size,
            size,
        };
        offset += size;
        layout
    };

    let raygen = region(raygen);
    let miss = region(miss);
    let hit = region(hit);

    SbtLayout {
        raygen,
        miss,
        hit,
        total_size: offset,
    }
}

/// The packed table in GPU memory plus the strided regions handed to the
/// trace call. Built once per pipeline compilation and invalidated with
/// the pipeline.
pub struct ShaderBindingTable {
    buffer: GpuBuffer,
    layout: SbtLayout,
}

impl ShaderBindingTable {
    pub fn new(
        ctx: &RtContext,
        pipeline: vk::Pipeline,
        raygen: &[SbtEntry],
        miss: &[SbtEntry],
        hit: &[SbtEntry],
    ) -> Result<Self> {
        let properties = SbtProperties::from(&ctx.properties);
        let layout = compute_layout(&properties, raygen, miss, hit);

        let group_count = (raygen.len() + miss.len() + hit.len()) as u32;
        let handle_size = properties.handle_size as usize;
        let handles = unsafe {
            ctx.rt_pipeline.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                group_count as usize * handle_size,
            )?
        };

        let mut data = vec![0u8; layout.total_size as usize];
        for (entries, region) in [
            (raygen, layout.raygen),
            (miss, layout.miss),
            (hit, layout.hit),
        ] {
            let mut cursor = region.offset as usize;
            for entry in entries {
                let handle_offset = entry.group_index as usize * handle_size;
                let handle = handles
                    .get(handle_offset..handle_offset + handle_size)
                    .ok_or(RtError::InvalidShaderGroup(entry.group_index))?;
                data[cursor..cursor + handle_size].copy_from_slice(handle);
                data[cursor + handle_size..cursor + handle_size + entry.inline_data.len()]
                    .copy_from_slice(&entry.inline_data);
                cursor += region.entry_size as usize;
            }
        }

        let buffer = GpuBuffer::host_visible_with_data(
            ctx,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            &data,
        )?;
        debug!(
            "Shader binding table: {} groups in {} bytes",
            group_count, layout.total_size
        );

        Ok(Self { buffer, layout })
    }

    /// The four regions consumed by `vkCmdTraceRaysKHR`. The callable
    /// region is unused and stays zeroed.
    pub fn regions(&self) -> [vk::StridedDeviceAddressRegionKHR; 4] {
        let address = self.buffer.address;
        [
            // The ray-gen region's stride must equal its size.
            vk::StridedDeviceAddressRegionKHR {
                device_address: address + self.layout.raygen.offset,
                stride: self.layout.raygen.size,
                size: self.layout.raygen.size,
            },
            vk::StridedDeviceAddressRegionKHR {
                device_address: address + self.layout.miss.offset,
                stride: self.layout.miss.entry_size,
                size: self.layout.miss.size,
            },
            vk::StridedDeviceAddressRegionKHR {
                device_address: address + self.layout.hit.offset,
                stride: self.layout.hit.entry_size,
                size: self.layout.hit.size,
            },
            vk::StridedDeviceAddressRegionKHR::default(),
        ]
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.buffer.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(count: usize) -> Vec<SbtEntry> {
        (0..count as u32).map(SbtEntry::plain).collect()
    }

    #[test]
    fn entry_size_covers_handle_and_respects_alignment() {
        let cases = [
            SbtProperties {
                handle_size: 32,
                handle_alignment: 32,
                base_alignment: 64,
            },
            SbtProperties {
                handle_size: 16,
                handle_alignment: 16,
                base_alignment: 64,
            },
            SbtProperties {
                handle_size: 32,
                handle_alignment: 64,
                base_alignment: 128,
            },
        ];
        for properties in cases {
            let layout = compute_layout(&properties, &entries(1), &entries(2), &entries(2));
            for region in [layout.raygen, layout.miss, layout.hit] {
                assert!(region.entry_size >= properties.handle_size as u64);
                assert_eq!(region.entry_size % properties.handle_alignment as u64, 0);
                assert_eq!(region.size % properties.base_alignment as u64, 0);
                assert_eq!(region.offset % properties.base_alignment as u64, 0);
            }
        }
    }

    #[test]
    fn inline_data_grows_every_entry_of_the_region() {
        let properties = SbtProperties {
            handle_size: 32,
            handle_alignment: 32,
            base_alignment: 64,
        };
        let hit = vec![
            SbtEntry {
                group_index: 3,
                inline_data: vec![0; 12],
            },
            SbtEntry::plain(4),
        ];
        let layout = compute_layout(&properties, &entries(1), &entries(2), &hit);
        // 32 + 12 rounded to the handle alignment.
        assert_eq!(layout.hit.entry_size, 64);
        assert_eq!(layout.hit.size, 128);
    }

    #[test]
    fn regions_are_contiguous_and_sum_to_total() {
        let properties = SbtProperties {
            handle_size: 32,
            handle_alignment: 32,
            base_alignment: 64,
        };
        let layout = compute_layout(&properties, &entries(1), &entries(2), &entries(1));
        assert_eq!(layout.raygen.offset, 0);
        assert_eq!(layout.miss.offset, layout.raygen.size);
        assert_eq!(layout.hit.offset, layout.raygen.size + layout.miss.size);
        assert_eq!(
            layout.total_size,
            layout.raygen.size + layout.miss.size + layout.hit.size
        );
    }
}
