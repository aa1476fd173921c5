use ash::vk;
use log::{debug, error};

use crate::context::RtContext;
use crate::error::{Result, RtError};

pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_bits & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(flags)
        {
            return Ok(i);
        }
    }
    Err(RtError::NoSuitableMemoryType { type_bits, flags })
}

/// View a `repr(C)` slice as raw bytes for upload.
///
/// Safety: `T` must be plain-old-data without padding the GPU would read
/// uninitialized (the Vulkan instance/handle structs uploaded here qualify).
pub unsafe fn raw_bytes<T>(data: &[T]) -> &[u8] {
    std::slice::from_raw_parts(data.as_ptr().cast::<u8>(), std::mem::size_of_val(data))
}

/// A buffer with its backing allocation and, when requested through usage
/// flags, its device address.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub address: vk::DeviceAddress,
}

impl GpuBuffer {
    pub fn new(
        ctx: &RtContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let create_info = vk::BufferCreateInfo {
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe { ctx.device.create_buffer(&create_info, None)? };
        let requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };
        let memory_type =
            find_memory_type(&ctx.memory_properties, requirements.memory_type_bits, memory_flags)?;

        let needs_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let mut flags_info = vk::MemoryAllocateFlagsInfo {
            flags: vk::MemoryAllocateFlags::DEVICE_ADDRESS,
            ..Default::default()
        };
        let mut alloc_info = vk::MemoryAllocateInfo {
            allocation_size: requirements.size,
            memory_type_index: memory_type,
            ..Default::default()
        };
        if needs_address {
            alloc_info.p_next = (&mut flags_info as *mut vk::MemoryAllocateFlagsInfo).cast();
        }

        let memory = match unsafe { ctx.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                error!(
                    "Failed to allocate {} bytes of GPU memory (usage {usage:?}): {err:?}",
                    requirements.size
                );
                return Err(err.into());
            }
        };
        unsafe { ctx.device.bind_buffer_memory(buffer, memory, 0)? };

        let address = if needs_address {
            let address_info = vk::BufferDeviceAddressInfo {
                buffer,
                ..Default::default()
            };
            unsafe { ctx.device.get_buffer_device_address(&address_info) }
        } else {
            0
        };

        debug!("Allocated buffer: {} bytes (usage {usage:?})", requirements.size);
        Ok(Self {
            buffer,
            memory,
            size,
            address,
        })
    }

    /// Host-visible buffer pre-filled with `data`. Size is clamped to one
    /// byte so empty inputs still produce a valid buffer.
    pub fn host_visible_with_data(
        ctx: &RtContext,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> Result<Self> {
        let buffer = Self::new(
            ctx,
            (data.len() as vk::DeviceSize).max(1),
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        if !data.is_empty() {
            buffer.write_bytes(&ctx.device, 0, data)?;
        }
        Ok(buffer)
    }

    /// Device-local buffer filled from a staging buffer; the copy is
    /// recorded on `command_buffer` and the staging buffer is returned so
    /// the caller can destroy it once the commands have executed.
    pub fn device_local_with_data(
        ctx: &RtContext,
        command_buffer: vk::CommandBuffer,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> Result<(Self, Option<GpuBuffer>)> {
        let buffer = Self::new(
            ctx,
            (data.len() as vk::DeviceSize).max(1),
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        if data.is_empty() {
            return Ok((buffer, None));
        }
        let staging =
            Self::host_visible_with_data(ctx, vk::BufferUsageFlags::TRANSFER_SRC, data)?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: data.len() as vk::DeviceSize,
        };
        unsafe {
            ctx.device
                .cmd_copy_buffer(command_buffer, staging.buffer, buffer.buffer, &[region]);
        }
        Ok((buffer, Some(staging)))
    }

    pub fn write_bytes(&self, device: &ash::Device, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        unsafe {
            let ptr = device.map_memory(
                self.memory,
                offset,
                data.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            device.unmap_memory(self.memory);
        }
        Ok(())
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// A 2D image with its allocation and default color view.
pub struct GpuImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl GpuImage {
    pub fn new(
        ctx: &RtContext,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let create_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { ctx.device.create_image(&create_info, None)? };
        let requirements = unsafe { ctx.device.get_image_memory_requirements(image) };
        let memory_type = find_memory_type(
            &ctx.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let alloc_info = vk::MemoryAllocateInfo {
            allocation_size: requirements.size,
            memory_type_index: memory_type,
            ..Default::default()
        };
        let memory = unsafe { ctx.device.allocate_memory(&alloc_info, None)? };
        unsafe { ctx.device.bind_image_memory(image, memory, 0)? };

        let view_info = vk::ImageViewCreateInfo {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: color_subresource_range(),
            ..Default::default()
        };
        let view = unsafe { ctx.device.create_image_view(&view_info, None)? };

        Ok(Self {
            image,
            memory,
            view,
            format,
            extent: vk::Extent2D { width, height },
        })
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
        self.image = vk::Image::null();
        self.view = vk::ImageView::null();
        self.memory = vk::DeviceMemory::null();
    }
}

pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Insert a full-image layout transition barrier.
pub fn insert_image_barrier(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier {
        src_access_mask: src_access,
        dst_access_mask: dst_access,
        old_layout,
        new_layout,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: color_subresource_range(),
        ..Default::default()
    };
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// A shader-sampled RGBA8 texture for the bindless texture array.
pub struct Texture {
    pub image: GpuImage,
    pub sampler: vk::Sampler,
}

impl Texture {
    pub fn from_rgba8(ctx: &RtContext, width: u32, height: u32, pixels: &[u8]) -> Result<Self> {
        debug_assert_eq!(pixels.len(), (width * height * 4) as usize);
        let image = GpuImage::new(
            ctx,
            width,
            height,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        let mut staging =
            GpuBuffer::host_visible_with_data(ctx, vk::BufferUsageFlags::TRANSFER_SRC, pixels)?;

        ctx.single_time_commands(|cmd| {
            insert_image_barrier(
                &ctx.device,
                cmd,
                image.image,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
            };
            unsafe {
                ctx.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            insert_image_barrier(
                &ctx.device,
                cmd,
                image.image,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
            Ok(())
        })?;
        staging.destroy(&ctx.device);

        let sampler_info = vk::SamplerCreateInfo {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            ..Default::default()
        };
        let sampler = unsafe { ctx.device.create_sampler(&sampler_info, None)? };

        Ok(Self { image, sampler })
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe { device.destroy_sampler(self.sampler, None) };
        self.sampler = vk::Sampler::null();
        self.image.destroy(device);
    }
}
