use ash::vk;
use log::info;

use crate::error::{Result, RtError};

/// Driver limits consumed by the shader binding table layout and the
/// acceleration structure packing. Queried once at context creation.
#[derive(Debug, Clone, Copy)]
pub struct RtDeviceProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub min_scratch_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// Handles borrowed from the surrounding application. The application keeps
/// ownership of the instance/device; the context clones the dispatch tables
/// it needs.
pub struct RtContextCreateInfo<'a> {
    pub instance: &'a ash::Instance,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
}

/// Everything the ray tracing subsystem needs from the GPU device.
///
/// Builders borrow the context and return owned structures; nothing owns
/// the context back.
pub struct RtContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub command_pool: vk::CommandPool,
    pub accel: ash::khr::acceleration_structure::Device,
    pub rt_pipeline: ash::khr::ray_tracing_pipeline::Device,
    pub deferred: ash::khr::deferred_host_operations::Device,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub properties: RtDeviceProperties,
}

impl RtContext {
    pub fn new(info: RtContextCreateInfo) -> Result<Self> {
        let RtContextCreateInfo {
            instance,
            device,
            physical_device,
            queue,
            queue_family_index,
        } = info;

        let accel = ash::khr::acceleration_structure::Device::new(instance, &device);
        let rt_pipeline = ash::khr::ray_tracing_pipeline::Device::new(instance, &device);
        let deferred = ash::khr::deferred_host_operations::Device::new(instance, &device);

        let mut pipeline_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut pipeline_props)
            .push_next(&mut accel_props);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };

        let properties = RtDeviceProperties {
            shader_group_handle_size: pipeline_props.shader_group_handle_size,
            shader_group_handle_alignment: pipeline_props.shader_group_handle_alignment,
            shader_group_base_alignment: pipeline_props.shader_group_base_alignment,
            min_scratch_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
            max_ray_recursion_depth: pipeline_props.max_ray_recursion_depth,
        };
        info!(
            "Ray tracing device ready (handle size {}, base alignment {}, max recursion {})",
            properties.shader_group_handle_size,
            properties.shader_group_base_alignment,
            properties.max_ray_recursion_depth,
        );

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let pool_info = vk::CommandPoolCreateInfo {
            queue_family_index,
            flags: vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        let command_pool = unsafe { device.create_command_pool(&pool_info, None)? };

        Ok(Self {
            device,
            physical_device,
            queue,
            queue_family_index,
            command_pool,
            accel,
            rt_pipeline,
            deferred,
            memory_properties,
            properties,
        })
    }

    /// Record `record` into a one-shot command buffer, submit it and wait
    /// for the queue to drain. Acceleration structure builds and resource
    /// uploads go through here.
    pub fn single_time_commands<T, F>(&self, record: F) -> Result<T>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<T>,
    {
        let alloc_info = vk::CommandBufferAllocateInfo {
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info)?[0] };

        let begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info)? };

        let recorded = record(command_buffer);

        unsafe {
            self.device.end_command_buffer(command_buffer)?;
            if recorded.is_ok() {
                let submit_info = vk::SubmitInfo {
                    command_buffer_count: 1,
                    p_command_buffers: &command_buffer,
                    ..Default::default()
                };
                self.device
                    .queue_submit(self.queue, &[submit_info], vk::Fence::null())?;
                self.device.queue_wait_idle(self.queue)?;
            }
            self.device
                .free_command_buffers(self.command_pool, &[command_buffer]);
        }
        recorded
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(RtError::from)
    }
}

impl Drop for RtContext {
    fn drop(&mut self) {
        unsafe { self.device.destroy_command_pool(self.command_pool, None) };
    }
}
