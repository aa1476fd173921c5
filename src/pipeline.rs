use std::ffi::CStr;

use ash::vk;
use log::{debug, error, info, warn};

use crate::context::RtContext;
use crate::error::{Result, RtError};
use crate::scene::SceneResources;
use crate::shaders;

pub const RAYGEN_GROUP_INDEX: u32 = 0;
pub const MISS_GROUP_INDEX: u32 = 1;
pub const MISS_SHADOW_GROUP_INDEX: u32 = 2;
pub const HIT_GROUP_BASE_INDEX: u32 = 3;

/// Upper bound on workers joining one deferred compile; more threads than
/// this oversubscribe the driver's internal partitioning.
pub const MAX_COMPILE_THREADS: u32 = 8;

const SHADER_ENTRY: &CStr = c"main";

/// Which shader pair processes a hit. Instances carry the kind's SBT
/// offset; the pipeline maps each kind to a fixed shader group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitGroupKind {
    Diffuse,
}

impl HitGroupKind {
    pub const ALL: [HitGroupKind; 1] = [HitGroupKind::Diffuse];

    /// Offset into the hit-group region of the shader binding table.
    pub fn sbt_offset(self) -> u32 {
        self as u32
    }

    pub fn shader_group_index(self) -> u32 {
        HIT_GROUP_BASE_INDEX + self as u32
    }
}

/// Outcome of one `vkDeferredOperationJoinKHR` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredJoinState {
    /// The overall operation is complete.
    Success,
    /// No more work is available for this thread; the operation may still
    /// be running on others.
    ThreadDone,
    /// This thread finished a work unit but the operation is not complete;
    /// join again.
    ThreadIdle,
}

pub fn classify_join_result(result: vk::Result) -> Result<DeferredJoinState> {
    match result {
        vk::Result::SUCCESS => Ok(DeferredJoinState::Success),
        vk::Result::THREAD_DONE_KHR => Ok(DeferredJoinState::ThreadDone),
        vk::Result::THREAD_IDLE_KHR => Ok(DeferredJoinState::ThreadIdle),
        err => {
            warn!("Unexpected result {err:?} while joining deferred compile");
            Err(RtError::Vulkan(err))
        }
    }
}

/// Everything the fixed descriptor layout binds.
pub struct PipelineBindings<'a> {
    pub tlas: vk::AccelerationStructureKHR,
    pub accumulation_view: vk::ImageView,
    pub output_view: vk::ImageView,
    pub uniform_buffer: vk::Buffer,
    pub resources: &'a SceneResources,
}

pub struct RayTracingPipeline {
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
}

impl RayTracingPipeline {
    pub fn build(ctx: &RtContext, bindings: &PipelineBindings) -> Result<Self> {
        let texture_count = bindings.resources.textures.len() as u32;

        let (descriptor_set_layout, descriptor_pool, descriptor_set) =
            create_descriptors(ctx, bindings, texture_count)?;

        let layout_info = vk::PipelineLayoutCreateInfo {
            set_layout_count: 1,
            p_set_layouts: &descriptor_set_layout,
            ..Default::default()
        };
        let pipeline_layout = unsafe { ctx.device.create_pipeline_layout(&layout_info, None)? };

        let shader_set = shaders::compile_embedded()?;
        let modules = [
            create_shader_module(ctx, &shader_set.raygen)?,
            create_shader_module(ctx, &shader_set.miss)?,
            create_shader_module(ctx, &shader_set.miss_shadow)?,
            create_shader_module(ctx, &shader_set.closest_hit_diffuse)?,
        ];

        let stage = |index: usize, stage: vk::ShaderStageFlags| vk::PipelineShaderStageCreateInfo {
            stage,
            module: modules[index],
            p_name: SHADER_ENTRY.as_ptr(),
            ..Default::default()
        };
        let stages = [
            stage(0, vk::ShaderStageFlags::RAYGEN_KHR),
            stage(1, vk::ShaderStageFlags::MISS_KHR),
            stage(2, vk::ShaderStageFlags::MISS_KHR),
            stage(3, vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        ];

        let general = |shader: u32| vk::RayTracingShaderGroupCreateInfoKHR {
            ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
            general_shader: shader,
            closest_hit_shader: vk::SHADER_UNUSED_KHR,
            any_hit_shader: vk::SHADER_UNUSED_KHR,
            intersection_shader: vk::SHADER_UNUSED_KHR,
            ..Default::default()
        };
        let mut groups = vec![
            general(RAYGEN_GROUP_INDEX),
            general(MISS_GROUP_INDEX),
            general(MISS_SHADOW_GROUP_INDEX),
        ];
        for kind in HitGroupKind::ALL {
            groups.push(vk::RayTracingShaderGroupCreateInfoKHR {
                ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                general_shader: vk::SHADER_UNUSED_KHR,
                // One closest-hit stage per kind, appended after the
                // three general stages.
                closest_hit_shader: 3 + kind as u32,
                any_hit_shader: vk::SHADER_UNUSED_KHR,
                intersection_shader: vk::SHADER_UNUSED_KHR,
                ..Default::default()
            });
        }

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR {
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            group_count: groups.len() as u32,
            p_groups: groups.as_ptr(),
            max_pipeline_ray_recursion_depth: ctx.properties.max_ray_recursion_depth.min(2),
            layout: pipeline_layout,
            ..Default::default()
        };

        let pipeline = compile_deferred(ctx, &pipeline_info);

        // Modules must outlive a deferred compile; drop them only now.
        for module in modules {
            unsafe { ctx.device.destroy_shader_module(module, None) };
        }
        let pipeline = match pipeline {
            Ok(pipeline) => pipeline,
            Err(err) => {
                unsafe {
                    ctx.device.destroy_pipeline_layout(pipeline_layout, None);
                    ctx.device.destroy_descriptor_pool(descriptor_pool, None);
                    ctx.device
                        .destroy_descriptor_set_layout(descriptor_set_layout, None);
                }
                return Err(err);
            }
        };

        Ok(Self {
            pipeline,
            pipeline_layout,
            descriptor_set,
            descriptor_set_layout,
            descriptor_pool,
        })
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
        self.pipeline = vk::Pipeline::null();
        self.pipeline_layout = vk::PipelineLayout::null();
        self.descriptor_pool = vk::DescriptorPool::null();
        self.descriptor_set_layout = vk::DescriptorSetLayout::null();
    }
}

fn create_shader_module(ctx: &RtContext, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo {
        code_size: code.len() * std::mem::size_of::<u32>(),
        p_code: code.as_ptr(),
        ..Default::default()
    };
    let module = unsafe { ctx.device.create_shader_module(&create_info, None)? };
    Ok(module)
}

fn create_descriptors(
    ctx: &RtContext,
    bindings: &PipelineBindings,
    texture_count: u32,
) -> Result<(vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet)> {
    let binding = |binding: u32,
                   descriptor_type: vk::DescriptorType,
                   count: u32,
                   stages: vk::ShaderStageFlags| vk::DescriptorSetLayoutBinding {
        binding,
        descriptor_type,
        descriptor_count: count,
        stage_flags: stages,
        ..Default::default()
    };
    let layout_bindings = [
        // Top level acceleration structure
        binding(
            0,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            vk::ShaderStageFlags::RAYGEN_KHR,
        ),
        // Accumulation & output images
        binding(
            1,
            vk::DescriptorType::STORAGE_IMAGE,
            1,
            vk::ShaderStageFlags::RAYGEN_KHR,
        ),
        binding(
            2,
            vk::DescriptorType::STORAGE_IMAGE,
            1,
            vk::ShaderStageFlags::RAYGEN_KHR,
        ),
        // Camera / accumulation state
        binding(
            3,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::MISS_KHR,
        ),
        // Vertex, index, material, object info buffers
        binding(
            4,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ),
        binding(
            5,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ),
        binding(
            6,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ),
        binding(
            7,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ),
        // Light buffer
        binding(
            8,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            vk::ShaderStageFlags::RAYGEN_KHR,
        ),
        // Texture array
        binding(
            9,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            texture_count,
            vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ),
    ];
    let layout_info = vk::DescriptorSetLayoutCreateInfo {
        binding_count: layout_bindings.len() as u32,
        p_bindings: layout_bindings.as_ptr(),
        ..Default::default()
    };
    let layout = unsafe { ctx.device.create_descriptor_set_layout(&layout_info, None)? };

    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 2,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 5,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: texture_count,
        },
    ];
    let pool_info = vk::DescriptorPoolCreateInfo {
        max_sets: 1,
        pool_size_count: pool_sizes.len() as u32,
        p_pool_sizes: pool_sizes.as_ptr(),
        ..Default::default()
    };
    let pool = unsafe { ctx.device.create_descriptor_pool(&pool_info, None)? };

    let alloc_info = vk::DescriptorSetAllocateInfo {
        descriptor_pool: pool,
        descriptor_set_count: 1,
        p_set_layouts: &layout,
        ..Default::default()
    };
    let set = unsafe { ctx.device.allocate_descriptor_sets(&alloc_info)?[0] };

    let resources = bindings.resources;

    let tlas_handles = [bindings.tlas];
    let mut tlas_info = vk::WriteDescriptorSetAccelerationStructureKHR {
        acceleration_structure_count: 1,
        p_acceleration_structures: tlas_handles.as_ptr(),
        ..Default::default()
    };
    let accumulation_info = vk::DescriptorImageInfo {
        image_view: bindings.accumulation_view,
        image_layout: vk::ImageLayout::GENERAL,
        ..Default::default()
    };
    let output_info = vk::DescriptorImageInfo {
        image_view: bindings.output_view,
        image_layout: vk::ImageLayout::GENERAL,
        ..Default::default()
    };
    let buffer_info = |buffer: vk::Buffer| vk::DescriptorBufferInfo {
        buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    };
    let uniform_info = buffer_info(bindings.uniform_buffer);
    let vertex_info = buffer_info(resources.vertex_buffer.buffer);
    let index_info = buffer_info(resources.index_buffer.buffer);
    let material_info = buffer_info(resources.material_buffer.buffer);
    let object_info = buffer_info(resources.object_info_buffer.buffer);
    let light_info = buffer_info(resources.light_buffer.buffer);
    let texture_infos: Vec<vk::DescriptorImageInfo> = resources
        .textures
        .iter()
        .map(|texture| vk::DescriptorImageInfo {
            sampler: texture.sampler,
            image_view: texture.image.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        })
        .collect();

    let write = |binding: u32, descriptor_type: vk::DescriptorType| vk::WriteDescriptorSet {
        dst_set: set,
        dst_binding: binding,
        descriptor_count: 1,
        descriptor_type,
        ..Default::default()
    };
    let writes = [
        vk::WriteDescriptorSet {
            p_next: (&mut tlas_info as *mut vk::WriteDescriptorSetAccelerationStructureKHR).cast(),
            ..write(0, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
        },
        vk::WriteDescriptorSet {
            p_image_info: &accumulation_info,
            ..write(1, vk::DescriptorType::STORAGE_IMAGE)
        },
        vk::WriteDescriptorSet {
            p_image_info: &output_info,
            ..write(2, vk::DescriptorType::STORAGE_IMAGE)
        },
        vk::WriteDescriptorSet {
            p_buffer_info: &uniform_info,
            ..write(3, vk::DescriptorType::UNIFORM_BUFFER)
        },
        vk::WriteDescriptorSet {
            p_buffer_info: &vertex_info,
            ..write(4, vk::DescriptorType::STORAGE_BUFFER)
        },
        vk::WriteDescriptorSet {
            p_buffer_info: &index_info,
            ..write(5, vk::DescriptorType::STORAGE_BUFFER)
        },
        vk::WriteDescriptorSet {
            p_buffer_info: &material_info,
            ..write(6, vk::DescriptorType::STORAGE_BUFFER)
        },
        vk::WriteDescriptorSet {
            p_buffer_info: &object_info,
            ..write(7, vk::DescriptorType::STORAGE_BUFFER)
        },
        vk::WriteDescriptorSet {
            p_buffer_info: &light_info,
            ..write(8, vk::DescriptorType::STORAGE_BUFFER)
        },
        vk::WriteDescriptorSet {
            descriptor_count: texture_count,
            p_image_info: texture_infos.as_ptr(),
            ..write(9, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        },
    ];

    unsafe { ctx.device.update_descriptor_sets(&writes, &[]) };

    Ok((layout, pool, set))
}

/// Compile the pipeline as a deferred host operation, advancing it from a
/// pool of worker threads. Falls back to a plain blocking call when the
/// driver refuses the deferred path.
fn compile_deferred(
    ctx: &RtContext,
    pipeline_info: &vk::RayTracingPipelineCreateInfoKHR,
) -> Result<vk::Pipeline> {
    let operation = match unsafe { ctx.deferred.create_deferred_operation(None) } {
        Ok(operation) => operation,
        Err(err) => {
            warn!("Deferred host operations unavailable ({err:?}); compiling synchronously");
            return compile_blocking(ctx, pipeline_info);
        }
    };

    let start = std::time::Instant::now();
    let created = unsafe {
        ctx.rt_pipeline.create_ray_tracing_pipelines(
            operation,
            vk::PipelineCache::null(),
            std::slice::from_ref(pipeline_info),
            None,
        )
    };
    let pipeline = match created {
        // Some drivers finish the compile inside the create call.
        Ok(pipelines) => {
            unsafe { ctx.deferred.destroy_deferred_operation(operation, None) };
            debug!("Pipeline compiled synchronously despite deferred request");
            return Ok(pipelines[0]);
        }
        Err((pipelines, vk::Result::OPERATION_DEFERRED_KHR)) => pipelines[0],
        Err((_, err)) => {
            unsafe { ctx.deferred.destroy_deferred_operation(operation, None) };
            error!("Failed to create ray tracing pipeline as deferred operation: {err:?}");
            return Err(err.into());
        }
    };

    let concurrency = unsafe {
        ctx.deferred
            .get_deferred_operation_max_concurrency(operation)
    }
    .clamp(1, MAX_COMPILE_THREADS);
    debug!("Compiling ray tracing pipeline on {concurrency} threads");

    let mut worker_result: Result<()> = Ok(());
    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..concurrency)
            .map(|_| {
                scope.spawn(|| -> Result<()> {
                    loop {
                        let raw = unsafe {
                            (ctx.deferred.fp().deferred_operation_join_khr)(
                                ctx.deferred.device(),
                                operation,
                            )
                        };
                        match classify_join_result(raw)? {
                            DeferredJoinState::Success | DeferredJoinState::ThreadDone => {
                                return Ok(())
                            }
                            // Not finished overall; offer to help again.
                            DeferredJoinState::ThreadIdle => std::thread::yield_now(),
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => worker_result = Err(err),
                Err(_) => {
                    worker_result =
                        Err(RtError::PipelineDeferred("compile worker panicked".into()))
                }
            }
        }
    });

    let final_result = unsafe {
        (ctx.deferred.fp().get_deferred_operation_result_khr)(ctx.deferred.device(), operation)
    };
    unsafe { ctx.deferred.destroy_deferred_operation(operation, None) };

    worker_result?;
    if final_result != vk::Result::SUCCESS {
        error!("Deferred pipeline compilation finished with {final_result:?}");
        unsafe { ctx.device.destroy_pipeline(pipeline, None) };
        return Err(RtError::Vulkan(final_result));
    }

    info!(
        "Ray tracing pipeline compiled on {} threads in {:.1}ms",
        concurrency,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(pipeline)
}

fn compile_blocking(
    ctx: &RtContext,
    pipeline_info: &vk::RayTracingPipelineCreateInfoKHR,
) -> Result<vk::Pipeline> {
    let pipelines = unsafe {
        ctx.rt_pipeline.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            std::slice::from_ref(pipeline_info),
            None,
        )
    }
    .map_err(|(_, err)| {
        error!("Failed to create ray tracing pipeline: {err:?}");
        RtError::Vulkan(err)
    })?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_group_table_is_fixed() {
        assert_eq!(RAYGEN_GROUP_INDEX, 0);
        assert_eq!(MISS_GROUP_INDEX, 1);
        assert_eq!(MISS_SHADOW_GROUP_INDEX, 2);
        assert_eq!(HitGroupKind::Diffuse.shader_group_index(), 3);
        assert_eq!(HitGroupKind::Diffuse.sbt_offset(), 0);
    }

    #[test]
    fn join_results_map_to_tri_state() {
        assert_eq!(
            classify_join_result(vk::Result::SUCCESS).unwrap(),
            DeferredJoinState::Success
        );
        assert_eq!(
            classify_join_result(vk::Result::THREAD_DONE_KHR).unwrap(),
            DeferredJoinState::ThreadDone
        );
        assert_eq!(
            classify_join_result(vk::Result::THREAD_IDLE_KHR).unwrap(),
            DeferredJoinState::ThreadIdle
        );
        assert!(classify_join_result(vk::Result::ERROR_DEVICE_LOST).is_err());
    }
}
