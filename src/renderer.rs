use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use glam::Mat4;
use log::info;
use rand::Rng;

use crate::accel::{
    acceleration_barrier, instance_records, BottomLevelStructures, TopLevelStructures,
};
use crate::context::RtContext;
use crate::error::Result;
use crate::geometry::GeometryRegistry;
use crate::pipeline::{
    HitGroupKind, PipelineBindings, RayTracingPipeline, MISS_GROUP_INDEX,
    MISS_SHADOW_GROUP_INDEX, RAYGEN_GROUP_INDEX,
};
use crate::resources::{insert_image_barrier, GpuImage};
use crate::sbt::{SbtEntry, ShaderBindingTable};
use crate::scene::{Scene, SceneResources};
use crate::uniforms::{FrameUniforms, UniformBuffer};

#[derive(Debug, Clone, Copy)]
pub struct RendererDesc {
    pub width: u32,
    pub height: u32,
    pub view: Mat4,
    pub fov_degrees: f32,
    pub near: f32,
    pub far: f32,
    pub samples_per_pixel: u32,
    pub max_bounces: u32,
}

impl Default for RendererDesc {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            view: Mat4::IDENTITY,
            fov_degrees: 45.0,
            near: 0.01,
            far: 1000.0,
            samples_per_pixel: 1,
            max_bounces: 8,
        }
    }
}

/// Orchestrates the whole subsystem: acceleration structures, the
/// accumulation/output images, the pipeline and its shader binding table,
/// plus the per-frame uniform state.
///
/// Invalidation rules:
/// - `render` accumulates samples into the persistent accumulation image.
/// - `update_camera_matrix` rebuilds the TLAS from the current object list
///   (conservative: any camera update is treated as a possible scene
///   change) and resets accumulation.
/// - `resize` recreates the render targets and pipeline at the new extent
///   and resets accumulation, since recreation discards the history.
pub struct RayTracingRenderer {
    ctx: Arc<RtContext>,
    extent: vk::Extent2D,
    fov_degrees: f32,
    near: f32,
    far: f32,
    resources: SceneResources,
    blas: BottomLevelStructures,
    blas_addresses: Vec<vk::DeviceAddress>,
    tlas: TopLevelStructures,
    accumulation: GpuImage,
    output: GpuImage,
    uniforms: UniformBuffer,
    pipeline: RayTracingPipeline,
    sbt: ShaderBindingTable,
}

impl RayTracingRenderer {
    pub fn new(
        ctx: Arc<RtContext>,
        registry: &GeometryRegistry,
        scene: &Scene,
        desc: RendererDesc,
    ) -> Result<Self> {
        let start = Instant::now();
        let resources = SceneResources::build(&ctx, registry, scene)?;

        let (blas, mut tlas) = ctx.single_time_commands(|cmd| {
            let blas = BottomLevelStructures::build(
                &ctx,
                cmd,
                registry,
                resources.vertex_buffer.address,
                resources.index_buffer.address,
            )?;
            // Bottom level builds complete before the top level consumes
            // their addresses.
            acceleration_barrier(&ctx.device, cmd);
            let instances = instance_records(&scene.objects, &blas.addresses());
            let tlas = TopLevelStructures::build(&ctx, cmd, &instances)?;
            Ok((blas, tlas))
        })?;
        tlas.release_staging(&ctx.device);
        let blas_addresses = blas.addresses();

        let extent = vk::Extent2D {
            width: desc.width,
            height: desc.height,
        };
        let (accumulation, output) = create_render_targets(&ctx, extent)?;

        let mut data = FrameUniforms::new(
            desc.samples_per_pixel,
            desc.max_bounces,
            resources.light_count,
        );
        data.set_view(desc.view);
        data.set_projection(
            desc.fov_degrees,
            desc.width as f32 / desc.height as f32,
            desc.near,
            desc.far,
        );
        data.seed = draw_seed();
        let uniforms = UniformBuffer::new(&ctx, data)?;

        let (pipeline, sbt) = build_pipeline(
            &ctx,
            tlas.structure.handle,
            &accumulation,
            &output,
            &uniforms,
            &resources,
        )?;

        info!(
            "Ray tracing renderer ready in {:.1}ms ({} BLAS, {} instances, {}x{})",
            start.elapsed().as_secs_f64() * 1000.0,
            blas.structures.len(),
            tlas.instance_count,
            desc.width,
            desc.height,
        );

        Ok(Self {
            ctx,
            extent,
            fov_degrees: desc.fov_degrees,
            near: desc.near,
            far: desc.far,
            resources,
            blas,
            blas_addresses,
            tlas,
            accumulation,
            output,
            uniforms,
            pipeline,
            sbt,
        })
    }

    /// Record one progressive sample pass. The caller owns command buffer
    /// begin/end and submission.
    pub fn render(&mut self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.uniforms.data.advance_frame(draw_seed());
        self.uniforms.flush(&self.ctx.device)?;

        for image in [&self.accumulation, &self.output] {
            insert_image_barrier(
                &self.ctx.device,
                command_buffer,
                image.image,
                vk::AccessFlags::empty(),
                vk::AccessFlags::SHADER_WRITE,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
            );
        }

        unsafe {
            self.ctx.device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline.pipeline,
            );
            self.ctx.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline.pipeline_layout,
                0,
                &[self.pipeline.descriptor_set],
                &[],
            );
            let regions = self.sbt.regions();
            self.ctx.rt_pipeline.cmd_trace_rays(
                command_buffer,
                &regions[0],
                &regions[1],
                &regions[2],
                &regions[3],
                self.extent.width,
                self.extent.height,
                1,
            );
        }

        // Hand the display image to the downstream compositor blit.
        insert_image_barrier(
            &self.ctx.device,
            command_buffer,
            self.output.image,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        Ok(())
    }

    /// Rebuild the TLAS from the current object list, then reset the
    /// accumulator and update the view matrices. The reset happens on
    /// every call, even when the matrix did not change.
    pub fn update_camera_matrix(&mut self, scene: &Scene, view: Mat4) -> Result<()> {
        // A previous frame may still be tracing against the structures we
        // are about to destroy.
        self.ctx.wait_idle()?;

        self.pipeline.destroy(&self.ctx.device);
        self.sbt.destroy(&self.ctx.device);
        self.accumulation.destroy(&self.ctx.device);
        self.tlas.destroy(&self.ctx);

        let instances = instance_records(&scene.objects, &self.blas_addresses);
        let mut tlas = self
            .ctx
            .single_time_commands(|cmd| TopLevelStructures::build(&self.ctx, cmd, &instances))?;
        tlas.release_staging(&self.ctx.device);
        self.tlas = tlas;

        self.accumulation = create_accumulation_image(&self.ctx, self.extent)?;
        let (pipeline, sbt) = build_pipeline(
            &self.ctx,
            self.tlas.structure.handle,
            &self.accumulation,
            &self.output,
            &self.uniforms,
            &self.resources,
        )?;
        self.pipeline = pipeline;
        self.sbt = sbt;

        self.uniforms.data.set_view(view);
        self.uniforms.data.reset_accumulation(draw_seed());
        self.uniforms.flush(&self.ctx.device)
    }

    /// Recreate the render targets and pipeline at a new resolution.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.ctx.wait_idle()?;

        self.pipeline.destroy(&self.ctx.device);
        self.sbt.destroy(&self.ctx.device);
        self.accumulation.destroy(&self.ctx.device);
        self.output.destroy(&self.ctx.device);

        self.extent = vk::Extent2D { width, height };
        let (accumulation, output) = create_render_targets(&self.ctx, self.extent)?;
        self.accumulation = accumulation;
        self.output = output;

        let (pipeline, sbt) = build_pipeline(
            &self.ctx,
            self.tlas.structure.handle,
            &self.accumulation,
            &self.output,
            &self.uniforms,
            &self.resources,
        )?;
        self.pipeline = pipeline;
        self.sbt = sbt;

        self.uniforms.data.set_projection(
            self.fov_degrees,
            width as f32 / height as f32,
            self.near,
            self.far,
        );
        // The recreated accumulation image holds no history.
        self.uniforms.data.reset_accumulation(draw_seed());
        self.uniforms.flush(&self.ctx.device)?;

        info!("Resized ray tracing target to {width}x{height}");
        Ok(())
    }

    pub fn output_image(&self) -> vk::Image {
        self.output.image
    }

    pub fn output_view(&self) -> vk::ImageView {
        self.output.view
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn accumulated_samples(&self) -> u32 {
        self.uniforms.data.accumulated_samples
    }

    pub fn instance_count(&self) -> u32 {
        self.tlas.instance_count
    }
}

impl Drop for RayTracingRenderer {
    fn drop(&mut self) {
        let _ = self.ctx.wait_idle();
        self.pipeline.destroy(&self.ctx.device);
        self.sbt.destroy(&self.ctx.device);
        self.accumulation.destroy(&self.ctx.device);
        self.output.destroy(&self.ctx.device);
        self.uniforms.destroy(&self.ctx.device);
        self.tlas.destroy(&self.ctx);
        self.blas.destroy(&self.ctx);
        self.resources.destroy(&self.ctx.device);
    }
}

fn draw_seed() -> u32 {
    rand::thread_rng().gen()
}

fn create_accumulation_image(ctx: &RtContext, extent: vk::Extent2D) -> Result<GpuImage> {
    GpuImage::new(
        ctx,
        extent.width,
        extent.height,
        vk::Format::R32G32B32A32_SFLOAT,
        vk::ImageUsageFlags::STORAGE,
    )
}

fn create_render_targets(ctx: &RtContext, extent: vk::Extent2D) -> Result<(GpuImage, GpuImage)> {
    let accumulation = create_accumulation_image(ctx, extent)?;
    let output = GpuImage::new(
        ctx,
        extent.width,
        extent.height,
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
    )?;
    Ok((accumulation, output))
}

fn build_pipeline(
    ctx: &RtContext,
    tlas: vk::AccelerationStructureKHR,
    accumulation: &GpuImage,
    output: &GpuImage,
    uniforms: &UniformBuffer,
    resources: &SceneResources,
) -> Result<(RayTracingPipeline, ShaderBindingTable)> {
    let pipeline = RayTracingPipeline::build(
        ctx,
        &PipelineBindings {
            tlas,
            accumulation_view: accumulation.view,
            output_view: output.view,
            uniform_buffer: uniforms.handle(),
            resources,
        },
    )?;

    let raygen = [SbtEntry::plain(RAYGEN_GROUP_INDEX)];
    let miss = [
        SbtEntry::plain(MISS_GROUP_INDEX),
        SbtEntry::plain(MISS_SHADOW_GROUP_INDEX),
    ];
    let hit: Vec<SbtEntry> = HitGroupKind::ALL
        .iter()
        .map(|kind| SbtEntry::plain(kind.shader_group_index()))
        .collect();
    let sbt = ShaderBindingTable::new(ctx, pipeline.pipeline, &raygen, &miss, &hit)?;

    Ok((pipeline, sbt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::instance_records;
    use crate::geometry::{self, GeometryRegistry};
    use crate::scene::Material;
    use glam::Vec3;

    // The device-free half of the end-to-end scenario: one mesh, two
    // objects, three frames, then a camera update.
    #[test]
    fn progressive_state_over_a_two_object_scene() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut registry = GeometryRegistry::new();
        let triangle = registry.register(geometry::create_triangle());
        assert_eq!(registry.len(), 1);

        let mut scene = Scene::new();
        let material = scene.add_material(Material::new([0.8, 0.8, 0.8, 1.0]));
        scene.add_object(triangle, material, Mat4::IDENTITY);
        scene.add_object(
            triangle,
            material,
            Mat4::from_translation(Vec3::new(1.5, 0.0, 0.0)),
        );

        // One BLAS per mesh feeds two instances.
        let blas_addresses = vec![0x4000u64];
        let instances = instance_records(&scene.objects, &blas_addresses);
        assert_eq!(instances.len(), 2);

        let samples_per_pixel = 4;
        let mut uniforms = FrameUniforms::new(samples_per_pixel, 8, 0);
        for _ in 0..3 {
            uniforms.advance_frame(draw_seed());
        }
        assert_eq!(uniforms.accumulated_samples, 3 * samples_per_pixel);

        // Camera update: accumulation resets, the rebuilt instance list is
        // unchanged.
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 4.0), Vec3::ZERO, Vec3::Y);
        uniforms.set_view(view);
        uniforms.reset_accumulation(draw_seed());
        assert_eq!(uniforms.accumulated_samples, 0);
        assert_eq!(instance_records(&scene.objects, &blas_addresses).len(), 2);
    }

    #[test]
    fn resize_recomputes_projection_for_the_new_aspect() {
        let mut uniforms = FrameUniforms::new(1, 8, 0);
        uniforms.set_projection(45.0, 800.0 / 600.0, 0.01, 1000.0);
        let before = uniforms.proj;

        uniforms.set_projection(45.0, 1920.0 / 1080.0, 0.01, 1000.0);
        assert_ne!(before, uniforms.proj);
        uniforms.reset_accumulation(0);
        assert_eq!(uniforms.accumulated_samples, 0);
    }
}
