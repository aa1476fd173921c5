use ash::vk;
use glam::Mat4;

use crate::context::RtContext;
use crate::error::Result;
use crate::resources::GpuBuffer;

/// Per-frame GPU state (std140-compatible). This struct carries the
/// progressive-rendering contract: `accumulated_samples` grows while the
/// camera and scene are static and drops back to zero on any change.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameUniforms {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_inverse: Mat4,
    pub proj_inverse: Mat4,
    pub samples_per_pixel: u32,
    pub accumulated_samples: u32,
    pub max_bounces: u32,
    pub light_count: u32,
    pub seed: u32,
    pub _pad: [u32; 3],
}

impl FrameUniforms {
    pub fn new(samples_per_pixel: u32, max_bounces: u32, light_count: u32) -> Self {
        Self {
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            view_inverse: Mat4::IDENTITY,
            proj_inverse: Mat4::IDENTITY,
            samples_per_pixel,
            accumulated_samples: 0,
            max_bounces,
            light_count,
            seed: 0,
            _pad: [0; 3],
        }
    }

    pub fn set_view(&mut self, view: Mat4) {
        self.view = view;
        self.view_inverse = view.inverse();
    }

    /// Vulkan-style perspective projection (Y flipped).
    pub fn set_projection(&mut self, fov_degrees: f32, aspect: f32, near: f32, far: f32) {
        let mut proj = Mat4::perspective_rh(fov_degrees.to_radians(), aspect, near, far);
        proj.y_axis.y *= -1.0;
        self.proj = proj;
        self.proj_inverse = proj.inverse();
    }

    /// Account for the samples the next trace dispatch will add.
    pub fn advance_frame(&mut self, seed: u32) {
        self.accumulated_samples += self.samples_per_pixel;
        self.seed = seed;
    }

    /// Unconditional: callers invoke this on every camera update, even one
    /// that did not actually move the camera. Skipping the reset when the
    /// matrix compares equal would ghost the image on sub-epsilon motion.
    pub fn reset_accumulation(&mut self, seed: u32) {
        self.accumulated_samples = 0;
        self.seed = seed;
    }
}

/// Host-visible uniform buffer; `flush` pushes the CPU copy to the GPU.
pub struct UniformBuffer {
    buffer: GpuBuffer,
    pub data: FrameUniforms,
}

impl UniformBuffer {
    pub fn new(ctx: &RtContext, data: FrameUniforms) -> Result<Self> {
        let buffer = GpuBuffer::host_visible_with_data(
            ctx,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            bytemuck::bytes_of(&data),
        )?;
        Ok(Self { buffer, data })
    }

    pub fn flush(&self, device: &ash::Device) -> Result<()> {
        self.buffer.write_bytes(device, 0, bytemuck::bytes_of(&self.data))
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.buffer.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn samples_grow_monotonically_while_static() {
        let mut uniforms = FrameUniforms::new(4, 8, 0);
        for frame in 1..=10u32 {
            uniforms.advance_frame(frame);
            assert_eq!(uniforms.accumulated_samples, frame * 4);
        }
    }

    #[test]
    fn camera_reset_is_unconditional() {
        let mut uniforms = FrameUniforms::new(2, 8, 0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 1.0, 3.0), Vec3::ZERO, Vec3::Y);

        uniforms.advance_frame(1);
        uniforms.advance_frame(2);
        uniforms.set_view(view);
        uniforms.reset_accumulation(3);
        assert_eq!(uniforms.accumulated_samples, 0);

        // A second update with the identical view must reset again.
        uniforms.advance_frame(4);
        uniforms.set_view(view);
        uniforms.reset_accumulation(5);
        assert_eq!(uniforms.accumulated_samples, 0);
    }

    #[test]
    fn view_inverse_tracks_view() {
        let mut uniforms = FrameUniforms::new(1, 8, 0);
        let view = Mat4::look_at_rh(Vec3::new(2.0, 0.5, 2.0), Vec3::ZERO, Vec3::Y);
        uniforms.set_view(view);
        let roundtrip = uniforms.view * uniforms.view_inverse;
        assert!(roundtrip.abs_diff_eq(Mat4::IDENTITY, 1e-5));
    }

    #[test]
    fn projection_is_y_flipped() {
        let mut uniforms = FrameUniforms::new(1, 8, 0);
        uniforms.set_projection(45.0, 16.0 / 9.0, 0.01, 1000.0);
        assert!(uniforms.proj.y_axis.y < 0.0);
        let roundtrip = uniforms.proj * uniforms.proj_inverse;
        assert!(roundtrip.abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }

    #[test]
    fn uniform_block_matches_std140_layout() {
        // Four mat4s then five scalars, padded to a 16-byte boundary.
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 4 * 64 + 32);
    }
}
