use ash::vk;
use log::warn;

use crate::context::RtContext;
use crate::error::Result;
use crate::geometry::GeometryRegistry;
use crate::resources::{GpuBuffer, Texture};
use crate::scene::Scene;

/// Raw RGBA8 texture payload handed over by the asset pipeline.
#[derive(Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn white() -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: vec![255, 255, 255, 255],
        }
    }
}

/// Per-instance lookup record for the closest-hit shader, indexed through
/// `gl_InstanceCustomIndexEXT` (16 bytes).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ObjectInfo {
    pub vertex_offset: u32,
    pub index_offset: u32,
    pub material: u32,
    pub _pad: u32,
}

/// Walk the object list and emit one record per object with a resolvable
/// mesh, in iteration order. This is the same predicate the top-level
/// instance builder applies, which keeps `gl_InstanceCustomIndexEXT`
/// aligned with this buffer across rebuilds.
pub fn object_infos(scene: &Scene, registry: &GeometryRegistry) -> Vec<ObjectInfo> {
    let mut infos = Vec::new();
    for (index, object) in scene.objects.iter().enumerate() {
        let Some(mesh) = object.mesh else { continue };
        let Some(record) = registry.meshes().get(mesh as usize) else {
            warn!("Object {index} references unknown mesh {mesh}, skipping");
            continue;
        };
        infos.push(ObjectInfo {
            vertex_offset: record.vertex_offset,
            index_offset: record.index_offset,
            material: object.material,
            _pad: 0,
        });
    }
    infos
}

/// GPU residency for everything the shaders read besides the acceleration
/// structures: shared vertex/index buffers (also the BLAS build inputs),
/// material/object-info/light storage buffers and the texture array.
pub struct SceneResources {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub material_buffer: GpuBuffer,
    pub object_info_buffer: GpuBuffer,
    pub light_buffer: GpuBuffer,
    pub textures: Vec<Texture>,
    pub light_count: u32,
}

impl SceneResources {
    pub fn build(ctx: &RtContext, registry: &GeometryRegistry, scene: &Scene) -> Result<Self> {
        let geometry_usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

        let vertex_buffer = GpuBuffer::host_visible_with_data(
            ctx,
            geometry_usage,
            bytemuck::cast_slice(registry.vertices()),
        )?;
        let index_buffer = GpuBuffer::host_visible_with_data(
            ctx,
            geometry_usage,
            bytemuck::cast_slice(registry.indices()),
        )?;

        let material_buffer = GpuBuffer::host_visible_with_data(
            ctx,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            bytemuck::cast_slice(scene.materials()),
        )?;
        let object_info_buffer = GpuBuffer::host_visible_with_data(
            ctx,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            bytemuck::cast_slice(&object_infos(scene, registry)),
        )?;
        let light_buffer = GpuBuffer::host_visible_with_data(
            ctx,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            bytemuck::cast_slice(scene.lights()),
        )?;

        // The descriptor array needs at least one entry; fall back to a
        // plain white texture when the scene brings none.
        let mut textures = Vec::new();
        if scene.textures().is_empty() {
            let white = TextureData::white();
            textures.push(Texture::from_rgba8(ctx, white.width, white.height, &white.pixels)?);
        } else {
            for data in scene.textures() {
                textures.push(Texture::from_rgba8(ctx, data.width, data.height, &data.pixels)?);
            }
        }

        Ok(Self {
            vertex_buffer,
            index_buffer,
            material_buffer,
            object_info_buffer,
            light_buffer,
            textures,
            light_count: scene.lights().len() as u32,
        })
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for texture in &mut self.textures {
            texture.destroy(device);
        }
        self.textures.clear();
        self.vertex_buffer.destroy(device);
        self.index_buffer.destroy(device);
        self.material_buffer.destroy(device);
        self.object_info_buffer.destroy(device);
        self.light_buffer.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{self, GeometryRegistry};
    use crate::scene::Material;
    use glam::Mat4;

    #[test]
    fn object_infos_skip_unresolved_meshes() {
        let mut registry = GeometryRegistry::new();
        let triangle = registry.register(geometry::create_triangle());
        let plane = registry.register(geometry::create_plane());

        let mut scene = Scene::new();
        let material = scene.add_material(Material::new([1.0; 4]));
        scene.add_object(triangle, material, Mat4::IDENTITY);
        scene.objects.push(crate::scene::SceneObject {
            mesh: None,
            material,
            transform: Mat4::IDENTITY,
        });
        scene.add_object(plane, material, Mat4::IDENTITY);
        // Dangling reference: logged and skipped, never fatal.
        scene.add_object(99, material, Mat4::IDENTITY);

        let infos = object_infos(&scene, &registry);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].vertex_offset, 0);
        assert_eq!(infos[1].vertex_offset, 3);
        assert_eq!(infos[1].index_offset, 3);
    }

    #[test]
    fn object_info_record_is_16_bytes() {
        assert_eq!(std::mem::size_of::<ObjectInfo>(), 16);
    }
}
