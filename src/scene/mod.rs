pub mod light;
pub mod material;
pub mod resources;

use glam::{Mat4, Vec3};

pub use light::LightRecord;
pub use material::Material;
pub use resources::{ObjectInfo, SceneResources, TextureData};

use crate::geometry::{self, GeometryRegistry};

/// One placed object. `mesh` is a registry index; objects whose mesh has
/// not resolved yet (still loading, or a dangling reference) simply carry
/// `None` and are skipped by the instance builder.
#[derive(Clone, Debug)]
pub struct SceneObject {
    pub mesh: Option<u32>,
    pub material: u32,
    pub transform: Mat4,
}

/// CPU-side scene description: the object list read fresh on every
/// top-level rebuild, plus materials, lights and texture payloads.
#[derive(Default)]
pub struct Scene {
    pub objects: Vec<SceneObject>,
    materials: Vec<Material>,
    lights: Vec<LightRecord>,
    textures: Vec<TextureData>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_material(&mut self, material: Material) -> u32 {
        self.materials.push(material);
        self.materials.len() as u32 - 1
    }

    pub fn add_object(&mut self, mesh: u32, material: u32, transform: Mat4) -> usize {
        self.objects.push(SceneObject {
            mesh: Some(mesh),
            material,
            transform,
        });
        self.objects.len() - 1
    }

    pub fn add_quad_light(
        &mut self,
        position: [f32; 3],
        u: [f32; 3],
        v: [f32; 3],
        emission: [f32; 4],
    ) -> u32 {
        self.lights.push(LightRecord::quad(position, u, v, emission));
        self.lights.len() as u32 - 1
    }

    pub fn add_sphere_light(&mut self, center: [f32; 3], radius: f32, emission: [f32; 4]) -> u32 {
        self.lights.push(LightRecord::sphere(center, radius, emission));
        self.lights.len() as u32 - 1
    }

    pub fn add_texture(&mut self, texture: TextureData) -> u32 {
        self.textures.push(texture);
        self.textures.len() as u32 - 1
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    pub fn lights(&self) -> &[LightRecord] {
        &self.lights
    }

    pub fn textures(&self) -> &[TextureData] {
        &self.textures
    }
}

/// Cornell-box style demo scene: colored walls, an area light on the
/// ceiling, a metal box and a sphere.
pub fn cornell_box(registry: &mut GeometryRegistry) -> Scene {
    let mut scene = Scene::new();

    let plane = registry.register(geometry::create_plane());
    let cube = registry.register(geometry::create_cube());
    let sphere = registry.register(geometry::create_sphere(3));

    let white = scene.add_material(Material::new([0.73, 0.73, 0.73, 1.0]));
    let red = scene.add_material(Material::new([0.65, 0.05, 0.05, 1.0]));
    let green = scene.add_material(Material::new([0.12, 0.45, 0.15, 1.0]));
    let metal = scene.add_material(Material::new([0.8, 0.8, 0.8, 1.0]).metallic(0.1));
    let lamp = scene.add_material(
        Material::new([0.0, 0.0, 0.0, 1.0])
            .emission([1.0, 1.0, 1.0], 10.0)
            .light_index(0),
    );

    // Floor
    scene.add_object(
        plane,
        white,
        Mat4::from_translation(Vec3::new(0.0, -1.0, 0.0)) * Mat4::from_scale(Vec3::splat(2.0)),
    );
    // Ceiling
    scene.add_object(
        plane,
        white,
        Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0))
            * Mat4::from_rotation_x(std::f32::consts::PI)
            * Mat4::from_scale(Vec3::splat(2.0)),
    );
    // Back wall
    scene.add_object(
        plane,
        white,
        Mat4::from_translation(Vec3::new(0.0, 0.0, -1.0))
            * Mat4::from_rotation_x(std::f32::consts::FRAC_PI_2)
            * Mat4::from_scale(Vec3::splat(2.0)),
    );
    // Left wall (red)
    scene.add_object(
        plane,
        red,
        Mat4::from_translation(Vec3::new(-1.0, 0.0, 0.0))
            * Mat4::from_rotation_z(-std::f32::consts::FRAC_PI_2)
            * Mat4::from_scale(Vec3::splat(2.0)),
    );
    // Right wall (green)
    scene.add_object(
        plane,
        green,
        Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0))
            * Mat4::from_rotation_z(std::f32::consts::FRAC_PI_2)
            * Mat4::from_scale(Vec3::splat(2.0)),
    );
    // Ceiling light
    scene.add_object(
        plane,
        lamp,
        Mat4::from_translation(Vec3::new(0.0, 0.99, 0.0))
            * Mat4::from_rotation_x(std::f32::consts::PI)
            * Mat4::from_scale(Vec3::splat(0.5)),
    );
    scene.add_quad_light(
        [0.0, 0.99, 0.0],
        [0.25, 0.0, 0.0],
        [0.0, 0.0, 0.25],
        [1.0, 1.0, 1.0, 10.0],
    );

    // Tall metal box
    scene.add_object(
        cube,
        metal,
        Mat4::from_translation(Vec3::new(-0.35, -0.4, -0.3))
            * Mat4::from_rotation_y(0.4)
            * Mat4::from_scale(Vec3::new(0.6, 1.2, 0.6)),
    );
    // Sphere
    scene.add_object(
        sphere,
        white,
        Mat4::from_translation(Vec3::new(0.4, -0.75, 0.3)) * Mat4::from_scale(Vec3::splat(0.5)),
    );

    scene
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cornell_box_references_are_valid() {
        let mut registry = GeometryRegistry::new();
        let scene = cornell_box(&mut registry);

        assert_eq!(registry.len(), 3);
        assert_eq!(scene.objects.len(), 8);
        for object in &scene.objects {
            let mesh = object.mesh.expect("preset objects always carry a mesh");
            assert!((mesh as usize) < registry.len());
            assert!((object.material as usize) < scene.materials().len());
        }
        assert_eq!(scene.lights().len(), 1);
    }
}
