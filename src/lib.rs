//! Progressive hardware ray tracing renderer built on the Vulkan ray
//! tracing pipeline.
//!
//! The crate owns the full GPU ray tracing lifecycle of a scene:
//!
//! - one bottom-level acceleration structure per registered mesh, packed
//!   into shared result/scratch buffers ([`accel::BottomLevelStructures`]),
//! - a single top-level acceleration structure over all scene objects,
//!   rebuilt whenever the scene or camera changes
//!   ([`accel::TopLevelStructures`]),
//! - a persistent accumulation image for progressive refinement, reset on
//!   every camera or scene change ([`uniforms::FrameUniforms`]),
//! - a shader binding table with driver-alignment-correct regions
//!   ([`sbt::ShaderBindingTable`]),
//! - asynchronous pipeline compilation through Vulkan deferred host
//!   operations joined by a worker pool ([`pipeline::RayTracingPipeline`]).
//!
//! Windowing, swapchain presentation, asset import and the entity system
//! are collaborator concerns; the renderer consumes plain mesh/object data
//! and exposes a renderable output image.

pub mod accel;
pub mod context;
pub mod error;
pub mod geometry;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod sbt;
pub mod scene;
mod shaders;
pub mod uniforms;

pub use context::{RtContext, RtContextCreateInfo, RtDeviceProperties};
pub use error::{Result, RtError};
pub use geometry::{GeometryRegistry, MeshGeometry, MeshRecord, Vertex};
pub use renderer::{RayTracingRenderer, RendererDesc};
pub use scene::{LightRecord, Material, Scene, SceneObject, SceneResources};
