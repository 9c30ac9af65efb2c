// The Squall renderer
//
// A Vulkan rendering core that takes compiled shader blobs, meshes,
// materials, and textures and turns them into submitted GPU work. The
// windowing system, scene management, and asset pipelines all live
// above this crate; they hand us raw bytes and VkSurfaceKHR handles.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

mod bindpool;
mod buffer;
mod bump;
mod cmd;
mod descpool;
mod destroy;
mod device;
mod instance;
mod list;
mod material;
mod mesh;
mod pipeline;
mod renderer;
mod shader;
mod surface;
mod tex;

#[cfg(test)]
mod tests;

pub use buffer::{Buffer, BufferType, BufferUse};
pub use cmd::Future;
pub use list::{RenderItem, RenderList};
pub use material::{
    BlendState, CullMode, DepthTest, FrontFace, Material, MaterialInfo, PolygonMode, StencilOp,
    StencilState, Topology, WriteMask,
};
pub use mesh::Mesh;
pub use renderer::{ClearMask, Compute, Renderer};
pub use shader::{
    Bind, RegisterType, ShaderBuffer, ShaderFile, ShaderLang, ShaderResource, ShaderStage,
    ShaderVar, ShaderVarType, VertexComponent,
};
pub use surface::Surface;
pub use tex::{Sampler, SamplerSettings, TexData, TexFlags, Texture};

use std::ffi::CString;

/// How many frames the CPU may record ahead of the GPU. All per-frame
/// rings (bump allocators, query slots, surface semaphores) are this deep.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;
/// Command buffer slots in each thread's reuse ring.
pub const MAX_COMMAND_RING: usize = 3;
/// Number of threads that may record GPU work at once.
pub const MAX_RENDER_THREADS: usize = 16;
/// Vertex buffer streams a single mesh may bind.
pub const MAX_VERTEX_BUFFERS: usize = 4;
/// Global texture/constant slots on the renderer.
pub const MAX_GLOBAL_SLOTS: usize = 16;

/// Descriptor binding namespaces. HLSL-style registers collapse into a
/// single Vulkan descriptor set, so `b0`, `t0`, and `u0` each get their
/// own disjoint binding range.
pub const BIND_SHIFT_BUFFER: u32 = 0;
pub const BIND_SHIFT_TEXTURE: u32 = 64;
pub const BIND_SHIFT_UAV: u32 = 128;

/// Errors that this library may return
///
/// A lot of these map directly onto a vulkan error of a similar name.
/// Recoverable per-frame conditions get their own variants so callers
/// can match on them without string compares.
#[allow(non_camel_case_types)]
#[derive(thiserror::Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum SquallError {
    #[error("Invalid operation or argument")]
    INVALID,
    #[error("Unsupported or mismatched format")]
    INVALID_FORMAT,
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("Shader blob does not carry the expected magic value")]
    BAD_FORMAT,
    #[error("Shader blob version is not understood by this library")]
    OLD_VERSION,
    #[error("Shader blob contents are truncated or corrupt")]
    CORRUPT_DATA,
    #[error("Allocation failed")]
    OUT_OF_MEMORY,
    #[error("The surface is out of date and must be recreated")]
    OUT_OF_DATE,
    #[error("The swapchain needs to be resized")]
    NEEDS_RESIZE,
    #[error("The native surface was lost")]
    SURFACE_LOST,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Could not create a swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,
    #[error("Could not create an image")]
    COULD_NOT_CREATE_IMAGE,
    #[error("Could not create a buffer")]
    COULD_NOT_CREATE_BUFFER,
    #[error("Could not create a sampler")]
    COULD_NOT_CREATE_SAMPLER,
    #[error("Could not create a render pass")]
    COULD_NOT_CREATE_RENDERPASS,
    #[error("Could not compile a graphics pipeline")]
    COULD_NOT_CREATE_PIPELINE,
    #[error("Could not create a descriptor set")]
    COULD_NOT_CREATE_DESCRIPTOR,
    #[error("Presentation failed")]
    PRESENT_FAILED,
    #[error("Queue submission failed")]
    SUBMIT_FAILED,
    #[error("Not all required vulkan extensions are available")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
    #[error("No suitable queue family was found")]
    VK_SURF_NOT_SUPPORTED,
    #[error("The vulkan device was lost")]
    DEVICE_LOST,
    #[error("The render thread table is full")]
    THREAD_TABLE_FULL,
    #[error("This thread has not called thread_init")]
    THREAD_NOT_INITIALIZED,
    #[error("The material bind pool is exhausted")]
    BIND_POOL_EXHAUSTED,
    #[error("A shader-declared binding was not satisfied")]
    MISSING_BINDING,
    #[error("Recording fence wait failed")]
    FENCE_WAIT_FAILED,
}

pub type Result<T> = std::result::Result<T, SquallError>;

/// Renderer construction parameters.
///
/// Everything here is optional, the defaults get you a device with
/// validation off and no extra instance extensions.
#[derive(Clone)]
pub struct CreateInfo {
    pub app_name: String,
    pub app_version: u32,
    pub enable_validation: bool,
    /// Extra instance extensions the windowing layer needs, such as
    /// VK_KHR_surface and its platform variant.
    pub required_extensions: Vec<CString>,
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            ci: CreateInfo {
                app_name: "squall".to_string(),
                app_version: 0,
                enable_validation: false,
                required_extensions: Vec::new(),
            },
        }
    }
}

pub struct CreateInfoBuilder {
    ci: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn app_name(mut self, name: &str) -> Self {
        self.ci.app_name = name.to_string();
        self
    }

    pub fn app_version(mut self, version: u32) -> Self {
        self.ci.app_version = version;
        self
    }

    pub fn enable_validation(mut self, enable: bool) -> Self {
        self.ci.enable_validation = enable;
        self
    }

    pub fn required_extensions(mut self, exts: &[CString]) -> Self {
        self.ci.required_extensions = exts.to_vec();
        self
    }

    pub fn build(self) -> CreateInfo {
        self.ci
    }
}

/// A rectangle in pixels, used for blits, viewports, and scissors.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }
}

/// This is the public facing squall api
///
/// One of these is the entire renderer: instance, device, caches, and
/// frame state. Create it once, pass it everywhere. Worker threads that
/// record GPU work call `thread_init` before their first command and
/// `thread_shutdown` before exiting.
pub struct Squall {
    sq_rend: Renderer,
}

// This is the public facing squall api
impl Squall {
    pub fn new(info: &CreateInfo) -> Result<Self> {
        Ok(Self {
            sq_rend: Renderer::new(info)?,
        })
    }

    /// The underlying renderer context, for anything not mirrored on
    /// the facade.
    pub fn rend(&mut self) -> &mut Renderer {
        &mut self.sq_rend
    }

    pub fn thread_init(&self) -> Result<()> {
        self.sq_rend.thread_init()
    }

    pub fn thread_shutdown(&self) {
        self.sq_rend.thread_shutdown()
    }

    pub fn frame_begin(&mut self) -> Result<()> {
        self.sq_rend.frame_begin()
    }

    pub fn frame_end(&mut self, surfaces: &mut [&mut Surface]) -> Result<()> {
        self.sq_rend.frame_end(surfaces)
    }

    pub fn get_gpu_time_ms(&self) -> f32 {
        self.sq_rend.get_gpu_time_ms()
    }

    pub fn begin_pass(
        &mut self,
        color: &std::sync::Arc<Texture>,
        depth: Option<&std::sync::Arc<Texture>>,
        resolve: Option<&std::sync::Arc<Texture>>,
        clear: ClearMask,
        clear_color: [f32; 4],
        clear_depth: f32,
        clear_stencil: u32,
    ) -> Result<()> {
        self.sq_rend
            .begin_pass(color, depth, resolve, clear, clear_color, clear_depth, clear_stencil)
    }

    pub fn end_pass(&mut self) -> Result<()> {
        self.sq_rend.end_pass()
    }

    pub fn draw(&mut self, list: &RenderList, sys_data: &[u8], instance_multiplier: u32) -> Result<()> {
        self.sq_rend.draw(list, sys_data, instance_multiplier)
    }

    pub fn draw_mesh_immediate(
        &mut self,
        mesh: &Mesh,
        material: &Material,
        first_index: u32,
        index_count: u32,
        vertex_offset: i32,
        instance_count: u32,
    ) -> Result<()> {
        self.sq_rend.draw_mesh_immediate(
            mesh,
            material,
            first_index,
            index_count,
            vertex_offset,
            instance_count,
        )
    }

    pub fn blit(
        &mut self,
        material: &Material,
        to: &std::sync::Arc<Texture>,
        rect: Rect,
    ) -> Result<()> {
        self.sq_rend.blit(material, to, rect)
    }

    pub fn set_global_texture(&mut self, slot: u32, tex: Option<&std::sync::Arc<Texture>>) {
        self.sq_rend.set_global_texture(slot, tex)
    }

    pub fn set_global_constants(&mut self, slot: u32, buffer: Option<&std::sync::Arc<Buffer>>) {
        self.sq_rend.set_global_constants(slot, buffer)
    }

    pub fn set_viewport(&mut self, rect: Rect) -> Result<()> {
        self.sq_rend.set_viewport(rect)
    }

    pub fn set_scissor(&mut self, rect: Rect) -> Result<()> {
        self.sq_rend.set_scissor(rect)
    }

    pub fn load_shader(&self, bytes: &[u8]) -> Result<std::sync::Arc<ShaderFile>> {
        self.sq_rend.load_shader(bytes)
    }

    pub fn create_material(&self, info: &MaterialInfo) -> Result<Material> {
        self.sq_rend.create_material(info)
    }

    pub fn create_surface(&self, surface: ash::vk::SurfaceKHR) -> Result<Surface> {
        self.sq_rend.create_surface(surface)
    }
}
