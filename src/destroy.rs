// Deferred destruction lists
//
// Every vulkan object the renderer creates can be scheduled here
// instead of being destroyed inline. A list belongs to one command
// buffer slot and is executed when that slot's fence signals, so
// nothing dies while the GPU may still be reading it.

use ash::vk;

use crate::device::Device;

use std::sync::Mutex;

/// One handle waiting to be destroyed.
///
/// Handles are stored raw since ash handles are plain u64 wrappers.
/// The one oddball is `BindSlots`, which releases a range back to the
/// material bind pool rather than destroying a vulkan object.
#[derive(Debug)]
pub(crate) enum DestroyItem {
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    Framebuffer(vk::Framebuffer),
    RenderPass(vk::RenderPass),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    PipelineCache(vk::PipelineCache),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    DescriptorPool(vk::DescriptorPool),
    ShaderModule(vk::ShaderModule),
    CommandPool(vk::CommandPool),
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
    QueryPool(vk::QueryPool),
    Swapchain(vk::SwapchainKHR),
    Surface(vk::SurfaceKHR),
    DebugMessenger(vk::DebugUtilsMessengerEXT),
    Memory(vk::DeviceMemory),
    YcbcrConversion(vk::SamplerYcbcrConversion),
    BindSlots { start: u32, count: u32 },
}

impl DestroyItem {
    /// Destroy the wrapped handle now.
    ///
    /// The caller is responsible for making sure the GPU is done with
    /// it, which in practice means being called from
    /// `DestroyList::execute` after a fence wait.
    pub(crate) unsafe fn destroy(self, dev: &Device) {
        match self {
            DestroyItem::Buffer(b) => dev.dev.destroy_buffer(b, None),
            DestroyItem::Image(i) => dev.dev.destroy_image(i, None),
            DestroyItem::ImageView(v) => dev.dev.destroy_image_view(v, None),
            DestroyItem::Sampler(s) => dev.dev.destroy_sampler(s, None),
            DestroyItem::Framebuffer(f) => dev.dev.destroy_framebuffer(f, None),
            DestroyItem::RenderPass(r) => dev.dev.destroy_render_pass(r, None),
            DestroyItem::Pipeline(p) => dev.dev.destroy_pipeline(p, None),
            DestroyItem::PipelineLayout(l) => dev.dev.destroy_pipeline_layout(l, None),
            DestroyItem::PipelineCache(c) => dev.dev.destroy_pipeline_cache(c, None),
            DestroyItem::DescriptorSetLayout(l) => dev.dev.destroy_descriptor_set_layout(l, None),
            DestroyItem::DescriptorPool(p) => dev.dev.destroy_descriptor_pool(p, None),
            DestroyItem::ShaderModule(m) => dev.dev.destroy_shader_module(m, None),
            DestroyItem::CommandPool(p) => dev.dev.destroy_command_pool(p, None),
            DestroyItem::Fence(f) => dev.dev.destroy_fence(f, None),
            DestroyItem::Semaphore(s) => dev.dev.destroy_semaphore(s, None),
            DestroyItem::QueryPool(q) => dev.dev.destroy_query_pool(q, None),
            DestroyItem::Swapchain(s) => dev.swapchain_loader.destroy_swapchain(s, None),
            DestroyItem::Surface(s) => dev.surface_loader.destroy_surface(s, None),
            DestroyItem::DebugMessenger(_) => {
                // owned by the Instance, which unregisters it on drop
            }
            DestroyItem::Memory(m) => dev.free_memory(m),
            DestroyItem::YcbcrConversion(y) => {
                dev.dev.destroy_sampler_ycbcr_conversion(y, None)
            }
            DestroyItem::BindSlots { start, count } => dev.bind_pool_free(start, count),
        }
    }
}

/// An append-only list of handles to destroy together.
///
/// Execution walks the list back to front, so dependents recorded
/// after their dependencies die first. A framebuffer appended after
/// the image view it references is destroyed before that view.
pub(crate) struct DestroyList {
    dl_items: Mutex<Vec<DestroyItem>>,
}

impl DestroyList {
    pub fn new() -> Self {
        Self {
            dl_items: Mutex::new(Vec::new()),
        }
    }

    /// Append may be called from any thread while the owning slot's
    /// thread is recording or executing.
    pub fn push(&self, item: DestroyItem) {
        self.dl_items.lock().unwrap().push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.dl_items.lock().unwrap().is_empty()
    }

    /// Take the contents in destruction order (reverse of insertion).
    pub(crate) fn take_reversed(&self) -> Vec<DestroyItem> {
        let mut items = std::mem::take(&mut *self.dl_items.lock().unwrap());
        items.reverse();
        items
    }

    /// Destroy everything in the list, newest first.
    pub fn execute(&self, dev: &Device) {
        for item in self.take_reversed() {
            unsafe { item.destroy(dev) };
        }
    }

    /// Empty the list without destroying anything.
    pub fn clear(&self) {
        self.dl_items.lock().unwrap().clear();
    }
}
