// Vulkan device representation
//
// This stores per-GPU state: the logical device, the one graphics
// queue this renderer drives, memory helpers, and the capability
// flags the rest of the crate adapts to.

use ash::extensions::khr;
use ash::vk;

use crate::bindpool::BindPool;
use crate::destroy::DestroyItem;
use crate::instance::Instance;
use crate::{CreateInfo, Result, SquallError};

use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The available vulkan capabilities.
///
/// Probed once at startup. Missing optional capabilities degrade the
/// renderer (descriptor pool path, zeroed GPU timings, YCbCr formats
/// rejected) instead of failing device creation.
pub struct VkDeviceFeatures {
    /// VK_KHR_push_descriptor, selects the descriptor binding path
    pub supports_push_descriptors: bool,
    /// samplerYcbcrConversion feature for nv12/p010/yuv420p textures
    pub supports_ycbcr: bool,
    /// Does the graphics queue support vkCmdWriteTimestamp
    pub supports_timestamps: bool,
    /// samplerAnisotropy device feature
    pub supports_anisotropy: bool,
    /// Nanoseconds per timestamp tick
    pub timestamp_period: f32,

    push_descriptor_exts: [*const i8; 1],
}

unsafe impl Send for VkDeviceFeatures {}
unsafe impl Sync for VkDeviceFeatures {}

fn contains_extensions(exts: &[vk::ExtensionProperties], req: &[*const i8]) -> bool {
    let mut count = 0;

    for r in req.iter() {
        let rstr = unsafe { CStr::from_ptr(*r as *const std::os::raw::c_char) };

        for e in exts {
            let estr = unsafe { CStr::from_ptr(&e.extension_name as *const std::os::raw::c_char) };
            if rstr == estr {
                count += 1;
                if count == req.len() {
                    return true;
                }
                break;
            }
        }
    }

    return false;
}

impl VkDeviceFeatures {
    pub fn new(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        graphics_family: u32,
    ) -> Self {
        let mut ret = Self {
            supports_push_descriptors: false,
            supports_ycbcr: false,
            supports_timestamps: false,
            supports_anisotropy: false,
            timestamp_period: 0.0,
            push_descriptor_exts: [vk::KhrPushDescriptorFn::name().as_ptr()],
        };

        unsafe {
            let exts = inst.enumerate_device_extension_properties(pdev).unwrap();
            match contains_extensions(exts.as_slice(), &ret.push_descriptor_exts) {
                true => ret.supports_push_descriptors = true,
                false => log::info!("Push descriptors unavailable, using transient sets"),
            }

            let mut ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::builder().build();
            let mut features = vk::PhysicalDeviceFeatures2::builder().build();
            features.p_next = &mut ycbcr as *mut _ as *mut std::ffi::c_void;
            inst.get_physical_device_features2(pdev, &mut features);
            ret.supports_ycbcr = ycbcr.sampler_ycbcr_conversion != 0;
            ret.supports_anisotropy = features.features.sampler_anisotropy != 0;

            let props = inst.get_physical_device_properties(pdev);
            let family_props = inst.get_physical_device_queue_family_properties(pdev);
            ret.supports_timestamps = props.limits.timestamp_compute_and_graphics != 0
                && family_props[graphics_family as usize].timestamp_valid_bits != 0;
            ret.timestamp_period = props.limits.timestamp_period;
        }

        return ret;
    }

    pub fn get_device_extensions(&self) -> Vec<*const i8> {
        let mut ret = vec![khr::Swapchain::name().as_ptr()];

        if self.supports_push_descriptors {
            for e in self.push_descriptor_exts.iter() {
                ret.push(*e)
            }
        }

        return ret;
    }
}

/// Squall Device
///
/// This holds all of the vulkan logic for one GPU. It is shared by
/// every resource the renderer creates, and is the last thing to die.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    /// Details about what this device supports
    pub(crate) dev_features: VkDeviceFeatures,
    /// the physical device backing the above
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    pub(crate) limits: vk::PhysicalDeviceLimits,

    /// The single graphics queue this renderer submits to. All
    /// vkQueueSubmit and vkQueuePresentKHR calls are serialized
    /// through this mutex.
    pub(crate) graphics_family: u32,
    d_graphics_queue: Mutex<vk::Queue>,

    pub(crate) swapchain_loader: khr::Swapchain,
    pub(crate) surface_loader: khr::Surface,
    pub(crate) push_loader: Option<khr::PushDescriptor>,

    /// Bind records referenced by materials and render items. Lives on
    /// the device so deferred `BindSlots` releases have a home.
    pub(crate) d_bind_pool: BindPool,

    /// Latched on VK_ERROR_DEVICE_LOST. Once set, command recording
    /// becomes a no-op until shutdown.
    d_lost: AtomicBool,
}

impl Device {
    /// Choose a queue family supporting graphics work.
    fn select_queue_family(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> Result<u32> {
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .filter_map(|(index, info)| {
                match info.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                    true => Some(index as u32),
                    false => None,
                }
            })
            .nth(0)
            .ok_or(SquallError::VK_SURF_NOT_SUPPORTED)
    }

    /// Choose a vkPhysicalDevice.
    ///
    /// For now we are just going to get the first one. Eventually
    /// there needs to be a way of grabbing a configured pdev from
    /// the user.
    fn select_pdev(inst: &ash::Instance) -> Result<vk::PhysicalDevice> {
        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .or(Err(SquallError::INVALID))?
        };

        pdevices.first().copied().ok_or(SquallError::INVALID)
    }

    /// Create a vkDevice from a vkPhysicalDevice
    ///
    /// We only ever ask for one graphics queue. Descriptor indexing is
    /// required since the pipeline cache builds partially bound
    /// descriptor set layouts for the global slots.
    fn create_device(
        dev_features: &VkDeviceFeatures,
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        graphics_family: u32,
    ) -> Result<ash::Device> {
        let dev_extension_names = dev_features.get_device_extensions();

        let features = vk::PhysicalDeviceFeatures::builder()
            .sample_rate_shading(true)
            .sampler_anisotropy(dev_features.supports_anisotropy)
            .build();
        let mut vulkan11_features = vk::PhysicalDeviceVulkan11Features::builder()
            .sampler_ycbcr_conversion(dev_features.supports_ycbcr)
            .build();
        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::builder()
            .descriptor_indexing(true)
            .descriptor_binding_partially_bound(true)
            .build();

        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_family)
            .queue_priorities(&priorities)
            .build()];

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(dev_extension_names.as_slice())
            .enabled_features(&features)
            .push_next(&mut vulkan11_features)
            .push_next(&mut vulkan12_features)
            .build();

        unsafe {
            inst.create_device(pdev, &dev_create_info, None)
                .or(Err(SquallError::VK_NOT_ALL_EXTENSIONS_AVAILABLE))
        }
    }

    /// Create a new default Device for the first physical device.
    pub fn new(instance: Arc<Instance>, _info: &CreateInfo) -> Result<Arc<Self>> {
        let pdev = Self::select_pdev(&instance.inst)?;
        let graphics_family = Self::select_queue_family(&instance.inst, pdev)?;
        let mem_props = unsafe { instance.inst.get_physical_device_memory_properties(pdev) };
        let limits = unsafe { instance.inst.get_physical_device_properties(pdev).limits };

        let dev_features = VkDeviceFeatures::new(&instance.inst, pdev, graphics_family);
        let dev = Self::create_device(&dev_features, &instance.inst, pdev, graphics_family)?;

        let graphics_queue = unsafe { dev.get_device_queue(graphics_family, 0) };
        let swapchain_loader = khr::Swapchain::new(&instance.inst, &dev);
        let surface_loader = khr::Surface::new(&instance.loader, &instance.inst);
        let push_loader = match dev_features.supports_push_descriptors {
            true => Some(khr::PushDescriptor::new(&instance.inst, &dev)),
            false => None,
        };

        Ok(Arc::new(Self {
            inst: instance,
            dev: dev,
            dev_features: dev_features,
            pdev: pdev,
            mem_props: mem_props,
            limits: limits,
            graphics_family: graphics_family,
            d_graphics_queue: Mutex::new(graphics_queue),
            swapchain_loader: swapchain_loader,
            surface_loader: surface_loader,
            push_loader: push_loader,
            d_bind_pool: BindPool::new(),
            d_lost: AtomicBool::new(false),
        }))
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.d_lost.load(Ordering::Acquire)
    }

    pub(crate) fn mark_lost(&self) {
        log::error!("vulkan device lost, all further commands are no-ops");
        self.d_lost.store(true, Ordering::Release);
    }

    /// Returns an index into the array of memory types for the memory
    /// properties
    ///
    /// Memory types specify the location and accessability of memory.
    /// Device local memory is resident on the GPU, while host visible
    /// memory can be read from the system side.
    pub(crate) fn find_memory_type_index(
        &self,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for (i, mem_type) in self.mem_props.memory_types.iter().enumerate() {
            // Bit i of memoryTypeBits will be set if the resource
            // supports the ith memory type in props.
            if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                return Some(i as u32);
            }
        }
        None
    }

    /// Allocates a buffer/memory pair of size `size`.
    ///
    /// This does not fill the buffer with anything.
    pub(crate) fn create_buffer_with_size(
        &self,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        size: u64,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        unsafe {
            let create_info = vk::BufferCreateInfo::builder()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .build();

            let buffer = self
                .dev
                .create_buffer(&create_info, None)
                .or(Err(SquallError::COULD_NOT_CREATE_BUFFER))?;
            let req = self.dev.get_buffer_memory_requirements(buffer);
            let index = match self.find_memory_type_index(&req, flags) {
                Some(i) => i,
                None => {
                    self.dev.destroy_buffer(buffer, None);
                    return Err(SquallError::OUT_OF_MEMORY);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo {
                allocation_size: req.size,
                memory_type_index: index,
                ..Default::default()
            };
            let memory = match self.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.dev.destroy_buffer(buffer, None);
                    return Err(SquallError::OUT_OF_MEMORY);
                }
            };

            self.dev
                .bind_buffer_memory(buffer, memory, 0)
                .or(Err(SquallError::COULD_NOT_CREATE_BUFFER))?;

            Ok((buffer, memory))
        }
    }

    /// Writes `data` to `memory` at `offset`
    ///
    /// Memory needs to be host visible and coherent. This does not
    /// flush after writing.
    pub(crate) fn update_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        unsafe {
            let ptr = self
                .dev
                .map_memory(memory, offset, data.len() as u64, vk::MemoryMapFlags::empty())
                .unwrap();

            let dst = std::slice::from_raw_parts_mut(ptr as *mut u8, data.len());
            dst.copy_from_slice(data);

            self.dev.unmap_memory(memory);
        }
    }

    /// Allocates a host visible buffer and fills it with `data`.
    ///
    /// Used for staging uploads and the small persistent buffers that
    /// do not care about device local bandwidth.
    pub(crate) fn create_buffer_with_data(
        &self,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        data: &[u8],
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let (buffer, memory) = self.create_buffer_with_size(usage, flags, data.len() as u64)?;
        self.update_memory(memory, 0, data);
        Ok((buffer, memory))
    }

    /// returns a new vkCommandPool for `graphics_family`
    ///
    /// The pool is created with the reset flag so individual command
    /// buffers can be recycled by the ring.
    pub(crate) fn create_command_pool(&self) -> vk::CommandPool {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.graphics_family);

        unsafe {
            self.dev
                .create_command_pool(&pool_create_info, None)
                .unwrap()
        }
    }

    /// Allocate a vec of vkCommandBuffers from `pool`. Command buffer
    /// is shortened to `cbuf` in many areas of the code.
    pub(crate) fn create_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Vec<vk::CommandBuffer> {
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        unsafe {
            self.dev
                .allocate_command_buffers(&cbuf_allocate_info)
                .unwrap()
        }
    }

    pub(crate) fn create_fence(&self) -> vk::Fence {
        unsafe {
            self.dev
                .create_fence(&vk::FenceCreateInfo::builder().build(), None)
                .unwrap()
        }
    }

    pub(crate) fn create_semaphore(&self) -> vk::Semaphore {
        unsafe {
            self.dev
                .create_semaphore(&vk::SemaphoreCreateInfo::builder().build(), None)
                .unwrap()
        }
    }

    /// Submit one command buffer to the graphics queue.
    ///
    /// The queue mutex is held for the duration of the submit so other
    /// threads and presentation do not race on the queue.
    pub(crate) fn graphics_submit(
        &self,
        cbuf: vk::CommandBuffer,
        wait_semas: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semas: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        if self.is_lost() {
            return Err(SquallError::DEVICE_LOST);
        }

        let cbufs = [cbuf];
        let submit_info = [vk::SubmitInfo::builder()
            .wait_semaphores(wait_semas)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(signal_semas)
            .build()];

        let queue = self.d_graphics_queue.lock().unwrap();
        let ret = unsafe { self.dev.queue_submit(*queue, &submit_info, fence) };
        drop(queue);

        match ret {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                self.mark_lost();
                Err(SquallError::DEVICE_LOST)
            }
            Err(_) => Err(SquallError::SUBMIT_FAILED),
        }
    }

    /// Present a swapchain image, serialized against submits.
    pub(crate) fn graphics_present(
        &self,
        info: &vk::PresentInfoKHR,
    ) -> std::result::Result<bool, vk::Result> {
        let queue = self.d_graphics_queue.lock().unwrap();
        unsafe { self.swapchain_loader.queue_present(*queue, info) }
    }

    pub(crate) fn wait_idle(&self) {
        unsafe {
            self.dev.device_wait_idle().ok();
        }
    }

    /// Wrapper for freeing device memory
    ///
    /// Having this in one place lets us quickly handle any additional
    /// allocation tracking
    pub(crate) unsafe fn free_memory(&self, mem: vk::DeviceMemory) {
        self.dev.free_memory(mem, None);
    }

    pub(crate) fn bind_pool_free(&self, start: u32, count: u32) {
        self.d_bind_pool.free(start, count);
    }

    /// Schedule a handle for destruction.
    ///
    /// If this thread has an open command batch the handle lands in
    /// that batch's destroy list. Otherwise it walks to the first
    /// initialized thread's active or last submitted batch, and if
    /// nothing is in flight anywhere, destroys immediately.
    pub(crate) fn defer_destroy(self: &Arc<Self>, item: DestroyItem) {
        crate::cmd::schedule_destroy(self, item);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.dev.device_wait_idle().ok();
            self.dev.destroy_device(None);
        }
    }
}
