// Swapchain surfaces
//
// A Surface wraps a caller-created VkSurfaceKHR with a swapchain, the
// per-image texture wrappers, and the semaphore rings that pace
// acquisition against presentation. Acquire semaphores are indexed by
// the frame ring and submit semaphores by the acquired image, which
// keeps an in-flight semaphore from being re-signaled.

use ash::vk;

use crate::cmd::Future;
use crate::device::Device;
use crate::tex::Texture;
use crate::{Result, SquallError};

use std::sync::Arc;

pub struct Surface {
    s_dev: Arc<Device>,
    // the actual surface (KHR extension), owned by us from creation on
    s_surface: vk::SurfaceKHR,
    s_swapchain: vk::SwapchainKHR,
    s_images: Vec<Arc<Texture>>,

    s_acquire_semas: Vec<vk::Semaphore>,
    s_submit_semas: Vec<vk::Semaphore>,
    /// Future for the frame that last used each frame ring slot. The
    /// slot's acquire semaphore is only reusable once this signals.
    s_frame_futures: Vec<Option<Future>>,

    pub(crate) s_current_image: u32,
    s_frame_idx: usize,

    s_size: vk::Extent2D,
    s_format: vk::SurfaceFormatKHR,
    s_present_mode: vk::PresentModeKHR,
    s_needs_recreate: bool,
}

impl Surface {
    /// choose a vkSurfaceFormatKHR for the vkSurfaceKHR
    ///
    /// sRGB formats are preferred so blits and UI come out with the
    /// expected encoding. Falls back to whatever the surface offers.
    fn select_surface_format(dev: &Device, surface: vk::SurfaceKHR) -> Result<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            dev.surface_loader
                .get_physical_device_surface_formats(dev.pdev, surface)
                .or(Err(SquallError::INVALID))?
        };

        formats
            .iter()
            .find(|fmt| {
                matches!(
                    fmt.format,
                    vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB
                )
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or(SquallError::INVALID_FORMAT)
    }

    /// mailbox beats fifo_relaxed beats fifo, the guaranteed fallback
    fn select_present_mode(dev: &Device, surface: vk::SurfaceKHR) -> vk::PresentModeKHR {
        let modes = unsafe {
            dev.surface_loader
                .get_physical_device_surface_present_modes(dev.pdev, surface)
                .unwrap_or_default()
        };

        for want in [
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO_RELAXED,
        ] {
            if modes.contains(&want) {
                return want;
            }
        }
        vk::PresentModeKHR::FIFO
    }

    /// Create a surface wrapper and its first swapchain. Ownership of
    /// `surface` transfers to the returned object.
    pub(crate) fn new(dev: &Arc<Device>, surface: vk::SurfaceKHR) -> Result<Surface> {
        let format = Self::select_surface_format(dev, surface)?;
        let present_mode = Self::select_present_mode(dev, surface);

        let mut ret = Surface {
            s_dev: dev.clone(),
            s_surface: surface,
            s_swapchain: vk::SwapchainKHR::null(),
            s_images: Vec::new(),
            s_acquire_semas: Vec::new(),
            s_submit_semas: Vec::new(),
            s_frame_futures: Vec::new(),
            s_current_image: 0,
            s_frame_idx: 0,
            s_size: vk::Extent2D::default(),
            s_format: format,
            s_present_mode: present_mode,
            s_needs_recreate: false,
        };

        ret.create_swapchain()?;
        Ok(ret)
    }

    /// Populate this surface with a new swapchain, retiring the old
    /// one if present. Also rebuilds the per-image textures and the
    /// semaphore rings.
    fn create_swapchain(&mut self) -> Result<()> {
        let dev = &self.s_dev;
        let caps = unsafe {
            dev.surface_loader
                .get_physical_device_surface_capabilities(dev.pdev, self.s_surface)
                .or(Err(SquallError::SURFACE_LOST))?
        };

        let mut desired_image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            desired_image_count = desired_image_count.min(caps.max_image_count);
        }

        self.s_size = caps.current_extent;

        let transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.s_surface)
            .min_image_count(desired_image_count)
            .image_color_space(self.s_format.color_space)
            .image_format(self.s_format.format)
            .image_extent(self.s_size)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.s_present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(self.s_swapchain)
            .build();

        let new_swapchain = unsafe {
            dev.swapchain_loader
                .create_swapchain(&create_info, None)
                .or(Err(SquallError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        if self.s_swapchain != vk::SwapchainKHR::null() {
            unsafe {
                dev.swapchain_loader.destroy_swapchain(self.s_swapchain, None);
            }
        }
        self.s_swapchain = new_swapchain;

        let images = unsafe {
            dev.swapchain_loader
                .get_swapchain_images(self.s_swapchain)
                .or(Err(SquallError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        self.s_images.clear();
        for (i, image) in images.iter().enumerate() {
            self.s_images.push(Texture::from_swapchain_image(
                dev,
                *image,
                self.s_format.format,
                (self.s_size.width, self.s_size.height),
                i as u16,
            )?);
        }

        // semaphore rings are as deep as the image count
        for sema in self
            .s_acquire_semas
            .drain(..)
            .chain(self.s_submit_semas.drain(..))
        {
            unsafe { dev.dev.destroy_semaphore(sema, None) };
        }
        for _ in 0..images.len() {
            self.s_acquire_semas.push(dev.create_semaphore());
            self.s_submit_semas.push(dev.create_semaphore());
        }
        self.s_frame_futures = (0..images.len()).map(|_| None).collect();
        self.s_frame_idx = 0;
        self.s_current_image = 0;
        self.s_needs_recreate = false;

        Ok(())
    }

    pub fn size(&self) -> (u32, u32) {
        (self.s_size.width, self.s_size.height)
    }

    pub fn format(&self) -> vk::Format {
        self.s_format.format
    }

    pub fn image_count(&self) -> usize {
        self.s_images.len()
    }

    pub fn needs_recreate(&self) -> bool {
        self.s_needs_recreate
    }

    /// Acquire the next swapchain image to render into.
    ///
    /// Waits for the frame future that last used this ring slot, so
    /// its acquire semaphore is guaranteed unsignaled, then acquires
    /// with that semaphore. Out of date and lost surfaces map onto
    /// the matching error variants for the caller to resize on.
    pub fn next_tex(&mut self) -> Result<Arc<Texture>> {
        if let Some(future) = self.s_frame_futures[self.s_frame_idx].as_ref() {
            future.wait()?;
        }

        let acquire_sema = self.s_acquire_semas[self.s_frame_idx];
        let ret = unsafe {
            self.s_dev.swapchain_loader.acquire_next_image(
                self.s_swapchain,
                u64::MAX,
                acquire_sema,
                vk::Fence::null(),
            )
        };

        match ret {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    self.s_needs_recreate = true;
                }
                self.s_current_image = index;
                // a fresh acquire means the old contents are garbage
                let tex = self.s_images[index as usize].clone();
                tex.mark_discarded();
                Ok(tex)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.s_needs_recreate = true;
                Err(SquallError::NEEDS_RESIZE)
            }
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(SquallError::SURFACE_LOST),
            Err(_) => Err(SquallError::COULD_NOT_ACQUIRE_NEXT_IMAGE),
        }
    }

    /// Flip the buffers. The present waits on this image's submit
    /// semaphore, signaled by the frame_end submission.
    pub fn present(&mut self) -> Result<()> {
        let wait_semas = [self.s_submit_semas[self.s_current_image as usize]];
        let swapchains = [self.s_swapchain];
        let indices = [self.s_current_image];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices)
            .build();

        match self.s_dev.graphics_present(&info) {
            Ok(suboptimal) => {
                if suboptimal {
                    self.s_needs_recreate = true;
                    return Err(SquallError::OUT_OF_DATE);
                }
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.s_needs_recreate = true;
                Err(SquallError::OUT_OF_DATE)
            }
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(SquallError::SURFACE_LOST),
            Err(_) => Err(SquallError::PRESENT_FAILED),
        }
    }

    /// Recreate the swapchain at the surface's current size.
    ///
    /// This will be done after NEEDS_RESIZE or OUT_OF_DATE, meaning
    /// the window was resized and everything derived from the old
    /// images has to be regenerated.
    pub fn resize(&mut self) -> Result<()> {
        self.s_dev.wait_idle();
        self.create_swapchain()
    }

    /// The image acquired by the last next_tex call.
    pub fn current_tex(&self) -> Arc<Texture> {
        self.s_images[self.s_current_image as usize].clone()
    }

    pub(crate) fn acquire_sema(&self) -> vk::Semaphore {
        self.s_acquire_semas[self.s_frame_idx]
    }

    pub(crate) fn submit_sema(&self) -> vk::Semaphore {
        self.s_submit_semas[self.s_current_image as usize]
    }

    /// Record the submission that rendered to this surface this
    /// frame, and advance the frame ring.
    pub(crate) fn store_frame_future(&mut self, future: Future) {
        self.s_frame_futures[self.s_frame_idx] = Some(future);
        self.s_frame_idx = (self.s_frame_idx + 1) % self.s_frame_futures.len();
    }

    /// The future for the most recently submitted frame, if any.
    pub fn last_frame_future(&self) -> Option<Future> {
        let prev = (self.s_frame_idx + self.s_frame_futures.len() - 1) % self.s_frame_futures.len();
        self.s_frame_futures[prev].clone()
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        let dev = &self.s_dev;
        dev.wait_idle();

        // swapchain textures only defer their views, which is fine to
        // run after the swapchain itself dies
        self.s_images.clear();

        unsafe {
            for sema in self
                .s_acquire_semas
                .drain(..)
                .chain(self.s_submit_semas.drain(..))
            {
                dev.dev.destroy_semaphore(sema, None);
            }
            dev.swapchain_loader.destroy_swapchain(self.s_swapchain, None);
            dev.surface_loader.destroy_surface(self.s_surface, None);
        }
    }
}
