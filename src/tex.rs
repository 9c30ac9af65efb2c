// Textures and image layout tracking
//
// A texture owns its image, views, sampler, and memory, plus the
// mutable layout state that lets the renderer emit exactly the
// barriers a frame needs. Render targets also memoize their own
// framebuffers, keyed by render pass identity.

use ash::vk;

use crate::destroy::DestroyItem;
use crate::device::Device;
use crate::{Result, SquallError};

use std::sync::{Arc, Mutex};

bitflags! {
    /// Capabilities and usage intent for a texture.
    pub struct TexFlags: u32 {
        /// Sampled by shaders after rendering to it
        const READABLE = 1 << 0;
        /// May be written through transfer or attachment output
        const WRITEABLE = 1 << 1;
        const CUBEMAP = 1 << 2;
        const ARRAY = 1 << 3;
        /// Bound as a storage image by compute work
        const COMPUTE = 1 << 4;
        /// Generate a full mip chain after upload
        const GEN_MIPS = 1 << 5;
        const RENDER_TARGET = 1 << 6;
        /// Contents may be discarded between passes. Lets tile GPUs
        /// skip the attachment load entirely.
        const TRANSIENT_DISCARD = 1 << 7;
    }
}

/// Sampler state for a texture. Anisotropy of zero disables it.
#[derive(Copy, Clone, Debug)]
pub struct SamplerSettings {
    pub filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub anisotropy: f32,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            anisotropy: 0.0,
        }
    }
}

/// A standalone sampler, used to override the sampler a material
/// binds next to a texture.
pub struct Sampler {
    sp_dev: Arc<Device>,
    pub(crate) sp_sampler: vk::Sampler,
}

impl Sampler {
    pub(crate) fn new(dev: &Arc<Device>, settings: &SamplerSettings) -> Result<Arc<Sampler>> {
        Ok(Arc::new(Sampler {
            sp_dev: dev.clone(),
            sp_sampler: create_sampler(dev, settings, None)?,
        }))
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.sp_dev
            .defer_destroy(DestroyItem::Sampler(self.sp_sampler));
    }
}

/// Initial texture contents.
pub struct TexData<'a> {
    pub data: &'a [u8],
    pub mip_count: u32,
    pub layer_count: u32,
}

/// What a queued deferred transition is preparing the texture for.
/// Conflicting queue entries keep the stronger kind, where storage
/// access subsumes sampled reads.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum TransitionKind {
    ShaderRead,
    Storage,
}

/// The mutable half of layout tracking.
#[derive(Copy, Clone, Debug)]
pub(crate) struct LayoutState {
    pub current: vk::ImageLayout,
    pub prev_access: vk::AccessFlags,
    pub prev_stage: vk::PipelineStageFlags,
    /// Last stage known to have written the image, used as the source
    /// stage of the next barrier.
    pub writer_stage: vk::PipelineStageFlags,
}

impl LayoutState {
    fn undefined() -> Self {
        Self {
            current: vk::ImageLayout::UNDEFINED,
            prev_access: vk::AccessFlags::empty(),
            prev_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            writer_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        }
    }
}

/// Decide the source half of a layout barrier.
///
/// Returns None when the texture is already in `target` and no
/// barrier should be emitted. Kept free of vulkan calls so the
/// decision table is testable on its own.
pub(crate) fn transition_params(
    state: &LayoutState,
    target: vk::ImageLayout,
) -> Option<(vk::ImageLayout, vk::PipelineStageFlags, vk::AccessFlags)> {
    if state.current == target {
        return None;
    }
    Some((state.current, state.writer_stage, state.prev_access))
}

/// Cached framebuffer keyed by render pass identity. One slot for
/// color-only passes and one for passes with a depth attachment.
#[derive(Default)]
struct FbCache {
    color: Option<(u32, vk::Framebuffer)>,
    depth: Option<(u32, vk::Framebuffer)>,
}

pub struct Texture {
    t_dev: Arc<Device>,
    pub(crate) t_image: vk::Image,
    t_mem: vk::DeviceMemory,
    pub(crate) t_view: vk::ImageView,
    /// Views onto individual mip levels for compute mip generation.
    pub(crate) t_mip_views: Vec<vk::ImageView>,
    pub(crate) t_sampler: vk::Sampler,
    t_ycbcr: Option<vk::SamplerYcbcrConversion>,

    pub(crate) t_format: vk::Format,
    pub(crate) t_size: (u32, u32, u32),
    pub(crate) t_mips: u32,
    pub(crate) t_layers: u32,
    pub(crate) t_samples: vk::SampleCountFlags,
    pub(crate) t_aspect: vk::ImageAspectFlags,
    pub(crate) t_flags: TexFlags,

    t_layout: Mutex<LayoutState>,
    t_fb: Mutex<FbCache>,

    /// Swapchain images are owned by the swapchain, not by us.
    t_owns_image: bool,
    /// Identity for render list sort keys.
    pub(crate) t_id: u16,
}

fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

fn is_ycbcr_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::G8_B8R8_2PLANE_420_UNORM
            | vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16
            | vk::Format::G8_B8_R8_3PLANE_420_UNORM
    )
}

/// Bytes and block footprint for the upload copy math. Compressed
/// formats arrive as encoder output with a known block size.
fn format_block_info(format: vk::Format) -> (u32, u32, u32) {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT => (1, 1, 1),
        vk::Format::R8G8_UNORM => (2, 1, 1),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::R32_SFLOAT
        | vk::Format::R16G16_SFLOAT => (4, 1, 1),
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R16G16B16A16_UNORM => (8, 1, 1),
        vk::Format::R32G32B32A32_SFLOAT => (16, 1, 1),
        vk::Format::D16_UNORM => (2, 1, 1),
        vk::Format::D32_SFLOAT => (4, 1, 1),
        vk::Format::BC1_RGB_UNORM_BLOCK | vk::Format::BC1_RGB_SRGB_BLOCK => (8, 4, 4),
        vk::Format::BC3_UNORM_BLOCK | vk::Format::BC3_SRGB_BLOCK => (16, 4, 4),
        vk::Format::ETC2_R8G8B8_UNORM_BLOCK | vk::Format::ETC2_R8G8B8_SRGB_BLOCK => (8, 4, 4),
        vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK | vk::Format::ETC2_R8G8B8A8_SRGB_BLOCK => {
            (16, 4, 4)
        }
        _ => (4, 1, 1),
    }
}

/// Byte size of one mip level for one layer.
fn mip_byte_size(format: vk::Format, w: u32, h: u32, d: u32) -> u64 {
    let (bytes, bw, bh) = format_block_info(format);
    let blocks_w = (w + bw - 1) / bw;
    let blocks_h = (h + bh - 1) / bh;
    blocks_w as u64 * blocks_h as u64 * d.max(1) as u64 * bytes as u64
}

fn mip_dim(base: u32, level: u32) -> u32 {
    (base >> level).max(1)
}

fn create_sampler(
    dev: &Arc<Device>,
    settings: &SamplerSettings,
    ycbcr: Option<vk::SamplerYcbcrConversion>,
) -> Result<vk::Sampler> {
    let mut conv_info;
    let mut info = vk::SamplerCreateInfo::builder()
        .mag_filter(settings.filter)
        .min_filter(settings.filter)
        .mipmap_mode(settings.mipmap_mode)
        .address_mode_u(settings.address_mode)
        .address_mode_v(settings.address_mode)
        .address_mode_w(settings.address_mode)
        .anisotropy_enable(settings.anisotropy > 0.0 && dev.dev_features.supports_anisotropy)
        .max_anisotropy(settings.anisotropy.max(1.0))
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE);

    if let Some(conv) = ycbcr {
        conv_info = vk::SamplerYcbcrConversionInfo::builder()
            .conversion(conv)
            .build();
        info = info.push_next(&mut conv_info);
    }

    unsafe {
        dev.dev
            .create_sampler(&info, None)
            .or(Err(SquallError::COULD_NOT_CREATE_SAMPLER))
    }
}

impl Texture {
    /// Create a texture and optionally upload initial contents.
    pub(crate) fn new(
        dev: &Arc<Device>,
        format: vk::Format,
        flags: TexFlags,
        sampler: &SamplerSettings,
        size: (u32, u32, u32),
        mip_count: u32,
        layer_count: u32,
        samples: vk::SampleCountFlags,
        id: u16,
        data: Option<&TexData>,
    ) -> Result<Arc<Texture>> {
        let (w, h, d) = size;
        if w == 0 || h == 0 {
            return Err(SquallError::INVALID);
        }
        let depth = is_depth_format(format);
        let mips = mip_count.max(1);
        let layers = match flags.contains(TexFlags::CUBEMAP) {
            true => 6 * layer_count.max(1),
            false => layer_count.max(1),
        };

        if is_ycbcr_format(format) && !dev.dev_features.supports_ycbcr {
            log::error!("device does not support YCbCr sampling for {:?}", format);
            return Err(SquallError::INVALID_FORMAT);
        }

        let mut usage = vk::ImageUsageFlags::TRANSFER_DST;
        if !depth || flags.contains(TexFlags::READABLE) {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if flags.contains(TexFlags::GEN_MIPS) {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if flags.contains(TexFlags::RENDER_TARGET) {
            usage |= match depth {
                true => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                false => vk::ImageUsageFlags::COLOR_ATTACHMENT,
            };
        }
        if flags.contains(TexFlags::COMPUTE) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }

        let mut aspect = match depth {
            true => vk::ImageAspectFlags::DEPTH,
            false => vk::ImageAspectFlags::COLOR,
        };
        if has_stencil(format) {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }

        let image_type = match d > 1 {
            true => vk::ImageType::TYPE_3D,
            false => vk::ImageType::TYPE_2D,
        };
        let mut create_flags = vk::ImageCreateFlags::empty();
        if flags.contains(TexFlags::CUBEMAP) {
            create_flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }

        let create_info = vk::ImageCreateInfo::builder()
            .flags(create_flags)
            .image_type(image_type)
            .format(format)
            .extent(vk::Extent3D {
                width: w,
                height: h,
                depth: d.max(1),
            })
            .mip_levels(mips)
            .array_layers(layers)
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            dev.dev
                .create_image(&create_info, None)
                .or(Err(SquallError::COULD_NOT_CREATE_IMAGE))?
        };

        let mem_reqs = unsafe { dev.dev.get_image_memory_requirements(image) };
        let memtype_index = dev
            .find_memory_type_index(&mem_reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .ok_or(SquallError::OUT_OF_MEMORY)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_reqs.size)
            .memory_type_index(memtype_index);
        let mem = unsafe {
            dev.dev
                .allocate_memory(&alloc_info, None)
                .or(Err(SquallError::OUT_OF_MEMORY))?
        };
        unsafe {
            dev.dev
                .bind_image_memory(image, mem, 0)
                .or(Err(SquallError::COULD_NOT_CREATE_IMAGE))?;
        }

        let ycbcr = match is_ycbcr_format(format) {
            true => {
                let info = vk::SamplerYcbcrConversionCreateInfo::builder()
                    .format(format)
                    .ycbcr_model(vk::SamplerYcbcrModelConversion::YCBCR_709)
                    .ycbcr_range(vk::SamplerYcbcrRange::ITU_NARROW)
                    .components(vk::ComponentMapping::default())
                    .x_chroma_offset(vk::ChromaLocation::MIDPOINT)
                    .y_chroma_offset(vk::ChromaLocation::MIDPOINT)
                    .chroma_filter(vk::Filter::LINEAR)
                    .force_explicit_reconstruction(false);
                Some(unsafe {
                    dev.dev
                        .create_sampler_ycbcr_conversion(&info, None)
                        .or(Err(SquallError::COULD_NOT_CREATE_SAMPLER))?
                })
            }
            false => None,
        };

        let view_type = if flags.contains(TexFlags::CUBEMAP) {
            vk::ImageViewType::CUBE
        } else if flags.contains(TexFlags::ARRAY) {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else if d > 1 {
            vk::ImageViewType::TYPE_3D
        } else {
            vk::ImageViewType::TYPE_2D
        };

        let view = Self::create_view(dev, image, format, view_type, aspect, 0, mips, layers, ycbcr)?;

        // individual mip views feed compute based mip generation
        let mut mip_views = Vec::new();
        if flags.contains(TexFlags::COMPUTE) && mips > 1 {
            for level in 0..mips {
                mip_views.push(Self::create_view(
                    dev, image, format, view_type, aspect, level, 1, layers, ycbcr,
                )?);
            }
        }

        let vk_sampler = create_sampler(dev, sampler, ycbcr)?;

        let ret = Arc::new(Texture {
            t_dev: dev.clone(),
            t_image: image,
            t_mem: mem,
            t_view: view,
            t_mip_views: mip_views,
            t_sampler: vk_sampler,
            t_ycbcr: ycbcr,
            t_format: format,
            t_size: (w, h, d.max(1)),
            t_mips: mips,
            t_layers: layers,
            t_samples: samples,
            t_aspect: aspect,
            t_flags: flags,
            t_layout: Mutex::new(LayoutState::undefined()),
            t_fb: Mutex::new(FbCache::default()),
            t_owns_image: true,
            t_id: id,
        });

        if let Some(data) = data {
            ret.upload(data)?;
        }

        Ok(ret)
    }

    /// Wrap a swapchain image. The swapchain owns the vkImage, we own
    /// the view.
    pub(crate) fn from_swapchain_image(
        dev: &Arc<Device>,
        image: vk::Image,
        format: vk::Format,
        size: (u32, u32),
        id: u16,
    ) -> Result<Arc<Texture>> {
        let view = Self::create_view(
            dev,
            image,
            format,
            vk::ImageViewType::TYPE_2D,
            vk::ImageAspectFlags::COLOR,
            0,
            1,
            1,
            None,
        )?;

        Ok(Arc::new(Texture {
            t_dev: dev.clone(),
            t_image: image,
            t_mem: vk::DeviceMemory::null(),
            t_view: view,
            t_mip_views: Vec::new(),
            t_sampler: vk::Sampler::null(),
            t_ycbcr: None,
            t_format: format,
            t_size: (size.0, size.1, 1),
            t_mips: 1,
            t_layers: 1,
            t_samples: vk::SampleCountFlags::TYPE_1,
            t_aspect: vk::ImageAspectFlags::COLOR,
            t_flags: TexFlags::RENDER_TARGET | TexFlags::TRANSIENT_DISCARD,
            t_layout: Mutex::new(LayoutState::undefined()),
            t_fb: Mutex::new(FbCache::default()),
            t_owns_image: false,
            t_id: id,
        }))
    }

    fn create_view(
        dev: &Arc<Device>,
        image: vk::Image,
        format: vk::Format,
        view_type: vk::ImageViewType,
        aspect: vk::ImageAspectFlags,
        base_mip: u32,
        mips: u32,
        layers: u32,
        ycbcr: Option<vk::SamplerYcbcrConversion>,
    ) -> Result<vk::ImageView> {
        let mut conv_info;
        let mut info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .format(format)
            .view_type(view_type)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .base_mip_level(base_mip)
                    .level_count(mips)
                    .base_array_layer(0)
                    .layer_count(layers)
                    .build(),
            );

        if let Some(conv) = ycbcr {
            conv_info = vk::SamplerYcbcrConversionInfo::builder()
                .conversion(conv)
                .build();
            info = info.push_next(&mut conv_info);
        }

        unsafe {
            dev.dev
                .create_image_view(&info, None)
                .or(Err(SquallError::COULD_NOT_CREATE_IMAGE))
        }
    }

    pub fn size(&self) -> (u32, u32, u32) {
        self.t_size
    }

    pub fn format(&self) -> vk::Format {
        self.t_format
    }

    pub fn flags(&self) -> TexFlags {
        self.t_flags
    }

    pub fn mip_count(&self) -> u32 {
        self.t_mips
    }

    pub fn layer_count(&self) -> u32 {
        self.t_layers
    }

    pub fn is_valid(&self) -> bool {
        self.t_view != vk::ImageView::null()
    }

    pub(crate) fn current_layout(&self) -> vk::ImageLayout {
        self.t_layout.lock().unwrap().current
    }

    fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::builder()
            .aspect_mask(self.t_aspect)
            .base_mip_level(0)
            .level_count(self.t_mips)
            .base_array_layer(0)
            .layer_count(self.t_layers)
            .build()
    }

    /// Would a transition to `target` emit a barrier right now.
    pub(crate) fn needs_transition(&self, target: vk::ImageLayout) -> bool {
        transition_params(&self.t_layout.lock().unwrap(), target).is_some()
    }

    /// Transition to `target` with an image barrier.
    ///
    /// Must never be called inside a render pass; queued transitions
    /// exist so callers outside a pass can defer to the next
    /// begin_pass.
    pub(crate) fn transition(
        &self,
        cbuf: vk::CommandBuffer,
        target: vk::ImageLayout,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let mut state = self.t_layout.lock().unwrap();
        let (old_layout, src_stage, src_access) = match transition_params(&state, target) {
            Some(p) => p,
            None => return,
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .image(self.t_image)
            .old_layout(old_layout)
            .new_layout(target)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(self.full_range())
            .build();

        unsafe {
            self.t_dev.dev.cmd_pipeline_barrier(
                cbuf,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        state.current = target;
        state.prev_access = dst_access;
        state.prev_stage = dst_stage;
        state.writer_stage = dst_stage;
    }

    pub(crate) fn transition_for_shader_read(
        &self,
        cbuf: vk::CommandBuffer,
        dst_stage: vk::PipelineStageFlags,
    ) {
        self.transition(
            cbuf,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            dst_stage,
            vk::AccessFlags::SHADER_READ,
        );
    }

    pub(crate) fn transition_for_storage(&self, cbuf: vk::CommandBuffer) {
        self.transition(
            cbuf,
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        );
    }

    /// Record a layout change that happened without a barrier from
    /// us, such as a render pass final layout.
    pub(crate) fn transition_notify_layout(
        &self,
        new_layout: vk::ImageLayout,
        writer_stage: vk::PipelineStageFlags,
        access: vk::AccessFlags,
    ) {
        let mut state = self.t_layout.lock().unwrap();
        state.current = new_layout;
        state.prev_access = access;
        state.prev_stage = writer_stage;
        state.writer_stage = writer_stage;
    }

    /// Forget the current contents. The next barrier or render pass
    /// sees UNDEFINED and the driver can skip loading the old bits.
    pub(crate) fn mark_discarded(&self) {
        let mut state = self.t_layout.lock().unwrap();
        *state = LayoutState::undefined();
    }

    /// Fetch or build the cached framebuffer for `pass_id`.
    ///
    /// The cache keeps one entry for color-only passes and one for
    /// passes with depth. A pass identity change queues the stale
    /// framebuffer for destruction and rebuilds.
    pub(crate) fn framebuffer(
        &self,
        pass_id: u32,
        pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: (u32, u32),
        layers: u32,
        with_depth: bool,
    ) -> Result<vk::Framebuffer> {
        let mut cache = self.t_fb.lock().unwrap();
        let slot = match with_depth {
            true => &mut cache.depth,
            false => &mut cache.color,
        };

        if let Some((cached_id, fb)) = *slot {
            if cached_id == pass_id {
                return Ok(fb);
            }
            self.t_dev.defer_destroy(DestroyItem::Framebuffer(fb));
        }

        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(pass)
            .attachments(attachments)
            .width(extent.0)
            .height(extent.1)
            .layers(layers);

        let fb = unsafe {
            self.t_dev
                .dev
                .create_framebuffer(&info, None)
                .or(Err(SquallError::COULD_NOT_CREATE_IMAGE))?
        };
        *slot = Some((pass_id, fb));
        Ok(fb)
    }

    /// Upload initial contents and, when requested, generate mips.
    fn upload(self: &Arc<Self>, data: &TexData) -> Result<()> {
        let dev = &self.t_dev;
        let (staging, staging_mem) = dev.create_buffer_with_data(
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            data.data,
        )?;

        let provided_mips = data.mip_count.max(1).min(self.t_mips);
        let layers = data.layer_count.max(1).min(self.t_layers);

        // one copy region per provided mip per layer, tightly packed
        // in mip-major order within each layer
        let mut regions = Vec::new();
        let mut offset: u64 = 0;
        for layer in 0..layers {
            for level in 0..provided_mips {
                let w = mip_dim(self.t_size.0, level);
                let h = mip_dim(self.t_size.1, level);
                let d = mip_dim(self.t_size.2, level);
                regions.push(
                    vk::BufferImageCopy::builder()
                        .buffer_offset(offset)
                        .buffer_row_length(0)
                        .buffer_image_height(0)
                        .image_subresource(
                            vk::ImageSubresourceLayers::builder()
                                .aspect_mask(self.t_aspect)
                                .mip_level(level)
                                .base_array_layer(layer)
                                .layer_count(1)
                                .build(),
                        )
                        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                        .image_extent(vk::Extent3D {
                            width: w,
                            height: h,
                            depth: d,
                        })
                        .build(),
                );
                offset += mip_byte_size(self.t_format, w, h, d);
            }
        }

        if offset > data.data.len() as u64 {
            log::error!(
                "texture upload needs {} bytes but only {} were provided",
                offset,
                data.data.len()
            );
            unsafe {
                dev.dev.destroy_buffer(staging, None);
                dev.free_memory(staging_mem);
            }
            return Err(SquallError::INVALID);
        }

        let thread = crate::cmd::current_thread()?;
        let ctx = thread.acquire(dev)?;

        self.transition(
            ctx.cbuf,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        );

        unsafe {
            dev.dev.cmd_copy_buffer_to_image(
                ctx.cbuf,
                staging,
                self.t_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions.as_slice(),
            );
        }

        let wants_mips =
            self.t_flags.contains(TexFlags::GEN_MIPS) && self.t_mips > 1 && provided_mips == 1;
        if wants_mips {
            self.blit_mip_chain(ctx.cbuf);
        } else {
            self.transition_for_shader_read(ctx.cbuf, vk::PipelineStageFlags::FRAGMENT_SHADER);
        }

        ctx.slot.cs_destroy.push(DestroyItem::Memory(staging_mem));
        ctx.slot.cs_destroy.push(DestroyItem::Buffer(staging));

        thread.release(dev)
    }

    /// Downsample mip 0 through the chain with linear blits.
    ///
    /// Assumes every level is currently TRANSFER_DST_OPTIMAL, leaves
    /// the whole image in SHADER_READ_ONLY_OPTIMAL.
    fn blit_mip_chain(&self, cbuf: vk::CommandBuffer) {
        let dev = &self.t_dev;
        let mut level_barrier = |level: u32,
                                 old: vk::ImageLayout,
                                 new: vk::ImageLayout,
                                 src_access: vk::AccessFlags,
                                 dst_access: vk::AccessFlags| {
            let barrier = vk::ImageMemoryBarrier::builder()
                .image(self.t_image)
                .old_layout(old)
                .new_layout(new)
                .src_access_mask(src_access)
                .dst_access_mask(dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(self.t_aspect)
                        .base_mip_level(level)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(self.t_layers)
                        .build(),
                )
                .build();
            unsafe {
                dev.dev.cmd_pipeline_barrier(
                    cbuf,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        };

        for level in 1..self.t_mips {
            // previous level becomes the blit source
            level_barrier(
                level - 1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            );

            let src_w = mip_dim(self.t_size.0, level - 1);
            let src_h = mip_dim(self.t_size.1, level - 1);
            let dst_w = mip_dim(self.t_size.0, level);
            let dst_h = mip_dim(self.t_size.1, level);

            let blit = vk::ImageBlit::builder()
                .src_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(self.t_aspect)
                        .mip_level(level - 1)
                        .base_array_layer(0)
                        .layer_count(self.t_layers)
                        .build(),
                )
                .src_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: src_w as i32,
                        y: src_h as i32,
                        z: 1,
                    },
                ])
                .dst_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(self.t_aspect)
                        .mip_level(level)
                        .base_array_layer(0)
                        .layer_count(self.t_layers)
                        .build(),
                )
                .dst_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: dst_w as i32,
                        y: dst_h as i32,
                        z: 1,
                    },
                ])
                .build();

            unsafe {
                dev.dev.cmd_blit_image(
                    cbuf,
                    self.t_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.t_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            // done reading this level, settle it for sampling
            level_barrier(
                level - 1,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ,
            );
        }

        // the last level never became a source
        level_barrier(
            self.t_mips - 1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );

        self.transition_notify_layout(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::SHADER_READ,
        );
    }

    /// A throwaway 2D array view over every layer, used as a layered
    /// framebuffer attachment for cubemap and array blits. The caller
    /// owns the view and must queue it for destruction.
    pub(crate) fn layered_attachment_view(&self) -> Result<vk::ImageView> {
        Self::create_view(
            &self.t_dev,
            self.t_image,
            self.t_format,
            vk::ImageViewType::TYPE_2D_ARRAY,
            self.t_aspect,
            0,
            1,
            self.t_layers,
            None,
        )
    }

    pub fn set_name(&self, name: &str) {
        use vk::Handle;
        self.t_dev.inst.set_object_name(
            self.t_dev.dev.handle(),
            vk::ObjectType::IMAGE,
            self.t_image.as_raw(),
            name,
        );
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let dev = &self.t_dev;

        // queued in dependency order so LIFO execution destroys the
        // framebuffers and views before the image and its memory
        if self.t_owns_image {
            dev.defer_destroy(DestroyItem::Memory(self.t_mem));
            dev.defer_destroy(DestroyItem::Image(self.t_image));
        }
        dev.defer_destroy(DestroyItem::ImageView(self.t_view));
        for view in self.t_mip_views.drain(..) {
            dev.defer_destroy(DestroyItem::ImageView(view));
        }
        if self.t_sampler != vk::Sampler::null() {
            dev.defer_destroy(DestroyItem::Sampler(self.t_sampler));
        }
        if let Some(conv) = self.t_ycbcr.take() {
            dev.defer_destroy(DestroyItem::YcbcrConversion(conv));
        }

        let cache = self.t_fb.lock().unwrap();
        if let Some((_, fb)) = cache.color {
            dev.defer_destroy(DestroyItem::Framebuffer(fb));
        }
        if let Some((_, fb)) = cache.depth {
            dev.defer_destroy(DestroyItem::Framebuffer(fb));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        let mut state = LayoutState::undefined();

        // undefined to anything is a discard transition
        let (old, _, access) =
            transition_params(&state, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(old, vk::ImageLayout::UNDEFINED);
        assert_eq!(access, vk::AccessFlags::empty());

        // same layout is a no-op
        state.current = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        assert!(transition_params(&state, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL).is_none());

        // a tracked write feeds the next barrier's source half
        state.current = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
        state.prev_access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        state.writer_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let (old, stage, access) =
            transition_params(&state, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(old, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
    }

    #[test]
    fn mip_sizes() {
        assert_eq!(mip_byte_size(vk::Format::R8G8B8A8_UNORM, 4, 4, 1), 64);
        // bc1 is 8 bytes per 4x4 block
        assert_eq!(mip_byte_size(vk::Format::BC1_RGB_UNORM_BLOCK, 8, 8, 1), 32);
        // blocks round up
        assert_eq!(mip_byte_size(vk::Format::BC1_RGB_UNORM_BLOCK, 2, 2, 1), 8);
        assert_eq!(mip_dim(256, 3), 32);
        assert_eq!(mip_dim(1, 5), 1);
    }

    #[test]
    fn transition_kinds_order_by_strength() {
        assert!(TransitionKind::Storage > TransitionKind::ShaderRead);
    }
}
