// The renderer frame pipeline
//
// This is where frames actually happen: batch open and timestamps at
// frame_begin, queued layout transitions flushed and a render pass
// opened at begin_pass, sorted render lists turned into batched
// vkCmdDraw calls, blits, and the semaphored submit at frame_end that
// hands every participating surface a future for the frame.

use ash::vk;

use crate::buffer::{Buffer, BufferType, BufferUse};
use crate::bump::BumpSlice;
use crate::cmd::{self, CmdCtx};
use crate::descpool::{bind_descriptor_writes, DescWrite};
use crate::device::Device;
use crate::instance::Instance;
use crate::list::RenderList;
use crate::material::{Material, MaterialInfo};
use crate::mesh::Mesh;
use crate::pipeline::{PassKey, PipelineCache};
use crate::shader::{ShaderFile, VertexComponent};
use crate::surface::Surface;
use crate::tex::{SamplerSettings, Sampler, TexData, TexFlags, Texture, TransitionKind};
use crate::{
    CreateInfo, Rect, Result, SquallError, MAX_FRAMES_IN_FLIGHT, MAX_GLOBAL_SLOTS,
};

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

bitflags! {
    /// Which attachments begin_pass clears.
    pub struct ClearMask: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// A compute dispatch handle, one per compute shader.
pub struct Compute {
    c_shader: Arc<ShaderFile>,
}

impl Compute {
    pub fn shader(&self) -> &Arc<ShaderFile> {
        &self.c_shader
    }
}

/// Live state between begin_pass and end_pass.
struct PassState {
    ctx: CmdCtx,
    color: Arc<Texture>,
    depth: Option<Arc<Texture>>,
    resolve: Option<Arc<Texture>>,
    pass_idx: u32,
    /// Last pipeline bound in this pass, rebinds are skipped
    prev_pipeline: vk::Pipeline,
}

pub struct Renderer {
    r_inst: Arc<Instance>,
    pub(crate) r_dev: Arc<Device>,
    r_pipe: Arc<PipelineCache>,

    /// frame_number mod MAX_FRAMES_IN_FLIGHT, indexes per-frame rings
    r_flight_idx: usize,
    /// Monotonic frame counter, drives bump allocator wraparound
    r_frame_serial: u64,

    /// Two timestamp queries per flight index: frame start and end
    r_query_pool: vk::QueryPool,
    r_timestamps: [(u64, u64); MAX_FRAMES_IN_FLIGHT],
    r_timestamps_valid: [bool; MAX_FRAMES_IN_FLIGHT],

    r_global_tex: Vec<Option<Arc<Texture>>>,
    r_global_buf: Vec<Option<Arc<Buffer>>>,
    /// Textures waiting for a layout transition at the next
    /// begin_pass. Deduplicated, stronger kind wins.
    r_transition_queue: Mutex<Vec<(Arc<Texture>, TransitionKind)>>,

    r_pass: Option<PassState>,

    /// 1x1 white fallback bound to unset material texture slots
    r_default_tex: Option<Arc<Texture>>,

    r_next_tex_id: AtomicU16,
    r_next_mesh_id: AtomicU16,
    r_next_material_id: AtomicU16,
}

impl Renderer {
    /// Bring up the whole renderer: instance, device, caches, the
    /// calling thread's command state, and the default resources.
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let inst = Arc::new(Instance::new(info)?);
        let dev = Device::new(inst.clone(), info)?;
        let pipe = PipelineCache::new();

        cmd::thread_init(&dev)?;

        let query_pool = match dev.dev_features.supports_timestamps {
            true => {
                let info = vk::QueryPoolCreateInfo::builder()
                    .query_type(vk::QueryType::TIMESTAMP)
                    .query_count(MAX_FRAMES_IN_FLIGHT as u32 * 2);
                unsafe { dev.dev.create_query_pool(&info, None).ok() }
            }
            false => None,
        }
        .unwrap_or(vk::QueryPool::null());

        let mut ret = Self {
            r_inst: inst,
            r_dev: dev,
            r_pipe: pipe,
            r_flight_idx: 0,
            r_frame_serial: 0,
            r_query_pool: query_pool,
            r_timestamps: [(0, 0); MAX_FRAMES_IN_FLIGHT],
            r_timestamps_valid: [false; MAX_FRAMES_IN_FLIGHT],
            r_global_tex: (0..MAX_GLOBAL_SLOTS).map(|_| None).collect(),
            r_global_buf: (0..MAX_GLOBAL_SLOTS).map(|_| None).collect(),
            r_transition_queue: Mutex::new(Vec::new()),
            r_pass: None,
            r_default_tex: None,
            r_next_tex_id: AtomicU16::new(1),
            r_next_mesh_id: AtomicU16::new(1),
            r_next_material_id: AtomicU16::new(1),
        };

        // materials fall back to this for any texture slot the caller
        // never set, which is also the shader's declared default
        let white = [255u8; 4];
        ret.r_default_tex = Some(ret.create_texture(
            vk::Format::R8G8B8A8_UNORM,
            TexFlags::READABLE,
            &SamplerSettings::default(),
            (1, 1, 1),
            1,
            1,
            1,
            Some(&TexData {
                data: &white,
                mip_count: 1,
                layer_count: 1,
            }),
        )?);

        Ok(ret)
    }

    pub fn device_lost(&self) -> bool {
        self.r_dev.is_lost()
    }

    // ------------------------------------------------------------------
    // threads

    /// Register the calling thread for command recording.
    pub fn thread_init(&self) -> Result<()> {
        cmd::thread_init(&self.r_dev)
    }

    /// Flush and unregister the calling thread.
    pub fn thread_shutdown(&self) {
        cmd::thread_shutdown(&self.r_dev);
    }

    /// Number of registered render threads, mostly for tests and
    /// diagnostics.
    pub fn thread_count(&self) -> usize {
        cmd::thread_count()
    }

    // ------------------------------------------------------------------
    // resources

    pub fn load_shader(&self, bytes: &[u8]) -> Result<Arc<ShaderFile>> {
        ShaderFile::load(bytes)
    }

    pub fn create_texture(
        &self,
        format: vk::Format,
        flags: TexFlags,
        sampler: &SamplerSettings,
        size: (u32, u32, u32),
        mip_count: u32,
        layer_count: u32,
        samples: u32,
        data: Option<&TexData>,
    ) -> Result<Arc<Texture>> {
        let samples = match samples {
            2 => vk::SampleCountFlags::TYPE_2,
            4 => vk::SampleCountFlags::TYPE_4,
            8 => vk::SampleCountFlags::TYPE_8,
            _ => vk::SampleCountFlags::TYPE_1,
        };
        Texture::new(
            &self.r_dev,
            format,
            flags,
            sampler,
            size,
            mip_count,
            layer_count,
            samples,
            self.r_next_tex_id.fetch_add(1, Ordering::Relaxed),
            data,
        )
    }

    pub fn create_sampler(&self, settings: &SamplerSettings) -> Result<Arc<Sampler>> {
        Sampler::new(&self.r_dev, settings)
    }

    pub fn create_buffer(
        &self,
        data: Option<&[u8]>,
        size: u64,
        ty: BufferType,
        usage: BufferUse,
    ) -> Result<Arc<Buffer>> {
        Buffer::new(&self.r_dev, data, size, ty, usage)
    }

    /// Grow-or-update helper, see Buffer::ensure.
    pub fn ensure_buffer(
        &self,
        slot: &mut Option<Arc<Buffer>>,
        data: &[u8],
        ty: BufferType,
        usage: BufferUse,
    ) -> Result<bool> {
        Buffer::ensure(&self.r_dev, slot, data, ty, usage)
    }

    pub fn create_mesh(
        &self,
        components: &[VertexComponent],
        index_type: vk::IndexType,
        vert_data: &[u8],
        vert_count: u32,
        index_data: Option<&[u8]>,
        index_count: u32,
    ) -> Result<Mesh> {
        Mesh::new(
            &self.r_dev,
            &self.r_pipe,
            components,
            index_type,
            vert_data,
            vert_count,
            index_data,
            index_count,
            self.r_next_mesh_id.fetch_add(1, Ordering::Relaxed),
        )
    }

    pub fn create_material(&self, info: &MaterialInfo) -> Result<Material> {
        Material::new(
            &self.r_dev,
            &self.r_pipe,
            info,
            self.r_default_tex.as_ref(),
            self.r_next_material_id.fetch_add(1, Ordering::Relaxed),
        )
    }

    pub fn create_compute(&self, shader: Arc<ShaderFile>) -> Result<Compute> {
        if !shader.is_compute() {
            return Err(SquallError::INVALID_FORMAT);
        }
        // build the pipeline eagerly so dispatch never compiles
        self.r_pipe.get_compute(&self.r_dev, &shader)?;
        Ok(Compute { c_shader: shader })
    }

    /// Wrap a windowing-system surface in a swapchain.
    pub fn create_surface(&self, surface: vk::SurfaceKHR) -> Result<Surface> {
        Surface::new(&self.r_dev, surface)
    }

    // ------------------------------------------------------------------
    // globals

    /// Bind a texture to a global slot. Global texture transitions
    /// are deferred to the next begin_pass since this may be called
    /// outside any batch. Passing None clears the slot and queues
    /// nothing.
    pub fn set_global_texture(&mut self, slot: u32, tex: Option<&Arc<Texture>>) {
        if slot as usize >= MAX_GLOBAL_SLOTS {
            log::error!("global texture slot {} out of range", slot);
            return;
        }
        self.r_global_tex[slot as usize] = tex.cloned();
        if let Some(tex) = tex {
            let kind = match tex.flags().contains(TexFlags::COMPUTE) {
                true => TransitionKind::Storage,
                false => TransitionKind::ShaderRead,
            };
            self.queue_transition(tex, kind);
        }
    }

    pub fn set_global_constants(&mut self, slot: u32, buffer: Option<&Arc<Buffer>>) {
        if slot as usize >= MAX_GLOBAL_SLOTS {
            log::error!("global constant slot {} out of range", slot);
            return;
        }
        self.r_global_buf[slot as usize] = buffer.cloned();
    }

    /// Queue a layout transition for the next begin_pass, folding
    /// duplicates together and keeping the stronger kind.
    fn queue_transition(&self, tex: &Arc<Texture>, kind: TransitionKind) {
        let mut queue = self.r_transition_queue.lock().unwrap();
        for (queued, queued_kind) in queue.iter_mut() {
            if Arc::ptr_eq(queued, tex) {
                if kind > *queued_kind {
                    *queued_kind = kind;
                }
                return;
            }
        }
        queue.push((tex.clone(), kind));
    }

    /// Emit every queued barrier. Must run outside a render pass,
    /// which is why begin_pass calls it right before vkCmdBeginRenderPass.
    fn flush_texture_transitions(&self, cbuf: vk::CommandBuffer) {
        let queue: Vec<_> = self.r_transition_queue.lock().unwrap().drain(..).collect();
        for (tex, kind) in queue {
            match kind {
                TransitionKind::ShaderRead => tex.transition_for_shader_read(
                    cbuf,
                    vk::PipelineStageFlags::VERTEX_SHADER
                        | vk::PipelineStageFlags::FRAGMENT_SHADER,
                ),
                TransitionKind::Storage => tex.transition_for_storage(cbuf),
            }
        }
    }

    // ------------------------------------------------------------------
    // frame

    /// Open this thread's command batch for the frame and write the
    /// start timestamp.
    pub fn frame_begin(&mut self) -> Result<()> {
        if self.r_dev.is_lost() {
            return Err(SquallError::DEVICE_LOST);
        }

        self.r_frame_serial += 1;
        let thread = cmd::current_thread()?;
        let ctx = thread.begin(&self.r_dev)?;

        if self.r_query_pool != vk::QueryPool::null() {
            let first = self.r_flight_idx as u32 * 2;
            unsafe {
                self.r_dev
                    .dev
                    .cmd_reset_query_pool(ctx.cbuf, self.r_query_pool, first, 2);
                self.r_dev.dev.cmd_write_timestamp(
                    ctx.cbuf,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    self.r_query_pool,
                    first,
                );
            }
        }

        Ok(())
    }

    /// Close the batch, submit with every surface's semaphores, and
    /// hand each surface a future for the frame. Also advances the
    /// flight ring and collects the timestamps of the frame that is
    /// now MAX_FRAMES_IN_FLIGHT behind us.
    pub fn frame_end(&mut self, surfaces: &mut [&mut Surface]) -> Result<()> {
        if self.r_pass.is_some() {
            log::error!("frame_end called inside an open render pass");
            return Err(SquallError::INVALID);
        }

        let dev = self.r_dev.clone();
        let thread = cmd::current_thread()?;
        let ctx = thread.acquire(&dev)?;

        if self.r_query_pool != vk::QueryPool::null() {
            unsafe {
                dev.dev.cmd_write_timestamp(
                    ctx.cbuf,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    self.r_query_pool,
                    self.r_flight_idx as u32 * 2 + 1,
                );
            }
        }

        // surface images go to PRESENT_SRC in this batch
        let mut wait_semas = Vec::new();
        let mut wait_stages = Vec::new();
        let mut signal_semas = Vec::new();
        for surface in surfaces.iter() {
            let tex = surface.current_tex();
            tex.transition(
                ctx.cbuf,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
            );
            wait_semas.push(surface.acquire_sema());
            wait_stages.push(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
            signal_semas.push(surface.submit_sema());
        }

        thread.release(&dev)?;
        let future = thread.end_submit(&dev, &wait_semas, &wait_stages, &signal_semas)?;

        for surface in surfaces.iter_mut() {
            surface.store_frame_future(future.clone());
        }

        self.r_flight_idx = (self.r_flight_idx + 1) % MAX_FRAMES_IN_FLIGHT;

        // the slot we just advanced onto carries the timestamps of
        // the frame submitted MAX_FRAMES_IN_FLIGHT ago
        if self.r_query_pool != vk::QueryPool::null()
            && self.r_frame_serial >= MAX_FRAMES_IN_FLIGHT as u64
        {
            let first = self.r_flight_idx as u32 * 2;
            let mut results = [0u64; 2];
            let ok = unsafe {
                dev.dev.get_query_pool_results(
                    self.r_query_pool,
                    first,
                    2,
                    &mut results,
                    vk::QueryResultFlags::TYPE_64,
                )
            };
            match ok {
                Ok(()) => {
                    self.r_timestamps[self.r_flight_idx] = (results[0], results[1]);
                    self.r_timestamps_valid[self.r_flight_idx] = true;
                }
                Err(_) => self.r_timestamps_valid[self.r_flight_idx] = false,
            }
        }

        Ok(())
    }

    /// GPU time of the most recently completed measured frame, or 0
    /// when no measurement is ready.
    pub fn get_gpu_time_ms(&self) -> f32 {
        if !self.r_timestamps_valid[self.r_flight_idx] {
            return 0.0;
        }
        let (start, end) = self.r_timestamps[self.r_flight_idx];
        let ticks = end.saturating_sub(start);
        ticks as f32 * self.r_dev.dev_features.timestamp_period / 1_000_000.0
    }

    // ------------------------------------------------------------------
    // passes

    /// Open a render pass targeting `color`, with optional depth and
    /// MSAA resolve attachments.
    ///
    /// Flushes queued texture transitions, interns the pass key,
    /// fetches the target's cached framebuffer, and leaves the
    /// pipeline cache locked until end_pass.
    pub fn begin_pass(
        &mut self,
        color: &Arc<Texture>,
        depth: Option<&Arc<Texture>>,
        resolve: Option<&Arc<Texture>>,
        clear: ClearMask,
        clear_color: [f32; 4],
        clear_depth: f32,
        clear_stencil: u32,
    ) -> Result<()> {
        if self.r_pass.is_some() {
            log::error!("begin_pass while a pass is already open");
            return Err(SquallError::INVALID);
        }

        let dev = self.r_dev.clone();
        let thread = cmd::current_thread()?;
        let ctx = thread.acquire(&dev)?;
        self.r_pipe.lock();

        // barriers are illegal inside a subpass, queued transitions
        // get their one chance here
        self.flush_texture_transitions(ctx.cbuf);

        let color_load = if clear.contains(ClearMask::COLOR) {
            vk::AttachmentLoadOp::CLEAR
        } else if color.current_layout() == vk::ImageLayout::UNDEFINED {
            vk::AttachmentLoadOp::DONT_CARE
        } else {
            vk::AttachmentLoadOp::LOAD
        };

        let (depth_load, depth_store) = match depth {
            Some(d) => {
                let store = match d.flags().contains(TexFlags::READABLE) {
                    true => vk::AttachmentStoreOp::STORE,
                    false => vk::AttachmentStoreOp::DONT_CARE,
                };
                let load = match clear.contains(ClearMask::DEPTH) {
                    true => vk::AttachmentLoadOp::CLEAR,
                    false => vk::AttachmentLoadOp::LOAD,
                };
                (load, store)
            }
            None => (vk::AttachmentLoadOp::DONT_CARE, vk::AttachmentStoreOp::DONT_CARE),
        };

        let key = PassKey {
            color_format: color.format(),
            depth_format: depth.map(|d| d.format()).unwrap_or(vk::Format::UNDEFINED),
            resolve_format: resolve.map(|r| r.format()).unwrap_or(vk::Format::UNDEFINED),
            samples: color.t_samples,
            color_load,
            depth_load,
            depth_store,
        };

        let pass_idx = match self.r_pipe.register_render_pass(&dev, key) {
            Ok(idx) => idx,
            Err(e) => {
                self.r_pipe.unlock();
                thread.release(&dev)?;
                return Err(e);
            }
        };
        let pass = self.r_pipe.pass(pass_idx);

        // the pass expects color already in attachment layout when it
        // loads, and depth in attachment layout always
        if color_load == vk::AttachmentLoadOp::LOAD {
            color.transition(
                ctx.cbuf,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            );
        }
        if let Some(d) = depth {
            if d.flags().contains(TexFlags::TRANSIENT_DISCARD)
                || !d.flags().contains(TexFlags::READABLE)
            {
                // tile GPUs skip the load entirely for discarded depth
                d.mark_discarded();
            }
            if d.flags().contains(TexFlags::WRITEABLE) || d.flags().contains(TexFlags::RENDER_TARGET)
            {
                d.transition(
                    ctx.cbuf,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                );
            }
        }

        let mut attachments = vec![color.t_view];
        if let Some(r) = resolve {
            attachments.push(r.t_view);
        }
        if let Some(d) = depth {
            attachments.push(d.t_view);
        }

        let (w, h, _) = color.size();
        let framebuffer = match color.framebuffer(
            pass_idx,
            pass,
            &attachments,
            (w, h),
            1,
            depth.is_some(),
        ) {
            Ok(fb) => fb,
            Err(e) => {
                self.r_pipe.unlock();
                thread.release(&dev)?;
                return Err(e);
            }
        };

        // clear values line up with the attachment order
        let mut clear_vals = vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];
        if resolve.is_some() {
            clear_vals.push(vk::ClearValue::default());
        }
        if depth.is_some() {
            clear_vals.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: clear_depth,
                    stencil: clear_stencil,
                },
            });
        }

        let pass_begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: w,
                    height: h,
                },
            })
            .clear_values(&clear_vals);

        unsafe {
            dev.dev
                .cmd_begin_render_pass(ctx.cbuf, &pass_begin_info, vk::SubpassContents::INLINE);
        }

        self.set_viewport_scissor(ctx.cbuf, Rect::new(0, 0, w, h));

        // the pass performs these transitions implicitly, tell the
        // tracker without emitting barriers
        color.transition_notify_layout(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );
        if let Some(r) = resolve {
            r.transition_notify_layout(
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            );
        }
        if let Some(d) = depth {
            d.transition_notify_layout(
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );
        }

        self.r_pass = Some(PassState {
            ctx,
            color: color.clone(),
            depth: depth.cloned(),
            resolve: resolve.cloned(),
            pass_idx,
            prev_pipeline: vk::Pipeline::null(),
        });

        Ok(())
    }

    /// Close the current render pass and settle readable targets into
    /// shader read layout.
    pub fn end_pass(&mut self) -> Result<()> {
        let pass = match self.r_pass.take() {
            Some(p) => p,
            None => {
                log::error!("end_pass without begin_pass");
                return Err(SquallError::INVALID);
            }
        };
        let dev = self.r_dev.clone();

        unsafe {
            dev.dev.cmd_end_render_pass(pass.ctx.cbuf);
        }

        if pass.color.flags().contains(TexFlags::READABLE) {
            pass.color
                .transition_for_shader_read(pass.ctx.cbuf, vk::PipelineStageFlags::FRAGMENT_SHADER);
        }
        if let Some(r) = pass.resolve.as_ref() {
            if r.flags().contains(TexFlags::READABLE) {
                r.transition_for_shader_read(pass.ctx.cbuf, vk::PipelineStageFlags::FRAGMENT_SHADER);
            }
        }
        if let Some(d) = pass.depth.as_ref() {
            // multisampled depth cannot be resolved into a sampled
            // read here, only single sample depth settles
            if d.flags().contains(TexFlags::READABLE)
                && d.t_samples == vk::SampleCountFlags::TYPE_1
            {
                d.transition(
                    pass.ctx.cbuf,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::AccessFlags::SHADER_READ,
                );
            }
        }

        let thread = cmd::current_thread()?;
        thread.release(&dev)?;
        self.r_pipe.unlock();
        Ok(())
    }

    /// Set the viewport on the current pass.
    pub fn set_viewport(&mut self, rect: Rect) -> Result<()> {
        let pass = self.r_pass.as_ref().ok_or(SquallError::INVALID)?;
        unsafe {
            self.r_dev.dev.cmd_set_viewport(
                pass.ctx.cbuf,
                0,
                &[vk::Viewport {
                    x: rect.x as f32,
                    y: rect.y as f32,
                    width: rect.w as f32,
                    height: rect.h as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
        }
        Ok(())
    }

    /// Set the scissor on the current pass.
    pub fn set_scissor(&mut self, rect: Rect) -> Result<()> {
        let pass = self.r_pass.as_ref().ok_or(SquallError::INVALID)?;
        unsafe {
            self.r_dev.dev.cmd_set_scissor(
                pass.ctx.cbuf,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D {
                        x: rect.x,
                        y: rect.y,
                    },
                    extent: vk::Extent2D {
                        width: rect.w,
                        height: rect.h,
                    },
                }],
            );
        }
        Ok(())
    }

    fn set_viewport_scissor(&self, cbuf: vk::CommandBuffer, rect: Rect) {
        unsafe {
            self.r_dev.dev.cmd_set_viewport(
                cbuf,
                0,
                &[vk::Viewport {
                    x: rect.x as f32,
                    y: rect.y as f32,
                    width: rect.w as f32,
                    height: rect.h as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            self.r_dev.dev.cmd_set_scissor(
                cbuf,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D {
                        x: rect.x,
                        y: rect.y,
                    },
                    extent: vk::Extent2D {
                        width: rect.w,
                        height: rect.h,
                    },
                }],
            );
        }
    }

    // ------------------------------------------------------------------
    // drawing

    /// Draw a sorted render list.
    ///
    /// Uploads the per-frame data into this thread's bump buffers,
    /// then walks the list in batch runs, emitting one draw per run.
    pub fn draw(
        &mut self,
        list: &RenderList,
        sys_data: &[u8],
        instance_multiplier: u32,
    ) -> Result<()> {
        if list.is_empty() {
            return Ok(());
        }
        if self.r_pass.is_none() {
            log::error!("draw outside of a render pass");
            return Err(SquallError::INVALID);
        }

        let dev = self.r_dev.clone();
        let thread = cmd::current_thread()?;
        let ctx = thread.acquire(&dev)?;

        let sys_slice = thread.alloc_const(&dev, self.r_flight_idx, self.r_frame_serial, sys_data)?;
        let material_slice = thread.alloc_const(
            &dev,
            self.r_flight_idx,
            self.r_frame_serial,
            &list.l_material_data,
        )?;

        let batches = list.compute_batches();
        for batch in batches {
            let item = &list.l_items[batch.start];

            // each batch's instance span gets its own aligned slice
            let span_start = item.instance_offset as usize;
            let mut span_end = span_start;
            for it in &list.l_items[batch.start..batch.end] {
                span_end = span_end.max((it.instance_offset + it.instance_data_size) as usize);
            }
            let instance_slice = thread.alloc_storage(
                &dev,
                self.r_flight_idx,
                self.r_frame_serial,
                &list.l_instance_data[span_start..span_end],
            )?;

            let total_instances = batch.instance_count * instance_multiplier.max(1);
            if let Err(e) = self.draw_one(
                &ctx,
                item,
                &sys_slice,
                &material_slice,
                &instance_slice,
                total_instances,
            ) {
                // a bad draw is skipped, the frame goes on
                log::error!("skipping draw batch: {:?}", e);
            }
        }

        thread.release(&dev)
    }

    /// A lighter path for UI and one-shot draws that skips sorting
    /// and batching entirely.
    pub fn draw_mesh_immediate(
        &mut self,
        mesh: &Mesh,
        material: &Material,
        first_index: u32,
        index_count: u32,
        vertex_offset: i32,
        instance_count: u32,
    ) -> Result<()> {
        if self.r_pass.is_none() {
            log::error!("draw_mesh_immediate outside of a render pass");
            return Err(SquallError::INVALID);
        }

        let mut list = RenderList::new();
        list.add(mesh, material, &[], 0, instance_count.max(1));
        {
            let item = &mut list.l_items[0];
            item.first_index = first_index;
            if index_count > 0 {
                item.index_count = index_count;
            }
            item.vertex_offset = vertex_offset;
        }

        let dev = self.r_dev.clone();
        let thread = cmd::current_thread()?;
        let ctx = thread.acquire(&dev)?;

        let material_slice = thread.alloc_const(
            &dev,
            self.r_flight_idx,
            self.r_frame_serial,
            &list.l_material_data,
        )?;

        let item = &list.l_items[0];
        let ret = self.draw_one(
            &ctx,
            item,
            &BumpSlice::default(),
            &material_slice,
            &BumpSlice::default(),
            instance_count.max(1),
        );

        thread.release(&dev)?;
        ret
    }

    /// Record one batched draw: pipeline, descriptors, vertex state,
    /// and the draw call itself.
    fn draw_one(
        &mut self,
        ctx: &CmdCtx,
        item: &crate::list::RenderItem,
        sys_slice: &BumpSlice,
        material_slice: &BumpSlice,
        instance_slice: &BumpSlice,
        instance_count: u32,
    ) -> Result<()> {
        let dev = self.r_dev.clone();
        let (pass_idx, prev_pipeline) = {
            let pass = self.r_pass.as_ref().unwrap();
            (pass.pass_idx, pass.prev_pipeline)
        };

        let pipeline = self.r_pipe.get_pipeline(
            &dev,
            item.pipeline_material_idx,
            pass_idx,
            item.pipeline_vert_idx,
        )?;
        let (pipeline_layout, set_layout) = self.r_pipe.material_layouts(item.pipeline_material_idx);

        // compose descriptor writes: the three bump slices plus every
        // regular bind record
        let mut writes = Vec::new();
        if let Some(slot) = item.global_slot {
            if item.param_buffer_size > 0 {
                writes.push(DescWrite::UniformBuffer {
                    slot,
                    buffer: material_slice.buffer,
                    offset: material_slice.offset + item.param_data_offset as u64,
                    range: item.param_buffer_size as u64,
                });
            }
        }
        if let Some(slot) = item.system_slot {
            if sys_slice.is_valid() {
                writes.push(DescWrite::UniformBuffer {
                    slot,
                    buffer: sys_slice.buffer,
                    offset: sys_slice.offset,
                    range: sys_slice.size,
                });
            }
        }
        if let Some(slot) = item.instance_slot {
            if instance_slice.is_valid() {
                writes.push(DescWrite::StorageBuffer {
                    slot,
                    buffer: instance_slice.buffer,
                    offset: instance_slice.offset,
                    range: instance_slice.size,
                });
            }
        }

        let satisfied = dev
            .d_bind_pool
            .with_range(item.bind_start, item.bind_count, |recs| {
                for rec in recs {
                    // slots fed from bump slices were handled above
                    if Some(rec.br_slot) == item.global_slot
                        || Some(rec.br_slot) == item.system_slot
                        || Some(rec.br_slot) == item.instance_slot
                    {
                        continue;
                    }

                    match rec.br_register {
                        // constant buffer
                        3 => {
                            let buf = rec.br_buf.clone().or_else(|| {
                                self.r_global_buf
                                    .get((rec.br_slot - crate::BIND_SHIFT_BUFFER) as usize)
                                    .cloned()
                                    .flatten()
                            });
                            match buf {
                                Some(b) => writes.push(DescWrite::UniformBuffer {
                                    slot: rec.br_slot,
                                    buffer: b.vk_buffer(),
                                    offset: 0,
                                    range: b.size(),
                                }),
                                None => return false,
                            }
                        }
                        // sampled texture
                        4 => {
                            let tex = rec.br_tex.clone().or_else(|| {
                                self.r_global_tex
                                    .get((rec.br_slot - crate::BIND_SHIFT_TEXTURE) as usize)
                                    .cloned()
                                    .flatten()
                            });
                            match tex {
                                Some(t) => {
                                    let sampler = rec
                                        .br_sampler
                                        .as_ref()
                                        .map(|s| s.sp_sampler)
                                        .unwrap_or(t.t_sampler);
                                    writes.push(DescWrite::CombinedImage {
                                        slot: rec.br_slot,
                                        view: t.t_view,
                                        sampler,
                                        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                                    });
                                }
                                None => return false,
                            }
                        }
                        // raw read buffer
                        5 | 6 => match rec.br_buf.as_ref() {
                            Some(b) => writes.push(DescWrite::StorageBuffer {
                                slot: rec.br_slot,
                                buffer: b.vk_buffer(),
                                offset: 0,
                                range: b.size(),
                            }),
                            None => return false,
                        },
                        // storage image
                        7 => match rec.br_tex.as_ref() {
                            Some(t) => writes.push(DescWrite::StorageImage {
                                slot: rec.br_slot,
                                view: t.t_view,
                            }),
                            None => return false,
                        },
                        _ => {}
                    }
                }
                true
            });

        if !satisfied {
            log::error!("draw skipped, a shader-declared binding is unsatisfied");
            return Err(SquallError::MISSING_BINDING);
        }

        unsafe {
            if pipeline != prev_pipeline {
                dev.dev
                    .cmd_bind_pipeline(ctx.cbuf, vk::PipelineBindPoint::GRAPHICS, pipeline);
                self.r_pass.as_mut().unwrap().prev_pipeline = pipeline;
            }

            ctx.slot.with_desc_pool(|pool| {
                bind_descriptor_writes(
                    &dev,
                    ctx.cbuf,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline_layout,
                    set_layout,
                    pool,
                    &writes,
                )
            })?;

            let buffers = &item.vertex_buffers[..item.vertex_buffer_count.max(1) as usize];
            let offsets = vec![0u64; buffers.len()];
            if buffers[0] != vk::Buffer::null() {
                dev.dev
                    .cmd_bind_vertex_buffers(ctx.cbuf, 0, buffers, &offsets);
            }

            if item.index_buffer != vk::Buffer::null() {
                dev.dev
                    .cmd_bind_index_buffer(ctx.cbuf, item.index_buffer, 0, item.index_type);
                dev.dev.cmd_draw_indexed(
                    ctx.cbuf,
                    item.index_count,
                    instance_count,
                    item.first_index,
                    item.vertex_offset,
                    0,
                );
            } else {
                dev.dev
                    .cmd_draw(ctx.cbuf, item.vert_count, instance_count, 0, 0);
            }
        }

        Ok(())
    }

    /// Fullscreen-triangle draw of `material` into `to`.
    ///
    /// A zero-width rect means the whole image, which also lets the
    /// pass skip loading the previous contents. Cubemap and array
    /// targets get a layered framebuffer and one instance per layer,
    /// with the shader routing instances to layers.
    pub fn blit(&mut self, material: &Material, to: &Arc<Texture>, rect: Rect) -> Result<()> {
        if self.r_pass.is_some() {
            log::error!("blit called inside an open render pass");
            return Err(SquallError::INVALID);
        }

        let dev = self.r_dev.clone();
        let thread = cmd::current_thread()?;
        let ctx = thread.acquire(&dev)?;
        self.r_pipe.lock();

        let ret = self.blit_internal(&ctx, material, to, rect);

        self.r_pipe.unlock();
        thread.release(&dev)?;
        ret
    }

    fn blit_internal(
        &mut self,
        ctx: &CmdCtx,
        material: &Material,
        to: &Arc<Texture>,
        rect: Rect,
    ) -> Result<()> {
        let dev = self.r_dev.clone();
        let (w, h, _) = to.size();
        let full = rect.w == 0 || (rect.x == 0 && rect.y == 0 && rect.w == w && rect.h == h);
        let rect = match rect.w {
            0 => Rect::new(0, 0, w, h),
            _ => rect,
        };

        let layered = to.layer_count() > 1;
        let key = PassKey {
            color_format: to.format(),
            depth_format: vk::Format::UNDEFINED,
            resolve_format: vk::Format::UNDEFINED,
            samples: vk::SampleCountFlags::TYPE_1,
            color_load: match full {
                true => vk::AttachmentLoadOp::DONT_CARE,
                false => vk::AttachmentLoadOp::LOAD,
            },
            depth_load: vk::AttachmentLoadOp::DONT_CARE,
            depth_store: vk::AttachmentStoreOp::DONT_CARE,
        };

        if !full {
            to.transition(
                ctx.cbuf,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            );
        }

        let pass_idx = self.r_pipe.register_render_pass(&dev, key)?;
        let pass = self.r_pipe.pass(pass_idx);
        let empty_vert = self.r_pipe.register_vertex_format(&[]);

        let framebuffer = match layered {
            true => {
                // a throwaway layered view and framebuffer, fenced by
                // this batch's destroy list
                let view = to.layered_attachment_view()?;
                let views = [view];
                let info = vk::FramebufferCreateInfo::builder()
                    .render_pass(pass)
                    .attachments(&views)
                    .width(w)
                    .height(h)
                    .layers(to.layer_count());
                let fb = unsafe {
                    dev.dev
                        .create_framebuffer(&info, None)
                        .or(Err(SquallError::COULD_NOT_CREATE_IMAGE))?
                };
                ctx.slot
                    .cs_destroy
                    .push(crate::destroy::DestroyItem::ImageView(view));
                ctx.slot
                    .cs_destroy
                    .push(crate::destroy::DestroyItem::Framebuffer(fb));
                fb
            }
            false => to.framebuffer(pass_idx, pass, &[to.t_view], (w, h), 1, false)?,
        };

        let pass_begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D {
                    x: rect.x,
                    y: rect.y,
                },
                extent: vk::Extent2D {
                    width: rect.w,
                    height: rect.h,
                },
            });

        unsafe {
            dev.dev
                .cmd_begin_render_pass(ctx.cbuf, &pass_begin_info, vk::SubpassContents::INLINE);
        }
        self.set_viewport_scissor(ctx.cbuf, rect);

        // a single-item pass state so draw_one can run
        self.r_pass = Some(PassState {
            ctx: ctx.clone(),
            color: to.clone(),
            depth: None,
            resolve: None,
            pass_idx,
            prev_pipeline: vk::Pipeline::null(),
        });

        let thread = ctx.thread.clone();
        let material_slice = thread.alloc_const(
            &dev,
            self.r_flight_idx,
            self.r_frame_serial,
            material.params(),
        )?;

        let mut list = RenderList::new();
        // no mesh: three synthesized vertices and per-layer instances
        let special = material.special_slots();
        let (bind_start, bind_count) = material.bind_range();
        list.l_items.push(crate::list::RenderItem {
            sort_key: 0,
            vertex_buffers: [vk::Buffer::null(); crate::MAX_VERTEX_BUFFERS],
            vertex_buffer_count: 0,
            index_buffer: vk::Buffer::null(),
            index_type: vk::IndexType::UINT16,
            vert_count: 3,
            first_index: 0,
            index_count: 0,
            vertex_offset: 0,
            pipeline_material_idx: material.pipeline_idx(),
            pipeline_vert_idx: empty_vert,
            bind_start,
            bind_count,
            param_data_offset: 0,
            param_buffer_size: material.params().len() as u32,
            global_slot: special.global,
            system_slot: special.system,
            instance_slot: special.instance,
            instance_offset: 0,
            instance_data_size: 0,
            instance_stride: 0,
            instance_count: 1,
        });

        let instances = match layered {
            true => to.layer_count(),
            false => 1,
        };
        let ret = self.draw_one(
            &ctx,
            &list.l_items[0],
            &BumpSlice::default(),
            &material_slice,
            &BumpSlice::default(),
            instances,
        );

        unsafe {
            dev.dev.cmd_end_render_pass(ctx.cbuf);
        }
        self.r_pass = None;

        to.transition_notify_layout(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );
        if to.flags().contains(TexFlags::READABLE) {
            to.transition_for_shader_read(ctx.cbuf, vk::PipelineStageFlags::FRAGMENT_SHADER);
        }

        ret
    }

    /// Dispatch compute work with a material's bindings.
    pub fn compute_dispatch(
        &mut self,
        compute: &Compute,
        material: &Material,
        x: u32,
        y: u32,
        z: u32,
    ) -> Result<()> {
        let dev = self.r_dev.clone();
        let thread = cmd::current_thread()?;
        let ctx = thread.acquire(&dev)?;

        let (pipeline, layout, set_layout) = self.r_pipe.get_compute(&dev, &compute.c_shader)?;

        // storage images must be GENERAL before the dispatch touches
        // them
        let binds = material.snapshot_binds();
        for rec in binds.iter() {
            if rec.br_register == 7 {
                if let Some(t) = rec.br_tex.as_ref() {
                    t.transition_for_storage(ctx.cbuf);
                }
            }
        }

        let material_slice = thread.alloc_const(
            &dev,
            self.r_flight_idx,
            self.r_frame_serial,
            material.params(),
        )?;

        let special = material.special_slots();
        let mut writes = Vec::new();
        if let Some(slot) = special.global {
            if material_slice.is_valid() {
                writes.push(DescWrite::UniformBuffer {
                    slot,
                    buffer: material_slice.buffer,
                    offset: material_slice.offset,
                    range: material_slice.size,
                });
            }
        }
        for rec in binds.iter() {
            if Some(rec.br_slot) == special.global {
                continue;
            }
            match rec.br_register {
                3 => {
                    if let Some(b) = rec.br_buf.as_ref() {
                        writes.push(DescWrite::UniformBuffer {
                            slot: rec.br_slot,
                            buffer: b.vk_buffer(),
                            offset: 0,
                            range: b.size(),
                        });
                    }
                }
                4 => {
                    if let Some(t) = rec.br_tex.as_ref() {
                        let sampler = rec
                            .br_sampler
                            .as_ref()
                            .map(|s| s.sp_sampler)
                            .unwrap_or(t.t_sampler);
                        writes.push(DescWrite::CombinedImage {
                            slot: rec.br_slot,
                            view: t.t_view,
                            sampler,
                            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        });
                    }
                }
                5 | 6 => {
                    if let Some(b) = rec.br_buf.as_ref() {
                        writes.push(DescWrite::StorageBuffer {
                            slot: rec.br_slot,
                            buffer: b.vk_buffer(),
                            offset: 0,
                            range: b.size(),
                        });
                    }
                }
                7 => {
                    if let Some(t) = rec.br_tex.as_ref() {
                        writes.push(DescWrite::StorageImage {
                            slot: rec.br_slot,
                            view: t.t_view,
                        });
                    }
                }
                _ => {}
            }
        }

        unsafe {
            dev.dev
                .cmd_bind_pipeline(ctx.cbuf, vk::PipelineBindPoint::COMPUTE, pipeline);
        }
        ctx.slot.with_desc_pool(|pool| {
            bind_descriptor_writes(
                &dev,
                ctx.cbuf,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                set_layout,
                pool,
                &writes,
            )
        })?;
        unsafe {
            dev.dev.cmd_dispatch(ctx.cbuf, x, y, z);
        }

        thread.release(&dev)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.r_dev.wait_idle();

        // drain every thread's pending work and destruction first, so
        // the resource drops below can destroy immediately
        cmd::shutdown_all(&self.r_dev);

        self.r_pass = None;
        self.r_global_tex.clear();
        self.r_global_buf.clear();
        self.r_transition_queue.lock().unwrap().clear();
        self.r_default_tex = None;

        self.r_pipe.destroy(&self.r_dev);

        unsafe {
            if self.r_query_pool != vk::QueryPool::null() {
                self.r_dev.dev.destroy_query_pool(self.r_query_pool, None);
            }
        }
    }
}
