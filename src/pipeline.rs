// The pipeline and render pass cache
//
// Three keyed tables with stable integer ids: render pass keys,
// vertex format descriptors, and material entries (shader identity
// plus fixed function state, owning the descriptor set layout and
// pipeline layout derived from the shader's reflection). A graphics
// pipeline is compiled and interned per (material, pass, vertex
// format) triple.
//
// The whole cache sits behind one lock that callers hold open for the
// duration of a render pass, so intra-pass lookups never contend. The
// lock is reentrant for its owner because resource registration can
// happen mid-pass.

use ash::vk;

use crate::device::Device;
use crate::material::{
    BlendState, CullMode, DepthTest, FrontFace, MaterialState, PolygonMode, StencilOp,
    StencilState, Topology, WriteMask,
};
use crate::mesh::vertex_stride;
use crate::shader::{
    RegisterType, ShaderFile, ShaderStage, VertexComponent, STAGE_BIT_COMPUTE, STAGE_BIT_PIXEL,
    STAGE_BIT_VERTEX,
};
use crate::{Result, SquallError};

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::io::Cursor;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

/// Everything that determines a render pass compatibility class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PassKey {
    pub color_format: vk::Format,
    /// UNDEFINED when the pass has no depth attachment
    pub depth_format: vk::Format,
    /// UNDEFINED when the pass does not resolve
    pub resolve_format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub color_load: vk::AttachmentLoadOp,
    pub depth_load: vk::AttachmentLoadOp,
    pub depth_store: vk::AttachmentStoreOp,
}

impl PassKey {
    pub fn has_depth(&self) -> bool {
        self.depth_format != vk::Format::UNDEFINED
    }

    pub fn has_resolve(&self) -> bool {
        self.resolve_format != vk::Format::UNDEFINED
    }
}

/// One registered material: the state tuple plus the layouts and
/// shader modules everything compiled from it shares.
struct MaterialEntry {
    shader: Arc<ShaderFile>,
    state: MaterialState,
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    vert_module: vk::ShaderModule,
    frag_module: vk::ShaderModule,
}

struct ComputeEntry {
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    module: vk::ShaderModule,
    pipeline: vk::Pipeline,
}

struct CacheInner {
    passes: Vec<(PassKey, vk::RenderPass)>,
    vert_formats: Vec<Vec<VertexComponent>>,
    materials: Vec<MaterialEntry>,
    /// (shader identity, state tuple) to material index
    material_lookup: HashMap<(usize, MaterialState), u32>,
    pipelines: HashMap<(u32, u32, u32), vk::Pipeline>,
    /// shader identity to compute entry
    compute: HashMap<usize, ComputeEntry>,
}

struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// The cache. See the module comment for the locking story.
pub(crate) struct PipelineCache {
    pc_lock: Mutex<LockState>,
    pc_cv: Condvar,
    pc_inner: UnsafeCell<CacheInner>,
}

unsafe impl Sync for PipelineCache {}
unsafe impl Send for PipelineCache {}

impl PipelineCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pc_lock: Mutex::new(LockState {
                owner: None,
                depth: 0,
            }),
            pc_cv: Condvar::new(),
            pc_inner: UnsafeCell::new(CacheInner {
                passes: Vec::new(),
                vert_formats: Vec::new(),
                materials: Vec::new(),
                material_lookup: HashMap::new(),
                pipelines: HashMap::new(),
                compute: HashMap::new(),
            }),
        })
    }

    /// Take the cache lock for the calling thread. Reentrant: a
    /// thread that already owns the lock just deepens it, which is
    /// what lets materials register mid-pass.
    pub fn lock(&self) {
        let me = std::thread::current().id();
        let mut state = self.pc_lock.lock().unwrap();
        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }
        while state.owner.is_some() {
            state = self.pc_cv.wait(state).unwrap();
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    pub fn unlock(&self) {
        let me = std::thread::current().id();
        let mut state = self.pc_lock.lock().unwrap();
        if state.owner != Some(me) {
            log::error!("pipeline cache unlocked by a non-owning thread");
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.pc_cv.notify_one();
        }
    }

    /// Run `f` with the table contents, taking the lock if the caller
    /// does not already hold it.
    fn with<R, F: FnOnce(&mut CacheInner) -> R>(&self, f: F) -> R {
        self.lock();
        let ret = f(unsafe { &mut *self.pc_inner.get() });
        self.unlock();
        ret
    }

    /// Intern a render pass key, building the VkRenderPass on first
    /// sight. Returns the stable pass id.
    pub fn register_render_pass(&self, dev: &Device, key: PassKey) -> Result<u32> {
        self.with(|inner| {
            if let Some(idx) = inner.passes.iter().position(|(k, _)| *k == key) {
                return Ok(idx as u32);
            }
            let pass = build_render_pass(dev, &key)?;
            inner.passes.push((key, pass));
            Ok(inner.passes.len() as u32 - 1)
        })
    }

    pub fn pass(&self, idx: u32) -> vk::RenderPass {
        self.with(|inner| inner.passes[idx as usize].1)
    }

    /// Intern a vertex format descriptor. Pure table work, no vulkan
    /// objects involved until a pipeline is built from it.
    pub fn register_vertex_format(&self, components: &[VertexComponent]) -> u32 {
        self.with(|inner| {
            if let Some(idx) = inner
                .vert_formats
                .iter()
                .position(|f| f.as_slice() == components)
            {
                return idx as u32;
            }
            inner.vert_formats.push(components.to_vec());
            inner.vert_formats.len() as u32 - 1
        })
    }

    /// Register a (shader, state) material key. Logically identical
    /// materials share the entry and therefore every pipeline built
    /// from it.
    pub fn register_material(
        &self,
        dev: &Arc<Device>,
        shader: &Arc<ShaderFile>,
        state: &MaterialState,
    ) -> Result<u32> {
        let identity = Arc::as_ptr(shader) as usize;
        self.with(|inner| {
            if let Some(idx) = inner.material_lookup.get(&(identity, *state)) {
                return Ok(*idx);
            }

            let set_layout = build_set_layout(dev, shader)?;
            let layout = build_pipeline_layout(dev, set_layout)?;
            let vert_module = build_shader_module(dev, shader, ShaderStage::Vertex)?;
            let frag_module = build_shader_module(dev, shader, ShaderStage::Pixel)?;

            inner.materials.push(MaterialEntry {
                shader: shader.clone(),
                state: *state,
                set_layout,
                layout,
                vert_module,
                frag_module,
            });
            let idx = inner.materials.len() as u32 - 1;
            inner.material_lookup.insert((identity, *state), idx);
            Ok(idx)
        })
    }

    /// Layouts for descriptor composition at draw time.
    pub fn material_layouts(&self, idx: u32) -> (vk::PipelineLayout, vk::DescriptorSetLayout) {
        self.with(|inner| {
            let entry = &inner.materials[idx as usize];
            (entry.layout, entry.set_layout)
        })
    }

    /// Look up or build the pipeline for a key triple.
    ///
    /// Pure up to insertion: the same triple always returns the same
    /// pipeline until the cache is destroyed.
    pub fn get_pipeline(
        &self,
        dev: &Device,
        material_idx: u32,
        pass_idx: u32,
        vert_idx: u32,
    ) -> Result<vk::Pipeline> {
        self.with(|inner| {
            let key = (material_idx, pass_idx, vert_idx);
            if let Some(pipeline) = inner.pipelines.get(&key) {
                return Ok(*pipeline);
            }

            let entry = &inner.materials[material_idx as usize];
            let (pass_key, pass) = inner.passes[pass_idx as usize];
            let components = &inner.vert_formats[vert_idx as usize];

            let pipeline = build_graphics_pipeline(dev, entry, &pass_key, pass, components)?;
            inner.pipelines.insert(key, pipeline);
            Ok(pipeline)
        })
    }

    /// Compute pipeline for a shader, built once.
    pub fn get_compute(
        &self,
        dev: &Arc<Device>,
        shader: &Arc<ShaderFile>,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout, vk::DescriptorSetLayout)> {
        let identity = Arc::as_ptr(shader) as usize;
        self.with(|inner| {
            if let Some(entry) = inner.compute.get(&identity) {
                return Ok((entry.pipeline, entry.layout, entry.set_layout));
            }

            let set_layout = build_set_layout(dev, shader)?;
            let layout = build_pipeline_layout(dev, set_layout)?;
            let module = build_shader_module(dev, shader, ShaderStage::Compute)?;

            let entry_name = CString::new("main").unwrap();
            let stage = vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(module)
                .name(&entry_name)
                .build();
            let info = vk::ComputePipelineCreateInfo::builder()
                .stage(stage)
                .layout(layout)
                .build();

            let pipeline = unsafe {
                dev.dev
                    .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                    .map_err(|_| SquallError::COULD_NOT_CREATE_PIPELINE)?[0]
            };

            inner.compute.insert(
                identity,
                ComputeEntry {
                    set_layout,
                    layout,
                    module,
                    pipeline,
                },
            );
            Ok((pipeline, layout, set_layout))
        })
    }

    /// Destroy every cached vulkan object. The device must be idle.
    pub fn destroy(&self, dev: &Device) {
        self.with(|inner| unsafe {
            for (_, pipeline) in inner.pipelines.drain() {
                dev.dev.destroy_pipeline(pipeline, None);
            }
            for (_, entry) in inner.compute.drain() {
                dev.dev.destroy_pipeline(entry.pipeline, None);
                dev.dev.destroy_shader_module(entry.module, None);
                dev.dev.destroy_pipeline_layout(entry.layout, None);
                dev.dev.destroy_descriptor_set_layout(entry.set_layout, None);
            }
            for entry in inner.materials.drain(..) {
                dev.dev.destroy_shader_module(entry.vert_module, None);
                dev.dev.destroy_shader_module(entry.frag_module, None);
                dev.dev.destroy_pipeline_layout(entry.layout, None);
                dev.dev.destroy_descriptor_set_layout(entry.set_layout, None);
            }
            inner.material_lookup.clear();
            for (_, pass) in inner.passes.drain(..) {
                dev.dev.destroy_render_pass(pass, None);
            }
            inner.vert_formats.clear();
        });
    }
}

/// Build the one-subpass render pass for a key. Attachment order is
/// color, resolve, depth, matching the framebuffer attachment lists
/// the renderer assembles.
fn build_render_pass(dev: &Device, key: &PassKey) -> Result<vk::RenderPass> {
    let mut attachments = Vec::new();

    // color: callers transition to shader read themselves after the
    // pass ends, so the pass leaves it as an attachment
    attachments.push(vk::AttachmentDescription {
        format: key.color_format,
        samples: key.samples,
        load_op: key.color_load,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: match key.color_load == vk::AttachmentLoadOp::LOAD {
            true => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            false => vk::ImageLayout::UNDEFINED,
        },
        final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ..Default::default()
    });

    if key.has_resolve() {
        attachments.push(vk::AttachmentDescription {
            format: key.resolve_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ..Default::default()
        });
    }

    if key.has_depth() {
        attachments.push(vk::AttachmentDescription {
            format: key.depth_format,
            samples: key.samples,
            load_op: key.depth_load,
            store_op: key.depth_store,
            stencil_load_op: key.depth_load,
            stencil_store_op: key.depth_store,
            // the renderer barriers depth into place before the pass
            initial_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        });
    }

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let resolve_refs = [vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: match key.has_resolve() {
            true => 2,
            false => 1,
        },
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if key.has_resolve() {
        subpass = subpass.resolve_attachments(&resolve_refs);
    }
    if key.has_depth() {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }
    let subpasses = [subpass.build()];

    let dependencies = [vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    }];

    let create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe {
        dev.dev
            .create_render_pass(&create_info, None)
            .or(Err(SquallError::COULD_NOT_CREATE_RENDERPASS))
    }
}

fn stage_flags(bits: u8) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if bits & STAGE_BIT_VERTEX != 0 {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if bits & STAGE_BIT_PIXEL != 0 {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if bits & STAGE_BIT_COMPUTE != 0 {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    if flags.is_empty() {
        flags = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
    }
    flags
}

/// Derive the descriptor set layout from a shader's binding set.
///
/// Every register kind maps into its own binding range so one set
/// covers buffers, textures, and UAVs. Bindings are partially bound,
/// global slots unused by a material need not be written.
fn build_set_layout(dev: &Device, shader: &ShaderFile) -> Result<vk::DescriptorSetLayout> {
    let mut bindings = Vec::new();

    for buf in shader.buffers.iter() {
        bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(crate::BIND_SHIFT_BUFFER + buf.bind.slot as u32)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(stage_flags(buf.bind.stage_bits))
                .build(),
        );
    }

    for res in shader.resources.iter() {
        let (ty, slot) = match res.bind.register_type {
            RegisterType::Texture => (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                crate::BIND_SHIFT_TEXTURE + res.bind.slot as u32,
            ),
            RegisterType::ReadBuffer => (
                vk::DescriptorType::STORAGE_BUFFER,
                crate::BIND_SHIFT_TEXTURE + res.bind.slot as u32,
            ),
            RegisterType::ReadWrite => (
                vk::DescriptorType::STORAGE_BUFFER,
                crate::BIND_SHIFT_UAV + res.bind.slot as u32,
            ),
            RegisterType::ReadWriteTex => (
                vk::DescriptorType::STORAGE_IMAGE,
                crate::BIND_SHIFT_UAV + res.bind.slot as u32,
            ),
            _ => continue,
        };
        bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(slot)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(stage_flags(res.bind.stage_bits))
                .build(),
        );
    }

    let binding_flags = vec![vk::DescriptorBindingFlags::PARTIALLY_BOUND; bindings.len()];
    let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
        .binding_flags(&binding_flags)
        .build();

    let layout_flags = match dev.push_loader.is_some() {
        true => vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR,
        false => vk::DescriptorSetLayoutCreateFlags::empty(),
    };

    let mut info = vk::DescriptorSetLayoutCreateInfo::builder()
        .flags(layout_flags)
        .bindings(&bindings)
        .build();
    info.p_next = &mut flags_info as *mut _ as *mut std::ffi::c_void;

    unsafe {
        dev.dev
            .create_descriptor_set_layout(&info, None)
            .or(Err(SquallError::COULD_NOT_CREATE_DESCRIPTOR))
    }
}

fn build_pipeline_layout(
    dev: &Device,
    set_layout: vk::DescriptorSetLayout,
) -> Result<vk::PipelineLayout> {
    let layouts = [set_layout];
    let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&layouts);
    unsafe {
        dev.dev
            .create_pipeline_layout(&info, None)
            .or(Err(SquallError::COULD_NOT_CREATE_PIPELINE))
    }
}

fn build_shader_module(
    dev: &Device,
    shader: &ShaderFile,
    stage: ShaderStage,
) -> Result<vk::ShaderModule> {
    let bytes = shader.spirv_stage(stage).ok_or_else(|| {
        log::error!("shader {} has no spirv for {:?}", shader.name, stage);
        SquallError::INVALID_FORMAT
    })?;

    let code = ash::util::read_spv(&mut Cursor::new(bytes)).or(Err(SquallError::CORRUPT_DATA))?;
    let info = vk::ShaderModuleCreateInfo::builder().code(&code);

    unsafe {
        dev.dev
            .create_shader_module(&info, None)
            .or(Err(SquallError::COULD_NOT_CREATE_PIPELINE))
    }
}

/// Scalar format plus component count to a vulkan vertex format.
fn vertex_vk_format(format: u32, count: u8) -> vk::Format {
    let idx = count.clamp(1, 4) as usize - 1;
    match format {
        1 => [
            vk::Format::R32_SINT,
            vk::Format::R32G32_SINT,
            vk::Format::R32G32B32_SINT,
            vk::Format::R32G32B32A32_SINT,
        ][idx],
        2 => [
            vk::Format::R32_UINT,
            vk::Format::R32G32_UINT,
            vk::Format::R32G32B32_UINT,
            vk::Format::R32G32B32A32_UINT,
        ][idx],
        _ => [
            vk::Format::R32_SFLOAT,
            vk::Format::R32G32_SFLOAT,
            vk::Format::R32G32B32_SFLOAT,
            vk::Format::R32G32B32A32_SFLOAT,
        ][idx],
    }
}

fn vk_compare(test: DepthTest) -> vk::CompareOp {
    match test {
        DepthTest::Never => vk::CompareOp::NEVER,
        DepthTest::Less => vk::CompareOp::LESS,
        DepthTest::Equal => vk::CompareOp::EQUAL,
        DepthTest::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        DepthTest::Greater => vk::CompareOp::GREATER,
        DepthTest::NotEqual => vk::CompareOp::NOT_EQUAL,
        DepthTest::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        DepthTest::Always => vk::CompareOp::ALWAYS,
    }
}

fn vk_stencil_op(op: StencilOp) -> vk::StencilOp {
    match op {
        StencilOp::Keep => vk::StencilOp::KEEP,
        StencilOp::Zero => vk::StencilOp::ZERO,
        StencilOp::Replace => vk::StencilOp::REPLACE,
        StencilOp::IncrementClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOp::DecrementClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOp::Invert => vk::StencilOp::INVERT,
        StencilOp::IncrementWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOp::DecrementWrap => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

fn vk_stencil_state(state: &StencilState) -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: vk_stencil_op(state.fail_op),
        pass_op: vk_stencil_op(state.pass_op),
        depth_fail_op: vk_stencil_op(state.depth_fail_op),
        compare_op: vk_compare(state.compare),
        compare_mask: state.compare_mask,
        write_mask: state.write_mask,
        reference: state.reference,
    }
}

/// The full fixed function chain for one pipeline.
fn build_graphics_pipeline(
    dev: &Device,
    entry: &MaterialEntry,
    pass_key: &PassKey,
    pass: vk::RenderPass,
    components: &[VertexComponent],
) -> Result<vk::Pipeline> {
    let state = &entry.state;
    let entry_name = CString::new("main").unwrap();

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(entry.vert_module)
            .name(&entry_name)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(entry.frag_module)
            .name(&entry_name)
            .build(),
    ];

    // one interleaved stream at binding 0, attribute locations in
    // component order
    let mut vertex_bindings = Vec::new();
    let mut vertex_attributes = Vec::new();
    if !components.is_empty() {
        vertex_bindings.push(vk::VertexInputBindingDescription {
            binding: 0,
            stride: vertex_stride(components),
            input_rate: vk::VertexInputRate::VERTEX,
        });
        let mut offset = 0;
        for (location, c) in components.iter().enumerate() {
            vertex_attributes.push(vk::VertexInputAttributeDescription {
                binding: 0,
                location: location as u32,
                format: vertex_vk_format(c.format, c.count),
                offset,
            });
            offset += crate::mesh::component_byte_size(c);
        }
    }

    let vertex_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&vertex_bindings)
        .vertex_attribute_descriptions(&vertex_attributes);

    let assembly = vk::PipelineInputAssemblyStateCreateInfo {
        topology: match state.topology {
            Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
            Topology::Points => vk::PrimitiveTopology::POINT_LIST,
        },
        ..Default::default()
    };

    // viewport and scissor are dynamic, only the counts matter here
    let viewport_info = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let raster_info = vk::PipelineRasterizationStateCreateInfo {
        cull_mode: match state.cull {
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::None => vk::CullModeFlags::NONE,
        },
        front_face: match state.front_face {
            FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
            FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
        },
        polygon_mode: match state.polygon_mode {
            PolygonMode::Fill => vk::PolygonMode::FILL,
            PolygonMode::Line => vk::PolygonMode::LINE,
            PolygonMode::Point => vk::PolygonMode::POINT,
        },
        line_width: 1.0,
        ..Default::default()
    };

    let multisample_info = vk::PipelineMultisampleStateCreateInfo {
        rasterization_samples: pass_key.samples,
        alpha_to_coverage_enable: state.alpha_to_coverage as u32,
        ..Default::default()
    };

    let default_stencil = StencilState::default();
    let stencil_enable =
        state.stencil_front != default_stencil || state.stencil_back != default_stencil;
    let write_mask = WriteMask::from_bits_truncate(state.write_mask);
    let depth_info = vk::PipelineDepthStencilStateCreateInfo {
        depth_test_enable: (state.depth_test != DepthTest::Always || state.depth_write) as u32,
        depth_write_enable: (state.depth_write && write_mask.contains(WriteMask::DEPTH)) as u32,
        depth_compare_op: vk_compare(state.depth_test),
        stencil_test_enable: stencil_enable as u32,
        front: vk_stencil_state(&state.stencil_front),
        back: vk_stencil_state(&state.stencil_back),
        ..Default::default()
    };

    let mut color_mask = vk::ColorComponentFlags::empty();
    if write_mask.contains(WriteMask::R) {
        color_mask |= vk::ColorComponentFlags::R;
    }
    if write_mask.contains(WriteMask::G) {
        color_mask |= vk::ColorComponentFlags::G;
    }
    if write_mask.contains(WriteMask::B) {
        color_mask |= vk::ColorComponentFlags::B;
    }
    if write_mask.contains(WriteMask::A) {
        color_mask |= vk::ColorComponentFlags::A;
    }

    let blend_attachment = match state.blend {
        BlendState::Off => vk::PipelineColorBlendAttachmentState {
            blend_enable: 0,
            color_write_mask: color_mask,
            ..Default::default()
        },
        BlendState::Alpha => vk::PipelineColorBlendAttachmentState {
            blend_enable: 1,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: color_mask,
        },
        BlendState::Additive => vk::PipelineColorBlendAttachmentState {
            blend_enable: 1,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ONE,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: color_mask,
        },
        BlendState::PremultipliedAlpha => vk::PipelineColorBlendAttachmentState {
            blend_enable: 1,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: color_mask,
        },
    };
    let blend_attachments = [blend_attachment];
    let blend_info =
        vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_info =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_info)
        .input_assembly_state(&assembly)
        .viewport_state(&viewport_info)
        .rasterization_state(&raster_info)
        .multisample_state(&multisample_info)
        .depth_stencil_state(&depth_info)
        .color_blend_state(&blend_info)
        .dynamic_state(&dynamic_info)
        .layout(entry.layout)
        .render_pass(pass)
        .subpass(0)
        .build();

    unsafe {
        dev.dev
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|_| {
                log::error!("could not compile a graphics pipeline");
                SquallError::COULD_NOT_CREATE_PIPELINE
            })
            .map(|pipelines| pipelines[0])
    }
}
