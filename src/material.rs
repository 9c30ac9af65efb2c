// Materials
//
// A material is a shader reference plus the fixed function state half
// of a pipeline key, a parameter cbuffer sized from the shader's
// $Global buffer, and a range of bind records naming the textures and
// buffers the shader reads. Render items snapshot all of this, so a
// material edit never retroactively changes a pending draw.

use crate::bindpool::BindRecord;
use crate::buffer::Buffer;
use crate::device::Device;
use crate::pipeline::PipelineCache;
use crate::shader::{hash_name, RegisterType, ShaderFile, ShaderVarType};
use crate::tex::{Sampler, Texture};
use crate::{Result, SquallError};

use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CullMode {
    Back,
    Front,
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrontFace {
    CounterClockwise,
    Clockwise,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
    LineList,
    Points,
}

/// Comparison used for depth and stencil tests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DepthTest {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlendState {
    Off,
    Alpha,
    Additive,
    PremultipliedAlpha,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub compare: DepthTest,
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilState {
    fn default() -> Self {
        Self {
            compare: DepthTest::Always,
            fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            compare_mask: 0xff,
            write_mask: 0xff,
            reference: 0,
        }
    }
}

bitflags! {
    /// Which outputs a draw may write.
    pub struct WriteMask: u32 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const DEPTH = 1 << 4;
        const RGBA = Self::R.bits | Self::G.bits | Self::B.bits | Self::A.bits;
    }
}

/// The hashable fixed function state tuple. Together with the shader
/// identity this forms the material half of a pipeline key, so
/// logically identical materials share cache entries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MaterialState {
    pub cull: CullMode,
    pub front_face: FrontFace,
    pub polygon_mode: PolygonMode,
    pub topology: Topology,
    pub depth_test: DepthTest,
    pub depth_write: bool,
    pub write_mask: u32,
    pub blend: BlendState,
    pub alpha_to_coverage: bool,
    pub stencil_front: StencilState,
    pub stencil_back: StencilState,
    pub queue_offset: i32,
}

impl Default for MaterialState {
    fn default() -> Self {
        Self {
            cull: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            polygon_mode: PolygonMode::Fill,
            topology: Topology::TriangleList,
            depth_test: DepthTest::Less,
            depth_write: true,
            write_mask: (WriteMask::RGBA | WriteMask::DEPTH).bits,
            blend: BlendState::Off,
            alpha_to_coverage: false,
            stencil_front: StencilState::default(),
            stencil_back: StencilState::default(),
            queue_offset: 0,
        }
    }
}

/// Construction parameters for a material. Everything except the
/// shader has a sensible default.
pub struct MaterialInfo {
    pub shader: Arc<ShaderFile>,
    pub cull: CullMode,
    pub front_face: FrontFace,
    pub polygon_mode: PolygonMode,
    pub topology: Topology,
    pub depth_test: DepthTest,
    pub depth_write: bool,
    pub write_mask: WriteMask,
    pub blend: BlendState,
    pub alpha_to_coverage: bool,
    pub stencil_front: StencilState,
    pub stencil_back: StencilState,
    /// Added to the render queue portion of every sort key using this
    /// material. Transparents draw late by getting a big offset.
    pub queue_offset: i32,
}

impl MaterialInfo {
    pub fn new(shader: Arc<ShaderFile>) -> Self {
        let d = MaterialState::default();
        Self {
            shader,
            cull: d.cull,
            front_face: d.front_face,
            polygon_mode: d.polygon_mode,
            topology: d.topology,
            depth_test: d.depth_test,
            depth_write: d.depth_write,
            write_mask: WriteMask::RGBA | WriteMask::DEPTH,
            blend: d.blend,
            alpha_to_coverage: d.alpha_to_coverage,
            stencil_front: d.stencil_front,
            stencil_back: d.stencil_back,
            queue_offset: d.queue_offset,
        }
    }

    pub(crate) fn state(&self) -> MaterialState {
        MaterialState {
            cull: self.cull,
            front_face: self.front_face,
            polygon_mode: self.polygon_mode,
            topology: self.topology,
            depth_test: self.depth_test,
            depth_write: self.depth_write,
            write_mask: self.write_mask.bits,
            blend: self.blend,
            alpha_to_coverage: self.alpha_to_coverage,
            stencil_front: self.stencil_front,
            stencil_back: self.stencil_back,
            queue_offset: self.queue_offset,
        }
    }
}

pub struct Material {
    mt_dev: Arc<Device>,
    mt_cache: Arc<PipelineCache>,
    mt_shader: Arc<ShaderFile>,
    mt_state: MaterialState,
    /// Parameter cbuffer bytes, sized by the $Global buffer
    mt_params: Vec<u8>,
    mt_bind_start: u32,
    mt_bind_count: u32,
    /// Stable key into the pipeline cache for this shader+state
    mt_pipeline_idx: u32,
    /// Identity for sort keys, unique per created material
    pub(crate) mt_id: u16,
}

impl Material {
    pub(crate) fn new(
        dev: &Arc<Device>,
        cache: &Arc<PipelineCache>,
        info: &MaterialInfo,
        default_tex: Option<&Arc<Texture>>,
        id: u16,
    ) -> Result<Material> {
        let shader = info.shader.clone();
        let state = info.state();

        // the parameter buffer starts out as the shader's declared
        // defaults, or zeroed when it has none
        let mt_params = match shader.global_buffer() {
            Some(global) => {
                let mut params = vec![0u8; global.size as usize];
                if let Some(defaults) = global.defaults.as_ref() {
                    let n = defaults.len().min(params.len());
                    params[..n].copy_from_slice(&defaults[..n]);
                }
                params
            }
            None => Vec::new(),
        };

        // one bind record per declared buffer and resource, in
        // reflection order so slot lookup is just arithmetic
        let bind_count = (shader.buffers.len() + shader.resources.len()) as u32;
        let bind_start = dev.d_bind_pool.alloc(bind_count)?;

        for (i, buf) in shader.buffers.iter().enumerate() {
            dev.d_bind_pool.update(bind_start + i as u32, |rec| {
                rec.br_slot = crate::BIND_SHIFT_BUFFER + buf.bind.slot as u32;
                rec.br_stage_bits = buf.bind.stage_bits;
                rec.br_register = register_code(buf.bind.register_type);
            });
        }
        let res_base = bind_start + shader.buffers.len() as u32;
        for (i, res) in shader.resources.iter().enumerate() {
            let default = match res.bind.register_type {
                RegisterType::Texture => default_tex.cloned(),
                _ => None,
            };
            dev.d_bind_pool.update(res_base + i as u32, |rec| {
                rec.br_slot = match res.bind.register_type {
                    RegisterType::Texture | RegisterType::ReadBuffer => {
                        crate::BIND_SHIFT_TEXTURE + res.bind.slot as u32
                    }
                    RegisterType::ReadWrite | RegisterType::ReadWriteTex => {
                        crate::BIND_SHIFT_UAV + res.bind.slot as u32
                    }
                    _ => crate::BIND_SHIFT_BUFFER + res.bind.slot as u32,
                };
                rec.br_stage_bits = res.bind.stage_bits;
                rec.br_register = register_code(res.bind.register_type);
                rec.br_tex = default;
            });
        }

        let pipeline_idx = cache.register_material(dev, &shader, &state)?;

        Ok(Material {
            mt_dev: dev.clone(),
            mt_cache: cache.clone(),
            mt_shader: shader,
            mt_state: state,
            mt_params,
            mt_bind_start: bind_start,
            mt_bind_count: bind_count,
            mt_pipeline_idx: pipeline_idx,
            mt_id: id,
        })
    }

    pub fn shader(&self) -> &Arc<ShaderFile> {
        &self.mt_shader
    }

    pub(crate) fn pipeline_idx(&self) -> u32 {
        self.mt_pipeline_idx
    }

    pub(crate) fn bind_range(&self) -> (u32, u32) {
        (self.mt_bind_start, self.mt_bind_count)
    }

    pub(crate) fn params(&self) -> &[u8] {
        &self.mt_params
    }

    pub fn queue_offset(&self) -> i32 {
        self.mt_state.queue_offset
    }

    /// Write a named parameter into the cbuffer.
    ///
    /// The write is validated against the reflected variable, a size
    /// mismatch is logged and skipped rather than trusted.
    pub fn set_param(
        &mut self,
        name: &str,
        var_type: ShaderVarType,
        count: u32,
        data: &[u8],
    ) -> Result<()> {
        let hash = hash_name(name);
        let global = match self.mt_shader.global_buffer() {
            Some(g) => g,
            None => return Err(SquallError::INVALID),
        };
        let var = match global.vars.iter().find(|v| v.name_hash == hash) {
            Some(v) => v,
            None => {
                log::error!("no shader parameter named {}", name);
                return Err(SquallError::INVALID);
            }
        };

        let byte_len = var_type.element_size() * count as usize;
        if byte_len > var.size as usize || data.len() < byte_len {
            log::error!(
                "parameter {} write of {} bytes does not fit in {}",
                name,
                byte_len,
                var.size
            );
            return Err(SquallError::INVALID);
        }

        let offset = var.offset as usize;
        self.mt_params[offset..offset + byte_len].copy_from_slice(&data[..byte_len]);
        Ok(())
    }

    /// Bind a texture to the resource named `name`.
    pub fn set_tex(&self, name: &str, tex: &Arc<Texture>) -> Result<()> {
        let index = self.resource_index(name)?;
        self.mt_dev.d_bind_pool.update(index, |rec| {
            rec.br_tex = Some(tex.clone());
            rec.br_buf = None;
        });
        Ok(())
    }

    /// Bind a buffer to the resource or constant buffer named `name`.
    pub fn set_buffer(&self, name: &str, buffer: &Arc<Buffer>) -> Result<()> {
        let index = self.resource_index(name).or_else(|_| self.buffer_index(name))?;
        self.mt_dev.d_bind_pool.update(index, |rec| {
            rec.br_buf = Some(buffer.clone());
            rec.br_tex = None;
        });
        Ok(())
    }

    /// Override the sampler used with the texture named `name`.
    pub fn set_sampler(&self, name: &str, sampler: &Arc<Sampler>) -> Result<()> {
        let index = self.resource_index(name)?;
        self.mt_dev.d_bind_pool.update(index, |rec| {
            rec.br_sampler = Some(sampler.clone());
        });
        Ok(())
    }

    fn resource_index(&self, name: &str) -> Result<u32> {
        let hash = hash_name(name);
        let pos = self
            .mt_shader
            .resources
            .iter()
            .position(|r| r.name_hash == hash)
            .ok_or(SquallError::INVALID)?;
        Ok(self.mt_bind_start + self.mt_shader.buffers.len() as u32 + pos as u32)
    }

    fn buffer_index(&self, name: &str) -> Result<u32> {
        let hash = hash_name(name);
        let pos = self
            .mt_shader
            .buffers
            .iter()
            .position(|b| b.name_hash == hash)
            .ok_or(SquallError::INVALID)?;
        Ok(self.mt_bind_start + pos as u32)
    }

    /// Mutate the pipeline state fields.
    ///
    /// The pipeline cache keys on the state tuple, so any change here
    /// re-registers the material and refreshes its cache index.
    pub fn set_state<F: FnOnce(&mut MaterialInfo)>(&mut self, f: F) -> Result<()> {
        let mut info = MaterialInfo::new(self.mt_shader.clone());
        let s = self.mt_state;
        info.cull = s.cull;
        info.front_face = s.front_face;
        info.polygon_mode = s.polygon_mode;
        info.topology = s.topology;
        info.depth_test = s.depth_test;
        info.depth_write = s.depth_write;
        info.write_mask = WriteMask::from_bits_truncate(s.write_mask);
        info.blend = s.blend;
        info.alpha_to_coverage = s.alpha_to_coverage;
        info.stencil_front = s.stencil_front;
        info.stencil_back = s.stencil_back;
        info.queue_offset = s.queue_offset;

        f(&mut info);
        self.mt_state = info.state();
        self.mt_pipeline_idx =
            self.mt_cache
                .register_material(&self.mt_dev, &self.mt_shader, &self.mt_state)?;
        Ok(())
    }

    /// Slots that are satisfied from bump slices at draw time rather
    /// than from bind records: the $Global parameter buffer and the
    /// $SystemBuffer per-draw constants.
    pub(crate) fn special_slots(&self) -> SpecialSlots {
        let mut ret = SpecialSlots::default();
        for buf in self.mt_shader.buffers.iter() {
            let slot = crate::BIND_SHIFT_BUFFER + buf.bind.slot as u32;
            if buf.name == crate::shader::GLOBAL_BUFFER_NAME {
                ret.global = Some(slot);
            } else if buf.name == crate::shader::SYSTEM_BUFFER_NAME {
                ret.system = Some(slot);
            }
        }
        for res in self.mt_shader.resources.iter() {
            if res.bind.register_type == RegisterType::ReadBuffer
                && res.tags.contains("instance")
            {
                ret.instance = Some(crate::BIND_SHIFT_TEXTURE + res.bind.slot as u32);
            }
        }
        ret
    }

    /// Snapshot bind records for a draw. The pool lock is held for
    /// the copy only.
    pub(crate) fn snapshot_binds(&self) -> Vec<BindRecord> {
        self.mt_dev
            .d_bind_pool
            .with_range(self.mt_bind_start, self.mt_bind_count, |recs| {
                recs.to_vec()
            })
    }
}

/// Descriptor slots filled from bump uploads instead of bind records.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct SpecialSlots {
    pub global: Option<u32>,
    pub system: Option<u32>,
    pub instance: Option<u32>,
}

fn register_code(r: RegisterType) -> u8 {
    match r {
        RegisterType::Default => 0,
        RegisterType::Vertex => 1,
        RegisterType::Index => 2,
        RegisterType::Constant => 3,
        RegisterType::Texture => 4,
        RegisterType::ReadBuffer => 5,
        RegisterType::ReadWrite => 6,
        RegisterType::ReadWriteTex => 7,
    }
}

impl Drop for Material {
    fn drop(&mut self) {
        // the range may still feed an in-flight draw, release it
        // through the destroy walk
        self.mt_dev
            .defer_destroy(crate::destroy::DestroyItem::BindSlots {
                start: self.mt_bind_start,
                count: self.mt_bind_count,
            });
    }
}
