// SKSHADER metadata blobs
//
// Compiled shaders arrive as a single binary blob holding reflection
// data plus per-stage bytecode. Everything else in the renderer keys
// off of this: materials size their parameter buffer from the $Global
// constant buffer, the pipeline cache derives descriptor layouts from
// the bind list, and meshes validate against the vertex inputs.

use crate::{Result, SquallError};

use std::sync::Arc;

/// Magic bytes at the head of every shader blob.
pub const SHADER_MAGIC: &[u8; 8] = b"SKSHADER";
/// The one on-disk version this loader understands.
pub const SHADER_VERSION: u16 = 4;

/// Name of the constant buffer holding per-material parameters.
pub const GLOBAL_BUFFER_NAME: &str = "$Global";
/// Name of the constant buffer the renderer fills with per-draw
/// system data (view matrices and friends, opaque to us).
pub const SYSTEM_BUFFER_NAME: &str = "$SystemBuffer";

const FNV_OFFSET_BASIS: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;

/// FNV-1a 64 over a name's bytes.
///
/// This exact function seeds every lookup in materials and pipelines,
/// so load-time hashes and call-site hashes always agree without any
/// allocation on the lookup path.
pub fn hash_name(name: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for b in name.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Stage bit values carried in `Bind::stage_bits`.
pub const STAGE_BIT_VERTEX: u8 = 1 << 0;
pub const STAGE_BIT_PIXEL: u8 = 1 << 1;
pub const STAGE_BIT_COMPUTE: u8 = 1 << 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Compute,
}

impl ShaderStage {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(ShaderStage::Vertex),
            1 => Ok(ShaderStage::Pixel),
            2 => Ok(ShaderStage::Compute),
            _ => Err(SquallError::CORRUPT_DATA),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderLang {
    Hlsl,
    Spirv,
    Glsl,
    GlslEs,
    GlslWeb,
}

impl ShaderLang {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(ShaderLang::Hlsl),
            1 => Ok(ShaderLang::Spirv),
            2 => Ok(ShaderLang::Glsl),
            3 => Ok(ShaderLang::GlslEs),
            4 => Ok(ShaderLang::GlslWeb),
            _ => Err(SquallError::CORRUPT_DATA),
        }
    }
}

/// Which HLSL register space a binding lives in. The renderer folds
/// all of these into one descriptor set, offset by the BIND_SHIFT
/// constants so b0, t0 and u0 stay distinct.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegisterType {
    Default,
    Vertex,
    Index,
    Constant,
    Texture,
    ReadBuffer,
    ReadWrite,
    ReadWriteTex,
}

impl RegisterType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(RegisterType::Default),
            1 => Ok(RegisterType::Vertex),
            2 => Ok(RegisterType::Index),
            3 => Ok(RegisterType::Constant),
            4 => Ok(RegisterType::Texture),
            5 => Ok(RegisterType::ReadBuffer),
            6 => Ok(RegisterType::ReadWrite),
            7 => Ok(RegisterType::ReadWriteTex),
            _ => Err(SquallError::CORRUPT_DATA),
        }
    }
}

/// One shader binding location.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Bind {
    pub slot: u16,
    pub stage_bits: u8,
    pub register_type: RegisterType,
}

/// Scalar type of a constant buffer variable. Sizes here are the
/// per-element byte widths used by `Material::set_param` validation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderVarType {
    None,
    Int,
    UInt,
    Float,
    Double,
}

impl ShaderVarType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => ShaderVarType::Int,
            2 => ShaderVarType::UInt,
            3 => ShaderVarType::Float,
            4 => ShaderVarType::Double,
            _ => ShaderVarType::None,
        }
    }

    pub fn element_size(&self) -> usize {
        match self {
            ShaderVarType::None => 0,
            ShaderVarType::Int | ShaderVarType::UInt | ShaderVarType::Float => 4,
            ShaderVarType::Double => 8,
        }
    }
}

/// One variable inside a constant buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderVar {
    pub name: String,
    pub name_hash: u64,
    pub extra: String,
    pub offset: u32,
    pub size: u32,
    pub var_type: ShaderVarType,
    pub type_count: u16,
}

/// One constant buffer declared by the shader.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderBuffer {
    pub name: String,
    pub name_hash: u64,
    pub space: u8,
    pub bind: Bind,
    pub size: u32,
    /// Initial contents for the buffer, if the source shader declared
    /// default values. Materials copy this on creation.
    pub defaults: Option<Vec<u8>>,
    pub vars: Vec<ShaderVar>,
}

/// One texture or raw buffer resource declared by the shader.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderResource {
    pub name: String,
    pub name_hash: u64,
    pub value: String,
    pub tags: String,
    pub bind: Bind,
}

/// One element of the vertex input layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexComponent {
    /// Scalar format of the component, see `ShaderVarType` values
    pub format: u32,
    /// How many scalars wide
    pub count: u8,
    pub semantic: u32,
    pub semantic_slot: u8,
}

/// Static instruction statistics for one stage, produced by the
/// offline compiler. Callers use these to pick level of detail.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub total: u32,
    pub tex_read: u32,
    pub dynamic_flow: u32,
}

/// Bytecode for one stage in one language.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderStageBlob {
    pub language: ShaderLang,
    pub stage: ShaderStage,
    pub code: Vec<u8>,
}

/// A fully parsed shader blob.
///
/// Reference counted through `Arc`; materials and the pipeline cache
/// hold references and the file dies when the last holder drops.
#[derive(Debug, PartialEq)]
pub struct ShaderFile {
    pub name: String,
    pub name_hash: u64,
    pub buffers: Vec<ShaderBuffer>,
    pub resources: Vec<ShaderResource>,
    pub vertex_inputs: Vec<VertexComponent>,
    pub ops_vertex: OpCounts,
    pub ops_pixel: OpCounts,
    pub stages: Vec<ShaderStageBlob>,
    /// Index into `buffers` of the `$Global` buffer, or -1 if the
    /// shader declares no per-material parameters.
    pub global_buffer_id: i32,
}

/// Byte offset where the file-level name field starts.
const NAME_OFFSET: usize = 14;
/// Fixed widths of the embedded string fields.
const FILE_NAME_LEN: usize = 256;
const SHORT_NAME_LEN: usize = 32;
const EXTRA_LEN: usize = 64;

/// Little endian cursor over the raw blob.
struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, at: 0 }
    }

    fn skip_to(&mut self, offset: usize) -> Result<()> {
        if offset > self.data.len() {
            return Err(SquallError::CORRUPT_DATA);
        }
        self.at = offset;
        Ok(())
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.at.checked_add(len).ok_or(SquallError::CORRUPT_DATA)?;
        if end > self.data.len() {
            return Err(SquallError::CORRUPT_DATA);
        }
        let ret = &self.data[self.at..end];
        self.at = end;
        Ok(ret)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    /// A fixed-size nul padded string field.
    fn fixed_str(&mut self, len: usize) -> Result<String> {
        let raw = self.bytes(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
        std::str::from_utf8(&raw[..end])
            .map(|s| s.to_string())
            .or(Err(SquallError::CORRUPT_DATA))
    }

    fn bind(&mut self) -> Result<Bind> {
        let slot = self.u16()?;
        let stage_bits = self.u8()?;
        let register_type = RegisterType::from_u8(self.u8()?)?;
        Ok(Bind {
            slot,
            stage_bits,
            register_type,
        })
    }
}

/// Trim a fixed name field to its nul terminator without allocating.
fn trimmed_name(raw: &[u8]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}

impl ShaderFile {
    /// Cheap header check without allocating or parsing the body.
    ///
    /// Returns the on-disk version and the embedded shader name when
    /// the magic matches, and `None` for anything that is not a
    /// shader blob at all. Callers can report a useful error for a
    /// version mismatch before paying for a full load.
    pub fn verify(data: &[u8]) -> Option<(u16, &str)> {
        if data.len() < NAME_OFFSET + FILE_NAME_LEN || &data[0..8] != SHADER_MAGIC {
            return None;
        }
        let version = u16::from_le_bytes([data[8], data[9]]);
        let name = trimmed_name(&data[NAME_OFFSET..NAME_OFFSET + FILE_NAME_LEN]);
        Some((version, name))
    }

    /// Parse a shader blob.
    ///
    /// All name fields are hashed at load time so later lookups are a
    /// single u64 compare. Unknown bytes past the last stage record
    /// are ignored.
    pub fn load(data: &[u8]) -> Result<Arc<ShaderFile>> {
        let (version, _) = ShaderFile::verify(data).ok_or(SquallError::BAD_FORMAT)?;
        if version != SHADER_VERSION {
            return Err(SquallError::OLD_VERSION);
        }

        let mut r = Reader::new(data);
        r.skip_to(10)?;
        let stage_count = r.u32()?;

        // meta follows immediately, leading with the same name field
        // verify() peeks at
        let name = r.fixed_str(FILE_NAME_LEN)?;
        let buffer_count = r.u32()?;
        let resource_count = r.u32()?;
        let vertex_input_count = r.i32()?;
        let ops_vertex = OpCounts {
            total: r.u32()?,
            tex_read: r.u32()?,
            dynamic_flow: r.u32()?,
        };
        let ops_pixel = OpCounts {
            total: r.u32()?,
            tex_read: r.u32()?,
            dynamic_flow: r.u32()?,
        };

        let mut buffers = Vec::with_capacity(buffer_count as usize);
        for _ in 0..buffer_count {
            let bname = r.fixed_str(SHORT_NAME_LEN)?;
            let space = r.u8()?;
            let bind = r.bind()?;
            let size = r.u32()?;
            let var_count = r.u32()?;
            let default_size = r.u32()?;
            let defaults = match default_size {
                0 => None,
                n => Some(r.bytes(n as usize)?.to_vec()),
            };

            let mut vars = Vec::with_capacity(var_count as usize);
            for _ in 0..var_count {
                let vname = r.fixed_str(SHORT_NAME_LEN)?;
                let extra = r.fixed_str(EXTRA_LEN)?;
                let offset = r.u32()?;
                let vsize = r.u32()?;
                let vtype = r.u16()?;
                let type_count = r.u16()?;
                vars.push(ShaderVar {
                    name_hash: hash_name(&vname),
                    name: vname,
                    extra,
                    offset,
                    size: vsize,
                    var_type: ShaderVarType::from_u16(vtype),
                    type_count,
                });
            }

            buffers.push(ShaderBuffer {
                name_hash: hash_name(&bname),
                name: bname,
                space,
                bind,
                size,
                defaults,
                vars,
            });
        }

        let mut vertex_inputs = Vec::new();
        for _ in 0..vertex_input_count.max(0) {
            vertex_inputs.push(VertexComponent {
                format: r.u32()?,
                count: r.u8()?,
                semantic: r.u32()?,
                semantic_slot: r.u8()?,
            });
        }

        let mut resources = Vec::with_capacity(resource_count as usize);
        for _ in 0..resource_count {
            let rname = r.fixed_str(SHORT_NAME_LEN)?;
            let value = r.fixed_str(EXTRA_LEN)?;
            let tags = r.fixed_str(EXTRA_LEN)?;
            let bind = r.bind()?;
            resources.push(ShaderResource {
                name_hash: hash_name(&rname),
                name: rname,
                value,
                tags,
                bind,
            });
        }

        let mut stages = Vec::with_capacity(stage_count as usize);
        for _ in 0..stage_count {
            let language = ShaderLang::from_u32(r.u32()?)?;
            let stage = ShaderStage::from_u32(r.u32()?)?;
            let code_size = r.u32()?;
            let code = r.bytes(code_size as usize)?.to_vec();
            stages.push(ShaderStageBlob {
                language,
                stage,
                code,
            });
        }

        let global_hash = hash_name(GLOBAL_BUFFER_NAME);
        let global_buffer_id = buffers
            .iter()
            .position(|b| b.name_hash == global_hash)
            .map(|i| i as i32)
            .unwrap_or(-1);

        Ok(Arc::new(ShaderFile {
            name_hash: hash_name(&name),
            name,
            buffers,
            resources,
            vertex_inputs,
            ops_vertex,
            ops_pixel,
            stages,
            global_buffer_id,
        }))
    }

    /// The `$Global` buffer, if the shader declares one.
    pub fn global_buffer(&self) -> Option<&ShaderBuffer> {
        match self.global_buffer_id {
            -1 => None,
            id => self.buffers.get(id as usize),
        }
    }

    pub fn find_buffer(&self, name_hash: u64) -> Option<&ShaderBuffer> {
        self.buffers.iter().find(|b| b.name_hash == name_hash)
    }

    pub fn find_resource(&self, name_hash: u64) -> Option<&ShaderResource> {
        self.resources.iter().find(|r| r.name_hash == name_hash)
    }

    /// SPIR-V bytecode for a stage. This renderer only consumes the
    /// spirv language entries, other languages ride along for tooling.
    pub fn spirv_stage(&self, stage: ShaderStage) -> Option<&[u8]> {
        self.stages
            .iter()
            .find(|s| s.stage == stage && s.language == ShaderLang::Spirv)
            .map(|s| s.code.as_slice())
    }

    /// True when any stage declares compute work.
    pub fn is_compute(&self) -> bool {
        self.stages.iter().any(|s| s.stage == ShaderStage::Compute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_vectors() {
        // reference values for the 64 bit FNV-1a parameters
        assert_eq!(hash_name(""), 14695981039346656037);
        assert_eq!(hash_name("a"), 0xaf63dc4c8601ec8c);
        assert_eq!(hash_name("foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn verify_rejects_garbage() {
        assert!(ShaderFile::verify(b"not a shader").is_none());
        let mut blob = vec![0u8; 1024];
        blob[0..8].copy_from_slice(b"SKSHADER");
        blob[8] = 9; // version 9
        blob[14..17].copy_from_slice(b"sky");
        let (version, name) = ShaderFile::verify(&blob).unwrap();
        assert_eq!(version, 9);
        assert_eq!(name, "sky");
        assert_eq!(ShaderFile::load(&blob), Err(SquallError::OLD_VERSION));
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        let mut blob = vec![0u8; 1024];
        blob[0..8].copy_from_slice(b"SKSHADER");
        blob[8] = SHADER_VERSION as u8;
        // cut off in the middle of the op count block
        blob[10] = 1;
        let short = &blob[..300];
        assert!(ShaderFile::verify(short).is_some());
        assert_eq!(ShaderFile::load(short), Err(SquallError::CORRUPT_DATA));
    }
}
