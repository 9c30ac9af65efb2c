// Meshes
//
// A mesh is one or more vertex streams, an optional index buffer, and
// the vertex format descriptor derived from a shader's vertex inputs.
// The descriptor is interned in the pipeline cache once, after which
// draws refer to the mesh's stable vertex pipeline index.

use ash::vk;

use crate::buffer::{Buffer, BufferType, BufferUse};
use crate::device::Device;
use crate::pipeline::PipelineCache;
use crate::shader::VertexComponent;
use crate::{Result, SquallError, MAX_VERTEX_BUFFERS};

use std::sync::Arc;

/// Bytes of one element of a vertex component.
pub(crate) fn component_byte_size(c: &VertexComponent) -> u32 {
    let scalar = match c.format {
        4 => 8, // double
        _ => 4, // int, uint, float
    };
    scalar * c.count as u32
}

/// Stride of a full vertex built from `components`.
pub(crate) fn vertex_stride(components: &[VertexComponent]) -> u32 {
    components.iter().map(component_byte_size).sum()
}

pub struct Mesh {
    m_dev: Arc<Device>,
    m_cache: Arc<PipelineCache>,
    m_verts: Vec<Arc<Buffer>>,
    m_inds: Option<Arc<Buffer>>,
    pub(crate) m_index_type: vk::IndexType,
    pub(crate) m_vert_count: u32,
    pub(crate) m_ind_count: u32,
    pub(crate) m_vert_stride: u32,
    m_components: Vec<VertexComponent>,
    /// Stable vertex format key in the pipeline cache
    pub(crate) m_pipeline_vert_idx: u32,
    /// Identity for sort keys
    pub(crate) m_id: u16,
    /// Whether the primary vertex stream has been converted to a
    /// dynamic buffer by a second set_verts call
    m_dynamic: bool,
}

impl Mesh {
    pub(crate) fn new(
        dev: &Arc<Device>,
        cache: &Arc<PipelineCache>,
        components: &[VertexComponent],
        index_type: vk::IndexType,
        vert_data: &[u8],
        vert_count: u32,
        index_data: Option<&[u8]>,
        ind_count: u32,
        id: u16,
    ) -> Result<Mesh> {
        if components.is_empty() || vert_count == 0 {
            return Err(SquallError::INVALID);
        }

        let stride = vertex_stride(components);
        if (stride * vert_count) as usize != vert_data.len() {
            log::error!(
                "vertex data is {} bytes, expected {} for {} verts of stride {}",
                vert_data.len(),
                stride * vert_count,
                vert_count,
                stride
            );
            return Err(SquallError::INVALID);
        }

        let verts = Buffer::new(
            dev,
            Some(vert_data),
            vert_data.len() as u64,
            BufferType::Vertex,
            BufferUse::Static,
        )?;

        let inds = match index_data {
            Some(data) => Some(Buffer::new(
                dev,
                Some(data),
                data.len() as u64,
                BufferType::Index,
                BufferUse::Static,
            )?),
            None => None,
        };

        let vert_idx = cache.register_vertex_format(components);

        Ok(Mesh {
            m_dev: dev.clone(),
            m_cache: cache.clone(),
            m_verts: vec![verts],
            m_inds: inds,
            m_index_type: index_type,
            m_vert_count: vert_count,
            m_ind_count: ind_count,
            m_vert_stride: stride,
            m_components: components.to_vec(),
            m_pipeline_vert_idx: vert_idx,
            m_id: id,
            m_dynamic: false,
        })
    }

    pub fn vert_count(&self) -> u32 {
        self.m_vert_count
    }

    pub fn index_count(&self) -> u32 {
        self.m_ind_count
    }

    pub fn components(&self) -> &[VertexComponent] {
        &self.m_components
    }

    pub fn is_valid(&self) -> bool {
        !self.m_verts.is_empty()
    }

    pub(crate) fn vertex_buffers(&self) -> &[Arc<Buffer>] {
        &self.m_verts
    }

    pub(crate) fn index_buffer(&self) -> Option<&Arc<Buffer>> {
        self.m_inds.as_ref()
    }

    /// Replace the vertex contents.
    ///
    /// The first update after creation converts the static vertex
    /// buffer into a dynamic one, on the theory that a mesh updated
    /// once will be updated every frame.
    pub fn set_verts(&mut self, data: &[u8], count: u32) -> Result<()> {
        if (self.m_vert_stride * count) as usize != data.len() {
            return Err(SquallError::INVALID);
        }

        if !self.m_dynamic {
            self.m_verts[0] = Buffer::new(
                &self.m_dev,
                Some(data),
                data.len() as u64,
                BufferType::Vertex,
                BufferUse::Dynamic,
            )?;
            self.m_dynamic = true;
        } else {
            let mut slot = Some(self.m_verts[0].clone());
            Buffer::ensure(&self.m_dev, &mut slot, data, BufferType::Vertex, BufferUse::Dynamic)?;
            self.m_verts[0] = slot.unwrap();
        }

        self.m_vert_count = count;
        Ok(())
    }

    /// Replace the index contents in place, growing if needed.
    pub fn set_inds(&mut self, data: &[u8], count: u32) -> Result<()> {
        let mut slot = self.m_inds.take();
        Buffer::ensure(&self.m_dev, &mut slot, data, BufferType::Index, BufferUse::Dynamic)?;
        self.m_inds = slot;
        self.m_ind_count = count;
        Ok(())
    }

    /// Attach an extra vertex stream, for split interleaved plus
    /// per-instance layouts.
    pub fn push_vertex_stream(&mut self, buffer: Arc<Buffer>) -> Result<()> {
        if self.m_verts.len() >= MAX_VERTEX_BUFFERS {
            log::error!("mesh already has {} vertex streams", MAX_VERTEX_BUFFERS);
            return Err(SquallError::INVALID);
        }
        self.m_verts.push(buffer);
        Ok(())
    }

    /// Re-intern the vertex format, used when a caller rebuilds the
    /// component list to match a different shader.
    pub fn set_components(&mut self, components: &[VertexComponent]) {
        self.m_components = components.to_vec();
        self.m_vert_stride = vertex_stride(components);
        self.m_pipeline_vert_idx = self.m_cache.register_vertex_format(components);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_sums_components() {
        let comps = [
            VertexComponent {
                format: 3,
                count: 3,
                semantic: 0,
                semantic_slot: 0,
            },
            VertexComponent {
                format: 3,
                count: 2,
                semantic: 2,
                semantic_slot: 0,
            },
        ];
        assert_eq!(vertex_stride(&comps), 20);
    }
}
