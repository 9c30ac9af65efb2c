// Render lists
//
// A list of flattened draw records. Everything a draw needs for
// pipeline lookup, sorting, and batching is inlined into the item at
// add time, so sorting never chases mesh or material pointers and a
// later material edit cannot alter a pending draw.

use ash::vk;

use crate::material::Material;
use crate::mesh::Mesh;
use crate::MAX_VERTEX_BUFFERS;

/// Pack the draw ordering key.
///
/// Queue offset dominates, then pipeline identity, then mesh and
/// material identity, so equal-state draws land adjacent after the
/// sort and batch into single calls.
pub(crate) fn pack_sort_key(
    queue_offset: i32,
    pipeline_material_idx: u32,
    mesh_id: u16,
    material_id: u16,
) -> u64 {
    // bias the queue so negative offsets still sort before zero
    let queue = (queue_offset as i64 + 0x8000) as u64 & 0xffff;
    (queue << 48)
        | ((pipeline_material_idx as u64 & 0xffff) << 32)
        | ((mesh_id as u64) << 16)
        | material_id as u64
}

/// One flattened draw record.
#[derive(Clone)]
pub struct RenderItem {
    pub(crate) sort_key: u64,

    pub(crate) vertex_buffers: [vk::Buffer; MAX_VERTEX_BUFFERS],
    pub(crate) vertex_buffer_count: u32,
    pub(crate) index_buffer: vk::Buffer,
    pub(crate) index_type: vk::IndexType,
    pub(crate) vert_count: u32,
    pub(crate) first_index: u32,
    pub(crate) index_count: u32,
    pub(crate) vertex_offset: i32,

    pub(crate) pipeline_material_idx: u32,
    pub(crate) pipeline_vert_idx: u32,
    pub(crate) bind_start: u32,
    pub(crate) bind_count: u32,

    /// Snapshot of the material parameter cbuffer in the list's
    /// material_data arena
    pub(crate) param_data_offset: u32,
    pub(crate) param_buffer_size: u32,

    /// Descriptor slots fed from bump slices
    pub(crate) global_slot: Option<u32>,
    pub(crate) system_slot: Option<u32>,
    pub(crate) instance_slot: Option<u32>,

    /// This item's span of the list's instance_data arena
    pub(crate) instance_offset: u32,
    pub(crate) instance_data_size: u32,
    pub(crate) instance_stride: u32,
    pub(crate) instance_count: u32,
}

/// A run of sorted items that collapses into one draw call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Batch {
    pub start: usize,
    pub end: usize,
    pub instance_count: u32,
}

pub struct RenderList {
    pub(crate) l_items: Vec<RenderItem>,
    /// Per-item snapshots of material parameter cbuffers
    pub(crate) l_material_data: Vec<u8>,
    /// Per-item instance payloads, in add order
    pub(crate) l_instance_data: Vec<u8>,
}

impl RenderList {
    pub fn new() -> Self {
        Self {
            l_items: Vec::new(),
            l_material_data: Vec::new(),
            l_instance_data: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.l_items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.l_items.is_empty()
    }

    pub fn clear(&mut self) {
        self.l_items.clear();
        self.l_material_data.clear();
        self.l_instance_data.clear();
    }

    /// Append one draw of `mesh` with `material`.
    ///
    /// The material's parameter bytes and the caller's instance data
    /// are copied into list-local arenas immediately.
    pub fn add(
        &mut self,
        mesh: &Mesh,
        material: &Material,
        instance_data: &[u8],
        instance_stride: u32,
        instance_count: u32,
    ) {
        let instance_offset = self.l_instance_data.len() as u32;
        self.l_instance_data.extend_from_slice(instance_data);

        let params = material.params();
        let param_data_offset = self.l_material_data.len() as u32;
        self.l_material_data.extend_from_slice(params);
        // snapshots stay aligned to the worst-case uniform offset
        // alignment, every item offset is a legal descriptor offset
        // within the frame's one material upload
        let aligned = (self.l_material_data.len() + 255) & !255;
        self.l_material_data.resize(aligned, 0);

        let mut vertex_buffers = [vk::Buffer::null(); MAX_VERTEX_BUFFERS];
        let streams = mesh.vertex_buffers();
        for (i, buf) in streams.iter().enumerate().take(MAX_VERTEX_BUFFERS) {
            vertex_buffers[i] = buf.vk_buffer();
        }

        let (bind_start, bind_count) = material.bind_range();
        let special = material.special_slots();

        self.l_items.push(RenderItem {
            sort_key: pack_sort_key(
                material.queue_offset(),
                material.pipeline_idx(),
                mesh.m_id,
                material.mt_id,
            ),
            vertex_buffers,
            vertex_buffer_count: streams.len() as u32,
            index_buffer: mesh
                .index_buffer()
                .map(|b| b.vk_buffer())
                .unwrap_or(vk::Buffer::null()),
            index_type: mesh.m_index_type,
            vert_count: mesh.m_vert_count,
            first_index: 0,
            index_count: mesh.m_ind_count,
            vertex_offset: 0,
            pipeline_material_idx: material.pipeline_idx(),
            pipeline_vert_idx: mesh.m_pipeline_vert_idx,
            bind_start,
            bind_count,
            param_data_offset,
            param_buffer_size: params.len() as u32,
            global_slot: special.global,
            system_slot: special.system,
            instance_slot: special.instance,
            instance_offset,
            instance_data_size: instance_data.len() as u32,
            instance_stride,
            instance_count: instance_count.max(1),
        });
    }

    /// Stable sort by sort key. Items with equal keys keep add order,
    /// which also keeps their instance data spans contiguous.
    pub fn sort(&mut self) {
        self.l_items.sort_by_key(|item| item.sort_key);
    }

    /// Can `b` ride in the same draw call as `a`.
    fn same_batch(a: &RenderItem, b: &RenderItem) -> bool {
        a.vertex_buffers[0] == b.vertex_buffers[0]
            && a.pipeline_material_idx == b.pipeline_material_idx
            && a.bind_start == b.bind_start
            && a.first_index == b.first_index
            && a.index_count == b.index_count
            && a.vertex_offset == b.vertex_offset
            // instances merge into one descriptor slice, which only
            // works when the spans are adjacent in the arena
            && b.instance_offset == a.instance_offset + a.instance_data_size
    }

    /// Detect runs of consecutive items that draw identically.
    pub(crate) fn compute_batches(&self) -> Vec<Batch> {
        let mut batches = Vec::new();
        let mut i = 0;
        while i < self.l_items.len() {
            let mut end = i + 1;
            let mut instances = self.l_items[i].instance_count;
            while end < self.l_items.len()
                && Self::same_batch(&self.l_items[end - 1], &self.l_items[end])
            {
                instances += self.l_items[end].instance_count;
                end += 1;
            }
            batches.push(Batch {
                start: i,
                end,
                instance_count: instances,
            });
            i = end;
        }
        batches
    }
}

impl Default for RenderList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_key_field_order() {
        // queue dominates material which dominates mesh identity
        let base = pack_sort_key(0, 5, 2, 1);
        assert!(pack_sort_key(1, 0, 0, 0) > base);
        assert!(pack_sort_key(-1, 900, 2, 1) < base);
        assert!(pack_sort_key(0, 6, 0, 0) > base);
        assert!(pack_sort_key(0, 5, 3, 0) > base);
        assert!(pack_sort_key(0, 5, 2, 2) > base);
    }

    #[test]
    fn sort_key_roundtrips_fields() {
        let key = pack_sort_key(7, 0x123, 0xbeef, 0xcafe);
        assert_eq!((key >> 48) as u16, 0x8007);
        assert_eq!(((key >> 32) & 0xffff) as u16, 0x123);
        assert_eq!(((key >> 16) & 0xffff) as u16, 0xbeef);
        assert_eq!((key & 0xffff) as u16, 0xcafe);
    }
}
