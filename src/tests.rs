// Squall tests
//
// Everything here runs without a GPU: the shader blob format, the
// hashing and key packing that drive lookups, destroy list ordering,
// bind pool accounting, and render list sorting and batching. Paths
// that need a live device are structured so their decision logic is
// covered by the per-module tests next to the code.

use crate as sq;
use crate::destroy::{DestroyItem, DestroyList};
use crate::list::{pack_sort_key, RenderItem, RenderList};
use crate::material::MaterialState;
use crate::shader::{self, ShaderFile};

use ash::vk;
use ash::vk::Handle;

fn put_fixed(buf: &mut Vec<u8>, s: &str, len: usize) {
    let mut field = vec![0u8; len];
    let bytes = s.as_bytes();
    field[..bytes.len()].copy_from_slice(bytes);
    buf.extend_from_slice(&field);
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bind(buf: &mut Vec<u8>, slot: u16, stage_bits: u8, register: u8) {
    buf.extend_from_slice(&slot.to_le_bytes());
    buf.push(stage_bits);
    buf.push(register);
}

/// Assemble a small but complete shader blob: a $Global buffer with
/// defaults and two vars, one texture resource, two vertex inputs,
/// and vertex plus pixel spirv stages.
pub(crate) fn test_shader_blob() -> Vec<u8> {
    let mut blob = Vec::new();

    blob.extend_from_slice(b"SKSHADER");
    blob.extend_from_slice(&shader::SHADER_VERSION.to_le_bytes());
    put_u32(&mut blob, 2); // stage count

    // meta leads with the shader name
    put_fixed(&mut blob, "test_shader", 256);
    put_u32(&mut blob, 1); // buffer count
    put_u32(&mut blob, 1); // resource count
    put_u32(&mut blob, 2); // vertex input count
    for ops in [12, 1, 0, 34, 2, 1] {
        put_u32(&mut blob, ops);
    }

    // the $Global buffer: color float4 at 0, tex_scale float1 at 16
    put_fixed(&mut blob, "$Global", 32);
    blob.push(0); // space
    put_bind(&mut blob, 0, shader::STAGE_BIT_VERTEX | shader::STAGE_BIT_PIXEL, 3);
    put_u32(&mut blob, 32); // byte size
    put_u32(&mut blob, 2); // var count
    put_u32(&mut blob, 32); // default size
    let mut defaults = [0u8; 32];
    defaults[..16].copy_from_slice(f32_bytes(&[1.0, 1.0, 1.0, 1.0]));
    defaults[16..20].copy_from_slice(f32_bytes(&[2.0]));
    blob.extend_from_slice(&defaults);
    // vars
    put_fixed(&mut blob, "color", 32);
    put_fixed(&mut blob, "", 64);
    put_u32(&mut blob, 0); // offset
    put_u32(&mut blob, 16); // size
    blob.extend_from_slice(&3u16.to_le_bytes()); // float
    blob.extend_from_slice(&4u16.to_le_bytes()); // count
    put_fixed(&mut blob, "tex_scale", 32);
    put_fixed(&mut blob, "", 64);
    put_u32(&mut blob, 16);
    put_u32(&mut blob, 4);
    blob.extend_from_slice(&3u16.to_le_bytes());
    blob.extend_from_slice(&1u16.to_le_bytes());

    // vertex inputs: position float3, texcoord float2
    put_u32(&mut blob, 3);
    blob.push(3);
    put_u32(&mut blob, 0);
    blob.push(0);
    put_u32(&mut blob, 3);
    blob.push(2);
    put_u32(&mut blob, 2);
    blob.push(0);

    // resources: one diffuse texture defaulting to white
    put_fixed(&mut blob, "diffuse", 32);
    put_fixed(&mut blob, "white", 64);
    put_fixed(&mut blob, "", 64);
    put_bind(&mut blob, 0, shader::STAGE_BIT_PIXEL, 4);

    // stages
    for stage in [0u32, 1u32] {
        put_u32(&mut blob, 1); // spirv
        put_u32(&mut blob, stage);
        put_u32(&mut blob, 8);
        blob.extend_from_slice(&[0x03, 0x02, 0x23, 0x07, 0, 0, 0, 0]);
    }

    blob
}

fn f32_bytes(vals: &[f32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(vals.as_ptr() as *const u8, vals.len() * 4) }
}

#[test]
fn shader_blob_roundtrip() {
    let blob = test_shader_blob();

    let (version, name) = ShaderFile::verify(&blob).unwrap();
    assert_eq!(version, shader::SHADER_VERSION);
    assert_eq!(name, "test_shader");

    let file = ShaderFile::load(&blob).unwrap();
    assert_eq!(file.name, "test_shader");
    assert_eq!(file.name_hash, shader::hash_name("test_shader"));
    assert_eq!(file.buffers.len(), 1);
    assert_eq!(file.resources.len(), 1);
    assert_eq!(file.vertex_inputs.len(), 2);
    assert_eq!(file.stages.len(), 2);
    assert_eq!(file.ops_vertex.total, 12);
    assert_eq!(file.ops_pixel.dynamic_flow, 1);

    // the one buffer is recognized as $Global
    assert_eq!(file.global_buffer_id, 0);
    let global = file.global_buffer().unwrap();
    assert_eq!(global.size, 32);
    assert_eq!(global.bind.slot, 0);
    assert_eq!(global.bind.register_type, shader::RegisterType::Constant);
    assert_eq!(global.vars.len(), 2);
    assert_eq!(global.vars[0].name, "color");
    assert_eq!(global.vars[0].offset, 0);
    assert_eq!(global.vars[0].size, 16);
    assert_eq!(global.vars[1].name, "tex_scale");
    assert_eq!(global.vars[1].offset, 16);
    assert_eq!(global.defaults.as_ref().unwrap().len(), 32);

    let res = &file.resources[0];
    assert_eq!(res.name, "diffuse");
    assert_eq!(res.value, "white");
    assert_eq!(res.bind.register_type, shader::RegisterType::Texture);
    assert_eq!(res.name_hash, shader::hash_name("diffuse"));

    assert!(file.spirv_stage(shader::ShaderStage::Vertex).is_some());
    assert!(file.spirv_stage(shader::ShaderStage::Compute).is_none());
    assert!(!file.is_compute());

    // parse, discard, parse again: structurally identical metadata
    let again = ShaderFile::load(&blob).unwrap();
    assert_eq!(again.buffers.len(), file.buffers.len());
    for (a, b) in again.buffers[0].vars.iter().zip(file.buffers[0].vars.iter()) {
        assert_eq!(a.name_hash, b.name_hash);
        assert_eq!(a.offset, b.offset);
        assert_eq!(a.size, b.size);
    }
    assert_eq!(again.vertex_inputs, file.vertex_inputs);
}

#[test]
fn cube_vertex_data_matches_reflected_format() {
    let _ = env_logger::builder().is_test(true).try_init();
    use cgmath::{Vector2, Vector3};

    // the format a shader would reflect for position + texcoord
    let blob = test_shader_blob();
    let file = ShaderFile::load(&blob).unwrap();
    let stride = crate::mesh::vertex_stride(&file.vertex_inputs);
    assert_eq!(stride, 20);

    // 24 corner verts of a unit cube, serialized the way a caller
    // would feed create_mesh
    let mut verts: Vec<(Vector3<f32>, Vector2<f32>)> = Vec::new();
    for face in 0..6 {
        for corner in 0..4 {
            let u = (corner & 1) as f32;
            let v = (corner >> 1) as f32;
            verts.push((
                Vector3::new(u - 0.5, v - 0.5, face as f32 / 6.0 - 0.5),
                Vector2::new(u, v),
            ));
        }
    }

    let mut data = Vec::new();
    for (pos, uv) in verts.iter() {
        data.extend_from_slice(f32_bytes(&[pos.x, pos.y, pos.z, uv.x, uv.y]));
    }

    assert_eq!(data.len(), stride as usize * 24);
    // 12 triangles, 36 indices, all inside the vertex range
    let indices: Vec<u16> = (0..6u16)
        .flat_map(|f| {
            let b = f * 4;
            vec![b, b + 1, b + 2, b + 1, b + 3, b + 2]
        })
        .collect();
    assert_eq!(indices.len(), 36);
    assert!(indices.iter().all(|i| (*i as usize) < verts.len()));
}

#[test]
fn destroy_list_is_lifo() {
    let list = DestroyList::new();
    list.push(DestroyItem::ImageView(vk::ImageView::from_raw(1)));
    list.push(DestroyItem::Image(vk::Image::from_raw(2)));
    list.push(DestroyItem::Framebuffer(vk::Framebuffer::from_raw(3)));

    // dependents appended later must die first
    let drained = list.take_reversed();
    assert!(matches!(drained[0], DestroyItem::Framebuffer(f) if f.as_raw() == 3));
    assert!(matches!(drained[1], DestroyItem::Image(i) if i.as_raw() == 2));
    assert!(matches!(drained[2], DestroyItem::ImageView(v) if v.as_raw() == 1));
    assert!(list.is_empty());
}

#[test]
fn destroy_list_clear_drops_without_executing() {
    let list = DestroyList::new();
    list.push(DestroyItem::Buffer(vk::Buffer::from_raw(7)));
    list.clear();
    assert!(list.is_empty());
    assert!(list.take_reversed().is_empty());
}

#[test]
fn bind_pool_reuses_freed_ranges() {
    let pool = sq::bindpool::BindPool::new();

    let a = pool.alloc(4).unwrap();
    let b = pool.alloc(2).unwrap();
    assert_ne!(a, b);
    let grown = pool.len();

    // a freed range satisfies the next fitting request
    pool.free(a, 4);
    let c = pool.alloc(3).unwrap();
    assert_eq!(c, a);
    assert_eq!(pool.len(), grown);

    // the remainder of the split range is still usable
    let d = pool.alloc(1).unwrap();
    assert_eq!(d, a + 3);

    pool.update(b, |rec| rec.br_slot = 42);
    pool.with_range(b, 2, |recs| {
        assert_eq!(recs[0].br_slot, 42);
        assert_eq!(recs[1].br_slot, 0);
    });
}

#[test]
fn bind_pool_reports_exhaustion() {
    let pool = sq::bindpool::BindPool::new();

    // a request the fixed capacity can never satisfy
    assert_eq!(
        pool.alloc(u32::MAX / 2),
        Err(sq::SquallError::BIND_POOL_EXHAUSTED)
    );

    // the pool still works after refusing, and freed ranges keep it
    // serviceable at steady state
    let a = pool.alloc(8).unwrap();
    pool.free(a, 8);
    assert_eq!(pool.alloc(8), Ok(a));
}

#[test]
fn material_state_defaults() {
    let state = MaterialState::default();
    assert_eq!(state.cull, sq::CullMode::Back);
    assert_eq!(state.front_face, crate::material::FrontFace::CounterClockwise);
    assert_eq!(state.depth_test, sq::DepthTest::Less);
    assert!(state.depth_write);
    assert_eq!(state.blend, sq::BlendState::Off);
    assert_eq!(state.topology, sq::Topology::TriangleList);
    assert_eq!(state.queue_offset, 0);
    assert!(!state.alpha_to_coverage);
    assert_eq!(state.stencil_front.compare, sq::DepthTest::Always);
    assert_eq!(state.stencil_front.compare_mask, 0xff);
    assert_eq!(state.stencil_front.write_mask, 0xff);
    assert_eq!(state.stencil_front.reference, 0);
    assert_eq!(
        state.write_mask,
        (sq::WriteMask::RGBA | sq::WriteMask::DEPTH).bits()
    );
}

/// A hand-built item for list tests, standing in for what add()
/// inlines from a mesh and material.
fn test_item(
    sort_key: u64,
    material_idx: u32,
    vbuf: u64,
    instance_offset: u32,
    instance_size: u32,
) -> RenderItem {
    let mut vertex_buffers = [vk::Buffer::null(); sq::MAX_VERTEX_BUFFERS];
    vertex_buffers[0] = vk::Buffer::from_raw(vbuf);
    RenderItem {
        sort_key,
        vertex_buffers,
        vertex_buffer_count: 1,
        index_buffer: vk::Buffer::from_raw(100),
        index_type: vk::IndexType::UINT16,
        vert_count: 24,
        first_index: 0,
        index_count: 36,
        vertex_offset: 0,
        pipeline_material_idx: material_idx,
        pipeline_vert_idx: 0,
        bind_start: 0,
        bind_count: 2,
        param_data_offset: 0,
        param_buffer_size: 0,
        global_slot: None,
        system_slot: None,
        instance_slot: Some(64),
        instance_offset,
        instance_data_size: instance_size,
        instance_stride: 64,
        instance_count: 1,
    }
}

#[test]
fn render_list_sort_is_stable() {
    let mut list = RenderList::new();
    // equal keys keep their add order
    for i in 0..4 {
        let mut item = test_item(pack_sort_key(0, 1, 1, 1), 1, 10, i * 64, 64);
        item.instance_count = i + 100;
        list.l_items.push(item);
    }
    list.l_items.push(test_item(pack_sort_key(-1, 9, 9, 9), 9, 11, 256, 64));
    list.sort();

    assert_eq!(list.l_items[0].pipeline_material_idx, 9);
    for i in 0..4 {
        assert_eq!(list.l_items[i + 1].instance_count, i as u32 + 100);
    }
}

#[test]
fn render_list_batches_identical_items() {
    // a thousand identical draws with contiguous 64 byte instance
    // payloads collapse into one call covering the whole slice
    let mut list = RenderList::new();
    for i in 0..1000u32 {
        list.l_items
            .push(test_item(pack_sort_key(0, 1, 1, 1), 1, 10, i * 64, 64));
        list.l_instance_data.extend_from_slice(&[0u8; 64]);
    }
    list.sort();

    let batches = list.compute_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].start, 0);
    assert_eq!(batches[0].end, 1000);
    assert_eq!(batches[0].instance_count, 1000);
    assert_eq!(list.l_instance_data.len(), 64 * 1000);
}

#[test]
fn render_list_never_batches_across_keys() {
    let mut list = RenderList::new();
    list.l_items.push(test_item(pack_sort_key(0, 1, 1, 1), 1, 10, 0, 64));
    // different material index
    list.l_items.push(test_item(pack_sort_key(0, 2, 1, 1), 2, 10, 64, 64));
    // same material, different mesh buffer
    list.l_items.push(test_item(pack_sort_key(0, 2, 2, 1), 2, 11, 128, 64));
    // same everything but a gap in the instance arena
    list.l_items.push(test_item(pack_sort_key(0, 2, 2, 1), 2, 11, 256, 64));

    let batches = list.compute_batches();
    assert_eq!(batches.len(), 4);
    for b in batches {
        assert_eq!(b.instance_count, 1);
    }
}

#[test]
fn empty_render_list_draws_nothing() {
    let list = RenderList::new();
    assert!(list.is_empty());
    assert!(list.compute_batches().is_empty());
}

#[test]
fn material_param_snapshots_are_aligned() {
    // items from different materials land on 256 byte boundaries in
    // the material arena, which keeps descriptor offsets legal
    let mut list = RenderList::new();
    list.l_material_data.extend_from_slice(&[1u8; 20]);
    let aligned = (list.l_material_data.len() + 255) & !255;
    list.l_material_data.resize(aligned, 0);
    assert_eq!(list.l_material_data.len(), 256);
}

#[test]
fn vertex_format_interning_is_idempotent() {
    let cache = sq::pipeline::PipelineCache::new();

    let fmt_a = [
        shader::VertexComponent {
            format: 3,
            count: 3,
            semantic: 0,
            semantic_slot: 0,
        },
        shader::VertexComponent {
            format: 3,
            count: 2,
            semantic: 2,
            semantic_slot: 0,
        },
    ];
    let fmt_b = [fmt_a[0]];

    let a1 = cache.register_vertex_format(&fmt_a);
    let b = cache.register_vertex_format(&fmt_b);
    let a2 = cache.register_vertex_format(&fmt_a);
    let empty = cache.register_vertex_format(&[]);

    assert_eq!(a1, a2);
    assert_ne!(a1, b);
    assert_ne!(empty, a1);
    assert_eq!(cache.register_vertex_format(&[]), empty);
}

#[test]
fn pipeline_lock_is_reentrant() {
    let cache = sq::pipeline::PipelineCache::new();
    cache.lock();
    // registration mid-pass relocks without deadlocking
    let idx = cache.register_vertex_format(&[]);
    cache.lock();
    cache.unlock();
    assert_eq!(cache.register_vertex_format(&[]), idx);
    cache.unlock();
}

#[test]
fn pass_keys_compare_by_value() {
    let key = sq::pipeline::PassKey {
        color_format: vk::Format::B8G8R8A8_SRGB,
        depth_format: vk::Format::D32_SFLOAT,
        resolve_format: vk::Format::UNDEFINED,
        samples: vk::SampleCountFlags::TYPE_4,
        color_load: vk::AttachmentLoadOp::CLEAR,
        depth_load: vk::AttachmentLoadOp::CLEAR,
        depth_store: vk::AttachmentStoreOp::DONT_CARE,
    };
    let same = key;
    assert_eq!(key, same);
    assert!(key.has_depth());
    assert!(!key.has_resolve());

    let resolved = sq::pipeline::PassKey {
        resolve_format: vk::Format::B8G8R8A8_SRGB,
        ..key
    };
    assert_ne!(key, resolved);
    assert!(resolved.has_resolve());
}
