// Transient descriptor allocation
//
// When VK_KHR_push_descriptor is available we push writes straight
// into the command buffer and no pools exist at all. Otherwise each
// command ring slot owns one of these pools, hands out throwaway sets
// during recording, and resets wholesale when the slot cycles.

use ash::vk;

use crate::device::Device;
use crate::{Result, SquallError};

/// Sets available per pool before allocation fails. One set is
/// allocated per draw batch, so this bounds batches per command
/// buffer, not draws.
const POOL_MAX_SETS: u32 = 1024;

pub(crate) struct SlotDescPool {
    dp_pool: vk::DescriptorPool,
}

impl SlotDescPool {
    pub fn new(dev: &Device) -> Result<Self> {
        let sizes = [
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(POOL_MAX_SETS * 4)
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(POOL_MAX_SETS * 4)
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(POOL_MAX_SETS * 2)
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(POOL_MAX_SETS)
                .build(),
        ];

        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(POOL_MAX_SETS);

        let pool = unsafe {
            dev.dev
                .create_descriptor_pool(&info, None)
                .or(Err(SquallError::COULD_NOT_CREATE_DESCRIPTOR))?
        };

        Ok(Self { dp_pool: pool })
    }

    /// Grab one transient set. Sets are never freed individually, the
    /// whole pool resets when the owning slot is recycled.
    pub fn alloc(&self, dev: &Device, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.dp_pool)
            .set_layouts(&layouts)
            .build();

        unsafe {
            Ok(dev
                .dev
                .allocate_descriptor_sets(&info)
                .or(Err(SquallError::COULD_NOT_CREATE_DESCRIPTOR))?[0])
        }
    }

    pub fn reset(&self, dev: &Device) {
        unsafe {
            dev.dev
                .reset_descriptor_pool(self.dp_pool, vk::DescriptorPoolResetFlags::empty())
                .ok();
        }
    }

    pub fn destroy(&self, dev: &Device) {
        unsafe {
            dev.dev.destroy_descriptor_pool(self.dp_pool, None);
        }
    }
}

/// One descriptor write, in renderer terms. These get turned into
/// real vkWriteDescriptorSet entries at bind time so the info arrays
/// have a single owner with a clear lifetime.
#[derive(Copy, Clone, Debug)]
pub(crate) enum DescWrite {
    UniformBuffer {
        slot: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        slot: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    CombinedImage {
        slot: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
    StorageImage {
        slot: u32,
        view: vk::ImageView,
    },
}

/// Bind a write list to `cbuf`.
///
/// Takes the same writes either way: pushed directly when the device
/// has VK_KHR_push_descriptor, otherwise written into a transient set
/// from `pool` and bound as set 0.
pub(crate) fn bind_descriptor_writes(
    dev: &Device,
    cbuf: vk::CommandBuffer,
    bind_point: vk::PipelineBindPoint,
    pipeline_layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    pool: Option<&SlotDescPool>,
    writes: &[DescWrite],
) -> Result<()> {
    if writes.is_empty() {
        return Ok(());
    }

    // infos are referenced raw by the write structs, build them first
    // and never touch the vecs again
    let mut buf_infos = Vec::with_capacity(writes.len());
    let mut img_infos = Vec::with_capacity(writes.len());
    for w in writes.iter() {
        match *w {
            DescWrite::UniformBuffer {
                buffer,
                offset,
                range,
                ..
            }
            | DescWrite::StorageBuffer {
                buffer,
                offset,
                range,
                ..
            } => buf_infos.push(
                vk::DescriptorBufferInfo::builder()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range)
                    .build(),
            ),
            DescWrite::CombinedImage {
                view,
                sampler,
                layout,
                ..
            } => img_infos.push(
                vk::DescriptorImageInfo::builder()
                    .image_view(view)
                    .sampler(sampler)
                    .image_layout(layout)
                    .build(),
            ),
            DescWrite::StorageImage { view, .. } => img_infos.push(
                vk::DescriptorImageInfo::builder()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::GENERAL)
                    .build(),
            ),
        }
    }

    let mut vk_writes = Vec::with_capacity(writes.len());
    let mut buf_at = 0;
    let mut img_at = 0;
    for w in writes.iter() {
        let builder = vk::WriteDescriptorSet::builder().dst_array_element(0);
        let write = match *w {
            DescWrite::UniformBuffer { slot, .. } => {
                let b = builder
                    .dst_binding(slot)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buf_infos[buf_at..buf_at + 1])
                    .build();
                buf_at += 1;
                b
            }
            DescWrite::StorageBuffer { slot, .. } => {
                let b = builder
                    .dst_binding(slot)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&buf_infos[buf_at..buf_at + 1])
                    .build();
                buf_at += 1;
                b
            }
            DescWrite::CombinedImage { slot, .. } => {
                let b = builder
                    .dst_binding(slot)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&img_infos[img_at..img_at + 1])
                    .build();
                img_at += 1;
                b
            }
            DescWrite::StorageImage { slot, .. } => {
                let b = builder
                    .dst_binding(slot)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&img_infos[img_at..img_at + 1])
                    .build();
                img_at += 1;
                b
            }
        };
        vk_writes.push(write);
    }

    unsafe {
        if let Some(push_loader) = dev.push_loader.as_ref() {
            push_loader.cmd_push_descriptor_set(cbuf, bind_point, pipeline_layout, 0, &vk_writes);
            return Ok(());
        }

        let pool = pool.ok_or(SquallError::COULD_NOT_CREATE_DESCRIPTOR)?;
        let set = pool.alloc(dev, set_layout)?;
        for w in vk_writes.iter_mut() {
            w.dst_set = set;
        }
        dev.dev.update_descriptor_sets(&vk_writes, &[]);
        dev.dev
            .cmd_bind_descriptor_sets(cbuf, bind_point, pipeline_layout, 0, &[set], &[]);
    }

    Ok(())
}
