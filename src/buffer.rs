// GPU buffer objects
//
// Vertex, index, constant, and storage buffers. Static buffers live
// in device local memory and are filled through a staging upload on
// the calling thread's command batch. Dynamic buffers stay host
// visible and persistently mapped for in place updates.

use ash::vk;

use crate::destroy::DestroyItem;
use crate::device::Device;
use crate::{Result, SquallError};

use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferType {
    Vertex,
    Index,
    Constant,
    Storage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferUse {
    /// Device local, updated only by full re-upload
    Static,
    /// Host visible, updated in place
    Dynamic,
    /// Device local with storage access for compute readers
    ComputeRead,
    /// Device local storage written by compute
    ComputeReadWrite,
}

pub struct Buffer {
    b_dev: Arc<Device>,
    pub(crate) b_buf: vk::Buffer,
    b_mem: vk::DeviceMemory,
    pub(crate) b_size: u64,
    pub(crate) b_type: BufferType,
    b_use: BufferUse,
    /// Persistent mapping for dynamic buffers, null otherwise
    b_map: *mut u8,
}

// the mapped pointer is never aliased by the renderer itself, writers
// are serialized externally per the shared resource policy
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

fn usage_bits(ty: BufferType, buf_use: BufferUse) -> vk::BufferUsageFlags {
    let mut usage = match ty {
        BufferType::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
        BufferType::Index => vk::BufferUsageFlags::INDEX_BUFFER,
        BufferType::Constant => vk::BufferUsageFlags::UNIFORM_BUFFER,
        BufferType::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
    };
    usage |= vk::BufferUsageFlags::TRANSFER_DST;
    match buf_use {
        BufferUse::ComputeRead | BufferUse::ComputeReadWrite => {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        _ => {}
    }
    usage
}

impl Buffer {
    /// Create a buffer, optionally filled with `data`.
    ///
    /// `size` may exceed `data.len()` to reserve room for growth. The
    /// calling thread must have called `thread_init` when creating a
    /// static buffer, since the upload records into its command batch.
    pub(crate) fn new(
        dev: &Arc<Device>,
        data: Option<&[u8]>,
        size: u64,
        ty: BufferType,
        buf_use: BufferUse,
    ) -> Result<Arc<Buffer>> {
        if size == 0 {
            return Err(SquallError::INVALID);
        }

        let usage = usage_bits(ty, buf_use);
        let host_visible = buf_use == BufferUse::Dynamic;

        let (buf, mem, map) = if host_visible {
            let (buf, mem) = dev.create_buffer_with_size(
                usage,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                size,
            )?;
            let map = unsafe {
                dev.dev
                    .map_memory(mem, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .or(Err(SquallError::OUT_OF_MEMORY))? as *mut u8
            };
            (buf, mem, map)
        } else {
            let (buf, mem) = dev.create_buffer_with_size(
                usage,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                size,
            )?;
            (buf, mem, std::ptr::null_mut())
        };

        let ret = Arc::new(Buffer {
            b_dev: dev.clone(),
            b_buf: buf,
            b_mem: mem,
            b_size: size,
            b_type: ty,
            b_use: buf_use,
            b_map: map,
        });

        if let Some(data) = data {
            ret.set(data)?;
        }

        Ok(ret)
    }

    pub fn size(&self) -> u64 {
        self.b_size
    }

    pub fn buffer_type(&self) -> BufferType {
        self.b_type
    }

    pub fn usage(&self) -> BufferUse {
        self.b_use
    }

    pub fn is_valid(&self) -> bool {
        self.b_buf != vk::Buffer::null()
    }

    /// Update the buffer contents.
    ///
    /// Dynamic buffers are written through their mapping. Everything
    /// else goes through a staging copy recorded on the calling
    /// thread's command batch, so the new contents are visible to the
    /// batch that carries the copy and later ones.
    pub fn set(&self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.b_size {
            log::error!(
                "buffer update of {} bytes exceeds capacity {}",
                data.len(),
                self.b_size
            );
            return Err(SquallError::INVALID);
        }
        if data.is_empty() {
            return Ok(());
        }

        if !self.b_map.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), self.b_map, data.len());
            }
            return Ok(());
        }

        self.staged_upload(data)
    }

    /// Copy `data` in through a transient staging buffer.
    fn staged_upload(&self, data: &[u8]) -> Result<()> {
        let dev = &self.b_dev;
        let (staging, staging_mem) = dev.create_buffer_with_data(
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            data,
        )?;

        let thread = crate::cmd::current_thread()?;
        let ctx = thread.acquire(dev)?;

        unsafe {
            let region = [vk::BufferCopy::builder()
                .src_offset(0)
                .dst_offset(0)
                .size(data.len() as u64)
                .build()];
            dev.dev
                .cmd_copy_buffer(ctx.cbuf, staging, self.b_buf, &region);

            // make the copy visible to any later use of the buffer
            let barrier = [vk::BufferMemoryBarrier::builder()
                .buffer(self.b_buf)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(
                    vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                        | vk::AccessFlags::INDEX_READ
                        | vk::AccessFlags::UNIFORM_READ
                        | vk::AccessFlags::SHADER_READ,
                )
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .build()];
            dev.dev.cmd_pipeline_barrier(
                ctx.cbuf,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::VERTEX_INPUT
                    | vk::PipelineStageFlags::VERTEX_SHADER
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &barrier,
                &[],
            );
        }

        // the staging pair dies when this batch's fence signals
        ctx.slot.cs_destroy.push(DestroyItem::Memory(staging_mem));
        ctx.slot.cs_destroy.push(DestroyItem::Buffer(staging));

        thread.release(dev)
    }

    /// Keep `slot` holding a buffer of at least `data.len()` bytes
    /// containing `data`.
    ///
    /// An existing buffer of sufficient size is updated in place. A
    /// missing or undersized buffer is replaced, with the old one
    /// queued for destruction exactly once through its Arc drop.
    pub fn ensure(
        dev: &Arc<Device>,
        slot: &mut Option<Arc<Buffer>>,
        data: &[u8],
        ty: BufferType,
        buf_use: BufferUse,
    ) -> Result<bool> {
        if let Some(buf) = slot.as_ref() {
            if buf.b_size >= data.len() as u64 && buf.b_type == ty && buf.b_use == buf_use {
                buf.set(data)?;
                return Ok(false);
            }
        }

        *slot = Some(Buffer::new(dev, Some(data), data.len() as u64, ty, buf_use)?);
        Ok(true)
    }

    pub(crate) fn vk_buffer(&self) -> vk::Buffer {
        self.b_buf
    }

    pub fn set_name(&self, name: &str) {
        use vk::Handle;
        self.b_dev.inst.set_object_name(
            self.b_dev.dev.handle(),
            vk::ObjectType::BUFFER,
            self.b_buf.as_raw(),
            name,
        );
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // mapped memory is implicitly unmapped by the free
        self.b_dev.defer_destroy(DestroyItem::Memory(self.b_mem));
        self.b_dev.defer_destroy(DestroyItem::Buffer(self.b_buf));
    }
}
