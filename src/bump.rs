// Per-frame upload bump allocators
//
// Each recording thread owns one const (uniform) and one storage bump
// per flight index. Draws copy their transient data in and get back a
// (buffer, offset, size) triple to point descriptors at. The whole
// buffer resets when its flight index comes around again.

use ash::vk;

use crate::destroy::{DestroyItem, DestroyList};
use crate::device::Device;
use crate::{Result, SquallError};

const BUMP_INITIAL_SIZE: u64 = 64 * 1024;

/// A slice of a bump buffer, consumed as a descriptor write source.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct BumpSlice {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

impl BumpSlice {
    pub fn is_valid(&self) -> bool {
        self.buffer != vk::Buffer::null() && self.size > 0
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// One bump buffer, persistently mapped.
pub(crate) struct BumpAlloc {
    ba_usage: vk::BufferUsageFlags,
    ba_align: u64,
    ba_buf: vk::Buffer,
    ba_mem: vk::DeviceMemory,
    ba_map: *mut u8,
    ba_size: u64,
    ba_used: u64,
}

// the mapped pointer is only written by the owning thread
unsafe impl Send for BumpAlloc {}

impl BumpAlloc {
    pub fn new(dev: &Device, usage: vk::BufferUsageFlags, align: u64) -> Result<Self> {
        let mut ret = Self {
            ba_usage: usage,
            ba_align: align.max(1),
            ba_buf: vk::Buffer::null(),
            ba_mem: vk::DeviceMemory::null(),
            ba_map: std::ptr::null_mut(),
            ba_size: 0,
            ba_used: 0,
        };
        ret.grow(dev, BUMP_INITIAL_SIZE)?;
        Ok(ret)
    }

    /// Allocate a fresh backing buffer of at least `size` bytes.
    ///
    /// The previous buffer, if any, must already have been handed to a
    /// destroy list by the caller.
    fn grow(&mut self, dev: &Device, size: u64) -> Result<()> {
        let size = size.next_power_of_two().max(BUMP_INITIAL_SIZE);
        let (buf, mem) = dev.create_buffer_with_size(
            self.ba_usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            size,
        )?;
        let map = unsafe {
            dev.dev
                .map_memory(mem, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .or(Err(SquallError::OUT_OF_MEMORY))? as *mut u8
        };

        self.ba_buf = buf;
        self.ba_mem = mem;
        self.ba_map = map;
        self.ba_size = size;
        self.ba_used = 0;
        Ok(())
    }

    /// Called when this allocator's flight index wraps around. The GPU
    /// is done with the previous frame that used this buffer, so the
    /// whole region is fair game again.
    pub fn reset(&mut self) {
        self.ba_used = 0;
    }

    /// Copy `data` in and return where it landed.
    ///
    /// On overflow the backing buffer grows to the next power of two
    /// and the old one is queued on `destroy`. Slices handed out
    /// before the growth stay valid until that list executes.
    pub fn alloc_write(
        &mut self,
        dev: &Device,
        destroy: &DestroyList,
        data: &[u8],
    ) -> Result<BumpSlice> {
        if data.is_empty() {
            return Ok(BumpSlice::default());
        }

        let offset = align_up(self.ba_used, self.ba_align);
        if offset + data.len() as u64 > self.ba_size {
            destroy.push(DestroyItem::Buffer(self.ba_buf));
            destroy.push(DestroyItem::Memory(self.ba_mem));
            self.grow(dev, offset + data.len() as u64)?;
            return self.alloc_write(dev, destroy, data);
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ba_map.add(offset as usize),
                data.len(),
            );
        }
        self.ba_used = offset + data.len() as u64;

        Ok(BumpSlice {
            buffer: self.ba_buf,
            offset,
            size: data.len() as u64,
        })
    }

    /// Explicit destructor, called from thread shutdown with the
    /// device idle.
    pub fn destroy(&mut self, dev: &Device) {
        unsafe {
            if self.ba_buf != vk::Buffer::null() {
                dev.dev.unmap_memory(self.ba_mem);
                dev.dev.destroy_buffer(self.ba_buf, None);
                dev.free_memory(self.ba_mem);
                self.ba_buf = vk::Buffer::null();
                self.ba_mem = vk::DeviceMemory::null();
                self.ba_map = std::ptr::null_mut();
            }
        }
    }
}

/// The pair of bumps one thread uses for one flight index.
pub(crate) struct FrameBumps {
    pub fb_const: BumpAlloc,
    pub fb_storage: BumpAlloc,
}

impl FrameBumps {
    pub fn new(dev: &Device) -> Result<Self> {
        Ok(Self {
            fb_const: BumpAlloc::new(
                dev,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                dev.limits.min_uniform_buffer_offset_alignment,
            )?,
            fb_storage: BumpAlloc::new(
                dev,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                dev.limits.min_storage_buffer_offset_alignment,
            )?,
        })
    }

    pub fn reset(&mut self) {
        self.fb_const.reset();
        self.fb_storage.reset();
    }

    pub fn destroy(&mut self, dev: &Device) {
        self.fb_const.destroy(dev);
        self.fb_storage.destroy(dev);
    }
}

#[cfg(test)]
mod tests {
    use super::align_up;

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 64), 320);
    }
}
