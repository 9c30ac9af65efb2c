// Material bind records
//
// A dense pool of {texture, buffer, sampler} triples. Materials own a
// contiguous range and render items carry only (start, count), so the
// hot draw path never chases material pointers.

use crate::buffer::Buffer;
use crate::tex::{Sampler, Texture};
use crate::{Result, SquallError};

use std::sync::{Arc, Mutex};

/// Total records the pool may hand out, the worst-case sum of buffer
/// and resource counts across live materials.
const BIND_POOL_CAPACITY: u32 = 4096;

/// One resource slotted into a material.
///
/// Exactly one of the texture or buffer fields is populated for a
/// satisfied binding. The sampler overrides the texture's own sampler
/// when set.
#[derive(Clone, Default)]
pub(crate) struct BindRecord {
    pub br_tex: Option<Arc<Texture>>,
    pub br_buf: Option<Arc<Buffer>>,
    pub br_sampler: Option<Arc<Sampler>>,
    /// The shader bind this record satisfies, kept here so the draw
    /// path can map records to descriptor slots without the material.
    pub br_slot: u32,
    pub br_stage_bits: u8,
    pub br_register: u8,
}

struct BindPoolInner {
    slots: Vec<BindRecord>,
    /// (start, count) ranges free for reuse
    free: Vec<(u32, u32)>,
}

/// The process-wide bind record pool.
///
/// `get`-style access happens through `with_range` so the backing
/// vector cannot be reallocated out from under a reader.
pub(crate) struct BindPool {
    bp_inner: Mutex<BindPoolInner>,
}

impl BindPool {
    pub fn new() -> Self {
        Self {
            bp_inner: Mutex::new(BindPoolInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Claim `count` contiguous records. Returns the start index.
    ///
    /// Freed ranges are reused first-fit; an oversized range is split
    /// and the remainder stays on the freelist. Once the fixed
    /// capacity is spoken for, allocation fails and the caller's
    /// material creation fails with it.
    pub fn alloc(&self, count: u32) -> Result<u32> {
        let mut inner = self.bp_inner.lock().unwrap();

        for i in 0..inner.free.len() {
            let (start, avail) = inner.free[i];
            if avail >= count {
                if avail == count {
                    inner.free.remove(i);
                } else {
                    inner.free[i] = (start + count, avail - count);
                }
                for s in start..start + count {
                    inner.slots[s as usize] = BindRecord::default();
                }
                return Ok(start);
            }
        }

        let start = inner.slots.len() as u32;
        if start.checked_add(count).map_or(true, |end| end > BIND_POOL_CAPACITY) {
            log::error!("bind pool exhausted allocating {} records", count);
            return Err(SquallError::BIND_POOL_EXHAUSTED);
        }
        inner
            .slots
            .resize_with((start + count) as usize, BindRecord::default);
        return Ok(start);
    }

    /// Return a range to the pool.
    ///
    /// Callers must route this through a destroy list when the range
    /// may still be referenced by in-flight GPU work.
    pub fn free(&self, start: u32, count: u32) {
        let mut inner = self.bp_inner.lock().unwrap();
        // drop resource refs now, the range was fenced by the caller
        for s in start..start + count {
            if let Some(rec) = inner.slots.get_mut(s as usize) {
                *rec = BindRecord::default();
            }
        }
        inner.free.push((start, count));
    }

    /// Update one record in place.
    pub fn update<F: FnOnce(&mut BindRecord)>(&self, index: u32, f: F) {
        let mut inner = self.bp_inner.lock().unwrap();
        if let Some(rec) = inner.slots.get_mut(index as usize) {
            f(rec);
        }
    }

    /// Read a range under the pool lock.
    ///
    /// The lock is held for the duration of `f` so the slice stays
    /// valid even if another thread allocates concurrently.
    pub fn with_range<R, F: FnOnce(&[BindRecord]) -> R>(&self, start: u32, count: u32, f: F) -> R {
        let inner = self.bp_inner.lock().unwrap();
        let s = start as usize;
        let e = (start + count) as usize;
        f(&inner.slots[s..e.min(inner.slots.len())])
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.bp_inner.lock().unwrap().slots.len()
    }
}
