// Per-thread command submission substrate
//
// Every thread that records GPU work owns a command pool and a small
// ring of slots, each slot being a command buffer, a fence, an
// optional transient descriptor pool, and a destroy list. Batches are
// opened and closed by a plain acquire/release refcount, and a
// submitted batch can be observed through a generation checked Future.
//
// Threads register themselves in a fixed table guarded by a mutex and
// find their own state again through a thread local index. Entry and
// exit are rare (thread lifetime), so the table lock does not matter.

use ash::vk;

use crate::bump::{BumpSlice, FrameBumps};
use crate::descpool::SlotDescPool;
use crate::destroy::{DestroyItem, DestroyList};
use crate::device::Device;
use crate::{Result, SquallError, MAX_COMMAND_RING, MAX_FRAMES_IN_FLIGHT, MAX_RENDER_THREADS};

use std::cell::Cell;
use std::sync::{Arc, Mutex};

/// How long to wait on a recording fence before declaring the device
/// wedged, in nanoseconds.
const FENCE_TIMEOUT_NS: u64 = 4_000_000_000;

lazy_static! {
    /// The process-wide render thread table. Slots are claimed by
    /// `thread_init` and released by `thread_shutdown`.
    static ref THREAD_TABLE: Mutex<Vec<Option<Arc<CmdThread>>>> =
        Mutex::new((0..MAX_RENDER_THREADS).map(|_| None).collect());
}

thread_local! {
    /// Index into THREAD_TABLE for the calling thread, or -1.
    static THREAD_IDX: Cell<i32> = Cell::new(-1);
    /// True while this thread drains a fenced destroy list. Resource
    /// drops that fire in that window destroy immediately instead of
    /// re-entering the thread state lock.
    static IN_CMD_EXECUTE: Cell<bool> = Cell::new(false);
}

/// Run a fenced destroy list with the reentrancy guard up.
fn execute_destroy_list(dev: &Arc<Device>, slot: &CmdSlot) {
    IN_CMD_EXECUTE.with(|flag| flag.set(true));
    slot.cs_destroy.execute(dev);
    IN_CMD_EXECUTE.with(|flag| flag.set(false));
}

/// State for one ring slot that outlives the slot's reuse cycle.
/// Futures hold an Arc to this and compare generations.
pub(crate) struct CmdSlot {
    cs_state: Mutex<CmdSlotState>,
    /// Handles to destroy once this slot's fence signals. Any thread
    /// may append while the owner records or executes.
    pub cs_destroy: DestroyList,
}

struct CmdSlotState {
    cbuf: vk::CommandBuffer,
    fence: vk::Fence,
    desc_pool: Option<SlotDescPool>,
    /// True from batch open until the fence wait at reuse.
    alive: bool,
    /// Bumped every time the slot is recycled, invalidating any
    /// outstanding Future that still names the old value.
    generation: u64,
}

impl CmdSlot {
    fn new() -> Self {
        Self {
            cs_state: Mutex::new(CmdSlotState {
                cbuf: vk::CommandBuffer::null(),
                fence: vk::Fence::null(),
                desc_pool: None,
                alive: false,
                generation: 0,
            }),
            cs_destroy: DestroyList::new(),
        }
    }

    /// Run `f` with this slot's transient descriptor pool, which is
    /// None on push descriptor devices.
    pub fn with_desc_pool<R, F: FnOnce(Option<&SlotDescPool>) -> R>(&self, f: F) -> R {
        let state = self.cs_state.lock().unwrap();
        f(state.desc_pool.as_ref())
    }
}

/// A handle to one submitted batch.
///
/// Valid as long as the slot it names has not been recycled. Checking
/// a recycled future reports completion immediately, since slot reuse
/// only happens after the old work's fence signaled.
#[derive(Clone)]
pub struct Future {
    f_dev: Arc<Device>,
    f_slot: Arc<CmdSlot>,
    f_generation: u64,
}

impl Future {
    /// Non-blocking completion check.
    pub fn check(&self) -> bool {
        let state = self.f_slot.cs_state.lock().unwrap();
        if state.generation != self.f_generation {
            return true;
        }
        unsafe {
            self.f_dev
                .dev
                .get_fence_status(state.fence)
                .unwrap_or(true)
        }
    }

    /// Block until the batch completes.
    pub fn wait(&self) -> Result<()> {
        let state = self.f_slot.cs_state.lock().unwrap();
        if state.generation != self.f_generation {
            return Ok(());
        }
        unsafe {
            self.f_dev
                .dev
                .wait_for_fences(&[state.fence], true, u64::MAX)
                .or(Err(SquallError::FENCE_WAIT_FAILED))
        }
    }
}

/// An open recording context on the calling thread.
///
/// Everything here is cheap to clone around for the duration of a
/// draw; the command buffer handle is the live part.
#[derive(Clone)]
pub(crate) struct CmdCtx {
    pub cbuf: vk::CommandBuffer,
    pub slot: Arc<CmdSlot>,
    pub thread: Arc<CmdThread>,
}

struct ThreadState {
    pool: vk::CommandPool,
    ring: Vec<Arc<CmdSlot>>,
    /// Next slot to hand out, advances on every open.
    ring_index: usize,
    /// Slot index of the currently open batch.
    active: Option<usize>,
    /// Nested acquire depth for the open batch.
    ref_count: u32,
    last_submitted: Option<usize>,
    /// Upload bumps per flight index, created on first use.
    bumps: Vec<Option<FrameBumps>>,
    /// Frame serial last seen per flight index, detects wraparound.
    bump_serial: [u64; MAX_FRAMES_IN_FLIGHT],
}

/// Per-thread command state, one entry in the thread table.
pub(crate) struct CmdThread {
    ct_state: Mutex<ThreadState>,
}

impl CmdThread {
    fn new(dev: &Device) -> Self {
        Self {
            ct_state: Mutex::new(ThreadState {
                pool: dev.create_command_pool(),
                ring: (0..MAX_COMMAND_RING).map(|_| Arc::new(CmdSlot::new())).collect(),
                ring_index: 0,
                active: None,
                ref_count: 0,
                last_submitted: None,
                bumps: (0..MAX_FRAMES_IN_FLIGHT).map(|_| None).collect(),
                bump_serial: [0; MAX_FRAMES_IN_FLIGHT],
            }),
        }
    }

    /// Find a usable slot and start its command buffer.
    fn open_slot(state: &mut ThreadState, dev: &Arc<Device>) -> Result<usize> {
        let mut chosen = None;
        for i in 0..MAX_COMMAND_RING {
            let idx = (state.ring_index + i) % MAX_COMMAND_RING;
            let slot_alive = state.ring[idx].cs_state.lock().unwrap().alive;
            if !slot_alive {
                chosen = Some(idx);
                break;
            }
        }

        let idx = match chosen {
            Some(i) => i,
            None => {
                // every slot is in flight, block on the oldest one
                let idx = state.ring_index;
                let slot = state.ring[idx].clone();
                let mut sstate = slot.cs_state.lock().unwrap();
                let waited = unsafe {
                    dev.dev
                        .wait_for_fences(&[sstate.fence], true, FENCE_TIMEOUT_NS)
                };
                // reuse invalidates any outstanding futures
                sstate.generation += 1;
                sstate.alive = false;
                if waited.is_err() {
                    log::error!("timed out waiting for a command slot fence");
                    if dev.is_lost() {
                        return Err(SquallError::DEVICE_LOST);
                    }
                    return Err(SquallError::FENCE_WAIT_FAILED);
                }
                drop(sstate);
                execute_destroy_list(dev, &slot);
                idx
            }
        };

        let slot = state.ring[idx].clone();
        let mut sstate = slot.cs_state.lock().unwrap();

        unsafe {
            // lazily allocate slot resources on first use
            if sstate.cbuf == vk::CommandBuffer::null() {
                sstate.cbuf = dev.create_command_buffers(state.pool, 1)[0];
                sstate.fence = dev.create_fence();
                if dev.push_loader.is_none() {
                    sstate.desc_pool = Some(SlotDescPool::new(dev)?);
                }
            } else {
                dev.dev
                    .reset_command_buffer(sstate.cbuf, vk::CommandBufferResetFlags::empty())
                    .or(Err(SquallError::INVALID))?;
                dev.dev
                    .reset_fences(&[sstate.fence])
                    .or(Err(SquallError::INVALID))?;
                if let Some(pool) = sstate.desc_pool.as_ref() {
                    pool.reset(dev);
                }
            }

            let record_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            dev.dev
                .begin_command_buffer(sstate.cbuf, &record_info)
                .or(Err(SquallError::INVALID))?;
        }

        sstate.alive = true;
        drop(sstate);

        state.ring_index = (idx + 1) % MAX_COMMAND_RING;
        state.active = Some(idx);
        Ok(idx)
    }

    /// Open a batch. The thread must not already have one open.
    pub fn begin(self: &Arc<Self>, dev: &Arc<Device>) -> Result<CmdCtx> {
        {
            let state = self.ct_state.lock().unwrap();
            if state.ref_count != 0 {
                log::error!("cmd begin with {} unreleased acquires", state.ref_count);
                return Err(SquallError::INVALID);
            }
        }
        self.acquire(dev)
    }

    /// Increment the batch refcount, opening a batch if none is live.
    pub fn acquire(self: &Arc<Self>, dev: &Arc<Device>) -> Result<CmdCtx> {
        let mut state = self.ct_state.lock().unwrap();
        let idx = match state.active {
            Some(i) => i,
            None => Self::open_slot(&mut state, dev)?,
        };
        state.ref_count += 1;

        let slot = state.ring[idx].clone();
        let cbuf = slot.cs_state.lock().unwrap().cbuf;
        Ok(CmdCtx {
            cbuf,
            slot,
            thread: self.clone(),
        })
    }

    /// Drop one reference. The outermost release ends the buffer and
    /// submits it with the slot's fence.
    pub fn release(self: &Arc<Self>, dev: &Arc<Device>) -> Result<()> {
        let mut state = self.ct_state.lock().unwrap();
        if state.ref_count == 0 {
            log::error!("cmd release without a matching acquire");
            return Err(SquallError::INVALID);
        }
        state.ref_count -= 1;
        if state.ref_count > 0 {
            return Ok(());
        }

        let idx = match state.active.take() {
            Some(i) => i,
            None => return Ok(()),
        };
        let slot = state.ring[idx].clone();
        state.last_submitted = Some(idx);
        drop(state);

        let sstate = slot.cs_state.lock().unwrap();
        unsafe {
            dev.dev
                .end_command_buffer(sstate.cbuf)
                .or(Err(SquallError::INVALID))?;
        }
        dev.graphics_submit(sstate.cbuf, &[], &[], &[], sstate.fence)
    }

    /// Close and submit the batch with surface semaphores, returning a
    /// Future for the submission. Used by frame_end, which holds the
    /// one outstanding reference.
    pub fn end_submit(
        self: &Arc<Self>,
        dev: &Arc<Device>,
        wait_semas: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semas: &[vk::Semaphore],
    ) -> Result<Future> {
        let mut state = self.ct_state.lock().unwrap();
        if state.ref_count != 1 || state.active.is_none() {
            log::error!(
                "cmd end_submit with ref_count {} and active {:?}",
                state.ref_count,
                state.active
            );
            return Err(SquallError::INVALID);
        }
        state.ref_count = 0;
        let idx = state.active.take().unwrap();
        let slot = state.ring[idx].clone();
        state.last_submitted = Some(idx);
        drop(state);

        let sstate = slot.cs_state.lock().unwrap();
        unsafe {
            dev.dev
                .end_command_buffer(sstate.cbuf)
                .or(Err(SquallError::INVALID))?;
        }
        dev.graphics_submit(sstate.cbuf, wait_semas, wait_stages, signal_semas, sstate.fence)?;
        let generation = sstate.generation;
        drop(sstate);

        Ok(Future {
            f_dev: dev.clone(),
            f_slot: slot,
            f_generation: generation,
        })
    }

    /// Copy `data` into this thread's const bump for `flight`.
    pub fn alloc_const(
        &self,
        dev: &Arc<Device>,
        flight: usize,
        frame_serial: u64,
        data: &[u8],
    ) -> Result<BumpSlice> {
        self.alloc_bump(dev, flight, frame_serial, data, false)
    }

    /// Copy `data` into this thread's storage bump for `flight`.
    pub fn alloc_storage(
        &self,
        dev: &Arc<Device>,
        flight: usize,
        frame_serial: u64,
        data: &[u8],
    ) -> Result<BumpSlice> {
        self.alloc_bump(dev, flight, frame_serial, data, true)
    }

    fn alloc_bump(
        &self,
        dev: &Arc<Device>,
        flight: usize,
        frame_serial: u64,
        data: &[u8],
        storage: bool,
    ) -> Result<BumpSlice> {
        let mut state = self.ct_state.lock().unwrap();

        if state.bumps[flight].is_none() {
            state.bumps[flight] = Some(FrameBumps::new(dev)?);
        }
        // this flight index came around again, everything from its
        // last frame has been fenced
        if state.bump_serial[flight] != frame_serial {
            state.bump_serial[flight] = frame_serial;
            state.bumps[flight].as_mut().unwrap().reset();
        }

        let destroy = match state.active {
            Some(i) => state.ring[i].clone(),
            None => {
                log::error!("bump allocation outside of an open batch");
                return Err(SquallError::INVALID);
            }
        };

        let bumps = state.bumps[flight].as_mut().unwrap();
        let bump = match storage {
            false => &mut bumps.fb_const,
            true => &mut bumps.fb_storage,
        };
        bump.alloc_write(dev, &destroy.cs_destroy, data)
    }

    /// Tear down everything this thread owns. Waits for in flight
    /// slots, drains their destroy lists, then destroys the slot
    /// resources and the command pool.
    fn destroy(&self, dev: &Arc<Device>) {
        let mut state = self.ct_state.lock().unwrap();

        for slot in state.ring.iter() {
            let mut sstate = slot.cs_state.lock().unwrap();
            if sstate.alive {
                unsafe {
                    dev.dev
                        .wait_for_fences(&[sstate.fence], true, FENCE_TIMEOUT_NS)
                        .ok();
                }
                sstate.generation += 1;
                sstate.alive = false;
            }
            drop(sstate);
            execute_destroy_list(dev, slot);

            let mut sstate = slot.cs_state.lock().unwrap();
            unsafe {
                if sstate.fence != vk::Fence::null() {
                    dev.dev.destroy_fence(sstate.fence, None);
                    sstate.fence = vk::Fence::null();
                }
            }
            if let Some(pool) = sstate.desc_pool.take() {
                pool.destroy(dev);
            }
            sstate.cbuf = vk::CommandBuffer::null();
        }

        for bumps in state.bumps.iter_mut() {
            if let Some(mut b) = bumps.take() {
                b.destroy(dev);
            }
        }

        unsafe {
            dev.dev.destroy_command_pool(state.pool, None);
        }
        state.pool = vk::CommandPool::null();
    }
}

/// Register the calling thread so it can record GPU work.
///
/// Claims the next free slot in the thread table. Calling this twice
/// on the same thread is a no-op.
pub fn thread_init(dev: &Arc<Device>) -> Result<()> {
    if THREAD_IDX.with(|idx| idx.get()) >= 0 {
        return Ok(());
    }

    let mut table = THREAD_TABLE.lock().unwrap();
    for (i, entry) in table.iter_mut().enumerate() {
        if entry.is_none() {
            *entry = Some(Arc::new(CmdThread::new(dev)));
            THREAD_IDX.with(|idx| idx.set(i as i32));
            log::debug!("render thread registered in slot {}", i);
            return Ok(());
        }
    }

    log::error!("render thread table is full");
    Err(SquallError::THREAD_TABLE_FULL)
}

/// Unregister the calling thread, flushing all of its pending work
/// and destruction. The table slot becomes reusable.
pub fn thread_shutdown(dev: &Arc<Device>) {
    let idx = THREAD_IDX.with(|idx| idx.replace(-1));
    if idx < 0 {
        return;
    }

    let entry = THREAD_TABLE.lock().unwrap()[idx as usize].take();
    if let Some(thread) = entry {
        thread.destroy(dev);
    }
}

/// The calling thread's command state.
pub(crate) fn current_thread() -> Result<Arc<CmdThread>> {
    let idx = THREAD_IDX.with(|idx| idx.get());
    if idx < 0 {
        return Err(SquallError::THREAD_NOT_INITIALIZED);
    }
    THREAD_TABLE.lock().unwrap()[idx as usize]
        .clone()
        .ok_or(SquallError::THREAD_NOT_INITIALIZED)
}

/// Route a handle to a destroy list that is fenced behind GPU work.
///
/// Preference order: the calling thread's open batch, the first
/// registered thread's open batch, that thread's last submitted
/// batch, and finally immediate destruction when nothing is in
/// flight anywhere.
pub(crate) fn schedule_destroy(dev: &Arc<Device>, item: DestroyItem) {
    // Drops triggered while a fenced destroy list drains are already
    // safe to act on, and must not re-enter the thread state lock.
    if IN_CMD_EXECUTE.with(|flag| flag.get()) {
        unsafe { item.destroy(dev) };
        return;
    }

    // calling thread first
    if let Ok(thread) = current_thread() {
        let state = thread.ct_state.lock().unwrap();
        if let Some(idx) = state.active {
            state.ring[idx].cs_destroy.push(item);
            return;
        }
    }

    // fall back to the first live thread in the table
    let first = THREAD_TABLE
        .lock()
        .unwrap()
        .iter()
        .flatten()
        .next()
        .cloned();
    if let Some(thread) = first {
        let state = thread.ct_state.lock().unwrap();
        if let Some(idx) = state.active {
            state.ring[idx].cs_destroy.push(item);
            return;
        }
        if let Some(idx) = state.last_submitted {
            let slot = &state.ring[idx];
            if slot.cs_state.lock().unwrap().alive {
                slot.cs_destroy.push(item);
                return;
            }
        }
    }

    unsafe { item.destroy(dev) };
}

/// Destroy every registered thread's state. Only safe once no other
/// thread records commands, which renderer shutdown guarantees by
/// waiting for the device to idle.
pub(crate) fn shutdown_all(dev: &Arc<Device>) {
    THREAD_IDX.with(|idx| idx.set(-1));
    let entries: Vec<_> = THREAD_TABLE
        .lock()
        .unwrap()
        .iter_mut()
        .map(|e| e.take())
        .collect();
    for thread in entries.into_iter().flatten() {
        thread.destroy(dev);
    }
}

/// How many table slots are currently claimed.
pub fn thread_count() -> usize {
    THREAD_TABLE
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.is_some())
        .count()
}
