// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libitc contributors
//
// Fixed-width buffer pools. A pool owns a set of memory blocks carved into
// slots and keeps the unused slots on an internal free-list queue; release
// pushes at the head so the most recently used slot (and its cache lines)
// is reused first. Every live message holds one strong count on the pool
// core, so the blocks cannot be freed out from under in-flight messages.

use std::alloc::{alloc, dealloc, Layout};
use std::any::TypeId;
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{die, report, ErrorKind};
use crate::links::{slot_stride, Links, SlotHdr, SLOT_ALIGN};
use crate::message::{Member, Message, SlotSized};
use crate::queue::RawQueue;
use crate::shared::MsgRef;
use crate::waiter::{ClockId, Wait};

/// Readable snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Payload bytes per slot.
    pub slot_size: usize,
    /// Slots carved so far across all memory blocks.
    pub total_slots: usize,
    /// Slots currently off the free list.
    pub in_use: usize,
    /// Allocations that returned empty (exhaustion or timeout).
    pub alloc_fails: usize,
    /// Times the pool grew by its growth increment.
    pub grows: usize,
    /// Releases of a slot that was not in use.
    pub double_frees: usize,
}

/// One contiguous allocation holding a run of slots. Blocks are never freed
/// individually; they live until the pool core drops.
struct MemBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for MemBlock {}

impl MemBlock {
    fn new(layout: Layout) -> Option<MemBlock> {
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr).map(|ptr| MemBlock { ptr, layout })
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Untyped pool core, shared through an `Arc` by the typed `MsgPool` and by
/// every live message allocated from it.
pub(crate) struct RawPool {
    slot_size: usize,
    stride: usize,
    grow_by: usize,
    /// Declared before `blocks`: the free-list drain on drop walks slot
    /// headers that live inside the blocks.
    freelist: RawQueue,
    blocks: Mutex<Vec<MemBlock>>,
    total: AtomicUsize,
    in_use: AtomicUsize,
    alloc_fails: AtomicUsize,
    grows: AtomicUsize,
    double_frees: AtomicUsize,
}

impl RawPool {
    fn new(
        slot_size: usize,
        initial: usize,
        grow_by: usize,
        clock: ClockId,
    ) -> io::Result<Arc<RawPool>> {
        let pool = RawPool {
            slot_size,
            stride: slot_stride(slot_size),
            grow_by,
            freelist: RawQueue::new(clock)?,
            blocks: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            alloc_fails: AtomicUsize::new(0),
            grows: AtomicUsize::new(0),
            double_frees: AtomicUsize::new(0),
        };
        let mut pool = Arc::new(pool);
        Arc::get_mut(&mut pool).unwrap().freelist.init_head();
        pool.add_slots(initial);
        log::trace!(
            "pool created: slot_size={slot_size} initial={initial} grow_by={grow_by}"
        );
        Ok(pool)
    }

    /// Carve one fresh memory block into `n` slots and push them all onto
    /// the free list. Returns how many slots were actually added.
    fn add_slots(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let layout = match Layout::from_size_align(self.stride * n, SLOT_ALIGN) {
            Ok(l) => l,
            Err(_) => return 0,
        };
        let block = match MemBlock::new(layout) {
            Some(b) => b,
            None => return 0,
        };
        let base = block.ptr.as_ptr();
        self.blocks.lock().unwrap().push(block);
        for i in 0..n {
            unsafe {
                let hdr = base.add(i * self.stride).cast::<SlotHdr>();
                SlotHdr::init(hdr);
                self.total.fetch_add(1, Ordering::Relaxed);
                self.freelist.enqueue_head(NonNull::new_unchecked(hdr));
            }
        }
        n
    }

    /// Pop a free slot per the wait policy; `Grow` adds a block first when
    /// the free list is empty, so the pop that follows cannot miss.
    pub(crate) fn alloc(&self, wait: Wait) -> Option<NonNull<SlotHdr>> {
        let hdr = match wait {
            Wait::Grow => {
                if self.freelist.is_empty() {
                    let added = self.add_slots(self.grow_by);
                    if added > 0 {
                        self.grows.fetch_add(1, Ordering::Relaxed);
                        log::debug!("pool grew by {added} slots");
                    }
                }
                self.freelist.dequeue(Wait::NoWait)
            }
            w => self.freelist.dequeue(w),
        };
        match hdr {
            None => {
                self.alloc_fails.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(hdr) => {
                unsafe { (*hdr.as_ptr()).inuse = true };
                self.in_use.fetch_add(1, Ordering::Relaxed);
                Some(hdr)
            }
        }
    }

    /// Return a slot to the free list. A slot that is not in use counts a
    /// double free and leaves the free list untouched; a slot that is in
    /// use but still linked somewhere is a fatal invariant violation.
    pub(crate) fn release(&self, payload: *mut u8) {
        unsafe {
            let hdr = SlotHdr::from_payload(payload);
            Links::ok(SlotHdr::links_of(hdr));
            if !(*hdr).inuse {
                report(ErrorKind::DoubleFree);
                self.double_frees.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if Links::on_list(SlotHdr::links_of(hdr)) {
                die(ErrorKind::PoolReleaseAlreadyOnList);
            }
            (*hdr).inuse = false;
            self.freelist.enqueue_head(NonNull::new_unchecked(hdr));
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            slot_size: self.slot_size,
            total_slots: self.total.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            alloc_fails: self.alloc_fails.load(Ordering::Relaxed),
            grows: self.grows.load(Ordering::Relaxed),
            double_frees: self.double_frees.load(Ordering::Relaxed),
        }
    }
}

unsafe fn drop_in_slot<T>(payload: *mut u8) {
    ptr::drop_in_place(payload.cast::<T>());
}

/// Returns the slot and the pool count if the user constructor panics
/// between slot acquisition and placement.
struct CtorGuard {
    hdr: *mut SlotHdr,
}

impl Drop for CtorGuard {
    fn drop(&mut self) {
        unsafe {
            let pool = Arc::from_raw((*self.hdr).pool);
            (*self.hdr).pool = ptr::null();
            pool.release(SlotHdr::payload_of(self.hdr));
        }
    }
}

/// A pool of fixed-width slots for messages of family `F`. Cloning shares
/// the same pool.
pub struct MsgPool<F: Message> {
    raw: Arc<RawPool>,
    _family: PhantomData<fn() -> F>,
}

impl<F: Message> Clone for MsgPool<F> {
    fn clone(&self) -> Self {
        MsgPool {
            raw: Arc::clone(&self.raw),
            _family: PhantomData,
        }
    }
}

impl<F: Message> MsgPool<F> {
    /// A pool whose slots fit `F` exactly. `initial` slots are carved up
    /// front; `alloc(Wait::Grow)` adds `grow_by` more per grow event. The
    /// free-list's blocking waits measure against `clock`.
    pub fn new(initial: usize, grow_by: usize, clock: ClockId) -> io::Result<Self> {
        Self::with_slot_size(mem::size_of::<F>(), initial, grow_by, clock)
    }

    /// A pool whose slots fit the largest of a declared set of member
    /// types, e.g. `MsgPool::<Frame>::sized_for::<(Frame, KeyFrame)>(..)`.
    pub fn sized_for<S: SlotSized>(
        initial: usize,
        grow_by: usize,
        clock: ClockId,
    ) -> io::Result<Self> {
        let slot = S::SLOT_SIZE.max(mem::size_of::<F>());
        Self::with_slot_size(slot, initial, grow_by, clock)
    }

    fn with_slot_size(
        slot_size: usize,
        initial: usize,
        grow_by: usize,
        clock: ClockId,
    ) -> io::Result<Self> {
        Ok(MsgPool {
            raw: RawPool::new(slot_size, initial, grow_by, clock)?,
            _family: PhantomData,
        })
    }

    /// Acquire a slot per `wait` and construct `make()`'s value in it,
    /// returning a handle with refcount 1. The constructor only runs once
    /// a slot is actually held; exhaustion and timeout return `None`
    /// without touching `make`. A type too large (or too strictly aligned)
    /// for this pool's slots is reported as `BufferTooBigForPool`.
    pub fn alloc<T: Member<F>>(&self, wait: Wait, make: impl FnOnce() -> T) -> Option<MsgRef<T>> {
        if mem::size_of::<T>() > self.raw.slot_size || mem::align_of::<T>() > SLOT_ALIGN {
            report(ErrorKind::BufferTooBigForPool);
            return None;
        }
        let hdr = self.raw.alloc(wait)?;
        unsafe {
            let h = hdr.as_ptr();
            (*h).refs.store(1, Ordering::Relaxed);
            (*h).pool = Arc::into_raw(Arc::clone(&self.raw));
            (*h).type_id = TypeId::of::<T>();
            (*h).drop_fn = drop_in_slot::<T>;
            let payload = SlotHdr::payload_of(h).cast::<T>();
            let guard = CtorGuard { hdr: h };
            let value = make();
            ptr::write(payload, value);
            mem::forget(guard);
            Some(MsgRef::adopt(NonNull::new_unchecked(payload)))
        }
    }

    /// Manually add `n` slots (one fresh memory block) to the pool.
    pub fn add_slots(&self, n: usize) -> usize {
        self.raw.add_slots(n)
    }

    pub fn stats(&self) -> PoolStats {
        self.raw.stats()
    }

    /// Return a slot to the free list without running any destructor.
    ///
    /// Counterpart of `MsgRef::take`/`BaseRef::take` for code that manages
    /// the last refcount unit by hand. Releasing a slot that is already
    /// free counts a double free and is otherwise ignored.
    ///
    /// # Safety
    /// `payload` must have been obtained from this pool, and the caller
    /// must own the sole outstanding refcount unit for it.
    pub unsafe fn release_raw(&self, payload: *mut u8) {
        let hdr = SlotHdr::from_payload(payload);
        if !(*hdr).pool.is_null() {
            let stamped = Arc::from_raw((*hdr).pool);
            (*hdr).pool = ptr::null();
            drop(stamped);
        }
        self.raw.release(payload);
    }
}

impl<F: Message> std::fmt::Debug for MsgPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgPool").field("stats", &self.stats()).finish()
    }
}
