// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libitc contributors
//
// Blocking queues of slot headers. `RawQueue` is the untyped core shared by
// message queues and pool free lists: an intrusive list guarded by a
// clock-bound waiter, with an optional redirection hook installed while the
// queue belongs to a queue set. `MsgQueue<F>` is the typed FIFO the user
// enqueues messages onto.
//
// Lock order: no path holds this queue's mutex while acquiring a set's
// mutex. Enqueue inserts under the queue mutex, releases it, signals the
// local condition, and only then signals the set's condition under the
// set's mutex. A set dequeuer holds the set mutex from scan to wait, so a
// post-insert set signal cannot be lost.

use std::cell::UnsafeCell;
use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{die, report, ErrorKind};
use crate::links::{Links, SlotHdr};
use crate::message::{Member, Message};
use crate::shared::{release_unit, BaseRef, MsgRef};
use crate::waiter::{ClockId, Wait, Waiter};

/// Wakeup redirection installed on a queue while it belongs to a set:
/// enqueues also signal the set's condition, and the queue's own dequeue is
/// rejected.
pub(crate) struct SetHook {
    pub(crate) waiter: Arc<Waiter>,
    pub(crate) id: i32,
}

pub(crate) struct RawQueue {
    waiter: Waiter,
    /// List sentinel. Guarded by `waiter`'s mutex.
    head: UnsafeCell<Links>,
    redirect: Mutex<Option<SetHook>>,
    /// One concurrent dequeuer per queue; driven by the typed wrappers.
    busy: AtomicBool,
}

unsafe impl Send for RawQueue {}
unsafe impl Sync for RawQueue {}

impl RawQueue {
    pub(crate) fn new(clock: ClockId) -> io::Result<RawQueue> {
        Ok(RawQueue {
            waiter: Waiter::new(clock)?,
            head: UnsafeCell::new(Links::unlinked()),
            redirect: Mutex::new(None),
            busy: AtomicBool::new(false),
        })
    }

    /// Self-link the sentinel. Must run once the queue has reached its
    /// final address, before any enqueue/dequeue.
    pub(crate) fn init_head(&mut self) {
        unsafe { Links::init(self.head.get()) };
    }

    pub(crate) fn is_empty(&self) -> bool {
        let _g = self.waiter.lock();
        unsafe { Links::is_empty(self.head.get()) }
    }

    /// Insert at the head (LIFO). Used by pool free lists to keep caches
    /// warm: the most recently released slot is handed out next.
    pub(crate) fn enqueue_head(&self, hdr: NonNull<SlotHdr>) {
        self.enqueue_at(hdr, true);
    }

    /// Insert at the tail (FIFO). Used by message queues.
    pub(crate) fn enqueue_tail(&self, hdr: NonNull<SlotHdr>) {
        self.enqueue_at(hdr, false);
    }

    fn enqueue_at(&self, hdr: NonNull<SlotHdr>, at_head: bool) {
        let item = unsafe { SlotHdr::links_of(hdr.as_ptr()) };
        unsafe {
            Links::ok(item);
            if Links::on_list(item) {
                die(ErrorKind::QueueEnqueueAlreadyOnList);
            }
        }
        {
            let _g = self.waiter.lock();
            unsafe {
                if at_head {
                    Links::insert_head(self.head.get(), item);
                } else {
                    Links::insert_tail(self.head.get(), item);
                }
            }
        }
        self.waiter.notify_one();
        let hook = self.redirect.lock().unwrap();
        if let Some(hook) = hook.as_ref() {
            let _g = hook.waiter.lock();
            hook.waiter.notify_one();
        }
    }

    /// Remove and return the head, blocking per `wait`. Queues absorbed
    /// into a set reject this; the set's dequeue is the only entry point.
    pub(crate) fn dequeue(&self, wait: Wait) -> Option<NonNull<SlotHdr>> {
        if self.in_set() {
            report(ErrorKind::QueueInASet);
            return None;
        }
        let g = self.waiter.lock();
        let head = self.head.get();
        match wait {
            Wait::Grow => return None,
            Wait::Forever => unsafe {
                while Links::is_empty(head) {
                    g.wait();
                }
            },
            Wait::NoWait | Wait::Millis(0) => unsafe {
                if Links::is_empty(head) {
                    return None;
                }
            },
            Wait::Millis(ms) => unsafe {
                let mut deadline = None;
                while Links::is_empty(head) {
                    let ts = deadline.get_or_insert_with(|| self.waiter.deadline_in(ms));
                    if !g.wait_until(ts) {
                        return None;
                    }
                }
            },
        }
        Some(unsafe { self.take_head() })
    }

    /// Lock, and remove the head if there is one. Used by set dequeue while
    /// the set's mutex is already held.
    pub(crate) fn steal_head(&self) -> Option<NonNull<SlotHdr>> {
        let _g = self.waiter.lock();
        unsafe {
            if Links::is_empty(self.head.get()) {
                return None;
            }
            Some(self.take_head())
        }
    }

    /// Caller holds the mutex and has checked non-empty.
    unsafe fn take_head(&self) -> NonNull<SlotHdr> {
        let head = self.head.get();
        let item = Links::head(head);
        Links::ok(item);
        if !Links::validate(head, item) {
            die(ErrorKind::QueueDequeueNotOnThisList);
        }
        Links::remove(item);
        NonNull::new_unchecked(SlotHdr::from_links(item))
    }

    pub(crate) fn in_set(&self) -> bool {
        self.redirect.lock().unwrap().is_some()
    }

    /// Install a set redirection. Fails if the queue already belongs to a
    /// set (any set).
    pub(crate) fn set_redirect(&self, hook: SetHook) -> bool {
        let mut r = self.redirect.lock().unwrap();
        if r.is_some() {
            return false;
        }
        *r = Some(hook);
        true
    }

    /// Clear the redirection if it points at `set_waiter`'s set; returns
    /// the priority id it was registered under.
    pub(crate) fn clear_redirect(&self, set_waiter: &Arc<Waiter>) -> Option<i32> {
        let mut r = self.redirect.lock().unwrap();
        match r.as_ref() {
            Some(h) if Arc::ptr_eq(&h.waiter, set_waiter) => {
                let id = h.id;
                *r = None;
                Some(id)
            }
            _ => None,
        }
    }

    pub(crate) fn begin_dequeue(&self) -> bool {
        !self.busy.swap(true, Ordering::Acquire)
    }

    pub(crate) fn end_dequeue(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl Drop for RawQueue {
    fn drop(&mut self) {
        // Exclusive access: surrender the refcount unit held by every
        // message still queued. Free-list slots (not in use) just unlink;
        // their storage belongs to the pool's memory blocks.
        unsafe {
            let head = self.head.get();
            if !Links::is_initialized(head) {
                return;
            }
            while !Links::is_empty(head) {
                let item = Links::head(head);
                Links::remove(item);
                let hdr = SlotHdr::from_links(item);
                if (*hdr).inuse {
                    release_unit(NonNull::new_unchecked(hdr));
                }
            }
        }
    }
}

/// A FIFO of messages belonging to family `F`: many producers, one
/// consumer. Cloning shares the same queue.
pub struct MsgQueue<F: Message> {
    raw: Arc<RawQueue>,
    _family: PhantomData<fn() -> F>,
}

impl<F: Message> Clone for MsgQueue<F> {
    fn clone(&self) -> Self {
        MsgQueue {
            raw: Arc::clone(&self.raw),
            _family: PhantomData,
        }
    }
}

impl<F: Message> MsgQueue<F> {
    /// Create a queue whose timed dequeues measure against `clock`.
    pub fn new(clock: ClockId) -> io::Result<Self> {
        let mut raw = Arc::new(RawQueue::new(clock)?);
        Arc::get_mut(&mut raw).unwrap().init_head();
        Ok(MsgQueue {
            raw,
            _family: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Enqueue a message; the handle's refcount unit transfers to the
    /// queue, leaving `msg` consumed. Returns false (after reporting
    /// `EnqueueEmptyHandle`) if the handle was empty.
    ///
    /// Safe to call from many threads at once.
    pub fn enqueue<T: Member<F>>(&self, mut msg: MsgRef<T>) -> bool {
        match msg.take() {
            None => {
                report(ErrorKind::EnqueueEmptyHandle);
                false
            }
            Some(p) => {
                let hdr = unsafe { SlotHdr::from_payload(p.as_ptr().cast()) };
                self.raw
                    .enqueue_tail(unsafe { NonNull::new_unchecked(hdr) });
                true
            }
        }
    }

    /// Enqueue an already-erased handle, e.g. one dequeued elsewhere and
    /// routed on.
    pub fn enqueue_any(&self, mut msg: BaseRef<F>) -> bool {
        match msg.take() {
            None => {
                report(ErrorKind::EnqueueEmptyHandle);
                false
            }
            Some(p) => {
                let hdr = unsafe { SlotHdr::from_payload(p.as_ptr()) };
                self.raw
                    .enqueue_tail(unsafe { NonNull::new_unchecked(hdr) });
                true
            }
        }
    }

    /// Dequeue the oldest message, blocking per `wait` (`Grow` is an
    /// allocation-only policy and misses immediately). Returns `None` on
    /// timeout, on `NoWait` with an empty queue, if the queue belongs to a
    /// set, or if another thread is already dequeuing.
    pub fn dequeue(&self, wait: Wait) -> Option<BaseRef<F>> {
        if wait == Wait::Grow {
            return None;
        }
        if !self.raw.begin_dequeue() {
            report(ErrorKind::ConcurrentDequeue);
            return None;
        }
        let hdr = self.raw.dequeue(wait);
        self.raw.end_dequeue();
        hdr.map(|h| unsafe {
            BaseRef::adopt(NonNull::new_unchecked(SlotHdr::payload_of(h.as_ptr())))
        })
    }

    pub(crate) fn raw(&self) -> &Arc<RawQueue> {
        &self.raw
    }
}

impl<F: Message> std::fmt::Debug for MsgQueue<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgQueue")
            .field("empty", &self.raw.is_empty())
            .field("in_set", &self.raw.in_set())
            .finish()
    }
}
