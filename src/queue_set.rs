// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libitc contributors
//
// A priority-ordered set of queues serviced by one consumer. Member queues
// are kept sorted ascending by their id (lowest id = highest priority) and
// their wakeups are redirected onto the set's shared condition, so a single
// dequeue call can sleep for all of them and always return the head of the
// highest-priority non-empty queue.
//
// Lock order: set mutex before member mutex. The dequeuer holds the set
// mutex across the scan and the wait; member enqueues signal the set
// condition without holding their own mutex (see queue.rs), so the two
// orders never cross.

use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{report, ErrorKind};
use crate::links::SlotHdr;
use crate::message::Message;
use crate::queue::{MsgQueue, RawQueue, SetHook};
use crate::shared::BaseRef;
use crate::waiter::{ClockId, Wait, Waiter};

#[derive(Clone)]
struct SetEntry {
    id: i32,
    queue: Arc<RawQueue>,
}

struct SetCore {
    waiter: Arc<Waiter>,
    /// Sorted ascending by id; ties keep insertion order.
    members: Mutex<Vec<SetEntry>>,
    busy: AtomicBool,
}

impl Drop for SetCore {
    fn drop(&mut self) {
        let members = self.members.get_mut().unwrap();
        for e in members.drain(..) {
            e.queue.clear_redirect(&self.waiter);
        }
    }
}

/// A set of `MsgQueue<F>`s multiplexed onto one consumer, serviced in
/// ascending-id priority order. Cloning shares the same set.
pub struct MsgQueueSet<F: Message> {
    core: Arc<SetCore>,
    _family: PhantomData<fn() -> F>,
}

impl<F: Message> Clone for MsgQueueSet<F> {
    fn clone(&self) -> Self {
        MsgQueueSet {
            core: Arc::clone(&self.core),
            _family: PhantomData,
        }
    }
}

impl<F: Message> MsgQueueSet<F> {
    /// Create a set whose shared condition measures deadlines against
    /// `clock`.
    pub fn new(clock: ClockId) -> io::Result<Self> {
        Ok(MsgQueueSet {
            core: Arc::new(SetCore {
                waiter: Arc::new(Waiter::new(clock)?),
                members: Mutex::new(Vec::new()),
                busy: AtomicBool::new(false),
            }),
            _family: PhantomData,
        })
    }

    /// Add a queue under priority id `id` (lower id = serviced first; equal
    /// ids keep insertion order). Fails with `QueueInASet` if the queue
    /// already belongs to any set. Not safe against a concurrent `dequeue`
    /// on this set.
    pub fn add(&self, queue: &MsgQueue<F>, id: i32) -> bool {
        let hook = SetHook {
            waiter: Arc::clone(&self.core.waiter),
            id,
        };
        if !queue.raw().set_redirect(hook) {
            report(ErrorKind::QueueInASet);
            return false;
        }
        let mut members = self.core.members.lock().unwrap();
        let pos = members
            .iter()
            .position(|e| e.id > id)
            .unwrap_or(members.len());
        members.insert(
            pos,
            SetEntry {
                id,
                queue: Arc::clone(queue.raw()),
            },
        );
        log::debug!("queue joined set: id={id} members={}", members.len());
        true
    }

    /// Remove a queue, restoring its standalone dequeue. Returns whether it
    /// was a member of this set. Not safe against a concurrent `dequeue`
    /// on this set.
    pub fn remove(&self, queue: &MsgQueue<F>) -> bool {
        let Some(id) = queue.raw().clear_redirect(&self.core.waiter) else {
            return false;
        };
        let mut members = self.core.members.lock().unwrap();
        if let Some(pos) = members
            .iter()
            .position(|e| Arc::ptr_eq(&e.queue, queue.raw()))
        {
            members.remove(pos);
        }
        log::debug!("queue left set: id={id} members={}", members.len());
        true
    }

    /// Dequeue from the highest-priority non-empty member queue, blocking
    /// per `wait`; returns the message and the member's id. When every
    /// queue is empty on entry, the first message to arrive anywhere in
    /// the set wins regardless of priority.
    pub fn dequeue(&self, wait: Wait) -> Option<(BaseRef<F>, i32)> {
        if wait == Wait::Grow {
            return None;
        }
        if self.core.members.lock().unwrap().is_empty() {
            report(ErrorKind::QueueSetEmpty);
            return None;
        }
        if self.core.busy.swap(true, Ordering::Acquire) {
            report(ErrorKind::ConcurrentDequeue);
            return None;
        }
        let got = self.scan(wait);
        self.core.busy.store(false, Ordering::Release);
        got
    }

    fn scan(&self, wait: Wait) -> Option<(BaseRef<F>, i32)> {
        let g = self.core.waiter.lock();
        let mut deadline = None;
        loop {
            let members: Vec<SetEntry> = self.core.members.lock().unwrap().clone();
            for e in &members {
                if let Some(hdr) = e.queue.steal_head() {
                    let msg = unsafe {
                        BaseRef::adopt(NonNull::new_unchecked(SlotHdr::payload_of(hdr.as_ptr())))
                    };
                    return Some((msg, e.id));
                }
            }
            match wait {
                Wait::Grow | Wait::NoWait | Wait::Millis(0) => return None,
                Wait::Forever => g.wait(),
                Wait::Millis(ms) => {
                    let ts = deadline.get_or_insert_with(|| self.core.waiter.deadline_in(ms));
                    if !g.wait_until(ts) {
                        return None;
                    }
                }
            }
        }
    }
}

impl<F: Message> std::fmt::Debug for MsgQueueSet<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members = self.core.members.lock().unwrap();
        let ids: Vec<i32> = members.iter().map(|e| e.id).collect();
        f.debug_struct("MsgQueueSet").field("ids", &ids).finish()
    }
}
