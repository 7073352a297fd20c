// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libitc contributors
//
// Reference-counted message handles. `MsgRef<T>` is the typed handle a
// producer fills in; `BaseRef<F>` is the type-erased handle a family queue
// hands back, narrowed to a concrete type by a TypeId check. Both drive the
// same refcount kept in the slot header: clone +1, drop −1, and the 1→0
// transition runs the destructor and returns the slot to its pool.
//
// give/take move a refcount unit in or out without touching the counter;
// enqueue is built on them, so handing a message to a queue costs no
// atomic RMW.

use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::links::SlotHdr;
use crate::message::{Member, Message};

/// Add one refcount unit to the message at `payload`.
pub(crate) unsafe fn incref(payload: *mut u8) {
    let hdr = SlotHdr::from_payload(payload);
    (*hdr).refs.fetch_add(1, Ordering::Relaxed);
}

/// Surrender one refcount unit. The decrement is a release so every write
/// to the message happens-before the destructor; the lone thread that
/// observes 1→0 takes an acquire fence, runs the destructor, returns the
/// slot, and finally surrenders the message's count on the pool core.
pub(crate) unsafe fn decref(payload: *mut u8) {
    let hdr = SlotHdr::from_payload(payload);
    if (*hdr).refs.fetch_sub(1, Ordering::Release) != 1 {
        return;
    }
    fence(Ordering::Acquire);
    debug_assert!(!(*hdr).pool.is_null());
    let pool = Arc::from_raw((*hdr).pool);
    (*hdr).pool = std::ptr::null();
    ((*hdr).drop_fn)(payload);
    pool.release(payload);
}

/// Surrender the unit held for a slot header directly (queue teardown).
pub(crate) unsafe fn release_unit(hdr: NonNull<SlotHdr>) {
    decref(SlotHdr::payload_of(hdr.as_ptr()));
}

unsafe fn use_count_of(payload: *mut u8) -> u32 {
    let hdr = SlotHdr::from_payload(payload);
    (*hdr).refs.load(Ordering::Relaxed)
}

unsafe fn type_id_of(payload: *mut u8) -> TypeId {
    let hdr = SlotHdr::from_payload(payload);
    (*hdr).type_id
}

/// An owning, optionally-empty handle to a message of concrete type `T`.
pub struct MsgRef<T: Message> {
    ptr: Option<NonNull<T>>,
    _owns: PhantomData<T>,
}

unsafe impl<T: Message> Send for MsgRef<T> {}
unsafe impl<T: Message + Sync> Sync for MsgRef<T> {}

impl<T: Message> MsgRef<T> {
    /// A handle referencing nothing.
    pub const fn empty() -> Self {
        MsgRef {
            ptr: None,
            _owns: PhantomData,
        }
    }

    /// Wrap an owned refcount unit without incrementing.
    pub(crate) unsafe fn adopt(payload: NonNull<T>) -> Self {
        MsgRef {
            ptr: Some(payload),
            _owns: PhantomData,
        }
    }

    /// Construct from a raw message pointer, taking a new refcount unit.
    ///
    /// # Safety
    /// `payload` must point at a live pool message of type `T`.
    pub unsafe fn from_ptr(payload: NonNull<T>) -> Self {
        incref(payload.as_ptr().cast());
        Self::adopt(payload)
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    pub fn get(&self) -> Option<&T> {
        self.ptr.map(|p| unsafe { &*p.as_ptr() })
    }

    /// Exclusive access, available only while this is the sole handle.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let p = self.ptr?;
        if self.use_count() == 1 {
            Some(unsafe { &mut *p.as_ptr() })
        } else {
            None
        }
    }

    /// The raw message pointer, or null when empty.
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// Advisory refcount of the referenced message; 0 when empty. Only the
    /// value 1 means anything once the message is shared across threads.
    pub fn use_count(&self) -> u32 {
        match self.ptr {
            None => 0,
            Some(p) => unsafe { use_count_of(p.as_ptr().cast()) },
        }
    }

    pub fn is_unique(&self) -> bool {
        self.use_count() == 1
    }

    /// Drop the reference, leaving the handle empty.
    pub fn reset(&mut self) {
        *self = MsgRef::empty();
    }

    /// Move the refcount unit out to the caller; the handle becomes empty
    /// and the counter is untouched.
    pub fn take(&mut self) -> Option<NonNull<T>> {
        self.ptr.take()
    }

    /// Install a refcount unit the caller owns, without incrementing.
    /// Whatever the handle held before is dropped.
    ///
    /// # Safety
    /// `payload` must point at a live pool message of type `T` and the
    /// caller must own one outstanding refcount unit for it.
    pub unsafe fn give(&mut self, payload: NonNull<T>) {
        self.reset();
        self.ptr = Some(payload);
    }

    /// Widen into the erased family handle; the refcount unit moves with
    /// it.
    pub fn erase<F>(mut self) -> BaseRef<F>
    where
        F: Message,
        T: Member<F>,
    {
        match self.take() {
            None => BaseRef::empty(),
            Some(p) => unsafe { BaseRef::adopt(p.cast()) },
        }
    }
}

impl<T: Message> Default for MsgRef<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Message> Clone for MsgRef<T> {
    fn clone(&self) -> Self {
        if let Some(p) = self.ptr {
            unsafe { incref(p.as_ptr().cast()) };
        }
        MsgRef {
            ptr: self.ptr,
            _owns: PhantomData,
        }
    }
}

impl<T: Message> Drop for MsgRef<T> {
    fn drop(&mut self) {
        if let Some(p) = self.ptr.take() {
            unsafe { decref(p.as_ptr().cast()) };
        }
    }
}

impl<T: Message> Deref for MsgRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get().expect("dereferenced an empty message handle")
    }
}

impl<T: Message> fmt::Debug for MsgRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgRef")
            .field("use_count", &self.use_count())
            .finish()
    }
}

/// An owning, optionally-empty handle to some member of family `F`, as
/// returned by queue and set dequeue. Narrow back to the concrete type to
/// touch the payload; a failed narrow is ordinary control flow, not an
/// error.
pub struct BaseRef<F: Message> {
    ptr: Option<NonNull<u8>>,
    _family: PhantomData<fn() -> F>,
}

unsafe impl<F: Message> Send for BaseRef<F> {}

impl<F: Message> BaseRef<F> {
    pub const fn empty() -> Self {
        BaseRef {
            ptr: None,
            _family: PhantomData,
        }
    }

    pub(crate) unsafe fn adopt(payload: NonNull<u8>) -> Self {
        BaseRef {
            ptr: Some(payload),
            _family: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    /// `TypeId` of the concrete message, or `None` when empty.
    pub fn type_id(&self) -> Option<TypeId> {
        self.ptr.map(|p| unsafe { type_id_of(p.as_ptr()) })
    }

    /// Whether the referenced message's concrete type is `T`.
    pub fn is<T: Member<F>>(&self) -> bool {
        self.type_id() == Some(TypeId::of::<T>())
    }

    /// Narrow to the concrete type: a new typed handle (one more refcount
    /// unit) when the runtime type is `T`, `None` otherwise.
    pub fn narrow<T: Member<F>>(&self) -> Option<MsgRef<T>> {
        let p = self.ptr?;
        if !self.is::<T>() {
            return None;
        }
        unsafe {
            incref(p.as_ptr());
            Some(MsgRef::adopt(p.cast()))
        }
    }

    pub fn use_count(&self) -> u32 {
        match self.ptr {
            None => 0,
            Some(p) => unsafe { use_count_of(p.as_ptr()) },
        }
    }

    pub fn is_unique(&self) -> bool {
        self.use_count() == 1
    }

    pub fn reset(&mut self) {
        *self = BaseRef::empty();
    }

    /// Move the refcount unit out to the caller; the counter is untouched.
    pub fn take(&mut self) -> Option<NonNull<u8>> {
        self.ptr.take()
    }

    /// Install a refcount unit the caller owns, without incrementing.
    ///
    /// # Safety
    /// `payload` must point at a live pool message of some `Member<F>`
    /// type and the caller must own one outstanding refcount unit for it.
    pub unsafe fn give(&mut self, payload: NonNull<u8>) {
        self.reset();
        self.ptr = Some(payload);
    }
}

impl<F: Message> Default for BaseRef<F> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<F: Message> Clone for BaseRef<F> {
    fn clone(&self) -> Self {
        if let Some(p) = self.ptr {
            unsafe { incref(p.as_ptr()) };
        }
        BaseRef {
            ptr: self.ptr,
            _family: PhantomData,
        }
    }
}

impl<F: Message> Drop for BaseRef<F> {
    fn drop(&mut self) {
        if let Some(p) = self.ptr.take() {
            unsafe { decref(p.as_ptr()) };
        }
    }
}

impl<F: Message> fmt::Debug for BaseRef<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseRef")
            .field("use_count", &self.use_count())
            .finish()
    }
}
