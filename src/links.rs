// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libitc contributors
//
// Intrusive circular doubly-linked list node and the slot header laid out
// in front of every pool payload. All list surgery happens through raw
// pointers while the owning queue's mutex is held; the node carries a
// back-pointer to its owning list and a sentinel word so that misuse is
// detected instead of silently corrupting the list.

use std::any::TypeId;
use std::ptr;
use std::sync::atomic::AtomicU32;

use crate::error::{die, ErrorKind};
use crate::pool::RawPool;

/// Sentinel word stamped into every initialized link node.
const LINKS_MAGIC: u32 = 0x6974_6371;

/// Payload alignment guaranteed by every pool slot.
pub(crate) const SLOT_ALIGN: usize = 16;

/// A cell of an intrusive circular doubly-linked list. A list is represented
/// by a sentinel `Links` whose `next`/`prev` point at the first/last element
/// (or at itself when empty). `list` points at the owning sentinel while the
/// node is linked in and is null otherwise.
#[repr(C)]
pub(crate) struct Links {
    next: *mut Links,
    prev: *mut Links,
    list: *mut Links,
    magic: u32,
}

impl Links {
    /// A not-yet-initialized node. `init` must run at its final address
    /// before any other operation.
    pub(crate) const fn unlinked() -> Links {
        Links {
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            list: ptr::null_mut(),
            magic: 0,
        }
    }

    /// Self-link `this` and stamp the sentinel word.
    pub(crate) unsafe fn init(this: *mut Links) {
        (*this).next = this;
        (*this).prev = this;
        (*this).list = ptr::null_mut();
        (*this).magic = LINKS_MAGIC;
    }

    /// Whether `init` has ever run at this address.
    pub(crate) unsafe fn is_initialized(this: *const Links) -> bool {
        (*this).magic == LINKS_MAGIC
    }

    /// Verify the sentinel word. A mismatch means the node is arbitrary
    /// memory, not a link node; that is unrecoverable.
    #[track_caller]
    pub(crate) unsafe fn ok(this: *const Links) {
        if (*this).magic != LINKS_MAGIC {
            die(ErrorKind::LinksMagicCorrupt);
        }
    }

    pub(crate) unsafe fn is_empty(this: *const Links) -> bool {
        Self::ok(this);
        (*this).next.cast_const() == this && (*this).prev.cast_const() == this
    }

    pub(crate) unsafe fn on_list(item: *const Links) -> bool {
        !(*item).list.is_null()
    }

    /// First element of the list headed by the sentinel `this`. Only
    /// meaningful when the list is non-empty.
    pub(crate) unsafe fn head(this: *const Links) -> *mut Links {
        Self::ok(this);
        (*this).next
    }

    /// Whether `item` is linked onto the list headed by `this`.
    pub(crate) unsafe fn validate(this: *const Links, item: *const Links) -> bool {
        Self::ok(this);
        (*item).list.cast_const() == this
    }

    /// Insert `item` directly after the sentinel (list head).
    #[track_caller]
    pub(crate) unsafe fn insert_head(this: *mut Links, item: *mut Links) {
        Self::ok(this);
        Self::ok(item);
        if Self::on_list(item) {
            die(ErrorKind::LinksAddAlreadyOnList);
        }
        (*item).next = (*this).next;
        (*item).prev = this;
        (*(*this).next).prev = item;
        (*this).next = item;
        (*item).list = this;
    }

    /// Insert `item` directly before the sentinel (list tail).
    #[track_caller]
    pub(crate) unsafe fn insert_tail(this: *mut Links, item: *mut Links) {
        Self::ok(this);
        Self::ok(item);
        if Self::on_list(item) {
            die(ErrorKind::LinksAddAlreadyOnList);
        }
        (*item).next = this;
        (*item).prev = (*this).prev;
        (*(*this).prev).next = item;
        (*this).prev = item;
        (*item).list = this;
    }

    /// Unlink `item` from whatever list it is on and self-link it again.
    #[track_caller]
    pub(crate) unsafe fn remove(item: *mut Links) {
        Self::ok(item);
        if !Self::on_list(item) {
            die(ErrorKind::LinksRemoveNotOnList);
        }
        (*item).list = ptr::null_mut();
        (*(*item).next).prev = (*item).prev;
        (*(*item).prev).next = (*item).next;
        (*item).next = item;
        (*item).prev = item;
    }
}

/// Per-slot header, laid out immediately before the payload region so that
/// `payload − 1 header` recovers it from a user-held pointer. The link node
/// threads the slot onto the pool free list or a message queue; the
/// remaining fields carry the occupant's lifetime state and are restamped on
/// every allocation.
#[repr(C, align(16))]
pub(crate) struct SlotHdr {
    pub(crate) links: Links,
    pub(crate) inuse: bool,
    pub(crate) refs: AtomicU32,
    pub(crate) pool: *const RawPool,
    pub(crate) type_id: TypeId,
    pub(crate) drop_fn: unsafe fn(*mut u8),
}

unsafe fn drop_nothing(_payload: *mut u8) {}

impl SlotHdr {
    /// Initialize a freshly carved slot header in place.
    pub(crate) unsafe fn init(this: *mut SlotHdr) {
        Links::init(ptr::addr_of_mut!((*this).links));
        ptr::addr_of_mut!((*this).inuse).write(false);
        ptr::addr_of_mut!((*this).refs).write(AtomicU32::new(0));
        ptr::addr_of_mut!((*this).pool).write(ptr::null());
        ptr::addr_of_mut!((*this).type_id).write(TypeId::of::<()>());
        ptr::addr_of_mut!((*this).drop_fn).write(drop_nothing);
    }

    /// The payload region starts right after the header.
    pub(crate) unsafe fn payload_of(this: *mut SlotHdr) -> *mut u8 {
        this.add(1).cast()
    }

    /// Recover the header from a payload pointer.
    pub(crate) unsafe fn from_payload(payload: *mut u8) -> *mut SlotHdr {
        payload.cast::<SlotHdr>().sub(1)
    }

    pub(crate) unsafe fn links_of(this: *mut SlotHdr) -> *mut Links {
        ptr::addr_of_mut!((*this).links)
    }

    /// Recover the header from its (first-field) link node.
    pub(crate) fn from_links(links: *mut Links) -> *mut SlotHdr {
        links.cast()
    }
}

/// Distance between consecutive slots: the header plus the payload width
/// padded so the next header stays 16-byte aligned.
pub(crate) fn slot_stride(slot_size: usize) -> usize {
    std::mem::size_of::<SlotHdr>() + round_up(slot_size, SLOT_ALIGN)
}

pub(crate) fn round_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}
