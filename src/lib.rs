// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libitc contributors
//
// In-process inter-thread messaging. Three coupled facilities:
// fixed-width buffer pools with O(1) allocate/release, reference-counted
// messages whose storage is a pool slot, and blocking FIFO queues that can
// be multiplexed into a priority-ordered set serviced by one consumer.
//
// A producer allocates a slot from a `MsgPool`, constructs a message in
// place and gets back a `MsgRef`; enqueueing moves the handle's refcount
// unit into a `MsgQueue`. The consumer dequeues (directly or through a
// `MsgQueueSet`) a `BaseRef` and narrows it to the concrete type. When the
// last handle drops, the destructor runs and the slot returns to its
// pool's free list.

mod error;
pub use error::{set_assert_handler, AssertHandler, ErrorKind};

mod links;

mod waiter;
pub use waiter::{ClockId, Wait};

mod message;
pub use message::{Member, Message, SlotSized};

mod shared;
pub use shared::{BaseRef, MsgRef};

mod queue;
pub use queue::MsgQueue;

mod pool;
pub use pool::{MsgPool, PoolStats};

mod queue_set;
pub use queue_set::MsgQueueSet;
