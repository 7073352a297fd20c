// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libitc contributors
//
// Error taxonomy and the process-wide assertion handler.
// User errors are recoverable: the handler is invoked with fatal=false and
// the offending call returns empty/false. Internal-invariant errors indicate
// memory corruption or a library bug; continuing would risk use-after-free,
// so those reports diverge.

use std::panic::Location;
use std::process;
use std::sync::RwLock;

use thiserror::Error;

/// Everything the assertion handler can be called with.
///
/// The first group are user errors (recoverable); the second group are
/// internal invariant violations (fatal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// The requested message type does not fit the pool's slot width.
    #[error("message does not fit the pool's slot width")]
    BufferTooBigForPool,
    /// A slot that is not in use was released again.
    #[error("double free of a pool slot")]
    DoubleFree,
    /// The queue belongs to a queue set; its own dequeue must not be used,
    /// and it cannot join a second set.
    #[error("queue is a member of a queue set")]
    QueueInASet,
    /// Dequeue on a queue set with no member queues.
    #[error("queue set has no member queues")]
    QueueSetEmpty,
    /// Enqueue of a handle that references no message.
    #[error("enqueue of an empty message handle")]
    EnqueueEmptyHandle,
    /// A second thread entered dequeue on a queue or set that already has a
    /// dequeuer; one consumer per queue is the supported model.
    #[error("concurrent dequeue on a single queue")]
    ConcurrentDequeue,

    /// A link node's sentinel word does not match; the memory is corrupt.
    #[error("link node sentinel corrupt")]
    LinksMagicCorrupt,
    /// Insert of a link node that already belongs to a list.
    #[error("link insert: node already on a list")]
    LinksAddAlreadyOnList,
    /// Remove of a link node that is not on any list.
    #[error("link remove: node not on any list")]
    LinksRemoveNotOnList,
    /// Release of a slot that still sits on some list.
    #[error("pool release: slot still on a list")]
    PoolReleaseAlreadyOnList,
    /// The head of a queue's list does not claim to belong to that queue.
    #[error("dequeue: slot not on this queue")]
    QueueDequeueNotOnThisList,
    /// Enqueue of a slot that already sits on some list.
    #[error("enqueue: slot already on a list")]
    QueueEnqueueAlreadyOnList,
}

impl ErrorKind {
    /// Whether this kind indicates an internal invariant violation rather
    /// than a user error. Internal kinds are always reported as fatal.
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            ErrorKind::LinksMagicCorrupt
                | ErrorKind::LinksAddAlreadyOnList
                | ErrorKind::LinksRemoveNotOnList
                | ErrorKind::PoolReleaseAlreadyOnList
                | ErrorKind::QueueDequeueNotOnThisList
                | ErrorKind::QueueEnqueueAlreadyOnList
        )
    }
}

/// Signature of the process-wide assertion handler: kind, fatal, source file,
/// source line.
///
/// A handler invoked with `fatal == true` must not return control to the
/// library thread; if it does return anyway, the process is aborted.
pub type AssertHandler = fn(ErrorKind, bool, &'static str, u32);

static ASSERT_HANDLER: RwLock<AssertHandler> = RwLock::new(default_assert_handler);

/// Install a new process-wide assertion handler, returning the previous one.
pub fn set_assert_handler(handler: AssertHandler) -> AssertHandler {
    let mut h = ASSERT_HANDLER.write().unwrap();
    std::mem::replace(&mut *h, handler)
}

fn default_assert_handler(kind: ErrorKind, fatal: bool, file: &'static str, line: u32) {
    let class = if kind.is_internal() { "internal" } else { "user" };
    log::error!("assertion: {kind} ({class}, fatal={fatal}) at {file}:{line}");
    eprintln!("libitc assertion: {kind:?} ({kind}) at {file}:{line}");
}

/// Report a recoverable (user) error. The caller returns empty/false after.
#[track_caller]
pub(crate) fn report(kind: ErrorKind) {
    let loc = Location::caller();
    let handler = *ASSERT_HANDLER.read().unwrap();
    handler(kind, false, loc.file(), loc.line());
}

/// Report an internal invariant violation and terminate. Diverges even if a
/// user-installed handler returns.
#[track_caller]
pub(crate) fn die(kind: ErrorKind) -> ! {
    let loc = Location::caller();
    let handler = *ASSERT_HANDLER.read().unwrap();
    handler(kind, true, loc.file(), loc.line());
    process::abort();
}
