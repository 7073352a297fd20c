// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libitc contributors
//
// Handle refcount lifecycle, polymorphic narrowing, and give/take.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libitc::{BaseRef, ClockId, Member, MsgPool, MsgQueue, MsgRef, Wait};

struct Counted {
    tag: u32,
    drops: Arc<AtomicUsize>,
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

struct Base {
    kind: u8,
}

struct Derived1 {
    kind: u8,
    extra: u32,
}

struct Derived2 {
    kind: u8,
    words: [u64; 4],
}

impl Member<Base> for Derived1 {}
impl Member<Base> for Derived2 {}

// Test: the refcount follows copy / enqueue / dequeue / drop, the
// destructor runs exactly once, and the slot comes home
#[test]
fn refcount_lifecycle_through_queue() {
    let drops = Arc::new(AtomicUsize::new(0));
    let pool = MsgPool::<Counted>::new(2, 1, ClockId::Monotonic).expect("pool");
    let q = MsgQueue::<Counted>::new(ClockId::Monotonic).expect("queue");

    let h1 = pool
        .alloc(Wait::NoWait, || Counted { tag: 9, drops: Arc::clone(&drops) })
        .expect("alloc");
    assert_eq!(h1.use_count(), 1);
    assert!(h1.is_unique());

    let h2 = h1.clone();
    assert_eq!(h1.use_count(), 2);

    // enqueue consumes h2's unit; the queue now holds one count
    assert!(q.enqueue(h2));
    assert_eq!(h1.use_count(), 2);

    drop(h1);

    let h3 = q.dequeue(Wait::NoWait).expect("msg");
    assert_eq!(h3.use_count(), 1);
    assert!(h3.is_unique());
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    drop(h3);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().in_use, 0);

    // the slot is back on the free list
    let again = pool
        .alloc(Wait::NoWait, || Counted { tag: 1, drops: Arc::clone(&drops) })
        .expect("realloc");
    assert_eq!(again.tag, 1);
}

// Test: a base-typed queue carries derived types; narrowing succeeds only
// on the matching concrete type and no refcount is lost
#[test]
fn narrowing_selects_concrete_type() {
    let pool =
        MsgPool::<Base>::sized_for::<(Base, Derived1, Derived2)>(4, 1, ClockId::Monotonic)
            .expect("pool");
    let q = MsgQueue::<Base>::new(ClockId::Monotonic).expect("queue");

    let d1 = pool
        .alloc(Wait::NoWait, || Derived1 { kind: 1, extra: 77 })
        .expect("d1");
    assert!(q.enqueue(d1));
    let d2 = pool
        .alloc(Wait::NoWait, || Derived2 { kind: 2, words: [5; 4] })
        .expect("d2");
    assert!(q.enqueue(d2));

    let first = q.dequeue(Wait::NoWait).expect("first");
    assert!(first.is::<Derived1>());
    assert!(first.narrow::<Derived2>().is_none());
    assert!(first.narrow::<Base>().is_none());
    let n1 = first.narrow::<Derived1>().expect("narrow d1");
    assert_eq!(n1.extra, 77);
    assert_eq!(first.use_count(), 2);
    drop(first);
    assert!(n1.is_unique());

    let second = q.dequeue(Wait::NoWait).expect("second");
    let n2 = second.narrow::<Derived2>().expect("narrow d2");
    assert_eq!(n2.words[3], 5);

    drop((n1, second, n2));
    assert_eq!(pool.stats().in_use, 0);
}

// Test: take then give is the identity; the destructor still runs once
#[test]
fn give_take_roundtrip() {
    let drops = Arc::new(AtomicUsize::new(0));
    let pool = MsgPool::<Counted>::new(1, 1, ClockId::Monotonic).expect("pool");

    let mut h = pool
        .alloc(Wait::NoWait, || Counted { tag: 3, drops: Arc::clone(&drops) })
        .expect("alloc");
    let p = h.take().expect("ptr");
    assert!(h.is_empty());
    assert_eq!(h.use_count(), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    unsafe { h.give(p) };
    assert_eq!(h.use_count(), 1);
    assert_eq!(h.tag, 3);

    drop(h);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().in_use, 0);
}

// Test: erasing to the family handle and narrowing back yields the same
// message
#[test]
fn erase_then_narrow_is_same_message() {
    let pool = MsgPool::<Base>::sized_for::<(Base, Derived1)>(2, 1, ClockId::Monotonic)
        .expect("pool");
    let m = pool
        .alloc(Wait::NoWait, || Derived1 { kind: 1, extra: 5 })
        .expect("alloc");
    let addr = m.as_ptr() as usize;

    let base: BaseRef<Base> = m.erase();
    assert_eq!(base.use_count(), 1);
    assert!(base.is::<Derived1>());

    let back = base.narrow::<Derived1>().expect("same type");
    assert_eq!(back.as_ptr() as usize, addr);
    assert_eq!(back.extra, 5);
}

// Test: exclusive access is only granted while the handle is unique
#[test]
fn get_mut_requires_uniqueness() {
    let pool = MsgPool::<Base>::new(1, 1, ClockId::Monotonic).expect("pool");
    let mut a = pool.alloc(Wait::NoWait, || Base { kind: 0 }).expect("alloc");

    assert!(a.get_mut().is_some());

    let b = a.clone();
    assert!(a.get_mut().is_none());
    drop(b);

    a.get_mut().expect("unique again").kind = 9;
    assert_eq!(a.kind, 9);
}

// Test: reset drops the reference and leaves the handle empty
#[test]
fn reset_empties_handle() {
    let drops = Arc::new(AtomicUsize::new(0));
    let pool = MsgPool::<Counted>::new(1, 1, ClockId::Monotonic).expect("pool");
    let mut h = pool
        .alloc(Wait::NoWait, || Counted { tag: 4, drops: Arc::clone(&drops) })
        .expect("alloc");

    h.reset();
    assert!(h.is_empty());
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().in_use, 0);
}

// Test: empty handles answer every query without touching a message
#[test]
fn default_handles_are_empty() {
    let h: MsgRef<Base> = MsgRef::empty();
    assert!(h.is_empty());
    assert_eq!(h.use_count(), 0);
    assert!(!h.is_unique());
    assert!(h.get().is_none());
    assert!(h.as_ptr().is_null());

    let b: BaseRef<Base> = BaseRef::default();
    assert!(b.is_empty());
    assert!(b.type_id().is_none());
    assert!(!b.is::<Base>());
    assert!(b.narrow::<Base>().is_none());
}

// Test: a message mutated by the producer arrives intact at a consumer on
// another thread
#[test]
fn message_contents_cross_threads() {
    let pool = MsgPool::<Base>::new(2, 1, ClockId::Monotonic).expect("pool");
    let q = MsgQueue::<Base>::new(ClockId::Monotonic).expect("queue");

    let mut m = pool.alloc(Wait::NoWait, || Base { kind: 0 }).expect("alloc");
    m.get_mut().expect("unique").kind = 0x5A;
    assert!(q.enqueue(m));

    let q2 = q.clone();
    let t = std::thread::spawn(move || {
        let got = q2.dequeue(Wait::Forever).expect("msg");
        got.narrow::<Base>().expect("base").kind
    });
    assert_eq!(t.join().unwrap(), 0x5A);
}
