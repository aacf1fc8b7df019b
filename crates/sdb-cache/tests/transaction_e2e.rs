#![forbid(unsafe_code)]
//! Transaction-level end-to-end scenarios: shared loads, lock
//! hand-off, FIFO fairness, and read-your-committed-writes.

use sdb_cache::{BufRef, Cache, CacheConfig, Transaction};
use sdb_runloop::EventLoop;
use sdb_serializer::MemSerializer;
use sdb_types::{Access, BlockId, BlockSize};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

const BLOCK_SIZE: u32 = 1024;

fn block_size() -> BlockSize {
    BlockSize::new(BLOCK_SIZE).expect("valid block size")
}

fn config(max_blocks: u64) -> CacheConfig {
    CacheConfig {
        block_size: block_size(),
        max_size_bytes: max_blocks * u64::from(BLOCK_SIZE),
        wait_for_flush: true,
        flush_timer: Duration::from_millis(100),
        flush_threshold_percent: 50,
    }
}

fn payload(salt: u8) -> Vec<u8> {
    vec![salt; BLOCK_SIZE as usize]
}

type TestCache = Rc<Cache<MemSerializer>>;
type HandleSlot = Rc<RefCell<Option<BufRef<MemSerializer>>>>;

fn build_cache(el: &EventLoop, max_blocks: u64) -> TestCache {
    let ser = MemSerializer::new(el.handle(), block_size());
    let cache = Cache::new(el.handle(), ser, config(max_blocks)).expect("cache");
    cache.start();
    cache
}

fn begin(el: &EventLoop, cache: &TestCache, access: Access) -> Transaction<MemSerializer> {
    let txn = cache.begin_transaction(access, |_| {}).expect("begin");
    el.run_until_idle();
    txn
}

fn commit_ok(el: &EventLoop, txn: &Transaction<MemSerializer>) {
    if !txn.commit(|result| result.expect("commit")) {
        el.run_until_idle();
    }
}

fn shutdown(el: &EventLoop, cache: &TestCache) {
    let done = Rc::new(std::cell::Cell::new(false));
    let flag = Rc::clone(&done);
    cache.shutdown(move || flag.set(true));
    el.run_until_idle();
    assert!(done.get(), "shutdown callback must fire");
    assert_eq!(cache.metrics().resident, 0, "page map must drain");
}

#[test]
fn scenario_miss_load_shares_one_read() {
    let el = EventLoop::new();
    let cache = build_cache(&el, 8);
    image(&cache).borrow_mut().seed(BlockId(7), &payload(0xA5));

    let t1 = begin(&el, &cache, Access::Read);
    let t2 = begin(&el, &cache, Access::Read);

    let slot1: HandleSlot = Rc::new(RefCell::new(None));
    let slot2: HandleSlot = Rc::new(RefCell::new(None));

    let sink = Rc::clone(&slot1);
    let first = t1
        .acquire(BlockId(7), Access::Read, move |result| {
            *sink.borrow_mut() = Some(result.expect("load"));
        })
        .expect("acquire");
    assert!(first.is_none(), "miss defers the first reader");

    let sink = Rc::clone(&slot2);
    let second = t2
        .acquire(BlockId(7), Access::Read, move |result| {
            *sink.borrow_mut() = Some(result.expect("load"));
        })
        .expect("acquire");
    assert!(second.is_none(), "joining reader shares the in-flight load");

    assert_eq!(
        image(&cache).borrow().reads_issued(),
        1,
        "one serializer read for both acquirers"
    );

    el.run_until_idle();
    let h1 = slot1.borrow_mut().take().expect("first reader notified");
    let h2 = slot2.borrow_mut().take().expect("second reader notified");

    // Both hold the lock simultaneously, over the same loaded data.
    assert_eq!(&*h1.data(), payload(0xA5).as_slice());
    assert_eq!(&*h2.data(), payload(0xA5).as_slice());
    assert_eq!(cache.metrics().resident, 1);

    h1.release();
    h2.release();
    commit_ok(&el, &t1);
    commit_ok(&el, &t2);
    shutdown(&el, &cache);
}

#[test]
fn scenario_writer_blocks_reader_until_release() {
    let el = EventLoop::new();
    let cache = build_cache(&el, 8);
    image(&cache).borrow_mut().seed(BlockId(3), &payload(0x00));

    let writer = begin(&el, &cache, Access::Write);
    let slot: HandleSlot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    assert!(
        writer
            .acquire(BlockId(3), Access::Write, move |result| {
                *sink.borrow_mut() = Some(result.expect("load"));
            })
            .expect("acquire")
            .is_none()
    );
    el.run_until_idle();
    let held = slot.borrow_mut().take().expect("writer holds the block");
    held.fill(&payload(0xBB));
    held.set_dirty();

    let reader = begin(&el, &cache, Access::Read);
    let read_slot: HandleSlot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&read_slot);
    assert!(
        reader
            .acquire(BlockId(3), Access::Read, move |result| {
                *sink.borrow_mut() = Some(result.expect("grant"));
            })
            .expect("acquire")
            .is_none(),
        "write-held block defers the reader"
    );

    el.run_until_idle();
    assert!(
        read_slot.borrow().is_none(),
        "reader must not be notified before the writer releases"
    );

    held.release();
    el.run_until_idle();
    let read_handle = read_slot.borrow_mut().take().expect("reader notified");
    assert_eq!(
        &*read_handle.data(),
        payload(0xBB).as_slice(),
        "reader observes the writer's value"
    );
    read_handle.release();

    commit_ok(&el, &reader);
    commit_ok(&el, &writer);
    shutdown(&el, &cache);
}

#[test]
fn scenario_allocate_is_synchronous() {
    let el = EventLoop::new();
    let cache = build_cache(&el, 8);
    let txn = begin(&el, &cache, Access::Write);

    // Same turn of the event loop: no callback, write lock held,
    // fresh id, zero contents.
    let buf = txn.allocate().expect("allocate");
    assert_eq!(buf.block_id(), BlockId(0));
    assert_eq!(buf.access(), Access::Write);
    assert!(buf.data().iter().all(|b| *b == 0));
    assert_eq!(cache.metrics().resident, 1);

    buf.release();
    commit_ok(&el, &txn);
    shutdown(&el, &cache);
}

#[test]
fn committed_writes_are_read_back() {
    let el = EventLoop::new();
    let cache = build_cache(&el, 8);

    let writer = begin(&el, &cache, Access::Write);
    let buf = writer.allocate().expect("allocate");
    let block = buf.block_id();
    buf.fill(&payload(0x5C));
    buf.set_dirty();
    buf.release();
    commit_ok(&el, &writer);

    let reader = begin(&el, &cache, Access::Read);
    let hit = reader
        .acquire(block, Access::Read, |_| panic!("resident acquire is synchronous"))
        .expect("acquire")
        .expect("resident block");
    assert_eq!(&*hit.data(), payload(0x5C).as_slice());
    hit.release();
    commit_ok(&el, &reader);
    shutdown(&el, &cache);
}

#[test]
fn queued_reader_does_not_jump_queued_writer() {
    let el = EventLoop::new();
    let cache = build_cache(&el, 8);
    image(&cache).borrow_mut().seed(BlockId(1), &payload(0x01));

    let holder = begin(&el, &cache, Access::Read);
    let slot: HandleSlot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    assert!(
        holder
            .acquire(BlockId(1), Access::Read, move |result| {
                *sink.borrow_mut() = Some(result.expect("load"));
            })
            .expect("acquire")
            .is_none()
    );
    el.run_until_idle();
    let held = slot.borrow_mut().take().expect("holder");

    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let writer = begin(&el, &cache, Access::Write);
    let writer_slot: HandleSlot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&writer_slot);
    let events = Rc::clone(&log);
    assert!(
        writer
            .acquire(BlockId(1), Access::Write, move |result| {
                events.borrow_mut().push("writer");
                *sink.borrow_mut() = Some(result.expect("grant"));
            })
            .expect("acquire")
            .is_none()
    );

    let reader = begin(&el, &cache, Access::Read);
    let reader_slot: HandleSlot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&reader_slot);
    let events = Rc::clone(&log);
    assert!(
        reader
            .acquire(BlockId(1), Access::Read, move |result| {
                events.borrow_mut().push("reader");
                *sink.borrow_mut() = Some(result.expect("grant"));
            })
            .expect("acquire")
            .is_none(),
        "a read compatible with the holder still queues behind the writer"
    );

    held.release();
    el.run_until_idle();
    assert_eq!(
        *log.borrow(),
        vec!["writer"],
        "the queued writer is granted first; the reader must not barge"
    );

    writer_slot
        .borrow_mut()
        .take()
        .expect("writer handle")
        .release();
    el.run_until_idle();
    assert_eq!(*log.borrow(), vec!["writer", "reader"]);

    reader_slot
        .borrow_mut()
        .take()
        .expect("reader handle")
        .release();
    commit_ok(&el, &reader);
    commit_ok(&el, &writer);
    commit_ok(&el, &holder);
    shutdown(&el, &cache);
}

#[test]
fn intent_write_upgrade_waits_for_reader_drain() {
    let el = EventLoop::new();
    let cache = build_cache(&el, 8);

    // Seed via an allocating transaction so the block is resident.
    let setup = begin(&el, &cache, Access::Write);
    let buf = setup.allocate().expect("allocate");
    let block = buf.block_id();
    buf.release();
    commit_ok(&el, &setup);

    let reader = begin(&el, &cache, Access::Read);
    let read_handle = reader
        .acquire(block, Access::Read, |_| panic!("resident acquire"))
        .expect("acquire")
        .expect("read grant");

    let upgrader = begin(&el, &cache, Access::Write);
    let intent = upgrader
        .acquire(block, Access::IntentWrite, |_| panic!("intent coexists with reader"))
        .expect("acquire")
        .expect("intent grant");

    let upgraded = Rc::new(std::cell::Cell::new(false));
    let flag = Rc::clone(&upgraded);
    assert!(
        !intent.upgrade(move || flag.set(true)),
        "upgrade must wait for the reader"
    );
    el.run_until_idle();
    assert!(!upgraded.get());
    assert_eq!(intent.access(), Access::IntentWrite);

    read_handle.release();
    el.run_until_idle();
    assert!(upgraded.get(), "upgrade completes once readers drain");
    assert_eq!(intent.access(), Access::Write);

    intent.fill(&payload(0x77));
    intent.set_dirty();
    intent.release();
    commit_ok(&el, &reader);
    commit_ok(&el, &upgrader);
    shutdown(&el, &cache);
}

fn image(cache: &TestCache) -> Rc<RefCell<sdb_serializer::MemImage>> {
    cache.with_serializer(MemSerializer::image)
}
