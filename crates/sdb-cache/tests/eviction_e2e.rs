#![forbid(unsafe_code)]
//! Page replacement scenarios and restart round-trips: pins and dirty
//! bits veto eviction, the capacity boundary is exact, and a shutdown
//! image reopens bit-identical on both serializers.

use sdb_cache::{BufRef, Cache, CacheConfig, Transaction};
use sdb_runloop::EventLoop;
use sdb_serializer::{FileSerializer, MemSerializer, Serializer};
use sdb_types::{Access, BlockId, BlockSize};
use std::cell::{Cell, RefCell};
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
        flush_threshold_percent: 100,
    }
}

fn payload(salt: u8) -> Vec<u8> {
    vec![salt; BLOCK_SIZE as usize]
}

fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn begin<S: Serializer + 'static>(
    el: &EventLoop,
    cache: &Rc<Cache<S>>,
    access: Access,
) -> Transaction<S> {
    let txn = cache.begin_transaction(access, |_| {}).expect("begin");
    el.run_until_idle();
    txn
}

fn commit_ok<S: Serializer + 'static>(el: &EventLoop, txn: &Transaction<S>) {
    if !txn.commit(|result| result.expect("commit")) {
        el.run_until_idle();
    }
}

fn shutdown<S: Serializer + 'static>(el: &EventLoop, cache: &Rc<Cache<S>>) {
    let done = Rc::new(Cell::new(false));
    let flag = Rc::clone(&done);
    cache.shutdown(move || flag.set(true));
    el.run_until_idle();
    assert!(done.get(), "shutdown callback must fire");
}

/// Acquire a non-resident block and wait out the load.
fn acquire_wait<S: Serializer + 'static>(
    el: &EventLoop,
    txn: &Transaction<S>,
    block: BlockId,
    mode: Access,
) -> BufRef<S> {
    let slot: Rc<RefCell<Option<BufRef<S>>>> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    let immediate = txn
        .acquire(block, mode, move |result| {
            *sink.borrow_mut() = Some(result.expect("load"));
        })
        .expect("acquire");
    if let Some(handle) = immediate {
        return handle;
    }
    el.run_until_idle();
    let handle = slot.borrow_mut().take().expect("load completed");
    handle
}

#[test]
fn scenario_eviction_respects_pins_and_recency() {
    let el = EventLoop::new();
    let ser = MemSerializer::new(el.handle(), block_size());
    let cache = Cache::new(el.handle(), ser, config(4)).expect("cache");
    cache.start();

    let txn = begin(&el, &cache, Access::Write);

    // Blocks 1..4 in acquisition order; block 1 stays locked.
    let pinned = txn.allocate().expect("allocate");
    let b2 = txn.allocate().expect("allocate");
    let second = b2.block_id();
    b2.release();
    let b3 = txn.allocate().expect("allocate");
    let third = b3.block_id();
    b3.release();
    let b4 = txn.allocate().expect("allocate");
    let fourth = b4.block_id();
    b4.release();
    assert_eq!(cache.metrics().resident, 4);
    assert_eq!(cache.metrics().evictions, 0, "at capacity nothing is evicted");

    // The fifth acquisition overflows: the victim must be the coldest
    // unpinned block (block 2), never the pinned block 1 nor the
    // just-used 4 and 5.
    let b5 = txn.allocate().expect("allocate");
    let metrics = cache.metrics();
    assert_eq!(metrics.resident, 4, "resident count returns to capacity");
    assert_eq!(metrics.evictions, 1);

    b5.release();
    pinned.release();

    // Block 2 really left: reacquiring it is a miss against the
    // serializer. Blocks 3 and 4 are still resident hits.
    let before = cache.with_serializer(MemSerializer::image).borrow().reads_issued();
    let again = acquire_wait(&el, &txn, second, Access::Read);
    again.release();
    let after = cache.with_serializer(MemSerializer::image).borrow().reads_issued();
    assert_eq!(after, before + 1, "evicted block reloads from the serializer");

    for block in [third, fourth] {
        let hit = txn
            .acquire(block, Access::Read, |_| panic!("resident acquire"))
            .expect("acquire")
            .expect("still resident");
        hit.release();
    }

    commit_ok(&el, &txn);
    shutdown(&el, &cache);
}

#[test]
fn capacity_boundary_is_exact() {
    let el = EventLoop::new();
    let ser = MemSerializer::new(el.handle(), block_size());
    let cache = Cache::new(el.handle(), ser, config(4)).expect("cache");
    cache.start();

    let txn = begin(&el, &cache, Access::Write);
    for _ in 0..3 {
        txn.allocate().expect("allocate").release();
    }
    assert_eq!(cache.metrics().evictions, 0, "max_blocks - 1 does not evict");

    txn.allocate().expect("allocate").release();
    assert_eq!(cache.metrics().evictions, 0, "exactly max_blocks does not evict");

    txn.allocate().expect("allocate").release();
    let metrics = cache.metrics();
    assert_eq!(metrics.evictions, 1, "one past max_blocks evicts one victim");
    assert_eq!(metrics.resident, 4);

    commit_ok(&el, &txn);
    shutdown(&el, &cache);
}

#[test]
fn dirty_blocks_survive_eviction_pressure() {
    let el = EventLoop::new();
    let ser = MemSerializer::new(el.handle(), block_size());
    let cache = Cache::new(el.handle(), ser, config(2)).expect("cache");
    cache.start();

    let txn = begin(&el, &cache, Access::Write);
    let mut blocks = Vec::new();
    for salt in 0..4_u8 {
        let buf = txn.allocate().expect("allocate");
        blocks.push(buf.block_id());
        buf.fill(&payload(salt));
        buf.set_dirty();
        buf.release();
    }

    // Every block is dirty: page replacement has no victim and the
    // cache runs over capacity rather than dropping writes.
    assert_eq!(cache.metrics().resident, 4);
    assert_eq!(cache.metrics().evictions, 0);

    commit_ok(&el, &txn);
    // After the commit flush everything is clean and the next acquire
    // shrinks the cache back to capacity.
    let reader = begin(&el, &cache, Access::Read);
    let handle = acquire_wait(&el, &reader, blocks[0], Access::Read);
    assert_eq!(&*handle.data(), payload(0).as_slice());
    handle.release();
    assert!(cache.metrics().resident <= 2 + 1);

    commit_ok(&el, &reader);
    shutdown(&el, &cache);
}

#[test]
fn restart_round_trip_on_mem_serializer() {
    let el = EventLoop::new();
    let ser = MemSerializer::new(el.handle(), block_size());
    let image = ser.image();
    let cache = Cache::new(el.handle(), ser, config(8)).expect("cache");
    cache.start();

    let txn = begin(&el, &cache, Access::Write);
    let mut checksums = Vec::new();
    for salt in [0x11_u8, 0x22, 0x33] {
        let buf = txn.allocate().expect("allocate");
        let bytes = payload(salt);
        checksums.push((buf.block_id(), blake3_hex(&bytes)));
        buf.fill(&bytes);
        buf.set_dirty();
        buf.release();
    }
    commit_ok(&el, &txn);
    shutdown(&el, &cache);
    drop(cache);

    // Restart atop the same image.
    let reopened = MemSerializer::with_image(el.handle(), image);
    let cache = Cache::new(el.handle(), reopened, config(8)).expect("cache");
    cache.start();

    let reader = begin(&el, &cache, Access::Read);
    for (block, checksum) in &checksums {
        let handle = acquire_wait(&el, &reader, *block, Access::Read);
        assert_eq!(&blake3_hex(&handle.data()), checksum);
        handle.release();
    }
    commit_ok(&el, &reader);
    shutdown(&el, &cache);
}

#[test]
fn restart_round_trip_on_file_serializer() {
    let el = EventLoop::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("slice.img");

    let mut checksums = Vec::new();
    {
        let ser = FileSerializer::create(el.handle(), &path, block_size()).expect("create");
        let cache = Cache::new(el.handle(), ser, config(8)).expect("cache");
        cache.start();

        let txn = begin(&el, &cache, Access::Write);
        for salt in [0xA1_u8, 0xB2, 0xC3, 0xD4] {
            let buf = txn.allocate().expect("allocate");
            let bytes = payload(salt);
            checksums.push((buf.block_id(), blake3_hex(&bytes)));
            buf.fill(&bytes);
            buf.set_dirty();
            buf.release();
        }
        commit_ok(&el, &txn);
        shutdown(&el, &cache);
    }

    let ser = FileSerializer::open(el.handle(), &path).expect("open");
    let cache = Cache::new(el.handle(), ser, config(8)).expect("cache");
    cache.start();

    let reader = begin(&el, &cache, Access::Read);
    for (block, checksum) in &checksums {
        let handle = acquire_wait(&el, &reader, *block, Access::Read);
        assert_eq!(&blake3_hex(&handle.data()), checksum);
        handle.release();
    }
    commit_ok(&el, &reader);

    // A fresh allocation continues past the persisted watermark.
    let writer = begin(&el, &cache, Access::Write);
    let buf = writer.allocate().expect("allocate");
    assert_eq!(buf.block_id(), BlockId(4));
    buf.release();
    commit_ok(&el, &writer);

    shutdown(&el, &cache);
}
