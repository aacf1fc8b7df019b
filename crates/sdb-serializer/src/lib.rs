#![forbid(unsafe_code)]
//! Block-addressed asynchronous storage backend.
//!
//! The cache sees storage through the [`Serializer`] trait: fixed-size
//! blocks addressed by dense [`BlockId`]s, with reads and batched writes
//! completing through continuations delivered on a later turn of the
//! slice's event loop. Two implementations are provided:
//!
//! - [`MemSerializer`]: an in-memory image with fault injection and
//!   operation counters, used by the test suites;
//! - [`FileSerializer`]: a file-backed image with a small header
//!   carrying the block size and the allocation watermark.

use sdb_error::{CacheError, Result};
use sdb_runloop::LoopHandle;
use sdb_types::{BlockId, BlockSize, ByteOffset};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Every page payload starts on a boundary of this many bytes, which
/// keeps the buffers friendly to direct-I/O device backends.
pub const PAGE_ALIGNMENT: usize = 4096;

// ── Buffer types ────────────────────────────────────────────────────────────

/// Backing allocation for one page payload, aligned without `unsafe`:
/// the vector carries one page of slack and the exposed window starts
/// at the first page boundary inside it. Allocation failure surfaces
/// as [`CacheError::ResourceExhausted`] instead of aborting.
#[derive(Debug)]
struct PageStorage {
    raw: Vec<u8>,
    window: usize,
    len: usize,
}

impl PageStorage {
    /// Slack that guarantees a page boundary inside the allocation.
    const SLACK: usize = PAGE_ALIGNMENT - 1;

    fn try_zeroed(len: usize) -> Result<Self> {
        let padded = len.saturating_add(Self::SLACK);
        let mut raw = Vec::new();
        raw.try_reserve_exact(padded)
            .map_err(|_| CacheError::ResourceExhausted { bytes: padded })?;
        raw.resize(padded, 0_u8);
        trace!(event = "page_alloc", bytes = len);
        Ok(Self::around(raw, len))
    }

    /// Infallible variant used when diverging a shared page; the
    /// out-of-memory reporting already happened when the original
    /// page was allocated.
    fn zeroed(len: usize) -> Self {
        Self::around(vec![0_u8; len.saturating_add(Self::SLACK)], len)
    }

    fn around(raw: Vec<u8>, len: usize) -> Self {
        let base = raw.as_ptr() as usize;
        let window = base.next_multiple_of(PAGE_ALIGNMENT) - base;
        debug_assert!(window + len <= raw.len());
        Self { raw, window, len }
    }

    fn as_slice(&self) -> &[u8] {
        &self.raw[self.window..self.window + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.window..self.window + self.len]
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Clone for PageStorage {
    // A cloned vector lands at a different address, so the aligned
    // window is recomputed rather than copied over.
    fn clone(&self) -> Self {
        let mut copy = Self::zeroed(self.len);
        copy.as_mut_slice().copy_from_slice(self.as_slice());
        copy
    }
}

impl PartialEq for PageStorage {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for PageStorage {}

/// Cheaply clonable page payload with copy-on-write mutation.
///
/// Clones share the backing allocation (`clone_ref`); [`PageBuf::make_mut`]
/// diverges a shared payload before mutating, so a writeback snapshot
/// holding a reference keeps seeing the pre-write image while the cache's
/// copy moves on. `Rc`-based because a page never leaves its slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBuf {
    data: Rc<PageStorage>,
}

impl PageBuf {
    /// Allocate a zeroed, page-aligned payload of `len` bytes.
    pub fn try_zeroed(len: usize) -> Result<Self> {
        Ok(Self {
            data: Rc::new(PageStorage::try_zeroed(len)?),
        })
    }

    /// Build a page from raw bytes (test and loader convenience).
    pub fn from_vec(bytes: Vec<u8>) -> Result<Self> {
        let mut page = Self::try_zeroed(bytes.len())?;
        page.make_mut().copy_from_slice(&bytes);
        Ok(page)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Mutable view of the payload, diverging from shared clones first.
    pub fn make_mut(&mut self) -> &mut [u8] {
        Rc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Cheap reference-counted clone sharing the backing allocation.
    #[must_use]
    pub fn clone_ref(&self) -> Self {
        Self {
            data: Rc::clone(&self.data),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when at least one other clone shares the backing allocation.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        Rc::strong_count(&self.data) > 1
    }
}

// ── Serializer contract ─────────────────────────────────────────────────────

/// Continuation for a completed block read, carrying the filled page.
pub type ReadCompletion = Box<dyn FnOnce(Result<PageBuf>)>;
/// Continuation for a completed write batch.
pub type WriteCompletion = Box<dyn FnOnce(Result<()>)>;

/// Asynchronous block-addressed storage.
///
/// Completions are delivered through the slice's event loop on a later
/// turn, never re-entrantly from inside `read`/`write_many`. The caller
/// keeps at most one operation in flight per block id; implementations
/// may rely on that.
pub trait Serializer {
    /// Fixed block size of the backing image.
    fn block_size(&self) -> BlockSize;

    /// Assign a fresh block id. Ids are dense and monotonically
    /// increasing; an allocated block reads as zeroes until written.
    fn allocate(&mut self) -> BlockId;

    /// Fill `page` with the contents of `id` and hand it back through
    /// `done`. The caller supplies the (unshared) page so an allocation
    /// failure is its error to report, not the serializer's.
    fn read(&mut self, id: BlockId, page: PageBuf, done: ReadCompletion);

    /// Durably persist every `(id, payload)` pair, then call `done`.
    /// The batch is a single durability unit: either all writes are
    /// reported durable or the whole batch fails.
    fn write_many(&mut self, batch: Vec<(BlockId, PageBuf)>, done: WriteCompletion);
}

// ── In-memory serializer ────────────────────────────────────────────────────

/// Backing image of a [`MemSerializer`], shareable across reopens so
/// tests can simulate a restart on the same storage.
#[derive(Debug)]
pub struct MemImage {
    block_size: BlockSize,
    blocks: HashMap<BlockId, Vec<u8>>,
    next_id: u64,
    reads_issued: u64,
    write_batches: u64,
    blocks_written: Vec<BlockId>,
    fail_reads: u32,
    fail_write_batches: u32,
}

impl MemImage {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            block_size,
            blocks: HashMap::new(),
            next_id: 0,
            reads_issued: 0,
            write_batches: 0,
            blocks_written: Vec::new(),
            fail_reads: 0,
            fail_write_batches: 0,
        }
    }

    /// Pre-populate a block, moving the allocation watermark past it.
    pub fn seed(&mut self, id: BlockId, bytes: &[u8]) {
        assert_eq!(bytes.len(), self.block_size.as_usize());
        self.blocks.insert(id, bytes.to_vec());
        self.next_id = self.next_id.max(id.0 + 1);
    }

    /// Raw contents of a block, if it was ever written.
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&[u8]> {
        self.blocks.get(&id).map(Vec::as_slice)
    }

    /// Fail the next `n` reads with an injected I/O error.
    pub fn inject_read_failures(&mut self, n: u32) {
        self.fail_reads = n;
    }

    /// Fail the next `n` write batches with an injected I/O error.
    pub fn inject_write_failures(&mut self, n: u32) {
        self.fail_write_batches = n;
    }

    #[must_use]
    pub fn reads_issued(&self) -> u64 {
        self.reads_issued
    }

    #[must_use]
    pub fn write_batches(&self) -> u64 {
        self.write_batches
    }

    /// Every block id written, in write order (duplicates preserved).
    #[must_use]
    pub fn blocks_written(&self) -> &[BlockId] {
        &self.blocks_written
    }
}

/// In-memory [`Serializer`] with deferred completions.
pub struct MemSerializer {
    handle: LoopHandle,
    image: Rc<RefCell<MemImage>>,
}

impl MemSerializer {
    #[must_use]
    pub fn new(handle: LoopHandle, block_size: BlockSize) -> Self {
        Self {
            handle,
            image: Rc::new(RefCell::new(MemImage::new(block_size))),
        }
    }

    /// Reopen an existing image, as a restart would.
    #[must_use]
    pub fn with_image(handle: LoopHandle, image: Rc<RefCell<MemImage>>) -> Self {
        Self { handle, image }
    }

    #[must_use]
    pub fn image(&self) -> Rc<RefCell<MemImage>> {
        Rc::clone(&self.image)
    }
}

impl Serializer for MemSerializer {
    fn block_size(&self) -> BlockSize {
        self.image.borrow().block_size
    }

    fn allocate(&mut self) -> BlockId {
        let mut image = self.image.borrow_mut();
        let id = BlockId(image.next_id);
        image.next_id += 1;
        trace!(event = "serializer_allocate", block = id.0);
        id
    }

    fn read(&mut self, id: BlockId, mut page: PageBuf, done: ReadCompletion) {
        let outcome = {
            let mut image = self.image.borrow_mut();
            image.reads_issued += 1;
            if image.fail_reads > 0 {
                image.fail_reads -= 1;
                warn!(event = "serializer_read_fault", block = id.0);
                Err(CacheError::io_detail("injected read failure"))
            } else {
                match image.blocks.get(&id) {
                    Some(bytes) => page.make_mut().copy_from_slice(bytes),
                    None => page.make_mut().fill(0),
                }
                trace!(event = "serializer_read", block = id.0);
                Ok(page)
            }
        };
        self.handle.post(move || done(outcome));
    }

    fn write_many(&mut self, batch: Vec<(BlockId, PageBuf)>, done: WriteCompletion) {
        let outcome = {
            let mut image = self.image.borrow_mut();
            if image.fail_write_batches > 0 {
                image.fail_write_batches -= 1;
                warn!(event = "serializer_write_fault", blocks = batch.len());
                Err(CacheError::io_detail("injected write failure"))
            } else {
                let expected = image.block_size.as_usize();
                for (id, page) in &batch {
                    debug_assert_eq!(page.len(), expected);
                    image.blocks.insert(*id, page.as_slice().to_vec());
                    image.blocks_written.push(*id);
                    image.next_id = image.next_id.max(id.0 + 1);
                }
                image.write_batches += 1;
                debug!(event = "serializer_write_batch", blocks = batch.len());
                Ok(())
            }
        };
        self.handle.post(move || done(outcome));
    }
}

// ── File-backed serializer ──────────────────────────────────────────────────

const FILE_MAGIC: u64 = 0x534C_4342_4C4B_0001; // "SLCBLK" + version
const HEADER_LEN: u64 = 4096;

/// File-backed [`Serializer`].
///
/// Layout: a [`HEADER_LEN`]-byte header (magic, block size, allocation
/// watermark) followed by the block array at `HEADER_LEN + id *
/// block_size`. Reads past the end of the file observe zeroes, which is
/// exactly what a freshly allocated block must read as. Writes are
/// durable (`sync_data`) before the batch completion fires.
pub struct FileSerializer {
    handle: LoopHandle,
    file: File,
    block_size: BlockSize,
    next_id: u64,
}

impl std::fmt::Debug for FileSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSerializer")
            .field("block_size", &self.block_size)
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl FileSerializer {
    /// Create a fresh image at `path`, truncating any existing file.
    pub fn create(handle: LoopHandle, path: impl AsRef<Path>, block_size: BlockSize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let ser = Self {
            handle,
            file,
            block_size,
            next_id: 0,
        };
        ser.write_header()?;
        debug!(
            event = "image_created",
            block_size = block_size.get(),
            path = %path.as_ref().display()
        );
        Ok(ser)
    }

    /// Open an existing image, validating its header.
    pub fn open(handle: LoopHandle, path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let mut header = [0_u8; 24];
        file.read_exact_at(&mut header, 0)?;

        let magic = u64::from_le_bytes(header[0..8].try_into().expect("8-byte slice"));
        if magic != FILE_MAGIC {
            return Err(CacheError::Config(format!(
                "bad image magic: {magic:#x}"
            )));
        }
        let raw_block_size = u32::from_le_bytes(header[8..12].try_into().expect("4-byte slice"));
        let block_size = BlockSize::new(raw_block_size)
            .map_err(|err| CacheError::Config(err.to_string()))?;
        let next_id = u64::from_le_bytes(header[16..24].try_into().expect("8-byte slice"));

        debug!(
            event = "image_opened",
            block_size = raw_block_size,
            next_id,
            path = %path.as_ref().display()
        );
        Ok(Self {
            handle,
            file,
            block_size,
            next_id,
        })
    }

    fn write_header(&self) -> Result<()> {
        let mut header = [0_u8; 24];
        header[0..8].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        header[8..12].copy_from_slice(&self.block_size.get().to_le_bytes());
        header[16..24].copy_from_slice(&self.next_id.to_le_bytes());
        self.file.write_all_at(&header, 0)?;
        Ok(())
    }

    fn offset_of(&self, id: BlockId) -> Result<ByteOffset> {
        let data = id
            .to_byte_offset(self.block_size)
            .and_then(|off| off.checked_add(HEADER_LEN));
        data.ok_or_else(|| CacheError::Config(format!("block {id} offset overflow")))
    }

    fn read_block_at(&self, id: BlockId, page: &mut PageBuf) -> Result<()> {
        let offset = self.offset_of(id)?;
        let file_len = self.file.metadata()?.len();
        let slice = page.make_mut();
        let available = file_len.saturating_sub(offset.0);
        let readable = usize::try_from(available.min(slice.len() as u64)).unwrap_or(0);
        if readable > 0 {
            self.file.read_exact_at(&mut slice[..readable], offset.0)?;
        }
        slice[readable..].fill(0);
        Ok(())
    }

    fn write_batch(&mut self, batch: &[(BlockId, PageBuf)]) -> Result<()> {
        for (id, page) in batch {
            let offset = self.offset_of(*id)?;
            self.file.write_all_at(page.as_slice(), offset.0)?;
            self.next_id = self.next_id.max(id.0 + 1);
        }
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Serializer for FileSerializer {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn allocate(&mut self) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        trace!(event = "serializer_allocate", block = id.0);
        id
    }

    fn read(&mut self, id: BlockId, mut page: PageBuf, done: ReadCompletion) {
        let outcome = self.read_block_at(id, &mut page).map(|()| page);
        if outcome.is_ok() {
            trace!(event = "serializer_read", block = id.0);
        } else {
            warn!(event = "serializer_read_failed", block = id.0);
        }
        self.handle.post(move || done(outcome));
    }

    fn write_many(&mut self, batch: Vec<(BlockId, PageBuf)>, done: WriteCompletion) {
        let outcome = self.write_batch(&batch);
        match &outcome {
            Ok(()) => debug!(event = "serializer_write_batch", blocks = batch.len()),
            Err(err) => warn!(event = "serializer_write_failed", blocks = batch.len(), error = %err),
        }
        self.handle.post(move || done(outcome));
    }
}
