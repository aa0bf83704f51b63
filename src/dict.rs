//! The variable engine: keys of 1 to 255 bytes, values of up to 16 MiB less
//! one byte.
//!
//! One mapped region holds a fixed header, the control block, an entry table
//! probed linearly, and a slab of 8-byte data blocks. Readers are lock-free:
//! they probe with acquire loads, re-check the entry around every record
//! access, and copy the value out. A single writer at a time mutates the slab
//! in place behind the control block's mutex, compacting probe runs
//! ("sweeping") when tombstones accumulate and relocating records toward the
//! bump cursor ("defragmenting") when the cursor's free run is too small.

use std::path::Path;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::divisor::Divisor;
use crate::error::{consistency_check, Error, Result};
use crate::hash::hash;
use crate::layout::{
    atomic_u64, prefetch_read_low, record_blocks, record_padding, Entry, Mark, BLOCK_SIZE,
    DATA_BLOCK_LIMIT, MAX_OFF,
};
use crate::lock::ControlBlock;
use crate::mmap::MemMap;
use crate::{LoadPolicy, Source};

const MAGIC: u16 = 0xE998;
const VERSION: u8 = 1;

pub(crate) const MIN_ENTRY: u64 = 256;
pub(crate) const MAX_ENTRY: u64 = 1 << 34;

/// Reborrows `source` with a lifetime tied to `x` rather than to the
/// original `&mut dyn Source`, so it can be passed to a fallible call more
/// than once.
fn reborrow_source<'a>(x: &'a mut Option<&mut dyn Source>) -> Option<&'a mut dyn Source> {
    match x {
        Some(s) => Some(&mut **s),
        None => None,
    }
}

/// One tenth of the slab stays free so defragmentation always has room.
const DATA_RESERVE_FACTOR: u64 = 10;
/// A sweep runs when fewer than one eighth of the entries are clean.
const ENTRY_RESERVE_FACTOR: u64 = 8;

/// Accepted key lengths are `1..=MAX_KEY_LEN`.
pub const MAX_KEY_LEN: u32 = u8::MAX as u32;
/// Accepted value lengths are `1..=MAX_VAL_LEN`.
pub const MAX_VAL_LEN: u32 = (1 << 24) - 1;

const HEADER_SIZE: u64 = 64;
const TABLE_OFF: u64 = HEADER_SIZE + ControlBlock::SIZE;

#[inline]
fn total_entry_for(item_limit: u64) -> u64 {
    item_limit * 3 / 2
}

#[repr(C)]
struct Header {
    magic: u16,
    version: u8,
    writing: AtomicU8,
    /// `max_key_len | max_val_len << 8`, the lens half of a record mark.
    kv_limit: u32,
    seed: u64,
    item: AtomicU64,
    total_entry: u64,
    clean_entry: AtomicU64,
    total_block: u64,
    free_block: AtomicU64,
    block_cursor: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE as usize);

/// Creation-time sizing and limits. All fields have documented ranges; see
/// [`Dict::create`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on stored items. The entry table is sized to 1.5× this,
    /// bounded to `[256, 2^34]` entries.
    pub item_limit: u64,
    /// Accepted key length bound, `1..=255`.
    pub max_key_len: u32,
    /// Accepted value length bound, `1..=2^24 - 1`.
    pub max_val_len: u32,
    /// Expected average of `key_len + val_len`, driving slab sizing. Must be
    /// at least 2 and at most `max_key_len + max_val_len`. When item sizes
    /// are badly skewed a larger value avoids a failed bulk load.
    pub avg_item_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            item_limit: 1000,
            max_key_len: 32,
            max_val_len: 1 << 20,
            avg_item_size: 2048,
        }
    }
}

enum CreateOutcome {
    Done,
    /// The source overran the planned slab; carries the observed average
    /// per-record padding for the retry estimate.
    Overflow { avg_padding: u64 },
}

/// A loaded variable-engine dictionary.
///
/// All operations take `&self`; writes serialize internally on the control
/// block's writer mutex while reads stay lock-free. `fetch` has a documented,
/// very low probability of a false miss while a sweep is rearranging the
/// entry table.
pub struct Dict {
    res: MemMap,
    header: *const Header,
    control: *const ControlBlock,
    table: *const AtomicU64,
    data: *mut u8,
    // Keeps the reinitialized control block alive for private openers.
    _heap_control: Option<Box<ControlBlock>>,
    shared: bool,
    max_key_len: u32,
    max_val_len: u32,
    reserved_block: u64,
    seed: u64,
    total_block: u64,
    total_entry: Divisor,
}

unsafe impl Send for Dict {}
unsafe impl Sync for Dict {}

impl Dict {
    /// Creates a dictionary file at `path`, optionally bulk-loading `source`.
    ///
    /// If the source overruns the slab that `avg_item_size` predicted, the
    /// build is retried once with the observed per-record padding folded into
    /// the estimate before giving up with [`Error::OutOfCapacity`].
    pub fn create(
        path: impl AsRef<Path>,
        config: &Config,
        mut source: Option<&mut dyn Source>,
    ) -> Result<()> {
        let path = path.as_ref();
        let total_entry = total_entry_for(config.item_limit);
        if !(MIN_ENTRY..=MAX_ENTRY).contains(&total_entry)
            || config.max_key_len == 0
            || config.max_key_len > MAX_KEY_LEN
            || config.max_val_len == 0
            || config.max_val_len > MAX_VAL_LEN
            || config.avg_item_size < 2
            || config.avg_item_size > config.max_key_len + config.max_val_len
        {
            return Err(Error::BadArguments);
        }

        let per_item = (config.avg_item_size as u64 + 4 + BLOCK_SIZE - 1) / BLOCK_SIZE;
        match Self::try_create(path, config, total_entry, per_item, reborrow_source(&mut source))?
        {
            CreateOutcome::Done => Ok(()),
            CreateOutcome::Overflow { avg_padding } if avg_padding > BLOCK_SIZE / 2 => {
                let per_item =
                    (config.avg_item_size as u64 + 4 + avg_padding + BLOCK_SIZE - 1) / BLOCK_SIZE;
                match Self::try_create(
                    path,
                    config,
                    total_entry,
                    per_item,
                    reborrow_source(&mut source),
                )? {
                    CreateOutcome::Done => Ok(()),
                    CreateOutcome::Overflow { .. } => Err(Error::OutOfCapacity),
                }
            }
            CreateOutcome::Overflow { .. } => Err(Error::OutOfCapacity),
        }
    }

    fn try_create(
        path: &Path,
        config: &Config,
        total_entry: u64,
        blocks_per_item: u64,
        source: Option<&mut dyn Source>,
    ) -> Result<CreateOutcome> {
        let mut total_block = blocks_per_item * (config.item_limit + 1);
        let init_end = total_block;
        total_block += total_block / (DATA_RESERVE_FACTOR - 1) + 1;
        total_block += record_blocks(config.max_key_len, config.max_val_len) * 2;
        if total_block > DATA_BLOCK_LIMIT {
            return Err(Error::TooBig);
        }

        let data_off = TABLE_OFF + total_entry * 8;
        let size = data_off + total_block * BLOCK_SIZE;
        let res = MemMap::create(path, size)?;

        let header = res.as_ptr() as *mut Header;
        let seed = seed_from_clock();
        unsafe {
            ptr::write(
                header,
                Header {
                    magic: MAGIC,
                    version: VERSION,
                    writing: AtomicU8::new(0),
                    kv_limit: config.max_key_len | (config.max_val_len << 8),
                    seed,
                    item: AtomicU64::new(0),
                    total_entry,
                    clean_entry: AtomicU64::new(total_entry),
                    total_block,
                    free_block: AtomicU64::new(total_block),
                    block_cursor: AtomicU64::new(0),
                },
            );
            let control = res.as_ptr().add(HEADER_SIZE as usize) as *mut ControlBlock;
            ptr::write(control, ControlBlock::new());
        }
        let table = unsafe { res.as_ptr().add(TABLE_OFF as usize) } as *mut u64;
        for i in 0..total_entry {
            unsafe { ptr::write(table.add(i as usize), Entry::CLEAN.0) };
        }
        let data = unsafe { res.as_ptr().add(data_off as usize) };

        let header = unsafe { &*header };
        if let Some(source) = source {
            source.reset();
            let total_items = source.total();
            if total_items as u64 > config.item_limit {
                log::warn!("bulk source holds more items than the configured limit");
                return Err(Error::BadArguments);
            }
            let divisor = Divisor::new(total_entry);
            let mut cursor = 0u64;
            let mut padding_sum = 0u64;
            for i in 0..total_items {
                let rec = source.read();
                if rec.key.is_empty()
                    || rec.key.len() > config.max_key_len as usize
                    || rec.val.len() > config.max_val_len as usize
                {
                    log::warn!("bulk source produced an out-of-range record");
                    return Err(Error::BadArguments);
                }
                let code = hash(seed, rec.key);
                let tag = code >> 56;
                let mut pos = divisor.rem(code);
                let mut installed = false;
                for off in 0..total_entry {
                    let slot = unsafe { &mut *table.add(pos as usize) };
                    let e = Entry(*slot);
                    if e.is_empty() {
                        header.item.fetch_add(1, Ordering::Relaxed);
                        header.clean_entry.fetch_sub(1, Ordering::Relaxed);
                    } else if e.tag() == tag && key_matches_raw(data, e.blk(), rec.key) {
                        // Duplicate key in the source: last one wins.
                        let old = mark_raw(data, e.blk());
                        let bcnt = old.record_blocks();
                        set_mark_raw(data, e.blk(), Mark::for_free(bcnt));
                        header.free_block.fetch_add(bcnt, Ordering::Relaxed);
                    } else {
                        pos += 1;
                        if pos >= total_entry {
                            pos = 0;
                        }
                        continue;
                    }
                    let bcnt = record_blocks(rec.key.len() as u32, rec.val.len() as u32);
                    padding_sum += record_padding(rec.key.len() as u32, rec.val.len() as u32);
                    let neo = cursor;
                    cursor += bcnt;
                    if cursor > init_end {
                        return Ok(CreateOutcome::Overflow {
                            avg_padding: padding_sum / (i as u64 + 1) + 1,
                        });
                    }
                    header.free_block.fetch_sub(bcnt, Ordering::Relaxed);
                    unsafe { write_record(data, neo, rec.key, rec.val) };
                    let tip = tip_of(data, neo);
                    *slot = Entry::new(neo, tip, tag, off).0;
                    installed = true;
                    break;
                }
                if !installed {
                    return Err(Error::Corruption);
                }
            }
            header.block_cursor.store(cursor, Ordering::Relaxed);
        }

        let cursor = header.block_cursor.load(Ordering::Relaxed);
        set_mark_raw(data, cursor, Mark::for_free(total_block - cursor));
        Ok(CreateOutcome::Done)
    }

    /// Opens an existing dictionary file.
    ///
    /// `Shared` maps the file read-write for cooperating processes and uses
    /// the in-file control block; `Monopoly` takes the file exclusively and
    /// reinitializes the lock state on the heap; `CopyData` reads the file
    /// into an anonymous mapping (hugepages preferred) and detaches.
    pub fn load(path: impl AsRef<Path>, policy: LoadPolicy) -> Result<Self> {
        let path = path.as_ref();
        let res = match policy {
            LoadPolicy::Shared => MemMap::open(path, false, true)?,
            LoadPolicy::Monopoly => MemMap::open(path, true, true)?,
            LoadPolicy::CopyData => MemMap::open_copy(path)?,
        };
        Self::init(res, policy != LoadPolicy::Shared, path)
    }

    /// Builds a private dictionary from `size` bytes filled by `fill`, for
    /// callers that stream the image from somewhere other than a local file.
    pub fn load_with(size: u64, fill: impl FnOnce(&mut [u8]) -> Result<()>) -> Result<Self> {
        let res = MemMap::anonymous_with(size, fill)?;
        Self::init(res, true, Path::new("<memory>"))
    }

    fn init(res: MemMap, monopoly: bool, path: &Path) -> Result<Self> {
        if res.len() < TABLE_OFF {
            log::warn!("broken file: {}", path.display());
            return Err(Error::BrokenFile(path.into()));
        }
        let header = res.as_ptr() as *const Header;
        let h = unsafe { &*header };
        let kv = Mark(u64::from(h.kv_limit));
        if h.magic != MAGIC
            || h.version != VERSION
            || kv.klen() == 0
            || !(MIN_ENTRY..=MAX_ENTRY).contains(&h.total_entry)
            || h.total_block < h.total_entry
            || h.total_block > DATA_BLOCK_LIMIT
        {
            log::warn!("broken file: {}", path.display());
            return Err(Error::BrokenFile(path.into()));
        }
        let reserved_block = record_blocks(kv.klen(), kv.vlen()) * 2;
        let data_off = TABLE_OFF + h.total_entry * 8;
        if h.total_block <= reserved_block || res.len() < data_off + h.total_block * BLOCK_SIZE {
            log::warn!("broken file: {}", path.display());
            return Err(Error::BrokenFile(path.into()));
        }

        let mut heap_control = None;
        let control = if monopoly {
            if h.writing.load(Ordering::Relaxed) != 0 {
                log::warn!("file is not saved correctly: {}", path.display());
                return Err(Error::NotSavedCorrectly(path.into()));
            }
            let boxed = Box::new(ControlBlock::new());
            let ptr = &*boxed as *const ControlBlock;
            heap_control = Some(boxed);
            ptr
        } else {
            let ptr = unsafe { res.as_ptr().add(HEADER_SIZE as usize) } as *const ControlBlock;
            unsafe { &*ptr }.acquire_ref()?;
            ptr
        };

        Ok(Self {
            table: unsafe { res.as_ptr().add(TABLE_OFF as usize) } as *const AtomicU64,
            data: unsafe { res.as_ptr().add(data_off as usize) },
            header,
            control,
            _heap_control: heap_control,
            shared: !monopoly,
            max_key_len: kv.klen(),
            max_val_len: kv.vlen(),
            reserved_block,
            seed: h.seed,
            total_block: h.total_block,
            total_entry: Divisor::new(h.total_entry),
            res,
        })
    }

    /// Grows the data slab of the file at `path` by `percent` (1–1000).
    ///
    /// Only the slab is extended; the entry table and thus the item limit are
    /// fixed at creation. Returns the configuration the grown file now
    /// corresponds to; its `avg_item_size` reflects the larger slab.
    pub fn extend(path: impl AsRef<Path>, percent: u32) -> Result<Config> {
        if percent == 0 || percent > 1000 {
            return Err(Error::BadArguments);
        }
        let path = path.as_ref();
        let res = MemMap::open(path, true, false)?;
        if res.len() < TABLE_OFF {
            return Err(Error::BrokenFile(path.into()));
        }
        let (kv, total_entry, old_total, data_off, usable, ext) = {
            let h = unsafe { &*(res.as_ptr() as *const Header) };
            let kv = Mark(u64::from(h.kv_limit));
            if h.magic != MAGIC
                || h.version != VERSION
                || kv.klen() == 0
                || !(MIN_ENTRY..=MAX_ENTRY).contains(&h.total_entry)
                || h.total_block > DATA_BLOCK_LIMIT
            {
                return Err(Error::BrokenFile(path.into()));
            }
            let reserved_block = record_blocks(kv.klen(), kv.vlen()) * 2;
            let usable = h.total_block.saturating_sub(reserved_block);
            let ext = (usable * u64::from(percent) + 99) / 100;
            let data_off = TABLE_OFF + h.total_entry * 8;
            if usable == 0
                || h.total_block + ext > DATA_BLOCK_LIMIT
                || res.len() < data_off + h.total_block * BLOCK_SIZE
            {
                return Err(Error::BrokenFile(path.into()));
            }
            (kv, h.total_entry, h.total_block, data_off, usable, ext)
        };

        let new_len = res.len() + ext * BLOCK_SIZE;
        let res = res.grow(new_len)?;
        // One free run covers the whole extension, starting at the old slab
        // end.
        unsafe {
            let p = res
                .as_ptr()
                .add((data_off + old_total * BLOCK_SIZE) as usize);
            atomic_u64(p).store(Mark::for_free(ext).0, Ordering::Relaxed);
            let h = &mut *(res.as_ptr() as *mut Header);
            h.total_block += ext;
            h.free_block.fetch_add(ext, Ordering::Relaxed);
        }

        let item_limit = total_entry * 2 / 3;
        let mut bcnt = usable + ext;
        bcnt -= bcnt / DATA_RESERVE_FACTOR;
        Ok(Config {
            item_limit,
            max_key_len: kv.klen(),
            max_val_len: kv.vlen(),
            avg_item_size: ((bcnt * BLOCK_SIZE - item_limit * (BLOCK_SIZE / 2)) / item_limit
                - 4) as u32,
        })
    }

    /// Writes the whole region to a fresh file.
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        self.res.dump(path.as_ref())
    }

    /// Number of stored items.
    pub fn item(&self) -> u64 {
        self.header().item.load(Ordering::Relaxed)
    }

    /// Largest number of items this dictionary accepts.
    pub fn item_limit(&self) -> u64 {
        self.total_entry.value() * 2 / 3
    }

    /// Free data bytes above the defragmentation reserve.
    pub fn data_free(&self) -> u64 {
        self.free_block()
            .saturating_sub(self.total_reserved_block())
            * BLOCK_SIZE
    }

    pub fn max_key_len(&self) -> u32 {
        self.max_key_len
    }

    pub fn max_val_len(&self) -> u32 {
        self.max_val_len
    }

    /// Looks up `key`, returning a copy of its value.
    ///
    /// Lock-free. While a sweep is rearranging the entry table a miss is
    /// retried twice; a vanishingly small chance of a false miss remains.
    pub fn fetch(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        self.fetch_into(key, &mut out).then_some(out)
    }

    /// Like [`fetch`](Self::fetch) but reuses `out`, clearing it first.
    pub fn fetch_into(&self, key: &[u8], out: &mut Vec<u8>) -> bool {
        self.fetch_into_with_code(hash(self.seed, key), key, out)
    }

    /// Hashes `key` and prefetches its home table slot, returning the code
    /// for the `*_with_code` operations. Lets a batching caller overlap the
    /// table access of one lookup with the hashing of the next.
    pub fn touch(&self, key: &[u8]) -> u64 {
        let code = hash(self.seed, key);
        let pos = self.total_entry.rem(code);
        prefetch_read_low(self.entry_at(pos) as *const AtomicU64 as *const u8);
        code
    }

    /// Prefetches the record block behind the first tag match for `code`.
    pub fn touch_code(&self, code: u64) {
        let total = self.total_entry.value();
        let tag = code >> 56;
        let mut pos = self.total_entry.rem(code);
        for _ in 0..total {
            let e = Entry(self.entry_at(pos).load(Ordering::Relaxed));
            if e.is_empty() {
                if e.is_clean() {
                    return;
                }
            } else if e.tag() == tag {
                prefetch_read_low(self.block_ptr(e.blk()));
                return;
            }
            pos += 1;
            if pos == total {
                pos = 0;
            }
        }
    }

    /// [`fetch_into`](Self::fetch_into) with a code from [`touch`](Self::touch).
    pub fn fetch_into_with_code(&self, code: u64, key: &[u8], out: &mut Vec<u8>) -> bool {
        let mut done = self.fetch_inner(code, key, out);
        // An entry moves at most twice while a sweep runs, which can hide it
        // from a single probe. Two more attempts bound the false-miss window
        // without closing it entirely.
        if !done && self.control().is_sweeping() {
            done = self.fetch_inner(code, key, out);
            if !done {
                done = self.fetch_inner(code, key, out);
            }
        }
        done
    }

    fn fetch_inner(&self, code: u64, key: &[u8], out: &mut Vec<u8>) -> bool {
        let total = self.total_entry.value();
        let tag = code >> 56;
        let mut pos = self.total_entry.rem(code);
        for _ in 0..total {
            let slot = self.entry_at(pos);
            let mut e = Entry(slot.load(Ordering::Acquire));
            loop {
                if e.is_empty() {
                    if e.is_clean() {
                        return false;
                    }
                    break;
                }
                if e.tag() != tag {
                    break;
                }
                let blk = e.blk();
                let mark = self.mark_acquire(blk);
                let reloaded = Entry(slot.load(Ordering::Acquire));
                if !reloaded.same(e) {
                    // The entry moved under us; judge the new one.
                    e = reloaded;
                    continue;
                }
                if self.key_matches(key, mark, blk) {
                    out.clear();
                    out.extend_from_slice(unsafe {
                        slice::from_raw_parts(
                            self.block_ptr(blk).add(4 + mark.klen() as usize),
                            mark.vlen() as usize,
                        )
                    });
                    let reloaded = Entry(slot.load(Ordering::Acquire));
                    if !reloaded.same(e) {
                        e = reloaded;
                        continue;
                    }
                    return true;
                }
                break;
            }
            pos += 1;
            if pos == total {
                pos = 0;
            }
        }
        false
    }

    /// [`fetch`](Self::fetch) with a code from [`touch`](Self::touch).
    pub fn fetch_with_code(&self, code: u64, key: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        self.fetch_into_with_code(code, key, &mut out).then_some(out)
    }

    /// Inserts or overwrites `key`.
    ///
    /// Returns `Ok(false)` when the input is out of range, the table is at
    /// its load-factor limit, or the slab cannot hold the record.
    pub fn update(&self, key: &[u8], val: &[u8]) -> Result<bool> {
        self.update_with_code(hash(self.seed, key), key, val)
    }

    /// [`update`](Self::update) with a code from [`touch`](Self::touch).
    pub fn update_with_code(&self, code: u64, key: &[u8], val: &[u8]) -> Result<bool> {
        if key.is_empty()
            || key.len() > self.max_key_len as usize
            || val.len() > self.max_val_len as usize
        {
            return Ok(false);
        }
        let _guard = self.control().acquire_writer();
        self.enter_write()?;
        let done = self.update_locked(code, key, val)?;
        self.leave_write();
        Ok(done)
    }

    /// Removes `key`, returning whether it was present.
    pub fn erase(&self, key: &[u8]) -> Result<bool> {
        self.erase_with_code(hash(self.seed, key), key)
    }

    /// [`erase`](Self::erase) with a code from [`touch`](Self::touch).
    pub fn erase_with_code(&self, code: u64, key: &[u8]) -> Result<bool> {
        if key.is_empty() || key.len() > self.max_key_len as usize {
            return Ok(false);
        }
        let _guard = self.control().acquire_writer();
        self.enter_write()?;
        let done = self.erase_locked(code, key)?;
        self.leave_write();
        Ok(done)
    }

    /// Marks the header as mid-write. A set flag here means a previous writer
    /// died with the region half-mutated; refuse to touch it.
    fn enter_write(&self) -> Result<()> {
        let h = self.header();
        if h.writing.load(Ordering::Relaxed) != 0 {
            return Err(Error::Corruption);
        }
        h.writing.store(1, Ordering::Relaxed);
        Ok(())
    }

    fn leave_write(&self) {
        self.header().writing.store(0, Ordering::Relaxed);
    }

    fn erase_locked(&self, code: u64, key: &[u8]) -> Result<bool> {
        let total = self.total_entry.value();
        let tag = code >> 56;
        let mut pos = self.total_entry.rem(code);
        for _ in 0..total {
            let slot = self.entry_at(pos);
            let e = Entry(slot.load(Ordering::Relaxed));
            if e.is_empty() {
                if e.is_clean() {
                    break;
                }
            } else if e.tag() == tag {
                let blk = e.blk();
                let mark = self.mark(blk);
                consistency_check(!mark.is_free() && mark.vlen() <= self.max_val_len)?;
                if self.key_matches(key, mark, blk) {
                    slot.store(Entry::DELETED.0, Ordering::Release);
                    consistency_check(self.item() != 0)?;
                    self.header().item.fetch_sub(1, Ordering::Relaxed);
                    let bcnt = mark.record_blocks();
                    self.set_mark(blk, Mark::for_free(bcnt));
                    self.add_free(bcnt);
                    consistency_check(self.free_block() <= self.total_block)?;
                    return Ok(true);
                }
            }
            pos += 1;
            if pos == total {
                pos = 0;
            }
        }
        Ok(false)
    }

    fn update_locked(&self, code: u64, key: &[u8], val: &[u8]) -> Result<bool> {
        let new_block = record_blocks(key.len() as u32, val.len() as u32);
        if self.free_block() < new_block + self.total_reserved_block()
            || total_entry_for(self.item()) > self.total_entry.value()
        {
            return Ok(false);
        }
        consistency_check(
            self.cursor() < self.total_block
                && self.free_block() <= self.total_block
                && self.clean_entry() <= self.total_entry.value(),
        )?;

        if self.clean_entry() <= self.total_entry.value() / ENTRY_RESERVE_FACTOR {
            self.sweep()?;
        }

        consistency_check({
            let cur = self.cursor();
            let m = self.mark(cur);
            m.is_free() && cur + m.bcnt() <= self.total_block
        })?;

        // A record relocated by the defragmenter below may be this very key;
        // remember its pre-move entry so publication can break the ABA tie.
        let mut origin = Entry::CLEAN;

        consistency_check(self.mark(self.cursor()).bcnt() >= self.reserved_block)?;
        let mut wrapped = false;
        while self.mark(self.cursor()).bcnt() < new_block + self.reserved_block {
            let cur = self.cursor();
            let nxt = cur + self.mark(cur).bcnt();
            if nxt == self.total_block {
                consistency_check(!wrapped && self.free_block() >= self.mark(cur).bcnt())?;
                wrapped = true;
                let mut vic = 0u64;
                while vic < self.cursor() {
                    let m = self.mark(vic);
                    if m.is_free() {
                        vic += m.bcnt();
                    } else if vic < new_block + self.reserved_block {
                        // A record still inside the region the new record
                        // needs; pull it up to the cursor. Blocks near the
                        // start can be moved more than once per write.
                        let bcnt = m.record_blocks();
                        if self.mark(self.cursor()).bcnt() < bcnt {
                            break;
                        }
                        self.move_record(vic, code, key, &mut origin)?;
                        vic += bcnt;
                        if self.cursor() == self.total_block {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                consistency_check(vic <= self.cursor() || self.cursor() == self.total_block)?;
                self.set_mark(0, Mark::for_free(vic));
                self.set_cursor(0);
            } else {
                let m = self.mark(nxt);
                let bcnt;
                if m.is_free() {
                    consistency_check(nxt + m.bcnt() <= self.total_block)?;
                    bcnt = m.bcnt();
                } else {
                    bcnt = m.record_blocks();
                    consistency_check(bcnt <= self.mark(cur).bcnt())?;
                    self.move_record(nxt, code, key, &mut origin)?;
                }
                let cur = self.cursor();
                self.set_mark(cur, Mark::for_free(self.mark(cur).bcnt() + bcnt));
            }
        }

        self.sub_free(new_block);
        let neo = self.cursor();
        let next = neo + new_block;
        self.set_mark(next, Mark::for_free(self.mark(neo).bcnt() - new_block));
        self.set_mark(neo, Mark::for_free(new_block));
        self.set_cursor(next);
        let tip = unsafe {
            write_record(self.data, neo, key, val);
            tip_of(self.data, neo)
        };

        let total = self.total_entry.value();
        let tag = code >> 56;
        let mut pos = self.total_entry.rem(code);
        let mut bookmark: Option<(u64, Entry)> = None;
        for off in 0..total {
            let slot = self.entry_at(pos);
            let e = Entry(slot.load(Ordering::Relaxed));
            if e.is_empty() {
                // First empty slot is where the record goes if no live entry
                // for this key turns up later in the run.
                if bookmark.is_none() {
                    bookmark = Some((pos, Entry::new(neo, tip, tag, off)));
                }
                if e.is_clean() {
                    break;
                }
            } else if e.tag() == tag {
                let blk = e.blk();
                let mark = self.mark(blk);
                consistency_check(!mark.is_free() && mark.vlen() <= self.max_val_len)?;
                if self.key_matches(key, mark, blk) {
                    let bcnt = mark.record_blocks();
                    if self.value_matches(val, mark, blk) {
                        // Identical value: hand the carved blocks back.
                        let tail = self.mark(self.cursor()).bcnt();
                        self.set_cursor(neo);
                        self.set_mark(neo, Mark::for_free(bcnt + tail));
                    } else {
                        let mut entry = Entry::new(neo, tip, tag, off);
                        if entry.same(origin) {
                            entry = entry.with_tip(entry.tip() ^ 1);
                        }
                        slot.store(entry.0, Ordering::Release);
                        self.set_mark(blk, Mark::for_free(bcnt));
                    }
                    self.add_free(bcnt);
                    consistency_check(self.free_block() <= self.total_block)?;
                    return Ok(true);
                }
            }
            pos += 1;
            if pos == total {
                pos = 0;
            }
        }
        if let Some((pos, entry)) = bookmark {
            let slot = self.entry_at(pos);
            if Entry(slot.load(Ordering::Relaxed)).is_clean() {
                self.header().clean_entry.fetch_sub(1, Ordering::Relaxed);
            }
            slot.store(entry.0, Ordering::Release);
            self.header().item.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
        Ok(false)
    }

    /// Relocates the record at `vic` into the cursor's free run and repoints
    /// its entry. `code`/`key` identify the key currently being written so
    /// its pre-move entry can be remembered for the ABA check.
    fn move_record(&self, vic: u64, code: u64, key: &[u8], origin: &mut Entry) -> Result<()> {
        let mark = self.mark(vic);
        debug_assert!(!mark.is_free());
        let bcnt = mark.record_blocks();
        let cur = self.cursor();
        unsafe {
            ptr::copy_nonoverlapping(
                self.block_ptr(vic).add(8),
                self.block_ptr(cur).add(8),
                (bcnt * BLOCK_SIZE - 8) as usize,
            );
        }
        let vic_key = unsafe {
            slice::from_raw_parts(self.block_ptr(vic).add(4), mark.klen() as usize)
        };
        let vic_code = hash(self.seed, vic_key);
        let remember = vic_code == code && vic_key == key;
        if remember {
            consistency_check(origin.is_clean())?;
        }

        let total = self.total_entry.value();
        let mut pos = self.total_entry.rem(vic_code);
        let mut done = false;
        for _ in 0..total {
            let slot = self.entry_at(pos);
            let e = Entry(slot.load(Ordering::Relaxed));
            if e.is_empty() {
                if e.is_clean() {
                    break;
                }
            } else if e.blk() == vic {
                if remember {
                    *origin = e;
                }
                self.sub_free(bcnt);
                let next = cur + bcnt;
                if next != self.total_block {
                    consistency_check(next < self.total_block)?;
                    self.set_mark(next, Mark::for_free(self.mark(cur).bcnt() - bcnt));
                }
                self.set_mark(cur, self.mark(vic));
                slot.store(e.with_blk(cur).0, Ordering::Release);
                // The victim's payload stays put until here so a reader
                // holding the old entry still reads a whole record; its final
                // entry re-check rejects the stale copy.
                self.set_mark(vic, Mark::for_free(bcnt));
                self.set_cursor(next);
                self.add_free(bcnt);
                done = true;
                break;
            }
            pos += 1;
            if pos == total {
                pos = 0;
            }
        }
        if !done {
            // No entry references the victim; just reclaim its blocks.
            self.set_mark(vic, Mark::for_free(bcnt));
            self.add_free(bcnt);
            consistency_check(self.free_block() <= self.total_block)?;
        }
        Ok(())
    }

    /// Compacts probe runs toward their homes, reviving tombstones.
    ///
    /// Two passes; the second runs only if the first moved something. Readers
    /// observe the sweep flag and retry misses while entries are in motion.
    fn sweep(&self) -> Result<()> {
        self.control().begin_sweep();
        if self.sweep_pass(false)? {
            self.sweep_pass(true)?;
        }

        let total = self.total_entry.value();
        let mut live = 0u64;
        let mut dirty = 0u64;
        for i in 0..total {
            let slot = self.entry_at(i);
            let e = Entry(slot.load(Ordering::Relaxed));
            if e.is_empty() {
                if e.fit() {
                    // Tombstone the second pass still depends on; keep it one
                    // more generation.
                    dirty += 1;
                    slot.store(e.without_fit().0, Ordering::Relaxed);
                } else {
                    slot.store(Entry::CLEAN.0, Ordering::Relaxed);
                }
            } else {
                live += 1;
                if e.fit() {
                    slot.store(e.without_fit().0, Ordering::Relaxed);
                }
            }
        }

        self.control().end_sweep();
        consistency_check(live == self.item())?;
        self.header()
            .clean_entry
            .store(total - live - dirty, Ordering::Relaxed);
        Ok(())
    }

    fn sweep_pass(&self, last_pass: bool) -> Result<bool> {
        let total = self.total_entry.value();
        let mut moved = false;
        for i in 0..total {
            let slot_i = self.entry_at(i);
            let e = Entry(slot_i.load(Ordering::Relaxed));
            if e.is_empty() || e.fit() {
                continue;
            }
            let home = if e.off() < MAX_OFF {
                if i < e.off() {
                    total + i - e.off()
                } else {
                    i - e.off()
                }
            } else {
                // Saturated offset; recover the home slot from the key.
                let blk = e.blk();
                let mark = self.mark(blk);
                let rec_key = unsafe {
                    slice::from_raw_parts(self.block_ptr(blk).add(4), mark.klen() as usize)
                };
                let code = hash(self.seed, rec_key);
                consistency_check(e.tag() == code >> 56)?;
                self.total_entry.rem(code)
            };

            let mut fit = true;
            let mut pos = home;
            for off in 0..total {
                let slot = self.entry_at(pos);
                let t = Entry(slot.load(Ordering::Relaxed));
                if t.is_empty() {
                    moved = true;
                    consistency_check(!t.is_clean())?;
                    let mut neo = e.with_off(off);
                    if fit {
                        neo = neo.with_fit();
                    }
                    slot.store(neo.0, Ordering::Release);
                    let tomb = if last_pass {
                        Entry::DELETED.with_fit()
                    } else {
                        Entry::DELETED
                    };
                    slot_i.store(tomb.0, Ordering::Release);
                    break;
                } else if !t.fit() {
                    if pos == i {
                        // Already as close to home as the run allows.
                        if fit {
                            slot_i.store(e.with_fit().0, Ordering::Relaxed);
                        }
                        break;
                    }
                    fit = false;
                }
                pos += 1;
                if pos == total {
                    pos = 0;
                }
            }
        }
        Ok(moved)
    }

    #[inline]
    fn header(&self) -> &Header {
        unsafe { &*self.header }
    }

    #[inline]
    fn control(&self) -> &ControlBlock {
        unsafe { &*self.control }
    }

    #[inline]
    fn entry_at(&self, pos: u64) -> &AtomicU64 {
        debug_assert!(pos < self.total_entry.value());
        unsafe { &*self.table.add(pos as usize) }
    }

    #[inline]
    fn block_ptr(&self, blk: u64) -> *mut u8 {
        unsafe { self.data.add((blk * BLOCK_SIZE) as usize) }
    }

    #[inline]
    fn mark(&self, blk: u64) -> Mark {
        Mark(unsafe { atomic_u64(self.block_ptr(blk)) }.load(Ordering::Relaxed))
    }

    #[inline]
    fn mark_acquire(&self, blk: u64) -> Mark {
        Mark(unsafe { atomic_u64(self.block_ptr(blk)) }.load(Ordering::Acquire))
    }

    #[inline]
    fn set_mark(&self, blk: u64, mark: Mark) {
        unsafe { atomic_u64(self.block_ptr(blk)) }.store(mark.0, Ordering::Relaxed);
    }

    #[inline]
    fn cursor(&self) -> u64 {
        self.header().block_cursor.load(Ordering::Relaxed)
    }

    #[inline]
    fn set_cursor(&self, v: u64) {
        self.header().block_cursor.store(v, Ordering::Relaxed);
    }

    #[inline]
    fn free_block(&self) -> u64 {
        self.header().free_block.load(Ordering::Relaxed)
    }

    #[inline]
    fn add_free(&self, n: u64) {
        self.header().free_block.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    fn sub_free(&self, n: u64) {
        self.header().free_block.fetch_sub(n, Ordering::Relaxed);
    }

    #[inline]
    fn clean_entry(&self) -> u64 {
        self.header().clean_entry.load(Ordering::Relaxed)
    }

    #[inline]
    fn total_reserved_block(&self) -> u64 {
        self.reserved_block + (self.total_block - self.reserved_block) / DATA_RESERVE_FACTOR
    }

    fn key_matches(&self, key: &[u8], mark: Mark, blk: u64) -> bool {
        key_matches_with(self.data, key, mark, blk)
    }

    fn value_matches(&self, val: &[u8], mark: Mark, blk: u64) -> bool {
        if mark.vlen() as usize != val.len() {
            return false;
        }
        let stored = unsafe {
            slice::from_raw_parts(
                self.block_ptr(blk).add(4 + mark.klen() as usize),
                val.len(),
            )
        };
        stored == val
    }
}

impl Drop for Dict {
    fn drop(&mut self) {
        if self.shared {
            self.control().release_ref();
        }
    }
}

fn seed_from_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9e37_79b9_7f4a_7c15)
}

#[inline]
fn mark_raw(data: *const u8, blk: u64) -> Mark {
    Mark(unsafe { atomic_u64(data.add((blk * BLOCK_SIZE) as usize)) }.load(Ordering::Relaxed))
}

#[inline]
fn set_mark_raw(data: *mut u8, blk: u64, mark: Mark) {
    unsafe { atomic_u64(data.add((blk * BLOCK_SIZE) as usize)) }.store(mark.0, Ordering::Relaxed);
}

fn key_matches_raw(data: *const u8, blk: u64, key: &[u8]) -> bool {
    key_matches_with(data, key, mark_raw(data, blk), blk)
}

fn key_matches_with(data: *const u8, key: &[u8], mark: Mark, blk: u64) -> bool {
    if mark.klen() as usize != key.len() {
        return false;
    }
    unsafe {
        let stored = data.add((blk * BLOCK_SIZE) as usize).add(4);
        if key.len() == 8 {
            // Common fixed-width keys compare in one unaligned word.
            ptr::read_unaligned(key.as_ptr() as *const u64)
                == ptr::read_unaligned(stored as *const u64)
        } else {
            slice::from_raw_parts(stored, key.len()) == key
        }
    }
}

/// Fills the record body at `blk`, then publishes the mark with one release
/// store. The first four payload bytes ride inside the mark itself, so a
/// reader that sees the mark sees a complete prefix.
unsafe fn write_record(data: *mut u8, blk: u64, key: &[u8], val: &[u8]) {
    let p = data.add((blk * BLOCK_SIZE) as usize);
    let mut part = [0u8; 4];
    let (mut k, mut v) = (key, val);
    for b in part.iter_mut() {
        if let Some((&first, rest)) = k.split_first() {
            *b = first;
            k = rest;
        } else if let Some((&first, rest)) = v.split_first() {
            *b = first;
            v = rest;
        }
    }
    let mut at = p.add(8);
    ptr::copy_nonoverlapping(k.as_ptr(), at, k.len());
    at = at.add(k.len());
    ptr::copy_nonoverlapping(v.as_ptr(), at, v.len());
    let mark = Mark::for_record(key.len() as u32, val.len() as u32, part);
    atomic_u64(p).store(mark.0, Ordering::Release);
}

/// Hashes a record's body under its own length word, yielding the entry tip
/// that disambiguates records reusing a freed block.
fn tip_of(data: *const u8, blk: u64) -> u64 {
    unsafe {
        let p = data.add((blk * BLOCK_SIZE) as usize);
        let mark = Mark(atomic_u64(p).load(Ordering::Relaxed));
        let body = slice::from_raw_parts(p.add(4), (mark.klen() + mark.vlen()) as usize);
        hash(u64::from(mark.lens_word()), body)
    }
}
