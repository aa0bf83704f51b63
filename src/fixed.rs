//! The fixed engine: keys and values of lengths chosen at create time.
//!
//! Records live in fixed-size nodes, so no mark word is needed: the entry
//! table holds 32-bit head indices and each node chains to the next with an
//! inline key and value. Reads are lock-free chain walks. Erases and
//! overwrites park the victim node in a recycle ring and only hand it back to
//! the free list once its bin has aged at least 50 ms, long enough for any
//! reader that saw the node linked to have finished with it. That reclamation
//! is probabilistic by design; a reader descheduled across the grace period
//! can observe a recycled node.

use std::path::Path;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use smallvec::SmallVec;

use crate::divisor::Divisor;
use crate::error::{consistency_check, Error, Result};
use crate::hash::hash;
use crate::layout::{prefetch_read, prefetch_read_low};
use crate::lock::ControlBlock;
use crate::mmap::MemMap;
use crate::{LoadPolicy, Source};

const MAGIC: u16 = 0xE888;
const VERSION: u8 = 1;

/// Chain terminator and free-list terminator.
const END: u32 = u32::MAX;

const RECYCLE_CAPACITY: u32 = 1 << 16;
const RECYCLE_BIN_SIZE: u32 = 1 << 8;
const RECYCLE_DELAY_MS: i64 = 50;

const CACHE_LINE: usize = 64;

/// Accepted key lengths are `1..=MAX_KEY_LEN`.
pub const MAX_KEY_LEN: u32 = u8::MAX as u32;
/// Accepted value lengths are `0..=MAX_VAL_LEN`.
pub const MAX_VAL_LEN: u32 = 1 << 16;
/// Smallest accepted `capacity`.
pub const MIN_CAPACITY: u32 = RECYCLE_CAPACITY;
/// Largest accepted `capacity`; the recycle ring's worth of spare nodes sits
/// above it.
pub const MAX_CAPACITY: u32 = u32::MAX - RECYCLE_CAPACITY;

const MAX_LOAD_FACTOR: u32 = 2;

const HEADER_SIZE: u64 = 48;
const STAMPS_OFF: u64 = HEADER_SIZE + ControlBlock::SIZE;
const RECYCLE_OFF: u64 = STAMPS_OFF + 8 * (RECYCLE_CAPACITY / RECYCLE_BIN_SIZE) as u64;
const TABLE_OFF: u64 = RECYCLE_OFF + 4 * RECYCLE_CAPACITY as u64;

#[repr(C)]
struct Header {
    magic: u16,
    version: u8,
    writing: AtomicU8,
    key_len: u8,
    _pad: [u8; 3],
    seed: u64,
    total_entry: u32,
    capacity: u32,
    val_len: u32,
    item: AtomicU32,
    recycle_read: AtomicU16,
    recycle_write: AtomicU16,
    free_head: AtomicU32,
    free_tail: AtomicU32,
    _pad2: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE as usize);

/// Creation-time shape of a fixed-engine dictionary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedConfig {
    /// Number of chain heads. The load factor `capacity / entry` must not
    /// exceed 2.
    pub entry: u32,
    /// Upper bound on stored items, `[65536, u32::MAX - 65536]`.
    pub capacity: u32,
    /// Exact key length, `1..=255`.
    pub key_len: u32,
    /// Exact value length, `0..=65536`.
    pub val_len: u32,
    /// Fan-out hint for callers that shard their writers; the single-writer
    /// engine records it but takes no action on it.
    pub concurrency: u32,
}

impl Default for FixedConfig {
    fn default() -> Self {
        Self {
            entry: MIN_CAPACITY,
            capacity: MIN_CAPACITY,
            key_len: 8,
            val_len: 0,
            concurrency: 1,
        }
    }
}

/// A loaded fixed-engine dictionary.
pub struct FixedDict {
    res: MemMap,
    header: *const Header,
    control: *const ControlBlock,
    stamps: *mut i64,
    recycle: *mut u32,
    table: *const AtomicU32,
    data: *mut u8,
    _heap_control: Option<Box<ControlBlock>>,
    shared: bool,
    key_len: u32,
    val_len: u32,
    item_size: u32,
    capacity: u32,
    seed: u64,
    total_entry: Divisor,
}

unsafe impl Send for FixedDict {}
unsafe impl Sync for FixedDict {}

#[inline]
fn item_size_for(key_len: u32, val_len: u32) -> u32 {
    (4 + key_len + val_len + 3) & !3
}

fn region_size(total_entry: u32, item_size: u32, capacity: u32) -> u64 {
    TABLE_OFF
        + 4 * total_entry as u64
        + item_size as u64 * (capacity as u64 + RECYCLE_CAPACITY as u64)
}

impl FixedDict {
    /// Creates a fixed-engine file at `path`, optionally bulk-loading
    /// `source`. Duplicate source keys keep their last value.
    pub fn create(
        path: impl AsRef<Path>,
        config: &FixedConfig,
        source: Option<&mut dyn Source>,
    ) -> Result<()> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&config.capacity)
            || config.entry == 0
            || config.capacity / config.entry > MAX_LOAD_FACTOR
            || config.key_len == 0
            || config.key_len > MAX_KEY_LEN
            || config.val_len > MAX_VAL_LEN
        {
            return Err(Error::BadArguments);
        }
        let path = path.as_ref();
        let item_size = item_size_for(config.key_len, config.val_len);
        let node_count = config.capacity + RECYCLE_CAPACITY;
        let size = region_size(config.entry, item_size, config.capacity);
        let res = MemMap::create(path, size)?;

        let seed = seed_from_clock();
        let header = res.as_ptr() as *mut Header;
        unsafe {
            ptr::write(
                header,
                Header {
                    magic: MAGIC,
                    version: VERSION,
                    writing: AtomicU8::new(0),
                    key_len: config.key_len as u8,
                    _pad: [0; 3],
                    seed,
                    total_entry: config.entry,
                    capacity: config.capacity,
                    val_len: config.val_len,
                    item: AtomicU32::new(0),
                    recycle_read: AtomicU16::new(0),
                    recycle_write: AtomicU16::new(0),
                    free_head: AtomicU32::new(0),
                    free_tail: AtomicU32::new(0),
                    _pad2: [0; 4],
                },
            );
            let control = res.as_ptr().add(HEADER_SIZE as usize) as *mut ControlBlock;
            ptr::write(control, ControlBlock::new());
        }

        let stamps = unsafe { res.as_ptr().add(STAMPS_OFF as usize) } as *mut i64;
        for i in 0..(RECYCLE_CAPACITY / RECYCLE_BIN_SIZE) as usize {
            unsafe { ptr::write(stamps.add(i), 0) };
        }
        let recycle = unsafe { res.as_ptr().add(RECYCLE_OFF as usize) } as *mut u32;
        for i in 0..RECYCLE_CAPACITY as usize {
            unsafe { ptr::write(recycle.add(i), END) };
        }
        let table = unsafe { res.as_ptr().add(TABLE_OFF as usize) } as *mut u32;
        for i in 0..config.entry as usize {
            unsafe { ptr::write(table.add(i), END) };
        }
        let data = unsafe { res.as_ptr().add((TABLE_OFF + 4 * config.entry as u64) as usize) };

        let node = |idx: u32| unsafe { data.add(idx as usize * item_size as usize) };
        let klen = config.key_len as usize;
        let vlen = config.val_len as usize;

        let mut count: u32 = 0;
        if let Some(source) = source {
            source.reset();
            let total = source.total();
            if total as u64 > config.capacity as u64 {
                log::warn!("bulk source holds more items than the configured capacity");
                return Err(Error::BadArguments);
            }
            let divisor = Divisor::new(u64::from(config.entry));
            for _ in 0..total {
                let rec = source.read();
                if rec.key.len() != klen || rec.val.len() != vlen {
                    log::warn!("bulk source produced a record of the wrong shape");
                    return Err(Error::BadArguments);
                }
                let ent = divisor.rem(hash(seed, rec.key)) as usize;
                let mut found = false;
                let mut idx = unsafe { *table.add(ent) };
                while idx != END {
                    let p = node(idx);
                    if keys_equal(unsafe { p.add(4) }, rec.key) {
                        unsafe {
                            ptr::copy_nonoverlapping(rec.val.as_ptr(), p.add(4 + klen), vlen)
                        };
                        found = true;
                        break;
                    }
                    idx = unsafe { ptr::read(p as *const u32) };
                }
                if !found {
                    let p = node(count);
                    unsafe {
                        ptr::write(p as *mut u32, *table.add(ent));
                        *table.add(ent) = count;
                        ptr::copy_nonoverlapping(rec.key.as_ptr(), p.add(4), klen);
                        ptr::copy_nonoverlapping(rec.val.as_ptr(), p.add(4 + klen), vlen);
                    }
                    count += 1;
                }
            }
        }

        debug_assert!(count < node_count);
        let h = unsafe { &*header };
        h.item.store(count, Ordering::Relaxed);
        h.free_head.store(count, Ordering::Relaxed);
        h.free_tail.store(node_count - 1, Ordering::Relaxed);
        let mut i = count;
        while i < node_count {
            let p = node(i);
            i += 1;
            unsafe {
                ptr::write(p as *mut u32, END);
                ptr::write(p.add(4) as *mut u32, i);
            }
        }
        unsafe { ptr::write(node(node_count - 1).add(4) as *mut u32, END) };
        Ok(())
    }

    /// Opens an existing fixed-engine file; policies as in
    /// [`Dict::load`](crate::Dict::load).
    pub fn load(path: impl AsRef<Path>, policy: LoadPolicy) -> Result<Self> {
        let path = path.as_ref();
        let res = match policy {
            LoadPolicy::Shared => MemMap::open(path, false, true)?,
            LoadPolicy::Monopoly => MemMap::open(path, true, true)?,
            LoadPolicy::CopyData => MemMap::open_copy(path)?,
        };
        Self::init(res, policy != LoadPolicy::Shared, path)
    }

    /// Builds a private dictionary from `size` bytes filled by `fill`.
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
        if h.magic != MAGIC
            || h.version != VERSION
            || h.key_len == 0
            || h.val_len > MAX_VAL_LEN
            || !(MIN_CAPACITY..=MAX_CAPACITY).contains(&h.capacity)
            || h.total_entry == 0
            || h.capacity / h.total_entry > MAX_LOAD_FACTOR
        {
            log::warn!("broken file: {}", path.display());
            return Err(Error::BrokenFile(path.into()));
        }
        let item_size = item_size_for(u32::from(h.key_len), h.val_len);
        if res.len() < region_size(h.total_entry, item_size, h.capacity) {
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
            stamps: unsafe { res.as_ptr().add(STAMPS_OFF as usize) } as *mut i64,
            recycle: unsafe { res.as_ptr().add(RECYCLE_OFF as usize) } as *mut u32,
            table: unsafe { res.as_ptr().add(TABLE_OFF as usize) } as *const AtomicU32,
            data: unsafe {
                res.as_ptr()
                    .add((TABLE_OFF + 4 * h.total_entry as u64) as usize)
            },
            header,
            control,
            _heap_control: heap_control,
            shared: !monopoly,
            key_len: u32::from(h.key_len),
            val_len: h.val_len,
            item_size,
            capacity: h.capacity,
            seed: h.seed,
            total_entry: Divisor::new(u64::from(h.total_entry)),
            res,
        })
    }

    /// Writes the whole region to a fresh file.
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        self.res.dump(path.as_ref())
    }

    pub fn item(&self) -> u32 {
        self.header().item.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn key_len(&self) -> u32 {
        self.key_len
    }

    pub fn val_len(&self) -> u32 {
        self.val_len
    }

    /// Looks up `key`, copying its value into `out`.
    ///
    /// `key` must be exactly `key_len` bytes and `out` at least `val_len`.
    pub fn fetch_into(&self, key: &[u8], out: &mut [u8]) -> bool {
        if key.len() != self.key_len as usize || out.len() < self.val_len as usize {
            return false;
        }
        let ent = self.total_entry.rem(hash(self.seed, key));
        let mut idx = self.table_at(ent).load(Ordering::Acquire);
        while idx != END {
            let p = self.node_ptr(idx);
            if keys_equal(unsafe { p.add(4) }, key) {
                unsafe {
                    ptr::copy_nonoverlapping(
                        p.add(4 + key.len()),
                        out.as_mut_ptr(),
                        self.val_len as usize,
                    );
                }
                return true;
            }
            idx = self.node_next(idx).load(Ordering::Acquire);
        }
        false
    }

    /// Looks up `key`, returning a copy of its value.
    pub fn fetch(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut out = vec![0u8; self.val_len as usize];
        self.fetch_into(key, &mut out).then_some(out)
    }

    /// Looks up a batch of packed keys, writing packed values.
    ///
    /// `keys` holds `n` keys of `key_len` bytes back to back; `out` must hold
    /// `n * val_len` bytes. Missing keys leave their slot untouched unless
    /// `default` (of `val_len` bytes) is given. Returns the hit count.
    ///
    /// Up to sixteen probes are kept in flight, each prefetching its next
    /// table slot or chain node while the others compare keys; the observable
    /// behavior is identical to `n` serial `fetch_into` calls.
    pub fn batch_fetch(&self, keys: &[u8], out: &mut [u8], default: Option<&[u8]>) -> usize {
        const WINDOW: usize = 16;
        let klen = self.key_len as usize;
        let vlen = self.val_len as usize;
        let batch = keys.len() / klen;
        debug_assert_eq!(keys.len(), batch * klen);
        debug_assert!(out.len() >= batch * vlen);
        if let Some(d) = default {
            debug_assert_eq!(d.len(), vlen);
        }

        let mut lanes: SmallVec<[Lane; WINDOW]> = SmallVec::new();
        let mut hit = 0usize;
        let mut next = 0usize;
        let window = batch.min(WINDOW);
        for _ in 0..window {
            lanes.push(self.lane_init(keys, klen, next));
            next += 1;
        }

        let mut live = lanes.len();
        while live > 0 {
            let mut i = 0;
            while i < live {
                let lane = lanes[i];
                let key = &keys[lane.idx * klen..][..klen];
                let mut follow = END;
                let mut done = false;
                match lane.node {
                    None => follow = self.table_at(lane.ent).load(Ordering::Acquire),
                    Some(n) => {
                        let p = self.node_ptr(n);
                        if keys_equal(unsafe { p.add(4) }, key) {
                            out[lane.idx * vlen..][..vlen].copy_from_slice(unsafe {
                                slice::from_raw_parts(p.add(4 + klen), vlen)
                            });
                            hit += 1;
                            done = true;
                        } else {
                            follow = self.node_next(n).load(Ordering::Acquire);
                        }
                    }
                }
                if !done && follow != END {
                    lanes[i].node = Some(follow);
                    self.prefetch_node(follow, klen, vlen);
                    i += 1;
                    continue;
                }
                if !done {
                    if let Some(d) = default {
                        out[lane.idx * vlen..][..vlen].copy_from_slice(d);
                    }
                }
                // This lane finished; feed it the next key or shrink the
                // window.
                if next < batch {
                    lanes[i] = self.lane_init(keys, klen, next);
                    next += 1;
                    i += 1;
                } else {
                    live -= 1;
                    lanes[i] = lanes[live];
                }
            }
        }
        hit
    }

    fn lane_init(&self, keys: &[u8], klen: usize, idx: usize) -> Lane {
        let key = &keys[idx * klen..][..klen];
        let ent = self.total_entry.rem(hash(self.seed, key));
        let slot: *const AtomicU32 = self.table_at(ent);
        prefetch_read(slot as *const u8);
        Lane {
            idx,
            ent,
            node: None,
        }
    }

    fn prefetch_node(&self, idx: u32, klen: usize, vlen: usize) {
        let p = self.node_ptr(idx);
        prefetch_read(p);
        let off = p as usize & (CACHE_LINE - 1);
        let boundary = ((p as usize & !(CACHE_LINE - 1)) + CACHE_LINE) as *const u8;
        if off + 4 + klen > CACHE_LINE {
            prefetch_read(boundary);
        } else if off + 4 + klen + vlen > CACHE_LINE {
            prefetch_read_low(boundary);
        }
    }

    /// Inserts or overwrites `key`.
    ///
    /// `key` and `val` must be exactly `key_len` and `val_len` bytes; returns
    /// `Ok(false)` on a shape mismatch or when the dictionary is full.
    pub fn update(&self, key: &[u8], val: &[u8]) -> Result<bool> {
        if key.len() != self.key_len as usize || val.len() != self.val_len as usize {
            return Ok(false);
        }
        let _guard = self.control().acquire_writer();
        self.enter_write()?;
        let done = self.update_locked(key, val)?;
        self.leave_write();
        Ok(done)
    }

    /// Removes `key`, returning whether it was present.
    pub fn erase(&self, key: &[u8]) -> Result<bool> {
        if key.len() != self.key_len as usize {
            return Ok(false);
        }
        let _guard = self.control().acquire_writer();
        self.enter_write()?;
        let done = self.erase_locked(key)?;
        self.leave_write();
        Ok(done)
    }

    /// Applies records from `source` until the first failure; returns how
    /// many were applied.
    pub fn batch_update(&self, source: &mut dyn Source) -> Result<usize> {
        let total = source.total();
        if total == 0 {
            return Ok(0);
        }
        source.reset();
        let _guard = self.control().acquire_writer();
        self.enter_write()?;
        let mut applied = 0usize;
        for _ in 0..total {
            let rec = source.read();
            if rec.key.len() != self.key_len as usize
                || rec.val.len() != self.val_len as usize
                || !self.update_locked(rec.key, rec.val)?
            {
                break;
            }
            applied += 1;
        }
        self.leave_write();
        Ok(applied)
    }

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

    fn update_locked(&self, key: &[u8], val: &[u8]) -> Result<bool> {
        let h = self.header();
        consistency_check(h.free_head.load(Ordering::Relaxed) != END)?;
        let klen = key.len();
        let vlen = val.len();
        let ent = self.total_entry.rem(hash(self.seed, key));

        let mut link: &AtomicU32 = self.table_at(ent);
        loop {
            let idx = link.load(Ordering::Relaxed);
            if idx == END {
                break;
            }
            let p = self.node_ptr(idx);
            if keys_equal(unsafe { p.add(4) }, key) {
                let stored = unsafe { slice::from_raw_parts(p.add(4 + klen), vlen) };
                if stored != val {
                    let (id, neo) = self.take_free_node(key, val);
                    unsafe {
                        ptr::write(
                            neo as *mut u32,
                            self.node_next(idx).load(Ordering::Relaxed),
                        );
                    }
                    link.store(id, Ordering::Release);
                    self.push_recycle(idx)?;
                }
                return Ok(true);
            }
            link = self.node_next(idx);
        }

        if self.item() >= self.capacity {
            return Ok(false);
        }
        let (id, neo) = self.take_free_node(key, val);
        unsafe {
            ptr::write(
                neo as *mut u32,
                self.table_at(ent).load(Ordering::Relaxed),
            );
        }
        self.table_at(ent).store(id, Ordering::Release);
        h.item.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn erase_locked(&self, key: &[u8]) -> Result<bool> {
        let ent = self.total_entry.rem(hash(self.seed, key));
        let mut link: &AtomicU32 = self.table_at(ent);
        loop {
            let idx = link.load(Ordering::Relaxed);
            if idx == END {
                return Ok(false);
            }
            let p = self.node_ptr(idx);
            if keys_equal(unsafe { p.add(4) }, key) {
                link.store(self.node_next(idx).load(Ordering::Relaxed), Ordering::Release);
                self.push_recycle(idx)?;
                self.header().item.fetch_sub(1, Ordering::Relaxed);
                return Ok(true);
            }
            link = self.node_next(idx);
        }
    }

    /// Unlinks the head of the free list and fills it with `key`/`val`. The
    /// node was recycled at least one grace period ago, so no reader can
    /// still be looking at it.
    fn take_free_node(&self, key: &[u8], val: &[u8]) -> (u32, *mut u8) {
        let h = self.header();
        let id = h.free_head.load(Ordering::Relaxed);
        debug_assert_ne!(id, END);
        let p = self.node_ptr(id);
        let next_free = self.node_free(id);
        h.free_head.store(next_free, Ordering::Relaxed);
        if next_free == END {
            h.free_tail.store(END, Ordering::Relaxed);
        }
        unsafe {
            ptr::copy_nonoverlapping(key.as_ptr(), p.add(4), key.len());
            ptr::copy_nonoverlapping(val.as_ptr(), p.add(4 + key.len()), val.len());
        }
        (id, p)
    }

    /// Parks a victim node in the recycle ring; when the ring is full, the
    /// oldest bin is flushed to the free list after its grace period.
    fn push_recycle(&self, vic: u32) -> Result<()> {
        debug_assert_ne!(vic, END);
        let h = self.header();
        let w = u32::from(h.recycle_write.load(Ordering::Relaxed));
        let r = u32::from(h.recycle_read.load(Ordering::Relaxed));

        if (w + 1) % RECYCLE_CAPACITY == r {
            let stamp = unsafe { *self.stamps.add((r / RECYCLE_BIN_SIZE) as usize) };
            let now = now_millis();
            consistency_check(now >= stamp)?;
            let wait = RECYCLE_DELAY_MS - (now - stamp);
            if wait > 0 {
                std::thread::sleep(Duration::from_millis(wait as u64));
            }
            consistency_check(r % RECYCLE_BIN_SIZE == 0)?;
            let begin = r;
            let end = begin + RECYCLE_BIN_SIZE;
            h.recycle_read
                .store((end % RECYCLE_CAPACITY) as u16, Ordering::Relaxed);

            let mut first = END;
            let mut tail = END;
            for i in begin..end {
                let node = unsafe { *self.recycle.add(i as usize) };
                debug_assert_ne!(node, END);
                unsafe { *self.recycle.add(i as usize) = END };
                if tail == END {
                    first = node;
                } else {
                    self.set_node_free(tail, node);
                }
                self.node_next(node).store(END, Ordering::Relaxed);
                tail = node;
            }
            self.set_node_free(tail, END);

            let free_tail = h.free_tail.load(Ordering::Relaxed);
            if free_tail == END {
                debug_assert_eq!(h.free_head.load(Ordering::Relaxed), END);
                h.free_head.store(first, Ordering::Relaxed);
            } else {
                self.set_node_free(free_tail, first);
            }
            h.free_tail.store(tail, Ordering::Relaxed);
        }

        let bin = (w / RECYCLE_BIN_SIZE) as usize;
        unsafe { *self.recycle.add(w as usize) = vic };
        let w = (w + 1) % RECYCLE_CAPACITY;
        h.recycle_write.store(w as u16, Ordering::Relaxed);
        if w % RECYCLE_BIN_SIZE == 0 {
            // The bin just filled; its grace period starts now.
            unsafe { *self.stamps.add(bin) = now_millis() };
        }
        Ok(())
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
    fn table_at(&self, ent: u64) -> &AtomicU32 {
        debug_assert!(ent < self.total_entry.value());
        unsafe { &*self.table.add(ent as usize) }
    }

    #[inline]
    fn node_ptr(&self, idx: u32) -> *mut u8 {
        unsafe { self.data.add(idx as usize * self.item_size as usize) }
    }

    #[inline]
    fn node_next(&self, idx: u32) -> &AtomicU32 {
        unsafe { &*(self.node_ptr(idx) as *const AtomicU32) }
    }

    /// Free-list link, overlaying the first four key bytes of a parked node.
    #[inline]
    fn node_free(&self, idx: u32) -> u32 {
        unsafe { ptr::read(self.node_ptr(idx).add(4) as *const u32) }
    }

    #[inline]
    fn set_node_free(&self, idx: u32, free: u32) {
        unsafe { ptr::write(self.node_ptr(idx).add(4) as *mut u32, free) };
    }
}

impl Drop for FixedDict {
    fn drop(&mut self) {
        if self.shared {
            self.control().release_ref();
        }
    }
}

/// One in-flight probe of the batch-fetch pipeline. `node == None` means the
/// lane still has to read its table slot.
#[derive(Clone, Copy)]
struct Lane {
    idx: usize,
    ent: u64,
    node: Option<u32>,
}

#[inline]
fn keys_equal(stored: *const u8, key: &[u8]) -> bool {
    unsafe {
        if key.len() == 8 {
            ptr::read_unaligned(stored as *const u64)
                == ptr::read_unaligned(key.as_ptr() as *const u64)
        } else {
            slice::from_raw_parts(stored, key.len()) == key
        }
    }
}

fn seed_from_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9e37_79b9_7f4a_7c15)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Record;
    use tempfile::TempDir;

    fn config() -> FixedConfig {
        FixedConfig {
            entry: MIN_CAPACITY,
            capacity: MIN_CAPACITY,
            key_len: 8,
            val_len: 4,
            concurrency: 1,
        }
    }

    struct PairSource {
        pairs: Vec<([u8; 8], [u8; 4])>,
        at: usize,
    }

    impl PairSource {
        fn new(pairs: Vec<([u8; 8], [u8; 4])>) -> Self {
            Self { pairs, at: 0 }
        }
    }

    impl Source for PairSource {
        fn reset(&mut self) {
            self.at = 0;
        }

        fn total(&self) -> usize {
            self.pairs.len()
        }

        fn read(&mut self) -> Record<'_> {
            let (key, val) = &self.pairs[self.at];
            self.at += 1;
            Record { key, val }
        }
    }

    #[test]
    fn create_rejects_bad_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.fixed");
        let bad = [
            FixedConfig {
                capacity: MIN_CAPACITY - 1,
                ..config()
            },
            FixedConfig {
                entry: 0,
                ..config()
            },
            FixedConfig {
                entry: MIN_CAPACITY / 4,
                ..config()
            },
            FixedConfig {
                key_len: 0,
                ..config()
            },
            FixedConfig {
                key_len: 256,
                ..config()
            },
            FixedConfig {
                val_len: MAX_VAL_LEN + 1,
                ..config()
            },
        ];
        for c in &bad {
            assert!(matches!(
                FixedDict::create(&path, c, None),
                Err(Error::BadArguments)
            ));
        }
    }

    #[test]
    fn update_fetch_erase() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("basic.fixed");
        FixedDict::create(&path, &config(), None).unwrap();
        let dict = FixedDict::load(&path, LoadPolicy::Monopoly).unwrap();
        assert_eq!(dict.key_len(), 8);
        assert_eq!(dict.val_len(), 4);
        assert_eq!(dict.item(), 0);

        for i in 0..5000u64 {
            assert!(dict
                .update(&i.to_le_bytes(), &(i as u32).to_le_bytes())
                .unwrap());
        }
        assert_eq!(dict.item(), 5000);

        let mut out = [0u8; 4];
        for i in 0..5000u64 {
            assert!(dict.fetch_into(&i.to_le_bytes(), &mut out));
            assert_eq!(u32::from_le_bytes(out), i as u32);
        }
        assert!(!dict.fetch_into(&u64::MAX.to_le_bytes(), &mut out));

        // Overwrites replace, erases unlink.
        assert!(dict.update(&7u64.to_le_bytes(), &99u32.to_le_bytes()).unwrap());
        assert_eq!(dict.fetch(&7u64.to_le_bytes()).unwrap(), 99u32.to_le_bytes());
        assert_eq!(dict.item(), 5000);
        assert!(dict.erase(&7u64.to_le_bytes()).unwrap());
        assert!(!dict.erase(&7u64.to_le_bytes()).unwrap());
        assert!(dict.fetch(&7u64.to_le_bytes()).is_none());
        assert_eq!(dict.item(), 4999);
    }

    #[test]
    fn rejects_wrong_shapes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shape.fixed");
        FixedDict::create(&path, &config(), None).unwrap();
        let dict = FixedDict::load(&path, LoadPolicy::Monopoly).unwrap();

        assert!(!dict.update(b"short", b"vvvv").unwrap());
        assert!(!dict.update(b"exactly8", b"toolong").unwrap());
        assert!(!dict.erase(b"short").unwrap());
        let mut out = [0u8; 4];
        assert!(!dict.fetch_into(b"short", &mut out));
    }

    #[test]
    fn bulk_create_dedups_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bulk.fixed");
        let mut pairs = Vec::new();
        for i in 0..1000u64 {
            pairs.push((i.to_le_bytes(), (i as u32).to_le_bytes()));
        }
        // Rewrites of the first hundred keys; the last value must win.
        for i in 0..100u64 {
            pairs.push((i.to_le_bytes(), (i as u32 + 7000).to_le_bytes()));
        }
        let mut source = PairSource::new(pairs);
        FixedDict::create(&path, &config(), Some(&mut source)).unwrap();

        let dict = FixedDict::load(&path, LoadPolicy::Monopoly).unwrap();
        assert_eq!(dict.item(), 1000);
        for i in 0..100u64 {
            assert_eq!(
                dict.fetch(&i.to_le_bytes()).unwrap(),
                (i as u32 + 7000).to_le_bytes()
            );
        }
        for i in 100..1000u64 {
            assert_eq!(dict.fetch(&i.to_le_bytes()).unwrap(), (i as u32).to_le_bytes());
        }
    }

    #[test]
    fn batch_fetch_matches_serial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch.fixed");
        FixedDict::create(&path, &config(), None).unwrap();
        let dict = FixedDict::load(&path, LoadPolicy::Monopoly).unwrap();
        for i in 0..2000u64 {
            assert!(dict
                .update(&i.to_le_bytes(), &(i as u32).to_le_bytes())
                .unwrap());
        }

        // Every third key misses.
        let mut keys = Vec::new();
        let mut expect_hits = 0usize;
        let n = 300u64;
        for i in 0..n {
            let key = if i % 3 == 0 { 1_000_000 + i } else { i };
            if i % 3 != 0 {
                expect_hits += 1;
            }
            keys.extend_from_slice(&key.to_le_bytes());
        }
        let mut out = vec![0xffu8; n as usize * 4];
        let hits = dict.batch_fetch(&keys, &mut out, Some(&0u32.to_le_bytes()));
        assert_eq!(hits, expect_hits);
        for i in 0..n {
            let got = u32::from_le_bytes(out[i as usize * 4..][..4].try_into().unwrap());
            if i % 3 == 0 {
                assert_eq!(got, 0, "miss {i} must take the default");
            } else {
                assert_eq!(got, i as u32, "hit {i}");
            }
        }

        // Without a default, missing slots keep their previous bytes.
        let mut out = vec![0xabu8; n as usize * 4];
        dict.batch_fetch(&keys, &mut out, None);
        assert_eq!(&out[0..4], &[0xab; 4]);
    }

    #[test]
    fn batch_update_applies_until_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch-up.fixed");
        FixedDict::create(&path, &config(), None).unwrap();
        let dict = FixedDict::load(&path, LoadPolicy::Monopoly).unwrap();

        let pairs = (0..500u64)
            .map(|i| (i.to_le_bytes(), (i as u32 * 2).to_le_bytes()))
            .collect();
        let mut source = PairSource::new(pairs);
        assert_eq!(dict.batch_update(&mut source).unwrap(), 500);
        assert_eq!(dict.item(), 500);
        assert_eq!(dict.fetch(&3u64.to_le_bytes()).unwrap(), 6u32.to_le_bytes());
    }

    #[test]
    fn zero_length_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zero.fixed");
        let c = FixedConfig {
            val_len: 0,
            ..config()
        };
        FixedDict::create(&path, &c, None).unwrap();
        let dict = FixedDict::load(&path, LoadPolicy::Monopoly).unwrap();

        // A value-less dictionary is a set.
        assert!(dict.update(&1u64.to_le_bytes(), b"").unwrap());
        assert!(dict.fetch_into(&1u64.to_le_bytes(), &mut []));
        assert!(!dict.fetch_into(&2u64.to_le_bytes(), &mut []));
        assert!(dict.erase(&1u64.to_le_bytes()).unwrap());
        assert!(!dict.fetch_into(&1u64.to_le_bytes(), &mut []));
    }

    #[test]
    fn overwrite_with_identical_value_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("noop.fixed");
        FixedDict::create(&path, &config(), None).unwrap();
        let dict = FixedDict::load(&path, LoadPolicy::Monopoly).unwrap();

        assert!(dict.update(&1u64.to_le_bytes(), &5u32.to_le_bytes()).unwrap());
        let head_before = dict.header().free_head.load(Ordering::Relaxed);
        assert!(dict.update(&1u64.to_le_bytes(), &5u32.to_le_bytes()).unwrap());
        // No node was consumed.
        assert_eq!(dict.header().free_head.load(Ordering::Relaxed), head_before);
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, vec![0u8; 1 << 20]).unwrap();
        assert!(matches!(
            FixedDict::load(&path, LoadPolicy::Monopoly),
            Err(Error::BrokenFile(_))
        ));
    }
}
