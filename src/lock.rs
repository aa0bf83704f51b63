//! The control block shared by every opener of a dictionary.
//!
//! One cache line inside the mapped region (or on the heap for a private
//! opener, whose file lock already excludes other processes) holding the
//! writer mutex, the sweep flag readers poll, and the shared-mode reference
//! count. Readers never touch the mutex; writer exclusion is the only
//! blocking synchronization in the library.

use std::sync::atomic::{fence, AtomicU32, Ordering};

use crossbeam_utils::Backoff;

use crate::error::{Error, Result};

/// Upper bound on concurrent shared-mode openers.
const MAX_REFS: u32 = u16::MAX as u32;

#[repr(C)]
pub(crate) struct ControlBlock {
    writer: AtomicU32,
    refs: AtomicU32,
    sweeping: AtomicU32,
    _pad: [u8; 52],
}

// One cache line; the struct layout is part of the file format.
const _: () = assert!(std::mem::size_of::<ControlBlock>() == 64);

impl ControlBlock {
    /// Byte size of the block inside the region layout.
    pub(crate) const SIZE: u64 = 64;

    pub(crate) fn new() -> Self {
        Self {
            writer: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            sweeping: AtomicU32::new(0),
            _pad: [0; 52],
        }
    }

    /// Acquires the writer mutex, spinning with backoff.
    ///
    /// Test-and-test-and-set: spin on a plain load so waiters stay in their
    /// own cache line copy, then attempt the exchange.
    pub(crate) fn acquire_writer(&self) -> WriterGuard<'_> {
        let backoff = Backoff::new();
        loop {
            while self.writer.load(Ordering::Relaxed) != 0 {
                backoff.snooze();
            }
            if self
                .writer
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return WriterGuard { block: self };
            }
            backoff.spin();
        }
    }

    /// True while a sweep is rearranging the entry table.
    #[inline(always)]
    pub(crate) fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Relaxed) != 0
    }

    /// Raises the sweep flag. Full fence: every table mutation the sweep is
    /// about to make must be seen after the flag.
    pub(crate) fn begin_sweep(&self) {
        self.sweeping.store(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Clears the sweep flag after yielding once, giving in-flight readers a
    /// window to observe it and retry.
    pub(crate) fn end_sweep(&self) {
        std::thread::yield_now();
        fence(Ordering::SeqCst);
        self.sweeping.store(0, Ordering::Relaxed);
    }

    /// Registers one shared-mode opener.
    pub(crate) fn acquire_ref(&self) -> Result<()> {
        let mut refs = self.refs.load(Ordering::Relaxed);
        loop {
            if refs >= MAX_REFS {
                return Err(Error::TooManyReferences);
            }
            match self.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(seen) => refs = seen,
            }
        }
    }

    pub(crate) fn release_ref(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct WriterGuard<'a> {
    block: &'a ControlBlock,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.block.writer.store(0, Ordering::Release);
    }
}
