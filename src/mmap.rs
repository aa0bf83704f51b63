//! The mapped region backing a dictionary.
//!
//! A `MemMap` is either a shared file-backed mapping (the file *is* the
//! dictionary, `msync` semantics apply) or an anonymous private mapping
//! filled from a file once (`CopyData` loads). File-backed mappings hold an
//! advisory lock on the backing file for as long as they live: shared for
//! multi-process readers, exclusive for a private opener.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};

use crate::error::Result;

/// Preferred hugepage size exponent for anonymous copy loads (2 MiB).
#[cfg(target_os = "linux")]
const HUGE_PAGE_BITS: u8 = 21;

pub(crate) struct MemMap {
    map: MmapMut,
    // Kept open so the advisory lock lives as long as the mapping.
    _file: Option<File>,
}

impl MemMap {
    /// Creates (or truncates) `path` at `size` bytes and maps it shared.
    ///
    /// The file is locked exclusively for the lifetime of the mapping.
    pub(crate) fn create(path: &Path, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(std::io::Error::from)?;
        file.set_len(0)?;
        file.set_len(size)?;
        let map = unsafe { MmapOptions::new().len(size as usize).map_mut(&file)? };
        Ok(Self {
            map,
            _file: Some(file),
        })
    }

    /// Maps an existing file shared, read-write.
    ///
    /// `exclusive` chooses between an exclusive advisory lock (private
    /// opener) and a shared one (cooperating processes). `populate` asks the
    /// kernel to fault the whole file in up front.
    pub(crate) fn open(path: &Path, exclusive: bool, populate: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if exclusive {
            file.try_lock_exclusive().map_err(std::io::Error::from)?;
        } else {
            file.try_lock_shared().map_err(std::io::Error::from)?;
        }
        let len = file.metadata()?.len();
        let mut options = MmapOptions::new();
        options.len(len as usize);
        if populate {
            options.populate();
        }
        let map = unsafe { options.map_mut(&file)? };
        Ok(Self {
            map,
            _file: Some(file),
        })
    }

    /// Reads `path` into a fresh anonymous mapping and drops the file.
    ///
    /// Prefers hugepages and falls back to normal pages when the system has
    /// none to give.
    pub(crate) fn open_copy(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.try_lock_exclusive().map_err(std::io::Error::from)?;
        let len = file.metadata()?.len();
        let mut this = Self::anonymous(len)?;
        let mut read = 0usize;
        while read < len as usize {
            let n = read_at(&file, &mut this.map[read..], read as u64)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            read += n;
        }
        Ok(this)
    }

    /// An anonymous mapping of `size` bytes, filled by `fill`.
    pub(crate) fn anonymous_with(
        size: u64,
        fill: impl FnOnce(&mut [u8]) -> Result<()>,
    ) -> Result<Self> {
        let mut this = Self::anonymous(size)?;
        fill(&mut this.map)?;
        Ok(this)
    }

    #[cfg(target_os = "linux")]
    fn anonymous(size: u64) -> Result<Self> {
        let map = match MmapOptions::new()
            .len(size as usize)
            .huge(Some(HUGE_PAGE_BITS))
            .map_anon()
        {
            Ok(map) => map,
            Err(err) => {
                log::debug!("hugepage mapping unavailable ({err}), using normal pages");
                MmapOptions::new().len(size as usize).map_anon()?
            }
        };
        Ok(Self { map, _file: None })
    }

    #[cfg(not(target_os = "linux"))]
    fn anonymous(size: u64) -> Result<Self> {
        let map = MmapOptions::new().len(size as usize).map_anon()?;
        Ok(Self { map, _file: None })
    }

    /// Grows the backing file to `new_len` and remaps it, keeping the
    /// advisory lock held throughout. Only valid for file-backed mappings.
    pub(crate) fn grow(self, new_len: u64) -> Result<Self> {
        let Self { map, _file } = self;
        let file = _file.expect("grow on an anonymous mapping");
        drop(map);
        file.set_len(new_len)?;
        let map = unsafe { MmapOptions::new().len(new_len as usize).map_mut(&file)? };
        Ok(Self {
            map,
            _file: Some(file),
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.map.len() as u64
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    /// Writes the whole region to a fresh file at `path`.
    pub(crate) fn dump(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&self.map)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt as _;
    file.read_at(buf, offset)
}
