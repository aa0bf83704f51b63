use std::io;
use std::path::PathBuf;

/// The error type for dictionary creation, loading and mutation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A configuration value is outside its documented range.
    #[error("bad arguments")]
    BadArguments,

    /// The requested capacity does not fit the on-disk address space.
    #[error("too big")]
    TooBig,

    /// The file exists but its header, size or magic do not describe a
    /// dictionary this library can open.
    #[error("broken file: {}", .0.display())]
    BrokenFile(PathBuf),

    /// The writing flag was still set when the file was opened, meaning a
    /// previous writer crashed mid-operation.
    #[error("file is not saved correctly: {}", .0.display())]
    NotSavedCorrectly(PathBuf),

    /// The shared-mode reference count is exhausted.
    #[error("too many references")]
    TooManyReferences,

    /// A bulk-load source produced more data than the planned slab holds.
    #[error("out of data capacity")]
    OutOfCapacity,

    /// The in-memory state failed a structural check. The mapping should be
    /// discarded and the file rebuilt from its source of truth.
    #[error("broken data")]
    Corruption,

    /// An operating system call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Structural invariant check on shared state.
///
/// Compiled to a no-op unless the `consistency-check` feature is enabled.
#[inline(always)]
pub(crate) fn consistency_check(condition: bool) -> Result<()> {
    if cfg!(feature = "consistency-check") && !condition {
        return Err(Error::Corruption);
    }
    Ok(())
}
