//! Byte-source abstraction.
//!
//! The format core reads image files through the `Storage` trait: a
//! positional, thread-safe byte source with no seek state.  [`crate::file`]
//! implements it for OS files, [`crate::memory`] for in-memory buffers.

use crate::{Error, Result};
use std::fmt::{Debug, Display};
use std::io;
use std::path::{Path, PathBuf};

/// Describes what [`Storage::open()`] should open.
#[derive(Clone, Debug, Default)]
pub struct StorageOpenOptions {
    /// Path of the file to open.
    pub(crate) filename: Option<PathBuf>,
}

impl StorageOpenOptions {
    /// Start with an empty set of options.
    pub fn new() -> Self {
        StorageOpenOptions::default()
    }

    /// Name the file to open.
    pub fn filename<P: AsRef<Path>>(mut self, filename: P) -> Self {
        self.filename = Some(filename.as_ref().to_path_buf());
        self
    }
}

/// Identity of an opened storage object.
///
/// Used to reject loops when following a backing-file chain: two storage
/// objects with equal identities refer to the same underlying file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StorageIdentity {
    /// Device and inode numbers.
    #[cfg(unix)]
    DevIno(u64, u64),

    /// Canonicalized path.
    Path(PathBuf),
}

/// A byte source an image file can be read from.
///
/// The format core asks for very little: a length query and positional
/// reads, with no seek state.  `read_at()` may be called from several
/// threads at once, so implementations must be safe under concurrent
/// positional access.
pub trait Storage: Debug + Display + Send + Sized + Sync {
    /// Construct a storage object from open options.
    ///
    /// Only meaningful for file-like implementations; the default refuses.
    fn open(_opts: StorageOpenOptions) -> Result<Self> {
        Err(Error::io_at(
            0,
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!(
                    "cannot open storage objects of type {}",
                    std::any::type_name::<Self>()
                ),
            ),
        ))
    }

    /// Total length of the byte source, in bytes.
    fn size(&self) -> Result<u64>;

    /// Read into `buf` from `offset`, returning the number of bytes read.
    ///
    /// Short reads are permitted only at end of file; a read starting at or
    /// beyond end of file returns 0.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Turn a backing filename into a path that can be opened.
    ///
    /// Absolute paths pass through unchanged; relative ones are anchored
    /// wherever this storage object lives.  The result must never be
    /// relative.
    fn resolve_relative_path<P: AsRef<Path>>(&self, _relative: P) -> Result<PathBuf> {
        Err(Error::io_at(0, io::ErrorKind::Unsupported.into()))
    }

    /// Identity of the underlying file, if it has one.
    ///
    /// Storage without a stable identity (e.g. memory buffers) returns
    /// `None`, which disables backing-loop detection.
    fn identity(&self) -> Option<StorageIdentity> {
        None
    }
}

/// Helpers on top of the raw positional-read contract.
pub trait StorageExt: Storage {
    /// Fill `buf` completely from `offset`.
    ///
    /// Reaching end of file before `buf` is full is an error.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let pos = offset + filled as u64;
            let n = self.read_at(&mut buf[filled..], pos)?;
            if n == 0 {
                return Err(Error::io_at(pos, io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }
        Ok(())
    }
}

impl<S: Storage> StorageExt for S {}
