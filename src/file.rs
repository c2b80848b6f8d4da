//! Storage backed by an ordinary OS file.

use crate::storage::{Storage, StorageIdentity, StorageOpenOptions};
use crate::{Error, Result};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::{FileExt, MetadataExt};
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::path::{Path, PathBuf};

/// An ordinary OS file serving positional reads.
#[derive(Debug)]
pub struct File {
    /// Underlying OS file.
    file: fs::File,

    /// Remembered for display output and for anchoring relative backing
    /// paths.
    filename: Option<PathBuf>,

    /// File length, cached at open.
    size: u64,
}

impl File {
    /// Open the file at `path` read-only.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|err| Error::io_at(0, err))?;
        let size = file.metadata().map_err(|err| Error::io_at(0, err))?.len();

        Ok(File {
            file,
            filename: Some(path.to_path_buf()),
            size,
        })
    }
}

impl TryFrom<fs::File> for File {
    type Error = Error;

    /// Wrap an already opened `std::fs::File`.
    ///
    /// The resulting object does not know its own filename, so relative
    /// backing filenames cannot be resolved against it.
    fn try_from(file: fs::File) -> Result<Self> {
        let size = file.metadata().map_err(|err| Error::io_at(0, err))?.len();
        Ok(File {
            file,
            filename: None,
            size,
        })
    }
}

impl Storage for File {
    fn open(opts: StorageOpenOptions) -> Result<Self> {
        let Some(filename) = opts.filename else {
            return Err(Error::io_at(
                0,
                io::Error::new(io::ErrorKind::InvalidInput, "no filename specified"),
            ));
        };
        Self::open_path(filename)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        FileExt::read_at(&self.file, buf, offset).map_err(|err| Error::io_at(offset, err))
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.file
            .seek_read(buf, offset)
            .map_err(|err| Error::io_at(offset, err))
    }

    fn resolve_relative_path<P: AsRef<Path>>(&self, relative: P) -> Result<PathBuf> {
        let relative = relative.as_ref();
        if relative.is_absolute() {
            return Ok(relative.to_path_buf());
        }

        let Some(filename) = self.filename.as_ref() else {
            return Err(Error::io_at(
                0,
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    "cannot resolve relative paths against an anonymous file",
                ),
            ));
        };

        let dirname = filename.parent().unwrap_or(Path::new("."));
        Ok(dirname.join(relative))
    }

    #[cfg(unix)]
    fn identity(&self) -> Option<StorageIdentity> {
        let metadata = self.file.metadata().ok()?;
        Some(StorageIdentity::DevIno(metadata.dev(), metadata.ino()))
    }

    #[cfg(not(unix))]
    fn identity(&self) -> Option<StorageIdentity> {
        let filename = self.filename.as_ref()?;
        Some(StorageIdentity::Path(filename.canonicalize().ok()?))
    }
}

impl Display for File {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(filename) = self.filename.as_ref() {
            write!(f, "file:{}", filename.display())
        } else {
            write!(f, "file:<anonymous>")
        }
    }
}
