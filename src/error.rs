//! Error type returned by all fallible operations.

use std::io;
use thiserror::Error;

/// Errors reported while opening or reading a QCOW image.
#[derive(Debug, Error)]
pub enum Error {
    /// The file does not begin with the QCOW magic bytes.
    #[error("not a QCOW image (bad signature)")]
    InvalidSignature,

    /// The format version, an incompatible feature bit, or an encryption
    /// scheme is not supported by this implementation.
    #[error("unsupported image: {0}")]
    UnsupportedVersion(String),

    /// A header field violates a documented constraint.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// An L1, L2, or snapshot table entry is inconsistent (unaligned,
    /// out of bounds, or with reserved bits set).
    #[error("corrupt table: {0}")]
    CorruptTable(String),

    /// A read was attempted against an encrypted image with no key set.
    #[error("image is encrypted and no key has been set")]
    EncryptionRequired,

    /// The configured key material is structurally impossible.
    #[error("invalid decryption key: {0}")]
    InvalidKey(String),

    /// A compressed cluster could not be inflated.
    #[error("cluster decompression failed: {0}")]
    DecompressionFailed(String),

    /// A byte-source operation failed.
    #[error("I/O error at offset {offset:#x}: {source}")]
    Io {
        /// File offset of the failed access.
        offset: u64,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// An offset lies beyond the end of the media.
    #[error("offset beyond end of media")]
    OutOfRange,

    /// The abort flag was observed during a read.
    #[error("read aborted")]
    Cancelled,
}

/// Result alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an `io::Error` with the file offset of the failed access.
    pub(crate) fn io_at(offset: u64, source: io::Error) -> Self {
        Error::Io { offset, source }
    }
}
