#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! Read-only access to QEMU copy-on-write (QCOW) disk images.
//!
//! Supports format versions 1, 2, and 3, including compressed clusters,
//! AES-encrypted images, backing-file chains, and snapshot metadata.  Write
//! support is out of scope.
//!
//! Simple example:
//! ```no_run
//! use qcow::{File, Qcow};
//!
//! # fn main() -> qcow::Result<()> {
//! let mut image = Qcow::<File>::open_path("image.qcow2")?;
//! image.open_implicit_backing()?;
//!
//! let mut first_sector = vec![0u8; 512];
//! image.read_at(&mut first_sector, 0)?;
//! # Ok(())
//! # }
//! ```
//!
//! Storage is pluggable: anything implementing [`Storage`] can back an
//! image, e.g. [`Memory`] for images held in a byte buffer:
//! ```no_run
//! use qcow::{Memory, Qcow};
//!
//! # fn main() -> qcow::Result<()> {
//! # let image_bytes = Vec::new();
//! let image = Qcow::open_image(Memory::new(image_bytes))?;
//! println!("media size: {}", image.media_size());
//! # Ok(())
//! # }
//! ```
//!
//! A single image supports any number of concurrent readers; open and
//! configuration (`set_password()`, `set_backing()`, ...) take `&mut self`
//! and happen before the image is shared.

mod crypto;
mod error;
pub mod file;
mod lru_cache;
pub mod memory;
pub mod qcow;
pub mod storage;

pub use error::{Error, Result};
pub use file::File;
pub use memory::Memory;
pub use qcow::{EncryptionMethod, FormatVersion, MediaReader, OpenOptions, Qcow, Snapshot};
pub use storage::{Storage, StorageExt, StorageIdentity, StorageOpenOptions};
