//! QCOW image access.
//!
//! [`Qcow`] opens a QCOW image (version 1, 2, or 3) over any
//! [`Storage`] object and serves random reads against the media view,
//! resolving clusters through the image's L1/L2 tables, decompressing and
//! decrypting as needed, and deferring unallocated ranges to an optional
//! backing image.

mod cache;
mod compressed;
mod mappings;
mod metadata;
mod read;
mod snapshot;
mod types;

pub use metadata::{EncryptionMethod, FormatVersion};
pub use read::MediaReader;
pub use snapshot::Snapshot;

use crate::crypto::SectorCipher;
use crate::lru_cache::LruCache;
use crate::storage::{StorageExt, StorageIdentity, StorageOpenOptions};
use crate::{Error, Result, Storage};
use cache::{ClusterCacheBackend, L2CacheBackend};
use metadata::{Header, L1Table, Table};
use parking_lot::RwLock;
use std::fmt::{self, Debug, Display, Formatter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Configuration for opening images.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    /// Number of L2 tables to cache.
    l2_cache_size: usize,

    /// Number of decoded data clusters to cache.
    cluster_cache_size: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            l2_cache_size: 8,
            cluster_cache_size: 16,
        }
    }
}

impl OpenOptions {
    /// Start from the default cache sizes.
    pub fn new() -> Self {
        OpenOptions::default()
    }

    /// Set the number of L2 tables to cache.
    pub fn l2_cache_size(mut self, entries: usize) -> Self {
        self.l2_cache_size = entries;
        self
    }

    /// Set the number of decoded data clusters to cache.
    pub fn cluster_cache_size(mut self, entries: usize) -> Self {
        self.cluster_cache_size = entries;
        self
    }

    /// Open a QCOW image over the given storage object.
    pub fn open<S: Storage>(self, storage: S) -> Result<Qcow<S>> {
        Qcow::open_with(storage, self)
    }

    /// Open the QCOW image at the given path.
    pub fn open_path<S: Storage, P: AsRef<Path>>(self, path: P) -> Result<Qcow<S>> {
        let storage = S::open(StorageOpenOptions::new().filename(path))?;
        self.open(storage)
    }
}

/// Access QCOW images.
///
/// Opening parses and validates all metadata (header, L1 table, snapshot
/// directory); reads then resolve clusters on demand through two bounded
/// caches.  A `Qcow` is immutable after configuration, so any number of
/// threads may call [`Qcow::read_at()`] concurrently.
pub struct Qcow<S: Storage> {
    /// Image file.
    storage: Arc<S>,

    /// Image file length, cached at open.
    file_size: u64,

    /// Image header.
    header: Arc<Header>,

    /// L1 table; immutable for the life of the image.
    l1_table: L1Table,

    /// Snapshot directory (v2/v3); metadata only.
    snapshots: Vec<Snapshot>,

    /// Recently used L2 tables.
    l2_cache: LruCache<L2CacheBackend<S>>,

    /// Decoded data cluster cache.
    cluster_cache: LruCache<ClusterCacheBackend<S>>,

    /// Cipher context, set via [`Qcow::set_password()`] or
    /// [`Qcow::set_keys()`].
    cipher: Arc<RwLock<Option<SectorCipher>>>,

    /// Backing image consulted for unallocated clusters.
    backing: Option<Arc<Qcow<S>>>,

    /// Whether the backing image was assigned (or resolved implicitly).
    backing_set: bool,

    /// Options this image was opened with; reused for implicit backing
    /// images.
    options: OpenOptions,

    /// Cooperative cancellation flag, polled by in-progress reads.
    abort: AtomicBool,
}

impl<S: Storage> Qcow<S> {
    /// Open a QCOW image over the given storage object with default
    /// options.
    ///
    /// This does not open the backing image named in the header; call
    /// [`Qcow::open_implicit_backing()`] for that, or assign one explicitly
    /// via [`Qcow::set_backing()`].
    pub fn open_image(storage: S) -> Result<Self> {
        OpenOptions::new().open(storage)
    }

    /// Open the QCOW image at the given path with default options.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        OpenOptions::new().open_path(path)
    }

    /// Check whether the given storage object looks like a QCOW image.
    ///
    /// Only inspects the signature; [`OpenOptions::open()`] performs full
    /// validation.
    pub fn probe(storage: &S) -> Result<()> {
        let mut magic = [0u8; 4];
        storage.read_exact_at(&mut magic, 0)?;
        if magic != *b"QFI\xfb" {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }

    /// Open a QCOW image, taking configuration from `options`.
    fn open_with(storage: S, options: OpenOptions) -> Result<Self> {
        let file_size = storage.size()?;
        let header = Arc::new(Header::load(&storage)?);

        let l1_table = L1Table::load(
            &storage,
            header.l1_table_offset(),
            header.l1_table_entries(),
        )?;
        let snapshots = snapshot::load_snapshots(&storage, &header)?;

        debug!(
            version = header.version().as_u32(),
            cluster_bits = header.cluster_bits(),
            media_size = header.size(),
            snapshots = snapshots.len(),
            "opened qcow image"
        );

        let storage = Arc::new(storage);
        let cipher = Arc::new(RwLock::new(None));

        let l2_cache = LruCache::new(
            L2CacheBackend::new(Arc::clone(&storage), Arc::clone(&header)),
            options.l2_cache_size,
        );
        let cluster_cache = LruCache::new(
            ClusterCacheBackend::new(
                Arc::clone(&storage),
                Arc::clone(&header),
                Arc::clone(&cipher),
                file_size,
            ),
            options.cluster_cache_size,
        );

        Ok(Qcow {
            storage,
            file_size,
            header,
            l1_table,
            snapshots,
            l2_cache,
            cluster_cache,
            cipher,
            backing: None,
            backing_set: false,
            options,
            abort: AtomicBool::new(false),
        })
    }

    /// Open the backing image named in the header, recursively.
    ///
    /// Backing filenames are resolved relative to this image's file.  Does
    /// nothing if a backing image has already been assigned via
    /// [`Qcow::set_backing()`].  Chains that loop back onto an already
    /// opened file are rejected.
    pub fn open_implicit_backing(&mut self) -> Result<()> {
        let mut seen = Vec::new();
        if let Some(id) = self.storage.identity() {
            seen.push(id);
        }
        self.open_backing_chain(&mut seen)
    }

    /// Recursive worker for [`Qcow::open_implicit_backing()`].
    fn open_backing_chain(&mut self, seen: &mut Vec<StorageIdentity>) -> Result<()> {
        if self.backing_set {
            return Ok(());
        }

        let Some(filename) = self.header.backing_filename().cloned() else {
            self.backing_set = true;
            return Ok(());
        };

        let path = self.storage.resolve_relative_path(&filename)?;
        let storage = S::open(StorageOpenOptions::new().filename(&path))?;

        if let Some(id) = storage.identity() {
            if seen.contains(&id) {
                return Err(Error::CorruptTable(format!(
                    "backing file chain loops back to {}",
                    path.display()
                )));
            }
            seen.push(id);
        }

        let mut backing = Self::open_with(storage, self.options.clone())?;
        backing.open_backing_chain(seen)?;
        self.backing = Some(Arc::new(backing));
        self.backing_set = true;

        Ok(())
    }

    /// Attach a parent image.
    ///
    /// Takes precedence over the backing filename in the header.  With
    /// `None`, unallocated ranges read as zeroes instead of falling
    /// through to a parent.
    pub fn set_backing(&mut self, backing: Option<Arc<Qcow<S>>>) -> Result<()> {
        if let (Some(backing), Some(own_id)) = (backing.as_ref(), self.storage.identity()) {
            if backing.chain_identities().contains(&own_id) {
                return Err(Error::CorruptTable(
                    "backing file chain loops back to this image".into(),
                ));
            }
        }

        self.backing = backing;
        self.backing_set = true;
        Ok(())
    }

    /// The current backing image, if any.
    pub fn backing(&self) -> Option<&Arc<Qcow<S>>> {
        self.backing.as_ref()
    }

    /// Identities of every file in this image's chain, root first.
    fn chain_identities(&self) -> Vec<StorageIdentity> {
        let mut identities = Vec::new();
        let mut image = Some(self);
        while let Some(i) = image {
            if let Some(id) = i.storage.identity() {
                identities.push(id);
            }
            image = i.backing.as_deref();
        }
        identities
    }

    /// Derive the decryption key from a password, QEMU-style.
    ///
    /// May be called at any time before reading; replaces any previously
    /// configured key.  Setting a key on an unencrypted image is harmless.
    pub fn set_password(&mut self, password: &[u8]) {
        *self.cipher.write() = Some(SectorCipher::from_password(password));
    }

    /// Use the given raw 16-byte AES key directly.
    pub fn set_keys(&mut self, key: &[u8]) -> Result<()> {
        *self.cipher.write() = Some(SectorCipher::from_key(key)?);
        Ok(())
    }

    /// Media (logical disk) size in bytes.
    pub fn media_size(&self) -> u64 {
        self.header.size()
    }

    /// On-disk format version.
    pub fn format_version(&self) -> FormatVersion {
        self.header.version()
    }

    /// Encryption method applied to data clusters.
    pub fn encryption_method(&self) -> EncryptionMethod {
        self.header.encryption_method()
    }

    /// Bytes per cluster.
    pub fn cluster_size(&self) -> usize {
        self.header.cluster_size()
    }

    /// Backing filename recorded in the image header.
    pub fn backing_filename(&self) -> Option<&String> {
        self.header.backing_filename()
    }

    /// Backing format string recorded in the v3 header extensions.
    pub fn backing_format(&self) -> Option<&String> {
        self.header.backing_format()
    }

    /// Bitmask of compatible features (v3); retained but not acted upon.
    pub fn compatible_features(&self) -> u64 {
        self.header.compatible_features()
    }

    /// Bitmask of auto-clear features (v3); a read-only implementation may
    /// leave them set.
    pub fn autoclear_features(&self) -> u64 {
        self.header.autoclear_features()
    }

    /// Snapshots recorded in the image, in table order.
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Number of snapshots recorded in the image.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Get the given snapshot's metadata.
    pub fn snapshot(&self, index: usize) -> Option<&Snapshot> {
        self.snapshots.get(index)
    }

    /// Make in-progress and future reads fail with
    /// [`Error::Cancelled`].
    ///
    /// Already cached blocks remain valid.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// Clear the abort flag again.
    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::Relaxed);
    }

    /// Fail if the abort flag is set.
    pub(super) fn check_abort(&self) -> Result<()> {
        if self.abort.load(Ordering::Relaxed) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl<S: Storage> Debug for Qcow<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qcow")
            .field("storage", &self.storage)
            .field("version", &self.header.version())
            .field("media_size", &self.header.size())
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> Display for Qcow<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "qcow[{}]", self.storage)
    }
}
