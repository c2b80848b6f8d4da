//! Back-ends for the L2 table and cluster block caches.

use super::metadata::{EncryptionMethod, Header, L2Table, Table};
use super::types::{HostCluster, HostOffset};
use crate::crypto::SectorCipher;
use crate::lru_cache::LruCacheBackend;
use crate::storage::StorageExt;
use crate::{Error, Result, Storage};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// Decoded payload of one data cluster, zero-padded to the cluster size.
pub(super) type ClusterBlock = Box<[u8]>;

/// Fetches L2 tables for the metadata cache.
pub(super) struct L2CacheBackend<S: Storage> {
    /// Image file.
    file: Arc<S>,

    /// Image header.
    header: Arc<Header>,
}

impl<S: Storage> L2CacheBackend<S> {
    /// Bind the back-end to the image file and header.
    pub fn new(file: Arc<S>, header: Arc<Header>) -> Self {
        L2CacheBackend { file, header }
    }
}

impl<S: Storage> LruCacheBackend for L2CacheBackend<S> {
    type Key = HostCluster;
    type Value = L2Table;
    type Request = ();

    fn load(&self, l2_cluster: HostCluster, _request: &()) -> Result<L2Table> {
        trace!("loading L2 table");

        L2Table::load(
            self.file.as_ref(),
            l2_cluster.offset(self.header.cluster_bits()),
            self.header.l2_entries(),
        )
    }
}

/// How to produce the block for a cluster cache miss.
pub(super) enum ClusterLoadKind {
    /// Copy `cluster_size` bytes straight from the file.
    Raw,

    /// Inflate a deflate stream of at most `length` bytes.
    Compressed {
        /// Upper bound on the compressed length, from the L2 entry.
        length: u64,
    },
}

/// Context for one cluster block load.
pub(super) struct ClusterLoad {
    /// Fetch/decode strategy.
    pub kind: ClusterLoadKind,

    /// Logical index of the cluster's first 512-byte sector.
    ///
    /// Seeds the decryption IV; unused for unencrypted images.
    pub first_sector: u64,
}

/// Fetches and decodes data clusters for the block cache.
pub(super) struct ClusterCacheBackend<S: Storage> {
    /// Image file.
    file: Arc<S>,

    /// Image header.
    header: Arc<Header>,

    /// Cipher context, set after open for encrypted images.
    cipher: Arc<RwLock<Option<SectorCipher>>>,

    /// Image file length, for bounds checks.
    file_size: u64,
}

impl<S: Storage> ClusterCacheBackend<S> {
    /// Bind the back-end to the image file, header, and cipher slot.
    pub fn new(
        file: Arc<S>,
        header: Arc<Header>,
        cipher: Arc<RwLock<Option<SectorCipher>>>,
        file_size: u64,
    ) -> Self {
        ClusterCacheBackend {
            file,
            header,
            cipher,
            file_size,
        }
    }

    /// Decrypt a freshly fetched block in place, if the image is encrypted.
    fn decrypt(&self, block: &mut [u8], first_sector: u64) -> Result<()> {
        if self.header.encryption_method() != EncryptionMethod::Aes {
            return Ok(());
        }

        let cipher = self.cipher.read();
        let Some(cipher) = cipher.as_ref() else {
            return Err(Error::EncryptionRequired);
        };
        cipher.decrypt_sectors(block, first_sector);
        Ok(())
    }
}

impl<S: Storage> LruCacheBackend for ClusterCacheBackend<S> {
    type Key = HostOffset;
    type Value = ClusterBlock;
    type Request = ClusterLoad;

    fn load(&self, host_offset: HostOffset, request: &ClusterLoad) -> Result<ClusterBlock> {
        let cluster_size = self.header.cluster_size();

        let mut block = match request.kind {
            ClusterLoadKind::Raw => {
                trace!("loading data cluster");

                let end = host_offset.0.checked_add(cluster_size as u64);
                if end.is_none() || end.unwrap_or(u64::MAX) > self.file_size {
                    return Err(Error::CorruptTable(format!(
                        "data cluster at {host_offset} extends beyond end of file"
                    )));
                }

                let mut block = vec![0u8; cluster_size].into_boxed_slice();
                self.file.read_exact_at(&mut block, host_offset.0)?;
                block
            }

            ClusterLoadKind::Compressed { length } => {
                trace!("loading compressed cluster");

                // The length from the descriptor is sector-granular and may
                // overshoot; clamp it to something sane anyway.
                let length = length.min(2 * cluster_size as u64) as usize;

                let end = host_offset.0.checked_add(length as u64);
                if end.is_none() || end.unwrap_or(u64::MAX) > self.file_size {
                    return Err(Error::CorruptTable(format!(
                        "compressed cluster at {host_offset}+{length} extends beyond end of file"
                    )));
                }

                let mut compressed = vec![0u8; length];
                self.file.read_exact_at(&mut compressed, host_offset.0)?;

                super::compressed::inflate_cluster(&compressed, cluster_size, host_offset)?
            }
        };

        self.decrypt(&mut block, request.first_sector)?;
        Ok(block)
    }
}
