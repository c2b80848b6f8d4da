//! Cluster mapping resolution.
//!
//! Translates a media cluster through the L1 and L2 tables into what must
//! be done to read it.

use super::metadata::{FormatVersion, L2Entry, L2Table, Table};
use super::types::{GuestCluster, HostOffset};
use super::Qcow;
use crate::{Error, Result, Storage};
use std::sync::Arc;

/// What a media cluster resolves to.
#[derive(Debug)]
pub(super) enum ClusterMapping {
    /// Cluster data is stored as-is at the given file offset.
    Raw {
        /// Offset of the cluster in the image file.
        host_offset: HostOffset,
    },

    /// Cluster data is stored compressed.
    Compressed {
        /// Offset of the deflate stream in the image file.
        host_offset: HostOffset,

        /// Upper bound on the compressed length.
        length: u64,
    },

    /// Cluster reads as all zeroes.
    Zero,

    /// Cluster is unallocated here; consult the backing image, if any.
    Unallocated,
}

impl<S: Storage> Qcow<S> {
    /// Get the L2 table covering the given media cluster, if one is
    /// allocated.
    pub(super) fn get_l2(&self, guest_cluster: GuestCluster) -> Result<Option<Arc<L2Table>>> {
        let cb = self.header.cluster_bits();

        let l1_index = guest_cluster.l1_index(self.header.l2_bits());
        if l1_index >= self.l1_table.entries() {
            return Ok(None);
        }

        let l1_entry = self.l1_table.get(l1_index);
        let Some(l2_offset) = l1_entry.l2_offset(self.header.version()) else {
            return Ok(None);
        };

        let l2_cluster = l2_offset.checked_cluster(cb).ok_or_else(|| {
            Error::CorruptTable(format!(
                "unaligned L2 table at {l2_offset}; L1 entry {l1_index}"
            ))
        })?;

        self.l2_cache.get_or_insert(l2_cluster, &()).map(Some)
    }

    /// Resolve the given media cluster to its mapping.
    pub(super) fn get_mapping(&self, guest_cluster: GuestCluster) -> Result<ClusterMapping> {
        let Some(l2_table) = self.get_l2(guest_cluster)? else {
            return Ok(ClusterMapping::Unallocated);
        };

        let l2_entry = l2_table.get(guest_cluster.l2_index(self.header.l2_bits()));
        self.decode_l2_entry(l2_entry, guest_cluster)
    }

    /// Decode one L2 entry.
    ///
    /// The format version is branched on here, once per lookup; entries
    /// themselves are stored raw.
    fn decode_l2_entry(
        &self,
        l2_entry: L2Entry,
        guest_cluster: GuestCluster,
    ) -> Result<ClusterMapping> {
        let version = self.header.version();
        let cb = self.header.cluster_bits();

        if !l2_entry.is_allocated() {
            return Ok(ClusterMapping::Unallocated);
        }

        if let Some((host_offset, length)) = l2_entry.compressed_range(cb, version) {
            let length = if version == FormatVersion::V1 {
                // v1 has no length field; the stream runs to at most one
                // cluster, or to end of file, whichever comes first.
                if host_offset.0 >= self.file_size {
                    return Err(Error::CorruptTable(format!(
                        "compressed cluster at {host_offset} lies beyond end of file"
                    )));
                }
                length.min(self.file_size - host_offset.0)
            } else {
                length
            };

            return Ok(ClusterMapping::Compressed {
                host_offset,
                length,
            });
        }

        if l2_entry.is_zero(version) {
            // A v3 zero cluster reads as zeroes even if an offset is
            // preallocated next to the flag.
            return Ok(ClusterMapping::Zero);
        }

        let reserved = l2_entry.reserved_bits(version);
        if reserved != 0 {
            let offset = guest_cluster.offset(cb);
            return Err(Error::CorruptTable(format!(
                "L2 entry for {offset} has reserved bits set ({reserved:#x})"
            )));
        }

        match l2_entry.cluster_offset(version) {
            None => Ok(ClusterMapping::Unallocated),
            Some(host_offset) => {
                if host_offset.checked_cluster(cb).is_none() {
                    let offset = guest_cluster.offset(cb);
                    return Err(Error::CorruptTable(format!(
                        "unaligned data cluster at {host_offset} for {offset}"
                    )));
                }
                Ok(ClusterMapping::Raw { host_offset })
            }
        }
    }
}
