//! Newtypes for the two address spaces.
//!
//! Media-side positions (`GuestOffset`, `GuestCluster`) and image-file
//! positions (`HostOffset`, `HostCluster`) are easy to mix up when both are
//! bare `u64`s; wrapping them keeps the translation code honest.
//!
//! Index math takes `l2_bits` explicitly: for v2/v3 images it is always
//! `cluster_bits - 3`, but v1 stores it as an independent header field.

use crate::crypto::SECTOR_SHIFT;
use std::fmt::{self, Display, Formatter};

/// Offset into the media (the logical disk).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct GuestOffset(pub u64);

/// Media cluster index.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct GuestCluster(pub u64);

/// Offset into the image file.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct HostOffset(pub u64);

/// Image file cluster index.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct HostCluster(pub u64);

impl GuestOffset {
    /// Position within the containing cluster.
    pub fn in_cluster_offset(self, cluster_bits: u32) -> usize {
        (self.0 % (1u64 << cluster_bits)) as usize
    }

    /// Index of the containing cluster.
    pub fn cluster(self, cluster_bits: u32) -> GuestCluster {
        GuestCluster(self.0 >> cluster_bits)
    }

    /// Bytes left between this offset and the end of its cluster.
    pub fn remaining_in_cluster(self, cluster_bits: u32) -> u64 {
        (1u64 << cluster_bits) - self.in_cluster_offset(cluster_bits) as u64
    }
}

impl GuestCluster {
    /// Media offset of this cluster's first byte.
    pub fn offset(self, cluster_bits: u32) -> GuestOffset {
        GuestOffset(self.0 << cluster_bits)
    }

    /// Where this cluster's entry sits in its L2 table.
    pub fn l2_index(self, l2_bits: u32) -> usize {
        (self.0 % (1u64 << l2_bits)) as usize
    }

    /// Where this cluster's L2 table is referenced in the L1 table.
    pub fn l1_index(self, l2_bits: u32) -> usize {
        (self.0 >> l2_bits) as usize
    }

    /// Logical index of this cluster's first 512-byte sector.
    ///
    /// Seeds the per-sector IV of encrypted clusters.  `cluster_bits` is at
    /// least 9, so the shift cannot underflow.
    pub fn first_sector(self, cluster_bits: u32) -> u64 {
        self.0 << (cluster_bits - SECTOR_SHIFT)
    }
}

impl HostOffset {
    /// Position within the containing cluster.
    pub fn in_cluster_offset(self, cluster_bits: u32) -> usize {
        (self.0 % (1u64 << cluster_bits)) as usize
    }

    /// Index of the containing cluster.
    pub fn cluster(self, cluster_bits: u32) -> HostCluster {
        HostCluster(self.0 >> cluster_bits)
    }

    /// Cluster index, but only for offsets on a cluster boundary.
    ///
    /// `None` for offsets in the middle of a cluster, which is how table
    /// alignment violations are caught.
    pub fn checked_cluster(self, cluster_bits: u32) -> Option<HostCluster> {
        (self.in_cluster_offset(cluster_bits) == 0).then_some(self.cluster(cluster_bits))
    }
}

impl HostCluster {
    /// File offset of this cluster's first byte.
    pub fn offset(self, cluster_bits: u32) -> HostOffset {
        HostOffset(self.0 << cluster_bits)
    }
}

impl Display for GuestOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Display for HostOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
