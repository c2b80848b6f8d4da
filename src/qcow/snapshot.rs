//! Snapshot table decoding.
//!
//! The snapshot directory is parsed at open time for introspection only;
//! reads always go through the live L1 table.

use super::metadata::{header_codec, Header};
use crate::storage::StorageExt;
use crate::{Error, Result, Storage};
use bincode::Options;
use serde::Deserialize;

/// Fixed-size part of an on-disk snapshot record.
#[derive(Deserialize)]
struct SnapshotRecord {
    /// Offset of the snapshot's L1 table.
    l1_table_offset: u64,

    /// Number of entries in the snapshot's L1 table.
    l1_size: u32,

    /// Length of the snapshot ID string.
    id_size: u16,

    /// Length of the snapshot name.
    name_size: u16,

    /// Creation time, seconds since the epoch.
    date_seconds: u32,

    /// Subsecond part of the creation time, in nanoseconds.
    date_nanoseconds: u32,

    /// Guest VM clock at the time of the snapshot, in nanoseconds.
    vm_clock_nanoseconds: u64,

    /// Size of the saved VM state, 0 if none.
    vm_state_size: u32,

    /// Length of extra data following the fixed part.
    extra_data_size: u32,
}

impl SnapshotRecord {
    /// On-disk size of the fixed part.
    const RAW_SIZE: usize = 40;
}

/// Metadata of one snapshot.
///
/// Snapshots are read-only view data in this crate; their data clusters are
/// not accessible.
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// Unique ID string.
    id: String,

    /// Human-readable name.
    name: String,

    /// Offset of the snapshot's L1 table.
    l1_table_offset: u64,

    /// Number of entries in the snapshot's L1 table.
    l1_size: u32,

    /// Creation time, seconds since the epoch.
    date_seconds: u32,

    /// Subsecond part of the creation time, in nanoseconds.
    date_nanoseconds: u32,

    /// Guest VM clock at the time of the snapshot, in nanoseconds.
    vm_clock_nanoseconds: u64,

    /// Size of the saved VM state, 0 if none.
    vm_state_size: u32,
}

impl Snapshot {
    /// Unique ID string.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset of this snapshot's L1 table in the image file.
    pub fn l1_table_offset(&self) -> u64 {
        self.l1_table_offset
    }

    /// Number of entries in this snapshot's L1 table.
    pub fn l1_table_entries(&self) -> usize {
        self.l1_size as usize
    }

    /// Creation time as (seconds since the epoch, nanoseconds).
    pub fn creation_time(&self) -> (u32, u32) {
        (self.date_seconds, self.date_nanoseconds)
    }

    /// Guest VM clock at the time of the snapshot, in nanoseconds.
    pub fn vm_clock_nanoseconds(&self) -> u64 {
        self.vm_clock_nanoseconds
    }

    /// Size of the saved VM state in bytes, 0 if none.
    pub fn vm_state_size(&self) -> u64 {
        self.vm_state_size as u64
    }
}

/// Parse the snapshot directory referenced by the header.
pub(super) fn load_snapshots<S: Storage>(image: &S, header: &Header) -> Result<Vec<Snapshot>> {
    let count = header.nb_snapshots();
    if count == 0 {
        return Ok(Vec::new());
    }

    let file_size = image.size()?;
    let mut offset = header.snapshots_offset();
    let mut snapshots = Vec::with_capacity(count as usize);

    for index in 0..count {
        // Fixed part, extra data, id, name, then padding to 8 bytes.
        let mut record_len = SnapshotRecord::RAW_SIZE as u64;

        if offset
            .checked_add(record_len)
            .map(|end| end > file_size)
            .unwrap_or(true)
        {
            return Err(snapshot_bounds_error(index));
        }

        let mut buf = [0u8; SnapshotRecord::RAW_SIZE];
        image.read_exact_at(&mut buf, offset)?;
        let record: SnapshotRecord = header_codec()
            .deserialize(&buf)
            .map_err(|err| Error::CorruptTable(format!("snapshot record {index}: {err}")))?;

        record_len += record.extra_data_size as u64;
        let id_offset = offset + record_len;
        record_len += record.id_size as u64;
        let name_offset = offset + record_len;
        record_len += record.name_size as u64;
        record_len = record_len.next_multiple_of(8);

        if offset
            .checked_add(record_len)
            .map(|end| end > file_size)
            .unwrap_or(true)
        {
            return Err(snapshot_bounds_error(index));
        }

        let mut id = vec![0u8; record.id_size as usize];
        image.read_exact_at(&mut id, id_offset)?;
        let mut name = vec![0u8; record.name_size as usize];
        image.read_exact_at(&mut name, name_offset)?;

        snapshots.push(Snapshot {
            id: String::from_utf8(id)
                .map_err(|err| Error::CorruptTable(format!("snapshot {index} ID: {err}")))?,
            name: String::from_utf8(name)
                .map_err(|err| Error::CorruptTable(format!("snapshot {index} name: {err}")))?,
            l1_table_offset: record.l1_table_offset,
            l1_size: record.l1_size,
            date_seconds: record.date_seconds,
            date_nanoseconds: record.date_nanoseconds,
            vm_clock_nanoseconds: record.vm_clock_nanoseconds,
            vm_state_size: record.vm_state_size,
        });

        offset += record_len;
    }

    Ok(snapshots)
}

/// Error for a snapshot record that does not fit the image file.
fn snapshot_bounds_error(index: u32) -> Error {
    Error::CorruptTable(format!(
        "snapshot record {index} extends beyond end of file"
    ))
}
