//! Functionality for working with QCOW metadata.

use super::types::*;
use crate::storage::StorageExt;
use crate::{Error, Result, Storage};
use bincode::Options;
use serde::Deserialize;
use std::collections::HashMap;
use std::mem::size_of;

/// QCOW header magic ("QFI\xfb").
const MAGIC: u32 = 0x51_46_49_fb;

/// Minimum log2 of the cluster size (512-byte clusters).
const MIN_CLUSTER_BITS: u32 = 9;

/// Maximum log2 of the cluster size for v2/v3 (2 MiB clusters, QEMU's limit).
const MAX_CLUSTER_BITS: u32 = 21;

/// Maximum log2 of the cluster size for v1 (64 KiB clusters).
const MAX_CLUSTER_BITS_V1: u32 = 16;

/// Maximum log2 of the v1 L2 table entry count.
const MAX_L2_BITS_V1: u32 = 16;

/// Maximum length of the backing filename in bytes.
const MAX_BACKING_NAME_LENGTH: u32 = 1023;

/// Maximum number of snapshot records (QEMU's limit).
const MAX_SNAPSHOTS: u32 = 65536;

/// Incompatible feature bit: refcounts may be inconsistent.
///
/// Harmless for a reader, which never consults refcounts.
const INCOMPATIBLE_DIRTY: u64 = 1 << 0;

/// Fixed-integer big-endian codec for the on-disk structures.
pub(super) fn header_codec() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

/// Declares an enum stored on disk as a plain integer, plus a `TryFrom`
/// decoder for the raw wire value.
///
/// The header keeps a few fields of this shape (extension type codes,
/// feature classes).  Raw values matching no declared variant decode to
/// `InvalidHeader`.
macro_rules! on_disk_enum {
    (
        $(#[$attr:meta])*
        $vis:vis enum $name:ident from $repr:tt {
            $(
                $(#[$variant_attr:meta])*
                $variant:ident = $value:expr,
            )+
        }
    ) => {
        $(#[$attr])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        #[repr($repr)]
        $vis enum $name {
            $(
                $(#[$variant_attr])*
                $variant = $value,
            )+
        }

        impl TryFrom<$repr> for $name {
            type Error = crate::Error;

            fn try_from(raw: $repr) -> crate::Result<Self> {
                $(
                    if raw == $value {
                        return Ok($name::$variant);
                    }
                )+
                Err(crate::Error::InvalidHeader(format!(
                    concat!("unknown ", stringify!($name), " value {:#x}"),
                    raw,
                )))
            }
        }
    };
}

/// QCOW v1 header.
#[derive(Deserialize)]
struct V1Header {
    /// Signature bytes ("QFI\xfb").
    magic: u32,

    /// Version number (1).
    version: u32,

    /// Where the backing file name is stored, 0 if there is none.
    backing_file_offset: u64,

    /// Backing file name length in bytes.
    backing_file_size: u32,

    /// Modification time of the original file (unused).
    _modification_time: u32,

    /// Media size in bytes.
    size: u64,

    /// log2 of bytes per cluster.
    cluster_bits: u8,

    /// log2 of the number of entries per L2 table.
    l2_bits: u8,

    /// Padding.
    _padding: u16,

    /// Encryption method (0 = none, 1 = AES).
    crypt_method: u32,

    /// Where the L1 table starts.
    l1_table_offset: u64,
}

impl V1Header {
    /// On-disk size of the v1 header.
    const RAW_SIZE: usize = 48;
}

/// QCOW v2 header, shared by v3.
#[derive(Deserialize)]
struct V2Header {
    /// Signature bytes ("QFI\xfb").
    magic: u32,

    /// Version number (2 or 3).
    version: u32,

    /// Where the backing file name is stored, 0 if there is none.  The
    /// name carries no terminator; `backing_file_size` bounds it.
    backing_file_offset: u64,

    /// Backing file name length; capped at 1023 bytes.
    backing_file_size: u32,

    /// log2 of the cluster size, at least 9.
    cluster_bits: u32,

    /// Media size in bytes.
    size: u64,

    /// Encryption method (0 = none, 1 = AES, 2 = LUKS).
    crypt_method: u32,

    /// Entry count of the active L1 table.
    l1_size: u32,

    /// Where the active L1 table starts; cluster-aligned.
    l1_table_offset: u64,

    /// Offset of the refcount table; parsed but not used by a reader.
    _refcount_table_offset: u64,

    /// Number of clusters occupied by the refcount table; ignored.
    _refcount_table_clusters: u32,

    /// How many snapshot records the image carries.
    nb_snapshots: u32,

    /// Where the snapshot table starts; cluster-aligned.
    snapshots_offset: u64,
}

impl V2Header {
    /// On-disk size of the v2 header.
    const RAW_SIZE: usize = 72;
}

/// QCOW v3 header fields beyond the v2 header.
#[derive(Debug, Deserialize)]
struct V3HeaderBase {
    /// Feature bits a reader must understand to open the image at all.
    incompatible_features: u64,

    /// Feature bits that can be ignored without harm.
    compatible_features: u64,

    /// Feature bits a writer would have to clear; a reader leaves them
    /// alone.
    autoclear_features: u64,

    /// log2 of the refcount entry width; may not exceed 6.
    refcount_order: u32,

    /// Total header length in bytes; v3 requires at least 104.
    header_length: u32,
}

impl V3HeaderBase {
    /// On-disk size of the v3 tail behind the v2 header.
    const RAW_SIZE: usize = 104 - V2Header::RAW_SIZE;
}

impl Default for V3HeaderBase {
    fn default() -> Self {
        V3HeaderBase {
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            refcount_order: 4,
            header_length: (V2Header::RAW_SIZE + V3HeaderBase::RAW_SIZE) as u32,
        }
    }
}

/// On-disk format version.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum FormatVersion {
    /// QCOW version 1.
    V1,
    /// QCOW version 2 (qcow2).
    V2,
    /// QCOW version 3 (qcow2 with feature flags).
    V3,
}

impl FormatVersion {
    /// Numerical version as stored in the header.
    pub fn as_u32(self) -> u32 {
        match self {
            FormatVersion::V1 => 1,
            FormatVersion::V2 => 2,
            FormatVersion::V3 => 3,
        }
    }
}

/// Encryption method applied to data clusters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncryptionMethod {
    /// Data is stored in plain text.
    None,
    /// AES-128-CBC per 512-byte sector.
    Aes,
}

/// Decode the header's `crypt_method` field.
fn decode_crypt_method(crypt_method: u32) -> Result<EncryptionMethod> {
    match crypt_method {
        0 => Ok(EncryptionMethod::None),
        1 => Ok(EncryptionMethod::Aes),
        2 => Err(Error::UnsupportedVersion("LUKS encryption".into())),
        _ => Err(Error::InvalidHeader(format!(
            "invalid encryption method {crypt_method}"
        ))),
    }
}

on_disk_enum! {
    /// Type codes of the v3 header extension records.
    pub(super) enum HeaderExtensionType from u32 {
        /// Terminates the extension walk.
        End = 0,

        /// Format name of the backing image.
        BackingFileFormat = 0xe2792aca,

        /// Names for individual feature bits.
        FeatureNameTable = 0x6803f857,
    }
}

on_disk_enum! {
    /// Feature class codes used by the name table.
    #[derive(Hash)]
    pub(super) enum FeatureType from u8 {
        Incompatible = 0,
        Compatible = 1,
        Autoclear = 2,
    }
}

/// Fixed prefix of one extension record.
#[derive(Deserialize)]
struct HeaderExtensionHeader {
    /// Type code of the record.
    extension_type: u32,

    /// Payload length.
    length: u32,
}

impl HeaderExtensionHeader {
    /// On-disk size of the prefix.
    const RAW_SIZE: usize = 8;
}

/// Decoded v3 header extensions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) enum HeaderExtension {
    /// Format name of the backing image.
    BackingFileFormat(String),

    /// Names for feature bits, keyed by class and bit position.
    FeatureNameTable(HashMap<(FeatureType, u8), String>),

    /// Extension with an unrecognized type code, kept as raw bytes.
    Unknown {
        /// Type code.
        extension_type: u32,
        /// Payload (as read).
        data: Vec<u8>,
    },
}

impl HeaderExtension {
    /// Decode one extension record from its type code and payload.
    ///
    /// The end marker yields `Ok(None)`; type codes this crate does not
    /// know become [`HeaderExtension::Unknown`].
    fn deserialize(ext_type: u32, data: Vec<u8>) -> Result<Option<Self>> {
        let ext = if let Ok(ext_type) = HeaderExtensionType::try_from(ext_type) {
            match ext_type {
                HeaderExtensionType::End => return Ok(None),
                HeaderExtensionType::BackingFileFormat => {
                    let fmt = String::from_utf8(data).map_err(|err| {
                        Error::InvalidHeader(format!("invalid backing file format: {err}"))
                    })?;
                    HeaderExtension::BackingFileFormat(fmt)
                }
                HeaderExtensionType::FeatureNameTable => {
                    let mut feats = HashMap::new();
                    for feat in data.chunks_exact(48) {
                        let feat_type: FeatureType = match feat[0].try_into() {
                            Ok(ft) => ft,
                            Err(_) => continue, // unknown classes are skipped
                        };
                        // May not be NUL-terminated; cut at the first NUL
                        // and treat the rest as UTF-8.
                        let name_bytes = feat[2..].split(|c| *c == 0).next().unwrap_or(&[]);
                        let name = String::from_utf8_lossy(name_bytes);
                        feats.insert((feat_type, feat[1]), name.to_string());
                    }
                    HeaderExtension::FeatureNameTable(feats)
                }
            }
        } else {
            HeaderExtension::Unknown {
                extension_type: ext_type,
                data,
            }
        };

        Ok(Some(ext))
    }
}

/// Integrated header representation, unified across versions.
#[derive(Debug)]
pub(crate) struct Header {
    /// Format version.
    version: FormatVersion,

    /// log2 of bytes per cluster.
    cluster_bits: u32,

    /// log2 of the number of entries per L2 table.
    ///
    /// `cluster_bits - 3` for v2/v3; an independent header field for v1.
    l2_bits: u32,

    /// Media size in bytes.
    size: u64,

    /// Encryption method for data clusters.
    crypt_method: EncryptionMethod,

    /// Number of entries in the L1 table (computed for v1).
    l1_size: u32,

    /// Where the L1 table starts.
    l1_table_offset: u64,

    /// Number of snapshot records (v2/v3).
    nb_snapshots: u32,

    /// Offset of the snapshot table (v2/v3).
    snapshots_offset: u64,

    /// Backing filename, if the header names one.
    backing_filename: Option<String>,

    /// v3 feature bitmaps and layout fields (defaults for v1/v2).
    v3: V3HeaderBase,

    /// Extensions (v3).
    extensions: Vec<HeaderExtension>,
}

impl Header {
    /// Load the QCOW header from disk, validating every field.
    pub fn load<S: Storage>(image: &S) -> Result<Self> {
        let file_size = image.size()?;

        let mut prelude = [0u8; 8];
        image.read_exact_at(&mut prelude, 0)?;

        let mut word = [0u8; 4];
        word.copy_from_slice(&prelude[0..4]);
        if u32::from_be_bytes(word) != MAGIC {
            return Err(Error::InvalidSignature);
        }
        word.copy_from_slice(&prelude[4..8]);

        match u32::from_be_bytes(word) {
            1 => Self::load_v1(image, file_size),
            2 | 3 => Self::load_v2_v3(image, file_size),
            version => Err(Error::UnsupportedVersion(format!("QCOW version {version}"))),
        }
    }

    /// Load and validate a version 1 header.
    fn load_v1<S: Storage>(image: &S, file_size: u64) -> Result<Self> {
        let mut buf = vec![0u8; V1Header::RAW_SIZE];
        image.read_exact_at(&mut buf, 0)?;
        let header: V1Header = header_codec()
            .deserialize(&buf)
            .map_err(|err| Error::InvalidHeader(err.to_string()))?;
        debug_assert!(header.magic == MAGIC && header.version == 1);

        let cluster_bits = header.cluster_bits as u32;
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS_V1).contains(&cluster_bits) {
            return Err(Error::InvalidHeader(format!(
                "invalid cluster size: 2^{cluster_bits}"
            )));
        }
        let l2_bits = header.l2_bits as u32;
        if !(MIN_CLUSTER_BITS..=MAX_L2_BITS_V1).contains(&l2_bits) {
            return Err(Error::InvalidHeader(format!(
                "invalid L2 table size: 2^{l2_bits}"
            )));
        }

        let crypt_method = decode_crypt_method(header.crypt_method)?;

        // v1 does not store the L1 size; it is fully determined by the
        // media size and the table geometry.
        let bytes_per_l1_entry = 1u64 << (cluster_bits + l2_bits);
        let l1_size = header.size.div_ceil(bytes_per_l1_entry);
        let l1_size: u32 = l1_size
            .try_into()
            .ok()
            .filter(|n| *n <= L1Table::MAX_ENTRIES as u32)
            .ok_or_else(|| {
                Error::InvalidHeader(format!("L1 table too big: {l1_size} entries"))
            })?;

        check_l1_bounds(header.l1_table_offset, l1_size, file_size)?;

        let backing_filename = read_backing_name(
            image,
            header.backing_file_offset,
            header.backing_file_size,
            file_size,
        )?;

        Ok(Header {
            version: FormatVersion::V1,
            cluster_bits,
            l2_bits,
            size: header.size,
            crypt_method,
            l1_size,
            l1_table_offset: header.l1_table_offset,
            nb_snapshots: 0,
            snapshots_offset: 0,
            backing_filename,
            v3: V3HeaderBase::default(),
            extensions: Vec::new(),
        })
    }

    /// Load and validate a version 2 or 3 header.
    fn load_v2_v3<S: Storage>(image: &S, file_size: u64) -> Result<Self> {
        let mut buf = vec![0u8; V2Header::RAW_SIZE];
        image.read_exact_at(&mut buf, 0)?;
        let header: V2Header = header_codec()
            .deserialize(&buf)
            .map_err(|err| Error::InvalidHeader(err.to_string()))?;
        debug_assert!(header.magic == MAGIC);

        let version = match header.version {
            2 => FormatVersion::V2,
            _ => FormatVersion::V3,
        };

        let v3 = if version == FormatVersion::V3 {
            let mut buf = vec![0u8; V3HeaderBase::RAW_SIZE];
            image.read_exact_at(&mut buf, V2Header::RAW_SIZE as u64)?;
            header_codec()
                .deserialize::<V3HeaderBase>(&buf)
                .map_err(|err| Error::InvalidHeader(err.to_string()))?
        } else {
            V3HeaderBase::default()
        };

        let cluster_bits = header.cluster_bits;
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
            return Err(Error::InvalidHeader(format!(
                "invalid cluster size: 2^{cluster_bits}"
            )));
        }
        let cluster_size = 1u64 << cluster_bits;
        let l2_bits = cluster_bits - 3;

        if version == FormatVersion::V3 {
            let min_header_size = (V2Header::RAW_SIZE + V3HeaderBase::RAW_SIZE) as u32;
            if v3.header_length < min_header_size {
                return Err(Error::InvalidHeader(format!(
                    "header too short: {} < {min_header_size}",
                    v3.header_length
                )));
            }
            if v3.header_length as u64 > cluster_size {
                return Err(Error::InvalidHeader(format!(
                    "header too big: {} > {cluster_size}",
                    v3.header_length
                )));
            }
            if v3.refcount_order > 6 {
                return Err(Error::InvalidHeader(format!(
                    "invalid refcount width: 2^{}",
                    v3.refcount_order
                )));
            }
        }

        let crypt_method = decode_crypt_method(header.crypt_method)?;

        if HostOffset(header.l1_table_offset)
            .checked_cluster(cluster_bits)
            .is_none()
        {
            return Err(Error::InvalidHeader(format!(
                "unaligned L1 table: {:#x}",
                header.l1_table_offset
            )));
        }

        // Every media byte must be covered by the L1 table.
        let bytes_per_l1_entry = cluster_size << l2_bits;
        let required_l1_entries = header.size.div_ceil(bytes_per_l1_entry);
        if (header.l1_size as u64) < required_l1_entries {
            return Err(Error::InvalidHeader(format!(
                "L1 table too small for media size: {} < {required_l1_entries}",
                header.l1_size
            )));
        }
        if header.l1_size as usize > L1Table::MAX_ENTRIES {
            return Err(Error::InvalidHeader(format!(
                "L1 table too big: {} entries",
                header.l1_size
            )));
        }

        check_l1_bounds(header.l1_table_offset, header.l1_size, file_size)?;

        let backing_filename = read_backing_name(
            image,
            header.backing_file_offset,
            header.backing_file_size,
            cluster_size,
        )?;

        let extensions = if version == FormatVersion::V3 {
            Self::load_extensions(image, v3.header_length as u64, cluster_size)?
        } else {
            Vec::new()
        };

        // The dirty bit only matters for refcounts, which a reader never
        // touches.  Everything else is grounds for refusal, including the
        // corrupt bit.
        let unrecognized = v3.incompatible_features & !INCOMPATIBLE_DIRTY;
        if unrecognized != 0 {
            let name_table = extensions.iter().find_map(|ext| match ext {
                HeaderExtension::FeatureNameTable(names) => Some(names),
                _ => None,
            });
            let feats = (0u8..64)
                .filter(|bit| unrecognized & (1u64 << bit) != 0)
                .map(|bit| {
                    match name_table.and_then(|t| t.get(&(FeatureType::Incompatible, bit))) {
                        Some(name) => format!("{bit} ({name})"),
                        None => format!("{bit}"),
                    }
                })
                .collect::<Vec<String>>();
            return Err(Error::UnsupportedVersion(format!(
                "unrecognized incompatible feature(s) {}",
                feats.join(", ")
            )));
        }

        if header.nb_snapshots > MAX_SNAPSHOTS {
            return Err(Error::InvalidHeader(format!(
                "too many snapshots: {}",
                header.nb_snapshots
            )));
        }
        if header.nb_snapshots > 0
            && HostOffset(header.snapshots_offset)
                .checked_cluster(cluster_bits)
                .is_none()
        {
            return Err(Error::InvalidHeader(format!(
                "unaligned snapshot table: {:#x}",
                header.snapshots_offset
            )));
        }

        Ok(Header {
            version,
            cluster_bits,
            l2_bits,
            size: header.size,
            crypt_method,
            l1_size: header.l1_size,
            l1_table_offset: header.l1_table_offset,
            nb_snapshots: header.nb_snapshots,
            snapshots_offset: header.snapshots_offset,
            backing_filename,
            v3,
            extensions,
        })
    }

    /// Walk the v3 header extension list in the first cluster.
    fn load_extensions<S: Storage>(
        image: &S,
        start: u64,
        cluster_size: u64,
    ) -> Result<Vec<HeaderExtension>> {
        let mut ext_offset = start;
        let mut extensions = Vec::new();

        loop {
            if ext_offset + HeaderExtensionHeader::RAW_SIZE as u64 > cluster_size {
                return Err(Error::InvalidHeader(
                    "header extensions exceed the first cluster".into(),
                ));
            }

            let mut ext_hdr_buf = [0u8; HeaderExtensionHeader::RAW_SIZE];
            image.read_exact_at(&mut ext_hdr_buf, ext_offset)?;
            ext_offset += HeaderExtensionHeader::RAW_SIZE as u64;

            let ext_hdr: HeaderExtensionHeader = header_codec()
                .deserialize(&ext_hdr_buf)
                .map_err(|err| Error::InvalidHeader(err.to_string()))?;

            let ext_end = ext_offset
                .checked_add(ext_hdr.length as u64)
                .ok_or_else(|| Error::InvalidHeader("header extension size overflow".into()))?;
            if ext_end > cluster_size {
                return Err(Error::InvalidHeader(
                    "header extensions exceed the first cluster".into(),
                ));
            }

            let mut ext_data = vec![0u8; ext_hdr.length as usize];
            image.read_exact_at(&mut ext_data, ext_offset)?;
            ext_offset += (ext_hdr.length as u64).next_multiple_of(8);

            let Some(extension) = HeaderExtension::deserialize(ext_hdr.extension_type, ext_data)?
            else {
                break;
            };
            extensions.push(extension);
        }

        Ok(extensions)
    }

    /// Media size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Format version.
    pub fn version(&self) -> FormatVersion {
        self.version
    }

    /// log2 of bytes per cluster.
    pub fn cluster_bits(&self) -> u32 {
        self.cluster_bits
    }

    /// Bytes per cluster.
    pub fn cluster_size(&self) -> usize {
        1 << self.cluster_bits
    }

    /// log2 of the number of entries per L2 table.
    pub fn l2_bits(&self) -> u32 {
        self.l2_bits
    }

    /// Entries per L2 table.
    pub fn l2_entries(&self) -> usize {
        1 << self.l2_bits
    }

    /// Encryption method for data clusters.
    pub fn encryption_method(&self) -> EncryptionMethod {
        self.crypt_method
    }

    /// Location of the L1 table.
    pub fn l1_table_offset(&self) -> HostOffset {
        HostOffset(self.l1_table_offset)
    }

    /// Entry count of the L1 table.
    pub fn l1_table_entries(&self) -> usize {
        self.l1_size as usize
    }

    /// Number of snapshot records.
    pub fn nb_snapshots(&self) -> u32 {
        self.nb_snapshots
    }

    /// Offset of the snapshot table.
    pub fn snapshots_offset(&self) -> u64 {
        self.snapshots_offset
    }

    /// Backing filename recorded in the header, if present.
    pub fn backing_filename(&self) -> Option<&String> {
        self.backing_filename.as_ref()
    }

    /// Backing format string from the v3 extension, if present.
    pub fn backing_format(&self) -> Option<&String> {
        self.extensions.iter().find_map(|ext| match ext {
            HeaderExtension::BackingFileFormat(fmt) => Some(fmt),
            _ => None,
        })
    }

    /// Bitmask of compatible features (v3).
    pub fn compatible_features(&self) -> u64 {
        self.v3.compatible_features
    }

    /// Bitmask of auto-clear features (v3).
    pub fn autoclear_features(&self) -> u64 {
        self.v3.autoclear_features
    }
}

/// Check that the whole L1 table lies within the image file.
fn check_l1_bounds(l1_table_offset: u64, l1_size: u32, file_size: u64) -> Result<()> {
    let l1_bytes = l1_size as u64 * size_of::<u64>() as u64;
    let end = l1_table_offset.checked_add(l1_bytes);
    if end.is_none() || end.unwrap_or(u64::MAX) > file_size {
        return Err(Error::InvalidHeader(format!(
            "L1 table (offset {l1_table_offset:#x}, {l1_size} entries) \
             extends beyond end of file ({file_size} bytes)"
        )));
    }
    Ok(())
}

/// Read and validate the backing filename, if the header references one.
///
/// `limit` bounds where the name may end: the first cluster for v2/v3, the
/// file itself for v1.
fn read_backing_name<S: Storage>(
    image: &S,
    offset: u64,
    length: u32,
    limit: u64,
) -> Result<Option<String>> {
    if offset == 0 {
        return Ok(None);
    }

    if length > MAX_BACKING_NAME_LENGTH {
        return Err(Error::InvalidHeader(format!(
            "backing file name is too long ({length}, must not exceed {MAX_BACKING_NAME_LENGTH})"
        )));
    }

    let end = offset
        .checked_add(length as u64)
        .ok_or_else(|| Error::InvalidHeader("backing file name offset is invalid".into()))?;
    if end > limit {
        return Err(Error::InvalidHeader(
            "backing file name lies beyond its permitted bound".into(),
        ));
    }

    let mut buf = vec![0u8; length as usize];
    image.read_exact_at(&mut buf, offset)?;

    let name = String::from_utf8(buf)
        .map_err(|err| Error::InvalidHeader(format!("backing file name is invalid: {err}")))?;
    Ok(Some(name))
}

/// A single slot of the L1 table.
///
/// Stored raw; offsets are decoded (and checked) at resolution time, so a
/// corrupt entry fails only the reads that traverse it.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct L1Entry(u64);

impl L1Entry {
    /// Offset mask for v2/v3 entries: everything but the COPIED flag
    /// (bit 63) and the reserved low bits.
    const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;

    /// L2 table location, `None` when nothing is allocated under this
    /// entry.
    pub fn l2_offset(self, version: FormatVersion) -> Option<HostOffset> {
        let offset = match version {
            FormatVersion::V1 => self.0,
            _ => self.0 & Self::OFFSET_MASK,
        };
        (offset != 0).then_some(HostOffset(offset))
    }
}

/// A single slot of an L2 table.
///
/// v2/v3 layout:
/// - Bit 0 - 61: cluster descriptor
/// - Bit 62: compressed-cluster flag
/// - Bit 63: COPIED flag (refcount == 1); irrelevant to reading, masked off
///
/// Standard cluster descriptor: bit 0 is the all-zeroes flag (v3), bits
/// 9 - 55 the host cluster offset, everything else reserved.
///
/// Compressed cluster descriptor (`x = 62 - (cluster_bits - 8)`): bits
/// 0 - x-1 the host byte offset, bits x - 61 the number of additional
/// 512-byte sectors.
///
/// v1 layout: the entry is the host byte offset of the cluster, with bit 63
/// set for compressed clusters.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct L2Entry(u64);

impl L2Entry {
    /// COPIED flag (v2/v3).
    const COPIED: u64 = 1 << 63;

    /// Compressed-cluster flag for v2/v3.
    const COMPRESSED: u64 = 1 << 62;

    /// Compressed-cluster flag for v1.
    const COMPRESSED_V1: u64 = 1 << 63;

    /// All-zeroes flag (v3).
    const ZERO: u64 = 1;

    /// Offset mask for standard v2/v3 entries.
    const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;

    /// Reserved bits of standard v3 entries.
    const RESERVED_STANDARD: u64 = 0x3f00_0000_0000_01fe;

    /// Whether the entry is allocated at all.
    pub fn is_allocated(self) -> bool {
        self.0 != 0
    }

    /// Whether the entry describes a compressed cluster.
    pub fn is_compressed(self, version: FormatVersion) -> bool {
        let flag = match version {
            FormatVersion::V1 => Self::COMPRESSED_V1,
            _ => Self::COMPRESSED,
        };
        self.0 & flag != 0
    }

    /// Whether the entry carries the v3 all-zeroes flag.
    pub fn is_zero(self, version: FormatVersion) -> bool {
        version == FormatVersion::V3 && self.0 & Self::ZERO != 0
    }

    /// Reserved bits of a standard (non-compressed) entry.
    ///
    /// The all-zeroes bit counts as reserved before v3.
    pub fn reserved_bits(self, version: FormatVersion) -> u64 {
        match version {
            FormatVersion::V1 => 0,
            FormatVersion::V2 => self.0 & (Self::RESERVED_STANDARD | Self::ZERO),
            FormatVersion::V3 => self.0 & Self::RESERVED_STANDARD,
        }
    }

    /// Host offset of a standard cluster, if allocated.
    pub fn cluster_offset(self, version: FormatVersion) -> Option<HostOffset> {
        let offset = match version {
            FormatVersion::V1 => self.0,
            _ => self.0 & Self::OFFSET_MASK,
        };
        (offset != 0).then_some(HostOffset(offset))
    }

    /// If this entry is compressed, return the host byte offset and an
    /// upper bound on the compressed length.
    pub fn compressed_range(
        self,
        cluster_bits: u32,
        version: FormatVersion,
    ) -> Option<(HostOffset, u64)> {
        if !self.is_compressed(version) {
            return None;
        }

        if version == FormatVersion::V1 {
            // v1 stores no length; decompression stops after one cluster
            // of output (or at end of file).
            let offset = self.0 & !Self::COMPRESSED_V1;
            return Some((HostOffset(offset), 1u64 << cluster_bits));
        }

        let desc = self.0 & !(Self::COPIED | Self::COMPRESSED);
        let compressed_offset_bits = 62 - (cluster_bits - 8);
        let offset = desc & ((1 << compressed_offset_bits) - 1) & 0x00ff_ffff_ffff_ffff;
        let sectors = desc >> compressed_offset_bits;
        // The first sector is not counted in `sectors`, so add it and
        // subtract the bytes before the start offset within it.
        let length = (sectors + 1) * 512 - (offset & 511);

        Some((HostOffset(offset), length))
    }
}

/// Generic construction of table entries from their raw value.
pub(super) trait TableEntry: Copy {
    /// Wrap the given raw value.
    fn from_plain(value: u64) -> Self;
}

impl TableEntry for L1Entry {
    fn from_plain(value: u64) -> Self {
        L1Entry(value)
    }
}

impl TableEntry for L2Entry {
    fn from_plain(value: u64) -> Self {
        L2Entry(value)
    }
}

/// Generic QCOW metadata table (L1 or L2).
pub(super) trait Table: Sized {
    /// Type of each table entry.
    type Entry: TableEntry;

    /// Name used in error messages.
    const NAME: &'static str;

    /// Upper bound on the entry count.
    const MAX_ENTRIES: usize;

    /// Wrap decoded entries in the table type.
    fn from_data(data: Box<[Self::Entry]>) -> Self;

    /// How many entries the table holds.
    fn entries(&self) -> usize;

    /// Read and decode a table from the image file.
    ///
    /// A table that does not fit the image file is reported as corrupt.
    fn load<S: Storage>(image: &S, offset: HostOffset, entries: usize) -> Result<Self> {
        check_table(
            Self::NAME,
            offset.0,
            entries,
            size_of::<u64>(),
            Self::MAX_ENTRIES,
            image.size()?,
        )
        .map_err(Error::CorruptTable)?;

        let mut buf = vec![0u8; entries * size_of::<u64>()];
        image.read_exact_at(&mut buf, offset.0)?;

        let mut data = Vec::with_capacity(entries);
        for raw in buf.chunks_exact(size_of::<u64>()) {
            let mut bytes = [0u8; size_of::<u64>()];
            bytes.copy_from_slice(raw);
            data.push(Self::Entry::from_plain(u64::from_be_bytes(bytes)));
        }

        Ok(Self::from_data(data.into_boxed_slice()))
    }
}

/// The active L1 table.
///
/// Loaded once at open, immutable for the life of the image.
#[derive(Debug)]
pub(super) struct L1Table {
    /// Decoded entries.
    data: Box<[L1Entry]>,
}

impl L1Table {
    /// Get the given entry; out-of-bounds indices read as unallocated.
    pub fn get(&self, index: usize) -> L1Entry {
        self.data.get(index).copied().unwrap_or_default()
    }
}

impl Table for L1Table {
    type Entry = L1Entry;
    const NAME: &'static str = "L1 table";

    /// QEMU refuses larger L1 tables, so there is no harm in refusing too.
    const MAX_ENTRIES: usize = 4 * 1024 * 1024;

    fn from_data(data: Box<[L1Entry]>) -> Self {
        Self { data }
    }

    fn entries(&self) -> usize {
        self.data.len()
    }
}

/// L2 table, loaded on demand and cached.
#[derive(Debug)]
pub(super) struct L2Table {
    /// Decoded entries.
    data: Box<[L2Entry]>,
}

impl L2Table {
    /// Get the given entry; out-of-bounds indices read as unallocated.
    pub fn get(&self, index: usize) -> L2Entry {
        self.data.get(index).copied().unwrap_or_default()
    }
}

impl Table for L2Table {
    type Entry = L2Entry;
    const NAME: &'static str = "L2 table";

    /// One cluster of 8-byte entries at the maximum cluster size.
    const MAX_ENTRIES: usize = (1 << MAX_CLUSTER_BITS) / 8;

    fn from_data(data: Box<[L2Entry]>) -> Self {
        Self { data }
    }

    fn entries(&self) -> usize {
        self.data.len()
    }
}

/// Validate a table's placement against the image file.
fn check_table(
    name: &str,
    offset: u64,
    entries: usize,
    entry_size: usize,
    max_entries: usize,
    file_size: u64,
) -> std::result::Result<(), String> {
    if entries > max_entries {
        return Err(format!("{name} too big: {entries} > {max_entries}"));
    }

    let byte_size = entries
        .checked_mul(entry_size)
        .ok_or_else(|| format!("{name} size overflow: {entries} * {entry_size}"))?;
    let end_offset = offset
        .checked_add(byte_size as u64)
        .ok_or_else(|| format!("{name} offset overflow: {offset:#x} + {byte_size}"))?;
    if end_offset > file_size {
        return Err(format!(
            "{name} (offset {offset:#x}, {byte_size} bytes) extends beyond end of file \
             ({file_size} bytes)"
        ));
    }

    Ok(())
}
