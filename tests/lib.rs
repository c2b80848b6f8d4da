//! End-to-end read tests over images assembled in memory.

use qcow::{EncryptionMethod, Error, FormatVersion, Memory, OpenOptions, Qcow, Storage};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

/// QCOW magic ("QFI\xfb").
const MAGIC: u32 = 0x514649fb;

/// Contents of one media cluster in a built image.
enum ClusterKind {
    /// Stored as-is (already encrypted, for encrypted images).
    Raw(Vec<u8>),
    /// Stored as a raw deflate stream.
    Compressed(Vec<u8>),
    /// v3 all-zeroes flag.
    Zero,
}

/// Assembles valid v2/v3 images: header in cluster 0, L1 in cluster 1, one
/// L2 table in cluster 2, data from cluster 3 on.
struct ImageBuilder {
    version: u32,
    cluster_bits: u32,
    media_size: u64,
    crypt_method: u32,
    backing: Option<String>,
    clusters: Vec<(u64, ClusterKind)>,
    l1_overrides: Vec<(usize, u64)>,
    snapshot_records: Vec<Vec<u8>>,
}

impl ImageBuilder {
    fn new(version: u32, cluster_bits: u32, media_size: u64) -> Self {
        ImageBuilder {
            version,
            cluster_bits,
            media_size,
            crypt_method: 0,
            backing: None,
            clusters: Vec::new(),
            l1_overrides: Vec::new(),
            snapshot_records: Vec::new(),
        }
    }

    fn encrypted(mut self) -> Self {
        self.crypt_method = 1;
        self
    }

    fn backing(mut self, name: &str) -> Self {
        self.backing = Some(name.to_string());
        self
    }

    fn cluster(mut self, index: u64, kind: ClusterKind) -> Self {
        self.clusters.push((index, kind));
        self
    }

    fn override_l1(mut self, index: usize, raw: u64) -> Self {
        self.l1_overrides.push((index, raw));
        self
    }

    fn snapshot_record(mut self, record: Vec<u8>) -> Self {
        self.snapshot_records.push(record);
        self
    }

    fn build(self) -> Vec<u8> {
        let cb = self.cluster_bits;
        let cs = 1usize << cb;
        let l2_entries = cs / 8;
        let l2_coverage = (cs as u64) << (cb - 3);
        let l1_size = self.media_size.div_ceil(l2_coverage).max(1) as usize;
        assert!(l1_size * 8 <= cs, "L1 table must fit one cluster");

        // Clusters 0..3: header, L1, L2; data follows.
        let mut file = vec![0u8; 3 * cs];
        let mut l2 = vec![0u64; l2_entries];

        for (index, kind) in self.clusters {
            let index = index as usize;
            assert!(index < l2_entries, "cluster must fall in the first L2 table");
            assert!(file.len() % cs == 0);

            let offset = file.len() as u64;
            l2[index] = match kind {
                ClusterKind::Raw(data) => {
                    assert!(data.len() <= cs);
                    file.extend_from_slice(&data);
                    file.resize(offset as usize + cs, 0);
                    (1 << 63) | offset
                }
                ClusterKind::Compressed(stream) => {
                    assert!(!stream.is_empty());
                    let additional_sectors = (stream.len() as u64).div_ceil(512) - 1;
                    file.extend_from_slice(&stream);
                    file.resize(file.len().next_multiple_of(cs), 0);

                    let offset_bits = 62 - (cb - 8);
                    assert!(offset < (1 << offset_bits));
                    (1 << 62) | (additional_sectors << offset_bits) | offset
                }
                ClusterKind::Zero => 1,
            };
        }

        // L2 table into cluster 2.
        for (i, entry) in l2.iter().enumerate() {
            file[2 * cs + i * 8..2 * cs + i * 8 + 8].copy_from_slice(&entry.to_be_bytes());
        }

        // L1 table into cluster 1; entry 0 references the L2 table.
        let mut l1 = vec![0u64; l1_size];
        l1[0] = (1 << 63) | (2 * cs) as u64;
        for (index, raw) in self.l1_overrides {
            l1[index] = raw;
        }
        for (i, entry) in l1.iter().enumerate() {
            file[cs + i * 8..cs + i * 8 + 8].copy_from_slice(&entry.to_be_bytes());
        }

        // Snapshot table at the end, if any.
        let nb_snapshots = self.snapshot_records.len() as u32;
        let snapshots_offset = file.len() as u64;
        for record in self.snapshot_records {
            file.extend_from_slice(&record);
        }
        file.resize(file.len().next_multiple_of(cs), 0);

        // Header into cluster 0.
        let header_end = if self.version == 3 { 112 } else { 72 };
        let (backing_offset, backing_size) = match self.backing.as_ref() {
            Some(name) => {
                file[header_end..header_end + name.len()].copy_from_slice(name.as_bytes());
                (header_end as u64, name.len() as u32)
            }
            None => (0, 0),
        };

        let mut header = Vec::new();
        header.extend_from_slice(&MAGIC.to_be_bytes());
        header.extend_from_slice(&self.version.to_be_bytes());
        header.extend_from_slice(&backing_offset.to_be_bytes());
        header.extend_from_slice(&backing_size.to_be_bytes());
        header.extend_from_slice(&cb.to_be_bytes());
        header.extend_from_slice(&self.media_size.to_be_bytes());
        header.extend_from_slice(&self.crypt_method.to_be_bytes());
        header.extend_from_slice(&(l1_size as u32).to_be_bytes());
        header.extend_from_slice(&(cs as u64).to_be_bytes()); // l1_table_offset
        header.extend_from_slice(&0u64.to_be_bytes()); // refcount_table_offset
        header.extend_from_slice(&0u32.to_be_bytes()); // refcount_table_clusters
        header.extend_from_slice(&nb_snapshots.to_be_bytes());
        let snapshots_offset_field = if nb_snapshots > 0 { snapshots_offset } else { 0 };
        header.extend_from_slice(&snapshots_offset_field.to_be_bytes());
        if self.version == 3 {
            header.extend_from_slice(&0u64.to_be_bytes()); // incompatible_features
            header.extend_from_slice(&0u64.to_be_bytes()); // compatible_features
            header.extend_from_slice(&0u64.to_be_bytes()); // autoclear_features
            header.extend_from_slice(&4u32.to_be_bytes()); // refcount_order
            header.extend_from_slice(&104u32.to_be_bytes()); // header_length
            header.extend_from_slice(&[0u8; 8]); // end of extensions
        }
        file[..header.len()].copy_from_slice(&header);

        file
    }

    fn open(self) -> Qcow<Memory> {
        Qcow::open_image(Memory::new(self.build())).unwrap()
    }
}

/// Serialize one snapshot record.
fn snapshot_record(id: &str, name: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&0x30000u64.to_be_bytes()); // l1_table_offset
    buf.extend_from_slice(&1u32.to_be_bytes()); // l1_size
    buf.extend_from_slice(&(id.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
    buf.extend_from_slice(&1_700_000_000u32.to_be_bytes()); // date_seconds
    buf.extend_from_slice(&0u32.to_be_bytes()); // date_nanoseconds
    buf.extend_from_slice(&0u64.to_be_bytes()); // vm_clock_nanoseconds
    buf.extend_from_slice(&0u32.to_be_bytes()); // vm_state_size
    buf.extend_from_slice(&0u32.to_be_bytes()); // extra_data_size
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.resize(buf.len().next_multiple_of(8), 0);
    buf
}

/// CBC-encrypt sectors the way a QCOW writer would.
fn encrypt_sectors(key: &[u8; 16], buf: &mut [u8], first_sector: u64) {
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockEncrypt, KeyInit};

    let cipher = aes::Aes128::new(GenericArray::from_slice(key));
    for (i, sector) in buf.chunks_exact_mut(512).enumerate() {
        let mut prev = [0u8; 16];
        prev[..8].copy_from_slice(&(first_sector + i as u64).to_le_bytes());
        for block in sector.chunks_exact_mut(16) {
            for (b, p) in block.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
            prev.copy_from_slice(block);
        }
    }
}

#[test]
fn raw_cluster_and_zero_default() {
    // 64 KiB clusters, 128 KiB media, first cluster allocated with 0xAB.
    let image = ImageBuilder::new(2, 16, 128 * 1024)
        .cluster(0, ClusterKind::Raw(vec![0xAB; 64 * 1024]))
        .open();

    assert_eq!(image.media_size(), 128 * 1024);
    assert_eq!(image.format_version(), FormatVersion::V2);
    assert_eq!(image.encryption_method(), EncryptionMethod::None);

    let mut buf = vec![0xFFu8; 128 * 1024];
    assert_eq!(image.read_at(&mut buf, 0).unwrap(), 128 * 1024);
    assert!(buf[..64 * 1024].iter().all(|b| *b == 0xAB));
    assert!(buf[64 * 1024..].iter().all(|b| *b == 0x00));

    // Unaligned range crossing the allocation boundary.
    let mut buf = vec![0u8; 4096];
    assert_eq!(image.read_at(&mut buf, 64 * 1024 - 100).unwrap(), 4096);
    assert!(buf[..100].iter().all(|b| *b == 0xAB));
    assert!(buf[100..].iter().all(|b| *b == 0x00));
}

#[test]
fn compressed_cluster_roundtrip() {
    let original: Vec<u8> = (0..64 * 1024).map(|i| (i % 256) as u8).collect();
    let stream = miniz_oxide::deflate::compress_to_vec(&original, 9);

    let image = ImageBuilder::new(2, 16, 128 * 1024)
        .cluster(0, ClusterKind::Compressed(stream))
        .open();

    let mut buf = vec![0u8; 64 * 1024];
    assert_eq!(image.read_at(&mut buf, 0).unwrap(), 64 * 1024);
    assert_eq!(buf, original);
}

#[test]
fn encrypted_raw_cluster() {
    let key: [u8; 16] = std::array::from_fn(|i| (i + 1) as u8);

    // Sector 0 holds 0xAA bytes; the whole 4 KiB cluster is encrypted.
    let mut cluster = vec![0u8; 4096];
    cluster[..512].fill(0xAA);
    encrypt_sectors(&key, &mut cluster, 0);

    let bytes = ImageBuilder::new(2, 12, 8192)
        .encrypted()
        .cluster(0, ClusterKind::Raw(cluster))
        .build();

    // Reading without a key must fail.
    let image = Qcow::open_image(Memory::new(bytes.clone())).unwrap();
    assert_eq!(image.encryption_method(), EncryptionMethod::Aes);
    let mut buf = vec![0u8; 512];
    assert!(matches!(
        image.read_at(&mut buf, 0),
        Err(Error::EncryptionRequired)
    ));

    let mut image = Qcow::open_image(Memory::new(bytes)).unwrap();
    image.set_keys(&key).unwrap();
    assert_eq!(image.read_at(&mut buf, 0).unwrap(), 512);
    assert!(buf.iter().all(|b| *b == 0xAA));

    // The rest of the cluster decrypts back to zeroes.
    let mut buf = vec![0xFFu8; 4096 - 512];
    assert_eq!(image.read_at(&mut buf, 512).unwrap(), buf.len());
    assert!(buf.iter().all(|b| *b == 0x00));
}

#[test]
fn password_matches_plain_key_padding() {
    let mut key = [0u8; 16];
    key[..6].copy_from_slice(b"secret");

    let mut cluster = vec![0x5Au8; 4096];
    encrypt_sectors(&key, &mut cluster, 0);

    let mut image = ImageBuilder::new(2, 12, 4096)
        .encrypted()
        .cluster(0, ClusterKind::Raw(cluster))
        .open();
    image.set_password(b"secret");

    let mut buf = vec![0u8; 4096];
    assert_eq!(image.read_at(&mut buf, 0).unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0x5A));
}

#[test]
fn backing_chain_composition() {
    // Parent: one allocated 4 KiB cluster of 0x5A.
    let parent = ImageBuilder::new(2, 12, 8192)
        .cluster(0, ClusterKind::Raw(vec![0x5A; 4096]))
        .open();

    // Child: same geometry, nothing allocated.
    let mut child = ImageBuilder::new(2, 12, 8192).open();
    child.set_backing(Some(Arc::new(parent))).unwrap();

    let mut buf = vec![0u8; 4096];
    assert_eq!(child.read_at(&mut buf, 0).unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0x5A));

    // Beyond the parent's allocation, still zero.
    assert_eq!(child.read_at(&mut buf, 4096).unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0x00));
}

#[test]
fn child_allocation_shadows_backing() {
    let parent = ImageBuilder::new(2, 12, 8192)
        .cluster(0, ClusterKind::Raw(vec![0x11; 4096]))
        .cluster(1, ClusterKind::Raw(vec![0x22; 4096]))
        .open();

    let mut child = ImageBuilder::new(2, 12, 8192)
        .cluster(1, ClusterKind::Raw(vec![0x33; 4096]))
        .open();
    child.set_backing(Some(Arc::new(parent))).unwrap();

    let mut buf = vec![0u8; 8192];
    assert_eq!(child.read_at(&mut buf, 0).unwrap(), 8192);
    assert!(buf[..4096].iter().all(|b| *b == 0x11));
    assert!(buf[4096..].iter().all(|b| *b == 0x33));
}

#[test]
fn implicit_backing_resolution() {
    use qcow::File;

    let dir = tempfile::tempdir().unwrap();

    let parent_bytes = ImageBuilder::new(2, 12, 8192)
        .cluster(0, ClusterKind::Raw(vec![0x5A; 4096]))
        .build();
    std::fs::write(dir.path().join("parent.qcow2"), parent_bytes).unwrap();

    let child_bytes = ImageBuilder::new(2, 12, 8192).backing("parent.qcow2").build();
    std::fs::write(dir.path().join("child.qcow2"), child_bytes).unwrap();

    let mut child = Qcow::<File>::open_path(dir.path().join("child.qcow2")).unwrap();
    assert_eq!(child.backing_filename().unwrap(), "parent.qcow2");
    child.open_implicit_backing().unwrap();

    let mut buf = vec![0u8; 4096];
    assert_eq!(child.read_at(&mut buf, 0).unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0x5A));
}

#[test]
fn backing_loop_is_rejected() {
    use qcow::File;

    let dir = tempfile::tempdir().unwrap();

    // The image names itself as its backing file.
    let bytes = ImageBuilder::new(2, 12, 8192).backing("loop.qcow2").build();
    std::fs::write(dir.path().join("loop.qcow2"), bytes).unwrap();

    let mut image = Qcow::<File>::open_path(dir.path().join("loop.qcow2")).unwrap();
    assert!(matches!(
        image.open_implicit_backing(),
        Err(Error::CorruptTable(_))
    ));
}

#[test]
fn out_of_range_reads_zero_bytes() {
    let image = ImageBuilder::new(2, 16, 128 * 1024)
        .cluster(0, ClusterKind::Raw(vec![0xAB; 64 * 1024]))
        .open();

    let mut buf = vec![0u8; 100];
    assert_eq!(image.read_at(&mut buf, 128 * 1024).unwrap(), 0);
    assert_eq!(image.read_at(&mut buf, u64::MAX).unwrap(), 0);

    // Truncation at end of media.
    let mut buf = vec![0u8; 200];
    assert_eq!(image.read_at(&mut buf, 128 * 1024 - 50).unwrap(), 50);
}

#[test]
fn corrupt_l1_entry_is_localized() {
    // 4 MiB media with 4 KiB clusters: two L1 entries.  The second one
    // points past the end of the file (cluster-aligned).
    let media = 4 * 1024 * 1024u64;
    let bytes = ImageBuilder::new(2, 12, media)
        .cluster(0, ClusterKind::Raw(vec![0xCD; 4096]))
        .override_l1(1, (1 << 63) | 0x4000_0000)
        .build();
    let image = Qcow::open_image(Memory::new(bytes)).unwrap();

    // Clusters under the valid L1 entry read fine.
    let mut buf = vec![0u8; 4096];
    assert_eq!(image.read_at(&mut buf, 0).unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0xCD));

    // Clusters under the corrupt entry fail, without poisoning the rest.
    assert!(matches!(
        image.read_at(&mut buf, 2 * 1024 * 1024),
        Err(Error::CorruptTable(_))
    ));
    assert_eq!(image.read_at(&mut buf, 4096).unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0x00));
}

#[test]
fn v3_zero_cluster() {
    let image = ImageBuilder::new(3, 12, 12288)
        .cluster(0, ClusterKind::Raw(vec![0xEE; 4096]))
        .cluster(1, ClusterKind::Zero)
        .open();
    assert_eq!(image.format_version(), FormatVersion::V3);

    let mut buf = vec![0xFFu8; 12288];
    assert_eq!(image.read_at(&mut buf, 0).unwrap(), 12288);
    assert!(buf[..4096].iter().all(|b| *b == 0xEE));
    assert!(buf[4096..].iter().all(|b| *b == 0x00));
}

#[test]
fn zero_cluster_hides_backing_data() {
    let parent = ImageBuilder::new(3, 12, 4096)
        .cluster(0, ClusterKind::Raw(vec![0x99; 4096]))
        .open();

    let mut child = ImageBuilder::new(3, 12, 4096)
        .cluster(0, ClusterKind::Zero)
        .open();
    child.set_backing(Some(Arc::new(parent))).unwrap();

    let mut buf = vec![0xFFu8; 4096];
    assert_eq!(child.read_at(&mut buf, 0).unwrap(), 4096);
    assert!(buf.iter().all(|b| *b == 0x00));
}

#[test]
fn determinism_across_cache_states() {
    let pattern_a: Vec<u8> = (0..4096).map(|i| (i * 7 % 256) as u8).collect();
    let pattern_b: Vec<u8> = (0..4096).map(|i| (i * 13 % 256) as u8).collect();
    let stream = miniz_oxide::deflate::compress_to_vec(&pattern_b, 6);

    let bytes = ImageBuilder::new(2, 12, 6 * 4096)
        .cluster(0, ClusterKind::Raw(pattern_a.clone()))
        .cluster(2, ClusterKind::Compressed(stream))
        .cluster(4, ClusterKind::Raw(pattern_a.clone()))
        .build();

    let mut expected = vec![0u8; 6 * 4096];
    expected[..4096].copy_from_slice(&pattern_a);
    expected[2 * 4096..3 * 4096].copy_from_slice(&pattern_b);
    expected[4 * 4096..5 * 4096].copy_from_slice(&pattern_a);

    // Tiny caches force constant eviction; results must not change.
    let image = OpenOptions::new()
        .l2_cache_size(1)
        .cluster_cache_size(1)
        .open(Memory::new(bytes))
        .unwrap();

    for _ in 0..3 {
        let mut buf = vec![0xFFu8; 6 * 4096];
        assert_eq!(image.read_at(&mut buf, 0).unwrap(), 6 * 4096);
        assert_eq!(buf, expected);
    }

    // Byte-at-a-time agrees with bulk reads.
    for offset in (0..expected.len()).step_by(577) {
        let mut byte = [0u8; 1];
        assert_eq!(image.read_at(&mut byte, offset as u64).unwrap(), 1);
        assert_eq!(byte[0], expected[offset], "mismatch at offset {offset}");
    }
}

/// Storage wrapper counting reads per offset.
#[derive(Debug)]
struct CountingStorage {
    inner: Memory,
    reads: Arc<Mutex<HashMap<u64, usize>>>,
}

impl CountingStorage {
    fn new(bytes: Vec<u8>) -> (Self, Arc<Mutex<HashMap<u64, usize>>>) {
        let reads = Arc::new(Mutex::new(HashMap::new()));
        let storage = CountingStorage {
            inner: Memory::new(bytes),
            reads: Arc::clone(&reads),
        };
        (storage, reads)
    }
}

impl fmt::Display for CountingStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "counting[{}]", self.inner)
    }
}

impl Storage for CountingStorage {
    fn size(&self) -> qcow::Result<u64> {
        self.inner.size()
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> qcow::Result<usize> {
        *self.reads.lock().unwrap().entry(offset).or_insert(0) += 1;
        self.inner.read_at(buf, offset)
    }
}

#[test]
fn single_flight_loads_once() {
    let bytes = ImageBuilder::new(2, 12, 8192)
        .cluster(0, ClusterKind::Raw(vec![0x42; 4096]))
        .build();

    let (storage, reads) = CountingStorage::new(bytes);
    let image = Qcow::open_image(storage).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let mut buf = vec![0u8; 4096];
                assert_eq!(image.read_at(&mut buf, 0).unwrap(), 4096);
                assert!(buf.iter().all(|b| *b == 0x42));
            });
        }
    });

    // L2 table lives at cluster 2, the data cluster at cluster 3; each must
    // have been fetched exactly once despite eight concurrent readers.
    let reads = reads.lock().unwrap();
    assert_eq!(reads.get(&(2 * 4096)), Some(&1));
    assert_eq!(reads.get(&(3 * 4096)), Some(&1));
}

#[test]
fn media_reader_seek_and_read() {
    let image = ImageBuilder::new(2, 12, 8192)
        .cluster(0, ClusterKind::Raw(vec![0x10; 4096]))
        .cluster(1, ClusterKind::Raw(vec![0x20; 4096]))
        .open();

    let mut reader = image.media_reader();
    let mut buf = vec![0u8; 6000];
    reader.read_exact(&mut buf).unwrap();
    assert!(buf[..4096].iter().all(|b| *b == 0x10));
    assert!(buf[4096..].iter().all(|b| *b == 0x20));

    assert_eq!(reader.seek(SeekFrom::End(-8)).unwrap(), 8184);
    let mut tail = Vec::new();
    reader.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, vec![0x20; 8]);

    assert_eq!(reader.seek(SeekFrom::Start(4090)).unwrap(), 4090);
    let mut buf = [0u8; 12];
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..6], &[0x10; 6]);
    assert_eq!(&buf[6..], &[0x20; 6]);
}

#[test]
fn abort_cancels_reads() {
    let image = ImageBuilder::new(2, 12, 8192)
        .cluster(0, ClusterKind::Raw(vec![0x42; 4096]))
        .open();

    image.abort();
    let mut buf = vec![0u8; 512];
    assert!(matches!(image.read_at(&mut buf, 0), Err(Error::Cancelled)));

    image.clear_abort();
    assert_eq!(image.read_at(&mut buf, 0).unwrap(), 512);
}

#[test]
fn snapshot_metadata() {
    let image = ImageBuilder::new(2, 12, 4096)
        .snapshot_record(snapshot_record("1", "before-upgrade"))
        .snapshot_record(snapshot_record("2", "after-upgrade"))
        .open();

    assert_eq!(image.snapshot_count(), 2);
    assert_eq!(image.snapshot(0).unwrap().name(), "before-upgrade");
    assert_eq!(image.snapshot(1).unwrap().id(), "2");
    assert_eq!(image.snapshot(0).unwrap().creation_time().0, 1_700_000_000);
    assert!(image.snapshot(2).is_none());
}

#[test]
fn probe_detects_signature() {
    let bytes = ImageBuilder::new(2, 12, 4096).build();
    assert!(Qcow::probe(&Memory::new(bytes)).is_ok());
    assert!(matches!(
        Qcow::probe(&Memory::new(vec![0u8; 512])),
        Err(Error::InvalidSignature)
    ));
}

/// Build a v1 image: 48-byte header, L1 right after it, L2 in cluster 1,
/// data from cluster 2.
fn build_v1_image(media_size: u64, raw: Option<Vec<u8>>, compressed: Option<Vec<u8>>) -> Vec<u8> {
    let cb = 12u32;
    let cs = 1usize << cb;
    let l2_bits = 9u32;

    let mut file = vec![0u8; 2 * cs];
    let mut l2 = vec![0u64; 1 << l2_bits];

    if let Some(data) = raw {
        let offset = file.len() as u64;
        file.extend_from_slice(&data);
        file.resize(file.len().next_multiple_of(cs), 0);
        l2[0] = offset;
    }
    if let Some(stream) = compressed {
        // Placed last and unpadded: the stream may run to end of file.
        let offset = file.len() as u64;
        file.extend_from_slice(&stream);
        l2[1] = (1 << 63) | offset;
    }

    for (i, entry) in l2.iter().enumerate() {
        file[cs + i * 8..cs + i * 8 + 8].copy_from_slice(&entry.to_be_bytes());
    }

    // L1 with a single entry at offset 48, pointing at cluster 1.
    file[48..56].copy_from_slice(&(cs as u64).to_be_bytes());

    let mut header = Vec::new();
    header.extend_from_slice(&MAGIC.to_be_bytes());
    header.extend_from_slice(&1u32.to_be_bytes());
    header.extend_from_slice(&0u64.to_be_bytes()); // backing_file_offset
    header.extend_from_slice(&0u32.to_be_bytes()); // backing_file_size
    header.extend_from_slice(&0u32.to_be_bytes()); // modification_time
    header.extend_from_slice(&media_size.to_be_bytes());
    header.push(cb as u8);
    header.push(l2_bits as u8);
    header.extend_from_slice(&0u16.to_be_bytes());
    header.extend_from_slice(&0u32.to_be_bytes()); // crypt_method
    header.extend_from_slice(&48u64.to_be_bytes()); // l1_table_offset
    file[..header.len()].copy_from_slice(&header);

    file
}

#[test]
fn v1_raw_and_compressed() {
    let pattern: Vec<u8> = (0..4096).map(|i| (i * 3 % 256) as u8).collect();
    let stream = miniz_oxide::deflate::compress_to_vec(&pattern, 6);

    let bytes = build_v1_image(3 * 4096, Some(vec![0x77; 4096]), Some(stream));
    let image = Qcow::open_image(Memory::new(bytes)).unwrap();
    assert_eq!(image.format_version(), FormatVersion::V1);
    assert_eq!(image.media_size(), 3 * 4096);

    let mut buf = vec![0u8; 3 * 4096];
    assert_eq!(image.read_at(&mut buf, 0).unwrap(), 3 * 4096);
    assert!(buf[..4096].iter().all(|b| *b == 0x77));
    assert_eq!(&buf[4096..8192], &pattern[..]);
    assert!(buf[8192..].iter().all(|b| *b == 0x00));
}
