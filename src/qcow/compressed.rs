//! Decompression of compressed clusters.

use super::types::HostOffset;
use crate::{Error, Result};
use miniz_oxide::inflate::core::{decompress as inflate, DecompressorOxide};
use miniz_oxide::inflate::TINFLStatus;

/// Inflate one compressed cluster.
///
/// `compressed` holds the raw deflate stream (no zlib wrapper) as read from
/// `host_offset`.  Returns a buffer of exactly `cluster_size` bytes; if the
/// stream produces less output, the tail is zero.
///
/// The recorded compressed length is an upper bound that usually overshoots
/// the actual stream, so both "output full" and a premature end of input
/// are expected terminations.
pub(super) fn inflate_cluster(
    compressed: &[u8],
    cluster_size: usize,
    host_offset: HostOffset,
) -> Result<Box<[u8]>> {
    let mut buf = vec![0u8; cluster_size];

    let mut dec_ox = DecompressorOxide::new();
    let (status, _read, _written) = inflate(&mut dec_ox, compressed, &mut buf, 0, 0);

    match status {
        TINFLStatus::Done | TINFLStatus::HasMoreOutput | TINFLStatus::NeedsMoreInput => {
            Ok(buf.into_boxed_slice())
        }
        status => Err(Error::DecompressionFailed(format!(
            "host offset {host_offset}+{}: {status:?}",
            compressed.len()
        ))),
    }
}
