//! The media read path.

use super::cache::{ClusterLoad, ClusterLoadKind};
use super::mappings::ClusterMapping;
use super::types::GuestOffset;
use super::Qcow;
use crate::{Error, Result, Storage};
use std::cmp;
use std::io::{self, Read, Seek, SeekFrom};

impl<S: Storage> Qcow<S> {
    /// Read from the media into `buf`, starting at media offset `offset`.
    ///
    /// Returns the number of bytes read.  Reads are truncated at the end of
    /// the media and only there; a read starting at or beyond it returns 0.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let media_size = self.header.size();
        if offset >= media_size {
            return Ok(0);
        }

        if self.encryption_method() == super::EncryptionMethod::Aes && self.cipher.read().is_none()
        {
            return Err(Error::EncryptionRequired);
        }

        let len = cmp::min(buf.len() as u64, media_size - offset) as usize;
        let mut remaining = &mut buf[..len];
        let mut pos = offset;

        let cb = self.header.cluster_bits();

        while !remaining.is_empty() {
            self.check_abort()?;

            let guest_offset = GuestOffset(pos);
            let guest_cluster = guest_offset.cluster(cb);
            let in_cluster = guest_offset.in_cluster_offset(cb);
            let chunk_len =
                cmp::min(remaining.len() as u64, guest_offset.remaining_in_cluster(cb)) as usize;
            let (chunk, rest) = std::mem::take(&mut remaining).split_at_mut(chunk_len);

            match self.get_mapping(guest_cluster)? {
                ClusterMapping::Zero => chunk.fill(0),

                ClusterMapping::Unallocated => match self.backing.as_ref() {
                    Some(backing) => {
                        // The backing media may end before this one; what
                        // it does not cover reads as zero.
                        let n = backing.read_at(chunk, pos)?;
                        chunk[n..].fill(0);
                    }
                    None => chunk.fill(0),
                },

                ClusterMapping::Raw { host_offset } => {
                    let load = ClusterLoad {
                        kind: ClusterLoadKind::Raw,
                        first_sector: guest_cluster.first_sector(cb),
                    };
                    let block = self.cluster_cache.get_or_insert(host_offset, &load)?;
                    chunk.copy_from_slice(&block[in_cluster..in_cluster + chunk_len]);
                }

                ClusterMapping::Compressed {
                    host_offset,
                    length,
                } => {
                    let load = ClusterLoad {
                        kind: ClusterLoadKind::Compressed { length },
                        first_sector: guest_cluster.first_sector(cb),
                    };
                    let block = self.cluster_cache.get_or_insert(host_offset, &load)?;
                    chunk.copy_from_slice(&block[in_cluster..in_cluster + chunk_len]);
                }
            }

            pos += chunk_len as u64;
            remaining = rest;
        }

        Ok(len)
    }

    /// Return a sequential reader over the media.
    pub fn media_reader(&self) -> MediaReader<'_, S> {
        MediaReader {
            image: self,
            position: 0,
        }
    }
}

/// Sequential `io::Read`/`io::Seek` view of an image's media.
///
/// Multiple independent readers may exist over the same image; each carries
/// only its own position.
#[derive(Debug)]
pub struct MediaReader<'a, S: Storage> {
    /// Underlying image.
    image: &'a Qcow<S>,

    /// Current media offset.
    position: u64,
}

impl<S: Storage> MediaReader<'_, S> {
    /// Current media offset.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl<S: Storage> Read for MediaReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .image
            .read_at(buf, self.position)
            .map_err(io::Error::other)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<S: Storage> Seek for MediaReader<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let media_size = self.image.media_size();
        let new_position = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => media_size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        match new_position {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                Error::OutOfRange,
            )),
        }
    }
}
