//! Decryption of AES-encrypted clusters.
//!
//! Encrypted images apply AES-128-CBC independently to each 512-byte sector
//! of the media.  The IV for a sector is the sector's *logical* index (media
//! offset divided by 512) encoded little-endian into the first 8 bytes of a
//! zeroed 16-byte block, regardless of where the sector is stored
//! physically.

use crate::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;
use std::fmt::{self, Debug, Formatter};

/// Encryption granularity in bytes.
pub(crate) const SECTOR_SIZE: usize = 512;

/// log2 of [`SECTOR_SIZE`].
pub(crate) const SECTOR_SHIFT: u32 = 9;

/// AES-128 key length in bytes.
const KEY_SIZE: usize = 16;

/// AES block length in bytes.
const BLOCK_SIZE: usize = 16;

/// Cipher context for an encrypted image.
///
/// Holds only the AES key schedule; decryption takes `&self` and keeps all
/// per-sector state on the stack, so the context can be shared by many
/// concurrent readers.
pub(crate) struct SectorCipher {
    /// AES-128 key schedule.
    cipher: Aes128,
}

impl SectorCipher {
    /// Derive the cipher from a password.
    ///
    /// The password bytes are copied into a zeroed 16-byte key, truncated at
    /// 16 bytes.  This matches what QEMU does for AES-encrypted images, so
    /// any password QEMU accepts decrypts the same way here.
    pub fn from_password(password: &[u8]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        let len = password.len().min(KEY_SIZE);
        key[..len].copy_from_slice(&password[..len]);
        SectorCipher {
            cipher: Aes128::new(GenericArray::from_slice(&key)),
        }
    }

    /// Use the given raw key material directly.
    pub fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(Error::InvalidKey(format!(
                "expected a {KEY_SIZE}-byte AES key, got {} bytes",
                key.len()
            )));
        }
        Ok(SectorCipher {
            cipher: Aes128::new(GenericArray::from_slice(key)),
        })
    }

    /// Decrypt whole sectors in place.
    ///
    /// `buf` must be a multiple of the sector size; `first_sector` is the
    /// logical index of its first sector.
    pub fn decrypt_sectors(&self, buf: &mut [u8], first_sector: u64) {
        debug_assert!(buf.len() % SECTOR_SIZE == 0);

        for (i, sector) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.decrypt_sector(sector, first_sector.wrapping_add(i as u64));
        }
    }

    /// CBC-decrypt one sector with the IV derived from its logical index.
    fn decrypt_sector(&self, sector: &mut [u8], sector_index: u64) {
        let mut prev = [0u8; BLOCK_SIZE];
        prev[..8].copy_from_slice(&sector_index.to_le_bytes());

        for block in sector.chunks_exact_mut(BLOCK_SIZE) {
            let mut saved = [0u8; BLOCK_SIZE];
            saved.copy_from_slice(block);

            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(block));
            for (b, p) in block.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }

            prev = saved;
        }
    }
}

impl Debug for SectorCipher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorCipher").finish_non_exhaustive()
    }
}
