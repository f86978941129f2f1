// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Upload digests: SHA256 by default, CRC32 when the device negotiated `updatehash`

use sha2::{Digest, Sha256};

/// Request header naming the digest algorithm the device should compute.
pub const UPDATE_HASH_HEADER: &str = "x-gokrazy-update-hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateHash {
    /// Understood by every device generation.
    #[default]
    Sha256,
    /// Much faster; only sent to devices advertising `updatehash`.
    Crc32,
}

impl UpdateHash {
    /// Value for [`UPDATE_HASH_HEADER`]. SHA256 is implied when the header is absent.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            Self::Sha256 => None,
            Self::Crc32 => Some("crc32"),
        }
    }

    pub fn hasher(self) -> Checksum {
        match self {
            Self::Sha256 => Checksum::Sha256(Sha256::new()),
            Self::Crc32 => Checksum::Crc32(crc32fast::Hasher::new()),
        }
    }
}

/// Running digest over the bytes handed to the transport.
#[derive(Clone)]
pub enum Checksum {
    Sha256(Sha256),
    Crc32(crc32fast::Hasher),
}

impl std::fmt::Debug for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sha256(_) => f.write_str("Checksum::Sha256"),
            Self::Crc32(_) => f.write_str("Checksum::Crc32"),
        }
    }
}

impl Checksum {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(data),
            Self::Crc32(hasher) => hasher.update(data),
        }
    }

    /// Digest of everything fed so far. CRC32 renders as 4 big-endian bytes,
    /// which is what the device hex-encodes in its reply.
    pub fn digest(&self) -> Vec<u8> {
        match self {
            Self::Sha256(hasher) => hasher.clone().finalize().to_vec(),
            Self::Crc32(hasher) => hasher.clone().finalize().to_be_bytes().to_vec(),
        }
    }
}

/// Digest of a complete buffer, hex-encoded the way the device reports it.
pub fn hex_digest(algorithm: UpdateHash, data: &[u8]) -> String {
    let mut checksum = algorithm.hasher();
    checksum.update(data);
    hex::encode(checksum.digest())
}
