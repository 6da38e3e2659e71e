#[cfg(test)]
#[path = "tests/digest.rs"]
mod tests;

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use thiserror::Error;

const BYTES_LEN: usize = 32;

/// Fixed-width digest produced by the registry's hash layer.
///
/// Digests compare and sort as raw byte strings and render as lowercase hex.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    bytes: [u8; BYTES_LEN],
}

impl Digest {
    pub const LEN: usize = BYTES_LEN;

    /// The all-zeroes digest, used as the root of an empty tree.
    pub const ZERO: Self = Self {
        bytes: [0; BYTES_LEN],
    };

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BYTES_LEN] {
        &self.bytes
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; BYTES_LEN] {
        self.bytes
    }
}

impl From<[u8; BYTES_LEN]> for Digest {
    fn from(bytes: [u8; BYTES_LEN]) -> Self {
        Self { bytes }
    }
}

impl From<Digest> for [u8; BYTES_LEN] {
    fn from(digest: Digest) -> Self {
        digest.bytes
    }
}

impl Deref for Digest {
    type Target = [u8; BYTES_LEN];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&hex::encode(self.bytes))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Digest").field(&hex::encode(self.bytes)).finish()
    }
}

#[derive(Clone, Copy, Debug, Error)]
pub enum Error {
    #[error("invalid digest length")]
    InvalidLength,

    #[error("invalid hex")]
    DecodeError(#[from] hex::FromHexError),
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != BYTES_LEN * 2 {
            return Err(Error::InvalidLength);
        }

        let mut bytes = [0; BYTES_LEN];
        hex::decode_to_slice(s, &mut bytes)?;

        Ok(Self { bytes })
    }
}
