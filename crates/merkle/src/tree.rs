//! Binary hash tree over an ordered run of leaf digests.
//!
//! The tree is rebuilt wholesale whenever the data under it changes; nothing
//! here mutates in place. Levels pair adjacent nodes bottom-up and an odd
//! trailing node moves up unchanged, so every leaf count has exactly one
//! shape.
//!
//! ## Encoding
//!
//! ```text
//! u32 le leaf count || leaf digests (32 bytes each, in order)
//! ```
//!
//! Internal levels are never encoded; the receiving side rebuilds them with
//! its own [`Hasher`].

use flotilla_primitives::digest::Digest;
use thiserror::Error;

use crate::hash::Hasher;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TreeError {
    #[error("tree encoding truncated: needed {expected} bytes, had {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("tree encoding carries {extra} trailing bytes")]
    TrailingBytes { extra: usize },
}

/// A computed hash tree.
#[derive(Clone, Debug)]
pub struct HashTree {
    /// Per-level digests, bottom-up: `levels[0]` holds the leaves, the last
    /// level the root. An empty tree keeps its single empty level.
    levels: Vec<Vec<Digest>>,
}

impl HashTree {
    /// Build a tree over `leaves`, preserving their order.
    #[must_use]
    pub fn build(leaves: Vec<Digest>, hasher: &dyn Hasher) -> Self {
        let mut levels = vec![leaves];

        while levels[levels.len() - 1].len() > 1 {
            let next = build_level(&levels[levels.len() - 1], hasher);
            levels.push(next);
        }

        Self { levels }
    }

    /// The root digest; the zero digest for an empty tree.
    #[must_use]
    pub fn root(&self) -> Digest {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or(Digest::ZERO)
    }

    #[must_use]
    pub fn leaves(&self) -> &[Digest] {
        self.levels.first().map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaves().len()
    }

    /// Number of levels, leaves included. An empty tree has height 1.
    #[must_use]
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// Encode for the wire: leaf count plus the leaf digests.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let leaves = self.leaves();
        let mut out = Vec::with_capacity(4 + leaves.len() * Digest::LEN);

        out.extend_from_slice(&(leaves.len() as u32).to_le_bytes());
        for leaf in leaves {
            out.extend_from_slice(leaf.as_bytes());
        }

        out
    }

    /// Decode an encoded tree and rebuild its internal levels.
    pub fn from_bytes(bytes: &[u8], hasher: &dyn Hasher) -> Result<Self, TreeError> {
        let Some(header) = bytes.get(..4) else {
            return Err(TreeError::Truncated {
                expected: 4,
                actual: bytes.len(),
            });
        };

        let count = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let body = &bytes[4..];
        let expected = count.checked_mul(Digest::LEN).ok_or(TreeError::Truncated {
            expected: usize::MAX,
            actual: body.len(),
        })?;

        if body.len() < expected {
            return Err(TreeError::Truncated {
                expected,
                actual: body.len(),
            });
        }

        if body.len() > expected {
            return Err(TreeError::TrailingBytes {
                extra: body.len() - expected,
            });
        }

        let leaves = body
            .chunks_exact(Digest::LEN)
            .map(|chunk| {
                let mut bytes = [0_u8; Digest::LEN];
                bytes.copy_from_slice(chunk);
                Digest::from(bytes)
            })
            .collect();

        Ok(Self::build(leaves, hasher))
    }

    /// Indices of leaves that differ from `other`, ascending.
    ///
    /// Equal roots answer without descending. Trees of equal leaf count share
    /// a shape, so divergence walks down from the root and skips any subtree
    /// whose digests agree. Trees of unequal leaf count fall back to a
    /// positional scan over the shared prefix, with the whole tail of the
    /// longer side reported as divergent.
    #[must_use]
    pub fn diff(&self, other: &Self) -> Vec<usize> {
        if self.root() == other.root() {
            return Vec::new();
        }

        if self.leaf_count() != other.leaf_count() {
            return self.diff_positional(other);
        }

        let mut divergent = Vec::new();
        self.descend(other, self.levels.len() - 1, 0, &mut divergent);
        divergent
    }

    fn descend(&self, other: &Self, level: usize, index: usize, divergent: &mut Vec<usize>) {
        if self.levels[level][index] == other.levels[level][index] {
            return;
        }

        if level == 0 {
            divergent.push(index);
            return;
        }

        let below = level - 1;
        let left = index * 2;
        self.descend(other, below, left, divergent);
        if left + 1 < self.levels[below].len() {
            self.descend(other, below, left + 1, divergent);
        }
    }

    fn diff_positional(&self, other: &Self) -> Vec<usize> {
        let ours = self.leaves();
        let theirs = other.leaves();
        let shared = ours.len().min(theirs.len());

        let mut divergent: Vec<usize> = (0..shared)
            .filter(|&index| ours[index] != theirs[index])
            .collect();
        divergent.extend(shared..ours.len().max(theirs.len()));
        divergent
    }
}

fn build_level(below: &[Digest], hasher: &dyn Hasher) -> Vec<Digest> {
    let mut level = Vec::with_capacity(below.len().div_ceil(2));

    for pair in below.chunks(2) {
        if let [left, right] = pair {
            let mut buf = [0_u8; Digest::LEN * 2];
            buf[..Digest::LEN].copy_from_slice(left.as_bytes());
            buf[Digest::LEN..].copy_from_slice(right.as_bytes());
            level.push(hasher.digest(&buf));
        } else {
            // Odd node out: promote unchanged.
            level.push(pair[0]);
        }
    }

    level
}
