//! Hash-tree machinery for catalog anti-entropy.
//!
//! [`hash`] holds the digest seam and the registry's weak mixing function,
//! [`tree`] the binary hash tree replicas exchange to spot divergence.

pub mod hash;
pub mod tree;
