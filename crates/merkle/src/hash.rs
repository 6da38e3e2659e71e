use flotilla_primitives::digest::Digest;

/// Produces the fixed-width digests the hash tree is built from.
///
/// The tree and the sync engine only ever see this trait, so the mixing
/// function can be swapped without touching either.
pub trait Hasher: Send + Sync {
    fn digest(&self, input: &[u8]) -> Digest;
}

/// The registry's weak mixing digest.
///
/// Folds the input into a 32-byte accumulator: each input byte is XORed into
/// its slot (`i % 32`), the slot is rotated right by one bit, then XORed with
/// the position-derived byte `(i * 31) mod 256`. Collision-prone on purpose
/// and cheap; detecting drift between cooperating replicas does not need a
/// cryptographic hash.
#[derive(Clone, Copy, Debug, Default)]
pub struct FoldHasher;

impl Hasher for FoldHasher {
    fn digest(&self, input: &[u8]) -> Digest {
        let mut acc = [0_u8; Digest::LEN];

        for (i, byte) in input.iter().enumerate() {
            let slot = i % Digest::LEN;
            acc[slot] ^= *byte;
            acc[slot] = acc[slot].rotate_right(1);
            acc[slot] ^= ((i % 256) as u8).wrapping_mul(31);
        }

        Digest::from(acc)
    }
}
