use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};

/// Width of a node hash on the wire.
pub const HASH_LENGTH: usize = 32;

/// Opaque node hash. Equality is the only operation reconnect relies on.
#[derive(Clone, Copy, Eq, Hash, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    /// Sentinel sent with the root request, and the hash a learner reports
    /// for paths its original tree never had.
    pub const EMPTY: Self = Self([0; HASH_LENGTH]);

    #[must_use]
    pub const fn new(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated, full hashes drown trace output.
        write!(f, "Hash({}..)", hex::encode(&self.0[..4]))
    }
}
