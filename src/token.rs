//! Entry identity tokens.
//!
//! Every generation of a record at a given key carries a random 128-bit
//! token. A handle that survived a doom/recreate cycle holds the old token,
//! so its deferred deletion can never touch the freshly created record.
//!
//! The token is persisted as two signed 64-bit column halves. The all-zero
//! bit pattern is reserved as "invalid / uninitialized": it is never
//! generated, and reading it back from storage is treated as corruption.

use std::fmt;

use uuid::Uuid;

/// A 128-bit unguessable identity token for one generation of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryToken {
    high: u64,
    low: u64,
}

impl EntryToken {
    /// Generate a fresh random token.
    ///
    /// Random v4 UUIDs carry 122 random bits, so the all-zero pattern
    /// cannot be produced here.
    pub fn generate() -> Self {
        let (high, low) = Uuid::new_v4().as_u64_pair();
        Self { high, low }
    }

    /// Reconstruct a token from its two stored halves.
    ///
    /// Returns `None` for the all-zero pattern, the only bit pattern that
    /// does not denote a valid token.
    pub fn from_halves(high: u64, low: u64) -> Option<Self> {
        if high == 0 && low == 0 {
            None
        } else {
            Some(Self { high, low })
        }
    }

    /// High 64 bits, as persisted.
    pub fn high(&self) -> u64 {
        self.high
    }

    /// Low 64 bits, as persisted.
    pub fn low(&self) -> u64 {
        self.low
    }
}

impl fmt::Display for EntryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_never_zero() {
        for _ in 0..64 {
            let token = EntryToken::generate();
            assert!(token.high() != 0 || token.low() != 0);
        }
    }

    #[test]
    fn test_generate_is_unguessable_enough() {
        let a = EntryToken::generate();
        let b = EntryToken::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_halves_rejects_zero() {
        assert!(EntryToken::from_halves(0, 0).is_none());
        assert!(EntryToken::from_halves(1, 0).is_some());
        assert!(EntryToken::from_halves(0, 1).is_some());
    }

    #[test]
    fn test_halves_round_trip() {
        let token = EntryToken::generate();
        let restored = EntryToken::from_halves(token.high(), token.low())
            .expect("generated token round-trips");
        assert_eq!(token, restored);
    }
}
