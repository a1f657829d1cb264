//! Deterministic state hashing.
//!
//! FNV-1a 64-bit over little-endian encodings. Floating point values are
//! canonicalized before hashing so that `-0.0` and `+0.0` (and every NaN
//! payload) hash identically on every peer.

/// FNV-1a 64-bit offset basis.
const FNV1A_OFFSET_BASIS: u64 = 0xcbf29ce484222325;

/// FNV-1a 64-bit prime.
const FNV1A_PRIME: u64 = 0x100000001b3;

/// Incremental hasher used for turn digests and scene digests.
#[derive(Debug, Clone)]
pub struct StateHasher {
    state: u64,
}

impl Default for StateHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHasher {
    pub fn new() -> Self {
        Self {
            state: FNV1A_OFFSET_BASIS,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV1A_PRIME);
        }
    }

    pub fn update_u64(&mut self, value: u64) {
        self.update(&value.to_le_bytes());
    }

    pub fn update_u32(&mut self, value: u32) {
        self.update(&value.to_le_bytes());
    }

    pub fn update_f64(&mut self, value: f64) {
        self.update_u64(canonicalize_f64(value));
    }

    /// Hash a length-prefixed byte string, so that adjacent fields cannot
    /// alias each other.
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.update_u64(bytes.len() as u64);
        self.update(bytes);
    }

    pub fn finish(self) -> u64 {
        self.state
    }
}

/// Canonicalize an f64 value for deterministic hashing.
///
/// - `-0.0` → `+0.0`
/// - Any NaN → quiet NaN bit pattern `0x7ff8000000000000`
fn canonicalize_f64(value: f64) -> u64 {
    const QUIET_NAN_BITS: u64 = 0x7ff8000000000000;

    if value.is_nan() {
        QUIET_NAN_BITS
    } else if value == 0.0 {
        0u64
    } else {
        value.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vector() {
        // FNV-1a 64 of "a"
        let mut hasher = StateHasher::new();
        hasher.update(b"a");
        assert_eq!(hasher.finish(), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_signed_zero_and_nan_canonicalized() {
        let hash = |v: f64| {
            let mut h = StateHasher::new();
            h.update_f64(v);
            h.finish()
        };
        assert_eq!(hash(0.0), hash(-0.0));
        assert_eq!(hash(f64::NAN), hash(-f64::NAN));
        assert_ne!(hash(1.0), hash(-1.0));
    }

    #[test]
    fn test_length_prefix_prevents_aliasing() {
        let mut a = StateHasher::new();
        a.update_bytes(b"ab");
        a.update_bytes(b"c");

        let mut b = StateHasher::new();
        b.update_bytes(b"a");
        b.update_bytes(b"bc");

        assert_ne!(a.finish(), b.finish());
    }
}
