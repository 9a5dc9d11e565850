/// Test data generators

use proptest::prelude::*;
use rand::Rng;

/// Generate random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// Generate a random block payload for testing
pub fn random_payload() -> Vec<u8> {
    random_bytes(32)
}

/// Generate a random 20-byte account address
pub fn random_address_bytes() -> [u8; 20] {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill(&mut bytes);
    bytes
}

/// Strategy producing (height, round) pairs in a range that keeps
/// exponential round timeouts small enough to reason about.
pub fn view_strategy() -> impl Strategy<Value = (u64, u64)> {
    (0u64..1_000, 0u64..64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_length() {
        assert_eq!(random_bytes(0).len(), 0);
        assert_eq!(random_bytes(48).len(), 48);
    }

    #[test]
    fn test_random_payloads_differ() {
        // 32 random bytes colliding is not a realistic outcome
        assert_ne!(random_payload(), random_payload());
    }
}
