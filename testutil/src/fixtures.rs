/// Fixtures shared by consensus tests

use std::sync::Once;

/// Smallest validator set tolerating one Byzantine member (n = 3f + 1, f = 1)
pub const SMALL_COMMITTEE: usize = 4;

/// Validator set tolerating two Byzantine members (f = 2)
pub const MEDIUM_COMMITTEE: usize = 7;

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber driven by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic 32-byte secret seed for validator `index`.
///
/// Seeds start at 1 so every seed is a valid secp256k1 scalar and
/// long enough for BLS key generation.
pub fn validator_seed(index: usize) -> [u8; 32] {
    let mut seed = [0u8; 32];
    seed[0] = 0x5a;
    seed[24..].copy_from_slice(&((index as u64) + 1).to_be_bytes());
    seed
}

/// Maximum tolerated Byzantine validators for `n` validators
pub fn max_faulty(n: usize) -> usize {
    (n - 1) / 3
}

/// Quorum size (2f + 1) for `n` validators
pub fn quorum_size(n: usize) -> usize {
    2 * max_faulty(n) + 1
}
