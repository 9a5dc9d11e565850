/// Cryptography for the consensus core
///
/// Implements:
/// - BLS vote shares aggregated into one signature per QC
/// - Recoverable ECDSA signatures for message envelopes
/// - Hashes and validator addresses

pub mod bls;
pub mod ecdsa;
pub mod hash;

pub use bls::{
    threshold_combine, threshold_sign, threshold_verify, BLSError, BLSKeyPair,
    BLSPartialSignature, BLSPublicKey, BLSSecretKey, BLSSignature,
};
pub use ecdsa::{
    recover_address, sign as ecdsa_sign, ECDSAError, ECDSAPublicKey, ECDSASecretKey,
    ECDSASignature,
};
pub use hash::{hash_concat, hash_data, hash_data_with, Address, Hash, HashFunction};
