/// BLS vote shares and aggregated quorum signatures
///
/// Based on BLS12-381 (`blst::min_pk`), providing:
/// - Constant-size signatures (96 bytes compressed)
/// - One aggregated signature per QC, verified against the signers' keys
/// - k-of-n quorum aggregation (k = 2f+1, n = 3f+1)

use blst::min_pk::{
    AggregatePublicKey, AggregateSignature, PublicKey as BlstPublicKey,
    SecretKey as BlstSecretKey, Signature as BlstSignature,
};
use blst::BLST_ERROR;
use thiserror::Error;

pub const BLS_SIGNATURE_SIZE: usize = 96;
pub const BLS_PUBLIC_KEY_SIZE: usize = 48;
pub const BLS_SECRET_KEY_SIZE: usize = 32;

/// Domain separation tag for vote signatures
const VOTE_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_HOTSTUFF_VOTE";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BLSError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Insufficient signatures: need {needed}, got {got}")]
    InsufficientSignatures { needed: usize, got: usize },
    #[error("Duplicate signature share from signer {0}")]
    DuplicateShare(u32),
    #[error("Invalid key")]
    InvalidKey,
    #[error("Signature verification failed")]
    VerificationFailed,
}

/// BLS secret key wrapper
#[derive(Clone)]
pub struct BLSSecretKey {
    inner: BlstSecretKey,
}

impl BLSSecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Result<Self, BLSError> {
        let mut ikm = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut ikm);
        Self::from_seed(&ikm)
    }

    /// Derive a key from at least 32 bytes of input key material
    pub fn from_seed(ikm: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSecretKey::key_gen(ikm, &[]).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSecretKey::from_bytes(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> BLSPublicKey {
        BLSPublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }
}

/// BLS public key wrapper
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BLSPublicKey {
    inner: BlstPublicKey,
}

impl BLSPublicKey {
    /// Create from compressed bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstPublicKey::from_bytes(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Serialize to compressed bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }
}

/// BLS signature wrapper: a single vote share or an aggregate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BLSSignature {
    inner: BlstSignature,
}

impl BLSSignature {
    /// Create from compressed bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSignature::from_bytes(bytes).map_err(|_| BLSError::InvalidSignature)?;
        Ok(Self { inner })
    }

    /// Serialize to compressed bytes (always 96 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }
}

/// Signature share from a single validator, tagged with its index in the set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BLSPartialSignature {
    pub signature: BLSSignature,
    pub signer: u32,
}

/// BLS key pair (secret + public key)
#[derive(Clone)]
pub struct BLSKeyPair {
    pub secret_key: BLSSecretKey,
    pub public_key: BLSPublicKey,
}

impl BLSKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Result<Self, BLSError> {
        Ok(Self::from_secret(BLSSecretKey::generate()?))
    }

    /// Deterministic key pair from a seed
    pub fn from_seed(ikm: &[u8]) -> Result<Self, BLSError> {
        Ok(Self::from_secret(BLSSecretKey::from_seed(ikm)?))
    }

    fn from_secret(secret_key: BLSSecretKey) -> Self {
        let public_key = secret_key.public_key();
        Self { secret_key, public_key }
    }
}

/// Sign a vote payload, producing this validator's share
pub fn threshold_sign(secret_key: &BLSSecretKey, message: &[u8]) -> BLSSignature {
    BLSSignature {
        inner: secret_key.inner.sign(message, VOTE_DST, &[]),
    }
}

/// Aggregate at least `k` shares into one signature.
///
/// Shares must come from distinct signers. Returns the aggregate together
/// with the sorted signer indices the verifier needs to rebuild the
/// aggregate public key.
pub fn threshold_combine(
    partial_sigs: &[BLSPartialSignature],
    k: usize,
) -> Result<(BLSSignature, Vec<u32>), BLSError> {
    if partial_sigs.len() < k {
        return Err(BLSError::InsufficientSignatures {
            needed: k,
            got: partial_sigs.len(),
        });
    }

    let mut signers: Vec<u32> = partial_sigs.iter().map(|ps| ps.signer).collect();
    signers.sort_unstable();
    if let Some(dup) = signers.windows(2).find(|w| w[0] == w[1]) {
        return Err(BLSError::DuplicateShare(dup[0]));
    }

    let sigs: Vec<&BlstSignature> = partial_sigs.iter().map(|ps| &ps.signature.inner).collect();
    let combined = AggregateSignature::aggregate(&sigs, true)
        .map_err(|_| BLSError::InvalidSignature)?
        .to_signature();

    Ok((BLSSignature { inner: combined }, signers))
}

/// Verify a share or aggregate against the public keys of its signers
pub fn threshold_verify(
    message: &[u8],
    signature: &BLSSignature,
    public_keys: &[&BLSPublicKey],
) -> Result<(), BLSError> {
    if public_keys.is_empty() {
        return Err(BLSError::InsufficientSignatures { needed: 1, got: 0 });
    }

    let pks: Vec<&BlstPublicKey> = public_keys.iter().map(|pk| &pk.inner).collect();
    let aggregated_pk = AggregatePublicKey::aggregate(&pks, true)
        .map_err(|_| BLSError::InvalidKey)?
        .to_public_key();

    match signature
        .inner
        .verify(true, message, VOTE_DST, &[], &aggregated_pk, true)
    {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        _ => Err(BLSError::VerificationFailed),
    }
}


// Validator sets are configured with public keys, so they serialize as raw bytes
impl serde::Serialize for BLSPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for BLSPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};
        use std::fmt;

        struct BLSPublicKeyVisitor;

        impl<'de> Visitor<'de> for BLSPublicKeyVisitor {
            type Value = BLSPublicKey;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("compressed BLS public key bytes")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                BLSPublicKey::from_bytes(v).map_err(de::Error::custom)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(BLS_PUBLIC_KEY_SIZE);
                while let Some(byte) = seq.next_element()? {
                    bytes.push(byte);
                }
                BLSPublicKey::from_bytes(&bytes).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_bytes(BLSPublicKeyVisitor)
    }
}
