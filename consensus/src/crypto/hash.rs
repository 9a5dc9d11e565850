/// Hashes and validator addresses
///
/// Supports:
/// - BLAKE3 for block and tree-node identity
/// - SHA-256 for the canonical vote digest carried in QCs

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const HASH_SIZE: usize = 32;
pub const ADDRESS_SIZE: usize = 20;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("Invalid hash size")]
    InvalidSize,
    #[error("Invalid address size")]
    InvalidAddressSize,
}

/// Hash output (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, HashError> {
        let bytes: [u8; HASH_SIZE] = slice.try_into().map_err(|_| HashError::InvalidSize)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// All-zero hash, used as the parent of the genesis tree node
    pub fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Validator address: the trailing 20 bytes of the BLAKE3 hash of the
/// validator's compressed secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    pub fn new(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, HashError> {
        let bytes: [u8; ADDRESS_SIZE] =
            slice.try_into().map_err(|_| HashError::InvalidAddressSize)?;
        Ok(Self(bytes))
    }

    /// Derive an address from public key bytes
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = hash_data(public_key);
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(&digest.as_bytes()[HASH_SIZE - ADDRESS_SIZE..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    pub fn zero() -> Self {
        Self([0u8; ADDRESS_SIZE])
    }

    /// An empty address never identifies a validator
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_SIZE]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{})", hex::encode(self.0))
    }
}

/// Hash function selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HashFunction {
    /// SHA-256, used for vote digests
    Sha256,
    /// BLAKE3, used for block and node identity
    #[default]
    Blake3,
}

/// Hash arbitrary data with the default function (BLAKE3)
pub fn hash_data(data: &[u8]) -> Hash {
    hash_data_with(data, HashFunction::default())
}

/// Hash data with specific function
pub fn hash_data_with(data: &[u8], function: HashFunction) -> Hash {
    match function {
        HashFunction::Sha256 => {
            use sha2::{Digest, Sha256};
            Hash::new(Sha256::digest(data).into())
        }
        HashFunction::Blake3 => Hash::new(*blake3::hash(data).as_bytes()),
    }
}

/// Hash the concatenation of several byte strings
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    Hash::new(*hasher.finalize().as_bytes())
}
