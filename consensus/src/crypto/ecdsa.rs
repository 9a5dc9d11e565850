/// ECDSA signatures for consensus message envelopes
///
/// Uses the secp256k1 curve with recoverable signatures, so a receiver can
/// derive the sender's address from the signature alone.

use k256::ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey};
use thiserror::Error;

use super::hash::Address;

/// r || s || recovery id
pub const ECDSA_SIGNATURE_SIZE: usize = 65;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ECDSAError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Signing failed")]
    SigningFailed,
    #[error("Public key recovery failed")]
    RecoveryFailed,
}

/// ECDSA secret key (secp256k1)
#[derive(Clone)]
pub struct ECDSASecretKey {
    inner: SigningKey,
}

impl ECDSASecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        let inner = SigningKey::random(&mut rand::thread_rng());
        Self { inner }
    }

    /// Create from raw 32-byte scalar
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ECDSAError> {
        let inner = SigningKey::from_slice(bytes).map_err(|_| ECDSAError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn public_key(&self) -> ECDSAPublicKey {
        ECDSAPublicKey {
            inner: *self.inner.verifying_key(),
        }
    }

    /// Address derived from the public key
    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }
}

/// ECDSA public key (secp256k1)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ECDSAPublicKey {
    inner: VerifyingKey,
}

impl ECDSAPublicKey {
    /// Create from SEC1 bytes (compressed or uncompressed)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ECDSAError> {
        let inner = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| ECDSAError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Compressed SEC1 encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_sec1_bytes().to_vec()
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.to_bytes())
    }
}

/// Recoverable ECDSA signature
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ECDSASignature {
    inner: K256Signature,
    recovery_id: RecoveryId,
}

impl ECDSASignature {
    /// Parse the 65-byte `r || s || v` form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ECDSAError> {
        if bytes.len() != ECDSA_SIGNATURE_SIZE {
            return Err(ECDSAError::InvalidSignature);
        }
        let inner = K256Signature::from_slice(&bytes[..64])
            .map_err(|_| ECDSAError::InvalidSignature)?;
        let recovery_id =
            RecoveryId::from_byte(bytes[64]).ok_or(ECDSAError::InvalidSignature)?;
        Ok(Self { inner, recovery_id })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ECDSA_SIGNATURE_SIZE);
        out.extend_from_slice(&self.inner.to_bytes());
        out.push(self.recovery_id.to_byte());
        out
    }
}

/// Sign a message with ECDSA
pub fn sign(secret_key: &ECDSASecretKey, message: &[u8]) -> Result<ECDSASignature, ECDSAError> {
    let (inner, recovery_id) = secret_key
        .inner
        .sign_recoverable(message)
        .map_err(|_| ECDSAError::SigningFailed)?;
    Ok(ECDSASignature { inner, recovery_id })
}

/// Recover the signer's public key from a message and signature
pub fn recover(message: &[u8], signature: &ECDSASignature) -> Result<ECDSAPublicKey, ECDSAError> {
    let inner = VerifyingKey::recover_from_msg(message, &signature.inner, signature.recovery_id)
        .map_err(|_| ECDSAError::RecoveryFailed)?;
    Ok(ECDSAPublicKey { inner })
}

/// Recover the signer's address
pub fn recover_address(message: &[u8], signature: &ECDSASignature) -> Result<Address, ECDSAError> {
    Ok(recover(message, signature)?.address())
}
