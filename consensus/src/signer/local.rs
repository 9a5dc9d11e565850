// Key-backed signer holding one ECDSA and one BLS secret key

use super::{AggregatedSignature, Result, Signer, SignerError};
use crate::crypto::{
    ecdsa, hash_concat, recover_address, threshold_combine, threshold_sign, threshold_verify,
    Address, BLSKeyPair, BLSPartialSignature, BLSPublicKey, BLSSignature, ECDSASecretKey,
    ECDSASignature, Hash,
};
use crate::hotstuff::types::{QuorumCert, Vote};
use crate::validator::{Validator, ValidatorSet};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::trace;

/// Verified QCs remembered before the cache is reset
const VERIFIED_QC_CACHE_SIZE: usize = 1024;

pub struct LocalSigner {
    ecdsa: ECDSASecretKey,
    bls: BLSKeyPair,
    address: Address,
    verified_qcs: Mutex<HashSet<Hash>>,
}

impl LocalSigner {
    pub fn new(ecdsa: ECDSASecretKey, bls: BLSKeyPair) -> Self {
        let address = ecdsa.address();
        Self {
            ecdsa,
            bls,
            address,
            verified_qcs: Mutex::new(HashSet::new()),
        }
    }

    /// Derive both keys from one 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        let ecdsa = ECDSASecretKey::from_bytes(seed)?;
        let bls = BLSKeyPair::from_seed(seed)?;
        Ok(Self::new(ecdsa, bls))
    }

    pub fn bls_public_key(&self) -> &BLSPublicKey {
        &self.bls.public_key
    }

    /// Validator-set entry for this signer
    pub fn validator(&self) -> Validator {
        Validator::new(self.address, self.bls.public_key.clone())
    }

    /// Keyed on the digest recomputed from the certified fields, never on
    /// the carried `vote_digest`
    fn cache_key(digest: &Hash, qc: &QuorumCert) -> Hash {
        let signers: Vec<u8> = qc.signers.iter().flat_map(|i| i.to_be_bytes()).collect();
        hash_concat(&[digest.as_bytes(), &qc.signature, &signers])
    }
}

impl Signer for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(ecdsa::sign(&self.ecdsa, data)?.to_bytes())
    }

    fn check_signature(
        &self,
        valset: &dyn ValidatorSet,
        data: &[u8],
        signature: &[u8],
    ) -> Result<Address> {
        let signature = ECDSASignature::from_bytes(signature)?;
        let address = recover_address(data, &signature)?;
        if valset.get_by_address(&address).is_none() {
            return Err(SignerError::UnauthorizedAddress(address));
        }
        Ok(address)
    }

    fn bls_sign(&self, data: &[u8]) -> Vec<u8> {
        threshold_sign(&self.bls.secret_key, data).to_bytes()
    }

    fn verify_share(
        &self,
        valset: &dyn ValidatorSet,
        data: &[u8],
        share: &[u8],
        signer: &Address,
    ) -> Result<()> {
        let (_, validator) = valset
            .get_by_address(signer)
            .ok_or(SignerError::UnauthorizedAddress(*signer))?;
        let signature =
            BLSSignature::from_bytes(share).map_err(|_| SignerError::InvalidShare(*signer))?;
        threshold_verify(data, &signature, &[&validator.bls_key])
            .map_err(|_| SignerError::InvalidShare(*signer))
    }

    fn bls_recover_agg_sig(
        &self,
        valset: &dyn ValidatorSet,
        _data: &[u8],
        shares: &[(Address, Vec<u8>)],
    ) -> Result<AggregatedSignature> {
        let mut partials = Vec::with_capacity(shares.len());
        for (address, share) in shares {
            let (index, _) = valset
                .get_by_address(address)
                .ok_or(SignerError::UnauthorizedAddress(*address))?;
            let signature =
                BLSSignature::from_bytes(share).map_err(|_| SignerError::InvalidShare(*address))?;
            partials.push(BLSPartialSignature {
                signature,
                signer: index as u32,
            });
        }

        let (signature, signers) = threshold_combine(&partials, valset.q())
            .map_err(|e| SignerError::AggregationFailed(e.to_string()))?;

        Ok(AggregatedSignature {
            signature: signature.to_bytes(),
            signers,
        })
    }

    fn verify_qc(&self, valset: &dyn ValidatorSet, qc: &QuorumCert) -> Result<()> {
        let digest = Vote::canonical_digest(qc.code, qc.view, &qc.node);
        if digest != qc.vote_digest {
            return Err(SignerError::InvalidQC("vote digest mismatch".into()));
        }
        let key = Self::cache_key(&digest, qc);
        if let Ok(cache) = self.verified_qcs.lock() {
            if cache.contains(&key) {
                trace!(height = qc.view.height, round = qc.view.round, "QC already verified");
                return Ok(());
            }
        }

        if qc.signers.len() < valset.q() {
            return Err(SignerError::InvalidQC(format!(
                "{} signers, quorum is {}",
                qc.signers.len(),
                valset.q()
            )));
        }
        if qc.signers.windows(2).any(|w| w[0] >= w[1]) {
            return Err(SignerError::InvalidQC("signers not strictly increasing".into()));
        }

        let mut keys = Vec::with_capacity(qc.signers.len());
        for &index in &qc.signers {
            let validator = valset
                .get_by_index(index as usize)
                .ok_or_else(|| SignerError::InvalidQC(format!("unknown signer index {index}")))?;
            keys.push(&validator.bls_key);
        }

        let signature = BLSSignature::from_bytes(&qc.signature)
            .map_err(|_| SignerError::InvalidQC("malformed aggregate signature".into()))?;
        let payload = Vote::canonical_payload(qc.code, qc.view, &qc.node);
        threshold_verify(&payload, &signature, &keys)
            .map_err(|_| SignerError::InvalidQC("aggregate signature mismatch".into()))?;

        if let Ok(mut cache) = self.verified_qcs.lock() {
            if cache.len() >= VERIFIED_QC_CACHE_SIZE {
                cache.clear();
            }
            cache.insert(key);
        }
        Ok(())
    }
}
