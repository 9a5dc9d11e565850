/// Signing capability consumed by the consensus core
///
/// Message envelopes carry recoverable ECDSA signatures; votes carry BLS
/// shares that the leader aggregates into one signature per QC.

use crate::crypto::{Address, BLSError, ECDSAError};
use crate::hotstuff::types::QuorumCert;
use crate::validator::ValidatorSet;
use thiserror::Error;

pub mod local;

pub use local::LocalSigner;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("ECDSA error: {0}")]
    Ecdsa(#[from] ECDSAError),

    #[error("BLS error: {0}")]
    Bls(#[from] BLSError),

    #[error("Address {0} is not in the validator set")]
    UnauthorizedAddress(Address),

    #[error("Invalid vote share from {0}")]
    InvalidShare(Address),

    #[error("Aggregation failed: {0}")]
    AggregationFailed(String),

    #[error("Invalid quorum certificate: {0}")]
    InvalidQC(String),
}

pub type Result<T> = std::result::Result<T, SignerError>;

/// Aggregated BLS signature and the validator indices it covers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatedSignature {
    pub signature: Vec<u8>,
    pub signers: Vec<u32>,
}

pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    /// Sign an envelope
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Recover the envelope signer and require it to be a member of `valset`
    fn check_signature(
        &self,
        valset: &dyn ValidatorSet,
        data: &[u8],
        signature: &[u8],
    ) -> Result<Address>;

    /// Produce this validator's vote share
    fn bls_sign(&self, data: &[u8]) -> Vec<u8>;

    /// Check one vote share against the claimed signer's key
    fn verify_share(
        &self,
        valset: &dyn ValidatorSet,
        data: &[u8],
        share: &[u8],
        signer: &Address,
    ) -> Result<()>;

    /// Aggregate shares keyed by signer address
    fn bls_recover_agg_sig(
        &self,
        valset: &dyn ValidatorSet,
        data: &[u8],
        shares: &[(Address, Vec<u8>)],
    ) -> Result<AggregatedSignature>;

    /// Verify a QC's aggregate signature over its canonical vote payload
    fn verify_qc(&self, valset: &dyn ValidatorSet, qc: &QuorumCert) -> Result<()>;
}
