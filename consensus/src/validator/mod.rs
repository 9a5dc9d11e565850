/// Validator set capability
///
/// The core never decides membership itself. It copies the configured set at
/// the start of every round, selects that round's proposer on the copy, and
/// shares the copy with everything that handles the round.

use crate::config::ProposerPolicy;
use crate::crypto::{Address, BLSPublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod set;

pub use set::DefaultValidatorSet;

/// A consensus participant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    /// Key used to verify this validator's vote shares
    pub bls_key: BLSPublicKey,
}

impl Validator {
    pub fn new(address: Address, bls_key: BLSPublicKey) -> Self {
        Self { address, bls_key }
    }
}

pub trait ValidatorSet: Send + Sync + fmt::Debug {
    fn size(&self) -> usize;

    /// Maximum tolerated faults: f = (n - 1) / 3
    fn f(&self) -> usize {
        self.size().saturating_sub(1) / 3
    }

    /// Quorum size: 2f + 1
    fn q(&self) -> usize {
        2 * self.f() + 1
    }

    fn get_proposer(&self) -> Option<&Validator>;

    fn is_proposer(&self, address: &Address) -> bool {
        self.get_proposer().map_or(false, |v| &v.address == address)
    }

    /// Position and entry of a validator
    fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)>;

    fn get_by_index(&self, index: usize) -> Option<&Validator>;

    fn list(&self) -> &[Validator];

    /// Select the proposer for `round` given the proposer of the last block
    fn calc_proposer(&mut self, last_proposer: &Address, round: u64);

    fn copy(&self) -> Box<dyn ValidatorSet>;

    fn policy(&self) -> ProposerPolicy;
}
