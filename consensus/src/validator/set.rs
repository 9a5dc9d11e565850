// In-memory validator set with round-robin and sticky proposer selection

use super::{Validator, ValidatorSet};
use crate::config::ProposerPolicy;
use crate::crypto::Address;

/// Validators ordered by address, so every node derives the same proposer
#[derive(Clone, Debug)]
pub struct DefaultValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<usize>,
    policy: ProposerPolicy,
}

impl DefaultValidatorSet {
    /// Build a set; duplicate addresses keep their first entry
    pub fn new(mut validators: Vec<Validator>, policy: ProposerPolicy) -> Self {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        validators.dedup_by(|a, b| a.address == b.address);
        let proposer = if validators.is_empty() { None } else { Some(0) };
        Self {
            validators,
            proposer,
            policy,
        }
    }

    fn seed(&self, last_proposer: &Address, round: u64) -> u64 {
        let last_index = if last_proposer.is_zero() {
            None
        } else {
            self.get_by_address(last_proposer).map(|(i, _)| i as u64)
        };
        match (last_index, self.policy) {
            (None, _) => round,
            (Some(index), ProposerPolicy::RoundRobin) => index.wrapping_add(round).wrapping_add(1),
            (Some(index), ProposerPolicy::Sticky) => index.wrapping_add(round),
        }
    }
}

impl ValidatorSet for DefaultValidatorSet {
    fn size(&self) -> usize {
        self.validators.len()
    }

    fn get_proposer(&self) -> Option<&Validator> {
        self.proposer.and_then(|i| self.validators.get(i))
    }

    fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|i| (i, &self.validators[i]))
    }

    fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    fn list(&self) -> &[Validator] {
        &self.validators
    }

    fn calc_proposer(&mut self, last_proposer: &Address, round: u64) {
        if self.validators.is_empty() {
            self.proposer = None;
            return;
        }
        let seed = self.seed(last_proposer, round);
        self.proposer = Some((seed % self.validators.len() as u64) as usize);
    }

    fn copy(&self) -> Box<dyn ValidatorSet> {
        Box::new(self.clone())
    }

    fn policy(&self) -> ProposerPolicy {
        self.policy
    }
}
