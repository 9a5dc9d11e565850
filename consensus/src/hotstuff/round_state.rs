// Mutable state of one (height, round)

use super::message_set::MessageSet;
use super::types::{ProposedBlock, QuorumCert, RoundStatus, State, View};
use crate::backend::Proposal;
use crate::crypto::{Address, Hash};
use crate::storage::Checkpoint;
use crate::validator::ValidatorSet;
use std::sync::Arc;

/// Lock carried from round to round until the locked node is committed
#[derive(Clone, Debug)]
pub struct Lock<B> {
    pub node: ProposedBlock<B>,
    pub qc: QuorumCert,
    /// The next leader at this height should re-propose the locked node
    pub proposal_locked: bool,
}

pub struct RoundState<B, E> {
    pub view: View,
    pub state: State,
    /// Snapshot of the validator set with this round's proposer selected
    pub valset: Arc<dyn ValidatorSet>,

    pub pending_request: Option<B>,
    pub node: Option<ProposedBlock<B>>,
    pub lock: Option<Lock<B>>,

    pub high_qc: Option<QuorumCert>,
    pub prepare_qc: Option<QuorumCert>,
    pub commit_qc: Option<QuorumCert>,

    pub new_views: MessageSet,
    pub prepare_votes: MessageSet,
    pub pre_commit_votes: MessageSet,
    pub commit_votes: MessageSet,

    pub executed: Option<E>,
    /// Leader already sent this round's Prepare
    pub prepare_sent: bool,
}

impl<B: Proposal, E> RoundState<B, E> {
    pub fn new(
        view: View,
        valset: Arc<dyn ValidatorSet>,
        lock: Option<Lock<B>>,
        pending_request: Option<B>,
        high_qc: Option<QuorumCert>,
    ) -> Self {
        Self {
            view,
            state: State::AcceptRequest,
            new_views: MessageSet::new(valset.clone()),
            prepare_votes: MessageSet::new(valset.clone()),
            pre_commit_votes: MessageSet::new(valset.clone()),
            commit_votes: MessageSet::new(valset.clone()),
            valset,
            pending_request,
            node: None,
            lock,
            high_qc,
            prepare_qc: None,
            commit_qc: None,
            executed: None,
            prepare_sent: false,
        }
    }

    pub fn proposer(&self) -> Address {
        self.valset
            .get_proposer()
            .map(|v| v.address)
            .unwrap_or_default()
    }

    pub fn is_proposer(&self, address: &Address) -> bool {
        self.valset.is_proposer(address)
    }

    pub fn node_hash(&self) -> Option<Hash> {
        self.node.as_ref().map(ProposedBlock::hash)
    }

    /// Set the pending request if none is set yet
    pub fn set_pending_request(&mut self, request: B) -> bool {
        if self.pending_request.is_some() {
            return false;
        }
        self.pending_request = Some(request);
        true
    }

    /// Advance to `state`; never moves backwards
    pub fn advance(&mut self, state: State) {
        debug_assert!(state >= self.state, "state regression {} -> {}", self.state, state);
        if state > self.state {
            self.state = state;
        }
    }

    /// Restore progress made in this view before a restart, so nothing
    /// already voted for is voted on again. Certificates for another view
    /// or node are discarded.
    pub fn resume(
        &mut self,
        node: ProposedBlock<B>,
        prepare_qc: Option<QuorumCert>,
        commit_qc: Option<QuorumCert>,
    ) {
        let view = self.view;
        let hash = node.hash();
        let certifies = move |qc: &QuorumCert| qc.view == view && qc.node == hash;

        self.node = Some(node);
        self.prepare_sent = true;
        self.advance(State::HighQC);

        let Some(prepare_qc) = prepare_qc.filter(certifies) else {
            return;
        };
        self.prepare_qc = Some(prepare_qc);
        self.advance(State::Prepared);

        if !self.lock.as_ref().is_some_and(|l| certifies(&l.qc)) {
            return;
        }
        self.advance(State::PreCommitted);

        if let Some(commit_qc) = commit_qc.filter(certifies) {
            self.commit_qc = Some(commit_qc);
            self.advance(State::Committed);
        }
    }

    pub fn status(&self, self_address: &Address) -> RoundStatus {
        RoundStatus {
            view: self.view,
            state: self.state,
            proposer: self.proposer(),
            is_proposer: self.is_proposer(self_address),
            locked: self.lock.is_some(),
        }
    }

    pub fn checkpoint(&self) -> Checkpoint<B> {
        Checkpoint {
            view: Some(self.view),
            high_qc: self.high_qc.clone(),
            prepare_qc: self.prepare_qc.clone(),
            lock_qc: self.lock.as_ref().map(|l| l.qc.clone()),
            locked_node: self.lock.as_ref().map(|l| l.node.clone()),
            commit_qc: self.commit_qc.clone(),
            node: self.node.clone(),
        }
    }
}
