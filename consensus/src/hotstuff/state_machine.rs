// Consensus state machine: event dispatch, round lifecycle and send helpers.
// The per-phase handlers live in the sibling modules.

use super::backlog::Backlog;
use super::errors::{ConsensusError, Result};
use super::round_state::{Lock, RoundState};
use super::types::{Admission, Message, MessageType, ProposedBlock, QuorumCert, RoundStatus, State, View, Vote};
use crate::backend::{Backend, BackendError, Event, EventSender, Proposal};
use crate::config::Config;
use crate::crypto::{Address, Hash};
use crate::pacemaker::Pacemaker;
use crate::signer::Signer;
use crate::storage::{Checkpoint, RoundStore};
use crate::validator::ValidatorSet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

pub(crate) type Round<Bk> = RoundState<<Bk as Backend>::Block, <Bk as Backend>::Executed>;

/// Progress of the checkpointed round, restored when it is resumed
struct Resumed<B> {
    node: ProposedBlock<B>,
    prepare_qc: Option<QuorumCert>,
    commit_qc: Option<QuorumCert>,
}

/// One validator's consensus state machine.
///
/// Not thread-safe by itself: a single task owns it and feeds it events,
/// see [`super::engine::ConsensusEngine`].
pub struct Core<Bk: Backend> {
    pub(crate) config: Config,
    pub(crate) address: Address,
    pub(crate) backend: Arc<Bk>,
    pub(crate) signer: Arc<dyn Signer>,
    validators: Box<dyn ValidatorSet>,
    store: Arc<dyn RoundStore>,
    pub(crate) events: EventSender<Bk::Block>,

    pub(crate) current: Option<Round<Bk>>,
    pub(crate) backlog: Backlog,
    /// Requests for future heights, first request per height wins
    pub(crate) pending_requests: BTreeMap<u64, Bk::Block>,
    pacemaker: Pacemaker,
    /// Checkpoint loaded at startup, consumed by the first round
    restored: Option<Checkpoint<Bk::Block>>,
}

impl<Bk: Backend> Core<Bk> {
    pub fn new(
        config: Config,
        backend: Arc<Bk>,
        signer: Arc<dyn Signer>,
        validators: Box<dyn ValidatorSet>,
        store: Arc<dyn RoundStore>,
        events: EventSender<Bk::Block>,
    ) -> Self {
        Self {
            address: signer.address(),
            backlog: Backlog::new(config.max_backlog_per_validator),
            pacemaker: Pacemaker::new(config.request_timeout()),
            config,
            backend,
            signer,
            validators,
            store,
            events,
            current: None,
            pending_requests: BTreeMap::new(),
            restored: None,
        }
    }

    /// Restore any persisted round state and start the first round
    pub fn start(&mut self) -> Result<()> {
        let checkpoint = Checkpoint::load(self.store.as_ref());
        if let Some(view) = checkpoint.view {
            info!(height = view.height, round = view.round, "Loaded round-state checkpoint");
            self.restored = Some(checkpoint);
        }
        self.start_new_round(0)
    }

    pub fn stop(&mut self) {
        self.pacemaker.stop();
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn status(&self) -> RoundStatus {
        self.current
            .as_ref()
            .map(|rs| rs.status(&self.address))
            .unwrap_or_default()
    }

    /// Handle one event. Errors are logged, never propagated.
    pub fn handle_event(&mut self, event: Event<Bk::Block>) {
        let result = match event {
            Event::Request(block) => self.handle_request(block),
            Event::Message { src, payload } => {
                trace!(from = %src, len = payload.len(), "Received message");
                self.handle_message(&payload)
            }
            Event::Backlog { msg, .. } => self.process(msg),
            Event::Timeout { view } => self.handle_timeout(view),
            Event::FinalCommitted { number, hash } => self.handle_final_committed(number, hash),
        };
        if let Err(err) = result {
            self.log_error(&err);
        }
    }

    /// Decode, authenticate and process an encoded message
    pub fn handle_message(&mut self, payload: &[u8]) -> Result<()> {
        let msg = Message::decode(payload)
            .map_err(|e| ConsensusError::InvalidMessage(e.to_string()))?;
        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        let signer = self.signer.check_signature(
            rs.valset.as_ref(),
            &msg.signing_payload()?,
            &msg.signature,
        )?;
        if signer != msg.address {
            return Err(ConsensusError::AddressMismatch {
                signer,
                claimed: msg.address,
            });
        }
        self.process(msg)
    }

    /// Run an authenticated message through its phase handler. Future
    /// messages are backlogged; accepted proposer messages are relayed.
    pub(crate) fn process(&mut self, msg: Message) -> Result<()> {
        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        let valset = rs.valset.clone();

        match self.dispatch(&msg) {
            Ok(()) => {
                let relay = matches!(
                    msg.code,
                    MessageType::Prepare | MessageType::PreCommit | MessageType::Commit | MessageType::Decide
                );
                if relay && msg.address != self.address {
                    self.relay(valset.as_ref(), &msg);
                }
                Ok(())
            }
            Err(ConsensusError::FutureMessage) => {
                let local = self.current.as_ref().map(|rs| rs.view).unwrap_or_default();
                self.backlog.push(msg, local);
                Err(ConsensusError::FutureMessage)
            }
            Err(e) => Err(e),
        }
    }

    fn relay(&self, valset: &dyn ValidatorSet, msg: &Message) {
        let result = msg
            .encode()
            .map_err(ConsensusError::from)
            .and_then(|bytes| self.backend.gossip(valset, bytes).map_err(ConsensusError::from));
        if let Err(e) = result {
            warn!(code = %msg.code, error = %e, "Failed to relay message");
        }
    }

    fn dispatch(&mut self, msg: &Message) -> Result<()> {
        match msg.code {
            MessageType::NewView => self.handle_new_view(msg),
            MessageType::Prepare => self.handle_prepare(msg),
            MessageType::PrepareVote => self.handle_prepare_vote(msg),
            MessageType::PreCommit => self.handle_pre_commit(msg),
            MessageType::PreCommitVote => self.handle_pre_commit_vote(msg),
            MessageType::Commit => self.handle_commit(msg),
            MessageType::CommitVote => self.handle_commit_vote(msg),
            MessageType::Decide => self.handle_decide(msg),
        }
    }

    /// Classify a message by view, then by the local state its phase needs
    pub(crate) fn classify(
        view: View,
        state: State,
        has_node: bool,
        code: MessageType,
        msg_view: View,
    ) -> Admission {
        match view.admit(&msg_view) {
            Admission::Current => {}
            other => return other,
        }
        let required = match code {
            MessageType::PrepareVote | MessageType::PreCommit => Some(State::HighQC),
            MessageType::PreCommitVote | MessageType::Commit => Some(State::Prepared),
            MessageType::CommitVote | MessageType::Decide => Some(State::PreCommitted),
            MessageType::NewView | MessageType::Prepare => None,
        };
        match required {
            Some(required) if state < required || !has_node => Admission::Future,
            _ => Admission::Current,
        }
    }

    pub(crate) fn check_message(&self, code: MessageType, msg_view: View) -> Result<()> {
        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        match Self::classify(rs.view, rs.state, rs.node.is_some(), code, msg_view) {
            Admission::Current => Ok(()),
            Admission::Future => Err(ConsensusError::FutureMessage),
            Admission::FarFuture => Err(ConsensusError::FarFutureMessage),
            Admission::Old => Err(ConsensusError::OldMessage),
        }
    }

    /// Re-inject backlogged messages that became current
    pub(crate) fn drain_backlog(&mut self) {
        let Some(rs) = self.current.as_ref() else {
            return;
        };
        let (view, state, has_node) = (rs.view, rs.state, rs.node.is_some());
        let ready = self
            .backlog
            .drain(|msg| Self::classify(view, state, has_node, msg.code, msg.view));
        for msg in ready {
            trace!(from = %msg.address, code = %msg.code, "Replaying backlogged message");
            if self.events.send(Event::Backlog { src: msg.address, msg }).is_err() {
                warn!("Event channel closed, dropping backlog replay");
                return;
            }
        }
    }

    /// Move to a new round.
    ///
    /// A new height always starts at round 0. At the same height `round`
    /// must be ahead of the current round.
    pub(crate) fn start_new_round(&mut self, round: u64) -> Result<()> {
        let Some((last, last_proposer)) = self.backend.last_proposal() else {
            warn!("No finalized block, cannot start a round");
            return Err(ConsensusError::NoLastProposal);
        };
        let next_height = last.number() + 1;

        let current_view = self.current.as_ref().map(|rs| rs.view);
        let same_height = match current_view {
            Some(view) if view.height == next_height => {
                if round <= view.round {
                    return Err(ConsensusError::StaleRound);
                }
                true
            }
            Some(view) if view.height > next_height => {
                warn!(height = view.height, last = last.number(), "Backend is behind the current round");
                return Err(ConsensusError::StaleRound);
            }
            _ => false,
        };

        let previous = self.current.take();
        let restored = self.restored.take();
        let (view, lock, pending_request, high_qc, resumed) = match previous {
            Some(prev) if same_height => (
                View::new(next_height, round),
                prev.lock,
                prev.pending_request,
                prev.high_qc,
                None,
            ),
            previous => {
                let (view, lock, high_qc, resumed) = Self::next_height_carry(previous, restored, &last);
                (view, lock, None, high_qc, resumed)
            }
        };

        let pending_request = pending_request.or_else(|| self.promote_pending(next_height));

        let mut valset = self.validators.copy();
        valset.calc_proposer(&last_proposer, view.round);
        let valset: Arc<dyn ValidatorSet> = Arc::from(valset);

        let mut rs = RoundState::new(view, valset, lock, pending_request, high_qc.clone());
        if let Some(resumed) = resumed {
            rs.resume(resumed.node, resumed.prepare_qc, resumed.commit_qc);
            info!(height = view.height, round = view.round, state = %rs.state, "Resumed interrupted round");
        }
        info!(
            height = view.height,
            round = view.round,
            proposer = %rs.proposer(),
            is_proposer = rs.is_proposer(&self.address),
            locked = rs.lock.is_some(),
            "Starting new round"
        );
        self.current = Some(rs);
        self.persist();
        self.pacemaker.arm(view, &self.events);

        match high_qc {
            Some(qc) => {
                if let Err(e) = self.unicast(MessageType::NewView, &qc) {
                    warn!(height = view.height, round = view.round, error = %e, "Failed to send NewView");
                }
            }
            None => debug!(
                height = view.height,
                round = view.round,
                "No round-start QC, waiting for the leader's certificate"
            ),
        }

        self.drain_backlog();
        Ok(())
    }

    /// View, lock and round-start QC for the first round of
    /// `last.number() + 1`, plus the progress of a round interrupted by a
    /// restart at that height
    fn next_height_carry(
        previous: Option<Round<Bk>>,
        restored: Option<Checkpoint<Bk::Block>>,
        last: &Bk::Block,
    ) -> (View, Option<Lock<Bk::Block>>, Option<QuorumCert>, Option<Resumed<Bk::Block>>) {
        let next_height = last.number() + 1;
        let mut view = View::new(next_height, 0);
        let mut resumed = None;

        let (lock, prepare_qc, node, resumed_qc) = match (previous, restored) {
            (Some(prev), _) => (prev.lock, prev.prepare_qc, prev.node, None),
            (None, Some(cp)) => {
                let lock = match (cp.lock_qc, cp.locked_node) {
                    (Some(qc), Some(node)) if qc.node == node.hash() => Some(Lock {
                        node,
                        qc,
                        proposal_locked: false,
                    }),
                    _ => None,
                };
                match cp.view {
                    // Crashed mid-height: resume that round
                    Some(saved) if saved.height == next_height => {
                        view = saved;
                        resumed = cp.node.map(|node| Resumed {
                            node,
                            prepare_qc: cp.prepare_qc,
                            commit_qc: cp.commit_qc,
                        });
                        (lock, None, None, cp.high_qc)
                    }
                    _ => (lock, cp.prepare_qc, cp.node, None),
                }
            }
            (None, None) => (None, None, None, None),
        };

        // A lock from this height is still open; a lock on the finalized
        // block keeps guarding its children; any other lock is obsolete.
        let lock = lock
            .filter(|l| l.qc.view.height >= next_height || l.node.block.hash() == last.hash())
            .map(|mut l| {
                l.proposal_locked = l.qc.view.height >= next_height;
                l
            });

        let high_qc = match (resumed_qc, prepare_qc, node) {
            (Some(qc), _, _) => Some(qc),
            (None, Some(qc), Some(node))
                if qc.view.height == last.number()
                    && qc.node == node.hash()
                    && node.block.hash() == last.hash() =>
            {
                Some(qc)
            }
            _ if last.number() == 0 => Some(QuorumCert::genesis(
                ProposedBlock::genesis(last.clone()).hash(),
            )),
            _ => None,
        };

        (view, lock, high_qc, resumed)
    }

    /// Take the parked request for `height`, dropping older ones
    fn promote_pending(&mut self, height: u64) -> Option<Bk::Block> {
        let later = self.pending_requests.split_off(&height);
        let dropped = std::mem::replace(&mut self.pending_requests, later);
        if !dropped.is_empty() {
            trace!(count = dropped.len(), "Dropped stale pending requests");
        }
        self.pending_requests.remove(&height)
    }

    pub(crate) fn handle_timeout(&mut self, view: View) -> Result<()> {
        let current = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?.view;
        if current != view {
            trace!(height = view.height, round = view.round, "Ignoring stale timeout");
            return Ok(());
        }
        info!(height = view.height, round = view.round, "Round change timeout");
        self.start_new_round(view.round + 1)
    }

    pub(crate) fn handle_final_committed(&mut self, number: u64, hash: Hash) -> Result<()> {
        let current = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?.view;
        if number < current.height {
            trace!(number, height = current.height, "Ignoring finalized block below current height");
            return Ok(());
        }
        info!(number, hash = %hash, "Block finalized outside this round");
        self.start_new_round(0)
    }

    /// Write the current round's checkpoint; failures are logged
    pub(crate) fn persist(&self) {
        let Some(rs) = self.current.as_ref() else {
            return;
        };
        if let Err(e) = rs.checkpoint().save(self.store.as_ref()) {
            warn!(height = rs.view.height, round = rs.view.round, error = %e, "Failed to persist round state");
        }
    }

    /// Build and sign a message for the current view
    pub(crate) fn seal<T: Serialize>(&self, code: MessageType, payload: &T) -> Result<Message> {
        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        let mut msg = Message::new(code, rs.view, self.address, bincode::serialize(payload)?);
        msg.signature = self.signer.sign(&msg.signing_payload()?)?;
        Ok(msg)
    }

    pub(crate) fn broadcast<T: Serialize>(&self, code: MessageType, payload: &T) -> Result<()> {
        let msg = self.seal(code, payload)?;
        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        self.backend.broadcast(rs.valset.as_ref(), msg.encode()?)?;
        Ok(())
    }

    pub(crate) fn unicast<T: Serialize>(&self, code: MessageType, payload: &T) -> Result<()> {
        let msg = self.seal(code, payload)?;
        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        self.backend.unicast(rs.valset.as_ref(), msg.encode()?)?;
        Ok(())
    }

    /// Sign a vote on `digest` and send it to the proposer
    pub(crate) fn vote(&self, code: MessageType, digest: Hash) -> Result<()> {
        let msg = self.seal_vote(code, digest)?;
        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        self.backend.unicast(rs.valset.as_ref(), msg.encode()?)?;
        Ok(())
    }

    pub(crate) fn seal_vote(&self, code: MessageType, digest: Hash) -> Result<Message> {
        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        let mut vote = Vote::expected(code, rs.view, digest);
        vote.signature = self.signer.bls_sign(&vote.signing_payload());
        self.seal(code, &vote)
    }

    /// Post an event to this node after `delay`, from a detached task
    pub(crate) fn post_later(&self, event: Event<Bk::Block>, delay: Duration) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let events = self.events.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(event);
                });
            }
            Err(_) => warn!(?delay, "No runtime, dropping delayed event"),
        }
    }

    fn log_error(&self, err: &ConsensusError) {
        let view = self.current.as_ref().map(|rs| rs.view).unwrap_or_default();
        match err {
            ConsensusError::FutureMessage => {
                trace!(height = view.height, round = view.round, "Backlogged future message")
            }
            ConsensusError::Backend(BackendError::FutureBlock(skew)) => {
                debug!(height = view.height, round = view.round, ?skew, "Proposal timestamp ahead, retrying later")
            }
            ConsensusError::NoRoundState => {
                error!("Event received with no round in progress")
            }
            e if e.is_protocol() => {
                trace!(height = view.height, round = view.round, error = %e, "Dropped message")
            }
            e => warn!(height = view.height, round = view.round, error = %e, "Consensus handler failed"),
        }
    }

    #[cfg(test)]
    pub(crate) fn round_state(&self) -> Option<&Round<Bk>> {
        self.current.as_ref()
    }
}
