// Prepare phase: the leader proposes, replicas check safety and vote

use super::state_machine::Core;
use super::errors::{ConsensusError, Result};
use super::types::{Message, MessageType, PreparePayload, ProposedBlock, State};
use crate::backend::{Backend, BackendError, Event, Proposal};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

impl<Bk: Backend> Core<Bk> {
    /// Propose once the leader holds a high QC and something to propose.
    ///
    /// A locked leader re-proposes its locked node; otherwise the pending
    /// request is wrapped in a node extending the high QC.
    pub(crate) fn try_send_prepare(&mut self) -> Result<()> {
        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        if rs.state != State::HighQC || rs.prepare_sent || !rs.is_proposer(&self.address) {
            return Ok(());
        }
        let Some(high_qc) = rs.high_qc.clone() else {
            return Ok(());
        };

        let node = match (&rs.lock, &rs.pending_request) {
            (Some(lock), _) if lock.proposal_locked => {
                if lock.node.parent != high_qc.node {
                    warn!(height = rs.view.height, round = rs.view.round, "Locked node does not extend the high QC");
                    return Ok(());
                }
                lock.node.clone()
            }
            (_, Some(request)) => ProposedBlock::new(high_qc.node, request.clone()),
            _ => return Ok(()),
        };

        let delay = proposal_delay(node.block.time());
        if delay > self.config.block_period() {
            warn!(?delay, "Proposal timestamp too far ahead, not proposing");
            return Ok(());
        }

        let executed = self.backend.execute_block(&node.block)?;
        let view = rs.view;
        let digest = node.hash();
        let payload = PreparePayload {
            view,
            node: node.clone(),
            high_qc,
        };

        let rs = self.current.as_mut().ok_or(ConsensusError::NoRoundState)?;
        rs.node = Some(node);
        rs.executed = Some(executed);
        rs.prepare_sent = true;
        let valset = rs.valset.clone();

        let prepare = self.seal(MessageType::Prepare, &payload)?.encode()?;
        let vote = self.seal_vote(MessageType::PrepareVote, digest)?.encode()?;
        debug!(height = view.height, round = view.round, node = %digest, "Proposing");
        self.persist();

        if delay.is_zero() {
            self.backend.broadcast(valset.as_ref(), prepare)?;
            self.backend.unicast(valset.as_ref(), vote)?;
        } else {
            debug!(?delay, "Waiting for the proposal timestamp");
            let backend = self.backend.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = backend
                            .broadcast(valset.as_ref(), prepare)
                            .and_then(|_| backend.unicast(valset.as_ref(), vote))
                        {
                            warn!(error = %e, "Delayed proposal failed");
                        }
                    });
                }
                Err(_) => {
                    self.backend.broadcast(valset.as_ref(), prepare)?;
                    self.backend.unicast(valset.as_ref(), vote)?;
                }
            }
        }

        // The leader's own PrepareVotes may already be waiting
        self.drain_backlog();
        Ok(())
    }

    pub(crate) fn handle_prepare(&mut self, msg: &Message) -> Result<()> {
        self.check_message(MessageType::Prepare, msg.view)?;
        // Own broadcast coming back
        if msg.address == self.address {
            return Ok(());
        }

        let rs = self.current.as_ref().ok_or(ConsensusError::NoRoundState)?;
        if !rs.is_proposer(&msg.address) {
            return Err(ConsensusError::NotFromProposer);
        }
        if rs.node.is_some() {
            return Err(ConsensusError::OldMessage);
        }

        let payload: PreparePayload<Bk::Block> = msg.payload()?;
        if payload.view != msg.view {
            return Err(ConsensusError::InvalidMessage("payload view mismatch".into()));
        }
        self.check_proposal(msg, &payload.node, &payload.high_qc)?;

        match self.backend.verify(&payload.node.block) {
            Ok(()) => {}
            Err(BackendError::FutureBlock(skew)) => {
                let event = Event::Message {
                    src: msg.address,
                    payload: msg.encode()?,
                };
                self.post_later(event, skew);
                return Err(BackendError::FutureBlock(skew).into());
            }
            Err(e) => return Err(e.into()),
        }

        let executed = self.backend.execute_block(&payload.node.block)?;
        let digest = payload.node.hash();

        let rs = self.current.as_mut().ok_or(ConsensusError::NoRoundState)?;
        debug!(height = rs.view.height, round = rs.view.round, node = %digest, "Accepted proposal");
        rs.node = Some(payload.node);
        rs.high_qc = Some(payload.high_qc);
        rs.executed = Some(executed);
        rs.advance(State::HighQC);

        self.persist();
        self.vote(MessageType::PrepareVote, digest)?;
        self.drain_backlog();
        Ok(())
    }
}

/// Time until a block timestamp (unix seconds) is reached
fn proposal_delay(timestamp: u64) -> Duration {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Duration::from_secs(timestamp.saturating_sub(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstuff::test_harness::{Network, TestBlock};
    use crate::hotstuff::types::{QuorumCert, View};

    #[test]
    fn test_proposal_delay() {
        assert_eq!(proposal_delay(0), Duration::ZERO);
        let ahead = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 30;
        assert!(proposal_delay(ahead) > Duration::from_secs(28));
    }

    #[test]
    fn test_replicas_accept_and_vote() {
        let mut net = Network::new(4);
        net.start();
        net.request_all(1);
        let leader = net.proposer_index();
        assert!(net.pump_until(|net| {
            (0..4).all(|i| i == leader || net.core(i).status().state == State::HighQC)
        }));

        for i in 0..4 {
            let rs = net.core(i).round_state().unwrap();
            assert!(rs.node.is_some());
            assert!(rs.executed.is_some());
        }
    }

    #[test]
    fn test_prepare_not_extending_high_qc_rejected() {
        let mut net = Network::new(4);
        net.start();
        net.pump();
        let leader = net.proposer_index();
        let replica = (leader + 1) % 4;

        let genesis_qc = net.core(replica).round_state().unwrap().high_qc.clone().unwrap();
        let node = ProposedBlock::new(
            crate::crypto::Hash::new([9u8; 32]),
            TestBlock::new(1, net.last_hash(leader)),
        );
        let payload = PreparePayload {
            view: View::new(1, 0),
            node,
            high_qc: genesis_qc,
        };
        let bytes = net.seal(leader, MessageType::Prepare, View::new(1, 0), &payload);

        let err = net.core_mut(replica).handle_message(&bytes).unwrap_err();
        assert!(matches!(err, ConsensusError::ExtendViolation));
        assert!(net.core(replica).round_state().unwrap().node.is_none());
    }

    #[test]
    fn test_prepare_from_non_proposer_rejected() {
        let mut net = Network::new(4);
        net.start();
        let leader = net.proposer_index();
        let impostor = (leader + 1) % 4;
        let replica = (leader + 2) % 4;

        let high_qc: QuorumCert = net.core(replica).round_state().unwrap().high_qc.clone().unwrap();
        let payload = PreparePayload {
            view: View::new(1, 0),
            node: ProposedBlock::new(high_qc.node, TestBlock::new(1, net.last_hash(replica))),
            high_qc,
        };
        let bytes = net.seal(impostor, MessageType::Prepare, View::new(1, 0), &payload);
        let err = net.core_mut(replica).handle_message(&bytes).unwrap_err();
        assert!(matches!(err, ConsensusError::NotFromProposer));
    }

    #[tokio::test]
    async fn test_future_block_is_retried() {
        let mut net = Network::new(4);
        net.start();
        let leader = net.proposer_index();
        let replica = (leader + 1) % 4;
        net.backend(replica).set_future_skew(Some(Duration::from_millis(50)));

        net.request_all(1);
        net.pump();
        assert!(net.core(replica).round_state().unwrap().node.is_none());

        net.backend(replica).set_future_skew(None);
        tokio::time::sleep(Duration::from_millis(200)).await;
        net.pump();

        assert_eq!(net.chain(replica).len(), 2);
    }
}
