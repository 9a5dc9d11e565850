// In-process validator network for consensus tests.
//
// Every node gets its own Core, event channel and TestBackend. Transport
// is the shared peer table: a send is a push into the receiver's channel,
// and `pump` drains channels synchronously until the network is quiet.
// Round timers need a runtime; synchronous tests fire them with
// `timeout_all`.

use super::state_machine::Core;
use super::types::{Message, MessageType, QuorumCert, View, Vote};
use crate::backend::{self, Backend, BackendError, Event, EventReceiver, EventSender, Proposal};
use crate::config::Config;
use crate::crypto::{hash_concat, Address, Hash};
use crate::signer::{LocalSigner, Signer};
use crate::storage::{MemoryRoundStore, RoundStore};
use crate::validator::{DefaultValidatorSet, Validator, ValidatorSet};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound on events handled by one pump
const MAX_PUMPED_EVENTS: usize = 100_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBlock {
    pub number: u64,
    pub parent: Hash,
    pub payload: Vec<u8>,
    pub time: u64,
}

impl TestBlock {
    pub fn new(number: u64, parent: Hash) -> Self {
        Self {
            number,
            parent,
            payload: Vec::new(),
            time: 0,
        }
    }

    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn genesis() -> Self {
        Self::new(0, Hash::zero())
    }
}

impl Proposal for TestBlock {
    fn number(&self) -> u64 {
        self.number
    }

    fn hash(&self) -> Hash {
        hash_concat(&[
            &self.number.to_be_bytes(),
            self.parent.as_bytes(),
            &self.payload,
            &self.time.to_be_bytes(),
        ])
    }

    fn parent_hash(&self) -> Hash {
        self.parent
    }

    fn coinbase(&self) -> Address {
        Address::zero()
    }

    fn time(&self) -> u64 {
        self.time
    }
}

pub type PeerTable = Arc<Mutex<Vec<(Address, EventSender<TestBlock>)>>>;

/// Outbound message filter: may rewrite the message, returns false to drop it
pub type Tamper = Box<dyn FnMut(&mut Message) -> bool + Send>;

pub struct TestBackend {
    address: Address,
    signer: Arc<LocalSigner>,
    peers: PeerTable,
    chain: Mutex<Vec<(TestBlock, Address)>>,
    sent: Mutex<Vec<Message>>,
    tamper: Mutex<Option<Tamper>>,
    future_skew: Mutex<Option<Duration>>,
    fail_commits: AtomicBool,
    gossiped: AtomicUsize,
}

impl TestBackend {
    pub fn new(signer: Arc<LocalSigner>, peers: PeerTable) -> Self {
        Self {
            address: signer.address(),
            signer,
            peers,
            chain: Mutex::new(vec![(TestBlock::genesis(), Address::zero())]),
            sent: Mutex::new(Vec::new()),
            tamper: Mutex::new(None),
            future_skew: Mutex::new(None),
            fail_commits: AtomicBool::new(false),
            gossiped: AtomicUsize::new(0),
        }
    }

    pub fn peer_table() -> PeerTable {
        Arc::new(Mutex::new(Vec::new()))
    }

    /// Route messages for this node to `events`, replacing an older route
    pub fn register(&self, events: EventSender<TestBlock>) {
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|(address, _)| *address != self.address);
        peers.push((self.address, events));
    }

    pub fn set_future_skew(&self, skew: Option<Duration>) {
        *self.future_skew.lock().unwrap() = skew;
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn set_tamper(&self, tamper: Option<Tamper>) {
        *self.tamper.lock().unwrap() = tamper;
    }

    pub fn chain(&self) -> Vec<TestBlock> {
        self.chain.lock().unwrap().iter().map(|(b, _)| b.clone()).collect()
    }

    pub fn height(&self) -> u64 {
        self.chain.lock().unwrap().last().map_or(0, |(b, _)| b.number)
    }

    pub fn last_hash(&self) -> Hash {
        self.chain.lock().unwrap().last().map_or(Hash::zero(), |(b, _)| b.hash())
    }

    /// Proposer recorded for each finalized block
    pub fn proposers(&self) -> Vec<Address> {
        self.chain.lock().unwrap().iter().map(|(_, p)| *p).collect()
    }

    /// Messages this node sent, after tampering
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn gossiped(&self) -> usize {
        self.gossiped.load(Ordering::SeqCst)
    }

    /// Append a block finalized elsewhere and tell the local engine
    pub fn import(&self, block: TestBlock, proposer: Address) {
        let (number, hash) = (block.number, block.hash());
        self.chain.lock().unwrap().push((block, proposer));
        self.deliver_to(&self.address, Event::FinalCommitted { number, hash });
    }

    fn outbound(&self, payload: Vec<u8>) -> backend::Result<Option<Vec<u8>>> {
        let mut msg = Message::decode(&payload).map_err(|e| BackendError::Transport(e.to_string()))?;
        if let Some(tamper) = self.tamper.lock().unwrap().as_mut() {
            if !tamper(&mut msg) {
                return Ok(None);
            }
            let data = msg
                .signing_payload()
                .map_err(|e| BackendError::Transport(e.to_string()))?;
            msg.signature = self
                .signer
                .sign(&data)
                .map_err(|e| BackendError::Transport(e.to_string()))?;
        }
        let bytes = msg.encode().map_err(|e| BackendError::Transport(e.to_string()))?;
        self.sent.lock().unwrap().push(msg);
        Ok(Some(bytes))
    }

    fn deliver_to(&self, target: &Address, event: Event<TestBlock>) {
        let peers = self.peers.lock().unwrap();
        if let Some((_, tx)) = peers.iter().find(|(address, _)| address == target) {
            let _ = tx.send(event);
        }
    }

    fn send_to(&self, targets: impl Iterator<Item = Address>, payload: Vec<u8>) -> backend::Result<()> {
        let Some(bytes) = self.outbound(payload)? else {
            return Ok(());
        };
        for target in targets {
            self.deliver_to(
                &target,
                Event::Message {
                    src: self.address,
                    payload: bytes.clone(),
                },
            );
        }
        Ok(())
    }
}

impl Backend for TestBackend {
    type Block = TestBlock;
    type Executed = TestBlock;

    fn address(&self) -> Address {
        self.address
    }

    fn broadcast(&self, valset: &dyn ValidatorSet, payload: Vec<u8>) -> backend::Result<()> {
        self.send_to(valset.list().iter().map(|v| v.address), payload)
    }

    fn gossip(&self, valset: &dyn ValidatorSet, payload: Vec<u8>) -> backend::Result<()> {
        self.gossiped.fetch_add(1, Ordering::SeqCst);
        let me = self.address;
        self.send_to(
            valset.list().iter().map(|v| v.address).filter(move |a| *a != me),
            payload,
        )
    }

    fn unicast(&self, valset: &dyn ValidatorSet, payload: Vec<u8>) -> backend::Result<()> {
        let proposer = valset
            .get_proposer()
            .map(|v| v.address)
            .ok_or_else(|| BackendError::Transport("no proposer".into()))?;
        self.send_to(std::iter::once(proposer), payload)
    }

    fn verify(&self, block: &TestBlock) -> backend::Result<()> {
        if block.number == 0 {
            return Err(BackendError::InvalidBlock("genesis cannot be proposed".into()));
        }
        match *self.future_skew.lock().unwrap() {
            Some(skew) => Err(BackendError::FutureBlock(skew)),
            None => Ok(()),
        }
    }

    fn last_proposal(&self) -> Option<(TestBlock, Address)> {
        self.chain.lock().unwrap().last().cloned()
    }

    fn execute_block(&self, block: &TestBlock) -> backend::Result<TestBlock> {
        Ok(block.clone())
    }

    fn commit(&self, executed: &TestBlock, qc: &QuorumCert) -> backend::Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(BackendError::Commit("injected failure".into()));
        }
        let mut chain = self.chain.lock().unwrap();
        let tip = chain.last().map_or(0, |(b, _)| b.number);
        if executed.number != tip + 1 {
            return Err(BackendError::Commit(format!(
                "block {} does not follow {}",
                executed.number, tip
            )));
        }
        chain.push((executed.clone(), qc.proposer));
        Ok(())
    }
}

pub struct TestNode {
    pub core: Core<TestBackend>,
    pub events: EventReceiver<TestBlock>,
    pub backend: Arc<TestBackend>,
    pub signer: Arc<LocalSigner>,
    pub store: Arc<dyn RoundStore>,
}

pub struct Network {
    pub config: Config,
    pub nodes: Vec<TestNode>,
    validators: Vec<Validator>,
}

impl Network {
    /// `n` validators with timers far enough out to never fire on their own
    pub fn new(n: usize) -> Self {
        Self::with_config(
            n,
            Config {
                request_timeout_ms: 3_600_000,
                ..Config::default()
            },
        )
    }

    pub fn with_config(n: usize, config: Config) -> Self {
        testutil::init_tracing();
        let signers: Vec<Arc<LocalSigner>> = (0..n)
            .map(|i| Arc::new(LocalSigner::from_seed(&testutil::validator_seed(i)).unwrap()))
            .collect();
        let validators: Vec<Validator> = signers.iter().map(|s| s.validator()).collect();
        let peers = TestBackend::peer_table();

        let mut net = Self {
            config,
            nodes: Vec::with_capacity(n),
            validators,
        };
        for signer in signers {
            let backend = Arc::new(TestBackend::new(signer.clone(), peers.clone()));
            let store: Arc<dyn RoundStore> = Arc::new(MemoryRoundStore::new());
            let node = net.build_node(signer, backend, store);
            net.nodes.push(node);
        }
        net
    }

    fn build_node(
        &self,
        signer: Arc<LocalSigner>,
        backend: Arc<TestBackend>,
        store: Arc<dyn RoundStore>,
    ) -> TestNode {
        let (tx, rx) = backend::channel();
        backend.register(tx.clone());
        let valset = DefaultValidatorSet::new(self.validators.clone(), self.config.proposer_policy);
        let core = Core::new(
            self.config.clone(),
            backend.clone(),
            signer.clone(),
            Box::new(valset),
            store.clone(),
            tx,
        );
        TestNode {
            core,
            events: rx,
            backend,
            signer,
            store,
        }
    }

    pub fn start(&mut self) {
        for node in &mut self.nodes {
            node.core.start().unwrap();
        }
    }

    /// Replace node `i` with a fresh core over the same backend and store
    pub fn restart(&mut self, i: usize) {
        self.nodes[i].core.stop();
        let (signer, backend, store) = {
            let node = &self.nodes[i];
            (node.signer.clone(), node.backend.clone(), node.store.clone())
        };
        let mut node = self.build_node(signer, backend, store);
        node.core.start().unwrap();
        self.nodes[i] = node;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn core(&self, i: usize) -> &Core<TestBackend> {
        &self.nodes[i].core
    }

    pub fn core_mut(&mut self, i: usize) -> &mut Core<TestBackend> {
        &mut self.nodes[i].core
    }

    pub fn backend(&self, i: usize) -> &TestBackend {
        &self.nodes[i].backend
    }

    pub fn store(&self, i: usize) -> Arc<dyn RoundStore> {
        self.nodes[i].store.clone()
    }

    pub fn address(&self, i: usize) -> Address {
        self.nodes[i].core.address()
    }

    pub fn chain(&self, i: usize) -> Vec<TestBlock> {
        self.nodes[i].backend.chain()
    }

    pub fn last_hash(&self, i: usize) -> Hash {
        self.nodes[i].backend.last_hash()
    }

    /// Index of node 0's current proposer
    pub fn proposer_index(&self) -> usize {
        self.index_of(&self.core(0).status().proposer)
    }

    pub fn index_of(&self, address: &Address) -> usize {
        self.nodes
            .iter()
            .position(|n| n.core.address() == *address)
            .unwrap()
    }

    pub fn send(&self, i: usize, event: Event<TestBlock>) {
        self.nodes[i].backend.deliver_to(&self.address(i), event);
    }

    /// Send the same request for `height` to every node
    pub fn request_all(&self, height: u64) -> TestBlock {
        let block = TestBlock::new(height, self.last_hash(0)).with_payload(&height.to_be_bytes());
        for i in 0..self.len() {
            self.send(i, Event::Request(block.clone()));
        }
        block
    }

    /// Fire every node's round timer for its current view
    pub fn timeout_all(&self) {
        for i in 0..self.len() {
            let view = self.core(i).status().view;
            self.send(i, Event::Timeout { view });
        }
    }

    fn step(&mut self, i: usize) -> bool {
        let node = &mut self.nodes[i];
        match node.events.try_recv() {
            Ok(event) => {
                node.core.handle_event(event);
                true
            }
            Err(_) => false,
        }
    }

    /// Handle events on all nodes until every channel is empty
    pub fn pump(&mut self) {
        self.pump_until(|_| false);
    }

    /// Handle node `i`'s queued events only
    pub fn pump_node(&mut self, i: usize) {
        for _ in 0..MAX_PUMPED_EVENTS {
            if !self.step(i) {
                return;
            }
        }
    }

    /// Pump one event at a time until `done` holds. Returns false if the
    /// network went quiet first.
    pub fn pump_until(&mut self, mut done: impl FnMut(&Network) -> bool) -> bool {
        let mut handled = 0;
        loop {
            if done(self) {
                return true;
            }
            let mut progressed = false;
            for i in 0..self.len() {
                if self.step(i) {
                    progressed = true;
                    handled += 1;
                    if done(self) {
                        return true;
                    }
                }
            }
            if !progressed || handled >= MAX_PUMPED_EVENTS {
                return false;
            }
        }
    }

    /// Encode a message from node `i` with an arbitrary view and payload
    pub fn seal<T: Serialize>(&self, i: usize, code: MessageType, view: View, payload: &T) -> Vec<u8> {
        let node = &self.nodes[i];
        let mut msg = Message::new(code, view, node.signer.address(), bincode::serialize(payload).unwrap());
        msg.signature = node.signer.sign(&msg.signing_payload().unwrap()).unwrap();
        msg.encode().unwrap()
    }

    /// Vote of node `i` with a valid share over `digest`
    pub fn signed_vote(&self, i: usize, code: MessageType, view: View, digest: Hash) -> Vote {
        let mut vote = Vote::expected(code, view, digest);
        vote.signature = self.nodes[i].signer.bls_sign(&vote.signing_payload());
        vote
    }

    /// NewView node `i` would send for its current round
    pub fn seal_new_view(&self, i: usize) -> Vec<u8> {
        let rs = self.core(i).round_state().unwrap();
        let qc = rs.high_qc.clone().unwrap();
        self.seal(i, MessageType::NewView, rs.view, &qc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_covers_fields() {
        let a = TestBlock::new(1, Hash::zero());
        let b = a.clone().with_payload(b"x");
        let c = TestBlock::new(1, Hash::new([1u8; 32]));
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash(), TestBlock::new(1, Hash::zero()).hash());
    }

    #[test]
    fn test_unicast_reaches_proposer_only() {
        let mut net = Network::new(4);
        net.start();
        let leader = net.proposer_index();
        // NewViews from start are queued only at the leader
        for i in (0..4).filter(|&i| i != leader) {
            assert!(net.nodes[i].events.try_recv().is_err());
        }
        let mut queued = 0;
        while net.nodes[leader].events.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 4);
    }

    #[test]
    fn test_tamper_can_drop() {
        let mut net = Network::new(4);
        for i in 0..4 {
            net.backend(i).set_tamper(Some(Box::new(|_: &mut Message| false)));
        }
        net.start();
        net.pump();
        let leader = net.proposer_index();
        assert!(net.core(leader).round_state().unwrap().new_views.size() == 0);
        assert!(net.backend(0).sent().is_empty());
    }
}
