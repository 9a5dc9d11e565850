/// Consensus Engine - drives a [`Core`] from its event channel
///
/// The engine owns the state machine and is the only task that touches it.
/// Everything else talks to it through an [`EngineHandle`]:
/// - requests and transport messages go in as events
/// - round status comes out on a watch channel
/// - shutdown is a oneshot
///
/// Timers and delayed deliveries post back into the same channel, so
/// every state change happens on the engine task.

use super::errors::Result;
use super::state_machine::Core;
use super::types::RoundStatus;
use crate::backend::{channel, Backend, Event, EventReceiver, EventSender};
use crate::config::Config;
use crate::crypto::Address;
use crate::signer::Signer;
use crate::storage::RoundStore;
use crate::validator::ValidatorSet;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

pub struct ConsensusEngine<Bk: Backend> {
    core: Core<Bk>,
    events: EventReceiver<Bk::Block>,
    status: watch::Sender<RoundStatus>,
    shutdown: oneshot::Receiver<()>,
}

/// Cloneable-by-parts handle to a running engine
pub struct EngineHandle<B> {
    address: Address,
    events: EventSender<B>,
    status: watch::Receiver<RoundStatus>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl<Bk: Backend> ConsensusEngine<Bk> {
    /// Create an engine and the handle used to feed it
    pub fn new(
        config: Config,
        backend: Arc<Bk>,
        signer: Arc<dyn Signer>,
        validators: Box<dyn ValidatorSet>,
        store: Arc<dyn RoundStore>,
    ) -> (Self, EngineHandle<Bk::Block>) {
        let (tx, rx) = channel();
        let (status_tx, status_rx) = watch::channel(RoundStatus::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let core = Core::new(config, backend, signer, validators, store, tx.clone());
        let handle = EngineHandle {
            address: core.address(),
            events: tx,
            status: status_rx,
            shutdown: Some(shutdown_tx),
        };
        let engine = Self {
            core,
            events: rx,
            status: status_tx,
            shutdown: shutdown_rx,
        };
        (engine, handle)
    }

    /// Start the first round and process events until shutdown
    pub async fn run(mut self) -> Result<()> {
        self.core.start()?;
        self.publish();
        info!(address = %self.core.address(), "Consensus engine started");

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        debug!("Event channel closed");
                        break;
                    };
                    self.core.handle_event(event);
                    self.publish();
                }
                _ = &mut self.shutdown => {
                    debug!("Shutdown requested");
                    break;
                }
            }
        }

        self.core.stop();
        info!(address = %self.core.address(), "Consensus engine stopped");
        Ok(())
    }

    fn publish(&self) {
        let status = self.core.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

impl<B> EngineHandle<B> {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Sender the transport uses to deliver events to this engine
    pub fn events(&self) -> EventSender<B> {
        self.events.clone()
    }

    /// Submit a block to propose
    pub fn request(&self, block: B) {
        self.post(Event::Request(block));
    }

    /// Deliver an encoded message received from `src`
    pub fn deliver(&self, src: Address, payload: Vec<u8>) {
        self.post(Event::Message { src, payload });
    }

    pub fn status(&self) -> RoundStatus {
        self.status.borrow().clone()
    }

    /// Watch round status changes
    pub fn subscribe(&self) -> watch::Receiver<RoundStatus> {
        self.status.clone()
    }

    /// Ask the engine to stop; the run future then resolves
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    fn post(&self, event: Event<B>) {
        if self.events.send(event).is_err() {
            warn!(address = %self.address, "Engine is not running, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Proposal;
    use crate::hotstuff::test_harness::{TestBackend, TestBlock};
    use crate::hotstuff::types::State;
    use crate::signer::LocalSigner;
    use crate::storage::MemoryRoundStore;
    use crate::validator::DefaultValidatorSet;
    use std::time::Duration;

    struct Node {
        backend: Arc<TestBackend>,
        handle: EngineHandle<TestBlock>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn spawn_committee(n: usize) -> Vec<Node> {
        testutil::init_tracing();
        let signers: Vec<Arc<LocalSigner>> = (0..n)
            .map(|i| Arc::new(LocalSigner::from_seed(&testutil::validator_seed(i)).unwrap()))
            .collect();
        let validators: Vec<_> = signers.iter().map(|s| s.validator()).collect();
        let peers = TestBackend::peer_table();

        let config = Config {
            request_timeout_ms: 2_000,
            ..Config::default()
        };

        signers
            .into_iter()
            .map(|signer| {
                let backend = Arc::new(TestBackend::new(signer.clone(), peers.clone()));
                let valset = DefaultValidatorSet::new(validators.clone(), config.proposer_policy);
                let (engine, handle) = ConsensusEngine::new(
                    config.clone(),
                    backend.clone(),
                    signer,
                    Box::new(valset),
                    Arc::new(MemoryRoundStore::new()),
                );
                backend.register(handle.events());
                let task = tokio::spawn(engine.run());
                Node { backend, handle, task }
            })
            .collect()
    }

    async fn wait_for_height(nodes: &[Node], height: u64) -> bool {
        for _ in 0..200 {
            if nodes.iter().all(|n| n.backend.height() >= height) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_engines_commit_requests() {
        let mut nodes = spawn_committee(4);

        for height in 1..=3u64 {
            let parent = nodes[0].backend.last_hash();
            let block = TestBlock::new(height, parent).with_payload(&testutil::random_payload());
            for node in &nodes {
                node.handle.request(block.clone());
            }
            assert!(wait_for_height(&nodes, height).await, "height {height} not committed");
        }

        let reference: Vec<_> = nodes[0].backend.chain().iter().map(|b| b.hash()).collect();
        for node in &nodes[1..] {
            let chain: Vec<_> = node.backend.chain().iter().map(|b| b.hash()).collect();
            assert_eq!(chain, reference);
        }

        for node in nodes.iter_mut() {
            node.handle.stop();
        }
        for node in nodes {
            node.task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_status_published() {
        let nodes = spawn_committee(4);
        let mut status = nodes[0].handle.subscribe();

        tokio::time::timeout(Duration::from_secs(2), async {
            while status.borrow().view.height == 0 {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let current = nodes[0].handle.status();
        assert_eq!(current.view.height, 1);
        assert!(current.state >= State::AcceptRequest);
        let proposers: Vec<_> = nodes.iter().filter(|n| n.handle.status().is_proposer).collect();
        assert!(proposers.len() <= 1);
    }

    #[tokio::test]
    async fn test_stop_resolves_run() {
        let mut nodes = spawn_committee(4);
        let mut node = nodes.remove(0);
        node.handle.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), node.task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
        // A stopped engine drops further events
        node.handle.request(TestBlock::new(1, node.backend.last_hash()));
    }
}
