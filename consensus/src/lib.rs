/// HotStuff Consensus Core
///
/// A leader-based BFT state machine for one validator:
/// - Three voting phases (prepare, pre-commit, commit) and a decide step
/// - BLS aggregate signatures for quorum certificates
/// - One block per height, round changes by exponential timeout
/// - Backlog for messages that arrive ahead of the local round
///
/// Transport, block execution and key custody are capabilities supplied by
/// the host through the [`Backend`] and [`Signer`] traits.

pub mod backend;
pub mod config;
pub mod crypto;
pub mod hotstuff;
pub mod pacemaker;
pub mod signer;
pub mod storage;
pub mod validator;

pub use backend::{Backend, BackendError, Event, EventSender, Proposal};
pub use config::{Config, ProposerPolicy};
pub use crypto::{Address, Hash};
pub use hotstuff::{ConsensusEngine, ConsensusError, Core, EngineHandle, QuorumCert, RoundStatus, State, View};
pub use signer::{LocalSigner, Signer};
pub use storage::{MemoryRoundStore, RocksRoundStore, RoundStore};
pub use validator::{DefaultValidatorSet, Validator, ValidatorSet};
