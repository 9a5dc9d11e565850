// HotStuff-BFT consensus core
// Based on HotStuff: BFT Consensus in the Lens of Blockchain
// Three-phase agreement (Prepare, PreCommit, Commit) with a Decide step,
// one block per height, rounds within a height changed by timeout.

pub mod backlog;
pub mod state_machine;
pub mod engine;
pub mod errors;
pub mod message_set;
pub mod round_state;
pub mod types;

mod commit;
mod decide;
mod new_view;
mod pre_commit;
mod prepare;
mod request;
mod verify;

#[cfg(test)]
pub(crate) mod test_harness;


pub use state_machine::Core;
pub use engine::{ConsensusEngine, EngineHandle};
pub use errors::{ConsensusError, Result};
pub use message_set::{MessageSet, MessageSetError};
pub use types::{
    Message, MessageType, PreparePayload, ProposedBlock, QuorumCert, RoundStatus, State, View,
    Vote,
};
