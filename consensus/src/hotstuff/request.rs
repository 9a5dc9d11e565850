// Block requests from the host

use super::state_machine::Core;
use super::errors::{ConsensusError, Result};
use crate::backend::{Backend, Proposal};
use std::cmp::Ordering;
use tracing::{debug, trace, warn};

impl<Bk: Backend> Core<Bk> {
    /// Accept a block to propose.
    ///
    /// Blocks for the current height become the round's pending request if
    /// none is set. Blocks for later heights wait in the pending queue until
    /// their height starts.
    pub(crate) fn handle_request(&mut self, block: Bk::Block) -> Result<()> {
        let rs = self.current.as_mut().ok_or(ConsensusError::NoRoundState)?;
        let number = block.number();

        match number.cmp(&rs.view.height) {
            Ordering::Less => {
                trace!(number, height = rs.view.height, "Dropping request for old height");
                Err(ConsensusError::OldMessage)
            }
            Ordering::Greater => {
                if self.pending_requests.contains_key(&number) {
                    return Ok(());
                }
                if self.pending_requests.len() >= self.config.max_pending_requests {
                    warn!(number, "Pending request queue full, dropping request");
                    return Ok(());
                }
                debug!(number, "Parking request for future height");
                self.pending_requests.insert(number, block);
                Ok(())
            }
            Ordering::Equal => {
                if rs.set_pending_request(block) {
                    debug!(height = rs.view.height, round = rs.view.round, "Accepted request");
                }
                self.try_send_prepare()
            }
        }
    }
}
