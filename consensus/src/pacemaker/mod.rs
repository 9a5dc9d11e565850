// Pacemaker: the round-change timer
//
// One single-shot timer per round. The duration grows exponentially with the
// round so that correct replicas eventually overlap in the same round long
// enough to finish it.

use crate::backend::{Event, EventSender};
use crate::hotstuff::types::View;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Timeout for `round`: base + 2^round seconds.
///
/// The exponent saturates, so large rounds yield a very long but finite
/// duration instead of overflowing.
pub fn timeout_for(base: Duration, round: u64) -> Duration {
    let exponent = u32::try_from(round).unwrap_or(u32::MAX);
    let backoff = 2u64.saturating_pow(exponent);
    base.saturating_add(Duration::from_secs(backoff))
}

/// Owns the armed timer task, if any
pub struct Pacemaker {
    base_timeout: Duration,
    timer: Option<JoinHandle<()>>,
}

impl Pacemaker {
    pub fn new(base_timeout: Duration) -> Self {
        Self {
            base_timeout,
            timer: None,
        }
    }

    pub fn timeout_for(&self, round: u64) -> Duration {
        timeout_for(self.base_timeout, round)
    }

    /// Arm the timer for `view`, cancelling any previous one.
    ///
    /// Expiry posts `Timeout { view }`. Without a tokio runtime nothing is
    /// scheduled and timeouts must be injected by the caller.
    pub fn arm<B: Send + 'static>(&mut self, view: View, events: &EventSender<B>) {
        self.stop();

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!(height = view.height, round = view.round, "No runtime, round-change timer not armed");
                return;
            }
        };

        let duration = self.timeout_for(view.round);
        debug!(height = view.height, round = view.round, ?duration, "Arming round-change timer");

        let events = events.clone();
        self.timer = Some(handle.spawn(async move {
            tokio::time::sleep(duration).await;
            // Receiver gone means the node shut down
            let _ = events.send(Event::Timeout { view });
        }));
    }

    /// Cancel the armed timer
    pub fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer.as_ref().map_or(false, |t| !t.is_finished())
    }
}

impl Drop for Pacemaker {
    fn drop(&mut self) {
        self.stop();
    }
}
