use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::apply::{UpdateTimer, REQUEST_UPDATE_INTERVAL};

/// The per-peer fallback timer. The applier arms it after a successful pass
/// with requests still outstanding; [`run_peer_updater`] sleeps on it.
#[derive(Default)]
pub struct RequestUpdateTimer {
    deadline: Mutex<Option<Instant>>,
    rearmed: Notify,
}

impl RequestUpdateTimer {
    pub fn new() -> Arc<Self> {
        Default::default()
    }

    /// Resolves when the armed deadline passes. Pends forever while
    /// disarmed; re-arming from another task is picked up.
    pub async fn expired(&self) {
        loop {
            let rearmed = self.rearmed.notified();
            let deadline = *self.deadline.lock();
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {
                            *self.deadline.lock() = None;
                            return;
                        }
                        _ = rearmed => {}
                    }
                }
                None => rearmed.await,
            }
        }
    }
}

impl UpdateTimer for Arc<RequestUpdateTimer> {
    fn stop(&mut self) {
        *self.deadline.lock() = None;
        self.rearmed.notify_waiters();
    }

    fn reset(&mut self, after: Duration) {
        *self.deadline.lock() = Some(Instant::now() + after);
        self.rearmed.notify_waiters();
    }
}

/// Drives one peer's request updates until cancelled: wakes whenever the
/// embedder signals that an update is needed or the fallback timer fires,
/// and runs the pass closure.
///
/// The closure returns false when a peer write blocked mid-pass; the timer
/// is re-armed so the pass is retried even without further events.
pub async fn run_peer_updater(
    mut timer: Arc<RequestUpdateTimer>,
    update_needed: Arc<Notify>,
    cancel: CancellationToken,
    mut pass: impl FnMut() -> bool,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = update_needed.notified() => {}
            _ = timer.expired() => {}
        }
        if !pass() {
            trace!("pass blocked mid-way, retrying on the next tick");
            timer.reset(REQUEST_UPDATE_INTERVAL);
        }
    }
}
