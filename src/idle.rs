//! Resettable idle countdown for the worker.
//!
//! Each `reset` aborts the pending timer task and schedules a new one that
//! delivers an [`IdleDeadline`] token on the fire channel. The owner only
//! acts on a token that [`IdleTimer::accept`] confirms is still current, so
//! a timer that slipped past its abort can never stop the worker.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleDeadline {
    generation: u64,
    due: Instant,
}

impl IdleDeadline {
    pub fn due(&self) -> Instant {
        self.due
    }
}

pub struct IdleTimer {
    generation: u64,
    active: Option<IdleDeadline>,
    pending: Option<JoinHandle<()>>,
    fire_tx: mpsc::UnboundedSender<IdleDeadline>,
}

impl IdleTimer {
    /// Expired deadlines are delivered on `fire_tx`.
    pub fn new(fire_tx: mpsc::UnboundedSender<IdleDeadline>) -> Self {
        Self {
            generation: 0,
            active: None,
            pending: None,
            fire_tx,
        }
    }

    /// Replace any pending deadline with one `window` from now.
    pub fn reset(&mut self, window: Duration) -> IdleDeadline {
        self.cancel();
        self.generation += 1;
        let deadline = IdleDeadline {
            generation: self.generation,
            due: Instant::now() + window,
        };
        self.active = Some(deadline);

        let fire_tx = self.fire_tx.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline.due).await;
            let _ = fire_tx.send(deadline);
        }));
        deadline
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        self.active = None;
    }

    /// True exactly once, for the deadline installed by the latest `reset`.
    pub fn accept(&mut self, fired: IdleDeadline) -> bool {
        if self.active == Some(fired) {
            self.active = None;
            self.pending = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
