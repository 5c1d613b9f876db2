//! Readiness handshake between the supervisor and commands waiting on a
//! freshly started worker.
//!
//! The supervisor arms the gate once per start attempt and fulfils it when
//! the worker prints its readiness marker. Any number of commands may wait
//! on the same attempt; each wait is bounded by its own deadline.

use std::time::Duration;

use tokio::sync::watch;

/// How a readiness wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The worker announced readiness.
    Ready,
    /// The deadline elapsed first.
    TimedOut,
    /// The start attempt was discarded (worker exited, crashed or was stopped).
    Abandoned,
}

/// Single-slot gate owned by the supervisor.
#[derive(Debug, Default)]
pub struct ReadinessGate {
    next_attempt: u64,
    current: Option<Attempt>,
}

#[derive(Debug)]
struct Attempt {
    id: u64,
    tx: watch::Sender<bool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new attempt. A previous, unfulfilled attempt is abandoned.
    pub fn arm(&mut self) -> u64 {
        self.next_attempt += 1;
        let (tx, _) = watch::channel(false);
        self.current = Some(Attempt {
            id: self.next_attempt,
            tx,
        });
        self.next_attempt
    }

    /// Fulfil `attempt`. Returns false for stale attempts or repeat signals.
    pub fn signal(&mut self, attempt: u64) -> bool {
        match &self.current {
            Some(current) if current.id == attempt => current.tx.send_if_modified(|ready| {
                if *ready {
                    false
                } else {
                    *ready = true;
                    true
                }
            }),
            _ => false,
        }
    }

    /// Drop the current attempt; its waiters observe [`WaitOutcome::Abandoned`].
    pub fn discard(&mut self) {
        self.current = None;
    }

    pub fn attempt(&self) -> Option<u64> {
        self.current.as_ref().map(|current| current.id)
    }

    pub fn is_ready(&self) -> bool {
        self.current
            .as_ref()
            .map(|current| *current.tx.borrow())
            .unwrap_or(false)
    }

    /// A waiter for the in-flight attempt, if any.
    pub fn waiter(&self) -> Option<ReadinessWaiter> {
        self.current.as_ref().map(|current| ReadinessWaiter {
            rx: current.tx.subscribe(),
        })
    }
}

/// Held by a command while the worker starts. Moves freely across tasks.
#[derive(Debug)]
pub struct ReadinessWaiter {
    rx: watch::Receiver<bool>,
}

impl ReadinessWaiter {
    /// Returns on readiness, abandonment or after `deadline`, whichever is first.
    pub async fn wait(mut self, deadline: Duration) -> WaitOutcome {
        match tokio::time::timeout(deadline, self.rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => WaitOutcome::Ready,
            Ok(Err(_)) => WaitOutcome::Abandoned,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}
