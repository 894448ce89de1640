//! Transport gate.
//!
//! The data transport must not carry a single byte before the key exchange
//! completes. [`ExchangeGate`] is owned by the peer session and flipped when
//! the exchange completes or fails; transport writers hold a [`GateWaiter`]
//! and block on it.
//!
//! ```text
//! Waiting ──exchange completed──> Open
//!    │                              │
//!    └──failure / teardown──> Failed <┘
//! ```
//!
//! Waiting past the deadline fails closed: the waiter gets an error, never an
//! open gate.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::ClientError;

/// Gate position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    /// Exchange still running
    Waiting,
    /// Exchange completed, transport may send
    Open,
    /// Exchange failed or session ended; never reopens
    Failed(String),
}

/// Owner side of the gate.
#[derive(Debug)]
pub struct ExchangeGate {
    state: watch::Sender<GateState>,
}

impl Default for ExchangeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeGate {
    /// A closed gate.
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Waiting);
        Self { state }
    }

    /// Open the gate. No effect once failed.
    pub fn open(&self) {
        self.state.send_if_modified(|state| {
            if *state == GateState::Waiting {
                *state = GateState::Open;
                true
            } else {
                false
            }
        });
    }

    /// Close the gate for good. The first reason sticks.
    pub fn fail(&self, reason: &str) {
        self.state.send_if_modified(|state| {
            if matches!(state, GateState::Failed(_)) {
                return false;
            }
            *state = GateState::Failed(reason.to_string());
            true
        });
    }

    /// Current position.
    pub fn state(&self) -> GateState {
        self.state.borrow().clone()
    }

    /// Whether the transport may send.
    pub fn is_open(&self) -> bool {
        *self.state.borrow() == GateState::Open
    }

    /// A handle for transport writers.
    pub fn waiter(&self) -> GateWaiter {
        GateWaiter { state: self.state.subscribe() }
    }
}

/// Waiting side of the gate.
#[derive(Debug, Clone)]
pub struct GateWaiter {
    state: watch::Receiver<GateState>,
}

impl GateWaiter {
    /// Wait until the gate opens.
    ///
    /// # Errors
    ///
    /// - `GateTimeout` if still waiting after `timeout`
    /// - `GateClosed` if the exchange failed, the session ended, or the gate
    ///   owner was dropped
    pub async fn wait(&mut self, timeout: Duration) -> Result<(), ClientError> {
        let outcome =
            tokio::time::timeout(timeout, self.state.wait_for(|s| *s != GateState::Waiting)).await;

        let Ok(changed) = outcome else {
            tracing::warn!(?timeout, "Transport gate timed out");
            return Err(ClientError::GateTimeout { timeout });
        };

        let Ok(state) = changed else {
            return Err(ClientError::GateClosed { reason: "session dropped".to_string() });
        };

        match &*state {
            GateState::Failed(reason) => Err(ClientError::GateClosed { reason: reason.clone() }),
            GateState::Open | GateState::Waiting => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn waits_until_open() {
        let gate = ExchangeGate::new();
        let mut waiter = gate.waiter();

        let task = tokio::spawn(async move { waiter.wait(Duration::from_secs(10)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        gate.open();

        assert!(task.await.unwrap().is_ok());
        assert!(gate.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_closed() {
        let gate = ExchangeGate::new();
        let result = gate.waiter().wait(Duration::from_secs(10)).await;

        assert!(matches!(result, Err(ClientError::GateTimeout { .. })));
        assert!(!gate.is_open());
    }

    #[tokio::test]
    async fn failure_is_final() {
        let gate = ExchangeGate::new();
        gate.fail("bad key");
        gate.open();
        gate.fail("later");

        assert_eq!(gate.state(), GateState::Failed("bad key".to_string()));
        let result = gate.waiter().wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ClientError::GateClosed { reason }) if reason == "bad key"));
    }

    #[tokio::test]
    async fn teardown_closes_an_open_gate() {
        let gate = ExchangeGate::new();
        gate.open();
        gate.fail("torn down");

        assert!(gate.waiter().wait(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn dropped_owner_fails_waiters() {
        let gate = ExchangeGate::new();
        let mut waiter = gate.waiter();
        drop(gate);

        assert!(matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(ClientError::GateClosed { .. })
        ));
    }
}
