//! Async driver for a [`PeerSession`].
//!
//! Runs the session on its own task. Commands come in over an mpsc channel;
//! every produced action, session events included, goes out over another.
//! The caller's transport and signaling code consume the action stream.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};
use vanish_core::{env::Environment, keystore::SecureBackend};

use crate::{
    error::ClientError,
    gate::GateWaiter,
    peer::{PeerAction, PeerEvent, PeerSession},
};

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// How often the exchange timeout is checked
    pub tick_interval: Duration,
    /// Capacity of the command and action channels
    pub channel_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { tick_interval: Duration::from_millis(500), channel_capacity: 64 }
    }
}

/// Caller's end of a running peer session.
pub struct PeerHandle<I> {
    commands: mpsc::Sender<PeerEvent<I>>,
    gate: GateWaiter,
    task: JoinHandle<()>,
}

impl<I: Send + 'static> PeerHandle<I> {
    /// Queue a command for the session.
    pub async fn send(&self, event: PeerEvent<I>) -> Result<(), ClientError> {
        self.commands.send(event).await.map_err(|_| ClientError::ChannelClosed)
    }

    /// Wait for the key exchange to open the transport.
    pub async fn wait_established(&self, timeout: Duration) -> Result<(), ClientError> {
        self.gate.clone().wait(timeout).await
    }

    /// Wait for the session task to finish.
    pub async fn join(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Peer session task failed");
        }
    }
}

/// Spawn `session` on the current runtime.
///
/// Returns the command handle and the action stream. The task ends after it
/// emits a `Close` action or when every command sender is gone.
pub fn spawn_peer<E, B>(
    session: PeerSession<E, B>,
    env: E,
    config: &DriverConfig,
) -> (PeerHandle<E::Instant>, mpsc::Receiver<PeerAction>)
where
    E: Environment,
    B: SecureBackend,
{
    let (command_tx, command_rx) = mpsc::channel(config.channel_capacity);
    let (action_tx, action_rx) = mpsc::channel(config.channel_capacity);
    let gate = session.gate();

    let task = tokio::spawn(run_peer(session, env, command_rx, action_tx, config.tick_interval));

    (PeerHandle { commands: command_tx, gate, task }, action_rx)
}

async fn run_peer<E, B>(
    mut session: PeerSession<E, B>,
    env: E,
    mut commands: mpsc::Receiver<PeerEvent<E::Instant>>,
    actions: mpsc::Sender<PeerAction>,
    tick_interval: Duration,
) where
    E: Environment,
    B: SecureBackend,
{
    let session_id = session.id();
    tracing::debug!(%session_id, "Peer session task started");

    // Re-armed only when it fires, so a busy command stream cannot hold
    // ticks off.
    let mut tick = std::pin::pin!(env.sleep(tick_interval));

    loop {
        let (event, last) = tokio::select! {
            command = commands.recv() => match command {
                Some(event) => (event, false),
                None => (PeerEvent::Disconnect { reason: "session handle dropped".to_string() }, true),
            },
            () = &mut tick => {
                tick.set(env.sleep(tick_interval));
                (PeerEvent::Tick { now: env.now() }, false)
            },
        };

        let produced = match session.handle(event) {
            Ok(produced) => produced,
            Err(e) if e.is_session_fatal() => {
                tracing::warn!(%session_id, error = %e, "Peer session failed");
                let reason = e.to_string();
                match session.handle(PeerEvent::Disconnect { reason }) {
                    Ok(produced) => produced,
                    Err(e) => {
                        tracing::error!(%session_id, error = %e, "Teardown failed");
                        Vec::new()
                    },
                }
            },
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "Peer event rejected");
                Vec::new()
            },
        };

        let closing = produced.iter().any(|a| matches!(a, PeerAction::Close { .. }));

        for action in produced {
            if actions.send(action).await.is_err() {
                tracing::debug!(%session_id, "Action receiver dropped");
                return;
            }
        }

        if closing || last {
            break;
        }
    }

    tracing::debug!(%session_id, "Peer session task finished");
}
