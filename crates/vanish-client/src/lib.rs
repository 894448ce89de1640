//! Client runtime for Vanish peer sessions.
//!
//! Wires the Sans-IO state machines of [`vanish_core`] and the vault of
//! [`vanish_vault`] to tokio.
//!
//! # Components
//!
//! - [`PeerSession`]: key exchange, message cipher and retention negotiation
//!   for one connection attempt, driven by [`PeerEvent`]s and producing
//!   [`PeerAction`]s
//! - [`spawn_peer`]: runs a [`PeerSession`] on its own task, with actions
//!   (session events included) delivered over an mpsc channel
//! - [`ExchangeGate`]: blocks the data transport until the exchange completes
//! - [`Sweeper`]: periodic deletion of expired vault records
//! - [`SystemEnv`]: production environment (OS RNG, system clocks)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod driver;
mod error;
mod gate;
mod peer;
mod sweeper;
mod system_env;

pub use driver::{DriverConfig, PeerHandle, spawn_peer};
pub use error::ClientError;
pub use gate::{ExchangeGate, GateState, GateWaiter};
pub use peer::{PeerAction, PeerEvent, PeerSession};
pub use sweeper::{DEFAULT_SWEEP_INTERVAL, SharedHandle, Sweeper, SweeperConfig, SweeperHandle};
pub use system_env::SystemEnv;
pub use vanish_core::{Lifetime, RetentionPolicy, SessionConfig, SessionEvent, env::Environment};
