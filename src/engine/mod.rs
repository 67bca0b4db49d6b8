// src/engine/mod.rs

//! Client-side exam session engine.

pub mod bridge;
pub mod clock;
pub mod draft;
pub mod remote;
pub mod runner;
pub mod stash;
pub mod state_machine;
pub mod violation;

use std::time::Duration;

use thiserror::Error;

use crate::engine::remote::RemoteError;

pub use bridge::{PersistenceBridge, SaveStatus};
pub use runner::{ClientEvent, SessionOutcome, SessionRunner, SessionView};
pub use state_machine::{SessionState, SessionStatus};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub lock_threshold: u32,
    pub tick: Duration,
    pub autosave_interval: Duration,
    /// Delay between time-up and the automatic submission call.
    pub submit_grace: Duration,
    pub unlock_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_threshold: state_machine::DEFAULT_LOCK_THRESHOLD,
            tick: Duration::from_secs(1),
            autosave_interval: Duration::from_secs(30),
            submit_grace: Duration::from_secs(3),
            unlock_poll_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load exam content: {0}")]
    Load(#[source] RemoteError),

    /// The session is locked and the server no longer accepts our identity,
    /// so the lock can never be re-checked.
    #[error("identity rejected while the session is locked")]
    IdentityLost,
}
