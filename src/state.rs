// src/state.rs

use axum::extract::FromRef;
use sqlx::PgPool;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
}

/// Server-side session rules taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub lock_threshold: u32,
    pub late_grace: chrono::Duration,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl FromRef<AppState> for SessionPolicy {
    fn from_ref(state: &AppState) -> Self {
        SessionPolicy {
            lock_threshold: state.config.violation_lock_threshold,
            late_grace: chrono::Duration::seconds(state.config.late_submission_grace_secs),
        }
    }
}
