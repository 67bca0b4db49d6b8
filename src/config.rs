// src/config.rs

use std::{env, str::FromStr};

use dotenvy::dotenv;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub rust_log: String,
    pub bind_addr: String,

    /// Violation count at which the server locks a session on its own.
    pub violation_lock_threshold: u32,

    /// Seconds past the exam end-time a submission is still accepted on time.
    pub late_submission_grace_secs: i64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let jwt_secret = env::var("JWT_SECRET").expect("JWT_SECRET must be set");

        Self {
            database_url,
            jwt_secret,
            rust_log: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            violation_lock_threshold: parse_var("VIOLATION_LOCK_THRESHOLD", |v: &u32| *v > 0)
                .unwrap_or(5),
            late_submission_grace_secs: parse_var("LATE_SUBMISSION_GRACE_SECS", |v: &i64| {
                *v >= 0
            })
            .unwrap_or(30),
        }
    }
}

/// Unset, unparsable and rejected values all fall back to the default.
fn parse_var<T: FromStr>(key: &str, accept: impl Fn(&T) -> bool) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) if accept(&value) => Some(value),
        _ => {
            // Logging is not initialized yet at this point.
            eprintln!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}
