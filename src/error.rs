//! Error taxonomy and process exit codes.
//!
//! Every failure the engine can surface collapses into one of these kinds;
//! transient conditions (rate limits, flaky sockets) are retried internally
//! and only escape once retries exhaust.

use thiserror::Error;

/// Exit code for a fully successful batch.
pub const EXIT_OK: i32 = 0;
/// Exit code when at least one target failed.
pub const EXIT_PARTIAL: i32 = 1;
/// Exit code for initialization failures (bad arguments, unusable config).
pub const EXIT_INIT: i32 = 2;
/// Exit code for authentication failures.
pub const EXIT_AUTH: i32 = 3;
/// Exit code after a user interrupt.
pub const EXIT_INTERRUPT: i32 = 5;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// No usable credential, or the site rejected the session.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// 403/418 persisted through every retry and backoff.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Checkpoint could not be written, or its lock is contended.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Any failure bound to a single target.
    #[error("target error: {0}")]
    Target(String),

    /// A critical field was missing from an API payload.
    #[error("unexpected API shape: {0}")]
    ApiSchema(String),

    /// Bad arguments or an unusable environment at startup.
    #[error("initialization error: {0}")]
    Init(String),

    /// The user asked us to stop.
    #[error("interrupted")]
    Interrupted,
}

impl LoaderError {
    /// Map an error to the process exit code contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoaderError::Auth(_) => EXIT_AUTH,
            LoaderError::Init(_) => EXIT_INIT,
            LoaderError::Interrupted => EXIT_INTERRUPT,
            _ => EXIT_PARTIAL,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LoaderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(LoaderError::Auth("no SUB".into()).exit_code(), EXIT_AUTH);
        assert_eq!(LoaderError::Init("bad flag".into()).exit_code(), EXIT_INIT);
        assert_eq!(LoaderError::Interrupted.exit_code(), EXIT_INTERRUPT);
        assert_eq!(LoaderError::Target("boom".into()).exit_code(), EXIT_PARTIAL);
        assert_eq!(LoaderError::RateLimit("418".into()).exit_code(), EXIT_PARTIAL);
        assert_eq!(LoaderError::Checkpoint("lock".into()).exit_code(), EXIT_PARTIAL);
        assert_eq!(LoaderError::ApiSchema("mid".into()).exit_code(), EXIT_PARTIAL);
    }

    #[test]
    fn test_exit_codes_stay_in_contract() {
        let errors = [
            LoaderError::Auth(String::new()),
            LoaderError::RateLimit(String::new()),
            LoaderError::Checkpoint(String::new()),
            LoaderError::Target(String::new()),
            LoaderError::ApiSchema(String::new()),
            LoaderError::Init(String::new()),
            LoaderError::Interrupted,
        ];
        for e in errors {
            assert!([0, 1, 2, 3, 5].contains(&e.exit_code()));
        }
    }
}
