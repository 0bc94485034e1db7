//! Error taxonomy for the orchestration core.
//!
//! Every failure mode named in the design document is a variant of a single
//! [`ConciergeError`] enum rather than a family of per-module error types.
//! `status_code` is the one place that maps an error to an HTTP response —
//! handlers never re-derive that mapping themselves.

use thiserror::Error;

/// Unified error type returned by every orchestration-core operation.
#[derive(Debug, Error)]
pub enum ConciergeError {
    /// The declarative config document failed schema validation.
    #[error("Config invalid: {0}")]
    ConfigInvalid(String),

    /// The allow-list error surfaced when a host is not present in config.
    #[error("Host not allowed")]
    HostNotAllowed,

    /// The allow-list error surfaced when a host has no configured MAC.
    #[error("MAC not configured")]
    MacNotConfigured,

    /// The allow-list error surfaced when a host does not expose the named command.
    #[error("Command not allowed")]
    CommandNotAllowed,

    /// A command definition is structurally invalid (bad type, missing fields).
    #[error("Invalid command definition: {0}")]
    InvalidCommandDefinition(String),

    /// Neither or both of `timeout`/`async_timeout` were present, or the value is out of range.
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    /// A placeholder substitution could not be performed.
    #[error("Placeholder '{key}' invalid: {reason}")]
    PlaceholderInvalid {
        /// The placeholder token that failed substitution.
        key: String,
        /// Human-readable reason, matching the source's wording where the tests pin it down.
        reason: String,
    },

    /// The fully-substituted template did not parse as JSON.
    #[error("Result not valid JSON: {0}")]
    ResultNotJson(String),

    /// The persistent store is at capacity and has no tagged entry to evict.
    #[error("Store is at full capacity")]
    FullCapacity,

    /// A lookup by key found nothing.
    #[error("Key missing: {0}")]
    KeyMissing(String),

    /// The child process could not be spawned.
    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    /// The child process exited with a non-zero status.
    #[error("Exit code {0}")]
    ProcessNonZeroExit(i32),

    /// The operation exceeded its configured timeout.
    #[error("Timeout")]
    Timeout,

    /// The operation was aborted by the caller before or during execution.
    #[error("Task aborted")]
    Aborted,

    /// The outbound HTTP request failed at the transport layer.
    #[error("HTTP transport error: {0}")]
    HttpTransport(String),

    /// The outbound HTTP request completed with a non-2xx status.
    #[error("HTTP status {0}")]
    HttpNon2xx(u16),

    /// A WebSocket token's `exp` has passed.
    #[error("Token expired")]
    TokenExpired,

    /// A WebSocket token's nonce was already consumed.
    #[error("Token replay detected")]
    TokenReplay,

    /// A WebSocket token failed HMAC verification or could not be parsed.
    #[error("Token invalid: {0}")]
    TokenInvalid(String),

    /// Recovered at startup: a host was still `running` when the process died.
    #[error("Process dropped during restart")]
    ProcessDroppedAtRestart,

    /// A plan's hard-coded sub-task wait (300s) was exhausted.
    #[error("Plan sub-task timed out waiting for completion")]
    PlanSubtaskTimeout,

    /// Wraps filesystem/I/O failures encountered while touching the store or config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps `serde_json` (de)serialization failures.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConciergeError {
    /// Whether this error belongs to the hard-rejection allow-list used by
    /// [`crate::task::TaskDispatcher`] to decide between `403` and `500`.
    pub fn is_allow_listed(&self) -> bool {
        matches!(
            self,
            ConciergeError::HostNotAllowed
                | ConciergeError::MacNotConfigured
                | ConciergeError::CommandNotAllowed
        )
    }

    /// The HTTP status code this error maps to when surfaced directly by the frontend.
    pub fn status_code(&self) -> u16 {
        match self {
            ConciergeError::HostNotAllowed
            | ConciergeError::MacNotConfigured
            | ConciergeError::CommandNotAllowed => 403,
            ConciergeError::TokenExpired | ConciergeError::TokenReplay | ConciergeError::TokenInvalid(_) => 401,
            ConciergeError::KeyMissing(_) => 404,
            ConciergeError::ConfigInvalid(_)
            | ConciergeError::InvalidCommandDefinition(_)
            | ConciergeError::InvalidTimeout(_) => 500,
            _ => 500,
        }
    }
}
