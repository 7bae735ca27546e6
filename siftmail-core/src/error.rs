use thiserror::Error;

/// Error taxonomy for the engine, mirroring the kinds enumerated in spec §7.
///
/// `Programmer` errors are deliberately *not* meant to be constructed and
/// returned up a `Result` chain in normal operation — callers that detect a
/// programmer error should `panic!`/`debug_assert!` instead, so the worker
/// supervisor can restart the process (spec §7). The variant still exists so
/// that boundary code which *does* convert a caught panic or invariant
/// violation into a `Result` (e.g. for logging before re-panicking) has
/// somewhere to put it.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("fatal backend error: {0}")]
    Fatal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("programmer error: {0}")]
    Programmer(String),

    #[error("rule name error: {0}")]
    RuleName(#[from] siftmail_contracts::ids::RuleNameTooLong),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Transient backend failures are the one kind a caller can retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
