//! Error kinds for uplinkd (spec §7).

use thiserror::Error;

/// Top-level daemon error. Configuration and invariant errors are meant to
/// propagate to `main`; host and transient errors are normally logged and
/// absorbed by the component that hit them.
#[derive(Debug, Error)]
pub enum UplinkdError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("host command failed: {0}")]
    Host(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl UplinkdError {
    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, UplinkdError>;
