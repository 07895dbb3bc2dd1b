//! Error taxonomy for the broker message plane.
//!
//! These are not wire-level reason codes (see [`embermq_core::reason::ReasonCode`]
//! for those); they are the internal outcomes the core's operations can
//! produce. Callers at the edge of the core map a `CoreError` to a
//! `ReasonCode` (or a TCP close) as appropriate.

use thiserror::Error;

/// Internal error taxonomy for core operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("out of memory")]
    NoMemory,

    #[error("protocol violation")]
    Protocol,

    #[error("malformed packet")]
    MalformedPacket,

    #[error("payload too large")]
    PayloadSize,

    #[error("not supported")]
    NotSupported,

    #[error("authentication failed")]
    Auth,

    #[error("authentication continues")]
    AuthContinue,

    #[error("no subscribers")]
    NoSubscribers,

    #[error("not found")]
    NotFound,

    #[error("packet exceeds peer's maximum packet size")]
    OversizePacket,

    #[error("invalid argument")]
    Inval,

    #[error("unknown error")]
    Unknown,
}

pub type CoreResult<T> = Result<T, CoreError>;
