use thiserror::Error;

/// Structural failures surfaced to callers. External-service failures are
/// never represented here: every collaborator call resolves to a fallback
/// value inside the component that made it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("not found")]
    NotFound,
    /// Room exists but is no longer joinable (deactivated or past expiry).
    /// Most callers treat this the same as NotFound.
    #[error("no longer available")]
    Unavailable,
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
