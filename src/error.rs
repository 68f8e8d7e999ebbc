use thiserror::Error;

/// Errors surfaced by the schedule store.
///
/// `Conflict` and `InvalidField` are caller errors and reach the enrollment
/// collaborator; the rest indicate operational trouble.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ipns name '{ipns_name}' is already enrolled by another owner")]
    Conflict { ipns_name: String },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown enrollment id {0}")]
    UnknownId(u64),

    #[error("epoch state already initialised (current epoch {current})")]
    EpochAlreadyInitialized { current: u64 },

    #[error("epoch state not initialised")]
    EpochNotInitialized,

    #[error("state file error: {0}")]
    Io(String),
}

/// Errors from the sealed-signer client.
///
/// Any of these fails the whole chunk being signed; the scheduler records
/// them per entry and moves on. Error strings never carry key material.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signer request timed out: {url}")]
    Timeout { url: String },

    #[error("signer returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("signer transport error: {0}")]
    Transport(String),

    #[error("signer response could not be decoded: {0}")]
    Decode(String),

    #[error("signer returned malformed key material: {reason}")]
    InvalidKeyFormat { reason: String },
}

/// Errors from the delegated-routing publisher, after retries are exhausted.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("rate limited by routing endpoint after {attempts} attempts")]
    RateLimited { attempts: usize },

    #[error("publish failed after {attempts} attempts: {last_error}")]
    Failed { attempts: usize, last_error: String },

    #[error("signed record is not valid base64: {0}")]
    BadRecord(String),
}
