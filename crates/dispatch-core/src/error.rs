use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("missing required setting: {0}")]
    MissingSetting(&'static str),

    #[error("invalid setting '{name}': {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("store returned {status}: {body}")]
    StoreStatus { status: u16, body: String },

    /// `id` is `"unknown"` when the record has no usable identifier.
    #[error("malformed action record {id}: {reason}")]
    MalformedRecord { id: String, reason: String },

    #[error("container '{0}' not found")]
    ContainerNotFound(String),

    #[error("container '{0}' is not running")]
    ContainerNotRunning(String),

    #[error("container backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("unexpected fault: {0}")]
    Fault(String),

    #[error("failed to install interrupt handler: {0}")]
    SignalHandler(#[from] ctrlc::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
