use thiserror::Error;

/// Everything that can go wrong between a raw transport payload and the
/// ingress queues.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("`source_id` must be a string or a number")]
    InvalidSourceId,

    #[error("ingress is closed")]
    Closed,
}

impl IngressError {
    /// Malformed input is dropped quietly by the adapters; everything else is
    /// worth a louder log line.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, IngressError::Closed)
    }
}
