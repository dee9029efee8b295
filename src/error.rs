use reqwest::StatusCode;
use thiserror::Error;

/// Failures reading and framing an agent response body.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("stream read failed: {0}")]
    Read(Box<dyn std::error::Error + Send + Sync>),
}

/// Failures of the agent streaming client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No auth token found; pass --token, set SCHOLAR_TOKEN, or sign in to create one.")]
    MissingToken,

    #[error("agent request failed: {status} - {body}")]
    Status { status: StatusCode, body: String },

    #[error("agent request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Failures of the text-to-speech relay.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TtsError {
    #[error("not connected to the speech relay")]
    NotConnected,

    #[error("could not connect to {url} after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("speech relay connection closed")]
    Disconnected,

    #[error("speech request cancelled")]
    Cancelled,

    #[error("speech relay error: {message}")]
    Server { message: String, error: String },

    #[error("invalid audio payload: {0}")]
    InvalidAudio(String),
}
