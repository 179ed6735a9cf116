//! Engine error types
//!
//! Relay-side failures (rejections, timeouts, dropped sockets) are reported
//! as data through listeners and broadcast results. `ClientError` covers the
//! calls that can fail locally.

use crate::message::MessageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket handshake or transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Relay could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// Relay address rejected by normalization
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Wire frame could not be encoded or decoded
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// A REQ was reissued while the relay may still answer the previous one
    #[error("REQ {subscription_id} is still pending on {relay_url}")]
    ReqStillPending {
        relay_url: String,
        subscription_id: String,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid engine configuration
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
