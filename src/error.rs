//! Error taxonomy shared by every component of the client.
//!
//! Mirrors the split the service enforces at its boundaries: connectivity
//! failures are retried by supervisors, authentication failures are permanent
//! for the failing call, and "not found" is a first-class outcome that the
//! facade can surface as an empty result.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the configuration client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every candidate endpoint was tried and none accepted the request.
    #[error("all server endpoints failed")]
    EndpointsExhausted,
    /// Initialization did not complete within the hard ceiling.
    #[error("initialization timed out after {0:?}")]
    InitTimeout(Duration),
    /// The remote address pool has not completed its first refresh yet.
    #[error("server address pool is not initialized yet")]
    PoolNotInitialized,
    /// The session was used before `init()` succeeded.
    #[error("client must be initialized before use")]
    NotInitialized,
    /// No live connection is available to carry the request.
    #[error("connection is not ready")]
    NotConnected,
    /// The requested configuration does not exist on the server.
    #[error("configuration not found: {0}")]
    NotFound(String),
    /// The server rejected the request outright.
    #[error("access denied: {0}")]
    Forbidden(String),
    /// The server has not registered this connection yet (retryable while
    /// probing a fresh stream).
    #[error("connection not registered with server: {0}")]
    ConnectionUnregistered(String),
    /// Credential login failed.
    #[error("login failed: {0}")]
    Login(String),
    /// A unary request did not receive its response in time.
    #[error("request timed out: {0}")]
    RequestTimeout(String),
    /// Unknown message type, malformed payload, or unexpected error code.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A server endpoint string could not be parsed.
    #[error("invalid server endpoint: {0}")]
    InvalidEndpoint(String),
    /// A configuration identity was missing required fields.
    #[error("invalid configuration identity: {0}")]
    InvalidIdentity(String),
    /// Websocket transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    /// HTTP transport failure (DNS, TLS, socket, body).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// JSON encode/decode failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The client has been shut down.
    #[error("client is shut down")]
    Shutdown,
}

impl ClientError {
    /// Returns whether the error names a missing configuration rather than a
    /// transport or protocol failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}
