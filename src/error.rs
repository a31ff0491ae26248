//! Error taxonomy for the fabric. Stale nonces and `Wait` replies are
//! ordinary protocol outcomes and never surface here.

/// Failures surfaced by the controller, the worker, and the facade.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// Transport-level failure on one of the two endpoints.
    #[error("socket error: {0}")]
    Socket(#[from] zmq::Error),

    /// A message body that could not be decoded as a wire record.
    #[error("malformed message: {0}")]
    Codec(#[from] prost::DecodeError),

    /// The opaque spaces payload could not be decoded by the facade.
    #[error("spaces payload: {0}")]
    Spaces(#[from] serde_json::Error),

    /// A peer violated the protocol contract.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Handshake version check failed; fatal at the worker.
    #[error("server version {server} does not match worker version {worker}")]
    VersionMismatch { server: u32, worker: u32 },

    /// The injected environment failed.
    #[error("environment failure: {0}")]
    Environment(String),

    /// The connection was closed; no further operations are possible.
    #[error("connection is closed")]
    Closed,
}

impl FabricError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        FabricError::Protocol(message.into())
    }
}
