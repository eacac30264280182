use thiserror::Error;

/// Errors from control-protocol calls.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Connection refused, reset, DNS failure and friends.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call did not complete within its deadline.
    #[error("call timed out after {0} seconds")]
    Timeout(u64),

    /// The peer answered but refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Unexpected HTTP status.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl RpcError {
    /// Whether the failure happened before the peer could act on the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::Timeout(_))
    }

    /// Whether the same call may succeed later.
    ///
    /// Refusals and malformed replies are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Status { status, .. } => *status >= 500,
            other => other.is_transport(),
        }
    }

    /// Metric label for a failed call.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            RpcError::Rejected(_) => "rejected",
            e if e.is_transport() => "unreachable",
            _ => "error",
        }
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RpcError::Timeout(0)
        } else if e.is_decode() {
            RpcError::Decode(e.to_string())
        } else {
            RpcError::Transport(e.to_string())
        }
    }
}
