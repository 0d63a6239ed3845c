use thiserror::Error;

/// Convenience result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Canonical error surface of the client.
///
/// The first seven variants are the sentinel conditions callers branch on. The remaining
/// variants only ever carry a cause: a transport fault stringified at the session boundary,
/// a protocol-level rejection from the server, or a local misconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("timeout")]
    Timeout,

    #[error("client closed")]
    ClientClosed,

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("client connection expired")]
    ClientExpired,

    #[error("reconnect failed")]
    ReconnectFailed,

    #[error("duplicate subscription")]
    DuplicateSubscription,

    #[error("client destroyed")]
    ClientDestroyed,

    #[error("transport error ({context}): {error}")]
    Transport {
        context: &'static str,
        error: String,
    },

    #[error("server error: code={code}, message={message}")]
    Server { code: u32, message: String },

    #[error("token fetch failed for {channel}: {message}")]
    Token { channel: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    #[inline]
    pub fn transport(context: &'static str, err: impl ToString) -> Self {
        Self::Transport {
            context,
            error: err.to_string(),
        }
    }

    /// Whether the reconnect loop may try again after a session ends with this error.
    ///
    /// Expired credentials need a refresh the loop cannot perform, and the remaining
    /// non-retryable kinds are terminal or misuse conditions.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout
                | ClientError::ClientDisconnected
                | ClientError::Transport { .. }
                | ClientError::Server { .. }
                | ClientError::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_messages_are_stable() {
        assert_eq!(ClientError::Timeout.to_string(), "timeout");
        assert_eq!(ClientError::ClientClosed.to_string(), "client closed");
        assert_eq!(
            ClientError::ClientExpired.to_string(),
            "client connection expired"
        );
        assert_eq!(
            ClientError::DuplicateSubscription.to_string(),
            "duplicate subscription"
        );
        assert_eq!(ClientError::ClientDestroyed.to_string(), "client destroyed");
    }

    #[test]
    fn expired_and_closed_are_not_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::transport("read", "reset by peer").is_retryable());
        assert!(!ClientError::ClientExpired.is_retryable());
        assert!(!ClientError::ClientClosed.is_retryable());
        assert!(!ClientError::ReconnectFailed.is_retryable());
    }
}
