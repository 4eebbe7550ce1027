use std::sync::Arc;

use thiserror::Error;

pub use redis::ErrorKind as RedisErrorKind;

/// Errors returned by the broker collaborators.
///
/// A group read that times out without data is not an error: it surfaces as an empty
/// reply from `StreamClient::read_group`.
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("timed out waiting for redis")]
    Timeout,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to parse redis reply: {0}")]
    Parse(String),
    #[error("the client has been disposed")]
    Disposed,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for StreamError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StreamError::Timeout
        } else {
            StreamError::Redis(Arc::new(err))
        }
    }
}

impl StreamError {
    /// Build a redis error from its kind, mostly for mocks and tests.
    pub fn from_redis_kind(kind: RedisErrorKind, description: &'static str) -> Self {
        StreamError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }

    /// Build a redis server response error carrying a detail message, like `NOGROUP` or
    /// `BUSYGROUP` replies.
    pub fn response(code: &'static str, detail: impl Into<String>) -> Self {
        StreamError::Redis(Arc::new(redis::RedisError::from((
            RedisErrorKind::ResponseError,
            code,
            detail.into(),
        ))))
    }

    /// Whether retrying the same command can never succeed.
    ///
    /// Error policies can use this to keep polling through network blips while stopping
    /// on misconfiguration.
    pub fn is_unrecoverable_error(&self) -> bool {
        match self {
            StreamError::Timeout => false,
            StreamError::InvalidConfiguration(_) => true,
            StreamError::Parse(_) => true,
            StreamError::Disposed => true,
            StreamError::Redis(err) => {
                matches!(
                    err.kind(),
                    RedisErrorKind::InvalidClientConfig | RedisErrorKind::AuthenticationFailed
                ) || err.is_unrecoverable_error()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_recoverable() {
        assert!(!StreamError::Timeout.is_unrecoverable_error());
    }

    #[test]
    fn test_parse_and_config_errors_are_unrecoverable() {
        assert!(StreamError::Parse("bad reply".to_string()).is_unrecoverable_error());
        assert!(StreamError::InvalidConfiguration("zero".to_string()).is_unrecoverable_error());
        assert!(StreamError::Disposed.is_unrecoverable_error());
    }

    #[test]
    fn test_io_error_is_recoverable() {
        let err = StreamError::from_redis_kind(RedisErrorKind::IoError, "Connection refused");
        assert!(!err.is_unrecoverable_error());
    }

    #[test]
    fn test_authentication_failed_is_unrecoverable() {
        let err = StreamError::from_redis_kind(
            RedisErrorKind::AuthenticationFailed,
            "WRONGPASS invalid username-password pair",
        );
        assert!(err.is_unrecoverable_error());
    }

    #[test]
    fn test_response_error_keeps_detail() {
        let err = StreamError::response("NOGROUP", "no such group 'g' for key 's'");
        assert!(err.to_string().contains("no such group"));
    }
}
