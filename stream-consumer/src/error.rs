use stream_common::StreamError;
use thiserror::Error;

/// Usage and lifecycle errors of a `StreamConsumer`.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("the consumer has been closed")]
    Disposed,
    #[error("the consumer is already running a subscription")]
    AlreadyRunning,
    #[error("invalid consumer configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to open a stream session: {0}")]
    Connect(#[source] StreamError),
}

/// Errors surfaced to message handlers by a `ConsumeContext`.
#[derive(Error, Debug, Clone)]
pub enum ConsumeError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Raised when the unhandled message handler forwards a message once more. This is
    /// fatal: the poll loop stops after the current dispatch.
    #[error("message {id} of {stream} forwarded again by the unhandled message handler")]
    RecursiveForward { stream: String, id: String },
}
