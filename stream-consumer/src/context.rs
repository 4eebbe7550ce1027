use std::sync::OnceLock;

use async_trait::async_trait;
use stream_common::{StreamClient, StreamError, StreamMessage};
use tracing::{debug, error};

use crate::error::ConsumeError;

/// Receives every message delivered to the consumer, from reads and reclaims alike.
///
/// Handlers run one at a time on the poll loop: a slow handler delays the next poll.
/// Nothing is acknowledged automatically, call `ConsumeContext::ack` once done with a
/// message or it will be reclaimed after the configured idle time.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &ConsumeContext<'_>, stream: &str, message: &StreamMessage);
}

/// Decides what a broker error means for the poll loop: true to keep polling, false to
/// stop it. Without an error handler every broker error stops the loop.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, err: &StreamError) -> bool;
}

impl<F> ErrorHandler for F
where
    F: Fn(&StreamError) -> bool + Send + Sync,
{
    fn handle(&self, err: &StreamError) -> bool {
        self(err)
    }
}

/// The consumer group and name a session reads as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerIdentity {
    pub group: String,
    pub name: String,
}

/// What a handler can do with the message it was given, through the session of the
/// consumer that delivered it.
pub struct ConsumeContext<'a> {
    session: &'a dyn StreamClient,
    identity: &'a ConsumerIdentity,
    unhandled_message_handler: Option<&'a dyn MessageHandler>,
    forwarded: bool,
    fatal: &'a OnceLock<ConsumeError>,
}

impl<'a> ConsumeContext<'a> {
    /// `fatal` receives the first error that must stop the poll loop.
    pub(crate) fn new(
        session: &'a dyn StreamClient,
        identity: &'a ConsumerIdentity,
        unhandled_message_handler: Option<&'a dyn MessageHandler>,
        fatal: &'a OnceLock<ConsumeError>,
    ) -> Self {
        Self {
            session,
            identity,
            unhandled_message_handler,
            forwarded: false,
            fatal,
        }
    }

    pub fn group(&self) -> &str {
        &self.identity.group
    }

    pub fn consumer_name(&self) -> &str {
        &self.identity.name
    }

    /// The broker session the message was read from, to issue any other stream command.
    pub fn session(&self) -> &dyn StreamClient {
        self.session
    }

    /// Whether this context is the one given to the unhandled message handler.
    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    /// Acknowledge entries of `stream` for this consumer's group.
    pub async fn ack<I>(&self, stream: &str, ids: &[I]) -> Result<u64, ConsumeError>
    where
        I: AsRef<str> + Sync,
    {
        let ids: Vec<String> = ids.iter().map(|id| id.as_ref().to_owned()).collect();
        Ok(self.session.ack(stream, &self.identity.group, &ids).await?)
    }

    /// Delete entries from `stream`. Their pending entries, if any, are left untouched.
    pub async fn del<I>(&self, stream: &str, ids: &[I]) -> Result<u64, ConsumeError>
    where
        I: AsRef<str> + Sync,
    {
        let ids: Vec<String> = ids.iter().map(|id| id.as_ref().to_owned()).collect();
        Ok(self.session.del(stream, &ids).await?)
    }

    /// Hand `message` over to the unhandled message handler, if one is configured.
    ///
    /// Forwarding again from within the unhandled message handler fails with
    /// `ConsumeError::RecursiveForward` and stops the poll loop.
    pub async fn forward_unhandled_message(
        &self,
        stream: &str,
        message: &StreamMessage,
    ) -> Result<(), ConsumeError> {
        if self.forwarded {
            error!(
                fatal = true,
                stream,
                id = %message.id,
                "invalid forward, the unhandled message handler might be forwarding recursively"
            );
            let err = ConsumeError::RecursiveForward {
                stream: stream.to_owned(),
                id: message.id.clone(),
            };
            if self.fatal.set(err.clone()).is_err() {
                debug!("a fatal error was already recorded for this dispatch");
            }
            return Err(err);
        }

        let Some(handler) = self.unhandled_message_handler else {
            return Ok(());
        };

        let forwarded = ConsumeContext {
            session: self.session,
            identity: self.identity,
            unhandled_message_handler: self.unhandled_message_handler,
            forwarded: true,
            fatal: self.fatal,
        };
        handler.handle(&forwarded, stream, message).await;
        Ok(())
    }
}
