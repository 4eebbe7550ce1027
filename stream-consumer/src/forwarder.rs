use async_trait::async_trait;
use stream_common::{Connector, Producer, StreamError, StreamMessage, AUTO_INCREMENT};
use tracing::{info, warn};

use crate::context::{ConsumeContext, MessageHandler};

/// Field added to forwarded entries holding the stream they were read from.
pub const SOURCE_STREAM_FIELD: &str = "_source_stream";
/// Field added to forwarded entries holding their id in the source stream.
pub const SOURCE_ID_FIELD: &str = "_source_id";

/// Republishes messages to a target stream, typically a dead letter stream fed by the
/// unhandled message handler of a consumer.
///
/// A message is acknowledged in its source stream once it was written to the target.
pub struct Forwarder {
    producer: Producer,
    target: String,
}

impl Forwarder {
    pub fn new(producer: Producer, target: &str) -> Self {
        Self {
            producer,
            target: target.to_owned(),
        }
    }

    pub async fn connect(connector: &dyn Connector, target: &str) -> Result<Self, StreamError> {
        let producer = Producer::connect(connector).await?;
        info!(destination = target, "forwarder started");
        Ok(Self::new(producer, target))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Write an entry to any stream through the forwarder's producer.
    pub async fn write(
        &self,
        stream: &str,
        id: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamError> {
        self.producer.write(stream, id, fields).await
    }

    /// Copy `message` to the target stream, tagged with where it came from.
    pub async fn forward(
        &self,
        stream: &str,
        message: &StreamMessage,
    ) -> Result<String, StreamError> {
        let mut fields = message.field_pairs();
        fields.push((SOURCE_STREAM_FIELD.to_owned(), stream.to_owned()));
        fields.push((SOURCE_ID_FIELD.to_owned(), message.id.clone()));
        self.producer.write(&self.target, AUTO_INCREMENT, &fields).await
    }

    pub fn close(&self) {
        if !self.producer.is_closed() {
            info!(destination = %self.target, "forwarder stopped");
        }
        self.producer.close();
    }
}

#[async_trait]
impl MessageHandler for Forwarder {
    async fn handle(&self, ctx: &ConsumeContext<'_>, stream: &str, message: &StreamMessage) {
        let forwarded_id = match self.forward(stream, message).await {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    stream,
                    id = %message.id,
                    destination = %self.target,
                    error = %err,
                    "failed to forward message, it will be reclaimed"
                );
                return;
            }
        };

        if let Err(err) = ctx.ack(stream, &[&message.id]).await {
            warn!(
                stream,
                id = %message.id,
                error = %err,
                "forwarded message could not be acknowledged"
            );
        }
        info!(
            stream,
            id = %message.id,
            destination = %self.target,
            forwarded_id = %forwarded_id,
            "message forwarded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;
    use stream_common::{MockStreamClient, StreamClient, NEVER_DELIVERED_OFFSET, ZERO_OFFSET};

    use crate::context::ConsumerIdentity;

    #[tokio::test]
    async fn test_forward_tags_source_and_acks() {
        let mock = MockStreamClient::new();
        mock.create_group("orders", "g", ZERO_OFFSET, true)
            .await
            .unwrap();
        let id = mock
            .add("orders", AUTO_INCREMENT, &[("sku".to_string(), "42".to_string())])
            .await
            .unwrap();
        let read = mock
            .read_group(
                "g",
                "c",
                10,
                Duration::ZERO,
                &["orders".to_string()],
                &[NEVER_DELIVERED_OFFSET.to_string()],
            )
            .await
            .unwrap();
        let message = read[0].messages[0].clone();

        let forwarder = Forwarder::new(Producer::new(Arc::new(mock.clone())), "orders:dead");
        let identity = ConsumerIdentity {
            group: "g".to_string(),
            name: "c".to_string(),
        };
        let fatal = OnceLock::new();
        let ctx = ConsumeContext::new(&mock, &identity, None, &fatal);
        forwarder.handle(&ctx, "orders", &message).await;

        assert_eq!(mock.stream_len("orders:dead"), 1);
        assert!(mock.pending_owners("orders", "g").is_empty());

        let adds = mock.calls_for("add");
        assert_eq!(adds.last().map(|call| call.stream.as_str()), Some("orders:dead"));
        assert_eq!(id, message.id);
    }

    #[tokio::test]
    async fn test_failed_forward_leaves_message_pending() {
        let mock = MockStreamClient::new();
        let forwarder = Forwarder::new(Producer::new(Arc::new(mock.clone())), "dead");
        forwarder.close();

        let identity = ConsumerIdentity {
            group: "g".to_string(),
            name: "c".to_string(),
        };
        let fatal = OnceLock::new();
        let ctx = ConsumeContext::new(&mock, &identity, None, &fatal);
        let message = StreamMessage::new(
            "1-0",
            HashMap::from([("k".to_string(), "v".to_string())]),
        );
        forwarder.handle(&ctx, "orders", &message).await;

        assert!(mock.calls_for("add").is_empty());
        assert!(mock.calls_for("ack").is_empty());
    }
}
