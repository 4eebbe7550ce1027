use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::client::{Connector, StreamClient};
use crate::error::StreamError;

/// Publishes single entries to streams.
pub struct Producer {
    client: Arc<dyn StreamClient>,
    disposed: AtomicBool,
}

impl Producer {
    pub fn new(client: Arc<dyn StreamClient>) -> Self {
        Self {
            client,
            disposed: AtomicBool::new(false),
        }
    }

    pub async fn connect(connector: &dyn Connector) -> Result<Self, StreamError> {
        Ok(Self::new(Arc::from(connector.connect().await?)))
    }

    /// Append an entry to `stream`. Pass `AUTO_INCREMENT` as `id` to let redis pick it.
    pub async fn write(
        &self,
        stream: &str,
        id: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StreamError::Disposed);
        }
        self.client.add(stream, id, fields).await
    }

    /// Stop accepting writes. Calling it again is a no-op.
    pub fn close(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            info!("producer closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::AUTO_INCREMENT;
    use crate::mock::MockStreamClient;

    fn fields() -> Vec<(String, String)> {
        vec![
            ("name".to_string(), "luffy".to_string()),
            ("age".to_string(), "19".to_string()),
        ]
    }

    #[tokio::test]
    async fn test_write_then_close() {
        let mock = MockStreamClient::new();
        let producer = Producer::connect(&mock).await.unwrap();

        let id = producer
            .write("crew", AUTO_INCREMENT, &fields())
            .await
            .unwrap();
        assert_eq!(id, "1-0");
        assert_eq!(mock.stream_len("crew"), 1);

        producer.close();
        producer.close();
        assert!(producer.is_closed());
        assert!(matches!(
            producer.write("crew", AUTO_INCREMENT, &fields()).await,
            Err(StreamError::Disposed)
        ));
        assert_eq!(mock.stream_len("crew"), 1);
    }
}
