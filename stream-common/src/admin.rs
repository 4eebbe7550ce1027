use std::sync::Arc;

use crate::client::{Connector, StreamClient};
use crate::error::StreamError;

/// Consumer group administration, a thin forwarder over the `XGROUP` commands.
pub struct AdminClient {
    client: Arc<dyn StreamClient>,
}

impl AdminClient {
    pub fn new(client: Arc<dyn StreamClient>) -> Self {
        Self { client }
    }

    pub async fn connect(connector: &dyn Connector) -> Result<Self, StreamError> {
        Ok(Self::new(Arc::from(connector.connect().await?)))
    }

    /// Create `group` on an existing stream, starting at `offset`.
    pub async fn create_consumer_group(
        &self,
        stream: &str,
        group: &str,
        offset: &str,
    ) -> Result<(), StreamError> {
        self.client.create_group(stream, group, offset, false).await
    }

    /// Create `group`, creating an empty `stream` first if needed.
    pub async fn create_consumer_group_with_stream(
        &self,
        stream: &str,
        group: &str,
        offset: &str,
    ) -> Result<(), StreamError> {
        self.client.create_group(stream, group, offset, true).await
    }

    pub async fn delete_consumer_group(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<u64, StreamError> {
        self.client.destroy_group(stream, group).await
    }

    pub async fn alter_consumer_group_offset(
        &self,
        stream: &str,
        group: &str,
        offset: &str,
    ) -> Result<(), StreamError> {
        self.client.set_group_offset(stream, group, offset).await
    }

    pub async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, StreamError> {
        self.client.delete_consumer(stream, group, consumer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AUTO_INCREMENT, LAST_OFFSET, ZERO_OFFSET};
    use crate::mock::MockStreamClient;

    #[tokio::test]
    async fn test_group_lifecycle() {
        let mock = MockStreamClient::new();
        let admin = AdminClient::connect(&mock).await.unwrap();

        assert!(admin
            .create_consumer_group("orders", "billing", LAST_OFFSET)
            .await
            .is_err());
        admin
            .create_consumer_group_with_stream("orders", "billing", LAST_OFFSET)
            .await
            .unwrap();

        mock.add("orders", AUTO_INCREMENT, &[("k".to_string(), "v".to_string())])
            .await
            .unwrap();
        admin
            .alter_consumer_group_offset("orders", "billing", ZERO_OFFSET)
            .await
            .unwrap();

        assert_eq!(admin.delete_consumer("orders", "billing", "gone").await.unwrap(), 0);
        assert_eq!(admin.delete_consumer_group("orders", "billing").await.unwrap(), 1);
        assert_eq!(admin.delete_consumer_group("orders", "billing").await.unwrap(), 0);

        let ops: Vec<String> = mock.get_calls().into_iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                "create_group",
                "create_group",
                "add",
                "set_group_offset",
                "delete_consumer",
                "destroy_group",
                "destroy_group"
            ]
        );
    }
}
