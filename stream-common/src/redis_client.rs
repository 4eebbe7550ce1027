use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use crate::client::{Connector, PendingEntry, StreamClient, StreamEntries, StreamMessage};
use crate::error::StreamError;

/// Wire shape of a stream entry: the id and its field/value pairs. Fields are nil when
/// the entry was deleted but is still referenced by a pending entries list.
type RawEntry = (String, Option<HashMap<String, String>>);

/// Wire shape of an `XPENDING` extended reply row: id, consumer, idle ms, deliveries.
type RawPending = (String, String, u64, u64);

fn into_message((id, fields): RawEntry) -> StreamMessage {
    StreamMessage {
        id,
        fields: fields.unwrap_or_default(),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `StreamClient` backed by a multiplexed redis connection.
///
/// The connection is not given a response timeout: `XREADGROUP` blocks server side for
/// up to the requested duration and must not be cut short by the client.
pub struct RedisStreamClient {
    connection: MultiplexedConnection,
}

impl RedisStreamClient {
    pub async fn new(addr: &str) -> Result<RedisStreamClient, StreamError> {
        Self::with_config(addr, None).await
    }

    /// Connect and check the server answers `PING`.
    ///
    /// # Errors
    /// Returns `StreamError::InvalidConfiguration` for a `Some(Duration::ZERO)` connection
    /// timeout, use `None` for no timeout instead.
    pub async fn with_config(
        addr: &str,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisStreamClient, StreamError> {
        let client = redis::Client::open(addr)?;

        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(timeout) = connection_timeout {
            if timeout.is_zero() {
                return Err(StreamError::InvalidConfiguration(
                    "redis connection timeout cannot be zero - use None for no timeout"
                        .to_string(),
                ));
            }
            config = config.set_connection_timeout(timeout);
        }

        let mut connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;
        let _pong: String = redis::cmd("PING").query_async(&mut connection).await?;

        Ok(RedisStreamClient { connection })
    }
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
        keys: &[String],
        offsets: &[String],
    ) -> Result<Vec<StreamEntries>, StreamError> {
        if keys.len() != offsets.len() {
            return Err(StreamError::InvalidConfiguration(format!(
                "{} stream keys for {} offsets",
                keys.len(),
                offsets.len()
            )));
        }

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        // BLOCK 0 would wait forever, a zero duration means a non blocking read.
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(millis(block));
        }
        cmd.arg("STREAMS");
        for key in keys {
            cmd.arg(key.as_str());
        }
        for offset in offsets {
            cmd.arg(offset.as_str());
        }

        let mut conn = self.connection.clone();
        let reply: Option<Vec<(String, Vec<RawEntry>)>> = cmd.query_async(&mut conn).await?;

        Ok(reply
            .unwrap_or_default()
            .into_iter()
            .map(|(stream, entries)| StreamEntries {
                stream,
                messages: entries.into_iter().map(into_message).collect(),
            })
            .collect())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        let mut conn = self.connection.clone();
        let reply: Vec<RawPending> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg(start)
            .arg(end)
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .into_iter()
            .map(|(id, consumer, idle_ms, delivery_count)| PendingEntry {
                id,
                consumer,
                idle: Duration::from_millis(idle_ms),
                delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StreamError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(millis(min_idle));
        for id in ids {
            cmd.arg(id.as_str());
        }

        let mut conn = self.connection.clone();
        // Older servers answer nil for claimed ids whose entry was deleted.
        let reply: Vec<Option<RawEntry>> = cmd.query_async(&mut conn).await?;
        let claimed: Vec<StreamMessage> = reply.into_iter().flatten().map(into_message).collect();

        debug!(
            stream,
            requested = ids.len(),
            claimed = claimed.len(),
            "XCLAIM done"
        );
        Ok(claimed)
    }

    async fn exists(&self, stream: &str, id: &str) -> Result<bool, StreamError> {
        let mut conn = self.connection.clone();
        let reply: Vec<redis::Value> = redis::cmd("XRANGE")
            .arg(stream)
            .arg(id)
            .arg(id)
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(!reply.is_empty())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.as_str());
        }

        let mut conn = self.connection.clone();
        let acked: u64 = cmd.query_async(&mut conn).await?;
        Ok(acked)
    }

    async fn del(&self, stream: &str, ids: &[String]) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XDEL");
        cmd.arg(stream);
        for id in ids {
            cmd.arg(id.as_str());
        }

        let mut conn = self.connection.clone();
        let deleted: u64 = cmd.query_async(&mut conn).await?;
        Ok(deleted)
    }

    async fn add(
        &self,
        stream: &str,
        id: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamError> {
        if fields.is_empty() {
            return Err(StreamError::InvalidConfiguration(format!(
                "cannot add an entry without fields to {stream}"
            )));
        }

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg(id);
        for (field, value) in fields {
            cmd.arg(field.as_str()).arg(value.as_str());
        }

        let mut conn = self.connection.clone();
        let added: String = cmd.query_async(&mut conn).await?;
        Ok(added)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        offset: &str,
        mkstream: bool,
    ) -> Result<(), StreamError> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(offset);
        if mkstream {
            cmd.arg("MKSTREAM");
        }

        let mut conn = self.connection.clone();
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> Result<u64, StreamError> {
        let mut conn = self.connection.clone();
        let destroyed: u64 = redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await?;
        Ok(destroyed)
    }

    async fn set_group_offset(
        &self,
        stream: &str,
        group: &str,
        offset: &str,
    ) -> Result<(), StreamError> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("XGROUP")
            .arg("SETID")
            .arg(stream)
            .arg(group)
            .arg(offset)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, StreamError> {
        let mut conn = self.connection.clone();
        let pending: u64 = redis::cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await?;
        Ok(pending)
    }
}

/// Opens a fresh `RedisStreamClient` for every subscription.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    addr: String,
    connection_timeout: Option<Duration>,
}

impl RedisConnector {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_owned(),
            connection_timeout: None,
        }
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Box<dyn StreamClient>, StreamError> {
        let client = RedisStreamClient::with_config(&self.addr, self.connection_timeout).await?;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_message_defaults_deleted_fields() {
        let message = into_message(("1-0".to_string(), None));
        assert_eq!(message.id, "1-0");
        assert!(message.fields.is_empty());
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_zero_connection_timeout_is_rejected() {
        let result = RedisStreamClient::with_config("redis://localhost:6379", Some(Duration::ZERO))
            .await;
        assert!(matches!(
            result,
            Err(StreamError::InvalidConfiguration(_))
        ));
    }
}
