use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StreamError;

/// Let redis generate the entry id on `XADD`.
pub const AUTO_INCREMENT: &str = "*";
/// Group read offset for entries never delivered to any consumer of the group.
pub const NEVER_DELIVERED_OFFSET: &str = ">";
/// Beginning of a stream, or of a consumer's pending history.
pub const ZERO_OFFSET: &str = "0";
/// Last entry of a stream, used when creating a group that should only see new entries.
pub const LAST_OFFSET: &str = "$";

/// An entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamMessage {
    pub fn new(id: &str, fields: HashMap<String, String>) -> Self {
        Self {
            id: id.to_owned(),
            fields,
        }
    }

    /// Fields as ordered pairs, suitable to write the entry back with `XADD`.
    pub fn field_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .fields
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        pairs.sort();
        pairs
    }
}

/// Entries returned by a group read for one stream key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntries {
    pub stream: String,
    pub messages: Vec<StreamMessage>,
}

/// Broker metadata about an entry delivered to a group but not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// The stream commands the consumer engine and its collaborators rely on.
///
/// Implementations map each method 1:1 to a redis stream command.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// `XREADGROUP GROUP group consumer COUNT count BLOCK block STREAMS keys.. offsets..`
    ///
    /// `keys` and `offsets` are index aligned. A read that found nothing before `block`
    /// elapsed returns an empty list.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
        keys: &[String],
        offsets: &[String],
    ) -> Result<Vec<StreamEntries>, StreamError>;

    /// `XPENDING stream group start end count`, ascending by id.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError>;

    /// `XCLAIM stream group consumer min_idle ids..`
    ///
    /// The reply keeps the relative order of `ids` and silently omits entries that could
    /// not be claimed.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StreamError>;

    /// `XRANGE stream id id COUNT 1`, true when the entry is still in the stream.
    async fn exists(&self, stream: &str, id: &str) -> Result<bool, StreamError>;

    /// `XACK stream group ids..`
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError>;

    /// `XDEL stream ids..`
    async fn del(&self, stream: &str, ids: &[String]) -> Result<u64, StreamError>;

    /// `XADD stream id field value ..`, returns the id of the new entry.
    async fn add(
        &self,
        stream: &str,
        id: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamError>;

    /// `XGROUP CREATE stream group offset [MKSTREAM]`
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        offset: &str,
        mkstream: bool,
    ) -> Result<(), StreamError>;

    /// `XGROUP DESTROY stream group`
    async fn destroy_group(&self, stream: &str, group: &str) -> Result<u64, StreamError>;

    /// `XGROUP SETID stream group offset`
    async fn set_group_offset(
        &self,
        stream: &str,
        group: &str,
        offset: &str,
    ) -> Result<(), StreamError>;

    /// `XGROUP DELCONSUMER stream group consumer`, returns how many pending entries the
    /// consumer owned.
    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, StreamError>;
}

/// Opens broker sessions. A consumer opens exactly one session per subscription.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamClient>, StreamError>;
}
