pub mod admin;
pub mod client;
pub mod error;
pub mod health;
pub mod metrics;
pub mod mock;
pub mod producer;
pub mod redis_client;

pub use admin::AdminClient;
pub use client::{
    Connector, PendingEntry, StreamClient, StreamEntries, StreamMessage, AUTO_INCREMENT,
    LAST_OFFSET, NEVER_DELIVERED_OFFSET, ZERO_OFFSET,
};
pub use error::StreamError;
pub use mock::{MockStreamCall, MockStreamClient};
pub use producer::Producer;
pub use redis_client::{RedisConnector, RedisStreamClient};
