pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod forwarder;
pub mod reconcile;
pub mod subscription;
pub mod trigger;

pub use config::ConsumerConfig;
pub use consumer::StreamConsumer;
pub use context::{ConsumeContext, ConsumerIdentity, ErrorHandler, MessageHandler};
pub use error::{ConsumeError, ConsumerError};
pub use forwarder::Forwarder;
pub use subscription::{StreamOffset, SubscriptionState};
