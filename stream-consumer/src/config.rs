use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::error::ConsumerError;
use crate::subscription::{ParseStreamOffsetError, StreamOffset};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;
pub const DEFAULT_MAX_POLLING_TIMEOUT: time::Duration = time::Duration::from_millis(10);
pub const DEFAULT_CLAIM_MIN_IDLE_TIME: time::Duration = time::Duration::from_secs(30);
pub const DEFAULT_IDLING_TIMEOUT: time::Duration = time::Duration::from_millis(300);
pub const DEFAULT_CLAIM_SENSITIVITY: usize = 1;
pub const DEFAULT_CLAIM_OCCURRENCE_RATE: u32 = 5;

/// Tuning of a `StreamConsumer` poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Consumer group the consumer reads as.
    pub group: String,
    /// Consumer name within the group.
    pub name: String,
    /// Max entries per stream per group read, and max entries claimed per stream.
    pub max_in_flight: usize,
    /// How long a group read blocks server side waiting for entries.
    pub max_polling_timeout: time::Duration,
    /// Pending entries idle for less than this are left to their owner.
    pub claim_min_idle_time: time::Duration,
    /// Sleep after an iteration that neither read nor claimed anything.
    pub idling_timeout: time::Duration,
    /// Reclaim whenever a read returned fewer entries than this.
    pub claim_sensitivity: usize,
    /// Reclaim every `claim_occurrence_rate` iterations regardless of reads, 0 disables it.
    pub claim_occurrence_rate: u32,
}

impl ConsumerConfig {
    pub fn new(group: &str, name: &str) -> Self {
        Self {
            group: group.to_owned(),
            name: name.to_owned(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_polling_timeout: DEFAULT_MAX_POLLING_TIMEOUT,
            claim_min_idle_time: DEFAULT_CLAIM_MIN_IDLE_TIME,
            idling_timeout: DEFAULT_IDLING_TIMEOUT,
            claim_sensitivity: DEFAULT_CLAIM_SENSITIVITY,
            claim_occurrence_rate: DEFAULT_CLAIM_OCCURRENCE_RATE,
        }
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.group.is_empty() || self.name.is_empty() {
            return Err(ConsumerError::InvalidConfiguration(
                "consumer group and name cannot be empty".to_owned(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(ConsumerError::InvalidConfiguration(
                "max_in_flight must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "5000")]
    pub redis_connection_timeout: EnvMsDuration,

    #[envconfig(default = "stream-consumer")]
    pub consumer_group: NonEmptyString,

    #[envconfig(default = "consumer")]
    pub consumer_name: NonEmptyString,

    /// Comma separated `key` or `key=offset` list.
    pub streams: StreamList,

    /// Create the consumer group on every stream at startup, and the streams themselves.
    #[envconfig(default = "true")]
    pub create_groups: bool,

    /// Where groups created at startup start reading from.
    #[envconfig(default = "$")]
    pub group_start_offset: NonEmptyString,

    #[envconfig(default = "8")]
    pub max_in_flight: usize,

    #[envconfig(default = "10")]
    pub max_polling_timeout: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub claim_min_idle_time: EnvMsDuration,

    #[envconfig(default = "300")]
    pub idling_timeout: EnvMsDuration,

    #[envconfig(default = "1")]
    pub claim_sensitivity: usize,

    #[envconfig(default = "5")]
    pub claim_occurrence_rate: u32,

    /// Messages the handler gives up on are forwarded to this stream when set.
    pub dead_letter_stream: Option<NonEmptyString>,

    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_in_flight: self.max_in_flight,
            max_polling_timeout: self.max_polling_timeout.0,
            claim_min_idle_time: self.claim_min_idle_time.0,
            idling_timeout: self.idling_timeout.0,
            claim_sensitivity: self.claim_sensitivity,
            claim_occurrence_rate: self.claim_occurrence_rate,
            ..ConsumerConfig::new(self.consumer_group.as_str(), self.consumer_name.as_str())
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamList(pub Vec<StreamOffset>);

impl FromStr for StreamList {
    type Err = ParseStreamOffsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let streams = s
            .split(',')
            .filter(|item| !item.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<StreamOffset>, _>>()?;
        if streams.is_empty() {
            return Err(ParseStreamOffsetError(s.to_owned()));
        }
        Ok(StreamList(streams))
    }
}
