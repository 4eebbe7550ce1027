use std::str::FromStr;

use stream_common::NEVER_DELIVERED_OFFSET;

/// A stream key and where the group read should start from on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOffset {
    pub stream: String,
    pub offset: String,
}

impl StreamOffset {
    pub fn new(stream: &str, offset: &str) -> Self {
        Self {
            stream: stream.to_owned(),
            offset: offset.to_owned(),
        }
    }

    /// Replay this consumer's pending history from the beginning.
    pub fn zero(stream: &str) -> Self {
        Self::new(stream, stream_common::ZERO_OFFSET)
    }

    /// Only entries never delivered to the group.
    pub fn never_delivered(stream: &str) -> Self {
        Self::new(stream, NEVER_DELIVERED_OFFSET)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseStreamOffsetError(pub String);

/// Parse `key` or `key=offset`. Keys commonly contain `:` so `=` separates the offset.
impl FromStr for StreamOffset {
    type Err = ParseStreamOffsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream, offset) = s.split_once('=').unwrap_or((s, ""));
        let stream = stream.trim();
        if stream.is_empty() {
            return Err(ParseStreamOffsetError(s.to_owned()));
        }
        Ok(StreamOffset::new(stream, offset.trim()))
    }
}

/// The streams of one subscription and the offsets they are read from.
///
/// `keys` and `offsets` are index aligned. Keys keep the order they were subscribed in,
/// later duplicates of a key are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    keys: Vec<String>,
    offsets: Vec<String>,
}

impl SubscriptionState {
    /// Resolve offsets, an empty offset meaning never delivered entries.
    pub fn new(streams: &[StreamOffset]) -> Self {
        let mut keys: Vec<String> = Vec::with_capacity(streams.len());
        let mut offsets = Vec::with_capacity(streams.len());

        for stream in streams {
            if keys.contains(&stream.stream) {
                continue;
            }
            keys.push(stream.stream.clone());
            offsets.push(if stream.offset.is_empty() {
                NEVER_DELIVERED_OFFSET.to_owned()
            } else {
                stream.offset.clone()
            });
        }

        Self { keys, offsets }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn offsets(&self) -> &[String] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_offset_defaults_to_never_delivered() {
        let state = SubscriptionState::new(&[
            StreamOffset::new("orders", ""),
            StreamOffset::zero("payments"),
        ]);
        assert_eq!(state.keys(), ["orders", "payments"]);
        assert_eq!(state.offsets(), [">", "0"]);
    }

    #[test]
    fn test_keeps_argument_order_and_drops_duplicates() {
        let state = SubscriptionState::new(&[
            StreamOffset::never_delivered("b"),
            StreamOffset::never_delivered("a"),
            StreamOffset::zero("b"),
        ]);
        assert_eq!(state.keys(), ["b", "a"]);
        assert_eq!(state.offsets(), [">", ">"]);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_parse_stream_offset() {
        assert_eq!(
            "events:orders".parse(),
            Ok(StreamOffset::new("events:orders", ""))
        );
        assert_eq!(
            "events:orders=0".parse(),
            Ok(StreamOffset::new("events:orders", "0"))
        );
        assert_eq!(
            " orders = > ".parse(),
            Ok(StreamOffset::new("orders", ">"))
        );
        assert!("=0".parse::<StreamOffset>().is_err());
    }
}
