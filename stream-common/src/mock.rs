use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::client::{
    Connector, PendingEntry, StreamClient, StreamEntries, StreamMessage, AUTO_INCREMENT,
    LAST_OFFSET, NEVER_DELIVERED_OFFSET,
};
use crate::error::StreamError;

/// An in-memory broker with redis consumer group semantics.
///
/// Clones share the same state, so a test can hold one clone to seed and inspect streams
/// while the code under test drives another one.
#[derive(Clone, Default)]
pub struct MockStreamClient {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockStreamCall {
    pub op: String,
    pub stream: String,
    pub ids: Vec<String>,
}

#[derive(Default)]
struct MockState {
    streams: HashMap<String, MockStream>,
    calls: Vec<MockStreamCall>,
    failures: HashMap<String, VecDeque<StreamError>>,
    deletions_before_claim: Vec<(String, String)>,
    connect_error: Option<StreamError>,
    connections: usize,
}

#[derive(Default)]
struct MockStream {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, MockGroup>,
}

#[derive(Default)]
struct MockGroup {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, MockPending>,
}

struct MockPending {
    consumer: String,
    delivered_at: Instant,
    extra_idle: Duration,
    delivery_count: u64,
}

impl MockPending {
    fn new(consumer: &str) -> Self {
        Self {
            consumer: consumer.to_owned(),
            delivered_at: Instant::now(),
            extra_idle: Duration::ZERO,
            delivery_count: 1,
        }
    }

    fn idle(&self) -> Duration {
        self.delivered_at.elapsed() + self.extra_idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl FromStr for EntryId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StreamError::response("ERR", format!("Invalid stream ID '{s}'"));
        match s {
            "-" => Ok(EntryId { ms: 0, seq: 0 }),
            "+" => Ok(EntryId {
                ms: u64::MAX,
                seq: u64::MAX,
            }),
            _ => match s.split_once('-') {
                Some((ms, seq)) => Ok(EntryId {
                    ms: ms.parse().map_err(|_| invalid())?,
                    seq: seq.parse().map_err(|_| invalid())?,
                }),
                None => Ok(EntryId {
                    ms: s.parse().map_err(|_| invalid())?,
                    seq: 0,
                }),
            },
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

fn no_group(stream: &str, group: &str) -> StreamError {
    StreamError::response(
        "NOGROUP",
        format!("No such key '{stream}' or consumer group '{group}'"),
    )
}

fn message(id: EntryId, fields: Option<&HashMap<String, String>>) -> StreamMessage {
    StreamMessage {
        id: id.to_string(),
        fields: fields.cloned().unwrap_or_default(),
    }
}

impl MockState {
    fn record(&mut self, op: &str, stream: &str, ids: &[String]) -> Result<(), StreamError> {
        self.calls.push(MockStreamCall {
            op: op.to_owned(),
            stream: stream.to_owned(),
            ids: ids.to_vec(),
        });
        match self.failures.get_mut(op).and_then(|queue| queue.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut MockGroup, StreamError> {
        self.streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))
    }

    fn read_one(
        &mut self,
        group: &str,
        consumer: &str,
        count: usize,
        key: &str,
        offset: &str,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let stream = self
            .streams
            .get_mut(key)
            .ok_or_else(|| no_group(key, group))?;
        let entries = &stream.entries;
        let group_state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(key, group))?;

        if offset == NEVER_DELIVERED_OFFSET {
            let fresh: Vec<EntryId> = entries
                .range(group_state.last_delivered..)
                .map(|(id, _)| *id)
                .filter(|id| *id > group_state.last_delivered)
                .take(count)
                .collect();
            let mut messages = Vec::with_capacity(fresh.len());
            for id in fresh {
                group_state.last_delivered = id;
                group_state.pending.insert(id, MockPending::new(consumer));
                messages.push(message(id, entries.get(&id)));
            }
            return Ok(messages);
        }

        // An explicit offset replays this consumer's own pending history.
        let from: EntryId = offset.parse()?;
        Ok(group_state
            .pending
            .iter()
            .filter(|(id, pending)| **id > from && pending.consumer == consumer)
            .take(count)
            .map(|(id, _)| message(*id, entries.get(id)))
            .collect())
    }
}

impl MockStreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue an error returned by the next call to `op` (the `StreamClient` method name).
    pub fn fail_next(&self, op: &str, err: StreamError) -> Self {
        self.lock_state()
            .failures
            .entry(op.to_owned())
            .or_default()
            .push_back(err);
        self.clone()
    }

    /// Delete `id` from `stream` right before the next claim on that stream runs, leaving
    /// its pending entries untouched, like a concurrent `XDEL` racing the claim.
    pub fn delete_before_claim(&self, stream: &str, id: &str) -> Self {
        self.lock_state()
            .deletions_before_claim
            .push((stream.to_owned(), id.to_owned()));
        self.clone()
    }

    /// Make every `Connector::connect` call fail with `err`.
    pub fn connect_error(&self, err: StreamError) -> Self {
        self.lock_state().connect_error = Some(err);
        self.clone()
    }

    /// Pretend a pending entry has been idle for `by` longer than it really was.
    pub fn age_pending(&self, stream: &str, group: &str, id: &str, by: Duration) {
        let Ok(entry_id) = id.parse::<EntryId>() else {
            return;
        };
        let mut state = self.lock_state();
        if let Ok(group) = state.group_mut(stream, group) {
            if let Some(pending) = group.pending.get_mut(&entry_id) {
                pending.extra_idle += by;
            }
        }
    }

    /// Pending entry ids of a group, with their owning consumer.
    pub fn pending_owners(&self, stream: &str, group: &str) -> Vec<(String, String)> {
        let mut state = self.lock_state();
        match state.group_mut(stream, group) {
            Ok(group) => group
                .pending
                .iter()
                .map(|(id, pending)| (id.to_string(), pending.consumer.clone()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.lock_state()
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len())
    }

    pub fn get_calls(&self) -> Vec<MockStreamCall> {
        self.lock_state().calls.clone()
    }

    pub fn calls_for(&self, op: &str) -> Vec<MockStreamCall> {
        self.lock_state()
            .calls
            .iter()
            .filter(|call| call.op == op)
            .cloned()
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.lock_state().connections
    }
}

#[async_trait]
impl StreamClient for MockStreamClient {
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
        keys: &[String],
        offsets: &[String],
    ) -> Result<Vec<StreamEntries>, StreamError> {
        let replies = {
            let mut state = self.lock_state();
            state.record("read_group", &keys.join(","), offsets)?;
            if keys.len() != offsets.len() {
                return Err(StreamError::response(
                    "ERR",
                    "Unbalanced XREADGROUP list of streams",
                ));
            }

            let mut replies = Vec::new();
            for (key, offset) in keys.iter().zip(offsets) {
                let messages = state.read_one(group, consumer, count, key, offset)?;
                if !messages.is_empty() {
                    replies.push(StreamEntries {
                        stream: key.to_owned(),
                        messages,
                    });
                }
            }
            replies
        };

        if replies.is_empty() && !block.is_zero() {
            tokio::time::sleep(block).await;
        }
        Ok(replies)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        let mut state = self.lock_state();
        state.record("pending", stream, &[])?;
        let (start, end): (EntryId, EntryId) = (start.parse()?, end.parse()?);
        let group = state.group_mut(stream, group)?;

        Ok(group
            .pending
            .range(start..=end)
            .take(count)
            .map(|(id, pending)| PendingEntry {
                id: id.to_string(),
                consumer: pending.consumer.clone(),
                idle: pending.idle(),
                delivery_count: pending.delivery_count,
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
        let mut state = self.lock_state();
        state.record("claim", stream, ids)?;

        let (racing, remaining): (Vec<_>, Vec<_>) =
            std::mem::take(&mut state.deletions_before_claim)
                .into_iter()
                .partition(|(key, _)| key == stream);
        state.deletions_before_claim = remaining;

        let key = stream;
        let stream = state
            .streams
            .get_mut(key)
            .ok_or_else(|| no_group(key, group))?;
        for (_, id) in racing {
            stream.entries.remove(&id.parse::<EntryId>()?);
        }

        let entries = &stream.entries;
        let group_state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(key, group))?;

        let mut claimed = Vec::new();
        for id in ids {
            let id: EntryId = id.parse()?;
            let Some(fields) = entries.get(&id) else {
                continue;
            };
            if let Some(pending) = group_state.pending.get_mut(&id) {
                if pending.idle() >= min_idle {
                    pending.consumer = consumer.to_owned();
                    pending.delivered_at = Instant::now();
                    pending.extra_idle = Duration::ZERO;
                    pending.delivery_count += 1;
                    claimed.push(message(id, Some(fields)));
                }
            }
        }
        Ok(claimed)
    }

    async fn exists(&self, stream: &str, id: &str) -> Result<bool, StreamError> {
        let mut state = self.lock_state();
        state.record("exists", stream, &[id.to_owned()])?;
        let id: EntryId = id.parse()?;
        Ok(state
            .streams
            .get(stream)
            .is_some_and(|s| s.entries.contains_key(&id)))
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError> {
        let mut state = self.lock_state();
        state.record("ack", stream, ids)?;
        let group = state.group_mut(stream, group)?;

        let mut acked = 0;
        for id in ids {
            if group.pending.remove(&id.parse::<EntryId>()?).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn del(&self, stream: &str, ids: &[String]) -> Result<u64, StreamError> {
        let mut state = self.lock_state();
        state.record("del", stream, ids)?;
        let Some(stream) = state.streams.get_mut(stream) else {
            return Ok(0);
        };

        let mut deleted = 0;
        for id in ids {
            if stream.entries.remove(&id.parse::<EntryId>()?).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn add(
        &self,
        stream: &str,
        id: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamError> {
        let mut state = self.lock_state();
        state.record("add", stream, &[id.to_owned()])?;
        let stream = state.streams.entry(stream.to_owned()).or_default();

        let id = if id == AUTO_INCREMENT {
            EntryId {
                ms: stream.last_id.ms + 1,
                seq: 0,
            }
        } else {
            let id: EntryId = id.parse()?;
            if id <= stream.last_id {
                return Err(StreamError::response(
                    "ERR",
                    "The ID specified in XADD is equal or smaller than the target stream top item",
                ));
            }
            id
        };

        stream.last_id = id;
        stream.entries.insert(id, fields.iter().cloned().collect());
        Ok(id.to_string())
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        offset: &str,
        mkstream: bool,
    ) -> Result<(), StreamError> {
        let mut state = self.lock_state();
        state.record("create_group", stream, &[offset.to_owned()])?;
        if !mkstream && !state.streams.contains_key(stream) {
            return Err(StreamError::response(
                "ERR",
                "The XGROUP subcommand requires the key to exist",
            ));
        }

        let stream = state.streams.entry(stream.to_owned()).or_default();
        if stream.groups.contains_key(group) {
            return Err(StreamError::response(
                "BUSYGROUP",
                "Consumer Group name already exists",
            ));
        }
        let last_delivered = if offset == LAST_OFFSET {
            stream.last_id
        } else {
            offset.parse()?
        };
        stream.groups.insert(
            group.to_owned(),
            MockGroup {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> Result<u64, StreamError> {
        let mut state = self.lock_state();
        state.record("destroy_group", stream, &[])?;
        Ok(state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.remove(group))
            .map_or(0, |_| 1))
    }

    async fn set_group_offset(
        &self,
        stream: &str,
        group: &str,
        offset: &str,
    ) -> Result<(), StreamError> {
        let mut state = self.lock_state();
        state.record("set_group_offset", stream, &[offset.to_owned()])?;
        let last_id = state.streams.get(stream).map(|s| s.last_id);
        let group = state.group_mut(stream, group)?;
        group.last_delivered = match (offset, last_id) {
            (LAST_OFFSET, Some(last_id)) => last_id,
            _ => offset.parse()?,
        };
        Ok(())
    }

    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, StreamError> {
        let mut state = self.lock_state();
        state.record("delete_consumer", stream, &[consumer.to_owned()])?;
        let group = state.group_mut(stream, group)?;
        let before = group.pending.len();
        group.pending.retain(|_, pending| pending.consumer != consumer);
        Ok(u64::try_from(before - group.pending.len()).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl Connector for MockStreamClient {
    async fn connect(&self) -> Result<Box<dyn StreamClient>, StreamError> {
        let mut state = self.lock_state();
        if let Some(err) = &state.connect_error {
            return Err(err.clone());
        }
        state.connections += 1;
        Ok(Box::new(self.clone()))
    }
}
