use std::time::Duration;

use stream_common::{PendingEntry, StreamClient, StreamError, StreamMessage};
use tracing::{debug, warn};

/// Pending entries fetched per stream on each reclaim, relative to `max_in_flight`.
pub const PENDING_FETCH_COEFFICIENT: usize = 3;
pub const MIN_PENDING_FETCH_SIZE: usize = 16;
pub const MAX_PENDING_FETCH_SIZE: usize = 512;

/// How many pending entries to inspect per stream so that enough idle candidates are
/// found among entries that are still being worked on.
pub fn pending_fetch_size(max_in_flight: usize) -> usize {
    max_in_flight
        .saturating_mul(PENDING_FETCH_COEFFICIENT)
        .clamp(MIN_PENDING_FETCH_SIZE, MAX_PENDING_FETCH_SIZE)
}

/// Ids of the entries idle for at least `min_idle`, oldest id first, at most `limit`.
pub fn select_claim_candidates(
    pending: &[PendingEntry],
    min_idle: Duration,
    limit: usize,
) -> Vec<String> {
    pending
        .iter()
        .filter(|entry| entry.idle >= min_idle)
        .take(limit)
        .map(|entry| entry.id.clone())
        .collect()
}

/// Finds and acknowledges ghosts: entries still referenced by the group's pending list
/// while they were deleted from the stream itself. A claim silently skips them so they
/// would otherwise be pending forever.
pub struct PendingReconciler<'a> {
    client: &'a dyn StreamClient,
    group: &'a str,
}

impl<'a> PendingReconciler<'a> {
    pub fn new(client: &'a dyn StreamClient, group: &'a str) -> Self {
        Self { client, group }
    }

    /// Requested ids missing from the claim reply.
    ///
    /// Both lists are in the same relative order, the reply only omitting ids, so one walk
    /// over each is enough.
    pub fn find_ghosts(requested: &[String], claimed: &[StreamMessage]) -> Vec<String> {
        let mut claimed = claimed.iter().peekable();
        requested
            .iter()
            .filter(|id| match claimed.peek() {
                Some(message) if message.id == **id => {
                    claimed.next();
                    false
                }
                _ => true,
            })
            .cloned()
            .collect()
    }

    /// Acknowledge the ghost candidates confirmed absent from `stream`, returning them.
    ///
    /// A candidate may have been skipped by the claim for another reason, like another
    /// consumer claiming it first: those still exist and are left alone.
    pub async fn purge(
        &self,
        stream: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, StreamError> {
        let mut absent = Vec::with_capacity(candidates.len());
        for id in candidates {
            if self.client.exists(stream, id).await? {
                debug!(stream, id = %id, "claim skipped an entry that still exists");
            } else {
                absent.push(id.clone());
            }
        }

        if !absent.is_empty() {
            let acked = self.client.ack(stream, self.group, &absent).await?;
            warn!(
                stream,
                group = self.group,
                ghosts = ?absent,
                acked,
                "acknowledged pending entries deleted from the stream"
            );
        }
        Ok(absent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use stream_common::{MockStreamClient, NEVER_DELIVERED_OFFSET, ZERO_OFFSET};

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn messages(values: &[&str]) -> Vec<StreamMessage> {
        values
            .iter()
            .map(|id| StreamMessage::new(id, HashMap::new()))
            .collect()
    }

    fn pending(id: &str, idle_ms: u64) -> PendingEntry {
        PendingEntry {
            id: id.to_owned(),
            consumer: "other".to_owned(),
            idle: Duration::from_millis(idle_ms),
            delivery_count: 1,
        }
    }

    #[test]
    fn test_pending_fetch_size_is_clamped() {
        assert_eq!(pending_fetch_size(0), 16);
        assert_eq!(pending_fetch_size(5), 16);
        assert_eq!(pending_fetch_size(8), 24);
        assert_eq!(pending_fetch_size(100), 300);
        assert_eq!(pending_fetch_size(200), 512);
        assert_eq!(pending_fetch_size(usize::MAX), 512);
    }

    #[test]
    fn test_select_claim_candidates() {
        let entries = vec![
            pending("1-0", 500),
            pending("2-0", 100),
            pending("3-0", 300),
            pending("4-0", 900),
        ];
        assert_eq!(
            select_claim_candidates(&entries, Duration::from_millis(300), 8),
            ids(&["1-0", "3-0", "4-0"])
        );
        assert_eq!(
            select_claim_candidates(&entries, Duration::from_millis(300), 2),
            ids(&["1-0", "3-0"])
        );
        assert!(select_claim_candidates(&entries, Duration::from_secs(1), 8).is_empty());
    }

    #[test]
    fn test_find_ghosts() {
        let requested = ids(&["1-0", "2-0", "3-0", "4-0"]);

        let everything = messages(&["1-0", "2-0", "3-0", "4-0"]);
        assert!(PendingReconciler::find_ghosts(&requested, &everything).is_empty());
        assert_eq!(
            PendingReconciler::find_ghosts(&requested, &messages(&["2-0", "4-0"])),
            ids(&["1-0", "3-0"])
        );
        assert_eq!(
            PendingReconciler::find_ghosts(&requested, &messages(&["1-0"])),
            ids(&["2-0", "3-0", "4-0"])
        );
        assert_eq!(PendingReconciler::find_ghosts(&requested, &[]), requested);
        assert!(PendingReconciler::find_ghosts(&[], &[]).is_empty());
    }

    async fn seeded() -> MockStreamClient {
        let client = MockStreamClient::new();
        client.create_group("s", "g", ZERO_OFFSET, true).await.unwrap();
        for _ in 0..2 {
            client
                .add("s", "*", &[("k".to_string(), "v".to_string())])
                .await
                .unwrap();
        }
        client
            .read_group(
                "g",
                "c-dead",
                10,
                Duration::ZERO,
                &ids(&["s"]),
                &ids(&[NEVER_DELIVERED_OFFSET]),
            )
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn test_purge_acks_only_absent_entries() {
        let client = seeded().await;
        let owners = client.pending_owners("s", "g");
        let (deleted, kept) = (owners[0].0.clone(), owners[1].0.clone());
        client.del("s", &[deleted.clone()]).await.unwrap();

        let reconciler = PendingReconciler::new(&client, "g");
        let purged = reconciler
            .purge("s", &[deleted.clone(), kept.clone()])
            .await
            .unwrap();

        assert_eq!(purged, vec![deleted.clone()]);
        assert_eq!(client.calls_for("exists").len(), 2);
        let acks = client.calls_for("ack");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].ids, vec![deleted]);
        assert_eq!(
            client.pending_owners("s", "g"),
            vec![(kept, "c-dead".to_string())]
        );
    }

    #[tokio::test]
    async fn test_purge_skips_ack_when_everything_exists() {
        let client = seeded().await;
        let candidates: Vec<String> = client
            .pending_owners("s", "g")
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let purged = PendingReconciler::new(&client, "g")
            .purge("s", &candidates)
            .await
            .unwrap();

        assert!(purged.is_empty());
        assert!(client.calls_for("ack").is_empty());
        assert_eq!(client.pending_owners("s", "g").len(), 2);
    }

    #[tokio::test]
    async fn test_purge_propagates_existence_check_errors() {
        let client = seeded().await;
        client.fail_next("exists", StreamError::Timeout);

        let result = PendingReconciler::new(&client, "g")
            .purge("s", &ids(&["1-0"]))
            .await;

        assert!(matches!(result, Err(StreamError::Timeout)));
        assert!(client.calls_for("ack").is_empty());
    }
}
