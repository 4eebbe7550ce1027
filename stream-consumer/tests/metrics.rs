use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stream_common::metrics::setup_metrics_recorder;
use stream_common::{
    MockStreamClient, StreamClient, StreamError, StreamMessage, AUTO_INCREMENT, LAST_OFFSET,
    NEVER_DELIVERED_OFFSET,
};
use stream_consumer::{ConsumeContext, ConsumerConfig, MessageHandler, StreamConsumer, StreamOffset};

#[derive(Clone, Default)]
struct AckingHandler {
    ids: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MessageHandler for AckingHandler {
    async fn handle(&self, ctx: &ConsumeContext<'_>, stream: &str, message: &StreamMessage) {
        self.ids.lock().unwrap().push(message.id.clone());
        ctx.ack(stream, &[&message.id]).await.unwrap();
    }
}

/// Create `stream` with one entry left idle by a consumer that went away.
async fn abandoned_entry(broker: &MockStreamClient, stream: &str) -> String {
    broker
        .create_group(stream, "g", LAST_OFFSET, true)
        .await
        .unwrap();
    let id = broker
        .add(stream, AUTO_INCREMENT, &[("k".to_string(), "v".to_string())])
        .await
        .unwrap();
    broker
        .read_group(
            "g",
            "c-dead",
            10,
            Duration::ZERO,
            &[stream.to_string()],
            &[NEVER_DELIVERED_OFFSET.to_string()],
        )
        .await
        .unwrap();
    broker.age_pending(stream, "g", &id, Duration::from_secs(60));
    id
}

#[tokio::test]
async fn it_counts_claims_of_streams_reclaimed_before_a_failure() {
    let recorder = setup_metrics_recorder().unwrap();

    let broker = MockStreamClient::new();
    let claimed = abandoned_entry(&broker, "orders").await;
    let ghost = abandoned_entry(&broker, "payments").await;
    broker.delete_before_claim("payments", &ghost);
    broker.fail_next("exists", StreamError::Timeout);

    let handler = AckingHandler::default();
    let consumer = StreamConsumer::new(
        ConsumerConfig {
            max_polling_timeout: Duration::from_millis(2),
            idling_timeout: Duration::from_millis(2),
            ..ConsumerConfig::new("g", "c-1")
        },
        Arc::new(broker.clone()),
        Arc::new(handler.clone()),
    );
    consumer
        .subscribe(&[
            StreamOffset::never_delivered("orders"),
            StreamOffset::never_delivered("payments"),
        ])
        .await
        .unwrap();

    for _ in 0..400 {
        if !broker.calls_for("exists").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    consumer.close().await;

    assert_eq!(*handler.ids.lock().unwrap(), vec![claimed]);
    assert_eq!(broker.calls_for("exists").len(), 1);
    let rendered = recorder.render();
    assert!(
        rendered
            .lines()
            .any(|line| line == "stream_consumer_claimed_messages_total 1"),
        "{rendered}"
    );
}
