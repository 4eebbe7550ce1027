//! Consume redis streams as a member of a consumer group, logging every message.
use std::sync::Arc;

use async_trait::async_trait;
use envconfig::Envconfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stream_common::health::HealthRegistry;
use stream_common::metrics::{app, serve, setup_metrics_recorder};
use stream_common::{AdminClient, Connector, RedisConnector, StreamMessage};
use stream_consumer::config::Config;
use stream_consumer::{ConsumeContext, ConsumerError, Forwarder, MessageHandler, StreamConsumer};

/// Logs and acknowledges messages. Entries that lost their fields, because they were
/// deleted while pending, are handed to the unhandled message handler.
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, ctx: &ConsumeContext<'_>, stream: &str, message: &StreamMessage) {
        if message.fields.is_empty() {
            if let Err(err) = ctx.forward_unhandled_message(stream, message).await {
                warn!(stream, id = %message.id, error = %err, "failed to forward message");
            }
            return;
        }

        info!(stream, id = %message.id, fields = ?message.field_pairs(), "message received");
        if let Err(err) = ctx.ack(stream, &[&message.id]).await {
            warn!(stream, id = %message.id, error = %err, "failed to acknowledge message");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ConsumerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let deadline = time::Duration::try_from(config.liveness_deadline.0)
        .expect("liveness deadline out of range");
    let poll_loop_liveness = liveness.register("poll_loop".to_string(), deadline);

    let connector: Arc<dyn Connector> = Arc::new(
        RedisConnector::new(&config.redis_url)
            .connection_timeout(config.redis_connection_timeout.0),
    );

    if config.create_groups {
        let admin = AdminClient::connect(connector.as_ref())
            .await
            .expect("failed to connect admin client");
        for stream in &config.streams.0 {
            match admin
                .create_consumer_group_with_stream(
                    &stream.stream,
                    config.consumer_group.as_str(),
                    config.group_start_offset.as_str(),
                )
                .await
            {
                Ok(()) => info!(stream = %stream.stream, "consumer group created"),
                Err(err) => info!(
                    stream = %stream.stream,
                    error = %err,
                    "consumer group not created, it may already exist"
                ),
            }
        }
    }

    let mut consumer = StreamConsumer::new(
        config.consumer_config(),
        connector.clone(),
        Arc::new(LoggingHandler),
    )
    .with_liveness(poll_loop_liveness)
    .with_error_handler(Arc::new(|err: &stream_common::StreamError| {
        warn!(error = %err, "stream error");
        !err.is_unrecoverable_error()
    }));

    let mut forwarder = None;
    if let Some(dead_letter_stream) = &config.dead_letter_stream {
        let dead_letter = Arc::new(
            Forwarder::connect(connector.as_ref(), dead_letter_stream.as_str())
                .await
                .expect("failed to connect dead letter forwarder"),
        );
        consumer = consumer.with_unhandled_message_handler(dead_letter.clone());
        forwarder = Some(dead_letter);
    }

    let recorder_handle = setup_metrics_recorder().expect("failed to install metrics recorder");
    consumer.subscribe(&config.streams.0).await?;

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = app(liveness, Some(recorder_handle));
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }

    consumer.close().await;
    if let Some(forwarder) = forwarder {
        forwarder.close();
    }

    Ok(())
}
