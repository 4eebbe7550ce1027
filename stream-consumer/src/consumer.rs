use std::sync::{Arc, OnceLock};
use std::time::Instant;

use stream_common::health::{ComponentStatus, HealthHandle};
use stream_common::{Connector, StreamClient, StreamError, StreamMessage};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::ConsumerConfig;
use crate::context::{ConsumeContext, ConsumerIdentity, ErrorHandler, MessageHandler};
use crate::error::{ConsumeError, ConsumerError};
use crate::reconcile::{pending_fetch_size, select_claim_candidates, PendingReconciler};
use crate::subscription::{StreamOffset, SubscriptionState};
use crate::trigger::CyclicTrigger;

/// Reads a set of streams as one member of a consumer group, dispatching every entry to a
/// `MessageHandler` from a background poll loop.
///
/// Each iteration of the loop reads entries never delivered to the group, then, when reads
/// came back short or periodically, claims entries other consumers left idle for too long.
/// Pending entries whose stream entry was deleted are acknowledged instead of dispatched.
///
/// A consumer runs at most one subscription. Once closed, or after failing to connect, it
/// cannot be subscribed again. Dropping a consumer stops its poll loop without waiting for
/// it, use `close` to wait for the in flight iteration.
pub struct StreamConsumer {
    config: ConsumerConfig,
    identity: Arc<ConsumerIdentity>,
    connector: Arc<dyn Connector>,
    message_handler: Arc<dyn MessageHandler>,
    unhandled_message_handler: Option<Arc<dyn MessageHandler>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    liveness: Option<HealthHandle>,
    span: Option<Span>,
    stop: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    disposed: bool,
    trigger: Option<Arc<CyclicTrigger>>,
    subscription: Option<Arc<SubscriptionState>>,
    poll_loop: Option<JoinHandle<()>>,
}

impl StreamConsumer {
    pub fn new(
        config: ConsumerConfig,
        connector: Arc<dyn Connector>,
        message_handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let identity = Arc::new(ConsumerIdentity {
            group: config.group.clone(),
            name: config.name.clone(),
        });
        Self {
            config,
            identity,
            connector,
            message_handler,
            unhandled_message_handler: None,
            error_handler: None,
            liveness: None,
            span: None,
            stop: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Handler receiving messages passed to `ConsumeContext::forward_unhandled_message`.
    pub fn with_unhandled_message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.unhandled_message_handler = Some(handler);
        self
    }

    /// Policy deciding whether the poll loop survives a broker error.
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Report healthy once per poll iteration, and unhealthy when the loop stops on an
    /// error.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Span the poll loop runs in. Defaults to a `stream_consumer` span carrying the group
    /// and consumer name.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.running
    }

    pub async fn is_closed(&self) -> bool {
        self.lifecycle.lock().await.disposed
    }

    /// Streams and offsets of the active subscription, if any.
    pub async fn subscription(&self) -> Option<Arc<SubscriptionState>> {
        self.lifecycle.lock().await.subscription.clone()
    }

    /// Open a session and start polling `streams`.
    ///
    /// Subscribing to no stream does nothing. A failed connection closes the consumer.
    ///
    /// # Errors
    /// `Disposed` once closed, `AlreadyRunning` while a subscription is active, and
    /// `Connect` when the session could not be opened.
    pub async fn subscribe(&self, streams: &[StreamOffset]) -> Result<(), ConsumerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.disposed {
            return Err(ConsumerError::Disposed);
        }
        if lifecycle.running {
            return Err(ConsumerError::AlreadyRunning);
        }
        if streams.is_empty() {
            return Ok(());
        }
        self.config.validate()?;

        lifecycle.running = true;
        let occurrence_rate = self.config.claim_occurrence_rate;
        let trigger = lifecycle
            .trigger
            .get_or_insert_with(|| Arc::new(CyclicTrigger::new(occurrence_rate)))
            .clone();

        let session = match self.connector.connect().await {
            Ok(session) => session,
            Err(err) => {
                error!(
                    group = %self.identity.group,
                    consumer = %self.identity.name,
                    error = %err,
                    "failed to open a stream session"
                );
                lifecycle.running = false;
                lifecycle.disposed = true;
                return Err(ConsumerError::Connect(err));
            }
        };

        let subscription = Arc::new(SubscriptionState::new(streams));
        trigger.reset();

        let poll_loop = PollLoop {
            session,
            subscription: subscription.clone(),
            trigger,
            identity: self.identity.clone(),
            config: self.config.clone(),
            message_handler: self.message_handler.clone(),
            unhandled_message_handler: self.unhandled_message_handler.clone(),
            error_handler: self.error_handler.clone(),
            liveness: self.liveness.clone(),
            stop: self.stop.clone(),
        };
        let span = self.span.clone().unwrap_or_else(|| {
            info_span!(
                "stream_consumer",
                group = %self.identity.group,
                consumer = %self.identity.name
            )
        });

        lifecycle.subscription = Some(subscription);
        lifecycle.poll_loop = Some(tokio::spawn(poll_loop.run().instrument(span)));
        Ok(())
    }

    /// Stop the poll loop and release its session, waiting for the in flight iteration
    /// to complete. Calling it again returns immediately.
    pub async fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.disposed {
            return;
        }

        self.stop.cancel();
        if let Some(poll_loop) = lifecycle.poll_loop.take() {
            if let Err(err) = poll_loop.await {
                error!(
                    group = %self.identity.group,
                    consumer = %self.identity.name,
                    error = %err,
                    "poll loop did not complete"
                );
            }
        }

        lifecycle.running = false;
        lifecycle.disposed = true;
        info!(
            group = %self.identity.group,
            consumer = %self.identity.name,
            "stream consumer closed"
        );
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Why an iteration could not complete.
#[derive(Debug)]
enum PollError {
    /// A broker call failed, the error handler decides what happens next.
    Broker(StreamError),
    /// The loop must stop whatever the error handler says.
    Fatal(ConsumeError),
}

impl From<StreamError> for PollError {
    fn from(err: StreamError) -> Self {
        PollError::Broker(err)
    }
}

/// What an iteration delivered to the message handler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PollYield {
    read: usize,
    claimed: usize,
}

impl PollYield {
    fn is_idle(&self) -> bool {
        self.read == 0 && self.claimed == 0
    }
}

/// State owned by the background task of one subscription.
struct PollLoop {
    session: Box<dyn StreamClient>,
    subscription: Arc<SubscriptionState>,
    trigger: Arc<CyclicTrigger>,
    identity: Arc<ConsumerIdentity>,
    config: ConsumerConfig,
    message_handler: Arc<dyn MessageHandler>,
    unhandled_message_handler: Option<Arc<dyn MessageHandler>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    liveness: Option<HealthHandle>,
    stop: CancellationToken,
}

impl PollLoop {
    async fn run(self) {
        info!(streams = ?self.subscription.keys(), "poll loop started");

        while !self.stop.is_cancelled() {
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy();
            }

            let started = Instant::now();
            let result = self.poll_once().await;
            metrics::histogram!("stream_consumer_poll_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            match result {
                Ok(polled) if polled.is_idle() => {
                    metrics::counter!("stream_consumer_idle_backoffs_total").increment(1);
                    tokio::select! {
                        _ = self.stop.cancelled() => {}
                        _ = tokio::time::sleep(self.config.idling_timeout) => {}
                    }
                }
                Ok(polled) => {
                    debug!(read = polled.read, claimed = polled.claimed, "poll iteration done");
                }
                Err(PollError::Broker(err)) => {
                    metrics::counter!("stream_consumer_errors_total").increment(1);
                    let keep_polling = self
                        .error_handler
                        .as_ref()
                        .is_some_and(|handler| handler.handle(&err));
                    if !keep_polling {
                        error!(error = %err, "stopping poll loop on stream error");
                        self.report_unhealthy();
                        break;
                    }
                    warn!(error = %err, "stream error handled, polling again");
                }
                Err(PollError::Fatal(err)) => {
                    metrics::counter!("stream_consumer_errors_total").increment(1);
                    error!(fatal = true, error = %err, "stopping poll loop");
                    self.report_unhealthy();
                    break;
                }
            }
        }

        info!("poll loop stopped, releasing stream session");
    }

    fn report_unhealthy(&self) {
        if let Some(liveness) = &self.liveness {
            liveness.report_status(ComponentStatus::Unhealthy);
        }
    }

    async fn poll_once(&self) -> Result<PollYield, PollError> {
        let read = self.read().await?;

        // Spin first so the periodic sweep keeps its pace whatever reads return.
        let sweep_due = self.trigger.spin();
        let claimed = if sweep_due || read < self.config.claim_sensitivity {
            self.reclaim().await?
        } else {
            0
        };

        Ok(PollYield { read, claimed })
    }

    /// Read entries never delivered to the group and dispatch them in reply order.
    async fn read(&self) -> Result<usize, PollError> {
        let replies = self
            .session
            .read_group(
                &self.identity.group,
                &self.identity.name,
                self.config.max_in_flight,
                self.config.max_polling_timeout,
                self.subscription.keys(),
                self.subscription.offsets(),
            )
            .await?;

        let mut read = 0;
        for entries in &replies {
            for message in &entries.messages {
                self.dispatch(&entries.stream, message).await?;
                read += 1;
            }
        }

        metrics::counter!("stream_consumer_read_messages_total").increment(read as u64);
        Ok(read)
    }

    /// Claim idle pending entries of every subscribed stream, purging ghosts, and dispatch
    /// what was claimed.
    async fn reclaim(&self) -> Result<usize, PollError> {
        let group = self.identity.group.as_str();
        let fetch_size = pending_fetch_size(self.config.max_in_flight);
        let reconciler = PendingReconciler::new(self.session.as_ref(), group);

        let mut claimed_total = 0;
        for stream in self.subscription.keys() {
            let pending = self
                .session
                .pending(stream, group, "-", "+", fetch_size)
                .await?;
            let candidates = select_claim_candidates(
                &pending,
                self.config.claim_min_idle_time,
                self.config.max_in_flight,
            );
            if candidates.is_empty() {
                continue;
            }

            let claimed = self
                .session
                .claim(
                    stream,
                    group,
                    &self.identity.name,
                    self.config.claim_min_idle_time,
                    &candidates,
                )
                .await?;

            let ghosts = PendingReconciler::find_ghosts(&candidates, &claimed);
            if !ghosts.is_empty() {
                let purged = reconciler.purge(stream, &ghosts).await?;
                metrics::counter!("stream_consumer_ghosts_purged_total")
                    .increment(purged.len() as u64);
            }

            debug!(
                stream = %stream,
                candidates = candidates.len(),
                claimed = claimed.len(),
                "claimed idle pending entries"
            );
            for message in &claimed {
                self.dispatch(stream, message).await?;
            }
            metrics::counter!("stream_consumer_claimed_messages_total")
                .increment(claimed.len() as u64);
            claimed_total += claimed.len();
        }

        Ok(claimed_total)
    }

    async fn dispatch(&self, stream: &str, message: &StreamMessage) -> Result<(), PollError> {
        let fatal = OnceLock::new();
        let ctx = ConsumeContext::new(
            self.session.as_ref(),
            &self.identity,
            self.unhandled_message_handler.as_deref(),
            &fatal,
        );
        self.message_handler.handle(&ctx, stream, message).await;

        match fatal.into_inner() {
            Some(err) => Err(PollError::Fatal(err)),
            None => Ok(()),
        }
    }
}
