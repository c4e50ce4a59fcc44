use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::lease::Lease;
use crate::metrics::{
    JOB_ERROR_TOTAL, JOB_HANDLER_TIMER, JOB_PANIC_TOTAL, JOB_PROCESSED_TOTAL, MetricsSink,
    RECEIVE_ERROR_TOTAL, RECEIVED_TOTAL, SQS_RECEIVE_TIMER,
};
use crate::receiver::config::ConsumerConfig;
use crate::receiver::functions::{InvocationResult, LeaseHandler, supervise};
use crate::transport::{QueueTransport, ReceivedMessage};

/// Everything the consume loops of one worker share. Read-only once the
/// loops are running.
#[derive(Clone)]
pub(crate) struct ConsumerContext {
    pub config: Arc<ConsumerConfig>,
    pub transport: Arc<dyn QueueTransport>,
    pub metrics: Arc<dyn MetricsSink>,
    pub handler: Arc<dyn LeaseHandler>,
}

enum LoopState {
    Polling,
    Dispatching(Vec<ReceivedMessage>),
    ErrorBackoff,
    Stopped,
}

/// A single consume loop: receive a batch, hand every message to the
/// handler, wait for all of them, repeat.
pub(crate) struct Consumer {
    ctx: ConsumerContext,
}

impl Consumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Consumer { ctx }
    }

    /// Runs until cancelled, or until the first batch when `run-once` is set.
    ///
    /// Cancellation is only looked at before each receive. A batch that has
    /// been received is always handled to completion.
    pub async fn run(self, cancel: CancellationToken) {
        let mut state = LoopState::Polling;

        loop {
            state = match state {
                LoopState::Polling => {
                    // A receive that returns straight away must not starve
                    // the other loops on the same runtime thread.
                    tokio::task::yield_now().await;

                    if cancel.is_cancelled() {
                        debug!("cancellation requested, stopping consume loop");
                        LoopState::Stopped
                    } else {
                        self.poll(&cancel).await
                    }
                }
                LoopState::Dispatching(messages) => {
                    self.dispatch(messages, &cancel).await;
                    self.after_batch(&cancel).await
                }
                LoopState::ErrorBackoff => {
                    let sleep = self.ctx.config.error_wait();
                    debug!(sleep = ?sleep, "sleeping before retrying");
                    pause(&cancel, sleep).await;
                    LoopState::Polling
                }
                LoopState::Stopped => return,
            };
        }
    }

    async fn poll(&self, cancel: &CancellationToken) -> LoopState {
        let config = &self.ctx.config;
        let request = config.receive_request();

        debug!(
            wait = ?Duration::from_secs(u64::try_from(request.wait_time_seconds).unwrap_or(0)),
            "calling receive"
        );

        let start = Instant::now();
        let result = self.ctx.transport.receive(&request).await;
        self.ctx
            .metrics
            .observe(SQS_RECEIVE_TIMER, start.elapsed().as_secs_f64());

        match result {
            Err(err) => {
                self.ctx.metrics.increment(RECEIVE_ERROR_TOTAL);
                error!(
                    code = err.code.as_deref(),
                    error = %err.message,
                    "error receiving sqs message"
                );

                if config.is_run_once() {
                    debug!("`run-once` complete");
                    LoopState::Stopped
                } else {
                    LoopState::ErrorBackoff
                }
            }
            Ok(messages) if messages.is_empty() => {
                debug!("no messages on attempt, trying again");
                self.after_batch(cancel).await
            }
            Ok(messages) => {
                self.ctx
                    .metrics
                    .increment_by(RECEIVED_TOTAL, messages.len() as u64);
                debug!(count = messages.len(), "messages retrieved");
                LoopState::Dispatching(messages)
            }
        }
    }

    /// Calls the handler for every message concurrently and returns once all
    /// of the invocations have finished.
    async fn dispatch(&self, messages: Vec<ReceivedMessage>, cancel: &CancellationToken) {
        let mut invocations = JoinSet::new();

        for message in messages {
            let lease = Lease::new(
                message,
                Arc::clone(&self.ctx.config),
                Arc::clone(&self.ctx.transport),
            )
            .with_metrics(Arc::clone(&self.ctx.metrics));
            let handled = lease.handled_flag();
            let message_id = lease.id().to_string();

            debug!(message_id = %message_id, "processing message");

            let handler = Arc::clone(&self.ctx.handler);
            let metrics = Arc::clone(&self.ctx.metrics);
            let cancel = cancel.clone();

            invocations.spawn(async move {
                let start = Instant::now();
                let result = supervise(handler.handle(cancel, lease)).await;
                metrics.observe(JOB_HANDLER_TIMER, start.elapsed().as_secs_f64());

                record_outcome(
                    metrics.as_ref(),
                    &message_id,
                    &result,
                    handled.load(Ordering::Acquire),
                );
            });
        }

        while let Some(joined) = invocations.join_next().await {
            // Panics are caught inside the task, so this only fires if the
            // runtime is shutting down underneath us.
            if let Err(err) = joined {
                error!(error = %err, "message task failed");
                self.ctx.metrics.increment(JOB_ERROR_TOTAL);
            }
        }
    }

    async fn after_batch(&self, cancel: &CancellationToken) -> LoopState {
        let config = &self.ctx.config;

        if let Some(sleep) = config.run_slowly_pause() {
            debug!(sleep = ?sleep, "`run-slowly` kicking in");
            pause(cancel, sleep).await;
        }

        if config.is_run_once() {
            debug!("`run-once` complete");
            return LoopState::Stopped;
        }

        LoopState::Polling
    }
}

/// Counts what a handler invocation did with its lease.
fn record_outcome(
    metrics: &dyn MetricsSink,
    message_id: &str,
    result: &InvocationResult,
    handled: bool,
) {
    if result.recovered {
        if let Some(err) = &result.error {
            error!(message_id = %message_id, error = %err, "message handler panicked");
        }
        metrics.increment(JOB_PANIC_TOTAL);
        metrics.increment(JOB_ERROR_TOTAL);
        return;
    }

    if let Some(err) = &result.error {
        error!(message_id = %message_id, error = %err, "handler errored");
        metrics.increment(JOB_ERROR_TOTAL);
    }

    if !handled {
        error!(message_id = %message_id, "message not handled");
        metrics.increment(JOB_ERROR_TOTAL);
    } else {
        debug!(message_id = %message_id, "message processed successfully");
        metrics.increment(JOB_PROCESSED_TOTAL);
    }
}

/// Sleeps for `duration`, waking early on cancellation.
async fn pause(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ConsumerError, TransportError};
    use crate::metrics::InMemoryMetrics;
    use crate::transport::MockQueueTransport;

    fn context(
        transport: MockQueueTransport,
        config: ConsumerConfig,
        handler: impl LeaseHandler,
    ) -> (ConsumerContext, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let ctx = ConsumerContext {
            config: Arc::new(config),
            transport: Arc::new(transport),
            metrics: metrics.clone(),
            handler: Arc::new(handler),
        };
        (ctx, metrics)
    }

    async fn ignore(_cancel: CancellationToken, _lease: Lease) -> Result<(), ConsumerError> {
        Ok(())
    }

    fn message(id: &str) -> ReceivedMessage {
        ReceivedMessage::new(id)
            .with_receipt_handle(format!("handle-{id}"))
            .with_body("payload")
    }

    #[test]
    fn outcome_accounting() {
        let metrics = InMemoryMetrics::new();
        let ok = InvocationResult {
            error: None,
            recovered: false,
        };
        let failed = InvocationResult {
            error: Some(ConsumerError::from("nope")),
            recovered: false,
        };
        let panicked = InvocationResult {
            error: Some(ConsumerError::HandlerPanicked("boom".to_string())),
            recovered: true,
        };

        record_outcome(&metrics, "a", &ok, true);
        assert_eq!(metrics.counter(JOB_PROCESSED_TOTAL), 1);
        assert_eq!(metrics.counter(JOB_ERROR_TOTAL), 0);

        record_outcome(&metrics, "b", &ok, false);
        assert_eq!(metrics.counter(JOB_ERROR_TOTAL), 1);

        // An error that still finished the lease counts both ways.
        record_outcome(&metrics, "c", &failed, true);
        assert_eq!(metrics.counter(JOB_ERROR_TOTAL), 2);
        assert_eq!(metrics.counter(JOB_PROCESSED_TOTAL), 2);

        record_outcome(&metrics, "d", &failed, false);
        assert_eq!(metrics.counter(JOB_ERROR_TOTAL), 4);

        record_outcome(&metrics, "e", &panicked, false);
        assert_eq!(metrics.counter(JOB_PANIC_TOTAL), 1);
        assert_eq!(metrics.counter(JOB_ERROR_TOTAL), 5);
        assert_eq!(metrics.counter(JOB_PROCESSED_TOTAL), 2);
    }

    #[tokio::test]
    async fn run_once_handles_single_batch() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .withf(|request| request.max_number_of_messages == 1 && request.queue_url == "q")
            .times(1)
            .returning(|_| Ok(vec![message("abc123")]));
        transport
            .expect_delete()
            .times(1)
            .returning(|_, _| Ok(()));

        let (ctx, metrics) = context(
            transport,
            ConsumerConfig::new("q", 1).run_once(),
            |_cancel: CancellationToken, mut lease: Lease| async move { lease.acknowledge().await },
        );

        Consumer::new(ctx).run(CancellationToken::new()).await;

        assert_eq!(metrics.counter(RECEIVED_TOTAL), 1);
        assert_eq!(metrics.counter(JOB_PROCESSED_TOTAL), 1);
        assert_eq!(metrics.counter(JOB_ERROR_TOTAL), 0);
    }

    #[tokio::test]
    async fn run_once_stops_on_empty_queue() {
        let mut transport = MockQueueTransport::new();
        transport.expect_receive().times(1).returning(|_| Ok(vec![]));

        let (ctx, metrics) = context(
            transport,
            ConsumerConfig::new("q", 1).run_once(),
            ignore,
        );

        Consumer::new(ctx).run(CancellationToken::new()).await;

        assert_eq!(metrics.counter(RECEIVED_TOTAL), 0);
        assert_eq!(metrics.counter(JOB_ERROR_TOTAL), 0);
    }

    #[tokio::test]
    async fn run_once_receive_error_stops_without_retry() {
        let mut transport = MockQueueTransport::new();
        transport.expect_receive().times(1).returning(|_| {
            Err(TransportError::new("ReceiveMessage", "aws error peeps").with_code("520"))
        });

        // A long error wait would hang the test if the loop slept.
        let config = ConsumerConfig::new("q", 1)
            .run_once()
            .with_error_wait(Duration::from_secs(3600));
        let (ctx, metrics) = context(
            transport,
            config,
            ignore,
        );

        tokio::time::timeout(Duration::from_secs(5), Consumer::new(ctx).run(CancellationToken::new()))
            .await
            .expect("consume loop slept after a failed receive");

        assert_eq!(metrics.counter(RECEIVE_ERROR_TOTAL), 1);
    }

    #[tokio::test]
    async fn receive_error_backs_off_then_retries() {
        let cancel = CancellationToken::new();
        let mut transport = MockQueueTransport::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let stop = cancel.clone();
        transport.expect_receive().times(2).returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(TransportError::new("ReceiveMessage", "throttled"));
            }
            stop.cancel();
            Ok(vec![])
        });

        let config = ConsumerConfig::new("q", 1).with_error_wait(Duration::from_millis(10));
        let (ctx, metrics) = context(
            transport,
            config,
            ignore,
        );

        Consumer::new(ctx).run(cancel).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.counter(RECEIVE_ERROR_TOTAL), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_receives() {
        let mut transport = MockQueueTransport::new();
        transport.expect_receive().never();

        let (ctx, _) = context(
            transport,
            ConsumerConfig::new("q", 1),
            ignore,
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        Consumer::new(ctx).run(cancel).await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_affect_siblings() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .times(1)
            .returning(|_| Ok(vec![message("ok-1"), message("explode"), message("ok-2")]));
        transport
            .expect_delete()
            .times(2)
            .returning(|_, _| Ok(()));

        let config = ConsumerConfig::new("q", 1)
            .run_once()
            .with_max_number_of_messages(3);
        let (ctx, metrics) = context(
            transport,
            config,
            |_cancel: CancellationToken, mut lease: Lease| async move {
                if lease.id() == "explode" {
                    panic!("handler blew up");
                }
                lease.acknowledge().await
            },
        );

        Consumer::new(ctx).run(CancellationToken::new()).await;

        assert_eq!(metrics.counter(RECEIVED_TOTAL), 3);
        assert_eq!(metrics.counter(JOB_PROCESSED_TOTAL), 2);
        assert_eq!(metrics.counter(JOB_PANIC_TOTAL), 1);
        assert_eq!(metrics.counter(JOB_ERROR_TOTAL), 1);
    }

    #[tokio::test]
    async fn batch_handlers_run_concurrently() {
        let mut transport = MockQueueTransport::new();
        transport
            .expect_receive()
            .times(1)
            .returning(|_| Ok(vec![message("a"), message("b")]));
        transport
            .expect_delete()
            .times(2)
            .returning(|_, _| Ok(()));

        // Each handler waits for the other; sequential dispatch would deadlock.
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let config = ConsumerConfig::new("q", 1)
            .run_once()
            .with_max_number_of_messages(2);
        let (ctx, metrics) = context(transport, config, move |_cancel: CancellationToken, mut lease: Lease| {
            let barrier = Arc::clone(&barrier);
            async move {
                barrier.wait().await;
                lease.acknowledge().await
            }
        });

        tokio::time::timeout(Duration::from_secs(5), Consumer::new(ctx).run(CancellationToken::new()))
            .await
            .expect("handlers were not dispatched concurrently");

        assert_eq!(metrics.counter(JOB_PROCESSED_TOTAL), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_slowly_sleeps_after_each_batch() {
        let cancel = CancellationToken::new();
        let mut transport = MockQueueTransport::new();
        let polls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&polls);
        let stop = cancel.clone();
        transport.expect_receive().times(2).returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 1 {
                stop.cancel();
            }
            Ok(vec![])
        });

        let (ctx, _) = context(
            transport,
            ConsumerConfig::new("q", 1).run_slowly(Duration::from_secs(30)),
            ignore,
        );

        let start = tokio::time::Instant::now();
        Consumer::new(ctx).run(cancel).await;

        assert_eq!(polls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
