use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::ConsumerError;
use crate::metrics::{MetricsSink, NoopMetrics, SQS_JOB_TIMER};
use crate::receiver::config::ConsumerConfig;
use crate::transport::{APPROXIMATE_RECEIVE_COUNT, QueueTransport, ReceivedMessage};
use crate::visibility::clamp_visibility;

/// Exclusive processing rights over one received message.
///
/// A lease is handed to exactly one handler invocation. The handler reports
/// the outcome with one of [`acknowledge`](Lease::acknowledge),
/// [`release`](Lease::release) or [`backoff`](Lease::backoff); once one of
/// them succeeds every further call fails with
/// [`ConsumerError::AlreadyHandled`] without reaching SQS.
pub struct Lease {
    message: ReceivedMessage,
    config: Arc<ConsumerConfig>,
    transport: Arc<dyn QueueTransport>,
    metrics: Arc<dyn MetricsSink>,
    handled: Arc<AtomicBool>,
}

impl Lease {
    /// Wraps a received message.
    ///
    /// # Arguments
    ///
    /// * `message` - The message as returned by the transport
    /// * `config` - Supplies the queue URL, release bounds and backoff policy
    /// * `transport` - Used for the delete or change-visibility call
    pub fn new(
        message: ReceivedMessage,
        config: Arc<ConsumerConfig>,
        transport: Arc<dyn QueueTransport>,
    ) -> Self {
        Lease {
            message,
            config,
            transport,
            metrics: Arc::new(NoopMetrics),
            handled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Lets the dispatcher see the outcome after the lease has been moved
    /// into the handler.
    pub(crate) fn handled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.handled)
    }

    /// Looks for a custom attribute set by the sender, then for an attribute
    /// set by SQS.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.message
            .message_attributes
            .get(key)
            .or_else(|| self.message.system_attributes.get(key))
            .map(String::as_str)
    }

    /// The id SQS assigned to the message.
    pub fn id(&self) -> &str {
        &self.message.message_id
    }

    pub fn body(&self) -> Result<&str, ConsumerError> {
        match self.message.body.as_deref() {
            Some(body) if !body.is_empty() => Ok(body),
            _ => Err(ConsumerError::EmptyBody),
        }
    }

    /// Number of previous attempts at processing the message, zero on first
    /// delivery.
    pub fn attempt_count(&self) -> Result<u32, ConsumerError> {
        let raw = self
            .message
            .system_attributes
            .get(APPROXIMATE_RECEIVE_COUNT)
            .ok_or_else(|| ConsumerError::MissingAttribute(APPROXIMATE_RECEIVE_COUNT.to_string()))?;

        let received: u64 = raw.trim().parse().map_err(|_| {
            warn!(message_id = %self.id(), value = %raw, "unparsable receive count");
            ConsumerError::MissingAttribute(APPROXIMATE_RECEIVE_COUNT.to_string())
        })?;

        Ok(u32::try_from(received.saturating_sub(1)).unwrap_or(u32::MAX))
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }

    pub fn message(&self) -> &ReceivedMessage {
        &self.message
    }

    /// Deletes the message from the queue.
    pub async fn acknowledge(&mut self) -> Result<(), ConsumerError> {
        if self.is_handled() {
            return Err(ConsumerError::AlreadyHandled);
        }
        let receipt_handle = self.receipt_handle()?;

        let start = Instant::now();
        let result = self
            .transport
            .delete(self.config.queue_url(), receipt_handle)
            .await;
        self.metrics.observe(SQS_JOB_TIMER, start.elapsed().as_secs_f64());
        result?;

        self.handled.store(true, Ordering::Release);
        debug!(message_id = %self.id(), "message deleted");

        Ok(())
    }

    /// Puts the message back on the queue, visible again after `secs`
    /// seconds once clamped to the configured bounds.
    pub async fn release(&mut self, secs: u64) -> Result<(), ConsumerError> {
        if self.is_handled() {
            return Err(ConsumerError::AlreadyHandled);
        }
        let receipt_handle = self.receipt_handle()?;

        let bounds = self.config.visibility_bounds();
        if secs < bounds.min {
            debug!(
                message_id = %self.id(),
                requested = ?Duration::from_secs(secs),
                "release time is below minimum"
            );
        } else if secs > bounds.max {
            debug!(
                message_id = %self.id(),
                requested = ?Duration::from_secs(secs),
                "release time is above maximum"
            );
        }

        let secs = clamp_visibility(secs, bounds);
        // Always below the 12 hour ceiling once clamped.
        let visibility_timeout = i32::try_from(secs).unwrap_or(i32::MAX);

        let start = Instant::now();
        let result = self
            .transport
            .change_visibility(self.config.queue_url(), receipt_handle, visibility_timeout)
            .await;
        self.metrics.observe(SQS_JOB_TIMER, start.elapsed().as_secs_f64());
        result?;

        self.handled.store(true, Ordering::Release);
        debug!(
            message_id = %self.id(),
            time = ?Duration::from_secs(secs),
            "released message back to sqs"
        );

        Ok(())
    }

    /// Releases the message for as long as the configured backoff policy
    /// asks for, given how many times it has been attempted.
    pub async fn backoff(&mut self) -> Result<(), ConsumerError> {
        let attempt = self.attempt_count()?;
        let delay = (self.config.backoff())(attempt);

        debug!(message_id = %self.id(), attempt, delay, "backing off message");

        self.release(delay).await
    }

    fn receipt_handle(&self) -> Result<&str, ConsumerError> {
        self.message
            .receipt_handle
            .as_deref()
            .ok_or(ConsumerError::MissingReceiptHandle)
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("message", &self.message)
            .field("handled", &self.is_handled())
            .finish_non_exhaustive()
    }
}
