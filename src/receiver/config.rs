use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{BackoffFn, default_backoff};
use crate::errors::ConsumerError;
use crate::transport::{APPROXIMATE_RECEIVE_COUNT, ReceiveRequest};
use crate::visibility::{SQS_MAX_VISIBILITY_TIMEOUT, VisibilityBounds};

/// Configuration for the SQS consumer.
///
/// The value is immutable once handed to a worker. Every setter consumes the
/// config and returns the updated copy, so one config can seed several
/// workers without them affecting each other.
///
/// Only the queue URL and consumer count are required; the remaining values
/// default to:
///
/// | setting | default |
/// |---|---|
/// | max number of messages | 10 |
/// | wait time | 20 seconds |
/// | post-receive visibility timeout | 10 minutes |
/// | receive error wait | 30 seconds |
/// | release bounds | 10 seconds to 12 hours |
/// | backoff | [`default_backoff`] |
#[derive(Clone)]
pub struct ConsumerConfig {
    queue_url: String,
    consumer_count: usize,
    max_number_of_messages: i32,
    wait_time_seconds: i32,
    visibility_timeout: i32,
    error_wait: Duration,
    visibility_bounds: VisibilityBounds,
    backoff: BackoffFn,
    run_once: bool,
    run_slowly: Option<Duration>,
}

impl ConsumerConfig {
    /// Creates a configuration with the defaults listed above.
    ///
    /// # Arguments
    ///
    /// * `queue_url` - The SQS queue URL to receive from
    /// * `consumer_count` - Number of consume loops to run
    pub fn new(queue_url: impl Into<String>, consumer_count: usize) -> Self {
        ConsumerConfig {
            queue_url: queue_url.into(),
            consumer_count,
            max_number_of_messages: 10,
            wait_time_seconds: 20,
            visibility_timeout: 600,
            error_wait: Duration::from_secs(30),
            visibility_bounds: VisibilityBounds::default(),
            backoff: Arc::new(default_backoff),
            run_once: false,
            run_slowly: None,
        }
    }

    /// Loads the configuration from the environment.
    ///
    /// `SQS_QUEUE_URL` is required. `SQS_CONSUMER_COUNT` (default 1),
    /// `SQS_MAX_MESSAGES`, `SQS_WAIT_TIME_SECONDS`, `SQS_VISIBILITY_TIMEOUT`,
    /// `SQS_ERROR_WAIT_SECONDS`, `SQS_MIN_VISIBILITY_TIMEOUT`,
    /// `SQS_MAX_VISIBILITY_TIMEOUT`, `SQS_RUN_ONCE` and `SQS_RUN_SLOWLY_MS`
    /// override the defaults when set.
    pub fn from_env() -> Result<Self, ConsumerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<L>(lookup: L) -> Result<Self, ConsumerError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let queue_url = lookup("SQS_QUEUE_URL")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ConsumerError::InvalidConfig("SQS_QUEUE_URL is not set".to_string()))?;
        let consumer_count = parse_var(&lookup, "SQS_CONSUMER_COUNT")?.unwrap_or(1);

        let mut config = ConsumerConfig::new(queue_url, consumer_count);

        if let Some(max) = parse_var(&lookup, "SQS_MAX_MESSAGES")? {
            config = config.with_max_number_of_messages(max);
        }
        if let Some(wait) = parse_var(&lookup, "SQS_WAIT_TIME_SECONDS")? {
            config = config.with_wait_time_seconds(wait);
        }
        if let Some(timeout) = parse_var(&lookup, "SQS_VISIBILITY_TIMEOUT")? {
            config = config.with_visibility_timeout(timeout);
        }
        if let Some(secs) = parse_var(&lookup, "SQS_ERROR_WAIT_SECONDS")? {
            config = config.with_error_wait(Duration::from_secs(secs));
        }

        let min = parse_var(&lookup, "SQS_MIN_VISIBILITY_TIMEOUT")?;
        let max = parse_var(&lookup, "SQS_MAX_VISIBILITY_TIMEOUT")?;
        if min.is_some() || max.is_some() {
            let bounds = config.visibility_bounds;
            config = config.with_visibility_bounds(min.unwrap_or(bounds.min), max.unwrap_or(bounds.max));
        }

        if parse_var::<_, bool>(&lookup, "SQS_RUN_ONCE")?.unwrap_or(false) {
            config = config.run_once();
        } else if let Some(ms) = parse_var(&lookup, "SQS_RUN_SLOWLY_MS")? {
            config = config.run_slowly(Duration::from_millis(ms));
        }

        Ok(config)
    }

    pub fn with_queue_url(mut self, queue_url: impl Into<String>) -> Self {
        self.queue_url = queue_url.into();
        self
    }

    /// Number of consume loops listening against the queue.
    pub fn with_consumer_count(mut self, consumer_count: usize) -> Self {
        self.consumer_count = consumer_count;
        self
    }

    /// Maximum number of messages returned by one receive call, 1 to 10.
    pub fn with_max_number_of_messages(mut self, max_number_of_messages: i32) -> Self {
        self.max_number_of_messages = max_number_of_messages;
        self
    }

    /// How long a receive call waits for messages to arrive, 1 to 20 seconds.
    pub fn with_wait_time_seconds(mut self, wait_time_seconds: i32) -> Self {
        self.wait_time_seconds = wait_time_seconds;
        self
    }

    /// How long received messages stay hidden from other consumers while the
    /// handler runs.
    pub fn with_visibility_timeout(mut self, visibility_timeout: i32) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// How long to wait before receiving again after a failed receive.
    pub fn with_error_wait(mut self, error_wait: Duration) -> Self {
        self.error_wait = error_wait;
        self
    }

    /// Bounds applied to every release of a message back onto the queue.
    pub fn with_visibility_bounds(mut self, min: u64, max: u64) -> Self {
        self.visibility_bounds = VisibilityBounds { min, max };
        self
    }

    /// Replaces the policy [`Lease::backoff`](crate::Lease::backoff) uses to
    /// pick a release time.
    ///
    /// # Arguments
    ///
    /// * `backoff` - Maps the attempt count (zero on first delivery) to a
    ///   delay in seconds. The result is still clamped to the visibility
    ///   bounds.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rs_sqs_consumer::ConsumerConfig;
    ///
    /// let config = ConsumerConfig::new("https://sqs/queue", 2)
    ///     .with_backoff(|attempt| 30 * u64::from(attempt + 1));
    ///
    /// assert_eq!((config.backoff())(2), 90);
    /// ```
    pub fn with_backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32) -> u64 + Send + Sync + 'static,
    {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Receive a single message, handle it and stop. If the queue is empty
    /// the consumer stops straight away.
    ///
    /// Sets the consumer count and batch size to 1. Setters called after this
    /// one still apply, so `.run_once().with_max_number_of_messages(3)`
    /// handles one batch of up to three messages and stops.
    pub fn run_once(mut self) -> Self {
        self.consumer_count = 1;
        self.max_number_of_messages = 1;
        self.run_once = true;
        self.run_slowly = None;
        self
    }

    /// Receive one message at a time and wait `pause` before receiving the
    /// next one. Handy when watching messages being processed. A zero pause
    /// still limits the consumer to one message at a time.
    ///
    /// Like [`run_once`](ConsumerConfig::run_once), later setters may raise
    /// the consumer count or batch size again.
    pub fn run_slowly(mut self, pause: Duration) -> Self {
        self.consumer_count = 1;
        self.max_number_of_messages = 1;
        self.run_once = false;
        self.run_slowly = (!pause.is_zero()).then_some(pause);
        self
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Number of consume loops a worker starts.
    pub fn consumer_count(&self) -> usize {
        self.consumer_count
    }

    pub fn max_number_of_messages(&self) -> i32 {
        self.max_number_of_messages
    }

    pub fn wait_time_seconds(&self) -> i32 {
        self.wait_time_seconds
    }

    pub fn visibility_timeout(&self) -> i32 {
        self.visibility_timeout
    }

    pub fn error_wait(&self) -> Duration {
        self.error_wait
    }

    pub fn visibility_bounds(&self) -> VisibilityBounds {
        self.visibility_bounds
    }

    pub fn backoff(&self) -> &BackoffFn {
        &self.backoff
    }

    pub fn is_run_once(&self) -> bool {
        self.run_once
    }

    /// The pause between batches, if `run-slowly` is enabled with a non-zero
    /// pause.
    pub fn run_slowly_pause(&self) -> Option<Duration> {
        self.run_slowly
    }

    /// The receive call every consume loop issues.
    pub fn receive_request(&self) -> ReceiveRequest {
        ReceiveRequest {
            queue_url: self.queue_url.clone(),
            max_number_of_messages: self.max_number_of_messages,
            wait_time_seconds: self.wait_time_seconds,
            visibility_timeout: self.visibility_timeout,
            system_attribute_names: vec![APPROXIMATE_RECEIVE_COUNT.to_string()],
        }
    }

    /// Checks the values against what SQS accepts.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        let ceiling = SQS_MAX_VISIBILITY_TIMEOUT as i32;

        if self.queue_url.is_empty() {
            return Err(invalid("queue URL is empty"));
        }
        if self.consumer_count == 0 {
            return Err(invalid("consumer count must be at least 1"));
        }
        if !(1..=10).contains(&self.max_number_of_messages) {
            return Err(invalid(format!(
                "max number of messages must be between 1 and 10, got {}",
                self.max_number_of_messages
            )));
        }
        if !(1..=20).contains(&self.wait_time_seconds) {
            return Err(invalid(format!(
                "wait time must be between 1 and 20 seconds, got {}",
                self.wait_time_seconds
            )));
        }
        if !(0..=ceiling).contains(&self.visibility_timeout) {
            return Err(invalid(format!(
                "visibility timeout must be between 0 and {ceiling} seconds, got {}",
                self.visibility_timeout
            )));
        }

        let bounds = self.visibility_bounds;
        if bounds.min > bounds.max {
            return Err(invalid(format!(
                "minimum visibility timeout {} is above maximum {}",
                bounds.min, bounds.max
            )));
        }
        if bounds.max > SQS_MAX_VISIBILITY_TIMEOUT {
            return Err(invalid(format!(
                "maximum visibility timeout must be at most {ceiling} seconds, got {}",
                bounds.max
            )));
        }
        if self.run_once && self.run_slowly.is_some() {
            return Err(invalid("`run-once` and `run-slowly` cannot both be enabled"));
        }

        Ok(())
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("queue_url", &self.queue_url)
            .field("consumer_count", &self.consumer_count)
            .field("max_number_of_messages", &self.max_number_of_messages)
            .field("wait_time_seconds", &self.wait_time_seconds)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("error_wait", &self.error_wait)
            .field("visibility_bounds", &self.visibility_bounds)
            .field("run_once", &self.run_once)
            .field("run_slowly", &self.run_slowly)
            .finish_non_exhaustive()
    }
}

fn invalid(message: impl Into<String>) -> ConsumerError {
    ConsumerError::InvalidConfig(message.into())
}

fn parse_var<L, T>(lookup: &L, key: &str) -> Result<Option<T>, ConsumerError>
where
    L: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid(format!("{key}={raw:?}: {e}"))),
    }
}
