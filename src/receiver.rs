use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

use crate::errors::ConsumerError;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::transport::{QueueTransport, SqsTransport};

pub mod config;
mod consumer;
pub mod functions;

use config::ConsumerConfig;
use consumer::{Consumer, ConsumerContext};
use functions::LeaseHandler;

/// Tagged crate version, logged when a worker starts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runs a fixed number of consume loops against one queue.
///
/// All loops share the configuration, the transport and the metrics sink.
/// Build one with [`Worker::new`] for the defaults or
/// [`Worker::from_config`] to change them, then call [`Worker::listen`].
pub struct Worker {
    config: Arc<ConsumerConfig>,
    transport: Arc<dyn QueueTransport>,
    metrics: Arc<dyn MetricsSink>,
}

impl Worker {
    /// Creates a worker with the default configuration.
    pub fn new(transport: Arc<dyn QueueTransport>, queue_url: &str, consumer_count: usize) -> Self {
        Self::from_config(transport, ConsumerConfig::new(queue_url, consumer_count))
    }

    /// Creates a worker from a full configuration.
    ///
    /// # Arguments
    ///
    /// * `transport` - The queue the consume loops receive from
    /// * `config` - Checked with [`ConsumerConfig::validate`] when
    ///   [`listen`](Worker::listen) is called
    ///
    /// # Returns
    ///
    /// A worker reporting to a metrics sink that discards everything; see
    /// [`with_metrics`](Worker::with_metrics).
    pub fn from_config(transport: Arc<dyn QueueTransport>, config: ConsumerConfig) -> Self {
        Worker {
            config: Arc::new(config),
            transport,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Creates a worker talking to SQS through `client`.
    pub fn from_client(client: aws_sdk_sqs::Client, config: ConsumerConfig) -> Self {
        Self::from_config(Arc::new(SqsTransport::new(client)), config)
    }

    /// Overrides the default sink, which discards everything.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Read-only access to how the worker was configured.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Listens for messages until `cancel` fires, or until every loop has
    /// finished its single batch when `run-once` is set.
    ///
    /// Cancelling does not interrupt handlers that are already running; each
    /// loop finishes its current batch and stops before receiving again. The
    /// future resolves only once every loop has stopped.
    ///
    /// # Arguments
    ///
    /// * `cancel` - Shared shutdown signal, also passed to every handler call
    /// * `handler` - Called once per received message with its [`Lease`](crate::Lease)
    ///
    /// # Returns
    ///
    /// `Err(ConsumerError::InvalidConfig)` if the configuration is rejected,
    /// otherwise `Ok(())` once every loop has stopped.
    pub async fn listen<H>(&self, cancel: CancellationToken, handler: H) -> Result<(), ConsumerError>
    where
        H: LeaseHandler,
    {
        self.config.validate()?;

        info!(
            version = VERSION,
            consumers = self.config.consumer_count(),
            queue_url = %self.config.queue_url(),
            "starting sqs consumer"
        );
        if self.config.is_run_once() {
            debug!("`run-once` enabled");
        }
        if let Some(pause) = self.config.run_slowly_pause() {
            debug!(slowly = ?pause, "`run-slowly` enabled");
        }

        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                cancel.cancelled().await;
                info!("shutting down safely, this could take a while");
            }
        });

        let ctx = ConsumerContext {
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            metrics: Arc::clone(&self.metrics),
            handler: Arc::new(handler),
        };

        let mut consumers = JoinSet::new();
        for id in 0..self.config.consumer_count() {
            let consumer = Consumer::new(ctx.clone());
            consumers.spawn(
                consumer
                    .run(cancel.clone())
                    .instrument(info_span!("consumer", id)),
            );
        }

        while let Some(joined) = consumers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "consume loop exited abnormally");
            }
        }

        if cancel.is_cancelled() {
            if let Err(err) = watcher.await {
                error!(error = %err, "shutdown watcher exited abnormally");
            }
        } else {
            watcher.abort();
        }

        Ok(())
    }
}

/// Receives from `queue_url` with `consumer_count` loops and the default
/// configuration until the process gets Ctrl-C.
///
/// ```rust,no_run
/// use rs_sqs_consumer::{
///     CancellationToken, Lease, client::create_sqs_client_from_env, receiver::start_receive_queue,
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = create_sqs_client_from_env().await;
///
///     start_receive_queue(
///         client,
///         "https://sqs.region.amazonaws.com/account/queue-name",
///         4,
///         |_cancel: CancellationToken, mut lease: Lease| async move {
///             println!("processing {}", lease.body()?);
///             lease.acknowledge().await
///         },
///     )
///     .await?;
///
///     Ok(())
/// }
/// ```
pub async fn start_receive_queue<H>(
    client: aws_sdk_sqs::Client,
    queue_url: &str,
    consumer_count: usize,
    handler: H,
) -> Result<(), ConsumerError>
where
    H: LeaseHandler,
{
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    let result = Worker::from_client(client, ConsumerConfig::new(queue_url, consumer_count))
        .listen(cancel, handler)
        .await;

    signal.abort();
    result
}
