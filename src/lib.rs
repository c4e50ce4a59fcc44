//! # SQS Consumer
//!
//! A concurrent AWS SQS consumer. A [`Worker`] runs a fixed number of
//! consume loops against one queue; every received message is handed to
//! your handler as a [`Lease`], and the handler decides what happens to it:
//!
//! - [`Lease::acknowledge`] deletes the message,
//! - [`Lease::release`] makes it visible again after a number of seconds,
//! - [`Lease::backoff`] releases it for longer the more often it was tried.
//!
//! Exactly one of those calls may succeed per lease. A handler that returns
//! without making one is reported, and SQS redelivers the message once its
//! visibility timeout lapses.
//!
//! ## Features
//!
//! - Long polling with configurable batch size, wait and visibility timeout
//! - Batches handled concurrently, one task per message, with panics
//!   isolated to the message that caused them
//! - Release times clamped to configured bounds and to the SQS 12 hour limit
//! - Cooperative shutdown through a [`CancellationToken`], with an optional
//!   spot instance [`TerminationWatcher`](spot::TerminationWatcher)
//! - `run-once` and `run-slowly` debug modes
//! - Pluggable metrics, including a Prometheus sink
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rs_sqs_consumer::{
//!     CancellationToken, ConsumerConfig, ConsumerError, Lease, Worker,
//!     client::create_sqs_client_from_env, spot::TerminationWatcher,
//! };
//!
//! async fn handle(_cancel: CancellationToken, mut lease: Lease) -> Result<(), ConsumerError> {
//!     let body = lease.body()?.to_string();
//!     if body == "retry me" {
//!         return lease.backoff().await;
//!     }
//!
//!     println!("processing {body}");
//!     lease.acknowledge().await
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = create_sqs_client_from_env().await;
//!     let config = ConsumerConfig::new("https://sqs.region.amazonaws.com/account/queue-name", 4);
//!
//!     let cancel = CancellationToken::new();
//!     TerminationWatcher::new().listen_and_cancel(cancel.clone());
//!
//!     Worker::from_client(client, config).listen(cancel, handle).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod errors;
pub mod lease;
pub mod metrics;
pub mod receiver;
pub mod spot;
pub mod transport;
pub mod visibility;

pub use errors::{ConsumerError, TransportError};
pub use lease::Lease;
pub use receiver::Worker;
pub use receiver::config::ConsumerConfig;
pub use receiver::functions::LeaseHandler;
pub use tokio_util::sync::CancellationToken;
