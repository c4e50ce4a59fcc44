use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::errors::ConsumerError;
use crate::lease::Lease;

/// Trait for handling messages received from SQS.
///
/// The handler is called once per message and must finish the lease with
/// exactly one of [`Lease::acknowledge`], [`Lease::release`] or
/// [`Lease::backoff`]. A lease left unhandled is reported as an error and the
/// message becomes visible again once its visibility timeout lapses.
///
/// Any `Fn(CancellationToken, Lease) -> impl Future<Output = Result<(), ConsumerError>>`
/// is a handler, so plain async closures and functions work as well as
/// types implementing the trait.
///
/// The token is cancelled when the worker is asked to shut down. Handlers
/// are never interrupted; checking it is only useful for work that can
/// wrap up early.
#[async_trait]
pub trait LeaseHandler: Send + Sync + 'static {
    async fn handle(&self, cancel: CancellationToken, lease: Lease) -> Result<(), ConsumerError>;
}

#[async_trait]
impl<F, Fut> LeaseHandler for F
where
    F: Fn(CancellationToken, Lease) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ConsumerError>> + Send + 'static,
{
    async fn handle(&self, cancel: CancellationToken, lease: Lease) -> Result<(), ConsumerError> {
        (self)(cancel, lease).await
    }
}

/// Outcome of one supervised handler invocation.
#[derive(Debug)]
pub struct InvocationResult {
    /// The error the handler returned, or the panic converted into
    /// [`ConsumerError::HandlerPanicked`].
    pub error: Option<ConsumerError>,

    /// Whether the handler panicked and the panic was caught.
    pub recovered: bool,
}

impl InvocationResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives a handler invocation to completion, catching any panic so it can
/// only ever affect its own message.
pub async fn supervise<F>(invocation: F) -> InvocationResult
where
    F: Future<Output = Result<(), ConsumerError>>,
{
    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(())) => InvocationResult {
            error: None,
            recovered: false,
        },
        Ok(Err(err)) => InvocationResult {
            error: Some(err),
            recovered: false,
        },
        Err(payload) => InvocationResult {
            error: Some(ConsumerError::HandlerPanicked(panic_message(payload.as_ref()))),
            recovered: true,
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_invocation() {
        let result = supervise(async { Ok(()) }).await;
        assert!(result.is_ok());
        assert!(!result.recovered);
    }

    #[tokio::test]
    async fn returned_error_is_kept() {
        let result = supervise(async { Err(ConsumerError::from("bad payload")) }).await;
        assert!(!result.recovered);
        assert_eq!(result.error.unwrap().to_string(), "bad payload");
    }

    #[tokio::test]
    async fn panic_is_recovered() {
        let result = supervise(async {
            if true {
                panic!("boom");
            }
            Ok(())
        })
        .await;

        assert!(result.recovered);
        assert!(matches!(
            result.error,
            Some(ConsumerError::HandlerPanicked(message)) if message == "boom"
        ));
    }

    #[tokio::test]
    async fn formatted_panic_is_recovered() {
        let id = 7;
        let result = supervise(async move {
            if id > 0 {
                panic!("message {id} exploded");
            }
            Ok(())
        })
        .await;

        assert!(matches!(
            result.error,
            Some(ConsumerError::HandlerPanicked(message)) if message == "message 7 exploded"
        ));
    }
}
