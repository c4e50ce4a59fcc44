use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// Error types for consuming and handling SQS messages.
///
/// Lease operations, the consumer loop and handlers all speak this type, so a
/// handler can use `?` on any lease call and still return its own failures
/// through [`GenericError`].
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// A terminal call (acknowledge, release or backoff) was already made
    /// successfully on this lease.
    #[error("message already handled")]
    AlreadyHandled,

    /// The message body is empty or absent.
    #[error("message body is empty")]
    EmptyBody,

    /// A required attribute is not present on the message.
    #[error("message attribute `{0}` is missing")]
    MissingAttribute(String),

    /// The message was received without a receipt handle, so it cannot be
    /// deleted or have its visibility changed.
    #[error("message has no receipt handle")]
    MissingReceiptHandle,

    /// A call to the queue failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The handler panicked; the payload is rendered as text.
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    /// The consumer configuration is not usable.
    #[error("invalid consumer configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    GenericError(#[from] GenericError),
}

impl From<String> for ConsumerError {
    fn from(s: String) -> Self {
        ConsumerError::GenericError(GenericError::new(s))
    }
}

impl From<&str> for ConsumerError {
    fn from(s: &str) -> Self {
        ConsumerError::GenericError(GenericError::new(s.to_string()))
    }
}

/// A failed call against the queue.
///
/// `code` carries the service error code (for example
/// `AWS.SimpleQueueService.NonExistentQueue` or `ReceiptHandleIsInvalid`) when
/// the SDK exposes one; `message` is the full error chain.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed: {message}")]
pub struct TransportError {
    pub operation: &'static str,
    pub code: Option<String>,
    pub message: String,
}

impl TransportError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        TransportError {
            operation,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Converts an AWS SDK failure, keeping the service error code.
    pub fn from_sdk<E, R>(operation: &'static str, err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        TransportError {
            operation,
            code: err.code().map(str::to_string),
            message: DisplayErrorContext(&err).to_string(),
        }
    }
}

/// Generic error type for handling unexpected errors.
#[derive(Debug, Error)]
pub struct GenericError(String);

impl GenericError {
    /// Creates a new `GenericError` with the provided message.
    pub fn new(message: String) -> Self {
        GenericError(message)
    }
}

impl std::fmt::Display for GenericError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for GenericError {
    fn from(s: String) -> Self {
        GenericError::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display_names_operation() {
        let err = TransportError::new("DeleteMessage", "connection reset")
            .with_code("ServiceUnavailable");

        assert_eq!(err.to_string(), "DeleteMessage failed: connection reset");
        assert_eq!(err.code.as_deref(), Some("ServiceUnavailable"));
    }

    #[test]
    fn handler_errors_convert_from_strings() {
        let err: ConsumerError = "payload rejected".into();
        assert!(matches!(err, ConsumerError::GenericError(_)));
        assert_eq!(err.to_string(), "payload rejected");
    }

    #[test]
    fn transport_errors_stay_transparent() {
        let err: ConsumerError = TransportError::new("ReceiveMessage", "timed out").into();
        assert_eq!(err.to_string(), "ReceiveMessage failed: timed out");
    }
}
