//! The calls the consumer makes against a queue.
//!
//! [`SqsTransport`] is the production implementation over `aws_sdk_sqs`; the
//! trait exists so the consumer loop and leases can be driven by anything
//! that behaves like SQS.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName};
#[cfg(test)]
use mockall::automock;
use tracing::warn;

use crate::errors::TransportError;

/// System attribute SQS uses for the number of times a message was received.
pub const APPROXIMATE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";

/// Parameters of a single long-poll receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub queue_url: String,
    pub max_number_of_messages: i32,
    pub wait_time_seconds: i32,
    pub visibility_timeout: i32,
    pub system_attribute_names: Vec<String>,
}

/// A message as returned by a receive call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: Option<String>,
    pub body: Option<String>,
    /// Attributes set by the sender.
    pub message_attributes: HashMap<String, String>,
    /// Attributes set by SQS, such as `ApproximateReceiveCount`.
    pub system_attributes: HashMap<String, String>,
}

impl ReceivedMessage {
    pub fn new(message_id: impl Into<String>) -> Self {
        ReceivedMessage {
            message_id: message_id.into(),
            ..Default::default()
        }
    }

    pub fn with_receipt_handle(mut self, receipt_handle: impl Into<String>) -> Self {
        self.receipt_handle = Some(receipt_handle.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_message_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message_attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_system_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.system_attributes.insert(key.into(), value.into());
        self
    }

    /// Converts an SDK message. Messages without an id cannot be leased and
    /// yield `None`.
    pub fn from_sqs(message: &Message) -> Option<Self> {
        let message_id = message.message_id()?.to_string();

        let message_attributes = message
            .message_attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .filter_map(|(key, value)| {
                        value.string_value().map(|v| (key.clone(), v.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let system_attributes = message
            .attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(key, value)| (key.as_str().to_string(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Some(ReceivedMessage {
            message_id,
            receipt_handle: message.receipt_handle().map(str::to_string),
            body: message.body().map(str::to_string),
            message_attributes,
            system_attributes,
        })
    }
}

/// The queue operations the consumer depends on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Long-polls for up to `max_number_of_messages` messages.
    async fn receive(&self, request: &ReceiveRequest) -> Result<Vec<ReceivedMessage>, TransportError>;

    /// Deletes a message using the receipt handle of its current receive.
    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), TransportError>;

    /// Sets the visibility timeout of a received message, counted from now.
    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: i32,
    ) -> Result<(), TransportError>;
}

/// [`QueueTransport`] over the AWS SQS API.
#[derive(Debug, Clone)]
pub struct SqsTransport {
    client: aws_sdk_sqs::Client,
}

impl SqsTransport {
    pub fn new(client: aws_sdk_sqs::Client) -> Self {
        SqsTransport { client }
    }

    pub fn client(&self) -> &aws_sdk_sqs::Client {
        &self.client
    }
}

#[async_trait]
impl QueueTransport for SqsTransport {
    async fn receive(&self, request: &ReceiveRequest) -> Result<Vec<ReceivedMessage>, TransportError> {
        // Deliberately not cancellable: an abandoned receive can still lease
        // messages that nobody will ever handle.
        let mut req = self
            .client
            .receive_message()
            .queue_url(&request.queue_url)
            .max_number_of_messages(request.max_number_of_messages)
            .wait_time_seconds(request.wait_time_seconds)
            .visibility_timeout(request.visibility_timeout)
            .message_attribute_names("All");

        for name in &request.system_attribute_names {
            req = req.message_system_attribute_names(MessageSystemAttributeName::from(name.as_str()));
        }

        let output = req
            .send()
            .await
            .map_err(|e| TransportError::from_sdk("ReceiveMessage", e))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|message| {
                let converted = ReceivedMessage::from_sqs(message);
                if converted.is_none() {
                    warn!(
                        receipt_handle = ?message.receipt_handle(),
                        "dropping sqs message without a message id"
                    );
                }
                converted
            })
            .collect();

        Ok(messages)
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), TransportError> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| TransportError::from_sdk("DeleteMessage", e))?;

        Ok(())
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: i32,
    ) -> Result<(), TransportError> {
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(visibility_timeout)
            .send()
            .await
            .map_err(|e| TransportError::from_sdk("ChangeMessageVisibility", e))?;

        Ok(())
    }
}
