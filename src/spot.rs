//! Stops a worker gracefully when the EC2 spot instance it runs on is about
//! to be reclaimed.
//!
//! AWS gives roughly two minutes of notice through the instance metadata
//! endpoint. [`TerminationWatcher::listen_and_cancel`] polls it and cancels
//! the token the worker listens with, so every loop finishes its batch and
//! stops.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const METADATA_TERMINATION_ENDPOINT: &str =
    "http://169.254.169.254/latest/meta-data/spot/termination-time";

const TERMINATION_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub const INSTANCE_NOT_TERMINATING: &str = "spot instance not marked for termination";
pub const INSTANCE_TERMINATING: &str = "spot instance marked for termination";

#[derive(Debug, Error)]
pub enum TerminationCheckError {
    #[error("failed to query termination endpoint: {0}")]
    Connection(#[source] reqwest::Error),

    #[error("unexpected endpoint response code {0}")]
    StatusCode(u16),

    #[error("unable to read response from endpoint: {0}")]
    Body(#[source] reqwest::Error),

    #[error("unable to parse termination timestamp {body:?} from endpoint")]
    Timestamp {
        body: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Polls the instance metadata endpoint for a spot termination notice.
#[derive(Debug, Clone)]
pub struct TerminationWatcher {
    client: reqwest::Client,
    endpoint: String,
    interval: Duration,
    request_timeout: Duration,
}

impl Default for TerminationWatcher {
    fn default() -> Self {
        TerminationWatcher {
            client: reqwest::Client::new(),
            endpoint: METADATA_TERMINATION_ENDPOINT.to_string(),
            interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(2),
        }
    }
}

impl TerminationWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Asks the endpoint once. `Ok(None)` means the instance is not marked
    /// for termination.
    pub async fn check(&self) -> Result<Option<DateTime<Utc>>, TerminationCheckError> {
        let response = self
            .client
            .get(&self.endpoint)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(TerminationCheckError::Connection)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status != reqwest::StatusCode::OK {
            return Err(TerminationCheckError::StatusCode(status.as_u16()));
        }

        let body = response.text().await.map_err(TerminationCheckError::Body)?;
        let when = NaiveDateTime::parse_from_str(body.trim(), TERMINATION_TIME_FORMAT)
            .map_err(|source| TerminationCheckError::Timestamp {
                body: body.clone(),
                source,
            })?
            .and_utc();

        Ok(Some(when))
    }

    /// Polls until the instance is marked for termination, returning when
    /// it will be reclaimed, or `None` if `cancel` fires first.
    ///
    /// The first check happens straight away. Failed checks are logged and
    /// retried on the next tick.
    pub async fn wait_for_termination(&self, cancel: &CancellationToken) -> Option<DateTime<Utc>> {
        debug!(endpoint = %self.endpoint, "listening for spot instance termination");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            match self.check().await {
                Ok(Some(when)) => {
                    info!(endpoint = %self.endpoint, when = %when, "{}", INSTANCE_TERMINATING);
                    return Some(when);
                }
                Ok(None) => debug!(endpoint = %self.endpoint, "{}", INSTANCE_NOT_TERMINATING),
                Err(err) => error!(endpoint = %self.endpoint, error = %err, "spot termination check failed"),
            }
        }
    }

    /// Spawns the poller and cancels `cancel` once a termination notice
    /// arrives. The task also ends if `cancel` is cancelled elsewhere.
    pub fn listen_and_cancel(self, cancel: CancellationToken) -> JoinHandle<Option<DateTime<Utc>>> {
        tokio::spawn(async move {
            let when = self.wait_for_termination(&cancel).await;
            if when.is_some() {
                cancel.cancel();
            }
            when
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TERMINATION_PATH: &str = "/latest/meta-data/spot/termination-time";

    fn watcher(server: &MockServer) -> TerminationWatcher {
        TerminationWatcher::new()
            .with_endpoint(format!("{}{}", server.uri(), TERMINATION_PATH))
            .with_interval(Duration::from_millis(10))
    }

    #[test]
    fn defaults_to_instance_metadata() {
        assert_eq!(TerminationWatcher::new().endpoint(), METADATA_TERMINATION_ENDPOINT);
    }

    #[tokio::test]
    async fn not_found_means_not_terminating() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TERMINATION_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(watcher(&server).check().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unexpected_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TERMINATION_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(matches!(
            watcher(&server).check().await,
            Err(TerminationCheckError::StatusCode(500))
        ));
    }

    #[tokio::test]
    async fn garbage_timestamp_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TERMINATION_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("soon"))
            .mount(&server)
            .await;

        assert!(matches!(
            watcher(&server).check().await,
            Err(TerminationCheckError::Timestamp { .. })
        ));
    }

    #[tokio::test]
    async fn termination_notice_cancels_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TERMINATION_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("2026-10-16T12:30:00Z"))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let when = watcher(&server)
            .listen_and_cancel(cancel.clone())
            .await
            .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(when, Some(Utc.with_ymd_and_hms(2026, 10, 16, 12, 30, 0).unwrap()));
    }

    #[tokio::test]
    async fn keeps_polling_until_marked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TERMINATION_PATH))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(TERMINATION_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("2026-10-16T12:30:00Z"))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let when = tokio::time::timeout(
            Duration::from_secs(5),
            watcher(&server).listen_and_cancel(cancel.clone()),
        )
        .await
        .expect("watcher never saw the termination notice")
        .unwrap();

        assert!(when.is_some());
        assert!(cancel.is_cancelled());
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn stops_when_cancelled_elsewhere() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TERMINATION_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let handle = watcher(&server).listen_and_cancel(cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let when = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
        assert!(when.is_none());
    }
}
