use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::config::{Credentials, SharedCredentialsProvider};

/// How to reach SQS when the environment alone is not enough.
///
/// Anything left unset falls back to the standard AWS provider chain
/// (`AWS_REGION`, `AWS_PROFILE`, `AWS_ACCESS_KEY_ID`, instance roles, ...).
#[derive(Debug, Clone, Default)]
pub struct SqsClientOptions {
    pub region: Option<String>,

    /// Custom endpoint, e.g. `http://localhost:4566` for LocalStack or
    /// `http://localhost:9324` for ElasticMQ.
    pub endpoint_url: Option<String>,

    /// Static access key id and secret access key.
    pub credentials: Option<(String, String)>,
}

impl SqsClientOptions {
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.credentials = Some((access_key_id.into(), secret_access_key.into()));
        self
    }
}

/// Creates an SQS client from the environment.
///
/// ```rust,no_run
/// use rs_sqs_consumer::client::create_sqs_client_from_env;
///
/// #[tokio::main]
/// async fn main() {
///     let client = create_sqs_client_from_env().await;
/// }
/// ```
pub async fn create_sqs_client_from_env() -> aws_sdk_sqs::Client {
    create_sqs_client(SqsClientOptions::default()).await
}

/// Creates an SQS client, overriding the environment with whatever is set
/// in `options`.
pub async fn create_sqs_client(options: SqsClientOptions) -> aws_sdk_sqs::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());

    if let Some(region) = options.region {
        loader = loader.region(Region::new(region));
    }
    if let Some(endpoint_url) = options.endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }
    if let Some((access_key_id, secret_access_key)) = options.credentials {
        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "static");
        loader = loader.credentials_provider(SharedCredentialsProvider::new(credentials));
    }

    let config = loader.load().await;
    aws_sdk_sqs::Client::new(&config)
}

/// Creates an SQS client with explicit credentials, without touching the
/// environment.
pub fn create_sqs_client_with_credentials(
    access_key_id: &str,
    secret_access_key: &str,
    region: &str,
) -> aws_sdk_sqs::Client {
    let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "static");

    let config = aws_sdk_sqs::config::Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .credentials_provider(SharedCredentialsProvider::new(credentials))
        .build();

    aws_sdk_sqs::Client::from_conf(config)
}
