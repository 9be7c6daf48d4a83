use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::Client;
use dog_core::DogConfigSnapshot;

use crate::{BlobStore, OpenedBlob, RelayError, RelayResult};

/// Connection settings for an S3-compatible backing store.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (MinIO, RustFS, ...). Enables path-style addressing.
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl S3Config {
    pub fn new<S: Into<String>>(bucket: S) -> Self {
        Self {
            bucket: bucket.into(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
        }
    }

    /// Read `store.bucket`, `store.region`, `store.endpoint`,
    /// `store.access_key_id` and `store.secret_access_key`.
    pub fn from_snapshot(config: &DogConfigSnapshot) -> RelayResult<Self> {
        let bucket = config
            .get_string("store.bucket")
            .ok_or_else(|| RelayError::invalid("store.bucket is required for the s3 store"))?;

        let mut s3 = Self::new(bucket);
        if let Some(region) = config.get_string("store.region") {
            s3.region = region;
        }
        s3.endpoint = config.get_string("store.endpoint");
        s3.access_key_id = config.get_string("store.access_key_id");
        s3.secret_access_key = config.get_string("store.secret_access_key");
        Ok(s3)
    }

    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credentials<S: Into<String>>(mut self, access_key_id: S, secret_access_key: S) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }
}

/// Reads objects from an S3-compatible bucket, streaming the body as it
/// arrives.
#[derive(Clone)]
pub struct S3CompatibleStore {
    client: Client,
    bucket: String,
}

impl S3CompatibleStore {
    pub async fn new(config: S3Config) -> Self {
        let bucket = config.bucket.clone();
        let client = Self::create_client(config).await;
        Self { client, bucket }
    }

    /// Wrap an already configured client.
    pub fn with_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn create_client(config: S3Config) -> Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region));

        if let (Some(key), Some(secret)) = (config.access_key_id, config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(key, secret, None, None, "dog-blob"));
        }
        let path_style = config.endpoint.is_some();
        if let Some(endpoint) = config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let shared = loader.load().await;
        Client::from_conf(
            aws_sdk_s3::config::Builder::from(&shared)
                .force_path_style(path_style)
                .build(),
        )
    }

    fn map_open_error(key: &str, err: SdkError<GetObjectError, HttpResponse>) -> RelayError {
        // Some S3-compatible servers answer a bare 404 without the NoSuchKey code.
        let status = err.raw_response().map(|r| r.status().as_u16());
        let missing = match &err {
            SdkError::ServiceError(service) => service.err().is_no_such_key(),
            _ => false,
        };
        if missing || status == Some(404) {
            return RelayError::not_found(key);
        }
        RelayError::unavailable(format!(
            "s3 get_object {key} failed: {}",
            DisplayErrorContext(&err)
        ))
    }
}

#[async_trait]
impl BlobStore for S3CompatibleStore {
    async fn open(&self, key: &str) -> RelayResult<OpenedBlob> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| Self::map_open_error(key, err))?;

        let size = output.content_length().and_then(|n| u64::try_from(n).ok());
        let content_type = output.content_type().map(str::to_string);
        let disposition = output.content_disposition().map(str::to_string);
        let mut body = output.body;
        let key_owned = key.to_string();

        let stream = async_stream::stream! {
            loop {
                match body.next().await {
                    Some(Ok(chunk)) => yield Ok(chunk),
                    Some(Err(err)) => {
                        yield Err(RelayError::aborted(format!("s3 read of {key_owned} failed: {err}")));
                        return;
                    }
                    None => return,
                }
            }
        };

        Ok(OpenedBlob::new(Box::pin(stream))
            .with_size(size)
            .with_content_type(content_type)
            .with_content_disposition(disposition))
    }

    fn backend(&self) -> &'static str {
        "s3"
    }
}
