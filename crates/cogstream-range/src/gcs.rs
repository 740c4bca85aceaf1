//! Google Cloud Storage through its XML API.

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::http::{delegate_to_transport, Anonymous, HttpTransport, RequestAuth, RequestTarget};
use crate::{BackendKind, GcsCredentials, RangeError, RangeReaderConfig, Result, RetryPolicy, Secret};

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Where a GCS object lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcsLocation {
    /// Bucket name.
    pub bucket: String,
    /// Object name.
    pub object: String,
    /// Custom endpoint, for example a local fake server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl GcsLocation {
    /// Object on the public endpoint.
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
            endpoint: None,
        }
    }

    /// `gs://bucket/object`, used for logs and metric labels.
    pub fn display(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.object)
    }

    /// Request URL for the object.
    pub fn url(&self) -> Result<Url> {
        if self.bucket.is_empty() || self.object.is_empty() {
            return Err(RangeError::invalid_descriptor(format!(
                "{}: bucket and object are required",
                self.display()
            )));
        }
        let base = self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let mut url =
            Url::parse(base).map_err(|e| RangeError::invalid_descriptor(format!("{base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| RangeError::invalid_descriptor(format!("{base}: cannot be a base URL")))?
            .pop_if_empty()
            .push(&self.bucket)
            .extend(self.object.split('/'));
        Ok(url)
    }
}

#[derive(Debug)]
struct BearerAuth(Secret);

impl RequestAuth for BearerAuth {
    fn authorize(&self, request: RequestBuilder, _: &RequestTarget<'_>) -> Result<RequestBuilder> {
        Ok(request.bearer_auth(self.0.expose()))
    }
}

/// Range reader for a GCS object.
#[derive(Debug)]
pub struct GcsRangeReader {
    transport: HttpTransport,
    location: GcsLocation,
}

impl GcsRangeReader {
    /// Open an object. Without credentials the object must be publicly readable.
    pub fn new(
        client: Client,
        location: GcsLocation,
        credentials: Option<GcsCredentials>,
        config: &RangeReaderConfig,
    ) -> Result<Self> {
        let url = location.url()?;
        let auth: Box<dyn RequestAuth> = match credentials {
            Some(GcsCredentials::Bearer(token)) => Box::new(BearerAuth(token)),
            None => Box::new(Anonymous),
        };
        Ok(Self {
            transport: HttpTransport::new(client, url, BackendKind::Gcs, auth, config),
            location,
        })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.transport = self.transport.with_retry(retry);
        self
    }

    /// The object's bucket and name.
    pub fn object(&self) -> &GcsLocation {
        &self.location
    }
}

delegate_to_transport!(GcsRangeReader);
