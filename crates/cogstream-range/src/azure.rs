//! Azure Blob Storage.

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::http::{delegate_to_transport, HttpTransport, RequestAuth, RequestTarget};
use crate::{
    AzureCredentials, BackendKind, RangeError, RangeReaderConfig, Result, RetryPolicy, Secret,
};

/// Blob service REST API version sent with every request.
pub const AZURE_API_VERSION: &str = "2021-08-06";

/// Where a blob lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureLocation {
    /// Storage account name.
    pub account: String,
    /// Container name.
    pub container: String,
    /// Blob name.
    pub blob: String,
    /// Custom endpoint, for example an emulator at `http://127.0.0.1:10000/devstoreaccount1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl AzureLocation {
    /// Blob in the public cloud endpoint of `account`.
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        blob: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            blob: blob.into(),
            endpoint: None,
        }
    }

    /// `az://account/container/blob`, used for logs and metric labels.
    pub fn display(&self) -> String {
        format!("az://{}/{}/{}", self.account, self.container, self.blob)
    }

    /// Request URL for the blob, without credentials.
    pub fn url(&self) -> Result<Url> {
        if self.account.is_empty() || self.container.is_empty() || self.blob.is_empty() {
            return Err(RangeError::invalid_descriptor(format!(
                "{}: account, container and blob are required",
                self.display()
            )));
        }
        let base = match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", self.account),
        };
        let mut url = Url::parse(&base)
            .map_err(|e| RangeError::invalid_descriptor(format!("{base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| RangeError::invalid_descriptor(format!("{base}: cannot be a base URL")))?
            .pop_if_empty()
            .push(&self.container)
            .extend(self.blob.split('/'));
        Ok(url)
    }
}

#[derive(Debug)]
struct AzureAuth {
    bearer: Option<Secret>,
}

impl RequestAuth for AzureAuth {
    fn authorize(&self, request: RequestBuilder, _: &RequestTarget<'_>) -> Result<RequestBuilder> {
        let request = request.header("x-ms-version", AZURE_API_VERSION);
        Ok(match &self.bearer {
            Some(token) => request.bearer_auth(token.expose()),
            None => request,
        })
    }
}

/// Range reader for an Azure blob.
#[derive(Debug)]
pub struct AzureBlobReader {
    transport: HttpTransport,
    location: AzureLocation,
}

impl AzureBlobReader {
    /// Open a blob. Without credentials the container must allow public reads.
    pub fn new(
        client: Client,
        location: AzureLocation,
        credentials: Option<AzureCredentials>,
        config: &RangeReaderConfig,
    ) -> Result<Self> {
        let mut url = location.url()?;
        let bearer = match credentials {
            Some(AzureCredentials::Sas(token)) => {
                url.set_query(Some(token.expose().trim_start_matches('?')));
                None
            }
            Some(AzureCredentials::Bearer(token)) => Some(token),
            None => None,
        };
        Ok(Self {
            transport: HttpTransport::new(
                client,
                url,
                BackendKind::Azure,
                Box::new(AzureAuth { bearer }),
                config,
            ),
            location,
        })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.transport = self.transport.with_retry(retry);
        self
    }

    /// The blob's account, container and name.
    pub fn object(&self) -> &AzureLocation {
        &self.location
    }
}

delegate_to_transport!(AzureBlobReader);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build_client, RangeReader};

    #[test]
    fn test_public_cloud_url() {
        let location = AzureLocation::new("acct", "cogs", "2024/scene.tif");
        assert_eq!(
            location.url().unwrap().as_str(),
            "https://acct.blob.core.windows.net/cogs/2024/scene.tif"
        );
    }

    #[test]
    fn test_emulator_endpoint() {
        let location = AzureLocation {
            endpoint: Some("http://127.0.0.1:10000/devstoreaccount1/".into()),
            ..AzureLocation::new("devstoreaccount1", "cogs", "a b.tif")
        };
        assert_eq!(
            location.url().unwrap().as_str(),
            "http://127.0.0.1:10000/devstoreaccount1/cogs/a%20b.tif"
        );
    }

    #[test]
    fn test_sas_token_stays_out_of_location() {
        let config = RangeReaderConfig::default();
        let reader = AzureBlobReader::new(
            build_client(&config).unwrap(),
            AzureLocation::new("acct", "cogs", "a.tif"),
            Some(AzureCredentials::Sas(Secret::new("?sv=2021&sig=abc"))),
            &config,
        )
        .unwrap();
        assert_eq!(reader.location(), "https://acct.blob.core.windows.net/cogs/a.tif");
        assert_eq!(reader.backend(), BackendKind::Azure);
    }
}
