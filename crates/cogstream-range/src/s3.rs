//! Amazon S3 and S3-compatible object stores.
//!
//! Requests are signed with AWS Signature Version 4 when credentials are
//! supplied, otherwise sent anonymously for public buckets.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::http::{delegate_to_transport, Anonymous, HttpTransport, RequestAuth, RequestTarget};
use crate::{AwsCredentials, BackendKind, RangeError, RangeReaderConfig, Result, RetryPolicy};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of an empty payload; every range GET has no body.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Where an S3 object lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Location {
    /// Bucket name.
    pub bucket: String,
    /// Object key, without a leading slash.
    pub key: String,
    /// Signing region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint such as `http://localhost:9000` for S3-compatible stores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Address the bucket in the path instead of the host name.
    #[serde(default)]
    pub path_style: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl S3Location {
    /// Location in the default region with virtual-host addressing.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            region: default_region(),
            endpoint: None,
            path_style: false,
        }
    }

    /// `s3://bucket/key`, used for logs and metric labels.
    pub fn display(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    /// Request URL for the object.
    pub fn url(&self) -> Result<Url> {
        if self.bucket.is_empty() || self.key.is_empty() {
            return Err(RangeError::invalid_descriptor(format!(
                "{}: bucket and key are required",
                self.display()
            )));
        }
        let key = encode_key(&self.key);
        // Dotted bucket names do not match the wildcard TLS certificate.
        let path_style = self.path_style || self.bucket.contains('.');

        let url = match (&self.endpoint, path_style) {
            (None, false) => format!("https://{}.s3.{}.amazonaws.com/{key}", self.bucket, self.region),
            (None, true) => format!("https://s3.{}.amazonaws.com/{}/{key}", self.region, self.bucket),
            (Some(endpoint), true) => {
                format!("{}/{}/{key}", endpoint.trim_end_matches('/'), self.bucket)
            }
            (Some(endpoint), false) => {
                let mut base = parse_url(endpoint)?;
                let host = base.host_str().map(|h| format!("{}.{h}", self.bucket)).ok_or_else(
                    || RangeError::invalid_descriptor(format!("{endpoint}: endpoint has no host")),
                )?;
                base.set_host(Some(&host))
                    .map_err(|e| RangeError::invalid_descriptor(format!("{host}: {e}")))?;
                format!("{}/{key}", base.as_str().trim_end_matches('/'))
            }
        };
        parse_url(&url)
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| RangeError::invalid_descriptor(format!("{url}: {e}")))
}

/// Percent-encode a string the way SigV4 expects. `/` is kept when `keep_slash`.
fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn encode_key(key: &str) -> String {
    uri_encode(key.trim_start_matches('/'), true)
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| RangeError::protocol(format!("signing key: {e}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Everything that goes into one signature.
#[derive(Debug, Clone)]
pub(crate) struct SigningInput<'a> {
    pub method: &'a str,
    pub host: &'a str,
    /// Already URI-encoded path.
    pub path: &'a str,
    /// Decoded query pairs.
    pub query: Vec<(String, String)>,
    pub range: Option<&'a str>,
    pub session_token: Option<&'a str>,
    pub timestamp: DateTime<Utc>,
}

/// Headers to attach to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: &'static str,
}

/// AWS Signature Version 4 signer for S3 requests.
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    credentials: AwsCredentials,
    region: String,
    clock: fn() -> DateTime<Utc>,
}

impl SigV4Signer {
    /// Signer for `region` using the system clock.
    pub fn new(credentials: AwsCredentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
            clock: Utc::now,
        }
    }

    /// Replace the clock used for request timestamps.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn sign(&self, input: &SigningInput<'_>) -> Result<SignedHeaders> {
        let amz_date = input.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
        let date = input.timestamp.format("%Y%m%d").to_string();

        let mut headers: Vec<(&str, &str)> = vec![
            ("host", input.host),
            ("x-amz-content-sha256", EMPTY_PAYLOAD_SHA256),
            ("x-amz-date", amz_date.as_str()),
        ];
        if let Some(range) = input.range {
            headers.push(("range", range));
        }
        if let Some(token) = input.session_token {
            headers.push(("x-amz-security-token", token));
        }
        headers.sort_by(|a, b| a.0.cmp(b.0));

        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(";");

        let mut query: Vec<(String, String)> = input
            .query
            .iter()
            .map(|(k, v)| (uri_encode(k, false), uri_encode(v, false)))
            .collect();
        query.sort();
        let canonical_query = query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            input.method,
            input.path,
            canonical_query,
            canonical_headers,
            signed_headers,
            EMPTY_PAYLOAD_SHA256
        );

        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let secret = format!("AWS4{}", self.credentials.secret_access_key.expose());
        let key = hmac(secret.as_bytes(), &date)?;
        let key = hmac(&key, &self.region)?;
        let key = hmac(&key, SERVICE)?;
        let key = hmac(&key, "aws4_request")?;
        let signature = hex::encode(hmac(&key, &string_to_sign)?);

        Ok(SignedHeaders {
            authorization: format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.credentials.access_key_id
            ),
            amz_date,
            content_sha256: EMPTY_PAYLOAD_SHA256,
        })
    }
}

impl RequestAuth for SigV4Signer {
    fn authorize(
        &self,
        request: RequestBuilder,
        target: &RequestTarget<'_>,
    ) -> Result<RequestBuilder> {
        let host = match (target.url.host_str(), target.url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(RangeError::invalid_descriptor(format!(
                    "{}: URL has no host",
                    target.url
                )))
            }
        };
        let session_token = self
            .credentials
            .session_token
            .as_ref()
            .map(|token| token.expose());
        let signed = self.sign(&SigningInput {
            method: target.method.as_str(),
            host: &host,
            path: target.url.path(),
            query: target.url.query_pairs().into_owned().collect(),
            range: target.range,
            session_token,
            timestamp: (self.clock)(),
        })?;

        let mut request = request
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization);
        if let Some(token) = session_token {
            request = request.header("x-amz-security-token", token);
        }
        Ok(request)
    }
}

/// Range reader for an S3 object.
#[derive(Debug)]
pub struct S3RangeReader {
    transport: HttpTransport,
    location: S3Location,
}

impl S3RangeReader {
    /// Open an object. Without credentials requests are anonymous.
    pub fn new(
        client: Client,
        location: S3Location,
        credentials: Option<AwsCredentials>,
        config: &RangeReaderConfig,
    ) -> Result<Self> {
        let url = location.url()?;
        let auth: Box<dyn RequestAuth> = match credentials {
            Some(credentials) => Box::new(SigV4Signer::new(credentials, location.region.clone())),
            None => Box::new(Anonymous),
        };
        Ok(Self {
            transport: HttpTransport::new(client, url, BackendKind::S3, auth, config),
            location,
        })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.transport = self.transport.with_retry(retry);
        self
    }

    /// The object's bucket, key and region.
    pub fn object(&self) -> &S3Location {
        &self.location
    }
}

delegate_to_transport!(S3RangeReader);
