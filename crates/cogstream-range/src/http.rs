//! HTTP range transport shared by the HTTP, S3, Azure and GCS backends.
//!
//! Each backend only differs in how the object URL is built and how a
//! request is authorized; the transport owns the client, the retry loop,
//! response classification and the cached object length.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Method, StatusCode, Url};
use tracing::debug;

use crate::{
    BackendKind, BasicCredentials, RangeError, RangeReader, RangeReaderConfig, RangeRequest,
    ReaderStatsSnapshot, Result, RetryPolicy, Telemetry,
};

/// The request an authorizer is asked to sign.
#[derive(Debug, Clone, Copy)]
pub struct RequestTarget<'a> {
    /// HTTP method.
    pub method: &'a Method,
    /// Full request URL, including any query string.
    pub url: &'a Url,
    /// Value of the `Range` header, if one is sent.
    pub range: Option<&'a str>,
}

/// Adds backend-specific authentication to an outgoing request.
pub trait RequestAuth: Send + Sync + fmt::Debug {
    /// Decorate `request` so the backend accepts it.
    fn authorize(&self, request: RequestBuilder, target: &RequestTarget<'_>)
        -> Result<RequestBuilder>;
}

/// Sends requests unauthenticated.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl RequestAuth for Anonymous {
    fn authorize(&self, request: RequestBuilder, _: &RequestTarget<'_>) -> Result<RequestBuilder> {
        Ok(request)
    }
}

/// HTTP basic authentication.
#[derive(Debug, Clone)]
pub struct BasicAuth(pub BasicCredentials);

impl RequestAuth for BasicAuth {
    fn authorize(&self, request: RequestBuilder, _: &RequestTarget<'_>) -> Result<RequestBuilder> {
        Ok(request.basic_auth(&self.0.username, Some(self.0.password.expose())))
    }
}

/// Build a blocking HTTP client from reader configuration.
pub fn build_client(config: &RangeReaderConfig) -> Result<Client> {
    Ok(Client::builder()
        .timeout(config.timeout())
        .connect_timeout(config.connect_timeout())
        .user_agent(config.user_agent.clone())
        .build()?)
}

/// Extract the total object size from a `Content-Range` header.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
}

/// Range-capable HTTP transport for one object URL.
pub struct HttpTransport {
    client: Client,
    url: Url,
    location: String,
    backend: BackendKind,
    auth: Box<dyn RequestAuth>,
    retry: RetryPolicy,
    telemetry: Telemetry,
    closed: AtomicBool,
    length: Mutex<Option<u64>>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("location", &self.location)
            .field("backend", &self.backend)
            .field("auth", &self.auth)
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport for `url`, authorizing requests with `auth`.
    pub fn new(
        client: Client,
        url: Url,
        backend: BackendKind,
        auth: Box<dyn RequestAuth>,
        config: &RangeReaderConfig,
    ) -> Self {
        let location = redact_query(&url);
        Self {
            telemetry: Telemetry::new(backend, location.clone()),
            client,
            url,
            location,
            backend,
            auth,
            retry: RetryPolicy::from_config(&config.retry),
            closed: AtomicBool::new(false),
            length: Mutex::new(None),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The object URL (may contain a query string with tokens).
    pub fn url(&self) -> &Url {
        &self.url
    }

    fn request(&self, method: Method, range: Option<&str>) -> Result<RequestBuilder> {
        let mut builder = self.client.request(method.clone(), self.url.clone());
        if let Some(range) = range {
            builder = builder.header(RANGE, range);
        }
        let target = RequestTarget {
            method: &method,
            url: &self.url,
            range,
        };
        self.auth.authorize(builder, &target)
    }

    fn status_error(&self, status: StatusCode) -> RangeError {
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => RangeError::NotFound(self.location.clone()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                RangeError::AccessDenied(self.location.clone())
            }
            _ => RangeError::Status {
                status: status.as_u16(),
                location: self.location.clone(),
            },
        }
    }

    fn fetch_once(&self, offset: u64, length: u32) -> Result<Bytes> {
        let header = RangeRequest::new(offset, length).http_header();
        let response = self.request(Method::GET, Some(&header))?.send()?;
        let status = response.status();
        let end = offset + length as u64;

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let total = content_range_total(response.headers());
                let body = response.bytes()?;
                check_body(offset, length, body, total)
            }
            StatusCode::OK => {
                // Server ignored the Range header and sent the whole object.
                let body = response.bytes()?;
                let available = body.len() as u64;
                if available < end {
                    return Err(RangeError::UnexpectedEof {
                        offset,
                        requested: length as u64,
                        available,
                    });
                }
                Ok(body.slice(offset as usize..end as usize))
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Err(RangeError::UnexpectedEof {
                offset,
                requested: length as u64,
                available: content_range_total(response.headers())
                    .or(*self.length.lock())
                    .unwrap_or(offset),
            }),
            _ => Err(self.status_error(status)),
        }
    }

    fn probe_length(&self) -> Result<u64> {
        let response = self.request(Method::HEAD, None)?.send()?;
        let status = response.status();
        if status.is_success() {
            if let Some(length) = content_length(response.headers()) {
                return Ok(length);
            }
        } else if status != StatusCode::METHOD_NOT_ALLOWED && status != StatusCode::NOT_IMPLEMENTED
        {
            return Err(self.status_error(status));
        }

        // No usable HEAD: ask for the first byte and read the total from Content-Range.
        let response: Response = self.request(Method::GET, Some("bytes=0-0"))?.send()?;
        let status = response.status();
        let length = match status {
            StatusCode::PARTIAL_CONTENT | StatusCode::RANGE_NOT_SATISFIABLE => {
                content_range_total(response.headers())
            }
            StatusCode::OK => content_length(response.headers()),
            _ => return Err(self.status_error(status)),
        };
        length.ok_or_else(|| {
            RangeError::protocol(format!("{}: server did not report object length", self.location))
        })
    }
}

/// Validate a 206 body against the requested range.
fn check_body(offset: u64, length: u32, body: Bytes, total: Option<u64>) -> Result<Bytes> {
    let requested = length as usize;
    if body.len() >= requested {
        return Ok(body.slice(..requested));
    }
    let received = body.len() as u64;
    match total {
        Some(total) if offset + received >= total => Err(RangeError::UnexpectedEof {
            offset,
            requested: length as u64,
            available: total,
        }),
        _ => Err(RangeError::ShortRead {
            offset,
            requested: length as u64,
            received,
        }),
    }
}

/// URL without its query string, safe for logs and metric labels.
fn redact_query(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}

impl RangeReader for HttpTransport {
    fn read_range(&self, offset: u64, length: u32) -> Result<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RangeError::Closed);
        }
        if let Some(available) = *self.length.lock() {
            if offset + length as u64 > available {
                return Err(RangeError::UnexpectedEof {
                    offset,
                    requested: length as u64,
                    available,
                });
            }
        }
        if length == 0 {
            return Ok(Bytes::new());
        }

        let bytes = self
            .retry
            .execute(&self.location, &self.closed, &self.telemetry, |attempt| {
                debug!(location = %self.location, offset, length, attempt, "range request");
                self.fetch_once(offset, length)
            })?;
        self.telemetry.bytes(bytes.len());
        Ok(bytes)
    }

    fn length(&self) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RangeError::Closed);
        }
        let mut cached = self.length.lock();
        if let Some(length) = *cached {
            return Ok(length);
        }
        let length = self
            .retry
            .execute(&self.location, &self.closed, &self.telemetry, |_| {
                self.probe_length()
            })?;
        debug!(location = %self.location, length, "object length");
        *cached = Some(length);
        Ok(length)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn backend(&self) -> BackendKind {
        self.backend
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn stats(&self) -> ReaderStatsSnapshot {
        self.telemetry.snapshot()
    }
}

/// Implements [`RangeReader`] for a backend type by delegating to its
/// `transport` field.
macro_rules! delegate_to_transport {
    ($backend:ty) => {
        impl $crate::RangeReader for $backend {
            fn read_range(&self, offset: u64, length: u32) -> $crate::Result<bytes::Bytes> {
                self.transport.read_range(offset, length)
            }

            fn length(&self) -> $crate::Result<u64> {
                self.transport.length()
            }

            fn close(&self) {
                self.transport.close()
            }

            fn is_closed(&self) -> bool {
                self.transport.is_closed()
            }

            fn backend(&self) -> $crate::BackendKind {
                self.transport.backend()
            }

            fn location(&self) -> &str {
                self.transport.location()
            }

            fn stats(&self) -> $crate::ReaderStatsSnapshot {
                self.transport.stats()
            }
        }
    };
}

pub(crate) use delegate_to_transport;

/// Plain HTTP(S) server honouring `Range` requests.
#[derive(Debug)]
pub struct HttpRangeReader {
    transport: HttpTransport,
}

impl HttpRangeReader {
    /// Open `url` with default settings and a fresh client.
    pub fn open(url: &str) -> Result<Self> {
        let config = RangeReaderConfig::default();
        Self::with_client(build_client(&config)?, url, None, &config)
    }

    /// Open `url` with the given client, optional basic credentials and config.
    pub fn with_client(
        client: Client,
        url: &str,
        credentials: Option<BasicCredentials>,
        config: &RangeReaderConfig,
    ) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| RangeError::invalid_descriptor(format!("{url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RangeError::invalid_descriptor(format!(
                "{url}: expected http or https scheme"
            )));
        }
        let auth: Box<dyn RequestAuth> = match credentials {
            Some(credentials) => Box::new(BasicAuth(credentials)),
            None => Box::new(Anonymous),
        };
        Ok(Self {
            transport: HttpTransport::new(client, url, BackendKind::Http, auth, config),
        })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.transport = self.transport.with_retry(retry);
        self
    }
}

delegate_to_transport!(HttpRangeReader);

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_with_range(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total(&headers_with_range("bytes 0-99/1234")), Some(1234));
        assert_eq!(content_range_total(&headers_with_range("bytes */1234")), Some(1234));
        assert_eq!(content_range_total(&headers_with_range("bytes 0-99/*")), None);
        assert_eq!(content_range_total(&HeaderMap::new()), None);
    }

    #[test]
    fn test_check_body_short_before_end_is_protocol_error() {
        let err = check_body(0, 10, Bytes::from_static(&[1, 2, 3]), Some(100)).unwrap_err();
        assert!(matches!(err, RangeError::ShortRead { received: 3, .. }));
    }

    #[test]
    fn test_check_body_short_at_end_is_eof() {
        let err = check_body(97, 10, Bytes::from_static(&[1, 2, 3]), Some(100)).unwrap_err();
        assert!(matches!(err, RangeError::UnexpectedEof { available: 100, .. }));
    }

    #[test]
    fn test_check_body_trims_excess() {
        let body = check_body(0, 2, Bytes::from_static(&[1, 2, 3]), None).unwrap();
        assert_eq!(&body[..], &[1, 2]);
    }

    #[test]
    fn test_redact_query() {
        let url = Url::parse("https://acct.blob.core.windows.net/c/b.tif?sig=secret&sv=1").unwrap();
        assert_eq!(redact_query(&url), "https://acct.blob.core.windows.net/c/b.tif");
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let config = RangeReaderConfig::default();
        let client = build_client(&config).unwrap();
        let err = HttpRangeReader::with_client(client, "ftp://host/a.tif", None, &config).unwrap_err();
        assert!(matches!(err, RangeError::InvalidDescriptor(_)));
    }
}
