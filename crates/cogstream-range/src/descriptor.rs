//! Connection descriptors and backend selection.

use std::fmt;
use std::path::PathBuf;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::credentials::fingerprint;
use crate::{
    AwsCredentials, AzureBlobReader, AzureCredentials, AzureLocation, BasicCredentials,
    ClientRegistry, GcsCredentials, GcsLocation, GcsRangeReader, HttpRangeReader,
    LocalFileReader, RangeError, RangeReader, RangeReaderConfig, Result, S3Location,
    S3RangeReader,
};

/// Which backend implementation serves a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local filesystem.
    File,
    /// Plain HTTP(S).
    Http,
    /// S3 or an S3-compatible store.
    S3,
    /// Azure Blob Storage.
    Azure,
    /// Google Cloud Storage.
    Gcs,
    /// In-memory test backend.
    Memory,
}

impl BackendKind {
    /// Returns the backend as a lowercase string (used as a metric label).
    pub const fn as_str(&self) -> &'static str {
        match self {
            BackendKind::File => "file",
            BackendKind::Http => "http",
            BackendKind::S3 => "s3",
            BackendKind::Azure => "azure",
            BackendKind::Gcs => "gcs",
            BackendKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an object lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ConnectionDescriptor {
    /// A local file.
    File {
        /// Filesystem path.
        path: PathBuf,
    },
    /// An HTTP(S) URL.
    Http {
        /// Object URL.
        url: String,
        /// Optional basic-auth credentials.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<BasicCredentials>,
    },
    /// An S3 object.
    S3 {
        /// Bucket, key, region and addressing.
        #[serde(flatten)]
        location: S3Location,
        /// Static credentials; anonymous when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<AwsCredentials>,
    },
    /// An Azure blob.
    Azure {
        /// Account, container and blob.
        #[serde(flatten)]
        location: AzureLocation,
        /// SAS token or bearer token; anonymous when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<AzureCredentials>,
    },
    /// A Google Cloud Storage object.
    Gcs {
        /// Bucket and object.
        #[serde(flatten)]
        location: GcsLocation,
        /// Bearer token; anonymous when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<GcsCredentials>,
    },
}

/// Everything that distinguishes one retained backend client from another.
///
/// Two descriptors share a client only when endpoint, region and
/// credentials all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    /// Backend kind.
    pub backend: BackendKind,
    /// Scheme, host and port the client talks to.
    pub endpoint: String,
    /// Signing region, for backends that have one.
    pub region: Option<String>,
    /// Digest of the credentials, never the credentials themselves.
    pub credential: Option<String>,
}

/// Split `bucket/key/with/slashes` into its first segment and the rest.
fn split_container(rest: &str, input: &str) -> Result<(String, String)> {
    match rest.split_once('/') {
        Some((head, tail)) if !head.is_empty() && !tail.is_empty() => {
            Ok((head.to_string(), tail.to_string()))
        }
        _ => Err(RangeError::invalid_descriptor(format!(
            "{input}: expected <container>/<object>"
        ))),
    }
}

/// Split an optional `?a=b&c=d` suffix off a location.
fn split_query(input: &str) -> (&str, Vec<(&str, &str)>) {
    match input.split_once('?') {
        Some((path, query)) => (
            path,
            query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
                .collect(),
        ),
        None => (input, Vec::new()),
    }
}

fn origin(url: &str) -> String {
    match Url::parse(url) {
        Ok(url) => url.origin().ascii_serialization(),
        Err(_) => url.to_string(),
    }
}

impl ConnectionDescriptor {
    /// Descriptor for a local file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ConnectionDescriptor::File { path: path.into() }
    }

    /// Descriptor for an unauthenticated HTTP(S) URL.
    pub fn http(url: impl Into<String>) -> Self {
        ConnectionDescriptor::Http {
            url: url.into(),
            credentials: None,
        }
    }

    /// Parse a location string.
    ///
    /// Accepts plain paths, `file://`, `http://`, `https://`,
    /// `s3://bucket/key`, `gs://bucket/object` and
    /// `az://account/container/blob`. S3 locations take optional
    /// `region`, `endpoint` and `path_style` query parameters. Credentials
    /// are never parsed from the string; attach them to the returned value.
    pub fn parse(input: &str) -> Result<Self> {
        let Some((scheme, rest)) = input.split_once("://") else {
            if input.is_empty() {
                return Err(RangeError::invalid_descriptor("empty location"));
            }
            return Ok(Self::file(input));
        };

        match scheme.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::file(rest)),
            "http" | "https" => {
                Url::parse(input)
                    .map_err(|e| RangeError::invalid_descriptor(format!("{input}: {e}")))?;
                Ok(Self::http(input))
            }
            "s3" => {
                let (path, params) = split_query(rest);
                let (bucket, key) = split_container(path, input)?;
                let mut location = S3Location::new(bucket, key);
                for (name, value) in params {
                    match name {
                        "region" => location.region = value.to_string(),
                        "endpoint" => location.endpoint = Some(value.to_string()),
                        "path_style" => location.path_style = matches!(value, "true" | "1" | ""),
                        other => {
                            return Err(RangeError::invalid_descriptor(format!(
                                "{input}: unknown parameter {other:?}"
                            )))
                        }
                    }
                }
                Ok(ConnectionDescriptor::S3 {
                    location,
                    credentials: None,
                })
            }
            "gs" => {
                let (bucket, object) = split_container(rest, input)?;
                Ok(ConnectionDescriptor::Gcs {
                    location: GcsLocation::new(bucket, object),
                    credentials: None,
                })
            }
            "az" => {
                let (account, rest) = split_container(rest, input)?;
                let (container, blob) = split_container(&rest, input)?;
                Ok(ConnectionDescriptor::Azure {
                    location: AzureLocation::new(account, container, blob),
                    credentials: None,
                })
            }
            other => Err(RangeError::invalid_descriptor(format!(
                "{input}: unsupported scheme {other:?}"
            ))),
        }
    }

    /// Backend that serves this descriptor.
    pub fn kind(&self) -> BackendKind {
        match self {
            ConnectionDescriptor::File { .. } => BackendKind::File,
            ConnectionDescriptor::Http { .. } => BackendKind::Http,
            ConnectionDescriptor::S3 { .. } => BackendKind::S3,
            ConnectionDescriptor::Azure { .. } => BackendKind::Azure,
            ConnectionDescriptor::Gcs { .. } => BackendKind::Gcs,
        }
    }

    /// Human-readable location without credentials or query strings.
    pub fn location(&self) -> String {
        match self {
            ConnectionDescriptor::File { path } => path.display().to_string(),
            ConnectionDescriptor::Http { url, .. } => match Url::parse(url) {
                Ok(mut url) => {
                    url.set_query(None);
                    let _ = url.set_password(None);
                    url.to_string()
                }
                Err(_) => url.clone(),
            },
            ConnectionDescriptor::S3 { location, .. } => location.display(),
            ConnectionDescriptor::Azure { location, .. } => location.display(),
            ConnectionDescriptor::Gcs { location, .. } => location.display(),
        }
    }

    /// Identity used to key retained backend clients.
    pub fn identity(&self) -> ConnectionIdentity {
        let backend = self.kind();
        match self {
            ConnectionDescriptor::File { .. } => ConnectionIdentity {
                backend,
                endpoint: "local".to_string(),
                region: None,
                credential: None,
            },
            ConnectionDescriptor::Http { url, credentials } => ConnectionIdentity {
                backend,
                endpoint: origin(url),
                region: None,
                credential: credentials
                    .as_ref()
                    .map(|c| fingerprint(&[&c.username, c.password.expose()])),
            },
            ConnectionDescriptor::S3 {
                location,
                credentials,
            } => ConnectionIdentity {
                backend,
                endpoint: location
                    .url()
                    .map(|u| u.origin().ascii_serialization())
                    .unwrap_or_else(|_| location.display()),
                region: Some(location.region.clone()),
                credential: credentials.as_ref().map(|c| {
                    fingerprint(&[
                        &c.access_key_id,
                        c.secret_access_key.expose(),
                        c.session_token.as_ref().map(|t| t.expose()).unwrap_or(""),
                    ])
                }),
            },
            ConnectionDescriptor::Azure {
                location,
                credentials,
            } => ConnectionIdentity {
                backend,
                endpoint: location
                    .url()
                    .map(|u| u.origin().ascii_serialization())
                    .unwrap_or_else(|_| location.display()),
                region: None,
                credential: credentials.as_ref().map(|c| match c {
                    AzureCredentials::Sas(token) => fingerprint(&["sas", token.expose()]),
                    AzureCredentials::Bearer(token) => fingerprint(&["bearer", token.expose()]),
                }),
            },
            ConnectionDescriptor::Gcs {
                location,
                credentials,
            } => ConnectionIdentity {
                backend,
                endpoint: location
                    .url()
                    .map(|u| u.origin().ascii_serialization())
                    .unwrap_or_else(|_| location.display()),
                region: None,
                credential: credentials.as_ref().map(|c| match c {
                    GcsCredentials::Bearer(token) => fingerprint(&["bearer", token.expose()]),
                }),
            },
        }
    }
}

/// Open a reader with the built-in backend for `descriptor`.
///
/// HTTP-based backends take their client from `clients`, so readers for
/// the same endpoint, region and credentials share a connection pool.
pub fn open_range_reader(
    descriptor: &ConnectionDescriptor,
    config: &RangeReaderConfig,
    clients: &ClientRegistry,
) -> Result<Box<dyn RangeReader>> {
    let identity = descriptor.identity();
    Ok(match descriptor {
        ConnectionDescriptor::File { path } => Box::new(LocalFileReader::with_config(path, config)?),
        ConnectionDescriptor::Http { url, credentials } => Box::new(HttpRangeReader::with_client(
            clients.client_for(&identity, config)?,
            url,
            credentials.clone(),
            config,
        )?),
        ConnectionDescriptor::S3 {
            location,
            credentials,
        } => Box::new(S3RangeReader::new(
            clients.client_for(&identity, config)?,
            location.clone(),
            credentials.clone(),
            config,
        )?),
        ConnectionDescriptor::Azure {
            location,
            credentials,
        } => Box::new(AzureBlobReader::new(
            clients.client_for(&identity, config)?,
            location.clone(),
            credentials.clone(),
            config,
        )?),
        ConnectionDescriptor::Gcs {
            location,
            credentials,
        } => Box::new(GcsRangeReader::new(
            clients.client_for(&identity, config)?,
            location.clone(),
            credentials.clone(),
            config,
        )?),
    })
}
