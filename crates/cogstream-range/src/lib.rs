//! Byte-range access to remote and local objects.
//!
//! A [`RangeReader`] fetches exact byte ranges of one object. Backends exist
//! for local files ([`LocalFileReader`]), plain HTTP ([`HttpRangeReader`]),
//! S3-compatible stores ([`S3RangeReader`]), Azure Blob Storage
//! ([`AzureBlobReader`]) and Google Cloud Storage ([`GcsRangeReader`]).
//! Every backend applies the same bounded [`RetryPolicy`] to transient
//! failures and reports permanent ones immediately.
//!
//! # Example
//!
//! ```no_run
//! use cogstream_range::{
//!     BackendRegistry, ClientRegistry, ConnectionDescriptor, RangeReader, RangeReaderConfig,
//! };
//!
//! let descriptor = ConnectionDescriptor::parse("s3://sentinel-cogs/scene/B04.tif?region=us-west-2")?;
//! let clients = ClientRegistry::new();
//! let reader = BackendRegistry::builtin().open(&descriptor, &RangeReaderConfig::default(), &clients)?;
//! let header = reader.read_range(0, 16_384)?;
//! # Ok::<(), cogstream_range::RangeError>(())
//! ```

mod azure;
mod config;
mod credentials;
mod descriptor;
mod error;
mod gcs;
mod http;
mod local;
mod memory;
mod reader;
mod registry;
mod retry;
mod s3;

pub use azure::{AzureBlobReader, AzureLocation, AZURE_API_VERSION};
pub use config::{RangeReaderConfig, RetryConfig};
pub use credentials::{AwsCredentials, AzureCredentials, BasicCredentials, GcsCredentials, Secret};
pub use descriptor::{open_range_reader, BackendKind, ConnectionDescriptor, ConnectionIdentity};
pub use error::{ErrorClass, RangeError};
pub use gcs::{GcsLocation, GcsRangeReader};
pub use http::{build_client, Anonymous, BasicAuth, HttpRangeReader, HttpTransport, RequestAuth, RequestTarget};
pub use local::LocalFileReader;
pub use memory::{MemoryProbe, MemoryRangeReader};
pub use reader::{RangeReader, RangeRequest, ReaderStats, ReaderStatsSnapshot, Telemetry};
pub use registry::{BackendFactory, BackendRegistry, ClientRegistry};
pub use retry::RetryPolicy;
pub use s3::{S3Location, S3RangeReader, SigV4Signer};

/// Result type for range operations.
pub type Result<T> = std::result::Result<T, RangeError>;
