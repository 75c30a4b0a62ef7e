//! Transport collaborator.
//!
//! A [`Fetcher`] turns a [`Locator`] into raw image bytes. The loader treats it
//! like any other producer: the fetch runs on a worker task and its result
//! feeds the decode step.
//!
//! # Components
//!
//! - [`Locator`]: parsed source address (`file://`, `s3://`, or any scheme a
//!   custom fetcher understands)
//! - [`FileFetcher`]: reads local files
//! - [`S3Fetcher`]: reads whole objects from S3-compatible storage
//! - [`RoutingFetcher`]: dispatches on the locator scheme

mod file;
mod s3;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::bitmap::LoadedFrom;
use crate::error::FetchError;

pub use file::FileFetcher;
pub use s3::{create_s3_client, S3Fetcher};

// =============================================================================
// Locator
// =============================================================================

/// Address of a source image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator(Url);

impl Locator {
    /// Parse a URL, or a filesystem path relative to the working directory.
    pub fn parse(input: &str) -> Result<Self, FetchError> {
        let invalid = |message: String| FetchError::InvalidLocator {
            locator: input.to_string(),
            message,
        };

        match Url::parse(input) {
            Ok(url) => Ok(Self(url)),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let path = Path::new(input);
                let absolute = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    std::env::current_dir()
                        .map_err(|e| invalid(e.to_string()))?
                        .join(path)
                };
                Url::from_file_path(&absolute)
                    .map(Self)
                    .map_err(|_| invalid("not an absolute file path".to_string()))
            }
            Err(e) => Err(invalid(e.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Fetcher
// =============================================================================

/// Raw bytes of a source plus where they came from.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Bytes,
    pub loaded_from: LoadedFrom,
}

impl Fetched {
    pub fn network(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            loaded_from: LoadedFrom::Network,
        }
    }

    /// Bytes a transport served from its own cache after a conditional
    /// request confirmed they are current.
    pub fn revalidated(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            loaded_from: LoadedFrom::ConditionalCache,
        }
    }
}

/// Fetches the bytes behind a locator.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, locator: &Locator) -> Result<Fetched, FetchError>;
}

/// Dispatches to a fetcher registered for the locator's scheme.
#[derive(Clone, Default)]
pub struct RoutingFetcher {
    routes: HashMap<String, Arc<dyn Fetcher>>,
}

impl RoutingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route locators with `scheme` to `fetcher`.
    pub fn with_route(mut self, scheme: &str, fetcher: Arc<dyn Fetcher>) -> Self {
        self.routes.insert(scheme.to_ascii_lowercase(), fetcher);
        self
    }
}

#[async_trait]
impl Fetcher for RoutingFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<Fetched, FetchError> {
        match self.routes.get(locator.scheme()) {
            Some(fetcher) => fetcher.fetch(locator).await,
            None => Err(FetchError::UnsupportedScheme(locator.scheme().to_string())),
        }
    }
}
