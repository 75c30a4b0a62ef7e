use async_trait::async_trait;
use bytes::Bytes;

use super::{Fetched, Fetcher, Locator};
use crate::error::FetchError;

/// Reads `file://` locators from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

impl FileFetcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<Fetched, FetchError> {
        if locator.scheme() != "file" {
            return Err(FetchError::UnsupportedScheme(locator.scheme().to_string()));
        }

        let path = locator
            .url()
            .to_file_path()
            .map_err(|_| FetchError::InvalidLocator {
                locator: locator.to_string(),
                message: "not a local file path".to_string(),
            })?;

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Fetched::network(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::NotFound(locator.to_string()))
            }
            Err(e) => Err(FetchError::Io {
                locator: locator.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
