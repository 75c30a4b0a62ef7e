use async_trait::async_trait;
use aws_sdk_s3::Client;

use super::{Fetched, Fetcher, Locator};
use crate::error::FetchError;

/// Fetches whole objects from S3 or S3-compatible storage (MinIO, etc.).
///
/// Locators have the form `s3://<bucket>/<key>`.
#[derive(Clone)]
pub struct S3Fetcher {
    client: Client,
}

impl S3Fetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Split an `s3://bucket/key` locator.
fn bucket_and_key(locator: &Locator) -> Result<(String, String), FetchError> {
    let invalid = |message: &str| FetchError::InvalidLocator {
        locator: locator.to_string(),
        message: message.to_string(),
    };

    if locator.scheme() != "s3" {
        return Err(FetchError::UnsupportedScheme(locator.scheme().to_string()));
    }
    let bucket = locator
        .url()
        .host_str()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| invalid("missing bucket"))?;
    let key = locator.url().path().trim_start_matches('/');
    if key.is_empty() {
        return Err(invalid("missing object key"));
    }
    let key = urlencoding::decode(key).map_err(|e| invalid(&e.to_string()))?;

    Ok((bucket.to_string(), key.into_owned()))
}

#[async_trait]
impl Fetcher for S3Fetcher {
    async fn fetch(&self, locator: &Locator) -> Result<Fetched, FetchError> {
        let (bucket, key) = bucket_and_key(locator)?;

        let resp = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let is_not_found = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);

                let status_is_404 = e
                    .raw_response()
                    .map(|r| r.status().as_u16() == 404)
                    .unwrap_or(false);

                if is_not_found || status_is_404 {
                    return FetchError::NotFound(locator.to_string());
                }
                FetchError::S3(e.to_string())
            })?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| FetchError::Io {
                locator: locator.to_string(),
                message: e.to_string(),
            })?
            .into_bytes();

        Ok(Fetched::network(data))
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    // S3-compatible services generally need path-style addressing
    let s3_config = if endpoint_url.is_some() {
        aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build()
    } else {
        aws_sdk_s3::config::Builder::from(&sdk_config).build()
    };

    Client::from_conf(s3_config)
}
