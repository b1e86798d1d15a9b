//! Firmware catalog lookup.
//!
//! Resolves a `(device, version)` pair to the download URL of the matching
//! firmware archive using the ipsw.me v4 API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Default catalog endpoint
pub const DEFAULT_CATALOG_URL: &str = "https://api.ipsw.me/v4";

/// Resolves firmware builds to archive URLs
#[async_trait]
pub trait FirmwareCatalog: Send + Sync {
    /// Look up the archive URL for `version` on `device`.
    ///
    /// `Ok(None)` means the catalog answered but has no such build.
    async fn firmware_url(&self, device: &str, version: &str) -> Result<Option<String>>;
}

/// Device listing returned by `GET /device/<identifier>?type=ipsw`
#[derive(Debug, Deserialize)]
struct DeviceFirmwares {
    #[serde(default)]
    firmwares: Vec<FirmwareEntry>,
}

#[derive(Debug, Deserialize)]
struct FirmwareEntry {
    version: String,
    url: String,
}

/// HTTP client for the ipsw.me catalog
pub struct IpswCatalog {
    base_url: String,
    client: reqwest::Client,
}

impl Default for IpswCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOG_URL)
    }
}

impl IpswCatalog {
    /// Create a catalog client against `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn device_url(&self, device: &str) -> String {
        format!("{}/device/{}", self.base_url, device)
    }
}

/// Pick the URL of the firmware whose version matches exactly
fn select_url(listing: DeviceFirmwares, version: &str) -> Option<String> {
    listing
        .firmwares
        .into_iter()
        .find(|fw| fw.version == version)
        .map(|fw| fw.url)
        .filter(|url| !url.trim().is_empty())
}

#[async_trait]
impl FirmwareCatalog for IpswCatalog {
    async fn firmware_url(&self, device: &str, version: &str) -> Result<Option<String>> {
        let url = self.device_url(device);
        debug!(%url, "Querying firmware catalog");

        let listing: DeviceFirmwares = self
            .client
            .get(&url)
            .query(&[("type", "ipsw")])
            .send()
            .await
            .with_context(|| format!("Failed to query firmware catalog for {}", device))?
            .error_for_status()
            .with_context(|| format!("Firmware catalog rejected lookup for {}", device))?
            .json()
            .await
            .context("Failed to parse firmware catalog response")?;

        Ok(select_url(listing, version))
    }
}
