//! Read-only asset inventory façade with OS-to-platform normalization.
//!
//! The inventory itself is an external collaborator; this module exposes the
//! three lookups the pipeline needs (count, search, connection profile) and
//! the closed OS-to-platform mapping used to derive selection filters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::Platform;
use crate::error::{Error, Result};

/// Default service binding on an asset (how you reach it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBinding {
    /// Service name, e.g. "winrm", "ssh"
    pub service: String,
    pub port: u16,
    pub is_secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Read-only projection of one inventory asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub os_type: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_service: Option<ServiceBinding>,
}

impl Asset {
    /// Canonical platform for this asset's operating system.
    pub fn platform(&self) -> Option<Platform> {
        platform_for_os(&self.os_type)
    }
}

/// Recognized inventory filters. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl AssetFilters {
    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    fn matches(&self, asset: &Asset) -> bool {
        let contains = |haystack: &str, needle: &str| {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        };
        if let Some(os) = &self.os {
            // "Windows 10" matches filter "windows" and vice versa
            if !contains(&asset.os_type, os) && !contains(os, &asset.os_type) {
                return false;
            }
        }
        if let Some(hostname) = &self.hostname {
            if !contains(&asset.hostname, hostname) {
                return false;
            }
        }
        if let Some(ip) = &self.ip {
            if asset.ip != *ip {
                return false;
            }
        }
        if let Some(status) = &self.status {
            if asset.status.as_deref().map(str::to_lowercase) != Some(status.to_lowercase()) {
                return false;
            }
        }
        if let Some(environment) = &self.environment {
            if asset.environment.as_deref().map(str::to_lowercase)
                != Some(environment.to_lowercase())
            {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !asset.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                return false;
            }
        }
        true
    }
}

/// Connection profile for a host, as resolved by the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_service: Option<ServiceBinding>,
}

impl ConnectionProfile {
    /// Profile for an unknown host.
    pub fn not_found() -> Self {
        Self {
            found: false,
            os: None,
            platform: None,
            default_service: None,
        }
    }

    /// Profile derived from an inventory asset.
    pub fn from_asset(asset: &Asset) -> Self {
        Self {
            found: true,
            os: Some(asset.os_type.clone()),
            platform: asset.platform(),
            default_service: asset.default_service.clone(),
        }
    }
}

/// Closed OS-to-platform mapping with case-insensitive substring fallback.
pub fn platform_for_os(os: &str) -> Option<Platform> {
    let os = os.to_lowercase();
    let os = os.trim();
    if os.is_empty() {
        return None;
    }
    const WINDOWS: &[&str] = &["windows", "win10", "win11", "windows_server"];
    const LINUX: &[&str] = &["linux", "ubuntu", "rhel", "debian"];
    const DATABASE: &[&str] = &["psql", "mysql", "mongo", "redis", "sqlite"];
    const NETWORK: &[&str] = &["nmap", "tcpdump", "tshark"];
    const CLOUD: &[&str] = &["aws", "az", "gcloud"];

    let matches = |names: &[&str]| names.iter().any(|n| os.contains(n));
    if matches(WINDOWS) {
        Some(Platform::Windows)
    } else if matches(LINUX) {
        Some(Platform::Linux)
    } else if matches(DATABASE) {
        Some(Platform::Database)
    } else if matches(NETWORK) {
        Some(Platform::Network)
    } else if matches(CLOUD) {
        Some(Platform::Cloud)
    } else {
        None
    }
}

/// Read-only inventory lookups used by selection and execution.
#[async_trait]
pub trait AssetFacade: Send + Sync {
    /// Number of assets matching the filters.
    async fn count_assets(&self, filters: &AssetFilters) -> Result<usize>;

    /// Assets matching the filters, up to `limit`.
    async fn search_assets(&self, filters: &AssetFilters, limit: usize) -> Result<Vec<Asset>>;

    /// Connection profile for a hostname or IP.
    async fn connection_profile(&self, host: &str) -> Result<ConnectionProfile>;
}

/// In-memory façade for tests and embedded deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticAssetFacade {
    assets: Vec<Asset>,
}

impl StaticAssetFacade {
    pub fn new(assets: Vec<Asset>) -> Self {
        Self { assets }
    }
}

#[async_trait]
impl AssetFacade for StaticAssetFacade {
    async fn count_assets(&self, filters: &AssetFilters) -> Result<usize> {
        Ok(self.assets.iter().filter(|a| filters.matches(a)).count())
    }

    async fn search_assets(&self, filters: &AssetFilters, limit: usize) -> Result<Vec<Asset>> {
        Ok(self
            .assets
            .iter()
            .filter(|a| filters.matches(a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn connection_profile(&self, host: &str) -> Result<ConnectionProfile> {
        let profile = self
            .assets
            .iter()
            .find(|a| a.hostname.eq_ignore_ascii_case(host) || a.ip == host)
            .map(ConnectionProfile::from_asset)
            .unwrap_or_else(ConnectionProfile::not_found);
        Ok(profile)
    }
}

/// HTTP façade against the external inventory service.
pub struct HttpAssetFacade {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAssetFacade {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| Error::upstream("asset", format!("asset_service_unavailable: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::upstream(
                "asset",
                format!("asset service returned {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Error::upstream("asset", format!("unparseable inventory response: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: usize,
}

fn filters_query(filters: &AssetFilters) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(v) = &filters.os {
        query.push(("os", v.clone()));
    }
    if let Some(v) = &filters.hostname {
        query.push(("hostname", v.clone()));
    }
    if let Some(v) = &filters.ip {
        query.push(("ip", v.clone()));
    }
    if let Some(v) = &filters.status {
        query.push(("status", v.clone()));
    }
    if let Some(v) = &filters.environment {
        query.push(("environment", v.clone()));
    }
    if let Some(v) = &filters.tag {
        query.push(("tag", v.clone()));
    }
    query
}

#[async_trait]
impl AssetFacade for HttpAssetFacade {
    async fn count_assets(&self, filters: &AssetFilters) -> Result<usize> {
        let response: CountResponse = self
            .get_json("/assets/count", &filters_query(filters))
            .await?;
        Ok(response.count)
    }

    async fn search_assets(&self, filters: &AssetFilters, limit: usize) -> Result<Vec<Asset>> {
        let mut query = filters_query(filters);
        query.push(("limit", limit.to_string()));
        self.get_json("/assets/search", &query).await
    }

    async fn connection_profile(&self, host: &str) -> Result<ConnectionProfile> {
        self.get_json("/assets/connection-profile", &[("host", host.to_string())])
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Inventory fixtures shared by stage tests.

    use super::*;

    pub(crate) fn win_asset(hostname: &str, ip: &str) -> Asset {
        Asset {
            id: format!("asset-{hostname}"),
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            os_type: "Windows 10".to_string(),
            os_version: "10.0.19045".to_string(),
            tags: vec!["win10".to_string()],
            status: Some("active".to_string()),
            environment: Some("production".to_string()),
            default_service: Some(ServiceBinding {
                service: "winrm".to_string(),
                port: 5986,
                is_secure: true,
                domain: Some("CORP".to_string()),
            }),
        }
    }

    pub(crate) fn linux_asset(hostname: &str, ip: &str) -> Asset {
        Asset {
            id: format!("asset-{hostname}"),
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            os_type: "Ubuntu 22.04".to_string(),
            os_version: "22.04".to_string(),
            tags: vec!["web".to_string()],
            status: Some("active".to_string()),
            environment: Some("production".to_string()),
            default_service: Some(ServiceBinding {
                service: "ssh".to_string(),
                port: 22,
                is_secure: true,
                domain: None,
            }),
        }
    }
}
