//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::{CommonError, Result};

/// Configuration for a caching worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwConfig {
    /// Version tag. Names the active cache generation and is reported by `GET_VERSION`.
    pub version: String,

    /// Origin the worker is deployed on. Relative URLs resolve against it.
    pub origin: Url,

    /// Resources pre-populated on install
    pub seed_resources: Vec<String>,

    /// URL substrings that classify a request as an API call
    pub api_patterns: Vec<String>,

    /// Root directory of the file-backed cache store
    pub store_dir: PathBuf,

    /// Per-fetch timeout in milliseconds. `None` leaves timing to the transport.
    pub fetch_timeout_ms: Option<u64>,

    /// User agent string
    pub user_agent: String,

    /// Maximum number of redirects followed by the HTTP fetcher
    pub max_redirects: usize,

    /// Byte budget of the cache store. `None` means unbounded.
    pub quota_bytes: Option<u64>,
}

impl Default for SwConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            origin: Url::parse("http://localhost:8080/").expect("static origin is valid"),
            seed_resources: vec!["./".to_string(), "./index.html".to_string()],
            api_patterns: vec!["/api/".to_string(), "jsonplaceholder".to_string()],
            store_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("swcache"),
            fetch_timeout_ms: None,
            user_agent: format!("swcache/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
            quota_bytes: None,
        }
    }
}

impl SwConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CommonError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            CommonError::config_with_source(format!("cannot parse {}", path.display()), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(CommonError::config("version tag must not be empty"));
        }
        match self.origin.scheme() {
            "http" | "https" => {}
            other => {
                return Err(CommonError::config(format!(
                    "origin must be http or https, got {other}"
                )))
            }
        }
        if self.fetch_timeout_ms == Some(0) {
            return Err(CommonError::config("fetch_timeout_ms must be positive"));
        }
        if self.quota_bytes == Some(0) {
            return Err(CommonError::config("quota_bytes must be positive"));
        }
        Ok(())
    }

    /// Resolve a possibly relative URL against the origin.
    pub fn resolve(&self, url: &str) -> Result<Url> {
        self.origin
            .join(url)
            .map_err(|e| CommonError::InvalidArgument(format!("{url}: {e}")))
    }

    /// Per-fetch timeout, if configured.
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}
