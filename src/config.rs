use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8081";
const DEFAULT_PROXY_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub proxy: ProxyConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub addr: String,
    pub filters: Vec<FilterConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_PROXY_ADDR.to_owned(),
            filters: Vec::new(),
        }
    }
}

/// Header filter applied to requests whose URL starts with `url_prefix`
/// (every request when absent). `strip` removes the header before
/// fingerprinting and forwarding; `ignore` only excludes it from the
/// fingerprint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    #[serde(rename = "urlPrefix")]
    pub url_prefix: Option<String>,
    #[serde(rename = "reqHeader")]
    pub req_header: BTreeMap<String, FilterAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Strip,
    Ignore,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub directory: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Filesystem,
}

/// Header names a request should drop (`strip`) or exclude from its
/// fingerprint (`ignore`), resolved from the filters matching a URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderActions {
    pub strip: Vec<String>,
    pub ignore: Vec<String>,
}

impl Config {
    /// Resolves the effective config: built-in defaults, then the optional
    /// JSON config file, then CLI address overrides.
    pub fn load(
        path: Option<&Path>,
        addr_api: Option<&str>,
        addr_proxy: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        if let Some(addr) = addr_api {
            config.api.addr = addr.to_owned();
        }
        if let Some(addr) = addr_proxy {
            config.proxy.addr = addr.to_owned();
        }
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        json.parse()
    }

    pub fn header_actions_for(&self, url: &str) -> HeaderActions {
        let mut actions = HeaderActions::default();
        for filter in &self.proxy.filters {
            if let Some(prefix) = filter.url_prefix.as_deref() {
                if !url.starts_with(prefix) {
                    continue;
                }
            }
            for (name, action) in &filter.req_header {
                let name = name.to_ascii_lowercase();
                match action {
                    FilterAction::Strip => actions.strip.push(name),
                    FilterAction::Ignore => actions.ignore.push(name),
                }
            }
        }
        actions
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).context("parse config JSON")
    }
}
