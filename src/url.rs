use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^syft://([a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9.-]+)(/.*)?$").unwrap());

/// `syft://<email>/<path>`, the addressing scheme for every message written
/// into a datasite tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyftUrl {
    host: String,
    path: String,
}

impl SyftUrl {
    pub fn parse(s: &str) -> Result<Self> {
        let caps = URL_RE
            .captures(s)
            .ok_or_else(|| anyhow!("invalid syft url: {s}"))?;
        let host = caps.get(1).unwrap().as_str().to_string();
        let path = caps
            .get(2)
            .map(|m| m.as_str().trim_start_matches('/').to_string())
            .unwrap_or_default();
        Ok(Self { host, path })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Join `<datasites_root>/<host>/<path>`.
    pub fn to_local_path(&self, datasites_root: &Path) -> PathBuf {
        let mut p = datasites_root.join(&self.host);
        if !self.path.is_empty() {
            p = p.join(&self.path);
        }
        p
    }

    /// Inverse of `to_local_path`: reconstruct a URL from an absolute path
    /// known to live under `datasites_root`.
    pub fn from_path(path: &Path, datasites_root: &Path) -> Result<Self> {
        let rel = path
            .strip_prefix(datasites_root)
            .map_err(|_| anyhow!("path {} is not under datasites root", path.display()))?;
        let mut components = rel.components();
        let host = components
            .next()
            .ok_or_else(|| anyhow!("path {} has no datasite segment", path.display()))?
            .as_os_str()
            .to_string_lossy()
            .to_string();
        let rest: PathBuf = components.collect();
        let path_str = rest.to_string_lossy().replace('\\', "/");
        Ok(Self {
            host,
            path: path_str,
        })
    }

    pub fn as_http_params(&self) -> HttpParams {
        HttpParams {
            method: "get".to_string(),
            datasite: self.host.clone(),
            path: self.path.clone(),
        }
    }
}

impl std::fmt::Display for SyftUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "syft://{}/{}", self.host, self.path)
    }
}

impl TryFrom<String> for SyftUrl {
    type Error = anyhow::Error;
    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SyftUrl> for String {
    fn from(value: SyftUrl) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HttpParams {
    pub method: String,
    pub datasite: String,
    pub path: String,
}
