use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::url::SyftUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 200,
    Forbidden = 403,
    NotFound = 404,
    Expired = 419,
    ServerError = 500,
}

impl StatusCode {
    pub fn is_success(self) -> bool {
        let code = self as u16;
        (200..300).contains(&code)
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            200 => Some(Self::Ok),
            403 => Some(Self::Forbidden),
            404 => Some(Self::NotFound),
            419 => Some(Self::Expired),
            500 => Some(Self::ServerError),
            _ => None,
        }
    }
}

impl Serialize for StatusCode {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u16(self.as_u16())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let code = u16::deserialize(d)?;
        Self::from_u16(code).ok_or_else(|| serde::de::Error::custom(format!("unknown status code {code}")))
    }
}

fn base64_opt<S: serde::Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(bytes) => s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes)),
        None => s.serialize_none(),
    }
}

fn from_base64_opt<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
    let opt: Option<String> = Option::deserialize(d)?;
    match opt {
        Some(s) => base64::engine::general_purpose::STANDARD
            .decode(s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub sender: String,
    pub url: SyftUrl,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(
        default,
        serialize_with = "base64_opt",
        deserialize_with = "from_base64_opt"
    )]
    pub body: Option<Vec<u8>>,
    pub method: Method,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub sender: String,
    pub url: SyftUrl,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(
        default,
        serialize_with = "base64_opt",
        deserialize_with = "from_base64_opt"
    )]
    pub body: Option<Vec<u8>>,
    pub status_code: u16,
}

impl Request {
    pub fn new(
        sender: String,
        url: SyftUrl,
        method: Method,
        headers: BTreeMap<String, String>,
        body: Option<Vec<u8>>,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            timestamp: Utc::now(),
            expires,
            sender,
            url,
            headers,
            body,
            method,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }

    /// SHA-256 over the semantic fields only: `{url, method, sender, headers, body}`.
    /// Deliberately excludes `id`/`timestamp`/`expires` so identical calls collapse
    /// to the same cache key.
    pub fn message_hash(&self) -> String {
        #[derive(Serialize)]
        struct Semantic<'a> {
            url: &'a SyftUrl,
            method: Method,
            sender: &'a str,
            headers: &'a BTreeMap<String, String>,
            body: &'a Option<Vec<u8>>,
        }
        let semantic = Semantic {
            url: &self.url,
            method: self.method,
            sender: &self.sender,
            headers: &self.headers,
            body: &self.body,
        };
        let bytes = serde_json::to_vec(&semantic).expect("message is serializable");
        let digest = Sha256::digest(&bytes);
        format!("{digest:x}")
    }

    pub fn dumps(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize request")
    }

    pub fn loads(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| anyhow!("malformed request json: {e}"))
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.dumps()?).with_context(|| format!("write {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::loads(&raw)
    }
}

impl Response {
    pub fn reply_to(
        request: &Request,
        sender: String,
        body: Option<Vec<u8>>,
        headers: BTreeMap<String, String>,
        status_code: u16,
    ) -> Self {
        Self {
            id: request.id.clone(),
            timestamp: Utc::now(),
            expires: request.expires,
            sender,
            url: request.url.clone(),
            headers,
            body,
            status_code,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn dumps(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize response")
    }

    pub fn loads(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| anyhow!("malformed response json: {e}"))
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.dumps()?).with_context(|| format!("write {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::loads(&raw)
    }
}
