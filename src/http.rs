use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client as HttpClient, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

/// Minimum client version the server accepts; older clients are rejected with 426.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Thin wrapper over the server's sync API. Auth is a single bearer token
/// configured per workspace -- there is no OAuth token refresh dance here,
/// unlike the blob-storage client this was adapted from.
#[derive(Clone)]
pub struct ApiClient {
    base: String,
    http: HttpClient,
    email: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base: &str, email: &str, token: Option<&str>) -> Result<Self> {
        let user_agent = format!(
            "syftbox-rs/{} ({}; {})",
            CLIENT_VERSION,
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        let builder = ClientBuilder::new()
            .timeout(Duration::from_secs(10 * 60))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(user_agent)
            .no_proxy();

        let http = builder.build()?;
        Ok(ApiClient {
            base: base.trim_end_matches('/').to_string(),
            http,
            email: email.to_string(),
            token: token.map(|s| s.to_string()),
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.query(&[("user", &self.email)]);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req.send().await?;
        if resp.status() == StatusCode::from_u16(426).unwrap() {
            anyhow::bail!("server requires a newer client (minimum accepted version rejected this client)");
        }
        Ok(resp)
    }

    pub async fn whoami(&self) -> Result<WhoAmI> {
        let url = format!("{}/auth/whoami", self.base);
        let resp = self.send(self.authed(self.http.get(url))).await?;
        map_json(resp, "whoami").await
    }

    pub async fn datasites(&self) -> Result<std::collections::HashMap<String, Vec<FileMetadata>>> {
        let url = format!("{}/sync/datasites", self.base);
        let resp = self.send(self.authed(self.http.post(url))).await?;
        map_json(resp, "list datasites").await
    }

    pub async fn dir_state(&self, dir: &str) -> Result<Vec<FileMetadata>> {
        let url = format!("{}/sync/dir_state", self.base);
        let resp = self
            .send(self.authed(self.http.post(url).query(&[("dir", dir)])))
            .await?;
        map_json(resp, "dir_state").await
    }

    pub async fn get_metadata(&self, path: &str) -> Result<FileMetadata> {
        let url = format!("{}/sync/get_metadata", self.base);
        let body = PathParam { path };
        let resp = self
            .send(self.authed(self.http.post(url)).json(&body))
            .await?;
        map_json(resp, "get_metadata").await
    }

    pub async fn get_diff(&self, path: &str, signature: &str) -> Result<DiffResponse> {
        let url = format!("{}/sync/get_diff", self.base);
        let body = GetDiffRequest { path, signature };
        let resp = self
            .send(self.authed(self.http.post(url)).json(&body))
            .await?;
        map_json(resp, "get_diff").await
    }

    pub async fn apply_diff(
        &self,
        path: &str,
        diff: &str,
        expected_hash: &str,
    ) -> Result<ApplyDiffResponse> {
        let url = format!("{}/sync/apply_diff", self.base);
        let body = ApplyDiffRequest {
            path,
            diff,
            expected_hash,
        };
        let resp = self
            .send(self.authed(self.http.post(url)).json(&body))
            .await?;
        map_apply_diff(resp).await
    }

    pub async fn create(&self, path: &str, file_path: &Path) -> Result<()> {
        let url = format!("{}/sync/create", self.base);
        let form = reqwest::multipart::Form::new()
            .text("path", path.to_string())
            .file("file", file_path)
            .await?;
        let resp = self
            .send(self.authed(self.http.post(url)).multipart(form))
            .await?;
        map_status(resp, "create").await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = format!("{}/sync/delete", self.base);
        let body = PathParam { path };
        let resp = self
            .send(self.authed(self.http.post(url)).json(&body))
            .await?;
        map_status(resp, "delete").await
    }

    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}/sync/download", self.base);
        let body = PathParam { path };
        let resp = self
            .send(self.authed(self.http.post(url)).json(&body))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("download failed: {status} {text}");
        }
        let bytes = resp.bytes().await?;
        Ok(bytes.to_vec())
    }

    /// Newline-delimited JSON (one `DownloadBulkRecord` per line). Each record
    /// is written to the local tree as it arrives.
    pub async fn download_bulk(
        &self,
        paths: &[String],
        mut on_record: impl FnMut(DownloadBulkRecord) -> Result<()>,
    ) -> Result<()> {
        let url = format!("{}/sync/download_bulk", self.base);
        let body = BulkPaths { paths };
        let resp = self
            .send(self.authed(self.http.post(url)).json(&body))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("download_bulk failed: {status} {text}");
        }
        let text = resp.text().await?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: DownloadBulkRecord =
                serde_json::from_str(line).context("parse download_bulk record")?;
            on_record(record)?;
        }
        Ok(())
    }
}

async fn map_json<T: for<'de> Deserialize<'de>>(resp: Response, op: &str) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        let val = resp.json::<T>().await?;
        return Ok(val);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(map_error_status(status, op, text))
}

async fn map_status(resp: Response, op: &str) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let text = resp.text().await.unwrap_or_default();
    Err(map_error_status(status, op, text))
}

async fn map_apply_diff(resp: Response) -> Result<ApplyDiffResponse> {
    let status = resp.status();
    if status.is_success() {
        let val = resp.json::<ApplyDiffResponse>().await?;
        return Ok(val);
    }
    let text = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::BAD_REQUEST => anyhow::bail!("apply_diff hash mismatch: {text}"),
        StatusCode::FORBIDDEN => anyhow::bail!("apply_diff forbidden: {text}"),
        StatusCode::PAYLOAD_TOO_LARGE => anyhow::bail!("apply_diff oversize: {text}"),
        _ => anyhow::bail!("apply_diff failed: {status} {text}"),
    }
}

fn map_error_status(status: StatusCode, op: &str, text: String) -> anyhow::Error {
    match status {
        StatusCode::UNAUTHORIZED => anyhow::anyhow!("{op} unauthorized: {text}"),
        StatusCode::FORBIDDEN => anyhow::anyhow!("{op} forbidden: {text}"),
        StatusCode::NOT_FOUND => anyhow::anyhow!("{op} not found: {text}"),
        StatusCode::PAYLOAD_TOO_LARGE => anyhow::anyhow!("{op} oversize: {text}"),
        _ => anyhow::anyhow!("{op} failed: {status} {text}"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub hash: String,
    #[serde(default)]
    pub signature: Option<String>,
    pub file_size: i64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct WhoAmI {
    pub email: String,
}

#[derive(Debug, Serialize)]
struct PathParam<'a> {
    path: &'a str,
}

#[derive(Debug, Serialize)]
struct BulkPaths<'a> {
    paths: &'a [String],
}

#[derive(Debug, Serialize)]
struct GetDiffRequest<'a> {
    path: &'a str,
    signature: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct DiffResponse {
    pub diff: String,
    pub hash: String,
}

#[derive(Debug, Serialize)]
struct ApplyDiffRequest<'a> {
    path: &'a str,
    diff: &'a str,
    expected_hash: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ApplyDiffResponse {
    pub current_hash: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadBulkRecord {
    pub path: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(d: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
