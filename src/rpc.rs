use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::future::{BulkFuture, Future};
use crate::message::{Method, Request, Response};
use crate::url::SyftUrl;

pub const DEFAULT_EXPIRY: &str = "24h";

/// Accepts `Nd|Nh|Nm|Ns` (days/hours/minutes/seconds) or a bare integer
/// number of seconds.
pub fn parse_duration(s: &str) -> Result<chrono::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("empty duration string"));
    }
    let (num_part, unit) = s.split_at(s.len() - 1);
    let (amount, unit): (i64, char) = match unit.chars().next().unwrap() {
        'd' | 'h' | 'm' | 's' if num_part.chars().all(|c| c.is_ascii_digit()) && !num_part.is_empty() => {
            (num_part.parse().context("parse duration amount")?, unit.chars().next().unwrap())
        }
        _ => {
            let amount: i64 = s.parse().with_context(|| format!("invalid duration string: {s}"))?;
            (amount, 's')
        }
    };
    let duration = match unit {
        'd' => chrono::Duration::days(amount),
        'h' => chrono::Duration::hours(amount),
        'm' => chrono::Duration::minutes(amount),
        's' => chrono::Duration::seconds(amount),
        _ => unreachable!(),
    };
    Ok(duration)
}

/// Write a `<id>.request` file under the callee's URL-mapped directory and
/// return a `Future` tracking it.
pub fn send(
    datasites_root: &Path,
    sender: &str,
    url: SyftUrl,
    body: Option<Vec<u8>>,
    headers: BTreeMap<String, String>,
    method: Method,
    expiry: &str,
    cache: bool,
) -> Result<Future> {
    let expires: DateTime<Utc> = Utc::now() + parse_duration(expiry)?;
    let local_path = url.to_local_path(datasites_root);
    std::fs::create_dir_all(&local_path)
        .with_context(|| format!("create {}", local_path.display()))?;

    let mut request = Request::new(sender.to_string(), url.clone(), method, headers, body, expires);

    if cache {
        let id = request.message_hash();
        request.id = id.clone();
        let request_path = local_path.join(format!("{id}.request"));
        if request_path.exists() {
            let existing = Request::load(&request_path)?;
            if !existing.is_expired() {
                return Ok(Future::new(id, url, local_path, existing));
            }
            std::fs::remove_file(&request_path)
                .with_context(|| format!("remove expired {}", request_path.display()))?;
        }
        request.dump(&request_path)?;
        return Ok(Future::new(id, url, local_path, request));
    }

    let id = Ulid::new().to_string();
    request.id = id.clone();
    let request_path = local_path.join(format!("{id}.request"));
    request.dump(&request_path)?;
    Ok(Future::new(id, url, local_path, request))
}

/// `send` against every URL; per-URL failures are isolated rather than
/// aborting the whole broadcast.
pub fn broadcast(
    datasites_root: &Path,
    sender: &str,
    urls: Vec<SyftUrl>,
    body: Option<Vec<u8>>,
    headers: BTreeMap<String, String>,
    method: Method,
    expiry: &str,
    cache: bool,
) -> BulkFuture {
    let mut futures = Vec::new();
    for url in urls {
        match send(
            datasites_root,
            sender,
            url.clone(),
            body.clone(),
            headers.clone(),
            method,
            expiry,
            cache,
        ) {
            Ok(f) => futures.push(f),
            Err(e) => crate::logging::error(format!("broadcast send to {url} failed: {e:#}")),
        }
    }
    BulkFuture { futures }
}

/// Write `<id>.response` alongside the request, addressed to the same id/url/expiry.
pub fn reply_to(
    request: &Request,
    local_path: &Path,
    sender: &str,
    body: Option<Vec<u8>>,
    headers: BTreeMap<String, String>,
    status_code: u16,
) -> Result<Response> {
    let response = Response::reply_to(request, sender.to_string(), body, headers, status_code);
    let response_path = local_path.join(format!("{}.response", response.id));
    response.dump(&response_path)?;
    Ok(response)
}

/// Write an error response derived only from the request file's path stem,
/// used when the request itself failed to parse.
pub fn write_response(
    request_path: &Path,
    sender: &str,
    body: Option<Vec<u8>>,
    status_code: u16,
) -> Result<()> {
    let id = request_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("request path has no stem: {}", request_path.display()))?;
    let response_path = request_path.with_file_name(format!("{id}.response"));
    let response = Response {
        id: id.to_string(),
        timestamp: Utc::now(),
        expires: Utc::now() + chrono::Duration::hours(24),
        sender: sender.to_string(),
        url: SyftUrl::parse(&format!("syft://{sender}/"))?,
        headers: Default::default(),
        body,
        status_code,
    };
    response.dump(&response_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp(name: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!("syftbox-rs-rpc-test-{name}"));
        let _ = std::fs::remove_dir_all(&p);
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn parses_all_duration_units() {
        assert_eq!(parse_duration("5m").unwrap(), chrono::Duration::minutes(5));
        assert_eq!(parse_duration("2h").unwrap(), chrono::Duration::hours(2));
        assert_eq!(parse_duration("1d").unwrap(), chrono::Duration::days(1));
        assert_eq!(parse_duration("30s").unwrap(), chrono::Duration::seconds(30));
        assert_eq!(parse_duration("30").unwrap(), chrono::Duration::seconds(30));
        assert!(parse_duration("xyz").is_err());
    }

    #[test]
    fn send_writes_request_file() {
        let root = tmp("send");
        let url = SyftUrl::parse("syft://alice@example.com/api_data/app/rpc/ping").unwrap();
        let f = send(
            &root,
            "bob@example.com",
            url,
            Some(b"hello".to_vec()),
            BTreeMap::new(),
            Method::Post,
            "5m",
            false,
        )
        .unwrap();
        assert!(f.request_path().exists());
    }

    #[test]
    fn cached_send_reuses_id_and_does_not_rewrite() {
        let root = tmp("cache");
        let url = SyftUrl::parse("syft://alice@example.com/api_data/app/rpc/ping").unwrap();
        let f1 = send(
            &root,
            "bob@example.com",
            url.clone(),
            Some(b"X".to_vec()),
            BTreeMap::new(),
            Method::Post,
            "5m",
            true,
        )
        .unwrap();
        let written = std::fs::metadata(f1.request_path()).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let f2 = send(
            &root,
            "bob@example.com",
            url,
            Some(b"X".to_vec()),
            BTreeMap::new(),
            Method::Post,
            "5m",
            true,
        )
        .unwrap();
        assert_eq!(f1.id, f2.id);
        let unchanged = std::fs::metadata(f2.request_path()).unwrap().modified().unwrap();
        assert_eq!(written, unchanged);

        let entries: Vec<_> = std::fs::read_dir(&f1.local_path).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn reply_to_writes_response_with_matching_id() {
        let root = tmp("reply");
        let url = SyftUrl::parse("syft://alice@example.com/api_data/app/rpc/ping").unwrap();
        let f = send(
            &root,
            "bob@example.com",
            url,
            None,
            BTreeMap::new(),
            Method::Get,
            "5m",
            false,
        )
        .unwrap();
        let resp = reply_to(
            &f.request,
            &f.local_path,
            "alice@example.com",
            Some(b"pong".to_vec()),
            BTreeMap::new(),
            200,
        )
        .unwrap();
        assert_eq!(resp.id, f.id);
        assert!(f.response_path().exists());
    }
}
