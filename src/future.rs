use std::path::PathBuf;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use chrono::Utc;

use crate::message::{Request, Response};
use crate::url::SyftUrl;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FutureState {
    Rejected,
    Completed,
    Deleted,
    ExpiredRequest,
    Pending,
}

#[derive(Debug, Clone)]
pub enum Resolved {
    Completed(Response),
    Rejected(Response),
    Expired(Response),
    Deleted(Response),
    Pending,
}

#[derive(Debug)]
pub struct FutureTimeoutError;

impl std::fmt::Display for FutureTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "future wait timed out")
    }
}

impl std::error::Error for FutureTimeoutError {}

/// A value representing a request that has been written but whose response
/// is not yet known. Resolution is driven entirely by polling the
/// filesystem; no live promise crosses process boundaries.
#[derive(Debug, Clone)]
pub struct Future {
    pub id: String,
    pub url: SyftUrl,
    pub local_path: PathBuf,
    pub expires: chrono::DateTime<Utc>,
    pub request: Request,
}

impl PartialEq for Future {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Future {}
impl std::hash::Hash for Future {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Future {
    pub fn new(id: String, url: SyftUrl, local_path: PathBuf, request: Request) -> Self {
        Self {
            expires: request.expires,
            id,
            url,
            local_path,
            request,
        }
    }

    pub fn request_path(&self) -> PathBuf {
        self.local_path.join(format!("{}.request", self.id))
    }

    pub fn response_path(&self) -> PathBuf {
        self.local_path.join(format!("{}.response", self.id))
    }

    pub fn rejected_path(&self) -> PathBuf {
        self.local_path.join(format!("{}.syftrejected.request", self.id))
    }

    /// Checked in precedence order: rejected > completed > expired(request) > deleted > pending.
    pub fn state(&self) -> Result<FutureState> {
        if self.rejected_path().exists() {
            return Ok(FutureState::Rejected);
        }
        if self.response_path().exists() {
            return Ok(FutureState::Completed);
        }
        let request_exists = self.request_path().exists();
        if request_exists && Utc::now() > self.request.expires {
            return Ok(FutureState::ExpiredRequest);
        }
        if !request_exists {
            return Ok(FutureState::Deleted);
        }
        Ok(FutureState::Pending)
    }

    pub fn resolve(&self) -> Result<Resolved> {
        match self.state()? {
            FutureState::Rejected => Ok(Resolved::Rejected(system_response(
                &self.request,
                403,
                b"rejected by permission engine".to_vec(),
            ))),
            FutureState::Completed => {
                let mut resp = Response::load(&self.response_path())?;
                if resp.is_expired() {
                    resp.status_code = 419;
                }
                Ok(Resolved::Completed(resp))
            }
            FutureState::Deleted => Ok(Resolved::Deleted(system_response(
                &self.request,
                404,
                b"request deleted".to_vec(),
            ))),
            FutureState::ExpiredRequest => Ok(Resolved::Expired(system_response(
                &self.request,
                419,
                b"request expired".to_vec(),
            ))),
            FutureState::Pending => Ok(Resolved::Pending),
        }
    }

    pub fn is_terminal(state: &FutureState) -> bool {
        !matches!(state, FutureState::Pending)
    }

    pub async fn wait(&self, timeout: StdDuration, poll_interval: StdDuration) -> Result<Resolved> {
        if timeout.is_zero() {
            return Err(anyhow!("wait timeout must be positive"));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let resolved = self.resolve()?;
            if !matches!(resolved, Resolved::Pending) {
                return Ok(resolved);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FutureTimeoutError.into());
            }
            tokio::time::sleep(poll_interval.min(deadline - tokio::time::Instant::now())).await;
        }
    }
}

fn system_response(request: &Request, status_code: u16, body: Vec<u8>) -> Response {
    Response {
        id: request.id.clone(),
        timestamp: Utc::now(),
        expires: request.expires,
        sender: request.sender.clone(),
        url: request.url.clone(),
        headers: Default::default(),
        body: Some(body),
        status_code,
    }
}

/// Several futures dispatched from a single `broadcast` call.
pub struct BulkFuture {
    pub futures: Vec<Future>,
}

impl BulkFuture {
    /// Resolve every future concurrently, returning whatever is terminal by
    /// the deadline. Unresolved futures are dropped silently, matching the
    /// polling contract (no partial-result error).
    pub async fn gather_completed(&self, timeout: StdDuration) -> Vec<(String, Resolved)> {
        let deadline = tokio::time::Instant::now() + timeout;
        let tasks: Vec<_> = self
            .futures
            .iter()
            .map(|f| {
                let f = f.clone();
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                async move {
                    if remaining.is_zero() {
                        return (f.id.clone(), f.resolve().ok());
                    }
                    match f.wait(remaining, StdDuration::from_millis(50)).await {
                        Ok(r) => (f.id.clone(), Some(r)),
                        Err(_) => (f.id.clone(), None),
                    }
                }
            })
            .collect();
        futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .filter_map(|(id, r)| r.map(|r| (id, r)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration as StdDuration;

    fn make_future(dir: &Path, expires_in: chrono::Duration) -> Future {
        let url = SyftUrl::parse("syft://alice@example.com/api_data/app/rpc/ping").unwrap();
        let req = Request::new(
            "bob@example.com".into(),
            url.clone(),
            crate::message::Method::Post,
            BTreeMap::new(),
            Some(b"hi".to_vec()),
            Utc::now() + expires_in,
        );
        let id = req.id.clone();
        req.dump(&dir.join(format!("{id}.request"))).unwrap();
        Future::new(id, url, dir.to_path_buf(), req)
    }

    fn tmp(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("syftbox-rs-future-test-{name}"));
        let _ = std::fs::remove_dir_all(&p);
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn pending_when_only_request_exists() {
        let dir = tmp("pending");
        let f = make_future(&dir, chrono::Duration::minutes(5));
        assert_eq!(f.state().unwrap(), FutureState::Pending);
    }

    #[test]
    fn completed_when_response_written() {
        let dir = tmp("completed");
        let f = make_future(&dir, chrono::Duration::minutes(5));
        let resp = Response::reply_to(&f.request, "alice@example.com".into(), Some(b"pong".to_vec()), BTreeMap::new(), 200);
        resp.dump(&f.response_path()).unwrap();
        assert_eq!(f.state().unwrap(), FutureState::Completed);
        match f.resolve().unwrap() {
            Resolved::Completed(r) => assert_eq!(r.status_code, 200),
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[test]
    fn rejected_takes_precedence_over_completed() {
        let dir = tmp("rejected-precedence");
        let f = make_future(&dir, chrono::Duration::minutes(5));
        let resp = Response::reply_to(&f.request, "alice@example.com".into(), None, BTreeMap::new(), 200);
        resp.dump(&f.response_path()).unwrap();
        std::fs::write(f.rejected_path(), "").unwrap();
        assert_eq!(f.state().unwrap(), FutureState::Rejected);
    }

    #[test]
    fn expired_request_detected() {
        let dir = tmp("expired");
        let f = make_future(&dir, chrono::Duration::seconds(-1));
        assert_eq!(f.state().unwrap(), FutureState::ExpiredRequest);
    }

    #[test]
    fn deleted_when_neither_file_present() {
        let dir = tmp("deleted");
        let f = make_future(&dir, chrono::Duration::minutes(5));
        std::fs::remove_file(f.request_path()).unwrap();
        assert_eq!(f.state().unwrap(), FutureState::Deleted);
    }

    #[tokio::test]
    async fn wait_times_out_when_pending() {
        let dir = tmp("wait-timeout");
        let f = make_future(&dir, chrono::Duration::minutes(5));
        let res = f.wait(StdDuration::from_millis(100), StdDuration::from_millis(10)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn wait_resolves_once_response_appears() {
        let dir = tmp("wait-resolve");
        let f = make_future(&dir, chrono::Duration::minutes(5));
        let resp_path = f.response_path();
        let req = f.request.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(30)).await;
            let resp = Response::reply_to(&req, "alice@example.com".into(), None, BTreeMap::new(), 200);
            resp.dump(&resp_path).unwrap();
        });
        let res = f.wait(StdDuration::from_secs(2), StdDuration::from_millis(10)).await.unwrap();
        assert!(matches!(res, Resolved::Completed(_)));
    }
}
