//! Handler argument binding, return-value coercion, and schema description
//! for the event dispatcher (C6). Kept separate from `events.rs` (the
//! filesystem-watching lifecycle) so the pure dispatch pipeline can be
//! tested without touching a real watcher.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::message::Request;
use crate::url::SyftUrl;

/// A populated view of an inbound request, handed to handlers declared with
/// a `RequestCtx` argument kind.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: String,
    pub sender: String,
    pub url: SyftUrl,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl From<&Request> for RequestContext {
    fn from(r: &Request) -> Self {
        Self {
            id: r.id.clone(),
            sender: r.sender.clone(),
            url: r.url.clone(),
            headers: r.headers.clone(),
            body: r.body.clone(),
        }
    }
}

/// Chosen at registration time (never guessed at runtime from annotations):
/// which shape of argument a handler wants to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    RequestCtx,
    Json,
    RawBody,
    Text,
}

/// The bound argument actually passed to a handler invocation.
pub enum HandlerArg {
    RequestCtx(RequestContext),
    Json(serde_json::Value),
    RawBody(Vec<u8>),
    Text(String),
}

pub fn bind_argument(kind: ArgKind, request: &Request) -> Result<HandlerArg> {
    Ok(match kind {
        ArgKind::RequestCtx => HandlerArg::RequestCtx(RequestContext::from(request)),
        ArgKind::Json => {
            let body = request.body.as_deref().unwrap_or(b"null");
            let value: serde_json::Value =
                serde_json::from_slice(body).map_err(|e| anyhow!("body is not valid json: {e}"))?;
            HandlerArg::Json(value)
        }
        ArgKind::RawBody => HandlerArg::RawBody(request.body.clone().unwrap_or_default()),
        ArgKind::Text => {
            let body = request.body.clone().unwrap_or_default();
            let text = String::from_utf8(body).map_err(|e| anyhow!("body is not valid utf-8: {e}"))?;
            HandlerArg::Text(text)
        }
    })
}

/// What a handler returns; coerced into a response body + content-type.
pub enum HandlerResult {
    None,
    Json(serde_json::Value),
    Bytes(Vec<u8>),
    Text(String),
}

pub fn coerce_result(result: HandlerResult) -> (Vec<u8>, &'static str) {
    match result {
        HandlerResult::None => (Vec::new(), "text/plain"),
        HandlerResult::Json(v) => (
            serde_json::to_vec(&v).unwrap_or_default(),
            "application/json",
        ),
        HandlerResult::Bytes(b) => (b, "application/octet-stream"),
        HandlerResult::Text(t) => (t.into_bytes(), "text/plain"),
    }
}

pub type Handler = Box<dyn Fn(HandlerArg) -> Result<HandlerResult> + Send + Sync>;

/// Run the full per-request pipeline: load, expiry check, bind, invoke,
/// coerce, reply. Errors while loading/binding/invoking are converted into
/// a 500 system response rather than propagated.
pub fn dispatch_request(
    request_path: &std::path::Path,
    local_path: &std::path::Path,
    sender_email: &str,
    arg_kind: ArgKind,
    handler: &Handler,
) -> Result<()> {
    let request = match Request::load(request_path) {
        Ok(r) => r,
        Err(e) => {
            crate::rpc::write_response(
                request_path,
                sender_email,
                Some(format!("malformed request: {e:#}").into_bytes()),
                500,
            )?;
            return Ok(());
        }
    };

    if request.is_expired() {
        return Ok(());
    }

    let outcome = bind_argument(arg_kind, &request).and_then(handler);

    match outcome {
        Ok(result) => {
            let (body, content_type) = coerce_result(result);
            let mut headers = BTreeMap::new();
            headers.insert("Content-Type".to_string(), content_type.to_string());
            crate::rpc::reply_to(&request, local_path, sender_email, Some(body), headers, 200)?;
        }
        Err(e) => {
            crate::rpc::reply_to(
                &request,
                local_path,
                sender_email,
                Some(format!("{e:#}").into_bytes()),
                BTreeMap::new(),
                500,
            )?;
        }
    }
    Ok(())
}

/// Minimal `{kind, name, fields}` schema tree sufficient for describing a
/// handler's expected input shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SchemaNode {
    Primitive { name: String },
    Object { fields: BTreeMap<String, SchemaNode> },
}

pub fn schema_for_arg_kind(kind: ArgKind) -> SchemaNode {
    match kind {
        ArgKind::RequestCtx => SchemaNode::Primitive { name: "request".to_string() },
        ArgKind::Json => SchemaNode::Object { fields: BTreeMap::new() },
        ArgKind::RawBody => SchemaNode::Primitive { name: "bytes".to_string() },
        ArgKind::Text => SchemaNode::Primitive { name: "string".to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Response;
    use std::collections::BTreeMap as Map;

    fn tmp(name: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!("syftbox-rs-dispatch-test-{name}"));
        let _ = std::fs::remove_dir_all(&p);
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    fn write_request(dir: &std::path::Path, body: &[u8]) -> (String, std::path::PathBuf) {
        let url = SyftUrl::parse("syft://alice@example.com/api_data/app/rpc/ping").unwrap();
        let req = Request::new(
            "bob@example.com".into(),
            url,
            crate::message::Method::Post,
            Map::new(),
            Some(body.to_vec()),
            chrono::Utc::now() + chrono::Duration::minutes(5),
        );
        let path = dir.join(format!("{}.request", req.id));
        req.dump(&path).unwrap();
        (req.id, path)
    }

    #[test]
    fn dispatch_invokes_handler_and_writes_response() {
        let dir = tmp("ok");
        let (id, path) = write_request(&dir, b"hello");
        let handler: Handler = Box::new(|arg| match arg {
            HandlerArg::Text(t) => Ok(HandlerResult::Text(format!("echo: {t}"))),
            _ => panic!("expected text arg"),
        });
        dispatch_request(&path, &dir, "alice@example.com", ArgKind::Text, &handler).unwrap();
        let resp = Response::load(&dir.join(format!("{id}.response"))).unwrap();
        assert_eq!(resp.body.unwrap(), b"echo: hello");
        assert_eq!(resp.status_code, 200);
    }

    #[test]
    fn dispatch_coerces_handler_error_into_500() {
        let dir = tmp("err");
        let (id, path) = write_request(&dir, b"{}");
        let handler: Handler = Box::new(|_| Err(anyhow!("boom")));
        dispatch_request(&path, &dir, "alice@example.com", ArgKind::Json, &handler).unwrap();
        let resp = Response::load(&dir.join(format!("{id}.response"))).unwrap();
        assert_eq!(resp.status_code, 500);
    }

    #[test]
    fn dispatch_skips_expired_requests_silently() {
        let dir = tmp("expired");
        let url = SyftUrl::parse("syft://alice@example.com/api_data/app/rpc/ping").unwrap();
        let req = Request::new(
            "bob@example.com".into(),
            url,
            crate::message::Method::Post,
            Map::new(),
            None,
            chrono::Utc::now() - chrono::Duration::seconds(1),
        );
        let path = dir.join(format!("{}.request", req.id));
        req.dump(&path).unwrap();
        let handler: Handler = Box::new(|_| panic!("should not be invoked"));
        dispatch_request(&path, &dir, "alice@example.com", ArgKind::RawBody, &handler).unwrap();
        assert!(!dir.join(format!("{}.response", req.id)).exists());
    }

    #[test]
    fn json_arg_kind_parses_body() {
        let dir = tmp("json");
        let (_, path) = write_request(&dir, br#"{"msg":"hi"}"#);
        let handler: Handler = Box::new(|arg| match arg {
            HandlerArg::Json(v) => Ok(HandlerResult::Json(v)),
            _ => panic!("expected json"),
        });
        dispatch_request(&path, &dir, "alice@example.com", ArgKind::Json, &handler).unwrap();
    }
}
