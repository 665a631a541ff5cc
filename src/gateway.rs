//! The HTTP façade for non-participant callers (§4.8). Forwards `POST /rpc`
//! onto the substrate via [`crate::rpc::send`], persists a future row in a
//! process-local SQLite DB for status polling, and serves published
//! handler schemas. Bind-with-retry and bearer-auth middleware are carried
//! over from the reference client's control plane.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::future::{Future as SyftFuture, Resolved};
use crate::message::Method;
use crate::shutdown::Shutdown;
use crate::url::SyftUrl;

const MAX_BIND_RETRIES: u32 = 5;
const RETRY_DELAY_MS: u64 = 200;

pub struct Gateway;

pub struct GatewayStartResult {
    pub bound_addr: SocketAddr,
}

struct GatewayState {
    token: Option<String>,
    datasites_root: PathBuf,
    sender_email: String,
    futures_db: Mutex<Connection>,
}

impl Gateway {
    pub async fn start(
        addr: &str,
        token: Option<String>,
        datasites_root: PathBuf,
        sender_email: String,
        futures_db_path: &std::path::Path,
        shutdown: Option<Shutdown>,
    ) -> anyhow::Result<GatewayStartResult> {
        let futures_db = crate::futures_db::open(futures_db_path)?;
        let state = Arc::new(GatewayState {
            token,
            datasites_root,
            sender_email,
            futures_db: Mutex::new(futures_db),
        });

        let requested_addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid gateway address '{addr}': {e}"))?;

        let mut last_error = None;
        for attempt in 1..=MAX_BIND_RETRIES {
            match tokio::net::TcpListener::bind(requested_addr).await {
                Ok(listener) => {
                    let bound = listener.local_addr()?;
                    crate::logging::info_kv(
                        "gateway bound",
                        &[("addr", &bound.to_string()), ("attempt", &attempt.to_string())],
                    );
                    return Self::finish_start(listener, bound, state, shutdown).await;
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_BIND_RETRIES {
                        tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS)).await;
                    }
                }
            }
        }
        let e = last_error.unwrap();
        let fallback_addr: SocketAddr = format!("{}:0", requested_addr.ip()).parse()?;
        match tokio::net::TcpListener::bind(fallback_addr).await {
            Ok(listener) => {
                let bound = listener.local_addr()?;
                crate::logging::info_kv(
                    "gateway bound to fallback port",
                    &[("original_request", &requested_addr.to_string()), ("actual_addr", &bound.to_string())],
                );
                Self::finish_start(listener, bound, state, shutdown).await
            }
            Err(fallback_err) => Err(anyhow::anyhow!(
                "failed to bind gateway: requested {requested_addr} failed ({e}), fallback also failed ({fallback_err})"
            )),
        }
    }

    async fn finish_start(
        listener: tokio::net::TcpListener,
        bound_addr: SocketAddr,
        state: Arc<GatewayState>,
        shutdown: Option<Shutdown>,
    ) -> anyhow::Result<GatewayStartResult> {
        let router = Router::new()
            .route("/rpc", post(post_rpc))
            .route("/rpc/status/:id", get(get_rpc_status))
            .route("/rpc/schema/:app_name", get(get_rpc_schema))
            .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware))
            .with_state(state.clone());

        tokio::spawn(async move {
            let serve = axum::serve(listener, router.into_make_service());
            if let Some(shutdown) = shutdown {
                let graceful = serve.with_graceful_shutdown(async move { shutdown.wait().await });
                if let Err(e) = graceful.await {
                    crate::logging::error(format!("gateway server error: {e}"));
                }
            } else if let Err(e) = serve.await {
                crate::logging::error(format!("gateway server error: {e}"));
            }
        });

        Ok(GatewayStartResult { bound_addr })
    }
}

async fn auth_middleware(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let Some(token) = &state.token else {
        return next.run(req).await;
    };
    let expected = format!("Bearer {token}");
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if value.to_str().map(|v| v == expected).unwrap_or(false) {
            return next.run(req).await;
        }
    }
    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

#[derive(Deserialize)]
struct RpcRequestBody {
    app_name: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default = "default_expiry")]
    expiry: String,
    #[serde(default)]
    cache: bool,
    #[serde(default)]
    blocking: bool,
    #[serde(default)]
    method: Option<String>,
}

fn default_expiry() -> String {
    crate::rpc::DEFAULT_EXPIRY.to_string()
}

// Variant names spell out the wire value in full (`RPC_PENDING`, not just
// `PENDING`) to match the status strings callers expect on the wire.
#[allow(clippy::enum_variant_names)]
#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RpcStatus {
    RpcPending,
    RpcCompleted,
    RpcError,
    RpcNotFound,
}

#[derive(Serialize)]
struct RpcResponseBody {
    id: String,
    status: RpcStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

async fn post_rpc(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<RpcRequestBody>,
) -> impl IntoResponse {
    let url = match SyftUrl::parse(&req.url) {
        Ok(u) => u,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid url: {e}")).into_response(),
    };
    let method = match req.method.as_deref().unwrap_or("POST").to_ascii_uppercase().as_str() {
        "GET" => Method::Get,
        "HEAD" => Method::Head,
        "PUT" => Method::Put,
        "PATCH" => Method::Patch,
        "DELETE" => Method::Delete,
        _ => Method::Post,
    };
    let body = req
        .body
        .as_deref()
        .map(|b| b.as_bytes().to_vec());

    let future = match crate::rpc::send(
        &state.datasites_root,
        &state.sender_email,
        url,
        body,
        req.headers.clone(),
        method,
        &req.expiry,
        req.cache,
    ) {
        Ok(f) => f,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, format!("send failed: {e:#}")).into_response(),
    };

    {
        let conn = state.futures_db.lock().await;
        let row = crate::futures_db::FutureRow {
            id: future.id.clone(),
            path: future.local_path.to_string_lossy().to_string(),
            expires: future.expires,
            namespace: req.app_name.clone(),
        };
        if let Err(e) = crate::futures_db::save_future(&conn, &row) {
            crate::logging::error(format!("save_future failed: {e:#}"));
        }
    }

    if req.blocking {
        match future
            .wait(std::time::Duration::from_secs(30), std::time::Duration::from_millis(100))
            .await
        {
            Ok(resolved) => return resolved_to_response(future.id.clone(), resolved).into_response(),
            Err(_) => {
                return Json(RpcResponseBody {
                    id: future.id,
                    status: RpcStatus::RpcPending,
                    status_code: None,
                    body: None,
                })
                .into_response()
            }
        }
    }

    Json(RpcResponseBody {
        id: future.id,
        status: RpcStatus::RpcPending,
        status_code: None,
        body: None,
    })
    .into_response()
}

fn resolved_to_response(id: String, resolved: Resolved) -> Json<RpcResponseBody> {
    match resolved {
        Resolved::Completed(resp) => Json(RpcResponseBody {
            id,
            status: if resp.is_success() { RpcStatus::RpcCompleted } else { RpcStatus::RpcError },
            status_code: Some(resp.status_code),
            body: resp.body.map(|b| base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b)),
        }),
        Resolved::Rejected(resp) | Resolved::Expired(resp) | Resolved::Deleted(resp) => Json(RpcResponseBody {
            id,
            status: RpcStatus::RpcError,
            status_code: Some(resp.status_code),
            body: resp.body.map(|b| base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b)),
        }),
        Resolved::Pending => Json(RpcResponseBody {
            id,
            status: RpcStatus::RpcPending,
            status_code: None,
            body: None,
        }),
    }
}

async fn get_rpc_status(
    State(state): State<Arc<GatewayState>>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    let row = {
        let conn = state.futures_db.lock().await;
        match crate::futures_db::get_future(&conn, &id) {
            Ok(r) => r,
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
        }
    };
    let Some(row) = row else {
        return Json(RpcResponseBody {
            id,
            status: RpcStatus::RpcNotFound,
            status_code: None,
            body: None,
        })
        .into_response();
    };

    let local_path = PathBuf::from(&row.path);
    let request_path_glob = std::fs::read_dir(&local_path)
        .ok()
        .and_then(|mut it| it.find_map(|e| e.ok()))
        .map(|e| e.path());
    let request = request_path_glob
        .as_deref()
        .and_then(|p| if p.extension().map(|e| e == "request").unwrap_or(false) {
            crate::message::Request::load(p).ok()
        } else {
            None
        });

    let Some(request) = request.or_else(|| {
        // fall back: reconstruct a minimal probe by scanning for the id's request file directly
        let candidate = local_path.join(format!("{id}.request"));
        crate::message::Request::load(&candidate).ok()
    }) else {
        return Json(RpcResponseBody { id, status: RpcStatus::RpcNotFound, status_code: None, body: None }).into_response();
    };

    let future = SyftFuture::new(id.clone(), request.url.clone(), local_path, request);
    let resolved = match future.resolve() {
        Ok(r) => r,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    };

    if future.state().is_ok_and(|s| SyftFuture::is_terminal(&s)) {
        let conn = state.futures_db.lock().await;
        let _ = crate::futures_db::delete_future(&conn, &id);
    }

    resolved_to_response(id, resolved).into_response()
}

async fn get_rpc_schema(
    State(state): State<Arc<GatewayState>>,
    AxumPath(app_name): AxumPath<String>,
) -> impl IntoResponse {
    let schema_path = state
        .datasites_root
        .join(&state.sender_email)
        .join("api_data")
        .join(&app_name)
        .join("rpc")
        .join("rpc.schema.json");
    match std::fs::read_to_string(&schema_path) {
        Ok(content) => (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "application/json")], content).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "schema not published").into_response(),
    }
}
