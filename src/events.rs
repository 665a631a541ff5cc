//! The filesystem watcher and dispatch engine (C6). Binds handler
//! functions to RPC endpoints (`on_request`) and to glob-matched path
//! changes (`watch`), invoking them when matching files appear. Grounded
//! on the canonical event-dispatcher variant that performs pending-request
//! replay at `start()`, uses YAML-based permissions, supports
//! placeholder-substituted `watch(globs)`, and auto-coerces handler return
//! values.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use walkdir::WalkDir;

use crate::dispatch::{self, ArgKind, Handler, SchemaNode};
use crate::permissions::PERMISSION_FILE_NAME;

/// Default `message_timeout` for the janitor, matching the reference
/// dispatcher's default.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);
const JANITOR_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct Endpoint {
    arg_kind: ArgKind,
    handler: Handler,
}

struct GlobWatch {
    globs: GlobSet,
    handler: Handler,
    arg_kind: ArgKind,
}

/// Owns its own lifecycle: registered handlers, the filesystem watcher
/// thread, and a stop flag. Replaces the source's module-global dispatcher
/// dictionaries with an explicit, owned `Dispatcher`.
pub struct SyftEvents {
    app_name: String,
    sender_email: String,
    datasites_root: PathBuf,
    app_rpc_dir: PathBuf,
    message_timeout: Duration,
    endpoints: Arc<Mutex<HashMap<String, Endpoint>>>,
    watches: Arc<Mutex<Vec<GlobWatch>>>,
    stop_tx: Option<mpsc::Sender<()>>,
    join: Option<JoinHandle<()>>,
    janitor_stop_tx: Option<mpsc::Sender<()>>,
    janitor_join: Option<JoinHandle<()>>,
}

impl SyftEvents {
    pub fn new(datasites_root: PathBuf, sender_email: String, app_name: String) -> Self {
        let app_rpc_dir = datasites_root
            .join(&sender_email)
            .join("api_data")
            .join(&app_name)
            .join("rpc");
        Self {
            app_name,
            sender_email,
            datasites_root,
            app_rpc_dir,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
            watches: Arc::new(Mutex::new(Vec::new())),
            stop_tx: None,
            join: None,
            janitor_stop_tx: None,
            janitor_join: None,
        }
    }

    /// Overrides how long a request/response file may sit in an endpoint's
    /// listen directory before the janitor sweeps it up.
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    /// Binds a handler to `<api_data>/<app>/rpc/<endpoint>/`. Wildcards in
    /// `endpoint` are rejected.
    pub fn on_request(&self, endpoint: &str, arg_kind: ArgKind, handler: Handler) -> Result<()> {
        if endpoint.contains('*') || endpoint.contains('?') {
            anyhow::bail!("on_request endpoint must not contain wildcards: {endpoint}");
        }
        self.endpoints
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), Endpoint { arg_kind, handler });
        Ok(())
    }

    /// Binds a handler to arbitrary glob-matched file events under the
    /// datasites root. Globs referencing `{email}`/`{datasite}`/`{api_data}`
    /// are substituted; a glob not starting with `**/` gets one prepended.
    pub fn watch(&self, globs: &[&str], arg_kind: ArgKind, handler: Handler) -> Result<()> {
        let mut builder = GlobSetBuilder::new();
        for g in globs {
            let expanded = self.expand_placeholders(g);
            let expanded = if expanded.starts_with("**/") {
                expanded
            } else {
                format!("**/{expanded}")
            };
            builder.add(Glob::new(&expanded).with_context(|| format!("invalid glob: {expanded}"))?);
        }
        let globset = builder.build().context("build glob watch set")?;
        self.watches.lock().unwrap().push(GlobWatch {
            globs: globset,
            handler,
            arg_kind,
        });
        Ok(())
    }

    fn expand_placeholders(&self, glob: &str) -> String {
        glob.replace("{email}", &self.sender_email)
            .replace("{datasite}", &self.sender_email)
            .replace("{api_data}", "api_data")
    }

    /// Walks registered endpoints and writes `rpc.schema.json` describing
    /// each one's expected argument shape.
    pub fn publish_schema(&self) -> Result<()> {
        let endpoints = self.endpoints.lock().unwrap();
        let mut schema = serde_json::Map::new();
        for (name, endpoint) in endpoints.iter() {
            let node: SchemaNode = dispatch::schema_for_arg_kind(endpoint.arg_kind);
            schema.insert(name.clone(), serde_json::to_value(node)?);
        }
        std::fs::create_dir_all(&self.app_rpc_dir)
            .with_context(|| format!("create {}", self.app_rpc_dir.display()))?;
        let path = self.app_rpc_dir.join("rpc.schema.json");
        std::fs::write(&path, serde_json::to_string_pretty(&schema)?)
            .with_context(|| format!("write {}", path.display()))
    }

    /// For every pre-existing `<id>.request` without a sibling
    /// `<id>.response`, dispatch the handler immediately. Best-effort: a
    /// single failed dispatch is logged and does not stop the sweep.
    pub fn process_pending_requests(&self) -> Result<()> {
        if !self.app_rpc_dir.exists() {
            return Ok(());
        }
        let endpoints = self.endpoints.lock().unwrap();
        for entry in WalkDir::new(&self.app_rpc_dir).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("request") {
                continue;
            }
            let response_path = path.with_extension("response");
            if response_path.exists() {
                continue;
            }
            let Some(endpoint_name) = endpoint_name_for(&self.app_rpc_dir, path) else {
                continue;
            };
            let Some(endpoint) = endpoints.get(&endpoint_name) else {
                continue;
            };
            let local_path = path.parent().unwrap_or(&self.app_rpc_dir);
            if let Err(e) = dispatch::dispatch_request(
                path,
                local_path,
                &self.sender_email,
                endpoint.arg_kind,
                &endpoint.handler,
            ) {
                crate::logging::error(format!("pending request dispatch failed for {}: {e:#}", path.display()));
            }
        }
        Ok(())
    }

    /// Creates directories, replays pending requests (crash recovery), then
    /// starts the background filesystem watcher. Replay is single-threaded
    /// and completes before the watcher activates.
    pub fn start(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.app_rpc_dir)
            .with_context(|| format!("create {}", self.app_rpc_dir.display()))?;
        if let Err(e) = self.process_pending_requests() {
            crate::logging::error(format!("process_pending_requests failed: {e:#}"));
        }

        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res| {
                let _ = event_tx.send(res);
            })
            .context("create filesystem watcher")?;
        watcher
            .watch(&self.datasites_root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", self.datasites_root.display()))?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        self.stop_tx = Some(stop_tx);

        let endpoints = self.endpoints.clone();
        let watches = self.watches.clone();
        let app_rpc_dir = self.app_rpc_dir.clone();
        let datasites_root = self.datasites_root.clone();
        let sender_email = self.sender_email.clone();

        let join = std::thread::Builder::new()
            .name(format!("syft-events-{}", self.app_name))
            .spawn(move || {
                // Keep the watcher alive for the lifetime of the thread.
                let _watcher = watcher;
                loop {
                    if stop_rx.try_recv().is_ok() {
                        break;
                    }
                    match event_rx.recv_timeout(std::time::Duration::from_millis(500)) {
                        Ok(Ok(event)) => {
                            handle_event(
                                &event,
                                &endpoints,
                                &watches,
                                &app_rpc_dir,
                                &datasites_root,
                                &sender_email,
                            );
                        }
                        Ok(Err(e)) => crate::logging::error(format!("watcher error: {e}")),
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .context("spawn event dispatcher thread")?;
        self.join = Some(join);

        let (janitor_stop_tx, janitor_stop_rx) = mpsc::channel::<()>();
        self.janitor_stop_tx = Some(janitor_stop_tx);
        let listen_path = self.app_rpc_dir.clone();
        let message_timeout = self.message_timeout;
        let janitor_join = std::thread::Builder::new()
            .name(format!("syft-janitor-{}", self.app_name))
            .spawn(move || loop {
                if janitor_stop_rx.try_recv().is_ok() {
                    break;
                }
                sweep_expired_files(&listen_path, message_timeout);
                if janitor_stop_rx.recv_timeout(JANITOR_SWEEP_INTERVAL).is_ok() {
                    break;
                }
            })
            .context("spawn janitor thread")?;
        self.janitor_join = Some(janitor_join);
        Ok(())
    }

    pub fn run_forever(&mut self) -> Result<()> {
        self.start()?;
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        if let Some(tx) = self.janitor_stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.janitor_join.take() {
            let _ = join.join();
        }
    }
}

/// Deletes files under `listen_path` (recursively, across every endpoint's
/// request directory) whose age exceeds `message_timeout`, skipping
/// permission files. Best-effort: a failed delete for one file does not
/// stop the sweep.
fn sweep_expired_files(listen_path: &Path, message_timeout: Duration) {
    for entry in WalkDir::new(listen_path).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if path.file_name().and_then(|n| n.to_str()) == Some(PERMISSION_FILE_NAME) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let age = modified.elapsed().unwrap_or_default();
        if age > message_timeout {
            if let Err(e) = std::fs::remove_file(path) {
                crate::logging::error(format!("janitor failed to delete {}: {e}", path.display()));
            }
        }
    }
}

impl Drop for SyftEvents {
    fn drop(&mut self) {
        self.stop();
    }
}

fn endpoint_name_for(app_rpc_dir: &Path, request_path: &Path) -> Option<String> {
    let endpoint_dir = request_path.parent()?;
    let rel = endpoint_dir.strip_prefix(app_rpc_dir).ok()?;
    Some(rel.to_string_lossy().replace('\\', "/"))
}

fn handle_event(
    event: &Event,
    endpoints: &Arc<Mutex<HashMap<String, Endpoint>>>,
    watches: &Arc<Mutex<Vec<GlobWatch>>>,
    app_rpc_dir: &Path,
    datasites_root: &Path,
    sender_email: &str,
) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    for path in &event.paths {
        if path.extension().and_then(|e| e.to_str()) == Some("request") {
            if let Some(endpoint_name) = endpoint_name_for(app_rpc_dir, path) {
                let endpoints = endpoints.lock().unwrap();
                if let Some(endpoint) = endpoints.get(&endpoint_name) {
                    let local_path = path.parent().unwrap_or(app_rpc_dir);
                    if let Err(e) = dispatch::dispatch_request(
                        path,
                        local_path,
                        sender_email,
                        endpoint.arg_kind,
                        &endpoint.handler,
                    ) {
                        crate::logging::error(format!("dispatch failed for {}: {e:#}", path.display()));
                    }
                    continue;
                }
            }
        }

        let Ok(rel) = path.strip_prefix(datasites_root) else {
            continue;
        };
        let watches = watches.lock().unwrap();
        for w in watches.iter() {
            if w.globs.is_match(rel) {
                match dispatch::bind_argument(w.arg_kind, &dummy_request_for_watch(path)) {
                    Ok(arg) => {
                        if let Err(e) = (w.handler)(arg) {
                            crate::logging::error(format!("watch handler failed for {}: {e:#}", path.display()));
                        }
                    }
                    Err(e) => crate::logging::error(format!("watch arg bind failed for {}: {e:#}", path.display())),
                }
            }
        }
    }
}

/// Glob watches fire on arbitrary file events, not just `.request` files, so
/// there may be no well-formed `Request` backing the event; a minimal
/// placeholder carries only the path through `RequestCtx`/`RawBody`/`Text`
/// binding (JSON binding against an arbitrary file's bytes is the caller's
/// responsibility and may fail, same as any malformed body).
fn dummy_request_for_watch(path: &Path) -> crate::message::Request {
    let body = std::fs::read(path).ok();
    crate::message::Request {
        id: "watch".to_string(),
        timestamp: chrono::Utc::now(),
        expires: chrono::Utc::now() + chrono::Duration::hours(1),
        sender: String::new(),
        url: crate::url::SyftUrl::parse("syft://watch@example.com/").unwrap(),
        headers: Default::default(),
        body,
        method: crate::message::Method::Get,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn tmp(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("syftbox-rs-events-test-{name}"));
        let _ = std::fs::remove_dir_all(&p);
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn on_request_rejects_wildcard_endpoints() {
        let root = tmp("wildcard");
        let events = SyftEvents::new(root, "alice@example.com".into(), "app".into());
        let err = events
            .on_request("rpc/*", ArgKind::Text, Box::new(|_| Ok(dispatch::HandlerResult::None)))
            .unwrap_err();
        assert!(err.to_string().contains("wildcard"));
    }

    #[test]
    fn process_pending_requests_replays_crash_recovery() {
        let root = tmp("replay");
        let events = SyftEvents::new(root.clone(), "alice@example.com".into(), "app".into());
        let invoked = Arc::new(AtomicBool::new(false));
        let invoked2 = invoked.clone();
        events
            .on_request(
                "ping",
                ArgKind::Text,
                Box::new(move |_| {
                    invoked2.store(true, Ordering::SeqCst);
                    Ok(dispatch::HandlerResult::Text("pong".to_string()))
                }),
            )
            .unwrap();

        let endpoint_dir = events.app_rpc_dir.join("ping");
        std::fs::create_dir_all(&endpoint_dir).unwrap();
        let url = crate::url::SyftUrl::parse("syft://alice@example.com/api_data/app/rpc/ping").unwrap();
        let req = crate::message::Request::new(
            "bob@example.com".into(),
            url,
            crate::message::Method::Post,
            BTreeMap::new(),
            Some(b"hi".to_vec()),
            chrono::Utc::now() + chrono::Duration::minutes(5),
        );
        req.dump(&endpoint_dir.join(format!("{}.request", req.id))).unwrap();

        events.process_pending_requests().unwrap();
        assert!(invoked.load(Ordering::SeqCst));
        assert!(endpoint_dir.join(format!("{}.response", req.id)).exists());
    }

    #[test]
    fn publish_schema_writes_json_file() {
        let root = tmp("schema");
        let events = SyftEvents::new(root, "alice@example.com".into(), "app".into());
        events
            .on_request("ping", ArgKind::Text, Box::new(|_| Ok(dispatch::HandlerResult::None)))
            .unwrap();
        events.publish_schema().unwrap();
        let content = std::fs::read_to_string(events.app_rpc_dir.join("rpc.schema.json")).unwrap();
        assert!(content.contains("ping"));
    }

    #[test]
    fn janitor_sweep_deletes_stale_files_but_spares_permissions() {
        let root = tmp("janitor");
        let endpoint_dir = root.join("ping");
        std::fs::create_dir_all(&endpoint_dir).unwrap();

        let stale = endpoint_dir.join("stale.request");
        let fresh = endpoint_dir.join("fresh.request");
        let perm = endpoint_dir.join(PERMISSION_FILE_NAME);
        std::fs::write(&stale, b"old").unwrap();
        std::fs::write(&fresh, b"new").unwrap();
        std::fs::write(&perm, b"rules").unwrap();

        let old_time = std::time::SystemTime::now() - Duration::from_secs(120);
        let old_ft = filetime::FileTime::from_system_time(old_time);
        filetime::set_file_mtime(&stale, old_ft).unwrap();
        filetime::set_file_mtime(&perm, old_ft).unwrap();

        sweep_expired_files(&root, Duration::from_secs(60));

        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(perm.exists());
    }
}
