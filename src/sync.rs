use std::{
    collections::{HashMap, HashSet},
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rusqlite::params;
use walkdir::WalkDir;

use crate::filters::SyncFilters;
use crate::http::{ApiClient, FileMetadata as RemoteMetadata};

pub const MAX_FILE_SIZE_MB: i64 = 10;
const MAX_FILE_SIZE_BYTES: i64 = MAX_FILE_SIZE_MB * 1024 * 1024;

/// The workspace directory or local-state file was deleted out from under
/// the sync loop. Fatal: terminates the sync thread permanently.
#[derive(Debug)]
pub struct SyncEnvironmentError(pub String);

impl std::fmt::Display for SyncEnvironmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sync environment error: {}", self.0)
    }
}

impl std::error::Error for SyncEnvironmentError {}

#[derive(Debug, Clone)]
struct LocalFile {
    path: PathBuf,
    hash: String,
    size: i64,
    last_modified: i64,
}

/// Previous-synced metadata for one path, the `P` term in the `(L, P, R)`
/// decision matrix.
#[derive(Debug, Clone, Default)]
pub struct SyncedMetadata {
    pub hash: String,
    pub size: i64,
    pub last_modified: i64,
}

const SYNC_JOURNAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_journal (
    path TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    last_modified INTEGER NOT NULL
);
"#;

/// The previously-synced state of the tree, persisted in
/// `plugins/sync.journal.sqlite`. Owned exclusively by the sync worker.
pub(crate) struct SyncJournal {
    db_path: PathBuf,
    state: HashMap<String, SyncedMetadata>,
    dirty: HashSet<String>,
    deleted: HashSet<String>,
}

impl SyncJournal {
    pub(crate) fn load(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("plugins").join("sync.journal.sqlite");
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = open_journal_db(&db_path)?;

        let mut state = HashMap::new();
        let mut stmt = conn.prepare("SELECT path, hash, size, last_modified FROM sync_journal")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            state.insert(
                row.get::<_, String>(0)?,
                SyncedMetadata {
                    hash: row.get(1)?,
                    size: row.get(2)?,
                    last_modified: row.get(3)?,
                },
            );
        }

        Ok(SyncJournal {
            db_path,
            state,
            dirty: HashSet::new(),
            deleted: HashSet::new(),
        })
    }

    /// Re-read the journal from disk, detecting out-of-band deletion of the
    /// database file itself (a `SyncEnvironmentError` condition).
    fn refresh_from_disk(&mut self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.exists() {
                return Err(SyncEnvironmentError(format!(
                    "journal directory missing: {}",
                    parent.display()
                ))
                .into());
            }
        }
        let conn = open_journal_db(&self.db_path)?;
        let mut next = HashMap::new();
        let mut stmt = conn.prepare("SELECT path, hash, size, last_modified FROM sync_journal")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            next.insert(
                row.get::<_, String>(0)?,
                SyncedMetadata {
                    hash: row.get(1)?,
                    size: row.get(2)?,
                    last_modified: row.get(3)?,
                },
            );
        }
        self.state = next;
        self.dirty.clear();
        self.deleted.clear();
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        let mut conn = open_journal_db(&self.db_path)?;
        let tx = conn.transaction().context("begin sync journal tx")?;
        {
            let mut del = tx.prepare("DELETE FROM sync_journal WHERE path = ?1")?;
            for key in &self.deleted {
                del.execute(params![key])?;
            }
        }
        {
            let mut upsert = tx.prepare(
                "INSERT OR REPLACE INTO sync_journal (path, hash, size, last_modified) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for key in &self.dirty {
                if let Some(m) = self.state.get(key) {
                    upsert.execute(params![key, m.hash, m.size, m.last_modified])?;
                }
            }
        }
        tx.commit().context("commit sync journal tx")?;
        self.dirty.clear();
        self.deleted.clear();
        Ok(())
    }

    fn get(&self, key: &str) -> Option<&SyncedMetadata> {
        self.state.get(key)
    }

    fn set(&mut self, key: String, meta: SyncedMetadata) {
        self.state.insert(key.clone(), meta);
        self.deleted.remove(&key);
        self.dirty.insert(key);
    }

    fn delete(&mut self, key: &str) {
        self.state.remove(key);
        self.dirty.remove(key);
        self.deleted.insert(key.to_string());
    }
}

fn open_journal_db(path: &Path) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)
        .with_context(|| format!("open journal {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;
    conn.execute_batch(SYNC_JOURNAL_SCHEMA)
        .context("init sync journal schema")?;
    Ok(conn)
}

/// `(L, P, R)` → action, per the decision matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Noop,
    CreateRemote,
    DeleteLocal,
    DeleteRemote,
    ModifyLocal,
    ModifyRemote,
}

pub fn decide(
    local: Option<&SyncedMetadata>,
    previous: Option<&SyncedMetadata>,
    remote: Option<&SyncedMetadata>,
) -> SyncAction {
    match (local, previous, remote) {
        (Some(_), None, None) => SyncAction::CreateRemote,
        (None, Some(_), Some(_)) => SyncAction::DeleteLocal,
        (Some(l), Some(p), None) => {
            if l.hash == p.hash {
                SyncAction::DeleteRemote
            } else {
                SyncAction::CreateRemote
            }
        }
        (None, Some(_), None) => SyncAction::Noop,
        (None, None, Some(_)) => SyncAction::ModifyLocal,
        (Some(l), None, Some(r)) => {
            if l.hash == r.hash {
                SyncAction::Noop
            } else {
                SyncAction::ModifyLocal
            }
        }
        (Some(l), Some(p), Some(r)) => {
            let l_eq_p = l.hash == p.hash;
            let r_eq_p = r.hash == p.hash;
            match (l_eq_p, r_eq_p) {
                (true, true) => SyncAction::Noop,
                (true, false) => SyncAction::ModifyLocal,
                (false, true) => SyncAction::ModifyRemote,
                // Both diverged from the common ancestor: remote wins
                // (first-writer-wins at the server).
                (false, false) => SyncAction::ModifyLocal,
            }
        }
        (None, None, None) => SyncAction::Noop,
    }
}

pub(crate) async fn sync_once(
    api: &ApiClient,
    data_dir: &Path,
    filters: &SyncFilters,
    local_scanner: &mut LocalScanner,
    journal: &mut SyncJournal,
) -> Result<()> {
    journal.refresh_from_disk()?;

    let datasites_root = data_dir.join("datasites");
    if !datasites_root.exists() {
        return Err(SyncEnvironmentError(format!(
            "workspace directory missing: {}",
            datasites_root.display()
        ))
        .into());
    }

    let local = local_scanner.scan(&datasites_root, filters)?;
    let remote = scan_remote(api, filters).await?;

    let mut all_keys: HashSet<String> = HashSet::new();
    all_keys.extend(local.keys().cloned());
    all_keys.extend(remote.keys().cloned());
    all_keys.extend(journal.state.keys().cloned());

    // Permission files sort ahead of regular files; within a class, smaller
    // files are drained first.
    let mut queue: Vec<String> = all_keys.into_iter().collect();
    queue.sort_by(|a, b| {
        let perm_a = is_permission_file(a);
        let perm_b = is_permission_file(b);
        perm_b
            .cmp(&perm_a)
            .then_with(|| file_size_hint(&local, &remote, a).cmp(&file_size_hint(&local, &remote, b)))
            .then_with(|| a.cmp(b))
    });

    let mut to_download = Vec::new();
    for key in queue {
        if filters.ignore.should_ignore_rel(Path::new(&key), false) || SyncFilters::is_marked_rel_path(&key) {
            continue;
        }

        let l = local.get(&key).map(|f| SyncedMetadata {
            hash: f.hash.clone(),
            size: f.size,
            last_modified: f.last_modified,
        });
        let p = journal.get(&key).cloned();
        let r = remote.get(&key).map(|m| SyncedMetadata {
            hash: m.hash.clone(),
            size: m.file_size,
            last_modified: m.last_modified.timestamp(),
        });

        let action = decide(l.as_ref(), p.as_ref(), r.as_ref());
        if let Err(err) = apply_action(
            api,
            &datasites_root,
            &key,
            action,
            local.get(&key),
            journal,
            &mut to_download,
        )
        .await
        {
            crate::logging::error(format!("sync item error for {key}: {err:?}"));
        }
    }

    if !to_download.is_empty() {
        bulk_download(api, &datasites_root, &to_download, journal).await?;
    }

    journal.save()?;
    Ok(())
}

async fn apply_action(
    api: &ApiClient,
    datasites_root: &Path,
    key: &str,
    action: SyncAction,
    local: Option<&LocalFile>,
    journal: &mut SyncJournal,
    to_download: &mut Vec<String>,
) -> Result<()> {
    match action {
        SyncAction::Noop => Ok(()),
        SyncAction::CreateRemote => {
            let Some(l) = local else { return Ok(()) };
            if l.size > MAX_FILE_SIZE_BYTES {
                crate::logging::error(format!("sync skip oversize file {key}"));
                return Ok(());
            }
            if is_symlink_or_dotfile(&l.path, datasites_root) {
                return Ok(());
            }
            match api.create(key, &l.path).await {
                Ok(()) => {
                    journal.set(
                        key.to_string(),
                        SyncedMetadata {
                            hash: l.hash.clone(),
                            size: l.size,
                            last_modified: l.last_modified,
                        },
                    );
                    Ok(())
                }
                Err(err) => {
                    if err.to_string().contains("forbidden") {
                        mark_rejected_marker(&l.path)?;
                    }
                    Err(err)
                }
            }
        }
        SyncAction::DeleteRemote => {
            api.delete(key).await?;
            journal.delete(key);
            Ok(())
        }
        SyncAction::DeleteLocal => {
            let abs = datasites_root.join(key);
            if abs.exists() {
                if abs.is_dir() {
                    fs::remove_dir_all(&abs)?;
                } else {
                    fs::remove_file(&abs)?;
                }
            }
            journal.delete(key);
            Ok(())
        }
        SyncAction::ModifyLocal => {
            to_download.push(key.to_string());
            Ok(())
        }
        SyncAction::ModifyRemote => {
            let Some(l) = local else { return Ok(()) };
            let content = fs::read(&l.path)
                .with_context(|| format!("read local file {}", l.path.display()))?;
            let expected_hash = hash_bytes(&content);

            // Re-check the remote's current signature immediately before
            // pushing -- it may have moved again since the scan that decided
            // on this action, and there's no sense overwriting it with
            // identical bytes.
            let remote_metadata = api.get_metadata(key).await?;
            if remote_metadata.hash == expected_hash {
                journal.set(
                    key.to_string(),
                    SyncedMetadata {
                        hash: expected_hash,
                        size: l.size,
                        last_modified: l.last_modified,
                    },
                );
                return Ok(());
            }

            let diff = B64.encode(&content);
            match api.apply_diff(key, &diff, &expected_hash).await {
                Ok(applied) => {
                    journal.set(
                        key.to_string(),
                        SyncedMetadata {
                            hash: applied.current_hash,
                            size: l.size,
                            last_modified: l.last_modified,
                        },
                    );
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
    }
}

async fn bulk_download(
    api: &ApiClient,
    datasites_root: &Path,
    keys: &[String],
    journal: &mut SyncJournal,
) -> Result<()> {
    let mut remaining: HashSet<String> = keys.iter().cloned().collect();
    let batch: Vec<String> = keys.to_vec();
    let result = api
        .download_bulk(&batch, |record| {
            let target = datasites_root.join(&record.path);
            ensure_parent_dirs(&target)?;
            write_file_resolving_conflicts(&target, &record.content)?;
            remaining.remove(&record.path);
            Ok(())
        })
        .await;

    if let Err(err) = result {
        crate::logging::error(format!("download_bulk failed, falling back per-file: {err:?}"));
    }

    for key in keys {
        if remaining.contains(key) {
            // Fell back to per-file download for anything that didn't arrive.
            match api.download(key).await {
                Ok(bytes) => {
                    let target = datasites_root.join(key);
                    ensure_parent_dirs(&target)?;
                    write_file_resolving_conflicts(&target, &bytes)?;
                }
                Err(err) => {
                    crate::logging::error(format!("per-file fallback download failed for {key}: {err:?}"));
                    continue;
                }
            }
        }
        let target = datasites_root.join(key);
        if let Ok(meta) = fs::metadata(&target) {
            if let Ok(hash) = compute_file_hash(&target) {
                journal.set(
                    key.clone(),
                    SyncedMetadata {
                        hash,
                        size: meta.len() as i64,
                        last_modified: mtime_epoch(&meta),
                    },
                );
            }
        }
    }
    Ok(())
}

/// On initial sync, compute paths present remotely but absent locally,
/// filter ignored paths, and issue a single `download_bulk` rather than
/// per-file downloads.
pub async fn bulk_bootstrap(
    api: &ApiClient,
    data_dir: &Path,
    filters: &SyncFilters,
) -> Result<usize> {
    let datasites_root = data_dir.join("datasites");
    fs::create_dir_all(&datasites_root)?;
    let remote = scan_remote(api, filters).await?;

    let mut missing = Vec::new();
    for (key, meta) in &remote {
        if datasites_root.join(key).exists() {
            continue;
        }
        if meta.file_size > MAX_FILE_SIZE_BYTES {
            continue;
        }
        missing.push(key.clone());
    }
    if missing.is_empty() {
        return Ok(0);
    }

    let mut journal = SyncJournal::load(data_dir)?;
    let mut remaining: HashSet<String> = missing.iter().cloned().collect();
    api.download_bulk(&missing, |record| {
        let target = datasites_root.join(&record.path);
        ensure_parent_dirs(&target)?;
        write_file_resolving_conflicts(&target, &record.content)?;
        remaining.remove(&record.path);
        Ok(())
    })
    .await?;

    for key in &missing {
        let target = datasites_root.join(key);
        if let Ok(meta) = fs::metadata(&target) {
            if let Ok(hash) = compute_file_hash(&target) {
                journal.set(
                    key.clone(),
                    SyncedMetadata {
                        hash,
                        size: meta.len() as i64,
                        last_modified: mtime_epoch(&meta),
                    },
                );
            }
        }
    }
    journal.save()?;
    Ok(missing.len() - remaining.len())
}

fn is_permission_file(key: &str) -> bool {
    Path::new(key)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == crate::permissions::PERMISSION_FILE_NAME)
}

fn file_size_hint(
    local: &HashMap<String, LocalFile>,
    remote: &HashMap<String, RemoteMetadata>,
    key: &str,
) -> i64 {
    local
        .get(key)
        .map(|f| f.size)
        .or_else(|| remote.get(key).map(|m| m.file_size))
        .unwrap_or(0)
}

fn is_symlink_or_dotfile(path: &Path, datasites_root: &Path) -> bool {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            return true;
        }
    }
    if let Ok(rel) = path.strip_prefix(datasites_root) {
        return rel
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
    }
    false
}

fn mark_rejected_marker(path: &Path) -> Result<()> {
    let marker = path.with_extension(format!(
        "{}.syftrejected.request",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    fs::write(marker, b"")?;
    Ok(())
}

async fn scan_remote(
    api: &ApiClient,
    filters: &SyncFilters,
) -> Result<HashMap<String, RemoteMetadata>> {
    let mut out = HashMap::new();
    let datasites = api.datasites().await?;
    for files in datasites.into_values() {
        for meta in files {
            if filters.ignore.should_ignore_rel(Path::new(&meta.path), false)
                || SyncFilters::is_marked_rel_path(&meta.path)
            {
                continue;
            }
            out.insert(meta.path.clone(), meta);
        }
    }
    Ok(out)
}

/// Ensure parent directories exist for `target`, clearing any conflicting
/// non-directory ancestor first.
pub(crate) fn ensure_parent_dirs(target: &Path) -> Result<()> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };
    match fs::create_dir_all(parent) {
        Ok(_) => Ok(()),
        Err(_) => {
            let mut cur = parent.to_path_buf();
            loop {
                if cur.exists() {
                    if !fs::metadata(&cur)?.is_dir() {
                        fs::remove_file(&cur)?;
                    }
                    break;
                }
                match cur.parent() {
                    Some(up) => cur = up.to_path_buf(),
                    None => break,
                }
            }
            fs::create_dir_all(parent)?;
            Ok(())
        }
    }
}

pub(crate) fn write_file_resolving_conflicts(target: &Path, bytes: &[u8]) -> Result<()> {
    match fs::write(target, bytes) {
        Ok(_) => Ok(()),
        Err(err) => {
            if target.exists() && fs::metadata(target)?.is_dir() {
                fs::remove_dir_all(target)?;
                fs::write(target, bytes)?;
                return Ok(());
            }
            Err(err).with_context(|| format!("write {}", target.display()))
        }
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub(crate) fn compute_file_hash(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn mtime_epoch(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn is_synced_key(key: &str) -> bool {
    let key = key.trim_start_matches('/');
    match key.split_once('/') {
        Some((root, _)) => root.contains('@'),
        None => false,
    }
}

#[derive(Clone, Debug)]
struct LocalScanCacheEntry {
    size: i64,
    mtime_nanos: u128,
    hash: String,
}

#[derive(Default)]
pub(crate) struct LocalScanner {
    last_state: HashMap<String, LocalScanCacheEntry>,
}

impl LocalScanner {
    fn scan(
        &mut self,
        datasites_root: &Path,
        filters: &SyncFilters,
    ) -> Result<HashMap<String, LocalFile>> {
        let mut out = HashMap::new();
        let mut next_state = HashMap::new();

        if !datasites_root.exists() {
            self.last_state.clear();
            return Ok(out);
        }

        for entry in WalkDir::new(datasites_root)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".data" && e.file_name() != "plugins")
            .filter_map(|e| e.ok())
        {
            let ftype = entry.file_type();
            if ftype.is_dir() || ftype.is_symlink() {
                continue;
            }
            let path = entry.path();
            let rel = path
                .strip_prefix(datasites_root)
                .with_context(|| format!("strip prefix {}", path.display()))?;
            if filters.ignore.should_ignore_rel(rel, false) {
                continue;
            }
            let key = rel.to_string_lossy().replace('\\', "/");
            if !is_synced_key(&key) || SyncFilters::is_marked_rel_path(&key) {
                continue;
            }

            let meta = entry.metadata()?;
            let size = meta.len() as i64;
            let (mtime_nanos, last_modified) = match meta.modified() {
                Ok(st) => {
                    let d = st.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
                    (d.as_nanos(), d.as_secs() as i64)
                }
                Err(_) => (0, 0),
            };

            let hash = match self.last_state.get(&key) {
                Some(prev) if prev.size == size && prev.mtime_nanos == mtime_nanos => {
                    prev.hash.clone()
                }
                _ => compute_file_hash(path)?,
            };

            next_state.insert(
                key.clone(),
                LocalScanCacheEntry {
                    size,
                    mtime_nanos,
                    hash: hash.clone(),
                },
            );
            out.insert(
                key,
                LocalFile {
                    path: path.to_path_buf(),
                    hash,
                    size,
                    last_modified,
                },
            );
        }

        self.last_state = next_state;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(hash: &str) -> SyncedMetadata {
        SyncedMetadata {
            hash: hash.to_string(),
            size: 1,
            last_modified: 0,
        }
    }

    #[test]
    fn present_absent_absent_is_create_remote() {
        assert_eq!(decide(Some(&meta("a")), None, None), SyncAction::CreateRemote);
    }

    #[test]
    fn absent_present_present_is_delete_local() {
        assert_eq!(
            decide(None, Some(&meta("a")), Some(&meta("a"))),
            SyncAction::DeleteLocal
        );
    }

    #[test]
    fn present_present_absent_same_is_delete_remote() {
        assert_eq!(
            decide(Some(&meta("a")), Some(&meta("a")), None),
            SyncAction::DeleteRemote
        );
    }

    #[test]
    fn present_present_absent_diverged_is_create_remote() {
        assert_eq!(
            decide(Some(&meta("b")), Some(&meta("a")), None),
            SyncAction::CreateRemote
        );
    }

    #[test]
    fn absent_present_absent_is_noop() {
        assert_eq!(decide(None, Some(&meta("a")), None), SyncAction::Noop);
    }

    #[test]
    fn all_equal_is_noop() {
        assert_eq!(
            decide(Some(&meta("a")), Some(&meta("a")), Some(&meta("a"))),
            SyncAction::Noop
        );
    }

    #[test]
    fn local_equals_previous_remote_diverged_is_modify_local() {
        assert_eq!(
            decide(Some(&meta("a")), Some(&meta("a")), Some(&meta("b"))),
            SyncAction::ModifyLocal
        );
    }

    #[test]
    fn remote_equals_previous_local_diverged_is_modify_remote() {
        assert_eq!(
            decide(Some(&meta("b")), Some(&meta("a")), Some(&meta("a"))),
            SyncAction::ModifyRemote
        );
    }

    #[test]
    fn conflict_both_diverged_remote_wins() {
        assert_eq!(
            decide(Some(&meta("b")), Some(&meta("a")), Some(&meta("c"))),
            SyncAction::ModifyLocal
        );
    }

    #[test]
    fn local_untracked_remote_present_is_modify_local() {
        assert_eq!(
            decide(Some(&meta("a")), None, Some(&meta("b"))),
            SyncAction::ModifyLocal
        );
    }

    #[test]
    fn local_untracked_remote_present_same_hash_is_noop() {
        assert_eq!(
            decide(Some(&meta("a")), None, Some(&meta("a"))),
            SyncAction::Noop
        );
    }

    #[test]
    fn scan_local_collects_files_and_hash() {
        let root = make_temp_dir();
        let f1 = root.join("alice@example.com/public/a.txt");
        fs::create_dir_all(f1.parent().unwrap()).unwrap();
        fs::write(&f1, b"hello\n").unwrap();

        let filters = SyncFilters::load(&root).unwrap();
        let mut scanner = LocalScanner::default();
        let state = scanner.scan(&root, &filters).unwrap();
        let key = "alice@example.com/public/a.txt".to_string();
        assert!(state.contains_key(&key));
        let computed = compute_file_hash(&f1).unwrap();
        assert_eq!(computed, state.get(&key).unwrap().hash);
    }

    fn make_temp_dir() -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("syftbox-rs-sync-test-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    async fn spawn_server(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    /// `ModifyRemote` must push the file's *current* local bytes via
    /// `apply_diff`, never the `get_diff` response it (wrongly) used to
    /// round-trip. No `/sync/get_diff` route is registered here, so if the
    /// old behavior regressed this test would fail with a connection/404
    /// error instead of asserting on the pushed body.
    #[tokio::test]
    async fn modify_remote_pushes_real_local_bytes_via_apply_diff() {
        let root = make_temp_dir();
        let file_path = root.join("alice@example.com/public/note.txt");
        fs::create_dir_all(file_path.parent().unwrap()).unwrap();
        let local_content = b"edited locally\n";
        fs::write(&file_path, local_content).unwrap();
        let expected_hash = hash_bytes(local_content);

        let received_diff = std::sync::Arc::new(std::sync::Mutex::new(None));
        let received_diff_for_route = received_diff.clone();
        let app = axum::Router::new()
            .route(
                "/sync/get_metadata",
                axum::routing::post(move || {
                    async move {
                        axum::Json(serde_json::json!({
                            "path": "alice@example.com/public/note.txt",
                            "hash": "stale-remote-hash",
                            "signature": serde_json::Value::Null,
                            "file_size": 1,
                            "last_modified": chrono::Utc::now(),
                        }))
                    }
                }),
            )
            .route(
                "/sync/apply_diff",
                axum::routing::post(move |body: axum::Json<serde_json::Value>| {
                    let received_diff_for_route = received_diff_for_route.clone();
                    async move {
                        *received_diff_for_route.lock().unwrap() =
                            Some(body.0["diff"].as_str().unwrap().to_string());
                        axum::Json(serde_json::json!({"current_hash": body.0["expected_hash"]}))
                    }
                }),
            );
        let base = spawn_server(app).await;
        let api = ApiClient::new(&base, "alice@example.com", None).unwrap();

        let local = LocalFile {
            path: file_path.clone(),
            hash: "whatever-the-scanner-cached".to_string(),
            size: local_content.len() as i64,
            last_modified: 0,
        };
        let mut journal = SyncJournal::load(&root).unwrap();
        let mut to_download = Vec::new();

        apply_action(
            &api,
            &root,
            "alice@example.com/public/note.txt",
            SyncAction::ModifyRemote,
            Some(&local),
            &mut journal,
            &mut to_download,
        )
        .await
        .unwrap();

        let pushed_diff = received_diff.lock().unwrap().clone().unwrap();
        let pushed_bytes = B64.decode(pushed_diff.as_bytes()).unwrap();
        assert_eq!(pushed_bytes, local_content);

        assert_eq!(
            journal.get("alice@example.com/public/note.txt").unwrap().hash,
            expected_hash
        );
    }
}
