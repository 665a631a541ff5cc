//! The gateway's process-local future store: one SQLite row per pending or
//! recently-resolved external RPC call. Grounded on the futures table used
//! by the reference Python RPC proxy.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS futures (
    id      TEXT PRIMARY KEY,
    path    TEXT NOT NULL,
    expires TEXT NOT NULL,
    namespace TEXT NOT NULL
) WITHOUT ROWID;
";

pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let conn = Connection::open(path).with_context(|| format!("open {}", path.display()))?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;
         PRAGMA temp_store=MEMORY;
         PRAGMA foreign_keys=OFF;",
    )?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

#[derive(Debug, Clone)]
pub struct FutureRow {
    pub id: String,
    pub path: String,
    pub expires: DateTime<Utc>,
    pub namespace: String,
}

pub fn save_future(conn: &Connection, row: &FutureRow) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO futures (id, path, expires, namespace) VALUES (?1, ?2, ?3, ?4)",
        params![row.id, row.path, row.expires.to_rfc3339(), row.namespace],
    )?;
    Ok(())
}

pub fn get_future(conn: &Connection, id: &str) -> Result<Option<FutureRow>> {
    conn.query_row(
        "SELECT id, path, expires, namespace FROM futures WHERE id = ?1",
        params![id],
        |row| {
            let expires_str: String = row.get(2)?;
            Ok(FutureRow {
                id: row.get(0)?,
                path: row.get(1)?,
                expires: DateTime::parse_from_rfc3339(&expires_str)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                namespace: row.get(3)?,
            })
        },
    )
    .optional()
    .context("get_future")
}

pub fn delete_future(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM futures WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn cleanup_expired(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM futures WHERE expires < ?1",
        params![Utc::now().to_rfc3339()],
    )?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_db(name: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!("syftbox-rs-futuresdb-{name}.sqlite"));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn save_get_delete_roundtrip() {
        let conn = open(&tmp_db("roundtrip")).unwrap();
        let row = FutureRow {
            id: "01ABC".into(),
            path: "/data/datasites/alice@example.com/api_data/app/rpc/ping".into(),
            expires: Utc::now() + chrono::Duration::minutes(5),
            namespace: "app".into(),
        };
        save_future(&conn, &row).unwrap();
        let got = get_future(&conn, "01ABC").unwrap().unwrap();
        assert_eq!(got.path, row.path);
        delete_future(&conn, "01ABC").unwrap();
        assert!(get_future(&conn, "01ABC").unwrap().is_none());
    }

    #[test]
    fn cleanup_removes_expired_rows_only() {
        let conn = open(&tmp_db("cleanup")).unwrap();
        save_future(
            &conn,
            &FutureRow {
                id: "expired".into(),
                path: "p".into(),
                expires: Utc::now() - chrono::Duration::minutes(5),
                namespace: "app".into(),
            },
        )
        .unwrap();
        save_future(
            &conn,
            &FutureRow {
                id: "live".into(),
                path: "p".into(),
                expires: Utc::now() + chrono::Duration::minutes(5),
                namespace: "app".into(),
            },
        )
        .unwrap();
        let n = cleanup_expired(&conn).unwrap();
        assert_eq!(n, 1);
        assert!(get_future(&conn, "live").unwrap().is_some());
    }
}
