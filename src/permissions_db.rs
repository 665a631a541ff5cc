//! Relational index over permission rules, for server-side bulk queries
//! ("what can user U read, across N known files, without walking the tree
//! per file"). Schema grounded on the `rules`/`rule_files` tables used by
//! the sync server's permission store.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::permissions::{PermissionKind, PermissionRule};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rules (
    permfile_path   TEXT NOT NULL,
    permfile_dir    TEXT NOT NULL,
    permfile_depth  INTEGER NOT NULL,
    priority        INTEGER NOT NULL,
    path            TEXT NOT NULL,
    user            TEXT NOT NULL,
    can_read        INTEGER NOT NULL DEFAULT 0,
    can_create      INTEGER NOT NULL DEFAULT 0,
    can_write       INTEGER NOT NULL DEFAULT 0,
    admin           INTEGER NOT NULL DEFAULT 0,
    disallow        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (permfile_path, priority)
);
CREATE TABLE IF NOT EXISTS rule_files (
    permfile_path   TEXT NOT NULL,
    priority        INTEGER NOT NULL,
    file_path       TEXT NOT NULL,
    match_for_email TEXT,
    PRIMARY KEY (permfile_path, priority, file_path),
    FOREIGN KEY (permfile_path, priority) REFERENCES rules(permfile_path, priority) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_rule_files_file_path ON rule_files(file_path);
";

pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open {}", path.display()))?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;
         PRAGMA foreign_keys=ON;",
    )?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Atomically replace every row belonging to `permfile_path` with the
/// current contents of `rules`, per spec §4.3: "delete the rule's rows,
/// re-scan files under `dir_path`, and reinsert matches."
pub fn reindex_permission_file(
    conn: &mut Connection,
    permfile_path: &str,
    rules: &[PermissionRule],
    known_files: &[String],
) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM rules WHERE permfile_path = ?1", params![permfile_path])?;
    tx.execute(
        "DELETE FROM rule_files WHERE permfile_path = ?1",
        params![permfile_path],
    )?;

    for rule in rules {
        // These columns record which permission *kind* the rule concerns,
        // not whether it grants it -- `disallow` carries the allow/deny
        // sense separately, so a deny rule still sets `can_read = 1`.
        let can_read = rule.permissions.contains(&PermissionKind::Read);
        let can_create = rule.permissions.contains(&PermissionKind::Create);
        let can_write = rule.permissions.contains(&PermissionKind::Write);
        let admin = rule.permissions.contains(&PermissionKind::Admin);
        let disallow = !rule.allow;

        tx.execute(
            "INSERT INTO rules (permfile_path, permfile_dir, permfile_depth, priority, path, user, can_read, can_create, can_write, admin, disallow)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                permfile_path,
                rule.permfile_dir.to_string_lossy(),
                rule.depth() as i64,
                rule.priority,
                rule.path,
                rule.user,
                can_read,
                can_create,
                can_write,
                admin,
                disallow,
            ],
        )?;

        for file_path in known_files {
            let rel = file_path
                .strip_prefix(&format!("{}/", rule.permfile_dir.to_string_lossy()))
                .unwrap_or(file_path);
            if let Some(match_for_email) = match_rule_path(&rule.path, rel) {
                tx.execute(
                    "INSERT OR IGNORE INTO rule_files (permfile_path, priority, file_path, match_for_email)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![permfile_path, rule.priority, file_path, match_for_email],
                )?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

/// Bulk read-permission aggregation for a user over the set of files
/// already linked via `rule_files`: per file, `allow_priority` is the
/// maximum `(permfile_depth, priority)` among matching, non-disallow,
/// can_read rules; `deny_priority` the same among matching disallow
/// rules; `read = allow_priority > deny_priority`.
pub fn bulk_can_read(conn: &Connection, user: &str, file_paths: &[String]) -> Result<Vec<(String, bool)>> {
    let mut out = Vec::with_capacity(file_paths.len());
    for file_path in file_paths {
        let mut stmt = conn.prepare(
            "SELECT r.permfile_depth, r.priority, r.can_read, r.disallow
             FROM rule_files rf
             JOIN rules r ON r.permfile_path = rf.permfile_path AND r.priority = rf.priority
             WHERE rf.file_path = ?1 AND (r.user = '*' OR r.user = ?2)",
        )?;
        let rows = stmt.query_map(params![file_path, user], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?;

        let mut allow_priority: Option<(i64, i64)> = None;
        let mut deny_priority: Option<(i64, i64)> = None;
        for row in rows {
            let (depth, priority, can_read, disallow) = row?;
            if !can_read {
                continue;
            }
            let key = (depth, priority);
            if disallow {
                deny_priority = Some(deny_priority.map_or(key, |d| d.max(key)));
            } else {
                allow_priority = Some(allow_priority.map_or(key, |a| a.max(key)));
            }
        }
        let read = match (allow_priority, deny_priority) {
            (Some(a), Some(d)) => a > d,
            (Some(_), None) => true,
            _ => false,
        };
        out.push((file_path.clone(), read));
    }
    Ok(out)
}

pub fn link_new_file(conn: &Connection, file_path: &str) -> Result<()> {
    let mut stmt = conn.prepare("SELECT DISTINCT permfile_path, priority, path, permfile_dir, user FROM rules")?;
    let rows: Vec<(String, i64, String, String, String)> = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?
        .collect::<rusqlite::Result<_>>()?;

    for (permfile_path, priority, path, permfile_dir, _user) in rows {
        let rel = file_path
            .strip_prefix(&format!("{permfile_dir}/"))
            .unwrap_or(file_path);
        if let Some(match_for_email) = match_rule_path(&path, rel) {
            conn.execute(
                "INSERT OR IGNORE INTO rule_files (permfile_path, priority, file_path, match_for_email)
                 VALUES (?1, ?2, ?3, ?4)",
                params![permfile_path, priority, file_path, match_for_email],
            )?;
        }
    }
    Ok(())
}

/// Mirrors `filepath_matches_rule_path`: a plain glob match when the rule's
/// `path` has no `{useremail}` template, otherwise try every `@`-containing
/// segment of `rel` in turn, substituting it for the token, and return the
/// first segment whose substituted pattern matches.
///
/// Returns `Some(None)` for a non-templated match (no email to record) and
/// `Some(Some(email))` for a templated match; `None` when `rel` doesn't
/// match the rule at all.
fn match_rule_path(rule_path: &str, rel: &str) -> Option<Option<String>> {
    if !rule_path.contains("{useremail}") {
        let matches = globset::Glob::new(rule_path)
            .ok()
            .map(|g| g.compile_matcher().is_match(rel))
            .unwrap_or(false);
        return matches.then_some(None);
    }

    rel.split('/')
        .filter(|segment| segment.contains('@'))
        .find_map(|email| {
            let pattern = rule_path.replace("{useremail}", email);
            let matches = globset::Glob::new(&pattern)
                .ok()
                .map(|g| g.compile_matcher().is_match(rel))
                .unwrap_or(false);
            matches.then(|| Some(email.to_string()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionKind;
    use std::path::PathBuf;

    fn tmp_db(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("syftbox-rs-permdb-{name}.sqlite"));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn reindex_and_bulk_read_query() {
        let path = tmp_db("reindex");
        let mut conn = open(&path).unwrap();
        let rule = PermissionRule {
            permfile_dir: PathBuf::from("alice@example.com/public"),
            path: "**".to_string(),
            user: "*".to_string(),
            allow: true,
            permissions: vec![PermissionKind::Read],
            priority: 0,
        };
        let files = vec!["alice@example.com/public/doc.txt".to_string()];
        reindex_permission_file(&mut conn, "alice@example.com/public/syftperm.yaml", &[rule], &files).unwrap();

        let results = bulk_can_read(&conn, "bob@example.com", &files).unwrap();
        assert_eq!(results, vec![("alice@example.com/public/doc.txt".to_string(), true)]);
    }

    #[test]
    fn match_for_email_is_extracted_from_file_path_not_rule_user() {
        let path = tmp_db("match-for-email");
        let mut conn = open(&path).unwrap();
        let rule = PermissionRule {
            permfile_dir: PathBuf::from("alice@example.com/shared"),
            path: "{useremail}/**".to_string(),
            user: "*".to_string(),
            allow: true,
            permissions: vec![PermissionKind::Read],
            priority: 0,
        };
        let files = vec!["alice@example.com/shared/bob@example.org/notes.txt".to_string()];
        reindex_permission_file(
            &mut conn,
            "alice@example.com/shared/syftperm.yaml",
            &[rule],
            &files,
        )
        .unwrap();

        let match_for_email: String = conn
            .query_row("SELECT match_for_email FROM rule_files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(match_for_email, "bob@example.org");
    }

    #[test]
    fn disallow_outranks_lower_priority_allow() {
        let path = tmp_db("disallow");
        let mut conn = open(&path).unwrap();
        let allow = PermissionRule {
            permfile_dir: PathBuf::from("alice@example.com"),
            path: "**".to_string(),
            user: "*".to_string(),
            allow: true,
            permissions: vec![PermissionKind::Read],
            priority: 0,
        };
        let deny = PermissionRule {
            permfile_dir: PathBuf::from("alice@example.com"),
            path: "secret/**".to_string(),
            user: "*".to_string(),
            allow: false,
            permissions: vec![PermissionKind::Read],
            priority: 1,
        };
        let files = vec!["alice@example.com/secret/x.txt".to_string()];
        reindex_permission_file(&mut conn, "alice@example.com/syftperm.yaml", &[allow, deny], &files).unwrap();
        let results = bulk_can_read(&conn, "bob@example.com", &files).unwrap();
        assert_eq!(results, vec![("alice@example.com/secret/x.txt".to_string(), false)]);
    }
}
