use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use globset::Glob;
use serde::{Deserialize, Serialize};

pub const PERMISSION_FILE_NAME: &str = "syftperm.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    Read,
    Create,
    Write,
    Admin,
}

impl PermissionKind {
    pub const ALL: [PermissionKind; 4] = [
        PermissionKind::Read,
        PermissionKind::Create,
        PermissionKind::Write,
        PermissionKind::Admin,
    ];
}

#[derive(Debug)]
pub struct PermissionParsingError(pub String);

impl std::fmt::Display for PermissionParsingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "permission parsing error: {}", self.0)
    }
}
impl std::error::Error for PermissionParsingError {}

/// One rule entry in a `syftperm.yaml` file, as read off disk.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawRule {
    pub path: String,
    pub user: String,
    #[serde(default)]
    pub permissions: PermissionList,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// Accepts either a single string or a list of strings in the YAML source.
#[derive(Debug, Clone, Default)]
pub struct PermissionList(pub Vec<String>);

impl<'de> Deserialize<'de> for PermissionList {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }
        Ok(match Repr::deserialize(d)? {
            Repr::One(s) => PermissionList(vec![s]),
            Repr::Many(v) => PermissionList(v),
        })
    }
}

impl Serialize for PermissionList {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

/// A single resolved rule: the permission file it came from, the pattern it
/// matches, the user it applies to, and which kinds it grants/denies.
#[derive(Debug, Clone)]
pub struct PermissionRule {
    pub permfile_dir: PathBuf,
    pub path: String,
    pub user: String,
    pub allow: bool,
    pub permissions: Vec<PermissionKind>,
    pub priority: i64,
}

impl PermissionRule {
    pub fn depth(&self) -> usize {
        self.permfile_dir.components().count()
    }

    pub fn permfile_path(&self) -> PathBuf {
        self.permfile_dir.join(PERMISSION_FILE_NAME)
    }
}

fn parse_kind(s: &str) -> Result<PermissionKind> {
    match s.to_ascii_lowercase().as_str() {
        "read" => Ok(PermissionKind::Read),
        "create" => Ok(PermissionKind::Create),
        "write" => Ok(PermissionKind::Write),
        "admin" => Ok(PermissionKind::Admin),
        other => Err(anyhow!("unknown permission kind: {other}")),
    }
}

/// Parse a `syftperm.yaml` document's bytes into rules rooted at `permfile_dir`.
pub fn parse_rules(permfile_dir: &Path, content: &str) -> Result<Vec<PermissionRule>, PermissionParsingError> {
    let raw: Vec<RawRule> = serde_yaml::from_str(content)
        .map_err(|e| PermissionParsingError(format!("invalid yaml: {e}")))?;

    let mut rules = Vec::with_capacity(raw.len());
    for (idx, r) in raw.into_iter().enumerate() {
        if r.path.starts_with("../") || r.path == ".." {
            return Err(PermissionParsingError(format!(
                "rule path escapes permission file directory: {}",
                r.path
            )));
        }
        if r.user != "*" && !r.user.contains('@') {
            return Err(PermissionParsingError(format!("invalid user: {}", r.user)));
        }
        if let Some(useremail_pos) = r.path.find("{useremail}") {
            if let Some(globstar_pos) = r.path.find("**") {
                if globstar_pos < useremail_pos {
                    return Err(PermissionParsingError(
                        "'**' may not appear before '{useremail}' in path".to_string(),
                    ));
                }
            }
        }
        let allow = r.kind.as_deref() != Some("disallow");
        let mut permissions = Vec::new();
        for p in &r.permissions.0 {
            permissions.push(
                parse_kind(p).map_err(|e| PermissionParsingError(e.to_string()))?,
            );
        }
        rules.push(PermissionRule {
            permfile_dir: permfile_dir.to_path_buf(),
            path: r.path,
            user: r.user,
            allow,
            permissions,
            priority: idx as i64,
        });
    }
    Ok(rules)
}

/// `{ READ: bool, CREATE: bool, WRITE: bool, ADMIN: bool }` computed for one
/// `(user, file_path)` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputedPermission {
    pub user: String,
    pub file_path: String,
    perms: BTreeMap<PermissionKind, bool>,
}

impl ComputedPermission {
    fn raw(&self, kind: PermissionKind) -> bool {
        *self.perms.get(&kind).unwrap_or(&false)
    }

    pub fn path_owner(&self) -> &str {
        self.file_path.split('/').next().unwrap_or("")
    }

    fn user_matches(rule: &PermissionRule, user: &str) -> bool {
        rule.user == "*" || rule.user == user
    }

    /// Resolve `{useremail}` against `user`, then glob-match the remaining
    /// pattern (with `**` as a recursive wildcard) against the file path
    /// relative to the rule's directory.
    fn rule_applies_to_path(rule: &PermissionRule, user: &str, rel_path: &str) -> bool {
        let pattern = rule.path.replace("{useremail}", user);
        match Glob::new(&pattern) {
            Ok(g) => g.compile_matcher().is_match(rel_path),
            Err(_) => false,
        }
    }

    fn is_invalid_permission(file_path: &str, kind: PermissionKind) -> bool {
        matches!(kind, PermissionKind::Create | PermissionKind::Write)
            && file_path
                .rsplit('/')
                .next()
                .map(|name| name == PERMISSION_FILE_NAME)
                .unwrap_or(false)
    }

    fn apply(&mut self, rule: &PermissionRule, user: &str, rel_path: &str) {
        if !Self::user_matches(rule, user) || !Self::rule_applies_to_path(rule, user, rel_path) {
            return;
        }
        for kind in &rule.permissions {
            if Self::is_invalid_permission(&self.file_path, *kind) {
                continue;
            }
            self.perms.insert(*kind, rule.allow);
        }
    }

    /// Apply rules in ascending override-strength order (caller is
    /// responsible for sorting by `(depth, priority)` ascending beforehand),
    /// then resolve the fixed overrides.
    pub fn from_user_rules_and_path(rules: &[PermissionRule], user: &str, file_path: &str) -> Self {
        let mut computed = ComputedPermission {
            user: user.to_string(),
            file_path: file_path.to_string(),
            perms: BTreeMap::new(),
        };
        for rule in rules {
            let rel_path = file_path
                .strip_prefix(&rule_dir_relative(rule))
                .unwrap_or(file_path);
            computed.apply(rule, user, rel_path);
        }
        computed
    }

    /// Override order: path owner wins unconditionally; ADMIN wins
    /// unconditionally; permission files require ADMIN for CREATE/WRITE;
    /// CREATE/WRITE additionally require READ; otherwise the raw computed
    /// value.
    pub fn has_permission(&self, kind: PermissionKind) -> bool {
        if self.path_owner() == self.user {
            return true;
        }
        if self.raw(PermissionKind::Admin) {
            return true;
        }
        if Self::is_invalid_permission(&self.file_path, kind) {
            return self.raw(PermissionKind::Admin);
        }
        if matches!(kind, PermissionKind::Create | PermissionKind::Write) {
            return self.raw(PermissionKind::Read) && self.raw(kind);
        }
        self.raw(kind)
    }
}

fn rule_dir_relative(rule: &PermissionRule) -> String {
    // rules are matched against the file path relative to the datasite root;
    // the rule's own dir_path (also root-relative) is the prefix to strip.
    rule.permfile_dir.to_string_lossy().replace('\\', "/")
}

/// Walk every ancestor of `target_dir` (inclusive) under `datasites_root`,
/// collecting parsed rules from each `syftperm.yaml` found. Malformed files
/// are skipped (and logged), per spec: "the file is ignored for indexing
/// purposes".
pub fn collect_ancestor_rules(datasites_root: &Path, target_dir: &Path) -> Result<Vec<PermissionRule>> {
    let mut dirs = Vec::new();
    let mut cur = Some(target_dir.to_path_buf());
    while let Some(d) = cur {
        if !d.starts_with(datasites_root) {
            break;
        }
        dirs.push(d.clone());
        if d == datasites_root {
            break;
        }
        cur = d.parent().map(|p| p.to_path_buf());
    }

    let mut rules = Vec::new();
    for dir in dirs {
        let permfile = dir.join(PERMISSION_FILE_NAME);
        if !permfile.exists() {
            continue;
        }
        let content = std::fs::read_to_string(&permfile)
            .with_context(|| format!("read {}", permfile.display()))?;
        let rel_dir = dir
            .strip_prefix(datasites_root)
            .unwrap_or(&dir)
            .to_path_buf();
        match parse_rules(&rel_dir, &content) {
            Ok(mut r) => rules.append(&mut r),
            Err(e) => crate::logging::error(format!("{}: {e}", permfile.display())),
        }
    }
    Ok(rules)
}

/// Resolve effective permissions for `(user, target_path)`, where
/// `target_path` is relative to `datasites_root`.
pub fn resolve(datasites_root: &Path, user: &str, target_path: &str) -> Result<ComputedPermission> {
    let target_dir = Path::new(target_path)
        .parent()
        .map(|p| datasites_root.join(p))
        .unwrap_or_else(|| datasites_root.to_path_buf());
    let mut rules = collect_ancestor_rules(datasites_root, &target_dir)?;
    // Ascending override strength: shallower files first, then priority within a file.
    rules.sort_by_key(|r| (r.depth(), r.priority));
    Ok(ComputedPermission::from_user_rules_and_path(
        &rules,
        user,
        target_path,
    ))
}

/// Default rule set seeded for a freshly-created datasite root: the owner
/// gets every permission over `**`.
pub fn datasite_default(email: &str) -> Vec<PermissionRule> {
    vec![PermissionRule {
        permfile_dir: PathBuf::from(email),
        path: "**".to_string(),
        user: email.to_string(),
        allow: true,
        permissions: PermissionKind::ALL.to_vec(),
        priority: 0,
    }]
}

/// Default rule set for a `public/` subdirectory: owner admin plus
/// world-readable.
pub fn mine_with_public_read(email: &str) -> Vec<PermissionRule> {
    vec![
        PermissionRule {
            permfile_dir: PathBuf::from(format!("{email}/public")),
            path: "**".to_string(),
            user: email.to_string(),
            allow: true,
            permissions: PermissionKind::ALL.to_vec(),
            priority: 0,
        },
        PermissionRule {
            permfile_dir: PathBuf::from(format!("{email}/public")),
            path: "**".to_string(),
            user: "*".to_string(),
            allow: true,
            permissions: vec![PermissionKind::Read],
            priority: 1,
        },
    ]
}

pub fn rules_to_yaml(rules: &[PermissionRule]) -> Result<String> {
    let raw: Vec<RawRule> = rules
        .iter()
        .map(|r| RawRule {
            path: r.path.clone(),
            user: r.user.clone(),
            permissions: PermissionList(
                r.permissions
                    .iter()
                    .map(|p| format!("{p:?}").to_lowercase())
                    .collect(),
            ),
            kind: if r.allow { None } else { Some("disallow".to_string()) },
        })
        .collect();
    serde_yaml::to_string(&raw).context("serialize permission rules to yaml")
}
