use std::{
    fs,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

const DEFAULT_IGNORE_LINES: &[&str] = &[
    // syft
    "syftignore",
    "**/syft.sub.yaml",
    "**/*syftrejected*", // legacy marker
    "**/*syftconflict*", // legacy marker
    "**/*.conflict.*",
    "**/*.conflict",
    "**/*.rejected.*",
    "**/*.rejected",
    "**/stream.sock",
    "**/stream.pipe",
    "**/stream.tcp",
    "**/stream.accept",
    "*.syft.tmp.*", // temporary files (Go atomic writes)
    "**/.*.tmp-*",  // temporary files (Rust download temp)
    "**/*.tmp-*",   // temporary files (without leading dot)
    ".syftkeep",
    // python
    ".ipynb_checkpoints/",
    "__pycache__/",
    "*.py[cod]",
    "dist/",
    "venv/",
    ".venv/",
    // IDE/Editor-specific
    ".vscode",
    ".idea",
    // General excludes
    ".git",
    ".data/",
    "*.tmp",
    "*.log",
    "logs/",
    // OS-specific
    ".DS_Store",
    "Thumbds.db",
    "Icon",
];

const DEFAULT_PRIORITY_LINES: &[&str] = &[
    "**/*.request",
    "**/*.response",
    "**/syftperm.yaml", // ACL files need priority to avoid race condition
];

#[derive(Clone)]
pub struct SyncIgnoreList {
    ignore: Gitignore,
}

impl SyncIgnoreList {
    pub fn load(base_dir: &Path) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(base_dir);
        for line in DEFAULT_IGNORE_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default ignore line: {line}"))?;
        }

        let ignore_path = base_dir.join("syftignore");
        if ignore_path.exists() {
            let custom = read_ignore_file(&ignore_path)?;
            for line in custom {
                builder
                    .add_line(None, &line)
                    .with_context(|| format!("add syftignore line: {line}"))?;
            }
        }

        let ignore = builder.build().context("build ignore matcher")?;
        Ok(Self { ignore })
    }

    pub fn should_ignore_rel(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }
}

#[derive(Clone)]
pub struct SyncPriorityList {
    priority: Gitignore,
}

impl SyncPriorityList {
    pub fn load(base_dir: &Path) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(base_dir);
        for line in DEFAULT_PRIORITY_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default priority line: {line}"))?;
        }
        let priority = builder.build().context("build priority matcher")?;
        Ok(Self { priority })
    }

    pub fn should_prioritize_rel(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.priority
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }
}

#[derive(Clone)]
pub struct SyncFilters {
    pub ignore: SyncIgnoreList,
    pub priority: SyncPriorityList,
}

impl SyncFilters {
    pub fn load(datasites_root: &Path) -> Result<Self> {
        fs::create_dir_all(datasites_root)
            .with_context(|| format!("create datasites dir {}", datasites_root.display()))?;
        Ok(Self {
            ignore: SyncIgnoreList::load(datasites_root)?,
            priority: SyncPriorityList::load(datasites_root)?,
        })
    }

    pub fn is_marked_rel_path(rel: &str) -> bool {
        // Equivalent to Go IsMarkedPath checks on filenames (and avoids infinite loops).
        rel.contains(".conflict")
            || rel.contains(".rejected")
            || rel.contains("syftrejected")
            || rel.contains("syftconflict")
    }
}

fn read_ignore_file(path: &Path) -> Result<Vec<String>> {
    let file =
        fs::File::open(path).with_context(|| format!("open ignore file {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.contains('\0') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}
