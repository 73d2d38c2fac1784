//! 存储根目录的目录树扫描（仅目录，带深度与条目上限）。

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{UploadError, UploadResult};
use crate::storage::is_within_root;

pub const DEFAULT_TREE_MAX_DEPTH: u32 = 4;
pub const MAX_TREE_DEPTH: u32 = 20;
pub const DEFAULT_TREE_MAX_ENTRIES: u64 = 5000;
pub const MAX_TREE_ENTRIES: u64 = 200_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DirNode {
    pub name: String,
    pub rel_path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DirNode>,
}

struct Scan<'a> {
    root: &'a Path,
    excluded: &'a str,
    max_depth: u32,
    max_entries: u64,
    entries: u64,
}

/// 深度优先扫描 `root` 下的目录。
///
/// `max_entries` 是全局软上限：达到后不再收录新的子目录，已收集的结果照常返回。
/// 名为 `excluded` 的目录在任何层级都会被跳过。根目录不可读时返回
/// [`UploadError::ScanFailed`]，单个子目录或目录项不可读只会被跳过。
pub fn scan_tree(
    root: &Path,
    excluded: &str,
    max_depth: u32,
    max_entries: u64,
) -> UploadResult<DirNode> {
    let canonical_root = root.canonicalize().map_err(UploadError::ScanFailed)?;
    let mut scan = Scan {
        root: &canonical_root,
        excluded,
        max_depth,
        max_entries,
        entries: 0,
    };
    let name = root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let node = scan
        .visit(&canonical_root, name, String::new(), 0)
        .map_err(UploadError::ScanFailed)?;
    debug!(entries = scan.entries, "tree scanned");
    Ok(node)
}

impl Scan<'_> {
    fn visit(
        &mut self,
        dir: &Path,
        name: String,
        rel_path: String,
        depth: u32,
    ) -> io::Result<DirNode> {
        let mut node = DirNode {
            name,
            rel_path,
            children: Vec::new(),
        };
        if depth >= self.max_depth {
            return Ok(node);
        }

        let mut subdirs: Vec<(String, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(path = ?dir, error = %err, "skipping unreadable directory entry");
                    continue;
                }
            };
            // 不跟随符号链接
            match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => {}
                Ok(_) => continue,
                Err(err) => {
                    warn!(path = ?entry.path(), error = %err, "skipping entry with unknown type");
                    continue;
                }
            }
            let child_name = entry.file_name().to_string_lossy().to_string();
            if child_name == self.excluded {
                continue;
            }
            subdirs.push((child_name, entry.path()));
        }
        subdirs.sort_by(|a, b| a.0.cmp(&b.0));

        for (child_name, child_path) in subdirs {
            if self.entries >= self.max_entries {
                break;
            }
            self.entries += 1;

            let inside = child_path
                .canonicalize()
                .map(|resolved| is_within_root(self.root, &resolved))
                .unwrap_or(false);
            if !inside {
                warn!(path = ?child_path, "skipping directory outside storage root");
                continue;
            }

            let child_rel = if node.rel_path.is_empty() {
                child_name.clone()
            } else {
                format!("{}/{}", node.rel_path, child_name)
            };
            match self.visit(&child_path, child_name, child_rel, depth + 1) {
                Ok(child) => node.children.push(child),
                Err(err) => {
                    warn!(path = ?child_path, error = %err, "skipping unreadable directory");
                }
            }
        }
        Ok(node)
    }
}
