//! 存储根目录约束：上传路径规范化与根目录内解析。

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::error::{UploadError, UploadResult};

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
    state_dir_name: String,
}

impl Storage {
    /// 以绝对化后的根目录创建存储约束；状态目录名必须是单个普通路径段。
    pub fn new(root: PathBuf, state_dir_name: &str) -> io::Result<Self> {
        let mut components = Path::new(state_dir_name).components();
        let single_segment = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_segment {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("state dir must be a single directory name: {state_dir_name:?}"),
            ));
        }
        let root = lexical_clean(&std::path::absolute(root)?);
        Ok(Self {
            root,
            state_dir_name: state_dir_name.to_string(),
        })
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        fs::create_dir_all(self.state_dir()).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn state_dir_name(&self) -> &str {
        &self.state_dir_name
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(&self.state_dir_name)
    }

    /// 判断规范化后的相对路径是否落在状态目录内。
    pub fn is_state_path(&self, relative: &str) -> bool {
        relative.split('/').next() == Some(self.state_dir_name.as_str())
    }

    /// 将已校验的相对路径解析为根目录下的绝对路径，并再次确认未越界。
    pub fn resolve(&self, relative: &str) -> UploadResult<PathBuf> {
        let clean = sanitize_relative_path(relative)?;
        let mut target = self.root.clone();
        for segment in clean.split('/') {
            target.push(segment);
        }
        if target == self.root || !is_within_root(&self.root, &target) {
            return Err(UploadError::InvalidPath);
        }
        Ok(target)
    }

    /// 逐级检查根目录以下的路径段：拒绝符号链接与非目录的中间段。
    pub async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> UploadResult<()> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| UploadError::InvalidPath)?;
        let mut current = self.root.clone();
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(UploadError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(UploadError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(UploadError::Io(err)),
            }
        }

        Ok(())
    }
}

/// 规范化调用方提供的上传路径，返回以 `/` 连接的根相对路径。
pub fn sanitize_relative_path(raw: &str) -> UploadResult<String> {
    let unified = raw.trim().replace('\\', "/");
    let without_root = unified.strip_prefix('/').unwrap_or(&unified);
    // `//host/share` 一类路径去掉一个分隔符后仍是绝对路径
    if without_root.starts_with('/') {
        return Err(UploadError::InvalidPath);
    }
    let trimmed = without_root.strip_prefix("./").unwrap_or(without_root);
    if trimmed.is_empty() {
        return Err(UploadError::InvalidPath);
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if matches!(segments.last(), Some(last) if *last != "..") {
                    segments.pop();
                } else {
                    segments.push("..");
                }
            }
            other if other.contains('\0') => return Err(UploadError::InvalidPath),
            other => segments.push(other),
        }
    }

    match segments.first() {
        None => Err(UploadError::InvalidPath),
        Some(&"..") => Err(UploadError::InvalidPath),
        Some(first) if has_volume_prefix(first) => Err(UploadError::InvalidPath),
        Some(_) => Ok(segments.join("/")),
    }
}

/// 词法判断 `candidate` 是否为 `root` 本身或其子孙路径。
pub fn is_within_root(root: &Path, candidate: &Path) -> bool {
    let root = lexical_clean(root);
    let candidate = lexical_clean(candidate);
    match candidate.strip_prefix(&root) {
        Ok(rest) => rest
            .components()
            .all(|component| matches!(component, Component::Normal(_))),
        Err(_) => false,
    }
}

fn has_volume_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(component.as_os_str());
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}
