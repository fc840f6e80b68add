// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Project file system abstraction.
//!
//! All paths are project-relative. The empty path is the project root.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
#[cfg(feature = "telemetry")]
use tracing::{debug, instrument};

use crate::error::FsError;

/// Kind of a file system entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    File,
    Directory,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Project-relative path of the entry.
    pub path: PathBuf,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// File system operations the coordinator needs.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read(&self, path: &Path) -> Result<String, FsError>;

    /// Replace the content of a file, creating parent directories as needed.
    async fn write(&self, path: &Path, content: &str) -> Result<(), FsError>;

    /// Create an empty file or a directory. Existing entries are left intact.
    async fn create(&self, path: &Path, kind: FileKind) -> Result<(), FsError>;

    /// Remove a file or a whole directory tree.
    async fn delete(&self, path: &Path) -> Result<(), FsError>;

    /// Direct children of a directory, sorted by path.
    async fn list(&self, path: &Path) -> Result<Vec<DirEntry>, FsError>;

    /// Kind of the entry at `path`, or `None` if nothing is there.
    async fn kind(&self, path: &Path) -> Result<Option<FileKind>, FsError>;
}

/// Whether a path component marks an entry the tree should not mirror.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Recursively list everything below `root`, depth first, skipping hidden entries.
pub async fn walk(fs: &dyn FileSystem, root: &Path) -> Result<Vec<DirEntry>, FsError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs.list(&dir).await?;
        // Reverse so the stack yields entries in sorted order.
        for entry in entries.into_iter().rev() {
            if is_hidden(&entry.path) {
                continue;
            }
            if entry.kind == FileKind::Directory {
                stack.push(entry.path.clone());
            }
            out.push(entry);
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

/// Reject absolute paths and `..` so every operation stays below the root.
fn check_relative(path: &Path) -> Result<(), FsError> {
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(FsError::OutsideProject(path.display().to_string())),
        }
    }
    Ok(())
}

// ============================================================================
// Local file system
// ============================================================================

/// File system rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, FsError> {
        check_relative(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(path = %path.display())))]
    async fn read(&self, path: &Path) -> Result<String, FsError> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::read_to_string(&full).await?)
    }

    #[cfg_attr(feature = "telemetry", instrument(skip(self, content), fields(path = %path.display(), size = content.len())))]
    async fn write(&self, path: &Path, content: &str) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        #[cfg(feature = "telemetry")]
        debug!("File written");
        Ok(())
    }

    async fn create(&self, path: &Path, kind: FileKind) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        match kind {
            FileKind::Directory => tokio::fs::create_dir_all(&full).await?,
            FileKind::File => {
                if tokio::fs::try_exists(&full).await? {
                    return Ok(());
                }
                if let Some(parent) = full.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&full, "").await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<(), FsError> {
        if path.as_os_str().is_empty() {
            return Err(FsError::PermissionDenied("refusing to delete the project root".to_string()));
        }
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(&full).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await?;
        } else {
            tokio::fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn list(&self, path: &Path) -> Result<Vec<DirEntry>, FsError> {
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(&full).await?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(path.display().to_string()));
        }

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&full).await?;
        while let Some(entry) = reader.next_entry().await? {
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_dir() {
                FileKind::Directory
            } else {
                FileKind::File
            };
            entries.push(DirEntry {
                path: path.join(entry.file_name()),
                kind,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn kind(&self, path: &Path) -> Result<Option<FileKind>, FsError> {
        let full = self.resolve(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => Ok(Some(FileKind::Directory)),
            Ok(_) => Ok(Some(FileKind::File)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// In-memory file system
// ============================================================================

#[derive(Debug, Clone)]
enum MemEntry {
    File(String),
    Directory,
}

/// Purely in-memory file system, used for deterministic runs and tests.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    entries: RwLock<BTreeMap<PathBuf, MemEntry>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a file system from `(path, content)` pairs. Parent directories
    /// are created implicitly.
    pub fn with_files<I, P, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, S)>,
        P: Into<PathBuf>,
        S: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (path, content) in files {
            let path = path.into();
            insert_parents(&mut map, &path);
            map.insert(path, MemEntry::File(content.into()));
        }
        Self {
            entries: RwLock::new(map),
        }
    }

    /// Every file currently stored, with content.
    pub async fn files(&self) -> BTreeMap<PathBuf, String> {
        self.entries
            .read()
            .await
            .iter()
            .filter_map(|(path, entry)| match entry {
                MemEntry::File(content) => Some((path.clone(), content.clone())),
                MemEntry::Directory => None,
            })
            .collect()
    }
}

fn insert_parents(map: &mut BTreeMap<PathBuf, MemEntry>, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir.as_os_str().is_empty() {
            break;
        }
        map.entry(dir.to_path_buf()).or_insert(MemEntry::Directory);
        current = dir.parent();
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn read(&self, path: &Path) -> Result<String, FsError> {
        check_relative(path)?;
        match self.entries.read().await.get(path) {
            Some(MemEntry::File(content)) => Ok(content.clone()),
            Some(MemEntry::Directory) => Err(FsError::Io(format!("{} is a directory", path.display()))),
            None => Err(FsError::NotFound(path.display().to_string())),
        }
    }

    async fn write(&self, path: &Path, content: &str) -> Result<(), FsError> {
        check_relative(path)?;
        let mut entries = self.entries.write().await;
        if let Some(MemEntry::Directory) = entries.get(path) {
            return Err(FsError::Io(format!("{} is a directory", path.display())));
        }
        insert_parents(&mut entries, path);
        entries.insert(path.to_path_buf(), MemEntry::File(content.to_string()));
        Ok(())
    }

    async fn create(&self, path: &Path, kind: FileKind) -> Result<(), FsError> {
        check_relative(path)?;
        let mut entries = self.entries.write().await;
        match (entries.get(path), kind) {
            (Some(MemEntry::File(_)), FileKind::File) => return Ok(()),
            (Some(MemEntry::Directory), FileKind::Directory) => return Ok(()),
            (Some(_), _) => return Err(FsError::AlreadyExists(path.display().to_string())),
            (None, _) => {}
        }
        insert_parents(&mut entries, path);
        let entry = match kind {
            FileKind::File => MemEntry::File(String::new()),
            FileKind::Directory => MemEntry::Directory,
        };
        entries.insert(path.to_path_buf(), entry);
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<(), FsError> {
        check_relative(path)?;
        if path.as_os_str().is_empty() {
            return Err(FsError::PermissionDenied("refusing to delete the project root".to_string()));
        }
        let mut entries = self.entries.write().await;
        if entries.remove(path).is_none() {
            return Err(FsError::NotFound(path.display().to_string()));
        }
        entries.retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    async fn list(&self, path: &Path) -> Result<Vec<DirEntry>, FsError> {
        check_relative(path)?;
        let entries = self.entries.read().await;
        if !path.as_os_str().is_empty() {
            match entries.get(path) {
                Some(MemEntry::Directory) => {}
                Some(MemEntry::File(_)) => {
                    return Err(FsError::NotADirectory(path.display().to_string()));
                }
                None => return Err(FsError::NotFound(path.display().to_string())),
            }
        }
        Ok(entries
            .iter()
            .filter(|(p, _)| p.parent() == Some(path))
            .map(|(p, entry)| DirEntry {
                path: p.clone(),
                kind: match entry {
                    MemEntry::File(_) => FileKind::File,
                    MemEntry::Directory => FileKind::Directory,
                },
            })
            .collect())
    }

    async fn kind(&self, path: &Path) -> Result<Option<FileKind>, FsError> {
        check_relative(path)?;
        if path.as_os_str().is_empty() {
            return Ok(Some(FileKind::Directory));
        }
        Ok(self.entries.read().await.get(path).map(|entry| match entry {
            MemEntry::File(_) => FileKind::File,
            MemEntry::Directory => FileKind::Directory,
        }))
    }
}
