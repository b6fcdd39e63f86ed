//! Read-only directory browsing with path validation.
//!
//! Every path is canonicalized before use and must resolve inside one of the
//! configured roots, so `..` components and symlinks cannot escape them.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during directory browsing.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The requested path is outside allowed boundaries.
    #[error("path is outside allowed boundaries: {0}")]
    PathOutsideBoundary(PathBuf),

    /// The requested path does not exist.
    #[error("path does not exist: {0}")]
    PathNotFound(PathBuf),

    /// The requested path is not a directory.
    #[error("path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The requested path is not a regular file.
    #[error("path is not a file: {0}")]
    NotAFile(PathBuf),

    /// The file exceeds the configured read limit.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    File,
    Directory,
    Symlink,
    Other,
}

/// A directory entry with metadata.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryEntry {
    /// Entry name (not full path).
    pub name: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Unix permissions mode.
    pub mode: u32,
    /// Last modified time, seconds since the Unix epoch.
    pub modified: u64,
}

/// A directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub path: PathBuf,
    /// Parent directory, when it is still inside the roots.
    pub parent: Option<PathBuf>,
    pub entries: Vec<DirectoryEntry>,
}

/// Contents of a file read through the browser.
#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub path: PathBuf,
    pub size: u64,
    /// Whether the file is not valid UTF-8 (content is then lossy).
    pub binary: bool,
    pub content: String,
}

/// Directory browser confined to a set of roots.
pub struct DirectoryBrowser {
    /// Canonical roots. Empty means nothing is browsable.
    roots: Vec<PathBuf>,
}

impl DirectoryBrowser {
    /// Create a browser confined to `roots`. Roots that do not exist are skipped.
    pub fn new(roots: Vec<PathBuf>) -> Self {
        let roots = roots
            .into_iter()
            .filter_map(|root| match fs::canonicalize(&root) {
                Ok(canonical) => Some(canonical),
                Err(e) => {
                    tracing::warn!(root = %root.display(), error = %e, "Skipping browse root");
                    None
                }
            })
            .collect();
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Directory listed when the client gives no path.
    pub fn default_path(&self) -> Option<&Path> {
        self.roots.first().map(PathBuf::as_path)
    }

    /// Canonicalizes `path` and checks it against the roots.
    pub fn validate_path(&self, path: &Path) -> Result<PathBuf, BrowserError> {
        let canonical = fs::canonicalize(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BrowserError::PathNotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => {
                BrowserError::PermissionDenied(path.to_path_buf())
            }
            _ => BrowserError::Io(e),
        })?;

        if self.is_inside(&canonical) {
            Ok(canonical)
        } else {
            Err(BrowserError::PathOutsideBoundary(path.to_path_buf()))
        }
    }

    fn is_inside(&self, canonical: &Path) -> bool {
        self.roots.iter().any(|root| canonical.starts_with(root))
    }

    /// List contents of a directory, directories first.
    ///
    /// Hidden entries (starting with '.') are included if `include_hidden` is true.
    pub fn list_directory(&self, path: &Path, include_hidden: bool) -> Result<Listing, BrowserError> {
        let canonical = self.validate_path(path)?;

        let metadata = fs::metadata(&canonical)?;
        if !metadata.is_dir() {
            return Err(BrowserError::NotADirectory(canonical));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&canonical)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !include_hidden && name.starts_with('.') {
                continue;
            }

            // Entries we cannot stat are skipped
            let Ok(link_meta) = fs::symlink_metadata(entry.path()) else {
                continue;
            };

            let entry_type = if link_meta.file_type().is_symlink() {
                EntryType::Symlink
            } else if link_meta.is_dir() {
                EntryType::Directory
            } else if link_meta.is_file() {
                EntryType::File
            } else {
                EntryType::Other
            };

            entries.push(DirectoryEntry {
                name,
                path: entry.path(),
                entry_type,
                size: if link_meta.is_file() { link_meta.len() } else { 0 },
                mode: link_meta.mode(),
                modified: unix_secs(link_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
            });
        }

        entries.sort_by(|a, b| {
            let a_is_dir = a.entry_type == EntryType::Directory;
            let b_is_dir = b.entry_type == EntryType::Directory;
            b_is_dir
                .cmp(&a_is_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        let parent = canonical
            .parent()
            .filter(|p| self.is_inside(p))
            .map(Path::to_path_buf);

        Ok(Listing {
            path: canonical,
            parent,
            entries,
        })
    }

    /// Reads a regular file of at most `max_size` bytes.
    pub fn read_file(&self, path: &Path, max_size: u64) -> Result<FileContent, BrowserError> {
        let canonical = self.validate_path(path)?;

        let metadata = fs::metadata(&canonical)?;
        if !metadata.is_file() {
            return Err(BrowserError::NotAFile(canonical));
        }
        if metadata.len() > max_size {
            return Err(BrowserError::FileTooLarge {
                size: metadata.len(),
                max: max_size,
            });
        }

        let bytes = fs::read(&canonical)?;
        let size = bytes.len() as u64;
        let (content, binary) = match String::from_utf8(bytes) {
            Ok(text) => (text, false),
            Err(e) => (String::from_utf8_lossy(e.as_bytes()).into_owned(), true),
        };

        Ok(FileContent {
            path: canonical,
            size,
            binary,
            content,
        })
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
