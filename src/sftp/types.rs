use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// Raw attributes as reported by the remote file subsystem
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub modified: Option<u64>,
    pub accessed: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Mode bits including the file type (`S_IFMT`) bits
    pub permissions: Option<u32>,
}

/// Remote file/directory entry returned by list operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub filename: String,
    pub path: String,
    /// `ls -l` style line
    pub display: String,
    pub size: u64,
    pub modified: Option<i64>,
    pub accessed: Option<i64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: u32,
    pub is_directory: bool,
    pub is_file: bool,
    pub is_symbolic_link: bool,
}

impl DirectoryEntry {
    pub fn new(path: &str, attrs: FileAttributes) -> Self {
        let filename = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string());
        let permissions = attrs.permissions.unwrap_or(0);
        let kind = permissions & S_IFMT;
        let size = attrs.size.unwrap_or(0);
        let modified = attrs.modified.map(|t| t as i64);

        let display = format!(
            "{} {:>3} {:>5} {:>5} {:>10} {} {}",
            format_mode(permissions),
            1,
            attrs.uid.map(|u| u.to_string()).unwrap_or_else(|| "-".into()),
            attrs.gid.map(|g| g.to_string()).unwrap_or_else(|| "-".into()),
            size,
            format_mtime(modified),
            filename
        );

        Self {
            filename,
            path: path.to_string(),
            display,
            size,
            modified,
            accessed: attrs.accessed.map(|t| t as i64),
            uid: attrs.uid,
            gid: attrs.gid,
            permissions,
            is_directory: kind == S_IFDIR,
            is_file: kind == S_IFREG,
            is_symbolic_link: kind == S_IFLNK,
        }
    }
}

/// Sort: directories first, then by name
pub fn sort_entries(entries: &mut [DirectoryEntry]) {
    entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.filename.to_lowercase().cmp(&b.filename.to_lowercase()),
    });
}

/// Format file permissions as a string like "drwxr-xr-x"
fn format_mode(perms: u32) -> String {
    let mut s = String::with_capacity(10);

    s.push(match perms & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        _ => '-',
    });

    for shift in [6u32, 3, 0] {
        let bits = (perms >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    s
}

fn format_mtime(modified: Option<i64>) -> String {
    modified
        .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|dt| dt.format("%b %d %H:%M").to_string())
        .unwrap_or_else(|| "-".repeat(12))
}

/// Source of the bytes for a put
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PutSource {
    Bytes { contents: Vec<u8> },
    File { local_path: PathBuf },
}

/// One file operation with its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileRequest {
    List {
        path: String,
    },
    Get {
        remote_path: String,
        /// Write to this local file instead of returning the bytes
        #[serde(default)]
        local_path: Option<PathBuf>,
    },
    Put {
        remote_path: String,
        source: PutSource,
    },
    Delete {
        path: String,
    },
    Mkdir {
        path: String,
    },
    Rmdir {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
}

impl FileRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            FileRequest::List { .. } => "list",
            FileRequest::Get { .. } => "get",
            FileRequest::Put { .. } => "put",
            FileRequest::Delete { .. } => "delete",
            FileRequest::Mkdir { .. } => "mkdir",
            FileRequest::Rmdir { .. } => "rmdir",
            FileRequest::Rename { .. } => "rename",
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        match self {
            FileRequest::List { path }
            | FileRequest::Delete { path }
            | FileRequest::Mkdir { path }
            | FileRequest::Rmdir { path } => validate_remote_path(path),
            FileRequest::Get {
                remote_path,
                local_path,
            } => {
                validate_remote_path(remote_path)?;
                if let Some(local) = local_path {
                    validate_local_path(local)?;
                }
                Ok(())
            }
            FileRequest::Put {
                remote_path,
                source,
            } => {
                validate_remote_path(remote_path)?;
                if let PutSource::File { local_path } = source {
                    validate_local_path(local_path)?;
                }
                Ok(())
            }
            FileRequest::Rename { from, to } => {
                validate_remote_path(from)?;
                validate_remote_path(to)?;
                if from == to {
                    return Err(AppError::Validation(
                        "Rename source and destination are the same".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn validate_remote_path(path: &str) -> AppResult<()> {
    if path.trim().is_empty() {
        return Err(AppError::Validation("Remote path must not be empty".to_string()));
    }
    if path.contains('\0') {
        return Err(AppError::Validation("Remote path contains a NUL byte".to_string()));
    }
    Ok(())
}

fn validate_local_path(path: &Path) -> AppResult<()> {
    if path.as_os_str().is_empty() {
        return Err(AppError::Validation("Local path must not be empty".to_string()));
    }
    Ok(())
}

/// File operation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Done | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// Payload of a successful operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationResult {
    Entries { entries: Vec<DirectoryEntry> },
    Bytes { contents: Vec<u8> },
    Saved { local_path: PathBuf, bytes: u64 },
    Written { bytes: u64 },
    Unit,
}

/// Terminal state carried by `sftp.done`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    Done { result: OperationResult },
    Failed { reason: String },
    Cancelled,
}

impl OperationOutcome {
    pub fn status(&self) -> OperationStatus {
        match self {
            OperationOutcome::Done { .. } => OperationStatus::Done,
            OperationOutcome::Failed { .. } => OperationStatus::Failed,
            OperationOutcome::Cancelled => OperationStatus::Cancelled,
        }
    }
}
