//! Socket Path Policy
//!
//! Decides whether a requested path is a filesystem or abstract-namespace
//! socket, canonicalizes filesystem paths, and prepares the socket file's
//! surroundings before `bind()`.

use std::fs;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::LocalSocketError;
use crate::native::UNIX_PATH_MAX;

/// Owner read/write/search bits required on the socket's parent directory
///
/// `bind()` fails unless the server can write to and search the directory
/// the socket file is created in.
pub const PARENT_DIRECTORY_PERMISSIONS: u32 = 0o700;

/// Whether `path` names an abstract-namespace socket (first byte is NUL)
#[must_use]
pub fn is_abstract_namespace(path: &str) -> bool {
    path.as_bytes().first() == Some(&0)
}

/// Canonical absolute form of a filesystem socket path
///
/// Relative paths are resolved against the current directory, `.` and `..`
/// are removed, and symlinks are resolved for the longest prefix that exists.
/// The non-existent tail (usually the socket file itself) is kept as given.
///
/// # Errors
///
/// Fails if the current directory cannot be read or an existing prefix
/// cannot be resolved.
pub fn canonical_path(path: &str) -> std::io::Result<PathBuf> {
    let requested = Path::new(path);
    let absolute = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        std::env::current_dir()?.join(requested)
    };

    let normalized = normalize_lexically(&absolute);

    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    loop {
        if fs::symlink_metadata(existing).is_ok() {
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut resolved = fs::canonicalize(existing)?;
    for name in tail.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Reject paths whose UTF-8 byte length exceeds `sun_path`
///
/// # Errors
///
/// Returns [`LocalSocketError::PathTooLong`] for paths over 108 bytes.
pub fn validate_path_length(title: &str, path: &str) -> Result<(), LocalSocketError> {
    let len = path.len();
    if len > UNIX_PATH_MAX {
        return Err(LocalSocketError::PathTooLong {
            title: title.to_string(),
            path: path.to_string(),
            len,
        });
    }
    Ok(())
}

/// Create the socket's parent directory, or add missing owner `rwx` bits
///
/// Existing permission bits are never removed.
///
/// # Errors
///
/// Returns [`LocalSocketError::ParentDirectoryFailed`] if the directory cannot
/// be created, is not a directory, or its permissions cannot be updated.
pub fn ensure_parent_directory(title: &str, socket_path: &Path) -> Result<(), LocalSocketError> {
    let Some(parent) = socket_path.parent() else {
        return Ok(());
    };
    let fail = |source: std::io::Error| LocalSocketError::ParentDirectoryFailed {
        title: title.to_string(),
        path: parent.to_path_buf(),
        source,
    };

    match fs::metadata(parent) {
        Ok(meta) if !meta.is_dir() => {
            return Err(fail(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "exists but is not a directory",
            )));
        }
        Ok(meta) => {
            let mode = meta.permissions().mode();
            if mode & PARENT_DIRECTORY_PERMISSIONS != PARENT_DIRECTORY_PERMISSIONS {
                let updated = mode | PARENT_DIRECTORY_PERMISSIONS;
                fs::set_permissions(parent, fs::Permissions::from_mode(updated)).map_err(fail)?;
                debug!(
                    path = ?parent,
                    mode = %format_args!("{updated:o}"),
                    "Set missing socket directory permissions"
                );
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(fail)?;
            let mode = fs::metadata(parent).map_err(fail)?.permissions().mode();
            if mode & PARENT_DIRECTORY_PERMISSIONS != PARENT_DIRECTORY_PERMISSIONS {
                fs::set_permissions(
                    parent,
                    fs::Permissions::from_mode(mode | PARENT_DIRECTORY_PERMISSIONS),
                )
                .map_err(fail)?;
            }
            info!(path = ?parent, "Created socket directory");
        }
        Err(e) => return Err(fail(e)),
    }

    Ok(())
}

/// Delete whatever non-directory entry exists at the socket path
///
/// A missing file is not an error.
///
/// # Errors
///
/// Returns [`LocalSocketError::DeleteSocketFileFailed`] if the path is a
/// directory or the file cannot be removed.
pub fn delete_socket_file(title: &str, socket_path: &Path) -> Result<(), LocalSocketError> {
    let fail = |source: std::io::Error| LocalSocketError::DeleteSocketFileFailed {
        title: title.to_string(),
        path: socket_path.to_path_buf(),
        source,
    };

    let meta = match fs::symlink_metadata(socket_path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(fail(e)),
    };

    if meta.is_dir() {
        return Err(fail(std::io::Error::new(
            std::io::ErrorKind::Other,
            "path is a directory",
        )));
    }
    if !meta.file_type().is_socket() {
        warn!(path = ?socket_path, "Removing non-socket file at socket path");
    }

    match fs::remove_file(socket_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(fail(e)),
    }
}
