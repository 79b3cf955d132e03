//! File resource: resolves a request URL to a path under the document
//! root and opens it for streaming.
//!
//! Grounded on `get_handler.rs`'s directory/default-file/`File::open`
//! wiring, with the traversal check borrowed from `delete_handler.rs`'s
//! canonicalize-based comparison (Open Question #2: reject `..`).

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::LisoError;
use crate::http::mime_type_for;

pub struct Resource {
    pub file: File,
    pub len: u64,
    pub mime: &'static str,
    pub modified: std::time::SystemTime,
}

/// Resolve `url` against `www_folder`, rejecting any path containing a
/// `..` segment. The query string (if any) is left attached to the path
/// exactly as it appeared on the wire, matching the original server's
/// (surprising but preserved) behavior of stat-ing the raw URI.
pub fn resolve(www_folder: &Path, url: &str) -> Result<PathBuf, LisoError> {
    if url.split('/').any(|segment| segment == "..") {
        return Err(LisoError::LoadFailed(format!("path traversal rejected: {url}")));
    }

    let relative = url.trim_start_matches('/');
    let mut path = www_folder.join(relative);

    if path.is_dir() {
        path = path.join("index.html");
    }

    Ok(path)
}

/// Open a resolved path, returning the metadata needed to build a
/// `200 OK` response (Content-Length, MIME type, Last-Modified).
pub fn open(path: &Path) -> Result<Resource, LisoError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => LisoError::LoadFailed(format!("not found: {}", path.display())),
        std::io::ErrorKind::PermissionDenied => {
            LisoError::LoadFailed(format!("permission denied: {}", path.display()))
        }
        _ => LisoError::Io(e),
    })?;

    let metadata = file.metadata().map_err(LisoError::Io)?;
    if metadata.is_dir() {
        return Err(LisoError::LoadFailed(format!("is a directory: {}", path.display())));
    }

    Ok(Resource {
        len: metadata.len(),
        mime: mime_type_for(path),
        modified: metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        file,
    })
}

/// Read at most `DEFAULT_CHUNK` bytes at a time when streaming a file
/// across the write side of a connection.
pub const DEFAULT_CHUNK: usize = 8 * 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_dotdot_segments() {
        let root = Path::new("/var/www");
        assert!(resolve(root, "/../etc/passwd").is_err());
        assert!(resolve(root, "/a/../../b").is_err());
    }

    #[test]
    fn resolves_plain_path_under_root() {
        let root = Path::new("/var/www");
        let resolved = resolve(root, "/index.html").unwrap();
        assert_eq!(resolved, PathBuf::from("/var/www/index.html"));
    }

    #[test]
    fn open_reports_not_found_as_load_failed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.html");
        match open(&missing) {
            Err(LisoError::LoadFailed(_)) => {}
            other => panic!("expected LoadFailed, got {other:?}"),
        }
    }

    #[test]
    fn open_reads_metadata_for_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.html");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"<html></html>").unwrap();
        let resource = open(&path).unwrap();
        assert_eq!(resource.len, 13);
        assert_eq!(resource.mime, "text/html");
    }
}
