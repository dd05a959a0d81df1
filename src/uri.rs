//! Conversion between local paths and LSP `file://` URIs.
//!
//! The language server identifies documents by URI while everything else in
//! the engine works on filesystem paths. `normalize_path` is the single
//! comparison key for paths: case folded on Windows and macOS, verbatim
//! elsewhere. Every path comparison in the engine goes through it.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use url::Url;

/// Convert a local path to a `file://` URI, percent-escaping as needed.
pub fn to_uri(path: &Path) -> String {
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match Url::from_file_path(&abs) {
        Ok(url) => url.to_string(),
        Err(()) => format!("file://{}", abs.display()),
    }
}

/// Convert a URI back to a local path. Non-`file` schemes and unparseable
/// input are returned verbatim so callers can still log or match on them.
pub fn from_uri(uri: &str) -> PathBuf {
    if let Ok(url) = Url::parse(uri) {
        if url.scheme() == "file" {
            if let Ok(path) = url.to_file_path() {
                return path;
            }
        }
    }
    PathBuf::from(uri)
}

/// Canonical comparison key for a path: absolute, and case folded on
/// filesystems that are case-insensitive by default.
pub fn normalize_path(path: &Path) -> PathBuf {
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    if cfg!(any(windows, target_os = "macos")) {
        PathBuf::from(abs.to_string_lossy().to_lowercase())
    } else {
        abs
    }
}

/// Whether the path names a Java source file.
pub fn is_java_file(path: &Path) -> bool {
    path.extension().and_then(OsStr::to_str) == Some("java")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_round_trip() {
        let path = Path::new("/tmp/demo/src/Main.java");
        let uri = to_uri(path);
        assert!(uri.starts_with("file://"));
        assert_eq!(from_uri(&uri), path);
    }

    #[test]
    fn test_uri_escapes_spaces() {
        let path = Path::new("/tmp/my project/App.java");
        let uri = to_uri(path);
        assert!(uri.contains("my%20project"));
        assert_eq!(from_uri(&uri), path);
    }

    #[test]
    fn test_from_uri_foreign_scheme_passthrough() {
        let uri = "jdt://contents/rt.jar/java.lang/Runtime.class";
        assert_eq!(from_uri(uri), PathBuf::from(uri));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_path(Path::new("/tmp/A/B.java"));
        let twice = normalize_path(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_is_java_file() {
        assert!(is_java_file(Path::new("/src/App.java")));
        assert!(!is_java_file(Path::new("/src/App.class")));
        assert!(!is_java_file(Path::new("/src/java")));
    }
}
