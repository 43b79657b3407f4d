//! # Static Mounts
//!
//! Resolves request paths against path-prefix → directory mounts. Mounts are
//! not pre-expanded into routes: every request is checked against the
//! filesystem collaborator at dispatch time, and positive results are cached
//! by the dispatcher alongside route resolutions.
//!
//! The filesystem itself sits behind the [`FileSystem`] trait so tests (and
//! embedders with virtual assets) can substitute their own.

use crate::route::StaticMount;
use futures_util::future::BoxFuture;
use hyper::body::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Minimal file metadata the resolver needs
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    /// Whether the path is a directory
    pub is_dir: bool,
    /// File length in bytes
    pub len: u64,
}

/// Filesystem collaborator consumed by the static-mount resolution step
pub trait FileSystem: Send + Sync {
    /// Whether a path exists
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool>;
    /// Metadata for a path
    fn metadata<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, std::io::Result<FileInfo>>;
    /// Full contents of a file
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, std::io::Result<Bytes>>;
}

/// Real filesystem, via `tokio::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

impl FileSystem for TokioFileSystem {
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool> {
        Box::pin(async move { tokio::fs::try_exists(path).await.unwrap_or(false) })
    }

    fn metadata<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, std::io::Result<FileInfo>> {
        Box::pin(async move {
            let meta = tokio::fs::metadata(path).await?;
            Ok(FileInfo {
                is_dir: meta.is_dir(),
                len: meta.len(),
            })
        })
    }

    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, std::io::Result<Bytes>> {
        Box::pin(async move { tokio::fs::read(path).await.map(Bytes::from) })
    }
}

/// Content-type guesser collaborator (`None` means no header is set)
pub type ContentTypeGuess = Arc<dyn Fn(&Path) -> Option<&'static str> + Send + Sync>;

/// Default guesser covering the handful of types the dashboard-free core
/// actually serves; embedders plug in their own table for more
#[must_use]
pub fn default_content_type(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => Some("text/html; charset=utf-8"),
        Some("css") => Some("text/css"),
        Some("js") => Some("text/javascript"),
        Some("json") => Some("application/json"),
        Some("txt") => Some("text/plain; charset=utf-8"),
        Some("svg") => Some("image/svg+xml"),
        Some("png") => Some("image/png"),
        Some("jpg" | "jpeg") => Some("image/jpeg"),
        Some("wasm") => Some("application/wasm"),
        _ => Some("application/octet-stream"),
    }
}

/// A positive static resolution: the mount that matched and the file to serve
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    /// The mount the path fell under
    pub mount: Arc<StaticMount>,
    /// Absolute file path to serve
    pub file: PathBuf,
}

/// Resolve a request path against the mounts, longest prefix first
///
/// Applies the mount options: a directory serves its `index.html`, and with
/// `strip_html` a missing `/page` falls back to `page.html`. Paths escaping
/// the mount directory (`..` segments) never resolve.
pub async fn resolve(
    fs: &dyn FileSystem,
    mounts: &[Arc<StaticMount>],
    path: &str,
) -> Option<ResolvedFile> {
    let mut candidates: Vec<(&Arc<StaticMount>, String)> = mounts
        .iter()
        .filter_map(|m| m.strip(path).map(|rest| (m, rest)))
        .collect();
    candidates.sort_by_key(|(m, _)| std::cmp::Reverse(m.prefix.len()));

    for (mount, rest) in candidates {
        if rest.split('/').any(|seg| seg == "..") {
            continue;
        }
        let candidate = mount.directory.join(&rest);

        if fs.exists(&candidate).await {
            let is_dir = fs.metadata(&candidate).await.map(|m| m.is_dir).unwrap_or(false);
            if !is_dir {
                return Some(ResolvedFile {
                    mount: Arc::clone(mount),
                    file: candidate,
                });
            }
            let index = candidate.join("index.html");
            if fs.exists(&index).await {
                return Some(ResolvedFile {
                    mount: Arc::clone(mount),
                    file: index,
                });
            }
            continue;
        }

        if mount.options.strip_html {
            let mut with_html = candidate.into_os_string();
            with_html.push(".html");
            let with_html = PathBuf::from(with_html);
            if fs.exists(&with_html).await {
                return Some(ResolvedFile {
                    mount: Arc::clone(mount),
                    file: with_html,
                });
            }
        }
    }
    None
}
