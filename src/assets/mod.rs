//! On-demand transpiled sources with HTTP validators.
//!
//! Single files are cached by on-disk identity (mtime and size) and carry a
//! weak ETag derived from it. Entry points (`*-main`, `*-tests`) pull in an
//! open-ended set of files, so they are bundled on every request and carry a
//! strong ETag over the bundled bytes instead.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::AssetError;

/// Probed first for an extension-less logical path.
pub const PREFERRED_EXTENSIONS: &[&str] = &["ts", "tsx"];
/// Probed when no preferred source exists.
pub const SECONDARY_EXTENSIONS: &[&str] = &["js", "jsx", "mjs"];
/// File stems with these suffixes are bundle entry points.
pub const ENTRY_POINT_SUFFIXES: &[&str] = &["-main", "-tests"];

/// Already-JS sources that are served without transformation.
const PASSTHROUGH_EXTENSIONS: &[&str] = &["js", "mjs"];

/// Source-to-JS transformation and bundling.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, path: &Path, source: &str) -> anyhow::Result<String>;

    async fn bundle(&self, entry: &Path) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub content: Arc<str>,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// The client's validator still matches; send 304 without a body.
    NotModified { etag: String },
    Fresh(Asset),
}

struct CacheEntry {
    source: PathBuf,
    mtime: SystemTime,
    size: u64,
    etag: String,
    content: Arc<str>,
}

pub struct AssetCache {
    root: PathBuf,
    transformer: Arc<dyn Transformer>,
    entries: Mutex<HashMap<String, CacheEntry>>,
    recomputed: AtomicUsize,
}

impl AssetCache {
    pub fn new(root: impl Into<PathBuf>, transformer: Arc<dyn Transformer>) -> Self {
        Self {
            root: root.into(),
            transformer,
            entries: Mutex::new(HashMap::new()),
            recomputed: AtomicUsize::new(0),
        }
    }

    /// How many single-file entries have been (re)computed.
    pub fn recompute_count(&self) -> usize {
        self.recomputed.load(Ordering::Relaxed)
    }

    /// Resolve a request path such as `joist/js/Sim.js` against the source
    /// tree. `if_none_match` is the raw request header, if any.
    pub async fn resolve(
        &self,
        request_path: &str,
        if_none_match: Option<&str>,
    ) -> Result<Resolved, AssetError> {
        let logical = logical_path(request_path)?;
        let (source, metadata) = self.find_source(&logical).await?;

        if is_entry_point(&logical) {
            self.resolve_bundle(&source, &metadata, if_none_match).await
        } else {
            self.resolve_single(&logical, &source, &metadata, if_none_match)
                .await
        }
    }

    async fn find_source(&self, logical: &str) -> Result<(PathBuf, std::fs::Metadata), AssetError> {
        for ext in PREFERRED_EXTENSIONS.iter().chain(SECONDARY_EXTENSIONS) {
            let candidate = self.root.join(format!("{}.{}", logical, ext));
            match tokio::fs::metadata(&candidate).await {
                Ok(metadata) if metadata.is_file() => return Ok((candidate, metadata)),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(AssetError::Io {
                        path: candidate,
                        source,
                    });
                }
            }
        }
        Err(AssetError::NotFound {
            path: logical.to_string(),
        })
    }

    async fn resolve_single(
        &self,
        logical: &str,
        source: &Path,
        metadata: &std::fs::Metadata,
        if_none_match: Option<&str>,
    ) -> Result<Resolved, AssetError> {
        let mtime = modified(source, metadata)?;
        let size = metadata.len();
        let etag = weak_etag(size, mtime);
        if if_none_match.is_some_and(|header| etag_matches(header, &etag)) {
            return Ok(Resolved::NotModified { etag });
        }
        let last_modified = Some(http_time(mtime));

        let cached = self
            .lock()
            .get(logical)
            .filter(|entry| {
                entry.source.as_path() == source && entry.mtime == mtime && entry.size == size
            })
            .map(|entry| (Arc::clone(&entry.content), entry.etag.clone()));
        if let Some((content, etag)) = cached {
            return Ok(Resolved::Fresh(Asset {
                content,
                etag,
                last_modified,
            }));
        }

        let text = tokio::fs::read_to_string(source)
            .await
            .map_err(|e| AssetError::Io {
                path: source.to_path_buf(),
                source: e,
            })?;
        let content: Arc<str> = if is_passthrough(source) {
            text.into()
        } else {
            self.transformer
                .transform(source, &text)
                .await
                .map_err(|e| AssetError::TransformFailed {
                    path: source.to_path_buf(),
                    source: e,
                })?
                .into()
        };
        self.recomputed.fetch_add(1, Ordering::Relaxed);
        debug!(path = %source.display(), size, "transformed source");

        self.lock().insert(
            logical.to_string(),
            CacheEntry {
                source: source.to_path_buf(),
                mtime,
                size,
                etag: etag.clone(),
                content: Arc::clone(&content),
            },
        );
        Ok(Resolved::Fresh(Asset {
            content,
            etag,
            last_modified,
        }))
    }

    async fn resolve_bundle(
        &self,
        entry: &Path,
        metadata: &std::fs::Metadata,
        if_none_match: Option<&str>,
    ) -> Result<Resolved, AssetError> {
        let bundled = self
            .transformer
            .bundle(entry)
            .await
            .map_err(|e| AssetError::TransformFailed {
                path: entry.to_path_buf(),
                source: e,
            })?;
        let etag = strong_etag(bundled.as_bytes());
        debug!(entry = %entry.display(), bytes = bundled.len(), "bundled entry point");

        if if_none_match.is_some_and(|header| etag_matches(header, &etag)) {
            return Ok(Resolved::NotModified { etag });
        }
        Ok(Resolved::Fresh(Asset {
            content: bundled.into(),
            etag,
            last_modified: metadata.modified().ok().map(http_time),
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Strip the leading slash and `.js` extension, rejecting anything that
/// could escape the source root.
fn logical_path(request_path: &str) -> Result<String, AssetError> {
    let trimmed = request_path.trim_start_matches('/');
    let logical = trimmed.strip_suffix(".js").unwrap_or(trimmed);
    let valid = !logical.is_empty()
        && Path::new(logical)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(AssetError::InvalidPath {
            path: request_path.to_string(),
        });
    }
    Ok(logical.to_string())
}

fn is_entry_point(logical: &str) -> bool {
    ENTRY_POINT_SUFFIXES
        .iter()
        .any(|suffix| logical.ends_with(suffix))
}

fn is_passthrough(source: &Path) -> bool {
    source
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PASSTHROUGH_EXTENSIONS.contains(&ext))
}

fn modified(path: &Path, metadata: &std::fs::Metadata) -> Result<SystemTime, AssetError> {
    metadata.modified().map_err(|source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// `W/"<size hex>-<mtime ms hex>"`
pub fn weak_etag(size: u64, mtime: SystemTime) -> String {
    let millis = mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("W/\"{:x}-{:x}\"", size, millis)
}

/// Quoted hex SHA-256 of the content.
pub fn strong_etag(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("\"{}\"", hex)
}

/// Weak comparison of an `If-None-Match` header against `etag`.
pub fn etag_matches(header: &str, etag: &str) -> bool {
    let opaque = |tag: &str| tag.trim().trim_start_matches("W/").to_string();
    let wanted = opaque(etag);
    header
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || opaque(candidate) == wanted)
}

fn http_time(time: SystemTime) -> DateTime<Utc> {
    let time: DateTime<Utc> = time.into();
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}
