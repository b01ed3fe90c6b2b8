//! Filesystem document loading.
//!
//! Reads plain-text and markdown files into [`NewDocument`]s and adds them
//! to a collection. A directory is walked recursively and filtered with
//! the `[ingest]` include/exclude globs (`.git`, `target` and
//! `node_modules` are always skipped); a single file is loaded as is.
//! Bytes that are not valid UTF-8 are replaced, never rejected.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sqlx::SqlitePool;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::models::NewDocument;
use crate::store;

/// Load a file, or every matching file under a directory, sorted by
/// relative path.
pub fn load_path(root: &Path, config: &IngestConfig) -> Result<Vec<NewDocument>> {
    if !root.exists() {
        bail!("Ingest path does not exist: {}", root.display());
    }
    if root.is_file() {
        return Ok(vec![read_document(root)?]);
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut found = Vec::new();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        found.push((rel_str, read_document(path)?));
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    debug!(root = %root.display(), files = found.len(), "ingest scan complete");

    Ok(found.into_iter().map(|(_, doc)| doc).collect())
}

fn read_document(path: &Path) -> Result<NewDocument> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let body = String::from_utf8_lossy(&bytes).into_owned();

    let title = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(NewDocument {
        title,
        body,
        source_path: Some(path.display().to_string()),
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Load `path` and add the documents to the collection. Returns the new
/// document ids.
pub async fn ingest_path(
    pool: &SqlitePool,
    collection_id: i64,
    path: &Path,
    config: &IngestConfig,
) -> Result<Vec<i64>> {
    let documents = load_path(path, config)?;
    let ids = store::add_documents(pool, collection_id, &documents).await?;
    info!(
        collection_id,
        documents = ids.len(),
        path = %path.display(),
        "documents ingested"
    );
    Ok(ids)
}
