//! Bulk ingestion from the filesystem (`ans ingest <path>...`).
//!
//! Each path may be a file or a directory; directories are walked
//! recursively. Files with an unsupported extension are skipped with a
//! warning. Each file becomes one document whose source is its path.
//! Re-running the command over unchanged files replaces them instead of
//! duplicating them; an edited file is stored alongside its earlier
//! version until the knowledge base is cleared.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use crate::error::RagError;
use crate::pipeline::{check_extension, Pipeline};

/// Counters printed at the end of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub files_found: usize,
    pub documents_ingested: usize,
    pub chunks_created: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Expand `paths` into a sorted list of supported files plus the files
/// that were skipped.
pub fn collect_files(paths: &[PathBuf]) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut skipped = Vec::new();

    for root in paths {
        if !root.exists() {
            bail!("Path not found: {}", root.display());
        }
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if check_extension(&path.to_string_lossy()).is_ok() {
                files.push(path);
            } else {
                skipped.push(path);
            }
        }
    }

    files.sort();
    files.dedup();
    skipped.sort();
    Ok((files, skipped))
}

/// Ingest every supported file under `paths`.
///
/// `title` overrides the document title and is only accepted for a single
/// file.
pub async fn ingest_paths(
    pipeline: &Pipeline,
    paths: &[PathBuf],
    title: Option<&str>,
) -> Result<IngestSummary> {
    let (files, skipped) = collect_files(paths)?;
    if title.is_some() && files.len() > 1 {
        bail!("--title can only be used when ingesting a single file");
    }

    let mut summary = IngestSummary {
        files_found: files.len() + skipped.len(),
        skipped: skipped.len(),
        ..Default::default()
    };
    for path in &skipped {
        tracing::warn!(path = %path.display(), "skipping unsupported file");
    }

    for path in &files {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let title = title.map(str::to_string).unwrap_or_else(|| file_name(path));

        match pipeline
            .ingest_file(&path.to_string_lossy(), &bytes, Some(&title))
            .await
        {
            Ok(report) => {
                summary.documents_ingested += 1;
                summary.chunks_created += report.chunks_created;
                println!(
                    "  {} → {} chunks ({:.0} ms)",
                    path.display(),
                    report.chunks_created,
                    report.processing_time_ms
                );
            }
            Err(e @ (RagError::Validation(_) | RagError::UnsupportedFormat(_))) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping file");
                summary.skipped += 1;
            }
            Err(e) => {
                eprintln!("  {} failed: {}", path.display(), e);
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_collect_files_walks_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("a.md"), "# A").unwrap();
        fs::write(nested.join("b.TXT"), "B").unwrap();
        fs::write(nested.join("c.pdf"), "%PDF").unwrap();

        let (files, skipped) = collect_files(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|p| p.ends_with("a.md")));
        assert!(files.iter().any(|p| p.ends_with("nested/b.TXT")));
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].ends_with("nested/c.pdf"));
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_files(&[dir.path().join("missing")]).is_err());
    }
}
