use crate::config::NameFilter;
use crate::types::CandidateFile;
use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Lowercase ".ext" of a path, "" when it has none.
fn dotted_extension(p: &Path) -> String {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| format!(".{}", s.to_lowercase()))
        .unwrap_or_default()
}

fn file_name_lower(p: &Path) -> String {
    p.file_name()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

pub fn absolute(p: &Path) -> PathBuf {
    std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf())
}

/// Secondary filter: an extension with a name rule needs the prefix,
/// everything else passes.
pub fn passes_name_filter(p: &Path, filters: &[NameFilter]) -> bool {
    let ext = dotted_extension(p);
    let name = file_name_lower(p);
    filters
        .iter()
        .filter(|f| f.extension == ext)
        .all(|f| name.starts_with(&f.prefix.to_lowercase()))
}

fn walker(root: &Path, recursive: bool) -> WalkDir {
    let w = WalkDir::new(root).min_depth(1);
    if recursive { w } else { w.max_depth(1) }
}

/// Tất cả file có đuôi `ext` dưới root. Root lỗi => Err cho cả extension;
/// thư mục con không đọc được thì bỏ qua thư mục đó.
fn list_extension(root: &Path, recursive: bool, ext: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in walker(root, recursive) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.path().is_some_and(|p| p != root) => {
                warn!("Cannot read {}, skipping: {}", e.path().unwrap_or(root).display(), e);
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("walk {} for {}", root.display(), ext)),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if dotted_extension(entry.path()) == ext {
            out.push(absolute(entry.path()));
        }
    }
    Ok(out)
}

/// Discover candidate files: union over extensions, deduplicated,
/// sorted by path string.
pub fn discover_files(
    root: &Path,
    recursive: bool,
    extensions: &[String],
    filters: &[NameFilter],
) -> Vec<PathBuf> {
    collect_extensions(extensions, filters, |ext| list_extension(root, recursive, ext))
}

fn collect_extensions<F>(extensions: &[String], filters: &[NameFilter], mut list: F) -> Vec<PathBuf>
where
    F: FnMut(&str) -> Result<Vec<PathBuf>>,
{
    let mut all: Vec<PathBuf> = Vec::new();

    for ext in extensions {
        match list(ext) {
            Ok(files) => {
                let total = files.len();
                let kept: Vec<PathBuf> = files
                    .into_iter()
                    .filter(|p| passes_name_filter(p, filters))
                    .collect();

                match filters.iter().find(|f| &f.extension == ext) {
                    Some(f) => info!(
                        "Found {} {} files starting with '{}' (filtered from {} total)",
                        kept.len(),
                        ext,
                        f.prefix,
                        total
                    ),
                    None => info!("Found {} {} files", kept.len(), ext),
                }
                all.extend(kept);
            }
            Err(e) => {
                warn!("Error searching for {} files, skipping: {:#}", ext, e);
            }
        }
    }

    all.sort_by(|a, b| a.to_string_lossy().cmp(&b.to_string_lossy()));
    all.dedup();

    info!("TOTAL FILES TO PROCESS: {}", all.len());
    all
}

/// Stat a candidate right before a worker touches it.
pub fn stat_candidate(p: &Path) -> std::io::Result<CandidateFile> {
    let meta = fs::metadata(p)?;
    Ok(CandidateFile {
        path: p.to_path_buf(),
        extension: dotted_extension(p),
        size: meta.len(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchResult {
    Resolved(PathBuf),
    Ambiguous(Vec<PathBuf>),
    NotFound,
}

/// Recursive lookup of `term` (file stem, case-insensitive) among the
/// recognised extensions. Ambiguity is left to the caller.
pub fn smart_find(root: &Path, term: &str, extensions: &[String]) -> Result<SearchResult> {
    if !root.is_dir() {
        return Err(anyhow!("Directory does not exist: {}", root.display()));
    }

    let term = term.to_lowercase();
    let mut matches: Vec<PathBuf> = Vec::new();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!("smart search: skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let p = entry.path();
        let stem = p
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if stem == term && extensions.contains(&dotted_extension(p)) {
            matches.push(absolute(p));
        }
    }

    matches.sort_by(|a, b| a.to_string_lossy().cmp(&b.to_string_lossy()));

    Ok(match matches.len() {
        0 => SearchResult::NotFound,
        1 => SearchResult::Resolved(matches.remove(0)),
        _ => SearchResult::Ambiguous(matches),
    })
}

/// 1-indexed choice into the ambiguous list.
pub fn pick_candidate(candidates: &[PathBuf], choice: usize) -> Option<PathBuf> {
    if choice >= 1 && choice <= candidates.len() {
        Some(candidates[choice - 1].clone())
    } else {
        None
    }
}
