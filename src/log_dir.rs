//! Log directory management for deployment runs.
//!
//! A log directory gets created per run, with a `time_tag` sentinel file
//! recording when the run started. Once the run is over, the directory is
//! renamed into a results directory under a name derived from that tag.
//! A numeric suffix keeps runs from the same minute apart.

use anyhow::{Context, Result};
use chrono::Local;
use slog_scope::debug;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the sentinel file that records a log directory's time tag.
pub const TIME_TAG_FILE: &str = "time_tag";

/// Renders the timestamp tag that directories get named by.
pub fn time_tag() -> String {
    Local::now().format("%Y%m%d-%H%M").to_string()
}

/// Builds a fresh directory name under `base_dir` from `path_spec`.
///
/// The last component of `path_spec` gets prefixed with the date tag; a
/// trailing slash (or an empty `path_spec`) makes the tag itself the last
/// component. When the resulting path already exists, a numeric suffix
/// counts up until a free name is found. The parent directory is created
/// along the way, the returned path itself is not.
pub fn unique_dirname(base_dir: &Path, path_spec: &str, date_tag: Option<&str>) -> Result<PathBuf> {
    let tag = match date_tag {
        Some(tag) => tag.to_string(),
        None => time_tag(),
    };
    let (dirname, basename) = split_spec(path_spec);
    let leaf = if basename.is_empty() {
        tag
    } else {
        format!("{}-{}", tag, basename)
    };
    let full = base_dir.join(dirname).join(leaf);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating parent directory {:?}", parent))?;
    }
    let mut candidate = full.clone();
    let mut suffix = 0;
    while candidate.exists() {
        suffix += 1;
        candidate = PathBuf::from(format!("{}.{}", full.display(), suffix));
    }
    Ok(candidate)
}

fn split_spec(path_spec: &str) -> (&str, &str) {
    if path_spec.ends_with('/') {
        return (path_spec.trim_end_matches('/'), "");
    }
    match path_spec.rfind('/') {
        Some(idx) => (&path_spec[..idx], &path_spec[idx + 1..]),
        None => ("", path_spec),
    }
}

/// Creates `log_dir` and drops the `time_tag` sentinel into it. Creating
/// an existing directory just refreshes the sentinel.
pub fn create_log_dir(log_dir: &Path, time_tag: &str) -> Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {:?}", log_dir))?;
    fs::write(log_dir.join(TIME_TAG_FILE), time_tag)
        .with_context(|| format!("writing the time tag in {:?}", log_dir))?;
    debug!("created log directory"; "dir" => ?log_dir, "time_tag" => time_tag);
    Ok(())
}

/// Renames `log_dir` into `results_dir`, named by the time tag it was
/// created under.
pub fn move_log_dir(log_dir: &Path, results_dir: &Path) -> Result<()> {
    let tag_file = log_dir.join(TIME_TAG_FILE);
    let date_tag = fs::read_to_string(&tag_file)
        .with_context(|| format!("reading the time tag {:?}", tag_file))?;
    let target = unique_dirname(results_dir, "", Some(date_tag.trim()))?;
    fs::rename(log_dir, &target)
        .with_context(|| format!("moving {:?} to {:?}", log_dir, target))?;
    debug!("moved log directory"; "from" => ?log_dir, "to" => ?&target);
    Ok(())
}
