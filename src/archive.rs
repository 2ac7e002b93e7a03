//! Unpacking submitted zip archives into a deployment directory.
//!
//! Every entry name is checked before anything is written, so an archive
//! carrying a traversal entry is rejected without creating the target.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zip::ZipArchive;

use crate::config::ExtractLimits;
use crate::error::ExtractError;

#[derive(Debug)]
struct PlannedEntry {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
}

/// Unpack `archive` into `target`, which must not exist yet.
///
/// Returns the sorted top-level names that were extracted. On any error
/// after `target` was created, it is removed again.
pub fn extract(
    archive: &[u8],
    target: &Path,
    limits: ExtractLimits,
) -> Result<Vec<String>, ExtractError> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;
    let entries = plan_entries(&mut zip, limits)?;

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::create_dir(target) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(ExtractError::TargetExists(target.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    }

    if let Err(e) = write_entries(&mut zip, &entries, target, limits) {
        warn!(target = %target.display(), error = %e, "extraction failed, removing directory");
        let _ = remove_tree(target);
        return Err(e);
    }

    let top_level: BTreeSet<String> = entries
        .iter()
        .filter_map(|e| e.relative.components().next())
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    debug!(target = %target.display(), entries = entries.len(), "archive extracted");
    Ok(top_level.into_iter().collect())
}

fn plan_entries(
    zip: &mut ZipArchive<Cursor<&[u8]>>,
    limits: ExtractLimits,
) -> Result<Vec<PlannedEntry>, ExtractError> {
    if zip.len() > limits.max_entries {
        return Err(ExtractError::InvalidArchive(format!(
            "{} entries exceeds the limit of {}",
            zip.len(),
            limits.max_entries
        )));
    }

    let mut declared_total: u64 = 0;
    let mut planned = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let file = zip.by_index_raw(index)?;
        let name = file.name().to_owned();
        let relative = safe_relative_path(&name)
            .ok_or_else(|| ExtractError::PathEscape(name.clone()))?;
        // Second opinion from the zip crate's own containment check.
        if file.enclosed_name().is_none() {
            return Err(ExtractError::PathEscape(name));
        }
        declared_total = declared_total.saturating_add(file.size());
        if declared_total > limits.max_total_bytes {
            return Err(ExtractError::InvalidArchive(format!(
                "uncompressed size exceeds the limit of {} bytes",
                limits.max_total_bytes
            )));
        }
        if relative.as_os_str().is_empty() {
            continue;
        }
        planned.push(PlannedEntry {
            index,
            relative,
            is_dir: file.is_dir(),
        });
    }
    Ok(planned)
}

/// Relative path for an entry name, or `None` if it could land outside the
/// extraction root.
fn safe_relative_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') || normalized.contains('\0') {
        return None;
    }
    let mut path = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            // Drive prefixes such as `C:`.
            p if p.len() >= 2 && p.as_bytes()[1] == b':' && path.as_os_str().is_empty() => {
                return None
            }
            p => path.push(p),
        }
    }
    Some(path)
}

fn write_entries(
    zip: &mut ZipArchive<Cursor<&[u8]>>,
    entries: &[PlannedEntry],
    target: &Path,
    limits: ExtractLimits,
) -> Result<(), ExtractError> {
    let mut budget = limits.max_total_bytes;
    for entry in entries {
        let dest = target.join(&entry.relative);
        if entry.is_dir {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = zip.by_index(entry.index)?;
        // Declared sizes can lie; cap what is actually inflated.
        let mut limited = file.take(budget.saturating_add(1));
        let mut out = fs::File::create(&dest)?;
        let written = io::copy(&mut limited, &mut out)?;
        if written > budget {
            return Err(ExtractError::InvalidArchive(format!(
                "uncompressed size exceeds the limit of {} bytes",
                limits.max_total_bytes
            )));
        }
        budget -= written;
    }
    Ok(())
}

/// Remove a directory tree, treating "already gone" as success.
pub fn remove_tree(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        if name.ends_with('/') {
            writer
                .add_directory(*name, SimpleFileOptions::default())
                .expect("add directory");
        } else {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start file");
            writer.write_all(contents.as_bytes()).expect("write entry");
        }
    }
    writer.finish().expect("finish zip").into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[test]
    fn extracts_nested_entries() {
        let dir = scratch();
        let target = dir.path().join("owner").join("bot");
        let zip = build_zip(&[
            ("main.py", "print('hi')"),
            ("lib/", ""),
            ("lib/util.py", "X = 1"),
            ("requirements.txt", "requests\n"),
        ]);

        let top = extract(&zip, &target, ExtractLimits::default()).expect("extract");

        assert_eq!(top, vec!["lib", "main.py", "requirements.txt"]);
        assert_eq!(fs::read(target.join("lib/util.py")).unwrap(), b"X = 1");
        assert_eq!(fs::read(target.join("main.py")).unwrap(), b"print('hi')");
    }

    #[test]
    fn garbage_bytes_are_invalid_archive() {
        let dir = scratch();
        let target = dir.path().join("bot");

        let err = extract(b"definitely not a zip", &target, ExtractLimits::default())
            .expect_err("garbage must fail");

        assert!(matches!(err, ExtractError::InvalidArchive(_)), "{err:?}");
        assert!(!target.exists());
    }

    #[test]
    fn traversal_entry_leaves_nothing_behind() {
        let dir = scratch();
        let target = dir.path().join("bot");
        let zip = build_zip(&[("main.py", "ok"), ("../escaped.py", "evil")]);

        let err = extract(&zip, &target, ExtractLimits::default()).expect_err("must reject");

        assert!(matches!(err, ExtractError::PathEscape(ref n) if n == "../escaped.py"));
        assert!(!target.exists());
        assert!(!dir.path().join("escaped.py").exists());
    }

    #[test]
    fn absolute_entry_is_rejected() {
        let dir = scratch();
        let target = dir.path().join("bot");
        let zip = build_zip(&[("/tmp/abs.py", "evil")]);

        let err = extract(&zip, &target, ExtractLimits::default()).expect_err("must reject");

        assert!(matches!(err, ExtractError::PathEscape(_)));
        assert!(!target.exists());
    }

    #[test]
    fn existing_target_is_reported() {
        let dir = scratch();
        let target = dir.path().join("bot");
        fs::create_dir(&target).unwrap();
        let zip = build_zip(&[("main.py", "ok")]);

        let err = extract(&zip, &target, ExtractLimits::default()).expect_err("must refuse");

        assert!(matches!(err, ExtractError::TargetExists(_)));
    }

    #[test]
    fn size_limit_rejects_before_writing() {
        let dir = scratch();
        let target = dir.path().join("bot");
        let zip = build_zip(&[("a.txt", &"a".repeat(64)), ("b.txt", &"b".repeat(64))]);
        let limits = ExtractLimits {
            max_entries: 10,
            max_total_bytes: 100,
        };

        let err = extract(&zip, &target, limits).expect_err("too large");

        assert!(matches!(err, ExtractError::InvalidArchive(_)));
        assert!(!target.exists());
    }

    #[test]
    fn entry_count_limit() {
        let dir = scratch();
        let zip = build_zip(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let limits = ExtractLimits {
            max_entries: 2,
            max_total_bytes: 1024,
        };

        let err = extract(&zip, &dir.path().join("bot"), limits).expect_err("too many");

        assert!(matches!(err, ExtractError::InvalidArchive(_)));
    }

    #[test]
    fn relative_path_rules() {
        assert_eq!(safe_relative_path("a/./b.py"), Some(PathBuf::from("a/b.py")));
        assert_eq!(safe_relative_path("dir/"), Some(PathBuf::from("dir")));
        assert_eq!(safe_relative_path("a/../../b"), None);
        assert_eq!(safe_relative_path("..\\b"), None);
        assert_eq!(safe_relative_path("C:/windows"), None);
        assert_eq!(safe_relative_path("/etc/passwd"), None);
    }

    #[test]
    fn remove_tree_tolerates_missing() {
        let dir = scratch();
        let gone = dir.path().join("never-created");
        assert!(!remove_tree(&gone).unwrap());
        fs::create_dir(&gone).unwrap();
        assert!(remove_tree(&gone).unwrap());
    }
}
