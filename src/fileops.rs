//! File operations with progress reporting and cancellation
//!
//! Long-running, chunked filesystem work: recursive directory copy and zip
//! archive extraction. Both report one progress unit per file/entry through a
//! [`ProgressHandler`], poll its cancellation flag before each unit, and roll
//! back everything they wrote when aborted (cancellation or I/O error). The
//! source archive is deleted only on cancellation so a failed extraction can
//! be retried.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::progress::ProgressHandler;

/// Terminal outcome of a file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Completed,
    Cancelled,
    CorruptArchive,
    Failed,
}

/// Status-bearing result of a file operation. File operations never raise;
/// validation and I/O failures are folded into the report.
#[derive(Debug)]
pub struct OpReport {
    pub status: OpStatus,
    pub message: String,
    /// Units (files or archive entries) processed before the operation ended.
    pub processed: u64,
}

impl OpReport {
    fn completed(message: impl Into<String>, processed: u64) -> Self {
        Self {
            status: OpStatus::Completed,
            message: message.into(),
            processed,
        }
    }

    fn cancelled(message: impl Into<String>, processed: u64) -> Self {
        Self {
            status: OpStatus::Cancelled,
            message: message.into(),
            processed,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: OpStatus::Failed,
            message: message.into(),
            processed: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == OpStatus::Completed
    }
}

/// Path-segment filter for directory copies. When both lists are given the
/// inclusion list takes precedence and the exclusion list is ignored.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl PathFilter {
    pub fn include(segments: &[&str]) -> Self {
        Self {
            include: segments.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn exclude(segments: &[&str]) -> Self {
        Self {
            exclude: segments.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Whether a file at this source-relative path should be copied.
    fn matches(&self, relative: &Path) -> bool {
        if !self.include.is_empty() {
            return self
                .include
                .iter()
                .any(|seg| relative.components().any(|c| c.as_os_str() == seg.as_str()));
        }
        if !self.exclude.is_empty() {
            return !self
                .exclude
                .iter()
                .any(|seg| relative.components().any(|c| c.as_os_str() == seg.as_str()));
        }
        true
    }
}

/// Copy every file under `source` into `target`, preserving relative
/// structure and modification times, reporting one unit per file.
///
/// Checks for cancellation before each file. Any abort (cancel or I/O error)
/// removes the files and directories this call created.
pub fn copy_dir_with_progress(
    source: &Path,
    target: &Path,
    filter: &PathFilter,
    progress: &ProgressHandler,
) -> OpReport {
    let cancel = || progress.should_cancel();
    copy_with_checkpoint(source, target, filter, progress, &cancel)
}

fn copy_with_checkpoint(
    source: &Path,
    target: &Path,
    filter: &PathFilter,
    progress: &ProgressHandler,
    cancel_requested: &dyn Fn() -> bool,
) -> OpReport {
    if !source.is_dir() {
        return OpReport::failed(format!(
            "source does not exist or is not a directory: {}",
            source.display()
        ));
    }

    // Enumerate and filter up front so the total is known before copying.
    let mut files: Vec<(PathBuf, PathBuf)> = Vec::new();
    for entry in WalkDir::new(source).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(source) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        if filter.matches(&relative) {
            files.push((entry.path().to_path_buf(), relative));
        }
    }

    progress.start_operation(files.len() as u64, "files");

    let mut copied: Vec<PathBuf> = Vec::new();
    let mut created_dirs: Vec<PathBuf> = Vec::new();

    for (index, (src, relative)) in files.iter().enumerate() {
        if cancel_requested() {
            rollback(&copied, &created_dirs);
            debug!("copy cancelled after {} of {} files", index, files.len());
            return OpReport::cancelled(
                format!("copy cancelled after {} of {} files", index, files.len()),
                index as u64,
            );
        }

        let dest = target.join(relative);
        // Recorded before the write so an interrupted copy is rolled back too.
        copied.push(dest.clone());
        if let Err(e) = copy_one(src, &dest, target, &mut created_dirs) {
            rollback(&copied, &created_dirs);
            let msg = format!("failed to copy {}: {}", relative.display(), e);
            progress.report_error(&msg);
            return OpReport::failed(msg);
        }
        progress.report_progress((index + 1) as u64);
    }

    progress.report_success();
    OpReport::completed(format!("copied {} files", copied.len()), copied.len() as u64)
}

fn copy_one(
    src: &Path,
    dest: &Path,
    root: &Path,
    created_dirs: &mut Vec<PathBuf>,
) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        ensure_dir_tracked(parent, root, created_dirs)?;
    }
    let modified = fs::metadata(src).and_then(|m| m.modified()).ok();
    fs::copy(src, dest)?;
    // Timestamp preservation is best-effort.
    if let Some(mtime) = modified {
        match File::options().write(true).open(dest) {
            Ok(file) => {
                if let Err(e) = file.set_modified(mtime) {
                    warn!("could not preserve mtime on {}: {}", dest.display(), e);
                }
            }
            Err(e) => warn!("could not reopen {} to set mtime: {}", dest.display(), e),
        }
    }
    Ok(())
}

/// Extract every entry of a zip archive into `destination`, reporting one
/// unit per entry.
///
/// An unreadable archive yields [`OpStatus::CorruptArchive`] without partial
/// extraction. Cancellation rolls back everything extracted so far and then
/// deletes the archive itself; an extraction error rolls back but keeps the
/// archive for retry.
pub fn extract_archive_with_progress(
    archive_path: &Path,
    destination: &Path,
    progress: &ProgressHandler,
) -> OpReport {
    let cancel = || progress.should_cancel();
    extract_with_checkpoint(archive_path, destination, progress, &cancel)
}

fn extract_with_checkpoint(
    archive_path: &Path,
    destination: &Path,
    progress: &ProgressHandler,
    cancel_requested: &dyn Fn() -> bool,
) -> OpReport {
    let file = match File::open(archive_path) {
        Ok(f) => f,
        Err(e) => {
            let msg = format!("cannot open archive {}: {}", archive_path.display(), e);
            progress.report_error(&msg);
            return OpReport::failed(msg);
        }
    };

    let mut archive = match ZipArchive::new(BufReader::new(file)) {
        Ok(a) => a,
        Err(e) => {
            let msg = format!("corrupt archive {}: {}", archive_path.display(), e);
            progress.report_error(&msg);
            return OpReport {
                status: OpStatus::CorruptArchive,
                message: msg,
                processed: 0,
            };
        }
    };

    let total = archive.len() as u64;
    progress.start_operation(total, "entries");

    let mut extracted: Vec<PathBuf> = Vec::new();
    let mut created_dirs: Vec<PathBuf> = Vec::new();

    for index in 0..archive.len() {
        if cancel_requested() {
            rollback(&extracted, &created_dirs);
            if let Err(e) = fs::remove_file(archive_path) {
                warn!(
                    "could not delete cancelled archive {}: {}",
                    archive_path.display(),
                    e
                );
            }
            info!(
                "extraction cancelled after {} of {} entries, rolled back",
                index, total
            );
            return OpReport::cancelled(
                format!("extraction cancelled after {} of {} entries", index, total),
                index as u64,
            );
        }

        if let Err(e) =
            extract_entry(&mut archive, index, destination, &mut extracted, &mut created_dirs)
        {
            rollback(&extracted, &created_dirs);
            let msg = format!(
                "failed to extract entry {} of {}: {}",
                index + 1,
                archive_path.display(),
                e
            );
            progress.report_error(&msg);
            return OpReport::failed(msg);
        }

        progress.report_progress((index + 1) as u64);
    }

    progress.report_success();
    OpReport::completed(format!("extracted {} entries", total), total)
}

fn extract_entry(
    archive: &mut ZipArchive<BufReader<File>>,
    index: usize,
    destination: &Path,
    extracted: &mut Vec<PathBuf>,
    created_dirs: &mut Vec<PathBuf>,
) -> anyhow::Result<()> {
    let mut entry = archive.by_index(index)?;
    let relative = match entry.enclosed_name() {
        Some(name) => name,
        None => {
            warn!("skipping entry with unsafe name: {}", entry.name());
            return Ok(());
        }
    };
    let out_path = destination.join(relative);

    if entry.is_dir() {
        ensure_dir_tracked(&out_path, destination, created_dirs)?;
        return Ok(());
    }

    if let Some(parent) = out_path.parent() {
        ensure_dir_tracked(parent, destination, created_dirs)?;
    }
    // Recorded before the write so a partially written entry (CRC mismatch,
    // disk full) is rolled back too.
    extracted.push(out_path.clone());
    let mut out = File::create(&out_path)?;
    io::copy(&mut entry, &mut out)?;
    Ok(())
}

/// Create `dir` (and any missing ancestors under `root`), recording every
/// directory that did not exist before so rollback can remove it.
fn ensure_dir_tracked(dir: &Path, root: &Path, created: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut cursor = dir.to_path_buf();
    while !cursor.exists() && cursor.starts_with(root) && cursor != root {
        created.push(cursor.clone());
        match cursor.parent() {
            Some(parent) => cursor = parent.to_path_buf(),
            None => break,
        }
    }
    fs::create_dir_all(dir)
}

/// Remove files written by an aborted operation, then try to remove the
/// directories it created. Directory removal failures (e.g. a directory that
/// gained unrelated content meanwhile) are ignored; they must not stop the
/// rollback.
fn rollback(files: &[PathBuf], dirs: &[PathBuf]) {
    for path in files {
        if path.is_file() {
            if let Err(e) = fs::remove_file(path) {
                warn!("rollback could not remove {}: {}", path.display(), e);
            }
        }
    }
    let mut dirs: Vec<&PathBuf> = dirs.iter().collect();
    // Deepest first so children go before parents.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let _ = fs::remove_dir(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::OperationStatus;
    use std::cell::Cell;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn make_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    fn count_files(root: &Path) -> usize {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn test_copy_preserves_structure() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_file(&src.path().join("a.txt"), "a");
        write_file(&src.path().join("sub/b.txt"), "b");
        write_file(&src.path().join("sub/deep/c.txt"), "c");

        let progress = ProgressHandler::new();
        let report =
            copy_dir_with_progress(src.path(), dst.path(), &PathFilter::default(), &progress);

        assert_eq!(report.status, OpStatus::Completed);
        assert_eq!(report.processed, 3);
        assert!(dst.path().join("a.txt").is_file());
        assert!(dst.path().join("sub/deep/c.txt").is_file());
        let snap = progress.snapshot();
        assert_eq!(snap.status, OperationStatus::Succeeded);
        assert_eq!(snap.completed_units, 3);
        assert_eq!(snap.total_units, 3);
    }

    #[test]
    fn test_copy_inclusion_takes_precedence() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_file(&src.path().join("onlyThisDir/keep.txt"), "keep");
        write_file(&src.path().join("other/skip.txt"), "skip");

        // Both lists supplied; inclusion wins, exclusion is ignored.
        let filter = PathFilter {
            include: vec!["onlyThisDir".into()],
            exclude: vec!["onlyThisDir".into()],
        };
        let progress = ProgressHandler::new();
        let report = copy_dir_with_progress(src.path(), dst.path(), &filter, &progress);

        assert_eq!(report.status, OpStatus::Completed);
        assert_eq!(report.processed, 1);
        assert!(dst.path().join("onlyThisDir/keep.txt").is_file());
        assert!(!dst.path().join("other/skip.txt").exists());
    }

    #[test]
    fn test_copy_exclusion_filter() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_file(&src.path().join("saves/slot0.sav"), "x");
        write_file(&src.path().join("shader_cache/blob.bin"), "y");

        let filter = PathFilter::exclude(&["shader_cache"]);
        let progress = ProgressHandler::new();
        let report = copy_dir_with_progress(src.path(), dst.path(), &filter, &progress);

        assert_eq!(report.processed, 1);
        assert!(dst.path().join("saves/slot0.sav").is_file());
        assert!(!dst.path().join("shader_cache").exists());
    }

    #[test]
    fn test_copy_missing_source_fails_without_starting() {
        let dst = TempDir::new().unwrap();
        let progress = ProgressHandler::new();
        let report = copy_dir_with_progress(
            Path::new("/nonexistent/retrodock-src"),
            dst.path(),
            &PathFilter::default(),
            &progress,
        );
        assert_eq!(report.status, OpStatus::Failed);
        assert!(report.message.contains("not a directory"));
        // Never started: the handler stays idle.
        assert_eq!(progress.snapshot().status, OperationStatus::Idle);
    }

    #[test]
    fn test_copy_cancel_rolls_back() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        for i in 0..4 {
            write_file(&src.path().join(format!("dir{i}/file{i}.txt")), "data");
        }

        let progress = ProgressHandler::new();
        let checks = Cell::new(0u32);
        let cancel = || {
            checks.set(checks.get() + 1);
            checks.get() > 2
        };
        let report = copy_with_checkpoint(
            src.path(),
            dst.path(),
            &PathFilter::default(),
            &progress,
            &cancel,
        );

        assert_eq!(report.status, OpStatus::Cancelled);
        assert_eq!(count_files(dst.path()), 0);
    }

    #[test]
    fn test_extract_success() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        make_zip(
            &archive,
            &[
                ("readme.txt", b"hello".as_slice()),
                ("sub/nested.bin", b"\x00\x01\x02".as_slice()),
            ],
        );
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        let progress = ProgressHandler::new();
        let report = extract_archive_with_progress(&archive, &dest, &progress);

        assert_eq!(report.status, OpStatus::Completed);
        assert_eq!(report.processed, 2);
        assert_eq!(fs::read_to_string(dest.join("readme.txt")).unwrap(), "hello");
        assert!(dest.join("sub/nested.bin").is_file());
        assert_eq!(progress.snapshot().status, OperationStatus::Succeeded);
    }

    #[test]
    fn test_extract_cancel_rolls_back_and_deletes_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        make_zip(
            &archive,
            &[
                ("a/one.txt", b"1".as_slice()),
                ("a/two.txt", b"2".as_slice()),
                ("b/three.txt", b"3".as_slice()),
                ("b/four.txt", b"4".as_slice()),
            ],
        );
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        let progress = ProgressHandler::new();
        // Cancel after two entries have been extracted.
        let checks = Cell::new(0u32);
        let cancel = || {
            checks.set(checks.get() + 1);
            checks.get() > 2
        };
        let report = extract_with_checkpoint(&archive, &dest, &progress, &cancel);

        assert_eq!(report.status, OpStatus::Cancelled);
        assert_eq!(report.processed, 2);
        assert_eq!(count_files(&dest), 0);
        assert!(!archive.exists());
    }

    #[test]
    fn test_extract_precancelled() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        make_zip(&archive, &[("file.txt", b"data".as_slice())]);
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        let progress = ProgressHandler::new();
        progress.send_cancel_signal();
        let report = extract_archive_with_progress(&archive, &dest, &progress);

        assert_eq!(report.status, OpStatus::Cancelled);
        assert_eq!(report.processed, 0);
        assert_eq!(count_files(&dest), 0);
        assert!(!archive.exists());
    }

    #[test]
    fn test_extract_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"this is definitely not a zip file").unwrap();
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        let progress = ProgressHandler::new();
        let report = extract_archive_with_progress(&archive, &dest, &progress);

        assert_eq!(report.status, OpStatus::CorruptArchive);
        assert_eq!(count_files(&dest), 0);
        // A corrupt archive is left in place for inspection.
        assert!(archive.exists());
        assert_eq!(progress.snapshot().status, OperationStatus::Failed);
    }

    #[test]
    fn test_extract_write_error_rolls_back_and_keeps_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        let payload = b"payload that will be damaged";
        {
            let file = File::create(&archive).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            writer.start_file("sub/good.txt", options).unwrap();
            writer.write_all(b"fine").unwrap();
            writer.start_file("sub/bad.txt", options).unwrap();
            writer.write_all(payload).unwrap();
            writer.finish().unwrap();
        }
        // Flip one payload byte: the CRC check fails only after the entry's
        // bytes have already been written to the destination.
        let mut bytes = fs::read(&archive).unwrap();
        let pos = bytes
            .windows(payload.len())
            .position(|w| w == payload)
            .unwrap();
        bytes[pos] ^= 0xff;
        fs::write(&archive, &bytes).unwrap();

        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        let progress = ProgressHandler::new();
        let report = extract_archive_with_progress(&archive, &dest, &progress);

        assert_eq!(report.status, OpStatus::Failed);
        // Both the completed entry and the partially written one are gone.
        assert_eq!(count_files(&dest), 0);
        // The archive stays in place so the extraction can be retried.
        assert!(archive.exists());
        assert_eq!(progress.snapshot().status, OperationStatus::Failed);
    }

    #[test]
    fn test_filter_matching() {
        let filter = PathFilter::include(&["textures"]);
        assert!(filter.matches(Path::new("textures/wood.png")));
        assert!(filter.matches(Path::new("pack/textures/stone.png")));
        assert!(!filter.matches(Path::new("sounds/step.ogg")));

        let filter = PathFilter::exclude(&["cache"]);
        assert!(!filter.matches(Path::new("cache/tmp.bin")));
        assert!(filter.matches(Path::new("saves/slot.sav")));

        // Empty filter copies everything.
        assert!(PathFilter::default().matches(Path::new("anything/at/all")));
    }
}
