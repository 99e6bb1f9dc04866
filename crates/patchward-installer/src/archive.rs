use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context, Result};
use patchward_core::{is_remote_reference, ArchiveType};
use patchward_security::{sha256_hex, verify_sha256_file};
use tracing::debug;

use crate::{current_unix_timestamp, remove_dir_if_exists, remove_file_if_exists, HostLayout};

/// Reads the top-level directory names contained in an archive.
pub trait ArchiveInspector: Send + Sync {
    fn top_level_dirs(&self, reference: &str) -> Result<Vec<String>>;
}

/// Inspects archives by fetching and unpacking them into host scratch space.
#[derive(Debug, Clone)]
pub struct LocalArchiveInspector {
    layout: HostLayout,
}

impl LocalArchiveInspector {
    pub fn new(layout: HostLayout) -> Self {
        Self { layout }
    }
}

impl ArchiveInspector for LocalArchiveInspector {
    fn top_level_dirs(&self, reference: &str) -> Result<Vec<String>> {
        let archive = fetch_archive(&self.layout, reference)?;
        if archive.archive_type == ArchiveType::Directory {
            return list_dirs(&archive.path);
        }

        let scratch = make_tmp_dir(&self.layout, "inspect")?;
        let listed = extract_archive(&archive.path, &scratch, archive.archive_type)
            .and_then(|_| list_dirs(&scratch));
        let _ = remove_dir_if_exists(&scratch);
        archive.release(listed.is_ok());
        listed
    }
}

/// An archive resolved to a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArchive {
    pub path: PathBuf,
    pub archive_type: ArchiveType,
    downloaded: bool,
    pinned: bool,
}

impl FetchedArchive {
    /// Gives a downloaded copy back to the cache once it has been read.
    ///
    /// Only a checksum-pinned download that unpacked cleanly stays cached;
    /// anything else is deleted so the next request fetches fresh bytes.
    pub fn release(&self, unpacked: bool) {
        if !self.downloaded || (self.pinned && unpacked) {
            return;
        }
        if let Err(err) = remove_file_if_exists(&self.path) {
            debug!(path = %self.path.display(), "could not drop cached archive: {err}");
        }
    }
}

/// Resolves an archive reference to a local path. Local paths are used in
/// place. Remote references are downloaded into the archive cache on every
/// call, unless a `#sha256=` pin matches a copy already cached.
pub fn fetch_archive(layout: &HostLayout, reference: &str) -> Result<FetchedArchive> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(anyhow!("archive reference must not be empty"));
    }

    if !is_remote_reference(reference) {
        let path = PathBuf::from(reference);
        if path.is_dir() {
            return Ok(FetchedArchive {
                path,
                archive_type: ArchiveType::Directory,
                downloaded: false,
                pinned: false,
            });
        }
        if !path.is_file() {
            return Err(anyhow!("archive not found: {}", path.display()));
        }
        let archive_type = ArchiveType::infer_from_reference(reference)
            .ok_or_else(|| anyhow!("unsupported archive type: {reference}"))?;
        return Ok(FetchedArchive {
            path,
            archive_type,
            downloaded: false,
            pinned: false,
        });
    }

    let (url, expected_sha256) = split_checksum_fragment(reference);
    let archive_type = ArchiveType::infer_from_reference(url).unwrap_or(ArchiveType::Zip);
    let cache_path = layout.archives_cache_dir().join(format!(
        "{}.{}",
        &sha256_hex(url.as_bytes())[..16],
        archive_type.cache_extension()
    ));
    let fetched = FetchedArchive {
        path: cache_path,
        archive_type,
        downloaded: true,
        pinned: expected_sha256.is_some(),
    };

    if let Some(expected) = expected_sha256 {
        if fetched.path.is_file() && verify_sha256_file(&fetched.path, expected)? {
            debug!(url, path = %fetched.path.display(), "reusing pinned archive from cache");
            return Ok(fetched);
        }
    }

    download_archive(url, &fetched.path)?;
    if let Some(expected) = expected_sha256 {
        if !verify_sha256_file(&fetched.path, expected)? {
            let _ = fs::remove_file(&fetched.path);
            return Err(anyhow!("sha256 mismatch for downloaded archive: {url}"));
        }
    }
    Ok(fetched)
}

/// Splits an optional `#sha256=<hex>` pin off a remote reference.
pub(crate) fn split_checksum_fragment(reference: &str) -> (&str, Option<&str>) {
    match reference.rsplit_once("#sha256=") {
        Some((url, digest)) if !digest.trim().is_empty() => (url, Some(digest.trim())),
        _ => (reference, None),
    }
}

fn download_archive(url: &str, cache_path: &Path) -> Result<()> {
    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create cache dir: {}", parent.display()))?;
    }

    let part_path = cache_path.with_extension("part");
    debug!(url, path = %cache_path.display(), "downloading archive");
    let result = (|| -> Result<()> {
        let mut response = reqwest::blocking::get(url)
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("archive download failed: {url}"))?;
        let mut file = fs::File::create(&part_path)
            .with_context(|| format!("failed to create {}", part_path.display()))?;
        io::copy(&mut response, &mut file)
            .with_context(|| format!("failed writing archive download: {}", part_path.display()))?;
        Ok(())
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&part_path);
        return Err(err);
    }

    fs::rename(&part_path, cache_path).with_context(|| {
        format!(
            "failed to move downloaded archive into cache: {}",
            cache_path.display()
        )
    })
}

static TMP_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn make_tmp_dir(layout: &HostLayout, prefix: &str) -> Result<PathBuf> {
    let mut dir = layout.tmp_state_dir();
    dir.push(format!(
        "{}-{}-{}-{}",
        prefix,
        std::process::id(),
        current_unix_timestamp()?,
        TMP_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    if dir.exists() {
        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed clearing tmp dir: {}", dir.display()))?;
    }
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed creating tmp dir: {}", dir.display()))?;
    Ok(dir)
}

pub(crate) fn extract_archive(
    archive_path: &Path,
    dst: &Path,
    archive_type: ArchiveType,
) -> Result<()> {
    match archive_type {
        ArchiveType::Zip => extract_zip(archive_path, dst),
        ArchiveType::TarGz => extract_tar(archive_path, dst),
        ArchiveType::Directory => crate::copy_dir_recursive(archive_path, dst),
    }
}

fn extract_tar(archive_path: &Path, dst: &Path) -> Result<()> {
    run_command(
        Command::new("tar")
            .arg("-xzf")
            .arg(archive_path)
            .arg("-C")
            .arg(dst),
        "failed to extract tar archive",
    )
}

fn extract_zip(archive_path: &Path, dst: &Path) -> Result<()> {
    let mut unzip_command = Command::new("unzip");
    unzip_command.arg("-q").arg(archive_path).arg("-d").arg(dst);
    if run_command(
        &mut unzip_command,
        "failed to extract zip archive with unzip",
    )
    .is_ok()
    {
        return Ok(());
    }

    run_command(
        Command::new("tar")
            .arg("-xf")
            .arg(archive_path)
            .arg("-C")
            .arg(dst),
        "failed to extract zip archive with tar fallback",
    )
}

fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

/// Directory names directly below `root`, sorted by name, with macOS
/// resource forks skipped. Directory listing order is filesystem dependent,
/// so the sort is what makes the result stable.
pub(crate) fn list_dirs(root: &Path) -> Result<Vec<String>> {
    let mut entries = fs::read_dir(root)
        .with_context(|| format!("failed to read {}", root.display()))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("failed to list {}", root.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut dirs = Vec::new();
    for entry in entries {
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else {
            continue;
        };
        if name == "__MACOSX" {
            continue;
        }
        dirs.push(name);
    }
    Ok(dirs)
}
