use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use patchward_core::PackageKind;
use tracing::{debug, info};

use crate::archive::{extract_archive, list_dirs, make_tmp_dir};
use crate::installed::{plugin_main_files_in, theme_main_file};
use crate::{
    fetch_archive, move_dir_or_copy, remove_dir_if_exists, ActivationRegistry, HostLayout,
    UpdateMetadataStore,
};

/// What a package installer reported back.
///
/// `Empty` is an installer that ran but produced no usable result; callers
/// must treat it exactly like `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerReport {
    Installed { id: String },
    Error { code: String, message: String },
    Empty,
}

impl InstallerReport {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Low-level file replacement. An `Err` is an installer that blew up
/// part-way; a reported failure comes back as `Ok(InstallerReport::Error)`.
pub trait PackageInstaller: Send + Sync {
    /// Replaces an installed package with the download source recorded for it
    /// in the update metadata.
    fn upgrade(&self, kind: PackageKind, id: &str) -> Result<InstallerReport>;

    /// Installs a package that is not present on the host yet.
    fn install(&self, kind: PackageKind, archive_reference: &str) -> Result<InstallerReport>;
}

/// Installer that unpacks an archive and swaps the package directory.
///
/// Plugins are deactivated before their files are replaced; reactivating
/// them is up to the caller.
pub struct ArchiveInstaller {
    layout: HostLayout,
    metadata: Arc<dyn UpdateMetadataStore>,
    activation: Arc<dyn ActivationRegistry>,
}

impl ArchiveInstaller {
    pub fn new(
        layout: HostLayout,
        metadata: Arc<dyn UpdateMetadataStore>,
        activation: Arc<dyn ActivationRegistry>,
    ) -> Self {
        Self {
            layout,
            metadata,
            activation,
        }
    }

    fn unpack(&self, archive_reference: &str, purpose: &str) -> Result<PathBuf> {
        let archive = fetch_archive(&self.layout, archive_reference)?;
        let scratch = make_tmp_dir(&self.layout, purpose)?;
        let extracted = extract_archive(&archive.path, &scratch, archive.archive_type);
        archive.release(extracted.is_ok());
        if let Err(err) = extracted {
            let _ = remove_dir_if_exists(&scratch);
            return Err(err);
        }
        Ok(scratch)
    }

    fn replace_package(&self, kind: PackageKind, id: &str, scratch: &Path) -> Result<InstallerReport> {
        let slug = kind.slug(id);
        if slug == "." {
            return Ok(InstallerReport::error(
                "unsupported_package",
                format!("single-file package {id} cannot be replaced from an archive"),
            ));
        }

        let payload = payload_root(scratch, slug)?;
        let expected_main = match kind {
            PackageKind::Plugin => payload.join(id.split_once('/').map_or(id, |(_, file)| file)),
            PackageKind::Theme => payload.join(theme_main_file()),
        };
        if !expected_main.is_file() {
            return Ok(InstallerReport::error(
                "incompatible_archive",
                format!(
                    "the package archive does not contain {}",
                    kind.main_file_rel_path(id).display()
                ),
            ));
        }

        if kind == PackageKind::Plugin {
            self.activation.deactivate(kind, id)?;
        }

        let destination = self.layout.package_dir(kind, id);
        remove_dir_if_exists(&destination).with_context(|| {
            format!("failed to remove old package: {}", destination.display())
        })?;
        move_dir_or_copy(&payload, &destination)?;
        info!(kind = %kind, package = id, "package files replaced");
        Ok(InstallerReport::Installed { id: id.to_string() })
    }

    fn place_new_package(&self, kind: PackageKind, scratch: &Path) -> Result<InstallerReport> {
        let dirs = list_dirs(scratch)?;
        let [slug] = dirs.as_slice() else {
            return Ok(InstallerReport::error(
                "incompatible_archive",
                format!(
                    "expected a single top-level directory, found {}",
                    dirs.len()
                ),
            ));
        };

        let payload = scratch.join(slug);
        let id = match kind {
            PackageKind::Plugin => match plugin_main_files_in(&payload)?.into_iter().next() {
                Some(main_file) => format!("{slug}/{main_file}"),
                None => {
                    return Ok(InstallerReport::error(
                        "no_plugins_found",
                        "no valid plugin main file was found in the archive",
                    ))
                }
            },
            PackageKind::Theme => {
                if !payload.join(theme_main_file()).is_file() {
                    return Ok(InstallerReport::error(
                        "no_theme_found",
                        "the theme archive is missing its theme.pkg",
                    ));
                }
                slug.clone()
            }
        };

        let destination = self.layout.package_dir(kind, &id);
        if destination.exists() {
            return Ok(InstallerReport::error(
                "folder_exists",
                format!("destination folder already exists: {}", destination.display()),
            ));
        }
        move_dir_or_copy(&payload, &destination)?;
        info!(kind = %kind, package = %id, "package installed");
        Ok(InstallerReport::Installed { id })
    }
}

impl PackageInstaller for ArchiveInstaller {
    fn upgrade(&self, kind: PackageKind, id: &str) -> Result<InstallerReport> {
        let source = self
            .metadata
            .entry(kind, id)?
            .and_then(|entry| entry.download_source);
        let Some(source) = source else {
            return Ok(InstallerReport::error(
                "no_package",
                format!("no update package is available for {id}"),
            ));
        };
        debug!(kind = %kind, package = id, source = %source, "upgrading from source");

        let scratch = self.unpack(&source, "upgrade")?;
        let result = self.replace_package(kind, id, &scratch);
        let _ = remove_dir_if_exists(&scratch);
        result
    }

    fn install(&self, kind: PackageKind, archive_reference: &str) -> Result<InstallerReport> {
        let scratch = self.unpack(archive_reference, "install")?;
        let result = self.place_new_package(kind, &scratch);
        let _ = remove_dir_if_exists(&scratch);
        result
    }
}

/// Directory inside an unpacked archive that holds the package files: the
/// one named after the slug, else the only top-level directory, else the
/// unpack root itself.
fn payload_root(scratch: &Path, slug: &str) -> Result<PathBuf> {
    let named = scratch.join(slug);
    if named.is_dir() {
        return Ok(named);
    }
    let dirs = list_dirs(scratch)?;
    if let [only] = dirs.as_slice() {
        return Ok(scratch.join(only));
    }
    Ok(scratch.to_path_buf())
}
