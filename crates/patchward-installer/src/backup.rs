use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use patchward_core::PackageKind;
use patchward_security::tree_digest_hex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    copy_dir_recursive, move_dir_or_copy, remove_dir_if_exists, ActivationRegistry, BackupRecord,
    HostLayout,
};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("unable to locate the host content directory: {0}")]
    NoContentDir(PathBuf),
    #[error("package {0} has no directory of its own and cannot be backed up")]
    InvalidSlug(String),
    #[error("could not create the temporary backup directory {path}")]
    Mkdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not copy {package} to the temporary backup directory")]
    Copy {
        package: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("could not read the activation state of {package}")]
    Activation {
        package: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreIssue {
    pub package: String,
    pub message: String,
}

impl fmt::Display for RestoreIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.package, self.message)
    }
}

/// Every problem hit while restoring, across all records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("restore finished with {} error(s): {}", .issues.len(), join_issues(.issues))]
pub struct RestoreError {
    pub issues: Vec<RestoreIssue>,
}

fn join_issues(issues: &[RestoreIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Snapshots packages before a destructive step and puts them back when it
/// goes wrong. All records share one backup root, owned by a single request.
pub struct BackupManager {
    layout: HostLayout,
    root: PathBuf,
    activation: Arc<dyn ActivationRegistry>,
    records: Vec<BackupRecord>,
}

impl BackupManager {
    pub fn new(layout: HostLayout, root: PathBuf, activation: Arc<dyn ActivationRegistry>) -> Self {
        Self::with_records(layout, root, activation, Vec::new())
    }

    /// Rebuilds a manager from records persisted by an earlier process.
    pub fn with_records(
        layout: HostLayout,
        root: PathBuf,
        activation: Arc<dyn ActivationRegistry>,
        records: Vec<BackupRecord>,
    ) -> Self {
        Self {
            layout,
            root,
            activation,
            records,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    pub fn make_backup(
        &mut self,
        kind: PackageKind,
        id: &str,
    ) -> Result<&BackupRecord, BackupError> {
        let slug = kind.slug(id);
        // "." would name the whole category directory.
        if slug.is_empty() || slug == "." {
            return Err(BackupError::InvalidSlug(id.to_string()));
        }

        let content_dir = self.layout.content_dir();
        if !content_dir.is_dir() {
            return Err(BackupError::NoContentDir(content_dir));
        }

        let category = kind.category_dir();
        let sub_dir = self.root.join(category);
        if !sub_dir.is_dir() {
            fs::create_dir_all(&sub_dir).map_err(|source| BackupError::Mkdir {
                path: sub_dir.clone(),
                source,
            })?;
        }

        let storage_root = self.layout.category_dir(kind);
        let src = storage_root.join(slug);
        let dest = sub_dir.join(slug);

        let copy_result = (|| -> Result<String> {
            remove_dir_if_exists(&dest)
                .with_context(|| format!("failed to remove stale backup: {}", dest.display()))?;
            if !src.is_dir() {
                anyhow::bail!("package directory does not exist: {}", src.display());
            }
            copy_dir_recursive(&src, &dest)?;
            tree_digest_hex(&dest)
        })();
        let digest = copy_result.map_err(|source| BackupError::Copy {
            package: id.to_string(),
            source,
        })?;

        let activation = self
            .activation
            .activation_state(kind, id)
            .map_err(|source| BackupError::Activation {
                package: id.to_string(),
                source,
            })?;

        info!(kind = %kind, package = id, backup = %dest.display(), "package backed up");
        self.records.push(BackupRecord {
            kind,
            package: id.to_string(),
            slug: slug.to_string(),
            storage_root,
            category: category.to_string(),
            backup_path: dest,
            was_active: activation.active,
            was_active_network_wide: activation.network_wide,
            digest,
        });
        let index = self.records.len() - 1;
        Ok(&self.records[index])
    }

    /// Moves every backed-up package back into place and restores its
    /// activation. Errors are collected per record rather than stopping at
    /// the first one. The backup root is removed only when every record came
    /// back; otherwise what is left of it stays for inspection.
    pub fn restore_backup(&mut self) -> Result<Vec<String>, RestoreError> {
        let mut issues = Vec::new();
        let mut restored = Vec::new();

        for record in &self.records {
            let failures = self.restore_record(record);
            if failures.is_empty() {
                restored.push(record.package.clone());
                continue;
            }
            for message in failures {
                warn!(package = %record.package, %message, "restore of package failed");
                issues.push(RestoreIssue {
                    package: record.package.clone(),
                    message,
                });
            }
        }

        if !issues.is_empty() {
            return Err(RestoreError { issues });
        }
        if let Err(err) = self.cleanup() {
            return Err(RestoreError {
                issues: vec![RestoreIssue {
                    package: "*".to_string(),
                    message: format!("{err:#}"),
                }],
            });
        }
        Ok(restored)
    }

    fn restore_record(&self, record: &BackupRecord) -> Vec<String> {
        let mut failures = Vec::new();
        let src = &record.backup_path;
        let dest = record.storage_root.join(&record.slug);

        if src.is_dir() {
            match tree_digest_hex(src) {
                Ok(digest) if digest == record.digest => {}
                Ok(_) => {
                    failures.push(format!(
                        "backup copy of {} changed since it was taken",
                        record.slug
                    ));
                    return failures;
                }
                Err(err) => {
                    failures.push(format!("could not verify the backup copy: {err:#}"));
                    return failures;
                }
            }

            // A half-removed package is still moved over.
            if let Err(err) = remove_dir_if_exists(&dest) {
                failures.push(format!(
                    "could not remove the broken copy of {}: {err}",
                    record.slug
                ));
            }
            if let Err(err) = move_dir_or_copy(src, &dest) {
                failures.push(format!(
                    "could not restore the original version of {}: {err:#}",
                    record.slug
                ));
                return failures;
            }
            debug!(package = %record.package, "package files restored");
        } else if !dest.is_dir() {
            failures.push(format!(
                "backup copy of {} is missing and the package is not installed",
                record.slug
            ));
            return failures;
        }

        if record.was_active {
            self.activation.clear_cache();
            if let Err(err) = self.activation.activate(
                record.kind,
                &record.package,
                record.was_active_network_wide,
            ) {
                failures.push(format!("could not reactivate {}: {err:#}", record.package));
            }
        }
        failures
    }

    /// Deletes the backup root. Safe to call repeatedly or when nothing was
    /// backed up.
    pub fn cleanup(&self) -> Result<()> {
        remove_dir_if_exists(&self.root).with_context(|| {
            format!(
                "could not cleanup the temporary backup directory: {}",
                self.root.display()
            )
        })
    }
}
