use anyhow::{Context, Result};
use patchward_core::{PackageKind, CONFIG_FILE_NAME};
use std::path::{Path, PathBuf};

/// Filesystem layout of one host installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn content_dir(&self) -> PathBuf {
        self.root.join("content")
    }

    pub fn category_dir(&self, kind: PackageKind) -> PathBuf {
        self.content_dir().join(kind.category_dir())
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.category_dir(PackageKind::Plugin)
    }

    pub fn themes_dir(&self) -> PathBuf {
        self.category_dir(PackageKind::Theme)
    }

    pub fn package_dir(&self, kind: PackageKind, id: &str) -> PathBuf {
        self.category_dir(kind).join(kind.slug(id))
    }

    pub fn main_file_path(&self, kind: PackageKind, id: &str) -> PathBuf {
        self.category_dir(kind).join(kind.main_file_rel_path(id))
    }

    pub fn maintenance_path(&self) -> PathBuf {
        self.root.join(".maintenance")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn activation_state_path(&self) -> PathBuf {
        self.state_dir().join("active-packages.json")
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.state_dir().join("updates")
    }

    pub fn update_cache_path(&self, kind: PackageKind) -> PathBuf {
        self.updates_dir()
            .join(format!("{}.json", kind.category_dir()))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn archives_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("archives")
    }

    pub fn tmp_state_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.state_dir().join("transactions")
    }

    pub fn transactions_staging_dir(&self) -> PathBuf {
        self.transactions_dir().join("staging")
    }

    pub fn transaction_active_path(&self) -> PathBuf {
        self.transactions_dir().join("active")
    }

    pub fn transaction_metadata_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.json"))
    }

    pub fn transaction_journal_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.journal"))
    }

    /// Backup root owned by one transaction. Backups of different requests
    /// never share a staging directory.
    pub fn transaction_staging_path(&self, txid: &str) -> PathBuf {
        self.transactions_staging_dir().join(txid)
    }
}

pub fn default_host_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os("PATCHWARD_HOST_ROOT").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    std::env::current_dir().context("cannot resolve host root from the current directory")
}
