use std::fmt;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use patchward_core::PackageKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationState {
    pub active: bool,
    pub network_wide: bool,
}

/// Point-in-time copy of one package taken before a destructive step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub kind: PackageKind,
    pub package: String,
    pub slug: String,
    /// Live category directory the package is restored into.
    pub storage_root: PathBuf,
    pub category: String,
    pub backup_path: PathBuf,
    pub was_active: bool,
    pub was_active_network_wide: bool,
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Planning,
    Applying,
    RestorePending,
    RollingBack,
    RolledBack,
    RestoreFailed,
    Committed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Applying => "applying",
            Self::RestorePending => "restore_pending",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::RestoreFailed => "restore_failed",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "planning" => Ok(Self::Planning),
            "applying" => Ok(Self::Applying),
            "restore_pending" => Ok(Self::RestorePending),
            "rolling_back" => Ok(Self::RollingBack),
            "rolled_back" => Ok(Self::RolledBack),
            "restore_failed" => Ok(Self::RestoreFailed),
            "committed" => Ok(Self::Committed),
            "failed" => Ok(Self::Failed),
            _ => Err(anyhow!("invalid transaction status: {value}")),
        }
    }

    /// Closed transactions left the host consistent; their active marker
    /// may be cleared without replaying anything.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Committed | Self::Failed | Self::RolledBack)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub version: u32,
    pub txid: String,
    pub operation: String,
    pub status: TransactionStatus,
    pub started_at_unix: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<PackageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionJournalEntry {
    pub seq: u64,
    pub step: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupRecord>,
}

/// Step names written to a transaction journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalStep {
    Maintenance,
    Backup(PackageKind, String),
    Upgrade(PackageKind, String),
    Install(PackageKind, String),
    Restore(PackageKind, String),
}

impl JournalStep {
    pub fn to_step_string(&self) -> String {
        match self {
            Self::Maintenance => "maintenance_mode".to_string(),
            Self::Backup(kind, id) => format!("backup_package:{kind}:{id}"),
            Self::Upgrade(kind, id) => format!("upgrade_package:{kind}:{id}"),
            Self::Install(kind, id) => format!("install_package:{kind}:{id}"),
            Self::Restore(kind, id) => format!("restore_package:{kind}:{id}"),
        }
    }

    pub fn parse(step: &str) -> Option<Self> {
        if step == "maintenance_mode" {
            return Some(Self::Maintenance);
        }
        let (name, rest) = step.split_once(':')?;
        let (kind, id) = rest.split_once(':')?;
        let kind = PackageKind::parse(kind)?;
        if id.is_empty() {
            return None;
        }
        let id = id.to_string();
        match name {
            "backup_package" => Some(Self::Backup(kind, id)),
            "upgrade_package" => Some(Self::Upgrade(kind, id)),
            "install_package" => Some(Self::Install(kind, id)),
            "restore_package" => Some(Self::Restore(kind, id)),
            _ => None,
        }
    }
}
