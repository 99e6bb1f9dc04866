use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeErrorKind {
    MissingParameter,
    InvalidParameter,
    FileModsDisabled,
    UpgradeInProgress,
    NotInstalled,
    VersionIncompatible,
    InstallFailed,
    BackupFailed,
    RestoreFailed,
    StateFailed,
}

impl UpgradeErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingParameter => "missing_parameter",
            Self::InvalidParameter => "invalid_parameter",
            Self::FileModsDisabled => "file_mods_disabled",
            Self::UpgradeInProgress => "upgrade_in_progress",
            Self::NotInstalled => "not_installed",
            Self::VersionIncompatible => "version_incompatible",
            Self::InstallFailed => "install_failed",
            Self::BackupFailed => "backup_failed",
            Self::RestoreFailed => "restore_failed",
            Self::StateFailed => "state_failed",
        }
    }

    /// HTTP-style severity reported to callers.
    pub fn code(self) -> u16 {
        match self {
            Self::MissingParameter | Self::InvalidParameter => 400,
            Self::FileModsDisabled => 403,
            Self::NotInstalled => 404,
            Self::UpgradeInProgress => 409,
            Self::VersionIncompatible
            | Self::InstallFailed
            | Self::BackupFailed
            | Self::RestoreFailed
            | Self::StateFailed => 500,
        }
    }
}

impl fmt::Display for UpgradeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a client needs to render a failed upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureContext {
    pub package: Option<String>,
    pub installed: bool,
    pub handle_shutdown: bool,
    pub restore_scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct UpgradeError {
    pub kind: UpgradeErrorKind,
    pub message: String,
    pub code: u16,
    pub context: FailureContext,
}

impl UpgradeError {
    pub fn new(kind: UpgradeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: kind.code(),
            context: FailureContext::default(),
        }
    }

    pub fn missing_parameter() -> Self {
        Self::new(
            UpgradeErrorKind::MissingParameter,
            "parameter is missing. package or archive required",
        )
    }

    pub fn file_mods_disabled() -> Self {
        Self::new(
            UpgradeErrorKind::FileModsDisabled,
            "file modification is disabled on this host",
        )
    }

    pub fn state(err: anyhow::Error) -> Self {
        Self::new(UpgradeErrorKind::StateFailed, format!("{err:#}"))
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.context.package = Some(package.into());
        self
    }

    pub fn with_context(mut self, context: FailureContext) -> Self {
        self.context = context;
        self
    }
}
