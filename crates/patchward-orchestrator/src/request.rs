use patchward_core::PackageKind;
use serde::Serialize;

/// One upgrade command. At least one of `package` and `archive` must be set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub kind: PackageKind,
    pub package: Option<String>,
    pub archive: Option<String>,
    pub maintenance_mode: bool,
    pub crash_recovery: bool,
    pub target_version: Option<String>,
}

impl UpgradeRequest {
    pub fn new(kind: PackageKind) -> Self {
        Self {
            kind,
            package: None,
            archive: None,
            maintenance_mode: false,
            crash_recovery: false,
            target_version: None,
        }
    }

    pub fn package(mut self, id: impl Into<String>) -> Self {
        self.package = Some(id.into());
        self
    }

    pub fn archive(mut self, reference: impl Into<String>) -> Self {
        self.archive = Some(reference.into());
        self
    }

    pub fn maintenance_mode(mut self, enabled: bool) -> Self {
        self.maintenance_mode = enabled;
        self
    }

    pub fn crash_recovery(mut self, enabled: bool) -> Self {
        self.crash_recovery = enabled;
        self
    }

    pub fn target_version(mut self, version: impl Into<String>) -> Self {
        self.target_version = Some(version.into());
        self
    }

    pub(crate) fn package_id(&self) -> Option<&str> {
        non_blank(self.package.as_deref())
    }

    pub(crate) fn archive_reference(&self) -> Option<&str> {
        non_blank(self.archive.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeOutcome {
    pub status: String,
    pub version: String,
}

impl UpgradeOutcome {
    pub fn success(version: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            version: version.into(),
        }
    }
}
