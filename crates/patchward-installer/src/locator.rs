use std::sync::Arc;

use anyhow::Result;
use patchward_core::PackageKind;
use tracing::debug;

use crate::{find_installed_package, ArchiveInspector, HostLayout};

/// Maps an archive to the installed package it upgrades.
#[derive(Clone)]
pub struct PackageLocator {
    layout: HostLayout,
    inspector: Arc<dyn ArchiveInspector>,
}

impl PackageLocator {
    pub fn new(layout: HostLayout, inspector: Arc<dyn ArchiveInspector>) -> Self {
        Self { layout, inspector }
    }

    /// Returns the identifier of the first installed package matching one of
    /// the archive's top-level directories, in the order the inspector lists
    /// them. `None` means the archive holds a package that is not installed
    /// yet.
    ///
    /// [`LocalArchiveInspector`](crate::LocalArchiveInspector) lists
    /// directories sorted by name, so with several matches the alphabetically
    /// first one wins. Extraction order is not kept.
    pub fn resolve(&self, kind: PackageKind, archive_reference: &str) -> Result<Option<String>> {
        let candidates = self.inspector.top_level_dirs(archive_reference)?;
        debug!(archive = archive_reference, ?candidates, "inspected archive");
        self.resolve_candidates(kind, &candidates)
    }

    pub fn resolve_candidates(
        &self,
        kind: PackageKind,
        candidates: &[String],
    ) -> Result<Option<String>> {
        for candidate in candidates {
            if let Some(id) = find_installed_package(&self.layout, kind, candidate)? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }
}
