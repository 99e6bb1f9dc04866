use std::sync::Arc;

use patchward_core::HostConfig;
use patchward_installer::{
    ActivationRegistry, ArchiveInspector, ArchiveInstaller, FileActivationRegistry,
    FileMetadataStore, HostLayout, HostPolicy, LocalArchiveInspector, MaintenanceFile,
    MaintenanceSwitch, PackageInstaller, PackageLocator, StaticHostPolicy, UpdateMetadataStore,
};

/// Every host collaborator the orchestrator talks to.
#[derive(Clone)]
pub struct HostServices {
    pub layout: HostLayout,
    pub policy: Arc<dyn HostPolicy>,
    pub metadata: Arc<dyn UpdateMetadataStore>,
    pub activation: Arc<dyn ActivationRegistry>,
    pub maintenance: Arc<dyn MaintenanceSwitch>,
    pub installer: Arc<dyn PackageInstaller>,
    pub inspector: Arc<dyn ArchiveInspector>,
}

impl HostServices {
    /// File-backed services for a host rooted at `layout`.
    pub fn from_config(layout: HostLayout, config: &HostConfig) -> Self {
        let metadata: Arc<dyn UpdateMetadataStore> = Arc::new(FileMetadataStore::new(
            layout.clone(),
            config.update_feed.clone(),
        ));
        let activation: Arc<dyn ActivationRegistry> =
            Arc::new(FileActivationRegistry::new(&layout));
        let installer = Arc::new(ArchiveInstaller::new(
            layout.clone(),
            metadata.clone(),
            activation.clone(),
        ));

        Self {
            policy: Arc::new(StaticHostPolicy::from_config(config)),
            maintenance: Arc::new(MaintenanceFile::new(&layout)),
            inspector: Arc::new(LocalArchiveInspector::new(layout.clone())),
            installer,
            metadata,
            activation,
            layout,
        }
    }

    pub fn locator(&self) -> PackageLocator {
        PackageLocator::new(self.layout.clone(), self.inspector.clone())
    }
}
