use patchward_core::HostConfig;

/// Host-level facts the orchestrator consults before touching anything.
pub trait HostPolicy: Send + Sync {
    /// Global "file modifications disabled" flag.
    fn file_mods_disabled(&self) -> bool;

    fn runtime_version(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticHostPolicy {
    pub disallow_file_mods: bool,
    pub runtime_version: String,
}

impl StaticHostPolicy {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            disallow_file_mods: config.disallow_file_mods,
            runtime_version: config.runtime_version.clone(),
        }
    }
}

impl HostPolicy for StaticHostPolicy {
    fn file_mods_disabled(&self) -> bool {
        self.disallow_file_mods
    }

    fn runtime_version(&self) -> String {
        self.runtime_version.clone()
    }
}
