use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::{current_unix_timestamp, remove_file_if_exists, HostLayout};

/// Host-wide switch that suspends end-user traffic while files change.
pub trait MaintenanceSwitch: Send + Sync {
    fn enable(&self) -> Result<()>;

    fn disable(&self) -> Result<()>;

    fn is_enabled(&self) -> bool;
}

/// Maintenance mode signalled by a marker file at the host root, which the
/// host application checks before serving a request.
#[derive(Debug, Clone)]
pub struct MaintenanceFile {
    path: PathBuf,
}

impl MaintenanceFile {
    pub fn new(layout: &HostLayout) -> Self {
        Self {
            path: layout.maintenance_path(),
        }
    }
}

impl MaintenanceSwitch for MaintenanceFile {
    fn enable(&self) -> Result<()> {
        let started = current_unix_timestamp()?;
        fs::write(&self.path, format!("upgrading={started}\n")).with_context(|| {
            format!("failed to write maintenance marker: {}", self.path.display())
        })
    }

    fn disable(&self) -> Result<()> {
        remove_file_if_exists(&self.path).with_context(|| {
            format!(
                "failed to remove maintenance marker: {}",
                self.path.display()
            )
        })
    }

    fn is_enabled(&self) -> bool {
        self.path.is_file()
    }
}
