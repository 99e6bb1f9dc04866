use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use patchward_core::PackageKind;
use serde::{Deserialize, Serialize};

use crate::{ActivationState, HostLayout};

/// Which packages are active on the host.
pub trait ActivationRegistry: Send + Sync {
    fn activation_state(&self, kind: PackageKind, id: &str) -> Result<ActivationState>;

    fn activate(&self, kind: PackageKind, id: &str, network_wide: bool) -> Result<()>;

    fn deactivate(&self, kind: PackageKind, id: &str) -> Result<()>;

    /// Drops any cached view so the next read goes to the backing store.
    fn clear_cache(&self);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ActivationFile {
    #[serde(default)]
    plugins: BTreeMap<String, ActivationEntry>,
    #[serde(default)]
    themes: BTreeMap<String, ActivationEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ActivationEntry {
    #[serde(default)]
    network_wide: bool,
}

impl ActivationFile {
    fn category(&self, kind: PackageKind) -> &BTreeMap<String, ActivationEntry> {
        match kind {
            PackageKind::Plugin => &self.plugins,
            PackageKind::Theme => &self.themes,
        }
    }

    fn category_mut(&mut self, kind: PackageKind) -> &mut BTreeMap<String, ActivationEntry> {
        match kind {
            PackageKind::Plugin => &mut self.plugins,
            PackageKind::Theme => &mut self.themes,
        }
    }
}

/// Activation registry persisted as JSON under the host state directory.
#[derive(Debug)]
pub struct FileActivationRegistry {
    path: PathBuf,
    cache: Mutex<Option<ActivationFile>>,
}

impl FileActivationRegistry {
    pub fn new(layout: &HostLayout) -> Self {
        Self {
            path: layout.activation_state_path(),
            cache: Mutex::new(None),
        }
    }

    fn with_state<R>(&self, run: impl FnOnce(&mut ActivationFile) -> R) -> Result<R> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("activation cache lock poisoned"))?;
        if cache.is_none() {
            *cache = Some(self.load()?);
        }
        let state = cache
            .as_mut()
            .ok_or_else(|| anyhow!("activation cache unexpectedly empty"))?;
        Ok(run(state))
    }

    fn load(&self) -> Result<ActivationFile> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(ActivationFile::default())
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read activation state: {}", self.path.display())
                });
            }
        };
        serde_json::from_str(&raw).with_context(|| {
            format!("failed to parse activation state: {}", self.path.display())
        })
    }

    fn save(&self, state: &ActivationFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let payload =
            serde_json::to_string_pretty(state).context("failed to serialize activation state")?;
        fs::write(&self.path, payload).with_context(|| {
            format!("failed to write activation state: {}", self.path.display())
        })
    }
}

impl ActivationRegistry for FileActivationRegistry {
    fn activation_state(&self, kind: PackageKind, id: &str) -> Result<ActivationState> {
        self.with_state(|state| match state.category(kind).get(id) {
            Some(entry) => ActivationState {
                active: true,
                network_wide: entry.network_wide,
            },
            None => ActivationState::default(),
        })
    }

    fn activate(&self, kind: PackageKind, id: &str, network_wide: bool) -> Result<()> {
        let snapshot = self.with_state(|state| {
            let category = state.category_mut(kind);
            // A host runs a single theme at a time.
            if kind == PackageKind::Theme {
                category.clear();
            }
            category.insert(id.to_string(), ActivationEntry { network_wide });
            state.clone()
        })?;
        self.save(&snapshot)
    }

    fn deactivate(&self, kind: PackageKind, id: &str) -> Result<()> {
        let snapshot = self.with_state(|state| {
            state.category_mut(kind).remove(id);
            state.clone()
        })?;
        self.save(&snapshot)
    }

    fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }
}
