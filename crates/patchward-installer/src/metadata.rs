use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use patchward_core::{is_remote_reference, PackageKind, UpdateEntry};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::HostLayout;

/// Pending-update metadata keyed by package identifier.
pub trait UpdateMetadataStore: Send + Sync {
    /// Re-reads update information for a category from its source.
    fn refresh(&self, kind: PackageKind) -> Result<()>;

    fn entry(&self, kind: PackageKind, id: &str) -> Result<Option<UpdateEntry>>;

    /// Makes `source` the download source the installer uses for `id`,
    /// optionally overriding the advertised new version.
    fn set_download_source(
        &self,
        kind: PackageKind,
        id: &str,
        source: &str,
        new_version: Option<&str>,
    ) -> Result<()>;
}

type CategoryUpdates = BTreeMap<String, UpdateEntry>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UpdateFeed {
    #[serde(default)]
    plugins: CategoryUpdates,
    #[serde(default)]
    themes: CategoryUpdates,
}

impl UpdateFeed {
    fn take_category(&mut self, kind: PackageKind) -> CategoryUpdates {
        match kind {
            PackageKind::Plugin => std::mem::take(&mut self.plugins),
            PackageKind::Theme => std::mem::take(&mut self.themes),
        }
    }
}

/// Update metadata cached as one JSON file per category. When a feed is
/// configured, a refresh replaces the cache with the feed's view.
#[derive(Debug)]
pub struct FileMetadataStore {
    layout: HostLayout,
    feed: Option<String>,
    cache: Mutex<BTreeMap<PackageKind, CategoryUpdates>>,
}

impl FileMetadataStore {
    pub fn new(layout: HostLayout, feed: Option<String>) -> Self {
        Self {
            layout,
            feed,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    fn read_cache_file(&self, kind: PackageKind) -> Result<CategoryUpdates> {
        let path = self.layout.update_cache_path(kind);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read update cache: {}", path.display()));
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse update cache: {}", path.display()))
    }

    fn write_cache_file(&self, kind: PackageKind, updates: &CategoryUpdates) -> Result<()> {
        let path = self.layout.update_cache_path(kind);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let payload =
            serde_json::to_string_pretty(updates).context("failed to serialize update cache")?;
        fs::write(&path, payload)
            .with_context(|| format!("failed to write update cache: {}", path.display()))
    }

    fn load_feed(feed: &str) -> Result<UpdateFeed> {
        let raw = if is_remote_reference(feed) {
            reqwest::blocking::get(feed)
                .and_then(|response| response.error_for_status())
                .and_then(|response| response.text())
                .with_context(|| format!("failed to fetch update feed: {feed}"))?
        } else {
            fs::read_to_string(Path::new(feed))
                .with_context(|| format!("failed to read update feed: {feed}"))?
        };
        serde_json::from_str(&raw).with_context(|| format!("failed to parse update feed: {feed}"))
    }

    fn with_category<R>(
        &self,
        kind: PackageKind,
        run: impl FnOnce(&mut CategoryUpdates) -> R,
    ) -> Result<R> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("update metadata cache lock poisoned"))?;
        if !cache.contains_key(&kind) {
            let loaded = self.read_cache_file(kind)?;
            cache.insert(kind, loaded);
        }
        let updates = cache
            .get_mut(&kind)
            .ok_or_else(|| anyhow!("update metadata cache unexpectedly empty"))?;
        Ok(run(updates))
    }
}

impl UpdateMetadataStore for FileMetadataStore {
    fn refresh(&self, kind: PackageKind) -> Result<()> {
        let updates = match &self.feed {
            Some(feed) => {
                let updates = Self::load_feed(feed)?.take_category(kind);
                self.write_cache_file(kind, &updates)?;
                updates
            }
            None => self.read_cache_file(kind)?,
        };
        debug!(kind = %kind, entries = updates.len(), "update metadata refreshed");

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("update metadata cache lock poisoned"))?;
        cache.insert(kind, updates);
        Ok(())
    }

    fn entry(&self, kind: PackageKind, id: &str) -> Result<Option<UpdateEntry>> {
        self.with_category(kind, |updates| updates.get(id).cloned())
    }

    fn set_download_source(
        &self,
        kind: PackageKind,
        id: &str,
        source: &str,
        new_version: Option<&str>,
    ) -> Result<()> {
        let snapshot = self.with_category(kind, |updates| {
            let entry = updates.entry(id.to_string()).or_default();
            entry.download_source = Some(source.to_string());
            if let Some(version) = new_version {
                entry.new_version = Some(version.to_string());
            }
            updates.clone()
        })?;
        self.write_cache_file(kind, &snapshot)
    }
}
