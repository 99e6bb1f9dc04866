use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use patchward_core::{parse_package_header, PackageKind};

use crate::HostLayout;

const PACKAGE_MAIN_EXTENSION: &str = "pkg";
const THEME_MAIN_FILE: &str = "theme.pkg";

/// Identifiers of every installed package of a category, sorted.
///
/// A plugin is any `*.pkg` file carrying a `Name` header, either directly in
/// the plugins directory or one level below it. A theme is any directory
/// holding a `theme.pkg`.
pub fn installed_package_ids(layout: &HostLayout, kind: PackageKind) -> Result<Vec<String>> {
    let dir = layout.category_dir(kind);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read package directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else {
            continue;
        };
        let file_type = entry.file_type()?;

        match kind {
            PackageKind::Plugin => {
                if file_type.is_file() && is_plugin_main_file(&path)? {
                    ids.push(name);
                } else if file_type.is_dir() {
                    for main_file in plugin_main_files(&path)? {
                        ids.push(format!("{name}/{main_file}"));
                    }
                }
            }
            PackageKind::Theme => {
                if file_type.is_dir() && path.join(THEME_MAIN_FILE).is_file() {
                    ids.push(name);
                }
            }
        }
    }

    ids.sort();
    Ok(ids)
}

/// First installed identifier equal to `candidate` or containing it as a
/// `/`-separated segment.
pub fn find_installed_package(
    layout: &HostLayout,
    kind: PackageKind,
    candidate: &str,
) -> Result<Option<String>> {
    let candidate = candidate.trim_matches('/');
    if candidate.is_empty() {
        return Ok(None);
    }
    Ok(installed_package_ids(layout, kind)?
        .into_iter()
        .find(|id| id == candidate || id.split('/').any(|segment| segment == candidate)))
}

pub fn is_installed(layout: &HostLayout, kind: PackageKind, candidate: &str) -> Result<bool> {
    Ok(find_installed_package(layout, kind, candidate)?.is_some())
}

pub fn read_installed_version(
    layout: &HostLayout,
    kind: PackageKind,
    id: &str,
) -> Result<Option<String>> {
    let path = layout.main_file_path(kind, id);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read package header: {}", path.display()))?;
    Ok(parse_package_header(&raw).version)
}

fn plugin_main_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if !is_plugin_main_file(&path)? {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.push(name.to_string());
        }
    }
    files.sort();
    Ok(files)
}

fn is_plugin_main_file(path: &Path) -> Result<bool> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(PACKAGE_MAIN_EXTENSION) {
        return Ok(false);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read package header: {}", path.display()))?;
    Ok(parse_package_header(&raw).name.is_some())
}

pub(crate) fn theme_main_file() -> &'static str {
    THEME_MAIN_FILE
}

pub(crate) fn plugin_main_files_in(dir: &Path) -> Result<Vec<String>> {
    plugin_main_files(dir)
}
