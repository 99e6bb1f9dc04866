use std::fmt;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Category an installed package lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Plugin,
    Theme,
}

impl PackageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plugin => "plugin",
            Self::Theme => "theme",
        }
    }

    /// Directory name of the category, both under the content root and
    /// under a backup root.
    pub fn category_dir(self) -> &'static str {
        match self {
            Self::Plugin => "plugins",
            Self::Theme => "themes",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "plugin" | "plugins" => Some(Self::Plugin),
            "theme" | "themes" => Some(Self::Theme),
            _ => None,
        }
    }

    /// Top-level directory of a package inside its category.
    ///
    /// Plugin identifiers are `<slug>/<main file>`; a bare file name has no
    /// directory of its own and yields the current-directory sentinel `"."`.
    /// Theme identifiers are the slug itself.
    pub fn slug(self, id: &str) -> &str {
        match self {
            Self::Plugin => match id.split_once('/') {
                Some((slug, _)) if !slug.is_empty() => slug,
                _ => ".",
            },
            Self::Theme => id.split('/').next().unwrap_or(id),
        }
    }

    /// Path of the file carrying the package header, relative to the category
    /// directory.
    pub fn main_file_rel_path(self, id: &str) -> PathBuf {
        match self {
            Self::Plugin => PathBuf::from(id),
            Self::Theme => Path::new(self.slug(id)).join("theme.pkg"),
        }
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn validate_package_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(anyhow!("package identifier must not be empty"));
    }
    if id.contains('\\') {
        return Err(anyhow!(
            "package identifier must use '/' separators: {id}"
        ));
    }

    let path = Path::new(id);
    if path.is_absolute() {
        return Err(anyhow!("package identifier must be relative: {id}"));
    }
    for component in path.components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(anyhow!(
                "package identifier contains disallowed path component: {id}"
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageHeader {
    pub name: Option<String>,
    pub version: Option<String>,
    pub requires_runtime: Option<String>,
}

/// Reads `Key: Value` header lines from a package main file. Comment leaders
/// (`/*`, `*`, `#`, `//`) are ignored so the header can sit inside a comment
/// block. The first occurrence of each key wins.
pub fn parse_package_header(raw: &str) -> PackageHeader {
    let mut header = PackageHeader::default();

    for line in raw.lines() {
        let trimmed = line
            .trim()
            .trim_start_matches(|ch: char| matches!(ch, '/' | '*' | '#'))
            .trim();
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_end_matches("*/").trim();
        if value.is_empty() {
            continue;
        }

        let slot = match key.trim().to_ascii_lowercase().as_str() {
            "name" | "plugin name" | "theme name" => &mut header.name,
            "version" => &mut header.version,
            "requires runtime" | "requires" => &mut header.requires_runtime,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }

    header
}
