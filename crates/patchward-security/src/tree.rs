use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

/// Digest over a directory tree: relative paths, entry kinds, file contents
/// and symlink targets, visited in sorted order so the result only depends
/// on what the tree holds.
pub fn tree_digest_hex(root: &Path) -> Result<String> {
    if !root.is_dir() {
        return Err(anyhow!("not a directory: {}", root.display()));
    }

    let mut hasher = Sha256::new();
    digest_dir(root, root, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn digest_dir(root: &Path, current: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut entries = fs::read_dir(current)
        .with_context(|| format!("failed to read {}", current.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to list {}", current.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .with_context(|| format!("path escaped digest root: {}", path.display()))?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;

        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("failed to read symlink {}", path.display()))?;
            hasher.update(b"L\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else if metadata.is_dir() {
            hasher.update(b"D\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            digest_dir(root, &path, hasher)?;
        } else {
            let bytes =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            hasher.update(b"F\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
    }
    Ok(())
}
