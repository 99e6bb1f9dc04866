use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{HostLayout, TransactionJournalEntry, TransactionMetadata, TransactionStatus};

/// Claims the host-wide active transaction marker. Fails if another
/// transaction already holds it.
pub fn set_active_transaction(layout: &HostLayout, txid: &str) -> Result<PathBuf> {
    let path = layout.transaction_active_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let existing = read_active_transaction(layout).ok().flatten();
            let detail = existing
                .map(|existing_txid| format!(" (txid={existing_txid})"))
                .unwrap_or_default();
            return Err(anyhow!("active transaction marker already exists{detail}"));
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to claim active transaction file: {}",
                    path.display()
                )
            });
        }
    };

    file.write_all(format!("{txid}\n").as_bytes())
        .with_context(|| {
            format!(
                "failed to write active transaction file: {}",
                path.display()
            )
        })?;
    file.flush().with_context(|| {
        format!(
            "failed to flush active transaction file: {}",
            path.display()
        )
    })?;

    Ok(path)
}

pub fn read_active_transaction(layout: &HostLayout) -> Result<Option<String>> {
    let path = layout.transaction_active_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read active transaction file: {}", path.display())
            });
        }
    };

    let txid = raw.trim();
    if txid.is_empty() {
        return Ok(None);
    }

    Ok(Some(txid.to_string()))
}

pub fn clear_active_transaction(layout: &HostLayout) -> Result<()> {
    let path = layout.transaction_active_path();
    if path.exists() {
        fs::remove_file(&path).with_context(|| {
            format!(
                "failed to clear active transaction file: {}",
                path.display()
            )
        })?;
    }
    Ok(())
}

pub fn write_transaction_metadata(
    layout: &HostLayout,
    metadata: &TransactionMetadata,
) -> Result<PathBuf> {
    let path = layout.transaction_metadata_path(&metadata.txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut payload = serde_json::to_string_pretty(metadata)
        .context("failed to serialize transaction metadata")?;
    payload.push('\n');
    fs::write(&path, payload).with_context(|| {
        format!(
            "failed to write transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(path)
}

pub fn read_transaction_metadata(
    layout: &HostLayout,
    txid: &str,
) -> Result<Option<TransactionMetadata>> {
    let path = layout.transaction_metadata_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to read transaction metadata file: {}",
                    path.display()
                )
            });
        }
    };

    let metadata = serde_json::from_str(&raw).with_context(|| {
        format!(
            "failed parsing transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(Some(metadata))
}

pub fn update_transaction_status(
    layout: &HostLayout,
    txid: &str,
    status: TransactionStatus,
) -> Result<()> {
    let mut metadata = read_transaction_metadata(layout, txid)?
        .ok_or_else(|| anyhow!("transaction metadata not found for '{txid}'"))?;
    metadata.status = status;
    write_transaction_metadata(layout, &metadata)?;
    Ok(())
}

pub fn append_transaction_journal_entry(
    layout: &HostLayout,
    txid: &str,
    entry: &TransactionJournalEntry,
) -> Result<PathBuf> {
    let path = layout.transaction_journal_path(txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let line =
        serde_json::to_string(entry).context("failed to serialize transaction journal entry")?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open transaction journal: {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append transaction journal: {}", path.display()))?;
    file.write_all(b"\n").with_context(|| {
        format!(
            "failed to append transaction journal newline: {}",
            path.display()
        )
    })?;
    file.sync_all()
        .with_context(|| format!("failed to sync transaction journal: {}", path.display()))?;
    Ok(path)
}

pub fn read_transaction_journal(
    layout: &HostLayout,
    txid: &str,
) -> Result<Vec<TransactionJournalEntry>> {
    let path = layout.transaction_journal_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed reading transaction journal: {}", path.display())
            });
        }
    };

    let mut entries = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry: TransactionJournalEntry = serde_json::from_str(trimmed).with_context(|| {
            format!(
                "failed parsing transaction journal entry: {} line={}",
                path.display(),
                line_no + 1
            )
        })?;
        entries.push(entry);
    }

    entries.sort_by_key(|entry| entry.seq);
    Ok(entries)
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

pub fn txid_process_id(txid: &str) -> Option<u32> {
    txid.rsplit('-').next()?.parse().ok()
}

pub fn transaction_owner_process_alive(txid: &str) -> Result<bool> {
    let Some(pid) = txid_process_id(txid) else {
        return Ok(false);
    };
    if pid == std::process::id() {
        return Ok(true);
    }

    #[cfg(target_os = "linux")]
    if std::path::Path::new("/proc/self").exists() {
        return Ok(std::path::Path::new("/proc").join(pid.to_string()).exists());
    }

    #[cfg(unix)]
    {
        let status = Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("failed executing owner liveness probe for pid={pid}"))?;
        Ok(status.success())
    }

    #[cfg(windows)]
    {
        let output = Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
            .stderr(Stdio::null())
            .output()
            .with_context(|| format!("failed executing owner liveness probe for pid={pid}"))?;

        if !output.status.success() {
            return Err(anyhow!(
                "owner liveness probe failed for pid={pid}: status={}",
                output.status
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        Ok(stdout.contains(&format!(",\"{pid}\""))
            && !stdout.to_ascii_lowercase().contains("no tasks are running"))
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        Ok(true)
    }
}
