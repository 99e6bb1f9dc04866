use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use patchward_core::PackageKind;
use patchward_installer::{
    append_transaction_journal_entry, clear_active_transaction, current_unix_timestamp,
    remove_file_if_exists, set_active_transaction, write_transaction_metadata, BackupRecord,
    HostLayout, JournalStep, TransactionJournalEntry, TransactionMetadata, TransactionStatus,
};
use tracing::debug;

static TXID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One upgrade's claim on the host. Holding it means holding the host-wide
/// active marker; [`close`](Self::close) or a scheduled restore releases it.
pub(crate) struct UpgradeTransaction {
    layout: HostLayout,
    metadata: TransactionMetadata,
    next_seq: u64,
}

impl UpgradeTransaction {
    pub(crate) fn begin(
        layout: &HostLayout,
        operation: &str,
        kind: PackageKind,
        package: Option<&str>,
    ) -> Result<Self> {
        let started_at_unix = current_unix_timestamp()?;
        let txid = format!(
            "tx-{started_at_unix}-{}-{}",
            TXID_COUNTER.fetch_add(1, Ordering::Relaxed),
            std::process::id()
        );
        let metadata = TransactionMetadata {
            version: 1,
            txid: txid.clone(),
            operation: operation.to_string(),
            status: TransactionStatus::Planning,
            started_at_unix,
            kind: Some(kind),
            package: package.map(ToOwned::to_owned),
        };

        set_active_transaction(layout, &txid)?;
        if let Err(err) = write_transaction_metadata(layout, &metadata) {
            let _ = clear_active_transaction(layout);
            let _ = remove_file_if_exists(&layout.transaction_metadata_path(&txid));
            return Err(err);
        }
        debug!(txid = %txid, operation, "transaction started");

        Ok(Self {
            layout: layout.clone(),
            metadata,
            next_seq: 1,
        })
    }

    pub(crate) fn txid(&self) -> &str {
        &self.metadata.txid
    }

    pub(crate) fn backup_root(&self) -> PathBuf {
        self.layout.transaction_staging_path(&self.metadata.txid)
    }

    pub(crate) fn record_package(&mut self, id: &str) -> Result<()> {
        self.metadata.package = Some(id.to_string());
        write_transaction_metadata(&self.layout, &self.metadata).map(|_| ())
    }

    pub(crate) fn set_status(&mut self, status: TransactionStatus) -> Result<()> {
        self.metadata.status = status;
        write_transaction_metadata(&self.layout, &self.metadata)
            .map(|_| ())
            .with_context(|| format!("failed to mark transaction {}", status))
    }

    pub(crate) fn journal(
        &mut self,
        step: &JournalStep,
        state: &str,
        backup: Option<&BackupRecord>,
    ) -> Result<()> {
        let entry = TransactionJournalEntry {
            seq: self.next_seq,
            step: step.to_step_string(),
            state: state.to_string(),
            path: backup.map(|record| record.backup_path.display().to_string()),
            backup: backup.cloned(),
        };
        append_transaction_journal_entry(&self.layout, &self.metadata.txid, &entry)?;
        self.next_seq += 1;
        Ok(())
    }

    /// Records the final status and releases the host.
    pub(crate) fn close(mut self, status: TransactionStatus) -> Result<()> {
        self.set_status(status)?;
        clear_active_transaction(&self.layout)?;
        debug!(txid = %self.metadata.txid, status = %status, "transaction closed");
        Ok(())
    }

    /// Hands the open transaction to a deferred task. The marker stays in
    /// place until that task finishes.
    pub(crate) fn into_pending(self) -> PendingTransaction {
        PendingTransaction {
            layout: self.layout,
            txid: self.metadata.txid,
            next_seq: self.next_seq,
        }
    }
}

/// An open transaction whose outcome is decided later, by a shutdown task or
/// by the recovery pass of another process.
pub(crate) struct PendingTransaction {
    pub(crate) layout: HostLayout,
    pub(crate) txid: String,
    pub(crate) next_seq: u64,
}

impl PendingTransaction {
    pub(crate) fn journal(&mut self, step: &JournalStep, state: &str) -> Result<()> {
        let entry = TransactionJournalEntry {
            seq: self.next_seq,
            step: step.to_step_string(),
            state: state.to_string(),
            path: None,
            backup: None,
        };
        append_transaction_journal_entry(&self.layout, &self.txid, &entry)?;
        self.next_seq += 1;
        Ok(())
    }
}
