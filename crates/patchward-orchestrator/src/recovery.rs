use anyhow::Result;
use patchward_installer::{
    clear_active_transaction, read_active_transaction, read_transaction_journal,
    read_transaction_metadata, transaction_owner_process_alive, update_transaction_status,
    BackupManager, JournalStep, TransactionStatus,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::transaction::PendingTransaction;
use crate::HostServices;

/// What the recovery pass found on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Clean,
    ClearedStaleMarker { txid: String },
    OwnerStillRunning { txid: String },
    RolledBack { txid: String, restored: Vec<String> },
    /// An earlier restore failed. The marker and whatever is left of the
    /// backup stay until an operator clears them.
    RestoreFailed { txid: String },
}

/// Finishes a transaction whose owning process died before closing it.
///
/// Packages journaled as backed up are moved back into place, maintenance
/// mode left on by the dead process is switched off, and the active marker is
/// released. A restore that fails leaves the marker in place and the
/// transaction marked `restore_failed`; later passes report it and never
/// replay it.
pub fn recover_interrupted(services: &HostServices) -> Result<RecoveryOutcome> {
    let layout = &services.layout;
    let Some(txid) = read_active_transaction(layout)? else {
        return Ok(RecoveryOutcome::Clean);
    };

    let Some(metadata) = read_transaction_metadata(layout, &txid)? else {
        warn!(txid = %txid, "active marker without transaction metadata; clearing");
        clear_active_transaction(layout)?;
        return Ok(RecoveryOutcome::ClearedStaleMarker { txid });
    };
    if metadata.status.is_closed() {
        clear_active_transaction(layout)?;
        return Ok(RecoveryOutcome::ClearedStaleMarker { txid });
    }
    if metadata.status == TransactionStatus::RestoreFailed {
        warn!(txid = %txid, "an earlier restore failed; leaving the transaction for inspection");
        return Ok(RecoveryOutcome::RestoreFailed { txid });
    }
    if transaction_owner_process_alive(&txid)? {
        return Ok(RecoveryOutcome::OwnerStillRunning { txid });
    }

    warn!(txid = %txid, status = %metadata.status, "recovering interrupted transaction");
    let journal = read_transaction_journal(layout, &txid)?;
    let next_seq = journal.last().map_or(1, |entry| entry.seq + 1);

    let maintenance_step = JournalStep::Maintenance.to_step_string();
    let maintenance_left_on = journal
        .iter()
        .rev()
        .find(|entry| entry.step == maintenance_step)
        .is_some_and(|entry| entry.state == "enabled");
    if maintenance_left_on {
        services.maintenance.disable()?;
        info!(txid = %txid, "maintenance mode switched off");
    }

    let records = journal
        .iter()
        .filter(|entry| entry.state == "done")
        .filter_map(|entry| entry.backup.clone())
        .collect::<Vec<_>>();
    let mut manager = BackupManager::with_records(
        layout.clone(),
        layout.transaction_staging_path(&txid),
        services.activation.clone(),
        records,
    );
    let mut pending = PendingTransaction {
        layout: layout.clone(),
        txid: txid.clone(),
        next_seq,
    };
    let restored = restore_pending(&mut pending, &mut manager)?;
    Ok(RecoveryOutcome::RolledBack { txid, restored })
}

/// Restores every backup of a pending transaction and settles its status.
/// The active marker is released only when everything came back.
pub(crate) fn restore_pending(
    pending: &mut PendingTransaction,
    manager: &mut BackupManager,
) -> Result<Vec<String>> {
    update_transaction_status(&pending.layout, &pending.txid, TransactionStatus::RollingBack)?;

    match manager.restore_backup() {
        Ok(restored) => {
            for record in manager.records() {
                pending.journal(
                    &JournalStep::Restore(record.kind, record.package.clone()),
                    "done",
                )?;
            }
            update_transaction_status(
                &pending.layout,
                &pending.txid,
                TransactionStatus::RolledBack,
            )?;
            clear_active_transaction(&pending.layout)?;
            info!(txid = %pending.txid, ?restored, "packages restored from backup");
            Ok(restored)
        }
        Err(err) => {
            for issue in &err.issues {
                error!(txid = %pending.txid, package = %issue.package, "{}", issue.message);
            }
            update_transaction_status(
                &pending.layout,
                &pending.txid,
                TransactionStatus::RestoreFailed,
            )?;
            Err(err.into())
        }
    }
}
