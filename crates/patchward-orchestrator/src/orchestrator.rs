use std::sync::Arc;

use patchward_core::{runtime_meets_requirement, validate_package_id, PackageKind};
use patchward_installer::{
    find_installed_package, is_installed, read_active_transaction, read_installed_version,
    read_transaction_metadata, ActivationState, BackupManager, BackupRecord, InstallerReport,
    JournalStep, TransactionStatus,
};
use tracing::{debug, error, info, warn};

use crate::recovery::{recover_interrupted, restore_pending, RecoveryOutcome};
use crate::transaction::UpgradeTransaction;
use crate::{
    FailureContext, HostServices, ShutdownHooks, UpgradeError, UpgradeErrorKind, UpgradeOutcome,
    UpgradeRequest,
};

/// What an upgrade request ends up acting on.
enum Target<'a> {
    Installed(String),
    New(&'a str),
}

/// Drives one package upgrade from validation to commit or failure.
///
/// At most one upgrade runs per host; the transaction marker under
/// `state/transactions` is the lock. A failure that leaves the package
/// missing schedules a restore on the shared [`ShutdownHooks`] instead of
/// restoring inline, so the caller can answer first.
pub struct UpgradeOrchestrator {
    services: HostServices,
    hooks: Arc<ShutdownHooks>,
}

impl UpgradeOrchestrator {
    pub fn new(services: HostServices, hooks: Arc<ShutdownHooks>) -> Self {
        Self { services, hooks }
    }

    pub fn services(&self) -> &HostServices {
        &self.services
    }

    pub fn hooks(&self) -> &Arc<ShutdownHooks> {
        &self.hooks
    }

    pub fn upgrade(&self, request: &UpgradeRequest) -> Result<UpgradeOutcome, UpgradeError> {
        let kind = request.kind;
        let package = request.package_id();
        let archive = request.archive_reference();

        if package.is_none() && archive.is_none() {
            return Err(UpgradeError::missing_parameter());
        }
        if let Some(id) = package {
            validate_package_id(id).map_err(|err| {
                UpgradeError::new(UpgradeErrorKind::InvalidParameter, format!("{err:#}"))
                    .with_package(id)
            })?;
        }
        if self.services.policy.file_mods_disabled() {
            return Err(UpgradeError::file_mods_disabled());
        }

        match recover_interrupted(&self.services) {
            Ok(RecoveryOutcome::RolledBack { txid, restored }) => {
                info!(txid = %txid, ?restored, "rolled back an interrupted upgrade");
            }
            Ok(_) => {}
            Err(err) => warn!("recovery of an interrupted upgrade failed: {err:#}"),
        }

        let tx = self.begin_transaction(kind, package)?;
        let target = match self.resolve_target(kind, package, archive) {
            Ok(target) => target,
            Err(err) => return Err(self.abort(tx, None, false, err)),
        };

        match target {
            Target::Installed(id) => self.upgrade_installed(tx, request, &id, archive),
            Target::New(archive) => self.install_new(tx, request, archive),
        }
    }

    fn begin_transaction(
        &self,
        kind: PackageKind,
        package: Option<&str>,
    ) -> Result<UpgradeTransaction, UpgradeError> {
        let layout = &self.services.layout;
        UpgradeTransaction::begin(layout, "upgrade", kind, package).map_err(|err| {
            let Ok(Some(txid)) = read_active_transaction(layout) else {
                return UpgradeError::state(err);
            };
            let restore_failed = read_transaction_metadata(layout, &txid)
                .ok()
                .flatten()
                .is_some_and(|metadata| metadata.status == TransactionStatus::RestoreFailed);
            let message = if restore_failed {
                format!("the restore of an earlier upgrade failed and needs repair (txid={txid})")
            } else {
                format!("another upgrade is already running on this host (txid={txid})")
            };
            UpgradeError::new(UpgradeErrorKind::UpgradeInProgress, message)
        })
    }

    fn resolve_target<'a>(
        &self,
        kind: PackageKind,
        package: Option<&str>,
        archive: Option<&'a str>,
    ) -> Result<Target<'a>, UpgradeError> {
        if let Some(candidate) = package {
            let found = find_installed_package(&self.services.layout, kind, candidate)
                .map_err(UpgradeError::state)?;
            return match (found, archive) {
                (Some(id), _) => Ok(Target::Installed(id)),
                (None, Some(archive)) => Ok(Target::New(archive)),
                (None, None) => Err(UpgradeError::new(
                    UpgradeErrorKind::NotInstalled,
                    format!("{kind} {candidate} is not installed"),
                )
                .with_package(candidate)),
            };
        }

        let archive = archive.ok_or_else(UpgradeError::missing_parameter)?;
        match self.services.locator().resolve(kind, archive) {
            Ok(Some(id)) => {
                debug!(kind = %kind, package = %id, archive, "archive matches installed package");
                Ok(Target::Installed(id))
            }
            Ok(None) => Ok(Target::New(archive)),
            Err(err) => Err(UpgradeError::new(
                UpgradeErrorKind::InstallFailed,
                format!("could not inspect the package archive: {err:#}"),
            )),
        }
    }

    fn upgrade_installed(
        &self,
        mut tx: UpgradeTransaction,
        request: &UpgradeRequest,
        id: &str,
        archive: Option<&str>,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        let kind = request.kind;
        if let Err(err) = tx.record_package(id) {
            return Err(self.abort(tx, None, false, UpgradeError::state(err).with_package(id)));
        }

        let activation = match self.services.activation.activation_state(kind, id) {
            Ok(state) => state,
            Err(err) => {
                return Err(self.abort(tx, None, false, UpgradeError::state(err).with_package(id)))
            }
        };

        if let Err(err) = self.services.metadata.refresh(kind) {
            warn!(kind = %kind, "update metadata refresh failed, using cached data: {err:#}");
        }
        if let Err(err) = self.check_runtime(kind, id) {
            return Err(self.abort(tx, None, false, err));
        }

        if let Some(archive) = archive {
            if let Err(err) = self.services.metadata.set_download_source(
                kind,
                id,
                archive,
                request.target_version.as_deref(),
            ) {
                return Err(self.abort(tx, None, false, UpgradeError::state(err).with_package(id)));
            }
        }

        let maintenance = request.maintenance_mode;
        if maintenance {
            if let Err(err) = self.services.maintenance.enable() {
                return Err(self.abort(tx, None, false, UpgradeError::state(err).with_package(id)));
            }
            journal_or_warn(&mut tx, &JournalStep::Maintenance, "enabled", None);
        }
        if let Err(err) = tx.set_status(TransactionStatus::Applying) {
            return Err(self.abort(
                tx,
                None,
                maintenance,
                UpgradeError::state(err).with_package(id),
            ));
        }

        let mut manager = BackupManager::new(
            self.services.layout.clone(),
            tx.backup_root(),
            self.services.activation.clone(),
        );
        if request.crash_recovery {
            let record = match manager.make_backup(kind, id) {
                Ok(record) => record.clone(),
                Err(err) => {
                    let err = UpgradeError::new(
                        UpgradeErrorKind::BackupFailed,
                        format!("{:#}", anyhow::Error::new(err)),
                    )
                    .with_package(id);
                    return Err(self.abort(tx, Some(&manager), maintenance, err));
                }
            };
            let step = JournalStep::Backup(kind, id.to_string());
            if let Err(err) = tx.journal(&step, "done", Some(&record)) {
                let err = UpgradeError::state(err).with_package(id);
                return Err(self.abort(tx, Some(&manager), maintenance, err));
            }
        }

        // Metadata may have moved while the backup ran; check again right
        // before files change.
        if let Err(err) = self.check_runtime(kind, id) {
            return Err(self.abort(tx, Some(&manager), maintenance, err));
        }

        let step = JournalStep::Upgrade(kind, id.to_string());
        journal_or_warn(&mut tx, &step, "started", None);
        let report = self.services.installer.upgrade(kind, id);
        if maintenance {
            self.disable_maintenance(&mut tx);
        }

        match installer_failure(report) {
            None => {
                journal_or_warn(&mut tx, &step, "done", None);
                Ok(self.finish_upgrade(tx, &manager, kind, id, activation))
            }
            Some(message) => {
                journal_or_warn(&mut tx, &step, "failed", None);
                Err(self.handle_failure(tx, manager, request, id, message))
            }
        }
    }

    fn install_new(
        &self,
        mut tx: UpgradeTransaction,
        request: &UpgradeRequest,
        archive: &str,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        let kind = request.kind;
        let label = request.package_id().unwrap_or(archive).to_string();

        let maintenance = request.maintenance_mode;
        if maintenance {
            if let Err(err) = self.services.maintenance.enable() {
                return Err(self.abort(tx, None, false, UpgradeError::state(err).with_package(label)));
            }
            journal_or_warn(&mut tx, &JournalStep::Maintenance, "enabled", None);
        }
        if let Err(err) = tx.set_status(TransactionStatus::Applying) {
            let err = UpgradeError::state(err).with_package(label);
            return Err(self.abort(tx, None, maintenance, err));
        }

        let step = JournalStep::Install(kind, archive.to_string());
        journal_or_warn(&mut tx, &step, "started", None);
        let report = self.services.installer.install(kind, archive);
        if maintenance {
            self.disable_maintenance(&mut tx);
        }

        let id = match report {
            Ok(InstallerReport::Installed { id }) => id,
            other => {
                let message = installer_failure(other).unwrap_or_else(unknown_error);
                journal_or_warn(&mut tx, &step, "failed", None);
                let err = UpgradeError::new(UpgradeErrorKind::InstallFailed, message).with_context(
                    FailureContext {
                        package: Some(label),
                        installed: false,
                        handle_shutdown: request.crash_recovery,
                        restore_scheduled: false,
                    },
                );
                return Err(self.abort(tx, None, false, err));
            }
        };
        journal_or_warn(&mut tx, &step, "done", None);

        if kind == PackageKind::Plugin {
            if let Err(err) = self.services.activation.activate(kind, &id, false) {
                warn!(package = %id, "installed plugin could not be activated: {err:#}");
            }
        }
        let version = self.installed_version(kind, &id);
        close_or_warn(tx, TransactionStatus::Committed);
        info!(kind = %kind, package = %id, version = %version, "package installed");
        Ok(UpgradeOutcome::success(version))
    }

    fn check_runtime(&self, kind: PackageKind, id: &str) -> Result<(), UpgradeError> {
        let entry = self
            .services
            .metadata
            .entry(kind, id)
            .map_err(|err| UpgradeError::state(err).with_package(id))?;
        let Some(required) = entry
            .and_then(|entry| entry.requires_runtime)
            .filter(|required| !required.trim().is_empty())
        else {
            return Ok(());
        };

        let running = self.services.policy.runtime_version();
        match runtime_meets_requirement(&running, &required) {
            Ok(true) => Ok(()),
            Ok(false) => Err(UpgradeError::new(
                UpgradeErrorKind::VersionIncompatible,
                format!("The minimum required runtime version for this update is {required}"),
            )
            .with_package(id)),
            Err(err) => Err(UpgradeError::new(
                UpgradeErrorKind::VersionIncompatible,
                format!("cannot compare runtime {running} against required {required}: {err:#}"),
            )
            .with_package(id)),
        }
    }

    fn handle_failure(
        &self,
        tx: UpgradeTransaction,
        mut manager: BackupManager,
        request: &UpgradeRequest,
        id: &str,
        message: String,
    ) -> UpgradeError {
        let kind = request.kind;
        let installed = match is_installed(&self.services.layout, kind, id) {
            Ok(installed) => installed,
            Err(err) => {
                warn!(package = id, "could not check the package after failure: {err:#}");
                false
            }
        };

        let restore_scheduled = request.crash_recovery && !installed;
        if restore_scheduled {
            let mut tx = tx;
            if let Err(err) = tx.set_status(TransactionStatus::RestorePending) {
                warn!(txid = tx.txid(), "could not mark restore as pending: {err:#}");
            }
            let mut pending = tx.into_pending();
            self.hooks.register(format!("restore {kind} {id}"), move || {
                if let Err(err) = restore_pending(&mut pending, &mut manager) {
                    error!(txid = %pending.txid, "deferred restore failed: {err:#}");
                }
            });
            warn!(kind = %kind, package = id, "upgrade left the package missing; restore scheduled");
        } else {
            if let Err(err) = manager.cleanup() {
                warn!("{err:#}");
            }
            close_or_warn(tx, TransactionStatus::Failed);
        }

        error!(kind = %kind, package = id, installed, "upgrade failed: {message}");
        UpgradeError::new(UpgradeErrorKind::InstallFailed, message).with_context(FailureContext {
            package: Some(id.to_string()),
            installed,
            handle_shutdown: request.crash_recovery,
            restore_scheduled,
        })
    }

    fn finish_upgrade(
        &self,
        tx: UpgradeTransaction,
        manager: &BackupManager,
        kind: PackageKind,
        id: &str,
        activation: ActivationState,
    ) -> UpgradeOutcome {
        if activation.active {
            self.services.activation.clear_cache();
            if let Err(err) = self
                .services
                .activation
                .activate(kind, id, activation.network_wide)
            {
                warn!(kind = %kind, package = id, "could not reactivate package: {err:#}");
            }
        }
        if let Err(err) = manager.cleanup() {
            warn!("{err:#}");
        }

        let version = self.installed_version(kind, id);
        close_or_warn(tx, TransactionStatus::Committed);
        info!(kind = %kind, package = id, version = %version, "package upgraded");
        UpgradeOutcome::success(version)
    }

    /// Version now on disk, falling back to the advertised one.
    fn installed_version(&self, kind: PackageKind, id: &str) -> String {
        match read_installed_version(&self.services.layout, kind, id) {
            Ok(Some(version)) => return version,
            Ok(None) => {}
            Err(err) => warn!(package = id, "could not read installed version: {err:#}"),
        }
        self.services
            .metadata
            .entry(kind, id)
            .ok()
            .flatten()
            .and_then(|entry| entry.new_version)
            .unwrap_or_default()
    }

    fn disable_maintenance(&self, tx: &mut UpgradeTransaction) {
        match self.services.maintenance.disable() {
            Ok(()) => journal_or_warn(tx, &JournalStep::Maintenance, "disabled", None),
            Err(err) => error!("could not disable maintenance mode: {err:#}"),
        }
    }

    /// Unwinds everything done so far before the installer ran and closes
    /// the transaction as failed.
    fn abort(
        &self,
        mut tx: UpgradeTransaction,
        manager: Option<&BackupManager>,
        maintenance_enabled: bool,
        err: UpgradeError,
    ) -> UpgradeError {
        if maintenance_enabled {
            self.disable_maintenance(&mut tx);
        }
        if let Some(manager) = manager {
            if let Err(cleanup_err) = manager.cleanup() {
                warn!("{cleanup_err:#}");
            }
        }
        close_or_warn(tx, TransactionStatus::Failed);
        debug!(kind = %err.kind, "upgrade aborted: {}", err.message);
        err
    }
}

/// `None` when the installer reported success.
fn installer_failure(report: anyhow::Result<InstallerReport>) -> Option<String> {
    match report {
        Ok(InstallerReport::Installed { .. }) => None,
        Ok(InstallerReport::Error { code, message }) => {
            debug!(code = %code, "installer reported an error");
            Some(message)
        }
        Ok(InstallerReport::Empty) => Some(unknown_error()),
        Err(err) => Some(format!("{err:#}")),
    }
}

fn unknown_error() -> String {
    "unknown error".to_string()
}

fn journal_or_warn(
    tx: &mut UpgradeTransaction,
    step: &JournalStep,
    state: &str,
    backup: Option<&BackupRecord>,
) {
    if let Err(err) = tx.journal(step, state, backup) {
        warn!(txid = tx.txid(), "could not write transaction journal: {err:#}");
    }
}

fn close_or_warn(tx: UpgradeTransaction, status: TransactionStatus) {
    let txid = tx.txid().to_string();
    if let Err(err) = tx.close(status) {
        warn!(txid = %txid, "could not close transaction: {err:#}");
    }
}
