mod activation;
mod archive;
mod backup;
mod fs_utils;
mod installed;
mod installer;
mod layout;
mod locator;
mod maintenance;
mod metadata;
mod policy;
mod transactions;
mod types;

pub use activation::{ActivationRegistry, FileActivationRegistry};
pub use archive::{fetch_archive, ArchiveInspector, FetchedArchive, LocalArchiveInspector};
pub use backup::{BackupError, BackupManager, RestoreError, RestoreIssue};
pub use fs_utils::{copy_dir_recursive, move_dir_or_copy, remove_dir_if_exists, remove_file_if_exists};
pub use installed::{
    find_installed_package, installed_package_ids, is_installed, read_installed_version,
};
pub use installer::{ArchiveInstaller, InstallerReport, PackageInstaller};
pub use layout::{default_host_root, HostLayout};
pub use locator::PackageLocator;
pub use maintenance::{MaintenanceFile, MaintenanceSwitch};
pub use metadata::{FileMetadataStore, UpdateMetadataStore};
pub use policy::{HostPolicy, StaticHostPolicy};
pub use transactions::{
    append_transaction_journal_entry, clear_active_transaction, current_unix_timestamp,
    read_active_transaction, read_transaction_journal, read_transaction_metadata,
    set_active_transaction, transaction_owner_process_alive, txid_process_id,
    update_transaction_status, write_transaction_metadata,
};
pub use types::{
    ActivationState, BackupRecord, JournalStep, TransactionJournalEntry, TransactionMetadata,
    TransactionStatus,
};
