use super::*;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use patchward_core::{PackageKind, UpdateEntry};
use patchward_installer::{
    append_transaction_journal_entry, read_active_transaction, read_transaction_metadata,
    set_active_transaction, write_transaction_metadata, ActivationRegistry, ActivationState,
    ArchiveInspector, BackupManager, HostLayout, InstallerReport, JournalStep, MaintenanceSwitch,
    PackageInstaller, StaticHostPolicy, TransactionJournalEntry, TransactionMetadata,
    TransactionStatus, UpdateMetadataStore,
};

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_layout() -> HostLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "patchward-orchestrator-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    HostLayout::new(path)
}

const ALPHA: &str = "alpha/alpha.pkg";

fn main_file_body(version: &str) -> String {
    format!("/*\n * Plugin Name: Alpha\n * Version: {version}\n */\n")
}

fn write_alpha(layout: &HostLayout) -> PathBuf {
    let dir = layout.plugins_dir().join("alpha");
    fs::create_dir_all(dir.join("lib")).expect("must create plugin dir");
    fs::write(dir.join("alpha.pkg"), main_file_body("1.0")).expect("must write main file");
    fs::write(dir.join("lib").join("core.pkg.inc"), "original core\n").expect("must write lib");
    dir.join("alpha.pkg")
}

#[derive(Default)]
struct MemoryActivation {
    active: Mutex<HashMap<(PackageKind, String), bool>>,
    calls: AtomicUsize,
}

impl MemoryActivation {
    fn state(&self, kind: PackageKind, id: &str) -> ActivationState {
        self.activation_state(kind, id).expect("memory activation never fails")
    }
}

impl ActivationRegistry for MemoryActivation {
    fn activation_state(&self, kind: PackageKind, id: &str) -> anyhow::Result<ActivationState> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.lock().expect("lock");
        Ok(match active.get(&(kind, id.to_string())) {
            Some(network_wide) => ActivationState {
                active: true,
                network_wide: *network_wide,
            },
            None => ActivationState::default(),
        })
    }

    fn activate(&self, kind: PackageKind, id: &str, network_wide: bool) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.active
            .lock()
            .expect("lock")
            .insert((kind, id.to_string()), network_wide);
        Ok(())
    }

    fn deactivate(&self, kind: PackageKind, id: &str) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.active
            .lock()
            .expect("lock")
            .remove(&(kind, id.to_string()));
        Ok(())
    }

    fn clear_cache(&self) {}
}

#[derive(Default)]
struct FakeMetadata {
    entries: Mutex<HashMap<(PackageKind, String), UpdateEntry>>,
    refreshes: AtomicUsize,
    reads: AtomicUsize,
    sources: Mutex<Vec<(String, Option<String>)>>,
    /// Requirement reported once more than this many reads happened.
    escalate_after: Option<(usize, String)>,
}

impl FakeMetadata {
    fn requiring(id: &str, requires_runtime: &str) -> Self {
        let metadata = Self::default();
        metadata.entries.lock().expect("lock").insert(
            (PackageKind::Plugin, id.to_string()),
            UpdateEntry {
                requires_runtime: Some(requires_runtime.to_string()),
                new_version: Some("2.0".to_string()),
                download_source: None,
            },
        );
        metadata
    }

    fn calls(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
            + self.reads.load(Ordering::SeqCst)
            + self.sources.lock().expect("lock").len()
    }
}

impl UpdateMetadataStore for FakeMetadata {
    fn refresh(&self, _kind: PackageKind) -> anyhow::Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn entry(&self, kind: PackageKind, id: &str) -> anyhow::Result<Option<UpdateEntry>> {
        let reads = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entry = self
            .entries
            .lock()
            .expect("lock")
            .get(&(kind, id.to_string()))
            .cloned();
        if let Some((after, required)) = &self.escalate_after {
            if reads > *after {
                let escalated = entry.get_or_insert_with(UpdateEntry::default);
                escalated.requires_runtime = Some(required.clone());
            }
        }
        Ok(entry)
    }

    fn set_download_source(
        &self,
        kind: PackageKind,
        id: &str,
        source: &str,
        new_version: Option<&str>,
    ) -> anyhow::Result<()> {
        self.sources
            .lock()
            .expect("lock")
            .push((source.to_string(), new_version.map(ToOwned::to_owned)));
        let mut entries = self.entries.lock().expect("lock");
        let entry = entries.entry((kind, id.to_string())).or_default();
        entry.download_source = Some(source.to_string());
        if let Some(version) = new_version {
            entry.new_version = Some(version.to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
struct CountingMaintenance {
    enables: AtomicUsize,
    disables: AtomicUsize,
    enabled: AtomicBool,
}

impl MaintenanceSwitch for CountingMaintenance {
    fn enable(&self) -> anyhow::Result<()> {
        self.enables.fetch_add(1, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self) -> anyhow::Result<()> {
        self.disables.fetch_add(1, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy)]
enum Script {
    /// Rewrites the main file with the given version.
    Upgrade(&'static str),
    /// Reports an error and leaves the package untouched.
    Report,
    Empty,
    /// Deletes the package directory, then blows up.
    BreakAndFail,
    /// Places a new plugin `<slug>/<slug>.pkg`.
    Install(&'static str),
}

struct ScriptedInstaller {
    layout: HostLayout,
    activation: Arc<MemoryActivation>,
    script: Script,
    upgrades: AtomicUsize,
    installs: AtomicUsize,
}

impl ScriptedInstaller {
    fn calls(&self) -> usize {
        self.upgrades.load(Ordering::SeqCst) + self.installs.load(Ordering::SeqCst)
    }
}

impl PackageInstaller for ScriptedInstaller {
    fn upgrade(&self, kind: PackageKind, id: &str) -> anyhow::Result<InstallerReport> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Upgrade(version) => {
                self.activation.deactivate(kind, id)?;
                fs::write(self.layout.main_file_path(kind, id), main_file_body(version))?;
                Ok(InstallerReport::Installed { id: id.to_string() })
            }
            Script::Report => Ok(InstallerReport::error("download_failed", "Download failed.")),
            Script::Empty => Ok(InstallerReport::Empty),
            Script::BreakAndFail => {
                self.activation.deactivate(kind, id)?;
                fs::remove_dir_all(self.layout.package_dir(kind, id))?;
                Err(anyhow!("installer crashed while copying files"))
            }
            Script::Install(_) => Err(anyhow!("unexpected upgrade call")),
        }
    }

    fn install(&self, kind: PackageKind, _archive_reference: &str) -> anyhow::Result<InstallerReport> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        let Script::Install(slug) = self.script else {
            return Err(anyhow!("unexpected install call"));
        };
        let dir = self.layout.category_dir(kind).join(slug);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(format!("{slug}.pkg")), main_file_body("0.3"))?;
        Ok(InstallerReport::Installed {
            id: format!("{slug}/{slug}.pkg"),
        })
    }
}

#[derive(Default)]
struct FixedInspector {
    dirs: Vec<String>,
    calls: AtomicUsize,
}

impl ArchiveInspector for FixedInspector {
    fn top_level_dirs(&self, _reference: &str) -> anyhow::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.dirs.clone())
    }
}

struct Harness {
    layout: HostLayout,
    policy: StaticHostPolicy,
    metadata: Arc<FakeMetadata>,
    activation: Arc<MemoryActivation>,
    maintenance: Arc<CountingMaintenance>,
    installer: Arc<ScriptedInstaller>,
    inspector: Arc<FixedInspector>,
    hooks: Arc<ShutdownHooks>,
}

impl Harness {
    fn new(layout: HostLayout, script: Script) -> Self {
        let activation = Arc::new(MemoryActivation::default());
        Self {
            policy: StaticHostPolicy {
                disallow_file_mods: false,
                runtime_version: "8.2.0".to_string(),
            },
            metadata: Arc::new(FakeMetadata::default()),
            maintenance: Arc::new(CountingMaintenance::default()),
            installer: Arc::new(ScriptedInstaller {
                layout: layout.clone(),
                activation: activation.clone(),
                script,
                upgrades: AtomicUsize::new(0),
                installs: AtomicUsize::new(0),
            }),
            inspector: Arc::new(FixedInspector::default()),
            hooks: Arc::new(ShutdownHooks::new()),
            activation,
            layout,
        }
    }

    fn with_metadata(mut self, metadata: FakeMetadata) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    fn with_archive_dirs(mut self, dirs: &[&str]) -> Self {
        self.inspector = Arc::new(FixedInspector {
            dirs: dirs.iter().map(|dir| dir.to_string()).collect(),
            calls: AtomicUsize::new(0),
        });
        self
    }

    fn services(&self) -> HostServices {
        HostServices {
            layout: self.layout.clone(),
            policy: Arc::new(self.policy.clone()),
            metadata: self.metadata.clone(),
            activation: self.activation.clone(),
            maintenance: self.maintenance.clone(),
            installer: self.installer.clone(),
            inspector: self.inspector.clone(),
        }
    }

    fn orchestrator(&self) -> UpgradeOrchestrator {
        UpgradeOrchestrator::new(self.services(), self.hooks.clone())
    }

    fn collaborator_calls(&self) -> usize {
        self.metadata.calls()
            + self.activation.calls.load(Ordering::SeqCst)
            + self.maintenance.enables.load(Ordering::SeqCst)
            + self.maintenance.disables.load(Ordering::SeqCst)
            + self.installer.calls()
            + self.inspector.calls.load(Ordering::SeqCst)
    }

    fn transaction_statuses(&self) -> Vec<TransactionStatus> {
        let Ok(entries) = fs::read_dir(self.layout.transactions_dir()) else {
            return Vec::new();
        };
        let mut statuses = Vec::new();
        for entry in entries {
            let path = entry.expect("dir entry").path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let txid = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .expect("txid stem");
            let metadata = read_transaction_metadata(&self.layout, txid)
                .expect("must read metadata")
                .expect("metadata present");
            statuses.push(metadata.status);
        }
        statuses
    }

    fn staged_backups(&self) -> usize {
        fs::read_dir(self.layout.transactions_staging_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

#[test]
fn missing_package_and_archive_fail_without_touching_anything() {
    let layout = test_layout();
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.0"));

    let err = harness
        .orchestrator()
        .upgrade(
            &UpgradeRequest::new(PackageKind::Plugin)
                .package("  ")
                .maintenance_mode(true)
                .crash_recovery(true),
        )
        .expect_err("must fail");

    assert_eq!(err.kind, UpgradeErrorKind::MissingParameter);
    assert_eq!(err.code, 400);
    assert_eq!(harness.collaborator_calls(), 0);
    assert!(!layout.root().exists());
}

#[test]
fn file_mods_disabled_fails_without_touching_anything() {
    let layout = test_layout();
    let mut harness = Harness::new(layout.clone(), Script::Upgrade("2.0"));
    harness.policy.disallow_file_mods = true;

    let err = harness
        .orchestrator()
        .upgrade(
            &UpgradeRequest::new(PackageKind::Plugin)
                .package(ALPHA)
                .maintenance_mode(true),
        )
        .expect_err("must fail");

    assert_eq!(err.kind, UpgradeErrorKind::FileModsDisabled);
    assert_eq!(err.code, 403);
    assert_eq!(harness.collaborator_calls(), 0);
    assert!(!layout.root().exists());
}

#[test]
fn escaping_package_identifier_is_rejected() {
    let layout = test_layout();
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.0"));

    let err = harness
        .orchestrator()
        .upgrade(&UpgradeRequest::new(PackageKind::Plugin).package("../outside/x.pkg"))
        .expect_err("must fail");

    assert_eq!(err.code, 400);
    assert_eq!(err.kind, UpgradeErrorKind::InvalidParameter);
    assert!(!layout.root().exists());
}

#[test]
fn successful_upgrade_reactivates_and_cleans_up() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.0"));
    harness
        .activation
        .activate(PackageKind::Plugin, ALPHA, true)
        .expect("must activate");

    let outcome = harness
        .orchestrator()
        .upgrade(
            &UpgradeRequest::new(PackageKind::Plugin)
                .package(ALPHA)
                .maintenance_mode(true)
                .crash_recovery(true),
        )
        .expect("upgrade must succeed");

    assert_eq!(outcome, UpgradeOutcome::success("2.0"));
    assert_eq!(harness.maintenance.enables.load(Ordering::SeqCst), 1);
    assert_eq!(harness.maintenance.disables.load(Ordering::SeqCst), 1);
    assert!(!harness.maintenance.is_enabled());
    assert_eq!(harness.metadata.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.activation.state(PackageKind::Plugin, ALPHA),
        ActivationState {
            active: true,
            network_wide: true
        }
    );
    assert_eq!(harness.staged_backups(), 0);
    assert_eq!(harness.hooks.pending(), 0);
    assert_eq!(read_active_transaction(&layout).expect("must read"), None);
    assert_eq!(harness.transaction_statuses(), vec![TransactionStatus::Committed]);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn crashed_installer_schedules_restore_that_puts_package_back() {
    let layout = test_layout();
    let main_file = write_alpha(&layout);
    let original = fs::read(&main_file).expect("must read original");
    let harness = Harness::new(layout.clone(), Script::BreakAndFail);
    harness
        .activation
        .activate(PackageKind::Plugin, ALPHA, false)
        .expect("must activate");

    let err = harness
        .orchestrator()
        .upgrade(
            &UpgradeRequest::new(PackageKind::Plugin)
                .package(ALPHA)
                .maintenance_mode(true)
                .crash_recovery(true),
        )
        .expect_err("upgrade must fail");

    assert_eq!(err.code, 500);
    assert_eq!(err.kind, UpgradeErrorKind::InstallFailed);
    assert!(err.message.contains("installer crashed"));
    assert_eq!(
        err.context,
        FailureContext {
            package: Some(ALPHA.to_string()),
            installed: false,
            handle_shutdown: true,
            restore_scheduled: true,
        }
    );
    assert_eq!(harness.maintenance.disables.load(Ordering::SeqCst), 1);
    assert!(!harness.maintenance.is_enabled());
    assert_eq!(harness.hooks.pending(), 1);
    assert!(!main_file.exists());
    assert!(read_active_transaction(&layout).expect("must read").is_some());
    assert_eq!(
        harness.transaction_statuses(),
        vec![TransactionStatus::RestorePending]
    );

    assert_eq!(harness.hooks.run_all(), 1);

    assert_eq!(fs::read(&main_file).expect("must read restored"), original);
    assert!(layout
        .plugins_dir()
        .join("alpha/lib/core.pkg.inc")
        .is_file());
    assert!(harness.activation.state(PackageKind::Plugin, ALPHA).active);
    assert_eq!(read_active_transaction(&layout).expect("must read"), None);
    assert_eq!(harness.transaction_statuses(), vec![TransactionStatus::RolledBack]);
    assert_eq!(harness.staged_backups(), 0);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn upgrade_is_refused_while_a_restore_is_pending() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::BreakAndFail);
    let orchestrator = harness.orchestrator();
    let request = UpgradeRequest::new(PackageKind::Plugin)
        .package("alpha")
        .crash_recovery(true);

    orchestrator.upgrade(&request).expect_err("first upgrade fails");
    let err = orchestrator
        .upgrade(&request)
        .expect_err("second upgrade must be refused");
    assert_eq!(err.kind, UpgradeErrorKind::UpgradeInProgress);
    assert_eq!(err.code, 409);
    assert_eq!(harness.installer.upgrades.load(Ordering::SeqCst), 1);

    harness.hooks.run_all();
    assert!(layout.plugins_dir().join("alpha/alpha.pkg").is_file());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn failure_without_crash_recovery_leaves_no_backup_or_restore() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::BreakAndFail);

    let err = harness
        .orchestrator()
        .upgrade(&UpgradeRequest::new(PackageKind::Plugin).package(ALPHA))
        .expect_err("upgrade must fail");

    assert_eq!(err.code, 500);
    assert!(!err.context.installed);
    assert!(!err.context.handle_shutdown);
    assert!(!err.context.restore_scheduled);
    assert_eq!(harness.hooks.pending(), 0);
    assert_eq!(harness.staged_backups(), 0);
    assert_eq!(harness.maintenance.enables.load(Ordering::SeqCst), 0);
    assert_eq!(read_active_transaction(&layout).expect("must read"), None);
    assert_eq!(harness.transaction_statuses(), vec![TransactionStatus::Failed]);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn reported_failure_with_package_still_present_discards_backup() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::Report);

    let err = harness
        .orchestrator()
        .upgrade(
            &UpgradeRequest::new(PackageKind::Plugin)
                .package(ALPHA)
                .maintenance_mode(true)
                .crash_recovery(true),
        )
        .expect_err("upgrade must fail");

    assert_eq!(err.message, "Download failed.");
    assert!(err.context.installed);
    assert!(err.context.handle_shutdown);
    assert!(!err.context.restore_scheduled);
    assert_eq!(harness.hooks.pending(), 0);
    assert_eq!(harness.staged_backups(), 0);
    assert_eq!(harness.maintenance.disables.load(Ordering::SeqCst), 1);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn empty_installer_result_is_an_unknown_error() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::Empty);

    let err = harness
        .orchestrator()
        .upgrade(&UpgradeRequest::new(PackageKind::Plugin).package(ALPHA))
        .expect_err("empty result must fail");

    assert_eq!(err.kind, UpgradeErrorKind::InstallFailed);
    assert_eq!(err.message, "unknown error");
    assert_eq!(err.code, 500);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn runtime_below_requirement_stops_before_backup_and_install() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.0"))
        .with_metadata(FakeMetadata::requiring(ALPHA, "9.0"));

    let err = harness
        .orchestrator()
        .upgrade(
            &UpgradeRequest::new(PackageKind::Plugin)
                .package(ALPHA)
                .maintenance_mode(true)
                .crash_recovery(true),
        )
        .expect_err("must fail");

    assert_eq!(err.kind, UpgradeErrorKind::VersionIncompatible);
    assert_eq!(err.code, 500);
    assert!(err.message.contains("9.0"));
    assert_eq!(harness.installer.calls(), 0);
    assert_eq!(harness.maintenance.enables.load(Ordering::SeqCst), 0);
    assert_eq!(harness.staged_backups(), 0);
    assert_eq!(read_active_transaction(&layout).expect("must read"), None);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn requirement_raised_during_upgrade_is_caught_before_install() {
    let layout = test_layout();
    write_alpha(&layout);
    let metadata = FakeMetadata {
        escalate_after: Some((1, "10.0".to_string())),
        ..FakeMetadata::default()
    };
    let harness =
        Harness::new(layout.clone(), Script::Upgrade("2.0")).with_metadata(metadata);

    let err = harness
        .orchestrator()
        .upgrade(
            &UpgradeRequest::new(PackageKind::Plugin)
                .package(ALPHA)
                .maintenance_mode(true)
                .crash_recovery(true),
        )
        .expect_err("must fail");

    assert_eq!(err.kind, UpgradeErrorKind::VersionIncompatible);
    assert_eq!(harness.installer.calls(), 0);
    assert_eq!(harness.maintenance.enables.load(Ordering::SeqCst), 1);
    assert_eq!(harness.maintenance.disables.load(Ordering::SeqCst), 1);
    assert_eq!(harness.staged_backups(), 0);
    assert!(layout.plugins_dir().join("alpha/alpha.pkg").is_file());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn backup_failure_aborts_before_install() {
    let layout = test_layout();
    fs::create_dir_all(layout.plugins_dir()).expect("must create plugins dir");
    fs::write(layout.plugins_dir().join("hello.pkg"), main_file_body("1.0"))
        .expect("must write single-file plugin");
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.0"));

    let err = harness
        .orchestrator()
        .upgrade(
            &UpgradeRequest::new(PackageKind::Plugin)
                .package("hello.pkg")
                .maintenance_mode(true)
                .crash_recovery(true),
        )
        .expect_err("must fail");

    assert_eq!(err.kind, UpgradeErrorKind::BackupFailed);
    assert_eq!(err.code, 500);
    assert_eq!(harness.installer.calls(), 0);
    assert_eq!(harness.maintenance.disables.load(Ordering::SeqCst), 1);
    assert_eq!(harness.transaction_statuses(), vec![TransactionStatus::Failed]);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn archive_resolves_installed_package_and_overrides_version() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.1"))
        .with_archive_dirs(&["docs", "alpha"]);

    let outcome = harness
        .orchestrator()
        .upgrade(
            &UpgradeRequest::new(PackageKind::Plugin)
                .archive("https://downloads.example.test/alpha-2.1.zip")
                .target_version("2.1"),
        )
        .expect("must upgrade");

    assert_eq!(outcome.version, "2.1");
    assert_eq!(harness.installer.upgrades.load(Ordering::SeqCst), 1);
    assert_eq!(harness.installer.installs.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.metadata.sources.lock().expect("lock").clone(),
        vec![(
            "https://downloads.example.test/alpha-2.1.zip".to_string(),
            Some("2.1".to_string())
        )]
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn unknown_archive_is_installed_and_activated() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::Install("gamma"))
        .with_archive_dirs(&["gamma"]);

    let outcome = harness
        .orchestrator()
        .upgrade(
            &UpgradeRequest::new(PackageKind::Plugin)
                .archive("/srv/uploads/gamma.zip")
                .maintenance_mode(true),
        )
        .expect("must install");

    assert_eq!(outcome, UpgradeOutcome::success("0.3"));
    assert_eq!(harness.installer.installs.load(Ordering::SeqCst), 1);
    assert!(
        harness
            .activation
            .state(PackageKind::Plugin, "gamma/gamma.pkg")
            .active
    );
    assert_eq!(harness.maintenance.disables.load(Ordering::SeqCst), 1);
    assert_eq!(harness.transaction_statuses(), vec![TransactionStatus::Committed]);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn explicit_package_that_is_not_installed_is_reported() {
    let layout = test_layout();
    fs::create_dir_all(layout.plugins_dir()).expect("must create plugins dir");
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.0"));

    let err = harness
        .orchestrator()
        .upgrade(&UpgradeRequest::new(PackageKind::Plugin).package("ghost"))
        .expect_err("must fail");

    assert_eq!(err.kind, UpgradeErrorKind::NotInstalled);
    assert_eq!(err.code, 404);
    assert_eq!(harness.installer.calls(), 0);
    assert_eq!(read_active_transaction(&layout).expect("must read"), None);

    let _ = fs::remove_dir_all(layout.root());
}

fn seed_interrupted_transaction(harness: &Harness, txid: &str, status: TransactionStatus) {
    let layout = &harness.layout;
    let mut manager = BackupManager::new(
        layout.clone(),
        layout.transaction_staging_path(txid),
        harness.activation.clone(),
    );
    let record = manager
        .make_backup(PackageKind::Plugin, ALPHA)
        .expect("must back up")
        .clone();

    set_active_transaction(layout, txid).expect("must claim");
    write_transaction_metadata(
        layout,
        &TransactionMetadata {
            version: 1,
            txid: txid.to_string(),
            operation: "upgrade".to_string(),
            status,
            started_at_unix: 1,
            kind: Some(PackageKind::Plugin),
            package: Some(ALPHA.to_string()),
        },
    )
    .expect("must write metadata");
    for (seq, step, state, backup) in [
        (1, JournalStep::Maintenance, "enabled", None),
        (
            2,
            JournalStep::Backup(PackageKind::Plugin, ALPHA.to_string()),
            "done",
            Some(record),
        ),
    ] {
        append_transaction_journal_entry(
            layout,
            txid,
            &TransactionJournalEntry {
                seq,
                step: step.to_step_string(),
                state: state.to_string(),
                path: None,
                backup,
            },
        )
        .expect("must journal");
    }
}

#[test]
fn recovery_rolls_back_transaction_of_dead_process() {
    let layout = test_layout();
    let main_file = write_alpha(&layout);
    let original = fs::read(&main_file).expect("must read original");
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.0"));
    harness
        .activation
        .activate(PackageKind::Plugin, ALPHA, false)
        .expect("must activate");

    let txid = "tx-1-0-999999999";
    seed_interrupted_transaction(&harness, txid, TransactionStatus::Applying);
    harness.maintenance.enable().expect("must enable");
    fs::remove_dir_all(layout.plugins_dir().join("alpha")).expect("must break package");
    harness
        .activation
        .deactivate(PackageKind::Plugin, ALPHA)
        .expect("must deactivate");

    let outcome = recover_interrupted(&harness.services()).expect("recovery must succeed");
    assert_eq!(
        outcome,
        RecoveryOutcome::RolledBack {
            txid: txid.to_string(),
            restored: vec![ALPHA.to_string()],
        }
    );
    assert_eq!(fs::read(&main_file).expect("must read restored"), original);
    assert!(harness.activation.state(PackageKind::Plugin, ALPHA).active);
    assert!(!harness.maintenance.is_enabled());
    assert_eq!(read_active_transaction(&layout).expect("must read"), None);
    assert_eq!(harness.transaction_statuses(), vec![TransactionStatus::RolledBack]);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn failed_restore_is_kept_and_never_replayed() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.0"));
    let txid = "tx-1-0-999999999";
    seed_interrupted_transaction(&harness, txid, TransactionStatus::Applying);
    fs::remove_dir_all(layout.plugins_dir().join("alpha")).expect("must break package");
    let staged = layout.transaction_staging_path(txid).join("plugins/alpha");
    fs::write(staged.join("alpha.pkg"), "tampered").expect("must tamper");

    let err = recover_interrupted(&harness.services()).expect_err("tampered restore must fail");
    assert!(format!("{err:#}").contains("changed since it was taken"));
    assert_eq!(harness.transaction_statuses(), vec![TransactionStatus::RestoreFailed]);
    assert!(staged.join("alpha.pkg").is_file());

    assert_eq!(
        recover_interrupted(&harness.services()).expect("second pass must report"),
        RecoveryOutcome::RestoreFailed {
            txid: txid.to_string()
        }
    );
    assert_eq!(harness.transaction_statuses(), vec![TransactionStatus::RestoreFailed]);
    assert_eq!(
        read_active_transaction(&layout).expect("must read"),
        Some(txid.to_string())
    );
    assert!(!layout.plugins_dir().join("alpha").exists());

    let err = harness
        .orchestrator()
        .upgrade(&UpgradeRequest::new(PackageKind::Plugin).package(ALPHA))
        .expect_err("host must stay locked");
    assert_eq!(err.kind, UpgradeErrorKind::UpgradeInProgress);
    assert_eq!(err.code, 409);
    assert!(err.message.contains("needs repair"));
    assert_eq!(harness.installer.calls(), 0);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn recovery_leaves_live_owner_alone() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.0"));
    let txid = format!("tx-1-0-{}", std::process::id());
    seed_interrupted_transaction(&harness, &txid, TransactionStatus::RestorePending);

    let outcome = recover_interrupted(&harness.services()).expect("recovery must run");
    assert_eq!(outcome, RecoveryOutcome::OwnerStillRunning { txid: txid.clone() });
    assert_eq!(
        read_active_transaction(&layout).expect("must read"),
        Some(txid)
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn recovery_clears_marker_of_closed_transaction() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.0"));
    let txid = "tx-1-0-999999999";
    seed_interrupted_transaction(&harness, txid, TransactionStatus::Committed);

    assert_eq!(
        recover_interrupted(&harness.services()).expect("recovery must run"),
        RecoveryOutcome::ClearedStaleMarker {
            txid: txid.to_string()
        }
    );
    assert_eq!(read_active_transaction(&layout).expect("must read"), None);
    assert_eq!(
        recover_interrupted(&harness.services()).expect("recovery must run"),
        RecoveryOutcome::Clean
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn upgrade_recovers_dead_transaction_before_starting() {
    let layout = test_layout();
    write_alpha(&layout);
    let harness = Harness::new(layout.clone(), Script::Upgrade("2.0"));
    seed_interrupted_transaction(&harness, "tx-1-0-999999999", TransactionStatus::Applying);

    let outcome = harness
        .orchestrator()
        .upgrade(&UpgradeRequest::new(PackageKind::Plugin).package(ALPHA))
        .expect("upgrade must proceed after recovery");
    assert_eq!(outcome.version, "2.0");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn shutdown_hooks_run_once_in_order() {
    let hooks = ShutdownHooks::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    for label in ["first", "second"] {
        let log = log.clone();
        hooks.register(label, move || log.lock().expect("lock").push(label));
    }
    assert_eq!(hooks.pending_labels(), vec!["first", "second"]);

    assert_eq!(hooks.run_all(), 2);
    assert_eq!(hooks.run_all(), 0);
    assert_eq!(*log.lock().expect("lock"), vec!["first", "second"]);
}

#[test]
fn shutdown_hooks_survive_panicking_task_and_run_on_drop() {
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let hooks = ShutdownHooks::new();
        hooks.register("boom", || panic!("restore exploded"));
        let counter = ran.clone();
        hooks.register("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn failure_serializes_with_code_and_context() {
    let err = UpgradeError::new(UpgradeErrorKind::InstallFailed, "Download failed.").with_context(
        FailureContext {
            package: Some(ALPHA.to_string()),
            installed: false,
            handle_shutdown: true,
            restore_scheduled: true,
        },
    );
    let value = serde_json::to_value(&err).expect("must serialize");
    assert_eq!(value["message"], "Download failed.");
    assert_eq!(value["code"], 500);
    assert_eq!(value["kind"], "install_failed");
    assert_eq!(value["context"]["package"], ALPHA);
    assert_eq!(value["context"]["installed"], false);
    assert_eq!(value["context"]["handle_shutdown"], true);

    let outcome = serde_json::to_value(UpgradeOutcome::success("2.0")).expect("must serialize");
    assert_eq!(outcome["status"], "success");
    assert_eq!(outcome["version"], "2.0");
}
