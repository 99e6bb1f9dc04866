/// Resolves the host layout and configuration from flags, environment and
/// the config file.
fn load_host_context(
    host_root: Option<&Path>,
    config_path: Option<&Path>,
) -> Result<(HostLayout, HostConfig)> {
    let base = match host_root {
        Some(root) => root.to_path_buf(),
        None => default_host_root()?,
    };
    resolve_host_context(base, host_root.is_some(), config_path, |key| {
        std::env::var(key).ok()
    })
}

/// An explicit `--host-root` wins; otherwise `host_root` from the config or
/// environment may move the host away from `base`.
fn resolve_host_context<F>(
    base: PathBuf,
    root_pinned: bool,
    config_path: Option<&Path>,
    lookup: F,
) -> Result<(HostLayout, HostConfig)>
where
    F: Fn(&str) -> Option<String>,
{
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| base.join(CONFIG_FILE_NAME));
    let mut config = HostConfig::load(&config_path)?;
    config.apply_env_overrides(lookup)?;

    let root = if root_pinned {
        base
    } else {
        config.host_root.clone().unwrap_or(base)
    };
    debug!(
        root = %root.display(),
        config = %config_path.display(),
        "host resolved"
    );
    Ok((HostLayout::new(root), config))
}

fn build_upgrade_request(
    kind: CliPackageKind,
    package: Option<String>,
    archive: Option<String>,
    maintenance: bool,
    crash_recovery: bool,
    target_version: Option<String>,
    config: &HostConfig,
) -> UpgradeRequest {
    let mut request = UpgradeRequest::new(kind.into())
        .maintenance_mode(maintenance || config.defaults.maintenance_mode)
        .crash_recovery(crash_recovery || config.defaults.crash_recovery);
    request.package = package;
    request.archive = archive;
    request.target_version = target_version;
    request
}
