fn run_cli(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Upgrade {
            kind,
            package,
            archive,
            maintenance,
            crash_recovery,
            target_version,
        } => {
            let (layout, config) =
                load_host_context(cli.host_root.as_deref(), cli.config.as_deref())?;
            let request = build_upgrade_request(
                kind,
                package,
                archive,
                maintenance,
                crash_recovery,
                target_version,
                &config,
            );
            let mut stdout = std::io::stdout().lock();
            let status = run_upgrade_command(layout, &config, &request, &mut stdout)?;
            Ok(ExitCode::from(status))
        }
        Commands::Recover => {
            let (layout, config) =
                load_host_context(cli.host_root.as_deref(), cli.config.as_deref())?;
            let services = HostServices::from_config(layout, &config);
            let outcome = recover_interrupted(&services)?;
            for line in format_recovery_lines(current_output_style(), &outcome) {
                println!("{line}");
            }
            if matches!(outcome, RecoveryOutcome::RestoreFailed { .. }) {
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Doctor => {
            let (layout, config) =
                load_host_context(cli.host_root.as_deref(), cli.config.as_deref())?;
            for line in doctor_lines(current_output_style(), &layout, &config)? {
                println!("{line}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout().lock();
            write_completions_script(shell, &mut stdout)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Runs one upgrade, writes its result, then runs any deferred restore.
/// The restore comes after the result so the caller is answered first.
fn run_upgrade_command<W: Write>(
    layout: HostLayout,
    config: &HostConfig,
    request: &UpgradeRequest,
    writer: &mut W,
) -> Result<u8> {
    let hooks = Arc::new(ShutdownHooks::new());
    let orchestrator =
        UpgradeOrchestrator::new(HostServices::from_config(layout, config), hooks.clone());

    let spinner = start_spinner(current_output_style(), "upgrading");
    let result = orchestrator.upgrade(request);
    let elapsed = spinner.finish();
    debug!(elapsed_ms = elapsed.as_millis() as u64, "upgrade finished");

    let status = write_upgrade_result(writer, &result)?;

    let pending = hooks.pending();
    if pending > 0 {
        info!(pending, "running deferred restore tasks");
        hooks.run_all();
    }
    Ok(status)
}
