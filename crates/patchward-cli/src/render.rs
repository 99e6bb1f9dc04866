#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum OutputStyle {
    Plain,
    Rich,
}

fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::io::stderr().is_terminal(),
    )
}

fn resolve_output_style(stdout_is_tty: bool, _stderr_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("[{}] {message}", status.to_ascii_uppercase()),
    }
}

fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

/// Spinner on stderr while the upgrade runs; absent for plain output.
struct UpgradeSpinner {
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

fn start_spinner(style: OutputStyle, label: &str) -> UpgradeSpinner {
    let progress_bar = if style == OutputStyle::Rich {
        let progress_bar = ProgressBar::new_spinner();
        if let Ok(template) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}") {
            progress_bar.set_style(template.tick_chars("-=~* "));
        }
        progress_bar.set_message(label.to_string());
        progress_bar.enable_steady_tick(Duration::from_millis(80));
        Some(progress_bar)
    } else {
        None
    };

    UpgradeSpinner {
        progress_bar,
        started_at: Instant::now(),
    }
}

impl UpgradeSpinner {
    fn finish(mut self) -> Duration {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
        self.started_at.elapsed()
    }
}

/// Writes the outcome as one JSON line and returns the process exit status.
fn write_upgrade_result<W: Write>(
    writer: &mut W,
    result: &std::result::Result<UpgradeOutcome, UpgradeError>,
) -> Result<u8> {
    let (payload, status) = match result {
        Ok(outcome) => (
            serde_json::to_string(outcome).context("failed to serialize upgrade outcome")?,
            0,
        ),
        Err(err) => (
            serde_json::to_string(err).context("failed to serialize upgrade failure")?,
            exit_status_for(err),
        ),
    };
    writeln!(writer, "{payload}").context("failed writing upgrade result")?;
    writer.flush().context("failed flushing upgrade result")?;
    Ok(status)
}

fn exit_status_for(err: &UpgradeError) -> u8 {
    match err.code {
        400 => 2,
        403 => 3,
        404 => 4,
        409 => 5,
        _ => 1,
    }
}

fn format_recovery_lines(style: OutputStyle, outcome: &RecoveryOutcome) -> Vec<String> {
    let (status, message) = match outcome {
        RecoveryOutcome::Clean => ("ok", "no interrupted upgrade found".to_string()),
        RecoveryOutcome::ClearedStaleMarker { txid } => (
            "ok",
            format!("cleared stale transaction marker (txid={txid})"),
        ),
        RecoveryOutcome::OwnerStillRunning { txid } => (
            "warn",
            format!("transaction {txid} is still owned by a running process"),
        ),
        RecoveryOutcome::RolledBack { txid, restored } if restored.is_empty() => (
            "ok",
            format!("rolled back {txid}; nothing needed restoring"),
        ),
        RecoveryOutcome::RolledBack { txid, restored } => (
            "ok",
            format!("rolled back {txid}; restored {}", restored.join(", ")),
        ),
        RecoveryOutcome::RestoreFailed { txid } => (
            "error",
            format!("restore of {txid} failed earlier; its backup is kept for manual repair"),
        ),
    };
    vec![render_status_line(style, status, &message)]
}

#[derive(Debug)]
struct DoctorTransaction {
    txid: String,
    status: Option<String>,
    owner_alive: bool,
}

fn doctor_lines(style: OutputStyle, layout: &HostLayout, config: &HostConfig) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    if let Some(header) = render_section_header(style, "host") {
        lines.push(header);
    }
    lines.push(format!("root: {}", layout.root().display()));
    lines.push(format!(
        "config: {}{}",
        layout.config_path().display(),
        if layout.config_path().is_file() { "" } else { " (missing, using defaults)" }
    ));
    lines.push(format!("runtime: {}", config.runtime_version));
    lines.push(format!("file mods disabled: {}", config.disallow_file_mods));
    lines.push(format!(
        "maintenance: {}",
        if layout.maintenance_path().is_file() { "on" } else { "off" }
    ));

    if let Some(header) = render_section_header(style, "packages") {
        lines.push(header);
    }
    for kind in [PackageKind::Plugin, PackageKind::Theme] {
        let ids = installed_package_ids(layout, kind)?;
        lines.push(format!(
            "{}: {} installed in {}",
            kind.category_dir(),
            ids.len(),
            layout.category_dir(kind).display()
        ));
    }

    if let Some(header) = render_section_header(style, "transactions") {
        lines.push(header);
    }
    match doctor_transaction(layout)? {
        None => lines.push(render_status_line(style, "ok", "no active transaction")),
        Some(tx) => {
            let status = tx.status.as_deref().unwrap_or("unknown");
            let (badge, note) = if tx.owner_alive {
                ("warn", "owner running")
            } else {
                ("warn", "owner gone; run `patchward recover`")
            };
            lines.push(render_status_line(
                style,
                badge,
                &format!("active transaction {} ({status}, {note})", tx.txid),
            ));
        }
    }
    Ok(lines)
}

fn doctor_transaction(layout: &HostLayout) -> Result<Option<DoctorTransaction>> {
    let Some(txid) = read_active_transaction(layout)? else {
        return Ok(None);
    };
    let status = read_transaction_metadata(layout, &txid)?.map(|metadata| metadata.status.to_string());
    let owner_alive = transaction_owner_process_alive(&txid)?;
    Ok(Some(DoctorTransaction {
        txid,
        status,
        owner_alive,
    }))
}
