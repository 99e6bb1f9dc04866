use anyhow::{anyhow, Context, Result};
use semver::Version;

/// Parses host runtime versions leniently: `8`, `8.1`, `v8.1.2` and
/// `8.1.2-rc1` are all accepted, missing components default to zero.
pub fn parse_runtime_version(input: &str) -> Result<Version> {
    let trimmed = input.trim().trim_start_matches(['v', 'V']);
    if trimmed.is_empty() {
        return Err(anyhow!("runtime version must not be empty"));
    }

    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }

    let (core, suffix) = match trimmed.split_once(['-', '+']) {
        Some((core, suffix)) => (core, Some(suffix)),
        None => (trimmed, None),
    };

    let mut parts = [0_u64; 3];
    for (index, raw) in core.split('.').enumerate() {
        if index >= parts.len() {
            break;
        }
        let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
        parts[index] = digits
            .parse()
            .with_context(|| format!("invalid runtime version component '{raw}' in '{input}'"))?;
    }

    let mut normalized = format!("{}.{}.{}", parts[0], parts[1], parts[2]);
    if let Some(suffix) = suffix.filter(|value| !value.is_empty()) {
        normalized.push('-');
        normalized.push_str(suffix);
    }
    Version::parse(&normalized)
        .with_context(|| format!("invalid runtime version '{input}'"))
}

/// Returns whether the running host version satisfies a minimum requirement.
/// An empty requirement is always satisfied.
pub fn runtime_meets_requirement(running: &str, required: &str) -> Result<bool> {
    if required.trim().is_empty() {
        return Ok(true);
    }
    let running = parse_runtime_version(running)?;
    let required = parse_runtime_version(required)?;
    Ok(running >= required)
}
