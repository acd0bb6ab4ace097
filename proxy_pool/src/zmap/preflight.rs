//! Start-of-session verification of the external scanner. A failed check
//! disables scanning for the session; it never brings the service down.

use std::path::Path;
use std::process::Command;

use tracing::{info, warn};

use super::safety;
use super::ZmapConfig;

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("scanner binary not found at {0}")]
    BinaryMissing(String),
    #[error("scanner path is not a regular file: {0}")]
    NotAFile(String),
    #[error("scanner binary is not executable: {0}")]
    NotExecutable(String),
    #[error("scanner binary cannot be executed: {0}")]
    ExecFailed(String),
    #[error("scanner lacks raw-socket capability; run: setcap 'cap_net_raw,cap_net_admin=+ep' {0}")]
    MissingCapability(String),
    #[error("no ports configured for scanning")]
    NoPorts,
    #[error("invalid port: {0} (must be 1-65535)")]
    InvalidPort(u16),
    #[error("invalid rate_limit: {0} (must be 1-1000000)")]
    InvalidRateLimit(u32),
    #[error("invalid max_runtime_seconds: {0} (must be 1-86400)")]
    InvalidRuntime(u64),
    #[error("invalid target ranges: {0}")]
    InvalidTargets(String),
}

/// Full verification: binary, capabilities, numeric ranges, target ranges,
/// blacklist presence, plus non-fatal advisories.
pub fn verify_setup(config: &ZmapConfig) -> Result<(), PreflightError> {
    check_binary(&config.zmap_binary)?;
    check_capabilities(&config.zmap_binary)?;
    validate_limits(config)?;
    safety::validate_targets(&config.target_ranges).map_err(PreflightError::InvalidTargets)?;

    for blacklist in &config.blacklist {
        if Path::new(blacklist).exists() {
            info!("blacklist file found: {blacklist}");
        } else {
            warn!("blacklist file not found (scan proceeds without it): {blacklist}");
        }
    }

    safety::advisory_checks(config);
    info!("scanner pre-flight passed");
    Ok(())
}

fn check_binary(path: &str) -> Result<(), PreflightError> {
    let meta = std::fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PreflightError::BinaryMissing(path.to_string())
        } else {
            PreflightError::ExecFailed(e.to_string())
        }
    })?;

    if !meta.is_file() {
        return Err(PreflightError::NotAFile(path.to_string()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(PreflightError::NotExecutable(path.to_string()));
        }
    }

    let output = Command::new(path)
        .arg("--version")
        .output()
        .map_err(|e| PreflightError::ExecFailed(e.to_string()))?;
    let version = String::from_utf8_lossy(&output.stdout);
    info!("scanner binary found: {}", version.trim());
    Ok(())
}

fn check_capabilities(path: &str) -> Result<(), PreflightError> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } == 0 {
        info!("running as root, raw-socket capability satisfied");
        return Ok(());
    }

    match Command::new("getcap").arg(path).output() {
        Ok(out) => {
            let text = String::from_utf8_lossy(&out.stdout).to_lowercase();
            if text.contains("cap_net_raw") && text.contains("cap_net_admin") {
                info!("scanner binary carries cap_net_raw and cap_net_admin");
                Ok(())
            } else {
                Err(PreflightError::MissingCapability(path.to_string()))
            }
        }
        Err(e) => {
            // No getcap available; can't prove anything either way.
            warn!("could not probe capabilities: {e}; scanner may fail without root");
            Ok(())
        }
    }
}

fn validate_limits(config: &ZmapConfig) -> Result<(), PreflightError> {
    if config.ports.is_empty() {
        return Err(PreflightError::NoPorts);
    }
    for &port in &config.ports {
        if port == 0 {
            return Err(PreflightError::InvalidPort(port));
        }
    }
    if config.rate_limit < 1 || config.rate_limit > 1_000_000 {
        return Err(PreflightError::InvalidRateLimit(config.rate_limit));
    }
    if config.max_runtime_seconds < 1 || config.max_runtime_seconds > 86_400 {
        return Err(PreflightError::InvalidRuntime(config.max_runtime_seconds));
    }
    Ok(())
}
