//! Host capability probes for schroot and docker.
//!
//! Every probe is a short-lived child process. A probe that cannot be
//! spawned, fails, or hangs past [`PROBE_TIMEOUT`] reports "unavailable".

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// Upper bound for a single capability probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

async fn probe(program: &str, args: &[&str]) -> Option<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) => {
            debug!(program, error = %e, "probe could not be spawned");
            None
        }
        Err(_) => {
            debug!(program, "probe timed out");
            None
        }
    }
}

pub async fn is_schroot_available() -> bool {
    probe("schroot", &["--version"])
        .await
        .is_some_and(|output| output.status.success())
}

/// Profiles listed by `schroot -l`, without their `chroot:` prefix.
pub async fn schroot_profiles() -> Vec<String> {
    match probe("schroot", &["-l"]).await {
        Some(output) if output.status.success() => {
            parse_schroot_profiles(&String::from_utf8_lossy(&output.stdout))
        }
        _ => Vec::new(),
    }
}

pub fn parse_schroot_profiles(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("source:"))
        .map(|line| line.strip_prefix("chroot:").unwrap_or(line).to_string())
        .collect()
}

pub async fn is_valid_schroot_profile(profile: &str) -> bool {
    schroot_profiles().await.iter().any(|p| p == profile)
}

pub async fn is_docker_available() -> bool {
    probe("docker", &["--version"])
        .await
        .is_some_and(|output| output.status.success())
}

/// Whether `container` exists and is running.
pub async fn is_valid_docker_container(container: &str) -> bool {
    match probe(
        "docker",
        &["container", "inspect", "-f", "{{.State.Running}}", container],
    )
    .await
    {
        Some(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim() == "true"
        }
        _ => false,
    }
}
