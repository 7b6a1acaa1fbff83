//! Runtime discovery cascade
//!
//! Deterministic probe order: forced runtime if configured, else docker
//! (version probe, then liveness probe, retried with elevation on a
//! permission-style failure), else podman (rootless never needs
//! elevation). Compose detection cascades v2 plugin, then v1 binary,
//! then podman-compose.

use std::process::Command;
use tracing::{debug, info};

use super::{ComposeKind, ContainerRuntime, RuntimeKind};
use crate::config::RuntimeChoice;
use crate::error::{CanopyError, Result};

/// Outcome of a single probe invocation
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// Exit 0, captured stdout
    Success(String),
    /// Spawned but exited non-zero, captured stderr
    Failure(String),
    /// Executable absent or not spawnable
    Missing,
}

/// Abstraction over probe execution so detection is testable without a
/// container runtime on the host.
pub trait CommandProber {
    fn probe(&self, program: &str, args: &[&str]) -> ProbeOutcome;
}

/// Prober that runs real commands.
pub struct SystemProber;

impl CommandProber for SystemProber {
    fn probe(&self, program: &str, args: &[&str]) -> ProbeOutcome {
        match Command::new(program).args(args).output() {
            Ok(out) if out.status.success() => {
                ProbeOutcome::Success(String::from_utf8_lossy(&out.stdout).trim().to_string())
            }
            Ok(out) => {
                ProbeOutcome::Failure(String::from_utf8_lossy(&out.stderr).trim().to_string())
            }
            Err(_) => ProbeOutcome::Missing,
        }
    }
}

/// Probe transcript accumulated during detection; attached to the
/// startup error when no runtime is usable.
struct Transcript {
    lines: Vec<String>,
}

impl Transcript {
    fn new() -> Self {
        Self { lines: Vec::new() }
    }

    fn record(&mut self, program: &str, args: &[&str], outcome: &ProbeOutcome) {
        let rendered = match outcome {
            ProbeOutcome::Success(_) => "ok".to_string(),
            ProbeOutcome::Failure(stderr) => format!("failed: {stderr}"),
            ProbeOutcome::Missing => "not found".to_string(),
        };
        self.lines
            .push(format!("{program} {} -> {rendered}", args.join(" ")));
    }

    fn into_string(self) -> String {
        self.lines.join("\n")
    }
}

/// Detect the usable container runtime with real probes.
pub fn detect(forced: Option<RuntimeChoice>) -> Result<ContainerRuntime> {
    detect_with(forced, &SystemProber)
}

/// Detect the usable container runtime with an injected prober.
pub fn detect_with(
    forced: Option<RuntimeChoice>,
    prober: &dyn CommandProber,
) -> Result<ContainerRuntime> {
    let mut transcript = Transcript::new();

    let runtime = match forced {
        Some(RuntimeChoice::Docker) => probe_docker(prober, &mut transcript),
        Some(RuntimeChoice::Podman) => probe_podman(prober, &mut transcript),
        None => probe_docker(prober, &mut transcript)
            .or_else(|| probe_podman(prober, &mut transcript)),
    };

    match runtime {
        Some(rt) => {
            info!(
                category = "runtime",
                kind = %rt.kind(),
                compose = ?rt.compose_kind(),
                elevated = rt.needs_elevation(),
                "Detected container runtime"
            );
            Ok(rt)
        }
        None => Err(CanopyError::RuntimeUnavailable {
            transcript: transcript.into_string(),
        }),
    }
}

fn probe_docker(prober: &dyn CommandProber, transcript: &mut Transcript) -> Option<ContainerRuntime> {
    let version = prober.probe("docker", &["--version"]);
    transcript.record("docker", &["--version"], &version);
    if !matches!(version, ProbeOutcome::Success(_)) {
        return None;
    }

    // Liveness: the CLI existing does not mean the daemon is reachable.
    let liveness = prober.probe("docker", &["ps"]);
    transcript.record("docker", &["ps"], &liveness);
    let needs_elevation = match liveness {
        ProbeOutcome::Success(_) => false,
        ProbeOutcome::Failure(ref stderr) if is_permission_error(stderr) => {
            let elevated = prober.probe("sudo", &["docker", "ps"]);
            transcript.record("sudo", &["docker", "ps"], &elevated);
            if !matches!(elevated, ProbeOutcome::Success(_)) {
                return None;
            }
            true
        }
        _ => return None,
    };

    let compose = detect_docker_compose(prober, transcript)?;
    Some(ContainerRuntime::new(
        RuntimeKind::Docker,
        compose,
        needs_elevation,
    ))
}

fn detect_docker_compose(
    prober: &dyn CommandProber,
    transcript: &mut Transcript,
) -> Option<ComposeKind> {
    let v2 = prober.probe("docker", &["compose", "version"]);
    transcript.record("docker", &["compose", "version"], &v2);
    if matches!(v2, ProbeOutcome::Success(_)) {
        return Some(ComposeKind::DockerComposeV2);
    }

    let v1 = prober.probe("docker-compose", &["--version"]);
    transcript.record("docker-compose", &["--version"], &v1);
    if matches!(v1, ProbeOutcome::Success(_)) {
        return Some(ComposeKind::DockerComposeV1);
    }
    None
}

fn probe_podman(prober: &dyn CommandProber, transcript: &mut Transcript) -> Option<ContainerRuntime> {
    let version = prober.probe("podman", &["--version"]);
    transcript.record("podman", &["--version"], &version);
    if !matches!(version, ProbeOutcome::Success(_)) {
        return None;
    }

    // Rootless podman never requires elevation; rootful does.
    let rootless_probe = prober.probe("podman", &["info", "--format", "{{.Host.Security.Rootless}}"]);
    transcript.record(
        "podman",
        &["info", "--format", "{{.Host.Security.Rootless}}"],
        &rootless_probe,
    );
    let rootless = matches!(&rootless_probe, ProbeOutcome::Success(out) if out.trim() == "true");
    debug!(category = "runtime", rootless, "Probed podman rootless mode");

    let compose = prober.probe("podman-compose", &["--version"]);
    transcript.record("podman-compose", &["--version"], &compose);
    if !matches!(compose, ProbeOutcome::Success(_)) {
        return None;
    }

    Some(ContainerRuntime::new(
        RuntimeKind::Podman,
        ComposeKind::PodmanCompose,
        !rootless,
    ))
}

/// Whether a probe stderr looks like a permissions problem rather than a
/// stopped daemon.
fn is_permission_error(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("permission denied")
        || stderr.contains("eacces")
        || stderr.contains("dial unix")
        || stderr.contains("got permission denied")
}
