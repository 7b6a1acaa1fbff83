//! Container runtime detection and command construction
//!
//! Discovers which container CLI is usable once at process start, then
//! hands back argument vectors for the caller to spawn. Construction
//! never shells out; only the detection probes do.

mod detect;

pub use detect::{detect, detect_with, CommandProber, ProbeOutcome, SystemProber};

use serde::Serialize;

/// Which container CLI drives this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    /// Base executable name
    pub fn program(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

/// Which compose flavour is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComposeKind {
    /// `docker compose` (v2 plugin)
    DockerComposeV2,
    /// standalone `docker-compose` (v1)
    DockerComposeV1,
    /// `podman-compose`
    PodmanCompose,
}

/// The detected runtime: a command-construction contract only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRuntime {
    kind: RuntimeKind,
    compose: ComposeKind,
    needs_elevation: bool,
}

impl ContainerRuntime {
    pub fn new(kind: RuntimeKind, compose: ComposeKind, needs_elevation: bool) -> Self {
        Self {
            kind,
            compose,
            needs_elevation,
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub fn compose_kind(&self) -> ComposeKind {
        self.compose
    }

    /// Base executable plus whether invocations must be elevated
    pub fn cli(&self) -> (&'static str, bool) {
        (self.kind.program(), self.needs_elevation)
    }

    /// Whether invocations must be prefixed with `sudo`
    pub fn needs_elevation(&self) -> bool {
        self.needs_elevation
    }

    /// Argument vector for a plain runtime invocation
    /// (`volume`, `run`, `ps`, `inspect`, ...)
    pub fn command<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = self.prefix();
        argv.push(self.kind.program().to_string());
        argv.extend(args.into_iter().map(Into::into));
        argv
    }

    /// Fully composed compose invocation
    pub fn compose<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = self.prefix();
        match self.compose {
            ComposeKind::DockerComposeV2 => {
                argv.push("docker".to_string());
                argv.push("compose".to_string());
            }
            ComposeKind::DockerComposeV1 => argv.push("docker-compose".to_string()),
            ComposeKind::PodmanCompose => argv.push("podman-compose".to_string()),
        }
        argv.extend(args.into_iter().map(Into::into));
        argv
    }

    fn prefix(&self) -> Vec<String> {
        if self.needs_elevation {
            vec!["sudo".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Maximum attempts for transient compose failures
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delays between retry attempts, seconds (2s then 5s)
pub const RETRY_DELAYS_SECS: &[u64] = &[2, 5];

/// Whether a compose failure looks transient (worth retrying)
pub fn is_retryable_failure(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("connection refused")
        || stderr.contains("timeout")
        || stderr.contains("network")
        || stderr.contains("temporary")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_reports_elevation() {
        let rt = ContainerRuntime::new(RuntimeKind::Docker, ComposeKind::DockerComposeV2, true);
        assert_eq!(rt.cli(), ("docker", true));
        assert!(rt.needs_elevation());
    }

    #[test]
    fn test_command_construction_plain() {
        let rt = ContainerRuntime::new(RuntimeKind::Docker, ComposeKind::DockerComposeV2, false);
        assert_eq!(
            rt.command(["volume", "create", "ws_pg"]),
            vec!["docker", "volume", "create", "ws_pg"]
        );
    }

    #[test]
    fn test_command_construction_elevated() {
        let rt = ContainerRuntime::new(RuntimeKind::Docker, ComposeKind::DockerComposeV2, true);
        assert_eq!(rt.command(["ps"]), vec!["sudo", "docker", "ps"]);
    }

    #[test]
    fn test_compose_v2_argv() {
        let rt = ContainerRuntime::new(RuntimeKind::Docker, ComposeKind::DockerComposeV2, false);
        assert_eq!(
            rt.compose(["up", "-d"]),
            vec!["docker", "compose", "up", "-d"]
        );
    }

    #[test]
    fn test_compose_v1_argv() {
        let rt = ContainerRuntime::new(RuntimeKind::Docker, ComposeKind::DockerComposeV1, false);
        assert_eq!(rt.compose(["down"]), vec!["docker-compose", "down"]);
    }

    #[test]
    fn test_podman_compose_argv() {
        let rt = ContainerRuntime::new(RuntimeKind::Podman, ComposeKind::PodmanCompose, false);
        assert_eq!(rt.compose(["ps"]), vec!["podman-compose", "ps"]);
        assert_eq!(rt.command(["ps"]), vec!["podman", "ps"]);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable_failure("dial tcp: connection refused"));
        assert!(is_retryable_failure("network is unreachable"));
        assert!(is_retryable_failure("i/o timeout"));
        assert!(!is_retryable_failure("invalid compose file"));
    }
}
