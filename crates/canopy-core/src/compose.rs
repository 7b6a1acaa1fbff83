//! Compose file inspector
//!
//! Parses the workspace's compose file to answer the three questions the
//! engine asks: which services exist, which host ports they want, and
//! what their storage surface (named volumes and bind mounts) looks like.

use serde_yaml::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CanopyError, Result};

/// Compose file names, checked in order
const COMPOSE_FILE_NAMES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

/// Kind of storage a service mounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeKind {
    /// Runtime-managed named volume
    Named,
    /// Host path mounted into the container
    Bind,
}

/// One element of a workspace's storage surface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeSpec {
    /// Name as it appears in the compose file (volume name or host path)
    pub logical_name: String,
    pub kind: VolumeKind,
}

impl VolumeSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            logical_name: name.into(),
            kind: VolumeKind::Named,
        }
    }

    pub fn bind(path: impl Into<String>) -> Self {
        Self {
            logical_name: path.into(),
            kind: VolumeKind::Bind,
        }
    }
}

/// Parsed compose file
#[derive(Debug)]
pub struct ComposeFile {
    path: PathBuf,
    doc: Value,
}

impl ComposeFile {
    /// Locate and parse the compose file in a workspace directory.
    ///
    /// Returns `Ok(None)` when the directory declares no compose file;
    /// a workspace without containers is legal.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        for name in COMPOSE_FILE_NAMES {
            let path = dir.join(name);
            if path.is_file() {
                debug!(category = "workspace", file = name, "Found compose file");
                return Self::parse_file(path).map(Some);
            }
        }
        Ok(None)
    }

    fn parse_file(path: PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: PathBuf) -> Result<Self> {
        let doc: Value =
            serde_yaml::from_str(content).map_err(|e| CanopyError::ComposeFileInvalid {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { path, doc })
    }

    /// Path of the compose file on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn services_map(&self) -> Option<&serde_yaml::Mapping> {
        self.doc.get("services").and_then(|v| v.as_mapping())
    }

    /// Service names, in file order
    pub fn services(&self) -> Vec<String> {
        self.services_map()
            .map(|m| {
                m.keys()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `${NAME_PORT:-default}` published-port interpolations per service.
    ///
    /// Returns `(service, env_name, default_port)` tuples; the engine feeds
    /// these to the port registry. A service without an interpolated port
    /// gets no allocation.
    pub fn service_base_ports(&self) -> Vec<(String, String, u16)> {
        let Some(services) = self.services_map() else {
            return Vec::new();
        };

        let mut results = Vec::new();
        for (name, service) in services {
            let Some(service_name) = name.as_str() else {
                continue;
            };
            let Some(ports) = service.get("ports").and_then(|v| v.as_sequence()) else {
                continue;
            };
            for item in ports {
                let published = match item {
                    Value::String(s) => Some(s.as_str()),
                    Value::Mapping(map) => map
                        .get(Value::String("published".to_string()))
                        .and_then(|v| v.as_str()),
                    _ => None,
                };
                if let Some((env, port)) = published.and_then(parse_port_env_default) {
                    results.push((service_name.to_string(), env, port));
                }
            }
        }
        results
    }

    /// Deduplicated storage surface across all services.
    ///
    /// Named volumes are sources that also appear in the top-level
    /// `volumes:` table (or that are not path-shaped); bind mounts are
    /// path-shaped sources, kept relative as written.
    pub fn volume_surface(&self) -> Vec<VolumeSpec> {
        let declared_volumes: HashSet<String> = self
            .doc
            .get("volumes")
            .and_then(|v| v.as_mapping())
            .map(|m| {
                m.keys()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let Some(services) = self.services_map() else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut surface = Vec::new();
        for service in services.values() {
            let Some(mounts) = service.get("volumes").and_then(|v| v.as_sequence()) else {
                continue;
            };
            for mount in mounts {
                let spec = match mount {
                    Value::String(s) => parse_short_mount(s, &declared_volumes),
                    Value::Mapping(map) => parse_long_mount(map),
                    _ => None,
                };
                if let Some(spec) = spec {
                    if seen.insert(spec.clone()) {
                        surface.push(spec);
                    }
                }
            }
        }
        surface
    }
}

/// Parse `${NAME:-default}` out of a published-port string.
fn parse_port_env_default(value: &str) -> Option<(String, u16)> {
    let start = value.find("${")?;
    let rest = &value[start + 2..];
    let end = rest.find('}')?;
    let inner = &rest[..end];
    let (name, default) = inner.split_once(":-")?;
    let port = default.parse::<u16>().ok()?;
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), port))
}

/// Short mount syntax: `source:/target[:ro]`. Anonymous mounts (`/target`
/// alone) carry no source and are skipped.
fn parse_short_mount(value: &str, declared: &HashSet<String>) -> Option<VolumeSpec> {
    // `/container/path` alone is an anonymous volume and carries no source
    let (source, _target) = value.split_once(':')?;
    let source = source.trim();
    if source.is_empty() {
        return None;
    }
    if is_path_shaped(source) {
        Some(VolumeSpec::bind(source))
    } else if declared.contains(source) || !source.contains('/') {
        Some(VolumeSpec::named(source))
    } else {
        None
    }
}

/// Long mount syntax: `{type: volume|bind, source, target}`.
fn parse_long_mount(map: &serde_yaml::Mapping) -> Option<VolumeSpec> {
    let kind = map
        .get(Value::String("type".to_string()))
        .and_then(|v| v.as_str())?;
    let source = map
        .get(Value::String("source".to_string()))
        .and_then(|v| v.as_str())?;
    match kind {
        "volume" => Some(VolumeSpec::named(source)),
        "bind" => Some(VolumeSpec::bind(source)),
        _ => None,
    }
}

fn is_path_shaped(source: &str) -> bool {
    source.starts_with('/') || source.starts_with("./") || source.starts_with("../")
}
