//! Port registry
//!
//! The process-wide allocation table mapping `(workspace, service)` to a
//! host port. The on-disk file is authoritative: it is reloaded on
//! startup and rewritten atomically after every mutation, so no two
//! workspaces can ever be handed the same port.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CanopyError, Result};

/// Separator between the workspace and service components of a key
const KEY_SEPARATOR: char = ':';

/// On-disk port allocation table.
///
/// All mutations are linearized by a single mutex and persisted before
/// the lock is released. A malformed or missing file loads as an empty
/// registry; losing allocations is recoverable, corrupting them is not.
pub struct PortRegistry {
    path: PathBuf,
    table: Mutex<BTreeMap<String, u16>>,
}

impl PortRegistry {
    /// Open the registry at the given path, loading any existing table.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let table = Self::load_table(&path);
        debug!(
            category = "ports",
            path = %path.display(),
            entries = table.len(),
            "Opened port registry"
        );
        Self {
            path,
            table: Mutex::new(table),
        }
    }

    fn load_table(path: &Path) -> BTreeMap<String, u16> {
        let Ok(data) = std::fs::read_to_string(path) else {
            return BTreeMap::new();
        };
        match serde_json::from_str::<BTreeMap<String, u16>>(&data) {
            Ok(table) => table,
            Err(e) => {
                warn!(
                    category = "ports",
                    path = %path.display(),
                    error = %e,
                    "Malformed port registry file, starting empty"
                );
                BTreeMap::new()
            }
        }
    }

    fn key(workspace: &str, service: &str) -> String {
        format!("{workspace}{KEY_SEPARATOR}{service}")
    }

    /// Allocate a port for `(workspace, service)`.
    ///
    /// Idempotent: an existing entry is returned unchanged. Otherwise the
    /// smallest value >= `base_port` absent from the table's value set is
    /// inserted and persisted.
    pub fn allocate(&self, workspace: &str, service: &str, base_port: u16) -> Result<u16> {
        let mut table = self.table.lock().expect("port registry mutex poisoned");

        let key = Self::key(workspace, service);
        if let Some(port) = table.get(&key) {
            return Ok(*port);
        }

        let mut candidate = base_port;
        loop {
            if !table.values().any(|p| *p == candidate) {
                break;
            }
            candidate = candidate.checked_add(1).ok_or_else(|| {
                CanopyError::PortsExhausted {
                    workspace: workspace.to_string(),
                    service: service.to_string(),
                    base: base_port,
                }
            })?;
        }

        table.insert(key, candidate);
        self.persist(&table)?;

        debug!(
            category = "ports",
            workspace,
            service,
            port = candidate,
            "Allocated port"
        );
        Ok(candidate)
    }

    /// Release every allocation belonging to a workspace.
    ///
    /// The match is exact on the colon boundary: releasing "work" leaves
    /// "worktree" untouched. A missing workspace is a no-op, but the
    /// table is still persisted.
    pub fn release(&self, workspace: &str) -> Result<()> {
        let mut table = self.table.lock().expect("port registry mutex poisoned");

        let prefix = format!("{workspace}{KEY_SEPARATOR}");
        let before = table.len();
        table.retain(|key, _| !key.starts_with(&prefix));
        let removed = before - table.len();

        self.persist(&table)?;

        debug!(category = "ports", workspace, removed, "Released ports");
        Ok(())
    }

    /// Project the table to `service -> port` for one workspace.
    pub fn get_ports(&self, workspace: &str) -> BTreeMap<String, u16> {
        let table = self.table.lock().expect("port registry mutex poisoned");
        let prefix = format!("{workspace}{KEY_SEPARATOR}");
        table
            .iter()
            .filter_map(|(key, port)| {
                key.strip_prefix(&prefix).map(|service| (service.to_string(), *port))
            })
            .collect()
    }

    /// Snapshot of the whole table, for diagnostics.
    pub fn snapshot(&self) -> BTreeMap<String, u16> {
        self.table
            .lock()
            .expect("port registry mutex poisoned")
            .clone()
    }

    /// Rewrite the registry file atomically: temp file, fsync, rename.
    fn persist(&self, table: &BTreeMap<String, u16>) -> Result<()> {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("json.tmp");
            let json = serde_json::to_string_pretty(table)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        };
        write().map_err(|e| CanopyError::RegistryWriteFailed {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}
