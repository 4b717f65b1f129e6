//! Configuration file loading.
//!
//! Parses the small JSON document described by the external interface: an
//! ordered list of node endpoints, the manager's index into that list, the
//! shared region's size, and its base virtual address. Unknown keys are
//! ignored, matching the contract.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// The page size assumed throughout the crate (bytes).
pub const PAGE_SIZE: usize = 4096;

/// Parsed, validated node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Ordered endpoints, `"host:port"`, indexed 0..n-1.
    pub nodes: Vec<String>,
    /// Index into `nodes` of the manager.
    pub manager_id: usize,
    /// Size of the shared region in bytes, rounded down to a page multiple.
    pub region_size: usize,
    /// Base virtual address of the shared region, identical on every node.
    pub base_addr: usize,
}

/// Raw shape of the config file on disk; kept separate from [`NodeConfig`]
/// so deserialization failures and semantic validation failures are
/// reported with distinct error kinds.
#[derive(Debug, Deserialize)]
struct RawConfig {
    nodes: Vec<String>,
    manager_id: u64,
    region_sz: u64,
    base_addr: String,
}

impl NodeConfig {
    /// Loads and validates a config file for the given node id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigMissing`] if `path` does not exist,
    /// [`Error::ConfigFormat`] if a required key is absent, mistyped, or
    /// the base address is not valid hex, and [`Error::BadNodeId`] if
    /// `node_id >= nodes.len()`.
    pub fn load(path: &Path, node_id: usize) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|_| Error::ConfigMissing(path.display().to_string()))?;

        let raw: RawConfig = serde_json::from_str(&text)
            .map_err(|e| Error::ConfigFormat(e.to_string()))?;

        if node_id >= raw.nodes.len() {
            return Err(Error::BadNodeId {
                id: node_id,
                node_count: raw.nodes.len(),
            });
        }

        let manager_id = usize::try_from(raw.manager_id)
            .map_err(|_| Error::ConfigFormat("manager_id out of range".to_owned()))?;
        if manager_id >= raw.nodes.len() {
            return Err(Error::ConfigFormat(format!(
                "manager_id {manager_id} is out of range for {} nodes",
                raw.nodes.len()
            )));
        }

        let base_addr = parse_hex_addr(&raw.base_addr)?;

        let region_size = usize::try_from(raw.region_sz)
            .map_err(|_| Error::ConfigFormat("region_sz out of range".to_owned()))?;
        let region_size = region_size - (region_size % PAGE_SIZE);

        Ok(Self {
            nodes: raw.nodes,
            manager_id,
            region_size,
            base_addr,
        })
    }

    /// Number of pages in the shared region.
    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.region_size / PAGE_SIZE
    }

    /// `true` if `node_id` names the manager.
    #[must_use]
    pub const fn is_manager(&self, node_id: usize) -> bool {
        node_id == self.manager_id
    }
}

fn parse_hex_addr(s: &str) -> Result<usize> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| Error::ConfigFormat(format!("base_addr {s:?} is not hex-prefixed")))?;

    usize::from_str_radix(digits, 16)
        .map_err(|e| Error::ConfigFormat(format!("base_addr {s:?} is not valid hex: {e}")))
}
