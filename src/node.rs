//! Wires the memory region, page directory, fault interceptor, and RPC
//! transport into one running node.

use std::path::Path;

use log::info;

use crate::config::NodeConfig;
use crate::directory::PageDirectory;
use crate::engine::Engine;
use crate::error::Result;
use crate::fault::FaultInterceptor;
use crate::memregion::MemoryRegion;
use crate::rpc::{Client, Server};

/// A running IVY node: owns the process-wide fault trap and RPC server
/// for the lifetime of the process. There is no shutdown path, matching
/// the design, a node runs until the process exits.
pub struct Node {
    engine: &'static Engine,
    _interceptor: FaultInterceptor,
    _server: Server,
}

impl Node {
    /// Loads `config_path`, reserves the shared region, and starts
    /// serving as `node_id`: installs the fault interceptor, binds the
    /// RPC server on this node's configured endpoint, and returns once
    /// both are up.
    ///
    /// # Errors
    ///
    /// Returns any [`crate::error::Error`] encountered loading the
    /// config, reserving the region, or installing the trap/server.
    pub fn start(config_path: &Path, node_id: usize) -> Result<Self> {
        let config = NodeConfig::load(config_path, node_id)?;
        info!(
            "node {node_id}: {} peers, manager is node {}, region {:#x}+{:#x}",
            config.nodes.len(),
            config.manager_id,
            config.base_addr,
            config.region_size
        );

        let region = MemoryRegion::reserve(config.base_addr, config.region_size)?;
        let directory = PageDirectory::new(config.base_addr, crate::config::PAGE_SIZE, config.page_count());
        let client = Client::new(config.nodes.clone());

        let endpoint = config.nodes[node_id].clone();
        let engine = Box::leak(Box::new(Engine::new(node_id, config, region, directory, client)));

        // SAFETY: `engine` was just leaked above, so it lives for the
        // remainder of the process, satisfying `install`'s requirement
        // that the engine outlive every subsequent fault.
        let interceptor = unsafe { FaultInterceptor::install(engine)? };

        let server = Server::bind(&endpoint, engine)?;
        info!("node {node_id}: listening on {endpoint}");

        Ok(Self {
            engine,
            _interceptor: interceptor,
            _server: server,
        })
    }

    /// The engine backing this node, for diagnostics or tests that want
    /// to drive faults without going through an actual `SIGSEGV`.
    #[must_use]
    pub const fn engine(&self) -> &'static Engine {
        self.engine
    }
}
