//! Crate-wide error taxonomy.
//!
//! Every variant corresponds to one of the error categories named in the
//! design: configuration errors are non-fatal to the process (the caller
//! decides how to report them), everything else is treated as fatal by the
//! binary entry point. A failed coherence transaction or a rejected OS
//! request leaves the node's state undefined, so there is nothing safe left
//! to do but abort.

/// A node index, used in a handful of error variants for diagnostics.
pub type NodeId = usize;

/// The crate's single error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration file does not exist.
    #[error("config file not found: {0}")]
    ConfigMissing(String),

    /// The configuration file exists but is missing a required key or has
    /// the wrong type for one.
    #[error("config file has wrong format: {0}")]
    ConfigFormat(String),

    /// The node id supplied on the command line is `>= nodes.len()`.
    #[error("node id {id} is out of range for {node_count} configured nodes")]
    BadNodeId {
        /// The id that was rejected.
        id: NodeId,
        /// The number of configured nodes.
        node_count: usize,
    },

    /// Reserving the shared region failed at the OS level.
    #[error("failed to reserve shared memory region: {0}")]
    OsMap(String),

    /// Changing a page's protection failed at the OS level.
    #[error("failed to change page protection: {0}")]
    OsProt(String),

    /// Installing or handling the access-violation trap failed.
    #[error("signal handling failure: {0}")]
    OsSignal(String),

    /// Transport-level RPC failure. Never escapes `call_blocking`, which
    /// retries on this variant; it is public so that `call` (the
    /// non-retrying primitive) can surface single-attempt failures.
    #[error("RPC transport failure calling {name:?} on node {peer}: {reason}")]
    RpcTransient {
        /// The RPC name being called.
        name: &'static str,
        /// The peer node index.
        peer: NodeId,
        /// The underlying I/O or protocol reason.
        reason: String,
    },

    /// A reply could not be parsed, or had the wrong shape/length. This
    /// signals a programming error in either peer, not a recoverable
    /// condition.
    #[error("RPC protocol violation in {name:?}: {reason}")]
    RpcProtocol {
        /// The RPC name whose reply violated the wire contract.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// One or more invalidation targets failed to acknowledge an
    /// `INVALIDATE_PG` during a write-ownership transfer.
    #[error("invalidation failed for page {page_addr:#x}: {reason}")]
    InvalidationFailed {
        /// The page-aligned address being invalidated.
        page_addr: usize,
        /// Which target failed and why.
        reason: String,
    },

    /// A directory or protocol invariant was found violated. Always a bug.
    #[error("invariant violated: {0}")]
    BadState(String),

    /// A second [`crate::fault::FaultInterceptor`] was installed in the
    /// same process.
    #[error("a fault interceptor is already installed for this process")]
    DoubleInstall,
}

impl Error {
    /// Returns `true` for [`Error::RpcTransient`], the only variant
    /// [`crate::rpc::transport::call_blocking`] treats as retryable.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RpcTransient { .. })
    }

    /// Returns the taxonomy tag for this error, e.g. `"OS_PROT"`, used in
    /// fatal-exit diagnostics (`§7`: "the process aborts with a stderr
    /// diagnostic naming the kind").
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConfigMissing(_) => "CONFIG_MISSING",
            Self::ConfigFormat(_) => "CONFIG_FORMAT",
            Self::BadNodeId { .. } => "BAD_NODE_ID",
            Self::OsMap(_) => "OS_MAP",
            Self::OsProt(_) => "OS_PROT",
            Self::OsSignal(_) => "OS_SIGNAL",
            Self::RpcTransient { .. } => "RPC_TRANSIENT",
            Self::RpcProtocol { .. } => "RPC_PROTOCOL",
            Self::InvalidationFailed { .. } => "INVALIDATION_FAILED",
            Self::BadState(_) => "BAD_STATE",
            Self::DoubleInstall => "DOUBLE_INSTALL",
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
