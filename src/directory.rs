//! Page Directory.
//!
//! Per-page metadata and fine-grained locking. Only the manager's copy of
//! `owner`/`copyset` is authoritative; every node (including the manager)
//! keeps its own `access` field for its local mode. Directory entries are
//! created lazily, one per page, the first time either lock is taken for
//! that page, but the backing storage is a flat, pre-sized table (a
//! "tagged index table", per the design notes), not a dynamic map with a
//! mutex per lookup, so acquiring a page's locks never contends with a
//! different page's.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use crate::memregion::AccessMode;

/// One page's worth of manager-authoritative ownership metadata.
#[derive(Debug, Clone)]
pub struct DirectoryInfo {
    /// The node currently holding the authoritative (WRITE-eligible) copy.
    pub owner: usize,
    /// Nodes currently holding a READ copy, as tracked by the manager.
    pub copyset: HashSet<usize>,
}

impl DirectoryInfo {
    /// The initial state for a lazily-created entry: owner is node 0, no
    /// copyset members, as specified.
    fn initial() -> Self {
        Self {
            owner: 0,
            copyset: HashSet::new(),
        }
    }
}

/// A single page's full directory entry: the manager-authoritative
/// ownership info (behind `info_lock`) plus this node's local access mode
/// (behind `page_lock`).
struct PageSlot {
    /// Serializes coherence actions for this page on this node.
    page_lock: Mutex<AccessMode>,
    /// Serializes updates to `owner`/`copyset`. Only meaningfully used on
    /// the manager, but present on every node for lock-order uniformity
    /// (and so the manager's own node doesn't need a special case).
    info_lock: Mutex<DirectoryInfo>,
}

impl PageSlot {
    fn new() -> Self {
        Self {
            page_lock: Mutex::new(AccessMode::None),
            info_lock: Mutex::new(DirectoryInfo::initial()),
        }
    }
}

/// An acquired page lock, guarding this node's local access mode for one
/// page. Holding this guard is what the design calls "holding `page_lock`".
pub type PageGuard<'a> = MutexGuard<'a, AccessMode>;

/// An acquired info lock, guarding the manager-authoritative directory
/// entry for one page.
pub type InfoGuard<'a> = MutexGuard<'a, DirectoryInfo>;

/// The page directory: one [`PageSlot`] per page in the shared region,
/// indexed by page number.
///
/// # Lock discipline
///
/// When both locks for the same page are held, `page_lock` is acquired
/// first and `info_lock` second. Never the other way around. A lock must
/// never be held across a blocking RPC to a *different* page.
pub struct PageDirectory {
    slots: Vec<PageSlot>,
    base: usize,
    page_size: usize,
}

impl PageDirectory {
    /// Creates a directory sized for `page_count` pages of a region
    /// starting at `base`, each `page_size` bytes. All entries start at
    /// their documented initial state (owner = 0, empty copyset, local
    /// access = NONE).
    #[must_use]
    pub fn new(base: usize, page_size: usize, page_count: usize) -> Self {
        let slots = (0..page_count).map(|_| PageSlot::new()).collect();
        Self {
            slots,
            base,
            page_size,
        }
    }

    fn index_of(&self, page_addr: usize) -> usize {
        (page_addr - self.base) / self.page_size
    }

    /// Acquires the per-page mutex guarding this node's local access mode.
    ///
    /// # Panics
    ///
    /// Panics if `page_addr` is not a page-aligned address within the
    /// directory's region, or if the lock is poisoned (a prior holder
    /// panicked while holding it. Per the crate's error model, a panic
    /// mid-transaction leaves the process in an unrecoverable state
    /// anyway).
    #[must_use]
    pub fn page_lock(&self, page_addr: usize) -> PageGuard<'_> {
        self.slots[self.index_of(page_addr)]
            .page_lock
            .lock()
            .expect("page_lock poisoned")
    }

    /// Acquires the per-page mutex guarding the manager-authoritative
    /// directory entry. See [`Self::page_lock`] for panic conditions.
    #[must_use]
    pub fn info_lock(&self, page_addr: usize) -> InfoGuard<'_> {
        self.slots[self.index_of(page_addr)]
            .info_lock
            .lock()
            .expect("info_lock poisoned")
    }

    /// Number of pages tracked by this directory.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.slots.len()
    }
}
