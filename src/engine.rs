//! Coherence Engine.
//!
//! Implements the fixed-manager, single-writer/multiple-reader,
//! write-invalidate protocol: `GET_RD_PAGE` and `GET_WR_PAGE` are serviced
//! only by the manager; `FETCH_PG` is serviced by a page's current owner;
//! `INVALIDATE_PG` is serviced by a copyset member. A node never sends
//! itself an RPC for any of the four: when the local node is the target,
//! the equivalent state transition happens in-process instead.

use log::debug;

use crate::config::{NodeConfig, PAGE_SIZE};
use crate::directory::PageDirectory;
use crate::error::{Error, Result};
use crate::memregion::{AccessMode, MemoryRegion};
use crate::rpc::{Client, Frame, RpcHandler};

/// Whether a `FETCH_PG` should leave the source with `READ` access
/// (demoted from `WRITE`, servicing a read fault) or no access at all
/// (servicing a write fault's ownership transfer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    Demote,
    Release,
}

impl FetchMode {
    /// The literal wire token, matching spec.md §4.5.1's `mode ∈ {rd,none}`.
    const fn as_field(self) -> &'static str {
        match self {
            Self::Demote => "rd",
            Self::Release => "none",
        }
    }

    fn from_field(s: &str) -> Result<Self> {
        match s {
            "rd" => Ok(Self::Demote),
            "none" => Ok(Self::Release),
            other => Err(Error::RpcProtocol {
                name: "FETCH_PG",
                reason: format!("unknown fetch mode {other:?}"),
            }),
        }
    }
}

/// Ties the memory region, page directory, and RPC client together and
/// implements the four coherence RPCs plus the two fault entry points.
pub struct Engine {
    node_id: usize,
    config: NodeConfig,
    region: MemoryRegion,
    directory: PageDirectory,
    client: Client,
}

impl Engine {
    /// Builds an engine for `node_id`, over an already-reserved `region`
    /// and freshly-sized `directory`, talking to peers through `client`.
    #[must_use]
    pub fn new(node_id: usize, config: NodeConfig, region: MemoryRegion, directory: PageDirectory, client: Client) -> Self {
        Self {
            node_id,
            config,
            region,
            directory,
            client,
        }
    }

    /// The shared memory region this engine manages.
    #[must_use]
    pub const fn region(&self) -> &MemoryRegion {
        &self.region
    }

    const fn is_manager(&self) -> bool {
        self.config.is_manager(self.node_id)
    }

    fn manager_id(&self) -> usize {
        self.config.manager_id
    }

    /// Entry point called by the fault interceptor on a read fault for
    /// `page_addr` (already page-aligned).
    ///
    /// # Errors
    ///
    /// Returns whatever the manager round trip (or local servicing)
    /// failed with; per the design, any such failure is fatal to the
    /// process.
    pub fn on_read_fault(&self, page_addr: usize) -> Result<()> {
        let mut page = self.directory.page_lock(page_addr);

        // Only the manager's own directory entry is authoritative (§3); a
        // non-manager node's local `owner` field is never updated and must
        // never be trusted to short-circuit a request. The manager's own
        // first touch of a page it owns is the one case that legitimately
        // needs no RPC at all: nobody has ever shared or moved it.
        if self.is_manager() && self.node_id == self.info_owner(page_addr) {
            self.region.set_mode(page_addr, 1, AccessMode::Read)?;
            *page = AccessMode::Read;
            debug!("read fault at {page_addr:#x}: first touch as owner");
            return Ok(());
        }

        let bytes = if self.is_manager() {
            self.manager_service_get_rd(self.node_id, page_addr)?
        } else {
            let fields = self.client.call_blocking(
                self.manager_id(),
                "GET_RD_PAGE",
                vec![self.node_id.to_string(), format!("{page_addr:x}")],
            )?;
            decode_reply_page(&fields)?
        };

        self.region.write_page(page_addr, &bytes, AccessMode::Read)?;
        *page = AccessMode::Read;
        debug!("read fault at {page_addr:#x}: serviced");
        Ok(())
    }

    /// Entry point called by the fault interceptor on a write fault for
    /// `page_addr` (already page-aligned).
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::on_read_fault`].
    pub fn on_write_fault(&self, page_addr: usize) -> Result<()> {
        let mut page = self.directory.page_lock(page_addr);

        // Unlike the read-fault path, there is no safe local shortcut here:
        // even when this node is already the owner, it may have demoted
        // itself to READ while sharing the page (and may still be sitting
        // in the manager's copyset), so reclaiming WRITE still has to go
        // through `manager_service_get_wr`'s invalidation pass rather than
        // just flipping this node's own protection bits.
        let bytes = if self.is_manager() {
            self.manager_service_get_wr(self.node_id, page_addr)?
        } else {
            let fields = self.client.call_blocking(
                self.manager_id(),
                "GET_WR_PAGE",
                vec![self.node_id.to_string(), format!("{page_addr:x}")],
            )?;
            decode_optional_reply_page(&fields)?
        };

        match bytes {
            Some(bytes) => self.region.write_page(page_addr, &bytes, AccessMode::Write)?,
            None => self.region.set_mode(page_addr, 1, AccessMode::Write)?,
        }
        *page = AccessMode::Write;
        debug!("write fault at {page_addr:#x}: serviced, ownership transferred");
        Ok(())
    }

    fn info_owner(&self, page_addr: usize) -> usize {
        self.directory.info_lock(page_addr).owner
    }

    /// Manager-side logic for `GET_RD_PAGE`. Grants `requester` a READ
    /// copy, demoting the current owner from WRITE if necessary, and
    /// returns the page's current bytes.
    fn manager_service_get_rd(&self, requester: usize, page_addr: usize) -> Result<[u8; PAGE_SIZE]> {
        let mut info = self.directory.info_lock(page_addr);

        if info.owner == requester {
            return Err(Error::BadState(format!(
                "node {requester} requested GET_RD_PAGE for {page_addr:#x} it already owns"
            )));
        }

        let owner = info.owner;
        let bytes = self.fetch_from(owner, page_addr, FetchMode::Demote)?;
        // The owner keeps a READ copy after being demoted from WRITE, so it
        // is itself a copyset member now (§3: "may include the owner when
        // the owner is in READ mode"), alongside the requester.
        info.copyset.insert(owner);
        info.copyset.insert(requester);

        Ok(bytes)
    }

    /// Manager-side logic for `GET_WR_PAGE`. Invalidates every current
    /// reader, releases the owner, transfers ownership to `requester`, and
    /// returns the page's current bytes, or `None` if `requester` was
    /// already the owner, per §4.5.3/§4.5.5's "may reply with an empty
    /// body" case.
    fn manager_service_get_wr(&self, requester: usize, page_addr: usize) -> Result<Option<[u8; PAGE_SIZE]>> {
        let mut info = self.directory.info_lock(page_addr);

        for member in info.copyset.iter().copied().collect::<Vec<_>>() {
            if member != requester {
                self.invalidate_at(member, page_addr)
                    .map_err(|e| Error::InvalidationFailed {
                        page_addr,
                        reason: format!("node {member}: {e}"),
                    })?;
            }
        }
        info.copyset.clear();

        if info.owner == requester {
            return Ok(None);
        }

        let bytes = self.fetch_from(info.owner, page_addr, FetchMode::Release)?;
        info.owner = requester;

        Ok(Some(bytes))
    }

    /// Obtains `page_addr`'s current bytes from `target`, leaving it in
    /// the state `mode` specifies. If `target` is this node, the
    /// transition happens locally with no RPC.
    fn fetch_from(&self, target: usize, page_addr: usize, mode: FetchMode) -> Result<[u8; PAGE_SIZE]> {
        if target == self.node_id {
            let bytes = self.region.read_page(page_addr);
            let restore = match mode {
                FetchMode::Demote => AccessMode::Read,
                FetchMode::Release => AccessMode::None,
            };
            self.region.set_mode(page_addr, 1, restore)?;
            return Ok(bytes);
        }

        let fields = self.client.call_blocking(
            target,
            "FETCH_PG",
            vec![format!("{page_addr:x}"), mode.as_field().to_owned()],
        )?;
        decode_reply_page(&fields)
    }

    /// Tells `target` to drop its READ copy of `page_addr`. If `target`
    /// is this node, the transition happens locally with no RPC.
    fn invalidate_at(&self, target: usize, page_addr: usize) -> Result<()> {
        if target == self.node_id {
            self.region.set_mode(page_addr, 1, AccessMode::None)?;
            return Ok(());
        }

        self.client
            .call_blocking(target, "INVALIDATE_PG", vec![format!("{page_addr:x}")])?;
        Ok(())
    }
}

fn parse_page_addr(field: &str, rpc_name: &'static str) -> Result<usize> {
    usize::from_str_radix(field, 16).map_err(|e| Error::RpcProtocol {
        name: rpc_name,
        reason: format!("bad page address {field:?}: {e}"),
    })
}

fn decode_reply_page(fields: &[String]) -> Result<[u8; PAGE_SIZE]> {
    let hex = fields.first().ok_or_else(|| Error::RpcProtocol {
        name: "<reply>",
        reason: "missing page field".to_owned(),
    })?;
    crate::rpc::wire::decode_page(hex)
}

/// As [`decode_reply_page`], but an empty reply (no fields, or one empty
/// field) is a valid `None` rather than a protocol error, the
/// "requester was already the owner" case of `GET_WR_PAGE`.
fn decode_optional_reply_page(fields: &[String]) -> Result<Option<[u8; PAGE_SIZE]>> {
    match fields.first() {
        None => Ok(None),
        Some(hex) if hex.is_empty() => Ok(None),
        Some(hex) => crate::rpc::wire::decode_page(hex).map(Some),
    }
}

impl RpcHandler for Engine {
    fn handle(&self, frame: &Frame) -> Result<Vec<String>> {
        match frame.name.as_str() {
            "GET_RD_PAGE" => {
                let requester = frame.fields.first().ok_or_else(|| Error::RpcProtocol {
                    name: "GET_RD_PAGE",
                    reason: "missing requester field".to_owned(),
                })?;
                let requester: usize = requester.parse().map_err(|e| Error::RpcProtocol {
                    name: "GET_RD_PAGE",
                    reason: format!("bad requester id {requester:?}: {e}"),
                })?;
                let page_addr = parse_page_addr(
                    frame.fields.get(1).ok_or_else(|| Error::RpcProtocol {
                        name: "GET_RD_PAGE",
                        reason: "missing page address field".to_owned(),
                    })?,
                    "GET_RD_PAGE",
                )?;
                let mut page = self.directory.page_lock(page_addr);
                // This node (the manager) is the one being demoted iff it was
                // the owner: `manager_service_get_rd` leaves its own local
                // mode at READ in that case and untouched otherwise.
                let was_owner = self.info_owner(page_addr) == self.node_id;
                let bytes = self.manager_service_get_rd(requester, page_addr)?;
                if was_owner {
                    *page = AccessMode::Read;
                }
                Ok(vec![crate::rpc::wire::encode_page(&bytes)])
            }
            "GET_WR_PAGE" => {
                let requester = frame.fields.first().ok_or_else(|| Error::RpcProtocol {
                    name: "GET_WR_PAGE",
                    reason: "missing requester field".to_owned(),
                })?;
                let requester: usize = requester.parse().map_err(|e| Error::RpcProtocol {
                    name: "GET_WR_PAGE",
                    reason: format!("bad requester id {requester:?}: {e}"),
                })?;
                let page_addr = parse_page_addr(
                    frame.fields.get(1).ok_or_else(|| Error::RpcProtocol {
                        name: "GET_WR_PAGE",
                        reason: "missing page address field".to_owned(),
                    })?,
                    "GET_WR_PAGE",
                )?;
                let mut page = self.directory.page_lock(page_addr);
                let bytes = self.manager_service_get_wr(requester, page_addr)?;
                // This RPC is only ever received from a remote peer (the
                // manager services its own write faults through
                // `manager_service_get_wr` directly, never via this wire
                // path), so the manager itself is never `requester` here: it
                // ends the transaction either invalidated out of the
                // copyset, released as the old owner, or already at NONE.
                *page = AccessMode::None;
                Ok(bytes.map_or_else(Vec::new, |b| vec![crate::rpc::wire::encode_page(&b)]))
            }
            "FETCH_PG" => {
                let page_addr = parse_page_addr(
                    frame.fields.first().ok_or_else(|| Error::RpcProtocol {
                        name: "FETCH_PG",
                        reason: "missing page address field".to_owned(),
                    })?,
                    "FETCH_PG",
                )?;
                let mode = FetchMode::from_field(frame.fields.get(1).ok_or_else(|| Error::RpcProtocol {
                    name: "FETCH_PG",
                    reason: "missing mode field".to_owned(),
                })?)?;

                let mut page = self.directory.page_lock(page_addr);
                let bytes = self.region.read_page(page_addr);
                let restore = match mode {
                    FetchMode::Demote => AccessMode::Read,
                    FetchMode::Release => AccessMode::None,
                };
                self.region.set_mode(page_addr, 1, restore)?;
                *page = restore;
                Ok(vec![crate::rpc::wire::encode_page(&bytes)])
            }
            "INVALIDATE_PG" => {
                let page_addr = parse_page_addr(
                    frame.fields.first().ok_or_else(|| Error::RpcProtocol {
                        name: "INVALIDATE_PG",
                        reason: "missing page address field".to_owned(),
                    })?,
                    "INVALIDATE_PG",
                )?;
                let mut page = self.directory.page_lock(page_addr);
                self.region.set_mode(page_addr, 1, AccessMode::None)?;
                *page = AccessMode::None;
                Ok(Vec::new())
            }
            other => Err(Error::RpcProtocol {
                name: "<dispatch>",
                reason: format!("unknown RPC {other:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::rpc::Server;

    /// Wraps an [`Engine`] to count inbound RPCs it services, so tests can
    /// assert on the number of wire round trips a scenario actually causes
    /// without guessing at internal call counts.
    struct CountingHandler {
        inner: &'static Engine,
        calls: AtomicUsize,
    }

    impl RpcHandler for CountingHandler {
        fn handle(&self, frame: &Frame) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.handle(frame)
        }
    }

    /// Builds a two-node cluster (node 0 is always the manager) entirely
    /// in-process: each side gets its own real, independently backed
    /// `MemoryRegion` (see `MemoryRegion::reserve_for_test`) so writes on
    /// one node are never visible on the other except through the
    /// coherence protocol, wired together over real loopback TCP servers
    /// started on fixed ports, exactly as `rpc::transport`'s own tests do.
    /// Node 0's server is wrapped in a [`CountingHandler`] so tests can
    /// observe exactly how many RPCs the manager actually served.
    fn build_pair(port_base: u16, logical_base: usize) -> (&'static Engine, &'static Engine, &'static CountingHandler) {
        let addr0 = format!("127.0.0.1:{port_base}");
        let addr1 = format!("127.0.0.1:{}", port_base + 1);
        let nodes = vec![addr0.clone(), addr1.clone()];

        let region0 = MemoryRegion::reserve_for_test(logical_base, PAGE_SIZE).expect("reserve node0 region");
        let region1 = MemoryRegion::reserve_for_test(logical_base, PAGE_SIZE).expect("reserve node1 region");
        let directory0 = PageDirectory::new(logical_base, PAGE_SIZE, 1);
        let directory1 = PageDirectory::new(logical_base, PAGE_SIZE, 1);

        let config0 = NodeConfig {
            nodes: nodes.clone(),
            manager_id: 0,
            region_size: PAGE_SIZE,
            base_addr: logical_base,
        };
        let config1 = NodeConfig {
            nodes: nodes.clone(),
            manager_id: 0,
            region_size: PAGE_SIZE,
            base_addr: logical_base,
        };

        let engine0 = Box::leak(Box::new(Engine::new(0, config0, region0, directory0, Client::new(nodes.clone()))));
        let engine1 = Box::leak(Box::new(Engine::new(1, config1, region1, directory1, Client::new(nodes.clone()))));

        let counter = Box::leak(Box::new(CountingHandler {
            inner: engine0,
            calls: AtomicUsize::new(0),
        }));

        Server::bind(&addr0, counter).expect("bind node0");
        Server::bind(&addr1, engine1).expect("bind node1");

        (engine0, engine1, counter)
    }

    /// S1: both nodes alternate write faults and increment a byte at
    /// offset 0. After N alternations the value must equal N on whichever
    /// node last wrote it — a monotonic counter with no lost updates.
    #[test]
    fn s1_ping_pong_counter_increments_monotonically_across_two_nodes() {
        let (engine0, engine1, _counter) = build_pair(29_500, 0x0000_4000_0000_0000);
        let page = engine0.region().base();

        let mut expected = 0_u8;
        for round in 0..6_u8 {
            let engine = if round % 2 == 0 { engine0 } else { engine1 };
            engine.on_write_fault(page).expect("write fault");

            let mut bytes = engine.region().read_page(page);
            bytes[0] = bytes[0].wrapping_add(1);
            engine.region().write_page(page, &bytes, AccessMode::Write).expect("increment");

            expected += 1;
            assert_eq!(bytes[0], expected, "round {round}: lost update");
        }
    }

    /// S2: a node reading a page the manager just wrote fetches it in
    /// exactly one `GET_RD_PAGE` round trip, and ends up holding READ
    /// locally (so a real second read would never fault again).
    #[test]
    fn s2_read_sharing_fetches_the_manager_exactly_once() {
        let (engine0, engine1, counter) = build_pair(29_510, 0x0000_4000_1000_0000);
        let page = engine0.region().base();

        engine0.on_write_fault(page).expect("manager write fault");
        let mut bytes = [0_u8; PAGE_SIZE];
        bytes[0..4].copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        engine0.region().write_page(page, &bytes, AccessMode::Write).expect("seed bytes");

        engine1.on_read_fault(page).expect("node1 read fault");

        assert_eq!(
            counter.calls.load(Ordering::SeqCst),
            1,
            "expected exactly one GET_RD_PAGE round trip"
        );
        assert_eq!(engine1.region().read_page(page), bytes);
        assert_eq!(*engine1.directory.page_lock(page), AccessMode::Read);
    }

    /// S5 (negative test): once a node owns a page in WRITE, a redundant
    /// fault-equivalent call generates no invalidation or fetch traffic
    /// beyond the self-request check-in itself — matching the fact that a
    /// real write to an already-WRITE-protected page never raises
    /// `SIGSEGV` in the first place.
    #[test]
    fn s5_already_owned_write_access_needs_no_extra_rpc_traffic() {
        let (engine0, engine1, counter) = build_pair(29_520, 0x0000_4000_2000_0000);
        let page = engine0.region().base();

        engine1.on_write_fault(page).expect("node1 acquires ownership");
        assert_eq!(
            counter.calls.load(Ordering::SeqCst),
            1,
            "the initial transfer is one GET_WR_PAGE round trip"
        );
        assert_eq!(*engine1.directory.page_lock(page), AccessMode::Write);

        let before = engine1.region().read_page(page);
        engine1.on_write_fault(page).expect("redundant write fault");
        assert_eq!(
            counter.calls.load(Ordering::SeqCst),
            2,
            "only the self-request check-in, no cascading RPCs"
        );
        assert_eq!(engine1.region().read_page(page), before, "contents must be unchanged by a self-request");
    }
}
