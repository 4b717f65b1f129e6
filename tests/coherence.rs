//! End-to-end coherence tests.
//!
//! Each test spawns real `ivy_node` processes wired together by a shared
//! config, then drives the protocol from outside as a raw RPC client —
//! exactly the shape a peer node's transport would speak. This exercises
//! the manager routing, the owner/copyset bookkeeping, and the cross-process
//! `FETCH_PG`/`INVALIDATE_PG` RPCs for real, without needing to actually
//! fault on the shared mapping from the test process (which does not have
//! it mapped).

use std::fs::File;
use std::io::{BufRead, BufReader, Write as _};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

/// Every node in these tests shares this base address and a one-page
/// region; only page 0 is ever touched.
const BASE_ADDR: usize = 0x0000_7000_0000_0000;
const PAGE_SIZE: usize = 4096;

fn base_addr_hex_prefixed() -> String {
    format!("{BASE_ADDR:#x}")
}

fn page_addr_field() -> String {
    format!("{BASE_ADDR:x}")
}

/// Picks a free-ish local port deterministically offset from the test's
/// name so parallel tests don't collide.
fn port_base(tag: u16) -> u16 {
    19000 + tag * 10
}

struct NodeCluster {
    children: Vec<Child>,
    config_path: PathBuf,
    pub nodes: Vec<String>,
}

impl NodeCluster {
    /// Writes a shared config for `node_count` nodes (node 0 is the
    /// manager) starting at consecutive ports from `port_base(tag)`, then
    /// spawns one `ivy_node` process per node and waits for each to start
    /// accepting connections.
    fn spawn(tag: u16, node_count: u16) -> Self {
        let base_port = port_base(tag);
        let nodes: Vec<String> = (0..node_count).map(|i| format!("127.0.0.1:{}", base_port + i)).collect();

        let mut config_path = std::env::temp_dir();
        config_path.push(format!("ivydsm-cluster-{tag}.json"));
        let config = format!(
            r#"{{"nodes": {nodes_json}, "manager_id": 0, "region_sz": {region_sz}, "base_addr": "{base_addr}"}}"#,
            nodes_json = serde_json_array(&nodes),
            region_sz = PAGE_SIZE,
            base_addr = base_addr_hex_prefixed(),
        );
        File::create(&config_path)
            .and_then(|mut f| f.write_all(config.as_bytes()))
            .expect("write cluster config");

        let bin = env!("CARGO_BIN_EXE_ivy_node");
        let children: Vec<Child> = (0..node_count)
            .map(|id| {
                Command::new(bin)
                    .arg(&config_path)
                    .arg(id.to_string())
                    .spawn()
                    .expect("spawn ivy_node")
            })
            .collect();

        for addr in &nodes {
            wait_for_port(addr, Duration::from_secs(5));
        }

        Self {
            children,
            config_path,
            nodes,
        }
    }
}

impl Drop for NodeCluster {
    fn drop(&mut self) {
        for child in &mut self.children {
            let _ = child.kill();
            let _ = child.wait();
        }
        let _ = std::fs::remove_file(&self.config_path);
    }
}

fn serde_json_array(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| format!("{s:?}")).collect();
    format!("[{}]", quoted.join(", "))
}

fn wait_for_port(addr: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("node at {addr} never came up");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Sends one request line to `addr` and returns the single reply line.
fn rpc(addr: &str, name: &str, fields: &[&str]) -> String {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");

    let line = if fields.is_empty() {
        format!("{name}\n")
    } else {
        format!("{name} {}\n", fields.join(":"))
    };
    stream.write_all(line.as_bytes()).expect("write request");

    let mut reader = BufReader::new(stream);
    let mut reply = String::new();
    reader.read_line(&mut reply).expect("read reply");
    reply.trim_end().to_owned()
}

#[test]
fn manager_rejects_a_self_request_for_a_page_it_already_owns() {
    let cluster = NodeCluster::spawn(1, 2);

    // Node 0 is the manager and starts as the owner of every page; asking
    // it for a READ copy of a page it already owns is the self-request
    // case the protocol must reject rather than RPC to itself.
    let reply = rpc(&cluster.nodes[0], "GET_RD_PAGE", &["0", &page_addr_field()]);
    assert!(reply.starts_with("NOT_OK"), "expected rejection, got {reply:?}");
}

#[test]
fn read_sharing_grants_copies_to_multiple_requesters() {
    let cluster = NodeCluster::spawn(2, 3);
    let page = page_addr_field();

    let first = rpc(&cluster.nodes[0], "GET_RD_PAGE", &["1", &page]);
    assert!(first.starts_with("OK:"), "node 1's read request failed: {first:?}");
    assert_eq!(first.len(), "OK:".len() + PAGE_SIZE * 2);

    let second = rpc(&cluster.nodes[0], "GET_RD_PAGE", &["2", &page]);
    assert!(second.starts_with("OK:"), "node 2's read request failed: {second:?}");
    assert_eq!(first, second, "both readers should see identical page contents");
}

#[test]
fn write_ownership_transfers_between_nodes_and_back() {
    let cluster = NodeCluster::spawn(3, 2);
    let page = page_addr_field();

    // Node 1 takes ownership away from the manager (node 0).
    let to_one = rpc(&cluster.nodes[0], "GET_WR_PAGE", &["1", &page]);
    assert!(to_one.starts_with("OK:"), "transfer to node 1 failed: {to_one:?}");

    // The manager wants it back: this now requires a real FETCH_PG RPC to
    // node 1, the current remote owner, not a local shortcut.
    let back_to_manager = rpc(&cluster.nodes[0], "GET_WR_PAGE", &["0", &page]);
    assert!(
        back_to_manager.starts_with("OK:"),
        "transfer back to the manager failed: {back_to_manager:?}"
    );
    assert_eq!(to_one, back_to_manager, "page contents must survive the round trip");
}

#[test]
fn write_request_for_a_page_the_requester_already_owns_replies_empty() {
    let cluster = NodeCluster::spawn(5, 1);
    let page = page_addr_field();

    // Node 0 is both the manager and, initially, the owner of every page;
    // asking it for WRITE access to a page it already owns must reply with
    // an empty body per spec.md §4.5.3/§4.5.5, not an error.
    let reply = rpc(&cluster.nodes[0], "GET_WR_PAGE", &["0", &page]);
    assert_eq!(reply, "OK", "expected an empty-body success, got {reply:?}");
}

#[test]
fn write_request_invalidates_a_demoted_owner_still_in_the_copyset() {
    let cluster = NodeCluster::spawn(6, 4);
    let page = page_addr_field();

    // Node 1 becomes the exclusive owner.
    let to_one = rpc(&cluster.nodes[0], "GET_WR_PAGE", &["1", &page]);
    assert!(to_one.starts_with("OK:"), "transfer to node 1 failed: {to_one:?}");

    // Node 2 reads it: the manager fetches from node 1 (demoting it to
    // READ) and the owner itself now also sits in the copyset alongside
    // node 2, per spec.md §3's "may include the owner when in READ mode".
    let shared = rpc(&cluster.nodes[0], "GET_RD_PAGE", &["2", &page]);
    assert!(shared.starts_with("OK:"), "read share to node 2 failed: {shared:?}");
    assert_eq!(to_one, shared, "the shared copy must match what node 1 held");

    // Node 3 now wants to write. Both node 1 (the demoted former owner,
    // still in the copyset) and node 2 must be invalidated, and the bytes
    // must still come from node 1 (the real current owner) via FETCH_PG.
    let to_three = rpc(&cluster.nodes[0], "GET_WR_PAGE", &["3", &page]);
    assert!(
        to_three.starts_with("OK:"),
        "transfer to node 3 failed (did the demoted owner's invalidation break the request?): {to_three:?}"
    );
    assert_eq!(to_one, to_three, "page contents must survive the transfer to node 3");

    // The copyset must have been cleared in the process: a second write
    // request from node 3 for the page it now owns is the "already owns
    // it" self-request case again, not a fresh invalidation round.
    let self_request = rpc(&cluster.nodes[0], "GET_WR_PAGE", &["3", &page]);
    assert_eq!(self_request, "OK", "expected empty-body self-request, got {self_request:?}");
}

#[test]
fn unknown_rpc_name_is_reported_as_not_ok() {
    let cluster = NodeCluster::spawn(4, 1);
    let reply = rpc(&cluster.nodes[0], "NOT_A_REAL_RPC", &[]);
    assert!(reply.starts_with("NOT_OK"), "expected rejection, got {reply:?}");
}

#[test]
fn malformed_config_path_exits_nonzero() {
    let bin = env!("CARGO_BIN_EXE_ivy_node");
    let status = Command::new(bin)
        .arg("/nonexistent/path/for/ivydsm/tests")
        .arg("0")
        .status()
        .expect("spawn ivy_node");
    assert!(!status.success());
}

#[test]
fn missing_arguments_exit_nonzero() {
    let bin = env!("CARGO_BIN_EXE_ivy_node");
    let status = Command::new(bin).status().expect("spawn ivy_node");
    assert!(!status.success());
}
