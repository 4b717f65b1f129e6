//! Minimal node-starting binary.
//!
//! Usage: `ivy_node <config-path> <node-id>`. Loads the config, starts
//! serving as `node-id`, and blocks forever. Building a workload on top
//! of the shared region (sorting, dot products, ping-pong benchmarks) is
//! left to a separate program; this binary only starts the node.

use std::path::Path;
use std::process::ExitCode;

use ivydsm::Node;

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let [_, config_path, node_id] = args.as_slice() else {
        eprintln!("usage: ivy_node <config-path> <node-id>");
        return ExitCode::FAILURE;
    };

    let Ok(node_id) = node_id.parse::<usize>() else {
        eprintln!("node id {node_id:?} is not a valid index");
        return ExitCode::FAILURE;
    };

    match Node::start(Path::new(config_path), node_id) {
        Ok(node) => {
            let _node = node;
            loop {
                std::thread::park();
            }
        }
        Err(e) => {
            eprintln!("[{}] {e}", e.kind());
            ExitCode::FAILURE
        }
    }
}
