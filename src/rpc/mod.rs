//! RPC Transport: the named blocking request/reply substrate the
//! coherence engine runs its four RPCs over.

pub mod transport;
pub mod wire;

pub use transport::{Client, RpcHandler, Server};
pub use wire::{Frame, Reply};
