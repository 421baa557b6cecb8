//! Abstract wire interfaces between replica nodes.
//!
//! The runtime never talks to the network directly: outbound traffic goes
//! through a [`Transport`] obtained from a [`Dial`], and inbound traffic is
//! delivered to the node's [`Handler`]. Concrete bindings (gRPC, HTTP) live
//! outside this crate; the [`memory`] binding here serves tests and embedders
//! that colocate nodes in one process.

use std::sync::Arc;

use async_trait::async_trait;
use raft::eraftpb::Message;

use crate::error::{Error, Result};
use crate::membership::RawMember;

/// Reply to a join request: the id assigned to the joiner and the current
/// membership as seen by the handling node.
#[derive(Debug, Clone)]
pub struct JoinResponse {
    pub id: u64,
    pub members: Vec<RawMember>,
}

/// Client side of the peer wire protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers a single raft message to the remote node.
    async fn round_trip(&self, msg: Message) -> Result<()>;

    /// Asks the remote node to admit `m` into the cluster.
    async fn join(&self, m: RawMember) -> Result<JoinResponse>;

    /// Asks the remote node (the leader) to promote the learner `m`.
    async fn promote(&self, m: RawMember) -> Result<()>;

    /// Pulls the raw bytes of the snapshot file named by `term`/`index`.
    async fn pull_snapshot(&self, term: u64, index: u64) -> Result<Vec<u8>>;

    /// Releases any underlying connection.
    async fn close(&self) {}
}

/// Establishes a [`Transport`] to the node listening on `addr`.
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Transport>>;
}

/// Server side of the peer wire protocol, implemented by the node controller.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Delivers an inbound raft message.
    async fn message(&self, msg: Message) -> Result<()>;

    /// Handles a join request from a prospective member.
    async fn join(&self, m: RawMember) -> Result<JoinResponse>;

    /// Handles a promotion forwarded by a follower.
    async fn promote(&self, m: RawMember) -> Result<()>;

    /// Serves the raw bytes of a snapshot file.
    async fn pull_snapshot(&self, term: u64, index: u64) -> Result<Vec<u8>>;
}

/// In-process transport: nodes register their handlers on a shared router and
/// messages are delivered by direct calls.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Shared address book mapping listen addresses to node handlers.
    /// Cloning yields another handle on the same book.
    #[derive(Clone, Default)]
    pub struct Router {
        nodes: Arc<Mutex<HashMap<String, Arc<dyn Handler>>>>,
    }

    impl Router {
        pub fn new() -> Router {
            Router::default()
        }

        /// Registers `handler` as the node listening on `addr`.
        pub fn register(&self, addr: &str, handler: Arc<dyn Handler>) {
            self.nodes
                .lock()
                .unwrap()
                .insert(addr.to_string(), handler);
        }

        /// Removes the node listening on `addr`.
        pub fn deregister(&self, addr: &str) {
            self.nodes.lock().unwrap().remove(addr);
        }

        fn lookup(&self, addr: &str) -> Result<Arc<dyn Handler>> {
            self.nodes
                .lock()
                .unwrap()
                .get(addr)
                .cloned()
                .ok_or_else(|| Error::Transport(format!("no node listening on {:?}", addr)))
        }
    }

    struct MemoryTransport {
        addr: String,
        router: Router,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn round_trip(&self, msg: Message) -> Result<()> {
            self.router.lookup(&self.addr)?.message(msg).await
        }

        async fn join(&self, m: RawMember) -> Result<JoinResponse> {
            self.router.lookup(&self.addr)?.join(m).await
        }

        async fn promote(&self, m: RawMember) -> Result<()> {
            self.router.lookup(&self.addr)?.promote(m).await
        }

        async fn pull_snapshot(&self, term: u64, index: u64) -> Result<Vec<u8>> {
            self.router
                .lookup(&self.addr)?
                .pull_snapshot(term, index)
                .await
        }
    }

    #[async_trait]
    impl Dial for Router {
        async fn dial(&self, addr: &str) -> Result<Arc<dyn Transport>> {
            // Resolution happens per call so a node that registers later, or
            // moves address, is picked up without redialing.
            Ok(Arc::new(MemoryTransport {
                addr: addr.to_string(),
                router: self.clone(),
            }))
        }
    }
}
