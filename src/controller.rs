//! Glue between the transport server and the engine.
//!
//! The controller is what a wire binding calls into when peer traffic
//! arrives: raft messages are pushed into the engine, join and promote
//! requests are translated into administrative operations, and snapshot
//! pulls are answered straight from the snapshot directory.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use raft::eraftpb::{Message, MessageType};

use crate::cluster::Node;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::membership::{Pool, RawMember, NONE_ID};
use crate::storage::Snapshotter;
use crate::transport::{Handler, JoinResponse};

pub(crate) struct Controller {
    // Non-owning back-reference; the node owns the controller.
    node: Weak<Node>,
    engine: Arc<Engine>,
    pool: Arc<Pool>,
    snapshotter: Arc<Snapshotter>,
}

impl Controller {
    pub(crate) fn new(
        node: Weak<Node>,
        engine: Arc<Engine>,
        pool: Arc<Pool>,
        snapshotter: Arc<Snapshotter>,
    ) -> Controller {
        Controller {
            node,
            engine,
            pool,
            snapshotter,
        }
    }

    fn node(&self) -> Result<Arc<Node>> {
        self.node.upgrade().ok_or(Error::Stopped)
    }

    /// An inbound `MsgSnap` names a snapshot file on the sender; fetch it
    /// before the message reaches the engine so the install step finds it.
    async fn fetch_snapshot(&self, msg: &Message) -> Result<()> {
        let meta = msg.get_snapshot().get_metadata();
        if self.snapshotter.has(meta.term, meta.index) {
            return Ok(());
        }

        let member = self.pool.get(msg.from).ok_or(Error::NotMember(msg.from))?;
        let tr = self.engine.dialer().dial(&member.address()).await?;
        let bytes = tr.pull_snapshot(meta.term, meta.index).await?;
        log::info!(
            "raft.controller: fetched snapshot [term: {} | index: {}] from member {:x}",
            meta.term,
            meta.index,
            msg.from
        );
        self.snapshotter.install(meta.term, meta.index, &bytes)
    }
}

#[async_trait]
impl Handler for Controller {
    async fn message(&self, msg: Message) -> Result<()> {
        if msg.get_msg_type() == MessageType::MsgSnapshot {
            self.fetch_snapshot(&msg).await?;
        }
        self.engine.push(msg).await
    }

    async fn join(&self, mut m: RawMember) -> Result<JoinResponse> {
        let node = self.node()?;

        // A rejoining member keeps its id; fresh members get the next one.
        let known = self.pool.get(m.id).map(|known| known.address() == m.address);
        if m.id == NONE_ID || known == Some(false) {
            m.id = self.pool.next_id();
        }

        log::info!(
            "raft.controller: member {:x} requests to join the cluster",
            m.id
        );

        if known != Some(true) {
            node.add_member(&mut m).await?;
        }

        Ok(JoinResponse {
            id: m.id,
            members: self.pool.snapshot(),
        })
    }

    async fn promote(&self, m: RawMember) -> Result<()> {
        self.node()?.promote_member_forwarded(m.id).await
    }

    async fn pull_snapshot(&self, term: u64, index: u64) -> Result<Vec<u8>> {
        self.snapshotter.read_bytes(term, index)
    }
}
