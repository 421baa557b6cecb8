//! An embeddable raft node runtime.
//!
//! `replica` turns a user-supplied deterministic state machine ([`Fsm`]) into
//! a replicated state machine across a dynamic cluster of peers. It provides
//! replicated proposals, linearizable reads, dynamic membership with
//! voter/learner/staging promotion, leadership transfer, log compaction with
//! CRC-protected snapshots, and recovery from persisted state.
//!
//! The consensus algorithm itself is consumed from the `raft` crate; this
//! crate supplies the runtime around it: the event loop, the durable storage
//! plane, per-peer send pipelines and the administrative surface.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use replica::{Config, Node, StartOption};
//! use replica::transport::memory::Router;
//! # use std::io::Read;
//! # struct KvFsm;
//! # impl replica::Fsm for KvFsm {
//! #     fn apply(&self, _data: &[u8]) {}
//! #     fn snapshot(&self) -> replica::Result<Box<dyn Read + Send>> {
//! #         Ok(Box::new(std::io::empty()))
//! #     }
//! #     fn restore(&self, _data: Box<dyn Read + Send>) -> replica::Result<()> { Ok(()) }
//! # }
//!
//! # async fn run() -> replica::Result<()> {
//! let router = Router::new();
//! let node = Node::new(
//!     Arc::new(KvFsm),
//!     Arc::new(router.clone()),
//!     Config::new().with_state_dir("/var/lib/replica"),
//! )?;
//! router.register("mem://1", node.handler());
//!
//! let handle = node.clone();
//! tokio::spawn(async move {
//!     let _ = handle
//!         .start(vec![
//!             StartOption::InitCluster,
//!             StartOption::Members(vec!["1=mem://1".to_string()]),
//!         ])
//!         .await;
//! });
//! node.replicate(b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

mod cluster;
mod config;
mod controller;
mod engine;
mod error;
mod membership;
mod msgbus;
mod storage;

pub mod metrics;
pub mod transport;

pub use cluster::{Node, StartOption};
pub use config::Config;
pub use engine::Fsm;
pub use error::{Error, Result};
pub use membership::{MemberType, RawMember, NONE_ID};
pub use storage::{SnapshotData, SnapshotFile};
