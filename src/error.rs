//! Error types for the replica runtime.
//!
//! All fallible operations in this crate return [`Result`]. The error enum is
//! cloneable so the engine can broadcast a failure to every waiter subscribed
//! on the message bus; variants that wrap foreign errors carry their display
//! form.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Lifecycle
    #[error("raft: node not ready yet or has been stopped")]
    Stopped,

    #[error("raft: no elected cluster leader")]
    NoLeader,

    // Preconditions
    #[error("raft: operation not permitted, node is not the leader")]
    NotLeader,

    #[error("raft: node is not yet part of a raft cluster")]
    NotJoined,

    #[error("raft: unknown member {0:x}")]
    NotMember(u64),

    #[error("raft: member {0:x} already removed")]
    AlreadyRemoved(u64),

    #[error("raft: address {addr} used by member {id:x}")]
    AddressInUse { id: u64, addr: String },

    #[error("raft: id used by member {0:x}")]
    IdInUse(u64),

    #[error("raft: member {0:x} is the leader and cannot be removed, transfer leadership first")]
    RemoveLeader(u64),

    #[error("raft: quorum lost and the cluster unavailable, no new logs can be committed")]
    QuorumLost,

    #[error("raft: member {0:x} is not a learner")]
    NotLearner(u64),

    #[error("raft: promotion failed, member {0:x} not synced with the leader yet")]
    NotCaughtUp(u64),

    #[error("raft: failed to find longest active member")]
    NoLongestActive,

    // Storage
    #[error("raft/storage: empty snapshot file")]
    EmptySnapshot,

    #[error("raft/storage: invalid snapshot file format")]
    SnapshotFormat,

    #[error("raft/storage: snapshot file corrupted, crc mismatch")]
    CrcMismatch,

    #[error("raft/storage: no available snapshot")]
    NoSnapshot,

    #[error("raft/storage: snapshot file already closed")]
    ClosedSnapshot,

    // Bootstrap
    #[error("raft/bootstrap: {0}")]
    Bootstrap(String),

    // Transport
    #[error("raft: cluster member {0:x}, buffer is full (overloaded network)")]
    Overloaded(u64),

    #[error("raft/transport: {0}")]
    Transport(String),

    // Foreign errors, carried by display form so the enum stays cloneable.
    #[error("io: {0}")]
    Io(String),

    #[error("raft: {0}")]
    Raft(String),

    #[error("codec: {0}")]
    Codec(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<raft::Error> for Error {
    fn from(err: raft::Error) -> Self {
        Error::Raft(err.to_string())
    }
}

impl From<protobuf::ProtobufError> for Error {
    fn from(err: protobuf::ProtobufError) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Codec(err.to_string())
    }
}
