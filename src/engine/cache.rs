//! In-memory log cache backing the consensus primitive.
//!
//! Wraps the raft memory storage and layers snapshot bookkeeping on top: the
//! primitive is only ever handed metadata of snapshots that exist as files on
//! disk, since followers fetch the payload out of band. When raft demands a
//! snapshot newer than the newest file, the snapshot task is nudged.

use std::sync::{Arc, Mutex};

use raft::eraftpb::{ConfState, Entry, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use tokio::sync::mpsc;

/// Metadata of the newest snapshot file on disk.
#[derive(Debug, Clone)]
pub(crate) struct SnapMeta {
    pub term: u64,
    pub index: u64,
    pub conf_state: ConfState,
}

#[derive(Clone)]
pub(crate) struct LogCache {
    mem: MemStorage,
    snap_meta: Arc<Mutex<Option<SnapMeta>>>,
    snapc: mpsc::Sender<()>,
}

impl LogCache {
    pub(crate) fn new(snapc: mpsc::Sender<()>) -> LogCache {
        LogCache {
            mem: MemStorage::new(),
            snap_meta: Arc::new(Mutex::new(None)),
            snapc,
        }
    }

    pub(crate) fn mem(&self) -> &MemStorage {
        &self.mem
    }

    pub(crate) fn set_snap_meta(&self, meta: SnapMeta) {
        *self.snap_meta.lock().unwrap() = Some(meta);
    }

    pub(crate) fn snap_meta(&self) -> Option<SnapMeta> {
        self.snap_meta.lock().unwrap().clone()
    }
}

impl Storage for LogCache {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let meta = self.snap_meta.lock().unwrap().clone();
        match meta {
            Some(meta) => {
                if meta.index < request_index {
                    // A newer snapshot is wanted; nudge the snapshot task. The
                    // stale one is still useful, the follower catches up with
                    // entries after applying it.
                    let _ = self.snapc.try_send(());
                }
                let mut snap = Snapshot::default();
                snap.mut_metadata().term = meta.term;
                snap.mut_metadata().index = meta.index;
                snap.mut_metadata().set_conf_state(meta.conf_state);
                Ok(snap)
            }
            None => {
                let _ = self.snapc.try_send(());
                Err(raft::Error::Store(
                    StorageError::SnapshotTemporarilyUnavailable,
                ))
            }
        }
    }
}
