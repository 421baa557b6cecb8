//! Durable storage plane: write-ahead log plus snapshot files.

mod snapshot;
mod wal;

pub use snapshot::{SnapshotData, SnapshotFile};

pub(crate) use snapshot::Snapshotter;
pub(crate) use wal::BootState;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use raft::eraftpb::{Entry, HardState};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::wal::Wal;

/// Owns `<statedir>/wal` and `<statedir>/snap`. The engine makes one
/// synchronous call per ready batch; durability precedes acknowledgment.
pub(crate) struct Storage {
    wal_dir: PathBuf,
    wal: Mutex<Option<Wal>>,
    snapshotter: Arc<Snapshotter>,
}

impl Storage {
    pub(crate) fn new(cfg: &Config) -> Result<Arc<Storage>> {
        let snapshotter = Arc::new(Snapshotter::new(cfg.snap_dir(), cfg.max_snapshot_files)?);
        Ok(Arc::new(Storage {
            wal_dir: cfg.wal_dir(),
            wal: Mutex::new(None),
            snapshotter,
        }))
    }

    pub(crate) fn snapshotter(&self) -> Arc<Snapshotter> {
        Arc::clone(&self.snapshotter)
    }

    /// Whether the state dir already holds log segments.
    pub(crate) fn has_state(&self) -> bool {
        Wal::exists(&self.wal_dir)
    }

    /// Discards every log segment; used by force-join and restore.
    pub(crate) fn wipe(&self) -> Result<()> {
        let wal = self.wal.lock().unwrap();
        if wal.is_some() {
            return Err(Error::Bootstrap(
                "cannot wipe an open write-ahead log".to_string(),
            ));
        }
        Wal::wipe(&self.wal_dir)
    }

    /// Opens the log, replaying whatever the previous run persisted.
    pub(crate) fn boot(&self) -> Result<BootState> {
        let (wal, state) = Wal::open(&self.wal_dir)?;
        *self.wal.lock().unwrap() = Some(wal);
        Ok(state)
    }

    fn with_wal<T>(&self, f: impl FnOnce(&mut Wal) -> Result<T>) -> Result<T> {
        let mut guard = self.wal.lock().unwrap();
        let wal = guard.as_mut().ok_or(Error::Stopped)?;
        f(wal)
    }

    /// Durably appends a hard state and entries batch; fsyncs before return.
    pub(crate) fn save(&self, hs: Option<&HardState>, entries: &[Entry]) -> Result<()> {
        self.with_wal(|wal| wal.save(hs, entries))
    }

    /// Records a snapshot marker so restart can locate the matching file.
    pub(crate) fn save_snapshot(&self, term: u64, index: u64) -> Result<()> {
        self.with_wal(|wal| wal.save_snapshot(term, index))
    }

    /// Records the local member identity in the log.
    pub(crate) fn save_metadata(&self, data: &[u8]) -> Result<()> {
        self.with_wal(|wal| wal.save_metadata(data))
    }

    /// Drops log segments wholly below `index`.
    pub(crate) fn compact(&self, index: u64) -> Result<()> {
        self.with_wal(|wal| wal.compact(index))
    }

    pub(crate) fn close(&self) {
        let mut guard = self.wal.lock().unwrap();
        if let Some(wal) = guard.as_mut() {
            if let Err(err) = wal.close() {
                log::error!("raft.storage: closing wal: {}", err);
            }
        }
        *guard = None;
    }
}
