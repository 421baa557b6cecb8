//! Segment-based write-ahead log.
//!
//! The WAL is an ordered append of records: raft entries, hard states and
//! snapshot markers, each framed by a little-endian length prefix. Batches are
//! fsynced before `save` returns, so an entry visible after a crash implies
//! every earlier entry is durable. A torn record at the tail of the newest
//! segment is truncated away on open.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use protobuf::Message as PbMessage;
use raft::eraftpb::{Entry, HardState};
use serde::{Deserialize, Serialize};

use crate::error::Result;

const SEGMENT_EXT: &str = "wal";
/// Entry records per segment before rotation.
const SEGMENT_MAX_ENTRIES: u64 = 1024;
const SEGMENT_MAX_BYTES: u64 = 64 * 1024 * 1024;
const FRAME_HEADER_SIZE: u64 = 8;

#[derive(Debug, Serialize, Deserialize)]
enum WalRecord {
    /// Protobuf-encoded raft entry.
    Entry(Vec<u8>),
    /// Protobuf-encoded hard state; last record wins on replay.
    HardState(Vec<u8>),
    /// Marks that a snapshot file at (term, index) was recorded.
    Snapshot { term: u64, index: u64 },
    /// Opaque node metadata written once when the log is created.
    Metadata(Vec<u8>),
}

/// State recovered by replaying the WAL on open.
#[derive(Debug, Default)]
pub(crate) struct BootState {
    pub hard_state: Option<HardState>,
    pub entries: Vec<Entry>,
    /// Snapshot markers in append order, oldest first.
    pub snapshots: Vec<(u64, u64)>,
    pub metadata: Option<Vec<u8>>,
}

struct SealedSegment {
    path: PathBuf,
    max_entry_index: u64,
}

struct ActiveSegment {
    file: File,
    bytes: u64,
    entry_count: u64,
    max_entry_index: u64,
}

/// Append-only log of `(HardState, Entries[])` batches with segment rotation.
pub(crate) struct Wal {
    dir: PathBuf,
    sealed: BTreeMap<u64, SealedSegment>,
    active: ActiveSegment,
    active_seq: u64,
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{:016x}.{}", seq, SEGMENT_EXT))
}

fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if let Ok(seq) = u64::from_str_radix(stem, 16) {
                segments.push((seq, path));
            }
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Reads every intact record of a segment, truncating a torn tail in place.
fn read_records(path: &Path) -> Result<Vec<WalRecord>> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    let mut buf = Vec::with_capacity(len as usize);
    file.read_to_end(&mut buf)?;

    let mut records = Vec::new();
    let mut pos = 0u64;
    loop {
        let remaining = len - pos;
        if remaining == 0 {
            break;
        }
        if remaining < FRAME_HEADER_SIZE {
            truncate_tail(&mut file, path, pos)?;
            break;
        }

        let start = pos as usize;
        let frame_len = u64::from_le_bytes(buf[start..start + 8].try_into().unwrap());
        if remaining - FRAME_HEADER_SIZE < frame_len {
            truncate_tail(&mut file, path, pos)?;
            break;
        }

        let body = &buf[start + 8..start + 8 + frame_len as usize];
        match bincode::deserialize::<WalRecord>(body) {
            Ok(record) => records.push(record),
            Err(err) => {
                log::warn!(
                    "raft.storage: wal segment {:?} has a corrupt record at offset {}: {}",
                    path,
                    pos,
                    err
                );
                truncate_tail(&mut file, path, pos)?;
                break;
            }
        }
        pos += FRAME_HEADER_SIZE + frame_len;
    }

    Ok(records)
}

fn truncate_tail(file: &mut File, path: &Path, at: u64) -> Result<()> {
    log::warn!("raft.storage: truncating torn wal tail of {:?} at {}", path, at);
    file.set_len(at)?;
    file.sync_data()?;
    Ok(())
}

impl Wal {
    /// Whether `dir` holds any log segment.
    pub(crate) fn exists(dir: &Path) -> bool {
        list_segments(dir).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Removes every log segment under `dir`.
    pub(crate) fn wipe(dir: &Path) -> Result<()> {
        for (_, path) in list_segments(dir)? {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Opens the log under `dir`, replaying every segment into a boot state.
    pub(crate) fn open(dir: &Path) -> Result<(Wal, BootState)> {
        fs::create_dir_all(dir)?;

        let mut boot = BootState::default();
        let mut sealed = BTreeMap::new();
        let mut last_seq = 0u64;

        for (seq, path) in list_segments(dir)? {
            let mut max_entry_index = 0u64;
            for record in read_records(&path)? {
                match record {
                    WalRecord::Entry(data) => {
                        let mut entry = Entry::default();
                        entry.merge_from_bytes(&data)?;
                        // An overwrite at index i obsoletes everything at j >= i.
                        while boot
                            .entries
                            .last()
                            .map(|last| last.index >= entry.index)
                            .unwrap_or(false)
                        {
                            boot.entries.pop();
                        }
                        max_entry_index = entry.index;
                        boot.entries.push(entry);
                    }
                    WalRecord::HardState(data) => {
                        let mut hs = HardState::default();
                        hs.merge_from_bytes(&data)?;
                        boot.hard_state = Some(hs);
                    }
                    WalRecord::Snapshot { term, index } => {
                        boot.snapshots.push((term, index));
                    }
                    WalRecord::Metadata(data) => {
                        boot.metadata = Some(data);
                    }
                }
            }
            sealed.insert(
                seq,
                SealedSegment {
                    path,
                    max_entry_index,
                },
            );
            last_seq = seq;
        }

        // Reopen the newest segment for appends, or start the first one.
        let active_seq = if sealed.is_empty() { 1 } else { last_seq };
        let active = match sealed.remove(&active_seq) {
            Some(seg) => {
                let file = OpenOptions::new().append(true).open(&seg.path)?;
                let bytes = file.metadata()?.len();
                ActiveSegment {
                    file,
                    bytes,
                    entry_count: 0,
                    max_entry_index: seg.max_entry_index,
                }
            }
            None => {
                let path = segment_path(dir, active_seq);
                let file = OpenOptions::new().append(true).create(true).open(&path)?;
                ActiveSegment {
                    file,
                    bytes: 0,
                    entry_count: 0,
                    max_entry_index: 0,
                }
            }
        };

        Ok((
            Wal {
                dir: dir.to_path_buf(),
                sealed,
                active,
                active_seq,
            },
            boot,
        ))
    }

    fn append_record(&mut self, record: &WalRecord) -> Result<()> {
        let body = bincode::serialize(record)?;
        self.active
            .file
            .write_all(&(body.len() as u64).to_le_bytes())?;
        self.active.file.write_all(&body)?;
        self.active.bytes += FRAME_HEADER_SIZE + body.len() as u64;
        Ok(())
    }

    fn maybe_rotate(&mut self) -> Result<()> {
        if self.active.entry_count < SEGMENT_MAX_ENTRIES && self.active.bytes < SEGMENT_MAX_BYTES {
            return Ok(());
        }

        self.active.file.sync_data()?;
        let seq = self.active_seq;
        let sealed = SealedSegment {
            path: segment_path(&self.dir, seq),
            max_entry_index: self.active.max_entry_index,
        };
        self.sealed.insert(seq, sealed);

        self.active_seq += 1;
        let path = segment_path(&self.dir, self.active_seq);
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        self.active = ActiveSegment {
            file,
            bytes: 0,
            entry_count: 0,
            max_entry_index: self.active.max_entry_index,
        };
        Ok(())
    }

    /// Durably appends a `(HardState, Entries[])` batch.
    pub(crate) fn save(&mut self, hs: Option<&HardState>, entries: &[Entry]) -> Result<()> {
        if hs.is_none() && entries.is_empty() {
            return Ok(());
        }

        for entry in entries {
            let record = WalRecord::Entry(entry.write_to_bytes()?);
            self.append_record(&record)?;
            self.active.entry_count += 1;
            self.active.max_entry_index = entry.index;
        }
        if let Some(hs) = hs {
            let record = WalRecord::HardState(hs.write_to_bytes()?);
            self.append_record(&record)?;
        }

        self.active.file.sync_data()?;
        self.maybe_rotate()
    }

    /// Records that a snapshot file at (term, index) exists, so restart can
    /// locate the correct log tail.
    pub(crate) fn save_snapshot(&mut self, term: u64, index: u64) -> Result<()> {
        self.append_record(&WalRecord::Snapshot { term, index })?;
        self.active.file.sync_data()?;
        Ok(())
    }

    /// Durably records the node metadata (local member identity).
    pub(crate) fn save_metadata(&mut self, data: &[u8]) -> Result<()> {
        self.append_record(&WalRecord::Metadata(data.to_vec()))?;
        self.active.file.sync_data()?;
        Ok(())
    }

    /// Drops sealed segments that only hold entries at or below `index`.
    pub(crate) fn compact(&mut self, index: u64) -> Result<()> {
        let obsolete: Vec<u64> = self
            .sealed
            .iter()
            .filter(|(_, seg)| seg.max_entry_index <= index)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in obsolete {
            if let Some(seg) = self.sealed.remove(&seq) {
                fs::remove_file(&seg.path)?;
            }
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        self.active.file.sync_data()?;
        Ok(())
    }
}
