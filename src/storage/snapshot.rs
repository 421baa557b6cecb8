//! Snapshot files: CRC-protected payload with a membership trailer.
//!
//! On-disk layout is `payload_bytes || trailer_bytes || uint64_be(len)`. The
//! trailer carries a CRC64-ECMA of the payload, a version tag, the membership
//! listing and the raw snapshot metadata, so a file is self-describing and a
//! half-written one can never be loaded.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use protobuf::Message as PbMessage;
use raft::eraftpb::{Snapshot, SnapshotMetadata};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::membership::RawMember;

const SNAP_EXT: &str = "snap";
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);
const COPY_CHUNK: usize = 32 * 1024;

/// The only trailer version readers accept.
const VERSION_V0: u32 = 0;

#[derive(Serialize, Deserialize)]
struct Trailer {
    crc: u64,
    version: u32,
    members: Vec<RawMember>,
    /// Protobuf-encoded raft snapshot metadata.
    meta: Vec<u8>,
}

/// Payload reader positioned at byte 0; EOFs at the trailer boundary.
pub struct SnapshotData {
    file: Option<File>,
    remaining: u64,
}

impl Read for SnapshotData {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, Error::ClosedSnapshot))?;
        if self.remaining == 0 {
            return Ok(0);
        }
        let cap = buf.len().min(self.remaining as usize);
        let n = file.read(&mut buf[..cap])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl SnapshotData {
    pub fn close(&mut self) {
        self.file = None;
    }
}

/// A decoded snapshot file.
pub struct SnapshotFile {
    /// Raft snapshot carrying metadata only; the payload stays on disk.
    pub raw: Snapshot,
    /// Membership as of the snapshot, removed members included.
    pub members: Vec<RawMember>,
    /// Payload stream handed to the state machine.
    pub data: SnapshotData,
}

fn snapshot_name(term: u64, index: u64) -> String {
    format!("{:016x}-{:016x}.{}", term, index, SNAP_EXT)
}

/// Owns `<statedir>/snap`: encodes, decodes and retains snapshot files.
pub(crate) struct Snapshotter {
    dir: PathBuf,
    /// Files kept beyond the current snapshot.
    retain: usize,
}

impl Snapshotter {
    pub(crate) fn new(dir: PathBuf, max_snapshot_files: usize) -> Result<Snapshotter> {
        fs::create_dir_all(&dir)?;
        Ok(Snapshotter {
            dir,
            retain: max_snapshot_files,
        })
    }

    pub(crate) fn path(&self, term: u64, index: u64) -> PathBuf {
        self.dir.join(snapshot_name(term, index))
    }

    /// Encodes a snapshot file for `meta`, streaming `data` through the CRC,
    /// then prunes old files. A failed write never leaves a partial file.
    pub(crate) fn write(
        &self,
        meta: &SnapshotMetadata,
        members: &[RawMember],
        data: &mut dyn Read,
    ) -> Result<()> {
        let path = self.path(meta.term, meta.index);
        let res = encode_snapshot(&path, meta, members, data);
        if res.is_err() {
            let _ = fs::remove_file(&path);
            return res;
        }
        self.gc();
        res
    }

    /// Decodes the snapshot file recorded at (term, index).
    pub(crate) fn read(&self, term: u64, index: u64) -> Result<SnapshotFile> {
        decode_snapshot(&self.path(term, index))
    }

    /// Raw file bytes, served to a member pulling this snapshot.
    pub(crate) fn read_bytes(&self, term: u64, index: u64) -> Result<Vec<u8>> {
        let path = self.path(term, index);
        if !path.exists() {
            return Err(Error::NoSnapshot);
        }
        Ok(fs::read(path)?)
    }

    /// Whether a valid snapshot file exists at (term, index).
    pub(crate) fn has(&self, term: u64, index: u64) -> bool {
        decode_snapshot(&self.path(term, index)).is_ok()
    }

    /// Persists pulled snapshot bytes under the canonical name, rejecting
    /// them unless they decode cleanly.
    pub(crate) fn install(&self, term: u64, index: u64, bytes: &[u8]) -> Result<()> {
        let path = self.path(term, index);
        fs::write(&path, bytes)?;
        if let Err(err) = decode_snapshot(&path) {
            let _ = fs::remove_file(&path);
            return Err(err);
        }
        Ok(())
    }

    /// Imports an external snapshot file (cluster restore), returning its
    /// (term, index).
    pub(crate) fn import(&self, from: &Path) -> Result<(u64, u64)> {
        let sf = decode_snapshot(from)?;
        let meta = sf.raw.get_metadata();
        let (term, index) = (meta.term, meta.index);
        drop(sf);
        fs::copy(from, self.path(term, index))?;
        Ok((term, index))
    }

    /// Decodes the newest valid snapshot among the WAL markers, skipping
    /// files that are missing or fail validation.
    pub(crate) fn recover(&self, markers: &[(u64, u64)]) -> Result<SnapshotFile> {
        for &(term, index) in markers.iter().rev() {
            match decode_snapshot(&self.path(term, index)) {
                Ok(sf) => return Ok(sf),
                Err(err) => {
                    log::warn!(
                        "raft.storage: skipping snapshot {}: {}",
                        snapshot_name(term, index),
                        err
                    );
                }
            }
        }
        Err(Error::NoSnapshot)
    }

    fn list(&self) -> Vec<(u64, u64, PathBuf)> {
        let mut snaps = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return snaps,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAP_EXT) {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            if let Some((term, index)) = stem.split_once('-') {
                if let (Ok(term), Ok(index)) = (
                    u64::from_str_radix(term, 16),
                    u64::from_str_radix(index, 16),
                ) {
                    snaps.push((term, index, path));
                }
            }
        }
        snaps.sort_by_key(|&(term, index, _)| (index, term));
        snaps
    }

    /// Deletes all but the newest `retain + 1` snapshot files.
    fn gc(&self) {
        let snaps = self.list();
        let keep = self.retain + 1;
        if snaps.len() <= keep {
            return;
        }
        for (term, index, path) in &snaps[..snaps.len() - keep] {
            if let Err(err) = fs::remove_file(path) {
                log::warn!(
                    "raft.storage: pruning snapshot {}: {}",
                    snapshot_name(*term, *index),
                    err
                );
            }
        }
    }
}

fn encode_snapshot(
    path: &Path,
    meta: &SnapshotMetadata,
    members: &[RawMember],
    data: &mut dyn Read,
) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = io::BufWriter::new(file);
    let mut digest = CRC64.digest();

    let mut chunk = [0u8; COPY_CHUNK];
    loop {
        let n = data.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        digest.update(&chunk[..n]);
        writer.write_all(&chunk[..n])?;
    }

    let trailer = Trailer {
        crc: digest.finalize(),
        version: VERSION_V0,
        members: members.to_vec(),
        meta: meta.write_to_bytes()?,
    };
    let buf = bincode::serialize(&trailer)?;
    writer.write_all(&buf)?;
    writer.write_all(&(buf.len() as u64).to_be_bytes())?;

    let file = writer
        .into_inner()
        .map_err(|err| Error::Io(err.to_string()))?;
    file.sync_all()?;
    Ok(())
}

fn decode_snapshot(path: &Path) -> Result<SnapshotFile> {
    let mut file = File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::NoSnapshot,
        _ => Error::Io(err.to_string()),
    })?;
    let size = file.metadata()?.len();
    if size == 0 {
        return Err(Error::EmptySnapshot);
    }
    if size < 8 {
        return Err(Error::SnapshotFormat);
    }

    file.seek(SeekFrom::End(-8))?;
    let mut bsize = [0u8; 8];
    file.read_exact(&mut bsize)?;
    let tsize = u64::from_be_bytes(bsize);
    if tsize.saturating_add(8) > size {
        return Err(Error::SnapshotFormat);
    }
    let eod = size - tsize - 8;

    file.seek(SeekFrom::Start(eod))?;
    let mut buf = vec![0u8; tsize as usize];
    file.read_exact(&mut buf)?;
    let trailer: Trailer =
        bincode::deserialize(&buf).map_err(|_| Error::SnapshotFormat)?;
    if trailer.version != VERSION_V0 {
        return Err(Error::SnapshotFormat);
    }

    file.seek(SeekFrom::Start(0))?;
    let mut digest = CRC64.digest();
    let mut remaining = eod;
    let mut chunk = [0u8; COPY_CHUNK];
    while remaining > 0 {
        let cap = (COPY_CHUNK as u64).min(remaining) as usize;
        let n = file.read(&mut chunk[..cap])?;
        if n == 0 {
            return Err(Error::SnapshotFormat);
        }
        digest.update(&chunk[..n]);
        remaining -= n as u64;
    }
    if digest.finalize() != trailer.crc {
        return Err(Error::CrcMismatch);
    }

    let mut meta = SnapshotMetadata::default();
    meta.merge_from_bytes(&trailer.meta)?;
    let mut raw = Snapshot::default();
    raw.set_metadata(meta);

    // Reposition at byte 0 so the caller reads the payload from the start.
    file.seek(SeekFrom::Start(0))?;
    Ok(SnapshotFile {
        raw,
        members: trailer.members,
        data: SnapshotData {
            file: Some(file),
            remaining: eod,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MemberType;
    use raft::eraftpb::ConfState;
    use tempfile::TempDir;

    fn meta(term: u64, index: u64) -> SnapshotMetadata {
        let mut m = SnapshotMetadata::default();
        m.term = term;
        m.index = index;
        let mut cs = ConfState::default();
        cs.voters = vec![1, 2];
        m.set_conf_state(cs);
        m
    }

    fn members() -> Vec<RawMember> {
        vec![
            RawMember {
                id: 1,
                address: ":5052".to_string(),
                kind: MemberType::Local,
            },
            RawMember {
                id: 2,
                address: ":5053".to_string(),
                kind: MemberType::Voter,
            },
        ]
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let dir = TempDir::new().unwrap();
        let snap = Snapshotter::new(dir.path().to_path_buf(), 5).unwrap();

        let payload = b"the quick brown fox".repeat(1000);
        snap.write(&meta(3, 42), &members(), &mut payload.as_slice())
            .unwrap();

        let mut sf = snap.read(3, 42).unwrap();
        assert_eq!(sf.raw.get_metadata().term, 3);
        assert_eq!(sf.raw.get_metadata().index, 42);
        assert_eq!(sf.raw.get_metadata().get_conf_state().voters, vec![1, 2]);
        assert_eq!(sf.members, members());

        let mut read_back = Vec::new();
        sf.data.read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn test_crc_mismatch_on_corruption() {
        let dir = TempDir::new().unwrap();
        let snap = Snapshotter::new(dir.path().to_path_buf(), 5).unwrap();
        snap.write(&meta(1, 10), &members(), &mut &b"payload bytes"[..])
            .unwrap();

        // Flip one payload byte.
        let path = snap.path(1, 10);
        let mut bytes = fs::read(&path).unwrap();
        bytes[2] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert_eq!(snap.read(1, 10).unwrap_err(), Error::CrcMismatch);
    }

    #[test]
    fn test_reject_garbage_and_empty_files() {
        let dir = TempDir::new().unwrap();
        let snap = Snapshotter::new(dir.path().to_path_buf(), 5).unwrap();

        fs::write(snap.path(1, 1), b"").unwrap();
        assert_eq!(snap.read(1, 1).unwrap_err(), Error::EmptySnapshot);

        fs::write(snap.path(1, 2), b"abc").unwrap();
        assert_eq!(snap.read(1, 2).unwrap_err(), Error::SnapshotFormat);

        assert_eq!(snap.read(9, 9).unwrap_err(), Error::NoSnapshot);
    }

    #[test]
    fn test_retention_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let snap = Snapshotter::new(dir.path().to_path_buf(), 1).unwrap();

        for index in 1..=4u64 {
            snap.write(&meta(1, index * 10), &members(), &mut &b"x"[..])
                .unwrap();
        }

        let left = snap.list();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].1, 30);
        assert_eq!(left[1].1, 40);
    }

    #[test]
    fn test_recover_skips_corrupted_newest() {
        let dir = TempDir::new().unwrap();
        let snap = Snapshotter::new(dir.path().to_path_buf(), 5).unwrap();

        snap.write(&meta(1, 10), &members(), &mut &b"old state"[..])
            .unwrap();
        snap.write(&meta(1, 20), &members(), &mut &b"new state"[..])
            .unwrap();

        let path = snap.path(1, 20);
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let sf = snap
            .recover(&[(1, 10), (1, 20)])
            .expect("older snapshot should win");
        assert_eq!(sf.raw.get_metadata().index, 10);

        assert_eq!(snap.recover(&[]).unwrap_err(), Error::NoSnapshot);
    }
}
