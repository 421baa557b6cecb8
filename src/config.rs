//! Runtime configuration for a replica node.
//!
//! `Config` is a plain record populated through chained mutators; defaults are
//! applied first by [`Config::new`]. The raft-specific knobs are handed to the
//! consensus primitive when the engine is constructed.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a single replica node.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) tick_interval: Duration,
    pub(crate) stream_timeout: Duration,
    pub(crate) drain_timeout: Duration,
    pub(crate) statedir: PathBuf,
    pub(crate) max_snapshot_files: usize,
    pub(crate) snap_interval: u64,
    pub(crate) election_tick: usize,
    pub(crate) heartbeat_tick: usize,
    pub(crate) max_size_per_msg: u64,
    pub(crate) max_inflight_msgs: usize,
    pub(crate) max_uncommitted_entries_size: u64,
    pub(crate) max_committed_size_per_ready: u64,
    pub(crate) check_quorum: bool,
    pub(crate) pre_vote: bool,
    pub(crate) disable_proposal_forwarding: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    /// Creates a config with the documented defaults.
    pub fn new() -> Self {
        Config {
            tick_interval: Duration::from_millis(100),
            stream_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
            statedir: std::env::temp_dir(),
            max_snapshot_files: 5,
            snap_interval: 1000,
            election_tick: 10,
            heartbeat_tick: 1,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            max_uncommitted_entries_size: 1 << 30,
            max_committed_size_per_ready: 0,
            check_quorum: false,
            pre_vote: false,
            disable_proposal_forwarding: false,
        }
    }

    /// Interval at which the consensus logical clock advances by one tick.
    pub fn with_tick_interval(mut self, d: Duration) -> Self {
        self.tick_interval = d;
        self
    }

    /// Timeout on streaming a single message to another member.
    pub fn with_stream_timeout(mut self, d: Duration) -> Self {
        self.stream_timeout = d;
        self
    }

    /// Timeout on streaming pending messages during graceful shutdown.
    pub fn with_drain_timeout(mut self, d: Duration) -> Self {
        self.drain_timeout = d;
        self
    }

    /// Directory holding durable state (WAL segments and snapshots).
    pub fn with_state_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.statedir = dir.as_ref().to_path_buf();
        self
    }

    /// Number of snapshot files to keep beyond the current one.
    pub fn with_max_snapshot_files(mut self, max: usize) -> Self {
        self.max_snapshot_files = max;
        self
    }

    /// Number of applied log entries between snapshots.
    pub fn with_snapshot_interval(mut self, i: u64) -> Self {
        self.snap_interval = i;
        self
    }

    /// Ticks that must pass without leader contact before an election starts.
    /// Must be greater than the heartbeat tick.
    pub fn with_election_tick(mut self, tick: usize) -> Self {
        self.election_tick = tick;
        self
    }

    /// Ticks between leader heartbeats.
    pub fn with_heartbeat_tick(mut self, tick: usize) -> Self {
        self.heartbeat_tick = tick;
        self
    }

    /// Byte cap on a single append message.
    pub fn with_max_size_per_msg(mut self, max: u64) -> Self {
        self.max_size_per_msg = max;
        self
    }

    /// Cap on in-flight append messages during optimistic replication.
    pub fn with_max_inflight_msgs(mut self, max: usize) -> Self {
        self.max_inflight_msgs = max;
        self
    }

    /// Aggregate byte bound on uncommitted entries in the leader log; beyond
    /// it proposals are dropped by the primitive.
    pub fn with_max_uncommitted_entries_size(mut self, max: u64) -> Self {
        self.max_uncommitted_entries_size = max;
        self
    }

    /// Byte bound on the committed entries applied per ready batch.
    pub fn with_max_committed_size_per_ready(mut self, max: u64) -> Self {
        self.max_committed_size_per_ready = max;
        self
    }

    /// Leader steps down when quorum is not active for an election timeout.
    pub fn with_check_quorum(mut self) -> Self {
        self.check_quorum = true;
        self
    }

    /// Enables the pre-vote algorithm (raft thesis §9.6).
    pub fn with_pre_vote(mut self) -> Self {
        self.pre_vote = true;
        self
    }

    /// Followers drop proposals instead of forwarding them to the leader.
    pub fn with_disable_proposal_forwarding(mut self) -> Self {
        self.disable_proposal_forwarding = true;
        self
    }

    pub(crate) fn wal_dir(&self) -> PathBuf {
        self.statedir.join("wal")
    }

    pub(crate) fn snap_dir(&self) -> PathBuf {
        self.statedir.join("snap")
    }

    /// Builds the consensus primitive's config for the given local id and
    /// applied index.
    pub(crate) fn raft_config(&self, id: u64, applied: u64) -> raft::Config {
        raft::Config {
            id,
            applied,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            max_size_per_msg: self.max_size_per_msg,
            max_inflight_msgs: self.max_inflight_msgs,
            max_uncommitted_size: self.max_uncommitted_entries_size,
            max_committed_size_per_ready: self.max_committed_size_per_ready,
            check_quorum: self.check_quorum,
            pre_vote: self.pre_vote,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::new();
        assert_eq!(cfg.tick_interval, Duration::from_millis(100));
        assert_eq!(cfg.stream_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_snapshot_files, 5);
        assert_eq!(cfg.snap_interval, 1000);
        assert_eq!(cfg.election_tick, 10);
        assert_eq!(cfg.heartbeat_tick, 1);
        assert!(!cfg.check_quorum);
        assert!(!cfg.disable_proposal_forwarding);
    }

    #[test]
    fn test_mutators_chain() {
        let cfg = Config::new()
            .with_tick_interval(Duration::from_millis(10))
            .with_snapshot_interval(16)
            .with_max_snapshot_files(1)
            .with_pre_vote();
        assert_eq!(cfg.tick_interval, Duration::from_millis(10));
        assert_eq!(cfg.snap_interval, 16);
        assert_eq!(cfg.max_snapshot_files, 1);
        assert!(cfg.pre_vote);
    }

    #[test]
    fn test_raft_config() {
        let rcfg = Config::new().with_election_tick(20).raft_config(7, 0);
        assert_eq!(rcfg.id, 7);
        assert_eq!(rcfg.election_tick, 20);
        assert!(rcfg.validate().is_ok());
    }
}
