//! The public node handle and its administrative façade.
//!
//! Every administrative operation runs a precondition chain first; the first
//! failing predicate surfaces its error and nothing reaches the engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use raft::eraftpb::ConfChangeType;

use crate::config::Config;
use crate::controller::Controller;
use crate::engine::{Engine, Fsm};
use crate::error::{Error, Result};
use crate::membership::{MemberType, Pool, RawMember, NONE_ID};
use crate::msgbus::MsgBus;
use crate::storage::{SnapshotFile, Storage};
use crate::transport::{Dial, Handler};

/// How a node bootstraps on [`Node::start`]. At most one cluster-forming
/// option (everything except `Members` and `Address`) may be given.
#[derive(Debug, Clone)]
pub enum StartOption {
    /// Initialize a new cluster with this node as its first member.
    InitCluster,
    /// Join an existing cluster through the given address.
    Join(String, Duration),
    /// Join even if local state exists; the state is discarded.
    ForceJoin(String, Duration),
    /// Restart from the state directory.
    Restart,
    /// Replace the state directory with the given snapshot, then restart.
    Restore(PathBuf),
    /// Restart but keep this node as the sole voter; recovers quorum.
    ForceNewCluster,
    /// Seed membership from `{id}={addr}` urls; the first url is this node.
    Members(Vec<String>),
    /// Set the local node address.
    Address(String),
    /// Try each nested option until one's bootstrap phase succeeds.
    Fallback(Vec<StartOption>),
}

fn collect_operators(
    opts: Vec<StartOption>,
    addr: &mut String,
) -> Vec<Arc<dyn crate::engine::operator::Operator>> {
    use crate::engine::operator;

    let mut oprs = Vec::new();
    for opt in opts {
        match opt {
            StartOption::InitCluster => oprs.push(operator::init_cluster()),
            StartOption::Join(addr, timeout) => oprs.push(operator::join(addr, timeout)),
            StartOption::ForceJoin(addr, timeout) => {
                oprs.push(operator::force_join(addr, timeout))
            }
            StartOption::Restart => oprs.push(operator::restart()),
            StartOption::Restore(path) => oprs.push(operator::restore(path)),
            StartOption::ForceNewCluster => oprs.push(operator::force_new_cluster()),
            StartOption::Members(urls) => oprs.push(operator::members(urls)),
            StartOption::Address(a) => *addr = a,
            StartOption::Fallback(nested) => {
                let mut ignored = String::new();
                oprs.push(operator::fallback(collect_operators(nested, &mut ignored)));
            }
        }
    }
    oprs
}

/// A replica node: construction wires the storage plane, membership pool,
/// engine and controller together; [`Node::start`] runs it.
pub struct Node {
    cfg: Arc<Config>,
    engine: Arc<Engine>,
    pool: Arc<Pool>,
    storage: Arc<Storage>,
    dial: Arc<dyn Dial>,
    controller: Arc<Controller>,
    disable_forwarding: bool,
}

impl Node {
    /// Builds a node around the given state machine and transport dialer.
    pub fn new(fsm: Arc<dyn Fsm>, dial: Arc<dyn Dial>, cfg: Config) -> Result<Arc<Node>> {
        let cfg = Arc::new(cfg);
        let storage = Storage::new(&cfg)?;
        let msgbus = MsgBus::new();
        let (report_tx, report_rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = Pool::new(&cfg, Arc::clone(&dial), report_tx);
        let engine = Engine::new(
            Arc::clone(&cfg),
            fsm,
            Arc::clone(&storage),
            Arc::clone(&pool),
            msgbus,
            Arc::clone(&dial),
            report_rx,
        );

        Ok(Arc::new_cyclic(|weak| Node {
            controller: Arc::new(Controller::new(
                weak.clone(),
                Arc::clone(&engine),
                Arc::clone(&pool),
                storage.snapshotter(),
            )),
            disable_forwarding: cfg.disable_proposal_forwarding,
            cfg,
            engine,
            pool,
            storage,
            dial,
        }))
    }

    /// The handler a transport server delivers inbound peer traffic to.
    pub fn handler(self: &Arc<Self>) -> Arc<dyn Handler> {
        Arc::clone(&self.controller) as Arc<dyn Handler>
    }

    /// Bootstraps the node per the start options and runs it. Blocks until
    /// the node shuts down; a clean shutdown surfaces as `Error::Stopped`.
    pub async fn start(&self, opts: Vec<StartOption>) -> Result<()> {
        let mut addr = String::new();
        let oprs = collect_operators(opts, &mut addr);
        self.engine.start(&addr, oprs).await
    }

    /// Gracefully stops the node. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.engine.close().await
    }

    /// Proposes `data` for replication; returns once the local state machine
    /// applied it.
    pub async fn replicate(&self, data: Vec<u8>) -> Result<()> {
        self.joined()?;
        self.leader_known()?;
        self.forwarding_ok()?;
        self.available()?;
        self.engine.propose_replicate(data).await
    }

    /// Linearizable read barrier: returns once this node's state machine has
    /// caught up with the leader's commit index as of the call.
    pub async fn linearizable_read(&self) -> Result<()> {
        self.joined()?;
        self.engine
            .linearizable_read(self.cfg.tick_interval * 5)
            .await
    }

    /// Adds a member. A zero id is assigned from the pool.
    pub async fn add_member(&self, raw: &mut RawMember) -> Result<()> {
        self.joined()?;
        self.addr_free(raw.id, &raw.address)?;
        if raw.id != NONE_ID {
            self.id_free(raw.id)?;
        }
        self.leader_known()?;
        self.forwarding_ok()?;
        self.available()?;

        if raw.id == NONE_ID {
            raw.id = self.pool.next_id();
        }

        let cct = if raw.kind.is_learner() {
            ConfChangeType::AddLearnerNode
        } else {
            ConfChangeType::AddNode
        };
        self.engine.propose_conf_change(raw, cct).await
    }

    /// Removes a member; the leader must be demoted or transferred first.
    pub async fn remove_member(&self, id: u64) -> Result<()> {
        self.joined()?;
        self.member(id)?;
        self.not_removed(id)?;
        self.not_leader_target(id)?;
        self.leader_known()?;
        self.forwarding_ok()?;
        self.available()?;

        let member = self.pool.get(id).ok_or(Error::NotMember(id))?;
        let mut raw = member.raw();
        raw.kind = MemberType::Removed;
        self.engine
            .propose_conf_change(&raw, ConfChangeType::RemoveNode)
            .await
    }

    /// Removes the local node from the cluster.
    pub async fn leave(&self) -> Result<()> {
        self.remove_member(self.whoami()).await
    }

    /// Moves a member to a new address; the type is kept as-is.
    pub async fn update_member(&self, raw: &mut RawMember) -> Result<()> {
        self.joined()?;
        self.member(raw.id)?;
        self.addr_free(raw.id, &raw.address)?;
        self.leader_known()?;
        self.forwarding_ok()?;
        self.available()?;

        let member = self.pool.get(raw.id).ok_or(Error::NotMember(raw.id))?;
        raw.kind = member.kind();
        self.engine
            .propose_conf_change(raw, ConfChangeType::UpdateNode)
            .await
    }

    /// Promotes a learner to voter once it has caught up with the leader.
    pub async fn promote_member(&self, id: u64) -> Result<()> {
        self.promote(id, false).await
    }

    /// Promotion entry point for requests forwarded by a follower.
    pub(crate) async fn promote_member_forwarded(&self, id: u64) -> Result<()> {
        self.promote(id, true).await
    }

    /// Hands leadership to the given member.
    pub async fn transfer_leadership(&self, id: u64) -> Result<()> {
        self.joined()?;
        self.member(id)?;
        self.leader_known()?;
        self.forwarding_ok()?;
        self.available()?;
        self.engine.transfer_leadership(id).await
    }

    /// Steps down as leader, handing off to the longest continuously
    /// reachable voter.
    pub async fn step_down(&self) -> Result<()> {
        self.joined()?;
        self.is_leader()?;
        self.available()?;

        let m = self.longest_active()?;
        self.engine.transfer_leadership(m.id).await
    }

    /// Takes an immediate snapshot and returns a read handle over its file.
    pub async fn create_snapshot(&self) -> Result<SnapshotFile> {
        self.joined()?;
        let (term, index) = self.engine.create_snapshot().await?;
        self.storage.snapshotter().read(term, index)
    }

    /// This node's member id; zero until it has joined a cluster.
    pub fn whoami(&self) -> u64 {
        self.engine.status().id
    }

    /// The current leader id; zero when unknown.
    pub fn leader(&self) -> u64 {
        self.engine.status().leader
    }

    pub fn get_member(&self, id: u64) -> Option<RawMember> {
        self.pool.get(id).map(|m| m.raw())
    }

    /// All non-removed members.
    pub fn members(&self) -> Vec<RawMember> {
        self.pool
            .members()
            .iter()
            .map(|m| m.raw())
            .filter(|m| m.kind != MemberType::Removed)
            .collect()
    }

    pub fn removed_members(&self) -> Vec<RawMember> {
        self.pool
            .members()
            .iter()
            .map(|m| m.raw())
            .filter(|m| m.kind == MemberType::Removed)
            .collect()
    }

    pub fn is_member(&self, id: u64) -> bool {
        self.pool.get(id).is_some()
    }

    pub fn is_member_removed(&self, id: u64) -> bool {
        self.pool
            .get(id)
            .map(|m| m.kind() == MemberType::Removed)
            .unwrap_or(false)
    }

    /// The id of the non-removed member using `addr`, or zero.
    pub fn address_in_use(&self, addr: &str) -> u64 {
        self.members()
            .iter()
            .find(|m| m.address == addr)
            .map(|m| m.id)
            .unwrap_or(NONE_ID)
    }

    /// The non-local member that has been continuously reachable the
    /// longest, i.e. with the earliest activation time.
    pub fn longest_active(&self) -> Result<RawMember> {
        let mut longest: Option<(SystemTime, RawMember)> = None;
        for member in self.pool.members() {
            if member.kind().is_local() || member.kind() == MemberType::Removed {
                continue;
            }
            let since = match member.active_since() {
                Some(since) => since,
                None => continue,
            };
            match &longest {
                Some((best, _)) if since >= *best => {}
                _ => longest = Some((since, member.raw())),
            }
        }
        longest.map(|(_, m)| m).ok_or(Error::NoLongestActive)
    }

    /// Whether a quorum of the non-removed membership is reachable.
    pub fn is_available(&self) -> bool {
        let members = self.members();
        let quorum = members.len() / 2 + 1;
        let active = members
            .iter()
            .filter(|m| {
                self.pool
                    .get(m.id)
                    .map(|m| m.is_active())
                    .unwrap_or(false)
            })
            .count();
        active >= quorum
    }

    async fn promote(&self, id: u64, forwarded: bool) -> Result<()> {
        self.joined()?;
        self.member(id)?;
        self.leader_known()?;
        self.forwarding_ok()?;
        self.available()?;

        let member = self.pool.get(id).ok_or(Error::NotMember(id))?;
        if !member.kind().is_learner() {
            return Err(Error::NotLearner(id));
        }

        let status = self.engine.status();
        if !status.is_leader {
            // The leader was lost while the request was being forwarded.
            if forwarded {
                return Err(Error::NoLeader);
            }

            let leader = self.pool.get(status.leader).ok_or(Error::NoLeader)?;
            let tr = self.dial.dial(&leader.address()).await?;
            return tr.promote(member.raw()).await.map_err(|err| {
                log::warn!("raft.cluster: forwarding promotion of {:x}: {}", id, err);
                Error::NoLeader
            });
        }

        let leader_match = status.progress.get(&status.id).copied().unwrap_or(0);
        let learner_match = status.progress.get(&id).copied().unwrap_or(0);
        if (learner_match as f64) < leader_match as f64 * 0.9 {
            return Err(Error::NotCaughtUp(id));
        }

        let mut raw = member.raw();
        raw.kind = MemberType::Voter;
        self.engine
            .propose_conf_change(&raw, ConfChangeType::AddNode)
            .await
    }

    // Precondition predicates; the first failure surfaces its error.

    fn joined(&self) -> Result<()> {
        if self.whoami() == NONE_ID {
            return Err(Error::NotJoined);
        }
        Ok(())
    }

    fn available(&self) -> Result<()> {
        if !self.is_available() {
            return Err(Error::QuorumLost);
        }
        Ok(())
    }

    fn member(&self, id: u64) -> Result<()> {
        if !self.is_member(id) {
            return Err(Error::NotMember(id));
        }
        Ok(())
    }

    fn not_removed(&self, id: u64) -> Result<()> {
        if self.is_member_removed(id) {
            return Err(Error::AlreadyRemoved(id));
        }
        Ok(())
    }

    fn not_leader_target(&self, id: u64) -> Result<()> {
        if id == self.leader() {
            return Err(Error::RemoveLeader(id));
        }
        Ok(())
    }

    fn addr_free(&self, id: u64, addr: &str) -> Result<()> {
        let used = self.address_in_use(addr);
        if used != NONE_ID && used != id {
            return Err(Error::AddressInUse {
                id: used,
                addr: addr.to_string(),
            });
        }
        Ok(())
    }

    fn id_free(&self, id: u64) -> Result<()> {
        if self.pool.get(id).is_some() {
            return Err(Error::IdInUse(id));
        }
        Ok(())
    }

    fn leader_known(&self) -> Result<()> {
        if self.leader() == NONE_ID {
            return Err(Error::NoLeader);
        }
        Ok(())
    }

    fn forwarding_ok(&self) -> Result<()> {
        if self.leader() != self.whoami() && self.disable_forwarding {
            return Err(Error::NotLeader);
        }
        Ok(())
    }

    fn is_leader(&self) -> Result<()> {
        if self.whoami() != self.leader() {
            return Err(Error::NotLeader);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::Router;
    use std::io::Read;
    use tempfile::TempDir;

    struct NopFsm;

    impl Fsm for NopFsm {
        fn apply(&self, _data: &[u8]) {}

        fn snapshot(&self) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(std::io::empty()))
        }

        fn restore(&self, _data: Box<dyn Read + Send>) -> Result<()> {
            Ok(())
        }
    }

    fn node(dir: &TempDir) -> Arc<Node> {
        let cfg = Config::new().with_state_dir(dir.path());
        Node::new(Arc::new(NopFsm), Arc::new(Router::new()), cfg).unwrap()
    }

    #[tokio::test]
    async fn test_preconditions_before_start() {
        let dir = TempDir::new().unwrap();
        let n = node(&dir);

        assert_eq!(n.whoami(), NONE_ID);
        assert_eq!(n.leader(), NONE_ID);

        let mut raw = RawMember {
            id: 0,
            address: "mem://9".to_string(),
            kind: MemberType::Voter,
        };
        assert_eq!(n.add_member(&mut raw).await, Err(Error::NotJoined));
        assert_eq!(n.remove_member(2).await, Err(Error::NotJoined));
        assert_eq!(n.step_down().await, Err(Error::NotJoined));
        assert_eq!(n.replicate(vec![1]).await, Err(Error::NotJoined));
        assert_eq!(n.longest_active(), Err(Error::NoLongestActive));
        assert!(!n.is_available());
    }

    #[tokio::test]
    async fn test_start_rejects_incompatible_operators() {
        let dir = TempDir::new().unwrap();
        let n = node(&dir);
        let err = n
            .start(vec![StartOption::InitCluster, StartOption::Restart])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bootstrap(_)));
    }
}
