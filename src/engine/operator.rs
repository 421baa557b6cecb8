//! Startup operators: composable bootstrap strategies.
//!
//! Each operator is a named two-phase action over a shared accumulator. The
//! `before` phases run in order, the raw node is constructed from the
//! accumulated state, then the `after` phases run in reverse order. Exactly
//! one cluster-forming operator may be present per start.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use raft::eraftpb::{Entry, EntryType, HardState, Snapshot, SnapshotMetadata};
use raft::RawNode;

use crate::engine::{conf_state_of, Engine, LogCache, SnapMeta};
use crate::error::{Error, Result};
use crate::membership::{relativize, MemberType, RawMember};

/// Snapshot recovered from disk during a restart-kind bootstrap; the payload
/// stays on disk and is re-read when the state machine is restored.
#[derive(Debug, Clone)]
pub(crate) struct RecoveredSnapshot {
    pub raw: Snapshot,
    pub members: Vec<RawMember>,
}

/// Accumulator shared by all operators of one start.
#[derive(Debug, Clone, Default)]
pub(crate) struct OperatorsState {
    pub local: Option<RawMember>,
    pub membs: Vec<RawMember>,
    pub hard_state: Option<HardState>,
    pub entries: Vec<Entry>,
    pub snapshot: Option<RecoveredSnapshot>,
    pub was_restart: bool,
    pub bootstrap: bool,
    pub joined: bool,
    pub addr: String,
}

/// A named two-phase bootstrap action.
#[async_trait]
pub(crate) trait Operator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Position in the before phase; afters run in the reverse order.
    fn order(&self) -> i32 {
        1
    }

    async fn before(&self, engine: &Arc<Engine>, st: &mut OperatorsState) -> Result<()>;

    async fn after(&self, engine: &Arc<Engine>, st: &mut OperatorsState) -> Result<()> {
        let _ = (engine, st);
        Ok(())
    }
}

/// Cluster-forming operators; at most one per start.
const EXCLUSIVE: &[&str] = &[
    "init-cluster",
    "join",
    "force-join",
    "restart",
    "restore",
    "force-new-cluster",
    "fallback",
];

/// Runs the full pipeline: validation, befores, node construction, afters.
pub(crate) async fn invoke(
    engine: &Arc<Engine>,
    addr: &str,
    mut oprs: Vec<Arc<dyn Operator>>,
) -> Result<(OperatorsState, RawNode<LogCache>)> {
    let modes = oprs
        .iter()
        .filter(|o| EXCLUSIVE.contains(&o.name()))
        .count();
    if modes != 1 {
        return Err(Error::Bootstrap(format!(
            "exactly one of init-cluster, join, force-join, restart, restore, \
             force-new-cluster or fallback is required, got {}",
            modes
        )));
    }

    oprs.push(state_setup());
    oprs.sort_by_key(|o| o.order());

    let mut st = OperatorsState {
        addr: addr.to_string(),
        ..Default::default()
    };

    for opr in &oprs {
        if let Err(err) = opr.before(engine, &mut st).await {
            log::error!("raft.engine: bootstrap operator {}: {}", opr.name(), err);
            return Err(err);
        }
    }

    let raw = engine.construct(&mut st)?;

    for opr in oprs.iter().rev() {
        if let Err(err) = opr.after(engine, &mut st).await {
            log::error!("raft.engine: bootstrap operator {}: {}", opr.name(), err);
            return Err(err);
        }
    }

    Ok((st, raw))
}

pub(crate) fn init_cluster() -> Arc<dyn Operator> {
    Arc::new(InitCluster)
}

pub(crate) fn members(urls: Vec<String>) -> Arc<dyn Operator> {
    Arc::new(Members { urls })
}

pub(crate) fn join(addr: String, timeout: Duration) -> Arc<dyn Operator> {
    Arc::new(Join {
        addr,
        timeout,
        force: false,
    })
}

pub(crate) fn force_join(addr: String, timeout: Duration) -> Arc<dyn Operator> {
    Arc::new(Join {
        addr,
        timeout,
        force: true,
    })
}

pub(crate) fn restart() -> Arc<dyn Operator> {
    Arc::new(Restart)
}

pub(crate) fn restore(path: PathBuf) -> Arc<dyn Operator> {
    Arc::new(Restore { path })
}

pub(crate) fn force_new_cluster() -> Arc<dyn Operator> {
    Arc::new(ForceNewCluster)
}

pub(crate) fn fallback(ops: Vec<Arc<dyn Operator>>) -> Arc<dyn Operator> {
    Arc::new(Fallback {
        ops,
        chosen: Mutex::new(None),
    })
}

fn state_setup() -> Arc<dyn Operator> {
    Arc::new(StateSetup)
}

/// Initializes a brand new cluster with this node as its first member.
struct InitCluster;

#[async_trait]
impl Operator for InitCluster {
    fn name(&self) -> &'static str {
        "init-cluster"
    }

    async fn before(&self, engine: &Arc<Engine>, st: &mut OperatorsState) -> Result<()> {
        if engine.storage().has_state() {
            return Err(Error::Bootstrap(
                "state directory is not empty, use restart or force-new-cluster".to_string(),
            ));
        }

        st.bootstrap = true;
        if st.local.is_none() {
            let local = RawMember {
                id: 1,
                address: st.addr.clone(),
                kind: MemberType::Local,
            };
            st.local = Some(local.clone());
            st.membs.push(local);
        }

        engine.storage().boot()?;
        Ok(())
    }
}

/// Seeds the membership listing from `{id}={addr}` urls; the first url names
/// the local node.
struct Members {
    urls: Vec<String>,
}

#[async_trait]
impl Operator for Members {
    fn name(&self) -> &'static str {
        "members"
    }

    fn order(&self) -> i32 {
        0
    }

    async fn before(&self, _engine: &Arc<Engine>, st: &mut OperatorsState) -> Result<()> {
        let mut membs = Vec::with_capacity(self.urls.len());
        for (i, url) in self.urls.iter().enumerate() {
            let mut raw = RawMember::from_url(url)?;
            if i == 0 {
                raw.kind = MemberType::Local;
                st.local = Some(raw.clone());
                if st.addr.is_empty() {
                    st.addr = raw.address.clone();
                }
            }
            membs.push(raw);
        }
        st.membs = membs;
        Ok(())
    }
}

/// Joins an existing cluster through the node at `addr`.
struct Join {
    addr: String,
    timeout: Duration,
    force: bool,
}

#[async_trait]
impl Operator for Join {
    fn name(&self) -> &'static str {
        if self.force {
            "force-join"
        } else {
            "join"
        }
    }

    async fn before(&self, engine: &Arc<Engine>, st: &mut OperatorsState) -> Result<()> {
        if engine.storage().has_state() {
            if !self.force {
                return Err(Error::Bootstrap(
                    "state directory is not empty, use force-join or restart".to_string(),
                ));
            }
            engine.storage().wipe()?;
        }

        if st.membs.len() > 1 {
            return Err(Error::Bootstrap(
                "members compose with join only when a single url is given".to_string(),
            ));
        }

        let tr = engine.dialer().dial(&self.addr).await?;
        let mut raw = st.local.clone().unwrap_or(RawMember {
            id: 0,
            address: st.addr.clone(),
            kind: MemberType::Voter,
        });
        if raw.kind.is_local() {
            raw.kind = if raw.kind == MemberType::LocalLearner {
                MemberType::Learner
            } else {
                MemberType::Voter
            };
        }

        let resp = tokio::time::timeout(self.timeout, tr.join(raw))
            .await
            .map_err(|_| Error::Transport(format!("join request to {} timed out", self.addr)))??;

        let mut membs = resp.members;
        let mut found = false;
        for m in &mut membs {
            if m.id == resp.id {
                m.kind = if m.kind.is_learner() {
                    MemberType::LocalLearner
                } else {
                    MemberType::Local
                };
                st.local = Some(m.clone());
                found = true;
            }
        }
        if !found {
            return Err(Error::Bootstrap(
                "join reply does not include the assigned member".to_string(),
            ));
        }

        st.membs = membs;
        st.joined = true;
        engine.storage().boot()?;
        Ok(())
    }
}

/// Replays the WAL and the newest valid snapshot from the state directory.
struct Restart;

#[async_trait]
impl Operator for Restart {
    fn name(&self) -> &'static str {
        "restart"
    }

    async fn before(&self, engine: &Arc<Engine>, st: &mut OperatorsState) -> Result<()> {
        if !engine.storage().has_state() {
            return Err(Error::Bootstrap(
                "state directory is empty, no state to restart from".to_string(),
            ));
        }

        let boot = engine.storage().boot()?;
        let wal_local: Option<RawMember> = match &boot.metadata {
            Some(data) => Some(bincode::deserialize(data)?),
            None => None,
        };

        st.hard_state = boot.hard_state;
        st.entries = boot.entries;

        if !boot.snapshots.is_empty() {
            let sf = engine.storage().snapshotter().recover(&boot.snapshots)?;
            for m in &sf.members {
                if m.kind.is_local() {
                    st.local = Some(m.clone());
                }
            }
            st.snapshot = Some(RecoveredSnapshot {
                raw: sf.raw.clone(),
                members: sf.members.clone(),
            });
        }

        if st.local.is_none() {
            st.local = wal_local;
        }
        st.was_restart = true;
        Ok(())
    }
}

/// Replaces the state directory contents with the given snapshot file, then
/// restarts from it.
struct Restore {
    path: PathBuf,
}

#[async_trait]
impl Operator for Restore {
    fn name(&self) -> &'static str {
        "restore"
    }

    async fn before(&self, engine: &Arc<Engine>, st: &mut OperatorsState) -> Result<()> {
        if engine.storage().has_state() {
            engine.storage().wipe()?;
        }

        let (term, index) = engine.storage().snapshotter().import(&self.path)?;
        engine.storage().boot()?;
        engine.storage().save_snapshot(term, index)?;
        engine.storage().close();

        Restart.before(engine, st).await
    }
}

/// Loads local state but keeps this node as the sole voter; used to recover
/// quorum from a single surviving member.
struct ForceNewCluster;

#[async_trait]
impl Operator for ForceNewCluster {
    fn name(&self) -> &'static str {
        "force-new-cluster"
    }

    async fn before(&self, engine: &Arc<Engine>, st: &mut OperatorsState) -> Result<()> {
        Restart.before(engine, st).await?;

        let mut local = st
            .local
            .clone()
            .ok_or_else(|| Error::Bootstrap("no local member recorded in state".to_string()))?;
        local.kind = MemberType::Local;
        st.local = Some(local.clone());
        st.membs = vec![local.clone()];

        if let Some(snap) = &mut st.snapshot {
            snap.members = vec![local];
            let cs = conf_state_of(&snap.members);
            snap.raw.mut_metadata().set_conf_state(cs);
        }

        // Old membership must never re-apply: blank replayed conf changes
        // into empty normal entries, keeping the log indices contiguous.
        for entry in &mut st.entries {
            if entry.get_entry_type() == EntryType::EntryConfChange {
                entry.set_entry_type(EntryType::EntryNormal);
                entry.set_data(Default::default());
            }
        }
        Ok(())
    }
}

/// Runs each nested operator until the first whose `before` succeeds; only
/// the chosen branch's `after` runs. A failing branch works on a scratch
/// copy of the accumulator, so it can never leak partial mutations.
struct Fallback {
    ops: Vec<Arc<dyn Operator>>,
    chosen: Mutex<Option<usize>>,
}

#[async_trait]
impl Operator for Fallback {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn before(&self, engine: &Arc<Engine>, st: &mut OperatorsState) -> Result<()> {
        for (i, opr) in self.ops.iter().enumerate() {
            let mut scratch = st.clone();
            match opr.before(engine, &mut scratch).await {
                Ok(()) => {
                    *st = scratch;
                    *self.chosen.lock().unwrap() = Some(i);
                    return Ok(());
                }
                Err(err) => {
                    log::warn!(
                        "raft.engine: bootstrap operator {} failed, falling back: {}",
                        opr.name(),
                        err
                    );
                    // A branch may have opened the log before failing.
                    engine.storage().close();
                }
            }
        }
        Err(Error::Bootstrap(
            "no fallback operator succeeded".to_string(),
        ))
    }

    async fn after(&self, engine: &Arc<Engine>, st: &mut OperatorsState) -> Result<()> {
        let chosen = *self.chosen.lock().unwrap();
        match chosen {
            Some(i) => self.ops[i].after(engine, st).await,
            None => Ok(()),
        }
    }
}

/// Internal final operator: publishes the accumulated state into the pool and
/// the state machine once the node exists.
struct StateSetup;

#[async_trait]
impl Operator for StateSetup {
    fn name(&self) -> &'static str {
        "state-setup"
    }

    fn order(&self) -> i32 {
        2
    }

    async fn before(&self, _engine: &Arc<Engine>, _st: &mut OperatorsState) -> Result<()> {
        Ok(())
    }

    async fn after(&self, engine: &Arc<Engine>, st: &mut OperatorsState) -> Result<()> {
        if let Some(snap) = &st.snapshot {
            let meta = snap.raw.get_metadata();
            let sf = engine.storage().snapshotter().read(meta.term, meta.index)?;
            engine.pool().restore(snap.members.clone()).await?;
            engine.restore_fsm(Box::new(sf.data))?;
        } else if st.bootstrap {
            // Write the initial snapshot file so joiners and restarts can
            // anchor membership before the first real snapshot happens.
            let mut meta = SnapshotMetadata::default();
            meta.term = 1;
            meta.index = 1;
            meta.set_conf_state(conf_state_of(&st.membs));
            engine
                .storage()
                .snapshotter()
                .write(&meta, &st.membs, &mut std::io::empty())?;
            engine.storage().save_snapshot(1, 1)?;
            engine.cache().set_snap_meta(SnapMeta {
                term: 1,
                index: 1,
                conf_state: meta.get_conf_state().clone(),
            });

            for m in &st.membs {
                engine.pool().add(m.clone()).await?;
            }
        } else {
            // Membership discovered from the join reply is written from the
            // remote node's point of view.
            let local_id = st.local.as_ref().map(|l| l.id).unwrap_or(0);
            for m in &st.membs {
                engine
                    .pool()
                    .add(relativize(local_id, m.clone()))
                    .await?;
            }
        }

        if !st.was_restart {
            let local = st
                .local
                .as_ref()
                .ok_or_else(|| Error::Bootstrap("no local member".to_string()))?;
            engine.storage().save_metadata(&bincode::serialize(local)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Fsm;
    use crate::membership::Pool;
    use crate::msgbus::MsgBus;
    use crate::storage::Storage;
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

    fn engine(dir: &TempDir) -> Arc<Engine> {
        let cfg = Arc::new(Config::new().with_state_dir(dir.path()));
        let router = Router::new();
        let dial = Arc::new(router);
        let (report_tx, report_rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = Pool::new(&cfg, dial.clone(), report_tx);
        let storage = Storage::new(&cfg).unwrap();
        Engine::new(
            cfg,
            Arc::new(NopFsm),
            storage,
            pool,
            MsgBus::new(),
            dial,
            report_rx,
        )
    }

    #[tokio::test]
    async fn test_invoke_requires_exactly_one_mode() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);

        let err = invoke(&eng, ":5052", vec![members(vec!["1=:5052".to_string()])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bootstrap(_)));

        let err = invoke(&eng, ":5052", vec![init_cluster(), restart()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bootstrap(_)));
    }

    #[tokio::test]
    async fn test_init_cluster_requires_empty_state_dir() {
        let dir = TempDir::new().unwrap();
        {
            let eng = engine(&dir);
            invoke(&eng, ":5052", vec![init_cluster()]).await.unwrap();
            assert_eq!(eng.local().unwrap().id, 1);
        }

        let eng = engine(&dir);
        let err = invoke(&eng, ":5052", vec![init_cluster()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bootstrap(_)));
    }

    #[tokio::test]
    async fn test_members_seed_local_and_peers() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);

        let (st, _raw) = invoke(
            &eng,
            "",
            vec![
                init_cluster(),
                members(vec!["1=mem://1".to_string(), "2=mem://2".to_string()]),
            ],
        )
        .await
        .unwrap();

        assert_eq!(st.local.as_ref().unwrap().id, 1);
        assert_eq!(st.local.as_ref().unwrap().kind, MemberType::Local);
        assert_eq!(st.membs.len(), 2);
        assert!(eng.pool().get(2).is_some());
        assert_eq!(eng.conf_state().voters, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_restart_requires_state() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let err = invoke(&eng, ":5052", vec![restart()]).await.unwrap_err();
        assert!(matches!(err, Error::Bootstrap(_)));
    }

    #[tokio::test]
    async fn test_restart_recovers_identity() {
        let dir = TempDir::new().unwrap();
        {
            let eng = engine(&dir);
            invoke(
                &eng,
                "",
                vec![init_cluster(), members(vec!["7=mem://7".to_string()])],
            )
            .await
            .unwrap();
        }

        let eng = engine(&dir);
        let (st, _raw) = invoke(&eng, "", vec![restart()]).await.unwrap();
        assert!(st.was_restart);
        assert_eq!(st.local.as_ref().unwrap().id, 7);
        assert_eq!(
            st.snapshot.as_ref().unwrap().raw.get_metadata().index,
            1,
            "the initial snapshot anchors the restart"
        );
    }

    #[tokio::test]
    async fn test_fallback_chooses_first_viable_branch() {
        let dir = TempDir::new().unwrap();
        {
            // First start: restart fails on the empty dir, init takes over.
            let eng = engine(&dir);
            let (st, _raw) = invoke(&eng, ":5052", vec![fallback(vec![restart(), init_cluster()])])
                .await
                .unwrap();
            assert!(st.bootstrap);
        }

        // Second start: restart wins.
        let eng = engine(&dir);
        let (st, _raw) = invoke(&eng, ":5052", vec![fallback(vec![restart(), init_cluster()])])
            .await
            .unwrap();
        assert!(st.was_restart);
        assert!(!st.bootstrap);
    }
}
