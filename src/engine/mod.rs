//! The engine: a single-writer event loop around the consensus primitive.
//!
//! The loop is the sole writer of the in-memory log cache, the applied/snap
//! indices and the raw node itself. Everything else reaches it through the
//! two intake channels (proposals and peer messages), the report channel fed
//! by peer pipelines, or reads the status snapshot it publishes after every
//! iteration.

mod cache;
mod idgen;
pub(crate) mod operator;

pub(crate) use cache::{LogCache, SnapMeta};

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use protobuf::{Message as PbMessage, RepeatedField};
use raft::eraftpb::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, Message, MessageType, Snapshot,
    SnapshotMetadata,
};
use raft::{RawNode, SnapshotStatus, StateRole, Storage as RaftStorageApi};
use serde::{Deserialize, Serialize};
use slog::{o, Drain};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::membership::{relativize, MemberType, Pool, RawMember, Report};
use crate::metrics;
use crate::msgbus::MsgBus;
use crate::storage::{SnapshotFile, Storage};
use crate::transport::Dial;

use self::idgen::IdGen;
use self::operator::{Operator, OperatorsState};

const INTAKE_CAPACITY: usize = 4096;
const NOTIFY_CAPACITY: usize = 10;
const LOGGER_CHANNEL_SIZE: usize = 4096;
/// Staging and learner members must reach this share of the leader's match
/// index before promotion.
const PROMOTION_THRESHOLD: f64 = 0.9;

/// User-supplied deterministic state machine replicated by the cluster.
pub trait Fsm: Send + Sync + 'static {
    /// Applies a committed record. Calls arrive from a single task, in log
    /// order, exactly once per record.
    fn apply(&self, data: &[u8]);

    /// Captures the current state as a byte stream.
    fn snapshot(&self) -> Result<Box<dyn Read + Send>>;

    /// Replaces the current state with the snapshot payload.
    fn restore(&self, data: Box<dyn Read + Send>) -> Result<()>;
}

/// Replicated record wrapping user data under a change id.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Replicate {
    pub cid: u64,
    pub data: Vec<u8>,
}

/// Point-in-time view of the consensus state machine, refreshed by the event
/// loop after every iteration.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeStatus {
    pub id: u64,
    pub term: u64,
    pub leader: u64,
    pub is_leader: bool,
    /// Match index per member; populated only on the leader.
    pub progress: HashMap<u64, u64>,
}

struct Intake {
    proposec: mpsc::Sender<Message>,
    msgc: mpsc::Sender<Message>,
}

pub(crate) struct Engine {
    cfg: Arc<Config>,
    fsm: Arc<dyn Fsm>,
    storage: Arc<Storage>,
    pool: Arc<Pool>,
    msgbus: Arc<MsgBus>,
    dial: Arc<dyn Dial>,
    cache: LogCache,
    started: AtomicBool,
    applied_index: AtomicU64,
    snap_index: AtomicU64,
    local: RwLock<Option<RawMember>>,
    idgen: once_cell::sync::OnceCell<IdGen>,
    cstate: Mutex<ConfState>,
    status: RwLock<NodeStatus>,
    intake: RwLock<Option<Intake>>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    snapc: mpsc::Sender<()>,
    snapc_rx: Mutex<Option<mpsc::Receiver<()>>>,
    promotec: mpsc::Sender<()>,
    promotec_rx: Mutex<Option<mpsc::Receiver<()>>>,
    report_rx: Mutex<Option<mpsc::UnboundedReceiver<Report>>>,
    promotions_inflight: Mutex<HashSet<u64>>,
}

impl Engine {
    pub(crate) fn new(
        cfg: Arc<Config>,
        fsm: Arc<dyn Fsm>,
        storage: Arc<Storage>,
        pool: Arc<Pool>,
        msgbus: Arc<MsgBus>,
        dial: Arc<dyn Dial>,
        report_rx: mpsc::UnboundedReceiver<Report>,
    ) -> Arc<Engine> {
        let (snapc, snapc_rx) = mpsc::channel(NOTIFY_CAPACITY);
        let (promotec, promotec_rx) = mpsc::channel(NOTIFY_CAPACITY);
        Arc::new(Engine {
            cache: LogCache::new(snapc.clone()),
            cfg,
            fsm,
            storage,
            pool,
            msgbus,
            dial,
            started: AtomicBool::new(false),
            applied_index: AtomicU64::new(0),
            snap_index: AtomicU64::new(0),
            local: RwLock::new(None),
            idgen: once_cell::sync::OnceCell::new(),
            cstate: Mutex::new(ConfState::default()),
            status: RwLock::new(NodeStatus::default()),
            intake: RwLock::new(None),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            snapc,
            snapc_rx: Mutex::new(Some(snapc_rx)),
            promotec,
            promotec_rx: Mutex::new(Some(promotec_rx)),
            report_rx: Mutex::new(Some(report_rx)),
            promotions_inflight: Mutex::new(HashSet::new()),
        })
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn status(&self) -> NodeStatus {
        self.status.read().unwrap().clone()
    }

    pub(crate) fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    pub(crate) fn local(&self) -> Option<RawMember> {
        self.local.read().unwrap().clone()
    }

    pub(crate) fn set_local(&self, raw: RawMember) {
        *self.local.write().unwrap() = Some(raw);
    }

    pub(crate) fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub(crate) fn dialer(&self) -> &Arc<dyn Dial> {
        &self.dial
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    pub(crate) fn cache(&self) -> &LogCache {
        &self.cache
    }

    pub(crate) fn restore_fsm(&self, data: Box<dyn Read + Send>) -> Result<()> {
        self.fsm.restore(data)
    }

    pub(crate) fn conf_state(&self) -> ConfState {
        self.cstate.lock().unwrap().clone()
    }

    pub(crate) fn set_conf_state(&self, cs: ConfState) {
        *self.cstate.lock().unwrap() = cs;
    }

    pub(crate) fn set_indices(&self, applied: u64, snap: u64) {
        self.applied_index.store(applied, Ordering::SeqCst);
        self.snap_index.store(snap, Ordering::SeqCst);
    }

    /// Boots the node through the operator pipeline, then runs the event loop
    /// until the engine is closed. Blocks for the node's lifetime.
    pub(crate) async fn start(
        self: &Arc<Self>,
        addr: &str,
        operators: Vec<Arc<dyn Operator>>,
    ) -> Result<()> {
        if self.is_started() {
            return Err(Error::Bootstrap("engine already started".to_string()));
        }

        let (_ost, raw) = operator::invoke(self, addr, operators).await?;

        let local = self.local().ok_or(Error::Stopped)?;
        let _ = self.idgen.set(IdGen::new(local.id));

        let (proposec, proposal_rx) = mpsc::channel(INTAKE_CAPACITY);
        let (msgc, msg_rx) = mpsc::channel(INTAKE_CAPACITY);
        *self.intake.write().unwrap() = Some(Intake { proposec, msgc });

        let (cancel, cancelled) = watch::channel(false);
        *self.cancel.lock().unwrap() = Some(cancel);

        let report_rx = self
            .report_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::Stopped)?;
        let snapc_rx = self.snapc_rx.lock().unwrap().take().ok_or(Error::Stopped)?;
        let promotec_rx = self
            .promotec_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::Stopped)?;

        self.started.store(true, Ordering::SeqCst);

        {
            let mut tasks = self.tasks.lock().unwrap();
            let engine = Arc::clone(self);
            let c = cancelled.clone();
            tasks.push(tokio::spawn(
                async move { engine.snapshots(snapc_rx, c).await },
            ));
            let engine = Arc::clone(self);
            let c = cancelled.clone();
            tasks.push(tokio::spawn(async move {
                engine.promotions(promotec_rx, c).await
            }));
        }

        let res = self
            .event_loop(raw, proposal_rx, msg_rx, report_rx, cancelled)
            .await;

        if self.is_started() {
            // The loop died on its own (storage failure); tear down the rest.
            let _ = self.close().await;
        }
        res
    }

    /// Builds the raw node from the accumulated bootstrap state: seeds the
    /// cache with the snapshot, hard state and entries, then constructs the
    /// primitive. Runs between the operators' before and after phases.
    pub(crate) fn construct(&self, st: &mut OperatorsState) -> Result<RawNode<LogCache>> {
        let local = st
            .local
            .clone()
            .ok_or_else(|| Error::Bootstrap("unable to determine local member identity".to_string()))?;

        let mut snap_index = 0u64;
        if let Some(snap) = &st.snapshot {
            let meta = snap.raw.get_metadata();
            snap_index = meta.index;
            self.cache.mem().wl().apply_snapshot(snap.raw.clone())?;
            self.cache.set_snap_meta(SnapMeta {
                term: meta.term,
                index: meta.index,
                conf_state: meta.get_conf_state().clone(),
            });
            self.set_conf_state(meta.get_conf_state().clone());
        } else if st.bootstrap {
            // A fresh cluster is seeded through a synthetic snapshot carrying
            // the initial voter set; the matching file is written during the
            // after phase.
            let mut snap = Snapshot::default();
            let meta = snap.mut_metadata();
            meta.term = 1;
            meta.index = 1;
            meta.set_conf_state(conf_state_of(&st.membs));
            snap_index = 1;
            self.set_conf_state(meta.get_conf_state().clone());
            self.cache.mem().wl().apply_snapshot(snap)?;
        }

        if let Some(hs) = &st.hard_state {
            self.cache.mem().wl().set_hardstate(hs.clone());
        }

        let entries: Vec<Entry> = st
            .entries
            .iter()
            .filter(|e| e.index > snap_index)
            .cloned()
            .collect();
        if let Some(first) = entries.first() {
            if first.index != snap_index + 1 {
                return Err(Error::Bootstrap(format!(
                    "gap in the replayed log: snapshot ends at {}, entries start at {}",
                    snap_index, first.index
                )));
            }
            self.cache.mem().wl().append(&entries)?;
        }

        self.set_indices(snap_index, snap_index);
        self.set_local(local.clone());

        let rcfg = self.cfg.raft_config(local.id, snap_index);
        rcfg.validate()?;

        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .chan_size(LOGGER_CHANNEL_SIZE)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        let logger = slog::Logger::root(drain, o!("tag" => format!("member_{:x}", local.id)));

        Ok(RawNode::new(&rcfg, self.cache.clone(), &logger)?)
    }

    /// Stops the engine: intake closed, loop drained, tasks joined, bus,
    /// storage and pool closed. Idempotent.
    pub(crate) async fn close(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        log::info!("raft.engine: shutting down");

        *self.intake.write().unwrap() = None;
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            let _ = cancel.send(true);
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }

        self.msgbus.close();
        self.storage.close();
        self.pool.close().await;
        Ok(())
    }

    /// Routes a message to the engine queues: proposals to the proposal
    /// channel, everything else to the message channel. Blocks the caller
    /// when the queue is full.
    pub(crate) async fn push(&self, msg: Message) -> Result<()> {
        if !self.is_started() {
            return Err(Error::Stopped);
        }

        let sender = {
            let guard = self.intake.read().unwrap();
            let intake = guard.as_ref().ok_or(Error::Stopped)?;
            if msg.get_msg_type() == MessageType::MsgPropose {
                intake.proposec.clone()
            } else {
                intake.msgc.clone()
            }
        };
        sender.send(msg).await.map_err(|_| Error::Stopped)
    }

    /// Proposes `data` for replication and waits until the record is applied
    /// to the local state machine.
    pub(crate) async fn propose_replicate(&self, data: Vec<u8>) -> Result<()> {
        if !self.is_started() {
            return Err(Error::Stopped);
        }

        let cid = self.next_id()?;
        let record = Replicate { cid, data };
        let buf = bincode::serialize(&record)?;

        log::debug!("raft.engine: propose replicate data, change id => {}", cid);
        metrics::PROPOSALS_TOTAL
            .with_label_values(&["replicate"])
            .inc();

        let mut sub = self.msgbus.subscribe_once(cid);

        let mut entry = Entry::default();
        entry.set_data(buf.into());
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgPropose);
        msg.set_entries(RepeatedField::from_vec(vec![entry]));
        self.push(msg).await?;

        match sub.recv().await {
            Some(Ok(_)) => Ok(()),
            Some(Err(err)) => Err(err),
            None => Err(Error::Stopped),
        }
    }

    /// Proposes a configuration change and waits until it is committed and
    /// applied to the membership pool.
    pub(crate) async fn propose_conf_change(
        &self,
        member: &RawMember,
        typ: ConfChangeType,
    ) -> Result<()> {
        if !self.is_started() {
            return Err(Error::Stopped);
        }

        let mut cc = ConfChange::default();
        cc.id = self.next_id()?;
        cc.set_change_type(typ);
        cc.node_id = member.id;
        cc.set_context(bincode::serialize(member)?.into());

        log::debug!("raft.engine: propose conf change, change id => {}", cc.id);
        metrics::PROPOSALS_TOTAL
            .with_label_values(&["conf-change"])
            .inc();

        let mut sub = self.msgbus.subscribe_once(cc.id);

        let mut entry = Entry::default();
        entry.set_entry_type(EntryType::EntryConfChange);
        entry.set_data(cc.write_to_bytes()?.into());
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgPropose);
        msg.set_entries(RepeatedField::from_vec(vec![entry]));
        self.push(msg).await?;

        match sub.recv().await {
            Some(Ok(_)) => Ok(()),
            Some(Err(err)) => Err(err),
            None => Err(Error::Stopped),
        }
    }

    /// Linearizable read barrier: obtains the leader's read index, retrying
    /// every `retry_after` in case the reply is lost to a leader change, then
    /// waits until the local applied index catches up to it.
    pub(crate) async fn linearizable_read(&self, retry_after: std::time::Duration) -> Result<()> {
        if !self.is_started() {
            return Err(Error::Stopped);
        }

        let id = self.next_id()?;
        let rctx = id.to_be_bytes().to_vec();

        let index = {
            let mut sub = self.msgbus.subscribe_once(id);
            let mut ticker = tokio::time::interval(retry_after);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                let mut entry = Entry::default();
                entry.set_data(rctx.clone().into());
                let mut msg = Message::default();
                msg.set_msg_type(MessageType::MsgReadIndex);
                msg.set_entries(RepeatedField::from_vec(vec![entry]));
                self.push(msg).await?;

                tokio::select! {
                    _ = ticker.tick() => continue,
                    v = sub.recv() => match v {
                        Some(Ok(index)) => break index,
                        Some(Err(err)) => return Err(err),
                        None => return Err(Error::Stopped),
                    },
                }
            }
        };

        // Current node is up to date.
        if index <= self.applied_index() {
            return Ok(());
        }

        // Wait until the leader index is applied into this node. Re-check
        // after subscribing so a racing apply is not missed.
        let mut sub = self.msgbus.subscribe_once(index);
        if index <= self.applied_index() {
            return Ok(());
        }
        match sub.recv().await {
            Some(Ok(_)) => Ok(()),
            Some(Err(err)) => Err(err),
            None => Err(Error::Stopped),
        }
    }

    /// Hands leadership to `transferee` and polls until the switch is
    /// observed. Callers bound the wait with their own timeout.
    pub(crate) async fn transfer_leadership(&self, transferee: u64) -> Result<()> {
        if !self.is_started() {
            return Err(Error::Stopped);
        }

        let leader = self.status().leader;
        log::info!(
            "raft.engine: start transfer leadership {:x} -> {:x}",
            leader,
            transferee
        );

        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgTransferLeader);
        msg.from = transferee;
        msg.to = leader;
        self.push(msg).await?;

        let poll = std::cmp::max(
            self.cfg.tick_interval / 10,
            std::time::Duration::from_millis(1),
        );
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let status = self.status();
            if status.leader != raft::INVALID_ID && status.leader == transferee {
                return Ok(());
            }
            if !self.is_started() {
                return Err(Error::Stopped);
            }
            ticker.tick().await;
        }
    }

    /// Takes a snapshot of the state machine at the applied index, persists
    /// it and compacts the log. Returns the (term, index) of the newest
    /// snapshot file.
    pub(crate) async fn create_snapshot(&self) -> Result<(u64, u64)> {
        let applied = self.applied_index();
        let snap_index = self.snap_index.load(Ordering::SeqCst);

        if applied == snap_index {
            // Up to date; the newest file already covers the applied index.
            if let Some(meta) = self.cache.snap_meta() {
                return Ok((meta.term, meta.index));
            }
        }

        log::info!(
            "raft.engine: start snapshot [applied index: {} | last snapshot index: {}]",
            applied,
            snap_index
        );

        let mut data = self.fsm.snapshot()?;
        let term = self.cache.term(applied)?;
        let conf_state = self.conf_state();

        let mut meta = SnapshotMetadata::default();
        meta.term = term;
        meta.index = applied;
        meta.set_conf_state(conf_state.clone());

        let members = self.pool.snapshot();
        self.storage
            .snapshotter()
            .write(&meta, &members, &mut *data)?;
        self.storage.save_snapshot(term, applied)?;

        let compact_index = if applied > self.cfg.snap_interval {
            applied - self.cfg.snap_interval
        } else {
            1
        };
        if let Err(err) = self.cache.mem().wl().compact(compact_index) {
            // Already compacted past this point.
            log::debug!(
                "raft.engine: compacting cache at {}: {}",
                compact_index,
                err
            );
        }
        self.storage.compact(compact_index)?;

        self.cache.set_snap_meta(SnapMeta {
            term,
            index: applied,
            conf_state,
        });
        self.snap_index.store(applied, Ordering::SeqCst);
        metrics::SNAPSHOTS_TOTAL.inc();

        log::info!("raft.engine: compacted log at index {}", compact_index);
        Ok((term, applied))
    }

    /// Installs a snapshot file: cache, membership pool, state machine,
    /// conf state and indices, in that order.
    pub(crate) async fn publish_snapshot_file(&self, sf: SnapshotFile) -> Result<()> {
        let meta = sf.raw.get_metadata().clone();

        self.cache.mem().wl().apply_snapshot(sf.raw.clone())?;
        self.cache.set_snap_meta(SnapMeta {
            term: meta.term,
            index: meta.index,
            conf_state: meta.get_conf_state().clone(),
        });

        // The sender recorded membership from its own point of view.
        let local_id = self.local().map(|l| l.id).unwrap_or(0);
        let members = sf
            .members
            .into_iter()
            .map(|m| relativize(local_id, m))
            .collect();
        self.pool.restore(members).await?;
        self.fsm.restore(Box::new(sf.data))?;

        self.set_conf_state(meta.get_conf_state().clone());
        self.set_indices(meta.index, meta.index);
        Ok(())
    }

    fn next_id(&self) -> Result<u64> {
        Ok(self.idgen.get().ok_or(Error::Stopped)?.next())
    }

    async fn event_loop(
        self: &Arc<Self>,
        mut raw: RawNode<LogCache>,
        mut proposal_rx: mpsc::Receiver<Message>,
        mut msg_rx: mpsc::Receiver<Message>,
        mut report_rx: mpsc::UnboundedReceiver<Report>,
        mut cancelled: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.cfg.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    raw.tick();
                }
                Some(msg) = proposal_rx.recv() => {
                    self.step(&mut raw, msg);
                    while let Ok(msg) = proposal_rx.try_recv() {
                        self.step(&mut raw, msg);
                    }
                }
                Some(msg) = msg_rx.recv() => {
                    self.step(&mut raw, msg);
                    while let Ok(msg) = msg_rx.try_recv() {
                        self.step(&mut raw, msg);
                    }
                }
                Some(report) = report_rx.recv() => {
                    self.handle_report(&mut raw, report);
                }
                _ = cancelled.changed() => {
                    return Err(Error::Stopped);
                }
            }

            if raw.has_ready() {
                if let Err(err) = self.on_ready(&mut raw).await {
                    log::error!("raft.engine: event loop failed: {}", err);
                    return Err(err);
                }
            }
            self.update_status(&raw);
        }
    }

    fn step(&self, raw: &mut RawNode<LogCache>, msg: Message) {
        let proposal = msg.get_msg_type() == MessageType::MsgPropose;
        let entries = if proposal {
            msg.get_entries().to_vec()
        } else {
            Vec::new()
        };

        if let Err(err) = raw.step(msg) {
            log::warn!("raft.engine: process raft message: {}", err);
            // Wake proposers whose message was dropped; they would otherwise
            // wait for an apply that never happens.
            let err = Error::from(err);
            for entry in entries {
                match entry.get_entry_type() {
                    EntryType::EntryNormal => {
                        if let Ok(r) = bincode::deserialize::<Replicate>(&entry.data) {
                            self.msgbus.broadcast(r.cid, Err(err.clone()));
                        }
                    }
                    EntryType::EntryConfChange => {
                        let mut cc = ConfChange::default();
                        if cc.merge_from_bytes(&entry.data).is_ok() {
                            self.msgbus.broadcast(cc.id, Err(err.clone()));
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn handle_report(self: &Arc<Self>, raw: &mut RawNode<LogCache>, report: Report) {
        match report {
            Report::Unreachable(id) => raw.report_unreachable(id),
            Report::SnapshotFinish(id) => raw.report_snapshot(id, SnapshotStatus::Finish),
            Report::SnapshotFailure(id) => raw.report_snapshot(id, SnapshotStatus::Failure),
            Report::Shutdown(id) => {
                log::info!(
                    "raft.engine: member {:x} removed from the cluster, shutting down",
                    id
                );
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = engine.close().await;
                });
            }
        }
    }

    /// One ready drain, in the documented order: persist, install snapshot,
    /// cache, send, apply, notify, advance.
    async fn on_ready(&self, raw: &mut RawNode<LogCache>) -> Result<()> {
        let mut ready = raw.ready();
        let prev_applied = self.applied_index();

        self.storage.save(ready.hs(), ready.entries())?;

        if *ready.snapshot() != Snapshot::default() {
            self.publish_snapshot(ready.snapshot().clone()).await?;
        }

        self.cache.mem().wl().append(ready.entries())?;

        if let Some(ss) = ready.ss() {
            if ss.leader_id == raft::INVALID_ID {
                self.msgbus.broadcast_all(Err(Error::NoLeader));
            }
        }

        self.send(ready.take_messages());
        self.send(ready.take_persisted_messages());

        self.publish_committed(raw, ready.take_committed_entries())
            .await;
        self.publish_read_states(ready.take_read_states());
        self.publish_applied_indices(prev_applied, self.applied_index());

        let _ = self.snapc.try_send(());
        let _ = self.promotec.try_send(());

        let mut light = raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.cache.mem().wl().mut_hard_state().set_commit(commit);
        }
        self.send(light.take_messages());
        let prev_applied = self.applied_index();
        self.publish_committed(raw, light.take_committed_entries())
            .await;
        self.publish_applied_indices(prev_applied, self.applied_index());
        raw.advance_apply();

        Ok(())
    }

    async fn publish_snapshot(&self, snap: Snapshot) -> Result<()> {
        let meta = snap.get_metadata();
        if meta.index <= self.applied_index() {
            return Err(Error::Raft(format!(
                "snapshot index [{}] should be greater than the applied index [{}]",
                meta.index,
                self.applied_index()
            )));
        }

        self.storage.save_snapshot(meta.term, meta.index)?;
        let sf = self.storage.snapshotter().read(meta.term, meta.index)?;
        self.publish_snapshot_file(sf).await
    }

    async fn publish_committed(&self, raw: &mut RawNode<LogCache>, entries: Vec<Entry>) {
        for entry in entries {
            match entry.get_entry_type() {
                EntryType::EntryNormal if !entry.data.is_empty() => {
                    self.publish_replicate(&entry);
                }
                EntryType::EntryConfChange => {
                    self.publish_conf_change(raw, &entry).await;
                }
                _ => {}
            }
            self.applied_index.store(entry.index, Ordering::SeqCst);
        }
    }

    fn publish_replicate(&self, entry: &Entry) {
        match bincode::deserialize::<Replicate>(&entry.data) {
            Ok(record) => {
                log::debug!(
                    "raft.engine: publishing replicate data, change id => {}",
                    record.cid
                );
                self.fsm.apply(&record.data);
                metrics::APPLIED_ENTRIES_TOTAL.inc();
                self.msgbus.broadcast(record.cid, Ok(entry.index));
            }
            Err(err) => {
                log::warn!("raft.engine: publishing replicate data: {}", err);
            }
        }
    }

    async fn publish_conf_change(&self, raw: &mut RawNode<LogCache>, entry: &Entry) {
        let mut cc = ConfChange::default();
        if let Err(err) = cc.merge_from_bytes(&entry.data) {
            log::warn!("raft.engine: publishing conf change: {}", err);
            return;
        }

        log::debug!("raft.engine: publishing conf change, change id => {}", cc.id);

        let mut result: Result<()> = Ok(());
        if !cc.context.is_empty() {
            let local_id = self.local().map(|l| l.id).unwrap_or(0);
            match bincode::deserialize::<RawMember>(&cc.context) {
                Ok(member) => match cc.get_change_type() {
                    ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                        result = self.pool.add(relativize(local_id, member)).await;
                    }
                    ConfChangeType::UpdateNode => {
                        result = self.pool.update(relativize(local_id, member)).await;
                    }
                    ConfChangeType::RemoveNode => {
                        // Defer the physical removal by two ticks so the
                        // commit acknowledgment flushes first.
                        let pool = Arc::clone(&self.pool);
                        let delay = self.cfg.tick_interval * 2;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Err(err) = pool.remove(member.clone()).await {
                                log::error!(
                                    "raft.engine: removing member {:x}: {}",
                                    member.id,
                                    err
                                );
                            }
                        });
                    }
                },
                Err(err) => result = Err(err.into()),
            }
        }

        match raw.apply_conf_change(&cc) {
            Ok(cs) => {
                self.cache.mem().wl().set_conf_state(cs.clone());
                self.set_conf_state(cs);
            }
            Err(err) => {
                log::warn!("raft.engine: applying conf change: {}", err);
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
        }

        self.promotions_inflight.lock().unwrap().remove(&cc.node_id);

        if let Err(err) = &result {
            log::warn!("raft.engine: publishing conf change: {}", err);
        }
        self.msgbus.broadcast(cc.id, result.map(|_| entry.index));
    }

    fn publish_read_states(&self, states: Vec<raft::ReadState>) {
        for rs in states {
            if rs.request_ctx.len() != 8 {
                continue;
            }
            let id = u64::from_be_bytes(rs.request_ctx[..8].try_into().unwrap());
            self.msgbus.broadcast(id, Ok(rs.index));
        }
    }

    fn publish_applied_indices(&self, prev: u64, curr: u64) {
        for index in prev + 1..=curr {
            self.msgbus.broadcast(index, Ok(index));
        }
    }

    fn send(&self, msgs: Vec<Message>) {
        for msg in msgs {
            let to = msg.to;
            let mtype = msg.get_msg_type();
            match self.pool.get(to) {
                None => {
                    log::warn!(
                        "raft.engine: sending message {:?} to member {:x}: unknown member",
                        mtype,
                        to
                    );
                }
                Some(member) => {
                    if let Err(err) = member.send(msg) {
                        log::warn!(
                            "raft.engine: sending message {:?} to member {:x}: {}",
                            mtype,
                            to,
                            err
                        );
                    }
                }
            }
        }
    }

    fn update_status(&self, raw: &RawNode<LogCache>) {
        let raft = &raw.raft;
        let mut progress = HashMap::new();
        if raft.state == StateRole::Leader {
            for member in self.pool.members() {
                let id = member.id();
                if let Some(pr) = raft.prs().get(id) {
                    progress.insert(id, pr.matched);
                }
            }
            if let Some(pr) = raft.prs().get(raft.id) {
                progress.insert(raft.id, pr.matched);
            }
        }

        *self.status.write().unwrap() = NodeStatus {
            id: raft.id,
            term: raft.term,
            leader: raft.leader_id,
            is_leader: raft.state == StateRole::Leader,
            progress,
        };
    }

    async fn snapshots(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<()>,
        mut cancelled: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = cancelled.changed() => return,
                maybe = rx.recv() => {
                    if maybe.is_none() {
                        return;
                    }
                }
            }

            let applied = self.applied_index();
            let gap = applied.saturating_sub(self.snap_index.load(Ordering::SeqCst));
            let has_file = self.cache.snap_meta().is_some();
            if applied == 0 || (has_file && gap <= self.cfg.snap_interval) {
                continue;
            }

            if let Err(err) = self.create_snapshot().await {
                log::error!(
                    "raft.engine: creating new snapshot at index {} failed: {}",
                    applied,
                    err
                );
            }
        }
    }

    /// Scans for staging members that caught up with the leader and proposes
    /// re-typing them as voters. The pass is skipped entirely when quorum is
    /// not reachable.
    async fn promotions(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<()>,
        mut cancelled: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = cancelled.changed() => return,
                maybe = rx.recv() => {
                    if maybe.is_none() {
                        return;
                    }
                }
            }

            let status = self.status();
            if !status.is_leader {
                continue;
            }

            let mut voters = 0usize;
            let mut reachables = 0usize;
            let mut promotions = Vec::new();

            for member in self.pool.members() {
                let raw = member.raw();
                if matches!(raw.kind, MemberType::Voter | MemberType::Local) {
                    voters += 1;
                    if member.is_active() {
                        reachables += 1;
                    }
                }

                if raw.kind != MemberType::Staging {
                    continue;
                }
                if self.promotions_inflight.lock().unwrap().contains(&raw.id) {
                    continue;
                }

                let leader_match = status.progress.get(&status.id).copied().unwrap_or(0);
                let staging_match = status.progress.get(&raw.id).copied().unwrap_or(0);
                if (staging_match as f64) < leader_match as f64 * PROMOTION_THRESHOLD {
                    continue;
                }

                let mut raw = raw;
                raw.kind = MemberType::Voter;
                promotions.push(raw);
            }

            // Stricter than the availability quorum: promotion waits for a
            // ceiling majority of voters to be reachable.
            if reachables < (voters + 1) / 2 + 1 {
                continue;
            }

            for member in promotions {
                self.promotions_inflight.lock().unwrap().insert(member.id);
                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    log::info!("raft.engine: promoting staging member {:x}", member.id);
                    let deadline = engine.cfg.tick_interval * 5;
                    let res = tokio::time::timeout(
                        deadline,
                        engine.propose_conf_change(&member, ConfChangeType::AddNode),
                    )
                    .await;
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            log::warn!(
                                "raft.engine: promoting staging member {:x}: {}",
                                member.id,
                                err
                            );
                        }
                        Err(_) => {
                            log::warn!(
                                "raft.engine: promoting staging member {:x}: timed out",
                                member.id
                            );
                        }
                    }
                    engine
                        .promotions_inflight
                        .lock()
                        .unwrap()
                        .remove(&member.id);
                });
            }
        }
    }
}

/// Conf state spanning the given members: voters and learners by id.
pub(crate) fn conf_state_of(members: &[RawMember]) -> ConfState {
    let mut cs = ConfState::default();
    for m in members {
        match m.kind {
            MemberType::Voter | MemberType::Local | MemberType::Staging => cs.voters.push(m.id),
            MemberType::Learner | MemberType::LocalLearner => cs.learners.push(m.id),
            MemberType::Removed => {}
        }
    }
    cs
}
