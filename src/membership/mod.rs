//! Cluster membership: the pool of known members and their send pipelines.
//!
//! The pool is a serialized map `id -> Member`. Mutations happen only on
//! behalf of committed configuration changes (or a snapshot restore) and are
//! funneled through one async mutex; reads take a brief shared lock.

mod member;
mod remote;

pub use member::{MemberType, RawMember, NONE_ID};

pub(crate) use member::Member;

/// Re-types a member listing received from another node: the sender marked
/// itself `Local`, which is only true from its own point of view.
pub(crate) fn relativize(local_id: u64, mut m: RawMember) -> RawMember {
    if m.kind == MemberType::Removed {
        return m;
    }
    if m.id == local_id {
        m.kind = if m.kind.is_learner() {
            MemberType::LocalLearner
        } else {
            MemberType::Local
        };
    } else if m.kind.is_local() {
        m.kind = if m.kind == MemberType::LocalLearner {
            MemberType::Learner
        } else {
            MemberType::Voter
        };
    }
    m
}

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::membership::remote::RemoteMember;
use crate::transport::Dial;

/// Delivery outcomes reported back to the consensus primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Report {
    Unreachable(u64),
    SnapshotFinish(u64),
    SnapshotFailure(u64),
    /// The local member was removed from the cluster.
    Shutdown(u64),
}

pub(crate) type ReportSink = mpsc::UnboundedSender<Report>;

/// The set of peers this node knows about.
pub(crate) struct Pool {
    dial: Arc<dyn Dial>,
    report: ReportSink,
    stream_timeout: std::time::Duration,
    drain_timeout: std::time::Duration,
    members: RwLock<HashMap<u64, Arc<Member>>>,
    // Serializes add/update/remove/restore; never held across reads.
    write: tokio::sync::Mutex<()>,
}

impl Pool {
    pub(crate) fn new(cfg: &Config, dial: Arc<dyn Dial>, report: ReportSink) -> Arc<Pool> {
        Arc::new(Pool {
            dial,
            report,
            stream_timeout: cfg.stream_timeout,
            drain_timeout: cfg.drain_timeout,
            members: RwLock::new(HashMap::new()),
            write: tokio::sync::Mutex::new(()),
        })
    }

    pub(crate) fn get(&self, id: u64) -> Option<Arc<Member>> {
        self.members.read().unwrap().get(&id).cloned()
    }

    pub(crate) fn members(&self) -> Vec<Arc<Member>> {
        self.members.read().unwrap().values().cloned().collect()
    }

    /// Full membership listing, removed members included, as written into
    /// snapshot trailers.
    pub(crate) fn snapshot(&self) -> Vec<RawMember> {
        self.members().iter().map(|m| m.raw()).collect()
    }

    /// Smallest unused member id.
    pub(crate) fn next_id(&self) -> u64 {
        self.members
            .read()
            .unwrap()
            .keys()
            .max()
            .map(|max| max + 1)
            .unwrap_or(1)
    }

    /// Admits a member, or recasts an existing one to the given type. Once a
    /// member is removed it never returns under any other type.
    pub(crate) async fn add(&self, raw: RawMember) -> Result<()> {
        let _guard = self.write.lock().await;

        if let Some(existing) = self.get(raw.id) {
            if existing.kind() == MemberType::Removed {
                return Err(Error::AlreadyRemoved(raw.id));
            }
            if existing.address() != raw.address {
                existing.update(raw.address.clone()).await?;
            }
            // The local slot stays local whatever role the cluster assigns.
            let kind = if existing.kind().is_local() {
                if raw.kind.is_learner() {
                    MemberType::LocalLearner
                } else {
                    MemberType::Local
                }
            } else {
                raw.kind
            };
            existing.set_kind(kind);
            return Ok(());
        }

        let member = self.create(raw.clone()).await?;
        self.members
            .write()
            .unwrap()
            .insert(raw.id, Arc::new(member));
        Ok(())
    }

    /// Moves a member to a new address.
    pub(crate) async fn update(&self, raw: RawMember) -> Result<()> {
        let _guard = self.write.lock().await;
        let member = self.get(raw.id).ok_or(Error::NotMember(raw.id))?;
        member.update(raw.address).await
    }

    /// Tears down a member's pipeline and leaves a removed stub behind.
    pub(crate) async fn remove(&self, raw: RawMember) -> Result<()> {
        let _guard = self.write.lock().await;
        let member = self.get(raw.id).ok_or(Error::NotMember(raw.id))?;
        if member.kind() == MemberType::Removed {
            return Ok(());
        }

        let was_local = member.kind().is_local();
        member.close().await;
        self.members
            .write()
            .unwrap()
            .insert(raw.id, Arc::new(Member::removed(member.raw())));

        if was_local {
            let _ = self.report.send(Report::Shutdown(raw.id));
        }
        Ok(())
    }

    /// Replaces the whole pool with the membership recorded in a snapshot.
    pub(crate) async fn restore(&self, members: Vec<RawMember>) -> Result<()> {
        {
            let _guard = self.write.lock().await;
            let old = std::mem::take(&mut *self.members.write().unwrap());
            for member in old.values() {
                member.close().await;
            }
        }

        for raw in members {
            if let Err(err) = self.add(raw.clone()).await {
                log::error!(
                    "raft.membership: restoring member {:x}: {}",
                    raw.id,
                    err
                );
            }
        }
        Ok(())
    }

    pub(crate) async fn close(&self) {
        let _guard = self.write.lock().await;
        let members = std::mem::take(&mut *self.members.write().unwrap());
        for member in members.values() {
            member.close().await;
        }
    }

    /// Factory: produces the concrete peer for a member type.
    async fn create(&self, raw: RawMember) -> Result<Member> {
        match raw.kind {
            MemberType::Local | MemberType::LocalLearner => Ok(Member::local(raw)),
            MemberType::Removed => Ok(Member::removed(raw)),
            MemberType::Voter | MemberType::Learner | MemberType::Staging => {
                let remote = RemoteMember::connect(
                    raw,
                    Arc::clone(&self.dial),
                    self.report.clone(),
                    self.stream_timeout,
                    self.drain_timeout,
                )
                .await?;
                Ok(Member::Remote(remote))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::Router;

    fn pool() -> (Arc<Pool>, mpsc::UnboundedReceiver<Report>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cfg = Config::new();
        (Pool::new(&cfg, Arc::new(Router::new()), tx), rx)
    }

    fn raw(id: u64, kind: MemberType) -> RawMember {
        RawMember {
            id,
            address: format!("mem://{}", id),
            kind,
        }
    }

    #[tokio::test]
    async fn test_factory_member_types() {
        let (pool, _rx) = pool();

        pool.add(raw(1, MemberType::Local)).await.unwrap();
        pool.add(raw(2, MemberType::Voter)).await.unwrap();
        pool.add(raw(3, MemberType::Removed)).await.unwrap();

        assert!(pool.get(1).unwrap().kind().is_local());
        assert_eq!(pool.get(2).unwrap().kind(), MemberType::Voter);
        assert_eq!(pool.get(3).unwrap().kind(), MemberType::Removed);
        assert_eq!(pool.members().len(), 3);
    }

    #[tokio::test]
    async fn test_next_id() {
        let (pool, _rx) = pool();
        assert_eq!(pool.next_id(), 1);

        pool.add(raw(1, MemberType::Local)).await.unwrap();
        pool.add(raw(5, MemberType::Voter)).await.unwrap();
        assert_eq!(pool.next_id(), 6);
    }

    #[tokio::test]
    async fn test_add_recasts_existing_member() {
        let (pool, _rx) = pool();
        pool.add(raw(2, MemberType::Staging)).await.unwrap();

        pool.add(raw(2, MemberType::Voter)).await.unwrap();
        assert_eq!(pool.get(2).unwrap().kind(), MemberType::Voter);
        assert_eq!(pool.members().len(), 1);
    }

    #[tokio::test]
    async fn test_removed_member_never_returns() {
        let (pool, _rx) = pool();
        pool.add(raw(2, MemberType::Voter)).await.unwrap();
        pool.remove(raw(2, MemberType::Voter)).await.unwrap();

        assert_eq!(pool.get(2).unwrap().kind(), MemberType::Removed);
        assert_eq!(
            pool.add(raw(2, MemberType::Voter)).await,
            Err(Error::AlreadyRemoved(2))
        );
    }

    #[tokio::test]
    async fn test_removing_local_reports_shutdown() {
        let (pool, mut rx) = pool();
        pool.add(raw(1, MemberType::Local)).await.unwrap();
        pool.remove(raw(1, MemberType::Local)).await.unwrap();
        assert_eq!(rx.recv().await, Some(Report::Shutdown(1)));
    }

    #[tokio::test]
    async fn test_restore_replaces_pool() {
        let (pool, _rx) = pool();
        pool.add(raw(7, MemberType::Voter)).await.unwrap();

        pool.restore(vec![
            raw(1, MemberType::Local),
            raw(2, MemberType::Voter),
            raw(3, MemberType::Removed),
        ])
        .await
        .unwrap();

        assert!(pool.get(7).is_none());
        assert_eq!(pool.members().len(), 3);
        assert_eq!(pool.get(3).unwrap().kind(), MemberType::Removed);
    }
}
