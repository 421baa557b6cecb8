//! Member identities and the per-member peer variants.

use std::time::SystemTime;

use raft::eraftpb::Message;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::membership::remote::RemoteMember;

/// Reserved id meaning "none".
pub const NONE_ID: u64 = 0;

/// Role of a member within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberType {
    /// Counts toward quorum.
    Voter,
    /// Replicates but never votes.
    Learner,
    /// Pre-voter state awaiting catch-up; auto-promoted by the engine.
    Staging,
    /// The local node as a voter.
    Local,
    /// The local node as a learner.
    LocalLearner,
    /// Logically removed; never returns to any other type.
    Removed,
}

impl MemberType {
    pub fn is_local(self) -> bool {
        matches!(self, MemberType::Local | MemberType::LocalLearner)
    }

    pub fn is_learner(self) -> bool {
        matches!(self, MemberType::Learner | MemberType::LocalLearner)
    }
}

/// Wire-level description of a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMember {
    pub id: u64,
    pub address: String,
    pub kind: MemberType,
}

impl RawMember {
    /// Formats a member URL, the general form being `{id}={addr}`.
    pub fn url(id: u64, addr: &str) -> String {
        format!("{}={}", id, addr)
    }

    /// Parses a `{id}={addr}` member URL.
    pub fn from_url(url: &str) -> Result<RawMember> {
        let (id, addr) = url
            .split_once('=')
            .ok_or_else(|| Error::Bootstrap(format!("invalid member url {:?}", url)))?;
        let id = id
            .parse::<u64>()
            .map_err(|err| Error::Bootstrap(format!("invalid member id in {:?}: {}", url, err)))?;
        if id == NONE_ID || addr.is_empty() {
            return Err(Error::Bootstrap(format!("invalid member url {:?}", url)));
        }
        Ok(RawMember {
            id,
            address: addr.to_string(),
            kind: MemberType::Voter,
        })
    }
}

/// The local node. It has no network pipeline and is always reachable.
pub(crate) struct LocalMember {
    raw: std::sync::Mutex<RawMember>,
    since: SystemTime,
}

/// Stub for a removed member; it accepts no sends.
pub(crate) struct RemovedMember {
    raw: RawMember,
}

/// A pool slot: the concrete peer produced by the factory for a member type.
pub(crate) enum Member {
    Local(LocalMember),
    Remote(RemoteMember),
    Removed(RemovedMember),
}

impl Member {
    pub(crate) fn local(raw: RawMember) -> Member {
        Member::Local(LocalMember {
            raw: std::sync::Mutex::new(raw),
            since: SystemTime::now(),
        })
    }

    pub(crate) fn removed(mut raw: RawMember) -> Member {
        raw.kind = MemberType::Removed;
        Member::Removed(RemovedMember { raw })
    }

    pub(crate) fn id(&self) -> u64 {
        match self {
            Member::Local(m) => m.raw.lock().unwrap().id,
            Member::Remote(m) => m.id(),
            Member::Removed(m) => m.raw.id,
        }
    }

    pub(crate) fn address(&self) -> String {
        match self {
            Member::Local(m) => m.raw.lock().unwrap().address.clone(),
            Member::Remote(m) => m.address(),
            Member::Removed(m) => m.raw.address.clone(),
        }
    }

    pub(crate) fn kind(&self) -> MemberType {
        match self {
            Member::Local(m) => m.raw.lock().unwrap().kind,
            Member::Remote(m) => m.kind(),
            Member::Removed(_) => MemberType::Removed,
        }
    }

    pub(crate) fn raw(&self) -> RawMember {
        match self {
            Member::Local(m) => m.raw.lock().unwrap().clone(),
            Member::Remote(m) => m.raw(),
            Member::Removed(m) => m.raw.clone(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        match self {
            Member::Local(_) => true,
            Member::Remote(m) => m.is_active(),
            Member::Removed(_) => false,
        }
    }

    /// Wall-clock time of the most recent inactive-to-active transition.
    pub(crate) fn active_since(&self) -> Option<SystemTime> {
        match self {
            Member::Local(m) => Some(m.since),
            Member::Remote(m) => m.active_since(),
            Member::Removed(_) => None,
        }
    }

    /// Queues `msg` on the member's outbound pipeline. Never blocks.
    pub(crate) fn send(&self, msg: Message) -> Result<()> {
        match self {
            Member::Local(m) => Err(Error::Transport(format!(
                "member {:x} is the local node",
                m.raw.lock().unwrap().id
            ))),
            Member::Remote(m) => m.send(msg),
            Member::Removed(m) => Err(Error::AlreadyRemoved(m.raw.id)),
        }
    }

    pub(crate) async fn update(&self, addr: String) -> Result<()> {
        match self {
            Member::Local(m) => {
                m.raw.lock().unwrap().address = addr;
                Ok(())
            }
            Member::Remote(m) => m.update(addr).await,
            Member::Removed(m) => Err(Error::AlreadyRemoved(m.raw.id)),
        }
    }

    /// Marks the underlying pipeline with a new role without recreating it.
    pub(crate) fn set_kind(&self, kind: MemberType) {
        match self {
            Member::Local(m) => m.raw.lock().unwrap().kind = kind,
            Member::Remote(m) => m.set_kind(kind),
            Member::Removed(_) => {}
        }
    }

    pub(crate) async fn close(&self) {
        if let Member::Remote(m) = self {
            m.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_url_round_trip() {
        let url = RawMember::url(12, "127.0.0.1:5052");
        let raw = RawMember::from_url(&url).unwrap();
        assert_eq!(raw.id, 12);
        assert_eq!(raw.address, "127.0.0.1:5052");
        assert_eq!(raw.kind, MemberType::Voter);
    }

    #[test]
    fn test_member_url_rejects_garbage() {
        assert!(RawMember::from_url("no-separator").is_err());
        assert!(RawMember::from_url("x=addr").is_err());
        assert!(RawMember::from_url("0=addr").is_err());
        assert!(RawMember::from_url("3=").is_err());
    }

    #[test]
    fn test_local_member_always_active() {
        let m = Member::local(RawMember {
            id: 1,
            address: ":5052".to_string(),
            kind: MemberType::Local,
        });
        assert!(m.is_active());
        assert!(m.active_since().is_some());
        assert!(m.kind().is_local());
    }

    #[test]
    fn test_removed_member_accepts_no_sends() {
        let m = Member::removed(RawMember {
            id: 9,
            address: ":5053".to_string(),
            kind: MemberType::Voter,
        });
        assert_eq!(m.kind(), MemberType::Removed);
        assert_eq!(m.send(Message::default()), Err(Error::AlreadyRemoved(9)));
        assert!(!m.is_active());
    }
}
