//! Outbound pipeline for a remote cluster member.
//!
//! Each remote member owns a bounded queue and a background task that streams
//! queued messages over the transport one at a time. The engine's send step
//! only ever enqueues; a full queue fails fast instead of blocking the event
//! loop.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use raft::eraftpb::{Message, MessageType};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::membership::member::{MemberType, RawMember};
use crate::membership::{Report, ReportSink};
use crate::metrics;
use crate::transport::{Dial, Transport};

/// Outbound queue depth per member.
const QUEUE_CAPACITY: usize = 4096;

struct State {
    active: bool,
    active_since: Option<SystemTime>,
    addr: String,
}

struct Inner {
    id: u64,
    kind: Mutex<MemberType>,
    stream_timeout: std::time::Duration,
    drain_timeout: std::time::Duration,
    dial: Arc<dyn Dial>,
    report: ReportSink,
    msgc: mpsc::Sender<Message>,
    cancel: watch::Sender<bool>,
    state: Mutex<State>,
    // Swapped atomically by update(); taken out before any send so the lock
    // is never held across network I/O.
    transport: Mutex<Arc<dyn Transport>>,
}

/// The remote active cluster member.
pub(crate) struct RemoteMember {
    inner: Arc<Inner>,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RemoteMember {
    /// Dials `raw.address` and spawns the member's stream loop.
    pub(crate) async fn connect(
        raw: RawMember,
        dial: Arc<dyn Dial>,
        report: ReportSink,
        stream_timeout: std::time::Duration,
        drain_timeout: std::time::Duration,
    ) -> Result<RemoteMember> {
        let tr = dial.dial(&raw.address).await?;
        let (msgc, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (cancel, cancelled) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        let inner = Arc::new(Inner {
            id: raw.id,
            kind: Mutex::new(raw.kind),
            stream_timeout,
            drain_timeout,
            dial,
            report,
            msgc,
            cancel,
            state: Mutex::new(State {
                active: false,
                active_since: None,
                addr: raw.address,
            }),
            transport: Mutex::new(tr),
        });

        tokio::spawn(Inner::run(Arc::clone(&inner), rx, cancelled, done_tx));

        Ok(RemoteMember {
            inner,
            done: Mutex::new(Some(done_rx)),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn kind(&self) -> MemberType {
        *self.inner.kind.lock().unwrap()
    }

    pub(crate) fn set_kind(&self, kind: MemberType) {
        *self.inner.kind.lock().unwrap() = kind;
    }

    pub(crate) fn address(&self) -> String {
        self.inner.state.lock().unwrap().addr.clone()
    }

    pub(crate) fn raw(&self) -> RawMember {
        RawMember {
            id: self.inner.id,
            address: self.address(),
            kind: self.kind(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.inner.state.lock().unwrap().active
    }

    pub(crate) fn active_since(&self) -> Option<SystemTime> {
        self.inner.state.lock().unwrap().active_since
    }

    /// Queues a message for delivery. Fails immediately when the member is
    /// shutting down or its queue is full; failures are reported to the
    /// consensus primitive.
    pub(crate) fn send(&self, msg: Message) -> Result<()> {
        let is_snap = msg.get_msg_type() == MessageType::MsgSnapshot;
        let res = match self.inner.msgc.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::Overloaded(self.inner.id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Stopped),
        };

        if res.is_err() {
            let member = format!("{:x}", self.inner.id);
            metrics::PEER_SEND_FAILURES_TOTAL
                .with_label_values(&[member.as_str()])
                .inc();
            self.inner.report(is_snap, true);
        }
        res
    }

    /// Replaces the member address, dialing the new endpoint first so no
    /// in-flight message observes a half-swapped transport.
    pub(crate) async fn update(&self, addr: String) -> Result<()> {
        if self.inner.state.lock().unwrap().addr == addr {
            return Ok(());
        }

        let tr = self.inner.dial.dial(&addr).await?;
        let old = {
            let mut guard = self.inner.transport.lock().unwrap();
            std::mem::replace(&mut *guard, tr)
        };
        self.inner.state.lock().unwrap().addr = addr;
        old.close().await;
        Ok(())
    }

    /// Cancels the stream loop and waits for the drain to finish.
    pub(crate) async fn close(&self) {
        let _ = self.inner.cancel.send(true);
        let done = self.done.lock().unwrap().take();
        if let Some(done) = done {
            let _ = done.await;
        }
        self.inner.transport().close().await;
    }
}

impl Inner {
    fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport.lock().unwrap())
    }

    fn set_status(&self, active: bool) {
        let mut state = self.state.lock().unwrap();
        match (state.active, active) {
            (false, true) => {
                state.active = true;
                state.active_since = Some(SystemTime::now());
            }
            (true, false) => {
                state.active = false;
                state.active_since = None;
            }
            _ => {}
        }
    }

    fn report(&self, is_snap: bool, failed: bool) {
        let report = match (failed, is_snap) {
            (false, true) => Report::SnapshotFinish(self.id),
            (true, true) => Report::SnapshotFailure(self.id),
            (true, false) => Report::Unreachable(self.id),
            (false, false) => return,
        };
        let _ = self.report.send(report);
    }

    async fn stream(&self, msg: Message) -> Result<()> {
        let is_snap = msg.get_msg_type() == MessageType::MsgSnapshot;
        let tr = self.transport();
        let res = match timeout(self.stream_timeout, tr.round_trip(msg)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Transport(format!(
                "stream to member {:x} timed out",
                self.id
            ))),
        };
        self.report(is_snap, res.is_err());
        res
    }

    async fn run(
        inner: Arc<Inner>,
        mut rx: mpsc::Receiver<Message>,
        mut cancelled: watch::Receiver<bool>,
        done: oneshot::Sender<()>,
    ) {
        loop {
            tokio::select! {
                _ = cancelled.changed() => break,
                maybe = rx.recv() => match maybe {
                    Some(msg) => {
                        let ok = inner.stream(msg).await.is_ok();
                        inner.set_status(ok);
                    }
                    None => break,
                },
            }
        }

        inner.set_status(false);
        rx.close();

        // Flush whatever is still buffered, bounded by the drain deadline.
        let drain = async {
            while let Some(msg) = rx.recv().await {
                if inner.stream(msg).await.is_err() {
                    break;
                }
            }
        };
        if timeout(inner.drain_timeout, drain).await.is_err() {
            log::warn!(
                "raft.membership: member {:x} drain timed out, dropping buffered messages",
                inner.id
            );
        }

        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::JoinResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct BlockingTransport {
        sent: AtomicUsize,
        gate: Notify,
    }

    #[async_trait]
    impl Transport for BlockingTransport {
        async fn round_trip(&self, _msg: Message) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(())
        }

        async fn join(&self, _m: RawMember) -> Result<JoinResponse> {
            unimplemented!()
        }

        async fn promote(&self, _m: RawMember) -> Result<()> {
            unimplemented!()
        }

        async fn pull_snapshot(&self, _term: u64, _index: u64) -> Result<Vec<u8>> {
            unimplemented!()
        }
    }

    struct BlockingDial(Arc<BlockingTransport>);

    #[async_trait]
    impl Dial for BlockingDial {
        async fn dial(&self, _addr: &str) -> Result<Arc<dyn Transport>> {
            Ok(self.0.clone())
        }
    }

    fn member_url() -> RawMember {
        RawMember {
            id: 2,
            address: "mem://2".to_string(),
            kind: MemberType::Voter,
        }
    }

    #[tokio::test]
    async fn test_overloaded_queue_fails_fast() {
        let tr = Arc::new(BlockingTransport {
            sent: AtomicUsize::new(0),
            gate: Notify::new(),
        });
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let member = RemoteMember::connect(
            member_url(),
            Arc::new(BlockingDial(tr.clone())),
            report_tx,
            Duration::from_secs(10),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        // The stream loop parks inside the first round trip, so the queue
        // must eventually overflow.
        let mut attempts = 0;
        let err = loop {
            match member.send(Message::default()) {
                Ok(()) => {
                    attempts += 1;
                    assert!(attempts <= QUEUE_CAPACITY + 2, "queue never overflowed");
                    tokio::task::yield_now().await;
                }
                Err(err) => break err,
            }
        };
        assert_eq!(err, Error::Overloaded(2));
        assert!(tr.sent.load(Ordering::SeqCst) >= 1);
        assert!(matches!(report_rx.recv().await, Some(Report::Unreachable(2))));
    }

    #[tokio::test]
    async fn test_status_flips_on_failure() {
        struct FlakyTransport(AtomicUsize);

        #[async_trait]
        impl Transport for FlakyTransport {
            async fn round_trip(&self, _msg: Message) -> Result<()> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(())
                } else {
                    Err(Error::Transport("connection reset".to_string()))
                }
            }

            async fn join(&self, _m: RawMember) -> Result<JoinResponse> {
                unimplemented!()
            }

            async fn promote(&self, _m: RawMember) -> Result<()> {
                unimplemented!()
            }

            async fn pull_snapshot(&self, _term: u64, _index: u64) -> Result<Vec<u8>> {
                unimplemented!()
            }
        }

        struct FlakyDial;

        #[async_trait]
        impl Dial for FlakyDial {
            async fn dial(&self, _addr: &str) -> Result<Arc<dyn Transport>> {
                Ok(Arc::new(FlakyTransport(AtomicUsize::new(0))))
            }
        }

        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let member = RemoteMember::connect(
            member_url(),
            Arc::new(FlakyDial),
            report_tx,
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        member.send(Message::default()).unwrap();
        while !member.is_active() {
            tokio::task::yield_now().await;
        }
        assert!(member.active_since().is_some());

        member.send(Message::default()).unwrap();
        assert!(matches!(report_rx.recv().await, Some(Report::Unreachable(2))));
        while member.is_active() {
            tokio::task::yield_now().await;
        }
        assert!(member.active_since().is_none());

        member.close().await;
    }
}
