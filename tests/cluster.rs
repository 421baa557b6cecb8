//! End-to-end cluster scenarios over the in-process transport.

use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use replica::transport::memory::Router;
use replica::{Config, Fsm, MemberType, Node, RawMember, Result, StartOption};
use tempfile::TempDir;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(20);

/// State machine recording every applied record, snapshot-able as a
/// length-prefixed byte stream.
struct LogFsm {
    applied: Mutex<Vec<Vec<u8>>>,
}

impl LogFsm {
    fn new() -> Arc<LogFsm> {
        Arc::new(LogFsm {
            applied: Mutex::new(Vec::new()),
        })
    }

    fn entries(&self) -> Vec<Vec<u8>> {
        self.applied.lock().unwrap().clone()
    }
}

impl Fsm for LogFsm {
    fn apply(&self, data: &[u8]) {
        self.applied.lock().unwrap().push(data.to_vec());
    }

    fn snapshot(&self) -> Result<Box<dyn Read + Send>> {
        let mut buf = Vec::new();
        for entry in self.applied.lock().unwrap().iter() {
            buf.extend_from_slice(&(entry.len() as u64).to_le_bytes());
            buf.extend_from_slice(entry);
        }
        Ok(Box::new(Cursor::new(buf)))
    }

    fn restore(&self, mut data: Box<dyn Read + Send>) -> Result<()> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).map_err(replica::Error::from)?;

        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 8 <= buf.len() {
            let len = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap()) as usize;
            pos += 8;
            entries.push(buf[pos..pos + len].to_vec());
            pos += len;
        }
        *self.applied.lock().unwrap() = entries;
        Ok(())
    }
}

struct TestNode {
    node: Arc<Node>,
    fsm: Arc<LogFsm>,
    task: JoinHandle<Result<()>>,
}

fn test_config(dir: &Path) -> Config {
    Config::new()
        .with_state_dir(dir)
        .with_tick_interval(Duration::from_millis(10))
}

fn spawn_node(
    router: &Router,
    cfg: Config,
    addr: &str,
    opts: Vec<StartOption>,
) -> TestNode {
    let fsm = LogFsm::new();
    let node = Node::new(fsm.clone(), Arc::new(router.clone()), cfg).unwrap();
    router.register(addr, node.handler());

    let handle = node.clone();
    let task = tokio::spawn(async move { handle.start(opts).await });

    TestNode { node, fsm, task }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_leader(nodes: &[&TestNode]) -> usize {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        for (i, n) in nodes.iter().enumerate() {
            let whoami = n.node.whoami();
            if whoami != 0 && n.node.leader() == whoami {
                return i;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for a leader");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn snap_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.join("snap"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.ends_with(".snap"))
        .collect();
    names.sort();
    names
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_node_bootstrap_and_replicate() {
    let router = Router::new();
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

    let urls = [
        "1=mem://bootstrap/1",
        "2=mem://bootstrap/2",
        "3=mem://bootstrap/3",
    ];
    let nodes: Vec<TestNode> = (0..3)
        .map(|i| {
            // Each node lists itself first.
            let mut members: Vec<String> = vec![urls[i].to_string()];
            members.extend(
                (0..3)
                    .filter(|j| *j != i)
                    .map(|j| urls[j].to_string()),
            );
            spawn_node(
                &router,
                test_config(dirs[i].path()),
                urls[i].split_once('=').unwrap().1,
                vec![StartOption::InitCluster, StartOption::Members(members)],
            )
        })
        .collect();

    let refs: Vec<&TestNode> = nodes.iter().collect();
    let leader = wait_for_leader(&refs).await;

    for n in &nodes {
        wait_until("whoami to settle", || n.node.whoami() != 0).await;
    }

    nodes[leader].node.replicate(vec![0x01]).await.unwrap();

    for n in &nodes {
        wait_until("entry to replicate everywhere", || {
            n.fsm.entries() == vec![vec![0x01]]
        })
        .await;
    }

    // Exactly once on each state machine.
    for n in &nodes {
        assert_eq!(n.fsm.entries(), vec![vec![0x01]]);
        assert_ne!(n.node.whoami(), 0);
    }

    for n in &nodes {
        n.node.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_node_linearizable_read() {
    let router = Router::new();
    let dir = TempDir::new().unwrap();
    let node = spawn_node(
        &router,
        test_config(dir.path()),
        "mem://linread/1",
        vec![
            StartOption::InitCluster,
            StartOption::Members(vec!["1=mem://linread/1".to_string()]),
        ],
    );

    wait_for_leader(&[&node]).await;

    node.node.replicate(b"v".to_vec()).await.unwrap();
    node.node.linearizable_read().await.unwrap();
    assert_eq!(node.fsm.entries(), vec![b"v".to_vec()]);

    node.node.shutdown().await.unwrap();
    let res = node.task.await.unwrap();
    assert_eq!(res, Err(replica::Error::Stopped));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_step_down_hands_off_leadership() {
    let router = Router::new();
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let urls = ["1=mem://step/1", "2=mem://step/2", "3=mem://step/3"];

    let nodes: Vec<TestNode> = (0..3)
        .map(|i| {
            let mut members: Vec<String> = vec![urls[i].to_string()];
            members.extend((0..3).filter(|j| *j != i).map(|j| urls[j].to_string()));
            spawn_node(
                &router,
                test_config(dirs[i].path()),
                urls[i].split_once('=').unwrap().1,
                vec![StartOption::InitCluster, StartOption::Members(members)],
            )
        })
        .collect();

    let refs: Vec<&TestNode> = nodes.iter().collect();
    let leader = wait_for_leader(&refs).await;
    let leader_id = nodes[leader].node.whoami();

    // A proposal makes sure followers are marked active before stepping down.
    nodes[leader].node.replicate(vec![0xaa]).await.unwrap();

    tokio::time::timeout(WAIT, nodes[leader].node.step_down())
        .await
        .expect("step down timed out")
        .unwrap();

    wait_until("leadership to move", || {
        let new_leader = nodes[leader].node.leader();
        new_leader != 0 && new_leader != leader_id
    })
    .await;

    for n in &nodes {
        n.node.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_retention_and_restart() {
    let router = Router::new();
    let dir = TempDir::new().unwrap();
    let addr = "mem://snap/1";
    let cfg = || {
        test_config(dir.path())
            .with_snapshot_interval(8)
            .with_max_snapshot_files(1)
    };

    let node = spawn_node(
        &router,
        cfg(),
        addr,
        vec![
            StartOption::InitCluster,
            StartOption::Members(vec![format!("1={}", addr)]),
        ],
    );
    wait_for_leader(&[&node]).await;

    for i in 0..30u8 {
        node.node.replicate(vec![i]).await.unwrap();
    }
    let before = node.fsm.entries();
    assert_eq!(before.len(), 30);

    // Retention settles at the current snapshot plus one retained file.
    wait_until("snapshot retention to settle", || {
        snap_files(dir.path()).len() == 2
    })
    .await;

    node.node.shutdown().await.unwrap();
    let _ = node.task.await;
    router.deregister(addr);

    // A fresh instance restarts from WAL + newest snapshot.
    let restarted = spawn_node(&router, cfg(), addr, vec![StartOption::Restart]);
    wait_for_leader(&[&restarted]).await;

    wait_until("state machine to recover", || {
        restarted.fsm.entries() == before
    })
    .await;
    assert_eq!(restarted.node.whoami(), 1);

    restarted.node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupted_snapshot_falls_back_to_previous() {
    let router = Router::new();
    let dir = TempDir::new().unwrap();
    let addr = "mem://crc/1";

    let node = spawn_node(
        &router,
        test_config(dir.path()),
        addr,
        vec![
            StartOption::InitCluster,
            StartOption::Members(vec![format!("1={}", addr)]),
        ],
    );
    wait_for_leader(&[&node]).await;

    for i in 0..3u8 {
        node.node.replicate(vec![i]).await.unwrap();
    }
    node.node.create_snapshot().await.unwrap();

    for i in 3..5u8 {
        node.node.replicate(vec![i]).await.unwrap();
    }
    node.node.create_snapshot().await.unwrap();

    let before = node.fsm.entries();
    node.node.shutdown().await.unwrap();
    let _ = node.task.await;
    router.deregister(addr);

    // Flip one byte in the newest snapshot payload.
    let newest = snap_files(dir.path()).pop().unwrap();
    let path = dir.path().join("snap").join(newest);
    let mut bytes = fs::read(&path).unwrap();
    bytes[0] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    // Restart skips the corrupted file, loads the previous snapshot and
    // replays the log back to the full state.
    let restarted = spawn_node(
        &router,
        test_config(dir.path()),
        addr,
        vec![StartOption::Restart],
    );
    wait_for_leader(&[&restarted]).await;

    wait_until("state machine to recover past corruption", || {
        restarted.fsm.entries() == before
    })
    .await;

    restarted.node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_staging_member_auto_promotes() {
    let router = Router::new();
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

    // A bootstraps alone.
    let a = spawn_node(
        &router,
        test_config(dirs[0].path()),
        "mem://promo/a",
        vec![
            StartOption::InitCluster,
            StartOption::Members(vec!["1=mem://promo/a".to_string()]),
        ],
    );
    wait_for_leader(&[&a]).await;

    // B joins as a voter.
    let b = spawn_node(
        &router,
        test_config(dirs[1].path()),
        "mem://promo/b",
        vec![
            StartOption::Address("mem://promo/b".to_string()),
            StartOption::Join("mem://promo/a".to_string(), Duration::from_secs(10)),
        ],
    );
    wait_until("b to join", || {
        b.node.whoami() != 0 && a.node.is_member(b.node.whoami())
    })
    .await;

    // C is admitted as a staging member, then starts and catches up.
    let mut staged = RawMember {
        id: 3,
        address: "mem://promo/c".to_string(),
        kind: MemberType::Staging,
    };
    a.node.add_member(&mut staged).await.unwrap();

    let c = spawn_node(
        &router,
        test_config(dirs[2].path()),
        "mem://promo/c",
        vec![
            StartOption::Members(vec!["3=mem://promo/c".to_string()]),
            StartOption::Join("mem://promo/a".to_string(), Duration::from_secs(10)),
        ],
    );

    // Traffic for the staging member to chase.
    for i in 0..10u8 {
        a.node.replicate(vec![i]).await.unwrap();
    }

    // Eventually a voter conf change for C commits without any operator
    // intervention.
    wait_until("staging member to be promoted", || {
        a.node
            .get_member(3)
            .map(|m| m.kind == MemberType::Voter)
            .unwrap_or(false)
    })
    .await;

    wait_until("promoted member to apply traffic", || {
        c.fsm.entries().len() == 10
    })
    .await;

    for n in [&a, &b, &c] {
        n.node.shutdown().await.unwrap();
    }
}
