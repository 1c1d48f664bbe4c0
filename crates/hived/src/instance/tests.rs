use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use hive_core::ControlChannel;
use hive_proto::drpc::{
    BioHealthResp, DaosResp, DrpcMethod, NotifyReadyReq, Response, SetRankReq,
};
use hive_proto::{
    CtlError, CtlResult, FaultDomain, MemberState, Rank, SystemJoinRequest, SystemJoinResponse,
};

use super::*;
use crate::events::{EventPublisher, InstanceEvent};
use crate::membership::MembershipClient;
use crate::runner::{EngineConfig, EngineRunner, RunnerExit};
use crate::storage::StorageProvider;
use crate::superblock::{Superblock, SuperblockStore};

const SCM_MOUNT: &str = "/mnt/hive0";
const HOST_FD: &str = "/rack0/host0";

// ─── Fakes ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeRunnerInner {
    running: AtomicBool,
    starts: AtomicUsize,
    exit_tx: StdMutex<Option<oneshot::Sender<RunnerExit>>>,
    /// How long a cancelled engine takes to die, in milliseconds.
    kill_delay_ms: AtomicU64,
}

impl FakeRunnerInner {
    fn exit(&self, error: Option<&str>) {
        let tx = self.exit_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            self.running.store(false, Ordering::SeqCst);
            let _ = tx.send(RunnerExit {
                pid: Some(4242),
                error: error.map(String::from),
            });
        }
    }
}

#[derive(Clone, Default)]
struct FakeRunner(Arc<FakeRunnerInner>);

impl FakeRunner {
    fn set_running(&self, running: bool) {
        self.0.running.store(running, Ordering::SeqCst);
    }

    fn starts(&self) -> usize {
        self.0.starts.load(Ordering::SeqCst)
    }

    fn crash(&self, error: &str) {
        self.0.exit(Some(error));
    }

    fn slow_kill(&self, delay: Duration) {
        self.0
            .kill_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineRunner for FakeRunner {
    fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }

    async fn start(
        &self,
        _cfg: &EngineConfig,
        token: CancellationToken,
    ) -> CtlResult<oneshot::Receiver<RunnerExit>> {
        let (tx, rx) = oneshot::channel();
        *self.0.exit_tx.lock().unwrap() = Some(tx);
        self.0.running.store(true, Ordering::SeqCst);
        self.0.starts.fetch_add(1, Ordering::SeqCst);

        let inner = self.0.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let delay = inner.kill_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            inner.exit(Some("killed"));
        });
        Ok(rx)
    }
}

/// Records every dRPC call and answers with configurable engine statuses.
#[derive(Default)]
struct FakeEngine {
    calls: StdMutex<Vec<(DrpcMethod, Vec<u8>)>>,
    set_rank_status: AtomicI32,
    set_up_status: AtomicI32,
    unreachable: AtomicBool,
    /// Answer SetRank and SetUp with bytes that do not decode.
    garbled: AtomicBool,
    /// Never answer.
    hung: AtomicBool,
}

impl FakeEngine {
    fn count(&self, method: DrpcMethod) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| *m == method)
            .count()
    }

    fn total(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn set_rank_requests(&self) -> Vec<SetRankReq> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| *m == DrpcMethod::SetRank)
            .map(|(_, body)| SetRankReq::decode(body.as_slice()).unwrap())
            .collect()
    }
}

struct FakeChannel {
    engine: Arc<FakeEngine>,
    path: PathBuf,
}

#[async_trait]
impl ControlChannel for FakeChannel {
    fn socket_path(&self) -> &Path {
        &self.path
    }

    async fn call(&self, method: DrpcMethod, body: Vec<u8>) -> CtlResult<Response> {
        if self.engine.unreachable.load(Ordering::SeqCst) {
            return Err(CtlError::Network("connection refused".to_string()));
        }
        self.engine.calls.lock().unwrap().push((method, body));
        if self.engine.hung.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.engine.garbled.load(Ordering::SeqCst) {
            return Ok(Response::success(1, vec![0xff, 0xff, 0xff]));
        }
        let reply = match method {
            DrpcMethod::SetRank => DaosResp {
                status: self.engine.set_rank_status.load(Ordering::SeqCst),
            }
            .encode_to_vec(),
            DrpcMethod::SetUp => DaosResp {
                status: self.engine.set_up_status.load(Ordering::SeqCst),
            }
            .encode_to_vec(),
            DrpcMethod::BioHealthQuery => BioHealthResp {
                dev_uuid: "dev-1".to_string(),
                temperature: 310,
                ..Default::default()
            }
            .encode_to_vec(),
            _ => Vec::new(),
        };
        Ok(Response::success(1, reply))
    }
}

/// Scripted membership authority.
#[derive(Default)]
struct FakeMembership {
    script: StdMutex<VecDeque<CtlResult<SystemJoinResponse>>>,
    fallback: StdMutex<Option<SystemJoinResponse>>,
    requests: StdMutex<Vec<SystemJoinRequest>>,
    /// Hold every join until `release()`.
    blocked: AtomicBool,
    gate: Notify,
}

impl FakeMembership {
    fn always(&self, resp: SystemJoinResponse) {
        *self.fallback.lock().unwrap() = Some(resp);
    }

    fn push(&self, resp: CtlResult<SystemJoinResponse>) {
        self.script.lock().unwrap().push_back(resp);
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.blocked.store(false, Ordering::SeqCst);
        self.gate.notify_one();
    }

    fn last_request(&self) -> Option<SystemJoinRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MembershipClient for FakeMembership {
    async fn join(&self, req: SystemJoinRequest) -> CtlResult<SystemJoinResponse> {
        self.requests.lock().unwrap().push(req);
        while self.blocked.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if let Some(resp) = self.script.lock().unwrap().pop_front() {
            return resp;
        }
        self.fallback
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CtlError::Network("no authority".to_string()))
    }
}

/// In-memory superblock store that counts writes.
#[derive(Default)]
struct MemStore {
    blocks: StdMutex<HashMap<PathBuf, Superblock>>,
    saves: AtomicUsize,
    fail: AtomicBool,
}

impl MemStore {
    fn put(&self, sb: Superblock) {
        let path = Path::new(SCM_MOUNT).join(hive_proto::defaults::SUPERBLOCK_NAME);
        self.blocks.lock().unwrap().insert(path, sb);
    }

    fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SuperblockStore for MemStore {
    async fn load(&self, path: &Path) -> CtlResult<Option<Superblock>> {
        Ok(self.blocks.lock().unwrap().get(path).cloned())
    }

    async fn save(&self, sb: &Superblock, path: &Path) -> CtlResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CtlError::Superblock("device full".to_string()));
        }
        self.blocks
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), sb.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ─── Fixture ────────────────────────────────────────────────────────────────

struct Fixture {
    runner: FakeRunner,
    engine: Arc<FakeEngine>,
    membership: Arc<FakeMembership>,
    store: Arc<MemStore>,
    events: EventPublisher,
    socket_dir: PathBuf,
    host_fd: Option<FaultDomain>,
}

impl Fixture {
    fn new(name: &str) -> Self {
        Self {
            runner: FakeRunner::default(),
            engine: Arc::new(FakeEngine::default()),
            membership: Arc::new(FakeMembership::default()),
            store: Arc::new(MemStore::default()),
            events: EventPublisher::default(),
            socket_dir: std::env::temp_dir()
                .join(format!("hive_inst_{}_{}", name, std::process::id())),
            host_fd: Some(HOST_FD.parse().unwrap()),
        }
    }

    fn build(&self) -> EngineInstance {
        self.build_with(|inst| inst)
    }

    fn build_with(&self, f: impl FnOnce(EngineInstance) -> EngineInstance) -> EngineInstance {
        let cfg = EngineConfig {
            scm_mount: PathBuf::from(SCM_MOUNT),
            socket_dir: self.socket_dir.clone(),
            ..Default::default()
        };
        let storage = StorageProvider::with_store(SCM_MOUNT, self.store.clone());
        let engine = self.engine.clone();
        let mut inst = EngineInstance::new(
            cfg,
            storage,
            self.membership.clone(),
            Arc::new(self.runner.clone()),
            self.events.clone(),
        )
        .with_drpc_client_fn(Arc::new(move |path: &Path| -> Arc<dyn ControlChannel> {
            Arc::new(FakeChannel {
                engine: engine.clone(),
                path: path.to_path_buf(),
            })
        }));
        if let Some(fd) = &self.host_fd {
            inst = inst.with_host_fault_domain(fd.clone());
        }
        f(inst)
    }

    /// Instance with `sb` loaded and a running engine.
    async fn started(&self, sb: Superblock) -> EngineInstance {
        self.store.put(sb);
        let inst = self.build();
        inst.read_superblock().await.unwrap();
        self.runner.set_running(true);
        inst
    }
}

fn fresh_superblock() -> Superblock {
    let mut sb = Superblock::new("hive");
    sb.host_fault_domain = HOST_FD.to_string();
    sb
}

fn ranked_superblock(rank: u32, uri: &str) -> Superblock {
    let mut sb = fresh_superblock();
    sb.rank = Some(Rank::new(rank));
    sb.valid_rank = true;
    sb.uri = uri.to_string();
    sb
}

fn join_resp(rank: u32, state: MemberState, map_version: u32) -> SystemJoinResponse {
    SystemJoinResponse {
        rank: Rank::new(rank),
        state,
        map_version,
        local_join: false,
        pool_uuids: Vec::new(),
    }
}

fn ready_req(uri: &str, check_mode: bool) -> NotifyReadyReq {
    NotifyReadyReq {
        uri: uri.to_string(),
        nctxs: 4,
        incarnation: 1,
        check_mode,
        ..Default::default()
    }
}

async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..300 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ─── State derivation and accessors ─────────────────────────────────────────

#[tokio::test]
async fn test_local_state_priority() {
    let fx = Fixture::new("state");
    let inst = fx.build();
    assert_eq!(inst.local_state(), MemberState::Stopped);

    inst.set_awaiting_format(true).await;
    assert_eq!(inst.local_state(), MemberState::AwaitFormat);

    fx.runner.set_running(true);
    assert_eq!(inst.local_state(), MemberState::Starting);

    inst.set_ready(true).await;
    assert_eq!(inst.local_state(), MemberState::Ready);

    // Ready is only reported while the process runs.
    fx.runner.set_running(false);
    assert!(!inst.is_ready());
    assert_eq!(inst.local_state(), MemberState::AwaitFormat);

    inst.set_awaiting_format(false).await;
    assert_eq!(inst.local_state(), MemberState::Stopped);
}

#[tokio::test]
async fn test_get_rank() {
    let fx = Fixture::new("get_rank");
    let inst = fx.build();
    assert!(matches!(inst.get_rank().await, Err(CtlError::NoSuperblock)));

    fx.store.put(fresh_superblock());
    inst.read_superblock().await.unwrap();
    assert!(matches!(inst.get_rank().await, Err(CtlError::NoRank)));

    // A rank without the validity flag is not usable.
    let mut sb = fresh_superblock();
    sb.rank = Some(Rank::new(3));
    fx.store.put(sb);
    inst.read_superblock().await.unwrap();
    assert!(matches!(inst.get_rank().await, Err(CtlError::NoRank)));

    fx.store.put(ranked_superblock(3, "x://1"));
    inst.read_superblock().await.unwrap();
    assert_eq!(inst.get_rank().await.unwrap(), Rank::new(3));
}

#[tokio::test]
async fn test_config_accessors() {
    let fx = Fixture::new("config");
    let inst = fx.build();

    inst.set_index(2).await.unwrap();
    assert_eq!(inst.index(), 2);
    assert_eq!(inst.config().await.index, 2);
    assert!(inst.set_index(3).await.is_err());
    assert_eq!(inst.index(), 2);

    inst.set_target_count(16).await;
    inst.set_mem_size(4096).await;
    inst.set_hugepage_size(1024).await;
    inst.set_checker_mode(true).await;
    assert_eq!(inst.get_target_count().await, 16);

    let cfg = inst.config().await;
    assert_eq!(cfg.mem_size_mb, 4096);
    assert_eq!(cfg.hugepage_size_mb, 1024);
    assert!(cfg.checker_enabled);

    let fd: FaultDomain = "/rack9/host1".parse().unwrap();
    inst.set_host_fault_domain(fd.clone()).await;
    assert_eq!(inst.host_fault_domain().await, Some(fd));
}

#[tokio::test]
async fn test_health_stats_cache() {
    let fx = Fixture::new("health");
    let inst = fx.build();
    assert!(inst.get_last_health_stats("0000:81:00.0").await.is_none());

    let first = BioHealthResp {
        temperature: 300,
        ..Default::default()
    };
    let second = BioHealthResp {
        temperature: 320,
        ..Default::default()
    };
    inst.set_last_health_stats("0000:81:00.0", first).await;
    inst.set_last_health_stats("0000:81:00.0", second.clone()).await;

    assert_eq!(
        inst.get_last_health_stats("0000:81:00.0").await,
        Some(second)
    );
    assert!(inst.get_last_health_stats("0000:82:00.0").await.is_none());
}

#[tokio::test]
async fn test_bio_health_query_caches_result() {
    let fx = Fixture::new("bio_health");
    let inst = fx.started(fresh_superblock()).await;

    let resp = inst.bio_health_query("dev-1").await.unwrap();
    assert_eq!(resp.temperature, 310);
    assert_eq!(inst.get_last_health_stats("dev-1").await, Some(resp));
    assert_eq!(fx.engine.count(DrpcMethod::BioHealthQuery), 1);
}

#[tokio::test]
async fn test_create_superblock() {
    let fx = Fixture::new("create_sb");
    let inst = fx.build();

    let sb = inst.create_superblock("hive").await.unwrap();
    assert_eq!(sb.system, "hive");
    assert_eq!(sb.host_fault_domain, HOST_FD);
    assert!(sb.rank.is_none());
    assert_eq!(inst.superblock().await, Some(sb));
    assert_eq!(fx.store.saves(), 1);

    let err = inst.create_superblock("hive").await.unwrap_err();
    assert!(matches!(err, CtlError::Superblock(_)));
    assert_eq!(fx.store.saves(), 1);
}

// ─── Join protocol ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_join_brings_engine_up() {
    let fx = Fixture::new("first_join");
    let sb = fresh_superblock();
    let uuid = sb.uuid;
    let inst = fx.started(sb).await;
    let mut events = fx.events.subscribe();
    fx.membership.always(join_resp(7, MemberState::Joined, 3));

    inst.handle_ready(&ready_req("x://1", false)).await.unwrap();

    let req = fx.membership.last_request().unwrap();
    assert_eq!(req.uuid, uuid);
    assert!(req.rank.is_nil());
    assert_eq!(req.uri, "x://1");
    assert_eq!(req.incarnation, 1);
    assert_eq!(req.fault_domain, Some(HOST_FD.parse::<FaultDomain>().unwrap()));

    let sb = inst.superblock().await.unwrap();
    assert_eq!(sb.uuid, uuid);
    assert_eq!(sb.rank, Some(Rank::new(7)));
    assert!(sb.valid_rank);
    assert_eq!(sb.uri, "x://1");
    assert_eq!(fx.store.saves(), 1);

    let set_rank = fx.engine.set_rank_requests();
    assert_eq!(set_rank.len(), 1);
    assert_eq!(set_rank[0].rank, 7);
    assert_eq!(set_rank[0].map_version, 3);
    assert!(set_rank[0].pool_uuids.is_empty());
    assert_eq!(fx.engine.count(DrpcMethod::SetUp), 1);

    assert!(inst.is_ready());
    assert_eq!(inst.local_state(), MemberState::Ready);
    assert_eq!(
        events.recv().await.unwrap(),
        InstanceEvent::RankReady {
            index: 0,
            rank: Rank::new(7),
            uri: "x://1".to_string(),
        }
    );
}

#[tokio::test]
async fn test_repeated_ready_revalidates_only() {
    let fx = Fixture::new("repeat_ready");
    let inst = fx.started(fresh_superblock()).await;
    fx.membership.always(join_resp(7, MemberState::Joined, 3));

    inst.handle_ready(&ready_req("x://1", false)).await.unwrap();
    assert!(inst.is_ready());
    let saves = fx.store.saves();
    let calls = fx.engine.total();

    inst.handle_ready(&ready_req("x://1", false)).await.unwrap();

    assert_eq!(fx.membership.calls(), 2);
    assert_eq!(fx.membership.last_request().unwrap().rank, Rank::new(7));
    assert_eq!(fx.store.saves(), saves);
    assert_eq!(fx.engine.total(), calls);
    assert!(inst.is_ready());
}

#[tokio::test]
async fn test_setup_rank_idempotent() {
    let fx = Fixture::new("setup_idem");
    let inst = fx.started(ranked_superblock(5, "x://1")).await;

    inst.setup_rank(Rank::new(5), 1, &[]).await.unwrap();
    assert_eq!(fx.engine.total(), 2);

    inst.setup_rank(Rank::new(5), 1, &[]).await.unwrap();
    assert_eq!(fx.engine.total(), 2);
}

#[tokio::test]
async fn test_excluded_rank_stops_bring_up() {
    let fx = Fixture::new("excluded");
    let sb = fresh_superblock();
    let inst = fx.started(sb.clone()).await;
    fx.membership.always(join_resp(3, MemberState::Excluded, 1));

    let err = inst
        .handle_ready(&ready_req("x://1", false))
        .await
        .unwrap_err();
    assert!(matches!(err, CtlError::RankExcluded(r) if r == Rank::new(3)));

    assert!(!inst.is_ready());
    assert_eq!(fx.store.saves(), 0);
    assert_eq!(inst.superblock().await, Some(sb));
    assert_eq!(fx.engine.total(), 0);
}

#[tokio::test]
async fn test_admin_excluded_rank_stops_bring_up() {
    let fx = Fixture::new("admin_excluded");
    let inst = fx.started(ranked_superblock(3, "x://1")).await;
    fx.membership.always(join_resp(3, MemberState::AdminExcluded, 1));

    let err = inst
        .handle_ready(&ready_req("x://1", false))
        .await
        .unwrap_err();
    assert!(matches!(err, CtlError::RankExcluded(_)));
    assert_eq!(fx.engine.total(), 0);
}

#[tokio::test]
async fn test_checker_mismatch_requests_restart() {
    let fx = Fixture::new("checker");
    let inst = fx.started(ranked_superblock(2, "x://1")).await;
    fx.membership.always(join_resp(2, MemberState::CheckerStarted, 1));

    let err = inst
        .handle_ready(&ready_req("x://1", false))
        .await
        .unwrap_err();
    assert!(matches!(err, CtlError::CheckerRestart(r) if r == Rank::new(2)));
    assert_eq!(fx.engine.total(), 0);
    assert!(!inst.is_ready());
    assert!(inst.config().await.checker_enabled);

    let mut start_rx = inst.start_rx.lock().await;
    let first = tokio::time::timeout(Duration::from_secs(2), start_rx.recv()).await;
    assert_eq!(first.unwrap(), Some(()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(start_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_checker_mode_engine_proceeds() {
    let fx = Fixture::new("checker_ok");
    let inst = fx.started(ranked_superblock(2, "x://1")).await;
    fx.membership.always(join_resp(2, MemberState::CheckerStarted, 1));

    inst.handle_ready(&ready_req("x://1", true)).await.unwrap();
    assert!(fx.membership.last_request().unwrap().check_mode);
    assert!(inst.is_ready());
}

#[tokio::test]
async fn test_uri_change_rewrites_superblock() {
    let fx = Fixture::new("uri_change");
    let sb = ranked_superblock(7, "x://1");
    let uuid = sb.uuid;
    let inst = fx.started(sb).await;
    fx.membership.always(join_resp(7, MemberState::Joined, 4));

    inst.handle_ready(&ready_req("x://2", false)).await.unwrap();

    let sb = inst.superblock().await.unwrap();
    assert_eq!(sb.uuid, uuid);
    assert_eq!(sb.uri, "x://2");
    assert_eq!(sb.rank, Some(Rank::new(7)));
    assert_eq!(fx.store.saves(), 1);
}

#[tokio::test]
async fn test_unchanged_identity_skips_write() {
    let fx = Fixture::new("no_write");
    let inst = fx.started(ranked_superblock(7, "x://1")).await;
    fx.membership.always(join_resp(7, MemberState::Joined, 4));

    inst.handle_ready(&ready_req("x://1", false)).await.unwrap();
    assert_eq!(fx.store.saves(), 0);
    assert!(inst.is_ready());
}

#[tokio::test]
async fn test_persist_failure_aborts_join() {
    let fx = Fixture::new("persist_fail");
    let inst = fx.started(fresh_superblock()).await;
    fx.store.fail.store(true, Ordering::SeqCst);
    fx.membership.always(join_resp(7, MemberState::Joined, 3));

    let err = inst
        .handle_ready(&ready_req("x://1", false))
        .await
        .unwrap_err();
    assert!(matches!(err, CtlError::Superblock(_)));
    assert_eq!(fx.engine.total(), 0);
    assert!(!inst.is_ready());
    assert!(inst.superblock().await.unwrap().rank.is_none());
}

#[tokio::test]
async fn test_join_failure_is_wrapped() {
    let fx = Fixture::new("join_fail");
    let inst = fx.started(fresh_superblock()).await;
    fx.membership
        .push(Err(CtlError::Network("connection refused".to_string())));

    let err = inst
        .handle_ready(&ready_req("x://1", false))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("join failed"));
    assert!(matches!(err.root_cause(), CtlError::Network(_)));
    assert_eq!(fx.engine.total(), 0);

    // The next notification retries the join.
    fx.membership.always(join_resp(7, MemberState::Joined, 3));
    inst.handle_ready(&ready_req("x://1", false)).await.unwrap();
    assert!(inst.is_ready());
}

#[tokio::test]
async fn test_join_without_superblock_fails() {
    let fx = Fixture::new("no_sb");
    let inst = fx.build();
    fx.runner.set_running(true);
    fx.membership.always(join_resp(7, MemberState::Joined, 3));

    let err = inst
        .handle_ready(&ready_req("x://1", false))
        .await
        .unwrap_err();
    assert!(matches!(err, CtlError::NoSuperblock));
    assert_eq!(fx.membership.calls(), 0);
}

#[tokio::test]
async fn test_local_join_skips_bring_up() {
    let fx = Fixture::new("local_join");
    let inst = fx.started(fresh_superblock()).await;
    let mut resp = join_resp(0, MemberState::Joined, 1);
    resp.local_join = true;
    fx.membership.always(resp);

    inst.handle_ready(&ready_req("x://1", false)).await.unwrap();
    assert_eq!(fx.engine.total(), 0);
    assert_eq!(fx.store.saves(), 0);
}

#[tokio::test]
async fn test_set_rank_status_failure() {
    let fx = Fixture::new("set_rank_fail");
    let inst = fx.started(ranked_superblock(7, "x://1")).await;
    fx.engine.set_rank_status.store(-1003, Ordering::SeqCst);
    fx.membership.always(join_resp(7, MemberState::Joined, 3));

    let err = inst
        .handle_ready(&ready_req("x://1", false))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("SetRank failed"));
    assert!(matches!(
        err.root_cause(),
        CtlError::Status {
            op: "SetRank",
            status: -1003
        }
    ));
    assert_eq!(fx.engine.count(DrpcMethod::SetUp), 0);
    assert!(!inst.is_ready());
}

#[tokio::test]
async fn test_set_rank_malformed_reply() {
    let fx = Fixture::new("set_rank_garbled");
    let inst = fx.started(ranked_superblock(7, "x://1")).await;
    fx.engine.garbled.store(true, Ordering::SeqCst);
    fx.membership.always(join_resp(7, MemberState::Joined, 3));

    let err = inst
        .handle_ready(&ready_req("x://1", false))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("SetRank failed"));
    assert!(matches!(err.root_cause(), CtlError::Decode { .. }));
    assert_eq!(fx.engine.count(DrpcMethod::SetUp), 0);
    assert!(!inst.is_ready());
}

#[tokio::test]
async fn test_set_up_status_failure() {
    let fx = Fixture::new("set_up_fail");
    let inst = fx.started(ranked_superblock(7, "x://1")).await;
    fx.engine.set_up_status.store(-1, Ordering::SeqCst);

    let err = inst.setup_rank(Rank::new(7), 3, &[]).await.unwrap_err();
    assert!(err.to_string().starts_with("SetUp failed"));
    assert!(!inst.is_ready());
}

#[tokio::test]
async fn test_set_rank_transport_error_unwrapped() {
    let fx = Fixture::new("set_rank_transport");
    let inst = fx.started(ranked_superblock(7, "x://1")).await;
    fx.engine.unreachable.store(true, Ordering::SeqCst);

    let err = inst.setup_rank(Rank::new(7), 3, &[]).await.unwrap_err();
    assert!(matches!(err, CtlError::Network(_)));
    assert!(!inst.is_ready());
}

#[tokio::test]
async fn test_stop_abandons_in_flight_set_rank() {
    let fx = Fixture::new("drpc_cancel");
    let inst = Arc::new(fx.started(ranked_superblock(7, "x://1")).await);
    inst.state.write().await.cancel = Some(CancellationToken::new());
    fx.engine.hung.store(true, Ordering::SeqCst);

    let task = {
        let inst = inst.clone();
        tokio::spawn(async move { inst.setup_rank(Rank::new(7), 3, &[]).await })
    };
    eventually("SetRank sent", || fx.engine.count(DrpcMethod::SetRank) == 1).await;
    inst.stop().await;

    let res = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("setup_rank did not return after stop")
        .unwrap();
    assert!(matches!(res, Err(CtlError::Canceled)));
    assert_eq!(fx.engine.count(DrpcMethod::SetUp), 0);
    assert!(!inst.is_ready());
}

#[tokio::test]
async fn test_queries_answer_during_slow_join() {
    let fx = Fixture::new("slow_join");
    let inst = Arc::new(fx.started(fresh_superblock()).await);
    inst.set_target_count(8).await;
    fx.membership.always(join_resp(7, MemberState::Joined, 3));
    fx.membership.block();

    let task = {
        let inst = inst.clone();
        let req = ready_req("x://1", false);
        tokio::spawn(async move { inst.handle_ready(&req).await })
    };
    eventually("join sent", || fx.membership.calls() == 1).await;

    let queries = async {
        assert_eq!(inst.get_target_count().await, 8);
        assert!(matches!(inst.get_rank().await, Err(CtlError::NoRank)));
        assert!(inst.superblock().await.is_some());
        assert!(inst.get_last_health_stats("dev-1").await.is_none());
        assert!(inst.last_error().await.is_none());
        assert_eq!(inst.local_state(), MemberState::Starting);
    };
    tokio::time::timeout(Duration::from_secs(1), queries)
        .await
        .expect("queries blocked behind the join");

    fx.membership.release();
    task.await.unwrap().unwrap();
    assert!(inst.is_ready());
    assert_eq!(inst.get_rank().await.unwrap(), Rank::new(7));
}

#[tokio::test]
async fn test_fault_domain_refresh() {
    let fx = Fixture::new("fd_refresh");
    let inst = fx.started(ranked_superblock(7, "x://1")).await;
    inst.set_host_fault_domain("/rack1/host0".parse().unwrap())
        .await;
    fx.membership.always(join_resp(7, MemberState::Joined, 3));

    inst.handle_ready(&ready_req("x://1", false)).await.unwrap();
    assert_eq!(
        inst.superblock().await.unwrap().host_fault_domain,
        "/rack1/host0"
    );
    assert_eq!(fx.store.saves(), 1);
}

#[tokio::test]
async fn test_fault_domain_failure_is_not_fatal() {
    let mut fx = Fixture::new("fd_nonfatal");
    fx.host_fd = None;
    let inst = fx.started(fresh_superblock()).await;
    fx.membership.always(join_resp(7, MemberState::Joined, 3));

    inst.handle_ready(&ready_req("x://1", false)).await.unwrap();
    assert!(inst.is_ready());
}

// ─── Run loop ───────────────────────────────────────────────────────────────

fn spawn_run(
    inst: &Arc<EngineInstance>,
    token: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let inst = inst.clone();
    let token = token.clone();
    tokio::spawn(async move { inst.run(token).await })
}

#[tokio::test]
async fn test_run_awaits_format_then_joins() {
    let fx = Fixture::new("run_format");
    let formats = Arc::new(AtomicUsize::new(0));
    let readies = Arc::new(AtomicUsize::new(0));
    let (f, r) = (formats.clone(), readies.clone());
    let inst = Arc::new(fx.build_with(move |mut inst| {
        inst.on_await_format([await_format_fn(move |idx, mount| {
            let f = f.clone();
            async move {
                assert_eq!(idx, 0);
                assert_eq!(mount, PathBuf::from(SCM_MOUNT));
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })]);
        inst.on_ready([ready_fn(move || {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })]);
        inst
    }));
    let mut events = fx.events.subscribe();
    let token = CancellationToken::new();
    let handle = spawn_run(&inst, &token);

    inst.request_start();
    eventually("await format", || {
        inst.local_state() == MemberState::AwaitFormat
    })
    .await;
    assert_eq!(
        events.recv().await.unwrap(),
        InstanceEvent::AwaitFormat { index: 0 }
    );
    assert_eq!(formats.load(Ordering::SeqCst), 1);
    assert_eq!(fx.runner.starts(), 0);

    fx.store.put(fresh_superblock());
    inst.notify_storage_ready();
    eventually("engine start", || fx.runner.starts() == 1).await;
    assert_eq!(inst.local_state(), MemberState::Starting);

    fx.membership.always(join_resp(7, MemberState::Joined, 3));
    inst.notify_drpc_ready(ready_req("x://1", false)).unwrap();
    eventually("ready", || inst.is_ready()).await;
    eventually("ready callbacks", || readies.load(Ordering::SeqCst) == 1).await;
    assert_eq!(inst.get_rank().await.unwrap(), Rank::new(7));

    token.cancel();
    handle.await.unwrap();
    assert_eq!(inst.local_state(), MemberState::Stopped);
}

#[tokio::test]
async fn test_engine_exit_resets_runtime_state() {
    let fx = Fixture::new("run_exit");
    let exits = Arc::new(StdMutex::new(Vec::new()));
    let e = exits.clone();
    fx.store.put(ranked_superblock(4, "x://1"));
    let inst = Arc::new(fx.build_with(move |mut inst| {
        inst.on_instance_exit([instance_exit_fn(move |exit| {
            let e = e.clone();
            async move {
                e.lock().unwrap().push(exit);
                Ok(())
            }
        })]);
        inst
    }));
    let token = CancellationToken::new();
    let handle = spawn_run(&inst, &token);

    inst.request_start();
    eventually("engine start", || fx.runner.starts() == 1).await;
    fx.membership.always(join_resp(4, MemberState::Joined, 1));
    inst.notify_drpc_ready(ready_req("x://1", false)).unwrap();
    eventually("ready", || inst.is_ready()).await;
    inst.set_last_health_stats("dev-1", BioHealthResp::default())
        .await;

    fx.runner.crash("segfault");
    eventually("exit callbacks", || exits.lock().unwrap().len() == 1).await;

    assert_eq!(inst.local_state(), MemberState::Stopped);
    assert_eq!(inst.last_error().await.as_deref(), Some("segfault"));
    assert!(inst.get_last_health_stats("dev-1").await.is_none());
    let exit = exits.lock().unwrap()[0].clone();
    assert_eq!(exit.rank, Rank::new(4));
    assert_eq!(exit.error.as_deref(), Some("segfault"));
    assert_eq!(exit.pid, Some(4242));

    token.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_start_request_while_running_restarts() {
    let fx = Fixture::new("run_restart");
    fx.store.put(ranked_superblock(1, "x://1"));
    let inst = Arc::new(fx.build());
    let token = CancellationToken::new();
    let handle = spawn_run(&inst, &token);

    inst.request_start();
    eventually("first start", || fx.runner.starts() == 1).await;
    inst.request_start();
    eventually("restart", || fx.runner.starts() == 2).await;
    assert!(inst.is_started());

    token.cancel();
    handle.await.unwrap();
    assert!(!inst.is_started());
    assert_eq!(inst.local_state(), MemberState::Stopped);
}

#[tokio::test]
async fn test_cancel_while_awaiting_format() {
    let fx = Fixture::new("run_cancel");
    let inst = Arc::new(fx.build());
    let token = CancellationToken::new();
    let handle = spawn_run(&inst, &token);

    inst.request_start();
    eventually("await format", || {
        inst.local_state() == MemberState::AwaitFormat
    })
    .await;

    token.cancel();
    handle.await.unwrap();
    assert_eq!(inst.local_state(), MemberState::Stopped);
    assert_eq!(fx.runner.starts(), 0);
}

#[tokio::test]
async fn test_stop_kills_engine() {
    let fx = Fixture::new("run_stop");
    fx.store.put(ranked_superblock(1, "x://1"));
    let inst = Arc::new(fx.build());
    let token = CancellationToken::new();
    let handle = spawn_run(&inst, &token);

    inst.request_start();
    eventually("start", || fx.runner.starts() == 1).await;
    inst.stop().await;
    eventually("stopped", || !inst.is_started()).await;
    assert_eq!(inst.local_state(), MemberState::Stopped);
    assert_eq!(inst.last_error().await.as_deref(), Some("killed"));

    token.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_start_requests_coalesce() {
    let fx = Fixture::new("run_coalesce");
    fx.store.put(ranked_superblock(1, "x://1"));
    fx.runner.slow_kill(Duration::from_millis(50));
    let inst = Arc::new(fx.build());
    let token = CancellationToken::new();
    let handle = spawn_run(&inst, &token);

    inst.request_start();
    eventually("first start", || fx.runner.starts() == 1).await;
    inst.request_start();
    tokio::time::sleep(Duration::from_millis(5)).await;
    inst.request_start();
    eventually("restart", || fx.runner.starts() == 2).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fx.runner.starts(), 2);
    assert!(inst.is_started());

    token.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_stop_during_bring_up_skips_set_up() {
    let fx = Fixture::new("run_stop_drpc");
    fx.store.put(ranked_superblock(1, "x://1"));
    fx.engine.hung.store(true, Ordering::SeqCst);
    fx.membership.always(join_resp(1, MemberState::Joined, 1));
    let inst = Arc::new(fx.build());
    let token = CancellationToken::new();
    let handle = spawn_run(&inst, &token);

    inst.request_start();
    eventually("start", || fx.runner.starts() == 1).await;
    inst.notify_drpc_ready(ready_req("x://1", false)).unwrap();
    eventually("SetRank sent", || fx.engine.count(DrpcMethod::SetRank) == 1).await;

    inst.stop().await;
    eventually("stopped", || !inst.is_started()).await;
    eventually("exit recorded", || inst.local_state() == MemberState::Stopped).await;
    assert_eq!(fx.engine.count(DrpcMethod::SetUp), 0);
    assert!(!inst.is_ready());

    token.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_engine_exit_during_join() {
    let fx = Fixture::new("run_exit_join");
    fx.store.put(fresh_superblock());
    fx.membership.always(join_resp(9, MemberState::Joined, 1));
    fx.membership.block();
    let inst = Arc::new(fx.build());
    let mut events = fx.events.subscribe();
    let token = CancellationToken::new();
    let handle = spawn_run(&inst, &token);

    inst.request_start();
    eventually("start", || fx.runner.starts() == 1).await;
    inst.notify_drpc_ready(ready_req("x://1", false)).unwrap();
    eventually("join sent", || fx.membership.calls() == 1).await;

    fx.runner.crash("segfault");
    match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
        Ok(Ok(InstanceEvent::EngineDied { index, error, .. })) => {
            assert_eq!(index, 0);
            assert_eq!(error.as_deref(), Some("segfault"));
        }
        other => panic!("expected engine death, got {:?}", other),
    }
    assert_eq!(inst.local_state(), MemberState::Stopped);
    assert_eq!(inst.last_error().await.as_deref(), Some("segfault"));

    // The abandoned join never commits a rank or reaches the engine.
    fx.membership.release();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.store.saves(), 0);
    assert_eq!(fx.engine.total(), 0);
    assert!(inst.superblock().await.unwrap().rank.is_none());

    token.cancel();
    handle.await.unwrap();
}
