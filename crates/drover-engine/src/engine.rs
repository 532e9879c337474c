//! The engine: sole owner of the store, driver of the work queue.
//!
//! One engine thread serially owns all graph mutation. Backends run jobs
//! on their own threads and report completion through the engine channel;
//! the make machinery never blocks inside an entity: it suspends by
//! registering watchers and is re-entered through [`Work`] items.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, warn};

use drover_error::Result;
use drover_gather::{DepDigest, TargetDigest};
use drover_store::Store;
use drover_types::{
    Dflags, JobIdx, JobReason, NodeIdx, Pdate, ReqIdx, SmallIds, Status, Tflags,
};

use crate::req::Request;
use crate::reqinfo::{MakeAction, NodeAction, RunAction};

/// Result of one job execution, as the engine consumes it.
#[derive(Debug)]
pub struct JobDigest {
    pub status: Status,
    pub deps: Vec<DepDigest>,
    pub targets: Vec<TargetDigest>,
    pub stdout: String,
    pub stderr: String,
    pub exec_time: Duration,
    /// When execution started; targets produced after this by another job
    /// are clashes.
    pub start_date: Pdate,
}

/// Messages from backend/gather threads into the engine.
#[derive(Debug)]
pub enum EngineMsg {
    JobEnd { job: JobIdx, digest: JobDigest },
    LiveOut { job: JobIdx, chunk: String },
}

/// Target matcher shipped to the backend so gather can classify writes.
#[derive(Debug, Clone)]
pub struct TargetMatcher {
    /// Exact path for static targets, anchored regex for star targets.
    pub exact: Option<String>,
    pub regex: Option<String>,
    pub tflags: Tflags,
}

/// Everything a backend needs to run one job.
#[derive(Debug, Clone)]
pub struct SubmitSpec {
    pub job: JobIdx,
    pub seq_id: u64,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub static_deps: Vec<(String, Dflags)>,
    pub target_matchers: Vec<TargetMatcher>,
    pub rsrcs: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub kill_sigs: Vec<i32>,
    pub reason: JobReason,
    pub tokens1: u8,
    pub cwd: PathBuf,
}

/// Executes submitted jobs and reports their digests on the channel.
pub trait Backend: Send {
    fn submit(&mut self, spec: SubmitSpec, done: Sender<EngineMsg>) -> Result<()>;

    /// Best-effort kill of a running job.
    fn kill(&mut self, job: JobIdx, sig: i32);
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Repo root; node names are relative to it.
    pub root_dir: PathBuf,
    /// Total parallel tokens available to eta estimation.
    pub n_tokens: u32,
    /// Bound on error diagnostics per request.
    pub max_err_lines: usize,
    /// Default kill escalation sequence.
    pub kill_sigs: Vec<i32>,
    /// Names longer than this are not buildable.
    pub max_node_name: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            n_tokens: 1,
            max_err_lines: 30,
            kill_sigs: vec![libc::SIGTERM],
            max_node_name: 4096,
        }
    }
}

/// Re-entry points for suspended make calls.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Work {
    JobMake {
        job: JobIdx,
        req: ReqIdx,
        action: RunAction,
        reason: JobReason,
        make: MakeAction,
    },
    NodeMake {
        node: NodeIdx,
        req: ReqIdx,
        action: NodeAction,
    },
    ReqWake {
        req: ReqIdx,
    },
}

pub struct Engine {
    pub store: Store,
    pub config: EngineConfig,
    pub(crate) reqs: HashMap<u8, Request>,
    pub(crate) small_ids: SmallIds,
    pub(crate) work: VecDeque<Work>,
    pub(crate) tx: Sender<EngineMsg>,
    rx: Receiver<EngineMsg>,
    backend: Box<dyn Backend>,
    pub(crate) n_running: usize,
    /// Stderr of the last execution of each job, for error reporting.
    pub(crate) job_stderr: HashMap<u32, String>,
    /// Start dates of currently running jobs.
    pub(crate) job_start: HashMap<u32, Pdate>,
    /// Nodes whose buildability is being computed (cycle detection).
    pub(crate) visiting: HashSet<u32>,
    /// Entities whose make frame is currently on the call stack; a
    /// recursive re-entry means a dependency cycle and reads as Waiting.
    pub(crate) making_jobs: HashSet<(u8, u32)>,
    pub(crate) making_nodes: HashSet<(u8, u32)>,
    /// Optional artifact cache consulted before submitting and fed after
    /// successful executions.
    pub(crate) cache: Option<drover_cache::DirCache>,
    /// Compiled target regexes keyed by (rule, target index).
    pub(crate) regex_cache: parking_lot::Mutex<HashMap<(u32, usize), regex::Regex>>,
}

impl Engine {
    pub fn new(store: Store, config: EngineConfig, backend: Box<dyn Backend>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            store,
            config,
            reqs: HashMap::new(),
            small_ids: SmallIds::new(),
            work: VecDeque::new(),
            tx,
            rx,
            backend,
            n_running: 0,
            job_stderr: HashMap::new(),
            job_start: HashMap::new(),
            visiting: HashSet::new(),
            making_jobs: HashSet::new(),
            making_nodes: HashSet::new(),
            cache: None,
            regex_cache: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Attach an artifact cache.
    pub fn set_cache(&mut self, cache: drover_cache::DirCache) {
        self.cache = Some(cache);
    }

    /// Write a job's ReqInfo back, keeping watchers that deeper frames
    /// registered on a placeholder entry while ours was on the stack.
    pub(crate) fn put_job_ri(
        &mut self,
        req: ReqIdx,
        job: JobIdx,
        mut ri: crate::reqinfo::JobReqInfo,
    ) {
        let r = self.req_mut(req);
        if let Some(existing) = r.job_ri.remove(&job) {
            ri.watchers.extend(existing.watchers);
        }
        r.job_ri.insert(job, ri);
    }

    /// Node counterpart of [`Engine::put_job_ri`].
    pub(crate) fn put_node_ri(
        &mut self,
        req: ReqIdx,
        node: NodeIdx,
        mut ri: crate::reqinfo::NodeReqInfo,
    ) {
        let r = self.req_mut(req);
        if let Some(existing) = r.node_ri.remove(&node) {
            ri.watchers.extend(existing.watchers);
        }
        r.node_ri.insert(node, ri);
    }

    pub(crate) fn req(&self, req: ReqIdx) -> &Request {
        self.reqs.get(&req.0).expect("request is open")
    }

    pub(crate) fn req_mut(&mut self, req: ReqIdx) -> &mut Request {
        self.reqs.get_mut(&req.0).expect("request is open")
    }

    pub(crate) fn submit_to_backend(&mut self, spec: SubmitSpec) -> Result<()> {
        self.n_running += 1;
        self.job_start.insert(spec.job.get(), Pdate::now());
        let tx = self.tx.clone();
        match self.backend.submit(spec, tx) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.n_running -= 1;
                Err(e)
            }
        }
    }

    /// Kill every job currently running for `req` (zombie short-circuit
    /// makes sure nothing new is launched).
    pub fn kill_req(&mut self, req: ReqIdx) {
        let Some(r) = self.reqs.get_mut(&req.0) else {
            return;
        };
        r.zombie = true;
        let running: Vec<u32> = self.job_start.keys().copied().collect();
        for raw in running {
            if let Some(job) = JobIdx::new(raw) {
                self.backend.kill(job, -1);
            }
        }
    }

    /// Process queued work until the request completes, pumping backend
    /// messages while jobs are in flight.
    pub fn run_req(&mut self, req: ReqIdx) -> Result<crate::req::ReqSummary> {
        loop {
            while let Some(w) = self.work.pop_front() {
                self.dispatch(w)?;
            }
            // drain without blocking first, then block only if jobs run
            match self.rx.try_recv() {
                Ok(msg) => {
                    self.handle_msg(msg)?;
                    continue;
                }
                Err(crossbeam_channel::TryRecvError::Empty) => {}
                Err(crossbeam_channel::TryRecvError::Disconnected) => {}
            }
            if self.req(req).n_wait > 0 && self.n_running > 0 {
                let msg = self
                    .rx
                    .recv()
                    .map_err(|_| drover_error::DroverError::JobProcess {
                        detail: "backend channel closed with jobs in flight".to_owned(),
                    })?;
                self.handle_msg(msg)?;
                continue;
            }
            if self.req(req).n_wait > 0 {
                // nothing runs and nothing is queued: the remaining waits
                // can never resolve (deadlocked graph); close as-is, the
                // summary diagnoses cycles
                warn!(%req, n_wait = self.req(req).n_wait, "request stuck, closing");
            }
            break;
        }
        self.close_req(req)
    }

    fn handle_msg(&mut self, msg: EngineMsg) -> Result<()> {
        match msg {
            EngineMsg::JobEnd { job, digest } => self.job_end(job, digest),
            EngineMsg::LiveOut { job, chunk } => {
                debug!(%job, len = chunk.len(), "live out");
                for r in self.reqs.values_mut() {
                    if r.job_ri.contains_key(&job) {
                        r.live_out(&chunk);
                    }
                }
                Ok(())
            }
        }
    }

    /// Answer a running job's "have my deps changed?" probe.
    ///
    /// `Maybe` means a dep is being re-analyzed right now; gather reacts by
    /// stopping the job (`Status::ChkDeps`) so it reruns once deps settle.
    pub fn chk_deps(&self, job: JobIdx) -> Result<drover_autodep::DepsStatus> {
        use drover_autodep::DepsStatus;
        let deps = self.store.job_deps(job)?;
        for dep in &deps {
            for r in self.reqs.values() {
                if r.node_ri.get(&dep.node).is_some_and(|ri| ri.waiting()) {
                    return Ok(DepsStatus::Maybe);
                }
                if r.node_ri.get(&dep.node).is_some_and(|ri| ri.err) {
                    return Ok(DepsStatus::Err);
                }
            }
        }
        for dep in &deps {
            if !self.dep_up_to_date(dep, false)? {
                return Ok(DepsStatus::Rebuild);
            }
        }
        Ok(DepsStatus::Ok)
    }

    fn dispatch(&mut self, work: Work) -> Result<()> {
        match work {
            Work::JobMake {
                job,
                req,
                action,
                reason,
                make,
            } => self.job_make(job, req, action, reason, make),
            Work::NodeMake { node, req, action } => {
                self.node_make(node, req, action).map(|_| ())
            }
            Work::ReqWake { req } => {
                self.req_wake(req);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let c = EngineConfig::default();
        assert!(c.n_tokens >= 1);
        assert!(c.max_err_lines > 0);
        assert!(!c.kill_sigs.is_empty());
    }
}
