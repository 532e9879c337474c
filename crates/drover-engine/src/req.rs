//! Requests: one open build demand and its lifecycle.
//!
//! A request wraps its targets as a synthetic top-level job whose deps are
//! the targets; completion reporting happens here, including the three
//! failure diagnostics (cycle, no-rule, dep-error chain).

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use drover_error::Result;
use drover_store::tables::ConformIdx;
use drover_types::{Buildable, JobIdx, NodeIdx, Pdate, ReqIdx, RunStatus};

use crate::engine::Engine;
use crate::reqinfo::{JobReqInfo, NodeAction, NodeReqInfo, Watcher};

/// Counters reported in the request summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReqStats {
    /// Jobs executed to completion (ok).
    pub done: usize,
    /// Jobs executed and failed.
    pub failed: usize,
    /// Jobs rerun because their first result was unreliable.
    pub rerun: usize,
    /// Cache hits.
    pub hit: usize,
    /// Jobs found up to date without running.
    pub steady: usize,
    /// Total useful execution time.
    pub useful: Duration,
}

/// Final report of a closed request.
#[derive(Debug)]
pub struct ReqSummary {
    pub ok: bool,
    pub stats: ReqStats,
    pub lines: Vec<String>,
}

impl ReqSummary {
    /// Engine exit code: 0 iff every target ended ok.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.ok)
    }
}

/// One open request.
pub struct Request {
    pub idx: ReqIdx,
    pub targets: Vec<NodeIdx>,
    pub target_names: Vec<String>,
    pub start_date: Pdate,
    pub eta: Pdate,
    /// Outstanding top-level targets.
    pub n_wait: usize,
    /// Killed externally: make calls short-circuit, no new jobs start.
    pub zombie: bool,
    pub stats: ReqStats,
    pub job_ri: HashMap<JobIdx, JobReqInfo>,
    pub node_ri: HashMap<NodeIdx, NodeReqInfo>,
    /// Nodes written by two jobs at once; results may be tainted.
    pub clash_nodes: Vec<NodeIdx>,
    pub frozen_jobs: Vec<JobIdx>,
    pub no_triggers: Vec<NodeIdx>,
    /// Audit lines accumulated while the request runs.
    pub log: Vec<String>,
    live_out_buf: String,
    /// Execution time committed by submitted-but-unfinished jobs, for eta.
    pub pending_exec: Duration,
}

impl Request {
    #[must_use]
    pub fn new(idx: ReqIdx) -> Self {
        let now = Pdate::now();
        Self {
            idx,
            targets: Vec::new(),
            target_names: Vec::new(),
            start_date: now,
            eta: now,
            n_wait: 0,
            zombie: false,
            stats: ReqStats::default(),
            job_ri: HashMap::new(),
            node_ri: HashMap::new(),
            clash_nodes: Vec::new(),
            frozen_jobs: Vec::new(),
            no_triggers: Vec::new(),
            log: Vec::new(),
            live_out_buf: String::new(),
            pending_exec: Duration::ZERO,
        }
    }

    /// Requests are totally ordered by (start date, eta, id).
    #[must_use]
    pub fn sort_key(&self) -> (Pdate, Pdate, u8) {
        (self.start_date, self.eta, self.idx.0)
    }

    pub fn live_out(&mut self, chunk: &str) {
        self.live_out_buf.push_str(chunk);
    }

    #[must_use]
    pub fn live_out_seen(&self) -> &str {
        &self.live_out_buf
    }

    pub fn audit(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!(req = %self.idx, "{line}");
        self.log.push(line);
    }
}

impl Engine {
    /// Open a request for `targets` and queue their analysis.
    ///
    /// A request with no targets completes immediately with empty stats.
    pub fn open_req(&mut self, targets: &[String]) -> Result<ReqIdx> {
        let idx = self.small_ids.acquire();
        let mut req = Request::new(idx);
        let mut nodes = Vec::with_capacity(targets.len());
        for t in targets {
            let node = self.store.node_at(t)?;
            nodes.push(node);
        }
        req.targets = nodes.clone();
        req.target_names = targets.to_vec();
        req.n_wait = nodes.len();
        for &node in &nodes {
            req.node_ri
                .entry(node)
                .or_insert_with(NodeReqInfo::default)
                .watchers
                .push(Watcher::Req);
        }
        info!(req = %idx, n_targets = targets.len(), "request opened");
        self.reqs.insert(idx.0, req);
        for node in nodes {
            self.work.push_back(crate::engine::Work::NodeMake {
                node,
                req: idx,
                action: NodeAction::Dsk,
            });
        }
        Ok(idx)
    }

    /// A top-level target completed; refresh the eta.
    pub(crate) fn req_wake(&mut self, req: ReqIdx) {
        self.update_eta(req);
    }

    /// Recompute `eta = now + Σ rule.exec_time × tokens / n_tokens` over
    /// still-pending jobs. Called live as jobs start and finish.
    pub(crate) fn update_eta(&mut self, req: ReqIdx) {
        use crate::reqinfo::JobLvl;
        let n_tokens = u64::from(self.config.n_tokens.max(1));
        let Some(r) = self.reqs.get(&req.0) else {
            return;
        };
        let mut pending_ns: u64 = 0;
        for (job, ri) in &r.job_ri {
            if !matches!(ri.lvl, JobLvl::Queued | JobLvl::Exec) {
                continue;
            }
            let Ok(jrec) = self.store.job(*job) else {
                continue;
            };
            let Ok(rule) = self.store.job_rule(*job) else {
                continue;
            };
            let Ok(rrec) = self.store.rule_rec(rule) else {
                continue;
            };
            let tokens = u64::from(jrec.tokens1) + 1;
            pending_ns = pending_ns.saturating_add(rrec.exec_time_ns.saturating_mul(tokens));
        }
        let pending = Duration::from_nanos(pending_ns / n_tokens);
        let Some(r) = self.reqs.get_mut(&req.0) else {
            return;
        };
        r.pending_exec = pending;
        r.eta = Pdate::now().saturating_add(pending);
    }

    /// Close the request and build its summary.
    pub fn close_req(&mut self, req: ReqIdx) -> Result<ReqSummary> {
        self.update_eta(req);
        let r = self.req(req);
        let stats = r.stats.clone();
        let targets: Vec<(NodeIdx, String)> = r
            .targets
            .iter()
            .copied()
            .zip(r.target_names.iter().cloned())
            .collect();
        let mut lines = r.log.clone();
        let clash_nodes = r.clash_nodes.clone();
        let frozen_jobs = r.frozen_jobs.clone();
        let no_triggers = r.no_triggers.clone();

        let mut ok = true;
        let mut err_budget = self.config.max_err_lines;
        for (node, name) in &targets {
            if self.target_ok(*node, req)? {
                continue;
            }
            ok = false;
            let mut diag = self.diagnose(*node, name, req, &mut err_budget)?;
            lines.append(&mut diag);
        }

        lines.push(format!(
            "done : {} , rerun : {} , failed : {} , hit : {} , steady : {}",
            stats.done, stats.rerun, stats.failed, stats.hit, stats.steady
        ));
        lines.push(format!("useful time : {:.3}s", stats.useful.as_secs_f64()));
        for node in &clash_nodes {
            lines.push(format!(
                "warning : {} was written by several jobs, results may be tainted",
                self.store.node_name(*node)?
            ));
        }
        for job in &frozen_jobs {
            lines.push(format!(
                "warning : {} is frozen",
                self.store.job_user_name(*job)?
            ));
        }
        for node in &no_triggers {
            lines.push(format!(
                "warning : {} changed but does not trigger rebuilds",
                self.store.node_name(*node)?
            ));
        }

        info!(req = %req, ok, "request closed");
        self.reqs.remove(&req.0);
        self.small_ids.release(req);
        Ok(ReqSummary { ok, stats, lines })
    }

    /// Whether a top-level target ended up in a good state.
    fn target_ok(&self, node: NodeIdx, req: ReqIdx) -> Result<bool> {
        let rec = self.store.node(node)?;
        if let Some(ri) = self.req(req).node_ri.get(&node) {
            if ri.err {
                return Ok(false);
            }
            if ri.waiting() {
                return Ok(false); // stuck (cycle)
            }
        }
        if rec.buildable.is_src_anti() {
            return Ok(rec.buildable != Buildable::Anti && rec.sig.exists());
        }
        match rec.conform {
            ConformIdx::JobTgt(_) => {
                let Some(job) = JobIdx::new(rec.actual_job) else {
                    return Ok(rec.crc.is_reliable());
                };
                let jrec = self.store.job(job)?;
                Ok(jrec.status.is_ok() && !jrec.run_status.is_err())
            }
            ConformIdx::Src | ConformIdx::SrcDir => Ok(rec.sig.exists()),
            _ => Ok(false),
        }
    }

    // -----------------------------------------------------------------------
    // Failure diagnostics
    // -----------------------------------------------------------------------

    /// One of three diagnostics per unsatisfied target: cycle, no-rule, or
    /// a dep-error chain bounded by `max_err_lines`.
    fn diagnose(
        &self,
        node: NodeIdx,
        name: &str,
        req: ReqIdx,
        err_budget: &mut usize,
    ) -> Result<Vec<String>> {
        if let Some(cycle) = self.find_cycle(node, req)? {
            let mut lines = vec![format!("cycle detected for {name} :")];
            for (i, step) in cycle.iter().enumerate() {
                let margin = if i == 0 {
                    "+->"
                } else if i + 1 == cycle.len() {
                    "^--"
                } else {
                    "|  "
                };
                lines.push(format!("{margin} {step}"));
            }
            return Ok(lines);
        }
        let rec = self.store.node(node)?;
        if !rec.buildable.is_buildable() && !rec.buildable.is_src_anti() {
            return self.diag_no_rule(node, name);
        }
        self.diag_dep_err(node, name, err_budget)
    }

    /// DFS over not-done conform jobs until a previously-seen node is hit.
    fn find_cycle(&self, start: NodeIdx, req: ReqIdx) -> Result<Option<Vec<String>>> {
        let r = self.req(req);
        let mut stack: Vec<NodeIdx> = Vec::new();
        let mut on_stack: Vec<NodeIdx> = Vec::new();
        let mut seen: Vec<NodeIdx> = Vec::new();
        let mut found: Option<Vec<String>> = None;
        self.cycle_dfs(start, r, &mut stack, &mut on_stack, &mut seen, &mut found)?;
        Ok(found)
    }

    fn cycle_dfs(
        &self,
        node: NodeIdx,
        r: &Request,
        stack: &mut Vec<NodeIdx>,
        on_stack: &mut Vec<NodeIdx>,
        seen: &mut Vec<NodeIdx>,
        found: &mut Option<Vec<String>>,
    ) -> Result<()> {
        if found.is_some() || seen.contains(&node) {
            return Ok(());
        }
        if on_stack.contains(&node) {
            // close the loop: from the first occurrence to here, plus the
            // repeated node
            let first = stack.iter().position(|n| *n == node).unwrap_or(0);
            let mut names: Vec<String> = Vec::new();
            for n in &stack[first..] {
                names.push(self.store.node_name(*n)?);
            }
            names.push(self.store.node_name(node)?);
            *found = Some(names);
            return Ok(());
        }
        // only not-done jobs participate in a deadlock
        let waiting = r.node_ri.get(&node).is_some_and(NodeReqInfo::waiting);
        let producing = self.producing_job(node)?;
        let Some(job) = producing else {
            return Ok(());
        };
        let job_waiting = r
            .job_ri
            .get(&job)
            .is_some_and(|ri| ri.waiting() || ri.lvl < crate::reqinfo::JobLvl::Done);
        if !waiting && !job_waiting {
            seen.push(node);
            return Ok(());
        }
        stack.push(node);
        on_stack.push(node);
        for dep in self.store.job_deps(job)? {
            self.cycle_dfs(dep.node, r, stack, on_stack, seen, found)?;
            if found.is_some() {
                return Ok(());
            }
        }
        stack.pop();
        on_stack.retain(|n| *n != node);
        seen.push(node);
        Ok(())
    }

    fn producing_job(&self, node: NodeIdx) -> Result<Option<JobIdx>> {
        let rec = self.store.node(node)?;
        if let ConformIdx::JobTgt(i) = rec.conform {
            let tgts = self.store.node_job_tgts(node)?;
            return Ok(tgts.get(i as usize).copied());
        }
        if let Some(job) = JobIdx::new(rec.actual_job) {
            return Ok(Some(job));
        }
        let tgts = self.store.node_job_tgts(node)?;
        Ok(tgts.first().copied())
    }

    /// Enumerate the rules that framed-matched the name and why each one
    /// does not apply.
    fn diag_no_rule(&self, node: NodeIdx, name: &str) -> Result<Vec<String>> {
        let mut lines = vec![format!("no rule for {name} :")];
        for cand in self.store.candidates(name) {
            let data = self.store.rule_data(cand.rule)?;
            let Some(target) = data.targets.get(cand.tgt_idx) else {
                continue;
            };
            if cand.is_anti {
                if self.pattern_matches(&data, target, name)?.is_some() {
                    lines.push(format!("  matches anti-rule {}", data.name));
                }
                continue;
            }
            match self.pattern_matches(&data, target, name)? {
                None => lines.push(format!("  rule {} does not match", data.name)),
                Some(stems) => {
                    // matched: it must be a static dep that is missing
                    for dep in &data.deps {
                        if let Some(dep_path) = dep.pattern.substitute(&stems) {
                            let buildable = self
                                .store
                                .node_idx(&dep_path)?
                                .map(|n| self.store.node(n))
                                .transpose()?
                                .map(|r| r.buildable);
                            let missing = !self.config.root_dir.join(&dep_path).exists()
                                && !buildable.unwrap_or(Buildable::Unknown).is_buildable();
                            if missing {
                                lines.push(format!(
                                    "  rule {} misses dep {dep_path}",
                                    data.name
                                ));
                            }
                        }
                    }
                }
            }
        }
        if lines.len() == 1 {
            lines.push("  no rule matches".to_owned());
        }
        Ok(lines)
    }

    /// Recurse into failed producing jobs, showing the first stderr and
    /// rule name per chain, bounded by the error budget.
    fn diag_dep_err(
        &self,
        node: NodeIdx,
        name: &str,
        err_budget: &mut usize,
    ) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut cur = Some((node, name.to_owned()));
        let mut visited: Vec<NodeIdx> = Vec::new();
        while let Some((n, nm)) = cur.take() {
            if *err_budget == 0 {
                lines.push("  ... (more errors)".to_owned());
                break;
            }
            if visited.contains(&n) {
                break;
            }
            visited.push(n);
            let Some(job) = self.producing_job(n)? else {
                lines.push(format!("{nm} : not buildable"));
                break;
            };
            let jrec = self.store.job(job)?;
            let rule = self.store.rule_data(self.store.job_rule(job)?)?;
            if jrec.run_status == RunStatus::DepErr {
                // intermediate: report with the upstream dep's stderr
                lines.push(format!("{nm} : dep error in rule {}", rule.name));
                *err_budget = err_budget.saturating_sub(1);
                let dep_in_err = self.store.job_deps(job)?.into_iter().find(|d| {
                    self.producing_job(d.node)
                        .ok()
                        .flatten()
                        .and_then(|j| self.store.job(j).ok())
                        .is_some_and(|j| j.status.is_err() || j.run_status.is_err())
                });
                if let Some(d) = dep_in_err {
                    cur = Some((d.node, self.store.node_name(d.node)?));
                }
            } else if jrec.status.is_err() {
                lines.push(format!("{nm} : rule {} failed :", rule.name));
                *err_budget = err_budget.saturating_sub(1);
                if let Some(stderr) = self.job_stderr.get(&job.get()) {
                    for l in stderr.lines() {
                        if *err_budget == 0 {
                            lines.push("  ... (more errors)".to_owned());
                            break;
                        }
                        lines.push(format!("  {l}"));
                        *err_budget = err_budget.saturating_sub(1);
                    }
                }
            } else {
                lines.push(format!("{nm} : not up to date"));
                *err_budget = err_budget.saturating_sub(1);
            }
        }
        Ok(lines)
    }
}
