//! Job state machine: the make loop, end-of-job handling, forget.

use std::time::Duration;

use tracing::{debug, warn};

use drover_error::Result;
use drover_gather::WriteState;
use drover_store::depvec::{Dep, DepPayload, TargetEntry};
use drover_store::rule::RuleData;
use drover_types::{
    Crc, Dflags, FileSig, JobIdx, JobReason, JobReasonTag, NodeIdx, Pdate, ReqIdx, RunStatus,
    Status, Tflags, static_phony,
};

use crate::engine::{Engine, JobDigest, SubmitSpec, TargetMatcher, Work};
use crate::node::NodeOutcome;
use crate::reqinfo::{JobLvl, JobReqInfo, MakeAction, NodeAction, RunAction, Watcher};

/// Flags attached to writes that match no declared target.
fn unexpected_tflags() -> Tflags {
    Tflags::empty()
}

impl Engine {
    /// Drive a job toward `ri.action` for one request.
    ///
    /// The single entry point of the job state machine; monotone in
    /// `action` per (job, request). Suspension is expressed by returning
    /// with `n_wait > 0`; the awaited dep re-enters us through its
    /// watcher list.
    pub(crate) fn job_make(
        &mut self,
        job: JobIdx,
        req: ReqIdx,
        action: RunAction,
        reason: JobReason,
        make: MakeAction,
    ) -> Result<()> {
        // a re-entry while our frame is on the stack is a dependency
        // cycle; the caller sees a not-done job and suspends on it
        if !self.making_jobs.insert((req.0, job.get())) {
            return Ok(());
        }
        let out = self.job_make_inner(job, req, action, reason, make);
        self.making_jobs.remove(&(req.0, job.get()));
        out
    }

    fn job_make_inner(
        &mut self,
        job: JobIdx,
        req: ReqIdx,
        action: RunAction,
        reason: JobReason,
        make: MakeAction,
    ) -> Result<()> {
        let mut ri = self.req_mut(req).job_ri.remove(&job).unwrap_or_default();
        ri.action = ri.action.max(action);
        ri.reason = ri.reason.merge(reason);
        // deadline priority: the oldest interested request wins
        let start = self.req(req).start_date;
        if ri.pressure.is_none() || start < ri.pressure {
            ri.pressure = start;
        }
        if make == MakeAction::End {
            // a (possibly flash) execution completed: restart analysis on
            // the updated deps, re-deriving the status-based reasons
            ri.lvl = JobLvl::None;
            ri.dep_lvl = 0;
            ri.dep_state = Default::default();
            ri.crit_pending = false;
            ri.done_action = None;
            ri.reason = reason;
        }
        if self.req(req).zombie {
            return self.finish_job(job, req, ri);
        }
        if ri.lvl == JobLvl::Done && ri.done_for(ri.action) {
            self.put_job_ri(req, job, ri);
            self.wake_job_watchers(job, req);
            return Ok(());
        }
        if matches!(ri.lvl, JobLvl::Queued | JobLvl::Exec) || ri.waiting() {
            self.put_job_ri(req, job, ri);
            return Ok(());
        }

        if ri.lvl == JobLvl::None {
            self.check_freshness(job, &mut ri)?;
            ri.lvl = JobLvl::Dep;
        }

        // --- dep traversal ---
        let deps = self.store.job_deps(job)?;
        let mut i = ri.dep_lvl;
        let mut pruned = false;
        while i < deps.len() {
            let dep = deps[i];
            if ri.action == RunAction::Makable && !dep.dflags.contains(Dflags::STATIC) {
                i += 1;
                continue;
            }
            if !dep.parallel {
                // a parallel group closed: commit any dangling modif
                ri.dep_state = ri.dep_state.settle();
                if ri.dep_state == drover_types::DepState::Modif && ri.crit_pending {
                    // a critical dep changed: every dep past this boundary
                    // is speculative, drop it and go run
                    debug!(job = %job, keep = i, "critical pruning");
                    self.store.shorten_job_deps(job, i)?;
                    pruned = true;
                    break;
                }
            }
            let n_action = if ri.action == RunAction::Makable {
                NodeAction::Makable
            } else if ri.action >= RunAction::Dsk || ri.reason.is_some() {
                NodeAction::Dsk
            } else {
                NodeAction::Status
            };
            match self.node_make(dep.node, req, n_action)? {
                NodeOutcome::Waiting => {
                    self.req_mut(req)
                        .node_ri
                        .entry(dep.node)
                        .or_default()
                        .watchers
                        .push(Watcher::Job(job));
                    ri.n_wait += 1;
                    ri.dep_lvl = i;
                    self.put_job_ri(req, job, ri);
                    return Ok(());
                }
                NodeOutcome::Done => {}
            }
            self.classify_dep(job, req, &dep, &mut ri)?;
            i += 1;
        }
        if !pruned {
            ri.dep_state = ri.dep_state.settle();
        }
        ri.dep_lvl = i;

        // --- run decision ---
        let mut jrec = self.store.job(job)?;
        use drover_types::DepState;
        jrec.run_status = match ri.dep_state {
            DepState::Err => RunStatus::DepErr,
            DepState::MissingStatic => RunStatus::NoDep,
            _ => RunStatus::Complete,
        };
        self.store.job_put(job, &jrec)?;
        if ri.action == RunAction::Makable || jrec.run_status != RunStatus::Complete {
            return self.finish_job(job, req, ri);
        }

        let mut needs_run = ri.action == RunAction::Run
            || ri.reason.is_some()
            || ri.dep_state == DepState::Modif
            || pruned;
        if !needs_run && ri.action >= RunAction::Dsk {
            // targets must be present on disk, with the content we produced
            for (path, tflags) in self.job_static_targets(job)? {
                if static_phony(tflags) {
                    continue;
                }
                let node = self.store.node_at(&path)?;
                match self.node_manual(node)? {
                    drover_types::Manual::Ok => {}
                    drover_types::Manual::Unlnked => {
                        ri.reason = ri
                            .reason
                            .merge(JobReason::on_node(JobReasonTag::NoTarget, node));
                        needs_run = true;
                        break;
                    }
                    // an emptied target is a cheap user reset: regenerate
                    drover_types::Manual::Empty => {
                        ri.reason = ri
                            .reason
                            .merge(JobReason::on_node(JobReasonTag::NoTarget, node));
                        needs_run = true;
                        break;
                    }
                    drover_types::Manual::Modif => {
                        if self.store.is_manual_ok(node) {
                            ri.reason = ri
                                .reason
                                .merge(JobReason::on_node(JobReasonTag::NoTarget, node));
                            needs_run = true;
                            break;
                        }
                        // hand-modified and not overridable: leave it alone
                        self.req_mut(req).audit(format!(
                            "warning : {path} was modified manually, not regenerating"
                        ));
                    }
                }
            }
        }
        if !needs_run {
            return self.finish_job(job, req, ri);
        }
        if self.store.is_frozen_job(job) {
            // operator override: behave as a source
            let mut jrec = self.store.job(job)?;
            if !jrec.status.is_err() {
                jrec.status = Status::Frozen;
            }
            self.store.job_put(job, &jrec)?;
            self.req_mut(req).frozen_jobs.push(job);
            return self.finish_job(job, req, ri);
        }
        if self.try_cache_hit(job, req)? {
            ri.cache_hit = true;
            return self.finish_job(job, req, ri);
        }
        self.submit_job(job, req, ri)
    }

    /// Command-freshness pseudo-dep and status-derived rerun reasons.
    fn check_freshness(&mut self, job: JobIdx, ri: &mut JobReqInfo) -> Result<()> {
        let jrec = self.store.job(job)?;
        let rrec = self.store.rule_rec(self.store.job_rule(job)?)?;
        if jrec.exec_gen < rrec.cmd_gen {
            let tag = if jrec.status.is_err() {
                JobReasonTag::OldError
            } else {
                JobReasonTag::Cmd
            };
            ri.reason = ri.reason.merge(JobReason::new(tag));
        } else if jrec.status.is_err() && jrec.exec_gen < rrec.rsrcs_gen {
            // rerunning on a resource change is only worth it when the
            // previous outcome was an error
            ri.reason = ri.reason.merge(JobReason::new(JobReasonTag::Rsrcs));
        }
        match jrec.status {
            Status::New => ri.reason = ri.reason.merge(JobReason::new(JobReasonTag::New)),
            Status::Lost => ri.reason = ri.reason.merge(JobReason::new(JobReasonTag::Lost)),
            Status::Killed => ri.reason = ri.reason.merge(JobReason::new(JobReasonTag::Killed)),
            Status::ChkDeps => {
                ri.reason = ri.reason.merge(JobReason::new(JobReasonTag::ChkDeps));
            }
            Status::Garbage => {
                ri.reason = ri.reason.merge(JobReason::new(JobReasonTag::Garbage));
            }
            _ => {}
        }
        Ok(())
    }

    /// Fold one analyzed dep into the rolling dep state.
    fn classify_dep(
        &mut self,
        job: JobIdx,
        req: ReqIdx,
        dep: &Dep,
        ri: &mut JobReqInfo,
    ) -> Result<()> {
        use drover_types::DepState;
        let nrec = self.store.node(dep.node)?;
        let node_err = self
            .req(req)
            .node_ri
            .get(&dep.node)
            .is_some_and(|nri| nri.err);
        if node_err && !dep.dflags.contains(Dflags::IGNORE_ERROR) {
            ri.dep_state = ri.dep_state.merge(DepState::Err);
            ri.reason = ri
                .reason
                .merge(JobReason::on_node(JobReasonTag::DepErr, dep.node));
            return Ok(());
        }
        let buildable = nrec.buildable;
        let exists_as_src = buildable.is_src_anti() && nrec.sig.exists();
        if !buildable.is_buildable() && !exists_as_src {
            if dep.dflags.contains(Dflags::STATIC) {
                ri.dep_state = ri.dep_state.merge(DepState::MissingStatic);
                ri.reason = ri
                    .reason
                    .merge(JobReason::on_node(JobReasonTag::StaticDepMissing, dep.node));
            } else if dep.dflags.contains(Dflags::REQUIRED) {
                ri.dep_state = ri.dep_state.merge(DepState::Err);
                ri.reason = ri
                    .reason
                    .merge(JobReason::on_node(JobReasonTag::DepErr, dep.node));
            }
            return Ok(());
        }
        if !self.dep_up_to_date(dep, false)? {
            if self.store.is_no_trigger(dep.node) {
                self.req_mut(req).no_triggers.push(dep.node);
                return Ok(());
            }
            // not committed while the parallel group is open: the write may
            // have happened before any group member was read
            ri.dep_state = ri.dep_state.merge(DepState::DanglingModif);
            ri.reason = ri
                .reason
                .merge(JobReason::on_node(JobReasonTag::DepChanged, dep.node));
            if dep.dflags.contains(Dflags::CRITICAL) {
                ri.crit_pending = true;
            }
        }
        Ok(())
    }

    /// Mark the job done for this request, count it once, wake watchers.
    fn finish_job(&mut self, job: JobIdx, req: ReqIdx, mut ri: JobReqInfo) -> Result<()> {
        ri.lvl = JobLvl::Done;
        ri.done_action = Some(ri.action.max(ri.done_action.unwrap_or_default()));
        if !ri.counted {
            ri.counted = true;
            let jrec = self.store.job(job)?;
            let stats = &mut self.req_mut(req).stats;
            if ri.executed {
                if jrec.status.is_ok() {
                    stats.done += 1;
                    stats.useful += Duration::from_nanos(jrec.exec_time_ns);
                } else {
                    stats.failed += 1;
                }
            } else if ri.cache_hit {
                stats.hit += 1;
            } else {
                stats.steady += 1;
            }
        }
        self.put_job_ri(req, job, ri);
        self.wake_job_watchers(job, req);
        Ok(())
    }

    pub(crate) fn wake_job_watchers(&mut self, job: JobIdx, req: ReqIdx) {
        let watchers = {
            let r = self.req_mut(req);
            match r.job_ri.get_mut(&job) {
                Some(ri) => std::mem::take(&mut ri.watchers),
                None => return,
            }
        };
        for w in watchers {
            match w {
                Watcher::Node(node) => {
                    let r = self.req_mut(req);
                    if let Some(nri) = r.node_ri.get_mut(&node) {
                        nri.n_wait = nri.n_wait.saturating_sub(1);
                    }
                    self.work.push_back(Work::NodeMake {
                        node,
                        req,
                        action: NodeAction::None,
                    });
                }
                Watcher::Job(_) => {
                    warn!("job watcher on job ignored");
                }
                Watcher::Req => {
                    let r = self.req_mut(req);
                    r.n_wait = r.n_wait.saturating_sub(1);
                    self.work.push_back(Work::ReqWake { req });
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // submission
    // -----------------------------------------------------------------------

    /// Stems of a job, recovered by re-matching its name against the rule.
    pub(crate) fn job_stems(&self, job: JobIdx) -> Result<Vec<(String, String)>> {
        let parts = self.store.job_name_parts(job)?;
        let rule = parts.rule;
        let data = self.store.rule_data(rule)?;
        let name = String::from_utf8_lossy(&parts.prefix).into_owned();
        for (i, t) in data.targets.iter().enumerate() {
            if let Some(m) = self.match_target(rule, i, &data, t, &name)? {
                return Ok(m.stems);
            }
        }
        Ok(Vec::new())
    }

    /// Concrete static target paths of a job with their tflags.
    pub(crate) fn job_static_targets(&self, job: JobIdx) -> Result<Vec<(String, Tflags)>> {
        let data = self.store.rule_data(self.store.job_rule(job)?)?;
        let stems = self.job_stems(job)?;
        let mut out = Vec::new();
        for t in data.targets.iter().filter(|t| !t.star) {
            if let Some(path) = t.pattern.substitute(&stems) {
                out.push((path, t.tflags));
            }
        }
        Ok(out)
    }

    fn submit_job(&mut self, job: JobIdx, req: ReqIdx, mut ri: JobReqInfo) -> Result<()> {
        let rule = self.store.job_rule(job)?;
        let data = self.store.rule_data(rule)?;
        let stems = self.job_stems(job)?;
        let seq_id = self.store.next_seq_id();

        let mut cmd = data.interpreter.clone();
        let script = drover_store::rule::RulePattern::new(data.script.clone())
            .substitute(&stems)
            .unwrap_or_else(|| data.script.clone());
        cmd.push(script);

        let mut static_deps = Vec::new();
        for dep in &data.deps {
            if let Some(path) = dep.pattern.substitute(&stems) {
                static_deps.push((path, dep.dflags | Dflags::STATIC));
            }
        }
        let mut target_matchers = Vec::new();
        for t in &data.targets {
            if t.star {
                target_matchers.push(TargetMatcher {
                    exact: None,
                    regex: Some(self.star_target_regex(&data, t, &stems)),
                    tflags: t.tflags,
                });
            } else if let Some(path) = t.pattern.substitute(&stems) {
                target_matchers.push(TargetMatcher {
                    exact: Some(path),
                    regex: None,
                    tflags: t.tflags,
                });
            }
        }

        let spec = SubmitSpec {
            job,
            seq_id,
            cmd,
            env: data.env.clone(),
            static_deps,
            target_matchers,
            rsrcs: data.rsrcs.clone(),
            timeout: (data.timeout_ns > 0).then(|| Duration::from_nanos(data.timeout_ns)),
            kill_sigs: self.config.kill_sigs.clone(),
            reason: ri.reason,
            tokens1: u8::try_from(data.tokens.saturating_sub(1)).unwrap_or(0),
            cwd: self.config.root_dir.clone(),
        };
        if ri.executed {
            self.req_mut(req).stats.rerun += 1;
        }
        ri.executed = true;
        ri.lvl = JobLvl::Queued;
        debug!(job = %job, reason = %ri.reason, "submitting");
        match self.submit_to_backend(spec) {
            Ok(()) => {
                ri.lvl = JobLvl::Exec;
                self.put_job_ri(req, job, ri);
                self.update_eta(req);
                Ok(())
            }
            Err(e) => {
                warn!(job = %job, %e, "submit failed");
                let mut jrec = self.store.job(job)?;
                jrec.run_status = RunStatus::RsrcsErr;
                jrec.status = Status::Err;
                self.store.job_put(job, &jrec)?;
                self.finish_job(job, req, ri)
            }
        }
    }

    /// Anchored regex matching a star target with static stems bound.
    fn star_target_regex(
        &self,
        data: &RuleData,
        target: &drover_store::rule::RuleTarget,
        stems: &[(String, String)],
    ) -> String {
        let mut src = String::from("^");
        let mut rest = target.pattern.pattern.as_str();
        while let Some(open) = rest.find('{') {
            src.push_str(&regex::escape(&rest[..open]));
            let Some(close) = rest[open..].find('}').map(|c| c + open) else {
                break;
            };
            let stem = &rest[open + 1..close];
            if let Some((_, v)) = stems.iter().find(|(n, _)| n == stem) {
                src.push_str(&regex::escape(v));
            } else {
                let stem_re = data
                    .stems
                    .iter()
                    .find(|(n, _)| n == stem)
                    .map_or("[^/]+", |(_, re)| re.as_str());
                src.push('(');
                src.push_str(stem_re);
                src.push(')');
            }
            rest = &rest[close + 1..];
        }
        src.push_str(&regex::escape(rest));
        src.push('$');
        src
    }

    // -----------------------------------------------------------------------
    // end of job
    // -----------------------------------------------------------------------

    /// Digest a finished execution into the store.
    pub(crate) fn job_end(&mut self, job: JobIdx, digest: JobDigest) -> Result<()> {
        self.n_running = self.n_running.saturating_sub(1);
        self.job_start.remove(&job.get());
        let rule = self.store.job_rule(job)?;
        let data = self.store.rule_data(rule)?;
        let stems = self.job_stems(job)?;
        let now = Pdate::now();
        debug!(job = %job, status = %digest.status, n_deps = digest.deps.len(), "job end");

        let mut analysis_errs: Vec<String> = Vec::new();
        let mut local_reason = JobReason::NONE;
        let static_targets = self.job_static_targets(job)?;
        let mut star_targets: Vec<TargetEntry> = Vec::new();

        for t in &digest.targets {
            let node = self.store.node_at(&t.path)?;
            let declared = self.declared_tflags(&data, &stems, &t.path)?;
            let tflags = declared.unwrap_or_else(unexpected_tflags);
            let is_static = static_targets.iter().any(|(p, _)| p == &t.path);

            // source written
            let src_kind = self.store.src_kind(&t.path);
            if src_kind != drover_store::SrcKind::No
                && t.write == WriteState::Yes
                && !self.store.is_manual_ok(node)
                && !tflags.contains(Tflags::STATIC) // a source is never a declared target
            {
                analysis_errs.push(format!("source {} was written", t.path));
            }
            // clash: someone else produced this node while we ran
            let nrec = self.store.node(node)?;
            if nrec.actual_job != 0
                && nrec.actual_job != job.get()
                && nrec.date > digest.start_date
            {
                local_reason = local_reason.merge(JobReason::on_node(
                    JobReasonTag::ClashTarget,
                    node,
                ));
                self.warn_clash(node);
            }
            // a read before the write without Incremental taints the run
            if t.read_before_write && !tflags.contains(Tflags::INCREMENTAL) {
                local_reason =
                    local_reason.merge(JobReason::on_node(JobReasonTag::PrevTarget, node));
            }
            // unexpected write
            if declared.is_none() && t.write == WriteState::Yes {
                analysis_errs.push(format!("unexpected write to {}", t.path));
            }

            // refresh the produced content
            let abs = self.config.root_dir.join(&t.path);
            let sig = FileSig::of(&abs);
            let crc = if sig.exists() {
                Crc::of_file(&abs)
            } else {
                Crc::None
            };
            self.node_refresh(node, crc, now, sig, Some(job))?;
            let mut nrec = self.store.node(node)?;
            nrec.actual_tflags = tflags;
            self.store.node_put(node, &nrec)?;

            if !is_static && declared.is_some() {
                star_targets.push(TargetEntry { node, tflags });
            }
        }

        // declared static targets the job did not produce
        for (path, tflags) in &static_targets {
            let produced = digest
                .targets
                .iter()
                .any(|t| &t.path == path && t.write == WriteState::Yes);
            let on_disk = self.config.root_dir.join(path).exists();
            if !produced && !on_disk && !static_phony(*tflags) {
                analysis_errs.push(format!("missing target {path}"));
            }
            if on_disk && !produced {
                // refresh so up-to-date checks see the current content
                let node = self.store.node_at(path)?;
                self.refresh_src_like(node)?;
            }
        }
        self.store.set_job_star_targets(job, &star_targets)?;

        // --- dep reassembly ---
        let mut new_deps: Vec<Dep> = Vec::with_capacity(digest.deps.len());
        let mut oldest_dep_date = u64::MAX;
        for d in &digest.deps {
            let node = self.store.node_at(&d.path)?;
            let mut dflags = d.dflags;
            if d.critical {
                dflags |= Dflags::CRITICAL;
            }
            // sources seen for the first time get their crc now
            let nrec = self.store.node(node)?;
            if !nrec.crc.is_reliable() || nrec.sig != d.sig {
                let buildable = self.set_buildable(node)?;
                if !buildable.is_buildable() {
                    self.refresh_src_like(node)?;
                }
            }
            let nrec = self.store.node(node)?;
            let payload = if nrec.crc.is_reliable() && nrec.sig == d.sig {
                DepPayload::Crc(nrec.crc)
            } else {
                DepPayload::Date {
                    date: d.file_date,
                    sig: d.sig,
                }
            };
            if d.file_date.0 != 0 {
                oldest_dep_date = oldest_dep_date.min(d.file_date.0);
            }
            new_deps.push(Dep {
                node,
                dflags,
                accesses: d.accesses,
                payload,
                parallel: d.parallel,
            });
        }
        self.store.set_job_deps(job, &new_deps)?;

        // --- final status ---
        let mut status = digest.status;
        if !analysis_errs.is_empty() && !status.is_err() {
            status = Status::Err;
        }
        if local_reason.is_some() && !status.is_terminal_err() && !status.is_err() {
            // the run is unreliable (clash or polluted target): force rerun
            status = Status::Garbage;
        }

        let rrec = self.store.rule_rec(rule)?;
        let mut jrec = self.store.job(job)?;
        jrec.status = status;
        jrec.exec_gen = rrec.rsrcs_gen;
        jrec.match_gen = self.store.match_gen();
        jrec.exec_time_ns = u64::try_from(digest.exec_time.as_nanos()).unwrap_or(u64::MAX);
        if oldest_dep_date != u64::MAX {
            jrec.db_date = oldest_dep_date;
        }
        self.store.job_put(job, &jrec)?;
        let mut rrec = rrec;
        rrec.exec_time_ns = jrec.exec_time_ns;
        self.store.rule_put(rule, &rrec)?;

        let mut stderr = digest.stderr;
        for e in &analysis_errs {
            stderr.push_str(e);
            stderr.push('\n');
        }
        self.job_stderr.insert(job.get(), stderr);
        self.try_cache_upload(job)?;

        // audit + wake every request that cares
        let reqs: Vec<ReqIdx> = self
            .reqs
            .values()
            .filter(|r| r.job_ri.contains_key(&job))
            .map(|r| r.idx)
            .collect();
        let user_name = self.store.job_user_name(job)?;
        for req in reqs {
            {
                let r = self.req_mut(req);
                let line = if status.is_ok() {
                    format!("done  {} ({})", user_name, data.name)
                } else {
                    format!("failed {} ({}) : {status}", user_name, data.name)
                };
                r.audit(line);
                if let Some(jri) = r.job_ri.get_mut(&job) {
                    jri.lvl = JobLvl::End;
                }
            }
            self.work.push_back(Work::JobMake {
                job,
                req,
                action: RunAction::None,
                reason: local_reason,
                make: MakeAction::End,
            });
            self.update_eta(req);
        }
        Ok(())
    }

    /// Warn every request that already consumed this node.
    fn warn_clash(&mut self, node: NodeIdx) {
        for r in self.reqs.values_mut() {
            let saw_it = r
                .node_ri
                .get(&node)
                .is_some_and(|ri| ri.done_action.is_some());
            if saw_it && !r.clash_nodes.contains(&node) {
                r.clash_nodes.push(node);
            }
        }
    }

    /// Which tflags a written path gets from the rule, if declared at all.
    fn declared_tflags(
        &self,
        data: &RuleData,
        stems: &[(String, String)],
        path: &str,
    ) -> Result<Option<Tflags>> {
        for t in &data.targets {
            if t.star {
                let re_src = self.star_target_regex(data, t, stems);
                if let Ok(re) = regex::Regex::new(&re_src) {
                    if re.is_match(path) {
                        return Ok(Some(t.tflags));
                    }
                }
            } else if t.pattern.substitute(stems).as_deref() == Some(path) {
                return Ok(Some(t.tflags));
            }
        }
        Ok(None)
    }

    /// Refresh a node the way sources are refreshed (stat + rehash).
    fn refresh_src_like(&mut self, node: NodeIdx) -> Result<()> {
        self.refresh_src(node)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // forget
    // -----------------------------------------------------------------------

    /// Reset a job as if it had never run.
    ///
    /// Refused while any open request is using the job.
    pub fn job_forget(&mut self, job: JobIdx) -> Result<()> {
        if self.reqs.values().any(|r| r.job_ri.contains_key(&job)) {
            return Err(drover_error::DroverError::Config {
                detail: format!(
                    "cannot forget {}: a request is using it",
                    self.store.job_user_name(job)?
                ),
            });
        }
        let deps = self.store.job_deps(job)?;
        let static_only: Vec<Dep> = deps
            .into_iter()
            .filter(|d| d.dflags.contains(Dflags::STATIC))
            .collect();
        self.store.set_job_deps(job, &static_only)?;
        self.store.set_job_star_targets(job, &[])?;
        let mut jrec = self.store.job(job)?;
        jrec.status = Status::New;
        jrec.run_status = RunStatus::Complete;
        jrec.exec_gen = 0;
        self.store.job_put(job, &jrec)?;
        debug!(job = %job, "forgotten");
        Ok(())
    }
}
