//! Node state machine: buildability, rule-target matching, content
//! refresh and up-to-date checks.

use std::path::PathBuf;

use regex::Regex;
use tracing::debug;

use drover_error::{DroverError, Result};
use drover_store::depvec::{Dep, DepPayload};
use drover_store::rule::{RuleData, RulePattern, RuleTarget};
use drover_store::tables::ConformIdx;
use drover_types::{
    Accesses, Buildable, Crc, Ddate, Dflags, FileSig, FileTag, JobIdx, JobReason, Manual, NodeIdx,
    Pdate, ReqIdx, RunStatus,
};

use crate::engine::{Engine, Work};
use crate::reqinfo::{MakeAction, NodeAction, NodeReqInfo, Watcher};

/// Result of driving a node for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Done,
    Waiting,
}

/// A successful target pattern match.
#[derive(Debug, Clone)]
pub struct TargetMatch {
    /// Stem name to captured value.
    pub stems: Vec<(String, String)>,
    /// (position, length) of each stem capture in the node name, in order
    /// of first appearance in the pattern.
    pub spans: Vec<(u16, u16)>,
}

impl Engine {
    fn abs_path(&self, name: &str) -> PathBuf {
        self.config.root_dir.join(name)
    }

    // -----------------------------------------------------------------------
    // make
    // -----------------------------------------------------------------------

    /// Drive a node toward `action` for a request.
    ///
    /// On `Waiting` the node has registered itself on its producing job
    /// and will be re-entered; callers wanting a callback must push a
    /// watcher onto the node's ReqInfo.
    pub(crate) fn node_make(
        &mut self,
        node: NodeIdx,
        req: ReqIdx,
        action: NodeAction,
    ) -> Result<NodeOutcome> {
        // a re-entry while our frame is on the stack is a dependency
        // cycle; it reads as Waiting and the outer frame resolves it
        if !self.making_nodes.insert((req.0, node.get())) {
            return Ok(NodeOutcome::Waiting);
        }
        let out = self.node_make_inner(node, req, action);
        self.making_nodes.remove(&(req.0, node.get()));
        out
    }

    fn node_make_inner(
        &mut self,
        node: NodeIdx,
        req: ReqIdx,
        action: NodeAction,
    ) -> Result<NodeOutcome> {
        let mut ri = self
            .req_mut(req)
            .node_ri
            .remove(&node)
            .unwrap_or_default();
        ri.action = ri.action.max(action);
        let zombie = self.req(req).zombie;
        if zombie || ri.done_for(ri.action) {
            ri.done_action = Some(ri.action.max(ri.done_action.unwrap_or_default()));
            self.put_node_ri(req, node, ri);
            self.wake_node_watchers(node, req);
            return Ok(NodeOutcome::Done);
        }
        if ri.waiting() {
            self.put_node_ri(req, node, ri);
            return Ok(NodeOutcome::Waiting);
        }

        let buildable = self.set_buildable(node)?;
        if ri.action == NodeAction::Makable {
            return self.finish_node(node, req, ri);
        }
        if buildable.is_src_anti() {
            let modified = self.refresh_src(node)?;
            if modified && self.store.is_no_trigger(node) {
                self.req_mut(req).no_triggers.push(node);
            }
            let rec = self.store.node(node)?;
            if buildable == Buildable::Src && !rec.sig.exists() {
                ri.err = true; // a listed source must exist
            }
            let conform = match buildable {
                Buildable::Src | Buildable::SubSrc => ConformIdx::Src,
                _ => ConformIdx::SrcDir,
            };
            let mut rec = rec;
            rec.conform = conform;
            self.store.node_put(node, &rec)?;
            return self.finish_node(node, req, ri);
        }
        if !buildable.is_buildable() {
            let mut rec = self.store.node(node)?;
            rec.conform = ConformIdx::None;
            self.store.node_put(node, &rec)?;
            return self.finish_node(node, req, ri);
        }
        // uphill: a node under a dir that exists as a file or link cannot
        // be written; writes are dangling until the dir is remade
        {
            let rec = self.store.node(node)?;
            if let Some(dir) = NodeIdx::new(rec.dir) {
                let dir_name = self.store.node_name(dir)?;
                let dir_sig = FileSig::of(&self.abs_path(&dir_name));
                if matches!(dir_sig.tag, FileTag::Reg | FileTag::Exe | FileTag::Lnk) {
                    let mut rec = rec;
                    rec.conform = ConformIdx::Transcient;
                    self.store.node_put(node, &rec)?;
                    ri.err = true;
                    return self.finish_node(node, req, ri);
                }
            }
        }

        // candidate producing jobs, decreasing priority
        let tgts = self.store.node_job_tgts(node)?;
        while ri.prio_idx < tgts.len() {
            let job = tgts[ri.prio_idx];
            self.job_make(job, req, ri.action.job_action(), JobReason::NONE, MakeAction::None)?;
            let done = self
                .req(req)
                .job_ri
                .get(&job)
                .is_some_and(|jri| jri.done_for(ri.action.job_action()));
            if !done {
                self.req_mut(req)
                    .job_ri
                    .entry(job)
                    .or_default()
                    .watchers
                    .push(Watcher::Node(node));
                ri.n_wait += 1;
                self.put_node_ri(req, node, ri);
                return Ok(NodeOutcome::Waiting);
            }
            let jrec = self.store.job(job)?;
            if matches!(jrec.run_status, RunStatus::NoDep | RunStatus::NoFile) {
                // candidate does not apply; try the next one lazily
                ri.prio_idx += 1;
                continue;
            }
            let mut rec = self.store.node(node)?;
            rec.conform = ConformIdx::JobTgt(u32::try_from(ri.prio_idx).unwrap_or(u32::MAX));
            self.store.node_put(node, &rec)?;
            ri.err = jrec.status.is_err() || jrec.run_status.is_err();
            return self.finish_node(node, req, ri);
        }
        // every candidate refused the node
        let mut rec = self.store.node(node)?;
        rec.conform = ConformIdx::None;
        rec.buildable = Buildable::No;
        self.store.node_put(node, &rec)?;
        self.finish_node(node, req, ri)
    }

    fn finish_node(
        &mut self,
        node: NodeIdx,
        req: ReqIdx,
        mut ri: NodeReqInfo,
    ) -> Result<NodeOutcome> {
        ri.done_action = Some(ri.action.max(ri.done_action.unwrap_or_default()));
        self.put_node_ri(req, node, ri);
        self.wake_node_watchers(node, req);
        Ok(NodeOutcome::Done)
    }

    /// Walk and drain the node's watcher list.
    pub(crate) fn wake_node_watchers(&mut self, node: NodeIdx, req: ReqIdx) {
        let watchers = {
            let r = self.req_mut(req);
            match r.node_ri.get_mut(&node) {
                Some(ri) => std::mem::take(&mut ri.watchers),
                None => return,
            }
        };
        for w in watchers {
            match w {
                Watcher::Job(job) => {
                    let r = self.req_mut(req);
                    if let Some(jri) = r.job_ri.get_mut(&job) {
                        jri.n_wait = jri.n_wait.saturating_sub(1);
                    }
                    self.work.push_back(Work::JobMake {
                        job,
                        req,
                        action: crate::reqinfo::RunAction::None,
                        reason: JobReason::NONE,
                        make: MakeAction::Wakeup,
                    });
                }
                Watcher::Node(_) => {
                    debug!("node watcher on node ignored");
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
    // buildability
    // -----------------------------------------------------------------------

    /// Lazily classify a node, creating candidate jobs as a side effect.
    ///
    /// Valid until the global match generation moves.
    pub(crate) fn set_buildable(&mut self, node: NodeIdx) -> Result<Buildable> {
        let gen = self.store.match_gen();
        let rec = self.store.node(node)?;
        if rec.match_gen == gen && rec.buildable.is_decided() {
            return Ok(rec.buildable);
        }
        if !self.visiting.insert(node.get()) {
            return Ok(Buildable::Loop); // resolved by the outer frame
        }
        let name = self.store.node_name(node)?;
        let result = self.compute_buildable(node, &name);
        self.visiting.remove(&node.get());
        let buildable = result?;
        let mut rec = self.store.node(node)?;
        rec.buildable = buildable;
        rec.match_gen = gen;
        self.store.node_put(node, &rec)?;
        debug!(name, ?buildable, "buildability decided");
        Ok(buildable)
    }

    fn compute_buildable(&mut self, node: NodeIdx, name: &str) -> Result<Buildable> {
        use drover_store::SrcKind;
        if name.len() > self.config.max_node_name {
            return Ok(Buildable::LongName);
        }
        match self.store.src_kind(name) {
            SrcKind::File => return Ok(Buildable::Src),
            SrcKind::Dir => return Ok(Buildable::SrcDir),
            SrcKind::UnderFile => return Ok(Buildable::SubSrc),
            SrcKind::UnderDir => return Ok(Buildable::SubSrcDir),
            SrcKind::No => {}
        }
        let cands = self.store.candidates(name);
        let n_cands = cands.len();
        // a node left at Maybe keeps its explored candidates in job_tgts
        // and the unexplored tail position in rule_tgts_pos: resume there
        // instead of rescanning the whole candidate list
        let rec = self.store.node(node)?;
        let resume =
            rec.match_gen == self.store.match_gen() && rec.buildable == Buildable::Maybe;
        let (mut jobs, start) = if resume {
            (
                self.store.node_job_tgts(node)?,
                (rec.rule_tgts_pos as usize).min(n_cands),
            )
        } else {
            (Vec::new(), 0)
        };
        let mut consumed = start;
        let mut overall = if jobs.is_empty() {
            Buildable::No
        } else {
            Buildable::Maybe
        };
        for cand in cands.into_iter().skip(start) {
            consumed += 1;
            let data = self.store.rule_data(cand.rule)?;
            let Some(target) = data.targets.get(cand.tgt_idx).cloned() else {
                continue;
            };
            let Some(m) = self.match_target(cand.rule, cand.tgt_idx, &data, &target, name)?
            else {
                continue;
            };
            if data.is_anti {
                return Ok(Buildable::Anti);
            }
            let (job, created) = self.store.job_at(cand.rule, name, &m.spans)?;
            if created {
                debug!(name, rule = %data.name, "job materialized");
            }
            // a candidate is definite only if its static deps are buildable
            let mut applies = true;
            let mut maybe = false;
            let mut static_deps: Vec<Dep> = Vec::with_capacity(data.deps.len());
            for dep in &data.deps {
                let Some(dep_path) = dep.pattern.substitute(&m.stems) else {
                    applies = false;
                    break;
                };
                let dep_node = self.store.node_at(&dep_path)?;
                static_deps.push(Dep {
                    node: dep_node,
                    dflags: dep.dflags | Dflags::STATIC,
                    accesses: Accesses::empty(),
                    payload: DepPayload::Date {
                        date: Ddate::NONE,
                        sig: FileSig::default(),
                    },
                    parallel: false,
                });
                match self.set_buildable(dep_node)? {
                    Buildable::Anti | Buildable::No | Buildable::LongName => {
                        applies = false;
                        break;
                    }
                    Buildable::Maybe | Buildable::Unknown | Buildable::Loop => maybe = true,
                    _ => {}
                }
            }
            if created {
                // a fresh job starts its life with the rule's static deps
                self.store.set_job_deps(job, &static_deps)?;
            }
            if !applies {
                continue;
            }
            jobs.push(job);
            if maybe {
                if overall == Buildable::No {
                    overall = Buildable::Maybe;
                }
                // keep the tail of candidates for lazy re-evaluation
                continue;
            }
            overall = Buildable::Yes;
            break;
        }
        self.store.set_node_job_tgts(node, &jobs)?;
        // remember how far matching got; the unexplored tail is retried
        // lazily if the chosen candidates fall through
        let mut rec = self.store.node(node)?;
        rec.rule_tgts_pos = u32::try_from(consumed.min(n_cands)).unwrap_or(u32::MAX);
        self.store.node_put(node, &rec)?;
        Ok(overall)
    }

    // -----------------------------------------------------------------------
    // pattern matching
    // -----------------------------------------------------------------------

    fn target_regex(
        &self,
        rule_raw: u32,
        tgt_idx: usize,
        data: &RuleData,
        pattern: &RulePattern,
    ) -> Result<Regex> {
        {
            let cache = self.regex_cache.lock();
            if let Some(re) = cache.get(&(rule_raw, tgt_idx)) {
                return Ok(re.clone());
            }
        }
        let re = Self::compile_target_regex(data, pattern)?;
        self.regex_cache
            .lock()
            .insert((rule_raw, tgt_idx), re.clone());
        Ok(re)
    }

    /// Build the anchored regex of a target pattern: literals escaped,
    /// stems as named groups.
    fn compile_target_regex(data: &RuleData, pattern: &RulePattern) -> Result<Regex> {
        let mut src = String::from("^");
        let mut rest = pattern.pattern.as_str();
        let mut seen: Vec<String> = Vec::new();
        while let Some(open) = rest.find('{') {
            src.push_str(&regex::escape(&rest[..open]));
            let close = rest[open..]
                .find('}')
                .ok_or_else(|| DroverError::BadPattern {
                    rule: data.name.clone(),
                    pattern: pattern.pattern.clone(),
                    detail: "unterminated stem reference".to_owned(),
                })?
                + open;
            let stem = &rest[open + 1..close];
            let stem_re = data
                .stems
                .iter()
                .find(|(n, _)| n == stem)
                .map_or("[^/]+", |(_, re)| re.as_str());
            let n_prev = seen.iter().filter(|s| s.as_str() == stem).count();
            // the regex engine has no back-references: repeated stems get
            // numbered groups, verified equal after the match
            src.push_str(&format!("(?P<{stem}_{n_prev}>{stem_re})"));
            seen.push(stem.to_owned());
            rest = &rest[close + 1..];
        }
        src.push_str(&regex::escape(rest));
        src.push('$');
        Regex::new(&src).map_err(|e| DroverError::BadPattern {
            rule: data.name.clone(),
            pattern: pattern.pattern.clone(),
            detail: e.to_string(),
        })
    }

    /// Match a node name against one rule target, binding stems.
    pub(crate) fn match_target(
        &self,
        rule: drover_types::RuleIdx,
        tgt_idx: usize,
        data: &RuleData,
        target: &RuleTarget,
        name: &str,
    ) -> Result<Option<TargetMatch>> {
        let re = self.target_regex(rule.get(), tgt_idx, data, &target.pattern)?;
        let Some(caps) = re.captures(name) else {
            return Ok(None);
        };
        let mut stems: Vec<(String, String)> = Vec::new();
        let mut spans: Vec<(u16, u16)> = Vec::new();
        for stem in target.pattern.stem_refs() {
            let n_prev = stems.iter().filter(|(n, _)| n == stem).count();
            let group = format!("{stem}_{n_prev}");
            let Some(cap) = caps.name(&group) else {
                continue;
            };
            if let Some((_, first)) = stems.iter().find(|(n, _)| n == stem) {
                if first != cap.as_str() {
                    return Ok(None); // repeated stem bound inconsistently
                }
                continue;
            }
            stems.push((stem.to_owned(), cap.as_str().to_owned()));
            spans.push((
                u16::try_from(cap.start()).unwrap_or(u16::MAX),
                u16::try_from(cap.len()).unwrap_or(u16::MAX),
            ));
        }
        Ok(Some(TargetMatch { stems, spans }))
    }

    /// Stems-only wrapper used by diagnostics (uncached).
    pub(crate) fn pattern_matches(
        &self,
        data: &RuleData,
        target: &RuleTarget,
        name: &str,
    ) -> Result<Option<Vec<(String, String)>>> {
        let re = Self::compile_target_regex(data, &target.pattern)?;
        let Some(caps) = re.captures(name) else {
            return Ok(None);
        };
        let mut stems: Vec<(String, String)> = Vec::new();
        for stem in target.pattern.stem_refs() {
            if stems.iter().any(|(n, _)| n == stem) {
                continue;
            }
            if let Some(cap) = caps.name(&format!("{stem}_0")) {
                stems.push((stem.to_owned(), cap.as_str().to_owned()));
            }
        }
        Ok(Some(stems))
    }

    // -----------------------------------------------------------------------
    // content refresh and up-to-date checks
    // -----------------------------------------------------------------------

    /// Record a new content observation for a node.
    ///
    /// Only the engine thread writes the store, so no further locking is
    /// needed here. Returns whether the content actually changed.
    pub(crate) fn node_refresh(
        &mut self,
        node: NodeIdx,
        crc: Crc,
        date: Pdate,
        sig: FileSig,
        actual_job: Option<JobIdx>,
    ) -> Result<bool> {
        let mut rec = self.store.node(node)?;
        let modified = rec.crc != crc || !rec.crc.is_reliable();
        rec.crc = crc;
        rec.date = date;
        rec.sig = sig;
        if let Some(job) = actual_job {
            rec.actual_job = job.get();
        }
        self.store.node_put(node, &rec)?;
        Ok(modified)
    }

    /// Stat a source-ish node and rehash if its signature moved.
    pub(crate) fn refresh_src(&mut self, node: NodeIdx) -> Result<bool> {
        let name = self.store.node_name(node)?;
        let abs = self.abs_path(&name);
        let sig = FileSig::of(&abs);
        let rec = self.store.node(node)?;
        if sig == rec.sig && rec.crc.is_reliable() {
            return Ok(false);
        }
        let crc = if sig.exists() {
            Crc::of_file(&abs)
        } else {
            Crc::None
        };
        self.node_refresh(node, crc, Pdate::now(), sig, None)
    }

    /// Classify the on-disk state of a node against its recorded signature.
    pub(crate) fn node_manual(&self, node: NodeIdx) -> Result<Manual> {
        let name = self.store.node_name(node)?;
        let rec = self.store.node(node)?;
        let sig = FileSig::of(&self.abs_path(&name));
        Ok(if sig == rec.sig {
            Manual::Ok
        } else if !sig.exists() {
            Manual::Unlnked
        } else if sig.size == 0 && matches!(sig.tag, FileTag::Reg | FileTag::Exe) {
            Manual::Empty
        } else {
            Manual::Modif
        })
    }

    /// Whether a recorded dep still reflects the node's live content.
    ///
    /// With `full`, every access kind is considered; otherwise only the
    /// accesses the dep actually performed.
    pub(crate) fn dep_up_to_date(&self, dep: &Dep, full: bool) -> Result<bool> {
        let rec = self.store.node(dep.node)?;
        match dep.payload {
            DepPayload::Crc(crc) => {
                let accesses = if full { Accesses::all() } else { dep.accesses };
                Ok(crc.matches(rec.crc, accesses))
            }
            DepPayload::Date { date, sig } => {
                // date payloads are conservative: any later observation of
                // different stat identity counts as a modification
                if sig == FileSig::default() {
                    Ok(rec.sig.mtime == date)
                } else {
                    Ok(rec.sig == sig)
                }
            }
        }
    }
}
