//! Persistent, memory-mapped graph store.
//!
//! Nine mapped files share one version marker: jobs, nodes, rules, the
//! name trie, the rule-target records, and four vector heaps (deps, star
//! targets, job-tgt lists, rule strings). The store is single-writer at
//! process granularity; all mutation funnels through `&mut Store` on the
//! engine thread. Nodes and jobs are created on first reference and only
//! reclaimed by an explicit invalidation sweep.

pub mod depvec;
pub mod jobname;
pub mod mapfile;
pub mod nametrie;
pub mod recfile;
pub mod rule;
pub mod ruletgts;
pub mod tables;
pub mod vecfile;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use drover_error::{DroverError, Result};
use drover_types::{Crunch, JobIdx, NameId, NodeIdx, RuleIdx, Tflags, VecIdx};

use depvec::{Dep, TargetEntry, decode_deps, decode_ids, decode_targets, encode_deps, encode_ids,
    encode_targets};
use jobname::{JobNameParts, job_full_name, split_job_name};
use nametrie::NameTrie;
use recfile::RecFile;
use rule::{RuleData, RuleRecord};
use ruletgts::{RuleTgt, RuleTgtIndex, RuleTgtRec};
use tables::{JobRecord, NodeRecord};

pub use mapfile::STORE_VERSION;

const MAGIC_JOBS: u32 = u32::from_le_bytes(*b"DVjb");
const MAGIC_NODES: u32 = u32::from_le_bytes(*b"DVnd");
const MAGIC_RULES: u32 = u32::from_le_bytes(*b"DVrl");
const MAGIC_NAMES: u32 = u32::from_le_bytes(*b"DVnm");
const MAGIC_DEPS: u32 = u32::from_le_bytes(*b"DVdp");
const MAGIC_TGTS: u32 = u32::from_le_bytes(*b"DVtg");
const MAGIC_JOB_TGTS: u32 = u32::from_le_bytes(*b"DVjt");
const MAGIC_RULE_STRS: u32 = u32::from_le_bytes(*b"DVrs");
const MAGIC_RULE_TGTS: u32 = u32::from_le_bytes(*b"DVrt");

/// Persistent override sets carried in the job file header.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct JobSets {
    frozen: Vec<u32>,
}

/// Persistent source and override sets carried in the node file header.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct NodeSets {
    srcs: Vec<String>,
    /// Dirs, stored with a trailing `/`.
    src_dirs: Vec<String>,
    frozen: Vec<u32>,
    manual_ok: Vec<u32>,
    no_trigger: Vec<u32>,
}

/// How a path relates to the declared sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrcKind {
    /// Not a source.
    No,
    /// Listed source file.
    File,
    /// Listed source dir itself.
    Dir,
    /// Lies under a listed source dir.
    UnderDir,
    /// Lies under a listed source file (cannot exist as a file).
    UnderFile,
}

pub struct Store {
    dir: PathBuf,
    pub jobs: RecFile<JobRecord>,
    pub nodes: RecFile<NodeRecord>,
    pub rules: RecFile<RuleRecord>,
    pub names: NameTrie,
    pub deps: vecfile::VecFile,
    pub tgts: vecfile::VecFile,
    pub job_tgt_vecs: vecfile::VecFile,
    pub rule_strs: vecfile::VecFile,
    pub rule_tgt_recs: RecFile<RuleTgtRec>,

    tgt_index: RuleTgtIndex,
    name_to_node: HashMap<NameId, NodeIdx>,
    name_to_job: HashMap<NameId, JobIdx>,

    frozen_jobs: HashSet<u32>,
    srcs: HashSet<String>,
    src_dirs: Vec<String>,
    frozen_nodes: HashSet<u32>,
    manual_ok_nodes: HashSet<u32>,
    no_trigger_nodes: HashSet<u32>,
}

impl Store {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let jobs = RecFile::open(&dir.join("jobs"), MAGIC_JOBS)?;
        let nodes = RecFile::open(&dir.join("nodes"), MAGIC_NODES)?;
        let rules = RecFile::open(&dir.join("rules"), MAGIC_RULES)?;
        let names = NameTrie::open(&dir.join("names"), MAGIC_NAMES)?;
        let deps = vecfile::VecFile::open(&dir.join("deps"), MAGIC_DEPS)?;
        let tgts = vecfile::VecFile::open(&dir.join("star_targets"), MAGIC_TGTS)?;
        let job_tgt_vecs = vecfile::VecFile::open(&dir.join("job_tgts"), MAGIC_JOB_TGTS)?;
        let rule_strs = vecfile::VecFile::open(&dir.join("rule_strs"), MAGIC_RULE_STRS)?;
        let rule_tgt_recs = RecFile::open(&dir.join("rule_tgts"), MAGIC_RULE_TGTS)?;

        let mut this = Self {
            dir: dir.to_path_buf(),
            jobs,
            nodes,
            rules,
            names,
            deps,
            tgts,
            job_tgt_vecs,
            rule_strs,
            rule_tgt_recs,
            tgt_index: RuleTgtIndex::default(),
            name_to_node: HashMap::new(),
            name_to_job: HashMap::new(),
            frozen_jobs: HashSet::new(),
            srcs: HashSet::new(),
            src_dirs: Vec::new(),
            frozen_nodes: HashSet::new(),
            manual_ok_nodes: HashSet::new(),
            no_trigger_nodes: HashSet::new(),
        };

        if this.rules.aux() == 0 {
            this.rules.set_aux(1); // match generation starts at 1 so 0 is always stale
        }
        this.load_sets()?;
        this.rebuild_maps()?;
        this.rebuild_tgt_index()?;
        debug!(
            dir = %dir.display(),
            n_jobs = this.jobs.n_slots(),
            n_nodes = this.nodes.n_slots(),
            n_rules = this.rules.n_slots(),
            "store opened"
        );
        Ok(this)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_sets(&mut self) -> Result<()> {
        let jb = self.jobs.blob();
        if !jb.is_empty() {
            let sets: JobSets = serde_json::from_slice(jb)
                .map_err(|e| self.jobs.corrupt(format!("bad job header sets: {e}")))?;
            self.frozen_jobs = sets.frozen.into_iter().collect();
        }
        let nb = self.nodes.blob();
        if !nb.is_empty() {
            let sets: NodeSets = serde_json::from_slice(nb)
                .map_err(|e| self.nodes.corrupt(format!("bad node header sets: {e}")))?;
            self.srcs = sets.srcs.into_iter().collect();
            self.src_dirs = sets.src_dirs;
            self.frozen_nodes = sets.frozen.into_iter().collect();
            self.manual_ok_nodes = sets.manual_ok.into_iter().collect();
            self.no_trigger_nodes = sets.no_trigger.into_iter().collect();
        }
        Ok(())
    }

    fn save_job_sets(&mut self) -> Result<()> {
        let mut frozen: Vec<u32> = self.frozen_jobs.iter().copied().collect();
        frozen.sort_unstable();
        let blob = serde_json::to_vec(&JobSets { frozen })
            .map_err(|e| self.jobs.corrupt(format!("cannot serialize job sets: {e}")))?;
        self.jobs.set_blob(&blob)
    }

    fn save_node_sets(&mut self) -> Result<()> {
        let mut srcs: Vec<String> = self.srcs.iter().cloned().collect();
        srcs.sort_unstable();
        let mut frozen: Vec<u32> = self.frozen_nodes.iter().copied().collect();
        frozen.sort_unstable();
        let mut manual_ok: Vec<u32> = self.manual_ok_nodes.iter().copied().collect();
        manual_ok.sort_unstable();
        let mut no_trigger: Vec<u32> = self.no_trigger_nodes.iter().copied().collect();
        no_trigger.sort_unstable();
        let blob = serde_json::to_vec(&NodeSets {
            srcs,
            src_dirs: self.src_dirs.clone(),
            frozen,
            manual_ok,
            no_trigger,
        })
        .map_err(|e| self.nodes.corrupt(format!("cannot serialize node sets: {e}")))?;
        self.nodes.set_blob(&blob)
    }

    fn rebuild_maps(&mut self) -> Result<()> {
        self.name_to_node.clear();
        self.name_to_job.clear();
        for (idx, rec) in self.nodes.iter_live() {
            let (Some(name), Some(node)) = (NameId::new(rec.name), NodeIdx::new(idx)) else {
                warn!(idx, "node record with unusable name id, skipping");
                continue;
            };
            self.name_to_node.insert(name, node);
        }
        for (idx, rec) in self.jobs.iter_live() {
            let (Some(name), Some(job)) = (NameId::new(rec.name), JobIdx::new(idx)) else {
                warn!(idx, "job record with unusable name id, skipping");
                continue;
            };
            self.name_to_job.insert(name, job);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    /// Current global match generation. Node match caches tagged with an
    /// older generation are stale.
    #[must_use]
    pub fn match_gen(&self) -> u32 {
        u32::try_from(self.rules.aux()).unwrap_or(u32::MAX)
    }

    /// Lazily invalidate every node's cached matches.
    pub fn bump_match_gen(&mut self) {
        let next = u64::from(self.match_gen()) + 1;
        self.rules.set_aux(next);
        debug!(match_gen = next, "match generation bumped");
    }

    /// Next value of the global monotonic sequence id.
    pub fn next_seq_id(&mut self) -> u64 {
        let next = self.jobs.aux() + 1;
        self.jobs.set_aux(next);
        next
    }

    pub fn add_rule(&mut self, data: &RuleData) -> Result<RuleIdx> {
        let blob = serde_json::to_vec(data)
            .map_err(|e| self.rules.corrupt(format!("cannot serialize rule: {e}")))?;
        let blob_idx = self.rule_strs.emplace(&blob)?;
        let raw = self.rules.emplace(&RuleRecord {
            data: blob_idx.get(),
            cmd_gen: 1,
            rsrcs_gen: 1,
            exec_time_ns: 0,
        })?;
        let rule = RuleIdx::new(raw).ok_or(DroverError::BadIndex {
            kind: "rule",
            idx: raw,
        })?;
        for (tgt_idx, _) in data.targets.iter().enumerate() {
            self.rule_tgt_recs.emplace(&RuleTgtRec {
                rule: raw,
                tgt_idx: u16::try_from(tgt_idx).unwrap_or(u16::MAX),
                prio: data.prio,
            })?;
        }
        self.rebuild_tgt_index()?;
        self.bump_match_gen();
        Ok(rule)
    }

    /// Replace a rule's body, advancing the generations its changes touch.
    pub fn update_rule(&mut self, rule: RuleIdx, data: &RuleData) -> Result<()> {
        let old = self.rule_data(rule)?;
        let mut rec = self.rules.get(rule.get())?;
        let cmd_changed = old.script != data.script || old.interpreter != data.interpreter;
        let rsrcs_changed = cmd_changed || old.rsrcs != data.rsrcs;
        if cmd_changed {
            rec.cmd_gen += 1;
        }
        if rsrcs_changed {
            rec.rsrcs_gen += 1;
        }
        let blob = serde_json::to_vec(data)
            .map_err(|e| self.rules.corrupt(format!("cannot serialize rule: {e}")))?;
        let old_idx = VecIdx::new(rec.data).ok_or(DroverError::BadIndex {
            kind: "rule blob",
            idx: rec.data,
        })?;
        rec.data = self.rule_strs.assign(old_idx, &blob)?.get();
        self.rules.put(rule.get(), &rec)?;
        self.rebuild_rule_tgt_recs()?;
        self.rebuild_tgt_index()?;
        self.bump_match_gen();
        Ok(())
    }

    fn rebuild_rule_tgt_recs(&mut self) -> Result<()> {
        let live: Vec<u32> = self.rule_tgt_recs.iter_live().map(|(i, _)| i).collect();
        for idx in live {
            self.rule_tgt_recs.free(idx)?;
        }
        let rules: Vec<(u32, RuleData)> = self
            .rules
            .iter_live()
            .map(|(raw, _)| {
                let rule = RuleIdx::new(raw).expect("live rule index fits guard budget");
                self.rule_data(rule).map(|d| (raw, d))
            })
            .collect::<Result<_>>()?;
        for (raw, data) in rules {
            for (tgt_idx, _) in data.targets.iter().enumerate() {
                self.rule_tgt_recs.emplace(&RuleTgtRec {
                    rule: raw,
                    tgt_idx: u16::try_from(tgt_idx).unwrap_or(u16::MAX),
                    prio: data.prio,
                })?;
            }
        }
        Ok(())
    }

    fn rebuild_tgt_index(&mut self) -> Result<()> {
        let mut entries = Vec::new();
        for (_, rec) in self.rule_tgt_recs.iter_live() {
            let Some(rule) = RuleIdx::new(rec.rule) else {
                continue;
            };
            let data = self.rule_data(rule)?;
            let Some(target) = data.targets.get(rec.tgt_idx as usize) else {
                return Err(self
                    .rule_tgt_recs
                    .corrupt(format!("rule {rule} has no target {}", rec.tgt_idx)));
            };
            // a stem-less pattern is all prefix; giving it the same text
            // as suffix would double-count its length in the frame fit
            let suffix = if target.pattern.has_stems() {
                target.pattern.fixed_suffix().to_owned()
            } else {
                String::new()
            };
            entries.push(RuleTgt {
                rule,
                tgt_idx: rec.tgt_idx as usize,
                prefix: target.pattern.fixed_prefix().to_owned(),
                suffix,
                prio: rec.prio,
                is_anti: data.is_anti,
            });
        }
        self.tgt_index.rebuild(entries);
        Ok(())
    }

    pub fn rule_data(&self, rule: RuleIdx) -> Result<RuleData> {
        let rec = self.rules.get(rule.get())?;
        let idx = VecIdx::new(rec.data).ok_or(DroverError::BadIndex {
            kind: "rule blob",
            idx: rec.data,
        })?;
        serde_json::from_slice(self.rule_strs.get(idx)?)
            .map_err(|e| self.rules.corrupt(format!("bad rule body: {e}")))
    }

    pub fn rule_rec(&self, rule: RuleIdx) -> Result<RuleRecord> {
        self.rules.get(rule.get())
    }

    pub fn rule_put(&mut self, rule: RuleIdx, rec: &RuleRecord) -> Result<()> {
        self.rules.put(rule.get(), rec)
    }

    /// Rule-target candidates framing `name`, by descending priority.
    #[must_use]
    pub fn candidates(&self, name: &str) -> Vec<RuleTgt> {
        self.tgt_index.candidates(name)
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// Get or create the node for a canonical path, creating its dir chain.
    pub fn node_at(&mut self, path: &str) -> Result<NodeIdx> {
        let name = self.names.insert(path.as_bytes())?;
        if let Some(&idx) = self.name_to_node.get(&name) {
            return Ok(idx);
        }
        let dir_raw = match path.rfind('/') {
            Some(0) | None => 0,
            Some(i) => self.node_at(&path[..i])?.get(),
        };
        let raw = self.nodes.emplace(&NodeRecord::new(name.get(), dir_raw))?;
        let idx = NodeIdx::new(raw).ok_or(DroverError::BadIndex {
            kind: "node",
            idx: raw,
        })?;
        self.name_to_node.insert(name, idx);
        Ok(idx)
    }

    /// Look a node up without creating it.
    pub fn node_idx(&self, path: &str) -> Result<Option<NodeIdx>> {
        Ok(self
            .names
            .lookup(path.as_bytes())?
            .and_then(|name| self.name_to_node.get(&name).copied()))
    }

    pub fn node(&self, idx: NodeIdx) -> Result<NodeRecord> {
        self.nodes.get(idx.get())
    }

    pub fn node_put(&mut self, idx: NodeIdx, rec: &NodeRecord) -> Result<()> {
        self.nodes.put(idx.get(), rec)
    }

    pub fn node_name(&self, idx: NodeIdx) -> Result<String> {
        let rec = self.nodes.get(idx.get())?;
        let name = NameId::new(rec.name).ok_or(DroverError::BadIndex {
            kind: "name",
            idx: rec.name,
        })?;
        Ok(String::from_utf8_lossy(&self.names.name_of(name)?).into_owned())
    }

    /// All node indexes currently live.
    pub fn all_nodes(&self) -> Vec<NodeIdx> {
        self.nodes
            .iter_live()
            .filter_map(|(raw, _)| NodeIdx::new(raw))
            .collect()
    }

    /// Candidate producing jobs of a node (decreasing priority).
    pub fn node_job_tgts(&self, idx: NodeIdx) -> Result<Vec<JobIdx>> {
        let rec = self.nodes.get(idx.get())?;
        match rec.job_tgts {
            Crunch::Empty => Ok(Vec::new()),
            Crunch::One(raw) => Ok(vec![JobIdx::new(raw).ok_or(DroverError::BadIndex {
                kind: "job",
                idx: raw,
            })?]),
            Crunch::Vec(v) => decode_ids(self.job_tgt_vecs.get(v)?)?
                .into_iter()
                .map(|raw| {
                    JobIdx::new(raw).ok_or(DroverError::BadIndex {
                        kind: "job",
                        idx: raw,
                    })
                })
                .collect(),
        }
    }

    pub fn set_node_job_tgts(&mut self, idx: NodeIdx, jobs: &[JobIdx]) -> Result<()> {
        let mut rec = self.nodes.get(idx.get())?;
        if let Crunch::Vec(old) = rec.job_tgts {
            self.job_tgt_vecs.pop(old)?;
        }
        rec.job_tgts = match jobs {
            [] => Crunch::Empty,
            [one] => Crunch::One(one.get()),
            many => {
                let raws: Vec<u32> = many.iter().map(|j| j.get()).collect();
                Crunch::Vec(self.job_tgt_vecs.emplace(&encode_ids(&raws))?)
            }
        };
        self.nodes.put(idx.get(), &rec)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Get or create the job binding `rule` to the target matched at
    /// `target_name` with the given stem spans.
    pub fn job_at(
        &mut self,
        rule: RuleIdx,
        target_name: &str,
        spans: &[(u16, u16)],
    ) -> Result<(JobIdx, bool)> {
        let full = job_full_name(target_name, rule, spans);
        let name = self.names.insert(&full)?;
        if let Some(&idx) = self.name_to_job.get(&name) {
            return Ok((idx, false));
        }
        let raw = self.jobs.emplace(&JobRecord::new(rule.get(), name.get()))?;
        let idx = JobIdx::new(raw).ok_or(DroverError::BadIndex {
            kind: "job",
            idx: raw,
        })?;
        self.name_to_job.insert(name, idx);
        Ok((idx, true))
    }

    pub fn job(&self, idx: JobIdx) -> Result<JobRecord> {
        self.jobs.get(idx.get())
    }

    pub fn job_put(&mut self, idx: JobIdx, rec: &JobRecord) -> Result<()> {
        self.jobs.put(idx.get(), rec)
    }

    pub fn job_rule(&self, idx: JobIdx) -> Result<RuleIdx> {
        let rec = self.jobs.get(idx.get())?;
        RuleIdx::new(rec.rule).ok_or(DroverError::BadIndex {
            kind: "rule",
            idx: rec.rule,
        })
    }

    pub fn job_name_parts(&self, idx: JobIdx) -> Result<JobNameParts> {
        let rec = self.jobs.get(idx.get())?;
        let name = NameId::new(rec.name).ok_or(DroverError::BadIndex {
            kind: "name",
            idx: rec.name,
        })?;
        split_job_name(&self.names.name_of(name)?)
    }

    /// User-visible job name (the matched target).
    pub fn job_user_name(&self, idx: JobIdx) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.job_name_parts(idx)?.prefix).into_owned())
    }

    pub fn job_deps(&self, idx: JobIdx) -> Result<Vec<Dep>> {
        let rec = self.jobs.get(idx.get())?;
        match VecIdx::new(rec.deps) {
            None => Ok(Vec::new()),
            Some(v) => decode_deps(self.deps.get(v)?),
        }
    }

    /// Replace a job's dep vector wholesale.
    pub fn set_job_deps(&mut self, idx: JobIdx, deps_new: &[Dep]) -> Result<()> {
        let mut rec = self.jobs.get(idx.get())?;
        let bytes = encode_deps(deps_new);
        rec.deps = match (VecIdx::new(rec.deps), bytes.is_empty()) {
            (None, true) => 0,
            (None, false) => self.deps.emplace(&bytes)?.get(),
            (Some(old), true) => {
                self.deps.pop(old)?;
                0
            }
            (Some(old), false) => self.deps.assign(old, &bytes)?.get(),
        };
        self.jobs.put(idx.get(), &rec)
    }

    /// Keep only the first `keep` deps (critical pruning).
    pub fn shorten_job_deps(&mut self, idx: JobIdx, keep: usize) -> Result<()> {
        let mut deps_cur = self.job_deps(idx)?;
        if keep < deps_cur.len() {
            deps_cur.truncate(keep);
            self.set_job_deps(idx, &deps_cur)?;
        }
        Ok(())
    }

    pub fn job_star_targets(&self, idx: JobIdx) -> Result<Vec<TargetEntry>> {
        let rec = self.jobs.get(idx.get())?;
        match rec.star_targets {
            Crunch::Empty => Ok(Vec::new()),
            Crunch::One(raw) => Ok(vec![TargetEntry {
                node: NodeIdx::new(raw).ok_or(DroverError::BadIndex {
                    kind: "node",
                    idx: raw,
                })?,
                tflags: Tflags::TARGET,
            }]),
            Crunch::Vec(v) => decode_targets(self.tgts.get(v)?),
        }
    }

    pub fn set_job_star_targets(&mut self, idx: JobIdx, targets: &[TargetEntry]) -> Result<()> {
        let mut rec = self.jobs.get(idx.get())?;
        if let Crunch::Vec(old) = rec.star_targets {
            self.tgts.pop(old)?;
        }
        rec.star_targets = match targets {
            [] => Crunch::Empty,
            [one] if one.tflags == Tflags::TARGET => Crunch::One(one.node.get()),
            many => Crunch::Vec(self.tgts.emplace(&encode_targets(many))?),
        };
        self.jobs.put(idx.get(), &rec)
    }

    // -----------------------------------------------------------------------
    // Sources and override sets
    // -----------------------------------------------------------------------

    /// Declare the source files and source dirs (dirs end with `/`).
    pub fn set_sources(&mut self, srcs: Vec<String>, src_dirs: Vec<String>) -> Result<()> {
        debug_assert!(src_dirs.iter().all(|d| d.ends_with('/')));
        self.srcs = srcs.into_iter().collect();
        self.src_dirs = src_dirs;
        self.save_node_sets()?;
        self.bump_match_gen();
        Ok(())
    }

    /// Classify a path against the declared sources.
    #[must_use]
    pub fn src_kind(&self, path: &str) -> SrcKind {
        if self.srcs.contains(path) {
            return SrcKind::File;
        }
        for src in &self.srcs {
            if path.len() > src.len() && path.starts_with(src) && path.as_bytes()[src.len()] == b'/'
            {
                return SrcKind::UnderFile;
            }
        }
        for dir in &self.src_dirs {
            let bare = &dir[..dir.len() - 1];
            if path == bare {
                return SrcKind::Dir;
            }
            if path.starts_with(dir.as_str()) {
                return SrcKind::UnderDir;
            }
        }
        SrcKind::No
    }

    #[must_use]
    pub fn is_frozen_job(&self, idx: JobIdx) -> bool {
        self.frozen_jobs.contains(&idx.get())
    }

    pub fn set_frozen_job(&mut self, idx: JobIdx, frozen: bool) -> Result<()> {
        let changed = if frozen {
            self.frozen_jobs.insert(idx.get())
        } else {
            self.frozen_jobs.remove(&idx.get())
        };
        if changed {
            self.save_job_sets()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_frozen_node(&self, idx: NodeIdx) -> bool {
        self.frozen_nodes.contains(&idx.get())
    }

    pub fn set_frozen_node(&mut self, idx: NodeIdx, frozen: bool) -> Result<()> {
        let changed = if frozen {
            self.frozen_nodes.insert(idx.get())
        } else {
            self.frozen_nodes.remove(&idx.get())
        };
        if changed {
            self.save_node_sets()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_manual_ok(&self, idx: NodeIdx) -> bool {
        self.manual_ok_nodes.contains(&idx.get())
    }

    pub fn set_manual_ok(&mut self, idx: NodeIdx, ok: bool) -> Result<()> {
        let changed = if ok {
            self.manual_ok_nodes.insert(idx.get())
        } else {
            self.manual_ok_nodes.remove(&idx.get())
        };
        if changed {
            self.save_node_sets()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_no_trigger(&self, idx: NodeIdx) -> bool {
        self.no_trigger_nodes.contains(&idx.get())
    }

    pub fn set_no_trigger(&mut self, idx: NodeIdx, no_trigger: bool) -> Result<()> {
        let changed = if no_trigger {
            self.no_trigger_nodes.insert(idx.get())
        } else {
            self.no_trigger_nodes.remove(&idx.get())
        };
        if changed {
            self.save_node_sets()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Whole-store operations
    // -----------------------------------------------------------------------

    /// Verify structural consistency of every file.
    pub fn chk(&self) -> Result<()> {
        self.jobs.chk()?;
        self.nodes.chk()?;
        self.rules.chk()?;
        self.names.chk()?;
        self.deps.chk()?;
        self.tgts.chk()?;
        self.job_tgt_vecs.chk()?;
        self.rule_strs.chk()?;
        self.rule_tgt_recs.chk()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.jobs.flush()?;
        self.nodes.flush()?;
        self.rules.flush()?;
        self.names.flush()?;
        self.deps.flush()?;
        self.tgts.flush()?;
        self.job_tgt_vecs.flush()?;
        self.rule_strs.flush()?;
        self.rule_tgt_recs.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_types::{Accesses, Crc, Dflags};

    use crate::depvec::DepPayload;
    use crate::rule::{RulePattern, RuleTarget};

    fn test_rule(name: &str, pattern: &str, prio: i32) -> RuleData {
        RuleData {
            name: name.to_owned(),
            prio,
            script: format!("make {pattern}"),
            interpreter: vec!["/bin/sh".to_owned(), "-c".to_owned()],
            stems: vec![("base".to_owned(), ".*".to_owned())],
            targets: vec![RuleTarget {
                key: "out".to_owned(),
                pattern: RulePattern::new(pattern),
                tflags: Tflags::TARGET | Tflags::STATIC,
                star: false,
            }],
            ..RuleData::default()
        }
    }

    #[test]
    fn test_node_creation_builds_dir_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = Store::open(dir.path()).expect("open");
        let idx = store.node_at("a/b/c").expect("node");
        let rec = store.node(idx).expect("rec");
        let parent = NodeIdx::new(rec.dir).expect("dir node");
        assert_eq!(store.node_name(parent).expect("name"), "a/b");
        let grand = NodeIdx::new(store.node(parent).expect("rec").dir).expect("dir node");
        assert_eq!(store.node_name(grand).expect("name"), "a");
        assert_eq!(store.node(grand).expect("rec").dir, 0);
        // same path resolves to the same node
        assert_eq!(store.node_at("a/b/c").expect("node"), idx);
    }

    #[test]
    fn test_rule_registration_and_candidates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = Store::open(dir.path()).expect("open");
        let gen0 = store.match_gen();
        let r1 = store.add_rule(&test_rule("cc", "{base}.o", 0)).expect("rule");
        let r2 = store
            .add_rule(&test_rule("cc-debug", "dbg/{base}.o", 5))
            .expect("rule");
        assert!(store.match_gen() > gen0);
        let c = store.candidates("dbg/x.o");
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].rule, r2);
        assert_eq!(c[1].rule, r1);
        assert_eq!(store.candidates("x.o").len(), 1);
    }

    #[test]
    fn test_update_rule_bumps_cmd_gen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = Store::open(dir.path()).expect("open");
        let r = store.add_rule(&test_rule("cc", "{base}.o", 0)).expect("rule");
        let mut data = store.rule_data(r).expect("data");
        data.script = "something else".to_owned();
        store.update_rule(r, &data).expect("update");
        let rec = store.rule_rec(r).expect("rec");
        assert_eq!(rec.cmd_gen, 2);
        assert_eq!(rec.rsrcs_gen, 2);
        // a resources-only change leaves cmd_gen alone
        let mut data2 = store.rule_data(r).expect("data");
        data2.rsrcs = vec![("mem".to_owned(), "1G".to_owned())];
        store.update_rule(r, &data2).expect("update");
        let rec = store.rule_rec(r).expect("rec");
        assert_eq!(rec.cmd_gen, 2);
        assert_eq!(rec.rsrcs_gen, 3);
    }

    #[test]
    fn test_job_identity_and_deps_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = Store::open(dir.path()).expect("open");
        let r = store.add_rule(&test_rule("cc", "{base}.o", 0)).expect("rule");
        let (job, created) = store.job_at(r, "x.o", &[(0, 1)]).expect("job");
        assert!(created);
        let (again, created2) = store.job_at(r, "x.o", &[(0, 1)]).expect("job");
        assert_eq!(job, again);
        assert!(!created2);
        assert_eq!(store.job_user_name(job).expect("name"), "x.o");

        let dep_node = store.node_at("x.c").expect("node");
        let deps_in = vec![Dep {
            node: dep_node,
            dflags: Dflags::empty(),
            accesses: Accesses::REG,
            payload: DepPayload::Crc(Crc::Reg(42)),
            parallel: false,
        }];
        store.set_job_deps(job, &deps_in).expect("set deps");
        assert_eq!(store.job_deps(job).expect("deps"), deps_in);
        store.shorten_job_deps(job, 0).expect("shorten");
        assert!(store.job_deps(job).expect("deps").is_empty());
    }

    #[test]
    fn test_star_targets_crunch_forms() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = Store::open(dir.path()).expect("open");
        let r = store.add_rule(&test_rule("cc", "{base}.o", 0)).expect("rule");
        let (job, _) = store.job_at(r, "x.o", &[]).expect("job");
        let n1 = store.node_at("x.lst").expect("node");
        let n2 = store.node_at("x.tmp").expect("node");

        // single default-flag target inlines
        let one = vec![TargetEntry {
            node: n1,
            tflags: Tflags::TARGET,
        }];
        store.set_job_star_targets(job, &one).expect("set");
        assert!(matches!(
            store.job(job).expect("rec").star_targets,
            Crunch::One(_)
        ));
        assert_eq!(store.job_star_targets(job).expect("get"), one);

        // several targets spill to the vector file
        let many = vec![
            TargetEntry {
                node: n1,
                tflags: Tflags::TARGET,
            },
            TargetEntry {
                node: n2,
                tflags: Tflags::TARGET | Tflags::INCREMENTAL,
            },
        ];
        store.set_job_star_targets(job, &many).expect("set");
        assert!(matches!(
            store.job(job).expect("rec").star_targets,
            Crunch::Vec(_)
        ));
        assert_eq!(store.job_star_targets(job).expect("get"), many);
    }

    #[test]
    fn test_src_kind_classification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = Store::open(dir.path()).expect("open");
        store
            .set_sources(
                vec!["Makefile".to_owned(), "src/main.c".to_owned()],
                vec!["vendor/".to_owned()],
            )
            .expect("sources");
        assert_eq!(store.src_kind("Makefile"), SrcKind::File);
        assert_eq!(store.src_kind("src/main.c"), SrcKind::File);
        assert_eq!(store.src_kind("src/main.c/impossible"), SrcKind::UnderFile);
        assert_eq!(store.src_kind("vendor"), SrcKind::Dir);
        assert_eq!(store.src_kind("vendor/zlib/z.c"), SrcKind::UnderDir);
        assert_eq!(store.src_kind("out/x.o"), SrcKind::No);
    }

    #[test]
    fn test_sets_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job;
        let node;
        {
            let mut store = Store::open(dir.path()).expect("open");
            let r = store.add_rule(&test_rule("cc", "{base}.o", 0)).expect("rule");
            let created = store.job_at(r, "x.o", &[]).expect("job");
            job = created.0;
            node = store.node_at("x.c").expect("node");
            store.set_frozen_job(job, true).expect("freeze");
            store.set_manual_ok(node, true).expect("manual ok");
            store.set_no_trigger(node, true).expect("no trigger");
            store.flush().expect("flush");
        }
        let store = Store::open(dir.path()).expect("reopen");
        assert!(store.is_frozen_job(job));
        assert!(store.is_manual_ok(node));
        assert!(store.is_no_trigger(node));
        store.chk().expect("consistent");
    }

    #[test]
    fn test_seq_id_is_monotonic_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let last;
        {
            let mut store = Store::open(dir.path()).expect("open");
            assert_eq!(store.next_seq_id(), 1);
            last = store.next_seq_id();
            store.flush().expect("flush");
        }
        let mut store = Store::open(dir.path()).expect("reopen");
        assert_eq!(store.next_seq_id(), last + 1);
    }
}
