//! Per-job access table.
//!
//! Several sockets feed events for one job and system buffering loses the
//! order between them. We do not synchronize each report; instead every
//! ambiguity between a write and a read-then-write is resolved as if the
//! write happened earliest and the read latest, so a reordering can only
//! hide a spurious dep, never invent a hidden-dep error.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use drover_types::{Access, Accesses, Ddate, Dflags, FileSig, Pdate, Tflags};

/// How certainly the job wrote a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum WriteState {
    #[default]
    No,
    /// An unlink whose effect may have been superseded.
    Maybe,
    Yes,
}

/// What one event reports about one file.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventInfo {
    pub accesses: Accesses,
    pub dflags: Dflags,
    pub tflags: Tflags,
    pub write: bool,
    pub unlink: bool,
}

impl EventInfo {
    /// An event with no write side at all.
    #[must_use]
    pub fn idle(&self) -> bool {
        !self.write && !self.unlink
    }
}

/// Accumulated knowledge about one file accessed by the job.
#[derive(Debug, Clone, Default)]
pub struct AccessInfo {
    /// First read date per access kind (`Pdate::NONE` = never).
    pub first_read: [Pdate; 3],
    /// First write date (`Pdate::NONE` = never written).
    pub first_write: Pdate,
    /// Disk date of the file when first read.
    pub file_date: Ddate,
    /// On-disk signature when first read.
    pub seen_sig: FileSig,
    /// Accesses that (possibly) precede the first write: the dep part.
    pub accesses: Accesses,
    pub dflags: Dflags,
    pub tflags: Tflags,
    pub write: WriteState,
    pub unlinked: bool,
    pub parallel_id: u32,
    pub crit_id: u32,
}

/// Relative position of a new event w.r.t. what we already know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum After {
    /// Earliest known access to this file.
    First,
    /// After the first read, before any known write.
    Read,
    /// Possibly after a write: reads resolve as non-deps.
    Write,
}

impl AccessInfo {
    #[must_use]
    pub fn read_date(&self) -> Pdate {
        self.first_read
            .iter()
            .copied()
            .filter(|d| !d.is_none())
            .min()
            .unwrap_or(Pdate::NONE)
    }

    #[must_use]
    pub fn written(&self) -> bool {
        self.write != WriteState::No
    }

    /// Whether this entry contributes a dep to the digest.
    #[must_use]
    pub fn is_dep(&self) -> bool {
        !self.written() && (!self.accesses.is_empty() || !self.dflags.is_empty())
    }

    /// Monotone merge of one event.
    ///
    /// Returns `true` if anything changed (for tracing).
    pub fn update(
        &mut self,
        pd: Pdate,
        dd: Ddate,
        sig: FileSig,
        ev: &EventInfo,
        parallel_id: u32,
        crit_id: u32,
    ) -> bool {
        let after = if self.written() && pd > self.first_write {
            After::Write
        } else if !self.accesses.is_empty() && pd > self.read_date() {
            After::Read
        } else {
            After::First
        };
        let mut changed = false;

        // book-keeping as a read even for flag-only events, so a later
        // Required modifier still records when the file was seen
        if !ev.accesses.is_empty() || !ev.dflags.is_empty() || ev.idle() {
            if after == After::First {
                self.file_date = dd;
                self.seen_sig = sig;
                self.parallel_id = parallel_id;
                self.crit_id = crit_id;
                changed = true;
            } else if self.accesses.is_empty() && self.read_date().is_none() {
                self.file_date = dd;
                self.seen_sig = sig;
                changed = true;
            }
        }
        // reads at or before the first write count as deps; reads that may
        // follow a write see our own output and are dropped
        if after != After::Write {
            for kind in [Access::Stat, Access::Lnk, Access::Reg] {
                if ev.accesses.contains(kind.mask()) {
                    let slot = &mut self.first_read[kind as usize];
                    if slot.is_none() || pd < *slot {
                        *slot = pd;
                        changed = true;
                    }
                }
            }
            let merged = self.accesses.union(ev.accesses);
            changed |= merged != self.accesses;
            self.accesses = merged;
        }
        if ev.write || ev.unlink {
            // the write is taken at its earliest possible date
            if self.first_write.is_none() || pd < self.first_write {
                self.first_write = pd;
                changed = true;
            }
            if ev.unlink {
                self.unlinked = true;
                if self.write == WriteState::No {
                    self.write = WriteState::Maybe;
                }
            }
            if ev.write {
                self.write = WriteState::Yes;
            }
            changed = true;
        }
        let dflags = self.dflags.union(ev.dflags);
        let tflags = self.tflags.union(ev.tflags);
        changed |= dflags != self.dflags || tflags != self.tflags;
        self.dflags = dflags;
        self.tflags = tflags;
        changed
    }
}

/// One finalized dep of the job, in causal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepDigest {
    pub path: String,
    pub accesses: Accesses,
    pub dflags: Dflags,
    pub file_date: Ddate,
    pub sig: FileSig,
    /// Parallel with the previous dep in the digest.
    pub parallel: bool,
    /// Opens a new critical group.
    pub critical: bool,
}

/// One finalized target of the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDigest {
    pub path: String,
    pub tflags: Tflags,
    pub write: WriteState,
    pub unlinked: bool,
    /// The job read this file before (possibly) writing it; without the
    /// incremental flag such a run is polluted by the previous content.
    pub read_before_write: bool,
}

/// The per-job access table.
pub struct AccessTable {
    /// Ordered map: entries keep arrival order until [`reorder`] runs.
    accesses: Vec<(String, AccessInfo)>,
    /// Hash index into `accesses` for O(1) merge.
    access_map: HashMap<String, usize>,
    /// Dirs whose presence/absence must be double-checked (NFS guard).
    pub guards: HashSet<String>,
    parallel_id: u32,
    crit_id: u32,
    /// Computes the rule-declared tflags of a path written by the job.
    tflags_cb: Box<dyn Fn(&str) -> Tflags + Send>,
}

impl AccessTable {
    pub fn new(tflags_cb: Box<dyn Fn(&str) -> Tflags + Send>) -> Self {
        Self {
            accesses: Vec::new(),
            access_map: HashMap::new(),
            guards: HashSet::new(),
            parallel_id: 0,
            crit_id: 0,
            tflags_cb,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accesses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }

    fn entry(&mut self, path: &str) -> &mut AccessInfo {
        if let Some(&i) = self.access_map.get(path) {
            return &mut self.accesses[i].1;
        }
        let info = AccessInfo {
            tflags: (self.tflags_cb)(path),
            ..AccessInfo::default()
        };
        self.access_map.insert(path.to_owned(), self.accesses.len());
        self.accesses.push((path.to_owned(), info));
        &mut self.accesses.last_mut().expect("just pushed").1
    }

    fn new_access(
        &mut self,
        pd: Pdate,
        path: &str,
        dd: Ddate,
        sig: FileSig,
        ev: &EventInfo,
        parallel_id: u32,
    ) {
        debug_assert!(!path.is_empty());
        let crit_id = self.crit_id;
        let info = self.entry(path);
        if info.update(pd, dd, sig, ev, parallel_id, crit_id) {
            debug!(path, date = %pd, "access updated");
        }
    }

    /// Record one batch of file accesses from a single message.
    ///
    /// All files of one batch share a parallel id; a message flagged
    /// parallel joins the previous batch's id.
    pub fn new_accesses(
        &mut self,
        pd: Pdate,
        files: &[(String, FileSig)],
        ev: &EventInfo,
        parallel: bool,
    ) {
        if !parallel || self.parallel_id == 0 {
            self.parallel_id += 1;
        }
        let pid = self.parallel_id;
        for (path, sig) in files {
            self.new_access(pd, path, sig.mtime, *sig, ev, pid);
        }
    }

    /// Record the rule's static deps; must precede any hidden access.
    pub fn new_static_deps(&mut self, pd: Pdate, deps: &[(String, Dflags)]) {
        debug_assert!(self.accesses.is_empty(), "static deps come first");
        self.parallel_id += 1;
        let pid = self.parallel_id;
        for (path, dflags) in deps {
            let ev = EventInfo {
                dflags: *dflags,
                ..EventInfo::default()
            };
            self.new_access(pd, path, Ddate::NONE, FileSig::default(), &ev, pid);
        }
    }

    /// Record a write to one target path.
    pub fn new_target(&mut self, pd: Pdate, path: &str, tflags: Tflags, unlink: bool) {
        self.parallel_id += 1;
        let pid = self.parallel_id;
        let ev = EventInfo {
            tflags,
            write: !unlink,
            unlink,
            ..EventInfo::default()
        };
        self.new_access(pd, path, Ddate::NONE, FileSig::default(), &ev, pid);
        if let Some(i) = path.rfind('/') {
            self.guards.insert(path[..i].to_owned());
        }
    }

    /// Open a new critical group: subsequent deps must not be reordered
    /// before this point.
    pub fn critical_barrier(&mut self) {
        self.crit_id += 1;
        debug!(crit_id = self.crit_id, "critical barrier");
    }

    /// Restore a causally consistent order and drop superfluous accesses.
    ///
    /// Deps are sorted by earliest first read; entries of one parallel
    /// group stay adjacent (they share their batch date, ties break by
    /// original order) and no dep crosses a critical boundary. Then pure
    /// `Stat` accesses on dirs of retained deps are dropped: the uphill
    /// relation already implies them.
    pub fn reorder(&mut self) {
        let mut order: Vec<usize> = (0..self.accesses.len()).collect();
        order.sort_by(|&a, &b| {
            let ia = &self.accesses[a].1;
            let ib = &self.accesses[b].1;
            (ia.crit_id, ia.read_date(), ia.parallel_id, a).cmp(&(
                ib.crit_id,
                ib.read_date(),
                ib.parallel_id,
                b,
            ))
        });
        let mut reordered: Vec<(String, AccessInfo)> = Vec::with_capacity(self.accesses.len());
        for &i in &order {
            reordered.push(std::mem::take(&mut self.accesses[i]));
        }
        self.accesses = reordered;

        // pass 1: pure stats that are dir prefixes of the next dep
        let mut to_del: HashSet<usize> = HashSet::new();
        let mut last: Option<usize> = None;
        for i in (0..self.accesses.len()).rev() {
            let (path, info) = &self.accesses[i];
            if !info.is_dep() {
                last = None;
            } else if let Some(l) = last {
                let is_dir_stat = info.accesses == Accesses::STAT
                    && self.accesses[l].0.starts_with(path.as_str())
                    && self.accesses[l].0.as_bytes().get(path.len()) == Some(&b'/');
                if is_dir_stat {
                    to_del.insert(i);
                } else {
                    last = Some(i);
                }
            } else {
                last = Some(i);
            }
        }
        // pass 2: pure stats on dirs already implied by kept deps
        let mut dirs: HashSet<String> = HashSet::new();
        let mut kept: Vec<(String, AccessInfo)> = Vec::with_capacity(self.accesses.len());
        for (i, (path, info)) in self.accesses.drain(..).enumerate() {
            if to_del.contains(&i) {
                continue;
            }
            if info.is_dep() {
                if info.accesses == Accesses::STAT && dirs.contains(&path) {
                    continue;
                }
                let mut dir = path.as_str();
                while let Some(cut) = dir.rfind('/') {
                    dir = &dir[..cut];
                    if !dirs.insert(dir.to_owned()) {
                        break; // uphill dirs of an inserted dir are already in
                    }
                }
            }
            kept.push((path, info));
        }
        self.accesses = kept;
        self.access_map.clear();
        for (i, (path, _)) in self.accesses.iter().enumerate() {
            self.access_map.insert(path.clone(), i);
        }
    }

    /// Split the table into dep and target digests.
    ///
    /// Call after [`reorder`]. The first dep of each critical group after
    /// the first carries the critical marker.
    #[must_use]
    pub fn digest(&self) -> (Vec<DepDigest>, Vec<TargetDigest>) {
        let mut deps = Vec::new();
        let mut targets = Vec::new();
        let mut prev_pid: Option<u32> = None;
        let mut prev_crit: Option<u32> = None;
        for (path, info) in &self.accesses {
            if info.is_dep() {
                deps.push(DepDigest {
                    path: path.clone(),
                    accesses: info.accesses,
                    dflags: info.dflags,
                    file_date: info.file_date,
                    sig: info.seen_sig,
                    parallel: prev_pid == Some(info.parallel_id)
                        && prev_crit == Some(info.crit_id),
                    critical: prev_crit.is_some_and(|c| c != info.crit_id),
                });
                prev_pid = Some(info.parallel_id);
                prev_crit = Some(info.crit_id);
            } else if info.written() {
                targets.push(TargetDigest {
                    path: path.clone(),
                    tflags: info.tflags,
                    write: info.write,
                    unlinked: info.unlinked,
                    read_before_write: !info.accesses.is_empty(),
                });
            }
            // entries that are neither (pure stats on targets, flag-only
            // noise) are dropped from the digest
        }
        (deps, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> AccessTable {
        AccessTable::new(Box::new(|_| Tflags::empty()))
    }

    fn reg() -> EventInfo {
        EventInfo {
            accesses: Accesses::REG,
            ..EventInfo::default()
        }
    }

    fn write_ev() -> EventInfo {
        EventInfo {
            write: true,
            ..EventInfo::default()
        }
    }

    fn sig(inode: u64) -> FileSig {
        FileSig {
            inode,
            ..FileSig::default()
        }
    }

    fn files(paths: &[&str]) -> Vec<(String, FileSig)> {
        paths.iter().map(|p| ((*p).to_owned(), sig(1))).collect()
    }

    #[test]
    fn test_read_then_write_is_a_target_not_a_dep() {
        let mut t = table();
        t.new_accesses(Pdate(10), &files(&["out"]), &reg(), false);
        t.new_target(Pdate(20), "out", Tflags::empty(), false);
        t.reorder();
        let (deps, targets) = t.digest();
        assert!(deps.is_empty());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].write, WriteState::Yes);
    }

    #[test]
    fn test_update_reordered_around_write_resolves_as_write_first() {
        // the Update arrives with a date later than the write: its read
        // part must not resurrect a dep
        let mut t = table();
        t.new_target(Pdate(10), "out", Tflags::empty(), false);
        let upd = EventInfo {
            accesses: Accesses::REG,
            write: true,
            ..EventInfo::default()
        };
        t.new_accesses(Pdate(30), &files(&["out"]), &upd, false);
        t.reorder();
        let (deps, targets) = t.digest();
        assert!(deps.is_empty());
        assert_eq!(targets.len(), 1);
        // and the write date stays the earliest one observed
        assert_eq!(t.accesses[0].1.first_write, Pdate(10));
    }

    #[test]
    fn test_earliest_read_wins_across_sockets() {
        let mut t = table();
        t.new_accesses(Pdate(50), &files(&["a"]), &reg(), false);
        t.new_accesses(Pdate(20), &files(&["a"]), &reg(), false);
        assert_eq!(t.accesses[0].1.read_date(), Pdate(20));
    }

    #[test]
    fn test_reorder_sorts_by_first_read() {
        let mut t = table();
        t.new_accesses(Pdate(30), &files(&["late"]), &reg(), false);
        t.new_accesses(Pdate(10), &files(&["early"]), &reg(), false);
        t.reorder();
        let (deps, _) = t.digest();
        let names: Vec<&str> = deps.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);
    }

    #[test]
    fn test_parallel_group_stays_together_and_is_flagged() {
        let mut t = table();
        t.new_accesses(Pdate(10), &files(&["a", "b", "c"]), &reg(), false);
        t.new_accesses(Pdate(20), &files(&["d"]), &reg(), false);
        t.reorder();
        let (deps, _) = t.digest();
        assert_eq!(deps.len(), 4);
        assert!(!deps[0].parallel);
        assert!(deps[1].parallel);
        assert!(deps[2].parallel);
        assert!(!deps[3].parallel);
    }

    #[test]
    fn test_parallel_flag_joins_previous_batch() {
        let mut t = table();
        t.new_accesses(Pdate(10), &files(&["a"]), &reg(), false);
        t.new_accesses(Pdate(10), &files(&["b"]), &reg(), true);
        t.reorder();
        let (deps, _) = t.digest();
        assert!(deps[1].parallel);
    }

    #[test]
    fn test_critical_barrier_pins_order_and_marks_first_dep() {
        let mut t = table();
        t.new_accesses(Pdate(50), &files(&["first"]), &reg(), false);
        t.critical_barrier();
        // read earlier in time, but after the barrier: must not be sorted
        // before "first"
        t.new_accesses(Pdate(10), &files(&["second"]), &reg(), false);
        t.reorder();
        let (deps, _) = t.digest();
        let names: Vec<&str> = deps.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(!deps[0].critical);
        assert!(deps[1].critical);
        assert!(!deps[1].parallel);
    }

    #[test]
    fn test_uphill_stat_pruning() {
        let mut t = table();
        let stat = EventInfo {
            accesses: Accesses::STAT,
            ..EventInfo::default()
        };
        t.new_accesses(Pdate(10), &files(&["src"]), &stat, false);
        t.new_accesses(Pdate(20), &files(&["src/main.c"]), &reg(), false);
        t.reorder();
        let (deps, _) = t.digest();
        let names: Vec<&str> = deps.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(names, vec!["src/main.c"]);
    }

    #[test]
    fn test_non_stat_dir_access_is_kept() {
        let mut t = table();
        let lnk = EventInfo {
            accesses: Accesses::LNK,
            ..EventInfo::default()
        };
        t.new_accesses(Pdate(10), &files(&["src"]), &lnk, false);
        t.new_accesses(Pdate(20), &files(&["src/main.c"]), &reg(), false);
        t.reorder();
        let (deps, _) = t.digest();
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn test_static_deps_carry_flags_without_accesses() {
        let mut t = table();
        t.new_static_deps(
            Pdate(1),
            &[("a.c".to_owned(), Dflags::STATIC | Dflags::REQUIRED)],
        );
        t.reorder();
        let (deps, _) = t.digest();
        assert_eq!(deps.len(), 1);
        assert!(deps[0].dflags.contains(Dflags::STATIC));
        assert!(deps[0].accesses.is_empty());
    }

    #[test]
    fn test_unlink_is_maybe_write_until_confirmed() {
        let mut t = table();
        t.new_target(Pdate(10), "tmpfile", Tflags::empty(), true);
        assert_eq!(t.accesses[0].1.write, WriteState::Maybe);
        t.new_target(Pdate(20), "tmpfile", Tflags::empty(), false);
        assert_eq!(t.accesses[0].1.write, WriteState::Yes);
        assert!(t.accesses[0].1.unlinked);
    }

    #[test]
    fn test_target_dirs_are_guarded() {
        let mut t = table();
        t.new_target(Pdate(10), "out/sub/x", Tflags::empty(), false);
        assert!(t.guards.contains("out/sub"));
    }
}
