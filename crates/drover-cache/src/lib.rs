//! Content-addressed artifact cache with LRU eviction.
//!
//! On-disk layout, relative to the cache dir:
//!
//! ```text
//! LMAKE/lru                  head of the LRU list and total size
//! <job-name>/<repo-crc>/lru  per-entry prev/next/size
//! <job-name>/<repo-crc>/data entry metadata (rule, stems, target list)
//! <job-name>/<repo-crc>/deps ordered dep crcs, with parallel/critical bits
//! <job-name>/<repo-crc>/<i>  one file per target, numbered by index
//! ```
//!
//! `<job-name>` is the job's user-visible name plus a variant hash of its
//! command, so incompatible commands never share entries; `<repo-crc>`
//! fingerprints the uploading repo.
//!
//! Locking: `match` and `download` hold one lock at a time; only `upload`
//! holds two and always takes the global lock before the entry lock —
//! that ordering is the whole deadlock-avoidance story.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use drover_error::{DroverError, Result};
use drover_types::{Crc, FileSig, Tflags};

const HEAD: &str = "LMAKE";

/// Identity of a job for cache addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheJobKey {
    /// User-visible job name (the matched target).
    pub user_name: String,
    /// Hash of the rule command and stem bindings.
    pub variant: u64,
}

impl CacheJobKey {
    fn dir(&self) -> String {
        format!("{}+{:016x}", self.user_name, self.variant)
    }
}

/// One recorded dep of a cached entry, in analysis order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheDep {
    pub path: String,
    pub crc: Crc,
    /// Access bitmap, as persisted by the dep vector.
    pub accesses: u16,
    /// Dep flag bits, as persisted by the dep vector.
    pub dflags: u16,
    pub parallel: bool,
    pub critical: bool,
}

/// One cached target file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheTarget {
    pub path: String,
    pub tflags: Tflags,
}

/// Entry metadata stored in `data`.
///
/// Sanitized: no sequence ids, no resource lists, no timings — only what
/// a downloading repo needs to restore the targets.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheMeta {
    pub rule: String,
    pub stems: Vec<(String, String)>,
    pub targets: Vec<CacheTarget>,
}

/// What the dep-checking callback says about one recorded dep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepVerdict {
    /// The node is done and its crc matches.
    Match,
    /// The node is done and its crc differs.
    Mismatch,
    /// The node is not done yet for this request.
    NotDone,
}

/// Outcome of [`DirCache::match_entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheHit {
    /// Entry id to download.
    Yes(String),
    No,
    /// Some candidates may hit once these deps are built.
    Maybe { new_deps: Vec<String> },
}

/// Everything an upload stores.
#[derive(Debug, Clone)]
pub struct CacheUpload {
    pub meta: CacheMeta,
    pub deps: Vec<CacheDep>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct Lru {
    prev: String,
    next: String,
    sz: u64,
}

impl Default for Lru {
    fn default() -> Self {
        Self {
            prev: HEAD.to_owned(),
            next: HEAD.to_owned(),
            sz: 0,
        }
    }
}

/// Advisory-lock guard over a dir (or file) descriptor.
struct FlockGuard {
    file: File,
}

impl FlockGuard {
    fn lock(path: &Path, exclusive: bool) -> Result<Self> {
        let file = File::open(path)?;
        let op = if exclusive {
            libc::LOCK_EX
        } else {
            libc::LOCK_SH
        };
        // SAFETY: fd is valid for the lifetime of `file`
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc != 0 {
            return Err(DroverError::Io(std::io::Error::last_os_error()));
        }
        Ok(Self { file })
    }
}

impl Drop for FlockGuard {
    fn drop(&mut self) {
        // SAFETY: fd is still valid; unlock is best-effort
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

pub struct DirCache {
    dir: PathBuf,
    /// Repo fingerprint, hex.
    repo: String,
    /// Size budget in bytes.
    capacity: u64,
}

impl DirCache {
    /// Open a cache dir, creating the head file on first use.
    pub fn new(dir: &Path, repo_tag: &str, capacity: u64) -> Result<Self> {
        use xxhash_rust::xxh3::xxh3_64;
        fs::create_dir_all(dir.join(HEAD))?;
        let this = Self {
            dir: dir.to_path_buf(),
            repo: format!("{:016x}", xxh3_64(repo_tag.as_bytes())),
            capacity,
        };
        let head = this.lru_path(HEAD);
        if !head.exists() {
            this.write_lru(HEAD, &Lru::default())?;
        }
        Ok(this)
    }

    fn lru_path(&self, entry: &str) -> PathBuf {
        self.dir.join(entry).join("lru")
    }

    fn read_lru(&self, entry: &str) -> Result<Lru> {
        let mut buf = String::new();
        File::open(self.lru_path(entry))?.read_to_string(&mut buf)?;
        serde_json::from_str(&buf).map_err(|e| DroverError::CacheEntry {
            entry: entry.to_owned(),
            detail: format!("bad lru record: {e}"),
        })
    }

    fn write_lru(&self, entry: &str, lru: &Lru) -> Result<()> {
        let path = self.lru_path(entry);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        f.write_all(
            serde_json::to_string(lru)
                .map_err(|e| DroverError::CacheEntry {
                    entry: entry.to_owned(),
                    detail: format!("cannot serialize lru: {e}"),
                })?
                .as_bytes(),
        )?;
        Ok(())
    }

    /// Unlink an entry from the LRU list, returning its size.
    fn lru_remove(&self, entry: &str) -> Result<u64> {
        let here = self.read_lru(entry)?;
        if here.prev == here.next && here.prev == entry {
            return Ok(here.sz); // self-linked corpse, nothing to unlink
        }
        let mut prev = self.read_lru(&here.prev)?;
        let mut next = self.read_lru(&here.next)?;
        if here.prev == here.next {
            // single neighbor: update one record, not two copies
            prev.next = here.next.clone();
            prev.prev = here.prev.clone();
            self.write_lru(&here.prev, &prev)?;
        } else {
            prev.next = here.next.clone();
            next.prev = here.prev.clone();
            self.write_lru(&here.prev, &prev)?;
            self.write_lru(&here.next, &next)?;
        }
        Ok(here.sz)
    }

    /// Insert an entry at the most-recent end.
    fn lru_first(&self, entry: &str, sz: u64) -> Result<()> {
        let mut head = self.read_lru(HEAD)?;
        let first = head.next.clone();
        if first == entry {
            self.write_lru(
                entry,
                &Lru {
                    prev: HEAD.to_owned(),
                    next: self.read_lru(entry)?.next,
                    sz,
                },
            )?;
            return Ok(());
        }
        head.next = entry.to_owned();
        if first == HEAD {
            head.prev = entry.to_owned();
            self.write_lru(HEAD, &head)?;
        } else {
            let mut old_first = self.read_lru(&first)?;
            old_first.prev = entry.to_owned();
            self.write_lru(HEAD, &head)?;
            self.write_lru(&first, &old_first)?;
        }
        self.write_lru(
            entry,
            &Lru {
                prev: HEAD.to_owned(),
                next: first,
                sz,
            },
        )?;
        Ok(())
    }

    /// Evict least-recent entries until `new_sz` fits next to `head.sz -
    /// old_sz`.
    fn mk_room(&self, old_sz: u64, new_sz: u64) -> Result<()> {
        if new_sz > self.capacity {
            return Err(DroverError::CacheFull {
                needed: new_sz,
                capacity: self.capacity,
            });
        }
        let mut head = self.read_lru(HEAD)?;
        head.sz = head.sz.saturating_sub(old_sz);
        while head.sz + new_sz > self.capacity {
            let victim = head.prev.clone();
            if victim == HEAD {
                break; // accounting drift: nothing left to evict
            }
            let v = self.read_lru(&victim)?;
            debug!(victim, sz = v.sz, "evicting");
            fs::remove_dir_all(self.dir.join(&victim))?;
            head.sz = head.sz.saturating_sub(v.sz);
            head.prev = v.prev;
            if head.prev == HEAD {
                head.next = HEAD.to_owned();
            } else {
                let mut last = self.read_lru(&head.prev)?;
                last.next = HEAD.to_owned();
                self.write_lru(&head.prev, &last)?;
            }
        }
        head.sz += new_sz;
        self.write_lru(HEAD, &head)
    }

    // -----------------------------------------------------------------------
    // match
    // -----------------------------------------------------------------------

    /// Look for an entry whose recorded deps all match the live state.
    ///
    /// `check` maps (path, recorded crc) to a verdict against the current
    /// request. Candidates that mismatch are skipped; candidates blocked
    /// on not-yet-done deps contribute those deps, and the intersection
    /// across candidates is returned as the minimal set to build next.
    /// The first divergent dep is determined by the matching prefix, so
    /// the intersection is non-empty whenever no candidate hits.
    pub fn match_entry(
        &self,
        job: &CacheJobKey,
        check: &dyn Fn(&str, Crc) -> DepVerdict,
    ) -> Result<CacheHit> {
        let job_dir = self.dir.join(job.dir());
        let _lock = match FlockGuard::lock(&self.dir, false) {
            Ok(l) => l,
            Err(_) => return Ok(CacheHit::No),
        };
        let entries = match fs::read_dir(&job_dir) {
            Ok(e) => e,
            Err(_) => return Ok(CacheHit::No), // absent dir reads as empty
        };
        let mut new_deps: Option<Vec<String>> = None;
        for entry in entries.flatten() {
            let id = entry.file_name().to_string_lossy().into_owned();
            let rel = format!("{}/{id}", job.dir());
            let deps = match self.read_deps(&rel) {
                Ok(d) => d,
                Err(e) => {
                    warn!(entry = rel, %e, "unreadable cache entry, skipping");
                    continue;
                }
            };
            let mut nds: Vec<String> = Vec::new();
            let mut miss = false;
            for dep in &deps {
                match check(&dep.path, dep.crc) {
                    DepVerdict::Match => {}
                    DepVerdict::Mismatch => {
                        miss = true;
                        break;
                    }
                    DepVerdict::NotDone => {
                        nds.push(dep.path.clone());
                        if dep.critical {
                            // deps past an unmatched critical dep are
                            // speculative, do not require them
                            break;
                        }
                    }
                }
            }
            if miss {
                continue;
            }
            if nds.is_empty() {
                debug!(entry = rel, "cache hit");
                return Ok(CacheHit::Yes(id));
            }
            new_deps = Some(match new_deps.take() {
                None => nds,
                Some(prev) => prev.into_iter().filter(|d| nds.contains(d)).collect(),
            });
        }
        Ok(match new_deps {
            None => CacheHit::No,
            Some(nds) => CacheHit::Maybe { new_deps: nds },
        })
    }

    // -----------------------------------------------------------------------
    // download
    // -----------------------------------------------------------------------

    /// Restore an entry's targets under `dest_root` and promote it to the
    /// front of the LRU.
    pub fn download(&self, job: &CacheJobKey, id: &str, dest_root: &Path) -> Result<CacheMeta> {
        let rel = format!("{}/{id}", job.dir());
        let entry_dir = self.dir.join(&rel);
        let meta: CacheMeta = {
            let _entry_lock = FlockGuard::lock(&entry_dir, false)?;
            let mut buf = String::new();
            File::open(entry_dir.join("data"))?.read_to_string(&mut buf)?;
            let meta: CacheMeta =
                serde_json::from_str(&buf).map_err(|e| DroverError::CacheEntry {
                    entry: rel.clone(),
                    detail: format!("bad data record: {e}"),
                })?;
            let mut restored: Vec<PathBuf> = Vec::new();
            for (i, target) in meta.targets.iter().enumerate() {
                let src = entry_dir.join(i.to_string());
                let dst = dest_root.join(&target.path);
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                let _ = fs::remove_file(&dst);
                if let Err(e) = fs::copy(&src, &dst) {
                    // partial download: delete what we copied, surface as
                    // a miss to the caller
                    for p in &restored {
                        let _ = fs::remove_file(p);
                    }
                    return Err(DroverError::CacheEntry {
                        entry: rel.clone(),
                        detail: format!("cannot restore {}: {e}", target.path),
                    });
                }
                restored.push(dst);
            }
            meta
        };
        // LRU manipulation needs the global lock, taken after the entry
        // lock is released
        let _global = FlockGuard::lock(&self.dir, true)?;
        let sz = self.lru_remove(&rel)?;
        self.lru_first(&rel, sz)?;
        debug!(entry = rel, "downloaded");
        Ok(meta)
    }

    // -----------------------------------------------------------------------
    // upload
    // -----------------------------------------------------------------------

    /// Store a finished job's targets.
    ///
    /// Every dep must carry a real crc; a date-only dep cannot be matched
    /// from another repo and rejects the upload. Returns `false` (after
    /// rolling back) when the entry cannot be stored.
    pub fn upload(&self, job: &CacheJobKey, upload: &CacheUpload, src_root: &Path) -> Result<bool> {
        for dep in &upload.deps {
            if !dep.crc.is_reliable() {
                return Err(DroverError::CacheEntry {
                    entry: job.dir(),
                    detail: format!("dep {} has no usable crc", dep.path),
                });
            }
        }
        let rel = format!("{}/{}", job.dir(), self.repo);
        let entry_dir = self.dir.join(&rel);

        // lock order: global first, then entry; the only double-lock site
        let _global = FlockGuard::lock(&self.dir, true)?;
        let old_sz = match self.read_lru(&rel) {
            Ok(_) => {
                let sz = self.lru_remove(&rel)?;
                fs::remove_dir_all(&entry_dir)?;
                sz
            }
            Err(_) => 0,
        };
        fs::create_dir_all(&entry_dir)?;
        let _entry = FlockGuard::lock(&entry_dir, true)?;

        let data = serde_json::to_vec(&upload.meta).map_err(|e| DroverError::CacheEntry {
            entry: rel.clone(),
            detail: format!("cannot serialize meta: {e}"),
        })?;
        let deps = serde_json::to_vec(&upload.deps).map_err(|e| DroverError::CacheEntry {
            entry: rel.clone(),
            detail: format!("cannot serialize deps: {e}"),
        })?;
        let sigs: Vec<(PathBuf, FileSig)> = upload
            .meta
            .targets
            .iter()
            .map(|t| {
                let src = src_root.join(&t.path);
                let sig = FileSig::of(&src);
                (src, sig)
            })
            .collect();
        let new_sz =
            (data.len() + deps.len()) as u64 + sigs.iter().map(|(_, s)| s.size).sum::<u64>();

        // commit the size accounting first, evicting from the tail
        if let Err(e) = self.mk_room(old_sz, new_sz) {
            warn!(entry = rel, %e, "no room, dropping entry");
            let _ = fs::remove_dir_all(&entry_dir);
            self.mk_room(old_sz, 0)?; // the old entry is gone either way
            return Ok(false);
        }
        match self.populate(&rel, &entry_dir, &data, &deps, &sigs) {
            Ok(()) => {
                self.lru_first(&rel, new_sz)?;
                debug!(entry = rel, sz = new_sz, "uploaded");
                Ok(true)
            }
            Err(e) => {
                warn!(entry = rel, %e, "upload failed, rolling back");
                let _ = fs::remove_dir_all(&entry_dir);
                self.mk_room(new_sz, 0)?;
                Ok(false)
            }
        }
    }

    fn populate(
        &self,
        rel: &str,
        entry_dir: &Path,
        data: &[u8],
        deps: &[u8],
        sigs: &[(PathBuf, FileSig)],
    ) -> Result<()> {
        for (i, (src, before)) in sigs.iter().enumerate() {
            if !before.exists() {
                return Err(DroverError::CacheEntry {
                    entry: rel.to_owned(),
                    detail: format!("target {} vanished before copy", src.display()),
                });
            }
            let dst = entry_dir.join(i.to_string());
            fs::copy(src, &dst)?;
            // a target rewritten during the copy poisons the entry
            let after = FileSig::of(src);
            if after != *before {
                return Err(DroverError::CacheUnstable { path: src.clone() });
            }
            let mut perms = fs::metadata(&dst)?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(&dst, perms)?;
        }
        fs::write(entry_dir.join("data"), data)?;
        fs::write(entry_dir.join("deps"), deps)?;
        Ok(())
    }

    /// Read the recorded deps of one entry.
    pub fn entry_deps(&self, job: &CacheJobKey, id: &str) -> Result<Vec<CacheDep>> {
        self.read_deps(&format!("{}/{id}", job.dir()))
    }

    fn read_deps(&self, rel: &str) -> Result<Vec<CacheDep>> {
        let mut buf = String::new();
        File::open(self.dir.join(rel).join("deps"))?.read_to_string(&mut buf)?;
        serde_json::from_str(&buf).map_err(|e| DroverError::CacheEntry {
            entry: rel.to_owned(),
            detail: format!("bad deps record: {e}"),
        })
    }

    // -----------------------------------------------------------------------
    // consistency
    // -----------------------------------------------------------------------

    /// Verify the LRU chain: `head.sz` equals the sum of entry sizes,
    /// `next` from the head visits every entry exactly once, and `prev`
    /// walks the same ring in reverse.
    pub fn chk(&self, delta: i64) -> Result<()> {
        let head = self.read_lru(HEAD)?;
        let mut seen: Vec<String> = Vec::new();
        let mut sum: u64 = 0;
        let mut cur = head.next.clone();
        let mut prev = HEAD.to_owned();
        while cur != HEAD {
            if seen.contains(&cur) {
                return Err(self.chk_err(format!("lru cycle at {cur}")));
            }
            let rec = self.read_lru(&cur)?;
            if rec.prev != prev {
                return Err(self.chk_err(format!(
                    "lru back-link of {cur} is {} instead of {prev}",
                    rec.prev
                )));
            }
            sum += rec.sz;
            seen.push(cur.clone());
            prev = cur;
            cur = rec.next;
        }
        if head.prev != prev {
            return Err(self.chk_err(format!(
                "lru tail is {} instead of {prev}",
                head.prev
            )));
        }
        let expected = i64::try_from(head.sz).unwrap_or(i64::MAX) + delta;
        if i64::try_from(sum).unwrap_or(i64::MAX) != expected {
            return Err(self.chk_err(format!(
                "lru size accounting: head says {expected}, entries sum to {sum}"
            )));
        }
        Ok(())
    }

    fn chk_err(&self, detail: String) -> DroverError {
        DroverError::CacheEntry {
            entry: HEAD.to_owned(),
            detail,
        }
    }
}
