//! Cache consultation and feeding.
//!
//! Before submitting a job the engine asks the cache whether an entry with
//! matching dep crcs exists; after a successful execution whose deps all
//! carry crcs, the result is uploaded. A `Maybe` answer (some candidates
//! blocked on not-yet-built deps) is treated as a miss: the job runs and
//! the next build gets a clean answer.

use tracing::{debug, warn};

use drover_cache::{CacheDep, CacheHit, CacheJobKey, CacheMeta, CacheTarget, CacheUpload, DepVerdict};
use drover_error::Result;
use drover_store::depvec::DepPayload;
use drover_types::{Accesses, Crc, Dflags, FileSig, JobIdx, Pdate, ReqIdx, RunStatus, Status};

use crate::engine::Engine;

impl Engine {
    fn cache_key(&self, job: JobIdx) -> Result<CacheJobKey> {
        use xxhash_rust::xxh3::Xxh3;
        use std::hash::Hasher as _;
        let data = self.store.rule_data(self.store.job_rule(job)?)?;
        let stems = self.job_stems(job)?;
        let mut h = Xxh3::new();
        h.write(data.script.as_bytes());
        for part in &data.interpreter {
            h.write(part.as_bytes());
        }
        for (name, value) in &stems {
            h.write(name.as_bytes());
            h.write(value.as_bytes());
        }
        Ok(CacheJobKey {
            user_name: self.store.job_user_name(job)?,
            variant: h.finish(),
        })
    }

    /// Try to satisfy the job from the cache. Returns `true` on a hit,
    /// with the job state fully restored.
    pub(crate) fn try_cache_hit(&mut self, job: JobIdx, req: ReqIdx) -> Result<bool> {
        if self.cache.is_none() {
            return Ok(false);
        }
        let key = self.cache_key(job)?;
        let hit = {
            let this: &Engine = &*self;
            let cache = this.cache.as_ref().expect("checked above");
            let check = |path: &str, crc: Crc| -> DepVerdict {
                let Ok(Some(node)) = this.store.node_idx(path) else {
                    return DepVerdict::NotDone;
                };
                let done = this
                    .req(req)
                    .node_ri
                    .get(&node)
                    .is_some_and(|ri| ri.done_action.is_some())
                    || this
                        .store
                        .node(node)
                        .is_ok_and(|rec| rec.buildable.is_src_anti() && rec.crc.is_reliable());
                if !done {
                    return DepVerdict::NotDone;
                }
                match this.store.node(node) {
                    Ok(rec) if rec.crc.is_reliable() && rec.crc == crc => DepVerdict::Match,
                    Ok(_) => DepVerdict::Mismatch,
                    Err(_) => DepVerdict::NotDone,
                }
            };
            cache.match_entry(&key, &check)?
        };
        let id = match hit {
            CacheHit::Yes(id) => id,
            CacheHit::No => return Ok(false),
            CacheHit::Maybe { new_deps } => {
                debug!(job = %job, ?new_deps, "cache maybe, running instead");
                return Ok(false);
            }
        };
        let root = self.config.root_dir.clone();
        let meta = {
            let cache = self.cache.as_ref().expect("checked above");
            match cache.download(&key, &id, &root) {
                Ok(meta) => meta,
                Err(e) => {
                    // a broken entry degrades to a miss
                    warn!(job = %job, %e, "cache download failed");
                    return Ok(false);
                }
            }
        };
        let now = Pdate::now();
        for target in &meta.targets {
            let node = self.store.node_at(&target.path)?;
            let abs = root.join(&target.path);
            let sig = FileSig::of(&abs);
            let crc = Crc::of_file(&abs);
            self.node_refresh(node, crc, now, sig, Some(job))?;
            let mut rec = self.store.node(node)?;
            rec.actual_tflags = target.tflags;
            self.store.node_put(node, &rec)?;
        }
        // restore the recorded dep vector so up-to-date checks keep working
        let entry_deps = {
            let cache = self.cache.as_ref().expect("checked above");
            cache.entry_deps(&key, &id)?
        };
        let mut deps = Vec::with_capacity(entry_deps.len());
        for d in &entry_deps {
            deps.push(drover_store::depvec::Dep {
                node: self.store.node_at(&d.path)?,
                dflags: Dflags::from_bits_truncate(d.dflags),
                accesses: Accesses::from_bits_truncate(d.accesses),
                payload: DepPayload::Crc(d.crc),
                parallel: d.parallel,
            });
        }
        self.store.set_job_deps(job, &deps)?;

        let rule = self.store.job_rule(job)?;
        let rrec = self.store.rule_rec(rule)?;
        let mut jrec = self.store.job(job)?;
        jrec.status = Status::Ok;
        jrec.run_status = RunStatus::Complete;
        jrec.exec_gen = rrec.rsrcs_gen;
        jrec.match_gen = self.store.match_gen();
        self.store.job_put(job, &jrec)?;
        debug!(job = %job, id, "cache hit restored");
        Ok(true)
    }

    /// Feed a finished job into the cache when it qualifies.
    pub(crate) fn try_cache_upload(&mut self, job: JobIdx) -> Result<()> {
        if self.cache.is_none() {
            return Ok(());
        }
        let jrec = self.store.job(job)?;
        if !jrec.status.is_ok() {
            return Ok(());
        }
        let deps = self.store.job_deps(job)?;
        let mut cache_deps = Vec::with_capacity(deps.len());
        let mut prev_crit = false;
        for d in &deps {
            let DepPayload::Crc(crc) = d.payload else {
                debug!(job = %job, "dep without crc, not uploading");
                return Ok(());
            };
            let critical = d.dflags.contains(Dflags::CRITICAL);
            cache_deps.push(CacheDep {
                path: self.store.node_name(d.node)?,
                crc,
                accesses: d.accesses.bits(),
                dflags: d.dflags.bits(),
                parallel: d.parallel,
                critical: critical && !prev_crit,
            });
            prev_crit = critical;
        }
        let data = self.store.rule_data(self.store.job_rule(job)?)?;
        let mut targets: Vec<CacheTarget> = Vec::new();
        for (path, tflags) in self.job_static_targets(job)? {
            if self.config.root_dir.join(&path).exists() {
                targets.push(CacheTarget { path, tflags });
            }
        }
        for t in self.store.job_star_targets(job)? {
            targets.push(CacheTarget {
                path: self.store.node_name(t.node)?,
                tflags: t.tflags,
            });
        }
        let upload = CacheUpload {
            meta: CacheMeta {
                rule: data.name.clone(),
                stems: self.job_stems(job)?,
                targets,
            },
            deps: cache_deps,
        };
        let key = self.cache_key(job)?;
        let root = self.config.root_dir.clone();
        let cache = self.cache.as_ref().expect("checked above");
        match cache.upload(&key, &upload, &root) {
            Ok(true) => debug!(job = %job, "uploaded to cache"),
            Ok(false) => debug!(job = %job, "cache refused the entry"),
            Err(e) => warn!(job = %job, %e, "cache upload error"),
        }
        Ok(())
    }
}
