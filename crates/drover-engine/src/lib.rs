//! The drover make machinery: job, node and request state machines.
//!
//! A single engine thread owns the store and the graph; job execution is
//! delegated to a [`backend::Backend`] which reports digests back through
//! the engine channel. There are no coroutines: a make call that must wait
//! registers watchers on the awaited entity's per-request state and is
//! re-entered when that entity completes.

pub mod backend;
mod cachewire;
pub mod engine;
mod job;
mod node;
pub mod req;
pub mod reqinfo;

pub use backend::{FnBackend, LocalBackend};
pub use engine::{Backend, Engine, EngineConfig, EngineMsg, JobDigest, SubmitSpec, TargetMatcher};
pub use req::{ReqStats, ReqSummary, Request};
pub use reqinfo::{JobLvl, JobReqInfo, MakeAction, NodeAction, NodeReqInfo, RunAction, Watcher};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use drover_gather::{DepDigest, TargetDigest, WriteState};
    use drover_store::Store;
    use drover_store::rule::{RuleData, RuleDep, RulePattern, RuleTarget};
    use drover_types::{Accesses, Crc, Ddate, Dflags, FileSig, Pdate, Status, Tflags};

    fn cat_rule() -> RuleData {
        RuleData {
            name: "cat".to_owned(),
            prio: 0,
            script: "cat {src} > {base}.out".to_owned(),
            interpreter: vec!["/bin/sh".to_owned(), "-c".to_owned()],
            stems: vec![("base".to_owned(), "[^/]+".to_owned())],
            targets: vec![RuleTarget {
                key: "out".to_owned(),
                pattern: RulePattern::new("{base}.out"),
                tflags: Tflags::TARGET | Tflags::STATIC,
                star: false,
            }],
            deps: vec![RuleDep {
                key: "src".to_owned(),
                pattern: RulePattern::new("{base}.in"),
                dflags: Dflags::STATIC | Dflags::REQUIRED,
            }],
            tokens: 1,
            ..RuleData::default()
        }
    }

    /// A backend that pretends to run `cat x.in > x.out` by doing the file
    /// operations itself and reporting a faithful digest.
    fn simulated_cat(root: std::path::PathBuf) -> impl FnMut(&SubmitSpec) -> JobDigest + Send {
        move |spec: &SubmitSpec| {
            let start_date = Pdate::now();
            let dep_path = spec.static_deps[0].0.clone();
            let out_path = spec
                .target_matchers
                .iter()
                .find_map(|m| m.exact.clone())
                .expect("static target");
            let abs_dep = root.join(&dep_path);
            let abs_out = root.join(&out_path);
            let (status, stderr) = match std::fs::read(&abs_dep) {
                Ok(content) => {
                    std::fs::write(&abs_out, content).expect("write target");
                    (Status::Ok, String::new())
                }
                Err(e) => (Status::Err, format!("cat: {dep_path}: {e}")),
            };
            let sig = FileSig::of(&abs_dep);
            JobDigest {
                status,
                deps: vec![DepDigest {
                    path: dep_path,
                    accesses: Accesses::REG,
                    dflags: spec.static_deps[0].1,
                    file_date: sig.mtime,
                    sig,
                    parallel: false,
                    critical: false,
                }],
                targets: vec![TargetDigest {
                    path: out_path,
                    tflags: spec.target_matchers[0].tflags,
                    write: WriteState::Yes,
                    unlinked: false,
                    read_before_write: false,
                }],
                stdout: String::new(),
                stderr,
                exec_time: Duration::from_millis(5),
                start_date,
            }
        }
    }

    fn engine_at(root: &std::path::Path) -> Engine {
        let store = Store::open(&root.join(".drover")).expect("store");
        let config = EngineConfig {
            root_dir: root.to_path_buf(),
            ..EngineConfig::default()
        };
        let backend = Box::new(FnBackend::new(simulated_cat(root.to_path_buf())));
        Engine::new(store, config, backend)
    }

    #[test]
    fn test_build_then_steady_then_rebuild_on_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(root.join("x.in"), b"one").expect("src");

        let mut e = engine_at(root);
        e.store
            .set_sources(vec!["x.in".to_owned()], vec![])
            .expect("sources");
        e.store.add_rule(&cat_rule()).expect("rule");

        // first request runs the job
        let req = e.open_req(&["x.out".to_owned()]).expect("open");
        let summary = e.run_req(req).expect("run");
        assert!(summary.ok, "lines: {:?}", summary.lines);
        assert_eq!(summary.stats.done, 1);
        assert_eq!(
            std::fs::read(root.join("x.out")).expect("out"),
            b"one".to_vec()
        );

        // second request finds everything up to date
        let req = e.open_req(&["x.out".to_owned()]).expect("open");
        let summary = e.run_req(req).expect("run");
        assert!(summary.ok);
        assert_eq!(summary.stats.done, 0, "lines: {:?}", summary.lines);
        assert!(summary.stats.steady >= 1);

        // changing the source triggers a rerun
        std::fs::write(root.join("x.in"), b"two").expect("src");
        let req = e.open_req(&["x.out".to_owned()]).expect("open");
        let summary = e.run_req(req).expect("run");
        assert!(summary.ok, "lines: {:?}", summary.lines);
        assert_eq!(summary.stats.done, 1);
        assert_eq!(
            std::fs::read(root.join("x.out")).expect("out"),
            b"two".to_vec()
        );
    }

    #[test]
    fn test_missing_source_fails_with_diagnostic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let mut e = engine_at(root);
        e.store.add_rule(&cat_rule()).expect("rule");

        let req = e.open_req(&["y.out".to_owned()]).expect("open");
        let summary = e.run_req(req).expect("run");
        assert!(!summary.ok);
        assert_eq!(summary.exit_code(), 1);
        let text = summary.lines.join("\n");
        assert!(
            text.contains("y.out"),
            "diagnostic should name the target: {text}"
        );
    }

    #[test]
    fn test_zero_target_request_completes_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut e = engine_at(dir.path());
        let req = e.open_req(&[]).expect("open");
        let summary = e.run_req(req).expect("run");
        assert!(summary.ok);
        assert_eq!(summary.stats, ReqStats::default());
    }

    #[test]
    fn test_command_change_forces_rerun() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(root.join("x.in"), b"same").expect("src");
        let mut e = engine_at(root);
        e.store
            .set_sources(vec!["x.in".to_owned()], vec![])
            .expect("sources");
        let rule = e.store.add_rule(&cat_rule()).expect("rule");

        let req = e.open_req(&["x.out".to_owned()]).expect("open");
        assert!(e.run_req(req).expect("run").ok);

        let mut data = e.store.rule_data(rule).expect("data");
        data.script = "cat {src} > {base}.out # changed".to_owned();
        e.store.update_rule(rule, &data).expect("update");

        let req = e.open_req(&["x.out".to_owned()]).expect("open");
        let summary = e.run_req(req).expect("run");
        assert!(summary.ok);
        assert_eq!(summary.stats.done, 1, "cmd change must rerun");
    }

    #[test]
    fn test_forget_resets_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(root.join("x.in"), b"data").expect("src");
        let mut e = engine_at(root);
        e.store
            .set_sources(vec!["x.in".to_owned()], vec![])
            .expect("sources");
        e.store.add_rule(&cat_rule()).expect("rule");
        let req = e.open_req(&["x.out".to_owned()]).expect("open");
        assert!(e.run_req(req).expect("run").ok);

        let node = e.store.node_idx("x.out").expect("idx").expect("node");
        let rec = e.store.node(node).expect("rec");
        let job = drover_types::JobIdx::new(rec.actual_job).expect("actual job");
        e.job_forget(job).expect("forget");
        let jrec = e.store.job(job).expect("job");
        assert_eq!(jrec.status, Status::New);
        assert_eq!(jrec.exec_gen, 0);

        // forgotten jobs rerun even with unchanged inputs
        let req = e.open_req(&["x.out".to_owned()]).expect("open");
        let summary = e.run_req(req).expect("run");
        assert!(summary.ok);
        assert_eq!(summary.stats.done, 1);
    }

    #[test]
    fn test_dep_up_to_date_matrix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let mut e = engine_at(root);
        let node = e.store.node_at("f").expect("node");
        let mut rec = e.store.node(node).expect("rec");
        rec.crc = Crc::Reg(7);
        rec.sig = FileSig {
            mtime: Ddate(100),
            ..FileSig::default()
        };
        e.store.node_put(node, &rec).expect("put");

        use drover_store::depvec::{Dep, DepPayload};
        let dep = |payload| Dep {
            node,
            dflags: Dflags::empty(),
            accesses: Accesses::REG,
            payload,
            parallel: false,
        };
        assert!(e
            .dep_up_to_date(&dep(DepPayload::Crc(Crc::Reg(7))), false)
            .expect("utd"));
        assert!(!e
            .dep_up_to_date(&dep(DepPayload::Crc(Crc::Reg(8))), false)
            .expect("utd"));
        // full check also sees stat-level identity
        assert!(!e
            .dep_up_to_date(&dep(DepPayload::Crc(Crc::Lnk(7))), true)
            .expect("utd"));
        // bare date payloads compare the recorded mtime
        assert!(e
            .dep_up_to_date(
                &dep(DepPayload::Date {
                    date: Ddate(100),
                    sig: FileSig::default()
                }),
                false
            )
            .expect("utd"));
        assert!(!e
            .dep_up_to_date(
                &dep(DepPayload::Date {
                    date: Ddate(99),
                    sig: FileSig::default()
                }),
                false
            )
            .expect("utd"));
    }

    #[test]
    fn test_maybe_buildability_resumes_from_candidate_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut e = engine_at(dir.path());
        // the rules' static deps reference each other, so buildability
        // settles at Maybe with every candidate explored
        let cyclic = |name: &str, target: &str, dep: &str| RuleData {
            name: name.to_owned(),
            script: format!("gen {target}"),
            interpreter: vec!["/bin/sh".to_owned(), "-c".to_owned()],
            targets: vec![RuleTarget {
                key: "out".to_owned(),
                pattern: RulePattern::new(target),
                tflags: Tflags::TARGET | Tflags::STATIC,
                star: false,
            }],
            deps: vec![RuleDep {
                key: "d".to_owned(),
                pattern: RulePattern::new(dep),
                dflags: Dflags::REQUIRED,
            }],
            tokens: 1,
            ..RuleData::default()
        };
        e.store
            .add_rule(&cyclic("a-from-b", "a.x", "b.x"))
            .expect("rule");
        e.store
            .add_rule(&cyclic("b-from-a", "b.x", "a.x"))
            .expect("rule");

        let node = e.store.node_at("a.x").expect("node");
        assert_eq!(
            e.set_buildable(node).expect("buildable"),
            drover_types::Buildable::Maybe
        );
        let rec = e.store.node(node).expect("rec");
        assert_eq!(rec.rule_tgts_pos, 1, "one candidate tried");
        let jobs = e.store.node_job_tgts(node).expect("tgts");
        assert_eq!(jobs.len(), 1);

        // re-evaluation resumes at the tail: the explored candidate is
        // neither re-tried nor duplicated
        assert_eq!(
            e.set_buildable(node).expect("buildable"),
            drover_types::Buildable::Maybe
        );
        assert_eq!(e.store.node_job_tgts(node).expect("tgts"), jobs);
        assert_eq!(e.store.node(node).expect("rec").rule_tgts_pos, 1);
    }
}
