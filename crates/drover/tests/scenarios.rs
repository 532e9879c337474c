//! End-to-end engine scenarios driven with simulated executions.
//!
//! The syscall tracer is an external producer of access events, so these
//! tests stand in for it: each simulated backend performs the job's file
//! operations itself and reports the digest a traced run would have
//! produced. Everything downstream — dep reconciliation, rerun decisions,
//! clash handling, caching, diagnostics — is the real engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use drover::engine::{
    Backend, Engine, EngineConfig, EngineMsg, FnBackend, JobDigest, SubmitSpec,
};
use drover::store::Store;
use drover::store::rule::{RuleData, RuleDep, RulePattern, RuleTarget};
use drover::types::{Accesses, Dflags, FileSig, Pdate, Status, Tflags};
use drover_gather::{DepDigest, TargetDigest, WriteState};

fn static_target(pattern: &str) -> RuleTarget {
    RuleTarget {
        key: "out".to_owned(),
        pattern: RulePattern::new(pattern),
        tflags: Tflags::TARGET | Tflags::STATIC,
        star: false,
    }
}

fn rule(name: &str, target: &str, deps: &[(&str, Dflags)], script: &str) -> RuleData {
    RuleData {
        name: name.to_owned(),
        prio: 0,
        script: script.to_owned(),
        interpreter: vec!["/bin/sh".to_owned(), "-c".to_owned()],
        stems: vec![("base".to_owned(), "[^/]+".to_owned())],
        targets: vec![static_target(target)],
        deps: deps
            .iter()
            .map(|(p, dflags)| RuleDep {
                key: (*p).to_owned(),
                pattern: RulePattern::new(*p),
                dflags: *dflags,
            })
            .collect(),
        tokens: 1,
        ..RuleData::default()
    }
}

fn dep_digest(root: &Path, path: &str, dflags: Dflags, parallel: bool) -> DepDigest {
    let sig = FileSig::of(&root.join(path));
    DepDigest {
        path: path.to_owned(),
        accesses: Accesses::REG,
        dflags,
        file_date: sig.mtime,
        sig,
        parallel,
        critical: false,
    }
}

fn target_digest(path: &str, tflags: Tflags) -> TargetDigest {
    TargetDigest {
        path: path.to_owned(),
        tflags,
        write: WriteState::Yes,
        unlinked: false,
        read_before_write: false,
    }
}

fn engine_with<F>(root: &Path, f: F) -> Engine
where
    F: FnMut(&SubmitSpec) -> JobDigest + Send + 'static,
{
    let store = Store::open(&root.join(".drover")).expect("store");
    let config = EngineConfig {
        root_dir: root.to_path_buf(),
        ..EngineConfig::default()
    };
    Engine::new(store, config, Box::new(FnBackend::new(f)))
}

fn run(e: &mut Engine, targets: &[&str]) -> drover::engine::ReqSummary {
    let targets: Vec<String> = targets.iter().map(|t| (*t).to_owned()).collect();
    let req = e.open_req(&targets).expect("open request");
    e.run_req(req).expect("run request")
}

// ---------------------------------------------------------------------------
// hidden dep discovery
// ---------------------------------------------------------------------------

#[test]
fn test_hidden_dep_triggers_rebuild() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    std::fs::write(root.join("x.a"), b"aaa").expect("src");
    std::fs::write(root.join("x.b"), b"bbb").expect("src");

    // the rule declares only x.a; the simulated tracer observes x.b too
    let sim_root = root.clone();
    let mut e = engine_with(&root, move |spec: &SubmitSpec| {
        let out = spec.target_matchers[0].exact.clone().expect("static");
        let a = std::fs::read(sim_root.join("x.a")).expect("a");
        let b = std::fs::read(sim_root.join("x.b")).expect("b");
        std::fs::write(sim_root.join(&out), [a, b].concat()).expect("target");
        JobDigest {
            status: Status::Ok,
            deps: vec![
                dep_digest(&sim_root, "x.a", spec.static_deps[0].1, false),
                dep_digest(&sim_root, "x.b", Dflags::empty(), false),
            ],
            targets: vec![target_digest(&out, spec.target_matchers[0].tflags)],
            stdout: String::new(),
            stderr: String::new(),
            exec_time: Duration::from_millis(1),
            start_date: Pdate::now(),
        }
    });
    e.store
        .set_sources(vec!["x.a".to_owned(), "x.b".to_owned()], vec![])
        .expect("sources");
    e.store
        .add_rule(&rule(
            "cat",
            "{base}.cat",
            &[("{base}.a", Dflags::REQUIRED)],
            "cat {base}.a > {base}.cat",
        ))
        .expect("rule");

    let summary = run(&mut e, &["x.cat"]);
    assert!(summary.ok, "lines: {:?}", summary.lines);
    assert_eq!(summary.stats.done, 1);
    assert_eq!(std::fs::read(root.join("x.cat")).expect("out"), b"aaabbb");

    // the hidden dep is now recorded on the job
    let node = e.store.node_idx("x.cat").expect("idx").expect("node");
    let job =
        drover::types::JobIdx::new(e.store.node(node).expect("rec").actual_job).expect("job");
    let dep_names: Vec<String> = e
        .store
        .job_deps(job)
        .expect("deps")
        .iter()
        .map(|d| e.store.node_name(d.node).expect("name"))
        .collect();
    assert!(dep_names.contains(&"x.b".to_owned()), "deps: {dep_names:?}");

    // modifying only the hidden dep reruns the job
    std::fs::write(root.join("x.b"), b"BBB").expect("src");
    let summary = run(&mut e, &["x.cat"]);
    assert!(summary.ok, "lines: {:?}", summary.lines);
    assert_eq!(summary.stats.done, 1, "hidden dep change must rerun");
    assert_eq!(std::fs::read(root.join("x.cat")).expect("out"), b"aaaBBB");

    // and leaving everything alone does not
    let summary = run(&mut e, &["x.cat"]);
    assert_eq!(summary.stats.done, 0, "lines: {:?}", summary.lines);
}

// ---------------------------------------------------------------------------
// critical dep pruning
// ---------------------------------------------------------------------------

#[test]
fn test_critical_dep_prunes_then_reobserves() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    for f in ["c", "d1", "d2", "d3"] {
        std::fs::write(root.join(f), f.as_bytes()).expect("src");
    }

    let sim_root = root.clone();
    let mut e = engine_with(&root, move |spec: &SubmitSpec| {
        let out = spec.target_matchers[0].exact.clone().expect("static");
        std::fs::write(sim_root.join(&out), b"built").expect("target");
        JobDigest {
            status: Status::Ok,
            deps: vec![
                dep_digest(&sim_root, "c", spec.static_deps[0].1, false),
                dep_digest(&sim_root, "d1", Dflags::empty(), false),
                dep_digest(&sim_root, "d2", Dflags::empty(), true),
                dep_digest(&sim_root, "d3", Dflags::empty(), true),
            ],
            targets: vec![target_digest(&out, spec.target_matchers[0].tflags)],
            stdout: String::new(),
            stderr: String::new(),
            exec_time: Duration::from_millis(1),
            start_date: Pdate::now(),
        }
    });
    e.store
        .set_sources(
            ["c", "d1", "d2", "d3"].iter().map(|s| (*s).to_owned()).collect(),
            vec![],
        )
        .expect("sources");
    e.store
        .add_rule(&rule(
            "crit",
            "out.crit",
            &[("c", Dflags::CRITICAL | Dflags::REQUIRED)],
            "gen out.crit",
        ))
        .expect("rule");

    let summary = run(&mut e, &["out.crit"]);
    assert!(summary.ok, "lines: {:?}", summary.lines);
    assert_eq!(summary.stats.done, 1);

    // modify the critical dep: analysis stops after c, reruns, then the
    // d* deps are re-observed by the new execution
    std::fs::write(root.join("c"), b"changed").expect("src");
    let summary = run(&mut e, &["out.crit"]);
    assert!(summary.ok, "lines: {:?}", summary.lines);
    assert_eq!(summary.stats.done, 1);

    let node = e.store.node_idx("out.crit").expect("idx").expect("node");
    let job =
        drover::types::JobIdx::new(e.store.node(node).expect("rec").actual_job).expect("job");
    let deps = e.store.job_deps(job).expect("deps");
    assert_eq!(deps.len(), 4, "all deps re-observed after the rerun");
}

// ---------------------------------------------------------------------------
// clash
// ---------------------------------------------------------------------------

/// Holds the first two submissions and releases them together, so both
/// jobs observe start dates earlier than either refresh.
struct DeferBackend {
    root: PathBuf,
    pending: Vec<(SubmitSpec, crossbeam_channel::Sender<EngineMsg>)>,
    deferred_round_done: bool,
}

impl DeferBackend {
    fn simulate(&self, spec: &SubmitSpec, start_date: Pdate) -> JobDigest {
        let mut targets = Vec::new();
        for m in &spec.target_matchers {
            if let Some(path) = &m.exact {
                std::fs::write(self.root.join(path), path.as_bytes()).expect("target");
                targets.push(target_digest(path, m.tflags));
            } else if m.regex.as_deref() == Some("^x$") {
                std::fs::write(self.root.join("x"), b"from-star").expect("target");
                targets.push(target_digest("x", m.tflags));
            }
        }
        JobDigest {
            status: Status::Ok,
            deps: Vec::new(),
            targets,
            stdout: String::new(),
            stderr: String::new(),
            exec_time: Duration::from_millis(1),
            start_date,
        }
    }
}

impl Backend for DeferBackend {
    fn submit(
        &mut self,
        spec: SubmitSpec,
        done: crossbeam_channel::Sender<EngineMsg>,
    ) -> drover::Result<()> {
        if !self.deferred_round_done {
            self.pending.push((spec, done));
            if self.pending.len() == 2 {
                self.deferred_round_done = true;
                let start = Pdate::now();
                let pending = std::mem::take(&mut self.pending);
                for (spec, done) in pending {
                    let digest = self.simulate(&spec, start);
                    let _ = done.send(EngineMsg::JobEnd {
                        job: spec.job,
                        digest,
                    });
                }
            }
            return Ok(());
        }
        let digest = self.simulate(&spec, Pdate::now());
        let _ = done.send(EngineMsg::JobEnd {
            job: spec.job,
            digest,
        });
        Ok(())
    }

    fn kill(&mut self, _job: drover::types::JobIdx, _sig: i32) {}
}

#[test]
fn test_clash_reruns_and_warns() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();

    let store = Store::open(&root.join(".drover")).expect("store");
    let config = EngineConfig {
        root_dir: root.clone(),
        ..EngineConfig::default()
    };
    let backend = Box::new(DeferBackend {
        root: root.clone(),
        pending: Vec::new(),
        deferred_round_done: false,
    });
    let mut e = Engine::new(store, config, backend);

    // one rule owns x officially; the other writes it as a star target
    e.store
        .add_rule(&RuleData {
            name: "mk-x".to_owned(),
            script: "gen x".to_owned(),
            interpreter: vec!["/bin/sh".to_owned(), "-c".to_owned()],
            targets: vec![static_target("x")],
            tokens: 1,
            ..RuleData::default()
        })
        .expect("rule");
    e.store
        .add_rule(&RuleData {
            name: "mk-y".to_owned(),
            script: "gen y and x".to_owned(),
            interpreter: vec!["/bin/sh".to_owned(), "-c".to_owned()],
            targets: vec![
                static_target("y"),
                RuleTarget {
                    key: "spill".to_owned(),
                    pattern: RulePattern::new("x"),
                    tflags: Tflags::TARGET,
                    star: true,
                },
            ],
            tokens: 1,
            ..RuleData::default()
        })
        .expect("rule");

    let summary = run(&mut e, &["x", "y"]);
    assert!(summary.ok, "lines: {:?}", summary.lines);
    // the later-finishing job saw the other writer: it reruns
    assert!(summary.stats.rerun >= 1, "lines: {:?}", summary.lines);
    let text = summary.lines.join("\n");
    assert!(
        text.contains("written by several jobs"),
        "clash warning expected: {text}"
    );
    // the last finisher owns the node
    let node = e.store.node_idx("x").expect("idx").expect("node");
    let actual = e.store.node(node).expect("rec").actual_job;
    assert_ne!(actual, 0);
}

// ---------------------------------------------------------------------------
// cache hit across repos
// ---------------------------------------------------------------------------

#[test]
fn test_cache_hit_restores_bit_identical_targets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache_dir = dir.path().join("shared-cache");
    let root1 = dir.path().join("repo1");
    let root2 = dir.path().join("repo2");
    std::fs::create_dir_all(&root1).expect("repo1");
    std::fs::create_dir_all(&root2).expect("repo2");
    std::fs::write(root1.join("x.in"), b"payload").expect("src");
    std::fs::write(root2.join("x.in"), b"payload").expect("src");

    let cat = |root: PathBuf| {
        move |spec: &SubmitSpec| {
            let out = spec.target_matchers[0].exact.clone().expect("static");
            let body = std::fs::read(root.join("x.in")).expect("src");
            std::fs::write(root.join(&out), &body).expect("target");
            JobDigest {
                status: Status::Ok,
                deps: vec![dep_digest(&root, "x.in", spec.static_deps[0].1, false)],
                targets: vec![target_digest(&out, spec.target_matchers[0].tflags)],
                stdout: String::new(),
                stderr: String::new(),
                exec_time: Duration::from_millis(1),
                start_date: Pdate::now(),
            }
        }
    };
    let the_rule = rule(
        "cat",
        "{base}.out",
        &[("{base}.in", Dflags::REQUIRED)],
        "cat {base}.in > {base}.out",
    );

    // first repo builds and uploads
    let mut e1 = engine_with(&root1, cat(root1.clone()));
    e1.set_cache(
        drover::cache::DirCache::new(&cache_dir, "repo1", 1 << 20).expect("cache"),
    );
    e1.store
        .set_sources(vec!["x.in".to_owned()], vec![])
        .expect("sources");
    e1.store.add_rule(&the_rule).expect("rule");
    let summary = run(&mut e1, &["x.out"]);
    assert!(summary.ok, "lines: {:?}", summary.lines);
    assert_eq!(summary.stats.done, 1);

    // second repo, fresh store: must hit without executing
    let mut e2 = engine_with(&root2, |_spec: &SubmitSpec| -> JobDigest {
        panic!("cache hit expected, backend must not run")
    });
    e2.set_cache(
        drover::cache::DirCache::new(&cache_dir, "repo2", 1 << 20).expect("cache"),
    );
    e2.store
        .set_sources(vec!["x.in".to_owned()], vec![])
        .expect("sources");
    e2.store.add_rule(&the_rule).expect("rule");
    let summary = run(&mut e2, &["x.out"]);
    assert!(summary.ok, "lines: {:?}", summary.lines);
    assert_eq!(summary.stats.hit, 1, "lines: {:?}", summary.lines);
    assert_eq!(summary.stats.done, 0);
    assert_eq!(
        std::fs::read(root2.join("x.out")).expect("restored"),
        std::fs::read(root1.join("x.out")).expect("original"),
        "restored target must be bit-identical"
    );
}

// ---------------------------------------------------------------------------
// cycle detection
// ---------------------------------------------------------------------------

#[test]
fn test_cycle_diagnostic_frames_the_loop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    let mut e = engine_with(&root, |_spec: &SubmitSpec| -> JobDigest {
        panic!("cyclic jobs can never be submitted")
    });
    e.store
        .add_rule(&rule(
            "a-from-b",
            "a.x",
            &[("b.x", Dflags::REQUIRED)],
            "gen a.x",
        ))
        .expect("rule");
    e.store
        .add_rule(&rule(
            "b-from-a",
            "b.x",
            &[("a.x", Dflags::REQUIRED)],
            "gen b.x",
        ))
        .expect("rule");

    let summary = run(&mut e, &["a.x"]);
    assert!(!summary.ok);
    let text = summary.lines.join("\n");
    assert!(
        text.contains("cycle detected for a.x"),
        "expected cycle diagnostic: {text}"
    );
    assert!(text.contains("+-> a.x"), "diagram start: {text}");
    assert!(text.contains("^-- a.x"), "diagram close: {text}");
    assert!(text.contains("b.x"), "cycle member: {text}");
}

// ---------------------------------------------------------------------------
// dep error propagation
// ---------------------------------------------------------------------------

#[test]
fn test_dep_error_shows_upstream_stderr() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    std::fs::write(root.join("src.in"), b"s").expect("src");

    // mid fails; top depends on mid and must not run
    let sim_root = root.clone();
    let mut e = engine_with(&root, move |spec: &SubmitSpec| {
        let out = spec.target_matchers[0].exact.clone().expect("static");
        if out == "mid" {
            JobDigest {
                status: Status::Err,
                deps: vec![dep_digest(&sim_root, "src.in", spec.static_deps[0].1, false)],
                targets: Vec::new(),
                stdout: String::new(),
                stderr: "mid exploded\n".to_owned(),
                exec_time: Duration::from_millis(1),
                start_date: Pdate::now(),
            }
        } else {
            panic!("top must not run while its dep is in error");
        }
    });
    e.store
        .set_sources(vec!["src.in".to_owned()], vec![])
        .expect("sources");
    e.store
        .add_rule(&rule(
            "mk-mid",
            "mid",
            &[("src.in", Dflags::REQUIRED)],
            "boom",
        ))
        .expect("rule");
    e.store
        .add_rule(&rule(
            "mk-top",
            "top",
            &[("mid", Dflags::REQUIRED)],
            "use mid",
        ))
        .expect("rule");

    let summary = run(&mut e, &["top"]);
    assert!(!summary.ok);
    assert_eq!(summary.stats.failed, 1);
    let text = summary.lines.join("\n");
    assert!(
        text.contains("mid exploded"),
        "upstream stderr expected: {text}"
    );
    assert!(text.contains("mk-mid"), "rule name expected: {text}");
}
