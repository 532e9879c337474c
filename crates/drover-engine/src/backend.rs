//! Job execution backends.
//!
//! [`LocalBackend`] runs jobs on this host under gathering; [`FnBackend`]
//! delegates execution to a caller-provided function, which is how
//! embedders simulate executions and how the scenario tests drive the
//! engine deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use drover_autodep::AutodepEnv;
use drover_error::Result;
use drover_gather::Gather;
use drover_types::{JobIdx, Pdate, Status, Tflags};

use crate::engine::{Backend, EngineMsg, JobDigest, SubmitSpec};

/// Runs each submitted job in a gathered child on the local host.
pub struct LocalBackend {
    /// Autodep settings applied to every child (service filled per job).
    pub autodep_template: AutodepEnv,
    pids: Arc<Mutex<HashMap<u32, i32>>>,
    /// Kill escalation used when `kill(-1)` asks for the whole sequence.
    pub kill_sigs: Vec<i32>,
}

impl LocalBackend {
    #[must_use]
    pub fn new(autodep_template: AutodepEnv) -> Self {
        Self {
            autodep_template,
            pids: Arc::new(Mutex::new(HashMap::new())),
            kill_sigs: vec![libc::SIGTERM],
        }
    }
}

impl Backend for LocalBackend {
    fn submit(&mut self, spec: SubmitSpec, done: Sender<EngineMsg>) -> Result<()> {
        let pids = Arc::clone(&self.pids);
        let autodep = self.autodep_template.clone();
        // compile target matchers once, outside the job thread
        let matchers: Vec<(Option<String>, Option<Regex>, Tflags)> = spec
            .target_matchers
            .iter()
            .map(|m| {
                let re = m.regex.as_deref().and_then(|s| Regex::new(s).ok());
                (m.exact.clone(), re, m.tflags)
            })
            .collect();
        let job = spec.job;
        thread::Builder::new()
            .name(format!("job-{}", spec.seq_id))
            .spawn(move || {
                let tflags_cb = Box::new(move |path: &str| -> Tflags {
                    for (exact, re, tflags) in &matchers {
                        if exact.as_deref() == Some(path) {
                            return *tflags;
                        }
                        if re.as_ref().is_some_and(|re| re.is_match(path)) {
                            return *tflags;
                        }
                    }
                    Tflags::empty()
                });
                let mut g = Gather::new(tflags_cb);
                g.autodep_env = autodep;
                g.cwd = Some(spec.cwd.clone());
                g.env = spec.env.clone();
                g.timeout = spec.timeout;
                g.kill_sigs = spec.kill_sigs.clone();
                {
                    let pids = Arc::clone(&pids);
                    let raw = job.get();
                    g.pid_cb = Box::new(move |pid| {
                        pids.lock().insert(raw, pid);
                    });
                }
                g.new_static_deps(Pdate::now(), &spec.static_deps);
                let start_date = Pdate::now();
                let digest = match g.exec_child(&spec.cmd) {
                    Ok(res) => JobDigest {
                        status: res.status,
                        deps: res.deps,
                        targets: res.targets,
                        stdout: res.stdout,
                        stderr: res.stderr,
                        exec_time: res.exec_time,
                        start_date,
                    },
                    Err(e) => {
                        warn!(%job, %e, "local execution failed");
                        JobDigest {
                            status: Status::SystemErr,
                            deps: Vec::new(),
                            targets: Vec::new(),
                            stdout: String::new(),
                            stderr: e.to_string(),
                            exec_time: std::time::Duration::ZERO,
                            start_date,
                        }
                    }
                };
                pids.lock().remove(&job.get());
                let _ = done.send(EngineMsg::JobEnd { job, digest });
            })
            .map_err(|e| drover_error::DroverError::JobProcess {
                detail: format!("cannot spawn job thread: {e}"),
            })?;
        Ok(())
    }

    fn kill(&mut self, job: JobIdx, sig: i32) {
        let Some(pid) = self.pids.lock().get(&job.get()).copied() else {
            return; // already exited
        };
        let sig = if sig == -1 {
            // -1 asks for the configured sequence; the per-signal delays
            // are enforced by gather's own escalation, start it with the
            // first signal
            self.kill_sigs.first().copied().unwrap_or(libc::SIGKILL)
        } else {
            sig
        };
        debug!(%job, pid, sig, "killing");
        let pid = nix::unistd::Pid::from_raw(pid);
        let sig = nix::sys::signal::Signal::try_from(sig).unwrap_or(nix::sys::signal::SIGKILL);
        let _ = nix::sys::signal::killpg(pid, sig);
    }
}

/// Synchronous backend delegating to a function.
///
/// The function performs (or simulates) the execution and returns the
/// digest; completion is reported before `submit` returns, so the engine
/// work queue stays deterministic.
pub struct FnBackend<F>
where
    F: FnMut(&SubmitSpec) -> JobDigest + Send,
{
    f: F,
}

impl<F> FnBackend<F>
where
    F: FnMut(&SubmitSpec) -> JobDigest + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Backend for FnBackend<F>
where
    F: FnMut(&SubmitSpec) -> JobDigest + Send,
{
    fn submit(&mut self, spec: SubmitSpec, done: Sender<EngineMsg>) -> Result<()> {
        let digest = (self.f)(&spec);
        let _ = done.send(EngineMsg::JobEnd {
            job: spec.job,
            digest,
        });
        Ok(())
    }

    fn kill(&mut self, _job: JobIdx, _sig: i32) {}
}
