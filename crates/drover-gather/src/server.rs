//! Per-job gather server and child execution.
//!
//! One listening socket per running job; every process of the job's tree
//! opens its own slave connection and streams [`JobExecRpcReq`] frames.
//! Slave handler threads only shuttle bytes; all table mutation happens on
//! the thread running [`Gather::exec_child`], which owns the event loop,
//! the timeout and the kill escalation.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{debug, warn};

use drover_autodep::{
    AUTODEP_ENV_VAR, AutodepEnv, DepsStatus, JobExecProc, JobExecRpcReply, JobExecRpcReq,
    read_frame, write_frame,
};
use drover_error::{DroverError, Result};
use drover_types::{Dflags, Pdate, Status, Tflags};

use crate::access::{AccessTable, DepDigest, EventInfo, TargetDigest};

/// Outcome of one gathered execution.
#[derive(Debug)]
pub struct GatherResult {
    pub status: Status,
    /// Raw wait status of the child (0 if never started).
    pub wstatus: i32,
    pub deps: Vec<DepDigest>,
    pub targets: Vec<TargetDigest>,
    pub stdout: String,
    pub stderr: String,
    pub seen_tmp: bool,
    pub exec_time: Duration,
}

enum Event {
    Req {
        req: JobExecRpcReq,
        reply: Option<Sender<JobExecRpcReply>>,
    },
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ChildEnd(std::process::ExitStatus),
}

/// Per-job gather state and configuration.
pub struct Gather {
    pub table: AccessTable,
    pub autodep_env: AutodepEnv,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    /// Signals to escalate through on kill; SIGKILL follows the last.
    pub kill_sigs: Vec<i32>,
    /// Launch the child in its own process group.
    pub create_group: bool,
    /// Answers synchronous requests (chk-deps, dep-verbose, codec).
    pub server_cb: Box<dyn Fn(&JobExecRpcReq) -> JobExecRpcReply + Send>,
    /// Receives live stdout chunks.
    pub live_out_cb: Box<dyn Fn(&str) + Send>,
    /// Observes the child pid right after spawn (for external kills).
    pub pid_cb: Box<dyn Fn(i32) + Send>,

    seen_tmp: bool,
    kill_requested: Option<Status>,
}

impl Gather {
    pub fn new(tflags_cb: Box<dyn Fn(&str) -> Tflags + Send>) -> Self {
        Self {
            table: AccessTable::new(tflags_cb),
            autodep_env: AutodepEnv::default(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
            kill_sigs: vec![libc::SIGTERM],
            create_group: true,
            server_cb: Box::new(|req| JobExecRpcReply::ok(req.proc)),
            live_out_cb: Box::new(|_| {}),
            pid_cb: Box::new(|_| {}),
            seen_tmp: false,
            kill_requested: None,
        }
    }

    /// Seed the rule's static deps; must be called before execution.
    pub fn new_static_deps(&mut self, pd: Pdate, deps: &[(String, Dflags)]) {
        self.table.new_static_deps(pd, deps);
    }

    /// Apply one request to the table, producing the synchronous reply if
    /// one is due.
    fn apply_req(&mut self, req: &JobExecRpcReq, child_alive: bool) -> Option<JobExecRpcReply> {
        match req.proc {
            JobExecProc::Deps => {
                let ev = EventInfo {
                    accesses: req.accesses,
                    dflags: req.dflags,
                    ..EventInfo::default()
                };
                self.table.new_accesses(req.date, &req.files, &ev, req.parallel);
                req.sync.then(|| JobExecRpcReply::ok(req.proc))
            }
            JobExecProc::Updates => {
                let ev = EventInfo {
                    accesses: req.accesses,
                    dflags: req.dflags,
                    write: true,
                    ..EventInfo::default()
                };
                self.table.new_accesses(req.date, &req.files, &ev, req.parallel);
                req.sync.then(|| JobExecRpcReply::ok(req.proc))
            }
            JobExecProc::Targets | JobExecProc::Unlinks => {
                let unlink = req.proc == JobExecProc::Unlinks;
                for (path, _) in &req.files {
                    self.table.new_target(req.date, path, req.tflags, unlink);
                }
                req.sync.then(|| JobExecRpcReply::ok(req.proc))
            }
            JobExecProc::ChkDeps | JobExecProc::DepVerbose => {
                if req.proc == JobExecProc::DepVerbose {
                    let ev = EventInfo {
                        accesses: req.accesses,
                        dflags: req.dflags,
                        ..EventInfo::default()
                    };
                    self.table.new_accesses(req.date, &req.files, &ev, req.parallel);
                }
                self.table.reorder(); // the server must see a coherent view
                let reply = (self.server_cb)(req);
                if reply.ok == DepsStatus::Maybe {
                    // a dep is being re-analyzed: stop now, rerun once settled
                    self.kill_requested.get_or_insert(Status::ChkDeps);
                }
                Some(reply)
            }
            JobExecProc::Decode | JobExecProc::Encode => {
                self.table.reorder();
                Some((self.server_cb)(req))
            }
            JobExecProc::Tmp => {
                self.seen_tmp = true;
                req.sync.then(|| JobExecRpcReply::ok(req.proc))
            }
            JobExecProc::LiveOut => {
                (self.live_out_cb)(&req.txt);
                req.sync.then(|| JobExecRpcReply::ok(req.proc))
            }
            JobExecProc::CriticalBarrier => {
                self.table.critical_barrier();
                req.sync.then(|| JobExecRpcReply::ok(req.proc))
            }
            JobExecProc::Heartbeat => {
                if !child_alive {
                    warn!("heartbeat for a vanished child");
                    self.kill_requested.get_or_insert(Status::Lost);
                }
                None
            }
            JobExecProc::Kill => {
                self.kill_requested.get_or_insert(Status::Killed);
                None
            }
            JobExecProc::Trace => {
                debug!(comment = %req.txt, "trace from job");
                req.sync.then(|| JobExecRpcReply::ok(req.proc))
            }
        }
    }

    /// Run `args` under gathering and return its digest.
    pub fn exec_child(&mut self, args: &[String]) -> Result<GatherResult> {
        let (argv0, rest) = args.split_first().ok_or_else(|| DroverError::JobProcess {
            detail: "empty command line".to_owned(),
        })?;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let service = listener.local_addr()?.to_string();
        self.autodep_env.service = service.clone();

        let start = Instant::now();
        let mut cmd = Command::new(argv0);
        cmd.args(rest)
            .env(AUTODEP_ENV_VAR, self.autodep_env.encode())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        if self.create_group {
            std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
        }
        let mut child = cmd.spawn().map_err(|e| DroverError::JobProcess {
            detail: format!("cannot spawn {argv0}: {e}"),
        })?;
        let child_pid = i32::try_from(child.id()).unwrap_or(0);
        (self.pid_cb)(child_pid);

        let (tx, rx): (Sender<Event>, Receiver<Event>) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        // accept loop: one handler thread per slave connection
        let accept_handle = {
            let tx = tx.clone();
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let Ok(stream) = stream else { break };
                    let tx = tx.clone();
                    thread::spawn(move || slave_loop(stream, &tx));
                }
            })
        };
        // stdio relays
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_handle = stdout_pipe.map(|pipe| {
            let tx = tx.clone();
            thread::spawn(move || relay(pipe, &tx, Event::Stdout))
        });
        let stderr_handle = stderr_pipe.map(|pipe| {
            let tx = tx.clone();
            thread::spawn(move || relay(pipe, &tx, Event::Stderr))
        });

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut status = Status::New;
        let mut wstatus = 0i32;
        let mut child_alive = true;
        let mut exit: Option<std::process::ExitStatus> = None;
        let mut deadline = self.timeout.map(|t| start + t);
        let mut kill_cnt = 0usize;
        let mut timed_out = false;

        // wait for the child on a side thread so the event loop never blocks
        {
            let tx = tx.clone();
            let mut waited = child;
            thread::spawn(move || {
                if let Ok(st) = waited.wait() {
                    let _ = tx.send(Event::ChildEnd(st));
                }
            });
        }
        drop(tx);

        loop {
            // once the child asked to die (or timed out), escalate signals
            if self.kill_requested.is_some() || timed_out {
                if status == Status::New {
                    status = if timed_out {
                        Status::Timeout
                    } else {
                        self.kill_requested.unwrap_or(Status::Killed)
                    };
                }
                if child_alive {
                    let sig = self
                        .kill_sigs
                        .get(kill_cnt)
                        .copied()
                        .unwrap_or(libc::SIGKILL);
                    kill_cnt += 1;
                    deadline = Some(Instant::now() + Duration::from_secs(1));
                    self.kill_requested = None;
                    timed_out = false;
                    send_signal(child_pid, self.create_group, sig);
                }
            }
            let ev = match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        if child_alive {
                            timed_out = status == Status::New;
                            if !timed_out {
                                // still dying: escalate again
                                self.kill_requested = Some(status);
                            }
                            continue;
                        }
                        break;
                    }
                    match rx.recv_timeout(dl - now) {
                        Ok(ev) => ev,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(ev) => ev,
                    Err(_) => break,
                },
            };
            match ev {
                Event::Req { req, reply } => {
                    let resp = self.apply_req(&req, child_alive);
                    if let (Some(resp), Some(reply)) = (resp, reply) {
                        let _ = reply.send(resp);
                    }
                }
                Event::Stdout(chunk) => {
                    (self.live_out_cb)(&String::from_utf8_lossy(&chunk));
                    stdout.extend_from_slice(&chunk);
                }
                Event::Stderr(chunk) => stderr.extend_from_slice(&chunk),
                Event::ChildEnd(st) => {
                    child_alive = false;
                    exit = Some(st);
                    wstatus = wait_status_bits(st);
                    if status == Status::New {
                        status = classify_exit(st);
                    }
                    // drain stragglers briefly, then stop
                    deadline = Some(Instant::now() + Duration::from_millis(300));
                }
            }
        }

        // unblock the accept loop and reap relay threads
        shutdown.store(true, Ordering::Release);
        let _ = TcpStream::connect(service.as_str());
        let _ = accept_handle.join();
        if let Some(h) = stdout_handle {
            let _ = h.join();
        }
        if let Some(h) = stderr_handle {
            let _ = h.join();
        }
        if child_alive {
            // event channel died while the child runs: none of our threads
            // can still report, treat as lost
            send_signal(child_pid, self.create_group, libc::SIGKILL);
            if status == Status::New {
                status = Status::Lost;
            }
        }
        debug!(?status, ?exit, "child ended");

        self.table.reorder(); // the engine must see a coherent view
        let (deps, targets) = self.table.digest();
        Ok(GatherResult {
            status,
            wstatus,
            deps,
            targets,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            seen_tmp: self.seen_tmp,
            exec_time: start.elapsed(),
        })
    }
}

/// Send `sig` to the child (or its whole group when it leads one).
fn send_signal(pid: i32, group: bool, sig: i32) {
    let pid = nix::unistd::Pid::from_raw(pid);
    let sig = nix::sys::signal::Signal::try_from(sig).unwrap_or(nix::sys::signal::SIGKILL);
    let res = if group {
        nix::sys::signal::killpg(pid, sig)
    } else {
        nix::sys::signal::kill(pid, sig)
    };
    if let Err(e) = res {
        debug!(?sig, %e, "kill failed (child probably reaped)");
    }
}

fn wait_status_bits(st: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt as _;
    st.into_raw()
}

fn classify_exit(st: std::process::ExitStatus) -> Status {
    use std::os::unix::process::ExitStatusExt as _;
    match (st.code(), st.signal()) {
        (Some(0), _) => Status::Ok,
        (Some(_), _) => Status::Err,
        (None, Some(sig)) => {
            // synchronous signals are program faults, not kills
            if [libc::SIGSEGV, libc::SIGBUS, libc::SIGFPE, libc::SIGILL, libc::SIGABRT]
                .contains(&sig)
            {
                Status::Err
            } else {
                Status::Killed
            }
        }
        (None, None) => Status::SystemErr,
    }
}

/// Read frames from one slave socket and forward them to the event loop.
fn slave_loop(mut stream: TcpStream, tx: &Sender<Event>) {
    loop {
        match read_frame::<JobExecRpcReq>(&mut stream) {
            Ok(Some(req)) => {
                let wants_reply = req.sync || req.proc.is_sync();
                if wants_reply {
                    let (rtx, rrx) = bounded(1);
                    if tx.send(Event::Req { req, reply: Some(rtx) }).is_err() {
                        return;
                    }
                    let Ok(reply) = rrx.recv() else { return };
                    if write_frame(&mut stream, &reply).is_err() {
                        return;
                    }
                } else if tx.send(Event::Req { req, reply: None }).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(%e, "slave stream error");
                return;
            }
        }
    }
}

fn relay<R: Read>(mut pipe: R, tx: &Sender<Event>, wrap: fn(Vec<u8>) -> Event) {
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_types::{Accesses, FileSig};

    fn gather() -> Gather {
        Gather::new(Box::new(|_| Tflags::empty()))
    }

    #[test]
    fn test_exec_simple_child_ok() {
        let mut g = gather();
        let res = g
            .exec_child(&["/bin/sh".into(), "-c".into(), "echo hello".into()])
            .expect("exec");
        assert_eq!(res.status, Status::Ok);
        assert_eq!(res.stdout, "hello\n");
        assert!(res.deps.is_empty());
    }

    #[test]
    fn test_exec_child_error_exit() {
        let mut g = gather();
        let res = g
            .exec_child(&["/bin/sh".into(), "-c".into(), "echo oops >&2; exit 3".into()])
            .expect("exec");
        assert_eq!(res.status, Status::Err);
        assert_eq!(res.stderr, "oops\n");
    }

    #[test]
    fn test_exec_child_timeout_is_killed() {
        let mut g = gather();
        g.timeout = Some(Duration::from_millis(200));
        g.kill_sigs = vec![libc::SIGTERM];
        let res = g
            .exec_child(&["/bin/sh".into(), "-c".into(), "sleep 30".into()])
            .expect("exec");
        assert_eq!(res.status, Status::Timeout);
        assert!(res.exec_time < Duration::from_secs(10));
    }

    #[test]
    fn test_slave_connection_reports_deps() {
        let mut g = gather();
        // a fake traced job: connect back to the service advertised in the
        // env var and report one dep frame
        let script = r#"
            exec 3<>/dev/tcp/127.0.0.1/$1
            printf %s "$2" | base64 -d >&3
            exec 3<&-
        "#;
        // build the frame out-of-band
        let req = JobExecRpcReq {
            proc: JobExecProc::Deps,
            date: Pdate(42),
            parallel: false,
            sync: false,
            files: vec![("src/input.txt".to_owned(), FileSig::default())],
            accesses: Accesses::REG,
            dflags: Dflags::empty(),
            tflags: Tflags::empty(),
            txt: String::new(),
        };
        let mut frame = Vec::new();
        write_frame(&mut frame, &req).expect("frame");
        use std::io::Write as _;
        let mut b64 = Vec::new();
        {
            // minimal base64 to avoid a dev-dependency
            const T: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
            for chunk in frame.chunks(3) {
                let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
                let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
                let mut quad = [
                    T[(n >> 18) as usize & 63],
                    T[(n >> 12) as usize & 63],
                    T[(n >> 6) as usize & 63],
                    T[n as usize & 63],
                ];
                if chunk.len() < 3 {
                    quad[3] = b'=';
                }
                if chunk.len() < 2 {
                    quad[2] = b'=';
                }
                b64.write_all(&quad).expect("write");
            }
        }
        // the script cannot know the port before spawn; exec_child fills
        // the service into the env var, so extract it in-shell
        let wrapper = format!(
            r#"port="${{{AUTODEP_ENV_VAR}#\"127.0.0.1:}}"; port="${{port%%\"*}}"; bash -c '{script}' relay "$port" "{}""#,
            String::from_utf8_lossy(&b64),
        );
        let mut res = g
            .exec_child(&["/bin/bash".into(), "-c".into(), wrapper])
            .expect("exec");
        assert_eq!(res.status, Status::Ok);
        assert_eq!(res.deps.len(), 1, "stderr: {}", res.stderr);
        let dep = res.deps.remove(0);
        assert_eq!(dep.path, "src/input.txt");
        assert_eq!(dep.accesses, Accesses::REG);
    }
}
