//! Job-exec RPC: the wire format by which a traced job reports accesses.
//!
//! Every process in a job's tree opens its own socket to the gather
//! server, so messages from one job may interleave arbitrarily across
//! connections and arrive late; each message therefore carries its own
//! date and a parallel-with-previous bit, and the server never assumes
//! cross-socket ordering.
//!
//! Frames are a 4-byte little-endian length followed by a JSON body.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use drover_error::{DroverError, Result};
use drover_types::{Accesses, Crc, Dflags, FileSig, Pdate, Tflags};

/// Upper bound on a frame body, to fail fast on stream corruption.
pub const MAX_FRAME_LEN: usize = 64 << 20;

/// Message kinds a job can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JobExecProc {
    /// Plain reads.
    Deps,
    /// Reads later followed by writes.
    Updates,
    /// Writes.
    Targets,
    /// Unlinks.
    Unlinks,
    /// Synchronous: have my deps been modified or errored?
    ChkDeps,
    /// Synchronous: per-dep status and crc.
    DepVerbose,
    /// Server-assisted value decode.
    Decode,
    /// Server-assisted value encode.
    Encode,
    /// The job wrote under its tmp dir.
    Tmp,
    /// A chunk of live stdout.
    LiveOut,
    /// Subsequent deps open a new critical group.
    CriticalBarrier,
    /// Liveness probe.
    Heartbeat,
    /// The job asks to be killed.
    Kill,
    /// Free-form trace text.
    Trace,
}

impl JobExecProc {
    /// Whether the sender blocks until it gets a reply.
    #[must_use]
    pub fn is_sync(self) -> bool {
        matches!(
            self,
            JobExecProc::ChkDeps
                | JobExecProc::DepVerbose
                | JobExecProc::Decode
                | JobExecProc::Encode
        )
    }
}

/// One request from a traced process.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobExecRpcReq {
    pub proc: JobExecProc,
    pub date: Pdate,
    /// Parallel with the sender's previous report.
    pub parallel: bool,
    /// Wait for a reply even for normally-async procs.
    pub sync: bool,
    /// Accessed paths with the disk signature observed at access time.
    pub files: Vec<(String, FileSig)>,
    /// Access kinds for `Deps`/`Updates`.
    pub accesses: Accesses,
    /// Dep flag modifiers for `Deps`/`Updates`.
    pub dflags: Dflags,
    /// Target flag modifiers for `Targets`/`Unlinks`.
    pub tflags: Tflags,
    /// Payload text: live-out chunk, trace comment, encode value.
    pub txt: String,
}

impl JobExecRpcReq {
    /// A bare message of the given kind with no files attached.
    #[must_use]
    pub fn bare(proc: JobExecProc, date: Pdate) -> Self {
        Self {
            proc,
            date,
            parallel: false,
            sync: false,
            files: Vec::new(),
            accesses: Accesses::empty(),
            dflags: Dflags::empty(),
            tflags: Tflags::empty(),
            txt: String::new(),
        }
    }
}

/// Tri-state dep check result.
///
/// `Maybe` means a dep is being re-analyzed right now; the caller must
/// retry (or, in gather, the job is stopped to be rerun once deps settle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DepsStatus {
    Ok,
    Rebuild,
    Err,
    Maybe,
}

/// Reply to a synchronous request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobExecRpcReply {
    pub proc: JobExecProc,
    pub ok: DepsStatus,
    /// Per-dep results for `DepVerbose`.
    pub dep_infos: Vec<(DepsStatus, Crc)>,
    /// Decoded/encoded value for `Decode`/`Encode`.
    pub txt: String,
}

impl JobExecRpcReply {
    #[must_use]
    pub fn ok(proc: JobExecProc) -> Self {
        Self {
            proc,
            ok: DepsStatus::Ok,
            dep_infos: Vec::new(),
            txt: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Write one length-prefixed frame.
pub fn write_frame<T: Serialize>(w: &mut impl Write, msg: &T) -> Result<()> {
    let body = serde_json::to_vec(msg).map_err(|e| DroverError::BadRpcFrame {
        detail: format!("cannot serialize frame: {e}"),
    })?;
    let len = u32::try_from(body.len()).map_err(|_| DroverError::BadRpcFrame {
        detail: "frame too large".to_owned(),
    })?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream (the peer closed between
/// frames); a stream truncated mid-frame is an error.
pub fn read_frame<T: DeserializeOwned>(r: &mut impl Read) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DroverError::BadRpcFrame {
            detail: format!("frame length {len} exceeds {MAX_FRAME_LEN}"),
        });
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| DroverError::BadRpcFrame {
            detail: format!("cannot decode frame: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_types::FileTag;

    fn sample_req() -> JobExecRpcReq {
        JobExecRpcReq {
            proc: JobExecProc::Deps,
            date: Pdate(123_456_789),
            parallel: true,
            sync: false,
            files: vec![(
                "src/main.c".to_owned(),
                FileSig {
                    tag: FileTag::Reg,
                    inode: 42,
                    mtime: drover_types::Ddate(999),
                    size: 1024,
                },
            )],
            accesses: Accesses::REG,
            dflags: Dflags::empty(),
            tflags: Tflags::empty(),
            txt: String::new(),
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let req = sample_req();
        let mut buf = Vec::new();
        write_frame(&mut buf, &req).expect("write");
        let mut r = &buf[..];
        let got: JobExecRpcReq = read_frame(&mut r).expect("read").expect("frame present");
        assert_eq!(got, req);
        // stream drained
        let end: Option<JobExecRpcReq> = read_frame(&mut r).expect("read");
        assert!(end.is_none());
    }

    #[test]
    fn test_several_frames_in_one_stream() {
        let mut buf = Vec::new();
        let a = JobExecRpcReq::bare(JobExecProc::Heartbeat, Pdate(1));
        let b = JobExecRpcReq::bare(JobExecProc::Tmp, Pdate(2));
        write_frame(&mut buf, &a).expect("write");
        write_frame(&mut buf, &b).expect("write");
        let mut r = &buf[..];
        assert_eq!(
            read_frame::<JobExecRpcReq>(&mut r).expect("read").expect("a"),
            a
        );
        assert_eq!(
            read_frame::<JobExecRpcReq>(&mut r).expect("read").expect("b"),
            b
        );
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &sample_req()).expect("write");
        buf.truncate(buf.len() - 3);
        let mut r = &buf[..];
        assert!(read_frame::<JobExecRpcReq>(&mut r).is_err());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut r = &buf[..];
        assert!(read_frame::<JobExecRpcReq>(&mut r).is_err());
    }

    #[test]
    fn test_sync_procs() {
        assert!(JobExecProc::ChkDeps.is_sync());
        assert!(JobExecProc::Decode.is_sync());
        assert!(!JobExecProc::Deps.is_sync());
        assert!(!JobExecProc::LiveOut.is_sync());
    }
}
