//! Autodep child environment and access-event wire format.
//!
//! This crate defines the contract between the engine and a traced job:
//! how the child learns where to report ([`env::AutodepEnv`]) and what it
//! reports ([`rpc::JobExecRpcReq`]). The syscall interception mechanism
//! itself is an external producer of these messages.

pub mod env;
pub mod rpc;

pub use env::{AUTODEP_ENV_VAR, AutodepEnv, LnkSupport};
pub use rpc::{
    DepsStatus, JobExecProc, JobExecRpcReply, JobExecRpcReq, MAX_FRAME_LEN, read_frame,
    write_frame,
};
