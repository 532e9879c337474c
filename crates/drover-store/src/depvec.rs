//! Compressed dep vectors and star-target vectors.
//!
//! Deps are stored as a sequence of *chunks*: a 72-byte header record
//! carrying full dep metadata plus `sz` bare node ids that precede the
//! header semantically and share its dflags, accesses and date. Large runs
//! of parallel same-flag deps (the shape generated dep-files produce)
//! collapse to one header plus four bytes per dep.
//!
//! ```text
//! Chunk layout
//! Offset  Size  Description
//!   0       4   Header node id
//!   4       4   sz: number of bare ids that follow the header
//!   8       2   dflags bits
//!  10       2   accesses bits
//!  12       1   bit0: parallel-with-previous of the chunk's first dep
//!  13       1   payload tag: 0 = date+sig, 1 = crc
//!  14       2   Reserved, zero
//!  16       8   date (shared by bare members)
//!  24      25   file signature (tag, inode, mtime, size)
//!  49      17   crc (tag + 128-bit digest)
//!  66       6   Reserved, zero
//!  72    sz*4   Bare node ids
//! ```
//!
//! The encoder is canonical (greedy maximal chunking), so decoding and
//! re-encoding a vector reproduces it byte for byte.

use drover_error::{DroverError, Result};
use drover_types::{Accesses, Crc, Ddate, Dflags, FileSig, FileTag, NodeIdx, Tflags};

pub const CHUNK_HEADER_SIZE: usize = 72;

/// Recorded content observation for one dep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DepPayload {
    /// Content identified only by the date (and signature) at which it was
    /// read; any later production of the node counts as a modification.
    Date { date: Ddate, sig: FileSig },
    /// Content identified by hash; reproduction to identical content does
    /// not count as a modification.
    Crc(Crc),
}

impl DepPayload {
    #[inline]
    #[must_use]
    pub fn crc(self) -> Option<Crc> {
        match self {
            DepPayload::Crc(crc) => Some(crc),
            DepPayload::Date { .. } => None,
        }
    }
}

/// One dep of a job, fully materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Dep {
    pub node: NodeIdx,
    pub dflags: Dflags,
    pub accesses: Accesses,
    pub payload: DepPayload,
    /// Parallel with the previous dep (same parallel group).
    pub parallel: bool,
}

impl Dep {
    /// Whether this dep can ride as a bare member of a chunk.
    fn chunkable(&self) -> Option<Ddate> {
        match self.payload {
            DepPayload::Date { date, sig } if sig == FileSig::default() => Some(date),
            _ => None,
        }
    }
}

/// One star target of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TargetEntry {
    pub node: NodeIdx,
    pub tflags: Tflags,
}

// ---------------------------------------------------------------------------
// Dep vector codec
// ---------------------------------------------------------------------------

fn encode_sig(buf: &mut [u8], sig: &FileSig) {
    buf[0] = match sig.tag {
        FileTag::None => 0,
        FileTag::Reg => 1,
        FileTag::Exe => 2,
        FileTag::Lnk => 3,
        FileTag::Dir => 4,
    };
    buf[1..9].copy_from_slice(&sig.inode.to_le_bytes());
    buf[9..17].copy_from_slice(&sig.mtime.0.to_le_bytes());
    buf[17..25].copy_from_slice(&sig.size.to_le_bytes());
}

fn decode_sig(buf: &[u8]) -> FileSig {
    let tag = match buf[0] {
        1 => FileTag::Reg,
        2 => FileTag::Exe,
        3 => FileTag::Lnk,
        4 => FileTag::Dir,
        _ => FileTag::None,
    };
    FileSig {
        tag,
        inode: u64::from_le_bytes(buf[1..9].try_into().expect("8 bytes")),
        mtime: Ddate(u64::from_le_bytes(buf[9..17].try_into().expect("8 bytes"))),
        size: u64::from_le_bytes(buf[17..25].try_into().expect("8 bytes")),
    }
}

fn encode_crc(buf: &mut [u8], crc: Crc) {
    let (tag, hash): (u8, u128) = match crc {
        Crc::None => (0, 0),
        Crc::Empty => (1, 0),
        Crc::Unknown => (2, 0),
        Crc::Lnk(h) => (3, h),
        Crc::Reg(h) => (4, h),
        Crc::Val(h) => (5, h),
    };
    buf[0] = tag;
    buf[1..17].copy_from_slice(&hash.to_le_bytes());
}

fn decode_crc(buf: &[u8]) -> Crc {
    let hash = u128::from_le_bytes(buf[1..17].try_into().expect("16 bytes"));
    match buf[0] {
        0 => Crc::None,
        1 => Crc::Empty,
        3 => Crc::Lnk(hash),
        4 => Crc::Reg(hash),
        5 => Crc::Val(hash),
        _ => Crc::Unknown,
    }
}

/// Encode a dep vector into its canonical chunked form.
#[must_use]
pub fn encode_deps(deps: &[Dep]) -> Vec<u8> {
    let mut out = Vec::with_capacity(deps.len() * 8);
    let mut i = 0;
    while i < deps.len() {
        // find the maximal chunkable run [i, k]: same flags, same date,
        // internally parallel
        let mut k = i;
        if let Some(date) = deps[i].chunkable() {
            while k + 1 < deps.len()
                && deps[k + 1].parallel
                && deps[k + 1].dflags == deps[i].dflags
                && deps[k + 1].accesses == deps[i].accesses
                && deps[k + 1].chunkable() == Some(date)
            {
                k += 1;
            }
        }
        let header = &deps[k];
        let sz = u32::try_from(k - i).unwrap_or(0);
        let base = out.len();
        out.resize(base + CHUNK_HEADER_SIZE + (k - i) * 4, 0);
        let buf = &mut out[base..];
        buf[0..4].copy_from_slice(&header.node.get().to_le_bytes());
        buf[4..8].copy_from_slice(&sz.to_le_bytes());
        buf[8..10].copy_from_slice(&header.dflags.bits().to_le_bytes());
        buf[10..12].copy_from_slice(&header.accesses.bits().to_le_bytes());
        buf[12] = u8::from(deps[i].parallel);
        match header.payload {
            DepPayload::Date { date, sig } => {
                buf[13] = 0;
                buf[16..24].copy_from_slice(&date.0.to_le_bytes());
                encode_sig(&mut buf[24..49], &sig);
            }
            DepPayload::Crc(crc) => {
                buf[13] = 1;
                encode_crc(&mut buf[49..66], crc);
            }
        }
        for (j, dep) in deps[i..k].iter().enumerate() {
            let off = CHUNK_HEADER_SIZE + j * 4;
            buf[off..off + 4].copy_from_slice(&dep.node.get().to_le_bytes());
        }
        i = k + 1;
    }
    out
}

/// Decode a chunked dep vector back into materialised deps.
pub fn decode_deps(mut buf: &[u8]) -> Result<Vec<Dep>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Err(bad_deps("truncated chunk header"));
        }
        let node_raw = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
        let sz = u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")) as usize;
        let dflags = Dflags::from_bits_truncate(u16::from_le_bytes(buf[8..10].try_into().expect("2 bytes")));
        let accesses =
            Accesses::from_bits_truncate(u16::from_le_bytes(buf[10..12].try_into().expect("2 bytes")));
        let first_parallel = buf[12] != 0;
        let date = Ddate(u64::from_le_bytes(buf[16..24].try_into().expect("8 bytes")));
        let payload = if buf[13] == 0 {
            DepPayload::Date {
                date,
                sig: decode_sig(&buf[24..49]),
            }
        } else {
            DepPayload::Crc(decode_crc(&buf[49..66]))
        };
        let chunk_len = CHUNK_HEADER_SIZE + sz * 4;
        if buf.len() < chunk_len {
            return Err(bad_deps("truncated bare id list"));
        }
        for j in 0..sz {
            let off = CHUNK_HEADER_SIZE + j * 4;
            let raw = u32::from_le_bytes(buf[off..off + 4].try_into().expect("4 bytes"));
            out.push(Dep {
                node: NodeIdx::new(raw).ok_or_else(|| bad_deps("bare node id is null"))?,
                dflags,
                accesses,
                payload: DepPayload::Date {
                    date,
                    sig: FileSig::default(),
                },
                parallel: if j == 0 { first_parallel } else { true },
            });
        }
        out.push(Dep {
            node: NodeIdx::new(node_raw).ok_or_else(|| bad_deps("header node id is null"))?,
            dflags,
            accesses,
            payload,
            parallel: if sz == 0 { first_parallel } else { true },
        });
        buf = &buf[chunk_len..];
    }
    Ok(out)
}

fn bad_deps(detail: &str) -> DroverError {
    DroverError::StoreCorrupt {
        path: "<dep vector>".into(),
        detail: detail.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Target vector codec
// ---------------------------------------------------------------------------

const TARGET_ENTRY_SIZE: usize = 8;

#[must_use]
pub fn encode_targets(targets: &[TargetEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(targets.len() * TARGET_ENTRY_SIZE);
    for t in targets {
        out.extend_from_slice(&t.node.get().to_le_bytes());
        out.extend_from_slice(&t.tflags.bits().to_le_bytes());
        out.extend_from_slice(&[0u8; 2]);
    }
    out
}

pub fn decode_targets(buf: &[u8]) -> Result<Vec<TargetEntry>> {
    if buf.len() % TARGET_ENTRY_SIZE != 0 {
        return Err(bad_deps("target vector length not a multiple of entry size"));
    }
    buf.chunks_exact(TARGET_ENTRY_SIZE)
        .map(|c| {
            let raw = u32::from_le_bytes(c[0..4].try_into().expect("4 bytes"));
            Ok(TargetEntry {
                node: NodeIdx::new(raw).ok_or_else(|| bad_deps("target node id is null"))?,
                tflags: Tflags::from_bits_truncate(u16::from_le_bytes(c[4..6].try_into().expect("2 bytes"))),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Plain id vector codec (job_tgts)
// ---------------------------------------------------------------------------

#[must_use]
pub fn encode_ids(ids: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ids.len() * 4);
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

pub fn decode_ids(buf: &[u8]) -> Result<Vec<u32>> {
    if buf.len() % 4 != 0 {
        return Err(bad_deps("id vector length not a multiple of 4"));
    }
    Ok(buf
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().expect("4 bytes")))
        .collect())
}
