//! Variable-length vector file with a power-of-two size-class free list.
//!
//! Blocks are allocated from an append-only heap; freed blocks go onto one
//! of 32 free lists keyed by size class and are reused before the heap
//! grows. Block layout:
//!
//! ```text
//! Offset  Size  Description
//!   0       4   Live: payload length. Free: FREE_FLAG | size class.
//!   4       4   Live: reserved, zero. Free: next free block index.
//!   8     ...   Payload (block capacity is the covering power of two)
//! ```
//!
//! Updates never rewrite a block another index still points to: `assign`,
//! `append` and `shorten_by` all return the new index and invalidate the
//! old one, per the store contract.

use std::path::Path;

use drover_error::Result;
use drover_types::VecIdx;

use crate::mapfile::{DATA_START, MapFile};

const BLOCK_HEADER: usize = 8;
const FREE_FLAG: u32 = 0x8000_0000;
const MIN_CLASS: u32 = 4; // 16-byte blocks
const N_CLASSES: usize = 32;
/// Block offsets are multiples of this, so a u32 index covers 32 GiB.
const UNIT: usize = 8;

pub struct VecFile {
    inner: MapFile,
    free_heads: [u32; N_CLASSES],
}

impl VecFile {
    pub fn open(path: &Path, magic: u32) -> Result<Self> {
        let inner = MapFile::open(path, magic)?;
        let mut free_heads = [0u32; N_CLASSES];
        let blob = inner.blob();
        if !blob.is_empty() {
            if blob.len() != N_CLASSES * 4 {
                return Err(inner.corrupt("bad free-head table size"));
            }
            for (i, head) in free_heads.iter_mut().enumerate() {
                *head = u32::from_le_bytes(blob[i * 4..i * 4 + 4].try_into().expect("4 bytes"));
            }
        }
        let this = Self { inner, free_heads };
        this.chk()?;
        Ok(this)
    }

    fn save_free_heads(&mut self) -> Result<()> {
        let mut blob = [0u8; N_CLASSES * 4];
        for (i, head) in self.free_heads.iter().enumerate() {
            blob[i * 4..i * 4 + 4].copy_from_slice(&head.to_le_bytes());
        }
        self.inner.set_blob(&blob)
    }

    #[inline]
    fn off(idx: VecIdx) -> usize {
        DATA_START + (idx.get() as usize - 1) * UNIT
    }

    #[inline]
    fn idx_at(off: usize) -> VecIdx {
        let units = (off - DATA_START) / UNIT + 1;
        VecIdx::new(u32::try_from(units).unwrap_or(0)).expect("heap offset fits index space")
    }

    #[inline]
    fn class_for(payload_len: usize) -> u32 {
        let need = (BLOCK_HEADER + payload_len).next_power_of_two();
        need.trailing_zeros().max(MIN_CLASS)
    }

    /// Number of heap bytes in use (high water).
    #[must_use]
    pub fn heap_used(&self) -> usize {
        usize::try_from(self.inner.used()).unwrap_or(usize::MAX)
    }

    fn block_word(&self, idx: VecIdx) -> u32 {
        self.inner.read_u32(Self::off(idx))
    }

    #[must_use]
    pub fn is_live(&self, idx: VecIdx) -> bool {
        let off = Self::off(idx);
        off + BLOCK_HEADER <= DATA_START + self.heap_used() && self.block_word(idx) & FREE_FLAG == 0
    }

    /// Allocate a block holding `payload`.
    pub fn emplace(&mut self, payload: &[u8]) -> Result<VecIdx> {
        let class = Self::class_for(payload.len());
        let cap = 1usize << class;
        let idx = match self.free_heads[class as usize] {
            0 => {
                let off = DATA_START + self.heap_used();
                self.inner.ensure_payload(self.heap_used() + cap)?;
                self.inner.set_used((self.heap_used() + cap) as u64);
                Self::idx_at(off)
            }
            raw => {
                let idx = VecIdx::new(raw)
                    .ok_or_else(|| self.inner.corrupt("bad free head index"))?;
                let off = Self::off(idx);
                let next = self.inner.read_u32(off + 4);
                self.free_heads[class as usize] = next;
                self.save_free_heads()?;
                idx
            }
        };
        let off = Self::off(idx);
        self.inner
            .write_u32(off, u32::try_from(payload.len()).unwrap_or(0));
        self.inner.write_u32(off + 4, 0);
        self.inner
            .bytes_mut(off + BLOCK_HEADER, payload.len())
            .copy_from_slice(payload);
        Ok(idx)
    }

    /// Read a block's payload.
    pub fn get(&self, idx: VecIdx) -> Result<&[u8]> {
        if !self.is_live(idx) {
            return Err(self.inner.corrupt(format!("vector {idx} is not live")));
        }
        let off = Self::off(idx);
        let len = self.block_word(idx) as usize;
        Ok(self.inner.bytes(off + BLOCK_HEADER, len))
    }

    /// Free a block.
    pub fn pop(&mut self, idx: VecIdx) -> Result<()> {
        if !self.is_live(idx) {
            return Err(self.inner.corrupt(format!("double pop of vector {idx}")));
        }
        let off = Self::off(idx);
        let class = Self::class_for(self.block_word(idx) as usize);
        self.inner.write_u32(off, FREE_FLAG | class);
        self.inner
            .write_u32(off + 4, self.free_heads[class as usize]);
        self.free_heads[class as usize] = idx.get();
        self.save_free_heads()
    }

    /// Replace a block's payload; the old index becomes invalid.
    pub fn assign(&mut self, idx: VecIdx, payload: &[u8]) -> Result<VecIdx> {
        let old_len = self.get(idx)?.len();
        if Self::class_for(old_len) == Self::class_for(payload.len()) {
            let off = Self::off(idx);
            self.inner
                .write_u32(off, u32::try_from(payload.len()).unwrap_or(0));
            self.inner
                .bytes_mut(off + BLOCK_HEADER, payload.len())
                .copy_from_slice(payload);
            Ok(idx)
        } else {
            self.pop(idx)?;
            self.emplace(payload)
        }
    }

    /// Append bytes to a block; the old index becomes invalid.
    pub fn append(&mut self, idx: VecIdx, extra: &[u8]) -> Result<VecIdx> {
        let mut payload = self.get(idx)?.to_vec();
        payload.extend_from_slice(extra);
        self.assign(idx, &payload)
    }

    /// Drop the trailing `n` bytes of a block; the old index becomes invalid.
    pub fn shorten_by(&mut self, idx: VecIdx, n: usize) -> Result<VecIdx> {
        let payload = self.get(idx)?.to_vec();
        let keep = payload.len().saturating_sub(n);
        self.assign(idx, &payload[..keep])
    }

    /// Verify heap and free-list structure: blocks tile the heap exactly
    /// and every free-list entry is marked free.
    pub fn chk(&self) -> Result<()> {
        let used = self.heap_used();
        let mut off = DATA_START;
        let mut n_blocks = 0usize;
        while off < DATA_START + used {
            if off + BLOCK_HEADER > DATA_START + used {
                return Err(self.inner.corrupt("trailing partial block header"));
            }
            let word = self.inner.read_u32(off);
            let class = if word & FREE_FLAG != 0 {
                word & !FREE_FLAG
            } else {
                Self::class_for(word as usize)
            };
            if !(MIN_CLASS..32).contains(&class) {
                return Err(self.inner.corrupt(format!("bad block class {class}")));
            }
            off += 1usize << class;
            n_blocks += 1;
        }
        if off != DATA_START + used {
            return Err(self.inner.corrupt("heap blocks do not tile the heap"));
        }
        for (class, head) in self.free_heads.iter().enumerate() {
            let mut cur = *head;
            let mut seen = 0usize;
            while cur != 0 {
                let idx = VecIdx::new(cur)
                    .ok_or_else(|| self.inner.corrupt("bad free-list index"))?;
                let off = Self::off(idx);
                if off + BLOCK_HEADER > DATA_START + used {
                    return Err(self.inner.corrupt("free list points outside heap"));
                }
                let word = self.inner.read_u32(off);
                if word & FREE_FLAG == 0 || (word & !FREE_FLAG) as usize != class {
                    return Err(self
                        .inner
                        .corrupt(format!("free list {class} holds a bad block")));
                }
                seen += 1;
                if seen > n_blocks {
                    return Err(self.inner.corrupt("free list cycle"));
                }
                cur = self.inner.read_u32(off + 4);
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = 0x5644_0003;

    fn open(dir: &tempfile::TempDir) -> VecFile {
        VecFile::open(&dir.path().join("vec.db"), MAGIC).expect("open")
    }

    #[test]
    fn test_emplace_get_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut f = open(&dir);
        let a = f.emplace(b"hello").expect("emplace");
        let b = f.emplace(&[7u8; 100]).expect("emplace");
        assert_eq!(f.get(a).expect("get"), b"hello");
        assert_eq!(f.get(b).expect("get"), &[7u8; 100][..]);
        f.chk().expect("consistent");
    }

    #[test]
    fn test_pop_reuses_same_class() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut f = open(&dir);
        let a = f.emplace(b"12345678").expect("emplace");
        let used = f.heap_used();
        f.pop(a).expect("pop");
        let b = f.emplace(b"abcdefgh").expect("emplace");
        assert_eq!(a, b);
        assert_eq!(f.heap_used(), used);
    }

    #[test]
    fn test_assign_same_class_keeps_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut f = open(&dir);
        let a = f.emplace(b"abc").expect("emplace");
        let b = f.assign(a, b"defgh").expect("assign");
        assert_eq!(a, b);
        assert_eq!(f.get(b).expect("get"), b"defgh");
    }

    #[test]
    fn test_assign_class_change_moves_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut f = open(&dir);
        let a = f.emplace(b"small").expect("emplace");
        let big = vec![3u8; 200];
        let b = f.assign(a, &big).expect("assign");
        assert_ne!(a, b);
        assert!(!f.is_live(a));
        assert_eq!(f.get(b).expect("get"), &big[..]);
        f.chk().expect("consistent");
    }

    #[test]
    fn test_append_and_shorten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut f = open(&dir);
        let a = f.emplace(b"abc").expect("emplace");
        let b = f.append(a, b"def").expect("append");
        assert_eq!(f.get(b).expect("get"), b"abcdef");
        let c = f.shorten_by(b, 4).expect("shorten");
        assert_eq!(f.get(c).expect("get"), b"ab");
    }

    #[test]
    fn test_free_lists_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vec.db");
        let popped;
        {
            let mut f = VecFile::open(&path, MAGIC).expect("open");
            popped = f.emplace(&[1u8; 40]).expect("emplace");
            f.emplace(b"keep").expect("emplace");
            f.pop(popped).expect("pop");
            f.flush().expect("flush");
        }
        let mut f = VecFile::open(&path, MAGIC).expect("reopen");
        f.chk().expect("consistent");
        let again = f.emplace(&[2u8; 40]).expect("emplace");
        assert_eq!(again, popped);
    }
}
