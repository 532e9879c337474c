//! Memory-mapped store file with a typed, versioned preamble.
//!
//! Every store file starts with the same 64-byte preamble followed by a
//! small header blob area, with payload data beginning at [`DATA_START`]:
//!
//! ```text
//! Offset  Size  Description
//!   0       4   Magic (per file kind)
//!   4       4   Store version (shared across all files)
//!   8       8   Used count (slots or heap units, per file kind)
//!  16       4   Free-list head (0 = empty; vector files keep theirs in the blob)
//!  20       8   Aux scalar (per file kind: seq_id, match_gen, ...)
//!  28       4   Header blob length
//!  32      32   Reserved, zero
//!  64    4032   Header blob area (serialized persistent sets)
//! 4096     ...  Payload
//! ```
//!
//! All integers are little-endian. The preamble is rewritten in place; a
//! torn write can only affect the last in-flight update, never the layout.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use drover_error::{DroverError, Result};

/// Shared on-disk version marker. Bump on any layout change.
pub const STORE_VERSION: u32 = 1;

/// Offset at which payload data begins.
pub const DATA_START: usize = 4096;

/// Capacity of the header blob area.
pub const BLOB_CAP: usize = DATA_START - PREAMBLE_SIZE;

const PREAMBLE_SIZE: usize = 64;
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_USED: usize = 8;
const OFF_FREE_HEAD: usize = 16;
const OFF_AUX: usize = 20;
const OFF_BLOB_LEN: usize = 28;

/// Minimum bytes to grow by, to keep remaps rare.
const GROW_CHUNK: usize = 1 << 16;

#[derive(Debug)]
pub struct MapFile {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl MapFile {
    /// Open a store file, creating and formatting it if absent.
    ///
    /// An existing file must carry the expected magic and [`STORE_VERSION`];
    /// a wrong version is reported distinctly from corruption.
    pub fn open(path: &Path, magic: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| DroverError::StoreUnavailable {
                path: path.to_path_buf(),
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| DroverError::StoreUnavailable {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        let fresh = len == 0;
        if fresh {
            file.set_len(DATA_START as u64)?;
        }
        // SAFETY: we are the single writer (process-granularity contract);
        // the mapping is private to this handle.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| {
            DroverError::StoreUnavailable {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let mut this = Self {
            path: path.to_path_buf(),
            file,
            map,
        };
        if fresh {
            this.write_u32(OFF_MAGIC, magic);
            this.write_u32(OFF_VERSION, STORE_VERSION);
            this.write_u64(OFF_USED, 0);
            this.write_u32(OFF_FREE_HEAD, 0);
            this.write_u64(OFF_AUX, 0);
            this.write_u32(OFF_BLOB_LEN, 0);
            this.flush()?;
        } else {
            if this.map.len() < DATA_START {
                return Err(this.corrupt("file shorter than preamble"));
            }
            if this.read_u32(OFF_MAGIC) != magic {
                return Err(this.corrupt("bad magic"));
            }
            let found = this.read_u32(OFF_VERSION);
            if found != STORE_VERSION {
                return Err(DroverError::StoreVersion {
                    path: this.path.clone(),
                    found,
                    expected: STORE_VERSION,
                });
            }
            if this.read_u32(OFF_BLOB_LEN) as usize > BLOB_CAP {
                return Err(this.corrupt("header blob overflows its area"));
            }
        }
        Ok(this)
    }

    /// Build a corruption error pinned to this file.
    pub fn corrupt(&self, detail: impl Into<String>) -> DroverError {
        DroverError::StoreCorrupt {
            path: self.path.clone(),
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total mapped length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= DATA_START
    }

    /// Grow the file so that `DATA_START + payload_len` bytes are mapped.
    pub fn ensure_payload(&mut self, payload_len: usize) -> Result<()> {
        let needed = DATA_START + payload_len;
        if needed <= self.map.len() {
            return Ok(());
        }
        let new_len = needed.max(self.map.len() + GROW_CHUNK);
        self.map.flush()?;
        self.file.set_len(new_len as u64)?;
        // SAFETY: same single-writer contract as in `open`.
        self.map = unsafe { MmapMut::map_mut(&self.file) }?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    // --- preamble accessors ---

    #[must_use]
    pub fn used(&self) -> u64 {
        self.read_u64(OFF_USED)
    }

    pub fn set_used(&mut self, used: u64) {
        self.write_u64(OFF_USED, used);
    }

    #[must_use]
    pub fn free_head(&self) -> u32 {
        self.read_u32(OFF_FREE_HEAD)
    }

    pub fn set_free_head(&mut self, head: u32) {
        self.write_u32(OFF_FREE_HEAD, head);
    }

    #[must_use]
    pub fn aux(&self) -> u64 {
        self.read_u64(OFF_AUX)
    }

    pub fn set_aux(&mut self, aux: u64) {
        self.write_u64(OFF_AUX, aux);
    }

    /// Read the header blob.
    #[must_use]
    pub fn blob(&self) -> &[u8] {
        let len = self.read_u32(OFF_BLOB_LEN) as usize;
        &self.map[PREAMBLE_SIZE..PREAMBLE_SIZE + len.min(BLOB_CAP)]
    }

    /// Replace the header blob.
    pub fn set_blob(&mut self, blob: &[u8]) -> Result<()> {
        if blob.len() > BLOB_CAP {
            return Err(self.corrupt(format!(
                "header blob too large: {} > {BLOB_CAP}",
                blob.len()
            )));
        }
        self.map[PREAMBLE_SIZE..PREAMBLE_SIZE + blob.len()].copy_from_slice(blob);
        self.write_u32(OFF_BLOB_LEN, u32::try_from(blob.len()).unwrap_or(0));
        Ok(())
    }

    // --- raw accessors (absolute offsets) ---

    #[must_use]
    pub fn read_u32(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.map[off..off + 4]);
        u32::from_le_bytes(b)
    }

    pub fn write_u32(&mut self, off: usize, v: u32) {
        self.map[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    #[must_use]
    pub fn read_u64(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.map[off..off + 8]);
        u64::from_le_bytes(b)
    }

    pub fn write_u64(&mut self, off: usize, v: u64) {
        self.map[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    #[must_use]
    pub fn bytes(&self, off: usize, len: usize) -> &[u8] {
        &self.map[off..off + len]
    }

    pub fn bytes_mut(&mut self, off: usize, len: usize) -> &mut [u8] {
        &mut self.map[off..off + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = 0x5644_0001;

    #[test]
    fn test_fresh_file_is_formatted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.db");
        let f = MapFile::open(&path, MAGIC).expect("open");
        assert_eq!(f.used(), 0);
        assert_eq!(f.free_head(), 0);
        assert!(f.blob().is_empty());
        assert_eq!(f.len(), DATA_START);
    }

    #[test]
    fn test_reopen_preserves_preamble_and_blob() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.db");
        {
            let mut f = MapFile::open(&path, MAGIC).expect("open");
            f.set_used(7);
            f.set_aux(42);
            f.set_blob(b"hello sets").expect("blob");
            f.flush().expect("flush");
        }
        let f = MapFile::open(&path, MAGIC).expect("reopen");
        assert_eq!(f.used(), 7);
        assert_eq!(f.aux(), 42);
        assert_eq!(f.blob(), b"hello sets");
    }

    #[test]
    fn test_bad_magic_is_corruption_not_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.db");
        drop(MapFile::open(&path, MAGIC).expect("open"));
        let err = MapFile::open(&path, MAGIC + 1).expect_err("must fail");
        assert!(matches!(err, DroverError::StoreCorrupt { .. }));
    }

    #[test]
    fn test_version_mismatch_is_distinct() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.db");
        {
            let mut f = MapFile::open(&path, MAGIC).expect("open");
            f.write_u32(OFF_VERSION, STORE_VERSION + 9);
            f.flush().expect("flush");
        }
        let err = MapFile::open(&path, MAGIC).expect_err("must fail");
        match err {
            DroverError::StoreVersion {
                found, expected, ..
            } => {
                assert_eq!(found, STORE_VERSION + 9);
                assert_eq!(expected, STORE_VERSION);
            }
            other => panic!("expected version error, got {other}"),
        }
    }

    #[test]
    fn test_growth_preserves_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.db");
        let mut f = MapFile::open(&path, MAGIC).expect("open");
        f.ensure_payload(16).expect("grow");
        f.bytes_mut(DATA_START, 4).copy_from_slice(b"abcd");
        f.ensure_payload(1 << 20).expect("grow big");
        assert_eq!(f.bytes(DATA_START, 4), b"abcd");
    }
}
