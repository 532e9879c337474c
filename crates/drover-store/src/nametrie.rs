//! Shared prefix trie interning node and job names.
//!
//! One byte per trie record, children chained through sibling links, so
//! names sharing prefixes share storage. A record is a valid [`NameId`]
//! only once marked terminal; interior records are plumbing. Job names
//! append a rule suffix after [`JOB_SENTINEL`], a byte that never occurs
//! in user paths, so the same table serves both namespaces (see
//! [`crate::jobname`]).

use std::path::Path;

use drover_error::Result;
use drover_types::NameId;

use crate::recfile::{FixedRecord, RecFile};

/// Separates the user-visible job name prefix from the rule suffix.
pub const JOB_SENTINEL: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrieRec {
    parent: u32,
    first_child: u32,
    next_sibling: u32,
    byte: u8,
    terminal: bool,
}

impl FixedRecord for TrieRec {
    const SIZE: usize = 14;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.parent.to_le_bytes());
        buf[4..8].copy_from_slice(&self.first_child.to_le_bytes());
        buf[8..12].copy_from_slice(&self.next_sibling.to_le_bytes());
        buf[12] = self.byte;
        buf[13] = u8::from(self.terminal);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            parent: u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
            first_child: u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")),
            next_sibling: u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes")),
            byte: buf[12],
            terminal: buf[13] != 0,
        }
    }
}

pub struct NameTrie {
    recs: RecFile<TrieRec>,
}

impl NameTrie {
    pub fn open(path: &Path, magic: u32) -> Result<Self> {
        Ok(Self {
            recs: RecFile::open(path, magic)?,
        })
    }

    fn root_head(&self) -> u32 {
        u32::try_from(self.recs.aux()).unwrap_or(0)
    }

    fn set_root_head(&mut self, head: u32) {
        self.recs.set_aux(u64::from(head));
    }

    fn child_of(&self, parent: u32, byte: u8) -> Result<Option<u32>> {
        let mut cur = if parent == 0 {
            self.root_head()
        } else {
            self.recs.get(parent)?.first_child
        };
        while cur != 0 {
            let rec = self.recs.get(cur)?;
            if rec.byte == byte {
                return Ok(Some(cur));
            }
            cur = rec.next_sibling;
        }
        Ok(None)
    }

    /// Intern `name`, creating records as needed, and mark it terminal.
    pub fn insert(&mut self, name: &[u8]) -> Result<NameId> {
        debug_assert!(!name.is_empty(), "cannot intern an empty name");
        let mut cur = 0u32;
        for &byte in name {
            cur = match self.child_of(cur, byte)? {
                Some(child) => child,
                None => {
                    let head = if cur == 0 {
                        self.root_head()
                    } else {
                        self.recs.get(cur)?.first_child
                    };
                    let idx = self.recs.emplace(&TrieRec {
                        parent: cur,
                        first_child: 0,
                        next_sibling: head,
                        byte,
                        terminal: false,
                    })?;
                    if cur == 0 {
                        self.set_root_head(idx);
                    } else {
                        let mut parent = self.recs.get(cur)?;
                        parent.first_child = idx;
                        self.recs.put(cur, &parent)?;
                    }
                    idx
                }
            };
        }
        let mut rec = self.recs.get(cur)?;
        if !rec.terminal {
            rec.terminal = true;
            self.recs.put(cur, &rec)?;
        }
        NameId::new(cur).ok_or_else(|| self.recs.corrupt("name index exceeds guard budget"))
    }

    /// Find an already-interned name.
    pub fn lookup(&self, name: &[u8]) -> Result<Option<NameId>> {
        let mut cur = 0u32;
        for &byte in name {
            match self.child_of(cur, byte)? {
                Some(child) => cur = child,
                None => return Ok(None),
            }
        }
        let rec = self.recs.get(cur)?;
        Ok(if rec.terminal { NameId::new(cur) } else { None })
    }

    /// Reconstruct the full name of an interned id by walking parents.
    pub fn name_of(&self, id: NameId) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut cur = id.get();
        while cur != 0 {
            let rec = self.recs.get(cur)?;
            out.push(rec.byte);
            cur = rec.parent;
        }
        out.reverse();
        Ok(out)
    }

    /// Whether `id` names a terminal entry.
    pub fn is_terminal(&self, id: NameId) -> Result<bool> {
        Ok(self.recs.get(id.get())?.terminal)
    }

    /// Verify parent/child link consistency for every live record.
    pub fn chk(&self) -> Result<()> {
        self.recs.chk()?;
        for (idx, rec) in self.recs.iter_live() {
            if rec.parent != 0 && !self.recs.is_live(rec.parent) {
                return Err(self
                    .recs
                    .corrupt(format!("trie record {idx} has dead parent {}", rec.parent)));
            }
            if rec.first_child != 0 {
                let child = self.recs.get(rec.first_child)?;
                if child.parent != idx {
                    return Err(self
                        .recs
                        .corrupt(format!("trie record {idx} child link mismatch")));
                }
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.recs.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = 0x5644_0004;

    fn open(dir: &tempfile::TempDir) -> NameTrie {
        NameTrie::open(&dir.path().join("names.db"), MAGIC).expect("open")
    }

    #[test]
    fn test_insert_lookup_name_of() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut t = open(&dir);
        let a = t.insert(b"src/main.c").expect("insert");
        let b = t.insert(b"src/main.o").expect("insert");
        assert_ne!(a, b);
        assert_eq!(t.lookup(b"src/main.c").expect("lookup"), Some(a));
        assert_eq!(t.lookup(b"src/main.o").expect("lookup"), Some(b));
        assert_eq!(t.name_of(a).expect("name"), b"src/main.c");
        assert_eq!(t.name_of(b).expect("name"), b"src/main.o");
        t.chk().expect("consistent");
    }

    #[test]
    fn test_insert_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut t = open(&dir);
        let a = t.insert(b"out/x").expect("insert");
        let b = t.insert(b"out/x").expect("insert");
        assert_eq!(a, b);
    }

    #[test]
    fn test_prefix_is_not_terminal_unless_inserted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut t = open(&dir);
        t.insert(b"dir/file").expect("insert");
        assert_eq!(t.lookup(b"dir/").expect("lookup"), None);
        assert_eq!(t.lookup(b"dir/fi").expect("lookup"), None);
        let d = t.insert(b"dir/").expect("insert");
        assert_eq!(t.lookup(b"dir/").expect("lookup"), Some(d));
    }

    #[test]
    fn test_shared_prefix_shares_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut t = open(&dir);
        t.insert(b"abc").expect("insert");
        let before = t.recs.n_slots();
        t.insert(b"abd").expect("insert");
        // only the final byte differs, so exactly one new record
        assert_eq!(t.recs.n_slots(), before + 1);
    }

    #[test]
    fn test_job_and_node_names_coexist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut t = open(&dir);
        let node = t.insert(b"out/x").expect("insert");
        let mut job_name = b"out/x".to_vec();
        job_name.push(JOB_SENTINEL);
        job_name.extend_from_slice(&[0, 3, 0, 1, 0, 0, 0, 2]);
        let job = t.insert(&job_name).expect("insert");
        assert_ne!(node, job);
        assert_eq!(t.name_of(job).expect("name"), job_name);
        assert_eq!(t.lookup(b"out/x").expect("lookup"), Some(node));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("names.db");
        let id;
        {
            let mut t = NameTrie::open(&path, MAGIC).expect("open");
            id = t.insert(b"persisted/name").expect("insert");
            t.flush().expect("flush");
        }
        let t = NameTrie::open(&path, MAGIC).expect("reopen");
        assert_eq!(t.lookup(b"persisted/name").expect("lookup"), Some(id));
        t.chk().expect("consistent");
    }
}
