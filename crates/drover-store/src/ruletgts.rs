//! Rule-target candidate index.
//!
//! Every target pattern of every rule contributes one entry, persisted as
//! a small record and indexed in memory as a two-level multi-child prefix
//! tree: the outer tree is keyed by the pattern's fixed suffix (walked
//! from the end of the name), and each suffix node holds an inner tree
//! keyed by the fixed prefix (walked from the start). A lookup therefore
//! touches only the entries whose literal parts frame the node name,
//! never the whole table. Results come back ordered by descending rule
//! priority (longest suffix, then longest prefix, breaking ties), ready
//! for lazy regex confirmation by the node engine.

use std::collections::HashMap;

use drover_types::RuleIdx;

use crate::recfile::FixedRecord;

/// Persistent form: enough to rebuild the in-memory tree against the rule
/// table at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleTgtRec {
    pub rule: u32,
    pub tgt_idx: u16,
    pub prio: i32,
}

impl FixedRecord for RuleTgtRec {
    const SIZE: usize = 10;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.rule.to_le_bytes());
        buf[4..6].copy_from_slice(&self.tgt_idx.to_le_bytes());
        buf[6..10].copy_from_slice(&self.prio.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            rule: u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
            tgt_idx: u16::from_le_bytes(buf[4..6].try_into().expect("2 bytes")),
            prio: i32::from_le_bytes(buf[6..10].try_into().expect("4 bytes")),
        }
    }
}

/// One candidate (rule, target pattern) a node name may match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTgt {
    pub rule: RuleIdx,
    pub tgt_idx: usize,
    pub prefix: String,
    pub suffix: String,
    pub prio: i32,
    /// Anti-rules forbid rather than produce.
    pub is_anti: bool,
}

/// Inner level: a multi-child tree over fixed-prefix bytes.
///
/// Entries sit at the node where their prefix ends; walking a name from
/// its first byte visits exactly the entries whose prefix it starts with.
#[derive(Debug, Default)]
struct PfxNode {
    children: HashMap<u8, PfxNode>,
    entries: Vec<RuleTgt>,
}

impl PfxNode {
    fn insert(&mut self, prefix: &[u8], entry: RuleTgt) {
        match prefix.split_first() {
            None => self.entries.push(entry),
            Some((byte, rest)) => self
                .children
                .entry(*byte)
                .or_default()
                .insert(rest, entry),
        }
    }

    /// Collect every entry whose prefix is a prefix of `name`.
    ///
    /// `name` is already clipped so the suffix matched so far cannot
    /// overlap the prefix (the frame must fit inside the name).
    fn collect<'a>(&'a self, name: &[u8], out: &mut Vec<&'a RuleTgt>) {
        out.extend(self.entries.iter());
        if let Some((byte, rest)) = name.split_first() {
            if let Some(child) = self.children.get(byte) {
                child.collect(rest, out);
            }
        }
    }
}

/// Outer level: a multi-child tree over fixed-suffix bytes, walked from
/// the end of the name.
#[derive(Debug, Default)]
struct SfxNode {
    children: HashMap<u8, SfxNode>,
    prefixes: PfxNode,
}

impl SfxNode {
    fn insert(&mut self, rev_suffix: &[u8], prefix: &[u8], entry: RuleTgt) {
        match rev_suffix.split_first() {
            None => self.prefixes.insert(prefix, entry),
            Some((byte, rest)) => self
                .children
                .entry(*byte)
                .or_default()
                .insert(rest, prefix, entry),
        }
    }
}

/// In-memory candidate index, rebuilt whenever rules change.
#[derive(Debug, Default)]
pub struct RuleTgtIndex {
    root: SfxNode,
    n_entries: usize,
}

impl RuleTgtIndex {
    pub fn rebuild(&mut self, entries: Vec<RuleTgt>) {
        self.root = SfxNode::default();
        self.n_entries = entries.len();
        for entry in entries {
            let rev_suffix: Vec<u8> = entry.suffix.bytes().rev().collect();
            let prefix = entry.prefix.clone().into_bytes();
            self.root.insert(&rev_suffix, &prefix, entry);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.n_entries == 0
    }

    /// Candidates whose fixed prefix and suffix frame `name`, by
    /// descending priority (then longest suffix, then longest prefix).
    #[must_use]
    pub fn candidates(&self, name: &str) -> Vec<RuleTgt> {
        let bytes = name.as_bytes();
        let mut found: Vec<&RuleTgt> = Vec::new();
        let mut node = &self.root;
        let mut matched_suffix = 0usize;
        loop {
            // entries at this suffix depth: their prefix may use the rest
            // of the name, never the part claimed by the suffix
            node.prefixes
                .collect(&bytes[..bytes.len() - matched_suffix], &mut found);
            if matched_suffix == bytes.len() {
                break;
            }
            let byte = bytes[bytes.len() - 1 - matched_suffix];
            match node.children.get(&byte) {
                Some(child) => {
                    node = child;
                    matched_suffix += 1;
                }
                None => break,
            }
        }
        let mut out: Vec<RuleTgt> = found.into_iter().cloned().collect();
        out.sort_by(|a, b| {
            b.prio
                .cmp(&a.prio)
                .then(b.suffix.len().cmp(&a.suffix.len()))
                .then(b.prefix.len().cmp(&a.prefix.len()))
                .then(a.rule.cmp(&b.rule))
                .then(a.tgt_idx.cmp(&b.tgt_idx))
        });
        out
    }
}
