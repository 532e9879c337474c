//! Compiled rules and their persistent representation.
//!
//! The fixed-size rule record only carries generation counters and the
//! index of the rule's serialized body in the rule-string file; everything
//! else (patterns, script, resources) lives in the body. Target patterns
//! are split into a fixed prefix, a stem-bearing middle and a fixed suffix;
//! the prefix/suffix pair feeds the rule-target index, the middle is
//! compiled to a regex by the node engine.

use drover_types::{Dflags, Tflags};

use crate::recfile::FixedRecord;

/// A target or dep pattern: literal text with `{stem}` references.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RulePattern {
    pub pattern: String,
}

impl RulePattern {
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// Fixed literal prefix: everything before the first stem reference.
    #[must_use]
    pub fn fixed_prefix(&self) -> &str {
        match self.pattern.find('{') {
            Some(i) => &self.pattern[..i],
            None => &self.pattern,
        }
    }

    /// Fixed literal suffix: everything after the last stem reference.
    #[must_use]
    pub fn fixed_suffix(&self) -> &str {
        match self.pattern.rfind('}') {
            Some(i) => &self.pattern[i + 1..],
            None => &self.pattern,
        }
    }

    /// Whether the pattern contains stem references at all.
    #[must_use]
    pub fn has_stems(&self) -> bool {
        self.pattern.contains('{')
    }

    /// Stem names referenced, in order of appearance.
    #[must_use]
    pub fn stem_refs(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut rest = self.pattern.as_str();
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                break;
            };
            out.push(&rest[open + 1..open + close]);
            rest = &rest[open + close + 1..];
        }
        out
    }

    /// Substitute stem values into the pattern.
    ///
    /// Returns `None` if a referenced stem has no binding.
    #[must_use]
    pub fn substitute(&self, stems: &[(String, String)]) -> Option<String> {
        let mut out = String::with_capacity(self.pattern.len());
        let mut rest = self.pattern.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let close = rest[open..].find('}')? + open;
            let name = &rest[open + 1..close];
            let (_, value) = stems.iter().find(|(n, _)| n == name)?;
            out.push_str(value);
            rest = &rest[close + 1..];
        }
        out.push_str(rest);
        Some(out)
    }
}

/// A declared target of a rule.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuleTarget {
    pub key: String,
    pub pattern: RulePattern,
    pub tflags: Tflags,
    /// Star targets match many files; static targets exactly one.
    pub star: bool,
}

/// A declared static dep of a rule.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuleDep {
    pub key: String,
    pub pattern: RulePattern,
    pub dflags: Dflags,
}

/// The serialized body of a compiled rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct RuleData {
    pub name: String,
    /// Higher priority rules are tried first on target matching.
    pub prio: i32,
    /// Job command, run through the interpreter.
    pub script: String,
    /// Interpreter argv prefix, e.g. `["/bin/sh", "-c"]`.
    pub interpreter: Vec<String>,
    /// Stem name to regex fragment.
    pub stems: Vec<(String, String)>,
    pub targets: Vec<RuleTarget>,
    pub deps: Vec<RuleDep>,
    /// Environment passed to the job.
    pub env: Vec<(String, String)>,
    /// Resource name to amount spec, passed to the backend.
    pub rsrcs: Vec<(String, String)>,
    /// Parallel tokens this job consumes.
    pub tokens: u32,
    /// Wall-clock budget in nanoseconds, 0 = unlimited.
    pub timeout_ns: u64,
    /// Anti-rules forbid matching nodes from being built.
    pub is_anti: bool,
}

impl RuleData {
    /// Number of stems used by static (non-star) targets.
    #[must_use]
    pub fn n_static_stems(&self) -> usize {
        let mut seen: Vec<&str> = Vec::new();
        for t in self.targets.iter().filter(|t| !t.star) {
            for s in t.pattern.stem_refs() {
                if !seen.contains(&s) {
                    seen.push(s);
                }
            }
        }
        seen.len()
    }

    #[must_use]
    pub fn n_static_targets(&self) -> usize {
        self.targets.iter().filter(|t| !t.star).count()
    }

    #[must_use]
    pub fn n_static_deps(&self) -> usize {
        self.deps.len()
    }
}

/// Fixed-size rule record.
///
/// `cmd_gen` advances when the command text changes, `rsrcs_gen` when the
/// command or the resource spec changes; jobs compare their `exec_gen`
/// against these to decide command-freshness reruns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleRecord {
    /// Index of the serialized [`RuleData`] in the rule-string file.
    pub data: u32,
    pub cmd_gen: u32,
    pub rsrcs_gen: u32,
    /// Rolling estimate of this rule's execution time, nanoseconds.
    pub exec_time_ns: u64,
}

impl FixedRecord for RuleRecord {
    const SIZE: usize = 20;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.data.to_le_bytes());
        buf[4..8].copy_from_slice(&self.cmd_gen.to_le_bytes());
        buf[8..12].copy_from_slice(&self.rsrcs_gen.to_le_bytes());
        buf[12..20].copy_from_slice(&self.exec_time_ns.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            data: u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
            cmd_gen: u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")),
            rsrcs_gen: u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes")),
            exec_time_ns: u64::from_le_bytes(buf[12..20].try_into().expect("8 bytes")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_prefix_suffix_split() {
        let p = RulePattern::new("build/{dir}/obj/{base}.o");
        assert_eq!(p.fixed_prefix(), "build/");
        assert_eq!(p.fixed_suffix(), ".o");
        assert_eq!(p.stem_refs(), vec!["dir", "base"]);
    }

    #[test]
    fn test_pattern_without_stems() {
        let p = RulePattern::new("Makefile");
        assert_eq!(p.fixed_prefix(), "Makefile");
        assert_eq!(p.fixed_suffix(), "Makefile");
        assert!(!p.has_stems());
        assert!(p.stem_refs().is_empty());
    }

    #[test]
    fn test_substitute() {
        let p = RulePattern::new("{base}.o");
        let stems = vec![("base".to_owned(), "src/main".to_owned())];
        assert_eq!(p.substitute(&stems), Some("src/main.o".to_owned()));
        assert_eq!(p.substitute(&[]), None);
    }

    #[test]
    fn test_static_stem_count_dedups() {
        let rule = RuleData {
            targets: vec![
                RuleTarget {
                    key: "obj".into(),
                    pattern: RulePattern::new("{base}.o"),
                    tflags: Tflags::empty(),
                    star: false,
                },
                RuleTarget {
                    key: "lst".into(),
                    pattern: RulePattern::new("{base}.lst"),
                    tflags: Tflags::empty(),
                    star: false,
                },
                RuleTarget {
                    key: "extra".into(),
                    pattern: RulePattern::new("{base}.{ext}.tmp"),
                    tflags: Tflags::empty(),
                    star: true,
                },
            ],
            ..RuleData::default()
        };
        assert_eq!(rule.n_static_stems(), 1);
        assert_eq!(rule.n_static_targets(), 2);
    }

    #[test]
    fn test_rule_record_round_trip() {
        let rec = RuleRecord {
            data: 12,
            cmd_gen: 3,
            rsrcs_gen: 4,
            exec_time_ns: 1_500_000_000,
        };
        let mut buf = [0u8; RuleRecord::SIZE];
        rec.encode(&mut buf);
        assert_eq!(RuleRecord::decode(&buf), rec);
    }
}
