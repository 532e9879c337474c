//! Job name encoding.
//!
//! A job's full name is the name of its matched target followed by
//! [`JOB_SENTINEL`](crate::nametrie::JOB_SENTINEL) and a fixed-width
//! suffix recording the stem spans (position and length of each static
//! stem capture in the target name) and the rule index. Interning both
//! nodes and jobs in one trie makes the shared prefix free.

use drover_error::{DroverError, Result};
use drover_types::RuleIdx;

use crate::nametrie::JOB_SENTINEL;

/// Decoded job name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNameParts {
    /// User-visible part: the matched target name.
    pub prefix: Vec<u8>,
    pub rule: RuleIdx,
    /// (position, length) of each static stem capture in `prefix`.
    pub spans: Vec<(u16, u16)>,
}

/// Build the full (interned) job name.
#[must_use]
pub fn job_full_name(target: &str, rule: RuleIdx, spans: &[(u16, u16)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(target.len() + 1 + spans.len() * 4 + 5);
    out.extend_from_slice(target.as_bytes());
    out.push(JOB_SENTINEL);
    out.push(u8::try_from(spans.len()).unwrap_or(u8::MAX));
    for (pos, len) in spans {
        out.extend_from_slice(&pos.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
    }
    out.extend_from_slice(&rule.get().to_be_bytes());
    out
}

/// Split a full job name back into its parts.
pub fn split_job_name(bytes: &[u8]) -> Result<JobNameParts> {
    let bad = |detail: &str| DroverError::StoreCorrupt {
        path: "<job name>".into(),
        detail: detail.to_owned(),
    };
    let sep = bytes
        .iter()
        .position(|b| *b == JOB_SENTINEL)
        .ok_or_else(|| bad("missing sentinel"))?;
    let prefix = bytes[..sep].to_vec();
    let suffix = &bytes[sep + 1..];
    let n_spans = *suffix.first().ok_or_else(|| bad("missing span count"))? as usize;
    let need = 1 + n_spans * 4 + 4;
    if suffix.len() != need {
        return Err(bad("bad suffix length"));
    }
    let mut spans = Vec::with_capacity(n_spans);
    for i in 0..n_spans {
        let off = 1 + i * 4;
        spans.push((
            u16::from_be_bytes(suffix[off..off + 2].try_into().expect("2 bytes")),
            u16::from_be_bytes(suffix[off + 2..off + 4].try_into().expect("2 bytes")),
        ));
    }
    let rule_raw = u32::from_be_bytes(suffix[1 + n_spans * 4..].try_into().expect("4 bytes"));
    Ok(JobNameParts {
        prefix,
        rule: RuleIdx::new(rule_raw).ok_or_else(|| bad("bad rule index"))?,
        spans,
    })
}

/// Recover the stem values of a job from its name parts.
#[must_use]
pub fn stem_values(parts: &JobNameParts) -> Vec<String> {
    parts
        .spans
        .iter()
        .map(|(pos, len)| {
            let start = *pos as usize;
            let end = (start + *len as usize).min(parts.prefix.len());
            String::from_utf8_lossy(&parts.prefix[start..end]).into_owned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let rule = RuleIdx::new(7).expect("idx");
        let name = job_full_name("out/x.o", rule, &[(4, 1)]);
        let parts = split_job_name(&name).expect("split");
        assert_eq!(parts.prefix, b"out/x.o");
        assert_eq!(parts.rule, rule);
        assert_eq!(parts.spans, vec![(4, 1)]);
        assert_eq!(stem_values(&parts), vec!["x".to_owned()]);
    }

    #[test]
    fn test_no_spans() {
        let rule = RuleIdx::new(1).expect("idx");
        let name = job_full_name("all", rule, &[]);
        let parts = split_job_name(&name).expect("split");
        assert_eq!(parts.prefix, b"all");
        assert!(parts.spans.is_empty());
    }

    #[test]
    fn test_truncated_suffix_is_rejected() {
        let rule = RuleIdx::new(1).expect("idx");
        let mut name = job_full_name("out", rule, &[(0, 1)]);
        name.pop();
        assert!(split_job_name(&name).is_err());
        assert!(split_job_name(b"no-sentinel").is_err());
    }
}
