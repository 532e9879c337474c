//! Autodep child environment encoding.
//!
//! A traced child finds its configuration in one environment variable,
//! encoded as a compact colon-separated string:
//!
//! ```text
//! service:options:src_dirs:tmp_dir:tmp_view:root_dir
//! ```
//!
//! - `service` is a double-quoted printable-escaped string: either
//!   `host:port` to reach the gather server, or a log file path.
//! - `options` is a character set drawn from `{d i m n f a r}`:
//!   disabled, ignore-stat, auto-mkdir, link-support None/File/Full,
//!   reliable-dirs.
//! - `src_dirs` is a comma-separated list of double-quoted
//!   printable-escaped dirs, each ending in `/`.
//! - `tmp_dir`, `tmp_view` and `root_dir` are single double-quoted
//!   printable-escaped paths (`tmp_view` may be empty, meaning no
//!   remapping).
//!
//! The empty string disables autodep entirely.

use std::fmt;

use drover_error::{DroverError, Result};

/// Name of the environment variable carrying the encoding.
pub const AUTODEP_ENV_VAR: &str = "DROVER_AUTODEP_ENV";

/// How far symlink accesses are reported as deps.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
pub enum LnkSupport {
    /// Links are not analyzed.
    None,
    /// Final-component links are analyzed.
    File,
    /// Links anywhere along paths are analyzed.
    #[default]
    Full,
}

/// Decoded autodep environment.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct AutodepEnv {
    /// `host:port` of the gather server, or a log file path.
    pub service: String,
    pub disabled: bool,
    /// Stat-like syscalls do not generate deps.
    pub ignore_stat: bool,
    /// Create missing dirs on chdir.
    pub auto_mkdir: bool,
    /// Dir contents are trusted to be stable (no NFS guard needed).
    pub reliable_dirs: bool,
    pub lnk_support: LnkSupport,
    /// Source dir prefixes, each ending in `/`.
    pub src_dirs: Vec<String>,
    pub tmp_dir: String,
    /// When non-empty, tmp accesses are remapped under this view.
    pub tmp_view: String,
    pub root_dir: String,
}

fn escape_into(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if (' '..='~').contains(&c) => out.push(c),
            c => {
                for b in c.to_string().as_bytes() {
                    out.push_str(&format!("\\x{b:02x}"));
                }
            }
        }
    }
    out.push('"');
}

/// Parse a double-quoted escaped string starting at `pos`.
///
/// Returns the decoded string and the position just past the closing quote.
fn parse_quoted(env: &str, pos: usize) -> Result<(String, usize)> {
    let bytes = env.as_bytes();
    let bad = || DroverError::BadAutodepEnv {
        env: env.to_owned(),
    };
    if bytes.get(pos) != Some(&b'"') {
        return Err(bad());
    }
    let mut out = Vec::new();
    let mut i = pos + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Ok((String::from_utf8_lossy(&out).into_owned(), i + 1)),
            b'\\' => {
                let esc = bytes.get(i + 1).ok_or_else(bad)?;
                match esc {
                    b'"' => out.push(b'"'),
                    b'\\' => out.push(b'\\'),
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'x' => {
                        let hex = env.get(i + 2..i + 4).ok_or_else(bad)?;
                        out.push(u8::from_str_radix(hex, 16).map_err(|_| bad())?);
                        i += 2;
                    }
                    _ => return Err(bad()),
                }
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Err(bad())
}

impl AutodepEnv {
    /// Decode from the environment string. Empty means disabled.
    pub fn decode(env: &str) -> Result<Self> {
        if env.is_empty() {
            return Ok(Self {
                disabled: true,
                ..Self::default()
            });
        }
        let bad = || DroverError::BadAutodepEnv {
            env: env.to_owned(),
        };
        let mut this = Self::default();
        // service
        let (service, mut pos) = parse_quoted(env, 0)?;
        this.service = service;
        if env.as_bytes().get(pos) != Some(&b':') {
            return Err(bad());
        }
        pos += 1;
        // options
        let opts_end = env[pos..].find(':').ok_or_else(bad)? + pos;
        for c in env[pos..opts_end].chars() {
            match c {
                'd' => this.disabled = true,
                'i' => this.ignore_stat = true,
                'm' => this.auto_mkdir = true,
                'r' => this.reliable_dirs = true,
                'n' => this.lnk_support = LnkSupport::None,
                'f' => this.lnk_support = LnkSupport::File,
                'a' => this.lnk_support = LnkSupport::Full,
                _ => return Err(bad()),
            }
        }
        pos = opts_end + 1;
        // src dirs
        let mut first = true;
        while env.as_bytes().get(pos) != Some(&b':') {
            if !first {
                if env.as_bytes().get(pos) != Some(&b',') {
                    return Err(bad());
                }
                pos += 1;
            }
            let (dir, next) = parse_quoted(env, pos)?;
            if !dir.ends_with('/') {
                return Err(bad());
            }
            this.src_dirs.push(dir);
            pos = next;
            first = false;
        }
        pos += 1;
        // tmp dir, tmp view, root dir
        let (tmp_dir, next) = parse_quoted(env, pos)?;
        this.tmp_dir = tmp_dir;
        if env.as_bytes().get(next) != Some(&b':') {
            return Err(bad());
        }
        let (tmp_view, next) = parse_quoted(env, next + 1)?;
        this.tmp_view = tmp_view;
        if env.as_bytes().get(next) != Some(&b':') {
            return Err(bad());
        }
        let (root_dir, end) = parse_quoted(env, next + 1)?;
        this.root_dir = root_dir;
        if end != env.len() {
            return Err(bad());
        }
        Ok(this)
    }

    /// Encode to the environment string.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64 + self.root_dir.len());
        escape_into(&mut out, &self.service);
        out.push(':');
        if self.disabled {
            out.push('d');
        }
        if self.ignore_stat {
            out.push('i');
        }
        if self.auto_mkdir {
            out.push('m');
        }
        match self.lnk_support {
            LnkSupport::None => out.push('n'),
            LnkSupport::File => out.push('f'),
            LnkSupport::Full => out.push('a'),
        }
        if self.reliable_dirs {
            out.push('r');
        }
        out.push(':');
        for (i, dir) in self.src_dirs.iter().enumerate() {
            debug_assert!(dir.ends_with('/'), "src dirs are stored with trailing /");
            if i > 0 {
                out.push(',');
            }
            escape_into(&mut out, dir);
        }
        out.push(':');
        escape_into(&mut out, &self.tmp_dir);
        out.push(':');
        escape_into(&mut out, &self.tmp_view);
        out.push(':');
        escape_into(&mut out, &self.root_dir);
        out
    }
}

impl fmt::Display for AutodepEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> AutodepEnv {
        AutodepEnv {
            service: "127.0.0.1:4311".to_owned(),
            disabled: false,
            ignore_stat: false,
            auto_mkdir: true,
            reliable_dirs: true,
            lnk_support: LnkSupport::File,
            src_dirs: vec!["src/".to_owned(), "vendor/zlib/".to_owned()],
            tmp_dir: "/tmp/drover.1234".to_owned(),
            tmp_view: String::new(),
            root_dir: "/home/user/repo".to_owned(),
        }
    }

    #[test]
    fn test_round_trip() {
        let env = sample();
        let encoded = env.encode();
        assert_eq!(AutodepEnv::decode(&encoded).expect("decode"), env);
    }

    #[test]
    fn test_empty_means_disabled() {
        let env = AutodepEnv::decode("").expect("decode");
        assert!(env.disabled);
        assert!(env.service.is_empty());
    }

    #[test]
    fn test_no_src_dirs() {
        let mut env = sample();
        env.src_dirs.clear();
        let encoded = env.encode();
        assert_eq!(AutodepEnv::decode(&encoded).expect("decode"), env);
    }

    #[test]
    fn test_paths_with_separators_survive() {
        let mut env = sample();
        env.root_dir = "/odd:path/with \"quotes\"/and\nnewline".to_owned();
        env.src_dirs = vec!["di:r,with/punct/".to_owned()];
        let encoded = env.encode();
        assert_eq!(AutodepEnv::decode(&encoded).expect("decode"), env);
    }

    #[test]
    fn test_bad_option_char_is_rejected() {
        let mut env = sample().encode();
        // splice a bogus option char into the options field
        let colon = env.find("\":").expect("service end") + 2;
        env.insert(colon, 'z');
        assert!(AutodepEnv::decode(&env).is_err());
    }

    #[test]
    fn test_src_dir_without_slash_is_rejected() {
        let enc = "\"h:1\":a:\"src\":\"/tmp\":\"\":\"/r\"";
        assert!(AutodepEnv::decode(enc).is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip_arbitrary_paths(
            root in "[ -~]{0,40}",
            tmp in "[ -~]{0,20}",
            dirs in proptest::collection::vec("[a-z:,\"\\\\]{1,10}", 0..4),
        ) {
            let env = AutodepEnv {
                service: "logfile".to_owned(),
                root_dir: root,
                tmp_dir: tmp,
                src_dirs: dirs.into_iter().map(|d| format!("{d}/")).collect(),
                ..AutodepEnv::default()
            };
            let encoded = env.encode();
            prop_assert_eq!(AutodepEnv::decode(&encoded).expect("decode"), env);
        }
    }
}
