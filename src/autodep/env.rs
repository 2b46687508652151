// src/autodep/env.rs

//! The autodep environment string handed to spawned jobs.
//!
//! Serialized as `service:options:src-dirs-quoted-csv:tmp-dir:tmp-view:root-dir`
//! where options is a run of single-letter flags. Jobs re-parse this string
//! to configure their interception layer; a malformed string fails the
//! spawning job early rather than producing a half-observed run.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{SysResult, SystemError};

/// How a job's filesystem accesses are observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutodepMethod {
    /// Trust the job to report spontaneously (used for tests and shims).
    None,
    Ptrace,
    LdAudit,
    #[default]
    LdPreload,
}

/// How faithfully symlinks are observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkSupport {
    None,
    /// Final-component links only.
    File,
    #[default]
    Full,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutodepEnv {
    /// Address of the engine's per-job socket, `host:port` or a path.
    pub service: String,
    pub auto_mkdir: bool,
    pub ignore_stat: bool,
    pub reliable_dirs: bool,
    pub lnk_support: LinkSupport,
    pub src_dirs: Vec<String>,
    pub tmp_dir: String,
    pub tmp_view: String,
    pub root_dir: String,
}

impl AutodepEnv {
    pub fn parse(s: &str) -> SysResult<AutodepEnv> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 6 {
            return Err(SystemError::BadAutodepEnv(format!(
                "expected 6 ':'-separated fields, got {}",
                fields.len()
            )));
        }
        let mut env = AutodepEnv {
            service: fields[0].to_string(),
            tmp_dir: fields[3].to_string(),
            tmp_view: fields[4].to_string(),
            root_dir: fields[5].to_string(),
            ..AutodepEnv::default()
        };
        env.lnk_support = LinkSupport::None;
        for c in fields[1].chars() {
            match c {
                'd' | 'm' => env.auto_mkdir = true,
                'i' => env.ignore_stat = true,
                'r' => env.reliable_dirs = true,
                'n' => env.lnk_support = LinkSupport::None,
                'f' => env.lnk_support = LinkSupport::File,
                'a' => env.lnk_support = LinkSupport::Full,
                _ => {
                    return Err(SystemError::BadAutodepEnv(format!(
                        "unknown option flag {c:?}"
                    )))
                }
            }
        }
        env.src_dirs = parse_quoted_csv(fields[2])?;
        Ok(env)
    }
}

impl fmt::Display for AutodepEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut opts = String::new();
        if self.auto_mkdir {
            opts.push('d');
        }
        if self.ignore_stat {
            opts.push('i');
        }
        if self.reliable_dirs {
            opts.push('r');
        }
        opts.push(match self.lnk_support {
            LinkSupport::None => 'n',
            LinkSupport::File => 'f',
            LinkSupport::Full => 'a',
        });
        let srcs = self
            .src_dirs
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            self.service, opts, srcs, self.tmp_dir, self.tmp_view, self.root_dir
        )
    }
}

/// Parse `"a","b/c"` style comma-separated quoted entries.
fn parse_quoted_csv(s: &str) -> SysResult<Vec<String>> {
    let mut out = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let Some(r) = rest.strip_prefix('"') else {
            return Err(SystemError::BadAutodepEnv(format!(
                "src dir list not quoted: {s:?}"
            )));
        };
        let Some(close) = r.find('"') else {
            return Err(SystemError::BadAutodepEnv(format!(
                "unterminated quote in src dir list: {s:?}"
            )));
        };
        out.push(r[..close].to_string());
        rest = &r[close + 1..];
        rest = rest.strip_prefix(',').unwrap_or(rest);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let env = AutodepEnv {
            service: "127.0.0.1;4030".into(),
            auto_mkdir: true,
            ignore_stat: false,
            reliable_dirs: true,
            lnk_support: LinkSupport::Full,
            src_dirs: vec!["src".into(), "third_party".into()],
            tmp_dir: "/tmp/job1".into(),
            tmp_view: "".into(),
            root_dir: "/work/repo".into(),
        };
        let s = env.to_string();
        assert_eq!(AutodepEnv::parse(&s).unwrap(), env);
    }

    #[test]
    fn link_support_flags() {
        let env = AutodepEnv::parse("svc:n::t::r").unwrap();
        assert_eq!(env.lnk_support, LinkSupport::None);
        let env = AutodepEnv::parse("svc:f::t::r").unwrap();
        assert_eq!(env.lnk_support, LinkSupport::File);
        let env = AutodepEnv::parse("svc:a::t::r").unwrap();
        assert_eq!(env.lnk_support, LinkSupport::Full);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(AutodepEnv::parse("too:few:fields").is_err());
        assert!(AutodepEnv::parse("svc:z::t::r").is_err());
        assert!(AutodepEnv::parse("svc:n:unquoted:t::r").is_err());
        assert!(AutodepEnv::parse("svc:n:\"open:t::r").is_err());
    }
}
