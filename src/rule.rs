// src/rule.rs

//! Rule records: target patterns with stems, static deps, and the command.
//!
//! Patterns use `{stem}` placeholders: `obj/{base}.o` matches `obj/x.o`
//! capturing `base = "x"`. A `{stem*}` placeholder declares a *star* stem;
//! targets containing one are star targets (matched by pattern rather than
//! declared literally). Stem regexes default to `.+` and may be overridden
//! per rule.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;

use crate::autodep::env::AutodepMethod;
use crate::digest::{DepFlags, TargetFlags};
use crate::errors::{SysResult, SystemError};
use crate::hash::Crc;

/// A declared target pattern with its flags.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub pattern: String,
    pub tflags: TargetFlags,
    /// Contains a star stem (or was forced star).
    pub star: bool,
}

/// A declared static dep pattern with its flags.
#[derive(Debug, Clone)]
pub struct DepSpec {
    pub pattern: String,
    pub dflags: DepFlags,
}

#[derive(Debug, Clone)]
pub struct RuleData {
    pub name: String,
    pub prio: i32,
    pub cmd: String,
    /// Hash of the command text; jobs compare generations to detect recipe
    /// changes.
    pub cmd_crc: Crc,
    pub cmd_gen: u32,
    pub rsrcs_gen: u32,
    pub targets: Vec<TargetSpec>,
    pub deps: Vec<DepSpec>,
    /// Parallelism weight used in ETA computation.
    pub tokens: u32,
    pub timeout: Option<Duration>,
    pub force: bool,
    pub incremental: bool,
    pub live_out: bool,
    pub autodep: AutodepMethod,
    pub interpreter: Vec<String>,
    /// Moving average of observed exec times, feeding ETA.
    pub exec_time: Duration,
    /// One compiled regex per target pattern.
    target_res: Vec<Regex>,
}

impl RuleData {
    /// Compile a rule, turning each target pattern into a regex.
    ///
    /// `stem_res` maps stem names to custom regexes (defaulting to `.+`).
    pub fn compile(
        name: String,
        prio: i32,
        cmd: String,
        targets: Vec<TargetSpec>,
        deps: Vec<DepSpec>,
        stem_res: &HashMap<String, String>,
    ) -> SysResult<RuleData> {
        let mut target_res = Vec::with_capacity(targets.len());
        for t in &targets {
            target_res.push(compile_pattern(&name, &t.pattern, stem_res)?);
        }
        let cmd_crc = Crc::Reg(crc_of_text(&cmd));
        Ok(RuleData {
            name,
            prio,
            cmd,
            cmd_crc,
            cmd_gen: 1,
            rsrcs_gen: 1,
            targets,
            deps,
            tokens: 1,
            timeout: None,
            force: false,
            incremental: false,
            live_out: false,
            autodep: AutodepMethod::LdPreload,
            interpreter: vec!["sh".to_string(), "-c".to_string()],
            exec_time: Duration::ZERO,
            target_res,
        })
    }

    /// Try to match `path` against target pattern `tgt_idx`, returning the
    /// captured stems on success.
    pub fn match_target(&self, tgt_idx: usize, path: &str) -> Option<Vec<(String, String)>> {
        let re = self.target_res.get(tgt_idx)?;
        let caps = re.captures(path)?;
        let mut stems = Vec::new();
        for name in re.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                stems.push((name.to_string(), m.as_str().to_string()));
            }
        }
        Some(stems)
    }

    /// Substitute stems into a pattern (dep, target, or command text).
    pub fn subst(&self, pattern: &str, stems: &[(String, String)]) -> String {
        subst(pattern, stems)
    }

    /// The command text instantiated on concrete stems.
    pub fn cmd_for(&self, stems: &[(String, String)]) -> String {
        self.subst(&self.cmd, stems)
    }

    /// Official target: the first non-star target, or the first target.
    pub fn official_tgt_idx(&self) -> usize {
        self.targets.iter().position(|t| !t.star).unwrap_or(0)
    }

    /// Record one observed exec time into the moving average.
    pub fn record_exec_time(&mut self, t: Duration) {
        if self.exec_time.is_zero() {
            self.exec_time = t;
        } else {
            self.exec_time = (self.exec_time * 3 + t) / 4;
        }
    }
}

/// Compile `obj/{base}.o` style patterns into an anchored regex with one
/// named capture group per stem.
fn compile_pattern(
    rule: &str,
    pattern: &str,
    stem_res: &HashMap<String, String>,
) -> SysResult<Regex> {
    let mut re = String::from("^");
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        re.push_str(&regex::escape(&rest[..open]));
        let Some(close) = rest[open..].find('}') else {
            return Err(SystemError::BadRule {
                rule: rule.to_string(),
                msg: format!("unclosed stem in pattern {pattern:?}"),
            });
        };
        let stem = &rest[open + 1..open + close];
        let stem = stem.strip_suffix('*').unwrap_or(stem);
        if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(SystemError::BadRule {
                rule: rule.to_string(),
                msg: format!("bad stem name {stem:?} in pattern {pattern:?}"),
            });
        }
        let stem_re = stem_res.get(stem).map(String::as_str).unwrap_or(".+");
        // Later occurrences of a stem must backreference the first. The
        // regex crate has no backrefs, so repeated stems re-capture under a
        // suffixed name and equality is checked in match_target callers via
        // stem dedup.
        if re.contains(&format!("(?P<{stem}>")) {
            re.push_str(&format!("(?P<{stem}_bis>{stem_re})"));
        } else {
            re.push_str(&format!("(?P<{stem}>{stem_re})"));
        }
        rest = &rest[open + close + 1..];
    }
    re.push_str(&regex::escape(rest));
    re.push('$');
    Regex::new(&re).map_err(|e| SystemError::BadRule {
        rule: rule.to_string(),
        msg: format!("pattern {pattern:?}: {e}"),
    })
}

/// Substitute stem values into a `{stem}` pattern.
pub fn subst(pattern: &str, stems: &[(String, String)]) -> String {
    let mut out = pattern.to_string();
    for (name, val) in stems {
        out = out.replace(&format!("{{{name}}}"), val);
        out = out.replace(&format!("{{{name}*}}"), val);
    }
    out
}

/// Pattern has at least one `{stem*}` placeholder.
pub fn pattern_is_star(pattern: &str) -> bool {
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else { return false };
        if rest[open + 1..open + close].ends_with('*') {
            return true;
        }
        rest = &rest[open + close + 1..];
    }
    false
}

fn crc_of_text(text: &str) -> u64 {
    let digest = blake3::hash(text.as_bytes());
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(targets: &[(&str, bool)]) -> RuleData {
        let specs = targets
            .iter()
            .map(|(p, star)| TargetSpec {
                pattern: p.to_string(),
                tflags: TargetFlags::dflt(),
                star: *star,
            })
            .collect();
        RuleData::compile(
            "test".into(),
            0,
            "echo {base}".into(),
            specs,
            vec![],
            &HashMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn stems_capture_and_substitute() {
        let r = rule(&[("obj/{base}.o", false)]);
        let stems = r.match_target(0, "obj/main.o").unwrap();
        assert_eq!(stems, vec![("base".to_string(), "main".to_string())]);
        assert_eq!(r.subst("src/{base}.c", &stems), "src/main.c");
        assert_eq!(r.cmd_for(&stems), "echo main");
    }

    #[test]
    fn non_matching_path_is_rejected() {
        let r = rule(&[("obj/{base}.o", false)]);
        assert!(r.match_target(0, "obj/main.c").is_none());
        assert!(r.match_target(0, "main.o").is_none());
    }

    #[test]
    fn star_detection() {
        assert!(pattern_is_star("log/{n*}.txt"));
        assert!(!pattern_is_star("log/{n}.txt"));
    }

    #[test]
    fn official_target_skips_star() {
        let r = rule(&[("log/{n*}.txt", true), ("out/{base}", false)]);
        assert_eq!(r.official_tgt_idx(), 1);
    }
}
