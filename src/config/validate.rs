// src/config/validate.rs

use anyhow::{anyhow, Context, Result};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::ConfigFile;
use crate::rule::pattern_is_star;

/// Run semantic validation against a loaded configuration.
///
/// This checks:
/// - there is at least one rule, and each rule has at least one target
/// - every rule has a non-star official target
/// - autodep method strings are valid
/// - cache capacity is positive when a cache dir is set
/// - tmp view settings are coherent
/// - the graph of *literal* (stem-free) static deps between rules is acyclic
///
/// Cycles through stems can only be detected at make time; the engine
/// reports those with a diagram when a request actually hits one.
pub fn validate_config(cfg: &ConfigFile) -> Result<()> {
    ensure_has_rules(cfg)?;
    validate_global_config(cfg)?;
    validate_rules(cfg)?;
    validate_static_dag(cfg)?;
    Ok(())
}

fn ensure_has_rules(cfg: &ConfigFile) -> Result<()> {
    if cfg.rule.is_empty() {
        return Err(anyhow!("config must contain at least one [rule.<name>] section"));
    }
    Ok(())
}

fn validate_global_config(cfg: &ConfigFile) -> Result<()> {
    if cfg.config.cache_dir.is_some() && cfg.config.cache_capacity == 0 {
        return Err(anyhow!("[config].cache_capacity must be > 0 when cache_dir is set"));
    }
    if cfg.config.tmp_view.is_some()
        && cfg.config.phy_tmp_dir.is_none()
        && cfg.config.tmp_sz_mb == 0
    {
        return Err(anyhow!(
            "[config].tmp_view requires phy_tmp_dir or a non-zero tmp_sz_mb"
        ));
    }
    if cfg.backend.kind != "local" {
        return Err(anyhow!(
            "[backend].kind {:?} is not built in (only \"local\")",
            cfg.backend.kind
        ));
    }
    if cfg.backend.kill_signals.is_empty() {
        return Err(anyhow!("[backend].kill_signals must not be empty"));
    }
    Ok(())
}

fn validate_rules(cfg: &ConfigFile) -> Result<()> {
    for (name, rule) in cfg.rule.iter() {
        if rule.targets.is_empty() {
            return Err(anyhow!("rule '{}' declares no targets", name));
        }
        let has_official = rule
            .targets
            .iter()
            .any(|t| !pattern_is_star(strip_flags(t)));
        if !has_official {
            return Err(anyhow!(
                "rule '{}' has only star targets; it needs a non-star official target",
                name
            ));
        }
        match rule.autodep.as_str() {
            "none" | "ptrace" | "ld_audit" | "ld_preload" => {}
            other => {
                return Err(anyhow!(
                    "rule '{}' has invalid autodep method {:?}",
                    name,
                    other
                ))
            }
        }
        if rule.tokens == 0 {
            return Err(anyhow!("rule '{}' must have tokens >= 1", name));
        }
        if rule.interpreter.is_empty() {
            return Err(anyhow!("rule '{}' has an empty interpreter", name));
        }
        for spec in rule.targets.iter().chain(rule.deps.iter()) {
            check_braces(name, strip_flags(spec))?;
        }
    }
    Ok(())
}

/// Reject cycles among literal static deps.
///
/// Edge direction: producer -> consumer. A dep entry without stems whose
/// path matches another rule's literal target creates an edge.
fn validate_static_dag(cfg: &ConfigFile) -> Result<()> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.rule.keys() {
        graph.add_node(name.as_str());
    }

    for (consumer, rule) in cfg.rule.iter() {
        for dep in rule.deps.iter() {
            let dep_path = strip_flags(dep);
            if dep_path.contains('{') {
                continue;
            }
            for (producer, prule) in cfg.rule.iter() {
                let produces = prule
                    .targets
                    .iter()
                    .any(|t| strip_flags(t) == dep_path);
                if produces {
                    graph.add_edge(producer.as_str(), consumer.as_str(), ());
                }
            }
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(anyhow!(
            "cycle detected among static deps involving rule '{}'",
            cycle.node_id()
        )),
    }
}

/// Pattern part of a `pattern|flag|flag` entry.
pub fn strip_flags(spec: &str) -> &str {
    spec.split('|').next().unwrap_or(spec)
}

/// Flag parts of a `pattern|flag|flag` entry.
pub fn spec_flags(spec: &str) -> impl Iterator<Item = &str> {
    spec.split('|').skip(1).filter(|s| !s.is_empty())
}

fn check_braces(rule: &str, pattern: &str) -> Result<()> {
    let opens = pattern.matches('{').count();
    let closes = pattern.matches('}').count();
    if opens != closes {
        return Err(anyhow!(
            "rule '{}': unbalanced braces in pattern {:?}",
            rule,
            pattern
        ))
        .context("pattern stems are written {stem} or {stem*}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::RuleConfig;

    fn rule(targets: &[&str], deps: &[&str]) -> RuleConfig {
        toml::from_str::<RuleConfig>(&format!(
            "cmd = \"true\"\ntargets = {:?}\ndeps = {:?}",
            targets, deps
        ))
        .unwrap()
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(validate_config(&ConfigFile::default()).is_err());
    }

    #[test]
    fn literal_cycle_is_rejected() {
        let mut cfg = ConfigFile::default();
        cfg.rule.insert("a".into(), rule(&["x"], &["y"]));
        cfg.rule.insert("b".into(), rule(&["y"], &["x"]));
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn stem_deps_do_not_trip_static_check() {
        let mut cfg = ConfigFile::default();
        cfg.rule.insert("a".into(), rule(&["obj/{base}.o"], &["src/{base}.c"]));
        cfg.rule.insert("b".into(), rule(&["bin/app"], &["obj/main.o"]));
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn star_only_rule_is_rejected() {
        let mut cfg = ConfigFile::default();
        cfg.rule.insert("a".into(), rule(&["log/{n*}.txt"], &[]));
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn flag_suffixes_are_split() {
        assert_eq!(strip_flags("a/b|incremental|phony"), "a/b");
        let flags: Vec<_> = spec_flags("a/b|incremental|phony").collect();
        assert_eq!(flags, vec!["incremental", "phony"]);
        assert_eq!(spec_flags("a/b").count(), 0);
    }

    #[test]
    fn tmp_view_needs_backing() {
        let mut cfg = ConfigFile::default();
        cfg.rule.insert("a".into(), rule(&["x"], &[]));
        cfg.config.tmp_view = Some("/tmp/view".into());
        assert!(validate_config(&cfg).is_err());
        cfg.config.tmp_sz_mb = 64;
        assert!(validate_config(&cfg).is_ok());
    }
}
