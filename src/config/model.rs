// src/config/model.rs

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [config]
/// cache_dir = ".depmake/cache"
/// cache_capacity = 1073741824
///
/// [sources]
/// dirs = ["src"]
/// anti = ["**/*.tmp"]
///
/// [rule.compile]
/// targets = ["obj/{base}.o"]
/// deps = ["src/{base}.c"]
/// cmd = "cc -c -o obj/{base}.o src/{base}.c"
/// ```
///
/// Target and dep entries may carry `|`-separated flag suffixes, e.g.
/// `"log/{n*}.txt|incremental|no_warning"` or `"config.mk|critical"`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    #[serde(default)]
    pub backend: BackendSection,

    #[serde(default)]
    pub sources: SourcesSection,

    /// All rules from `[rule.<name>]`, keyed by rule name.
    #[serde(default)]
    pub rule: BTreeMap<String, RuleConfig>,
}

/// `[config]` section: engine-wide knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Content cache root; no caching when unset.
    #[serde(default)]
    pub cache_dir: Option<String>,

    /// Cache capacity in bytes.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    /// Cap on error lines audited per failing job.
    #[serde(default = "default_max_err_lines")]
    pub max_err_lines: usize,

    /// Cap on stderr bytes kept per failing job.
    #[serde(default = "default_stderr_len")]
    pub stderr_len: usize,

    /// A job missing heartbeats for this long is considered lost.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Grace period for network-visible dates.
    #[serde(default = "default_network_delay_ms")]
    pub network_delay_ms: u64,

    /// Physical tmp dir served to jobs that request a tmp view.
    #[serde(default)]
    pub phy_tmp_dir: Option<String>,

    /// Mount point under which jobs see their tmp dir.
    #[serde(default)]
    pub tmp_view: Option<String>,

    /// Tmpfs size in MiB when a tmp view is backed by one.
    #[serde(default)]
    pub tmp_sz_mb: u64,
}

fn default_cache_capacity() -> u64 {
    1 << 30
}
fn default_max_err_lines() -> usize {
    30
}
fn default_stderr_len() -> usize {
    32 * 1024
}
fn default_heartbeat_secs() -> u64 {
    10
}
fn default_network_delay_ms() -> u64 {
    1000
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            cache_dir: None,
            cache_capacity: default_cache_capacity(),
            max_err_lines: default_max_err_lines(),
            stderr_len: default_stderr_len(),
            heartbeat_secs: default_heartbeat_secs(),
            network_delay_ms: default_network_delay_ms(),
            phy_tmp_dir: None,
            tmp_view: None,
            tmp_sz_mb: 0,
        }
    }
}

/// `[backend]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    /// Only `"local"` is built in; the trait is the seam for others.
    #[serde(default = "default_backend_kind")]
    pub kind: String,

    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Signals walked when killing a job, in order.
    #[serde(default = "default_kill_signals")]
    pub kill_signals: Vec<i32>,

    /// Delay between kill escalation steps.
    #[serde(default = "default_kill_escalation_secs")]
    pub kill_escalation_secs: u64,
}

fn default_backend_kind() -> String {
    "local".to_string()
}
fn default_max_parallel() -> usize {
    4
}
fn default_kill_signals() -> Vec<i32> {
    vec![libc::SIGTERM, libc::SIGKILL]
}
fn default_kill_escalation_secs() -> u64 {
    3
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            max_parallel: default_max_parallel(),
            kill_signals: default_kill_signals(),
            kill_escalation_secs: default_kill_escalation_secs(),
        }
    }
}

/// `[sources]` section: what counts as a source rather than a buildable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesSection {
    /// Directories whose content is source material.
    #[serde(default)]
    pub dirs: Vec<String>,

    /// Individual source files outside source dirs.
    #[serde(default)]
    pub files: Vec<String>,

    /// Glob patterns for paths that are never buildable.
    #[serde(default)]
    pub anti: Vec<String>,
}

/// `[rule.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    /// Command text; stems substitute as `{stem}`.
    pub cmd: String,

    /// Target patterns, optionally with `|flag` suffixes. The first
    /// non-star target is the rule's official target.
    pub targets: Vec<String>,

    /// Static dep patterns, optionally with `|flag` suffixes.
    #[serde(default)]
    pub deps: Vec<String>,

    /// Higher priority wins when several rules match a node.
    #[serde(default)]
    pub prio: i32,

    /// Custom stem regexes; stems default to `.+`.
    #[serde(default)]
    pub stems: HashMap<String, String>,

    /// Parallelism weight for ETA computation.
    #[serde(default = "default_tokens")]
    pub tokens: u32,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Run even when up to date.
    #[serde(default)]
    pub force: bool,

    /// Forward stdout to the requesting audit while running.
    #[serde(default)]
    pub live_out: bool,

    /// Targets survive washing and may be read before being written.
    #[serde(default)]
    pub incremental: bool,

    /// `"ld_preload"`, `"ld_audit"`, `"ptrace"` or `"none"`.
    #[serde(default = "default_autodep")]
    pub autodep: String,

    #[serde(default = "default_interpreter")]
    pub interpreter: Vec<String>,
}

fn default_tokens() -> u32 {
    1
}
fn default_autodep() -> String {
    "ld_preload".to_string()
}
fn default_interpreter() -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string()]
}
