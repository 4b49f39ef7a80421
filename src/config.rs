use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::core::{Language, TaskKind};
use crate::worker::WorkerRole;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `scratch/`, `plan/` and `archive/`.
    pub storage_root: String,
    /// Minimum succeeded candidates a batch needs to reach evaluation.
    pub min_successes: usize,
    pub max_escalations: usize,
    pub max_regenerations: usize,
    pub max_approval_rounds: usize,
    pub kinds: KindsConfig,
    pub health: HealthConfig,
    pub workers: Vec<WorkerConfig>,
    /// Keyed by language name; parsed with the same aliases as hints.
    pub languages: BTreeMap<String, LanguageConfig>,
    pub host: HostConfig,
    pub judge: Option<JudgeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KindsConfig {
    pub design: KindConfig,
    pub elaboration: KindConfig,
    pub implementation: KindConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindConfig {
    pub fanout: usize,
    pub timeout_secs: u64,
    #[serde(default)]
    pub approval_required: bool,
    /// Overrides rubric weights by criterion name. Re-normalised.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub weights: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckConfig {
    pub name: String,
    /// Shell-free command line; `{file}` is replaced by the path of the
    /// source extracted from the candidate.
    pub command: String,
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub window: usize,
    pub window_ttl_secs: u64,
    pub failure_ratio: f64,
    pub min_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub name: String,
    pub role: WorkerRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LanguageConfig {
    pub fallback_architect: Option<String>,
    pub fallback_developer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub command: String,
    #[serde(default = "default_judge_timeout")]
    pub timeout_secs: u64,
}

fn default_check_timeout() -> u64 {
    120
}

fn default_judge_timeout() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: ".gauntlet".to_string(),
            min_successes: 1,
            max_escalations: 4,
            max_regenerations: 2,
            max_approval_rounds: 5,
            kinds: KindsConfig::default(),
            health: HealthConfig::default(),
            workers: default_workers(),
            languages: default_languages(),
            host: HostConfig::default(),
            judge: None,
        }
    }
}

impl Default for KindsConfig {
    fn default() -> Self {
        Self {
            design: KindConfig::new(5, 300, true),
            elaboration: KindConfig::new(5, 300, false),
            implementation: KindConfig::new(3, 600, false),
        }
    }
}

impl KindConfig {
    pub fn new(fanout: usize, timeout_secs: u64, approval_required: bool) -> Self {
        Self {
            fanout,
            timeout_secs,
            approval_required,
            weights: BTreeMap::new(),
            checks: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CheckConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl JudgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 20,
            window_ttl_secs: 3600,
            failure_ratio: 0.8,
            min_samples: 3,
        }
    }
}

impl HealthConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.window_ttl_secs)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            command: "claude -p".to_string(),
        }
    }
}

const SPECIALISTS: &[(&str, &str, &str)] = &[
    ("go", "gad", "god"),
    ("python", "pyad", "pydv"),
    ("rust", "rustarch", "rustdev"),
    ("javascript", "jsad", "jsdev"),
    ("typescript", "tsad", "tsdev"),
];

fn agent_command(name: &str) -> String {
    format!("claude --agent {name} -p")
}

fn default_workers() -> Vec<WorkerConfig> {
    let mut workers = Vec::new();
    for (lang, architect, developer) in SPECIALISTS {
        workers.push(WorkerConfig {
            name: architect.to_string(),
            role: WorkerRole::Architect,
            language: Some(lang.to_string()),
            command: agent_command(architect),
        });
        workers.push(WorkerConfig {
            name: developer.to_string(),
            role: WorkerRole::Developer,
            language: Some(lang.to_string()),
            command: agent_command(developer),
        });
    }
    for (name, role) in [
        ("architect", WorkerRole::Architect),
        ("developer", WorkerRole::Developer),
    ] {
        workers.push(WorkerConfig {
            name: name.to_string(),
            role,
            language: None,
            command: agent_command(name),
        });
    }
    workers
}

fn default_languages() -> BTreeMap<String, LanguageConfig> {
    let mut languages = BTreeMap::new();
    languages.insert(
        "typescript".to_string(),
        LanguageConfig {
            fallback_architect: Some("jsad".to_string()),
            fallback_developer: Some("jsdev".to_string()),
        },
    );
    languages
}

impl Config {
    pub fn gauntlet_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".gauntlet"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::gauntlet_dir()?.join("gauntlet.toml"))
    }

    /// Settings for one task kind.
    pub fn kind(&self, kind: TaskKind) -> &KindConfig {
        match kind {
            TaskKind::Design => &self.kinds.design,
            TaskKind::Elaboration => &self.kinds.elaboration,
            TaskKind::Implementation => &self.kinds.implementation,
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        expand_tilde(&self.storage_root)
    }

    /// Designated fallback for a language, if configured.
    pub fn fallback_for(&self, language: Language, role: WorkerRole) -> Option<&str> {
        self.languages
            .iter()
            .find(|(key, _)| key.parse::<Language>().ok() == Some(language))
            .and_then(|(_, cfg)| match role {
                WorkerRole::Architect => cfg.fallback_architect.as_deref(),
                WorkerRole::Developer => cfg.fallback_developer.as_deref(),
                WorkerRole::Generic => None,
            })
    }

    /// Load from `~/.gauntlet/gauntlet.toml`, defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            workers = config.workers.len(),
            storage_root = %config.storage_root,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::gauntlet_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_successes == 0 {
            return Err(Error::Config("min_successes must be at least 1".into()));
        }

        for kind in TaskKind::ALL {
            let cfg = self.kind(kind);
            if cfg.fanout == 0 {
                return Err(Error::Config(format!("{kind}: fanout must be at least 1")));
            }
            if self.min_successes > cfg.fanout {
                return Err(Error::Config(format!(
                    "{kind}: min_successes {} exceeds fanout {}",
                    self.min_successes, cfg.fanout
                )));
            }
            if cfg.weights.values().any(|w| *w < 0.0 || !w.is_finite()) {
                return Err(Error::Config(format!("{kind}: negative rubric weight")));
            }
            if !cfg.weights.is_empty() && cfg.weights.values().all(|w| *w == 0.0) {
                return Err(Error::Config(format!("{kind}: rubric weights are all zero")));
            }
        }

        if !(0.0..=1.0).contains(&self.health.failure_ratio) {
            return Err(Error::Config("health.failure_ratio must be in [0, 1]".into()));
        }
        if self.health.window == 0 {
            return Err(Error::Config("health.window must be at least 1".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for worker in &self.workers {
            if !seen.insert(worker.name.as_str()) {
                return Err(Error::Config(format!("duplicate worker: {}", worker.name)));
            }
            if worker.command.trim().is_empty() {
                return Err(Error::Config(format!("worker {} has no command", worker.name)));
            }
            if let Some(lang) = &worker.language {
                lang.parse::<Language>()
                    .map_err(|_| Error::Config(format!("worker {}: unknown language {lang}", worker.name)))?;
            }
        }

        for key in self.languages.keys() {
            key.parse::<Language>()
                .map_err(|_| Error::Config(format!("unknown language section: {key}")))?;
        }

        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
