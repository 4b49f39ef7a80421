//! Agent registry.
//!
//! The `AgentRegistry` is an arena of worker profiles. Each worker gets a
//! stable [`WorkerId`] (its index) when registered, and every other table
//! keyed by worker, notably [`HealthTable`](super::HealthTable), uses that
//! index. The registry itself is immutable once built.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::core::Language;
use crate::orchestration::CommandWorker;
use crate::worker::{Worker, WorkerId, WorkerRole};
use crate::{Error, Result};

/// Static facts about a registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerProfile {
    pub id: WorkerId,
    pub name: String,
    pub role: WorkerRole,
    /// Language affinity. `None` for generic workers.
    pub language: Option<Language>,
}

/// Counts reported by [`AgentRegistry::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_language: BTreeMap<Language, usize>,
    pub by_role: BTreeMap<String, usize>,
    pub generic: usize,
}

/// Arena of known workers plus the host-fallback agent.
pub struct AgentRegistry {
    profiles: Vec<WorkerProfile>,
    handles: Vec<Arc<dyn Worker>>,
    by_name: HashMap<String, WorkerId>,
    host: Arc<dyn Worker>,
}

impl AgentRegistry {
    /// Create an empty registry around the host-fallback worker.
    pub fn new(host: Arc<dyn Worker>) -> Self {
        Self {
            profiles: Vec::new(),
            handles: Vec::new(),
            by_name: HashMap::new(),
            host,
        }
    }

    /// Build a registry of `CommandWorker`s from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let host = CommandWorker::from_command_line("host", &config.host.command)?;
        let mut registry = Self::new(Arc::new(host));

        for worker in &config.workers {
            let language = worker
                .language
                .as_deref()
                .map(str::parse::<Language>)
                .transpose()?;
            let handle = CommandWorker::from_command_line(&worker.name, &worker.command)?;
            registry.register(worker.role, language, Arc::new(handle))?;
        }

        Ok(registry)
    }

    /// Add a worker. Names must be unique.
    pub fn register(
        &mut self,
        role: WorkerRole,
        language: Option<Language>,
        handle: Arc<dyn Worker>,
    ) -> Result<WorkerId> {
        let name = handle.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(Error::Config(format!("duplicate worker: {name}")));
        }

        let id = WorkerId(self.profiles.len());
        self.profiles.push(WorkerProfile {
            id,
            name: name.clone(),
            role,
            language,
        });
        self.handles.push(handle);
        self.by_name.insert(name, id);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn profile(&self, id: WorkerId) -> Option<&WorkerProfile> {
        self.profiles.get(id.0)
    }

    pub fn profiles(&self) -> &[WorkerProfile] {
        &self.profiles
    }

    pub fn handle(&self, id: WorkerId) -> Option<Arc<dyn Worker>> {
        self.handles.get(id.0).cloned()
    }

    pub fn host(&self) -> Arc<dyn Worker> {
        Arc::clone(&self.host)
    }

    /// The host-fallback agent sits one past the last registered worker.
    pub fn host_id(&self) -> WorkerId {
        WorkerId(self.profiles.len())
    }

    /// Display name for any id, host included.
    pub fn name_of(&self, id: WorkerId) -> &str {
        match self.profile(id) {
            Some(profile) => &profile.name,
            None => self.host.name(),
        }
    }

    pub fn id_of(&self, name: &str) -> Option<WorkerId> {
        self.by_name.get(name).copied()
    }

    pub fn lookup(&self, name: &str) -> Result<&WorkerProfile> {
        self.id_of(name)
            .and_then(|id| self.profile(id))
            .ok_or_else(|| Error::WorkerNotFound(name.to_string()))
    }

    /// Specialists for a language and role, in registration order.
    pub fn specialists(&self, language: Language, role: WorkerRole) -> Vec<WorkerId> {
        self.profiles
            .iter()
            .filter(|p| p.language == Some(language) && p.role.covers(role))
            .map(|p| p.id)
            .collect()
    }

    /// Workers with no language affinity that can take on `role`.
    pub fn generics(&self, role: WorkerRole) -> Vec<WorkerId> {
        self.profiles
            .iter()
            .filter(|p| p.language.is_none() && p.role.covers(role))
            .map(|p| p.id)
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.profiles.len(),
            ..Default::default()
        };
        for profile in &self.profiles {
            match profile.language {
                Some(lang) => *stats.by_language.entry(lang).or_default() += 1,
                None => stats.generic += 1,
            }
            *stats.by_role.entry(profile.role.to_string()).or_default() += 1;
        }
        stats
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("profiles", &self.profiles)
            .field("host", &self.host.name())
            .finish()
    }
}
