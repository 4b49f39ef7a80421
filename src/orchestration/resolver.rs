//! Language/capability resolver.
//!
//! Turns a task's capability and kind into an ordered list of workers to
//! try: explicit override, primary specialists, the language's designated
//! fallback, generic workers, then the host-fallback sentinel. Workers the
//! health table reports unavailable are skipped. Resolution never fails;
//! the list always ends with the sentinel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::{Language, TaskKind};
use crate::orchestration::{AgentRegistry, HealthTable};
use crate::worker::{Priority, WorkerId, WorkerRole};

/// Caller preferences that bend resolution.
#[derive(Debug, Clone, Default)]
pub struct Preferences {
    /// Worker name to try before anything else.
    pub worker_override: Option<String>,
}

/// What a resolved entry dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "worker", rename_all = "snake_case")]
pub enum Target {
    Worker(WorkerId),
    /// No specialised worker; the host agent gets the full context.
    HostFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedEntry {
    pub target: Target,
    pub priority: Priority,
}

/// Ordered, de-duplicated resolution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedWorkers {
    entries: Vec<ResolvedEntry>,
}

impl ResolvedWorkers {
    pub fn entries(&self) -> &[ResolvedEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ResolvedEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedEntry> {
        self.entries.iter()
    }
}

/// Role a task kind needs.
pub fn role_for(kind: TaskKind) -> WorkerRole {
    match kind {
        TaskKind::Design | TaskKind::Elaboration => WorkerRole::Architect,
        TaskKind::Implementation => WorkerRole::Developer,
    }
}

/// Resolves capabilities against a registry and its health table.
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: Arc<AgentRegistry>,
    health: Arc<HealthTable>,
    fallbacks: HashMap<(Language, WorkerRole), String>,
}

impl Resolver {
    pub fn new(registry: Arc<AgentRegistry>, health: Arc<HealthTable>) -> Self {
        Self {
            registry,
            health,
            fallbacks: HashMap::new(),
        }
    }

    /// Resolver with the `[languages]` fallbacks from configuration.
    pub fn from_config(
        registry: Arc<AgentRegistry>,
        health: Arc<HealthTable>,
        config: &Config,
    ) -> Self {
        let mut resolver = Self::new(registry, health);
        for lang in Language::ALL {
            for role in [WorkerRole::Architect, WorkerRole::Developer] {
                if let Some(name) = config.fallback_for(lang, role) {
                    resolver = resolver.with_fallback(lang, role, name);
                }
            }
        }
        resolver
    }

    pub fn with_fallback(mut self, language: Language, role: WorkerRole, name: &str) -> Self {
        self.fallbacks.insert((language, role), name.to_string());
        self
    }

    pub fn resolve(
        &self,
        capability: Option<Language>,
        kind: TaskKind,
        preferences: &Preferences,
    ) -> ResolvedWorkers {
        let role = role_for(kind);
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        let mut push = |id: WorkerId, priority: Priority, entries: &mut Vec<ResolvedEntry>| {
            if !seen.insert(id) {
                return;
            }
            if !self.health.is_available(id) {
                debug!(worker = %self.registry.name_of(id), "skipping unavailable worker");
                return;
            }
            entries.push(ResolvedEntry {
                target: Target::Worker(id),
                priority,
            });
        };

        if let Some(name) = &preferences.worker_override {
            match self.registry.id_of(name) {
                Some(id) => push(id, Priority::Primary, &mut entries),
                None => warn!(worker = %name, "override names an unknown worker, ignoring"),
            }
        }

        if let Some(language) = capability {
            for id in self.registry.specialists(language, role) {
                push(id, Priority::Primary, &mut entries);
            }
            if let Some(name) = self.fallbacks.get(&(language, role)) {
                match self.registry.id_of(name) {
                    Some(id) => push(id, Priority::Fallback, &mut entries),
                    None => warn!(worker = %name, %language, "designated fallback is not registered"),
                }
            }
        }

        for id in self.registry.generics(role) {
            push(id, Priority::Generic, &mut entries);
        }

        entries.push(ResolvedEntry {
            target: Target::HostFallback,
            priority: Priority::Host,
        });

        debug!(
            capability = ?capability,
            %kind,
            resolved = entries.len(),
            "resolved workers"
        );
        ResolvedWorkers { entries }
    }
}
