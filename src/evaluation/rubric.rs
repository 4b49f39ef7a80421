//! Weighted scoring rubrics.
//!
//! A rubric is a fixed, ordered list of named criteria whose weights sum
//! to 1.0. Each task kind has a default rubric; configuration may override
//! individual weights, after which the rubric is re-normalised.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::TaskKind;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub weight: f64,
    pub description: String,
}

impl Criterion {
    fn new(name: &str, weight: f64, description: &str) -> Self {
        Self {
            name: name.to_string(),
            weight,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub kind: TaskKind,
    pub criteria: Vec<Criterion>,
}

impl Rubric {
    /// Default rubric for a task kind.
    pub fn for_kind(kind: TaskKind) -> Self {
        let criteria = match kind {
            TaskKind::Design => vec![
                Criterion::new("idioms", 0.25, "adherence to the target language's idioms and style"),
                Criterion::new("soundness", 0.25, "structural and technical soundness"),
                Criterion::new("implementability", 0.20, "how directly the design can be built"),
                Criterion::new("completeness", 0.15, "coverage of the requested functionality"),
                Criterion::new("novelty", 0.10, "original, well-motivated choices"),
                Criterion::new("clarity", 0.05, "readability and organisation"),
            ],
            TaskKind::Elaboration => vec![
                Criterion::new("structure", 0.30, "preserves the required outline"),
                Criterion::new("detail", 0.25, "depth of the specification"),
                Criterion::new("idioms", 0.20, "adherence to the target language's idioms"),
                Criterion::new("soundness", 0.15, "technical soundness"),
                Criterion::new("clarity", 0.10, "readability and organisation"),
            ],
            TaskKind::Implementation => vec![
                Criterion::new("checks", 0.35, "compiles, lints and passes automated checks"),
                Criterion::new("quality", 0.20, "code quality and error handling"),
                Criterion::new("tests", 0.15, "presence and depth of tests"),
                Criterion::new("documentation", 0.10, "comments and doc strings"),
                Criterion::new("idioms", 0.10, "adherence to the target language's idioms"),
                Criterion::new("structure", 0.10, "decomposition into functions and types"),
            ],
        };
        Self { kind, criteria }
    }

    /// Apply weight overrides by criterion name, then re-normalise.
    ///
    /// # Errors
    ///
    /// Unknown criterion names and invalid weights are configuration errors.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, f64>) -> Result<Self> {
        for (name, weight) in overrides {
            let criterion = self
                .criteria
                .iter_mut()
                .find(|c| &c.name == name)
                .ok_or_else(|| {
                    Error::Config(format!("{}: unknown rubric criterion {name}", self.kind))
                })?;
            criterion.weight = *weight;
        }
        self.validate()?;
        Ok(self.normalized())
    }

    /// Scale weights so they sum to 1.0.
    pub fn normalized(mut self) -> Self {
        let total: f64 = self.criteria.iter().map(|c| c.weight).sum();
        if total > 0.0 {
            for c in &mut self.criteria {
                c.weight /= total;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.criteria.is_empty() {
            return Err(Error::Config(format!("{}: rubric has no criteria", self.kind)));
        }
        if self.criteria.iter().any(|c| c.weight < 0.0 || !c.weight.is_finite()) {
            return Err(Error::Config(format!("{}: negative rubric weight", self.kind)));
        }
        if self.criteria.iter().all(|c| c.weight == 0.0) {
            return Err(Error::Config(format!("{}: rubric weights are all zero", self.kind)));
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.criteria.iter().map(|c| c.name.as_str())
    }

    /// Weighted sum of per-criterion scores. Missing criteria score zero.
    pub fn weighted_total(&self, scores: &BTreeMap<String, f64>) -> f64 {
        self.criteria
            .iter()
            .map(|c| c.weight * scores.get(&c.name).copied().unwrap_or(0.0).clamp(0.0, 1.0))
            .sum()
    }

    /// Rubric rendered for inclusion in a worker or judge prompt.
    pub fn describe(&self) -> String {
        self.criteria
            .iter()
            .map(|c| format!("- {} ({:.0}%): {}", c.name, c.weight * 100.0, c.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
