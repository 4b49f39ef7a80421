//! Structural outlines and the hard gate.
//!
//! An `Outline` is the ordered list of section headings a candidate must
//! reproduce exactly. Headings are compared after normalisation: leading
//! numbering, emphasis markers and trailing colons are stripped, case is
//! folded and whitespace collapsed. So `## 2.1 Data Model:` and
//! `## data   model` are the same section, while a renamed section counts
//! as one missing plus one extra.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// ATX heading: hashes, then title.
static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").unwrap());

/// Leading section number such as `2.`, `2.3` or `2.3.1.`.
static NUMBERING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)*)\.?(?:\s+|$)").unwrap());

/// Missing sections cost more than extra ones in the soft structure score.
const MISSING_PENALTY: f64 = 0.3;
const EXTRA_PENALTY: f64 = 0.1;

/// A parsed markdown heading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub level: usize,
    /// Leading section number, if any.
    pub number: Option<String>,
    pub title: String,
}

/// Required sections at one heading level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outline {
    /// Heading depth the sections live at (2 for `##`).
    pub level: usize,
    /// Normalised section titles, in required order.
    pub sections: Vec<String>,
}

/// Result of checking a document against an outline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralCheck {
    pub missing: Vec<String>,
    pub extra: Vec<String>,
    /// All sections present but in a different order.
    pub misordered: bool,
}

impl StructuralCheck {
    pub fn passed(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && !self.misordered
    }

    pub fn into_error(self) -> Error {
        Error::StructuralViolation {
            missing: self.missing,
            extra: self.extra,
        }
    }

    pub fn summary(&self) -> String {
        if self.passed() {
            return "structure matches".to_string();
        }
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing: {}", self.missing.join(", ")));
        }
        if !self.extra.is_empty() {
            parts.push(format!("extra: {}", self.extra.join(", ")));
        }
        if self.misordered {
            parts.push("sections out of order".to_string());
        }
        parts.join("; ")
    }
}

/// Normalise a heading title for comparison.
pub fn normalize(title: &str) -> String {
    let stripped = NUMBERING_RE.replace(title.trim(), "");
    let cleaned: String = stripped
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '`'))
        .collect();
    cleaned
        .trim()
        .trim_end_matches(':')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// All ATX headings outside fenced code blocks.
pub fn headings(document: &str) -> Vec<Heading> {
    let mut in_fence = false;
    let mut found = Vec::new();
    for line in document.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = HEADING_RE.captures(trimmed) {
            let title = caps[2].to_string();
            let number = NUMBERING_RE
                .captures(&title)
                .map(|n| n[1].to_string());
            found.push(Heading {
                level: caps[1].len(),
                number,
                title,
            });
        }
    }
    found
}

impl Outline {
    pub fn new<S: AsRef<str>>(level: usize, sections: &[S]) -> Self {
        Self {
            level,
            sections: sections.iter().map(|s| normalize(s.as_ref())).collect(),
        }
    }

    /// Parse an outline file: one section per line, optionally as headings.
    ///
    /// The level comes from the first heading line, or 2 when the file is
    /// plain titles.
    pub fn parse(text: &str) -> Result<Self> {
        let mut level = None;
        let mut sections = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match HEADING_RE.captures(line) {
                Some(caps) => {
                    level.get_or_insert(caps[1].len());
                    sections.push(normalize(&caps[2]));
                }
                None => sections.push(normalize(line.trim_start_matches(['-', '*']))),
            }
        }
        if sections.is_empty() {
            return Err(Error::Validation("outline has no sections".to_string()));
        }
        Ok(Self {
            level: level.unwrap_or(2),
            sections,
        })
    }

    /// Direct subsections of one section of a parent document.
    ///
    /// `section_id` is a number such as `2.3` or a section name.
    pub fn from_parent_section(document: &str, section_id: &str) -> Result<Self> {
        let all = headings(document);
        let wanted_name = normalize(&section_id.replace(['-', '_'], " "));
        let is_number = NUMBERING_RE.is_match(section_id.trim());

        let start = all
            .iter()
            .position(|h| {
                if is_number {
                    h.number.as_deref() == Some(section_id.trim().trim_end_matches('.'))
                } else {
                    normalize(&h.title) == wanted_name
                }
            })
            .ok_or_else(|| Error::Validation(format!("section not found: {section_id}")))?;

        let parent_level = all[start].level;
        let sections: Vec<String> = all[start + 1..]
            .iter()
            .take_while(|h| h.level > parent_level)
            .filter(|h| h.level == parent_level + 1)
            .map(|h| normalize(&h.title))
            .collect();

        if sections.is_empty() {
            return Err(Error::Validation(format!(
                "section {section_id} has no subsections"
            )));
        }
        Ok(Self {
            level: parent_level + 1,
            sections,
        })
    }

    /// Normalised headings of `document` at this outline's level.
    pub fn extract(&self, document: &str) -> Vec<String> {
        headings(document)
            .into_iter()
            .filter(|h| h.level == self.level)
            .map(|h| normalize(&h.title))
            .collect()
    }

    /// Exact structural match: same sections, same order, nothing extra.
    pub fn check(&self, document: &str) -> StructuralCheck {
        let found = self.extract(document);
        let missing: Vec<String> = self
            .sections
            .iter()
            .filter(|s| !found.contains(s))
            .cloned()
            .collect();
        let extra: Vec<String> = found
            .iter()
            .filter(|s| !self.sections.contains(s))
            .cloned()
            .collect();
        let misordered = missing.is_empty() && extra.is_empty() && found != self.sections;
        StructuralCheck {
            missing,
            extra,
            misordered,
        }
    }

    /// Soft score in [0, 1] used by the `structure` criterion.
    pub fn structure_score(&self, document: &str) -> f64 {
        let check = self.check(document);
        let mut score = 1.0
            - MISSING_PENALTY * check.missing.len() as f64
            - EXTRA_PENALTY * check.extra.len() as f64;
        if check.misordered {
            score -= EXTRA_PENALTY;
        }
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
# Timer App

## 1. Overview
text

## 2. Components

### 2.1 Data Model
fields

### 2.2 Scheduler:
ticks

```markdown
### 2.9 Not A Heading
```

## 3. Testing
";

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("2.3. Data  **Model**:"), "data model");
        assert_eq!(normalize("Overview"), "overview");
        assert_eq!(normalize("  `API` surface "), "api surface");
    }

    #[test]
    fn test_headings_skip_fences() {
        let hs = headings(DOC);
        assert!(hs.iter().all(|h| !h.title.contains("Not A Heading")));
        assert_eq!(hs[2].number.as_deref(), Some("2"));
        assert_eq!(hs[3].level, 3);
    }

    #[test]
    fn test_exact_match_passes() {
        let outline = Outline::new(2, &["Overview", "Components", "Testing"]);
        let check = outline.check(DOC);
        assert!(check.passed(), "{check:?}");
        assert_eq!(outline.structure_score(DOC), 1.0);
    }

    #[test]
    fn test_missing_and_extra() {
        let outline = Outline::new(2, &["Overview", "Components", "Deployment"]);
        let check = outline.check(DOC);
        assert_eq!(check.missing, ["deployment"]);
        assert_eq!(check.extra, ["testing"]);
        assert!(!check.passed());
        assert!((outline.structure_score(DOC) - 0.6).abs() < 1e-9);
        assert!(matches!(check.into_error(), Error::StructuralViolation { .. }));
    }

    #[test]
    fn test_order_matters() {
        let outline = Outline::new(2, &["Components", "Overview", "Testing"]);
        let check = outline.check(DOC);
        assert!(check.misordered);
        assert!(!check.passed());
    }

    #[test]
    fn test_from_parent_section_by_number() {
        let outline = Outline::from_parent_section(DOC, "2").unwrap();
        assert_eq!(outline.level, 3);
        assert_eq!(outline.sections, ["data model", "scheduler"]);
    }

    #[test]
    fn test_from_parent_section_by_name() {
        let outline = Outline::from_parent_section(DOC, "components").unwrap();
        assert_eq!(outline.sections.len(), 2);
        assert!(Outline::from_parent_section(DOC, "overview").is_err());
        assert!(Outline::from_parent_section(DOC, "9.9").is_err());
    }

    #[test]
    fn test_parse_outline_file() {
        let outline = Outline::parse("### Data Model\n### Scheduler\n").unwrap();
        assert_eq!(outline.level, 3);
        assert_eq!(outline.sections, ["data model", "scheduler"]);

        let plain = Outline::parse("- Overview\n- Testing\n").unwrap();
        assert_eq!(plain.level, 2);
        assert_eq!(plain.sections, ["overview", "testing"]);

        assert!(Outline::parse("\n\n").is_err());
    }
}
