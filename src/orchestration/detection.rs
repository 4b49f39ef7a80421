//! Project language detection.
//!
//! When a submission carries no capability hint, the target language is
//! inferred from the project directory. Three kinds of evidence are
//! collected per language:
//!
//! - **Config files** such as `Cargo.toml` or `go.mod` at the project root
//!   (confidence 0.9 each)
//! - **Source files** with the language's extensions, scanned to depth 3
//!   (confidence `min(0.7, 0.5 + 0.02 * count)`)
//! - **Markers** found in up to ten sampled source files
//!   (confidence `min(0.5, 0.2 + 0.3 * matches / sampled)`)
//!
//! A language's score is the mean of its squared evidence confidences. The
//! best language is accepted only at [`CONFIDENCE_THRESHOLD`] or above.
//!
//! ## Example
//!
//! ```no_run
//! use gauntlet::orchestration::detection::detect;
//!
//! let report = detect(std::path::Path::new("."));
//! if let Some(lang) = report.language {
//!     println!("{lang} ({:.0}%)", report.confidence * 100.0);
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::core::Language;
use crate::util::blocking_with_timeout;
use crate::{Error, Result};

/// Minimum score for a detection to count.
pub const CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Directories deeper than this are not scanned.
pub const SCAN_DEPTH: usize = 3;

const SAMPLE_FILES: usize = 10;

/// Detection on a huge or slow filesystem gives up after this long.
const DETECTION_TIMEOUT: Duration = Duration::from_secs(10);

const SKIP_DIRS: &[&str] = &[
    ".git",
    ".vscode",
    "node_modules",
    "__pycache__",
    "target",
    "dist",
    "build",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Config,
    Source,
    Pattern,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    pub language: Language,
    pub kind: EvidenceKind,
    pub confidence: f64,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionReport {
    /// Accepted language, if the best score reached the threshold.
    pub language: Option<Language>,
    /// Score of the best candidate language, accepted or not.
    pub confidence: f64,
    pub best_guess: Option<Language>,
    pub evidence: Vec<Evidence>,
}

/// Detect the dominant language of a project directory.
pub fn detect(root: &Path) -> DetectionReport {
    let files = scan(root);
    let mut evidence = config_evidence(root);
    evidence.extend(source_evidence(&files));
    evidence.extend(pattern_evidence(&files));

    let mut scores: BTreeMap<Language, Vec<f64>> = BTreeMap::new();
    for e in &evidence {
        scores.entry(e.language).or_default().push(e.confidence);
    }

    let best = scores
        .iter()
        .map(|(lang, confs)| {
            let mean = confs.iter().map(|c| c * c).sum::<f64>() / confs.len() as f64;
            (*lang, mean)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1));

    let (best_guess, confidence) = match best {
        Some((lang, score)) => (Some(lang), score),
        None => (None, 0.0),
    };
    let language = best_guess.filter(|_| confidence >= CONFIDENCE_THRESHOLD);

    debug!(
        root = %root.display(),
        language = ?language,
        confidence,
        evidence = evidence.len(),
        "language detection"
    );

    DetectionReport {
        language,
        confidence,
        best_guess,
        evidence,
    }
}

/// Resolve a task capability from an optional hint and a project directory.
///
/// A parseable hint wins. An unknown hint is logged and detection runs as
/// if no hint had been given.
pub async fn infer_capability(hint: Option<&str>, project: &Path) -> Result<Option<Language>> {
    if let Some(hint) = hint {
        match hint.parse::<Language>() {
            Ok(lang) => return Ok(Some(lang)),
            Err(_) => warn!(hint, "unknown language hint, falling back to detection"),
        }
    }
    let project = project.to_path_buf();
    match blocking_with_timeout(DETECTION_TIMEOUT, move || Ok(detect(&project))).await {
        Ok(report) => Ok(report.language),
        Err(Error::Timeout(after)) => {
            warn!(?after, "language detection timed out, treating task as generic");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn config_evidence(root: &Path) -> Vec<Evidence> {
    let mut evidence = Vec::new();
    for lang in Language::ALL {
        for file in lang.config_files() {
            if root.join(file).exists() {
                evidence.push(Evidence {
                    language: lang,
                    kind: EvidenceKind::Config,
                    confidence: 0.9,
                    detail: format!("found {file}"),
                });
            }
        }
    }
    evidence
}

fn source_evidence(files: &[PathBuf]) -> Vec<Evidence> {
    let mut evidence = Vec::new();
    for lang in Language::ALL {
        let count = files.iter().filter(|f| has_extension(f, lang)).count();
        if count > 0 {
            evidence.push(Evidence {
                language: lang,
                kind: EvidenceKind::Source,
                confidence: (0.5 + 0.02 * count as f64).min(0.7),
                detail: format!("{count} {lang} source files"),
            });
        }
    }
    evidence
}

fn pattern_evidence(files: &[PathBuf]) -> Vec<Evidence> {
    let samples: Vec<String> = files
        .iter()
        .filter(|f| Language::ALL.iter().any(|lang| has_extension(f, *lang)))
        .take(SAMPLE_FILES)
        .filter_map(|f| fs::read(f).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .collect();
    if samples.is_empty() {
        return Vec::new();
    }

    let mut evidence = Vec::new();
    for lang in Language::ALL {
        let matches = samples
            .iter()
            .filter(|content| lang.source_markers().iter().any(|m| content.contains(m)))
            .count();
        if matches > 0 {
            let ratio = matches as f64 / samples.len() as f64;
            evidence.push(Evidence {
                language: lang,
                kind: EvidenceKind::Pattern,
                confidence: (0.2 + 0.3 * ratio).min(0.5),
                detail: format!("{lang} markers in {matches}/{} files", samples.len()),
            });
        }
    }
    evidence
}

fn has_extension(path: &Path, lang: Language) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .is_some_and(|ext| lang.extensions().contains(&ext.as_str()))
}

/// Files under `root` to [`SCAN_DEPTH`], skipping vendored and build dirs.
fn scan(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    walk(root, 0, &mut files);
    files.sort();
    files
}

fn walk(dir: &Path, depth: usize, files: &mut Vec<PathBuf>) {
    if depth > SCAN_DEPTH {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            let skip = entry
                .file_name()
                .to_str()
                .is_some_and(|name| SKIP_DIRS.contains(&name));
            if !skip {
                subdirs.push(path);
            }
        } else if file_type.is_file() {
            files.push(path);
        }
    }
    for sub in subdirs {
        walk(&sub, depth + 1, files);
    }
}
