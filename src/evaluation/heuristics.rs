//! Deterministic text scorer.
//!
//! Each rubric criterion has a scorer that inspects the candidate text and
//! returns a score in [0, 1] plus the strengths and weaknesses it noticed.
//! Most criteria start from a neutral 0.5 and move up or down on concrete
//! signals. The `checks` criterion runs configured commands through
//! [`CheckRunner`] against the code extracted from the reply; without any,
//! it falls back to a static sanity check.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::config::CheckConfig;
use crate::core::{Candidate, Language, Task};
use crate::error::Result;
use crate::evaluation::checks::CheckRunner;
use crate::evaluation::outline::headings;
use crate::evaluation::{Scorecard, Scorer, ScoringContext};

static SENTENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?]+\s").unwrap());
static NUMBERED_LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\d+[.)]\s+\S").unwrap());
static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*\|?\s*:?-{3,}").unwrap());

/// One criterion's verdict on one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct CriterionScore {
    pub score: f64,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
}

/// Accumulates adjustments from a base score.
struct Assessment {
    score: f64,
    strengths: Vec<String>,
    weaknesses: Vec<String>,
}

impl Assessment {
    fn from(base: f64) -> Self {
        Self {
            score: base,
            strengths: Vec::new(),
            weaknesses: Vec::new(),
        }
    }

    fn gain(&mut self, amount: f64, note: impl Into<String>) {
        self.score += amount;
        self.strengths.push(note.into());
    }

    fn lose(&mut self, amount: f64, note: impl Into<String>) {
        self.score -= amount;
        self.weaknesses.push(note.into());
    }

    /// `gain` when the condition holds, otherwise `lose`.
    fn either(&mut self, cond: bool, up: f64, yes: &str, down: f64, no: &str) {
        if cond {
            self.gain(up, yes);
        } else {
            self.lose(down, no);
        }
    }

    fn finish(self) -> CriterionScore {
        CriterionScore {
            score: self.score.clamp(0.0, 1.0),
            strengths: self.strengths,
            weaknesses: self.weaknesses,
        }
    }
}

/// Qualitative band for a score.
pub fn band(score: f64) -> &'static str {
    if score >= 0.8 {
        "excellent"
    } else if score >= 0.6 {
        "good"
    } else if score >= 0.4 {
        "adequate"
    } else {
        "weak"
    }
}

fn any_of(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

fn count_of(text: &str, needles: &[&str]) -> usize {
    needles.iter().filter(|n| text.contains(*n)).count()
}

fn code_blocks(text: &str) -> usize {
    text.matches("```").count() / 2
}

pub fn idioms(text: &str, language: Option<Language>) -> CriterionScore {
    let lc = text.to_lowercase();
    let mut a = Assessment::from(0.5);
    let Some(lang) = language else {
        a.either(
            any_of(&lc, &["best practice", "convention", "idiomatic"]),
            0.2,
            "mentions best practices and conventions",
            0.1,
            "no mention of best practices",
        );
        return a.finish();
    };

    match count_of(&lc, lang.idioms()) {
        n if n >= 3 => a.gain(0.3, format!("strong use of {lang} idioms")),
        n if n >= 1 => a.gain(0.1, format!("some use of {lang} idioms")),
        _ => a.lose(0.2, format!("limited use of {lang} idioms")),
    }
    a.either(
        !any_of(&lc, lang.anti_patterns()),
        0.1,
        &format!("avoids common {lang} anti-patterns"),
        0.2,
        &format!("contains {lang} anti-patterns"),
    );
    if any_of(&lc, &["best practice", "idiomatic", "convention"]) {
        a.gain(0.1, format!("discusses {lang} best practices"));
    }
    a.finish()
}

pub fn soundness(text: &str) -> CriterionScore {
    let lc = text.to_lowercase();
    let mut a = Assessment::from(0.5);
    match count_of(&lc, &["component", "module", "service", "layer", "interface"]) {
        n if n >= 3 => a.gain(0.2, "well-defined components"),
        n if n >= 1 => a.gain(0.1, "some architectural structure"),
        _ => a.lose(0.2, "unclear architectural structure"),
    }
    a.either(
        any_of(&lc, &["scal", "performance", "concurren", "throughput"]),
        0.2,
        "addresses scalability",
        0.1,
        "limited scalability discussion",
    );
    a.either(
        any_of(&lc, &["data flow", "api", "protocol", "message", "request"]),
        0.15,
        "defines data flow",
        0.15,
        "unclear data flow",
    );
    a.either(
        any_of(&lc, &["error", "failure", "retry", "fault", "recover"]),
        0.15,
        "considers error handling",
        0.1,
        "limited error handling discussion",
    );
    a.finish()
}

pub fn implementability(text: &str) -> CriterionScore {
    let lc = text.to_lowercase();
    let mut a = Assessment::from(0.5);
    match code_blocks(text) {
        n if n >= 2 => a.gain(0.3, "concrete implementation guidance"),
        1 => a.gain(0.1, "some implementation detail"),
        _ => a.lose(0.2, "lacks implementation detail"),
    }
    a.either(
        any_of(&lc, &["library", "framework", "crate", "package", "dependency"]),
        0.2,
        "specifies technology choices",
        0.1,
        "unclear technology stack",
    );
    a.either(
        any_of(&lc, &["phase", "milestone", "roadmap", "step 1", "first,"]),
        0.2,
        "provides an implementation roadmap",
        0.1,
        "no implementation roadmap",
    );
    a.finish()
}

pub fn completeness(text: &str) -> CriterionScore {
    let lc = text.to_lowercase();
    let areas: &[&[&str]] = &[
        &["overview", "introduction", "summary"],
        &["architecture", "component"],
        &["data model", "schema", "data structure"],
        &["api", "interface"],
        &["error"],
        &["test"],
        &["security", "auth"],
        &["deploy", "configuration"],
    ];
    let covered = areas.iter().filter(|group| any_of(&lc, group)).count();
    let ratio = covered as f64 / areas.len() as f64;

    let mut a = Assessment::from(ratio);
    if ratio >= 0.8 {
        a.strengths.push("comprehensive coverage".to_string());
    } else if ratio >= 0.5 {
        a.strengths.push("covers most areas".to_string());
    } else {
        a.weaknesses.push("incomplete coverage".to_string());
    }
    let words = text.split_whitespace().count();
    if words > 1500 {
        a.gain(0.1, "detailed and thorough");
    } else if words < 300 {
        a.lose(0.1, "lacks detail");
    }
    a.finish()
}

pub fn novelty(text: &str) -> CriterionScore {
    let lc = text.to_lowercase();
    let mut a = Assessment::from(0.5);
    if any_of(&lc, &["novel", "innovative", "unique"]) {
        a.gain(0.2, "innovative thinking");
    }
    if any_of(&lc, &["modern", "state of the art"]) {
        a.gain(0.1, "modern approaches");
    }
    if any_of(&lc, &["optimi", "efficien", "cache"]) {
        a.gain(0.2, "focus on efficiency");
    }
    if any_of(&lc, &["extensib", "plugin", "pluggable"]) {
        a.gain(0.2, "designed for extensibility");
    }
    if lc.matches("complex").count() > 5 {
        a.lose(0.1, "may be overly complex");
    }
    a.finish()
}

pub fn clarity(text: &str) -> CriterionScore {
    let mut a = Assessment::from(0.5);
    match headings(text).len() {
        n if n >= 5 => a.gain(0.2, "well-structured sections"),
        n if n >= 2 => a.gain(0.1, "reasonable structure"),
        _ => a.lose(0.2, "poor document structure"),
    }
    if text.to_lowercase().contains("example") {
        a.gain(0.2, "provides examples");
    }
    let sentences = SENTENCE_RE.find_iter(text).count().max(1);
    let words = text.split_whitespace().count();
    a.either(
        (words / sentences) < 25,
        0.1,
        "readable sentence length",
        0.1,
        "sentences run long",
    );
    a.finish()
}

pub fn structure(text: &str, task: &Task) -> CriterionScore {
    if let Some(outline) = &task.outline {
        let check = outline.check(text);
        let mut a = Assessment::from(outline.structure_score(text));
        if check.passed() {
            a.strengths.push("preserves the required outline".to_string());
        } else {
            a.weaknesses.push(check.summary());
        }
        return a.finish();
    }
    match headings(text).len() {
        n if n >= 3 => Assessment::from(0.8).finish(),
        n if n >= 1 => Assessment::from(0.6).finish(),
        _ => {
            let mut a = Assessment::from(0.3);
            a.weaknesses.push("no sections".to_string());
            a.finish()
        }
    }
}

pub fn detail(text: &str) -> CriterionScore {
    let lc = text.to_lowercase();
    let indicators = [
        "parameter", "return", "type", "field", "example", "error", "constraint", "default",
    ];
    let hits = count_of(&lc, &indicators);
    let mut a = Assessment::from(0.4 * hits as f64 / indicators.len() as f64);
    if hits >= indicators.len() / 2 {
        a.strengths.push("specifies interfaces in detail".to_string());
    } else {
        a.weaknesses.push("thin on specifics".to_string());
    }
    match code_blocks(text) {
        n if n >= 2 => a.gain(0.2, "multiple code samples"),
        1 => a.gain(0.1, "a code sample"),
        _ => {}
    }
    if TABLE_RE.is_match(text) {
        a.gain(0.1, "uses tables");
    }
    if NUMBERED_LIST_RE.is_match(text) {
        a.gain(0.2, "step-by-step breakdown");
    }
    if any_of(&lc, &["edge case", "invariant", "precondition"]) {
        a.gain(0.1, "covers edge cases");
    }
    a.finish()
}

pub fn quality(text: &str) -> CriterionScore {
    let mut a = Assessment::from(0.5);
    a.either(
        any_of(
            text,
            &["Result<", "?;", "except", "catch", "if err != nil", "raise ", "throw "],
        ),
        0.3,
        "handles errors",
        0.4,
        "no visible error handling",
    );
    let functions = count_functions(text);
    if functions >= 3 {
        a.gain(0.2, "decomposed into functions");
    } else if functions >= 1 {
        a.gain(0.1, "some decomposition");
    } else {
        a.lose(0.2, "no functions found");
    }
    let lc = text.to_lowercase();
    if any_of(&lc, &["todo", "fixme", "xxx"]) {
        a.lose(0.1, "leaves TODO markers");
    }
    if text.lines().any(|l| l.len() > 120) {
        a.lose(0.1, "long lines");
    } else {
        a.gain(0.1, "consistent line length");
    }
    a.finish()
}

fn count_functions(text: &str) -> usize {
    ["fn ", "def ", "func ", "function ", "=> {"]
        .iter()
        .map(|kw| text.matches(kw).count())
        .sum()
}

pub fn tests(text: &str) -> CriterionScore {
    let markers = [
        "#[test]", "#[tokio::test]", "def test_", "func Test", "describe(", "it(", "@Test",
        "assert",
    ];
    let n: usize = markers.iter().map(|m| text.matches(m).count()).sum();
    let (score, note) = match n {
        n if n >= 5 => (1.0, "thorough tests"),
        n if n >= 3 => (0.8, "good tests"),
        n if n >= 1 => (0.5, "some tests"),
        _ => (0.0, "no tests"),
    };
    let mut a = Assessment::from(score);
    if score >= 0.5 {
        a.strengths.push(note.to_string());
    } else {
        a.weaknesses.push(note.to_string());
    }
    a.finish()
}

pub fn documentation(text: &str) -> CriterionScore {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        return Assessment::from(0.0).finish();
    }
    let comments = lines
        .iter()
        .filter(|l| {
            ["//", "#", "/*", "*", "\"\"\"", "'''", "--"]
                .iter()
                .any(|p| l.starts_with(p))
        })
        .count();
    let ratio = comments as f64 / lines.len() as f64;
    let mut a = Assessment::from(match ratio {
        r if r >= 0.15 => 1.0,
        r if r >= 0.05 => 0.7,
        r if r > 0.0 => 0.4,
        _ => 0.1,
    });
    if ratio >= 0.05 {
        a.strengths.push("well commented".to_string());
    } else {
        a.weaknesses.push("sparse comments".to_string());
    }
    a.finish()
}

/// Fallback for `checks`: non-empty, balanced delimiters, contains code.
pub fn static_sanity(text: &str) -> CriterionScore {
    let mut a = Assessment::from(0.0);
    let third = 1.0 / 3.0;
    if text.trim().is_empty() {
        a.weaknesses.push("empty output".to_string());
    } else {
        a.gain(third, "non-empty");
    }
    let balanced = [('(', ')'), ('[', ']'), ('{', '}')]
        .iter()
        .all(|(open, close)| text.matches(*open).count() == text.matches(*close).count());
    if balanced {
        a.gain(third, "balanced delimiters");
    } else {
        a.weaknesses.push("unbalanced delimiters".to_string());
    }
    if code_blocks(text) > 0 || count_functions(text) > 0 {
        a.gain(third, "contains code");
    } else {
        a.weaknesses.push("no code found".to_string());
    }
    a.finish()
}

/// Scores candidates with the functions above.
#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer {
    checks: CheckRunner,
}

impl HeuristicScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use these commands for the `checks` criterion.
    pub fn with_checks(checks: Vec<CheckConfig>) -> Self {
        Self {
            checks: CheckRunner::new(checks),
        }
    }

    async fn criterion(&self, name: &str, task: &Task, candidate: &Candidate) -> CriterionScore {
        let text = candidate.content.as_str();
        match name {
            "idioms" => idioms(text, task.capability),
            "soundness" => soundness(text),
            "implementability" => implementability(text),
            "completeness" => completeness(text),
            "novelty" => novelty(text),
            "clarity" => clarity(text),
            "structure" => structure(text, task),
            "detail" => detail(text),
            "quality" => quality(text),
            "tests" => tests(text),
            "documentation" => documentation(text),
            "checks" => match (&candidate.scratch_path, self.checks.is_empty()) {
                (Some(path), false) => self
                    .checks
                    .run_on_reply(path, text, task.capability)
                    .await
                    .into_score(),
                _ => static_sanity(text),
            },
            other => {
                let mut a = Assessment::from(0.5);
                a.weaknesses.push(format!("no deterministic scorer for {other}"));
                a.finish()
            }
        }
    }

    pub async fn scorecard(&self, ctx: &ScoringContext<'_>, candidate: &Candidate) -> Scorecard {
        let mut criteria = BTreeMap::new();
        let mut strengths = Vec::new();
        let mut weaknesses = Vec::new();
        for name in ctx.rubric.names() {
            let verdict = self.criterion(name, ctx.task, candidate).await;
            criteria.insert(name.to_string(), verdict.score);
            strengths.extend(verdict.strengths);
            weaknesses.extend(verdict.weaknesses);
        }
        let total = ctx.rubric.weighted_total(&criteria);
        Scorecard {
            candidate: candidate.id,
            criteria,
            rationale: rationale(total, &strengths, &weaknesses),
        }
    }
}

/// `good (0.72). Strengths: a, b. Weaknesses: c.`
pub fn rationale(total: f64, strengths: &[String], weaknesses: &[String]) -> String {
    let mut text = format!("{} ({total:.2}).", band(total));
    if !strengths.is_empty() {
        text.push_str(&format!(" Strengths: {}.", strengths.join(", ")));
    }
    if !weaknesses.is_empty() {
        text.push_str(&format!(" Weaknesses: {}.", weaknesses.join(", ")));
    }
    text
}

#[async_trait]
impl Scorer for HeuristicScorer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn score(
        &self,
        ctx: &ScoringContext<'_>,
        candidates: &[&Candidate],
    ) -> Result<Vec<Scorecard>> {
        let mut cards = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            cards.push(self.scorecard(ctx, candidate).await);
        }
        Ok(cards)
    }
}
