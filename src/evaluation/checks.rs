//! External checks for implementation candidates.
//!
//! A check is a command line; `{file}` in any argument is replaced with the
//! path of a source file. Exit status zero passes. Each check runs under
//! its own timeout and is killed when it expires.
//!
//! Worker replies are markdown, so before checking a candidate the fenced
//! code is pulled out into `<slot workspace>/candidate<ext>`, with the
//! extension taken from the task's language.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::CheckConfig;
use crate::core::Language;
use crate::evaluation::heuristics::CriterionScore;
use crate::util::{preview, split_command};

const FILE_PLACEHOLDER: &str = "{file}";
const SOURCE_STEM: &str = "candidate";

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[ \t]*([A-Za-z0-9_+#.-]*)[^\n]*\n(.*?)^[ \t]*```").unwrap()
});

/// The code in a reply.
///
/// Fenced blocks tagged with `language` win; failing those, untagged blocks;
/// failing those, every block. A reply without fences is taken as code.
pub fn extract_source(text: &str, language: Option<Language>) -> String {
    let blocks: Vec<(&str, &str)> = FENCE_RE
        .captures_iter(text)
        .map(|c| {
            let tag = c.get(1).map_or("", |m| m.as_str());
            let body = c.get(2).map_or("", |m| m.as_str());
            (tag, body)
        })
        .collect();
    if blocks.is_empty() {
        return text.to_string();
    }

    let tagged: Vec<&str> = match language {
        Some(lang) => blocks
            .iter()
            .filter(|(tag, _)| tag.parse::<Language>().ok() == Some(lang))
            .map(|(_, body)| *body)
            .collect(),
        None => Vec::new(),
    };
    let chosen = if !tagged.is_empty() {
        tagged
    } else {
        let untagged: Vec<&str> = blocks
            .iter()
            .filter(|(tag, _)| tag.is_empty())
            .map(|(_, body)| *body)
            .collect();
        if untagged.is_empty() {
            blocks.iter().map(|(_, body)| *body).collect()
        } else {
            untagged
        }
    };
    chosen.join("\n")
}

/// Where the extracted source of the reply at `reply` is written: the
/// slot's `.work` directory next to it.
pub fn source_path(reply: &Path, language: Option<Language>) -> PathBuf {
    let ext = language
        .and_then(|l| l.extensions().first().copied())
        .unwrap_or(".txt");
    reply
        .with_extension("work")
        .join(format!("{SOURCE_STEM}{ext}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub results: Vec<CheckResult>,
}

impl CheckReport {
    /// Fraction of checks that passed; 0 when none ran.
    pub fn pass_ratio(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        let passed = self.results.iter().filter(|r| r.passed).count();
        passed as f64 / self.results.len() as f64
    }

    pub fn into_score(self) -> CriterionScore {
        let score = self.pass_ratio();
        let (strengths, weaknesses) = self
            .results
            .into_iter()
            .partition::<Vec<_>, _>(|r| r.passed);
        CriterionScore {
            score,
            strengths: strengths
                .into_iter()
                .map(|r| format!("{} passed", r.name))
                .collect(),
            weaknesses: weaknesses
                .into_iter()
                .map(|r| format!("{} failed: {}", r.name, r.detail))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckRunner {
    checks: Vec<CheckConfig>,
}

impl CheckRunner {
    pub fn new(checks: Vec<CheckConfig>) -> Self {
        Self { checks }
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Extract the code from the reply saved at `reply` and check it.
    pub async fn run_on_reply(
        &self,
        reply: &Path,
        text: &str,
        language: Option<Language>,
    ) -> CheckReport {
        let source = source_path(reply, language);
        let code = extract_source(text, language);
        let written: std::io::Result<()> = async {
            if let Some(dir) = source.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(&source, code).await
        }
        .await;

        if let Err(e) = written {
            warn!(path = %source.display(), error = %e, "could not write extracted source");
            let results = self
                .checks
                .iter()
                .map(|check| CheckResult {
                    name: check.name.clone(),
                    passed: false,
                    detail: format!("could not write source: {e}"),
                })
                .collect();
            return CheckReport { results };
        }
        self.run(&source).await
    }

    pub async fn run(&self, file: &Path) -> CheckReport {
        let mut results = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let result = run_one(check, file).await;
            debug!(check = %result.name, passed = result.passed, file = %file.display(), "check finished");
            results.push(result);
        }
        CheckReport { results }
    }
}

async fn run_one(check: &CheckConfig, file: &Path) -> CheckResult {
    let fail = |detail: String| CheckResult {
        name: check.name.clone(),
        passed: false,
        detail,
    };

    let parts = match split_command(&check.command) {
        Ok(parts) => parts,
        Err(e) => return fail(e.to_string()),
    };
    let file_arg = file.to_string_lossy();
    let mut args = parts.iter().map(|p| p.replace(FILE_PLACEHOLDER, &file_arg));
    let Some(program) = args.next() else {
        return fail("empty command".to_string());
    };

    let mut cmd = Command::new(&program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = file.parent() {
        cmd.current_dir(dir);
    }

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return fail(format!("{program}: {e}")),
    };

    let limit = check.timeout();
    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => CheckResult {
            name: check.name.clone(),
            passed: true,
            detail: String::new(),
        },
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let text = if stderr.trim().is_empty() { stdout } else { stderr };
            fail(preview(text.trim(), 200))
        }
        Ok(Err(e)) => fail(e.to_string()),
        Err(_) => {
            warn!(check = %check.name, timeout = ?limit, "check timed out");
            fail(format!("timed out after {limit:?}"))
        }
    }
}
