//! Target languages a task can declare or have inferred.
//!
//! Capability matching is an explicit table lookup over this enum; workers
//! declare a language affinity in configuration and the resolver compares
//! values, never free-text descriptions.

use serde::{Deserialize, Serialize};

/// A programming language tag used as the task capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Go,
    Python,
    Rust,
    JavaScript,
    TypeScript,
    Java,
    CSharp,
    Cpp,
    C,
}

impl Language {
    /// All known languages, in detection order.
    pub const ALL: [Language; 9] = [
        Language::Go,
        Language::Python,
        Language::Rust,
        Language::JavaScript,
        Language::TypeScript,
        Language::Java,
        Language::CSharp,
        Language::Cpp,
        Language::C,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Go => "go",
            Language::Python => "python",
            Language::Rust => "rust",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Java => "java",
            Language::CSharp => "csharp",
            Language::Cpp => "cpp",
            Language::C => "c",
        }
    }

    /// Source file extensions, lower-case with leading dot.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Language::Go => &[".go"],
            Language::Python => &[".py"],
            Language::Rust => &[".rs"],
            Language::JavaScript => &[".js", ".mjs"],
            Language::TypeScript => &[".ts", ".tsx"],
            Language::Java => &[".java"],
            Language::CSharp => &[".cs"],
            Language::Cpp => &[".cpp", ".cc", ".hpp"],
            Language::C => &[".c", ".h"],
        }
    }

    /// Project files whose presence is strong evidence for the language.
    pub fn config_files(&self) -> &'static [&'static str] {
        match self {
            Language::Go => &["go.mod", "go.sum"],
            Language::Python => &["pyproject.toml", "requirements.txt", "setup.py", "Pipfile"],
            Language::Rust => &["Cargo.toml", "Cargo.lock"],
            Language::JavaScript => &["package.json", "yarn.lock", "package-lock.json"],
            Language::TypeScript => &["tsconfig.json"],
            Language::Java => &["pom.xml", "build.gradle"],
            Language::CSharp => &["global.json", "Directory.Build.props"],
            Language::Cpp => &["CMakeLists.txt"],
            Language::C => &["configure.ac"],
        }
    }

    /// Source markers sampled during detection.
    pub fn source_markers(&self) -> &'static [&'static str] {
        match self {
            Language::Go => &["package main", "func main()", "import ("],
            Language::Python => &["def ", "import ", "if __name__ == '__main__':"],
            Language::Rust => &["fn main()", "pub fn", "impl ", "use std::"],
            Language::JavaScript => &["function ", "const ", "=>", "require("],
            Language::TypeScript => &["interface ", ": string", ": number", "export type"],
            Language::Java => &["public class", "import java."],
            Language::CSharp => &["namespace ", "using System"],
            Language::Cpp => &["#include <", "std::"],
            Language::C => &["#include <stdio.h>", "int main("],
        }
    }

    /// Idioms a design in this language is expected to talk about.
    pub fn idioms(&self) -> &'static [&'static str] {
        match self {
            Language::Go => &["interface", "struct", "goroutine", "channel", "package"],
            Language::Python => &["class", "decorator", "context manager", "generator", "async"],
            Language::Rust => &["ownership", "borrowing", "trait", "enum", "match"],
            Language::JavaScript => &["promise", "async", "closure", "module"],
            Language::TypeScript => &["interface", "type", "generic", "module"],
            Language::Java => &["interface", "class", "stream", "package"],
            Language::CSharp => &["interface", "linq", "async", "namespace"],
            Language::Cpp => &["raii", "template", "smart pointer", "const"],
            Language::C => &["struct", "pointer", "header", "malloc"],
        }
    }

    /// Anti-patterns that cost a design idiom points.
    pub fn anti_patterns(&self) -> &'static [&'static str] {
        match self {
            Language::Go => &["inheritance", "exception"],
            Language::Python => &["global variables", "deep inheritance"],
            Language::Rust => &["unsafe everywhere", "clone everything"],
            Language::JavaScript => &["global pollution", "callback hell", "var "],
            Language::TypeScript => &[": any", "as any"],
            Language::Java => &["god class", "checked exception everywhere"],
            Language::CSharp => &["async void", "god class"],
            Language::Cpp => &["raw new", "macro soup"],
            Language::C => &["gets(", "unchecked malloc"],
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Language {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lang = match s.trim().to_lowercase().as_str() {
            "go" | "golang" => Language::Go,
            "python" | "py" | "python3" => Language::Python,
            "rust" | "rs" => Language::Rust,
            "javascript" | "js" | "node" | "nodejs" => Language::JavaScript,
            "typescript" | "ts" => Language::TypeScript,
            "java" => Language::Java,
            "csharp" | "c#" | "cs" | "dotnet" | ".net" => Language::CSharp,
            "cpp" | "c++" | "cxx" => Language::Cpp,
            "c" => Language::C,
            other => {
                return Err(crate::Error::Validation(format!(
                    "unknown language: {other}"
                )))
            }
        };
        Ok(lang)
    }
}
