//! On-disk layout.
//!
//! ```text
//! <root>/scratch/<run>/b0-s1.md              transient candidate output
//! <root>/plan/<key>.md                       current artifact for a task key
//! <root>/plan/<key>.metadata.json
//! <root>/archive/<kind>/<run>/<id>.md        non-selected candidates
//! <root>/archive/<kind>/<run>/<id>.json
//! <root>/archive/<kind>/<run>/archive_index.json
//! ```
//!
//! Plan files are replaced with write-to-temp plus rename so a reader sees
//! either the previous artifact or the new one. Archive files are created
//! with `create_new` and never rewritten.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{CandidateId, TaskId, TaskKind};
use crate::error::{Error, Result};
use crate::worker::Priority;

pub const SCRATCH_DIR: &str = "scratch";
pub const PLAN_DIR: &str = "plan";
pub const ARCHIVE_DIR: &str = "archive";
pub const INDEX_FILE: &str = "archive_index.json";

/// Metadata written next to a placed artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementMetadata {
    pub task_id: TaskId,
    pub key: String,
    pub kind: TaskKind,
    pub candidate: CandidateId,
    pub worker: String,
    pub priority: Priority,
    pub score: f64,
    pub rationale: String,
    pub run: String,
    pub placed_at: DateTime<Utc>,
}

/// A non-selected candidate, as archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub task_id: TaskId,
    pub key: String,
    pub kind: TaskKind,
    pub candidate: CandidateId,
    pub worker: String,
    pub priority: Priority,
    /// `None` when the candidate was never scored.
    pub score: Option<f64>,
    #[serde(default)]
    pub criteria: BTreeMap<String, f64>,
    #[serde(default)]
    pub rationale: String,
    pub disqualified: bool,
    pub run_timestamp: DateTime<Utc>,
    /// Stored in the `.md` file, not the JSON.
    #[serde(skip)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveIndex {
    pub run: String,
    pub run_timestamp: DateTime<Utc>,
    pub kind: TaskKind,
    pub key: String,
    pub task_id: TaskId,
    pub record_count: usize,
    pub records: Vec<CandidateId>,
    /// Candidate placed by this run, if any.
    pub placed: Option<CandidateId>,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub root: PathBuf,
    pub total_bytes: u64,
    pub scratch_bytes: u64,
    pub plan_bytes: u64,
    pub archive_bytes: u64,
    pub artifacts: usize,
    pub archive_runs: usize,
}

/// Directory name for one run: start time plus task id.
pub fn run_label(started_at: DateTime<Utc>, task: &TaskId) -> String {
    format!("{}_{}", started_at.format("%Y%m%d_%H%M%S"), task.short())
}

/// Replace `path` with `contents` in one rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&temp, contents)?;
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    Ok(())
}

/// Create `path` only if absent. Returns false when it already existed.
fn write_new(path: &Path, contents: &[u8]) -> std::io::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(contents)?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(t) if t.is_dir() => dir_size(&entry.path()),
            Ok(_) => entry.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        })
        .sum()
}

/// A path that does not exist, including one whose parent is not a directory.
fn absent(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    pub fn plan_dir(&self) -> PathBuf {
        self.root.join(PLAN_DIR)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR)
    }

    pub fn scratch_dir(&self, run: &str) -> PathBuf {
        self.scratch_root().join(run)
    }

    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.plan_dir().join(format!("{key}.md"))
    }

    pub fn metadata_path(&self, key: &str) -> PathBuf {
        self.plan_dir().join(format!("{key}.metadata.json"))
    }

    pub fn run_archive_dir(&self, kind: TaskKind, run: &str) -> PathBuf {
        self.archive_dir().join(kind.as_str()).join(run)
    }

    /// Create the scratch directory for a run.
    pub fn create_scratch(&self, run: &str) -> Result<PathBuf> {
        let dir = self.scratch_dir(run);
        fs::create_dir_all(&dir)?;
        debug!(path = %dir.display(), "created scratch directory");
        Ok(dir)
    }

    /// Remove a run's scratch directory. Missing is fine.
    pub fn remove_scratch(&self, run: &str) -> Result<()> {
        let dir = self.scratch_dir(run);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(path = %dir.display(), "removed scratch directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the artifact for `meta.key` with the scratch file.
    ///
    /// The scratch file is left in place; cleanup removes it.
    pub fn place(&self, scratch_file: &Path, meta: &PlacementMetadata) -> Result<PathBuf> {
        if !scratch_file.exists() {
            return Err(Error::ScratchMissing(scratch_file.to_path_buf()));
        }
        let placement = |e: std::io::Error| Error::PlacementFailure(e.to_string());

        let content = fs::read(scratch_file)?;
        fs::create_dir_all(self.plan_dir()).map_err(placement)?;
        let target = self.artifact_path(&meta.key);
        write_atomic(&target, &content).map_err(placement)?;

        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&self.metadata_path(&meta.key), &json).map_err(placement)?;

        info!(key = %meta.key, candidate = %meta.candidate, path = %target.display(), "placed artifact");
        Ok(target)
    }

    pub fn read_artifact(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.artifact_path(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if absent(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_metadata(&self, key: &str) -> Result<Option<PlacementMetadata>> {
        match fs::read_to_string(self.metadata_path(key)) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if absent(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write one run's archive records and its index.
    ///
    /// Records that already exist on disk are left untouched, so a repeated
    /// call for the same run adds nothing.
    pub fn archive_run(&self, index: &ArchiveIndex, records: &[ArchiveRecord]) -> Result<PathBuf> {
        let dir = self.run_archive_dir(index.kind, &index.run);
        fs::create_dir_all(&dir)?;

        let mut written = 0;
        for record in records {
            let stem = record.candidate.to_string();
            if write_new(&dir.join(format!("{stem}.md")), record.content.as_bytes())? {
                written += 1;
            }
            write_new(
                &dir.join(format!("{stem}.json")),
                &serde_json::to_vec_pretty(record)?,
            )?;
        }
        write_new(&dir.join(INDEX_FILE), &serde_json::to_vec_pretty(index)?)?;

        info!(
            kind = %index.kind,
            run = %index.run,
            records = written,
            path = %dir.display(),
            "archived candidates"
        );
        Ok(dir)
    }

    pub fn read_archive_record(&self, kind: TaskKind, run: &str, id: CandidateId) -> Result<ArchiveRecord> {
        let dir = self.run_archive_dir(kind, run);
        let mut record: ArchiveRecord =
            serde_json::from_str(&fs::read_to_string(dir.join(format!("{id}.json")))?)?;
        record.content = fs::read_to_string(dir.join(format!("{id}.md")))?;
        Ok(record)
    }

    /// Archived runs, newest first, optionally for one kind.
    pub fn history(&self, kind: Option<TaskKind>) -> Result<Vec<ArchiveIndex>> {
        let kinds: Vec<TaskKind> = match kind {
            Some(k) => vec![k],
            None => TaskKind::ALL.to_vec(),
        };
        let mut runs = Vec::new();
        for kind in kinds {
            let kind_dir = self.archive_dir().join(kind.as_str());
            let entries = match fs::read_dir(&kind_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries.flatten() {
                let index_path = entry.path().join(INDEX_FILE);
                let Ok(text) = fs::read_to_string(&index_path) else {
                    continue;
                };
                match serde_json::from_str::<ArchiveIndex>(&text) {
                    Ok(mut index) => {
                        index.path = entry.path();
                        runs.push(index);
                    }
                    Err(e) => warn!(path = %index_path.display(), error = %e, "unreadable archive index"),
                }
            }
        }
        runs.sort_by(|a, b| b.run_timestamp.cmp(&a.run_timestamp).then(b.run.cmp(&a.run)));
        Ok(runs)
    }

    pub fn storage_stats(&self) -> Result<StorageStats> {
        let artifacts = match fs::read_dir(self.plan_dir()) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| {
                    let name = e.file_name();
                    let name = name.to_string_lossy();
                    name.ends_with(".md") && !name.starts_with('.')
                })
                .count(),
            Err(_) => 0,
        };
        Ok(StorageStats {
            root: self.root.clone(),
            total_bytes: dir_size(&self.root),
            scratch_bytes: dir_size(&self.scratch_root()),
            plan_bytes: dir_size(&self.plan_dir()),
            archive_bytes: dir_size(&self.archive_dir()),
            artifacts,
            archive_runs: self.history(None)?.len(),
        })
    }
}
