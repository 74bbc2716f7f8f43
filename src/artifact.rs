//! Artifacts and the per-run artifact store.
//!
//! A store is one run's artifact namespace. Names are unique within it and
//! artifacts are never overwritten; a new run starts from a new store.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub const STORE_INDEX_FILE: &str = "artifacts.json";

/// Location of an artifact's payload. The store never holds payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(PathBuf);

impl PayloadRef {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self(location.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Resolves `file` inside a directory payload; a file payload is returned as is.
    pub fn resolve(&self, file: &str) -> PathBuf {
        if self.0.is_dir() {
            self.0.join(file)
        } else {
            self.0.clone()
        }
    }
}

impl std::fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Copies the directory tree at `from` into `to`, creating `to` as needed.
/// Symlinks are followed and `.git` directories are skipped. Returns the
/// number of files copied.
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<usize> {
    fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let source = entry.path();
        let target = to.join(&name);
        if fs::metadata(&source)?.is_dir() {
            copied += copy_tree(&source, &target)?;
        } else {
            fs::copy(&source, &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Labels applied to everything a run produces.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub payload: PayloadRef,
    pub produced_by: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        produced_by: impl Into<String>,
        name: impl Into<String>,
        payload: PayloadRef,
    ) -> Self {
        Self {
            name: name.into(),
            payload,
            produced_by: produced_by.into(),
            metadata: BTreeMap::new(),
            labels: Labels::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_labels(mut self, labels: &Labels) -> Self {
        self.labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ArtifactStore {
    #[serde(skip)]
    root: Option<PathBuf>,
    artifacts: BTreeMap<String, Artifact>,
}

impl ArtifactStore {
    /// Store persisted under `root` (the run directory).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Reloads the index a previous run persisted under `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let index = root.join(STORE_INDEX_FILE);
        let content = fs::read_to_string(&index)
            .with_context(|| format!("Failed to read artifact index: {}", index.display()))?;
        let mut store: ArtifactStore = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact index: {}", index.display()))?;
        store.root = Some(root.to_path_buf());
        Ok(store)
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Records `artifact_name` as produced by `stage_name`.
    pub fn put(
        &mut self,
        stage_name: &str,
        artifact_name: &str,
        payload: PayloadRef,
    ) -> Result<&Artifact, StoreError> {
        self.insert(Artifact::new(stage_name, artifact_name, payload))
    }

    pub fn insert(&mut self, artifact: Artifact) -> Result<&Artifact, StoreError> {
        use std::collections::btree_map::Entry;

        match self.artifacts.entry(artifact.name.clone()) {
            Entry::Occupied(existing) => Err(StoreError::DuplicateArtifact {
                stage: existing.get().produced_by.clone(),
                artifact: artifact.name,
            }),
            Entry::Vacant(slot) => Ok(slot.insert(artifact)),
        }
    }

    pub fn get(&self, artifact_name: &str) -> Result<&Artifact, StoreError> {
        self.artifacts
            .get(artifact_name)
            .ok_or_else(|| StoreError::ArtifactNotFound {
                artifact: artifact_name.to_string(),
            })
    }

    pub fn payload(&self, artifact_name: &str) -> Result<&PayloadRef, StoreError> {
        self.get(artifact_name).map(|artifact| &artifact.payload)
    }

    pub fn contains(&self, artifact_name: &str) -> bool {
        self.artifacts.contains_key(artifact_name)
    }

    pub fn names(&self) -> Vec<String> {
        self.artifacts.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Drops everything produced by `stages`, returning the removed names.
    pub fn discard_produced_by(&mut self, stages: &[&str]) -> Vec<String> {
        let removed: Vec<String> = self
            .artifacts
            .values()
            .filter(|artifact| stages.contains(&artifact.produced_by.as_str()))
            .map(|artifact| artifact.name.clone())
            .collect();
        for name in &removed {
            self.artifacts.remove(name);
        }
        removed
    }

    /// Writes the index next to the payloads. No-op for in-memory stores.
    pub fn persist(&self) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create run directory: {}", root.display()))?;
        let index = root.join(STORE_INDEX_FILE);
        let file = File::create(&index)
            .with_context(|| format!("Failed to create artifact index: {}", index.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("Failed to write artifact index: {}", index.display()))?;
        Ok(())
    }
}
