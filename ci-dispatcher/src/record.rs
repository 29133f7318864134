// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The single append-merge JSON database of per-commit outcomes, keyed by
//! commit SHA.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Statistics {
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub skipped: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Error => "error",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Record {
    pub commit: String,
    pub status: Status,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Statistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Coerces the on-disk shape -- either a single object or an array -- into
/// a vector, matching the service's tolerant reader. Writers always emit
/// an array.
#[derive(Deserialize)]
#[serde(untagged)]
enum OnDisk {
    Many(Vec<Record>),
    One(Record),
}

impl From<OnDisk> for Vec<Record> {
    fn from(value: OnDisk) -> Self {
        match value {
            OnDisk::Many(records) => records,
            OnDisk::One(record) => vec![record],
        }
    }
}

pub struct RecordStore {
    db_file: PathBuf,
}

impl RecordStore {
    pub fn new(db_file: impl Into<PathBuf>) -> Self {
        Self {
            db_file: db_file.into(),
        }
    }

    async fn read_all(&self) -> Result<Vec<Record>> {
        if !ci_core::fs::exists(&self.db_file).await? {
            return Ok(Vec::new());
        }

        let data = tokio::fs::read(&self.db_file)
            .await
            .with_context(|| format!("unable to read record db: {}", self.db_file.display()))?;

        if data.is_empty() {
            return Ok(Vec::new());
        }

        let on_disk: OnDisk = serde_json::from_slice(&data)
            .with_context(|| format!("record db is not valid JSON: {}", self.db_file.display()))?;

        Ok(on_disk.into())
    }

    /// Returns every record whose `commit` starts with one of `prefixes`.
    /// Order is not guaranteed.
    pub async fn load(&self, prefixes: &[&str]) -> Result<Vec<Record>> {
        let all = self.read_all().await?;

        Ok(all
            .into_iter()
            .filter(|record| prefixes.iter().any(|p| record.commit.starts_with(p)))
            .collect())
    }

    pub async fn load_one(&self, prefix: &str) -> Result<Option<Record>> {
        Ok(self.load(&[prefix]).await?.into_iter().next())
    }

    /// Merges `records` into the DB by `commit`: existing records are
    /// overwritten field-by-field, novel records are appended. Writes the
    /// whole file back atomically (write-temp, rename).
    pub async fn save(&self, records: &[Record]) -> Result<()> {
        for record in records {
            if record.commit.trim().is_empty() {
                return Err(ApiError::Validation("record is missing a commit".into()).into());
            }
        }

        let mut all = self.read_all().await?;

        for incoming in records {
            if let Some(existing) = all.iter_mut().find(|r| r.commit == incoming.commit) {
                *existing = incoming.clone();
            } else {
                all.push(incoming.clone());
            }
        }

        write_atomic(&self.db_file, &all).await
    }
}

async fn write_atomic(path: &Path, records: &[Record]) -> Result<()> {
    let data = serde_json::to_vec_pretty(records)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("unable to create record db directory: {}", parent.display())
        })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("unable to write temp record db: {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("unable to replace record db: {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn record(commit: &str, status: Status) -> Record {
        Record {
            commit: commit.to_string(),
            status,
            description: "d".into(),
            coverage: None,
            statistics: None,
            results: None,
            branch: None,
        }
    }

    #[tokio::test]
    async fn missing_db_loads_empty() {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("db.json"));
        assert!(store.load(&["abc"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("db.json"));

        let commit = "cabe27e5".to_string() + &"a".repeat(32);
        let saved = record(&commit, Status::Failure);
        store.save(&[saved.clone()]).await.unwrap();

        let loaded = store.load(&["cabe27e5"]).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], saved);
    }

    #[tokio::test]
    async fn save_merges_by_commit() {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("db.json"));

        let commit = "a".repeat(40);
        store.save(&[record(&commit, Status::Error)]).await.unwrap();
        store.save(&[record(&commit, Status::Success)]).await.unwrap();

        let loaded = store.load(&[&commit]).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, Status::Success);
    }

    #[tokio::test]
    async fn save_rejects_missing_commit() {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("db.json"));

        let err = store.save(&[record("", Status::Error)]).await.unwrap_err();
        assert!(err.to_string().contains("commit"));
    }
}
