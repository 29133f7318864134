// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Turns a Cobertura XML report plus the checked-out source tree into the
//! per-file line-hit arrays the record store and coverage reasoner
//! consume.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;

use cobertura::{Class, CoberturaCoverage};

#[derive(Clone, Debug, Serialize)]
pub struct SourceFileCoverage {
    pub name: String,
    pub source_digest: String,
    /// Index `0` is unused (lines are 1-indexed); `None` marks a
    /// non-executable line.
    pub coverage: Vec<Option<u64>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CoverageReport {
    pub source_files: Vec<SourceFileCoverage>,
    pub commit_sha: String,
    pub run_at: DateTime<Local>,
    pub repo_token: Option<String>,
    pub service_name: String,
    pub service_pull_request: String,
}

impl CoverageReport {
    /// Overall hit-line percentage across every parsed source file, stored
    /// on the Record as `coverage`.
    pub fn percent(&self) -> f64 {
        let mut hit = 0u64;
        let mut total = 0u64;

        for file in &self.source_files {
            for line in file.coverage.iter().flatten() {
                total += 1;
                if *line > 0 {
                    hit += 1;
                }
            }
        }

        if total == 0 {
            0.0
        } else {
            (hit as f64 / total as f64) * 100.0
        }
    }
}

fn is_ignored_filename(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    lower.contains("tests\\")
        || lower.contains("tests/")
        || lower
            .rsplit(['/', '\\'])
            .next()
            .map(|base| base.starts_with('_') && base.contains("test"))
            .unwrap_or(false)
        || lower.contains("docs\\")
        || lower.contains("docs/")
}

fn leading_component(filename: &str) -> Option<&str> {
    filename.split(['/', '\\']).next()
}

/// Parses `xml_path`, digests each surviving class's source file under
/// `repo_root`, and selects the submodule partition matching `repo_name`
/// (falling back to the files that live directly in the checkout, `"main"`).
pub async fn parse_coverage_report(
    xml_path: impl AsRef<Path>,
    repo_root: impl AsRef<Path>,
    commit_sha: &str,
    repo_name: &str,
    submodules: &[String],
    repo_token: Option<String>,
    service_name: &str,
) -> Result<CoverageReport> {
    let repo_root = repo_root.as_ref();
    let xml_path = xml_path.as_ref();

    let data = tokio::fs::read(xml_path)
        .await
        .with_context(|| format!("unable to read coverage report: {}", xml_path.display()))?;
    let coverage: CoberturaCoverage =
        cobertura::parse(data.as_slice()).context("malformed coverage report")?;

    let run_at: DateTime<Local> = DateTime::from(
        std::time::UNIX_EPOCH + std::time::Duration::from_secs(coverage.timestamp),
    );

    let surviving: Vec<&Class> = coverage
        .all_classes()
        .filter(|class| !is_ignored_filename(&class.filename) && !class.lines.is_empty())
        .collect();

    let mut by_submodule: std::collections::HashMap<&str, Vec<&Class>> =
        std::collections::HashMap::new();
    let mut main_partition: Vec<&Class> = Vec::new();

    for class in surviving {
        match leading_component(&class.filename) {
            Some(head) if submodules.iter().any(|s| s.eq_ignore_ascii_case(head)) => {
                by_submodule.entry(head).or_default().push(class);
            }
            _ => main_partition.push(class),
        }
    }

    let selected: Vec<&Class> = by_submodule
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(repo_name))
        .map(|(_, classes)| classes.clone())
        .unwrap_or(main_partition);

    let mut source_files = Vec::with_capacity(selected.len());
    for class in selected {
        let source_path = repo_root.join(&class.filename);
        let source_text = tokio::fs::read(&source_path).await.with_context(|| {
            format!("unable to read covered source file: {}", source_path.display())
        })?;

        let source_digest = ci_core::digest::source_digest(&source_text);
        let text = String::from_utf8_lossy(&source_text);
        let line_count = ci_core::digest::line_count(&text);

        let mut line_hits: Vec<Option<u64>> = vec![None; line_count + 1];
        for line in &class.lines {
            if (line.number as usize) <= line_count {
                line_hits[line.number as usize] = Some(line.hits);
            }
        }

        source_files.push(SourceFileCoverage {
            name: class.filename.clone(),
            source_digest,
            coverage: line_hits,
        });
    }

    Ok(CoverageReport {
        source_files,
        commit_sha: commit_sha.to_string(),
        run_at,
        repo_token,
        service_name: service_name.to_string(),
        service_pull_request: String::new(),
    })
}

pub fn expected_report_path(data_path: &Path, sha: &str) -> PathBuf {
    data_path.join("reports").join(sha).join("CoverageResults.xml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"<?xml version="1.0" ?>
<coverage line-rate="0.5" branch-rate="0" timestamp="1700000000">
  <packages>
    <package name="main" line-rate="0.5" branch-rate="0">
      <classes>
        <class name="lib" filename="lib/util.py" line-rate="0.5" branch-rate="0">
          <lines>
            <line number="1" hits="1"/>
            <line number="2" hits="0"/>
          </lines>
        </class>
        <class name="t" filename="tests/test_util.py" line-rate="1.0" branch-rate="0">
          <lines><line number="1" hits="1"/></lines>
        </class>
      </classes>
    </package>
  </packages>
</coverage>"#;

    #[tokio::test]
    async fn filters_tests_and_computes_digest() {
        let dir = tempdir().unwrap();
        let repo_root = dir.path();
        tokio::fs::create_dir_all(repo_root.join("lib")).await.unwrap();
        tokio::fs::write(repo_root.join("lib/util.py"), "a\nb\n").await.unwrap();

        let xml_path = repo_root.join("CoverageResults.xml");
        tokio::fs::write(&xml_path, SAMPLE).await.unwrap();

        let report = parse_coverage_report(
            &xml_path,
            repo_root,
            "abc123",
            "myrepo",
            &[],
            None,
            "ci-dispatcher",
        )
        .await
        .unwrap();

        assert_eq!(report.source_files.len(), 1);
        assert_eq!(report.source_files[0].name, "lib/util.py");
        assert_eq!(report.source_files[0].coverage.len(), 3);
        assert_eq!(report.source_files[0].coverage[1], Some(1));
        assert_eq!(report.source_files[0].coverage[2], Some(0));
        assert_eq!(report.percent(), 50.0);
    }
}
