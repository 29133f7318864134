// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Drives the ordered build routine for a job, captures interleaved output
//! to a per-commit log, classifies failures, and updates the record store.
//!
//! Both stdout and stderr are piped live into the commit log as each script
//! runs, rather than buffered until exit, and a per-script timer (not a
//! post-hoc timeout check) drives the stall classification.

use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
};

use crate::{
    config::Config,
    coverage,
    queue::{BoundChild, Job, JobProcessor, Queue},
    reasoner::CoverageReasoner,
    record::{Record, RecordStore, Status},
    util::truncate,
};

pub struct RoutineExecutor {
    pub config: Arc<Config>,
    pub records: Arc<RecordStore>,
    pub reasoner: Arc<CoverageReasoner>,
    queue: tokio::sync::OnceCell<Arc<Queue>>,
}

impl RoutineExecutor {
    pub fn new(config: Arc<Config>, records: Arc<RecordStore>, reasoner: Arc<CoverageReasoner>) -> Self {
        Self {
            config,
            records,
            reasoner,
            queue: tokio::sync::OnceCell::new(),
        }
    }

    /// Wired in after the Queue is constructed (the two are mutually
    /// referential: the queue drives the executor, the executor needs to
    /// see sibling jobs on the pile).
    pub fn attach_queue(&self, queue: Arc<Queue>) {
        let _ = self.queue.set(queue);
    }

    fn queue(&self) -> &Arc<Queue> {
        self.queue.get().expect("executor used before attach_queue")
    }

    /// Marks sibling same-SHA jobs as non-forcing, then either reuses an
    /// existing record or runs the routine for real.
    async fn short_circuit(&self, job: &Job) -> Result<bool> {
        let sha = job.data.lock().await.sha.clone();

        for sibling in self.queue().jobs_for_sha(&sha).await {
            if sibling.id == job.id {
                continue;
            }
            sibling.data.lock().await.force = false;
        }

        let force = job.data.lock().await.force;
        if !force {
            return self.update_job_from_record(job).await;
        }

        Ok(false)
    }

    /// Copies a matching record's outcome onto `job.data`. Returns `true`
    /// if a record was found (in which case the caller should finish the
    /// job without running anything).
    async fn update_job_from_record(&self, job: &Job) -> Result<bool> {
        let sha = job.data.lock().await.sha.clone();
        let Some(record) = self.records.load_one(&sha).await? else {
            return Ok(false);
        };

        let mut data = job.data.lock().await;
        data.status = Some(record.status.as_str().to_string());

        let mut description = record.description.clone();
        if let Ok(elapsed) = job.created.elapsed() {
            let minutes = elapsed.as_secs() / 60;
            description = truncate(
                &format!("{} (took {} min)", description, minutes),
                self.config.max_description_len,
            );
        }
        data.description = Some(description);

        let mut coverage = record.coverage;
        if coverage.is_none() {
            let context = data.context.clone();
            let repo = data.repo.clone();
            drop(data);

            let xml_path = coverage::expected_report_path(&self.config.data_path, &sha);
            if ci_core::fs::exists(&xml_path).await.unwrap_or(false) {
                if let Ok(report) = coverage::parse_coverage_report(
                    &xml_path,
                    self.config.checkout_path(&repo),
                    &sha,
                    &repo,
                    &[],
                    None,
                    "ci-dispatcher",
                )
                .await
                {
                    coverage = Some(report.percent());
                }
            }

            let mut data = job.data.lock().await;
            data.coverage = coverage;

            if context.starts_with("coverage") {
                drop(data);
                self.reasoner.compare_coverage(job).await?;
            }
        } else {
            job.data.lock().await.coverage = coverage;
        }

        Ok(true)
    }

    /// Runs each configured script in order, piping output into the
    /// per-commit log, until one fails or the routine completes and a
    /// record shows up.
    async fn build_routine(&self, job: &Job) -> Result<()> {
        let (sha, repo, context) = {
            let data = job.data.lock().await;
            (data.sha.clone(), data.repo.clone(), data.context.clone())
        };

        let scripts = self.config.select_routine(&context);
        job.data.lock().await.routine = scripts.iter().map(|p| p.display().to_string()).collect();

        let reports_dir = self.config.data_path.join("reports").join(&sha);
        tokio::fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("unable to create reports dir: {}", reports_dir.display()))?;

        let log_path = reports_dir.join(format!("std_output-{}.log", &sha[..sha.len().min(7)]));
        let mut log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .with_context(|| format!("unable to open log file: {}", log_path.display()))?;

        let checkout = self.config.checkout_path(&repo);

        for script in &scripts {
            let result = self
                .run_script(job, script, &sha, &checkout, &mut log_file)
                .await;

            match result {
                Ok(ScriptOutcome::Success) => continue,
                Ok(ScriptOutcome::Failed { stderr }) => {
                    let description = classify_failure(&stderr, self.config.max_description_len);
                    self.save_failure(&sha, &repo, Status::Error, &description)
                        .await?;
                    anyhow::bail!(description);
                }
                Err(err) => return Err(err),
            }
        }

        job.clear_child().await;

        if self.update_job_from_record(job).await? {
            Ok(())
        } else {
            Err(anyhow!("test result not found"))
        }
    }

    async fn save_failure(&self, sha: &str, repo: &str, status: Status, description: &str) -> Result<()> {
        self.records
            .save(&[Record {
                commit: sha.to_string(),
                status,
                description: description.to_string(),
                coverage: None,
                statistics: None,
                results: None,
                branch: None,
            }])
            .await
            .with_context(|| format!("unable to save failure record for {} ({})", sha, repo))
    }

    async fn run_script(
        &self,
        job: &Job,
        script: &Path,
        sha: &str,
        checkout: &Path,
        log_file: &mut tokio::fs::File,
    ) -> Result<ScriptOutcome> {
        let mut cmd = Command::new(script);
        cmd.arg(sha)
            .arg(checkout)
            .arg(&self.config.data_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                anyhow!("File \"{}\" not found", script.display())
            } else {
                anyhow!("Failed to spawn: {}", err)
            }
        })?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        let handle = Arc::new(tokio::sync::Mutex::new(child));
        job.bind_child(Box::new(TokioChild {
            handle: Arc::clone(&handle),
        }))
        .await?;

        let stderr_buf = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let log_for_stdout = log_tee(&mut stdout, None);
        let log_for_stderr = log_tee(&mut stderr, Some(Arc::clone(&stderr_buf)));

        let wait = async {
            let (stdout_data, stderr_data, status) =
                tokio::join!(log_for_stdout, log_for_stderr, async {
                    handle.lock().await.wait().await
                });
            (stdout_data, stderr_data, status)
        };

        let outcome = tokio::time::timeout(self.config.timeout, wait).await;

        match outcome {
            Ok((stdout_data, stderr_data, status)) => {
                log_file.write_all(&stdout_data?).await?;
                log_file.write_all(&stderr_data?).await?;
                log_file.flush().await?;

                let status = status?;
                if status.success() {
                    Ok(ScriptOutcome::Success)
                } else {
                    let stderr_text = String::from_utf8_lossy(&stderr_buf.lock().await).into_owned();
                    Ok(ScriptOutcome::Failed { stderr: stderr_text })
                }
            }
            Err(_) => {
                let minutes = (self.config.timeout.as_millis() / 60_000).max(1);
                let description = format!("Tests stalled after ~{} min", minutes);
                log::warn!("Max test time exceeded for {}", sha);

                job.kill_child().await?;
                self.save_failure(sha, "", Status::Error, &description).await?;

                anyhow::bail!("Job stalled")
            }
        }
    }
}

enum ScriptOutcome {
    Success,
    Failed { stderr: String },
}

/// Reads `stream` to completion, writing each chunk into `mirror` (used to
/// also retain stderr for classification) as it arrives, and returns the
/// full captured bytes for appending to the commit log.
async fn log_tee(
    stream: &mut (impl tokio::io::AsyncRead + Unpin),
    mirror: Option<Arc<tokio::sync::Mutex<Vec<u8>>>>,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(mirror) = &mirror {
            mirror.lock().await.extend_from_slice(&chunk[..n]);
        }
    }

    Ok(buf)
}

/// Binds a job to its running script so a stall or a supersede can kill it.
/// Holds the `Child` behind a lock shared with the waiter; `kill` just asks
/// tokio to signal it.
struct TokioChild {
    handle: Arc<tokio::sync::Mutex<tokio::process::Child>>,
}

#[async_trait]
impl BoundChild for TokioChild {
    async fn kill(&mut self) -> Result<()> {
        self.handle.lock().await.start_kill()?;
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for RoutineExecutor {
    async fn process(&self, job: Job) -> Result<()> {
        if self.short_circuit(&job).await? {
            return Ok(());
        }

        self.build_routine(&job).await
    }
}

fn classify_failure(stderr: &str, max_len: usize) -> String {
    static FLAKE8: once_cell_regex::Lazy<Regex> = once_cell_regex::Lazy::new(|| {
        Regex::new(r"^[A-Za-z/\\._]+:\d+:\d+: [EWF]\d{3} .*$").unwrap()
    });

    let flake8_lines: Vec<&str> = stderr.lines().filter(|line| FLAKE8.is_match(line)).collect();
    if !flake8_lines.is_empty() {
        return truncate(&format!("{} flake8 errors", flake8_lines.len()), max_len);
    }

    static ERROR_WORD: once_cell_regex::Lazy<Regex> =
        once_cell_regex::Lazy::new(|| Regex::new(r"Error:|^\w*Error").unwrap());
    let error_lines: Vec<&str> = stderr.lines().filter(|line| ERROR_WORD.is_match(line)).collect();
    if !error_lines.is_empty() {
        return truncate(&error_lines.join(";"), max_len);
    }

    let tail: Vec<&str> = stderr.lines().collect();
    let from_last_nonblank = tail
        .iter()
        .rposition(|line| line.chars().next().map(|c| !c.is_whitespace()).unwrap_or(false))
        .map(|idx| tail[idx..].join(";"))
        .unwrap_or_default();

    truncate(&from_last_nonblank, max_len)
}

mod once_cell_regex {
    use std::sync::OnceLock;

    /// Minimal lazily-initialized cell, matching `ci-core`'s habit of
    /// reaching for `std::sync::OnceLock` rather than pulling in
    /// `once_cell` for a single static regex.
    pub struct Lazy<T> {
        cell: OnceLock<T>,
        init: fn() -> T,
    }

    impl<T> Lazy<T> {
        pub const fn new(init: fn() -> T) -> Self {
            Self {
                cell: OnceLock::new(),
                init,
            }
        }
    }

    impl<T> std::ops::Deref for Lazy<T> {
        type Target = T;

        fn deref(&self) -> &T {
            self.cell.get_or_init(self.init)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flake8_lines_are_counted() {
        let stderr = "a.py:1:1: E501 line too long\nb.py:2:2: W605 invalid escape\nnot flake8\n";
        assert_eq!(classify_failure(stderr, 140), "2 flake8 errors");
    }

    #[test]
    fn error_keyword_lines_are_joined() {
        let stderr = "Building...\nError: something broke\nTraceback (most recent call last)\n";
        let result = classify_failure(stderr, 140);
        assert!(result.contains("Error: something broke"));
    }

    #[test]
    fn falls_back_to_last_nonblank_line_block() {
        let stderr = "line one\nline two\n   \n";
        let result = classify_failure(stderr, 140);
        assert_eq!(result, "line two;   ");
    }

    #[test]
    fn descriptions_are_truncated() {
        let long_stderr = format!("Error: {}", "x".repeat(200));
        let result = classify_failure(&long_stderr, 20);
        assert_eq!(result.chars().count(), 20);
    }
}
