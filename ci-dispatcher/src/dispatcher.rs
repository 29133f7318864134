// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Turns a verified webhook envelope into pending status posts and queued
//! jobs.

use std::sync::Arc;

use anyhow::{bail, Result};
use regex::Regex;

use crate::{
    config::{Config, EventConfig},
    forge::ForgeClient,
    queue::{JobData, Queue},
    webhook::WebhookEvent,
};

/// The `(ref, head_sha, base_sha, repo_name)` tuple extracted from an event,
/// plus enough repository identity to reject cross-fork PRs.
struct Extracted {
    event_type: &'static str,
    r#ref: String,
    head_sha: String,
    base_sha: Option<String>,
    repo_name: String,
    action: Option<String>,
    pr_number: Option<u64>,
    pr_before: Option<String>,
}

pub struct Dispatcher {
    config: Arc<Config>,
    forge: Arc<ForgeClient>,
    queue: Arc<Queue>,
    app_id: String,
    owner: String,
    userdomain: String,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, forge: Arc<ForgeClient>, queue: Arc<Queue>) -> Self {
        let app_id = config.env.github_app_identifier.clone();
        let owner = config.env.repo_owner.clone();
        let userdomain = config.env.userdomain.clone();
        Self {
            config,
            forge,
            queue,
            app_id,
            owner,
            userdomain,
        }
    }

    /// Returns `Ok(())` on every early exit (absent event config, ignored
    /// ref/action, fully-ignored file set) as well as on success; only
    /// malformed input is an error.
    pub async fn dispatch(&self, event: WebhookEvent) -> Result<()> {
        if !installation_matches(&event, &self.app_id) {
            bail!("installation id does not match configured app");
        }

        let extracted = self.extract(event)?;

        let Some(event_config) = self.config.events.get(extracted.event_type) else {
            return Ok(());
        };

        if ref_is_ignored(&extracted.r#ref, &event_config.ref_ignore) {
            return Ok(());
        }

        if let Some(action) = &extracted.action {
            if !event_config.actions.is_empty() && !event_config.actions.contains(action) {
                return Ok(());
            }
        }

        if !event_config.files_ignore.is_empty()
            && self.all_files_ignored(&extracted, &event_config.files_ignore).await
        {
            return Ok(());
        }

        self.enqueue_checks(&extracted, event_config).await
    }

    fn extract(&self, event: WebhookEvent) -> Result<Extracted> {
        match event {
            WebhookEvent::Push(payload) => {
                let head_sha = payload
                    .head_commit
                    .map(|c| c.id)
                    .or(payload.after)
                    .unwrap_or_default();

                Ok(Extracted {
                    event_type: "push",
                    r#ref: payload.r#ref,
                    head_sha,
                    base_sha: Some(payload.before.clone()),
                    repo_name: payload.repository.name,
                    action: None,
                    pr_number: None,
                    pr_before: Some(payload.before),
                })
            }
            WebhookEvent::PullRequest(payload) => {
                let head = &payload.pull_request.head;
                let base = &payload.pull_request.base;

                if head.repo.owner.login != base.repo.owner.login
                    || head.repo.owner.login != self.owner
                    || base.repo.owner.login != self.owner
                    || head.repo.name != base.repo.name
                {
                    bail!("pull request originates from a fork, rejecting");
                }

                Ok(Extracted {
                    event_type: "pull_request",
                    r#ref: head.r#ref.clone(),
                    head_sha: head.sha.clone(),
                    base_sha: Some(base.sha.clone()),
                    repo_name: head.repo.name.clone(),
                    action: Some(payload.action.clone()),
                    pr_number: Some(payload.number),
                    pr_before: Some(base.sha.clone()),
                })
            }
        }
    }

    async fn all_files_ignored(&self, extracted: &Extracted, patterns: &[String]) -> bool {
        let matchers: Vec<Regex> = patterns
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect();

        let files = match self
            .forge
            .changed_files(
                extracted.pr_number,
                extracted.pr_before.as_deref().unwrap_or_default(),
                &extracted.head_sha,
            )
            .await
        {
            Ok(files) => files,
            Err(err) => {
                log::warn!("failed to fetch changed files, continuing: {err}");
                return false;
            }
        };

        !files.is_empty() && files.iter().all(|f| matchers.iter().any(|m| m.is_match(f)))
    }

    async fn enqueue_checks(&self, extracted: &Extracted, event_config: &EventConfig) -> Result<()> {
        for (index, check) in event_config.checks.iter().enumerate() {
            let context = format!("{check}/{}", self.userdomain);
            let description = initial_description(check);

            let mut data = JobData::new(
                self.owner.clone(),
                extracted.repo_name.clone(),
                extracted.head_sha.clone(),
            );
            data.base = extracted.base_sha.clone();
            data.context = context.clone();
            // Only the first check on this head SHA keeps the default
            // force=true; it runs the real routine and writes the record
            // that every later check on the same SHA short-circuits from.
            data.force = index == 0;
            data.status = Some("pending".to_string());
            data.description = Some(description.clone());

            self.forge
                .update_status(
                    &extracted.head_sha,
                    "pending",
                    &description,
                    &context,
                    None,
                    self.config.max_description_len,
                )
                .await?;

            self.queue.add(data).await;
        }

        Ok(())
    }
}

fn installation_matches(event: &WebhookEvent, app_id: &str) -> bool {
    match event.installation_id() {
        Some(id) => id.to_string() == app_id,
        None => false,
    }
}

fn ref_is_ignored(r#ref: &str, ref_ignore: &[String]) -> bool {
    match r#ref.rsplit('/').next() {
        Some(last) => ref_ignore.iter().any(|ignored| ignored == last),
        None => false,
    }
}

fn initial_description(check: &str) -> String {
    match check {
        "coverage" => "Checking coverage".to_string(),
        "continuous-integration" => "Tests running".to_string(),
        _ => "Check in progress".to_string(),
    }
}
