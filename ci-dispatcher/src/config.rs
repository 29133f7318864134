// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Defaults, overlaid by an optional settings file, overlaid again by a
//! fixed test profile when `NODE_ENV` starts with `test`. A fixed list of
//! environment variables must all be present before the process can start.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;

const REQUIRED_ENV_VARS: &[&str] = &[
    "GITHUB_PRIVATE_KEY",
    "GITHUB_APP_IDENTIFIER",
    "GITHUB_WEBHOOK_SECRET",
    "WEBHOOK_PROXY_URL",
    "REPO_PATH",
    "REPO_NAME",
    "REPO_OWNER",
    "TUNNEL_HOST",
    "TUNNEL_SUBDOMAIN",
];

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub ref_ignore: Vec<String>,
    #[serde(default)]
    pub files_ignore: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Env {
    pub github_private_key_path: PathBuf,
    pub github_app_identifier: String,
    pub github_webhook_secret: String,
    pub webhook_proxy_url: String,
    pub repo_path: PathBuf,
    pub repo_name: String,
    pub repo_owner: String,
    pub tunnel_host: String,
    pub tunnel_subdomain: String,
    pub coveralls_token: Option<String>,
    pub userdomain: String,
    pub node_env: Option<String>,
}

/// Optional fields a settings file or test profile may override. Every
/// field defaults to leaving the base `Config` value untouched.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Overlay {
    pub listen_port: Option<u16>,
    pub timeout_ms: Option<u64>,
    pub max_description_len: Option<usize>,
    pub strict_coverage: Option<bool>,
    pub data_path: Option<PathBuf>,
    pub db_file: Option<PathBuf>,
    #[serde(default)]
    pub events: HashMap<String, EventConfig>,
    #[serde(default)]
    pub routines: HashMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub repos: HashMap<String, PathBuf>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub env: Env,
    pub listen_port: u16,
    pub timeout: Duration,
    pub max_description_len: usize,
    pub strict_coverage: bool,
    pub data_path: PathBuf,
    pub db_file: PathBuf,
    pub events: HashMap<String, EventConfig>,
    pub routines: HashMap<String, Vec<PathBuf>>,
    pub repos: HashMap<String, PathBuf>,
}

impl Config {
    fn defaults(env: Env) -> Self {
        Self {
            env,
            listen_port: 5000,
            timeout: Duration::from_millis(8 * 60 * 1000),
            max_description_len: 140,
            strict_coverage: false,
            data_path: PathBuf::from("./data"),
            db_file: PathBuf::from("./data/db.json"),
            events: HashMap::new(),
            routines: HashMap::new(),
            repos: HashMap::new(),
        }
    }

    fn apply(&mut self, overlay: Overlay) {
        if let Some(v) = overlay.listen_port {
            self.listen_port = v;
        }
        if let Some(v) = overlay.timeout_ms {
            self.timeout = Duration::from_millis(v);
        }
        if let Some(v) = overlay.max_description_len {
            self.max_description_len = v;
        }
        if let Some(v) = overlay.strict_coverage {
            self.strict_coverage = v;
        }
        if let Some(v) = overlay.data_path {
            self.data_path = v;
        }
        if let Some(v) = overlay.db_file {
            self.db_file = v;
        }
        for (k, v) in overlay.events {
            self.events.insert(k, v);
        }
        for (k, v) in overlay.routines {
            self.routines.insert(k, v);
        }
        for (k, v) in overlay.repos {
            self.repos.insert(k, v);
        }
    }

    /// Loads required environment variables, a user overlay file (path
    /// given by `CONFIG_FILE`, if set), and -- when `NODE_ENV` starts with
    /// `test` -- a fixed test profile, in that order.
    pub fn from_env() -> Result<Self> {
        validate_env()?;

        let env = Env {
            github_private_key_path: PathBuf::from(must_env("GITHUB_PRIVATE_KEY")),
            github_app_identifier: must_env("GITHUB_APP_IDENTIFIER"),
            github_webhook_secret: must_env("GITHUB_WEBHOOK_SECRET"),
            webhook_proxy_url: must_env("WEBHOOK_PROXY_URL"),
            repo_path: PathBuf::from(must_env("REPO_PATH")),
            repo_name: must_env("REPO_NAME"),
            repo_owner: must_env("REPO_OWNER"),
            tunnel_host: must_env("TUNNEL_HOST"),
            tunnel_subdomain: must_env("TUNNEL_SUBDOMAIN"),
            coveralls_token: std::env::var("COVERALLS_TOKEN").ok(),
            userdomain: std::env::var("USERDOMAIN").unwrap_or_else(|_| "local".to_string()),
            node_env: std::env::var("NODE_ENV").ok(),
        };

        let mut config = Self::defaults(env);

        if let Ok(path) = std::env::var("CONFIG_FILE") {
            config.apply(Self::load_overlay(path)?);
        }

        if config
            .env
            .node_env
            .as_deref()
            .is_some_and(|v| v.starts_with("test"))
        {
            config.apply(test_profile());
        }

        Ok(config)
    }

    fn load_overlay(path: impl AsRef<Path>) -> Result<Overlay> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("unable to read config file: {}", path.display()))?;
        serde_json::from_slice(&data).map_err(|err| {
            ConfigError::Invalid(format!("{}: {err}", path.display())).into()
        })
    }

    pub fn select_routine(&self, context: &str) -> Vec<PathBuf> {
        for (pattern, scripts) in &self.routines {
            if pattern == "*" {
                continue;
            }
            if let Ok(glob) = globset::Glob::new(pattern) {
                if glob.compile_matcher().is_match(context) {
                    return scripts.clone();
                }
            }
        }
        self.routines.get("*").cloned().unwrap_or_default()
    }

    pub fn checkout_path(&self, repo: &str) -> PathBuf {
        self.repos
            .get(repo)
            .cloned()
            .unwrap_or_else(|| self.env.repo_path.clone())
    }
}

fn must_env(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

/// Collects every missing required variable in one pass rather than
/// failing on the first, so the failure is actionable in one shot.
fn validate_env() -> Result<(), ConfigError> {
    let missing: Vec<&'static str> = REQUIRED_ENV_VARS
        .iter()
        .filter(|key| std::env::var(key).is_err())
        .copied()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::MissingEnv(missing))
    }
}

/// Fixed profile applied over defaults and any file overlay when
/// `NODE_ENV` starts with `test`, keeping test runs hermetic (short
/// timeout, isolated data path).
fn test_profile() -> Overlay {
    Overlay {
        timeout_ms: Some(5_000),
        data_path: Some(PathBuf::from("./test-data")),
        db_file: Some(PathBuf::from("./test-data/db.json")),
        ..Overlay::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in REQUIRED_ENV_VARS {
            std::env::remove_var(key);
        }
        std::env::remove_var("NODE_ENV");
        std::env::remove_var("CONFIG_FILE");
    }

    fn set_required_env() {
        std::env::set_var("GITHUB_PRIVATE_KEY", "/tmp/key.pem");
        std::env::set_var("GITHUB_APP_IDENTIFIER", "123");
        std::env::set_var("GITHUB_WEBHOOK_SECRET", "s3cr3t");
        std::env::set_var("WEBHOOK_PROXY_URL", "https://proxy.example.com");
        std::env::set_var("REPO_PATH", "/tmp/repo");
        std::env::set_var("REPO_NAME", "repo");
        std::env::set_var("REPO_OWNER", "owner");
        std::env::set_var("TUNNEL_HOST", "tunnel.example.com");
        std::env::set_var("TUNNEL_SUBDOMAIN", "ci-dispatcher");
    }

    #[test]
    #[serial]
    fn missing_env_vars_are_all_reported() {
        clear_env();
        std::env::set_var("GITHUB_PRIVATE_KEY", "/tmp/key.pem");

        let err = validate_env().unwrap_err();
        match err {
            ConfigError::MissingEnv(missing) => {
                assert!(missing.contains(&"GITHUB_APP_IDENTIFIER"));
                assert!(missing.contains(&"TUNNEL_SUBDOMAIN"));
                assert!(!missing.contains(&"GITHUB_PRIVATE_KEY"));
            }
            other => panic!("expected MissingEnv, got {other:?}"),
        }
        clear_env();
    }

    #[test]
    #[serial]
    fn test_node_env_applies_test_profile() {
        clear_env();
        set_required_env();
        std::env::set_var("NODE_ENV", "test");

        let config = Config::from_env().unwrap();
        assert_eq!(config.timeout, Duration::from_millis(5_000));
        assert_eq!(config.data_path, PathBuf::from("./test-data"));

        clear_env();
    }

    #[test]
    #[serial]
    fn defaults_apply_without_overlay() {
        clear_env();
        set_required_env();

        let config = Config::from_env().unwrap();
        assert_eq!(config.listen_port, 5000);
        assert_eq!(config.max_description_len, 140);
        assert!(!config.strict_coverage);

        clear_env();
    }
}
