// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GitHub App authentication and the four REST endpoints the dispatcher
//! needs (installation lookup, access token mint, status POST,
//! commit/branch GET).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use reqwest_retry::SendRetry;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const MACHINE_MAN_ACCEPT: &str = "application/vnd.github.machine-man-preview+json";
const JWT_TTL: Duration = Duration::from_secs(9 * 60);

#[derive(Debug, Clone, Serialize)]
struct Claims {
    iat: u64,
    exp: u64,
    iss: String,
}

/// Holds the cached installation token so the client carries no
/// module-level mutable state.
#[derive(Default)]
pub struct TokenCache {
    cached: RwLock<Option<CachedToken>>,
    installation_id: RwLock<Option<u64>>,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

impl TokenCache {
    async fn valid(&self) -> Option<String> {
        let guard = self.cached.read().await;
        guard.as_ref().and_then(|cached| {
            if cached.expires_at > SystemTime::now() {
                Some(cached.token.clone())
            } else {
                None
            }
        })
    }

    async fn store(&self, token: String, expires_at: SystemTime) {
        *self.cached.write().await = Some(CachedToken { token, expires_at });
    }

    async fn installation_id(&self) -> Option<u64> {
        *self.installation_id.read().await
    }

    async fn set_installation_id(&self, id: u64) {
        *self.installation_id.write().await = Some(id);
    }
}

pub struct ForgeClient {
    app_id: String,
    private_key: EncodingKey,
    client: Client,
    base_url: String,
    owner: String,
    repo: String,
    webhook_proxy_url: String,
    tokens: TokenCache,
}

impl ForgeClient {
    pub fn new(
        app_id: String,
        private_key_pem: &[u8],
        owner: String,
        repo: String,
        webhook_proxy_url: String,
    ) -> Result<Self> {
        let private_key =
            EncodingKey::from_rsa_pem(private_key_pem).context("invalid GitHub App private key")?;

        Ok(Self {
            app_id,
            private_key,
            client: Client::new(),
            base_url: "https://api.github.com".to_string(),
            owner,
            repo,
            webhook_proxy_url,
            tokens: TokenCache::default(),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// Mints a short-lived RS256 JWT identifying the app.
    fn signed_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before epoch")?
            .as_secs();

        let claims = Claims {
            iat: now.saturating_sub(60),
            exp: now + JWT_TTL.as_secs(),
            iss: self.app_id.clone(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.private_key)
            .context("failed to sign app JWT")
    }

    /// Returns a live installation access token, minting one if the cache
    /// is empty or expired.
    pub async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.tokens.valid().await {
            return Ok(token);
        }

        let jwt = self.signed_jwt()?;

        let installation_id = match self.tokens.installation_id().await {
            Some(id) => id,
            None => {
                let url = format!(
                    "{}/repos/{}/{}/installation",
                    self.base_url, self.owner, self.repo
                );
                let response = self
                    .client
                    .get(&url)
                    .bearer_auth(&jwt)
                    .header("Accept", MACHINE_MAN_ACCEPT)
                    .send_retry_default()
                    .await
                    .context("fetching installation id")?;

                #[derive(Deserialize)]
                struct InstallationResponse {
                    id: u64,
                }
                let body: InstallationResponse = response.json().await?;
                self.tokens.set_installation_id(body.id).await;
                body.id
            }
        };

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.base_url, installation_id
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&jwt)
            .header("Accept", MACHINE_MAN_ACCEPT)
            .send_retry_default()
            .await
            .context("minting installation access token")?;

        #[derive(Deserialize)]
        struct AccessTokenResponse {
            token: String,
            expires_at: String,
        }
        let body: AccessTokenResponse = response.json().await?;
        let expires_at = chrono::DateTime::parse_from_rfc3339(&body.expires_at)
            .context("parsing access token expiry")?
            .into();

        self.tokens.store(body.token.clone(), expires_at).await;
        Ok(body.token)
    }

    /// Posts a commit status. `state` must be one of the four recognized
    /// values.
    pub async fn update_status(
        &self,
        sha: &str,
        state: &str,
        description: &str,
        context: &str,
        target_url: Option<&str>,
        max_description_len: usize,
    ) -> Result<()> {
        if !["pending", "error", "success", "failure"].contains(&state) {
            bail!("invalid status state: {state}");
        }
        if sha.is_empty() {
            bail!("update_status requires a sha");
        }

        let target_url = target_url.map(str::to_string).unwrap_or_else(|| {
            format!("{}/logs/{}?module={}", self.webhook_proxy_url, sha, self.repo)
        });

        let token = self.access_token().await?;
        let url = format!(
            "{}/repos/{}/{}/statuses/{}",
            self.base_url, self.owner, self.repo, sha
        );

        #[derive(Serialize)]
        struct Body<'a> {
            state: &'a str,
            target_url: &'a str,
            description: &'a str,
            context: &'a str,
        }

        self.client
            .post(&url)
            .header("Authorization", format!("token {token}"))
            .header("Accept", MACHINE_MAN_ACCEPT)
            .json(&Body {
                state,
                target_url: &target_url,
                description: &crate::util::truncate(description, max_description_len),
                context,
            })
            .send_retry_default()
            .await
            .context("posting status")?;

        Ok(())
    }

    /// Resolves a branch name or a SHA/prefix to its full 40-character
    /// commit SHA.
    pub async fn fetch_commit(&self, id_or_branch: &str, is_branch: bool, repo: Option<&str>) -> Result<String> {
        let repo = repo.unwrap_or(&self.repo);
        let token = self.access_token().await?;

        let url = if is_branch {
            format!(
                "{}/repos/{}/{}/branches/{}",
                self.base_url, self.owner, repo, id_or_branch
            )
        } else {
            format!(
                "{}/repos/{}/{}/commits/{}",
                self.base_url, self.owner, repo, id_or_branch
            )
        };

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("token {token}"))
            .header("Accept", MACHINE_MAN_ACCEPT)
            .send_retry_default()
            .await
            .context("fetching commit")?;

        if is_branch {
            #[derive(Deserialize)]
            struct BranchResponse {
                commit: CommitRef,
            }
            #[derive(Deserialize)]
            struct CommitRef {
                sha: String,
            }
            Ok(response.json::<BranchResponse>().await?.commit.sha)
        } else {
            #[derive(Deserialize)]
            struct CommitResponse {
                sha: String,
            }
            Ok(response.json::<CommitResponse>().await?.sha)
        }
    }

    /// Lists the filenames changed by a PR or a push compare range, used
    /// by the Event Dispatcher's `files_ignore` filter.
    pub async fn changed_files(&self, pr_number: Option<u64>, before: &str, after: &str) -> Result<Vec<String>> {
        let token = self.access_token().await?;

        let url = match pr_number {
            Some(n) => format!("{}/repos/{}/{}/pulls/{}/files", self.base_url, self.owner, self.repo, n),
            None => format!(
                "{}/repos/{}/{}/compare/{}...{}",
                self.base_url, self.owner, self.repo, before, after
            ),
        };

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("token {token}"))
            .header("Accept", MACHINE_MAN_ACCEPT)
            .send_retry_default()
            .await
            .context("fetching changed files")?;

        #[derive(Deserialize)]
        struct FileEntry {
            filename: String,
        }

        if pr_number.is_some() {
            let files: Vec<FileEntry> = response.json().await?;
            Ok(files.into_iter().map(|f| f.filename).collect())
        } else {
            #[derive(Deserialize)]
            struct CompareResponse {
                #[serde(default)]
                files: Vec<FileEntry>,
            }
            Ok(response.json::<CompareResponse>().await?.files.into_iter().map(|f| f.filename).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // 2048-bit RSA key generated solely for these tests; not used anywhere
    // outside this module.
    const TEST_KEY_PEM: &str = include_str!("../testdata/test_app_key.pem");

    fn client(base_url: String) -> ForgeClient {
        ForgeClient::new(
            "app-1".to_string(),
            TEST_KEY_PEM.as_bytes(),
            "owner".to_string(),
            "repo".to_string(),
            "https://proxy.example.com".to_string(),
        )
        .unwrap()
        .with_base_url(base_url)
    }

    #[tokio::test]
    async fn cache_rejects_expired_tokens() {
        let cache = TokenCache::default();
        cache
            .store("tok".to_string(), SystemTime::now() - Duration::from_secs(10))
            .await;
        assert!(cache.valid().await.is_none());
    }

    #[tokio::test]
    async fn cache_returns_live_tokens() {
        let cache = TokenCache::default();
        cache
            .store("tok".to_string(), SystemTime::now() + Duration::from_secs(600))
            .await;
        assert_eq!(cache.valid().await, Some("tok".to_string()));
    }

    #[tokio::test]
    async fn update_status_rejects_unknown_state() {
        let forge = client("https://unused.invalid".to_string());
        let err = forge
            .update_status("a".repeat(40).as_str(), "unknown", "d", "ctx", None, 140)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid status state"));
    }

    #[tokio::test]
    async fn access_token_mints_and_caches_installation_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/owner/repo/installation"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": 42 })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/app/installations/42/access_tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "token": "v1.abc",
                "expires_at": "2999-01-01T00:00:00Z",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let forge = client(server.uri());

        let token = forge.access_token().await.unwrap();
        assert_eq!(token, "v1.abc");

        // Second call should hit the cache, not the mock server again (the
        // `.expect(1)` on each mock is verified when `server` drops).
        let token_again = forge.access_token().await.unwrap();
        assert_eq!(token_again, "v1.abc");
    }

    #[tokio::test]
    async fn update_status_posts_truncated_description() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/owner/repo/installation"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": 7 })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/app/installations/7/access_tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "token": "v1.xyz",
                "expires_at": "2999-01-01T00:00:00Z",
            })))
            .mount(&server)
            .await;

        let sha = "c".repeat(40);
        Mock::given(method("POST"))
            .and(path(format!("/repos/owner/repo/statuses/{sha}").as_str()))
            .and(header("authorization", "token v1.xyz"))
            .and(body_json(serde_json::json!({
                "state": "success",
                "target_url": format!("https://proxy.example.com/logs/{sha}?module=repo"),
                "description": "short enough",
                "context": "ci",
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let forge = client(server.uri());
        forge
            .update_status(&sha, "success", "short enough", "ci", None, 140)
            .await
            .unwrap();
    }
}
