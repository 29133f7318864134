// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Webhook signature verification and envelope parsing.
//!
//! GitHub signs the raw request body twice: a legacy `X-Hub-Signature`
//! (HMAC-SHA1) and the current `X-Hub-Signature-256` (HMAC-SHA256). Either
//! matching is accepted.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use sha2::Sha256;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Verifies `signature` (the full header value, e.g. `"sha256=<hex>"`)
/// against `body` using `secret`. Accepts either the `sha1=` or `sha256=`
/// prefix; rejects anything else.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some((algo, hex_digest)) = signature.split_once('=') else {
        return false;
    };

    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    match algo {
        "sha256" => {
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        }
        "sha1" => {
            let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        }
        _ => false,
    }
}

#[derive(Debug, Deserialize)]
pub struct RepoRef {
    pub id: u64,
    pub name: String,
    pub owner: OwnerRef,
}

#[derive(Debug, Deserialize)]
pub struct OwnerRef {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct HeadCommit {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct PushPayload {
    pub r#ref: String,
    pub before: String,
    pub after: Option<String>,
    pub head_commit: Option<HeadCommit>,
    pub repository: RepoRef,
    pub installation: Option<Installation>,
}

#[derive(Debug, Deserialize)]
pub struct PrEndpoint {
    pub sha: String,
    pub r#ref: String,
    pub repo: RepoRef,
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub head: PrEndpoint,
    pub base: PrEndpoint,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestPayload {
    pub action: String,
    pub number: u64,
    pub pull_request: PullRequest,
    pub installation: Option<Installation>,
}

/// One decoded webhook delivery: an event-type tag plus the still-typed
/// payload, carrying enough to extract `(ref, head_sha, base_sha, repo)`.
#[derive(Debug)]
pub enum WebhookEvent {
    Push(PushPayload),
    PullRequest(PullRequestPayload),
}

impl WebhookEvent {
    pub fn installation_id(&self) -> Option<u64> {
        match self {
            WebhookEvent::Push(p) => p.installation.as_ref().map(|i| i.id),
            WebhookEvent::PullRequest(p) => p.installation.as_ref().map(|i| i.id),
        }
    }
}

/// Parses a webhook body given the `X-GitHub-Event` header value. Only
/// `push` and `pull_request` are recognized; anything else is rejected by
/// the caller before this is invoked.
pub fn parse_event(event_type: &str, body: &[u8]) -> anyhow::Result<WebhookEvent> {
    match event_type {
        "push" => Ok(WebhookEvent::Push(serde_json::from_slice(body)?)),
        "pull_request" => Ok(WebhookEvent::PullRequest(serde_json::from_slice(body)?)),
        other => anyhow::bail!("unsupported event type: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={:x}", mac.finalize().into_bytes())
    }

    #[test]
    fn matching_sha256_signature_verifies() {
        let body = b"{\"ref\":\"refs/heads/main\"}";
        let signature = sign("s3cr3t", body);
        assert!(verify_signature("s3cr3t", body, &signature));
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"{\"ref\":\"refs/heads/main\"}";
        let signature = sign("s3cr3t", body);
        assert!(!verify_signature("other", body, &signature));
    }

    #[test]
    fn malformed_signature_fails() {
        assert!(!verify_signature("s3cr3t", b"body", "deadbeef"));
    }

    #[test]
    fn push_payload_parses() {
        let body = br#"{
            "ref": "refs/heads/main",
            "before": "aaaa",
            "after": "bbbb",
            "head_commit": {"id": "bbbb"},
            "repository": {"id": 1, "name": "repo", "owner": {"login": "owner"}},
            "installation": {"id": 42}
        }"#;
        let event = parse_event("push", body).unwrap();
        assert_eq!(event.installation_id(), Some(42));
    }
}
