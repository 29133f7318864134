// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Registers a reverse tunnel with the configured host/subdomain, forwards
//! its assigned remote sockets to the local HTTP listener, and reconnects
//! forever with jittered backoff when the tunnel closes.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use ci_core::jitter::delay_with_jitter;
use reqwest_retry::SendRetry;
use serde::Deserialize;
use tokio::{net::TcpStream, sync::oneshot, task::JoinSet};

const BASE_BACKOFF: Duration = Duration::from_secs(5);

/// The tunnel server's reply to a registration request.
#[derive(Debug, Deserialize)]
struct Registration {
    id: String,
    port: u16,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default = "default_max_conn_count")]
    max_conn_count: u32,
    url: String,
}

fn default_max_conn_count() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub url: String,
}

pub struct TunnelSupervisor {
    host: String,
    subdomain: String,
    local_port: u16,
    client: reqwest::Client,
}

impl TunnelSupervisor {
    pub fn new(host: impl Into<String>, subdomain: impl Into<String>, local_port: u16) -> Self {
        Self {
            host: host.into(),
            subdomain: subdomain.into(),
            local_port,
            client: reqwest::Client::new(),
        }
    }

    /// Registers the tunnel and forwards its sockets until the remote side
    /// drops every connection, signalling the tunnel has closed.
    async fn open_once(&self) -> Result<TunnelInfo> {
        let url = format!("https://{}/{}", self.host, self.subdomain);
        let response = self
            .client
            .get(&url)
            .send_retry_default()
            .await
            .with_context(|| format!("requesting tunnel from {url}"))?;

        let registration: Registration = response
            .json()
            .await
            .context("tunnel server returned a malformed registration")?;

        let remote_host = registration.ip.clone().unwrap_or_else(|| self.host.clone());
        log::info!(
            "tunnel {} open at {} (forwarding {} connection(s) to 127.0.0.1:{})",
            registration.id,
            registration.url,
            registration.max_conn_count,
            self.local_port
        );

        let info = TunnelInfo {
            url: registration.url.clone(),
        };

        let mut forwards = JoinSet::new();
        for _ in 0..registration.max_conn_count.max(1) {
            let remote_host = remote_host.clone();
            let remote_port = registration.port;
            let local_port = self.local_port;
            forwards.spawn(async move { forward_one(&remote_host, remote_port, local_port).await });
        }

        // A tunnel is "closed" once every forwarded connection has ended;
        // log but don't abort early on a single connection's I/O error.
        while let Some(result) = forwards.join_next().await {
            if let Ok(Err(err)) = result {
                log::warn!("tunnel connection ended: {err}");
            }
        }

        Ok(info)
    }

    /// Runs forever, reconnecting on close with jittered backoff (retries
    /// are intentionally unbounded). Sends the first successful
    /// `TunnelInfo` on `ready` so the HTTP server can start only once the
    /// tunnel is actually up.
    pub async fn supervise(self: Arc<Self>, ready: oneshot::Sender<TunnelInfo>) {
        let mut ready = Some(ready);

        loop {
            match self.open_once().await {
                Ok(info) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(info);
                    }
                }
                Err(err) => {
                    log::error!("tunnel error: {err}");
                }
            }

            delay_with_jitter(BASE_BACKOFF).await;
        }
    }
}

async fn forward_one(remote_host: &str, remote_port: u16, local_port: u16) -> Result<()> {
    let mut remote = TcpStream::connect((remote_host, remote_port))
        .await
        .with_context(|| format!("connecting to tunnel socket {remote_host}:{remote_port}"))?;
    let mut local = TcpStream::connect(("127.0.0.1", local_port))
        .await
        .with_context(|| format!("connecting to local listener 127.0.0.1:{local_port}"))?;

    tokio::io::copy_bidirectional(&mut remote, &mut local)
        .await
        .context("forwarding tunnel connection")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_defaults_max_conn_count() {
        let json = r#"{"id":"abc","port":4000,"url":"https://abc.example.com"}"#;
        let registration: Registration = serde_json::from_str(json).unwrap();
        assert_eq!(registration.max_conn_count, 1);
        assert_eq!(registration.ip, None);
    }
}
