// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tokio::sync::oneshot;

mod config;
mod coverage;
mod dispatcher;
mod error;
mod executor;
mod forge;
mod http;
mod queue;
mod reasoner;
mod record;
mod tunnel;
mod util;
mod webhook;

use config::Config;
use dispatcher::Dispatcher;
use executor::RoutineExecutor;
use forge::ForgeClient;
use queue::{Queue, QueueEvent};
use reasoner::CoverageReasoner;
use record::RecordStore;
use tunnel::TunnelSupervisor;

#[derive(StructOpt, Debug)]
#[structopt(name = "ci-dispatcher")]
struct Opt {
    /// Path to a JSON overlay file; equivalent to setting CONFIG_FILE.
    #[structopt(long = "config", parse(from_os_str))]
    config_path: Option<std::path::PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();

    let opt = Opt::from_args();
    if let Some(path) = &opt.config_path {
        std::env::set_var("CONFIG_FILE", path);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run())
}

async fn run() -> Result<()> {
    let config = Arc::new(Config::from_env().context("loading configuration")?);

    tokio::fs::create_dir_all(&config.data_path)
        .await
        .with_context(|| format!("creating data directory {}", config.data_path.display()))?;

    let records = Arc::new(RecordStore::new(config.db_file.clone()));

    let private_key = tokio::fs::read(&config.env.github_private_key_path)
        .await
        .with_context(|| {
            format!(
                "reading GitHub App private key at {}",
                config.env.github_private_key_path.display()
            )
        })?;

    let forge = Arc::new(ForgeClient::new(
        config.env.github_app_identifier.clone(),
        &private_key,
        config.env.repo_owner.clone(),
        config.env.repo_name.clone(),
        config.env.webhook_proxy_url.clone(),
    )?);

    // Queue, Routine Executor, and Coverage Reasoner are mutually
    // referential: the queue drives the executor, the executor hands
    // coverage-context jobs to the reasoner, and the reasoner enqueues
    // follow-up jobs back onto the same queue. Build the two leaves first
    // and attach the queue to both once it exists.
    let reasoner = Arc::new(CoverageReasoner::new(
        Arc::clone(&records),
        config.strict_coverage,
    ));
    let executor = Arc::new(RoutineExecutor::new(
        Arc::clone(&config),
        Arc::clone(&records),
        Arc::clone(&reasoner),
    ));

    let queue = Arc::new(Queue::new(Arc::clone(&executor) as Arc<dyn queue::JobProcessor>));
    executor.attach_queue(Arc::clone(&queue));
    reasoner.attach_queue(Arc::clone(&queue));

    spawn_finish_post_status(Arc::clone(&forge), Arc::clone(&queue), Arc::clone(&config));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&config),
        Arc::clone(&forge),
        Arc::clone(&queue),
    ));

    let state = Arc::new(http::AppState {
        config: Arc::clone(&config),
        records: Arc::clone(&records),
        queue: Arc::clone(&queue),
        forge: Arc::clone(&forge),
        dispatcher,
    });
    let app = http::router(state);

    let tunnel = Arc::new(TunnelSupervisor::new(
        config.env.tunnel_host.clone(),
        config.env.tunnel_subdomain.clone(),
        config.listen_port,
    ));
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(Arc::clone(&tunnel).supervise(ready_tx));

    let info = ready_rx.await.context("tunnel supervisor dropped before first connect")?;
    log::info!("tunnel ready at {}", info.url);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("binding to port {}", config.listen_port))?;
    log::info!("listening on 0.0.0.0:{}", config.listen_port);

    axum::serve(listener, app)
        .await
        .context("http server exited")?;

    Ok(())
}

/// Subscribes to the queue's `finish` events and posts the job's terminal
/// status to the forge, unless the job asked to be skipped (the coverage
/// reasoner sets `skip_post` while it waits on a follow-up base/head pair).
fn spawn_finish_post_status(forge: Arc<ForgeClient>, queue: Arc<Queue>, config: Arc<Config>) {
    let mut events = queue.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let QueueEvent::Finish { data, .. } = event else {
                continue;
            };

            if data.skip_post {
                continue;
            }

            let Some(status) = &data.status else {
                continue;
            };

            let description = data.description.clone().unwrap_or_default();
            if let Err(err) = forge
                .update_status(
                    &data.sha,
                    status,
                    &description,
                    &data.context,
                    None,
                    config.max_description_len,
                )
                .await
            {
                log::warn!("failed to post final status for {}: {err}", data.sha);
            }
        }
    });
}
