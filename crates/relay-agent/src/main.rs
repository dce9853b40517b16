// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod api;

use std::{env, sync::Arc, time::Duration};

use telemetry_buffer::forwarder::{run_drain_worker, Forwarder};
use telemetry_buffer::ingest::IngestService;
use telemetry_buffer::monitor::{ConnectivityMonitor, DrainTrigger};
use telemetry_buffer::policy::PolicyEngine;
use telemetry_buffer::reaper::Reaper;
use telemetry_buffer::store::BufferStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 8090;
const AGENT_HOST: &str = "0.0.0.0";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("RELAY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let data_dir = env::var("RELAY_DATA_DIR").unwrap_or_else(|_| ".".to_string());
    let config_path =
        env::var("RELAY_CONFIG_PATH").unwrap_or_else(|_| format!("{data_dir}/buffer_config.json"));
    let db_path =
        env::var("RELAY_DB_PATH").unwrap_or_else(|_| format!("{data_dir}/telemetry_buffer.db"));
    let port: u16 = env::var("RELAY_PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    let policy = match PolicyEngine::load(&config_path) {
        Ok(policy) => Arc::new(policy),
        Err(e) => {
            error!("Error loading buffering policy from {config_path}: {e}");
            return;
        }
    };

    let store = match BufferStore::open(&db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("Error opening buffer store at {db_path}: {e}");
            return;
        }
    };

    let snapshot = policy.snapshot();
    info!(
        "Buffer store at {db_path}: {} bytes of {} MB cap",
        store.total_size_bytes(),
        snapshot.max_buffer_size_mb
    );

    let forwarder = match Forwarder::new(&snapshot.target, store.clone(), snapshot.drain_batch_size)
        .await
    {
        Ok(forwarder) => Arc::new(forwarder),
        Err(e) => {
            error!("Error building protocol senders: {e}");
            return;
        }
    };

    let shutdown = CancellationToken::new();
    let (drain_tx, drain_rx) = mpsc::channel::<DrainTrigger>(1);

    let monitor = ConnectivityMonitor::new(
        snapshot.target.health_url.clone(),
        Duration::from_secs(snapshot.check_interval_secs.max(1)),
        drain_tx.clone(),
    );
    let status = monitor.status_handle();
    let monitor_task = tokio::spawn(monitor.run(shutdown.clone()));
    let drain_task = tokio::spawn(run_drain_worker(
        Arc::clone(&forwarder),
        drain_rx,
        shutdown.clone(),
    ));

    let (ingest, fast_path_worker) = IngestService::new(
        Arc::clone(&policy),
        store.clone(),
        Arc::clone(&status),
        Arc::clone(&forwarder),
    );
    let fast_path_task = tokio::spawn(fast_path_worker.run(shutdown.clone()));

    // One reaper: its sweep loop runs in the background and the same handle
    // backs the on-demand cleanup endpoint.
    let reaper = Arc::new(Reaper::new(store.clone(), Arc::clone(&policy)));
    let reaper_task = tokio::spawn({
        let reaper = Arc::clone(&reaper);
        let shutdown = shutdown.clone();
        async move { reaper.run(shutdown).await }
    });

    let state = api::AppState {
        policy,
        store,
        status,
        ingest: Arc::new(ingest),
        reaper,
        drain_tx,
    };
    let router = api::make_router(state);

    let listener = match tokio::net::TcpListener::bind(format!("{AGENT_HOST}:{port}")).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Error binding API listener on port {port}: {e}");
            shutdown.cancel();
            return;
        }
    };
    info!("relay-agent API listening on {AGENT_HOST}:{port}");

    let signal_token = shutdown.clone();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received, stopping workers");
            signal_token.cancel();
        })
        .await;

    if let Err(e) = result {
        error!("API server error: {e}");
    }

    // Wait for the workers before exiting: the fast-path worker's shutdown
    // branch persists any queued records to the store, and dropping the
    // runtime would abort it mid-drain.
    shutdown.cancel();
    for task in [monitor_task, drain_task, fast_path_task, reaper_task] {
        if let Err(e) = task.await {
            error!("worker task failed during shutdown: {e}");
        }
    }
    info!("relay-agent stopped");
}

#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
