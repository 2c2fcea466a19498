// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use apm_collector::{CollectorConfig, CollectorReceiver, CollectorServer, MemoryStore};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("APM_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
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

    if let Err(e) = run().await {
        error!("Collector shutting down: {e:#}");
    }
}

async fn run() -> anyhow::Result<()> {
    let config = CollectorConfig::new().context("error creating collector config")?;
    debug!("Collector config: {:?}", config);

    // Rows are kept in memory until a wide-column store client is wired in behind the store traits.
    let store = Arc::new(MemoryStore::new());
    let receiver = Arc::new(
        CollectorReceiver::new(&config, store.clone(), store.clone(), store)
            .context("error creating row key encoders")?,
    );

    let cancel_token = CancellationToken::new();
    let server = CollectorServer::bind(&config, receiver, cancel_token.clone())
        .await
        .context("error binding collector listeners")?;
    let serving = tokio::spawn(server.spin());

    tokio::signal::ctrl_c()
        .await
        .context("error waiting for shutdown signal")?;
    info!("Shutdown signal received");
    cancel_token.cancel();
    serving.await.context("collector task failed")?;
    Ok(())
}
