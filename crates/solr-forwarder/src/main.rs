// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use solr_output::{config::Config, listener::EnvelopeListener, output::SolrOutput};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("SOLR_OUTPUT_LOG_LEVEL")
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

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid configuration, shutting down: {e}");
            return;
        }
    };

    let output = match SolrOutput::init(&config) {
        Ok(o) => Arc::new(o),
        Err(e) => {
            error!("Failed to start Solr output: {e}");
            return;
        }
    };

    let listener_cancel_token = CancellationToken::new();
    let listener = match EnvelopeListener::new(
        &config.listener,
        Arc::clone(&output),
        listener_cancel_token.clone(),
    )
    .await
    {
        Ok(l) => l,
        Err(e) => {
            error!("{e}");
            output.exit().await;
            return;
        }
    };
    let listener_handle = tokio::spawn(listener.spin());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {e}");
    }
    info!("Shutting down");

    // Stop accepting and drain open connections before the final flush.
    listener_cancel_token.cancel();
    if let Err(e) = listener_handle.await {
        error!("Envelope listener task failed: {e}");
    }
    output.exit().await;
}
