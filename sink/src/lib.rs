//! mailsink - SMTP capture sink
//!
//! Accepts SMTP-delivered mail and records every copy, one per recipient, in
//! a document collection, optionally mirrored in memory for quick inspection.
//!
//! ## Module Organization
//!
//! - `types/`: Error type, received mail handle, persisted document
//! - `config/`: Configuration file model and loading
//! - `adapters/`: Document store boundary and its SQLite backend
//! - `services/`: Record mapper and the ordered message ledger
//! - `smtp/`: SMTP session state machine and listener
//! - `admin/`: Loopback HTTP routes over the ledger

pub mod adapters;
pub mod admin;
pub mod config;
pub mod services;
pub mod smtp;
pub mod types;

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub use config::SinkConfig;
pub use services::Ledger;
pub use smtp::SmtpServer;
pub use types::{MessageDocument, ReceivedMail, Result, SinkError};

/// Open the store, build the ledger and serve SMTP (and the admin routes
/// when enabled) until `shutdown` resolves.
pub async fn run_until<F>(config: SinkConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    config.validate()?;
    info!(
        "Starting mailsink (store: {}, mirroring: {}, port: {})",
        config.store.descriptor(),
        config.mirroring_enabled,
        config.listen_port
    );

    let ledger = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Ledger::from_config(&config))
            .await
            .map_err(|e| SinkError::StoreUnavailable(e.to_string()))??
    };
    let ledger = Arc::new(ledger);

    let smtp_listener = SmtpServer::bind(config.listen_port).await?;
    let admin_listener = if config.admin.enabled {
        Some(admin::bind(config.admin.port).await?)
    } else {
        None
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let signal = async move {
        shutdown.await;
        let _ = stop_tx.send(true);
        Ok::<(), SinkError>(())
    };
    let smtp = Arc::new(SmtpServer::new(ledger.clone(), config.hostname.clone()))
        .serve(smtp_listener, stopped(stop_rx.clone()));
    let admin = async move {
        match admin_listener {
            Some(listener) => admin::serve(listener, ledger, stopped(stop_rx)).await,
            None => Ok(()),
        }
    };

    tokio::try_join!(signal, smtp, admin)?;
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Serve until Ctrl-C.
pub async fn run(config: SinkConfig) -> Result<()> {
    run_until(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}
