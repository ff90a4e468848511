//! Telegram channel relay: resolves the configured channels, consumes Bot API
//! updates (long polling or webhook), and forwards channel posts to the
//! outbound queue.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use relay_bus::{DeliveryPublisher, JetStreamQueue};
use relay_core::{ChannelRegistry, UpdateFilter};
use tokio::{signal, sync::watch};
use tracing::{info, warn};

pub mod config;
pub mod coordinator;
pub mod source;
pub mod telegram_api;

pub use config::{IngressMode, RelayConfig, TelegramSettings, load_config};
pub use coordinator::{Coordinator, CoordinatorState, RunSummary, StopCause};
pub use source::{BatchSender, StreamError, UpdateSource, UpdateStream, update_channel};

use crate::{
    source::{spawn_polling, spawn_webhook},
    telegram_api::{ALLOWED_UPDATES, HttpTelegramApi, TelegramApi, TelegramDirectory},
};

const WEBHOOK_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Runs the relay until Ctrl-C / SIGTERM or until the update stream goes away.
pub async fn run(config: &RelayConfig) -> Result<RunSummary> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("stop signal received");
        let _ = shutdown_tx.send(true);
    });
    run_with_shutdown(config, shutdown_rx).await
}

/// Same as [`run`], with the stop signal supplied by the caller.
pub async fn run_with_shutdown(
    config: &RelayConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<RunSummary> {
    let settings = &config.telegram;
    let api: Arc<dyn TelegramApi> = Arc::new(HttpTelegramApi::new(
        reqwest::Client::new(),
        Some(settings.api_base.clone()),
        settings.bot_token.clone(),
    ));

    let directory = TelegramDirectory::new(api.clone());
    let registry = ChannelRegistry::load(&directory, &config.channels).await;
    let filter = UpdateFilter::new(registry.into_tracked());

    let publisher = match &config.queue {
        Some(queue) => {
            let client = JetStreamQueue::connect(queue)
                .await
                .context("connect outbound queue")?;
            DeliveryPublisher::new(
                Arc::new(client),
                queue.subject.clone(),
                queue.group_key.clone(),
            )
        }
        None => {
            info!("no queue configured; delivery disabled");
            DeliveryPublisher::disabled()
        }
    };

    let UpdateSource {
        updates,
        mut worker,
    } = match settings.mode {
        IngressMode::Polling => {
            api.delete_webhook(false)
                .await
                .context("clear telegram webhook before polling")?;
            info!(
                timeout_secs = settings.poll_timeout_secs,
                "telegram long polling"
            );
            spawn_polling(api.clone(), settings.poll_timeout_secs)
        }
        IngressMode::Webhook => {
            let source =
                spawn_webhook(settings.bind, settings.secret_token.clone(), shutdown.clone())
                    .await?;
            if let Some(url) = settings.public_webhook_url.as_deref() {
                api.set_webhook(url, settings.secret_token.as_deref(), &ALLOWED_UPDATES)
                    .await
                    .context("register telegram webhook")?;
                info!(url, "telegram webhook registered");
            }
            source
        }
    };

    let mut coordinator = Coordinator::new(filter, publisher);
    let summary = coordinator.run(updates, shutdown).await;

    if settings.mode == IngressMode::Webhook
        && tokio::time::timeout(WEBHOOK_DRAIN_GRACE, &mut worker)
            .await
            .is_err()
    {
        warn!("webhook server did not stop in time");
    }
    worker.abort();

    Ok(summary)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
