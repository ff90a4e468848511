//! Update sources: long polling and webhook delivery.
//!
//! Both hand batches to the coordinator through a bounded channel, and a
//! producer only learns a batch was delivered once the coordinator has taken it
//! off the stream. The poller advances its `getUpdates` offset and the webhook
//! answers 200 only at that point, so anything still queued when the
//! coordinator stops is redelivered by Telegram. Batches keep the order
//! Telegram delivered them in.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use futures::{StreamExt, stream::BoxStream};
use relay_core::{RawUpdate, UpdateBatch};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::telegram_api::{ALLOWED_UPDATES, TelegramApi, TelegramUpdate};

pub const WEBHOOK_PATH: &str = "/telegram/webhook";
pub const SECRET_TOKEN_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";
const WEBHOOK_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("telegram update stream failed: {0:#}")]
    Source(#[from] anyhow::Error),
}

pub type UpdateStream = BoxStream<'static, Result<UpdateBatch, StreamError>>;

/// A running source: the update stream plus the background task feeding it.
pub struct UpdateSource {
    pub updates: UpdateStream,
    pub worker: JoinHandle<()>,
}

type Handoff = (Result<UpdateBatch, StreamError>, oneshot::Sender<()>);

/// Producer half of an [`UpdateStream`].
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<Handoff>,
}

impl BatchSender {
    /// Queues `item` and waits until the consumer has taken it off the stream.
    /// Returns false when the consumer went away first.
    pub async fn deliver(&self, item: Result<UpdateBatch, StreamError>) -> bool {
        let (taken_tx, taken_rx) = oneshot::channel();
        if self.tx.send((item, taken_tx)).await.is_err() {
            return false;
        }
        taken_rx.await.is_ok()
    }
}

/// Creates an update stream and its producer half. At most `capacity` items
/// wait for the consumer at a time.
pub fn update_channel(capacity: usize) -> (BatchSender, UpdateStream) {
    let (tx, rx) = mpsc::channel(capacity);
    let updates = futures::stream::unfold(rx, |mut rx: mpsc::Receiver<Handoff>| async move {
        let (item, taken) = rx.recv().await?;
        let _ = taken.send(());
        Some((item, rx))
    })
    .boxed();
    (BatchSender { tx }, updates)
}

/// Starts `getUpdates` long polling. Transient failures are retried by the
/// API client; once it gives up the stream yields the error and ends.
pub fn spawn_polling(api: Arc<dyn TelegramApi>, timeout_secs: u64) -> UpdateSource {
    let (tx, updates) = update_channel(1);
    let worker = tokio::spawn(poll_loop(api, timeout_secs, tx));
    UpdateSource { updates, worker }
}

async fn poll_loop(api: Arc<dyn TelegramApi>, timeout_secs: u64, tx: BatchSender) {
    let mut offset: Option<i64> = None;
    loop {
        let updates = match api
            .get_updates(offset, timeout_secs, &ALLOWED_UPDATES)
            .await
        {
            Ok(updates) => updates,
            Err(err) => {
                error!(error = %err, "telegram polling failed");
                tx.deliver(Err(StreamError::from(err))).await;
                return;
            }
        };
        if updates.is_empty() {
            continue;
        }

        let next_offset = updates.iter().map(|u| u.update_id).max().map(|last| last + 1);
        debug!(count = updates.len(), ?next_offset, "telegram updates received");
        let batch: UpdateBatch = updates.into_iter().map(RawUpdate::from).collect();
        if !tx.deliver(Ok(batch)).await {
            debug!("update consumer gone before taking the page; stopping polling");
            return;
        }
        offset = next_offset.or(offset);
    }
}

#[derive(Clone)]
struct WebhookState {
    tx: BatchSender,
    secret_token: Option<String>,
}

fn secret_token_valid(expected: &Option<String>, provided: Option<&str>) -> bool {
    match expected {
        Some(exp) => provided.is_some_and(|p| bool::from(p.as_bytes().ct_eq(exp.as_bytes()))),
        None => true,
    }
}

async fn handle_update(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> StatusCode {
    let provided = headers
        .get(SECRET_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if !secret_token_valid(&state.secret_token, provided) {
        warn!("telegram secret token mismatch");
        return StatusCode::UNAUTHORIZED;
    }

    let update: TelegramUpdate = match serde_json::from_value(payload) {
        Ok(update) => update,
        Err(err) => {
            warn!("bad update: {err}");
            return StatusCode::BAD_REQUEST;
        }
    };

    if state.tx.deliver(Ok(vec![RawUpdate::from(update)])).await {
        StatusCode::OK
    } else {
        // not taken before the coordinator stopped; Telegram will redeliver
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Router accepting Telegram webhook POSTs and forwarding them to `tx`. Each
/// request is answered once its update has been taken by the consumer.
pub fn webhook_router(tx: BatchSender, secret_token: Option<String>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(handle_update))
        .with_state(WebhookState { tx, secret_token })
}

/// Binds the webhook listener. The server stops accepting when `shutdown` flips.
pub async fn spawn_webhook(
    bind: SocketAddr,
    secret_token: Option<String>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<UpdateSource> {
    let (tx, updates) = update_channel(WEBHOOK_CHANNEL_CAPACITY);
    let app = webhook_router(tx, secret_token);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind webhook listener on {bind}"))?;
    info!(addr = %bind, path = WEBHOOK_PATH, "telegram webhook listening");

    let worker = tokio::spawn(async move {
        let stopped = async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(stopped)
            .await
        {
            error!(error = %err, "webhook server failed");
        }
    });

    Ok(UpdateSource { updates, worker })
}
