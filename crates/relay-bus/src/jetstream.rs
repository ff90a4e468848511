use anyhow::Context;
use async_nats::{
    Client,
    jetstream::{self, Context as JsContext, context::Publish, stream::Config as StreamConfig},
};
use async_trait::async_trait;
use bytes::Bytes;
use relay_core::stream_subject;
use tracing::info;

use crate::{
    BusError, GROUP_KEY_HEADER, MESSAGE_TYPE_HEADER, QueueClass, QueueClient, QueueSend,
    QueueSettings, SendReceipt,
};

/// NATS JetStream queue. Ordered sends carry the dedup key as `Nats-Msg-Id`, so
/// the stream drops repeats inside its duplicate window.
pub struct JetStreamQueue {
    client: Client,
    js: JsContext,
    class: QueueClass,
}

impl JetStreamQueue {
    /// Connects and ensures the stream bound to `settings.subject` exists.
    pub async fn connect(settings: &QueueSettings) -> anyhow::Result<Self> {
        let client = async_nats::connect(settings.url.as_str())
            .await
            .with_context(|| format!("connect to NATS at {}", settings.url))?;
        Self::from_client(client, settings).await
    }

    pub async fn from_client(client: Client, settings: &QueueSettings) -> anyhow::Result<Self> {
        let js = jetstream::new(client.clone());
        ensure_stream(&js, settings).await?;
        Ok(Self {
            client,
            js,
            class: settings.class,
        })
    }
}

async fn ensure_stream(js: &JsContext, settings: &QueueSettings) -> anyhow::Result<()> {
    let cfg = StreamConfig {
        name: settings.stream.clone(),
        subjects: vec![stream_subject(&settings.subject)],
        duplicate_window: settings.duplicate_window(),
        max_messages: -1,
        max_bytes: -1,
        description: Some("Telegram channel envelopes".into()),
        ..StreamConfig::default()
    };
    js.get_or_create_stream(cfg)
        .await
        .with_context(|| format!("ensure stream {}", settings.stream))?;
    info!(
        stream = %settings.stream,
        subject = %settings.subject,
        class = %settings.class,
        "queue stream ready"
    );
    Ok(())
}

#[async_trait]
impl QueueClient for JetStreamQueue {
    fn class(&self) -> QueueClass {
        self.class
    }

    async fn send(&self, message: &QueueSend) -> Result<SendReceipt, BusError> {
        let mut publish = Publish::build()
            .payload(Bytes::from(message.body.clone()))
            .header(MESSAGE_TYPE_HEADER, message.message_type.as_str());
        if let Some(ordered) = &message.ordered {
            publish = publish
                .message_id(ordered.dedup_key.as_str())
                .header(GROUP_KEY_HEADER, ordered.group_key.as_str());
        }

        let ack = self
            .js
            .send_publish(message.subject.clone(), publish)
            .await
            .map_err(|err| BusError::Publish(anyhow::Error::new(err)))?
            .await
            .map_err(|err| BusError::Publish(anyhow::Error::new(err)))?;

        Ok(SendReceipt {
            duplicate: ack.duplicate,
            sequence: Some(ack.sequence),
        })
    }

    async fn close(&self) -> Result<(), BusError> {
        self.client
            .flush()
            .await
            .map_err(|err| BusError::Publish(anyhow::Error::new(err)))
    }
}
