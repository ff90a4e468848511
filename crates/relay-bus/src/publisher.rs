use std::{ops::AddAssign, sync::Arc, time::Instant};

use relay_core::{ENVELOPE_MESSAGE_TYPE, OutboundEnvelope, envelope_subject};
use relay_telemetry::{TelemetryLabels, record_counter, record_histogram, with_common_fields};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{BusError, OrderedDelivery, QueueClass, QueueClient, QueueSend};

const PUBLISH_SPAN_NAME: &str = "relay.publish";
const PUBLISHED_COUNTER: &str = "relay_envelopes_published";
const DUPLICATE_COUNTER: &str = "relay_envelopes_duplicate";
const FAILURE_COUNTER: &str = "relay_delivery_failures";
const LATENCY_HISTOGRAM: &str = "relay_publish_duration_ms";
const METRIC_SOURCE: &str = "publisher";
const LOGGED_TEXT_CHARS: usize = 200;

/// Outcome of publishing one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishResult {
    pub attempted: usize,
    pub delivered: usize,
    /// Sends the queue acknowledged as repeats of an earlier dedup key.
    pub duplicates: usize,
    pub failed: usize,
}

impl PublishResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

impl AddAssign for PublishResult {
    fn add_assign(&mut self, rhs: Self) {
        self.attempted += rhs.attempted;
        self.delivered += rhs.delivered;
        self.duplicates += rhs.duplicates;
        self.failed += rhs.failed;
    }
}

#[derive(Clone)]
struct DeliveryTarget {
    queue: Arc<dyn QueueClient>,
    subject: String,
    group_key: String,
}

/// Sends envelope batches to the outbound queue, one send per envelope.
///
/// A failed send is logged and counted; the rest of the batch still goes out.
/// There is no retry here beyond what the queue client does itself.
#[derive(Clone, Default)]
pub struct DeliveryPublisher {
    target: Option<DeliveryTarget>,
}

impl DeliveryPublisher {
    /// Publisher for a deployment without a queue. Envelopes are logged, not sent.
    pub fn disabled() -> Self {
        Self { target: None }
    }

    pub fn new(
        queue: Arc<dyn QueueClient>,
        subject: impl Into<String>,
        group_key: impl Into<String>,
    ) -> Self {
        Self {
            target: Some(DeliveryTarget {
                queue,
                subject: subject.into(),
                group_key: group_key.into(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    pub async fn publish(&self, batch: &[OutboundEnvelope]) -> PublishResult {
        let mut result = PublishResult::default();
        let Some(target) = &self.target else {
            for envelope in batch {
                info!(
                    channel_id = %envelope.channel_id,
                    handle = envelope.handle.as_deref().unwrap_or(""),
                    msg_id = envelope.message_id,
                    timestamp = %envelope.timestamp,
                    permalink = %envelope.permalink,
                    text = %snippet(&envelope.text),
                    edited = envelope.edited,
                    "channel post"
                );
            }
            return result;
        };

        for envelope in batch {
            result.attempted += 1;
            let span = info_span!(
                PUBLISH_SPAN_NAME,
                channel_id = tracing::field::Empty,
                msg_id = tracing::field::Empty,
                dedup_key = %envelope.dedup_key(),
            );
            with_common_fields(
                &span,
                Some(&envelope.channel_id.to_string()),
                Some(&envelope.message_id.to_string()),
            );

            let started = Instant::now();
            let outcome = target.send(envelope).instrument(span).await;
            record_histogram(
                LATENCY_HISTOGRAM,
                started.elapsed().as_secs_f64() * 1000.0,
                &labels(envelope),
            );

            match outcome {
                Ok(receipt) if receipt.duplicate => {
                    result.duplicates += 1;
                    record_counter(DUPLICATE_COUNTER, 1, &labels(envelope));
                    debug!(
                        channel_id = %envelope.channel_id,
                        msg_id = envelope.message_id,
                        "queue suppressed duplicate envelope"
                    );
                }
                Ok(_) => {
                    result.delivered += 1;
                    record_counter(PUBLISHED_COUNTER, 1, &labels(envelope));
                }
                Err(err) => {
                    result.failed += 1;
                    record_counter(FAILURE_COUNTER, 1, &labels(envelope));
                    error!(
                        channel_id = %envelope.channel_id,
                        msg_id = envelope.message_id,
                        error = %err,
                        "envelope publish failed"
                    );
                }
            }
        }

        if result.failed > 0 {
            warn!(
                attempted = result.attempted,
                failed = result.failed,
                "batch published with failures"
            );
        }
        result
    }

    /// Releases the queue connection, if any.
    pub async fn close(&self) -> Result<(), BusError> {
        match &self.target {
            Some(target) => target.queue.close().await,
            None => Ok(()),
        }
    }
}

impl DeliveryTarget {
    fn prepare(&self, envelope: &OutboundEnvelope) -> Result<QueueSend, BusError> {
        let ordered = match self.queue.class() {
            QueueClass::Fifo => Some(OrderedDelivery {
                group_key: self.group_key.clone(),
                dedup_key: envelope.dedup_key(),
            }),
            QueueClass::Standard => None,
        };
        Ok(QueueSend {
            subject: envelope_subject(&self.subject, envelope.channel_id),
            body: serde_json::to_string(envelope)?,
            message_type: ENVELOPE_MESSAGE_TYPE.to_string(),
            ordered,
        })
    }

    async fn send(&self, envelope: &OutboundEnvelope) -> Result<crate::SendReceipt, BusError> {
        let message = self.prepare(envelope)?;
        self.queue.send(&message).await
    }
}

fn snippet(text: &str) -> String {
    match text.char_indices().nth(LOGGED_TEXT_CHARS) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn labels(envelope: &OutboundEnvelope) -> TelemetryLabels {
    let mut labels = TelemetryLabels::new(METRIC_SOURCE);
    labels.channel_id = Some(envelope.channel_id.to_string());
    labels
}
