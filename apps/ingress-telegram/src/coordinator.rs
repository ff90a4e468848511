//! Drives updates through filter, envelope builder and publisher.

use futures::{Stream, StreamExt};
use relay_bus::{DeliveryPublisher, PublishResult};
use relay_core::{
    Classification, OutboundEnvelope, RawUpdate, UpdateBatch, UpdateFilter, build_envelope,
};
use relay_telemetry::{TelemetryLabels, record_counter, record_gauge, with_common_fields};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn};

use crate::source::StreamError;

const UPDATE_SPAN_NAME: &str = "relay.update";
const RECEIVED_COUNTER: &str = "relay_updates_received";
const REJECTED_COUNTER: &str = "relay_updates_rejected";
const BUILT_COUNTER: &str = "relay_envelopes_built";
const TRACKED_GAUGE: &str = "relay_tracked_channels";
const METRIC_SOURCE: &str = "coordinator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Signal,
    StreamEnded,
    StreamFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub updates_seen: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub publish: PublishResult,
    pub stop_cause: StopCause,
    pub final_state: CoordinatorState,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    seen: usize,
    accepted: usize,
    rejected: usize,
    publish: PublishResult,
}

/// Single-consumer pipeline over one update stream.
///
/// Batches are handled strictly in arrival order and each batch's publish runs
/// to completion before the next batch or the stop signal is looked at.
pub struct Coordinator {
    filter: UpdateFilter,
    publisher: DeliveryPublisher,
    state: CoordinatorState,
    tally: Tally,
}

impl Coordinator {
    pub fn new(filter: UpdateFilter, publisher: DeliveryPublisher) -> Self {
        Self {
            filter,
            publisher,
            state: CoordinatorState::Idle,
            tally: Tally::default(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Classifies one update and builds its envelope when accepted.
    pub fn process_update(&mut self, update: &RawUpdate) -> Option<OutboundEnvelope> {
        self.tally.seen += 1;
        record_counter(RECEIVED_COUNTER, 1, &TelemetryLabels::new(METRIC_SOURCE));

        let span = info_span!(
            UPDATE_SPAN_NAME,
            kind = update.kind(),
            channel_id = tracing::field::Empty,
            msg_id = tracing::field::Empty,
        );
        let _entered = span.enter();

        match self.filter.classify(update) {
            Classification::Accepted(candidate) => {
                with_common_fields(
                    &span,
                    Some(&candidate.channel_id.to_string()),
                    Some(&candidate.message_id.to_string()),
                );
                self.tally.accepted += 1;
                let envelope = build_envelope(&candidate);
                let mut labels = TelemetryLabels::new(METRIC_SOURCE);
                labels.channel_id = Some(envelope.channel_id.to_string());
                record_counter(BUILT_COUNTER, 1, &labels);
                debug!(dedup_key = %envelope.dedup_key(), "envelope built");
                Some(envelope)
            }
            Classification::Rejected(reason) => {
                self.tally.rejected += 1;
                record_counter(
                    REJECTED_COUNTER,
                    1,
                    &TelemetryLabels::new(METRIC_SOURCE).with_extra("reason", reason.as_str()),
                );
                debug!(reason = reason.as_str(), "update skipped");
                None
            }
        }
    }

    /// Runs one batch through the pipeline and publishes what was accepted.
    pub async fn process_batch(&mut self, batch: &UpdateBatch) -> PublishResult {
        let envelopes: Vec<OutboundEnvelope> = batch
            .iter()
            .filter_map(|update| self.process_update(update))
            .collect();
        let result = self.publisher.publish(&envelopes).await;
        self.tally.publish += result;
        result
    }

    /// Consumes `updates` until the stream ends or fails, or `shutdown` turns true.
    pub async fn run<S>(&mut self, updates: S, mut shutdown: watch::Receiver<bool>) -> RunSummary
    where
        S: Stream<Item = Result<UpdateBatch, StreamError>> + Unpin + Send,
    {
        let mut updates = updates;
        self.state = CoordinatorState::Running;
        record_gauge(
            TRACKED_GAUGE,
            self.filter.tracked().len() as f64,
            &TelemetryLabels::new(METRIC_SOURCE),
        );
        info!(
            tracks_all = self.filter.tracked().tracks_all(),
            channels = self.filter.tracked().len(),
            delivery = self.publisher.is_enabled(),
            "coordinator running"
        );

        let mut signals_open = true;
        let stop_cause = loop {
            if *shutdown.borrow() {
                break StopCause::Signal;
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed(), if signals_open => {
                    if changed.is_err() {
                        signals_open = false;
                    }
                    continue;
                }
                next = updates.next() => next,
            };

            match next {
                Some(Ok(batch)) => {
                    self.process_batch(&batch).await;
                }
                Some(Err(err)) => {
                    warn!(error = %err, "update stream failed");
                    break StopCause::StreamFailed;
                }
                None => {
                    info!("update stream ended");
                    break StopCause::StreamEnded;
                }
            }
        };

        self.state = CoordinatorState::Draining;
        info!(cause = ?stop_cause, "coordinator draining");
        drop(updates);
        if let Err(err) = self.publisher.close().await {
            warn!(error = %err, "queue close failed");
        }
        self.state = CoordinatorState::Stopped;

        let summary = RunSummary {
            updates_seen: self.tally.seen,
            accepted: self.tally.accepted,
            rejected: self.tally.rejected,
            publish: self.tally.publish,
            stop_cause,
            final_state: self.state,
        };
        info!(
            updates = summary.updates_seen,
            accepted = summary.accepted,
            published = summary.publish.delivered,
            failed = summary.publish.failed,
            "coordinator stopped"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{ChannelId, Peer, RawMessage, TrackedChannelSet};
    use tracing_test::traced_test;

    fn post(channel: i64, id: i64) -> RawUpdate {
        RawUpdate::NewChannelMessage(RawMessage {
            id,
            date: 1_700_000_000,
            peer: Peer::Channel {
                id: ChannelId(channel),
                handle: None,
            },
            text: Some("hello".into()),
            media: None,
        })
    }

    fn coordinator() -> Coordinator {
        let mut tracked = TrackedChannelSet::listed();
        tracked.insert_id(ChannelId(100));
        Coordinator::new(UpdateFilter::new(tracked), DeliveryPublisher::disabled())
    }

    #[test]
    fn starts_idle() {
        assert_eq!(coordinator().state(), CoordinatorState::Idle);
    }

    #[test]
    #[traced_test]
    fn rejected_updates_are_counted_and_logged() {
        let mut coordinator = coordinator();
        assert!(coordinator.process_update(&post(100, 1)).is_some());
        assert!(coordinator.process_update(&post(200, 1)).is_none());
        assert!(
            coordinator
                .process_update(&RawUpdate::Other("typing".into()))
                .is_none()
        );
        assert_eq!(coordinator.tally.seen, 3);
        assert_eq!(coordinator.tally.accepted, 1);
        assert_eq!(coordinator.tally.rejected, 2);
        assert!(logs_contain("update skipped"));
    }

    #[tokio::test]
    async fn already_signalled_shutdown_stops_before_reading() {
        let mut coordinator = coordinator();
        let (_tx, rx) = watch::channel(true);
        let summary = coordinator
            .run(futures::stream::iter(vec![Ok(vec![post(100, 1)])]), rx)
            .await;
        assert_eq!(summary.stop_cause, StopCause::Signal);
        assert_eq!(summary.updates_seen, 0);
        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    }

    #[tokio::test]
    async fn dropped_signal_sender_keeps_running_until_stream_ends() {
        let mut coordinator = coordinator();
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let summary = coordinator
            .run(futures::stream::iter(vec![Ok(vec![post(100, 1)])]), rx)
            .await;
        assert_eq!(summary.stop_cause, StopCause::StreamEnded);
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.final_state, CoordinatorState::Stopped);
    }
}
