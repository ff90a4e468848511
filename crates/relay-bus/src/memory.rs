use std::{collections::HashSet, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{BusError, QueueClass, QueueClient, QueueSend, SendReceipt};

/// Queue double that records sends. In FIFO mode it drops repeats of a dedup
/// key the way an ordered queue does inside its duplicate window.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    class: QueueClass,
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    attempts: usize,
    sends: Vec<QueueSend>,
    delivered: Vec<QueueSend>,
    seen: HashSet<String>,
    fail_attempts: HashSet<usize>,
    closed: bool,
}

impl InMemoryQueue {
    pub fn new(class: QueueClass) -> Self {
        Self {
            class,
            state: Arc::default(),
        }
    }

    /// Makes the `attempt`-th send (0-based, counted across all sends) fail.
    pub async fn fail_attempt(&self, attempt: usize) {
        self.state.lock().await.fail_attempts.insert(attempt);
    }

    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }

    /// Every send the queue accepted, duplicates included.
    pub async fn sends(&self) -> Vec<QueueSend> {
        self.state.lock().await.sends.clone()
    }

    /// Sends that were stored, after duplicate suppression.
    pub async fn delivered(&self) -> Vec<QueueSend> {
        self.state.lock().await.delivered.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    fn class(&self) -> QueueClass {
        self.class
    }

    async fn send(&self, message: &QueueSend) -> Result<SendReceipt, BusError> {
        let mut guard = self.state.lock().await;
        let attempt = guard.attempts;
        guard.attempts += 1;
        if guard.closed {
            return Err(BusError::Publish(anyhow!("queue closed")));
        }
        if guard.fail_attempts.contains(&attempt) {
            return Err(BusError::Publish(anyhow!("simulated send failure #{attempt}")));
        }

        guard.sends.push(message.clone());
        let duplicate = match (&self.class, &message.ordered) {
            (QueueClass::Fifo, Some(ordered)) => {
                !guard.seen.insert(ordered.dedup_key.as_str().to_string())
            }
            _ => false,
        };
        if !duplicate {
            guard.delivered.push(message.clone());
        }
        Ok(SendReceipt {
            duplicate,
            sequence: Some(guard.delivered.len() as u64),
        })
    }

    async fn close(&self) -> Result<(), BusError> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}
