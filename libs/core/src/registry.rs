//! Startup-time resolution of configured channel references.
//!
//! Every configured reference is looked up exactly once through a
//! [`ChannelDirectory`]; the results are cached for the life of the process and
//! folded into the [`TrackedChannelSet`] the filter consults.

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use relay_telemetry::{TelemetryLabels, record_counter};
use thiserror::Error;
use tracing::{info, warn};

use crate::channel::{ChannelId, ChannelRef, ChannelSelection, TrackedChannelSet};

const CHANNELS_UNRESOLVED_COUNTER: &str = "relay_channels_unresolved";

/// Canonical identity of a channel as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChannel {
    pub id: ChannelId,
    /// Current public handle, if the channel has one.
    pub handle: Option<String>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("channel {reference} could not be resolved: {reason}")]
    UnresolvedChannel { reference: String, reason: String },
}

/// Platform lookup used to resolve channel references.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn lookup(&self, reference: &ChannelRef) -> Result<ResolvedChannel>;
}

/// Resolved view of the configured channel list.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    resolved: HashMap<ChannelRef, ResolvedChannel>,
    unresolved: Vec<ChannelRef>,
    tracked: TrackedChannelSet,
}

impl ChannelRegistry {
    /// Resolves a single reference through the directory.
    pub async fn resolve<D>(
        directory: &D,
        reference: &ChannelRef,
    ) -> Result<ResolvedChannel, RegistryError>
    where
        D: ChannelDirectory + ?Sized,
    {
        directory
            .lookup(reference)
            .await
            .map_err(|err| RegistryError::UnresolvedChannel {
                reference: reference.to_string(),
                reason: format!("{err:#}"),
            })
    }

    /// Resolves every configured reference once. A reference that cannot be
    /// resolved is logged and skipped; numeric references are still tracked by
    /// ID because the ID is already canonical.
    ///
    /// Only [`ChannelSelection::All`] tracks every channel. A listed selection
    /// that ends up with nothing usable rejects every update instead.
    pub async fn load<D>(directory: &D, selection: &ChannelSelection) -> Self
    where
        D: ChannelDirectory + ?Sized,
    {
        let references = match selection {
            ChannelSelection::All => {
                info!("no channels configured; tracking every channel");
                return Self {
                    resolved: HashMap::new(),
                    unresolved: Vec::new(),
                    tracked: TrackedChannelSet::track_all(),
                };
            }
            ChannelSelection::Listed(references) => references,
        };

        let mut resolved = HashMap::new();
        let mut unresolved = Vec::new();
        let mut tracked = TrackedChannelSet::listed();

        for reference in references {
            if resolved.contains_key(reference) || unresolved.contains(reference) {
                continue;
            }
            match Self::resolve(directory, reference).await {
                Ok(channel) => {
                    let channel = match reference {
                        ChannelRef::Numeric(id) => ResolvedChannel {
                            id: *id,
                            handle: channel.handle,
                        },
                        ChannelRef::Handle(_) => channel,
                    };
                    tracked.insert_id(channel.id);
                    if let ChannelRef::Handle(handle) = reference {
                        tracked.insert_handle(handle, channel.id);
                    }
                    info!(
                        reference = %reference,
                        channel_id = %channel.id,
                        handle = channel.handle.as_deref().unwrap_or(""),
                        "channel resolved"
                    );
                    resolved.insert(reference.clone(), channel);
                }
                Err(err) => {
                    record_counter(
                        CHANNELS_UNRESOLVED_COUNTER,
                        1,
                        &TelemetryLabels::new("registry")
                            .with_extra("reference", reference.to_string()),
                    );
                    match reference {
                        ChannelRef::Numeric(id) => {
                            warn!(
                                reference = %reference,
                                error = %err,
                                "channel lookup failed; tracking by numeric id only"
                            );
                            tracked.insert_id(*id);
                        }
                        ChannelRef::Handle(_) => {
                            warn!(
                                reference = %reference,
                                error = %err,
                                "skipping unresolved channel"
                            );
                        }
                    }
                    unresolved.push(reference.clone());
                }
            }
        }

        if tracked.is_empty() {
            warn!("no configured channel could be resolved; every update will be rejected");
        }

        Self {
            resolved,
            unresolved,
            tracked,
        }
    }

    /// Cached resolution for a configured reference.
    pub fn get(&self, reference: &ChannelRef) -> Option<&ResolvedChannel> {
        self.resolved.get(reference)
    }

    pub fn unresolved(&self) -> &[ChannelRef] {
        &self.unresolved
    }

    pub fn tracked(&self) -> &TrackedChannelSet {
        &self.tracked
    }

    pub fn into_tracked(self) -> TrackedChannelSet {
        self.tracked
    }
}

/// Fixed directory backed by a map, for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    by_id: HashMap<ChannelId, Option<String>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, id: ChannelId, handle: Option<&str>) -> Self {
        self.by_id.insert(id, handle.map(crate::channel::normalize_handle));
        self
    }
}

#[async_trait]
impl ChannelDirectory for StaticDirectory {
    async fn lookup(&self, reference: &ChannelRef) -> Result<ResolvedChannel> {
        match reference {
            ChannelRef::Numeric(id) => self
                .by_id
                .get(id)
                .map(|handle| ResolvedChannel {
                    id: *id,
                    handle: handle.clone(),
                })
                .ok_or_else(|| anyhow!("channel {id} not found")),
            ChannelRef::Handle(wanted) => self
                .by_id
                .iter()
                .find(|(_, handle)| handle.as_deref() == Some(wanted.as_str()))
                .map(|(id, handle)| ResolvedChannel {
                    id: *id,
                    handle: handle.clone(),
                })
                .ok_or_else(|| anyhow!("username @{wanted} not found")),
        }
    }
}
