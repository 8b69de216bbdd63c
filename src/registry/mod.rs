//! The interface to the service registry.
//!
//! The registry is an external, health-checked instance catalog. This crate
//! only ever reads from it: one point-in-time listing at start, and a
//! push-based feed of full snapshots afterwards. How a registry computes
//! healthiness, and how its transport works, is opaque behind
//! [RegistryClient].

pub mod memory;

use crate::service;
use crate::target::RegistryAddr;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum Error {
    #[error("registry client is closed")]
    Closed,

    #[error("I/O error talking to the registry")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Health of a registered instance, as judged by the registry's checks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Health {
    Passing,
    Warning,
    Critical,
}

impl Health {
    pub fn is_passing(&self) -> bool {
        matches!(self, Health::Passing)
    }
}

/// A single registered instance of a service, as reported by the registry.
///
/// `id` is the registry's stable identifier for the registration; two
/// instances may share a host and port while carrying distinct ids, and
/// snapshots preserve that granularity.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Instance {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub health: Health,
}

/// The full current set of instances matching a filter.
pub type Snapshot = Vec<Instance>;

/// Registry-side scoping of a listing or a subscription.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterOptions {
    /// Restrict to one datacenter; `None` means the registry's own.
    pub datacenter: Option<String>,
    /// Every listed tag must be present on a matching instance. Empty means
    /// no tag filter.
    pub tags: Vec<String>,
}

impl FilterOptions {
    /// Whether `instance` carries every required tag.
    pub fn tags_match(&self, instance: &Instance) -> bool {
        self.tags
            .iter()
            .all(|required| instance.tags.iter().any(|tag| tag == required))
    }
}

/// Sending half of a change feed, held by the registry client.
pub type SnapshotSender = mpsc::UnboundedSender<Snapshot>;

/// A subscription to a registry's change feed.
///
/// Delivers the full snapshot of matching healthy instances on every
/// change, in order and without conflation; a consumer that observes every
/// event sees every intermediate snapshot. The feed has exactly one
/// consumer. Dropping it cancels the subscription.
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<Snapshot>,
}

impl ChangeFeed {
    /// Creates a connected sender/feed pair.
    pub fn channel() -> (SnapshotSender, ChangeFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ChangeFeed { rx })
    }

    /// Receives the next snapshot, or `None` once the registry side has
    /// stopped delivering.
    pub async fn recv(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }
}

/// A handle onto one registry, scoped to read-only health queries.
///
/// Implementations own whatever transport state they need; a handle is
/// used by exactly one resolver and released through [RegistryClient::close].
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// One point-in-time listing of healthy instances matching `filter`.
    async fn query_once(
        &self,
        service: &service::Name,
        filter: &FilterOptions,
    ) -> Result<Snapshot, Error>;

    /// Opens a change feed for `service` scoped by `filter`.
    ///
    /// The current snapshot is delivered as the feed's first event, then a
    /// fresh full snapshot follows every registry change.
    async fn subscribe(
        &self,
        service: &service::Name,
        filter: &FilterOptions,
    ) -> Result<ChangeFeed, Error>;

    /// Releases client resources. Feeds opened through this handle stop
    /// delivering. Safe to call more than once.
    async fn close(&self);
}

/// Builds [RegistryClient] handles for registry endpoints.
///
/// This is the injection seam between the provider and a concrete registry
/// transport: constructing a handle performs no I/O, so it is infallible;
/// connectivity problems surface from the handle's own operations.
pub trait RegistryConnector: Send + Sync {
    fn connect(&self, registry: &RegistryAddr) -> Arc<dyn RegistryClient>;
}
