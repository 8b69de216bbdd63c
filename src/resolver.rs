//! The watch/update core.
//!
//! A [RegistryResolver] owns one registry subscription and keeps exactly
//! one [Listener] informed of the current set of endpoints for a service.
//! It starts at most once, reports either a fresh address set or an
//! explicit unavailable condition on every registry change, and stops
//! delivering the moment [RegistryResolver::shutdown] returns.

use crate::endpoint::Endpoint;
use crate::registry::{self, ChangeFeed, FilterOptions, RegistryClient, Snapshot};
use crate::service;
use crate::target::ResolveTarget;

use debug_ignore::DebugIgnore;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    /// A second `start` on the same instance. Programming error, never a
    /// runtime condition.
    #[error("resolver for service '{service}' was already started")]
    AlreadyStarted { service: service::Name },

    /// The registry answered, but zero healthy instances match the filter.
    /// Recoverable: the watch stays up and a later snapshot may repopulate
    /// the address set.
    #[error("no servers could be resolved for service '{service}' from registry '{authority}'")]
    NoServers {
        service: service::Name,
        authority: Arc<str>,
    },

    /// Establishing the subscription or issuing the initial query failed.
    /// Retrying is the caller's decision, not this crate's.
    #[error("failed to start the registry watch for service '{service}' at '{authority}'")]
    Registry {
        service: service::Name,
        authority: Arc<str>,
        #[source]
        source: registry::Error,
    },
}

/// Consumes resolution results; implemented by the RPC client's
/// load-balancing layer.
///
/// Callbacks arrive on the resolver's worker task. Each `on_update`
/// replaces the previous address set wholesale: the list is the full image
/// of the latest registry snapshot, in no particular order.
pub trait Listener: Send + Sync + 'static {
    fn on_update(&self, endpoints: Vec<Endpoint>);
    fn on_error(&self, error: Error);
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum Lifecycle {
    #[default]
    Created,
    Started,
    Shutdown,
}

// State shared between the resolver handle and its worker task. The one
// lock serializing listener registration against listener reads from the
// delivery path.
#[derive(Debug, Default)]
struct Inner {
    lifecycle: Lifecycle,
    listener: DebugIgnore<Option<Arc<dyn Listener>>>,
    terminate_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Resolves a service name against a registry and follows its changes.
pub struct RegistryResolver {
    authority: Arc<str>,
    service: service::Name,
    filter: FilterOptions,
    client: Arc<dyn RegistryClient>,
    inner: Arc<Mutex<Inner>>,
}

impl RegistryResolver {
    /// Builds an unstarted resolver for `target`, reading through `client`.
    ///
    /// The client is owned exclusively by this instance and released by
    /// [Self::shutdown].
    pub fn new(target: ResolveTarget, client: Arc<dyn RegistryClient>) -> Self {
        let filter = FilterOptions {
            datacenter: target.datacenter().map(str::to_string),
            tags: target.tags().to_vec(),
        };
        Self {
            authority: Arc::from(target.registry().to_string()),
            service: target.service().clone(),
            filter,
            client,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// The registry endpoint this resolver was built against.
    ///
    /// Pure accessor, valid in every lifecycle state.
    pub fn service_authority(&self) -> &str {
        &self.authority
    }

    /// The service this resolver watches.
    pub fn service(&self) -> &service::Name {
        &self.service
    }

    /// Registers `listener` and opens the watch.
    ///
    /// Subscribes to the registry's change feed, then issues one bounded
    /// point-in-time query before returning, so a caller starting against
    /// an already-empty service observes the unavailable report without
    /// waiting out the feed's first delivery. All later reporting happens
    /// from the feed.
    ///
    /// Fails with [Error::AlreadyStarted] on any second call and with
    /// [Error::Registry] when the registry cannot be reached.
    #[instrument(skip_all, name = "RegistryResolver::start", fields(service = %self.service))]
    pub async fn start(&self, listener: Arc<dyn Listener>) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.lifecycle != Lifecycle::Created {
                return Err(Error::AlreadyStarted {
                    service: self.service.clone(),
                });
            }
            inner.lifecycle = Lifecycle::Started;
            *inner.listener = Some(listener);
        }
        event!(
            Level::DEBUG,
            service = %self.service,
            authority = %self.authority,
            "starting registry watch"
        );

        let feed = self
            .client
            .subscribe(&self.service, &self.filter)
            .await
            .map_err(|source| self.registry_error(source))?;

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let worker = WatchWorker {
            authority: self.authority.clone(),
            service: self.service.clone(),
            inner: self.inner.clone(),
        };
        let handle = tokio::task::spawn(worker.run(feed, terminate_rx));
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.lifecycle == Lifecycle::Shutdown {
                // Shut down while we were subscribing. The worker must not
                // outlive that decision.
                handle.abort();
                return Ok(());
            }
            inner.terminate_tx = Some(terminate_tx);
            inner.handle = Some(handle);
        }

        let snapshot = self
            .client
            .query_once(&self.service, &self.filter)
            .await
            .map_err(|source| self.registry_error(source))?;
        if snapshot.is_empty() {
            event!(
                Level::WARN,
                service = %self.service,
                "no servers could be resolved"
            );
            let listener = self.inner.lock().unwrap().listener.0.clone();
            if let Some(listener) = listener {
                listener.on_error(self.no_servers());
            }
        }
        Ok(())
    }

    /// Stops the watch and releases the registry client.
    ///
    /// A callback already in flight is allowed to finish; the worker is
    /// joined before this returns, so no callback begins afterwards, even
    /// if the registry delivers a late event concurrently. Idempotent.
    pub async fn shutdown(&self) {
        let worker = {
            let mut inner = self.inner.lock().unwrap();
            if inner.lifecycle == Lifecycle::Shutdown {
                return;
            }
            inner.lifecycle = Lifecycle::Shutdown;
            (inner.terminate_tx.take(), inner.handle.take())
        };
        event!(
            Level::DEBUG,
            service = %self.service,
            authority = %self.authority,
            "stopping registry watch"
        );
        if let (Some(terminate_tx), Some(handle)) = worker {
            let _send_result = terminate_tx.send(());
            match handle.await {
                // Success or cancellation: quietly return
                Ok(()) => (),
                Err(err) if err.is_cancelled() => (),
                // Propagate panics
                Err(err) if err.is_panic() => std::panic::panic_any(err.into_panic()),
                Err(err) => panic!("unexpected join error from watch worker: {err}"),
            }
        }
        // Past the instance lock here: the client's own shutdown may drain
        // in-flight deliveries.
        self.client.close().await;
    }

    fn registry_error(&self, source: registry::Error) -> Error {
        Error::Registry {
            service: self.service.clone(),
            authority: self.authority.clone(),
            source,
        }
    }

    fn no_servers(&self) -> Error {
        Error::NoServers {
            service: self.service.clone(),
            authority: self.authority.clone(),
        }
    }
}

impl Drop for RegistryResolver {
    fn drop(&mut self) {
        let Some(handle) = self.inner.lock().unwrap().handle.take() else {
            return;
        };
        handle.abort();
    }
}

// Consumes the change feed and reports snapshots to the listener.
struct WatchWorker {
    authority: Arc<str>,
    service: service::Name,
    inner: Arc<Mutex<Inner>>,
}

impl WatchWorker {
    async fn run(self, mut feed: ChangeFeed, mut terminate_rx: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut terminate_rx => return,
                snapshot = feed.recv() => {
                    let Some(snapshot) = snapshot else {
                        event!(
                            Level::DEBUG,
                            service = %self.service,
                            "change feed closed by the registry"
                        );
                        return;
                    };
                    self.deliver(snapshot);
                }
            }
        }
    }

    fn deliver(&self, snapshot: Snapshot) {
        // Hold the instance lock only long enough to read the listener;
        // callbacks run unlocked.
        let listener = { self.inner.lock().unwrap().listener.0.clone() };
        let Some(listener) = listener else { return };

        if snapshot.is_empty() {
            event!(
                Level::WARN,
                service = %self.service,
                "no servers could be resolved"
            );
            listener.on_error(Error::NoServers {
                service: self.service.clone(),
                authority: self.authority.clone(),
            });
            listener.on_update(Vec::new());
            return;
        }

        // One endpoint per snapshot entry. The registry's entry granularity
        // decides deduplication, not this layer.
        let endpoints: Vec<Endpoint> = snapshot
            .iter()
            .map(|instance| Endpoint::new(&instance.host, instance.port))
            .collect();
        event!(
            Level::DEBUG,
            service = %self.service,
            count = endpoints.len(),
            "resolved endpoints"
        );
        listener.on_update(endpoints);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::memory::MemoryRegistry;
    use crate::registry::{Health, Instance, RegistryConnector};

    use std::time::Duration;

    fn setup_tracing_subscriber() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[derive(Default)]
    struct RecordingListener {
        updates: Mutex<Vec<Vec<Endpoint>>>,
        errors: Mutex<Vec<Error>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn latest(&self) -> Option<Vec<Endpoint>> {
            self.updates.lock().unwrap().last().cloned()
        }

        fn latest_len(&self) -> Option<usize> {
            self.updates.lock().unwrap().last().map(|u| u.len())
        }

        fn update_counts(&self) -> Vec<usize> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .map(|u| u.len())
                .collect()
        }

        fn error_count(&self) -> usize {
            self.errors.lock().unwrap().len()
        }
    }

    impl Listener for RecordingListener {
        fn on_update(&self, endpoints: Vec<Endpoint>) {
            self.updates.lock().unwrap().push(endpoints);
        }

        fn on_error(&self, error: Error) {
            self.errors.lock().unwrap().push(error);
        }
    }

    async fn wait_until(description: &str, condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {description}"));
    }

    fn instance(id: &str, port: u16, tags: &[&str]) -> Instance {
        Instance {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            health: Health::Passing,
        }
    }

    fn resolver_for(registry: &MemoryRegistry, locator: &str) -> RegistryResolver {
        let target = ResolveTarget::parse(locator).unwrap();
        let client = registry.connect(target.registry());
        RegistryResolver::new(target, client)
    }

    #[tokio::test]
    async fn reports_endpoints_for_healthy_instances() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        registry.register("ping", instance("a", 7001, &[]));
        registry.register("ping", instance("b", 7002, &[]));

        let resolver = resolver_for(&registry, "consul://localhost:8500/ping");
        assert_eq!(resolver.service_authority(), "localhost:8500");

        let listener = RecordingListener::new();
        resolver.start(listener.clone()).await.unwrap();

        wait_until("two endpoints", || listener.latest_len() == Some(2)).await;
        let mut endpoints = listener.latest().unwrap();
        endpoints.sort();
        assert_eq!(
            endpoints,
            vec![
                Endpoint::new("127.0.0.1", 7001),
                Endpoint::new("127.0.0.1", 7002)
            ]
        );
        assert_eq!(listener.error_count(), 0);
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn empty_service_errors_before_start_returns() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        let resolver = resolver_for(&registry, "consul://localhost:8500/ping");
        let listener = RecordingListener::new();

        resolver.start(listener.clone()).await.unwrap();

        // The initial resolve already ran; no waiting on the feed.
        assert!(listener.error_count() >= 1);
        {
            let errors = listener.errors.lock().unwrap();
            let message = errors[0].to_string();
            assert!(matches!(errors[0], Error::NoServers { .. }));
            assert!(message.contains("ping"));
            assert!(message.contains("localhost:8500"));
        }
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn starting_twice_is_a_precondition_error() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        registry.register("ping", instance("a", 7001, &[]));
        let resolver = resolver_for(&registry, "consul://localhost:8500/ping");

        resolver.start(RecordingListener::new()).await.unwrap();
        let err = resolver.start(RecordingListener::new()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted { .. }));
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn instances_appearing_after_start_are_reported() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        registry.register("ping", instance("a", 7001, &[]));

        let resolver = resolver_for(&registry, "consul://localhost:8500/ping");
        let listener = RecordingListener::new();
        resolver.start(listener.clone()).await.unwrap();
        wait_until("first endpoint", || listener.latest_len() == Some(1)).await;

        registry.register("ping", instance("b", 7002, &[]));
        wait_until("second endpoint", || listener.latest_len() == Some(2)).await;
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn removing_instances_counts_down_to_unavailable() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        registry.register("ping", instance("a", 7001, &[]));
        registry.register("ping", instance("b", 7002, &[]));
        registry.register("ping", instance("c", 7003, &[]));

        let resolver = resolver_for(&registry, "consul://localhost:8500/ping");
        let listener = RecordingListener::new();
        resolver.start(listener.clone()).await.unwrap();

        wait_until("three endpoints", || listener.latest_len() == Some(3)).await;
        assert_eq!(listener.error_count(), 0);

        registry.deregister("ping", "c");
        wait_until("two endpoints", || listener.latest_len() == Some(2)).await;

        registry.deregister("ping", "b");
        wait_until("one endpoint", || listener.latest_len() == Some(1)).await;

        registry.deregister("ping", "a");
        wait_until("empty update", || listener.latest_len() == Some(0)).await;

        assert!(listener.error_count() >= 1);
        // Every snapshot arrived whole; nothing was conflated away.
        assert_eq!(listener.update_counts(), vec![3, 2, 1, 0]);
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn tag_subsets_match_tagged_instances() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        registry.register("ping", instance("a", 7001, &["foo", "bar", "baz"]));

        for locator in [
            "consul://localhost:8500/ping?tag=foo",
            "consul://localhost:8500/ping?tag=foo&tag=bar&tag=baz",
        ] {
            let resolver = resolver_for(&registry, locator);
            let listener = RecordingListener::new();
            resolver.start(listener.clone()).await.unwrap();
            wait_until("tagged endpoint", || listener.latest_len() == Some(1)).await;
            assert_eq!(listener.error_count(), 0);
            resolver.shutdown().await;
        }
    }

    #[tokio::test]
    async fn unmatched_tags_are_unavailable() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        registry.register("ping", instance("a", 7001, &["foo", "bar", "baz"]));

        let resolver = resolver_for(&registry, "consul://localhost:8500/ping?tag=other");
        let listener = RecordingListener::new();
        resolver.start(listener.clone()).await.unwrap();

        assert!(listener.error_count() >= 1);
        wait_until("empty update from the feed", || {
            listener.latest_len() == Some(0)
        })
        .await;
        assert!(listener.update_counts().iter().all(|count| *count == 0));
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn recovers_after_unavailable() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        let resolver = resolver_for(&registry, "consul://localhost:8500/ping");
        let listener = RecordingListener::new();
        resolver.start(listener.clone()).await.unwrap();
        assert!(listener.error_count() >= 1);

        registry.register("ping", instance("a", 7001, &[]));
        wait_until("endpoint after recovery", || {
            listener.latest_len() == Some(1)
        })
        .await;
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn every_empty_snapshot_is_reported() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        registry.register("ping", instance("a", 7001, &[]));

        let resolver = resolver_for(&registry, "consul://localhost:8500/ping");
        let listener = RecordingListener::new();
        resolver.start(listener.clone()).await.unwrap();
        wait_until("initial endpoint", || listener.latest_len() == Some(1)).await;

        registry.deregister("ping", "a");
        wait_until("first empty", || listener.latest_len() == Some(0)).await;
        let errors_after_first = listener.error_count();
        assert!(errors_after_first >= 1);

        registry.register("ping", instance("a", 7001, &[]));
        wait_until("repopulated", || listener.latest_len() == Some(1)).await;

        registry.deregister("ping", "a");
        wait_until("second empty reported again", || {
            listener.error_count() > errors_after_first
        })
        .await;
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn critical_instances_do_not_resolve() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        let mut sick = instance("a", 7001, &[]);
        sick.health = Health::Critical;
        registry.register("ping", sick);

        let resolver = resolver_for(&registry, "consul://localhost:8500/ping");
        let listener = RecordingListener::new();
        resolver.start(listener.clone()).await.unwrap();
        assert!(listener.error_count() >= 1);

        registry.set_health("ping", "a", Health::Passing);
        wait_until("endpoint once passing", || listener.latest_len() == Some(1)).await;
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn datacenter_scoping_applies() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        registry.register("ping", instance("a", 7001, &[]));

        let resolver = resolver_for(&registry, "consul://localhost:8500/ping?dc=dc1");
        let listener = RecordingListener::new();
        resolver.start(listener.clone()).await.unwrap();
        wait_until("endpoint in dc1", || listener.latest_len() == Some(1)).await;
        resolver.shutdown().await;

        let resolver = resolver_for(&registry, "consul://localhost:8500/ping?dc=dc2");
        let listener = RecordingListener::new();
        resolver.start(listener.clone()).await.unwrap();
        assert!(listener.error_count() >= 1);
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_delivery_and_is_idempotent() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        registry.register("ping", instance("a", 7001, &[]));

        let resolver = resolver_for(&registry, "consul://localhost:8500/ping");
        let listener = RecordingListener::new();
        resolver.start(listener.clone()).await.unwrap();
        wait_until("initial endpoint", || listener.latest_len() == Some(1)).await;

        resolver.shutdown().await;
        let updates_at_shutdown = listener.update_counts().len();

        // A late registry change must not reach the listener.
        registry.register("ping", instance("b", 7002, &[]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.update_counts().len(), updates_at_shutdown);

        // Still a pure accessor after shutdown.
        assert_eq!(resolver.service_authority(), "localhost:8500");
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_registry_fails_start() {
        setup_tracing_subscriber();
        let registry = MemoryRegistry::new("dc1");
        let target = ResolveTarget::parse("consul://localhost:8500/ping").unwrap();
        let client = registry.client();
        client.close().await;

        let resolver = RegistryResolver::new(target, client);
        let listener = RecordingListener::new();
        let err = resolver.start(listener.clone()).await.unwrap_err();

        let message = err.to_string();
        assert!(matches!(err, Error::Registry { .. }));
        assert!(message.contains("ping"));
        assert!(message.contains("localhost:8500"));
        // Startup failures surface from start, not through the listener.
        assert_eq!(listener.error_count(), 0);
        assert!(listener.update_counts().is_empty());
    }
}
