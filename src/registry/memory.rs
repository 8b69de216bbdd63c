//! An in-process implementation of the registry interface.
//!
//! [MemoryRegistry] models a single-datacenter, health-checked instance
//! catalog: register and deregister instances, flip their health, and every
//! subscribed change feed receives a fresh full snapshot. It backs this
//! crate's own tests and works as an embedded registry anywhere a real one
//! is not available.

use super::{
    ChangeFeed, Error, FilterOptions, Health, Instance, RegistryClient, RegistryConnector,
    Snapshot, SnapshotSender,
};
use crate::service;
use crate::target::RegistryAddr;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The registry itself. Clones share state.
#[derive(Clone)]
pub struct MemoryRegistry {
    shared: Arc<Shared>,
}

struct Shared {
    datacenter: String,
    next_client_id: AtomicU64,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    // service name -> instance id -> registration
    services: BTreeMap<service::Name, BTreeMap<String, Instance>>,
    watches: Vec<Watch>,
}

struct Watch {
    client_id: u64,
    service: service::Name,
    filter: FilterOptions,
    tx: SnapshotSender,
}

impl MemoryRegistry {
    pub fn new(datacenter: impl ToString) -> Self {
        Self {
            shared: Arc::new(Shared {
                datacenter: datacenter.to_string(),
                next_client_id: AtomicU64::new(0),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Vends a client handle onto this registry.
    pub fn client(&self) -> Arc<MemoryClient> {
        Arc::new(MemoryClient {
            shared: self.shared.clone(),
            id: self.shared.next_client_id.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        })
    }

    /// Adds or replaces a registration, keyed by its instance id.
    pub fn register(&self, service: impl Into<service::Name>, instance: Instance) {
        let service = service.into();
        let mut state = self.shared.state.lock().unwrap();
        state
            .services
            .entry(service.clone())
            .or_default()
            .insert(instance.id.clone(), instance);
        self.shared.notify(&mut state, &service);
    }

    /// Updates the health of one registration, if present.
    pub fn set_health(&self, service: &str, id: &str, health: Health) {
        let mut state = self.shared.state.lock().unwrap();
        let Some(instances) = state.services.get_mut(service) else {
            return;
        };
        let Some(instance) = instances.get_mut(id) else {
            return;
        };
        instance.health = health;
        let service = service::Name::from(service);
        self.shared.notify(&mut state, &service);
    }

    /// Removes one registration, if present.
    pub fn deregister(&self, service: &str, id: &str) {
        let mut state = self.shared.state.lock().unwrap();
        let Some(instances) = state.services.get_mut(service) else {
            return;
        };
        if instances.remove(id).is_none() {
            return;
        }
        let service = service::Name::from(service);
        self.shared.notify(&mut state, &service);
    }
}

impl Shared {
    // Current snapshot of healthy instances matching `filter`.
    fn snapshot(
        &self,
        services: &BTreeMap<service::Name, BTreeMap<String, Instance>>,
        service: &service::Name,
        filter: &FilterOptions,
    ) -> Snapshot {
        let in_datacenter = filter
            .datacenter
            .as_deref()
            .map_or(true, |dc| dc == self.datacenter);
        if !in_datacenter {
            return Snapshot::new();
        }
        let Some(instances) = services.get(service) else {
            return Snapshot::new();
        };
        instances
            .values()
            .filter(|instance| instance.health.is_passing() && filter.tags_match(instance))
            .cloned()
            .collect()
    }

    // Pushes a fresh snapshot to every watch on `service`, pruning watches
    // whose consumer has gone away.
    fn notify(&self, state: &mut State, service: &service::Name) {
        let State { services, watches } = state;
        let mut live = Vec::with_capacity(watches.len());
        for watch in watches.drain(..) {
            if &watch.service != service {
                live.push(watch);
                continue;
            }
            let snapshot = self.snapshot(services, &watch.service, &watch.filter);
            if watch.tx.send(snapshot).is_ok() {
                live.push(watch);
            }
        }
        *watches = live;
    }
}

/// One client handle onto a [MemoryRegistry].
pub struct MemoryClient {
    shared: Arc<Shared>,
    id: u64,
    closed: AtomicBool,
}

impl MemoryClient {
    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for MemoryClient {
    async fn query_once(
        &self,
        service: &service::Name,
        filter: &FilterOptions,
    ) -> Result<Snapshot, Error> {
        self.check_open()?;
        let state = self.shared.state.lock().unwrap();
        Ok(self.shared.snapshot(&state.services, service, filter))
    }

    async fn subscribe(
        &self,
        service: &service::Name,
        filter: &FilterOptions,
    ) -> Result<ChangeFeed, Error> {
        self.check_open()?;
        let (tx, feed) = ChangeFeed::channel();
        let mut state = self.shared.state.lock().unwrap();
        let initial = self.shared.snapshot(&state.services, service, filter);
        // The consumer holds the feed end, so this send cannot fail yet.
        let _ = tx.send(initial);
        state.watches.push(Watch {
            client_id: self.id,
            service: service.clone(),
            filter: filter.clone(),
            tx,
        });
        Ok(feed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        state.watches.retain(|watch| watch.client_id != self.id);
    }
}

impl RegistryConnector for MemoryRegistry {
    // The endpoint in the locator is irrelevant for an in-process registry;
    // every connect lands on the same catalog.
    fn connect(&self, _registry: &RegistryAddr) -> Arc<dyn RegistryClient> {
        self.client()
    }
}
