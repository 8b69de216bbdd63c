//! corral is a registry-backed name resolution crate.
//!
//! corral watches a service registry (a health-checked instance catalog
//! such as HashiCorp Consul) and keeps an RPC client's load-balancing
//! layer supplied with the current set of addresses for a named service.
//!
//! It uses the following terminology:
//! * Services are named entities providing the same interface.
//! * Instances are individual registrations of a program providing a
//!   service, each with a host, a port, tags, and a health status judged
//!   by the registry.
//! * Endpoints are the host/port pairs of the instances that currently
//!   match a resolution's filter, as reported to a listener.
//!
//! # Usage
//!
//! * The main interface for this crate is [resolver::RegistryResolver]:
//!   started once with a [resolver::Listener], it follows the registry's
//!   change feed and reports either a fresh endpoint set or an explicit
//!   unavailable condition until it is shut down.
//! * Resolvers are built from locator strings of the form
//!   `consul://host:port/service?dc=..&tag=..` by a
//!   [provider::ResolverProvider].
//! * Access to the registry is abstracted by [registry::RegistryClient];
//!   [registry::memory::MemoryRegistry] is an in-process implementation
//!   for embedding and tests, and the seam for plugging in a real
//!   transport is [registry::RegistryConnector].

// Public API
pub mod endpoint;
pub mod provider;
pub mod query;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod target;
