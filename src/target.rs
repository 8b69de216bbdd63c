//! What to resolve: registry endpoint, service name, and filters.
//!
//! A [ResolveTarget] is built once from a locator of the form
//! `consul://<host>[:<port>]/<service>[?dc=<dc>][&tag=<tag>]*` and never
//! mutated afterwards. Validation happens here, at construction: a resolver
//! handed a target can assume every field is well formed.

use crate::query;
use crate::service;

use thiserror::Error;
use url::Url;

/// The locator scheme handled by this crate.
pub const SCHEME: &str = "consul";

/// Registry endpoint used when a target does not name one.
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8383;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("locator '{locator}' is not a valid URI")]
    Malformed {
        locator: String,
        #[source]
        source: url::ParseError,
    },

    #[error("locator scheme must be '{SCHEME}', got '{scheme}'")]
    UnexpectedScheme { scheme: String },

    #[error("locator '{locator}' does not name a registry host")]
    MissingHost { locator: String },

    #[error("locator '{locator}' does not name a service")]
    MissingService { locator: String },

    #[error("only one datacenter may be specified, got {count}")]
    MultipleDatacenters { count: usize },
}

/// Host and port of the registry itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryAddr {
    pub host: String,
    pub port: u16,
}

impl RegistryAddr {
    pub fn new(host: impl ToString, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl Default for RegistryAddr {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl std::fmt::Display for RegistryAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An immutable description of a resolution: which registry to ask, which
/// service to watch, and how to scope the set of matching instances.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveTarget {
    registry: RegistryAddr,
    service: service::Name,
    datacenter: Option<String>,
    tags: Vec<String>,
}

impl ResolveTarget {
    /// Builds a target from already-validated fields.
    ///
    /// An empty `tags` means "no tag filter"; a non-empty one requires every
    /// listed tag on a matching instance.
    pub fn new(
        registry: RegistryAddr,
        service: service::Name,
        datacenter: Option<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            registry,
            service,
            datacenter,
            tags,
        }
    }

    /// Parses and validates a locator string.
    ///
    /// The scheme is matched case-insensitively. The service name is
    /// everything after the leading `/` of the path and must be non-empty.
    /// A missing port falls back to [DEFAULT_PORT].
    pub fn parse(locator: &str) -> Result<Self, TargetError> {
        let url = Url::parse(locator).map_err(|source| TargetError::Malformed {
            locator: locator.to_string(),
            source,
        })?;

        // `url` normalizes schemes to lowercase, which gives us the
        // case-insensitive match for free.
        if url.scheme() != SCHEME {
            return Err(TargetError::UnexpectedScheme {
                scheme: url.scheme().to_string(),
            });
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host,
            _ => {
                return Err(TargetError::MissingHost {
                    locator: locator.to_string(),
                })
            }
        };
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let service = match url.path().strip_prefix('/') {
            Some(name) if !name.is_empty() => service::Name::from(name),
            _ => {
                return Err(TargetError::MissingService {
                    locator: locator.to_string(),
                })
            }
        };

        let params = query::split_query(url.query());
        if params.datacenters.len() > 1 {
            return Err(TargetError::MultipleDatacenters {
                count: params.datacenters.len(),
            });
        }
        let datacenter = params.datacenters.into_iter().next();

        Ok(Self {
            registry: RegistryAddr::new(host, port),
            service,
            datacenter,
            tags: params.tags,
        })
    }

    pub fn registry(&self) -> &RegistryAddr {
        &self.registry
    }

    pub fn service(&self) -> &service::Name {
        &self.service
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}
