//! Construction of resolvers from locator strings.

use crate::registry::RegistryConnector;
use crate::resolver::RegistryResolver;
use crate::target::{ResolveTarget, TargetError, SCHEME};

use std::sync::Arc;

/// Validates locators and builds [RegistryResolver]s on behalf of a host
/// RPC framework.
///
/// A provider is a plain value holding the registry transport to build
/// resolvers on; it keeps no global state. Registering it with a
/// framework's resolver machinery is the embedder's concern.
pub struct ResolverProvider {
    connector: Arc<dyn RegistryConnector>,
}

impl ResolverProvider {
    pub fn new(connector: Arc<dyn RegistryConnector>) -> Self {
        Self { connector }
    }

    /// The locator scheme this provider serves.
    pub fn scheme(&self) -> &'static str {
        SCHEME
    }

    /// Relative precedence among a host framework's providers.
    pub fn priority(&self) -> u8 {
        5
    }

    /// Whether resolvers can currently be built at all.
    pub fn is_available(&self) -> bool {
        true
    }

    /// Validates `locator` and builds an unstarted resolver for it.
    ///
    /// All invalid-target conditions surface here, synchronously; a
    /// resolver this returns holds a well-formed target.
    pub fn new_resolver(&self, locator: &str) -> Result<RegistryResolver, TargetError> {
        let target = ResolveTarget::parse(locator)?;
        let client = self.connector.connect(target.registry());
        Ok(RegistryResolver::new(target, client))
    }
}
