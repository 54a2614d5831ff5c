//! Name to builder registries for balancing policies and resolvers.
//!
//! # Lifecycle
//!
//! Registries have a write phase and a read phase. They are populated by value
//! while the process starts up and are then either handed to a
//! [`ChannelBuilder`](crate::ChannelBuilder) or installed process-wide with
//! [`Registries::install`]. Once installed they can no longer be mutated, so
//! a lookup can never race with a registration.
//!
//! ```
//! use ginepro_balancer::{PassthroughBuilder, Registries};
//!
//! let mut registries = Registries::default();
//! registries.resolvers_mut().register(PassthroughBuilder);
//! registries.resolvers_mut().set_default_scheme("passthrough");
//! Registries::install(registries).expect("installed twice");
//!
//! assert!(Registries::global().resolvers().get("passthrough").is_some());
//! ```

use crate::balancer::BalancerBuilder;
use crate::resolver::passthrough::PASSTHROUGH_SCHEME;
use crate::resolver::{PassthroughBuilder, ResolverBuilder};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

static GLOBAL_REGISTRIES: OnceLock<Arc<Registries>> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("the process-wide registries have already been installed or read")]
    AlreadyInstalled,
}

/// Balancer builders keyed by their lowercased name.
#[derive(Default, Clone)]
pub struct BalancerRegistry {
    builders: HashMap<String, Arc<dyn BalancerBuilder>>,
}

impl BalancerRegistry {
    /// Register `builder` under its lowercased [`BalancerBuilder::name`].
    ///
    /// Registering a second builder with the same name replaces the first one.
    pub fn register<B: BalancerBuilder + 'static>(&mut self, builder: B) {
        self.register_arc(Arc::new(builder));
    }

    pub fn register_arc(&mut self, builder: Arc<dyn BalancerBuilder>) {
        let name = builder.name().to_lowercase();
        tracing::debug!(balancer = %name, "registering balancer builder");
        self.builders.insert(name, builder);
    }

    /// Look up a builder. The comparison is case-insensitive.
    pub fn get(&self, name: &str) -> Option<Arc<dyn BalancerBuilder>> {
        self.builders.get(&name.to_lowercase()).cloned()
    }

    #[doc(hidden)]
    pub fn unregister_for_testing(&mut self, name: &str) {
        self.builders.remove(&name.to_lowercase());
    }
}

impl fmt::Debug for BalancerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.builders.keys()).finish()
    }
}

/// Resolver builders keyed by their scheme, plus the scheme used for targets
/// that do not name a registered one.
#[derive(Clone)]
pub struct ResolverRegistry {
    builders: HashMap<String, Arc<dyn ResolverBuilder>>,
    default_scheme: String,
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self {
            builders: HashMap::new(),
            default_scheme: PASSTHROUGH_SCHEME.to_string(),
        }
    }
}

impl ResolverRegistry {
    /// Register `builder` under its [`ResolverBuilder::scheme`], as declared.
    ///
    /// Registering a second builder with the same scheme replaces the first one.
    pub fn register<B: ResolverBuilder + 'static>(&mut self, builder: B) {
        self.register_arc(Arc::new(builder));
    }

    pub fn register_arc(&mut self, builder: Arc<dyn ResolverBuilder>) {
        let scheme = builder.scheme().to_string();
        tracing::debug!(%scheme, "registering resolver builder");
        self.builders.insert(scheme, builder);
    }

    /// Look up a builder. The comparison is case-sensitive.
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.get(scheme).cloned()
    }

    /// The scheme applied to targets without a registered scheme. Defaults to `passthrough`.
    pub fn default_scheme(&self) -> &str {
        &self.default_scheme
    }

    pub fn set_default_scheme<T: Into<String>>(&mut self, scheme: T) {
        self.default_scheme = scheme.into();
    }

    #[doc(hidden)]
    pub fn unregister_for_testing(&mut self, scheme: &str) {
        self.builders.remove(scheme);
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("schemes", &self.builders.keys().collect::<Vec<_>>())
            .field("default_scheme", &self.default_scheme)
            .finish()
    }
}

/// The pair of registries a channel consults.
#[derive(Debug, Default, Clone)]
pub struct Registries {
    balancers: BalancerRegistry,
    resolvers: ResolverRegistry,
}

impl Registries {
    /// Registries with the built-in `passthrough` resolver registered.
    pub fn with_defaults() -> Self {
        let mut registries = Self::default();
        registries.resolvers.register(PassthroughBuilder);
        registries
    }

    pub fn balancers(&self) -> &BalancerRegistry {
        &self.balancers
    }

    pub fn balancers_mut(&mut self) -> &mut BalancerRegistry {
        &mut self.balancers
    }

    pub fn resolvers(&self) -> &ResolverRegistry {
        &self.resolvers
    }

    pub fn resolvers_mut(&mut self) -> &mut ResolverRegistry {
        &mut self.resolvers
    }

    /// Freeze `registries` as the process-wide registries.
    ///
    /// Fails if registries were already installed, or if [`Registries::global`]
    /// was called before: the write phase is over once anybody has read.
    pub fn install(registries: Registries) -> Result<(), RegistryError> {
        GLOBAL_REGISTRIES
            .set(Arc::new(registries))
            .map_err(|_| RegistryError::AlreadyInstalled)
    }

    /// The process-wide registries.
    ///
    /// If nothing was installed, [`Registries::with_defaults`] is installed on first access.
    pub fn global() -> Arc<Registries> {
        GLOBAL_REGISTRIES
            .get_or_init(|| Arc::new(Registries::with_defaults()))
            .clone()
    }
}
