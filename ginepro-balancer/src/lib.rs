//! `ginepro-balancer` is the extensibility layer of a gRPC client channel: it lets
//! the client discover backend addresses (name resolution) and choose which
//! backend connection serves each call (load balancing), both pluggable by name
//! and independent from the transport.
//!
//! - [`resolver`]: a [`Resolver`](resolver::Resolver) watches a target and pushes
//!   addresses and a service config to the channel.
//! - [`balancer`]: a [`Balancer`](balancer::Balancer) turns addresses into
//!   [`SubConn`](balancer::SubConn)s and publishes a [`Picker`](balancer::Picker)
//!   that routes every call.
//! - [`service_config`]: parsing of the JSON service config, including the
//!   selection of the balancing policy.
//! - [`Channel`]: the engine driving all of the above over a
//!   [`Connector`](subconn::Connector) supplied by the transport.
//!
//! Policies and resolvers are looked up by name in [`Registries`].
//!
//! # Plugging in a resolver
//!
//! ```rust
//! use ginepro_balancer::resolver::{
//!     Address, BuildOptions, ClientConn, ResolveNowOptions, Resolver, ResolverBuilder,
//!     ResolverState, Target,
//! };
//! use ginepro_balancer::Registries;
//! use std::sync::Arc;
//!
//! // Resolves every target to the same two backends.
//! struct StaticResolver;
//!
//! impl ResolverBuilder for StaticResolver {
//!     fn build(
//!         &self,
//!         _target: &Target,
//!         cc: Arc<dyn ClientConn>,
//!         _opts: BuildOptions,
//!     ) -> Result<Box<dyn Resolver>, anyhow::Error> {
//!         cc.update_state(ResolverState {
//!             addresses: vec![Address::new("10.0.0.1:5000"), Address::new("10.0.0.2:5000")],
//!             ..Default::default()
//!         });
//!         Ok(Box::new(StaticResolver))
//!     }
//!
//!     fn scheme(&self) -> &str {
//!         "static"
//!     }
//! }
//!
//! impl Resolver for StaticResolver {
//!     fn resolve_now(&self, _opts: ResolveNowOptions) {}
//!     fn close(&self) {}
//! }
//!
//! let mut registries = Registries::with_defaults();
//! registries.resolvers_mut().register(StaticResolver);
//!
//! let target = Target::parse("static:///my.service", registries.resolvers());
//! assert_eq!(target.scheme, "static");
//! assert_eq!(target.endpoint, "my.service");
//! ```

mod attributes;
mod backoff;
pub mod balancer;
mod channel;
mod connectivity;
mod registry;
pub mod resolver;
pub mod service_config;
pub mod subconn;

pub use attributes::Attributes;
pub use backoff::BackoffConfig;
pub use channel::{
    CallOptions, Channel, ChannelBuilder, ChannelError, PickedCall, DEFAULT_BALANCER,
};
pub use connectivity::ConnectivityState;
pub use registry::{BalancerRegistry, Registries, RegistryError, ResolverRegistry};
pub use resolver::PassthroughBuilder;
