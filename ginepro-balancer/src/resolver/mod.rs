//! Name resolution contracts.
//!
//! A [`Resolver`] watches a [`Target`] and pushes the resolved addresses and the
//! service config to the channel through the [`ClientConn`] it was built with.
//! Resolvers are looked up by scheme in the [`ResolverRegistry`](crate::ResolverRegistry).

mod address;
pub(crate) mod passthrough;
mod target;

#[allow(deprecated)]
pub use address::AddressType;
pub use address::Address;
pub use passthrough::PassthroughBuilder;
pub use target::Target;

use crate::service_config::ParseResult;
use crate::Attributes;
use std::sync::Arc;

/// The state of a resolver relevant to the channel.
#[derive(Debug, Default)]
pub struct ResolverState {
    /// The latest set of resolved addresses for the target.
    pub addresses: Vec<Address>,
    /// The result of parsing the latest service config.
    ///
    /// `None` means the resolver does not provide service configs, or none was found.
    pub service_config: Option<ParseResult>,
    /// Arbitrary data for the balancing policy.
    pub attributes: Attributes,
}

/// Additional information for [`ResolverBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Whether the resolver should skip fetching service config data.
    pub disable_service_config: bool,
}

/// Additional information for [`Resolver::resolve_now`].
#[derive(Debug, Clone, Default)]
pub struct ResolveNowOptions {}

/// The callbacks a [`Resolver`] uses to notify the channel.
pub trait ClientConn: Send + Sync {
    /// Replace the channel's view of the resolver state.
    fn update_state(&self, state: ResolverState);

    /// Tell the channel the resolver hit an error. The channel forwards it to the
    /// balancer and asks for re-resolution with an exponential backoff.
    fn report_error(&self, err: anyhow::Error);

    /// Parse a JSON service config against the balancing policies known to the channel.
    fn parse_service_config(&self, service_config_json: &str) -> ParseResult;
}

/// Builds resolvers for one scheme.
pub trait ResolverBuilder: Send + Sync {
    /// Build a resolver for `target`. Called synchronously while the channel is
    /// being built; an error fails the channel construction.
    fn build(
        &self,
        target: &Target,
        cc: Arc<dyn ClientConn>,
        opts: BuildOptions,
    ) -> Result<Box<dyn Resolver>, anyhow::Error>;

    /// The scheme this builder handles. Matched case-sensitively.
    fn scheme(&self) -> &str;
}

/// Watches a target for address and service config updates.
pub trait Resolver: Send + Sync {
    /// A hint to resolve the target again. May be ignored, and may be called concurrently.
    fn resolve_now(&self, opts: ResolveNowOptions);

    fn close(&self);
}
