//! The `passthrough` scheme: the target endpoint is handed to the balancer as a single address.

use super::{
    Address, BuildOptions, ClientConn, ResolveNowOptions, Resolver, ResolverBuilder,
    ResolverState, Target,
};
use std::sync::Arc;

pub(crate) const PASSTHROUGH_SCHEME: &str = "passthrough";

/// Builds resolvers that never resolve anything and publish the endpoint verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughBuilder;

impl ResolverBuilder for PassthroughBuilder {
    fn build(
        &self,
        target: &Target,
        cc: Arc<dyn ClientConn>,
        _opts: BuildOptions,
    ) -> Result<Box<dyn Resolver>, anyhow::Error> {
        let resolver = PassthroughResolver {
            endpoint: target.endpoint.clone(),
            cc,
        };
        resolver.publish();
        Ok(Box::new(resolver))
    }

    fn scheme(&self) -> &str {
        PASSTHROUGH_SCHEME
    }
}

struct PassthroughResolver {
    endpoint: String,
    cc: Arc<dyn ClientConn>,
}

impl PassthroughResolver {
    fn publish(&self) {
        self.cc.update_state(ResolverState {
            addresses: vec![Address::new(self.endpoint.clone())],
            ..Default::default()
        });
    }
}

impl Resolver for PassthroughResolver {
    fn resolve_now(&self, _opts: ResolveNowOptions) {}

    fn close(&self) {}
}
