//! The [`ClientConn`] handed to the resolver.
//!
//! Picks the service config to apply, derives the balancing policy from it and
//! forwards the result to the balancer task.

use super::balancer_wrapper::{Event, EventSender};
use crate::balancer::ClientConnState;
use crate::resolver::{ClientConn, ResolverState};
use crate::service_config::{ParseResult, ServiceConfig};
use crate::Registries;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub(crate) struct ResolverClientConn {
    pub(crate) events: EventSender,
    pub(crate) registries: Arc<Registries>,
    pub(crate) default_balancer: String,
    pub(crate) default_service_config: Arc<ServiceConfig>,
    pub(crate) disable_service_config: bool,
    // The last valid service config received from the resolver. Also serializes `update_state`.
    pub(crate) last_valid: Mutex<Option<Arc<ServiceConfig>>>,
    pub(crate) applied: watch::Sender<Arc<ServiceConfig>>,
}

impl ResolverClientConn {
    fn select_service_config(
        &self,
        last_valid: &mut Option<Arc<ServiceConfig>>,
        received: Option<&ParseResult>,
    ) -> Arc<ServiceConfig> {
        if self.disable_service_config {
            return self.default_service_config.clone();
        }

        match received {
            None => self.default_service_config.clone(),
            Some(Ok(config)) => {
                *last_valid = Some(config.clone());
                config.clone()
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "resolver returned an invalid service config, keeping the previous one");
                last_valid
                    .clone()
                    .unwrap_or_else(|| self.default_service_config.clone())
            }
        }
    }
}

impl ClientConn for ResolverClientConn {
    #[tracing::instrument(level = "debug", skip(self, state), fields(addresses = state.addresses.len()))]
    fn update_state(&self, state: ResolverState) {
        // Held until the balancer event is queued, so concurrent updates publish
        // their config and queue their event in the same order.
        let mut last_valid = self
            .last_valid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let service_config =
            self.select_service_config(&mut last_valid, state.service_config.as_ref());

        let (balancer_name, balancer_config) = match &service_config.lb_config {
            Some(lb_config) => (lb_config.name.clone(), lb_config.config.clone()),
            None => (self.default_balancer.clone(), None),
        };
        self.applied.send_replace(service_config);

        let _ = self.events.send(Event::ClientConnState {
            balancer_name,
            state: ClientConnState {
                resolver_state: state,
                balancer_config,
            },
        });
    }

    fn report_error(&self, err: anyhow::Error) {
        let _ = self.events.send(Event::ResolverError(Arc::new(err)));
    }

    fn parse_service_config(&self, service_config_json: &str) -> ParseResult {
        ServiceConfig::parse(service_config_json, self.registries.balancers()).map(Arc::new)
    }
}
