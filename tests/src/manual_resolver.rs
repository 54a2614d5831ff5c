use ginepro_balancer::resolver::{
    Address, BuildOptions, ClientConn, ResolveNowOptions, Resolver, ResolverBuilder,
    ResolverState, Target,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
struct Shared {
    cc: Mutex<Option<Arc<dyn ClientConn>>>,
    initial: Mutex<Option<(Vec<Address>, Option<String>)>>,
    resolve_now_calls: AtomicUsize,
    resolve_now_requested: Notify,
    closed: AtomicBool,
}

/// A resolver whose updates are pushed by the test.
///
/// Register a clone in the [`Registries`](ginepro_balancer::Registries) of the
/// channel under test and keep the other one to drive it.
#[derive(Clone)]
pub struct ManualResolver {
    scheme: String,
    shared: Arc<Shared>,
}

impl ManualResolver {
    pub fn new<T: Into<String>>(scheme: T) -> Self {
        Self {
            scheme: scheme.into(),
            shared: Arc::default(),
        }
    }

    /// State pushed as soon as the resolver is built.
    pub fn with_initial_state(self, addrs: &[&str], service_config: Option<&str>) -> Self {
        *self.shared.initial.lock().unwrap() = Some((
            addresses(addrs),
            service_config.map(str::to_string),
        ));
        self
    }

    /// Push a new state. The service config is parsed by the channel.
    pub fn update_state(&self, addrs: &[&str], service_config: Option<&str>) {
        let cc = self.client_conn();
        push(cc.as_ref(), addresses(addrs), service_config);
    }

    pub fn report_error(&self, message: &str) {
        self.client_conn().report_error(anyhow::anyhow!(message.to_string()));
    }

    pub fn resolve_now_calls(&self) -> usize {
        self.shared.resolve_now_calls.load(Ordering::SeqCst)
    }

    /// Wait for the next `resolve_now` request.
    pub async fn resolve_now_requested(&self) {
        self.shared.resolve_now_requested.notified().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn client_conn(&self) -> Arc<dyn ClientConn> {
        self.shared
            .cc
            .lock()
            .unwrap()
            .clone()
            .expect("the resolver has not been built yet")
    }
}

impl ResolverBuilder for ManualResolver {
    fn build(
        &self,
        _target: &Target,
        cc: Arc<dyn ClientConn>,
        _opts: BuildOptions,
    ) -> Result<Box<dyn Resolver>, anyhow::Error> {
        *self.shared.cc.lock().unwrap() = Some(cc.clone());
        if let Some((addrs, service_config)) = self.shared.initial.lock().unwrap().take() {
            push(cc.as_ref(), addrs, service_config.as_deref());
        }
        Ok(Box::new(self.clone()))
    }

    fn scheme(&self) -> &str {
        &self.scheme
    }
}

impl Resolver for ManualResolver {
    fn resolve_now(&self, _opts: ResolveNowOptions) {
        self.shared.resolve_now_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.resolve_now_requested.notify_one();
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

fn addresses(addrs: &[&str]) -> Vec<Address> {
    addrs.iter().map(|addr| Address::new(*addr)).collect()
}

fn push(cc: &dyn ClientConn, addresses: Vec<Address>, service_config: Option<&str>) {
    tracing::info!(?addresses, ?service_config, "pushing resolver state");
    cc.update_state(ResolverState {
        addresses,
        service_config: service_config.map(|json| cc.parse_service_config(json)),
        ..Default::default()
    });
}
