//! The task that owns the active balancer.
//!
//! Every input of a balancer (resolver updates, resolver errors, SubConn state
//! changes) is queued as an [`Event`] and applied by a single task, so balancer
//! methods never run concurrently and never re-enter each other.

use super::picker_wrapper::PickerWrapper;
use crate::balancer::{
    Balancer, BalancerBuilder, BalancerError, BuildOptions, ClientConn, ClientConnState,
    NewSubConnOptions, State, SubConn, SubConnId, SubConnState,
};
use crate::resolver::{Address, ResolveNowOptions, Resolver, Target};
use crate::subconn::{Connector, ManagedSubConn, StateListener, SubConnConfig};
use crate::{BackoffConfig, ConnectivityState, Registries};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

pub(crate) enum Event {
    ClientConnState {
        balancer_name: String,
        state: ClientConnState,
    },
    ResolverError(Arc<anyhow::Error>),
    SubConnState {
        id: SubConnId,
        state: SubConnState,
    },
    ResolveNow,
    // The re-resolution backoff of the timer with this generation elapsed.
    ResolveTimer(u64),
    Close,
}

pub(crate) type EventSender = mpsc::UnboundedSender<Event>;

/// What the balancer task needs from the channel.
pub(crate) struct Engine {
    pub(crate) target: Target,
    pub(crate) registries: Arc<Registries>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) sub_conn_config: SubConnConfig,
    pub(crate) resolve_backoff: BackoffConfig,
    pub(crate) default_balancer: String,
    pub(crate) picker: Arc<PickerWrapper>,
    pub(crate) events: EventSender,
}

struct ActiveBalancer {
    name: String,
    balancer: Box<dyn Balancer>,
    cc: Arc<BalancerClientConn>,
}

pub(crate) struct BalancerTask {
    engine: Engine,
    events: mpsc::UnboundedReceiver<Event>,
    resolver: Box<dyn Resolver>,
    current: Option<ActiveBalancer>,
    resolve_retries: u32,
    resolve_timer: Option<JoinHandle<()>>,
    // Bumped for every scheduled timer, so events of cancelled timers can be told apart.
    resolve_generation: u64,
}

impl BalancerTask {
    pub(crate) fn new(
        engine: Engine,
        events: mpsc::UnboundedReceiver<Event>,
        resolver: Box<dyn Resolver>,
    ) -> Self {
        Self {
            engine,
            events,
            resolver,
            current: None,
            resolve_retries: 0,
            resolve_timer: None,
            resolve_generation: 0,
        }
    }

    pub(crate) fn spawn(self) {
        let span = tracing::debug_span!("balancer", target = %self.engine.target);
        tokio::spawn(self.run().instrument(span));
    }

    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            if let ControlFlow::Break(()) = self.handle(event) {
                break;
            }
        }
        self.close();
    }

    fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::ClientConnState {
                balancer_name,
                state,
            } => self.update_client_conn_state(&balancer_name, state),
            Event::ResolverError(err) => self.resolver_error(err),
            Event::SubConnState { id, state } => self.update_sub_conn_state(id, state),
            Event::ResolveNow => self.resolver.resolve_now(ResolveNowOptions::default()),
            Event::ResolveTimer(generation) => {
                if self.resolve_timer.is_none() || generation != self.resolve_generation {
                    tracing::trace!(generation, "ignoring cancelled re-resolution timer");
                    return ControlFlow::Continue(());
                }
                self.resolve_timer = None;
                self.resolver.resolve_now(ResolveNowOptions::default());
            }
            Event::Close => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn update_client_conn_state(&mut self, balancer_name: &str, state: ClientConnState) {
        let active = match self.switch_to(balancer_name) {
            Some(active) => active,
            None => return,
        };

        match active.balancer.update_client_conn_state(state) {
            Ok(()) => self.cancel_resolve_timer(),
            Err(BalancerError::BadResolverState) => {
                tracing::debug!("balancer rejected the resolver state");
                self.schedule_resolve_now();
            }
            Err(err) => {
                tracing::warn!(error = %err, "ignoring balancer error");
            }
        }
    }

    fn resolver_error(&mut self, err: Arc<anyhow::Error>) {
        tracing::debug!(error = %err, "resolver reported an error");
        // A resolver error may arrive before any state, in which case the
        // default policy handles it.
        if self.current.is_none() {
            let default_balancer = self.engine.default_balancer.clone();
            self.switch_to(&default_balancer);
        }
        if let Some(active) = self.current.as_mut() {
            active.balancer.resolver_error(err);
        }
        self.schedule_resolve_now();
    }

    fn update_sub_conn_state(&mut self, id: SubConnId, state: SubConnState) {
        let active = match self.current.as_mut() {
            Some(active) => active,
            None => return,
        };
        let sub_conn = match active.cc.sub_conn(id) {
            Some(sub_conn) => sub_conn,
            // Owned by a balancer that was closed since.
            None => return,
        };

        let shutdown = state.connectivity_state == ConnectivityState::Shutdown;
        if !shutdown && sub_conn.state() == ConnectivityState::Shutdown {
            // Reported before the balancer removed it.
            return;
        }
        if shutdown {
            active.cc.forget(id);
        }

        let sub_conn: Arc<dyn SubConn> = sub_conn;
        active.balancer.update_sub_conn_state(&sub_conn, state);
    }

    // Make `name` the active policy, closing the previous one if it differs.
    fn switch_to(&mut self, name: &str) -> Option<&mut ActiveBalancer> {
        let same = self
            .current
            .as_ref()
            .map_or(false, |active| active.name.eq_ignore_ascii_case(name));

        if !same {
            let builder = match self.engine.registries.balancers().get(name) {
                Some(builder) => builder,
                None => {
                    tracing::error!(balancer = %name, "balancing policy is not registered");
                    return None;
                }
            };
            if let Some(previous) = self.current.take() {
                tracing::debug!(from = %previous.name, to = %name, "switching balancing policy");
                close_balancer(previous);
            }
            self.current = Some(self.build_balancer(name, builder));
        }

        self.current.as_mut()
    }

    fn build_balancer(&self, name: &str, builder: Arc<dyn BalancerBuilder>) -> ActiveBalancer {
        tracing::debug!(balancer = %name, "building balancer");
        let cc = Arc::new(BalancerClientConn {
            target: self.engine.target.clone(),
            connector: self.engine.connector.clone(),
            sub_conn_config: self.engine.sub_conn_config.clone(),
            picker: self.engine.picker.clone(),
            events: self.engine.events.clone(),
            sub_conns: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let balancer = builder.build(
            cc.clone(),
            BuildOptions {
                target: self.engine.target.clone(),
            },
        );
        ActiveBalancer {
            name: name.to_string(),
            balancer,
            cc,
        }
    }

    fn schedule_resolve_now(&mut self) {
        if self.resolve_timer.is_some() {
            return;
        }

        let delay = self.engine.resolve_backoff.backoff(self.resolve_retries);
        self.resolve_retries = self.resolve_retries.saturating_add(1);
        self.resolve_generation = self.resolve_generation.wrapping_add(1);
        let generation = self.resolve_generation;
        tracing::debug!(?delay, generation, "scheduling re-resolution");

        let events = self.engine.events.clone();
        self.resolve_timer = Some(tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(Event::ResolveTimer(generation));
            }
            .in_current_span(),
        ));
    }

    // The resolver state was accepted: start the backoff over.
    fn cancel_resolve_timer(&mut self) {
        self.resolve_retries = 0;
        if let Some(timer) = self.resolve_timer.take() {
            timer.abort();
        }
    }

    fn close(&mut self) {
        tracing::debug!("closing channel");
        if let Some(timer) = self.resolve_timer.take() {
            timer.abort();
        }
        if let Some(active) = self.current.take() {
            close_balancer(active);
        }
        self.resolver.close();
        self.engine.picker.close();
    }
}

fn close_balancer(mut active: ActiveBalancer) {
    active.balancer.close();
    active.cc.close();
}

/// The [`ClientConn`] handed to one balancer instance.
///
/// Once the balancer is closed its SubConns are shut down and anything it
/// publishes is ignored.
pub(crate) struct BalancerClientConn {
    target: Target,
    connector: Arc<dyn Connector>,
    sub_conn_config: SubConnConfig,
    picker: Arc<PickerWrapper>,
    events: EventSender,
    sub_conns: Mutex<HashMap<SubConnId, Arc<ManagedSubConn>>>,
    closed: AtomicBool,
}

impl BalancerClientConn {
    fn sub_conn(&self, id: SubConnId) -> Option<Arc<ManagedSubConn>> {
        self.lock_sub_conns().get(&id).cloned()
    }

    fn forget(&self, id: SubConnId) {
        self.lock_sub_conns().remove(&id);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for (_, sub_conn) in self.lock_sub_conns().drain() {
            sub_conn.shutdown();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_sub_conns(&self) -> std::sync::MutexGuard<'_, HashMap<SubConnId, Arc<ManagedSubConn>>> {
        // Only locked for map operations, which cannot panic halfway through.
        self.sub_conns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ClientConn for BalancerClientConn {
    fn new_sub_conn(
        &self,
        addresses: Vec<Address>,
        opts: NewSubConnOptions,
    ) -> Result<Arc<dyn SubConn>, BalancerError> {
        if self.is_closed() {
            return Err(BalancerError::ChannelClosed);
        }

        let events = self.events.clone();
        let listener: StateListener = Arc::new(move |id: SubConnId, state: SubConnState| {
            let _ = events.send(Event::SubConnState { id, state });
        });
        let sub_conn = ManagedSubConn::new(
            addresses,
            self.connector.clone(),
            self.sub_conn_config.clone(),
            listener,
        );
        tracing::debug!(
            sub_conn = %sub_conn.id(),
            health_check = opts.health_check_enabled,
            "created SubConn"
        );

        self.lock_sub_conns().insert(sub_conn.id(), sub_conn.clone());
        Ok(sub_conn)
    }

    fn remove_sub_conn(&self, sub_conn: &Arc<dyn SubConn>) {
        let id = sub_conn.id();
        let managed = match self.sub_conn(id) {
            Some(managed) => managed,
            None => {
                tracing::debug!(sub_conn = %id, "removing unknown SubConn");
                return;
            }
        };
        if managed.state() == ConnectivityState::Shutdown {
            return;
        }

        tracing::debug!(sub_conn = %id, "removing SubConn");
        managed.shutdown();
        let _ = self.events.send(Event::SubConnState {
            id,
            state: SubConnState::new(ConnectivityState::Shutdown),
        });
    }

    fn update_state(&self, state: State) {
        if self.is_closed() {
            return;
        }
        self.picker.update(state);
    }

    fn resolve_now(&self, _opts: ResolveNowOptions) {
        if self.is_closed() {
            return;
        }
        let _ = self.events.send(Event::ResolveNow);
    }

    fn target(&self) -> String {
        self.target.to_string()
    }
}
