//! A client channel: resolves a target, runs a balancing policy over the
//! resolved addresses and routes each call to a ready SubConn.
//!
//! ```rust,no_run
//! # use ginepro_balancer::{Channel, CallOptions, Registries};
//! # use ginepro_balancer::balancer::{PickInfo, DoneInfo};
//! # use ginepro_balancer::subconn::Connector;
//! # use std::sync::Arc;
//! # async fn run(registries: Registries, connector: Arc<dyn Connector>) -> Result<(), Box<dyn std::error::Error>> {
//! let channel = Channel::builder("passthrough:///10.0.0.1:5000")
//!     .registries(registries)
//!     .connector(connector)
//!     .build()?;
//!
//! let call = channel
//!     .pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default())
//!     .await?;
//! // ... send the call on `call.transport()` ...
//! call.finish(DoneInfo::default());
//! # Ok(())
//! # }
//! ```

mod balancer_wrapper;
mod error;
mod picker_wrapper;
mod resolver_wrapper;

pub use error::ChannelError;

use crate::balancer::{DoneCallback, DoneInfo, PickInfo, SubConn};
use crate::resolver::{BuildOptions, Target};
use crate::service_config::ServiceConfig;
use crate::subconn::{Connector, SubConnConfig, Transport};
use crate::{BackoffConfig, ConnectivityState, Registries};
use balancer_wrapper::{BalancerTask, Engine, Event};
use picker_wrapper::PickerWrapper;
use resolver_wrapper::ResolverClientConn;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tonic::Status;

/// The policy used when the service config does not name one.
pub const DEFAULT_BALANCER: &str = "pick_first";

/// Builder to configure and create a [`Channel`].
pub struct ChannelBuilder {
    target: String,
    registries: Option<Arc<Registries>>,
    connector: Option<Arc<dyn Connector>>,
    default_balancer: Option<String>,
    connect_backoff: Option<BackoffConfig>,
    min_connect_timeout: Option<Duration>,
    resolve_backoff: Option<BackoffConfig>,
    default_service_config: Option<String>,
    disable_service_config: bool,
}

impl ChannelBuilder {
    /// Use `registries` instead of the process-wide [`Registries::global`].
    pub fn registries(self, registries: Registries) -> ChannelBuilder {
        Self {
            registries: Some(Arc::new(registries)),
            ..self
        }
    }

    /// Set the [`Connector`] SubConns use to establish transports. Required.
    pub fn connector(self, connector: Arc<dyn Connector>) -> ChannelBuilder {
        Self {
            connector: Some(connector),
            ..self
        }
    }

    /// Set the balancing policy used when the service config does not name one.
    ///
    /// Defaults to [`DEFAULT_BALANCER`], which must be registered.
    pub fn default_balancer<T: Into<String>>(self, name: T) -> ChannelBuilder {
        Self {
            default_balancer: Some(name.into()),
            ..self
        }
    }

    /// Set the backoff applied by SubConns between two passes over their addresses.
    pub fn connect_backoff(self, backoff: BackoffConfig) -> ChannelBuilder {
        Self {
            connect_backoff: Some(backoff),
            ..self
        }
    }

    /// Set the time allowed for a single connection attempt. Defaults to 20 seconds.
    pub fn min_connect_timeout(self, timeout: Duration) -> ChannelBuilder {
        Self {
            min_connect_timeout: Some(timeout),
            ..self
        }
    }

    /// Set the backoff between re-resolutions after a resolver error or a
    /// resolver state the balancer rejected.
    pub fn resolve_backoff(self, backoff: BackoffConfig) -> ChannelBuilder {
        Self {
            resolve_backoff: Some(backoff),
            ..self
        }
    }

    /// Set the JSON service config used when the resolver does not provide a
    /// valid one.
    pub fn default_service_config<T: Into<String>>(self, json: T) -> ChannelBuilder {
        Self {
            default_service_config: Some(json.into()),
            ..self
        }
    }

    /// Ignore service configs provided by the resolver.
    pub fn disable_service_config(self) -> ChannelBuilder {
        Self {
            disable_service_config: true,
            ..self
        }
    }

    /// Construct the [`Channel`] and start resolving its target.
    ///
    /// Must be called from within a tokio runtime.
    #[tracing::instrument(level = "debug", skip(self), fields(target = %self.target))]
    pub fn build(self) -> Result<Channel, ChannelError> {
        let registries = self.registries.unwrap_or_else(Registries::global);
        let connector = self.connector.ok_or(ChannelError::MissingConnector)?;

        let default_balancer = self
            .default_balancer
            .unwrap_or_else(|| DEFAULT_BALANCER.to_string());
        if registries.balancers().get(&default_balancer).is_none() {
            return Err(ChannelError::UnknownBalancer(default_balancer));
        }

        let default_service_config = match &self.default_service_config {
            Some(json) => ServiceConfig::parse(json, registries.balancers())
                .map_err(ChannelError::DefaultServiceConfig)?,
            None => ServiceConfig::default(),
        };
        let default_service_config = Arc::new(default_service_config);

        let target = Target::parse(&self.target, registries.resolvers());
        let resolver_builder = registries
            .resolvers()
            .get(&target.scheme)
            .ok_or_else(|| ChannelError::UnknownScheme(target.scheme.clone()))?;

        let (events, event_rx) = mpsc::unbounded_channel();
        let picker = Arc::new(PickerWrapper::new());
        let (applied, service_config) = watch::channel(default_service_config.clone());

        let resolver_cc = Arc::new(ResolverClientConn {
            events: events.clone(),
            registries: registries.clone(),
            default_balancer: default_balancer.clone(),
            default_service_config,
            disable_service_config: self.disable_service_config,
            last_valid: Mutex::new(None),
            applied,
        });
        let resolver = resolver_builder
            .build(
                &target,
                resolver_cc,
                BuildOptions {
                    disable_service_config: self.disable_service_config,
                },
            )
            .map_err(|reason| ChannelError::Resolver {
                target: self.target.clone(),
                reason,
            })?;

        let engine = Engine {
            target: target.clone(),
            registries,
            connector,
            sub_conn_config: SubConnConfig {
                backoff: self.connect_backoff.unwrap_or_default(),
                min_connect_timeout: self
                    .min_connect_timeout
                    .unwrap_or(SubConnConfig::default().min_connect_timeout),
            },
            resolve_backoff: self.resolve_backoff.unwrap_or_default(),
            default_balancer,
            picker: picker.clone(),
            events: events.clone(),
        };
        BalancerTask::new(engine, event_rx, resolver).spawn();
        tracing::debug!(scheme = %target.scheme, "channel started");

        Ok(Channel {
            inner: Arc::new(Inner {
                target,
                picker,
                service_config,
                events,
            }),
        })
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Wait for a ready SubConn instead of failing on transient errors.
    /// Overrides the method config when set.
    pub wait_for_ready: Option<bool>,
    /// Give up picking after this long. Combined with the method config timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn wait_for_ready(self, wait_for_ready: bool) -> Self {
        Self {
            wait_for_ready: Some(wait_for_ready),
            ..self
        }
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }
}

/// A client channel. Cheap to clone; the channel shuts down when the last
/// clone is dropped or [`Channel::close`] is called.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    target: Target,
    picker: Arc<PickerWrapper>,
    service_config: watch::Receiver<Arc<ServiceConfig>>,
    events: mpsc::UnboundedSender<Event>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Close);
    }
}

impl Channel {
    /// Start configuring a [`Channel`] for `target`, e.g. `dns:///my.service:5000`.
    pub fn builder<T: Into<String>>(target: T) -> ChannelBuilder {
        ChannelBuilder {
            target: target.into(),
            registries: None,
            connector: None,
            default_balancer: None,
            connect_backoff: None,
            min_connect_timeout: None,
            resolve_backoff: None,
            default_service_config: None,
            disable_service_config: false,
        }
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    /// The aggregated connectivity state published by the balancer.
    pub fn state(&self) -> ConnectivityState {
        self.inner.picker.connectivity_state()
    }

    /// Wait until the connectivity state differs from `source` and return the new state.
    pub async fn wait_for_state_change(&self, source: ConnectivityState) -> ConnectivityState {
        self.inner.picker.wait_for_state_change(source).await
    }

    /// The service config currently applied.
    pub fn service_config(&self) -> Arc<ServiceConfig> {
        self.inner.service_config.borrow().clone()
    }

    /// Choose the SubConn for a call.
    ///
    /// Waits for a picker that routes the call to a ready SubConn, within the
    /// call timeout and the method config timeout, whichever is shorter.
    #[tracing::instrument(level = "debug", skip(self, info, opts), fields(method = %info.full_method_name))]
    pub async fn pick(&self, info: PickInfo, opts: CallOptions) -> Result<PickedCall, Status> {
        let service_config = self.service_config();
        let method_config = service_config.method_config(&info.full_method_name);

        let wait_for_ready = opts
            .wait_for_ready
            .or_else(|| method_config.and_then(|config| config.wait_for_ready))
            .unwrap_or(false);
        let timeout = match (opts.timeout, method_config.and_then(|config| config.timeout)) {
            (Some(call), Some(method)) => Some(call.min(method)),
            (call, method) => call.or(method),
        };

        let pick = self.inner.picker.pick(&info, wait_for_ready);
        let pick = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, pick)
                .await
                .map_err(|_| Status::deadline_exceeded("timed out waiting for a ready connection"))??,
            None => pick.await?,
        };

        Ok(PickedCall {
            sub_conn: pick.sub_conn,
            transport: pick.transport,
            done: pick.done,
        })
    }

    /// Shut the channel down: the balancer and resolver are closed, every
    /// SubConn is shut down and pending picks fail.
    pub fn close(&self) {
        let _ = self.inner.events.send(Event::Close);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.inner.target)
            .field("state", &self.state())
            .finish()
    }
}

/// A call routed to a SubConn.
///
/// Report the outcome with [`PickedCall::finish`]. Dropping it unfinished
/// reports the call as cancelled.
pub struct PickedCall {
    sub_conn: Arc<dyn SubConn>,
    transport: Arc<dyn Transport>,
    done: Option<DoneCallback>,
}

impl PickedCall {
    pub fn sub_conn(&self) -> &Arc<dyn SubConn> {
        &self.sub_conn
    }

    /// The transport to send the call on.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Report the outcome of the call to the balancer.
    pub fn finish(mut self, info: DoneInfo) {
        if let Some(done) = self.done.take() {
            done(info);
        }
    }
}

impl Drop for PickedCall {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            done(DoneInfo {
                err: Some(Status::cancelled("call dropped before completion")),
                ..Default::default()
            });
        }
    }
}

impl fmt::Debug for PickedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickedCall")
            .field("sub_conn", &self.sub_conn.id())
            .field("finished", &self.done.is_none())
            .finish()
    }
}

const _: () = {
    const fn assert_is_send<T: Send>() {}
    assert_is_send::<ChannelBuilder>();
    assert_is_send::<Channel>();
    assert_is_send::<PickedCall>();
};
