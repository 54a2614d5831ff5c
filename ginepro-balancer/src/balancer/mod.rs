//! Load balancing contracts.
//!
//! A [`Balancer`] receives resolved addresses from the channel, manages
//! [`SubConn`]s through its [`ClientConn`], aggregates their connectivity and
//! publishes a [`Picker`] that routes each call to one SubConn.
//!
//! All [`Balancer`] methods are invoked from a single task, one at a time; they
//! take `&mut self` and must not block. [`Picker::pick`] is the exception: it is
//! called concurrently by every outgoing call, so a picker is an immutable
//! snapshot of the balancer state at the time it was published.

mod error;
mod evaluator;
mod picker;

pub use error::BalancerError;
pub use evaluator::ConnectivityStateEvaluator;
pub use picker::{
    DoneCallback, DoneInfo, ErrorPicker, PickError, PickErrorKind, PickInfo, PickResult, Picker,
};

use crate::resolver::{Address, ResolveNowOptions, ResolverState, Target};
use crate::service_config::LbConfig;
use crate::ConnectivityState;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SUB_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`SubConn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubConnId(u64);

impl SubConnId {
    /// Mint a fresh identifier.
    pub fn next() -> Self {
        SubConnId(NEXT_SUB_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subconn-{}", self.0)
    }
}

/// A connection to one backend, backed by an ordered list of addresses.
///
/// The connection engine tries the addresses in order and stops at the first
/// one that connects. Backoff is applied to the list as a whole: every address
/// is tried once, then the engine waits before starting over from the first one.
///
/// SubConns start [`ConnectivityState::Idle`] and only leave it when
/// [`SubConn::connect`] is called. A lost connection is re-established right
/// away; a SubConn that went idle waits for another `connect`.
///
/// SubConns are owned by the connection engine. A balancer only holds handles
/// to them and learns about their state through [`Balancer::update_sub_conn_state`].
pub trait SubConn: Send + Sync + fmt::Debug {
    fn id(&self) -> SubConnId;

    /// Replace the address list.
    ///
    /// If the address currently in use is still in `addresses` the connection
    /// is kept, otherwise it is drained and a new connection is started. The
    /// outcome is reported as regular state transitions.
    fn update_addresses(&self, addresses: Vec<Address>);

    /// Start connecting. Does nothing unless the SubConn is idle.
    fn connect(&self);

    /// Access the concrete type, for capabilities beyond this trait.
    fn as_any(&self) -> &dyn Any;
}

/// Options for [`ClientConn::new_sub_conn`].
#[derive(Debug, Clone, Default)]
pub struct NewSubConnOptions {
    /// Whether the engine should health check the SubConn.
    pub health_check_enabled: bool,
}

/// The output of a balancer: the aggregated connectivity state of the channel
/// and the picker to use for new calls.
#[derive(Clone)]
pub struct State {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("connectivity_state", &self.connectivity_state)
            .finish_non_exhaustive()
    }
}

/// The callbacks a [`Balancer`] uses to drive the channel.
pub trait ClientConn: Send + Sync {
    /// Create a SubConn for `addresses`. Does not connect and does not block.
    fn new_sub_conn(
        &self,
        addresses: Vec<Address>,
        opts: NewSubConnOptions,
    ) -> Result<Arc<dyn SubConn>, BalancerError>;

    /// Remove and shut down `sub_conn`. The balancer receives a final
    /// [`ConnectivityState::Shutdown`] transition for it.
    fn remove_sub_conn(&self, sub_conn: &Arc<dyn SubConn>);

    /// Publish a new connectivity state and picker. Calls blocked on the
    /// previous picker are retried against the new one.
    fn update_state(&self, state: State);

    /// Ask the resolver to resolve the target again. Only a hint.
    fn resolve_now(&self, opts: ResolveNowOptions);

    /// The dial target of the channel.
    fn target(&self) -> String;
}

/// Additional information for [`BalancerBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// The parsed dial target, as handed to the resolver.
    pub target: Target,
}

/// Parses the JSON configuration of a balancing policy.
pub trait ConfigParser: Send + Sync {
    /// Parse `config` into the policy's own representation.
    ///
    /// Unknown fields must be ignored.
    fn parse_config(&self, config: &serde_json::Value) -> Result<LbConfig, anyhow::Error>;
}

/// Builds balancers for one balancing policy.
pub trait BalancerBuilder: Send + Sync {
    fn build(&self, cc: Arc<dyn ClientConn>, opts: BuildOptions) -> Box<dyn Balancer>;

    /// The policy name, used to select this builder from a service config.
    fn name(&self) -> &str;

    /// The config parser of this policy, if it accepts configuration.
    fn config_parser(&self) -> Option<&dyn ConfigParser> {
        None
    }
}

/// The state of a SubConn as reported to its balancer.
#[derive(Debug, Clone, Default)]
pub struct SubConnState {
    pub connectivity_state: ConnectivityState,
    /// Why the SubConn failed. Only set in [`ConnectivityState::TransientFailure`].
    pub connection_error: Option<Arc<anyhow::Error>>,
}

impl SubConnState {
    pub fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            connection_error: None,
        }
    }

    pub fn transient_failure(err: anyhow::Error) -> Self {
        Self {
            connectivity_state: ConnectivityState::TransientFailure,
            connection_error: Some(Arc::new(err)),
        }
    }
}

/// The input of a balancer.
#[derive(Debug, Default)]
pub struct ClientConnState {
    pub resolver_state: ResolverState,
    /// The configuration returned by the policy's [`ConfigParser`], if any.
    pub balancer_config: Option<LbConfig>,
}

/// Receives updates from the channel, manages SubConns and publishes pickers.
///
/// The channel invokes these methods sequentially from one task; they are
/// never called concurrently nor re-entrantly.
pub trait Balancer: Send {
    /// Apply a new resolver state and configuration.
    ///
    /// Returning [`BalancerError::BadResolverState`] makes the channel ask the
    /// resolver for new data with an exponential backoff until a later call
    /// succeeds. Any other error is logged and otherwise ignored.
    fn update_client_conn_state(&mut self, state: ClientConnState) -> Result<(), BalancerError>;

    /// The resolver reported an error.
    fn resolver_error(&mut self, err: Arc<anyhow::Error>);

    /// One of the balancer's SubConns changed state.
    fn update_sub_conn_state(&mut self, sub_conn: &Arc<dyn SubConn>, state: SubConnState);

    /// Release balancer resources. SubConns are torn down by the channel.
    fn close(&mut self);
}
