//! The connection engine's side of a [`SubConn`]: a worker task driving an
//! address list through the connectivity state machine.
//!
//! ```text
//!   Idle ──connect()──▶ Connecting ──▶ Ready
//!                          ▲   │          │ connection lost: reconnect immediately
//!                          │   ▼          │ enter_idle(): back to Idle
//!            backoff ──── TransientFailure ◀─┘
//! ```
//!
//! Every address of the list is tried once, in order. When all of them failed
//! the SubConn reports [`TransientFailure`](ConnectivityState::TransientFailure),
//! waits for the backoff and starts again from the first address. Removal moves
//! any state to [`Shutdown`](ConnectivityState::Shutdown).

use crate::balancer::{SubConn, SubConnId, SubConnState};
use crate::resolver::Address;
use crate::{BackoffConfig, ConnectivityState};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing_futures::Instrument;

/// Establishes transports to addresses. Implemented by the transport layer.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `address`. Dropping the returned future aborts the attempt.
    async fn connect(&self, address: &Address) -> Result<Arc<dyn Transport>, anyhow::Error>;
}

/// An established connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Resolves once the connection is lost.
    async fn closed(&self);

    /// Stop accepting calls, let in-flight calls finish, then close the connection.
    async fn graceful_close(&self);
}

/// Connection settings shared by the SubConns of a channel.
#[derive(Debug, Clone)]
pub struct SubConnConfig {
    /// Backoff between two passes over the address list.
    pub backoff: BackoffConfig,
    /// Upper bound for a single connection attempt.
    pub min_connect_timeout: Duration,
}

impl Default for SubConnConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            min_connect_timeout: Duration::from_secs(20),
        }
    }
}

/// Receives every state transition of a SubConn.
pub type StateListener = Arc<dyn Fn(SubConnId, SubConnState) + Send + Sync>;

enum Command {
    Connect,
    UpdateAddresses(Vec<Address>),
    EnterIdle,
    Shutdown,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    state: ConnectivityState,
    transport: Option<Arc<dyn Transport>>,
}

/// A [`SubConn`] whose connection attempts are made by a [`Connector`].
///
/// Creating one spawns its worker on the current tokio runtime. The worker
/// stops when the SubConn is shut down or its last handle is dropped.
pub struct ManagedSubConn {
    id: SubConnId,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: Arc<watch::Sender<Snapshot>>,
}

impl ManagedSubConn {
    pub fn new(
        addresses: Vec<Address>,
        connector: Arc<dyn Connector>,
        config: SubConnConfig,
        listener: StateListener,
    ) -> Arc<Self> {
        let id = SubConnId::next();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(Snapshot::default());
        let snapshot = Arc::new(snapshot);

        let worker = Worker {
            id,
            addresses,
            connector,
            config,
            commands: command_rx,
            snapshot: snapshot.clone(),
            listener,
        };
        tokio::spawn(worker.run().instrument(tracing::debug_span!("subconn", %id)));

        Arc::new(Self {
            id,
            commands,
            snapshot,
        })
    }

    pub fn state(&self) -> ConnectivityState {
        self.snapshot.borrow().state
    }

    /// The transport to send calls on, only available while ready.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        let snapshot = self.snapshot.borrow();
        match snapshot.state {
            ConnectivityState::Ready => snapshot.transport.clone(),
            _ => None,
        }
    }

    /// Close the connection of a ready SubConn and go back to idle.
    pub fn enter_idle(&self) {
        let _ = self.commands.send(Command::EnterIdle);
    }

    /// Move to [`ConnectivityState::Shutdown`] for good.
    ///
    /// The transition is not reported to the state listener: whoever shuts the
    /// SubConn down is responsible for telling the balancer.
    pub fn shutdown(&self) {
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = ConnectivityState::Shutdown;
            snapshot.transport = None;
        });
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl SubConn for ManagedSubConn {
    fn id(&self) -> SubConnId {
        self.id
    }

    fn update_addresses(&self, addresses: Vec<Address>) {
        let _ = self.commands.send(Command::UpdateAddresses(addresses));
    }

    fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for ManagedSubConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedSubConn")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

// How the worker leaves a connected or connecting phase.
enum Exit {
    Idle,
    Shutdown,
}

enum Attempt {
    Connected(Arc<dyn Transport>, Address),
    Exhausted(anyhow::Error),
    // The address being tried was removed from the list.
    Restart,
    Interrupted(Exit),
}

enum Serve {
    Lost,
    AddressRemoved,
    Exit(Exit),
}

struct Worker {
    id: SubConnId,
    addresses: Vec<Address>,
    connector: Arc<dyn Connector>,
    config: SubConnConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshot: Arc<watch::Sender<Snapshot>>,
    listener: StateListener,
}

impl Worker {
    async fn run(mut self) {
        loop {
            match self.commands.recv().await {
                None | Some(Command::Shutdown) => break,
                Some(Command::Connect) => {}
                Some(Command::UpdateAddresses(addresses)) => {
                    self.addresses = addresses;
                    continue;
                }
                Some(Command::EnterIdle) => continue,
            }

            match self.connect_until_exit().await {
                Exit::Idle => self.set_state(SubConnState::new(ConnectivityState::Idle), None),
                Exit::Shutdown => break,
            }
        }
        tracing::debug!("subconn worker stopped");
    }

    async fn connect_until_exit(&mut self) -> Exit {
        let mut retries: u32 = 0;
        loop {
            self.set_state(SubConnState::new(ConnectivityState::Connecting), None);

            match self.try_addresses().await {
                Attempt::Connected(transport, address) => {
                    tracing::debug!(%address, "connected");
                    retries = 0;
                    self.set_state(
                        SubConnState::new(ConnectivityState::Ready),
                        Some(transport.clone()),
                    );
                    match self.serve(transport, address).await {
                        Serve::Lost | Serve::AddressRemoved => continue,
                        Serve::Exit(exit) => return exit,
                    }
                }
                Attempt::Exhausted(err) => {
                    let delay = self.config.backoff.backoff(retries);
                    retries = retries.saturating_add(1);
                    tracing::debug!(error = %err, ?delay, "all addresses failed, backing off");
                    self.set_state(SubConnState::transient_failure(err), None);
                    if let Some(exit) = self.wait(delay).await {
                        return exit;
                    }
                }
                Attempt::Restart => continue,
                Attempt::Interrupted(exit) => return exit,
            }
        }
    }

    async fn try_addresses(&mut self) -> Attempt {
        let connector = self.connector.clone();
        let addresses = self.addresses.clone();
        let mut last_error = anyhow::anyhow!("no addresses to connect to");

        for address in addresses {
            let attempt =
                tokio::time::timeout(self.config.min_connect_timeout, connector.connect(&address));
            tokio::pin!(attempt);

            loop {
                tokio::select! {
                    result = &mut attempt => {
                        match result {
                            Ok(Ok(transport)) => return Attempt::Connected(transport, address.clone()),
                            Ok(Err(err)) => {
                                tracing::debug!(%address, error = %err, "connection attempt failed");
                                last_error = err;
                            }
                            Err(_) => {
                                tracing::debug!(%address, "connection attempt timed out");
                                last_error = anyhow::anyhow!("timed out connecting to {}", address);
                            }
                        }
                        break;
                    }
                    command = self.commands.recv() => match command {
                        None | Some(Command::Shutdown) => return Attempt::Interrupted(Exit::Shutdown),
                        Some(Command::Connect) | Some(Command::EnterIdle) => {}
                        Some(Command::UpdateAddresses(addresses)) => {
                            let keep = addresses.iter().any(|a| a.same_endpoint(&address));
                            self.addresses = addresses;
                            if !keep {
                                return Attempt::Restart;
                            }
                        }
                    }
                }
            }
        }

        Attempt::Exhausted(last_error)
    }

    async fn serve(&mut self, transport: Arc<dyn Transport>, address: Address) -> Serve {
        let closed = transport.closed();
        tokio::pin!(closed);

        loop {
            tokio::select! {
                _ = &mut closed => {
                    tracing::debug!(%address, "connection lost");
                    return Serve::Lost;
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        close_in_background(transport.clone());
                        return Serve::Exit(Exit::Shutdown);
                    }
                    Some(Command::EnterIdle) => {
                        close_in_background(transport.clone());
                        return Serve::Exit(Exit::Idle);
                    }
                    Some(Command::Connect) => {}
                    Some(Command::UpdateAddresses(addresses)) => {
                        let keep = addresses.iter().any(|a| a.same_endpoint(&address));
                        self.addresses = addresses;
                        if !keep {
                            tracing::debug!(%address, "address removed, draining connection");
                            close_in_background(transport.clone());
                            return Serve::AddressRemoved;
                        }
                    }
                }
            }
        }
    }

    // Sleep for `delay`, still applying address updates. Returns early on shutdown.
    async fn wait(&mut self, delay: Duration) -> Option<Exit> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return Some(Exit::Shutdown),
                    Some(Command::Connect) | Some(Command::EnterIdle) => {}
                    Some(Command::UpdateAddresses(addresses)) => self.addresses = addresses,
                }
            }
        }
    }

    fn set_state(&self, state: SubConnState, transport: Option<Arc<dyn Transport>>) {
        let new_state = state.connectivity_state;
        let changed = self.snapshot.send_if_modified(|snapshot| {
            if snapshot.state == ConnectivityState::Shutdown || snapshot.state == new_state {
                return false;
            }
            snapshot.state = new_state;
            snapshot.transport = transport;
            true
        });

        if changed {
            tracing::debug!(state = %new_state, "subconn state changed");
            (self.listener)(self.id, state);
        }
    }
}

fn close_in_background(transport: Arc<dyn Transport>) {
    tokio::spawn(async move { transport.graceful_close().await }.in_current_span());
}
