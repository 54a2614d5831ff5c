//! Holds the latest picker and blocks calls until it can route them.

use crate::balancer::{DoneCallback, PickErrorKind, PickInfo, Picker, State, SubConn};
use crate::subconn::{ManagedSubConn, Transport};
use crate::ConnectivityState;
use std::sync::Arc;
use tokio::sync::watch;
use tonic::Status;

#[derive(Clone, Default)]
struct Published {
    connectivity_state: ConnectivityState,
    // `None` until the first balancer publishes.
    picker: Option<Arc<dyn Picker>>,
    closed: bool,
}

/// A successful pick: the SubConn, the transport it was ready on, and the
/// balancer's completion callback.
pub(crate) struct Pick {
    pub(crate) sub_conn: Arc<dyn SubConn>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) done: Option<DoneCallback>,
}

pub(crate) struct PickerWrapper {
    published: watch::Sender<Published>,
}

impl PickerWrapper {
    pub(crate) fn new() -> Self {
        let (published, _) = watch::channel(Published::default());
        Self { published }
    }

    pub(crate) fn update(&self, state: State) {
        tracing::debug!(state = %state.connectivity_state, "publishing picker");
        self.published.send_if_modified(|published| {
            if published.closed {
                return false;
            }
            published.connectivity_state = state.connectivity_state;
            published.picker = Some(state.picker);
            true
        });
    }

    pub(crate) fn close(&self) {
        self.published.send_modify(|published| {
            published.connectivity_state = ConnectivityState::Shutdown;
            published.picker = None;
            published.closed = true;
        });
    }

    pub(crate) fn connectivity_state(&self) -> ConnectivityState {
        self.published.borrow().connectivity_state
    }

    /// Wait until the connectivity state differs from `source`, returning the new state.
    pub(crate) async fn wait_for_state_change(&self, source: ConnectivityState) -> ConnectivityState {
        let mut published = self.published.subscribe();
        let state = match published
            .wait_for(|p| p.connectivity_state != source)
            .await
        {
            Ok(p) => p.connectivity_state,
            Err(_) => ConnectivityState::Shutdown,
        };
        state
    }

    /// Pick a ready SubConn for a call, waiting for new pickers as needed.
    ///
    /// A pick is retried on the next picker when the picker has no SubConn
    /// available, when it returns a SubConn that is not ready, and on opaque
    /// errors of wait-for-ready calls. The `done` callback of a discarded pick
    /// is dropped without being invoked.
    pub(crate) async fn pick(&self, info: &PickInfo, wait_for_ready: bool) -> Result<Pick, Status> {
        let mut published = self.published.subscribe();

        loop {
            let (picker, closed) = {
                let current = published.borrow_and_update();
                (current.picker.clone(), current.closed)
            };
            if closed {
                return Err(channel_closed());
            }

            if let Some(picker) = picker {
                match picker.pick(info) {
                    Ok(result) => {
                        if let Some(transport) = ready_transport(result.sub_conn.as_ref()) {
                            return Ok(Pick {
                                sub_conn: result.sub_conn,
                                transport,
                                done: result.done,
                            });
                        }
                    }
                    Err(err) => match err.kind() {
                        PickErrorKind::UnavailableRetry => {}
                        PickErrorKind::Status => return Err(err.to_status()),
                        PickErrorKind::Opaque if !wait_for_ready => return Err(err.to_status()),
                        PickErrorKind::Opaque => {
                            tracing::debug!(error = %err, "wait-for-ready call waiting for a new picker");
                        }
                    },
                }
            }

            if published.changed().await.is_err() {
                return Err(channel_closed());
            }
        }
    }
}

fn ready_transport(sub_conn: &dyn SubConn) -> Option<Arc<dyn Transport>> {
    match sub_conn.as_any().downcast_ref::<ManagedSubConn>() {
        Some(managed) => {
            let transport = managed.transport();
            if transport.is_none() {
                tracing::debug!(sub_conn = %managed.id(), "picked SubConn is not ready");
            }
            transport
        }
        None => {
            tracing::error!(sub_conn = %sub_conn.id(), "picker returned a SubConn that was not created by the channel");
            None
        }
    }
}

fn channel_closed() -> Status {
    Status::cancelled("the channel is closing")
}
