//! Connectivity states shared by SubConns and channels.

use std::fmt;

/// The connectivity state of a SubConn, or the aggregated state of a channel.
///
/// A SubConn starts in [`ConnectivityState::Idle`] and never leaves it on its own;
/// a balancer has to ask for a connection. [`ConnectivityState::Shutdown`] is terminal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    #[default]
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}
