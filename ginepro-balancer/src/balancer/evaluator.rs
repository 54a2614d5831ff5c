use crate::ConnectivityState;

/// Aggregates the connectivity states of many SubConns into one.
///
/// * If at least one SubConn is [`Ready`](ConnectivityState::Ready), the aggregate is `Ready`.
/// * Otherwise, if at least one is [`Connecting`](ConnectivityState::Connecting), it is `Connecting`.
/// * Otherwise it is [`TransientFailure`](ConnectivityState::TransientFailure).
///
/// `Idle` and `Shutdown` SubConns are not counted, which means a balancer whose
/// SubConns are all idle reports `TransientFailure`.
///
/// Every observed transition must be recorded exactly once, otherwise the counters drift.
#[derive(Debug, Default, Clone)]
pub struct ConnectivityStateEvaluator {
    num_ready: u64,
    num_connecting: u64,
}

impl ConnectivityStateEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a SubConn moving from `old_state` to `new_state` and return the new aggregate.
    pub fn record_transition(
        &mut self,
        old_state: ConnectivityState,
        new_state: ConnectivityState,
    ) -> ConnectivityState {
        match old_state {
            ConnectivityState::Ready => self.num_ready = self.num_ready.saturating_sub(1),
            ConnectivityState::Connecting => {
                self.num_connecting = self.num_connecting.saturating_sub(1)
            }
            _ => {}
        }
        match new_state {
            ConnectivityState::Ready => self.num_ready += 1,
            ConnectivityState::Connecting => self.num_connecting += 1,
            _ => {}
        }

        self.aggregate()
    }

    /// The aggregate for the transitions recorded so far.
    pub fn aggregate(&self) -> ConnectivityState {
        if self.num_ready > 0 {
            ConnectivityState::Ready
        } else if self.num_connecting > 0 {
            ConnectivityState::Connecting
        } else {
            ConnectivityState::TransientFailure
        }
    }
}
