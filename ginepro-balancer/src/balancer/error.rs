/// Errors returned by balancers, and by the channel to balancers.
#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    /// The resolver data could not be used. The channel keeps re-resolving
    /// with an exponential backoff until an update is accepted.
    #[error("bad resolver state")]
    BadResolverState,
    /// The channel has been closed and does not accept new SubConns.
    #[error("the channel is closed")]
    ChannelClosed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
