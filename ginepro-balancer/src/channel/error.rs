use crate::service_config::ServiceConfigError;

/// Why a [`Channel`](super::Channel) could not be built.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no resolver registered for scheme {0:?}")]
    UnknownScheme(String),
    #[error("balancing policy {0:?} is not registered")]
    UnknownBalancer(String),
    #[error("a connector must be configured")]
    MissingConnector,
    #[error("failed to build resolver for target {target:?}: {reason:#}")]
    Resolver {
        target: String,
        reason: anyhow::Error,
    },
    #[error("invalid default service config: {0}")]
    DefaultServiceConfig(#[source] ServiceConfigError),
}
