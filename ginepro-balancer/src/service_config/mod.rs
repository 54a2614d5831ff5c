//! Service config parsing.
//!
//! A service config is a JSON document published by the resolver alongside the
//! addresses. This crate understands the parts consumed by the channel:
//!
//! ```json
//! {
//!   "loadBalancingConfig": [{"weighted_target": {"targets": {}}}, {"round_robin": {}}],
//!   "methodConfig": [{
//!     "name": [{"service": "echo.Echo", "method": "UnaryEcho"}],
//!     "waitForReady": true,
//!     "timeout": "1.5s",
//!     "retryPolicy": {
//!       "maxAttempts": 3,
//!       "initialBackoff": "0.1s",
//!       "maxBackoff": "1s",
//!       "backoffMultiplier": 2,
//!       "retryableStatusCodes": ["UNAVAILABLE"]
//!     }
//!   }],
//!   "retryThrottling": {"maxTokens": 10, "tokenRatio": 0.1}
//! }
//! ```
//!
//! Unknown fields are ignored.

mod balancer_config;
mod method_config;

pub use balancer_config::BalancerConfig;
pub use method_config::{MethodConfig, RetryPolicy};

use crate::BalancerRegistry;
use method_config::RawMethodConfig;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The outcome of parsing a service config.
pub type ParseResult = Result<Arc<ServiceConfig>, ServiceConfigError>;

/// Why a service config was rejected.
///
/// A rejected service config is never applied; the channel keeps using the last valid one.
#[derive(Debug, thiserror::Error)]
pub enum ServiceConfigError {
    #[error("malformed service config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid loadBalancingConfig: entry {index} does not contain exactly 1 policy/config pair: {keys:?}")]
    MalformedLbEntry { index: usize, keys: Vec<String> },
    #[error("error parsing loadBalancingConfig for policy {policy:?}: {reason:#}")]
    LbConfig {
        policy: String,
        reason: anyhow::Error,
    },
    #[error("invalid loadBalancingConfig: no supported policies found")]
    NoSupportedPolicy,
    #[error("malformed duration {0:?}")]
    MalformedDuration(String),
    #[error("invalid method config name: a method is set but the service is empty")]
    EmptyServiceNonEmptyMethod,
    #[error("duplicate method config name {0:?}")]
    DuplicateMethodName(String),
    #[error("invalid retryable status code {0}")]
    InvalidStatusCode(String),
    #[error("invalid retryThrottling: {0}")]
    InvalidRetryThrottling(&'static str),
}

/// The parsed configuration of a balancing policy.
///
/// Only the policy that produced it knows the concrete type, and gets it back with [`LbConfig::downcast_ref`].
#[derive(Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    pub fn new<T: Any + Send + Sync>(config: T) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.config.downcast_ref()
    }
}

impl fmt::Debug for LbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LbConfig").finish_non_exhaustive()
    }
}

/// Client-side token bucket limiting retries when a service is failing.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryThrottling {
    /// Size of the bucket. In `(0, 1000]`.
    pub max_tokens: f64,
    /// Tokens added back for every successful call. Positive, three decimals at most.
    pub token_ratio: f64,
}

/// A parsed service config.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// The balancing policy to use. `None` leaves the choice to the channel.
    pub lb_config: Option<BalancerConfig>,
    /// Method configs by path, see [`ServiceConfig::method_config`].
    pub methods: HashMap<String, MethodConfig>,
    pub retry_throttling: Option<RetryThrottling>,
    raw: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceConfig {
    load_balancing_policy: Option<String>,
    load_balancing_config: Option<Vec<Map<String, Value>>>,
    #[serde(default)]
    method_config: Vec<RawMethodConfig>,
    retry_throttling: Option<RawRetryThrottling>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryThrottling {
    #[serde(default)]
    max_tokens: f64,
    #[serde(default)]
    token_ratio: f64,
}

impl ServiceConfig {
    /// Parse `json`, resolving policy names against `registry`.
    #[tracing::instrument(level = "debug", skip(registry))]
    pub fn parse(json: &str, registry: &BalancerRegistry) -> Result<Self, ServiceConfigError> {
        let raw: RawServiceConfig = serde_json::from_str(json)?;

        let lb_config = match (&raw.load_balancing_config, &raw.load_balancing_policy) {
            (Some(entries), _) => Some(BalancerConfig::select(entries, registry)?),
            // The legacy field only names a policy and is ignored if the policy is unknown.
            (None, Some(name)) if registry.get(name).is_some() => Some(BalancerConfig {
                name: name.clone(),
                config: None,
            }),
            (None, _) => None,
        };

        let mut methods = HashMap::new();
        for method_config in raw.method_config {
            let paths = method_config
                .name
                .iter()
                .map(|name| name.path())
                .collect::<Result<Vec<_>, _>>()?;
            let config = method_config.convert()?;
            for path in paths {
                if methods.contains_key(&path) {
                    return Err(ServiceConfigError::DuplicateMethodName(path));
                }
                methods.insert(path, config.clone());
            }
        }

        let retry_throttling = raw
            .retry_throttling
            .map(convert_retry_throttling)
            .transpose()?;

        Ok(Self {
            lb_config,
            methods,
            retry_throttling,
            raw: json.to_string(),
        })
    }

    /// The method config for `full_method_name` (`/service/method`).
    ///
    /// Falls back to the config for the whole service, then to the config for all methods.
    pub fn method_config(&self, full_method_name: &str) -> Option<&MethodConfig> {
        if let Some(config) = self.methods.get(full_method_name) {
            return Some(config);
        }
        if let Some(index) = full_method_name.rfind('/') {
            if let Some(config) = self.methods.get(&full_method_name[..=index]) {
                return Some(config);
            }
        }
        self.methods.get("")
    }

    /// The JSON this config was parsed from.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

fn convert_retry_throttling(raw: RawRetryThrottling) -> Result<RetryThrottling, ServiceConfigError> {
    if raw.max_tokens <= 0.0 || raw.max_tokens > 1000.0 {
        return Err(ServiceConfigError::InvalidRetryThrottling(
            "maxTokens must be in (0, 1000]",
        ));
    }
    let token_ratio = (raw.token_ratio * 1000.0).trunc() / 1000.0;
    if token_ratio <= 0.0 {
        return Err(ServiceConfigError::InvalidRetryThrottling(
            "tokenRatio must be greater than 0",
        ));
    }
    Ok(RetryThrottling {
        max_tokens: raw.max_tokens,
        token_ratio,
    })
}
