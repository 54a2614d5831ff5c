use super::{LbConfig, ServiceConfigError};
use crate::BalancerRegistry;
use serde_json::{Map, Value};

/// The balancing policy selected from a `loadBalancingConfig` list, with its parsed configuration.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// The policy name as spelled in the service config.
    pub name: String,
    /// `None` when the policy does not accept configuration.
    pub config: Option<LbConfig>,
}

impl BalancerConfig {
    /// Parse a JSON `loadBalancingConfig` list, e.g. `[{"round_robin": {}}, {"pick_first": {}}]`.
    pub fn from_json(json: &str, registry: &BalancerRegistry) -> Result<Self, ServiceConfigError> {
        let entries: Vec<Map<String, Value>> = serde_json::from_str(json)?;
        Self::select(&entries, registry)
    }

    /// Select the first policy of `entries` known to `registry` and parse its configuration.
    ///
    /// Unknown policies are skipped, which lets a service offer newer policies
    /// to newer clients and fall back to older ones. The list is rejected as a
    /// whole when:
    /// - an entry does not hold exactly one policy;
    /// - the config of the first known policy fails to parse;
    /// - no policy is known.
    pub fn select(
        entries: &[Map<String, Value>],
        registry: &BalancerRegistry,
    ) -> Result<Self, ServiceConfigError> {
        for (index, entry) in entries.iter().enumerate() {
            let (name, raw_config) = match single_entry(entry) {
                Some(pair) => pair,
                None => {
                    return Err(ServiceConfigError::MalformedLbEntry {
                        index,
                        keys: entry.keys().cloned().collect(),
                    })
                }
            };

            let builder = match registry.get(name) {
                Some(builder) => builder,
                None => {
                    tracing::debug!(policy = %name, "skipping unregistered balancing policy");
                    continue;
                }
            };

            let parser = match builder.config_parser() {
                Some(parser) => parser,
                None => {
                    if !is_empty_object(raw_config) {
                        tracing::warn!(
                            policy = %name,
                            config = %raw_config,
                            "non-empty balancer configuration, but the balancer does not accept configuration"
                        );
                    }
                    return Ok(Self {
                        name: name.to_string(),
                        config: None,
                    });
                }
            };

            let config = parser.parse_config(raw_config).map_err(|reason| {
                ServiceConfigError::LbConfig {
                    policy: name.to_string(),
                    reason,
                }
            })?;

            return Ok(Self {
                name: name.to_string(),
                config: Some(config),
            });
        }

        Err(ServiceConfigError::NoSupportedPolicy)
    }
}

fn single_entry(entry: &Map<String, Value>) -> Option<(&str, &Value)> {
    if entry.len() != 1 {
        return None;
    }
    entry.iter().next().map(|(name, config)| (name.as_str(), config))
}

fn is_empty_object(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.is_empty())
}
