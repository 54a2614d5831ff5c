use crate::ResolverRegistry;
use std::fmt;

/// A parsed dial target.
///
/// Produced from the string handed to [`Channel::builder`](crate::Channel::builder):
///
/// * `dns://some_authority/foo.bar` with `dns` registered becomes
///   `Target { scheme: "dns", authority: "some_authority", endpoint: "foo.bar" }`;
/// * `foo.bar` becomes `Target { scheme: <default scheme>, endpoint: "foo.bar" }`;
/// * `unknown://authority/endpoint` with `unknown` not registered becomes
///   `Target { scheme: <default scheme>, endpoint: "unknown://authority/endpoint" }`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    pub endpoint: String,
}

impl Target {
    /// Parse `target`, consulting `registry` for the set of known schemes and the default scheme.
    pub fn parse(target: &str, registry: &ResolverRegistry) -> Self {
        if let Some((scheme, authority, endpoint)) = split_target(target) {
            if registry.get(scheme).is_some() {
                return Self {
                    scheme: scheme.to_string(),
                    authority: authority.to_string(),
                    endpoint: endpoint.to_string(),
                };
            }
        }

        Self {
            scheme: registry.default_scheme().to_string(),
            authority: String::new(),
            endpoint: target.to_string(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
    }
}

// Splits `<scheme>://<authority>/<endpoint>`; anything else is treated as scheme-less.
fn split_target(target: &str) -> Option<(&str, &str, &str)> {
    let (scheme, rest) = target.split_once("://")?;
    let (authority, endpoint) = rest.split_once('/')?;
    Some((scheme, authority, endpoint))
}
