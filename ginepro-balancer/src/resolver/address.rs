use crate::Attributes;
use std::fmt;

const ADDRESS_TYPE_KEY: &str = "ginepro.address.type";
const ADDRESS_METADATA_KEY: &str = "ginepro.address.metadata";

/// The kind of server behind an [`Address`].
#[deprecated(note = "store policy specific data in `Address::attributes` instead")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressType {
    /// A regular backend.
    #[default]
    Backend,
    /// A look-aside load balancer.
    Grpclb,
}

/// A server address produced by name resolution.
///
/// Balancers compare addresses by [`Address::addr`] when deciding whether an
/// address is still part of a list; policies that care about attributes compare the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    /// The endpoint a connection will be established to, e.g. `10.0.0.1:5000`.
    pub addr: String,
    /// Overrides the authority used for this address during the TLS handshake.
    ///
    /// Only populate it with trusted values.
    pub server_name: String,
    /// Arbitrary data for the balancing policy.
    pub attributes: Attributes,
}

impl Address {
    pub fn new<T: Into<String>>(addr: T) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_server_name<T: Into<String>>(self, server_name: T) -> Self {
        Self {
            server_name: server_name.into(),
            ..self
        }
    }

    pub fn with_attributes(self, attributes: Attributes) -> Self {
        Self { attributes, ..self }
    }

    /// Whether both addresses point at the same endpoint.
    pub fn same_endpoint(&self, other: &Address) -> bool {
        self.addr == other.addr
    }

    /// Legacy view over the address type, backed by [`Address::attributes`].
    #[deprecated(note = "store policy specific data in `Address::attributes` instead")]
    #[allow(deprecated)]
    pub fn address_type(&self) -> AddressType {
        self.attributes
            .get::<AddressType>(ADDRESS_TYPE_KEY)
            .copied()
            .unwrap_or_default()
    }

    #[deprecated(note = "store policy specific data in `Address::attributes` instead")]
    #[allow(deprecated)]
    pub fn with_address_type(self, address_type: AddressType) -> Self {
        let attributes = self.attributes.with_value(ADDRESS_TYPE_KEY, address_type);
        Self { attributes, ..self }
    }

    /// Legacy view over free-form metadata, backed by [`Address::attributes`].
    #[deprecated(note = "store policy specific data in `Address::attributes` instead")]
    pub fn metadata<T: std::any::Any>(&self) -> Option<&T> {
        self.attributes.get::<T>(ADDRESS_METADATA_KEY)
    }

    #[deprecated(note = "store policy specific data in `Address::attributes` instead")]
    pub fn with_metadata<T: std::any::Any + Send + Sync>(self, metadata: T) -> Self {
        let attributes = self.attributes.with_value(ADDRESS_METADATA_KEY, metadata);
        Self { attributes, ..self }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}
