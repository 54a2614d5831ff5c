//! An immutable bag of arbitrary values attached to addresses and resolver states.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Immutable key-value store for data that only the producer and the consumer
/// of a value understand (e.g. a resolver and the balancing policy it feeds).
///
/// Cloning is cheap. Adding a value returns a new bag and leaves the original untouched.
#[derive(Clone, Default)]
pub struct Attributes {
    values: Arc<BTreeMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of these attributes with `key` set to `value`.
    pub fn with_value<K, V>(&self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Any + Send + Sync,
    {
        let mut values = BTreeMap::clone(&self.values);
        values.insert(key.into(), Arc::new(value));
        Self {
            values: Arc::new(values),
        }
    }

    /// Look up `key`, returning `None` if it is missing or holds a value of another type.
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.values.get(key).and_then(|value| value.downcast_ref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// Two bags are equal when they hold the same keys pointing at the same values.
impl PartialEq for Attributes {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.values, &other.values) {
            return true;
        }
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|((k1, v1), (k2, v2))| k1 == k2 && Arc::ptr_eq(v1, v2))
    }
}

impl Eq for Attributes {}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}
