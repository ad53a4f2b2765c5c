//! Row types the coordinator can cache

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::keys::KeyTuple;

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A cacheable row that knows its own point-lookup keys.
///
/// The tuples must be built in the same column order the host uses when it
/// extracts keys from a query predicate.
pub trait CacheRecord: Cacheable {
    /// Primary-key tuple, or `None` when the key is unset (e.g. a zero id).
    fn primary_key(&self) -> Option<KeyTuple>;

    /// `(index name, tuple)` for every unique secondary index on the row.
    fn unique_keys(&self) -> Vec<(String, KeyTuple)> {
        Vec::new()
    }
}
