//! Key-space encoding
//!
//! Every key lives under the coordinator's instance id and one of three
//! namespaces:
//! - `{instance_id}:p:{table}:{pk_tuple}` for primary-key entries
//! - `{instance_id}:u:{table}:{index}:{uk_tuple}` for unique-index entries
//! - `{instance_id}:s:{table}:{sql}:{param}:...` for search results
//!
//! Prefixes drop the trailing key suffix and are used for bulk invalidation.
//! Key tuples are joined with `:` in the order given; the same order must be
//! used when filling and when probing, otherwise composite lookups never hit.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Write};

use rand::Rng;
use rand::distr::Alphanumeric;

const INSTANCE_ID_LEN: usize = 5;

/// Generate a random instance id scoping one coordinator's key-space.
pub fn generate_instance_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(INSTANCE_ID_LEN)
        .map(char::from)
        .collect()
}

/// A bound query parameter, stringified into search and coalescing keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    List(Vec<Param>),
}

impl Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Null => f.write_str("NULL"),
            Param::Bool(b) => write!(f, "{b}"),
            Param::Int(i) => write!(f, "{i}"),
            Param::UInt(u) => write!(f, "{u}"),
            Param::Float(x) => write!(f, "{x}"),
            Param::Text(s) => f.write_str(s),
            Param::List(items) => {
                f.write_char('[')?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_char(' ')?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_char(']')
            }
        }
    }
}

macro_rules! param_from {
    ($variant:ident, $target:ty: $($t:ty),+) => {
        $(impl From<$t> for Param {
            fn from(v: $t) -> Self {
                Param::$variant(<$target>::from(v))
            }
        })+
    };
}

param_from!(Int, i64: i8, i16, i32, i64);
param_from!(UInt, u64: u8, u16, u32, u64);
param_from!(Float, f64: f32, f64);
param_from!(Bool, bool: bool);
param_from!(Text, String: String, &str);

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map_or(Param::Null, Into::into)
    }
}

impl<T: Into<Param>> From<Vec<T>> for Param {
    fn from(v: Vec<T>) -> Self {
        Param::List(v.into_iter().map(Into::into).collect())
    }
}

/// Ordered values of a primary-key or unique-index column set.
///
/// Uniqueness of the encoded key relies on the stringified values being
/// injective for the domain's keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyTuple(Vec<String>);

impl KeyTuple {
    pub fn new<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Display,
    {
        Self(values.into_iter().map(|v| v.to_string()).collect())
    }

    /// Build a tuple from `(column, value)` pairs ordered by column name, for
    /// callers that do not know the declared key order.
    pub fn from_columns<I, C, V>(columns: I) -> Self
    where
        I: IntoIterator<Item = (C, V)>,
        C: Into<String>,
        V: Display,
    {
        let sorted: BTreeMap<String, String> = columns
            .into_iter()
            .map(|(c, v)| (c.into(), v.to_string()))
            .collect();
        Self(sorted.into_values().collect())
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(":"))
    }
}

macro_rules! key_tuple_from {
    ($($t:ty),+) => {
        $(impl From<$t> for KeyTuple {
            fn from(v: $t) -> Self {
                KeyTuple(vec![v.to_string()])
            }
        })+
    };
}

key_tuple_from!(i32, i64, u32, u64, String, &str);

/// Drop repeated tuples, keeping first occurrences in order.
pub(crate) fn dedup_tuples(tuples: &[KeyTuple]) -> Vec<KeyTuple> {
    let mut out: Vec<KeyTuple> = Vec::with_capacity(tuples.len());
    for tuple in tuples {
        if !out.contains(tuple) {
            out.push(tuple.clone());
        }
    }
    out
}

fn append_params(buf: &mut String, sql: &str, params: &[Param]) {
    buf.push_str(sql);
    for param in params {
        // Writing into a String cannot fail.
        let _ = write!(buf, ":{param}");
    }
}

/// Key used to coalesce concurrent identical reads: `{table}:{sql}:{param}:...`.
pub fn singleflight_key(table: &str, sql: &str, params: &[Param]) -> String {
    let mut buf = String::with_capacity(table.len() + sql.len() + 1 + params.len() * 8);
    buf.push_str(table);
    buf.push(':');
    append_params(&mut buf, sql, params);
    buf
}

/// Prefix shared by every coalescing key for `table`.
pub(crate) fn singleflight_prefix(table: &str) -> String {
    format!("{table}:")
}

/// Deterministic key construction scoped by one instance id.
#[derive(Debug, Clone)]
pub struct KeySpace {
    instance_id: String,
}

impl KeySpace {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn primary_key(&self, table: &str, key: &KeyTuple) -> String {
        format!("{}:p:{}:{}", self.instance_id, table, key)
    }

    pub fn primary_prefix(&self, table: &str) -> String {
        format!("{}:p:{}", self.instance_id, table)
    }

    pub fn unique_key(&self, table: &str, index: &str, key: &KeyTuple) -> String {
        format!("{}:u:{}:{}:{}", self.instance_id, table, index, key)
    }

    pub fn unique_prefix(&self, table: &str, index: &str) -> String {
        format!("{}:u:{}:{}", self.instance_id, table, index)
    }

    pub fn search_key(&self, table: &str, sql: &str, params: &[Param]) -> String {
        let mut buf = self.search_prefix(table);
        buf.push(':');
        append_params(&mut buf, sql, params);
        buf
    }

    pub fn search_prefix(&self, table: &str) -> String {
        format!("{}:s:{}", self.instance_id, table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_are_short_alphanumeric() {
        let id = generate_instance_id();
        assert_eq!(id.len(), INSTANCE_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn primary_keys_join_composite_values_in_order() {
        let keys = KeySpace::new("abc12");
        assert_eq!(keys.primary_key("users", &KeyTuple::from(7)), "abc12:p:users:7");
        assert_eq!(
            keys.primary_key("orders", &KeyTuple::new([1, 42])),
            "abc12:p:orders:1:42"
        );
        assert_ne!(
            keys.primary_key("orders", &KeyTuple::new([1, 42])),
            keys.primary_key("orders", &KeyTuple::new([42, 1]))
        );
        assert_eq!(keys.primary_prefix("orders"), "abc12:p:orders");
    }

    #[test]
    fn from_columns_orders_by_column_name() {
        let a = KeyTuple::from_columns([("user_id", "1"), ("order_id", "2")]);
        let b = KeyTuple::from_columns([("order_id", "2"), ("user_id", "1")]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "2:1");
    }

    #[test]
    fn unique_keys_are_scoped_by_index() {
        let keys = KeySpace::new("abc12");
        let email = KeyTuple::from("a@example.com");
        assert_eq!(
            keys.unique_key("users", "idx_email", &email),
            "abc12:u:users:idx_email:a@example.com"
        );
        assert_ne!(
            keys.unique_key("users", "idx_email", &email),
            keys.unique_key("users", "idx_login", &email)
        );
        assert_eq!(keys.unique_prefix("users", "idx_email"), "abc12:u:users:idx_email");
    }

    #[test]
    fn search_keys_include_sql_and_params() {
        let keys = KeySpace::new("abc12");
        let sql = "SELECT * FROM users WHERE age > ? AND name = ?";
        let key = keys.search_key("users", sql, &[Param::from(18), Param::from("bob")]);
        assert_eq!(key, format!("abc12:s:users:{sql}:18:bob"));
        assert_ne!(key, keys.search_key("users", sql, &[Param::from(19), Param::from("bob")]));
        assert!(key.starts_with(&keys.search_prefix("users")));
    }

    #[test]
    fn params_stringify_like_plain_values() {
        assert_eq!(Param::from(Some(3)).to_string(), "3");
        assert_eq!(Param::from(None::<i64>).to_string(), "NULL");
        assert_eq!(Param::from(vec![1, 2, 3]).to_string(), "[1 2 3]");
        assert_eq!(Param::from(true).to_string(), "true");
        assert_eq!(Param::from(1.5).to_string(), "1.5");
    }

    #[test]
    fn singleflight_key_is_table_scoped() {
        let key = singleflight_key("users", "SELECT 1", &[Param::from(1)]);
        assert_eq!(key, "users:SELECT 1:1");
        assert!(key.starts_with(&singleflight_prefix("users")));
        assert!(!key.starts_with(&singleflight_prefix("user")));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let tuples = vec![KeyTuple::from(1), KeyTuple::from(2), KeyTuple::from(1)];
        assert_eq!(dedup_tuples(&tuples), vec![KeyTuple::from(1), KeyTuple::from(2)]);
    }
}
