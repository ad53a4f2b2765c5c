//! Read path
//!
//! A read is coalesced with identical in-flight reads, then probed against
//! the point namespaces (primary or unique), then the search namespace.
//! Only on a miss does the data source run; its result is written back.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::coordinator::{Coordinator, Task, access};
use crate::error::{BoxError, SharedError};
use crate::keys::{KeyTuple, Param, dedup_tuples, singleflight_key};
use crate::record::{CacheRecord, Cacheable};
use crate::singleflight::Flight;
use crate::storage::Kv;
use crate::{CacheError, Result};

/// Value stored at a search key when the data source found no rows.
pub(crate) const NOT_FOUND_SENTINEL: &str = "recordNotFound";

/// Whether the caller expects a single row or a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shape {
    One,
    #[default]
    Many,
}

/// Point lookup extracted by the host from the query predicate.
///
/// Only supply one when the predicate consists solely of equality/IN
/// constraints covering every column of the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Primary(Vec<KeyTuple>),
    Unique { index: String, keys: Vec<KeyTuple> },
}

impl Lookup {
    /// Requested tuples with duplicates removed.
    pub(crate) fn tuples(&self) -> Vec<KeyTuple> {
        match self {
            Lookup::Primary(keys) | Lookup::Unique { keys, .. } => dedup_tuples(keys),
        }
    }
}

/// One read against a backing table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    /// Normalized query text
    pub sql: String,
    pub params: Vec<Param>,
    pub shape: Shape,
    pub lookup: Option<Lookup>,
}

impl Query {
    pub fn new(table: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            sql: sql.into(),
            params: Vec::new(),
            shape: Shape::Many,
            lookup: None,
        }
    }

    pub fn bind(mut self, param: impl Into<Param>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn with_params<I, P>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Param>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Expect a single row; an empty result is reported as not found.
    pub fn one(mut self) -> Self {
        self.shape = Shape::One;
        self
    }

    pub fn by_primary<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<KeyTuple>,
    {
        self.lookup = Some(Lookup::Primary(keys.into_iter().map(Into::into).collect()));
        self
    }

    pub fn by_unique<I, K>(mut self, index: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<KeyTuple>,
    {
        self.lookup = Some(Lookup::Unique {
            index: index.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub(crate) fn flight_key(&self) -> String {
        singleflight_key(&self.table, &self.sql, &self.params)
    }
}

/// Rows produced by the data source or served from cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub rows: Vec<T>,
    pub rows_affected: u64,
}

impl<T> Fetched<T> {
    pub fn one(row: T) -> Self {
        Self {
            rows: vec![row],
            rows_affected: 1,
        }
    }

    pub fn many(rows: Vec<T>) -> Self {
        let rows_affected = rows.len() as u64;
        Self {
            rows,
            rows_affected,
        }
    }

    pub fn with_rows_affected(mut self, rows_affected: u64) -> Self {
        self.rows_affected = rows_affected;
        self
    }

    /// The first row, for single-row reads.
    pub fn into_first(self) -> Option<T> {
        self.rows.into_iter().next()
    }
}

/// What a completed leader hands to its followers.
///
/// Rows travel as their encoded JSON array so every follower decodes the
/// same bytes the leader produced.
#[derive(Debug, Clone)]
pub(crate) enum FlightOutcome {
    Found { payload: Arc<str>, rows_affected: u64 },
    NotFound,
    Failed(SharedError),
}

impl FlightOutcome {
    pub(crate) fn into_result<T: Cacheable>(self) -> Result<Option<Fetched<T>>> {
        match self {
            FlightOutcome::Found {
                payload,
                rows_affected,
            } => {
                let rows = decode_rows(&payload)?;
                Ok(Some(Fetched {
                    rows,
                    rows_affected,
                }))
            }
            FlightOutcome::NotFound => Ok(None),
            FlightOutcome::Failed(err) => Err(CacheError::Upstream(err)),
        }
    }
}

pub(crate) fn encode_rows<T: Serialize + ?Sized>(rows: &T) -> Result<String> {
    Ok(serde_json::to_string(rows)?)
}

pub(crate) fn decode_rows<T: Cacheable>(payload: &str) -> Result<Vec<T>> {
    serde_json::from_str(payload).map_err(CacheError::Deserialization)
}

/// Join individually stored rows into one JSON array.
pub(crate) fn join_rows(values: &[String]) -> String {
    let mut payload = String::with_capacity(values.iter().map(|v| v.len() + 1).sum::<usize>() + 2);
    payload.push('[');
    payload.push_str(&values.join(","));
    payload.push(']');
    payload
}

/// Search payload layout: `{rows_affected}|{json rows}`.
pub(crate) fn encode_search(rows_affected: u64, payload: &str) -> String {
    format!("{rows_affected}|{payload}")
}

/// Split a stored search payload; `None` if it is malformed.
pub(crate) fn decode_search(value: &str) -> Option<(u64, &str)> {
    let (count, rows) = value.split_once('|')?;
    Some((count.parse().ok()?, rows))
}

/// A read answered from cache.
enum Probe<T> {
    Rows {
        rows: Vec<T>,
        payload: Arc<str>,
        rows_affected: u64,
    },
    NotFound,
}

impl Coordinator {
    /// Answer `query` from cache, or run `fetch` and cache its result.
    ///
    /// `fetch` returns `Ok(None)` when the data source found no rows; that
    /// outcome is remembered at the search key when penetration protection
    /// is on, and reported to the caller as `Ok(None)` whether it came from
    /// the data source or from cache. Concurrent identical reads share one
    /// `fetch`. Cache failures never surface: they fall through to `fetch`.
    /// The only error returned is the data source's own, as
    /// [`CacheError::Upstream`].
    pub async fn query<T, F, Fut, E>(&self, query: &Query, fetch: F) -> Result<Option<Fetched<T>>>
    where
        T: CacheRecord,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<Fetched<T>>, E>>,
        E: Into<BoxError>,
    {
        if !self.is_cached_table(&query.table) {
            return fetch().await.map_err(CacheError::upstream);
        }

        let flight_key = query.flight_key();
        let leader = loop {
            match self.inner.flights.join(&flight_key) {
                Flight::Leader(leader) => break leader,
                Flight::Follower(follower) => {
                    if let Some(outcome) = follower.wait().await {
                        self.inner.stats.record_hit();
                        access!(self, key = %flight_key, "singleflight hit");
                        return outcome.into_result();
                    }
                    debug!(key = %flight_key, "in-flight read abandoned, joining again");
                }
            }
        };

        if let Some(probe) = self.probe::<T>(query).await {
            self.inner.stats.record_hit();
            return Ok(match probe {
                Probe::Rows {
                    rows,
                    payload,
                    rows_affected,
                } => {
                    leader.complete(FlightOutcome::Found {
                        payload,
                        rows_affected,
                    });
                    Some(Fetched {
                        rows,
                        rows_affected,
                    })
                }
                Probe::NotFound => {
                    leader.complete(FlightOutcome::NotFound);
                    None
                }
            });
        }

        self.inner.stats.record_miss();
        access!(self, table = %query.table, sql = %query.sql, "cache miss");

        match fetch().await {
            Ok(Some(fetched)) if !(query.shape == Shape::One && fetched.rows.is_empty()) => {
                match encode_rows(&fetched.rows) {
                    Ok(payload) => {
                        let payload: Arc<str> = Arc::from(payload);
                        self.fill(query, &fetched, &payload).await;
                        access!(
                            self,
                            key = leader.key(),
                            followers = leader.dups(),
                            "fetched rows shared"
                        );
                        leader.complete(FlightOutcome::Found {
                            payload,
                            rows_affected: fetched.rows_affected,
                        });
                    }
                    // Dropping the leader sends followers to fetch on their own.
                    Err(e) => {
                        warn!(table = %query.table, error = %e, "cannot encode rows, not cached");
                        drop(leader);
                    }
                }
                Ok(Some(fetched))
            }
            Ok(_) => {
                self.remember_not_found(query).await;
                leader.complete(FlightOutcome::NotFound);
                Ok(None)
            }
            Err(err) => {
                let err: BoxError = err.into();
                let err: SharedError = Arc::from(err);
                leader.complete(FlightOutcome::Failed(Arc::clone(&err)));
                Err(CacheError::Upstream(err))
            }
        }
    }

    async fn probe<T: CacheRecord>(&self, query: &Query) -> Option<Probe<T>> {
        let level = self.inner.config.level;
        if level.caches_primary()
            && let Some(lookup) = &query.lookup
            && let Some(hit) = self.probe_point(query, lookup).await
        {
            return Some(hit);
        }
        if level.caches_search() {
            return self.probe_search(query).await;
        }
        None
    }

    /// Hit only when every requested tuple is cached.
    async fn probe_point<T: CacheRecord>(
        &self,
        query: &Query,
        lookup: &Lookup,
    ) -> Option<Probe<T>> {
        let tuples = lookup.tuples();
        if tuples.is_empty() || (query.shape == Shape::One && tuples.len() != 1) {
            return None;
        }

        let values = match lookup {
            Lookup::Primary(_) => self.batch_get_primary_cache(&query.table, &tuples).await,
            Lookup::Unique { index, .. } => {
                self.batch_get_unique_cache(&query.table, index, &tuples)
                    .await
            }
        };
        let values = match values {
            Ok(values) => values,
            Err(e) => {
                error!(table = %query.table, error = %e, "point cache lookup failed");
                return None;
            }
        };
        let values: Vec<String> = values.into_iter().collect::<Option<_>>()?;
        if values.len() != tuples.len() {
            return None;
        }

        let payload = join_rows(&values);
        match decode_rows::<T>(&payload) {
            Ok(rows) => {
                access!(self, table = %query.table, keys = tuples.len(), "point cache hit");
                Some(Probe::Rows {
                    rows_affected: rows.len() as u64,
                    rows,
                    payload: Arc::from(payload),
                })
            }
            Err(e) => {
                warn!(table = %query.table, error = %e, "cannot decode point cache entries");
                None
            }
        }
    }

    async fn probe_search<T: CacheRecord>(&self, query: &Query) -> Option<Probe<T>> {
        let value = match self
            .get_search_cache(&query.table, &query.sql, &query.params)
            .await
        {
            Ok(value) => value,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                error!(
                    table = %query.table,
                    sql = %query.sql,
                    error = %e,
                    "search cache lookup failed"
                );
                return None;
            }
        };

        if value == NOT_FOUND_SENTINEL {
            access!(self, table = %query.table, sql = %query.sql, "negative cache hit");
            return Some(Probe::NotFound);
        }
        let Some((rows_affected, payload)) = decode_search(&value) else {
            warn!(table = %query.table, sql = %query.sql, "malformed search cache entry");
            return None;
        };
        match decode_rows::<T>(payload) {
            Ok(rows) => {
                access!(self, table = %query.table, sql = %query.sql, "search cache hit");
                Some(Probe::Rows {
                    rows,
                    payload: Arc::from(payload),
                    rows_affected,
                })
            }
            Err(e) => {
                warn!(table = %query.table, error = %e, "cannot decode search cache entry");
                None
            }
        }
    }

    /// Populate the search and point namespaces from a fresh result.
    async fn fill<T: CacheRecord>(&self, query: &Query, fetched: &Fetched<T>, payload: &str) {
        let config = &self.inner.config;
        if !config.within_item_limit(fetched.rows.len()) {
            access!(
                self,
                table = %query.table,
                rows = fetched.rows.len(),
                "result over item limit, not cached"
            );
            return;
        }

        let mut tasks: Vec<Task> = Vec::with_capacity(2);
        if config.level.caches_search() {
            let store = Arc::clone(&self.inner.store);
            let table = query.table.clone();
            let kv = Kv::new(
                self.inner
                    .keys
                    .search_key(&query.table, &query.sql, &query.params),
                encode_search(fetched.rows_affected, payload),
            );
            tasks.push(Box::pin(async move {
                if let Err(e) = store.set(kv).await {
                    error!(table = %table, error = %e, "set search cache failed");
                }
            }));
        }
        if config.level.caches_primary() {
            let kvs = self.point_entries(&query.table, &fetched.rows);
            if !kvs.is_empty() {
                let store = Arc::clone(&self.inner.store);
                let table = query.table.clone();
                tasks.push(Box::pin(async move {
                    let count = kvs.len();
                    if let Err(e) = store.batch_set(kvs).await {
                        error!(table = %table, count, error = %e, "set point cache failed");
                    }
                }));
            }
        }
        self.dispatch(tasks).await;
    }

    /// One entry per row under its primary key, plus one per unique index.
    fn point_entries<T: CacheRecord>(&self, table: &str, rows: &[T]) -> Vec<Kv> {
        let primary: Option<Vec<KeyTuple>> = rows.iter().map(CacheRecord::primary_key).collect();
        if primary.is_none() {
            access!(self, table, "rows without a primary key, primary cache skipped");
        }

        let keys = &self.inner.keys;
        let mut kvs = Vec::with_capacity(rows.len());
        let mut indexes = BTreeSet::new();
        for (i, row) in rows.iter().enumerate() {
            let json = match encode_rows(row) {
                Ok(json) => json,
                Err(e) => {
                    warn!(table, error = %e, "cannot encode row, not cached");
                    continue;
                }
            };
            for (index, key) in row.unique_keys() {
                kvs.push(Kv::new(keys.unique_key(table, &index, &key), json.clone()));
                indexes.insert(index);
            }
            if let Some(primary) = &primary {
                kvs.push(Kv::new(keys.primary_key(table, &primary[i]), json));
            }
        }
        self.remember_unique_indexes(table, indexes);
        kvs
    }

    async fn remember_not_found(&self, query: &Query) {
        let config = &self.inner.config;
        if !config.penetration_protection || !config.level.caches_search() {
            return;
        }
        access!(self, table = %query.table, sql = %query.sql, "caching not-found result");
        let store = Arc::clone(&self.inner.store);
        let table = query.table.clone();
        let kv = Kv::new(
            self.inner
                .keys
                .search_key(&query.table, &query.sql, &query.params),
            NOT_FOUND_SENTINEL,
        );
        let task: Task = Box::pin(async move {
            if let Err(e) = store.set(kv).await {
                error!(table = %table, error = %e, "set negative cache failed");
            }
        });
        self.dispatch(vec![task]).await;
    }
}
