//! Write-path invalidation
//!
//! After a committed write the affected point entries are deleted (exactly,
//! when the predicate named the keys, or by sweeping the namespace when it
//! did not), and every search entry for the table is swept. Unique indexes
//! the write does not name tuples for are swept whole, for every index the
//! coordinator knows of on the table. Creates touch only the search
//! namespace.

use std::sync::Arc;

use tracing::{debug, error};

use crate::coordinator::{Coordinator, Task, access};
use crate::keys::{KeyTuple, singleflight_prefix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Update,
    Delete,
}

/// Unique-index tuples extracted from a write's predicate.
///
/// `keys: None` means the affected tuples are unknown and every entry of
/// the index is swept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIndexKeys {
    pub index: String,
    pub keys: Option<Vec<KeyTuple>>,
}

/// A committed write against a backing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEvent {
    pub table: String,
    pub kind: WriteKind,
    pub rows_affected: u64,
    /// Primary-key tuples from the predicate; `None` sweeps the table's
    /// primary namespace
    pub primary_keys: Option<Vec<KeyTuple>>,
    pub unique_indexes: Vec<UniqueIndexKeys>,
}

impl WriteEvent {
    pub fn new(table: impl Into<String>, kind: WriteKind, rows_affected: u64) -> Self {
        Self {
            table: table.into(),
            kind,
            rows_affected,
            primary_keys: None,
            unique_indexes: Vec::new(),
        }
    }

    pub fn created(table: impl Into<String>, rows_affected: u64) -> Self {
        Self::new(table, WriteKind::Create, rows_affected)
    }

    pub fn updated(table: impl Into<String>, rows_affected: u64) -> Self {
        Self::new(table, WriteKind::Update, rows_affected)
    }

    pub fn deleted(table: impl Into<String>, rows_affected: u64) -> Self {
        Self::new(table, WriteKind::Delete, rows_affected)
    }

    pub fn with_primary_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<KeyTuple>,
    {
        self.primary_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_unique_keys<I, K>(mut self, index: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<KeyTuple>,
    {
        self.unique_indexes.push(UniqueIndexKeys {
            index: index.into(),
            keys: Some(keys.into_iter().map(Into::into).collect()),
        });
        self
    }

    /// Sweep every entry of `index` because the affected tuples are unknown.
    pub fn with_unknown_unique_keys(mut self, index: impl Into<String>) -> Self {
        self.unique_indexes.push(UniqueIndexKeys {
            index: index.into(),
            keys: None,
        });
        self
    }

    /// Primary keys to delete exactly, if the predicate yielded any.
    pub(crate) fn exact_primary_keys(&self) -> Option<&[KeyTuple]> {
        self.primary_keys.as_deref().filter(|keys| !keys.is_empty())
    }
}

impl UniqueIndexKeys {
    pub(crate) fn exact_keys(&self) -> Option<&[KeyTuple]> {
        self.keys.as_deref().filter(|keys| !keys.is_empty())
    }
}

/// One point-namespace deletion.
#[derive(Debug)]
enum Purge {
    Keys(Vec<String>),
    Prefix(String),
}

impl Coordinator {
    /// Invalidate whatever a committed write may have made stale.
    ///
    /// Does nothing for writes that affected no rows, for tables outside the
    /// allow-list, or when invalidation is disabled. Failures are logged and
    /// never undo the write.
    pub async fn after_write(&self, event: &WriteEvent) {
        if event.rows_affected == 0
            || !self.inner.config.invalidate_on_write
            || !self.is_cached_table(&event.table)
        {
            return;
        }

        // Reads already in flight may return pre-write rows; later callers
        // must not join them.
        self.inner
            .flights
            .forget_prefix(&singleflight_prefix(&event.table));

        let level = self.inner.config.level;
        let mut tasks: Vec<Task> = Vec::with_capacity(2);
        if event.kind != WriteKind::Create && level.caches_primary() {
            tasks.push(self.point_invalidation(event));
        }
        if level.caches_search() {
            let store = Arc::clone(&self.inner.store);
            let table = event.table.clone();
            let prefix = self.inner.keys.search_prefix(&event.table);
            tasks.push(Box::pin(async move {
                match store.delete_prefix(&prefix).await {
                    Ok(()) => debug!(table = %table, "search cache invalidated"),
                    Err(e) => {
                        error!(table = %table, error = %e, "invalidating search cache failed")
                    }
                }
            }));
        }

        access!(self, table = %event.table, kind = ?event.kind, "invalidating after write");
        self.dispatch(tasks).await;
    }

    fn point_invalidation(&self, event: &WriteEvent) -> Task {
        let keys = &self.inner.keys;
        let table = &event.table;

        let mut purges = Vec::with_capacity(1 + event.unique_indexes.len());
        purges.push(match event.exact_primary_keys() {
            Some(tuples) => {
                Purge::Keys(tuples.iter().map(|t| keys.primary_key(table, t)).collect())
            }
            None => Purge::Prefix(keys.primary_prefix(table)),
        });
        for unique in &event.unique_indexes {
            purges.push(match unique.exact_keys() {
                Some(tuples) => Purge::Keys(
                    tuples
                        .iter()
                        .map(|t| keys.unique_key(table, &unique.index, t))
                        .collect(),
                ),
                None => Purge::Prefix(keys.unique_prefix(table, &unique.index)),
            });
        }
        // Indexes the event does not mention are swept whole.
        for index in self.unique_indexes(table) {
            if !event.unique_indexes.iter().any(|u| u.index == index) {
                purges.push(Purge::Prefix(keys.unique_prefix(table, &index)));
            }
        }

        let store = Arc::clone(&self.inner.store);
        let table = table.clone();
        Box::pin(async move {
            for purge in &purges {
                let result = match purge {
                    Purge::Keys(keys) => store.batch_delete(keys).await,
                    Purge::Prefix(prefix) => store.delete_prefix(prefix).await,
                };
                if let Err(e) = result {
                    error!(table = %table, ?purge, error = %e, "invalidating point cache failed");
                }
            }
            debug!(table = %table, purges = purges.len(), "point cache invalidated");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_lists_fall_back_to_sweeps() {
        let event = WriteEvent::updated("users", 3).with_primary_keys(Vec::<KeyTuple>::new());
        assert_eq!(event.exact_primary_keys(), None);

        let event = WriteEvent::updated("users", 1).with_primary_keys([7]);
        assert_eq!(event.exact_primary_keys(), Some(&[KeyTuple::from(7)][..]));
    }

    #[test]
    fn unique_descriptors_accumulate() {
        let event = WriteEvent::deleted("users", 1)
            .with_unique_keys("idx_email", ["a@example.com"])
            .with_unknown_unique_keys("idx_login");
        assert_eq!(event.unique_indexes.len(), 2);
        assert!(event.unique_indexes[0].exact_keys().is_some());
        assert!(event.unique_indexes[1].exact_keys().is_none());
    }
}
