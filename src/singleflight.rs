//! Duplicate suppression for concurrent identical reads
//!
//! The first caller for a key becomes the leader and performs the work; later
//! callers join as followers and wait for the leader's result. The registry
//! lock is held only to look up, insert or remove a record, never across the
//! leader's work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::lock::mutex_lock;

const SOURCE: &str = "singleflight";

/// An in-flight call that followers can wait on.
struct Call<T> {
    key: String,
    tx: watch::Sender<Option<T>>,
    /// Number of followers that joined this call
    dups: AtomicUsize,
    /// Set under the registry lock when the key was forgotten while in flight
    forgotten: AtomicBool,
}

type Registry<T> = Arc<Mutex<HashMap<String, Arc<Call<T>>>>>;

/// A namespace of calls executed with duplicate suppression.
pub struct Group<T> {
    calls: Registry<T>,
}

impl<T> Clone for Group<T> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Role assigned to a caller by [`Group::join`].
pub enum Flight<T> {
    Leader(Leader<T>),
    Follower(Follower<T>),
}

impl<T: Clone> Group<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the call for `key`, becoming its leader if none is in flight.
    pub fn join(&self, key: &str) -> Flight<T> {
        let mut calls = mutex_lock(&self.calls, SOURCE, "join");
        if let Some(call) = calls.get(key) {
            call.dups.fetch_add(1, Ordering::Relaxed);
            return Flight::Follower(Follower {
                rx: call.tx.subscribe(),
            });
        }

        let (tx, _rx) = watch::channel(None);
        let call = Arc::new(Call {
            key: key.to_owned(),
            tx,
            dups: AtomicUsize::new(0),
            forgotten: AtomicBool::new(false),
        });
        calls.insert(key.to_owned(), Arc::clone(&call));
        Flight::Leader(Leader {
            calls: Arc::clone(&self.calls),
            call,
        })
    }

    /// Stop serving late joiners from the in-flight call for `key`.
    ///
    /// Followers that already joined still receive the leader's result.
    pub fn forget(&self, key: &str) {
        let mut calls = mutex_lock(&self.calls, SOURCE, "forget");
        if let Some(call) = calls.remove(key) {
            call.forgotten.store(true, Ordering::Relaxed);
        }
    }

    /// Forget every in-flight call whose key starts with `prefix`.
    pub fn forget_prefix(&self, prefix: &str) {
        let mut calls = mutex_lock(&self.calls, SOURCE, "forget_prefix");
        calls.retain(|key, call| {
            if key.starts_with(prefix) {
                call.forgotten.store(true, Ordering::Relaxed);
                false
            } else {
                true
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        mutex_lock(&self.calls, SOURCE, "in_flight").len()
    }
}

/// The caller responsible for producing the result.
///
/// Dropping the leader without calling [`Leader::complete`] (error path,
/// panic or cancellation) still removes the record, and its followers observe
/// an abandoned call instead of waiting forever.
pub struct Leader<T> {
    calls: Registry<T>,
    call: Arc<Call<T>>,
}

impl<T> Leader<T> {
    pub fn key(&self) -> &str {
        &self.call.key
    }

    /// Number of followers that have joined so far.
    pub fn dups(&self) -> usize {
        self.call.dups.load(Ordering::Relaxed)
    }

    /// Broadcast `value` to every follower and release the key.
    pub fn complete(self, value: T) {
        self.call.tx.send_replace(Some(value));
    }
}

impl<T> Drop for Leader<T> {
    fn drop(&mut self) {
        let mut calls = mutex_lock(&self.calls, SOURCE, "complete");
        // A forgotten key may already belong to a newer call.
        if !self.call.forgotten.load(Ordering::Relaxed) {
            calls.remove(&self.call.key);
        }
    }
}

/// A caller waiting on another caller's in-flight work.
pub struct Follower<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Follower<T> {
    /// Wait for the leader's result; `None` if the leader was abandoned.
    pub async fn wait(mut self) -> Option<T> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn leader(flight: Flight<u32>) -> Leader<u32> {
        match flight {
            Flight::Leader(leader) => leader,
            Flight::Follower(_) => panic!("expected leader"),
        }
    }

    fn follower(flight: Flight<u32>) -> Follower<u32> {
        match flight {
            Flight::Follower(follower) => follower,
            Flight::Leader(_) => panic!("expected follower"),
        }
    }

    #[tokio::test]
    async fn followers_receive_the_leader_result() {
        let group = Group::new();
        let lead = leader(group.join("k"));
        let waiters: Vec<_> = (0..5).map(|_| follower(group.join("k"))).collect();
        assert_eq!(lead.dups(), 5);

        let handles: Vec<_> = waiters
            .into_iter()
            .map(|f| tokio::spawn(f.wait()))
            .collect();
        lead.complete(42);

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(42));
        }
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn late_follower_sees_value_sent_before_it_waited() {
        let group = Group::new();
        let lead = leader(group.join("k"));
        let waiter = follower(group.join("k"));
        lead.complete(7);
        assert_eq!(waiter.wait().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_leader_releases_followers_and_registry() {
        let group: Group<u32> = Group::new();
        let lead = leader(group.join("k"));
        let waiter = follower(group.join("k"));
        drop(lead);

        let got = tokio::time::timeout(Duration::from_secs(1), waiter.wait())
            .await
            .expect("follower must not deadlock");
        assert_eq!(got, None);
        assert_eq!(group.in_flight(), 0);
        assert!(matches!(group.join("k"), Flight::Leader(_)));
    }

    #[test]
    fn forget_is_safe_without_a_record() {
        let group: Group<u32> = Group::new();
        group.forget("missing");
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn forgotten_key_starts_a_fresh_call() {
        let group = Group::new();
        let first = leader(group.join("k"));
        group.forget("k");

        // A new caller leads instead of joining the stale call.
        let second = leader(group.join("k"));
        assert_eq!(group.in_flight(), 1);

        // Completing the forgotten call must not evict the newer record.
        first.complete(1);
        assert_eq!(group.in_flight(), 1);
        let waiter = follower(group.join("k"));
        second.complete(2);
        assert_eq!(waiter.wait().await, Some(2));
        assert_eq!(group.in_flight(), 0);
    }

    #[test]
    fn forget_prefix_only_touches_matching_keys() {
        let group: Group<u32> = Group::new();
        let _a = leader(group.join("users:q1"));
        let _b = leader(group.join("users:q2"));
        let _c = leader(group.join("posts:q1"));
        group.forget_prefix("users:");
        assert_eq!(group.in_flight(), 1);
    }

    #[test]
    fn concurrent_forget_and_completion_leave_registry_empty() {
        let group: Group<u32> = Group::new();
        for i in 0..10 {
            let lead = leader(group.join(&format!("key-{i}")));
            let g = group.clone();
            let key = format!("key-{i}");
            let handle = std::thread::spawn(move || g.forget(&key));
            lead.complete(i);
            handle.join().unwrap();
        }
        assert_eq!(group.in_flight(), 0);
    }
}
