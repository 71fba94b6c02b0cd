//! Node-wide feed registry: shared feeds and their subscribers.
//!
//! One reader-writer lock guards the subscribers map and the per-connection
//! mirror so both stay consistent. Broadcast callers take snapshots; sends
//! never happen under the lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::core::Feed;

use super::conn::ConnId;

pub(crate) struct FeedRegistry<C> {
    inner: RwLock<Inner<C>>,
}

struct Inner<C> {
    subscribers: HashMap<Feed, HashMap<ConnId, C>>,
    by_conn: HashMap<ConnId, HashSet<Feed>>,
    // copy-on-write feed list, rebuilt lazily after any mutation
    list: Option<Arc<[Feed]>>,
}

impl<C: Clone> FeedRegistry<C> {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                subscribers: HashMap::new(),
                by_conn: HashMap::new(),
                list: None,
            }),
        }
    }

    /// Returns false if the feed was already shared.
    pub(crate) fn add_feed(&self, feed: &Feed) -> bool {
        let mut inner = self.write();
        if inner.subscribers.contains_key(feed) {
            return false;
        }
        inner.subscribers.insert(*feed, HashMap::new());
        inner.list = None;
        true
    }

    /// Drop the feed and every subscription to it. Returns the connections
    /// that were subscribed, or `None` if the feed was not shared.
    pub(crate) fn del_feed(&self, feed: &Feed) -> Option<Vec<C>> {
        let mut inner = self.write();
        let subscribers = inner.subscribers.remove(feed)?;
        inner.list = None;
        for id in subscribers.keys() {
            let now_empty = inner.by_conn.get_mut(id).map(|feeds| {
                feeds.remove(feed);
                feeds.is_empty()
            });
            if now_empty == Some(true) {
                inner.by_conn.remove(id);
            }
        }
        Some(subscribers.into_values().collect())
    }

    pub(crate) fn has_feed(&self, feed: &Feed) -> bool {
        self.read().subscribers.contains_key(feed)
    }

    /// Stable snapshot of the shared feeds.
    pub(crate) fn feeds(&self) -> Arc<[Feed]> {
        if let Some(list) = &self.read().list {
            return Arc::clone(list);
        }
        let mut inner = self.write();
        if let Some(list) = &inner.list {
            return Arc::clone(list);
        }
        let list: Arc<[Feed]> = inner.subscribers.keys().copied().collect();
        inner.list = Some(Arc::clone(&list));
        list
    }

    /// Returns false if the feed is not shared; a connection may only be
    /// subscribed to feeds in the shared set.
    pub(crate) fn add_conn_feed(&self, id: ConnId, conn: &C, feed: &Feed) -> bool {
        let mut inner = self.write();
        let Some(subscribers) = inner.subscribers.get_mut(feed) else {
            return false;
        };
        subscribers.insert(id, conn.clone());
        inner.by_conn.entry(id).or_default().insert(*feed);
        true
    }

    pub(crate) fn del_conn_feed(&self, id: ConnId, feed: &Feed) -> bool {
        let mut inner = self.write();
        let deleted = inner
            .subscribers
            .get_mut(feed)
            .is_some_and(|subscribers| subscribers.remove(&id).is_some());
        let now_empty = inner.by_conn.get_mut(&id).map(|feeds| {
            feeds.remove(feed);
            feeds.is_empty()
        });
        if now_empty == Some(true) {
            inner.by_conn.remove(&id);
        }
        deleted
    }

    pub(crate) fn has_conn_feed(&self, id: ConnId, feed: &Feed) -> bool {
        self.read()
            .by_conn
            .get(&id)
            .is_some_and(|feeds| feeds.contains(feed))
    }

    pub(crate) fn feeds_of_connection(&self, id: ConnId) -> Vec<Feed> {
        self.read()
            .by_conn
            .get(&id)
            .map(|feeds| feeds.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the connections subscribed to a feed.
    pub(crate) fn subscribers(&self, feed: &Feed) -> Vec<C> {
        self.read()
            .subscribers
            .get(feed)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Purge a closing connection from every subscription set.
    pub(crate) fn del_connection(&self, id: ConnId) {
        let mut inner = self.write();
        let Some(feeds) = inner.by_conn.remove(&id) else {
            return;
        };
        for feed in feeds {
            if let Some(subscribers) = inner.subscribers.get_mut(&feed) {
                subscribers.remove(&id);
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner<C>> {
        self.inner.read().expect("feed registry lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner<C>> {
        self.inner.write().expect("feed registry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(b: u8) -> Feed {
        Feed([b; 32])
    }

    fn registry() -> FeedRegistry<&'static str> {
        FeedRegistry::new()
    }

    #[test]
    fn add_feed_is_idempotent() {
        let reg = registry();
        assert!(reg.add_feed(&feed(1)));
        assert!(!reg.add_feed(&feed(1)));
        assert!(reg.has_feed(&feed(1)));
    }

    #[test]
    fn subscription_requires_shared_feed() {
        let reg = registry();
        assert!(!reg.add_conn_feed(ConnId(1), &"c1", &feed(1)));
        reg.add_feed(&feed(1));
        assert!(reg.add_conn_feed(ConnId(1), &"c1", &feed(1)));
        assert!(reg.has_conn_feed(ConnId(1), &feed(1)));
    }

    #[test]
    fn mirror_stays_consistent() {
        let reg = registry();
        reg.add_feed(&feed(1));
        reg.add_feed(&feed(2));
        reg.add_conn_feed(ConnId(1), &"c1", &feed(1));
        reg.add_conn_feed(ConnId(1), &"c1", &feed(2));
        reg.add_conn_feed(ConnId(2), &"c2", &feed(1));

        let mut of_one = reg.feeds_of_connection(ConnId(1));
        of_one.sort();
        assert_eq!(of_one, vec![feed(1), feed(2)]);

        reg.del_conn_feed(ConnId(1), &feed(1));
        assert!(!reg.has_conn_feed(ConnId(1), &feed(1)));
        assert!(reg.has_conn_feed(ConnId(1), &feed(2)));
        assert_eq!(reg.subscribers(&feed(1)), vec!["c2"]);
    }

    #[test]
    fn del_feed_returns_subscribers_and_clears_mirror() {
        let reg = registry();
        reg.add_feed(&feed(1));
        reg.add_conn_feed(ConnId(1), &"c1", &feed(1));
        reg.add_conn_feed(ConnId(2), &"c2", &feed(1));

        let mut drained = reg.del_feed(&feed(1)).unwrap();
        drained.sort();
        assert_eq!(drained, vec!["c1", "c2"]);
        assert!(!reg.has_feed(&feed(1)));
        assert!(!reg.has_conn_feed(ConnId(1), &feed(1)));
        assert!(reg.del_feed(&feed(1)).is_none());
    }

    #[test]
    fn del_connection_purges_every_subscription() {
        let reg = registry();
        reg.add_feed(&feed(1));
        reg.add_feed(&feed(2));
        reg.add_conn_feed(ConnId(1), &"c1", &feed(1));
        reg.add_conn_feed(ConnId(1), &"c1", &feed(2));

        reg.del_connection(ConnId(1));
        assert!(reg.subscribers(&feed(1)).is_empty());
        assert!(reg.subscribers(&feed(2)).is_empty());
        assert!(reg.feeds_of_connection(ConnId(1)).is_empty());
    }

    #[test]
    fn feeds_snapshot_is_cached_until_mutation() {
        let reg = registry();
        reg.add_feed(&feed(1));
        let first = reg.feeds();
        let second = reg.feeds();
        assert!(Arc::ptr_eq(&first, &second));

        reg.add_feed(&feed(2));
        let third = reg.feeds();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.len(), 2);
    }
}
