//! Node-wide want registry: objects awaited by connections.
//!
//! Rendezvous between background fillers, which obtain objects through some
//! connection, and other connections whose `RqObject` requests are still
//! waiting for the same object. Each entry remembers the seq of the request
//! it answers, so the fan-out lands as a properly addressed reply.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::ObjectKey;

use super::conn::ConnId;

pub(crate) struct WantRegistry<C> {
    inner: Mutex<HashMap<ObjectKey, HashMap<ConnId, (u32, C)>>>,
}

impl<C: Clone> WantRegistry<C> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent per connection; a repeated request updates the seq to
    /// answer.
    pub(crate) fn want(&self, key: &ObjectKey, id: ConnId, rseq: u32, conn: &C) {
        self.lock()
            .entry(*key)
            .or_default()
            .insert(id, (rseq, conn.clone()));
    }

    /// Atomically remove and return the waiters with the request seqs they
    /// are owed; each is notified exactly once by the caller, outside the
    /// lock.
    pub(crate) fn got_object(&self, key: &ObjectKey) -> Vec<(u32, C)> {
        self.lock()
            .remove(key)
            .map(|waiters| waiters.into_values().collect())
            .unwrap_or_default()
    }

    pub(crate) fn drop_connection(&self, id: ConnId) {
        let mut wants = self.lock();
        wants.retain(|_, waiters| {
            waiters.remove(&id);
            !waiters.is_empty()
        });
    }

    #[cfg(test)]
    pub(crate) fn waiting(&self, key: &ObjectKey) -> usize {
        self.lock().get(key).map(HashMap::len).unwrap_or(0)
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ObjectKey, HashMap<ConnId, (u32, C)>>> {
        self.inner.lock().expect("want registry lock poisoned")
    }
}
