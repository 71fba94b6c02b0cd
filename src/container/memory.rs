//! In-memory Container used for tests and `in_memory_db` nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;

use crate::core::{Feed, ObjectKey, Root, Signature, sha256_bytes};

use super::{Container, ContainerError, Getter, Pack, ReceivedRoot, WantSink};

/// Feeds, heads and objects held in process memory.
///
/// Signature verification is a stub: any signature over a well-formed body is
/// accepted. Fillers run on their own threads and abort once their feed is
/// deleted.
pub struct MemoryContainer {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    state: Mutex<State>,
    wants: Mutex<HashMap<ObjectKey, Vec<WantSink>>>,
    del_feed_calls: AtomicUsize,
}

#[derive(Default)]
struct State {
    feeds: HashMap<Feed, FeedState>,
    objects: HashMap<ObjectKey, Bytes>,
}

#[derive(Default)]
struct FeedState {
    heads: HashMap<u64, HeadState>,
    active: u64,
}

struct HeadState {
    last: Root,
    full: bool,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(State::default()),
                wants: Mutex::new(HashMap::new()),
                del_feed_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Store an object and deliver it to any waiting sinks.
    pub fn store_object(&self, value: Bytes) -> ObjectKey {
        let key = sha256_bytes(&value);
        self.inner.store_object(key, value);
        key
    }

    pub fn has_object(&self, key: &ObjectKey) -> bool {
        self.inner.lock_state().objects.contains_key(key)
    }

    /// How many times `del_feed` has been invoked.
    pub fn del_feed_calls(&self) -> usize {
        self.inner.del_feed_calls.load(Ordering::Relaxed)
    }
}

impl Default for MemoryContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("container state lock poisoned")
    }

    fn store_object(&self, key: ObjectKey, value: Bytes) {
        self.lock_state().objects.insert(key, value.clone());
        let sinks = self
            .wants
            .lock()
            .expect("container wants lock poisoned")
            .remove(&key);
        for sink in sinks.unwrap_or_default() {
            let _ = sink.try_send(value.clone());
        }
    }

    fn has_feed(&self, feed: &Feed) -> bool {
        self.lock_state().feeds.contains_key(feed)
    }

    fn missing_refs(&self, root: &Root) -> Result<Vec<ObjectKey>, ContainerError> {
        let refs = root.refs()?;
        let state = self.lock_state();
        Ok(refs
            .into_iter()
            .filter(|key| !state.objects.contains_key(key))
            .collect())
    }

    fn mark_full(&self, root: &Root) {
        let mut state = self.lock_state();
        if let Some(feed) = state.feeds.get_mut(&root.feed)
            && let Some(head) = feed.heads.get_mut(&root.nonce)
            && head.last.seq == root.seq
        {
            head.full = true;
        }
    }
}

impl Container for MemoryContainer {
    fn add_feed(&self, feed: &Feed) -> Result<(), ContainerError> {
        self.inner
            .lock_state()
            .feeds
            .entry(*feed)
            .or_default();
        Ok(())
    }

    fn del_feed(&self, feed: &Feed) -> Result<(), ContainerError> {
        self.inner.del_feed_calls.fetch_add(1, Ordering::Relaxed);
        match self.inner.lock_state().feeds.remove(feed) {
            Some(_) => Ok(()),
            None => Err(ContainerError::NoSuchFeed),
        }
    }

    fn last_root(&self, feed: &Feed, nonce: u64) -> Result<Root, ContainerError> {
        let state = self.inner.lock_state();
        let feed_state = state.feeds.get(feed).ok_or(ContainerError::NoSuchFeed)?;
        let head = feed_state
            .heads
            .get(&nonce)
            .ok_or(ContainerError::NoSuchHead)?;
        Ok(head.last.clone())
    }

    fn last_root_seq(&self, feed: &Feed, nonce: u64) -> Result<u64, ContainerError> {
        Ok(self.last_root(feed, nonce)?.seq)
    }

    fn active_head(&self, feed: &Feed) -> u64 {
        let state = self.inner.lock_state();
        state.feeds.get(feed).map(|f| f.active).unwrap_or(0)
    }

    fn received_root(
        &self,
        sig: Signature,
        body: Bytes,
    ) -> Result<ReceivedRoot, ContainerError> {
        let root = Root::from_signed_body(sig, body)?;
        let is_full = self.inner.missing_refs(&root)?.is_empty();

        let mut state = self.inner.lock_state();
        if let Some(feed_state) = state.feeds.get_mut(&root.feed) {
            let newer = feed_state
                .heads
                .get(&root.nonce)
                .is_none_or(|head| root.seq > head.last.seq);
            if newer {
                feed_state.heads.insert(
                    root.nonce,
                    HeadState {
                        last: root.clone(),
                        full: is_full,
                    },
                );
                feed_state.active = root.nonce;
            }
        }

        Ok(ReceivedRoot { root, is_full })
    }

    fn want(&self, key: &ObjectKey, sink: WantSink) {
        // register before checking so a concurrent store cannot fall between;
        // the sink holds one slot, a double delivery loses the second send
        {
            let mut wants = self
                .inner
                .wants
                .lock()
                .expect("container wants lock poisoned");
            let sinks = wants.entry(*key).or_default();
            if !sinks.iter().any(|s| s.same_channel(&sink)) {
                sinks.push(sink.clone());
            }
        }
        if let Some(value) = self.inner.lock_state().objects.get(key).cloned() {
            let _ = sink.try_send(value);
            self.unwant(key, &sink);
        }
    }

    fn unwant(&self, key: &ObjectKey, sink: &WantSink) {
        let mut wants = self
            .inner
            .wants
            .lock()
            .expect("container wants lock poisoned");
        let now_empty = wants.get_mut(key).map(|sinks| {
            sinks.retain(|s| !s.same_channel(sink));
            sinks.is_empty()
        });
        if now_empty == Some(true) {
            wants.remove(key);
        }
    }

    fn fill(&self, root: Root, getter: Arc<dyn Getter>) {
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || run_filler(&inner, &root, getter.as_ref()));
    }

    fn preview(
        &self,
        root: &Root,
        getter: Arc<dyn Getter>,
    ) -> Result<Box<dyn Pack>, ContainerError> {
        Ok(Box::new(MemoryPack {
            inner: Arc::clone(&self.inner),
            root: root.clone(),
            getter,
        }))
    }

    fn close(&self) {
        self.inner.lock_state().feeds.clear();
        self.inner
            .wants
            .lock()
            .expect("container wants lock poisoned")
            .clear();
    }
}

fn run_filler(inner: &MemoryInner, root: &Root, getter: &dyn Getter) {
    let missing = match inner.missing_refs(root) {
        Ok(missing) => missing,
        Err(err) => {
            tracing::warn!("filler cannot read root body: {err}");
            return;
        }
    };

    for key in missing {
        if !inner.has_feed(&root.feed) {
            return; // feed deleted under us
        }
        match getter.get(&key) {
            Ok(value) => inner.store_object(key, value),
            Err(err) => {
                tracing::warn!("filler aborted fetching {key}: {err}");
                return;
            }
        }
    }

    inner.mark_full(root);
}

struct MemoryPack {
    inner: Arc<MemoryInner>,
    root: Root,
    getter: Arc<dyn Getter>,
}

impl Pack for MemoryPack {
    fn root(&self) -> &Root {
        &self.root
    }

    fn get(&self, key: &ObjectKey) -> Result<Bytes, ContainerError> {
        if let Some(value) = self.inner.lock_state().objects.get(key).cloned() {
            return Ok(value);
        }
        self.getter
            .get(key)
            .map_err(|err| ContainerError::Other(err.to_string()))
    }
}
