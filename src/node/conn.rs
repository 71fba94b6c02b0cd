//! Connection: receive loop, request multiplexer, protocol handlers.
//!
//! One receive thread per connection reads framed messages off the link.
//! Replies are matched to in-flight requests by `rseq`; everything else is
//! dispatched by message kind. Protocol violations close the connection with
//! the violation as its close reason.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded};

use crate::container::{ContainerError, Getter, Pack};
use crate::core::{Feed, NodeId, ObjectKey, Root, sha256_bytes};
use crate::transport::{Link, LinkKind};

use super::PROTOCOL_VERSION;
use super::error::{NodeError, ProtocolViolation};
use super::msg::{self, Msg};
use super::node::NodeShared;

pub(crate) const DO_NOT_SHARE: &str = "do not share the feed";
pub(crate) const NOT_PUBLIC: &str = "not a public server";
pub(crate) const RQ_OBJECT_TIMEOUT: &str = "timeout";

const LOCK_POISONED: &str = "connection lock poisoned";
const EVENT_QUEUE_LEN: usize = 8;

/// Registry handle of a connection; stable for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u64);

pub(crate) enum ConnEvent {
    /// The node stopped sharing a feed; notify the peer and acknowledge the
    /// drain by dropping `done`.
    UnsubDeletedFeed { feed: Feed, done: Sender<()> },
}

/// Cheap handle on one peer connection.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    id: ConnId,
    node: Arc<NodeShared>,
    link: Link,
    peer_id: OnceLock<NodeId>,

    // request/response multiplexer
    seq: AtomicU32,
    pending: Mutex<HashMap<u32, Sender<Msg>>>,

    closed: AtomicBool,
    close_reason: Mutex<Option<NodeError>>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,

    events_tx: Sender<ConnEvent>,
    events_rx: Receiver<ConnEvent>,

    recv_thread: Mutex<Option<JoinHandle<()>>>,
    last_io: Mutex<Instant>,
}

impl Conn {
    pub(crate) fn new(id: ConnId, node: Arc<NodeShared>, link: Link) -> Self {
        let (close_tx, close_rx) = bounded(0);
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_LEN);
        Self {
            inner: Arc::new(ConnInner {
                id,
                node,
                link,
                peer_id: OnceLock::new(),
                seq: AtomicU32::new(0),
                pending: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                close_reason: Mutex::new(None),
                close_tx: Mutex::new(Some(close_tx)),
                close_rx,
                events_tx,
                events_rx,
                recv_thread: Mutex::new(None),
                last_io: Mutex::new(Instant::now()),
            }),
        }
    }

    //
    // info
    //

    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    /// Remote peer id, known once the handshake has completed.
    pub fn peer_id(&self) -> Option<NodeId> {
        self.inner.peer_id.get().copied()
    }

    pub fn is_incoming(&self) -> bool {
        self.inner.link.is_incoming()
    }

    pub fn is_outgoing(&self) -> bool {
        !self.is_incoming()
    }

    pub fn kind(&self) -> LinkKind {
        self.inner.link.kind()
    }

    pub fn address(&self) -> String {
        self.inner.link.remote_addr().to_string()
    }

    /// Feeds this connection exchanges with the peer.
    pub fn feeds(&self) -> Vec<Feed> {
        self.inner.node.feeds.feeds_of_connection(self.id())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<NodeError> {
        self.inner.close_reason.lock().expect(LOCK_POISONED).clone()
    }

    //
    // requests
    //

    /// List of feeds the remote peer shares. Only public peers answer.
    pub fn remote_feeds(&self) -> Result<Vec<Feed>, NodeError> {
        match self.send_request(&Msg::RqList)? {
            Msg::List { feeds } => Ok(feeds),
            Msg::Err { text } if text == NOT_PUBLIC => Err(NodeError::NonPublicPeer),
            Msg::Err { text } => Err(NodeError::Remote(text)),
            _ => Err(NodeError::UnexpectedResponse),
        }
    }

    /// Subscribe to a feed of the remote peer. The feed is added to this
    /// node first and stays added even if the peer rejects the request.
    pub fn subscribe(&self, feed: Feed) -> Result<(), NodeError> {
        self.inner.node.add_feed(&feed)?;

        match self.send_request(&Msg::Sub { feed })? {
            Msg::Ok => {}
            Msg::Err { text } => return Err(NodeError::SubscriptionRejected(text)),
            _ => return Err(NodeError::UnexpectedResponse),
        }

        self.inner.node.feeds.add_conn_feed(self.id(), self, &feed);
        self.send_last_root(&feed);
        Ok(())
    }

    /// Stop exchanging a feed with the peer. Fire-and-forget.
    pub fn unsubscribe(&self, feed: Feed) {
        self.inner.node.feeds.del_conn_feed(self.id(), &feed);
        let seq = self.next_seq();
        self.send_msg(seq, 0, &Msg::Unsub { feed });
    }

    /// Fetch the peer's latest Root of `feed` and hand a preview of it to
    /// `preview_fn`; missing objects are resolved through this connection.
    /// If the callback returns true a normal subscription follows.
    pub fn preview<F>(&self, feed: Feed, preview_fn: F) -> Result<(), NodeError>
    where
        F: FnOnce(&dyn Pack, &Root) -> bool,
    {
        let root = match self.send_request(&Msg::RqPreview { feed })? {
            Msg::Root(root) => {
                self.inner
                    .node
                    .container
                    .received_root(root.sig, root.body)?
                    .root
            }
            Msg::Err { text } => return Err(NodeError::Remote(text)),
            _ => return Err(NodeError::UnexpectedResponse),
        };

        let pack = self.inner.node.container.preview(&root, self.getter())?;
        if preview_fn(pack.as_ref(), &root) {
            self.subscribe(feed)?;
        }
        Ok(())
    }

    /// This connection as an object getter backed by `RqObject`.
    pub fn getter(&self) -> Arc<dyn Getter> {
        Arc::new(ConnGetter { conn: self.clone() })
    }

    pub fn close(&self) {
        self.close_with(None);
    }

    //
    // lifecycle
    //

    /// Handshake then serve; promotion and the receive loop run on one
    /// thread, mirroring the connection's single-task design.
    pub(crate) fn start(&self, hs_tx: Option<Sender<Result<(), NodeError>>>) {
        let conn = self.clone();
        let wg = self.inner.node.wg_clone();
        let handle = thread::spawn(move || {
            let _wg = wg;
            match conn.handshake() {
                Ok(()) => {
                    if let Some(hs_tx) = hs_tx {
                        let _ = hs_tx.send(Ok(()));
                    }
                    if conn.inner.node.promote_conn(&conn) {
                        conn.recv_loop();
                    } else {
                        conn.close_with(Some(NodeError::Closed));
                    }
                }
                Err(err) => {
                    tracing::warn!("[{conn}] handshake failed: {err}");
                    if let Some(hs_tx) = hs_tx {
                        let _ = hs_tx.send(Err(err.clone()));
                    }
                    conn.close_with(Some(err));
                }
            }
        });
        *self.inner.recv_thread.lock().expect(LOCK_POISONED) = Some(handle);
    }

    fn handshake(&self) -> Result<(), NodeError> {
        let timeout = self.inner.node.config.response_timeout();
        if self.is_incoming() {
            self.handshake_accept(timeout)
        } else {
            self.handshake_dial(timeout)
        }
    }

    fn handshake_dial(&self, timeout: Duration) -> Result<(), NodeError> {
        let nonce: u64 = rand::random();
        let seq = self.next_seq();
        self.send_msg(
            seq,
            0,
            &Msg::Hello {
                version: PROTOCOL_VERSION,
                node_id: self.inner.node.node_id,
                nonce,
            },
        );

        let raw = self.recv_frame(timeout)?;
        let (_, rseq, reply) =
            msg::decode(&raw).map_err(|err| NodeError::Protocol(err.into()))?;
        match reply {
            Msg::Welcome { node_id, nonce: echo } if rseq == seq && echo == nonce => {
                let _ = self.inner.peer_id.set(node_id);
                Ok(())
            }
            Msg::Err { text } => Err(NodeError::Remote(text)),
            _ => Err(NodeError::Protocol(ProtocolViolation::UnexpectedHandshake)),
        }
    }

    fn handshake_accept(&self, timeout: Duration) -> Result<(), NodeError> {
        let raw = self.recv_frame(timeout)?;
        let (seq, _, hello) =
            msg::decode(&raw).map_err(|err| NodeError::Protocol(err.into()))?;
        match hello {
            Msg::Hello {
                version,
                node_id,
                nonce,
            } => {
                if version != PROTOCOL_VERSION {
                    self.send_err(seq, "unsupported protocol version");
                    return Err(NodeError::Protocol(ProtocolViolation::VersionMismatch {
                        got: version,
                        ours: PROTOCOL_VERSION,
                    }));
                }
                let _ = self.inner.peer_id.set(node_id);
                let reply_seq = self.next_seq();
                self.send_msg(
                    reply_seq,
                    seq,
                    &Msg::Welcome {
                        node_id: self.inner.node.node_id,
                        nonce,
                    },
                );
                Ok(())
            }
            _ => Err(NodeError::Protocol(ProtocolViolation::UnexpectedHandshake)),
        }
    }

    fn recv_frame(&self, timeout: Duration) -> Result<Vec<u8>, NodeError> {
        let in_rx = self.inner.link.inbound().clone();
        let close_rx = self.inner.close_rx.clone();
        if timeout.is_zero() {
            crossbeam::select! {
                recv(in_rx) -> raw => raw.map_err(|_| NodeError::Closed),
                recv(close_rx) -> _ => Err(NodeError::Closed),
            }
        } else {
            crossbeam::select! {
                recv(in_rx) -> raw => raw.map_err(|_| NodeError::Closed),
                recv(close_rx) -> _ => Err(NodeError::Closed),
                default(timeout) => Err(NodeError::Timeout),
            }
        }
    }

    fn recv_loop(&self) {
        let in_rx = self.inner.link.inbound().clone();
        let events_rx = self.inner.events_rx.clone();
        let close_rx = self.inner.close_rx.clone();
        loop {
            crossbeam::select! {
                recv(in_rx) -> raw => match raw {
                    Ok(raw) => {
                        *self.inner.last_io.lock().expect(LOCK_POISONED) = Instant::now();
                        if let Err(err) = self.process_frame(&raw) {
                            self.fatality(err);
                            return;
                        }
                    }
                    // transport gone
                    Err(_) => {
                        self.close_with(None);
                        return;
                    }
                },
                recv(events_rx) -> event => {
                    let Ok(event) = event else { return };
                    self.handle_event(event);
                },
                recv(close_rx) -> _ => return,
            }
        }
    }

    fn process_frame(&self, raw: &[u8]) -> Result<(), NodeError> {
        let (seq, rseq, message) =
            msg::decode(raw).map_err(|err| NodeError::Protocol(err.into()))?;

        // a response for an in-flight request; the sink is single-shot
        if rseq != 0 {
            let sink = self
                .inner
                .pending
                .lock()
                .expect(LOCK_POISONED)
                .get(&rseq)
                .cloned();
            if let Some(sink) = sink {
                let _ = sink.try_send(message);
                return Ok(());
            }
        }

        self.handle(seq, message)
    }

    /// Unsolicited messages, dispatched by kind.
    fn handle(&self, seq: u32, message: Msg) -> Result<(), NodeError> {
        match message {
            Msg::Sub { feed } => self.handle_sub(seq, feed),
            Msg::Unsub { feed } => self.handle_unsub(feed),
            Msg::RqList => {
                self.handle_rq_list(seq);
                Ok(())
            }
            Msg::Root(root) => {
                self.handle_root(root);
                Ok(())
            }
            Msg::RqObject { key, .. } => {
                self.spawn_rq_object(seq, key);
                Ok(())
            }
            Msg::RqPreview { feed } => {
                self.handle_rq_preview(seq, feed);
                Ok(())
            }
            Msg::Ping => {
                let reply_seq = self.next_seq();
                self.send_msg(reply_seq, seq, &Msg::Pong);
                Ok(())
            }
            // delayed responses whose caller already timed out
            Msg::Pong | Msg::Object { .. } | Msg::Ok | Msg::Err { .. } | Msg::List { .. } => {
                Ok(())
            }
            Msg::Hello { .. } | Msg::Welcome { .. } => {
                Err(NodeError::Protocol(ProtocolViolation::UnexpectedHandshake))
            }
        }
    }

    fn handle_sub(&self, seq: u32, feed: Feed) -> Result<(), NodeError> {
        if feed.is_blank() {
            return Err(NodeError::Protocol(ProtocolViolation::BlankFeed));
        }
        let node = &self.inner.node;

        if node.feeds.has_conn_feed(self.id(), &feed) {
            self.send_ok(seq); // already subscribed
            return Ok(());
        }

        if let Some(on_subscribe) = &node.callbacks.on_subscribe_remote
            && let Err(reason) = on_subscribe(self, &feed)
        {
            self.send_err(seq, &reason);
            return Ok(());
        }

        // the callback may have shared the feed meanwhile; still, a feed we
        // do not share cannot be subscribed to
        if !node.feeds.has_feed(&feed) {
            self.send_err(seq, DO_NOT_SHARE);
            return Ok(());
        }

        node.feeds.add_conn_feed(self.id(), self, &feed);
        self.send_ok(seq);
        self.send_last_root(&feed);
        Ok(())
    }

    fn handle_unsub(&self, feed: Feed) -> Result<(), NodeError> {
        if feed.is_blank() {
            return Err(NodeError::Protocol(ProtocolViolation::BlankFeed));
        }
        self.inner.node.feeds.del_conn_feed(self.id(), &feed);
        Ok(())
    }

    fn handle_rq_list(&self, seq: u32) {
        let node = &self.inner.node;
        if !node.config.public_server {
            self.send_err(seq, NOT_PUBLIC);
            return;
        }
        let feeds = node.feeds.feeds().to_vec();
        let reply_seq = self.next_seq();
        self.send_msg(reply_seq, seq, &Msg::List { feeds });
    }

    fn handle_root(&self, root: Root) {
        let node = &self.inner.node;

        // check seq first to avoid signature work for stale Roots
        match node.container.last_root_seq(&root.feed, root.nonce) {
            Err(ContainerError::NoSuchFeed) => return, // unexpected Root
            Err(ContainerError::NoSuchHead) | Err(ContainerError::NotFound) => {}
            Err(err) => {
                tracing::warn!("[{self}] last root lookup failed: {err}");
                return;
            }
            Ok(last) if last >= root.seq => return, // we have a newer one
            Ok(_) => {}
        }

        let received = match node.container.received_root(root.sig, root.body.clone()) {
            Ok(received) => received,
            Err(err) => {
                // bad root from the peer; report it, keep the connection
                tracing::warn!("[{self}] received root error: {err}");
                return;
            }
        };

        if received.is_full {
            return;
        }

        // fill only if the node and this connection exchange the feed
        if node.feeds.has_conn_feed(self.id(), &root.feed) {
            node.container.fill(received.root, self.getter());
        }
    }

    fn spawn_rq_object(&self, seq: u32, key: ObjectKey) {
        let conn = self.clone();
        let wg = self.inner.node.wg_clone();
        thread::spawn(move || {
            let _wg = wg;
            conn.serve_rq_object(seq, key);
        });
    }

    // runs on its own thread so the receive loop never blocks on storage
    fn serve_rq_object(&self, seq: u32, key: ObjectKey) {
        let node = Arc::clone(&self.inner.node);
        let (sink, arrival) = bounded::<Bytes>(1);
        node.container.want(&key, sink.clone());

        if let Ok(value) = arrival.try_recv() {
            let reply_seq = self.next_seq();
            self.send_msg(reply_seq, seq, &Msg::Object { value });
            node.container.unwant(&key, &sink);
            return;
        }

        // not here yet; also register for the out-of-band fan-out, which
        // answers this request's seq if the object arrives past the sinks
        node.wants.want(&key, self.id(), seq, self);

        let timeout = node.config.response_timeout();
        let close_rx = self.inner.close_rx.clone();
        if timeout.is_zero() {
            crossbeam::select! {
                recv(arrival) -> value => {
                    if let Ok(value) = value {
                        let reply_seq = self.next_seq();
                        self.send_msg(reply_seq, seq, &Msg::Object { value });
                    }
                }
                recv(close_rx) -> _ => {} // abandoned
            }
        } else {
            crossbeam::select! {
                recv(arrival) -> value => {
                    if let Ok(value) = value {
                        let reply_seq = self.next_seq();
                        self.send_msg(reply_seq, seq, &Msg::Object { value });
                    }
                }
                recv(close_rx) -> _ => {} // abandoned
                default(timeout) => self.send_err(seq, RQ_OBJECT_TIMEOUT),
            }
        }
        node.container.unwant(&key, &sink);
    }

    fn handle_rq_preview(&self, seq: u32, feed: Feed) {
        let node = &self.inner.node;
        let head = node.container.active_head(&feed);
        match node.container.last_root(&feed, head) {
            Ok(root) => {
                let reply_seq = self.next_seq();
                self.send_msg(reply_seq, seq, &Msg::Root(root));
            }
            Err(err) => self.send_err(seq, &err.to_string()),
        }
    }

    fn handle_event(&self, event: ConnEvent) {
        match event {
            ConnEvent::UnsubDeletedFeed { feed, done } => {
                let seq = self.next_seq();
                self.send_msg(seq, 0, &Msg::Unsub { feed });
                drop(done); // drain acknowledged
            }
        }
    }

    /// Deliver an event to the receive loop unless the connection closes
    /// first. Returns whether the event was enqueued.
    pub(crate) fn enqueue_event(&self, event: ConnEvent) -> bool {
        let events_tx = self.inner.events_tx.clone();
        let close_rx = self.inner.close_rx.clone();
        crossbeam::select! {
            send(events_tx, event) -> sent => sent.is_ok(),
            recv(close_rx) -> _ => false,
        }
    }

    pub(crate) fn close_signal(&self) -> &Receiver<()> {
        &self.inner.close_rx
    }

    pub(crate) fn last_io(&self) -> Instant {
        *self.inner.last_io.lock().expect(LOCK_POISONED)
    }

    //
    // request/response plumbing
    //

    pub(crate) fn next_seq(&self) -> u32 {
        // seq 0 marks unsolicited messages, skip it on wrap
        loop {
            let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }

    fn send_request(&self, request: &Msg) -> Result<Msg, NodeError> {
        if self.is_closed() {
            return Err(NodeError::Closed);
        }

        let (reply_tx, reply_rx) = bounded(1);
        let seq = self.next_seq();
        self.inner
            .pending
            .lock()
            .expect(LOCK_POISONED)
            .insert(seq, reply_tx);

        self.send_msg(seq, 0, request);
        let result = self.wait_reply(&reply_rx);

        self.inner.pending.lock().expect(LOCK_POISONED).remove(&seq);
        result
    }

    fn wait_reply(&self, reply_rx: &Receiver<Msg>) -> Result<Msg, NodeError> {
        let timeout = self.inner.node.config.response_timeout();
        if timeout.is_zero() {
            let close_rx = self.inner.close_rx.clone();
            let reply_rx = reply_rx.clone();
            crossbeam::select! {
                recv(reply_rx) -> reply => reply.map_err(|_| NodeError::Closed),
                recv(close_rx) -> _ => Err(NodeError::Closed),
            }
        } else {
            let close_rx = self.inner.close_rx.clone();
            let reply_rx = reply_rx.clone();
            crossbeam::select! {
                recv(reply_rx) -> reply => reply.map_err(|_| NodeError::Closed),
                recv(close_rx) -> _ => Err(NodeError::Closed),
                default(timeout) => Err(NodeError::Timeout),
            }
        }
    }

    fn send_msg(&self, seq: u32, rseq: u32, message: &Msg) {
        self.send_raw(msg::encode(seq, rseq, message));
    }

    fn send_raw(&self, raw: Vec<u8>) {
        let Some(out_tx) = self.inner.link.sender() else {
            return; // link gone, nobody to talk to
        };
        *self.inner.last_io.lock().expect(LOCK_POISONED) = Instant::now();
        let close_rx = self.inner.close_rx.clone();
        crossbeam::select! {
            send(out_tx, raw) -> _ => {}
            recv(close_rx) -> _ => {} // close observed first, send abandoned
        }
    }

    fn send_ok(&self, rseq: u32) {
        let seq = self.next_seq();
        self.send_msg(seq, rseq, &Msg::Ok);
    }

    fn send_err(&self, rseq: u32, text: &str) {
        let seq = self.next_seq();
        self.send_msg(
            seq,
            rseq,
            &Msg::Err {
                text: text.to_string(),
            },
        );
    }

    pub(crate) fn send_root(&self, root: &Root) {
        let seq = self.next_seq();
        self.send_msg(seq, 0, &Msg::Root(root.clone()));
    }

    /// Reply with an object to a request whose seq we kept.
    pub(crate) fn send_object(&self, rseq: u32, value: Bytes) {
        let seq = self.next_seq();
        self.send_msg(seq, rseq, &Msg::Object { value });
    }

    pub(crate) fn send_ping(&self) {
        let seq = self.next_seq();
        self.send_msg(seq, 0, &Msg::Ping);
    }

    fn send_last_root(&self, feed: &Feed) {
        let node = &self.inner.node;
        let head = node.container.active_head(feed);
        if let Ok(root) = node.container.last_root(feed, head) {
            self.send_root(&root);
        }
    }

    //
    // terminate
    //

    pub(crate) fn fatality(&self, err: NodeError) {
        tracing::warn!("[{self}] fatal: {err}");
        self.close_with(Some(err));
    }

    /// Idempotent and single-shot; the first closer wins and sets the
    /// close reason.
    pub(crate) fn close_with(&self, reason: Option<NodeError>) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.inner.close_reason.lock().expect(LOCK_POISONED) = reason.clone();

        let node = &self.inner.node;
        node.remove_conn(self.id());
        node.feeds.del_connection(self.id());
        node.wants.drop_connection(self.id());

        // wake the receive loop and everyone waiting on this connection
        self.inner.close_tx.lock().expect(LOCK_POISONED).take();
        self.inner.link.close();

        let handle = self.inner.recv_thread.lock().expect(LOCK_POISONED).take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }

        if let Some(on_disconnect) = &node.callbacks.on_disconnect {
            on_disconnect(self, reason.as_ref());
        }

        // fail every still-pending request with ErrClosed
        self.inner.pending.lock().expect(LOCK_POISONED).clear();

        tracing::debug!("[{self}] closed");
    }
}

impl fmt::Display for Conn {
    /// `"-> tcp://127.0.0.1:8870"` for incoming connections, `"<- ..."` for
    /// outgoing ones.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = if self.is_incoming() { "-> " } else { "<- " };
        write!(
            f,
            "{arrow}{}://{}",
            self.kind().scheme(),
            self.inner.link.remote_addr()
        )
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id())
            .field("address", &self.inner.link.remote_addr())
            .field("incoming", &self.is_incoming())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Getter over `RqObject`; a reply failing hash verification is fatal to
/// the connection.
struct ConnGetter {
    conn: Conn,
}

impl Getter for ConnGetter {
    fn get(&self, key: &ObjectKey) -> Result<Bytes, NodeError> {
        match self.conn.send_request(&Msg::RqObject {
            key: *key,
            prefetch: Vec::new(),
        })? {
            Msg::Object { value } => {
                if sha256_bytes(&value) != *key {
                    let violation = ProtocolViolation::ObjectHashMismatch { key: *key };
                    self.conn.fatality(NodeError::Protocol(violation.clone()));
                    return Err(violation.into());
                }
                // rendezvous: other connections may await the same object
                self.conn.inner.node.got_object(*key, value.clone());
                Ok(value)
            }
            Msg::Err { text } => Err(NodeError::Remote(text)),
            _ => Err(NodeError::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next_seq_of(counter: &AtomicU32) -> u32 {
        loop {
            let seq = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }

    #[test]
    fn seq_starts_at_one() {
        let counter = AtomicU32::new(0);
        assert_eq!(next_seq_of(&counter), 1);
        assert_eq!(next_seq_of(&counter), 2);
    }

    #[test]
    fn seq_wrap_skips_zero() {
        let counter = AtomicU32::new(u32::MAX);
        assert_eq!(next_seq_of(&counter), 1);
    }
}
