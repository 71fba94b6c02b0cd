//! Node: registries, connection sets and the coarse lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use crossbeam::sync::WaitGroup;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::container::{Container, ContainerError};
use crate::core::{Feed, NodeId, ObjectKey, Root};
use crate::transport::{Link, Pool, PoolError};

use super::conn::{Conn, ConnEvent, ConnId};
use super::error::NodeError;
use super::feeds::FeedRegistry;
use super::wants::WantRegistry;

pub type OnConnect = Arc<dyn Fn(&Conn) + Send + Sync>;
pub type OnDisconnect = Arc<dyn Fn(&Conn, Option<&NodeError>) + Send + Sync>;
/// Veto hook for remote subscriptions; the error string is sent back verbatim.
pub type OnSubscribeRemote = Arc<dyn Fn(&Conn, &Feed) -> Result<(), String> + Send + Sync>;
/// Veto hook for outgoing dials, invoked before the handshake.
pub type OnDial = Arc<dyn Fn(&Conn) -> Result<(), String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_connect: Option<OnConnect>,
    pub on_disconnect: Option<OnDisconnect>,
    pub on_subscribe_remote: Option<OnSubscribeRemote>,
    pub on_dial: Option<OnDial>,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("listen failed: {0}")]
    Listen(#[from] PoolError),
}

/// One peer of the exchange network.
///
/// Holds the feed and want registries, the active and pending connection
/// sets and the transport pool. Cheap to clone; `close` is idempotent.
#[derive(Clone)]
pub struct Node {
    shared: Arc<NodeShared>,
}

pub(crate) struct NodeShared {
    pub(crate) config: Config,
    pub(crate) container: Arc<dyn Container>,
    pub(crate) callbacks: Callbacks,
    pub(crate) node_id: NodeId,
    pub(crate) feeds: FeedRegistry<Conn>,
    pub(crate) wants: WantRegistry<Conn>,

    conns: Mutex<ConnList>,
    // between accept/dial and handshake completion
    pending: Mutex<HashMap<ConnId, Conn>>,
    pool: Pool,
    next_conn_id: AtomicU64,

    quit_tx: Mutex<Option<Sender<()>>>,
    quit_rx: Receiver<()>,
    wg: Mutex<Option<WaitGroup>>,
    done: AtomicBool,
}

struct ConnList {
    active: Vec<Conn>,
    // copy-on-write snapshot, invalidated by every mutation
    snapshot: Option<Arc<[Conn]>>,
}

impl Node {
    pub fn new(
        config: Config,
        container: Arc<dyn Container>,
        callbacks: Callbacks,
    ) -> Result<Node, StartError> {
        config.validate()?;

        let pool = Pool::new(&config);
        let (quit_tx, quit_rx) = bounded(0);
        let node_id = NodeId(rand::random());

        let shared = Arc::new(NodeShared {
            config,
            container,
            callbacks,
            node_id,
            feeds: FeedRegistry::new(),
            wants: WantRegistry::new(),
            conns: Mutex::new(ConnList {
                active: Vec::new(),
                snapshot: None,
            }),
            pending: Mutex::new(HashMap::new()),
            pool,
            next_conn_id: AtomicU64::new(0),
            quit_tx: Mutex::new(Some(quit_tx)),
            quit_rx,
            wg: Mutex::new(Some(WaitGroup::new())),
            done: AtomicBool::new(false),
        });
        let node = Node { shared };

        if node.shared.config.enable_listener {
            let listen = node.shared.config.listen.clone();
            let addr = node.shared.pool.listen(&listen)?;
            tracing::info!("listen on {addr}");
        }

        node.spawn_accept_pump();
        if !node.shared.config.ping_interval().is_zero() {
            node.spawn_pings_loop();
        }

        tracing::debug!(
            "starting node {}: max connections {}, max message size {}, \
             response timeout {:?}, ping interval {:?}, public {}",
            node.shared.node_id,
            node.shared.config.max_connections,
            node.shared.config.max_message_size,
            node.shared.config.response_timeout(),
            node.shared.config.ping_interval(),
            node.shared.config.public_server,
        );
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.shared.node_id
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn container(&self) -> &Arc<dyn Container> {
        &self.shared.container
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.shared.pool.local_addr()
    }

    /// Dial a peer and wait for the handshake to finish.
    pub fn connect(&self, address: &str) -> Result<Conn, NodeError> {
        if self.shared.is_quitting() {
            return Err(NodeError::Closed);
        }
        let link = self
            .shared
            .pool
            .dial(address)
            .map_err(|err| NodeError::Dial(err.to_string()))?;

        let conn = NodeShared::new_conn(&self.shared, link);
        if let Some(on_dial) = &self.shared.callbacks.on_dial
            && let Err(reason) = on_dial(&conn)
        {
            let err = NodeError::Dial(reason);
            conn.close_with(Some(err.clone()));
            return Err(err);
        }

        let (hs_tx, hs_rx) = bounded(1);
        conn.start(Some(hs_tx));
        match hs_rx.recv() {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(NodeError::Closed),
        }
    }

    /// Snapshot of the active connections.
    pub fn connections(&self) -> Arc<[Conn]> {
        self.shared.connections_snapshot()
    }

    /// Established connection by remote address, if any.
    pub fn connection(&self, address: &str) -> Option<Conn> {
        self.shared
            .connections_snapshot()
            .iter()
            .find(|conn| conn.address() == address)
            .cloned()
    }

    /// Feeds this node shares.
    pub fn feeds(&self) -> Arc<[Feed]> {
        self.shared.feeds.feeds()
    }

    pub fn has_feed(&self, feed: &Feed) -> bool {
        self.shared.feeds.has_feed(feed)
    }

    /// Start sharing a feed. Idempotent; does not subscribe any connection.
    pub fn add_feed(&self, feed: &Feed) -> Result<(), ContainerError> {
        self.shared.add_feed(feed)
    }

    /// Stop sharing a feed. Every subscribed connection receives an
    /// unsubscribe event; this call returns only after each of them has
    /// acknowledged the drain or closed, after which the Container drops
    /// the feed.
    pub fn del_feed(&self, feed: &Feed) -> Result<(), ContainerError> {
        let Some(subscribed) = self.shared.feeds.del_feed(feed) else {
            return Ok(()); // not shared
        };

        let mut waits = Vec::with_capacity(subscribed.len());
        for conn in subscribed {
            let (done_tx, done_rx) = bounded::<()>(0);
            let event = ConnEvent::UnsubDeletedFeed {
                feed: *feed,
                done: done_tx,
            };
            if conn.enqueue_event(event) {
                waits.push((done_rx, conn));
            }
        }

        for (done_rx, conn) in waits {
            let close_rx = conn.close_signal().clone();
            crossbeam::select! {
                recv(done_rx) -> _ => {} // filler drained
                recv(close_rx) -> _ => {} // connection closed instead
            }
        }

        self.shared.container.del_feed(feed)
    }

    /// Send a Root to every connection subscribed to its feed. The caller's
    /// descriptor is shielded by a sterile copy.
    pub fn publish(&self, root: &Root) {
        let root = root.clone();
        self.shared.broadcast_root(&root, None);
    }

    /// Fan an object that arrived out of band out to every connection
    /// waiting for it.
    pub fn got_object(&self, key: ObjectKey, value: Bytes) {
        self.shared.got_object(key, value);
    }

    /// Channel that disconnects once the node starts closing.
    pub fn quitting(&self) -> Receiver<()> {
        self.shared.quit_rx.clone()
    }

    /// Close every connection, wait for all spawned threads, then close the
    /// Container. Idempotent.
    pub fn close(&self) {
        let quit = self.shared.quit_tx.lock().expect("node lock poisoned").take();
        let first = quit.is_some();
        drop(quit);

        self.shared.pool.close();

        let pending: Vec<Conn> = self
            .shared
            .pending
            .lock()
            .expect("node lock poisoned")
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in pending {
            conn.close();
        }
        for conn in self.shared.connections_snapshot().iter() {
            conn.close();
        }

        if let Some(wg) = self.shared.wg.lock().expect("node lock poisoned").take() {
            wg.wait();
        }

        if first && !self.shared.done.swap(true, Ordering::AcqRel) {
            self.shared.container.close();
            tracing::info!("node {} closed", self.shared.node_id);
        }
    }

    fn spawn_accept_pump(&self) {
        let shared = Arc::clone(&self.shared);
        let wg = shared.wg_clone();
        thread::spawn(move || {
            let _wg = wg;
            let incoming = shared.pool.incoming().clone();
            let quit_rx = shared.quit_rx.clone();
            loop {
                crossbeam::select! {
                    recv(incoming) -> link => {
                        let Ok(link) = link else { return };
                        NodeShared::new_conn(&shared, link).start(None);
                    }
                    recv(quit_rx) -> _ => return,
                }
            }
        });
    }

    fn spawn_pings_loop(&self) {
        let shared = Arc::clone(&self.shared);
        let wg = shared.wg_clone();
        thread::spawn(move || {
            let _wg = wg;
            let interval = shared.config.ping_interval();
            let quit_rx = shared.quit_rx.clone();
            loop {
                match quit_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let now = Instant::now();
                        for conn in shared.connections_snapshot().iter() {
                            if now.duration_since(conn.last_io()) >= interval {
                                conn.send_ping();
                            }
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        });
    }
}

impl NodeShared {
    pub(crate) fn wg_clone(&self) -> Option<WaitGroup> {
        self.wg.lock().expect("node lock poisoned").as_ref().cloned()
    }

    pub(crate) fn is_quitting(&self) -> bool {
        self.quit_tx.lock().expect("node lock poisoned").is_none()
    }

    fn new_conn(shared: &Arc<NodeShared>, link: Link) -> Conn {
        let id = ConnId(shared.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1);
        let conn = Conn::new(id, Arc::clone(shared), link);
        shared
            .pending
            .lock()
            .expect("node lock poisoned")
            .insert(id, conn.clone());
        tracing::debug!("[{conn}] new connection");
        conn
    }

    /// Move a handshaken connection from the pending set to the active list.
    /// Returns false if the connection was disposed or the node is quitting.
    pub(crate) fn promote_conn(&self, conn: &Conn) -> bool {
        if self.is_quitting() {
            return false;
        }
        if self
            .pending
            .lock()
            .expect("node lock poisoned")
            .remove(&conn.id())
            .is_none()
        {
            return false; // closed while handshaking
        }
        {
            let mut conns = self.conns.lock().expect("node lock poisoned");
            conns.active.push(conn.clone());
            conns.snapshot = None;
        }
        if let Some(on_connect) = &self.callbacks.on_connect {
            on_connect(conn);
        }
        true
    }

    pub(crate) fn remove_conn(&self, id: ConnId) {
        self.pending.lock().expect("node lock poisoned").remove(&id);
        let mut conns = self.conns.lock().expect("node lock poisoned");
        if let Some(pos) = conns.active.iter().position(|conn| conn.id() == id) {
            conns.active.swap_remove(pos);
            conns.snapshot = None;
        }
    }

    pub(crate) fn connections_snapshot(&self) -> Arc<[Conn]> {
        let mut conns = self.conns.lock().expect("node lock poisoned");
        if let Some(snapshot) = &conns.snapshot {
            return Arc::clone(snapshot);
        }
        let snapshot: Arc<[Conn]> = conns.active.clone().into();
        conns.snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }

    pub(crate) fn add_feed(&self, feed: &Feed) -> Result<(), ContainerError> {
        if self.feeds.has_feed(feed) {
            return Ok(());
        }
        self.container.add_feed(feed)?;
        self.feeds.add_feed(feed);
        Ok(())
    }

    pub(crate) fn got_object(&self, key: ObjectKey, value: Bytes) {
        let waiters = self.wants.got_object(&key);
        for (rseq, conn) in waiters {
            conn.send_object(rseq, value.clone());
        }
    }

    /// Snapshot the subscribers under the read lock, send outside of it.
    pub(crate) fn broadcast_root(&self, root: &Root, except: Option<ConnId>) {
        let subscribers = self.feeds.subscribers(&root.feed);
        for conn in subscribers {
            if Some(conn.id()) == except {
                continue;
            }
            conn.send_root(root);
        }
    }
}
