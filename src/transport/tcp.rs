//! TCP pool: listener accept loop, dial, per-socket pump threads.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded};
use thiserror::Error;

use crate::config::Config;

use super::frame::{FrameReader, FrameWriter};
use super::{Link, LinkKind, LinkShared};

const ACCEPT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot resolve address {0}")]
    UnresolvedAddress(String),
    #[error("connections limit reached")]
    TooManyConnections,
    #[error("pool closed")]
    PoolClosed,
}

/// Owns every TCP socket of a node. Accepted and dialed sockets become
/// [`Link`]s; closing the pool shuts all of them down.
pub struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    max_message_size: usize,
    read_queue_len: usize,
    write_queue_len: usize,
    read_buffer_size: usize,
    write_buffer_size: usize,
    write_timeout: Option<Duration>,
    dial_timeout: Duration,
    max_connections: usize,

    shutdown: Arc<AtomicBool>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_join: Mutex<Option<JoinHandle<()>>>,
    incoming_tx: Sender<Link>,
    incoming_rx: Receiver<Link>,
    active: Arc<AtomicUsize>,
    links: Mutex<Vec<Weak<LinkShared>>>,
}

struct SlotGuard {
    active: Arc<AtomicUsize>,
}

impl SlotGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let acquired = active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .is_ok();
        acquired.then(|| Self {
            active: Arc::clone(active),
        })
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "active connection counter underflow");
    }
}

impl Pool {
    pub fn new(config: &Config) -> Self {
        let (incoming_tx, incoming_rx) = bounded(64);
        Self {
            shared: Arc::new(PoolShared {
                max_message_size: config.max_message_size,
                read_queue_len: config.read_queue_len,
                write_queue_len: config.write_queue_len,
                read_buffer_size: config.read_buffer_size,
                write_buffer_size: config.write_buffer_size,
                write_timeout: config.write_timeout(),
                dial_timeout: config.dial_timeout(),
                max_connections: config.max_connections,
                shutdown: Arc::new(AtomicBool::new(false)),
                listener: Mutex::new(None),
                local_addr: Mutex::new(None),
                accept_join: Mutex::new(None),
                incoming_tx,
                incoming_rx,
                active: Arc::new(AtomicUsize::new(0)),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start accepting on `addr`; returns the bound address.
    pub fn listen(&self, addr: &str) -> Result<SocketAddr, PoolError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = &self.shared;
        *shared.local_addr.lock().expect("pool lock poisoned") = Some(local_addr);
        *shared.listener.lock().expect("pool lock poisoned") = Some(listener.try_clone()?);

        let runtime = Arc::clone(shared);
        let join = thread::spawn(move || run_accept_loop(listener, &runtime));
        *shared.accept_join.lock().expect("pool lock poisoned") = Some(join);

        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().expect("pool lock poisoned")
    }

    /// Accepted links, in arrival order.
    pub fn incoming(&self) -> &Receiver<Link> {
        &self.shared.incoming_rx
    }

    pub fn dial(&self, addr: &str) -> Result<Link, PoolError> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }
        let sock_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| PoolError::UnresolvedAddress(addr.to_string()))?;
        let guard = SlotGuard::try_acquire(&shared.active, shared.max_connections)
            .ok_or(PoolError::TooManyConnections)?;
        let stream = TcpStream::connect_timeout(&sock_addr, shared.dial_timeout)?;
        shared.spawn_link(stream, false, guard)
    }

    /// Shut the listener and every live link down, then join the accept loop.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.listener.lock().expect("pool lock poisoned").take();
        if let Some(join) = shared.accept_join.lock().expect("pool lock poisoned").take() {
            let _ = join.join();
        }
        let links: Vec<Weak<LinkShared>> =
            shared.links.lock().expect("pool lock poisoned").drain(..).collect();
        for link in links {
            if let Some(link) = link.upgrade() {
                link.close();
            }
        }
    }
}

impl PoolShared {
    fn spawn_link(
        &self,
        stream: TcpStream,
        incoming: bool,
        guard: SlotGuard,
    ) -> Result<Link, PoolError> {
        stream.set_nodelay(true)?;
        stream.set_write_timeout(self.write_timeout)?;
        let remote = stream.peer_addr()?.to_string();

        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;

        let (in_tx, in_rx) = bounded::<Vec<u8>>(self.read_queue_len);
        let (out_tx, out_rx) = bounded::<Vec<u8>>(self.write_queue_len);

        let link_shared = Arc::new(LinkShared::new(out_tx, Some(stream)));
        self.links
            .lock()
            .expect("pool lock poisoned")
            .push(Arc::downgrade(&link_shared));

        {
            let link_shared = Arc::clone(&link_shared);
            let max = self.max_message_size;
            let buffer = self.read_buffer_size;
            thread::spawn(move || {
                let buffered = BufReader::with_capacity(buffer, reader_stream);
                let mut reader = FrameReader::new(buffered, max);
                loop {
                    match reader.read_next() {
                        Ok(Some(payload)) => {
                            if in_tx.send(payload).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            if !link_shared.is_closed() {
                                tracing::debug!("link read ended: {err}");
                            }
                            break;
                        }
                    }
                }
                link_shared.close();
                drop(guard);
            });
        }

        {
            let link_shared = Arc::clone(&link_shared);
            let max = self.max_message_size;
            let buffer = self.write_buffer_size;
            thread::spawn(move || {
                let buffered = BufWriter::with_capacity(buffer, writer_stream);
                let mut writer = FrameWriter::new(buffered, max);
                while let Ok(payload) = out_rx.recv() {
                    let sent = writer
                        .write_frame(&payload)
                        .and_then(|()| writer.flush());
                    if let Err(err) = sent {
                        if !link_shared.is_closed() {
                            tracing::debug!("link write failed: {err}");
                        }
                        break;
                    }
                }
                link_shared.close();
            });
        }

        Ok(Link::new(LinkKind::Tcp, incoming, remote, in_rx, link_shared))
    }
}

fn run_accept_loop(listener: TcpListener, shared: &Arc<PoolShared>) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    tracing::warn!("accepted socket from {peer} unusable: {err}");
                    continue;
                }
                let Some(guard) = SlotGuard::try_acquire(&shared.active, shared.max_connections)
                else {
                    tracing::warn!("connection limit reached, dropping {peer}");
                    continue;
                };
                match shared.spawn_link(stream, true, guard) {
                    Ok(link) => {
                        if shared.incoming_tx.send(link).is_err() {
                            return;
                        }
                    }
                    Err(err) => tracing::warn!("accepted socket from {peer} failed: {err}"),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                if shared.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                tracing::warn!("accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}
