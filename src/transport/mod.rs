//! Framed byte-buffer links between peers.
//!
//! A [`Link`] hides the wire: the exchange core sees an inbound receiver of
//! framed buffers and a bounded outbound queue. TCP links are built by the
//! [`tcp::Pool`]; in-process pairs come from [`memory::link_pair`].

use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender};

pub mod frame;
pub mod memory;
pub mod tcp;

pub use frame::{FrameError, FrameReader, FrameWriter};
pub use memory::link_pair;
pub use tcp::{Pool, PoolError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    Tcp,
    Memory,
}

impl LinkKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            LinkKind::Tcp => "tcp",
            LinkKind::Memory => "memory",
        }
    }
}

/// One framed transport connection.
pub struct Link {
    kind: LinkKind,
    incoming: bool,
    remote: String,
    in_rx: Receiver<Vec<u8>>,
    shared: Arc<LinkShared>,
}

pub(crate) struct LinkShared {
    closed: AtomicBool,
    out_tx: Mutex<Option<Sender<Vec<u8>>>>,
    stream: Mutex<Option<TcpStream>>,
}

impl LinkShared {
    pub(crate) fn new(out_tx: Sender<Vec<u8>>, stream: Option<TcpStream>) -> Self {
        Self {
            closed: AtomicBool::new(false),
            out_tx: Mutex::new(Some(out_tx)),
            stream: Mutex::new(stream),
        }
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.out_tx.lock().expect("link lock poisoned").take();
        if let Some(stream) = self.stream.lock().expect("link lock poisoned").take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Link {
    pub(crate) fn new(
        kind: LinkKind,
        incoming: bool,
        remote: String,
        in_rx: Receiver<Vec<u8>>,
        shared: Arc<LinkShared>,
    ) -> Self {
        Self {
            kind,
            incoming,
            remote,
            in_rx,
            shared,
        }
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote
    }

    /// Inbound framed buffers. Disconnects when the transport goes away.
    pub fn inbound(&self) -> &Receiver<Vec<u8>> {
        &self.in_rx
    }

    /// Handle on the outbound queue, or `None` once the link is closed.
    pub fn sender(&self) -> Option<Sender<Vec<u8>>> {
        self.shared
            .out_tx
            .lock()
            .expect("link lock poisoned")
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Idempotent; wakes both pump directions.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("kind", &self.kind)
            .field("incoming", &self.incoming)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}
