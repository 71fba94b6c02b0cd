//! In-process link pairs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::bounded;

use super::{Link, LinkKind, LinkShared};

static NEXT_PAIR: AtomicU64 = AtomicU64::new(1);

/// Build two connected links. Whatever is sent through one side's outbound
/// queue shows up on the other side's inbound receiver. The first link acts
/// as the dialing (outgoing) end.
pub fn link_pair(queue_len: usize) -> (Link, Link) {
    let pair = NEXT_PAIR.fetch_add(1, Ordering::Relaxed);
    let (a_tx, b_rx) = bounded(queue_len);
    let (b_tx, a_rx) = bounded(queue_len);

    let a = Link::new(
        LinkKind::Memory,
        false,
        format!("{pair}-b"),
        a_rx,
        Arc::new(LinkShared::new(a_tx, None)),
    );
    let b = Link::new(
        LinkKind::Memory,
        true,
        format!("{pair}-a"),
        b_rx,
        Arc::new(LinkShared::new(b_tx, None)),
    );
    (a, b)
}
