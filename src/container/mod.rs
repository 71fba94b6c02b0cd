//! Container collaborator seam: storage, fillers and previews.
//!
//! The exchange core never touches stored objects directly; it drives a
//! [`Container`] and hands it [`Getter`]s that resolve missing objects over
//! peer connections.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::Sender;
use thiserror::Error;

use crate::core::{Feed, ObjectKey, Root, RootDecodeError, Signature};
use crate::node::NodeError;

pub mod memory;

/// Single-shot delivery channel for a wanted object.
pub type WantSink = Sender<Bytes>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("no such feed")]
    NoSuchFeed,
    #[error("no such head")]
    NoSuchHead,
    #[error("not found")]
    NotFound,
    #[error("invalid root signature")]
    InvalidSignature,
    #[error(transparent)]
    BadRoot(#[from] RootDecodeError),
    #[error("{0}")]
    Other(String),
}

/// Outcome of [`Container::received_root`].
#[derive(Clone, Debug)]
pub struct ReceivedRoot {
    pub root: Root,
    /// Whether every transitively referenced object is already present.
    pub is_full: bool,
}

/// Resolves objects on demand, usually over a peer connection.
pub trait Getter: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Result<Bytes, NodeError>;
}

/// Read-only view assembled for previewing a Root.
pub trait Pack: Send {
    fn root(&self) -> &Root;
    fn get(&self, key: &ObjectKey) -> Result<Bytes, ContainerError>;
}

pub trait Container: Send + Sync {
    /// Idempotent.
    fn add_feed(&self, feed: &Feed) -> Result<(), ContainerError>;

    /// Requires that no non-full Roots remain for the feed; callers drain
    /// connection fillers first.
    fn del_feed(&self, feed: &Feed) -> Result<(), ContainerError>;

    fn last_root(&self, feed: &Feed, nonce: u64) -> Result<Root, ContainerError>;

    /// Highest accepted seq for `(feed, nonce)`.
    fn last_root_seq(&self, feed: &Feed, nonce: u64) -> Result<u64, ContainerError>;

    /// Currently active head of the feed.
    fn active_head(&self, feed: &Feed) -> u64;

    /// Verify a signed body and store the descriptor it names.
    fn received_root(&self, sig: Signature, body: Bytes)
    -> Result<ReceivedRoot, ContainerError>;

    /// Register interest in an object. If it is already present it is
    /// delivered through the sink immediately. Idempotent per sink.
    fn want(&self, key: &ObjectKey, sink: WantSink);

    fn unwant(&self, key: &ObjectKey, sink: &WantSink);

    /// Hand a non-full Root to the background filler.
    fn fill(&self, root: Root, getter: Arc<dyn Getter>);

    /// Build an on-the-fly view that resolves missing references through the
    /// supplied getter.
    fn preview(
        &self,
        root: &Root,
        getter: Arc<dyn Getter>,
    ) -> Result<Box<dyn Pack>, ContainerError>;

    /// Release resources. Called once, after every connection has closed.
    fn close(&self);
}
