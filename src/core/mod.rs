//! Core domain types for the object-graph exchange.
//!
//! Module order follows type dependency:
//! - identity: NodeId, Feed
//! - hash: ObjectKey content addressing
//! - root: signed Root descriptors

pub mod hash;
pub mod identity;
pub mod root;

pub use hash::{ObjectKey, sha256_bytes};
pub use identity::{Feed, NodeId};
pub use root::{Root, RootBody, RootDecodeError, Signature};
