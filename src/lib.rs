#![forbid(unsafe_code)]

pub mod config;
pub mod container;
pub mod core;
pub mod node;
pub mod telemetry;
pub mod transport;

pub use config::{Config, ConfigError};
pub use container::memory::MemoryContainer;
pub use container::{Container, ContainerError, Getter, Pack, ReceivedRoot, WantSink};
pub use node::{
    Callbacks, Conn, ConnId, Msg, Node, NodeError, PROTOCOL_VERSION, ProtocolViolation, StartError,
};

// Re-export core types at crate root for convenience
pub use crate::core::{
    Feed, NodeId, ObjectKey, Root, RootBody, RootDecodeError, Signature, sha256_bytes,
};
