//! Wire messages and their binary codec.
//!
//! Every frame starts with a 9-byte header:
//!
//! ```text
//! [u32 seq LE][u32 rseq LE][u8 type][payload]
//! ```
//!
//! `seq` is the sender's sequence number for this message; `rseq` names the
//! request this message replies to, or 0 for unsolicited messages. All
//! integers are little-endian; keys are 32 bytes, signatures 64 bytes, and
//! variable-length blobs carry a u32 length prefix. Type bytes are stable
//! across implementations.

use bytes::Bytes;
use thiserror::Error;

use crate::core::{Feed, NodeId, ObjectKey, Root, Signature};

pub const HEADER_LEN: usize = 9;

const T_SUB: u8 = 1;
const T_UNSUB: u8 = 2;
const T_RQ_LIST: u8 = 3;
const T_LIST: u8 = 4;
const T_ROOT: u8 = 5;
const T_RQ_OBJECT: u8 = 6;
const T_OBJECT: u8 = 7;
const T_RQ_PREVIEW: u8 = 8;
const T_OK: u8 = 9;
const T_ERR: u8 = 10;
const T_PING: u8 = 11;
const T_PONG: u8 = 12;
const T_HELLO: u8 = 13;
const T_WELCOME: u8 = 14;

/// Closed union of wire messages. Dispatch is by type byte; adding a kind
/// forces every handler match to be re-examined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Msg {
    Sub { feed: Feed },
    Unsub { feed: Feed },
    RqList,
    List { feeds: Vec<Feed> },
    Root(Root),
    RqObject { key: ObjectKey, prefetch: Vec<ObjectKey> },
    Object { value: Bytes },
    RqPreview { feed: Feed },
    Ok,
    Err { text: String },
    Ping,
    Pong,
    Hello { version: u32, node_id: NodeId, nonce: u64 },
    Welcome { node_id: NodeId, nonce: u64 },
}

impl Msg {
    fn type_byte(&self) -> u8 {
        match self {
            Msg::Sub { .. } => T_SUB,
            Msg::Unsub { .. } => T_UNSUB,
            Msg::RqList => T_RQ_LIST,
            Msg::List { .. } => T_LIST,
            Msg::Root(_) => T_ROOT,
            Msg::RqObject { .. } => T_RQ_OBJECT,
            Msg::Object { .. } => T_OBJECT,
            Msg::RqPreview { .. } => T_RQ_PREVIEW,
            Msg::Ok => T_OK,
            Msg::Err { .. } => T_ERR,
            Msg::Ping => T_PING,
            Msg::Pong => T_PONG,
            Msg::Hello { .. } => T_HELLO,
            Msg::Welcome { .. } => T_WELCOME,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Sub { .. } => "Sub",
            Msg::Unsub { .. } => "Unsub",
            Msg::RqList => "RqList",
            Msg::List { .. } => "List",
            Msg::Root(_) => "Root",
            Msg::RqObject { .. } => "RqObject",
            Msg::Object { .. } => "Object",
            Msg::RqPreview { .. } => "RqPreview",
            Msg::Ok => "Ok",
            Msg::Err { .. } => "Err",
            Msg::Ping => "Ping",
            Msg::Pong => "Pong",
            Msg::Hello { .. } => "Hello",
            Msg::Welcome { .. } => "Welcome",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MsgDecodeError {
    #[error("frame too short: {got} bytes")]
    FrameTooShort { got: usize },
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("truncated payload reading {0}")]
    Truncated(&'static str),
    #[error("{kind} payload has {remaining} trailing bytes")]
    Trailing {
        kind: &'static str,
        remaining: usize,
    },
    #[error("message text is not valid utf-8")]
    BadText,
}

pub fn encode(seq: u32, rseq: u32, msg: &Msg) -> Vec<u8> {
    let mut raw = Vec::with_capacity(HEADER_LEN + 64);
    raw.extend_from_slice(&seq.to_le_bytes());
    raw.extend_from_slice(&rseq.to_le_bytes());
    raw.push(msg.type_byte());

    match msg {
        Msg::Sub { feed } | Msg::Unsub { feed } | Msg::RqPreview { feed } => {
            raw.extend_from_slice(feed.as_bytes());
        }
        Msg::RqList | Msg::Ok | Msg::Ping | Msg::Pong => {}
        Msg::List { feeds } => {
            raw.extend_from_slice(&(feeds.len() as u32).to_le_bytes());
            for feed in feeds {
                raw.extend_from_slice(feed.as_bytes());
            }
        }
        Msg::Root(root) => {
            raw.extend_from_slice(root.feed.as_bytes());
            raw.extend_from_slice(&root.nonce.to_le_bytes());
            raw.extend_from_slice(&root.seq.to_le_bytes());
            raw.extend_from_slice(root.sig.as_bytes());
            raw.extend_from_slice(&(root.body.len() as u32).to_le_bytes());
            raw.extend_from_slice(&root.body);
        }
        Msg::RqObject { key, prefetch } => {
            raw.extend_from_slice(key.as_bytes());
            raw.extend_from_slice(&(prefetch.len() as u32).to_le_bytes());
            for key in prefetch {
                raw.extend_from_slice(key.as_bytes());
            }
        }
        Msg::Object { value } => {
            raw.extend_from_slice(&(value.len() as u32).to_le_bytes());
            raw.extend_from_slice(value);
        }
        Msg::Err { text } => {
            raw.extend_from_slice(&(text.len() as u32).to_le_bytes());
            raw.extend_from_slice(text.as_bytes());
        }
        Msg::Hello {
            version,
            node_id,
            nonce,
        } => {
            raw.extend_from_slice(&version.to_le_bytes());
            raw.extend_from_slice(node_id.as_bytes());
            raw.extend_from_slice(&nonce.to_le_bytes());
        }
        Msg::Welcome { node_id, nonce } => {
            raw.extend_from_slice(node_id.as_bytes());
            raw.extend_from_slice(&nonce.to_le_bytes());
        }
    }

    raw
}

pub fn decode(raw: &[u8]) -> Result<(u32, u32, Msg), MsgDecodeError> {
    if raw.len() < HEADER_LEN {
        return Err(MsgDecodeError::FrameTooShort { got: raw.len() });
    }

    let mut header = [0u8; 4];
    header.copy_from_slice(&raw[0..4]);
    let seq = u32::from_le_bytes(header);
    header.copy_from_slice(&raw[4..8]);
    let rseq = u32::from_le_bytes(header);
    let type_byte = raw[8];

    let mut payload = Payload {
        buf: &raw[HEADER_LEN..],
        pos: 0,
    };

    let msg = match type_byte {
        T_SUB => Msg::Sub {
            feed: Feed(payload.take_32("feed")?),
        },
        T_UNSUB => Msg::Unsub {
            feed: Feed(payload.take_32("feed")?),
        },
        T_RQ_LIST => Msg::RqList,
        T_LIST => {
            let count = payload.take_u32("feed count")?;
            let mut feeds = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                feeds.push(Feed(payload.take_32("feed")?));
            }
            Msg::List { feeds }
        }
        T_ROOT => {
            let feed = Feed(payload.take_32("feed")?);
            let nonce = payload.take_u64("nonce")?;
            let seq = payload.take_u64("root seq")?;
            let sig = Signature(payload.take_64("signature")?);
            let body = payload.take_blob("body")?;
            Msg::Root(Root {
                feed,
                nonce,
                seq,
                sig,
                body,
            })
        }
        T_RQ_OBJECT => {
            let key = ObjectKey(payload.take_32("key")?);
            let count = payload.take_u32("prefetch count")?;
            let mut prefetch = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                prefetch.push(ObjectKey(payload.take_32("prefetch key")?));
            }
            Msg::RqObject { key, prefetch }
        }
        T_OBJECT => Msg::Object {
            value: payload.take_blob("value")?,
        },
        T_RQ_PREVIEW => Msg::RqPreview {
            feed: Feed(payload.take_32("feed")?),
        },
        T_OK => Msg::Ok,
        T_ERR => {
            let blob = payload.take_blob("text")?;
            let text =
                String::from_utf8(blob.to_vec()).map_err(|_| MsgDecodeError::BadText)?;
            Msg::Err { text }
        }
        T_PING => Msg::Ping,
        T_PONG => Msg::Pong,
        T_HELLO => Msg::Hello {
            version: payload.take_u32("version")?,
            node_id: NodeId(payload.take_32("node id")?),
            nonce: payload.take_u64("nonce")?,
        },
        T_WELCOME => Msg::Welcome {
            node_id: NodeId(payload.take_32("node id")?),
            nonce: payload.take_u64("nonce")?,
        },
        other => return Err(MsgDecodeError::UnknownType(other)),
    };

    let remaining = payload.remaining();
    if remaining != 0 {
        return Err(MsgDecodeError::Trailing {
            kind: msg.kind(),
            remaining,
        });
    }

    Ok((seq, rseq, msg))
}

struct Payload<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Payload<'_> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&[u8], MsgDecodeError> {
        if self.remaining() < n {
            return Err(MsgDecodeError::Truncated(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u32(&mut self, what: &'static str) -> Result<u32, MsgDecodeError> {
        let mut out = [0u8; 4];
        out.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_le_bytes(out))
    }

    fn take_u64(&mut self, what: &'static str) -> Result<u64, MsgDecodeError> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_le_bytes(out))
    }

    fn take_32(&mut self, what: &'static str) -> Result<[u8; 32], MsgDecodeError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32, what)?);
        Ok(out)
    }

    fn take_64(&mut self, what: &'static str) -> Result<[u8; 64], MsgDecodeError> {
        let mut out = [0u8; 64];
        out.copy_from_slice(self.take(64, what)?);
        Ok(out)
    }

    fn take_blob(&mut self, what: &'static str) -> Result<Bytes, MsgDecodeError> {
        let len = self.take_u32(what)? as usize;
        Ok(Bytes::copy_from_slice(self.take(len, what)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(b: u8) -> Feed {
        Feed([b; 32])
    }

    fn all_messages() -> Vec<Msg> {
        let body = Root::encode_body(&feed(1), 2, 3, &[ObjectKey([7u8; 32])]);
        vec![
            Msg::Sub { feed: feed(1) },
            Msg::Unsub { feed: feed(2) },
            Msg::RqList,
            Msg::List {
                feeds: vec![feed(1), feed(2), feed(3)],
            },
            Msg::Root(Root {
                feed: feed(1),
                nonce: 2,
                seq: 3,
                sig: Signature([5u8; 64]),
                body,
            }),
            Msg::RqObject {
                key: ObjectKey([9u8; 32]),
                prefetch: vec![ObjectKey([8u8; 32])],
            },
            Msg::Object {
                value: Bytes::from_static(b"value bytes"),
            },
            Msg::RqPreview { feed: feed(4) },
            Msg::Ok,
            Msg::Err {
                text: "do not share the feed".to_string(),
            },
            Msg::Ping,
            Msg::Pong,
            Msg::Hello {
                version: 1,
                node_id: NodeId([3u8; 32]),
                nonce: 0xdead_beef,
            },
            Msg::Welcome {
                node_id: NodeId([4u8; 32]),
                nonce: 0xdead_beef,
            },
        ]
    }

    #[test]
    fn roundtrip_every_message_kind() {
        for (i, msg) in all_messages().into_iter().enumerate() {
            let seq = i as u32 + 1;
            let rseq = i as u32;
            let raw = encode(seq, rseq, &msg);
            let (got_seq, got_rseq, got) = decode(&raw).unwrap();
            assert_eq!((got_seq, got_rseq, got), (seq, rseq, msg));
        }
    }

    #[test]
    fn short_frame_rejected() {
        let raw = encode(1, 0, &Msg::Ping);
        let err = decode(&raw[..8]).unwrap_err();
        assert_eq!(err, MsgDecodeError::FrameTooShort { got: 8 });
    }

    #[test]
    fn unknown_type_rejected() {
        let mut raw = encode(1, 0, &Msg::Ping);
        raw[8] = 0xff;
        assert_eq!(decode(&raw).unwrap_err(), MsgDecodeError::UnknownType(0xff));
    }

    #[test]
    fn zero_type_rejected() {
        let mut raw = encode(1, 0, &Msg::Ping);
        raw[8] = 0;
        assert_eq!(decode(&raw).unwrap_err(), MsgDecodeError::UnknownType(0));
    }

    #[test]
    fn truncated_payload_rejected() {
        let raw = encode(1, 0, &Msg::Sub { feed: feed(1) });
        let err = decode(&raw[..raw.len() - 1]).unwrap_err();
        assert_eq!(err, MsgDecodeError::Truncated("feed"));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut raw = encode(1, 0, &Msg::Ok);
        raw.push(0);
        assert_eq!(
            decode(&raw).unwrap_err(),
            MsgDecodeError::Trailing {
                kind: "Ok",
                remaining: 1
            }
        );
    }

    #[test]
    fn header_layout_is_little_endian() {
        let raw = encode(0x0102_0304, 0x0506_0708, &Msg::Ping);
        assert_eq!(&raw[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&raw[4..8], &[0x08, 0x07, 0x06, 0x05]);
        assert_eq!(raw[8], 11);
        assert_eq!(raw.len(), HEADER_LEN);
    }

    #[test]
    fn invalid_utf8_error_text_rejected() {
        let mut raw = encode(1, 0, &Msg::Err { text: "ab".into() });
        let text_start = raw.len() - 2;
        raw[text_start] = 0xff;
        raw[text_start + 1] = 0xfe;
        assert_eq!(decode(&raw).unwrap_err(), MsgDecodeError::BadText);
    }
}
