//! Signed Root descriptors naming the top of an object graph.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use super::hash::ObjectKey;
use super::identity::{Feed, short_hex};

/// Signature over an encoded Root body. Verification is the Container's
/// concern; the exchange core only carries it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", short_hex(&self.0))
    }
}

/// Signed descriptor of one head of a feed.
///
/// `nonce` names a head (branch) within the feed and `seq` is strictly
/// increasing within `(feed, nonce)`. The body is the signed payload; it
/// repeats the addressing fields and names the referenced objects by
/// content hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Root {
    pub feed: Feed,
    pub nonce: u64,
    pub seq: u64,
    pub sig: Signature,
    pub body: Bytes,
}

impl Root {
    /// Published body layout, version 1 (all integers little-endian):
    ///
    /// ```text
    /// [feed 32][nonce u64][seq u64][ref count u32][refs 32 B each]
    /// ```
    pub fn encode_body(feed: &Feed, nonce: u64, seq: u64, refs: &[ObjectKey]) -> Bytes {
        let mut buf = Vec::with_capacity(32 + 8 + 8 + 4 + refs.len() * 32);
        buf.extend_from_slice(feed.as_bytes());
        buf.extend_from_slice(&nonce.to_le_bytes());
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.extend_from_slice(&(refs.len() as u32).to_le_bytes());
        for key in refs {
            buf.extend_from_slice(key.as_bytes());
        }
        Bytes::from(buf)
    }

    pub fn decode_body(body: &[u8]) -> Result<RootBody, RootDecodeError> {
        let mut cur = Cursor { buf: body, pos: 0 };
        let feed = Feed(cur.take_32("feed")?);
        let nonce = cur.take_u64("nonce")?;
        let seq = cur.take_u64("seq")?;
        let count = cur.take_u32("ref count")? as usize;
        let mut refs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            refs.push(ObjectKey(cur.take_32("ref")?));
        }
        if cur.pos != body.len() {
            return Err(RootDecodeError::Trailing(body.len() - cur.pos));
        }
        Ok(RootBody {
            feed,
            nonce,
            seq,
            refs,
        })
    }

    /// Rebuild a descriptor from a signed body as received off the wire.
    pub fn from_signed_body(sig: Signature, body: Bytes) -> Result<Root, RootDecodeError> {
        let decoded = Root::decode_body(&body)?;
        Ok(Root {
            feed: decoded.feed,
            nonce: decoded.nonce,
            seq: decoded.seq,
            sig,
            body,
        })
    }

    /// Referenced object keys named by this Root's body.
    pub fn refs(&self) -> Result<Vec<ObjectKey>, RootDecodeError> {
        Ok(Root::decode_body(&self.body)?.refs)
    }
}

/// Decoded form of a Root body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootBody {
    pub feed: Feed,
    pub nonce: u64,
    pub seq: u64,
    pub refs: Vec<ObjectKey>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RootDecodeError {
    #[error("root body truncated reading {0}")]
    Truncated(&'static str),
    #[error("root body has {0} trailing bytes")]
    Trailing(usize),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&[u8], RootDecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(RootDecodeError::Truncated(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_32(&mut self, what: &'static str) -> Result<[u8; 32], RootDecodeError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32, what)?);
        Ok(out)
    }

    fn take_u32(&mut self, what: &'static str) -> Result<u32, RootDecodeError> {
        let mut out = [0u8; 4];
        out.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_le_bytes(out))
    }

    fn take_u64(&mut self, what: &'static str) -> Result<u64, RootDecodeError> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_le_bytes(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(b: u8) -> Feed {
        Feed([b; 32])
    }

    #[test]
    fn body_roundtrip() {
        let refs = vec![ObjectKey([3u8; 32]), ObjectKey([4u8; 32])];
        let body = Root::encode_body(&feed(1), 7, 42, &refs);
        let decoded = Root::decode_body(&body).unwrap();
        assert_eq!(decoded.feed, feed(1));
        assert_eq!(decoded.nonce, 7);
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.refs, refs);
    }

    #[test]
    fn truncated_body_rejected() {
        let body = Root::encode_body(&feed(1), 0, 1, &[ObjectKey([9u8; 32])]);
        let err = Root::decode_body(&body[..body.len() - 1]).unwrap_err();
        assert_eq!(err, RootDecodeError::Truncated("ref"));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut body = Root::encode_body(&feed(1), 0, 1, &[]).to_vec();
        body.push(0);
        let err = Root::decode_body(&body).unwrap_err();
        assert_eq!(err, RootDecodeError::Trailing(1));
    }

    #[test]
    fn from_signed_body_mirrors_fields() {
        let body = Root::encode_body(&feed(2), 3, 9, &[]);
        let root = Root::from_signed_body(Signature([0u8; 64]), body.clone()).unwrap();
        assert_eq!(root.feed, feed(2));
        assert_eq!(root.nonce, 3);
        assert_eq!(root.seq, 9);
        assert_eq!(root.body, body);
    }
}
