//! Content addressing: SHA-256 object keys.

use std::fmt;

use sha2::{Digest, Sha256};

use super::identity::{hex, short_hex};

/// SHA-256 digest addressing an opaque object.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey(pub [u8; 32]);

impl ObjectKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({})", short_hex(&self.0))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex(&self.0))
    }
}

pub fn sha256_bytes(data: &[u8]) -> ObjectKey {
    let mut hasher = Sha256::new();
    hasher.update(data);
    ObjectKey(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_empty_input() {
        let key = sha256_bytes(b"");
        assert_eq!(
            key.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn distinct_inputs_distinct_keys() {
        assert_ne!(sha256_bytes(b"a"), sha256_bytes(b"b"));
    }
}
