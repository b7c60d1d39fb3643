//! Wire codec: zlib compression and SHA-256 content digests.
//!
//! The digest is computed over the *compressed* bytes, so every node must
//! use the same compression level to agree on digests.

use std::fmt;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{NodeError, NodeResult};
use crate::message::SharedMessage;

/// Maximum UDP payload exchanged between nodes.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Upper bound on decompressed size, guarding against zlib bombs.
const MAX_DECOMPRESSED_SIZE: u64 = 1 << 20;

/// A 64 character lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Hashes `bytes`.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Parses a hex digest, normalizing to lowercase.
    pub fn parse(s: &str) -> NodeResult<Self> {
        if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(NodeError::InvalidDigest(s.to_string()))
        }
    }

    /// The hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex characters, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = NodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// Compresses a JSON string.
pub fn compress(json: &str) -> NodeResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(json.as_bytes())
        .map_err(|e| NodeError::Codec(format!("compress: {e}")))?;
    encoder
        .finish()
        .map_err(|e| NodeError::Codec(format!("compress: {e}")))
}

/// Decompresses bytes produced by [`compress`] back into a UTF-8 string.
pub fn decompress(bytes: &[u8]) -> NodeResult<String> {
    let mut out = String::new();
    ZlibDecoder::new(bytes)
        .take(MAX_DECOMPRESSED_SIZE)
        .read_to_string(&mut out)
        .map_err(|e| NodeError::Codec(format!("decompress: {e}")))?;
    Ok(out)
}

/// Digest of compressed bytes.
#[must_use]
pub fn digest(compressed: &[u8]) -> Digest {
    Digest::of(compressed)
}

/// A message in all the forms the node needs.
#[derive(Debug, Clone)]
pub struct Encoded {
    /// The wire JSON.
    pub json: String,
    /// Compressed datagram payload.
    pub bytes: Vec<u8>,
    /// Digest of `bytes`.
    pub digest: Digest,
}

/// Serializes, compresses and hashes a message.
pub fn encode(message: &SharedMessage) -> NodeResult<Encoded> {
    encode_json(message.to_json()?)
}

/// Compresses and hashes already-serialized wire JSON.
pub fn encode_json(json: String) -> NodeResult<Encoded> {
    let bytes = compress(&json)?;
    let digest = digest(&bytes);
    Ok(Encoded {
        json,
        bytes,
        digest,
    })
}

/// Decompresses and parses a datagram, returning the message and its JSON.
pub fn decode(bytes: &[u8]) -> NodeResult<(SharedMessage, String)> {
    let json = decompress(bytes)?;
    let message = SharedMessage::from_json(&json)?;
    Ok((message, json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn digest_is_64_lowercase_hex() {
        let d = Digest::of(b"hello");
        assert_eq!(d.as_str().len(), 64);
        assert!(d.as_str().bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));
        assert_eq!(
            d.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn parse_validates_and_lowercases() {
        let upper = "2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824";
        assert_eq!(Digest::parse(upper).unwrap(), Digest::of(b"hello"));
        assert!(Digest::parse("abc").is_err());
        assert!(Digest::parse(&"g".repeat(64)).is_err());
    }

    #[test]
    fn digest_covers_compressed_bytes() {
        let encoded = encode(&SharedMessage::new(json!({"x": 1}))).unwrap();
        assert_eq!(encoded.digest, Digest::of(&encoded.bytes));
        assert_ne!(encoded.digest, Digest::of(encoded.json.as_bytes()));
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = encode(&SharedMessage::new(json!({"b": [1, 2], "a": "z"}))).unwrap();
        let b = encode(&SharedMessage::new(json!({"a": "z", "b": [1, 2]}))).unwrap();
        assert_eq!(a.bytes, b.bytes);
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn decode_rejects_uncompressed_input() {
        assert!(decode(br#"{"data": 1}"#).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn decode_rejects_non_message_json() {
        let bytes = compress("[1, 2, 3]").unwrap();
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn digest_serde_validates() {
        let d = Digest::of(b"x");
        let json = serde_json::to_string(&d).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(serde_json::from_str::<Digest>("\"nope\"").is_err());
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(text in ".{0,200}", n in any::<i64>()) {
            let msg = SharedMessage::new(json!({"text": text, "n": n}));
            let encoded = encode(&msg).unwrap();
            let (decoded, json) = decode(&encoded.bytes).unwrap();
            prop_assert_eq!(decoded, msg);
            prop_assert_eq!(json, encoded.json);
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&bytes);
        }
    }
}
