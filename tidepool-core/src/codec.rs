//! Pluggable message serialization.
//!
//! The [`MessageCodec`] trait is the extension point applications use to
//! bring their own payload format. The framing layer treats encoded
//! bodies as opaque bytes; only the codec knows the payload types.
//!
//! # Example
//!
//! ```rust
//! use tidepool_core::{MessageCodec, JsonCodec, CodecError};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct MyMessage {
//!     id: u32,
//!     content: String,
//! }
//!
//! let codec = JsonCodec;
//! let msg = MyMessage { id: 42, content: "hello".to_string() };
//!
//! let bytes = codec.encode(&msg).unwrap();
//! let decoded: MyMessage = codec.decode(&bytes).unwrap();
//! assert_eq!(msg, decoded);
//! ```

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec operations.
#[derive(Debug)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a message.
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode error: {}", e),
            CodecError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Encode(e) => Some(e.as_ref()),
            CodecError::Decode(e) => Some(e.as_ref()),
        }
    }
}

/// Pluggable message serialization format.
///
/// Implement this trait to use custom serialization formats. The trait
/// requires `Clone + 'static` so codec instances can be stored in peers
/// and response futures.
///
/// # Serde dependency
///
/// The trait uses serde's `Serialize` and `DeserializeOwned` bounds, so
/// message types must derive or implement serde traits.
pub trait MessageCodec: Clone + 'static {
    /// Encode a serializable message to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
///
/// Human-readable and easy to debug; the default choice while bringing
/// a service up.
///
/// # Example
///
/// ```rust
/// use tidepool_core::{MessageCodec, JsonCodec};
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Serialize, Deserialize, PartialEq, Debug)]
/// struct Ping { seq: u32 }
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&Ping { seq: 1 }).unwrap();
/// assert_eq!(&bytes, br#"{"seq":1}"#);
/// ```
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

/// MessagePack codec using rmp-serde.
///
/// Compact binary bodies for production traffic. Structs are encoded as
/// named maps so independently-built peers can evolve their message
/// types field by field.
#[derive(Clone, Default, Debug, Copy)]
pub struct MsgpackCodec;

impl MessageCodec for MsgpackCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        rmp_serde::encode::to_vec_named(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        rmp_serde::decode::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
    struct TestMessage {
        id: u32,
        content: String,
    }

    #[test]
    fn json_roundtrip() {
        let codec = JsonCodec;
        let msg = TestMessage {
            id: 42,
            content: "hello world".to_string(),
        };

        let bytes = codec.encode(&msg).expect("encode should succeed");
        let decoded: TestMessage = codec.decode(&bytes).expect("decode should succeed");

        assert_eq!(msg, decoded);
    }

    #[test]
    fn msgpack_roundtrip() {
        let codec = MsgpackCodec;
        let msg = TestMessage {
            id: 7,
            content: "compact".to_string(),
        };

        let bytes = codec.encode(&msg).expect("encode should succeed");
        let decoded: TestMessage = codec.decode(&bytes).expect("decode should succeed");

        assert_eq!(msg, decoded);
    }

    #[test]
    fn msgpack_is_smaller_than_json_for_structs() {
        let msg = TestMessage {
            id: 123456,
            content: "x".repeat(64),
        };
        let json = JsonCodec.encode(&msg).expect("json encode");
        let msgpack = MsgpackCodec.encode(&msg).expect("msgpack encode");
        assert!(msgpack.len() < json.len());
    }

    #[test]
    fn json_decode_error() {
        let codec = JsonCodec;
        let invalid = b"not valid json {";

        let result: Result<TestMessage, CodecError> = codec.decode(invalid);
        let err = result.err().expect("decode should fail");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().contains("decode error"));
    }

    #[test]
    fn json_type_mismatch() {
        let codec = JsonCodec;
        let msg = TestMessage {
            id: 42,
            content: "hello".to_string(),
        };

        let bytes = codec.encode(&msg).expect("encode should succeed");
        let result: Result<String, CodecError> = codec.decode(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn json_primitives() {
        let codec = JsonCodec;

        let n = 12345u64;
        let bytes = codec.encode(&n).expect("encode should succeed");
        let decoded: u64 = codec.decode(&bytes).expect("decode should succeed");
        assert_eq!(n, decoded);

        let v = vec![1, 2, 3, 4, 5];
        let bytes = codec.encode(&v).expect("encode should succeed");
        let decoded: Vec<i32> = codec.decode(&bytes).expect("decode should succeed");
        assert_eq!(v, decoded);
    }
}
