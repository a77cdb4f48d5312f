//! Codec module - serialization of envelopes on the broker.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`, struct-as-map)
//!
//! Codecs are marker structs with static methods rather than trait objects, so
//! every envelope goes through the same encoding without dynamic dispatch.
//!
//! # Example
//!
//! ```
//! use leafwire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
