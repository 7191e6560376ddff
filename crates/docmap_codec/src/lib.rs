//! # DocMap Codec
//!
//! Document value model and canonical binary encoding for DocMap.
//!
//! This crate provides:
//! - [`Value`], the dynamic representation of a stored document and its
//!   fields, with strict (type-sensitive) equality
//! - [`ObjectId`], the identifier generated by backends for new documents
//! - deterministic CBOR encoding, so identical values produce identical
//!   bytes (used as identity-map keys and as the stored form of documents)
//!
//! ## Canonical Rules
//!
//! - Maps have text keys, sorted by encoded key (length-first, then bytewise)
//! - Integers use shortest encoding
//! - Floats are doubles and never NaN
//! - Dates and object ids are tagged
//! - No indefinite-length items
//!
//! ## Usage
//!
//! ```
//! use docmap_codec::{to_canonical_cbor, from_cbor, Value};
//!
//! let value = Value::map([("name", Value::from("Alice"))]);
//! let bytes = to_canonical_cbor(&value).unwrap();
//! assert_eq!(from_cbor(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod object_id;
mod serde_impl;
mod value;

pub use decoder::{from_cbor, CanonicalDecoder};
pub use encoder::{to_canonical_cbor, CanonicalEncoder, TAG_DATE_MILLIS, TAG_OBJECT_ID};
pub use error::{CodecError, CodecResult};
pub use object_id::ObjectId;
pub use value::Value;

/// Trait for types that can be encoded to canonical bytes.
pub trait Encode {
    /// Encode this value to canonical CBOR bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Trait for types that can be decoded from bytes.
pub trait Decode: Sized {
    /// Decode this value from CBOR bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl Encode for Value {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_canonical_cbor(self)
    }
}

impl Decode for Value {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}
