//! Low-level primitives for building the storage substrate.
//!
//! Includes byte utilities, the immutable buffer type shared by every layer,
//! and the typed attribute codecs used to build composite keys.

/// Byte-level utilities and encoding/decoding.
///
/// Order-preserving encoders, varints, write buffers and read cursors, and
/// the [`bytes::StaticBuffer`] key/column/value type.
pub mod bytes;

/// Attribute codecs.
///
/// Typed serializers that verify, coerce, and encode attribute values.
pub mod codec;
