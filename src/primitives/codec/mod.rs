#![forbid(unsafe_code)]
//! Attribute codecs: typed, order-preserving value serialization.
//!
//! A codec writes a value so that the cursor lands exactly past it, which lets
//! composite keys be decoded field by field. Fixed-width types carry no length
//! marker; variable-width types use the escaped encoding from
//! [`crate::primitives::bytes::ord`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::primitives::bytes::buf::{ReadCursor, WriteBuffer};
use crate::primitives::bytes::StaticBuffer;
use crate::types::{KcvError, Result};

/// Declared value type of an attribute key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// `bool`.
    Boolean,
    /// `i32`.
    Integer,
    /// `i64`.
    Long,
    /// `f64`, NaN excluded.
    Double,
    /// UTF-8 string.
    String,
    /// Raw bytes.
    Bytes,
}

/// Dynamically typed attribute value as handed over by the graph layer.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    /// Boolean value.
    Bool(bool),
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit signed integer.
    Long(i64),
    /// 64-bit float.
    Double(f64),
    /// Owned string.
    Str(String),
    /// Owned bytes.
    Bytes(Vec<u8>),
}

impl AttributeValue {
    /// The natural data type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            AttributeValue::Bool(_) => DataType::Boolean,
            AttributeValue::Int(_) => DataType::Integer,
            AttributeValue::Long(_) => DataType::Long,
            AttributeValue::Double(_) => DataType::Double,
            AttributeValue::Str(_) => DataType::String,
            AttributeValue::Bytes(_) => DataType::Bytes,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::Long(v) => write!(f, "{v}"),
            AttributeValue::Double(v) => write!(f, "{v}"),
            AttributeValue::Str(v) => write!(f, "{v}"),
            AttributeValue::Bytes(v) => write!(f, "bytes(len={})", v.len()),
        }
    }
}

/// Serializer for one attribute type.
///
/// `read` and `write` must be mutual inverses and must each move the cursor
/// exactly across the encoded value.
pub trait AttributeCodec: Send + Sync {
    /// Rust type this codec handles.
    type Value;

    /// Reads a value, advancing the cursor past it.
    fn read(&self, cur: &mut ReadCursor<'_>) -> Result<Self::Value>;

    /// Appends a value. Callers must run [`AttributeCodec::verify`] first.
    fn write(&self, out: &mut WriteBuffer, value: &Self::Value);

    /// Rejects values this codec cannot represent.
    fn verify(&self, value: &Self::Value) -> Result<()> {
        let _ = value;
        Ok(())
    }

    /// Best-effort coercion from a dynamically typed value.
    fn convert(&self, value: &AttributeValue) -> Result<Self::Value>;

    /// Verifies and writes `value` into a fresh buffer.
    fn encode(&self, value: &Self::Value) -> Result<StaticBuffer> {
        self.verify(value)?;
        let mut out = WriteBuffer::new();
        self.write(&mut out, value);
        Ok(out.freeze())
    }

    /// Decodes a buffer holding exactly one value.
    fn decode(&self, buf: &StaticBuffer) -> Result<Self::Value> {
        let mut cur = ReadCursor::new(buf.as_slice());
        let value = self.read(&mut cur)?;
        if !cur.is_exhausted() {
            return Err(KcvError::corruption(format!(
                "{} trailing bytes after value",
                cur.remaining()
            )));
        }
        Ok(value)
    }
}

fn cannot_convert(value: &AttributeValue, target: DataType) -> KcvError {
    KcvError::invalid_value(format!("cannot convert {value:?} to {target:?}"))
}

/// Codec for `bool`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BoolCodec;

impl AttributeCodec for BoolCodec {
    type Value = bool;

    fn read(&self, cur: &mut ReadCursor<'_>) -> Result<bool> {
        match cur.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(KcvError::corruption(format!("invalid bool byte {other}"))),
        }
    }

    fn write(&self, out: &mut WriteBuffer, value: &bool) {
        out.put_u8(u8::from(*value));
    }

    fn convert(&self, value: &AttributeValue) -> Result<bool> {
        match value {
            AttributeValue::Bool(v) => Ok(*v),
            AttributeValue::Int(v) if *v == 0 || *v == 1 => Ok(*v == 1),
            AttributeValue::Long(v) if *v == 0 || *v == 1 => Ok(*v == 1),
            AttributeValue::Str(s) => s
                .trim()
                .parse::<bool>()
                .map_err(|_| cannot_convert(value, DataType::Boolean)),
            _ => Err(cannot_convert(value, DataType::Boolean)),
        }
    }
}

/// Codec for `i32`.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntCodec;

impl AttributeCodec for IntCodec {
    type Value = i32;

    fn read(&self, cur: &mut ReadCursor<'_>) -> Result<i32> {
        cur.get_i32()
    }

    fn write(&self, out: &mut WriteBuffer, value: &i32) {
        out.put_slice(&crate::primitives::bytes::ord::i32_key(*value));
    }

    fn convert(&self, value: &AttributeValue) -> Result<i32> {
        match value {
            AttributeValue::Int(v) => Ok(*v),
            AttributeValue::Long(v) => {
                i32::try_from(*v).map_err(|_| cannot_convert(value, DataType::Integer))
            }
            AttributeValue::Double(v)
                if v.fract() == 0.0 && *v >= i32::MIN as f64 && *v <= i32::MAX as f64 =>
            {
                Ok(*v as i32)
            }
            AttributeValue::Str(s) => s
                .trim()
                .parse::<i32>()
                .map_err(|_| cannot_convert(value, DataType::Integer)),
            _ => Err(cannot_convert(value, DataType::Integer)),
        }
    }
}

/// Codec for `i64`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LongCodec;

impl AttributeCodec for LongCodec {
    type Value = i64;

    fn read(&self, cur: &mut ReadCursor<'_>) -> Result<i64> {
        cur.get_i64()
    }

    fn write(&self, out: &mut WriteBuffer, value: &i64) {
        out.put_i64(*value);
    }

    fn convert(&self, value: &AttributeValue) -> Result<i64> {
        match value {
            AttributeValue::Long(v) => Ok(*v),
            AttributeValue::Int(v) => Ok(i64::from(*v)),
            // 2^63 is exactly representable, so `<` keeps the cast in range.
            AttributeValue::Double(v)
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64 =>
            {
                Ok(*v as i64)
            }
            AttributeValue::Str(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| cannot_convert(value, DataType::Long)),
            _ => Err(cannot_convert(value, DataType::Long)),
        }
    }
}

/// Codec for `f64`. NaN is rejected because it has no place in key order.
#[derive(Clone, Copy, Debug, Default)]
pub struct DoubleCodec;

impl AttributeCodec for DoubleCodec {
    type Value = f64;

    fn read(&self, cur: &mut ReadCursor<'_>) -> Result<f64> {
        cur.get_f64()
    }

    fn write(&self, out: &mut WriteBuffer, value: &f64) {
        // verify() guarantees the value is not NaN. Adding 0.0 folds -0.0
        // into 0.0 so equal values share one key.
        if let Ok(key) = crate::primitives::bytes::ord::f64_key(*value + 0.0) {
            out.put_slice(&key);
        }
    }

    fn verify(&self, value: &f64) -> Result<()> {
        if value.is_nan() {
            return Err(KcvError::invalid_value("NaN is not a valid double attribute"));
        }
        Ok(())
    }

    fn convert(&self, value: &AttributeValue) -> Result<f64> {
        match value {
            AttributeValue::Double(v) => Ok(*v),
            AttributeValue::Int(v) => Ok(f64::from(*v)),
            AttributeValue::Long(v) => Ok(*v as f64),
            AttributeValue::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| cannot_convert(value, DataType::Double)),
            _ => Err(cannot_convert(value, DataType::Double)),
        }
    }
}

/// Codec for UTF-8 strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringCodec;

impl AttributeCodec for StringCodec {
    type Value = String;

    fn read(&self, cur: &mut ReadCursor<'_>) -> Result<String> {
        let bytes = cur.get_escaped()?;
        String::from_utf8(bytes).map_err(|_| KcvError::corruption("string attribute not UTF-8"))
    }

    fn write(&self, out: &mut WriteBuffer, value: &String) {
        out.put_escaped(value.as_bytes());
    }

    fn convert(&self, value: &AttributeValue) -> Result<String> {
        match value {
            AttributeValue::Str(s) => Ok(s.clone()),
            AttributeValue::Bytes(_) => Err(cannot_convert(value, DataType::String)),
            other => Ok(other.to_string()),
        }
    }
}

/// Codec for raw byte strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesCodec;

impl AttributeCodec for BytesCodec {
    type Value = Vec<u8>;

    fn read(&self, cur: &mut ReadCursor<'_>) -> Result<Vec<u8>> {
        cur.get_escaped()
    }

    fn write(&self, out: &mut WriteBuffer, value: &Vec<u8>) {
        out.put_escaped(value);
    }

    fn convert(&self, value: &AttributeValue) -> Result<Vec<u8>> {
        match value {
            AttributeValue::Bytes(b) => Ok(b.clone()),
            AttributeValue::Str(s) => Ok(s.as_bytes().to_vec()),
            _ => Err(cannot_convert(value, DataType::Bytes)),
        }
    }
}

fn write_typed<C: AttributeCodec>(
    codec: C,
    value: &AttributeValue,
    out: &mut WriteBuffer,
) -> Result<()> {
    let converted = codec.convert(value)?;
    codec.verify(&converted)?;
    codec.write(out, &converted);
    Ok(())
}

impl DataType {
    /// Coerces `value` to this type and appends its encoding.
    pub fn write_value(self, value: &AttributeValue, out: &mut WriteBuffer) -> Result<()> {
        match self {
            DataType::Boolean => write_typed(BoolCodec, value, out),
            DataType::Integer => write_typed(IntCodec, value, out),
            DataType::Long => write_typed(LongCodec, value, out),
            DataType::Double => write_typed(DoubleCodec, value, out),
            DataType::String => write_typed(StringCodec, value, out),
            DataType::Bytes => write_typed(BytesCodec, value, out),
        }
    }

    /// Reads one value of this type, advancing the cursor past it.
    pub fn read_value(self, cur: &mut ReadCursor<'_>) -> Result<AttributeValue> {
        Ok(match self {
            DataType::Boolean => AttributeValue::Bool(BoolCodec.read(cur)?),
            DataType::Integer => AttributeValue::Int(IntCodec.read(cur)?),
            DataType::Long => AttributeValue::Long(LongCodec.read(cur)?),
            DataType::Double => AttributeValue::Double(DoubleCodec.read(cur)?),
            DataType::String => AttributeValue::Str(StringCodec.read(cur)?),
            DataType::Bytes => AttributeValue::Bytes(BytesCodec.read(cur)?),
        })
    }

    /// Coerces `value` to this type without encoding it.
    pub fn coerce(self, value: &AttributeValue) -> Result<AttributeValue> {
        Ok(match self {
            DataType::Boolean => AttributeValue::Bool(BoolCodec.convert(value)?),
            DataType::Integer => AttributeValue::Int(IntCodec.convert(value)?),
            DataType::Long => AttributeValue::Long(LongCodec.convert(value)?),
            DataType::Double => {
                let v = DoubleCodec.convert(value)?;
                DoubleCodec.verify(&v)?;
                AttributeValue::Double(v)
            }
            DataType::String => AttributeValue::Str(StringCodec.convert(value)?),
            DataType::Bytes => AttributeValue::Bytes(BytesCodec.convert(value)?),
        })
    }
}

impl DataType {
    /// One-byte tag identifying the type in self-describing encodings.
    pub fn tag(self) -> u8 {
        match self {
            DataType::Boolean => 1,
            DataType::Integer => 2,
            DataType::Long => 3,
            DataType::Double => 4,
            DataType::String => 5,
            DataType::Bytes => 6,
        }
    }

    /// Inverse of [`DataType::tag`].
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => DataType::Boolean,
            2 => DataType::Integer,
            3 => DataType::Long,
            4 => DataType::Double,
            5 => DataType::String,
            6 => DataType::Bytes,
            other => return Err(KcvError::corruption(format!("unknown value tag {other}"))),
        })
    }
}

/// Encodes `value` prefixed with its type tag.
pub fn encode_value(value: &AttributeValue) -> Result<StaticBuffer> {
    let data_type = value.data_type();
    let mut out = WriteBuffer::new();
    out.put_u8(data_type.tag());
    data_type.write_value(value, &mut out)?;
    Ok(out.freeze())
}

/// Decodes a buffer produced by [`encode_value`].
pub fn decode_value(buf: &StaticBuffer) -> Result<AttributeValue> {
    let mut cur = ReadCursor::new(buf.as_slice());
    let data_type = DataType::from_tag(cur.get_u8()?)?;
    let value = data_type.read_value(&mut cur)?;
    if !cur.is_exhausted() {
        return Err(KcvError::corruption(format!(
            "{} trailing bytes after tagged value",
            cur.remaining()
        )));
    }
    Ok(value)
}
