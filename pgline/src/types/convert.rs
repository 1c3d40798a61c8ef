//! Binary wire format converters.
//!
//! A converter is a stateless bidirectional transform between one [`Value`]
//! and its binary representation for one wire type. NULL never reaches a
//! converter: it is transmitted as the length -1 at the Bind, array-element,
//! or composite-field level by the composing layer.
use std::{borrow::Cow, fmt, sync::Arc};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    HostKind, Oid, TypeInfo, WireKind, WireType,
    value::{ArrayValue, CompositeValue, EnumValue, RangeBound, RangeValue, Timestamp, Value},
};
use crate::common::ByteStr;

/// Stateless bidirectional transform between one [`Value`] and its binary
/// wire bytes for one wire type.
///
/// Array, composite, and range converters are composed from element
/// converters; composition is recursive, never cyclic.
pub trait Converter: Send + Sync {
    /// Append the binary representation of `value`.
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError>;

    /// Decode a full value from its binary representation.
    fn decode(&self, body: Bytes) -> Result<Value, CodecError>;
}

/// A type mapping or value conversion failure.
pub enum CodecError {
    /// No mapping rule matched the (host kind, wire type) pair.
    NoMapping { host: HostKind, wire: ByteStr },
    /// The wire type oid is not registered.
    UnknownOid { oid: Oid },
    /// The wire type name is not registered.
    UnknownTypeName { name: ByteStr },
    /// No default wire type is registered for the host kind.
    NoDefaultType { host: HostKind },
    /// The value variant does not match what the converter expects.
    TypeMismatch { expected: &'static str, found: &'static str },
    /// Column requested by name was not found in the row.
    ColumnNotFound { name: String },
    /// Column requested by position is out of bounds.
    IndexOutOfBounds { index: usize },
    /// Invalid registration, e.g. a mapping declared against a nullable wrapper.
    Config(Cow<'static, str>),
    /// The binary data does not follow the type's documented layout.
    Malformed(Cow<'static, str>),
}

impl CodecError {
    pub(crate) fn mismatch(expected: &'static str, found: &Value) -> Self {
        Self::TypeMismatch { expected, found: found.variant_name() }
    }

    pub(crate) fn malformed(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Malformed(msg.into())
    }
}

impl std::error::Error for CodecError { }

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMapping { host, wire } => {
                write!(f, "no mapping for host kind {host:?} and wire type {wire:?}")
            },
            Self::UnknownOid { oid } => write!(f, "unknown type oid {oid}"),
            Self::UnknownTypeName { name } => write!(f, "unknown type name {name:?}"),
            Self::NoDefaultType { host } => {
                write!(f, "no default wire type for host kind {host:?}")
            },
            Self::TypeMismatch { expected, found } => {
                write!(f, "type missmatch, expected {expected} found {found}")
            },
            Self::ColumnNotFound { name } => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds { index } => write!(f, "index out of bounds: {index}"),
            Self::Config(msg) => write!(f, "invalid mapping configuration, {msg}"),
            Self::Malformed(msg) => write!(f, "malformed binary value, {msg}"),
        }
    }
}

impl fmt::Debug for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

fn expect_len(body: &Bytes, len: usize, what: &'static str) -> Result<(), CodecError> {
    if body.len() != len {
        return Err(CodecError::malformed(format!(
            "{what} must be {len} bytes, got {}",
            body.len(),
        )));
    }
    Ok(())
}

// ===== Scalars =====

pub(crate) struct BoolCodec;

impl Converter for BoolCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            Value::Bool(b) => {
                buf.put_u8(*b as u8);
                Ok(())
            },
            other => Err(CodecError::mismatch("Bool", other)),
        }
    }

    fn decode(&self, body: Bytes) -> Result<Value, CodecError> {
        expect_len(&body, 1, "bool")?;
        Ok(Value::Bool(body[0] != 0))
    }
}

macro_rules! num_codec {
    ($name:ident, $variant:ident, $ty:ty, $put:ident, $get:ident, $label:literal) => {
        pub(crate) struct $name;

        impl Converter for $name {
            fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
                match value {
                    Value::$variant(v) => {
                        buf.$put(*v);
                        Ok(())
                    },
                    other => Err(CodecError::mismatch(stringify!($variant), other)),
                }
            }

            fn decode(&self, mut body: Bytes) -> Result<Value, CodecError> {
                expect_len(&body, size_of::<$ty>(), $label)?;
                Ok(Value::$variant(body.$get()))
            }
        }
    };
}

num_codec!(Int2Codec, Int2, i16, put_i16, get_i16, "int2");
num_codec!(Int4Codec, Int4, i32, put_i32, get_i32, "int4");
num_codec!(Int8Codec, Int8, i64, put_i64, get_i64, "int8");
num_codec!(Float4Codec, Float4, f32, put_f32, get_f32, "float4");
num_codec!(Float8Codec, Float8, f64, put_f64, get_f64, "float8");

pub(crate) struct TextCodec;

impl Converter for TextCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            Value::Text(s) => {
                buf.put(s.as_bytes());
                Ok(())
            },
            other => Err(CodecError::mismatch("Text", other)),
        }
    }

    fn decode(&self, body: Bytes) -> Result<Value, CodecError> {
        match String::from_utf8(body.into()) {
            Ok(s) => Ok(Value::Text(s)),
            Err(e) => Err(CodecError::malformed(format!("text is not utf8: {e}"))),
        }
    }
}

pub(crate) struct ByteaCodec;

impl Converter for ByteaCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            Value::Bytea(b) => {
                buf.put(&b[..]);
                Ok(())
            },
            other => Err(CodecError::mismatch("Bytea", other)),
        }
    }

    fn decode(&self, body: Bytes) -> Result<Value, CodecError> {
        Ok(Value::Bytea(body.into()))
    }
}

/// Microseconds since the postgres epoch, as a big-endian i64.
///
/// `i64::MAX` and `i64::MIN` are the wire representations of `infinity`
/// and `-infinity`.
pub(crate) struct TimestampCodec {
    pub disable_infinity_conversions: bool,
}

impl Converter for TimestampCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            Value::Timestamp(ts) => {
                if self.disable_infinity_conversions && ts.is_infinite() {
                    return Err(CodecError::malformed(
                        "timestamp infinity conversions are disabled",
                    ));
                }
                buf.put_i64(ts.micros());
                Ok(())
            },
            other => Err(CodecError::mismatch("Timestamp", other)),
        }
    }

    fn decode(&self, mut body: Bytes) -> Result<Value, CodecError> {
        expect_len(&body, 8, "timestamp")?;
        let ts = Timestamp::from_micros(body.get_i64());
        if self.disable_infinity_conversions && ts.is_infinite() {
            return Err(CodecError::malformed(
                "timestamp infinity conversions are disabled",
            ));
        }
        Ok(Value::Timestamp(ts))
    }
}

/// `jsonb` binary format: a one byte version prefix, then the json text.
#[cfg(feature = "json")]
pub(crate) struct JsonbCodec;

#[cfg(feature = "json")]
impl Converter for JsonbCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            Value::Json(json) => {
                buf.put_u8(1);
                let text = serde_json::to_vec(json)
                    .map_err(|e| CodecError::malformed(format!("json serialize: {e}")))?;
                buf.put(&text[..]);
                Ok(())
            },
            other => Err(CodecError::mismatch("Json", other)),
        }
    }

    fn decode(&self, mut body: Bytes) -> Result<Value, CodecError> {
        if body.is_empty() || body.get_u8() != 1 {
            return Err(CodecError::malformed("unsupported jsonb version"));
        }
        serde_json::from_slice(&body)
            .map(Value::Json)
            .map_err(|e| CodecError::malformed(format!("json parse: {e}")))
    }
}

// ===== Composed =====

fn encode_nested(
    info: &TypeInfo,
    value: &Value,
    buf: &mut BytesMut,
) -> Result<(), CodecError> {
    match value {
        // -1 indicates NULL, no value bytes follow
        Value::Null => {
            buf.put_i32(-1);
            Ok(())
        },
        value => {
            let mut scratch = BytesMut::new();
            info.converter().encode(value, &mut scratch)?;
            buf.put_i32(
                scratch
                    .len()
                    .try_into()
                    .map_err(|_| CodecError::malformed("nested value too large"))?,
            );
            buf.put(scratch);
            Ok(())
        },
    }
}

fn split_nested(body: &mut Bytes, what: &'static str) -> Result<Option<Bytes>, CodecError> {
    if body.remaining() < 4 {
        return Err(CodecError::malformed(what));
    }
    match body.get_i32() {
        -1 => Ok(None),
        len if len < 0 || body.remaining() < len as usize => Err(CodecError::malformed(what)),
        len => Ok(Some(body.split_to(len as usize))),
    }
}

/// One-dimensional array layout: dimension count, has-nulls flag, element
/// oid, then per dimension length and lower bound, then length-prefixed
/// elements. An empty array is transmitted with zero dimensions.
pub(crate) struct ArrayCodec {
    element: Arc<TypeInfo>,
}

impl ArrayCodec {
    pub fn new(element: Arc<TypeInfo>) -> Self {
        Self { element }
    }
}

impl Converter for ArrayCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
        let Value::Array(arr) = value else {
            return Err(CodecError::mismatch("Array", value));
        };

        if arr.values.is_empty() {
            buf.put_i32(0); // dimensions
            buf.put_i32(0); // has nulls
            buf.put_u32(self.element.wire().oid());
            return Ok(());
        }

        let has_nulls = arr.values.iter().any(Value::is_null);
        buf.put_i32(1);
        buf.put_i32(has_nulls as i32);
        buf.put_u32(self.element.wire().oid());
        buf.put_i32(
            arr.values
                .len()
                .try_into()
                .map_err(|_| CodecError::malformed("array too large"))?,
        );
        buf.put_i32(1); // lower bound

        for value in &arr.values {
            encode_nested(&self.element, value, buf)?;
        }
        Ok(())
    }

    fn decode(&self, mut body: Bytes) -> Result<Value, CodecError> {
        if body.remaining() < 12 {
            return Err(CodecError::malformed("array header"));
        }
        let ndim = body.get_i32();
        let _has_nulls = body.get_i32();
        let oid = body.get_u32();
        if oid != self.element.wire().oid() {
            return Err(CodecError::malformed(format!(
                "array element oid {oid} does not match expected {}",
                self.element.wire().oid(),
            )));
        }

        let element = self.element.host().clone();
        if ndim == 0 {
            return Ok(Value::Array(ArrayValue::new(element, Vec::new())));
        }
        if ndim != 1 {
            return Err(CodecError::malformed("multidimensional arrays are not supported"));
        }
        if body.remaining() < 8 {
            return Err(CodecError::malformed("array dimension"));
        }
        let len = body.get_i32();
        let _lower_bound = body.get_i32();
        if len < 0 {
            return Err(CodecError::malformed("array dimension"));
        }

        let mut values = Vec::with_capacity(len as usize);
        for _ in 0..len {
            match split_nested(&mut body, "array element")? {
                Some(bytes) => values.push(self.element.converter().decode(bytes)?),
                None => values.push(Value::Null),
            }
        }
        Ok(Value::Array(ArrayValue::new(element, values)))
    }
}

/// Composite layout: field count, then per field the declared oid and a
/// length-prefixed value. A zero-field composite is just the count.
pub(crate) struct CompositeCodec {
    wire: WireType,
    fields: Vec<Arc<TypeInfo>>,
}

impl CompositeCodec {
    pub fn new(wire: WireType, fields: Vec<Arc<TypeInfo>>) -> Self {
        Self { wire, fields }
    }
}

impl Converter for CompositeCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
        let Value::Composite(composite) = value else {
            return Err(CodecError::mismatch("Composite", value));
        };
        if composite.fields.len() != self.fields.len() {
            return Err(CodecError::malformed(format!(
                "composite {:?} expects {} fields, got {}",
                self.wire.name(),
                self.fields.len(),
                composite.fields.len(),
            )));
        }

        buf.put_i32(self.fields.len() as i32);
        for (info, value) in self.fields.iter().zip(&composite.fields) {
            buf.put_u32(info.wire().oid());
            encode_nested(info, value, buf)?;
        }
        Ok(())
    }

    fn decode(&self, mut body: Bytes) -> Result<Value, CodecError> {
        if body.remaining() < 4 {
            return Err(CodecError::malformed("composite header"));
        }
        let len = body.get_i32();
        if len as usize != self.fields.len() {
            return Err(CodecError::malformed(format!(
                "composite {:?} expects {} fields, got {len}",
                self.wire.name(),
                self.fields.len(),
            )));
        }

        let mut fields = Vec::with_capacity(self.fields.len());
        for info in &self.fields {
            if body.remaining() < 4 {
                return Err(CodecError::malformed("composite field"));
            }
            let oid = body.get_u32();
            if oid != info.wire().oid() {
                return Err(CodecError::malformed(format!(
                    "composite field oid {oid} does not match expected {}",
                    info.wire().oid(),
                )));
            }
            match split_nested(&mut body, "composite field")? {
                Some(bytes) => fields.push(info.converter().decode(bytes)?),
                None => fields.push(Value::Null),
            }
        }
        Ok(Value::Composite(CompositeValue {
            type_name: self.wire.name().clone(),
            fields,
        }))
    }
}

const RANGE_EMPTY: u8 = 0x01;
const RANGE_LB_INC: u8 = 0x02;
const RANGE_UB_INC: u8 = 0x04;
const RANGE_LB_INF: u8 = 0x08;
const RANGE_UB_INF: u8 = 0x10;

/// Range layout: a flags byte, then a length-prefixed value per present bound.
pub(crate) struct RangeCodec {
    element: Arc<TypeInfo>,
}

impl RangeCodec {
    pub fn new(element: Arc<TypeInfo>) -> Self {
        Self { element }
    }
}

impl Converter for RangeCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
        let Value::Range(range) = value else {
            return Err(CodecError::mismatch("Range", value));
        };

        if range.empty {
            buf.put_u8(RANGE_EMPTY);
            return Ok(());
        }

        let mut flags = 0;
        match &range.lower {
            RangeBound::Inclusive(_) => flags |= RANGE_LB_INC,
            RangeBound::Exclusive(_) => { },
            RangeBound::Unbounded => flags |= RANGE_LB_INF,
        }
        match &range.upper {
            RangeBound::Inclusive(_) => flags |= RANGE_UB_INC,
            RangeBound::Exclusive(_) => { },
            RangeBound::Unbounded => flags |= RANGE_UB_INF,
        }
        buf.put_u8(flags);

        for bound in [&range.lower, &range.upper] {
            if let Some(value) = bound.value() {
                encode_nested(&self.element, value, buf)?;
            }
        }
        Ok(())
    }

    fn decode(&self, mut body: Bytes) -> Result<Value, CodecError> {
        if body.remaining() < 1 {
            return Err(CodecError::malformed("range flags"));
        }
        let flags = body.get_u8();
        let element = self.element.host().clone();

        if flags & RANGE_EMPTY != 0 {
            return Ok(RangeValue::empty(element).into());
        }

        let mut bound = |inf: u8, inc: u8| -> Result<RangeBound, CodecError> {
            if flags & inf != 0 {
                return Ok(RangeBound::Unbounded);
            }
            let bytes = split_nested(&mut body, "range bound")?
                .ok_or_else(|| CodecError::malformed("range bound is null"))?;
            let value = self.element.converter().decode(bytes)?;
            Ok(match flags & inc != 0 {
                true => RangeBound::Inclusive(value),
                false => RangeBound::Exclusive(value),
            })
        };

        let lower = bound(RANGE_LB_INF, RANGE_LB_INC)?;
        let upper = bound(RANGE_UB_INF, RANGE_UB_INC)?;
        Ok(RangeValue::new(element, lower, upper).into())
    }
}

/// Enum labels travel as their text representation.
pub(crate) struct EnumCodec {
    wire: WireType,
}

impl EnumCodec {
    pub fn new(wire: WireType) -> Self {
        Self { wire }
    }

    fn labels(&self) -> &[ByteStr] {
        match self.wire.kind() {
            WireKind::Enum { labels } => labels,
            _ => &[],
        }
    }
}

impl Converter for EnumCodec {
    fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
        let Value::Enum(e) = value else {
            return Err(CodecError::mismatch("Enum", value));
        };
        if !self.labels().contains(&e.label) {
            return Err(CodecError::malformed(format!(
                "{:?} is not a label of enum {:?}",
                e.label,
                self.wire.name(),
            )));
        }
        buf.put(e.label.as_bytes());
        Ok(())
    }

    fn decode(&self, body: Bytes) -> Result<Value, CodecError> {
        let label = ByteStr::from_utf8(body)
            .map_err(|e| CodecError::malformed(format!("enum label is not utf8: {e}")))?;
        if !self.labels().contains(&label) {
            return Err(CodecError::malformed(format!(
                "{label:?} is not a label of enum {:?}",
                self.wire.name(),
            )));
        }
        Ok(Value::Enum(EnumValue { type_name: self.wire.name().clone(), label }))
    }
}
