//! The closed host value model.
//!
//! Converters are dispatched over these tagged variants instead of runtime
//! reflection, so every constructible shape is enumerable ahead of time.
use crate::common::ByteStr;

/// An in-memory value that can cross the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Timestamp(Timestamp),
    Array(ArrayValue),
    Composite(CompositeValue),
    Range(Box<RangeValue>),
    Enum(EnumValue),
    #[cfg(feature = "json")]
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The shape of this value, used as the registry lookup key.
    pub fn kind(&self) -> HostKind {
        match self {
            Value::Null => HostKind::Unknown,
            Value::Bool(_) => HostKind::Bool,
            Value::Int2(_) => HostKind::Int2,
            Value::Int4(_) => HostKind::Int4,
            Value::Int8(_) => HostKind::Int8,
            Value::Float4(_) => HostKind::Float4,
            Value::Float8(_) => HostKind::Float8,
            Value::Text(_) => HostKind::Text,
            Value::Bytea(_) => HostKind::Bytea,
            Value::Timestamp(_) => HostKind::Timestamp,
            Value::Array(a) => HostKind::Array(Box::new(a.element.clone())),
            Value::Composite(c) => HostKind::Composite(c.type_name.clone()),
            Value::Range(r) => HostKind::Range(Box::new(r.element.clone())),
            Value::Enum(e) => HostKind::Enum(e.type_name.clone()),
            #[cfg(feature = "json")]
            Value::Json(_) => HostKind::Json,
        }
    }

    /// Variant name for conversion error reporting.
    pub(crate) fn variant_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int2(_) => "Int2",
            Value::Int4(_) => "Int4",
            Value::Int8(_) => "Int8",
            Value::Float4(_) => "Float4",
            Value::Float8(_) => "Float8",
            Value::Text(_) => "Text",
            Value::Bytea(_) => "Bytea",
            Value::Timestamp(_) => "Timestamp",
            Value::Array(_) => "Array",
            Value::Composite(_) => "Composite",
            Value::Range(_) => "Range",
            Value::Enum(_) => "Enum",
            #[cfg(feature = "json")]
            Value::Json(_) => "Json",
        }
    }
}

/// Shape descriptor of a host value.
///
/// `Unknown` requests late-bound resolution from the wire type alone.
/// `Nullable` is a wrapper unwrapped at resolution time; registering a
/// mapping against it directly is a configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostKind {
    Unknown,
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Bytea,
    Timestamp,
    #[cfg(feature = "json")]
    Json,
    Array(Box<HostKind>),
    Composite(ByteStr),
    Range(Box<HostKind>),
    Enum(ByteStr),
    Nullable(Box<HostKind>),
}

impl HostKind {
    /// Unwrap any number of nullable wrappers.
    pub fn strip_nullable(&self) -> &HostKind {
        let mut kind = self;
        while let HostKind::Nullable(inner) = kind {
            kind = inner;
        }
        kind
    }
}

/// Microseconds since midnight 2000-01-01, the postgres timestamp epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    pub const POS_INFINITY: Timestamp = Timestamp { micros: i64::MAX };
    pub const NEG_INFINITY: Timestamp = Timestamp { micros: i64::MIN };

    /// Seconds between the unix epoch and the postgres epoch.
    pub const EPOCH_UNIX_SECS: i64 = 946_684_800;

    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub const fn micros(self) -> i64 {
        self.micros
    }

    pub const fn is_infinite(self) -> bool {
        self.micros == i64::MAX || self.micros == i64::MIN
    }
}

/// One-dimensional array of values sharing an element shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub element: HostKind,
    pub values: Vec<Value>,
}

impl ArrayValue {
    pub fn new(element: HostKind, values: Vec<Value>) -> Self {
        Self { element, values }
    }
}

/// Row value of a named composite type, fields in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeValue {
    pub type_name: ByteStr,
    pub fields: Vec<Value>,
}

impl CompositeValue {
    pub fn new(type_name: impl Into<ByteStr>, fields: Vec<Value>) -> Self {
        Self { type_name: type_name.into(), fields }
    }
}

/// A range over an ordered element type.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeValue {
    pub element: HostKind,
    /// An empty range contains no points; its bounds are meaningless.
    pub empty: bool,
    pub lower: RangeBound,
    pub upper: RangeBound,
}

impl RangeValue {
    pub fn empty(element: HostKind) -> Self {
        Self { element, empty: true, lower: RangeBound::Unbounded, upper: RangeBound::Unbounded }
    }

    pub fn new(element: HostKind, lower: RangeBound, upper: RangeBound) -> Self {
        Self { element, empty: false, lower, upper }
    }
}

/// One end of a [`RangeValue`].
#[derive(Debug, Clone, PartialEq)]
pub enum RangeBound {
    Inclusive(Value),
    Exclusive(Value),
    Unbounded,
}

impl RangeBound {
    pub(crate) fn value(&self) -> Option<&Value> {
        match self {
            RangeBound::Inclusive(v) | RangeBound::Exclusive(v) => Some(v),
            RangeBound::Unbounded => None,
        }
    }
}

/// A label of a named enum type.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub type_name: ByteStr,
    pub label: ByteStr,
}

impl EnumValue {
    pub fn new(type_name: impl Into<ByteStr>, label: impl Into<ByteStr>) -> Self {
        Self { type_name: type_name.into(), label: label.into() }
    }
}

macro_rules! from {
    ($ty:ty => $variant:ident) => {
        impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::$variant(value.into())
            }
        }
    };
}

from!(bool => Bool);
from!(i16 => Int2);
from!(i32 => Int4);
from!(i64 => Int8);
from!(f32 => Float4);
from!(f64 => Float8);
from!(String => Text);
from!(&str => Text);
from!(Vec<u8> => Bytea);
from!(Timestamp => Timestamp);
from!(ArrayValue => Array);
from!(CompositeValue => Composite);
from!(EnumValue => Enum);

impl From<RangeValue> for Value {
    fn from(value: RangeValue) -> Self {
        Value::Range(Box::new(value))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_of_nested_array() {
        let arr = Value::Array(ArrayValue::new(HostKind::Int4, vec![1i32.into(), Value::Null]));
        assert_eq!(arr.kind(), HostKind::Array(Box::new(HostKind::Int4)));
    }

    #[test]
    fn strip_nullable_unwraps_repeatedly() {
        let wrapped = HostKind::Nullable(Box::new(HostKind::Nullable(Box::new(HostKind::Text))));
        assert_eq!(wrapped.strip_nullable(), &HostKind::Text);
    }
}
