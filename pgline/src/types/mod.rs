//! Server-side type descriptors, the host value model, and the codec registry.
//!
//! Resolution flow: the pipeline asks the [`TypeRegistry`] for a
//! [`TypeInfo`] given a host value shape ([`HostKind`]) and a server type
//! ([`WireType`]). Statically registered mapping rules are consulted first;
//! shapes not enumerable ahead of time (arrays, composites, ranges, enums)
//! are constructed on demand by a closed chain of resolvers and cached.
use std::sync::Arc;

use crate::common::ByteStr;

mod convert;
mod registry;
mod value;

#[cfg(feature = "time")]
mod time;

pub use convert::{CodecError, Converter};
pub use registry::{
    CodecOptions, ConverterFactory, MappingCollection, TypeInfo, TypeRegistry, TypeResolver,
};
pub use value::{
    ArrayValue, CompositeValue, EnumValue, HostKind, RangeBound, RangeValue, Timestamp, Value,
};

/// Object identifier of a server-side data type.
pub type Oid = u32;

/// Well-known type object identifiers, from `pg_type.dat`.
pub mod oids {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const VARCHAR: Oid = 1043;
    pub const TIMESTAMP: Oid = 1114;
    pub const TIMESTAMPTZ: Oid = 1184;
    pub const JSONB: Oid = 3802;

    pub const BOOL_ARRAY: Oid = 1000;
    pub const BYTEA_ARRAY: Oid = 1001;
    pub const INT2_ARRAY: Oid = 1005;
    pub const INT4_ARRAY: Oid = 1007;
    pub const TEXT_ARRAY: Oid = 1009;
    pub const VARCHAR_ARRAY: Oid = 1015;
    pub const INT8_ARRAY: Oid = 1016;
    pub const FLOAT4_ARRAY: Oid = 1021;
    pub const FLOAT8_ARRAY: Oid = 1022;
    pub const TIMESTAMP_ARRAY: Oid = 1115;
    pub const TIMESTAMPTZ_ARRAY: Oid = 1185;
    pub const JSONB_ARRAY: Oid = 3807;
}

/// Identifies a server-side data type by stable name and object id.
///
/// Arrays and ranges reference their element descriptor, composites their
/// field descriptors, forming a tree. Cloning is cheap (shared interior).
#[derive(Clone)]
pub struct WireType {
    inner: Arc<WireInner>,
}

struct WireInner {
    name: ByteStr,
    oid: Oid,
    kind: WireKind,
}

/// Structural kind of a [`WireType`].
pub enum WireKind {
    Scalar,
    Array { element: WireType },
    Range { element: WireType },
    Composite { fields: Vec<(ByteStr, WireType)> },
    Enum { labels: Vec<ByteStr> },
}

impl WireType {
    fn new(name: impl Into<ByteStr>, oid: Oid, kind: WireKind) -> Self {
        Self { inner: Arc::new(WireInner { name: name.into(), oid, kind }) }
    }

    pub fn scalar(name: impl Into<ByteStr>, oid: Oid) -> Self {
        Self::new(name, oid, WireKind::Scalar)
    }

    pub fn array(name: impl Into<ByteStr>, oid: Oid, element: WireType) -> Self {
        Self::new(name, oid, WireKind::Array { element })
    }

    pub fn range(name: impl Into<ByteStr>, oid: Oid, element: WireType) -> Self {
        Self::new(name, oid, WireKind::Range { element })
    }

    pub fn composite(
        name: impl Into<ByteStr>,
        oid: Oid,
        fields: Vec<(ByteStr, WireType)>,
    ) -> Self {
        Self::new(name, oid, WireKind::Composite { fields })
    }

    pub fn enumeration(name: impl Into<ByteStr>, oid: Oid, labels: Vec<ByteStr>) -> Self {
        Self::new(name, oid, WireKind::Enum { labels })
    }

    /// Stable type name, e.g. `int4` or `_int4` for its array type.
    pub fn name(&self) -> &ByteStr {
        &self.inner.name
    }

    pub fn oid(&self) -> Oid {
        self.inner.oid
    }

    pub fn kind(&self) -> &WireKind {
        &self.inner.kind
    }
}

impl PartialEq for WireType {
    fn eq(&self, other: &Self) -> bool {
        self.inner.oid == other.inner.oid
    }
}

impl Eq for WireType { }

impl std::fmt::Debug for WireType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireType")
            .field("name", &self.inner.name)
            .field("oid", &self.inner.oid)
            .finish_non_exhaustive()
    }
}
