//! Mapping rules, the resolver chain, and the codec registry.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::{
    HostKind, Oid, WireKind, WireType, oids,
    convert::{
        ArrayCodec, BoolCodec, ByteaCodec, CodecError, CompositeCodec, Converter, EnumCodec,
        Float4Codec, Float8Codec, Int2Codec, Int4Codec, Int8Codec, RangeCodec, TextCodec,
        TimestampCodec,
    },
    value::Value,
};
use crate::common::ByteStr;

#[cfg(feature = "json")]
use super::convert::JsonbCodec;

/// Behavior toggles threaded through registry construction.
///
/// These are explicit per-instance fields rather than ambient process
/// state, so behavior is deterministic and testable per registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecOptions {
    /// Bind [`Timestamp`][super::Timestamp] parameters as `timestamp`
    /// (without time zone) by default instead of `timestamptz`.
    pub legacy_timestamp_behavior: bool,
    /// Refuse to read or write the `infinity` / `-infinity` timestamp values.
    pub disable_infinity_conversions: bool,
}

/// Builds a [`Converter`] for a wire type, resolving element converters
/// through the registry as needed.
pub type ConverterFactory =
    Arc<dyn Fn(&WireType, &TypeRegistry) -> Result<Arc<dyn Converter>, CodecError> + Send + Sync>;

/// Immutable record binding a host shape and a wire type to a converter.
///
/// Produced by [`TypeRegistry::resolve`] and cached per (host kind, oid)
/// pair for the lifetime of the registry; repeated resolution returns the
/// identical `Arc`.
pub struct TypeInfo {
    host: HostKind,
    wire: WireType,
    converter: Arc<dyn Converter>,
}

impl TypeInfo {
    pub fn host(&self) -> &HostKind {
        &self.host
    }

    pub fn wire(&self) -> &WireType {
        &self.wire
    }

    pub fn converter(&self) -> &dyn Converter {
        &*self.converter
    }

    /// Encode a value for Bind; `None` is the NULL parameter.
    pub fn encode(&self, value: &Value) -> Result<Option<bytes::Bytes>, CodecError> {
        match value {
            Value::Null => Ok(None),
            value => {
                let mut buf = bytes::BytesMut::new();
                self.converter.encode(value, &mut buf)?;
                Ok(Some(buf.freeze()))
            },
        }
    }
}

impl std::fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInfo")
            .field("host", &self.host)
            .field("wire", &self.wire)
            .finish_non_exhaustive()
    }
}

/// Host-shape predicate of a mapping rule.
enum HostMatch {
    Exact(HostKind),
    ArrayOf(HostKind),
}

impl HostMatch {
    fn matches(&self, host: &HostKind) -> bool {
        match self {
            HostMatch::Exact(kind) => host == kind,
            HostMatch::ArrayOf(element) => {
                matches!(host, HostKind::Array(e) if **e == *element)
            },
        }
    }

    /// The nominal host kind this rule produces for a late-bound lookup.
    fn resolved_kind(&self) -> HostKind {
        match self {
            HostMatch::Exact(kind) => kind.clone(),
            HostMatch::ArrayOf(element) => HostKind::Array(Box::new(element.clone())),
        }
    }
}

struct MappingRule {
    host: HostMatch,
    wire_name: ByteStr,
    factory: ConverterFactory,
}

/// Ordered list of mapping rules; first structural match wins.
#[derive(Default)]
pub struct MappingCollection {
    rules: Vec<MappingRule>,
}

impl MappingCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule mapping `host` to the wire type named `wire_name`.
    ///
    /// A nullable wrapper is rejected: a mapping must be declared against
    /// the underlying kind and nullability handled by the converter layer,
    /// never as a separate rule.
    pub fn add(
        &mut self,
        host: HostKind,
        wire_name: impl Into<ByteStr>,
        factory: ConverterFactory,
    ) -> Result<&mut Self, CodecError> {
        if matches!(host, HostKind::Nullable(_)) {
            return Err(CodecError::Config(
                "mapping nullable kinds is not supported, map the underlying kind instead".into(),
            ));
        }
        self.rules.push(MappingRule {
            host: HostMatch::Exact(host),
            wire_name: wire_name.into(),
            factory,
        });
        Ok(self)
    }

    /// Register a rule mapping arrays of `element` to the wire type named
    /// `wire_name`.
    pub fn add_array(
        &mut self,
        element: HostKind,
        wire_name: impl Into<ByteStr>,
        factory: ConverterFactory,
    ) -> Result<&mut Self, CodecError> {
        if matches!(element, HostKind::Nullable(_)) {
            return Err(CodecError::Config(
                "mapping nullable kinds is not supported, map the underlying kind instead".into(),
            ));
        }
        self.rules.push(MappingRule {
            host: HostMatch::ArrayOf(element),
            wire_name: wire_name.into(),
            factory,
        });
        Ok(self)
    }

    /// Linear scan in registration order; the first rule whose wire name
    /// and host predicate both accept wins. A late-bound (`Unknown`) host
    /// matches the first rule declared for the wire type.
    fn find(
        &self,
        host: &HostKind,
        wire: &WireType,
        registry: &TypeRegistry,
    ) -> Result<Option<TypeInfo>, CodecError> {
        for rule in &self.rules {
            if rule.wire_name != *wire.name() {
                continue;
            }
            let matched = match host {
                HostKind::Unknown => true,
                host => rule.host.matches(host),
            };
            if !matched {
                continue;
            }

            let converter = (rule.factory)(wire, registry)?;
            let host = match host {
                HostKind::Unknown => rule.host.resolved_kind(),
                host => host.clone(),
            };
            return Ok(Some(TypeInfo { host, wire: wire.clone(), converter }));
        }
        Ok(None)
    }

    fn default_wire_name(&self, host: &HostKind) -> Option<&ByteStr> {
        self.rules
            .iter()
            .find(|rule| rule.host.matches(host))
            .map(|rule| &rule.wire_name)
    }
}

/// Constructs mapping rules on demand for shapes not enumerable ahead of
/// time.
///
/// Resolvers are tried in installation order; the first to return a
/// non-`None` collection for the given inputs wins. If all return `None`,
/// resolution fails.
pub trait TypeResolver: Send + Sync {
    fn mappings(
        &self,
        host: &HostKind,
        wire: &WireType,
        registry: &TypeRegistry,
    ) -> Option<MappingCollection>;
}

/// Arrays: any wire array type whose element resolves.
struct ArrayResolver;

impl TypeResolver for ArrayResolver {
    fn mappings(
        &self,
        host: &HostKind,
        wire: &WireType,
        _: &TypeRegistry,
    ) -> Option<MappingCollection> {
        let WireKind::Array { element } = wire.kind() else {
            return None;
        };
        let element_host = match host {
            HostKind::Array(e) => (**e).clone(),
            HostKind::Unknown => HostKind::Unknown,
            _ => return None,
        };

        let element_wire = element.clone();
        let factory_host = element_host.clone();
        let mut collection = MappingCollection::new();
        collection
            .add_array(
                element_host,
                wire.name().clone(),
                Arc::new(move |_: &WireType, registry: &TypeRegistry| {
                    let element = registry.resolve(&factory_host, &element_wire)?;
                    Ok(Arc::new(ArrayCodec::new(element)) as Arc<dyn Converter>)
                }),
            )
            .ok()?;
        Some(collection)
    }
}

/// Ranges: any wire range type whose element resolves.
struct RangeResolver;

impl TypeResolver for RangeResolver {
    fn mappings(
        &self,
        host: &HostKind,
        wire: &WireType,
        _: &TypeRegistry,
    ) -> Option<MappingCollection> {
        let WireKind::Range { element } = wire.kind() else {
            return None;
        };
        let element_host = match host {
            HostKind::Range(e) => (**e).clone(),
            HostKind::Unknown => HostKind::Unknown,
            _ => return None,
        };

        let element_wire = element.clone();
        let factory_host = element_host.clone();
        let mut collection = MappingCollection::new();
        collection
            .add(
                HostKind::Range(Box::new(element_host)),
                wire.name().clone(),
                Arc::new(move |_: &WireType, registry: &TypeRegistry| {
                    let element = registry.resolve(&factory_host, &element_wire)?;
                    Ok(Arc::new(RangeCodec::new(element)) as Arc<dyn Converter>)
                }),
            )
            .ok()?;
        Some(collection)
    }
}

/// Composites: field converters resolve late-bound from the field tree.
struct CompositeResolver;

impl TypeResolver for CompositeResolver {
    fn mappings(
        &self,
        host: &HostKind,
        wire: &WireType,
        _: &TypeRegistry,
    ) -> Option<MappingCollection> {
        let WireKind::Composite { .. } = wire.kind() else {
            return None;
        };
        match host {
            HostKind::Composite(name) if *name == *wire.name() => { },
            HostKind::Unknown => { },
            _ => return None,
        }

        let mut collection = MappingCollection::new();
        collection
            .add(
                HostKind::Composite(wire.name().clone()),
                wire.name().clone(),
                Arc::new(|wire: &WireType, registry: &TypeRegistry| {
                    let WireKind::Composite { fields } = wire.kind() else {
                        return Err(CodecError::Config("composite factory on non-composite".into()));
                    };
                    let fields = fields
                        .iter()
                        .map(|(_, field)| registry.resolve(&HostKind::Unknown, field))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Arc::new(CompositeCodec::new(wire.clone(), fields)) as Arc<dyn Converter>)
                }),
            )
            .ok()?;
        Some(collection)
    }
}

/// Enums: labels are carried by the wire type itself.
struct EnumResolver;

impl TypeResolver for EnumResolver {
    fn mappings(
        &self,
        host: &HostKind,
        wire: &WireType,
        _: &TypeRegistry,
    ) -> Option<MappingCollection> {
        let WireKind::Enum { .. } = wire.kind() else {
            return None;
        };
        match host {
            HostKind::Enum(name) if *name == *wire.name() => { },
            HostKind::Unknown => { },
            _ => return None,
        }

        let mut collection = MappingCollection::new();
        collection
            .add(
                HostKind::Enum(wire.name().clone()),
                wire.name().clone(),
                Arc::new(|wire: &WireType, _: &TypeRegistry| {
                    Ok(Arc::new(EnumCodec::new(wire.clone())) as Arc<dyn Converter>)
                }),
            )
            .ok()?;
        Some(collection)
    }
}

/// The type/codec resolution registry.
///
/// Holds the known wire types, the statically registered mapping rules,
/// the dynamic resolver chain, and the resolution cache.
pub struct TypeRegistry {
    options: CodecOptions,
    by_oid: HashMap<Oid, WireType>,
    by_name: HashMap<ByteStr, WireType>,
    mappings: MappingCollection,
    resolvers: Vec<Box<dyn TypeResolver>>,
    cache: Mutex<HashMap<(HostKind, Oid), Arc<TypeInfo>>>,
}

macro_rules! scalar_factory {
    ($codec:expr) => {
        Arc::new(|_: &WireType, _: &TypeRegistry| Ok(Arc::new($codec) as Arc<dyn Converter>))
    };
}

impl TypeRegistry {
    /// A registry with the built-in scalar types, their array types, the
    /// default mapping rules, and the built-in shape resolver chain.
    pub fn new(options: CodecOptions) -> Self {
        let mut registry = Self {
            options,
            by_oid: HashMap::new(),
            by_name: HashMap::new(),
            mappings: MappingCollection::new(),
            resolvers: Vec::new(),
            cache: Mutex::new(HashMap::new()),
        };

        registry.register_builtin_types();
        registry
            .register_default_mappings()
            .expect("default mappings are never nullable");

        registry.install_resolver(Box::new(ArrayResolver));
        registry.install_resolver(Box::new(RangeResolver));
        registry.install_resolver(Box::new(CompositeResolver));
        registry.install_resolver(Box::new(EnumResolver));

        registry
    }

    pub fn options(&self) -> &CodecOptions {
        &self.options
    }

    /// Register a wire type, indexed by oid and by name.
    ///
    /// Composite, enum, and range types discovered out of band are
    /// registered through this before they can resolve.
    pub fn register_type(&mut self, wire: WireType) {
        self.cache.get_mut().unwrap().clear();
        self.by_name.insert(wire.name().clone(), wire.clone());
        self.by_oid.insert(wire.oid(), wire);
    }

    /// Register a static mapping rule. See [`MappingCollection::add`].
    pub fn add_mapping(
        &mut self,
        host: HostKind,
        wire_name: impl Into<ByteStr>,
        factory: ConverterFactory,
    ) -> Result<(), CodecError> {
        self.cache.get_mut().unwrap().clear();
        self.mappings.add(host, wire_name, factory)?;
        Ok(())
    }

    /// Install a dynamic resolver; resolvers are consulted in installation
    /// order after static rules.
    pub fn install_resolver(&mut self, resolver: Box<dyn TypeResolver>) {
        self.cache.get_mut().unwrap().clear();
        self.resolvers.push(resolver);
    }

    pub fn wire_type_by_oid(&self, oid: Oid) -> Result<&WireType, CodecError> {
        self.by_oid.get(&oid).ok_or(CodecError::UnknownOid { oid })
    }

    pub fn wire_type_by_name(&self, name: &str) -> Result<&WireType, CodecError> {
        self.by_name
            .get(name)
            .ok_or_else(|| CodecError::UnknownTypeName { name: ByteStr::copy_from_str(name) })
    }

    /// Resolve a (host kind, wire type) pair to a [`TypeInfo`].
    ///
    /// Nullable wrappers are unwrapped first. Static rules are consulted in
    /// registration order, then the resolver chain in installation order;
    /// the result is cached so repeated resolution is O(1) and
    /// reference-stable.
    pub fn resolve(
        &self,
        host: &HostKind,
        wire: &WireType,
    ) -> Result<Arc<TypeInfo>, CodecError> {
        let host = host.strip_nullable();
        let key = (host.clone(), wire.oid());

        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        let info = match self.mappings.find(host, wire, self)? {
            Some(info) => info,
            None => self
                .resolvers
                .iter()
                .find_map(|resolver| resolver.mappings(host, wire, self))
                .map(|collection| collection.find(host, wire, self))
                .transpose()?
                .flatten()
                .ok_or_else(|| CodecError::NoMapping {
                    host: host.clone(),
                    wire: wire.name().clone(),
                })?,
        };

        let info = Arc::new(info);
        self.cache.lock().unwrap().insert(key, info.clone());
        Ok(info)
    }

    /// Resolve against a wire type identified by oid, as found in row and
    /// parameter descriptions.
    pub fn resolve_oid(&self, host: &HostKind, oid: Oid) -> Result<Arc<TypeInfo>, CodecError> {
        let wire = self.wire_type_by_oid(oid)?.clone();
        self.resolve(host, &wire)
    }

    /// The wire type a host kind binds to when the statement does not
    /// declare one.
    pub fn default_wire_type(&self, host: &HostKind) -> Result<WireType, CodecError> {
        let host = host.strip_nullable();
        match host {
            HostKind::Unknown => Err(CodecError::NoDefaultType { host: host.clone() }),
            HostKind::Array(element) => {
                let element = self.default_wire_type(element)?;
                self.by_oid
                    .values()
                    .find(|t| {
                        matches!(t.kind(), WireKind::Array { element: e } if e.oid() == element.oid())
                    })
                    .cloned()
                    .ok_or(CodecError::NoDefaultType { host: host.clone() })
            },
            HostKind::Range(element) => {
                let element = self.default_wire_type(element)?;
                self.by_oid
                    .values()
                    .find(|t| {
                        matches!(t.kind(), WireKind::Range { element: e } if e.oid() == element.oid())
                    })
                    .cloned()
                    .ok_or(CodecError::NoDefaultType { host: host.clone() })
            },
            HostKind::Composite(name) | HostKind::Enum(name) => {
                self.wire_type_by_name(name).cloned()
            },
            host => {
                let name = self
                    .mappings
                    .default_wire_name(host)
                    .ok_or(CodecError::NoDefaultType { host: host.clone() })?;
                self.by_name
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CodecError::UnknownTypeName { name: name.clone() })
            },
        }
    }

    fn register_builtin_types(&mut self) {
        let scalars = [
            ("bool", oids::BOOL, "_bool", oids::BOOL_ARRAY),
            ("bytea", oids::BYTEA, "_bytea", oids::BYTEA_ARRAY),
            ("int8", oids::INT8, "_int8", oids::INT8_ARRAY),
            ("int2", oids::INT2, "_int2", oids::INT2_ARRAY),
            ("int4", oids::INT4, "_int4", oids::INT4_ARRAY),
            ("text", oids::TEXT, "_text", oids::TEXT_ARRAY),
            ("float4", oids::FLOAT4, "_float4", oids::FLOAT4_ARRAY),
            ("float8", oids::FLOAT8, "_float8", oids::FLOAT8_ARRAY),
            ("varchar", oids::VARCHAR, "_varchar", oids::VARCHAR_ARRAY),
            ("timestamp", oids::TIMESTAMP, "_timestamp", oids::TIMESTAMP_ARRAY),
            ("timestamptz", oids::TIMESTAMPTZ, "_timestamptz", oids::TIMESTAMPTZ_ARRAY),
        ];
        for (name, oid, array_name, array_oid) in scalars {
            let scalar = WireType::scalar(name, oid);
            self.register_type(scalar.clone());
            self.register_type(WireType::array(array_name, array_oid, scalar));
        }

        #[cfg(feature = "json")]
        {
            let jsonb = WireType::scalar("jsonb", oids::JSONB);
            self.register_type(jsonb.clone());
            self.register_type(WireType::array("_jsonb", oids::JSONB_ARRAY, jsonb));
        }
    }

    fn register_default_mappings(&mut self) -> Result<(), CodecError> {
        let m = &mut self.mappings;
        m.add(HostKind::Bool, "bool", scalar_factory!(BoolCodec))?;
        m.add(HostKind::Int2, "int2", scalar_factory!(Int2Codec))?;
        m.add(HostKind::Int4, "int4", scalar_factory!(Int4Codec))?;
        m.add(HostKind::Int8, "int8", scalar_factory!(Int8Codec))?;
        m.add(HostKind::Float4, "float4", scalar_factory!(Float4Codec))?;
        m.add(HostKind::Float8, "float8", scalar_factory!(Float8Codec))?;
        m.add(HostKind::Text, "text", scalar_factory!(TextCodec))?;
        m.add(HostKind::Text, "varchar", scalar_factory!(TextCodec))?;
        m.add(HostKind::Bytea, "bytea", scalar_factory!(ByteaCodec))?;

        let timestamp_factory: ConverterFactory = Arc::new(|_: &WireType, registry: &TypeRegistry| {
            Ok(Arc::new(TimestampCodec {
                disable_infinity_conversions: registry.options().disable_infinity_conversions,
            }) as Arc<dyn Converter>)
        });
        // rule order decides the default binding for Timestamp parameters
        match self.options.legacy_timestamp_behavior {
            true => {
                m.add(HostKind::Timestamp, "timestamp", timestamp_factory.clone())?;
                m.add(HostKind::Timestamp, "timestamptz", timestamp_factory)?;
            },
            false => {
                m.add(HostKind::Timestamp, "timestamptz", timestamp_factory.clone())?;
                m.add(HostKind::Timestamp, "timestamp", timestamp_factory)?;
            },
        }

        #[cfg(feature = "json")]
        m.add(HostKind::Json, "jsonb", scalar_factory!(JsonbCodec))?;

        Ok(())
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new(CodecOptions::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{ArrayValue, CompositeValue, EnumValue, RangeBound, RangeValue, Timestamp};

    fn round_trip(registry: &TypeRegistry, host: &HostKind, wire_name: &str, value: Value) {
        let wire = registry.wire_type_by_name(wire_name).unwrap().clone();
        let info = registry.resolve(host, &wire).unwrap();

        let encoded = info.encode(&value).unwrap().expect("non-null value");
        let decoded = info.converter().decode(encoded).unwrap();
        assert_eq!(decoded, value, "round trip through {wire_name}");
    }

    #[test]
    fn scalar_round_trips() {
        let registry = TypeRegistry::default();
        round_trip(&registry, &HostKind::Bool, "bool", Value::Bool(true));
        round_trip(&registry, &HostKind::Int2, "int2", Value::Int2(-12));
        round_trip(&registry, &HostKind::Int4, "int4", Value::Int4(i32::MIN));
        round_trip(&registry, &HostKind::Int8, "int8", Value::Int8(i64::MAX));
        round_trip(&registry, &HostKind::Float8, "float8", Value::Float8(2.5));
        round_trip(&registry, &HostKind::Text, "text", Value::Text("héllo".into()));
        round_trip(&registry, &HostKind::Text, "varchar", Value::Text(String::new()));
        round_trip(&registry, &HostKind::Bytea, "bytea", Value::Bytea(vec![0, 1, 255]));
        round_trip(
            &registry,
            &HostKind::Timestamp,
            "timestamp",
            Value::Timestamp(Timestamp::from_micros(772_761_600_000_000)),
        );
    }

    #[test]
    fn array_round_trips_including_boundaries() {
        let registry = TypeRegistry::default();
        let host = HostKind::Array(Box::new(HostKind::Int4));

        round_trip(
            &registry,
            &host,
            "_int4",
            Value::Array(ArrayValue::new(HostKind::Int4, vec![])),
        );
        round_trip(
            &registry,
            &host,
            "_int4",
            Value::Array(ArrayValue::new(
                HostKind::Int4,
                vec![Value::Int4(1), Value::Null, Value::Int4(-3)],
            )),
        );

        let text_host = HostKind::Array(Box::new(HostKind::Text));
        round_trip(
            &registry,
            &text_host,
            "_text",
            Value::Array(ArrayValue::new(
                HostKind::Text,
                vec![Value::Text("a".into()), Value::Text(String::new())],
            )),
        );
    }

    #[test]
    fn composite_round_trips_including_zero_fields() {
        let mut registry = TypeRegistry::default();
        let int4 = registry.wire_type_by_name("int4").unwrap().clone();
        let text = registry.wire_type_by_name("text").unwrap().clone();
        registry.register_type(WireType::composite(
            "inventory_item",
            16_384,
            vec![(ByteStr::from_static("id"), int4), (ByteStr::from_static("label"), text)],
        ));
        registry.register_type(WireType::composite("unit", 16_385, vec![]));

        let host = HostKind::Composite(ByteStr::from_static("inventory_item"));
        round_trip(
            &registry,
            &host,
            "inventory_item",
            Value::Composite(CompositeValue::new(
                "inventory_item",
                vec![Value::Int4(7), Value::Text("bolt".into())],
            )),
        );
        round_trip(
            &registry,
            &host,
            "inventory_item",
            Value::Composite(CompositeValue::new(
                "inventory_item",
                vec![Value::Null, Value::Null],
            )),
        );

        let unit_host = HostKind::Composite(ByteStr::from_static("unit"));
        round_trip(
            &registry,
            &unit_host,
            "unit",
            Value::Composite(CompositeValue::new("unit", vec![])),
        );
    }

    #[test]
    fn range_round_trips() {
        let mut registry = TypeRegistry::default();
        let int4 = registry.wire_type_by_name("int4").unwrap().clone();
        registry.register_type(WireType::range("int4range", 3904, int4));

        let host = HostKind::Range(Box::new(HostKind::Int4));
        round_trip(
            &registry,
            &host,
            "int4range",
            RangeValue::new(
                HostKind::Int4,
                RangeBound::Inclusive(Value::Int4(1)),
                RangeBound::Exclusive(Value::Int4(10)),
            )
            .into(),
        );
        round_trip(
            &registry,
            &host,
            "int4range",
            RangeValue::new(HostKind::Int4, RangeBound::Unbounded, RangeBound::Inclusive(Value::Int4(0)))
                .into(),
        );
        round_trip(&registry, &host, "int4range", RangeValue::empty(HostKind::Int4).into());
    }

    #[test]
    fn enum_round_trips_and_rejects_unknown_labels() {
        let mut registry = TypeRegistry::default();
        registry.register_type(WireType::enumeration(
            "mood",
            16_400,
            vec![
                ByteStr::from_static("sad"),
                ByteStr::from_static("ok"),
                ByteStr::from_static("happy"),
            ],
        ));

        let host = HostKind::Enum(ByteStr::from_static("mood"));
        round_trip(&registry, &host, "mood", Value::Enum(EnumValue::new("mood", "ok")));

        let wire = registry.wire_type_by_name("mood").unwrap().clone();
        let info = registry.resolve(&host, &wire).unwrap();
        let err = info.encode(&Value::Enum(EnumValue::new("mood", "angry"))).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn resolution_is_cached_and_reference_stable() {
        let registry = TypeRegistry::default();
        let wire = registry.wire_type_by_name("int4").unwrap().clone();

        let first = registry.resolve(&HostKind::Int4, &wire).unwrap();
        let second = registry.resolve(&HostKind::Int4, &wire).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // distinct host kinds resolve to distinct entries
        let late_bound = registry.resolve(&HostKind::Unknown, &wire).unwrap();
        assert_eq!(late_bound.host(), &HostKind::Int4);
    }

    #[test]
    fn nullable_wrapper_registration_is_rejected() {
        let mut registry = TypeRegistry::default();
        let err = registry
            .add_mapping(
                HostKind::Nullable(Box::new(HostKind::Int4)),
                "int4",
                scalar_factory!(Int4Codec),
            )
            .unwrap_err();
        assert!(matches!(err, CodecError::Config(_)));

        // resolution through a nullable wrapper works, sharing the
        // underlying kind's cache entry
        let wire = registry.wire_type_by_name("int4").unwrap().clone();
        let plain = registry.resolve(&HostKind::Int4, &wire).unwrap();
        let wrapped = registry
            .resolve(&HostKind::Nullable(Box::new(HostKind::Int4)), &wire)
            .unwrap();
        assert!(Arc::ptr_eq(&plain, &wrapped));
    }

    #[test]
    fn unmatched_pairs_fail_with_no_mapping() {
        let registry = TypeRegistry::default();
        let wire = registry.wire_type_by_name("int4").unwrap().clone();
        let err = registry.resolve(&HostKind::Text, &wire).unwrap_err();
        assert!(matches!(err, CodecError::NoMapping { .. }));
    }

    #[test]
    fn resolver_order_is_installation_order() {
        struct Veto;
        impl TypeResolver for Veto {
            fn mappings(
                &self,
                _: &HostKind,
                wire: &WireType,
                _: &TypeRegistry,
            ) -> Option<MappingCollection> {
                // claims every array type but produces no rules, which
                // must fail resolution rather than fall through
                matches!(wire.kind(), WireKind::Array { .. }).then(MappingCollection::new)
            }
        }

        let registry = TypeRegistry::default();
        let wire = registry.wire_type_by_name("_int4").unwrap().clone();
        let host = HostKind::Array(Box::new(HostKind::Int4));
        assert!(registry.resolve(&host, &wire).is_ok());

        let mut vetoed = TypeRegistry::new(CodecOptions::default());
        vetoed.resolvers.insert(0, Box::new(Veto));
        vetoed.cache.get_mut().unwrap().clear();
        let err = vetoed.resolve(&host, &wire).unwrap_err();
        assert!(matches!(err, CodecError::NoMapping { .. }));
    }

    #[test]
    fn default_wire_type_follows_rule_order_and_options() {
        let registry = TypeRegistry::default();
        assert_eq!(registry.default_wire_type(&HostKind::Text).unwrap().oid(), oids::TEXT);
        assert_eq!(
            registry.default_wire_type(&HostKind::Timestamp).unwrap().oid(),
            oids::TIMESTAMPTZ,
        );
        let array = HostKind::Array(Box::new(HostKind::Int8));
        assert_eq!(registry.default_wire_type(&array).unwrap().oid(), oids::INT8_ARRAY);

        let legacy = TypeRegistry::new(CodecOptions {
            legacy_timestamp_behavior: true,
            ..CodecOptions::default()
        });
        assert_eq!(
            legacy.default_wire_type(&HostKind::Timestamp).unwrap().oid(),
            oids::TIMESTAMP,
        );
    }

    #[test]
    fn infinity_conversions_can_be_disabled() {
        let registry = TypeRegistry::new(CodecOptions {
            disable_infinity_conversions: true,
            ..CodecOptions::default()
        });
        let wire = registry.wire_type_by_name("timestamp").unwrap().clone();
        let info = registry.resolve(&HostKind::Timestamp, &wire).unwrap();

        let err = info.encode(&Value::Timestamp(Timestamp::POS_INFINITY)).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));

        let lenient = TypeRegistry::default();
        let info = lenient.resolve(&HostKind::Timestamp, &wire).unwrap();
        assert!(info.encode(&Value::Timestamp(Timestamp::NEG_INFINITY)).is_ok());
    }
}
