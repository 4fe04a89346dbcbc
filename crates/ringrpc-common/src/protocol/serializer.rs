//! Pluggable body serializers, selected by declared type name.
//!
//! Primitives use fixed-width big-endian encodings. Strings are a 2-byte
//! length followed by UTF-8. Every type name without a dedicated serializer
//! falls back to JSON through [`ObjectSerializer`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::protocol::error::{ErrorKind, Result, RingRpcError};
use crate::protocol::value::Value;

/// Built-in type names understood by [`SerializerRegistry::default`].
pub mod type_names {
    pub const EMPTY: &str = "N/A";
    pub const BOOL: &str = "bool";
    pub const BYTE: &str = "byte";
    pub const CHAR: &str = "char";
    pub const SHORT: &str = "short";
    pub const INT: &str = "int";
    pub const LONG: &str = "long";
    pub const FLOAT: &str = "float";
    pub const DOUBLE: &str = "double";
    pub const STRING: &str = "string";
    pub const OBJECT: &str = "object";
}

/// Converts between a [`Value`] and frame body bytes.
pub trait Serializer: Send + Sync {
    /// The declared type name this serializer handles.
    fn type_name(&self) -> &str;

    /// Appends the encoded value to `out`.
    fn serialize(&self, value: &Value, out: &mut BytesMut) -> Result<()>;

    /// Decodes a whole body.
    fn deserialize(&self, body: &[u8]) -> Result<Value>;
}

fn malformed(type_name: &str, reason: &str) -> RingRpcError {
    RingRpcError::rpc(
        ErrorKind::SerializerError,
        format!("malformed {} body: {}", type_name, reason),
    )
}

fn fixed<const N: usize>(type_name: &str, body: &[u8]) -> Result<[u8; N]> {
    if body.len() != N {
        return Err(malformed(
            type_name,
            &format!("expected {} bytes, got {}", N, body.len()),
        ));
    }
    let mut buf = [0u8; N];
    buf.copy_from_slice(body);
    Ok(buf)
}

/// Serializer for methods without a parameter or return value.
pub struct EmptySerializer;

impl Serializer for EmptySerializer {
    fn type_name(&self) -> &str {
        type_names::EMPTY
    }

    fn serialize(&self, value: &Value, _out: &mut BytesMut) -> Result<()> {
        match value {
            Value::Empty => Ok(()),
            other => Err(other.mismatch(type_names::EMPTY)),
        }
    }

    fn deserialize(&self, body: &[u8]) -> Result<Value> {
        if !body.is_empty() {
            return Err(malformed(type_names::EMPTY, "unexpected body"));
        }
        Ok(Value::Empty)
    }
}

/// The primitive encodings with a dedicated fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Bool,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
}

impl Primitive {
    pub const ALL: [Primitive; 9] = [
        Primitive::Bool,
        Primitive::Byte,
        Primitive::Char,
        Primitive::Short,
        Primitive::Int,
        Primitive::Long,
        Primitive::Float,
        Primitive::Double,
        Primitive::String,
    ];

    pub fn type_name(&self) -> &'static str {
        match self {
            Primitive::Bool => type_names::BOOL,
            Primitive::Byte => type_names::BYTE,
            Primitive::Char => type_names::CHAR,
            Primitive::Short => type_names::SHORT,
            Primitive::Int => type_names::INT,
            Primitive::Long => type_names::LONG,
            Primitive::Float => type_names::FLOAT,
            Primitive::Double => type_names::DOUBLE,
            Primitive::String => type_names::STRING,
        }
    }
}

/// Fixed-width big-endian serializer for one [`Primitive`].
pub struct PrimitiveSerializer {
    primitive: Primitive,
}

impl PrimitiveSerializer {
    pub fn new(primitive: Primitive) -> Self {
        Self { primitive }
    }
}

impl Serializer for PrimitiveSerializer {
    fn type_name(&self) -> &str {
        self.primitive.type_name()
    }

    fn serialize(&self, value: &Value, out: &mut BytesMut) -> Result<()> {
        let name = self.primitive.type_name();
        match (self.primitive, value) {
            (Primitive::Bool, Value::Bool(v)) => out.put_u8(u8::from(*v)),
            (Primitive::Byte, Value::Byte(v)) => out.put_i8(*v),
            (Primitive::Char, Value::Char(c)) => {
                let mut units = [0u16; 2];
                match c.encode_utf16(&mut units) {
                    [unit] => out.put_u16(*unit),
                    _ => {
                        return Err(RingRpcError::rpc(
                            ErrorKind::SerializerError,
                            format!("char {:?} does not fit in one UTF-16 unit", c),
                        ))
                    }
                }
            }
            (Primitive::Short, Value::Short(v)) => out.put_i16(*v),
            (Primitive::Int, Value::Int(v)) => out.put_i32(*v),
            (Primitive::Long, Value::Long(v)) => out.put_i64(*v),
            (Primitive::Float, Value::Float(v)) => out.put_f32(*v),
            (Primitive::Double, Value::Double(v)) => out.put_f64(*v),
            (Primitive::String, Value::String(s)) => {
                let len = u16::try_from(s.len()).map_err(|_| {
                    RingRpcError::rpc(
                        ErrorKind::SerializerError,
                        format!("string of {} bytes exceeds {} bytes", s.len(), u16::MAX),
                    )
                })?;
                out.put_u16(len);
                out.put_slice(s.as_bytes());
            }
            (_, other) => return Err(other.mismatch(name)),
        }
        Ok(())
    }

    fn deserialize(&self, body: &[u8]) -> Result<Value> {
        let name = self.primitive.type_name();
        let value = match self.primitive {
            Primitive::Bool => Value::Bool(fixed::<1>(name, body)?[0] != 0),
            Primitive::Byte => Value::Byte(i8::from_be_bytes(fixed(name, body)?)),
            Primitive::Char => {
                let unit = u16::from_be_bytes(fixed(name, body)?);
                let c = char::from_u32(u32::from(unit))
                    .ok_or_else(|| malformed(name, "lone surrogate"))?;
                Value::Char(c)
            }
            Primitive::Short => Value::Short(i16::from_be_bytes(fixed(name, body)?)),
            Primitive::Int => Value::Int(i32::from_be_bytes(fixed(name, body)?)),
            Primitive::Long => Value::Long(i64::from_be_bytes(fixed(name, body)?)),
            Primitive::Float => Value::Float(f32::from_be_bytes(fixed(name, body)?)),
            Primitive::Double => Value::Double(f64::from_be_bytes(fixed(name, body)?)),
            Primitive::String => {
                if body.len() < 2 {
                    return Err(malformed(name, "missing length prefix"));
                }
                let len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                let bytes = &body[2..];
                if bytes.len() != len {
                    return Err(malformed(
                        name,
                        &format!("length prefix {} but {} bytes follow", len, bytes.len()),
                    ));
                }
                let s = std::str::from_utf8(bytes).map_err(|e| malformed(name, &e.to_string()))?;
                Value::String(s.to_string())
            }
        };
        Ok(value)
    }
}

/// JSON fallback for structured values and unknown type names.
pub struct ObjectSerializer {
    type_name: String,
}

impl ObjectSerializer {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }
}

impl Serializer for ObjectSerializer {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn serialize(&self, value: &Value, out: &mut BytesMut) -> Result<()> {
        serde_json::to_writer(out.writer(), &value.to_json())?;
        Ok(())
    }

    fn deserialize(&self, body: &[u8]) -> Result<Value> {
        Ok(Value::Object(serde_json::from_slice(body)?))
    }
}

/// Maps declared type names to serializers.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use ringrpc_common::protocol::{SerializerRegistry, Value};
///
/// let serializers = SerializerRegistry::default();
/// let string = serializers.resolve("string");
///
/// let mut body = BytesMut::new();
/// string.serialize(&Value::from("ping"), &mut body).unwrap();
/// assert_eq!(string.deserialize(&body).unwrap(), Value::from("ping"));
/// ```
pub struct SerializerRegistry {
    by_type: HashMap<String, Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    /// A registry with no serializers; every lookup falls back to JSON.
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
        }
    }

    /// Registers (or replaces) the serializer for its own type name.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) {
        self.by_type
            .insert(serializer.type_name().to_string(), serializer);
    }

    /// Returns the serializer for `type_name`, falling back to JSON.
    pub fn resolve(&self, type_name: &str) -> Arc<dyn Serializer> {
        match self.by_type.get(type_name) {
            Some(serializer) => serializer.clone(),
            None => Arc::new(ObjectSerializer::new(type_name)),
        }
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.by_type.contains_key(type_name)
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(EmptySerializer));
        for primitive in Primitive::ALL {
            registry.register(Arc::new(PrimitiveSerializer::new(primitive)));
        }
        registry.register(Arc::new(ObjectSerializer::new(type_names::OBJECT)));
        registry
    }
}
