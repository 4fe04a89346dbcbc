pub mod error;
pub mod frame;
pub mod metadata;
pub mod serializer;
pub mod value;


pub use error::{ErrorKind, Fault, RequestRef, Result, RingRpcError};
pub use frame::{
    Frame, Header, MethodId, RequestId, ServiceId, TypeId, HEADER_LEN, HEARTBEAT_PROBE_ID,
    MAX_BODY_LEN, MAX_FRAME_SIZE, METADATA_PROBE_ID,
};
pub use metadata::{MethodMetadata, ServiceMetadata};
pub use serializer::{
    type_names, EmptySerializer, ObjectSerializer, Primitive, PrimitiveSerializer, Serializer,
    SerializerRegistry,
};
pub use value::Value;
