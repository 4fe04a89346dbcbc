//! Frame header and envelope types.
//!
//! Every message on the wire is a fixed 16-byte header followed by the body:
//!
//! ```text
//! +-----------+-----------+----------+--------+------------+-------------+
//! | serviceId | requestId | methodId | typeId | bodyLength | body        |
//! | 4 bytes   | 8 bytes   | 1 byte   | 1 byte | 2 bytes    | bodyLength  |
//! +-----------+-----------+----------+--------+------------+-------------+
//! ```
//!
//! All integers are big-endian. The length field starts at byte 14.

use std::fmt;

use bytes::Bytes;

use crate::protocol::error::{Fault, RequestRef, Result};

pub type ServiceId = u32;
pub type RequestId = u64;
pub type MethodId = u8;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 16;

/// Offset of the 2-byte body length field inside the header
pub const LENGTH_FIELD_OFFSET: usize = 14;

/// Largest body the 16-bit length field can describe
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Default upper bound on a whole frame (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Request and method id used by METADATA probes
pub const METADATA_PROBE_ID: u8 = TypeId::Metadata as u8;

/// Request and method id used by HEARTBEAT probes
pub const HEARTBEAT_PROBE_ID: u8 = TypeId::Heartbeat as u8;

/// Selects how a frame body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    /// No body: void results or empty parameters
    Empty = 0,
    /// Serialized request parameter
    Object = 1,
    /// Serialized service metadata
    Metadata = 124,
    /// Serialized [`Fault`]
    Abnormal = 125,
    /// Serialized return value
    Normal = 126,
    /// Liveness probe, no body
    Heartbeat = 127,
}

impl TypeId {
    pub fn name(&self) -> &'static str {
        match self {
            TypeId::Empty => "N/A",
            TypeId::Object => "OBJECT",
            TypeId::Metadata => "METADATA",
            TypeId::Abnormal => "ABNORMAL",
            TypeId::Normal => "NORMAL",
            TypeId::Heartbeat => "HEARTBEAT",
        }
    }
}

impl TryFrom<u8> for TypeId {
    type Error = u8;

    fn try_from(raw: u8) -> std::result::Result<Self, u8> {
        match raw {
            0 => Ok(TypeId::Empty),
            1 => Ok(TypeId::Object),
            124 => Ok(TypeId::Metadata),
            125 => Ok(TypeId::Abnormal),
            126 => Ok(TypeId::Normal),
            127 => Ok(TypeId::Heartbeat),
            other => Err(other),
        }
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The routing part of a frame. The body length is derived from the body
/// when encoding, so it is not stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub service_id: ServiceId,
    pub request_id: RequestId,
    pub method_id: MethodId,
    pub type_id: TypeId,
}

impl Header {
    pub fn new(
        service_id: ServiceId,
        request_id: RequestId,
        method_id: MethodId,
        type_id: TypeId,
    ) -> Self {
        Self {
            service_id,
            request_id,
            method_id,
            type_id,
        }
    }

    /// Header of the METADATA probe a client sends on its first connection.
    pub fn metadata_probe(service_id: ServiceId) -> Self {
        Self::new(
            service_id,
            METADATA_PROBE_ID as RequestId,
            METADATA_PROBE_ID,
            TypeId::Metadata,
        )
    }

    /// Header of a HEARTBEAT probe.
    pub fn heartbeat(service_id: ServiceId) -> Self {
        Self::new(
            service_id,
            HEARTBEAT_PROBE_ID as RequestId,
            HEARTBEAT_PROBE_ID,
            TypeId::Heartbeat,
        )
    }

    /// Same routing fields, different type. Used to address a response.
    pub fn with_type(self, type_id: TypeId) -> Self {
        Self { type_id, ..self }
    }

    pub fn request_ref(&self) -> RequestRef {
        RequestRef {
            service_id: self.service_id,
            request_id: self.request_id,
            method_id: self.method_id,
        }
    }
}

/// A decoded frame: header plus body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: Header, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// A frame with no body.
    pub fn empty(header: Header) -> Self {
        Self {
            header,
            body: Bytes::new(),
        }
    }

    /// An `ABNORMAL` frame addressed to the request described by `header`.
    pub fn fault(header: Header, fault: &Fault) -> Result<Self> {
        Ok(Self::new(header.with_type(TypeId::Abnormal), fault.encode()?))
    }

    /// Length the body occupies on the wire.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }
}
