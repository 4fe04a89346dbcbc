use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::frame::{MethodId, RequestId, ServiceId};

/// Error kinds carried on the wire inside `ABNORMAL` frames.
///
/// A [`Fault`] body encodes its kind by position, so the variant order is
/// part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed local usage, e.g. an unknown location scheme
    ClientError,
    /// The server is shutting down
    RpcServerStopping,
    /// The client is shutting down
    RpcClientStopping,
    /// A handler failed while executing
    ServerError,
    /// A value could not be serialized or deserialized on the server
    SerializerError,
    /// The frame carried an unrecognized type id
    NotSupportType,
    /// The dispatch queue is overloaded; retry elsewhere
    ServiceBusy,
    /// A value could not be serialized or deserialized on the client
    ClientSerializerError,
    /// The server has no registration for the requested service or method
    NotExistServiceId,
}

impl ErrorKind {
    /// Returns the canonical name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClientError => "ClientError",
            ErrorKind::RpcServerStopping => "RpcServerStopping",
            ErrorKind::RpcClientStopping => "RpcClientStopping",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::SerializerError => "SerializerError",
            ErrorKind::NotSupportType => "NotSupportType",
            ErrorKind::ServiceBusy => "ServiceBusy",
            ErrorKind::ClientSerializerError => "ClientSerializerError",
            ErrorKind::NotExistServiceId => "NotExistServiceId",
        }
    }

    /// Whether a call failing with this kind should go back to the retry loop
    /// instead of being surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::ServiceBusy)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The body of an `ABNORMAL` frame: an error kind plus a human-readable message.
///
/// # Example
///
/// ```
/// use ringrpc_common::protocol::{ErrorKind, Fault};
///
/// let fault = Fault::new(ErrorKind::ServiceBusy, "queue full");
/// let bytes = fault.encode().unwrap();
/// assert_eq!(Fault::decode(&bytes).unwrap(), fault);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: ErrorKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Encodes the fault with postcard.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decodes a fault previously produced by [`Fault::encode`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(data)?)
    }
}

/// Identifies the request a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestRef {
    pub service_id: ServiceId,
    pub request_id: RequestId,
    pub method_id: MethodId,
}

impl fmt::Display for RequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service {} method {} request {}",
            self.service_id, self.method_id, self.request_id
        )
    }
}

fn describe_request(request: &Option<RequestRef>) -> String {
    match request {
        Some(r) => format!(" ({})", r),
        None => String::new(),
    }
}

#[derive(Error, Debug)]
pub enum RingRpcError {
    #[error("{fault}{}", describe_request(.request))]
    Rpc {
        fault: Fault,
        request: Option<RequestRef>,
    },

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Retries exhausted after {attempts} attempts (last request {request_id})")]
    RetriesExhausted { attempts: u32, request_id: RequestId },

    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid location: {0}")]
    InvalidLocation(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RingRpcError {
    /// Builds an `Rpc` error with no originating request attached.
    pub fn rpc(kind: ErrorKind, message: impl Into<String>) -> Self {
        RingRpcError::Rpc {
            fault: Fault::new(kind, message),
            request: None,
        }
    }

    /// Maps this error onto the wire-level kind a peer or caller would see.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RingRpcError::Rpc { fault, .. } => fault.kind,
            RingRpcError::FrameTooLarge { .. }
            | RingRpcError::Serialization(_)
            | RingRpcError::JsonSerialization(_) => ErrorKind::SerializerError,
            RingRpcError::Timeout(_)
            | RingRpcError::RetriesExhausted { .. }
            | RingRpcError::Connection(_)
            | RingRpcError::InvalidLocation(_)
            | RingRpcError::Registry(_)
            | RingRpcError::Io(_) => ErrorKind::ClientError,
        }
    }

    /// Returns the originating request, if known.
    pub fn request(&self) -> Option<RequestRef> {
        match self {
            RingRpcError::Rpc { request, .. } => *request,
            _ => None,
        }
    }

    /// Attaches the originating request, converting the error into `Rpc` form.
    pub fn with_request(self, request: RequestRef) -> Self {
        match self {
            RingRpcError::Rpc { fault, .. } => RingRpcError::Rpc {
                fault,
                request: Some(request),
            },
            other => RingRpcError::Rpc {
                fault: other.into_fault(),
                request: Some(request),
            },
        }
    }

    /// Converts the error into the fault written back to a peer.
    pub fn into_fault(self) -> Fault {
        match self {
            RingRpcError::Rpc { fault, .. } => fault,
            other => Fault::new(other.kind(), other.to_string()),
        }
    }
}

impl From<Fault> for RingRpcError {
    fn from(fault: Fault) -> Self {
        RingRpcError::Rpc {
            fault,
            request: None,
        }
    }
}

impl From<std::net::AddrParseError> for RingRpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RingRpcError::InvalidLocation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RingRpcError>;
