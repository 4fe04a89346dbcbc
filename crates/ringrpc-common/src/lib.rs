//! ringrpc Common Types and Transport
//!
//! This crate provides the wire protocol, serializers, service registry and
//! framing transport shared by the ringrpc client and server.
//!
//! # Overview
//!
//! ringrpc multiplexes many method calls over a few persistent TCP
//! connections. Each call is one frame out and one frame back, correlated by
//! a 64-bit request id:
//!
//! - **Protocol Layer**: frame headers, type ids, error kinds, values and
//!   pluggable serializers
//! - **Transport Layer**: length-prefixed framing over tokio streams
//! - **Registry**: numeric service and method ids plus per-method dispatch
//!   metadata
//!
//! # Architecture
//!
//! The wire protocol:
//! - **Transport**: TCP with long-lived connections
//! - **Header**: 16 bytes, `serviceId:u32 | requestId:u64 | methodId:u8 | typeId:u8 | bodyLength:u16`
//! - **Body**: serialized per declared type (big-endian primitives, JSON objects,
//!   postcard for metadata and faults)
//! - **Max Frame Size**: 1 MiB
//!
//! # Components
//!
//! - [`protocol`] - Frames, errors, values, serializers, metadata
//! - [`transport`] - Frame codec, reader and writer
//! - [`registry`] - Service and method descriptors
//! - [`location`] - Location strings and the discovery collaborator
//! - [`ids`] - Request id generator
//! - [`hash`] - Service id and ring hashing
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use ringrpc_common::{Frame, Header, TypeId};
//! use ringrpc_common::transport::FrameCodec;
//!
//! let mut codec = FrameCodec::new();
//! let mut buf = BytesMut::new();
//! codec.encode(&Frame::new(Header::new(42, 7, 3, TypeId::Object), &b"ping"[..]), &mut buf).unwrap();
//!
//! let frame = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(frame.header.request_id, 7);
//! ```

pub mod hash;
pub mod ids;
pub mod location;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use protocol::*;
