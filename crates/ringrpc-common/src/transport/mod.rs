//! ringrpc Transport Layer
//!
//! This module turns frames into bytes and back, and moves those bytes over TCP.
//!
//! # Architecture
//!
//! - **Codec**: [`FrameCodec`] encodes frames with a backpatched length field
//!   and decodes them incrementally from a `BytesMut` buffer
//! - **Reader**: [`FrameReader`] pulls frames off any `AsyncRead`
//! - **Writer**: [`FrameWriter`] writes pre-encoded frames and flushes in batches
//!
//! # Frame Size Limits
//!
//! Bodies are limited to 65,535 bytes by the 16-bit length field, and whole
//! frames to a configurable limit (1 MiB by default). Oversized frames are
//! skipped byte-exactly so the stream stays aligned.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use bytes::BytesMut;
//! use ringrpc_common::protocol::{Frame, Header, TypeId};
//! use ringrpc_common::transport::{connect, FrameCodec, FrameReader, FrameWriter};
//!
//! # async fn demo() -> ringrpc_common::Result<()> {
//! let stream = connect("127.0.0.1:9000".parse()?, Duration::from_secs(5)).await?;
//! let (read, write) = stream.into_split();
//!
//! let mut buf = BytesMut::new();
//! FrameCodec::new().encode(&Frame::empty(Header::heartbeat(42)), &mut buf)?;
//!
//! let mut writer = FrameWriter::new(write);
//! writer.write(&buf.freeze()).await?;
//! writer.flush().await?;
//!
//! let mut reader = FrameReader::new(read, 1024 * 1024);
//! let echo = reader.next_frame().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod tcp;

pub use codec::FrameCodec;
pub use tcp::{connect, map_io_error, FrameReader, FrameWriter};
