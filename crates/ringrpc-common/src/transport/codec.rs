use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::error::{ErrorKind, Fault, RequestRef, Result, RingRpcError};
use crate::protocol::frame::{
    Frame, Header, TypeId, HEADER_LEN, LENGTH_FIELD_OFFSET, MAX_BODY_LEN, MAX_FRAME_SIZE,
};
use crate::protocol::serializer::Serializer;
use crate::protocol::value::Value;

/// Length-prefixed frame codec.
///
/// Encoding writes the header with a zero length placeholder, lets the caller
/// append the body, then backpatches the length field. Decoding is
/// incremental: it returns `Ok(None)` until a whole frame is buffered.
///
/// A frame that fails to decode is always consumed in full, so one bad frame
/// never desynchronizes the frames behind it.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use ringrpc_common::protocol::{Frame, Header, TypeId};
/// use ringrpc_common::transport::FrameCodec;
///
/// let mut codec = FrameCodec::new();
/// let frame = Frame::new(Header::new(42, 7, 3, TypeId::Object), &b"ping"[..]);
///
/// let mut buf = BytesMut::new();
/// codec.encode(&frame, &mut buf).unwrap();
/// assert_eq!(buf.len(), 16 + 4);
///
/// let decoded = codec.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(decoded, frame);
/// ```
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
    /// Bytes still to skip from an oversized frame
    discarding: usize,
}

impl FrameCodec {
    /// Creates a codec with the default 1 MiB frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Creates a codec that rejects frames larger than `max_frame_size` bytes
    /// (header included).
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.max(HEADER_LEN),
            discarding: 0,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encodes a complete frame into `dst`.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        self.encode_with(frame.header, dst, |buf| {
            buf.extend_from_slice(&frame.body);
            Ok(())
        })
    }

    /// Encodes a frame whose body is produced by `body`.
    ///
    /// # Arguments
    ///
    /// * `header` - Routing fields of the frame
    /// * `dst` - Buffer the frame is appended to
    /// * `body` - Writes the body directly after the header
    ///
    /// # Errors
    ///
    /// Returns the error of `body`, or `FrameTooLarge` when the body does not
    /// fit the 16-bit length field or the frame limit. On error `dst` is left
    /// exactly as it was.
    pub fn encode_with<F>(&self, header: Header, dst: &mut BytesMut, body: F) -> Result<()>
    where
        F: FnOnce(&mut BytesMut) -> Result<()>,
    {
        let start = dst.len();
        dst.reserve(HEADER_LEN);
        dst.put_u32(header.service_id);
        dst.put_u64(header.request_id);
        dst.put_u8(header.method_id);
        dst.put_u8(header.type_id as u8);
        dst.put_u16(0);

        if let Err(e) = body(dst) {
            dst.truncate(start);
            return Err(e);
        }

        let body_len = dst.len() - start - HEADER_LEN;
        let limit = MAX_BODY_LEN.min(self.max_frame_size - HEADER_LEN);
        if body_len > limit {
            dst.truncate(start);
            return Err(RingRpcError::FrameTooLarge {
                size: HEADER_LEN + body_len,
                max: HEADER_LEN + limit,
            });
        }

        let at = start + LENGTH_FIELD_OFFSET;
        dst[at..at + 2].copy_from_slice(&(body_len as u16).to_be_bytes());
        Ok(())
    }

    /// Encodes `value` with `serializer` as the body of a frame.
    ///
    /// An empty value is written as an `EMPTY` frame with no body, whatever
    /// type the header asked for.
    pub fn encode_value(
        &self,
        header: Header,
        serializer: &dyn Serializer,
        value: &Value,
        dst: &mut BytesMut,
    ) -> Result<()> {
        if value.is_empty() {
            return self.encode_with(header.with_type(TypeId::Empty), dst, |_| Ok(()));
        }
        self.encode_with(header, dst, |buf| serializer.serialize(value, buf))
    }

    /// Decodes the next frame from `src`.
    ///
    /// # Returns
    ///
    /// `Ok(Some(frame))` when a whole frame was buffered, `Ok(None)` when more
    /// bytes are needed.
    ///
    /// # Errors
    ///
    /// - `FrameTooLarge` when the frame exceeds the limit; its bytes are skipped
    /// - `Rpc` with kind `NotSupportType` for an unknown type id; the error
    ///   carries the originating request so it can be answered
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if self.discarding > 0 {
            let n = self.discarding.min(src.len());
            src.advance(n);
            self.discarding -= n;
            if self.discarding > 0 {
                return Ok(None);
            }
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let body_len = usize::from(u16::from_be_bytes([
            src[LENGTH_FIELD_OFFSET],
            src[LENGTH_FIELD_OFFSET + 1],
        ]));
        let frame_len = HEADER_LEN + body_len;

        if frame_len > self.max_frame_size {
            let n = frame_len.min(src.len());
            src.advance(n);
            self.discarding = frame_len - n;
            return Err(RingRpcError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(frame_len).freeze();
        let service_id = raw.get_u32();
        let request_id = raw.get_u64();
        let method_id = raw.get_u8();
        let type_raw = raw.get_u8();
        raw.advance(2);

        let type_id = TypeId::try_from(type_raw).map_err(|unknown| RingRpcError::Rpc {
            fault: Fault::new(
                ErrorKind::NotSupportType,
                format!("unsupported type id {}", unknown),
            ),
            request: Some(RequestRef {
                service_id,
                request_id,
                method_id,
            }),
        })?;

        Ok(Some(Frame {
            header: Header::new(service_id, request_id, method_id, type_id),
            body: raw,
        }))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
