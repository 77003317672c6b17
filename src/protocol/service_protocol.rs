//! Frame format: `[u32 BE body length][body]`, where the body is a serialized
//!  [ServiceMessage] starting with its one-byte discriminator.

use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::service_messages::ServiceMessage;

pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_FRAME_BODY_LEN: usize = 16 * 1024 * 1024;


pub fn encode(message: &ServiceMessage, buf: &mut BytesMut) {
    let len_offset = buf.len();
    buf.put_u32(0);
    message.ser(buf);

    let body_len = (buf.len() - len_offset - FRAME_HEADER_LEN) as u32;
    buf[len_offset..len_offset + FRAME_HEADER_LEN].copy_from_slice(&body_len.to_be_bytes());
}

pub fn encode_to_bytes(message: &ServiceMessage) -> Bytes {
    let mut buf = BytesMut::new();
    encode(message, &mut buf);
    buf.freeze()
}

/// Tries to decode one frame from the start of `buf`. Returns `Ok(None)` if the buffer does not
///  yet hold a complete frame, or the message together with the number of bytes it occupied.
///  Buffering is the caller's business.
pub fn try_decode(buf: &[u8]) -> anyhow::Result<Option<(ServiceMessage, usize)>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let mut len_bytes = [0u8; FRAME_HEADER_LEN];
    len_bytes.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
    let body_len = u32::from_be_bytes(len_bytes) as usize;
    if body_len > MAX_FRAME_BODY_LEN {
        return Err(anyhow!("frame of {} bytes exceeds the maximum of {} bytes", body_len, MAX_FRAME_BODY_LEN));
    }

    let frame_len = FRAME_HEADER_LEN + body_len;
    if buf.len() < frame_len {
        return Ok(None);
    }

    let message = ServiceMessage::deser(&buf[FRAME_HEADER_LEN..frame_len])?;
    Ok(Some((message, frame_len)))
}
