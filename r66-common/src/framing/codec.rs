//! Stateless frame encode/decode

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::FrameError;
use super::packet::Packet;
use super::{IDS_SIZE, LENGTH_FIELD_SIZE};

/// Try to decode one frame from the front of `buf`
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame; nothing
/// is consumed in that case and the caller should retry once more bytes
/// arrive. On success returns the packet and the number of bytes it occupied.
///
/// The result does not depend on how the byte stream was split into reads.
///
/// # Errors
///
/// Returns [`FrameError::InvalidLength`] if the length field is below 8 and
/// [`FrameError::FrameTooLarge`] if it exceeds `max_frame_length`. Both are
/// detected as soon as the length field itself is available.
pub fn decode(buf: &[u8], max_frame_length: u32) -> Result<Option<(Packet, usize)>, FrameError> {
    if buf.len() < LENGTH_FIELD_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if (length as usize) < IDS_SIZE {
        return Err(FrameError::InvalidLength(length));
    }
    if length > max_frame_length {
        return Err(FrameError::FrameTooLarge {
            length,
            max: max_frame_length,
        });
    }

    let total = LENGTH_FIELD_SIZE + length as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let mut body = &buf[LENGTH_FIELD_SIZE..total];
    let local_id = body.get_i32();
    let remote_id = body.get_i32();
    let payload = Bytes::copy_from_slice(body);

    Ok(Some((Packet::new(local_id, remote_id, payload), total)))
}

/// Decode one frame from a growable buffer, advancing past it on success
///
/// Same contract as [`decode`], but the payload is split off `buf` without
/// copying.
pub fn decode_from(buf: &mut BytesMut, max_frame_length: u32) -> Result<Option<Packet>, FrameError> {
    if buf.len() < LENGTH_FIELD_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if (length as usize) < IDS_SIZE {
        return Err(FrameError::InvalidLength(length));
    }
    if length > max_frame_length {
        return Err(FrameError::FrameTooLarge {
            length,
            max: max_frame_length,
        });
    }

    let total = LENGTH_FIELD_SIZE + length as usize;
    if buf.len() < total {
        // Reserve the remainder up front so the reader fills it in few reads
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    buf.advance(LENGTH_FIELD_SIZE);
    let local_id = buf.get_i32();
    let remote_id = buf.get_i32();
    let payload = buf.split_to(length as usize - IDS_SIZE).freeze();

    Ok(Some(Packet::new(local_id, remote_id, payload)))
}

/// Encode a packet into a fresh buffer
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the length field would overflow.
pub fn encode(packet: &Packet) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_SIZE + packet.frame_length());
    encode_into(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Append the encoding of a packet to `buf`
pub fn encode_into(packet: &Packet, buf: &mut BytesMut) -> Result<(), FrameError> {
    let length = u32::try_from(packet.frame_length())
        .map_err(|_| FrameError::PayloadTooLarge(packet.payload().len()))?;

    buf.reserve(LENGTH_FIELD_SIZE + length as usize);
    buf.put_u32(length);
    buf.put_i32(packet.local_id());
    buf.put_i32(packet.remote_id());
    buf.put_slice(packet.payload());
    Ok(())
}
