//! Session payload vocabulary
//!
//! The frame codec carries opaque payloads. Inside a local channel the first
//! payload byte is a packet code and the rest are big-endian fields:
//!
//! | Code | Packet        | Fields                                                        |
//! |------|---------------|---------------------------------------------------------------|
//! | 1    | `Request`     | rule, filename, requester, requested (u16-prefixed strings), block_size u32, resume flag u8 + run id i64 |
//! | 2    | `Valid`       | run_id i64, rank i32                                          |
//! | 3    | `Data`        | rank i32, block (u32-prefixed)                                |
//! | 4    | `EndTransfer` | block_count i32                                               |
//! | 5    | `EndRequest`  | run_id i64                                                    |
//! | 6    | `Error`       | info (u32-prefixed string)                                    |
//! | 7    | `KeepAlive`   |                                                               |
//! | 8    | `Shutdown`    |                                                               |
//! | 9    | `Authent`     | host_id, key (u16-prefixed strings)                           |
//! | 10   | `AuthentValid`|                                                               |
//!
//! A channel opened by a peer starts with `Authent`. The `Request` follows
//! once the receiver answers `AuthentValid`, which also tells the opener the
//! receiver's channel id.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::run::TransferRequest;

/// Errors raised while decoding a session payload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionCodecError {
    #[error("empty payload")]
    Empty,
    #[error("unknown packet code {0}")]
    UnknownCode(u8),
    #[error("payload truncated")]
    Truncated,
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),
    #[error("string field too long ({0} bytes)")]
    StringTooLong(usize),
}

const CODE_REQUEST: u8 = 1;
const CODE_VALID: u8 = 2;
const CODE_DATA: u8 = 3;
const CODE_END_TRANSFER: u8 = 4;
const CODE_END_REQUEST: u8 = 5;
const CODE_ERROR: u8 = 6;
const CODE_KEEP_ALIVE: u8 = 7;
const CODE_SHUTDOWN: u8 = 8;
const CODE_AUTHENT: u8 = 9;
const CODE_AUTHENT_VALID: u8 = 10;

/// A packet exchanged inside one local channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalPacket {
    /// Identify the opening host; must precede the `Request`
    Authent { host_id: String, key: String },
    /// The receiver accepted the `Authent`
    AuthentValid,
    /// Open a transfer, or resume one when `resume_id` is set
    Request {
        request: TransferRequest,
        block_size: u32,
        resume_id: Option<i64>,
    },
    /// Receiver accepted the request; the sender starts at block `rank`
    Valid { run_id: i64, rank: i32 },
    /// Block number `rank` (0-based) of the file
    Data { rank: i32, block: Bytes },
    /// Sender has no more blocks; `block_count` is the total sent
    EndTransfer { block_count: i32 },
    /// Receiver finished the run, including post tasks
    EndRequest { run_id: i64 },
    /// The peer aborted the channel
    Error { info: String },
    /// Connection liveness check
    KeepAlive,
    /// The peer is shutting down; runs on this connection will be interrupted
    Shutdown,
}

impl LocalPacket {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authent { .. } => "Authent",
            Self::AuthentValid => "AuthentValid",
            Self::Request { .. } => "Request",
            Self::Valid { .. } => "Valid",
            Self::Data { .. } => "Data",
            Self::EndTransfer { .. } => "EndTransfer",
            Self::EndRequest { .. } => "EndRequest",
            Self::Error { .. } => "Error",
            Self::KeepAlive => "KeepAlive",
            Self::Shutdown => "Shutdown",
        }
    }

    /// Encode into a payload suitable for [`crate::framing::Packet`]
    pub fn encode(&self) -> Result<Bytes, SessionCodecError> {
        let mut buf = BytesMut::new();
        match self {
            Self::Authent { host_id, key } => {
                buf.put_u8(CODE_AUTHENT);
                put_short_str(&mut buf, host_id)?;
                put_short_str(&mut buf, key)?;
            }
            Self::Request {
                request,
                block_size,
                resume_id,
            } => {
                buf.put_u8(CODE_REQUEST);
                put_short_str(&mut buf, &request.rule)?;
                put_short_str(&mut buf, &request.filename)?;
                put_short_str(&mut buf, &request.requester)?;
                put_short_str(&mut buf, &request.requested)?;
                buf.put_u32(*block_size);
                match resume_id {
                    Some(id) => {
                        buf.put_u8(1);
                        buf.put_i64(*id);
                    }
                    None => {
                        buf.put_u8(0);
                        buf.put_i64(0);
                    }
                }
            }
            Self::Valid { run_id, rank } => {
                buf.put_u8(CODE_VALID);
                buf.put_i64(*run_id);
                buf.put_i32(*rank);
            }
            Self::Data { rank, block } => {
                buf.reserve(9 + block.len());
                buf.put_u8(CODE_DATA);
                buf.put_i32(*rank);
                put_long_bytes(&mut buf, block)?;
            }
            Self::EndTransfer { block_count } => {
                buf.put_u8(CODE_END_TRANSFER);
                buf.put_i32(*block_count);
            }
            Self::EndRequest { run_id } => {
                buf.put_u8(CODE_END_REQUEST);
                buf.put_i64(*run_id);
            }
            Self::Error { info } => {
                buf.put_u8(CODE_ERROR);
                put_long_bytes(&mut buf, info.as_bytes())?;
            }
            Self::KeepAlive => buf.put_u8(CODE_KEEP_ALIVE),
            Self::Shutdown => buf.put_u8(CODE_SHUTDOWN),
            Self::AuthentValid => buf.put_u8(CODE_AUTHENT_VALID),
        }
        Ok(buf.freeze())
    }

    /// Decode a payload
    pub fn decode(payload: &Bytes) -> Result<Self, SessionCodecError> {
        let mut buf = payload.clone();
        if !buf.has_remaining() {
            return Err(SessionCodecError::Empty);
        }

        let packet = match buf.get_u8() {
            CODE_REQUEST => {
                let rule = get_short_str(&mut buf)?;
                let filename = get_short_str(&mut buf)?;
                let requester = get_short_str(&mut buf)?;
                let requested = get_short_str(&mut buf)?;
                need(&buf, 4 + 1 + 8)?;
                let block_size = buf.get_u32();
                let has_resume = buf.get_u8() != 0;
                let id = buf.get_i64();
                Self::Request {
                    request: TransferRequest {
                        rule,
                        requester,
                        requested,
                        filename,
                    },
                    block_size,
                    resume_id: has_resume.then_some(id),
                }
            }
            CODE_VALID => {
                need(&buf, 12)?;
                Self::Valid {
                    run_id: buf.get_i64(),
                    rank: buf.get_i32(),
                }
            }
            CODE_DATA => {
                need(&buf, 4)?;
                let rank = buf.get_i32();
                let block = get_long_bytes(&mut buf)?;
                Self::Data { rank, block }
            }
            CODE_END_TRANSFER => {
                need(&buf, 4)?;
                Self::EndTransfer {
                    block_count: buf.get_i32(),
                }
            }
            CODE_END_REQUEST => {
                need(&buf, 8)?;
                Self::EndRequest {
                    run_id: buf.get_i64(),
                }
            }
            CODE_ERROR => {
                let raw = get_long_bytes(&mut buf)?;
                let info =
                    String::from_utf8(raw.to_vec()).map_err(|_| SessionCodecError::InvalidUtf8)?;
                Self::Error { info }
            }
            CODE_KEEP_ALIVE => Self::KeepAlive,
            CODE_SHUTDOWN => Self::Shutdown,
            CODE_AUTHENT => {
                let host_id = get_short_str(&mut buf)?;
                let key = get_short_str(&mut buf)?;
                Self::Authent { host_id, key }
            }
            CODE_AUTHENT_VALID => Self::AuthentValid,
            other => return Err(SessionCodecError::UnknownCode(other)),
        };

        if buf.has_remaining() {
            return Err(SessionCodecError::TrailingBytes(buf.remaining()));
        }
        Ok(packet)
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), SessionCodecError> {
    if buf.remaining() < n {
        Err(SessionCodecError::Truncated)
    } else {
        Ok(())
    }
}

fn put_short_str(buf: &mut BytesMut, s: &str) -> Result<(), SessionCodecError> {
    let len = u16::try_from(s.len()).map_err(|_| SessionCodecError::StringTooLong(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_short_str(buf: &mut Bytes) -> Result<String, SessionCodecError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| SessionCodecError::InvalidUtf8)
}

fn put_long_bytes(buf: &mut BytesMut, data: &[u8]) -> Result<(), SessionCodecError> {
    let len = u32::try_from(data.len()).map_err(|_| SessionCodecError::StringTooLong(data.len()))?;
    buf.put_u32(len);
    buf.put_slice(data);
    Ok(())
}

fn get_long_bytes(buf: &mut Bytes) -> Result<Bytes, SessionCodecError> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(resume_id: Option<i64>) -> LocalPacket {
        LocalPacket::Request {
            request: TransferRequest::new("send", "hosta", "hostb", "dir/report.csv"),
            block_size: 4096,
            resume_id,
        }
    }

    #[test]
    fn test_request_round_trip() {
        for resume in [None, Some(42)] {
            let packet = request(resume);
            let decoded = LocalPacket::decode(&packet.encode().unwrap()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_authent_layout() {
        let packet = LocalPacket::Authent {
            host_id: "ha".to_string(),
            key: "k".to_string(),
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.as_ref(), &[9, 0, 2, b'h', b'a', 0, 1, b'k']);
        assert_eq!(LocalPacket::decode(&bytes).unwrap(), packet);
        assert_eq!(
            LocalPacket::decode(&bytes.slice(..6)),
            Err(SessionCodecError::Truncated)
        );
    }

    #[test]
    fn test_data_layout() {
        let packet = LocalPacket::Data {
            rank: 3,
            block: Bytes::from_static(b"xy"),
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.as_ref(), &[3, 0, 0, 0, 3, 0, 0, 0, 2, b'x', b'y']);
        assert_eq!(LocalPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_error_info_utf8() {
        let packet = LocalPacket::Error {
            info: "échec: disque plein".to_string(),
        };
        let decoded = LocalPacket::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_unit_packets() {
        assert_eq!(LocalPacket::KeepAlive.encode().unwrap().as_ref(), &[7]);
        assert_eq!(
            LocalPacket::decode(&Bytes::from_static(&[8])).unwrap(),
            LocalPacket::Shutdown
        );
        assert_eq!(LocalPacket::AuthentValid.encode().unwrap().as_ref(), &[10]);
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(
            LocalPacket::decode(&Bytes::new()),
            Err(SessionCodecError::Empty)
        );
    }

    #[test]
    fn test_decode_unknown_code() {
        assert_eq!(
            LocalPacket::decode(&Bytes::from_static(&[99])),
            Err(SessionCodecError::UnknownCode(99))
        );
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = request(Some(1)).encode().unwrap();
        for cut in 1..bytes.len() {
            let partial = bytes.slice(..cut);
            assert_eq!(
                LocalPacket::decode(&partial),
                Err(SessionCodecError::Truncated),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut raw = BytesMut::from(&LocalPacket::KeepAlive.encode().unwrap()[..]);
        raw.put_u8(0);
        assert_eq!(
            LocalPacket::decode(&raw.freeze()),
            Err(SessionCodecError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let mut raw = BytesMut::new();
        raw.put_u8(CODE_ERROR);
        raw.put_u32(2);
        raw.put_slice(&[0xFF, 0xFE]);
        assert_eq!(
            LocalPacket::decode(&raw.freeze()),
            Err(SessionCodecError::InvalidUtf8)
        );
    }

    #[test]
    fn test_oversized_string_rejected() {
        let packet = LocalPacket::Request {
            request: TransferRequest::new("r".repeat(70_000), "a", "b", "f"),
            block_size: 1,
            resume_id: None,
        };
        assert_eq!(
            packet.encode(),
            Err(SessionCodecError::StringTooLong(70_000))
        );
    }
}
