//! Binary frame codec for the hub messaging protocol.
//!
//! Every exchange is a frame: a one-byte kind, a big-endian `u32` body
//! length, and the body. Strings are `u16`-length-prefixed UTF-8, payloads
//! `u32`-length-prefixed raw bytes. The same frames travel either directly
//! over the TLS stream or as binary WebSocket messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, ServiceError};
use crate::message::Message;
use crate::registry::DeviceRecord;

/// Upper bound on a frame body; anything larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const KIND_AUTH: u8 = 0x01;
const KIND_AUTH_OK: u8 = 0x02;
const KIND_AUTH_ERR: u8 = 0x03;
const KIND_SEND: u8 = 0x10;
const KIND_SEND_ACK: u8 = 0x11;
const KIND_CLOSE: u8 = 0x20;
const KIND_DEVICE_CREATE: u8 = 0x30;
const KIND_DEVICE_GET: u8 = 0x31;
const KIND_DEVICE_REMOVE: u8 = 0x32;
const KIND_DEVICE_OK: u8 = 0x33;
const KIND_DEVICE_ERR: u8 = 0x34;

/// Outcome of a send reported by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    UnknownDevice,
    Rejected(String),
}

/// Registry error codes carried by `DeviceErr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    NotFound(String),
    AlreadyExists(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Auth {
        key_name: String,
        signature: String,
        expiry: u64,
    },
    AuthOk,
    AuthErr {
        reason: String,
    },
    Send {
        device_id: String,
        message: Message,
    },
    SendAck {
        status: SendStatus,
    },
    Close,
    DeviceCreate {
        device_id: String,
    },
    DeviceGet {
        device_id: String,
    },
    DeviceRemove {
        device_id: String,
    },
    DeviceOk {
        record: DeviceRecord,
    },
    DeviceErr {
        error: DeviceError,
    },
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Self::Auth { .. } => KIND_AUTH,
            Self::AuthOk => KIND_AUTH_OK,
            Self::AuthErr { .. } => KIND_AUTH_ERR,
            Self::Send { .. } => KIND_SEND,
            Self::SendAck { .. } => KIND_SEND_ACK,
            Self::Close => KIND_CLOSE,
            Self::DeviceCreate { .. } => KIND_DEVICE_CREATE,
            Self::DeviceGet { .. } => KIND_DEVICE_GET,
            Self::DeviceRemove { .. } => KIND_DEVICE_REMOVE,
            Self::DeviceOk { .. } => KIND_DEVICE_OK,
            Self::DeviceErr { .. } => KIND_DEVICE_ERR,
        }
    }

    /// Encodes the frame, header included.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the encoded body would exceed [`MAX_FRAME_SIZE`]
    /// or a string field does not fit its length prefix.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(ServiceError::Protocol(format!(
                "frame body of {} bytes exceeds maximum {MAX_FRAME_SIZE}",
                body.len()
            )));
        }

        let mut out = BytesMut::with_capacity(5 + body.len());
        out.put_u8(self.kind());
        out.put_u32(body.len() as u32);
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    fn encode_body(&self, body: &mut BytesMut) -> Result<()> {
        match self {
            Self::Auth {
                key_name,
                signature,
                expiry,
            } => {
                put_string(body, key_name)?;
                put_string(body, signature)?;
                body.put_u64(*expiry);
            }
            Self::AuthOk | Self::Close => {}
            Self::AuthErr { reason } => put_string(body, reason)?,
            Self::Send { device_id, message } => {
                put_string(body, device_id)?;
                put_string(body, message.message_id.as_deref().unwrap_or(""))?;
                body.put_u16(u16::try_from(message.properties.len()).map_err(|_| {
                    ServiceError::Protocol("too many message properties".into())
                })?);
                for (k, v) in &message.properties {
                    put_string(body, k)?;
                    put_string(body, v)?;
                }
                body.put_u32(message.payload.len() as u32);
                body.extend_from_slice(&message.payload);
            }
            Self::SendAck { status } => match status {
                SendStatus::Accepted => body.put_u8(0),
                SendStatus::UnknownDevice => body.put_u8(1),
                SendStatus::Rejected(reason) => {
                    body.put_u8(2);
                    put_string(body, reason)?;
                }
            },
            Self::DeviceCreate { device_id }
            | Self::DeviceGet { device_id }
            | Self::DeviceRemove { device_id } => put_string(body, device_id)?,
            Self::DeviceOk { record } => {
                put_string(body, &record.device_id)?;
                body.put_u64(record.cloud_to_device_message_count);
            }
            Self::DeviceErr { error } => match error {
                DeviceError::NotFound(id) => {
                    body.put_u8(1);
                    put_string(body, id)?;
                }
                DeviceError::AlreadyExists(id) => {
                    body.put_u8(2);
                    put_string(body, id)?;
                }
            },
        }
        Ok(())
    }

    /// Decodes a frame from a kind byte and its body.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` on an unknown kind, truncated body, invalid
    /// UTF-8, or trailing garbage.
    pub fn decode(kind: u8, mut body: Bytes) -> Result<Frame> {
        let frame = match kind {
            KIND_AUTH => Frame::Auth {
                key_name: get_string(&mut body)?,
                signature: get_string(&mut body)?,
                expiry: get_u64(&mut body)?,
            },
            KIND_AUTH_OK => Frame::AuthOk,
            KIND_AUTH_ERR => Frame::AuthErr {
                reason: get_string(&mut body)?,
            },
            KIND_SEND => {
                let device_id = get_string(&mut body)?;
                let message_id = get_string(&mut body)?;
                let prop_count = get_u16(&mut body)?;
                let mut properties = Vec::with_capacity(usize::from(prop_count));
                for _ in 0..prop_count {
                    let k = get_string(&mut body)?;
                    let v = get_string(&mut body)?;
                    properties.push((k, v));
                }
                let payload_len = get_u32(&mut body)? as usize;
                if body.remaining() < payload_len {
                    return Err(truncated("send payload"));
                }
                let payload = body.split_to(payload_len);
                Frame::Send {
                    device_id,
                    message: Message {
                        payload,
                        properties,
                        message_id: (!message_id.is_empty()).then_some(message_id),
                    },
                }
            }
            KIND_SEND_ACK => {
                let status = match get_u8(&mut body)? {
                    0 => SendStatus::Accepted,
                    1 => SendStatus::UnknownDevice,
                    2 => SendStatus::Rejected(get_string(&mut body)?),
                    other => {
                        return Err(ServiceError::Protocol(format!(
                            "unknown send-ack status: {other}"
                        )))
                    }
                };
                Frame::SendAck { status }
            }
            KIND_CLOSE => Frame::Close,
            KIND_DEVICE_CREATE => Frame::DeviceCreate {
                device_id: get_string(&mut body)?,
            },
            KIND_DEVICE_GET => Frame::DeviceGet {
                device_id: get_string(&mut body)?,
            },
            KIND_DEVICE_REMOVE => Frame::DeviceRemove {
                device_id: get_string(&mut body)?,
            },
            KIND_DEVICE_OK => Frame::DeviceOk {
                record: DeviceRecord {
                    device_id: get_string(&mut body)?,
                    cloud_to_device_message_count: get_u64(&mut body)?,
                },
            },
            KIND_DEVICE_ERR => {
                let error = match get_u8(&mut body)? {
                    1 => DeviceError::NotFound(get_string(&mut body)?),
                    2 => DeviceError::AlreadyExists(get_string(&mut body)?),
                    other => {
                        return Err(ServiceError::Protocol(format!(
                            "unknown device-error code: {other}"
                        )))
                    }
                };
                Frame::DeviceErr { error }
            }
            other => {
                return Err(ServiceError::Protocol(format!(
                    "unknown frame kind: 0x{other:02x}"
                )))
            }
        };

        if body.has_remaining() {
            return Err(ServiceError::Protocol(format!(
                "{} trailing bytes after frame 0x{kind:02x}",
                body.remaining()
            )));
        }
        Ok(frame)
    }
}

/// Writes one frame to an async stream and flushes it.
pub async fn write_frame<S>(stream: &mut S, frame: &Frame) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let encoded = frame.encode()?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one frame from an async stream.
///
/// # Errors
///
/// Returns `Connection` if the peer closed the stream, `Protocol` on an
/// oversized or malformed frame.
pub async fn read_frame<S>(stream: &mut S) -> Result<Frame>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ServiceError::Connection("connection closed by peer".into())
        } else {
            ServiceError::Io(e.to_string())
        }
    })?;

    let kind = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ServiceError::Protocol(format!(
            "frame body of {len} bytes exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Frame::decode(kind, Bytes::from(body))
}

/// Parses a frame from a single buffer (header included); the WebSocket
/// path, where one binary message carries exactly one frame.
pub fn decode_buffer(buf: &[u8]) -> Result<Frame> {
    if buf.len() < 5 {
        return Err(truncated("frame header"));
    }
    let kind = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ServiceError::Protocol(format!(
            "frame body of {len} bytes exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    if buf.len() - 5 != len {
        return Err(ServiceError::Protocol(format!(
            "frame length mismatch: header says {len}, message carries {}",
            buf.len() - 5
        )));
    }
    Frame::decode(kind, Bytes::copy_from_slice(&buf[5..]))
}

fn put_string(body: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| ServiceError::Protocol(format!("string of {} bytes too long", s.len())))?;
    body.put_u16(len);
    body.extend_from_slice(s.as_bytes());
    Ok(())
}

fn get_string(body: &mut Bytes) -> Result<String> {
    let len = usize::from(get_u16(body)?);
    if body.remaining() < len {
        return Err(truncated("string"));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| ServiceError::Protocol("string is not valid UTF-8".into()))
}

fn get_u8(body: &mut Bytes) -> Result<u8> {
    if body.remaining() < 1 {
        return Err(truncated("u8"));
    }
    Ok(body.get_u8())
}

fn get_u16(body: &mut Bytes) -> Result<u16> {
    if body.remaining() < 2 {
        return Err(truncated("u16"));
    }
    Ok(body.get_u16())
}

fn get_u32(body: &mut Bytes) -> Result<u32> {
    if body.remaining() < 4 {
        return Err(truncated("u32"));
    }
    Ok(body.get_u32())
}

fn get_u64(body: &mut Bytes) -> Result<u64> {
    if body.remaining() < 8 {
        return Err(truncated("u64"));
    }
    Ok(body.get_u64())
}

fn truncated(what: &str) -> ServiceError {
    ServiceError::Protocol(format!("truncated frame: incomplete {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let encoded = frame.encode().unwrap();
        decode_buffer(&encoded).unwrap()
    }

    #[test]
    fn auth_round_trip() {
        let frame = Frame::Auth {
            key_name: "service".into(),
            signature: "c2ln".into(),
            expiry: 1_700_000_000,
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn send_round_trip_with_properties() {
        let frame = Frame::Send {
            device_id: "d1".into(),
            message: Message::new(&b"abcdefghijklmnopqrstuvwxyz1234567890"[..])
                .with_property("content-type", "text/plain")
                .with_message_id("m-7"),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn send_round_trip_empty_payload_no_id() {
        let frame = Frame::Send {
            device_id: "d1".into(),
            message: Message::new(Bytes::new()),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn ack_statuses_round_trip() {
        for status in [
            SendStatus::Accepted,
            SendStatus::UnknownDevice,
            SendStatus::Rejected("quota exceeded".into()),
        ] {
            let frame = Frame::SendAck { status };
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn registry_frames_round_trip() {
        let record = DeviceRecord {
            device_id: "d1".into(),
            cloud_to_device_message_count: 3,
        };
        for frame in [
            Frame::DeviceCreate {
                device_id: "d1".into(),
            },
            Frame::DeviceOk { record },
            Frame::DeviceErr {
                error: DeviceError::NotFound("d2".into()),
            },
        ] {
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = Frame::decode(0x7f, Bytes::new()).unwrap_err();
        assert!(matches!(err, ServiceError::Protocol(_)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let err = Frame::decode(KIND_AUTH_OK, Bytes::from_static(b"xx")).unwrap_err();
        assert!(matches!(err, ServiceError::Protocol(_)));
    }

    #[test]
    fn truncated_body_is_rejected() {
        // Auth frame claiming a 10-byte key name but carrying 2 bytes.
        let mut body = BytesMut::new();
        body.put_u16(10);
        body.extend_from_slice(b"ab");
        let err = Frame::decode(KIND_AUTH, body.freeze()).unwrap_err();
        assert!(matches!(err, ServiceError::Protocol(_)));
    }

    #[test]
    fn oversized_frame_is_rejected_on_encode() {
        let frame = Frame::Send {
            device_id: "d1".into(),
            message: Message::new(vec![0u8; MAX_FRAME_SIZE + 1]),
        };
        assert!(matches!(
            frame.encode().unwrap_err(),
            ServiceError::Protocol(_)
        ));
    }

    #[test]
    fn oversized_header_is_rejected_on_decode() {
        let mut buf = vec![KIND_AUTH_OK];
        buf.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        assert!(matches!(
            decode_buffer(&buf).unwrap_err(),
            ServiceError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn frame_io_over_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = Frame::Send {
            device_id: "d1".into(),
            message: Message::from("hello"),
        };
        write_frame(&mut a, &frame).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), frame);

        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ServiceError::Connection(_)));
    }
}
