//! kdb+ IPC client
//!
//! Speaks the q wire protocol over TCP: a NUL-terminated credentials string
//! carrying the requested capability, a one byte version reply, then framed
//! messages with an 8 byte header. Queries are sent as char vectors and the
//! reply is decoded far enough to recover atoms, strings and errors.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::command::EngineCommand;
use super::{Engine, EngineError, EngineReply};

/// Capability byte requested in the handshake
pub const REQUESTED_CAPABILITY: u8 = 3;

const HEADER_LEN: usize = 8;

/// Message types carried in byte 1 of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Async = 0,
    Sync = 1,
    Response = 2,
}

/// Build the handshake bytes for a `user:password` credential string
pub fn handshake_bytes(credentials: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(credentials.len() + 2);
    bytes.extend_from_slice(credentials.as_bytes());
    bytes.push(REQUESTED_CAPABILITY);
    bytes.push(0);
    bytes
}

/// Frame a query as a little-endian message holding a char vector
pub fn encode_query(text: &str, message_type: MessageType) -> Result<Vec<u8>, EngineError> {
    let body_len = text.len();
    let total = HEADER_LEN + 6 + body_len;
    let total_u32 = u32::try_from(total)
        .map_err(|_| EngineError::InvalidCommand(format!("query of {body_len} bytes is too large")))?;

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&[1, message_type as u8, 0, 0]);
    frame.extend_from_slice(&total_u32.to_le_bytes());
    // char vector: type 10, no attributes, length, bytes
    frame.push(10);
    frame.push(0);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.extend_from_slice(text.as_bytes());
    Ok(frame)
}

/// Parsed message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub little_endian: bool,
    pub message_type: u8,
    pub compressed: bool,
    /// Total message size including the header
    pub size: usize,
}

pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> Result<MessageHeader, EngineError> {
    let little_endian = match bytes[0] {
        0 => false,
        1 => true,
        other => return Err(EngineError::Protocol(format!("bad endianness marker {other}"))),
    };
    let raw = [bytes[4], bytes[5], bytes[6], bytes[7]];
    let size = if little_endian {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    } as usize;
    if size < HEADER_LEN {
        return Err(EngineError::Protocol(format!("message size {size} below header size")));
    }
    Ok(MessageHeader {
        little_endian,
        message_type: bytes[1],
        compressed: bytes[2] != 0,
        size,
    })
}

/// Decode a message body into a reply
///
/// A q error object becomes [`EngineError::Remote`].
pub fn decode_body(body: &[u8], little_endian: bool) -> Result<EngineReply, EngineError> {
    let mut cursor = BodyCursor {
        bytes: body,
        pos: 0,
        little_endian,
    };
    let type_code = cursor.take(1)?[0] as i8;

    let reply = match type_code {
        -128 => return Err(EngineError::Remote(cursor.take_cstr()?)),
        101 => EngineReply::Unit,
        -1 => EngineReply::Bool(cursor.take(1)?[0] != 0),
        -4 => EngineReply::Long(i64::from(cursor.take(1)?[0])),
        -5 => EngineReply::Long(i64::from(cursor.take_i16()?)),
        -6 => EngineReply::Long(i64::from(cursor.take_i32()?)),
        -7 => EngineReply::Long(cursor.take_i64()?),
        -8 => EngineReply::Float(f64::from(f32::from_bits(cursor.take_i32()? as u32))),
        -9 => EngineReply::Float(f64::from_bits(cursor.take_i64()? as u64)),
        -11 => EngineReply::Symbol(cursor.take_cstr()?),
        10 => {
            let _attributes = cursor.take(1)?;
            let len = cursor.take_i32()?;
            let len = usize::try_from(len)
                .map_err(|_| EngineError::Protocol(format!("negative vector length {len}")))?;
            EngineReply::Text(String::from_utf8_lossy(cursor.take(len)?).into_owned())
        },
        other => EngineReply::Other(other),
    };
    Ok(reply)
}

struct BodyCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> BodyCursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], EngineError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| EngineError::Protocol("truncated message body".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], EngineError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn take_i16(&mut self) -> Result<i16, EngineError> {
        let raw = self.take_array::<2>()?;
        Ok(if self.little_endian {
            i16::from_le_bytes(raw)
        } else {
            i16::from_be_bytes(raw)
        })
    }

    fn take_i32(&mut self) -> Result<i32, EngineError> {
        let raw = self.take_array::<4>()?;
        Ok(if self.little_endian {
            i32::from_le_bytes(raw)
        } else {
            i32::from_be_bytes(raw)
        })
    }

    fn take_i64(&mut self) -> Result<i64, EngineError> {
        let raw = self.take_array::<8>()?;
        Ok(if self.little_endian {
            i64::from_le_bytes(raw)
        } else {
            i64::from_be_bytes(raw)
        })
    }

    fn take_cstr(&mut self) -> Result<String, EngineError> {
        let rest = &self.bytes[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| EngineError::Protocol("unterminated string".to_string()))?;
        let text = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(text)
    }
}

/// Connection to a q process
#[derive(Debug)]
pub struct QIpcEngine {
    stream: Option<TcpStream>,
    version: u8,
    address: String,
}

impl QIpcEngine {
    /// Connect and perform the handshake
    ///
    /// A server that closes the socket instead of answering rejected the
    /// credentials.
    pub async fn connect(
        host: &str,
        port: u16,
        credentials: &str,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let address = format!("{host}:{port}");

        let handshake = async {
            let mut stream = TcpStream::connect(&address).await?;
            stream.set_nodelay(true)?;
            stream.write_all(&handshake_bytes(credentials)).await?;
            let mut version = [0u8; 1];
            let read = stream.read(&mut version).await?;
            Ok::<_, std::io::Error>((stream, read, version[0]))
        };

        let (stream, read, version) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| EngineError::ConnectionLost(format!("{address}: handshake timed out")))?
            .map_err(|e| EngineError::ConnectionLost(format!("{address}: {e}")))?;

        if read == 0 {
            return Err(EngineError::ConnectionLost(format!(
                "{address}: handshake rejected"
            )));
        }

        debug!(address = %address, protocol_version = version, "Engine connection established");

        Ok(Self {
            stream: Some(stream),
            version,
            address,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn round_trip(&mut self, text: &str, expects_reply: bool) -> Result<EngineReply, EngineError> {
        let message_type = if expects_reply {
            MessageType::Sync
        } else {
            MessageType::Async
        };
        let frame = encode_query(text, message_type)?;
        let stream = self.stream.as_mut().ok_or(EngineError::NotConnected)?;

        stream.write_all(&frame).await?;
        if !expects_reply {
            stream.flush().await?;
            return Ok(EngineReply::Unit);
        }

        loop {
            let mut header = [0u8; HEADER_LEN];
            stream.read_exact(&mut header).await?;
            // the frame boundary is lost along with a bad header
            let header = decode_header(&header)
                .map_err(|e| EngineError::ConnectionLost(format!("{}: {e}", self.address)))?;

            let mut body = vec![0u8; header.size - HEADER_LEN];
            stream.read_exact(&mut body).await?;

            if header.compressed {
                return Err(EngineError::Protocol("compressed replies are not supported".to_string()));
            }
            if header.message_type == MessageType::Response as u8 {
                return decode_body(&body, header.little_endian);
            }
            trace!(message_type = header.message_type, "Ignoring unsolicited engine message");
        }
    }
}

#[async_trait]
impl Engine for QIpcEngine {
    async fn execute(&mut self, command: &EngineCommand) -> Result<EngineReply, EngineError> {
        let text = command.render()?;
        trace!(command = command.name(), query = %text, "Sending engine command");

        match self.round_trip(&text, command.expects_reply()).await {
            Err(EngineError::Storage(io)) => {
                // the stream position is unknown after a failed read or write
                self.stream = None;
                Err(EngineError::ConnectionLost(format!("{}: {io}", self.address)))
            },
            Err(lost @ EngineError::ConnectionLost(_)) => {
                self.stream = None;
                Err(lost)
            },
            other => other,
        }
    }

    fn protocol_version(&self) -> u8 {
        self.version
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_handshake_bytes() {
        assert_eq!(handshake_bytes("u:p"), b"u:p\x03\x00".to_vec());
        assert_eq!(handshake_bytes(""), vec![3, 0]);
    }

    #[test]
    fn test_encode_query_frame() {
        let frame = encode_query("1b", MessageType::Sync).unwrap();
        assert_eq!(frame, vec![1, 1, 0, 0, 16, 0, 0, 0, 10, 0, 2, 0, 0, 0, b'1', b'b']);
        let header = decode_header(&frame[..8].try_into().unwrap()).unwrap();
        assert_eq!(header.size, frame.len());
        assert!(header.little_endian);
    }

    #[test]
    fn test_decode_atoms_both_endiannesses() {
        let mut le = vec![0xF9];
        le.extend_from_slice(&42i64.to_le_bytes());
        assert_eq!(decode_body(&le, true).unwrap(), EngineReply::Long(42));

        let mut be = vec![0xF9];
        be.extend_from_slice(&42i64.to_be_bytes());
        assert_eq!(decode_body(&be, false).unwrap(), EngineReply::Long(42));

        assert_eq!(decode_body(&[0xFF, 1], true).unwrap(), EngineReply::Bool(true));
        assert_eq!(decode_body(&[101, 0], true).unwrap(), EngineReply::Unit);
        assert_eq!(
            decode_body(b"\xF5trades\0", true).unwrap(),
            EngineReply::Symbol("trades".into())
        );
        assert_eq!(decode_body(&[98, 0], true).unwrap(), EngineReply::Other(98));
    }

    #[test]
    fn test_decode_error_object() {
        let err = decode_body(b"\x80type\0", true).unwrap_err();
        assert!(matches!(err, EngineError::Remote(msg) if msg == "type"));
        assert!(matches!(decode_body(&[0xF9, 1, 2], true), Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_round_trip_against_scripted_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 2];
            socket.read_exact(&mut handshake).await.unwrap();
            assert_eq!(handshake, [3, 0]);
            socket.write_all(&[3]).await.unwrap();

            let mut header = [0u8; 8];
            socket.read_exact(&mut header).await.unwrap();
            let header = decode_header(&header).unwrap();
            let mut body = vec![0u8; header.size - 8];
            socket.read_exact(&mut body).await.unwrap();
            assert_eq!(&body[6..], b"1b");

            socket.write_all(&[1, 2, 0, 0, 10, 0, 0, 0, 0xFF, 1]).await.unwrap();
        });

        let mut engine = QIpcEngine::connect("127.0.0.1", port, "", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(engine.protocol_version(), 3);
        assert_eq!(engine.execute(&EngineCommand::Ping).await.unwrap(), EngineReply::Bool(true));
        server.await.unwrap();

        // the server hung up, so the next command loses the connection
        let err = engine.execute(&EngineCommand::Ping).await.unwrap_err();
        assert!(err.is_connection_lost());
        assert!(!engine.is_connected());
    }

    #[tokio::test]
    async fn test_unreadable_reply_header_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 2];
            socket.read_exact(&mut handshake).await.unwrap();
            socket.write_all(&[3]).await.unwrap();

            let mut header = [0u8; 8];
            socket.read_exact(&mut header).await.unwrap();
            let header = decode_header(&header).unwrap();
            let mut body = vec![0u8; header.size - 8];
            socket.read_exact(&mut body).await.unwrap();

            // endianness marker 7 followed by bytes that look like a body
            socket.write_all(&[7, 2, 0, 0, 10, 0, 0, 0, 0xFF, 1]).await.unwrap();
            socket
        });

        let mut engine = QIpcEngine::connect("127.0.0.1", port, "", Duration::from_secs(5))
            .await
            .unwrap();
        let err = engine.execute(&EngineCommand::Ping).await.unwrap_err();
        assert!(err.is_connection_lost(), "{err:?}");
        assert!(!engine.is_connected());
        assert!(matches!(
            engine.execute(&EngineCommand::Ping).await,
            Err(EngineError::NotConnected)
        ));
        drop(server.await.unwrap());
    }
}
