//! Length-prefixed frames over TCP.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! TCP has no close codes: a clean EOF on a frame boundary reads as a normal
//! closure, a reset or an EOF inside a frame as an abnormal one.

use super::{CloseReason, Connection, Dialer, FrameSink, FrameStream, Inbound};
use crate::config::ProtocolConfig;
use crate::error::{Result, SyncwireError};
use async_trait::async_trait;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Read a length-prefixed frame.
///
/// Returns `None` on clean EOF (peer closed between frames).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(SyncwireError::transport(format!(
            "frame size {} exceeds maximum {}",
            len,
            ProtocolConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(SyncwireError::frame_too_large(payload.len()));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Dials `host:port` and speaks length-prefixed frames.
#[derive(Debug, Clone)]
pub struct TcpFrameDialer {
    addr: String,
}

impl TcpFrameDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Dialer for TcpFrameDialer {
    async fn dial(&self) -> Result<Connection> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| SyncwireError::transport(format!("connect {}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(framed_connection(stream))
    }

    fn peer(&self) -> String {
        self.addr.clone()
    }
}

/// Wrap an established TCP stream.
pub fn framed_connection(stream: TcpStream) -> Connection {
    let (reader, writer) = stream.into_split();
    Connection {
        sink: Box::new(TcpFrameSink { writer }),
        stream: Box::new(TcpFrameStream {
            reader: BufReader::new(reader),
        }),
    }
}

struct TcpFrameSink {
    writer: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        write_frame(&mut self.writer, &frame)
            .await
            .map_err(|e| match e {
                SyncwireError::Io { .. } => SyncwireError::transport(e),
                other => other,
            })
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

struct TcpFrameStream {
    reader: BufReader<OwnedReadHalf>,
}

#[async_trait]
impl FrameStream for TcpFrameStream {
    async fn next_frame(&mut self) -> Inbound {
        match read_frame(&mut self.reader).await {
            Ok(Some(frame)) => Inbound::Frame(frame),
            Ok(None) => Inbound::Closed(CloseReason::Normal),
            Err(SyncwireError::Io {
                source: Some(e), ..
            }) if is_abrupt_close(e.kind()) => Inbound::Closed(CloseReason::Abnormal),
            Err(e) => Inbound::Failed(e),
        }
    }
}

fn is_abrupt_close(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = br#"{"request_id":"abc"}"#;
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();
        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len = (ProtocolConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(SyncwireError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_io_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc");

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(SyncwireError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_connection_roundtrip_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await.unwrap().unwrap();
            write_frame(&mut stream, &frame).await.unwrap();
            // Dropping the stream closes cleanly between frames.
        });

        let dialer = TcpFrameDialer::new(addr.to_string());
        let mut connection = dialer.dial().await.unwrap();
        connection.sink.send_frame(b"echo me".to_vec()).await.unwrap();

        match connection.stream.next_frame().await {
            Inbound::Frame(frame) => assert_eq!(frame, b"echo me"),
            other => panic!("Expected frame, got: {:?}", other),
        }

        server.await.unwrap();
        assert!(matches!(
            connection.stream.next_frame().await,
            Inbound::Closed(CloseReason::Normal)
        ));
    }

    #[tokio::test]
    async fn test_oversized_write_leaves_stream_intact() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await.unwrap().unwrap()
        });

        let dialer = TcpFrameDialer::new(addr.to_string());
        let mut connection = dialer.dial().await.unwrap();

        let err = connection
            .sink
            .send_frame(vec![b'x'; ProtocolConfig::MAX_FRAME_SIZE + 1])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncwireError::Validation { .. }));
        assert!(!err.to_string().contains("Transport error"));

        // Nothing was written, so the next frame is the first one the peer sees.
        connection.sink.send_frame(b"after".to_vec()).await.unwrap();
        assert_eq!(server.await.unwrap(), b"after");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let dialer = TcpFrameDialer::new("127.0.0.1:1");
        assert!(matches!(
            dialer.dial().await,
            Err(SyncwireError::Transport { .. })
        ));
    }
}
