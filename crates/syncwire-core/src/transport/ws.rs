//! WebSocket connections.
//!
//! Outbound frames go out as text messages (binary if not valid UTF-8).
//! Pings and pongs are handled by tungstenite and never surface. Close
//! frames are mapped onto [`CloseReason`]; a stream that ends without a
//! close handshake reads as an abnormal closure (1006).

use super::{CloseReason, Connection, Dialer, FrameSink, FrameStream, Inbound};
use crate::error::{Result, SyncwireError};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};

/// Dials a `ws://` URL.
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: String,
}

impl WsDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<Connection> {
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncwireError::transport(format!("connect {}: {}", self.url, e)))?;
        Ok(ws_connection(ws))
    }

    fn peer(&self) -> String {
        self.url.clone()
    }
}

/// Wrap an established WebSocket stream.
pub fn ws_connection<S>(ws: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Connection {
        sink: Box::new(WsSink { inner: sink }),
        stream: Box::new(WsStream { inner: stream }),
    }
}

struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        let message = match String::from_utf8(frame) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.inner
            .send(message)
            .await
            .map_err(SyncwireError::transport)
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        };
        self.inner
            .send(Message::Close(Some(frame)))
            .await
            .map_err(SyncwireError::transport)
    }
}

struct WsStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Inbound {
        loop {
            let message = match self.inner.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return map_read_error(e),
                None => return Inbound::Closed(CloseReason::Abnormal),
            };

            match message {
                Message::Text(text) => return Inbound::Frame(text.into_bytes()),
                Message::Binary(data) => return Inbound::Frame(data),
                Message::Close(frame) => return Inbound::Closed(close_reason(frame)),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}

fn close_reason(frame: Option<CloseFrame<'static>>) -> CloseReason {
    match frame {
        Some(frame) => CloseReason::from_code(u16::from(frame.code), frame.reason.into_owned()),
        None => CloseReason::NoStatus,
    }
}

fn map_read_error(error: WsError) -> Inbound {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => Inbound::Closed(CloseReason::Normal),
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            Inbound::Closed(CloseReason::Abnormal)
        }
        WsError::Io(e)
            if matches!(
                e.kind(),
                ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
            ) =>
        {
            Inbound::Closed(CloseReason::Abnormal)
        }
        other => Inbound::Failed(SyncwireError::transport(other)),
    }
}
