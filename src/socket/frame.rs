//! Length-prefixed framing under the noise channel.
//!
//! Every noise message travels behind a 3-byte big-endian length. The
//! very first client frame is prefixed with any routing info from creds
//! (verbatim) and the `WA` magic header; inbound WebSocket messages are
//! reassembled into frames regardless of how the server batches them.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// WhatsApp WebSocket endpoints.
pub mod endpoints {
    pub const MAIN: &str = "wss://web.whatsapp.com/ws/chat";
    pub const FALLBACK: &str = "wss://w1.web.whatsapp.com/ws/chat";
    pub const ORIGIN: &str = "https://web.whatsapp.com";
}

/// Connection header: 'W', 'A', magic, dictionary version.
pub const WA_HEADER: [u8; 4] = [b'W', b'A', 6, 3];

/// Largest frame the 3-byte length can carry.
pub const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

/// Socket errors.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("transport decryption failed")]
    DecryptionFailed,
    #[error("socket is not open")]
    NotOpen,
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<SocketError> for crate::error::WireError {
    fn from(err: SocketError) -> Self {
        match err {
            SocketError::DecryptionFailed => crate::error::WireError::DecryptFailure,
            SocketError::HandshakeFailed(e) => crate::error::WireError::HandshakeFailure(e),
            SocketError::FrameTooLarge(n) => {
                crate::error::WireError::MalformedFrame(format!("frame too large ({n} bytes)"))
            }
            _ => crate::error::WireError::ConnectionClosed,
        }
    }
}

/// Raw byte transport under the framing layer.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send(&mut self, data: Bytes) -> Result<(), SocketError>;
    async fn close(&mut self);
}

/// Framing layer over a transport.
pub struct FrameSocket {
    transport: Box<dyn FrameTransport>,
    routing_info: Option<Vec<u8>>,
    sent_first: bool,
}

impl FrameSocket {
    pub fn new(transport: Box<dyn FrameTransport>, routing_info: Option<Vec<u8>>) -> Self {
        Self {
            transport,
            routing_info,
            sent_first: false,
        }
    }

    /// Send one frame: optional first-frame prefix, 3-byte length, payload.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), SocketError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(SocketError::FrameTooLarge(payload.len()));
        }

        let mut frame = Vec::with_capacity(payload.len() + 16);
        if !self.sent_first {
            self.sent_first = true;
            if let Some(routing) = &self.routing_info {
                frame.extend_from_slice(routing);
            }
            frame.extend_from_slice(&WA_HEADER);
        }
        frame.push((payload.len() >> 16) as u8);
        frame.push((payload.len() >> 8) as u8);
        frame.push(payload.len() as u8);
        frame.extend_from_slice(payload);

        self.transport.send(Bytes::from(frame)).await
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

/// Splits a byte stream back into length-prefixed frames.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete frame payload, if any.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() < 3 {
            return None;
        }
        let len = ((self.buffer[0] as usize) << 16)
            | ((self.buffer[1] as usize) << 8)
            | (self.buffer[2] as usize);
        if self.buffer.len() < 3 + len {
            return None;
        }
        let _ = self.buffer.split_to(3);
        Some(self.buffer.split_to(len).freeze())
    }
}

/// WebSocket-backed transport.
pub struct WebSocketTransport {
    sink: futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
}

#[async_trait]
impl FrameTransport for WebSocketTransport {
    async fn send(&mut self, data: Bytes) -> Result<(), SocketError> {
        self.sink
            .send(Message::Binary(data.to_vec().into()))
            .await
            .map_err(|e| SocketError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

/// Connect the WebSocket, spawning a reader that reassembles frames into
/// the returned channel. The channel closing signals disconnection.
pub async fn connect_websocket(
    url: &str,
) -> Result<(WebSocketTransport, mpsc::Receiver<Bytes>), SocketError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SocketError::ConnectionFailed(e.to_string()))?;
    request.headers_mut().insert(
        "Origin",
        endpoints::ORIGIN
            .parse()
            .map_err(|_| SocketError::ConnectionFailed("bad origin header".to_string()))?,
    );

    let (ws, _response) = connect_async(request)
        .await
        .map_err(|e| SocketError::ConnectionFailed(e.to_string()))?;
    let (sink, mut stream) = ws.split();

    let (frames_tx, frames_rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::default();
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    decoder.push(&data);
                    while let Some(frame) = decoder.next_frame() {
                        if frames_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!(target: "Socket", "server closed websocket: {frame:?}");
                    return;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(other) => {
                    warn!(target: "Socket", "ignoring non-binary websocket message: {other:?}");
                }
                Err(e) => {
                    warn!(target: "Socket", "websocket read error: {e}");
                    return;
                }
            }
        }
    });

    Ok((WebSocketTransport { sink }, frames_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Transport that records everything sent.
    pub(crate) struct RecordingTransport {
        pub sent: Arc<Mutex<Vec<Bytes>>>,
    }

    #[async_trait]
    impl FrameTransport for RecordingTransport {
        async fn send(&mut self, data: Bytes) -> Result<(), SocketError> {
            self.sent.lock().unwrap().push(data);
            Ok(())
        }
        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn test_first_frame_carries_header_and_routing() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = RecordingTransport { sent: sent.clone() };
        let mut socket = FrameSocket::new(Box::new(transport), Some(vec![0xED, 0x00, 0x01]));

        socket.send_frame(b"abc").await.unwrap();
        socket.send_frame(b"defg").await.unwrap();

        let sent = sent.lock().unwrap();
        // routing info verbatim, then WA header, then 3-byte length
        assert_eq!(&sent[0][..3], &[0xED, 0x00, 0x01]);
        assert_eq!(&sent[0][3..7], &WA_HEADER);
        assert_eq!(&sent[0][7..10], &[0, 0, 3]);
        assert_eq!(&sent[0][10..], b"abc");
        // subsequent frames are bare
        assert_eq!(&sent[1][..3], &[0, 0, 4]);
        assert_eq!(&sent[1][3..], b"defg");
    }

    #[test]
    fn test_decoder_reassembles_split_frames() {
        let mut decoder = FrameDecoder::default();
        let mut wire = Vec::new();
        for payload in [b"first".as_slice(), b"second!".as_slice()] {
            wire.push(0);
            wire.push(0);
            wire.push(payload.len() as u8);
            wire.extend_from_slice(payload);
        }

        // feed one byte at a time
        let mut frames = Vec::new();
        for byte in wire {
            decoder.push(&[byte]);
            while let Some(frame) = decoder.next_frame() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"first");
        assert_eq!(&frames[1][..], b"second!");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = RecordingTransport { sent };
        let mut socket = FrameSocket::new(Box::new(transport), None);
        let huge = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            socket.send_frame(&huge).await,
            Err(SocketError::FrameTooLarge(_))
        ));
    }
}
