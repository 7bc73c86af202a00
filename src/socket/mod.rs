//! Noise transport over WebSocket.
//!
//! The socket walks `Connecting → Handshaking → Open → Closing → Closed`.
//! Application writes are only accepted in `Open`; any transport decrypt
//! failure is fatal and moves the socket to `Closing` with reason
//! `decrypt-failure`.

pub mod frame;
pub mod handshake;

pub use frame::{connect_websocket, endpoints, FrameSocket, FrameTransport, SocketError, WA_HEADER};
pub use handshake::do_handshake;

use crate::binary;
use crate::binary::Node;
use crate::crypto::FrameCipher;
use log::{info, warn};
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// Connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Handshaking,
    Open,
    Closing { reason: String },
    Closed,
}

/// The authenticated, AEAD-framed channel produced by the handshake.
pub struct NoiseSocket {
    frame: Mutex<FrameSocket>,
    write: Mutex<FrameCipher>,
    read: Mutex<FrameCipher>,
    state: StdMutex<SocketState>,
}

impl NoiseSocket {
    pub fn new(frame: FrameSocket, write_key: [u8; 32], read_key: [u8; 32]) -> Self {
        Self {
            frame: Mutex::new(frame),
            write: Mutex::new(FrameCipher::new(write_key)),
            read: Mutex::new(FrameCipher::new(read_key)),
            state: StdMutex::new(SocketState::Open),
        }
    }

    pub fn state(&self) -> SocketState {
        self.state.lock().expect("state lock").clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), SocketState::Open)
    }

    fn transition(&self, next: SocketState) {
        let mut state = self.state.lock().expect("state lock");
        info!(target: "Socket", "state {:?} -> {:?}", *state, next);
        *state = next;
    }

    /// Encrypt and send one application frame.
    pub async fn send_frame(&self, plaintext: &[u8]) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::NotOpen);
        }
        let encrypted = {
            let mut cipher = self.write.lock().await;
            cipher
                .encrypt_next(plaintext)
                .map_err(|_| SocketError::SendFailed("frame encryption failed".to_string()))?
        };
        self.frame.lock().await.send_frame(&encrypted).await
    }

    /// Decrypt one inbound frame.
    ///
    /// A failure here means the channel counters diverged; the socket is
    /// fatally closed.
    pub async fn decrypt_frame(&self, encrypted: &[u8]) -> Result<Vec<u8>, SocketError> {
        if !self.is_open() {
            return Err(SocketError::NotOpen);
        }
        let mut cipher = self.read.lock().await;
        match cipher.decrypt_next(encrypted) {
            Ok(plaintext) => Ok(plaintext),
            Err(_) => {
                warn!(target: "Socket", "frame decrypt failure, closing");
                self.transition(SocketState::Closing {
                    reason: "decrypt-failure".to_string(),
                });
                Err(SocketError::DecryptionFailed)
            }
        }
    }

    /// Graceful close: the opaque `<close/>` stanza, then the WebSocket.
    pub async fn close(&self) {
        if self.is_open() {
            self.transition(SocketState::Closing {
                reason: "intentional".to_string(),
            });
            let payload = binary::marshal(&Node::new("close"));
            if let Ok(encrypted) = self.write.lock().await.encrypt_next(&payload) {
                let _ = self.frame.lock().await.send_frame(&encrypted).await;
            }
        }
        self.frame.lock().await.close().await;
        self.transition(SocketState::Closed);
    }

    /// Ungraceful teardown after a transport error.
    pub fn mark_closed(&self) {
        self.transition(SocketState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::frame::FrameDecoder;
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;

    struct ChannelTransport {
        tx: tokio::sync::mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl frame::FrameTransport for ChannelTransport {
        async fn send(&mut self, data: Bytes) -> Result<(), SocketError> {
            self.tx.send(data).map_err(|_| SocketError::ConnectionClosed)
        }
        async fn close(&mut self) {}
    }

    fn socket_pair() -> (NoiseSocket, NoiseSocket, tokio::sync::mpsc::UnboundedReceiver<Bytes>, tokio::sync::mpsc::UnboundedReceiver<Bytes>) {
        let key_a = [0x0a; 32];
        let key_b = [0x0b; 32];
        let (tx_ab, rx_ab) = tokio::sync::mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = tokio::sync::mpsc::unbounded_channel();

        let left = NoiseSocket::new(
            FrameSocket::new(Box::new(ChannelTransport { tx: tx_ab }), None),
            key_a,
            key_b,
        );
        let right = NoiseSocket::new(
            FrameSocket::new(Box::new(ChannelTransport { tx: tx_ba }), None),
            key_b,
            key_a,
        );
        (left, right, rx_ab, rx_ba)
    }

    /// One transport chunk per send; the first carries the WA header.
    async fn next_payload(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<Bytes>,
        first: bool,
    ) -> Bytes {
        let chunk = rx.recv().await.expect("channel open");
        let body = if first {
            assert_eq!(&chunk[..4], &WA_HEADER);
            chunk.slice(4..)
        } else {
            chunk
        };
        let mut decoder = FrameDecoder::default();
        decoder.push(&body);
        decoder.next_frame().expect("complete frame")
    }

    #[tokio::test]
    async fn test_frames_roundtrip_with_increasing_counters() {
        let (left, right, mut rx_ab, _rx_ba) = socket_pair();

        for i in 0..4 {
            let payload = format!("stanza {i}");
            left.send_frame(payload.as_bytes()).await.unwrap();
            let frame = next_payload(&mut rx_ab, i == 0).await;
            let plaintext = right.decrypt_frame(&frame).await.unwrap();
            assert_eq!(plaintext, payload.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_decrypt_failure_is_fatal() {
        let (left, right, mut rx_ab, _rx_ba) = socket_pair();

        left.send_frame(b"ok").await.unwrap();
        let mut frame = next_payload(&mut rx_ab, true).await.to_vec();
        frame[0] ^= 0xFF;

        assert!(matches!(
            right.decrypt_frame(&frame).await,
            Err(SocketError::DecryptionFailed)
        ));
        assert!(matches!(right.state(), SocketState::Closing { reason } if reason == "decrypt-failure"));

        // writes are rejected after the fatal transition
        assert!(matches!(right.send_frame(b"x").await, Err(SocketError::NotOpen)));
    }

    #[tokio::test]
    async fn test_close_sends_close_stanza() {
        let (left, _right, mut rx_ab, _rx_ba) = socket_pair();

        left.send_frame(b"warmup").await.unwrap();
        let _ = next_payload(&mut rx_ab, true).await;

        let left = Arc::new(left);
        left.close().await;
        assert_eq!(left.state(), SocketState::Closed);

        // one more encrypted frame went out: the <close/> stanza
        let frame = next_payload(&mut rx_ab, false).await;
        assert!(!frame.is_empty());
    }
}
