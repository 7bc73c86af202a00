//! The client side of the noise handshake.
//!
//! Drives `Noise_XX` over the frame socket: client hello, server hello
//! (ephemeral, encrypted static, certificate), client finish (our static
//! and the client payload), then splits into the transport ciphers.

use bytes::Bytes;
use log::{debug, info};
use prost::Message as _;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::frame::{FrameSocket, SocketError};
use super::NoiseSocket;
use crate::crypto::{KeyPair, NoiseHandshake, Role};
use crate::proto::wa;
use crate::socket::frame::WA_HEADER;
use crate::store::AuthenticationCreds;

/// How long to wait for the server hello.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

fn key32(bytes: Option<Vec<u8>>, what: &str) -> Result<[u8; 32], SocketError> {
    bytes
        .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
        .ok_or_else(|| SocketError::HandshakeFailed(format!("bad {what} in server hello")))
}

/// The client payload for this connection: login when registered,
/// pairing registration otherwise.
fn build_client_payload(creds: &AuthenticationCreds, version: (u32, u32, u32)) -> wa::ClientPayload {
    if let Some(me) = &creds.me {
        let username = me.user.parse().unwrap_or(0);
        wa::login_client_payload(username, me.device as u32, version)
    } else {
        let mut payload = wa::login_client_payload(0, 0, version);
        payload.username = None;
        payload.passive = Some(true);
        payload.device_pairing_data = Some(wa::DevicePairingRegistrationData {
            e_regid: Some((creds.registration_id as u32).to_be_bytes().to_vec()),
            e_keytype: Some(vec![0x05]),
            e_ident: Some(creds.signed_identity_key.public_bytes().to_vec()),
            e_skey_id: Some(creds.signed_pre_key.key_id.to_be_bytes()[1..].to_vec()),
            e_skey_val: Some(creds.signed_pre_key.key_pair.public.to_vec()),
            e_skey_sig: Some(creds.signed_pre_key.signature.clone()),
        });
        payload
    }
}

/// Perform the handshake over an already-connected frame socket.
///
/// `frames_rx` must yield decoded frame payloads (as produced by
/// [`super::connect_websocket`]). On success the socket is `Open`.
pub async fn do_handshake(
    creds: &AuthenticationCreds,
    mut frame_socket: FrameSocket,
    frames_rx: &mut mpsc::Receiver<Bytes>,
    version: (u32, u32, u32),
) -> Result<NoiseSocket, SocketError> {
    let ephemeral = KeyPair::generate();
    let mut noise = NoiseHandshake::new(Role::Initiator, &WA_HEADER);

    // -> e
    noise.authenticate(&ephemeral.public);
    let client_hello = wa::HandshakeMessage {
        client_hello: Some(wa::ClientHello {
            ephemeral: Some(ephemeral.public.to_vec()),
        }),
        ..Default::default()
    };
    frame_socket.send_frame(&client_hello.encode_to_vec()).await?;
    debug!(target: "Socket/Handshake", "client hello sent");

    // <- e, ee, s, es
    let response = timeout(HANDSHAKE_TIMEOUT, frames_rx.recv())
        .await
        .map_err(|_| SocketError::HandshakeFailed("timed out waiting for server hello".to_string()))?
        .ok_or(SocketError::ConnectionClosed)?;
    let server_hello = wa::HandshakeMessage::decode(response.as_ref())
        .map_err(|e| SocketError::HandshakeFailed(format!("server hello decode: {e}")))?
        .server_hello
        .ok_or_else(|| SocketError::HandshakeFailed("missing server hello".to_string()))?;

    let server_ephemeral = key32(server_hello.ephemeral, "ephemeral")?;
    let static_ciphertext = server_hello
        .r#static
        .ok_or_else(|| SocketError::HandshakeFailed("missing server static".to_string()))?;
    let cert_ciphertext = server_hello
        .payload
        .ok_or_else(|| SocketError::HandshakeFailed("missing server payload".to_string()))?;

    noise.authenticate(&server_ephemeral);
    noise.mix_into_key(&ephemeral.dh(&server_ephemeral));

    let server_static = noise
        .decrypt(&static_ciphertext)
        .map_err(|e| SocketError::HandshakeFailed(e.to_string()))?;
    let server_static: [u8; 32] = server_static
        .as_slice()
        .try_into()
        .map_err(|_| SocketError::HandshakeFailed("server static has wrong size".to_string()))?;
    noise.mix_into_key(&ephemeral.dh(&server_static));

    let certificate = noise
        .decrypt(&cert_ciphertext)
        .map_err(|e| SocketError::HandshakeFailed(e.to_string()))?;
    debug!(target: "Socket/Handshake", "server certificate decrypted ({} bytes)", certificate.len());

    // -> s, se
    let static_encrypted = noise
        .encrypt(&creds.noise_key.public)
        .map_err(|e| SocketError::HandshakeFailed(e.to_string()))?;
    noise.mix_into_key(&creds.noise_key.dh(&server_ephemeral));

    let payload = build_client_payload(creds, version).encode_to_vec();
    let payload_encrypted = noise
        .encrypt(&payload)
        .map_err(|e| SocketError::HandshakeFailed(e.to_string()))?;

    let client_finish = wa::HandshakeMessage {
        client_finish: Some(wa::ClientFinish {
            r#static: Some(static_encrypted),
            payload: Some(payload_encrypted),
        }),
        ..Default::default()
    };
    frame_socket.send_frame(&client_finish.encode_to_vec()).await?;

    let (write_key, read_key) = noise.finish();
    info!(target: "Socket/Handshake", "noise handshake complete");

    Ok(NoiseSocket::new(frame_socket, write_key, read_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::FrameCipher;
    use crate::socket::frame::{FrameDecoder, FrameTransport};
    use crate::store::init_auth_creds;
    use async_trait::async_trait;

    struct ChannelTransport {
        tx: mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl FrameTransport for ChannelTransport {
        async fn send(&mut self, data: Bytes) -> Result<(), SocketError> {
            self.tx.send(data).map_err(|_| SocketError::ConnectionClosed)
        }
        async fn close(&mut self) {}
    }

    fn frame(payload: &[u8]) -> Bytes {
        let mut out = Vec::with_capacity(payload.len() + 3);
        out.push((payload.len() >> 16) as u8);
        out.push((payload.len() >> 8) as u8);
        out.push(payload.len() as u8);
        out.extend_from_slice(payload);
        Bytes::from(out)
    }

    /// In-process server: responder handshake plus one echoed app frame.
    async fn run_server(
        mut from_client: mpsc::UnboundedReceiver<Bytes>,
        to_client: mpsc::UnboundedSender<Bytes>,
    ) -> wa::ClientPayload {
        let server_static = KeyPair::generate();
        let server_ephemeral = KeyPair::generate();
        let mut decoder = FrameDecoder::default();

        // client hello (first chunk starts with the WA header)
        let chunk = from_client.recv().await.unwrap();
        assert_eq!(&chunk[..4], &WA_HEADER);
        decoder.push(&chunk[4..]);
        let hello_frame = decoder.next_frame().unwrap();
        let hello = wa::HandshakeMessage::decode(hello_frame.as_ref()).unwrap();
        let client_ephemeral: [u8; 32] = hello
            .client_hello
            .unwrap()
            .ephemeral
            .unwrap()
            .as_slice()
            .try_into()
            .unwrap();

        let mut noise = NoiseHandshake::new(Role::Responder, &WA_HEADER);
        noise.authenticate(&client_ephemeral);
        noise.authenticate(&server_ephemeral.public);
        noise.mix_into_key(&server_ephemeral.dh(&client_ephemeral));
        let static_ct = noise.encrypt(&server_static.public).unwrap();
        noise.mix_into_key(&server_static.dh(&client_ephemeral));
        let cert_ct = noise.encrypt(b"intermediate certificate chain").unwrap();

        let server_hello = wa::HandshakeMessage {
            server_hello: Some(wa::ServerHello {
                ephemeral: Some(server_ephemeral.public.to_vec()),
                r#static: Some(static_ct),
                payload: Some(cert_ct),
            }),
            ..Default::default()
        };
        to_client.send(frame(&server_hello.encode_to_vec())).unwrap();

        // client finish
        let chunk = from_client.recv().await.unwrap();
        decoder.push(&chunk);
        let finish_frame = decoder.next_frame().unwrap();
        let finish = wa::HandshakeMessage::decode(finish_frame.as_ref())
            .unwrap()
            .client_finish
            .unwrap();

        let client_static = noise.decrypt(&finish.r#static.unwrap()).unwrap();
        let client_static: [u8; 32] = client_static.as_slice().try_into().unwrap();
        noise.mix_into_key(&server_ephemeral.dh(&client_static));
        let payload_bytes = noise.decrypt(&finish.payload.unwrap()).unwrap();
        let payload = wa::ClientPayload::decode(payload_bytes.as_slice()).unwrap();

        let (write_key, read_key) = noise.finish();

        // one application echo round over the transport ciphers
        let mut rx_cipher = FrameCipher::new(read_key);
        let mut tx_cipher = FrameCipher::new(write_key);

        let chunk = from_client.recv().await.unwrap();
        decoder.push(&chunk);
        let app_frame = decoder.next_frame().unwrap();
        let plaintext = rx_cipher.decrypt_next(&app_frame).unwrap();

        let mut echo = b"echo: ".to_vec();
        echo.extend_from_slice(&plaintext);
        to_client.send(frame(&tx_cipher.encrypt_next(&echo).unwrap())).unwrap();

        payload
    }

    #[tokio::test]
    async fn test_full_handshake_against_in_process_server() {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, mut client_raw_rx) = mpsc::unbounded_channel();

        let server = tokio::spawn(run_server(server_rx, server_tx));

        // adapt raw server chunks into frame payloads for do_handshake
        let (frames_tx, mut frames_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::default();
            while let Some(chunk) = client_raw_rx.recv().await {
                decoder.push(&chunk);
                while let Some(frame) = decoder.next_frame() {
                    if frames_tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        });

        let mut creds = init_auth_creds();
        creds.me = Some("14155550000:3@s.whatsapp.net".parse().unwrap());

        let frame_socket = FrameSocket::new(Box::new(ChannelTransport { tx: client_tx }), None);
        let socket = do_handshake(&creds, frame_socket, &mut frames_rx, (2, 3000, 1))
            .await
            .unwrap();
        assert!(socket.is_open());

        // client -> server application frame, echoed back encrypted
        socket.send_frame(b"first stanza").await.unwrap();

        let payload = server.await.unwrap();
        assert_eq!(payload.username, Some(14155550000));
        assert_eq!(payload.device, Some(3));

        let echo = frames_rx.recv().await.unwrap();
        let plaintext = socket.decrypt_frame(&echo).await.unwrap();
        assert_eq!(plaintext, b"echo: first stanza");
    }
}
