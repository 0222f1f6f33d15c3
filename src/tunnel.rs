//! WebSocket tunnel presenting a byte-duplex transport (spec §4.2).
//!
//! Grounded on the teacher's (unbuilt) `src/sandbox/ttyd.rs`, which dials a
//! WebSocket and treats inbound/outbound binary frames as a byte stream for
//! a terminal session. Here the same idea is generalised into a reusable
//! `AsyncRead + AsyncWrite` object so an SSH client (C3) can be pointed at
//! it without knowing the "network" underneath is a WebSocket.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

const BRIDGE_BUF_SIZE: usize = 64 * 1024;

/// A live WebSocket connection bridged to a plain duplex byte stream.
///
/// `write`/`close` operate on the tunnel itself; `create_connection` hands
/// out the duplex endpoint that a consumer (C3's SSH client) reads and
/// writes like any other socket. `host`/`port` passed to
/// `create_connection` are cosmetic — the WebSocket dial already happened
/// in `dial`.
pub struct WsTunnel {
    io: Option<DuplexStream>,
    outbound: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    bridge: tokio::task::JoinHandle<()>,
    closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl WsTunnel {
    /// Dial `ws://host:port/ssh` (or any fully-formed `ws(s)://` URL),
    /// optionally sending `Authorization: Bearer <token>`.
    pub async fn dial(url: &str, auth_token: Option<&str>) -> std::io::Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        if let Some(token) = auth_token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| std::io::Error::other("invalid auth token header value"))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| std::io::Error::other(format!("websocket connect failed: {e}")))?;

        let (mut ws_sink, mut ws_stream) = ws.split();
        let (near, far) = tokio::io::duplex(BRIDGE_BUF_SIZE);
        let (mut near_read, mut near_write) = tokio::io::split(near);

        let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        // Bridges two directions: WebSocket frames -> `near_write` (so the
        // consumer holding `far` can read them), and bytes read back from
        // `near_read` (written by the consumer) -> outbound WebSocket frames.
        let bridge = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            use tokio::io::AsyncWriteExt;

            let mut inbound_buf = [0u8; BRIDGE_BUF_SIZE];
            loop {
                tokio::select! {
                    frame = ws_stream.next() => {
                        match frame {
                            Some(Ok(Message::Binary(data))) => {
                                if near_write.write_all(&data).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Text(text))) => {
                                if near_write.write_all(text.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::debug!(error = %e, "websocket tunnel read error");
                                break;
                            }
                        }
                    }
                    outgoing = outbound_rx.recv() => {
                        match outgoing {
                            Some(bytes) => {
                                if ws_sink.send(Message::Binary(bytes.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    n = near_read.read(&mut inbound_buf) => {
                        match n {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if ws_sink.send(Message::Binary(inbound_buf[..n].to_vec().into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            let _ = ws_sink.close().await;
            tracing::debug!("websocket tunnel bridge loop exited");
        });

        Ok(Self { io: Some(far), outbound: outbound_tx, bridge, closed })
    }

    /// Hand out the duplex endpoint. `host`/`port` are cosmetic labels
    /// consumed by C3 purely to keep its "dial host:port" code unchanged;
    /// this tunnel is already connected.
    pub fn create_connection(
        &mut self,
        _host: &str,
        _port: u16,
    ) -> std::io::Result<impl AsyncRead + AsyncWrite + Unpin + Send + 'static> {
        self.io
            .take()
            .ok_or_else(|| std::io::Error::other("tunnel connection already taken"))
    }

    /// Non-blocking enqueue of raw bytes as a single binary frame.
    pub fn write(&self, bytes: Vec<u8>) -> std::io::Result<()> {
        self.outbound
            .send(bytes)
            .map_err(|_| std::io::Error::other("tunnel closed"))
    }

    /// Idempotent close.
    pub fn close(&self) {
        if !self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            self.bridge.abort();
        }
    }
}

impl Drop for WsTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent() {
        // Constructing a real tunnel requires a live server; exercise the
        // idempotency guard directly against the atomic flag semantics.
        let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let first = !closed.swap(true, std::sync::atomic::Ordering::SeqCst);
        let second = !closed.swap(true, std::sync::atomic::Ordering::SeqCst);
        assert!(first);
        assert!(!second);
    }
}
