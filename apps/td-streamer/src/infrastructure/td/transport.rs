//! Transports
//!
//! [`Connector`]/[`Transport`] adapters:
//!
//! - [`WebSocketConnector`]: `tokio-tungstenite` over rustls.
//! - [`LoopbackConnector`]: in-process channel pair. The matching
//!   [`LoopbackServer`] accepts each connection as a [`LoopbackPeer`] that
//!   plays the streamer side, which is how the session is exercised in
//!   tests without a network.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{Connector, Transport, TransportError};
use crate::infrastructure::td::codec::JsonCodec;
use crate::infrastructure::td::messages::{
    DataEntry, InboundFrame, NotifyEntry, RequestEnvelope, ResponseContent, ResponseEntry,
};

// =============================================================================
// WebSocket
// =============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        tracing::info!(url, "Opening WebSocket");
        let (ws_stream, _response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| TransportError::Connect {
                    message: e.to_string(),
                })?;
        let (write, read) = ws_stream.split();
        Ok(Box::new(WebSocketTransport { write, read }))
    }
}

/// An open WebSocket connection.
pub struct WebSocketTransport {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

fn io_error(e: &tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::Io {
        message: e.to_string(),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| io_error(&e))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes.to_vec()).map_err(|e| {
                        TransportError::Io {
                            message: e.to_string(),
                        }
                    }));
                }
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.write.send(Message::Pong(data)).await {
                        return Some(Err(io_error(&e)));
                    }
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "WebSocket closed by server");
                    return None;
                }
                Ok(Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(io_error(&e))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
        let _ = self.write.close().await;
    }
}

// =============================================================================
// Loopback
// =============================================================================

#[derive(Debug)]
struct LoopbackShared {
    accept_tx: mpsc::UnboundedSender<LoopbackPeer>,
    failures: AtomicU32,
    connects: AtomicU32,
}

/// Create a connected loopback connector/server pair.
#[must_use]
pub fn loopback() -> (LoopbackConnector, LoopbackServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(LoopbackShared {
        accept_tx,
        failures: AtomicU32::new(0),
        connects: AtomicU32::new(0),
    });
    (
        LoopbackConnector {
            shared: Arc::clone(&shared),
        },
        LoopbackServer { accept_rx, shared },
    )
}

/// Client side of the loopback.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    shared: Arc<LoopbackShared>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .shared
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::Connect {
                message: "connection refused".to_string(),
            });
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let peer = LoopbackPeer {
            from_client: server_rx,
            to_client: Some(server_tx),
            buffered: VecDeque::new(),
            codec: JsonCodec::new(),
        };
        self.shared
            .accept_tx
            .send(peer)
            .map_err(|_| TransportError::Connect {
                message: "no loopback listener".to_string(),
            })?;

        Ok(Box::new(LoopbackTransport {
            to_server: Some(client_tx),
            from_server: client_rx,
        }))
    }
}

/// Client transport of one loopback connection.
#[derive(Debug)]
pub struct LoopbackTransport {
    to_server: Option<mpsc::UnboundedSender<String>>,
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.to_server
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(text)
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.to_server = None;
        self.from_server.close();
    }
}

/// Server side of the loopback.
#[derive(Debug)]
pub struct LoopbackServer {
    accept_rx: mpsc::UnboundedReceiver<LoopbackPeer>,
    shared: Arc<LoopbackShared>,
}

impl LoopbackServer {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.accept_rx.recv().await
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next(&self, count: u32) {
        self.shared.failures.store(count, Ordering::SeqCst);
    }

    /// Connection attempts made so far, including refused ones.
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

/// Streamer side of one loopback connection.
#[derive(Debug)]
pub struct LoopbackPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<String>>,
    buffered: VecDeque<RequestEnvelope>,
    codec: JsonCodec,
}

impl LoopbackPeer {
    /// Next request sent by the client. `None` once the client has closed.
    pub async fn recv_request(&mut self) -> Option<RequestEnvelope> {
        loop {
            if let Some(request) = self.buffered.pop_front() {
                return Some(request);
            }
            let text = self.from_client.recv().await?;
            match self.codec.decode_requests(&text) {
                Ok(requests) => self.buffered.extend(requests),
                Err(e) => tracing::warn!(error = %e, "Loopback peer got unparseable request"),
            }
        }
    }

    /// Send raw text to the client.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.send(text.into()).is_ok())
    }

    /// Send a frame to the client.
    pub fn send_frame(&self, frame: &InboundFrame) -> bool {
        self.codec
            .encode_frame(frame)
            .is_ok_and(|text| self.send_raw(text))
    }

    /// Answer a request with `code` and `msg`.
    pub fn respond(&self, request: &RequestEnvelope, code: i64, msg: &str) -> bool {
        self.send_frame(&InboundFrame {
            response: vec![ResponseEntry {
                service: request.service.clone(),
                command: request.command.clone(),
                request_id: Value::String(request.request_id.clone()),
                timestamp: None,
                content: ResponseContent {
                    code,
                    msg: msg.to_string(),
                },
            }],
            ..InboundFrame::default()
        })
    }

    /// Send data for `service`; each entry is a key and its numbered slots.
    pub fn send_data(&self, service: &str, entries: &[(&str, Vec<(usize, Value)>)]) -> bool {
        let content = entries
            .iter()
            .map(|(key, slots)| {
                let mut object = Map::new();
                object.insert("key".to_string(), Value::String((*key).to_string()));
                for (slot, value) in slots {
                    object.insert(slot.to_string(), value.clone());
                }
                Value::Object(object)
            })
            .collect();

        self.send_frame(&InboundFrame {
            data: vec![DataEntry {
                service: service.to_string(),
                timestamp: Some(chrono::Utc::now().timestamp_millis()),
                command: Some("SUBS".to_string()),
                content,
            }],
            ..InboundFrame::default()
        })
    }

    /// Send a heartbeat notice.
    pub fn send_heartbeat(&self) -> bool {
        self.send_frame(&InboundFrame {
            notify: vec![NotifyEntry {
                heartbeat: Some(chrono::Utc::now().timestamp_millis().to_string()),
                service: None,
                content: None,
            }],
            ..InboundFrame::default()
        })
    }

    /// Drop the connection from the server side.
    pub fn close(&mut self) {
        self.to_client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn loopback_carries_requests_and_frames() {
        let (connector, mut server) = loopback();
        let mut transport = connector.connect("loopback").await.unwrap();
        let mut peer = server.accept().await.unwrap();

        transport
            .send(r#"{"requests":[{"service":"ADMIN","command":"LOGIN","requestid":"0","account":"1","source":"app","parameters":{}}]}"#.to_string())
            .await
            .unwrap();
        let request = peer.recv_request().await.unwrap();
        assert_eq!(request.command, "LOGIN");

        assert!(peer.respond(&request, 0, "ok"));
        let text = transport.recv().await.unwrap().unwrap();
        let frame = JsonCodec::new().decode_frame(&text).unwrap();
        assert_eq!(frame.response[0].id(), Some(0));

        assert!(peer.send_data("QUOTE", &[("AAPL", vec![(0, json!("1.5"))])]));
        let text = transport.recv().await.unwrap().unwrap();
        assert!(text.contains("\"AAPL\""));
    }

    #[tokio::test]
    async fn server_close_ends_client_stream() {
        let (connector, mut server) = loopback();
        let mut transport = connector.connect("loopback").await.unwrap();
        let mut peer = server.accept().await.unwrap();

        peer.close();
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn client_close_ends_peer_stream() {
        let (connector, mut server) = loopback();
        let mut transport = connector.connect("loopback").await.unwrap();
        let mut peer = server.accept().await.unwrap();

        transport.close().await;
        assert!(peer.recv_request().await.is_none());
        assert!(transport.send("x".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn fail_next_refuses_connections() {
        let (connector, server) = loopback();
        server.fail_next(2);

        assert!(connector.connect("loopback").await.is_err());
        assert!(connector.connect("loopback").await.is_err());
        assert!(connector.connect("loopback").await.is_ok());
        assert_eq!(server.connect_count(), 3);
    }
}
