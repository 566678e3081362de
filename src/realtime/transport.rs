//! Realtime transport: duplex, message-oriented connection to the backend

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::events::Envelope;
use crate::error::SyncError;

/// Auth material attached when opening a connection.
#[derive(Debug, Clone)]
pub struct TransportAuth {
    pub token: String,
    pub client_id: String,
}

/// A frame that matters to the connection manager. Transport-internal
/// traffic (pings, handshake confirmations) never surfaces here.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Event(Envelope),
    Ack {
        id: u64,
        result: Result<serde_json::Value, SyncError>,
    },
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn open(&self, auth: &TransportAuth)
        -> Result<Box<dyn TransportConnection>, SyncError>;
}

#[async_trait]
pub trait TransportConnection: Send {
    /// Next frame; `Ok(None)` when the peer closed the connection.
    async fn recv(&mut self) -> Result<Option<InboundFrame>, SyncError>;

    async fn send(&mut self, envelope: &Envelope) -> Result<(), SyncError>;

    /// Swap the credential on the live connection.
    async fn update_auth(&mut self, token: &str) -> Result<(), SyncError>;

    async fn close(&mut self);
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket transport speaking JSON envelopes.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> SyncError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::Http(resp) if resp.status().as_u16() == 401 => {
            SyncError::Unauthorized("realtime handshake rejected".to_string())
        }
        Error::Http(resp) => SyncError::Unreachable(format!(
            "realtime handshake failed with HTTP {}",
            resp.status()
        )),
        other => SyncError::Unreachable(other.to_string()),
    }
}

fn auth_frame(token: &str, client_id: Option<&str>) -> Envelope {
    let mut data = json!({ "token": token });
    if let Some(id) = client_id {
        data["clientId"] = json!(id);
    }
    Envelope::new("authenticate", data)
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    /// Connect and authenticate. The token goes both in the upgrade request's
    /// `Authorization` header and in an `authenticate` frame, since some
    /// proxies strip headers from upgrade requests.
    async fn open(
        &self,
        auth: &TransportAuth,
    ) -> Result<Box<dyn TransportConnection>, SyncError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Validation(format!("bad realtime URL: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", auth.token))
            .map_err(|e| SyncError::Validation(format!("token is not a valid header: {}", e)))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        tracing::info!("Connecting WebSocket to {}", self.url);

        let (stream, response) = connect_async(request).await.map_err(ws_error)?;

        tracing::info!("WebSocket connected (status={})", response.status());

        let mut conn = WsConnection { stream };
        conn.send(&auth_frame(&auth.token, Some(&auth.client_id)))
            .await?;
        Ok(Box::new(conn))
    }
}

pub struct WsConnection {
    stream: WsStream,
}

#[async_trait]
impl TransportConnection for WsConnection {
    async fn recv(&mut self) -> Result<Option<InboundFrame>, SyncError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {} bytes", text.len());
                    match parse_frame(&text) {
                        Ok(Some(frame)) => return Ok(Some(frame)),
                        Ok(None) => continue,
                        Err(SyncError::Protocol(e)) => {
                            tracing::warn!("Dropping malformed realtime frame: {}", e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(ws_error)?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => return Err(ws_error(e)),
                None => return Ok(None),
            }
        }
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), SyncError> {
        let text = serde_json::to_string(envelope)?;
        tracing::debug!("WS send: {}", envelope.event_type);
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(ws_error)
    }

    async fn update_auth(&mut self, token: &str) -> Result<(), SyncError> {
        self.send(&auth_frame(token, None)).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close failed: {}", e);
        }
    }
}

/// Classify one text frame. `Ok(None)` for transport-internal frames.
fn parse_frame(text: &str) -> Result<Option<InboundFrame>, SyncError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| SyncError::Protocol(format!("bad realtime frame: {}", e)))?;

    match envelope.event_type.as_str() {
        "ack" => {
            let id = envelope
                .ack_id
                .ok_or_else(|| SyncError::Protocol("ack frame without ackId".to_string()))?;
            let result = match envelope.data.get("error").and_then(|e| e.as_str()) {
                Some(err) => Err(SyncError::Validation(err.to_string())),
                None => Ok(envelope.data),
            };
            Ok(Some(InboundFrame::Ack { id, result }))
        }
        "unauthorized" | "auth_error" => Err(SyncError::Unauthorized(
            envelope
                .data
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("realtime authentication rejected")
                .to_string(),
        )),
        "connected" | "authenticated" | "pong" => {
            tracing::debug!("Realtime {}", envelope.event_type);
            Ok(None)
        }
        _ => Ok(Some(InboundFrame::Event(envelope))),
    }
}
