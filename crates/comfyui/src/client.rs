//! WebSocket side of the ComfyUI protocol.
//!
//! ComfyUI pushes execution events to the WebSocket session whose
//! `clientId` matches the `client_id` of the submission. Every
//! [`ComfyUIClient::connect`] call opens a brand-new session, so events
//! from earlier executions never leak into a later one.

use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// The raw WebSocket stream of one session.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Endpoints of one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    api_url: String,
}

/// An open event session.
pub struct ComfyUIConnection {
    /// Session id; submissions made with it report on this socket.
    pub client_id: String,
    pub ws_stream: WsStream,
}

impl std::fmt::Debug for ComfyUIConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComfyUIConnection")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Errors from opening an event session.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    #[error("Failed to connect to {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: Box<WsError>,
    },
}

impl ComfyUIClient {
    /// `ws_url` like `ws://host:8188`, `api_url` like `http://host:8188`.
    pub fn new(ws_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_url: api_url.into(),
        }
    }

    /// Plain-text endpoints for a bare `host:port`.
    pub fn from_address(address: &str) -> Self {
        Self::new(format!("ws://{address}"), format!("http://{address}"))
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Open a new session under a fresh UUID v4 client id.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = self.session_url(&client_id);

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            ComfyUIClientError::Connection {
                url: url.clone(),
                source: Box::new(e),
            }
        })?;

        tracing::debug!(client_id = %client_id, url = %url, "Event session opened");
        Ok(ComfyUIConnection {
            client_id,
            ws_stream,
        })
    }

    fn session_url(&self, client_id: &str) -> String {
        format!("{}/ws?clientId={client_id}", self.ws_url)
    }
}
