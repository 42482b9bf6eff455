//! Endpoint configuration and WebSocket event connection.
//!
//! [`EngineEndpoint`] holds the address of the engine's HTTP server.
//! Call [`EngineEndpoint::connect`] to open a live [`EventConnection`]
//! for a client session.

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Network location of the engine (`host:port`).
///
/// The same address serves HTTP, the WebSocket event channel, and the
/// TCP liveness probe.
#[derive(Debug, Clone)]
pub struct EngineEndpoint {
    address: String,
}

/// A live WebSocket event connection for one client session.
pub struct EventConnection {
    /// Session token the connection was opened with. Submissions must
    /// carry the same token for their events to arrive here.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl EngineEndpoint {
    /// * `address` - `host:port`, e.g. `127.0.0.1:8188`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// `host:port` of the engine.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// HTTP API base URL (e.g. `http://127.0.0.1:8188`).
    pub fn api_url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// WebSocket base URL (e.g. `ws://127.0.0.1:8188`).
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.address)
    }

    /// Open the event channel for `client_id`.
    pub async fn connect(&self, client_id: &str) -> Result<EventConnection, EngineConnectionError> {
        let url = format!("{}/ws?clientId={}", self.ws_url(), client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            EngineConnectionError::Connection(format!(
                "failed to connect to engine at {}: {e}",
                self.address
            ))
        })?;

        tracing::debug!(client_id = %client_id, address = %self.address, "Engine event channel open");

        Ok(EventConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

/// Errors that can occur on the event channel.
#[derive(Debug, thiserror::Error)]
pub enum EngineConnectionError {
    /// Failed to establish the WebSocket connection.
    #[error("connection error: {0}")]
    Connection(String),
}
