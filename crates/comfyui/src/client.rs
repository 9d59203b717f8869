//! Server addressing and the event socket.
//!
//! One server address yields both base URLs. [`ComfyUIClient::connect`]
//! opens a socket scoped to a client id; the server routes execution
//! events for prompts queued under that id to it.

use std::time::Duration;

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Upper bound on the close handshake before the socket is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Default bound on opening the socket, TCP connect plus upgrade.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub type ComfyUIStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Addresses of one ComfyUI server and the means to open its socket.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    api_url: String,
    connect_timeout: Duration,
}

/// An open event socket. Dropping it drops the TCP stream without a
/// close frame; prefer [`close`](Self::close).
pub struct ComfyUIConnection {
    /// Id the socket was opened under.
    pub client_id: String,
    pub ws_stream: ComfyUIStream,
}

impl ComfyUIClient {
    /// Create a client from a server address such as
    /// `http://host:8188`, `https://host` or `host:8188`.
    ///
    /// The WebSocket URL uses `ws://` for plain HTTP and `wss://` for
    /// HTTPS. A trailing slash is ignored.
    pub fn new(server: &str) -> Self {
        let server = server.trim().trim_end_matches('/');
        let (api_url, ws_url) = if let Some(rest) = server.strip_prefix("https://") {
            (server.to_string(), format!("wss://{rest}"))
        } else if let Some(rest) = server.strip_prefix("http://") {
            (server.to_string(), format!("ws://{rest}"))
        } else {
            (format!("http://{server}"), format!("ws://{server}"))
        };
        Self {
            ws_url,
            api_url,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound the whole handshake; a server that accepts TCP but never
    /// answers the upgrade fails after this long.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `ws://` or `wss://` base.
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Open `/ws?clientId=<client_id>`, giving up after the connect
    /// timeout.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={client_id}", self.ws_url);
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ComfyUIClientError::Connection(format!(
                    "{}: no handshake within {:?}",
                    self.ws_url, self.connect_timeout
                ))
            })?
            .map_err(|e| ComfyUIClientError::Connection(format!("{}: {e}", self.ws_url)))?;

        tracing::info!(client_id = %client_id, ws_url = %self.ws_url, "Event socket open");

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

impl ComfyUIConnection {
    /// Send a close frame and release the socket.
    ///
    /// Errors are logged, not returned: the connection is gone either
    /// way once this returns.
    pub async fn close(mut self) {
        match tokio::time::timeout(CLOSE_GRACE, self.ws_stream.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(client_id = %self.client_id, error = %e, "Close handshake failed");
            }
            Err(_) => {
                tracing::debug!(client_id = %self.client_id, "Close handshake timed out");
            }
        }
        tracing::debug!(client_id = %self.client_id, "ComfyUI WebSocket released");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    #[error("could not open event socket at {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_address_maps_to_ws() {
        let client = ComfyUIClient::new("http://localhost:8188/");
        assert_eq!(client.api_url(), "http://localhost:8188");
        assert_eq!(client.ws_url(), "ws://localhost:8188");
    }

    #[test]
    fn https_address_maps_to_wss() {
        let client = ComfyUIClient::new("https://gpu.example.com");
        assert_eq!(client.api_url(), "https://gpu.example.com");
        assert_eq!(client.ws_url(), "wss://gpu.example.com");
    }

    #[test]
    fn bare_host_defaults_to_plain_schemes() {
        let client = ComfyUIClient::new("  10.0.0.5:8188 ");
        assert_eq!(client.api_url(), "http://10.0.0.5:8188");
        assert_eq!(client.ws_url(), "ws://10.0.0.5:8188");
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = ComfyUIClient::new(&format!("http://{addr}"))
            .with_connect_timeout(Duration::from_millis(200));
        let result = tokio::time::timeout(Duration::from_secs(5), client.connect("stalled"))
            .await
            .expect("connect should give up on its own");
        match result {
            Err(ComfyUIClientError::Connection(msg)) => assert!(msg.contains("no handshake")),
            Ok(_) => panic!("Expected Connection error, got an open socket"),
        }
        holder.abort();
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_connection_error() {
        let client = ComfyUIClient::new("http://127.0.0.1:9");
        let result = client.connect("test-client").await;
        assert!(matches!(result, Err(ComfyUIClientError::Connection(_))));
    }
}
