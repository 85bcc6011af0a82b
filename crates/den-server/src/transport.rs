//! WebSocket listener.
//!
//! Accepts TCP connections, performs the websocket handshake while capturing
//! the request path and query string, and hands accepted connections to the
//! server through a channel.

use den_core::{DenError, DenResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// An accepted websocket connection plus its upgrade request metadata.
pub struct WsConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    pub path: String,
    pub params: HashMap<String, String>,
}

/// Display identity carried in the upgrade query string.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub username: String,
    pub name: String,
    pub avatar: String,
    pub os: String,
}

impl ClientIdentity {
    /// Build an identity from query parameters with the usual fallbacks:
    /// guests get an address-derived username, the display name falls back
    /// to the username, and the avatar to a deterministic generated one.
    pub fn from_params(params: &HashMap<String, String>, remote_addr: &SocketAddr) -> Self {
        let username = params
            .get("username")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("guest-{}", remote_addr.ip()));
        let name = params
            .get("name")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| username.clone());
        let avatar = params
            .get("avatar")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| {
                format!("https://api.dicebear.com/7.x/avataaars/svg?seed={username}")
            });
        let os = params
            .get("os")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| "linux".to_string());
        Self {
            username,
            name,
            avatar,
            os,
        }
    }
}

/// Start the listener; accepted connections arrive on the returned channel.
pub async fn start_listener(bind_addr: SocketAddr) -> DenResult<mpsc::Receiver<WsConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| DenError::Transport(format!("bind failed: {e}")))?;

    info!(addr = %bind_addr, "websocket listener started");

    let (tx, rx) = mpsc::channel::<WsConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut uri = None;
                        let callback =
                            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                                uri = Some(req.uri().clone());
                                Ok(resp)
                            };
                        match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                            Ok(ws_stream) => {
                                let (path, params) = match uri {
                                    Some(uri) => (
                                        uri.path().to_string(),
                                        parse_query(uri.query().unwrap_or("")),
                                    ),
                                    None => ("/".to_string(), HashMap::new()),
                                };
                                debug!(remote = %addr, path = %path, "websocket accepted");
                                let conn = WsConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    path,
                                    params,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "websocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

/// Parse a URL query string into a map, percent-decoding values.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        params.insert(percent_decode(key), percent_decode(value));
    }
    params
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
