//! WebSocket edge
//!
//! Accepts charging station connections, negotiates the OCPP subprotocol and
//! feeds received frames to the [`MessageRouter`]. Each connection gets a
//! writer task draining an mpsc queue, so the router can deliver frames to a
//! station without touching its socket.
//!
//! Stations connect to `ws://host:port/<prefix>/<stationId>`; the last path
//! segment is the station id.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use csms_core::{Identifier, OcppVersion};
use csms_dispatch::{MessageRouter, StationNetwork};

/// Pick the first subprotocol in the client's list that we speak
pub fn negotiate(offered: &str) -> Option<OcppVersion> {
    offered
        .split(',')
        .map(str::trim)
        .find_map(|candidate| candidate.parse::<OcppVersion>().ok())
}

/// Station id from the request path
pub fn station_id_from_path(path: &str) -> Option<String> {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Outbound queues of the stations connected to this node
#[derive(Default)]
pub struct Connections {
    stations: RwLock<HashMap<Identifier, mpsc::UnboundedSender<String>>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, identifier: Identifier, tx: mpsc::UnboundedSender<String>) {
        if self.stations.write().insert(identifier.clone(), tx).is_some() {
            warn!("{} reconnected, replacing previous connection", identifier);
        }
    }

    /// Remove the entry only if it still belongs to `tx`
    fn remove(&self, identifier: &Identifier, tx: &mpsc::UnboundedSender<String>) -> bool {
        let mut stations = self.stations.write();
        if stations.get(identifier).is_some_and(|current| current.same_channel(tx)) {
            stations.remove(identifier);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl StationNetwork for Connections {
    async fn send_to_station(&self, identifier: &Identifier, text: String) -> bool {
        let tx = self.stations.read().get(identifier).cloned();
        match tx {
            Some(tx) => tx.send(text).is_ok(),
            None => {
                debug!("{} is not connected to this node", identifier);
                false
            }
        }
    }
}

pub struct Edge {
    tenant_id: String,
    router: Arc<MessageRouter>,
    connections: Arc<Connections>,
}

impl Edge {
    pub fn new(tenant_id: impl Into<String>, router: Arc<MessageRouter>, connections: Arc<Connections>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            router,
            connections,
        }
    }

    /// Accept stations until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!("Accepting stations on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let edge = self.clone();
            tokio::spawn(async move {
                edge.handle_connection(stream, peer).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let mut station_id = None;
        let mut protocol = None;

        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let Some(id) = station_id_from_path(request.uri().path()) else {
                return Err(reject(StatusCode::NOT_FOUND, "missing station id"));
            };
            let offered = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let Some(version) = negotiate(offered) else {
                return Err(reject(StatusCode::BAD_REQUEST, "no supported OCPP subprotocol"));
            };
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(version.as_str()));
            station_id = Some(id);
            protocol = Some(version);
            Ok(response)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Handshake with {} failed: {}", peer, e);
                return;
            }
        };
        let (Some(station_id), Some(protocol)) = (station_id, protocol) else {
            return;
        };
        let identifier = Identifier::new(self.tenant_id.clone(), station_id);
        info!("{} connected from {} using {}", identifier, peer, protocol);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.connections.insert(identifier.clone(), tx.clone());
        self.router.register_connection(&identifier, protocol).await;

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                debug!("Sending: {}", text);
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    self.router
                        .on_message(&identifier, text.as_str(), Utc::now(), protocol.as_str())
                        .await;
                }
                Ok(WsMessage::Binary(_)) => {
                    warn!("{} sent a binary frame, ignoring", identifier);
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("Connection error from {}: {}", identifier, e);
                    break;
                }
            }
        }

        // Only the connection that still owns the entry tears down shared state.
        if self.connections.remove(&identifier, &tx) {
            self.router.deregister_connection(&identifier).await;
        }
        writer.abort();
        info!("{} disconnected", identifier);
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
