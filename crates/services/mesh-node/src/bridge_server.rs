//! WebSocket server for the local application
//!
//! Two endpoints on one loopback listener: `/msg` carries control JSON in both
//! directions, `/` carries binary media frames. One client per endpoint; a new
//! client replaces the previous one. Outbound traffic while nobody is
//! attached is dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use meshcall_webrtc::{LocalBridge, MeshEvent};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const CLIENT_QUEUE: usize = 256;

/// Which bridge endpoint a client connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Control,
    Media,
}

impl Endpoint {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            "/msg" => Some(Endpoint::Control),
            "/" => Some(Endpoint::Media),
            _ => None,
        }
    }
}

/// Slot holding the currently attached client's outbound queue
struct Outlet {
    name: &'static str,
    client: Mutex<Option<mpsc::Sender<Message>>>,
}

impl Outlet {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            client: Mutex::new(None),
        }
    }

    fn attach(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        if self.client.lock().replace(tx).is_some() {
            info!(endpoint = self.name, "Replacing attached bridge client");
        }
        rx
    }

    fn send(&self, message: Message) {
        let client = self.client.lock().clone();
        match client {
            Some(tx) => {
                if let Err(e) = tx.try_send(message) {
                    debug!(endpoint = self.name, "Dropping outbound message: {}", e);
                }
            }
            None => debug!(endpoint = self.name, "No client attached, dropping outbound message"),
        }
    }
}

pub struct BridgeServer {
    listener: TcpListener,
    bridge: Arc<LocalBridge>,
    control: Outlet,
    media: Outlet,
}

impl BridgeServer {
    /// Bind an ephemeral loopback port
    pub async fn bind(bridge: LocalBridge) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Arc::new(Self {
            listener,
            bridge: Arc::new(bridge),
            control: Outlet::new("control"),
            media: Outlet::new("media"),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients and pump mesh output to them until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<MeshEvent>,
        mut media: mpsc::Receiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = this.handle_connection(stream, addr).await {
                                warn!(%addr, "Bridge connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Bridge listener failed: {}", e);
                        break;
                    }
                },
                Some(event) = events.recv() => match event.to_json() {
                    Ok(json) => self.control.send(Message::Text(json)),
                    Err(e) => warn!(event = event.name(), "Failed to encode event: {}", e),
                },
                Some(frame) = media.recv() => self.media.send(Message::Binary(frame.to_vec())),
                _ = shutdown.changed() => break,
            }
        }
        info!("Bridge server stopped");
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut path = String::new();
        let ws_stream = accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                path = request.uri().path().to_string();
                Ok(response)
            },
        )
        .await?;

        let Some(endpoint) = Endpoint::from_path(&path) else {
            warn!(%addr, "Closing bridge client on unknown path {}", path);
            return Ok(());
        };
        info!(%addr, ?endpoint, "Bridge client connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut outbound = match endpoint {
            Endpoint::Control => self.control.attach(),
            Endpoint::Media => self.media.attach(),
        };

        let forward_task = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    debug!("Bridge client send failed: {}", e);
                    break;
                }
            }
        });

        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(Message::Text(text)) if endpoint == Endpoint::Control => {
                    if let Err(e) = self.bridge.handle_control(&text).await {
                        warn!("Rejected control message: {}", e);
                    }
                }
                Ok(Message::Binary(data)) if endpoint == Endpoint::Media => {
                    if let Err(e) = self.bridge.forward_local_frame(Bytes::from(data)).await {
                        debug!("Dropped media frame: {}", e);
                    }
                }
                Ok(Message::Close(_)) => {
                    info!(%addr, "Bridge client closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%addr, "Bridge socket error: {}", e);
                    break;
                }
            }
        }

        forward_task.abort();
        Ok(())
    }
}
